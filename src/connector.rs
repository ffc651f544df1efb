use std::{
    collections::HashSet,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpSocket,
};
use url::{Host, Url};

use crate::{
    handshake::{ClientHandshake, HandshakeState},
    proxy::{select_route, EnvProxyResolver, ProxyResolver},
    stream::MaybeTlsStream,
    tls::TlsSettings,
    transport::{PrepareHook, TcpTransport, Transport},
    ClientConfig, Connection, Result, WebSocketError,
};

/// Size of the buffer used to read the handshake response.
const READ_CHUNK: usize = 4096;

/// Opens WebSocket connections with a shared [`ClientConfig`].
///
/// A `Connector` is cheap to clone and can run any number of connects at the same time; they
/// share nothing but the read-only configuration.
///
/// Each connect goes through the same steps:
/// 1. the URL scheme is checked (`ws` or `wss`), before any I/O;
/// 2. host and port come from the overrides or from the URL;
/// 3. a route is chosen, directly or through an environment proxy;
/// 4. the transport connects, and upgrades to TLS for `wss`, within [`ClientConfig::timeout`];
/// 5. the opening handshake is written in full, then the response is parsed chunk by chunk;
/// 6. the selected subprotocol is validated against the requested ones.
///
/// Any failure shuts the socket down before the error is returned.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use wsdial::{ClientConfig, Connector};
///
/// async fn connect() -> wsdial::Result<()> {
///     let connector = Connector::new(
///         ClientConfig::default()
///             .with_timeout(Duration::from_secs(5))
///             .with_subprotocols("chat"),
///     );
///
///     let conn = connector
///         .connect("wss://example.com/socket")
///         .host("10.0.0.7")
///         .await?;
///     assert_eq!(conn.subprotocol(), Some("chat"));
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Connector {
    config: Arc<ClientConfig>,
    resolver: Arc<dyn ProxyResolver>,
    transport: Arc<dyn Transport>,
}

impl Connector {
    /// Creates a connector reading proxies from the process environment and connecting over TCP.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
            resolver: Arc::new(EnvProxyResolver::new()),
            transport: Arc::new(TcpTransport),
        }
    }

    /// Replaces the source of proxy candidates.
    pub fn with_resolver(self, resolver: impl ProxyResolver + 'static) -> Self {
        Self {
            resolver: Arc::new(resolver),
            ..self
        }
    }

    /// Replaces the transport producing sockets.
    pub fn with_transport(self, transport: impl Transport + 'static) -> Self {
        Self {
            transport: Arc::new(transport),
            ..self
        }
    }

    /// The configuration shared by every connect.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Starts a connection to `uri`.
    ///
    /// The returned [`Connect`] can override the host, port and socket preparation before it is
    /// awaited. Parse errors are reported when it is awaited.
    pub fn connect(&self, uri: &str) -> Connect {
        Connect::new(self.clone(), Url::parse(uri))
    }

    /// Same as [`Connector::connect`] for an already parsed URL.
    pub fn connect_url(&self, url: Url) -> Connect {
        Connect::new(self.clone(), Ok(url))
    }

    async fn connect_priv(opts: ConnectOpts) -> Result<Connection> {
        let this = opts.connector;
        let url = opts.url?;

        let scheme = url.scheme();
        if scheme != "ws" && scheme != "wss" {
            return Err(WebSocketError::InvalidScheme(scheme.to_owned()));
        }
        let is_tls = scheme == "wss";

        let url_host = url.host().ok_or(url::ParseError::EmptyHost)?;
        let host = opts.host.unwrap_or_else(|| url_host.to_string());
        // ws and wss both have a default port
        let port = opts
            .port
            .or_else(|| url.port_or_known_default())
            .ok_or(url::ParseError::InvalidPort)?;

        let route = select_route(
            scheme,
            &host,
            port,
            this.config.use_env_proxy,
            this.resolver.as_ref(),
        )?;

        let (codec, request) = ClientHandshake::build(
            &url,
            this.config.protocol_version.as_deref(),
            &this.config.headers,
            &this.config.subprotocols,
        )?;

        let tls = is_tls.then(|| TlsSettings {
            verify: this.config.tls_verify,
            peer_name: peer_name(&url_host),
            ca_file: this.config.tls_ca_file.clone(),
        });

        let connecting = this
            .transport
            .connect(&host, port, &route, opts.prepare.as_ref(), tls.as_ref());
        let stream = match tokio::time::timeout(this.config.timeout, connecting).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                #[cfg(feature = "logging")]
                log::debug!("connecting to {host}:{port}: {err}");
                return Err(WebSocketError::ConnectFailed(err.to_string()));
            }
            Err(_) => {
                return Err(WebSocketError::ConnectFailed(format!(
                    "timed out after {:?} connecting to {host}:{port}",
                    this.config.timeout
                )))
            }
        };

        let negotiated = HandshakeSession::new(stream, codec, &this.config.subprotocols)
            .run(request, this.config.handshake_timeout)
            .await?;

        #[cfg(feature = "logging")]
        log::debug!(
            "websocket handshake with {url} complete, subprotocol: {:?}",
            negotiated.subprotocol
        );

        Ok(Connection::new(
            negotiated.stream,
            negotiated.leftover,
            negotiated.subprotocol,
            this.config.max_payload_size,
            this.config.max_fragments,
        ))
    }
}

impl Default for Connector {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

/// Name checked against the server certificate: the host from the URL, without brackets.
fn peer_name(host: &Host<&str>) -> String {
    match host {
        Host::Domain(domain) => (*domain).to_owned(),
        Host::Ipv4(addr) => addr.to_string(),
        Host::Ipv6(addr) => addr.to_string(),
    }
}

/// A pending connection attempt.
///
/// Created by [`Connector::connect`]. The attempt starts when the value is awaited and resolves
/// exactly once.
///
/// # Panics
/// [`Connect::host`], [`Connect::port`] and [`Connect::prepare`] panic if called after the
/// future has been polled.
pub struct Connect {
    opts: Option<ConnectOpts>,
    future: Option<BoxFuture<'static, Result<Connection>>>,
}

struct ConnectOpts {
    connector: Connector,
    url: std::result::Result<Url, url::ParseError>,
    host: Option<String>,
    port: Option<u16>,
    prepare: Option<PrepareHook>,
}

impl Connect {
    fn new(connector: Connector, url: std::result::Result<Url, url::ParseError>) -> Self {
        Self {
            opts: Some(ConnectOpts {
                connector,
                url,
                host: None,
                port: None,
                prepare: None,
            }),
            future: None,
        }
    }

    fn opts_mut(&mut self) -> &mut ConnectOpts {
        let Some(opts) = &mut self.opts else {
            panic!("Connect overrides set after the first poll")
        };
        opts
    }

    /// Connects to `host` instead of the host in the URL.
    ///
    /// The URL host is still sent in the `Host` header and checked against the server
    /// certificate.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.opts_mut().host = Some(host.into());
        self
    }

    /// Connects to `port` instead of the port in the URL.
    pub fn port(mut self, port: u16) -> Self {
        self.opts_mut().port = Some(port);
        self
    }

    /// Runs `hook` on the socket before it connects.
    pub fn prepare<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TcpSocket) -> std::io::Result<()> + Send + Sync + 'static,
    {
        self.opts_mut().prepare = Some(Arc::new(hook));
        self
    }
}

impl Future for Connect {
    type Output = Result<Connection>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(opts) = this.opts.take() {
            this.future = Some(Box::pin(Connector::connect_priv(opts)));
        }

        let Some(pinned) = &mut this.future else {
            unreachable!()
        };
        pinned.poll_unpin(cx)
    }
}

/// What a completed handshake hands over to the [`Connection`].
struct Negotiated {
    stream: MaybeTlsStream,
    subprotocol: Option<String>,
    leftover: Bytes,
}

/// State of one opening handshake, from the first byte written to the final outcome.
///
/// [`HandshakeSession::run`] consumes the session, so the codec and the socket are released as
/// soon as an outcome is produced: on success the socket moves into [`Negotiated`], on failure
/// it is shut down and dropped.
struct HandshakeSession {
    stream: MaybeTlsStream,
    codec: ClientHandshake,
    requested: Vec<String>,
    requested_set: HashSet<String>,
}

impl HandshakeSession {
    fn new(stream: MaybeTlsStream, codec: ClientHandshake, requested: &[String]) -> Self {
        Self {
            stream,
            codec,
            requested: requested.to_vec(),
            requested_set: requested.iter().cloned().collect(),
        }
    }

    async fn run(mut self, request: Bytes, timeout: Option<Duration>) -> Result<Negotiated> {
        let outcome = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.drive(&request))
                .await
                .unwrap_or_else(|_| {
                    Err(WebSocketError::HandshakeFailed(format!(
                        "no handshake response within {timeout:?}"
                    )))
                }),
            None => self.drive(&request).await,
        };

        match outcome {
            Ok(subprotocol) => Ok(Negotiated {
                leftover: self.codec.take_leftover(),
                stream: self.stream,
                subprotocol,
            }),
            Err(err) => {
                self.teardown().await;
                Err(err)
            }
        }
    }

    /// Writes the request, then feeds the response to the codec until it settles.
    async fn drive(&mut self, request: &[u8]) -> Result<Option<String>> {
        self.stream.write_all(request).await?;
        self.stream.flush().await?;

        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                self.codec.feed_eof();
            } else {
                self.codec.feed(&chunk[..n]);
            }

            match self.codec.state() {
                HandshakeState::Pending => continue,
                HandshakeState::Error => {
                    let detail = self.codec.error_detail().unwrap_or("invalid response");
                    return Err(WebSocketError::HandshakeFailed(detail.to_owned()));
                }
                HandshakeState::Complete => {
                    return validate_subprotocol(
                        &self.requested,
                        &self.requested_set,
                        self.codec.accepted_subprotocol(),
                    );
                }
            }
        }
    }

    /// Closes the socket abruptly; no closing handshake is attempted.
    async fn teardown(mut self) {
        if let Err(_err) = self.stream.shutdown().await {
            #[cfg(feature = "logging")]
            log::debug!("shutting down after failed handshake: {_err}");
        }
    }
}

/// Checks the server's subprotocol against the requested ones.
///
/// With nothing requested, whatever the server sent is accepted as is.
fn validate_subprotocol(
    requested: &[String],
    requested_set: &HashSet<String>,
    received: Option<&str>,
) -> Result<Option<String>> {
    if requested.is_empty() {
        return Ok(received.map(str::to_owned));
    }

    match received {
        None => Err(WebSocketError::SubprotocolMissing {
            requested: requested.join(", "),
        }),
        Some(protocol) if requested_set.contains(protocol) => Ok(Some(protocol.to_owned())),
        Some(protocol) => Err(WebSocketError::SubprotocolMismatch {
            requested: requested.join(", "),
            received: protocol.to_owned(),
        }),
    }
}
