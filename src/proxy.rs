//! Proxy discovery and HTTP `CONNECT` tunnelling.
//!
//! When [`ClientConfig::use_env_proxy`](crate::ClientConfig::use_env_proxy) is set, the connector
//! asks a [`ProxyResolver`] for candidates in a fixed order and uses the first one that applies to
//! the destination:
//!
//! | target | candidates, in order         |
//! |--------|------------------------------|
//! | `ws`   | `ws_proxy`, then `http_proxy`   |
//! | `wss`  | `wss_proxy`, then `https_proxy` |
//!
//! Protocol-specific variables therefore take precedence over the generic HTTP ones. When no
//! candidate applies, the connection is made directly.

use std::{fmt, io, sync::Arc};

use base64::prelude::*;
use percent_encoding::percent_decode_str;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use url::Url;

use crate::{
    transport::{remove_brackets, tcp_connect, PrepareHook},
    Result, WebSocketError,
};

/// Largest proxy reply head accepted.
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// The proxy variable families consulted for WebSocket targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    /// `ws_proxy`
    Ws,
    /// `wss_proxy`
    Wss,
    /// `http_proxy`
    Http,
    /// `https_proxy`
    Https,
}

impl ProxyKind {
    /// Candidate kinds for a target scheme, most specific first.
    pub fn candidates(scheme: &str) -> &'static [ProxyKind] {
        match scheme {
            "ws" => &[ProxyKind::Ws, ProxyKind::Http],
            "wss" => &[ProxyKind::Wss, ProxyKind::Https],
            _ => &[],
        }
    }

    /// Name of the environment variable, in lower case.
    pub fn env_var(self) -> &'static str {
        match self {
            ProxyKind::Ws => "ws_proxy",
            ProxyKind::Wss => "wss_proxy",
            ProxyKind::Http => "http_proxy",
            ProxyKind::Https => "https_proxy",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.env_var())
    }
}

/// How the socket reaches the destination.
#[derive(Debug, Clone)]
pub enum Route {
    /// Straight TCP connection to the destination.
    Direct,
    /// Tunnel through an HTTP proxy.
    Proxy(ProxyConnector),
}

/// Source of proxy candidates.
pub trait ProxyResolver: Send + Sync {
    /// Proxies configured for `kind`, in order of preference.
    ///
    /// # Errors
    /// Fails if the configuration for `kind` exists but is unusable.
    fn candidates_for(&self, kind: ProxyKind) -> Result<Vec<ProxyConnector>>;
}

/// Picks the route for a connection.
///
/// With `use_env_proxy` off the route is always [`Route::Direct`] and `resolver` is not consulted.
///
/// # Errors
/// Propagates resolver errors.
pub fn select_route(
    scheme: &str,
    host: &str,
    port: u16,
    use_env_proxy: bool,
    resolver: &dyn ProxyResolver,
) -> Result<Route> {
    if !use_env_proxy {
        return Ok(Route::Direct);
    }

    for &kind in ProxyKind::candidates(scheme) {
        for candidate in resolver.candidates_for(kind)? {
            if candidate.applies_to(host, port) {
                #[cfg(feature = "logging")]
                log::debug!("connecting to {host}:{port} through {kind} {}", candidate.proxy);
                return Ok(Route::Proxy(candidate));
            }
        }
    }

    #[cfg(feature = "logging")]
    log::debug!("no proxy applies to {host}:{port}, connecting directly");
    Ok(Route::Direct)
}

/// An HTTP proxy reached with `CONNECT`.
#[derive(Debug, Clone)]
pub struct ProxyConnector {
    kind: ProxyKind,
    proxy: Url,
    no_proxy: NoProxy,
}

impl ProxyConnector {
    /// Creates a connector for the `http://` proxy at `proxy`.
    ///
    /// # Errors
    /// Fails with [`WebSocketError::InvalidProxy`] if the scheme is not `http` or the host is
    /// missing.
    pub fn new(kind: ProxyKind, proxy: Url) -> Result<Self> {
        if proxy.scheme() != "http" {
            return Err(WebSocketError::InvalidProxy(format!(
                "{kind}: unsupported proxy scheme {:?}",
                proxy.scheme()
            )));
        }
        if proxy.host_str().is_none() {
            return Err(WebSocketError::InvalidProxy(format!(
                "{kind}: missing proxy host"
            )));
        }

        Ok(Self {
            kind,
            proxy,
            no_proxy: NoProxy::default(),
        })
    }

    /// Excludes destinations matched by `no_proxy`.
    pub fn with_no_proxy(self, no_proxy: NoProxy) -> Self {
        Self { no_proxy, ..self }
    }

    /// The variable family this connector was configured from.
    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    /// The proxy address.
    pub fn proxy_url(&self) -> &Url {
        &self.proxy
    }

    /// Whether this proxy should carry traffic for `host:port`.
    pub fn applies_to(&self, host: &str, port: u16) -> bool {
        !self.no_proxy.matches(host, port)
    }

    /// Connects to the proxy and opens a tunnel to `host:port`.
    ///
    /// `prepare` runs on the socket connecting to the proxy.
    ///
    /// # Errors
    /// Fails if the proxy cannot be reached or refuses the tunnel.
    pub async fn connect_via(
        &self,
        host: &str,
        port: u16,
        prepare: Option<&PrepareHook>,
    ) -> io::Result<TcpStream> {
        // `new` checked that the host exists
        let proxy_host = self.proxy.host_str().unwrap_or_default();
        let proxy_port = self.proxy.port_or_known_default().unwrap_or(80);

        let mut stream = tcp_connect(proxy_host, proxy_port, prepare).await?;
        self.tunnel(&mut stream, host, port).await?;
        Ok(stream)
    }

    /// Sends `CONNECT` over `stream` and waits for a 2xx reply.
    async fn tunnel(&self, stream: &mut TcpStream, host: &str, port: u16) -> io::Result<()> {
        let authority = if remove_brackets(host).contains(':') {
            format!("[{}]:{port}", remove_brackets(host))
        } else {
            format!("{host}:{port}")
        };

        let mut request =
            format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some(credentials) = self.basic_auth() {
            request.push_str("Proxy-Authorization: Basic ");
            request.push_str(&credentials);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");

        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        // Read byte by byte so no tunnelled data is consumed past the reply head.
        let mut head = Vec::with_capacity(256);
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() > MAX_CONNECT_RESPONSE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "proxy reply head too large",
                ));
            }
            let byte = stream.read_u8().await.map_err(|err| {
                if err.kind() == io::ErrorKind::UnexpectedEof {
                    io::Error::new(err.kind(), "proxy closed the connection during CONNECT")
                } else {
                    err
                }
            })?;
            head.push(byte);
        }

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        response
            .parse(&head)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        match response.code {
            Some(code) if (200..300).contains(&code) => Ok(()),
            code => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!(
                    "proxy {} refused CONNECT to {authority}: {} {}",
                    self.proxy,
                    code.unwrap_or_default(),
                    response.reason.unwrap_or_default()
                ),
            )),
        }
    }

    fn basic_auth(&self) -> Option<String> {
        if self.proxy.username().is_empty() && self.proxy.password().is_none() {
            return None;
        }

        let user = percent_decode(self.proxy.username());
        let password = percent_decode(self.proxy.password().unwrap_or_default());
        Some(BASE64_STANDARD.encode(format!("{user}:{password}")))
    }
}

fn percent_decode(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}

/// Destinations excluded from proxying, as listed in `no_proxy`.
///
/// Entries are comma separated. `*` matches everything, a name matches itself and its
/// subdomains (a leading `.` is ignored), and an entry may be restricted to a port with
/// `host:port`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoProxy {
    entries: Vec<(String, Option<u16>)>,
}

impl NoProxy {
    /// Parses a `no_proxy` value.
    pub fn parse(value: &str) -> Self {
        let entries = value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (host, port) = split_host_port(entry);
                let host = host.trim_start_matches('.').to_ascii_lowercase();
                (host, port)
            })
            .collect();

        Self { entries }
    }

    /// Whether `host:port` is excluded.
    pub fn matches(&self, host: &str, port: u16) -> bool {
        let host = remove_brackets(host).to_ascii_lowercase();

        self.entries.iter().any(|(entry, entry_port)| {
            if entry_port.is_some_and(|p| p != port) {
                return false;
            }

            entry == "*"
                || *entry == host
                || host
                    .strip_suffix(entry.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

fn split_host_port(entry: &str) -> (&str, Option<u16>) {
    if let Some(rest) = entry.strip_prefix('[') {
        // [v6]:port or [v6]
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
        return (entry, None);
    }

    match entry.split_once(':') {
        Some((host, port)) if !port.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (entry, None),
        },
        _ => (entry, None),
    }
}

/// Reads proxies from `ws_proxy`, `wss_proxy`, `http_proxy`, `https_proxy` and `no_proxy`.
///
/// Each variable is looked up in lower case first, then in upper case. A value without a scheme
/// is read as an `http://` URL. Empty values are ignored.
#[derive(Clone)]
pub struct EnvProxyResolver {
    lookup: Arc<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl EnvProxyResolver {
    /// Resolver reading the process environment.
    pub fn new() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolver reading variables through `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .or_else(|| (self.lookup)(&name.to_ascii_uppercase()))
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }
}

impl Default for EnvProxyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EnvProxyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvProxyResolver").finish_non_exhaustive()
    }
}

impl ProxyResolver for EnvProxyResolver {
    fn candidates_for(&self, kind: ProxyKind) -> Result<Vec<ProxyConnector>> {
        let Some(value) = self.var(kind.env_var()) else {
            return Ok(Vec::new());
        };

        let url = if value.contains("://") {
            Url::parse(&value)
        } else {
            Url::parse(&format!("http://{value}"))
        }
        .map_err(|err| WebSocketError::InvalidProxy(format!("{kind}={value}: {err}")))?;

        let no_proxy = self
            .var("no_proxy")
            .map(|value| NoProxy::parse(&value))
            .unwrap_or_default();

        Ok(vec![ProxyConnector::new(kind, url)?.with_no_proxy(no_proxy)])
    }
}
