//! Socket establishment: TCP connect, optional proxy tunnel, optional TLS upgrade.
//!
//! [`Connector`](crate::Connector) only talks to the network through the [`Transport`] trait, so
//! tests or embedders can observe or replace how sockets are produced. [`TcpTransport`] is the
//! default implementation.

use std::{io, net::SocketAddr, sync::Arc};

use futures::future::BoxFuture;
use tokio::net::{lookup_host, TcpSocket, TcpStream};

use crate::{proxy::Route, stream::MaybeTlsStream, tls::TlsSettings};

/// Customization applied to every socket right before it connects.
///
/// The hook receives the unconnected socket and can set options such as buffer sizes,
/// keepalive, or a local address to bind. Returning an error aborts the attempt.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use tokio::net::TcpSocket;
/// use wsdial::transport::PrepareHook;
///
/// let hook: PrepareHook = Arc::new(|socket: &TcpSocket| {
///     socket.set_keepalive(true)?;
///     socket.bind("0.0.0.0:0".parse().unwrap())
/// });
/// ```
pub type PrepareHook = Arc<dyn Fn(&TcpSocket) -> io::Result<()> + Send + Sync>;

/// Produces connected sockets for the connector.
pub trait Transport: Send + Sync {
    /// Connects to `host:port` following `route`, then runs the TLS handshake when `tls` is set.
    ///
    /// `prepare` is called on the raw socket before it connects, once per socket created.
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        route: &'a Route,
        prepare: Option<&'a PrepareHook>,
        tls: Option<&'a TlsSettings>,
    ) -> BoxFuture<'a, io::Result<MaybeTlsStream>>;
}

/// Plain TCP with `rustls` on top.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        route: &'a Route,
        prepare: Option<&'a PrepareHook>,
        tls: Option<&'a TlsSettings>,
    ) -> BoxFuture<'a, io::Result<MaybeTlsStream>> {
        Box::pin(async move {
            let stream = match route {
                Route::Direct => tcp_connect(host, port, prepare).await?,
                Route::Proxy(proxy) => proxy.connect_via(host, port, prepare).await?,
            };

            match tls {
                Some(settings) => Ok(settings.upgrade(stream).await?.into()),
                None => Ok(stream.into()),
            }
        })
    }
}

/// Resolves `host` and connects to the first address that accepts.
///
/// IPv6 literals may be given with or without square brackets.
pub async fn tcp_connect(
    host: &str,
    port: u16,
    prepare: Option<&PrepareHook>,
) -> io::Result<TcpStream> {
    let host = remove_brackets(host);
    let mut last_err = None;

    for addr in lookup_host((host, port)).await? {
        match connect_addr(addr, prepare).await {
            Ok(stream) => {
                if let Err(_err) = stream.set_nodelay(true) {
                    #[cfg(feature = "logging")]
                    log::warn!("setting TCP_NODELAY on {addr}: {_err}");
                }
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address found for {host}:{port}"),
        )
    }))
}

async fn connect_addr(addr: SocketAddr, prepare: Option<&PrepareHook>) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if let Some(prepare) = prepare {
        prepare(&socket)?;
    }

    socket.connect(addr).await
}

/// `Tcp*` functions expect IPv6 addresses to not be wrapped in square brackets.
pub(crate) fn remove_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
