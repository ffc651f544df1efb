//! # wsdial
//! Client-side connection establishment for the WebSocket protocol (RFC 6455).
//!
//! The crate turns a `ws://` or `wss://` URL into a live, negotiated socket. It covers:
//!
//! - Proxy discovery from the `ws_proxy`/`wss_proxy`/`http_proxy`/`https_proxy` environment
//!   variables (honouring `no_proxy`), with HTTP `CONNECT` tunnelling.
//! - Asynchronous TCP connect, bounded by a configurable timeout, with an optional hook to tune
//!   the socket before it connects.
//! - TLS for `wss`, with certificate verification on by default and an optional custom CA bundle.
//! - The opening handshake, including subprotocol negotiation and validation.
//!
//! Every connect attempt completes exactly once: either with a [`Connection`] owning the socket,
//! or with a single [`WebSocketError`]. On any failure the socket is shut down before the error
//! is returned.
//!
//! Frame encoding and decoding are not part of this crate; the returned [`Connection`] implements
//! [`tokio::io::AsyncRead`] and [`tokio::io::AsyncWrite`] and can be handed to a framing layer.
//!
//! # Features
//! - `logging`: Enables debug logging for route selection and handshake negotiation using the
//!   `log` crate. Useful for debugging connection problems.
//!
//! # Client Example
//! ```no_run
//! use wsdial::{ClientConfig, Connector};
//!
//! async fn client_connect() -> wsdial::Result<()> {
//!     let config = ClientConfig::default()
//!         .with_subprotocols(["chat", "json"])
//!         .with_env_proxy();
//!
//!     let conn = Connector::new(config)
//!         .connect("wss://echo.websocket.org")
//!         .await?;
//!
//!     println!("negotiated subprotocol: {:?}", conn.subprotocol());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

mod connection;
mod connector;
pub mod handshake;
mod options;
pub mod proxy;
mod stream;
pub mod tls;
pub mod transport;

use thiserror::Error;

pub use connection::Connection;
pub use connector::{Connect, Connector};
pub use options::{ClientConfig, HeaderInput, Subprotocols, DEFAULT_TIMEOUT};
pub use stream::MaybeTlsStream;

/// A result type for connect operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur while establishing a WebSocket connection.
///
/// The five connect-time kinds are terminal and never retried internally:
///
/// - [`WebSocketError::InvalidScheme`] is raised before any I/O takes place.
/// - [`WebSocketError::ConnectFailed`] covers DNS, refusal, timeouts, proxy tunnelling and TLS.
/// - [`WebSocketError::HandshakeFailed`] carries the handshake parser's detail string.
/// - [`WebSocketError::SubprotocolMissing`] and [`WebSocketError::SubprotocolMismatch`] are
///   detected after the server agreed to upgrade.
///
/// The remaining variants are reported while building a [`ClientConfig`] or resolving proxies.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The URL scheme is neither `ws` nor `wss`.
    #[error("invalid scheme {0:?}, expected ws or wss")]
    InvalidScheme(String),

    /// The socket could not be established. The message is the transport's reason.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The opening handshake response was rejected by the parser.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Subprotocols were requested but the server did not select one.
    #[error("server did not select a subprotocol, requested: {requested}")]
    SubprotocolMissing {
        /// Comma-joined list of the requested subprotocols.
        requested: String,
    },

    /// The server selected a subprotocol that was not requested.
    #[error("server selected subprotocol {received:?}, which is not one of the requested: {requested}")]
    SubprotocolMismatch {
        /// Comma-joined list of the requested subprotocols.
        requested: String,
        /// The value returned by the server.
        received: String,
    },

    /// A configured header name is not a valid HTTP token.
    #[error(transparent)]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// A configured header value contains forbidden bytes.
    #[error(transparent)]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// A proxy environment variable holds an unusable value.
    #[error("invalid proxy: {0}")]
    InvalidProxy(String),

    /// Wraps errors from URL parsing.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),
}

impl WebSocketError {
    /// Returns `true` for failures raised after the server agreed to upgrade.
    pub fn is_handshake_level(&self) -> bool {
        matches!(
            self,
            Self::HandshakeFailed(_)
                | Self::SubprotocolMissing { .. }
                | Self::SubprotocolMismatch { .. }
        )
    }
}

impl From<std::io::Error> for WebSocketError {
    fn from(err: std::io::Error) -> Self {
        Self::ConnectFailed(err.to_string())
    }
}
