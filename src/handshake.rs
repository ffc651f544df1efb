//! Client side of the WebSocket opening handshake.
//!
//! [`ClientHandshake`] builds the upgrade request and then parses the server response
//! incrementally: every chunk read from the socket is passed to [`ClientHandshake::feed`], after
//! which [`ClientHandshake::state`] tells whether more bytes are needed, the response was rejected,
//! or the upgrade is complete.
//!
//! ```rust
//! use wsdial::handshake::{ClientHandshake, HandshakeState};
//!
//! let url: url::Url = "ws://example.com/chat".parse()?;
//! let (mut handshake, request) = ClientHandshake::build(&url, None, &[], &[])?;
//! assert!(request.starts_with(b"GET /chat HTTP/1.1\r\n"));
//!
//! handshake.feed(b"HTTP/1.1 101 Switching Protocols\r\n");
//! assert_eq!(handshake.state(), HandshakeState::Pending);
//! # Ok::<_, wsdial::WebSocketError>(())
//! ```

use base64::prelude::*;
use bytes::{BufMut, Bytes, BytesMut};
use http::{header, HeaderName, HeaderValue};
use sha1::{Digest, Sha1};
use url::Url;

use crate::Result;

/// Largest response head accepted before the handshake is rejected, set to 8 KiB.
pub const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Protocol version requested unless overridden.
pub const WEBSOCKET_VERSION: &str = "13";

const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const MAX_RESPONSE_HEADERS: usize = 64;

/// Progress of the response parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// More bytes are needed.
    Pending,
    /// The response was rejected, see [`ClientHandshake::error_detail`].
    Error,
    /// The server accepted the upgrade.
    Complete,
}

/// Incremental parser for the server's opening-handshake response.
#[derive(Debug)]
pub struct ClientHandshake {
    key: String,
    buffer: BytesMut,
    state: HandshakeState,
    error: Option<String>,
    subprotocol: Option<String>,
    leftover: Bytes,
}

impl ClientHandshake {
    /// Builds the upgrade request for `url`.
    ///
    /// Returns the parser waiting for the response together with the request bytes, which must be
    /// written to the socket in full before any response bytes are fed.
    ///
    /// `subprotocols`, when not empty, are sent comma-joined in `Sec-WebSocket-Protocol`.
    /// `headers` are appended after the WebSocket headers in order; a `Host` entry among them
    /// replaces the generated one.
    ///
    /// # Errors
    /// Fails if `url` has no host.
    pub fn build(
        url: &Url,
        version: Option<&str>,
        headers: &[(HeaderName, HeaderValue)],
        subprotocols: &[String],
    ) -> Result<(Self, Bytes)> {
        let host = url.host_str().ok_or(url::ParseError::EmptyHost)?;
        let key = generate_key();

        let mut target = &url[url::Position::BeforePath..url::Position::AfterQuery];
        if target.is_empty() {
            target = "/";
        }

        let mut buf = BytesMut::with_capacity(512);
        buf.put_slice(b"GET ");
        buf.put_slice(target.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");

        // allow the user to set a custom Host header.
        if !headers.iter().any(|(name, _)| name == header::HOST) {
            buf.put_slice(b"Host: ");
            buf.put_slice(host.as_bytes());
            if let Some(port) = url.port() {
                buf.put_slice(format!(":{port}").as_bytes());
            }
            buf.put_slice(b"\r\n");
        }

        buf.put_slice(b"Upgrade: websocket\r\n");
        buf.put_slice(b"Connection: Upgrade\r\n");
        buf.put_slice(b"Sec-WebSocket-Key: ");
        buf.put_slice(key.as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(b"Sec-WebSocket-Version: ");
        buf.put_slice(version.unwrap_or(WEBSOCKET_VERSION).as_bytes());
        buf.put_slice(b"\r\n");

        if !subprotocols.is_empty() {
            buf.put_slice(b"Sec-WebSocket-Protocol: ");
            buf.put_slice(subprotocols.join(", ").as_bytes());
            buf.put_slice(b"\r\n");
        }

        for (name, value) in headers {
            buf.put_slice(name.as_str().as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }

        buf.put_slice(b"\r\n");

        let this = Self {
            key,
            buffer: BytesMut::with_capacity(1024),
            state: HandshakeState::Pending,
            error: None,
            subprotocol: None,
            leftover: Bytes::new(),
        };

        Ok((this, buf.freeze()))
    }

    /// The `Sec-WebSocket-Key` sent in the request.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current parser state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Why the response was rejected, once the state is [`HandshakeState::Error`].
    pub fn error_detail(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// `Sec-WebSocket-Protocol` sent by the server, once the state is [`HandshakeState::Complete`].
    ///
    /// Repeated headers are joined with `", "`. The value is not checked against the request.
    pub fn accepted_subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Takes the bytes that followed the response head in the last chunk fed.
    ///
    /// A server may start sending frames right behind its response; those bytes belong to the
    /// connection, not to the handshake.
    pub fn take_leftover(&mut self) -> Bytes {
        std::mem::take(&mut self.leftover)
    }

    /// Feeds a chunk of response bytes.
    ///
    /// Bytes fed after the parser left [`HandshakeState::Pending`] are ignored.
    pub fn feed(&mut self, data: &[u8]) {
        if self.state != HandshakeState::Pending {
            return;
        }

        self.buffer.extend_from_slice(data);

        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut response = httparse::Response::new(&mut headers);

        match response.parse(&self.buffer) {
            Ok(httparse::Status::Complete(len)) => {
                match verify(&response, &self.key) {
                    Ok(subprotocol) => {
                        self.subprotocol = subprotocol;
                        self.leftover = self.buffer.split_off(len).freeze();
                        self.state = HandshakeState::Complete;
                    }
                    Err(detail) => self.fail(detail),
                }
                self.buffer = BytesMut::new();
            }
            Ok(httparse::Status::Partial) => {
                if self.buffer.len() > MAX_RESPONSE_HEAD {
                    self.fail(format!(
                        "response head exceeds {MAX_RESPONSE_HEAD} bytes"
                    ));
                }
            }
            Err(err) => self.fail(format!("malformed response: {err}")),
        }
    }

    /// Signals that the peer closed the stream.
    pub fn feed_eof(&mut self) {
        if self.state == HandshakeState::Pending {
            self.fail("connection closed before handshake completed".to_owned());
        }
    }

    fn fail(&mut self, detail: String) {
        self.state = HandshakeState::Error;
        self.error = Some(detail);
        self.buffer = BytesMut::new();
    }
}

/// Checks the parsed response head and extracts the raw `Sec-WebSocket-Protocol` value.
fn verify(
    response: &httparse::Response<'_, '_>,
    key: &str,
) -> std::result::Result<Option<String>, String> {
    let code = response.code.unwrap_or_default();
    if code != 101 {
        return Err(format!(
            "unexpected status code {code} {}",
            response.reason.unwrap_or_default()
        ));
    }

    let header_str = |name: HeaderName| {
        response
            .headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name.as_str()))
            .map(|h| std::str::from_utf8(h.value).map(str::trim))
    };
    let has_token = |name: HeaderName, token: &str| {
        header_str(name).any(|value| {
            value
                .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                .unwrap_or(false)
        })
    };

    if !has_token(header::UPGRADE, "websocket") {
        return Err("invalid upgrade header".to_owned());
    }

    if !has_token(header::CONNECTION, "upgrade") {
        return Err("invalid connection header".to_owned());
    }

    let accept = header_str(header::SEC_WEBSOCKET_ACCEPT)
        .next()
        .ok_or_else(|| "missing Sec-WebSocket-Accept".to_owned())?
        .map_err(|_| "invalid Sec-WebSocket-Accept".to_owned())?;
    if accept != accept_key(key) {
        return Err("invalid Sec-WebSocket-Accept".to_owned());
    }

    let mut protocols = header_str(header::SEC_WEBSOCKET_PROTOCOL)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| "invalid Sec-WebSocket-Protocol".to_owned())?;
    protocols.retain(|value| !value.is_empty());

    // repeated headers are surfaced as one comma-joined value; acceptance is up to the caller
    Ok((!protocols.is_empty()).then(|| protocols.join(", ")))
}

/// Computes the `Sec-WebSocket-Accept` value expected for `key`.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}
