use std::{path::PathBuf, time::Duration};

use http::{HeaderName, HeaderValue};

use crate::Result;

/// Default bound on the connect phase (TCP connect, proxy tunnel and TLS handshake).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration shared by every connect attempt of a [`Connector`](crate::Connector).
///
/// A `ClientConfig` is assembled once with the `with_*` methods and then never mutated: the
/// connector keeps it behind an `Arc`, so any number of concurrent connects can read it without
/// coordination.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use wsdial::ClientConfig;
///
/// let config = ClientConfig::default()
///     .with_timeout(Duration::from_secs(5))
///     .with_subprotocols(["chat", "json"])
///     .with_max_payload_size(64 * 1024);
/// ```
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Upper bound for establishing the socket, proxy tunnel and TLS session included.
    ///
    /// Default: 30 seconds, see [`DEFAULT_TIMEOUT`].
    pub timeout: Duration,

    /// Whether the server certificate is verified on `wss` connections.
    ///
    /// Default: `true`
    pub tls_verify: bool,

    /// PEM bundle replacing the built-in root certificates.
    pub tls_ca_file: Option<PathBuf>,

    /// Value sent in `Sec-WebSocket-Version` instead of `13`.
    pub protocol_version: Option<String>,

    /// Subprotocols offered to the server, in preference order and without duplicates.
    ///
    /// Empty means no negotiation is requested and any server answer is accepted.
    pub subprotocols: Vec<String>,

    /// Extra request headers, in the order they are sent. Duplicated names are allowed.
    pub headers: Vec<(HeaderName, HeaderValue)>,

    /// Forwarded unchanged to the [`Connection`](crate::Connection).
    pub max_payload_size: Option<usize>,

    /// Forwarded unchanged to the [`Connection`](crate::Connection).
    pub max_fragments: Option<usize>,

    /// Whether proxies are discovered from the environment.
    ///
    /// Default: `false`
    pub use_env_proxy: bool,

    /// Upper bound for the opening handshake once the socket is up.
    ///
    /// Default: `None`, an unresponsive server can stall the handshake until the caller gives up.
    pub handshake_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            tls_verify: true,
            tls_ca_file: None,
            protocol_version: None,
            subprotocols: Vec::new(),
            headers: Vec::new(),
            max_payload_size: None,
            max_fragments: None,
            use_env_proxy: false,
            handshake_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Sets the bound on the connect phase.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// Disables certificate verification for `wss` connections.
    ///
    /// The peer name is no longer checked either. Only use this against servers you control.
    pub fn without_tls_verify(self) -> Self {
        Self {
            tls_verify: false,
            ..self
        }
    }

    /// Trusts the certificates in the PEM file at `path` instead of the built-in roots.
    pub fn with_ca_file(self, path: impl Into<PathBuf>) -> Self {
        Self {
            tls_ca_file: Some(path.into()),
            ..self
        }
    }

    /// Overrides the protocol version requested in `Sec-WebSocket-Version`.
    pub fn with_protocol_version(self, version: impl Into<String>) -> Self {
        Self {
            protocol_version: Some(version.into()),
            ..self
        }
    }

    /// Sets the subprotocols offered to the server.
    ///
    /// Accepts a single name or any list of names; duplicates are dropped and the first
    /// occurrence keeps its position.
    pub fn with_subprotocols(self, subprotocols: impl Into<Subprotocols>) -> Self {
        Self {
            subprotocols: subprotocols.into().0,
            ..self
        }
    }

    /// Appends one request header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    /// Appends headers from a name to value(s) mapping.
    ///
    /// Entries are sorted by name first so the resulting sequence does not depend on the
    /// iteration order of the input; values listed under one name keep their order.
    ///
    /// # Errors
    /// Fails if a name or value is not valid in an HTTP header.
    ///
    /// # Example
    /// ```rust
    /// use std::collections::HashMap;
    /// use wsdial::{ClientConfig, HeaderInput};
    ///
    /// let mut headers = HashMap::new();
    /// headers.insert("X-Foo", HeaderInput::from("bar"));
    /// headers.insert("X-Baz", HeaderInput::from(vec!["abc", "def"]));
    ///
    /// let config = ClientConfig::default().with_headers(headers)?;
    /// let names: Vec<_> = config.headers.iter().map(|(name, _)| name.as_str()).collect();
    /// assert_eq!(names, ["x-baz", "x-baz", "x-foo"]);
    /// # Ok::<_, wsdial::WebSocketError>(())
    /// ```
    pub fn with_headers<K, I>(mut self, headers: I) -> Result<Self>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, HeaderInput)>,
    {
        let mut entries: Vec<(K, HeaderInput)> = headers.into_iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.as_ref().cmp(b.as_ref()));

        for (name, input) in entries {
            let name = HeaderName::from_bytes(name.as_ref().as_bytes())?;
            for value in input.into_values() {
                self.headers
                    .push((name.clone(), HeaderValue::from_str(&value)?));
            }
        }

        Ok(self)
    }

    /// Sets the payload limit forwarded to the connection.
    pub fn with_max_payload_size(self, size: usize) -> Self {
        Self {
            max_payload_size: Some(size),
            ..self
        }
    }

    /// Sets the fragment limit forwarded to the connection.
    pub fn with_max_fragments(self, count: usize) -> Self {
        Self {
            max_fragments: Some(count),
            ..self
        }
    }

    /// Enables proxy discovery through the `*_proxy` environment variables.
    pub fn with_env_proxy(self) -> Self {
        Self {
            use_env_proxy: true,
            ..self
        }
    }

    /// Bounds the opening handshake, measured from the moment the socket is connected.
    pub fn with_handshake_timeout(self, timeout: Duration) -> Self {
        Self {
            handshake_timeout: Some(timeout),
            ..self
        }
    }
}

/// One or several values configured under a single header name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderInput {
    One(String),
    Many(Vec<String>),
}

impl HeaderInput {
    fn into_values(self) -> Vec<String> {
        match self {
            HeaderInput::One(value) => vec![value],
            HeaderInput::Many(values) => values,
        }
    }
}

impl From<&str> for HeaderInput {
    fn from(value: &str) -> Self {
        HeaderInput::One(value.to_owned())
    }
}

impl From<String> for HeaderInput {
    fn from(value: String) -> Self {
        HeaderInput::One(value)
    }
}

impl<S: Into<String>> From<Vec<S>> for HeaderInput {
    fn from(values: Vec<S>) -> Self {
        HeaderInput::Many(values.into_iter().map(Into::into).collect())
    }
}

/// Normalized, deduplicated list of subprotocol names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subprotocols(Vec<String>);

impl<S: Into<String>> FromIterator<S> for Subprotocols {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut names: Vec<String> = Vec::new();
        for name in iter {
            let name = name.into();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Self(names)
    }
}

impl From<&str> for Subprotocols {
    fn from(value: &str) -> Self {
        std::iter::once(value).collect()
    }
}

impl From<String> for Subprotocols {
    fn from(value: String) -> Self {
        std::iter::once(value).collect()
    }
}

impl<S: Into<String>> From<Vec<S>> for Subprotocols {
    fn from(values: Vec<S>) -> Self {
        values.into_iter().collect()
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for Subprotocols {
    fn from(values: [S; N]) -> Self {
        values.into_iter().collect()
    }
}
