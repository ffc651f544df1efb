use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::stream::MaybeTlsStream;

/// An upgraded WebSocket connection, as returned by [`Connector::connect`](crate::Connector::connect).
///
/// The connection owns the socket once the opening handshake is complete. Reading yields the raw
/// WebSocket byte stream, starting with any bytes the server sent right behind its handshake
/// response. Writing sends raw bytes; as a client, every frame written must be masked.
///
/// # Example
/// ```no_run
/// use tokio::io::AsyncWriteExt;
/// use wsdial::Connector;
///
/// async fn send_raw() -> anyhow::Result<()> {
///     let mut conn = Connector::default().connect("ws://localhost:9001/").await?;
///     assert!(conn.is_masked());
///
///     // masked, empty close frame
///     conn.write_all(&[0x88, 0x80, 0, 0, 0, 0]).await?;
///     conn.close().await?;
///     Ok(())
/// }
/// ```
#[pin_project]
#[derive(Debug)]
pub struct Connection {
    #[pin]
    stream: MaybeTlsStream,
    /// Bytes received after the handshake response, served before the socket is read again.
    read_buf: Bytes,
    masked: bool,
    subprotocol: Option<String>,
    max_payload_size: Option<usize>,
    max_fragments: Option<usize>,
}

impl Connection {
    pub(crate) fn new(
        stream: MaybeTlsStream,
        read_buf: Bytes,
        subprotocol: Option<String>,
        max_payload_size: Option<usize>,
        max_fragments: Option<usize>,
    ) -> Self {
        Self {
            stream,
            read_buf,
            masked: true,
            subprotocol,
            max_payload_size,
            max_fragments,
        }
    }

    /// The subprotocol the server selected, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Whether outgoing frames are masked. Always `true` for client connections.
    pub fn is_masked(&self) -> bool {
        self.masked
    }

    /// Payload limit configured on the [`ClientConfig`](crate::ClientConfig).
    pub fn max_payload_size(&self) -> Option<usize> {
        self.max_payload_size
    }

    /// Fragment limit configured on the [`ClientConfig`](crate::ClientConfig).
    pub fn max_fragments(&self) -> Option<usize> {
        self.max_fragments
    }

    /// The underlying socket.
    pub fn get_ref(&self) -> &MaybeTlsStream {
        &self.stream
    }

    /// Releases the socket together with the bytes already read past the handshake.
    pub fn into_parts(self) -> (MaybeTlsStream, Bytes) {
        (self.stream, self.read_buf)
    }

    /// Shuts the socket down without a closing handshake.
    pub async fn close(mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if this.read_buf.has_remaining() {
            let len = this.read_buf.len().min(buf.remaining());
            buf.put_slice(&this.read_buf[..len]);
            this.read_buf.advance(len);
            return Poll::Ready(Ok(()));
        }

        this.stream.poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }
}
