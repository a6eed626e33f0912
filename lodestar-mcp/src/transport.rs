//! Message transports for [`crate::McpServer::run`].
//!
//! - [`LineTransport`]: newline-delimited JSON over any async reader/writer
//!   pair; [`StdioTransport`] is the stdin/stdout instance
//! - [`ChannelTransport`]: in-process mpsc queues, used by tests and embedders
//!
//! The HTTP transports answer per request instead and live in [`crate::http`].

use async_trait::async_trait;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, Stdin, Stdout,
};
use tokio::sync::mpsc;

use crate::error::McpError;

/// Moves framed JSON-RPC messages between the server and one client.
///
/// `read_message` is polled inside `tokio::select!` next to the outbound
/// queue, so it must not lose data when its future is dropped.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The next message, or `Ok(None)` once the client has hung up.
    async fn read_message(&mut self) -> Result<Option<String>, McpError>;

    /// Send one message and flush it.
    async fn write_message(&mut self, message: &str) -> Result<(), McpError>;

    async fn close(&mut self) -> Result<(), McpError>;
}

/// One JSON-RPC message per line.
pub struct LineTransport<R, W> {
    lines: Lines<BufReader<R>>,
    writer: W,
}

/// Newline-delimited JSON-RPC on stdin/stdout. Logs must stay on stderr.
pub type StdioTransport = LineTransport<Stdin, Stdout>;

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn from_parts(reader: R, writer: W) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }
}

impl LineTransport<Stdin, Stdout> {
    pub fn new() -> Self {
        Self::from_parts(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for LineTransport<Stdin, Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send + Sync,
    W: AsyncWrite + Unpin + Send + Sync,
{
    async fn read_message(&mut self) -> Result<Option<String>, McpError> {
        // `next_line` keeps a partial line buffered if this future is dropped.
        match self.lines.next_line().await? {
            Some(line) => Ok(Some(line.trim_end_matches('\r').to_string())),
            None => Ok(None),
        }
    }

    async fn write_message(&mut self, message: &str) -> Result<(), McpError> {
        if message.contains('\n') {
            return Err(McpError::TransportError {
                message: "message contains a newline and cannot be line framed".to_string(),
            });
        }
        let mut frame = Vec::with_capacity(message.len() + 1);
        frame.extend_from_slice(message.as_bytes());
        frame.push(b'\n');
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), McpError> {
        self.writer.flush().await?;
        Ok(())
    }
}

/// Transport over a pair of mpsc queues.
pub struct ChannelTransport {
    inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<String>,
}

impl ChannelTransport {
    pub fn new(inbound: mpsc::Receiver<String>, outbound: mpsc::Sender<String>) -> Self {
        Self { inbound, outbound }
    }

    /// Two connected ends: what one writes, the other reads.
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::channel(buffer);
        let (right_tx, left_rx) = mpsc::channel(buffer);
        (Self::new(left_rx, left_tx), Self::new(right_rx, right_tx))
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn read_message(&mut self) -> Result<Option<String>, McpError> {
        Ok(self.inbound.recv().await)
    }

    async fn write_message(&mut self, message: &str) -> Result<(), McpError> {
        self.outbound
            .send(message.to_owned())
            .await
            .map_err(|_| McpError::TransportError {
                message: "peer hung up".to_string(),
            })
    }

    async fn close(&mut self) -> Result<(), McpError> {
        self.inbound.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn test_channel_pair_is_bidirectional() {
        let (mut a, mut b) = ChannelTransport::pair(4);
        a.write_message("hello").await.unwrap();
        assert_eq!(b.read_message().await.unwrap().as_deref(), Some("hello"));
        b.write_message("world").await.unwrap();
        assert_eq!(a.read_message().await.unwrap().as_deref(), Some("world"));
    }

    #[tokio::test]
    async fn test_channel_eof_when_peer_dropped() {
        let (mut a, b) = ChannelTransport::pair(4);
        drop(b);
        assert!(a.read_message().await.unwrap().is_none());
        let err = a.write_message("x").await.unwrap_err();
        assert_eq!(err.error_code(), -32002);
    }

    #[tokio::test]
    async fn test_line_transport_frames_messages() {
        let (mut client_in, server_in) = duplex(256);
        let (server_out, mut client_out) = duplex(256);
        let mut transport = LineTransport::from_parts(server_in, server_out);

        client_in
            .write_all(b"{\"id\":1}\r\n{\"id\":2}\n")
            .await
            .unwrap();
        drop(client_in);
        assert_eq!(transport.read_message().await.unwrap().as_deref(), Some("{\"id\":1}"));
        assert_eq!(transport.read_message().await.unwrap().as_deref(), Some("{\"id\":2}"));
        assert!(transport.read_message().await.unwrap().is_none());

        transport.write_message("{\"ok\":true}").await.unwrap();
        transport.close().await.unwrap();
        drop(transport);
        let mut written = String::new();
        client_out.read_to_string(&mut written).await.unwrap();
        assert_eq!(written, "{\"ok\":true}\n");
    }

    #[tokio::test]
    async fn test_line_transport_rejects_embedded_newline() {
        let (_client, server_in) = duplex(64);
        let (server_out, _reader) = duplex(64);
        let mut transport = LineTransport::from_parts(server_in, server_out);
        let err = transport.write_message("a\nb").await.unwrap_err();
        assert_eq!(err.error_code(), -32002);
    }
}
