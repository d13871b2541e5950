//! Stream transport for LAN instruments
//!
//! Most LAN instruments accept SCPI on a raw TCP socket (port 5025 by
//! convention). [`StreamTransport`] wraps any tokio byte stream, so the same
//! code serves real sockets and in-memory test streams.

use super::Transport;
use crate::error::{AppResult, LabError};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Transport over an async byte stream.
pub struct StreamTransport<S> {
    stream: Option<S>,
    peer: String,
}

/// Raw SCPI socket.
pub type TcpTransport = StreamTransport<TcpStream>;

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already connected stream.
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            peer: peer.into(),
        }
    }

    fn stream(&mut self) -> AppResult<&mut S> {
        let peer = &self.peer;
        self.stream
            .as_mut()
            .ok_or_else(|| LabError::NotConnected(peer.clone()))
    }
}

impl StreamTransport<TcpStream> {
    /// Connect to `host:port`, giving up after `timeout`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> AppResult<Self> {
        let peer = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| LabError::timeout(format!("connecting to {}", peer), timeout))?
            .map_err(|e| LabError::Transport(format!("Failed to connect to {}: {}", peer, e)))?;
        stream.set_nodelay(true)?;

        debug!(peer = %peer, "TCP connection established");
        Ok(Self::new(stream, peer))
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        let stream = self.stream()?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_bytes(&mut self, max_len: usize, timeout: Duration) -> AppResult<Vec<u8>> {
        let peer = self.peer.clone();
        let stream = self.stream()?;
        let mut buf = vec![0u8; max_len.max(1)];

        let n = tokio::time::timeout(timeout, stream.read(&mut buf))
            .await
            .map_err(|_| LabError::timeout(format!("reading from {}", peer), timeout))??;
        if n == 0 {
            return Err(LabError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} closed the connection", peer),
            )));
        }

        buf.truncate(n);
        Ok(buf)
    }

    async fn close(&mut self) -> AppResult<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
            debug!(peer = %self.peer, "Stream closed");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.peer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_write_then_read() {
        let mock = Builder::new()
            .write(b"*IDN?\n")
            .read(b"ACME,PSU-1,123,1.0\n")
            .build();
        let mut transport = StreamTransport::new(mock, "mock");

        transport.write_bytes(b"*IDN?\n").await.unwrap();
        let reply = transport
            .read_bytes(64, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(reply, b"ACME,PSU-1,123,1.0\n".to_vec());
    }

    #[tokio::test]
    async fn test_peer_close_is_io_error() {
        let mock = Builder::new().build();
        let mut transport = StreamTransport::new(mock, "mock");

        let err = transport
            .read_bytes(16, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Io(_)));
    }

    #[tokio::test]
    async fn test_io_after_close() {
        let mock = Builder::new().build();
        let mut transport = StreamTransport::new(mock, "mock");
        transport.close().await.unwrap();

        let err = transport.write_bytes(b"*RST\n").await.unwrap_err();
        assert!(matches!(err, LabError::NotConnected(_)));
    }
}
