//! In-process byte pipe
//!
//! Bounded single-producer/single-consumer byte queue backing a channel's
//! inbound side when no external forward target was configured. Writes
//! wait while the pipe is full, so a consumer that stops reading pushes
//! back on inbound delivery exactly like a slow socket would.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// Create a pipe buffering at most `capacity` bytes
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (writer, reader) = tokio::io::duplex(capacity.max(1));
    (PipeWriter { inner: writer }, PipeReader { inner: reader })
}

/// Producing end, installed as the channel's forward target
#[derive(Debug)]
pub struct PipeWriter {
    inner: DuplexStream,
}

/// Consuming end, handed out to whoever reads the channel as a stream
#[derive(Debug)]
pub struct PipeReader {
    inner: DuplexStream,
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pipe_preserves_order_and_eof() {
        let (mut writer, mut reader) = pipe(16);

        let producer = tokio::spawn(async move {
            for chunk in [&b"hello "[..], b"pipe ", b"world"] {
                writer.write_all(chunk).await.unwrap();
            }
            writer.shutdown().await.unwrap();
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        producer.await.unwrap();
        assert_eq!(out, b"hello pipe world");
    }

    #[tokio::test]
    async fn test_full_pipe_blocks_writer() {
        let (mut writer, mut reader) = pipe(4);

        let write = tokio::spawn(async move {
            writer.write_all(b"12345678").await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!write.is_finished());

        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf).await.unwrap();
        write.await.unwrap();
        assert_eq!(&buf, b"12345678");
    }
}
