//! Logical bidirectional stream inside a session

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::frame::{Frame, StreamId};
use crate::session::Shared;

/// One logical stream; corresponds one-to-one with a user connection.
///
/// Reading yields bytes the peer sent; EOF once the stream or session is
/// closed. Writing enqueues data frames on the session. Dropping the
/// stream closes it and releases its slot in the session's stream table.
pub struct MuxStream {
    stream_id: StreamId,
    name: String,
    shared: Arc<Shared>,
    rx: mpsc::Receiver<Bytes>,
    read_buf: BytesMut,
    write_closed: bool,
}

impl MuxStream {
    pub(crate) fn new(
        stream_id: StreamId,
        name: String,
        shared: Arc<Shared>,
        rx: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            stream_id,
            name,
            shared,
            rx,
            read_buf: BytesMut::new(),
            write_closed: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Name the stream was opened with; routes it on the client side
    pub fn name(&self) -> &str {
        &self.name
    }

    fn close_inner(&mut self) {
        if !self.write_closed {
            self.write_closed = true;
            self.shared.streams.lock().unwrap().remove(&self.stream_id);
            let _ = self.shared.write_tx.send(Frame::close(self.stream_id));
        }
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "mux stream closed")
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = std::cmp::min(this.read_buf.len(), buf.remaining());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(data)) => this.read_buf.extend_from_slice(&data),
                // Sender gone: stream or session closed, surface EOF
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed || this.shared.is_closed() {
            return Poll::Ready(Err(broken_pipe()));
        }

        let n = std::cmp::min(data.len(), this.shared.config.max_frame_size);
        let frame = Frame::data(this.stream_id, Bytes::copy_from_slice(&data[..n]));
        this.shared
            .write_tx
            .send(frame)
            .map_err(|_| broken_pipe())?;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().close_inner();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.close_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MuxConfig, MuxSession};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_write_after_shutdown_fails() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = MuxSession::client(a, MuxConfig::default());
        let _server = MuxSession::server(b, MuxConfig::default());

        let mut stream = client.open_stream("w").unwrap();
        stream.shutdown().await.unwrap();
        assert!(stream.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let client = MuxSession::client(a, MuxConfig::default());
        let server = MuxSession::server(b, MuxConfig::default());

        let payload = vec![0xA5u8; 200 * 1024];

        let mut opened = client.open_stream("bulk").unwrap();
        let send = payload.clone();
        tokio::spawn(async move {
            opened.write_all(&send).await.unwrap();
        });

        let mut accepted = server.accept_stream().await.unwrap();
        let mut received = vec![0u8; payload.len()];
        timeout(Duration::from_secs(5), accepted.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_read_drains_buffer_before_eof() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = MuxSession::client(a, MuxConfig::default());
        let server = MuxSession::server(b, MuxConfig::default());

        let mut opened = client.open_stream("d").unwrap();
        opened.write_all(b"tail bytes").await.unwrap();

        let mut accepted = server.accept_stream().await.unwrap();
        drop(opened);

        let mut buf = Vec::new();
        accepted.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"tail bytes");
    }
}
