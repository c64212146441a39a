//! Encrypted transport wrapper
//!
//! Wraps a pipe connection in per-frame ChaCha20-Poly1305. Wire format is
//! `[u32 BE ciphertext length][ciphertext ‖ tag]` with counter nonces.
//! The two directions use disjoint nonce spaces (a direction byte in the
//! nonce prefix), so both ends can share one session key.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::BytesMut;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};

/// Largest plaintext carried by one cipher frame
const MAX_PLAIN: usize = 16 * 1024;

/// Which end of the connection this wrapper sits on; decides the nonce
/// direction prefixes so the spaces never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn seal_prefix(self) -> u8 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    fn open_prefix(self) -> u8 {
        match self {
            Role::Client => 2,
            Role::Server => 1,
        }
    }
}

fn nonce_for(prefix: u8, counter: u64) -> Nonce {
    let mut bytes = [0u8; NONCE_LEN];
    bytes[0] = prefix;
    bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    Nonce::assume_unique_for_key(bytes)
}

/// Encrypted stream over any async transport
pub struct CipherStream<S> {
    inner: S,
    seal_key: LessSafeKey,
    open_key: LessSafeKey,
    seal_prefix: u8,
    open_prefix: u8,
    seal_counter: u64,
    open_counter: u64,
    // inbound frame in progress
    read_header: [u8; 4],
    read_header_filled: usize,
    read_ciphertext: Vec<u8>,
    read_ciphertext_filled: usize,
    plain: BytesMut,
    // outbound frame not yet fully written to the transport
    pending: Option<Vec<u8>>,
    pending_written: usize,
}

impl<S> CipherStream<S> {
    pub fn new(inner: S, key: &[u8; KEY_LEN], role: Role) -> Result<Self, CryptoError> {
        let seal_key = UnboundKey::new(&CHACHA20_POLY1305, key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let open_key = UnboundKey::new(&CHACHA20_POLY1305, key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            inner,
            seal_key: LessSafeKey::new(seal_key),
            open_key: LessSafeKey::new(open_key),
            seal_prefix: role.seal_prefix(),
            open_prefix: role.open_prefix(),
            seal_counter: 0,
            open_counter: 0,
            read_header: [0u8; 4],
            read_header_filled: 0,
            read_ciphertext: Vec::new(),
            read_ciphertext_filled: 0,
            plain: BytesMut::new(),
            pending: None,
            pending_written: 0,
        })
    }
}

impl<S: AsyncWrite + Unpin> CipherStream<S> {
    /// Drive the partially written outbound frame, if any, into the transport
    fn poll_flush_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            let Some(buf) = self.pending.take() else {
                return Poll::Ready(Ok(()));
            };
            if self.pending_written >= buf.len() {
                self.pending_written = 0;
                continue;
            }
            match Pin::new(&mut self.inner).poll_write(cx, &buf[self.pending_written..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport closed",
                    )))
                }
                Poll::Ready(Ok(n)) => {
                    self.pending_written += n;
                    if self.pending_written == buf.len() {
                        self.pending_written = 0;
                    } else {
                        self.pending = Some(buf);
                    }
                }
                Poll::Ready(Err(err)) => {
                    self.pending = Some(buf);
                    return Poll::Ready(Err(err));
                }
                Poll::Pending => {
                    self.pending = Some(buf);
                    return Poll::Pending;
                }
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.plain.is_empty() {
                let n = std::cmp::min(this.plain.len(), buf.remaining());
                buf.put_slice(&this.plain.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if this.read_header_filled < 4 {
                let mut header_buf = ReadBuf::new(&mut this.read_header[this.read_header_filled..]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut header_buf))?;
                let n = header_buf.filled().len();
                if n == 0 {
                    if this.read_header_filled == 0 {
                        // clean EOF on a frame boundary
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                this.read_header_filled += n;
                if this.read_header_filled == 4 {
                    let length = u32::from_be_bytes(this.read_header) as usize;
                    if length < TAG_LEN || length > MAX_PLAIN + TAG_LEN {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "invalid cipher frame length",
                        )));
                    }
                    this.read_ciphertext = vec![0u8; length];
                    this.read_ciphertext_filled = 0;
                }
                continue;
            }

            let needed = this.read_ciphertext.len();
            let mut ct_buf = ReadBuf::new(&mut this.read_ciphertext[this.read_ciphertext_filled..]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut ct_buf))?;
            let n = ct_buf.filled().len();
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }
            this.read_ciphertext_filled += n;
            if this.read_ciphertext_filled < needed {
                continue;
            }

            let nonce = nonce_for(this.open_prefix, this.open_counter);
            this.open_counter += 1;
            let mut ciphertext = std::mem::take(&mut this.read_ciphertext);
            let plaintext = this
                .open_key
                .open_in_place(nonce, Aad::empty(), &mut ciphertext)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "decryption failed"))?;
            this.plain.extend_from_slice(plaintext);
            this.read_header_filled = 0;
            this.read_ciphertext_filled = 0;
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_flush_pending(cx))?;

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = std::cmp::min(data.len(), MAX_PLAIN);
        let mut sealed = data[..n].to_vec();
        let nonce = nonce_for(this.seal_prefix, this.seal_counter);
        this.seal_counter += 1;
        this.seal_key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut sealed)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "encryption failed"))?;

        let mut frame = Vec::with_capacity(4 + sealed.len());
        frame.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        frame.extend_from_slice(&sealed);
        this.pending = Some(frame);
        this.pending_written = 0;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_pending(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_pending(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive_session_key;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn key() -> [u8; KEY_LEN] {
        derive_session_key(b"pre-master", b"client", b"nonce").unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut client = CipherStream::new(a, &key(), Role::Client).unwrap();
        let mut server = CipherStream::new(b, &key(), Role::Server).unwrap();

        client.write_all(b"over the wire").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 13];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over the wire");

        server.write_all(b"and back").await.unwrap();
        server.flush().await.unwrap();

        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"and back");
    }

    #[tokio::test]
    async fn test_ciphertext_differs_from_plaintext() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let mut client = CipherStream::new(a, &key(), Role::Client).unwrap();

        client.write_all(b"secret payload").await.unwrap();
        client.flush().await.unwrap();
        drop(client);

        let mut raw = Vec::new();
        b.read_to_end(&mut raw).await.unwrap();
        assert!(raw.len() > b"secret payload".len());
        assert!(!raw
            .windows(b"secret payload".len())
            .any(|w| w == b"secret payload"));
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut client = CipherStream::new(a, &key(), Role::Client).unwrap();
        let other_key = derive_session_key(b"other", b"client", b"nonce").unwrap();
        let mut server = CipherStream::new(b, &other_key, Role::Server).unwrap();

        client.write_all(b"payload").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 7];
        let result = server.read_exact(&mut buf).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_large_transfer_chunks() {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut client = CipherStream::new(a, &key(), Role::Client).unwrap();
        let mut server = CipherStream::new(b, &key(), Role::Server).unwrap();

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.flush().await.unwrap();
        });

        let mut received = vec![0u8; expected.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_eof() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = CipherStream::new(a, &key(), Role::Client).unwrap();
        let mut server = CipherStream::new(b, &key(), Role::Server).unwrap();
        drop(client);

        let mut buf = Vec::new();
        let n = server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
