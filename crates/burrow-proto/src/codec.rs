//! Codec for encoding/decoding protocol messages
//!
//! Wire format: `[length: u32 BE][payload: bincode serialized message]`.

use crate::messages::Message;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol message codec
pub struct MessageCodec;

impl MessageCodec {
    /// Maximum message size (1 MiB); control messages are small
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    /// Encode a message to bytes, length prefix included
    pub fn encode(msg: &Message) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a message from a buffer.
    ///
    /// Returns `Ok(Some(message))` if a complete message was decoded,
    /// `Ok(None)` if more data is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);
        let msg: Message = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }
}

/// Read one framed message from an async reader.
///
/// Blocks until a full frame arrives; EOF mid-frame is an IO error.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes).await?;
    let length = u32::from_be_bytes(length_bytes) as usize;

    if length > MessageCodec::MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(bincode::deserialize(&payload)?)
}

/// Write one framed message to an async writer and flush it
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = MessageCodec::encode(msg)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Protocol, TunnelConfig};
    use std::collections::HashMap;
    use uuid::Uuid;

    #[test]
    fn test_encode_decode() {
        let msg = Message::Ping;

        let encoded = MessageCodec::encode(&msg).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded = MessageCodec::decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_incomplete() {
        let msg = Message::Pong;
        let encoded = MessageCodec::encode(&msg).unwrap();

        // Only the length header
        let mut buf = BytesMut::from(&encoded[..4]);
        let result = MessageCodec::decode(&mut buf).unwrap();
        assert_eq!(result, None);

        // The rest of the message
        buf.extend_from_slice(&encoded[4..]);
        let result = MessageCodec::decode(&mut buf).unwrap();
        assert_eq!(result, Some(msg));
    }

    #[test]
    fn test_add_tunnels_roundtrip() {
        let mut tunnels = HashMap::new();
        tunnels.insert(
            "web".to_string(),
            TunnelConfig {
                protocol: Protocol::Http,
                hostname: "example.com".to_string(),
                subdomain: Some("a1".to_string()),
                local_addr: "127.0.0.1:3000".to_string(),
                remote_port: 80,
            },
        );
        let msg = Message::AddTunnels { tunnels };

        let encoded = MessageCodec::encode(&msg).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());
        let decoded = MessageCodec::decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
    }

    #[tokio::test]
    async fn test_async_read_write() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let msg = Message::PipeClientHello {
            client_id: Uuid::new_v4(),
            nonce: [7u8; crate::PIPE_NONCE_LEN],
        };

        write_message(&mut client, &msg).await.unwrap();
        let read = read_message(&mut server).await.unwrap();
        assert_eq!(read, msg);
    }

    #[tokio::test]
    async fn test_read_eof_mid_frame() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let msg = Message::Ping;
        let encoded = MessageCodec::encode(&msg).unwrap();
        client.write_all(&encoded[..encoded.len() - 1]).await.unwrap();
        drop(client);

        let result = read_message(&mut server).await;
        assert!(matches!(result, Err(CodecError::Io(_))));
    }
}
