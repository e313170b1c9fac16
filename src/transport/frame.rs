//! Length-prefixed framing with optional packet protection.
//!
//! Each frame is `u32 BE length || body`. Until keys are installed the body
//! is a plaintext message; afterwards it is an AEAD ciphertext.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::crypto::{PacketProtection, TAG_LEN};
use super::message::Message;
use super::{TransportError, TransportResult};

/// Largest frame body accepted or produced.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Reading half of a transport connection.
pub struct FrameReader<R> {
    inner: R,
    protection: Option<PacketProtection>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            protection: None,
        }
    }

    /// Decrypt every following frame.
    pub fn protect(&mut self, protection: PacketProtection) {
        self.protection = Some(protection);
    }

    /// Read one frame body, decrypted if keys are installed.
    pub async fn read_frame(&mut self) -> TransportResult<Vec<u8>> {
        let len = match self.inner.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Closed)
            }
            Err(e) => return Err(e.into()),
        };
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(len));
        }

        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                TransportError::Closed
            } else {
                e.into()
            }
        })?;

        match &mut self.protection {
            Some(protection) => protection.open(&body),
            None => Ok(body),
        }
    }

    pub async fn read_message(&mut self) -> TransportResult<Message> {
        let body = self.read_frame().await?;
        Message::decode(&body)
    }
}

/// Writing half of a transport connection.
pub struct FrameWriter<W> {
    inner: W,
    protection: Option<PacketProtection>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            protection: None,
        }
    }

    /// Encrypt every following frame.
    pub fn protect(&mut self, protection: PacketProtection) {
        self.protection = Some(protection);
    }

    /// Write one frame, encrypting the body if keys are installed.
    ///
    /// Oversized bodies are refused before sealing so they do not consume a
    /// sequence number.
    pub async fn write_frame(&mut self, body: &[u8]) -> TransportResult<()> {
        let framed_len = match self.protection {
            Some(_) => body.len() + TAG_LEN,
            None => body.len(),
        };
        if framed_len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(framed_len));
        }

        let sealed;
        let body = match &mut self.protection {
            Some(protection) => {
                sealed = protection.seal(body)?;
                &sealed[..]
            }
            None => body,
        };

        self.inner.write_u32(body.len() as u32).await?;
        self.inner.write_all(body).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_message(&mut self, message: &Message) -> TransportResult<()> {
        self.write_frame(&message.encode()).await
    }

    pub async fn shutdown(&mut self) -> TransportResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Drain `outbound` into `writer` until every sender is gone or a
/// `disconnect` has been written, then shut the stream down.
pub async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let last = matches!(message, Message::Disconnect { .. });
        if let Err(e) = writer.write_message(&message).await {
            debug!("Write failed: {}", e);
            break;
        }
        if last {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CipherAlgorithm;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_plain_frame() {
        let message = Message::ChannelClose { channel: 1 };
        let body = message.encode();
        let mock = Builder::new()
            .read(&(body.len() as u32).to_be_bytes())
            .read(&body)
            .build();

        let mut reader = FrameReader::new(mock);
        assert_eq!(reader.read_message().await.unwrap(), message);
        assert!(matches!(
            reader.read_message().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_write_plain_frame() {
        let message = Message::Disconnect {
            reason: "bye".to_string(),
        };
        let body = message.encode();
        let mock = Builder::new()
            .write(&(body.len() as u32).to_be_bytes())
            .write(&body)
            .build();

        let mut writer = FrameWriter::new(mock);
        writer.write_message(&message).await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_refused() {
        let mock = Builder::new()
            .read(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .build();
        let mut reader = FrameReader::new(mock);
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_closed() {
        let mock = Builder::new().read(&[0, 0, 0, 10]).read(b"short").build();
        let mut reader = FrameReader::new(mock);
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_protected_frames() {
        let (client, server) = tokio::io::duplex(4096);
        let key = [4u8; 32];

        let mut writer = FrameWriter::new(client);
        writer.protect(PacketProtection::new(CipherAlgorithm::ChaCha20Poly1305, &key));
        let mut reader = FrameReader::new(server);
        reader.protect(PacketProtection::new(CipherAlgorithm::ChaCha20Poly1305, &key));

        let first = Message::ChannelOpen {
            channel: 0,
            kind: "session".to_string(),
        };
        let second = Message::ChannelEof { channel: 0 };
        writer.write_message(&first).await.unwrap();
        writer.write_message(&second).await.unwrap();

        assert_eq!(reader.read_message().await.unwrap(), first);
        assert_eq!(reader.read_message().await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_oversized_protected_write_keeps_sequence() {
        let (client, server) = tokio::io::duplex(4096);
        let key = [7u8; 32];

        let mut writer = FrameWriter::new(client);
        writer.protect(PacketProtection::new(CipherAlgorithm::ChaCha20Poly1305, &key));
        let mut reader = FrameReader::new(server);
        reader.protect(PacketProtection::new(CipherAlgorithm::ChaCha20Poly1305, &key));

        // Fits unsealed, but not once the tag is added.
        let body = vec![0u8; MAX_FRAME_LEN - TAG_LEN + 1];
        assert!(matches!(
            writer.write_frame(&body).await,
            Err(TransportError::FrameTooLarge(len)) if len == MAX_FRAME_LEN + 1
        ));

        let message = Message::ChannelClose { channel: 3 };
        writer.write_message(&message).await.unwrap();
        assert_eq!(reader.read_message().await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let (client, server) = tokio::io::duplex(4096);

        let mut writer = FrameWriter::new(client);
        writer.protect(PacketProtection::new(CipherAlgorithm::Aes256Gcm, &[1u8; 32]));
        let mut reader = FrameReader::new(server);
        reader.protect(PacketProtection::new(CipherAlgorithm::Aes256Gcm, &[2u8; 32]));

        writer
            .write_message(&Message::ChannelEof { channel: 0 })
            .await
            .unwrap();
        assert!(matches!(
            reader.read_message().await,
            Err(TransportError::Crypto(_))
        ));
    }
}
