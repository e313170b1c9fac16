//! Transport message set.
//!
//! Every message body is a one-byte code followed by its fields packed with
//! the wire codec. Integers travel as 4-byte big-endian elements and flags
//! as single-byte elements.

use bytes::{BufMut, Bytes, BytesMut};

use super::{TransportError, TransportResult};
use crate::wire::{pack, unpack};

pub const HELLO: u8 = 1;
pub const HELLO_REPLY: u8 = 2;
pub const AUTH: u8 = 3;
pub const AUTH_ACCEPTED: u8 = 4;
pub const AUTH_REJECTED: u8 = 5;
pub const GLOBAL_REQUEST: u8 = 10;
pub const CHANNEL_OPEN: u8 = 20;
pub const CHANNEL_OPEN_CONFIRM: u8 = 21;
pub const CHANNEL_OPEN_FAILURE: u8 = 22;
pub const CHANNEL_REQUEST: u8 = 23;
pub const CHANNEL_SUCCESS: u8 = 24;
pub const CHANNEL_FAILURE: u8 = 25;
pub const CHANNEL_DATA: u8 = 26;
pub const CHANNEL_EOF: u8 = 27;
pub const CHANNEL_CLOSE: u8 = 28;
pub const DISCONNECT: u8 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello {
        version: String,
        ciphers: String,
        macs: String,
        ephemeral_key: Bytes,
    },
    HelloReply {
        version: String,
        cipher: String,
        mac: String,
        ephemeral_key: Bytes,
        host_key: Bytes,
        signature: Bytes,
    },
    Auth {
        principal: String,
        public_key: Bytes,
        signature: Bytes,
        finished: Bytes,
    },
    AuthAccepted {
        finished: Bytes,
    },
    AuthRejected,
    GlobalRequest {
        name: String,
        want_reply: bool,
        payload: Bytes,
    },
    ChannelOpen {
        channel: u32,
        kind: String,
    },
    ChannelOpenConfirm {
        channel: u32,
    },
    ChannelOpenFailure {
        channel: u32,
        reason: String,
    },
    ChannelRequest {
        channel: u32,
        kind: String,
        want_reply: bool,
        payload: Bytes,
    },
    ChannelSuccess {
        channel: u32,
    },
    ChannelFailure {
        channel: u32,
    },
    ChannelData {
        channel: u32,
        data: Bytes,
    },
    ChannelEof {
        channel: u32,
    },
    ChannelClose {
        channel: u32,
    },
    Disconnect {
        reason: String,
    },
}

fn u32_field(value: u32) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

fn bool_field(value: bool) -> Bytes {
    Bytes::copy_from_slice(&[u8::from(value)])
}

fn str_field(value: &str) -> Bytes {
    Bytes::copy_from_slice(value.as_bytes())
}

impl Message {
    pub fn code(&self) -> u8 {
        match self {
            Message::Hello { .. } => HELLO,
            Message::HelloReply { .. } => HELLO_REPLY,
            Message::Auth { .. } => AUTH,
            Message::AuthAccepted { .. } => AUTH_ACCEPTED,
            Message::AuthRejected => AUTH_REJECTED,
            Message::GlobalRequest { .. } => GLOBAL_REQUEST,
            Message::ChannelOpen { .. } => CHANNEL_OPEN,
            Message::ChannelOpenConfirm { .. } => CHANNEL_OPEN_CONFIRM,
            Message::ChannelOpenFailure { .. } => CHANNEL_OPEN_FAILURE,
            Message::ChannelRequest { .. } => CHANNEL_REQUEST,
            Message::ChannelSuccess { .. } => CHANNEL_SUCCESS,
            Message::ChannelFailure { .. } => CHANNEL_FAILURE,
            Message::ChannelData { .. } => CHANNEL_DATA,
            Message::ChannelEof { .. } => CHANNEL_EOF,
            Message::ChannelClose { .. } => CHANNEL_CLOSE,
            Message::Disconnect { .. } => DISCONNECT,
        }
    }

    /// Channel the message belongs to, if any.
    pub fn channel(&self) -> Option<u32> {
        match self {
            Message::ChannelOpen { channel, .. }
            | Message::ChannelOpenConfirm { channel }
            | Message::ChannelOpenFailure { channel, .. }
            | Message::ChannelRequest { channel, .. }
            | Message::ChannelSuccess { channel }
            | Message::ChannelFailure { channel }
            | Message::ChannelData { channel, .. }
            | Message::ChannelEof { channel }
            | Message::ChannelClose { channel } => Some(*channel),
            _ => None,
        }
    }

    fn fields(&self) -> Vec<Bytes> {
        match self {
            Message::Hello {
                version,
                ciphers,
                macs,
                ephemeral_key,
            } => vec![
                str_field(version),
                str_field(ciphers),
                str_field(macs),
                ephemeral_key.clone(),
            ],
            Message::HelloReply {
                version,
                cipher,
                mac,
                ephemeral_key,
                host_key,
                signature,
            } => vec![
                str_field(version),
                str_field(cipher),
                str_field(mac),
                ephemeral_key.clone(),
                host_key.clone(),
                signature.clone(),
            ],
            Message::Auth {
                principal,
                public_key,
                signature,
                finished,
            } => vec![
                str_field(principal),
                public_key.clone(),
                signature.clone(),
                finished.clone(),
            ],
            Message::AuthAccepted { finished } => vec![finished.clone()],
            Message::AuthRejected => Vec::new(),
            Message::GlobalRequest {
                name,
                want_reply,
                payload,
            } => vec![str_field(name), bool_field(*want_reply), payload.clone()],
            Message::ChannelOpen { channel, kind } => vec![u32_field(*channel), str_field(kind)],
            Message::ChannelOpenFailure { channel, reason } => {
                vec![u32_field(*channel), str_field(reason)]
            }
            Message::ChannelRequest {
                channel,
                kind,
                want_reply,
                payload,
            } => vec![
                u32_field(*channel),
                str_field(kind),
                bool_field(*want_reply),
                payload.clone(),
            ],
            Message::ChannelData { channel, data } => vec![u32_field(*channel), data.clone()],
            Message::ChannelOpenConfirm { channel }
            | Message::ChannelSuccess { channel }
            | Message::ChannelFailure { channel }
            | Message::ChannelEof { channel }
            | Message::ChannelClose { channel } => vec![u32_field(*channel)],
            Message::Disconnect { reason } => vec![str_field(reason)],
        }
    }

    pub fn encode(&self) -> Bytes {
        let fields = pack(self.fields());
        let mut buf = BytesMut::with_capacity(1 + fields.len());
        buf.put_u8(self.code());
        buf.extend_from_slice(&fields);
        buf.freeze()
    }

    pub fn decode(body: &[u8]) -> TransportResult<Self> {
        let (&code, rest) = body
            .split_first()
            .ok_or_else(|| TransportError::Protocol("empty message".to_string()))?;
        let mut fields = Fields::new(code, unpack(rest)?);

        let message = match code {
            HELLO => Message::Hello {
                version: fields.string()?,
                ciphers: fields.string()?,
                macs: fields.string()?,
                ephemeral_key: fields.bytes()?,
            },
            HELLO_REPLY => Message::HelloReply {
                version: fields.string()?,
                cipher: fields.string()?,
                mac: fields.string()?,
                ephemeral_key: fields.bytes()?,
                host_key: fields.bytes()?,
                signature: fields.bytes()?,
            },
            AUTH => Message::Auth {
                principal: fields.string()?,
                public_key: fields.bytes()?,
                signature: fields.bytes()?,
                finished: fields.bytes()?,
            },
            AUTH_ACCEPTED => Message::AuthAccepted {
                finished: fields.bytes()?,
            },
            AUTH_REJECTED => Message::AuthRejected,
            GLOBAL_REQUEST => Message::GlobalRequest {
                name: fields.string()?,
                want_reply: fields.flag()?,
                payload: fields.bytes()?,
            },
            CHANNEL_OPEN => Message::ChannelOpen {
                channel: fields.number()?,
                kind: fields.string()?,
            },
            CHANNEL_OPEN_CONFIRM => Message::ChannelOpenConfirm {
                channel: fields.number()?,
            },
            CHANNEL_OPEN_FAILURE => Message::ChannelOpenFailure {
                channel: fields.number()?,
                reason: fields.string()?,
            },
            CHANNEL_REQUEST => Message::ChannelRequest {
                channel: fields.number()?,
                kind: fields.string()?,
                want_reply: fields.flag()?,
                payload: fields.bytes()?,
            },
            CHANNEL_SUCCESS => Message::ChannelSuccess {
                channel: fields.number()?,
            },
            CHANNEL_FAILURE => Message::ChannelFailure {
                channel: fields.number()?,
            },
            CHANNEL_DATA => Message::ChannelData {
                channel: fields.number()?,
                data: fields.bytes()?,
            },
            CHANNEL_EOF => Message::ChannelEof {
                channel: fields.number()?,
            },
            CHANNEL_CLOSE => Message::ChannelClose {
                channel: fields.number()?,
            },
            DISCONNECT => Message::Disconnect {
                reason: fields.string()?,
            },
            other => {
                return Err(TransportError::Protocol(format!(
                    "unknown message code {}",
                    other
                )))
            }
        };

        fields.finish()?;
        Ok(message)
    }
}

/// Cursor over the decoded fields of one message.
struct Fields {
    code: u8,
    items: std::vec::IntoIter<Bytes>,
}

impl Fields {
    fn new(code: u8, items: Vec<Bytes>) -> Self {
        Self {
            code,
            items: items.into_iter(),
        }
    }

    fn error(&self, what: &str) -> TransportError {
        TransportError::Protocol(format!("message {}: {}", self.code, what))
    }

    fn bytes(&mut self) -> TransportResult<Bytes> {
        self.items.next().ok_or_else(|| self.error("missing field"))
    }

    fn string(&mut self) -> TransportResult<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.error("field is not UTF-8"))
    }

    fn number(&mut self) -> TransportResult<u32> {
        let bytes = self.bytes()?;
        let arr: [u8; 4] = bytes
            .as_ref()
            .try_into()
            .map_err(|_| self.error("number field is not 4 bytes"))?;
        Ok(u32::from_be_bytes(arr))
    }

    fn flag(&mut self) -> TransportResult<bool> {
        match self.bytes()?.as_ref() {
            [0] => Ok(false),
            [1] => Ok(true),
            _ => Err(self.error("invalid flag")),
        }
    }

    fn finish(mut self) -> TransportResult<()> {
        match self.items.next() {
            None => Ok(()),
            Some(_) => Err(self.error("unexpected trailing field")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Message> {
        vec![
            Message::Hello {
                version: "stockroom/1".to_string(),
                ciphers: "aes256-gcm".to_string(),
                macs: "hmac-sha512".to_string(),
                ephemeral_key: Bytes::from_static(&[1u8; 32]),
            },
            Message::AuthRejected,
            Message::GlobalRequest {
                name: "keepalive".to_string(),
                want_reply: true,
                payload: Bytes::new(),
            },
            Message::ChannelRequest {
                channel: 7,
                kind: "exec".to_string(),
                want_reply: false,
                payload: pack(["env"]),
            },
            Message::ChannelData {
                channel: u32::MAX,
                data: Bytes::from_static(b"A=1\n"),
            },
            Message::ChannelClose { channel: 0 },
        ]
    }

    #[test]
    fn test_encode_decode() {
        for message in samples() {
            let encoded = message.encode();
            assert_eq!(encoded[0], message.code());
            assert_eq!(Message::decode(&encoded).unwrap(), message);
        }
    }

    #[test]
    fn test_channel_layout() {
        let encoded = Message::ChannelEof { channel: 258 }.encode();
        assert_eq!(&encoded[..], &[CHANNEL_EOF, 0, 0, 0, 4, 0, 0, 1, 2]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Message::decode(&[]).is_err());
        assert!(Message::decode(&[99]).is_err());

        // Missing field
        let mut body = vec![CHANNEL_OPEN];
        body.extend_from_slice(&pack([&[0u8, 0, 0, 1][..]]));
        assert!(matches!(
            Message::decode(&body),
            Err(TransportError::Protocol(_))
        ));

        // Trailing field
        let mut body = vec![CHANNEL_CLOSE];
        body.extend_from_slice(&pack([&[0u8, 0, 0, 1][..], &b"extra"[..]]));
        assert!(Message::decode(&body).is_err());

        // Truncated packing
        let mut body = vec![CHANNEL_CLOSE];
        body.extend_from_slice(&[0, 0, 0, 9, 1]);
        assert!(matches!(
            Message::decode(&body),
            Err(TransportError::Codec(_))
        ));

        // Bad flag
        let mut body = vec![GLOBAL_REQUEST];
        body.extend_from_slice(&pack([&b"x"[..], &[2u8][..], &b""[..]]));
        assert!(Message::decode(&body).is_err());
    }

    #[test]
    fn test_channel_accessor() {
        assert_eq!(Message::ChannelSuccess { channel: 3 }.channel(), Some(3));
        assert_eq!(Message::AuthRejected.channel(), None);
    }
}
