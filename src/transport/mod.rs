//! Secure transport between callers and the server.
//!
//! A connection starts with an X25519 key exchange signed by the server's
//! Ed25519 host key. Both directions are then protected with an AEAD keyed
//! from the exchange, and the caller authenticates with its own Ed25519 key
//! and the fixed principal. Afterwards the connection carries channels:
//! each channel receives typed requests and returns data, replies and an
//! exit status.
//!
//! ## Usage
//!
//! ```ignore
//! let client = Client::connect(addr, ClientConfig::new("stockroom", identity)).await?;
//! let mut session = client.open_session().await?;
//! session.env(&[("GROUP", "prod")]).await?;
//! let output = session.exec("env").await?;
//! ```

pub mod algorithm;
pub mod client;
pub mod crypto;
pub mod frame;
pub mod handshake;
pub mod message;

use thiserror::Error;

use crate::wire::CodecError;

pub use algorithm::{CipherAlgorithm, MacAlgorithm};
pub use client::{Client, ClientConfig, ExecOutput, Session};
pub use frame::{FrameReader, FrameWriter, MAX_FRAME_LEN};
pub use handshake::{Authenticated, ServerHandshake};
pub use message::Message;

/// Protocol version sent in `hello`.
pub const PROTOCOL_VERSION: &str = "stockroom/1";

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Malformed message: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("No common algorithm")]
    NoCommonAlgorithm,

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Channel rejected: {0}")]
    ChannelRejected(String),

    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("Cryptographic error: {0}")]
    Crypto(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
