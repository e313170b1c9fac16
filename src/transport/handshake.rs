//! Connection handshake.
//!
//! 1. Client `hello`: version, cipher and MAC preferences, ephemeral key.
//! 2. Server `hello-reply`: chosen algorithms, ephemeral key, host key and a
//!    host signature over the transcript hash.
//! 3. Both sides derive packet and finished keys; everything after this
//!    point is encrypted.
//! 4. Client `auth`: principal, public key, signature over
//!    `hash || principal` and a finished tag.
//! 5. Server `auth-accepted` with its own finished tag, or `auth-rejected`.

use std::net::SocketAddr;

use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::algorithm::{join_names, negotiate, split_names};
use super::client::ClientConfig;
use super::crypto::{
    auth_signature_message, parse_ed25519_public_key, verify_signature, EphemeralKeyPair,
    PacketProtection, SessionKeys, Transcript,
};
use super::frame::{FrameReader, FrameWriter};
use super::message::Message;
use super::{CipherAlgorithm, MacAlgorithm, TransportError, TransportResult, PROTOCOL_VERSION};
use crate::auth::{Authorizer, PermissionSet};
use crate::wire::pack;

const NO_COMMON_ALGORITHM: &str = "no common algorithm";

/// Fields of `hello-reply` covered by the host signature.
fn reply_transcript(version: &str, cipher: &str, mac: &str, ephemeral: &[u8], host_key: &[u8]) -> Bytes {
    pack([version.as_bytes(), cipher.as_bytes(), mac.as_bytes(), ephemeral, host_key])
}

/// Outcome of a successful server-side handshake.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub public_key: VerifyingKey,
    pub permissions: PermissionSet,
    pub cipher: CipherAlgorithm,
    pub mac: MacAlgorithm,
}

/// Server side of the handshake.
pub struct ServerHandshake<'a> {
    pub host_key: &'a SigningKey,
    pub principal: &'a str,
    pub ciphers: &'a [CipherAlgorithm],
    pub macs: &'a [MacAlgorithm],
    pub authorizer: &'a dyn Authorizer,
    pub origin: SocketAddr,
}

impl ServerHandshake<'_> {
    pub async fn run<R, W>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> TransportResult<Authenticated>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let hello_body = reader.read_frame().await?;
        let (version, ciphers, macs, client_ephemeral) = match Message::decode(&hello_body)? {
            Message::Hello {
                version,
                ciphers,
                macs,
                ephemeral_key,
            } => (version, ciphers, macs, ephemeral_key),
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected hello, got message {}",
                    other.code()
                )))
            }
        };

        if version != PROTOCOL_VERSION {
            writer
                .write_message(&Message::Disconnect {
                    reason: "unsupported protocol version".to_string(),
                })
                .await?;
            return Err(TransportError::HandshakeFailed(format!(
                "unsupported protocol version {:?}",
                version
            )));
        }

        let cipher = negotiate(&split_names::<CipherAlgorithm>(&ciphers), self.ciphers);
        let mac = negotiate(&split_names::<MacAlgorithm>(&macs), self.macs);
        let (Some(cipher), Some(mac)) = (cipher, mac) else {
            debug!(ciphers = %ciphers, macs = %macs, "No common algorithm with client");
            writer
                .write_message(&Message::Disconnect {
                    reason: NO_COMMON_ALGORITHM.to_string(),
                })
                .await?;
            return Err(TransportError::NoCommonAlgorithm);
        };

        let ephemeral = EphemeralKeyPair::generate();
        let server_ephemeral = ephemeral.public_key_bytes();
        let host_public = self.host_key.verifying_key().to_bytes();

        let mut transcript = Transcript::new();
        transcript.update(&hello_body);
        transcript.update(&reply_transcript(
            PROTOCOL_VERSION,
            cipher.name(),
            mac.name(),
            &server_ephemeral,
            &host_public,
        ));
        let hash = transcript.finish();
        let signature = self.host_key.sign(&hash);

        writer
            .write_message(&Message::HelloReply {
                version: PROTOCOL_VERSION.to_string(),
                cipher: cipher.name().to_string(),
                mac: mac.name().to_string(),
                ephemeral_key: Bytes::copy_from_slice(&server_ephemeral),
                host_key: Bytes::copy_from_slice(&host_public),
                signature: Bytes::copy_from_slice(&signature.to_bytes()),
            })
            .await?;

        let shared = ephemeral.diffie_hellman(&client_ephemeral)?;
        let keys = SessionKeys::derive(&shared[..], &hash);
        reader.protect(PacketProtection::new(cipher, &keys.client_packet));
        writer.protect(PacketProtection::new(cipher, &keys.server_packet));

        match self.authenticate(reader, &keys, mac, &hash).await {
            Ok((public_key, permissions)) => {
                let finished = mac.tag(&keys.server_finished[..], &hash);
                writer
                    .write_message(&Message::AuthAccepted {
                        finished: Bytes::from(finished),
                    })
                    .await?;
                Ok(Authenticated {
                    public_key,
                    permissions,
                    cipher,
                    mac,
                })
            }
            Err(e) => {
                let _ = writer.write_message(&Message::AuthRejected).await;
                Err(e)
            }
        }
    }

    async fn authenticate<R: AsyncRead + Unpin>(
        &self,
        reader: &mut FrameReader<R>,
        keys: &SessionKeys,
        mac: MacAlgorithm,
        hash: &[u8],
    ) -> TransportResult<(VerifyingKey, PermissionSet)> {
        let (principal, public_key, signature, finished) = match reader.read_message().await? {
            Message::Auth {
                principal,
                public_key,
                signature,
                finished,
            } => (principal, public_key, signature, finished),
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected auth, got message {}",
                    other.code()
                )))
            }
        };

        if !mac.verify(&keys.client_finished[..], hash, &finished) {
            return Err(TransportError::HandshakeFailed(
                "finished tag mismatch".to_string(),
            ));
        }

        if principal != self.principal {
            warn!(origin = %self.origin, principal = %principal, "Unexpected principal");
            return Err(TransportError::Unauthorized);
        }

        let public_key =
            parse_ed25519_public_key(&public_key).map_err(|_| TransportError::Unauthorized)?;
        verify_signature(
            &public_key,
            &auth_signature_message(hash, &principal),
            &signature,
        )
        .map_err(|_| TransportError::Unauthorized)?;

        let permissions = self
            .authorizer
            .authorize(&public_key, self.origin)
            .map_err(|e| {
                warn!(origin = %self.origin, "Authorization failed: {}", e);
                TransportError::Unauthorized
            })?;

        Ok((public_key, permissions))
    }
}

/// Client side of the handshake. Returns the server's host key.
pub async fn client_handshake<R, W>(
    config: &ClientConfig,
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
) -> TransportResult<VerifyingKey>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ephemeral = EphemeralKeyPair::generate();
    let hello_body = Message::Hello {
        version: PROTOCOL_VERSION.to_string(),
        ciphers: join_names(&config.ciphers),
        macs: join_names(&config.macs),
        ephemeral_key: Bytes::copy_from_slice(&ephemeral.public_key_bytes()),
    }
    .encode();
    writer.write_frame(&hello_body).await?;

    let (version, cipher_name, mac_name, server_ephemeral, host_key, signature) =
        match reader.read_message().await? {
            Message::HelloReply {
                version,
                cipher,
                mac,
                ephemeral_key,
                host_key,
                signature,
            } => (version, cipher, mac, ephemeral_key, host_key, signature),
            Message::Disconnect { reason } if reason == NO_COMMON_ALGORITHM => {
                return Err(TransportError::NoCommonAlgorithm)
            }
            Message::Disconnect { reason } => return Err(TransportError::HandshakeFailed(reason)),
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected hello-reply, got message {}",
                    other.code()
                )))
            }
        };

    if version != PROTOCOL_VERSION {
        return Err(TransportError::HandshakeFailed(format!(
            "unsupported protocol version {:?}",
            version
        )));
    }
    let cipher: CipherAlgorithm = cipher_name.parse()?;
    let mac: MacAlgorithm = mac_name.parse()?;
    if !config.ciphers.contains(&cipher) || !config.macs.contains(&mac) {
        return Err(TransportError::HandshakeFailed(
            "server chose an algorithm that was not offered".to_string(),
        ));
    }

    let host_key = parse_ed25519_public_key(&host_key)?;
    if let Some(pinned) = &config.host_key {
        if pinned != &host_key {
            return Err(TransportError::HandshakeFailed(
                "host key does not match".to_string(),
            ));
        }
    }

    let mut transcript = Transcript::new();
    transcript.update(&hello_body);
    transcript.update(&reply_transcript(
        &version,
        &cipher_name,
        &mac_name,
        &server_ephemeral,
        host_key.as_bytes(),
    ));
    let hash = transcript.finish();
    verify_signature(&host_key, &hash, &signature)
        .map_err(|_| TransportError::HandshakeFailed("invalid host signature".to_string()))?;

    let shared = ephemeral.diffie_hellman(&server_ephemeral)?;
    let keys = SessionKeys::derive(&shared[..], &hash);
    reader.protect(PacketProtection::new(cipher, &keys.server_packet));
    writer.protect(PacketProtection::new(cipher, &keys.client_packet));

    let signature = config
        .identity
        .sign(&auth_signature_message(&hash, &config.principal));
    writer
        .write_message(&Message::Auth {
            principal: config.principal.clone(),
            public_key: Bytes::copy_from_slice(config.identity.verifying_key().as_bytes()),
            signature: Bytes::copy_from_slice(&signature.to_bytes()),
            finished: Bytes::from(mac.tag(&keys.client_finished[..], &hash)),
        })
        .await?;

    match reader.read_message().await {
        Ok(Message::AuthAccepted { finished }) => {
            if !mac.verify(&keys.server_finished[..], &hash, &finished) {
                return Err(TransportError::HandshakeFailed(
                    "finished tag mismatch".to_string(),
                ));
            }
            debug!(cipher = %cipher, mac = %mac, "Handshake complete");
            Ok(host_key)
        }
        Ok(Message::AuthRejected) | Err(TransportError::Closed) => Err(TransportError::Unauthorized),
        Ok(other) => Err(TransportError::Protocol(format!(
            "expected auth reply, got message {}",
            other.code()
        ))),
        Err(e) => Err(e),
    }
}
