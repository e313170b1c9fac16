//! Connection manager.
//!
//! Accepts TCP connections, runs the handshake and serves session channels.
//! Each connection gets its own task plus a writer task that owns the
//! outbound half of the stream; each channel gets a task of its own. A
//! connection is only released after all of its channel tasks finished.

pub mod session;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use ed25519_dalek::SigningKey;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::SharedAuthorizer;
use crate::command::{CommandRegistry, ExitStatus};
use crate::config::ServerSection;
use crate::transport::algorithm::parse_list;
use crate::transport::frame::write_loop;
use crate::transport::{
    CipherAlgorithm, FrameReader, FrameWriter, MacAlgorithm, Message, ServerHandshake,
    TransportError, TransportResult,
};

pub use session::{ChannelOutput, ChannelSession};

/// The only channel type served.
pub const SESSION_CHANNEL: &str = "session";

/// Messages buffered per channel before the connection reader waits.
const CHANNEL_QUEUE: usize = 64;

/// Everything the server needs to accept connections.
pub struct ServerConfig {
    /// Address to listen on, `host:port`
    pub addr: String,
    /// Principal every caller must present
    pub principal: String,
    pub host_key: SigningKey,
    pub ciphers: Vec<CipherAlgorithm>,
    pub macs: Vec<MacAlgorithm>,
}

impl ServerConfig {
    /// Resolve the configured section. Unknown algorithm names are an error.
    pub fn from_section(section: &ServerSection, host_key: SigningKey) -> TransportResult<Self> {
        let ciphers: Vec<CipherAlgorithm> = parse_list(&section.ciphers)?;
        let macs: Vec<MacAlgorithm> = parse_list(&section.macs)?;
        if ciphers.is_empty() || macs.is_empty() {
            return Err(TransportError::NoCommonAlgorithm);
        }

        Ok(Self {
            addr: section.addr(),
            principal: section.principal.clone(),
            host_key,
            ciphers,
            macs,
        })
    }
}

pub struct Server {
    config: Arc<ServerConfig>,
    authorizer: SharedAuthorizer,
    registry: Arc<CommandRegistry>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        authorizer: SharedAuthorizer,
        registry: Arc<CommandRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            authorizer,
            registry,
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn listen_and_serve(&self) -> io::Result<()> {
        let listener = TcpListener::bind(&self.config.addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from `listener` forever. Only accept errors end
    /// the loop.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        info!(
            host_key = %BASE64.encode(self.config.host_key.verifying_key().as_bytes()),
            "Serving"
        );

        loop {
            let (stream, peer) = listener.accept().await?;
            let connection = Connection {
                config: self.config.clone(),
                authorizer: self.authorizer.clone(),
                registry: self.registry.clone(),
            };
            let span = info_span!("connection", id = %Uuid::new_v4(), %peer);
            tokio::spawn(connection.run(stream, peer).instrument(span));
        }
    }
}

struct Connection {
    config: Arc<ServerConfig>,
    authorizer: SharedAuthorizer,
    registry: Arc<CommandRegistry>,
}

impl Connection {
    async fn run(self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        let handshake = ServerHandshake {
            host_key: &self.config.host_key,
            principal: &self.config.principal,
            ciphers: &self.config.ciphers,
            macs: &self.config.macs,
            authorizer: self.authorizer.as_ref(),
            origin: peer,
        };
        let authenticated = match handshake.run(&mut reader, &mut writer).await {
            Ok(authenticated) => authenticated,
            Err(e) => {
                warn!("Handshake failed: {}", e);
                return;
            }
        };
        info!(
            key = %BASE64.encode(authenticated.public_key.as_bytes()),
            permissions = ?authenticated.permissions.iter().collect::<Vec<_>>(),
            cipher = %authenticated.cipher,
            "Connection authenticated"
        );
        let permissions = Arc::new(authenticated.permissions);

        let (outbound, outbound_rx) = mpsc::channel(64);
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx).in_current_span());

        let mut channels: HashMap<u32, mpsc::Sender<Message>> = HashMap::new();
        let mut tasks = JoinSet::new();

        loop {
            let message = match reader.read_message().await {
                Ok(message) => message,
                Err(TransportError::Closed) => {
                    debug!("Connection closed by peer");
                    break;
                }
                Err(e) => {
                    warn!("Connection error: {}", e);
                    break;
                }
            };

            match message {
                Message::ChannelOpen { channel, kind } => {
                    let reply = if kind != SESSION_CHANNEL {
                        debug!(channel, kind = %kind, "Rejecting channel");
                        Message::ChannelOpenFailure {
                            channel,
                            reason: format!("unknown channel type {:?}", kind),
                        }
                    } else if channels.get(&channel).is_some_and(|tx| !tx.is_closed()) {
                        Message::ChannelOpenFailure {
                            channel,
                            reason: "channel already open".to_string(),
                        }
                    } else {
                        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE);
                        channels.insert(channel, tx);
                        let session = ChannelSession::new(
                            channel,
                            permissions.clone(),
                            self.registry.clone(),
                            outbound.clone(),
                            rx,
                        );
                        tasks.spawn(
                            supervise(channel, session, outbound.clone())
                                .instrument(info_span!("channel", channel)),
                        );
                        Message::ChannelOpenConfirm { channel }
                    };
                    // The confirmation is queued before anything the new
                    // channel task can send, since the task waits for input.
                    if outbound.send(reply).await.is_err() {
                        break;
                    }
                }
                Message::ChannelClose { channel } => {
                    channels.remove(&channel);
                }
                Message::GlobalRequest { name, .. } => {
                    debug!(request = %name, "Discarding global request");
                }
                Message::Disconnect { reason } => {
                    debug!("Peer disconnected: {}", reason);
                    break;
                }
                message => match message.channel() {
                    Some(channel) => match channels.get(&channel) {
                        Some(tx) => {
                            if tx.send(message).await.is_err() {
                                debug!(channel, "Channel already finished");
                                channels.remove(&channel);
                            }
                        }
                        None => debug!(channel, "Message for unknown channel"),
                    },
                    None => {
                        warn!("Unexpected message {} after handshake", message.code());
                        break;
                    }
                },
            }

            while let Some(result) = tasks.try_join_next() {
                match result {
                    // The id may already belong to a newer channel.
                    Ok(channel) => {
                        if channels.get(&channel).is_some_and(|tx| tx.is_closed()) {
                            channels.remove(&channel);
                        }
                    }
                    Err(e) => error!("Channel task failed: {}", e),
                }
            }
        }

        // Closing every inbound queue lets idle channels finish; busy ones
        // complete their command first.
        channels.clear();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Channel task failed: {}", e);
            }
        }

        drop(outbound);
        if let Err(e) = writer_task.await {
            error!("Writer task failed: {}", e);
        }
        info!("Connection finished");
    }
}

/// Run a channel session on a task of its own. If it panics, the caller is
/// told the command failed and the channel is closed.
async fn supervise(
    channel: u32,
    session: ChannelSession,
    outbound: mpsc::Sender<Message>,
) -> u32 {
    let Err(e) = tokio::spawn(session.run().in_current_span()).await else {
        return channel;
    };
    error!("Channel task failed: {}", e);

    let failure = [
        Message::ChannelRequest {
            channel,
            kind: "exit-status".to_string(),
            want_reply: false,
            payload: Bytes::copy_from_slice(&ExitStatus::FAILURE.to_be_bytes()),
        },
        Message::ChannelEof { channel },
        Message::ChannelClose { channel },
    ];
    for message in failure {
        if outbound.send(message).await.is_err() {
            break;
        }
    }
    channel
}
