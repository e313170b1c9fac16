//! Client side of the transport, used by the CLI and the integration tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use ed25519_dalek::{SigningKey, VerifyingKey};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::frame::{write_loop, FrameReader, FrameWriter};
use super::handshake::client_handshake;
use super::message::Message;
use super::{CipherAlgorithm, MacAlgorithm, TransportError, TransportResult};
use crate::wire::pack;

/// Connection parameters for [`Client`].
#[derive(Clone)]
pub struct ClientConfig {
    pub principal: String,
    pub identity: SigningKey,
    /// Cipher preferences, most preferred first
    pub ciphers: Vec<CipherAlgorithm>,
    /// MAC preferences, most preferred first
    pub macs: Vec<MacAlgorithm>,
    /// Expected server host key; any key is accepted when unset
    pub host_key: Option<VerifyingKey>,
}

impl ClientConfig {
    pub fn new(principal: impl Into<String>, identity: SigningKey) -> Self {
        Self {
            principal: principal.into(),
            identity,
            ciphers: CipherAlgorithm::ALL.to_vec(),
            macs: MacAlgorithm::ALL.to_vec(),
            host_key: None,
        }
    }

    pub fn with_host_key(mut self, host_key: VerifyingKey) -> Self {
        self.host_key = Some(host_key);
        self
    }

    pub fn with_ciphers(mut self, ciphers: Vec<CipherAlgorithm>) -> Self {
        self.ciphers = ciphers;
        self
    }

    pub fn with_macs(mut self, macs: Vec<MacAlgorithm>) -> Self {
        self.macs = macs;
        self
    }
}

type ChannelMap = Arc<DashMap<u32, mpsc::UnboundedSender<Message>>>;

/// An authenticated connection to a server.
pub struct Client {
    outbound: mpsc::Sender<Message>,
    channels: ChannelMap,
    next_channel: AtomicU32,
    host_key: VerifyingKey,
    reader_task: JoinHandle<()>,
    writer_task: Option<JoinHandle<()>>,
}

impl Client {
    /// Connect over TCP and run the handshake.
    pub async fn connect<A: ToSocketAddrs>(addr: A, config: ClientConfig) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Self::handshake(read_half, write_half, &config).await
    }

    /// Run the handshake over an already established byte stream.
    pub async fn handshake<R, W>(read_half: R, write_half: W, config: &ClientConfig) -> TransportResult<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);
        let host_key = client_handshake(config, &mut reader, &mut writer).await?;

        let (outbound, outbound_rx) = mpsc::channel(64);
        let channels: ChannelMap = Arc::default();
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx));
        let reader_task = tokio::spawn(read_loop(reader, channels.clone()));

        Ok(Self {
            outbound,
            channels,
            next_channel: AtomicU32::new(0),
            host_key,
            reader_task,
            writer_task: Some(writer_task),
        })
    }

    pub fn host_key(&self) -> &VerifyingKey {
        &self.host_key
    }

    async fn send(&self, message: Message) -> TransportResult<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn open_session(&self) -> TransportResult<Session> {
        self.open_channel("session").await
    }

    /// Open a channel of an arbitrary type.
    pub async fn open_channel(&self, kind: &str) -> TransportResult<Session> {
        let channel = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let (tx, mut inbound) = mpsc::unbounded_channel();
        self.channels.insert(channel, tx);

        self.send(Message::ChannelOpen {
            channel,
            kind: kind.to_string(),
        })
        .await?;

        match inbound.recv().await {
            Some(Message::ChannelOpenConfirm { .. }) => Ok(Session {
                channel,
                outbound: self.outbound.clone(),
                inbound,
                stdout: Vec::new(),
                exit_status: None,
                closed: false,
            }),
            Some(Message::ChannelOpenFailure { reason, .. }) => {
                self.channels.remove(&channel);
                Err(TransportError::ChannelRejected(reason))
            }
            Some(other) => Err(TransportError::Protocol(format!(
                "expected channel confirmation, got message {}",
                other.code()
            ))),
            None => Err(TransportError::Closed),
        }
    }

    /// Send a connection-level request. The server never answers these.
    pub async fn global_request(&self, name: &str, payload: Bytes) -> TransportResult<()> {
        self.send(Message::GlobalRequest {
            name: name.to_string(),
            want_reply: true,
            payload,
        })
        .await
    }

    /// Say goodbye and wait for pending writes to be flushed.
    pub async fn disconnect(mut self) -> TransportResult<()> {
        self.send(Message::Disconnect {
            reason: "client disconnect".to_string(),
        })
        .await?;
        if let Some(writer_task) = self.writer_task.take() {
            let _ = writer_task.await;
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Route incoming messages to their channels.
async fn read_loop<R: AsyncRead + Unpin>(mut reader: FrameReader<R>, channels: ChannelMap) {
    loop {
        match reader.read_message().await {
            Ok(message) => match message.channel() {
                Some(channel) => {
                    let closing = matches!(
                        message,
                        Message::ChannelClose { .. } | Message::ChannelOpenFailure { .. }
                    );
                    if let Some(tx) = channels.get(&channel) {
                        let _ = tx.send(message);
                    }
                    if closing {
                        channels.remove(&channel);
                    }
                }
                None => match message {
                    Message::Disconnect { reason } => {
                        debug!("Server disconnected: {}", reason);
                        break;
                    }
                    other => debug!("Ignoring message {}", other.code()),
                },
            },
            Err(TransportError::Closed) => break,
            Err(e) => {
                warn!("Connection error: {}", e);
                break;
            }
        }
    }
    // Wake every session still waiting.
    channels.clear();
}

/// Result of one `exec` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Whether the server acknowledged the request
    pub accepted: bool,
    pub stdout: Vec<u8>,
    pub exit_status: Option<u32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.accepted && self.exit_status == Some(0)
    }
}

/// One open channel.
pub struct Session {
    channel: u32,
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::UnboundedReceiver<Message>,
    stdout: Vec<u8>,
    exit_status: Option<u32>,
    closed: bool,
}

impl Session {
    pub fn id(&self) -> u32 {
        self.channel
    }

    async fn send(&self, message: Message) -> TransportResult<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn next(&mut self) -> TransportResult<Message> {
        self.inbound.recv().await.ok_or(TransportError::Closed)
    }

    fn absorb(&mut self, message: Message) {
        match message {
            Message::ChannelData { data, .. } => self.stdout.extend_from_slice(&data),
            Message::ChannelRequest { kind, payload, .. } if kind == "exit-status" => {
                match <[u8; 4]>::try_from(payload.as_ref()) {
                    Ok(status) => self.exit_status = Some(u32::from_be_bytes(status)),
                    Err(_) => warn!("Malformed exit status"),
                }
            }
            Message::ChannelClose { .. } => self.closed = true,
            Message::ChannelEof { .. } => {}
            other => debug!(channel = self.channel, "Ignoring message {}", other.code()),
        }
    }

    /// Send a request. When a reply is wanted, wait for it and report
    /// whether it succeeded.
    pub async fn request(
        &mut self,
        kind: &str,
        want_reply: bool,
        payload: Bytes,
    ) -> TransportResult<Option<bool>> {
        self.send(Message::ChannelRequest {
            channel: self.channel,
            kind: kind.to_string(),
            want_reply,
            payload,
        })
        .await?;

        if !want_reply {
            return Ok(None);
        }
        loop {
            match self.next().await? {
                Message::ChannelSuccess { .. } => return Ok(Some(true)),
                Message::ChannelFailure { .. } => return Ok(Some(false)),
                other => self.absorb(other),
            }
        }
    }

    /// Merge variables into the channel environment.
    pub async fn env(&mut self, vars: &[(&str, &str)]) -> TransportResult<bool> {
        let payload = pack(vars.iter().flat_map(|(name, value)| [*name, *value]));
        Ok(self.request("env", true, payload).await? == Some(true))
    }

    /// Run a command and collect its output.
    pub async fn exec(&mut self, command: &str) -> TransportResult<ExecOutput> {
        match self.request("exec", true, pack([command])).await? {
            Some(true) => self.finish().await,
            _ => Ok(ExecOutput::default()),
        }
    }

    /// Collect output until the server closes the channel.
    pub async fn finish(&mut self) -> TransportResult<ExecOutput> {
        while !self.closed {
            let message = self.next().await?;
            self.absorb(message);
        }
        Ok(ExecOutput {
            accepted: true,
            stdout: std::mem::take(&mut self.stdout),
            exit_status: self.exit_status.take(),
        })
    }

    /// Close the channel from our side.
    pub async fn close(self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.send(Message::ChannelClose {
            channel: self.channel,
        })
        .await
    }
}
