//! Per-channel request handling.
//!
//! A channel collects `env` requests until an `exec` arrives, runs that one
//! command and closes. Requests queued behind the `exec` are dropped with
//! the channel.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::PermissionSet;
use crate::command::{parse_command_line, CommandRegistry, Environment, Output};
use crate::transport::{Message, TransportError, TransportResult};
use crate::wire::unpack_strings;

/// Largest `channel-data` payload sent in one message.
const MAX_DATA_CHUNK: usize = 32 * 1024;

enum Flow {
    Continue,
    Close,
}

/// Streams command output to the caller as `channel-data` messages.
pub struct ChannelOutput {
    channel: u32,
    outbound: mpsc::Sender<Message>,
}

impl ChannelOutput {
    pub fn new(channel: u32, outbound: mpsc::Sender<Message>) -> Self {
        Self { channel, outbound }
    }
}

#[async_trait]
impl Output for ChannelOutput {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        for chunk in data.chunks(MAX_DATA_CHUNK) {
            self.outbound
                .send(Message::ChannelData {
                    channel: self.channel,
                    data: Bytes::copy_from_slice(chunk),
                })
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))?;
        }
        Ok(())
    }
}

/// State of one session channel.
pub struct ChannelSession {
    channel: u32,
    permissions: Arc<PermissionSet>,
    registry: Arc<CommandRegistry>,
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<Message>,
    env: Environment,
}

impl ChannelSession {
    pub fn new(
        channel: u32,
        permissions: Arc<PermissionSet>,
        registry: Arc<CommandRegistry>,
        outbound: mpsc::Sender<Message>,
        inbound: mpsc::Receiver<Message>,
    ) -> Self {
        Self {
            channel,
            permissions,
            registry,
            outbound,
            inbound,
            env: Environment::new(),
        }
    }

    /// Serve requests until the channel closes.
    pub async fn run(mut self) {
        while let Some(message) = self.inbound.recv().await {
            let flow = match message {
                Message::ChannelRequest {
                    kind,
                    want_reply,
                    payload,
                    ..
                } => self.handle_request(&kind, want_reply, &payload).await,
                Message::ChannelData { .. } => {
                    debug!("Ignoring channel data");
                    Ok(Flow::Continue)
                }
                _ => Ok(Flow::Continue),
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                // The connection is going away; nothing left to tell the caller.
                Err(_) => return,
            }
        }

        let _ = self
            .send(Message::ChannelClose {
                channel: self.channel,
            })
            .await;
        debug!("Channel closed");
    }

    async fn send(&self, message: Message) -> TransportResult<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn reply(&self, success: bool) -> TransportResult<()> {
        let channel = self.channel;
        self.send(if success {
            Message::ChannelSuccess { channel }
        } else {
            Message::ChannelFailure { channel }
        })
        .await
    }

    async fn handle_request(
        &mut self,
        kind: &str,
        want_reply: bool,
        payload: &[u8],
    ) -> TransportResult<Flow> {
        match kind {
            "env" => self.handle_env(want_reply, payload).await,
            "exec" => self.handle_exec(want_reply, payload).await,
            other => {
                debug!(request = other, "Unsupported request");
                if want_reply {
                    self.reply(false).await?;
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_env(&mut self, want_reply: bool, payload: &[u8]) -> TransportResult<Flow> {
        let items = match unpack_strings(payload) {
            Ok(items) if items.len() % 2 == 0 => items,
            Ok(items) => {
                warn!(count = items.len(), "Odd number of env elements");
                self.reply(false).await?;
                return Ok(Flow::Close);
            }
            Err(e) => {
                warn!("Malformed env request: {}", e);
                self.reply(false).await?;
                return Ok(Flow::Close);
            }
        };

        let mut items = items.into_iter();
        while let (Some(name), Some(value)) = (items.next(), items.next()) {
            self.env.set(name, value);
        }

        if want_reply {
            self.reply(true).await?;
        }
        Ok(Flow::Continue)
    }

    async fn handle_exec(&mut self, want_reply: bool, payload: &[u8]) -> TransportResult<Flow> {
        let line = match unpack_strings(payload) {
            Ok(items) if !items.is_empty() => items.into_iter().next().unwrap_or_default(),
            Ok(_) => {
                warn!("Empty exec request");
                self.reply(false).await?;
                return Ok(Flow::Close);
            }
            Err(e) => {
                warn!("Malformed exec request: {}", e);
                self.reply(false).await?;
                return Ok(Flow::Close);
            }
        };
        let (name, args) = parse_command_line(&line);

        if !self.permissions.allows(name) {
            warn!(command = name, "Command not permitted");
            self.reply(false).await?;
            return Ok(Flow::Close);
        }
        let Some(command) = self.registry.get(name) else {
            warn!(command = name, "Unknown command");
            self.reply(false).await?;
            return Ok(Flow::Close);
        };

        if want_reply {
            self.reply(true).await?;
        }

        info!(command = name, "Running command");
        let mut output = ChannelOutput::new(self.channel, self.outbound.clone());
        let status = command.run(&args, &self.env, &mut output).await;
        debug!(command = name, status = status.0, "Command finished");

        self.send(Message::ChannelRequest {
            channel: self.channel,
            kind: "exit-status".to_string(),
            want_reply: false,
            payload: Bytes::copy_from_slice(&status.to_be_bytes()),
        })
        .await?;
        self.send(Message::ChannelEof {
            channel: self.channel,
        })
        .await?;
        Ok(Flow::Close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, ExitStatus};
    use crate::wire::pack;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes `GREETING` and its arguments, and counts its runs.
    #[derive(Default)]
    struct Greet {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Command for Greet {
        async fn run(&self, args: &[String], env: &Environment, out: &mut dyn Output) -> ExitStatus {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let greeting = env.get("GREETING").unwrap_or("hello");
            let line = format!("{} {}\n", greeting, args.join(" "));
            match out.write_all(line.as_bytes()).await {
                Ok(()) => ExitStatus::SUCCESS,
                Err(_) => ExitStatus::FAILURE,
            }
        }
    }

    struct Harness {
        to_session: mpsc::Sender<Message>,
        from_session: mpsc::Receiver<Message>,
        runs: Arc<AtomicUsize>,
    }

    fn start(permissions: &[&str]) -> Harness {
        let greet = Greet::default();
        let runs = greet.runs.clone();
        let registry = Arc::new(CommandRegistry::new().with("greet", greet));

        let (outbound, from_session) = mpsc::channel(64);
        let (to_session, inbound) = mpsc::channel(64);
        let session = ChannelSession::new(
            5,
            Arc::new(PermissionSet::new(permissions.iter().copied())),
            registry,
            outbound,
            inbound,
        );
        tokio::spawn(session.run());

        Harness {
            to_session,
            from_session,
            runs,
        }
    }

    fn request(kind: &str, want_reply: bool, payload: Bytes) -> Message {
        Message::ChannelRequest {
            channel: 5,
            kind: kind.to_string(),
            want_reply,
            payload,
        }
    }

    impl Harness {
        fn send(&self, message: Message) {
            self.to_session.try_send(message).unwrap();
        }

        /// Everything the session sends until it closes.
        async fn drain(&mut self) -> Vec<Message> {
            let mut messages = Vec::new();
            while let Some(message) = self.from_session.recv().await {
                let done = matches!(message, Message::ChannelClose { .. });
                messages.push(message);
                if done {
                    break;
                }
            }
            messages
        }
    }

    #[tokio::test]
    async fn test_env_then_exec() {
        let mut harness = start(&["greet"]);
        harness.send(request("env", true, pack(["GREETING", "hi"])));
        harness.send(request("exec", true, pack(["greet  you all"])));

        let messages = harness.drain().await;
        assert_eq!(
            messages,
            vec![
                Message::ChannelSuccess { channel: 5 },
                Message::ChannelSuccess { channel: 5 },
                Message::ChannelData {
                    channel: 5,
                    data: Bytes::from_static(b"hi you all\n"),
                },
                request("exit-status", false, Bytes::from_static(&[0, 0, 0, 0])),
                Message::ChannelEof { channel: 5 },
                Message::ChannelClose { channel: 5 },
            ]
        );
    }

    #[tokio::test]
    async fn test_only_one_exec() {
        let mut harness = start(&["greet"]);
        harness.send(request("exec", false, pack(["greet"])));
        harness.send(request("exec", false, pack(["greet"])));

        let messages = harness.drain().await;
        assert_eq!(
            messages
                .iter()
                .filter(|m| matches!(m, Message::ChannelData { .. }))
                .count(),
            1
        );
        assert_eq!(harness.runs.load(Ordering::SeqCst), 1);
        // Nothing follows the close.
        assert!(harness.from_session.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_exec_not_permitted() {
        let mut harness = start(&["env"]);
        harness.send(request("exec", true, pack(["greet"])));

        let messages = harness.drain().await;
        assert_eq!(
            messages,
            vec![
                Message::ChannelFailure { channel: 5 },
                Message::ChannelClose { channel: 5 },
            ]
        );
        assert_eq!(harness.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exec_unknown_command() {
        let mut harness = start(&["greet", "shutdown"]);
        harness.send(request("exec", true, pack(["shutdown now"])));

        let messages = harness.drain().await;
        assert_eq!(messages[0], Message::ChannelFailure { channel: 5 });
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_env_closes_channel() {
        let mut harness = start(&["greet"]);
        harness.send(request("env", false, pack(["ODD"])));
        harness.send(request("exec", true, pack(["greet"])));

        let messages = harness.drain().await;
        assert_eq!(
            messages,
            vec![
                Message::ChannelFailure { channel: 5 },
                Message::ChannelClose { channel: 5 },
            ]
        );
        assert_eq!(harness.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_truncated_payload_closes_channel() {
        let mut harness = start(&["greet"]);
        harness.send(request("exec", true, Bytes::from_static(&[0, 0, 0, 9, b'g'])));

        let messages = harness.drain().await;
        assert_eq!(messages[0], Message::ChannelFailure { channel: 5 });
        assert_eq!(harness.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_request() {
        let mut harness = start(&["greet"]);
        harness.send(request("pty-req", true, Bytes::new()));
        harness.send(request("shell", false, Bytes::new()));
        harness.send(request("exec", true, pack(["greet"])));

        let messages = harness.drain().await;
        assert_eq!(messages[0], Message::ChannelFailure { channel: 5 });
        assert_eq!(messages[1], Message::ChannelSuccess { channel: 5 });
        assert_eq!(harness.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_large_output_is_chunked() {
        struct Big;

        #[async_trait]
        impl Command for Big {
            async fn run(&self, _args: &[String], _env: &Environment, out: &mut dyn Output) -> ExitStatus {
                match out.write_all(&vec![b'x'; MAX_DATA_CHUNK * 2 + 1]).await {
                    Ok(()) => ExitStatus::SUCCESS,
                    Err(_) => ExitStatus::FAILURE,
                }
            }
        }

        let (outbound, mut from_session) = mpsc::channel(64);
        let (to_session, inbound) = mpsc::channel(64);
        let session = ChannelSession::new(
            1,
            Arc::new(PermissionSet::new(["big"])),
            Arc::new(CommandRegistry::new().with("big", Big)),
            outbound,
            inbound,
        );
        tokio::spawn(session.run());
        to_session
            .send(Message::ChannelRequest {
                channel: 1,
                kind: "exec".to_string(),
                want_reply: false,
                payload: pack(["big"]),
            })
            .await
            .unwrap();

        let mut chunks = Vec::new();
        while let Some(message) = from_session.recv().await {
            match message {
                Message::ChannelData { data, .. } => chunks.push(data.len()),
                Message::ChannelClose { .. } => break,
                _ => {}
            }
        }
        assert_eq!(chunks, vec![MAX_DATA_CHUNK, MAX_DATA_CHUNK, 1]);
    }
}
