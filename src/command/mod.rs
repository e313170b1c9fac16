//! Remote commands.
//!
//! A command runs once per `exec` request with the arguments from the
//! command line, the channel environment and a sink that streams output to
//! the caller. It reports an [`ExitStatus`]; failure details are logged
//! locally and never written to the sink.

pub mod env;
pub mod set;
pub mod unset;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::error;

use crate::store::{SecretStore, StoreError};

pub use env::EnvCommand;
pub use set::SetCommand;
pub use unset::UnsetCommand;

/// Environment variable naming the group a command works on.
pub const GROUP_VARIABLE: &str = "GROUP";

/// Environment variable carrying a time-to-live in seconds for `set`.
pub const TTL_VARIABLE: &str = "TTL";

/// Longest accepted time-to-live, one hundred years.
pub const MAX_TTL_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// Command exit status, sent to the caller as a 4-byte big-endian integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(pub u32);

impl ExitStatus {
    pub const SUCCESS: ExitStatus = ExitStatus(0);
    pub const FAILURE: ExitStatus = ExitStatus(1);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }

    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

/// Variables set on a channel with `env` requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment(HashMap<String, String>);

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Set a variable, replacing any earlier value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The group named by `GROUP`, if set and non-empty.
    pub fn group(&self) -> Option<&str> {
        self.get(GROUP_VARIABLE).filter(|group| !group.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

/// Where a command writes its output.
#[async_trait]
pub trait Output: Send {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

#[async_trait]
impl Output for Vec<u8> {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

#[async_trait]
impl Output for tokio::io::Stdout {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        AsyncWriteExt::write_all(self, data).await?;
        self.flush().await
    }
}

/// A remotely executable command.
#[async_trait]
pub trait Command: Send + Sync {
    async fn run(&self, args: &[String], env: &Environment, out: &mut dyn Output) -> ExitStatus;
}

/// Why a command failed. Only ever logged.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("GROUP is not set")]
    MissingGroup,

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Variable {0} is not set in the environment")]
    MissingValue(String),

    #[error("Invalid TTL: {0:?}")]
    InvalidTtl(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Output error: {0}")]
    Output(#[from] io::Error),
}

/// Map a command result to an exit status, logging the failure.
pub(crate) fn exit_status(command: &str, result: Result<(), CommandError>) -> ExitStatus {
    match result {
        Ok(()) => ExitStatus::SUCCESS,
        Err(e) => {
            error!(command, "Command failed: {}", e);
            ExitStatus::FAILURE
        }
    }
}

/// Commands available to callers, fixed at start-up.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `env`, `set` and `unset` commands over `store`.
    pub fn standard(store: SecretStore) -> Self {
        Self::new()
            .with("env", EnvCommand::new(store.clone()))
            .with("set", SetCommand::new(store.clone()))
            .with("unset", UnsetCommand::new(store))
    }

    pub fn with(mut self, name: &str, command: impl Command + 'static) -> Self {
        self.commands.insert(name.to_string(), Arc::new(command));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.commands.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}

/// Split `"<name> [arguments]"` into the name and whitespace-separated
/// arguments.
pub fn parse_command_line(line: &str) -> (&str, Vec<String>) {
    match line.split_once(' ') {
        Some((name, rest)) => (name, rest.split_whitespace().map(str::to_string).collect()),
        None => (line, Vec::new()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::crypter::{CrypterKind, KeyMaterial};

    pub fn memory_store() -> SecretStore {
        let key = KeyMaterial::generate().unwrap();
        SecretStore::new(
            Arc::new(MemoryBackend::new("commandtest")),
            CrypterKind::Std.build(&key).unwrap(),
        )
    }

    pub fn group_env(group: &str) -> Environment {
        [(GROUP_VARIABLE, group)].into_iter().collect()
    }
}
