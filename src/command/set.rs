use std::time::Duration;

use async_trait::async_trait;

use super::{
    exit_status, Command, CommandError, Environment, ExitStatus, Output, MAX_TTL_SECONDS,
    TTL_VARIABLE,
};
use crate::store::SecretStore;

/// `set NAME` or `set NAME=value`: encrypt and store a variable.
///
/// Without an inline value the value is taken from the channel environment.
/// A `TTL` variable in the environment makes the entry expire after that
/// many seconds.
pub struct SetCommand {
    store: SecretStore,
}

impl SetCommand {
    pub fn new(store: SecretStore) -> Self {
        Self { store }
    }

    async fn execute(&self, args: &[String], env: &Environment) -> Result<(), CommandError> {
        let [assignment] = args else {
            return Err(CommandError::Usage("set NAME[=VALUE]"));
        };
        let group = env.group().ok_or(CommandError::MissingGroup)?;

        let (name, value) = match assignment.split_once('=') {
            Some((name, value)) => (name, value),
            None => {
                let value = env
                    .get(assignment)
                    .ok_or_else(|| CommandError::MissingValue(assignment.clone()))?;
                (assignment.as_str(), value)
            }
        };
        if name.is_empty() {
            return Err(CommandError::Usage("set NAME[=VALUE]"));
        }

        let ttl = match env.get(TTL_VARIABLE) {
            Some(ttl) => Some(parse_ttl(ttl)?),
            None => None,
        };

        self.store.write(group, name, value.as_bytes(), ttl).await?;
        Ok(())
    }
}

fn parse_ttl(value: &str) -> Result<Duration, CommandError> {
    match value.trim().parse::<u64>() {
        Ok(seconds) if (1..=MAX_TTL_SECONDS).contains(&seconds) => {
            Ok(Duration::from_secs(seconds))
        }
        _ => Err(CommandError::InvalidTtl(value.to_string())),
    }
}

#[async_trait]
impl Command for SetCommand {
    async fn run(&self, args: &[String], env: &Environment, _out: &mut dyn Output) -> ExitStatus {
        exit_status("set", self.execute(args, env).await)
    }
}
