use async_trait::async_trait;

use super::{exit_status, Command, CommandError, Environment, ExitStatus, Output};
use crate::store::SecretStore;

/// `env`: print every variable of the group as `NAME=value` lines.
pub struct EnvCommand {
    store: SecretStore,
}

impl EnvCommand {
    pub fn new(store: SecretStore) -> Self {
        Self { store }
    }

    async fn execute(
        &self,
        args: &[String],
        env: &Environment,
        out: &mut dyn Output,
    ) -> Result<(), CommandError> {
        if !args.is_empty() {
            return Err(CommandError::Usage("env"));
        }
        let group = env.group().ok_or(CommandError::MissingGroup)?;

        // Everything is decrypted before the first byte is written.
        let variables = self.store.read_group(group).await?;

        let mut listing = zeroize::Zeroizing::new(Vec::new());
        for (name, value) in &variables {
            listing.extend_from_slice(name.as_bytes());
            listing.push(b'=');
            listing.extend_from_slice(value);
            listing.push(b'\n');
        }
        out.write_all(&listing).await?;
        Ok(())
    }
}

#[async_trait]
impl Command for EnvCommand {
    async fn run(&self, args: &[String], env: &Environment, out: &mut dyn Output) -> ExitStatus {
        exit_status("env", self.execute(args, env, out).await)
    }
}
