use async_trait::async_trait;

use super::{exit_status, Command, CommandError, Environment, ExitStatus, Output};
use crate::store::SecretStore;

/// `unset NAME`: remove a variable from the group. Removing a variable that
/// does not exist succeeds.
pub struct UnsetCommand {
    store: SecretStore,
}

impl UnsetCommand {
    pub fn new(store: SecretStore) -> Self {
        Self { store }
    }

    async fn execute(&self, args: &[String], env: &Environment) -> Result<(), CommandError> {
        let [name] = args else {
            return Err(CommandError::Usage("unset NAME"));
        };
        let group = env.group().ok_or(CommandError::MissingGroup)?;
        self.store.remove(group, name).await?;
        Ok(())
    }
}

#[async_trait]
impl Command for UnsetCommand {
    async fn run(&self, args: &[String], env: &Environment, _out: &mut dyn Output) -> ExitStatus {
        exit_status("unset", self.execute(args, env).await)
    }
}
