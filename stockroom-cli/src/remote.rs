//! `stockroom remote`: run one command on a server.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::Args;
use ed25519_dalek::VerifyingKey;
use stockroom::auth::parse_public_key;
use stockroom::command::{GROUP_VARIABLE, MAX_TTL_SECONDS, TTL_VARIABLE};
use stockroom::crypter::read_identity;
use stockroom::transport::algorithm::parse_list;
use stockroom::transport::{Client, ClientConfig};
use stockroom::{AppConfig, AppError};
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Args, Debug)]
pub struct RemoteArgs {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:2222")]
    server: String,

    /// Caller identity created with `stockroom identity`
    #[arg(short, long)]
    identity: PathBuf,

    /// Principal to present (defaults to the configured one)
    #[arg(short = 'u', long)]
    principal: Option<String>,

    /// Expected server host key, base64 or a path to a .pub file
    #[arg(long)]
    host_key: Option<String>,

    /// Cipher preferences, most preferred first
    #[arg(long, value_delimiter = ',')]
    ciphers: Vec<String>,

    #[arg(short, long, default_value = "default")]
    group: String,

    /// Expiry in seconds for `set`
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=MAX_TTL_SECONDS))]
    ttl: Option<u64>,

    /// Extra NAME=value pairs for the remote environment
    #[arg(short = 'e', long = "env")]
    vars: Vec<String>,

    /// Command line to run, e.g. `env` or `set NAME=value`
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

/// A pinned host key given inline or as a file.
fn resolve_host_key(value: &str) -> anyhow::Result<VerifyingKey> {
    let path = Path::new(value);
    let encoded = if path.is_file() {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", value))?
    } else {
        value.to_string()
    };
    parse_public_key(&encoded).map_err(|e| AppError::usage(format!("Invalid host key: {}", e)).into())
}

fn environment(args: &RemoteArgs) -> anyhow::Result<Vec<(String, String)>> {
    let mut vars = vec![(GROUP_VARIABLE.to_string(), args.group.clone())];
    if let Some(ttl) = args.ttl {
        vars.push((TTL_VARIABLE.to_string(), ttl.to_string()));
    }
    for var in &args.vars {
        let (name, value) = var
            .split_once('=')
            .ok_or_else(|| AppError::usage(format!("Expected NAME=value, got {:?}", var)))?;
        vars.push((name.to_string(), value.to_string()));
    }
    Ok(vars)
}

pub async fn run(config: &AppConfig, args: RemoteArgs) -> anyhow::Result<()> {
    let vars = environment(&args)?;
    let identity = read_identity(&args.identity)?;
    let principal = args
        .principal
        .clone()
        .unwrap_or_else(|| config.server.principal.clone());

    let mut client_config = ClientConfig::new(principal, identity);
    if let Some(host_key) = &args.host_key {
        client_config = client_config.with_host_key(resolve_host_key(host_key)?);
    }
    if !args.ciphers.is_empty() {
        client_config = client_config.with_ciphers(parse_list(&args.ciphers)?);
    }

    let client = Client::connect(args.server.as_str(), client_config)
        .await
        .with_context(|| format!("Failed to connect to {}", args.server))?;
    let mut session = client.open_session().await?;

    let pairs: Vec<(&str, &str)> = vars
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();
    if !session.env(&pairs).await? {
        return Err(anyhow!("Server refused the environment"));
    }

    let command_line = args.command.join(" ");
    let output = session.exec(&command_line).await?;
    client.disconnect().await?;
    debug!(command = %command_line, status = ?output.exit_status, "Remote command finished");

    if !output.accepted {
        return Err(anyhow!("Server refused {:?}", command_line));
    }

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&output.stdout).await?;
    stdout.flush().await?;

    match output.exit_status {
        Some(0) => Ok(()),
        Some(status) => Err(AppError::CommandFailed(status).into()),
        None => Err(anyhow!("Server closed the channel without an exit status")),
    }
}
