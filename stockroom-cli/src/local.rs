//! Commands that work on the backend directly with a local key file.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use stockroom::backend;
use stockroom::command::{Command, EnvCommand, Environment, GROUP_VARIABLE};
use stockroom::config::BackendConfig;
use stockroom::crypter::{read_key_file, write_identity, write_key_file, CrypterKind};
use stockroom::store::SecretStore;
use stockroom::{AppConfig, AppError};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::StoreArgs;

/// Placeholder replaced by variable names in `exec` templates.
pub const TEMPLATE_TOKEN: &str = "{}";

fn backend_config(config: &AppConfig, args: &StoreArgs) -> BackendConfig {
    let mut backend = config.backend.clone();
    if let Some(kind) = &args.backend {
        backend.kind = kind.clone();
    }
    if let Some(url) = &args.url {
        backend.url = url.clone();
    }
    if let Some(namespace) = &args.namespace {
        backend.namespace = namespace.clone();
    }
    backend
}

async fn open_store(config: &AppConfig, args: &StoreArgs) -> anyhow::Result<SecretStore> {
    let key_file = args.key_file.as_deref().unwrap_or(&config.secrets.key_file);
    let kind: CrypterKind = args
        .crypter
        .as_deref()
        .unwrap_or(&config.secrets.crypter)
        .parse()?;

    let crypter = kind.build(&read_key_file(key_file)?)?;
    let backend = backend::connect(&backend_config(config, args)).await?;
    Ok(SecretStore::new(backend, crypter))
}

fn refuse_existing(path: &Path, force: bool) -> anyhow::Result<()> {
    if !force && path.exists() {
        return Err(AppError::usage(format!(
            "{} already exists (use --force to replace it)",
            path.display()
        ))
        .into());
    }
    Ok(())
}

pub fn key(
    config: &AppConfig,
    path: Option<PathBuf>,
    crypter: Option<String>,
    force: bool,
) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(|| config.secrets.key_file.clone());
    refuse_existing(&path, force)?;

    let kind: CrypterKind = crypter.as_deref().unwrap_or(&config.secrets.crypter).parse()?;
    let key = kind.generate_key()?;
    write_key_file(&path, &key)?;

    info!(path = %path.display(), crypter = %kind, "Generated key");
    println!("Wrote {} key to {}", kind, path.display());
    Ok(())
}

/// `PATH.pub`, next to the private key.
fn public_key_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

pub fn identity(path: &Path, force: bool) -> anyhow::Result<()> {
    refuse_existing(path, force)?;

    let signing_key = SigningKey::generate(&mut OsRng);
    write_identity(path, &signing_key)?;

    let public_key = BASE64.encode(signing_key.verifying_key().as_bytes());
    let public_path = public_key_path(path);
    std::fs::write(&public_path, format!("{}\n", public_key))
        .with_context(|| format!("Failed to write {}", public_path.display()))?;

    println!("{}", public_key);
    Ok(())
}

fn validate_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() || name.contains('=') {
        return Err(AppError::usage(format!("Invalid variable name {:?}", name)).into());
    }
    Ok(())
}

/// Take the value from the environment when allowed and present, otherwise
/// prompt for it without echo.
fn read_value(name: &str, from_env: bool) -> anyhow::Result<Zeroizing<String>> {
    if from_env {
        if let Some(value) = std::env::var(name).ok().filter(|value| !value.is_empty()) {
            return Ok(Zeroizing::new(value));
        }
    }
    let value = rpassword::read_password_from_tty(Some(&format!("{}: ", name)))
        .with_context(|| format!("Failed to read a value for {}", name))?;
    Ok(Zeroizing::new(value))
}

pub async fn set(
    config: &AppConfig,
    args: &StoreArgs,
    names: &[String],
    from_env: bool,
    ttl: Option<u64>,
) -> anyhow::Result<()> {
    for name in names {
        validate_name(name)?;
    }
    let store = open_store(config, args).await?;
    let ttl = ttl.map(Duration::from_secs);

    for name in names {
        let value = read_value(name, from_env)?;
        store.write(&args.group, name, value.as_bytes(), ttl).await?;
        info!(group = %args.group, variable = %name, "Stored variable");
    }
    Ok(())
}

pub async fn unset(config: &AppConfig, args: &StoreArgs, names: &[String]) -> anyhow::Result<()> {
    let store = open_store(config, args).await?;
    for name in names {
        store.remove(&args.group, name).await?;
        info!(group = %args.group, variable = %name, "Removed variable");
    }
    Ok(())
}

/// Same listing the server's `env` command produces.
pub async fn env(config: &AppConfig, args: &StoreArgs) -> anyhow::Result<()> {
    let store = open_store(config, args).await?;
    let env: Environment = [(GROUP_VARIABLE, args.group.as_str())].into_iter().collect();

    let status = EnvCommand::new(store)
        .run(&[], &env, &mut tokio::io::stdout())
        .await;
    if !status.is_success() {
        return Err(AppError::CommandFailed(status.0).into());
    }
    Ok(())
}

/// Expand `template` once per variable name. Each whitespace-separated
/// component becomes one argument with the token replaced by the name.
fn expand_template<'a>(template: Option<&str>, names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let Some(template) = template else {
        return Vec::new();
    };
    names
        .flat_map(|name| {
            template
                .split_whitespace()
                .map(move |component| component.replace(TEMPLATE_TOKEN, name))
        })
        .collect()
}

/// Replace every argument that is exactly the token with the expansion.
fn substitute(args: &[String], expansion: &[String]) -> Vec<String> {
    let mut result = Vec::with_capacity(args.len() + expansion.len());
    for arg in args {
        if arg == TEMPLATE_TOKEN {
            result.extend_from_slice(expansion);
        } else {
            result.push(arg.clone());
        }
    }
    result
}

/// Replace this process with `program`, its environment being the current
/// one overlaid with the decrypted group. Only returns on failure.
pub async fn exec(
    config: &AppConfig,
    args: &StoreArgs,
    template: Option<&str>,
    program: &[String],
) -> anyhow::Result<()> {
    let (program, program_args) = program
        .split_first()
        .ok_or_else(|| AppError::usage("Missing program"))?;

    let store = open_store(config, args).await?;
    let variables = store.read_group(&args.group).await?;

    let expansion = expand_template(template, variables.keys().map(String::as_str));
    let mut command = std::process::Command::new(program);
    command.args(substitute(program_args, &expansion));
    for (name, value) in &variables {
        command.env(name, OsStr::from_bytes(value));
    }

    debug!(program = %program, variables = variables.len(), "Executing");
    let err = command.exec();
    Err(anyhow::Error::new(err).context(format!("Failed to execute {}", program)))
}
