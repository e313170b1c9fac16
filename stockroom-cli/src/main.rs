mod local;
mod remote;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use stockroom::command::MAX_TTL_SECONDS;
use stockroom::{AppConfig, AppError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "stockroom")]
#[command(about = "Manage encrypted configuration variables")]
struct Cli {
    /// Configuration file (defaults to config/default and config/local)
    #[arg(short, long, global = true, env = "STOCKROOM_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Where variables live. Each flag overrides the configuration file.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Path to the secrets key file
    #[arg(short = 'k', long)]
    key_file: Option<PathBuf>,

    /// Backend kind (memory, sqlite)
    #[arg(long)]
    backend: Option<String>,

    /// Backend address
    #[arg(short = 'a', long)]
    url: Option<String>,

    /// Backend namespace prefix
    #[arg(short = 'n', long)]
    namespace: Option<String>,

    /// Crypter kind
    #[arg(long)]
    crypter: Option<String>,

    /// Group of variables to work on
    #[arg(short = 'g', long, default_value = "default")]
    group: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new secrets key
    Key {
        /// Destination (defaults to the configured key file)
        path: Option<PathBuf>,

        /// Crypter kind the key is generated for
        #[arg(long)]
        crypter: Option<String>,

        /// Replace an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Generate an Ed25519 identity for the server or a caller
    Identity {
        /// Destination of the private key; the public key goes to PATH.pub
        path: PathBuf,

        #[arg(long)]
        force: bool,
    },

    /// Encrypt and store variables
    Set {
        #[command(flatten)]
        store: StoreArgs,

        /// Take values from the process environment when set there
        #[arg(short, long)]
        env: bool,

        /// Expire the variables after this many seconds
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..=MAX_TTL_SECONDS))]
        ttl: Option<u64>,

        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Remove variables
    Unset {
        #[command(flatten)]
        store: StoreArgs,

        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Print every variable of a group as NAME=value lines
    Env {
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Run a program with the group merged into its environment
    Exec {
        #[command(flatten)]
        store: StoreArgs,

        /// Arguments substituted for a lone `{}`, expanded once per variable
        /// with `{}` replaced by the variable name
        #[arg(short, long)]
        template: Option<String>,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        program: Vec<String>,
    },

    /// Run a command on a stockroom server
    Remote(remote::RemoteArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stockroom=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let app_error = e.downcast_ref::<AppError>();
            // A remote command that ran has nothing more to say.
            if !matches!(app_error, Some(AppError::CommandFailed(_))) {
                eprintln!("stockroom: {:#}", e);
            }
            let status = app_error.map_or(1, AppError::exit_status);
            ExitCode::from(u8::try_from(status).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::load(cli.config.as_deref()).map_err(AppError::from)?;

    match cli.command {
        Commands::Key {
            path,
            crypter,
            force,
        } => local::key(&config, path, crypter, force),
        Commands::Identity { path, force } => local::identity(&path, force),
        Commands::Set {
            store,
            env,
            ttl,
            names,
        } => local::set(&config, &store, &names, env, ttl).await,
        Commands::Unset { store, names } => local::unset(&config, &store, &names).await,
        Commands::Env { store } => local::env(&config, &store).await,
        Commands::Exec {
            store,
            template,
            program,
        } => local::exec(&config, &store, template.as_deref(), &program).await,
        Commands::Remote(args) => remote::run(&config, args).await,
    }
}
