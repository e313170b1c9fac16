use anyhow::Context;
use std::sync::Arc;
use stockroom::{
    auth::KeyTableAuthorizer,
    backend,
    command::CommandRegistry,
    config::AppConfig,
    crypter::{read_identity, read_key_file, CrypterKind},
    server::{Server, ServerConfig},
    store::SecretStore,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging first
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stockroom=info,stockroomd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting stockroomd v{}", env!("CARGO_PKG_VERSION"));

    // STOCKROOM_CONFIG names a config file; otherwise config/default and
    // config/local are used when present.
    let config_path = std::env::var("STOCKROOM_CONFIG").ok();
    let config = AppConfig::load(config_path.as_deref())?;
    info!("Configuration loaded");

    let host_key = read_identity(&config.server.host_key).with_context(|| {
        format!(
            "Failed to load host key (generate one with: stockroom identity {})",
            config.server.host_key.display()
        )
    })?;

    let crypter = {
        let key = read_key_file(&config.secrets.key_file).with_context(|| {
            format!(
                "Failed to load secrets key (generate one with: stockroom key {})",
                config.secrets.key_file.display()
            )
        })?;
        config.secrets.crypter.parse::<CrypterKind>()?.build(&key)?
    };

    let backend = backend::connect(&config.backend).await?;
    info!(
        kind = %config.backend.kind,
        namespace = %config.backend.namespace,
        "Backend ready"
    );

    let registry = Arc::new(CommandRegistry::standard(SecretStore::new(backend, crypter)));

    let authorizer = KeyTableAuthorizer::from_table(&config.permissions)?;
    if authorizer.is_empty() {
        warn!("No permissions configured; every connection will be refused");
    } else {
        info!("Loaded permissions for {} keys", authorizer.len());
    }

    let server_config = ServerConfig::from_section(&config.server, host_key)?;
    let server = Server::new(server_config, Arc::new(authorizer), registry);

    tokio::select! {
        result = server.listen_and_serve() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
