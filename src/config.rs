use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Remote command server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    /// Host to listen on
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// The only principal (user name) callers may present
    #[serde(default = "default_principal")]
    pub principal: String,
    /// Path to the server's Ed25519 host key (base64 seed)
    #[serde(default = "default_host_key")]
    pub host_key: PathBuf,
    /// Transport ciphers the server accepts, in order of preference
    #[serde(default = "default_ciphers")]
    pub ciphers: Vec<String>,
    /// Handshake MACs the server accepts, in order of preference
    #[serde(default = "default_macs")]
    pub macs: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2222
}

fn default_principal() -> String {
    "stockroom".to_string()
}

fn default_host_key() -> PathBuf {
    PathBuf::from("/etc/stockroom/host_key")
}

fn default_ciphers() -> Vec<String> {
    vec!["chacha20-poly1305".to_string(), "aes256-gcm".to_string()]
}

fn default_macs() -> Vec<String> {
    vec!["hmac-sha512".to_string(), "hmac-sha256".to_string()]
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            principal: default_principal(),
            host_key: default_host_key(),
            ciphers: default_ciphers(),
            macs: default_macs(),
        }
    }
}

impl ServerSection {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Long-term key used to encrypt stored secrets
#[derive(Debug, Deserialize, Clone)]
pub struct SecretsConfig {
    /// Path to the 160-byte key file (mode 0600 or 0400)
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    /// Crypter implementation
    #[serde(default = "default_crypter")]
    pub crypter: String,
}

fn default_key_file() -> PathBuf {
    PathBuf::from("/etc/stockroom/key")
}

fn default_crypter() -> String {
    "std".to_string()
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            key_file: default_key_file(),
            crypter: default_crypter(),
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Backend implementation: `memory` or `sqlite`
    #[serde(default = "default_backend_kind")]
    pub kind: String,
    /// Connection URL (ignored by `memory`)
    #[serde(default = "default_backend_url")]
    pub url: String,
    /// Namespace prefix for every stored variable
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_backend_kind() -> String {
    "sqlite".to_string()
}

fn default_backend_url() -> String {
    "sqlite:///var/lib/stockroom/secrets.db?mode=rwc".to_string()
}

fn default_namespace() -> String {
    "stockroom".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            url: default_backend_url(),
            namespace: default_namespace(),
            max_connections: default_max_connections(),
        }
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    /// Command name -> base64 Ed25519 public keys allowed to run it
    #[serde(default)]
    pub permissions: HashMap<String, Vec<String>>,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        builder = match path {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder
                // Start with default config file
                .add_source(File::with_name("config/default").required(false))
                // Override with local config if present
                .add_source(File::with_name("config/local").required(false)),
        };

        builder
            // Override with environment variables (prefix: STOCKROOM_)
            // e.g., STOCKROOM_SERVER__PORT, STOCKROOM_BACKEND__URL
            .add_source(
                Environment::with_prefix("STOCKROOM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Parse configuration from a TOML document
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}
