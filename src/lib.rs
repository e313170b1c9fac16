pub mod auth;
pub mod backend;
pub mod command;
pub mod config;
pub mod crypter;
pub mod error;
pub mod server;
pub mod store;
pub mod transport;
pub mod wire;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
