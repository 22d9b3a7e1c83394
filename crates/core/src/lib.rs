pub mod config;
pub mod error;

pub use config::{AckMode, Config, StorageBackend};
pub use error::ConfigError;
