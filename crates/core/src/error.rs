use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unknown ack mode {0:?} (expected on_delivery or after_processing)")]
    UnknownAckMode(String),

    #[error("unknown storage backend {0:?} (expected s3, local or memory)")]
    UnknownStorageBackend(String),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}
