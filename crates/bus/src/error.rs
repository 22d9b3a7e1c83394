use thiserror::Error;

/// Errors that can occur in the queue messaging layer.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("queue {0} is closed")]
    Closed(String),

    #[error("acknowledgement failed: {0}")]
    Ack(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
