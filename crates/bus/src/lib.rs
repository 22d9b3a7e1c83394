pub mod broker;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod messages;
pub mod metrics;
pub mod queue;
pub mod runner;
pub mod trace;
pub mod traits;
pub mod transport;

pub use broker::{QueueBroker, QueueRoute};
pub use delivery::{Acknowledger, Delivery, QueueMessage};
pub use envelope::{decode, DecodeError, Decoded, Envelope};
pub use error::BusError;
pub use memory::MemoryQueue;
pub use messages::queues;
pub use messages::{
    Job, JobMessage, MalformedJob, ProcessedResult, ProcessingType, ResultStatus,
    UnknownProcessingType,
};
pub use metrics::MetricsCollector;
pub use queue::{QueueEndpoints, ZmqQueueReceiver, ZmqQueueSender};
pub use runner::{Service, ServiceBuilder, ServiceRunner, ServiceRunnerConfig};
pub use trace::{Headers, TraceContext};
pub use traits::{QueueReceiver, QueueSender};
pub use transport::Transport;
