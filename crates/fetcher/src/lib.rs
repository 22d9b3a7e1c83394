pub mod pipeline;
pub mod pool;
pub mod processor;
pub mod storage;

pub use pipeline::{JobOutcome, JobPipeline, StageError};
pub use pool::{PoolConfig, WorkerPool, WorkerService};
pub use processor::{DownloadError, DownloadedImage, HttpImageSource, ImageSource};
pub use storage::{ImageStore, ObjectImageStore, StorageError};
