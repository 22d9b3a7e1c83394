//! Queue and producer names shared by every service.

/// Work queue carrying one Job envelope per (url, processing type) pair.
pub const WORK_QUEUE: &str = "image.urls";

/// Result queue carrying ProcessedResult envelopes.
pub const RESULT_QUEUE: &str = "image.processed";

/// `source` written into envelopes by the ingress service.
pub const INGESTOR_SOURCE: &str = "url-ingestor";

/// `source` written into envelopes by the worker pool.
pub const FETCHER_SOURCE: &str = "image-fetcher";

/// Service name of the result persister, used in health responses.
pub const METADATA_SOURCE: &str = "metadata-service";
