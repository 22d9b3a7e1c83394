pub mod api;
pub mod fanout;
pub mod middleware;
pub mod service;

pub use api::{build_router, AppState, SharedState};
pub use fanout::{FanoutError, FanoutPublisher, FanoutReport, Submission, ValidationError};
pub use middleware::with_rate_limit;
pub use service::HttpService;
