//! Payload types that travel inside envelopes.
//!
//! This module provides:
//! - **Jobs** (`job`): one (url, processing type) unit of work on the work queue
//! - **Results** (`result`): the outcome record published to the result queue
//! - **Queue names** (`queues`): canonical queue and producer names

pub mod job;
pub mod queues;
pub mod result;

pub use job::*;
pub use result::*;
