use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::ProcessingType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one finished job, published to the result queue.
///
/// Only successful jobs produce one. Width and height are those of the
/// downloaded source image, not of the transformed output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedResult {
    pub source_url: String,
    /// `s3://<bucket>/<key>` of the uploaded object.
    #[serde(alias = "s3_path")]
    pub storage_path: String,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    pub trace_id: String,
    pub width: u32,
    pub height: u32,
    /// Format of the downloaded image ("jpeg", "png", ...).
    pub format: String,
    pub file_size: u64,
    pub processing_type: ProcessingType,
}
