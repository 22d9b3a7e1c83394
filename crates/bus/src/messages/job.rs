use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of transforms a job can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingType {
    Original,
    Grayscale,
    Resize,
    Blur,
    Sharpen,
}

impl ProcessingType {
    /// Every allowed type, in the order they are listed to clients.
    pub const ALL: [ProcessingType; 5] = [
        ProcessingType::Original,
        ProcessingType::Grayscale,
        ProcessingType::Resize,
        ProcessingType::Blur,
        ProcessingType::Sharpen,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Grayscale => "grayscale",
            Self::Resize => "resize",
            Self::Blur => "blur",
            Self::Sharpen => "sharpen",
        }
    }

    /// Names of all allowed types.
    pub fn allowed() -> Vec<&'static str> {
        Self::ALL.iter().map(|t| t.as_str()).collect()
    }
}

impl fmt::Display for ProcessingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown processing type {0:?}")]
pub struct UnknownProcessingType(pub String);

impl FromStr for ProcessingType {
    type Err = UnknownProcessingType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownProcessingType(s.to_string()))
    }
}

/// Job payload as it arrives off the work queue.
///
/// Producers write the singular shape `{url, processing_type}`. Older
/// producers wrote plural lists; both are accepted here and narrowed by
/// [`Job::try_from`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processing_types: Vec<String>,
}

/// Why a [`JobMessage`] cannot become a [`Job`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedJob {
    #[error("expected exactly one url, got {0}")]
    UrlCount(usize),

    #[error("expected exactly one processing type, got {0}")]
    ProcessingTypeCount(usize),

    #[error(transparent)]
    UnknownType(#[from] UnknownProcessingType),
}

/// One unit of work: a single url with a single transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub url: String,
    pub processing_type: ProcessingType,
}

impl Job {
    pub fn new(url: impl Into<String>, processing_type: ProcessingType) -> Self {
        Self {
            url: url.into(),
            processing_type,
        }
    }
}

impl TryFrom<JobMessage> for Job {
    type Error = MalformedJob;

    fn try_from(msg: JobMessage) -> Result<Self, Self::Error> {
        let mut urls: Vec<String> = msg.url.into_iter().chain(msg.urls).collect();
        let mut types: Vec<String> = msg
            .processing_type
            .into_iter()
            .chain(msg.processing_types)
            .collect();

        if urls.len() != 1 {
            return Err(MalformedJob::UrlCount(urls.len()));
        }
        if types.len() != 1 {
            return Err(MalformedJob::ProcessingTypeCount(types.len()));
        }
        let processing_type = types.remove(0).parse()?;
        Ok(Self {
            url: urls.remove(0),
            processing_type,
        })
    }
}
