use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// Wire-format wrapper carried by every queue message.
///
/// The envelope is JSON. `timestamp` is stamped by the producer at encode
/// time and is never rewritten downstream, so consumers can treat it as the
/// moment the message was created. The payload is kept as raw JSON so that
/// decoding the outer wrapper never depends on the payload type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Caller-supplied trace id. Empty when the caller provided none.
    pub trace_id: String,

    /// Name of the producing service (e.g. "url-ingestor").
    pub source: String,

    /// When the producer encoded this message.
    pub timestamp: DateTime<Utc>,

    /// Serialized payload, embedded verbatim.
    pub payload: Box<RawValue>,
}

/// A successfully decoded envelope together with its typed payload.
#[derive(Debug, Clone)]
pub struct Decoded<T> {
    pub envelope: Envelope,
    pub payload: T,
}

/// Failure modes of [`decode`].
///
/// The two stages are kept apart: if only the payload is bad, the outer
/// envelope is still handed back so the caller can log its trace id and
/// source.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("malformed payload from {}: {error}", .envelope.source)]
    Payload {
        envelope: Box<Envelope>,
        #[source]
        error: serde_json::Error,
    },
}

impl DecodeError {
    /// The outer envelope, when it could be decoded.
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Envelope(_) => None,
            Self::Payload { envelope, .. } => Some(envelope),
        }
    }

    /// Trace id of the failed message, or "" when the envelope itself was bad.
    pub fn trace_id(&self) -> &str {
        self.envelope().map(|e| e.trace_id.as_str()).unwrap_or("")
    }
}

impl Envelope {
    /// Wrap `payload` in a fresh envelope stamped with the current UTC time.
    pub fn new<T: Serialize + ?Sized>(
        trace_id: impl Into<String>,
        source: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            trace_id: trace_id.into(),
            source: source.into(),
            timestamp: Utc::now(),
            payload: serde_json::value::to_raw_value(payload)?,
        })
    }

    /// Serialize payload and wrapper in one step. Any serialization error
    /// aborts the whole operation.
    pub fn encode<T: Serialize + ?Sized>(
        trace_id: &str,
        source: &str,
        payload: &T,
    ) -> Result<Vec<u8>, serde_json::Error> {
        Self::new(trace_id, source, payload)?.to_bytes()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize the embedded payload into the expected type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.payload.get())
    }
}

/// Two-stage decode: outer envelope first, then the typed payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<Decoded<T>, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(bytes).map_err(DecodeError::Envelope)?;
    match envelope.payload::<T>() {
        Ok(payload) => Ok(Decoded { envelope, payload }),
        Err(error) => Err(DecodeError::Payload {
            envelope: Box::new(envelope),
            error,
        }),
    }
}
