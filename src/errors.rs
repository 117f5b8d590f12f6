use std::fmt;

use thiserror::Error;

/// Convenience alias for fallible results in this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Field-level validation failure raised while building a request or config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }

    pub fn for_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}: {}", field, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Unified error type surfaced by the crate.
///
/// These are the *synchronous* errors raised to callers (`enqueue`, config
/// validation, job runners). Failures of the HTTP exchange itself are never
/// raised here; they travel to the user callback as an
/// [`ErrorValue`](crate::ErrorValue).
#[derive(Debug, Error)]
pub enum Error {
    /// `enqueue` was called while the processor is not accepting work.
    #[error("processor is not running (state: {state})")]
    NotRunning { state: &'static str },

    /// The local in-flight set is full and the backpressure strategy rejects.
    #[error("processor at capacity ({limit} requests in flight)")]
    MaxCapacity { limit: usize },

    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shared-KV inflight registry failure.
    #[error("registry error: {0}")]
    Registry(String),

    /// Payload store failure.
    #[error("payload store error: {0}")]
    Storage(String),

    /// The host job queue refused a push.
    #[error("job queue error: {0}")]
    Queue(String),

    #[error("unknown callback class: {0}")]
    UnknownCallback(String),

    #[error("unknown payload store: {0}")]
    UnknownStore(String),

    /// A `$ref` pointed at a payload that is no longer in its store.
    #[error("payload {key:?} missing from store {store:?}")]
    MissingPayload { store: String, key: String },

    /// HTTP client construction failure.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Registry(err.to_string())
    }
}
