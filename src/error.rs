//! Error types for reconcile-core.

use thiserror::Error;

/// Result type alias using reconcile-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during reconciliation operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Network timeout, HTTP 429/5xx, or LLM poll timeout. Retryable by the LLM Client;
    /// re-surfaces only once retries are exhausted.
    #[error("transient remote error calling {endpoint}: {message}")]
    TransientRemote { endpoint: String, message: String },

    /// HTTP 4xx (not 429), or a malformed response with no extractable content.
    /// Not retryable.
    #[error("permanent remote error calling {endpoint}: {message}")]
    PermanentRemote { endpoint: String, message: String },

    /// Fabric has no slot available under a non-blocking acquisition path.
    /// The blocking `Acquire` never returns this; kept for callers that
    /// explicitly opt into try-acquire semantics.
    #[error("quota exhausted for task class {task_class}")]
    Quota { task_class: String },

    /// Any database fault. Always fatal to the current pipeline stage.
    #[error("storage error: {0}")]
    Storage(String),

    /// Current-version row not found for a (taskId, code) lookup.
    #[error("no current row for task {task_id} code {code}")]
    NotFound { task_id: String, code: String },

    /// A malformed input row (missing code or name). The row is dropped and
    /// recorded in Metrics; never fatal to the stage.
    #[error("validation error: {0}")]
    Validation(String),

    /// Context/token cancellation. Propagated upward without being wrapped
    /// as a pipeline failure when the caller cancelled intentionally.
    #[error("operation cancelled")]
    Cancelled,

    /// A pipeline stage failed terminally; wraps the underlying cause per
    /// the propagation policy (stage name, cause, retryable hint).
    #[error("stage {stage} failed: {cause}")]
    Stage {
        stage: String,
        #[source]
        cause: Box<Error>,
        retryable: bool,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn transient_remote(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientRemote {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn permanent_remote(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PermanentRemote {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn quota(task_class: impl Into<String>) -> Self {
        Self::Quota {
            task_class: task_class.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn not_found(task_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self::NotFound {
            task_id: task_id.into(),
            code: code.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn stage(stage: impl Into<String>, cause: Error, retryable: bool) -> Self {
        Self::Stage {
            stage: stage.into(),
            cause: Box::new(cause),
            retryable,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether a retry loop should treat this error as worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientRemote { .. })
    }

    /// Whether this error represents intentional cancellation, which callers
    /// should propagate rather than treat as a pipeline failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
