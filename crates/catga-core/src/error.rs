//! The workspace-wide error taxonomy.
//!
//! Every public operation returns [`Result<T>`]. Transient failures
//! (transport, persistence, timeouts) report `is_retryable() == true`
//! and are retried by the resilience pipeline; business failures are
//! surfaced as-is.

use std::time::Duration;

use crate::id::MessageId;

pub type Result<T> = std::result::Result<T, CatgaError>;

#[derive(Debug, thiserror::Error)]
pub enum CatgaError {
    /// No handler registered for a request type.
    #[error("no handler registered for {0}")]
    NoHandler(String),

    /// Request failed a declared validator. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Optimistic version mismatch (event append, flow update). A
    /// version of -1 denotes a stream that does not exist yet.
    #[error("concurrency conflict on {resource}: expected version {expected}, actual {actual}")]
    ConcurrencyConflict {
        resource: String,
        expected: i64,
        actual: i64,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Cancellation signal observed at a suspension point.
    #[error("operation cancelled")]
    Cancelled,

    #[error("transport failure: {message}")]
    Transport { message: String, retryable: bool },

    #[error("persistence failure: {message}")]
    Persistence { message: String, retryable: bool },

    /// Business handler returned a failure or panicked.
    #[error("handler failure: {message}")]
    Handler {
        message: String,
        code: Option<String>,
        retryable: bool,
    },

    /// Lock handle used after ownership expired or was taken over.
    #[error("lock lost on {0}")]
    LockLost(String),

    /// Bulk operation partly succeeded; `failed` lists the ids that did
    /// not ship.
    #[error("partial batch failure: {} of {total} messages failed", failed.len())]
    PartialBatch {
        total: usize,
        failed: Vec<MessageId>,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CatgaError {
    /// Transient failures are worth retrying; everything else is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            CatgaError::Transport { retryable, .. }
            | CatgaError::Persistence { retryable, .. }
            | CatgaError::Handler { retryable, .. } => *retryable,
            CatgaError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Transient transport failure.
    pub fn transport(message: impl Into<String>) -> Self {
        CatgaError::Transport { message: message.into(), retryable: true }
    }

    /// Transient persistence failure.
    pub fn persistence(message: impl Into<String>) -> Self {
        CatgaError::Persistence { message: message.into(), retryable: true }
    }

    /// Business failure, not retried unless explicitly flagged.
    pub fn handler(message: impl Into<String>) -> Self {
        CatgaError::Handler { message: message.into(), code: None, retryable: false }
    }

    pub fn handler_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        CatgaError::Handler {
            message: message.into(),
            code: Some(code.into()),
            retryable: false,
        }
    }
}

impl From<serde_json::Error> for CatgaError {
    fn from(e: serde_json::Error) -> Self {
        CatgaError::Serialization(e.to_string())
    }
}
