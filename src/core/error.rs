use thiserror::Error;

use crate::core::program::RuntimeError;
use crate::core::task::BindError;
use crate::core::validator::Failure;

/// Errors surfaced to the caller of [`Session::execute`](crate::Session::execute).
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("binding error: {0}")]
    Bind(#[from] BindError),

    /// Terminal: every attempt within the budget failed.
    #[error("synthesis exhausted for {signature} after {attempts} attempt(s): {last_failure}")]
    SynthesisExhausted {
        signature: String,
        attempts: u32,
        last_failure: Failure,
    },

    /// A trusted implementation failed while running on new inputs.
    #[error("trusted implementation {signature} failed at runtime: {source}")]
    Runtime {
        signature: String,
        #[source]
        source: RuntimeError,
    },

    #[error("session '{0}' is already closed")]
    SessionClosed(String),
}

/// Failures of the durable artifact storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Failures of a single call to the generative backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SynthesisError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unparsable backend response: {0}")]
    Unparsable(String),
}

/// Rejections of a hand-edited implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EditError {
    #[error("no cached implementation for {0}")]
    UnknownKey(String),

    #[error("edited implementation rejected: {0}")]
    Rejected(Failure),
}
