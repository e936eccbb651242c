//! # lambdai
//!
//! Describe a function in natural language, pass example arguments, and get back the
//! result of a validated, cached implementation.
//!
//! ## Features
//!
//! - **Signature Cache**: implementations are keyed by the task prompt and the *shape* of
//!   the arguments, never their values, so structurally similar calls reuse them
//! - **Validation Before Trust**: every candidate is loaded, run on the real arguments,
//!   checked against the declared shape and the caller's oracles
//! - **Single-Flight Synthesis**: concurrent identical calls wait for one synthesis
//! - **Sessions**: unvalidated candidates stay private to the session that made them
//! - **Optional LLM Backends**: Ollama and DeepSeek clients behind the `llm` feature
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lambdai::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! struct MyBackend;
//!
//! #[async_trait::async_trait]
//! impl SynthesisBackend for MyBackend {
//!     async fn generate(&self, _request: &SynthesisRequest) -> Result<String, SynthesisError> {
//!         // Send _request.render_prompt() to a model and return its answer
//!         Err(SynthesisError::Backend("not wired up".into()))
//!     }
//! }
//!
//! # async fn run() -> Result<(), ExecuteError> {
//! let engine = Engine::new(Arc::new(MyBackend));
//! let session = engine.session("demo");
//! let merged = session
//!     .call("merge {a} and {b} into one sorted list")
//!     .arg(json!([["123"]]))
//!     .arg(json!([["456"]]))
//!     .shape(shape!("list[str]"))
//!     .oracle(|f: &Callable| {
//!         f.call(&[json!([["2"]]), json!([["1"]])]).ok() == Some(json!(["1", "2"]))
//!     })
//!     .await?;
//! assert_eq!(merged, json!(["123", "456"]));
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`Engine`] / [`Session`]: entry points
//! - [`program`]: the JSON expression language implementations are written in
//! - [`prelude`]: commonly used types (import with `use lambdai::prelude::*`)

mod core;

// ============================================================================
// Public Re-exports
// ============================================================================

pub use crate::core::LambdaValue;

pub use crate::core::cache::{CacheEntry, CacheStore, Trust};
pub use crate::core::config::EngineConfig;
pub use crate::core::engine::{Engine, EngineBuilder};
pub use crate::core::error::{EditError, ExecuteError, StorageError, SynthesisError};
pub use crate::core::program;
pub use crate::core::program::{Callable, Program, ProgramError, RuntimeError};
pub use crate::core::session::{Call, CallBuilder, Session, DEFAULT_NAMESPACE};
pub use crate::core::shape::{Shape, ShapeMismatch, ShapeParseError, TYPE_TAG};
pub use crate::core::signature::{fingerprint, FingerprintLimits, Signature};
pub use crate::core::storage::{ArtifactStorage, FileStorage, MemoryStorage};
pub use crate::core::synthesis::{
    parse_response, Candidate, ParamSample, SynthesisBackend, SynthesisClient, SynthesisRequest,
};
pub use crate::core::task::{BindError, Binding, ResolvedArgs, TaskDescription};
pub use crate::core::trace::{FileTraceSink, MemoryTraceSink, SynthesisTrace, TraceSink, TraceStep};
pub use crate::core::validator::{Failure, FailureStage, Oracle, Outcome, Validator};

/// Imports everything needed to open sessions and make calls.
///
/// # Example
/// ```rust
/// use lambdai::prelude::*;
/// ```
pub mod prelude {
    pub use super::{
        shape, Call, Callable, Engine, EngineConfig, ExecuteError, Failure, FailureStage,
        LambdaValue, Oracle, Session, Shape, SynthesisBackend, SynthesisError,
        SynthesisRequest,
    };
}

// ============================================================================
// LLM Feature
// ============================================================================

#[cfg(feature = "llm")]
pub mod llm;

#[cfg(feature = "llm")]
pub use llm::{error::LLMError, Client};

// ============================================================================
// Library Metadata
// ============================================================================

/// The version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The name of this crate.
pub const NAME: &str = env!("CARGO_PKG_NAME");
