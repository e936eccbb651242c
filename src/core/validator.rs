//! Validation of untrusted candidates.
//!
//! A candidate passes through three stages: load, a structural run against the real
//! bindings, and the caller's oracles. The result is a tagged [`Outcome`]; a failing
//! candidate is never partially trusted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

use crate::core::program::Callable;
use crate::core::shape::Shape;
use crate::core::task::ResolvedArgs;
use crate::core::LambdaValue;

/// The stage at which a synthesis attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureStage {
    /// Backend unreachable, timed out or answered with unparsable text.
    Synthesis,
    /// Source does not define a usable program of the right arity.
    Load,
    /// Program raised while running on the triggering bindings.
    Runtime,
    /// Program result violates the declared shape.
    Structural,
    /// An oracle rejected the program.
    Oracle,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureStage::Synthesis => "synthesis failure",
            FailureStage::Load => "load failure",
            FailureStage::Runtime => "runtime failure",
            FailureStage::Structural => "structural validation failure",
            FailureStage::Oracle => "oracle failure",
        };
        f.write_str(label)
    }
}

/// Why a candidate was rejected. The reason is fed back to the backend on retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{stage}: {reason}")]
pub struct Failure {
    pub stage: FailureStage,
    pub reason: String,
}

impl Failure {
    pub fn new(stage: FailureStage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Pass {
        /// Result of the structural run on the triggering bindings.
        output: LambdaValue,
        callable: Callable,
    },
    Fail(Failure),
}

/// Caller-supplied behavioural check over a loaded candidate.
///
/// Oracles pick their own canonical inputs, independent of the triggering call.
pub trait Oracle: Send + Sync {
    fn check(&self, callable: &Callable) -> bool;
}

impl<F> Oracle for F
where
    F: Fn(&Callable) -> bool + Send + Sync,
{
    fn check(&self, callable: &Callable) -> bool {
        self(callable)
    }
}

/// Runs candidates through load, structural and oracle checks.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    fuel: u64,
}

impl Validator {
    pub fn new(fuel: u64) -> Self {
        Self { fuel }
    }

    /// Loads `source` and checks it takes exactly `arity` parameters.
    pub fn load(&self, source: &str, arity: usize) -> Result<Callable, Failure> {
        Callable::load(source, arity, self.fuel)
            .map_err(|e| Failure::new(FailureStage::Load, e.to_string()))
    }

    pub fn validate(
        &self,
        source: &str,
        args: &ResolvedArgs,
        shape: Option<&Shape>,
        oracles: &[Arc<dyn Oracle>],
    ) -> Outcome {
        let callable = match self.load(source, args.len()) {
            Ok(callable) => callable,
            Err(failure) => return Outcome::Fail(failure),
        };

        let output = match callable.call(&args.values) {
            Ok(output) => output,
            Err(e) => {
                return Outcome::Fail(Failure::new(
                    FailureStage::Runtime,
                    format!("raised on the call's arguments: {}", e),
                ));
            }
        };

        if let Some(shape) = shape {
            if let Err(mismatch) = shape.check(&output) {
                return Outcome::Fail(Failure::new(
                    FailureStage::Structural,
                    format!("result does not satisfy {}: {}", shape, mismatch),
                ));
            }
        }

        for (i, oracle) in oracles.iter().enumerate() {
            // A panicking oracle counts as a rejection
            let accepted = catch_unwind(AssertUnwindSafe(|| oracle.check(&callable))).unwrap_or(false);
            if !accepted {
                return Outcome::Fail(Failure::new(
                    FailureStage::Oracle,
                    format!("oracle #{} rejected the implementation", i + 1),
                ));
            }
        }

        Outcome::Pass { output, callable }
    }
}
