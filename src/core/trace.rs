use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use crate::core::error::StorageError;

/// Stage label for steps recorded from a hand edit rather than the backend.
pub const USER_EDIT: &str = "(USER EDIT)";

/// One attempt (or event) while resolving a signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub attempt: u32,
    /// "pass", a failure stage, or [`USER_EDIT`].
    pub stage: String,
    pub code: Option<String>,
    pub explanation: Option<String>,
    pub complexity: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TraceStep {
    pub fn new(attempt: u32, stage: impl Into<String>) -> Self {
        Self {
            attempt,
            stage: stage.into(),
            code: None,
            explanation: None,
            complexity: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_notes(mut self, explanation: &str, complexity: &str) -> Self {
        self.explanation = (!explanation.is_empty()).then(|| explanation.to_string());
        self.complexity = (!complexity.is_empty()).then(|| complexity.to_string());
        self
    }
}

/// History of how the implementation for one signature was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisTrace {
    pub signature: String,
    pub prompt: String,
    pub steps: Vec<TraceStep>,
}

impl SynthesisTrace {
    pub fn new(signature: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            prompt: prompt.into(),
            steps: Vec::new(),
        }
    }

    pub fn push(&mut self, step: TraceStep) {
        self.steps.push(step);
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Receives finished traces. Recording must not fail the call that produced it.
pub trait TraceSink: Send + Sync {
    fn record(&self, trace: SynthesisTrace);
}

/// Keeps traces in memory.
#[derive(Default)]
pub struct MemoryTraceSink {
    traces: Mutex<Vec<SynthesisTrace>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<SynthesisTrace> {
        self.traces.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Traces recorded for one signature key, oldest first.
    pub fn traces_for(&self, signature: &str) -> Vec<SynthesisTrace> {
        self.traces()
            .into_iter()
            .filter(|t| t.signature == signature)
            .collect()
    }
}

impl TraceSink for MemoryTraceSink {
    fn record(&self, trace: SynthesisTrace) {
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(trace);
    }
}

/// Writes `<dir>/<key>.trace.json`, appending steps to any earlier trace of the key.
pub struct FileTraceSink {
    dir: PathBuf,
    // Serializes read-modify-write of trace files
    lock: Mutex<()>,
}

impl FileTraceSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn path_for(&self, signature: &str) -> PathBuf {
        self.dir.join(format!("{}.trace.json", signature))
    }

    pub fn load(&self, signature: &str) -> Result<Option<SynthesisTrace>, StorageError> {
        match fs::read_to_string(self.path_for(signature)) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn append(&self, trace: SynthesisTrace) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let merged = match self.load(&trace.signature) {
            Ok(Some(mut existing)) => {
                existing.prompt = trace.prompt;
                existing.steps.extend(trace.steps);
                existing
            }
            // A corrupt trace file is replaced rather than blocking new history
            Ok(None) | Err(StorageError::Serialization(_)) => trace,
            Err(e) => return Err(e),
        };
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path_for(&merged.signature), serde_json::to_string_pretty(&merged)?)?;
        Ok(())
    }
}

impl TraceSink for FileTraceSink {
    fn record(&self, trace: SynthesisTrace) {
        let signature = trace.signature.clone();
        if let Err(e) = self.append(trace) {
            log::warn!("Could not write synthesis trace for {}: {}", signature, e);
        }
    }
}
