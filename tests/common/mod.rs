#![allow(dead_code)]

use async_trait::async_trait;
use lambdai::{Engine, EngineConfig, MemoryTraceSink, SynthesisBackend, SynthesisError, SynthesisRequest};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Backend answering from a script, repeating the last response once exhausted.
pub struct MockBackend {
    script: Mutex<Vec<Result<String, SynthesisError>>>,
    calls: AtomicUsize,
    delay: Duration,
    requests: Mutex<Vec<SynthesisRequest>>,
}

impl MockBackend {
    pub fn new(script: Vec<Result<String, SynthesisError>>) -> Arc<Self> {
        Self::with_delay(script, Duration::ZERO)
    }

    pub fn with_delay(script: Vec<Result<String, SynthesisError>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
            delay,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Always answers with `program`.
    pub fn always(program: Value) -> Arc<Self> {
        Self::new(vec![answer(program)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SynthesisRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SynthesisBackend for MockBackend {
    async fn generate(&self, request: &SynthesisRequest) -> Result<String, SynthesisError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let script = self.script.lock().unwrap();
        script[n.min(script.len() - 1)].clone()
    }
}

/// A backend answer wrapping `program` the way models are asked to.
pub fn answer(program: Value) -> Result<String, SynthesisError> {
    Ok(format!(
        "```json\n{}\n```",
        json!({"program": program, "explanation": "generated", "complexity": "O(n)"})
    ))
}

pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
        .with_synthesis_timeout(Duration::from_secs(5))
}

/// Memory-only engine with a trace collector.
pub fn engine(backend: Arc<MockBackend>) -> (Engine, Arc<MemoryTraceSink>) {
    let sink = Arc::new(MemoryTraceSink::new());
    let engine = Engine::builder(backend)
        .config(fast_config())
        .memory_only()
        .trace_sink(sink.clone())
        .build();
    (engine, sink)
}

/// `merge a and b`: concatenation, still nested for lists of rows.
pub fn merge_nested() -> Value {
    json!({"name": "merge", "params": ["a", "b"],
           "body": {"op": "concat", "args": [{"var": "a"}, {"var": "b"}]}})
}

/// `merge a and b`: flattened and sorted.
pub fn merge_sorted() -> Value {
    json!({"name": "merge", "params": ["a", "b"],
           "body": {"op": "sort", "args": [{"op": "flatten", "args": [
               {"op": "concat", "args": [{"var": "a"}, {"var": "b"}]}]}]}})
}

/// `double x`.
pub fn double() -> Value {
    json!({"name": "double", "params": ["x"], "body": {"op": "mul", "args": [{"var": "x"}, 2]}})
}
