//! The execution engine: signature, cache, synthesis and validation tied together.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::core::cache::{CacheEntry, CacheStore, ClaimAttempt, ClaimGuard, Trust};
use crate::core::config::EngineConfig;
use crate::core::error::{EditError, ExecuteError};
use crate::core::program::{Callable, RuntimeError};
use crate::core::session::{Call, Scope, Session};
use crate::core::shape::Shape;
use crate::core::signature::Signature;
use crate::core::storage::{ArtifactStorage, FileStorage};
use crate::core::synthesis::{SynthesisBackend, SynthesisClient, SynthesisRequest};
use crate::core::task::{ResolvedArgs, TaskDescription};
use crate::core::trace::{FileTraceSink, SynthesisTrace, TraceSink, TraceStep, USER_EDIT};
use crate::core::validator::{Failure, FailureStage, Oracle, Outcome, Validator};
use crate::core::LambdaValue;

enum Persistence {
    Files,
    Custom(Arc<dyn ArtifactStorage>),
    MemoryOnly,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    backend: Arc<dyn SynthesisBackend>,
    config: EngineConfig,
    persistence: Persistence,
    traces: Option<Arc<dyn TraceSink>>,
    file_traces: bool,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Custom durable storage instead of files under the cache directory.
    pub fn storage(mut self, storage: Arc<dyn ArtifactStorage>) -> Self {
        self.persistence = Persistence::Custom(storage);
        self
    }

    /// Keep the cache in memory only.
    pub fn memory_only(mut self) -> Self {
        self.persistence = Persistence::MemoryOnly;
        self
    }

    pub fn trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.traces = Some(sink);
        self
    }

    /// Write traces to `<cache_dir>/traces/<key>.trace.json`.
    pub fn file_traces(mut self) -> Self {
        self.file_traces = true;
        self
    }

    pub fn build(self) -> Engine {
        let storage: Option<Arc<dyn ArtifactStorage>> = match self.persistence {
            Persistence::Files => Some(Arc::new(FileStorage::new(&self.config.cache_dir))),
            Persistence::Custom(storage) => Some(storage),
            Persistence::MemoryOnly => None,
        };
        let cache = match storage {
            Some(storage) => {
                let cache = CacheStore::with_storage(storage);
                cache.warm();
                cache
            }
            None => CacheStore::new(),
        };
        let traces = match (self.traces, self.file_traces) {
            (Some(sink), _) => Some(sink),
            (None, true) => Some(Arc::new(FileTraceSink::new(self.config.cache_dir.join("traces")))
                as Arc<dyn TraceSink>),
            (None, false) => None,
        };

        Engine {
            inner: Arc::new(EngineInner {
                client: SynthesisClient::new(self.backend, self.config.synthesis_timeout),
                validator: Validator::new(self.config.eval_fuel),
                config: self.config,
                cache: Arc::new(cache),
                loaded: RwLock::new(HashMap::new()),
                traces,
            }),
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    cache: Arc<CacheStore>,
    client: SynthesisClient,
    validator: Validator,
    // Parsed programs of cached entries, keyed by signature; reused while the source matches
    loaded: RwLock<HashMap<String, (String, Callable)>>,
    traces: Option<Arc<dyn TraceSink>>,
}

/// Resolves calls to validated, cached implementations. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Why a trusted entry could not serve a call.
enum TrustedFault {
    /// Raised on the new inputs; surfaced to the caller.
    Runtime(RuntimeError),
    /// Failed to load or returned the wrong shape; re-validated in the same call.
    Invalid(Failure),
}

/// Everything one call needs while resolving.
struct Resolution<'a> {
    signature: Signature,
    task: TaskDescription,
    args: ResolvedArgs,
    shape: Option<&'a Shape>,
    oracles: &'a [Arc<dyn Oracle>],
    scope: &'a Scope,
}

impl Engine {
    /// Engine configured from `LAMBDAI_*` environment variables, with its on-disk cache
    /// under `.lambdai` unless `LAMBDAI_CACHE_DIR` says otherwise.
    pub fn new(backend: Arc<dyn SynthesisBackend>) -> Self {
        Self::builder(backend).config(EngineConfig::from_env()).build()
    }

    pub fn builder(backend: Arc<dyn SynthesisBackend>) -> EngineBuilder {
        EngineBuilder {
            backend,
            config: EngineConfig::default(),
            persistence: Persistence::Files,
            traces: None,
            file_traces: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    /// Opens a root session. `label` becomes the namespace of its signatures.
    pub fn session(&self, label: impl Into<String>) -> Session {
        Session::new(self.clone(), Scope::root(label.into()))
    }

    /// Snapshot of every cached implementation, ordered by key.
    pub fn entries(&self) -> Vec<Arc<CacheEntry>> {
        self.inner.cache.entries()
    }

    /// Process-wide view of one entry.
    pub fn entry(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.inner.cache.lookup(key, &[])
    }

    /// Forgets an implementation; the next matching call synthesizes afresh.
    pub fn invalidate(&self, key: &str) -> bool {
        self.forget_loaded(key);
        let existed = self.inner.cache.invalidate(key);
        if existed {
            log::info!("Invalidated {}", key);
        }
        existed
    }

    /// Installs a hand-edited implementation for an existing key as trusted.
    ///
    /// The source must load and take the same number of parameters as the entry it
    /// replaces. No oracle run is possible here: the edit is trusted as given.
    pub fn replace_source(
        &self,
        key: &str,
        source: impl Into<String>,
    ) -> Result<Arc<CacheEntry>, EditError> {
        let source = source.into();
        let current = self
            .inner
            .cache
            .lookup(key, &[])
            .ok_or_else(|| EditError::UnknownKey(key.to_string()))?;
        let arity = crate::core::program::Program::load(&current.source)
            .map(|p| p.arity())
            .map_err(|e| EditError::Rejected(Failure::new(FailureStage::Load, e.to_string())))?;
        self.inner
            .validator
            .load(&source, arity)
            .map_err(EditError::Rejected)?;

        let mut entry = CacheEntry::new(key, current.prompt.clone(), source.clone(), Trust::Trusted);
        entry.explanation = current.explanation.clone();
        entry.complexity = current.complexity.clone();
        self.forget_loaded(key);
        let entry = self.inner.cache.put(entry);

        let mut trace = SynthesisTrace::new(key, current.prompt.clone());
        trace.push(TraceStep::new(0, USER_EDIT).with_code(source));
        self.record(trace);
        log::info!("Installed edited implementation for {}", key);
        Ok(entry)
    }

    pub(crate) async fn execute(&self, scope: &Scope, call: Call) -> Result<LambdaValue, ExecuteError> {
        if scope.is_closed() {
            return Err(ExecuteError::SessionClosed(scope.label().to_string()));
        }
        let task = TaskDescription::parse(&call.template)?;
        let args = task.bind(&call.bindings)?;
        let signature = Signature::build(
            &task,
            &args,
            call.shape.as_ref(),
            scope.label(),
            &self.inner.config.fingerprint_limits(),
        );
        let resolution = Resolution {
            signature,
            task,
            args,
            shape: call.shape.as_ref(),
            oracles: &call.oracles,
            scope,
        };
        self.resolve(&resolution).await
    }

    async fn resolve(&self, r: &Resolution<'_>) -> Result<LambdaValue, ExecuteError> {
        let key = &r.signature.key;
        let lineage = r.scope.lineage();
        let mut prior: Option<Failure> = None;
        loop {
            if let Some(entry) = self.inner.cache.lookup(key, &lineage) {
                if entry.is_trusted() {
                    match self.invoke_trusted(&entry, r) {
                        Ok(output) => {
                            log::debug!("Cache hit for {}", r.signature);
                            return Ok(output);
                        }
                        Err(TrustedFault::Runtime(e)) => return Err(self.demote_after_runtime(r, e)),
                        Err(TrustedFault::Invalid(failure)) => {
                            self.demote(r, &failure);
                            prior = Some(failure);
                        }
                    }
                }
            }

            match self.inner.cache.claim(key, self.inner.config.claim_ttl()) {
                ClaimAttempt::Acquired(guard) => return self.resolve_claimed(r, &lineage, prior, guard).await,
                ClaimAttempt::Busy(busy) => {
                    log::debug!("Waiting for in-flight synthesis of {}", r.signature);
                    busy.wait().await;
                }
            }
        }
    }

    /// Runs with the single-flight claim held. The claim is released when `_guard` drops.
    async fn resolve_claimed(
        &self,
        r: &Resolution<'_>,
        lineage: &[uuid::Uuid],
        mut prior: Option<Failure>,
        _guard: ClaimGuard,
    ) -> Result<LambdaValue, ExecuteError> {
        let key = &r.signature.key;
        let mut trace = SynthesisTrace::new(key.clone(), r.signature.prompt.clone());

        // Another caller may have finished between our lookup and the claim
        if let Some(entry) = self.inner.cache.lookup(key, lineage) {
            let mut revalidate = !entry.is_trusted();
            if entry.is_trusted() {
                match self.invoke_trusted(&entry, r) {
                    Ok(output) => return Ok(output),
                    Err(TrustedFault::Runtime(e)) => return Err(self.demote_after_runtime(r, e)),
                    Err(TrustedFault::Invalid(failure)) => {
                        self.demote(r, &failure);
                        prior = Some(failure);
                    }
                }
            } else if prior.is_some() {
                // Just demoted by this call; the cached source already failed these inputs
                revalidate = false;
            }

            if revalidate {
                match self.inner.validator.validate(&entry.source, &r.args, r.shape, r.oracles) {
                    Outcome::Pass { output, callable } => {
                        let mut trusted = CacheEntry::clone(&entry);
                        trusted.trust = Trust::Trusted;
                        trusted.origin = None;
                        trusted.last_validated_at = Some(chrono::Utc::now());
                        self.remember_loaded(key, &trusted.source, callable);
                        self.inner.cache.put(trusted);
                        trace.push(TraceStep::new(0, "revalidated").with_code(entry.source.clone()));
                        self.record(trace);
                        log::info!("Re-validated cached implementation for {}", r.signature);
                        return Ok(output);
                    }
                    Outcome::Fail(failure) => {
                        log::debug!("Cached implementation for {} failed re-validation: {}", r.signature, failure);
                        trace.push(
                            TraceStep::new(0, failure.stage.to_string())
                                .with_code(entry.source.clone())
                                .with_error(failure.reason.clone()),
                        );
                        prior = Some(failure);
                    }
                }
            }
        }

        self.synthesize(r, prior, trace).await
    }

    async fn synthesize(
        &self,
        r: &Resolution<'_>,
        prior: Option<Failure>,
        mut trace: SynthesisTrace,
    ) -> Result<LambdaValue, ExecuteError> {
        let config = &self.inner.config;
        let key = &r.signature.key;
        let base = SynthesisRequest::new(
            key.clone(),
            &r.task,
            &r.args,
            r.shape,
            &config.fingerprint_limits(),
            config.sample_chars,
        );

        let mut feedback = prior;
        let mut last_failure = feedback
            .clone()
            .unwrap_or_else(|| Failure::new(FailureStage::Synthesis, "no attempt made"));
        let mut provisional = None;

        for attempt in 1..=config.max_attempts {
            let request = base.clone().with_attempt(attempt, feedback.clone());
            let candidate = match self.inner.client.synthesize(&request).await {
                Ok(candidate) => candidate,
                Err(e) => {
                    log::warn!("Synthesis attempt {} for {} failed: {}", attempt, r.signature, e);
                    trace.push(TraceStep::new(attempt, FailureStage::Synthesis.to_string()).with_error(e.to_string()));
                    last_failure = Failure::new(FailureStage::Synthesis, e.to_string());
                    if attempt < config.max_attempts {
                        tokio::time::sleep(config.backoff_for(attempt)).await;
                    }
                    continue;
                }
            };

            match self.inner.validator.validate(&candidate.source, &r.args, r.shape, r.oracles) {
                Outcome::Pass { output, callable } => {
                    let mut entry = CacheEntry::new(
                        key.clone(),
                        r.signature.prompt.clone(),
                        candidate.source.clone(),
                        Trust::Trusted,
                    );
                    entry.explanation = candidate.explanation.clone();
                    entry.complexity = candidate.complexity.clone();
                    self.remember_loaded(key, &candidate.source, callable);
                    self.inner.cache.put(entry);

                    trace.push(
                        TraceStep::new(attempt, "pass")
                            .with_code(candidate.source)
                            .with_notes(&candidate.explanation, &candidate.complexity),
                    );
                    self.record(trace);
                    log::info!("Synthesized {} in {} attempt(s)", r.signature, attempt);
                    return Ok(output);
                }
                Outcome::Fail(failure) => {
                    log::debug!("Attempt {} for {} rejected: {}", attempt, r.signature, failure);
                    trace.push(
                        TraceStep::new(attempt, failure.stage.to_string())
                            .with_code(candidate.source.clone())
                            .with_notes(&candidate.explanation, &candidate.complexity)
                            .with_error(failure.reason.clone()),
                    );
                    if failure.stage != FailureStage::Load {
                        provisional = Some(candidate);
                    }
                    feedback = Some(failure.clone());
                    last_failure = failure;
                }
            }
        }

        // Keep the last loadable candidate for this session to re-validate on later calls
        if let Some(candidate) = provisional {
            let mut entry = CacheEntry::new(
                key.clone(),
                r.signature.prompt.clone(),
                candidate.source,
                Trust::Untrusted,
            );
            entry.explanation = candidate.explanation;
            entry.complexity = candidate.complexity;
            self.inner.cache.put_provisional(entry, r.scope.id());
        }
        self.record(trace);
        log::warn!(
            "Giving up on {} after {} attempt(s): {}",
            r.signature,
            config.max_attempts,
            last_failure
        );
        Err(ExecuteError::SynthesisExhausted {
            signature: key.clone(),
            attempts: config.max_attempts,
            last_failure,
        })
    }

    fn invoke_trusted(&self, entry: &CacheEntry, r: &Resolution<'_>) -> Result<LambdaValue, TrustedFault> {
        let callable = self.loaded(entry, r.args.len()).map_err(TrustedFault::Invalid)?;
        let output = callable.call(&r.args.values).map_err(TrustedFault::Runtime)?;
        if let Some(shape) = r.shape {
            if let Err(mismatch) = shape.check(&output) {
                return Err(TrustedFault::Invalid(Failure::new(
                    FailureStage::Structural,
                    format!("cached result does not satisfy {}: {}", shape, mismatch),
                )));
            }
        }
        Ok(output)
    }

    fn demote(&self, r: &Resolution<'_>, failure: &Failure) {
        log::warn!("Demoting cached implementation for {}: {}", r.signature, failure);
        self.inner.cache.demote(&r.signature.key);
        let mut trace = SynthesisTrace::new(r.signature.key.clone(), r.signature.prompt.clone());
        trace.push(TraceStep::new(0, "demoted").with_error(failure.to_string()));
        self.record(trace);
    }

    fn demote_after_runtime(&self, r: &Resolution<'_>, error: RuntimeError) -> ExecuteError {
        self.demote(r, &Failure::new(FailureStage::Runtime, error.to_string()));
        ExecuteError::Runtime {
            signature: r.signature.key.clone(),
            source: error,
        }
    }

    fn loaded(&self, entry: &CacheEntry, arity: usize) -> Result<Callable, Failure> {
        {
            let loaded = self.inner.loaded.read().unwrap_or_else(PoisonError::into_inner);
            if let Some((source, callable)) = loaded.get(&entry.key) {
                if *source == entry.source && callable.arity() == arity {
                    return Ok(callable.clone());
                }
            }
        }
        let callable = self.inner.validator.load(&entry.source, arity)?;
        self.remember_loaded(&entry.key, &entry.source, callable.clone());
        Ok(callable)
    }

    fn remember_loaded(&self, key: &str, source: &str, callable: Callable) {
        self.inner
            .loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (source.to_string(), callable));
    }

    fn forget_loaded(&self, key: &str) {
        self.inner
            .loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn record(&self, trace: SynthesisTrace) {
        if trace.is_empty() {
            return;
        }
        if let Some(sink) = &self.inner.traces {
            sink.record(trace);
        }
    }
}
