//! Sessions: stack-scoped contexts for calls.
//!
//! A session labels its calls with a namespace (part of every signature) and owns the
//! provisional entries created while it is open. Closing it, explicitly or by drop,
//! discards those entries. Nested sessions see their ancestors' provisional entries;
//! siblings never see each other's.

use futures::future::BoxFuture;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::core::engine::Engine;
use crate::core::error::ExecuteError;
use crate::core::shape::Shape;
use crate::core::task::Binding;
use crate::core::validator::Oracle;
use crate::core::LambdaValue;

pub const DEFAULT_NAMESPACE: &str = "default";

pub(crate) struct Scope {
    id: Uuid,
    label: String,
    parent: Option<Arc<Scope>>,
    closed: AtomicBool,
}

impl Scope {
    pub(crate) fn root(label: String) -> Self {
        let label = if label.trim().is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            label
        };
        Self {
            id: Uuid::new_v4(),
            label,
            parent: None,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// This scope's id followed by its ancestors', innermost first.
    pub(crate) fn lineage(&self) -> Vec<Uuid> {
        let mut ids = vec![self.id];
        let mut current = self.parent.as_ref();
        while let Some(scope) = current {
            ids.push(scope.id);
            current = scope.parent.as_ref();
        }
        ids
    }
}

/// A call under construction: template, bindings, declared shape and oracles.
#[derive(Clone)]
pub struct Call {
    pub(crate) template: String,
    pub(crate) bindings: Vec<Binding>,
    pub(crate) shape: Option<Shape>,
    pub(crate) oracles: Vec<Arc<dyn Oracle>>,
}

impl Call {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            bindings: Vec::new(),
            shape: None,
            oracles: Vec::new(),
        }
    }

    /// Positional argument.
    pub fn arg(mut self, value: impl Into<LambdaValue>) -> Self {
        self.bindings.push(Binding::positional(value));
        self
    }

    pub fn named(mut self, name: impl Into<String>, value: impl Into<LambdaValue>) -> Self {
        self.bindings.push(Binding::named(name, value));
        self
    }

    pub fn bind(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn shape(mut self, shape: Shape) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn oracle(mut self, oracle: impl Oracle + 'static) -> Self {
        self.oracles.push(Arc::new(oracle));
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }
}

/// An open session. Cheap to create; close it (or drop it) when done.
pub struct Session {
    engine: Engine,
    scope: Arc<Scope>,
}

impl Session {
    pub(crate) fn new(engine: Engine, scope: Scope) -> Self {
        log::debug!("Opened session '{}' ({})", scope.label, scope.id);
        Self {
            engine,
            scope: Arc::new(scope),
        }
    }

    pub fn id(&self) -> Uuid {
        self.scope.id
    }

    /// Namespace label mixed into every signature of this session.
    pub fn label(&self) -> &str {
        &self.scope.label
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn is_closed(&self) -> bool {
        self.scope.is_closed()
    }

    /// Opens a child session. Without a label it shares this session's namespace, and
    /// therefore its signatures.
    pub fn nested(&self, label: Option<&str>) -> Session {
        let scope = Scope {
            id: Uuid::new_v4(),
            label: label.map_or_else(|| self.scope.label.clone(), str::to_string),
            parent: Some(Arc::clone(&self.scope)),
            closed: AtomicBool::new(false),
        };
        Session::new(self.engine.clone(), scope)
    }

    /// Starts a call; add arguments, then `.await` it.
    ///
    /// ```rust,no_run
    /// # async fn demo(session: &lambdai::Session) -> Result<(), lambdai::ExecuteError> {
    /// let merged = session
    ///     .call("merge {a} and {b} into one sorted list")
    ///     .arg(serde_json::json!([["123"]]))
    ///     .arg(serde_json::json!([["456"]]))
    ///     .shape(lambdai::shape!("list[str]"))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn call(&self, template: impl Into<String>) -> CallBuilder<'_> {
        CallBuilder {
            session: self,
            call: Call::new(template),
        }
    }

    /// Resolves a call to a validated implementation and returns its result.
    pub async fn execute(&self, call: Call) -> Result<LambdaValue, ExecuteError> {
        self.engine.execute(&self.scope, call).await
    }

    /// Closes the session, discarding its unvalidated entries. Idempotent; returns
    /// how many entries were discarded.
    pub fn close(&self) -> usize {
        if self.scope.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let discarded = self.engine.cache().discard_provisional(self.scope.id);
        log::debug!(
            "Closed session '{}' ({}), discarded {} provisional entr{}",
            self.scope.label,
            self.scope.id,
            discarded,
            if discarded == 1 { "y" } else { "ies" }
        );
        discarded
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builder returned by [`Session::call`]; awaiting it executes the call.
pub struct CallBuilder<'a> {
    session: &'a Session,
    call: Call,
}

impl<'a> CallBuilder<'a> {
    pub fn arg(mut self, value: impl Into<LambdaValue>) -> Self {
        self.call = self.call.arg(value);
        self
    }

    pub fn named(mut self, name: impl Into<String>, value: impl Into<LambdaValue>) -> Self {
        self.call = self.call.named(name, value);
        self
    }

    pub fn shape(mut self, shape: Shape) -> Self {
        self.call = self.call.shape(shape);
        self
    }

    pub fn oracle(mut self, oracle: impl Oracle + 'static) -> Self {
        self.call = self.call.oracle(oracle);
        self
    }

    /// The call without executing it.
    pub fn build(self) -> Call {
        self.call
    }
}

impl<'a> IntoFuture for CallBuilder<'a> {
    type Output = Result<LambdaValue, ExecuteError>;
    type IntoFuture = BoxFuture<'a, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.session.execute(self.call).await })
    }
}
