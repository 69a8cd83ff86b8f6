//! Per-call context.
//!
//! The context is handed to the wrapped call explicitly. For code further
//! down the stack that cannot take it as a parameter, the registry also binds
//! it to a task-local for exactly the duration of the call; the binding is
//! dropped on every exit path, including rejection, error and panic.

use std::collections::HashMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: CallContext;
}

/// Caller-supplied data travelling with one intercepted call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallContext {
    /// Unique id of this call
    pub call_id: Uuid,
    /// When the call entered the limiter
    pub started_at: DateTime<Utc>,
    /// Free-form attributes (caller, tenant, arguments, ...)
    pub attributes: HashMap<String, String>,
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            call_id: Uuid::new_v4(),
            started_at: Utc::now(),
            attributes: HashMap::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// The context bound to the running call, if any.
    pub fn current() -> Option<CallContext> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Run `fut` with `context` bound as the current context.
    pub async fn scope<F>(context: CallContext, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(context, fut).await
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}
