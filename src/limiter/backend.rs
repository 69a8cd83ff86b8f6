//! Admission backends and the mode → implementation table.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::acquire::EvalResult;
use super::cluster::ClusterLimiter;
use super::rules::{LimiterConfig, Mode};
use crate::error::Result;
use crate::store::{Clock, Store};

/// The three admission checks a limiter implementation provides.
///
/// Every check takes the config snapshot the call started with, so a
/// refresh never changes thresholds under an in-flight call.
#[async_trait]
pub trait Admission: Send + Sync {
    /// Take `concurrent_permit` from the concurrency ceiling.
    async fn increment_concurrent(&self, config: &LimiterConfig) -> EvalResult;

    /// Give back what a successful increment took.
    async fn decrement_concurrent(&self, config: &LimiterConfig) -> Result<EvalResult>;

    /// Consume `rate_permit` tokens.
    async fn try_acquire_rate(&self, config: &LimiterConfig) -> EvalResult;

    /// Count one request in the current window.
    async fn try_acquire_request(&self, config: &LimiterConfig) -> EvalResult;

    /// Called after the owning limiter swapped in a new config.
    fn refreshed(&self, _config: &LimiterConfig) {}
}

/// Constructor of a fresh admission backend.
pub type AdmissionFactory = Arc<dyn Fn() -> Arc<dyn Admission> + Send + Sync>;

/// Named table of admission constructors, resolved by [`Mode`] name.
#[derive(Clone, Default)]
pub struct Extensions {
    factories: Arc<DashMap<String, AdmissionFactory>>,
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("names", &self.names())
            .finish()
    }
}

impl Extensions {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with the store-backed `cluster` implementation registered.
    pub fn with_store(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        let extensions = Self::new();
        extensions.register(Mode::Cluster.as_str(), move || {
            Arc::new(ClusterLimiter::new(store.clone(), clock.clone())) as Arc<dyn Admission>
        });
        extensions
    }

    /// Register (or replace) the constructor for `name`.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Admission> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Build a new backend for `name`.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Admission>> {
        let factory = self.factories.get(name).map(|f| f.value().clone())?;
        Some(factory())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
