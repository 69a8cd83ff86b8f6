//! Limiter registry.
//!
//! The registry is the surface application code integrates against. It owns
//! one [`Limiter`] per identity plus the group → tag → config table, routes
//! intercepted calls to their limiter, and applies configuration changes to
//! live limiters.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::backend::Extensions;
use super::context::CallContext;
use super::events::{EventBus, EventType, LimiterEvent};
use super::lifecycle::Limiter;
use super::rules::{LimiterConfig, RuleSet};
use crate::error::{LimiterError, Result};
use crate::store::{Store, SystemClock};

/// Metrics of every limiter that has any, keyed by identity in registration
/// order.
pub type MetricsReport = Vec<(String, BTreeMap<String, u64>)>;

/// Registry of live limiters.
pub struct LimiterRegistry {
    /// identity -> limiter
    limiters: DashMap<String, Arc<Limiter>>,
    /// group -> tag -> config
    rules: DashMap<String, DashMap<String, Arc<LimiterConfig>>>,
    /// Identities in registration order
    order: RwLock<Vec<String>>,
    extensions: Extensions,
    events: EventBus,
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("identities", &self.identities())
            .field("extensions", &self.extensions)
            .finish()
    }
}

impl LimiterRegistry {
    /// Create a registry resolving modes through `extensions`.
    pub fn new(extensions: Extensions) -> Self {
        Self {
            limiters: DashMap::new(),
            rules: DashMap::new(),
            order: RwLock::new(Vec::new()),
            extensions,
            events: EventBus::default(),
        }
    }

    /// Create a registry whose `cluster` limiters use `store`.
    pub fn with_store(store: Arc<dyn Store>) -> Self {
        Self::new(Extensions::with_store(store, Arc::new(SystemClock::new())))
    }

    /// The mode table, for registering further implementations.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Register a limiter for `config`, replacing any limiter already
    /// registered under the same identity.
    pub fn add_config(&self, config: LimiterConfig) -> Result<()> {
        let limiter = self.build(&config)?;
        let identity = config.identity();
        if self.limiters.insert(identity.clone(), limiter).is_none() {
            self.order.write().push(identity.clone());
        } else {
            warn!(identity = %identity, "Replaced existing limiter");
        }
        self.store_rule(config);
        self.added(&identity);
        Ok(())
    }

    /// Register a limiter for `config` unless one already exists.
    ///
    /// Returns whether a limiter was added.
    pub fn check_and_add_config(&self, config: LimiterConfig) -> Result<bool> {
        let identity = config.identity();
        match self.limiters.entry(identity.clone()) {
            Entry::Occupied(_) => {
                debug!(identity = %identity, "Limiter already registered");
                Ok(false)
            }
            Entry::Vacant(entry) => {
                let limiter = self.build(&config)?;
                entry.insert(limiter);
                self.order.write().push(identity.clone());
                self.store_rule(config);
                self.added(&identity);
                Ok(true)
            }
        }
    }

    /// Register every limiter of a rule set that is not registered yet.
    pub fn load_rules(&self, rules: &RuleSet) -> Result<usize> {
        let mut added = 0;
        for config in rules.configs()? {
            if self.check_and_add_config(config)? {
                added += 1;
            }
        }
        info!(added = added, total = self.len(), "Limiter rules loaded");
        Ok(added)
    }

    fn build(&self, config: &LimiterConfig) -> Result<Arc<Limiter>> {
        config.validate()?;
        let admission = self
            .extensions
            .resolve(config.mode.as_str())
            .ok_or_else(|| LimiterError::ExtensionNotFound(config.mode.to_string()))?;
        Ok(Arc::new(Limiter::new(config.clone(), admission, self.events.clone())))
    }

    fn store_rule(&self, config: LimiterConfig) {
        self.rules
            .entry(config.group.clone())
            .or_default()
            .insert(config.tag.clone(), Arc::new(config));
    }

    fn added(&self, identity: &str) {
        info!(identity = %identity, "Limiter config added");
        self.events.emit(EventType::ConfigAdded, identity, Vec::new());
    }

    /// Remove a limiter and its config.
    pub fn remove_config(&self, group: &str, tag: &str) -> Option<Arc<LimiterConfig>> {
        let identity = super::rules::identity(group, tag);
        self.limiters.remove(&identity)?;
        self.order.write().retain(|id| id != &identity);
        let config = self
            .rules
            .get(group)
            .and_then(|tags| tags.remove(tag).map(|(_, c)| c));
        info!(identity = %identity, "Limiter removed");
        config
    }

    /// Look up the config registered for `(group, tag)`.
    pub fn get_config(&self, group: &str, tag: &str) -> Option<Arc<LimiterConfig>> {
        self.rules
            .get(group)
            .and_then(|tags| tags.get(tag).map(|c| c.value().clone()))
    }

    /// Look up the live limiter for an identity.
    pub fn get_limiter(&self, identity: &str) -> Option<Arc<Limiter>> {
        self.limiters.get(identity).map(|l| l.value().clone())
    }

    /// Apply a configuration change to the live limiter it names.
    pub fn notify(&self, config: LimiterConfig) -> Result<()> {
        let identity = config.identity();
        let Some(limiter) = self.get_limiter(&identity) else {
            warn!(identity = %identity, "Limiter not found, config dropped");
            self.events.emit(EventType::NotifyUnknown, &identity, Vec::new());
            return Err(LimiterError::ConfigNotFound(identity));
        };

        match limiter.refresh(config.clone()) {
            Ok(()) => {
                self.store_rule(config);
                info!(identity = %identity, "Limiter config refresh succeeded");
                Ok(())
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "Limiter config refresh failed");
                Err(e)
            }
        }
    }

    /// Run `call` under the limiter registered for `identity`.
    ///
    /// Unknown or absent identities run the call unguarded. `context` is
    /// passed to the call and is also readable through
    /// [`CallContext::current`] until the call completes.
    pub async fn original_call<T, E, F, Fut>(
        &self,
        identity: Option<&str>,
        context: CallContext,
        call: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<LimiterError>,
    {
        let limiter = identity.and_then(|id| self.get_limiter(id));

        CallContext::scope(context.clone(), async move {
            match limiter {
                Some(limiter) => limiter.wrapper_call(context, call).await,
                None => call(context).await,
            }
        })
        .await
    }

    /// Per-limiter counters since the previous collect.
    pub fn collect(&self) -> MetricsReport {
        self.report(Limiter::collect)
    }

    /// Per-limiter cumulative counters.
    pub fn statistics(&self) -> MetricsReport {
        self.report(Limiter::statistics)
    }

    fn report(&self, read: fn(&Limiter) -> BTreeMap<String, u64>) -> MetricsReport {
        self.identities()
            .into_iter()
            .filter_map(|identity| {
                let limiter = self.get_limiter(&identity)?;
                let metrics = read(&limiter);
                (!metrics.is_empty()).then_some((identity, metrics))
            })
            .collect()
    }

    /// Listen to limiter events. Dropping the receiver unregisters it.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LimiterEvent> {
        self.events.subscribe()
    }

    /// Registered identities in registration order.
    pub fn identities(&self) -> Vec<String> {
        self.order.read().clone()
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
