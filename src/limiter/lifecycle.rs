//! Call-wrapping lifecycle.
//!
//! A call moves through the checks in a fixed order: concurrency, then rate,
//! then request window. The first rejection or exception stops it. An
//! admitted call runs with the caller's context, and whatever the call does,
//! the concurrency permit taken in the first step is released before
//! [`Limiter::wrapper_call`] returns. If the wrapping future is dropped or
//! the call panics first, the permit guard schedules the release instead.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use super::acquire::{Acquire, EvalResult};
use super::backend::Admission;
use super::context::CallContext;
use super::events::{EventBus, EventType};
use super::rules::LimiterConfig;
use super::stats::{LimiterStats, Metric};
use crate::error::{Dimension, LimiterError, Result};

/// A live limiter for one identity.
pub struct Limiter {
    identity: String,
    config: RwLock<Arc<LimiterConfig>>,
    admission: Arc<dyn Admission>,
    stats: LimiterStats,
    events: EventBus,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("identity", &self.identity)
            .field("config", &self.config())
            .finish_non_exhaustive()
    }
}

impl Limiter {
    pub fn new(config: LimiterConfig, admission: Arc<dyn Admission>, events: EventBus) -> Self {
        Self {
            identity: config.identity(),
            config: RwLock::new(Arc::new(config)),
            admission,
            stats: LimiterStats::new(),
            events,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Snapshot of the active config.
    pub fn config(&self) -> Arc<LimiterConfig> {
        self.config.read().clone()
    }

    pub fn stats(&self) -> &LimiterStats {
        &self.stats
    }

    /// Swap in a new config. Calls already running keep the snapshot they
    /// started with.
    pub fn refresh(&self, config: LimiterConfig) -> Result<()> {
        if let Err(e) = self.check_refresh(&config) {
            self.events
                .emit(EventType::RefreshFailed, &self.identity, vec![e.to_string()]);
            return Err(e);
        }

        let config = Arc::new(config);
        *self.config.write() = config.clone();
        self.admission.refreshed(&config);

        info!(identity = %self.identity, "Limiter config refreshed");
        self.events
            .emit(EventType::ConfigRefreshed, &self.identity, Vec::new());
        Ok(())
    }

    fn check_refresh(&self, config: &LimiterConfig) -> Result<()> {
        let actual = config.identity();
        if actual != self.identity {
            return Err(LimiterError::IdentityMismatch {
                expected: self.identity.clone(),
                actual,
            });
        }
        let current = self.config();
        if config.mode != current.mode {
            return Err(LimiterError::Config(format!(
                "{}: mode cannot change from {} to {} on refresh",
                self.identity, current.mode, config.mode
            )));
        }
        config.validate()
    }

    /// Counters since the last collect.
    pub fn collect(&self) -> BTreeMap<String, u64> {
        self.stats.collect()
    }

    /// Cumulative counters.
    pub fn statistics(&self) -> BTreeMap<String, u64> {
        self.stats.statistics()
    }

    /// Run `call` under this limiter.
    ///
    /// Limiter decisions are converted into the caller's error type; the
    /// call's own result is returned untouched.
    pub async fn wrapper_call<T, E, F, Fut>(&self, context: CallContext, call: F) -> std::result::Result<T, E>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<LimiterError>,
    {
        let config = self.config();
        self.stats.record(Metric::Request);

        if !config.enabled {
            trace!(identity = %self.identity, "Limiter disabled, passing through");
            return call(context).await;
        }

        let permit = self.acquire(&config).await.map_err(E::from)?;
        self.stats.record(Metric::Admitted);

        let started = Instant::now();
        let result = call(context).await;
        let elapsed = started.elapsed();

        if let Some(permit) = permit {
            permit.release().await;
        }

        self.stats.record_elapsed(elapsed.as_millis() as u64);
        match &result {
            Ok(_) => self.stats.record(Metric::Success),
            Err(_) => {
                self.stats.record(Metric::Failure);
                self.events
                    .emit(EventType::CallFailed, &self.identity, Vec::new());
            }
        }

        result
    }

    async fn acquire(&self, config: &Arc<LimiterConfig>) -> Result<Option<ConcurrencyPermit>> {
        let permit = if config.concurrent_enabled() {
            let result = self.admission.increment_concurrent(config).await;
            self.admit(Dimension::Concurrent, result)?;
            Some(ConcurrencyPermit::new(
                self.admission.clone(),
                config.clone(),
                self.events.clone(),
            ))
        } else {
            None
        };

        if let Err(e) = self.acquire_windows(config).await {
            if let Some(permit) = permit {
                permit.release().await;
            }
            return Err(e);
        }

        Ok(permit)
    }

    async fn acquire_windows(&self, config: &LimiterConfig) -> Result<()> {
        if config.rate_enabled() {
            let result = self.admission.try_acquire_rate(config).await;
            self.admit(Dimension::Rate, result)?;
        }
        if config.request_enabled() {
            let result = self.admission.try_acquire_request(config).await;
            self.admit(Dimension::Request, result)?;
        }
        Ok(())
    }

    fn admit(&self, dimension: Dimension, result: EvalResult) -> Result<()> {
        match result.code {
            Acquire::Success => {
                trace!(identity = %self.identity, dimension = %dimension, num = result.num, "Permit granted");
                Ok(())
            }
            Acquire::Failure => {
                let (metric, event_type) = match dimension {
                    Dimension::Concurrent => (Metric::ConcurrentExceed, EventType::ConcurrentExceed),
                    Dimension::Rate => (Metric::RateExceed, EventType::RateExceed),
                    Dimension::Request => (Metric::RequestExceed, EventType::RequestExceed),
                };
                self.stats.record(metric);
                debug!(identity = %self.identity, dimension = %dimension, num = result.num, "Limit exceeded");
                self.events
                    .emit(event_type, &self.identity, vec![result.num.to_string()]);
                Err(LimiterError::Rejected {
                    identity: self.identity.clone(),
                    dimension,
                })
            }
            Acquire::Exception => {
                self.stats.record(Metric::Exception);
                self.events.emit(
                    EventType::CheckException,
                    &self.identity,
                    vec![dimension.to_string()],
                );
                Err(LimiterError::CheckFailed {
                    identity: self.identity.clone(),
                    dimension,
                    reason: "store returned no usable result".to_string(),
                })
            }
        }
    }
}

/// A held concurrency permit.
///
/// Released explicitly on every normal path; if dropped while still held the
/// release is spawned onto the current runtime.
struct ConcurrencyPermit {
    admission: Arc<dyn Admission>,
    config: Arc<LimiterConfig>,
    events: EventBus,
    held: bool,
}

impl ConcurrencyPermit {
    fn new(admission: Arc<dyn Admission>, config: Arc<LimiterConfig>, events: EventBus) -> Self {
        Self {
            admission,
            config,
            events,
            held: true,
        }
    }

    async fn release(mut self) {
        self.held = false;
        release_concurrent(self.admission.as_ref(), &self.config, &self.events).await;
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        if !self.held {
            return;
        }

        let identity = self.config.identity();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(identity = %identity, "Releasing abandoned concurrency permit");
                let admission = self.admission.clone();
                let config = self.config.clone();
                let events = self.events.clone();
                handle.spawn(async move {
                    release_concurrent(admission.as_ref(), &config, &events).await;
                });
            }
            Err(_) => {
                warn!(identity = %identity, "No runtime to release concurrency permit; left to expire");
                self.events
                    .emit(EventType::ReleaseFailure, &identity, vec!["no runtime".to_string()]);
            }
        }
    }
}

async fn release_concurrent(admission: &dyn Admission, config: &LimiterConfig, events: &EventBus) {
    if let Err(e) = admission.decrement_concurrent(config).await {
        let identity = config.identity();
        warn!(identity = %identity, error = %e, "Failed to release concurrency permit");
        events.emit(EventType::ReleaseFailure, &identity, vec![e.to_string()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Admission double with scripted outcomes and a live concurrency count.
    #[derive(Default)]
    struct ScriptedAdmission {
        concurrent: Mutex<Option<Acquire>>,
        rate: Mutex<Option<Acquire>>,
        request: Mutex<Option<Acquire>>,
        release_fails: bool,
        increments: AtomicUsize,
        decrements: AtomicUsize,
        outstanding: AtomicI64,
        rate_checks: AtomicUsize,
        request_checks: AtomicUsize,
        /// (step, threshold of the config snapshot the step received)
        seen: Mutex<Vec<(&'static str, i64)>>,
    }

    impl ScriptedAdmission {
        fn outcome(slot: &Mutex<Option<Acquire>>) -> Acquire {
            slot.lock().unwrap_or(Acquire::Success)
        }
    }

    #[async_trait]
    impl Admission for ScriptedAdmission {
        async fn increment_concurrent(&self, config: &LimiterConfig) -> EvalResult {
            self.seen.lock().push(("increment", config.max_permit_concurrent));
            let code = Self::outcome(&self.concurrent);
            if code == Acquire::Success {
                self.increments.fetch_add(1, Ordering::SeqCst);
                self.outstanding.fetch_add(1, Ordering::SeqCst);
            }
            EvalResult::new(code, self.outstanding.load(Ordering::SeqCst))
        }

        async fn decrement_concurrent(&self, config: &LimiterConfig) -> Result<EvalResult> {
            self.seen.lock().push(("release", config.max_permit_concurrent));
            self.decrements.fetch_add(1, Ordering::SeqCst);
            if self.release_fails {
                return Err(LimiterError::Store("release lost".into()));
            }
            let value = self.outstanding.fetch_sub(1, Ordering::SeqCst) - 1;
            Ok(EvalResult::new(Acquire::Success, value))
        }

        async fn try_acquire_rate(&self, config: &LimiterConfig) -> EvalResult {
            self.seen.lock().push(("rate", config.max_permit_rate));
            self.rate_checks.fetch_add(1, Ordering::SeqCst);
            EvalResult::new(Self::outcome(&self.rate), 0)
        }

        async fn try_acquire_request(&self, _: &LimiterConfig) -> EvalResult {
            self.request_checks.fetch_add(1, Ordering::SeqCst);
            EvalResult::new(Self::outcome(&self.request), 0)
        }
    }

    fn all_checks() -> LimiterConfig {
        let mut config = LimiterConfig::new("orders", "create");
        config.max_permit_concurrent = 2;
        config.max_permit_rate = 5;
        config.max_permit_request = 10;
        config
    }

    fn limiter_with(admission: Arc<ScriptedAdmission>) -> Limiter {
        Limiter::new(all_checks(), admission, EventBus::default())
    }

    async fn ok_call(_: CallContext) -> std::result::Result<u32, anyhow::Error> {
        Ok(7)
    }

    fn rejected_dimension(err: &anyhow::Error) -> Option<Dimension> {
        match err.downcast_ref::<LimiterError>() {
            Some(LimiterError::Rejected { dimension, .. }) => Some(*dimension),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_admitted_call_runs_and_releases() {
        let admission = Arc::new(ScriptedAdmission::default());
        let limiter = limiter_with(admission.clone());

        let value = limiter.wrapper_call(CallContext::new(), ok_call).await.unwrap();

        assert_eq!(value, 7);
        assert_eq!(admission.increments.load(Ordering::SeqCst), 1);
        assert_eq!(admission.decrements.load(Ordering::SeqCst), 1);
        assert_eq!(admission.outstanding.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.stats().get(Metric::Admitted), 1);
        assert_eq!(limiter.stats().get(Metric::Success), 1);
    }

    #[tokio::test]
    async fn test_call_error_propagates_after_release() {
        let admission = Arc::new(ScriptedAdmission::default());
        let limiter = limiter_with(admission.clone());
        let observed = admission.clone();

        let err = limiter
            .wrapper_call(CallContext::new(), |_| async move {
                // The permit is still held while the call runs
                assert_eq!(observed.outstanding.load(Ordering::SeqCst), 1);
                Err::<(), _>(anyhow::anyhow!("business failure"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "business failure");
        assert!(err.downcast_ref::<LimiterError>().is_none());
        assert_eq!(admission.decrements.load(Ordering::SeqCst), 1);
        assert_eq!(admission.outstanding.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.stats().get(Metric::Failure), 1);
    }

    #[tokio::test]
    async fn test_release_happens_before_error_is_returned() {
        let admission = Arc::new(ScriptedAdmission::default());
        let limiter = limiter_with(admission.clone());
        let mut events = limiter.events.subscribe();

        let _ = limiter
            .wrapper_call(CallContext::new(), |_| async {
                Err::<(), _>(anyhow::anyhow!("boom"))
            })
            .await;

        // By the time the error reached us the permit was already returned
        assert_eq!(admission.outstanding.load(Ordering::SeqCst), 0);
        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::CallFailed);
    }

    #[tokio::test]
    async fn test_concurrency_rejection_skips_everything() {
        let admission = Arc::new(ScriptedAdmission::default());
        *admission.concurrent.lock() = Some(Acquire::Failure);
        let limiter = limiter_with(admission.clone());
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_call = ran.clone();

        let err = limiter
            .wrapper_call(CallContext::new(), |_| async move {
                ran_in_call.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap_err();

        assert_eq!(rejected_dimension(&err), Some(Dimension::Concurrent));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(admission.rate_checks.load(Ordering::SeqCst), 0);
        assert_eq!(admission.decrements.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.stats().get(Metric::ConcurrentExceed), 1);
        assert_eq!(limiter.stats().get(Metric::Admitted), 0);
    }

    #[tokio::test]
    async fn test_rate_rejection_releases_concurrency() {
        let admission = Arc::new(ScriptedAdmission::default());
        *admission.rate.lock() = Some(Acquire::Failure);
        let limiter = limiter_with(admission.clone());

        let err = limiter.wrapper_call(CallContext::new(), ok_call).await.unwrap_err();

        assert_eq!(rejected_dimension(&err), Some(Dimension::Rate));
        assert_eq!(admission.request_checks.load(Ordering::SeqCst), 0);
        assert_eq!(admission.decrements.load(Ordering::SeqCst), 1);
        assert_eq!(admission.outstanding.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.stats().get(Metric::RateExceed), 1);
    }

    #[tokio::test]
    async fn test_request_rejection_releases_concurrency() {
        let admission = Arc::new(ScriptedAdmission::default());
        *admission.request.lock() = Some(Acquire::Failure);
        let limiter = limiter_with(admission.clone());

        let err = limiter.wrapper_call(CallContext::new(), ok_call).await.unwrap_err();

        assert_eq!(rejected_dimension(&err), Some(Dimension::Request));
        assert_eq!(admission.outstanding.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.stats().get(Metric::RequestExceed), 1);
    }

    #[tokio::test]
    async fn test_exception_fails_closed() {
        let admission = Arc::new(ScriptedAdmission::default());
        *admission.rate.lock() = Some(Acquire::Exception);
        let limiter = limiter_with(admission.clone());

        let err = limiter.wrapper_call(CallContext::new(), ok_call).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<LimiterError>(),
            Some(LimiterError::CheckFailed { dimension: Dimension::Rate, .. })
        ));
        assert_eq!(admission.outstanding.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.stats().get(Metric::Exception), 1);
    }

    #[tokio::test]
    async fn test_release_failure_does_not_mask_result() {
        let admission = Arc::new(ScriptedAdmission {
            release_fails: true,
            ..Default::default()
        });
        let limiter = limiter_with(admission.clone());
        let mut events = limiter.events.subscribe();

        let value = limiter.wrapper_call(CallContext::new(), ok_call).await.unwrap();

        assert_eq!(value, 7);
        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::ReleaseFailure);
    }

    #[tokio::test]
    async fn test_disabled_checks_are_not_issued() {
        let admission = Arc::new(ScriptedAdmission::default());
        let limiter = Limiter::new(LimiterConfig::new("g", "t"), admission.clone(), EventBus::default());

        limiter.wrapper_call(CallContext::new(), ok_call).await.unwrap();

        assert_eq!(admission.increments.load(Ordering::SeqCst), 0);
        assert_eq!(admission.rate_checks.load(Ordering::SeqCst), 0);
        assert_eq!(admission.request_checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_limiter_passes_through() {
        let admission = Arc::new(ScriptedAdmission::default());
        *admission.concurrent.lock() = Some(Acquire::Failure);
        let mut config = all_checks();
        config.enabled = false;
        let limiter = Limiter::new(config, admission.clone(), EventBus::default());

        assert_eq!(limiter.wrapper_call(CallContext::new(), ok_call).await.unwrap(), 7);
        assert_eq!(limiter.stats().get(Metric::Request), 1);
    }

    #[tokio::test]
    async fn test_cancelled_call_still_releases() {
        let admission = Arc::new(ScriptedAdmission::default());
        let limiter = limiter_with(admission.clone());

        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            limiter.wrapper_call(CallContext::new(), |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, anyhow::Error>(())
            }),
        )
        .await;
        assert!(outcome.is_err());

        for _ in 0..50 {
            if admission.decrements.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(admission.decrements.load(Ordering::SeqCst), 1);
        assert_eq!(admission.outstanding.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_call_still_releases() {
        let admission = Arc::new(ScriptedAdmission::default());
        let limiter = Arc::new(limiter_with(admission.clone()));

        let task_limiter = limiter.clone();
        let joined = tokio::spawn(async move {
            task_limiter
                .wrapper_call(CallContext::new(), |_| async {
                    if true {
                        panic!("call panicked");
                    }
                    Ok::<(), anyhow::Error>(())
                })
                .await
        })
        .await;
        assert!(joined.unwrap_err().is_panic());

        for _ in 0..50 {
            if admission.decrements.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(admission.decrements.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_swaps_config() {
        let admission = Arc::new(ScriptedAdmission::default());
        let limiter = limiter_with(admission);

        let mut updated = all_checks();
        updated.max_permit_concurrent = 9;
        limiter.refresh(updated).unwrap();

        assert_eq!(limiter.config().max_permit_concurrent, 9);
    }

    #[tokio::test]
    async fn test_refresh_rejects_foreign_or_invalid_config() {
        let admission = Arc::new(ScriptedAdmission::default());
        let limiter = limiter_with(admission);

        let foreign = LimiterConfig::new("orders", "delete");
        assert!(matches!(
            limiter.refresh(foreign),
            Err(LimiterError::IdentityMismatch { .. })
        ));

        let mut invalid = all_checks();
        invalid.concurrent_timeout_ms = 0;
        assert!(limiter.refresh(invalid).is_err());

        let mut other_mode = all_checks();
        other_mode.mode = crate::limiter::Mode::Local;
        assert!(limiter.refresh(other_mode).is_err());

        assert_eq!(limiter.config().max_permit_concurrent, 2);
    }

    #[tokio::test]
    async fn test_in_flight_call_keeps_its_snapshot() {
        let admission = Arc::new(ScriptedAdmission::default());
        let limiter = Arc::new(limiter_with(admission.clone()));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();

        let task_limiter = limiter.clone();
        let call = tokio::spawn(async move {
            task_limiter
                .wrapper_call(CallContext::new(), |_| async move {
                    let _ = started_tx.send(());
                    let _ = finish_rx.await;
                    Ok::<_, anyhow::Error>(())
                })
                .await
        });

        started_rx.await.unwrap();
        let mut updated = all_checks();
        updated.max_permit_concurrent = 1;
        updated.max_permit_rate = 8;
        limiter.refresh(updated).unwrap();
        assert_eq!(limiter.config().max_permit_concurrent, 1);

        // A call started after the refresh runs entirely under the new config
        limiter.wrapper_call(CallContext::new(), ok_call).await.unwrap();

        finish_tx.send(()).unwrap();
        call.await.unwrap().unwrap();

        assert_eq!(
            *admission.seen.lock(),
            vec![
                ("increment", 2),
                ("rate", 5),
                ("increment", 1),
                ("rate", 8),
                ("release", 1),
                // The in-flight call releases what its own snapshot took
                ("release", 2),
            ]
        );
    }
}
