//! Store-backed limiter shared across processes.
//!
//! Every check is one atomic procedure on the shared store, so the decision
//! and the counter update cannot interleave with another process. Failures
//! to reach the store, timeouts and malformed replies all surface as
//! [`Acquire::Exception`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use super::acquire::{Acquire, EvalResult};
use super::backend::Admission;
use super::rules::LimiterConfig;
use crate::error::{LimiterError, Result};
use crate::store::{Clock, Script, Store};

/// Classifier the rate procedures scope buckets by.
pub const RATE_CLASSIFIER: &str = "app";

/// Bucket parameters, as permits per second.
#[derive(Debug, Default)]
struct RateBucket {
    /// Rate of the newest refreshed config, unset until the first refresh
    wanted: Option<i64>,
    /// Rate last installed in the store
    installed: Option<i64>,
}

/// Limiter whose counters live in the shared store.
pub struct ClusterLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    rate_bucket: Mutex<RateBucket>,
}

impl ClusterLimiter {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            rate_bucket: Mutex::new(RateBucket::default()),
        }
    }

    /// Run one procedure, bounded by `timeout` whatever the store does.
    async fn eval(&self, script: Script, keys: Vec<String>, timeout: Duration) -> Result<EvalResult> {
        let raw = tokio::time::timeout(timeout, self.store.eval(script, &keys, timeout))
            .await
            .map_err(|_| LimiterError::Timeout(timeout))??;
        Ok(EvalResult::decode(&raw))
    }

    fn settle(script: Script, identity: &str, outcome: Result<EvalResult>) -> EvalResult {
        match outcome {
            Ok(result) => {
                trace!(
                    identity = %identity,
                    script = script.name(),
                    code = ?result.code,
                    num = result.num,
                    "Procedure evaluated"
                );
                result
            }
            Err(e) => {
                error!(identity = %identity, script = script.name(), error = %e, "Procedure failed");
                EvalResult::exception()
            }
        }
    }

    /// Install the bucket parameters of the newest config. A call still
    /// running under an older snapshot installs the newer rate, not its own.
    async fn ensure_rate_bucket(&self, config: &LimiterConfig) -> Result<()> {
        let rate = {
            let bucket = self.rate_bucket.lock();
            let rate = bucket.wanted.filter(|r| *r > 0).unwrap_or(config.max_permit_rate);
            if bucket.installed == Some(rate) {
                return Ok(());
            }
            rate
        };

        let keys = vec![
            config.identity(),
            rate.to_string(),
            rate.to_string(),
            RATE_CLASSIFIER.to_string(),
            self.clock.now_millis().to_string(),
        ];
        let result = self.eval(Script::RateInit, keys, config.rate_timeout()).await?;
        if result.code != Acquire::Success {
            return Err(LimiterError::Store(format!(
                "{} refused: {:?}",
                Script::RateInit.name(),
                result.code
            )));
        }

        self.rate_bucket.lock().installed = Some(rate);
        debug!(
            identity = %config.identity(),
            capacity = rate,
            tokens = result.num,
            "Rate bucket initialised"
        );
        Ok(())
    }
}

#[async_trait]
impl Admission for ClusterLimiter {
    async fn increment_concurrent(&self, config: &LimiterConfig) -> EvalResult {
        let identity = config.identity();
        let keys = vec![
            identity.clone(),
            config.concurrent_permit.to_string(),
            config.max_permit_concurrent.to_string(),
        ];
        let outcome = self.eval(Script::Concurrent, keys, config.concurrent_timeout()).await;
        Self::settle(Script::Concurrent, &identity, outcome)
    }

    async fn decrement_concurrent(&self, config: &LimiterConfig) -> Result<EvalResult> {
        let keys = vec![
            config.identity(),
            (-config.concurrent_permit).to_string(),
            config.max_permit_concurrent.to_string(),
        ];
        let result = self.eval(Script::Concurrent, keys, config.concurrent_timeout()).await?;
        if result.code != Acquire::Success {
            return Err(LimiterError::Store(format!(
                "{} returned {:?} on release",
                Script::Concurrent.name(),
                result.code
            )));
        }
        Ok(result)
    }

    async fn try_acquire_rate(&self, config: &LimiterConfig) -> EvalResult {
        let identity = config.identity();
        if let Err(e) = self.ensure_rate_bucket(config).await {
            error!(identity = %identity, error = %e, "Failed to initialise rate bucket");
            return EvalResult::exception();
        }

        let keys = vec![
            identity.clone(),
            config.rate_permit.to_string(),
            self.clock.now_millis().to_string(),
            RATE_CLASSIFIER.to_string(),
        ];
        let outcome = self.eval(Script::Rate, keys, config.rate_timeout()).await;
        let result = Self::settle(Script::Rate, &identity, outcome);

        // The bucket may have been evicted; install it again on the next call
        if result.code == Acquire::Exception {
            self.rate_bucket.lock().installed = None;
        }
        result
    }

    async fn try_acquire_request(&self, config: &LimiterConfig) -> EvalResult {
        let identity = config.identity();
        let keys = vec![
            identity.clone(),
            config.max_permit_request.to_string(),
            config.request_interval_ms.to_string(),
        ];
        let outcome = self.eval(Script::Request, keys, config.request_timeout()).await;
        Self::settle(Script::Request, &identity, outcome)
    }

    fn refreshed(&self, config: &LimiterConfig) {
        let mut bucket = self.rate_bucket.lock();
        bucket.wanted = Some(config.max_permit_rate);
        bucket.installed = None;
    }
}
