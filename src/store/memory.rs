//! In-process store.
//!
//! Runs the admission procedures under one mutex, which gives them the same
//! all-or-nothing behaviour the Lua scripts have on Redis. Shared between
//! limiters in a single process; also the store used by the test suite.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{Clock, Script, Store, StoreMessage, Subscription, SystemClock, DEFAULT_CONCURRENT_KEY_TTL};
use crate::error::{LimiterError, Result};
use crate::limiter::{Acquire, EvalResult};

#[derive(Debug, Clone, Copy)]
struct Expiring {
    value: i64,
    expires_at: i64,
}

#[derive(Debug, Clone)]
struct Bucket {
    capacity: i64,
    rate: i64,
    tokens: i64,
    last_refill: i64,
    classifier: String,
}

#[derive(Debug, Default)]
struct State {
    concurrent: HashMap<String, Expiring>,
    buckets: HashMap<String, Bucket>,
    windows: HashMap<String, Expiring>,
}

struct Subscriber {
    channels: Vec<String>,
    sender: mpsc::UnboundedSender<StoreMessage>,
}

/// Store that keeps all counters in process memory.
pub struct MemoryStore {
    state: Mutex<State>,
    subscribers: DashMap<Uuid, Subscriber>,
    clock: Arc<dyn Clock>,
    concurrent_key_ttl: Duration,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("clock", &self.clock)
            .field("concurrent_key_ttl", &self.concurrent_key_ttl)
            .field("subscribers", &self.subscribers.len())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            subscribers: DashMap::new(),
            clock,
            concurrent_key_ttl: DEFAULT_CONCURRENT_KEY_TTL,
        }
    }

    /// Override the expiry of concurrency counters.
    pub fn with_concurrent_key_ttl(mut self, ttl: Duration) -> Self {
        self.concurrent_key_ttl = ttl;
        self
    }

    /// Current concurrency counter for an identity (0 if absent or expired).
    pub fn concurrent_value(&self, identity: &str) -> i64 {
        let now = self.clock.now_millis();
        let state = self.state.lock();
        live_value(&state.concurrent, identity, now)
    }

    /// Current request count in the open window for an identity.
    pub fn request_count(&self, identity: &str) -> i64 {
        let now = self.clock.now_millis();
        let state = self.state.lock();
        live_value(&state.windows, identity, now)
    }

    /// Tokens currently stored in an identity's rate bucket.
    pub fn bucket_tokens(&self, identity: &str) -> Option<i64> {
        self.state.lock().buckets.get(identity).map(|b| b.tokens)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn adjust_concurrent(&self, state: &mut State, identity: &str, delta: i64, ceiling: i64) -> EvalResult {
        let now = self.clock.now_millis();
        let current = live_value(&state.concurrent, identity, now);

        if delta > 0 && ceiling > 0 && current + delta > ceiling {
            return EvalResult::new(Acquire::Failure, current);
        }

        let value = (current + delta).max(0);
        state.concurrent.insert(
            identity.to_string(),
            Expiring {
                value,
                expires_at: now + self.concurrent_key_ttl.as_millis() as i64,
            },
        );
        EvalResult::new(Acquire::Success, value)
    }

    fn init_bucket(state: &mut State, identity: &str, capacity: i64, rate: i64, classifier: &str, now: i64) -> EvalResult {
        let bucket = state
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| Bucket {
                capacity,
                rate,
                tokens: capacity,
                last_refill: now,
                classifier: classifier.to_string(),
            });

        bucket.capacity = capacity;
        bucket.rate = rate;
        bucket.tokens = bucket.tokens.min(capacity);
        bucket.classifier = classifier.to_string();
        EvalResult::new(Acquire::Success, bucket.tokens)
    }

    fn consume_rate(state: &mut State, identity: &str, permit: i64, now: i64, classifier: &str) -> EvalResult {
        let Some(bucket) = state.buckets.get_mut(identity) else {
            return EvalResult::exception();
        };

        if bucket.classifier != classifier {
            return EvalResult::new(Acquire::Failure, bucket.tokens);
        }

        let elapsed = now - bucket.last_refill;
        if elapsed > 0 && bucket.rate > 0 {
            let replenished = elapsed * bucket.rate / 1000;
            if replenished > 0 {
                let tokens = bucket.tokens + replenished;
                if tokens >= bucket.capacity {
                    bucket.tokens = bucket.capacity;
                    bucket.last_refill = now;
                } else {
                    // Keep the partial token earned since the last whole one
                    bucket.tokens = tokens;
                    bucket.last_refill += replenished * 1000 / bucket.rate;
                }
            }
        }

        if bucket.tokens < permit {
            return EvalResult::new(Acquire::Failure, bucket.tokens);
        }

        bucket.tokens -= permit;
        EvalResult::new(Acquire::Success, bucket.tokens)
    }

    fn increment_window(&self, state: &mut State, identity: &str, ceiling: i64, window_ms: i64) -> EvalResult {
        let now = self.clock.now_millis();
        let window = state
            .windows
            .entry(identity.to_string())
            .or_insert(Expiring {
                value: 0,
                expires_at: now + window_ms,
            });

        if window.expires_at <= now {
            window.value = 0;
            window.expires_at = now + window_ms;
        }

        window.value += 1;
        if window.value > ceiling {
            return EvalResult::new(Acquire::Failure, window.value);
        }
        EvalResult::new(Acquire::Success, window.value)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn live_value(map: &HashMap<String, Expiring>, key: &str, now: i64) -> i64 {
    map.get(key)
        .filter(|e| e.expires_at > now)
        .map(|e| e.value)
        .unwrap_or(0)
}

fn int_arg(script: Script, keys: &[String], index: usize) -> Result<i64> {
    let raw = keys.get(index).ok_or_else(|| {
        LimiterError::Store(format!("{}: missing argument {}", script.name(), index))
    })?;
    raw.parse().map_err(|_| {
        LimiterError::Store(format!("{}: argument {} is not an integer: {}", script.name(), index, raw))
    })
}

fn str_arg<'a>(script: Script, keys: &'a [String], index: usize) -> Result<&'a str> {
    keys.get(index)
        .map(String::as_str)
        .ok_or_else(|| LimiterError::Store(format!("{}: missing argument {}", script.name(), index)))
}

#[async_trait]
impl Store for MemoryStore {
    async fn eval(&self, script: Script, keys: &[String], _timeout: Duration) -> Result<Vec<i64>> {
        let identity = str_arg(script, keys, 0)?;

        let result = match script {
            Script::Concurrent => {
                let delta = int_arg(script, keys, 1)?;
                let ceiling = int_arg(script, keys, 2)?;
                let mut state = self.state.lock();
                self.adjust_concurrent(&mut state, identity, delta, ceiling)
            }
            Script::RateInit => {
                let capacity = int_arg(script, keys, 1)?;
                let rate = int_arg(script, keys, 2)?;
                let classifier = str_arg(script, keys, 3)?;
                let now = int_arg(script, keys, 4)?;
                let mut state = self.state.lock();
                Self::init_bucket(&mut state, identity, capacity, rate, classifier, now)
            }
            Script::Rate => {
                let permit = int_arg(script, keys, 1)?;
                let now = int_arg(script, keys, 2)?;
                let classifier = str_arg(script, keys, 3)?;
                let mut state = self.state.lock();
                Self::consume_rate(&mut state, identity, permit, now, classifier)
            }
            Script::Request => {
                let ceiling = int_arg(script, keys, 1)?;
                let window_ms = int_arg(script, keys, 2)?;
                let mut state = self.state.lock();
                self.increment_window(&mut state, identity, ceiling, window_ms)
            }
        };

        trace!(
            script = script.name(),
            identity = %identity,
            code = ?result.code,
            num = result.num,
            "Evaluated procedure"
        );

        Ok(result.encode())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            if !entry.channels.iter().any(|c| c == channel) {
                continue;
            }
            let delivered = entry.sender.send(StoreMessage {
                channel: channel.to_string(),
                payload: message.to_string(),
            });
            if delivered.is_err() {
                closed.push(*entry.key());
            }
        }

        for id in closed {
            debug!(subscription = %id, "Dropping closed subscription");
            self.subscribers.remove(&id);
        }

        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription> {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.insert(
            id,
            Subscriber {
                channels: channels.to_vec(),
                sender,
            },
        );
        debug!(subscription = %id, channels = ?channels, "Subscribed");
        Ok(Subscription::new(id, receiver))
    }

    async fn unsubscribe(&self, id: Uuid) -> Result<()> {
        if self.subscribers.remove(&id).is_some() {
            debug!(subscription = %id, "Unsubscribed");
        }
        Ok(())
    }
}
