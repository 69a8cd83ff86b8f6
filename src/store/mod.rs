//! Shared store contract.
//!
//! Limiters coordinate through a store that can run a small set of named
//! atomic procedures against a key list, and that can publish/subscribe
//! string messages on named channels. The in-process [`MemoryStore`] runs the
//! procedures under a single lock; [`RedisStore`] (feature `redis`) runs them
//! as Lua scripts.

mod clock;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::error::Result;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::{RedisStore, RedisStoreConfig};

/// Default expiry for store-side concurrency counters.
pub const DEFAULT_CONCURRENT_KEY_TTL: Duration = Duration::from_secs(60);

/// The server-side atomic procedures a store must provide.
///
/// Key ordering per procedure:
/// - `Concurrent`: `[identity, signed_delta, ceiling]`
/// - `RateInit`: `[identity, capacity, permits_per_second, classifier, now_millis]`
/// - `Rate`: `[identity, permit, now_millis, classifier]`
/// - `Request`: `[identity, ceiling, window_millis]`
///
/// Every procedure answers `[code, payload]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    Concurrent,
    RateInit,
    Rate,
    Request,
}

impl Script {
    /// All procedures, in load order.
    pub const ALL: [Script; 4] = [
        Script::Concurrent,
        Script::RateInit,
        Script::Rate,
        Script::Request,
    ];

    /// Procedure name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Script::Concurrent => "concurrent-adjust",
            Script::RateInit => "rate-init",
            Script::Rate => "rate-consume",
            Script::Request => "request-window-increment",
        }
    }

    /// Suffix of the store key the procedure operates on. The two rate
    /// procedures share a bucket.
    pub fn key_suffix(&self) -> &'static str {
        match self {
            Script::Concurrent => "concurrent",
            Script::RateInit | Script::Rate => "rate",
            Script::Request => "request",
        }
    }

    /// Lua source of the procedure.
    pub fn source(&self) -> &'static str {
        match self {
            Script::Concurrent => include_str!("../../scripts/limiter_concurrent.lua"),
            Script::RateInit => include_str!("../../scripts/limiter_rate_init.lua"),
            Script::Rate => include_str!("../../scripts/limiter_rate.lua"),
            Script::Request => include_str!("../../scripts/limiter_request.lua"),
        }
    }
}

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// Handle to an active channel subscription.
///
/// Messages arrive on the handle until the store drops the subscription via
/// [`Store::unsubscribe`], after which `recv` yields `None`.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    receiver: mpsc::UnboundedReceiver<StoreMessage>,
}

impl Subscription {
    pub fn new(id: Uuid, receiver: mpsc::UnboundedReceiver<StoreMessage>) -> Self {
        Self { id, receiver }
    }

    /// Identifier to pass to [`Store::unsubscribe`].
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<StoreMessage> {
        self.receiver.recv().await
    }

    /// Consume the handle as a stream of messages.
    pub fn into_stream(self) -> UnboundedReceiverStream<StoreMessage> {
        UnboundedReceiverStream::new(self.receiver)
    }
}

/// Contract of the shared store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run one atomic procedure with the given ordered key list.
    ///
    /// Returns the raw result; decoding and validation is the caller's job.
    async fn eval(&self, script: Script, keys: &[String], timeout: Duration) -> Result<Vec<i64>>;

    /// Publish a message on a channel. Delivery is best-effort.
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Subscribe to one or more channels.
    async fn subscribe(&self, channels: &[String]) -> Result<Subscription>;

    /// Drop a subscription created by [`Store::subscribe`].
    async fn unsubscribe(&self, id: Uuid) -> Result<()>;
}
