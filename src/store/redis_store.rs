//! Redis-backed store.
//!
//! The admission procedures run as Lua scripts (`EVALSHA`, falling back to
//! `EVAL` on a cold script cache) over a shared `ConnectionManager`. Each
//! subscription gets its own pub/sub connection, forwarded into the
//! subscription channel by a background task.
//!
//! Store keys are `{prefix}{identity}:{dimension}`; the identity is the
//! first element of every procedure's key list and the remaining elements are
//! passed as script arguments.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Script, Store, StoreMessage, Subscription, DEFAULT_CONCURRENT_KEY_TTL};
use crate::error::{LimiterError, Result};

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix for every key the procedures touch
    pub key_prefix: String,
    /// Expiry of concurrency counters
    pub concurrent_key_ttl: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "neural:limiter:".to_string(),
            concurrent_key_ttl: DEFAULT_CONCURRENT_KEY_TTL,
        }
    }
}

/// Store backed by a Redis server.
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    scripts: HashMap<Script, redis::Script>,
    subscriptions: DashMap<Uuid, JoinHandle<()>>,
    config: RedisStoreConfig,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with default configuration.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect with custom configuration.
    pub async fn connect_with_config(url: &str, config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client.clone()).await?;
        let scripts = Script::ALL
            .iter()
            .map(|s| (*s, redis::Script::new(s.source())))
            .collect();

        info!(url = %url, prefix = %config.key_prefix, "Connected to Redis store");

        Ok(Self {
            client,
            connection,
            scripts,
            subscriptions: DashMap::new(),
            config,
        })
    }

    fn key(&self, script: Script, identity: &str) -> String {
        format!("{}{}:{}", self.config.key_prefix, identity, script.key_suffix())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn eval(&self, script: Script, keys: &[String], timeout: Duration) -> Result<Vec<i64>> {
        let (identity, args) = keys
            .split_first()
            .ok_or_else(|| LimiterError::Store(format!("{}: empty key list", script.name())))?;
        let source = self
            .scripts
            .get(&script)
            .ok_or_else(|| LimiterError::Store(format!("{}: script not loaded", script.name())))?;

        let mut invocation = source.prepare_invoke();
        invocation.key(self.key(script, identity));
        for arg in args {
            invocation.arg(arg);
        }
        if script == Script::Concurrent {
            invocation.arg(self.config.concurrent_key_ttl.as_millis() as u64);
        }

        let mut connection = self.connection.clone();
        let reply: redis::RedisResult<Vec<i64>> =
            tokio::time::timeout(timeout, invocation.invoke_async(&mut connection))
                .await
                .map_err(|_| LimiterError::Timeout(timeout))?;

        Ok(reply?)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        let receivers: i64 = connection.publish(channel, message).await?;
        debug!(channel = %channel, receivers = receivers, "Published message");
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }

        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                let message = StoreMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if sender.send(message).is_err() {
                    break;
                }
            }
            debug!(subscription = %id, "Pub/sub forwarding stopped");
        });

        self.subscriptions.insert(id, handle);
        debug!(subscription = %id, channels = ?channels, "Subscribed");
        Ok(Subscription::new(id, receiver))
    }

    async fn unsubscribe(&self, id: Uuid) -> Result<()> {
        if let Some((_, handle)) = self.subscriptions.remove(&id) {
            handle.abort();
            debug!(subscription = %id, "Unsubscribed");
        }
        Ok(())
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        for entry in self.subscriptions.iter() {
            entry.value().abort();
        }
    }
}
