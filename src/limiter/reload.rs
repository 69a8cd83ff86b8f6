//! Hot reload of limiter configs over the store's pub/sub channel.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::LimiterRegistry;
use super::rules::LimiterConfig;
use crate::error::Result;
use crate::store::Store;

/// Channel config changes are published on unless configured otherwise.
pub const DEFAULT_RELOAD_CHANNEL: &str = "neural:limiter:config";

/// Publish a changed config so every subscribed registry refreshes it.
pub async fn publish_config(store: &dyn Store, channel: &str, config: &LimiterConfig) -> Result<()> {
    config.validate()?;
    let payload = serde_json::to_string(config)?;
    store.publish(channel, &payload).await?;
    info!(channel = %channel, identity = %config.identity(), "Published limiter config");
    Ok(())
}

/// Background task applying published configs to a registry.
pub struct ConfigWatcher {
    store: Arc<dyn Store>,
    subscription_id: Uuid,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Subscribe to `channel` and start applying configs published on it.
    pub async fn spawn(registry: Arc<LimiterRegistry>, store: Arc<dyn Store>, channel: &str) -> Result<Self> {
        let subscription = store.subscribe(&[channel.to_string()]).await?;
        let subscription_id = subscription.id();
        let mut messages = subscription.into_stream();

        let task = tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                let config: LimiterConfig = match serde_json::from_str(&message.payload) {
                    Ok(config) => config,
                    Err(e) => {
                        warn!(channel = %message.channel, error = %e, "Ignoring malformed limiter config");
                        continue;
                    }
                };
                // notify logs and emits its own outcome
                if let Err(e) = registry.notify(config) {
                    debug!(error = %e, "Published config not applied");
                }
            }
            debug!("Config subscription closed");
        });

        info!(channel = %channel, "Watching for limiter config changes");
        Ok(Self {
            store,
            subscription_id,
            task,
        })
    }

    /// Whether the watcher task has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Unsubscribe and stop the watcher task.
    pub async fn shutdown(self) -> Result<()> {
        let unsubscribed = self.store.unsubscribe(self.subscription_id).await;
        self.task.abort();
        let _ = self.task.await;
        info!("Config watcher stopped");
        unsubscribed
    }
}
