//! Redis Pub/Sub for cross-instance tag purges.
//!
//! Every instance runs its own scheduler and sweeps its own in-process
//! backends. A purge accepted on one instance is published so the others
//! queue the same tags.
//!
//! ```text
//! Instance 1: POST /cache/purge-tags {"tags": ["product:42"]}
//!   ↓ scheduler.add + PUBLISH cache:purge-tags {"origin": "<id1>", "tags": [...]}
//!   ↓
//! Instance 2: listener receives → scheduler.add(["product:42"])
//! Instance 1: listener receives own origin → ignored
//! ```

use std::time::Duration;

use deadpool_redis::Pool;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tagsweep_core::InvalidationScheduler;
use uuid::Uuid;

/// Wire format published on the purge channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeMessage {
    /// Instance that accepted the original request
    pub origin: String,
    pub tags: Vec<String>,
}

/// Publishes accepted purges to peer instances.
#[derive(Clone)]
pub struct TagPublisher {
    pool: Pool,
    channel: String,
    origin: String,
}

impl TagPublisher {
    pub fn new(pool: Pool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
            origin: Uuid::new_v4().to_string(),
        }
    }

    /// Identifier stamped on outgoing messages; the listener drops its own.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn publish(&self, tags: &[String]) -> Result<(), String> {
        let message = PurgeMessage {
            origin: self.origin.clone(),
            tags: tags.to_vec(),
        };
        let payload = serde_json::to_string(&message)
            .map_err(|e| format!("failed to encode purge message: {e}"))?;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| format!("failed to get Redis connection: {e}"))?;

        conn.publish::<_, _, ()>(&self.channel, payload)
            .await
            .map_err(|e| format!("failed to publish purge: {e}"))?;

        tracing::debug!(tags = tags.len(), channel = %self.channel, "published tag purge");
        Ok(())
    }
}

/// Subscribes to the purge channel and feeds peer purges into the scheduler.
pub struct TagPurgeListener {
    pub redis_url: String,
    pub channel: String,
    pub origin: String,
    pub scheduler: InvalidationScheduler,
}

impl TagPurgeListener {
    /// Spawn the listener; reconnects with exponential backoff.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            const MAX_BACKOFF: Duration = Duration::from_secs(300);

            loop {
                match self.run().await {
                    Ok(()) => {
                        backoff = Duration::from_secs(1);
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "Tag purge listener error, reconnecting..."
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        })
    }

    async fn run(&self) -> Result<(), String> {
        use futures_util::StreamExt;

        let client = redis::Client::open(self.redis_url.clone())
            .map_err(|e| format!("failed to create Redis client: {e}"))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| format!("failed to get pub/sub connection: {e}"))?;

        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| format!("failed to subscribe: {e}"))?;

        tracing::info!(channel = %self.channel, "Subscribed to tag purge channel");

        let mut stream = pubsub.on_message();
        loop {
            match stream.next().await {
                Some(msg) => match msg.get_payload::<String>() {
                    Ok(payload) => {
                        self.handle(&payload);
                    }
                    Err(_) => tracing::warn!("failed to read purge message payload"),
                },
                None => return Err("pub/sub connection closed".to_string()),
            }
        }
    }

    /// Apply one message. Returns the number of tags queued.
    pub fn handle(&self, payload: &str) -> usize {
        let message: PurgeMessage = match serde_json::from_str(payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed purge message");
                return 0;
            }
        };

        if message.origin == self.origin {
            return 0;
        }

        let tags: Vec<String> = message
            .tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if tags.is_empty() {
            return 0;
        }

        let outcome = self.scheduler.add(tags);
        crate::metrics::record_purge_request("peer", outcome.accepted);
        crate::metrics::set_pending_tags(self.scheduler.pending_len());
        tracing::debug!(
            origin = %message.origin,
            accepted = outcome.accepted,
            window = ?outcome.window,
            "queued tags from peer purge"
        );
        outcome.accepted
    }
}
