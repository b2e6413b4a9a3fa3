//! Presence tracking for Parley.
//!
//! Each identity is `online` or `offline`, with a last-seen time. Explicit
//! connects and heartbeats mark it online, explicit disconnects mark it
//! offline, and a periodic sweep demotes identities whose heartbeat has gone
//! stale. Every change is published to all sockets as `presence.updated`.

use parley_store::models::now_millis;
use parley_store::{with_deadline, ChatStore, Presence, PresenceStatus, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::registry::BroadcastRegistry;

/// Event published for every presence change.
pub const PRESENCE_UPDATED: &str = "presence.updated";

/// Presence state machine over a [`ChatStore`].
#[derive(Clone)]
pub struct PresenceManager {
    store: Arc<dyn ChatStore>,
    registry: Arc<BroadcastRegistry>,
    call_timeout: Duration,
}

impl PresenceManager {
    /// Create a manager; each storage call is bounded by `call_timeout`.
    #[must_use]
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<BroadcastRegistry>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            call_timeout,
        }
    }

    fn publish(&self, presence: &Presence) {
        match serde_json::to_value(presence) {
            Ok(payload) => {
                let recipients = self.registry.emit_all(PRESENCE_UPDATED, payload);
                debug!(
                    row_id = %presence.row_id,
                    status = presence.status.as_str(),
                    recipients,
                    "Presence published"
                );
            }
            Err(e) => error!(row_id = %presence.row_id, error = %e, "Presence not serializable"),
        }
    }

    /// Mark an identity online and publish it.
    ///
    /// # Errors
    ///
    /// Returns the storage error; nothing is published in that case.
    pub async fn connect(&self, row_id: &str) -> Result<Presence, StoreError> {
        let presence = with_deadline(
            self.call_timeout,
            self.store
                .presence_upsert(row_id, PresenceStatus::Online, now_millis()),
        )
        .await?;
        self.publish(&presence);
        Ok(presence)
    }

    /// Refresh an identity's last-seen time, keeping it online.
    ///
    /// # Errors
    ///
    /// Returns the storage error; nothing is published in that case.
    pub async fn heartbeat(
        &self,
        row_id: &str,
        project_id: Option<&str>,
    ) -> Result<Presence, StoreError> {
        let presence = with_deadline(
            self.call_timeout,
            self.store.presence_heartbeat(row_id, project_id, now_millis()),
        )
        .await?;
        self.publish(&presence);
        Ok(presence)
    }

    /// Mark an identity offline and publish it.
    ///
    /// # Errors
    ///
    /// Returns the storage error; nothing is published in that case.
    pub async fn disconnect(&self, row_id: &str) -> Result<Presence, StoreError> {
        let presence = with_deadline(
            self.call_timeout,
            self.store
                .presence_upsert(row_id, PresenceStatus::Offline, now_millis()),
        )
        .await?;
        self.publish(&presence);
        Ok(presence)
    }

    /// Current presence of an identity.
    ///
    /// # Errors
    ///
    /// Returns the storage error.
    pub async fn get(&self, row_id: &str) -> Result<Option<Presence>, StoreError> {
        with_deadline(self.call_timeout, self.store.presence_get(row_id)).await
    }

    /// Flip every identity last seen before `cutoff` to offline in one bulk
    /// statement and publish one update per flipped identity.
    ///
    /// # Errors
    ///
    /// Returns the storage error; nothing is published in that case.
    pub async fn sweep_stale(&self, cutoff: i64) -> Result<Vec<String>, StoreError> {
        let flipped = with_deadline(self.call_timeout, self.store.presence_sweep(cutoff)).await?;
        let now = now_millis();
        for row_id in &flipped {
            self.publish(&Presence {
                row_id: row_id.clone(),
                status: PresenceStatus::Offline,
                last_seen_at: now,
                project_id: None,
            });
        }
        if !flipped.is_empty() {
            info!(count = flipped.len(), "Swept stale presence");
        }
        Ok(flipped)
    }

    /// Run [`sweep_stale`](Self::sweep_stale) every `interval` until `cancel`
    /// fires. A failed sweep is logged and retried on the next tick.
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        stale_after: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let stale_ms = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Presence sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let cutoff = now_millis().saturating_sub(stale_ms);
                if let Err(e) = manager.sweep_stale(cutoff).await {
                    error!(error = %e, "Presence sweep failed");
                }
            }
        })
    }
}
