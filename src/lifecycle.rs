//! Guild join/leave handling.
//!
//! Events arrive on a tokio mpsc channel and are handled one at a time. A join
//! registers the guild and reconciles it immediately with fresh metrics; a leave
//! unregisters first, then tears down whatever channels the guild still owns.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::metrics::MetricsSource;
use crate::models::LifecycleEvent;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::status::StatusBoard;
use crate::storage::Storage;

pub const EVENT_CHANNEL_CAPACITY: usize = 64;

pub fn event_channel() -> (mpsc::Sender<LifecycleEvent>, mpsc::Receiver<LifecycleEvent>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

pub struct Coordinator {
    reconciler: Arc<Reconciler>,
    store: Storage,
    metrics: Arc<dyn MetricsSource>,
    status: StatusBoard,
}

impl Coordinator {
    pub fn new(
        reconciler: Arc<Reconciler>,
        store: Storage,
        metrics: Arc<dyn MetricsSource>,
        status: StatusBoard,
    ) -> Self {
        Self {
            reconciler,
            store,
            metrics,
            status,
        }
    }

    pub async fn on_join(&self, guild_id: &str) -> ReconcileOutcome {
        match self.store.register_guild(guild_id) {
            Ok(true) => info!(guild_id, "guild registered"),
            Ok(false) => debug!(guild_id, "guild already registered"),
            Err(err) => warn!(guild_id, error = %err, "failed to register guild"),
        }

        let metrics = self.metrics.fetch().await;
        self.status.record_metrics(metrics).await;
        let outcome = self.reconciler.reconcile(guild_id, &metrics.into()).await;
        match &outcome {
            ReconcileOutcome::Converged => info!(guild_id, "guild channels ready"),
            ReconcileOutcome::PermissionDenied => {
                warn!(guild_id, "missing manage-channels permission, retrying on the next pass")
            }
            ReconcileOutcome::PartiallyFailed(reason) => {
                warn!(guild_id, reason = %reason, "initial reconcile incomplete")
            }
            ReconcileOutcome::TenantGone => {
                info!(guild_id, "guild vanished during join");
                self.on_leave(guild_id).await;
                return outcome;
            }
        }
        self.status.record_outcome(guild_id, outcome.clone()).await;
        outcome
    }

    pub async fn on_leave(&self, guild_id: &str) {
        if let Err(err) = self.store.unregister_guild(guild_id) {
            warn!(guild_id, error = %err, "failed to unregister guild");
        }
        match self.reconciler.teardown(guild_id).await {
            Ok(true) => info!(guild_id, "guild torn down"),
            Ok(false) => warn!(guild_id, "guild torn down, some channels could not be deleted"),
            Err(err) => warn!(guild_id, error = %err, "failed to clear guild mapping"),
        }
        self.status.forget(guild_id).await;
    }

    pub async fn handle(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Joined(guild_id) => {
                self.on_join(&guild_id).await;
            }
            LifecycleEvent::Left(guild_id) => self.on_leave(&guild_id).await,
        }
    }

    /// Single-consumer loop; returns once every sender is dropped.
    pub async fn run(&self, mut events: mpsc::Receiver<LifecycleEvent>) {
        while let Some(event) = events.recv().await {
            debug!(?event, "lifecycle event");
            self.handle(event).await;
        }
        info!("lifecycle event channel closed");
    }
}
