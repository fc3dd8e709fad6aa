//! Fixed-cadence sync pass over every registered guild.
//!
//! Metrics are fetched once per pass and every guild is reconciled against that
//! same snapshot, sequentially. Guilds that turn out to be gone are handed to the
//! coordinator for cleanup. Permission-denied guilds are retried every pass; the
//! first denial is logged at warn, repeats at debug.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::lifecycle::Coordinator;
use crate::metrics::MetricsSource;
use crate::reconcile::{DesiredState, ReconcileOutcome, Reconciler};
use crate::status::StatusBoard;
use crate::storage::Storage;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub converged: usize,
    pub denied: usize,
    pub failed: usize,
    pub gone: usize,
}

pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    coordinator: Arc<Coordinator>,
    store: Storage,
    metrics: Arc<dyn MetricsSource>,
    status: StatusBoard,
    interval: Duration,
    denied: HashSet<String>,
}

impl Scheduler {
    pub fn new(
        reconciler: Arc<Reconciler>,
        coordinator: Arc<Coordinator>,
        store: Storage,
        metrics: Arc<dyn MetricsSource>,
        status: StatusBoard,
        interval: Duration,
    ) -> Self {
        Self {
            reconciler,
            coordinator,
            store,
            metrics,
            status,
            interval,
            denied: HashSet::new(),
        }
    }

    /// Ticks immediately, then every `interval`, until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!(interval_secs = self.interval.as_secs_f64(), "scheduler started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("scheduler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.run_pass().await;
                }
            }
        }
    }

    pub async fn run_pass(&mut self) -> PassSummary {
        let span = info_span!("sync_pass", pass_id = %Uuid::new_v4());
        self.pass().instrument(span).await
    }

    async fn pass(&mut self) -> PassSummary {
        let mut summary = PassSummary::default();
        let guilds = match self.store.registered_guilds() {
            Ok(guilds) => guilds,
            Err(err) => {
                error!(error = %err, "failed to read guild registry, skipping pass");
                return summary;
            }
        };

        // Guilds that left since the last pass start over with a fresh warn
        self.denied.retain(|guild_id| guilds.contains(guild_id));

        let metrics = self.metrics.fetch().await;
        self.status.record_metrics(metrics).await;
        let desired = DesiredState::from(metrics);

        for guild_id in &guilds {
            let outcome = self.reconciler.reconcile(guild_id, &desired).await;
            match &outcome {
                ReconcileOutcome::Converged => {
                    summary.converged += 1;
                    if self.denied.remove(guild_id) {
                        info!(guild_id = %guild_id, "permission restored");
                    }
                }
                ReconcileOutcome::PermissionDenied => {
                    summary.denied += 1;
                    if self.denied.insert(guild_id.clone()) {
                        warn!(guild_id = %guild_id, "missing manage-channels permission");
                    } else {
                        debug!(guild_id = %guild_id, "still missing manage-channels permission");
                    }
                }
                ReconcileOutcome::PartiallyFailed(reason) => {
                    summary.failed += 1;
                    warn!(guild_id = %guild_id, reason = %reason, "guild only partially reconciled");
                }
                ReconcileOutcome::TenantGone => {
                    summary.gone += 1;
                    info!(guild_id = %guild_id, "guild no longer exists, purging");
                    self.denied.remove(guild_id);
                    self.coordinator.on_leave(guild_id).await;
                    continue;
                }
            }
            self.status.record_outcome(guild_id, outcome).await;
        }

        info!(
            guilds = guilds.len(),
            converged = summary.converged,
            denied = summary.denied,
            failed = summary.failed,
            gone = summary.gone,
            "sync pass complete"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::StaticMetrics;
    use crate::models::{MappingSlot, Metrics};
    use crate::platform::memory::{MemoryPlatform, Mutation};
    use crate::platform::Capabilities;
    use crate::reconcile::ReconcilerSettings;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MANAGER: Capabilities = Capabilities {
        manage_channels: true,
        top_role_position: 1,
    };

    struct CountingMetrics {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetricsSource for CountingMetrics {
        async fn fetch(&self) -> Metrics {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Metrics { price: n as f64, countdown: 100.0 * n as f64 }
        }
    }

    struct Harness {
        platform: MemoryPlatform,
        store: Storage,
        status: StatusBoard,
        coordinator: Arc<Coordinator>,
        scheduler: Scheduler,
    }

    async fn harness(metrics: Arc<dyn MetricsSource>) -> Harness {
        let platform = MemoryPlatform::new();
        platform.add_guild("g1", MANAGER).await;
        let store = Storage::temporary().expect("storage");
        let status = StatusBoard::new();
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(platform.clone()),
            store.clone(),
            ReconcilerSettings::default(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            reconciler.clone(),
            store.clone(),
            metrics.clone(),
            status.clone(),
        ));
        let scheduler = Scheduler::new(
            reconciler,
            coordinator.clone(),
            store.clone(),
            metrics,
            status.clone(),
            Duration::from_millis(10),
        );
        Harness {
            platform,
            store,
            status,
            coordinator,
            scheduler,
        }
    }

    fn static_metrics() -> Arc<dyn MetricsSource> {
        Arc::new(StaticMetrics(Metrics { price: 64000.0, countdown: 210_000.0 }))
    }

    #[tokio::test]
    async fn join_then_unchanged_pass_is_mutation_free() {
        let mut h = harness(static_metrics()).await;
        assert!(h.store.registered_guilds().unwrap().is_empty());

        assert_eq!(h.coordinator.on_join("g1").await, ReconcileOutcome::Converged);
        assert_eq!(h.store.registered_guilds().unwrap(), vec!["g1"]);
        let created = h.platform.take_mutations().await;
        assert_eq!(created.len(), 3);
        assert!(created.iter().all(|m| matches!(m, Mutation::Create { .. })));
        let mapping = h.store.mapping("g1").unwrap();
        assert!(MappingSlot::ALL.iter().all(|slot| mapping.get(*slot).is_some()));

        let summary = h.scheduler.run_pass().await;
        assert_eq!(summary, PassSummary { converged: 1, ..PassSummary::default() });
        assert!(h.platform.mutations().await.is_empty());
        assert_eq!(h.store.mapping("g1").unwrap(), mapping);
    }

    #[tokio::test]
    async fn one_metrics_fetch_per_pass() {
        let metrics = Arc::new(CountingMetrics { calls: AtomicUsize::new(0) });
        let mut h = harness(metrics.clone()).await;
        h.platform.add_guild("g2", MANAGER).await;
        h.store.register_guild("g1").unwrap();
        h.store.register_guild("g2").unwrap();

        h.scheduler.run_pass().await;
        assert_eq!(metrics.calls.load(Ordering::SeqCst), 1);

        let name = |guild: &'static str| {
            let store = h.store.clone();
            let platform = h.platform.clone();
            async move {
                let id = store.channel_id(guild, MappingSlot::Price).unwrap().unwrap();
                platform.channel(&id).await.unwrap().name
            }
        };
        assert_eq!(name("g1").await, "Price: $1.0000");
        assert_eq!(name("g2").await, "Price: $1.0000");
        assert_eq!(h.status.last_metrics().await.unwrap().metrics.price, 1.0);

        h.scheduler.run_pass().await;
        assert_eq!(metrics.calls.load(Ordering::SeqCst), 2);
        assert_eq!(name("g2").await, "Price: $2.0000");
    }

    #[tokio::test]
    async fn pass_isolates_guild_failures() {
        let mut h = harness(static_metrics()).await;
        h.platform.add_guild("gone", MANAGER).await;
        h.platform
            .add_guild("denied", Capabilities { manage_channels: false, top_role_position: 1 })
            .await;
        for guild in ["gone", "denied", "g1"] {
            h.store.register_guild(guild).unwrap();
        }
        h.platform.remove_guild("gone").await;

        let summary = h.scheduler.run_pass().await;
        assert_eq!(summary, PassSummary { converged: 1, denied: 1, failed: 0, gone: 1 });
        assert_eq!(h.store.registered_guilds().unwrap(), vec!["denied", "g1"]);
        assert!(h.scheduler.denied.contains("denied"));
        assert_eq!(
            h.status.guild("denied").await.unwrap().outcome,
            ReconcileOutcome::PermissionDenied
        );

        // Permission granted later: retried and converged on the next pass
        h.platform.set_capabilities("denied", MANAGER).await;
        let summary = h.scheduler.run_pass().await;
        assert_eq!(summary, PassSummary { converged: 2, ..PassSummary::default() });
        assert!(h.scheduler.denied.is_empty());
    }

    #[tokio::test]
    async fn departed_guild_is_forgotten_by_denial_tracking() {
        let mut h = harness(static_metrics()).await;
        let locked_out = Capabilities { manage_channels: false, top_role_position: 1 };
        h.platform.add_guild("denied", locked_out).await;
        h.store.register_guild("denied").unwrap();

        h.scheduler.run_pass().await;
        assert!(h.scheduler.denied.contains("denied"));

        // Leaves through the watcher path, not through a pass outcome
        h.coordinator.on_leave("denied").await;
        h.scheduler.run_pass().await;
        assert!(h.scheduler.denied.is_empty());

        // Rejoining while still denied counts as a first denial again
        h.store.register_guild("denied").unwrap();
        let summary = h.scheduler.run_pass().await;
        assert_eq!(summary.denied, 1);
        assert!(h.scheduler.denied.contains("denied"));
    }

    #[tokio::test]
    async fn run_ticks_until_shutdown() {
        let h = harness(static_metrics()).await;
        h.store.register_guild("g1").unwrap();
        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(h.scheduler.run(async move {
            let _ = stop_rx.changed().await;
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        handle.await.expect("scheduler task");

        assert!(!h.store.mapping("g1").unwrap().is_empty());
        assert_eq!(h.platform.take_mutations().await.len(), 3);
    }
}
