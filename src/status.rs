//! In-memory record of what the daemon last did, served by the status API.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::Metrics;
use crate::reconcile::ReconcileOutcome;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub metrics: Metrics,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuildStatus {
    pub outcome: ReconcileOutcome,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Board {
    last_metrics: Option<MetricsSnapshot>,
    guilds: HashMap<String, GuildStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<Board>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_metrics(&self, metrics: Metrics) {
        self.inner.write().await.last_metrics = Some(MetricsSnapshot {
            metrics,
            fetched_at: Utc::now(),
        });
    }

    pub async fn record_outcome(&self, guild_id: &str, outcome: ReconcileOutcome) {
        self.inner.write().await.guilds.insert(
            guild_id.to_string(),
            GuildStatus {
                outcome,
                updated_at: Utc::now(),
            },
        );
    }

    pub async fn forget(&self, guild_id: &str) {
        self.inner.write().await.guilds.remove(guild_id);
    }

    pub async fn last_metrics(&self) -> Option<MetricsSnapshot> {
        self.inner.read().await.last_metrics.clone()
    }

    pub async fn guild(&self, guild_id: &str) -> Option<GuildStatus> {
        self.inner.read().await.guilds.get(guild_id).cloned()
    }
}
