//! Polls the bot's guild list and turns membership changes into lifecycle events.
//!
//! Guilds the platform lists but the registry lacks become `Joined`; registered
//! guilds the platform no longer lists become `Left`. A failed listing emits
//! nothing, so an outage can never look like mass departure.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::models::LifecycleEvent;
use crate::platform::Platform;
use crate::storage::Storage;

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(30);

pub struct GuildWatcher {
    platform: Arc<dyn Platform>,
    store: Storage,
    events: mpsc::Sender<LifecycleEvent>,
    interval: Duration,
}

impl GuildWatcher {
    pub fn new(
        platform: Arc<dyn Platform>,
        store: Storage,
        events: mpsc::Sender<LifecycleEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            platform,
            store,
            events,
            interval,
        }
    }

    /// One diff cycle. Returns how many events were emitted, or an error once the
    /// coordinator has stopped listening.
    pub async fn poll_once(&self) -> Result<usize, SendError<LifecycleEvent>> {
        let listed = match self.platform.list_guilds().await {
            Ok(guilds) => guilds,
            Err(err) => {
                warn!(error = %err, "guild listing failed, skipping cycle");
                return Ok(0);
            }
        };
        let registered = match self.store.registered_guilds() {
            Ok(guilds) => guilds,
            Err(err) => {
                warn!(error = %err, "failed to read guild registry, skipping cycle");
                return Ok(0);
            }
        };

        let listed_set: HashSet<&str> = listed.iter().map(String::as_str).collect();
        let registered_set: HashSet<&str> = registered.iter().map(String::as_str).collect();

        let mut emitted = 0;
        for guild_id in listed.iter().filter(|id| !registered_set.contains(id.as_str())) {
            info!(guild_id = %guild_id, "guild joined");
            self.events.send(LifecycleEvent::Joined(guild_id.clone())).await?;
            emitted += 1;
        }
        for guild_id in registered.iter().filter(|id| !listed_set.contains(id.as_str())) {
            info!(guild_id = %guild_id, "guild left");
            self.events.send(LifecycleEvent::Left(guild_id.clone())).await?;
            emitted += 1;
        }
        debug!(listed = listed.len(), registered = registered.len(), emitted, "guild watch cycle");
        Ok(emitted)
    }

    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("guild watcher stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if self.poll_once().await.is_err() {
                        info!("lifecycle channel closed, guild watcher stopping");
                        return;
                    }
                }
            }
        }
    }
}
