//! Resource reconciler.
//!
//! Converges one guild's channels onto the desired display state:
//!
//! 1. capability check (no writes, no store access when denied)
//! 2. ensure the group category, recreating it if the stored id is stale
//! 3. for price then countdown: verify the stored channel, create it if missing,
//!    otherwise repair name / parent / position drift independently
//!
//! The mapping store is a cache of belief. Every stored id is re-fetched before it
//! is trusted and cleared as soon as it proves stale. Creation failures end the
//! pass for the guild; a rename failure ends that channel's pass only; move and
//! reposition failures are logged and skipped.
//!
//! Teardown also lives here since this is the only writer of the mapping store.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::display;
use crate::models::{ChannelRole, IndicatorAccess, MappingSlot, Metrics};
use crate::platform::{Channel, ChannelKind, NewChannel, PermissionOverwrite, Platform, PlatformError};
use crate::storage::{Storage, StoreError, StoreResult};

pub const DEFAULT_GROUP_LABEL: &str = "Halving Stats";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Converged,
    PermissionDenied,
    PartiallyFailed(String),
    /// The guild no longer exists on the platform; local state should be purged.
    TenantGone,
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub group_label: String,
    pub access: IndicatorAccess,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            group_label: DEFAULT_GROUP_LABEL.to_string(),
            access: IndicatorAccess::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DesiredState {
    pub price: f64,
    pub countdown: f64,
}

impl From<Metrics> for DesiredState {
    fn from(metrics: Metrics) -> Self {
        Self {
            price: metrics.price,
            countdown: metrics.countdown,
        }
    }
}

impl DesiredState {
    /// Always exactly two specs, price first.
    pub fn child_specs(&self, access: IndicatorAccess) -> [ChildSpec; 2] {
        let metrics = Metrics {
            price: self.price,
            countdown: self.countdown,
        };
        [
            ChildSpec {
                role: ChannelRole::Price,
                name: display::price_label(&metrics),
                order: 0,
                access,
            },
            ChildSpec {
                role: ChannelRole::Countdown,
                name: display::countdown_label(&metrics),
                order: 1,
                access,
            },
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub role: ChannelRole,
    pub name: String,
    pub order: i64,
    pub access: IndicatorAccess,
}

impl ChildSpec {
    fn overwrites(&self, guild_id: &str) -> Vec<PermissionOverwrite> {
        match self.access {
            IndicatorAccess::Public => vec![],
            IndicatorAccess::Locked => vec![PermissionOverwrite::deny_connect_everyone(guild_id)],
        }
    }
}

/// Errors that end the pass for a guild.
#[derive(Debug, Error)]
enum Fatal {
    #[error("mapping store failure: {0}")]
    Store(#[from] StoreError),
    #[error("capability lookup failed: {0}")]
    Capabilities(PlatformError),
    #[error("creating {what} channel failed: {source}")]
    Create {
        what: &'static str,
        source: PlatformError,
    },
}

enum ChildProgress {
    Done,
    RenameFailed(String),
}

pub struct Reconciler {
    platform: Arc<dyn Platform>,
    store: Storage,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(platform: Arc<dyn Platform>, store: Storage, settings: ReconcilerSettings) -> Self {
        Self {
            platform,
            store,
            settings,
        }
    }

    pub async fn reconcile(&self, guild_id: &str, desired: &DesiredState) -> ReconcileOutcome {
        match self.try_reconcile(guild_id, desired).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(guild_id, error = %err, "reconcile aborted");
                ReconcileOutcome::PartiallyFailed(err.to_string())
            }
        }
    }

    async fn try_reconcile(&self, guild_id: &str, desired: &DesiredState) -> Result<ReconcileOutcome, Fatal> {
        let capabilities = match self.platform.capabilities(guild_id).await {
            Ok(capabilities) => capabilities,
            Err(err) if err.is_not_found() => return Ok(ReconcileOutcome::TenantGone),
            Err(err) => return Err(Fatal::Capabilities(err)),
        };
        if !capabilities.can_manage() {
            debug!(guild_id, ?capabilities, "missing manage-channels capability");
            return Ok(ReconcileOutcome::PermissionDenied);
        }

        let group_id = self.ensure_group(guild_id).await?;

        let mut rename_failure: Option<String> = None;
        for spec in desired.child_specs(self.settings.access) {
            if let ChildProgress::RenameFailed(reason) = self.ensure_child(guild_id, &group_id, &spec).await? {
                rename_failure.get_or_insert(reason);
            }
        }

        Ok(match rename_failure {
            Some(reason) => ReconcileOutcome::PartiallyFailed(reason),
            None => ReconcileOutcome::Converged,
        })
    }

    async fn ensure_group(&self, guild_id: &str) -> Result<String, Fatal> {
        if let Some(group_id) = self.store.channel_id(guild_id, MappingSlot::Group)? {
            match self.platform.fetch_channel(guild_id, &group_id).await {
                Ok(Some(channel)) if channel.kind == ChannelKind::Category => return Ok(channel.id),
                Ok(Some(channel)) => {
                    debug!(guild_id, channel_id = %group_id, kind = ?channel.kind, "stored group is not a category")
                }
                Ok(None) => debug!(guild_id, channel_id = %group_id, "stored group is gone"),
                Err(err) => debug!(guild_id, channel_id = %group_id, error = %err, "stored group could not be fetched"),
            }
            self.store.clear_channel_id(guild_id, MappingSlot::Group)?;
        }

        let created = self
            .platform
            .create_channel(
                guild_id,
                NewChannel {
                    name: self.settings.group_label.clone(),
                    kind: ChannelKind::Category,
                    parent_id: None,
                    position: 0,
                    overwrites: vec![],
                },
            )
            .await
            .map_err(|source| Fatal::Create { what: "group", source })?;
        self.store
            .set_channel_id(guild_id, MappingSlot::Group, &created.id)?;
        info!(guild_id, channel_id = %created.id, "created group category");
        Ok(created.id)
    }

    async fn ensure_child(&self, guild_id: &str, group_id: &str, spec: &ChildSpec) -> Result<ChildProgress, Fatal> {
        let slot = spec.role.slot();
        let stored = self.store.channel_id(guild_id, slot)?;
        let live = match &stored {
            Some(channel_id) => self.live_indicator(guild_id, channel_id, spec.role).await,
            None => None,
        };

        match live {
            Some(channel) => Ok(self.repair_drift(guild_id, group_id, spec, channel).await),
            None => {
                if stored.is_some() {
                    self.store.clear_channel_id(guild_id, slot)?;
                }
                self.create_child(guild_id, group_id, spec).await?;
                Ok(ChildProgress::Done)
            }
        }
    }

    /// The stored channel if it still exists and is still a voice channel.
    async fn live_indicator(&self, guild_id: &str, channel_id: &str, role: ChannelRole) -> Option<Channel> {
        match self.platform.fetch_channel(guild_id, channel_id).await {
            Ok(Some(channel)) if channel.kind == ChannelKind::Voice => Some(channel),
            Ok(Some(channel)) => {
                debug!(guild_id, %role, channel_id, kind = ?channel.kind, "stored channel was repurposed");
                None
            }
            Ok(None) => {
                debug!(guild_id, %role, channel_id, "stored channel is gone");
                None
            }
            Err(err) => {
                debug!(guild_id, %role, channel_id, error = %err, "stored channel could not be fetched");
                None
            }
        }
    }

    async fn create_child(&self, guild_id: &str, group_id: &str, spec: &ChildSpec) -> Result<(), Fatal> {
        let created = self
            .platform
            .create_channel(
                guild_id,
                NewChannel {
                    name: spec.name.clone(),
                    kind: ChannelKind::Voice,
                    parent_id: Some(group_id.to_string()),
                    position: spec.order,
                    overwrites: spec.overwrites(guild_id),
                },
            )
            .await
            .map_err(|source| Fatal::Create {
                what: spec.role.as_str(),
                source,
            })?;
        self.store
            .set_channel_id(guild_id, spec.role.slot(), &created.id)?;
        info!(guild_id, role = %spec.role, channel_id = %created.id, name = %spec.name, "created indicator channel");
        Ok(())
    }

    async fn repair_drift(&self, guild_id: &str, group_id: &str, spec: &ChildSpec, channel: Channel) -> ChildProgress {
        let role = spec.role;
        let channel_id = channel.id.as_str();

        if channel.name != spec.name {
            if let Err(err) = self.platform.rename_channel(guild_id, channel_id, &spec.name).await {
                warn!(guild_id, %role, channel_id, error = %err, "rename failed");
                return ChildProgress::RenameFailed(format!("renaming {} channel failed: {}", role, err));
            }
            debug!(guild_id, %role, channel_id, name = %spec.name, "renamed");
        }

        if channel.parent_id.as_deref() != Some(group_id) {
            match self.platform.move_channel(guild_id, channel_id, group_id).await {
                Ok(()) => debug!(guild_id, %role, channel_id, group_id, "moved under group"),
                Err(err) => warn!(guild_id, %role, channel_id, error = %err, "move failed"),
            }
        }

        if channel.position != spec.order {
            match self.platform.reposition_channel(guild_id, channel_id, spec.order).await {
                Ok(()) => debug!(guild_id, %role, channel_id, position = spec.order, "repositioned"),
                Err(err) => warn!(guild_id, %role, channel_id, error = %err, "reposition failed"),
            }
        }

        ChildProgress::Done
    }

    /// Delete every channel the guild is believed to own (price, countdown, group),
    /// then forget the mapping. Deletion is skipped when the guild itself is gone.
    /// Returns true if every owned channel is known to be gone.
    pub async fn teardown(&self, guild_id: &str) -> StoreResult<bool> {
        let mapping = self.store.mapping(guild_id)?;
        let guild_present = match self.platform.guild_exists(guild_id).await {
            Ok(present) => present,
            Err(err) => {
                warn!(guild_id, error = %err, "guild lookup failed, attempting deletes anyway");
                true
            }
        };

        let mut clean = true;
        if guild_present {
            for slot in [MappingSlot::Price, MappingSlot::Countdown, MappingSlot::Group] {
                if let Some(channel_id) = mapping.get(slot) {
                    clean &= self.delete_if_present(guild_id, channel_id).await;
                }
            }
        } else {
            info!(guild_id, "guild no longer exists, clearing local state only");
        }

        self.store.clear_mapping(guild_id)?;
        Ok(clean)
    }

    /// Idempotent delete: an already-missing channel counts as deleted.
    pub async fn delete_if_present(&self, guild_id: &str, channel_id: &str) -> bool {
        match self.platform.delete_channel(guild_id, channel_id).await {
            Ok(()) => {
                debug!(guild_id, channel_id, "deleted channel");
                true
            }
            Err(err) if err.is_not_found() => {
                debug!(guild_id, channel_id, "channel already gone");
                true
            }
            Err(err) => {
                warn!(guild_id, channel_id, error = %err, "delete failed");
                false
            }
        }
    }
}
