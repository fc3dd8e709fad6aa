//! In-memory implementation of [`Platform`].
//!
//! Guilds and channels live in `HashMap`s guarded by a `tokio::sync::RwLock`. Every
//! mutation call is appended to a log (including calls that fail by injection) so
//! callers can assert exactly which writes a reconcile issued. Channel ids are
//! handed out from a monotonically increasing counter and never reused.
//!
//! Out-of-band helpers (`drop_channel`, `edit_channel`, `remove_guild`) simulate
//! administrators or platform failures and are not logged.

use super::{
    Capabilities, Channel, ChannelKind, NewChannel, Platform, PlatformError, PlatformResult,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Create { guild_id: String, channel_id: String, name: String },
    Rename { channel_id: String, name: String },
    Move { channel_id: String, parent_id: String },
    Reposition { channel_id: String, position: i64 },
    Delete { channel_id: String },
}

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Capabilities,
    Fetch,
    Create,
    Rename,
    Move,
    Reposition,
    Delete,
}

#[derive(Debug, Default)]
struct State {
    guilds: HashMap<String, Capabilities>,
    channels: HashMap<String, Channel>,
    next_id: u64,
    mutations: Vec<Mutation>,
    faults: HashSet<Fault>,
}

impl State {
    fn check(&self, fault: Fault) -> PlatformResult<()> {
        if self.faults.contains(&fault) {
            return Err(PlatformError::Injected(format!("{:?}", fault)));
        }
        Ok(())
    }

    fn check_guild(&self, guild_id: &str) -> PlatformResult<()> {
        if self.guilds.contains_key(guild_id) {
            Ok(())
        } else {
            Err(PlatformError::NotFound(format!("guild {}", guild_id)))
        }
    }

    fn channel_mut(&mut self, guild_id: &str, channel_id: &str) -> PlatformResult<&mut Channel> {
        self.check_guild(guild_id)?;
        self.channels
            .get_mut(channel_id)
            .filter(|channel| channel.guild_id == guild_id)
            .ok_or_else(|| PlatformError::NotFound(format!("channel {}", channel_id)))
    }

    fn remove_channel(&mut self, channel_id: &str) -> Option<Channel> {
        let removed = self.channels.remove(channel_id)?;
        // Deleting a category orphans its children, as Discord does.
        if removed.kind == ChannelKind::Category {
            for child in self.channels.values_mut() {
                if child.parent_id.as_deref() == Some(channel_id) {
                    child.parent_id = None;
                }
            }
        }
        Some(removed)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryPlatform {
    state: Arc<RwLock<State>>,
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPlatform {
    pub fn new() -> Self {
        let state = State {
            next_id: 1000,
            ..State::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn add_guild(&self, guild_id: &str, capabilities: Capabilities) {
        self.state
            .write()
            .await
            .guilds
            .insert(guild_id.to_string(), capabilities);
    }

    /// The guild disappears; its channels become unreachable.
    pub async fn remove_guild(&self, guild_id: &str) {
        self.state.write().await.guilds.remove(guild_id);
    }

    pub async fn set_capabilities(&self, guild_id: &str, capabilities: Capabilities) {
        self.add_guild(guild_id, capabilities).await;
    }

    pub async fn channel(&self, channel_id: &str) -> Option<Channel> {
        self.state.read().await.channels.get(channel_id).cloned()
    }

    pub async fn channels_in(&self, guild_id: &str) -> Vec<Channel> {
        let state = self.state.read().await;
        let mut channels: Vec<Channel> = state
            .channels
            .values()
            .filter(|channel| channel.guild_id == guild_id)
            .cloned()
            .collect();
        channels.sort_by(|a, b| a.id.cmp(&b.id));
        channels
    }

    /// Out-of-band deletion.
    pub async fn drop_channel(&self, channel_id: &str) {
        self.state.write().await.remove_channel(channel_id);
    }

    /// Out-of-band modification.
    pub async fn edit_channel(&self, channel_id: &str, edit: impl FnOnce(&mut Channel)) {
        if let Some(channel) = self.state.write().await.channels.get_mut(channel_id) {
            edit(channel);
        }
    }

    /// Out-of-band creation, bypassing the mutation log.
    pub async fn insert_channel(&self, guild_id: &str, channel: NewChannel) -> Channel {
        let mut state = self.state.write().await;
        let channel = build_channel(&mut state, guild_id, channel);
        state.channels.insert(channel.id.clone(), channel.clone());
        channel
    }

    pub async fn mutations(&self) -> Vec<Mutation> {
        self.state.read().await.mutations.clone()
    }

    /// Returns and clears the mutation log.
    pub async fn take_mutations(&self) -> Vec<Mutation> {
        std::mem::take(&mut self.state.write().await.mutations)
    }

    pub async fn fail(&self, fault: Fault) {
        self.state.write().await.faults.insert(fault);
    }

    pub async fn heal(&self, fault: Fault) {
        self.state.write().await.faults.remove(&fault);
    }
}

fn build_channel(state: &mut State, guild_id: &str, channel: NewChannel) -> Channel {
    let id = state.next_id.to_string();
    state.next_id += 1;
    Channel {
        id,
        guild_id: guild_id.to_string(),
        name: channel.name,
        kind: channel.kind,
        parent_id: channel.parent_id,
        position: channel.position,
        overwrites: channel.overwrites,
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn capabilities(&self, guild_id: &str) -> PlatformResult<Capabilities> {
        let state = self.state.read().await;
        state.check(Fault::Capabilities)?;
        state
            .guilds
            .get(guild_id)
            .copied()
            .ok_or_else(|| PlatformError::NotFound(format!("guild {}", guild_id)))
    }

    async fn guild_exists(&self, guild_id: &str) -> PlatformResult<bool> {
        Ok(self.state.read().await.guilds.contains_key(guild_id))
    }

    async fn list_guilds(&self) -> PlatformResult<Vec<String>> {
        let mut guilds: Vec<String> = self.state.read().await.guilds.keys().cloned().collect();
        guilds.sort();
        Ok(guilds)
    }

    async fn create_channel(&self, guild_id: &str, channel: NewChannel) -> PlatformResult<Channel> {
        let mut state = self.state.write().await;
        state.check_guild(guild_id)?;
        // Reserve the id before the fault check so a failed create is still visible in the log.
        let created = build_channel(&mut state, guild_id, channel);
        state.mutations.push(Mutation::Create {
            guild_id: guild_id.to_string(),
            channel_id: created.id.clone(),
            name: created.name.clone(),
        });
        state.check(Fault::Create)?;
        tracing::debug!(guild_id, channel_id = %created.id, name = %created.name, "memory platform: channel created");
        state.channels.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn fetch_channel(&self, guild_id: &str, channel_id: &str) -> PlatformResult<Option<Channel>> {
        let state = self.state.read().await;
        state.check(Fault::Fetch)?;
        state.check_guild(guild_id)?;
        Ok(state
            .channels
            .get(channel_id)
            .filter(|channel| channel.guild_id == guild_id)
            .cloned())
    }

    async fn rename_channel(&self, guild_id: &str, channel_id: &str, name: &str) -> PlatformResult<()> {
        let mut state = self.state.write().await;
        state.mutations.push(Mutation::Rename {
            channel_id: channel_id.to_string(),
            name: name.to_string(),
        });
        state.check(Fault::Rename)?;
        state.channel_mut(guild_id, channel_id)?.name = name.to_string();
        Ok(())
    }

    async fn move_channel(&self, guild_id: &str, channel_id: &str, parent_id: &str) -> PlatformResult<()> {
        let mut state = self.state.write().await;
        state.mutations.push(Mutation::Move {
            channel_id: channel_id.to_string(),
            parent_id: parent_id.to_string(),
        });
        state.check(Fault::Move)?;
        state.channel_mut(guild_id, channel_id)?.parent_id = Some(parent_id.to_string());
        Ok(())
    }

    async fn reposition_channel(&self, guild_id: &str, channel_id: &str, position: i64) -> PlatformResult<()> {
        let mut state = self.state.write().await;
        state.mutations.push(Mutation::Reposition {
            channel_id: channel_id.to_string(),
            position,
        });
        state.check(Fault::Reposition)?;
        state.channel_mut(guild_id, channel_id)?.position = position;
        Ok(())
    }

    async fn delete_channel(&self, guild_id: &str, channel_id: &str) -> PlatformResult<()> {
        let mut state = self.state.write().await;
        state.mutations.push(Mutation::Delete {
            channel_id: channel_id.to_string(),
        });
        state.check(Fault::Delete)?;
        state.channel_mut(guild_id, channel_id)?;
        state.remove_channel(channel_id);
        Ok(())
    }
}
