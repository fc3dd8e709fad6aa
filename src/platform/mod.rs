//! Chat-platform client seam.
//!
//! The reconciler only talks to the platform through [`Platform`]. Two backends:
//! - [`discord::DiscordPlatform`]: Discord REST v10 over reqwest
//! - [`memory::MemoryPlatform`]: in-process guilds/channels with a mutation log,
//!   used by `--dry-run` and the test suites

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod discord;
pub mod memory;

pub const PERMISSION_ADMINISTRATOR: u64 = 1 << 3;
pub const PERMISSION_MANAGE_CHANNELS: u64 = 1 << 4;
pub const PERMISSION_CONNECT: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    Text,
    Voice,
    Category,
    Other(u8),
}

impl ChannelKind {
    pub fn from_wire(value: u8) -> Self {
        match value {
            0 => ChannelKind::Text,
            2 => ChannelKind::Voice,
            4 => ChannelKind::Category,
            other => ChannelKind::Other(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            ChannelKind::Text => 0,
            ChannelKind::Voice => 2,
            ChannelKind::Category => 4,
            ChannelKind::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverwriteTarget {
    Role,
    Member,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionOverwrite {
    pub id: String,
    pub target: OverwriteTarget,
    pub allow: u64,
    pub deny: u64,
}

impl PermissionOverwrite {
    /// Deny CONNECT to @everyone (whose role id is the guild id).
    pub fn deny_connect_everyone(guild_id: &str) -> Self {
        Self {
            id: guild_id.to_string(),
            target: OverwriteTarget::Role,
            allow: 0,
            deny: PERMISSION_CONNECT,
        }
    }
}

/// Last-observed snapshot of a live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    pub kind: ChannelKind,
    pub parent_id: Option<String>,
    pub position: i64,
    pub overwrites: Vec<PermissionOverwrite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChannel {
    pub name: String,
    pub kind: ChannelKind,
    pub parent_id: Option<String>,
    pub position: i64,
    pub overwrites: Vec<PermissionOverwrite>,
}

/// The bot's own standing inside a guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub manage_channels: bool,
    /// Highest role position held; 0 means only @everyone.
    pub top_role_position: i64,
}

impl Capabilities {
    pub fn can_manage(&self) -> bool {
        self.manage_channels && self.top_role_position > 0
    }
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("rate limited, retry after {retry_after_secs:.1}s")]
    RateLimited { retry_after_secs: f64 },
    #[error("platform api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("injected failure: {0}")]
    Injected(String),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

#[async_trait]
pub trait Platform: Send + Sync {
    /// Own membership/permission record in the guild. `NotFound` if the guild is gone.
    async fn capabilities(&self, guild_id: &str) -> PlatformResult<Capabilities>;
    async fn guild_exists(&self, guild_id: &str) -> PlatformResult<bool>;
    /// Every guild the bot is currently a member of.
    async fn list_guilds(&self) -> PlatformResult<Vec<String>>;

    async fn create_channel(&self, guild_id: &str, channel: NewChannel) -> PlatformResult<Channel>;
    /// `Ok(None)` when the id resolves to nothing usable in this guild.
    async fn fetch_channel(&self, guild_id: &str, channel_id: &str) -> PlatformResult<Option<Channel>>;
    async fn rename_channel(&self, guild_id: &str, channel_id: &str, name: &str) -> PlatformResult<()>;
    async fn move_channel(&self, guild_id: &str, channel_id: &str, parent_id: &str) -> PlatformResult<()>;
    async fn reposition_channel(&self, guild_id: &str, channel_id: &str, position: i64) -> PlatformResult<()>;
    async fn delete_channel(&self, guild_id: &str, channel_id: &str) -> PlatformResult<()>;
}
