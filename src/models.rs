use serde::{Deserialize, Serialize};

/// Normalized upstream metrics. `Default` is the safe fallback shown on fetch failure.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct Metrics {
    pub price: f64,
    pub countdown: f64,
}

/// Mapping-store slots owned by one guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingSlot {
    Group,
    Price,
    Countdown,
}

impl MappingSlot {
    pub const ALL: [MappingSlot; 3] = [MappingSlot::Group, MappingSlot::Price, MappingSlot::Countdown];

    pub fn key_suffix(self) -> &'static str {
        match self {
            MappingSlot::Group => "group",
            MappingSlot::Price => "price",
            MappingSlot::Countdown => "countdown",
        }
    }
}

/// The two indicator channels, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Price,
    Countdown,
}

impl ChannelRole {
    pub fn slot(self) -> MappingSlot {
        match self {
            ChannelRole::Price => MappingSlot::Price,
            ChannelRole::Countdown => MappingSlot::Countdown,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.slot().key_suffix()
    }
}

impl std::fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored belief about which channels a guild owns. Any id may be stale.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct GuildMapping {
    pub group_id: Option<String>,
    pub price_channel_id: Option<String>,
    pub countdown_channel_id: Option<String>,
}

impl GuildMapping {
    pub fn get(&self, slot: MappingSlot) -> Option<&str> {
        match slot {
            MappingSlot::Group => self.group_id.as_deref(),
            MappingSlot::Price => self.price_channel_id.as_deref(),
            MappingSlot::Countdown => self.countdown_channel_id.as_deref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        MappingSlot::ALL.iter().all(|slot| self.get(*slot).is_none())
    }
}

/// Who may join the indicator channels once created.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorAccess {
    /// Inherit the category's permissions.
    Public,
    /// Deny CONNECT to @everyone so the channels are display-only.
    #[default]
    Locked,
}

/// Join/leave signals consumed by the lifecycle coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Joined(String),
    Left(String),
}
