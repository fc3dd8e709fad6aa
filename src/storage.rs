use sled::Db;
use std::path::Path;
use thiserror::Error;

use crate::models::{GuildMapping, MappingSlot};

/// Registry key holding the JSON array of registered guild ids.
const REGISTRY_KEY: &str = "guilds";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("registry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("stored channel id is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone)]  // Clone for sharing across tasks (Sled internals cheap to clone)
pub struct Storage {
    db: Db,
    // Trees:
    // - mappings: "<guild>:group" / "<guild>:price" / "<guild>:countdown" -> channel id
    // - registry: single "guilds" key -> JSON array of guild ids
    mapping_tree: sled::Tree,
    registry_tree: sled::Tree,
}

impl Storage {
    /// Open or create the Sled database at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Database in a temporary directory, deleted on drop (dry runs and tests)
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let mapping_tree = db.open_tree("mappings")?;
        let registry_tree = db.open_tree("registry")?;
        Ok(Self {
            db,
            mapping_tree,
            registry_tree,
        })
    }

    fn mapping_key(guild_id: &str, slot: MappingSlot) -> String {
        format!("{}:{}", guild_id, slot.key_suffix())
    }

    // --- Resource mapping (guild -> channel ids) ---

    pub fn channel_id(&self, guild_id: &str, slot: MappingSlot) -> StoreResult<Option<String>> {
        match self.mapping_tree.get(Self::mapping_key(guild_id, slot))? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes.to_vec())?)),
            None => Ok(None),
        }
    }

    pub fn set_channel_id(&self, guild_id: &str, slot: MappingSlot, channel_id: &str) -> StoreResult<()> {
        self.mapping_tree
            .insert(Self::mapping_key(guild_id, slot), channel_id.as_bytes())?;
        Ok(())
    }

    pub fn clear_channel_id(&self, guild_id: &str, slot: MappingSlot) -> StoreResult<()> {
        self.mapping_tree.remove(Self::mapping_key(guild_id, slot))?;
        Ok(())
    }

    /// All three slots for a guild in one read
    pub fn mapping(&self, guild_id: &str) -> StoreResult<GuildMapping> {
        Ok(GuildMapping {
            group_id: self.channel_id(guild_id, MappingSlot::Group)?,
            price_channel_id: self.channel_id(guild_id, MappingSlot::Price)?,
            countdown_channel_id: self.channel_id(guild_id, MappingSlot::Countdown)?,
        })
    }

    pub fn clear_mapping(&self, guild_id: &str) -> StoreResult<()> {
        for slot in MappingSlot::ALL {
            self.clear_channel_id(guild_id, slot)?;
        }
        Ok(())
    }

    // --- Guild registry (set semantics over a single list-valued key) ---

    pub fn registered_guilds(&self) -> StoreResult<Vec<String>> {
        match self.registry_tree.get(REGISTRY_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(vec![]),
        }
    }

    pub fn is_registered(&self, guild_id: &str) -> StoreResult<bool> {
        Ok(self.registered_guilds()?.iter().any(|id| id == guild_id))
    }

    /// Returns true if the guild was newly added
    pub fn register_guild(&self, guild_id: &str) -> StoreResult<bool> {
        self.update_registry(|guilds| {
            if guilds.iter().any(|id| id == guild_id) {
                return false;
            }
            guilds.push(guild_id.to_string());
            true
        })
    }

    /// Returns true if the guild was present
    pub fn unregister_guild(&self, guild_id: &str) -> StoreResult<bool> {
        self.update_registry(|guilds| {
            let before = guilds.len();
            guilds.retain(|id| id != guild_id);
            guilds.len() != before
        })
    }

    /// Atomic read-modify-write of the registry list. `edit` may run more than
    /// once if another writer races the compare-and-swap.
    fn update_registry(&self, mut edit: impl FnMut(&mut Vec<String>) -> bool) -> StoreResult<bool> {
        let mut changed = false;
        let mut failure: Option<StoreError> = None;
        self.registry_tree.fetch_and_update(REGISTRY_KEY, |current| {
            failure = None;
            let mut guilds = match current.map(serde_json::from_slice::<Vec<String>>).transpose() {
                Ok(list) => list.unwrap_or_default(),
                Err(err) => {
                    failure = Some(err.into());
                    return current.map(|bytes| bytes.to_vec());
                }
            };
            changed = edit(&mut guilds);
            match serde_json::to_vec(&guilds) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    failure = Some(err.into());
                    current.map(|bytes| bytes.to_vec())
                }
            }
        })?;
        match failure {
            Some(err) => Err(err),
            None => Ok(changed),
        }
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_mapping_slots_are_independent() {
        let storage = Storage::temporary().expect("Failed to open storage");

        storage.set_channel_id("g1", MappingSlot::Group, "100").unwrap();
        storage.set_channel_id("g1", MappingSlot::Price, "101").unwrap();
        storage.set_channel_id("g2", MappingSlot::Price, "201").unwrap();

        assert_eq!(storage.channel_id("g1", MappingSlot::Group).unwrap().as_deref(), Some("100"));
        assert_eq!(storage.channel_id("g1", MappingSlot::Countdown).unwrap(), None);

        storage.clear_channel_id("g1", MappingSlot::Price).unwrap();
        let mapping = storage.mapping("g1").unwrap();
        assert_eq!(mapping.group_id.as_deref(), Some("100"));
        assert_eq!(mapping.price_channel_id, None);

        // Other guilds untouched
        assert_eq!(storage.channel_id("g2", MappingSlot::Price).unwrap().as_deref(), Some("201"));

        storage.clear_mapping("g1").unwrap();
        assert!(storage.mapping("g1").unwrap().is_empty());
    }

    #[test]
    fn test_registry_has_set_semantics() {
        let storage = Storage::temporary().expect("Failed to open storage");
        assert!(storage.registered_guilds().unwrap().is_empty());

        assert!(storage.register_guild("g1").unwrap());
        assert!(!storage.register_guild("g1").unwrap());
        assert!(storage.register_guild("g2").unwrap());
        assert_eq!(storage.registered_guilds().unwrap(), vec!["g1", "g2"]);
        assert!(storage.is_registered("g2").unwrap());

        assert!(storage.unregister_guild("g1").unwrap());
        assert!(!storage.unregister_guild("g1").unwrap());
        assert_eq!(storage.registered_guilds().unwrap(), vec!["g2"]);
    }

    #[test]
    fn test_state_survives_reopen() {
        // Use temp dir for isolated on-disk DB
        let temp_dir = std::env::temp_dir().join(format!("stat_channels_test_storage_{}", uuid::Uuid::new_v4()));
        let _ = fs::remove_dir_all(&temp_dir);

        {
            let storage = Storage::open(temp_dir.to_str().unwrap()).expect("Failed to open storage");
            storage.register_guild("g1").unwrap();
            storage.set_channel_id("g1", MappingSlot::Countdown, "555").unwrap();
            storage.flush().unwrap();
        }

        let storage = Storage::open(temp_dir.to_str().unwrap()).expect("Failed to reopen storage");
        assert_eq!(storage.registered_guilds().unwrap(), vec!["g1"]);
        assert_eq!(
            storage.channel_id("g1", MappingSlot::Countdown).unwrap().as_deref(),
            Some("555")
        );

        drop(storage);
        let _ = fs::remove_dir_all(temp_dir);
    }
}
