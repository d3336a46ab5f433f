//! Tree persistence.
//!
//! The engine never owns a storage format. It hands snapshots to a
//! [`TreeStore`] after every applied action and reads them back when an
//! instance is opened from storage. A store must round-trip a
//! [`PageDefinition`] exactly.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use thiserror::Error;

use crate::config::EngineConfig;
use crate::model::PageDefinition;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no tree stored for `{0}`")]
    NotFound(String),
    #[error("version {version} of `{instance}` is not retained")]
    VersionNotRetained { instance: String, version: u64 },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

pub trait TreeStore: Send + Sync {
    /// Persist `tree` as the latest version of `instance`.
    fn save(&self, instance: &str, tree: &PageDefinition) -> Result<(), StoreError>;

    /// The latest stored version.
    fn load(&self, instance: &str) -> Result<PageDefinition, StoreError>;

    /// A specific stored version.
    fn load_version(&self, instance: &str, version: u64) -> Result<PageDefinition, StoreError>;
}

/// In-memory store keeping the last `history` versions per instance as
/// serialized JSON.
#[derive(Debug)]
pub struct MemoryTreeStore {
    history: usize,
    trees: RwLock<HashMap<String, BTreeMap<u64, String>>>,
}

impl Default for MemoryTreeStore {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl MemoryTreeStore {
    pub fn new(history: usize) -> Self {
        Self {
            history: history.max(1),
            trees: RwLock::new(HashMap::new()),
        }
    }

    /// Keeps `config.store_history` versions per instance.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.store_history)
    }

    pub fn versions(&self, instance: &str) -> Vec<u64> {
        let trees = self.trees.read().unwrap_or_else(|e| e.into_inner());
        trees
            .get(instance)
            .map(|h| h.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl TreeStore for MemoryTreeStore {
    fn save(&self, instance: &str, tree: &PageDefinition) -> Result<(), StoreError> {
        let text = serde_json::to_string(tree)?;
        let mut trees = self.trees.write().unwrap_or_else(|e| e.into_inner());
        let versions = trees.entry(instance.to_string()).or_default();
        versions.insert(tree.version, text);
        while versions.len() > self.history {
            versions.pop_first();
        }
        Ok(())
    }

    fn load(&self, instance: &str) -> Result<PageDefinition, StoreError> {
        let trees = self.trees.read().unwrap_or_else(|e| e.into_inner());
        let (_, text) = trees
            .get(instance)
            .and_then(|h| h.last_key_value())
            .ok_or_else(|| StoreError::NotFound(instance.to_string()))?;
        Ok(serde_json::from_str(text)?)
    }

    fn load_version(&self, instance: &str, version: u64) -> Result<PageDefinition, StoreError> {
        let trees = self.trees.read().unwrap_or_else(|e| e.into_inner());
        let history = trees
            .get(instance)
            .ok_or_else(|| StoreError::NotFound(instance.to_string()))?;
        let text = history.get(&version).ok_or_else(|| StoreError::VersionNotRetained {
            instance: instance.to_string(),
            version,
        })?;
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Section;
    use serde_json::json;

    fn tree(version: u64) -> PageDefinition {
        let mut tree = PageDefinition::new(vec![Section::new("a", "Text").with_props(json!({
            "nested": {"list": [1, {"deep": null}], "z": true, "a": 1.5}
        }))])
        .with_version(version);
        tree.metadata.insert("title".into(), json!("Home"));
        tree
    }

    #[test]
    fn save_and_load_round_trip() {
        let store = MemoryTreeStore::new(4);
        store.save("page", &tree(1)).unwrap();
        store.save("page", &tree(2)).unwrap();
        assert_eq!(store.load("page").unwrap(), tree(2));
        assert_eq!(store.load_version("page", 1).unwrap(), tree(1));
        assert!(matches!(store.load("other"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn history_is_bounded() {
        let store = MemoryTreeStore::new(2);
        for v in 1..=5 {
            store.save("page", &tree(v)).unwrap();
        }
        assert_eq!(store.versions("page"), [4, 5]);
        assert!(matches!(
            store.load_version("page", 3),
            Err(StoreError::VersionNotRetained { version: 3, .. })
        ));
    }

    #[test]
    fn history_follows_config() {
        let config = EngineConfig::from_json(r#"{"store_history": 3}"#).unwrap();
        let store = MemoryTreeStore::from_config(&config);
        for v in 1..=6 {
            store.save("page", &tree(v)).unwrap();
        }
        assert_eq!(store.versions("page"), [4, 5, 6]);
        assert_eq!(MemoryTreeStore::default().history, EngineConfig::default().store_history);
    }
}
