//! Dynamic-host/provisioning-marker persistence (§4.12).
//!
//! Narrower than a task-level rollback system: a flat JSON object on
//! disk, read once at startup and rewritten atomically (temp file then
//! rename) after every mutation so a crash never leaves a half-written
//! file behind.

use std::path::PathBuf;

use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// JSON-file-backed key/value store for state the orchestrator needs to
/// survive across invocations (e.g. hosts added at runtime, one-shot
/// provisioning markers).
pub struct StateStore {
    path: Option<PathBuf>,
    data: Mutex<Map<String, Value>>,
}

impl StateStore {
    /// Load from `path` if it exists, or start empty. `path: None` keeps
    /// state in memory only (useful for tests and one-shot invocations).
    pub fn new(path: Option<PathBuf>) -> Result<Self> {
        let data = match &path {
            Some(p) if p.exists() => {
                let contents = std::fs::read_to_string(p).map_err(|e| Error::Persistence {
                    path: p.clone(),
                    message: e.to_string(),
                })?;
                serde_json::from_str(&contents).map_err(|e| Error::Persistence {
                    path: p.clone(),
                    message: e.to_string(),
                })?
            }
            _ => Map::new(),
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub async fn has(&self, key: &str) -> bool {
        self.data.lock().await.contains_key(key)
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().await.get(key).cloned()
    }

    /// Every stored entry whose key starts with `prefix`, with the prefix
    /// stripped (§4.12's replay-at-entry needs the bare suffix, e.g. a
    /// host name out of `dynamic_host:<name>`).
    pub async fn entries_with_prefix(&self, prefix: &str) -> Vec<(String, Value)> {
        self.data
            .lock()
            .await
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(prefix).map(|suffix| (suffix.to_string(), v.clone())))
            .collect()
    }

    /// Same as [`Self::entries_with_prefix`] but callable from sync
    /// construction code: safe right after [`Self::new`], before the
    /// store is shared with any concurrent caller.
    pub fn entries_with_prefix_sync(&self, prefix: &str) -> Vec<(String, Value)> {
        self.data
            .try_lock()
            .expect("state store is uncontended immediately after construction")
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(prefix).map(|suffix| (suffix.to_string(), v.clone())))
            .collect()
    }

    /// Insert or replace `key`, flushing to disk before returning.
    pub async fn add(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let mut data = self.data.lock().await;
        data.insert(key.into(), value);
        self.flush(&data)
    }

    /// Remove `key`, flushing to disk before returning.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        data.remove(key);
        self.flush(&data)
    }

    /// Merge `patch`'s keys into the object stored at `key` (creating it
    /// if absent), flushing before returning.
    pub async fn merge_into(&self, key: &str, patch: &Map<String, Value>) -> Result<()> {
        let mut data = self.data.lock().await;
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(existing) = entry {
            for (k, v) in patch {
                existing.insert(k.clone(), v.clone());
            }
        } else {
            *entry = Value::Object(patch.clone());
        }
        self.flush(&data)
    }

    fn flush(&self, data: &Map<String, Value>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Persistence {
                path: path.clone(),
                message: e.to_string(),
            })?;
        }
        let serialized = serde_json::to_vec_pretty(data).map_err(|e| Error::Persistence {
            path: path.clone(),
            message: e.to_string(),
        })?;

        let tmp = tempfile::NamedTempFile::new_in(path.parent().unwrap_or(&PathBuf::from(".")))
            .map_err(|e| Error::Persistence {
                path: path.clone(),
                message: e.to_string(),
            })?;
        std::fs::write(tmp.path(), &serialized).map_err(|e| Error::Persistence {
            path: path.clone(),
            message: e.to_string(),
        })?;
        tmp.persist(path).map_err(|e| Error::Persistence {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn add_and_get_round_trip() {
        let store = StateStore::new(None).unwrap();
        store.add("k", json!("v")).await.unwrap();
        assert_eq!(store.get("k").await, Some(json!("v")));
    }

    #[tokio::test]
    async fn merge_into_combines_object_fields() {
        let store = StateStore::new(None).unwrap();
        let mut patch = Map::new();
        patch.insert("a".to_string(), json!(1));
        store.merge_into("obj", &patch).await.unwrap();

        let mut patch2 = Map::new();
        patch2.insert("b".to_string(), json!(2));
        store.merge_into("obj", &patch2).await.unwrap();

        let value = store.get("obj").await.unwrap();
        assert_eq!(value["a"], 1);
        assert_eq!(value["b"], 2);
    }

    #[tokio::test]
    async fn persists_across_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::new(Some(path.clone())).unwrap();
        store.add("key", json!(42)).await.unwrap();
        drop(store);

        let reloaded = StateStore::new(Some(path)).unwrap();
        assert_eq!(reloaded.get("key").await, Some(json!(42)));
    }

    #[tokio::test]
    async fn remove_drops_the_key() {
        let store = StateStore::new(None).unwrap();
        store.add("k", json!(1)).await.unwrap();
        store.remove("k").await.unwrap();
        assert!(!store.has("k").await);
    }

    #[tokio::test]
    async fn entries_with_prefix_strips_the_prefix() {
        let store = StateStore::new(None).unwrap();
        store.add("dynamic_host:web1", json!({"name": "web1"})).await.unwrap();
        store.add("dynamic_host:web2", json!({"name": "web2"})).await.unwrap();
        store.add("other:key", json!(true)).await.unwrap();

        let mut found = store.entries_with_prefix("dynamic_host:").await;
        found.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, "web1");
        assert_eq!(found[1].0, "web2");
    }
}
