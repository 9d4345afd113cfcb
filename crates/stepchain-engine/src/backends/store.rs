//! Persistence for finished units so later `node` steps can load them.
//!
//! Records live either in memory or as `<dir>/<node>.json` files.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use stepchain_types::{ChainError, Result, UnitOutcome};

#[derive(Debug)]
enum Storage {
    Memory(Vec<UnitOutcome>),
    Dir(PathBuf),
}

#[derive(Debug)]
pub struct NodeStore {
    storage: Mutex<Storage>,
}

impl NodeStore {
    pub fn in_memory() -> Self {
        Self {
            storage: Mutex::new(Storage::Memory(Vec::new())),
        }
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: Mutex::new(Storage::Dir(dir.into())),
        }
    }

    /// Persist `outcome` under a fresh node id and return it tagged with it.
    /// Node ids start at 1.
    pub async fn save(&self, outcome: UnitOutcome) -> Result<UnitOutcome> {
        let mut storage = self.storage.lock().await;
        match &mut *storage {
            Storage::Memory(records) => {
                let node = records.len() as i64 + 1;
                let outcome = outcome.with_node(node);
                records.push(outcome.clone());
                Ok(outcome)
            }
            Storage::Dir(dir) => {
                tokio::fs::create_dir_all(&*dir).await?;
                let node = last_node(dir).await? + 1;
                let outcome = outcome.with_node(node);
                let path = record_path(dir, node);
                tokio::fs::write(&path, serde_json::to_string_pretty(&outcome)?).await?;
                tracing::debug!(path = %path.display(), node, "Unit record saved");
                Ok(outcome)
            }
        }
    }

    pub async fn load(&self, node: i64) -> Result<UnitOutcome> {
        let storage = self.storage.lock().await;
        let missing = || ChainError::Backend {
            unit: format!("node {node}"),
            message: "no such node".into(),
        };
        match &*storage {
            Storage::Memory(records) => usize::try_from(node - 1)
                .ok()
                .and_then(|i| records.get(i))
                .cloned()
                .ok_or_else(missing),
            Storage::Dir(dir) => {
                let path = record_path(dir, node);
                if node < 1 || !tokio::fs::try_exists(&path).await? {
                    return Err(missing());
                }
                let json = tokio::fs::read_to_string(&path).await?;
                Ok(serde_json::from_str(&json)?)
            }
        }
    }
}

fn record_path(dir: &Path, node: i64) -> PathBuf {
    dir.join(format!("{node}.json"))
}

/// Highest node id recorded in `dir`, or 0.
async fn last_node(dir: &Path) -> Result<i64> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut last = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let id = name
            .to_str()
            .and_then(|n| n.strip_suffix(".json"))
            .and_then(|n| n.parse::<i64>().ok());
        if let Some(id) = id {
            last = last.max(id);
        }
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn outcome(v: serde_json::Value) -> UnitOutcome {
        UnitOutcome::success(v.as_object().cloned().unwrap_or_else(Map::new))
    }

    #[tokio::test]
    async fn memory_store_numbers_from_one() {
        let store = NodeStore::in_memory();
        let a = store.save(outcome(json!({"a": 1}))).await.unwrap();
        let b = store.save(outcome(json!({"b": 2}))).await.unwrap();
        assert_eq!((a.node, b.node), (Some(1), Some(2)));
        assert_eq!(store.load(2).await.unwrap().outputs["b"], 2);
        assert!(store.load(0).await.is_err());
        assert!(store.load(3).await.is_err());
    }

    #[tokio::test]
    async fn dir_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = NodeStore::at(dir.path());
        first.save(outcome(json!({"x": 1}))).await.unwrap();

        let second = NodeStore::at(dir.path());
        let saved = second.save(outcome(json!({"x": 2}))).await.unwrap();
        assert_eq!(saved.node, Some(2));

        let loaded = second.load(1).await.unwrap();
        assert_eq!(loaded.outputs["x"], 1);
        assert_eq!(loaded.node, Some(1));
        assert!(matches!(second.load(9).await, Err(ChainError::Backend { .. })));
    }
}
