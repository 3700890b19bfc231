//! Local `progress.json` hint persistence.
//!
//! A pure optimization subordinate to the RAG remote document-name index:
//! it exists only to short-circuit obviously-stale reconciliation work
//! (§4.7, §6 Persisted state). The pipeline remains correct with this file
//! missing, empty, or corrupt — all three are treated as "no hint yet"
//! rather than an error, per the open-question decision recorded in
//! DESIGN.md (the file this was distilled from treats it as load-bearing;
//! this spec explicitly demotes it).

use crate::models::RemoteNameIndex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub file_name: String,
    pub dify_dataset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRecord {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dify_dataset: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressData {
    #[serde(default)]
    pub processed: HashMap<String, ProcessedRecord>,
    #[serde(default)]
    pub failed: HashMap<String, FailedRecord>,
}

pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the hint file. A missing or corrupt file yields an empty
    /// [`ProgressData`] rather than an error.
    pub fn load(&self) -> ProgressData {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return ProgressData::default();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    /// Persist `data` atomically via `tmp` + `rename`, matching C9's
    /// persistence idiom.
    pub fn save(&self, data: &ProgressData) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let body = serde_json::to_string_pretty(data)?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let tmp_path = dir.join(format!(
            ".{}.tmp",
            self.path.file_name().and_then(|n| n.to_str()).unwrap_or("progress.json")
        ));
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Record one task's outcome for next run's short-circuit hint.
    pub fn record_outcome(
        data: &mut ProgressData,
        task_key: &str,
        succeeded: bool,
        file_name: &str,
        dataset: &str,
        stage: &str,
        reason: &str,
    ) {
        if succeeded {
            data.failed.remove(task_key);
            data.processed.insert(
                task_key.to_string(),
                ProcessedRecord {
                    file_name: file_name.to_string(),
                    dify_dataset: dataset.to_string(),
                },
            );
        } else {
            data.processed.remove(task_key);
            data.failed.insert(
                task_key.to_string(),
                FailedRecord {
                    stage: stage.to_string(),
                    dify_dataset: if dataset.is_empty() { None } else { Some(dataset.to_string()) },
                    reason: reason.to_string(),
                },
            );
        }
    }
}

/// Reconcile `data` against the authoritative remote name index in place:
/// drop a `processed`/`failed` conflict for the same task key in favor of
/// `processed`, and drop `processed` entries the remote index no longer
/// corroborates (its expected document name is absent and its item_key
/// isn't present remotely at all either) — these are treated as stale.
pub fn reconcile(data: &mut ProgressData, remote: &RemoteNameIndex) {
    let conflicting: Vec<String> = data
        .processed
        .keys()
        .filter(|k| data.failed.contains_key(*k))
        .cloned()
        .collect();
    for key in conflicting {
        data.failed.remove(&key);
    }

    data.processed.retain(|task_key, record| {
        let item_key = crate::models::item_key_of(task_key);
        let expected_name = crate::models::markdown_doc_name(item_key, &record.file_name);
        remote.names.contains(&expected_name) || remote.prefixed_item_keys.contains(item_key)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path().join("progress.json"));
        let data = store.load();
        assert!(data.processed.is_empty() && data.failed.is_empty());
    }

    #[test]
    fn corrupt_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, "not json").unwrap();
        let store = ProgressStore::new(path);
        let data = store.load();
        assert!(data.processed.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path().join("progress.json"));
        let mut data = ProgressData::default();
        ProgressStore::record_outcome(&mut data, "ABC123#0", true, "paper.md", "Zotero Literature", "", "");
        store.save(&data).unwrap();
        let reloaded = store.load();
        assert_eq!(reloaded.processed.len(), 1);
        assert_eq!(reloaded.processed["ABC123#0"].file_name, "paper.md");
    }

    #[test]
    fn reconcile_drops_stale_processed_entries() {
        let mut data = ProgressData::default();
        data.processed.insert(
            "GONE001#0".to_string(),
            ProcessedRecord { file_name: "old.pdf".to_string(), dify_dataset: "ds".to_string() },
        );
        data.processed.insert(
            "KEEP002#0".to_string(),
            ProcessedRecord { file_name: "keep.pdf".to_string(), dify_dataset: "ds".to_string() },
        );
        let remote = RemoteNameIndex {
            total: Some(1),
            names: HashSet::from(["[KEEP002] keep.md".to_string()]),
            prefixed_item_keys: HashSet::from(["KEEP002".to_string()]),
        };
        reconcile(&mut data, &remote);
        assert!(!data.processed.contains_key("GONE001#0"));
        assert!(data.processed.contains_key("KEEP002#0"));
    }

    #[test]
    fn reconcile_resolves_processed_failed_conflict_in_favor_of_processed() {
        let mut data = ProgressData::default();
        data.processed.insert(
            "ABC123#0".to_string(),
            ProcessedRecord { file_name: "paper.pdf".to_string(), dify_dataset: "ds".to_string() },
        );
        data.failed.insert(
            "ABC123#0".to_string(),
            FailedRecord { stage: "ocr_upload".to_string(), dify_dataset: None, reason: "stale retry record".to_string() },
        );
        let remote = RemoteNameIndex {
            total: Some(1),
            names: HashSet::from(["[ABC123] paper.md".to_string()]),
            prefixed_item_keys: HashSet::from(["ABC123".to_string()]),
        };
        reconcile(&mut data, &remote);
        assert!(data.processed.contains_key("ABC123#0"));
        assert!(!data.failed.contains_key("ABC123#0"));
    }
}
