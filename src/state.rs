//! Durable per-file ingest cursors.
//!
//! A single JSON document records, for every conversation file, how far the
//! ingester has committed. Writes go to a sibling temp file and rename over
//! the target, so a crash between `commit` and the next `load` can never
//! leave a torn document. One process owns one state file; the in-process
//! mutex serializes writers within it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size_at_last_commit: u64,
    pub byte_offset: u64,
    /// Mtime (seconds since epoch) observed at the last commit.
    pub last_modified: i64,
    pub last_imported_at: String,
    pub chunks_written: u64,
    pub conversation_id: String,
    pub project: String,
    pub collection: String,
    pub chunking_version: String,
    #[serde(default)]
    pub corrupt_lines: u64,
    /// Keys written by newer versions or external tooling survive rewrite.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub imported_files: BTreeMap<String, FileRecord>,
    #[serde(default)]
    pub file_metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub struct StateStore {
    path: PathBuf,
    doc: Mutex<StateDocument>,
}

impl StateStore {
    /// Load the document at `path`. An absent file is an empty state; a file
    /// that exists but fails to parse is fatal; the operator must repair it.
    pub fn load(path: PathBuf) -> AppResult<Self> {
        let doc = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents).map_err(|e| {
                AppError::StateCorrupt(format!("{}: {}", path.display(), e))
            })?
        } else {
            StateDocument::default()
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, file_path: &str) -> Option<FileRecord> {
        self.doc.lock().imported_files.get(file_path).cloned()
    }

    /// Upsert a record and rewrite the document. Returns only after the
    /// rename has landed, so a crash immediately afterwards still observes
    /// the committed record on the next load.
    pub fn commit(&self, record: FileRecord) -> AppResult<()> {
        let mut doc = self.doc.lock();
        doc.imported_files.insert(record.path.clone(), record);
        self.persist(&doc)
    }

    /// Remove a record (repair tooling only).
    pub fn forget(&self, file_path: &str) -> AppResult<()> {
        let mut doc = self.doc.lock();
        doc.imported_files.remove(file_path);
        self.persist(&doc)
    }

    pub fn records(&self) -> Vec<FileRecord> {
        self.doc.lock().imported_files.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.doc.lock().imported_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, doc: &StateDocument) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, offset: u64) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size_at_last_commit: offset,
            byte_offset: offset,
            last_modified: 1_700_000_000,
            last_imported_at: "2026-01-01T00:00:00Z".to_string(),
            chunks_written: 3,
            conversation_id: "c1".to_string(),
            project: "alpha".to_string(),
            collection: "conv_deadbeef_local".to_string(),
            chunking_version: "v2".to_string(),
            corrupt_lines: 0,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_load_absent_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_commit_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = StateStore::load(path.clone()).unwrap();
            store.commit(record("/logs/p/c1.jsonl", 1200)).unwrap();
        }
        let reloaded = StateStore::load(path).unwrap();
        let rec = reloaded.get("/logs/p/c1.jsonl").unwrap();
        assert_eq!(rec.byte_offset, 1200);
        assert_eq!(rec.chunking_version, "v2");
    }

    #[test]
    fn test_commit_overwrites_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).unwrap();
        store.commit(record("/logs/p/c1.jsonl", 100)).unwrap();
        store.commit(record("/logs/p/c1.jsonl", 900)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("/logs/p/c1.jsonl").unwrap().byte_offset, 900);
    }

    #[test]
    fn test_forget() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).unwrap();
        store.commit(record("/logs/p/c1.jsonl", 100)).unwrap();
        store.forget("/logs/p/c1.jsonl").unwrap();
        assert!(store.get("/logs/p/c1.jsonl").is_none());
    }

    #[test]
    fn test_malformed_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        match StateStore::load(path) {
            Err(AppError::StateCorrupt(_)) => {}
            other => panic!("expected StateCorrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let seeded = serde_json::json!({
            "imported_files": {},
            "file_metadata": {},
            "schema_note": "added by a future version"
        });
        std::fs::write(&path, serde_json::to_string(&seeded).unwrap()).unwrap();

        let store = StateStore::load(path.clone()).unwrap();
        store.commit(record("/logs/p/c1.jsonl", 10)).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["schema_note"], "added by a future version");
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::load(path.clone()).unwrap();
        store.commit(record("/logs/p/c1.jsonl", 10)).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
