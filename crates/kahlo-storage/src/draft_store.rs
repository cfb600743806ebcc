// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! Draft store (§4.4): persistent, mutable source snapshots with
//! write-through tmp-then-rename persistence under one global write lock.

use std::collections::HashMap;
use std::fs;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

use kahlo_core::error::ErrorCategory;
use kahlo_core::{Draft, DraftId, ErrorCode, JobId};

use crate::paths::DataPaths;

#[derive(Debug, Error)]
pub enum DraftError {
    #[error("draft {0} not found")]
    NotFound(DraftId),
    #[error("failed to persist draft {0}: {1}")]
    Io(DraftId, String),
}

impl ErrorCategory for DraftError {
    fn code(&self) -> ErrorCode {
        match self {
            DraftError::NotFound(_) => ErrorCode::NotFound,
            DraftError::Io(_, _) => ErrorCode::Internal,
        }
    }
}

struct Loaded {
    drafts: HashMap<DraftId, Draft>,
    scanned: bool,
}

/// Persistent, mutable drafts keyed by [`DraftId`]. Reads return shallow
/// clones so a concurrent `update` cannot mutate a snapshot in flight
/// toward promotion (§4.4).
pub struct DraftStore {
    paths: DataPaths,
    state: Mutex<Loaded>,
}

impl DraftStore {
    pub fn new(paths: DataPaths) -> Self {
        Self { paths, state: Mutex::new(Loaded { drafts: HashMap::new(), scanned: false }) }
    }

    /// Scan `<data>/drafts/` once, loading every `*.json` file and deleting
    /// orphan `*.tmp` files (§4.4 "On first use").
    fn ensure_scanned(&self, state: &mut Loaded) {
        if state.scanned {
            return;
        }
        state.scanned = true;
        let dir = self.paths.drafts_dir();
        let Ok(read_dir) = fs::read_dir(&dir) else {
            return;
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("tmp") => {
                    let _ = fs::remove_file(&path);
                }
                Some("json") => {
                    if let Ok(contents) = fs::read_to_string(&path) {
                        if let Ok(draft) = serde_json::from_str::<Draft>(&contents) {
                            state.drafts.insert(draft.draft_id, draft);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn write_through(&self, draft: &Draft) -> Result<(), DraftError> {
        let dir = self.paths.drafts_dir();
        fs::create_dir_all(&dir).map_err(|e| DraftError::Io(draft.draft_id, e.to_string()))?;
        let final_path = self.paths.draft_file(draft.draft_id.as_str());
        let tmp_path = final_path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(draft).map_err(|e| DraftError::Io(draft.draft_id, e.to_string()))?;
        fs::write(&tmp_path, &body).map_err(|e| DraftError::Io(draft.draft_id, e.to_string()))?;
        fs::rename(&tmp_path, &final_path).map_err(|e| DraftError::Io(draft.draft_id, e.to_string()))?;
        Ok(())
    }

    pub fn create(
        &self,
        name: Option<String>,
        source: impl Into<String>,
        manifest: Option<Value>,
        derived_from_job_id: Option<JobId>,
        now: DateTime<Utc>,
    ) -> Result<Draft, DraftError> {
        let mut state = self.state.lock();
        self.ensure_scanned(&mut state);
        let draft = Draft::new(DraftId::new(), name, source, manifest, derived_from_job_id, now);
        self.write_through(&draft)?;
        state.drafts.insert(draft.draft_id, draft.clone());
        Ok(draft)
    }

    pub fn get(&self, draft_id: &DraftId) -> Result<Draft, DraftError> {
        let mut state = self.state.lock();
        self.ensure_scanned(&mut state);
        state.drafts.get(draft_id).cloned().ok_or(DraftError::NotFound(*draft_id))
    }

    pub fn list(&self) -> Vec<Draft> {
        let mut state = self.state.lock();
        self.ensure_scanned(&mut state);
        state.drafts.values().cloned().collect()
    }

    pub fn update(
        &self,
        draft_id: &DraftId,
        name: Option<String>,
        source: Option<String>,
        manifest: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<Draft, DraftError> {
        let mut state = self.state.lock();
        self.ensure_scanned(&mut state);
        let mut draft = state.drafts.get(draft_id).cloned().ok_or(DraftError::NotFound(*draft_id))?;
        if let Some(name) = name {
            draft.name = Some(name);
        }
        if let Some(source) = source {
            draft.source = source;
        }
        if manifest.is_some() {
            draft.manifest = manifest;
        }
        draft.updated_at = now;
        self.write_through(&draft)?;
        state.drafts.insert(*draft_id, draft.clone());
        Ok(draft)
    }

    pub fn delete(&self, draft_id: &DraftId) -> Result<(), DraftError> {
        let mut state = self.state.lock();
        self.ensure_scanned(&mut state);
        if state.drafts.remove(draft_id).is_none() {
            return Err(DraftError::NotFound(*draft_id));
        }
        let final_path = self.paths.draft_file(draft_id.as_str());
        let _ = fs::remove_file(final_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (DraftStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        (DraftStore::new(paths), dir)
    }

    #[test]
    fn create_persists_and_is_readable() {
        let (store, _dir) = store();
        let draft = store.create(Some("hook".to_string()), "console.log(1)", None, None, Utc::now()).unwrap();
        let fetched = store.get(&draft.draft_id).unwrap();
        assert_eq!(fetched.source, "console.log(1)");
    }

    #[test]
    fn update_bumps_updated_at_and_fields() {
        let (store, _dir) = store();
        let draft = store.create(None, "a", None, None, Utc::now()).unwrap();
        let later = draft.updated_at + chrono::Duration::seconds(5);
        let updated = store.update(&draft.draft_id, Some("renamed".into()), Some("b".into()), None, later).unwrap();
        assert_eq!(updated.name.as_deref(), Some("renamed"));
        assert_eq!(updated.source, "b");
        assert_eq!(updated.updated_at, later);
    }

    #[test]
    fn delete_removes_from_index_and_disk() {
        let (store, _dir) = store();
        let draft = store.create(None, "a", None, None, Utc::now()).unwrap();
        store.delete(&draft.draft_id).unwrap();
        assert!(matches!(store.get(&draft.draft_id), Err(DraftError::NotFound(_))));
    }

    #[test]
    fn reloads_existing_drafts_from_disk_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        let draft_id;
        {
            let store = DraftStore::new(paths.clone());
            let draft = store.create(None, "persisted", None, None, Utc::now()).unwrap();
            draft_id = draft.draft_id;
        }
        let reopened = DraftStore::new(paths);
        let fetched = reopened.get(&draft_id).unwrap();
        assert_eq!(fetched.source, "persisted");
    }

    #[test]
    fn get_unknown_draft_is_not_found() {
        let (store, _dir) = store();
        assert!(matches!(store.get(&DraftId::new()), Err(DraftError::NotFound(_))));
    }
}
