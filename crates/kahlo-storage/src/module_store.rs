// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! Module store (§4.5): directory-backed, keyed by `(name, semver)`.
//! Promotion runs under a single write lock shared with index rebuilding.

use std::collections::HashMap;
use std::fs;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use kahlo_core::error::ErrorCategory;
use kahlo_core::{DraftId, ErrorCode, JobId, ModuleBundle, VersionStrategy};

use crate::paths::DataPaths;

#[derive(Debug, Error)]
pub enum ModuleStoreError {
    #[error("module {0:?}@{1} not found")]
    NotFound(String, Version),
    #[error("module {0:?} has no versions")]
    NoVersions(String),
    #[error("failed to persist module {0:?}@{1}: {2}")]
    Io(String, Version, String),
}

impl ErrorCategory for ModuleStoreError {
    fn code(&self) -> ErrorCode {
        match self {
            ModuleStoreError::NotFound(_, _) | ModuleStoreError::NoVersions(_) => ErrorCode::NotFound,
            ModuleStoreError::Io(_, _, _) => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    name: String,
    version: Version,
}

struct ModuleStoreState {
    rebuilt: bool,
    versions_by_name: HashMap<String, Vec<Version>>,
    bundles: HashMap<(String, Version), ModuleBundle>,
}

pub struct ModuleStore {
    paths: DataPaths,
    state: Mutex<ModuleStoreState>,
}

impl ModuleStore {
    pub fn new(paths: DataPaths) -> Self {
        Self {
            paths,
            state: Mutex::new(ModuleStoreState {
                rebuilt: false,
                versions_by_name: HashMap::new(),
                bundles: HashMap::new(),
            }),
        }
    }

    /// Rebuild the index by scanning `<data>/modules/<name>/<version>/`
    /// once per store lifetime (§4.5 "On first use").
    fn ensure_rebuilt(&self, state: &mut ModuleStoreState) {
        if state.rebuilt {
            return;
        }
        state.rebuilt = true;

        let mut versions_by_name: HashMap<String, Vec<Version>> = HashMap::new();
        let mut bundles: HashMap<(String, Version), ModuleBundle> = HashMap::new();

        if let Ok(name_entries) = fs::read_dir(self.paths.modules_dir()) {
            for name_entry in name_entries.flatten() {
                let name_path = name_entry.path();
                if !name_path.is_dir() {
                    continue;
                }
                let Some(name) = name_path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let name = name.to_string();
                let Ok(version_entries) = fs::read_dir(&name_path) else {
                    continue;
                };
                for version_entry in version_entries.flatten() {
                    let version_path = version_entry.path();
                    if !version_path.is_dir() {
                        continue;
                    }
                    let Some(version_str) = version_path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    let version = match Version::parse(version_str) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(name = %name, version = version_str, error = %e, "skipping module version directory with invalid semver");
                            continue;
                        }
                    };
                    let manifest_path = self.paths.module_manifest_file(&name, &version);
                    if let Ok(contents) = fs::read_to_string(&manifest_path) {
                        if let Ok(bundle) = serde_json::from_str::<ModuleBundle>(&contents) {
                            versions_by_name.entry(name.clone()).or_default().push(version.clone());
                            bundles.insert((name.clone(), version), bundle);
                        }
                    }
                }
            }
        }
        for versions in versions_by_name.values_mut() {
            versions.sort();
        }

        state.versions_by_name = versions_by_name;
        state.bundles = bundles;
        self.persist_index_file(state, true);
    }

    /// Write `modules/index.json`. On the initial rebuild (`skip_if_empty`),
    /// an empty scan result does not clobber a non-empty on-disk index
    /// (§4.5 "do not overwrite an existing non-empty on-disk index").
    fn persist_index_file(&self, state: &ModuleStoreState, skip_if_empty: bool) {
        if skip_if_empty && state.bundles.is_empty() {
            if let Ok(existing) = fs::read_to_string(self.paths.module_index_file()) {
                let trimmed = existing.trim();
                if !trimmed.is_empty() && trimmed != "[]" {
                    tracing::warn!("module index rebuild found zero modules; keeping existing on-disk index.json");
                    return;
                }
            }
        }
        let entries: Vec<IndexEntry> =
            state.bundles.values().map(|b| IndexEntry { name: b.name.clone(), version: b.version.clone() }).collect();
        if let Ok(body) = serde_json::to_vec_pretty(&entries) {
            if fs::create_dir_all(self.paths.modules_dir()).is_ok() {
                let _ = fs::write(self.paths.module_index_file(), body);
            }
        }
    }

    fn write_bundle(&self, bundle: &ModuleBundle) -> Result<(), ModuleStoreError> {
        let dir = self.paths.module_version_dir(&bundle.name, &bundle.version);
        fs::create_dir_all(&dir)
            .map_err(|e| ModuleStoreError::Io(bundle.name.clone(), bundle.version.clone(), e.to_string()))?;
        let manifest_body = serde_json::to_vec_pretty(bundle)
            .map_err(|e| ModuleStoreError::Io(bundle.name.clone(), bundle.version.clone(), e.to_string()))?;
        fs::write(self.paths.module_manifest_file(&bundle.name, &bundle.version), manifest_body)
            .map_err(|e| ModuleStoreError::Io(bundle.name.clone(), bundle.version.clone(), e.to_string()))?;
        fs::write(dir.join("source.js"), &bundle.source)
            .map_err(|e| ModuleStoreError::Io(bundle.name.clone(), bundle.version.clone(), e.to_string()))?;
        Ok(())
    }

    /// `promoteFromJob` / `promoteDraft` (§4.5): bump the last existing
    /// version of `name` per `strategy`, persist, and record provenance.
    #[allow(clippy::too_many_arguments)]
    pub fn promote(
        &self,
        name: &str,
        strategy: VersionStrategy,
        source: String,
        manifest: Option<Value>,
        derived_from_job_id: Option<JobId>,
        derived_from_draft_id: Option<DraftId>,
        now: DateTime<Utc>,
    ) -> Result<ModuleBundle, ModuleStoreError> {
        let mut state = self.state.lock();
        self.ensure_rebuilt(&mut state);
        let previous = state.versions_by_name.get(name).and_then(|vs| vs.last());
        let version = strategy.next(previous);
        let bundle = ModuleBundle {
            name: name.to_string(),
            version: version.clone(),
            source,
            manifest,
            created_at: now,
            derived_from_job_id,
            derived_from_draft_id,
        };
        self.write_bundle(&bundle)?;
        match state.versions_by_name.get_mut(name) {
            Some(versions) => {
                versions.push(version.clone());
                versions.sort();
            }
            None => {
                state.versions_by_name.insert(name.to_string(), vec![version.clone()]);
            }
        }
        state.bundles.insert((name.to_string(), version), bundle.clone());
        self.persist_index_file(&state, false);
        Ok(bundle)
    }

    pub fn get(&self, name: &str, version: &Version) -> Result<ModuleBundle, ModuleStoreError> {
        let mut state = self.state.lock();
        self.ensure_rebuilt(&mut state);
        state
            .bundles
            .get(&(name.to_string(), version.clone()))
            .cloned()
            .ok_or_else(|| ModuleStoreError::NotFound(name.to_string(), version.clone()))
    }

    pub fn get_latest(&self, name: &str) -> Result<ModuleBundle, ModuleStoreError> {
        let mut state = self.state.lock();
        self.ensure_rebuilt(&mut state);
        let version = state
            .versions_by_name
            .get(name)
            .and_then(|vs| vs.last())
            .cloned()
            .ok_or_else(|| ModuleStoreError::NoVersions(name.to_string()))?;
        state
            .bundles
            .get(&(name.to_string(), version.clone()))
            .cloned()
            .ok_or(ModuleStoreError::NotFound(name.to_string(), version))
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        let mut state = self.state.lock();
        self.ensure_rebuilt(&mut state);
        state.versions_by_name.get(name).cloned().unwrap_or_default()
    }

    pub fn list(&self) -> Vec<ModuleBundle> {
        let mut state = self.state.lock();
        self.ensure_rebuilt(&mut state);
        state.bundles.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (ModuleStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        (ModuleStore::new(paths), dir)
    }

    #[test]
    fn promote_with_no_previous_version_starts_at_0_1_0_for_minor() {
        let (store, _dir) = store();
        let bundle =
            store.promote("hook-lib", VersionStrategy::Minor, "source".into(), None, None, None, Utc::now()).unwrap();
        assert_eq!(bundle.version, Version::new(0, 1, 0));
    }

    #[test]
    fn promote_bumps_from_previous_version() {
        let (store, _dir) = store();
        store.promote("hook-lib", VersionStrategy::Minor, "v1".into(), None, None, None, Utc::now()).unwrap();
        let second =
            store.promote("hook-lib", VersionStrategy::Patch, "v2".into(), None, None, None, Utc::now()).unwrap();
        assert_eq!(second.version, Version::new(0, 1, 1));
        assert_eq!(store.list_versions("hook-lib").len(), 2);
    }

    #[test]
    fn get_latest_returns_highest_version() {
        let (store, _dir) = store();
        store.promote("hook-lib", VersionStrategy::Minor, "v1".into(), None, None, None, Utc::now()).unwrap();
        store.promote("hook-lib", VersionStrategy::Major, "v2".into(), None, None, None, Utc::now()).unwrap();
        let latest = store.get_latest("hook-lib").unwrap();
        assert_eq!(latest.version, Version::new(1, 0, 0));
    }

    #[test]
    fn reloads_existing_bundles_from_disk_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        {
            let store = ModuleStore::new(paths.clone());
            store.promote("hook-lib", VersionStrategy::Minor, "persisted".into(), None, None, None, Utc::now()).unwrap();
        }
        let reopened = ModuleStore::new(paths);
        let bundle = reopened.get_latest("hook-lib").unwrap();
        assert_eq!(bundle.source, "persisted");
    }

    #[test]
    fn get_unknown_module_is_not_found() {
        let (store, _dir) = store();
        assert!(matches!(store.get("missing", &Version::new(1, 0, 0)), Err(ModuleStoreError::NotFound(_, _))));
    }

    #[test]
    fn skips_version_directory_with_invalid_semver() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        let bad_dir = dir.path().join("modules").join("hook-lib").join("not-a-version");
        fs::create_dir_all(&bad_dir).unwrap();
        fs::write(bad_dir.join("manifest.json"), "{}").unwrap();
        let store = ModuleStore::new(paths);
        assert!(store.list_versions("hook-lib").is_empty());
    }
}
