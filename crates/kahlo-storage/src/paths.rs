// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! Persisted state layout (§6):
//!
//! ```text
//! <dataDir>/
//!   runs/<YYYY-MM-DD>/target_<target_id>/
//!     events.jsonl
//!     artifacts.jsonl
//!     artifacts/<artifact_id>.<ext>
//!   drafts/<draft_id>.json
//!   modules/<name>/<semver>/{manifest.json, source.<ext>}
//!   modules/index.json
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use kahlo_core::TargetId;

#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<dataDir>/runs/<yyyy-mm-dd-utc>/target_<target_id>/`, dates in UTC (§4.2/§6).
    pub fn run_dir(&self, now: DateTime<Utc>, target_id: &TargetId) -> PathBuf {
        self.root
            .join("runs")
            .join(now.format("%Y-%m-%d").to_string())
            .join(format!("target_{target_id}"))
    }

    pub fn events_jsonl(&self, now: DateTime<Utc>, target_id: &TargetId) -> PathBuf {
        self.run_dir(now, target_id).join("events.jsonl")
    }

    pub fn artifacts_jsonl(&self, now: DateTime<Utc>, target_id: &TargetId) -> PathBuf {
        self.run_dir(now, target_id).join("artifacts.jsonl")
    }

    pub fn artifacts_dir(&self, now: DateTime<Utc>, target_id: &TargetId) -> PathBuf {
        self.run_dir(now, target_id).join("artifacts")
    }

    pub fn drafts_dir(&self) -> PathBuf {
        self.root.join("drafts")
    }

    pub fn draft_file(&self, draft_id: &str) -> PathBuf {
        self.drafts_dir().join(format!("{draft_id}.json"))
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.root.join("modules")
    }

    pub fn module_index_file(&self) -> PathBuf {
        self.modules_dir().join("index.json")
    }

    pub fn module_version_dir(&self, name: &str, version: &semver::Version) -> PathBuf {
        self.modules_dir().join(name).join(version.to_string())
    }

    pub fn module_manifest_file(&self, name: &str, version: &semver::Version) -> PathBuf {
        self.module_version_dir(name, version).join("manifest.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_dir_uses_utc_date_and_target_prefix() {
        let paths = DataPaths::new("/data");
        let now: DateTime<Utc> = "2026-03-05T00:00:00Z".parse().unwrap();
        let target_id = TargetId::from_string("targ-abc");
        let dir = paths.run_dir(now, &target_id);
        assert_eq!(dir, PathBuf::from("/data/runs/2026-03-05/target_targ-abc"));
    }
}
