// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! Artifact store (§4.3): per-target disk budget, synchronous atomic
//! tmp-then-rename persistence, and an in-memory index for reads.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use kahlo_core::error::ErrorCategory;
use kahlo_core::{Artifact, ArtifactId, ArtifactType, ErrorCode, JobId, TargetId};

use crate::paths::DataPaths;

/// §3/§4.3 default per-target disk budget (500 MiB).
pub const DEFAULT_BUDGET_BYTES: u64 = 524_288_000;
/// §4.3 "facade-visible constant" inline threshold.
pub const INLINE_THRESHOLD_BYTES: u64 = 32_768;

#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    #[error("artifact type {0:?} is not allowed")]
    InvalidType(String),
    #[error("size_bytes > 0 but no payload bytes were provided")]
    EmptyPayload,
    #[error("declared size_bytes {expected} does not match actual payload size {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("target {0} artifact budget exceeded")]
    BudgetExceeded(TargetId),
    #[error("artifact id {0} already exists")]
    DuplicateId(ArtifactId),
    #[error("artifact {0} not found")]
    NotFound(ArtifactId),
    #[error("failed to persist artifact: {0}")]
    Io(String),
}

impl ErrorCategory for ArtifactStoreError {
    fn code(&self) -> ErrorCode {
        match self {
            ArtifactStoreError::InvalidType(_)
            | ArtifactStoreError::EmptyPayload
            | ArtifactStoreError::SizeMismatch { .. }
            | ArtifactStoreError::DuplicateId(_) => ErrorCode::InvalidArgument,
            ArtifactStoreError::BudgetExceeded(_) => ErrorCode::InvalidArgument,
            ArtifactStoreError::NotFound(_) => ErrorCode::NotFound,
            ArtifactStoreError::Io(_) => ErrorCode::Internal,
        }
    }
}

/// `storeArtifact` request (§4.3, step list).
#[derive(Debug, Clone)]
pub struct StoreArtifactRequest {
    pub target_id: TargetId,
    pub artifact_id: ArtifactId,
    pub job_id: JobId,
    pub ts: DateTime<Utc>,
    pub artifact_type: String,
    pub size_bytes: u64,
    pub mime: Option<String>,
    pub name: Option<String>,
    pub metadata: Option<Value>,
    pub data: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TargetArtifactStats {
    pub count: u64,
    pub total_bytes: u64,
    pub budget_bytes: u64,
}

struct TargetArtifactState {
    artifacts: HashMap<ArtifactId, Artifact>,
    total_bytes: u64,
    dir_ready: bool,
    index_writer: Option<File>,
    index_errored: bool,
}

impl TargetArtifactState {
    fn new() -> Self {
        Self { artifacts: HashMap::new(), total_bytes: 0, dir_ready: false, index_writer: None, index_errored: false }
    }
}

struct ArtifactStoreState {
    targets: HashMap<TargetId, TargetArtifactState>,
    global_index: HashMap<ArtifactId, TargetId>,
}

pub struct ArtifactStore {
    paths: DataPaths,
    budget_bytes: u64,
    inline_threshold_bytes: u64,
    state: Mutex<ArtifactStoreState>,
}

impl ArtifactStore {
    pub fn new(paths: DataPaths, budget_bytes: u64) -> Self {
        Self::with_inline_threshold(paths, budget_bytes, INLINE_THRESHOLD_BYTES)
    }

    pub fn with_inline_threshold(paths: DataPaths, budget_bytes: u64, inline_threshold_bytes: u64) -> Self {
        Self {
            paths,
            budget_bytes,
            inline_threshold_bytes,
            state: Mutex::new(ArtifactStoreState { targets: HashMap::new(), global_index: HashMap::new() }),
        }
    }

    /// `artifacts.get`'s (§6) inline-payload threshold, as configured
    /// (`kahlo.toml`'s `[limits] artifact_inline_threshold_bytes`, §4.3
    /// default 32 KiB).
    pub fn inline_threshold_bytes(&self) -> u64 {
        self.inline_threshold_bytes
    }

    /// Ensure target state exists: create `artifacts/` directory, open the
    /// index writer, and clean orphan `*.tmp` files. Runs once per target
    /// (§4.3 step 4).
    fn ensure_target<'s>(
        &self,
        state: &'s mut ArtifactStoreState,
        target_id: TargetId,
        ts: DateTime<Utc>,
    ) -> &'s mut TargetArtifactState {
        let entry = state.targets.entry(target_id).or_insert_with(TargetArtifactState::new);
        if !entry.dir_ready {
            let dir = self.paths.artifacts_dir(ts, &target_id);
            if fs::create_dir_all(&dir).is_ok() {
                if let Ok(read_dir) = fs::read_dir(&dir) {
                    for file in read_dir.flatten() {
                        let path = file.path();
                        if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                            let _ = fs::remove_file(&path);
                        }
                    }
                }
            }
            entry.dir_ready = true;
        }
        if entry.index_writer.is_none() && !entry.index_errored {
            let path = self.paths.artifacts_jsonl(ts, &target_id);
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(f) => entry.index_writer = Some(f),
                Err(_) => entry.index_errored = true,
            }
        }
        entry
    }

    pub fn store_artifact(&self, req: StoreArtifactRequest) -> Result<Artifact, ArtifactStoreError> {
        // 1. type allowed.
        let artifact_type = ArtifactType::parse(&req.artifact_type)
            .ok_or_else(|| ArtifactStoreError::InvalidType(req.artifact_type.clone()))?;
        // 2. normalize + reject empty-but-nonzero payload.
        if req.size_bytes > 0 && req.data.is_empty() {
            return Err(ArtifactStoreError::EmptyPayload);
        }
        // 3. actualSize == size_bytes.
        let actual = req.data.len() as u64;
        if actual != req.size_bytes {
            return Err(ArtifactStoreError::SizeMismatch { expected: req.size_bytes, actual });
        }

        let mut state = self.state.lock();
        self.ensure_target(&mut state, req.target_id, req.ts);

        {
            let target_state = state
                .targets
                .get(&req.target_id)
                .ok_or_else(|| ArtifactStoreError::Io("target state missing after ensure".to_string()))?;
            // 5. budget.
            if target_state.total_bytes + actual > self.budget_bytes {
                return Err(ArtifactStoreError::BudgetExceeded(req.target_id));
            }
            // 6. duplicate id, either scope.
            if target_state.artifacts.contains_key(&req.artifact_id) || state.global_index.contains_key(&req.artifact_id)
            {
                return Err(ArtifactStoreError::DuplicateId(req.artifact_id));
            }
        }

        // 7. sha256.
        let mut hasher = Sha256::new();
        hasher.update(&req.data);
        let sha256 = hex_encode(&hasher.finalize());

        // 8. sanitize name, derive extension.
        let sanitized_name = req.name.as_deref().and_then(sanitize_name);
        let ext = derive_extension(sanitized_name.as_deref(), req.mime.as_deref());
        let artifacts_dir = self.paths.artifacts_dir(req.ts, &req.target_id);
        let tmp_path = artifacts_dir.join(format!("{}{ext}.tmp", req.artifact_id));
        let final_path = artifacts_dir.join(format!("{}{ext}", req.artifact_id));

        // 9. write blob to tmp.
        fs::write(&tmp_path, &req.data).map_err(|e| ArtifactStoreError::Io(e.to_string()))?;

        // 10. build record, insert, bump totals, append index line.
        let artifact = Artifact {
            artifact_id: req.artifact_id,
            target_id: req.target_id,
            job_id: req.job_id,
            ts: req.ts,
            artifact_type,
            size_bytes: req.size_bytes,
            stored_size_bytes: actual,
            sha256,
            mime: req.mime,
            name: sanitized_name,
            metadata: req.metadata,
            storage_ref: final_path.clone(),
        };

        let target_state = match state.targets.get_mut(&req.target_id) {
            Some(s) => s,
            None => return Err(ArtifactStoreError::Io("target state missing after ensure".to_string())),
        };
        target_state.artifacts.insert(req.artifact_id, artifact.clone());
        target_state.total_bytes += actual;
        state.global_index.insert(req.artifact_id, req.target_id);

        if let Some(target_state) = state.targets.get_mut(&req.target_id) {
            if !target_state.index_errored {
                if let Some(writer) = target_state.index_writer.as_mut() {
                    let line = serde_json::to_string(&artifact).unwrap_or_default();
                    if writeln!(writer, "{line}").is_err() {
                        target_state.index_errored = true;
                    }
                }
            }
        }

        // 11. atomic rename.
        match fs::rename(&tmp_path, &final_path) {
            Ok(()) => Ok(artifact),
            Err(_) if tmp_path.exists() => {
                // Leave in-memory state as-is but point storage_ref at the
                // tmp path; caller surfaces this as a warning, not an error.
                let mut warned = artifact;
                warned.storage_ref = tmp_path;
                if let Some(target_state) = state.targets.get_mut(&req.target_id) {
                    if let Some(stored) = target_state.artifacts.get_mut(&req.artifact_id) {
                        stored.storage_ref = warned.storage_ref.clone();
                    }
                }
                Ok(warned)
            }
            Err(e) => {
                // Roll back in-memory state entirely.
                if let Some(target_state) = state.targets.get_mut(&req.target_id) {
                    target_state.artifacts.remove(&req.artifact_id);
                    target_state.total_bytes = target_state.total_bytes.saturating_sub(actual);
                }
                state.global_index.remove(&req.artifact_id);
                Err(ArtifactStoreError::Io(e.to_string()))
            }
        }
    }

    pub fn read_payload(&self, artifact_id: &ArtifactId) -> Result<Vec<u8>, ArtifactStoreError> {
        let storage_ref = {
            let state = self.state.lock();
            let target_id = state
                .global_index
                .get(artifact_id)
                .ok_or_else(|| ArtifactStoreError::NotFound(*artifact_id))?;
            state
                .targets
                .get(target_id)
                .and_then(|t| t.artifacts.get(artifact_id))
                .map(|a| a.storage_ref.clone())
                .ok_or_else(|| ArtifactStoreError::NotFound(*artifact_id))?
        };
        fs::read(&storage_ref).map_err(|e| ArtifactStoreError::Io(e.to_string()))
    }

    pub fn get_artifact(&self, artifact_id: &ArtifactId) -> Option<Artifact> {
        let state = self.state.lock();
        let target_id = state.global_index.get(artifact_id)?;
        state.targets.get(target_id)?.artifacts.get(artifact_id).cloned()
    }

    pub fn list_by_target(&self, target_id: &TargetId) -> Vec<Artifact> {
        let state = self.state.lock();
        state.targets.get(target_id).map(|t| t.artifacts.values().cloned().collect()).unwrap_or_default()
    }

    pub fn list_by_job(&self, job_id: &JobId) -> Vec<Artifact> {
        let state = self.state.lock();
        state.targets.values().flat_map(|t| t.artifacts.values()).filter(|a| &a.job_id == job_id).cloned().collect()
    }

    pub fn list_all(&self) -> Vec<Artifact> {
        let state = self.state.lock();
        state.targets.values().flat_map(|t| t.artifacts.values()).cloned().collect()
    }

    pub fn target_stats(&self, target_id: &TargetId) -> TargetArtifactStats {
        let state = self.state.lock();
        match state.targets.get(target_id) {
            Some(t) => TargetArtifactStats {
                count: t.artifacts.len() as u64,
                total_bytes: t.total_bytes,
                budget_bytes: self.budget_bytes,
            },
            None => TargetArtifactStats { count: 0, total_bytes: 0, budget_bytes: self.budget_bytes },
        }
    }

    /// `closeTargetArtifactStore`: ends the writer if not errored but
    /// retains the in-memory index so post-detach queries stay valid.
    pub fn close_target(&self, target_id: &TargetId) {
        let mut state = self.state.lock();
        if let Some(target_state) = state.targets.get_mut(target_id) {
            if !target_state.index_errored {
                if let Some(writer) = target_state.index_writer.as_mut() {
                    let _ = writer.flush();
                }
            }
            target_state.index_writer = None;
        }
    }
}

fn sanitize_name(name: &str) -> Option<String> {
    let mut cleaned = name.replace("..", "");
    cleaned.retain(|c| !"/\\:*?\"<>|".contains(c));
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() || cleaned.chars().count() > 255 {
        None
    } else {
        Some(cleaned)
    }
}

fn derive_extension(sanitized_name: Option<&str>, mime: Option<&str>) -> String {
    if let Some(name) = sanitized_name {
        if let Some(ext) = Path::new(name).extension().and_then(|e| e.to_str()) {
            if !ext.is_empty() {
                return format!(".{ext}");
            }
        }
    }
    match mime {
        Some("text/plain") => ".txt".to_string(),
        Some("application/json") => ".json".to_string(),
        Some("image/png") => ".png".to_string(),
        Some("application/x-pcap") => ".pcap".to_string(),
        Some("application/octet-stream") | None | Some(_) => ".bin".to_string(),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (ArtifactStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        (ArtifactStore::new(paths, DEFAULT_BUDGET_BYTES), dir)
    }

    fn request(target_id: TargetId, data: Vec<u8>) -> StoreArtifactRequest {
        StoreArtifactRequest {
            target_id,
            artifact_id: ArtifactId::new(),
            job_id: JobId::new(),
            ts: Utc::now(),
            artifact_type: "file_dump".to_string(),
            size_bytes: data.len() as u64,
            mime: Some("application/octet-stream".to_string()),
            name: Some("dump.bin".to_string()),
            metadata: None,
            data,
        }
    }

    #[test]
    fn stores_artifact_and_computes_sha256() {
        let (store, _dir) = store();
        let target = TargetId::new();
        let artifact = store.store_artifact(request(target, vec![1, 2, 3])).unwrap();
        assert_eq!(artifact.sha256.len(), 64);
        assert!(artifact.storage_ref.exists());
        let stats = store.target_stats(&target);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total_bytes, 3);
    }

    #[test]
    fn rejects_invalid_type() {
        let (store, _dir) = store();
        let mut req = request(TargetId::new(), vec![1]);
        req.artifact_type = "bogus".to_string();
        assert!(matches!(store.store_artifact(req), Err(ArtifactStoreError::InvalidType(_))));
    }

    #[test]
    fn rejects_size_mismatch() {
        let (store, _dir) = store();
        let mut req = request(TargetId::new(), vec![1, 2, 3]);
        req.size_bytes = 99;
        assert!(matches!(store.store_artifact(req), Err(ArtifactStoreError::SizeMismatch { .. })));
    }

    #[test]
    fn rejects_duplicate_artifact_id() {
        let (store, _dir) = store();
        let target = TargetId::new();
        let mut req = request(target, vec![1]);
        req.artifact_id = ArtifactId::from_string("art-fixedfixedfixedfi");
        store.store_artifact(req.clone()).unwrap();
        req.data = vec![2];
        assert!(matches!(store.store_artifact(req), Err(ArtifactStoreError::DuplicateId(_))));
    }

    #[test]
    fn rejects_over_budget() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        let store = ArtifactStore::new(paths, 2);
        let err = store.store_artifact(request(TargetId::new(), vec![1, 2, 3])).unwrap_err();
        assert!(matches!(err, ArtifactStoreError::BudgetExceeded(_)));
    }

    #[test]
    fn sanitize_name_strips_traversal_and_separators() {
        assert_eq!(sanitize_name("../../etc/passwd").as_deref(), Some("etcpasswd"));
        assert_eq!(sanitize_name(""), None);
        assert_eq!(sanitize_name(&"a".repeat(256)), None);
    }

    #[test]
    fn extension_falls_back_to_mime_then_bin() {
        assert_eq!(derive_extension(Some("trace.pcap"), None), ".pcap");
        assert_eq!(derive_extension(None, Some("application/json")), ".json");
        assert_eq!(derive_extension(None, None), ".bin");
    }

    #[test]
    fn close_target_keeps_index_queryable() {
        let (store, _dir) = store();
        let target = TargetId::new();
        let artifact = store.store_artifact(request(target, vec![9])).unwrap();
        store.close_target(&target);
        assert!(store.get_artifact(&artifact.artifact_id).is_some());
        assert_eq!(store.list_by_target(&target).len(), 1);
    }
}
