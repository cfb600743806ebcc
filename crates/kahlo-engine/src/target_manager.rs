// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! Target manager (§4.7): attach/spawn, orchestrator injection, per-job
//! script lifecycle, spawn/child gating, and detach. Everything here is
//! generic over [`Clock`] so tests can run with [`kahlo_core::FakeClock`]
//! against the in-memory adapters in `kahlo_adapters::fake`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kahlo_adapters::agent::{ArtifactFields, RpcError};
use kahlo_adapters::{
    AdbError, AgentHandle, ChildAddedEvent, DestroyReason, DetachReason, DeviceBridge, JobScriptHandle,
    OuterEnvelope, ProcessInfo, Session, SessionError, SpawnAddedEvent,
};
use kahlo_core::error::ErrorCategory;
use kahlo_core::{
    AgentState, ArtifactId, Clock, DraftId, ErrorCode, Gating, JobId, JobMetrics, JobType, KeyedLock, Mode,
    ModuleProvenance, ModuleRef, Target, TargetId, TargetState,
};
use kahlo_storage::{ArtifactStore, ArtifactStoreError, DraftError, DraftStore, EventPipeline, Ingested, ModuleStore, ModuleStoreError, StoreArtifactRequest};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;

use crate::spawn_gating::{self, DeviceGatingState};

const DEVICE_TIMEOUT: Duration = Duration::from_secs(10);
const ATTACH_TIMEOUT: Duration = Duration::from_secs(15);
const SPAWN_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PID_CANDIDATES: usize = 20;

/// Source text of the in-process coordinator injected into every target
/// (§4.7 "Orchestrator injection"). Its actual wire protocol is peripheral
/// to this crate (§1); this crate only speaks the RPC shapes in
/// `kahlo_adapters::agent`.
const COORDINATOR_SOURCE: &str = r#"// kahlo coordinator agent (generated at injection time)"#;

#[derive(Debug, Error)]
pub enum TargetManagerError {
    #[error("target {0} not found")]
    TargetNotFound(TargetId),
    #[error("target {0} is not running")]
    TargetNotRunning(TargetId),
    #[error("no process matching {package:?} found on device {device_id:?} (candidates: {candidates:?})")]
    ProcessNotFound { device_id: String, package: String, candidates: Vec<String> },
    #[error("gating={gating} requires a bootstrap module")]
    BootstrapRequired { gating: String },
    #[error("invalid ensure request: {0}")]
    InvalidEnsureRequest(String),
    #[error("inline module source is empty")]
    EmptySource,
    #[error("draft {0} has an empty source")]
    EmptyDraftSource(DraftId),
    #[error("module {0}@{1} has an empty source")]
    EmptyModuleSource(String, semver::Version),
    #[error("job script for job {0} already exists on this target")]
    DuplicateJobScript(JobId),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0} timed out")]
    Timeout(String),
    #[error(transparent)]
    Device(#[from] AdbError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Draft(#[from] DraftError),
    #[error(transparent)]
    Module(#[from] ModuleStoreError),
}

impl ErrorCategory for TargetManagerError {
    fn code(&self) -> ErrorCode {
        match self {
            TargetManagerError::TargetNotFound(_) | TargetManagerError::ProcessNotFound { .. } => ErrorCode::NotFound,
            TargetManagerError::TargetNotRunning(_) | TargetManagerError::Unavailable(_) => ErrorCode::Unavailable,
            TargetManagerError::BootstrapRequired { .. }
            | TargetManagerError::InvalidEnsureRequest(_)
            | TargetManagerError::EmptySource
            | TargetManagerError::EmptyDraftSource(_)
            | TargetManagerError::EmptyModuleSource(_, _)
            | TargetManagerError::DuplicateJobScript(_) => ErrorCode::InvalidArgument,
            TargetManagerError::Timeout(_) => ErrorCode::Timeout,
            TargetManagerError::Device(e) => e.code(),
            TargetManagerError::Session(e) => e.code(),
            TargetManagerError::Rpc(e) => e.code(),
            TargetManagerError::Draft(e) => e.code(),
            TargetManagerError::Module(e) => e.code(),
        }
    }
}

/// Where a job's (or bootstrap's) module source comes from, resolved
/// synchronously before any process state changes (§4.7 "Bootstrap
/// resolution").
#[derive(Debug, Clone)]
pub enum ModuleSource {
    Source(String),
    Draft(DraftId),
    Module(ModuleRef),
}

#[derive(Debug, Clone)]
pub struct BootstrapSpec {
    pub module: ModuleSource,
    pub job_type: JobType,
    pub params: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct EnsureTargetRequest {
    pub device_id: String,
    pub package: String,
    pub mode: Mode,
    pub gating: Gating,
    /// Required when `gating` is `Spawn` or `Child`: the job started on the
    /// process while it is suspended, before it is resumed.
    pub bootstrap: Option<BootstrapSpec>,
    /// Only meaningful when `gating == Child`: the bootstrap run on each
    /// adopted child before it is resumed.
    pub child_bootstrap: Option<BootstrapSpec>,
}

/// The job-lifecycle side of the circular target-manager/job-controller
/// relationship (§4.6, §4.7), wired in after construction via
/// [`TargetManager::set_job_coordinator`] to avoid a generic cycle between
/// the two structs.
#[async_trait]
pub trait JobCoordinator: Send + Sync {
    async fn start_bootstrap(
        &self,
        target_id: TargetId,
        job_type: JobType,
        module: ModuleSource,
        params: Option<Value>,
    ) -> Result<JobId, TargetManagerError>;

    async fn handle_script_destroyed(&self, job_id: JobId, reason: String);

    fn adopt_metrics(&self, job_id: JobId, metrics: JobMetrics);

    fn record_heartbeat(&self, job_id: JobId, now: DateTime<Utc>);
}

struct DeviceGating {
    core: DeviceGatingState,
    child_bootstrap: HashMap<TargetId, BootstrapSpec>,
}

pub struct TargetManager<C: Clock> {
    device: Arc<dyn DeviceBridge>,
    clock: C,
    event_pipeline: Arc<EventPipeline>,
    artifact_store: Arc<ArtifactStore>,
    draft_store: Arc<DraftStore>,
    module_store: Arc<ModuleStore>,
    job_coordinator: Mutex<Option<Arc<dyn JobCoordinator>>>,
    targets: Mutex<HashMap<TargetId, Target>>,
    sessions: Mutex<HashMap<TargetId, Arc<dyn Session>>>,
    orchestrators: Mutex<HashMap<TargetId, Arc<AgentHandle>>>,
    job_scripts: Mutex<HashMap<TargetId, HashMap<JobId, Arc<JobScriptHandle>>>>,
    device_gating: Mutex<HashMap<String, DeviceGating>>,
    ensure_lock: KeyedLock,
    target_lock: KeyedLock,
}

impl<C: Clock + 'static> TargetManager<C> {
    pub fn new(
        device: Arc<dyn DeviceBridge>,
        clock: C,
        event_pipeline: Arc<EventPipeline>,
        artifact_store: Arc<ArtifactStore>,
        draft_store: Arc<DraftStore>,
        module_store: Arc<ModuleStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            clock,
            event_pipeline,
            artifact_store,
            draft_store,
            module_store,
            job_coordinator: Mutex::new(None),
            targets: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            orchestrators: Mutex::new(HashMap::new()),
            job_scripts: Mutex::new(HashMap::new()),
            device_gating: Mutex::new(HashMap::new()),
            ensure_lock: KeyedLock::new(),
            target_lock: KeyedLock::new(),
        })
    }

    pub fn set_job_coordinator(&self, coordinator: Arc<dyn JobCoordinator>) {
        *self.job_coordinator.lock() = Some(coordinator);
    }

    /// §4.7 `ensureTarget`: idempotent under `"ensure:<device_id>:<package>"`.
    /// A running target matching `mode`/`gating` short-circuits attach/spawn.
    pub async fn ensure_target(self: &Arc<Self>, req: EnsureTargetRequest) -> Result<TargetId, TargetManagerError> {
        if req.mode == Mode::Attach && req.gating != Gating::None {
            return Err(TargetManagerError::InvalidEnsureRequest("attach mode requires gating=none".into()));
        }
        if matches!(req.gating, Gating::Spawn | Gating::Child) && req.bootstrap.is_none() {
            return Err(TargetManagerError::BootstrapRequired { gating: req.gating.to_string() });
        }

        let key = format!("ensure:{}:{}", req.device_id, req.package);
        let this = Arc::clone(self);
        self.ensure_lock.with_lock(key, move || this.ensure_target_inner(req)).await
    }

    async fn ensure_target_inner(self: Arc<Self>, req: EnsureTargetRequest) -> Result<TargetId, TargetManagerError> {
        if let Some(existing) = self.find_matching_running(&req.device_id, &req.package, req.mode, req.gating) {
            return Ok(existing);
        }
        match req.mode {
            Mode::Attach => self.attach_flow(req).await,
            Mode::Spawn => self.spawn_flow(req).await,
        }
    }

    fn find_matching_running(&self, device_id: &str, package: &str, mode: Mode, gating: Gating) -> Option<TargetId> {
        self.targets
            .lock()
            .values()
            .find(|t| t.matches_ensure(device_id, package, mode, gating))
            .map(|t| t.target_id)
    }

    /// §4.7 "Attach path".
    async fn attach_flow(self: Arc<Self>, req: EnsureTargetRequest) -> Result<TargetId, TargetManagerError> {
        let now = self.clock.now_utc();
        let processes = timeout(DEVICE_TIMEOUT, self.device.list_processes(&req.device_id))
            .await
            .map_err(|_| TargetManagerError::Timeout("list_processes".into()))??;
        let pid = resolve_pid(&req.device_id, &req.package, &processes)?;

        let session: Arc<dyn Session> = match timeout(ATTACH_TIMEOUT, self.device.attach(&req.device_id, pid)).await {
            Ok(Ok(s)) => Arc::from(s),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TargetManagerError::Timeout("attach".into())),
        };

        let target_id = TargetId::new();
        let mut target = Target::new(target_id, req.device_id.clone(), req.package.clone(), Mode::Attach, Gating::None, now);
        target.pid = Some(pid);
        target.state = TargetState::Running;

        self.register_session_detached_handler(target_id, &session);
        self.sessions.lock().insert(target_id, session);
        self.targets.lock().insert(target_id, target);

        if self.inject_orchestrator(target_id).await.is_err() {
            self.purge_target(target_id).await;
            return Err(TargetManagerError::Unavailable("orchestrator injection failed after attach".into()));
        }

        Ok(target_id)
    }

    /// §4.7 "Spawn path": preflight-resolve the bootstrap source before
    /// spawning, so a missing draft/module never leaves an orphan process.
    async fn spawn_flow(self: Arc<Self>, req: EnsureTargetRequest) -> Result<TargetId, TargetManagerError> {
        let now = self.clock.now_utc();

        if matches!(req.gating, Gating::Spawn | Gating::Child) {
            let bootstrap = req.bootstrap.as_ref().expect("checked in ensure_target");
            self.resolve_module_source(&bootstrap.module)?;
        }

        let pid = timeout(SPAWN_TIMEOUT, self.device.spawn(&req.device_id, &req.package))
            .await
            .map_err(|_| TargetManagerError::Timeout("spawn".into()))??;

        let session: Arc<dyn Session> = match timeout(ATTACH_TIMEOUT, self.device.attach(&req.device_id, pid)).await {
            Ok(Ok(s)) => Arc::from(s),
            Ok(Err(e)) => {
                let _ = self.device.kill(&req.device_id, pid).await;
                return Err(e.into());
            }
            Err(_) => {
                let _ = self.device.kill(&req.device_id, pid).await;
                return Err(TargetManagerError::Timeout("attach".into()));
            }
        };

        let target_id = TargetId::new();
        let mut target = Target::new(target_id, req.device_id.clone(), req.package.clone(), Mode::Spawn, req.gating, now);
        target.pid = Some(pid);
        target.state = TargetState::Running;

        self.register_session_detached_handler(target_id, &session);
        self.sessions.lock().insert(target_id, session);
        self.targets.lock().insert(target_id, target);

        if self.inject_orchestrator(target_id).await.is_err() {
            let _ = self.device.kill(&req.device_id, pid).await;
            self.purge_target(target_id).await;
            return Err(TargetManagerError::Unavailable("orchestrator injection failed after spawn".into()));
        }
        if self.targets.lock().get(&target_id).map(|t| t.agent_state == AgentState::Crashed).unwrap_or(false) {
            let _ = self.device.kill(&req.device_id, pid).await;
            self.purge_target(target_id).await;
            return Err(TargetManagerError::Unavailable("agent crashed immediately after spawn injection".into()));
        }

        match req.gating {
            Gating::None => {
                if let Err(e) = self.device.resume(&req.device_id, pid).await {
                    self.record_resume_error(target_id, e.to_string());
                }
            }
            Gating::Spawn => {
                let bootstrap = req.bootstrap.expect("checked in ensure_target");
                if let Err(e) = self.run_bootstrap_then_resume(&req.device_id, pid, target_id, bootstrap).await {
                    let _ = self.device.kill(&req.device_id, pid).await;
                    self.purge_target(target_id).await;
                    return Err(e);
                }
            }
            Gating::Child => {
                self.clone()
                    .enable_child_gating(req.device_id.clone(), target_id, req.package.clone(), req.child_bootstrap)
                    .await?;
                let bootstrap = req.bootstrap.expect("checked in ensure_target");
                if let Err(e) = self.run_bootstrap_then_resume(&req.device_id, pid, target_id, bootstrap).await {
                    self.clone().release_child_gating(req.device_id.clone(), target_id).await;
                    let _ = self.device.kill(&req.device_id, pid).await;
                    self.purge_target(target_id).await;
                    return Err(e);
                }
            }
        }

        Ok(target_id)
    }

    async fn run_bootstrap_then_resume(
        &self,
        device_id: &str,
        pid: u32,
        target_id: TargetId,
        bootstrap: BootstrapSpec,
    ) -> Result<(), TargetManagerError> {
        let coordinator = self
            .job_coordinator
            .lock()
            .clone()
            .ok_or_else(|| TargetManagerError::Unavailable("job coordinator not wired".into()))?;
        coordinator.start_bootstrap(target_id, bootstrap.job_type, bootstrap.module, bootstrap.params).await?;
        self.device.resume(device_id, pid).await?;
        Ok(())
    }

    fn record_resume_error(&self, target_id: TargetId, error: String) {
        let mut targets = self.targets.lock();
        if let Some(t) = targets.get_mut(&target_id) {
            t.resume_error = Some(error);
            t.updated_at = self.clock.now_utc();
        }
    }

    /// Roll back a target that never finished coming up (injection failure,
    /// crashed-on-attach, bootstrap failure): remove its records without the
    /// recursive child-detach that a real `detach` would perform, since a
    /// target in this state cannot yet have adopted children.
    async fn purge_target(&self, target_id: TargetId) {
        self.targets.lock().remove(&target_id);
        if let Some(session) = self.sessions.lock().remove(&target_id) {
            let _ = session.detach().await;
        }
        if let Some(orchestrator) = self.orchestrators.lock().remove(&target_id) {
            let _ = orchestrator.unload().await;
        }
        self.unload_all_job_scripts_locked(target_id).await;
        self.event_pipeline.close_target(&target_id);
        self.artifact_store.close_target(&target_id);
    }

    /// §4.7 "Bootstrap resolution": resolve a `ModuleSource` to source text
    /// and its provenance, synchronously, before any process state changes.
    pub fn resolve_module_source(&self, module: &ModuleSource) -> Result<(String, ModuleProvenance), TargetManagerError> {
        match module {
            ModuleSource::Source(s) => {
                if s.is_empty() {
                    return Err(TargetManagerError::EmptySource);
                }
                Ok((s.clone(), ModuleProvenance::Source))
            }
            ModuleSource::Draft(draft_id) => {
                let draft = self.draft_store.get(draft_id)?;
                if draft.source.is_empty() {
                    return Err(TargetManagerError::EmptyDraftSource(*draft_id));
                }
                Ok((draft.source, ModuleProvenance::DraftId(draft_id.to_string())))
            }
            ModuleSource::Module(module_ref) => {
                let bundle = self.module_store.get(&module_ref.name, &module_ref.version)?;
                if bundle.source.is_empty() {
                    return Err(TargetManagerError::EmptyModuleSource(module_ref.name.clone(), module_ref.version.clone()));
                }
                Ok((bundle.source, ModuleProvenance::ModuleRef(module_ref.to_string())))
            }
        }
    }

    /// §4.7 "Orchestrator injection": create, wire, load and ping-validate
    /// the coordinator script. Failures are captured on the target record;
    /// the caller decides whether to roll the target back.
    async fn inject_orchestrator(self: &Arc<Self>, target_id: TargetId) -> Result<(), TargetManagerError> {
        let session = self.session_for(target_id)?;
        let script = match session.create_script(COORDINATOR_SOURCE).await {
            Ok(s) => s,
            Err(e) => {
                self.set_agent_error(target_id, e.to_string());
                return Err(e.into());
            }
        };
        let handle = AgentHandle::new(script);

        let this = Arc::clone(self);
        handle.on_destroyed(Arc::new(move |reason: DestroyReason| {
            this.mark_agent_crashed_if_running(target_id, reason.reason.clone());
        }));
        let this = Arc::clone(self);
        handle.on_message(Arc::new(move |payload: Value, data: Option<Vec<u8>>| {
            this.handle_agent_message(target_id, payload, data);
        }));

        if let Err(e) = handle.load().await {
            self.set_agent_error(target_id, e.to_string());
            return Err(e.into());
        }

        match handle.ping().await {
            Ok(()) => {
                self.orchestrators.lock().insert(target_id, Arc::new(handle));
                self.set_agent_state(target_id, AgentState::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_agent_error(target_id, e.to_string());
                self.set_agent_state(target_id, AgentState::Crashed);
                Err(e.into())
            }
        }
    }

    fn session_for(&self, target_id: TargetId) -> Result<Arc<dyn Session>, TargetManagerError> {
        self.sessions.lock().get(&target_id).cloned().ok_or(TargetManagerError::TargetNotFound(target_id))
    }

    fn set_agent_state(&self, target_id: TargetId, state: AgentState) {
        let now = self.clock.now_utc();
        if let Some(t) = self.targets.lock().get_mut(&target_id) {
            t.agent_state = state;
            t.updated_at = now;
        }
    }

    fn set_agent_error(&self, target_id: TargetId, error: String) {
        let now = self.clock.now_utc();
        if let Some(t) = self.targets.lock().get_mut(&target_id) {
            t.agent_error = Some(error);
            t.updated_at = now;
        }
    }

    fn mark_agent_crashed_if_running(&self, target_id: TargetId, reason: String) {
        let now = self.clock.now_utc();
        let mut targets = self.targets.lock();
        let Some(t) = targets.get_mut(&target_id) else { return };
        if t.state == TargetState::Running {
            t.agent_state = AgentState::Crashed;
            t.agent_error = Some(reason);
            t.updated_at = now;
        }
    }

    fn register_session_detached_handler(self: &Arc<Self>, target_id: TargetId, session: &Arc<dyn Session>) {
        let this = Arc::clone(self);
        session.on_detached(Arc::new(move |reason: DetachReason| {
            this.handle_session_detached(target_id, reason.clone());
        }));
    }

    /// §4.7 "Session-detached handler".
    fn handle_session_detached(&self, target_id: TargetId, reason: DetachReason) {
        let now = self.clock.now_utc();
        let already_detached = {
            let mut targets = self.targets.lock();
            let Some(t) = targets.get_mut(&target_id) else { return };
            if t.state == TargetState::Detached {
                true
            } else {
                t.state = TargetState::Dead;
                if t.agent_state == AgentState::Ready {
                    t.agent_state = AgentState::Crashed;
                }
                t.last_detach = Some(kahlo_core::LastDetach { reason: reason.reason.clone(), crash: reason.crash });
                t.updated_at = now;
                false
            }
        };
        if !already_detached {
            self.emit_synthetic_event(
                target_id,
                JobId::from_string(""),
                "target.died",
                serde_json::json!({ "reason": reason.reason, "crash": reason.crash }),
                now,
            );
        }
    }

    /// Host-synthesized events (`target.died`, `job.crashed`, ...) flow
    /// through the same ingestion gate as real agent messages (§9).
    pub fn emit_synthetic_event(&self, target_id: TargetId, job_id: JobId, kind: &str, payload: Value, ts: DateTime<Utc>) {
        let body = serde_json::json!({
            "type": "event",
            "v": 1,
            "ts": ts.to_rfc3339(),
            "job_id": job_id.as_str(),
            "kind": kind,
            "level": "info",
            "payload": payload,
            "correlation_id": Value::Null,
        });
        let raw = OuterEnvelope::wrap(body);
        let pid = self.targets.lock().get(&target_id).and_then(|t| t.pid);
        let _ = self.event_pipeline.ingest(target_id, pid, &raw, None);
    }

    /// §4.2 `recordAgentMessage`: ingest an inbound agent message, route it
    /// to the event/artifact/heartbeat pipeline, and independently check
    /// for a final-metrics payload (`Ingested::Event` carries no data, so
    /// that check re-parses the raw envelope itself).
    fn handle_agent_message(&self, target_id: TargetId, raw: Value, data: Option<Vec<u8>>) {
        self.check_final_metrics(&raw);
        let pid = self.targets.lock().get(&target_id).and_then(|t| t.pid);
        match self.event_pipeline.ingest(target_id, pid, &raw, data) {
            Ingested::Ignored | Ingested::Event => {}
            Ingested::Heartbeat(body) => {
                let job_id = JobId::from_string(&body.job_id);
                if let Some(coordinator) = self.job_coordinator.lock().clone() {
                    let ts = body.ts.parse().unwrap_or_else(|_| self.clock.now_utc());
                    coordinator.record_heartbeat(job_id, ts);
                }
            }
            Ingested::Artifact(fields, data, ts) => {
                self.store_artifact_from_message(target_id, fields, data, ts);
            }
        }
    }

    fn check_final_metrics(&self, raw: &Value) {
        let Some(inner) = OuterEnvelope::parse(raw) else { return };
        if inner.get("type").and_then(Value::as_str) != Some("event") {
            return;
        }
        let kind = inner.get("kind").and_then(Value::as_str).unwrap_or_default();
        if kind != "job.completed" && kind != "job.failed" {
            return;
        }
        let Some(job_id_str) = inner.get("job_id").and_then(Value::as_str) else { return };
        let Some(metrics_value) = inner.get("payload").and_then(|p| p.get("metrics")) else { return };
        let Ok(metrics) = serde_json::from_value::<JobMetrics>(metrics_value.clone()) else { return };
        if let Some(coordinator) = self.job_coordinator.lock().clone() {
            coordinator.adopt_metrics(JobId::from_string(job_id_str), metrics);
        }
    }

    fn store_artifact_from_message(&self, target_id: TargetId, fields: ArtifactFields, data: Option<Vec<u8>>, ts: DateTime<Utc>) {
        let artifact_id = ArtifactId::from_string(&fields.artifact_id);
        let job_id = JobId::from_string(&fields.job_id);
        let req = StoreArtifactRequest {
            target_id,
            artifact_id,
            job_id,
            ts,
            artifact_type: fields.artifact_type.clone(),
            size_bytes: fields.size_bytes,
            mime: fields.mime.clone(),
            name: fields.name.clone(),
            metadata: fields.metadata.clone(),
            data: data.unwrap_or_default(),
        };
        let (kind, payload) = match self.artifact_store.store_artifact(req) {
            Ok(artifact) => (
                "artifact.stored",
                serde_json::json!({ "artifact_id": artifact.artifact_id.as_str(), "sha256": artifact.sha256 }),
            ),
            Err(e) => {
                let kind = match &e {
                    ArtifactStoreError::InvalidType(_) | ArtifactStoreError::EmptyPayload | ArtifactStoreError::SizeMismatch { .. } => {
                        "artifact.invalid"
                    }
                    _ => "artifact.store_failed",
                };
                (kind, serde_json::json!({ "artifact_id": fields.artifact_id, "error": e.to_string() }))
            }
        };
        self.emit_synthetic_event(target_id, job_id, kind, payload, ts);
    }

    /// §4.7 "Per-job scripts": serialized under the target lock, rejects a
    /// duplicate `job_id` and a target that isn't running.
    pub async fn create_job_script(self: &Arc<Self>, target_id: TargetId, job_id: JobId, source: &str) -> Result<(), TargetManagerError> {
        let source = source.to_string();
        let this = Arc::clone(self);
        self.target_lock
            .with_lock(target_id.to_string(), move || this.create_job_script_inner(target_id, job_id, source))
            .await
    }

    async fn create_job_script_inner(self: Arc<Self>, target_id: TargetId, job_id: JobId, source: String) -> Result<(), TargetManagerError> {
        {
            let targets = self.targets.lock();
            let target = targets.get(&target_id).ok_or(TargetManagerError::TargetNotFound(target_id))?;
            if target.state != TargetState::Running {
                return Err(TargetManagerError::TargetNotRunning(target_id));
            }
        }
        if self.job_scripts.lock().get(&target_id).map(|m| m.contains_key(&job_id)).unwrap_or(false) {
            return Err(TargetManagerError::DuplicateJobScript(job_id));
        }

        let session = self.session_for(target_id)?;
        let script = session.create_script(&source).await?;
        let handle = JobScriptHandle::new(script);
        handle.load().await?;

        let this = Arc::clone(&self);
        handle.on_destroyed(Arc::new(move |reason: DestroyReason| {
            let this = Arc::clone(&this);
            tokio::spawn(async move {
                this.handle_job_script_destroyed(target_id, job_id, reason.reason).await;
            });
        }));
        let this = Arc::clone(&self);
        handle.on_message(Arc::new(move |payload: Value, data: Option<Vec<u8>>| {
            this.handle_agent_message(target_id, payload, data);
        }));

        self.job_scripts.lock().entry(target_id).or_default().insert(job_id, Arc::new(handle));
        Ok(())
    }

    async fn handle_job_script_destroyed(self: Arc<Self>, target_id: TargetId, job_id: JobId, reason: String) {
        if let Some(scripts) = self.job_scripts.lock().get_mut(&target_id) {
            scripts.remove(&job_id);
        }
        let coordinator = self.job_coordinator.lock().clone();
        if let Some(coordinator) = coordinator {
            coordinator.handle_script_destroyed(job_id, reason).await;
        }
    }

    pub fn job_script(&self, target_id: TargetId, job_id: JobId) -> Option<Arc<JobScriptHandle>> {
        self.job_scripts.lock().get(&target_id)?.get(&job_id).cloned()
    }

    /// §4.7 `unloadJobScript`: idempotent, silent no-op on a missing target
    /// or script.
    pub async fn unload_job_script(&self, target_id: TargetId, job_id: JobId) {
        let handle = self.job_scripts.lock().get_mut(&target_id).and_then(|m| m.remove(&job_id));
        if let Some(handle) = handle {
            if let Err(e) = handle.unload().await {
                tracing::warn!(%target_id, %job_id, error = %e, "job script unload failed");
            }
        }
    }

    /// Lockless form used while the caller already holds the target lock
    /// (§4.7 `unloadAllJobScripts`, used by detach). Notifies the job
    /// coordinator of each script's destruction, since an explicit unload
    /// doesn't itself fire a script's destroyed signal.
    async fn unload_all_job_scripts_locked(&self, target_id: TargetId) {
        let handles: Vec<(JobId, Arc<JobScriptHandle>)> = {
            let mut scripts = self.job_scripts.lock();
            scripts.remove(&target_id).map(|m| m.into_iter().collect()).unwrap_or_default()
        };
        let coordinator = self.job_coordinator.lock().clone();
        for (job_id, handle) in handles {
            if let Err(e) = handle.unload().await {
                tracing::warn!(%job_id, error = %e, "job script unload failed during detach");
            }
            if let Some(coordinator) = &coordinator {
                coordinator.handle_script_destroyed(job_id, "target detached".to_string()).await;
            }
        }
    }

    /// §4.7 "Detach": idempotent, then recursively detaches children after
    /// releasing the parent's lock (§5, §9 lock ordering).
    pub fn detach(self: &Arc<Self>, target_id: TargetId) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), TargetManagerError>> + Send + '_>> {
        Box::pin(async move {
            let this = Arc::clone(self);
            let (was_already_detached, children) =
                self.target_lock.with_lock(target_id.to_string(), move || this.detach_inner(target_id)).await?;
            if !was_already_detached {
                for child in children {
                    self.detach(child).await?;
                }
            }
            Ok(())
        })
    }

    async fn detach_inner(self: Arc<Self>, target_id: TargetId) -> Result<(bool, Vec<TargetId>), TargetManagerError> {
        let already_detached = {
            let targets = self.targets.lock();
            let target = targets.get(&target_id).ok_or(TargetManagerError::TargetNotFound(target_id))?;
            target.state == TargetState::Detached
        };
        if already_detached {
            return Ok((true, Vec::new()));
        }

        let now = self.clock.now_utc();
        {
            let mut targets = self.targets.lock();
            if let Some(t) = targets.get_mut(&target_id) {
                t.state = TargetState::Detached;
                t.updated_at = now;
            }
        }

        self.unload_all_job_scripts_locked(target_id).await;

        if let Some(orchestrator) = self.orchestrators.lock().remove(&target_id) {
            let _ = orchestrator.unload().await;
        }

        let session = self.sessions.lock().remove(&target_id);
        if let Some(session) = session {
            if !session.is_detached() {
                let _ = session.detach().await;
            }
        }

        self.event_pipeline.close_target(&target_id);
        self.artifact_store.close_target(&target_id);

        let (gating, device_id) = {
            let targets = self.targets.lock();
            let t = targets.get(&target_id);
            (t.map(|t| t.gating).unwrap_or(Gating::None), t.map(|t| t.device_id.clone()).unwrap_or_default())
        };
        if gating == Gating::Child {
            self.clone().release_child_gating(device_id, target_id).await;
        }

        let children: Vec<TargetId> = {
            let targets = self.targets.lock();
            targets.values().filter(|t| t.parent_target_id == Some(target_id)).map(|t| t.target_id).collect()
        };

        Ok((false, children))
    }

    /// §4.7 "Spawn/child gating": register as a ref-counted gating parent
    /// for this device, enabling device-wide gating and the two signal
    /// handlers on the first caller. Must run *before* bootstrap starts so
    /// children spawned during bootstrap aren't missed (§9).
    ///
    /// Callers hold the target lock for the target they're gating (§5, §9
    /// lock ordering); this mutates `device_gating` synchronously under its
    /// own short-lived `parking_lot::Mutex` rather than a second keyed lock
    /// domain, so no lock is ever held across the `await`s below.
    async fn enable_child_gating(
        self: Arc<Self>,
        device_id: String,
        target_id: TargetId,
        package: String,
        child_bootstrap: Option<BootstrapSpec>,
    ) -> Result<(), TargetManagerError> {
        let needs_enable = {
            let mut gating = self.device_gating.lock();
            let entry = gating
                .entry(device_id.clone())
                .or_insert_with(|| DeviceGating { core: DeviceGatingState::default(), child_bootstrap: HashMap::new() });
            entry.core.parents.insert(target_id, package.clone());
            if let Some(spec) = child_bootstrap {
                entry.child_bootstrap.insert(target_id, spec);
            }
            entry.core.ref_count += 1;
            entry.core.ref_count == 1
        };
        if needs_enable {
            self.device.enable_spawn_gating(&device_id).await?;
            let spawn_this = Arc::clone(&self);
            let spawn_dev = device_id.clone();
            self.device.on_spawn_added(
                &device_id,
                Some(Arc::new(move |evt: SpawnAddedEvent| {
                    let this = Arc::clone(&spawn_this);
                    let dev = spawn_dev.clone();
                    tokio::spawn(async move { this.handle_spawn_added(dev, evt).await });
                })),
            );
            let child_this = Arc::clone(&self);
            let child_dev = device_id.clone();
            self.device.on_child_added(
                &device_id,
                Some(Arc::new(move |evt: ChildAddedEvent| {
                    let this = Arc::clone(&child_this);
                    let dev = child_dev.clone();
                    tokio::spawn(async move { this.handle_child_added(dev, evt).await });
                })),
            );
        }
        Ok(())
    }

    /// Best-effort; decrements the ref count and disables device-wide
    /// gating when it reaches zero. Same lock-ordering note as
    /// `enable_child_gating`: no separate lock domain, nothing held across
    /// an `await`.
    async fn release_child_gating(self: Arc<Self>, device_id: String, target_id: TargetId) {
        let needs_disable = {
            let mut gating = self.device_gating.lock();
            match gating.get_mut(&device_id) {
                Some(entry) => {
                    entry.core.parents.remove(&target_id);
                    entry.child_bootstrap.remove(&target_id);
                    entry.core.ref_count = entry.core.ref_count.saturating_sub(1);
                    let zero = entry.core.ref_count == 0;
                    if zero {
                        gating.remove(&device_id);
                    }
                    zero
                }
                None => false,
            }
        };
        if needs_disable {
            self.device.on_spawn_added(&device_id, None);
            self.device.on_child_added(&device_id, None);
            let _ = self.device.disable_spawn_gating(&device_id).await;
        }
    }

    async fn handle_spawn_added(self: Arc<Self>, device_id: String, evt: SpawnAddedEvent) {
        let matched = {
            let gating = self.device_gating.lock();
            gating.get(&device_id).and_then(|g| spawn_gating::match_parent(&g.core.parents, &evt.identifier))
        };
        match matched {
            Some(parent_target_id) => self.adopt_child(device_id, parent_target_id, evt.pid).await,
            None => {
                if let Err(e) = self.device.resume(&device_id, evt.pid).await {
                    tracing::warn!(pid = evt.pid, error = %e, "failed to resume unmatched gated spawn");
                }
            }
        }
    }

    async fn handle_child_added(self: Arc<Self>, device_id: String, evt: ChildAddedEvent) {
        let matched = {
            let gating = self.device_gating.lock();
            gating.get(&device_id).and_then(|g| spawn_gating::match_parent(&g.core.parents, &evt.identifier))
        };
        match matched {
            Some(parent_target_id) => self.adopt_child(device_id, parent_target_id, evt.pid).await,
            None => {
                if let Err(e) = self.device.resume(&device_id, evt.pid).await {
                    tracing::warn!(pid = evt.pid, error = %e, "failed to resume unmatched gated child");
                }
            }
        }
    }

    /// §4.7 "no-match→resume orphan immediately" / "match→adopt child if
    /// parent running". A matched child whose parent is no longer running
    /// is resumed as an orphan rather than adopted.
    async fn adopt_child(self: Arc<Self>, device_id: String, parent_target_id: TargetId, pid: u32) {
        let parent = {
            let targets = self.targets.lock();
            targets.get(&parent_target_id).filter(|t| t.state == TargetState::Running).map(|t| t.package.clone())
        };
        let Some(parent_package) = parent else {
            let _ = self.device.resume(&device_id, pid).await;
            return;
        };

        let session: Arc<dyn Session> = match timeout(ATTACH_TIMEOUT, self.device.attach(&device_id, pid)).await {
            Ok(Ok(s)) => Arc::from(s),
            _ => {
                let _ = self.device.resume(&device_id, pid).await;
                return;
            }
        };

        let now = self.clock.now_utc();
        let target_id = TargetId::new();
        let mut target = Target::new(target_id, device_id.clone(), parent_package, Mode::Spawn, Gating::None, now);
        target.pid = Some(pid);
        target.state = TargetState::Running;
        target.parent_target_id = Some(parent_target_id);

        self.register_session_detached_handler(target_id, &session);
        self.sessions.lock().insert(target_id, session);
        self.targets.lock().insert(target_id, target);

        if self.inject_orchestrator(target_id).await.is_err() {
            let _ = self.device.kill(&device_id, pid).await;
            self.purge_target(target_id).await;
            return;
        }

        let bootstrap = {
            let gating = self.device_gating.lock();
            gating.get(&device_id).and_then(|g| g.child_bootstrap.get(&parent_target_id).cloned())
        };
        if let Some(bootstrap) = bootstrap {
            let coordinator = self.job_coordinator.lock().clone();
            if let Some(coordinator) = coordinator {
                if let Err(e) = coordinator.start_bootstrap(target_id, bootstrap.job_type, bootstrap.module, bootstrap.params).await {
                    tracing::warn!(%target_id, error = %e, "child bootstrap failed");
                }
            }
        }

        if let Err(e) = self.device.resume(&device_id, pid).await {
            self.record_resume_error(target_id, e.to_string());
        }
    }

    pub fn status(&self, target_id: TargetId) -> Result<Target, TargetManagerError> {
        self.targets.lock().get(&target_id).cloned().ok_or(TargetManagerError::TargetNotFound(target_id))
    }

    /// `snapshots.get` (§6): `getSnapshot(kind, options?)` against the
    /// target's orchestrator, under the §5 10s snapshot timeout.
    pub async fn get_snapshot(
        &self,
        target_id: TargetId,
        kind: &str,
        options: Option<Value>,
    ) -> Result<Value, TargetManagerError> {
        let orchestrator = self
            .orchestrators
            .lock()
            .get(&target_id)
            .cloned()
            .ok_or(TargetManagerError::TargetNotFound(target_id))?;
        Ok(orchestrator.get_snapshot(kind, options).await?)
    }

    pub fn list(&self) -> Vec<Target> {
        self.targets.lock().values().cloned().collect()
    }
}

/// §4.7 pid selection: exact match, else a unique `pkg:suffix` match, else
/// a unique "contains" match, else `NotFound` with up to
/// [`MAX_PID_CANDIDATES`] candidate process names.
fn resolve_pid(device_id: &str, package: &str, processes: &[ProcessInfo]) -> Result<u32, TargetManagerError> {
    if let Some(p) = processes.iter().find(|p| p.name == package) {
        return Ok(p.pid);
    }

    let suffix_matches: Vec<&ProcessInfo> =
        processes.iter().filter(|p| p.name.split_once(':').map(|(prefix, _)| prefix == package).unwrap_or(false)).collect();
    if suffix_matches.len() == 1 {
        return Ok(suffix_matches[0].pid);
    }

    let contains_matches: Vec<&ProcessInfo> = processes.iter().filter(|p| p.name.contains(package)).collect();
    if contains_matches.len() == 1 {
        return Ok(contains_matches[0].pid);
    }

    let candidates = processes.iter().take(MAX_PID_CANDIDATES).map(|p| p.name.clone()).collect();
    Err(TargetManagerError::ProcessNotFound { device_id: device_id.to_string(), package: package.to_string(), candidates })
}

#[cfg(test)]
mod tests {
    use kahlo_adapters::fake::FakeDeviceBridge;
    use kahlo_core::FakeClock;
    use tempfile::tempdir;

    use super::*;

    fn build_manager() -> (Arc<TargetManager<FakeClock>>, Arc<FakeDeviceBridge>, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let paths = kahlo_storage::DataPaths::new(dir.path());
        let clock = FakeClock::new();
        let device = Arc::new(FakeDeviceBridge::default());
        let event_pipeline = Arc::new(EventPipeline::new(paths.clone()));
        let artifact_store = Arc::new(ArtifactStore::new(paths.clone(), 10 * 1024 * 1024));
        let draft_store = Arc::new(DraftStore::new(paths.clone()));
        let module_store = Arc::new(ModuleStore::new(paths));
        let manager = TargetManager::new(device.clone(), clock, event_pipeline, artifact_store, draft_store, module_store);
        (manager, device, dir)
    }

    #[tokio::test]
    async fn attach_creates_running_target_with_ready_agent() {
        let (manager, device, _dir) = build_manager();
        device.seed_process("dev-1", 1234, "com.example.app");

        let target_id = manager
            .ensure_target(EnsureTargetRequest {
                device_id: "dev-1".to_string(),
                package: "com.example.app".to_string(),
                mode: Mode::Attach,
                gating: Gating::None,
                bootstrap: None,
                child_bootstrap: None,
            })
            .await
            .expect("attach succeeds");

        let target = manager.status(target_id).expect("target exists");
        assert_eq!(target.state, TargetState::Running);
        assert_eq!(target.agent_state, AgentState::Ready);
        assert_eq!(target.pid, Some(1234));
    }

    #[tokio::test]
    async fn ensure_target_is_idempotent_for_a_running_attach() {
        let (manager, device, _dir) = build_manager();
        device.seed_process("dev-1", 1234, "com.example.app");

        let req = || EnsureTargetRequest {
            device_id: "dev-1".to_string(),
            package: "com.example.app".to_string(),
            mode: Mode::Attach,
            gating: Gating::None,
            bootstrap: None,
            child_bootstrap: None,
        };
        let first = manager.ensure_target(req()).await.expect("first attach");
        let second = manager.ensure_target(req()).await.expect("second attach is idempotent");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn attach_without_matching_process_fails_not_found() {
        let (manager, device, _dir) = build_manager();
        device.seed_process("dev-1", 9, "com.other.app");

        let err = manager
            .ensure_target(EnsureTargetRequest {
                device_id: "dev-1".to_string(),
                package: "com.example.app".to_string(),
                mode: Mode::Attach,
                gating: Gating::None,
                bootstrap: None,
                child_bootstrap: None,
            })
            .await
            .expect_err("no matching process");
        assert!(matches!(err, TargetManagerError::ProcessNotFound { .. }));
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let (manager, device, _dir) = build_manager();
        device.seed_process("dev-1", 1234, "com.example.app");
        let target_id = manager
            .ensure_target(EnsureTargetRequest {
                device_id: "dev-1".to_string(),
                package: "com.example.app".to_string(),
                mode: Mode::Attach,
                gating: Gating::None,
                bootstrap: None,
                child_bootstrap: None,
            })
            .await
            .expect("attach succeeds");

        manager.detach(target_id).await.expect("first detach");
        manager.detach(target_id).await.expect("second detach is a no-op");
        assert_eq!(manager.status(target_id).expect("target still exists").state, TargetState::Detached);
    }

    #[test]
    fn resolve_module_source_rejects_empty_inline_source() {
        let (manager, _device, _dir) = build_manager();
        let err = manager.resolve_module_source(&ModuleSource::Source(String::new())).expect_err("empty source rejected");
        assert!(matches!(err, TargetManagerError::EmptySource));
    }

    #[test]
    fn resolve_pid_prefers_exact_then_suffix_then_contains() {
        let processes = vec![
            ProcessInfo { pid: 1, name: "com.example.app".to_string() },
            ProcessInfo { pid: 2, name: "com.example.app:remote".to_string() },
        ];
        assert_eq!(resolve_pid("dev-1", "com.example.app", &processes).expect("exact match").to_string(), "1");

        let suffix_only = vec![ProcessInfo { pid: 2, name: "com.example.app:remote".to_string() }];
        assert_eq!(resolve_pid("dev-1", "com.example.app", &suffix_only).expect("suffix match").to_string(), "2");

        let contains_only = vec![ProcessInfo { pid: 3, name: "sandboxed:com.example.app".to_string() }];
        assert_eq!(resolve_pid("dev-1", "com.example.app", &contains_only).expect("contains match").to_string(), "3");

        let ambiguous = vec![
            ProcessInfo { pid: 2, name: "com.example.app:remote".to_string() },
            ProcessInfo { pid: 3, name: "com.example.app:push".to_string() },
        ];
        assert!(matches!(resolve_pid("dev-1", "com.example.app", &ambiguous), Err(TargetManagerError::ProcessNotFound { .. })));
    }
}
