// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! Job controller (§4.6): start/startBootstrap, status reconciliation,
//! cancellation, TTL expiry and script-destroyed handling for jobs running
//! inside per-job scripts on a target.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kahlo_adapters::agent::{GetStatusResponse, RpcError};
use kahlo_core::error::ErrorCategory;
use kahlo_core::{Clock, ErrorCode, Job, JobError, JobHealth, JobId, JobMetrics, JobState, JobType, TargetId};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::runtime_bundle::RuntimeBundleCache;
use crate::target_manager::{ModuleSource, TargetManager, TargetManagerError};

#[derive(Debug, Error)]
pub enum JobControllerError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job rejected: {0}")]
    StartRejected(String),
    #[error("failed to resolve the runtime bundle: {0}")]
    RuntimeBundle(String),
    #[error(transparent)]
    TargetManager(#[from] TargetManagerError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl ErrorCategory for JobControllerError {
    fn code(&self) -> ErrorCode {
        match self {
            JobControllerError::NotFound(_) => ErrorCode::NotFound,
            JobControllerError::StartRejected(_) => ErrorCode::Unavailable,
            JobControllerError::RuntimeBundle(_) => ErrorCode::Internal,
            JobControllerError::TargetManager(e) => e.code(),
            JobControllerError::Rpc(e) => e.code(),
        }
    }
}

#[derive(Debug)]
pub struct StartJobRequest {
    pub target_id: TargetId,
    pub job_type: JobType,
    pub module: ModuleSource,
    pub params: Option<Value>,
    pub ttl: Option<Duration>,
}

/// A point-in-time view of a job, combining the host record with its
/// computed health (§4.6 `calculateJobHealth`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobStatusSnapshot {
    pub job_id: JobId,
    pub target_id: TargetId,
    pub job_type: JobType,
    pub state: JobState,
    pub health: JobHealth,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metrics: Option<JobMetrics>,
    pub result: Option<Value>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn parse_job_state(s: &str) -> Option<JobState> {
    match s {
        "queued" => Some(JobState::Queued),
        "starting" => Some(JobState::Starting),
        "running" => Some(JobState::Running),
        "completed" => Some(JobState::Completed),
        "failed" => Some(JobState::Failed),
        "cancelled" => Some(JobState::Cancelled),
        _ => None,
    }
}

pub struct JobController<C: Clock> {
    target_manager: Arc<TargetManager<C>>,
    clock: C,
    jobs: Mutex<HashMap<JobId, Job>>,
    job_lock: kahlo_core::KeyedLock,
    bootstrap_lock: kahlo_core::KeyedLock,
    ttl_timers: Mutex<HashMap<JobId, JoinHandle<()>>>,
    retention: Duration,
    runtime_bundle: RuntimeBundleCache,
}

impl<C: Clock + 'static> JobController<C> {
    /// `runtime_bundle_path` is the on-disk location of the compiled
    /// standard library offered to job authors (§4.6 Start); `None` when no
    /// bundle is configured, in which case nothing is prepended to job
    /// sources.
    pub fn new(target_manager: Arc<TargetManager<C>>, clock: C, retention: Duration, runtime_bundle_path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            target_manager,
            clock,
            jobs: Mutex::new(HashMap::new()),
            job_lock: kahlo_core::KeyedLock::new(),
            bootstrap_lock: kahlo_core::KeyedLock::new(),
            ttl_timers: Mutex::new(HashMap::new()),
            retention,
            runtime_bundle: RuntimeBundleCache::new(runtime_bundle_path),
        })
    }

    /// Start a user-requested job (§6 `jobs.start`). Arms its TTL timer, if any.
    pub async fn start(self: &Arc<Self>, req: StartJobRequest) -> Result<JobId, JobControllerError> {
        self.prune_terminal(self.clock.now_utc());
        let job_id = JobId::new();
        let StartJobRequest { target_id, job_type, module, params, ttl } = req;
        self.job_lock
            .with_lock(job_id.to_string(), || self.start_inner(job_id, target_id, job_type, module, params, false))
            .await?;
        if let Some(ttl) = ttl {
            self.arm_ttl(job_id, ttl);
        }
        Ok(job_id)
    }

    /// Start the implicit bootstrap job that runs while a target is
    /// suspended (§4.7 "resolve its source to a string before spawning",
    /// §4.6 "Bootstrap start"). No TTL; persists after start returns.
    pub async fn start_bootstrap(
        &self,
        target_id: TargetId,
        job_type: JobType,
        module: ModuleSource,
        params: Option<Value>,
    ) -> Result<JobId, JobControllerError> {
        self.prune_terminal(self.clock.now_utc());
        let job_id = JobId::new();
        self.bootstrap_lock
            .with_lock(format!("bootstrap:{target_id}"), || {
                self.start_inner(job_id, target_id, job_type, module, params, true)
            })
            .await?;
        Ok(job_id)
    }

    async fn start_inner(
        &self,
        job_id: JobId,
        target_id: TargetId,
        job_type: JobType,
        module: ModuleSource,
        params: Option<Value>,
        is_bootstrap: bool,
    ) -> Result<(), JobControllerError> {
        let now = self.clock.now_utc();
        let (source, provenance) = self.target_manager.resolve_module_source(&module)?;
        let bundle = self
            .runtime_bundle
            .resolve()
            .map_err(|e| JobControllerError::RuntimeBundle(e.to_string()))?;
        let script_source = format!("{bundle}{source}");

        self.target_manager.create_job_script(target_id, job_id, &script_source).await?;

        let job = Job::new(job_id, target_id, job_type, source.clone(), provenance, is_bootstrap, now);
        self.jobs.lock().insert(job_id, job);

        let Some(script) = self.target_manager.job_script(target_id, job_id) else {
            return self.fail_start(target_id, job_id, "job script vanished before startJob".to_string()).await;
        };

        match script.start_job(job_id.as_str(), &job_type.to_string(), &source, params).await {
            Ok(resp) if resp.ok => {
                let state = parse_job_state(&resp.state).unwrap_or(JobState::Running);
                self.set_job_state(job_id, state, self.clock.now_utc());
                Ok(())
            }
            Ok(resp) => {
                let message = resp.error.unwrap_or_else(|| "startJob reported failure".to_string());
                self.fail_start(target_id, job_id, message).await
            }
            Err(e) => self.fail_start(target_id, job_id, e.to_string()).await,
        }
    }

    async fn fail_start(&self, target_id: TargetId, job_id: JobId, message: String) -> Result<(), JobControllerError> {
        self.set_job_failed(job_id, message.clone(), self.clock.now_utc());
        self.target_manager.unload_job_script(target_id, job_id).await;
        Err(JobControllerError::StartRejected(message))
    }

    fn set_job_state(&self, job_id: JobId, state: JobState, now: DateTime<Utc>) {
        if let Some(job) = self.jobs.lock().get_mut(&job_id) {
            job.state = state;
            job.updated_at = now;
        }
    }

    fn set_job_failed(&self, job_id: JobId, message: String, now: DateTime<Utc>) {
        if let Some(job) = self.jobs.lock().get_mut(&job_id) {
            job.state = JobState::Failed;
            job.error = Some(JobError { message });
            job.updated_at = now;
        }
    }

    fn arm_ttl(self: &Arc<Self>, job_id: JobId, ttl: Duration) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let _ = this.cancel(job_id).await;
        });
        self.ttl_timers.lock().insert(job_id, handle);
    }

    fn snapshot(&self, job: &Job) -> JobStatusSnapshot {
        let now = self.clock.now_utc();
        JobStatusSnapshot {
            job_id: job.job_id,
            target_id: job.target_id,
            job_type: job.job_type,
            state: job.state,
            health: job.health(now),
            last_heartbeat: job.last_heartbeat,
            metrics: job.metrics.clone(),
            result: job.result.clone(),
            error: job.error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }

    fn get(&self, job_id: JobId) -> Result<Job, JobControllerError> {
        self.jobs.lock().get(&job_id).cloned().ok_or(JobControllerError::NotFound(job_id))
    }

    /// The stored host record for a job, independent of its health/status
    /// reconciliation — used by draft/module promotion (`modules.*`, §6)
    /// which need a job's `module_source`, not its live script status.
    pub fn job_record(&self, job_id: JobId) -> Result<Job, JobControllerError> {
        self.get(job_id)
    }

    /// §4.6 `jobStatus`: a terminal job returns its host snapshot directly;
    /// otherwise query `getStatus` and reconcile. An RPC failure while the
    /// host believes the job is still running means the script crashed
    /// silently and the job is flipped to failed.
    pub async fn status(&self, job_id: JobId) -> Result<JobStatusSnapshot, JobControllerError> {
        let host_job = self.get(job_id)?;
        if host_job.state.is_terminal() {
            return Ok(self.snapshot(&host_job));
        }

        let Some(script) = self.target_manager.job_script(host_job.target_id, job_id) else {
            self.set_job_failed(job_id, "Script crashed or became unavailable".to_string(), self.clock.now_utc());
            return Ok(self.snapshot(&self.get(job_id)?));
        };

        match script.get_status().await {
            Ok(resp) => {
                self.reconcile_status(job_id, resp, self.clock.now_utc());
                Ok(self.snapshot(&self.get(job_id)?))
            }
            Err(_) => {
                self.set_job_failed(job_id, "Script crashed or became unavailable".to_string(), self.clock.now_utc());
                Ok(self.snapshot(&self.get(job_id)?))
            }
        }
    }

    fn reconcile_status(&self, job_id: JobId, resp: GetStatusResponse, now: DateTime<Utc>) {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(&job_id) else { return };
        if let Some(state) = parse_job_state(&resp.state) {
            job.state = state;
        }
        if let Some(hb) = resp.heartbeat.as_deref().and_then(|s| s.parse::<DateTime<Utc>>().ok()) {
            job.last_heartbeat = Some(hb);
        }
        if let Some(metrics) = resp.metrics.and_then(|v| serde_json::from_value::<JobMetrics>(v).ok()) {
            job.adopt_metrics_if_unset(metrics);
        }
        if let Some(result) = resp.result {
            job.result = Some(result);
        }
        if let Some(err) = resp.error {
            job.error = Some(JobError { message: err });
        }
        job.updated_at = now;
    }

    /// §4.6 `cancelJob`: idempotent on terminal states. Captures final
    /// metrics best-effort before unload, and sets `cancelled` *before*
    /// unloading so the destroyed callback treats this as expected (§9).
    pub async fn cancel(&self, job_id: JobId) -> Result<JobStatusSnapshot, JobControllerError> {
        self.job_lock.with_lock(job_id.to_string(), || self.cancel_inner(job_id)).await
    }

    async fn cancel_inner(&self, job_id: JobId) -> Result<JobStatusSnapshot, JobControllerError> {
        let host_job = self.get(job_id)?;
        if host_job.state.is_terminal() {
            return Ok(self.snapshot(&host_job));
        }
        if let Some(handle) = self.ttl_timers.lock().remove(&job_id) {
            handle.abort();
        }

        let target_id = host_job.target_id;
        if let Some(script) = self.target_manager.job_script(target_id, job_id) {
            if let Ok(resp) = script.get_status().await {
                self.reconcile_status(job_id, resp, self.clock.now_utc());
            }
        }

        self.set_job_state(job_id, JobState::Cancelled, self.clock.now_utc());
        self.target_manager.unload_job_script(target_id, job_id).await;
        Ok(self.snapshot(&self.get(job_id)?))
    }

    /// Wired by the target manager onto every job script's destroyed
    /// signal. No-op if the job already reached a terminal state (e.g. a
    /// destroy racing a just-completed `cancel`).
    pub async fn handle_script_destroyed(&self, job_id: JobId, reason: String) {
        let now = self.clock.now_utc();
        let target_id = {
            let mut jobs = self.jobs.lock();
            let Some(job) = jobs.get_mut(&job_id) else { return };
            if job.state.is_terminal() {
                return;
            }
            job.state = JobState::Failed;
            job.error = Some(JobError { message: format!("Job script destroyed: {reason}") });
            job.updated_at = now;
            job.target_id
        };
        if let Some(handle) = self.ttl_timers.lock().remove(&job_id) {
            handle.abort();
        }
        self.target_manager.emit_synthetic_event(
            target_id,
            job_id,
            "job.crashed",
            serde_json::json!({ "reason": reason }),
            now,
        );
    }

    /// First-writer-wins metrics adoption from an ingested `job.completed`
    /// / `job.failed` event payload (§4.6 "Final-metrics capture").
    pub fn adopt_metrics(&self, job_id: JobId, metrics: JobMetrics) {
        if let Some(job) = self.jobs.lock().get_mut(&job_id) {
            job.adopt_metrics_if_unset(metrics);
        }
    }

    /// Heartbeat ingestion (§4.2 heartbeat body, §4.6 health computation).
    pub fn record_heartbeat(&self, job_id: JobId, now: DateTime<Utc>) {
        if let Some(job) = self.jobs.lock().get_mut(&job_id) {
            job.last_heartbeat = Some(now);
            job.updated_at = now;
        }
    }

    pub fn list(&self) -> Vec<Job> {
        self.jobs.lock().values().cloned().collect()
    }

    pub fn list_by_target(&self, target_id: TargetId) -> Vec<Job> {
        self.jobs.lock().values().filter(|j| j.target_id == target_id).cloned().collect()
    }

    /// Opportunistic pruning of terminal job records older than the
    /// retention window (§4.6, default 1h). Run at the top of every start.
    fn prune_terminal(&self, now: DateTime<Utc>) {
        let retention_secs = self.retention.as_secs() as i64;
        self.jobs.lock().retain(|_, job| {
            !job.state.is_terminal() || now.signed_duration_since(job.updated_at).num_seconds() < retention_secs
        });
    }
}

/// Lets the target manager drive bootstrap jobs and report script/message
/// events back without a generic cycle between the two structs.
#[async_trait::async_trait]
impl<C: Clock + 'static> crate::target_manager::JobCoordinator for JobController<C> {
    async fn start_bootstrap(
        &self,
        target_id: TargetId,
        job_type: JobType,
        module: ModuleSource,
        params: Option<Value>,
    ) -> Result<JobId, TargetManagerError> {
        self.start_bootstrap(target_id, job_type, module, params).await.map_err(|e| match e {
            JobControllerError::TargetManager(inner) => inner,
            other => TargetManagerError::Unavailable(other.to_string()),
        })
    }

    async fn handle_script_destroyed(&self, job_id: JobId, reason: String) {
        self.handle_script_destroyed(job_id, reason).await;
    }

    fn adopt_metrics(&self, job_id: JobId, metrics: JobMetrics) {
        self.adopt_metrics(job_id, metrics);
    }

    fn record_heartbeat(&self, job_id: JobId, now: DateTime<Utc>) {
        self.record_heartbeat(job_id, now);
    }
}

#[cfg(test)]
mod tests {
    use kahlo_adapters::fake::FakeDeviceBridge;
    use kahlo_core::{FakeClock, Gating, Mode};
    use tempfile::tempdir;

    use super::*;
    use crate::target_manager::EnsureTargetRequest;

    fn build_harness() -> (Arc<TargetManager<FakeClock>>, Arc<JobController<FakeClock>>, Arc<FakeDeviceBridge>, tempfile::TempDir)
    {
        let dir = tempdir().expect("tempdir");
        let paths = kahlo_storage::DataPaths::new(dir.path());
        let clock = FakeClock::new();
        let device = Arc::new(FakeDeviceBridge::default());
        let event_pipeline = Arc::new(kahlo_storage::EventPipeline::new(paths.clone()));
        let artifact_store = Arc::new(kahlo_storage::ArtifactStore::new(paths.clone(), 10 * 1024 * 1024));
        let draft_store = Arc::new(kahlo_storage::DraftStore::new(paths.clone()));
        let module_store = Arc::new(kahlo_storage::ModuleStore::new(paths));
        let target_manager =
            TargetManager::new(device.clone(), clock.clone(), event_pipeline, artifact_store, draft_store, module_store);
        let controller = JobController::new(target_manager.clone(), clock, Duration::from_secs(3600), None);
        target_manager.set_job_coordinator(controller.clone());
        (target_manager, controller, device, dir)
    }

    async fn attached_target(target_manager: &Arc<TargetManager<FakeClock>>, device: &FakeDeviceBridge) -> TargetId {
        device.seed_process("dev-1", 1234, "com.example.app");
        target_manager
            .ensure_target(EnsureTargetRequest {
                device_id: "dev-1".to_string(),
                package: "com.example.app".to_string(),
                mode: Mode::Attach,
                gating: Gating::None,
                bootstrap: None,
                child_bootstrap: None,
            })
            .await
            .expect("attach succeeds")
    }

    #[tokio::test]
    async fn start_fails_and_unloads_script_when_agent_rejects_start_job() {
        let (target_manager, controller, device, _dir) = build_harness();
        let target_id = attached_target(&target_manager, &device).await;

        // The default fake responder answers every non-ping RPC with `null`,
        // which cannot deserialize into `StartJobResponse`.
        let err = controller
            .start(StartJobRequest {
                target_id,
                job_type: JobType::Oneshot,
                module: ModuleSource::Source("console.log('hi')".to_string()),
                params: None,
                ttl: None,
            })
            .await
            .expect_err("startJob rejected by the default fake responder");
        assert!(matches!(err, JobControllerError::StartRejected(_)));
    }

    #[tokio::test]
    async fn status_of_unknown_job_is_not_found() {
        let (_target_manager, controller, _device, _dir) = build_harness();
        let err = controller.status(JobId::new()).await.expect_err("unknown job");
        assert!(matches!(err, JobControllerError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_a_job_already_failed_by_rejected_start() {
        let (target_manager, controller, device, _dir) = build_harness();
        let target_id = attached_target(&target_manager, &device).await;

        let _ = controller
            .start(StartJobRequest {
                target_id,
                job_type: JobType::Oneshot,
                module: ModuleSource::Source("console.log('hi')".to_string()),
                params: None,
                ttl: None,
            })
            .await;

        let jobs = controller.list();
        let failed = jobs.iter().find(|j| j.state == JobState::Failed).expect("one failed job recorded");
        let snapshot_a = controller.cancel(failed.job_id).await.expect("cancel terminal job is a no-op");
        let snapshot_b = controller.cancel(failed.job_id).await.expect("cancel is idempotent");
        assert_eq!(snapshot_a.state, snapshot_b.state);
        assert_eq!(snapshot_a.state, JobState::Failed);
    }

    #[tokio::test]
    async fn handle_script_destroyed_is_a_no_op_for_an_already_terminal_job() {
        let (_target_manager, controller, _device, _dir) = build_harness();
        let job_id = JobId::new();
        // No job with this id exists; this must not panic.
        controller.handle_script_destroyed(job_id, "crash".to_string()).await;
    }

    #[tokio::test]
    async fn adopt_metrics_and_heartbeat_are_no_ops_for_missing_jobs() {
        let (_target_manager, controller, _device, _dir) = build_harness();
        controller.adopt_metrics(JobId::new(), JobMetrics::default());
        controller.record_heartbeat(JobId::new(), Utc::now());
    }
}
