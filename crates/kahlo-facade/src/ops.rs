// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! [`Facade`]: one method per tool in §6's "Tool facade surface", each
//! mapping a typed request onto `kahlo-engine`/`kahlo-storage`/
//! `kahlo-adapters` and its result through [`crate::envelope`].

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use kahlo_adapters::DeviceBridge;
use kahlo_core::error::ErrorCategory;
use kahlo_core::{Clock, Cursor, ErrorCode, EventFilter, JobType};
use kahlo_engine::{BootstrapSpec, EnsureTargetRequest, JobController, ModuleSource, StartJobRequest, TargetManager};
use kahlo_storage::{ArtifactStore, DraftStore, EventPipeline, FetchScope, ModuleStore};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::envelope::{err_envelope, ok_envelope, ToolError, ToolResult};
use crate::request::*;

/// Composition root for the tool surface: one instance per running daemon,
/// threading an `Arc<dyn DeviceBridge>` and the storage/engine singletons
/// through to every tool handler.
pub struct Facade<C: Clock + 'static> {
    device: Arc<dyn DeviceBridge>,
    target_manager: Arc<TargetManager<C>>,
    job_controller: Arc<JobController<C>>,
    event_pipeline: Arc<EventPipeline>,
    artifact_store: Arc<ArtifactStore>,
    draft_store: Arc<DraftStore>,
    module_store: Arc<ModuleStore>,
    clock: C,
}

fn parse<T: DeserializeOwned>(tool: &str, params: Value) -> ToolResult<T> {
    serde_json::from_value(params)
        .map_err(|e| ToolError::new(tool, ErrorCode::InvalidArgument, format!("invalid params: {e}")))
}

impl<C: Clock + 'static> Facade<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<dyn DeviceBridge>,
        target_manager: Arc<TargetManager<C>>,
        job_controller: Arc<JobController<C>>,
        event_pipeline: Arc<EventPipeline>,
        artifact_store: Arc<ArtifactStore>,
        draft_store: Arc<DraftStore>,
        module_store: Arc<ModuleStore>,
        clock: C,
    ) -> Self {
        Self { device, target_manager, job_controller, event_pipeline, artifact_store, draft_store, module_store, clock }
    }

    /// Single entry point for `kahlod serve`'s stdin-framed request loop:
    /// parse `params` for `tool`, run the handler, and flatten the result
    /// into the stable `{ok, ...}` envelope regardless of outcome.
    pub async fn dispatch(&self, tool: &str, params: Value) -> Value {
        let result = self.dispatch_inner(tool, params).await;
        match result {
            Ok(value) => value,
            Err(e) => err_envelope(&e),
        }
    }

    async fn dispatch_inner(&self, tool: &str, params: Value) -> ToolResult<Value> {
        match tool {
            "devices.list" => self.devices_list().await,
            "devices.get" => self.devices_get(parse(tool, params)?).await,
            "devices.health" => self.devices_health(parse(tool, params)?).await,
            "processes.list" => self.processes_list(parse(tool, params)?).await,
            "adb.exec" => self.adb_exec(),
            "targets.ensure" => self.targets_ensure(parse(tool, params)?).await,
            "targets.status" => self.targets_status(parse(tool, params)?),
            "targets.detach" => self.targets_detach(parse(tool, params)?).await,
            "jobs.start" => self.jobs_start(parse(tool, params)?).await,
            "jobs.status" => self.jobs_status(parse(tool, params)?).await,
            "jobs.list" => self.jobs_list(params),
            "jobs.cancel" => self.jobs_cancel(parse(tool, params)?).await,
            "snapshots.get" => self.snapshots_get(parse(tool, params)?).await,
            "events.fetch" => self.events_fetch(parse(tool, params)?),
            "artifacts.list" => self.artifacts_list(parse(tool, params)?),
            "artifacts.get" => self.artifacts_get(parse(tool, params)?),
            "modules.list" => self.modules_list(parse(tool, params)?),
            "modules.get" => self.modules_get(parse(tool, params)?),
            "modules.createDraft" => self.modules_create_draft(parse(tool, params)?),
            "modules.createDraftFromJob" => self.modules_create_draft_from_job(parse(tool, params)?),
            "modules.updateDraft" => self.modules_update_draft(parse(tool, params)?),
            "modules.getDraft" => self.modules_get_draft(parse(tool, params)?),
            "modules.listDrafts" => self.modules_list_drafts(),
            "modules.promoteDraft" => self.modules_promote_draft(parse(tool, params)?),
            "modules.promoteFromJob" => self.modules_promote_from_job(parse(tool, params)?),
            other => Err(ToolError::new(other, ErrorCode::NotImplemented, format!("unknown tool {other:?}"))),
        }
    }

    // -- devices / processes / adb: thin pass-throughs, not part of the core (§6) --

    async fn devices_list(&self) -> ToolResult<Value> {
        let tool = "devices.list";
        let devices = self.device.list_devices().await.map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&serde_json::json!({ "devices": devices })))
    }

    async fn devices_get(&self, p: DevicesGetParams) -> ToolResult<Value> {
        let tool = "devices.get";
        let device = self.device.get_device(&p.device_id).await.map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&device))
    }

    /// Not itself an RPC in `DeviceBridge` (§1 "peripheral"): reachability is
    /// inferred from whether `get_device` succeeds.
    async fn devices_health(&self, p: DevicesGetParams) -> ToolResult<Value> {
        let tool = "devices.health";
        match self.device.get_device(&p.device_id).await {
            Ok(device) => Ok(ok_envelope(&serde_json::json!({ "device_id": device.device_id, "healthy": true }))),
            Err(e) => Err(ToolError::from_backend(tool, &e)),
        }
    }

    async fn processes_list(&self, p: ProcessesListParams) -> ToolResult<Value> {
        let tool = "processes.list";
        let processes = self.device.list_processes(&p.device_id).await.map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&serde_json::json!({ "processes": processes })))
    }

    /// §6 "illustrative; not part of the core": reserved, never wired to a
    /// live shell.
    fn adb_exec(&self) -> ToolResult<Value> {
        Err(ToolError::new("adb.exec", ErrorCode::NotImplemented, "adb.exec is reserved and not implemented"))
    }

    // -- targets --

    async fn targets_ensure(&self, p: TargetsEnsureParams) -> ToolResult<Value> {
        let tool = "targets.ensure";
        let bootstrap = p
            .bootstrap
            .as_ref()
            .map(|wire| {
                Ok::<_, ToolError>(BootstrapSpec {
                    module: wire.resolve(tool)?,
                    job_type: p.bootstrap_type.unwrap_or(JobType::Oneshot),
                    params: p.bootstrap_params.clone(),
                })
            })
            .transpose()?;
        let child_bootstrap = p
            .child_bootstrap
            .as_ref()
            .map(|wire| {
                Ok::<_, ToolError>(BootstrapSpec {
                    module: wire.resolve(tool)?,
                    job_type: p.child_bootstrap_type.unwrap_or(JobType::Oneshot),
                    params: p.child_bootstrap_params.clone(),
                })
            })
            .transpose()?;

        let target_id = self
            .target_manager
            .ensure_target(EnsureTargetRequest {
                device_id: p.device_id,
                package: p.package,
                mode: p.mode,
                gating: p.gating,
                bootstrap,
                child_bootstrap,
            })
            .await
            .map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&serde_json::json!({ "target_id": target_id })))
    }

    fn targets_status(&self, p: TargetIdParams) -> ToolResult<Value> {
        let tool = "targets.status";
        let target = self.target_manager.status(p.target_id).map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&target))
    }

    async fn targets_detach(&self, p: TargetIdParams) -> ToolResult<Value> {
        let tool = "targets.detach";
        self.target_manager.detach(p.target_id).await.map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&serde_json::json!({ "target_id": p.target_id, "state": "detached" })))
    }

    // -- jobs --

    async fn jobs_start(&self, p: JobsStartParams) -> ToolResult<Value> {
        let tool = "jobs.start";
        let module = p.module.resolve(tool)?;
        let job_id = self
            .job_controller
            .start(StartJobRequest {
                target_id: p.target_id,
                job_type: p.job_type.unwrap_or(JobType::Oneshot),
                module,
                params: p.params,
                ttl: p.ttl.map(Duration::from_secs),
            })
            .await
            .map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&serde_json::json!({ "job_id": job_id })))
    }

    async fn jobs_status(&self, p: JobIdParams) -> ToolResult<Value> {
        let tool = "jobs.status";
        let snapshot = self.job_controller.status(p.job_id).await.map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&snapshot))
    }

    fn jobs_list(&self, params: Value) -> ToolResult<Value> {
        #[derive(serde::Deserialize, Default)]
        struct Params {
            #[serde(default)]
            target_id: Option<kahlo_core::TargetId>,
        }
        let p: Params = parse("jobs.list", params)?;
        let jobs = match p.target_id {
            Some(target_id) => self.job_controller.list_by_target(target_id),
            None => self.job_controller.list(),
        };
        Ok(ok_envelope(&serde_json::json!({ "jobs": jobs })))
    }

    async fn jobs_cancel(&self, p: JobIdParams) -> ToolResult<Value> {
        let tool = "jobs.cancel";
        let snapshot = self.job_controller.cancel(p.job_id).await.map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&snapshot))
    }

    // -- snapshots --

    async fn snapshots_get(&self, p: SnapshotsGetParams) -> ToolResult<Value> {
        let tool = "snapshots.get";
        let snapshot = self
            .target_manager
            .get_snapshot(p.target_id, &p.kind, p.options)
            .await
            .map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&serde_json::json!({ "kind": p.kind, "snapshot": snapshot })))
    }

    // -- events --

    fn events_fetch(&self, p: EventsFetchParams) -> ToolResult<Value> {
        let tool = "events.fetch";
        let scope = match (p.target_id, p.job_id) {
            (Some(target_id), None) => FetchScope::Target(target_id),
            (None, Some(job_id)) => FetchScope::Job(job_id),
            (Some(_), Some(_)) => {
                return Err(ToolError::new(tool, ErrorCode::InvalidArgument, "only one of target_id/job_id is allowed"))
            }
            (None, None) => {
                return Err(ToolError::new(tool, ErrorCode::InvalidArgument, "one of target_id/job_id is required"))
            }
        };
        let cursor = p
            .cursor
            .as_deref()
            .map(Cursor::parse)
            .transpose()
            .map_err(|e| ToolError::new(tool, ErrorCode::InvalidArgument, e.to_string()))?;
        let filters = EventFilter { kind: p.filters.kind, level: p.filters.level.as_deref().map(coerce_level) };
        let result = self.event_pipeline.fetch_events(scope, cursor, p.limit, filters);
        Ok(ok_envelope(&serde_json::json!({
            "events": result.events,
            "cursor": p.cursor,
            "next_cursor": result.next_cursor.encode(),
        })))
    }

    // -- artifacts --

    fn artifacts_list(&self, p: ArtifactsListParams) -> ToolResult<Value> {
        let tool = "artifacts.list";
        let artifacts = match (p.target_id, p.job_id) {
            (Some(target_id), None) => self.artifact_store.list_by_target(&target_id),
            (None, Some(job_id)) => self.artifact_store.list_by_job(&job_id),
            (Some(_), Some(_)) => {
                return Err(ToolError::new(tool, ErrorCode::InvalidArgument, "only one of target_id/job_id is allowed"))
            }
            (None, None) => {
                return Err(ToolError::new(tool, ErrorCode::InvalidArgument, "one of target_id/job_id is required"))
            }
        };
        Ok(ok_envelope(&serde_json::json!({ "artifacts": artifacts })))
    }

    /// `artifacts.get` (§6): inlines the payload as base64 only when it fits
    /// under the store's 32 KiB inline threshold; otherwise callers read
    /// `storage_ref` themselves.
    fn artifacts_get(&self, p: ArtifactsGetParams) -> ToolResult<Value> {
        let tool = "artifacts.get";
        let artifact = self
            .artifact_store
            .get_artifact(&p.artifact_id)
            .ok_or_else(|| ToolError::new(tool, ErrorCode::NotFound, format!("artifact {} not found", p.artifact_id)))?;

        if artifact.stored_size_bytes > self.artifact_store.inline_threshold_bytes() {
            return Ok(ok_envelope(&serde_json::json!({ "artifact": artifact })));
        }

        let payload = self.artifact_store.read_payload(&p.artifact_id).map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&serde_json::json!({
            "artifact": artifact,
            "encoding": "base64",
            "payload_b64": base64::engine::general_purpose::STANDARD.encode(payload),
        })))
    }

    // -- modules / drafts --

    fn modules_list(&self, p: ModulesListParams) -> ToolResult<Value> {
        let versions = self.module_store.list_versions(&p.name);
        Ok(ok_envelope(&serde_json::json!({ "name": p.name, "versions": versions })))
    }

    fn modules_get(&self, p: ModulesGetParams) -> ToolResult<Value> {
        let tool = "modules.get";
        let bundle = match p.version {
            Some(v) => {
                let version = semver::Version::parse(&v)
                    .map_err(|e| ToolError::new(tool, ErrorCode::InvalidArgument, e.to_string()))?;
                self.module_store.get(&p.name, &version)
            }
            None => self.module_store.get_latest(&p.name),
        }
        .map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&bundle))
    }

    fn modules_create_draft(&self, p: CreateDraftParams) -> ToolResult<Value> {
        let tool = "modules.createDraft";
        let draft = self
            .draft_store
            .create(p.name, p.source, p.manifest, None, self.clock.now_utc())
            .map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&draft))
    }

    fn modules_create_draft_from_job(&self, p: CreateDraftFromJobParams) -> ToolResult<Value> {
        let tool = "modules.createDraftFromJob";
        let job = self.job_controller.job_record(p.job_id).map_err(|e| ToolError::from_backend(tool, &e))?;
        let draft = self
            .draft_store
            .create(p.name, job.module_source, None, Some(p.job_id), self.clock.now_utc())
            .map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&draft))
    }

    fn modules_update_draft(&self, p: UpdateDraftParams) -> ToolResult<Value> {
        let tool = "modules.updateDraft";
        let draft = self
            .draft_store
            .update(&p.draft_id, p.name, p.source, p.manifest, self.clock.now_utc())
            .map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&draft))
    }

    fn modules_get_draft(&self, p: GetDraftParams) -> ToolResult<Value> {
        let tool = "modules.getDraft";
        let draft = self.draft_store.get(&p.draft_id).map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&draft))
    }

    fn modules_list_drafts(&self) -> ToolResult<Value> {
        Ok(ok_envelope(&serde_json::json!({ "drafts": self.draft_store.list() })))
    }

    fn modules_promote_draft(&self, p: PromoteDraftParams) -> ToolResult<Value> {
        let tool = "modules.promoteDraft";
        let draft = self.draft_store.get(&p.draft_id).map_err(|e| ToolError::from_backend(tool, &e))?;
        let bundle = self
            .module_store
            .promote(&p.name, p.strategy, draft.source, draft.manifest, None, Some(p.draft_id), self.clock.now_utc())
            .map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&bundle))
    }

    fn modules_promote_from_job(&self, p: PromoteFromJobParams) -> ToolResult<Value> {
        let tool = "modules.promoteFromJob";
        let job = self.job_controller.job_record(p.job_id).map_err(|e| ToolError::from_backend(tool, &e))?;
        let bundle = self
            .module_store
            .promote(&p.name, p.strategy, job.module_source, None, Some(p.job_id), None, self.clock.now_utc())
            .map_err(|e| ToolError::from_backend(tool, &e))?;
        Ok(ok_envelope(&bundle))
    }
}

fn coerce_level(raw: &str) -> kahlo_core::EventLevel {
    kahlo_core::EventLevel::coerce(Some(raw))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kahlo_adapters::fake::FakeDeviceBridge;
    use kahlo_core::{FakeClock, Gating, Mode};
    use kahlo_storage::DataPaths;
    use tempfile::tempdir;

    use super::*;

    fn build_facade() -> (Facade<FakeClock>, Arc<FakeDeviceBridge>, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let paths = DataPaths::new(dir.path());
        let clock = FakeClock::new();
        let device = Arc::new(FakeDeviceBridge::new());
        let event_pipeline = Arc::new(EventPipeline::new(paths.clone()));
        let artifact_store = Arc::new(ArtifactStore::new(paths.clone(), 10 * 1024 * 1024));
        let draft_store = Arc::new(DraftStore::new(paths.clone()));
        let module_store = Arc::new(ModuleStore::new(paths));
        let target_manager = TargetManager::new(
            device.clone() as Arc<dyn DeviceBridge>,
            clock.clone(),
            event_pipeline.clone(),
            artifact_store.clone(),
            draft_store.clone(),
            module_store.clone(),
        );
        let job_controller = JobController::new(target_manager.clone(), clock.clone(), Duration::from_secs(3600), None);
        target_manager.set_job_coordinator(job_controller.clone());
        let facade = Facade::new(
            device.clone() as Arc<dyn DeviceBridge>,
            target_manager,
            job_controller,
            event_pipeline,
            artifact_store,
            draft_store,
            module_store,
            clock,
        );
        (facade, device, dir)
    }

    #[tokio::test]
    async fn targets_ensure_then_status_round_trips_through_dispatch() {
        let (facade, device, _dir) = build_facade();
        device.seed_process("dev-1", 1234, "com.example.app");

        let ensure = facade
            .dispatch(
                "targets.ensure",
                serde_json::json!({
                    "device_id": "dev-1",
                    "package": "com.example.app",
                    "mode": "attach",
                }),
            )
            .await;
        assert_eq!(ensure["ok"], true);
        let target_id = ensure["target_id"].as_str().expect("target_id string").to_string();

        let status = facade.dispatch("targets.status", serde_json::json!({ "target_id": target_id })).await;
        assert_eq!(status["ok"], true);
        assert_eq!(status["state"], "running");
    }

    #[tokio::test]
    async fn targets_status_unknown_target_is_not_found_envelope() {
        let (facade, _device, _dir) = build_facade();
        let resp = facade
            .dispatch("targets.status", serde_json::json!({ "target_id": "targ00000000000000000" }))
            .await;
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["error"]["code"], "NOT_FOUND");
        assert_eq!(resp["error"]["tool"], "targets.status");
    }

    #[tokio::test]
    async fn targets_ensure_rejects_attach_with_gating() {
        let (facade, _device, _dir) = build_facade();
        let resp = facade
            .dispatch(
                "targets.ensure",
                serde_json::json!({
                    "device_id": "dev-1",
                    "package": "com.example.app",
                    "mode": "attach",
                    "gating": "spawn",
                }),
            )
            .await;
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["error"]["code"], "INVALID_ARGUMENT");
    }

    #[test]
    fn module_source_wire_rejects_unknown_kind() {
        let wire = ModuleSourceWire { kind: "bogus".to_string(), source: None, draft_id: None, module_ref: None };
        let err = wire.resolve("jobs.start").expect_err("unknown kind is rejected");
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn module_source_wire_resolves_each_kind() {
        let source = ModuleSourceWire {
            kind: "source".to_string(),
            source: Some("console.log(1)".to_string()),
            draft_id: None,
            module_ref: None,
        };
        assert!(matches!(source.resolve("jobs.start").unwrap(), ModuleSource::Source(_)));

        let draft = ModuleSourceWire {
            kind: "draft".to_string(),
            source: None,
            draft_id: Some("drft00000000000000000".to_string()),
            module_ref: None,
        };
        assert!(matches!(draft.resolve("jobs.start").unwrap(), ModuleSource::Draft(_)));

        let module = ModuleSourceWire {
            kind: "module".to_string(),
            source: None,
            draft_id: None,
            module_ref: Some("hook-lib@1.0.0".to_string()),
        };
        assert!(matches!(module.resolve("jobs.start").unwrap(), ModuleSource::Module(_)));
    }

    #[tokio::test]
    async fn events_fetch_requires_exactly_one_scope() {
        let (facade, _device, _dir) = build_facade();
        let resp = facade.dispatch("events.fetch", serde_json::json!({})).await;
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["error"]["code"], "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn artifacts_get_inlines_small_payload() {
        let (facade, device, _dir) = build_facade();
        device.seed_process("dev-1", 1234, "com.example.app");
        let ensure = facade
            .dispatch(
                "targets.ensure",
                serde_json::json!({ "device_id": "dev-1", "package": "com.example.app", "mode": "attach" }),
            )
            .await;
        let target_id: kahlo_core::TargetId = ensure["target_id"].as_str().unwrap().into();

        let artifact_id = kahlo_core::ArtifactId::new();
        facade
            .artifact_store
            .store_artifact(kahlo_storage::StoreArtifactRequest {
                target_id,
                artifact_id,
                job_id: kahlo_core::JobId::new(),
                ts: chrono::Utc::now(),
                artifact_type: "file_dump".to_string(),
                size_bytes: 3,
                mime: None,
                name: None,
                metadata: None,
                data: vec![1, 2, 3],
            })
            .unwrap();

        let resp = facade.dispatch("artifacts.get", serde_json::json!({ "artifact_id": artifact_id.to_string() })).await;
        assert_eq!(resp["ok"], true);
        assert_eq!(resp["encoding"], "base64");
        assert!(resp["payload_b64"].is_string());
    }

    #[tokio::test]
    async fn modules_create_draft_then_promote_round_trips() {
        let (facade, _device, _dir) = build_facade();
        let draft_resp = facade
            .dispatch("modules.createDraft", serde_json::json!({ "name": "hook", "source": "console.log(1)" }))
            .await;
        assert_eq!(draft_resp["ok"], true);
        let draft_id = draft_resp["draft_id"].as_str().unwrap().to_string();

        let promote_resp = facade
            .dispatch(
                "modules.promoteDraft",
                serde_json::json!({ "draft_id": draft_id, "name": "hook-lib", "strategy": "minor" }),
            )
            .await;
        assert_eq!(promote_resp["ok"], true);
        assert_eq!(promote_resp["version"], "0.1.0");
    }

    #[tokio::test]
    async fn adb_exec_is_reserved() {
        let (facade, _device, _dir) = build_facade();
        let resp = facade.dispatch("adb.exec", serde_json::json!({})).await;
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["error"]["code"], "NOT_IMPLEMENTED");
    }
}
