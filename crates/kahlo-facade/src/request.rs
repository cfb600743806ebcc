// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! Wire request shapes for the tool surface (§6 "Tool facade surface").
//! One `*Params` struct per tool; [`crate::ops::Facade::dispatch`] picks the
//! struct by tool name and deserializes the caller's JSON object into it.

use std::str::FromStr;

use kahlo_core::{ArtifactId, DraftId, Gating, JobId, JobType, Mode, ModuleRef, TargetId};
use serde::Deserialize;
use serde_json::Value;

use crate::envelope::ToolError;

/// The wire shape of a `module: {kind, ...}` argument (`targets.ensure`'s
/// `bootstrap`/`child_bootstrap`, `jobs.start`'s `module`).
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleSourceWire {
    pub kind: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub draft_id: Option<String>,
    #[serde(default)]
    pub module_ref: Option<String>,
}

impl ModuleSourceWire {
    /// Resolve into an engine-level [`kahlo_engine::ModuleSource`], rejecting
    /// an unknown `kind` or a `kind` missing its required companion field.
    pub fn resolve(&self, tool: &str) -> Result<kahlo_engine::ModuleSource, ToolError> {
        use kahlo_engine::ModuleSource;
        match self.kind.as_str() {
            "source" => self
                .source
                .clone()
                .map(ModuleSource::Source)
                .ok_or_else(|| invalid(tool, "module.kind=\"source\" requires module.source")),
            "draft" => self
                .draft_id
                .as_deref()
                .map(DraftId::from_string)
                .map(ModuleSource::Draft)
                .ok_or_else(|| invalid(tool, "module.kind=\"draft\" requires module.draft_id")),
            "module" => {
                let raw = self
                    .module_ref
                    .as_deref()
                    .ok_or_else(|| invalid(tool, "module.kind=\"module\" requires module.module_ref"))?;
                ModuleRef::from_str(raw).map(ModuleSource::Module).map_err(|e| invalid(tool, e.to_string()))
            }
            other => Err(invalid(tool, format!("unknown module.kind {other:?}"))),
        }
    }
}

fn invalid(tool: &str, message: impl Into<String>) -> ToolError {
    ToolError::new(tool, kahlo_core::ErrorCode::InvalidArgument, message.into())
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetsEnsureParams {
    pub device_id: String,
    pub package: String,
    pub mode: Mode,
    #[serde(default = "default_gating")]
    pub gating: Gating,
    #[serde(default)]
    pub bootstrap: Option<ModuleSourceWire>,
    #[serde(default)]
    pub bootstrap_params: Option<Value>,
    #[serde(default)]
    pub bootstrap_type: Option<JobType>,
    #[serde(default)]
    pub child_bootstrap: Option<ModuleSourceWire>,
    #[serde(default)]
    pub child_bootstrap_params: Option<Value>,
    #[serde(default)]
    pub child_bootstrap_type: Option<JobType>,
}

fn default_gating() -> Gating {
    Gating::None
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetIdParams {
    pub target_id: TargetId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsStartParams {
    pub target_id: TargetId,
    #[serde(rename = "type", default)]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub ttl: Option<u64>,
    pub module: ModuleSourceWire,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobIdParams {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotsGetParams {
    pub target_id: TargetId,
    pub kind: String,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilterWire {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
}

/// `events.fetch` addresses exactly one of `target_id`/`job_id` (§4.2); both
/// present or both absent is an [`ToolError`] raised by the facade, not by
/// deserialization, so the error carries the tool name.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsFetchParams {
    #[serde(default)]
    pub target_id: Option<TargetId>,
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub filters: EventFilterWire,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactsListParams {
    #[serde(default)]
    pub target_id: Option<TargetId>,
    #[serde(default)]
    pub job_id: Option<JobId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactsGetParams {
    pub artifact_id: ArtifactId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModulesListParams {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModulesGetParams {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDraftParams {
    #[serde(default)]
    pub name: Option<String>,
    pub source: String,
    #[serde(default)]
    pub manifest: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDraftFromJobParams {
    pub job_id: JobId,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateDraftParams {
    pub draft_id: DraftId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub manifest: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetDraftParams {
    pub draft_id: DraftId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromoteDraftParams {
    pub draft_id: DraftId,
    pub name: String,
    #[serde(default = "default_strategy")]
    pub strategy: kahlo_core::VersionStrategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromoteFromJobParams {
    pub job_id: JobId,
    pub name: String,
    #[serde(default = "default_strategy")]
    pub strategy: kahlo_core::VersionStrategy,
}

fn default_strategy() -> kahlo_core::VersionStrategy {
    kahlo_core::VersionStrategy::Minor
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevicesGetParams {
    pub device_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessesListParams {
    pub device_id: String,
}
