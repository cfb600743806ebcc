// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! Typed RPC wrappers over [`crate::session::ScriptHandle`] for the two
//! script roles (§6): the coordinator ("orchestrator") and per-job
//! scripts. Also the inbound agent message envelope types.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use kahlo_core::ErrorCode;

use crate::session::{ScriptHandle, SessionError};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("unexpected response shape from {0:?}: {1}")]
    BadResponse(String, String),
}

impl kahlo_core::error::ErrorCategory for RpcError {
    fn code(&self) -> ErrorCode {
        match self {
            RpcError::Session(e) => kahlo_core::error::ErrorCategory::code(e),
            RpcError::BadResponse(_, _) => ErrorCode::Internal,
        }
    }
}

async fn call_with_timeout(
    script: &dyn ScriptHandle,
    method: &str,
    params: Value,
    timeout: Duration,
) -> Result<Value, RpcError> {
    tokio::time::timeout(timeout, script.call(method, params))
        .await
        .map_err(|_| RpcError::Session(SessionError::Timeout(method.to_string())))?
        .map_err(RpcError::from)
}

/// §6 "ping validation: 5 s timeout".
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);
/// §6 "snapshot RPC: 10 s".
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// The coordinator script injected per target (§4.7 "Orchestrator injection").
pub struct AgentHandle {
    script: Box<dyn ScriptHandle>,
}

impl AgentHandle {
    pub fn new(script: Box<dyn ScriptHandle>) -> Self {
        Self { script }
    }

    pub async fn load(&self) -> Result<(), SessionError> {
        self.script.load().await
    }

    pub async fn unload(&self) -> Result<(), SessionError> {
        self.script.unload().await
    }

    /// `ping()→"pong"` under the §5 5s timeout.
    pub async fn ping(&self) -> Result<(), RpcError> {
        let resp = call_with_timeout(self.script.as_ref(), "ping", Value::Null, PING_TIMEOUT).await?;
        match resp.as_str() {
            Some("pong") => Ok(()),
            _ => Err(RpcError::BadResponse("ping".into(), resp.to_string())),
        }
    }

    /// `getSnapshot(kind, options?)` under the §5/§6 10s timeout.
    pub async fn get_snapshot(&self, kind: &str, options: Option<Value>) -> Result<Value, RpcError> {
        let params = serde_json::json!({ "kind": kind, "options": options });
        call_with_timeout(self.script.as_ref(), "getSnapshot", params, SNAPSHOT_TIMEOUT).await
    }

    pub fn on_destroyed(&self, callback: crate::session::DestroyCallback) {
        self.script.on_destroyed(callback);
    }

    pub fn on_message(&self, callback: crate::session::MessageCallback) {
        self.script.on_message(callback);
    }
}

#[derive(Debug, Serialize)]
struct StartJobParams<'a> {
    job_id: &'a str,
    job_type: &'a str,
    module_source: &'a str,
    params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartJobResponse {
    pub ok: bool,
    pub state: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetStatusResponse {
    pub job_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub state: String,
    pub heartbeat: Option<String>,
    pub metrics: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// The per-job script (§4.6/§4.7, one per job, unload == cancellation).
pub struct JobScriptHandle {
    script: Box<dyn ScriptHandle>,
}

impl JobScriptHandle {
    pub fn new(script: Box<dyn ScriptHandle>) -> Self {
        Self { script }
    }

    pub async fn load(&self) -> Result<(), SessionError> {
        self.script.load().await
    }

    pub async fn unload(&self) -> Result<(), SessionError> {
        self.script.unload().await
    }

    pub async fn ping(&self) -> Result<(), RpcError> {
        let resp = call_with_timeout(self.script.as_ref(), "ping", Value::Null, PING_TIMEOUT).await?;
        match resp.as_str() {
            Some("pong") => Ok(()),
            _ => Err(RpcError::BadResponse("ping".into(), resp.to_string())),
        }
    }

    pub async fn start_job(
        &self,
        job_id: &str,
        job_type: &str,
        module_source: &str,
        params: Option<Value>,
    ) -> Result<StartJobResponse, RpcError> {
        let req = StartJobParams { job_id, job_type, module_source, params };
        let value = serde_json::to_value(req)
            .map_err(|e| RpcError::BadResponse("startJob".into(), e.to_string()))?;
        // startJob has no dedicated spec timeout; it shares the session's
        // general suspension-point treatment (§5), so no timeout is applied
        // here beyond the transport's own.
        let resp = self.script.call("startJob", value).await?;
        serde_json::from_value(resp.clone())
            .map_err(|e| RpcError::BadResponse("startJob".into(), format!("{e}: {resp}")))
    }

    pub async fn get_status(&self) -> Result<GetStatusResponse, RpcError> {
        let resp = self.script.call("getStatus", Value::Null).await?;
        serde_json::from_value(resp.clone())
            .map_err(|e| RpcError::BadResponse("getStatus".into(), format!("{e}: {resp}")))
    }

    pub fn on_destroyed(&self, callback: crate::session::DestroyCallback) {
        self.script.on_destroyed(callback);
    }

    pub fn on_message(&self, callback: crate::session::MessageCallback) {
        self.script.on_message(callback);
    }
}

/// §6 inbound agent message envelope: `{type:"send", payload:{kahlo:{...}}}`.
/// Any other shape is ignored by the caller (`kahlo-storage::event_pipeline`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OuterEnvelope {
    #[serde(rename = "type")]
    pub outer_type: String,
    pub payload: OuterPayload,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OuterPayload {
    pub kahlo: Value,
}

impl OuterEnvelope {
    /// Wrap an inner `kahlo` body into the outer `{type:"send",...}` shape,
    /// used for both real agent messages and host-generated synthetic
    /// events (§4.2/§9 "Synthetic events").
    pub fn wrap(kahlo: Value) -> Value {
        serde_json::to_value(OuterEnvelope {
            outer_type: "send".to_string(),
            payload: OuterPayload { kahlo },
        })
        .unwrap_or(Value::Null)
    }

    /// Parse a raw inbound message; returns `None` for any shape that isn't
    /// the expected `{type:"send", payload:{kahlo:{...}}}` envelope.
    pub fn parse(raw: &Value) -> Option<Value> {
        if raw.get("type").and_then(Value::as_str) != Some("send") {
            return None;
        }
        raw.get("payload")?.get("kahlo").cloned()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KahloMessage {
    Event(EventBody),
    Artifact(ArtifactBody),
    Heartbeat(HeartbeatBody),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventBody {
    pub v: u32,
    pub ts: String,
    pub job_id: String,
    pub kind: String,
    #[serde(default)]
    pub level: Option<String>,
    pub payload: Value,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactBody {
    pub ts: String,
    pub artifact: ArtifactFields,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactFields {
    pub artifact_id: String,
    pub job_id: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatBody {
    pub v: u32,
    pub ts: String,
    pub job_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_envelope() {
        let raw = serde_json::json!({"type": "send", "payload": {"kahlo": {"type": "event"}}});
        let inner = OuterEnvelope::parse(&raw).unwrap();
        assert_eq!(inner["type"], "event");
    }

    #[test]
    fn rejects_non_send_envelope() {
        let raw = serde_json::json!({"type": "other", "payload": {}});
        assert!(OuterEnvelope::parse(&raw).is_none());
    }

    #[test]
    fn wrap_round_trips_through_parse() {
        let inner = serde_json::json!({"type": "event", "kind": "x"});
        let wrapped = OuterEnvelope::wrap(inner.clone());
        assert_eq!(OuterEnvelope::parse(&wrapped).unwrap(), inner);
    }

    #[test]
    fn kahlo_message_tags_by_type() {
        let event: KahloMessage = serde_json::from_value(serde_json::json!({
            "type": "event", "v": 1, "ts": "2026-01-01T00:00:00Z", "job_id": "job-x",
            "kind": "k", "level": "info", "payload": {}
        }))
        .unwrap();
        assert!(matches!(event, KahloMessage::Event(_)));
    }
}
