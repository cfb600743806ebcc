// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! The stable tool-response envelope (§7): `{ok:true, ...}` on success,
//! `{ok:false, error:{code,message,tool,retryable,details?,suggestion?}}`
//! on failure. `kahlo_core::error::ErrorCategory` is the single conversion
//! point every backend error enum feeds into [`ToolError::from_backend`].

use serde::Serialize;
use serde_json::Value;

use kahlo_core::error::ErrorCategory;
use kahlo_core::ErrorCode;

/// One tool-call error, matching §7's stable envelope shape.
#[derive(Debug, Clone, Serialize)]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
    pub tool: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub suggestion: String,
}

impl ToolError {
    pub fn new(tool: &str, code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            retryable: code.retryable(),
            suggestion: code.default_suggestion().to_string(),
            code,
            message,
            tool: tool.to_string(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = suggestion.into();
        self
    }

    /// §7 "Backend modules raise their typed errors... the facade maps
    /// them 1:1 into the envelope": the single conversion point from any
    /// `ErrorCategory` impl (`TargetManagerError`, `JobControllerError`,
    /// `DraftError`, `ModuleStoreError`, `ArtifactStoreError`,
    /// `EventPipelineError`, `AdbError`) into a [`ToolError`].
    pub fn from_backend<E>(tool: &str, err: &E) -> Self
    where
        E: ErrorCategory + std::fmt::Display,
    {
        Self::new(tool, err.code(), err.to_string())
    }
}

/// Every facade operation returns this; `ok_envelope`/`err_envelope` do the
/// final `{ok, ...}` flattening for wire transport (`kahlod serve`).
pub type ToolResult<T> = Result<T, ToolError>;

/// Flatten a successful payload into `{ok:true, <data fields>}`. Scalar or
/// array payloads that don't serialize to a JSON object are nested under
/// `"result"` instead, since there is nothing to flatten them into.
pub fn ok_envelope<T: Serialize>(data: &T) -> Value {
    let value = serde_json::to_value(data).unwrap_or(Value::Null);
    match value {
        Value::Object(mut map) => {
            map.insert("ok".to_string(), Value::Bool(true));
            Value::Object(map)
        }
        other => serde_json::json!({ "ok": true, "result": other }),
    }
}

pub fn err_envelope(error: &ToolError) -> Value {
    serde_json::json!({ "ok": false, "error": error })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_mirrors_error_code() {
        let e = ToolError::new("targets.status", ErrorCode::Timeout, "device_resolve timed out");
        assert!(e.retryable);
        let e = ToolError::new("targets.status", ErrorCode::NotFound, "no such target");
        assert!(!e.retryable);
    }

    #[test]
    fn ok_envelope_flattens_object_payloads() {
        #[derive(Serialize)]
        struct Payload {
            target_id: String,
        }
        let v = ok_envelope(&Payload { target_id: "targ-x".into() });
        assert_eq!(v["ok"], true);
        assert_eq!(v["target_id"], "targ-x");
    }

    #[test]
    fn ok_envelope_nests_non_object_payloads_under_result() {
        let v = ok_envelope(&42u32);
        assert_eq!(v["ok"], true);
        assert_eq!(v["result"], 42);
    }

    #[test]
    fn err_envelope_shape() {
        let e = ToolError::new("jobs.status", ErrorCode::NotFound, "job not found");
        let v = err_envelope(&e);
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "NOT_FOUND");
        assert_eq!(v["error"]["retryable"], false);
        assert!(v["error"]["suggestion"].is_string());
    }
}
