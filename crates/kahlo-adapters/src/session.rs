// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! `Session`: host-side handle to an attached process (§1 "black box
//! reachable via a bidirectional RPC + message channel", glossary
//! "Session"). Carries script-creation primitives and reports detach.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use std::sync::Arc;

use kahlo_core::ErrorCode;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is already detached")]
    AlreadyDetached,
    #[error("script is not loaded")]
    ScriptNotLoaded,
    #[error("rpc call to {0:?} timed out")]
    Timeout(String),
    #[error("rpc call to {0:?} failed: {1}")]
    RpcFailed(String, String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl kahlo_core::error::ErrorCategory for SessionError {
    fn code(&self) -> ErrorCode {
        match self {
            SessionError::AlreadyDetached | SessionError::ScriptNotLoaded => ErrorCode::Unavailable,
            SessionError::Timeout(_) => ErrorCode::Timeout,
            SessionError::RpcFailed(_, _) | SessionError::Transport(_) => ErrorCode::Unavailable,
        }
    }
}

/// Reason a session reported itself detached (expected, i.e. host-initiated
/// via `detach`, or a crash observed by the runtime).
#[derive(Debug, Clone)]
pub struct DetachReason {
    pub reason: String,
    pub crash: Option<bool>,
}

/// Reason a script (coordinator or job) was destroyed.
#[derive(Debug, Clone)]
pub struct DestroyReason {
    pub reason: String,
}

pub type DetachCallback = Arc<dyn Fn(DetachReason) + Send + Sync>;
pub type DestroyCallback = Arc<dyn Fn(DestroyReason) + Send + Sync>;
/// Inbound-message handler. The second argument carries the binary
/// side-channel (§6 "a message may carry exactly `size_bytes` bytes
/// alongside it") when the runtime delivered one; `None` otherwise.
pub type MessageCallback = Arc<dyn Fn(Value, Option<Vec<u8>>) + Send + Sync>;

/// A host-side handle to an attached process.
#[async_trait]
pub trait Session: Send + Sync {
    fn pid(&self) -> u32;
    fn is_detached(&self) -> bool;

    /// Create (but do not load) a script from source. Every orchestrator
    /// injection and every per-job script goes through this one primitive
    /// (§4.7, §9 "exactly one script per job").
    async fn create_script(&self, source: &str) -> Result<Box<dyn ScriptHandle>, SessionError>;

    /// Detach the session. Idempotent: detaching an already-detached
    /// session is a no-op success.
    async fn detach(&self) -> Result<(), SessionError>;

    /// Register the handler invoked when the runtime reports this session
    /// detached for a reason the host did not initiate (crash, remote
    /// disconnect). At most one handler is meaningful; later registrations
    /// replace earlier ones.
    fn on_detached(&self, callback: DetachCallback);
}

/// A script loaded into a session: either the single coordinator
/// ("orchestrator") per target, or one per job.
#[async_trait]
pub trait ScriptHandle: Send + Sync {
    async fn load(&self) -> Result<(), SessionError>;

    /// Unload the script. Idempotent (§4.7 `unloadJobScript`): a second
    /// call on an already-unloaded script succeeds silently.
    async fn unload(&self) -> Result<(), SessionError>;

    /// Bidirectional RPC call (ping, getSnapshot, startJob, getStatus; §6).
    async fn call(&self, method: &str, params: Value) -> Result<Value, SessionError>;

    /// Register the handler invoked when the script terminates for a
    /// reason the host didn't cause (§4.6 "script-destroyed callback").
    fn on_destroyed(&self, callback: DestroyCallback);

    /// Register the handler invoked for every inbound message (§4.2
    /// `recordAgentMessage` ingestion).
    fn on_message(&self, callback: MessageCallback);
}
