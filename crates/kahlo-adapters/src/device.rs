// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! `DeviceBridge`: the platform debug-bridge contract (§1 "peripheral;
//! only their interfaces to the core are specified"). This crate does not
//! implement the wire protocol, only the boundary the rest of the workspace
//! programs against.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use kahlo_core::ErrorCode;

use crate::session::Session;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

/// Emitted by the bridge when a gated process is spawned (§4.7
/// "Spawn/child gating"). `identifier` is matched against registered
/// parent-target package prefixes.
#[derive(Debug, Clone)]
pub struct SpawnAddedEvent {
    pub pid: u32,
    pub identifier: String,
}

/// Emitted by the bridge when a gated child process appears under an
/// already-instrumented parent.
#[derive(Debug, Clone)]
pub struct ChildAddedEvent {
    pub parent_pid: u32,
    pub pid: u32,
    pub identifier: String,
}

pub type SpawnAddedCallback = Arc<dyn Fn(SpawnAddedEvent) + Send + Sync>;
pub type ChildAddedCallback = Arc<dyn Fn(ChildAddedEvent) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Error)]
pub enum AdbError {
    #[error("device {0:?} not found")]
    DeviceNotFound(String),
    #[error("process {0:?} not found on device")]
    ProcessNotFound(String),
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("operation timed out")]
    Timeout,
    #[error("internal adb bridge error: {0}")]
    Internal(String),
}

impl kahlo_core::error::ErrorCategory for AdbError {
    fn code(&self) -> ErrorCode {
        match self {
            AdbError::DeviceNotFound(_) | AdbError::ProcessNotFound(_) => ErrorCode::NotFound,
            AdbError::Unreachable(_) => ErrorCode::Unavailable,
            AdbError::Timeout => ErrorCode::Timeout,
            AdbError::Internal(_) => ErrorCode::Internal,
        }
    }
}

/// Device discovery and process-level control, reached over the platform
/// debug bridge. Implementations are thin pass-throughs (§6); only
/// `resolve_pid`'s selection policy lives in `kahlo-engine`.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, AdbError>;
    async fn get_device(&self, device_id: &str) -> Result<DeviceInfo, AdbError>;
    async fn list_processes(&self, device_id: &str) -> Result<Vec<ProcessInfo>, AdbError>;
    async fn spawn(&self, device_id: &str, package: &str) -> Result<u32, AdbError>;
    async fn resume(&self, device_id: &str, pid: u32) -> Result<(), AdbError>;
    async fn kill(&self, device_id: &str, pid: u32) -> Result<(), AdbError>;

    /// Attach to a live pid, returning a session handle (§4.7 "Attach path").
    async fn attach(&self, device_id: &str, pid: u32) -> Result<Box<dyn Session>, AdbError>;

    /// Enable device-wide spawn gating (§4.7). Idempotent while already enabled.
    async fn enable_spawn_gating(&self, device_id: &str) -> Result<(), AdbError>;
    /// Disable device-wide spawn gating (§4.7). Best-effort; idempotent.
    async fn disable_spawn_gating(&self, device_id: &str) -> Result<(), AdbError>;

    /// Register (or, passing `None`, clear) the handler invoked when a
    /// gated spawn appears on this device.
    fn on_spawn_added(&self, device_id: &str, callback: Option<SpawnAddedCallback>);
    /// Register (or, passing `None`, clear) the handler invoked when a
    /// gated child process appears on this device.
    fn on_child_added(&self, device_id: &str, callback: Option<ChildAddedCallback>);
}
