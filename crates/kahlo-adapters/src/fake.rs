// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! In-memory fakes for [`crate::device::DeviceBridge`] and
//! [`crate::session::Session`]/[`crate::session::ScriptHandle`], gated
//! behind `test-support`. Generalizes the teacher's zero-sized
//! `NoOpSessionAdapter` into a stateful fake capable of simulating
//! spawn/attach/crash for the engine's integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::device::{
    AdbError, ChildAddedCallback, ChildAddedEvent, DeviceBridge, DeviceInfo, ProcessInfo, SpawnAddedCallback,
    SpawnAddedEvent,
};
use crate::session::{
    DestroyCallback, DestroyReason, DetachCallback, DetachReason, MessageCallback, ScriptHandle,
    Session, SessionError,
};

struct DeviceState {
    processes: Vec<ProcessInfo>,
    gating_enabled: bool,
    next_spawn_pid: u32,
    spawn_cb: Option<SpawnAddedCallback>,
    child_cb: Option<ChildAddedCallback>,
}

impl DeviceState {
    fn new() -> Self {
        Self { processes: Vec::new(), gating_enabled: false, next_spawn_pid: 9000, spawn_cb: None, child_cb: None }
    }
}

/// Stateful fake debug-bridge. Seed processes with [`FakeDeviceBridge::seed_process`]
/// and spawned pids come from an internal counter starting at 9000.
#[derive(Clone, Default)]
pub struct FakeDeviceBridge {
    devices: Arc<Mutex<HashMap<String, DeviceState>>>,
    killed: Arc<Mutex<Vec<(String, u32)>>>,
}

impl FakeDeviceBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_process(&self, device_id: &str, pid: u32, name: &str) {
        let mut devices = self.devices.lock();
        let state = devices.entry(device_id.to_string()).or_insert_with(DeviceState::new);
        state.processes.push(ProcessInfo { pid, name: name.to_string() });
    }

    pub fn is_gating_enabled(&self, device_id: &str) -> bool {
        self.devices.lock().get(device_id).map(|s| s.gating_enabled).unwrap_or(false)
    }

    pub fn killed_pids(&self) -> Vec<(String, u32)> {
        self.killed.lock().clone()
    }

    pub fn is_pid_alive(&self, device_id: &str, pid: u32) -> bool {
        !self.killed.lock().iter().any(|(d, p)| d == device_id && *p == pid)
    }

    /// Drive a gated spawn notification into whatever handler is currently
    /// registered for `device_id` via [`DeviceBridge::on_spawn_added`].
    pub fn simulate_spawn_added(&self, device_id: &str, pid: u32, identifier: &str) {
        let cb = self.devices.lock().get(device_id).and_then(|s| s.spawn_cb.clone());
        if let Some(cb) = cb {
            cb(SpawnAddedEvent { pid, identifier: identifier.to_string() });
        }
    }

    /// Drive a gated child notification into whatever handler is currently
    /// registered for `device_id` via [`DeviceBridge::on_child_added`].
    pub fn simulate_child_added(&self, device_id: &str, parent_pid: u32, pid: u32, identifier: &str) {
        let cb = self.devices.lock().get(device_id).and_then(|s| s.child_cb.clone());
        if let Some(cb) = cb {
            cb(ChildAddedEvent { parent_pid, pid, identifier: identifier.to_string() });
        }
    }
}

#[async_trait]
impl DeviceBridge for FakeDeviceBridge {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, AdbError> {
        Ok(self
            .devices
            .lock()
            .keys()
            .map(|id| DeviceInfo { device_id: id.clone(), name: id.clone(), kind: "fake".into() })
            .collect())
    }

    async fn get_device(&self, device_id: &str) -> Result<DeviceInfo, AdbError> {
        if self.devices.lock().contains_key(device_id) {
            Ok(DeviceInfo {
                device_id: device_id.to_string(),
                name: device_id.to_string(),
                kind: "fake".into(),
            })
        } else {
            Err(AdbError::DeviceNotFound(device_id.to_string()))
        }
    }

    async fn list_processes(&self, device_id: &str) -> Result<Vec<ProcessInfo>, AdbError> {
        Ok(self.devices.lock().get(device_id).map(|s| s.processes.clone()).unwrap_or_default())
    }

    async fn spawn(&self, device_id: &str, package: &str) -> Result<u32, AdbError> {
        let mut devices = self.devices.lock();
        let state = devices.entry(device_id.to_string()).or_insert_with(DeviceState::new);
        let pid = state.next_spawn_pid;
        state.next_spawn_pid += 1;
        state.processes.push(ProcessInfo { pid, name: package.to_string() });
        Ok(pid)
    }

    async fn resume(&self, _device_id: &str, _pid: u32) -> Result<(), AdbError> {
        Ok(())
    }

    async fn kill(&self, device_id: &str, pid: u32) -> Result<(), AdbError> {
        self.killed.lock().push((device_id.to_string(), pid));
        Ok(())
    }

    async fn attach(&self, device_id: &str, pid: u32) -> Result<Box<dyn Session>, AdbError> {
        let devices = self.devices.lock();
        let state = devices.get(device_id).ok_or_else(|| AdbError::DeviceNotFound(device_id.to_string()))?;
        if !state.processes.iter().any(|p| p.pid == pid) {
            return Err(AdbError::ProcessNotFound(pid.to_string()));
        }
        Ok(Box::new(FakeSession::new(pid)))
    }

    async fn enable_spawn_gating(&self, device_id: &str) -> Result<(), AdbError> {
        let mut devices = self.devices.lock();
        let state = devices.entry(device_id.to_string()).or_insert_with(DeviceState::new);
        state.gating_enabled = true;
        Ok(())
    }

    async fn disable_spawn_gating(&self, device_id: &str) -> Result<(), AdbError> {
        if let Some(state) = self.devices.lock().get_mut(device_id) {
            state.gating_enabled = false;
        }
        Ok(())
    }

    fn on_spawn_added(&self, device_id: &str, callback: Option<SpawnAddedCallback>) {
        let mut devices = self.devices.lock();
        let state = devices.entry(device_id.to_string()).or_insert_with(DeviceState::new);
        state.spawn_cb = callback;
    }

    fn on_child_added(&self, device_id: &str, callback: Option<ChildAddedCallback>) {
        let mut devices = self.devices.lock();
        let state = devices.entry(device_id.to_string()).or_insert_with(DeviceState::new);
        state.child_cb = callback;
    }
}

/// Script handle that answers RPCs from a programmable responder. Defaults
/// respond `ping` with `"pong"` and everything else with `null`.
pub struct FakeScriptHandle {
    loaded: Arc<Mutex<bool>>,
    destroyed_cb: Arc<Mutex<Option<DestroyCallback>>>,
    message_cb: Arc<Mutex<Option<MessageCallback>>>,
    responder: Arc<dyn Fn(&str, Value) -> Result<Value, SessionError> + Send + Sync>,
}

impl FakeScriptHandle {
    pub fn new() -> Self {
        Self {
            loaded: Arc::new(Mutex::new(false)),
            destroyed_cb: Arc::new(Mutex::new(None)),
            message_cb: Arc::new(Mutex::new(None)),
            responder: Arc::new(|method, _params| {
                if method == "ping" {
                    Ok(Value::String("pong".to_string()))
                } else {
                    Ok(Value::Null)
                }
            }),
        }
    }

    pub fn with_responder(
        responder: impl Fn(&str, Value) -> Result<Value, SessionError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            loaded: Arc::new(Mutex::new(false)),
            destroyed_cb: Arc::new(Mutex::new(None)),
            message_cb: Arc::new(Mutex::new(None)),
            responder: Arc::new(responder),
        }
    }

    /// Simulate the runtime emitting an inbound message for this script,
    /// optionally with a binary side-channel payload.
    pub fn emit_message(&self, message: Value, data: Option<Vec<u8>>) {
        if let Some(cb) = self.message_cb.lock().as_ref() {
            cb(message, data);
        }
    }

    /// Simulate the script crashing or otherwise terminating unexpectedly.
    pub fn simulate_destroyed(&self, reason: &str) {
        *self.loaded.lock() = false;
        if let Some(cb) = self.destroyed_cb.lock().as_ref() {
            cb(DestroyReason { reason: reason.to_string() });
        }
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded.lock()
    }
}

impl Default for FakeScriptHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScriptHandle for FakeScriptHandle {
    async fn load(&self) -> Result<(), SessionError> {
        *self.loaded.lock() = true;
        Ok(())
    }

    async fn unload(&self) -> Result<(), SessionError> {
        *self.loaded.lock() = false;
        Ok(())
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, SessionError> {
        if !*self.loaded.lock() {
            return Err(SessionError::ScriptNotLoaded);
        }
        (self.responder)(method, params)
    }

    fn on_destroyed(&self, callback: DestroyCallback) {
        *self.destroyed_cb.lock() = Some(callback);
    }

    fn on_message(&self, callback: MessageCallback) {
        *self.message_cb.lock() = Some(callback);
    }
}

/// Stateful fake session. `create_script` always succeeds and returns a
/// fresh [`FakeScriptHandle`] with the default ping/pong responder; use
/// [`FakeSession::next_script_responder`] to program the next handle
/// returned.
pub struct FakeSession {
    pid: u32,
    detached: Arc<Mutex<bool>>,
    detached_cb: Arc<Mutex<Option<DetachCallback>>>,
    next_responder:
        Arc<Mutex<Option<Arc<dyn Fn(&str, Value) -> Result<Value, SessionError> + Send + Sync>>>>,
    scripts_created: Arc<AtomicU32>,
}

impl FakeSession {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            detached: Arc::new(Mutex::new(false)),
            detached_cb: Arc::new(Mutex::new(None)),
            next_responder: Arc::new(Mutex::new(None)),
            scripts_created: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn next_script_responder(
        &self,
        responder: impl Fn(&str, Value) -> Result<Value, SessionError> + Send + Sync + 'static,
    ) {
        *self.next_responder.lock() = Some(Arc::new(responder));
    }

    pub fn scripts_created(&self) -> u32 {
        self.scripts_created.load(Ordering::SeqCst)
    }

    /// Simulate the runtime reporting this session detached (crash/remote
    /// disconnect the host did not initiate).
    pub fn simulate_detached(&self, reason: &str, crash: Option<bool>) {
        *self.detached.lock() = true;
        if let Some(cb) = self.detached_cb.lock().as_ref() {
            cb(DetachReason { reason: reason.to_string(), crash });
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_detached(&self) -> bool {
        *self.detached.lock()
    }

    async fn create_script(&self, _source: &str) -> Result<Box<dyn ScriptHandle>, SessionError> {
        self.scripts_created.fetch_add(1, Ordering::SeqCst);
        let handle = match self.next_responder.lock().take() {
            Some(responder) => FakeScriptHandle::with_responder(move |m, p| responder(m, p)),
            None => FakeScriptHandle::new(),
        };
        Ok(Box::new(handle))
    }

    async fn detach(&self) -> Result<(), SessionError> {
        *self.detached.lock() = true;
        Ok(())
    }

    fn on_detached(&self, callback: DetachCallback) {
        *self.detached_cb.lock() = Some(callback);
    }
}
