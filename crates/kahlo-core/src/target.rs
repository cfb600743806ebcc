// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! `Target` entity (§3): an instrumented process plus its host bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::TargetId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Attach,
    Spawn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gating {
    None,
    Spawn,
    Child,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Pending,
    Running,
    Dead,
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    NotInjected,
    Ready,
    Crashed,
    Reinjecting,
}

crate::simple_display! {
    Mode { Attach => "attach", Spawn => "spawn" }
}
crate::simple_display! {
    Gating { None => "none", Spawn => "spawn", Child => "child" }
}
crate::simple_display! {
    TargetState { Pending => "pending", Running => "running", Dead => "dead", Detached => "detached" }
}
crate::simple_display! {
    AgentState { NotInjected => "not_injected", Ready => "ready", Crashed => "crashed", Reinjecting => "reinjecting" }
}

/// Diagnostic record of the most recent session detach (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastDetach {
    pub reason: String,
    pub crash: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub target_id: TargetId,
    pub device_id: String,
    pub package: String,
    pub pid: Option<u32>,
    pub mode: Mode,
    pub gating: Gating,
    pub state: TargetState,
    pub agent_state: AgentState,
    pub parent_target_id: Option<TargetId>,
    pub agent_error: Option<String>,
    pub last_detach: Option<LastDetach>,
    pub resume_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Target {
    pub fn new(
        target_id: TargetId,
        device_id: impl Into<String>,
        package: impl Into<String>,
        mode: Mode,
        gating: Gating,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            target_id,
            device_id: device_id.into(),
            package: package.into(),
            pid: None,
            mode,
            gating,
            state: TargetState::Pending,
            agent_state: AgentState::NotInjected,
            parent_target_id: None,
            agent_error: None,
            last_detach: None,
            resume_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Matches the identity tuple used by `ensureTarget` idempotency (§4.7):
    /// same device/package/mode/gating, currently running.
    pub fn matches_ensure(
        &self,
        device_id: &str,
        package: &str,
        mode: Mode,
        gating: Gating,
    ) -> bool {
        self.device_id == device_id
            && self.package == package
            && self.mode == mode
            && self.gating == gating
            && self.state == TargetState::Running
    }

    pub fn is_detached(&self) -> bool {
        self.state == TargetState::Detached
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn test_fixture(target_id: TargetId) -> Self {
        Self::new(target_id, "emu-1", "com.example.app", Mode::Attach, Gating::None, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_ensure_requires_running_state() {
        let mut t = Target::test_fixture(TargetId::new());
        assert!(!t.matches_ensure("emu-1", "com.example.app", Mode::Attach, Gating::None));
        t.state = TargetState::Running;
        assert!(t.matches_ensure("emu-1", "com.example.app", Mode::Attach, Gating::None));
        assert!(!t.matches_ensure("emu-1", "com.example.app", Mode::Spawn, Gating::None));
    }

    #[test]
    fn display_strings_match_spec_wire_values() {
        assert_eq!(Mode::Attach.to_string(), "attach");
        assert_eq!(Gating::Child.to_string(), "child");
        assert_eq!(TargetState::Detached.to_string(), "detached");
        assert_eq!(AgentState::NotInjected.to_string(), "not_injected");
    }
}
