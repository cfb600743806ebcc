// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! Adapter traits for the "black box" external collaborators named in §1:
//! the platform debug bridge ([`device::DeviceBridge`]) and the in-process
//! agent/job-script session contracts ([`session::Session`],
//! [`session::ScriptHandle`]), plus typed RPC wrappers ([`agent`]).
//!
//! Behind `test-support`, [`fake`] provides stateful in-memory
//! implementations for `kahlo-engine`'s integration tests.

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod agent;
pub mod device;
pub mod session;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

pub use agent::{AgentHandle, JobScriptHandle, KahloMessage, OuterEnvelope};
pub use device::{
    AdbError, ChildAddedCallback, ChildAddedEvent, DeviceBridge, DeviceInfo, ProcessInfo, SpawnAddedCallback,
    SpawnAddedEvent,
};
pub use session::{DestroyReason, DetachReason, ScriptHandle, Session, SessionError};
