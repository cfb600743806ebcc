// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! Spawn/child gating (§4.7): ref-counted, per-device subscription state.
//! The actual enable/disable/adopt logic lives on [`crate::target_manager::TargetManager`]
//! since it needs session/attach/inject access; this module holds the data
//! shape and the pure identifier-matching rule so the matching policy is
//! testable without a device mock.

use std::collections::HashMap;

use kahlo_core::TargetId;

/// Per-device spawn-gating subscription state, mutated only under a
/// caller's target lock (§5 "Spawn-gating per device").
#[derive(Default)]
pub struct DeviceGatingState {
    pub ref_count: u32,
    /// Registered parents, keyed by target id, mapped to the package
    /// prefix used to match a spawned/child process's `identifier`.
    pub parents: HashMap<TargetId, String>,
}

/// Match a spawned/child process `identifier` against registered parent
/// package prefixes. Exact match wins; otherwise the first prefix match.
/// `None` means "resume as an unrelated orphan" (§9 "unmatched spawns must
/// be resumed immediately").
pub fn match_parent(parents: &HashMap<TargetId, String>, identifier: &str) -> Option<TargetId> {
    if let Some((target_id, _)) = parents.iter().find(|(_, prefix)| prefix.as_str() == identifier) {
        return Some(*target_id);
    }
    parents.iter().find(|(_, prefix)| identifier.starts_with(prefix.as_str())).map(|(target_id, _)| *target_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins_over_prefix() {
        let mut parents = HashMap::new();
        let exact = TargetId::new();
        let prefix_only = TargetId::new();
        parents.insert(exact, "com.example.app".to_string());
        parents.insert(prefix_only, "com.example".to_string());
        assert_eq!(match_parent(&parents, "com.example.app"), Some(exact));
    }

    #[test]
    fn falls_back_to_prefix_match() {
        let mut parents = HashMap::new();
        let parent = TargetId::new();
        parents.insert(parent, "com.example".to_string());
        assert_eq!(match_parent(&parents, "com.example.worker"), Some(parent));
    }

    #[test]
    fn no_match_returns_none() {
        let mut parents = HashMap::new();
        parents.insert(TargetId::new(), "com.other".to_string());
        assert_eq!(match_parent(&parents, "com.example.app"), None);
    }
}
