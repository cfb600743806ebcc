// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! `Module bundle` entity (§3): an immutable versioned bundle.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{DraftId, JobId};

/// Version bump strategy for module promotion (§4.5).
///
/// `version_strategy="exact"` is referenced in the tool schemas this system
/// replaces but has no corresponding argument; per the resolved open
/// question (SPEC_FULL §7), this enum intentionally has no `Exact` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStrategy {
    Patch,
    Minor,
    Major,
}

impl VersionStrategy {
    /// Bump `previous` per strategy, or start at `0.1.0` (minor)/`0.0.1`
    /// (patch) when there is no previous version. A first `major` bump with
    /// no prior version also starts at `0.1.0`, matching the spec's
    /// "starts at 0.1.0/0.0.1 when none exists" (major has no distinct
    /// first-version rule of its own).
    pub fn next(self, previous: Option<&Version>) -> Version {
        match (self, previous) {
            (VersionStrategy::Patch, None) => Version::new(0, 0, 1),
            (_, None) => Version::new(0, 1, 0),
            (VersionStrategy::Patch, Some(v)) => Version::new(v.major, v.minor, v.patch + 1),
            (VersionStrategy::Minor, Some(v)) => Version::new(v.major, v.minor + 1, 0),
            (VersionStrategy::Major, Some(v)) => Version::new(v.major + 1, 0, 0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleBundle {
    pub name: String,
    pub version: Version,
    pub source: String,
    pub manifest: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub derived_from_job_id: Option<JobId>,
    pub derived_from_draft_id: Option<DraftId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_with_no_previous_starts_at_0_0_1() {
        assert_eq!(VersionStrategy::Patch.next(None), Version::new(0, 0, 1));
    }

    #[test]
    fn minor_and_major_with_no_previous_start_at_0_1_0() {
        assert_eq!(VersionStrategy::Minor.next(None), Version::new(0, 1, 0));
        assert_eq!(VersionStrategy::Major.next(None), Version::new(0, 1, 0));
    }

    #[test]
    fn bumps_from_existing_version() {
        let v = Version::new(1, 2, 3);
        assert_eq!(VersionStrategy::Patch.next(Some(&v)), Version::new(1, 2, 4));
        assert_eq!(VersionStrategy::Minor.next(Some(&v)), Version::new(1, 3, 0));
        assert_eq!(VersionStrategy::Major.next(Some(&v)), Version::new(2, 0, 0));
    }
}
