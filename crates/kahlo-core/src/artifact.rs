// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! `Artifact` entity (§3): a persisted binary payload emitted by a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::id::{ArtifactId, JobId, TargetId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    FileDump,
    MemoryDump,
    Trace,
    PcapLike,
    Custom,
}

crate::simple_display! {
    ArtifactType {
        FileDump => "file_dump",
        MemoryDump => "memory_dump",
        Trace => "trace",
        PcapLike => "pcap_like",
        Custom => "custom",
    }
}

impl ArtifactType {
    pub const ALL: [ArtifactType; 5] = [
        ArtifactType::FileDump,
        ArtifactType::MemoryDump,
        ArtifactType::Trace,
        ArtifactType::PcapLike,
        ArtifactType::Custom,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.to_string() == s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: ArtifactId,
    pub target_id: TargetId,
    pub job_id: JobId,
    pub ts: DateTime<Utc>,
    pub artifact_type: ArtifactType,
    pub size_bytes: u64,
    pub stored_size_bytes: u64,
    pub sha256: String,
    pub mime: Option<String>,
    pub name: Option<String>,
    pub metadata: Option<Value>,
    pub storage_ref: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_display() {
        for t in ArtifactType::ALL {
            assert_eq!(ArtifactType::parse(&t.to_string()), Some(t));
        }
        assert_eq!(ArtifactType::parse("bogus"), None);
    }
}
