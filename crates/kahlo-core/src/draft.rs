// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! `Draft` entity (§3): a mutable source snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{DraftId, JobId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub draft_id: DraftId,
    pub name: Option<String>,
    pub source: String,
    pub manifest: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub derived_from_job_id: Option<JobId>,
}

impl Draft {
    pub fn new(
        draft_id: DraftId,
        name: Option<String>,
        source: impl Into<String>,
        manifest: Option<Value>,
        derived_from_job_id: Option<JobId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            draft_id,
            name,
            source: source.into(),
            manifest,
            created_at: now,
            updated_at: now,
            derived_from_job_id,
        }
    }
}
