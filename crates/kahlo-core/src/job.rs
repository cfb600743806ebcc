// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! `Job` entity (§3): one isolated instrumentation script and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{JobId, TargetId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Oneshot,
    Interactive,
    Daemon,
}

crate::simple_display! {
    JobType { Oneshot => "oneshot", Interactive => "interactive", Daemon => "daemon" }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

crate::simple_display! {
    JobState {
        Queued => "queued",
        Starting => "starting",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl JobState {
    /// Terminal states per §3: transitions are unidirectional toward this set.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

/// Where a job's `module_source` came from (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleProvenance {
    Source,
    DraftId(String),
    ModuleRef(String),
    Bootstrap,
}

/// Health classification for daemon jobs (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

crate::simple_display! {
    JobHealth { Unknown => "unknown", Healthy => "healthy", Unhealthy => "unhealthy" }
}

/// Heartbeat staleness threshold for daemon job health (§4.6).
pub const HEARTBEAT_STALE_AFTER_SECS: i64 = 30;

/// `calculateJobHealth(type, state, heartbeat)` from §4.6.
pub fn calculate_job_health(
    job_type: JobType,
    state: JobState,
    heartbeat: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> JobHealth {
    if job_type != JobType::Daemon {
        return JobHealth::Unknown;
    }
    if state != JobState::Running {
        return JobHealth::Unknown;
    }
    match heartbeat {
        None => JobHealth::Unhealthy,
        Some(hb) => {
            let age = now.signed_duration_since(hb).num_seconds();
            if age <= HEARTBEAT_STALE_AFTER_SECS {
                JobHealth::Healthy
            } else {
                JobHealth::Unhealthy
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub events_emitted: u64,
    pub hooks_installed: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub target_id: TargetId,
    pub job_type: JobType,
    pub module_source: String,
    pub module_provenance: ModuleProvenance,
    pub is_bootstrap: bool,
    pub state: JobState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metrics: Option<JobMetrics>,
    pub error: Option<JobError>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: JobId,
        target_id: TargetId,
        job_type: JobType,
        module_source: impl Into<String>,
        module_provenance: ModuleProvenance,
        is_bootstrap: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            target_id,
            job_type,
            module_source: module_source.into(),
            module_provenance,
            is_bootstrap,
            state: JobState::Queued,
            last_heartbeat: None,
            metrics: None,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn health(&self, now: DateTime<Utc>) -> JobHealth {
        calculate_job_health(self.job_type, self.state, self.last_heartbeat, now)
    }

    /// First-writer-wins metrics capture (§4.6 "Final-metrics capture").
    pub fn adopt_metrics_if_unset(&mut self, metrics: JobMetrics) {
        if self.metrics.is_none() {
            self.metrics = Some(metrics);
        }
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn test_fixture(job_id: JobId, target_id: TargetId) -> Self {
        Self::new(
            job_id,
            target_id,
            JobType::Oneshot,
            "module.exports={start:()=>42}",
            ModuleProvenance::Source,
            false,
            Utc::now(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn non_daemon_jobs_are_always_unknown_health() {
        let now = Utc::now();
        assert_eq!(
            calculate_job_health(JobType::Oneshot, JobState::Running, Some(now), now),
            JobHealth::Unknown
        );
    }

    #[test]
    fn daemon_not_running_is_unknown() {
        let now = Utc::now();
        assert_eq!(
            calculate_job_health(JobType::Daemon, JobState::Queued, Some(now), now),
            JobHealth::Unknown
        );
    }

    #[test]
    fn daemon_running_no_heartbeat_is_unhealthy() {
        let now = Utc::now();
        assert_eq!(
            calculate_job_health(JobType::Daemon, JobState::Running, None, now),
            JobHealth::Unhealthy
        );
    }

    #[test]
    fn daemon_running_fresh_heartbeat_is_healthy() {
        let now = Utc::now();
        let hb = now - ChronoDuration::seconds(30);
        assert_eq!(
            calculate_job_health(JobType::Daemon, JobState::Running, Some(hb), now),
            JobHealth::Healthy
        );
    }

    #[test]
    fn daemon_running_stale_heartbeat_is_unhealthy() {
        let now = Utc::now();
        let hb = now - ChronoDuration::seconds(31);
        assert_eq!(
            calculate_job_health(JobType::Daemon, JobState::Running, Some(hb), now),
            JobHealth::Unhealthy
        );
    }

    #[test]
    fn metrics_first_writer_wins() {
        let mut job = Job::test_fixture(JobId::new(), TargetId::new());
        job.adopt_metrics_if_unset(JobMetrics { events_emitted: 1, hooks_installed: 2, errors: 0 });
        job.adopt_metrics_if_unset(JobMetrics { events_emitted: 99, hooks_installed: 99, errors: 99 });
        assert_eq!(job.metrics.unwrap().events_emitted, 1);
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Starting.is_terminal());
    }
}
