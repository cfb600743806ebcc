// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! `Event` entity (§3): one immutable telemetry record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{EventId, JobId, TargetId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

crate::simple_display! {
    EventLevel { Debug => "debug", Info => "info", Warn => "warn", Error => "error" }
}

impl EventLevel {
    /// Coerce a free-form string into a valid level, defaulting to `info`
    /// per §4.2 ingestion rules.
    pub fn coerce(raw: Option<&str>) -> Self {
        match raw {
            Some("debug") => EventLevel::Debug,
            Some("info") => EventLevel::Info,
            Some("warn") => EventLevel::Warn,
            Some("error") => EventLevel::Error,
            _ => EventLevel::Info,
        }
    }
}

/// Eviction marker attached to an event that follows missed entries (§4.2/§8).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dropped {
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub ts: DateTime<Utc>,
    pub target_id: TargetId,
    pub pid: Option<u32>,
    pub job_id: JobId,
    pub kind: String,
    pub level: EventLevel,
    pub correlation_id: Option<String>,
    pub payload: Value,
    pub dropped: Option<Dropped>,
}

impl Event {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: EventId,
        ts: DateTime<Utc>,
        target_id: TargetId,
        pid: Option<u32>,
        job_id: JobId,
        kind: impl Into<String>,
        level: EventLevel,
        correlation_id: Option<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_id,
            ts,
            target_id,
            pid,
            job_id,
            kind: kind.into(),
            level,
            correlation_id,
            payload,
            dropped: None,
        }
    }

    /// Merge an eviction-accounted drop count into this event's marker,
    /// per §4.2's "combinational rule": intrinsic marker + missed-in-ring.
    pub fn add_dropped(&mut self, extra: u64) {
        if extra == 0 {
            return;
        }
        let count = self.dropped.map(|d| d.count).unwrap_or(0) + extra;
        self.dropped = Some(Dropped { count });
    }
}

/// §4.2 filters: `kind` exact match, `level` exact match, combined via AND.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kind: Option<String>,
    pub level: Option<EventLevel>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kind) = &self.kind {
            if &event.kind != kind {
                return false;
            }
        }
        if let Some(level) = self.level {
            if event.level != level {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> Event {
        Event::new(
            EventId::new(),
            Utc::now(),
            TargetId::new(),
            Some(123),
            JobId::new(),
            "job.started",
            EventLevel::Info,
            None,
            Value::Null,
        )
    }

    #[test]
    fn coerce_defaults_unknown_to_info() {
        assert_eq!(EventLevel::coerce(Some("bogus")), EventLevel::Info);
        assert_eq!(EventLevel::coerce(None), EventLevel::Info);
        assert_eq!(EventLevel::coerce(Some("error")), EventLevel::Error);
    }

    #[test]
    fn add_dropped_sums_with_existing_marker() {
        let mut ev = fixture();
        ev.dropped = Some(Dropped { count: 2 });
        ev.add_dropped(3);
        assert_eq!(ev.dropped.unwrap().count, 5);
    }

    #[test]
    fn add_dropped_zero_is_noop() {
        let mut ev = fixture();
        ev.add_dropped(0);
        assert!(ev.dropped.is_none());
    }

    #[test]
    fn filter_matches_kind_and_level_with_and() {
        let ev = fixture();
        let f = EventFilter { kind: Some("job.started".into()), level: Some(EventLevel::Info) };
        assert!(f.matches(&ev));
        let f2 = EventFilter { kind: Some("job.started".into()), level: Some(EventLevel::Error) };
        assert!(!f2.matches(&ev));
    }
}
