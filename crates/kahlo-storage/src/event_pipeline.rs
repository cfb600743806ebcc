// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! Per-target/job ring-buffer event streams (§4.2): bounded push with
//! eviction accounting, append-only jsonl persistence, agent-message
//! ingestion, and cursor-paginated fetch.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write as _;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use kahlo_adapters::agent::{ArtifactFields, HeartbeatBody, KahloMessage, OuterEnvelope};
use kahlo_core::{Cursor, Event, EventFilter, EventId, EventLevel, JobId, Scope, TargetId};

use crate::paths::DataPaths;

/// §4.2 "target stream (capacity 5000)".
pub const TARGET_STREAM_CAPACITY: usize = 5000;
/// §4.2 "job stream (capacity 2000)".
pub const JOB_STREAM_CAPACITY: usize = 2000;
/// §4.2 `fetchEvents` default `limit`.
pub const EVENT_FETCH_DEFAULT_LIMIT: usize = 200;
/// §4.2 `fetchEvents` `limit` cap.
pub const EVENT_FETCH_MAX_LIMIT: usize = 5000;

/// The spec's own defaults (above), settable from `kahlo.toml`'s `[limits]`
/// section (`kahlo-daemon`'s `Config::limits`) so a deployment can size
/// streams and pagination without a rebuild.
#[derive(Debug, Clone, Copy)]
pub struct EventPipelineLimits {
    pub target_stream_capacity: usize,
    pub job_stream_capacity: usize,
    pub event_fetch_default_limit: usize,
    pub event_fetch_max_limit: usize,
}

impl Default for EventPipelineLimits {
    fn default() -> Self {
        Self {
            target_stream_capacity: TARGET_STREAM_CAPACITY,
            job_stream_capacity: JOB_STREAM_CAPACITY,
            event_fetch_default_limit: EVENT_FETCH_DEFAULT_LIMIT,
            event_fetch_max_limit: EVENT_FETCH_MAX_LIMIT,
        }
    }
}

/// One bounded ring buffer with a monotonic sequence counter and an
/// eviction accumulator (§4.2 "Streams").
struct Stream {
    capacity: usize,
    seq: u64,
    pending_dropped: u64,
    ring: VecDeque<(u64, Event)>,
}

impl Stream {
    fn new(capacity: usize) -> Self {
        Self { capacity, seq: 0, pending_dropped: 0, ring: VecDeque::new() }
    }

    /// `pushStream`: assigns the next `seq`, attaches and resets any
    /// outstanding drop marker, inserts, then evicts the oldest entry if
    /// over capacity. Returns the event as stored (post drop-marker merge).
    fn push(&mut self, mut event: Event) -> Event {
        self.seq += 1;
        if self.pending_dropped > 0 {
            event.add_dropped(self.pending_dropped);
            self.pending_dropped = 0;
        }
        self.ring.push_back((self.seq, event.clone()));
        if self.ring.len() > self.capacity {
            self.ring.pop_front();
            self.pending_dropped += 1;
        }
        event
    }

    /// Selection + missed-event accounting per §4.2 "Cursor contract".
    /// Returns the selected events and the `seq` the next cursor should
    /// carry (the last selected `seq`, or `since_seq` unchanged).
    fn fetch(&self, since_seq: u64, limit: usize, filters: &EventFilter) -> (Vec<Event>, u64) {
        let mut selected: Vec<(u64, Event)> = Vec::new();
        for (seq, ev) in self.ring.iter() {
            if *seq <= since_seq {
                continue;
            }
            if !filters.matches(ev) {
                continue;
            }
            selected.push((*seq, ev.clone()));
            if selected.len() >= limit {
                break;
            }
        }
        if let Some(min_seq) = self.ring.front().map(|(s, _)| *s) {
            if since_seq < min_seq.saturating_sub(1) {
                let missed = min_seq - 1 - since_seq;
                if let Some((_, first)) = selected.first_mut() {
                    first.add_dropped(missed);
                }
            }
        }
        let next_seq = selected.last().map(|(s, _)| *s).unwrap_or(since_seq);
        (selected.into_iter().map(|(_, ev)| ev).collect(), next_seq)
    }
}

struct TargetPipelineState {
    target_stream: Stream,
    job_streams: HashMap<JobId, Stream>,
    writer: Option<File>,
    stream_errored: bool,
    dropped_due_to_error: u64,
}

impl TargetPipelineState {
    fn new(target_stream_capacity: usize) -> Self {
        Self {
            target_stream: Stream::new(target_stream_capacity),
            job_streams: HashMap::new(),
            writer: None,
            stream_errored: false,
            dropped_due_to_error: 0,
        }
    }
}

/// The scope a [`EventPipeline::fetch_events`] call addresses. §4.2
/// requires exactly one of `target_id`/`job_id`; that exclusivity is
/// enforced by this being an enum rather than two `Option` fields.
#[derive(Debug, Clone)]
pub enum FetchScope {
    Target(TargetId),
    Job(JobId),
}

impl FetchScope {
    fn tag(&self) -> Scope {
        match self {
            FetchScope::Target(_) => Scope::Target,
            FetchScope::Job(_) => Scope::Job,
        }
    }

    fn id(&self) -> String {
        match self {
            FetchScope::Target(t) => t.as_str().to_string(),
            FetchScope::Job(j) => j.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub events: Vec<Event>,
    pub next_cursor: Cursor,
}

/// Outcome of [`EventPipeline::ingest`]; the artifact variant is returned
/// unstored so the caller (`kahlo-engine`'s target manager) can hand it to
/// the artifact store and then push the resulting `artifact.stored` /
/// `artifact.store_failed` / `artifact.invalid` event back through
/// [`EventPipeline::push_event`].
#[derive(Debug, Clone)]
pub enum Ingested {
    Ignored,
    Event,
    Artifact(ArtifactFields, Option<Vec<u8>>, chrono::DateTime<Utc>),
    Heartbeat(HeartbeatBody),
}

/// Owns every target's event streams and their jsonl persistence.
pub struct EventPipeline {
    paths: DataPaths,
    limits: EventPipelineLimits,
    state: Mutex<HashMap<TargetId, TargetPipelineState>>,
}

impl EventPipeline {
    pub fn new(paths: DataPaths) -> Self {
        Self::with_limits(paths, EventPipelineLimits::default())
    }

    pub fn with_limits(paths: DataPaths, limits: EventPipelineLimits) -> Self {
        Self { paths, limits, state: Mutex::new(HashMap::new()) }
    }

    /// Parse an inbound agent message and, for `event` bodies, push it to
    /// both the target and job streams (§4.2 "Ingestion"). `artifact` and
    /// `heartbeat` bodies are parsed but not pushed here.
    pub fn ingest(
        &self,
        target_id: TargetId,
        pid: Option<u32>,
        raw: &Value,
        data: Option<Vec<u8>>,
    ) -> Ingested {
        let Some(inner) = OuterEnvelope::parse(raw) else {
            return Ingested::Ignored;
        };
        let message: KahloMessage = match serde_json::from_value(inner) {
            Ok(m) => m,
            Err(_) => return Ingested::Ignored,
        };
        match message {
            KahloMessage::Event(body) => {
                let ts = body.ts.parse().unwrap_or_else(|_| Utc::now());
                let job_id = JobId::from_string(&body.job_id);
                let level = EventLevel::coerce(body.level.as_deref());
                let event = Event::new(
                    EventId::new(),
                    ts,
                    target_id,
                    pid,
                    job_id,
                    body.kind,
                    level,
                    body.correlation_id,
                    body.payload,
                );
                self.push_event(target_id, job_id, event);
                Ingested::Event
            }
            KahloMessage::Artifact(body) => {
                let ts = body.ts.parse().unwrap_or_else(|_| Utc::now());
                Ingested::Artifact(body.artifact, data, ts)
            }
            KahloMessage::Heartbeat(body) => Ingested::Heartbeat(body),
        }
    }

    /// Push an event (ingested or host-synthesized, e.g. `target.died`,
    /// `job.crashed`) to the target's and job's streams, persisting the
    /// target-stream copy to `events.jsonl`. Returns the event as stored in
    /// the target stream (post drop-marker merge).
    pub fn push_event(&self, target_id: TargetId, job_id: JobId, event: Event) -> Event {
        let mut state = self.state.lock();
        let entry =
            state.entry(target_id).or_insert_with(|| TargetPipelineState::new(self.limits.target_stream_capacity));
        let stored = entry.target_stream.push(event.clone());
        Self::persist(&self.paths, target_id, entry, &stored);
        entry
            .job_streams
            .entry(job_id)
            .or_insert_with(|| Stream::new(self.limits.job_stream_capacity))
            .push(event);
        stored
    }

    fn persist(paths: &DataPaths, target_id: TargetId, entry: &mut TargetPipelineState, event: &Event) {
        if entry.stream_errored {
            entry.dropped_due_to_error += 1;
            return;
        }
        if entry.writer.is_none() {
            let path = paths.events_jsonl(Utc::now(), &target_id);
            if let Some(parent) = path.parent() {
                if std::fs::create_dir_all(parent).is_err() {
                    entry.stream_errored = true;
                    entry.dropped_due_to_error += 1;
                    return;
                }
            }
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(f) => entry.writer = Some(f),
                Err(_) => {
                    entry.stream_errored = true;
                    entry.dropped_due_to_error += 1;
                    return;
                }
            }
        }
        let Some(writer) = entry.writer.as_mut() else {
            return;
        };
        let line = match serde_json::to_string(event) {
            Ok(s) => s,
            Err(_) => {
                entry.stream_errored = true;
                entry.dropped_due_to_error += 1;
                return;
            }
        };
        if writeln!(writer, "{line}").is_err() {
            entry.stream_errored = true;
            entry.dropped_due_to_error += 1;
        }
    }

    /// `fetchEvents` (§4.2 "Cursor contract").
    pub fn fetch_events(
        &self,
        scope: FetchScope,
        cursor: Option<Cursor>,
        limit: Option<usize>,
        filters: EventFilter,
    ) -> FetchResult {
        let tag = scope.tag();
        let id = scope.id();
        let limit =
            limit.unwrap_or(self.limits.event_fetch_default_limit).clamp(1, self.limits.event_fetch_max_limit);

        let state = self.state.lock();
        let current_seq = || match &scope {
            FetchScope::Target(t) => state.get(t).map(|s| s.target_stream.seq).unwrap_or(0),
            FetchScope::Job(j) => state.values().find_map(|s| s.job_streams.get(j)).map(|s| s.seq).unwrap_or(0),
        };

        let since_seq = match &cursor {
            Some(c) if c.scope == tag && c.id == id => c.seq,
            Some(_) => {
                // Mismatched cursor: never serve mismatched history, advance
                // to the stream's current position instead.
                return FetchResult { events: Vec::new(), next_cursor: Cursor::new(tag, id, current_seq()) };
            }
            None => 0,
        };

        let stream = match &scope {
            FetchScope::Target(t) => state.get(t).map(|s| &s.target_stream),
            FetchScope::Job(j) => state.values().find_map(|s| s.job_streams.get(j)),
        };
        let Some(stream) = stream else {
            return FetchResult { events: Vec::new(), next_cursor: Cursor::new(tag, id, 0) };
        };
        let (events, next_seq) = stream.fetch(since_seq, limit, &filters);
        FetchResult { events, next_cursor: Cursor::new(tag, id, next_seq) }
    }

    /// `closeTargetEventPipeline`: best-effort flush, then drop the target's
    /// in-memory state. Artifact-store closing is the caller's
    /// responsibility (kahlo-engine's target manager calls both).
    pub fn close_target(&self, target_id: &TargetId) {
        let mut state = self.state.lock();
        if let Some(mut entry) = state.remove(target_id) {
            if !entry.stream_errored {
                if let Some(writer) = entry.writer.as_mut() {
                    let _ = writer.flush();
                }
            }
        }
    }

    pub fn stream_errored(&self, target_id: &TargetId) -> bool {
        self.state.lock().get(target_id).map(|s| s.stream_errored).unwrap_or(false)
    }

    pub fn dropped_due_to_error(&self, target_id: &TargetId) -> u64 {
        self.state.lock().get(target_id).map(|s| s.dropped_due_to_error).unwrap_or(0)
    }
}
