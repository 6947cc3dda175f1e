//! The append-only, concurrency-safe event/frame log (spec.md §4.4).
//!
//! Mirrors the teacher's locking discipline: a dedicated `Mutex` guards the
//! append-ordered `Vec`s while counters are lock-free atomics, the same split
//! `client/reply.rs` uses between its `Mutex`-guarded registry and the
//! `RwLock`-guarded timeout heap.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::session::model::{
    CloseCode, Direction, EventType, MessageFrame, SessionEvent, SessionRecord, SessionStats,
};

/// Computes the real percentiles from the stored latency set (spec.md §9:
/// the source's placeholder implementation — all percentiles pinned to max,
/// p50 pinned to avg — is a flagged bug, not a behavior to keep).
fn percentiles(mut samples: Vec<Duration>, points: &[u8]) -> HashMap<u8, Duration> {
    if samples.is_empty() {
        return HashMap::new();
    }
    samples.sort_unstable();
    points
        .iter()
        .map(|&p| {
            let idx = ((p as usize) * samples.len() / 100).min(samples.len() - 1);
            (p, samples[idx])
        })
        .collect()
}

struct LatencyAccumulator {
    sum_nanos: AtomicU64,
    count: AtomicU64,
    min_nanos: AtomicI64,
    max_nanos: AtomicI64,
    samples: Mutex<Vec<Duration>>,
}

impl Default for LatencyAccumulator {
    fn default() -> Self {
        Self {
            sum_nanos: AtomicU64::new(0),
            count: AtomicU64::new(0),
            min_nanos: AtomicI64::new(i64::MAX),
            max_nanos: AtomicI64::new(0),
            samples: Mutex::new(Vec::new()),
        }
    }
}

impl LatencyAccumulator {
    fn record(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        let nanos = d.as_nanos().min(i64::MAX as u128) as i64;
        self.sum_nanos.fetch_add(nanos as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut min = self.min_nanos.load(Ordering::Relaxed);
        while nanos < min {
            match self.min_nanos.compare_exchange_weak(
                min,
                nanos,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => min = observed,
            }
        }

        let mut max = self.max_nanos.load(Ordering::Relaxed);
        while nanos > max {
            match self.max_nanos.compare_exchange_weak(
                max,
                nanos,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => max = observed,
            }
        }

        self.samples
            .lock()
            .expect("latency sample lock never poisoned by a panicking holder")
            .push(d);
    }

    fn avg(&self) -> Duration {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.sum_nanos.load(Ordering::Relaxed) / count)
    }

    fn min(&self) -> Duration {
        let min = self.min_nanos.load(Ordering::Relaxed);
        if min == i64::MAX { Duration::ZERO } else { Duration::from_nanos(min as u64) }
    }

    fn max(&self) -> Duration {
        Duration::from_nanos(self.max_nanos.load(Ordering::Relaxed) as u64)
    }

    fn percentiles(&self) -> HashMap<u8, Duration> {
        let samples = self
            .samples
            .lock()
            .expect("latency sample lock never poisoned by a panicking holder")
            .clone();
        percentiles(samples, &[50, 90, 95, 99])
    }
}

/// Append-only event/frame log with atomic counters, per spec.md §4.4.
///
/// `RecordEvent`/`RecordMessage`/etc. never fail and never block on I/O —
/// only [`Recorder::export_json`] surfaces a serialization error.
pub struct Recorder {
    session_id: String,
    start_time: chrono::DateTime<Utc>,
    active: AtomicBool,
    next_event_id: AtomicU64,
    events: Mutex<Vec<SessionEvent>>,
    frames: Mutex<Vec<MessageFrame>>,

    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    reconnect_count: AtomicU64,
    error_count: AtomicU64,
    latency: LatencyAccumulator,

    finalized_stats: Mutex<Option<SessionStats>>,
    end_time: Mutex<Option<chrono::DateTime<Utc>>>,
}

impl Recorder {
    /// Construct a recorder and immediately append the initial `CONNECT`
    /// event (spec.md §3 Lifecycles).
    pub fn new(session_id: impl Into<String>) -> Self {
        let recorder = Self {
            session_id: session_id.into(),
            start_time: Utc::now(),
            active: AtomicBool::new(true),
            next_event_id: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            reconnect_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            latency: LatencyAccumulator::default(),
            finalized_stats: Mutex::new(None),
            end_time: Mutex::new(None),
        };
        recorder.record_event(EventType::Connect, HashMap::new());
        recorder
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Append a [`SessionEvent`]. Silent no-op once the session is closed
    /// (spec.md §3 invariant: "after closed, further record* calls are
    /// silent no-ops").
    pub fn record_event(&self, event_type: EventType, metadata: HashMap<String, Value>) {
        if !self.is_active() {
            return;
        }

        // The id counter advances before the lock is taken; the append
        // itself happens under the lock, so (id order) == (list position)
        // per spec.md §5.
        let id_num = self.next_event_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let event = SessionEvent {
            id: format!("event_{id_num}"),
            event_type,
            timestamp: now,
            client_time: now,
            server_time: now,
            duration: None,
            opcode: None,
            message_size: None,
            message_hash: None,
            error: None,
            close_code: None,
            metadata,
        };

        {
            let mut events = self
                .events
                .lock()
                .expect("event log lock never poisoned by a panicking holder");
            events.push(event);
        }

        match event_type {
            EventType::Reconnect => {
                self.reconnect_count.fetch_add(1, Ordering::Relaxed);
            }
            EventType::Error => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Record a `MessageFrame` plus the corresponding `MESSAGE_SEND` /
    /// `MESSAGE_RECEIVE` event (spec.md §4.4).
    pub fn record_message(
        &self,
        direction: Direction,
        raw: Vec<u8>,
        opcode: u16,
        body: Vec<u8>,
        sequence_num: u64,
    ) {
        if !self.is_active() {
            return;
        }

        let size = raw.len() as u32;
        let frame = MessageFrame {
            raw_data: raw,
            opcode,
            body: body.clone(),
            timestamp: Utc::now(),
            direction,
            sequence_num,
        };

        {
            let mut frames = self
                .frames
                .lock()
                .expect("frame log lock never poisoned by a panicking holder");
            frames.push(frame);
        }

        let mut metadata = HashMap::new();
        metadata.insert("opcode".into(), Value::from(opcode));
        metadata.insert("message_size".into(), Value::from(size));
        metadata.insert("body_size".into(), Value::from(body.len() as u64));
        metadata.insert("sequence_num".into(), Value::from(sequence_num));
        metadata.insert(
            "direction".into(),
            Value::from(match direction {
                Direction::Send => "send",
                Direction::Receive => "receive",
            }),
        );

        let event_type = match direction {
            Direction::Send => EventType::MessageSend,
            Direction::Receive => EventType::MessageReceive,
        };
        self.record_event(event_type, metadata);

        match direction {
            Direction::Send => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
            }
            Direction::Receive => {
                self.messages_received.fetch_add(1, Ordering::Relaxed);
                self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
            }
        }
    }

    /// Update the running latency accumulators. Non-positive/invalid
    /// samples are ignored (spec.md §4.4).
    pub fn record_latency(&self, d: Duration) {
        if !self.is_active() {
            return;
        }
        self.latency.record(d);
    }

    pub fn record_reconnect(&self) {
        self.record_event(EventType::Reconnect, HashMap::new());
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let mut metadata = HashMap::new();
        let message = message.into();
        metadata.insert("error".into(), Value::String(message.clone()));
        if !self.is_active() {
            return;
        }
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let id_num = self.next_event_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let event = SessionEvent {
            id: format!("event_{id_num}"),
            event_type: EventType::Error,
            timestamp: now,
            client_time: now,
            server_time: now,
            duration: None,
            opcode: None,
            message_size: None,
            message_hash: None,
            error: Some(message),
            close_code: None,
            metadata,
        };
        self.events
            .lock()
            .expect("event log lock never poisoned by a panicking holder")
            .push(event);
    }

    pub fn record_close(&self, close_code: Option<CloseCode>) {
        let mut metadata = HashMap::new();
        if let Some(code) = close_code {
            metadata.insert(
                "close_code".into(),
                serde_json::to_value(code).unwrap_or(Value::Null),
            );
        }
        self.record_event(EventType::Disconnect, metadata);
        self.stop();
    }

    /// CAS active -> inactive (idempotent), cancel, and finalize stats:
    /// duration, counters, percentiles, terminal `DISCONNECT` (spec.md
    /// §4.4). Concurrency note: the two directions are kept separate here —
    /// unlike the flagged source bug that doubles a single counter into
    /// both `messages_sent` and `messages_received` (spec.md §9).
    pub fn stop(&self) {
        if self
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let end = Utc::now();
        *self
            .end_time
            .lock()
            .expect("end-time lock never poisoned by a panicking holder") = Some(end);

        // Re-activate briefly is not needed: append the terminal event
        // directly, bypassing the now-false active flag.
        let id_num = self.next_event_id.fetch_add(1, Ordering::SeqCst) + 1;
        let terminal = SessionEvent {
            id: format!("event_{id_num}"),
            event_type: EventType::Disconnect,
            timestamp: end,
            client_time: end,
            server_time: end,
            duration: None,
            opcode: None,
            message_size: None,
            message_hash: None,
            error: None,
            close_code: None,
            metadata: HashMap::new(),
        };
        let total_events = {
            let mut events = self
                .events
                .lock()
                .expect("event log lock never poisoned by a panicking holder");
            events.push(terminal);
            events.len() as u64
        };

        let stats = SessionStats {
            total_events,
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            avg_latency: self.latency.avg(),
            min_latency: self.latency.min(),
            max_latency: self.latency.max(),
            latency_percentiles: self.latency.percentiles(),
        };
        *self
            .finalized_stats
            .lock()
            .expect("stats lock never poisoned by a panicking holder") = Some(stats);
    }

    /// Deep-copy the current record (frozen if stopped, a live snapshot
    /// otherwise). Read-only source for replay/analysis.
    pub fn get_session(&self) -> SessionRecord {
        let events = self
            .events
            .lock()
            .expect("event log lock never poisoned by a panicking holder")
            .clone();
        let frames = self
            .frames
            .lock()
            .expect("frame log lock never poisoned by a panicking holder")
            .clone();
        let stats = self
            .finalized_stats
            .lock()
            .expect("stats lock never poisoned by a panicking holder")
            .clone()
            .unwrap_or_else(|| SessionStats {
                total_events: events.len() as u64,
                messages_sent: self.messages_sent.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
                bytes_received: self.bytes_received.load(Ordering::Relaxed),
                reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
                error_count: self.error_count.load(Ordering::Relaxed),
                avg_latency: self.latency.avg(),
                min_latency: self.latency.min(),
                max_latency: self.latency.max(),
                latency_percentiles: self.latency.percentiles(),
            });
        let end_time = *self
            .end_time
            .lock()
            .expect("end-time lock never poisoned by a panicking holder");

        SessionRecord {
            id: self.session_id.clone(),
            start_time: self.start_time,
            end_time,
            events,
            frames,
            stats,
        }
    }

    /// Serialize the business-facing export view: housekeeping event types
    /// filtered out (spec.md §4.4, §6). The internal unfiltered record stays
    /// reachable via [`Recorder::get_session`].
    pub fn export_json(&self) -> Result<String, crate::error::SerializationError> {
        let mut record = self.get_session();
        record
            .events
            .retain(|event| !event.event_type.is_housekeeping());
        serde_json::to_string(&record).map_err(|e| crate::error::SerializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_connect_event_is_event_1() {
        let recorder = Recorder::new("s1");
        let session = recorder.get_session();
        assert_eq!(session.events.len(), 1);
        assert_eq!(session.events[0].id, "event_1");
        assert_eq!(session.events[0].event_type, EventType::Connect);
    }

    #[test]
    fn event_ids_are_dense_and_monotonic() {
        let recorder = Recorder::new("s1");
        for _ in 0..10 {
            recorder.record_event(EventType::Heartbeat, HashMap::new());
        }
        let session = recorder.get_session();
        for (i, event) in session.events.iter().enumerate() {
            assert_eq!(event.id, format!("event_{}", i + 1));
        }
    }

    #[test]
    fn stop_is_idempotent_and_appends_one_terminal_disconnect() {
        let recorder = Recorder::new("s1");
        recorder.stop();
        recorder.stop();
        let session = recorder.get_session();
        let disconnects = session
            .events
            .iter()
            .filter(|e| e.event_type == EventType::Disconnect)
            .count();
        assert_eq!(disconnects, 1);
    }

    #[test]
    fn record_calls_after_stop_are_silent_no_ops() {
        let recorder = Recorder::new("s1");
        recorder.stop();
        let before = recorder.get_session().events.len();
        recorder.record_event(EventType::Heartbeat, HashMap::new());
        recorder.record_message(Direction::Send, vec![1, 2], 1, vec![2], 0);
        let after = recorder.get_session().events.len();
        assert_eq!(before, after);
    }

    #[test]
    fn stats_total_events_matches_event_count_after_stop() {
        let recorder = Recorder::new("s1");
        recorder.record_event(EventType::Heartbeat, HashMap::new());
        recorder.record_event(EventType::Heartbeat, HashMap::new());
        recorder.stop();
        let session = recorder.get_session();
        assert_eq!(session.stats.total_events, session.events.len() as u64);
    }

    #[test]
    fn messages_sent_and_received_are_tracked_independently() {
        let recorder = Recorder::new("s1");
        recorder.record_message(Direction::Send, vec![1, 2], 1, vec![2], 0);
        recorder.record_message(Direction::Send, vec![1, 2], 1, vec![2], 0);
        recorder.record_message(Direction::Receive, vec![1, 2], 1, vec![2], 0);
        recorder.stop();
        let session = recorder.get_session();
        assert_eq!(session.stats.messages_sent, 2);
        assert_eq!(session.stats.messages_received, 1);
    }

    #[test]
    fn latency_percentiles_are_real_not_placeholder() {
        let recorder = Recorder::new("s1");
        for _ in 0..80 {
            recorder.record_latency(Duration::from_millis(10));
        }
        for _ in 0..15 {
            recorder.record_latency(Duration::from_millis(100));
        }
        for _ in 0..5 {
            recorder.record_latency(Duration::from_millis(500));
        }
        recorder.stop();
        let session = recorder.get_session();
        assert_eq!(
            session.stats.latency_percentiles[&95],
            Duration::from_millis(100)
        );
        assert_eq!(
            session.stats.latency_percentiles[&99],
            Duration::from_millis(500)
        );
        // p50 isn't pinned to the average (the flagged source bug).
        assert_ne!(session.stats.latency_percentiles[&50], session.stats.avg_latency);
    }

    #[test]
    fn non_positive_latency_samples_are_ignored() {
        let recorder = Recorder::new("s1");
        recorder.record_latency(Duration::ZERO);
        recorder.stop();
        let session = recorder.get_session();
        assert_eq!(session.stats.min_latency, Duration::ZERO);
        assert!(session.stats.latency_percentiles.is_empty());
    }

    #[test]
    fn export_json_omits_housekeeping_events() {
        let recorder = Recorder::new("s1");
        recorder.record_event(EventType::Login, HashMap::new());
        recorder.record_event(EventType::Heartbeat, HashMap::new());
        recorder.record_message(Direction::Send, vec![1], 1, vec![], 0);
        recorder.record_message(Direction::Receive, vec![1], 1, vec![], 0);
        recorder.record_event(EventType::Heartbeat, HashMap::new());
        recorder.stop();

        let exported = recorder.export_json().unwrap();
        let parsed: SessionRecord = serde_json::from_str(&exported).unwrap();
        let types: Vec<_> = parsed.events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![EventType::MessageSend, EventType::MessageReceive]
        );

        // The internal view still has everything.
        let full = recorder.get_session();
        assert!(full.events.len() > parsed.events.len());
    }

    #[test]
    fn concurrent_record_event_yields_dense_unique_ids() {
        use std::sync::Arc;
        use std::thread;

        let recorder = Arc::new(Recorder::new("s1"));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let recorder = Arc::clone(&recorder);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    recorder.record_event(EventType::Heartbeat, HashMap::new());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let session = recorder.get_session();
        assert_eq!(session.events.len(), 8 * 50 + 1);
        let mut ids: Vec<u64> = session
            .events
            .iter()
            .map(|e| e.id.trim_start_matches("event_").parse().unwrap())
            .collect();
        ids.sort_unstable();
        let expected: Vec<u64> = (1..=ids.len() as u64).collect();
        assert_eq!(ids, expected);
    }
}
