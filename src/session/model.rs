//! The session data model: [`SessionEvent`], [`MessageFrame`],
//! [`SessionStats`] and [`SessionRecord`] (spec.md §3).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::serde_support::{duration_nanos, duration_nanos_opt, percentiles_nanos};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Connect,
    Disconnect,
    Login,
    Heartbeat,
    MessageSend,
    MessageReceive,
    Error,
    Reconnect,
    Close,
}

impl EventType {
    /// Housekeeping event types are omitted from [`crate::session::recorder::Recorder::export_json`]'s
    /// business-facing view (spec.md §4.4, §6).
    pub fn is_housekeeping(&self) -> bool {
        matches!(
            self,
            EventType::Heartbeat | EventType::Login | EventType::Disconnect
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseCode {
    Normal,
    GoingAway,
    ProtocolError,
    Abnormal,
    Other(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

/// One protocol-level occurrence in a session's timeline.
///
/// `id` is assigned by the recorder as `"event_" + N` where `N` is the
/// 1-based insertion index (spec.md invariant I1) — never constructed by
/// hand outside of `Recorder::record_event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub client_time: DateTime<Utc>,
    pub server_time: DateTime<Utc>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "duration_nanos_opt",
        default
    )]
    pub duration: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opcode: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_code: Option<CloseCode>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl SessionEvent {
    /// The correlation key used to pair a `MESSAGE_SEND` with its matching
    /// `MESSAGE_RECEIVE` (spec.md §3): the explicit `message_id` in
    /// metadata, falling back to `"seq_" + sequence_num`.
    pub fn correlation_key(&self) -> Option<String> {
        if let Some(Value::String(id)) = self.metadata.get("message_id") {
            return Some(id.clone());
        }
        self.metadata
            .get("sequence_num")
            .and_then(Value::as_u64)
            .map(|seq| format!("seq_{seq}"))
    }
}

/// A single framed message observed on the wire, tagged with direction and
/// the server push sequence (if any).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFrame {
    #[serde(with = "crate::session::serde_support::base64_bytes")]
    pub raw_data: Vec<u8>,
    pub opcode: u16,
    #[serde(with = "crate::session::serde_support::base64_bytes")]
    pub body: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub sequence_num: u64,
}

/// Latency percentiles computed from the session's recorded latency set.
/// Keyed by integer percentile (50/90/95/99 per spec.md §3).
pub type LatencyPercentiles = HashMap<u8, Duration>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_events: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnect_count: u64,
    pub error_count: u64,
    #[serde(default, with = "duration_nanos")]
    pub avg_latency: Duration,
    #[serde(default, with = "duration_nanos")]
    pub min_latency: Duration,
    #[serde(default, with = "duration_nanos")]
    pub max_latency: Duration,
    #[serde(default, with = "percentiles_nanos")]
    pub latency_percentiles: LatencyPercentiles,
}

/// A frozen, replayable, analyzable record of one session's lifetime
/// (spec.md §3). Produced by [`crate::session::recorder::Recorder`];
/// consumed by [`crate::replay::Replayer`] and
/// [`crate::analyzer::TimelineAnalyzer`]. Never mutated after `Stop()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub events: Vec<SessionEvent>,
    pub frames: Vec<MessageFrame>,
    pub stats: SessionStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(metadata: HashMap<String, Value>) -> SessionEvent {
        SessionEvent {
            id: "event_1".into(),
            event_type: EventType::MessageSend,
            timestamp: Utc::now(),
            client_time: Utc::now(),
            server_time: Utc::now(),
            duration: None,
            opcode: Some(10),
            message_size: Some(4),
            message_hash: None,
            error: None,
            close_code: None,
            metadata,
        }
    }

    #[test]
    fn correlation_key_prefers_explicit_message_id() {
        let mut meta = HashMap::new();
        meta.insert("message_id".into(), Value::String("abc".into()));
        meta.insert("sequence_num".into(), Value::from(7));
        assert_eq!(sample_event(meta).correlation_key().as_deref(), Some("abc"));
    }

    #[test]
    fn correlation_key_falls_back_to_sequence() {
        let mut meta = HashMap::new();
        meta.insert("sequence_num".into(), Value::from(7));
        assert_eq!(
            sample_event(meta).correlation_key().as_deref(),
            Some("seq_7")
        );
    }

    #[test]
    fn housekeeping_classification() {
        assert!(EventType::Heartbeat.is_housekeeping());
        assert!(EventType::Login.is_housekeeping());
        assert!(EventType::Disconnect.is_housekeeping());
        assert!(!EventType::MessageSend.is_housekeeping());
        assert!(!EventType::Connect.is_housekeeping());
    }
}
