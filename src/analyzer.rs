//! Pairs `MESSAGE_SEND`/`MESSAGE_RECEIVE` events into message flows and
//! derives latency, jitter, throughput, packet-loss and connection-stability
//! metrics from a frozen [`SessionRecord`] (spec.md §4.6).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::session::{EventType, SessionEvent, SessionRecord};

/// A `MESSAGE_SEND` ages into `Timeout` if analysis happens this long after
/// it was sent with no matching receive (spec.md §4.6).
pub const FLOW_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Sent,
    Received,
    Timeout,
    Error,
}

#[derive(Debug, Clone)]
pub struct MessageFlow {
    pub correlation_key: String,
    pub opcode: Option<u16>,
    pub send_time: Option<DateTime<Utc>>,
    pub receive_time: Option<DateTime<Utc>>,
    pub latency: Option<Duration>,
    pub status: FlowStatus,
}

/// Build the flow table. `now` is the analysis instant used to age `Sent`
/// flows into `Timeout` — passed explicitly rather than read from the clock
/// so callers can analyze a record deterministically relative to any
/// reference point.
pub fn pair_message_flows(record: &SessionRecord, now: DateTime<Utc>) -> Vec<MessageFlow> {
    let mut flows: HashMap<String, MessageFlow> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut errored_keys: HashSet<String> = HashSet::new();

    for event in &record.events {
        match event.event_type {
            EventType::MessageSend => {
                let Some(key) = event.correlation_key() else {
                    continue;
                };
                if !flows.contains_key(&key) {
                    order.push(key.clone());
                    flows.insert(key.clone(), new_flow(key, event));
                }
            }
            EventType::MessageReceive => {
                let Some(key) = event.correlation_key() else {
                    continue;
                };
                flows
                    .entry(key.clone())
                    .and_modify(|flow| apply_receive(flow, event))
                    .or_insert_with(|| {
                        order.push(key.clone());
                        let mut flow = new_flow(key, event);
                        apply_receive(&mut flow, event);
                        flow
                    });
            }
            EventType::Error => {
                if let Some(key) = event.correlation_key() {
                    errored_keys.insert(key);
                }
            }
            _ => {}
        }
    }

    for key in &errored_keys {
        if let Some(flow) = flows.get_mut(key)
            && flow.status == FlowStatus::Sent
        {
            flow.status = FlowStatus::Error;
        }
    }

    for flow in flows.values_mut() {
        if flow.status == FlowStatus::Sent
            && let Some(send) = flow.send_time
            && let Ok(age) = (now - send).to_std()
            && age >= FLOW_TIMEOUT
        {
            flow.status = FlowStatus::Timeout;
        }
    }

    order.into_iter().filter_map(|k| flows.remove(&k)).collect()
}

fn new_flow(key: String, event: &SessionEvent) -> MessageFlow {
    MessageFlow {
        correlation_key: key,
        opcode: event.opcode,
        send_time: None,
        receive_time: None,
        latency: None,
        status: FlowStatus::Sent,
    }
}

fn apply_receive(flow: &mut MessageFlow, event: &SessionEvent) {
    flow.receive_time = Some(event.timestamp);
    if let Some(send) = flow.send_time
        && let Ok(latency) = (event.timestamp - send).to_std()
    {
        flow.latency = Some(latency);
    }
    flow.status = FlowStatus::Received;
}

#[derive(Debug, Clone, Default)]
pub struct LatencyMetrics {
    pub min: Duration,
    pub avg: Duration,
    pub max: Duration,
    pub percentiles: HashMap<u8, Duration>,
    pub jitter: Duration,
}

/// Computes the real percentiles (spec.md §9 flags the source's placeholder
/// — all percentiles pinned to max, p50 to avg — as a bug, not behavior to
/// reproduce) by sorting and indexing at `⌊p·N/100⌋` (spec.md §4.6).
pub fn percentile_at(sorted_or_unsorted: &mut [Duration], p: u8) -> Option<Duration> {
    if sorted_or_unsorted.is_empty() {
        return None;
    }
    sorted_or_unsorted.sort_unstable();
    let idx = ((p as usize) * sorted_or_unsorted.len() / 100).min(sorted_or_unsorted.len() - 1);
    Some(sorted_or_unsorted[idx])
}

pub fn latency_metrics(flows: &[MessageFlow]) -> LatencyMetrics {
    // Jitter is defined over latencies in time order (receive order), not
    // sorted order — it measures consecutive variance, not dispersion.
    let mut time_ordered: Vec<(DateTime<Utc>, Duration)> = flows
        .iter()
        .filter_map(|f| Some((f.receive_time?, f.latency?)))
        .collect();
    time_ordered.sort_by_key(|(t, _)| *t);
    let latencies: Vec<Duration> = time_ordered.iter().map(|(_, d)| *d).collect();

    if latencies.is_empty() {
        return LatencyMetrics::default();
    }

    let min = *latencies.iter().min().expect("non-empty");
    let max = *latencies.iter().max().expect("non-empty");
    let avg = latencies.iter().sum::<Duration>() / latencies.len() as u32;

    let mut sortable = latencies.clone();
    let percentiles = [50u8, 90, 95, 99]
        .into_iter()
        .filter_map(|p| percentile_at(&mut sortable, p).map(|d| (p, d)))
        .collect();

    let jitter = if latencies.len() < 2 {
        Duration::ZERO
    } else {
        let total: Duration = latencies
            .windows(2)
            .map(|w| w[1].abs_diff(w[0]))
            .sum();
        total / (latencies.len() as u32 - 1)
    };

    LatencyMetrics {
        min,
        avg,
        max,
        percentiles,
        jitter,
    }
}

/// Transport-failure rate only — timeouts are reported separately via
/// [`FlowStatus::Timeout`] counts (spec.md §4.6).
pub fn packet_loss_rate(flows: &[MessageFlow]) -> f64 {
    if flows.is_empty() {
        return 0.0;
    }
    let failed = flows.iter().filter(|f| f.status == FlowStatus::Error).count();
    failed as f64 / flows.len() as f64
}

/// `successful_messages / span`, where span is first-send-to-last-receive,
/// not wall-clock session duration (spec.md §4.6: using wall-clock would
/// dilute the rate with idle tails).
pub fn throughput(flows: &[MessageFlow]) -> f64 {
    let successful: Vec<&MessageFlow> = flows
        .iter()
        .filter(|f| f.status == FlowStatus::Received)
        .collect();
    if successful.is_empty() {
        return 0.0;
    }
    let first = successful.iter().filter_map(|f| f.send_time).min();
    let last = successful.iter().filter_map(|f| f.receive_time).max();
    match (first, last) {
        (Some(first), Some(last)) if last > first => {
            let span = (last - first).to_std().unwrap_or(Duration::ZERO);
            if span.is_zero() {
                successful.len() as f64
            } else {
                successful.len() as f64 / span.as_secs_f64()
            }
        }
        _ => successful.len() as f64,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionStability {
    pub samples: Vec<Duration>,
    pub min: Duration,
    pub median: Duration,
    pub max: Duration,
    pub avg: Duration,
    pub total: Duration,
    pub reconnect_rate: f64,
}

/// Pairs each `CONNECT`/`RECONNECT` with the next `DISCONNECT` (or session
/// end) into a connection-duration sample (spec.md §4.6).
pub fn connection_stability(record: &SessionRecord) -> ConnectionStability {
    let mut samples = Vec::new();
    let mut open: Option<DateTime<Utc>> = None;
    let mut connects: u64 = 0;
    let mut reconnects: u64 = 0;

    for event in &record.events {
        match event.event_type {
            EventType::Connect => {
                connects += 1;
                open = Some(event.timestamp);
            }
            EventType::Reconnect => {
                reconnects += 1;
                open = Some(event.timestamp);
            }
            EventType::Disconnect => {
                if let Some(start) = open.take()
                    && let Ok(d) = (event.timestamp - start).to_std()
                {
                    samples.push(d);
                }
            }
            _ => {}
        }
    }
    if let Some(start) = open.take() {
        let end = record.end_time.unwrap_or_else(Utc::now);
        if let Ok(d) = (end - start).to_std() {
            samples.push(d);
        }
    }

    if samples.is_empty() {
        return ConnectionStability {
            reconnect_rate: reconnects as f64 / (connects + 1) as f64,
            ..Default::default()
        };
    }

    let mut sorted = samples.clone();
    sorted.sort_unstable();
    let median = sorted[sorted.len() / 2];
    let total: Duration = samples.iter().sum();
    let avg = total / samples.len() as u32;

    ConnectionStability {
        min: *sorted.first().expect("non-empty"),
        median,
        max: *sorted.last().expect("non-empty"),
        avg,
        total,
        reconnect_rate: reconnects as f64 / (connects + 1) as f64,
        samples,
    }
}

/// Convenience wrapper bundling a frozen record with its derived metrics,
/// computed lazily and not cached — mirrors [`crate::replay::Replayer`]
/// taking ownership of a one-way reference into the record (spec.md §9).
pub struct TimelineAnalyzer {
    record: SessionRecord,
}

impl TimelineAnalyzer {
    pub fn new(record: SessionRecord) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn message_flows(&self) -> Vec<MessageFlow> {
        pair_message_flows(&self.record, Utc::now())
    }

    pub fn latency_metrics(&self) -> LatencyMetrics {
        latency_metrics(&self.message_flows())
    }

    pub fn packet_loss_rate(&self) -> f64 {
        packet_loss_rate(&self.message_flows())
    }

    pub fn throughput(&self) -> f64 {
        throughput(&self.message_flows())
    }

    pub fn connection_stability(&self) -> ConnectionStability {
        connection_stability(&self.record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Direction, MessageFrame, SessionStats};
    use std::collections::HashMap as StdHashMap;

    fn evt(event_type: EventType, offset_ms: i64, opcode: Option<u16>, meta: StdHashMap<String, serde_json::Value>) -> SessionEvent {
        let ts = Utc::now() + chrono::Duration::milliseconds(offset_ms);
        SessionEvent {
            id: "event_x".into(),
            event_type,
            timestamp: ts,
            client_time: ts,
            server_time: ts,
            duration: None,
            opcode,
            message_size: None,
            message_hash: None,
            error: None,
            close_code: None,
            metadata: meta,
        }
    }

    fn meta_with_seq(seq: u64) -> StdHashMap<String, serde_json::Value> {
        let mut m = StdHashMap::new();
        m.insert("sequence_num".into(), serde_json::Value::from(seq));
        m
    }

    fn base_record(events: Vec<SessionEvent>) -> SessionRecord {
        SessionRecord {
            id: "r".into(),
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            events,
            frames: Vec::<MessageFrame>::new(),
            stats: SessionStats::default(),
        }
    }

    #[test]
    fn pairs_send_and_receive_with_latency() {
        let events = vec![
            evt(EventType::MessageSend, 0, Some(2000), meta_with_seq(1)),
            evt(EventType::MessageReceive, 25, Some(2001), meta_with_seq(1)),
        ];
        let record = base_record(events);
        let flows = pair_message_flows(&record, Utc::now());
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].status, FlowStatus::Received);
        assert!(flows[0].latency.unwrap() >= Duration::from_millis(20));
    }

    #[test]
    fn unmatched_send_ages_into_timeout() {
        let events = vec![evt(EventType::MessageSend, -40_000, Some(2000), meta_with_seq(1))];
        let record = base_record(events);
        let flows = pair_message_flows(&record, Utc::now());
        assert_eq!(flows[0].status, FlowStatus::Timeout);
    }

    #[test]
    fn error_event_marks_flow_errored() {
        let mut err_meta = meta_with_seq(1);
        err_meta.insert("message_id".into(), serde_json::Value::Null);
        let events = vec![
            evt(EventType::MessageSend, 0, Some(2000), meta_with_seq(1)),
            evt(EventType::Error, 10, None, meta_with_seq(1)),
        ];
        let record = base_record(events);
        let flows = pair_message_flows(&record, Utc::now());
        assert_eq!(flows[0].status, FlowStatus::Error);
    }

    #[test]
    fn percentile_matches_spec_example() {
        let mut samples = Vec::new();
        samples.extend(std::iter::repeat_n(Duration::from_millis(10), 80));
        samples.extend(std::iter::repeat_n(Duration::from_millis(100), 15));
        samples.extend(std::iter::repeat_n(Duration::from_millis(500), 5));
        assert_eq!(percentile_at(&mut samples.clone(), 95), Some(Duration::from_millis(100)));
        assert_eq!(percentile_at(&mut samples.clone(), 99), Some(Duration::from_millis(500)));
    }

    #[test]
    fn connection_stability_pairs_connect_and_disconnect() {
        let events = vec![
            evt(EventType::Connect, 0, None, StdHashMap::new()),
            evt(EventType::Disconnect, 1000, None, StdHashMap::new()),
            evt(EventType::Reconnect, 1500, None, StdHashMap::new()),
            evt(EventType::Disconnect, 3000, None, StdHashMap::new()),
        ];
        let record = base_record(events);
        let stability = connection_stability(&record);
        assert_eq!(stability.samples.len(), 2);
        assert!(stability.reconnect_rate > 0.0);
    }

    #[test]
    fn throughput_uses_send_to_receive_span_not_wall_clock() {
        let events = vec![
            evt(EventType::MessageSend, 0, Some(1), meta_with_seq(1)),
            evt(EventType::MessageReceive, 100, Some(2), meta_with_seq(1)),
            evt(EventType::MessageSend, 200, Some(1), meta_with_seq(2)),
            evt(EventType::MessageReceive, 1_000, Some(2), meta_with_seq(2)),
        ];
        let record = base_record(events);
        let flows = pair_message_flows(&record, Utc::now());
        assert!(throughput(&flows) > 0.0);
    }
}
