//! Cancellable scheduler that replays a recorded session in timestamp
//! order at a configurable speed (spec.md §4.5).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, Notify, watch};
use tokio::task::JoinHandle;

use crate::session::{EventType, SessionEvent, SessionRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    InvalidState(&'static str),
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayError::InvalidState(reason) => write!(f, "invalid replayer state: {reason}"),
        }
    }
}

impl std::error::Error for ReplayError {}

pub type ReplayResult<T> = Result<T, ReplayError>;

/// What the replayer hands to each registered callback for every event it
/// decides to replay (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct ReplayEvent {
    pub event: SessionEvent,
    pub error: Option<String>,
}

/// Filter policy: an event replays iff its type is in `types` (or `types`
/// is empty) AND, if set, its opcode matches, AND, if set, its recorded
/// latency falls inside `[min_latency, max_latency]` (spec.md §4.5 — the
/// filter config carries latency bounds even though the prose only
/// spells out the type/opcode clause explicitly; see DESIGN.md).
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub types: Vec<EventType>,
    pub opcode: Option<u16>,
    pub min_latency: Option<Duration>,
    pub max_latency: Option<Duration>,
}

impl EventFilter {
    fn matches(&self, event: &SessionEvent) -> bool {
        if !self.types.is_empty() && !self.types.contains(&event.event_type) {
            return false;
        }
        if let Some(opcode) = self.opcode
            && event.opcode != Some(opcode)
        {
            return false;
        }
        if self.min_latency.is_some() || self.max_latency.is_some() {
            let Some(duration) = event.duration else {
                return false;
            };
            if let Some(min) = self.min_latency
                && duration < min
            {
                return false;
            }
            if let Some(max) = self.max_latency
                && duration > max
            {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// `0` means no inter-event sleep at all.
    pub speed: f64,
    pub event_filter: EventFilter,
    pub pause_on_error: bool,
    pub enable_pause: bool,
    pub max_replay_time: Option<Duration>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            event_filter: EventFilter::default(),
            pause_on_error: false,
            enable_pause: true,
            max_replay_time: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplayStats {
    pub total_events: u64,
    pub replayed_events: u64,
    pub skipped_events: u64,
    pub error_events: u64,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub average_delay: Duration,
    pub pause_count: u64,
    pub total_pause_time: Duration,
    pub duration: Duration,
}

/// Running-mean accumulator using the standard Welford formulation —
/// the source's `replayed_events + 1` denominator (spec.md §9) is an
/// off-by-one on the first sample and is not reproduced here.
#[derive(Default)]
struct DelayStats {
    count: u64,
    mean_nanos: f64,
    min: Duration,
    max: Duration,
}

impl DelayStats {
    fn observe(&mut self, d: Duration) {
        self.count += 1;
        let x = d.as_nanos() as f64;
        self.mean_nanos += (x - self.mean_nanos) / self.count as f64;
        if self.count == 1 {
            self.min = d;
            self.max = d;
        } else {
            self.min = self.min.min(d);
            self.max = self.max.max(d);
        }
    }

    fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.mean_nanos as u64)
        }
    }
}

type Callback = Box<dyn Fn(&ReplayEvent) -> Result<(), String> + Send + Sync>;

struct Inner {
    record: SessionRecord,
    config: ReplayConfig,
    callbacks: Vec<Callback>,

    playing: AtomicBool,
    paused: AtomicBool,
    cursor: AtomicUsize,
    pause_count: AtomicU64,

    resume_notify: Notify,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,

    stats: AsyncMutex<ReplayStats>,
    driver: AsyncMutex<Option<JoinHandle<()>>>,
}

/// Single-threaded cooperative driver over a frozen [`SessionRecord`]
/// (spec.md §4.5). The reference to the record is one-way: the replayer
/// never writes back into it (spec.md §9).
pub struct Replayer {
    inner: Arc<Inner>,
}

impl Replayer {
    pub fn new(record: SessionRecord, config: ReplayConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let total_events = record.events.len() as u64;
        Self {
            inner: Arc::new(Inner {
                record,
                config,
                callbacks: Vec::new(),
                playing: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                cursor: AtomicUsize::new(0),
                pause_count: AtomicU64::new(0),
                resume_notify: Notify::new(),
                stop_tx,
                stop_rx,
                stats: AsyncMutex::new(ReplayStats {
                    total_events,
                    ..Default::default()
                }),
                driver: AsyncMutex::new(None),
            }),
        }
    }

    /// Register a callback; callbacks run in registration order per event.
    /// Must be called before [`Replayer::play`].
    pub fn on_event(&mut self, callback: impl Fn(&ReplayEvent) -> Result<(), String> + Send + Sync + 'static) {
        Arc::get_mut(&mut self.inner)
            .expect("callbacks must be registered before the driver task clones the Arc")
            .callbacks
            .push(Box::new(callback));
    }

    pub fn is_playing(&self) -> bool {
        self.inner.playing.load(Ordering::Acquire)
    }

    pub async fn stats(&self) -> ReplayStats {
        self.inner.stats.lock().await.clone()
    }

    /// Start the driver. Fails if already playing.
    pub fn play(&self) -> ReplayResult<()> {
        if self.inner.playing.swap(true, Ordering::SeqCst) {
            return Err(ReplayError::InvalidState("already playing"));
        }
        self.inner.paused.store(false, Ordering::SeqCst);
        let _ = self.inner.stop_tx.send(false);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { drive(inner).await });

        // `try_lock` is safe here: nothing else touches `driver` while we
        // hold the CAS above.
        if let Ok(mut slot) = self.inner.driver.try_lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Toggle pause. Fails with `InvalidState` if not currently playing or
    /// already paused.
    pub fn pause(&self) -> ReplayResult<()> {
        if !self.inner.config.enable_pause {
            return Err(ReplayError::InvalidState("pausing disabled by config"));
        }
        if !self.is_playing() {
            return Err(ReplayError::InvalidState("not playing"));
        }
        if self.inner.paused.swap(true, Ordering::SeqCst) {
            return Err(ReplayError::InvalidState("already paused"));
        }
        self.inner.pause_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Fails with `InvalidState` if not currently paused.
    pub fn resume(&self) -> ReplayResult<()> {
        if !self.inner.paused.swap(false, Ordering::SeqCst) {
            return Err(ReplayError::InvalidState("not paused"));
        }
        self.inner.resume_notify.notify_waiters();
        Ok(())
    }

    /// Cancel the driver and record the end time. Idempotent.
    pub fn stop(&self) {
        let _ = self.inner.stop_tx.send(true);
        self.inner.resume_notify.notify_waiters();
    }

    /// Block until the driver exits.
    pub async fn wait(&self) {
        let handle = self.inner.driver.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Only permitted while not playing: move the cursor to the first
    /// event with `timestamp >= t`.
    pub fn seek_to(&self, t: chrono::DateTime<chrono::Utc>) -> ReplayResult<()> {
        if self.is_playing() {
            return Err(ReplayError::InvalidState("cannot seek while playing"));
        }
        let idx = self
            .inner
            .record
            .events
            .iter()
            .position(|e| e.timestamp >= t)
            .unwrap_or(self.inner.record.events.len());
        self.inner.cursor.store(idx, Ordering::SeqCst);
        Ok(())
    }
}

async fn drive(inner: Arc<Inner>) {
    let start = Instant::now();
    let mut delay_stats = DelayStats::default();
    let mut stop_rx = inner.stop_rx.clone();

    let mut idx = inner.cursor.load(Ordering::SeqCst);
    let mut prev_timestamp = if idx > 0 {
        Some(inner.record.events[idx - 1].timestamp)
    } else {
        None
    };

    while idx < inner.record.events.len() {
        if *stop_rx.borrow() {
            break;
        }

        if let Some(max) = inner.config.max_replay_time
            && start.elapsed() >= max
        {
            break;
        }

        // Block while paused; still watch for a concurrent stop.
        while inner.paused.load(Ordering::SeqCst) {
            tokio::select! {
                _ = inner.resume_notify.notified() => {}
                _ = stop_rx.changed() => {}
            }
            if *stop_rx.borrow() {
                break;
            }
        }
        if *stop_rx.borrow() {
            break;
        }

        let event = inner.record.events[idx].clone();

        if let Some(prev) = prev_timestamp {
            let delta = event.timestamp - prev;
            if let Ok(std_delta) = delta.to_std()
                && !std_delta.is_zero()
                && inner.config.speed != 0.0
            {
                let scaled = std_delta.div_f64(inner.config.speed);
                delay_stats.observe(scaled);
                tokio::select! {
                    _ = tokio::time::sleep(scaled) => {}
                    _ = stop_rx.changed() => {}
                }
                if *stop_rx.borrow() {
                    break;
                }
            }
        }
        prev_timestamp = Some(event.timestamp);

        if inner.config.event_filter.matches(&event) {
            let mut first_error = None;
            for callback in &inner.callbacks {
                let replay_event = ReplayEvent {
                    event: event.clone(),
                    error: None,
                };
                if let Err(err) = callback(&replay_event) {
                    first_error = Some(err);
                    break;
                }
            }

            let mut stats = inner.stats.lock().await;
            stats.replayed_events += 1;
            if let Some(err) = first_error {
                stats.error_events += 1;
                drop(stats);
                if inner.config.pause_on_error {
                    inner.paused.store(true, Ordering::SeqCst);
                    inner.pause_count.fetch_add(1, Ordering::Relaxed);
                    log::debug!("replay paused on callback error: {err}");
                }
            }
        } else {
            inner.stats.lock().await.skipped_events += 1;
        }

        idx += 1;
        inner.cursor.store(idx, Ordering::SeqCst);
    }

    let mut stats = inner.stats.lock().await;
    stats.min_delay = delay_stats.min;
    stats.max_delay = delay_stats.max;
    stats.average_delay = delay_stats.average();
    stats.pause_count = inner.pause_count.load(Ordering::Relaxed);
    stats.duration = start.elapsed();
    drop(stats);

    inner.playing.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Direction, MessageFrame, SessionStats};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    fn event(id: u64, event_type: EventType, offset_ms: i64) -> SessionEvent {
        let ts = chrono::Utc::now() + chrono::Duration::milliseconds(offset_ms);
        SessionEvent {
            id: format!("event_{id}"),
            event_type,
            timestamp: ts,
            client_time: ts,
            server_time: ts,
            duration: None,
            opcode: None,
            message_size: None,
            message_hash: None,
            error: None,
            close_code: None,
            metadata: HashMap::new(),
        }
    }

    fn sample_record(n: usize, spacing_ms: i64) -> SessionRecord {
        let events: Vec<_> = (0..n)
            .map(|i| event(i as u64 + 1, EventType::MessageSend, i as i64 * spacing_ms))
            .collect();
        SessionRecord {
            id: "r1".into(),
            start_time: chrono::Utc::now(),
            end_time: None,
            events,
            frames: Vec::<MessageFrame>::new(),
            stats: SessionStats::default(),
        }
    }

    #[tokio::test]
    async fn replays_every_event_and_reports_counts() {
        let record = sample_record(5, 5);
        let config = ReplayConfig {
            speed: 0.0,
            ..Default::default()
        };
        let mut replayer = Replayer::new(record, config);
        let counter = Arc::new(StdAtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        replayer.on_event(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        replayer.play().unwrap();
        replayer.wait().await;

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        let stats = replayer.stats().await;
        assert_eq!(stats.replayed_events, 5);
        assert_eq!(stats.skipped_events, 0);
        assert_eq!(stats.replayed_events + stats.skipped_events, stats.total_events);
    }

    #[tokio::test]
    async fn play_twice_fails_with_invalid_state() {
        let record = sample_record(3, 1);
        let mut replayer = Replayer::new(record, ReplayConfig { speed: 0.0, ..Default::default() });
        replayer.on_event(|_| Ok(()));
        replayer.play().unwrap();
        assert!(replayer.play().is_err());
        replayer.wait().await;
    }

    #[tokio::test]
    async fn pause_while_not_playing_is_invalid_state() {
        let replayer = Replayer::new(sample_record(1, 1), ReplayConfig::default());
        assert!(matches!(replayer.pause(), Err(ReplayError::InvalidState(_))));
    }

    #[tokio::test]
    async fn resume_while_not_paused_is_invalid_state() {
        let replayer = Replayer::new(sample_record(1, 1), ReplayConfig::default());
        assert!(matches!(replayer.resume(), Err(ReplayError::InvalidState(_))));
    }

    #[tokio::test]
    async fn seek_during_play_is_invalid_state() {
        let record = sample_record(50, 20);
        let mut replayer = Replayer::new(record, ReplayConfig { speed: 1.0, ..Default::default() });
        replayer.on_event(|_| Ok(()));
        replayer.play().unwrap();
        assert!(matches!(
            replayer.seek_to(chrono::Utc::now()),
            Err(ReplayError::InvalidState(_))
        ));
        replayer.stop();
        replayer.wait().await;
    }

    #[tokio::test]
    async fn filter_skips_non_matching_types() {
        let mut record = sample_record(4, 1);
        record.events[1].event_type = EventType::Heartbeat;
        let mut replayer = Replayer::new(
            record,
            ReplayConfig {
                speed: 0.0,
                event_filter: EventFilter {
                    types: vec![EventType::MessageSend],
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        replayer.on_event(|_| Ok(()));
        replayer.play().unwrap();
        replayer.wait().await;
        let stats = replayer.stats().await;
        assert_eq!(stats.replayed_events, 3);
        assert_eq!(stats.skipped_events, 1);
    }

    #[tokio::test]
    async fn pause_on_error_stops_the_driver_mid_stream() {
        let record = sample_record(5, 1);
        let mut replayer = Replayer::new(
            record,
            ReplayConfig {
                speed: 0.0,
                pause_on_error: true,
                ..Default::default()
            },
        );
        let seen = Arc::new(StdAtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        replayer.on_event(move |_| {
            let n = seen_clone.fetch_add(1, Ordering::SeqCst);
            if n == 1 { Err("boom".into()) } else { Ok(()) }
        });
        replayer.play().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(replayer.is_playing());
        replayer.resume().unwrap();
        replayer.wait().await;

        let stats = replayer.stats().await;
        assert_eq!(stats.error_events, 1);
        assert_eq!(stats.replayed_events, 5);
    }
}
