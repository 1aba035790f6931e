/// Single collection session lifecycle: validate, arm the auto-stop timer,
/// buffer samples, report the result once.
use crate::buffer::CollectionBuffer;
use crate::config::{MAX_DURATION_MS, MAX_SAMPLE_RATE_HZ, MIN_DURATION_MS, MIN_SAMPLE_RATE_HZ};
use crate::connection::ConnectionState;
use crate::monitor::Monitor;
use crate::sample::{CollectionComplete, Sample, SampleValue};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Parameters of one collection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub label: String,
    pub duration_ms: u64,
    /// Target rate; metadata only, intake is never throttled.
    pub sample_rate_hz: u32,
}

impl SessionParams {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.label.trim().is_empty() {
            return Err(SessionError::InvalidLabel);
        }
        if !(MIN_DURATION_MS..=MAX_DURATION_MS).contains(&self.duration_ms) {
            return Err(SessionError::InvalidDuration {
                duration_ms: self.duration_ms,
            });
        }
        if !(MIN_SAMPLE_RATE_HZ..=MAX_SAMPLE_RATE_HZ).contains(&self.sample_rate_hz) {
            return Err(SessionError::InvalidRate {
                sample_rate_hz: self.sample_rate_hz,
            });
        }
        Ok(())
    }
}

/// Errors that can occur when starting a session or feeding it.
#[derive(Debug)]
pub enum SessionError {
    InvalidLabel,
    InvalidDuration { duration_ms: u64 },
    InvalidRate { sample_rate_hz: u32 },
    /// The device link is not up.
    NotConnected,
    InvalidSample { reason: String },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::InvalidLabel => write!(f, "label must not be empty"),
            SessionError::InvalidDuration { duration_ms } => write!(
                f,
                "duration {duration_ms}ms out of range ({MIN_DURATION_MS}-{MAX_DURATION_MS}ms)"
            ),
            SessionError::InvalidRate { sample_rate_hz } => write!(
                f,
                "sample rate {sample_rate_hz}Hz out of range ({MIN_SAMPLE_RATE_HZ}-{MAX_SAMPLE_RATE_HZ}Hz)"
            ),
            SessionError::NotConnected => write!(f, "not connected to a device"),
            SessionError::InvalidSample { reason } => write!(f, "invalid sample: {reason}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// What happened to one offered sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeOutcome {
    Accepted { count: usize },
    /// No session was running; the sample was ignored.
    Inactive,
    Rejected,
}

struct ActiveRun {
    id: u64,
    params: SessionParams,
    started: Instant,
    timer: Option<JoinHandle<()>>,
    buffer: CollectionBuffer,
}

struct Slot {
    active: Option<ActiveRun>,
    next_id: u64,
}

struct Inner {
    slot: Mutex<Slot>,
    link: watch::Receiver<ConnectionState>,
    monitor: Monitor,
    completions: mpsc::UnboundedSender<CollectionComplete>,
    finished: watch::Sender<u64>,
    progress_every: usize,
}

/// At most one active collection at a time.
///
/// Cloning shares the session; the auto-stop timer holds a clone.
#[derive(Clone)]
pub struct CollectionSession {
    inner: Arc<Inner>,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl CollectionSession {
    /// Returns the session and the receiving end of its completion events.
    pub fn new(
        link: watch::Receiver<ConnectionState>,
        monitor: Monitor,
        progress_every: usize,
    ) -> (Self, mpsc::UnboundedReceiver<CollectionComplete>) {
        let (completions, rx) = mpsc::unbounded_channel();
        let (finished, _) = watch::channel(0);
        let session = Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    active: None,
                    next_id: 0,
                }),
                link,
                monitor,
                completions,
                finished,
                progress_every,
            }),
        };
        (session, rx)
    }

    /// Begin collecting. A session already running is stopped first.
    ///
    /// Rejections leave the current state and buffer untouched.
    pub fn start(&self, params: SessionParams) -> Result<(), SessionError> {
        params.validate()?;
        if *self.inner.link.borrow() != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }

        if self.is_active() {
            self.inner
                .monitor
                .status("Stopping active collection before starting a new one");
            self.stop();
        }

        let displaced = {
            let mut slot = lock(&self.inner.slot);
            slot.next_id += 1;
            let id = slot.next_id;
            let session = self.clone();
            let duration = Duration::from_millis(params.duration_ms);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                session.expire(id);
            });
            let run = ActiveRun {
                id,
                params: params.clone(),
                started: Instant::now(),
                timer: Some(timer),
                buffer: CollectionBuffer::new(self.inner.progress_every),
            };
            slot.active.replace(run)
        };
        if let Some(mut run) = displaced {
            if let Some(timer) = run.timer.take() {
                timer.abort();
            }
            self.finalize(run);
        }

        debug!(
            label = %params.label,
            duration_ms = params.duration_ms,
            sample_rate_hz = params.sample_rate_hz,
            "session started"
        );
        self.inner.monitor.status(format!(
            "Started collecting \"{}\" for {}ms at {}Hz",
            params.label, params.duration_ms, params.sample_rate_hz
        ));
        Ok(())
    }

    /// End the active session early. No-op when inactive.
    pub fn stop(&self) {
        let run = {
            let mut slot = lock(&self.inner.slot);
            let mut run = slot.active.take();
            if let Some(timer) = run.as_mut().and_then(|r| r.timer.take()) {
                timer.abort();
            }
            run
        };
        if let Some(run) = run {
            self.finalize(run);
        }
    }

    /// Timer callback; ignored unless `id` is still the active run.
    fn expire(&self, id: u64) {
        let run = {
            let mut slot = lock(&self.inner.slot);
            if slot.active.as_ref().map(|r| r.id) != Some(id) {
                return;
            }
            slot.active.take()
        };
        if let Some(mut run) = run {
            // The timer is the running task; dropping its handle detaches it.
            run.timer.take();
            self.finalize(run);
        }
    }

    fn finalize(&self, run: ActiveRun) {
        let elapsed = run.started.elapsed();
        let count = run.buffer.len();
        let secs = elapsed.as_secs_f64();
        let achieved = if secs > 0.0 { count as f64 / secs } else { 0.0 };
        self.inner.monitor.status(format!(
            "Collection stopped. Collected {count} samples in {}ms ({achieved:.1}Hz)",
            elapsed.as_millis()
        ));

        if run.buffer.is_empty() {
            self.inner.monitor.status("No data collected");
        } else {
            self.inner
                .monitor
                .status(format!("Processing {count} samples..."));
            let (head, tail) = run.buffer.preview(3);
            self.inner
                .monitor
                .status(format!("Sample values: [{head}] ... [{tail}]"));

            let event = CollectionComplete {
                label: run.params.label,
                duration_ms: run.buffer.span_ms(),
                samples: run.buffer.into_samples(),
                sample_rate_hz: run.params.sample_rate_hz,
                completion_time: Utc::now(),
            };
            if self.inner.completions.send(event).is_err() {
                warn!("completion receiver dropped, discarding collected samples");
            }
        }
        self.inner.finished.send_modify(|n| *n += 1);
    }

    /// Offer an untyped reading, timestamped now.
    pub fn intake(&self, raw: &Value) -> IntakeOutcome {
        self.intake_at(raw, Utc::now())
    }

    pub fn intake_at(&self, raw: &Value, timestamp: DateTime<Utc>) -> IntakeOutcome {
        if !self.is_active() {
            return IntakeOutcome::Inactive;
        }
        match SampleValue::from_raw(raw) {
            Ok(value) => self.record_at(value, timestamp),
            Err(rejected) => {
                let err = SessionError::InvalidSample {
                    reason: rejected.reason,
                };
                debug!("{err}");
                IntakeOutcome::Rejected
            }
        }
    }

    /// Append an already-normalized value, timestamped now.
    pub fn record(&self, value: SampleValue) -> IntakeOutcome {
        self.record_at(value, Utc::now())
    }

    pub fn record_at(&self, value: SampleValue, timestamp: DateTime<Utc>) -> IntakeOutcome {
        let appended = {
            let mut slot = lock(&self.inner.slot);
            match slot.active.as_mut() {
                Some(run) => run.buffer.push(Sample { value, timestamp }),
                None => return IntakeOutcome::Inactive,
            }
        };
        if appended.progress {
            self.inner
                .monitor
                .status(format!("Progress: {} samples collected", appended.count));
        }
        IntakeOutcome::Accepted {
            count: appended.count,
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.inner.slot).active.is_some()
    }

    /// Snapshot of the active buffer; empty when inactive.
    #[cfg(test)]
    pub fn current_samples(&self) -> Vec<Sample> {
        lock(&self.inner.slot)
            .active
            .as_ref()
            .map(|r| r.buffer.samples().to_vec())
            .unwrap_or_default()
    }

    /// Counts finished sessions, bumped after the completion event is sent.
    pub fn subscribe_finished(&self) -> watch::Receiver<u64> {
        self.inner.finished.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{drain, MonitorLine};
    use crate::sample::Channel;
    use serde_json::json;

    struct Harness {
        session: CollectionSession,
        completions: mpsc::UnboundedReceiver<CollectionComplete>,
        lines: mpsc::UnboundedReceiver<MonitorLine>,
        _link: watch::Sender<ConnectionState>,
    }

    fn harness(state: ConnectionState) -> Harness {
        let (link, link_rx) = watch::channel(state);
        let (monitor, lines) = Monitor::channel();
        let (session, completions) = CollectionSession::new(link_rx, monitor, 50);
        Harness {
            session,
            completions,
            lines,
            _link: link,
        }
    }

    fn params(label: &str, duration_ms: u64, sample_rate_hz: u32) -> SessionParams {
        SessionParams {
            label: label.to_string(),
            duration_ms,
            sample_rate_hz,
        }
    }

    fn status_count(lines: &[MonitorLine], prefix: &str) -> usize {
        lines.iter().filter(|l| l.text.starts_with(prefix)).count()
    }

    #[tokio::test]
    async fn test_out_of_range_parameters_rejected() {
        let mut h = harness(ConnectionState::Connected);
        for (p, expected) in [
            (params("", 5_000, 100), "label"),
            (params("   ", 5_000, 100), "label"),
            (params("tap", 999, 100), "duration"),
            (params("tap", 30_001, 100), "duration"),
            (params("tap", 5_000, 9), "sample rate"),
            (params("tap", 5_000, 1_001), "sample rate"),
        ] {
            let err = h.session.start(p).unwrap_err();
            assert!(err.to_string().contains(expected), "{err}");
            assert!(!h.session.is_active());
        }
        assert!(drain(&mut h.lines).is_empty());
    }

    #[tokio::test]
    async fn test_rejected_start_keeps_active_buffer() {
        let h = harness(ConnectionState::Connected);
        h.session.start(params("tap", 5_000, 100)).unwrap();
        h.session.intake(&json!(1.0));

        assert!(h.session.start(params("tap", 30_001, 100)).is_err());
        assert!(h.session.is_active());
        assert_eq!(h.session.current_samples().len(), 1);
    }

    #[tokio::test]
    async fn test_bounds_are_inclusive() {
        let h = harness(ConnectionState::Connected);
        for p in [params("a", 1_000, 10), params("b", 30_000, 1_000)] {
            h.session.start(p).unwrap();
            h.session.stop();
        }
    }

    #[tokio::test]
    async fn test_start_requires_connection() {
        let h = harness(ConnectionState::Disconnected);
        assert!(matches!(
            h.session.start(params("tap", 5_000, 100)),
            Err(SessionError::NotConnected)
        ));
        assert!(!h.session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_expiry_without_data_reports_nothing_collected() {
        for (duration_ms, rate) in [(1_000, 10), (5_000, 100), (30_000, 1_000)] {
            let mut h = harness(ConnectionState::Connected);
            h.session.start(params("idle", duration_ms, rate)).unwrap();
            tokio::time::sleep(Duration::from_millis(duration_ms + 1)).await;

            assert!(!h.session.is_active());
            let lines = drain(&mut h.lines);
            assert_eq!(status_count(&lines, "No data collected"), 1);
            assert_eq!(status_count(&lines, "Collection stopped."), 1);
            assert!(h.completions.try_recv().is_err());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_expiry_emits_completion() {
        let mut h = harness(ConnectionState::Connected);
        h.session.start(params("tap", 1_000, 50)).unwrap();
        let t0 = Utc::now();
        h.session.intake_at(&json!(1), t0);
        h.session
            .intake_at(&json!(2), t0 + chrono::Duration::milliseconds(250));
        tokio::time::sleep(Duration::from_millis(1_001)).await;

        let event = h.completions.try_recv().unwrap();
        assert_eq!(event.label, "tap");
        assert_eq!(event.sample_rate_hz, 50);
        assert_eq!(event.samples.len(), 2);
        assert_eq!(event.duration_ms, 250);
        assert!(!h.session.is_active());
    }

    #[tokio::test]
    async fn test_intake_ignored_while_inactive() {
        let mut h = harness(ConnectionState::Connected);
        assert_eq!(h.session.intake(&json!(1.0)), IntakeOutcome::Inactive);
        // Even a malformed value is a silent no-op before start.
        assert_eq!(h.session.intake(&json!("x")), IntakeOutcome::Inactive);

        h.session.start(params("tap", 5_000, 100)).unwrap();
        h.session.intake(&json!(1.0));
        h.session.stop();
        assert_eq!(h.session.intake(&json!(2.0)), IntakeOutcome::Inactive);

        let event = h.completions.try_recv().unwrap();
        assert_eq!(event.samples.len(), 1);
        assert!(h.session.current_samples().is_empty());
    }

    #[tokio::test]
    async fn test_mixed_intake_preserves_order_and_skips_rejects() {
        let mut h = harness(ConnectionState::Connected);
        h.session.start(params("mix", 5_000, 100)).unwrap();

        assert_eq!(
            h.session.intake(&json!(1.5)),
            IntakeOutcome::Accepted { count: 1 }
        );
        assert_eq!(h.session.intake(&json!("bad")), IntakeOutcome::Rejected);
        h.session.record(SampleValue::Structured(vec![Channel::new("x", 2.0)]));
        h.session.intake(&json!({"y": 3}));
        h.session.intake(&json!(4));
        h.session.stop();

        let event = h.completions.try_recv().unwrap();
        let values: Vec<Vec<f64>> = event.samples.iter().map(|s| s.value.values()).collect();
        assert_eq!(values, vec![vec![1.5], vec![2.0], vec![3.0], vec![4.0]]);
        assert!(event
            .samples
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_stop_disarms_timer() {
        let mut h = harness(ConnectionState::Connected);
        h.session.start(params("tap", 1_000, 100)).unwrap();
        h.session.intake(&json!(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.session.stop();
        tokio::time::sleep(Duration::from_millis(2_000)).await;

        assert!(h.completions.try_recv().is_ok());
        assert!(h.completions.try_recv().is_err());
        let lines = drain(&mut h.lines);
        assert_eq!(status_count(&lines, "Collection stopped."), 1);
    }

    #[tokio::test]
    async fn test_stop_twice_reports_once() {
        let mut h = harness(ConnectionState::Connected);
        h.session.start(params("tap", 5_000, 100)).unwrap();
        h.session.stop();
        h.session.stop();
        let lines = drain(&mut h.lines);
        assert_eq!(status_count(&lines, "Collection stopped."), 1);
        assert_eq!(*h.session.subscribe_finished().borrow(), 1);
    }

    #[tokio::test]
    async fn test_stale_timer_does_not_end_newer_run() {
        let h = harness(ConnectionState::Connected);
        h.session.start(params("first", 5_000, 100)).unwrap();
        let first_id = lock(&h.session.inner.slot).active.as_ref().unwrap().id;
        h.session.stop();
        h.session.start(params("second", 5_000, 100)).unwrap();

        h.session.expire(first_id);
        assert!(h.session.is_active());
    }

    #[tokio::test]
    async fn test_restart_finalizes_previous_run() {
        let mut h = harness(ConnectionState::Connected);
        h.session.start(params("first", 5_000, 100)).unwrap();
        h.session.intake(&json!(1));
        h.session.start(params("second", 5_000, 100)).unwrap();

        let event = h.completions.try_recv().unwrap();
        assert_eq!(event.label, "first");
        assert!(h.session.is_active());
        assert!(h.session.current_samples().is_empty());
    }

    #[tokio::test]
    async fn test_progress_reported_every_fifty() {
        let mut h = harness(ConnectionState::Connected);
        h.session.start(params("tap", 5_000, 100)).unwrap();
        for i in 0..120 {
            h.session.intake(&json!(i));
        }
        let lines = drain(&mut h.lines);
        let progress: Vec<&str> = lines
            .iter()
            .filter(|l| l.text.starts_with("Progress:"))
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(
            progress,
            vec!["Progress: 50 samples collected", "Progress: 100 samples collected"]
        );
    }

    #[tokio::test]
    async fn test_finished_counter_follows_completion() {
        let mut h = harness(ConnectionState::Connected);
        let mut finished = h.session.subscribe_finished();
        h.session.start(params("tap", 5_000, 100)).unwrap();
        h.session.intake(&json!(1));
        h.session.stop();

        finished.changed().await.unwrap();
        assert_eq!(*finished.borrow(), 1);
        assert!(h.completions.try_recv().is_ok());
    }
}
