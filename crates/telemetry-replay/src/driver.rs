// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish driver.
//!
//! One [`PublishDriver::tick`] moves one sample through the pipeline:
//!
//! ```text
//! sync state -> next sample -> timestamp -> format -> topic -> publish
//!                                                       |        |
//!                                                       |   blocked: backoff,
//!                                                       |   escalate to reconnect
//!                                                       v
//!                                                  TickOutcome
//! ```

use crate::backoff::{BackoffStep, FibonacciBackoff, ESCALATION_THRESHOLD};
use crate::cursor::{EndPolicy, RecordCursor, RecordFormat};
use crate::payload::{FormatterConfig, PayloadStrategy};
use crate::publisher::{MessageId, PublishError, Publisher, Qos};
use crate::state::{StateError, StateStore};
use crate::timestamp::TimestampRule;
use crate::topic::{TopicTemplate, TopicVars};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Driver tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// QoS used for telemetry messages.
    pub qos: Qos,

    /// Backoff value above which a blocked publish forces a reconnect.
    pub escalation_threshold: u64,

    /// Pause between disconnect and connect on escalation (seconds).
    pub reconnect_grace_secs: f64,

    /// Pause when no record is available and the source is closed (seconds).
    pub empty_backoff_secs: f64,

    /// Longest wait for in-flight messages once the source is exhausted (seconds).
    pub drain_grace_secs: f64,

    /// Pause between ticks that produced no timestamp (seconds).
    pub poll_interval_secs: f64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            qos: Qos::AtLeastOnce,
            escalation_threshold: ESCALATION_THRESHOLD,
            reconnect_grace_secs: 10.0,
            empty_backoff_secs: 30.0,
            drain_grace_secs: 600.0,
            poll_interval_secs: 0.05,
        }
    }
}

impl DriverConfig {
    /// Check every duration is a finite, non-negative number.
    pub fn validate(&self) -> Result<(), String> {
        let durations = [
            ("reconnect_grace_secs", self.reconnect_grace_secs),
            ("empty_backoff_secs", self.empty_backoff_secs),
            ("drain_grace_secs", self.drain_grace_secs),
            ("poll_interval_secs", self.poll_interval_secs),
        ];
        for (name, secs) in durations {
            if !secs.is_finite() || secs < 0.0 {
                return Err(format!("{} must be a non-negative number, got {}", name, secs));
            }
        }
        Ok(())
    }

    pub fn reconnect_grace(&self) -> Duration {
        secs(self.reconnect_grace_secs)
    }

    pub fn empty_backoff(&self) -> Duration {
        secs(self.empty_backoff_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        secs(self.drain_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_secs)
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Something that can block the worker.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

impl<S: Sleeper + ?Sized> Sleeper for &mut S {
    fn sleep(&mut self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Sleeps the current thread, waking early once `running` is cleared.
#[derive(Debug, Clone, Default)]
pub struct ThreadSleeper {
    running: Option<Arc<AtomicBool>>,
}

/// Longest uninterrupted sleep when a running flag is attached.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

impl ThreadSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cut sleeps short when `running` goes false.
    pub fn with_running(running: Arc<AtomicBool>) -> Self {
        Self {
            running: Some(running),
        }
    }
}

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        let Some(running) = &self.running else {
            std::thread::sleep(duration);
            return;
        };

        let mut remaining = duration;
        while !remaining.is_zero() && running.load(Ordering::SeqCst) {
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A message was handed to the transport.
    Published { timestamp_ms: i64 },

    /// No record this tick; the next tick can proceed normally.
    NoRecord,

    /// No record and nothing to read; wait this long before the next tick.
    Idle(Duration),

    /// The record could not be turned into a message.
    Skipped,

    /// The publish failed for good.
    Abandoned,

    /// The source is exhausted under the `stop` policy.
    Exhausted,
}

/// Driver statistics.
#[derive(Debug, Clone, Default)]
pub struct DriverStats {
    /// Messages formatted and sent to the transport.
    pub messages: u64,

    /// Messages accepted by the transport.
    pub published: u64,

    /// Publish attempts rejected as blocked.
    pub retries: u64,

    /// Forced reconnects.
    pub escalations: u64,

    /// Records skipped (bad timestamp or empty message).
    pub skipped: u64,

    /// Messages given up on.
    pub abandoned: u64,

    /// State versions pushed to the document store.
    pub state_syncs: u64,
}

/// Drives records from a cursor to a publisher.
pub struct PublishDriver<P: Publisher> {
    cursor: RecordCursor,
    store: StateStore,
    publisher: P,
    config: DriverConfig,
    synced_version: u64,
    record_format: Option<RecordFormat>,
    strategy: PayloadStrategy,
    formatter: FormatterConfig,
    rule: TimestampRule,
    topic: TopicTemplate,
    running: Option<Arc<AtomicBool>>,
    stats: DriverStats,
}

impl<P: Publisher> PublishDriver<P> {
    /// Create a driver. Fails when the initial state is invalid.
    ///
    /// The cursor is pointed at the state's file on the first tick.
    pub fn new(
        cursor: RecordCursor,
        store: StateStore,
        publisher: P,
        config: DriverConfig,
    ) -> Result<Self, StateError> {
        let state = store.state();
        state.validate()?;
        config.validate().map_err(StateError::Invalid)?;

        Ok(Self {
            strategy: state.payload_strategy,
            formatter: state.formatter_config(),
            rule: state.timestamp_rule(),
            topic: state.topic_template()?,
            cursor,
            store,
            publisher,
            config,
            synced_version: 0,
            record_format: None,
            running: None,
            stats: DriverStats::default(),
        })
    }

    /// Abandon blocked publishes once `running` goes false.
    pub fn with_running(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = Some(running);
        self
    }

    /// Run one pull-format-publish cycle.
    pub fn tick(&mut self, sleeper: &mut dyn Sleeper) -> TickOutcome {
        self.sync_state();

        let Some(sample) = self.cursor.next_sample() else {
            return self.empty_outcome();
        };

        let timestamp_ms = match self.rule.normalize(&sample) {
            Ok(ts) => ts,
            Err(e) => {
                tracing::warn!("Skipping record from {}: {}", self.source_name(), e);
                self.stats.skipped += 1;
                return TickOutcome::Skipped;
            }
        };

        let message = self.strategy.format(&sample, &self.formatter);
        if message.is_empty() {
            tracing::debug!("Skipping empty message from {}", self.source_name());
            self.stats.skipped += 1;
            return TickOutcome::Skipped;
        }

        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                self.stats.skipped += 1;
                return TickOutcome::Skipped;
            }
        };

        let state = self.store.state();
        let topic = self.topic.render(&TopicVars {
            deviceid: &state.deviceid,
            timestamp_ms,
        });

        self.stats.messages += 1;
        tracing::info!("{} - {}:{}", self.stats.messages, topic, payload);

        match self.deliver(&topic, payload.as_bytes(), sleeper) {
            Ok(id) => {
                self.stats.published += 1;
                tracing::trace!("Message {} accepted", id);
                TickOutcome::Published { timestamp_ms }
            }
            Err(e) => {
                tracing::error!("Abandoning message on {}: {}", topic, e);
                self.stats.abandoned += 1;
                TickOutcome::Abandoned
            }
        }
    }

    /// Wait for in-flight messages, at most the drain grace.
    ///
    /// Returns the number of messages still unacknowledged.
    pub fn drain(&mut self, sleeper: &mut dyn Sleeper) -> usize {
        let grace = self.config.drain_grace();
        let step = self.config.poll_interval().max(Duration::from_millis(1));
        let mut waited = Duration::ZERO;

        let mut pending = self.publisher.in_flight();
        while pending > 0 && waited < grace && self.is_running() {
            sleeper.sleep(step);
            waited += step;
            pending = self.publisher.in_flight();
        }

        if pending > 0 {
            tracing::warn!("{} messages still unacknowledged after drain", pending);
        }
        pending
    }

    /// Apply queued deltas and, on a new version, re-point the cursor and
    /// report the state.
    fn sync_state(&mut self) {
        self.store.drain_deltas();
        let version = self.store.version();
        if version == self.synced_version {
            return;
        }

        let state = self.store.state().clone();

        match state.topic_template() {
            Ok(topic) => self.topic = topic,
            Err(e) => tracing::error!("Keeping previous topic template: {}", e),
        }
        self.strategy = state.payload_strategy;
        self.formatter = state.formatter_config();
        self.rule = state.timestamp_rule();

        let format = state.record_format();
        let format_changed = self.record_format.as_ref() != Some(&format);
        self.cursor.set_end_policy(state.at_end);
        self.cursor.set_format(format.clone());
        self.record_format = Some(format);

        if format_changed && self.cursor.uri() == Some(state.file.as_str()) {
            // Same file, new layout: read the header again.
            if let Err(e) = self.cursor.open(&state.file) {
                tracing::warn!("Error reopening {}: {}", state.file, e);
            }
        } else {
            self.cursor.use_source(&state.file);
        }

        match state.to_document() {
            Ok(document) => match self.publisher.update_document(&document) {
                Ok(()) => self.stats.state_syncs += 1,
                Err(e) => tracing::warn!("State document update failed: {}", e),
            },
            Err(e) => tracing::warn!("State document not built: {}", e),
        }

        self.synced_version = version;
    }

    fn empty_outcome(&self) -> TickOutcome {
        // Still open: the line was malformed or the source just looped.
        if self.cursor.is_open() {
            return TickOutcome::NoRecord;
        }

        match self.cursor.end_policy() {
            EndPolicy::Stop => {
                tracing::info!("End of file reached");
                TickOutcome::Exhausted
            }
            EndPolicy::Repeat | EndPolicy::Wait => TickOutcome::Idle(self.config.empty_backoff()),
        }
    }

    /// Publish with Fibonacci backoff while the transport is blocked.
    fn deliver(
        &mut self,
        topic: &str,
        payload: &[u8],
        sleeper: &mut dyn Sleeper,
    ) -> Result<MessageId, PublishError> {
        let mut backoff = FibonacciBackoff::with_threshold(self.config.escalation_threshold);

        loop {
            match self.publisher.publish(topic, payload, self.config.qos) {
                Ok(id) => return Ok(id),
                Err(e) if e.is_retryable() => {
                    if !self.is_running() {
                        return Err(PublishError::Cancelled);
                    }
                    self.stats.retries += 1;
                    tracing::debug!("Waiting to clear block: {}", e);

                    let step = backoff.next_step();
                    if let BackoffStep::Escalate(_) = step {
                        self.reconnect(sleeper);
                    }
                    sleeper.sleep(step.delay());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn reconnect(&mut self, sleeper: &mut dyn Sleeper) {
        self.stats.escalations += 1;
        tracing::warn!("Publish still blocked, re-connecting");

        if let Err(e) = self.publisher.disconnect() {
            tracing::warn!("Disconnect failed: {}", e);
        }
        sleeper.sleep(self.config.reconnect_grace());
        if let Err(e) = self.publisher.connect() {
            tracing::error!("Reconnect failed: {}", e);
        }
    }

    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map_or(true, |running| running.load(Ordering::SeqCst))
    }

    fn source_name(&self) -> &str {
        self.cursor.uri().unwrap_or("<none>")
    }

    /// Driver statistics.
    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    /// Messages awaiting acknowledgment.
    pub fn in_flight(&self) -> usize {
        self.publisher.in_flight()
    }

    pub fn cursor(&self) -> &RecordCursor {
        &self.cursor
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn publisher_mut(&mut self) -> &mut P {
        &mut self.publisher
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::LogPublisher;
    use crate::source::CachedResolver;
    use crate::state::ProcessState;
    use std::fs;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Vec<Duration>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&mut self, duration: Duration) {
            self.slept.push(duration);
        }
    }

    fn driver_for(dir: &std::path::Path, contents: impl AsRef<[u8]>) -> PublishDriver<LogPublisher> {
        let path = dir.join("trip.csv");
        fs::write(&path, contents).expect("write csv");

        let state = ProcessState {
            file: path.display().to_string(),
            record_separator: ",".into(),
            quote_records: false,
            time_col_name: "t".into(),
            timestamp_offset: 0.0,
            time_scale: 1000.0,
            measure_column: "PID".into(),
            value_column: "VALUE".into(),
            ignore_columns: vec![],
            topic_name: "vt/{deviceid}/{timestamp_ms}".into(),
            deviceid: "Bot".into(),
            ..Default::default()
        };
        let (store, _tx) = StateStore::new(state);
        let cursor = RecordCursor::new(CachedResolver::new(dir), RecordFormat::default());
        let mut publisher = LogPublisher::new();
        publisher.connect().expect("connect");

        PublishDriver::new(cursor, store, publisher, DriverConfig::default()).expect("driver")
    }

    #[test]
    fn test_tick_publishes_labelled_message() {
        let dir = tempdir().expect("tempdir");
        let mut driver = driver_for(dir.path(), "t,PID,VALUE\n1500,RPM,2500\n");
        let mut sleeper = RecordingSleeper::default();

        assert_eq!(
            driver.tick(&mut sleeper),
            TickOutcome::Published { timestamp_ms: 1500 }
        );
        assert_eq!(driver.stats().published, 1);
        assert_eq!(driver.stats().state_syncs, 1);
        assert_eq!(driver.publisher().document_updates(), 1);
        assert!(sleeper.slept.is_empty());
    }

    #[test]
    fn test_stop_policy_exhausts() {
        let dir = tempdir().expect("tempdir");
        let mut driver = driver_for(dir.path(), "t,PID,VALUE\n1,RPM,1\n");
        let mut sleeper = RecordingSleeper::default();

        assert!(matches!(driver.tick(&mut sleeper), TickOutcome::Published { .. }));
        assert_eq!(driver.tick(&mut sleeper), TickOutcome::Exhausted);
        assert_eq!(driver.tick(&mut sleeper), TickOutcome::Exhausted);
        assert_eq!(driver.drain(&mut sleeper), 0);
    }

    #[test]
    fn test_malformed_line_does_not_exhaust() {
        let dir = tempdir().expect("tempdir");
        let mut driver = driver_for(dir.path(), b"t,PID,VALUE\n\xff,RPM,1\n2,RPM,1\n");
        let mut sleeper = RecordingSleeper::default();

        assert_eq!(driver.tick(&mut sleeper), TickOutcome::NoRecord);
        assert_eq!(
            driver.tick(&mut sleeper),
            TickOutcome::Published { timestamp_ms: 2 }
        );
    }

    #[test]
    fn test_bad_timestamp_skips_record() {
        let dir = tempdir().expect("tempdir");
        let mut driver = driver_for(dir.path(), "t,PID,VALUE\nnow,RPM,1\n3,RPM,1\n");
        let mut sleeper = RecordingSleeper::default();

        assert_eq!(driver.tick(&mut sleeper), TickOutcome::Skipped);
        assert_eq!(
            driver.tick(&mut sleeper),
            TickOutcome::Published { timestamp_ms: 3 }
        );
        assert_eq!(driver.stats().skipped, 1);
    }

    #[test]
    fn test_empty_message_is_skipped() {
        let dir = tempdir().expect("tempdir");
        // Untimed strategy drops t, PID and VALUE; nothing is left.
        let mut driver = driver_for(dir.path(), "t,PID,VALUE\n1,,\n");
        let mut sleeper = RecordingSleeper::default();

        assert_eq!(driver.tick(&mut sleeper), TickOutcome::Skipped);
        assert_eq!(driver.stats().messages, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().expect("tempdir");
        let (store, _tx) = StateStore::new(ProcessState {
            topic_name: "vt/{vin}".into(),
            ..Default::default()
        });
        let cursor = RecordCursor::new(CachedResolver::new(dir.path()), RecordFormat::default());
        assert!(PublishDriver::new(cursor, store, LogPublisher::new(), DriverConfig::default()).is_err());

        let config = DriverConfig {
            empty_backoff_secs: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(DriverConfig::default().empty_backoff(), Duration::from_secs(30));
    }

    #[test]
    fn test_thread_sleeper_stops_early() {
        let running = Arc::new(AtomicBool::new(false));
        let mut sleeper = ThreadSleeper::with_running(running);
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
