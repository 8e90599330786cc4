// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process state and remote delta updates.
//!
//! [`ProcessState`] is the whole mutable configuration of a replay. It is
//! owned by a [`StateStore`] on the worker thread; other threads send partial
//! updates through a [`DeltaSender`], and the worker merges them at the top of
//! each tick. Every effective merge bumps the store version, which the driver
//! compares against the version it last synced.

use crate::cursor::{EndPolicy, RecordFormat};
use crate::payload::{FormatterConfig, PayloadStrategy, ValueTransform};
use crate::timestamp::TimestampRule;
use crate::topic::{TopicError, TopicTemplate};
use chrono::{Days, Local, TimeZone};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// State errors.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid state: {0}")]
    Invalid(String),

    #[error("invalid topic template: {0}")]
    Topic(#[from] TopicError),

    #[error("state delta rejected: {0}")]
    Delta(#[from] serde_json::Error),
}

/// Full replay state, reported to the remote document store as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessState {
    /// Source URI (`file://`, `s3://` or a bare path).
    pub file: String,

    /// Field separator.
    pub record_separator: String,

    /// Strip `"` around fields.
    pub quote_records: bool,

    /// Reject rows whose field count differs from the header.
    pub strict_arity: bool,

    /// Time column.
    pub time_col_name: String,

    /// Date/time format of the time column. Numeric when unset.
    pub timestamp_format: Option<String>,

    /// Seconds added to numeric time values. Accepts `"yesterday"`.
    #[serde(deserialize_with = "deserialize_offset")]
    pub timestamp_offset: f64,

    /// Time units per second.
    pub time_scale: f64,

    /// Payload strategy.
    pub payload_strategy: PayloadStrategy,

    /// Metric name column (labelled strategies).
    pub measure_column: String,

    /// Reading column (labelled strategies).
    pub value_column: String,

    /// Reading conversion.
    pub value_transform: ValueTransform,

    /// Columns dropped before formatting.
    pub ignore_columns: Vec<String>,

    /// Topic template.
    pub topic_name: String,

    /// Messages per second. Paced by the source timestamps when unset
    /// (written as `"source"`).
    #[serde(serialize_with = "serialize_rate", deserialize_with = "deserialize_rate")]
    pub message_publish_rate: Option<f64>,

    /// End-of-stream policy.
    pub at_end: EndPolicy,

    /// Device identifier substituted into topics.
    pub deviceid: String,

    /// Local cache directory for remote sources.
    pub local_dir: String,

    /// Keys this process does not interpret, kept for the state document.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ProcessState {
    fn default() -> Self {
        Self {
            file: "file:///OBDII_Capture.csv".into(),
            record_separator: ";".into(),
            quote_records: true,
            strict_arity: false,
            time_col_name: "SECONDS".into(),
            timestamp_format: None,
            timestamp_offset: yesterday_midnight(),
            time_scale: 1.0,
            payload_strategy: PayloadStrategy::UntimedDynamicLabelled,
            measure_column: "PID".into(),
            value_column: "VALUE".into(),
            value_transform: ValueTransform::Float,
            ignore_columns: vec!["UNITS".into()],
            topic_name: "vt/cvra/{deviceid}/cardata/{timestamp_ms}".into(),
            message_publish_rate: Some(10.0),
            at_end: EndPolicy::Stop,
            deviceid: String::new(),
            local_dir: ".".into(),
            extra: Map::new(),
        }
    }
}

impl ProcessState {
    /// Formatter settings derived from this state.
    pub fn formatter_config(&self) -> FormatterConfig {
        FormatterConfig::default()
            .pre_drop(self.ignore_columns.iter().cloned())
            .labelled(self.measure_column.clone(), self.value_column.clone())
            .time_key(self.time_col_name.clone())
            .value_transform(self.value_transform)
    }

    /// Timestamp rule derived from this state.
    pub fn timestamp_rule(&self) -> TimestampRule {
        let rule = TimestampRule::new(self.time_col_name.clone())
            .offset(self.timestamp_offset)
            .scale(self.time_scale);
        match &self.timestamp_format {
            Some(format) => rule.format(format.clone()),
            None => rule,
        }
    }

    /// Record layout derived from this state.
    pub fn record_format(&self) -> RecordFormat {
        let delimiter = self.record_separator.as_bytes().first().copied().unwrap_or(b',');
        RecordFormat::new(delimiter)
            .quoted(self.quote_records)
            .strict_arity(self.strict_arity)
    }

    /// Parsed topic template.
    pub fn topic_template(&self) -> Result<TopicTemplate, StateError> {
        Ok(TopicTemplate::parse(&self.topic_name)?)
    }

    /// Check the state can drive a replay.
    pub fn validate(&self) -> Result<(), StateError> {
        if self.file.trim().is_empty() {
            return Err(StateError::Invalid("file must not be empty".into()));
        }
        if self.record_separator.len() != 1 {
            return Err(StateError::Invalid(format!(
                "record_separator must be a single byte, got {:?}",
                self.record_separator
            )));
        }
        if self.time_col_name.is_empty() {
            return Err(StateError::Invalid("time_col_name must not be empty".into()));
        }
        if !self.timestamp_offset.is_finite() {
            return Err(StateError::Invalid(
                "timestamp_offset must be a finite number".into(),
            ));
        }
        if !self.time_scale.is_finite() || self.time_scale == 0.0 {
            return Err(StateError::Invalid(format!(
                "time_scale must be a non-zero number, got {}",
                self.time_scale
            )));
        }
        if let Some(rate) = self.message_publish_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(StateError::Invalid(format!(
                    "message_publish_rate must be positive, got {}",
                    rate
                )));
            }
        }
        if self.payload_strategy.is_labelled()
            && (self.measure_column.is_empty() || self.value_column.is_empty())
        {
            return Err(StateError::Invalid(format!(
                "{} needs measure_column and value_column",
                self.payload_strategy
            )));
        }

        self.topic_template()?;
        Ok(())
    }

    /// The state as a JSON mapping, for the remote document store.
    pub fn to_document(&self) -> Result<Map<String, Value>, StateError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(StateError::Invalid(format!(
                "state serialized to {} instead of an object",
                other
            ))),
        }
    }

    /// Merge a partial mapping into a copy of this state.
    ///
    /// Keys replace whole values; `null` clears optional keys. The merged
    /// state must deserialize and validate, otherwise the delta is rejected.
    pub fn merged(&self, delta: &Map<String, Value>) -> Result<Self, StateError> {
        let mut document = self.to_document()?;
        for (key, value) in delta {
            document.insert(key.clone(), value.clone());
        }

        let merged: Self = serde_json::from_value(Value::Object(document))?;
        merged.validate()?;
        Ok(merged)
    }
}

/// Unix seconds of local midnight, one day before today.
pub fn yesterday_midnight() -> f64 {
    Local::now()
        .date_naive()
        .checked_sub_days(Days::new(1))
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .map(|dt| dt.timestamp() as f64)
        .unwrap_or(0.0)
}

fn deserialize_offset<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Offset {
        Seconds(f64),
        Named(String),
    }

    match Offset::deserialize(deserializer)? {
        Offset::Seconds(secs) => Ok(secs),
        Offset::Named(name) if name == "yesterday" => Ok(yesterday_midnight()),
        Offset::Named(name) => Err(serde::de::Error::custom(format!(
            "unknown timestamp_offset '{}', expected seconds or \"yesterday\"",
            name
        ))),
    }
}

/// Configuration value selecting source-timestamp pacing.
const SOURCE_PACED: &str = "source";

fn serialize_rate<S>(rate: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match rate {
        Some(rate) => serializer.serialize_f64(*rate),
        None => serializer.serialize_str(SOURCE_PACED),
    }
}

fn deserialize_rate<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Rate {
        PerSecond(f64),
        Named(String),
    }

    match Option::<Rate>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Rate::PerSecond(rate)) => Ok(Some(rate)),
        Some(Rate::Named(name)) if name == SOURCE_PACED => Ok(None),
        Some(Rate::Named(name)) => Err(serde::de::Error::custom(format!(
            "unknown message_publish_rate '{}', expected a number or \"{}\"",
            name, SOURCE_PACED
        ))),
    }
}

/// A partial state update.
pub type StateDelta = Map<String, Value>;

/// Sending half of the delta channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DeltaSender {
    tx: Sender<StateDelta>,
}

impl DeltaSender {
    /// Queue a delta. Returns false when the store is gone or the queue is full.
    pub fn send(&self, delta: StateDelta) -> bool {
        match self.tx.try_send(delta) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("State delta queue full, dropping update");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Maximum queued deltas before senders start dropping.
const DELTA_QUEUE_CAPACITY: usize = 64;

/// Versioned owner of the process state.
#[derive(Debug)]
pub struct StateStore {
    state: ProcessState,
    version: u64,
    rx: Receiver<StateDelta>,
}

impl StateStore {
    /// Create a store at version 1 and the sender feeding it.
    pub fn new(state: ProcessState) -> (Self, DeltaSender) {
        let (tx, rx) = channel::bounded(DELTA_QUEUE_CAPACITY);
        (
            Self {
                state,
                version: 1,
                rx,
            },
            DeltaSender { tx },
        )
    }

    /// Current state.
    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    /// Incremented on every effective change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Merge one delta. Returns whether the state changed.
    pub fn apply_delta(&mut self, delta: &StateDelta) -> Result<bool, StateError> {
        let merged = self.state.merged(delta)?;
        if merged == self.state {
            return Ok(false);
        }
        self.state = merged;
        self.version += 1;
        Ok(true)
    }

    /// Merge every queued delta. Rejected deltas are logged and dropped.
    ///
    /// Returns the number of deltas that changed the state.
    pub fn drain_deltas(&mut self) -> usize {
        let mut changed = 0;
        while let Ok(delta) = self.rx.try_recv() {
            let result = self.apply_delta(&delta);
            let delta = serde_json::Value::Object(delta);
            match result {
                Ok(true) => {
                    changed += 1;
                    tracing::info!("State updated to version {}: {}", self.version, delta);
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("Rejected state delta {}: {}", delta, e),
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> ProcessState {
        ProcessState {
            deviceid: "Bot".into(),
            timestamp_offset: 0.0,
            ..Default::default()
        }
    }

    fn delta(value: Value) -> StateDelta {
        match value {
            Value::Object(map) => map,
            _ => panic!("delta must be an object"),
        }
    }

    #[test]
    fn test_defaults_validate() {
        ProcessState::default().validate().expect("defaults");
        state().validate().expect("valid");
    }

    #[test]
    fn test_derived_settings() {
        let state = state();
        let format = state.record_format();
        assert_eq!(format.delimiter, b';');
        assert!(format.quoted);

        let formatter = state.formatter_config();
        assert_eq!(formatter.pre_drop_keys, vec!["UNITS".to_string()]);
        assert_eq!(formatter.metric_key, "PID");
        assert_eq!(formatter.reading_key, "VALUE");
        assert_eq!(formatter.time_key, "SECONDS");

        let rule = state.timestamp_rule();
        assert_eq!(rule.scale, 1.0);
        assert!(rule.format.is_none());
    }

    #[test]
    fn test_validation_failures() {
        let bad_topic = ProcessState {
            topic_name: "vt/{vin}".into(),
            ..state()
        };
        assert!(matches!(bad_topic.validate(), Err(StateError::Topic(_))));

        let zero_scale = ProcessState {
            time_scale: 0.0,
            ..state()
        };
        assert!(zero_scale.validate().is_err());

        let long_separator = ProcessState {
            record_separator: "::".into(),
            ..state()
        };
        assert!(matches!(long_separator.validate(), Err(StateError::Invalid(_))));

        let tab = ProcessState {
            record_separator: "\t".into(),
            ..state()
        };
        tab.validate().expect("tab separator");
        assert_eq!(tab.record_format().delimiter, b'\t');

        let zero_rate = ProcessState {
            message_publish_rate: Some(0.0),
            ..state()
        };
        assert!(zero_rate.validate().is_err());

        let unlabelled = ProcessState {
            measure_column: String::new(),
            ..state()
        };
        assert!(unlabelled.validate().is_err());
        ProcessState {
            payload_strategy: PayloadStrategy::Passthrough,
            ..unlabelled
        }
        .validate()
        .expect("passthrough needs no keys");
    }

    #[test]
    fn test_offset_accepts_yesterday() {
        let parsed: ProcessState =
            serde_json::from_value(json!({"timestamp_offset": "yesterday"})).expect("parse");
        assert_eq!(parsed.timestamp_offset, yesterday_midnight());
        assert!(parsed.timestamp_offset > 0.0);

        let numeric: ProcessState =
            serde_json::from_value(json!({"timestamp_offset": 12.5})).expect("parse");
        assert_eq!(numeric.timestamp_offset, 12.5);

        assert!(serde_json::from_value::<ProcessState>(json!({"timestamp_offset": "soon"})).is_err());
    }

    #[test]
    fn test_document_keeps_unknown_keys() {
        let parsed: ProcessState = serde_json::from_value(json!({
            "deviceid": "car-1",
            "timestamp_offset": 0,
            "topic_strategy": "SimpleFormattedTopic"
        }))
        .expect("parse");

        let document = parsed.to_document().expect("document");
        assert_eq!(document["topic_strategy"], "SimpleFormattedTopic");
        assert_eq!(document["deviceid"], "car-1");
        assert_eq!(document["payload_strategy"], "UntimedDynamicLabelledPayload");
        assert!(document["timestamp_format"].is_null());
    }

    #[test]
    fn test_delta_bumps_version_only_on_change() {
        let (mut store, _tx) = StateStore::new(state());
        assert_eq!(store.version(), 1);

        let changed = store
            .apply_delta(&delta(json!({"file": "file:///tmp/b.csv", "at_end": "repeat"})))
            .expect("apply");
        assert!(changed);
        assert_eq!(store.version(), 2);
        assert_eq!(store.state().file, "file:///tmp/b.csv");
        assert_eq!(store.state().at_end, EndPolicy::Repeat);

        let unchanged = store
            .apply_delta(&delta(json!({"file": "file:///tmp/b.csv"})))
            .expect("apply");
        assert!(!unchanged);
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn test_rejected_delta_leaves_state_untouched() {
        let (mut store, _tx) = StateStore::new(state());
        let before = store.state().clone();

        assert!(store
            .apply_delta(&delta(json!({"file": "b.csv", "time_scale": "fast"})))
            .is_err());
        assert!(store
            .apply_delta(&delta(json!({"topic_name": "t/{nope}"})))
            .is_err());

        assert_eq!(store.state(), &before);
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_drain_deltas_from_other_thread() {
        let (mut store, tx) = StateStore::new(state());

        let handle = std::thread::spawn(move || {
            assert!(tx.send(delta(json!({"message_publish_rate": 2.0}))));
            assert!(tx.send(delta(json!({"time_scale": 0}))));
            assert!(tx.send(delta(json!({"deviceid": "car-9"}))));
        });
        handle.join().expect("sender thread");

        assert_eq!(store.drain_deltas(), 2);
        assert_eq!(store.version(), 3);
        assert_eq!(store.state().message_publish_rate, Some(2.0));
        assert_eq!(store.state().deviceid, "car-9");
        assert_eq!(store.state().time_scale, 1.0);
    }

    #[test]
    fn test_null_clears_optional_keys() {
        let (mut store, _tx) = StateStore::new(ProcessState {
            timestamp_format: Some("%Y".into()),
            ..state()
        });
        store
            .apply_delta(&delta(json!({"timestamp_format": null, "message_publish_rate": null})))
            .expect("apply");
        assert!(store.state().timestamp_format.is_none());
        assert!(store.state().message_publish_rate.is_none());
        let document = store.state().to_document().expect("document");
        assert_eq!(document["message_publish_rate"], "source");

        store
            .apply_delta(&delta(json!({"message_publish_rate": 4})))
            .expect("apply");
        assert_eq!(store.state().message_publish_rate, Some(4.0));

        assert!(store.apply_delta(&delta(json!({"file": null}))).is_err());
    }
}
