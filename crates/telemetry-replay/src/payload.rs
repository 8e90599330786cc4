// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload formatting strategies.
//!
//! Every strategy runs the same pipeline:
//!
//! ```text
//! Sample --pre-drop--> copy --strategy transform--> post-drop --> Message
//! ```
//!
//! - `SimpleLabelledPayload` keeps wide rows as they are (one key per column)
//! - `DynamicLabelledPayload` folds long rows (`PID=RPM, VALUE=2500`) into
//!   `{"RPM": 2500.0}`
//! - `UntimedDynamicLabelledPayload` does the same and also drops the time
//!   column from the body

use crate::cursor::Sample;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A formatted message body, in insertion order.
pub type Message = Map<String, Value>;

/// Errors raised while deriving a labelled entry.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("key '{0}' missing from sample")]
    MissingKey(String),

    #[error("value '{value}' for key '{key}' is not {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("unknown payload strategy: {0}")]
    UnknownStrategy(String),
}

/// How a reading is converted before it is inserted into the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueTransform {
    /// Parse as a floating point number.
    #[default]
    Float,
    /// Parse as a signed integer.
    Integer,
    /// Keep the raw string.
    Text,
}

impl ValueTransform {
    /// Convert a raw reading taken from `key`.
    pub fn apply(&self, key: &str, raw: &str) -> Result<Value, PayloadError> {
        let invalid = |expected| PayloadError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            expected,
        };

        match self {
            Self::Float => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| invalid("a finite number")),
            Self::Integer => raw
                .trim()
                .parse::<i64>()
                .map(|v| Value::Number(v.into()))
                .map_err(|_| invalid("an integer")),
            Self::Text => Ok(Value::String(raw.to_string())),
        }
    }
}

/// Formatter settings, rebuilt whenever the process state changes.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatterConfig {
    /// Keys removed from the sample before formatting.
    pub pre_drop_keys: Vec<String>,

    /// Keys removed from the message after formatting.
    pub post_drop_keys: Vec<String>,

    /// Column holding the metric name (labelled strategies).
    pub metric_key: String,

    /// Column holding the reading (labelled strategies).
    pub reading_key: String,

    /// Time column (dropped by the untimed strategy).
    pub time_key: String,

    /// Conversion applied to readings.
    pub value_transform: ValueTransform,
}

impl Default for FormatterConfig {
    fn default() -> Self {
        Self {
            pre_drop_keys: Vec::new(),
            post_drop_keys: Vec::new(),
            metric_key: "status".into(),
            reading_key: "value".into(),
            time_key: "timestamp".into(),
            value_transform: ValueTransform::Float,
        }
    }
}

impl FormatterConfig {
    /// Set the keys dropped before formatting.
    pub fn pre_drop<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pre_drop_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set the keys dropped after formatting.
    pub fn post_drop<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.post_drop_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set the metric and reading columns.
    pub fn labelled(mut self, metric_key: impl Into<String>, reading_key: impl Into<String>) -> Self {
        self.metric_key = metric_key.into();
        self.reading_key = reading_key.into();
        self
    }

    /// Set the time column.
    pub fn time_key(mut self, key: impl Into<String>) -> Self {
        self.time_key = key.into();
        self
    }

    /// Set the reading conversion.
    pub fn value_transform(mut self, transform: ValueTransform) -> Self {
        self.value_transform = transform;
        self
    }
}

/// Payload formatting strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PayloadStrategy {
    /// Copy the (pre-dropped) sample as is.
    #[default]
    #[serde(rename = "SimpleLabelledPayload", alias = "passthrough")]
    Passthrough,

    /// `message[sample[metric_key]] = transform(sample[reading_key])`.
    #[serde(rename = "DynamicLabelledPayload", alias = "dynamic_labelled")]
    DynamicLabelled,

    /// Dynamic labelled, without the time column.
    #[serde(
        rename = "UntimedDynamicLabelledPayload",
        alias = "untimed_dynamic_labelled"
    )]
    UntimedDynamicLabelled,
}

impl PayloadStrategy {
    /// Configuration name of the strategy.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Passthrough => "SimpleLabelledPayload",
            Self::DynamicLabelled => "DynamicLabelledPayload",
            Self::UntimedDynamicLabelled => "UntimedDynamicLabelledPayload",
        }
    }

    /// Whether the strategy reads the metric/reading columns.
    pub fn is_labelled(&self) -> bool {
        !matches!(self, Self::Passthrough)
    }

    /// Format a sample into a message body.
    ///
    /// A missing key or unparseable reading is logged and the derived entry
    /// is left out; the rest of the message is still produced.
    pub fn format(&self, sample: &Sample, config: &FormatterConfig) -> Message {
        let mut message: Message = sample
            .iter()
            .filter(|(key, _)| !key.is_empty() && !config.pre_drop_keys.iter().any(|k| k == key))
            .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
            .collect();

        if self.is_labelled() {
            if let Err(e) = insert_labelled(&mut message, config) {
                tracing::warn!("Labelled entry skipped: {}", e);
            }
        }

        for key in self.post_drop_keys(config) {
            message.shift_remove(key);
        }

        message
    }

    fn post_drop_keys<'a>(&self, config: &'a FormatterConfig) -> Vec<&'a str> {
        let mut keys: Vec<&str> = config.post_drop_keys.iter().map(String::as_str).collect();
        match self {
            Self::Passthrough => {}
            Self::DynamicLabelled => {
                keys.extend([config.metric_key.as_str(), config.reading_key.as_str()]);
            }
            Self::UntimedDynamicLabelled => {
                keys.extend([
                    config.metric_key.as_str(),
                    config.reading_key.as_str(),
                    config.time_key.as_str(),
                ]);
            }
        }
        keys
    }
}

impl fmt::Display for PayloadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PayloadStrategy {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SimpleLabelledPayload" | "passthrough" => Ok(Self::Passthrough),
            "DynamicLabelledPayload" | "dynamic_labelled" => Ok(Self::DynamicLabelled),
            "UntimedDynamicLabelledPayload" | "untimed_dynamic_labelled" => {
                Ok(Self::UntimedDynamicLabelled)
            }
            other => Err(PayloadError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Lookups go through the pre-dropped copy, so a pre-dropped metric or
/// reading column counts as missing.
fn insert_labelled(message: &mut Message, config: &FormatterConfig) -> Result<(), PayloadError> {
    let lookup = |key: &str| {
        message
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PayloadError::MissingKey(key.to_string()))
    };

    let metric = lookup(&config.metric_key)?;
    let reading = lookup(&config.reading_key)?;
    let value = config.value_transform.apply(&config.reading_key, &reading)?;
    message.insert(metric, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obd_sample() -> Sample {
        Sample::from_pairs([("PID", "RPM"), ("VALUE", "2500"), ("UNITS", "rpm")])
    }

    #[test]
    fn test_dynamic_labelled_folds_metric() {
        let config = FormatterConfig::default()
            .pre_drop(["UNITS"])
            .labelled("PID", "VALUE");

        let message = PayloadStrategy::DynamicLabelled.format(&obd_sample(), &config);
        assert_eq!(Value::Object(message), json!({"RPM": 2500.0}));
    }

    #[test]
    fn test_untimed_drops_time_column() {
        let sample = Sample::from_pairs([
            ("SECONDS", "12.5"),
            ("PID", "SPEED"),
            ("VALUE", "42.0"),
            ("UNITS", "km/h"),
        ]);
        let config = FormatterConfig::default()
            .pre_drop(["UNITS"])
            .labelled("PID", "VALUE")
            .time_key("SECONDS");

        let untimed = PayloadStrategy::UntimedDynamicLabelled.format(&sample, &config);
        assert_eq!(Value::Object(untimed), json!({"SPEED": 42.0}));

        let timed = PayloadStrategy::DynamicLabelled.format(&sample, &config);
        assert_eq!(Value::Object(timed), json!({"SECONDS": "12.5", "SPEED": 42.0}));
    }

    #[test]
    fn test_passthrough_drops_empty_key_only() {
        let sample = Sample::from_pairs([("", "x"), ("Timestamp(ms)", "5000"), ("e.t", "18.2")]);
        let message = PayloadStrategy::Passthrough.format(&sample, &FormatterConfig::default());

        let keys: Vec<&String> = message.keys().collect();
        assert_eq!(keys, ["Timestamp(ms)", "e.t"]);
        assert_eq!(message["e.t"], json!("18.2"));
    }

    #[test]
    fn test_post_drop_preserves_order() {
        let sample = Sample::from_pairs([("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]);
        let config = FormatterConfig::default().post_drop(["b"]);
        let message = PayloadStrategy::Passthrough.format(&sample, &config);

        let keys: Vec<&String> = message.keys().collect();
        assert_eq!(keys, ["a", "c", "d"]);
    }

    #[test]
    fn test_missing_reading_keeps_rest_of_message() {
        let sample = Sample::from_pairs([("PID", "RPM"), ("UNITS", "rpm")]);
        let config = FormatterConfig::default().labelled("PID", "VALUE");

        let message = PayloadStrategy::DynamicLabelled.format(&sample, &config);
        assert_eq!(Value::Object(message), json!({"UNITS": "rpm"}));
    }

    #[test]
    fn test_pre_dropped_metric_counts_as_missing() {
        let config = FormatterConfig::default()
            .pre_drop(["PID"])
            .labelled("PID", "VALUE");

        let message = PayloadStrategy::DynamicLabelled.format(&obd_sample(), &config);
        assert_eq!(Value::Object(message), json!({"UNITS": "rpm"}));
    }

    #[test]
    fn test_unparseable_reading_is_omitted() {
        let sample = Sample::from_pairs([("PID", "VIN"), ("VALUE", "1FTFW1ET")]);
        let config = FormatterConfig::default().labelled("PID", "VALUE");

        let message = PayloadStrategy::DynamicLabelled.format(&sample, &config);
        assert!(message.is_empty());
    }

    #[test]
    fn test_value_transforms() {
        assert_eq!(
            ValueTransform::Integer.apply("v", " 42 ").expect("int"),
            json!(42)
        );
        assert_eq!(
            ValueTransform::Text.apply("v", "on").expect("text"),
            json!("on")
        );
        assert!(ValueTransform::Float.apply("v", "NaN").is_err());
        assert!(ValueTransform::Integer.apply("v", "4.5").is_err());
    }

    #[test]
    fn test_strategy_names() {
        for strategy in [
            PayloadStrategy::Passthrough,
            PayloadStrategy::DynamicLabelled,
            PayloadStrategy::UntimedDynamicLabelled,
        ] {
            assert_eq!(strategy.name().parse::<PayloadStrategy>().expect("parse"), strategy);
        }
        assert_eq!(
            "untimed_dynamic_labelled".parse::<PayloadStrategy>().expect("alias"),
            PayloadStrategy::UntimedDynamicLabelled
        );
        assert!("Reflective".parse::<PayloadStrategy>().is_err());
    }

    #[test]
    fn test_strategy_serde_alias() {
        let parsed: PayloadStrategy = serde_json::from_value(json!("dynamic_labelled")).expect("de");
        assert_eq!(parsed, PayloadStrategy::DynamicLabelled);
        assert_eq!(
            serde_json::to_value(parsed).expect("ser"),
            json!("DynamicLabelledPayload")
        );
    }
}
