// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Timestamp normalization to milliseconds since the Unix epoch.

use crate::cursor::Sample;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};
use thiserror::Error;

/// Raw time value used when a sample has no time column.
pub const DEFAULT_SAMPLE_DURATION_MS: i64 = 1000;

/// Timestamp errors.
#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("time value '{0}' is not a number")]
    NotNumeric(String),

    #[error("time value '{value}' does not match format '{format}': {reason}")]
    Format {
        value: String,
        format: String,
        reason: String,
    },

    #[error("time value '{0}' is out of range")]
    OutOfRange(String),
}

/// How a sample's time column becomes epoch milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampRule {
    /// Time column name.
    pub column: String,

    /// Seconds added to numeric values.
    pub offset_secs: f64,

    /// Source units per second (1000.0 = values in milliseconds).
    pub scale: f64,

    /// Date/time format for string timestamps. Numeric when `None`.
    pub format: Option<String>,
}

impl TimestampRule {
    /// Numeric rule for `column` with no offset and millisecond values.
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            offset_secs: 0.0,
            scale: 1000.0,
            format: None,
        }
    }

    /// Set the offset in seconds.
    pub fn offset(mut self, offset_secs: f64) -> Self {
        self.offset_secs = offset_secs;
        self
    }

    /// Set the scale (units per second).
    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Parse values with a date/time format instead.
    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Effective timestamp of a sample in epoch milliseconds.
    pub fn normalize(&self, sample: &Sample) -> Result<i64, TimestampError> {
        match sample.get(&self.column) {
            Some(raw) => self.normalize_raw(raw),
            None => self.numeric(DEFAULT_SAMPLE_DURATION_MS as f64, "default"),
        }
    }

    /// Normalize a raw time value.
    ///
    /// Offset and scale only apply to numeric values; formatted values are
    /// converted as they read.
    pub fn normalize_raw(&self, raw: &str) -> Result<i64, TimestampError> {
        match &self.format {
            None => {
                let value: f64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| TimestampError::NotNumeric(raw.to_string()))?;
                self.numeric(value, raw)
            }
            Some(format) => parse_formatted(raw.trim(), format),
        }
    }

    fn numeric(&self, value: f64, raw: &str) -> Result<i64, TimestampError> {
        let millis = (value + self.offset_secs) / self.scale * 1000.0;
        if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
            return Err(TimestampError::OutOfRange(raw.to_string()));
        }
        Ok(millis as i64)
    }
}

/// Normalize `sample[column]` with the given offset, scale and optional format.
pub fn normalize(
    sample: &Sample,
    column: &str,
    offset_secs: f64,
    scale: f64,
    format: Option<&str>,
) -> Result<i64, TimestampError> {
    let mut rule = TimestampRule::new(column).offset(offset_secs).scale(scale);
    if let Some(format) = format {
        rule = rule.format(format);
    }
    rule.normalize(sample)
}

/// Values carrying a zone offset keep it; naive values are local time.
fn parse_formatted(raw: &str, format: &str) -> Result<i64, TimestampError> {
    let format = format.replace(".%f", "%.f");

    if let Ok(dt) = DateTime::parse_from_str(raw, &format) {
        return Ok(dt.timestamp_millis());
    }

    let naive = match NaiveDateTime::parse_from_str(raw, &format) {
        Ok(naive) => naive,
        // Date-only formats parse as midnight.
        Err(e) => NaiveDate::parse_from_str(raw, &format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .ok_or_else(|| TimestampError::Format {
                value: raw.to_string(),
                format: format.clone(),
                reason: e.to_string(),
            })?,
    };

    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| TimestampError::OutOfRange(raw.to_string()))
}
