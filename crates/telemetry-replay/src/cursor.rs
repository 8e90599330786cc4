// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Delimited record cursor.
//!
//! Reads a header record once per open, then turns every following record
//! into a [`Sample`] keyed by the header columns. Parsing goes through a
//! `csv` reader, which skips blank lines. At end of stream the cursor closes
//! and, under [`EndPolicy::Repeat`], reopens the same source from the start.

use crate::source::{SourceError, SourceResolver, SourceUri};
use csv::{ByteRecord, Position, ReaderBuilder};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// What to do once the source is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndPolicy {
    /// Stop the replay after draining in-flight messages.
    #[default]
    Stop,
    /// Reopen the source and replay from the first data row.
    Repeat,
    /// Leave the cursor closed and keep polling.
    #[serde(other)]
    Wait,
}

/// Record decoding errors. Each one skips a single line.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("line {line}: not valid UTF-8")]
    Decode { line: u64 },

    #[error("line {line}: expected {expected} fields, found {found}")]
    Arity {
        line: u64,
        expected: u64,
        found: u64,
    },

    #[error("line {line}: {source}")]
    Csv { line: u64, source: csv::Error },
}

impl From<csv::Error> for RecordError {
    fn from(error: csv::Error) -> Self {
        let line = error.position().map_or(0, Position::line);
        if let csv::ErrorKind::UnequalLengths {
            expected_len, len, ..
        } = error.kind()
        {
            return Self::Arity {
                line,
                expected: *expected_len,
                found: *len,
            };
        }
        Self::Csv {
            line,
            source: error,
        }
    }
}

/// Record layout of a delimited source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFormat {
    /// Field delimiter byte.
    pub delimiter: u8,

    /// Treat `"` as field quoting.
    pub quoted: bool,

    /// Reject rows whose field count differs from the header.
    ///
    /// When off, long rows are truncated and short rows yield samples
    /// without their trailing keys.
    pub strict_arity: bool,
}

impl Default for RecordFormat {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quoted: false,
            strict_arity: false,
        }
    }
}

impl RecordFormat {
    /// Create a format with the given delimiter.
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            ..Default::default()
        }
    }

    /// Enable quoting.
    pub fn quoted(mut self, quoted: bool) -> Self {
        self.quoted = quoted;
        self
    }

    /// Enable strict field-count checking.
    pub fn strict_arity(mut self, strict: bool) -> Self {
        self.strict_arity = strict;
        self
    }

    fn reader_builder(&self) -> ReaderBuilder {
        let mut builder = ReaderBuilder::new();
        builder
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(!self.strict_arity)
            .quoting(self.quoted);
        builder
    }
}

/// One decoded row: column name to raw value, in header order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sample {
    fields: Vec<(String, String)>,
}

impl Sample {
    /// Build a sample from `(column, value)` pairs.
    ///
    /// A repeated column keeps its first position and takes the later value.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut sample = Self::default();
        for (key, value) in pairs {
            sample.insert(key.into(), value.into());
        }
        sample
    }

    fn insert(&mut self, key: String, value: String) {
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    /// Value for a column.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Column names in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    /// `(column, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Cursor statistics.
#[derive(Debug, Clone, Default)]
pub struct CursorStats {
    /// Samples produced.
    pub samples_read: u64,

    /// Lines skipped as malformed.
    pub malformed_skipped: u64,

    /// Times the source was reopened after exhaustion.
    pub loops_completed: u32,

    /// Failed open attempts.
    pub open_failures: u32,
}

struct OpenStream {
    path: PathBuf,
    reader: csv::Reader<File>,
    columns: Vec<String>,
    record: ByteRecord,
}

/// Cursor over a delimited telemetry file.
pub struct RecordCursor {
    resolver: Box<dyn SourceResolver>,
    format: RecordFormat,
    end_policy: EndPolicy,
    uri: Option<String>,
    stream: Option<OpenStream>,
    stats: CursorStats,
}

impl RecordCursor {
    /// Create a closed cursor.
    pub fn new(resolver: impl SourceResolver + 'static, format: RecordFormat) -> Self {
        Self {
            resolver: Box::new(resolver),
            format,
            end_policy: EndPolicy::default(),
            uri: None,
            stream: None,
            stats: CursorStats::default(),
        }
    }

    /// Set the end-of-stream policy.
    pub fn with_end_policy(mut self, policy: EndPolicy) -> Self {
        self.end_policy = policy;
        self
    }

    /// Change the end-of-stream policy.
    pub fn set_end_policy(&mut self, policy: EndPolicy) {
        self.end_policy = policy;
    }

    /// Change the record format. Takes effect on the next open.
    pub fn set_format(&mut self, format: RecordFormat) {
        self.format = format;
    }

    /// Point the cursor at `uri`.
    ///
    /// No-op when `uri` is the current source; otherwise closes the current
    /// stream, resets the columns and opens the new source.
    pub fn use_source(&mut self, uri: &str) {
        if self.uri.as_deref() == Some(uri) {
            return;
        }

        self.close();
        if let Err(e) = self.open(uri) {
            tracing::warn!("Error opening {}: {}", uri, e);
        }
    }

    /// Open `uri` and read its header record.
    ///
    /// On failure the cursor stays closed but remembers `uri`.
    pub fn open(&mut self, uri: &str) -> Result<(), SourceError> {
        self.close();
        self.uri = Some(uri.to_string());

        match self.open_stream(uri) {
            Ok(stream) => {
                tracing::info!(
                    "Opened {} ({} columns)",
                    stream.path.display(),
                    stream.columns.len()
                );
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                self.stats.open_failures += 1;
                Err(e)
            }
        }
    }

    fn open_stream(&self, uri: &str) -> Result<OpenStream, SourceError> {
        let parsed = SourceUri::parse(uri)?;
        let path = self.resolver.resolve(&parsed)?;
        let mut reader = self.format.reader_builder().from_reader(File::open(&path)?);

        let columns: Vec<String> = reader
            .headers()
            .map_err(|e| SourceError::Header {
                path: path.clone(),
                reason: e.to_string(),
            })?
            .iter()
            .map(str::to_string)
            .collect();
        if columns.is_empty() {
            return Err(SourceError::Empty(path));
        }

        Ok(OpenStream {
            path,
            reader,
            columns,
            record: ByteRecord::new(),
        })
    }

    /// Release the file handle. Safe when already closed.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            tracing::debug!("Closed {}", stream.path.display());
        }
    }

    /// Read the next sample.
    ///
    /// Returns `None` when no record is available this call: the cursor is
    /// closed, the stream just ended, or the line was malformed. Under
    /// [`EndPolicy::Repeat`] the call after end of stream yields the first
    /// data row again.
    pub fn next_sample(&mut self) -> Option<Sample> {
        let stream = self.stream.as_mut()?;

        match read_record(stream) {
            Ok(Some(sample)) => {
                self.stats.samples_read += 1;
                Some(sample)
            }
            Ok(None) => {
                tracing::info!("End of file reached: {}", stream.path.display());
                self.close();
                if self.end_policy == EndPolicy::Repeat {
                    self.reopen();
                }
                None
            }
            Err(e) => {
                self.stats.malformed_skipped += 1;
                tracing::warn!("Skipping record in {}: {}", stream.path.display(), e);
                None
            }
        }
    }

    fn reopen(&mut self) {
        let Some(uri) = self.uri.clone() else {
            return;
        };
        match self.open(&uri) {
            Ok(()) => {
                self.stats.loops_completed += 1;
                tracing::debug!("Replaying {} (loop {})", uri, self.stats.loops_completed);
            }
            Err(e) => tracing::warn!("Error reopening {}: {}", uri, e),
        }
    }

    /// Whether a stream is open.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Current source URI, if any.
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// Local path of the open stream.
    pub fn path(&self) -> Option<&Path> {
        self.stream.as_ref().map(|s| s.path.as_path())
    }

    /// Header columns of the open stream (empty when closed).
    pub fn columns(&self) -> &[String] {
        self.stream
            .as_ref()
            .map(|s| s.columns.as_slice())
            .unwrap_or(&[])
    }

    /// End-of-stream policy.
    pub fn end_policy(&self) -> EndPolicy {
        self.end_policy
    }

    /// Cursor statistics.
    pub fn stats(&self) -> &CursorStats {
        &self.stats
    }
}

/// Read one record and zip it against the header. `Ok(None)` means end of stream.
///
/// Zipping truncates long rows and leaves short rows without trailing keys.
fn read_record(stream: &mut OpenStream) -> Result<Option<Sample>, RecordError> {
    if !stream.reader.read_byte_record(&mut stream.record)? {
        return Ok(None);
    }
    let line = stream.record.position().map_or(0, Position::line);

    let mut values = Vec::with_capacity(stream.record.len());
    for field in stream.record.iter() {
        values.push(std::str::from_utf8(field).map_err(|_| RecordError::Decode { line })?);
    }

    Ok(Some(Sample::from_pairs(
        stream.columns.iter().map(String::as_str).zip(values),
    )))
}
