// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry Replay
//!
//! Replay recorded telemetry files onto a pub/sub broker as if they were a
//! live feed:
//! - Delimited files from a local path, `file://` or `s3://` (cached locally)
//! - Pluggable payload strategies (wide rows or metric/value rows)
//! - Fixed-rate or source-timestamp pacing
//! - Fibonacci backoff on blocked publishes, escalating to a reconnect
//! - Remote state deltas applied between ticks
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use telemetry_replay::{
//!     pacing, LogPublisher, Pacing, ProcessState, PublishDriver, Publisher, RecordCursor,
//!     ReplayConfig, StateStore, ThreadSleeper,
//! };
//!
//! let config = ReplayConfig::from_file("replay.toml")?;
//! let state = ProcessState {
//!     deviceid: "Bot".into(),
//!     ..config.state.clone()
//! };
//! let pacing = Pacing::from_rate(state.message_publish_rate, config.driver.poll_interval());
//!
//! let cursor = RecordCursor::new(config.resolver(), state.record_format());
//! let (store, _deltas) = StateStore::new(state);
//! let mut publisher = LogPublisher::new();
//! publisher.connect()?;
//!
//! let mut driver = PublishDriver::new(cursor, store, publisher, config.driver.clone())?;
//! let stats = pacing::run(&mut driver, pacing, &mut ThreadSleeper::new(), &AtomicBool::new(true));
//! println!("published {}", stats.published);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Payload Strategies
//!
//! | Strategy | Row | Message |
//! |----------|-----|---------|
//! | `SimpleLabelledPayload` | `t=1, RPM=2500` | `{"t":"1","RPM":"2500"}` |
//! | `DynamicLabelledPayload` | `t=1, PID=RPM, VALUE=2500` | `{"t":"1","RPM":2500.0}` |
//! | `UntimedDynamicLabelledPayload` | `t=1, PID=RPM, VALUE=2500` | `{"RPM":2500.0}` |

pub mod backoff;
pub mod config;
pub mod cursor;
pub mod driver;
pub mod pacing;
pub mod payload;
pub mod publisher;
pub mod source;
pub mod state;
pub mod timestamp;
pub mod topic;

pub use backoff::{BackoffStep, FibonacciBackoff};
pub use config::{ConfigError, ReplayConfig, SourceConfig};
pub use cursor::{CursorStats, EndPolicy, RecordCursor, RecordError, RecordFormat, Sample};
pub use driver::{DriverConfig, DriverStats, PublishDriver, Sleeper, ThreadSleeper, TickOutcome};
pub use pacing::{Pacing, PacingLoop};
pub use payload::{FormatterConfig, Message, PayloadError, PayloadStrategy, ValueTransform};
pub use publisher::{InFlight, LogPublisher, MessageId, PublishError, Publisher, Qos};
pub use source::{CachedResolver, ObjectFetcher, SourceError, SourceResolver, SourceUri};
pub use state::{DeltaSender, ProcessState, StateDelta, StateError, StateStore};
pub use timestamp::{TimestampError, TimestampRule};
pub use topic::{TopicError, TopicTemplate, TopicVars};

// Object-store fetch (requires "s3" feature)
#[cfg(feature = "s3")]
pub use source::{HttpObjectFetcher, S3ObjectFetcher};
