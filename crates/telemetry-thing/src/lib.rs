// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry Thing
//!
//! MQTT side of the telemetry replay: a [`Publisher`](telemetry_replay::Publisher)
//! over rumqttc that reports the replay state to the thing's device shadow and
//! feeds shadow deltas back into the state store.
//!
//! # Usage
//!
//! ```bash
//! telemetry-thing --endpoint abc123-ats.iot.eu-west-1.amazonaws.com \
//!     --root-ca root-CA.crt --cert Bot.cert.pem --key Bot.private.key \
//!     --thing-name Bot --config replay.toml
//! ```

pub mod connection;
pub mod shadow;

pub use connection::{ConnectionError, ConnectionSettings, MqttConnection, TlsFiles};
pub use shadow::{parse_delta, reported_document, ShadowError, ShadowTopics};
