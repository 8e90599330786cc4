// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device shadow documents.
//!
//! The replay state is reported as `{"state":{"reported":{...}}}` on the
//! thing's update topic. Desired changes come back on the delta topic as
//! `{"state":{...}, "version":..}` and are forwarded as state deltas.

use serde_json::{json, Value};
use telemetry_replay::StateDelta;
use thiserror::Error;

/// Shadow message errors.
#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("shadow payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("shadow delta has no 'state' object")]
    MissingState,
}

/// Shadow topics of one thing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowTopics {
    pub update: String,
    pub delta: String,
    pub rejected: String,
}

impl ShadowTopics {
    pub fn new(thing_name: &str) -> Self {
        let update = format!("$aws/things/{}/shadow/update", thing_name);
        Self {
            delta: format!("{}/delta", update),
            rejected: format!("{}/rejected", update),
            update,
        }
    }
}

/// Wrap the state as a reported-state update.
pub fn reported_document(state: &StateDelta) -> Value {
    json!({ "state": { "reported": state } })
}

/// Extract the desired-state changes from a delta message.
pub fn parse_delta(payload: &[u8]) -> Result<StateDelta, ShadowError> {
    let mut message: Value = serde_json::from_slice(payload)?;
    match message.get_mut("state").map(Value::take) {
        Some(Value::Object(state)) => Ok(state),
        _ => Err(ShadowError::MissingState),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics() {
        let topics = ShadowTopics::new("Bot");
        assert_eq!(topics.update, "$aws/things/Bot/shadow/update");
        assert_eq!(topics.delta, "$aws/things/Bot/shadow/update/delta");
        assert_eq!(topics.rejected, "$aws/things/Bot/shadow/update/rejected");
    }

    #[test]
    fn test_reported_document() {
        let mut state = StateDelta::new();
        state.insert("file".into(), json!("s3://bucket/100.csv"));
        state.insert("message_publish_rate".into(), json!(10.0));

        assert_eq!(
            reported_document(&state),
            json!({"state": {"reported": {"file": "s3://bucket/100.csv", "message_publish_rate": 10.0}}})
        );
    }

    #[test]
    fn test_parse_delta() {
        let payload = br#"{"version":12,"timestamp":1700000000,"state":{"at_end":"repeat","message_publish_rate":2},"metadata":{}}"#;
        let delta = parse_delta(payload).expect("delta");
        assert_eq!(delta.len(), 2);
        assert_eq!(delta["at_end"], "repeat");
        assert_eq!(delta["message_publish_rate"], 2);
    }

    #[test]
    fn test_parse_delta_rejects_bad_messages() {
        assert!(matches!(parse_delta(b"not json"), Err(ShadowError::Json(_))));
        assert!(matches!(
            parse_delta(br#"{"version":1}"#),
            Err(ShadowError::MissingState)
        ));
        assert!(matches!(
            parse_delta(br#"{"state":"repeat"}"#),
            Err(ShadowError::MissingState)
        ));
    }
}
