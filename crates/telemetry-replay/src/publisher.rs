// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher capability.
//!
//! The broker session lives behind [`Publisher`]; the driver only needs to
//! connect, publish, and push its state document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use thiserror::Error;

/// Identifier assigned to an accepted publish.
pub type MessageId = u64;

/// Delivery quality of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    /// Fire and forget.
    AtMostOnce,
    /// Acknowledged delivery.
    #[default]
    AtLeastOnce,
}

impl Qos {
    /// Numeric QoS level.
    pub fn level(&self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
        }
    }
}

/// Publish errors.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("transport not connected")]
    NotConnected,

    #[error("publish queue full")]
    Backpressure,

    #[error("publish cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),
}

impl PublishError {
    /// Whether the driver should back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Backpressure)
    }
}

/// A broker session able to publish messages and sync a state document.
pub trait Publisher {
    /// Open the session. No-op when already connected.
    fn connect(&mut self) -> Result<(), PublishError>;

    /// Close the session. No-op when already disconnected.
    fn disconnect(&mut self) -> Result<(), PublishError>;

    /// Whether the session can accept publishes.
    fn is_connected(&self) -> bool;

    /// Hand one message to the transport.
    fn publish(&mut self, topic: &str, payload: &[u8], qos: Qos) -> Result<MessageId, PublishError>;

    /// Report the full process state to the remote document store.
    fn update_document(&mut self, document: &Map<String, Value>) -> Result<(), PublishError>;

    /// Messages handed to the transport but not yet acknowledged.
    fn in_flight(&self) -> usize {
        0
    }
}

impl<P: Publisher + ?Sized> Publisher for Box<P> {
    fn connect(&mut self) -> Result<(), PublishError> {
        (**self).connect()
    }

    fn disconnect(&mut self) -> Result<(), PublishError> {
        (**self).disconnect()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: Qos) -> Result<MessageId, PublishError> {
        (**self).publish(topic, payload, qos)
    }

    fn update_document(&mut self, document: &Map<String, Value>) -> Result<(), PublishError> {
        (**self).update_document(document)
    }

    fn in_flight(&self) -> usize {
        (**self).in_flight()
    }
}

/// Acknowledgment bookkeeping for published message ids.
#[derive(Debug, Default)]
pub struct InFlight {
    pending: VecDeque<MessageId>,
    acked: u64,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an id. Returns false when the id is already tracked.
    pub fn track(&mut self, id: MessageId) -> bool {
        if self.pending.contains(&id) {
            return false;
        }
        self.pending.push_back(id);
        true
    }

    /// Stop tracking an acknowledged id. Returns false for unknown ids.
    pub fn ack(&mut self, id: MessageId) -> bool {
        match self.pending.iter().position(|&p| p == id) {
            Some(index) => {
                self.pending.remove(index);
                self.acked += 1;
                true
            }
            None => false,
        }
    }

    /// Forget everything still pending (the session was torn down).
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total acknowledgments received.
    pub fn acked(&self) -> u64 {
        self.acked
    }
}

/// Publisher that only logs; used for dry runs.
#[derive(Debug, Default)]
pub struct LogPublisher {
    connected: bool,
    next_id: MessageId,
    document_updates: u64,
}

impl LogPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages "published" so far.
    pub fn published(&self) -> u64 {
        self.next_id
    }

    /// Document updates received so far.
    pub fn document_updates(&self) -> u64 {
        self.document_updates
    }
}

impl Publisher for LogPublisher {
    fn connect(&mut self) -> Result<(), PublishError> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), PublishError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: Qos) -> Result<MessageId, PublishError> {
        if !self.connected {
            return Err(PublishError::NotConnected);
        }
        self.next_id += 1;
        tracing::info!(
            "[dry-run] qos={} {}: {}",
            qos.level(),
            topic,
            String::from_utf8_lossy(payload)
        );
        Ok(self.next_id)
    }

    fn update_document(&mut self, document: &Map<String, Value>) -> Result<(), PublishError> {
        self.document_updates += 1;
        let document = serde_json::Value::Object(document.clone());
        tracing::info!("[dry-run] state document: {}", document);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_ack_bookkeeping() {
        let mut in_flight = InFlight::new();
        in_flight.track(1);
        in_flight.track(2);
        in_flight.track(3);

        assert!(in_flight.ack(2));
        assert!(!in_flight.ack(2));
        assert!(!in_flight.ack(99));
        assert_eq!(in_flight.len(), 2);
        assert_eq!(in_flight.acked(), 1);

        in_flight.clear();
        assert!(in_flight.is_empty());
    }

    #[test]
    fn test_in_flight_retransmitted_id_tracked_once() {
        let mut in_flight = InFlight::new();
        assert!(in_flight.track(7));
        assert!(!in_flight.track(7));
        assert_eq!(in_flight.len(), 1);

        assert!(in_flight.ack(7));
        assert!(in_flight.is_empty());
    }

    #[test]
    fn test_log_publisher_requires_connect() {
        let mut publisher = LogPublisher::new();
        assert!(matches!(
            publisher.publish("t", b"{}", Qos::AtLeastOnce),
            Err(PublishError::NotConnected)
        ));

        publisher.connect().expect("connect");
        assert_eq!(publisher.publish("t", b"{}", Qos::AtLeastOnce).expect("publish"), 1);
        assert_eq!(publisher.publish("t", b"{}", Qos::AtMostOnce).expect("publish"), 2);
        assert_eq!(publisher.in_flight(), 0);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(PublishError::NotConnected.is_retryable());
        assert!(PublishError::Backpressure.is_retryable());
        assert!(!PublishError::Cancelled.is_retryable());
        assert!(!PublishError::Transport("tls".into()).is_retryable());
    }

    #[test]
    fn test_boxed_publisher_delegates() {
        let mut publisher: Box<dyn Publisher> = Box::new(LogPublisher::new());
        publisher.connect().expect("connect");
        assert!(publisher.is_connected());
        publisher.disconnect().expect("disconnect");
        assert!(!publisher.is_connected());
    }
}
