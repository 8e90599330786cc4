// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT connection to the broker.
//!
//! Each `connect` opens a fresh rumqttc session and spawns a thread that
//! drives its event loop. The thread tracks ConnAck/PubAck, subscribes to the
//! shadow topics whenever the broker starts a clean session, and forwards
//! shadow deltas to the state store.

use crate::shadow::{self, ShadowTopics};
use parking_lot::Mutex;
use rumqttc::{
    Client, ClientError, Connection, Event, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration,
    Transport,
};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use telemetry_replay::{DeltaSender, InFlight, MessageId, PublishError, Publisher, Qos};
use thiserror::Error;

/// Connection setup errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid connection settings: {0}")]
    Invalid(String),
}

/// PEM files for mutual TLS.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub root_ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Broker host name.
    pub endpoint: String,

    /// Broker port (8883 for TLS).
    pub port: u16,

    /// Thing name; also the MQTT client id and shadow name.
    pub thing_name: String,

    /// TLS material. Plain TCP when `None`.
    pub tls: Option<TlsFiles>,

    /// Keep-alive interval.
    pub keep_alive: Duration,

    /// Requests queued while the connection is blocked.
    pub queue_depth: usize,
}

impl ConnectionSettings {
    pub fn new(endpoint: impl Into<String>, port: u16, thing_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            port,
            thing_name: thing_name.into(),
            tls: None,
            keep_alive: Duration::from_secs(30),
            queue_depth: 10,
        }
    }

    /// Use mutual TLS with the given PEM files.
    pub fn with_tls(mut self, tls: TlsFiles) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Build rumqttc options, reading the PEM files.
    pub fn mqtt_options(&self) -> Result<MqttOptions, ConnectionError> {
        if self.endpoint.is_empty() {
            return Err(ConnectionError::Invalid("endpoint must not be empty".into()));
        }
        if self.thing_name.is_empty() {
            return Err(ConnectionError::Invalid("thing name must not be empty".into()));
        }

        let mut options = MqttOptions::new(&self.thing_name, &self.endpoint, self.port);
        options.set_keep_alive(self.keep_alive);

        if let Some(tls) = &self.tls {
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca: read_pem(&tls.root_ca)?,
                alpn: None,
                client_auth: Some((read_pem(&tls.cert)?, read_pem(&tls.key)?)),
            }));
        }
        Ok(options)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConnectionError> {
    std::fs::read(path).map_err(|source| ConnectionError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// State shared with the event thread.
#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    /// QoS 1 publishes queued but not yet given a packet id.
    queued: AtomicUsize,
    in_flight: Mutex<InFlight>,
}

impl Shared {
    /// Count a QoS 1 request before it is handed to the client.
    fn reserve(&self) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo [`Shared::reserve`] for a request the client refused.
    fn release(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// A QoS 1 publish went out with `pkid`.
    ///
    /// Retransmissions reuse their packet id and are not counted again.
    fn sent(&self, pkid: u16) {
        if self.in_flight.lock().track(MessageId::from(pkid)) {
            self.release();
        }
    }

    fn pending(&self) -> usize {
        self.queued.load(Ordering::SeqCst) + self.in_flight.lock().len()
    }
}

struct Session {
    client: Client,
    closed: Arc<AtomicBool>,
    _events: JoinHandle<()>,
}

/// MQTT publisher with device shadow sync.
pub struct MqttConnection {
    options: MqttOptions,
    queue_depth: usize,
    topics: ShadowTopics,
    deltas: DeltaSender,
    shared: Arc<Shared>,
    session: Option<Session>,
    next_id: MessageId,
}

/// Pause before the event loop retries a failed connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

impl MqttConnection {
    /// Prepare a connection. Nothing is opened until [`Publisher::connect`].
    pub fn new(settings: &ConnectionSettings, deltas: DeltaSender) -> Result<Self, ConnectionError> {
        Ok(Self {
            options: settings.mqtt_options()?,
            queue_depth: settings.queue_depth.max(1),
            topics: ShadowTopics::new(&settings.thing_name),
            deltas,
            shared: Arc::new(Shared::default()),
            session: None,
            next_id: 0,
        })
    }

    /// Block until the broker acknowledges the connection or `timeout` passes.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_connected() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(50));
        }
        true
    }

    /// Acknowledged publishes so far.
    pub fn acked(&self) -> u64 {
        self.shared.in_flight.lock().acked()
    }

    fn client(&self) -> Result<&Client, PublishError> {
        self.session
            .as_ref()
            .map(|session| &session.client)
            .ok_or(PublishError::NotConnected)
    }
}

fn qos_of(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

fn map_client_error(error: ClientError) -> PublishError {
    match error {
        ClientError::TryRequest(_) => PublishError::Backpressure,
        ClientError::Request(_) => PublishError::NotConnected,
    }
}

impl Publisher for MqttConnection {
    fn connect(&mut self) -> Result<(), PublishError> {
        if self.session.is_some() {
            return Ok(());
        }

        let (client, connection) = Client::new(self.options.clone(), self.queue_depth);

        let closed = Arc::new(AtomicBool::new(false));
        let events = SessionEvents {
            client: client.clone(),
            shared: Arc::clone(&self.shared),
            closed: Arc::clone(&closed),
            topics: self.topics.clone(),
            deltas: self.deltas.clone(),
        };
        let handle = thread::Builder::new()
            .name("mqtt-events".into())
            .spawn(move || events.run(connection))
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let (host, port) = self.options.broker_address();
        tracing::info!("Connecting to {}:{} as {}", host, port, self.options.client_id());

        self.session = Some(Session {
            client,
            closed,
            _events: handle,
        });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), PublishError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        session.closed.store(true, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.queued.store(0, Ordering::SeqCst);
        self.shared.in_flight.lock().clear();

        if let Err(e) = session.client.try_disconnect() {
            tracing::debug!("Disconnect request not sent: {}", e);
        }
        tracing::info!("Disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some() && self.shared.connected.load(Ordering::SeqCst)
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: Qos) -> Result<MessageId, PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }

        let client = self.client()?;
        let acked = qos == Qos::AtLeastOnce;
        if acked {
            self.shared.reserve();
        }
        if let Err(e) = client.try_publish(topic, qos_of(qos), false, payload.to_vec()) {
            if acked {
                self.shared.release();
            }
            return Err(map_client_error(e));
        }

        self.next_id += 1;
        Ok(self.next_id)
    }

    fn update_document(&mut self, document: &Map<String, Value>) -> Result<(), PublishError> {
        let body = shadow::reported_document(document).to_string();
        let client = self.client()?;
        self.shared.reserve();
        let topic = self.topics.update.as_str();
        if let Err(e) = client.try_publish(topic, QoS::AtLeastOnce, false, body) {
            self.shared.release();
            return Err(map_client_error(e));
        }
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.shared.pending()
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            tracing::debug!("Disconnect on drop failed: {}", e);
        }
    }
}

/// Event thread state for one session.
struct SessionEvents {
    client: Client,
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
    topics: ShadowTopics,
    deltas: DeltaSender,
}

impl SessionEvents {
    fn run(self, mut connection: Connection) {
        for notification in connection.iter() {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }

            match notification {
                Ok(event) => self.handle(event),
                Err(e) => {
                    self.shared.connected.store(false, Ordering::SeqCst);
                    tracing::warn!("MQTT connection error: {}", e);
                    thread::sleep(RECONNECT_DELAY);
                }
            }
        }
        tracing::debug!("MQTT event loop stopped");
    }

    fn handle(&self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                self.shared.connected.store(true, Ordering::SeqCst);
                tracing::info!("Connected ({:?})", ack.code);
                if !ack.session_present {
                    self.subscribe();
                }
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                if !self.shared.in_flight.lock().ack(MessageId::from(ack.pkid)) {
                    tracing::trace!("PubAck for untracked packet {}", ack.pkid);
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                self.handle_publish(&publish.topic, &publish.payload)
            }
            Event::Incoming(Packet::Disconnect) => {
                self.shared.connected.store(false, Ordering::SeqCst);
                tracing::warn!("Broker closed the connection");
            }
            Event::Outgoing(Outgoing::Publish(pkid)) if pkid != 0 => self.shared.sent(pkid),
            _ => {}
        }
    }

    /// Queue subscriptions to the shadow topics. A clean session starts
    /// without them, including after an automatic reconnect.
    fn subscribe(&self) {
        for topic in [&self.topics.delta, &self.topics.rejected] {
            match self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                Ok(()) => tracing::debug!("Subscribing to {}", topic),
                Err(e) => tracing::warn!("Cannot subscribe to {}: {}", topic, e),
            }
        }
    }

    fn handle_publish(&self, topic: &str, payload: &[u8]) {
        if topic == self.topics.delta {
            match shadow::parse_delta(payload) {
                Ok(delta) => {
                    let logged = serde_json::Value::Object(delta.clone());
                    tracing::info!("Got a shadow delta: {}", logged);
                    if !self.deltas.send(delta) {
                        tracing::warn!("State store gone, delta dropped");
                    }
                }
                Err(e) => tracing::warn!("Ignoring shadow delta: {}", e),
            }
        } else if topic == self.topics.rejected {
            tracing::warn!(
                "Shadow update rejected: {}",
                String::from_utf8_lossy(payload)
            );
        }
    }
}
