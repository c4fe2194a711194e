//! Client transports.
//!
//! `Connector` opens one `Transport` per simulated client. The MQTT
//! implementation drives a rumqttc event loop per connection and completes a
//! publish only when the broker's PUBACK for its packet id arrives. The
//! in-memory broker records every message and can inject connect/publish
//! faults, which is what dry runs and the scenario tests use.

use crate::config::MqttConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tbload_core::DeviceId;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A connected client channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a message; resolves once the broker acknowledged it.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// Opens transports for clients.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        client: &DeviceId,
        token: &str,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

/// MQTT connector; the access token is sent as the username.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: MqttConfig,
}

impl MqttConnector {
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }

    fn options(&self, client: &DeviceId, token: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client.as_str(), &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        options.set_credentials(token, "");
        options
    }
}

/// Poll until the broker answers the CONNECT.
async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(TransportError::Connect(format!("{:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(TransportError::Connect(e.to_string())),
        }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        client: &DeviceId,
        token: &str,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let (mqtt, mut eventloop) =
            AsyncClient::new(self.options(client, token), self.config.channel_capacity.max(10));

        let timeout = Duration::from_secs(self.config.connect_timeout_secs.max(1));
        match tokio::time::timeout(timeout, await_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransportError::Connect(format!(
                    "no CONNACK within {:?}",
                    timeout
                )))
            }
        }

        let connected = Arc::new(AtomicBool::new(true));
        let acks = Arc::new(Mutex::new(AckTracker::default()));
        let shutdown = CancellationToken::new();
        tokio::spawn(drive_eventloop(
            client.clone(),
            eventloop,
            connected.clone(),
            acks.clone(),
            shutdown.clone(),
        ));

        Ok(Arc::new(MqttTransport {
            client: mqtt,
            connected,
            acks,
            shutdown,
        }))
    }
}

/// QoS 1 publishes waiting for their PUBACK.
///
/// The event loop takes requests in the order they were queued and reports
/// the packet id of each publish it writes, so waiters are queued in request
/// order and bound to a packet id on `Outgoing::Publish`.
#[derive(Debug, Default)]
struct AckTracker {
    /// Queued on the client, no packet id yet
    queued: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
    closed: bool,
}

impl AckTracker {
    fn written(&mut self, pkid: u16) {
        if let Some(waiter) = self.queued.pop_front() {
            self.inflight.insert(pkid, waiter);
        }
    }

    fn acked(&mut self, pkid: u16) {
        if let Some(waiter) = self.inflight.remove(&pkid) {
            let _ = waiter.send(());
        }
    }

    /// Dropping the senders fails every waiter.
    fn close(&mut self) -> usize {
        self.closed = true;
        let pending = self.queued.len() + self.inflight.len();
        self.queued.clear();
        self.inflight.clear();
        pending
    }
}

async fn drive_eventloop(
    client: DeviceId,
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    acks: Arc<Mutex<AckTracker>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.lock().written(pkid),
                Ok(Event::Incoming(Packet::PubAck(ack))) => acks.lock().acked(ack.pkid),
                Ok(event) => debug!("{}: {:?}", client, event),
                Err(e) => {
                    warn!("MQTT connection for {} lost: {}", client, e);
                    break;
                }
            },
        }
    }
    connected.store(false, Ordering::Release);
    let pending = acks.lock().close();
    if pending > 0 {
        debug!("{}: {} publishes closed without PUBACK", client, pending);
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    acks: Arc<Mutex<AckTracker>>,
    shutdown: CancellationToken,
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        {
            // registering and queueing under one lock keeps waiters in request order
            let mut acks = self.acks.lock();
            if acks.closed {
                return Err(TransportError::Closed);
            }
            acks.queued.push_back(tx);
            if let Err(e) = self
                .client
                .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            {
                acks.queued.pop_back();
                return Err(TransportError::Publish(e.to_string()));
            }
        }

        rx.await.map_err(|_| TransportError::Closed)
    }

    async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect: {}", e);
        }
        self.shutdown.cancel();
        self.connected.store(false, Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// In-memory broker
// ---------------------------------------------------------------------------

/// A message accepted by the in-memory broker.
#[derive(Debug, Clone)]
pub struct RecordedMessage {
    /// Name of the client connection that published it
    pub client: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct Faults {
    /// Remaining failed connects per client
    connect_failures: HashMap<String, u32>,
    refused: HashSet<String>,
    publish_failures: u64,
    publish_latency: Duration,
    hang_publishes: bool,
}

/// Shared state behind `MemoryConnector`.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    messages: Mutex<Vec<RecordedMessage>>,
    faults: Mutex<Faults>,
    connect_attempts: AtomicU64,
    active: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connector(self: &Arc<Self>) -> MemoryConnector {
        MemoryConnector {
            broker: Arc::clone(self),
        }
    }

    /// The next `n` connects of `client` fail.
    pub fn fail_connects(&self, client: &str, n: u32) {
        self.faults.lock().connect_failures.insert(client.to_string(), n);
    }

    /// Every connect of `client` fails.
    pub fn refuse(&self, client: &str) {
        self.faults.lock().refused.insert(client.to_string());
    }

    /// The next `n` publishes (from any client) fail.
    pub fn fail_publishes(&self, n: u64) {
        self.faults.lock().publish_failures = n;
    }

    pub fn set_publish_latency(&self, latency: Duration) {
        self.faults.lock().publish_latency = latency;
    }

    /// Publishes never complete, so callers run into their timeout.
    pub fn hang_publishes(&self, hang: bool) {
        self.faults.lock().hang_publishes = hang;
    }

    pub fn messages(&self) -> Vec<RecordedMessage> {
        self.messages.lock().clone()
    }

    pub fn messages_on(&self, topic: &str) -> Vec<RecordedMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn count_on(&self, topic: &str) -> usize {
        self.messages.lock().iter().filter(|m| m.topic == topic).count()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    fn check_connect(&self, client: &str) -> Result<(), TransportError> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let mut faults = self.faults.lock();
        if faults.refused.contains(client) {
            return Err(TransportError::Connect(format!("{} refused", client)));
        }
        if let Some(remaining) = faults.connect_failures.get_mut(client) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Connect(format!("{} unavailable", client)));
            }
        }
        Ok(())
    }

    /// Latency to apply, whether to hang, and whether this publish fails.
    fn publish_faults(&self) -> (Duration, bool, bool) {
        let mut faults = self.faults.lock();
        let fail = faults.publish_failures > 0;
        if fail {
            faults.publish_failures -= 1;
        }
        (faults.publish_latency, faults.hang_publishes, fail)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
}

impl MemoryConnector {
    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        client: &DeviceId,
        _token: &str,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        self.broker.check_connect(client.as_str())?;
        self.broker.active.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MemoryTransport {
            client: client.to_string(),
            broker: Arc::clone(&self.broker),
            connected: AtomicBool::new(true),
        }))
    }
}

struct MemoryTransport {
    client: String,
    broker: Arc<MemoryBroker>,
    connected: AtomicBool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }

        let (latency, hang, fail) = self.broker.publish_faults();
        if hang {
            std::future::pending::<()>().await;
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if fail {
            return Err(TransportError::Publish("injected failure".to_string()));
        }

        self.broker.messages.lock().push(RecordedMessage {
            client: self.client.clone(),
            topic: topic.to_string(),
            payload: payload.to_vec(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.broker.active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
