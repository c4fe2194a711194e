//! Connection pool manager.
//!
//! Owns every simulated client for the duration of a run. Clients are keyed
//! by their slot in `Fleet::clients`, so the publisher can look a connection
//! up without touching client names on the hot path.

use crate::aggregator::{Event, ResultAggregator};
use backoff::backoff::Backoff;
use crate::config::ConnectConfig;
use crate::envelope::Envelope;
use crate::error::{ConnectionError, PublishError, TransportError};
use crate::fleet::ClientSpec;
use crate::transport::{Connector, Transport};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tbload_core::{ClientRole, DeviceId};
use tracing::{debug, info, warn};

/// A connected device or gateway.
pub struct SimulatedClient {
    id: DeviceId,
    role: ClientRole,
    token: String,
    children: Vec<DeviceId>,
    slot: usize,
    transport: Arc<dyn Transport>,
    healthy: AtomicBool,
}

impl std::fmt::Debug for SimulatedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedClient")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("slot", &self.slot)
            .field("children", &self.children.len())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

impl SimulatedClient {
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn role(&self) -> ClientRole {
        self.role
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn children(&self) -> &[DeviceId] {
        &self.children
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire) && self.transport.is_connected()
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }

    /// Send one envelope over this client's connection.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), PublishError> {
        if !self.is_healthy() {
            return Err(ConnectionError::Unhealthy(self.id.to_string()).into());
        }
        match self.transport.publish(envelope.topic, &envelope.payload).await {
            Ok(()) => Ok(()),
            Err(TransportError::Closed) => {
                self.mark_unhealthy();
                Err(TransportError::Closed.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) {
        self.mark_unhealthy();
        self.transport.disconnect().await;
    }
}

/// One client to bring up.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub slot: usize,
    pub spec: ClientSpec,
    pub token: String,
}

/// Outcome of `connect_all`.
#[derive(Debug, Clone, Default)]
pub struct ConnectSummary {
    pub connected: usize,
    pub failed: usize,
    pub excluded: Vec<DeviceId>,
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: ConnectConfig,
    clients: DashMap<usize, Arc<SimulatedClient>>,
    excluded: Mutex<Vec<DeviceId>>,
    aggregator: ResultAggregator,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: ConnectConfig,
        aggregator: ResultAggregator,
    ) -> Self {
        Self {
            connector,
            config,
            clients: DashMap::new(),
            excluded: Mutex::new(Vec::new()),
            aggregator,
        }
    }

    /// Connect `spec` into `slot`, retrying with jittered backoff.
    pub async fn acquire(
        &self,
        slot: usize,
        spec: &ClientSpec,
        token: &str,
    ) -> Result<Arc<SimulatedClient>, ConnectionError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.backoff();
        let mut attempt = 1;

        let transport = loop {
            match self.connector.connect(&spec.id, token).await {
                Ok(transport) => break transport,
                Err(e) => {
                    let delay = if attempt < max_attempts {
                        backoff.next_backoff()
                    } else {
                        None
                    };
                    let Some(delay) = delay else {
                        self.aggregator.record(Event::ConnectFailed);
                        return Err(ConnectionError::Exhausted {
                            client: spec.id.to_string(),
                            attempts: attempt,
                            source: e,
                        });
                    };
                    debug!(
                        "Connect {} attempt {}/{} failed: {}; retrying in {:?}",
                        spec.id, attempt, max_attempts, e, delay
                    );
                    self.aggregator.record(Event::ConnectRetried);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        let client = Arc::new(SimulatedClient {
            id: spec.id.clone(),
            role: spec.role,
            token: token.to_string(),
            children: spec.children.clone(),
            slot,
            transport,
            healthy: AtomicBool::new(true),
        });

        if let Some(previous) = self.clients.insert(slot, Arc::clone(&client)) {
            previous.close().await;
            self.aggregator.record(Event::Disconnected);
        }
        self.aggregator.record(Event::Connected);
        Ok(client)
    }

    pub fn get(&self, slot: usize) -> Option<Arc<SimulatedClient>> {
        self.clients.get(&slot).map(|c| Arc::clone(c.value()))
    }

    pub fn is_healthy(&self, slot: usize) -> bool {
        self.clients
            .get(&slot)
            .map(|c| c.is_healthy())
            .unwrap_or(false)
    }

    /// Disconnect and drop the client in `slot`.
    pub async fn release(&self, slot: usize) -> bool {
        match self.clients.remove(&slot) {
            Some((_, client)) => {
                client.close().await;
                self.aggregator.record(Event::Disconnected);
                true
            }
            None => false,
        }
    }

    /// Visit every pooled client, in no particular order.
    pub fn for_each<F: FnMut(&SimulatedClient)>(&self, mut f: F) {
        for entry in self.clients.iter() {
            f(entry.value());
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        let mut n = 0;
        self.for_each(|c| {
            if c.is_healthy() {
                n += 1;
            }
        });
        n
    }

    /// Clients that exhausted their connect attempts
    pub fn excluded(&self) -> Vec<DeviceId> {
        self.excluded.lock().clone()
    }

    /// Bring up every requested client with bounded concurrency. Clients that
    /// cannot connect are excluded from the run.
    pub async fn connect_all(&self, requests: Vec<ConnectRequest>) -> ConnectSummary {
        let total = requests.len();
        let concurrency = self.config.concurrency.max(1);
        info!("Connecting {} clients (concurrency {})", total, concurrency);

        let results: Vec<(DeviceId, Result<Arc<SimulatedClient>, ConnectionError>)> =
            stream::iter(requests)
                .map(|request| async move {
                    let result = self.acquire(request.slot, &request.spec, &request.token).await;
                    (request.spec.id, result)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        let mut summary = ConnectSummary::default();
        for (id, result) in results {
            match result {
                Ok(_) => summary.connected += 1,
                Err(e) => {
                    warn!("Excluding client: {}", e);
                    summary.failed += 1;
                    summary.excluded.push(id);
                }
            }
        }
        summary.excluded.sort();
        self.excluded.lock().extend(summary.excluded.iter().cloned());

        info!(
            "Connected {}/{} clients ({} excluded)",
            summary.connected, total, summary.failed
        );
        summary
    }

    /// Disconnect every client; returns how many were released.
    pub async fn release_all(&self) -> usize {
        let slots: Vec<usize> = self.clients.iter().map(|e| *e.key()).collect();
        let mut released = 0;
        for slot in slots {
            if self.release(slot).await {
                released += 1;
            }
        }
        debug!("Released {} clients", released);
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope;
    use crate::transport::MemoryBroker;
    use tbload_core::ConnectionMode;

    fn config(max_attempts: u32) -> ConnectConfig {
        ConnectConfig {
            max_attempts,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            concurrency: 4,
            ..ConnectConfig::default()
        }
    }

    fn device_spec(index: u64) -> ClientSpec {
        ClientSpec {
            id: DeviceId::indexed("DW", index),
            role: ClientRole::Device,
            children: Vec::new(),
        }
    }

    fn request(slot: usize) -> ConnectRequest {
        let spec = device_spec(slot as u64);
        ConnectRequest {
            slot,
            token: spec.id.to_string(),
            spec,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_retries_transient_failures() {
        let broker = MemoryBroker::new();
        broker.fail_connects("DW00000001", 2);
        let aggregator = ResultAggregator::new();
        let pool = ConnectionPool::new(Arc::new(broker.connector()), config(5), aggregator.clone());

        let client = pool.acquire(0, &device_spec(1), "DW00000001").await.unwrap();
        assert!(client.is_healthy());
        assert_eq!(broker.connect_attempts(), 3);

        let metrics = aggregator.snapshot().await;
        assert_eq!(metrics.connect_retries, 2);
        assert_eq!(metrics.connections_opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_client_is_excluded() {
        let broker = MemoryBroker::new();
        broker.refuse("DW00000002");
        let aggregator = ResultAggregator::new();
        let pool = ConnectionPool::new(Arc::new(broker.connector()), config(3), aggregator.clone());

        let summary = pool.connect_all((0..4).map(request).collect()).await;
        assert_eq!(summary.connected, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(pool.excluded(), vec![DeviceId::indexed("DW", 2)]);
        assert!(!pool.is_healthy(2));
        assert!(pool.is_healthy(3));
        assert_eq!(pool.healthy_count(), 3);

        let metrics = aggregator.snapshot().await;
        assert_eq!(metrics.connect_failures, 1);
        assert_eq!(metrics.connect_retries, 2);
    }

    #[tokio::test]
    async fn test_release_disconnects() {
        let broker = MemoryBroker::new();
        let aggregator = ResultAggregator::new();
        let pool = ConnectionPool::new(Arc::new(broker.connector()), config(1), aggregator.clone());
        pool.connect_all((0..3).map(request).collect()).await;

        let client = pool.get(1).unwrap();
        let envelope = envelope::telemetry(
            ConnectionMode::Direct,
            client.id(),
            1,
            Default::default(),
        )
        .unwrap();
        client.send(&envelope).await.unwrap();
        assert_eq!(broker.len(), 1);

        assert!(pool.release(1).await);
        assert!(!pool.release(1).await);
        assert!(matches!(
            client.send(&envelope).await,
            Err(PublishError::Connection(ConnectionError::Unhealthy(_)))
        ));

        assert_eq!(pool.release_all().await, 2);
        assert!(pool.is_empty());
        assert_eq!(broker.active_connections(), 0);
        assert_eq!(aggregator.snapshot().await.connections_active, 0);
    }
}
