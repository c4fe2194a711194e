//! Result aggregation.
//!
//! Counters are plain atomics updated from any worker. Latency samples go over
//! an unbounded channel to a single collector task that owns the histogram; a
//! snapshot request travels the same channel, so it observes every sample
//! recorded before it.

use crate::error::PublishError;
use crate::report::LatencyStats;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tbload_core::{DeviceId, EnvelopeKind};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Why a publish task ended in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Transport,
    Connection,
    Encode,
}

impl FailureKind {
    const ALL: [FailureKind; 4] = [
        FailureKind::Timeout,
        FailureKind::Transport,
        FailureKind::Connection,
        FailureKind::Encode,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Transport => "transport",
            FailureKind::Connection => "connection",
            FailureKind::Encode => "encode",
        }
    }
}

impl From<&PublishError> for FailureKind {
    fn from(err: &PublishError) -> Self {
        match err {
            PublishError::Timeout(_) => FailureKind::Timeout,
            PublishError::Transport(_) => FailureKind::Transport,
            PublishError::Connection(_) => FailureKind::Connection,
            PublishError::Encode(_) => FailureKind::Encode,
        }
    }
}

const ENVELOPE_KINDS: [EnvelopeKind; 3] = [
    EnvelopeKind::Connect,
    EnvelopeKind::Telemetry,
    EnvelopeKind::Attributes,
];

fn kind_index(kind: EnvelopeKind) -> usize {
    match kind {
        EnvelopeKind::Connect => 0,
        EnvelopeKind::Telemetry => 1,
        EnvelopeKind::Attributes => 2,
    }
}

/// Outcome of one publish task, delivered over the completion channel.
#[derive(Debug, Clone)]
pub struct Completion {
    pub device: DeviceId,
    pub kind: EnvelopeKind,
    /// Attempts made, including the first
    pub attempts: u32,
    pub result: std::result::Result<Duration, FailureKind>,
}

/// Something worth counting.
#[derive(Debug, Clone)]
pub enum Event {
    /// A publish task was admitted
    Sent(EnvelopeKind),
    Completed(Completion),
    /// Tasks or tokens shed by the overflow policy or by cancellation
    Dropped(u64),
    /// Rate budget that expired unspent because no target could take it
    Throttled(u64),
    AlarmInjected,
    Connected,
    ConnectRetried,
    ConnectFailed,
    Disconnected,
    /// Entities newly created (not found) by provisioning
    Provisioned(u64),
    RelationCreated,
    RelationFailed,
    CleanupFailed,
}

#[derive(Debug, Default)]
struct Counters {
    sent: [AtomicU64; 3],
    acked: [AtomicU64; 3],
    failed: [AtomicU64; 4],
    retries: AtomicU64,
    dropped: AtomicU64,
    throttled: AtomicU64,
    alarms: AtomicU64,
    connected: AtomicU64,
    connect_retries: AtomicU64,
    connect_failures: AtomicU64,
    disconnected: AtomicU64,
    provisioned: AtomicU64,
    relations_created: AtomicU64,
    relations_failed: AtomicU64,
    cleanup_failures: AtomicU64,
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Point-in-time copy of all run metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub sent: u64,
    pub acked: u64,
    pub failed: u64,
    pub failed_by_kind: BTreeMap<FailureKind, u64>,
    pub sent_by_envelope: BTreeMap<EnvelopeKind, u64>,
    pub acked_by_envelope: BTreeMap<EnvelopeKind, u64>,
    pub retries: u64,
    pub dropped: u64,
    pub throttled: u64,
    pub alarms_injected: u64,
    pub connections_opened: u64,
    pub connections_active: u64,
    pub connect_retries: u64,
    pub connect_failures: u64,
    pub entities_provisioned: u64,
    pub relations_created: u64,
    pub relations_failed: u64,
    pub cleanup_failures: u64,
    pub latency: LatencyStats,
}

impl Metrics {
    pub fn acked_of(&self, kind: EnvelopeKind) -> u64 {
        self.acked_by_envelope.get(&kind).copied().unwrap_or(0)
    }

    pub fn sent_of(&self, kind: EnvelopeKind) -> u64 {
        self.sent_by_envelope.get(&kind).copied().unwrap_or(0)
    }
}

/// Lightweight counter read for progress logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    pub sent: u64,
    pub acked: u64,
    pub failed: u64,
    pub dropped: u64,
}

enum CollectorMsg {
    Sample(Duration),
    Snapshot(oneshot::Sender<LatencyStats>),
}

/// Thread-safe result aggregator. Cloning shares the same counters.
#[derive(Clone)]
pub struct ResultAggregator {
    counters: Arc<Counters>,
    collector: mpsc::UnboundedSender<CollectorMsg>,
}

impl ResultAggregator {
    /// Create the aggregator and spawn its latency collector.
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(collect_latencies(rx));
        Self {
            counters: Arc::new(Counters::default()),
            collector: tx,
        }
    }

    /// Record an event. Never blocks.
    pub fn record(&self, event: Event) {
        let c = &self.counters;
        match event {
            Event::Sent(kind) => bump(&c.sent[kind_index(kind)], 1),
            Event::Completed(completion) => {
                if completion.attempts > 1 {
                    bump(&c.retries, u64::from(completion.attempts - 1));
                }
                match completion.result {
                    Ok(latency) => {
                        bump(&c.acked[kind_index(completion.kind)], 1);
                        let _ = self.collector.send(CollectorMsg::Sample(latency));
                    }
                    Err(failure) => bump(&c.failed[failure.index()], 1),
                }
            }
            Event::Dropped(n) => bump(&c.dropped, n),
            Event::Throttled(n) => bump(&c.throttled, n),
            Event::AlarmInjected => bump(&c.alarms, 1),
            Event::Connected => bump(&c.connected, 1),
            Event::ConnectRetried => bump(&c.connect_retries, 1),
            Event::ConnectFailed => bump(&c.connect_failures, 1),
            Event::Disconnected => bump(&c.disconnected, 1),
            Event::Provisioned(n) => bump(&c.provisioned, n),
            Event::RelationCreated => bump(&c.relations_created, 1),
            Event::RelationFailed => bump(&c.relations_failed, 1),
            Event::CleanupFailed => bump(&c.cleanup_failures, 1),
        }
    }

    /// Drain a completion stream into the counters until every sender is gone.
    pub async fn consume(&self, mut completions: mpsc::UnboundedReceiver<Completion>) -> u64 {
        let mut absorbed = 0;
        while let Some(completion) = completions.recv().await {
            self.record(Event::Completed(completion));
            absorbed += 1;
        }
        absorbed
    }

    pub fn progress(&self) -> Progress {
        let c = &self.counters;
        Progress {
            sent: c.sent.iter().map(load).sum(),
            acked: c.acked.iter().map(load).sum(),
            failed: c.failed.iter().map(load).sum(),
            dropped: load(&c.dropped),
        }
    }

    /// Full metrics, including latency percentiles.
    pub async fn snapshot(&self) -> Metrics {
        let (tx, rx) = oneshot::channel();
        let latency = if self.collector.send(CollectorMsg::Snapshot(tx)).is_ok() {
            rx.await.unwrap_or_default()
        } else {
            warn!("Latency collector is gone; reporting empty latency");
            LatencyStats::default()
        };

        let c = &self.counters;
        let mut sent_by_envelope = BTreeMap::new();
        let mut acked_by_envelope = BTreeMap::new();
        for kind in ENVELOPE_KINDS {
            sent_by_envelope.insert(kind, load(&c.sent[kind_index(kind)]));
            acked_by_envelope.insert(kind, load(&c.acked[kind_index(kind)]));
        }
        let failed_by_kind: BTreeMap<FailureKind, u64> = FailureKind::ALL
            .iter()
            .map(|k| (*k, load(&c.failed[k.index()])))
            .filter(|(_, n)| *n > 0)
            .collect();

        let connected = load(&c.connected);
        Metrics {
            sent: sent_by_envelope.values().sum(),
            acked: acked_by_envelope.values().sum(),
            failed: failed_by_kind.values().sum(),
            failed_by_kind,
            sent_by_envelope,
            acked_by_envelope,
            retries: load(&c.retries),
            dropped: load(&c.dropped),
            throttled: load(&c.throttled),
            alarms_injected: load(&c.alarms),
            connections_opened: connected,
            connections_active: connected.saturating_sub(load(&c.disconnected)),
            connect_retries: load(&c.connect_retries),
            connect_failures: load(&c.connect_failures),
            entities_provisioned: load(&c.provisioned),
            relations_created: load(&c.relations_created),
            relations_failed: load(&c.relations_failed),
            cleanup_failures: load(&c.cleanup_failures),
            latency,
        }
    }
}

fn new_histogram() -> Option<Histogram<u64>> {
    Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).ok()
}

/// Owns the latency histogram (microseconds).
async fn collect_latencies(mut rx: mpsc::UnboundedReceiver<CollectorMsg>) {
    let Some(mut histogram) = new_histogram() else {
        warn!("Failed to allocate latency histogram");
        return;
    };

    while let Some(msg) = rx.recv().await {
        match msg {
            CollectorMsg::Sample(latency) => {
                let micros = (latency.as_micros() as u64).max(1);
                let _ = histogram.saturating_record(micros);
            }
            CollectorMsg::Snapshot(reply) => {
                let _ = reply.send(compute_latency_stats(&histogram));
            }
        }
    }
}

/// Computes latency statistics from a histogram.
pub fn compute_latency_stats(histogram: &Histogram<u64>) -> LatencyStats {
    if histogram.is_empty() {
        return LatencyStats::default();
    }

    LatencyStats {
        count: histogram.len(),
        min_us: histogram.min(),
        max_us: histogram.max(),
        mean_us: histogram.mean() as u64,
        p50_us: histogram.value_at_quantile(0.50),
        p95_us: histogram.value_at_quantile(0.95),
        p99_us: histogram.value_at_quantile(0.99),
    }
}
