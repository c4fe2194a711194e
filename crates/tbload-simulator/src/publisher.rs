//! Rate-controlled publisher.
//!
//! A single scheduler task refills a token bucket every tick and hands one
//! telemetry task per token to a bounded pool of workers, walking the publish
//! targets round-robin. Tasks are sharded onto worker queues by client slot,
//! so every connection is served by exactly one worker and per-client publish
//! order is kept.

use crate::aggregator::{Completion, Event, FailureKind, ResultAggregator};
use backoff::backoff::Backoff;
use crate::alarm::AlarmInjector;
use crate::config::{PublishConfig, RateConfig, TestPlan, WorkerConfig};
use crate::envelope::{self, Envelope};
use crate::error::PublishError;
use crate::fleet::{Fleet, FleetDevice};
use crate::payload::PayloadRegistry;
use crate::pool::{ConnectionPool, SimulatedClient};
use crate::queue::{OverflowPolicy, Pushed, TaskQueue};
use crate::rate::{RunClock, TokenBucket};
use std::sync::Arc;
use std::time::Duration;
use tbload_core::{ConnectionMode, DeviceId, EnvelopeKind, EpochMillis};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One message waiting for a worker.
#[derive(Debug, Clone)]
pub struct PublishTask {
    /// Pool slot of the connection that carries it
    pub slot: usize,
    pub device: DeviceId,
    pub kind: EnvelopeKind,
    pub envelope: Envelope,
    pub alarm: bool,
    pub scheduled_at: EpochMillis,
}

/// Result of `publish_with_retry`.
#[derive(Debug)]
pub struct PublishOutcome {
    pub attempts: u32,
    /// Acknowledgement latency of the successful attempt
    pub result: Result<Duration, PublishError>,
}

impl PublishOutcome {
    pub fn into_completion(self, device: DeviceId, kind: EnvelopeKind) -> Completion {
        Completion {
            device,
            kind,
            attempts: self.attempts,
            result: self.result.map_err(|e| FailureKind::from(&e)),
        }
    }
}

/// Publish `envelope`, retrying timeouts and transport errors up to the
/// configured attempt count with jittered exponential backoff.
pub async fn publish_with_retry(
    client: &SimulatedClient,
    envelope: &Envelope,
    config: &PublishConfig,
) -> PublishOutcome {
    let max_attempts = config.max_attempts.max(1);
    let timeout = config.timeout();
    let mut backoff = config.backoff();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let start = Instant::now();
        let err = match tokio::time::timeout(timeout, client.send(envelope)).await {
            Ok(Ok(())) => {
                return PublishOutcome {
                    attempts: attempt,
                    result: Ok(start.elapsed()),
                }
            }
            Ok(Err(e)) => e,
            Err(_) => PublishError::Timeout(timeout),
        };

        let retryable = matches!(err, PublishError::Timeout(_) | PublishError::Transport(_));
        let delay = if retryable && attempt < max_attempts {
            backoff.next_backoff()
        } else {
            None
        };
        let Some(delay) = delay else {
            debug!(
                "Publish from {} failed after {} attempts: {}",
                client.id(),
                attempt,
                err
            );
            return PublishOutcome {
                attempts: attempt,
                result: Err(err),
            };
        };

        tokio::time::sleep(delay).await;
    }
}

/// What the scheduler did over one run.
#[derive(Debug, Clone, Default)]
pub struct PublishSummary {
    /// Tasks handed to workers; each yields exactly one completion
    pub scheduled: u64,
    /// Tokens or tasks shed by the overflow policy or by cancellation
    pub dropped: u64,
    /// Rate budget never spent because every target was capped or
    /// unhealthy (block policy keeps tokens until the bucket overflows)
    pub throttled: u64,
    pub elapsed: Duration,
    pub cancelled: bool,
}

/// A running schedule: completions stream out while the handle runs.
pub struct Schedule {
    pub completions: mpsc::UnboundedReceiver<Completion>,
    pub handle: JoinHandle<PublishSummary>,
}

#[derive(Clone)]
pub struct Publisher {
    fleet: Arc<Fleet>,
    pool: Arc<ConnectionPool>,
    registry: Arc<PayloadRegistry>,
    aggregator: ResultAggregator,
    rate: RateConfig,
    workers: WorkerConfig,
    publish: PublishConfig,
    duration: Duration,
    alarm_rate: f64,
}

impl Publisher {
    pub fn new(
        plan: &TestPlan,
        fleet: Arc<Fleet>,
        pool: Arc<ConnectionPool>,
        registry: Arc<PayloadRegistry>,
        aggregator: ResultAggregator,
    ) -> Self {
        Self {
            fleet,
            pool,
            registry,
            aggregator,
            rate: plan.rate.clone(),
            workers: plan.workers.clone(),
            publish: plan.publish.clone(),
            duration: plan.duration(),
            alarm_rate: plan.alarm_rate,
        }
    }

    /// Start scheduling in the background; the caller drains the completions.
    pub fn schedule(&self, cancel: CancellationToken) -> Schedule {
        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = self.clone();
        let handle = tokio::spawn(async move { publisher.drive(cancel, tx).await });
        Schedule {
            completions: rx,
            handle,
        }
    }

    /// Schedule for the configured duration, feeding completions straight
    /// into the aggregator.
    pub async fn run(&self, cancel: CancellationToken) -> PublishSummary {
        let (tx, rx) = mpsc::unbounded_channel();
        let (summary, _) = tokio::join!(self.drive(cancel, tx), self.aggregator.consume(rx));
        summary
    }

    async fn drive(
        &self,
        cancel: CancellationToken,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> PublishSummary {
        let mode = self.fleet.mode();
        let targets: Vec<FleetDevice> = self.fleet.publish_targets().cloned().collect();
        let policy = self.rate.overflow;

        let worker_count = self.workers.count.max(1);
        let queues: Vec<Arc<TaskQueue<PublishTask>>> = (0..worker_count)
            .map(|_| Arc::new(TaskQueue::new(self.workers.queue_capacity)))
            .collect();
        let mut workers = JoinSet::new();
        for queue in &queues {
            workers.spawn(run_worker(
                Arc::clone(queue),
                Arc::clone(&self.pool),
                self.aggregator.clone(),
                self.publish.clone(),
                completions.clone(),
            ));
        }
        drop(completions);

        let clock = RunClock::start();
        let start = Instant::now();
        let deadline = start + self.duration;
        let tick = self.rate.tick().max(Duration::from_millis(1));
        let window = self.rate.burst_window().max(tick * 2);

        let mut bucket = TokenBucket::with_burst_window(self.rate.target_per_sec, window, start);
        let mut caps: Option<Vec<TokenBucket>> = self.rate.per_client_cap.map(|cap| {
            (0..self.fleet.clients().len())
                .map(|_| TokenBucket::with_burst_window(cap, window, start))
                .collect()
        });
        let mut alarms = AlarmInjector::new(self.alarm_rate, start);

        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let progress_every = self.rate.progress_interval().max(tick);
        let mut next_progress = start + progress_every;

        info!(
            "Publishing {:.1} msg/s to {} targets over {} connections for {:?} ({} workers, overflow {})",
            self.rate.target_per_sec,
            targets.len(),
            self.fleet.clients().len(),
            self.duration,
            worker_count,
            policy
        );

        let mut cursor = 0;
        let mut scheduled = 0u64;
        let mut dropped = 0u64;
        let mut throttled = 0u64;
        let mut unspent = 0.0f64;
        let mut cancelled = false;

        'ticks: loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = interval.tick() => {}
            }

            let now = Instant::now().min(deadline);
            unspent += bucket.refill(now);
            if let Some(caps) = caps.as_mut() {
                for cap in caps.iter_mut() {
                    cap.refill(now);
                }
            }
            let ts = clock.at_ms(now);

            let mut budget = bucket.available();
            while budget > 0 {
                let Some(index) = next_target(&targets, cursor, &self.pool, caps.as_deref()) else {
                    // nobody can take more this tick
                    if policy == OverflowPolicy::DropOldest {
                        let shed = bucket.take_up_to(budget);
                        dropped += shed;
                        self.aggregator.record(Event::Dropped(shed));
                    }
                    break;
                };
                cursor = (index + 1) % targets.len();
                budget -= 1;
                bucket.try_take();

                let device = &targets[index];
                if let Some(caps) = caps.as_mut() {
                    caps[device.client].try_take();
                }

                let alarm = alarms.should_inject(now);
                let task = match self.build_task(mode, device, alarm, ts) {
                    Ok(task) => task,
                    Err(e) => {
                        warn!("Failed to build telemetry for {}: {}", device.id, e);
                        self.aggregator.record(Event::Sent(EnvelopeKind::Telemetry));
                        self.aggregator.record(Event::Completed(Completion {
                            device: device.id.clone(),
                            kind: EnvelopeKind::Telemetry,
                            attempts: 1,
                            result: Err(FailureKind::from(&e)),
                        }));
                        continue;
                    }
                };
                if alarm {
                    self.aggregator.record(Event::AlarmInjected);
                }

                let queue = &queues[device.client % worker_count];
                let pushed = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        dropped += 1;
                        self.aggregator.record(Event::Dropped(1));
                        cancelled = true;
                        break 'ticks;
                    }
                    pushed = queue.push(task, policy) => pushed,
                };
                match pushed {
                    Pushed::Queued => scheduled += 1,
                    // an eviction swaps one queued task for another
                    Pushed::Evicted(_) | Pushed::Closed(_) => {
                        dropped += 1;
                        self.aggregator.record(Event::Dropped(1));
                    }
                }
            }

            if unspent >= 1.0 {
                let lost = unspent.floor();
                unspent -= lost;
                throttled += lost as u64;
                self.aggregator.record(Event::Throttled(lost as u64));
            }

            if now >= next_progress {
                self.log_progress(start);
                next_progress += progress_every;
            }
            if now >= deadline {
                break;
            }
        }

        let elapsed = start.elapsed();
        if !cancelled {
            // budget still held back at the deadline is never spent
            let left = bucket.take_up_to(u64::MAX);
            if left > 0 {
                throttled += left;
                self.aggregator.record(Event::Throttled(left));
            }
        }
        if throttled > 0 {
            warn!(
                "{} messages of rate budget went unspent: every target was capped or unavailable",
                throttled
            );
        }
        let mut abandoned = 0u64;
        for queue in &queues {
            if cancelled {
                abandoned += queue.close().len() as u64;
            } else {
                queue.seal();
            }
        }
        if abandoned > 0 {
            scheduled -= abandoned;
            dropped += abandoned;
            self.aggregator.record(Event::Dropped(abandoned));
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                warn!("Publish worker failed: {}", e);
            }
        }

        info!(
            "Scheduler stopped after {:.1}s: {} scheduled, {} dropped{}",
            elapsed.as_secs_f64(),
            scheduled,
            dropped,
            if cancelled { " (cancelled)" } else { "" }
        );

        PublishSummary {
            scheduled,
            dropped,
            throttled,
            elapsed,
            cancelled,
        }
    }

    fn build_task(
        &self,
        mode: ConnectionMode,
        device: &FleetDevice,
        alarm: bool,
        ts: EpochMillis,
    ) -> Result<PublishTask, PublishError> {
        let values = self.registry.generate(&device.id, alarm, ts);
        let envelope = envelope::telemetry(mode, &device.id, ts, values)?;
        Ok(PublishTask {
            slot: device.client,
            device: device.id.clone(),
            kind: EnvelopeKind::Telemetry,
            envelope,
            alarm,
            scheduled_at: ts,
        })
    }

    fn log_progress(&self, start: Instant) {
        let progress = self.aggregator.progress();
        let secs = start.elapsed().as_secs_f64();
        let achieved = if secs > 0.0 {
            progress.acked as f64 / secs
        } else {
            0.0
        };
        info!(
            "Progress {:.0}s: sent={} acked={} failed={} dropped={} rate={:.1}/{:.1} msg/s",
            secs,
            progress.sent,
            progress.acked,
            progress.failed,
            progress.dropped,
            achieved,
            self.rate.target_per_sec
        );
    }
}

/// First target at or after `cursor` whose connection can take a message now.
fn next_target(
    targets: &[FleetDevice],
    cursor: usize,
    pool: &ConnectionPool,
    caps: Option<&[TokenBucket]>,
) -> Option<usize> {
    let n = targets.len();
    (0..n).map(|i| (cursor + i) % n).find(|&i| {
        let slot = targets[i].client;
        pool.is_healthy(slot) && caps.map_or(true, |caps| caps[slot].available() > 0)
    })
}

async fn run_worker(
    queue: Arc<TaskQueue<PublishTask>>,
    pool: Arc<ConnectionPool>,
    aggregator: ResultAggregator,
    config: PublishConfig,
    completions: mpsc::UnboundedSender<Completion>,
) {
    while let Some(task) = queue.pop().await {
        aggregator.record(Event::Sent(task.kind));
        let completion = match pool.get(task.slot) {
            Some(client) => publish_with_retry(&client, &task.envelope, &config)
                .await
                .into_completion(task.device, task.kind),
            None => Completion {
                device: task.device,
                kind: task.kind,
                attempts: 1,
                result: Err(FailureKind::Connection),
            },
        };
        if completions.send(completion).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceRange, SpecialDevices};
    use crate::envelope::decode_telemetry;
    use crate::fleet::Classifier;
    use crate::pool::ConnectRequest;
    use crate::transport::MemoryBroker;

    const TELEMETRY: &str = "v1/devices/me/telemetry";

    fn plan(devices: u64, rate: f64, duration_secs: u64) -> TestPlan {
        let mut plan = TestPlan {
            devices: DeviceRange::new("DW", 0, devices),
            duration_secs,
            special_devices: SpecialDevices::none(),
            ..TestPlan::default()
        };
        plan.rate.target_per_sec = rate;
        plan.workers.count = 4;
        plan
    }

    async fn setup(plan: &TestPlan) -> (Publisher, Arc<MemoryBroker>, ResultAggregator) {
        let broker = MemoryBroker::new();
        let aggregator = ResultAggregator::new();
        let fleet = Arc::new(Fleet::from_plan(plan));
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(broker.connector()),
            plan.connect.clone(),
            aggregator.clone(),
        ));
        let requests = fleet
            .clients()
            .iter()
            .enumerate()
            .map(|(slot, spec)| ConnectRequest {
                slot,
                spec: spec.clone(),
                token: spec.id.to_string(),
            })
            .collect();
        pool.connect_all(requests).await;

        let registry = Arc::new(PayloadRegistry::new(
            plan.payload.clone(),
            Classifier::new(&plan.special_devices),
        ));
        let publisher = Publisher::new(plan, fleet, pool, registry, aggregator.clone());
        (publisher, broker, aggregator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_rate_times_duration() {
        let plan = plan(10, 20.0, 3);
        let (publisher, broker, aggregator) = setup(&plan).await;

        let summary = publisher.run(CancellationToken::new()).await;
        assert!(!summary.cancelled);
        assert_eq!(summary.scheduled, 60);
        assert_eq!(summary.dropped, 0);
        assert_eq!(broker.count_on(TELEMETRY), 60);

        let metrics = aggregator.snapshot().await;
        assert_eq!(metrics.acked_of(EnvelopeKind::Telemetry), 60);
        assert_eq!(metrics.sent, metrics.acked + metrics.failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin_spreads_load() {
        let plan = plan(5, 50.0, 2);
        let (publisher, broker, _) = setup(&plan).await;
        publisher.run(CancellationToken::new()).await;

        let mut per_client = std::collections::BTreeMap::new();
        for message in broker.messages_on(TELEMETRY) {
            *per_client.entry(message.client).or_insert(0u32) += 1;
        }
        assert_eq!(per_client.len(), 5);
        assert!(per_client.values().all(|n| *n == 20), "{per_client:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_devices_are_never_scheduled() {
        let mut plan = plan(6, 30.0, 2);
        plan.special_devices.offline = vec!["DW00000002".to_string(), "DW00000004".to_string()];
        let (publisher, broker, _) = setup(&plan).await;
        publisher.run(CancellationToken::new()).await;

        let messages = broker.messages_on(TELEMETRY);
        assert_eq!(messages.len(), 60);
        for message in messages {
            let records =
                decode_telemetry(ConnectionMode::Direct, &message.client, &message.payload).unwrap();
            assert!(records
                .iter()
                .all(|(device, _)| device != "DW00000002" && device != "DW00000004"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_client_cap_drops_excess() {
        let mut plan = plan(2, 20.0, 2);
        plan.rate.per_client_cap = Some(5.0);
        plan.rate.overflow = OverflowPolicy::DropOldest;
        let (publisher, broker, aggregator) = setup(&plan).await;

        let summary = publisher.run(CancellationToken::new()).await;
        let published = broker.count_on(TELEMETRY) as u64;
        assert!((18..=20).contains(&published), "published {published}");
        assert!(summary.dropped >= 18, "dropped {}", summary.dropped);
        assert!((39..=40).contains(&(summary.scheduled + summary.dropped)));
        assert_eq!(aggregator.snapshot().await.dropped, summary.dropped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_client_cap_blocks_without_dropping() {
        let mut plan = plan(2, 20.0, 2);
        plan.rate.per_client_cap = Some(5.0);
        plan.rate.overflow = OverflowPolicy::Block;
        let (publisher, broker, _) = setup(&plan).await;

        let summary = publisher.run(CancellationToken::new()).await;
        assert_eq!(summary.dropped, 0);
        assert!(broker.count_on(TELEMETRY) <= 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_budget_is_counted_as_throttled() {
        let mut plan = plan(2, 20.0, 2);
        plan.rate.per_client_cap = Some(5.0);
        plan.rate.overflow = OverflowPolicy::Block;
        let (publisher, broker, aggregator) = setup(&plan).await;

        let summary = publisher.run(CancellationToken::new()).await;
        assert_eq!(summary.dropped, 0);
        assert!(summary.throttled >= 18, "throttled {}", summary.throttled);
        // everything the rate allowed was either scheduled or counted
        let accounted = summary.scheduled + summary.throttled;
        assert!((39..=40).contains(&accounted), "accounted {accounted}");
        assert_eq!(broker.count_on(TELEMETRY) as u64, summary.scheduled);

        let metrics = aggregator.snapshot().await;
        assert_eq!(metrics.throttled, summary.throttled);
        assert_eq!(metrics.dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncapped_run_throttles_nothing() {
        let plan = plan(4, 20.0, 2);
        let (publisher, _, _) = setup(&plan).await;

        let summary = publisher.run(CancellationToken::new()).await;
        assert_eq!(summary.throttled, 0);
        assert_eq!(summary.scheduled, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_admission_within_a_tick() {
        let plan = plan(10, 100.0, 60);
        let (publisher, broker, _) = setup(&plan).await;
        let cancel = CancellationToken::new();

        let Schedule {
            mut completions,
            handle,
        } = publisher.schedule(cancel.clone());
        let consumer = tokio::spawn(async move {
            let mut n = 0;
            while completions.recv().await.is_some() {
                n += 1;
            }
            n
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        let cancelled_at = Instant::now();
        cancel.cancel();

        let summary = handle.await.unwrap();
        assert!(summary.cancelled);
        assert!(summary.elapsed < Duration::from_secs(3));
        assert_eq!(consumer.await.unwrap(), summary.scheduled);

        let tick = plan.rate.tick();
        assert!(broker
            .messages()
            .iter()
            .all(|m| m.at <= cancelled_at + tick));
        let published = broker.count_on(TELEMETRY);
        assert!((190..=210).contains(&published), "published {published}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_alarm_flags_follow_alarm_rate() {
        let mut plan = plan(10, 50.0, 10);
        plan.alarm_rate = 2.0;
        let (publisher, _, aggregator) = setup(&plan).await;
        publisher.run(CancellationToken::new()).await;

        assert_eq!(aggregator.snapshot().await.alarms_injected, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_retry_recovers_and_counts_attempts() {
        let plan = plan(1, 1.0, 1);
        let (publisher, broker, _) = setup(&plan).await;
        let client = publisher.pool.get(0).unwrap();
        let envelope = envelope::telemetry(
            ConnectionMode::Direct,
            client.id(),
            1,
            Default::default(),
        )
        .unwrap();

        broker.fail_publishes(2);
        let outcome = publish_with_retry(&client, &envelope, &plan.publish).await;
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.is_ok());

        broker.hang_publishes(true);
        let outcome = publish_with_retry(&client, &envelope, &plan.publish).await;
        assert_eq!(outcome.attempts, plan.publish.max_attempts);
        assert!(matches!(outcome.result, Err(PublishError::Timeout(_))));
        let completion = outcome.into_completion(client.id().clone(), EnvelopeKind::Telemetry);
        assert_eq!(completion.result, Err(FailureKind::Timeout));
    }
}
