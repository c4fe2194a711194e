//! Test orchestrator.
//!
//! Drives a run through `INIT -> PROVISION -> WARMUP -> RUN -> CLEANUP -> DONE`.
//! Any fatal error or phase timeout moves the machine to `FAILED`; cleanup
//! still runs and every metric gathered so far ends up in the report.

use crate::aggregator::{Completion, Event, FailureKind, ResultAggregator};
use backoff::backoff::Backoff;
use crate::config::TestPlan;
use crate::envelope::{self, Envelope};
use crate::error::{EngineError, PhaseTimeoutError, ProvisionError, PublishError, Result};
use crate::fleet::{Classifier, Fleet};
use crate::payload::PayloadRegistry;
use crate::pool::{ConnectRequest, ConnectionPool};
use crate::provision::{ClientHandle, EntitySpec, Provisioner, CREATED_RELATION};
use crate::publisher::{publish_with_retry, Publisher};
use crate::rate::RunClock;
use crate::report::{PhaseReport, PhaseStatus, RunReport};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tbload_core::{ClientRole, ConnectionMode, CoreError, DeviceId, EnvelopeKind, PhaseState};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Profile name used for gateway entities
const GATEWAY_PROFILE: &str = "gateway";

/// Holds the current phase and enforces the legal transitions.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    state: PhaseState,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            state: PhaseState::Init,
        }
    }

    pub fn state(&self) -> PhaseState {
        self.state
    }

    pub fn advance(&mut self, next: PhaseState) -> std::result::Result<(), CoreError> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        info!("Phase {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Move to FAILED; a no-op once terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            warn!("Phase {} -> {}", self.state, PhaseState::Failed);
            self.state = PhaseState::Failed;
        }
    }
}

enum Outcome<T> {
    Completed(T),
    Cancelled,
    Failed(EngineError),
}

/// Bound `fut` by the phase timeout.
async fn within<T>(
    phase: PhaseState,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(PhaseTimeoutError { phase, timeout }.into()),
    }
}

#[derive(Debug, Default)]
struct WarmupStats {
    connects_sent: u64,
    connects_failed: u64,
    attributes_sent: u64,
    attributes_failed: u64,
    skipped: u64,
}

/// Everything a run shares between phases.
struct RunContext {
    fleet: Arc<Fleet>,
    registry: Arc<PayloadRegistry>,
    pool: Arc<ConnectionPool>,
    aggregator: ResultAggregator,
    /// Every entity provisioned so far, filled as each one completes so an
    /// interrupted PROVISION still leaves cleanup something to delete
    provisioned: Mutex<HashMap<DeviceId, ClientHandle>>,
}

pub struct Orchestrator {
    plan: Arc<TestPlan>,
    connector: Arc<dyn crate::transport::Connector>,
    provisioner: Arc<dyn Provisioner>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        plan: TestPlan,
        connector: Arc<dyn crate::transport::Connector>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            plan: Arc::new(plan),
            connector,
            provisioner,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that cancels the run; RUN stops within one scheduling tick.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn plan(&self) -> &TestPlan {
        &self.plan
    }

    /// Execute the whole lifecycle and build the report.
    pub async fn run(&self) -> RunReport {
        let started = Instant::now();
        let plan = &self.plan;
        let aggregator = ResultAggregator::new();
        let mut machine = PhaseMachine::new();
        let mut failure: Option<String> = None;

        // The fleet is only laid out for a plan that passed validation
        let fleet = match plan.validate() {
            Ok(()) => Fleet::from_plan(plan),
            Err(e) => {
                error!("Invalid test plan: {}", e);
                failure = Some(e.to_string());
                machine.fail();
                Fleet::empty(plan.mode)
            }
        };
        let ctx = RunContext {
            registry: Arc::new(PayloadRegistry::new(
                plan.payload.clone(),
                Classifier::new(&plan.special_devices),
            )),
            pool: Arc::new(ConnectionPool::new(
                Arc::clone(&self.connector),
                plan.connect.clone(),
                aggregator.clone(),
            )),
            fleet: Arc::new(fleet),
            aggregator,
            provisioned: Mutex::new(HashMap::new()),
        };

        info!(
            "Starting {} run: {} devices over {} connections, {:.1} msg/s for {:?}, payload {}",
            plan.mode,
            ctx.fleet.len(),
            ctx.fleet.clients().len(),
            plan.rate.target_per_sec,
            plan.duration(),
            plan.payload.name()
        );

        let mut phases = Vec::new();
        let mut run_elapsed = Duration::ZERO;

        // PROVISION
        if failure.is_none() && self.enter(&mut machine, PhaseState::Provision, &mut failure) {
            let phase_start = Instant::now();
            let mut attempts = 0;
            let outcome = self
                .guarded(within(
                    PhaseState::Provision,
                    plan.timeouts.provision(),
                    self.provision_phase(&ctx, &mut attempts),
                ))
                .await;
            let (status, error) = match outcome {
                Outcome::Completed(()) => (PhaseStatus::Completed, None),
                Outcome::Cancelled => (PhaseStatus::Cancelled, None),
                Outcome::Failed(e) => self.fatal(&mut machine, &mut failure, PhaseState::Provision, e),
            };
            phases.push(
                self.phase_report(&ctx, PhaseState::Provision, status, phase_start, attempts.max(1), error)
                    .await,
            );
        }

        // WARMUP
        if failure.is_none() && self.enter(&mut machine, PhaseState::Warmup, &mut failure) {
            let phase_start = Instant::now();
            let (status, error) = if self.cancel.is_cancelled() || !plan.lifecycle.warmup {
                (PhaseStatus::Skipped, None)
            } else {
                let outcome = self
                    .guarded(within(
                        PhaseState::Warmup,
                        plan.timeouts.warmup(),
                        self.warmup_phase(&ctx),
                    ))
                    .await;
                match outcome {
                    Outcome::Completed(_) => (PhaseStatus::Completed, None),
                    Outcome::Cancelled => (PhaseStatus::Cancelled, None),
                    Outcome::Failed(e) => {
                        self.fatal(&mut machine, &mut failure, PhaseState::Warmup, e)
                    }
                }
            };
            phases.push(self.phase_report(&ctx, PhaseState::Warmup, status, phase_start, 1, error).await);
        }

        // RUN
        if failure.is_none() && self.enter(&mut machine, PhaseState::Run, &mut failure) {
            let phase_start = Instant::now();
            let (status, error) = if self.cancel.is_cancelled() {
                (PhaseStatus::Skipped, None)
            } else {
                let publisher = Publisher::new(
                    plan,
                    Arc::clone(&ctx.fleet),
                    Arc::clone(&ctx.pool),
                    Arc::clone(&ctx.registry),
                    ctx.aggregator.clone(),
                );
                let timeout = plan.timeouts.run(plan.duration());
                match tokio::time::timeout(timeout, publisher.run(self.cancel.child_token())).await {
                    Ok(summary) => {
                        run_elapsed = summary.elapsed;
                        if summary.cancelled {
                            info!("Run cancelled after {:.1}s", summary.elapsed.as_secs_f64());
                            (PhaseStatus::Cancelled, None)
                        } else {
                            (PhaseStatus::Completed, None)
                        }
                    }
                    Err(_) => {
                        run_elapsed = phase_start.elapsed();
                        let e = PhaseTimeoutError {
                            phase: PhaseState::Run,
                            timeout,
                        };
                        self.fatal(&mut machine, &mut failure, PhaseState::Run, e.into())
                    }
                }
            };
            phases.push(self.phase_report(&ctx, PhaseState::Run, status, phase_start, 1, error).await);
        }

        // CLEANUP runs on every path
        if failure.is_none() {
            self.enter(&mut machine, PhaseState::Cleanup, &mut failure);
        }
        let phase_start = Instant::now();
        let (status, error) = match within(
            PhaseState::Cleanup,
            plan.timeouts.cleanup(),
            self.cleanup_phase(&ctx),
        )
        .await
        {
            Ok(()) => (PhaseStatus::Completed, None),
            Err(e) => {
                warn!("Cleanup incomplete: {}", e);
                (PhaseStatus::Failed, Some(e.to_string()))
            }
        };
        phases.push(self.phase_report(&ctx, PhaseState::Cleanup, status, phase_start, 1, error).await);

        if failure.is_none() {
            self.enter(&mut machine, PhaseState::Done, &mut failure);
        }

        let metrics = ctx.aggregator.snapshot().await;
        info!(
            "Run finished in state {}: sent={} acked={} failed={} dropped={}",
            machine.state(),
            metrics.sent,
            metrics.acked,
            metrics.failed,
            metrics.dropped
        );

        RunReport {
            mode: plan.mode,
            payload: plan.payload.name().to_string(),
            device_count: ctx.fleet.len(),
            client_count: ctx.fleet.clients().len(),
            duration: plan.duration(),
            target_rate: plan.rate.target_per_sec,
            tolerance: plan.rate.tolerance,
            alarm_rate: plan.alarm_rate,
            categories: ctx.fleet.category_counts(),
            final_state: machine.state(),
            error: failure,
            phases,
            excluded_clients: ctx.pool.excluded().iter().map(|id| id.to_string()).collect(),
            run_elapsed,
            total_duration: started.elapsed(),
            metrics,
        }
    }

    fn enter(
        &self,
        machine: &mut PhaseMachine,
        next: PhaseState,
        failure: &mut Option<String>,
    ) -> bool {
        match machine.advance(next) {
            Ok(()) => true,
            Err(e) => {
                error!("{}", e);
                *failure = Some(e.to_string());
                machine.fail();
                false
            }
        }
    }

    fn fatal(
        &self,
        machine: &mut PhaseMachine,
        failure: &mut Option<String>,
        phase: PhaseState,
        err: EngineError,
    ) -> (PhaseStatus, Option<String>) {
        error!("Phase {} failed: {}", phase, err);
        let message = err.to_string();
        *failure = Some(message.clone());
        machine.fail();
        (PhaseStatus::Failed, Some(message))
    }

    /// Race a pre-run phase against cancellation.
    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Outcome<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Outcome::Cancelled,
            result = fut => match result {
                Ok(value) => Outcome::Completed(value),
                Err(e) => Outcome::Failed(e),
            },
        }
    }

    async fn phase_report(
        &self,
        ctx: &RunContext,
        phase: PhaseState,
        status: PhaseStatus,
        start: Instant,
        attempts: u32,
        error: Option<String>,
    ) -> PhaseReport {
        let duration = start.elapsed();
        info!("Phase {} {} in {:.2}s", phase, status, duration.as_secs_f64());
        PhaseReport {
            phase,
            status,
            duration,
            attempts,
            error,
            metrics: ctx.aggregator.snapshot().await,
        }
    }

    // -----------------------------------------------------------------------
    // PROVISION
    // -----------------------------------------------------------------------

    async fn provision_phase(&self, ctx: &RunContext, attempts: &mut u32) -> Result<()> {
        let plan = &self.plan;
        let handles = if plan.lifecycle.provision {
            self.provision_with_retry(ctx, attempts).await?
        } else {
            *attempts = 1;
            info!("Entity provisioning disabled; using device names as access tokens");
            HashMap::new()
        };

        if ctx.fleet.mode() == ConnectionMode::Gateway && plan.lifecycle.relations && !handles.is_empty() {
            self.create_relations(ctx, &handles).await;
        }

        let requests: Vec<ConnectRequest> = ctx
            .fleet
            .clients()
            .iter()
            .enumerate()
            .map(|(slot, spec)| ConnectRequest {
                slot,
                spec: spec.clone(),
                token: handles
                    .get(&spec.id)
                    .map(|h| h.token.clone())
                    .unwrap_or_else(|| spec.id.to_string()),
            })
            .collect();
        let summary = ctx.pool.connect_all(requests).await;

        let required = plan.connect.min_clients.min(ctx.fleet.clients().len());
        if summary.connected < required {
            return Err(EngineError::InsufficientClients {
                connected: summary.connected,
                required,
            });
        }

        ctx.fleet.log_gateway_mapping("connected");
        Ok(())
    }

    async fn provision_with_retry(
        &self,
        ctx: &RunContext,
        attempts: &mut u32,
    ) -> Result<HashMap<DeviceId, ClientHandle>> {
        let max_attempts = 1 + self.plan.timeouts.provision_retries;
        let mut backoff = self.plan.connect.backoff();
        loop {
            *attempts += 1;
            let err = match self.provision_entities(ctx).await {
                Ok(handles) => return Ok(handles),
                Err(e) => e,
            };
            let delay = if *attempts < max_attempts {
                backoff.next_backoff()
            } else {
                None
            };
            let Some(delay) = delay else {
                if max_attempts > 1 {
                    warn!(
                        "{}",
                        CoreError::RetryExhausted {
                            phase: PhaseState::Provision,
                            attempts: *attempts
                        }
                    );
                }
                return Err(err.into());
            };
            warn!(
                "Provisioning attempt {}/{} failed: {}; retrying in {:?}",
                attempts, max_attempts, err, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Create or find every client entity (and, for gateways, every child).
    async fn provision_entities(
        &self,
        ctx: &RunContext,
    ) -> std::result::Result<HashMap<DeviceId, ClientHandle>, ProvisionError> {
        let plan = &self.plan;
        let mut specs = Vec::with_capacity(ctx.fleet.len() + ctx.fleet.clients().len());
        for client in ctx.fleet.clients() {
            let profile = match client.role {
                ClientRole::Gateway => GATEWAY_PROFILE.to_string(),
                ClientRole::Device => plan.device_profile.clone(),
            };
            specs.push(EntitySpec {
                name: client.id.clone(),
                role: client.role,
                profile,
            });
            for child in &client.children {
                specs.push(EntitySpec {
                    name: child.clone(),
                    role: ClientRole::Device,
                    profile: plan.device_profile.clone(),
                });
            }
        }

        let total = specs.len();
        info!("Provisioning {} entities", total);
        let provisioner = &self.provisioner;
        let mut results = stream::iter(specs)
            .map(|spec| async move { provisioner.provision(&spec).await })
            .buffer_unordered(plan.connect.concurrency.max(1));

        let mut handles = HashMap::with_capacity(total);
        let mut created = 0;
        let mut first_error = None;
        while let Some(result) = results.next().await {
            match result {
                Ok(handle) => {
                    if handle.created {
                        created += 1;
                        ctx.aggregator.record(Event::Provisioned(1));
                    }
                    {
                        // an entity created by an earlier attempt is still ours to delete
                        let mut provisioned = ctx.provisioned.lock();
                        let ours = provisioned.get(&handle.name).is_some_and(|h| h.created);
                        provisioned.insert(
                            handle.name.clone(),
                            ClientHandle {
                                created: handle.created || ours,
                                ..handle.clone()
                            },
                        );
                    }
                    handles.insert(handle.name.clone(), handle);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        info!(
            "Provisioned {} entities ({} created, {} existing)",
            total,
            created,
            total as u64 - created
        );
        Ok(handles)
    }

    /// Bidirectional "Created" relations between each gateway and its devices.
    async fn create_relations(&self, ctx: &RunContext, handles: &HashMap<DeviceId, ClientHandle>) {
        for client in ctx.fleet.clients() {
            let Some(gateway) = handles.get(&client.id) else {
                continue;
            };
            let mut created = 0;
            let mut failed = 0;
            for child in &client.children {
                let Some(device) = handles.get(child) else {
                    continue;
                };
                for (from, to) in [(gateway, device), (device, gateway)] {
                    match self.provisioner.relate(from, to, CREATED_RELATION).await {
                        Ok(()) => {
                            created += 1;
                            ctx.aggregator.record(Event::RelationCreated);
                        }
                        Err(e) => {
                            failed += 1;
                            ctx.aggregator.record(Event::RelationFailed);
                            warn!(
                                "Failed to relate {} -> {}: {}",
                                from.name, to.name, e
                            );
                        }
                    }
                }
            }
            info!(
                "Created {} '{}' relations for gateway {} ({} devices, {} failed)",
                created,
                CREATED_RELATION,
                client.id,
                client.children.len(),
                failed
            );
        }
    }

    // -----------------------------------------------------------------------
    // WARMUP
    // -----------------------------------------------------------------------

    async fn warmup_phase(&self, ctx: &RunContext) -> Result<()> {
        let plan = &self.plan;
        let mode = ctx.fleet.mode();
        let mut stats = WarmupStats::default();

        if mode == ConnectionMode::Gateway {
            let announcements: Vec<(usize, &DeviceId)> = ctx
                .fleet
                .devices()
                .iter()
                .map(|d| (d.client, &d.id))
                .collect();
            let pack_size = plan.connect.warmup_pack_size.max(1);
            let packs = announcements.len().div_ceil(pack_size);
            let pause = plan.connect.warmup_pack_pause();
            let mut rng = StdRng::seed_from_u64(plan.seed);

            info!(
                "Announcing {} devices in {} packs of {}",
                announcements.len(),
                packs,
                pack_size
            );
            for (index, pack) in announcements.chunks(pack_size).enumerate() {
                let sends = pack.iter().map(|(slot, device)| {
                    let envelope = envelope::connect(device, &plan.device_profile);
                    self.send_once(ctx, *slot, device, EnvelopeKind::Connect, envelope)
                });
                for result in futures::future::join_all(sends).await {
                    match result {
                        Some(true) => stats.connects_sent += 1,
                        Some(false) => stats.connects_failed += 1,
                        None => stats.skipped += 1,
                    }
                }
                debug!("Connect pack {}/{} sent", index + 1, packs);

                if index + 1 < packs && !pause.is_zero() {
                    let jitter = pause.mul_f64(rng.gen_range(0.0..1.0));
                    tokio::time::sleep(pause + jitter).await;
                }
            }
            info!(
                "Connect burst: {} sent, {} failed",
                stats.connects_sent, stats.connects_failed
            );
        }

        if plan.lifecycle.initial_attributes {
            let now_ms = RunClock::start().now_ms();
            let mut jobs: Vec<(usize, DeviceId, std::result::Result<Envelope, PublishError>)> =
                Vec::with_capacity(ctx.fleet.len() + ctx.fleet.clients().len());
            for device in ctx.fleet.devices() {
                let values = ctx.registry.attributes(&device.id, now_ms);
                jobs.push((
                    device.client,
                    device.id.clone(),
                    envelope::attributes(mode, &device.id, values),
                ));
            }
            if mode == ConnectionMode::Gateway {
                for (slot, gateway) in ctx.fleet.clients().iter().enumerate() {
                    let values = ctx.registry.gateway_attributes(&gateway.id, now_ms);
                    // gateways report about themselves on the device topic
                    jobs.push((
                        slot,
                        gateway.id.clone(),
                        envelope::attributes(ConnectionMode::Direct, &gateway.id, values),
                    ));
                }
            }

            let results: Vec<Option<bool>> = stream::iter(jobs)
                .map(|(slot, device, envelope)| async move {
                    self.send_once(ctx, slot, &device, EnvelopeKind::Attributes, envelope)
                        .await
                })
                .buffer_unordered(plan.connect.concurrency.max(1))
                .collect()
                .await;
            for result in results {
                match result {
                    Some(true) => stats.attributes_sent += 1,
                    Some(false) => stats.attributes_failed += 1,
                    None => stats.skipped += 1,
                }
            }
            info!(
                "Initial attributes: {} sent, {} failed",
                stats.attributes_sent, stats.attributes_failed
            );
        }

        if stats.skipped > 0 {
            warn!("{} warmup envelopes skipped for excluded clients", stats.skipped);
        }
        Ok(())
    }

    /// Publish one warmup envelope. `None` when the carrying client is not
    /// connected.
    async fn send_once(
        &self,
        ctx: &RunContext,
        slot: usize,
        device: &DeviceId,
        kind: EnvelopeKind,
        envelope: std::result::Result<Envelope, PublishError>,
    ) -> Option<bool> {
        let client = ctx.pool.get(slot).filter(|c| c.is_healthy())?;
        ctx.aggregator.record(Event::Sent(kind));

        let completion = match envelope {
            Ok(envelope) => publish_with_retry(&client, &envelope, &self.plan.publish)
                .await
                .into_completion(device.clone(), kind),
            Err(e) => Completion {
                device: device.clone(),
                kind,
                attempts: 1,
                result: Err(FailureKind::from(&e)),
            },
        };
        let ok = completion.result.is_ok();
        ctx.aggregator.record(Event::Completed(completion));
        Some(ok)
    }

    // -----------------------------------------------------------------------
    // CLEANUP
    // -----------------------------------------------------------------------

    async fn cleanup_phase(&self, ctx: &RunContext) -> Result<()> {
        let released = ctx.pool.release_all().await;
        info!("Released {} connections", released);

        if !self.plan.lifecycle.delete_on_complete {
            return Ok(());
        }

        let created: Vec<ClientHandle> = ctx
            .provisioned
            .lock()
            .values()
            .filter(|h| h.created)
            .cloned()
            .collect();
        let total = created.len();
        let provisioner = &self.provisioner;
        let failures: Vec<String> = stream::iter(created)
            .map(|handle| async move {
                provisioner
                    .remove(&handle)
                    .await
                    .err()
                    .map(|e| format!("{}: {}", handle.name, e))
            })
            .buffer_unordered(self.plan.connect.concurrency.max(1))
            .filter_map(|failure| async move { failure })
            .collect()
            .await;

        for failure in &failures {
            ctx.aggregator.record(Event::CleanupFailed);
            warn!("Failed to delete {}", failure);
        }
        info!(
            "Deleted {} entities ({} failures)",
            total - failures.len(),
            failures.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceRange;
    use crate::provision::MemoryProvisioner;
    use crate::transport::MemoryBroker;

    fn small_plan() -> TestPlan {
        let mut plan = TestPlan {
            devices: DeviceRange::new("DW", 0, 4),
            duration_secs: 1,
            ..TestPlan::default()
        };
        plan.rate.target_per_sec = 8.0;
        plan.workers.count = 2;
        plan
    }

    fn orchestrator(plan: TestPlan) -> (Orchestrator, Arc<MemoryBroker>, Arc<MemoryProvisioner>) {
        let broker = MemoryBroker::new();
        let provisioner = Arc::new(MemoryProvisioner::new());
        let orchestrator = Orchestrator::new(
            plan,
            Arc::new(broker.connector()),
            Arc::clone(&provisioner) as Arc<dyn Provisioner>,
        );
        (orchestrator, broker, provisioner)
    }

    #[test]
    fn test_phase_machine_order() {
        let mut machine = PhaseMachine::new();
        for next in [
            PhaseState::Provision,
            PhaseState::Warmup,
            PhaseState::Run,
            PhaseState::Cleanup,
            PhaseState::Done,
        ] {
            machine.advance(next).unwrap();
        }
        assert_eq!(machine.state(), PhaseState::Done);
        assert!(machine.advance(PhaseState::Failed).is_err());
    }

    #[test]
    fn test_phase_machine_rejects_skips_and_revisits() {
        let mut machine = PhaseMachine::new();
        assert_eq!(
            machine.advance(PhaseState::Run),
            Err(CoreError::InvalidTransition {
                from: PhaseState::Init,
                to: PhaseState::Run
            })
        );
        machine.advance(PhaseState::Provision).unwrap();
        assert!(machine.advance(PhaseState::Provision).is_err());

        machine.fail();
        assert_eq!(machine.state(), PhaseState::Failed);
        machine.fail();
        assert!(machine.advance(PhaseState::Cleanup).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_run_reports_every_phase() {
        let (orchestrator, _, provisioner) = orchestrator(small_plan());
        let report = orchestrator.run().await;

        assert_eq!(report.final_state, PhaseState::Done);
        assert_eq!(report.exit_code(), 0);
        let phases: Vec<PhaseState> = report.phases.iter().map(|p| p.phase).collect();
        assert_eq!(
            phases,
            vec![
                PhaseState::Provision,
                PhaseState::Warmup,
                PhaseState::Run,
                PhaseState::Cleanup
            ]
        );
        assert!(report
            .phases
            .iter()
            .all(|p| p.status == PhaseStatus::Completed));
        assert_eq!(provisioner.len(), 4);
        assert_eq!(report.metrics.acked_of(EnvelopeKind::Telemetry), 8);
        assert_eq!(report.metrics.acked_of(EnvelopeKind::Attributes), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_plan_fails_before_provisioning() {
        let mut plan = small_plan();
        plan.rate.target_per_sec = 0.0;
        let (orchestrator, broker, provisioner) = orchestrator(plan);

        let report = orchestrator.run().await;
        assert_eq!(report.final_state, PhaseState::Failed);
        assert_eq!(report.exit_code(), 1);
        assert!(provisioner.is_empty());
        assert!(broker.is_empty());
        assert_eq!(report.phases.len(), 1);
        assert_eq!(report.phases[0].phase, PhaseState::Cleanup);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_error_is_fatal_after_bounded_retry() {
        let mut plan = small_plan();
        plan.timeouts.provision_retries = 2;
        let (orchestrator, broker, provisioner) = orchestrator(plan);
        provisioner.reject("DW00000001");

        let report = orchestrator.run().await;
        assert_eq!(report.final_state, PhaseState::Failed);
        let provision = report.phase(PhaseState::Provision).unwrap();
        assert_eq!(provision.status, PhaseStatus::Failed);
        assert_eq!(provision.attempts, 3);
        assert!(report.phase(PhaseState::Run).is_none());
        assert_eq!(report.phase(PhaseState::Cleanup).unwrap().status, PhaseStatus::Completed);
        assert_eq!(broker.count_on("v1/devices/me/telemetry"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_provision_outage_is_retried() {
        let mut plan = small_plan();
        plan.connect.concurrency = 1;
        let (orchestrator, _, provisioner) = orchestrator(plan);
        provisioner.fail_next(1);

        let report = orchestrator.run().await;
        assert_eq!(report.final_state, PhaseState::Done);
        assert_eq!(report.phase(PhaseState::Provision).unwrap().attempts, 2);
        assert_eq!(provisioner.creates(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_timeout_fails_run() {
        let mut plan = small_plan();
        plan.timeouts.provision_secs = 2;
        let (orchestrator, _, provisioner) = orchestrator(plan);
        provisioner.set_latency(Duration::from_secs(10));

        let report = orchestrator.run().await;
        assert_eq!(report.final_state, PhaseState::Failed);
        let error = report.phase(PhaseState::Provision).unwrap().error.clone().unwrap();
        assert!(error.contains("exceeded its timeout"), "{error}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_few_clients_fails_run() {
        let mut plan = small_plan();
        plan.connect.min_clients = 4;
        plan.connect.max_attempts = 2;
        let (orchestrator, broker, _) = orchestrator(plan);
        broker.refuse("DW00000003");

        let report = orchestrator.run().await;
        assert_eq!(report.final_state, PhaseState::Failed);
        assert_eq!(report.excluded_clients, vec!["DW00000003".to_string()]);
        assert!(report.error.unwrap().contains("Only 3 clients connected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_excluded_client_is_not_fatal() {
        let mut plan = small_plan();
        plan.connect.max_attempts = 2;
        let (orchestrator, broker, _) = orchestrator(plan);
        broker.refuse("DW00000003");

        let report = orchestrator.run().await;
        assert_eq!(report.final_state, PhaseState::Done);
        assert_eq!(report.metrics.connect_failures, 1);
        assert_eq!(report.metrics.acked_of(EnvelopeKind::Telemetry), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_on_complete_removes_created_entities() {
        let mut plan = small_plan();
        plan.lifecycle.delete_on_complete = true;
        let (orchestrator, _, provisioner) = orchestrator(plan);

        let report = orchestrator.run().await;
        assert_eq!(report.final_state, PhaseState::Done);
        assert!(provisioner.is_empty());
        assert_eq!(provisioner.removals(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_plan_builds_no_fleet() {
        let mut plan = small_plan();
        plan.mode = ConnectionMode::Gateway;
        plan.gateways = DeviceRange::new("GW", 0, 9);
        plan.rate.target_per_sec = f64::INFINITY;
        let (orchestrator, broker, provisioner) = orchestrator(plan);

        let report = orchestrator.run().await;
        assert_eq!(report.final_state, PhaseState::Failed);
        assert_eq!(report.device_count, 0);
        assert_eq!(report.client_count, 0);
        assert!(report.error.unwrap().contains("target_per_sec"));
        assert!(provisioner.is_empty());
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_timeout_still_deletes_created_entities() {
        let mut plan = small_plan();
        plan.connect.concurrency = 1;
        plan.timeouts.provision_secs = 3;
        plan.lifecycle.delete_on_complete = true;
        let (orchestrator, _, provisioner) = orchestrator(plan);
        // one entity lands at t=2s, the next would at t=4s
        provisioner.set_latency(Duration::from_secs(2));

        let report = orchestrator.run().await;
        assert_eq!(report.final_state, PhaseState::Failed);
        assert_eq!(provisioner.creates(), 1);
        assert_eq!(provisioner.removals(), 1);
        assert!(provisioner.is_empty());
        assert_eq!(report.phase(PhaseState::Cleanup).unwrap().status, PhaseStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entities_from_a_failed_attempt_are_deleted() {
        let mut plan = small_plan();
        plan.connect.concurrency = 1;
        plan.timeouts.provision_retries = 1;
        plan.lifecycle.delete_on_complete = true;
        let (orchestrator, _, provisioner) = orchestrator(plan);
        provisioner.reject("DW00000003");

        let report = orchestrator.run().await;
        assert_eq!(report.final_state, PhaseState::Failed);
        assert_eq!(report.phase(PhaseState::Provision).unwrap().attempts, 2);
        // created by the first attempt, found again by the second
        assert_eq!(provisioner.creates(), 3);
        assert_eq!(provisioner.removals(), 3);
        assert!(provisioner.is_empty());
    }
}
