//! ---
//! mayhem_section: "07-fault-injection"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Chaos injection engine."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
//! Chaos injection engine.
//!
//! `inject` validates a request, reserves a concurrency slot and hands the
//! rest to a detached task. That task records the experiment, reports the id
//! back and then runs the workload. The caller never waits for the workload;
//! its outcome only reaches the ledger. Only
//! validation and saturation are reported synchronously. Snapshot and ledger
//! failures are logged and counted and the workload runs regardless.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::error::{
    InjectError, ValidationError, WorkloadError, MAX_DURATION_SECS, MIN_DURATION_SECS,
};
use crate::ledger::{
    ExperimentId, ExperimentLedger, ExperimentStatus, NewExperiment, RequesterMetadata,
    TransitionOutcome,
};
use crate::metrics::ChaosMetrics;
use crate::scenario::{Intensity, ResourceKind, ScenarioDescriptor, ScenarioRegistry};
use crate::telemetry::{MetricsSource, SystemSnapshot};
use crate::workers::{self, panic_message, WorkerSettings, WorkloadReport};

/// Raw injection request as received from a caller. Every field is optional
/// so that missing values surface as validation errors rather than decode
/// failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionRequest {
    #[serde(default)]
    pub scenario: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub intensity: Option<String>,
}

impl InjectionRequest {
    pub fn new(scenario: impl Into<String>, duration: i64, intensity: impl Into<String>) -> Self {
        Self {
            scenario: Some(scenario.into()),
            duration: Some(duration),
            intensity: Some(intensity.into()),
        }
    }

    /// Check the request against the registry and the accepted bounds.
    pub fn validate(
        &self,
        registry: &ScenarioRegistry,
    ) -> Result<ValidatedInjection, ValidationError> {
        let scenario_id = self
            .scenario
            .as_deref()
            .ok_or(ValidationError::MissingField("scenario"))?;
        let descriptor = registry
            .resolve(scenario_id)
            .ok_or_else(|| ValidationError::UnknownScenario(scenario_id.to_owned()))?;

        let duration = self
            .duration
            .ok_or(ValidationError::MissingField("duration"))?;
        if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&duration) {
            return Err(ValidationError::DurationOutOfRange(duration));
        }

        let intensity = self
            .intensity
            .as_deref()
            .ok_or(ValidationError::MissingField("intensity"))?;
        let intensity: Intensity = intensity
            .parse()
            .map_err(|_| ValidationError::UnknownIntensity(intensity.to_owned()))?;

        Ok(ValidatedInjection {
            descriptor: descriptor.clone(),
            duration_secs: duration.unsigned_abs(),
            intensity,
        })
    }
}

/// Request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedInjection {
    pub descriptor: ScenarioDescriptor,
    pub duration_secs: u64,
    pub intensity: Intensity,
}

impl ValidatedInjection {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn kind(&self) -> ResourceKind {
        self.descriptor.kind()
    }
}

/// Immediate answer to an accepted injection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionAck {
    pub result: String,
    pub scenario: String,
    pub duration: u64,
    pub intensity: Intensity,
    /// Absent when the ledger could not record the experiment.
    pub experiment_id: Option<ExperimentId>,
}

/// Per-kind concurrency ceilings. Kinds without a ceiling are unlimited.
#[derive(Debug, Default)]
pub struct WorkloadPermits {
    limits: HashMap<ResourceKind, (usize, Arc<Semaphore>)>,
}

impl WorkloadPermits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, kind: ResourceKind, limit: usize) -> Self {
        self.limits
            .insert(kind, (limit, Arc::new(Semaphore::new(limit))));
        self
    }

    /// Build from the `engine.max_concurrent` table. Unknown kinds are skipped.
    pub fn from_config(table: &IndexMap<String, usize>) -> Self {
        table
            .iter()
            .fold(Self::unlimited(), |permits, (kind, limit)| match kind.parse() {
                Ok(kind) => permits.with_limit(kind, *limit),
                Err(err) => {
                    warn!(target: "mayhem::engine", kind = %kind, error = %err, "ignoring concurrency limit");
                    permits
                }
            })
    }

    pub fn limit(&self, kind: ResourceKind) -> Option<usize> {
        self.limits.get(&kind).map(|(limit, _)| *limit)
    }

    /// Reserve a slot for `kind`; the slot is released when the permit drops.
    pub fn try_acquire(
        &self,
        kind: ResourceKind,
    ) -> Result<Option<OwnedSemaphorePermit>, InjectError> {
        let Some((limit, semaphore)) = self.limits.get(&kind) else {
            return Ok(None);
        };
        Arc::clone(semaphore)
            .try_acquire_owned()
            .map(Some)
            .map_err(|_| InjectError::Saturated {
                kind,
                limit: *limit,
            })
    }
}

/// Count of dispatched workloads that have not reported back yet.
#[derive(Debug, Default)]
struct InFlight {
    active: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard {
    in_flight: Arc<InFlight>,
    metrics: Option<ChaosMetrics>,
}

impl InFlight {
    fn enter(self: &Arc<Self>, metrics: Option<ChaosMetrics>) -> InFlightGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        if let Some(metrics) = &metrics {
            metrics.workload_started();
        }
        InFlightGuard {
            in_flight: Arc::clone(self),
            metrics,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(metrics) = &self.metrics {
            metrics.workload_finished();
        }
        if self.in_flight.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

/// Orchestrates validation, experiment bookkeeping and workload dispatch.
pub struct ChaosInjectionEngine {
    registry: Arc<ScenarioRegistry>,
    launcher: Launcher,
    permits: WorkloadPermits,
    in_flight: Arc<InFlight>,
    dispatch_seq: AtomicU64,
}

impl ChaosInjectionEngine {
    pub fn new(
        registry: Arc<ScenarioRegistry>,
        ledger: ExperimentLedger,
        metrics_source: Arc<dyn MetricsSource>,
    ) -> Self {
        Self {
            registry,
            launcher: Launcher {
                ledger,
                metrics_source,
                settings: Arc::new(WorkerSettings::default()),
                metrics: None,
            },
            permits: WorkloadPermits::unlimited(),
            in_flight: Arc::new(InFlight::default()),
            dispatch_seq: AtomicU64::new(0),
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.launcher.settings = Arc::new(settings);
        self
    }

    pub fn with_permits(mut self, permits: WorkloadPermits) -> Self {
        self.permits = permits;
        self
    }

    pub fn with_metrics(mut self, metrics: ChaosMetrics) -> Self {
        self.launcher.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<ScenarioRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &ExperimentLedger {
        &self.launcher.ledger
    }

    pub fn metrics_source(&self) -> &Arc<dyn MetricsSource> {
        &self.launcher.metrics_source
    }

    pub fn active_workloads(&self) -> usize {
        self.in_flight.active.load(Ordering::SeqCst)
    }

    /// Resolves once no dispatched workload is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            if self.active_workloads() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Accept an injection and start its workload in the background.
    ///
    /// Recording and dispatch happen on a detached task, so dropping the
    /// returned future after validation still runs the workload to a terminal
    /// ledger state.
    pub async fn inject(
        &self,
        request: &InjectionRequest,
        requester: RequesterMetadata,
    ) -> Result<InjectionAck, InjectError> {
        let injection = match request.validate(&self.registry) {
            Ok(injection) => injection,
            Err(err) => {
                self.record_rejected(request.scenario.as_deref());
                debug!(target: "mayhem::engine", error = %err, "injection rejected");
                return Err(err.into());
            }
        };
        let scenario = injection.descriptor.id.clone();

        let permit = match self.permits.try_acquire(injection.kind()) {
            Ok(permit) => permit,
            Err(err) => {
                self.record_rejected(Some(&scenario));
                warn!(target: "mayhem::engine", scenario = %scenario, error = %err, "injection rejected");
                return Err(err);
            }
        };

        let launch = Launch {
            injection: injection.clone(),
            requester,
            tag: format!(
                "{}-{}",
                std::process::id(),
                self.dispatch_seq.fetch_add(1, Ordering::Relaxed)
            ),
            permit,
            guard: self.in_flight.enter(self.launcher.metrics.clone()),
        };
        let (recorded_tx, recorded_rx) = oneshot::channel();
        tokio::spawn(self.launcher.clone().run(launch, recorded_tx));

        let experiment_id = recorded_rx.await.map_err(|_| InjectError::Interrupted)?;
        Ok(InjectionAck {
            result: format!(
                "{} injection started for {} seconds at {} intensity",
                injection.descriptor.title, injection.duration_secs, injection.intensity
            ),
            scenario,
            duration: injection.duration_secs,
            intensity: injection.intensity,
            experiment_id,
        })
    }

    fn record_rejected(&self, scenario: Option<&str>) {
        if let Some(metrics) = &self.launcher.metrics {
            let label = scenario
                .filter(|id| self.registry.contains(id))
                .unwrap_or("invalid");
            metrics.record_rejected(label);
        }
    }
}

impl std::fmt::Debug for ChaosInjectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosInjectionEngine")
            .field("scenarios", &self.registry.len())
            .field("active_workloads", &self.active_workloads())
            .finish_non_exhaustive()
    }
}

/// An accepted injection together with the slots it holds until it finishes.
struct Launch {
    injection: ValidatedInjection,
    requester: RequesterMetadata,
    tag: String,
    permit: Option<OwnedSemaphorePermit>,
    guard: InFlightGuard,
}

/// Handles shared by every launched injection.
#[derive(Clone)]
struct Launcher {
    ledger: ExperimentLedger,
    metrics_source: Arc<dyn MetricsSource>,
    settings: Arc<WorkerSettings>,
    metrics: Option<ChaosMetrics>,
}

impl Launcher {
    /// Record the experiment, report its id on `recorded`, then run the
    /// workload and store its outcome. Runs to the end even when nobody is
    /// listening on `recorded` anymore.
    async fn run(self, launch: Launch, recorded: oneshot::Sender<Option<ExperimentId>>) {
        let Launch {
            injection,
            requester,
            tag,
            permit,
            guard,
        } = launch;
        let _guard = guard;
        let _permit = permit;
        let scenario = injection.descriptor.id.clone();

        let new = NewExperiment {
            scenario: scenario.clone(),
            duration: injection.duration_secs,
            intensity: injection.intensity,
            metrics_before: self.snapshot("before"),
            requester,
        };
        let experiment_id = match self.ledger.create(new).await {
            Ok(experiment) => Some(experiment.id),
            Err(err) => {
                self.record_ledger_error("create");
                error!(
                    target: "mayhem::engine",
                    scenario = %scenario,
                    error = %err,
                    "experiment could not be recorded; running workload unaudited"
                );
                None
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_accepted(&scenario);
        }
        info!(
            target: "mayhem::engine",
            experiment_id = ?experiment_id,
            scenario = %scenario,
            intensity = %injection.intensity,
            duration_secs = injection.duration_secs,
            "injection dispatched"
        );
        if recorded.send(experiment_id).is_err() {
            debug!(
                target: "mayhem::engine",
                experiment_id = ?experiment_id,
                "caller went away before the acknowledgement; workload continues"
            );
        }

        let plan = injection
            .descriptor
            .workload
            .plan(injection.intensity, injection.duration());
        let kind = plan.kind();
        let settings = Arc::clone(&self.settings);
        let started = Instant::now();
        let outcome =
            match tokio::task::spawn_blocking(move || workers::run(&plan, &settings, &tag)).await {
                Ok(outcome) => outcome,
                Err(err) => Err(join_failure(err)),
            };
        self.finish(experiment_id, &scenario, kind, outcome, started.elapsed())
            .await;
    }

    async fn finish(
        &self,
        experiment_id: Option<ExperimentId>,
        scenario: &str,
        kind: ResourceKind,
        outcome: Result<WorkloadReport, WorkloadError>,
        elapsed: Duration,
    ) {
        let metrics_after = self.snapshot("after");
        let status = if outcome.is_ok() {
            ExperimentStatus::Completed
        } else {
            ExperimentStatus::Failed
        };
        if let Some(metrics) = &self.metrics {
            metrics.observe_workload(kind, elapsed.as_secs_f64());
            metrics.record_finished(scenario, status);
        }

        match &outcome {
            Ok(report) => info!(
                target: "mayhem::engine",
                experiment_id = ?experiment_id,
                scenario = %scenario,
                elapsed_ms = elapsed.as_millis() as u64,
                summary = %report.summary,
                "workload completed"
            ),
            Err(err) => warn!(
                target: "mayhem::engine",
                experiment_id = ?experiment_id,
                scenario = %scenario,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %err,
                "workload failed"
            ),
        }

        let Some(id) = experiment_id else {
            return;
        };
        let (operation, recorded) = match outcome {
            Ok(report) => (
                "complete",
                self.ledger.complete(id, report.summary, metrics_after).await,
            ),
            Err(err) => (
                "fail",
                self.ledger.fail(id, err.to_string(), metrics_after).await,
            ),
        };
        match recorded {
            Ok(TransitionOutcome::Applied) => {}
            Ok(TransitionOutcome::AlreadyTerminal(previous)) => debug!(
                target: "mayhem::engine",
                experiment_id = id,
                status = %previous,
                "experiment already terminal"
            ),
            Ok(TransitionOutcome::Unknown) => warn!(
                target: "mayhem::engine",
                experiment_id = id,
                "finished workload refers to an unknown experiment"
            ),
            Err(err) => {
                self.record_ledger_error(operation);
                error!(
                    target: "mayhem::engine",
                    experiment_id = id,
                    error = %err,
                    "experiment outcome could not be recorded"
                );
            }
        }
    }

    fn snapshot(&self, phase: &'static str) -> Option<SystemSnapshot> {
        match self.metrics_source.snapshot() {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_snapshot_failure();
                }
                warn!(target: "mayhem::engine", phase, error = %err, "system snapshot unavailable");
                None
            }
        }
    }

    fn record_ledger_error(&self, operation: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_ledger_error(operation);
        }
    }
}

fn join_failure(err: JoinError) -> WorkloadError {
    if err.is_panic() {
        WorkloadError::Panicked(panic_message(err.into_panic()))
    } else {
        WorkloadError::Panicked("workload task was cancelled".to_owned())
    }
}
