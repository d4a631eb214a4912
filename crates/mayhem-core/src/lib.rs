//! ---
//! mayhem_section: "07-fault-injection"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Chaos orchestration core."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
//! Mayhem orchestration core: scenario catalogue, resource pressure workers,
//! experiment ledger, injection engine, telemetry and risk scoring.
pub mod engine;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod planner;
pub mod risk;
pub mod scenario;
pub mod telemetry;
pub mod workers;

pub use engine::{
    ChaosInjectionEngine, InjectionAck, InjectionRequest, ValidatedInjection, WorkloadPermits,
};
pub use error::{
    InjectError, LedgerError, MetricsUnavailableError, ValidationError, WorkloadError,
    MAX_DURATION_SECS, MIN_DURATION_SECS,
};
pub use ledger::{
    Experiment, ExperimentId, ExperimentLedger, ExperimentStatus, ExperimentStore,
    InMemoryExperimentStore, JsonlExperimentStore, NewExperiment, RequesterMetadata,
    TransitionOutcome,
};
pub use metrics::ChaosMetrics;
pub use planner::{Escalation, ExperimentPlan, Feedback, ScenarioPlanner, Suggestion};
pub use risk::{ResourceUsage, RiskAssessment, RiskAssessor, RiskLevel};
pub use scenario::{Intensity, ResourceKind, ScenarioDescriptor, ScenarioRegistry};
pub use telemetry::{HostSampler, MetricsSource, StaticMetricsSource, SystemSnapshot, TelemetryHub};
pub use workers::{WorkerSettings, WorkloadReport};
