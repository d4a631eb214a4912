//! ---
//! mayhem_section: "07-fault-injection"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Experiment records and lifecycle transitions."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scenario::Intensity;
use crate::telemetry::SystemSnapshot;

/// Auto-increment identifier assigned by the store.
pub type ExperimentId = u64;

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExperimentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExperimentStatus::Completed | ExperimentStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExperimentStatus::Pending => "pending",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for the injection, as far as the transport can tell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterMetadata {
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub client_ip: Option<String>,
}

/// One recorded invocation of a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub scenario: String,
    /// Requested duration in seconds.
    pub duration: u64,
    pub intensity: Intensity,
    pub status: ExperimentStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub metrics_before: Option<SystemSnapshot>,
    #[serde(default)]
    pub metrics_after: Option<SystemSnapshot>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(flatten)]
    pub requester: RequesterMetadata,
}

impl Experiment {
    /// Move the experiment into a terminal state unless it already is in one.
    pub fn apply(&mut self, transition: Transition, at: DateTime<Utc>) -> TransitionOutcome {
        if self.status.is_terminal() {
            return TransitionOutcome::AlreadyTerminal(self.status);
        }
        match transition {
            Transition::Complete {
                result,
                metrics_after,
            } => {
                self.status = ExperimentStatus::Completed;
                self.result = Some(result);
                self.metrics_after = metrics_after;
            }
            Transition::Fail {
                error,
                metrics_after,
            } => {
                self.status = ExperimentStatus::Failed;
                self.error_message = Some(error);
                self.metrics_after = metrics_after;
            }
        }
        self.end_time = Some(at);
        TransitionOutcome::Applied
    }
}

/// Data captured when an injection is accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExperiment {
    pub scenario: String,
    pub duration: u64,
    pub intensity: Intensity,
    pub metrics_before: Option<SystemSnapshot>,
    pub requester: RequesterMetadata,
}

impl NewExperiment {
    pub fn into_experiment(self, id: ExperimentId, start_time: DateTime<Utc>) -> Experiment {
        Experiment {
            id,
            scenario: self.scenario,
            duration: self.duration,
            intensity: self.intensity,
            status: ExperimentStatus::Running,
            start_time,
            end_time: None,
            result: None,
            metrics_before: self.metrics_before,
            metrics_after: None,
            error_message: None,
            requester: self.requester,
        }
    }
}

/// Terminal transition requested by a finished workload.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Complete {
        result: String,
        metrics_after: Option<SystemSnapshot>,
    },
    Fail {
        error: String,
        metrics_after: Option<SystemSnapshot>,
    },
}

impl Transition {
    pub fn target(&self) -> ExperimentStatus {
        match self {
            Transition::Complete { .. } => ExperimentStatus::Completed,
            Transition::Fail { .. } => ExperimentStatus::Failed,
        }
    }
}

/// What happened to a terminal transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The experiment had already reached this terminal state; nothing changed.
    AlreadyTerminal(ExperimentStatus),
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> Experiment {
        NewExperiment {
            scenario: "cpu_spike".into(),
            duration: 2,
            intensity: Intensity::Low,
            metrics_before: None,
            requester: RequesterMetadata {
                user_agent: Some("curl/8".into()),
                client_ip: Some("10.0.0.7".into()),
            },
        }
        .into_experiment(1, Utc::now())
    }

    #[test]
    fn first_terminal_transition_wins() {
        let mut experiment = running();
        let outcome = experiment.apply(
            Transition::Complete {
                result: "ok".into(),
                metrics_after: None,
            },
            Utc::now(),
        );
        assert_eq!(outcome, TransitionOutcome::Applied);
        let end_time = experiment.end_time;

        let outcome = experiment.apply(
            Transition::Fail {
                error: "late".into(),
                metrics_after: None,
            },
            Utc::now(),
        );
        assert_eq!(
            outcome,
            TransitionOutcome::AlreadyTerminal(ExperimentStatus::Completed)
        );
        assert_eq!(experiment.status, ExperimentStatus::Completed);
        assert_eq!(experiment.error_message, None);
        assert_eq!(experiment.end_time, end_time);
    }

    #[test]
    fn requester_fields_are_flattened() {
        let value = serde_json::to_value(running()).unwrap();
        assert_eq!(value["user_agent"], "curl/8");
        assert_eq!(value["client_ip"], "10.0.0.7");
        assert_eq!(value["status"], "running");
        assert_eq!(value["intensity"], "low");
        assert!(value["end_time"].is_null());
        let back: Experiment = serde_json::from_value(value).unwrap();
        assert_eq!(back, running_with_time(back.start_time));
    }

    fn running_with_time(start_time: DateTime<Utc>) -> Experiment {
        let mut experiment = running();
        experiment.start_time = start_time;
        experiment
    }
}
