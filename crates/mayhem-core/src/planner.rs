//! ---
//! mayhem_section: "07-fault-injection"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Scenario suggestion and intensity escalation."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::risk::ResourceUsage;
use crate::scenario::{Intensity, ScenarioRegistry};

/// Failure-description keywords and the scenario each one points at, in
/// matching priority.
const FAILURE_KEYWORDS: [(&str, &str); 6] = [
    ("cpu", "cpu_spike"),
    ("memory", "memory_leak"),
    ("disk", "disk_fill"),
    ("network", "network_latency"),
    ("timeout", "api_timeout"),
    ("database", "database_slowdown"),
];

/// Scenario appended when an escalation asks to add a partition run.
const PARTITION_SCENARIO: &str = "network_partition";

const CPU_PRESSURE: f64 = 85.0;
const MEMORY_PRESSURE: f64 = 85.0;
const DISK_PRESSURE: f64 = 90.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub scenario: String,
    pub reason: String,
}

/// A scenario run the planner can reason about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentPlan {
    pub scenario: String,
    pub duration: u64,
    pub intensity: Intensity,
}

/// Outcome of a previous run, as judged by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    /// The system withstood the fault; push harder.
    Success,
    /// The system broke; back off.
    Failure,
    Inconclusive,
}

/// An escalated plan and, when requested, an extra run to schedule after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub plan: ExperimentPlan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<ExperimentPlan>,
}

#[derive(Debug, Clone)]
pub struct ScenarioPlanner {
    registry: Arc<ScenarioRegistry>,
}

impl ScenarioPlanner {
    pub fn new(registry: Arc<ScenarioRegistry>) -> Self {
        Self { registry }
    }

    /// Suggest scenarios from past failure descriptions and current usage.
    /// The result is ordered and free of duplicates; ids missing from the
    /// registry are never suggested.
    pub fn suggest(&self, past_failures: &[String], usage: &ResourceUsage) -> Vec<Suggestion> {
        let mut suggestions: Vec<Suggestion> = Vec::new();
        let mut push = |scenario: &str, reason: String| {
            if self.registry.contains(scenario)
                && !suggestions.iter().any(|s| s.scenario == scenario)
            {
                suggestions.push(Suggestion {
                    scenario: scenario.to_owned(),
                    reason,
                });
            }
        };

        for failure in past_failures {
            let lowered = failure.to_lowercase();
            if let Some((keyword, scenario)) = FAILURE_KEYWORDS
                .iter()
                .find(|(keyword, _)| lowered.contains(keyword))
            {
                push(*scenario, format!("past failure mentions {keyword}: {failure}"));
            }
        }

        if usage.cpu_percent > CPU_PRESSURE {
            push("cpu_spike", format!("cpu at {:.1}%", usage.cpu_percent));
        }
        if usage.memory_percent > MEMORY_PRESSURE {
            push("memory_leak", format!("memory at {:.1}%", usage.memory_percent));
        }
        if usage.disk_percent > DISK_PRESSURE {
            push("disk_fill", format!("disk at {:.1}%", usage.disk_percent));
        }
        suggestions
    }

    /// Next run of `plan` given how the last one went.
    pub fn escalate(&self, plan: &ExperimentPlan, feedback: Feedback) -> ExperimentPlan {
        let intensity = match feedback {
            Feedback::Success => plan.intensity.raised(),
            Feedback::Failure => plan.intensity.lowered(),
            Feedback::Inconclusive => plan.intensity,
        };
        ExperimentPlan {
            intensity,
            ..plan.clone()
        }
    }

    /// [`escalate`](Self::escalate), optionally followed by a low-intensity
    /// network partition of the same length. The follow-up is only offered
    /// when the registry knows the partition scenario and the plan is not
    /// already one.
    pub fn evolve(
        &self,
        plan: &ExperimentPlan,
        feedback: Feedback,
        add_network_partition: bool,
    ) -> Escalation {
        let follow_up = (add_network_partition
            && plan.scenario != PARTITION_SCENARIO
            && self.registry.contains(PARTITION_SCENARIO))
        .then(|| ExperimentPlan {
            scenario: PARTITION_SCENARIO.to_owned(),
            duration: plan.duration,
            intensity: Intensity::Low,
        });
        Escalation {
            plan: self.escalate(plan, feedback),
            follow_up,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> ScenarioPlanner {
        ScenarioPlanner::new(Arc::new(ScenarioRegistry::builtin()))
    }

    fn ids(suggestions: &[Suggestion]) -> Vec<&str> {
        suggestions.iter().map(|s| s.scenario.as_str()).collect()
    }

    #[test]
    fn failures_map_to_scenarios_in_order() {
        let failures = vec![
            "Database connection TIMEOUT".to_owned(),
            "OOM: memory exhausted".to_owned(),
            "cpu throttled while disk was full".to_owned(),
            "unrelated hiccup".to_owned(),
            "memory again".to_owned(),
        ];
        let suggestions = planner().suggest(&failures, &ResourceUsage::default());
        assert_eq!(ids(&suggestions), vec!["api_timeout", "memory_leak", "cpu_spike"]);
    }

    #[test]
    fn usage_pressure_adds_preventive_scenarios() {
        let usage = ResourceUsage {
            cpu_percent: 86.0,
            memory_percent: 85.0,
            disk_percent: 91.0,
        };
        let suggestions = planner().suggest(&["cpu saturation".to_owned()], &usage);
        assert_eq!(ids(&suggestions), vec!["cpu_spike", "disk_fill"]);
    }

    #[test]
    fn escalation_moves_one_level() {
        let planner = planner();
        let plan = ExperimentPlan {
            scenario: "cpu_spike".into(),
            duration: 30,
            intensity: Intensity::Medium,
        };
        assert_eq!(planner.escalate(&plan, Feedback::Success).intensity, Intensity::High);
        assert_eq!(planner.escalate(&plan, Feedback::Failure).intensity, Intensity::Low);
        assert_eq!(planner.escalate(&plan, Feedback::Inconclusive), plan);

        let high = ExperimentPlan {
            intensity: Intensity::High,
            ..plan
        };
        assert_eq!(planner.escalate(&high, Feedback::Success).intensity, Intensity::High);
    }

    #[test]
    fn evolve_appends_partition_only_when_asked() {
        let planner = planner();
        let plan = ExperimentPlan {
            scenario: "api_timeout".into(),
            duration: 45,
            intensity: Intensity::Low,
        };

        let plain = planner.evolve(&plan, Feedback::Success, false);
        assert_eq!(plain.plan.intensity, Intensity::Medium);
        assert!(plain.follow_up.is_none());

        let with_partition = planner.evolve(&plan, Feedback::Failure, true);
        assert_eq!(with_partition.plan, plan);
        assert_eq!(
            with_partition.follow_up,
            Some(ExperimentPlan {
                scenario: "network_partition".into(),
                duration: 45,
                intensity: Intensity::Low,
            })
        );

        let partition = ExperimentPlan {
            scenario: "network_partition".into(),
            ..plan.clone()
        };
        assert!(planner.evolve(&partition, Feedback::Success, true).follow_up.is_none());

        let bare = ScenarioPlanner::new(Arc::new(ScenarioRegistry::empty()));
        assert!(bare.evolve(&plan, Feedback::Success, true).follow_up.is_none());
    }
}
