//! ---
//! mayhem_section: "07-fault-injection"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Risk scoring from resource utilisation."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
//! Worst-resource-dominates risk scoring.
//!
//! Each resource maps its utilisation onto a step function; the overall score
//! is the maximum of the per-resource scores so a single saturated resource
//! is never diluted by healthy ones.
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::scenario::ResourceKind;

/// Utilisation percentages consumed by the assessor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score > 0.7 {
            RiskLevel::High
        } else if score > 0.4 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub overall_risk: RiskLevel,
    pub risk_score: f64,
    pub per_resource_risk: IndexMap<ResourceKind, f64>,
    pub recommended_scenarios: Vec<String>,
}

/// Descending `(threshold, score)` steps; utilisation strictly above a
/// threshold earns its score.
type Steps = [(f64, f64); 4];

const CPU_STEPS: Steps = [(90.0, 0.9), (80.0, 0.7), (70.0, 0.5), (60.0, 0.3)];
const MEMORY_STEPS: Steps = [(95.0, 0.95), (85.0, 0.8), (75.0, 0.6), (65.0, 0.4)];
const DISK_STEPS: Steps = [(95.0, 0.95), (90.0, 0.8), (80.0, 0.6), (70.0, 0.3)];
const BASELINE: f64 = 0.1;
const RECOMMEND_ABOVE: f64 = 0.5;

fn step(percent: f64, steps: &Steps) -> f64 {
    steps
        .iter()
        .find(|(threshold, _)| percent > *threshold)
        .map_or(BASELINE, |(_, score)| *score)
}

/// Stateless assessor; every call recomputes from the given usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskAssessor;

impl RiskAssessor {
    pub fn new() -> Self {
        Self
    }

    pub fn assess(&self, usage: &ResourceUsage) -> RiskAssessment {
        let scored = [
            (ResourceKind::Cpu, step(usage.cpu_percent, &CPU_STEPS), "cpu_spike"),
            (ResourceKind::Memory, step(usage.memory_percent, &MEMORY_STEPS), "memory_leak"),
            (ResourceKind::Disk, step(usage.disk_percent, &DISK_STEPS), "disk_fill"),
        ];

        let risk_score = scored
            .iter()
            .map(|(_, score, _)| *score)
            .fold(BASELINE, f64::max);
        let mut recommended_scenarios: Vec<String> = Vec::new();
        for (_, score, scenario) in &scored {
            if *score > RECOMMEND_ABOVE && !recommended_scenarios.iter().any(|s| s == scenario) {
                recommended_scenarios.push((*scenario).to_owned());
            }
        }

        RiskAssessment {
            overall_risk: RiskLevel::from_score(risk_score),
            risk_score,
            per_resource_risk: scored.iter().map(|(kind, score, _)| (*kind, *score)).collect(),
            recommended_scenarios,
        }
    }
}
