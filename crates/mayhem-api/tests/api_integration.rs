//! ---
//! mayhem_section: "05-external-interfaces"
//! mayhem_subsection: "integration-tests"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "HTTP-level tests for the Mayhem API."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mayhem_api::{spawn_api_server, ApiServer, ApiState};
use mayhem_core::{
    ChaosInjectionEngine, Experiment, ExperimentId, ExperimentLedger, ExperimentStore,
    LedgerError, NewExperiment, ResourceKind, ScenarioRegistry, StaticMetricsSource,
    SystemSnapshot, WorkloadPermits,
};
use serde_json::{json, Value};

struct OfflineStore;

impl ExperimentStore for OfflineStore {
    fn insert(
        &mut self,
        _new: NewExperiment,
        _start_time: DateTime<Utc>,
    ) -> Result<Experiment, LedgerError> {
        Err(LedgerError::Store("database offline".into()))
    }

    fn update(&mut self, _experiment: &Experiment) -> Result<(), LedgerError> {
        Err(LedgerError::Store("database offline".into()))
    }

    fn get(&self, _id: ExperimentId) -> Result<Option<Experiment>, LedgerError> {
        Err(LedgerError::Store("database offline".into()))
    }

    fn recent(&self, _limit: usize) -> Result<Vec<Experiment>, LedgerError> {
        Err(LedgerError::Store("database offline".into()))
    }

    fn prune_before(&mut self, _cutoff: DateTime<Utc>) -> Result<usize, LedgerError> {
        Err(LedgerError::Store("database offline".into()))
    }
}

struct Harness {
    server: ApiServer,
    engine: Arc<ChaosInjectionEngine>,
    client: reqwest::Client,
}

impl Harness {
    fn start(engine: ChaosInjectionEngine) -> Self {
        let engine = Arc::new(engine);
        let state = Arc::new(ApiState::new(Arc::clone(&engine), 10));
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = spawn_api_server(state, addr).unwrap();
        Self {
            server,
            engine,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.server.addr(), path)
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn finish(self) {
        tokio::time::timeout(Duration::from_secs(10), self.engine.wait_idle())
            .await
            .expect("workloads should finish in time");
        self.server.shutdown().await.unwrap();
    }
}

fn engine(ledger: ExperimentLedger, source: Arc<StaticMetricsSource>) -> ChaosInjectionEngine {
    ChaosInjectionEngine::new(Arc::new(ScenarioRegistry::builtin()), ledger, source)
}

fn healthy_source() -> Arc<StaticMetricsSource> {
    Arc::new(StaticMetricsSource::new(SystemSnapshot::with_usage(
        95.0, 50.0, 50.0,
    )))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inject_is_accepted_and_recorded() {
    let ledger = ExperimentLedger::in_memory().unwrap();
    let harness = Harness::start(engine(ledger.clone(), healthy_source()));

    let (status, body) = harness
        .post(
            "/inject",
            json!({"scenario": "api_timeout", "duration": 1, "intensity": "low"}),
        )
        .await;
    assert_eq!(status, 202);
    assert_eq!(
        body["result"],
        "API timeout injection started for 1 seconds at low intensity"
    );
    let id = body["experiment_id"].as_u64().unwrap();

    let (status, experiment) = harness.get(&format!("/experiments/{id}")).await;
    assert_eq!(status, 200);
    assert_eq!(experiment["scenario"], "api_timeout");
    assert_eq!(experiment["client_ip"], "127.0.0.1");

    harness.finish().await;
    let stored = ledger.get(id).await.unwrap();
    assert_eq!(stored.status.as_str(), "completed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_requests_are_rejected() {
    let harness = Harness::start(engine(ExperimentLedger::in_memory().unwrap(), healthy_source()));

    let (status, body) = harness
        .post(
            "/inject",
            json!({"scenario": "meteor_strike", "duration": 5, "intensity": "low"}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "unknown_scenario");

    let (status, body) = harness
        .post("/inject", json!({"scenario": "cpu_spike", "duration": 301, "intensity": "low"}))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_duration");

    let response = harness
        .client
        .post(harness.url("/inject"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_body");

    assert_eq!(harness.engine.active_workloads(), 0);
    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saturated_kind_returns_too_many_requests() {
    let engine = engine(ExperimentLedger::in_memory().unwrap(), healthy_source())
        .with_permits(WorkloadPermits::unlimited().with_limit(ResourceKind::Generic, 1));
    let harness = Harness::start(engine);
    let request = json!({"scenario": "process_kill", "duration": 1, "intensity": "low"});

    let (status, _) = harness.post("/inject", request.clone()).await;
    assert_eq!(status, 202);
    let (status, body) = harness.post("/inject", request).await;
    assert_eq!(status, 429);
    assert_eq!(body["error"], "saturated");

    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn history_lists_newest_first_and_falls_back_when_ledger_is_down() {
    let harness = Harness::start(engine(ExperimentLedger::in_memory().unwrap(), healthy_source()));
    for scenario in ["api_timeout", "database_slowdown"] {
        let (status, _) = harness
            .post(
                "/inject",
                json!({"scenario": scenario, "duration": 1, "intensity": "low"}),
            )
            .await;
        assert_eq!(status, 202);
    }
    let (status, body) = harness.get("/chaos-history?limit=1").await;
    assert_eq!(status, 200);
    assert_eq!(body["synthetic"], false);
    let experiments = body["experiments"].as_array().unwrap();
    assert_eq!(experiments.len(), 1);
    assert_eq!(experiments[0]["scenario"], "database_slowdown");
    harness.finish().await;

    let offline = ExperimentLedger::spawn(OfflineStore).unwrap();
    let harness = Harness::start(engine(offline, healthy_source()));
    let (status, body) = harness.get("/chaos-history").await;
    assert_eq!(status, 200);
    assert_eq!(body["synthetic"], true);
    assert!(!body["experiments"].as_array().unwrap().is_empty());

    let (status, body) = harness.get("/experiments/1").await;
    assert_eq!(status, 503);
    assert_eq!(body["error"], "ledger_unavailable");
    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_experiment_is_not_found() {
    let harness = Harness::start(engine(ExperimentLedger::in_memory().unwrap(), healthy_source()));
    let (status, body) = harness.get("/experiments/4242").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "not_found");
    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_query_and_path_parameters_get_json_errors() {
    let harness = Harness::start(engine(ExperimentLedger::in_memory().unwrap(), healthy_source()));

    let (status, body) = harness.get("/chaos-history?limit=abc").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_query");
    assert!(!body["message"].as_str().unwrap().is_empty());

    let (status, body) = harness.get("/experiments/x").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_path");
    assert!(!body["message"].as_str().unwrap().is_empty());
    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn system_status_reports_risk_or_degrades() {
    let source = healthy_source();
    let harness = Harness::start(engine(ExperimentLedger::in_memory().unwrap(), source.clone()));

    let (status, body) = harness.get("/system-status").await;
    assert_eq!(status, 200);
    assert_eq!(body["system_metrics"]["cpu_percent"], 95.0);
    assert_eq!(body["risk"]["overall_risk"], "high");

    source.fail("sampler offline");
    let (status, body) = harness.get("/system-status").await;
    assert_eq!(status, 200);
    assert_eq!(body["system_metrics"]["degraded"], true);
    assert!(body.get("risk").is_none());

    let (status, body) = harness.get("/risk").await;
    assert_eq!(status, 503);
    assert_eq!(body["error"], "metrics_unavailable");
    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_catalogue_and_planning() {
    let harness = Harness::start(engine(ExperimentLedger::in_memory().unwrap(), healthy_source()));

    let (status, first) = harness.get("/scenarios").await;
    assert_eq!(status, 200);
    let (_, second) = harness.get("/scenarios").await;
    assert_eq!(first, second);
    assert_eq!(first["scenarios"][0], "cpu_spike");

    let (status, body) = harness
        .post(
            "/scenarios/suggest",
            json!({"past_failures": ["disk full on /var"]}),
        )
        .await;
    assert_eq!(status, 200);
    let suggested: Vec<&str> = body["suggestions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["scenario"].as_str().unwrap())
        .collect();
    assert_eq!(suggested, vec!["disk_fill", "cpu_spike"]);

    let (status, body) = harness
        .post(
            "/scenarios/escalate",
            json!({
                "plan": {"scenario": "cpu_spike", "duration": 30, "intensity": "low"},
                "feedback": "success"
            }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["plan"]["intensity"], "medium");
    assert!(body.get("follow_up").is_none());

    let (status, body) = harness
        .post(
            "/scenarios/escalate",
            json!({
                "plan": {"scenario": "cpu_spike", "duration": 30, "intensity": "high"},
                "feedback": "failure",
                "add_network_partition": true
            }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["plan"]["intensity"], "medium");
    assert_eq!(body["follow_up"]["scenario"], "network_partition");
    assert_eq!(body["follow_up"]["duration"], 30);
    assert_eq!(body["follow_up"]["intensity"], "low");

    let (status, body) = harness.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    harness.finish().await;
}
