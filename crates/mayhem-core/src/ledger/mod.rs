//! ---
//! mayhem_section: "07-fault-injection"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Experiment ledger actor."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
//! Experiment ledger.
//!
//! A single thread owns the [`ExperimentStore`]; every other component talks
//! to it through a cloneable [`ExperimentLedger`] handle. Requests are queued
//! on a channel and applied one at a time, so a terminal transition is a
//! single read-modify-write that no other request can interleave with. The
//! first transition for an id wins and later ones are reported as
//! [`TransitionOutcome::AlreadyTerminal`].
use std::thread;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::telemetry::SystemSnapshot;

pub mod model;
pub mod store;

pub use model::{
    Experiment, ExperimentId, ExperimentStatus, NewExperiment, RequesterMetadata, Transition,
    TransitionOutcome,
};
pub use store::{ExperimentStore, InMemoryExperimentStore, JsonlExperimentStore};

/// Pending requests allowed before senders wait.
const QUEUE_DEPTH: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T, LedgerError>>;

enum Command {
    Create {
        new: NewExperiment,
        reply: Reply<Experiment>,
    },
    Transition {
        id: ExperimentId,
        transition: Transition,
        reply: Reply<TransitionOutcome>,
    },
    Get {
        id: ExperimentId,
        reply: Reply<Option<Experiment>>,
    },
    List {
        limit: usize,
        reply: Reply<Vec<Experiment>>,
    },
    Prune {
        cutoff: DateTime<Utc>,
        reply: Reply<usize>,
    },
}

/// Cloneable handle to the ledger actor.
#[derive(Debug, Clone)]
pub struct ExperimentLedger {
    tx: mpsc::Sender<Command>,
}

impl ExperimentLedger {
    /// Start the actor thread that owns `store`. The thread exits once every
    /// handle has been dropped.
    pub fn spawn<S: ExperimentStore>(store: S) -> Result<Self, LedgerError> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        thread::Builder::new()
            .name("mayhem-ledger".into())
            .spawn(move || run(Box::new(store), rx))?;
        Ok(Self { tx })
    }

    pub fn in_memory() -> Result<Self, LedgerError> {
        Self::spawn(InMemoryExperimentStore::new())
    }

    pub async fn create(&self, new: NewExperiment) -> Result<Experiment, LedgerError> {
        self.request(|reply| Command::Create { new, reply }).await
    }

    pub async fn complete(
        &self,
        id: ExperimentId,
        result: impl Into<String>,
        metrics_after: Option<SystemSnapshot>,
    ) -> Result<TransitionOutcome, LedgerError> {
        let transition = Transition::Complete {
            result: result.into(),
            metrics_after,
        };
        self.transition(id, transition).await
    }

    pub async fn fail(
        &self,
        id: ExperimentId,
        error: impl Into<String>,
        metrics_after: Option<SystemSnapshot>,
    ) -> Result<TransitionOutcome, LedgerError> {
        let transition = Transition::Fail {
            error: error.into(),
            metrics_after,
        };
        self.transition(id, transition).await
    }

    pub async fn transition(
        &self,
        id: ExperimentId,
        transition: Transition,
    ) -> Result<TransitionOutcome, LedgerError> {
        self.request(|reply| Command::Transition {
            id,
            transition,
            reply,
        })
        .await
    }

    pub async fn get(&self, id: ExperimentId) -> Result<Experiment, LedgerError> {
        self.request(|reply| Command::Get { id, reply })
            .await?
            .ok_or(LedgerError::NotFound(id))
    }

    /// Most recent experiments, newest first.
    pub async fn list(&self, limit: usize) -> Result<Vec<Experiment>, LedgerError> {
        self.request(|reply| Command::List { limit, reply }).await
    }

    /// Drop terminal experiments that started before `cutoff`. Running
    /// experiments are always kept.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, LedgerError> {
        self.request(|reply| Command::Prune { cutoff, reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, LedgerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| LedgerError::Unavailable)?;
        response.await.map_err(|_| LedgerError::Unavailable)?
    }
}

fn run(mut store: Box<dyn ExperimentStore>, mut rx: mpsc::Receiver<Command>) {
    debug!(target: "mayhem::ledger", "ledger actor started");
    while let Some(command) = rx.blocking_recv() {
        handle(store.as_mut(), command);
    }
    info!(target: "mayhem::ledger", "ledger actor stopped");
}

fn handle(store: &mut dyn ExperimentStore, command: Command) {
    // A dropped reply receiver only means the caller stopped waiting.
    match command {
        Command::Create { new, reply } => {
            let _ = reply.send(store.insert(new, Utc::now()));
        }
        Command::Transition {
            id,
            transition,
            reply,
        } => {
            let _ = reply.send(apply_transition(store, id, transition));
        }
        Command::Get { id, reply } => {
            let _ = reply.send(store.get(id));
        }
        Command::List { limit, reply } => {
            let _ = reply.send(store.recent(limit));
        }
        Command::Prune { cutoff, reply } => {
            let _ = reply.send(store.prune_before(cutoff));
        }
    }
}

fn apply_transition(
    store: &mut dyn ExperimentStore,
    id: ExperimentId,
    transition: Transition,
) -> Result<TransitionOutcome, LedgerError> {
    let Some(mut experiment) = store.get(id)? else {
        return Ok(TransitionOutcome::Unknown);
    };
    let target = transition.target();
    let outcome = experiment.apply(transition, Utc::now());
    if outcome == TransitionOutcome::Applied {
        store.update(&experiment)?;
        debug!(
            target: "mayhem::ledger",
            experiment_id = id,
            status = %target,
            "experiment reached terminal state"
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Intensity;

    fn new_experiment() -> NewExperiment {
        NewExperiment {
            scenario: "cpu_spike".into(),
            duration: 2,
            intensity: Intensity::Low,
            metrics_before: None,
            requester: RequesterMetadata::default(),
        }
    }

    #[tokio::test]
    async fn create_then_complete_once() {
        let ledger = ExperimentLedger::in_memory().unwrap();
        let experiment = ledger.create(new_experiment()).await.unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Running);

        let first = ledger.complete(experiment.id, "ok", None).await.unwrap();
        let second = ledger.fail(experiment.id, "late", None).await.unwrap();
        assert_eq!(first, TransitionOutcome::Applied);
        assert_eq!(
            second,
            TransitionOutcome::AlreadyTerminal(ExperimentStatus::Completed)
        );

        let stored = ledger.get(experiment.id).await.unwrap();
        assert_eq!(stored.status, ExperimentStatus::Completed);
        assert!(stored.end_time.is_some());
        assert_eq!(stored.error_message, None);
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let ledger = ExperimentLedger::in_memory().unwrap();
        assert_eq!(
            ledger.complete(77, "ok", None).await.unwrap(),
            TransitionOutcome::Unknown
        );
        assert!(matches!(
            ledger.get(77).await,
            Err(LedgerError::NotFound(77))
        ));
    }

    #[tokio::test]
    async fn list_is_newest_first_and_limited() {
        let ledger = ExperimentLedger::in_memory().unwrap();
        for _ in 0..5 {
            ledger.create(new_experiment()).await.unwrap();
        }
        let ids: Vec<_> = ledger.list(3).await.unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }
}
