//! ---
//! mayhem_section: "07-fault-injection"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Experiment storage backends."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::model::{Experiment, ExperimentId, NewExperiment, Transition};
use crate::error::LedgerError;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Error recorded on experiments that were still running when the previous
/// process exited.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// Keyed experiment storage. Implementations are owned by a single ledger
/// actor, so they need no internal synchronisation.
pub trait ExperimentStore: Send + 'static {
    /// Persist a new experiment under the next auto-increment id.
    fn insert(&mut self, new: NewExperiment, start_time: DateTime<Utc>) -> Result<Experiment>;
    /// Replace the stored row for `experiment.id`.
    fn update(&mut self, experiment: &Experiment) -> Result<()>;
    fn get(&self, id: ExperimentId) -> Result<Option<Experiment>>;
    /// Newest first by start time, ties broken by id.
    fn recent(&self, limit: usize) -> Result<Vec<Experiment>>;
    /// Remove terminal experiments started before `cutoff`.
    fn prune_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[derive(Debug, Default)]
pub struct InMemoryExperimentStore {
    rows: BTreeMap<ExperimentId, Experiment>,
    last_id: ExperimentId,
}

impl InMemoryExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn next_id(&self) -> ExperimentId {
        self.last_id + 1
    }

    /// Insert or overwrite a row verbatim, keeping the id counter ahead of it.
    fn restore(&mut self, experiment: Experiment) {
        self.last_id = self.last_id.max(experiment.id);
        self.rows.insert(experiment.id, experiment);
    }

    fn rows(&self) -> impl Iterator<Item = &Experiment> {
        self.rows.values()
    }
}

impl ExperimentStore for InMemoryExperimentStore {
    fn insert(&mut self, new: NewExperiment, start_time: DateTime<Utc>) -> Result<Experiment> {
        let experiment = new.into_experiment(self.next_id(), start_time);
        self.restore(experiment.clone());
        Ok(experiment)
    }

    fn update(&mut self, experiment: &Experiment) -> Result<()> {
        match self.rows.get_mut(&experiment.id) {
            Some(row) => {
                *row = experiment.clone();
                Ok(())
            }
            None => Err(LedgerError::NotFound(experiment.id)),
        }
    }

    fn get(&self, id: ExperimentId) -> Result<Option<Experiment>> {
        Ok(self.rows.get(&id).cloned())
    }

    fn recent(&self, limit: usize) -> Result<Vec<Experiment>> {
        let mut rows: Vec<&Experiment> = self.rows.values().collect();
        rows.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
        Ok(rows.into_iter().take(limit).cloned().collect())
    }

    fn prune_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize> {
        let before = self.rows.len();
        self.rows
            .retain(|_, row| !(row.status.is_terminal() && row.start_time < cutoff));
        Ok(before - self.rows.len())
    }
}

/// Append-only JSON lines file of full experiment rows.
///
/// Every insert and update appends the complete row; on open the file is
/// replayed and the last row per id wins. Rows left running by a previous
/// process are failed on open, since no workload will ever report for them.
/// Pruning rewrites the file with the surviving rows through a temporary file
/// and an atomic rename.
#[derive(Debug)]
pub struct JsonlExperimentStore {
    path: PathBuf,
    writer: BufWriter<File>,
    rows: InMemoryExperimentStore,
}

impl JsonlExperimentStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut rows = InMemoryExperimentStore::new();
        if path.exists() {
            let replayed = replay(path, &mut rows)?;
            info!(
                target: "mayhem::ledger",
                path = %path.display(),
                lines = replayed,
                experiments = rows.len(),
                "replayed experiment log"
            );
        }

        let mut writer = open_append(path)?;
        if !ends_with_newline(path)? {
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        let mut store = Self {
            path: path.to_path_buf(),
            writer,
            rows,
        };
        let interrupted = store.fail_interrupted(Utc::now())?;
        if interrupted > 0 {
            warn!(
                target: "mayhem::ledger",
                path = %path.display(),
                interrupted,
                "failed experiments left running by a previous process"
            );
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fail_interrupted(&mut self, at: DateTime<Utc>) -> Result<usize> {
        let stale: Vec<Experiment> = self
            .rows
            .rows()
            .filter(|row| !row.status.is_terminal())
            .cloned()
            .collect();
        let count = stale.len();
        for mut row in stale {
            row.apply(
                Transition::Fail {
                    error: INTERRUPTED_BY_RESTART.to_owned(),
                    metrics_after: None,
                },
                at,
            );
            self.append(&row)?;
            self.rows.restore(row);
        }
        Ok(count)
    }

    fn append(&mut self, experiment: &Experiment) -> Result<()> {
        let line = serde_json::to_string(experiment)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn compact(&mut self) -> Result<()> {
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for row in self.rows.rows() {
                serde_json::to_writer(&mut out, row)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.writer = open_append(&self.path)?;
        debug!(target: "mayhem::ledger", path = %self.path.display(), "compacted experiment log");
        Ok(())
    }
}

impl ExperimentStore for JsonlExperimentStore {
    fn insert(&mut self, new: NewExperiment, start_time: DateTime<Utc>) -> Result<Experiment> {
        let experiment = new.into_experiment(self.rows.next_id(), start_time);
        self.append(&experiment)?;
        self.rows.restore(experiment.clone());
        Ok(experiment)
    }

    fn update(&mut self, experiment: &Experiment) -> Result<()> {
        if self.rows.get(experiment.id)?.is_none() {
            return Err(LedgerError::NotFound(experiment.id));
        }
        self.append(experiment)?;
        self.rows.restore(experiment.clone());
        Ok(())
    }

    fn get(&self, id: ExperimentId) -> Result<Option<Experiment>> {
        self.rows.get(id)
    }

    fn recent(&self, limit: usize) -> Result<Vec<Experiment>> {
        self.rows.recent(limit)
    }

    fn prune_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self.rows.prune_before(cutoff)?;
        if removed > 0 {
            self.compact()?;
        }
        Ok(removed)
    }
}

fn open_append(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn ends_with_newline(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn replay(path: &Path, rows: &mut InMemoryExperimentStore) -> Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Experiment>(&line) {
            Ok(experiment) => {
                rows.restore(experiment);
                count += 1;
            }
            // A torn final write must not make the whole history unreadable.
            Err(err) => warn!(
                target: "mayhem::ledger",
                path = %path.display(),
                line = index + 1,
                error = %err,
                "skipping unreadable experiment row"
            ),
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::model::{ExperimentStatus, RequesterMetadata, Transition};
    use crate::scenario::Intensity;
    use chrono::Duration;

    fn new_experiment(scenario: &str) -> NewExperiment {
        NewExperiment {
            scenario: scenario.into(),
            duration: 5,
            intensity: Intensity::Medium,
            metrics_before: None,
            requester: RequesterMetadata::default(),
        }
    }

    fn complete(store: &mut dyn ExperimentStore, id: ExperimentId) {
        let mut row = store.get(id).unwrap().unwrap();
        row.apply(
            Transition::Complete {
                result: "done".into(),
                metrics_after: None,
            },
            Utc::now(),
        );
        store.update(&row).unwrap();
    }

    #[test]
    fn memory_store_orders_newest_first() {
        let mut store = InMemoryExperimentStore::new();
        let now = Utc::now();
        let a = store.insert(new_experiment("a"), now - Duration::seconds(10)).unwrap();
        let b = store.insert(new_experiment("b"), now).unwrap();
        let c = store.insert(new_experiment("c"), now).unwrap();
        assert_eq!((a.id, b.id, c.id), (1, 2, 3));

        let ids: Vec<_> = store.recent(10).unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert_eq!(store.recent(1).unwrap()[0].id, 3);
    }

    #[test]
    fn prune_keeps_running_experiments() {
        let mut store = InMemoryExperimentStore::new();
        let old = Utc::now() - Duration::days(40);
        let done = store.insert(new_experiment("done"), old).unwrap();
        let running = store.insert(new_experiment("running"), old).unwrap();
        store.insert(new_experiment("fresh"), Utc::now()).unwrap();
        complete(&mut store, done.id);

        let removed = store.prune_before(Utc::now() - Duration::days(30)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(done.id).unwrap().is_none());
        assert!(store.get(running.id).unwrap().is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn jsonl_store_replays_last_row_per_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger/experiments.jsonl");
        {
            let mut store = JsonlExperimentStore::open(&path).unwrap();
            let first = store.insert(new_experiment("cpu_spike"), Utc::now()).unwrap();
            store.insert(new_experiment("disk_fill"), Utc::now()).unwrap();
            complete(&mut store, first.id);
        }

        let mut store = JsonlExperimentStore::open(&path).unwrap();
        let first = store.get(1).unwrap().unwrap();
        assert_eq!(first.status, ExperimentStatus::Completed);
        assert_eq!(first.result.as_deref(), Some("done"));
        let second = store.get(2).unwrap().unwrap();
        assert_eq!(second.status, ExperimentStatus::Failed);
        assert_eq!(second.error_message.as_deref(), Some(INTERRUPTED_BY_RESTART));
        assert!(second.end_time.is_some());

        let third = store.insert(new_experiment("api_timeout"), Utc::now()).unwrap();
        assert_eq!(third.id, 3);
    }

    #[test]
    fn jsonl_store_skips_torn_lines_and_compacts_on_prune() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.jsonl");
        {
            let mut store = JsonlExperimentStore::open(&path).unwrap();
            let old = store
                .insert(new_experiment("memory_leak"), Utc::now() - Duration::days(60))
                .unwrap();
            complete(&mut store, old.id);
            store.insert(new_experiment("cpu_spike"), Utc::now()).unwrap();
        }
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(b"{\"id\": 9, \"scen").unwrap();
        drop(raw);

        let mut store = JsonlExperimentStore::open(&path).unwrap();
        assert_eq!(store.recent(10).unwrap().len(), 2);
        let appended = store.insert(new_experiment("dns_failure"), Utc::now()).unwrap();
        drop(store);
        let mut store = JsonlExperimentStore::open(&path).unwrap();
        assert_eq!(store.get(appended.id).unwrap().unwrap().scenario, "dns_failure");
        assert_eq!(store.prune_before(Utc::now() - Duration::days(30)).unwrap(), 1);

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.ends_with('\n'));
        assert!(contents.contains("cpu_spike"));
        assert!(!contents.contains("memory_leak"));
        assert!(!path.with_extension("jsonl.tmp").exists());
    }

    #[test]
    fn rows_left_running_are_failed_on_reopen_and_become_prunable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.jsonl");
        let stale = {
            let mut store = JsonlExperimentStore::open(&path).unwrap();
            store
                .insert(new_experiment("cpu_spike"), Utc::now() - Duration::days(90))
                .unwrap()
        };

        let mut store = JsonlExperimentStore::open(&path).unwrap();
        let row = store.get(stale.id).unwrap().unwrap();
        assert_eq!(row.status, ExperimentStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some(INTERRUPTED_BY_RESTART));
        assert!(row.end_time.is_some());
        drop(store);

        // The recovery was written to the log, not just applied in memory.
        let mut store = JsonlExperimentStore::open(&path).unwrap();
        assert_eq!(
            store.get(stale.id).unwrap().unwrap().status,
            ExperimentStatus::Failed
        );
        assert_eq!(store.prune_before(Utc::now()).unwrap(), 1);
        assert!(store.get(stale.id).unwrap().is_none());
        assert_eq!(store.path(), path.as_path());
    }

    #[test]
    fn update_of_unknown_row_is_rejected() {
        let mut store = InMemoryExperimentStore::new();
        let mut row = new_experiment("x").into_experiment(42, Utc::now());
        row.status = ExperimentStatus::Failed;
        assert!(matches!(store.update(&row), Err(LedgerError::NotFound(42))));
    }
}
