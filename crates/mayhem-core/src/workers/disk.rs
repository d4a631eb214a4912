//! ---
//! mayhem_section: "07-fault-injection"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Resource pressure workers."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
//! Disk fill: write a run of 1 MiB scratch files, hold them, remove them.
//!
//! Every path the worker attempted is visited during cleanup, including the
//! one whose write failed, so partially written files never survive.
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::WorkloadError;

pub const FILE_SIZE_BYTES: usize = 1024 * 1024;

/// Filesystem operations used by the disk worker.
pub trait ScratchFs: Send + Sync {
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// [`ScratchFs`] backed by the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsScratchFs;

impl ScratchFs for OsScratchFs {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(contents)?;
        file.flush()
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskFillPlan {
    pub dir: PathBuf,
    pub tag: String,
    pub files: u64,
    pub file_size: usize,
    pub hold: Duration,
}

impl DiskFillPlan {
    pub fn new(dir: PathBuf, tag: impl Into<String>, files: u64, hold: Duration) -> Self {
        Self {
            dir,
            tag: tag.into(),
            files,
            file_size: FILE_SIZE_BYTES,
            hold,
        }
    }

    pub fn with_file_size(mut self, bytes: usize) -> Self {
        self.file_size = bytes;
        self
    }

    pub fn file_path(&self, index: u64) -> PathBuf {
        self.dir
            .join(format!("mayhem-{}-{:04}.fill", self.tag, index))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskFillReport {
    pub files_written: u64,
    pub bytes_written: u64,
}

impl fmt::Display for DiskFillReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wrote and removed {} file(s), {} MiB in total",
            self.files_written,
            self.bytes_written / (1024 * 1024)
        )
    }
}

pub fn fill(plan: &DiskFillPlan, fs: &dyn ScratchFs) -> Result<DiskFillReport, WorkloadError> {
    fs.create_dir_all(&plan.dir)
        .map_err(|source| WorkloadError::ScratchDir {
            path: plan.dir.clone(),
            source,
        })?;

    let payload = vec![0u8; plan.file_size];
    let mut attempted = Vec::with_capacity(usize::try_from(plan.files).unwrap_or_default());
    let mut write_error = None;
    for index in 0..plan.files {
        let path = plan.file_path(index);
        attempted.push(path.clone());
        if let Err(source) = fs.write_file(&path, &payload) {
            write_error = Some(WorkloadError::Write { path, source });
            break;
        }
    }

    let files_written = if write_error.is_some() {
        attempted.len() as u64 - 1
    } else {
        attempted.len() as u64
    };
    if write_error.is_none() {
        debug!(files = files_written, hold_ms = plan.hold.as_millis() as u64, "holding scratch files");
        thread::sleep(plan.hold);
    }

    let leftovers = remove_all(&attempted, fs);
    match (write_error, leftovers.is_empty()) {
        (None, true) => Ok(DiskFillReport {
            files_written,
            bytes_written: files_written * plan.file_size as u64,
        }),
        (None, false) => Err(WorkloadError::Cleanup(leftovers)),
        (Some(primary), true) => Err(primary),
        (Some(primary), false) => Err(WorkloadError::WriteAndCleanup {
            primary: Box::new(primary),
            cleanup: leftovers,
        }),
    }
}

fn remove_all(paths: &[PathBuf], fs: &dyn ScratchFs) -> Vec<String> {
    let mut leftovers = Vec::new();
    for path in paths {
        match fs.remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "scratch file could not be removed");
                leftovers.push(format!("{}: {err}", path.display()));
            }
        }
    }
    leftovers
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    /// In-memory filesystem that fails the write of file `fail_at`.
    #[derive(Default)]
    struct FlakyFs {
        fail_at: Option<u64>,
        deny_remove: bool,
        files: Mutex<BTreeSet<PathBuf>>,
        writes: Mutex<u64>,
    }

    impl ScratchFs for FlakyFs {
        fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
            Ok(())
        }

        fn write_file(&self, path: &Path, _contents: &[u8]) -> io::Result<()> {
            let mut writes = self.writes.lock();
            let index = *writes;
            *writes += 1;
            // A failing write still leaves a truncated file behind.
            self.files.lock().insert(path.to_path_buf());
            if self.fail_at == Some(index) {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            Ok(())
        }

        fn remove_file(&self, path: &Path) -> io::Result<()> {
            if self.deny_remove {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            if self.files.lock().remove(path) {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::NotFound, "missing"))
            }
        }
    }

    fn plan(files: u64) -> DiskFillPlan {
        DiskFillPlan::new(PathBuf::from("/scratch"), "t", files, Duration::ZERO).with_file_size(16)
    }

    #[test]
    fn file_names_are_tagged_and_indexed() {
        assert_eq!(
            plan(3).file_path(7),
            PathBuf::from("/scratch/mayhem-t-0007.fill")
        );
    }

    #[test]
    fn successful_fill_removes_everything() {
        let fs = FlakyFs::default();
        let report = fill(&plan(5), &fs).unwrap();
        assert_eq!(report.files_written, 5);
        assert_eq!(report.bytes_written, 80);
        assert!(fs.files.lock().is_empty());
    }

    #[test]
    fn failed_write_still_cleans_up_all_attempted_files() {
        let fs = FlakyFs {
            fail_at: Some(2),
            ..FlakyFs::default()
        };
        let err = fill(&plan(5), &fs).unwrap_err();
        match err {
            WorkloadError::Write { path, .. } => {
                assert_eq!(path, PathBuf::from("/scratch/mayhem-t-0002.fill"))
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(*fs.writes.lock(), 3);
        assert!(fs.files.lock().is_empty());
    }

    #[test]
    fn cleanup_failures_are_reported() {
        let fs = FlakyFs {
            deny_remove: true,
            ..FlakyFs::default()
        };
        let err = fill(&plan(2), &fs).unwrap_err();
        match err {
            WorkloadError::Cleanup(leftovers) => assert_eq!(leftovers.len(), 2),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn real_filesystem_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let plan = DiskFillPlan::new(dir.path().join("nested"), "os", 3, Duration::from_millis(5))
            .with_file_size(4096);
        let report = fill(&plan, &OsScratchFs).unwrap();
        assert_eq!(report.files_written, 3);
        assert_eq!(fs::read_dir(dir.path().join("nested")).unwrap().count(), 0);
    }
}
