//! The run-number allocator.
//!
//! Every submission of a sample gets its own run directory,
//! `<outputs_root>/<sample_id>_<N>`. The pipeline script contains an
//! equivalent allocator, so the rule here must match it exactly: only
//! directory names of the shape `<sample_id>_<digits>` count (legacy
//! free-form suffixes are ignored), the next number is max + 1, and a
//! missing outputs root means we start at 1.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use regex::Regex;

use argpipe_common::prelude::*;

/// An allocated run: the number and the directory we created for it.
#[derive(Clone, Debug)]
pub struct RunDir {
    /// The run number, unique per sample.
    pub run_number: i32,
    /// `<outputs_root>/<sample_id>_<run_number>`, already created.
    pub path: PathBuf,
}

/// Allocates collision-free run numbers, serialized per sample.
#[derive(Debug)]
pub struct RunAllocator {
    outputs_root: PathBuf,
    /// One lock per sample id; concurrent submissions of different
    /// samples do not contend.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RunAllocator {
    /// Create an allocator rooted at `outputs_root`.
    pub fn new(outputs_root: impl Into<PathBuf>) -> RunAllocator {
        RunAllocator {
            outputs_root: outputs_root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next run number for `sample_id` and materialize its
    /// directory before releasing the per-sample lock, so a concurrent
    /// caller can never observe the same maximum.
    pub fn allocate(&self, sample_id: &str) -> Result<RunDir> {
        let lock = self.sample_lock(sample_id);
        let _guard = lock.lock().expect("run allocator lock poisoned");

        let run_number = self.next_run_number(sample_id)?;
        let path = self
            .outputs_root
            .join(format!("{}_{}", sample_id, run_number));
        fs::create_dir_all(&path)
            .with_context(|| format!("could not create run directory {}", path.display()))
            .map_err(Error::Other)?;
        Ok(RunDir { run_number, path })
    }

    /// Scan the outputs root for existing runs of `sample_id` and return
    /// the next unused number. Callers must hold the per-sample lock.
    fn next_run_number(&self, sample_id: &str) -> Result<i32> {
        let pattern = Regex::new(&format!(r"^{}_(\d+)$", regex::escape(sample_id)))
            .context("could not build run-directory pattern")
            .map_err(Error::Other)?;

        let entries = match fs::read_dir(&self.outputs_root) {
            Ok(entries) => entries,
            // No outputs root yet: the first run of the first sample.
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(1);
            }
            Err(err) => {
                return Err(Error::Other(anyhow::Error::new(err).context(format!(
                    "could not list {}",
                    self.outputs_root.display()
                ))));
            }
        };

        let mut max = 0;
        for entry in entries {
            let entry = entry
                .with_context(|| {
                    format!("could not list {}", self.outputs_root.display())
                })
                .map_err(Error::Other)?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(captures) = pattern.captures(name) {
                // Digit runs longer than i32 are not ours; skip them like
                // any other non-conforming suffix.
                if let Ok(n) = captures[1].parse::<i32>() {
                    max = max.max(n);
                }
            }
        }
        Ok(max + 1)
    }

    fn sample_lock(&self, sample_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("run allocator lock poisoned");
        locks
            .entry(sample_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_outputs_root_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = RunAllocator::new(dir.path());
        let run = allocator.allocate("SRR1").unwrap();
        assert_eq!(run.run_number, 1);
        assert!(run.path.is_dir());
        assert_eq!(run.path, dir.path().join("SRR1_1"));
    }

    #[test]
    fn missing_outputs_root_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = RunAllocator::new(dir.path().join("not-yet-created"));
        assert_eq!(allocator.allocate("SRR1").unwrap().run_number, 1);
    }

    #[test]
    fn legacy_suffixes_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        for legacy in ["SRR1_v3.2_20260128_124016", "SRR1_old", "SRR1_7b"] {
            fs::create_dir(dir.path().join(legacy)).unwrap();
        }
        let allocator = RunAllocator::new(dir.path());
        assert_eq!(allocator.allocate("SRR1").unwrap().run_number, 1);
    }

    #[test]
    fn gaps_do_not_get_refilled() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("SRR1_1")).unwrap();
        fs::create_dir(dir.path().join("SRR1_3")).unwrap();
        let allocator = RunAllocator::new(dir.path());
        assert_eq!(allocator.allocate("SRR1").unwrap().run_number, 4);
    }

    #[test]
    fn other_samples_do_not_interfere() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("SRR1_5")).unwrap();
        fs::create_dir(dir.path().join("SRR10_9")).unwrap();
        let allocator = RunAllocator::new(dir.path());
        assert_eq!(allocator.allocate("SRR1").unwrap().run_number, 6);
    }

    #[test]
    fn files_are_not_runs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("SRR1_9")).unwrap();
        let allocator = RunAllocator::new(dir.path());
        assert_eq!(allocator.allocate("SRR1").unwrap().run_number, 1);
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = Arc::new(RunAllocator::new(dir.path()));

        let mut handles = vec![];
        for _ in 0..64 {
            let allocator = allocator.clone();
            handles.push(thread::spawn(move || {
                allocator.allocate("SRR1").unwrap().run_number
            }));
        }
        let numbers: HashSet<i32> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(numbers, (1..=64).collect::<HashSet<i32>>());
    }
}
