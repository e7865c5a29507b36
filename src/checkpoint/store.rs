use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::SnapshotConfig;
use crate::error::CheckpointError;
use crate::session::RunId;

/// File extension of checkpoint files.
pub const CHECKPOINT_EXTENSION: &str = "ckpt";

const BYTES_PER_MB: u64 = 1024 * 1024;

/// File name of the checkpoint for `step`: `step_<N>.ckpt`.
pub fn checkpoint_file_name(step: u64) -> String {
    format!("step_{step}.{CHECKPOINT_EXTENSION}")
}

/// Parse a checkpoint file name back into its step. Temporary files and
/// anything not matching `step_<N>.ckpt` yield `None`.
pub fn parse_checkpoint_file_name(name: &str) -> Option<u64> {
    let step = name
        .strip_prefix("step_")?
        .strip_suffix(CHECKPOINT_EXTENSION)?
        .strip_suffix('.')?
        .parse()
        .ok()?;
    // Only the canonical spelling, so each step maps to exactly one file.
    (checkpoint_file_name(step) == name).then_some(step)
}

/// One checkpoint known to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub step: u64,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// What an `enforce_limit` call removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted_steps: Vec<u64>,
    pub bytes_freed: u64,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.evicted_steps.is_empty()
    }
}

/// Size-bounded, step-indexed checkpoint directory for one run.
///
/// Layout: `<base_dir>/<run_id>/step_<N>.ckpt`. The directory listing is the
/// source of truth for usage; the in-memory index records registration order
/// and drives eviction, oldest step first.
#[derive(Debug)]
pub struct SnapshotStore {
    run_id: RunId,
    run_dir: PathBuf,
    byte_budget: u64,
    index: Vec<IndexEntry>,
}

impl SnapshotStore {
    pub fn new(base_dir: &Path, run_id: RunId, byte_budget: u64) -> Result<Self, CheckpointError> {
        let run_dir = base_dir.join(run_id.as_str());
        fs::create_dir_all(&run_dir)?;
        debug!(run_id = %run_id, run_dir = %run_dir.display(), byte_budget, "Snapshot store opened");
        Ok(SnapshotStore {
            run_id,
            run_dir,
            byte_budget,
            index: Vec::new(),
        })
    }

    pub fn from_config(config: &SnapshotConfig, run_id: RunId) -> Result<Self, CheckpointError> {
        Self::new(
            &config.base_dir,
            run_id,
            config.storage_limit_mb.saturating_mul(BYTES_PER_MB),
        )
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn byte_budget(&self) -> u64 {
        self.byte_budget
    }

    /// Registered checkpoints, ascending by step.
    pub fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    pub fn path_for_step(&self, step: u64) -> PathBuf {
        self.run_dir.join(checkpoint_file_name(step))
    }

    /// Sum of recorded sizes over the index.
    pub fn indexed_bytes(&self) -> u64 {
        self.index.iter().map(|e| e.size_bytes).sum()
    }

    /// Record a written checkpoint. A step that is already registered is
    /// replaced, so each step appears at most once.
    pub fn register(&mut self, path: &Path, step: u64) -> Result<(), CheckpointError> {
        let size_bytes = fs::metadata(path)?.len();
        self.index.retain(|e| e.step != step);
        self.index.push(IndexEntry {
            step,
            path: path.to_path_buf(),
            size_bytes,
        });
        self.index.sort_by_key(|e| e.step);
        debug!(run_id = %self.run_id, step, size_bytes, "Checkpoint registered");
        Ok(())
    }

    /// Current on-disk usage of checkpoint files in the run directory.
    ///
    /// Recomputed from the directory on every call, so files added or removed
    /// behind the store's back are accounted for.
    pub fn disk_usage(&self) -> Result<u64, CheckpointError> {
        let mut total = 0;
        for (_, path) in self.scan()? {
            match fs::metadata(&path) {
                Ok(meta) => total += meta.len(),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Make room for a file of `next_file_size` bytes by evicting the oldest
    /// registered checkpoints.
    ///
    /// Call before writing. If the incoming file alone exceeds the budget,
    /// every registered checkpoint is evicted and the caller still writes it.
    pub fn enforce_limit(&mut self, next_file_size: u64) -> Result<EvictionReport, CheckpointError> {
        let mut usage = self.disk_usage()?;
        let mut report = EvictionReport::default();

        while usage.saturating_add(next_file_size) > self.byte_budget && !self.index.is_empty() {
            let oldest = self.index.remove(0);
            match fs::remove_file(&oldest.path) {
                Ok(()) => {
                    usage = usage.saturating_sub(oldest.size_bytes);
                    report.bytes_freed += oldest.size_bytes;
                    info!(
                        run_id = %self.run_id,
                        step = oldest.step,
                        size_bytes = oldest.size_bytes,
                        usage,
                        byte_budget = self.byte_budget,
                        "Evicted checkpoint"
                    );
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(step = oldest.step, path = %oldest.path.display(), "Evicted checkpoint was already gone");
                }
                Err(e) => {
                    warn!(
                        step = oldest.step,
                        path = %oldest.path.display(),
                        error = %e,
                        "Failed to delete evicted checkpoint"
                    );
                }
            }
            report.evicted_steps.push(oldest.step);
        }

        if next_file_size > self.byte_budget {
            warn!(
                run_id = %self.run_id,
                size_bytes = next_file_size,
                byte_budget = self.byte_budget,
                "Incoming checkpoint alone exceeds the storage budget; admitting it anyway"
            );
        }

        Ok(report)
    }

    /// Rebuild the index from the checkpoint files currently on disk.
    /// Returns the number of entries found.
    pub fn rebuild_index(&mut self) -> Result<usize, CheckpointError> {
        let mut index = Vec::new();
        for (step, path) in self.scan()? {
            let size_bytes = match fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            index.push(IndexEntry {
                step,
                path,
                size_bytes,
            });
        }
        index.sort_by_key(|e| e.step);
        self.index = index;
        info!(run_id = %self.run_id, entries = self.index.len(), "Snapshot index rebuilt");
        Ok(self.index.len())
    }

    /// Checkpoint files in the run directory as `(step, path)`.
    fn scan(&self) -> Result<Vec<(u64, PathBuf)>, CheckpointError> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.run_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(step) = parse_checkpoint_file_name(&name.to_string_lossy()) {
                found.push((step, path));
            }
        }
        Ok(found)
    }
}
