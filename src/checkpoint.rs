//! Checkpoint store for counter metrics
//!
//! Every plugin run is a short lived process, so the last seen value
//! of each counter has to survive on disk until the next run. The
//! store keeps them as one JSON object per plugin, keyed by metric
//! name.

use crate::{
    error::{StateError, StateResult},
    metric::NumericMetric,
};
use fs2::FileExt;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

/// Last observed value of one counter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Counter value at [CheckpointRecord::timestamp]
    pub value: NumericMetric,
    /// Unix time (seconds) the value was observed
    pub timestamp: u64,
    /// Rate reported for this counter last time, if any. Needed to
    /// tell an overflow of an unsigned counter from a reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delta: Option<f64>,
}

impl CheckpointRecord {
    /// Fresh record without history
    pub fn new(value: NumericMetric, timestamp: u64) -> Self {
        Self {
            value,
            timestamp,
            last_delta: None,
        }
    }
}

/// All checkpoints of a plugin, keyed by metric name.
pub type Checkpoints = BTreeMap<String, CheckpointRecord>;

/// Holds an advisory lock on the store until dropped.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // Closing the file drops the lock anyways, this just makes it explicit
        let _ = self.file.unlock();
    }
}

/// A checkpoint file on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Store backed by the file at `path`. Nothing is touched until
    /// [CheckpointStore::load] or [CheckpointStore::save] is called.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the checkpoint file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all checkpoints.
    ///
    /// A missing file is the normal first run and gives an empty map.
    /// Content that is not a JSON object gives
    /// [StateError::CorruptCheckpoint]. Single entries that do not
    /// decode are dropped, the rest of the file is still used.
    pub fn load(&self) -> StateResult<Checkpoints> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("No checkpoint file at {:?}, first run", self.path);
                return Ok(Checkpoints::new());
            }
            Err(e) => return Err(StateError::io(&self.path, e)),
        };
        let raw: BTreeMap<String, serde_json::Value> =
            serde_json::from_slice(&data).map_err(|e| StateError::CorruptCheckpoint {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        let mut checkpoints = Checkpoints::new();
        for (key, value) in raw {
            match serde_json::from_value::<CheckpointRecord>(value) {
                Ok(record) => {
                    checkpoints.insert(key, record);
                }
                Err(e) => warn!("Dropping checkpoint {} in {:?}: {}", key, self.path, e),
            }
        }
        Ok(checkpoints)
    }

    /// Read all checkpoints, treating every problem as "no prior
    /// checkpoint". The worst this can do is skip one round of
    /// differences.
    pub fn load_or_empty(&self) -> Checkpoints {
        match self.load() {
            Ok(checkpoints) => checkpoints,
            Err(e) => {
                warn!("Ignoring checkpoints: {}", e);
                Checkpoints::new()
            }
        }
    }

    /// Write all checkpoints.
    ///
    /// Data goes into a temporary file in the same directory first,
    /// which is then renamed over the checkpoint file. A reader never
    /// sees half of a file.
    pub fn save(&self, checkpoints: &Checkpoints) -> StateResult<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| StateError::io(&dir, e))?;

        let tmp = NamedTempFile::new_in(&dir).map_err(|e| StateError::io(&dir, e))?;
        {
            let mut handle = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut handle, checkpoints)
                .map_err(|e| StateError::io(tmp.path(), e.into()))?;
            handle.flush().map_err(|e| StateError::io(tmp.path(), e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| StateError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| StateError::io(&self.path, e.error))?;
        debug!("Saved {} checkpoints to {:?}", checkpoints.len(), self.path);
        Ok(())
    }

    /// Try to take an advisory lock next to the checkpoint file.
    ///
    /// Two runs of the same plugin at once may lose one of their
    /// updates, which is acceptable, so this never blocks: if the lock
    /// is held elsewhere or can not be created, it logs and returns
    /// None.
    pub fn lock(&self) -> Option<StoreLock> {
        let mut name = self.path.clone().into_os_string();
        name.push(".lock");
        let lockpath = PathBuf::from(name);
        if let Some(dir) = lockpath.parent() {
            if !dir.as_os_str().is_empty() {
                let _ = fs::create_dir_all(dir);
            }
        }
        let file = match OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lockpath)
        {
            Ok(file) => file,
            Err(e) => {
                warn!("Could not open lockfile {:?}: {}", lockpath, e);
                return None;
            }
        };
        match file.try_lock_exclusive() {
            Ok(()) => Some(StoreLock { file }),
            Err(e) => {
                warn!("Checkpoint {:?} is locked by another run: {}", self.path, e);
                None
            }
        }
    }
}
