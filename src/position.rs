//! Position-tracked reading of growing files
//!
//! Log based plugins only want the lines appended since their last
//! run. The reader remembers how far it got in a small JSON position
//! file next to the plugins other state, and detects rotation and
//! truncation of the monitored file by its identity and size.
//!
//! A position file that is missing or older than the staleness window
//! means the plugin did not run for a while. The reader then still
//! consumes everything up to the end of the file, so the next run
//! starts at the right place, but tells the caller not to report
//! metrics for this round.

use crate::error::{StateError, StateResult};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, Metadata},
    io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Component, Path, PathBuf, Prefix},
    time::Duration,
};
use tempfile::NamedTempFile;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

/// How far a monitored file has been consumed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRecord {
    /// Byte offset up to which the file has been read
    pub offset: u64,
    /// Unix time (seconds) the position was written
    #[serde(rename = "savedAt")]
    pub saved_at: u64,
    /// Identity (device and inode) of the file the offset belongs to
    pub identity: String,
}

impl PositionRecord {
    /// Read a position file. Missing file gives `Ok(None)`.
    pub fn load(path: &Path) -> StateResult<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(path, e)),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| StateError::CorruptPositionFile {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    /// Write the position file via a temporary file and rename.
    pub fn save(&self, path: &Path) -> StateResult<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| StateError::io(&dir, e))?;
        let tmp = NamedTempFile::new_in(&dir).map_err(|e| StateError::io(&dir, e))?;
        {
            let mut handle = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut handle, self)
                .map_err(|e| StateError::io(tmp.path(), e.into()))?;
            handle.flush().map_err(|e| StateError::io(tmp.path(), e))?;
        }
        tmp.persist(path).map_err(|e| StateError::io(path, e.error))?;
        Ok(())
    }

    /// Was this written within `window` before `now`? A timestamp in
    /// the future counts as fresh.
    pub fn is_fresh(&self, now: u64, window: Duration) -> bool {
        now.saturating_sub(self.saved_at) <= window.as_secs()
    }
}

/// Identity of a file, used to notice rotation.
#[cfg(unix)]
pub fn file_identity(meta: &Metadata) -> String {
    format!("{}:{}", meta.dev(), meta.ino())
}

/// Identity of a file, used to notice rotation.
///
/// Not available here, rotation is only noticed when the file shrinks.
#[cfg(not(unix))]
pub fn file_identity(_meta: &Metadata) -> String {
    String::new()
}

/// Where the position file for `target` lives.
///
/// Default is `<workdir>/mackerel-plugin-<plugin>.d/<target>.pos.json`.
/// An absolute `custom` path is used as is, a relative one replaces
/// the `<target>.pos.json` part. A Windows drive prefix (`C:\`) in the
/// name becomes a plain directory (`C\`), so the result stays below
/// the workdir.
pub fn position_path_for(
    workdir: &Path,
    plugin: &str,
    target: &Path,
    custom: Option<&Path>,
) -> PathBuf {
    let base = match custom {
        Some(custom) if custom.is_absolute() => return custom.to_path_buf(),
        Some(custom) => custom.to_path_buf(),
        None => {
            let mut name = target.as_os_str().to_os_string();
            name.push(".pos.json");
            PathBuf::from(name)
        }
    };

    let mut path = workdir.join(format!("mackerel-plugin-{}.d", plugin));
    for component in base.components() {
        match component {
            Component::Prefix(prefix) => match prefix.kind() {
                Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) => {
                    path.push((letter as char).to_string())
                }
                _ => path.push(prefix.as_os_str()),
            },
            Component::Normal(part) => path.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => path.push(".."),
        }
    }
    path
}

/// Reader over the part of a file not seen by earlier runs.
///
/// Reaching the end of the file writes the new position, exactly
/// once. A failure to do so is returned from the read call that hit
/// the end.
#[derive(Debug)]
pub struct IncrementalReader {
    inner: BufReader<File>,
    target: PathBuf,
    position_path: PathBuf,
    identity: String,
    offset: u64,
    now: u64,
    saved: bool,
}

impl IncrementalReader {
    /// Open `target` at the position remembered in `position_path`.
    ///
    /// Returns the reader and whether the caller should report
    /// metrics from it. That is only the case when the position file
    /// exists and was written within `window` before `now`. The target
    /// not being readable is the only error, everything wrong with the
    /// position file just means starting from the beginning.
    pub fn open(
        target: &Path,
        position_path: &Path,
        window: Duration,
        now: u64,
    ) -> StateResult<(Self, bool)> {
        let mut file = File::open(target).map_err(|e| StateError::io(target, e))?;
        let meta = file.metadata().map_err(|e| StateError::io(target, e))?;
        let identity = file_identity(&meta);

        let record = match PositionRecord::load(position_path) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring position file: {}", e);
                None
            }
        };

        let (offset, should_emit) = match record {
            None => {
                debug!("No usable position for {:?}, first run", target);
                (0, false)
            }
            Some(record) => {
                let fresh = record.is_fresh(now, window);
                if !fresh {
                    debug!(
                        "Position file {:?} saved at {} is stale",
                        position_path, record.saved_at
                    );
                }
                if record.identity != identity || record.offset > meta.len() {
                    debug!("{:?} was rotated or truncated, reading from the start", target);
                    (0, fresh)
                } else {
                    (record.offset, fresh)
                }
            }
        };

        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StateError::io(target, e))?;
        trace!("Reading {:?} from offset {}", target, offset);

        Ok((
            Self {
                inner: BufReader::new(file),
                target: target.to_path_buf(),
                position_path: position_path.to_path_buf(),
                identity,
                offset,
                now,
                saved: false,
            },
            should_emit,
        ))
    }

    /// Bytes consumed so far, counted from the start of the file
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read and throw away everything up to the end of the file, which
    /// also stores the new position. Returns the number of skipped
    /// bytes.
    pub fn discard(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }

    fn save_position(&mut self) -> io::Result<()> {
        if self.saved {
            return Ok(());
        }
        let record = PositionRecord {
            offset: self.offset,
            saved_at: self.now,
            identity: self.identity.clone(),
        };
        record
            .save(&self.position_path)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.saved = true;
        debug!("{:?} consumed up to {}", self.target, self.offset);
        Ok(())
    }
}

impl Read for IncrementalReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.save_position()?;
        }
        self.offset += n as u64;
        Ok(n)
    }
}

impl BufRead for IncrementalReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.inner.fill_buf()?.is_empty() {
            self.save_position()?;
        }
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt);
        self.offset += amt as u64;
    }
}
