//! Error conditions raised while handling plugin state

use std::{io, path::PathBuf};
use thiserror::Error;

/// Result alias used by the state handling modules.
pub type StateResult<T> = Result<T, StateError>;

/// Everything that can go wrong with checkpoints, position files and
/// the records fed into the aggregator.
///
/// Only [StateError::Io] on the monitored resource is fatal for an
/// invocation. The corrupt-state variants degrade to "no prior state"
/// at the call site, and [StateError::RecordParse] only ever skips a
/// single record.
#[derive(Debug, Error)]
pub enum StateError {
    /// Reading or writing a file failed.
    #[error("{path}: {source}")]
    Io {
        /// File the operation was working on
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The checkpoint file exists but does not decode.
    #[error("corrupt checkpoint {path}: {reason}")]
    CorruptCheckpoint {
        /// Checkpoint file
        path: PathBuf,
        /// Decoder message
        reason: String,
    },

    /// The position file exists but does not decode.
    #[error("corrupt position file {path}: {reason}")]
    CorruptPositionFile {
        /// Position file
        path: PathBuf,
        /// Decoder message
        reason: String,
    },

    /// A single input record could not be parsed or classified.
    #[error("unparsable record: {0}")]
    RecordParse(String),
}

impl StateError {
    /// Wrap an [io::Error] with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Shorthand for a [StateError::RecordParse].
    pub fn record(message: impl Into<String>) -> Self {
        Self::RecordParse(message.into())
    }

    /// Does this condition mean "there is no usable prior state"?
    ///
    /// Callers use this to decide between degrading and failing.
    pub fn is_corrupt_state(&self) -> bool {
        matches!(
            self,
            Self::CorruptCheckpoint { .. } | Self::CorruptPositionFile { .. }
        )
    }
}
