//! Error types for the binning core.
//!
//! Read classification (keep/discard) is not an error and never appears
//! here; see [`crate::cigar_scorer::ScoreOutcome`]. Everything in this
//! module is a system failure that the orchestrator either skips a bin for
//! or aborts the run on.

use std::io;
use std::path::PathBuf;

use crate::bin_registry::BinId;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    /// A file could not be opened, created, read or written
    #[error("file error on {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reserving memory for a bucket table or id set failed
    #[error("allocation failed for {what}")]
    Allocation { what: &'static str },

    /// The aligner subprocess could not run or produced unusable output
    #[error("aligner `{program}` failed: {reason}")]
    AlignerFailed { program: String, reason: String },

    /// The consensus collaborator could not build a consensus
    #[error("consensus builder `{program}` failed: {reason}")]
    ConsensusFailed { program: String, reason: String },

    /// An alignment line that cannot be scored safely
    #[error("malformed alignment record at line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    /// A FASTQ record that is truncated or lacks its markers
    #[error("malformed FASTQ in {}: {reason}", path.display())]
    MalformedFastq { path: PathBuf, reason: String },

    #[error("invalid thresholds: {0}")]
    InvalidThresholds(String),

    /// The handle no longer names a live bin
    #[error("stale bin handle {0:?}")]
    StaleBin(BinId),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ClusterError {
    /// Wrap an I/O error with the path it happened on
    pub fn file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(line: usize, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            line,
            reason: reason.into(),
        }
    }

    /// True when the failure only invalidates the bin being processed.
    ///
    /// File, allocation and configuration failures are not bin-local: the
    /// next bin would hit the same condition, so the run aborts.
    pub fn is_bin_local(&self) -> bool {
        matches!(
            self,
            Self::AlignerFailed { .. }
                | Self::ConsensusFailed { .. }
                | Self::MalformedRecord { .. }
                | Self::MalformedFastq { .. }
                | Self::StaleBin(_)
        )
    }
}
