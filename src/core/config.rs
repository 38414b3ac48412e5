//! Replicator configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Commit ordering policy for the commit monitor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitMode {
    /// Commit monitor disabled; commits are not ordered at all.
    Bypass,
    /// Out-of-order commit: any commit may finish at any time.
    Oooc,
    /// Local transactions commit out of order; remote ones strictly.
    LocalOooc,
    /// Strict total commit order.
    #[default]
    NoOooc,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid commit order value {value}, expected 0..=3")]
pub struct InvalidCommitMode {
    pub value: i64,
}

impl CommitMode {
    pub fn from_number(value: i64) -> Result<Self, InvalidCommitMode> {
        match value {
            0 => Ok(CommitMode::Bypass),
            1 => Ok(CommitMode::Oooc),
            2 => Ok(CommitMode::LocalOooc),
            3 => Ok(CommitMode::NoOooc),
            _ => Err(InvalidCommitMode { value }),
        }
    }

    pub fn as_number(self) -> i64 {
        match self {
            CommitMode::Bypass => 0,
            CommitMode::Oooc => 1,
            CommitMode::LocalOooc => 2,
            CommitMode::NoOooc => 3,
        }
    }
}

/// Construction-time configuration for a [`crate::repl::Replicator`].
///
/// Passed by value at construction; there is no process-wide mutable state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// Commit ordering policy (the `commit_order` key, 0..=3).
    pub commit_order: CommitMode,
    /// Location of the persisted `uuid:seqno` state file.
    pub state_file: PathBuf,
    /// Working directory for replication state.
    pub data_dir: PathBuf,
    /// Report last-committed to the group every Nth commit.
    pub report_interval: u64,
    /// Seconds between state transfer request retries.
    pub sst_retry_sec: u64,
    /// Replication protocol version to negotiate; `-1` means newest.
    pub protocol_version: i32,
    /// Preferred state transfer donor; empty lets the group choose.
    pub sst_donor: String,
    /// Accept total-order isolation operations while not yet synced.
    pub isolation_while_unsynced: bool,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            commit_order: CommitMode::default(),
            state_file: PathBuf::from("lockstep_state.dat"),
            data_dir: PathBuf::from("."),
            report_interval: 4,
            sst_retry_sec: 1,
            protocol_version: -1,
            sst_donor: String::new(),
            isolation_while_unsynced: false,
        }
    }
}

impl ReplConfig {
    /// Absolute path of the state file, resolved against `data_dir` when
    /// relative.
    pub fn state_file_path(&self) -> PathBuf {
        if self.state_file.is_absolute() {
            self.state_file.clone()
        } else {
            self.data_dir.join(&self.state_file)
        }
    }
}
