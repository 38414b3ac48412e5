//! Stable, externally observable error taxonomy.

use thiserror::Error;

use super::TrxId;

/// Replication outcome kinds surfaced to the host.
///
/// The set is part of the external contract: hosts match on these to decide
/// between rollback, replay and node shutdown.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Group transport down or node not in a state to serve the request.
    #[error("group connection failed: {reason}")]
    ConnFail { reason: String },

    /// The transaction must roll back (certification or local apply failure).
    #[error("transaction must roll back")]
    TrxFail,

    /// The transaction was brute-force aborted by a higher-priority one.
    /// The client either replays it or rolls back.
    #[error("transaction was brute-force aborted")]
    BfAbort,

    /// Unknown transaction id; a host-side programming error.
    #[error("unknown transaction {trx_id}")]
    TrxMissing { trx_id: TrxId },

    /// Fatal: the node cannot continue and must shut down cleanly.
    #[error("fatal node failure: {reason}")]
    NodeFail { reason: String },

    /// Non-fatal anomaly, reported but not acted upon.
    #[error("warning: {reason}")]
    Warning { reason: String },
}

impl Error {
    pub fn conn_fail(reason: impl Into<String>) -> Self {
        Error::ConnFail {
            reason: reason.into(),
        }
    }

    pub fn node_fail(reason: impl Into<String>) -> Self {
        Error::NodeFail {
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::NodeFail { .. })
    }
}
