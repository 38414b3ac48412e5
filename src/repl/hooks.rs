//! Host callback seam.

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::core::{Seqno, ViewInfo};

use super::state_req::StateRequest;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("apply failed: {reason}")]
pub struct ApplyError {
    pub reason: String,
}

impl ApplyError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("donation failed: {reason}")]
pub struct DonateError {
    pub reason: String,
}

impl DonateError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Callbacks into the host storage engine.
///
/// `apply` and `commit` are invoked from receiver threads under the
/// apply and commit monitors respectively; implementations must not call
/// back into the replicator from them.
pub trait ReplicationHooks: Send + Sync {
    /// A new view was installed (after the node FSM transition).
    fn view_changed(&self, view: &ViewInfo);

    /// Applies a remote write-set. An error here is fatal for the node:
    /// a totally ordered transaction cannot be rolled back.
    fn apply(&self, ws: &[u8], global_seqno: Seqno) -> Result<(), ApplyError>;

    /// Commits previously applied work at `global_seqno`.
    fn commit(&self, global_seqno: Seqno) -> Result<(), ApplyError>;

    /// This node was chosen as donor: serve the request (snapshot or
    /// incremental range) and have the host call
    /// [`crate::repl::Replicator::sst_sent`] when done.
    fn donate(
        &self,
        request: &StateRequest,
        state_uuid: Uuid,
        seqno: Seqno,
    ) -> Result<(), DonateError>;

    /// The node caught up with the group (JOINED -> SYNCED).
    fn synced(&self);

    /// Opaque SST descriptor to embed in an outgoing state request.
    fn sst_request(&self) -> Bytes {
        Bytes::new()
    }
}
