//! Certification: deterministic first-committer-wins conflict detection.

use std::collections::HashMap;

use thiserror::Error;

use crate::core::Seqno;
use crate::ws::{RowKey, WriteSet};

/// Result of certifying one write-set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertOutcome {
    /// No conflict; the transaction may apply once everything up to
    /// `depends_seqno` has applied.
    Pass { depends_seqno: Seqno },
    /// A concurrent transaction the originator never saw wrote one of
    /// the keys first.
    Fail,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CertError {
    #[error("certification at {seqno} out of order (position {position})")]
    OutOfOrder { seqno: Seqno, position: Seqno },
}

/// The certification index: every recently written key mapped to the
/// global seqno of its last writer.
///
/// Decisions are deterministic across nodes because certification runs
/// serially in global order inside the local monitor, so every node
/// evaluates the same write-set against the same index state.
#[derive(Debug)]
pub struct Certification {
    index: HashMap<RowKey, Seqno>,
    position: Seqno,
    safe_to_discard: Seqno,
}

impl Certification {
    pub fn new(position: Seqno) -> Self {
        Self {
            index: HashMap::new(),
            position,
            safe_to_discard: position,
        }
    }

    /// Last certified global seqno.
    pub fn position(&self) -> Seqno {
        self.position
    }

    /// Current purge horizon.
    pub fn safe_to_discard(&self) -> Seqno {
        self.safe_to_discard
    }

    pub fn index_size(&self) -> usize {
        self.index.len()
    }

    /// Last writer of `key`, if the entry is still within the
    /// certification window.
    pub fn last_writer(&self, key: &RowKey) -> Option<Seqno> {
        self.index.get(key).copied()
    }

    /// Certifies a write-set at `global_seqno`. Must be called in strict
    /// global order; the caller holds the local monitor slot that
    /// guarantees it.
    pub fn append_trx(
        &mut self,
        write_set: &WriteSet,
        global_seqno: Seqno,
    ) -> Result<CertOutcome, CertError> {
        if global_seqno <= self.position {
            return Err(CertError::OutOfOrder {
                seqno: global_seqno,
                position: self.position,
            });
        }
        self.position = global_seqno;

        let last_seen = write_set.last_seen_seqno();
        let mut depends = last_seen;
        for key in write_set.keys() {
            if let Some(&writer) = self.index.get(key) {
                if writer > last_seen && writer != global_seqno {
                    tracing::debug!(
                        seqno = %global_seqno,
                        conflict = %writer,
                        last_seen = %last_seen,
                        key = %key,
                        "certification conflict"
                    );
                    return Ok(CertOutcome::Fail);
                }
                if writer > depends {
                    depends = writer;
                }
            }
        }

        for key in write_set.keys() {
            self.index.insert(key.clone(), global_seqno);
        }

        Ok(CertOutcome::Pass {
            depends_seqno: depends,
        })
    }

    /// Evicts every index entry written at or before transactions that
    /// the whole group has committed: entries whose last writer is below
    /// `horizon` can no longer conflict with anything in flight.
    pub fn purge_trxs_upto(&mut self, horizon: Seqno) {
        if horizon <= self.safe_to_discard {
            return;
        }
        self.index.retain(|_, writer| *writer >= horizon);
        self.safe_to_discard = horizon;
    }

    /// Rebases the index at a new common position: used on view changes
    /// so that all members (joiners included) certify from identical
    /// state.
    pub fn assign_initial_position(&mut self, position: Seqno) {
        self.index.clear();
        self.position = position;
        self.safe_to_discard = position;
    }
}
