//! Per-transaction state machine and handle.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use thiserror::Error;

use crate::core::{ConnId, NodeId, Seqno, TrxId};
use crate::ws::WriteSet;

/// Transaction lifecycle states.
///
/// Clients drive the happy path (`Executing → Certifying → Applying →
/// Committing → Committed`); brute-force aborts detour through
/// `MustAbort` and either the replay or the rollback branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrxState {
    Executing,
    MustAbort,
    Aborting,
    MustReplay,
    Replaying,
    Certifying,
    Applying,
    Committing,
    Committed,
    RolledBack,
}

impl fmt::Display for TrxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrxState::Executing => "executing",
            TrxState::MustAbort => "must-abort",
            TrxState::Aborting => "aborting",
            TrxState::MustReplay => "must-replay",
            TrxState::Replaying => "replaying",
            TrxState::Certifying => "certifying",
            TrxState::Applying => "applying",
            TrxState::Committing => "committing",
            TrxState::Committed => "committed",
            TrxState::RolledBack => "rolled-back",
        };
        f.write_str(name)
    }
}

const TRX_TRANSITIONS: &[(TrxState, TrxState)] = &[
    (TrxState::Executing, TrxState::Certifying),
    (TrxState::Executing, TrxState::MustAbort),
    (TrxState::Executing, TrxState::Aborting),
    (TrxState::Certifying, TrxState::Applying),
    (TrxState::Certifying, TrxState::MustAbort),
    (TrxState::Certifying, TrxState::Aborting),
    (TrxState::MustAbort, TrxState::Aborting),
    (TrxState::MustAbort, TrxState::MustReplay),
    (TrxState::MustReplay, TrxState::Replaying),
    (TrxState::MustReplay, TrxState::Aborting),
    (TrxState::Replaying, TrxState::Committing),
    (TrxState::Replaying, TrxState::Aborting),
    (TrxState::Applying, TrxState::Committing),
    (TrxState::Committing, TrxState::Committed),
    (TrxState::Aborting, TrxState::RolledBack),
];

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("illegal transaction state transition {from} -> {to}")]
pub struct IllegalTrxTransition {
    pub from: TrxState,
    pub to: TrxState,
}

/// Mutable transaction state, guarded by the handle's mutex.
#[derive(Debug)]
pub struct TrxInner {
    state: TrxState,
    local_seqno: Seqno,
    global_seqno: Seqno,
    depends_seqno: Seqno,
    last_seen_seqno: Seqno,
    write_set: WriteSet,
    ws_bytes: Option<Bytes>,
    certified: bool,
}

impl TrxInner {
    pub fn state(&self) -> TrxState {
        self.state
    }

    pub fn set_state(&mut self, to: TrxState) -> Result<(), IllegalTrxTransition> {
        if self.state == to {
            return Ok(());
        }
        if !TRX_TRANSITIONS.contains(&(self.state, to)) {
            return Err(IllegalTrxTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn local_seqno(&self) -> Seqno {
        self.local_seqno
    }

    pub fn global_seqno(&self) -> Seqno {
        self.global_seqno
    }

    pub fn depends_seqno(&self) -> Seqno {
        self.depends_seqno
    }

    pub fn last_seen_seqno(&self) -> Seqno {
        self.last_seen_seqno
    }

    pub fn assign_seqnos(&mut self, local: Seqno, global: Seqno) {
        self.local_seqno = local;
        self.global_seqno = global;
    }

    pub fn assign_depends_seqno(&mut self, depends: Seqno) {
        self.depends_seqno = depends;
    }

    pub fn assign_last_seen_seqno(&mut self, last_seen: Seqno) {
        self.last_seen_seqno = last_seen;
        self.write_set.assign_last_seen_seqno(last_seen);
    }

    pub fn write_set(&self) -> &WriteSet {
        &self.write_set
    }

    pub fn write_set_mut(&mut self) -> &mut WriteSet {
        &mut self.write_set
    }

    pub fn ws_bytes(&self) -> Option<&Bytes> {
        self.ws_bytes.as_ref()
    }

    pub fn assign_ws_bytes(&mut self, bytes: Bytes) {
        self.ws_bytes = Some(bytes);
    }

    pub fn is_certified(&self) -> bool {
        self.certified
    }

    pub fn mark_certified(&mut self) {
        self.certified = true;
    }
}

/// A reference-counted transaction handle, shared between the
/// originating client and the background pipeline threads.
#[derive(Debug)]
pub struct TrxHandle {
    source_id: NodeId,
    conn_id: ConnId,
    trx_id: TrxId,
    local: bool,
    inner: Mutex<TrxInner>,
}

pub type SharedTrx = Arc<TrxHandle>;

impl TrxHandle {
    /// Creates a handle for a locally originated transaction; the client
    /// stages its write-set through [`TrxInner::write_set_mut`].
    pub fn new_local(
        source_id: NodeId,
        conn_id: ConnId,
        trx_id: TrxId,
        ws_type: crate::ws::WsType,
    ) -> SharedTrx {
        let write_set = WriteSet::new(source_id, conn_id, trx_id, ws_type);
        Arc::new(Self {
            source_id,
            conn_id,
            trx_id,
            local: true,
            inner: Mutex::new(TrxInner {
                state: TrxState::Executing,
                local_seqno: Seqno::UNDEFINED,
                global_seqno: Seqno::UNDEFINED,
                depends_seqno: Seqno::UNDEFINED,
                last_seen_seqno: Seqno::UNDEFINED,
                write_set,
                ws_bytes: None,
                certified: false,
            }),
        })
    }

    /// Creates a handle for a write-set delivered from the group.
    pub fn new_remote(
        write_set: WriteSet,
        ws_bytes: Bytes,
        global_seqno: Seqno,
        local_seqno: Seqno,
    ) -> SharedTrx {
        let last_seen = write_set.last_seen_seqno();
        Arc::new(Self {
            source_id: write_set.source_id(),
            conn_id: write_set.conn_id(),
            trx_id: write_set.trx_id(),
            local: false,
            inner: Mutex::new(TrxInner {
                state: TrxState::Certifying,
                local_seqno,
                global_seqno,
                depends_seqno: Seqno::UNDEFINED,
                last_seen_seqno: last_seen,
                write_set,
                ws_bytes: Some(ws_bytes),
                certified: false,
            }),
        })
    }

    pub fn source_id(&self) -> NodeId {
        self.source_id
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn trx_id(&self) -> TrxId {
        self.trx_id
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn lock(&self) -> MutexGuard<'_, TrxInner> {
        self.inner.lock().expect("trx lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn local_trx() -> SharedTrx {
        TrxHandle::new_local(
            NodeId::new(Uuid::from_bytes([1u8; 16])),
            ConnId::new(1),
            TrxId::new(7),
            crate::ws::WsType::Trx,
        )
    }

    #[test]
    fn happy_path_transitions() {
        let trx = local_trx();
        let mut inner = trx.lock();
        assert_eq!(inner.state(), TrxState::Executing);
        inner.set_state(TrxState::Certifying).unwrap();
        inner.set_state(TrxState::Applying).unwrap();
        inner.set_state(TrxState::Committing).unwrap();
        inner.set_state(TrxState::Committed).unwrap();
    }

    #[test]
    fn replay_branch_transitions() {
        let trx = local_trx();
        let mut inner = trx.lock();
        inner.set_state(TrxState::MustAbort).unwrap();
        inner.set_state(TrxState::MustReplay).unwrap();
        inner.set_state(TrxState::Replaying).unwrap();
        inner.set_state(TrxState::Committing).unwrap();
        inner.set_state(TrxState::Committed).unwrap();
    }

    #[test]
    fn rollback_branch_transitions() {
        let trx = local_trx();
        let mut inner = trx.lock();
        inner.set_state(TrxState::MustAbort).unwrap();
        inner.set_state(TrxState::Aborting).unwrap();
        inner.set_state(TrxState::RolledBack).unwrap();
    }

    #[test]
    fn undefined_transitions_are_rejected() {
        let trx = local_trx();
        let mut inner = trx.lock();
        let err = inner.set_state(TrxState::Committed).unwrap_err();
        assert_eq!(
            err,
            IllegalTrxTransition {
                from: TrxState::Executing,
                to: TrxState::Committed,
            }
        );
    }

    #[test]
    fn set_state_is_idempotent_on_same_state() {
        let trx = local_trx();
        let mut inner = trx.lock();
        inner.set_state(TrxState::Executing).unwrap();
        assert_eq!(inner.state(), TrxState::Executing);
    }
}
