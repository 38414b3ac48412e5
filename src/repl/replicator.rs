//! The replicator: certification and the three-stage ordering pipeline
//! over the totally ordered group action stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use crate::core::{CommitMode, ConnId, Error, NodeId, ReplConfig, Seqno, TrxId, ViewInfo, ViewStatus};
use crate::ws::{F_COMMIT, WriteSet, WsType};

use super::cert::{CertOutcome, Certification};
use super::fsm::{NodeFsm, NodeState};
use super::gcs::{Action, GcsError, GroupChannel};
use super::hooks::ReplicationHooks;
use super::monitor::{ApplyOrder, CommitOrder, LocalOrder, Monitor, MonitorError};
use super::proto::{self, ProtocolVersions};
use super::service::ServiceThd;
use super::state_file::{self, SavedState};
use super::state_req::StateRequest;
use super::trx::{SharedTrx, TrxHandle, TrxState};

#[derive(Debug)]
struct NodeShared {
    fsm: NodeFsm,
    state_uuid: Uuid,
    pending_sync_target: Option<Seqno>,
    paused: bool,
}

#[derive(Debug, Default)]
struct SstShared {
    received: Option<SavedState>,
}

#[derive(Debug, Default)]
struct Counters {
    replicated: AtomicU64,
    replicated_bytes: AtomicU64,
    received: AtomicU64,
    received_bytes: AtomicU64,
    local_commits: AtomicU64,
    local_rollbacks: AtomicU64,
    local_cert_failures: AtomicU64,
    local_bf_aborts: AtomicU64,
    local_replays: AtomicU64,
}

/// A point-in-time statistics snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stats {
    pub state: NodeState,
    pub last_committed: Seqno,
    pub cert_index_size: usize,
    pub replicated: u64,
    pub replicated_bytes: u64,
    pub received: u64,
    pub received_bytes: u64,
    pub local_commits: u64,
    pub local_rollbacks: u64,
    pub local_cert_failures: u64,
    pub local_bf_aborts: u64,
    pub local_replays: u64,
}

/// Synchronous multi-master replicator.
///
/// Local clients drive transactions through `replicate` -> `pre_commit`
/// -> (engine commit) -> `post_commit`, or the rollback/replay branches.
/// Receiver threads pump the ordered action stream through
/// [`Replicator::run_receiver`]; apply concurrency equals the number of
/// receiver threads, ordered by the apply monitor.
pub struct Replicator {
    config: ReplConfig,
    protocol: ProtocolVersions,
    gcs: Arc<dyn GroupChannel>,
    hooks: Arc<dyn ReplicationHooks>,
    node: Mutex<NodeShared>,
    sst: Mutex<SstShared>,
    sst_cond: Condvar,
    cert: Mutex<Certification>,
    trx_map: Mutex<HashMap<TrxId, SharedTrx>>,
    conn_map: Mutex<HashMap<ConnId, SharedTrx>>,
    local_monitor: Monitor,
    apply_monitor: Monitor,
    commit_monitor: Monitor,
    service: ServiceThd,
    report_counter: AtomicU64,
    counters: Counters,
}

impl Replicator {
    pub fn new(
        config: ReplConfig,
        gcs: Arc<dyn GroupChannel>,
        hooks: Arc<dyn ReplicationHooks>,
    ) -> Result<Self, Error> {
        let protocol = proto::establish(config.protocol_version)
            .map_err(|err| Error::conn_fail(err.to_string()))?;
        let saved = state_file::restore(&config.state_file_path())
            .map_err(|err| Error::node_fail(err.to_string()))?;
        tracing::info!(
            uuid = %saved.uuid,
            seqno = %saved.seqno,
            repl_proto = protocol.repl,
            "replicator starting"
        );

        let service = ServiceThd::start(Arc::clone(&gcs));
        Ok(Self {
            config,
            protocol,
            gcs,
            hooks,
            node: Mutex::new(NodeShared {
                fsm: NodeFsm::new(),
                state_uuid: saved.uuid,
                pending_sync_target: None,
                paused: false,
            }),
            sst: Mutex::new(SstShared::default()),
            sst_cond: Condvar::new(),
            cert: Mutex::new(Certification::new(saved.seqno)),
            trx_map: Mutex::new(HashMap::new()),
            conn_map: Mutex::new(HashMap::new()),
            local_monitor: Monitor::new(Seqno::new(0)),
            apply_monitor: Monitor::new(saved.seqno),
            commit_monitor: Monitor::new(saved.seqno),
            service,
            report_counter: AtomicU64::new(0),
            counters: Counters::default(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.gcs.node_id()
    }

    /// Group state identity this node is tracking.
    pub fn state_uuid(&self) -> Uuid {
        self.lock_node().state_uuid
    }

    pub fn protocol_versions(&self) -> ProtocolVersions {
        self.protocol
    }

    pub fn state(&self) -> NodeState {
        self.lock_node().fsm.state()
    }

    /// Highest global seqno known fully applied on this node.
    pub fn last_committed(&self) -> Seqno {
        self.apply_monitor.last_left()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            state: self.state(),
            last_committed: self.last_committed(),
            cert_index_size: self.lock_cert().index_size(),
            replicated: self.counters.replicated.load(Ordering::Relaxed),
            replicated_bytes: self.counters.replicated_bytes.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            received_bytes: self.counters.received_bytes.load(Ordering::Relaxed),
            local_commits: self.counters.local_commits.load(Ordering::Relaxed),
            local_rollbacks: self.counters.local_rollbacks.load(Ordering::Relaxed),
            local_cert_failures: self.counters.local_cert_failures.load(Ordering::Relaxed),
            local_bf_aborts: self.counters.local_bf_aborts.load(Ordering::Relaxed),
            local_replays: self.counters.local_replays.load(Ordering::Relaxed),
        }
    }

    /// Moves the node out of `Closed`; the first view from the group
    /// channel completes initialization.
    pub fn connect(&self) -> Result<(), Error> {
        let mut node = self.lock_node();
        node.fsm
            .shift_to(NodeState::Connected)
            .map_err(|err| Error::node_fail(err.to_string()))?;
        Ok(())
    }

    /// Leaves the group, flushes the service thread and persists the
    /// final position.
    pub fn close(&self) -> Result<(), Error> {
        {
            let mut node = self.lock_node();
            if node.fsm.state() == NodeState::Closed {
                return Ok(());
            }
            node.fsm
                .shift_to(NodeState::Closed)
                .map_err(|err| Error::node_fail(err.to_string()))?;
        }
        let _ = self.gcs.close();
        self.service.flush();
        self.service.shutdown();

        let state = SavedState {
            uuid: self.lock_node().state_uuid,
            seqno: self.last_committed(),
        };
        state_file::store(&self.config.state_file_path(), state)
            .map_err(|err| Error::node_fail(err.to_string()))?;
        tracing::info!(seqno = %state.seqno, "replicator closed");
        Ok(())
    }

    // ----- local transaction registry ------------------------------------

    pub fn local_trx(&self, trx_id: TrxId, create: bool) -> Option<SharedTrx> {
        let mut map = self.trx_map.lock().expect("trx map lock poisoned");
        if let Some(trx) = map.get(&trx_id) {
            return Some(Arc::clone(trx));
        }
        if !create {
            return None;
        }
        let trx = TrxHandle::new_local(self.node_id(), ConnId::UNDEFINED, trx_id, WsType::Trx);
        map.insert(trx_id, Arc::clone(&trx));
        Some(trx)
    }

    pub fn discard_local_trx(&self, trx_id: TrxId) {
        self.trx_map
            .lock()
            .expect("trx map lock poisoned")
            .remove(&trx_id);
    }

    pub fn local_conn_trx(&self, conn_id: ConnId, create: bool) -> Option<SharedTrx> {
        let mut map = self.conn_map.lock().expect("conn map lock poisoned");
        if let Some(trx) = map.get(&conn_id) {
            return Some(Arc::clone(trx));
        }
        if !create {
            return None;
        }
        let trx = TrxHandle::new_local(self.node_id(), conn_id, TrxId::UNDEFINED, WsType::Conn);
        map.insert(conn_id, Arc::clone(&trx));
        Some(trx)
    }

    pub fn discard_local_conn(&self, conn_id: ConnId) {
        self.conn_map
            .lock()
            .expect("conn map lock poisoned")
            .remove(&conn_id);
    }

    // ----- client pipeline ------------------------------------------------

    /// Hands the transaction's write-set to the group channel and blocks
    /// until it is ordered. The trx lock is released while blocked.
    ///
    /// On [`Error::BfAbort`]: if the trx has a global seqno the client
    /// must continue with [`Replicator::pre_commit`] (which resolves the
    /// replay-or-rollback question); otherwise it rolls back.
    pub fn replicate(&self, trx: &SharedTrx) -> Result<(), Error> {
        self.check_accepts(trx)?;

        let ws_bytes = {
            let mut inner = trx.lock();
            match inner.state() {
                TrxState::Executing => {}
                TrxState::MustAbort => return Err(Error::BfAbort),
                other => {
                    return Err(Error::node_fail(format!("replicate in state {other}")));
                }
            }
            inner.assign_last_seen_seqno(self.last_committed());
            let flags = inner.write_set().flags() | F_COMMIT;
            inner.write_set_mut().assign_flags(flags);
            let bytes = inner
                .write_set()
                .encode()
                .map_err(|err| Error::node_fail(err.to_string()))?;
            inner.assign_ws_bytes(bytes.clone());
            bytes
        };

        let order = self
            .gcs
            .replicate(ws_bytes.clone())
            .map_err(|err| Error::conn_fail(err.to_string()))?;
        self.counters.replicated.fetch_add(1, Ordering::Relaxed);
        self.counters
            .replicated_bytes
            .fetch_add(ws_bytes.len() as u64, Ordering::Relaxed);

        let mut inner = trx.lock();
        inner.assign_seqnos(order.local_seqno, order.global_seqno);
        match inner.state() {
            TrxState::Executing => {
                inner
                    .set_state(TrxState::Certifying)
                    .map_err(|err| Error::node_fail(err.to_string()))?;
                Ok(())
            }
            // Brute-force aborted while waiting in the group channel; the
            // write-set is ordered, so certification must still happen.
            TrxState::MustAbort => Err(Error::BfAbort),
            other => Err(Error::node_fail(format!(
                "replicate completion in state {other}"
            ))),
        }
    }

    /// Certifies the transaction in total order and drives it into the
    /// apply and commit monitors.
    ///
    /// Returns `Err(TrxFail)` when certification failed (roll back),
    /// `Err(BfAbort)` when the trx was brute-force aborted (continue
    /// with [`Replicator::replay_trx`]).
    pub fn pre_commit(&self, trx: &SharedTrx) -> Result<(), Error> {
        let (local_seqno, global_seqno) = {
            let inner = trx.lock();
            match inner.state() {
                TrxState::Certifying | TrxState::MustAbort => {}
                other => {
                    return Err(Error::node_fail(format!("pre_commit in state {other}")));
                }
            }
            if !inner.global_seqno().is_defined() {
                return Err(Error::node_fail("pre_commit before replication".to_string()));
            }
            (inner.local_seqno(), inner.global_seqno())
        };

        let lo = LocalOrder::new(local_seqno);
        self.local_monitor
            .enter(&lo)
            .map_err(map_monitor_error)?;

        let outcome = {
            let mut cert = self.lock_cert();
            let inner = trx.lock();
            cert.append_trx(inner.write_set(), global_seqno)
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                let _ = self.local_monitor.leave(&lo);
                return Err(Error::node_fail(err.to_string()));
            }
        };
        if let CertOutcome::Pass { depends_seqno } = outcome {
            let mut inner = trx.lock();
            inner.assign_depends_seqno(depends_seqno);
            inner.mark_certified();
        }
        self.local_monitor.leave(&lo).map_err(map_monitor_error)?;

        let mut inner = trx.lock();
        match (outcome, inner.state()) {
            (CertOutcome::Fail, TrxState::Certifying) => {
                self.counters
                    .local_cert_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.cancel_global_slots(global_seqno);
                inner
                    .set_state(TrxState::Aborting)
                    .map_err(|err| Error::node_fail(err.to_string()))?;
                Err(Error::TrxFail)
            }
            (CertOutcome::Fail, TrxState::MustAbort) => {
                self.counters.local_bf_aborts.fetch_add(1, Ordering::Relaxed);
                self.cancel_global_slots(global_seqno);
                inner
                    .set_state(TrxState::Aborting)
                    .map_err(|err| Error::node_fail(err.to_string()))?;
                Err(Error::BfAbort)
            }
            (CertOutcome::Pass { .. }, TrxState::MustAbort) => {
                self.counters.local_bf_aborts.fetch_add(1, Ordering::Relaxed);
                inner
                    .set_state(TrxState::MustReplay)
                    .map_err(|err| Error::node_fail(err.to_string()))?;
                Err(Error::BfAbort)
            }
            (CertOutcome::Pass { .. }, TrxState::Certifying) => {
                inner
                    .set_state(TrxState::Applying)
                    .map_err(|err| Error::node_fail(err.to_string()))?;
                let depends = inner.depends_seqno();
                drop(inner);

                let ao = ApplyOrder::new(global_seqno, depends, true);
                self.apply_monitor.enter(&ao).map_err(map_monitor_error)?;
                if self.commit_active() {
                    let co = CommitOrder::new(global_seqno, true, self.config.commit_order);
                    if let Err(err) = self.commit_monitor.enter(&co) {
                        let _ = self.apply_monitor.leave(&ao);
                        return Err(map_monitor_error(err));
                    }
                }
                trx.lock()
                    .set_state(TrxState::Committing)
                    .map_err(|err| Error::node_fail(err.to_string()))?;
                Ok(())
            }
            (_, other) => Err(Error::node_fail(format!(
                "pre_commit resolution in state {other}"
            ))),
        }
    }

    /// Finishes a committing transaction: releases the commit and apply
    /// slots and schedules a last-committed report.
    pub fn post_commit(&self, trx: &SharedTrx) -> Result<(), Error> {
        let (global_seqno, depends) = {
            let inner = trx.lock();
            if inner.state() != TrxState::Committing {
                return Err(Error::node_fail(format!(
                    "post_commit in state {}",
                    inner.state()
                )));
            }
            (inner.global_seqno(), inner.depends_seqno())
        };

        if self.commit_active() {
            let co = CommitOrder::new(global_seqno, true, self.config.commit_order);
            self.commit_monitor.leave(&co).map_err(map_monitor_error)?;
        }
        let ao = ApplyOrder::new(global_seqno, depends, true);
        self.apply_monitor.leave(&ao).map_err(map_monitor_error)?;

        trx.lock()
            .set_state(TrxState::Committed)
            .map_err(|err| Error::node_fail(err.to_string()))?;
        self.counters.local_commits.fetch_add(1, Ordering::Relaxed);
        self.report_last_committed();
        self.maybe_send_sync();
        Ok(())
    }

    /// Finishes a rolled back transaction and releases whatever ordering
    /// resources it still holds.
    pub fn post_rollback(&self, trx: &SharedTrx) -> Result<(), Error> {
        let mut inner = trx.lock();
        match inner.state() {
            TrxState::Executing => {
                inner
                    .set_state(TrxState::Aborting)
                    .and_then(|_| inner.set_state(TrxState::RolledBack))
                    .map_err(|err| Error::node_fail(err.to_string()))?;
            }
            TrxState::MustAbort if !inner.global_seqno().is_defined() => {
                inner
                    .set_state(TrxState::Aborting)
                    .and_then(|_| inner.set_state(TrxState::RolledBack))
                    .map_err(|err| Error::node_fail(err.to_string()))?;
            }
            TrxState::MustAbort => {
                // Replicated but never certified: the write-set is in the
                // total order, so its slots must resolve and the index
                // must see the same decision every other node made.
                let local_seqno = inner.local_seqno();
                let global_seqno = inner.global_seqno();
                drop(inner);
                tracing::warn!(
                    seqno = %global_seqno,
                    "rolling back an ordered transaction; certifying for index consistency"
                );
                let lo = LocalOrder::new(local_seqno);
                self.local_monitor.enter(&lo).map_err(map_monitor_error)?;
                let outcome = {
                    let mut cert = self.lock_cert();
                    let guard = trx.lock();
                    cert.append_trx(guard.write_set(), global_seqno)
                };
                self.local_monitor.leave(&lo).map_err(map_monitor_error)?;
                if let Err(err) = outcome {
                    return Err(Error::node_fail(err.to_string()));
                }
                self.cancel_global_slots(global_seqno);
                let mut inner = trx.lock();
                inner
                    .set_state(TrxState::Aborting)
                    .and_then(|_| inner.set_state(TrxState::RolledBack))
                    .map_err(|err| Error::node_fail(err.to_string()))?;
            }
            TrxState::MustReplay => {
                // The client refused the replay; release the slots it
                // would have used.
                let global_seqno = inner.global_seqno();
                tracing::warn!(
                    seqno = %global_seqno,
                    "rolling back a certified transaction instead of replaying"
                );
                self.cancel_global_slots(global_seqno);
                inner
                    .set_state(TrxState::Aborting)
                    .and_then(|_| inner.set_state(TrxState::RolledBack))
                    .map_err(|err| Error::node_fail(err.to_string()))?;
            }
            TrxState::Aborting => {
                inner
                    .set_state(TrxState::RolledBack)
                    .map_err(|err| Error::node_fail(err.to_string()))?;
            }
            other => {
                return Err(Error::node_fail(format!("post_rollback in state {other}")));
            }
        }
        self.counters.local_rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Re-runs a brute-force aborted, certification-passed transaction
    /// through the apply and commit monitors without re-certifying.
    /// Returns `Err(TrxFail)` if the trx had failed certification, in
    /// which case the client rolls back instead.
    pub fn replay_trx(&self, trx: &SharedTrx) -> Result<(), Error> {
        let (global_seqno, depends, ws_bytes) = {
            let mut inner = trx.lock();
            match inner.state() {
                TrxState::MustReplay => {}
                TrxState::Aborting => return Err(Error::TrxFail),
                other => {
                    return Err(Error::node_fail(format!("replay in state {other}")));
                }
            }
            inner
                .set_state(TrxState::Replaying)
                .map_err(|err| Error::node_fail(err.to_string()))?;
            let bytes = inner
                .ws_bytes()
                .cloned()
                .ok_or_else(|| Error::node_fail("replay without write-set".to_string()))?;
            (inner.global_seqno(), inner.depends_seqno(), bytes)
        };
        self.counters.local_replays.fetch_add(1, Ordering::Relaxed);
        tracing::info!(seqno = %global_seqno, "replaying transaction");

        let ao = ApplyOrder::new(global_seqno, depends, true);
        self.apply_monitor.enter(&ao).map_err(map_monitor_error)?;
        if let Err(err) = self.hooks.apply(&ws_bytes, global_seqno) {
            let _ = self.apply_monitor.leave(&ao);
            if self.commit_active() {
                let _ = self.commit_monitor.self_cancel(global_seqno);
            }
            let _ = trx.lock().set_state(TrxState::Aborting);
            tracing::warn!(seqno = %global_seqno, "replay apply failed: {err}");
            return Err(Error::TrxFail);
        }
        if self.commit_active() {
            let co = CommitOrder::new(global_seqno, true, self.config.commit_order);
            self.commit_monitor.enter(&co).map_err(map_monitor_error)?;
        }
        trx.lock()
            .set_state(TrxState::Committing)
            .map_err(|err| Error::node_fail(err.to_string()))?;
        Ok(())
    }

    /// Brute-force abort: signals a local transaction that has not yet
    /// entered the apply monitor. Returns whether the signal took effect;
    /// past the apply monitor the transaction will commit and cannot be
    /// aborted.
    pub fn abort_trx(&self, trx: &SharedTrx) -> bool {
        if !trx.is_local() {
            return false;
        }
        let mut inner = trx.lock();
        match inner.state() {
            TrxState::Executing | TrxState::Certifying => {
                let _ = inner.set_state(TrxState::MustAbort);
                tracing::debug!(
                    trx_id = %trx.trx_id(),
                    seqno = %inner.global_seqno(),
                    "brute-force abort signalled"
                );
                true
            }
            TrxState::MustAbort => true,
            _ => false,
        }
    }

    /// [`Replicator::abort_trx`] by transaction id, for hosts that track
    /// victims by identifier.
    pub fn abort_local_trx(&self, trx_id: TrxId) -> Result<bool, Error> {
        let trx = self
            .local_trx(trx_id, false)
            .ok_or(Error::TrxMissing { trx_id })?;
        Ok(self.abort_trx(&trx))
    }

    // ----- causal reads, isolation, pause ---------------------------------

    /// Waits until everything the group had ordered at call time has been
    /// applied locally; returns that seqno.
    pub fn causal_read(&self) -> Result<Seqno, Error> {
        let seqno = self
            .gcs
            .caused()
            .map_err(|err| Error::conn_fail(err.to_string()))?;
        self.apply_monitor.drain(seqno);
        Ok(seqno)
    }

    /// Begins a total-order isolated operation: the connection write-set
    /// is replicated and the calling thread blocks until every earlier
    /// transaction has applied and committed.
    pub fn to_isolation_begin(&self, trx: &SharedTrx) -> Result<(), Error> {
        self.replicate(trx)?;

        let (local_seqno, global_seqno) = {
            let inner = trx.lock();
            (inner.local_seqno(), inner.global_seqno())
        };
        let lo = LocalOrder::new(local_seqno);
        self.local_monitor.enter(&lo).map_err(map_monitor_error)?;
        let outcome = {
            let mut cert = self.lock_cert();
            let inner = trx.lock();
            cert.append_trx(inner.write_set(), global_seqno)
        };
        self.local_monitor.leave(&lo).map_err(map_monitor_error)?;
        match outcome {
            Ok(CertOutcome::Pass { .. }) => {}
            Ok(CertOutcome::Fail) => {
                self.cancel_global_slots(global_seqno);
                let mut inner = trx.lock();
                let _ = inner.set_state(TrxState::Aborting);
                return Err(Error::TrxFail);
            }
            Err(err) => return Err(Error::node_fail(err.to_string())),
        }
        {
            let mut inner = trx.lock();
            inner.assign_depends_seqno(global_seqno.prev());
            inner.mark_certified();
            inner
                .set_state(TrxState::Applying)
                .map_err(|err| Error::node_fail(err.to_string()))?;
        }

        // Total order: wait for the whole prefix, local or not.
        let ao = ApplyOrder::new(global_seqno, global_seqno.prev(), false);
        self.apply_monitor.enter(&ao).map_err(map_monitor_error)?;
        if self.commit_active() {
            let co = CommitOrder::new(global_seqno, false, self.config.commit_order);
            self.commit_monitor.enter(&co).map_err(map_monitor_error)?;
        }
        trx.lock()
            .set_state(TrxState::Committing)
            .map_err(|err| Error::node_fail(err.to_string()))?;
        Ok(())
    }

    /// Ends a total-order isolated operation.
    pub fn to_isolation_end(&self, trx: &SharedTrx) -> Result<(), Error> {
        self.post_commit(trx)
    }

    /// Drains the monitors to a quiescent point and keeps new local work
    /// out until [`Replicator::resume`]. Returns the drained-to seqno.
    pub fn pause(&self) -> Result<Seqno, Error> {
        {
            let mut node = self.lock_node();
            if node.paused {
                return Err(Error::Warning {
                    reason: "already paused".to_string(),
                });
            }
            node.paused = true;
        }
        let seqno = self
            .gcs
            .caused()
            .map_err(|err| Error::conn_fail(err.to_string()))?;
        self.apply_monitor.drain(seqno);
        if self.commit_active() {
            self.commit_monitor.drain(seqno);
        }
        tracing::info!(seqno = %seqno, "replication paused");
        Ok(seqno)
    }

    pub fn resume(&self) {
        self.lock_node().paused = false;
        tracing::info!("replication resumed");
    }

    // ----- state transfer handoff -----------------------------------------

    /// Host callback on the donor: the transfer finished (successfully or
    /// not) at `seqno`.
    pub fn sst_sent(&self, uuid: Uuid, seqno: Seqno) -> Result<(), Error> {
        {
            let mut node = self.lock_node();
            if uuid != node.state_uuid {
                tracing::warn!(got = %uuid, expected = %node.state_uuid, "sst_sent uuid mismatch");
            }
            node.fsm
                .shift_to(NodeState::Joined)
                .map_err(|err| Error::node_fail(err.to_string()))?;
        }
        self.gcs
            .send_join(seqno)
            .map_err(|err| Error::conn_fail(err.to_string()))?;
        Ok(())
    }

    /// Host callback on the joiner: the received state is installed up to
    /// `seqno`.
    pub fn sst_received(&self, uuid: Uuid, seqno: Seqno) -> Result<(), Error> {
        let mut sst = self.sst.lock().expect("sst lock poisoned");
        sst.received = Some(SavedState { uuid, seqno });
        self.sst_cond.notify_all();
        Ok(())
    }

    // ----- ordered action processing --------------------------------------

    /// Pumps the group channel until it closes. Run this from one or
    /// more receiver threads; concurrency across threads is ordered by
    /// the monitors.
    pub fn run_receiver(&self) -> Result<(), Error> {
        loop {
            match self.gcs.recv() {
                Ok(action) => self.process_action(action)?,
                Err(GcsError::Closed) => return Ok(()),
                Err(err) => return Err(Error::conn_fail(err.to_string())),
            }
        }
    }

    pub fn process_action(&self, action: Action) -> Result<(), Error> {
        match action {
            Action::Trx {
                ws,
                global_seqno,
                local_seqno,
            } => self.process_trx(ws, global_seqno, local_seqno),
            Action::CommitCut {
                horizon,
                local_seqno,
            } => self.process_commit_cut(horizon, local_seqno),
            Action::ViewChange { view, local_seqno } => {
                self.process_conf_change(view, local_seqno)
            }
            Action::StateRequest {
                source,
                donor,
                request,
                donor_seqno,
                local_seqno,
            } => self.process_state_req(source, donor, request, donor_seqno, local_seqno),
            Action::Join {
                source,
                seqno,
                local_seqno,
            } => self.process_join(source, seqno, local_seqno),
            Action::Sync {
                source,
                local_seqno,
            } => self.process_sync(source, local_seqno),
        }
    }

    fn process_trx(
        &self,
        ws_bytes: Bytes,
        global_seqno: Seqno,
        local_seqno: Seqno,
    ) -> Result<(), Error> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .received_bytes
            .fetch_add(ws_bytes.len() as u64, Ordering::Relaxed);

        let lo = LocalOrder::new(local_seqno);
        match self.local_monitor.enter(&lo) {
            Ok(()) => {}
            Err(MonitorError::Interrupted { .. }) => return Ok(()),
            Err(err) => return Err(Error::node_fail(err.to_string())),
        }

        // Certification only needs the header and keys; the apply
        // callback gets the raw bytes. A corrupt write-set in the
        // ordered stream is unrecoverable: every node must make the same
        // decision about this seqno.
        let write_set = match WriteSet::decode(&ws_bytes, true) {
            Ok(ws) => ws,
            Err(err) => {
                let _ = self.local_monitor.leave(&lo);
                self.fatal(&format!("write-set {global_seqno} corrupt: {err}"));
                return Err(Error::node_fail(err.to_string()));
            }
        };

        let outcome = {
            let mut cert = self.lock_cert();
            if global_seqno <= cert.position() {
                // Covered by the state snapshot this node booted from.
                drop(cert);
                self.local_monitor.leave(&lo).map_err(map_monitor_error)?;
                return Ok(());
            }
            cert.append_trx(&write_set, global_seqno)
        };
        self.local_monitor.leave(&lo).map_err(map_monitor_error)?;

        let outcome = outcome.map_err(|err| Error::node_fail(err.to_string()))?;
        let trx = TrxHandle::new_remote(write_set, ws_bytes.clone(), global_seqno, local_seqno);

        match outcome {
            CertOutcome::Fail => {
                // Normal skip: the originator's client sees the failure;
                // everyone releases the slots.
                self.cancel_global_slots(global_seqno);
                let mut inner = trx.lock();
                let _ = inner.set_state(TrxState::Aborting);
                let _ = inner.set_state(TrxState::RolledBack);
                Ok(())
            }
            CertOutcome::Pass { depends_seqno } => {
                // Total-order isolated operations wait for the full prefix.
                let depends = if trx.lock().write_set().ws_type() == WsType::Conn {
                    global_seqno.prev()
                } else {
                    depends_seqno
                };
                {
                    let mut inner = trx.lock();
                    inner.assign_depends_seqno(depends);
                    inner.mark_certified();
                }

                if global_seqno <= self.apply_monitor.last_left() {
                    // Below the apply base: the snapshot already contains
                    // this transaction's effects.
                    return Ok(());
                }

                let ao = ApplyOrder::new(global_seqno, depends, false);
                match self.apply_monitor.enter(&ao) {
                    Ok(()) => {}
                    Err(MonitorError::Interrupted { .. }) => return Ok(()),
                    Err(err) => return Err(Error::node_fail(err.to_string())),
                }
                {
                    let mut inner = trx.lock();
                    let _ = inner.set_state(TrxState::Applying);
                }

                if let Err(err) = self.hooks.apply(&ws_bytes, global_seqno) {
                    // There is no way to roll back a totally ordered
                    // remote transaction.
                    let _ = self.apply_monitor.leave(&ao);
                    self.fatal(&format!("apply of {global_seqno} failed: {err}"));
                    return Err(Error::node_fail(err.reason));
                }

                {
                    let mut inner = trx.lock();
                    let _ = inner.set_state(TrxState::Committing);
                }
                if self.commit_active() {
                    let co = CommitOrder::new(global_seqno, false, self.config.commit_order);
                    self.commit_monitor.enter(&co).map_err(map_monitor_error)?;
                    if let Err(err) = self.hooks.commit(global_seqno) {
                        let _ = self.commit_monitor.leave(&co);
                        let _ = self.apply_monitor.leave(&ao);
                        self.fatal(&format!("commit of {global_seqno} failed: {err}"));
                        return Err(Error::node_fail(err.reason));
                    }
                    self.commit_monitor.leave(&co).map_err(map_monitor_error)?;
                } else if let Err(err) = self.hooks.commit(global_seqno) {
                    let _ = self.apply_monitor.leave(&ao);
                    self.fatal(&format!("commit of {global_seqno} failed: {err}"));
                    return Err(Error::node_fail(err.reason));
                }
                self.apply_monitor.leave(&ao).map_err(map_monitor_error)?;
                {
                    let mut inner = trx.lock();
                    let _ = inner.set_state(TrxState::Committed);
                }

                self.report_last_committed();
                self.maybe_send_sync();
                Ok(())
            }
        }
    }

    fn process_commit_cut(&self, horizon: Seqno, local_seqno: Seqno) -> Result<(), Error> {
        let lo = LocalOrder::new(local_seqno);
        match self.local_monitor.enter(&lo) {
            Ok(()) => {}
            Err(MonitorError::Interrupted { .. }) => return Ok(()),
            Err(err) => return Err(Error::node_fail(err.to_string())),
        }
        self.lock_cert().purge_trxs_upto(horizon);
        self.local_monitor.leave(&lo).map_err(map_monitor_error)?;
        tracing::debug!(horizon = %horizon, "commit cut applied");
        Ok(())
    }

    fn process_conf_change(&self, view: ViewInfo, local_seqno: Seqno) -> Result<(), Error> {
        let lo = LocalOrder::new(local_seqno);
        match self.local_monitor.enter(&lo) {
            Ok(()) => {}
            Err(MonitorError::Interrupted { .. }) => return Ok(()),
            Err(err) => return Err(Error::node_fail(err.to_string())),
        }
        let result = self.handle_view(&view);
        self.local_monitor.leave(&lo).map_err(map_monitor_error)?;
        result
    }

    fn handle_view(&self, view: &ViewInfo) -> Result<(), Error> {
        if self.state() == NodeState::Closed {
            // Draining the stream after close; nothing to transition.
            return Ok(());
        }
        tracing::info!(
            view = %view.id,
            members = view.member_count(),
            status = ?view.status,
            group_seqno = %view.group_seqno,
            "configuration change"
        );

        match view.status {
            ViewStatus::Primary => {}
            ViewStatus::NonPrimary => {
                let mut node = self.lock_node();
                if node.fsm.state() != NodeState::Closed {
                    node.fsm
                        .shift_to(NodeState::Connected)
                        .map_err(|err| Error::node_fail(err.to_string()))?;
                }
                drop(node);
                self.hooks.view_changed(view);
                return Ok(());
            }
            ViewStatus::Disconnected => {
                let mut node = self.lock_node();
                let _ = node.fsm.shift_to(NodeState::Closed);
                drop(node);
                self.hooks.view_changed(view);
                return Ok(());
            }
        }

        if view.own_index.is_none() {
            // Expelled from the group.
            let _ = self.lock_node().fsm.shift_to(NodeState::Closed);
            self.hooks.view_changed(view);
            return Err(Error::conn_fail("expelled from group".to_string()));
        }

        let state = self.state();
        match state {
            NodeState::Joined | NodeState::Synced | NodeState::Donor => {
                // Quiesce at the view boundary: everything ordered before
                // the view finishes first (monitors drained), then the
                // certification index is rebased at the common position.
                self.apply_monitor.drain(view.group_seqno);
                if self.commit_active() {
                    self.commit_monitor.drain(view.group_seqno);
                }
                self.lock_cert().assign_initial_position(view.group_seqno);
                self.hooks.view_changed(view);
                Ok(())
            }
            NodeState::Connected => {
                self.lock_cert().assign_initial_position(view.group_seqno);
                if view.member_count() == 1 {
                    self.bootstrap(view)?;
                } else {
                    let st_required = {
                        let node = self.lock_node();
                        node.state_uuid != view.id.uuid
                            || self.last_committed() < view.group_seqno
                    };
                    if st_required {
                        self.join_via_state_transfer(view)?;
                    } else {
                        self.join_in_place(view)?;
                    }
                }
                self.hooks.view_changed(view);
                Ok(())
            }
            other => Err(Error::node_fail(format!(
                "view change in state {other}"
            ))),
        }
    }

    /// First (only) member of a fresh group: adopt the group identity and
    /// position without any transfer.
    fn bootstrap(&self, view: &ViewInfo) -> Result<(), Error> {
        self.rebase_global_monitors(view.group_seqno)?;
        let mut node = self.lock_node();
        node.state_uuid = view.id.uuid;
        node.fsm
            .shift_to(NodeState::Joined)
            .map_err(|err| Error::node_fail(err.to_string()))?;
        drop(node);
        self.gcs
            .send_join(view.group_seqno)
            .map_err(|err| Error::conn_fail(err.to_string()))?;
        Ok(())
    }

    /// Restarted member whose position already matches the group.
    fn join_in_place(&self, view: &ViewInfo) -> Result<(), Error> {
        self.rebase_global_monitors(view.group_seqno)?;
        self.lock_node()
            .fsm
            .shift_to(NodeState::Joined)
            .map_err(|err| Error::node_fail(err.to_string()))?;
        self.gcs
            .send_join(view.group_seqno)
            .map_err(|err| Error::conn_fail(err.to_string()))?;
        Ok(())
    }

    /// Joiner path: request a state transfer and block (holding the local
    /// monitor slot, which keeps the action stream quiescent) until the
    /// host installs the received state.
    fn join_via_state_transfer(&self, view: &ViewInfo) -> Result<(), Error> {
        self.lock_node()
            .fsm
            .shift_to(NodeState::Joining)
            .map_err(|err| Error::node_fail(err.to_string()))?;

        let request = StateRequest::new(
            self.last_committed(),
            self.config.sst_donor.clone(),
            self.hooks.sst_request(),
        );
        let request_bytes = request
            .encode()
            .map_err(|err| Error::node_fail(err.to_string()))?;

        loop {
            match self
                .gcs
                .request_state_transfer(request_bytes.clone(), &self.config.sst_donor)
            {
                Ok(()) => break,
                Err(GcsError::NoDonor) => {
                    tracing::warn!(
                        retry_sec = self.config.sst_retry_sec,
                        "no donor available, retrying state transfer request"
                    );
                    std::thread::sleep(Duration::from_secs(self.config.sst_retry_sec));
                }
                Err(err) => return Err(Error::conn_fail(err.to_string())),
            }
        }

        let received = {
            let mut sst = self.sst.lock().expect("sst lock poisoned");
            while sst.received.is_none() {
                sst = self.sst_cond.wait(sst).expect("sst lock poisoned");
            }
            sst.received.take().expect("sst state vanished")
        };
        tracing::info!(uuid = %received.uuid, seqno = %received.seqno, "state transfer complete");

        self.rebase_global_monitors(received.seqno)?;
        {
            let mut node = self.lock_node();
            node.state_uuid = received.uuid;
            node.fsm
                .shift_to(NodeState::Joined)
                .map_err(|err| Error::node_fail(err.to_string()))?;
        }
        self.gcs
            .send_join(received.seqno)
            .map_err(|err| Error::conn_fail(err.to_string()))?;
        Ok(())
    }

    fn process_state_req(
        &self,
        source: NodeId,
        donor: NodeId,
        request: Bytes,
        donor_seqno: Seqno,
        local_seqno: Seqno,
    ) -> Result<(), Error> {
        let lo = LocalOrder::new(local_seqno);
        match self.local_monitor.enter(&lo) {
            Ok(()) => {}
            Err(MonitorError::Interrupted { .. }) => return Ok(()),
            Err(err) => return Err(Error::node_fail(err.to_string())),
        }
        self.local_monitor.leave(&lo).map_err(map_monitor_error)?;

        if donor != self.node_id() || source == self.node_id() {
            return Ok(());
        }
        if self.state() == NodeState::Closed {
            return Ok(());
        }

        let request = match StateRequest::decode(&request) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!("ignoring corrupt state request: {err}");
                return Ok(());
            }
        };
        tracing::info!(
            joiner = %source,
            last_applied = %request.last_applied,
            donor_seqno = %donor_seqno,
            "serving state transfer"
        );

        let state_uuid = self.lock_node().state_uuid;
        self.lock_node()
            .fsm
            .shift_to(NodeState::Donor)
            .map_err(|err| Error::node_fail(err.to_string()))?;

        if let Err(err) = self.hooks.donate(&request, state_uuid, donor_seqno) {
            tracing::warn!("donation failed: {err}");
            let mut node = self.lock_node();
            node.fsm
                .shift_to(NodeState::Joined)
                .map_err(|err| Error::node_fail(err.to_string()))?;
            node.pending_sync_target = Some(self.last_committed());
            drop(node);
            self.maybe_send_sync();
        }
        Ok(())
    }

    fn process_join(&self, source: NodeId, seqno: Seqno, local_seqno: Seqno) -> Result<(), Error> {
        let lo = LocalOrder::new(local_seqno);
        match self.local_monitor.enter(&lo) {
            Ok(()) => {}
            Err(MonitorError::Interrupted { .. }) => return Ok(()),
            Err(err) => return Err(Error::node_fail(err.to_string())),
        }
        self.local_monitor.leave(&lo).map_err(map_monitor_error)?;

        if source != self.node_id() || self.state() == NodeState::Closed {
            return Ok(());
        }
        {
            let mut node = self.lock_node();
            node.fsm
                .shift_to(NodeState::Joined)
                .map_err(|err| Error::node_fail(err.to_string()))?;
            node.pending_sync_target = Some(seqno);
        }
        self.maybe_send_sync();
        Ok(())
    }

    fn process_sync(&self, source: NodeId, local_seqno: Seqno) -> Result<(), Error> {
        let lo = LocalOrder::new(local_seqno);
        match self.local_monitor.enter(&lo) {
            Ok(()) => {}
            Err(MonitorError::Interrupted { .. }) => return Ok(()),
            Err(err) => return Err(Error::node_fail(err.to_string())),
        }
        self.local_monitor.leave(&lo).map_err(map_monitor_error)?;

        if source != self.node_id() || self.state() == NodeState::Closed {
            return Ok(());
        }
        self.lock_node()
            .fsm
            .shift_to(NodeState::Synced)
            .map_err(|err| Error::node_fail(err.to_string()))?;
        self.hooks.synced();
        tracing::info!("node synced with group");
        Ok(())
    }

    // ----- internals ------------------------------------------------------

    fn check_accepts(&self, trx: &SharedTrx) -> Result<(), Error> {
        let node = self.lock_node();
        if node.paused {
            return Err(Error::conn_fail("replication paused"));
        }
        let state = node.fsm.state();
        drop(node);
        if state == NodeState::Synced {
            return Ok(());
        }
        let is_isolation = {
            let inner = trx.lock();
            inner.write_set().ws_type() == WsType::Conn
        };
        if is_isolation && self.config.isolation_while_unsynced && state.accepts_requests() {
            return Ok(());
        }
        Err(Error::conn_fail(format!(
            "node in state {state} does not accept this request"
        )))
    }

    fn commit_active(&self) -> bool {
        self.config.commit_order != CommitMode::Bypass
    }

    /// Releases the apply (and commit) slots of a seqno that will never
    /// be applied on this node.
    fn cancel_global_slots(&self, global_seqno: Seqno) {
        if global_seqno <= self.apply_monitor.last_left() {
            return;
        }
        let _ = self.apply_monitor.self_cancel(global_seqno);
        if self.commit_active() {
            let _ = self.commit_monitor.self_cancel(global_seqno);
        }
    }

    fn rebase_global_monitors(&self, position: Seqno) -> Result<(), Error> {
        self.apply_monitor
            .set_position(position)
            .map_err(|err| Error::node_fail(err.to_string()))?;
        self.commit_monitor
            .set_position(position)
            .map_err(|err| Error::node_fail(err.to_string()))?;
        Ok(())
    }

    fn report_last_committed(&self) {
        let count = self.report_counter.fetch_add(1, Ordering::Relaxed);
        if count % self.config.report_interval.max(1) == 0 {
            self.service
                .report_last_committed(self.apply_monitor.last_left());
        }
    }

    fn maybe_send_sync(&self) {
        let target = {
            let mut node = self.lock_node();
            match node.pending_sync_target {
                Some(target) if self.apply_monitor.last_left() >= target => {
                    node.pending_sync_target = None;
                    Some(target)
                }
                _ => None,
            }
        };
        if target.is_some() {
            if let Err(err) = self.gcs.send_sync() {
                tracing::warn!("sync announcement failed: {err}");
            }
        }
    }

    /// Fatal error path: the node stops replicating, flushes pending
    /// reports and invalidates the on-disk position (the local state can
    /// no longer be trusted).
    fn fatal(&self, reason: &str) {
        tracing::error!("fatal replication failure: {reason}");
        let _ = self.lock_node().fsm.shift_to(NodeState::Closed);
        let _ = self.gcs.close();
        self.service.flush();
        if let Err(err) = state_file::invalidate(&self.config.state_file_path()) {
            tracing::warn!("state file invalidation failed: {err}");
        }
    }

    fn lock_node(&self) -> std::sync::MutexGuard<'_, NodeShared> {
        self.node.lock().expect("node lock poisoned")
    }

    fn lock_cert(&self) -> std::sync::MutexGuard<'_, Certification> {
        self.cert.lock().expect("cert lock poisoned")
    }
}

fn map_monitor_error(err: MonitorError) -> Error {
    match err {
        MonitorError::Interrupted { .. } => Error::BfAbort,
        other => Error::node_fail(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repl::gcs::MemGroup;
    use crate::repl::hooks::{ApplyError, DonateError};
    use crate::ws::KEY_ACTION_UPDATE;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct NullHooks {
        synced: AtomicBool,
    }

    impl ReplicationHooks for NullHooks {
        fn view_changed(&self, _view: &ViewInfo) {}

        fn apply(&self, _ws: &[u8], _global_seqno: Seqno) -> Result<(), ApplyError> {
            Ok(())
        }

        fn commit(&self, _global_seqno: Seqno) -> Result<(), ApplyError> {
            Ok(())
        }

        fn donate(
            &self,
            _request: &StateRequest,
            _state_uuid: Uuid,
            _seqno: Seqno,
        ) -> Result<(), DonateError> {
            Ok(())
        }

        fn synced(&self) {
            self.synced.store(true, Ordering::SeqCst);
        }
    }

    struct Node {
        replicator: Arc<Replicator>,
        hooks: Arc<NullHooks>,
        receiver: Option<thread::JoinHandle<Result<(), Error>>>,
        _dir: tempfile::TempDir,
    }

    fn start_single_node() -> Node {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ReplConfig {
            data_dir: dir.path().to_path_buf(),
            report_interval: 1,
            ..ReplConfig::default()
        };
        let group = MemGroup::new();
        let channel = group.join(NodeId::random());
        let hooks = Arc::new(NullHooks::default());
        let dyn_hooks: Arc<dyn ReplicationHooks> = hooks.clone();
        let replicator = Arc::new(
            Replicator::new(config, Arc::new(channel), dyn_hooks).expect("replicator"),
        );
        replicator.connect().expect("connect");
        let receiver = {
            let replicator = Arc::clone(&replicator);
            thread::spawn(move || replicator.run_receiver())
        };
        let node = Node {
            replicator,
            hooks,
            receiver: Some(receiver),
            _dir: dir,
        };
        wait_until(|| node.replicator.state() == NodeState::Synced);
        node
    }

    fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    impl Node {
        fn shutdown(mut self) {
            self.replicator.close().expect("close");
            if let Some(join) = self.receiver.take() {
                join.join().expect("receiver join").expect("receiver result");
            }
        }
    }

    #[test]
    fn bootstrap_reaches_synced_and_notifies_host() {
        let node = start_single_node();
        assert!(node.hooks.synced.load(Ordering::SeqCst));
        assert_eq!(node.replicator.last_committed(), Seqno::new(0));
        node.shutdown();
    }

    #[test]
    fn local_trx_commits_through_the_pipeline() {
        let node = start_single_node();
        let repl = &node.replicator;

        let trx = repl.local_trx(TrxId::new(1), true).expect("trx");
        {
            let mut inner = trx.lock();
            inner.write_set_mut().append_row_key("t", "k", KEY_ACTION_UPDATE);
            inner.write_set_mut().append_data(b"row");
        }
        repl.replicate(&trx).expect("replicate");
        repl.pre_commit(&trx).expect("pre_commit");
        repl.post_commit(&trx).expect("post_commit");

        assert_eq!(trx.lock().state(), TrxState::Committed);
        assert_eq!(repl.last_committed(), Seqno::new(1));
        let stats = repl.stats();
        assert_eq!(stats.replicated, 1);
        assert_eq!(stats.local_commits, 1);
        repl.discard_local_trx(TrxId::new(1));
        node.shutdown();
    }

    #[test]
    fn voluntary_rollback_before_replication() {
        let node = start_single_node();
        let repl = &node.replicator;

        let trx = repl.local_trx(TrxId::new(2), true).expect("trx");
        repl.post_rollback(&trx).expect("post_rollback");
        assert_eq!(trx.lock().state(), TrxState::RolledBack);
        assert_eq!(repl.stats().local_rollbacks, 1);
        node.shutdown();
    }

    #[test]
    fn abort_by_unknown_id_reports_trx_missing() {
        let node = start_single_node();
        let err = node
            .replicator
            .abort_local_trx(TrxId::new(404))
            .unwrap_err();
        assert_eq!(
            err,
            Error::TrxMissing {
                trx_id: TrxId::new(404)
            }
        );

        let trx = node.replicator.local_trx(TrxId::new(5), true).expect("trx");
        assert!(node.replicator.abort_local_trx(TrxId::new(5)).expect("abort"));
        assert_eq!(trx.lock().state(), TrxState::MustAbort);
        node.replicator.post_rollback(&trx).expect("post_rollback");
        node.shutdown();
    }

    #[test]
    fn registry_returns_same_handle_until_discard() {
        let node = start_single_node();
        let repl = &node.replicator;

        let first = repl.local_trx(TrxId::new(3), true).expect("trx");
        let again = repl.local_trx(TrxId::new(3), false).expect("trx");
        assert!(Arc::ptr_eq(&first, &again));

        repl.discard_local_trx(TrxId::new(3));
        assert!(repl.local_trx(TrxId::new(3), false).is_none());
        node.shutdown();
    }

    #[test]
    fn replicate_is_rejected_while_paused() {
        let node = start_single_node();
        let repl = &node.replicator;

        let paused_at = repl.pause().expect("pause");
        assert_eq!(paused_at, repl.last_committed());

        let trx = repl.local_trx(TrxId::new(4), true).expect("trx");
        assert!(matches!(
            repl.replicate(&trx).unwrap_err(),
            Error::ConnFail { .. }
        ));

        repl.resume();
        repl.replicate(&trx).expect("replicate");
        repl.pre_commit(&trx).expect("pre_commit");
        repl.post_commit(&trx).expect("post_commit");
        node.shutdown();
    }

    #[test]
    fn causal_read_waits_for_applied_prefix() {
        let node = start_single_node();
        let repl = &node.replicator;

        let trx = repl.local_trx(TrxId::new(5), true).expect("trx");
        trx.lock().write_set_mut().append_data(b"row");
        repl.replicate(&trx).expect("replicate");
        repl.pre_commit(&trx).expect("pre_commit");
        repl.post_commit(&trx).expect("post_commit");

        let seqno = repl.causal_read().expect("causal_read");
        assert_eq!(seqno, Seqno::new(1));
        node.shutdown();
    }

    #[test]
    fn close_persists_final_position() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ReplConfig {
            data_dir: dir.path().to_path_buf(),
            report_interval: 1,
            ..ReplConfig::default()
        };
        let state_path = config.state_file_path();

        let group = MemGroup::new();
        let channel = group.join(NodeId::random());
        let hooks: Arc<dyn ReplicationHooks> = Arc::new(NullHooks::default());
        let replicator = Arc::new(Replicator::new(config, Arc::new(channel), hooks).expect("replicator"));
        replicator.connect().expect("connect");
        let receiver = {
            let replicator = Arc::clone(&replicator);
            thread::spawn(move || replicator.run_receiver())
        };
        wait_until(|| replicator.state() == NodeState::Synced);

        let trx = replicator.local_trx(TrxId::new(1), true).expect("trx");
        trx.lock().write_set_mut().append_data(b"row");
        replicator.replicate(&trx).expect("replicate");
        replicator.pre_commit(&trx).expect("pre_commit");
        replicator.post_commit(&trx).expect("post_commit");

        replicator.close().expect("close");
        receiver.join().expect("join").expect("receiver result");

        let saved = state_file::restore(&state_path).expect("restore");
        assert_eq!(saved.seqno, Seqno::new(1));
        assert!(!saved.uuid.is_nil());
    }

    #[test]
    fn to_isolation_runs_in_total_order() {
        let node = start_single_node();
        let repl = &node.replicator;

        let conn_trx = repl.local_conn_trx(ConnId::new(9), true).expect("conn trx");
        {
            let mut inner = conn_trx.lock();
            inner.write_set_mut().append_query("alter table t", 0, 0);
            inner.write_set_mut().append_row_key("t", "ddl", crate::ws::KEY_ACTION_UPDATE);
        }
        repl.to_isolation_begin(&conn_trx).expect("begin");
        repl.to_isolation_end(&conn_trx).expect("end");
        assert_eq!(conn_trx.lock().state(), TrxState::Committed);
        assert_eq!(repl.last_committed(), Seqno::new(1));
        repl.discard_local_conn(ConnId::new(9));
        node.shutdown();
    }
}
