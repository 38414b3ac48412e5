//! Group channel: the totally ordered action stream contract, and an
//! in-process bus implementation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{NodeId, Seqno, ViewId, ViewInfo, ViewStatus};

/// A totally ordered action delivered by the group channel. Every action
/// carries the receiving node's delivery (local) seqno.
#[derive(Clone, Debug)]
pub enum Action {
    /// A replicated write-set.
    Trx {
        ws: Bytes,
        global_seqno: Seqno,
        local_seqno: Seqno,
    },
    /// Group-wide minimum of last-committed seqnos; advances the
    /// certification purge horizon.
    CommitCut { horizon: Seqno, local_seqno: Seqno },
    /// Membership change.
    ViewChange { view: ViewInfo, local_seqno: Seqno },
    /// A joiner asked for a state transfer; `donor` is the member the
    /// group chose to serve it.
    StateRequest {
        source: NodeId,
        donor: NodeId,
        request: Bytes,
        donor_seqno: Seqno,
        local_seqno: Seqno,
    },
    /// A member finished its state transfer at `seqno`.
    Join {
        source: NodeId,
        seqno: Seqno,
        local_seqno: Seqno,
    },
    /// A member drained its apply queue and is in sync.
    Sync { source: NodeId, local_seqno: Seqno },
}

impl Action {
    pub fn local_seqno(&self) -> Seqno {
        match self {
            Action::Trx { local_seqno, .. }
            | Action::CommitCut { local_seqno, .. }
            | Action::ViewChange { local_seqno, .. }
            | Action::StateRequest { local_seqno, .. }
            | Action::Join { local_seqno, .. }
            | Action::Sync { local_seqno, .. } => *local_seqno,
        }
    }
}

/// The seqnos assigned to a replicated write-set: its place in the
/// global order, and its delivery slot on the originating node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalOrder {
    pub global_seqno: Seqno,
    pub local_seqno: Seqno,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GcsError {
    #[error("group channel closed")]
    Closed,
    #[error("node is not a group member")]
    NotMember,
    #[error("no donor available")]
    NoDonor,
}

/// Contract with the group communication system: a totally ordered,
/// gap-free action stream with assigned seqnos.
///
/// `replicate` blocks until the write-set is ordered; the originator
/// does not additionally receive its own write-set through `recv` (the
/// returned [`GlobalOrder`] is its self-delivery).
pub trait GroupChannel: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Group state identity, fixed for the lifetime of the group.
    fn state_uuid(&self) -> Uuid;

    fn replicate(&self, ws: Bytes) -> Result<GlobalOrder, GcsError>;

    /// Blocks for the next ordered action; `Err(Closed)` after `close`.
    fn recv(&self) -> Result<Action, GcsError>;

    /// Highest global seqno the group has ordered so far.
    fn caused(&self) -> Result<Seqno, GcsError>;

    fn report_last_committed(&self, seqno: Seqno) -> Result<(), GcsError>;

    /// Puts a state transfer request into the ordered stream; the group
    /// chooses a donor, honoring `preferred` when possible.
    fn request_state_transfer(&self, request: Bytes, preferred: &str) -> Result<(), GcsError>;

    fn send_join(&self, seqno: Seqno) -> Result<(), GcsError>;

    fn send_sync(&self) -> Result<(), GcsError>;

    fn close(&self) -> Result<(), GcsError>;
}

struct Member {
    tx: Sender<Action>,
    next_local: i64,
    last_committed: Seqno,
    synced: bool,
}

struct GroupInner {
    state_uuid: Uuid,
    next_global: i64,
    view_ordinal: i64,
    commit_cut: Seqno,
    members: BTreeMap<NodeId, Member>,
}

impl GroupInner {
    fn deliver(&mut self, node: NodeId, make: impl Fn(Seqno) -> Action) -> Seqno {
        let member = self.members.get_mut(&node).expect("member vanished");
        member.next_local += 1;
        let local_seqno = Seqno::new(member.next_local);
        let _ = member.tx.send(make(local_seqno));
        local_seqno
    }

    fn broadcast(&mut self, make: impl Fn(Seqno) -> Action) {
        let nodes: Vec<NodeId> = self.members.keys().copied().collect();
        for node in nodes {
            self.deliver(node, &make);
        }
    }

    fn install_view(&mut self) {
        self.view_ordinal += 1;
        let id = ViewId::new(self.state_uuid, Seqno::new(self.view_ordinal));
        let members: Vec<NodeId> = self.members.keys().copied().collect();
        let group_seqno = Seqno::new(self.next_global);
        for (index, node) in members.iter().copied().enumerate() {
            let view = ViewInfo {
                id,
                status: ViewStatus::Primary,
                own_index: Some(index),
                members: members.clone(),
                group_seqno,
            };
            self.deliver(node, |local_seqno| Action::ViewChange {
                view: view.clone(),
                local_seqno,
            });
        }
    }

    fn advance_commit_cut(&mut self) {
        let Some(min) = self.members.values().map(|m| m.last_committed).min() else {
            return;
        };
        if min > self.commit_cut {
            self.commit_cut = min;
            self.broadcast(|local_seqno| Action::CommitCut {
                horizon: min,
                local_seqno,
            });
        }
    }
}

/// An in-process group bus: one mutex-serialized sequencer fanning out
/// to per-member queues, which makes delivery order identical on every
/// member. Serves the tests and single-node (bootstrap) deployments.
#[derive(Clone)]
pub struct MemGroup {
    inner: Arc<Mutex<GroupInner>>,
}

impl MemGroup {
    pub fn new() -> Self {
        Self::with_state(Uuid::new_v4(), Seqno::new(0))
    }

    /// Bootstraps a group from recovered state, as a real group forms
    /// from its most advanced member: seqnos continue from `seqno`.
    pub fn with_state(state_uuid: Uuid, seqno: Seqno) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GroupInner {
                state_uuid,
                next_global: seqno.get().max(0),
                view_ordinal: 0,
                commit_cut: Seqno::UNDEFINED,
                members: BTreeMap::new(),
            })),
        }
    }

    /// Adds a member and installs a new view on every member.
    pub fn join(&self, node_id: NodeId) -> MemChannel {
        let (tx, rx) = unbounded();
        let mut inner = self.lock();
        inner.members.insert(
            node_id,
            Member {
                tx,
                next_local: 0,
                last_committed: Seqno::UNDEFINED,
                synced: false,
            },
        );
        inner.install_view();
        MemChannel {
            group: self.clone(),
            node_id,
            rx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GroupInner> {
        self.inner.lock().expect("group lock poisoned")
    }
}

impl Default for MemGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// One member's endpoint on a [`MemGroup`].
pub struct MemChannel {
    group: MemGroup,
    node_id: NodeId,
    rx: Receiver<Action>,
}

impl MemChannel {
    /// Non-blocking receive, for callers polling the stream.
    pub fn try_recv(&self) -> Option<Action> {
        self.rx.try_recv().ok()
    }
}

impl GroupChannel for MemChannel {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn state_uuid(&self) -> Uuid {
        self.group.lock().state_uuid
    }

    fn replicate(&self, ws: Bytes) -> Result<GlobalOrder, GcsError> {
        let mut inner = self.group.lock();
        if !inner.members.contains_key(&self.node_id) {
            return Err(GcsError::NotMember);
        }
        inner.next_global += 1;
        let global_seqno = Seqno::new(inner.next_global);

        let others: Vec<NodeId> = inner
            .members
            .keys()
            .copied()
            .filter(|node| *node != self.node_id)
            .collect();
        for node in others {
            let ws = ws.clone();
            inner.deliver(node, move |local_seqno| Action::Trx {
                ws: ws.clone(),
                global_seqno,
                local_seqno,
            });
        }

        // Self-delivery: the originator consumes its slot through the
        // returned order instead of the action stream.
        let member = inner
            .members
            .get_mut(&self.node_id)
            .expect("member vanished");
        member.next_local += 1;
        let local_seqno = Seqno::new(member.next_local);
        Ok(GlobalOrder {
            global_seqno,
            local_seqno,
        })
    }

    fn recv(&self) -> Result<Action, GcsError> {
        self.rx.recv().map_err(|_| GcsError::Closed)
    }

    fn caused(&self) -> Result<Seqno, GcsError> {
        let inner = self.group.lock();
        if !inner.members.contains_key(&self.node_id) {
            return Err(GcsError::NotMember);
        }
        Ok(Seqno::new(inner.next_global))
    }

    fn report_last_committed(&self, seqno: Seqno) -> Result<(), GcsError> {
        let mut inner = self.group.lock();
        let Some(member) = inner.members.get_mut(&self.node_id) else {
            return Err(GcsError::NotMember);
        };
        if seqno > member.last_committed {
            member.last_committed = seqno;
        }
        inner.advance_commit_cut();
        Ok(())
    }

    fn request_state_transfer(&self, request: Bytes, preferred: &str) -> Result<(), GcsError> {
        let mut inner = self.group.lock();
        if !inner.members.contains_key(&self.node_id) {
            return Err(GcsError::NotMember);
        }
        let donor = inner
            .members
            .iter()
            .filter(|(node, member)| **node != self.node_id && member.synced)
            .map(|(node, _)| *node)
            .find(|node| node.to_string() == preferred)
            .or_else(|| {
                inner
                    .members
                    .iter()
                    .filter(|(node, member)| **node != self.node_id && member.synced)
                    .map(|(node, _)| *node)
                    .next()
            })
            .ok_or(GcsError::NoDonor)?;

        // Busy donating; eligible again once it re-announces sync.
        if let Some(member) = inner.members.get_mut(&donor) {
            member.synced = false;
        }

        let source = self.node_id;
        let donor_seqno = Seqno::new(inner.next_global);
        inner.broadcast(move |local_seqno| Action::StateRequest {
            source,
            donor,
            request: request.clone(),
            donor_seqno,
            local_seqno,
        });
        Ok(())
    }

    fn send_join(&self, seqno: Seqno) -> Result<(), GcsError> {
        let mut inner = self.group.lock();
        if !inner.members.contains_key(&self.node_id) {
            return Err(GcsError::NotMember);
        }
        let source = self.node_id;
        inner.broadcast(move |local_seqno| Action::Join {
            source,
            seqno,
            local_seqno,
        });
        Ok(())
    }

    fn send_sync(&self) -> Result<(), GcsError> {
        let mut inner = self.group.lock();
        let Some(member) = inner.members.get_mut(&self.node_id) else {
            return Err(GcsError::NotMember);
        };
        member.synced = true;
        let source = self.node_id;
        inner.broadcast(move |local_seqno| Action::Sync {
            source,
            local_seqno,
        });
        Ok(())
    }

    fn close(&self) -> Result<(), GcsError> {
        let mut inner = self.group.lock();
        if inner.members.remove(&self.node_id).is_none() {
            return Err(GcsError::NotMember);
        }
        if !inner.members.is_empty() {
            inner.install_view();
        }
        Ok(())
    }
}
