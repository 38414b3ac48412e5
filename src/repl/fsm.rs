//! Node lifecycle state machine.

use std::fmt;

use thiserror::Error;

/// Node lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    Closed,
    Connected,
    Joining,
    Joined,
    Synced,
    Donor,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Closed => "closed",
            NodeState::Connected => "connected",
            NodeState::Joining => "joining",
            NodeState::Joined => "joined",
            NodeState::Synced => "synced",
            NodeState::Donor => "donor",
        };
        f.write_str(name)
    }
}

impl NodeState {
    /// Whether replication requests are accepted in this state. `Synced`
    /// accepts everything; the others listed accept total-order isolation
    /// operations only (subject to configuration).
    pub fn accepts_requests(self) -> bool {
        matches!(
            self,
            NodeState::Connected | NodeState::Joined | NodeState::Synced | NodeState::Donor
        )
    }
}

/// Legal transitions besides the universal fallback to `Closed`.
const NODE_TRANSITIONS: &[(NodeState, NodeState)] = &[
    (NodeState::Closed, NodeState::Connected),
    (NodeState::Connected, NodeState::Joining),
    (NodeState::Connected, NodeState::Joined),
    (NodeState::Joining, NodeState::Joined),
    (NodeState::Joined, NodeState::Synced),
    (NodeState::Joined, NodeState::Joining),
    (NodeState::Synced, NodeState::Joining),
    (NodeState::Synced, NodeState::Joined),
    (NodeState::Synced, NodeState::Donor),
    (NodeState::Donor, NodeState::Joined),
    (NodeState::Donor, NodeState::Joining),
    // Quorum loss demotes an operational node back to Connected.
    (NodeState::Joining, NodeState::Connected),
    (NodeState::Joined, NodeState::Connected),
    (NodeState::Synced, NodeState::Connected),
    (NodeState::Donor, NodeState::Connected),
];

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("illegal node state transition {from} -> {to}")]
pub struct IllegalNodeTransition {
    pub from: NodeState,
    pub to: NodeState,
}

/// Explicit-table FSM over [`NodeState`]. Mutated only by the dispatcher
/// thread; other threads read snapshots.
#[derive(Debug)]
pub struct NodeFsm {
    state: NodeState,
}

impl NodeFsm {
    pub fn new() -> Self {
        Self {
            state: NodeState::Closed,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn shift_to(&mut self, to: NodeState) -> Result<(), IllegalNodeTransition> {
        if self.state == to {
            return Ok(());
        }
        // Any state may fall back to Closed on fatal error.
        if to != NodeState::Closed && !NODE_TRANSITIONS.contains(&(self.state, to)) {
            return Err(IllegalNodeTransition {
                from: self.state,
                to,
            });
        }
        tracing::info!(from = %self.state, to = %to, "node state change");
        self.state = to;
        Ok(())
    }
}

impl Default for NodeFsm {
    fn default() -> Self {
        Self::new()
    }
}
