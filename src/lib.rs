#![forbid(unsafe_code)]

//! # lockstep
//!
//! A synchronous multi-master replication core. Local transactions
//! collect their effects into write-sets, broadcast them through a
//! totally ordered group channel, and every node certifies each incoming
//! write-set first-committer-wins against concurrent transactions before
//! driving it through apply and commit ordering. Nodes receiving the
//! same action stream converge to an identical sequence of committed
//! transactions.
//!
//! The moving parts:
//!
//! - [`ws::WriteSet`]: the serializable unit of replicated work.
//! - [`repl::Certification`]: the key index behind the deterministic
//!   conflict decisions.
//! - [`repl::Monitor`]: the gated seqno monitor; three instances (local,
//!   apply, commit) form the ordering pipeline.
//! - [`repl::Replicator`]: ties the pipeline to the group channel, the
//!   node lifecycle FSM and the host callbacks.
//! - [`repl::MemGroup`]: an in-process group bus for tests and
//!   single-node deployments.
//!
//! The group transport, state snapshot transfer mechanics and the host
//! storage engine stay behind the [`repl::GroupChannel`] and
//! [`repl::ReplicationHooks`] seams.

pub mod core;
pub mod repl;
pub mod ws;

pub use crate::core::{
    CommitMode, ConnId, Error, NodeId, ReplConfig, Seqno, TrxId, ViewId, ViewInfo, ViewStatus,
};
pub use crate::repl::{
    Action, GroupChannel, MemGroup, NodeState, ReplicationHooks, Replicator, SharedTrx, Stats,
    TrxHandle, TrxState,
};
pub use crate::ws::{QueryRecord, RowKey, WireError, WriteSet};

pub type Result<T> = std::result::Result<T, Error>;
