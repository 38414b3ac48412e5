//! Core domain types shared across the replication machinery.

pub mod config;
pub mod error;
pub mod identity;
pub mod seqno;
pub mod view;

pub use config::{CommitMode, InvalidCommitMode, ReplConfig};
pub use error::Error;
pub use identity::{ConnId, NodeId, TrxId};
pub use seqno::Seqno;
pub use view::{ViewId, ViewInfo, ViewStatus};
