//! Replication machinery: monitors, certification, the node FSM and the
//! replicator pipeline.

pub mod cert;
pub mod fsm;
pub mod gcs;
pub mod hooks;
pub mod monitor;
pub mod proto;
pub mod replicator;
pub mod service;
pub mod state_file;
pub mod state_req;
pub mod trx;

pub use cert::{CertError, CertOutcome, Certification};
pub use fsm::{IllegalNodeTransition, NodeFsm, NodeState};
pub use gcs::{Action, GcsError, GlobalOrder, GroupChannel, MemChannel, MemGroup};
pub use hooks::{ApplyError, DonateError, ReplicationHooks};
pub use monitor::{ApplyOrder, CommitOrder, LocalOrder, Monitor, MonitorError, Order};
pub use proto::{MAX_PROTO_VER, ProtocolVersions, UnsupportedProtocol, establish};
pub use replicator::{Replicator, Stats};
pub use service::ServiceThd;
pub use state_file::{SavedState, StateFileError};
pub use state_req::StateRequest;
pub use trx::{IllegalTrxTransition, SharedTrx, TrxHandle, TrxInner, TrxState};
