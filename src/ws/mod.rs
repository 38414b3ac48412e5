//! Write-set model and wire codec.

pub mod key;
pub mod query;
pub mod wire;
pub mod writeset;

pub use key::{KEY_ACTION_DELETE, KEY_ACTION_INSERT, KEY_ACTION_UPDATE, RowKey};
pub use query::QueryRecord;
pub use wire::WireError;
pub use writeset::{F_COMMIT, F_ROLLBACK, WS_MAGIC, WS_VERSION, WriteSet, WsLevel, WsType};
