//! Table-qualified row keys.

use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;

/// Action recorded with a row key. Kept as a raw byte on the wire; the
/// constants cover the host-visible set.
pub const KEY_ACTION_UPDATE: u8 = 0;
pub const KEY_ACTION_DELETE: u8 = 1;
pub const KEY_ACTION_INSERT: u8 = 2;

/// A row key touched by a transaction, qualified by its table name.
///
/// Identity (equality and hashing) covers table and key bytes only; the
/// action byte rides along but does not distinguish keys, so an update and
/// a delete of the same row dedup to one entry.
#[derive(Clone, Debug)]
pub struct RowKey {
    table: Bytes,
    key: Bytes,
    action: u8,
}

impl RowKey {
    pub fn new(table: impl Into<Bytes>, key: impl Into<Bytes>, action: u8) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            action,
        }
    }

    pub fn table(&self) -> &[u8] {
        &self.table
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn action(&self) -> u8 {
        self.action
    }

    /// Serialized length: `[table_len:u16][table][key_len:u16][key][action:u8]`.
    pub fn serial_size(&self) -> usize {
        2 + self.table.len() + 2 + self.key.len() + 1
    }
}

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table && self.key == other.key
    }
}

impl Eq for RowKey {}

impl Hash for RowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.table.hash(state);
        self.key.hash(state);
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            String::from_utf8_lossy(&self.table),
            String::from_utf8_lossy(&self.key)
        )
    }
}
