//! Query records carried by query-level write-sets.

use bytes::Bytes;

/// A statement to replay on remote nodes, with enough originator context
/// (timestamp, rng seed) to reproduce nondeterministic functions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryRecord {
    query: Bytes,
    tstamp: i64,
    rnd_seed: u32,
}

impl QueryRecord {
    pub fn new(query: impl Into<Bytes>, tstamp: i64, rnd_seed: u32) -> Self {
        Self {
            query: query.into(),
            tstamp,
            rnd_seed,
        }
    }

    pub fn query(&self) -> &[u8] {
        &self.query
    }

    pub fn tstamp(&self) -> i64 {
        self.tstamp
    }

    pub fn rnd_seed(&self) -> u32 {
        self.rnd_seed
    }

    /// Serialized length: `[len:u32][bytes][tstamp:i64][rnd_seed:u32]`.
    pub fn serial_size(&self) -> usize {
        4 + self.query.len() + 8 + 4
    }
}
