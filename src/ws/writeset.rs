//! The write-set: the serializable unit of replicated work.

use std::collections::HashMap;

use bytes::Bytes;

use crate::core::{ConnId, NodeId, Seqno, TrxId};

use super::wire::{
    WireError, read_i64_le, read_u8, read_u16_le, read_u32_le, read_uuid, take,
};
use super::{QueryRecord, RowKey};

pub const WS_MAGIC: u32 = 0x5753_4554;
pub const WS_VERSION: u8 = 1;

pub const F_COMMIT: u8 = 1 << 0;
pub const F_ROLLBACK: u8 = 1 << 1;

const KNOWN_FLAGS: u8 = F_COMMIT | F_ROLLBACK;

/// Whether the write-set belongs to a transaction or to a connection
/// (total-order isolation operations replicate through connection
/// write-sets).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WsType {
    #[default]
    Trx,
    Conn,
}

impl WsType {
    fn to_byte(self) -> u8 {
        match self {
            WsType::Trx => 0,
            WsType::Conn => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            0 => Ok(WsType::Trx),
            1 => Ok(WsType::Conn),
            got => Err(WireError::UnknownDiscriminant {
                what: "write-set type",
                got,
            }),
        }
    }
}

/// Replication level: statement replay or row-based payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WsLevel {
    #[default]
    Query,
    RowData,
}

impl WsLevel {
    fn to_byte(self) -> u8 {
        match self {
            WsLevel::Query => 0,
            WsLevel::RowData => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            0 => Ok(WsLevel::Query),
            1 => Ok(WsLevel::RowData),
            got => Err(WireError::UnknownDiscriminant {
                what: "write-set level",
                got,
            }),
        }
    }
}

/// Everything a transaction needs replicated: the keys it touched, its
/// row payload or statements, and the originator's snapshot horizon.
///
/// Keys dedup on append (identity is table + key bytes); the outward
/// order is insertion order. Serialization is deterministic and
/// round-trip exact.
#[derive(Clone, Debug)]
pub struct WriteSet {
    source_id: NodeId,
    conn_id: ConnId,
    trx_id: TrxId,
    ws_type: WsType,
    level: WsLevel,
    flags: u8,
    last_seen_seqno: Seqno,
    queries: Vec<QueryRecord>,
    keys: Vec<RowKey>,
    key_positions: HashMap<RowKey, usize>,
    data: Vec<u8>,
}

impl WriteSet {
    pub fn new(source_id: NodeId, conn_id: ConnId, trx_id: TrxId, ws_type: WsType) -> Self {
        Self {
            source_id,
            conn_id,
            trx_id,
            ws_type,
            level: WsLevel::Query,
            flags: 0,
            last_seen_seqno: Seqno::UNDEFINED,
            queries: Vec::new(),
            keys: Vec::new(),
            key_positions: HashMap::new(),
            data: Vec::new(),
        }
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

    pub fn ws_type(&self) -> WsType {
        self.ws_type
    }

    pub fn level(&self) -> WsLevel {
        self.level
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn assign_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    pub fn is_commit(&self) -> bool {
        self.flags & F_COMMIT != 0
    }

    pub fn is_rollback(&self) -> bool {
        self.flags & F_ROLLBACK != 0
    }

    pub fn last_seen_seqno(&self) -> Seqno {
        self.last_seen_seqno
    }

    pub fn assign_last_seen_seqno(&mut self, seqno: Seqno) {
        self.last_seen_seqno = seqno;
    }

    pub fn queries(&self) -> &[QueryRecord] {
        &self.queries
    }

    pub fn keys(&self) -> &[RowKey] {
        &self.keys
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn append_query(&mut self, query: impl Into<Bytes>, tstamp: i64, rnd_seed: u32) {
        self.queries.push(QueryRecord::new(query, tstamp, rnd_seed));
    }

    /// Appends a row key, suppressing duplicates: a key equal (table and
    /// key bytes) to one already present is dropped and the original
    /// keeps its position and action.
    pub fn append_row_key(
        &mut self,
        table: impl Into<Bytes>,
        key: impl Into<Bytes>,
        action: u8,
    ) {
        let row_key = RowKey::new(table, key, action);
        if self.key_positions.contains_key(&row_key) {
            return;
        }
        self.key_positions.insert(row_key.clone(), self.keys.len());
        self.keys.push(row_key);
    }

    /// Appends row-based payload bytes and switches the level to
    /// [`WsLevel::RowData`].
    pub fn append_data(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
        self.level = WsLevel::RowData;
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty() && self.data.is_empty()
    }

    /// Serialized length in bytes, computable without allocation.
    pub fn serial_size(&self) -> usize {
        let header = 4 + 1 + 1 + 2 + 16 + 8 + 8 + 8 + 1 + 1 + 2;
        let queries = 4 + self
            .queries
            .iter()
            .map(QueryRecord::serial_size)
            .sum::<usize>();
        let keys = 4 + self.keys_serial_size();
        let data = 4 + self.data.len();
        header + queries + keys + data
    }

    fn keys_serial_size(&self) -> usize {
        self.keys.iter().map(RowKey::serial_size).sum()
    }

    /// Serializes into the versioned little-endian wire format.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.is_rollback() && !self.data.is_empty() {
            return Err(WireError::RollbackWithData);
        }

        let mut buf = Vec::with_capacity(self.serial_size());
        buf.extend_from_slice(&WS_MAGIC.to_le_bytes());
        buf.push(WS_VERSION);
        buf.push(self.flags);
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(self.source_id.as_uuid().as_bytes());
        buf.extend_from_slice(&self.conn_id.get().to_le_bytes());
        buf.extend_from_slice(&self.trx_id.get().to_le_bytes());
        buf.extend_from_slice(&self.last_seen_seqno.get().to_le_bytes());
        buf.push(self.ws_type.to_byte());
        buf.push(self.level.to_byte());
        buf.extend_from_slice(&0u16.to_le_bytes());

        let queries_count =
            u32::try_from(self.queries.len()).map_err(|_| WireError::LengthInvalid {
                got: self.queries.len() as u64,
                limit: u32::MAX as u64,
            })?;
        buf.extend_from_slice(&queries_count.to_le_bytes());
        for record in &self.queries {
            let len = u32::try_from(record.query().len()).map_err(|_| WireError::LengthInvalid {
                got: record.query().len() as u64,
                limit: u32::MAX as u64,
            })?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(record.query());
            buf.extend_from_slice(&record.tstamp().to_le_bytes());
            buf.extend_from_slice(&record.rnd_seed().to_le_bytes());
        }

        let keys_len =
            u32::try_from(self.keys_serial_size()).map_err(|_| WireError::LengthInvalid {
                got: self.keys_serial_size() as u64,
                limit: u32::MAX as u64,
            })?;
        buf.extend_from_slice(&keys_len.to_le_bytes());
        for key in &self.keys {
            encode_row_key(&mut buf, key)?;
        }

        let data_len = u32::try_from(self.data.len()).map_err(|_| WireError::LengthInvalid {
            got: self.data.len() as u64,
            limit: u32::MAX as u64,
        })?;
        buf.extend_from_slice(&data_len.to_le_bytes());
        buf.extend_from_slice(&self.data);

        Ok(Bytes::from(buf))
    }

    /// Deserializes a write-set. With `skip_data` the trailing row payload
    /// is validated for length but not retained, which is enough for the
    /// certification fast path (header and keys).
    pub fn decode(bytes: &[u8], skip_data: bool) -> Result<Self, WireError> {
        let mut offset = 0usize;

        let magic = read_u32_le(bytes, &mut offset)?;
        if magic != WS_MAGIC {
            return Err(WireError::BadMagic { got: magic });
        }
        let version = read_u8(bytes, &mut offset)?;
        if version != WS_VERSION {
            return Err(WireError::UnsupportedVersion { got: version });
        }
        let flags = read_u8(bytes, &mut offset)?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(WireError::UnknownFlags { got: flags });
        }
        let reserved = read_u16_le(bytes, &mut offset)?;
        if reserved != 0 {
            return Err(WireError::ReservedNonZero { got: reserved });
        }

        let source_id = NodeId::new(read_uuid(bytes, &mut offset)?);
        let conn_id = ConnId::new(read_i64_le(bytes, &mut offset)?);
        let trx_id = TrxId::new(read_i64_le(bytes, &mut offset)?);
        let last_seen_seqno = Seqno::new(read_i64_le(bytes, &mut offset)?);
        let ws_type = WsType::from_byte(read_u8(bytes, &mut offset)?)?;
        let level = WsLevel::from_byte(read_u8(bytes, &mut offset)?)?;
        let pad = read_u16_le(bytes, &mut offset)?;
        if pad != 0 {
            return Err(WireError::ReservedNonZero { got: pad });
        }

        let queries_count = read_u32_le(bytes, &mut offset)? as usize;
        let mut queries = Vec::with_capacity(queries_count.min(1024));
        for _ in 0..queries_count {
            let len = read_u32_le(bytes, &mut offset)? as usize;
            let query = Bytes::copy_from_slice(take(bytes, &mut offset, len)?);
            let tstamp = read_i64_le(bytes, &mut offset)?;
            let rnd_seed = read_u32_le(bytes, &mut offset)?;
            queries.push(QueryRecord::new(query, tstamp, rnd_seed));
        }

        let keys_len = read_u32_le(bytes, &mut offset)? as usize;
        let keys_end = offset.checked_add(keys_len).ok_or(WireError::LengthInvalid {
            got: keys_len as u64,
            limit: u32::MAX as u64,
        })?;
        if keys_end > bytes.len() {
            return Err(WireError::Truncated {
                offset,
                needed: keys_len,
                available: bytes.len() - offset,
            });
        }
        let mut keys = Vec::new();
        let mut key_positions = HashMap::new();
        while offset < keys_end {
            let key = decode_row_key(bytes, &mut offset, keys_end)?;
            if !key_positions.contains_key(&key) {
                key_positions.insert(key.clone(), keys.len());
                keys.push(key);
            }
        }
        if offset != keys_end {
            return Err(WireError::SectionOverrun { section: "keys" });
        }

        let data_len = read_u32_le(bytes, &mut offset)? as usize;
        let data_bytes = take(bytes, &mut offset, data_len)?;
        let data = if skip_data {
            Vec::new()
        } else {
            data_bytes.to_vec()
        };

        if offset != bytes.len() {
            return Err(WireError::TrailingBytes {
                remaining: bytes.len() - offset,
            });
        }
        if flags & F_ROLLBACK != 0 && data_len != 0 {
            return Err(WireError::RollbackWithData);
        }

        Ok(Self {
            source_id,
            conn_id,
            trx_id,
            ws_type,
            level,
            flags,
            last_seen_seqno,
            queries,
            keys,
            key_positions,
            data,
        })
    }
}

impl PartialEq for WriteSet {
    fn eq(&self, other: &Self) -> bool {
        // The position map is derived from `keys`; it carries no extra state.
        self.source_id == other.source_id
            && self.conn_id == other.conn_id
            && self.trx_id == other.trx_id
            && self.ws_type == other.ws_type
            && self.level == other.level
            && self.flags == other.flags
            && self.last_seen_seqno == other.last_seen_seqno
            && self.queries == other.queries
            && self.keys == other.keys
            && self.data == other.data
    }
}

impl Eq for WriteSet {}

fn encode_row_key(buf: &mut Vec<u8>, key: &RowKey) -> Result<(), WireError> {
    let table_len = u16::try_from(key.table().len()).map_err(|_| WireError::LengthInvalid {
        got: key.table().len() as u64,
        limit: u16::MAX as u64,
    })?;
    let key_len = u16::try_from(key.key().len()).map_err(|_| WireError::LengthInvalid {
        got: key.key().len() as u64,
        limit: u16::MAX as u64,
    })?;
    buf.extend_from_slice(&table_len.to_le_bytes());
    buf.extend_from_slice(key.table());
    buf.extend_from_slice(&key_len.to_le_bytes());
    buf.extend_from_slice(key.key());
    buf.push(key.action());
    Ok(())
}

fn decode_row_key(bytes: &[u8], offset: &mut usize, end: usize) -> Result<RowKey, WireError> {
    let table_len = read_u16_le(bytes, offset)? as usize;
    let table = Bytes::copy_from_slice(take(bytes, offset, table_len)?);
    let key_len = read_u16_le(bytes, offset)? as usize;
    let key = Bytes::copy_from_slice(take(bytes, offset, key_len)?);
    let action = read_u8(bytes, offset)?;
    if *offset > end {
        return Err(WireError::SectionOverrun { section: "keys" });
    }
    Ok(RowKey::new(table, key, action))
}
