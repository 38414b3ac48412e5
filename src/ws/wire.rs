//! Bounds-checked little-endian cursor helpers for the wire codecs.

use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer truncated: needed {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("bad magic {got:#010x}")]
    BadMagic { got: u32 },
    #[error("unsupported format version {got}")]
    UnsupportedVersion { got: u8 },
    #[error("reserved field not zero ({got})")]
    ReservedNonZero { got: u16 },
    #[error("unknown flags bits {got:#04x}")]
    UnknownFlags { got: u8 },
    #[error("unknown {what} value {got}")]
    UnknownDiscriminant { what: &'static str, got: u8 },
    #[error("length field {got} exceeds limit {limit}")]
    LengthInvalid { got: u64, limit: u64 },
    #[error("{section} section overran its declared length")]
    SectionOverrun { section: &'static str },
    #[error("{remaining} trailing bytes after decode")]
    TrailingBytes { remaining: usize },
    #[error("rollback write-set carries row data")]
    RollbackWithData,
}

pub(crate) fn take<'a>(
    bytes: &'a [u8],
    offset: &mut usize,
    len: usize,
) -> Result<&'a [u8], WireError> {
    let end = offset.checked_add(len).ok_or(WireError::Truncated {
        offset: *offset,
        needed: len,
        available: bytes.len().saturating_sub(*offset),
    })?;
    if end > bytes.len() {
        return Err(WireError::Truncated {
            offset: *offset,
            needed: len,
            available: bytes.len() - *offset,
        });
    }
    let slice = &bytes[*offset..end];
    *offset = end;
    Ok(slice)
}

pub(crate) fn read_u8(bytes: &[u8], offset: &mut usize) -> Result<u8, WireError> {
    Ok(take(bytes, offset, 1)?[0])
}

pub(crate) fn read_u16_le(bytes: &[u8], offset: &mut usize) -> Result<u16, WireError> {
    let slice = take(bytes, offset, 2)?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

pub(crate) fn read_u32_le(bytes: &[u8], offset: &mut usize) -> Result<u32, WireError> {
    let slice = take(bytes, offset, 4)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

pub(crate) fn read_i64_le(bytes: &[u8], offset: &mut usize) -> Result<i64, WireError> {
    let slice = take(bytes, offset, 8)?;
    Ok(i64::from_le_bytes([
        slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7],
    ]))
}

pub(crate) fn read_uuid(bytes: &[u8], offset: &mut usize) -> Result<Uuid, WireError> {
    let slice = take(bytes, offset, 16)?;
    let mut out = [0u8; 16];
    out.copy_from_slice(slice);
    Ok(Uuid::from_bytes(out))
}
