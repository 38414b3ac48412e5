//! State transfer request payload.

use bytes::Bytes;

use crate::core::Seqno;
use crate::ws::wire::{WireError, read_i64_le, read_u8, read_u16_le, read_u32_le, take};

const STATE_REQ_VERSION: u8 = 1;

/// What a joiner puts into the ordered stream to ask for a state
/// transfer: where it stands (so a donor can serve the incremental range
/// when it is able to), which donor it would prefer, and an opaque SST
/// descriptor for the host-side transfer machinery. The SST descriptor
/// is the fallback: it is always present, and a donor that cannot cover
/// the incremental range uses it for a full snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateRequest {
    pub last_applied: Seqno,
    pub preferred_donor: String,
    pub sst_request: Bytes,
}

impl StateRequest {
    pub fn new(last_applied: Seqno, preferred_donor: impl Into<String>, sst_request: impl Into<Bytes>) -> Self {
        Self {
            last_applied,
            preferred_donor: preferred_donor.into(),
            sst_request: sst_request.into(),
        }
    }

    pub fn serial_size(&self) -> usize {
        1 + 8 + 2 + self.preferred_donor.len() + 4 + self.sst_request.len()
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let donor_len =
            u16::try_from(self.preferred_donor.len()).map_err(|_| WireError::LengthInvalid {
                got: self.preferred_donor.len() as u64,
                limit: u16::MAX as u64,
            })?;
        let sst_len =
            u32::try_from(self.sst_request.len()).map_err(|_| WireError::LengthInvalid {
                got: self.sst_request.len() as u64,
                limit: u32::MAX as u64,
            })?;

        let mut buf = Vec::with_capacity(self.serial_size());
        buf.push(STATE_REQ_VERSION);
        buf.extend_from_slice(&self.last_applied.get().to_le_bytes());
        buf.extend_from_slice(&donor_len.to_le_bytes());
        buf.extend_from_slice(self.preferred_donor.as_bytes());
        buf.extend_from_slice(&sst_len.to_le_bytes());
        buf.extend_from_slice(&self.sst_request);
        Ok(Bytes::from(buf))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut offset = 0usize;
        let version = read_u8(bytes, &mut offset)?;
        if version != STATE_REQ_VERSION {
            return Err(WireError::UnsupportedVersion { got: version });
        }
        let last_applied = Seqno::new(read_i64_le(bytes, &mut offset)?);
        let donor_len = read_u16_le(bytes, &mut offset)? as usize;
        let donor_bytes = take(bytes, &mut offset, donor_len)?;
        let preferred_donor = String::from_utf8_lossy(donor_bytes).into_owned();
        let sst_len = read_u32_le(bytes, &mut offset)? as usize;
        let sst_request = Bytes::copy_from_slice(take(bytes, &mut offset, sst_len)?);
        if offset != bytes.len() {
            return Err(WireError::TrailingBytes {
                remaining: bytes.len() - offset,
            });
        }
        Ok(Self {
            last_applied,
            preferred_donor,
            sst_request,
        })
    }
}
