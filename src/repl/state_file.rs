//! Persisted node state: one `uuid:seqno` line.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use thiserror::Error;
use uuid::Uuid;

use crate::core::Seqno;

/// The state a node persists across restarts: the group state UUID and
/// the last seqno known applied. Written on clean shutdown, read on
/// startup, invalidated when the on-disk state can no longer be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SavedState {
    pub uuid: Uuid,
    pub seqno: Seqno,
}

impl SavedState {
    pub fn undefined() -> Self {
        Self {
            uuid: Uuid::nil(),
            seqno: Seqno::UNDEFINED,
        }
    }

    pub fn is_defined(&self) -> bool {
        !self.uuid.is_nil() && self.seqno.is_defined()
    }
}

#[derive(Debug, Error)]
pub enum StateFileError {
    #[error("io error on state file: {0}")]
    Io(#[from] io::Error),
    #[error("malformed state file line {line:?}")]
    Malformed { line: String },
}

/// Writes `uuid:seqno\n`, atomically via a temp file rename.
pub fn store(path: &Path, state: SavedState) -> Result<(), StateFileError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        writeln!(file, "{}:{}", state.uuid, state.seqno.get())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads the persisted state. A missing file yields the undefined state;
/// a malformed one is an error.
pub fn restore(path: &Path) -> Result<SavedState, StateFileError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(SavedState::undefined());
        }
        Err(err) => return Err(err.into()),
    };
    let line = contents.trim();
    let Some((uuid_part, seqno_part)) = line.rsplit_once(':') else {
        return Err(StateFileError::Malformed {
            line: line.to_string(),
        });
    };
    let uuid = Uuid::parse_str(uuid_part).map_err(|_| StateFileError::Malformed {
        line: line.to_string(),
    })?;
    let seqno = seqno_part
        .parse::<i64>()
        .map_err(|_| StateFileError::Malformed {
            line: line.to_string(),
        })?;
    Ok(SavedState {
        uuid,
        seqno: Seqno::new(seqno),
    })
}

/// Overwrites the file with the undefined state, marking the on-disk
/// position untrusted.
pub fn invalidate(path: &Path) -> Result<(), StateFileError> {
    store(path, SavedState::undefined())
}
