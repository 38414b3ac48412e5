//! Replication protocol version negotiation.

use thiserror::Error;

/// Newest replication protocol this build speaks.
pub const MAX_PROTO_VER: i32 = 2;

/// The three protocol facets, all derived from one negotiated number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolVersions {
    /// Transaction (write-set) protocol.
    pub trx: i32,
    /// State transfer request protocol.
    pub state_req: i32,
    /// General replication layer protocol.
    pub repl: i32,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unsupported protocol version {requested}, maximum {MAX_PROTO_VER}")]
pub struct UnsupportedProtocol {
    pub requested: i32,
}

/// Resolves the facet versions for a negotiated protocol number.
/// A negative request means "newest".
pub fn establish(requested: i32) -> Result<ProtocolVersions, UnsupportedProtocol> {
    let version = if requested < 0 {
        MAX_PROTO_VER
    } else {
        requested
    };
    match version {
        0 => Ok(ProtocolVersions {
            trx: 0,
            state_req: 0,
            repl: 0,
        }),
        1 => Ok(ProtocolVersions {
            trx: 1,
            state_req: 0,
            repl: 1,
        }),
        2 => Ok(ProtocolVersions {
            trx: 1,
            state_req: 1,
            repl: 2,
        }),
        _ => Err(UnsupportedProtocol { requested }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_request_negotiates_newest() {
        let versions = establish(-1).unwrap();
        assert_eq!(versions, establish(MAX_PROTO_VER).unwrap());
    }

    #[test]
    fn facet_table_is_fixed() {
        assert_eq!(
            establish(0).unwrap(),
            ProtocolVersions {
                trx: 0,
                state_req: 0,
                repl: 0
            }
        );
        assert_eq!(
            establish(1).unwrap(),
            ProtocolVersions {
                trx: 1,
                state_req: 0,
                repl: 1
            }
        );
        assert_eq!(
            establish(2).unwrap(),
            ProtocolVersions {
                trx: 1,
                state_req: 1,
                repl: 2
            }
        );
    }

    #[test]
    fn future_versions_are_rejected() {
        assert_eq!(
            establish(3).unwrap_err(),
            UnsupportedProtocol { requested: 3 }
        );
    }
}
