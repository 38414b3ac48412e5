//! Group views: membership snapshots delivered with configuration changes.

use std::fmt;

use uuid::Uuid;

use super::{NodeId, Seqno};

/// View identifier: the group state UUID plus a view ordinal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewId {
    pub uuid: Uuid,
    pub seqno: Seqno,
}

impl ViewId {
    pub fn new(uuid: Uuid, seqno: Seqno) -> Self {
        Self { uuid, seqno }
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uuid, self.seqno)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewStatus {
    /// Quorate component; replication proceeds.
    Primary,
    /// Lost quorum; only reads may be served.
    NonPrimary,
    /// Group channel torn down.
    Disconnected,
}

/// Membership snapshot published on every configuration change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewInfo {
    pub id: ViewId,
    pub status: ViewStatus,
    /// Index of the receiving node in `members`, if it is a member.
    pub own_index: Option<usize>,
    pub members: Vec<NodeId>,
    /// Highest global seqno ordered before this view formed. A joiner whose
    /// applied position is behind this needs a state transfer.
    pub group_seqno: Seqno,
}

impl ViewInfo {
    pub fn is_primary(&self) -> bool {
        self.status == ViewStatus::Primary
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_id_displays_uuid_and_seqno() {
        let id = ViewId::new(Uuid::nil(), Seqno::new(3));
        assert_eq!(
            id.to_string(),
            "00000000-0000-0000-0000-000000000000:3"
        );
    }
}
