//! Global and local sequence numbers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic sequence number assigned by the group channel.
///
/// Signed so that the undefined sentinel (`-1`) sorts below every assigned
/// value. Global seqnos order write-sets across the whole group; local
/// seqnos order deliveries on a single node. The two domains never mix.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seqno(i64);

impl Seqno {
    pub const UNDEFINED: Seqno = Seqno(-1);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn is_defined(self) -> bool {
        self.0 >= 0
    }

    pub fn next(self) -> Seqno {
        Seqno(self.0.checked_add(1).expect("seqno overflow computing next"))
    }

    pub fn prev(self) -> Seqno {
        Seqno(self.0.checked_sub(1).expect("seqno underflow computing prev"))
    }
}

impl Default for Seqno {
    fn default() -> Self {
        Seqno::UNDEFINED
    }
}

impl fmt::Debug for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seqno({})", self.0)
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Seqno> for i64 {
    fn from(value: Seqno) -> i64 {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_sorts_below_assigned() {
        assert!(Seqno::UNDEFINED < Seqno::new(0));
        assert!(!Seqno::UNDEFINED.is_defined());
        assert!(Seqno::new(0).is_defined());
    }

    #[test]
    fn next_and_prev_are_inverse() {
        let s = Seqno::new(41);
        assert_eq!(s.next().get(), 42);
        assert_eq!(s.next().prev(), s);
        assert_eq!(Seqno::UNDEFINED.next(), Seqno::new(0));
    }

    #[test]
    fn default_is_undefined() {
        assert_eq!(Seqno::default(), Seqno::UNDEFINED);
    }

    #[test]
    fn display_and_debug_show_the_raw_value() {
        assert_eq!(Seqno::new(7).to_string(), "7");
        assert_eq!(Seqno::UNDEFINED.to_string(), "-1");
        assert_eq!(format!("{:?}", Seqno::new(7)), "Seqno(7)");
    }

    #[test]
    fn converts_back_to_i64() {
        assert_eq!(i64::from(Seqno::new(9)), 9);
    }
}
