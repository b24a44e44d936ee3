//! The outcome lattice of a join.

use std::fmt;

/// How two joined graphs relate to each other.
///
/// `LeftEntails` means the left graph covers the right one (every concrete
/// state of the right graph is a state of the left graph) and the join is
/// just the left graph, up to renaming. `RightEntails` is the mirror case.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum JoinStatus {
    #[default]
    Equal,
    LeftEntails,
    RightEntails,
    Incomparable,
}

impl JoinStatus {
    /// Combines the relation found so far with the relation of one more part.
    pub fn update(self, other: JoinStatus) -> JoinStatus {
        use JoinStatus::*;
        match (self, other) {
            (Equal, s) | (s, Equal) => s,
            (a, b) if a == b => a,
            _ => Incomparable,
        }
    }

    /// Whether the left graph is contained in the right graph.
    pub fn left_is_less_or_equal(self) -> bool {
        matches!(self, JoinStatus::Equal | JoinStatus::RightEntails)
    }
}

impl fmt::Display for JoinStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JoinStatus::Equal => "equal",
            JoinStatus::LeftEntails => "left entails",
            JoinStatus::RightEntails => "right entails",
            JoinStatus::Incomparable => "incomparable",
        };
        write!(f, "{}", s)
    }
}
