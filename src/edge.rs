//! Edges of the memory graph: field contents and pointer targets.

use std::fmt;
use std::ops::Range;

use crate::types::{ObjectId, Value};

/// "Object at byte `offset` holds `value`, interpreted at `size` bytes."
///
/// An edge carrying [`Value::NULL`] doubles as a zero filler: it says that
/// every byte of its range is zero, whatever the type of a later read.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HasValueEdge {
    pub object: ObjectId,
    pub offset: u64,
    pub size: u64,
    pub value: Value,
}

impl HasValueEdge {
    pub fn new(object: ObjectId, offset: u64, size: u64, value: Value) -> Self {
        Self {
            object,
            offset,
            size,
            value,
        }
    }

    /// One past the last byte covered by this edge.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn range(&self) -> Range<u64> {
        self.offset..self.end()
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_null()
    }

    /// Checks whether this edge covers at least one byte of `[offset, end)`.
    pub fn overlaps_range(&self, offset: u64, end: u64) -> bool {
        self.offset < end && offset < self.end()
    }

    pub fn overlaps(&self, other: &HasValueEdge) -> bool {
        self.object == other.object && self.overlaps_range(other.offset, other.end())
    }

    /// Same object, offset and size: the two edges describe the same field.
    pub fn same_field(&self, other: &HasValueEdge) -> bool {
        self.object == other.object && self.offset == other.offset && self.size == other.size
    }

    /// Two edges on the same field must agree on the value.
    pub fn is_consistent_with(&self, other: &HasValueEdge) -> bool {
        !self.same_field(other) || self.value == other.value
    }

    /// The same edge moved to another object and offset.
    pub fn relocated(&self, object: ObjectId, offset: u64) -> Self {
        Self {
            object,
            offset,
            ..*self
        }
    }
}

impl fmt::Display for HasValueEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}..{}) -> {}", self.object, self.offset, self.end(), self.value)
    }
}

/// Which concrete element of an abstract segment a pointer designates.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TargetSpecifier {
    /// The target is a concrete region.
    Region,
    /// The first element of a segment.
    First,
    /// The last element of a segment.
    Last,
    /// Every element of a segment, uniformly.
    All,
    Unknown,
}

impl TargetSpecifier {
    /// Whether a pointer with specifier `other` may stand for one with `self`.
    pub fn is_covered_by(self, other: TargetSpecifier) -> bool {
        self == other || matches!(other, TargetSpecifier::All | TargetSpecifier::Unknown)
    }
}

impl fmt::Display for TargetSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetSpecifier::Region => "reg",
            TargetSpecifier::First => "fst",
            TargetSpecifier::Last => "lst",
            TargetSpecifier::All => "all",
            TargetSpecifier::Unknown => "?",
        };
        write!(f, "{}", s)
    }
}

/// "Value, if dereferenced, designates byte `offset` of `object`."
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PointsToEdge {
    pub value: Value,
    pub object: ObjectId,
    pub offset: u64,
    pub target: TargetSpecifier,
}

impl PointsToEdge {
    pub fn new(value: Value, object: ObjectId, offset: u64, target: TargetSpecifier) -> Self {
        Self {
            value,
            object,
            offset,
            target,
        }
    }

    /// Checks whether the edges agree on the address: they must not have the
    /// same value with different targets, nor the same target with different values.
    pub fn is_consistent_with(&self, other: &PointsToEdge) -> bool {
        if self == other {
            return true;
        }
        let same_target = self.object == other.object && self.offset == other.offset && self.target == other.target;
        self.value != other.value && !same_target
    }
}

impl fmt::Display for PointsToEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}+{} [{}]", self.value, self.object, self.offset, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn hv(offset: u64, size: u64, value: u32) -> HasValueEdge {
        HasValueEdge::new(ObjectId::new(1), offset, size, Value::new(value))
    }

    #[test]
    fn test_overlap() {
        let a = hv(0, 4, 1);
        assert!(a.overlaps(&hv(2, 4, 2)));
        assert!(a.overlaps(&hv(3, 1, 2)));
        assert!(!a.overlaps(&hv(4, 4, 2)));
        assert!(!a.overlaps(&HasValueEdge::new(ObjectId::new(2), 0, 4, Value::new(1))));
        assert!(!a.overlaps_range(4, 4));
    }

    #[test]
    fn test_hv_consistency() {
        let a = hv(0, 4, 1);
        assert!(a.is_consistent_with(&hv(0, 4, 1)));
        assert!(!a.is_consistent_with(&hv(0, 4, 2)));
        // Different size is a different field, even though the bytes overlap.
        assert!(a.is_consistent_with(&hv(0, 2, 2)));
    }

    #[test]
    fn test_pt_consistency() {
        let p = PointsToEdge::new(Value::new(1), ObjectId::new(1), 0, TargetSpecifier::Region);
        assert!(p.is_consistent_with(&p));
        assert!(p.is_consistent_with(&PointsToEdge::new(Value::new(2), ObjectId::new(1), 4, TargetSpecifier::Region)));
        assert!(!p.is_consistent_with(&PointsToEdge::new(Value::new(2), ObjectId::new(1), 0, TargetSpecifier::Region)));
        assert!(!p.is_consistent_with(&PointsToEdge::new(Value::new(1), ObjectId::new(2), 0, TargetSpecifier::Region)));
    }

    #[test]
    fn test_specifier_cover() {
        assert!(TargetSpecifier::First.is_covered_by(TargetSpecifier::First));
        assert!(TargetSpecifier::First.is_covered_by(TargetSpecifier::All));
        assert!(!TargetSpecifier::First.is_covered_by(TargetSpecifier::Last));
        assert!(!TargetSpecifier::All.is_covered_by(TargetSpecifier::First));
    }

    #[test]
    fn test_relocated() {
        let e = hv(4, 8, 3).relocated(ObjectId::new(7), 12);
        assert_eq!(e.object, ObjectId::new(7));
        assert_eq!(e.range(), 12..20);
        assert_eq!(e.value, Value::new(3));
    }
}
