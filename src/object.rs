//! Memory objects: the nodes of a symbolic memory graph.

use std::fmt;

use crate::types::ObjectId;

/// Where an object lives. The three storage classes partition the non-null objects.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Storage {
    Global,
    /// Local of the frame at the given stack depth (0 is the outermost frame).
    Stack(usize),
    Heap,
}

/// Layout of a linked list summarized by an abstract segment.
///
/// Both links of a doubly-linked list point to the head offset of the
/// neighbouring element.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ListShape {
    /// Offset inside an element that incoming "next" pointers point to.
    pub head_offset: u64,
    /// Offset of the "next" pointer field inside an element.
    pub next_offset: u64,
    /// Offset of the "prev" pointer field, for doubly-linked lists only.
    pub prev_offset: Option<u64>,
    /// The segment stands for at least this many concrete elements (always >= 1).
    pub min_length: u32,
}

impl ListShape {
    pub fn singly(head_offset: u64, next_offset: u64, min_length: u32) -> Self {
        Self {
            head_offset,
            next_offset,
            prev_offset: None,
            min_length,
        }
    }

    pub fn doubly(head_offset: u64, next_offset: u64, prev_offset: u64, min_length: u32) -> Self {
        Self {
            head_offset,
            next_offset,
            prev_offset: Some(prev_offset),
            min_length,
        }
    }

    pub fn is_doubly_linked(&self) -> bool {
        self.prev_offset.is_some()
    }

    /// Checks whether two shapes link their elements the same way (lengths aside).
    pub fn same_linkage(&self, other: &ListShape) -> bool {
        self.head_offset == other.head_offset && self.next_offset == other.next_offset && self.prev_offset == other.prev_offset
    }

    /// Offsets of the link fields, "next" first.
    pub fn link_offsets(&self) -> impl Iterator<Item = u64> {
        std::iter::once(self.next_offset).chain(self.prev_offset)
    }

    /// Whether the bytes `[start, end)` touch a link field.
    pub fn overlaps_link(&self, start: u64, end: u64, pointer_size: u64) -> bool {
        self.link_offsets().any(|link| start < link + pointer_size && link < end)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ObjectKind {
    /// A single concrete block of memory.
    Region,
    /// An abstract segment of a singly- or doubly-linked list.
    ListSegment(ListShape),
}

/// A node of the memory graph.
///
/// Objects are plain values: "mutating" one means inserting an updated copy
/// into a new graph.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct MemoryObject {
    pub id: ObjectId,
    pub size: u64,
    pub label: String,
    pub kind: ObjectKind,
    pub storage: Storage,
    pub valid: bool,
    pub externally_allocated: bool,
    /// 0 for ordinary objects. An object at level 1 stands for the private
    /// sub-object every element of a list segment owns, one copy per element.
    pub nesting_level: u32,
}

impl MemoryObject {
    /// A fresh valid region.
    pub fn region(id: ObjectId, size: u64, label: impl Into<String>, storage: Storage) -> Self {
        Self {
            id,
            size,
            label: label.into(),
            kind: ObjectKind::Region,
            storage,
            valid: true,
            externally_allocated: false,
            nesting_level: 0,
        }
    }

    /// The null object: zero-sized and never valid.
    pub fn null() -> Self {
        Self {
            id: ObjectId::NULL,
            size: 0,
            label: "NULL".to_string(),
            kind: ObjectKind::Region,
            storage: Storage::Heap,
            valid: false,
            externally_allocated: false,
            nesting_level: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.id.is_null()
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self.kind, ObjectKind::ListSegment(_))
    }

    /// Segments and the sub-objects they own stand for more than one block.
    pub fn is_summary(&self) -> bool {
        self.is_abstract() || self.nesting_level > 0
    }

    pub fn list_shape(&self) -> Option<ListShape> {
        match self.kind {
            ObjectKind::ListSegment(shape) => Some(shape),
            ObjectKind::Region => None,
        }
    }

    /// Number of concrete elements this object stands for, at least.
    pub fn min_length(&self) -> u32 {
        match self.kind {
            ObjectKind::Region => 1,
            ObjectKind::ListSegment(shape) => shape.min_length,
        }
    }

    pub fn is_heap(&self) -> bool {
        self.storage == Storage::Heap
    }

    /// Reads and writes are permitted on valid or externally allocated objects.
    pub fn is_accessible(&self) -> bool {
        self.valid || self.externally_allocated
    }
}

impl fmt::Display for MemoryObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} bytes, '{}'", self.id, self.size, self.label)?;
        if let ObjectKind::ListSegment(shape) = self.kind {
            let kind = if shape.is_doubly_linked() { "dll" } else { "sll" };
            write!(f, ", {} {}+ hfo={} nfo={}", kind, shape.min_length, shape.head_offset, shape.next_offset)?;
            if let Some(prev) = shape.prev_offset {
                write!(f, " pfo={}", prev)?;
            }
        }
        if self.nesting_level > 0 {
            write!(f, ", level {}", self.nesting_level)?;
        }
        if !self.valid {
            write!(f, ", invalid")?;
        }
        if self.externally_allocated {
            write!(f, ", external")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_region() {
        let o = MemoryObject::region(ObjectId::new(4), 16, "node", Storage::Heap);
        assert!(o.valid);
        assert!(o.is_heap());
        assert!(!o.is_abstract());
        assert_eq!(o.min_length(), 1);
        assert_eq!(format!("{}", o), "#4(16 bytes, 'node')");
    }

    #[test]
    fn test_null_object_is_inaccessible() {
        let null = MemoryObject::null();
        assert!(null.is_null());
        assert!(!null.is_accessible());
    }

    #[test]
    fn test_segment_shape() {
        let shape = ListShape::singly(0, 8, 2);
        let mut o = MemoryObject::region(ObjectId::new(9), 16, "sll", Storage::Heap);
        o.kind = ObjectKind::ListSegment(shape);
        assert!(o.is_abstract());
        assert!(o.is_summary());
        assert_eq!(o.min_length(), 2);
        assert!(shape.same_linkage(&ListShape { min_length: 5, ..shape }));
        assert!(!shape.same_linkage(&ListShape { next_offset: 0, ..shape }));
        assert!(!shape.same_linkage(&ListShape::doubly(0, 8, 16, 2)));
        assert_eq!(format!("{}", o), "#9(16 bytes, 'sll', sll 2+ hfo=0 nfo=8)");
    }

    #[test]
    fn test_doubly_linked_shape() {
        let shape = ListShape::doubly(0, 8, 16, 2);
        assert_eq!(shape.link_offsets().collect::<Vec<_>>(), vec![8, 16]);
        assert!(shape.overlaps_link(20, 22, 8));
        assert!(shape.overlaps_link(4, 12, 8));
        assert!(!shape.overlaps_link(0, 8, 8));
        assert!(!ListShape::singly(0, 8, 1).overlaps_link(16, 24, 8));
    }

    #[test]
    fn test_nested_object_is_a_summary() {
        let mut o = MemoryObject::region(ObjectId::new(3), 4, "data", Storage::Heap);
        assert!(!o.is_summary());
        o.nesting_level = 1;
        assert!(o.is_summary());
        assert!(!o.is_abstract());
        assert_eq!(format!("{}", o), "#3(4 bytes, 'data', level 1)");
    }
}
