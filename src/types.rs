//! Type-safe handles for memory objects and symbolic values.
//!
//! Objects and values are referenced by opaque integer ids everywhere in the
//! graph, so cycles and aliasing need no ownership tricks. Both handles are
//! `Copy` and cheap to compare.

use std::fmt;

/// An identifier of a memory object (0 is the null object).
///
/// # Invariants
///
/// - Id 0 always denotes the null object, present in every graph
/// - Ids are never reused within one graph and the graphs derived from it
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectId(u32);

impl ObjectId {
    /// The null object, target of the null address.
    pub const NULL: ObjectId = ObjectId(0);

    /// Creates an object id from a raw index.
    pub const fn new(id: u32) -> Self {
        ObjectId(id)
    }

    /// Returns the raw id as a `u32`.
    pub fn id(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<ObjectId> for u32 {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

/// A symbolic value (0 is the null/zero value).
///
/// Values carry no meaning by themselves: a value may be an address (when a
/// points-to edge starts from it), may have a known concrete interpretation
/// (see [`ExplicitValues`][crate::values::ExplicitValues]) or may be fully unknown.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Value(u32);

impl Value {
    /// The null/zero value.
    pub const NULL: Value = Value(0);

    /// Creates a value from a raw index.
    pub const fn new(id: u32) -> Self {
        Value(id)
    }

    /// Returns the raw id as a `u32`.
    pub fn id(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<Value> for u32 {
    fn from(value: Value) -> Self {
        value.0
    }
}

/// Source of fresh object ids and values.
///
/// The counters live inside each graph and are copied with it, so states
/// never share mutable state. Graphs forked from one parent keep the ids the
/// parent handed out; a join continues above the larger counters of its two
/// inputs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IdGenerator {
    next_object: u32,
    next_value: u32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next_object: 1,
            next_value: 1,
        }
    }

    /// Returns an object id this generator never handed out before.
    pub fn fresh_object(&mut self) -> ObjectId {
        let id = self.next_object;
        self.next_object += 1;
        ObjectId(id)
    }

    /// Returns a value this generator never handed out before.
    pub fn fresh_value(&mut self) -> Value {
        let id = self.next_value;
        self.next_value += 1;
        Value(id)
    }

    /// A generator above every id handed out by either input.
    pub fn max(self, other: IdGenerator) -> IdGenerator {
        IdGenerator {
            next_object: self.next_object.max(other.next_object),
            next_value: self.next_value.max(other.next_value),
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
