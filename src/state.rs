//! The abstract state handed to the analysis driver.
//!
//! [`SmgState`] wraps a [`HeapGraph`] together with the explicit values known
//! for its symbolic values and the sticky findings of the analyzed program.
//! Every operation returns a new state; the receiver is never changed.
//!
//! Memory-safety defects do not fail an operation. The refused access is
//! recorded as a flag on the returned state, queried later through
//! [`check_property`][SmgState::check_property]. Operations fail with an
//! [`SmgError`] only on misuse or when the consistency verifier, run at
//! [`SmgOptions::check_level`] after every mutation, finds a broken invariant.

use std::cmp::Ordering;

use num_bigint::BigInt;

use crate::abstraction::{abstract_lists, materialize, materialize_last};
use crate::edge::TargetSpecifier;
use crate::error::{Result, SmgError, Violation};
use crate::graph::HeapGraph;
use crate::join::{join_with_values, JoinMode, JoinStatus};
use crate::machine::MachineModel;
use crate::object::MemoryObject;
use crate::options::SmgOptions;
use crate::stack::FunctionDecl;
use crate::types::{ObjectId, Value};
use crate::values::ExplicitValues;
use crate::verifier::verify;

pub const HAS_INVALID_READS: &str = "has-invalid-reads";
pub const HAS_INVALID_WRITES: &str = "has-invalid-writes";
pub const HAS_INVALID_FREES: &str = "has-invalid-frees";
pub const HAS_LEAKS: &str = "has-leaks";

/// Every property name [`SmgState::check_property`] understands.
pub const PROPERTIES: [&str; 4] = [HAS_INVALID_READS, HAS_INVALID_WRITES, HAS_INVALID_FREES, HAS_LEAKS];

/// The outcome of comparing two pointers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PointerComparison {
    Less,
    Equal,
    Greater,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmgState {
    graph: HeapGraph,
    explicit: ExplicitValues,
    options: SmgOptions,
    invalid_read: bool,
    invalid_write: bool,
    invalid_free: bool,
}

impl SmgState {
    pub fn new(machine: MachineModel, options: SmgOptions) -> Self {
        Self {
            graph: HeapGraph::new(machine),
            explicit: ExplicitValues::new(),
            options,
            invalid_read: false,
            invalid_write: false,
            invalid_free: false,
        }
    }

    pub fn graph(&self) -> &HeapGraph {
        &self.graph
    }

    pub fn explicit_values(&self) -> &ExplicitValues {
        &self.explicit
    }

    pub fn options(&self) -> &SmgOptions {
        &self.options
    }

    pub fn machine(&self) -> &MachineModel {
        self.graph.machine()
    }

    fn with_graph(&self, graph: HeapGraph) -> Self {
        Self { graph, ..self.clone() }
    }

    /// Runs the consistency checks configured for this state.
    fn checked(self) -> Result<Self> {
        verify(&self.graph, self.options.check_level)?;
        Ok(self)
    }

    /// Writes and frees must target one concrete object, never a summary.
    fn concrete(&self, object: ObjectId) -> Result<()> {
        match self.graph.object(object) {
            Some(obj) if obj.is_summary() => Err(SmgError::AbstractAccess(object)),
            _ => Ok(()),
        }
    }

    fn with_finding(&self, violation: Violation) -> Self {
        log::warn!("{}: {}", self.options.finding_kind(), violation);
        let mut state = self.clone();
        match violation {
            Violation::InvalidRead => state.invalid_read = true,
            Violation::InvalidWrite => state.invalid_write = true,
            Violation::InvalidFree => state.invalid_free = true,
        }
        state
    }

    // ---------------------------------------------------------------------
    // Variables and frames
    // ---------------------------------------------------------------------

    pub fn add_global_variable(&self, size: u64, name: &str) -> Result<(Self, ObjectId)> {
        let (graph, id) = self.graph.add_global_object(size, name)?;
        Ok((self.with_graph(graph).checked()?, id))
    }

    pub fn add_local_variable(&self, size: u64, name: &str) -> Result<(Self, ObjectId)> {
        let (graph, id) = self.graph.add_stack_object(size, name)?;
        Ok((self.with_graph(graph).checked()?, id))
    }

    pub fn push_frame(&self, decl: &FunctionDecl) -> Result<Self> {
        self.with_graph(self.graph.push_frame(decl)?).checked()
    }

    pub fn pop_frame(&self) -> Result<Self> {
        self.with_graph(self.graph.pop_frame()?).checked()
    }

    /// The object a variable name resolves to: locals of the innermost frame first, then globals.
    pub fn visible_object(&self, name: &str) -> Option<ObjectId> {
        self.graph.visible_object(name)
    }

    /// The object holding the return value of the innermost function.
    pub fn return_object(&self) -> Option<ObjectId> {
        self.graph.current_frame().and_then(|frame| frame.return_object())
    }

    pub fn stack_depth(&self) -> usize {
        self.graph.stack_depth()
    }

    // ---------------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------------

    /// `malloc`: a fresh heap object and its address.
    pub fn alloc_heap(&self, size: u64, label: &str) -> Result<(Self, Value)> {
        let (graph, id) = self.graph.add_heap_object(size, label);
        let (graph, address) = graph.add_address(id, 0, TargetSpecifier::Region);
        Ok((self.with_graph(graph).checked()?, address))
    }

    /// `alloca`: a fresh object in the innermost frame and its address.
    pub fn alloc_stack(&self, size: u64, label: &str) -> Result<(Self, Value)> {
        let (graph, id) = self.graph.add_stack_object(size, label)?;
        let (graph, address) = graph.add_address(id, 0, TargetSpecifier::Region);
        Ok((self.with_graph(graph).checked()?, address))
    }

    /// Memory handed to the analyzed code by its environment.
    pub fn add_external_allocation(&self, label: &str) -> Result<(Self, Value)> {
        let (mut graph, id) = self.graph.add_heap_object(self.options.external_allocation_size, label);
        let obj = graph.object_or_err(id)?.clone();
        graph.set_object_mut(MemoryObject {
            externally_allocated: true,
            ..obj
        });
        let (graph, address) = graph.add_address(id, 0, TargetSpecifier::Region);
        Ok((self.with_graph(graph).checked()?, address))
    }

    // ---------------------------------------------------------------------
    // Memory access
    // ---------------------------------------------------------------------

    /// Reads a field. `None` when nothing is known about it or the read was refused.
    pub fn read(&self, object: ObjectId, offset: u64, size: u64) -> Result<(Self, Option<Value>)> {
        match self.graph.read(object, offset, size) {
            Ok(value) => Ok((self.clone(), value)),
            Err(violation) => Ok((self.with_finding(violation), None)),
        }
    }

    /// Reads a field, making up a fresh value for it when nothing is known.
    ///
    /// A pointer read from externally allocated memory yields the address of
    /// another external allocation, labelled after the field it came from.
    pub fn force_read(&self, object: ObjectId, offset: u64, size: u64, is_pointer: bool) -> Result<(Self, Value)> {
        let obj = match self.graph.read(object, offset, size) {
            Ok(Some(value)) => return Ok((self.clone(), value)),
            Ok(None) => self.graph.object_or_err(object)?,
            Err(violation) => {
                let state = self.with_finding(violation);
                let (graph, value) = state.graph.add_value();
                return Ok((state.with_graph(graph), value));
            }
        };
        // One field of a summary stands for a field in every element: nothing is stored.
        if obj.is_summary() {
            let (graph, value) = self.graph.add_value();
            return Ok((self.with_graph(graph), value));
        }

        let (state, value) = if is_pointer && obj.externally_allocated {
            self.add_external_allocation(&format!("r_{}_{}", offset, obj.label))?
        } else {
            let (graph, value) = self.graph.add_value();
            (self.with_graph(graph), value)
        };
        let state = state.write(object, offset, size, value)?;
        log::trace!("forced read of {} at [{}, {}) to {}", object, offset, offset.saturating_add(size), value);
        Ok((state, value))
    }

    pub fn write(&self, object: ObjectId, offset: u64, size: u64, value: Value) -> Result<Self> {
        self.concrete(object)?;
        match self.graph.write(object, offset, size, value) {
            Ok(graph) => self.with_graph(graph).checked(),
            Err(violation) => Ok(self.with_finding(violation)),
        }
    }

    /// Stores the address `target + target_offset` into a pointer-sized field.
    pub fn write_address(&self, object: ObjectId, offset: u64, target: ObjectId, target_offset: u64) -> Result<Self> {
        let (state, address) = self.address_of(target, target_offset)?;
        let size = self.machine().pointer_size();
        state.write(object, offset, size, address)
    }

    /// Finds or creates the value denoting `object + offset`.
    ///
    /// The address of a segment designates its first element.
    pub fn address_of(&self, object: ObjectId, offset: u64) -> Result<(Self, Value)> {
        let obj = self.graph.object_or_err(object)?;
        let target = if obj.is_abstract() {
            TargetSpecifier::First
        } else {
            TargetSpecifier::Region
        };
        let (graph, address) = self.graph.add_address(object, offset, target);
        Ok((self.with_graph(graph), address))
    }

    /// Resolves a pointer to the object and offset it designates.
    ///
    /// A pointer to the first or last element of a segment materializes that
    /// element, and every feasible outcome comes back as its own state. A
    /// pointer to some inner element, or into the sub-objects a segment
    /// summarizes, has no single target.
    pub fn dereference(&self, pointer: Value) -> Result<Vec<(SmgState, ObjectId, u64)>> {
        let pt = *self.graph.pointer(pointer).ok_or(SmgError::NotAPointer(pointer))?;
        let obj = self.graph.object_or_err(pt.object)?;
        if obj.nesting_level > 0 {
            return Err(SmgError::AbstractAccess(pt.object));
        }
        if !obj.is_abstract() {
            return Ok(vec![(self.clone(), pt.object, pt.offset)]);
        }
        let materialized = match pt.target {
            TargetSpecifier::First | TargetSpecifier::Region => materialize(&self.graph, pt.object)?,
            TargetSpecifier::Last => materialize_last(&self.graph, pt.object)?,
            TargetSpecifier::All => return Err(SmgError::AmbiguousTarget(pointer)),
        };
        let region = materialized.region;
        materialized
            .into_graphs()
            .into_iter()
            .map(|graph| Ok((self.with_graph(graph).checked()?, region, pt.offset)))
            .collect()
    }

    /// `free(object + offset)`.
    pub fn free(&self, object: ObjectId, offset: u64) -> Result<Self> {
        self.concrete(object)?;
        match self.graph.free(object, offset) {
            Ok(graph) => self.with_graph(graph).checked(),
            Err(violation) => Ok(self.with_finding(violation)),
        }
    }

    /// `free(pointer)`: freeing null does nothing, freeing a non-address is invalid.
    pub fn free_address(&self, pointer: Value) -> Result<Vec<Self>> {
        if pointer.is_null() {
            return Ok(vec![self.clone()]);
        }
        if !self.graph.is_pointer(pointer) {
            return Ok(vec![self.with_finding(Violation::InvalidFree)]);
        }
        self.dereference(pointer)?
            .into_iter()
            .map(|(state, object, offset)| state.free(object, offset))
            .collect()
    }

    /// `memcpy` of `[source_offset, source_end)` of `source` to `target + target_offset`.
    pub fn copy(&self, source: ObjectId, target: ObjectId, source_offset: u64, source_end: u64, target_offset: u64) -> Result<Self> {
        self.concrete(target)?;
        match self.graph.copy_range(source, target, source_offset, source_end, target_offset) {
            Ok(graph) => self.with_graph(graph).checked(),
            Err(violation) => Ok(self.with_finding(violation)),
        }
    }

    // ---------------------------------------------------------------------
    // Values
    // ---------------------------------------------------------------------

    /// Records that `value` equals `n`. A value already bound to `n` absorbs `value`.
    pub fn put_explicit(&self, value: Value, n: BigInt) -> Result<Self> {
        let (explicit, existing) = self.explicit.insert(value, n);
        let state = match existing {
            Some(existing) => Self {
                graph: self.graph.merge_values(existing, value),
                explicit: explicit.remove(value),
                ..self.clone()
            },
            None => Self { explicit, ..self.clone() },
        };
        state.checked()
    }

    pub fn explicit(&self, value: Value) -> Option<&BigInt> {
        self.explicit.get(value)
    }

    /// The value known to equal `n`, created if there is none yet.
    pub fn value_for_explicit(&self, n: BigInt) -> (Self, Value) {
        if let Some(value) = self.explicit.value_for(&n) {
            return (self.clone(), value);
        }
        let (graph, value) = self.graph.add_value();
        let explicit = self.explicit.insert(value, n).0;
        (Self { graph, explicit, ..self.clone() }, value)
    }

    pub fn remove_explicit(&self, value: Value) -> Self {
        Self {
            explicit: self.explicit.remove(value),
            ..self.clone()
        }
    }

    /// Whether `a` and `b` are known to differ.
    pub fn are_unequal(&self, a: Value, b: Value) -> bool {
        if a == b {
            return false;
        }
        if self.graph.are_unequal(a, b) || (self.explicit.contains(a) && self.explicit.contains(b)) {
            return true;
        }
        match (self.graph.pointer(a), self.graph.pointer(b)) {
            (Some(pa), Some(pb)) if pa.object != pb.object => true,
            (Some(pa), Some(pb)) => {
                let is_abstract = self.graph.object(pa.object).is_some_and(|o| o.is_abstract());
                pa.offset != pb.offset && (!is_abstract || pa.target == pb.target)
            }
            _ => false,
        }
    }

    /// Restricts the state to `a == b`. `None` when they are known to differ.
    pub fn assume_equal(&self, a: Value, b: Value) -> Result<Option<Self>> {
        if a == b {
            return Ok(Some(self.clone()));
        }
        if self.are_unequal(a, b) {
            log::debug!("assumption {} == {} is infeasible", a, b);
            return Ok(None);
        }
        let keep_b = b.is_null() || (self.graph.is_pointer(b) && !self.graph.is_pointer(a));
        let (kept, removed) = if keep_b { (b, a) } else { (a, b) };
        let explicit = if self.explicit.contains(kept) {
            self.explicit.remove(removed)
        } else {
            self.explicit.rename(removed, kept)
        };
        let state = Self {
            graph: self.graph.merge_values(kept, removed),
            explicit,
            ..self.clone()
        };
        Ok(Some(state.checked()?))
    }

    /// Restricts the state to `a != b`. `None` when they are the same value.
    pub fn assume_unequal(&self, a: Value, b: Value) -> Result<Option<Self>> {
        if a == b {
            log::debug!("assumption {} != {} is infeasible", a, b);
            return Ok(None);
        }
        if self.are_unequal(a, b) {
            return Ok(Some(self.clone()));
        }
        Ok(Some(self.with_graph(self.graph.add_disequality(a, b)).checked()?))
    }

    pub fn compare_pointers(&self, a: Value, b: Value) -> PointerComparison {
        if a == b {
            return PointerComparison::Equal;
        }
        match (self.graph.pointer(a), self.graph.pointer(b)) {
            (Some(pa), Some(pb)) if pa.object == pb.object && pa.target == pb.target => match pa.offset.cmp(&pb.offset) {
                Ordering::Less => PointerComparison::Less,
                Ordering::Equal => PointerComparison::Equal,
                Ordering::Greater => PointerComparison::Greater,
            },
            _ => PointerComparison::Unknown,
        }
    }

    // ---------------------------------------------------------------------
    // Garbage and abstraction
    // ---------------------------------------------------------------------

    fn retain_known_values(self) -> Self {
        let explicit = self.explicit.retain(|v| self.graph.contains_value(v));
        Self { explicit, ..self }
    }

    /// Drops unreachable objects; a dropped heap object sets the leak flag.
    pub fn prune_unreachable(&self) -> Result<Self> {
        let graph = self.graph.prune_unreachable();
        if graph.has_leaks() && !self.graph.has_leaks() {
            log::warn!("{}: memory leak", self.options.finding_kind());
        }
        self.with_graph(graph).retain_known_values().checked()
    }

    /// Summarizes list chains until none is left.
    pub fn abstract_lists(&self) -> Result<Self> {
        let graph = abstract_lists(&self.graph, &self.options.abstraction);
        self.with_graph(graph).retain_known_values().checked()
    }

    // ---------------------------------------------------------------------
    // Findings
    // ---------------------------------------------------------------------

    pub fn has_invalid_read(&self) -> bool {
        self.invalid_read
    }

    pub fn has_invalid_write(&self) -> bool {
        self.invalid_write
    }

    pub fn has_invalid_free(&self) -> bool {
        self.invalid_free
    }

    pub fn has_leaks(&self) -> bool {
        self.graph.has_leaks()
    }

    fn flags(&self) -> [bool; 4] {
        [self.invalid_read, self.invalid_write, self.invalid_free, self.has_leaks()]
    }

    pub fn check_property(&self, name: &str) -> Result<bool> {
        match name {
            HAS_INVALID_READS => Ok(self.invalid_read),
            HAS_INVALID_WRITES => Ok(self.invalid_write),
            HAS_INVALID_FREES => Ok(self.invalid_free),
            HAS_LEAKS => Ok(self.has_leaks()),
            _ => Err(SmgError::InvalidQuery(name.to_string())),
        }
    }

    /// Names of the properties that hold.
    pub fn properties(&self) -> Vec<&'static str> {
        PROPERTIES.iter().zip(self.flags()).filter(|(_, holds)| *holds).map(|(name, _)| *name).collect()
    }

    /// The same state with the access findings reset. Leaks stay.
    pub fn clean_property(&self) -> Self {
        Self {
            invalid_read: false,
            invalid_write: false,
            invalid_free: false,
            ..self.clone()
        }
    }

    // ---------------------------------------------------------------------
    // Lattice
    // ---------------------------------------------------------------------

    /// Whether every concrete state of `self` is a state of `other`.
    pub fn is_less_or_equal(&self, other: &SmgState) -> bool {
        let implied = self.flags().into_iter().zip(other.flags()).all(|(mine, theirs)| !mine || theirs);
        implied
            && join_with_values(&self.graph, &self.explicit, &other.graph, &other.explicit, JoinMode::Inclusion)
                .is_some_and(|joined| joined.status.left_is_less_or_equal())
    }

    /// Joins two states. `None` when their findings differ or their graphs do not join.
    pub fn join(&self, other: &SmgState) -> Result<Option<(Self, JoinStatus)>> {
        if self.flags() != other.flags() {
            return Ok(None);
        }
        let Some(joined) = join_with_values(&self.graph, &self.explicit, &other.graph, &other.explicit, JoinMode::Join) else {
            return Ok(None);
        };
        let state = Self {
            graph: joined.graph,
            explicit: joined.explicit,
            ..self.clone()
        };
        Ok(Some((state.checked()?, joined.status)))
    }
}
