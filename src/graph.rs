//! The symbolic memory graph of one program state.
//!
//! A [`HeapGraph`] owns every object, field edge, pointer edge and stack frame
//! of one abstract memory configuration. All tables are persistent `rpds`
//! structures: cloning a graph is cheap, and every public mutator returns a
//! new graph that shares the untouched parts with its input. Internally the
//! mutators work on such a clone through `*_mut` helpers.
//!
//! # Fields and zero fillers
//!
//! A [`HasValueEdge`] says that `size` bytes at `offset` hold a value. Edges
//! carrying the null value double as zero fillers: bytes covered by them are
//! known to be zero whatever the type of a later read. A write removes every
//! edge it overlaps, except zero fillers, which are cut down to the bytes the
//! write leaves untouched.
//!
//! # Findings
//!
//! Refused accesses are reported as [`Violation`]s instead of errors; the
//! façade turns them into sticky flags.

use std::collections::{BTreeSet, VecDeque};

use rpds::{RedBlackTreeMap, RedBlackTreeMapSync, RedBlackTreeSet, RedBlackTreeSetSync, Vector, VectorSync};

use crate::bitset::ByteMask;
use crate::edge::{HasValueEdge, PointsToEdge, TargetSpecifier};
use crate::error::{Result, SmgError, Violation};
use crate::machine::MachineModel;
use crate::object::{MemoryObject, Storage};
use crate::stack::{FunctionDecl, StackFrame, RETVAL_LABEL};
use crate::types::{IdGenerator, ObjectId, Value};
use crate::values::NeqRelation;

#[derive(Debug, Clone)]
pub struct HeapGraph {
    machine: MachineModel,
    ids: IdGenerator,
    objects: RedBlackTreeMapSync<ObjectId, MemoryObject>,
    values: RedBlackTreeSetSync<Value>,
    hv_edges: RedBlackTreeMapSync<ObjectId, RedBlackTreeSetSync<HasValueEdge>>,
    pt_edges: RedBlackTreeMapSync<Value, PointsToEdge>,
    neq: NeqRelation,
    globals: RedBlackTreeMapSync<String, ObjectId>,
    frames: VectorSync<StackFrame>,
    heap: RedBlackTreeSetSync<ObjectId>,
    has_leaks: bool,
}

impl HeapGraph {
    /// An empty graph: only the null object and the null address.
    pub fn new(machine: MachineModel) -> Self {
        Self::with_ids(machine, IdGenerator::new())
    }

    /// An empty graph drawing fresh ids from `ids`.
    pub fn with_ids(machine: MachineModel, ids: IdGenerator) -> Self {
        let null = MemoryObject::null();
        Self {
            machine,
            ids,
            objects: RedBlackTreeMap::new_sync().insert(null.id, null),
            values: RedBlackTreeSet::new_sync().insert(Value::NULL),
            hv_edges: RedBlackTreeMap::new_sync(),
            pt_edges: RedBlackTreeMap::new_sync().insert(
                Value::NULL,
                PointsToEdge::new(Value::NULL, ObjectId::NULL, 0, TargetSpecifier::Region),
            ),
            neq: NeqRelation::new(),
            globals: RedBlackTreeMap::new_sync(),
            frames: Vector::new_sync(),
            heap: RedBlackTreeSet::new_sync(),
            has_leaks: false,
        }
    }

    pub fn machine(&self) -> &MachineModel {
        &self.machine
    }

    /// The counters fresh ids are drawn from.
    pub(crate) fn ids(&self) -> IdGenerator {
        self.ids
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn object(&self, id: ObjectId) -> Option<&MemoryObject> {
        self.objects.get(&id)
    }

    pub(crate) fn object_or_err(&self, id: ObjectId) -> Result<&MemoryObject> {
        self.objects.get(&id).ok_or(SmgError::UnknownObject(id))
    }

    /// All objects, the null object included, in id order.
    pub fn objects(&self) -> impl Iterator<Item = &MemoryObject> {
        self.objects.values()
    }

    pub fn contains_object(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Heap objects, in id order.
    pub fn heap_objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.heap.iter().copied()
    }

    pub fn is_heap_object(&self, id: ObjectId) -> bool {
        self.heap.contains(&id)
    }

    pub fn global(&self, name: &str) -> Option<ObjectId> {
        self.globals.get(name).copied()
    }

    pub fn globals(&self) -> impl Iterator<Item = (&str, ObjectId)> {
        self.globals.iter().map(|(name, id)| (name.as_str(), *id))
    }

    /// Frames from the outermost to the innermost.
    pub fn frames(&self) -> impl Iterator<Item = &StackFrame> {
        self.frames.iter()
    }

    pub fn current_frame(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    pub fn stack_depth(&self) -> usize {
        self.frames.len()
    }

    /// The object a variable name resolves to in the current scope.
    pub fn visible_object(&self, name: &str) -> Option<ObjectId> {
        if let Some(frame) = self.frames.last() {
            if let Some(id) = frame.variable(name) {
                return Some(id);
            }
            if name == RETVAL_LABEL {
                return frame.return_object();
            }
        }
        self.global(name)
    }

    pub fn is_valid(&self, id: ObjectId) -> bool {
        self.object(id).is_some_and(|o| o.valid)
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.values.iter().copied()
    }

    pub fn contains_value(&self, value: Value) -> bool {
        self.values.contains(&value)
    }

    /// Field edges of one object, ordered by offset.
    pub fn hv_edges_of(&self, object: ObjectId) -> impl Iterator<Item = &HasValueEdge> {
        self.hv_edges.get(&object).into_iter().flat_map(|set| set.iter())
    }

    /// Every field edge of the graph.
    pub fn hv_edges(&self) -> impl Iterator<Item = &HasValueEdge> {
        self.hv_edges.values().flat_map(|set| set.iter())
    }

    /// The edge describing exactly the field `(offset, size)`, if present.
    pub fn hv_edge_at(&self, object: ObjectId, offset: u64, size: u64) -> Option<&HasValueEdge> {
        self.hv_edges_of(object).find(|e| e.offset == offset && e.size == size)
    }

    /// Field edges holding `value`, anywhere in the graph.
    pub fn edges_with_value(&self, value: Value) -> Vec<HasValueEdge> {
        self.hv_edges().filter(|e| e.value == value).copied().collect()
    }

    pub fn pointer(&self, value: Value) -> Option<&PointsToEdge> {
        self.pt_edges.get(&value)
    }

    pub fn is_pointer(&self, value: Value) -> bool {
        self.pt_edges.contains_key(&value)
    }

    pub fn pt_edges(&self) -> impl Iterator<Item = &PointsToEdge> {
        self.pt_edges.values()
    }

    /// The value whose points-to edge designates exactly this address.
    pub fn address_of(&self, object: ObjectId, offset: u64, target: TargetSpecifier) -> Option<Value> {
        self.pt_edges
            .values()
            .find(|pt| pt.object == object && pt.offset == offset && pt.target == target)
            .map(|pt| pt.value)
    }

    /// Points-to edges targeting `object`.
    pub fn pointers_to(&self, object: ObjectId) -> Vec<PointsToEdge> {
        self.pt_edges.values().filter(|pt| pt.object == object).copied().collect()
    }

    /// Field edges holding an address of `object`.
    pub fn incoming_edges(&self, object: ObjectId) -> Vec<HasValueEdge> {
        self.hv_edges()
            .filter(|e| self.pointer(e.value).is_some_and(|pt| pt.object == object))
            .copied()
            .collect()
    }

    pub fn neq(&self) -> &NeqRelation {
        &self.neq
    }

    pub fn are_unequal(&self, a: Value, b: Value) -> bool {
        self.neq.contains(a, b)
    }

    pub fn has_leaks(&self) -> bool {
        self.has_leaks
    }

    /// Bytes of `object` known to be zero.
    pub fn null_bytes(&self, object: ObjectId) -> ByteMask {
        self.hv_edges_of(object).filter(|e| e.is_zero()).map(|e| e.range()).collect()
    }

    pub fn is_covered_by_zero(&self, object: ObjectId, offset: u64, size: u64) -> bool {
        self.null_bytes(object).contains_range(offset..offset.saturating_add(size))
    }

    // ---------------------------------------------------------------------
    // Field access
    // ---------------------------------------------------------------------

    fn accessible_object(&self, id: ObjectId, offset: u64, size: u64) -> Option<&MemoryObject> {
        self.object(id)
            .filter(|o| o.is_accessible() && offset.checked_add(size).is_some_and(|end| end <= o.size))
    }

    /// Reads the field `(offset, size)` of `object`.
    ///
    /// Returns `Ok(None)` when nothing is known about the field.
    pub fn read(&self, object: ObjectId, offset: u64, size: u64) -> Result<Option<Value>, Violation> {
        if self.accessible_object(object, offset, size).is_none() {
            log::debug!("refused read of {} at [{}, {})", object, offset, offset.saturating_add(size));
            return Err(Violation::InvalidRead);
        }
        if let Some(edge) = self.hv_edge_at(object, offset, size) {
            return Ok(Some(edge.value));
        }
        if self.is_covered_by_zero(object, offset, size) {
            return Ok(Some(Value::NULL));
        }
        Ok(None)
    }

    /// Writes `value` into the field `(offset, size)` of `object`.
    pub fn write(&self, object: ObjectId, offset: u64, size: u64, value: Value) -> Result<Self, Violation> {
        if self.accessible_object(object, offset, size).is_none() {
            log::debug!("refused write of {} to {} at [{}, {})", value, object, offset, offset.saturating_add(size));
            return Err(Violation::InvalidWrite);
        }
        let mut graph = self.clone();
        graph.write_mut(HasValueEdge::new(object, offset, size, value));
        Ok(graph)
    }

    /// Copies the edges of `source` lying in `[source_offset, source_end)` to
    /// `target`, shifted to start at `target_offset`.
    pub fn copy_range(
        &self,
        source: ObjectId,
        target: ObjectId,
        source_offset: u64,
        source_end: u64,
        target_offset: u64,
    ) -> Result<Self, Violation> {
        let len = source_end.saturating_sub(source_offset);
        if self.accessible_object(source, source_offset, len).is_none() {
            return Err(Violation::InvalidRead);
        }
        if self.accessible_object(target, target_offset, len).is_none() {
            return Err(Violation::InvalidWrite);
        }
        let copied: Vec<HasValueEdge> = self
            .hv_edges_of(source)
            .filter(|e| e.offset >= source_offset && e.end() <= source_end)
            .copied()
            .collect();
        let mut graph = self.clone();
        graph.clear_range_mut(target, target_offset, target_offset + len);
        for edge in copied {
            graph.write_mut(edge.relocated(target, edge.offset - source_offset + target_offset));
        }
        log::trace!("copied {} bytes from {} to {}", len, source, target);
        Ok(graph)
    }

    /// Releases a heap (or externally allocated) object.
    pub fn free(&self, object: ObjectId, offset: u64) -> Result<Self, Violation> {
        let Some(obj) = self.object(object) else {
            return Err(Violation::InvalidFree);
        };
        if !obj.is_heap() && !obj.externally_allocated {
            log::debug!("refused free of non-heap object {}", obj);
            return Err(Violation::InvalidFree);
        }
        if offset != 0 {
            log::debug!("refused free of {} at offset {}", obj, offset);
            return Err(Violation::InvalidFree);
        }
        if !obj.valid {
            log::debug!("refused free of already released {}", obj);
            return Err(Violation::InvalidFree);
        }
        let mut released = obj.clone();
        released.valid = false;
        released.externally_allocated = false;
        let mut graph = self.clone();
        graph.set_object_mut(released);
        graph.hv_edges.remove_mut(&object);
        log::debug!("freed {}", object);
        Ok(graph)
    }

    // ---------------------------------------------------------------------
    // Objects and frames
    // ---------------------------------------------------------------------

    /// Adds a fresh valid region.
    ///
    /// Global and stack objects are registered under `label` in the globals
    /// or in the innermost frame.
    pub fn add_object(&self, size: u64, label: &str, storage: Storage) -> Result<(Self, ObjectId)> {
        match storage {
            Storage::Heap => Ok(self.add_heap_object(size, label)),
            Storage::Global => self.add_global_object(size, label),
            Storage::Stack(_) => self.add_stack_object(size, label),
        }
    }

    pub fn add_heap_object(&self, size: u64, label: &str) -> (Self, ObjectId) {
        let mut graph = self.clone();
        let id = graph.ids.fresh_object();
        graph.insert_object_mut(MemoryObject::region(id, size, label, Storage::Heap));
        log::debug!("allocated heap object {} ({} bytes, '{}')", id, size, label);
        (graph, id)
    }

    pub fn add_global_object(&self, size: u64, name: &str) -> Result<(Self, ObjectId)> {
        if self.globals.contains_key(name) {
            return Err(SmgError::DuplicateGlobal(name.to_string()));
        }
        let mut graph = self.clone();
        let id = graph.ids.fresh_object();
        graph.insert_object_mut(MemoryObject::region(id, size, name, Storage::Global));
        graph.globals.insert_mut(name.to_string(), id);
        Ok((graph, id))
    }

    /// Declares a local variable in the innermost frame.
    pub fn add_stack_object(&self, size: u64, name: &str) -> Result<(Self, ObjectId)> {
        let frame = self.frames.last().ok_or(SmgError::NoStackFrame)?;
        if frame.contains_variable(name) {
            return Err(SmgError::DuplicateVariable {
                function: frame.function().to_string(),
                name: name.to_string(),
            });
        }
        let depth = self.frames.len() - 1;
        let mut graph = self.clone();
        let id = graph.ids.fresh_object();
        graph.insert_object_mut(MemoryObject::region(id, size, name, Storage::Stack(depth)));
        let frame = frame.with_variable(name, id);
        graph.frames.set_mut(depth, frame);
        Ok((graph, id))
    }

    /// Enters a function: a new frame with one object per parameter and,
    /// unless the function returns `void`, a return object.
    pub fn push_frame(&self, decl: &FunctionDecl) -> Result<Self> {
        let mut graph = self.clone();
        let depth = graph.frames.len();
        let return_object = decl.return_type.as_ref().map(|ty| {
            let id = graph.ids.fresh_object();
            let size = graph.machine.size_of(ty);
            graph.insert_object_mut(MemoryObject::region(id, size, RETVAL_LABEL, Storage::Stack(depth)));
            id
        });
        graph.frames.push_back_mut(StackFrame::new(decl.name.as_str(), return_object));
        for (name, ty) in &decl.parameters {
            let size = graph.machine.size_of(ty);
            graph = graph.add_stack_object(size, name)?.0;
        }
        log::debug!("entered '{}' at depth {}", decl.name, depth);
        Ok(graph)
    }

    /// Leaves the innermost function.
    ///
    /// The frame's objects drop out of scope but stay valid: addresses of
    /// locals that escaped can still be dereferenced. Unreachable ones go away
    /// at the next [`prune_unreachable`][Self::prune_unreachable].
    pub fn pop_frame(&self) -> Result<Self> {
        let mut graph = self.clone();
        let frame = graph.frames.last().cloned().ok_or(SmgError::NoStackFrame)?;
        graph.frames.drop_last_mut();
        log::debug!("left '{}'", frame.function());
        Ok(graph)
    }

    // ---------------------------------------------------------------------
    // Values
    // ---------------------------------------------------------------------

    /// Adds a fresh symbolic value.
    pub fn add_value(&self) -> (Self, Value) {
        let mut graph = self.clone();
        let value = graph.fresh_value_mut();
        (graph, value)
    }

    /// Finds or creates the value denoting the given address.
    pub fn add_address(&self, object: ObjectId, offset: u64, target: TargetSpecifier) -> (Self, Value) {
        let mut graph = self.clone();
        let value = graph.address_mut(object, offset, target);
        (graph, value)
    }

    /// Identifies `removed` with `kept`: every use of `removed` now refers to `kept`.
    pub fn merge_values(&self, kept: Value, removed: Value) -> Self {
        let mut graph = self.clone();
        graph.merge_values_mut(kept, removed);
        graph
    }

    pub fn add_disequality(&self, a: Value, b: Value) -> Self {
        let mut graph = self.clone();
        graph.neq.add(a, b);
        graph
    }

    // ---------------------------------------------------------------------
    // Garbage
    // ---------------------------------------------------------------------

    /// Objects reachable from globals and frame objects along pointers.
    pub fn reachable_objects(&self) -> BTreeSet<ObjectId> {
        let roots = self.globals.values().copied().chain(self.frames.iter().flat_map(|f| f.objects()));
        self.reachable_from(roots)
    }

    fn reachable_from(&self, roots: impl IntoIterator<Item = ObjectId>) -> BTreeSet<ObjectId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        for root in roots {
            if seen.insert(root) {
                queue.push_back(root);
            }
        }
        while let Some(object) = queue.pop_front() {
            for edge in self.hv_edges_of(object) {
                if let Some(pt) = self.pointer(edge.value) {
                    if !pt.object.is_null() && seen.insert(pt.object) {
                        queue.push_back(pt.object);
                    }
                }
            }
        }
        seen
    }

    /// Removes every object unreachable from the roots, and every value no
    /// field holds anymore. A valid heap object removed this way was leaked.
    pub fn prune_unreachable(&self) -> Self {
        let reachable = self.reachable_objects();
        let stray: Vec<ObjectId> = self
            .objects
            .keys()
            .copied()
            .filter(|id| !id.is_null() && !reachable.contains(id))
            .collect();

        let mut graph = self.clone();

        // Memory reachable from an external allocation belongs to the environment.
        let external_roots = stray.iter().copied().filter(|id| self.object(*id).is_some_and(|o| o.externally_allocated));
        for id in self.reachable_from(external_roots) {
            if let Some(obj) = graph.object(id).filter(|o| !o.externally_allocated).cloned() {
                graph.set_object_mut(MemoryObject {
                    externally_allocated: true,
                    ..obj
                });
            }
        }

        for id in &stray {
            if let Some(obj) = graph.object(*id) {
                if obj.valid && !obj.externally_allocated && obj.is_heap() {
                    log::debug!("memory leak: {} is unreachable", obj);
                    graph.has_leaks = true;
                }
            }
            graph.remove_object_mut(*id);
        }

        let used: BTreeSet<Value> = graph.hv_edges().map(|e| e.value).collect();
        let stray_values: Vec<Value> = graph.values().filter(|v| !v.is_null() && !used.contains(v)).collect();
        for value in &stray_values {
            graph.remove_value_mut(*value);
        }

        if !stray.is_empty() || !stray_values.is_empty() {
            log::debug!("pruned {} objects and {} values", stray.len(), stray_values.len());
        }
        graph
    }

    // ---------------------------------------------------------------------
    // In-place helpers for code that builds a graph step by step
    // ---------------------------------------------------------------------

    pub(crate) fn fresh_value_mut(&mut self) -> Value {
        let value = self.ids.fresh_value();
        self.values.insert_mut(value);
        value
    }

    pub(crate) fn fresh_object_id(&mut self) -> ObjectId {
        self.ids.fresh_object()
    }

    pub(crate) fn add_value_mut(&mut self, value: Value) {
        self.values.insert_mut(value);
    }

    /// Removes a value together with its points-to edge and disequalities.
    pub(crate) fn remove_value_mut(&mut self, value: Value) {
        if value.is_null() {
            return;
        }
        self.values.remove_mut(&value);
        self.pt_edges.remove_mut(&value);
        self.neq.remove_value(value);
    }

    pub(crate) fn add_disequality_mut(&mut self, a: Value, b: Value) {
        self.neq.add(a, b);
    }

    /// Inserts a new object, registering heap objects in the heap set.
    pub(crate) fn insert_object_mut(&mut self, object: MemoryObject) {
        if object.is_heap() && !object.is_null() {
            self.heap.insert_mut(object.id);
        }
        self.objects.insert_mut(object.id, object);
    }

    /// Replaces the attributes of an existing object.
    pub(crate) fn set_object_mut(&mut self, object: MemoryObject) {
        self.objects.insert_mut(object.id, object);
    }

    /// Removes an object and its field edges. Pointers to it are left alone.
    pub(crate) fn remove_object_mut(&mut self, id: ObjectId) {
        if id.is_null() {
            return;
        }
        if let Some(obj) = self.objects.get(&id) {
            if obj.storage == Storage::Global {
                let label = obj.label.clone();
                self.globals.remove_mut(&label);
            }
        }
        self.objects.remove_mut(&id);
        self.hv_edges.remove_mut(&id);
        self.heap.remove_mut(&id);
    }

    pub(crate) fn add_global_mut(&mut self, name: &str, id: ObjectId) {
        self.globals.insert_mut(name.to_string(), id);
    }

    pub(crate) fn push_frame_mut(&mut self, frame: StackFrame) {
        self.frames.push_back_mut(frame);
    }

    pub(crate) fn set_leak_mut(&mut self, leak: bool) {
        self.has_leaks = leak;
    }

    /// Inserts a field edge as is, without overlap handling.
    pub(crate) fn insert_hv_mut(&mut self, edge: HasValueEdge) {
        self.values.insert_mut(edge.value);
        let set = self.hv_edges.get(&edge.object).cloned().unwrap_or_default();
        self.hv_edges.insert_mut(edge.object, set.insert(edge));
    }

    pub(crate) fn remove_hv_mut(&mut self, edge: &HasValueEdge) {
        if let Some(set) = self.hv_edges.get(&edge.object) {
            let set = set.remove(edge);
            if set.is_empty() {
                self.hv_edges.remove_mut(&edge.object);
            } else {
                self.hv_edges.insert_mut(edge.object, set);
            }
        }
    }

    pub(crate) fn insert_pt_mut(&mut self, edge: PointsToEdge) {
        self.values.insert_mut(edge.value);
        self.pt_edges.insert_mut(edge.value, edge);
    }

    /// Finds or creates the value for an address.
    pub(crate) fn address_mut(&mut self, object: ObjectId, offset: u64, target: TargetSpecifier) -> Value {
        if let Some(value) = self.address_of(object, offset, target) {
            return value;
        }
        let value = self.fresh_value_mut();
        self.insert_pt_mut(PointsToEdge::new(value, object, offset, target));
        value
    }

    /// Removes the edges overlapping `[start, end)`, cutting zero fillers
    /// down to the bytes outside the range.
    pub(crate) fn clear_range_mut(&mut self, object: ObjectId, start: u64, end: u64) {
        let overlapping: Vec<HasValueEdge> = self.hv_edges_of(object).filter(|e| e.overlaps_range(start, end)).copied().collect();
        for edge in overlapping {
            self.remove_hv_mut(&edge);
            if edge.is_zero() {
                if edge.offset < start {
                    self.insert_hv_mut(HasValueEdge::new(object, edge.offset, start - edge.offset, Value::NULL));
                }
                if edge.end() > end {
                    self.insert_hv_mut(HasValueEdge::new(object, end, edge.end() - end, Value::NULL));
                }
            }
        }
    }

    /// Writes a field without access checks.
    pub(crate) fn write_mut(&mut self, edge: HasValueEdge) {
        if self.hv_edges.get(&edge.object).is_some_and(|set| set.contains(&edge)) {
            return;
        }
        self.clear_range_mut(edge.object, edge.offset, edge.end());
        log::trace!("write {}", edge);
        self.insert_hv_mut(edge);
    }

    pub(crate) fn merge_values_mut(&mut self, kept: Value, removed: Value) {
        if kept == removed {
            return;
        }
        for edge in self.edges_with_value(removed) {
            self.remove_hv_mut(&edge);
            self.insert_hv_mut(HasValueEdge { value: kept, ..edge });
        }
        if let Some(pt) = self.pt_edges.get(&removed).copied() {
            self.pt_edges.remove_mut(&removed);
            if !self.pt_edges.contains_key(&kept) {
                self.insert_pt_mut(PointsToEdge { value: kept, ..pt });
            } else if self.pt_edges.get(&kept).is_some_and(|other| other.object != pt.object || other.offset != pt.offset) {
                log::warn!("merged addresses {} and {} of different targets", kept, removed);
            }
        }
        self.neq.merge_values(kept, removed);
        self.values.remove_mut(&removed);
        self.values.insert_mut(kept);
    }
}

impl PartialEq for HeapGraph {
    /// Structural equality; the id generator is not compared.
    fn eq(&self, other: &Self) -> bool {
        self.machine == other.machine
            && self.objects == other.objects
            && self.values == other.values
            && self.hv_edges == other.hv_edges
            && self.pt_edges == other.pt_edges
            && self.neq == other.neq
            && self.globals == other.globals
            && self.frames == other.frames
            && self.heap == other.heap
            && self.has_leaks == other.has_leaks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::CType;
    use test_log::test;

    fn graph() -> HeapGraph {
        HeapGraph::new(MachineModel::LINUX64)
    }

    #[test]
    fn test_new_graph_has_null() {
        let g = graph();
        assert!(g.contains_object(ObjectId::NULL));
        assert!(!g.is_valid(ObjectId::NULL));
        let pt = g.pointer(Value::NULL).copied();
        assert_eq!(pt.map(|pt| pt.object), Some(ObjectId::NULL));
        assert_eq!(g.heap_objects().count(), 0);
    }

    #[test]
    fn test_write_read() {
        let (g, o) = graph().add_heap_object(8, "o");
        let (g, v) = g.add_value();
        let g = g.write(o, 0, 4, v).unwrap();
        assert_eq!(g.read(o, 0, 4), Ok(Some(v)));
        assert_eq!(g.read(o, 0, 2), Ok(None));
        assert_eq!(g.read(o, 4, 4), Ok(None));
    }

    #[test]
    fn test_persistence() {
        let (g0, o) = graph().add_heap_object(8, "o");
        let (g1, v) = g0.add_value();
        let g2 = g1.write(o, 0, 8, v).unwrap();
        assert_eq!(g1.read(o, 0, 8), Ok(None));
        assert_eq!(g2.read(o, 0, 8), Ok(Some(v)));
        assert!(!g0.contains_value(v));
    }

    #[test]
    fn test_overlapping_write_removes_old_value() {
        let (g, o) = graph().add_heap_object(8, "o");
        let (g, v1) = g.add_value();
        let (g, v2) = g.add_value();
        let g = g.write(o, 0, 4, v1).unwrap();
        let g = g.write(o, 2, 4, v2).unwrap();
        assert_eq!(g.read(o, 0, 4), Ok(None));
        assert_eq!(g.read(o, 2, 4), Ok(Some(v2)));
        assert_eq!(g.hv_edges_of(o).count(), 1);
    }

    #[test]
    fn test_zero_filler_is_shrunk() {
        let (g, o) = graph().add_heap_object(16, "o");
        let g = g.write(o, 0, 16, Value::NULL).unwrap();
        let (g, v) = g.add_value();
        let g = g.write(o, 4, 4, v).unwrap();

        let edges: Vec<_> = g.hv_edges_of(o).map(|e| (e.offset, e.size, e.value)).collect();
        assert_eq!(edges, vec![(0, 4, Value::NULL), (4, 4, v), (8, 8, Value::NULL)]);
        assert_eq!(g.read(o, 0, 2), Ok(Some(Value::NULL)));
        assert_eq!(g.read(o, 12, 4), Ok(Some(Value::NULL)));
        assert_eq!(g.read(o, 2, 4), Ok(None));
    }

    #[test]
    fn test_identical_write_is_noop() {
        let (g, o) = graph().add_heap_object(8, "o");
        let (g, v) = g.add_value();
        let g1 = g.write(o, 0, 8, v).unwrap();
        let g2 = g1.write(o, 0, 8, v).unwrap();
        assert_eq!(g1, g2);
    }

    #[test]
    fn test_out_of_bounds_access() {
        let (g, o) = graph().add_heap_object(4, "o");
        assert_eq!(g.read(o, 2, 4), Err(Violation::InvalidRead));
        assert_eq!(g.write(o, 4, 1, Value::NULL).err(), Some(Violation::InvalidWrite));
        assert_eq!(g.read(ObjectId::NULL, 0, 1), Err(Violation::InvalidRead));
    }

    #[test]
    fn test_access_past_the_address_space() {
        let (g, o) = graph().add_heap_object(16, "o");
        assert_eq!(g.read(o, u64::MAX, 8), Err(Violation::InvalidRead));
        assert_eq!(g.read(o, 8, u64::MAX), Err(Violation::InvalidRead));
        assert_eq!(g.write(o, u64::MAX - 2, 8, Value::NULL).err(), Some(Violation::InvalidWrite));
    }

    #[test]
    fn test_free() {
        let (g, o) = graph().add_heap_object(8, "o");
        let (g, v) = g.add_value();
        let g = g.write(o, 0, 8, v).unwrap();
        let freed = g.free(o, 0).unwrap();
        assert!(!freed.is_valid(o));
        assert_eq!(freed.hv_edges_of(o).count(), 0);
        assert_eq!(freed.read(o, 0, 8), Err(Violation::InvalidRead));
        assert_eq!(freed.free(o, 0).err(), Some(Violation::InvalidFree));
        assert_eq!(g.free(o, 4).err(), Some(Violation::InvalidFree));
    }

    #[test]
    fn test_free_of_global_is_refused() {
        let (g, x) = graph().add_global_object(8, "x").unwrap();
        assert_eq!(g.free(x, 0).err(), Some(Violation::InvalidFree));
    }

    #[test]
    fn test_duplicate_global() {
        let (g, _) = graph().add_global_object(8, "x").unwrap();
        assert_eq!(g.add_global_object(4, "x").err(), Some(SmgError::DuplicateGlobal("x".to_string())));
    }

    #[test]
    fn test_frames() {
        let decl = FunctionDecl::new("f").returning(CType::int()).with_parameter("a", CType::Pointer);
        let g = graph().push_frame(&decl).unwrap();
        assert_eq!(g.stack_depth(), 1);
        let a = g.visible_object("a").unwrap();
        assert_eq!(g.object(a).map(|o| o.size), Some(8));
        let ret = g.visible_object(RETVAL_LABEL).unwrap();
        assert_eq!(g.object(ret).map(|o| o.size), Some(4));

        assert!(matches!(g.add_stack_object(4, "a"), Err(SmgError::DuplicateVariable { .. })));
        let (g, b) = g.add_stack_object(4, "b").unwrap();
        assert_eq!(g.object(b).map(|o| o.storage), Some(Storage::Stack(0)));

        let popped = g.pop_frame().unwrap();
        assert_eq!(popped.visible_object("a"), None);
        // Locals stay valid after the frame is gone.
        assert!(popped.is_valid(a));
        assert_eq!(popped.pop_frame().err(), Some(SmgError::NoStackFrame));
    }

    #[test]
    fn test_locals_shadow_globals() {
        let (g, global) = graph().add_global_object(4, "x").unwrap();
        let g = g.push_frame(&FunctionDecl::new("main")).unwrap();
        assert_eq!(g.visible_object("x"), Some(global));
        let (g, local) = g.add_stack_object(4, "x").unwrap();
        assert_eq!(g.visible_object("x"), Some(local));
    }

    #[test]
    fn test_prune_detects_leak() {
        let (g, o) = graph().add_heap_object(8, "o");
        let pruned = g.prune_unreachable();
        assert!(pruned.has_leaks());
        assert!(!pruned.contains_object(o));
    }

    #[test]
    fn test_prune_keeps_reachable() {
        let (g, p) = graph().add_global_object(8, "p").unwrap();
        let (g, o) = g.add_heap_object(8, "o");
        let (g, addr) = g.add_address(o, 0, TargetSpecifier::Region);
        let g = g.write(p, 0, 8, addr).unwrap();
        let pruned = g.prune_unreachable();
        assert!(!pruned.has_leaks());
        assert!(pruned.contains_object(o));
        assert!(pruned.is_pointer(addr));
    }

    #[test]
    fn test_prune_of_freed_object_is_no_leak() {
        let (g, o) = graph().add_heap_object(8, "o");
        let g = g.free(o, 0).unwrap().prune_unreachable();
        assert!(!g.has_leaks());
        assert!(!g.contains_object(o));
    }

    #[test]
    fn test_prune_marks_memory_behind_external_allocation() {
        let (g, ext) = graph().add_heap_object(8, "ext");
        let mut g = g;
        let obj = g.object(ext).cloned().unwrap();
        g.set_object_mut(MemoryObject {
            externally_allocated: true,
            ..obj
        });
        let (g, inner) = g.add_heap_object(8, "inner");
        let (g, addr) = g.add_address(inner, 0, TargetSpecifier::Region);
        let g = g.write(ext, 0, 8, addr).unwrap();
        let pruned = g.prune_unreachable();
        assert!(!pruned.has_leaks());
        assert!(!pruned.contains_object(inner));
    }

    #[test]
    fn test_prune_drops_stale_stack_objects_silently() {
        let g = graph().push_frame(&FunctionDecl::new("f")).unwrap();
        let (g, x) = g.add_stack_object(4, "x").unwrap();
        let g = g.pop_frame().unwrap().prune_unreachable();
        assert!(!g.contains_object(x));
        assert!(!g.has_leaks());
    }

    #[test]
    fn test_merge_values() {
        let (g, o) = graph().add_heap_object(16, "o");
        let (g, a) = g.add_value();
        let (g, b) = g.add_value();
        let (g, c) = g.add_value();
        let g = g.write(o, 0, 8, a).unwrap().write(o, 8, 8, b).unwrap();
        let g = g.add_disequality(b, c);
        let g = g.merge_values(a, b);
        assert_eq!(g.read(o, 8, 8), Ok(Some(a)));
        assert!(!g.contains_value(b));
        assert!(g.are_unequal(a, c));
    }

    #[test]
    fn test_merge_moves_address() {
        let (g, o) = graph().add_heap_object(8, "o");
        let (g, addr) = g.add_address(o, 0, TargetSpecifier::Region);
        let (g, v) = g.add_value();
        let g = g.merge_values(v, addr);
        assert_eq!(g.pointer(v).map(|pt| pt.object), Some(o));
        assert_eq!(g.address_of(o, 0, TargetSpecifier::Region), Some(v));
    }

    #[test]
    fn test_copy_range() {
        let (g, src) = graph().add_heap_object(16, "src");
        let (g, dst) = g.add_heap_object(16, "dst");
        let (g, v) = g.add_value();
        let g = g.write(src, 8, 8, v).unwrap();
        let g = g.write(dst, 0, 16, Value::NULL).unwrap();
        let g = g.copy_range(src, dst, 8, 16, 0).unwrap();
        assert_eq!(g.read(dst, 0, 8), Ok(Some(v)));
        assert_eq!(g.read(dst, 8, 8), Ok(Some(Value::NULL)));
        assert_eq!(g.copy_range(src, dst, 0, 16, 8).err(), Some(Violation::InvalidWrite));
    }

    #[test]
    fn test_address_is_unique() {
        let (g, o) = graph().add_heap_object(8, "o");
        let (g, a1) = g.add_address(o, 4, TargetSpecifier::Region);
        let (g, a2) = g.add_address(o, 4, TargetSpecifier::Region);
        assert_eq!(a1, a2);
        assert_eq!(g.pointers_to(o).len(), 1);
    }
}
