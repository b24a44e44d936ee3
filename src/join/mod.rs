//! Join and inclusion of heap graphs.
//!
//! Both operations walk the two graphs in lockstep, starting from the
//! variables they share, and pair every reachable object of the left graph
//! with one of the right graph. The pairing builds a third graph, the join,
//! and tracks a [`JoinStatus`] telling which input (if any) already covers
//! the other one.
//!
//! Two objects pair up when they agree on size, validity and storage, and
//! either both are regions, both are segments with the same linkage, or one
//! is a segment and the other a chain of regions long enough to be one of
//! its instances. Fields are paired by `(offset, size)`: addresses must
//! point to paired objects at the same offset, plain values are joined into
//! a fresh value whenever they differ, and bytes known to be zero on one
//! side only are forgotten. The private sub-objects of a folded chain all
//! pair with the nested object of the segment.
//!
//! Parts no variable reaches (pending leaks, addresses a caller still holds)
//! are paired with the part of the same id on the other side when possible
//! and carried over one-sided otherwise.
//!
//! When no pairing exists the graphs are unmergeable. Inclusion uses the same
//! walk and gives up as soon as the left graph turns out not to be covered.

mod status;

pub use status::JoinStatus;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use num_bigint::BigInt;

use crate::abstraction::{field_content, has_back_link, links_back, FieldContent};
use crate::bitset::ByteMask;
use crate::edge::{HasValueEdge, PointsToEdge, TargetSpecifier};
use crate::graph::HeapGraph;
use crate::object::{ListShape, MemoryObject, ObjectKind};
use crate::stack::StackFrame;
use crate::types::{ObjectId, Value};
use crate::values::ExplicitValues;

#[derive(Debug, Clone)]
pub enum JoinResult {
    Merged { graph: HeapGraph, status: JoinStatus },
    Unmergeable,
}

impl JoinResult {
    pub fn is_mergeable(&self) -> bool {
        matches!(self, JoinResult::Merged { .. })
    }

    pub fn status(&self) -> Option<JoinStatus> {
        match self {
            JoinResult::Merged { status, .. } => Some(*status),
            JoinResult::Unmergeable => None,
        }
    }

    pub fn into_graph(self) -> Option<HeapGraph> {
        match self {
            JoinResult::Merged { graph, .. } => Some(graph),
            JoinResult::Unmergeable => None,
        }
    }
}

/// Joins two graphs.
pub fn join(a: &HeapGraph, b: &HeapGraph) -> JoinResult {
    let none = ExplicitValues::new();
    match join_with_values(a, &none, b, &none, JoinMode::Join) {
        Some(joined) => JoinResult::Merged {
            graph: joined.graph,
            status: joined.status,
        },
        None => JoinResult::Unmergeable,
    }
}

/// Checks whether every concrete state of `a` is a state of `b`.
pub fn is_less_or_equal(a: &HeapGraph, b: &HeapGraph) -> bool {
    let none = ExplicitValues::new();
    join_with_values(a, &none, b, &none, JoinMode::Inclusion).is_some_and(|joined| joined.status.left_is_less_or_equal())
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum JoinMode {
    Join,
    /// Stop as soon as the left graph is known not to be covered.
    Inclusion,
}

#[derive(Debug, Clone)]
pub(crate) struct Joined {
    pub graph: HeapGraph,
    pub explicit: ExplicitValues,
    pub status: JoinStatus,
}

/// Joins two graphs together with the explicit values known for them.
pub(crate) fn join_with_values(
    a: &HeapGraph,
    a_explicit: &ExplicitValues,
    b: &HeapGraph,
    b_explicit: &ExplicitValues,
    mode: JoinMode,
) -> Option<Joined> {
    match Joiner::new(a, a_explicit, b, b_explicit, mode).run() {
        Ok(joined) => Some(joined),
        Err(Unjoinable(reason)) => {
            log::trace!("graphs do not join: {}", reason);
            None
        }
    }
}

#[derive(Debug)]
struct Unjoinable(&'static str);

type Step<T> = std::result::Result<T, Unjoinable>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    /// The status saying this side covers the other one.
    fn entails(self) -> JoinStatus {
        match self {
            Side::Left => JoinStatus::LeftEntails,
            Side::Right => JoinStatus::RightEntails,
        }
    }

    /// Puts a pair of per-side things into (left, right) order.
    fn order<T>(self, mine: T, theirs: T) -> (T, T) {
        match self {
            Side::Left => (mine, theirs),
            Side::Right => (theirs, mine),
        }
    }
}

/// One input graph and how its parts were mapped into the join.
#[derive(Clone)]
struct Mapping<'g> {
    graph: &'g HeapGraph,
    explicit: &'g ExplicitValues,
    objects: BTreeMap<ObjectId, ObjectId>,
    values: BTreeMap<Value, Value>,
    /// Regions folded into a segment of the other side: position and chain length.
    chain: BTreeMap<ObjectId, (usize, usize)>,
    /// Links between the elements of a folded chain.
    folded: BTreeSet<Value>,
}

impl<'g> Mapping<'g> {
    fn new(graph: &'g HeapGraph, explicit: &'g ExplicitValues) -> Self {
        Self {
            graph,
            explicit,
            objects: BTreeMap::new(),
            values: BTreeMap::new(),
            chain: BTreeMap::new(),
            folded: BTreeSet::new(),
        }
    }

    fn dest_value(&self, value: Value) -> Option<Value> {
        if value.is_null() {
            return Some(Value::NULL);
        }
        self.values.get(&value).copied()
    }

    fn is_settled(&self, value: Value) -> bool {
        value.is_null() || self.values.contains_key(&value) || self.folded.contains(&value)
    }
}

#[derive(Debug, Copy, Clone)]
enum Task {
    /// Pair the fields of two objects joined into `dest`.
    Fields {
        left: ObjectId,
        right: ObjectId,
        dest: ObjectId,
        /// Linkage of a chain whose link fields are joined separately.
        links: Option<ListShape>,
        /// A later chain element: only keep what the earlier ones put into `dest`.
        narrow: bool,
    },
    /// Join the links leaving a segment and the chain folded into it.
    Link {
        left: Value,
        right: Value,
        dest: ObjectId,
        offset: u64,
    },
}

/// Everything a failed tentative pairing rolls back.
struct Snapshot<'g> {
    left: Mapping<'g>,
    right: Mapping<'g>,
    dest: HeapGraph,
    explicit: ExplicitValues,
    origins: BTreeMap<Value, (Value, Value)>,
    status: JoinStatus,
}

struct Joiner<'g> {
    left: Mapping<'g>,
    right: Mapping<'g>,
    dest: HeapGraph,
    explicit: ExplicitValues,
    /// Which pair of input values each joined value came from.
    origins: BTreeMap<Value, (Value, Value)>,
    status: JoinStatus,
    mode: JoinMode,
    tasks: VecDeque<Task>,
}

impl<'g> Joiner<'g> {
    fn new(
        a: &'g HeapGraph,
        a_explicit: &'g ExplicitValues,
        b: &'g HeapGraph,
        b_explicit: &'g ExplicitValues,
        mode: JoinMode,
    ) -> Self {
        Self {
            left: Mapping::new(a, a_explicit),
            right: Mapping::new(b, b_explicit),
            dest: HeapGraph::with_ids(*a.machine(), a.ids().max(b.ids())),
            explicit: ExplicitValues::new(),
            origins: BTreeMap::new(),
            status: JoinStatus::Equal,
            mode,
            tasks: VecDeque::new(),
        }
    }

    fn mapping(&self, side: Side) -> &Mapping<'g> {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn mapping_mut(&mut self, side: Side) -> &mut Mapping<'g> {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    fn graph(&self, side: Side) -> &'g HeapGraph {
        self.mapping(side).graph
    }

    fn run(mut self) -> Step<Joined> {
        self.join_globals()?;
        self.join_frames()?;
        self.drain()?;
        self.pair_leftovers();
        self.carry(Side::Left)?;
        self.carry(Side::Right)?;
        self.join_disequalities()?;
        let leaks = self.left.graph.has_leaks() || self.right.graph.has_leaks();
        self.dest.set_leak_mut(leaks);
        log::debug!("joined graphs: {}", self.status);
        Ok(Joined {
            graph: self.dest,
            explicit: self.explicit,
            status: self.status,
        })
    }

    fn drain(&mut self) -> Step<()> {
        while let Some(task) = self.tasks.pop_front() {
            match task {
                Task::Fields {
                    left,
                    right,
                    dest,
                    links,
                    narrow,
                } => self.join_fields(left, right, dest, links, narrow)?,
                Task::Link {
                    left,
                    right,
                    dest,
                    offset,
                } => {
                    let value = self.join_values(left, right)?;
                    let size = self.dest.machine().pointer_size();
                    self.dest.insert_hv_mut(HasValueEdge::new(dest, offset, size, value));
                }
            }
        }
        Ok(())
    }

    fn update(&mut self, status: JoinStatus) -> Step<()> {
        self.status = self.status.update(status);
        if self.mode == JoinMode::Inclusion && !self.status.left_is_less_or_equal() {
            return Err(Unjoinable("left graph is not covered"));
        }
        Ok(())
    }

    /// Records that `general` covers the other side in some part.
    fn entails(&mut self, general: Side) -> Step<()> {
        self.update(general.entails())
    }

    /// The id `preferred` if the join has no such object yet, a fresh one otherwise.
    fn dest_object_id(&mut self, preferred: ObjectId) -> ObjectId {
        if self.dest.contains_object(preferred) {
            self.dest.fresh_object_id()
        } else {
            preferred
        }
    }

    fn dest_value_id(&mut self, preferred: Value) -> Value {
        if self.dest.contains_value(preferred) {
            self.dest.fresh_value_mut()
        } else {
            self.dest.add_value_mut(preferred);
            preferred
        }
    }

    fn record(&mut self, left: Value, right: Value, dest: Value) {
        self.left.values.insert(left, dest);
        self.right.values.insert(right, dest);
        self.origins.insert(dest, (left, right));
    }

    fn origin(&self, dest: Value) -> Option<(Value, Value)> {
        if dest.is_null() {
            return Some((Value::NULL, Value::NULL));
        }
        self.origins.get(&dest).copied()
    }

    fn snapshot(&self) -> Snapshot<'g> {
        Snapshot {
            left: self.left.clone(),
            right: self.right.clone(),
            dest: self.dest.clone(),
            explicit: self.explicit.clone(),
            origins: self.origins.clone(),
            status: self.status,
        }
    }

    fn restore(&mut self, snapshot: Snapshot<'g>) {
        self.left = snapshot.left;
        self.right = snapshot.right;
        self.dest = snapshot.dest;
        self.explicit = snapshot.explicit;
        self.origins = snapshot.origins;
        self.status = snapshot.status;
        self.tasks.clear();
    }

    /// Runs `pair` with everything it enqueues, undoing all of it on failure.
    fn tentatively(&mut self, pair: impl FnOnce(&mut Self) -> Step<()>) -> bool {
        let snapshot = self.snapshot();
        match pair(self).and_then(|()| self.drain()) {
            Ok(()) => true,
            Err(Unjoinable(reason)) => {
                log::trace!("leftover pairing failed: {}", reason);
                self.restore(snapshot);
                false
            }
        }
    }

    // ---------------------------------------------------------------------
    // Roots
    // ---------------------------------------------------------------------

    fn join_globals(&mut self) -> Step<()> {
        let (a, b) = (self.left.graph, self.right.graph);
        if a.globals().count() != b.globals().count() {
            return Err(Unjoinable("different global variables"));
        }
        for (name, left) in a.globals() {
            let right = b.global(name).ok_or(Unjoinable("different global variables"))?;
            let dest = self.join_root(left, right)?;
            self.dest.add_global_mut(name, dest);
        }
        Ok(())
    }

    fn join_frames(&mut self) -> Step<()> {
        let (a, b) = (self.left.graph, self.right.graph);
        if a.stack_depth() != b.stack_depth() {
            return Err(Unjoinable("different stack depths"));
        }
        for (left, right) in a.frames().zip(b.frames()) {
            if !left.same_layout(right) {
                return Err(Unjoinable("different stack frames"));
            }
            let return_object = match (left.return_object(), right.return_object()) {
                (Some(x), Some(y)) => Some(self.join_root(x, y)?),
                _ => None,
            };
            let mut frame = StackFrame::new(left.function(), return_object);
            for (name, x) in left.variables() {
                let y = right.variable(name).ok_or(Unjoinable("different stack frames"))?;
                frame = frame.with_variable(name, self.join_root(x, y)?);
            }
            self.dest.push_frame_mut(frame);
        }
        Ok(())
    }

    fn join_root(&mut self, left: ObjectId, right: ObjectId) -> Step<ObjectId> {
        let (a, b) = (self.left.graph, self.right.graph);
        let x = a.object(left).ok_or(Unjoinable("missing variable object"))?;
        let y = b.object(right).ok_or(Unjoinable("missing variable object"))?;
        if x.size != y.size || x.valid != y.valid {
            return Err(Unjoinable("variables of different size or validity"));
        }
        self.add_region(x, y)
    }

    // ---------------------------------------------------------------------
    // Leftovers
    // ---------------------------------------------------------------------

    /// Pairs the parts no variable reaches with the part of the same id on
    /// the other side, wherever the two join.
    fn pair_leftovers(&mut self) {
        let (a, b) = (self.left.graph, self.right.graph);
        for px in a.pt_edges() {
            if self.left.is_settled(px.value) || self.right.is_settled(px.value) {
                continue;
            }
            let (px, Some(py)) = (*px, b.pointer(px.value).copied()) else {
                continue;
            };
            self.tentatively(|j| j.join_addresses(px, py).map(|_| ()));
        }
        for x in a.objects() {
            if x.is_null() || self.left.objects.contains_key(&x.id) || self.right.objects.contains_key(&x.id) {
                continue;
            }
            let Some(y) = b.object(x.id) else { continue };
            if matches!(
                (x.kind, y.kind),
                (ObjectKind::Region, ObjectKind::Region) | (ObjectKind::ListSegment(_), ObjectKind::ListSegment(_))
            ) {
                let id = x.id;
                self.tentatively(|j| j.join_objects(id, id).map(|_| ()));
            }
        }
        for x in a.values() {
            if self.left.is_settled(x) || self.right.is_settled(x) || !b.contains_value(x) || a.is_pointer(x) || b.is_pointer(x) {
                continue;
            }
            self.tentatively(|j| j.join_plain_values(x, x).map(|_| ()));
        }
    }

    /// Copies what `side` still has unpaired into the join.
    fn carry(&mut self, side: Side) -> Step<()> {
        let graph = self.graph(side);
        let objects: Vec<&'g MemoryObject> = graph
            .objects()
            .filter(|o| !o.is_null() && !self.mapping(side).objects.contains_key(&o.id))
            .collect();
        if !objects.is_empty() {
            log::debug!("carrying {} unpaired objects of the {:?} graph", objects.len(), side);
            self.update(JoinStatus::Incomparable)?;
        }
        for obj in &objects {
            let id = self.dest_object_id(obj.id);
            self.dest.insert_object_mut(MemoryObject { id, ..(*obj).clone() });
            self.mapping_mut(side).objects.insert(obj.id, id);
        }
        for value in graph.values() {
            if !self.mapping(side).is_settled(value) {
                self.carry_value(side, value);
            }
        }
        for obj in objects {
            let Some(dest) = self.mapping(side).objects.get(&obj.id).copied() else {
                continue;
            };
            for edge in graph.hv_edges_of(obj.id) {
                if let Some(value) = self.carry_value(side, edge.value) {
                    self.dest.insert_hv_mut(HasValueEdge { object: dest, value, ..*edge });
                }
            }
        }
        Ok(())
    }

    /// The join's counterpart of a value only `side` has, created on first use.
    fn carry_value(&mut self, side: Side, value: Value) -> Option<Value> {
        if let Some(dest) = self.mapping(side).dest_value(value) {
            return Some(dest);
        }
        let graph = self.graph(side);
        let dest = match graph.pointer(value).copied() {
            Some(pt) => {
                let (object, target) = if pt.object.is_null() {
                    (ObjectId::NULL, TargetSpecifier::Region)
                } else {
                    let object = self.mapping(side).objects.get(&pt.object).copied()?;
                    (object, self.chain_specifier(side, &pt, pt.target))
                };
                match self.dest.address_of(object, pt.offset, target) {
                    Some(existing) => existing,
                    None => {
                        let dest = self.dest_value_id(value);
                        self.dest.insert_pt_mut(PointsToEdge::new(dest, object, pt.offset, target));
                        dest
                    }
                }
            }
            None => {
                let dest = self.dest_value_id(value);
                let explicit = self.mapping(side).explicit;
                if let Some(n) = explicit.get(value) {
                    if self.explicit.value_for(n).is_none() {
                        self.explicit = self.explicit.insert(dest, n.clone()).0;
                    }
                }
                dest
            }
        };
        self.mapping_mut(side).values.insert(value, dest);
        Some(dest)
    }

    // ---------------------------------------------------------------------
    // Objects
    // ---------------------------------------------------------------------

    /// Pairs two regions (or two segments of one linkage) into a new object.
    fn add_region(&mut self, x: &MemoryObject, y: &MemoryObject) -> Step<ObjectId> {
        let id = self.dest_object_id(x.id);
        let kind = match (x.kind, y.kind) {
            (ObjectKind::ListSegment(sx), ObjectKind::ListSegment(sy)) => ObjectKind::ListSegment(ListShape {
                min_length: sx.min_length.min(sy.min_length),
                ..sx
            }),
            (kind, _) => kind,
        };
        self.dest.insert_object_mut(MemoryObject {
            id,
            kind,
            externally_allocated: x.externally_allocated || y.externally_allocated,
            nesting_level: x.nesting_level.max(y.nesting_level),
            ..x.clone()
        });
        self.left.objects.insert(x.id, id);
        self.right.objects.insert(y.id, id);
        self.tasks.push_back(Task::Fields {
            left: x.id,
            right: y.id,
            dest: id,
            links: None,
            narrow: false,
        });
        Ok(id)
    }

    fn join_objects(&mut self, left: ObjectId, right: ObjectId) -> Step<ObjectId> {
        let (a, b) = (self.left.graph, self.right.graph);
        let x = a.object(left).ok_or(Unjoinable("missing target object"))?;
        let y = b.object(right).ok_or(Unjoinable("missing target object"))?;
        if x.size != y.size {
            return Err(Unjoinable("targets of different sizes"));
        }
        if x.valid != y.valid {
            return Err(Unjoinable("valid target against released one"));
        }
        if x.storage != y.storage {
            return Err(Unjoinable("targets in different storage"));
        }
        // A nested object stands for one sub-object per element, so it covers a single one.
        match x.nesting_level.cmp(&y.nesting_level) {
            std::cmp::Ordering::Less => self.entails(Side::Right)?,
            std::cmp::Ordering::Greater => self.entails(Side::Left)?,
            std::cmp::Ordering::Equal => {}
        }
        match (x.kind, y.kind) {
            (ObjectKind::Region, ObjectKind::Region) => self.add_region(x, y),
            (ObjectKind::ListSegment(sx), ObjectKind::ListSegment(sy)) => {
                if !sx.same_linkage(&sy) {
                    return Err(Unjoinable("segments of different linkage"));
                }
                match sx.min_length.cmp(&sy.min_length) {
                    std::cmp::Ordering::Less => self.entails(Side::Left)?,
                    std::cmp::Ordering::Greater => self.entails(Side::Right)?,
                    std::cmp::Ordering::Equal => {}
                }
                self.add_region(x, y)
            }
            (ObjectKind::Region, ObjectKind::ListSegment(shape)) => self.fold_chain(Side::Left, left, right, shape),
            (ObjectKind::ListSegment(shape), ObjectKind::Region) => self.fold_chain(Side::Right, right, left, shape),
        }
    }

    /// Maps one more private sub-object of a folded chain onto the nested
    /// object `dest`, which `partner` of the other side was joined into.
    fn absorb_nested(&mut self, side: Side, object: ObjectId, partner: ObjectId, dest: ObjectId) -> Step<ObjectId> {
        let graph = self.graph(side);
        let obj = graph.object(object).ok_or(Unjoinable("missing target object"))?;
        let fits = self.dest.object(dest).is_some_and(|nested| {
            nested.nesting_level > obj.nesting_level
                && !obj.is_abstract()
                && nested.size == obj.size
                && nested.valid == obj.valid
                && nested.storage == obj.storage
        });
        if !fits {
            return Err(Unjoinable("target already paired with another object"));
        }
        self.entails(side.other())?;
        self.mapping_mut(side).objects.insert(object, dest);
        let (left, right) = side.order(object, partner);
        self.tasks.push_back(Task::Fields {
            left,
            right,
            dest,
            links: None,
            narrow: true,
        });
        Ok(dest)
    }

    /// The chain of `side` starting at `start` that can be an instance of a segment.
    fn collect_chain(&self, side: Side, start: ObjectId, size: u64, shape: ListShape) -> Vec<ObjectId> {
        let graph = self.graph(side);
        let mapping = self.mapping(side);
        let pointer_size = graph.machine().pointer_size();
        let eligible = |id: ObjectId| {
            graph.object(id).is_some_and(|o| {
                o.is_heap()
                    && o.valid
                    && o.size == size
                    && o.nesting_level == 0
                    && !mapping.objects.contains_key(&id)
                    && match o.kind {
                        ObjectKind::Region => true,
                        ObjectKind::ListSegment(s) => s.same_linkage(&shape),
                    }
            })
        };
        if !eligible(start) {
            return Vec::new();
        }

        let mut elements = vec![start];
        let mut current = start;
        while let Some(edge) = graph.hv_edge_at(current, shape.next_offset, pointer_size) {
            let Some(pt) = graph.pointer(edge.value) else { break };
            if pt.object.is_null()
                || pt.offset != shape.head_offset
                || !matches!(pt.target, TargetSpecifier::Region | TargetSpecifier::First)
            {
                break;
            }
            let next = pt.object;
            if elements.contains(&next) || !eligible(next) || !links_back(graph, next, current, &shape) {
                break;
            }
            let foreign = graph.incoming_edges(next).len().saturating_sub(usize::from(has_back_link(graph, next, &shape)));
            if foreign != 1 {
                break;
            }
            elements.push(next);
            current = next;
        }
        elements
    }

    /// Folds the chain of `side` starting at `start` into `segment` of the other side.
    fn fold_chain(&mut self, side: Side, start: ObjectId, segment: ObjectId, shape: ListShape) -> Step<ObjectId> {
        let graph = self.graph(side);
        let other = self.graph(side.other());
        let seg = other.object(segment).ok_or(Unjoinable("missing segment"))?;

        let elements = self.collect_chain(side, start, seg.size, shape);
        let total: u32 = elements.iter().filter_map(|id| graph.object(*id)).map(|o| o.min_length()).sum();
        if elements.is_empty() || total < shape.min_length {
            return Err(Unjoinable("chain shorter than the segment"));
        }
        self.entails(side.other())?;

        let id = match side {
            Side::Left => self.dest.fresh_object_id(),
            Side::Right => self.dest_object_id(segment),
        };
        self.dest.insert_object_mut(MemoryObject {
            id,
            kind: ObjectKind::ListSegment(ListShape {
                min_length: total.min(shape.min_length),
                ..shape
            }),
            ..seg.clone()
        });
        self.mapping_mut(side.other()).objects.insert(segment, id);
        let pointer_size = graph.machine().pointer_size();
        let len = elements.len();
        for (index, element) in elements.iter().enumerate() {
            let mut inner = Vec::new();
            if index + 1 < len {
                inner.extend(graph.hv_edge_at(*element, shape.next_offset, pointer_size).map(|e| e.value));
            }
            if let Some(prev) = shape.prev_offset.filter(|_| index > 0) {
                inner.extend(graph.hv_edge_at(*element, prev, pointer_size).map(|e| e.value));
            }
            let mapping = self.mapping_mut(side);
            mapping.objects.insert(*element, id);
            mapping.chain.insert(*element, (index, len));
            mapping.folded.extend(inner);
            let (left, right) = side.order(*element, segment);
            self.tasks.push_back(Task::Fields {
                left,
                right,
                dest: id,
                links: Some(shape),
                narrow: index > 0,
            });
        }

        // Forwards from the last element, backwards from the first.
        let mut ends = vec![(elements[len - 1], shape.next_offset)];
        ends.extend(shape.prev_offset.map(|prev| (elements[0], prev)));
        for (end, offset) in ends {
            let chain_link = link_value(graph, end, offset, pointer_size)?;
            let segment_link = link_value(other, segment, offset, pointer_size)?;
            let (left, right) = side.order(chain_link, segment_link);
            self.tasks.push_back(Task::Link {
                left,
                right,
                dest: id,
                offset,
            });
        }
        log::trace!("folded {} objects starting at {} into segment {}", len, start, id);
        Ok(id)
    }

    // ---------------------------------------------------------------------
    // Fields
    // ---------------------------------------------------------------------

    fn join_fields(&mut self, left: ObjectId, right: ObjectId, dest: ObjectId, links: Option<ListShape>, narrow: bool) -> Step<()> {
        let (a, b) = (self.left.graph, self.right.graph);
        let pointer_size = a.machine().pointer_size();
        let off_link = |e: &HasValueEdge| links.map_or(true, |shape| !shape.overlaps_link(e.offset, e.end(), pointer_size));

        let mut left_zero = a.null_bytes(left);
        let mut right_zero = b.null_bytes(right);
        for link in links.iter().flat_map(|shape| shape.link_offsets()) {
            left_zero.remove_range(link..link + pointer_size);
            right_zero.remove_range(link..link + pointer_size);
        }

        let keys: BTreeSet<(u64, u64)> = a
            .hv_edges_of(left)
            .chain(b.hv_edges_of(right))
            .filter(|e| !e.is_zero() && off_link(*e))
            .map(|e| (e.offset, e.size))
            .collect();
        for (offset, size) in keys {
            let x = field_content(a, left, offset, size);
            let y = field_content(b, right, offset, size);
            let value = self.join_field_values(x, y)?;
            let existing = self.dest.hv_edge_at(dest, offset, size).copied();
            match (narrow, existing, value) {
                (false, _, Some(value)) => self.dest.insert_hv_mut(HasValueEdge::new(dest, offset, size, value)),
                (true, Some(edge), value) if !edge.is_zero() && value != Some(edge.value) => self.dest.remove_hv_mut(&edge),
                _ => {}
            }
        }

        if !left_zero.difference(&right_zero).is_empty() {
            self.entails(Side::Right)?;
        }
        if !right_zero.difference(&left_zero).is_empty() {
            self.entails(Side::Left)?;
        }
        let common = left_zero.intersection(&right_zero);
        let zeros: Vec<HasValueEdge> = if narrow {
            self.dest.hv_edges_of(dest).filter(|e| e.is_zero() && off_link(*e)).copied().collect()
        } else {
            a.hv_edges_of(left).filter(|e| e.is_zero()).copied().collect()
        };
        for zero in zeros {
            if narrow {
                self.dest.remove_hv_mut(&zero);
            }
            for run in ByteMask::from_range(zero.range()).intersection(&common).runs() {
                self.dest.insert_hv_mut(HasValueEdge::new(dest, run.start, run.end - run.start, Value::NULL));
            }
        }
        Ok(())
    }

    /// Joins what two paired fields hold. `None` leaves the joined field unknown.
    fn join_field_values(&mut self, x: FieldContent, y: FieldContent) -> Step<Option<Value>> {
        let zero = |c: FieldContent| match c {
            FieldContent::Known(v) if v.is_null() => FieldContent::Zero,
            c => c,
        };
        match (zero(x), zero(y)) {
            (FieldContent::Known(x), FieldContent::Known(y)) => self.join_values(x, y).map(Some),
            (FieldContent::Known(x), other) => self.one_sided(Side::Left, x, other).map(|_| None),
            (other, FieldContent::Known(y)) => self.one_sided(Side::Right, y, other).map(|_| None),
            _ => Ok(None),
        }
    }

    /// A field holding `value` on `side` and zero or nothing on the other.
    fn one_sided(&mut self, side: Side, value: Value, other: FieldContent) -> Step<()> {
        let graph = self.graph(side);
        if graph.is_pointer(value) {
            return Err(Unjoinable("address against non-address"));
        }
        let explicit = self.mapping(side).explicit;
        match other {
            FieldContent::Zero if explicit.contains(value) => self.update(JoinStatus::Incomparable),
            FieldContent::Zero => self.entails(side),
            _ if is_constrained(graph, explicit, value) => self.entails(side.other()),
            _ => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Values
    // ---------------------------------------------------------------------

    fn join_values(&mut self, x: Value, y: Value) -> Step<Value> {
        if x.is_null() && y.is_null() {
            return Ok(Value::NULL);
        }
        if let (Some(dx), Some(dy)) = (self.left.values.get(&x), self.right.values.get(&y)) {
            if dx == dy {
                return Ok(*dx);
            }
        }
        match (self.left.graph.pointer(x).copied(), self.right.graph.pointer(y).copied()) {
            (None, None) => self.join_plain_values(x, y),
            (Some(px), Some(py)) => self.join_addresses(px, py),
            _ => Err(Unjoinable("address against non-address")),
        }
    }

    fn join_plain_values(&mut self, x: Value, y: Value) -> Step<Value> {
        // A value met again with a different partner was shared on its side.
        if self.left.values.contains_key(&x) {
            self.entails(Side::Right)?;
        }
        if self.right.values.contains_key(&y) {
            self.entails(Side::Left)?;
        }
        let bound: Option<BigInt> = match (self.left.explicit.get(x).cloned(), self.right.explicit.get(y).cloned()) {
            (Some(m), Some(n)) if m == n => Some(m),
            (Some(_), Some(_)) => {
                self.update(JoinStatus::Incomparable)?;
                None
            }
            (Some(_), None) => {
                self.entails(Side::Right)?;
                None
            }
            (None, Some(_)) => {
                self.entails(Side::Left)?;
                None
            }
            (None, None) => None,
        };
        let dest = match bound.as_ref().and_then(|n| self.explicit.value_for(n)) {
            Some(existing) => existing,
            None => self.dest_value_id(x),
        };
        if let Some(n) = bound {
            self.explicit = self.explicit.insert(dest, n).0;
        }
        self.record(x, y, dest);
        Ok(dest)
    }

    fn join_addresses(&mut self, px: PointsToEdge, py: PointsToEdge) -> Step<Value> {
        if px.offset != py.offset {
            return Err(Unjoinable("addresses at different offsets"));
        }
        let (object, target) = match (px.object.is_null(), py.object.is_null()) {
            (true, true) => (ObjectId::NULL, TargetSpecifier::Region),
            (false, false) => self.join_targets(&px, &py)?,
            _ => return Err(Unjoinable("null address against a valid one")),
        };
        let dest = match self.dest.address_of(object, px.offset, target) {
            Some(value) => value,
            None => {
                let value = self.dest_value_id(px.value);
                self.dest.insert_pt_mut(PointsToEdge::new(value, object, px.offset, target));
                value
            }
        };
        self.record(px.value, py.value, dest);
        Ok(dest)
    }

    fn join_targets(&mut self, px: &PointsToEdge, py: &PointsToEdge) -> Step<(ObjectId, TargetSpecifier)> {
        let object = match (self.left.objects.get(&px.object).copied(), self.right.objects.get(&py.object).copied()) {
            (Some(dx), Some(dy)) if dx == dy => dx,
            (None, None) => self.join_objects(px.object, py.object)?,
            (None, Some(dy)) => self.absorb_nested(Side::Left, px.object, py.object, dy)?,
            (Some(dx), None) => self.absorb_nested(Side::Right, py.object, px.object, dx)?,
            _ => return Err(Unjoinable("target already paired with another object")),
        };
        if !self.dest.object(object).is_some_and(|o| o.is_abstract()) {
            return Ok((object, TargetSpecifier::Region));
        }
        let sx = self.chain_specifier(Side::Left, px, py.target);
        let sy = self.chain_specifier(Side::Right, py, px.target);
        if sx == sy {
            Ok((object, sx))
        } else if sx.is_covered_by(sy) {
            self.entails(Side::Right)?;
            Ok((object, sy))
        } else if sy.is_covered_by(sx) {
            self.entails(Side::Left)?;
            Ok((object, sx))
        } else {
            Err(Unjoinable("incompatible segment specifiers"))
        }
    }

    /// The specifier a pointer has once its target is seen as part of a segment.
    fn chain_specifier(&self, side: Side, pt: &PointsToEdge, other: TargetSpecifier) -> TargetSpecifier {
        match self.mapping(side).chain.get(&pt.object) {
            None => pt.target,
            Some(&(index, len)) if index == 0 && (len > 1 || other != TargetSpecifier::Last) => TargetSpecifier::First,
            Some(&(index, len)) if index + 1 == len => TargetSpecifier::Last,
            Some(_) => TargetSpecifier::All,
        }
    }

    fn join_disequalities(&mut self) -> Step<()> {
        let (a, b) = (self.left.graph, self.right.graph);
        for (x, y) in a.neq().iter() {
            let (Some(dx), Some(dy)) = (self.left.dest_value(x), self.left.dest_value(y)) else {
                continue;
            };
            if dx == dy {
                continue;
            }
            // A carried value has no counterpart that could be equal.
            let (Some((_, rx)), Some((_, ry))) = (self.origin(dx), self.origin(dy)) else {
                self.dest.add_disequality_mut(dx, dy);
                continue;
            };
            if b.are_unequal(rx, ry) {
                self.dest.add_disequality_mut(dx, dy);
            } else {
                self.entails(Side::Right)?;
            }
        }
        for (x, y) in b.neq().iter() {
            let (Some(dx), Some(dy)) = (self.right.dest_value(x), self.right.dest_value(y)) else {
                continue;
            };
            if dx == dy {
                continue;
            }
            let (Some((lx, _)), Some((ly, _))) = (self.origin(dx), self.origin(dy)) else {
                self.dest.add_disequality_mut(dx, dy);
                continue;
            };
            if !a.are_unequal(lx, ly) {
                self.entails(Side::Left)?;
            }
        }
        Ok(())
    }
}

/// What the link of a chain or segment end holds.
fn link_value(graph: &HeapGraph, object: ObjectId, offset: u64, size: u64) -> Step<Value> {
    match field_content(graph, object, offset, size) {
        FieldContent::Known(value) => Ok(value),
        FieldContent::Zero => Ok(Value::NULL),
        FieldContent::Unknown => Err(Unjoinable("unknown list link")),
    }
}

/// Whether anything beyond its type is known about a plain value.
fn is_constrained(graph: &HeapGraph, explicit: &ExplicitValues, value: Value) -> bool {
    explicit.contains(value) || graph.neq().unequal_to(value).next().is_some() || graph.edges_with_value(value).len() > 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstraction::fixtures::{build_dll, build_list, build_list_with_payloads};
    use crate::abstraction::{abstract_lists, materialize, AbstractionConfig};
    use crate::machine::MachineModel;
    use test_log::test;

    fn abstracted(n: usize) -> HeapGraph {
        let (g, _) = build_list(n);
        abstract_lists(&g, &AbstractionConfig::default())
    }

    fn head_target(g: &HeapGraph) -> ObjectId {
        let head = g.global("head").unwrap();
        let value = g.read(head, 0, 8).unwrap().unwrap();
        g.pointer(value).unwrap().object
    }

    /// A global `x` of 8 bytes holding whatever `fill` puts there.
    fn with_global(fill: impl FnOnce(HeapGraph, ObjectId) -> HeapGraph) -> HeapGraph {
        let (g, x) = HeapGraph::new(MachineModel::LINUX64).add_global_object(8, "x").unwrap();
        fill(g, x)
    }

    #[test]
    fn test_join_with_itself() {
        let g = abstracted(4).prune_unreachable();
        let JoinResult::Merged { graph, status } = join(&g, &g) else {
            panic!("a graph must join with itself");
        };
        assert_eq!(status, JoinStatus::Equal);
        assert_eq!(graph, g);
        assert!(is_less_or_equal(&g, &g));
    }

    #[test]
    fn test_concrete_list_is_covered_by_summary() {
        let (concrete, _) = build_list(3);
        let summary = abstract_lists(&concrete, &AbstractionConfig::default());
        assert!(is_less_or_equal(&concrete, &summary));
        assert!(!is_less_or_equal(&summary, &concrete));

        let result = join(&concrete, &summary);
        assert_eq!(result.status(), Some(JoinStatus::RightEntails));
        let joined = result.into_graph().unwrap();
        let seg = joined.object(head_target(&joined)).cloned().unwrap();
        assert_eq!(seg.min_length(), 2);
        assert_eq!(joined.read(seg.id, 8, 8), Ok(Some(Value::NULL)));
    }

    #[test]
    fn test_materialized_list_is_covered_by_summary() {
        let summary = abstracted(3);
        let seg = head_target(&summary);
        let expanded = materialize(&summary, seg).unwrap().length_many;
        assert!(is_less_or_equal(&expanded, &summary));
        assert!(!is_less_or_equal(&summary, &expanded));
        assert_eq!(join(&summary, &expanded).status(), Some(JoinStatus::LeftEntails));
    }

    #[test]
    fn test_shorter_segment_is_more_general() {
        let short = abstracted(3);
        let seg = short.object(head_target(&short)).cloned().unwrap();
        let Some(shape) = seg.list_shape() else { panic!("not a segment") };
        let mut long = short.clone();
        long.set_object_mut(MemoryObject {
            kind: ObjectKind::ListSegment(ListShape { min_length: 3, ..shape }),
            ..seg
        });

        assert!(is_less_or_equal(&long, &short));
        assert!(!is_less_or_equal(&short, &long));
        let result = join(&short, &long);
        assert_eq!(result.status(), Some(JoinStatus::LeftEntails));
        let joined = result.into_graph().unwrap();
        assert_eq!(joined.object(head_target(&joined)).map(|o| o.min_length()), Some(2));
    }

    #[test]
    fn test_address_against_plain_value_is_unmergeable() {
        let with_address = with_global(|g, x| {
            let (g, o) = g.add_heap_object(4, "o");
            let (g, addr) = g.add_address(o, 0, TargetSpecifier::Region);
            g.write(x, 0, 8, addr).unwrap()
        });
        let with_value = with_global(|g, x| {
            let (g, v) = g.add_value();
            g.write(x, 0, 8, v).unwrap()
        });
        assert!(!join(&with_address, &with_value).is_mergeable());
        assert!(!is_less_or_equal(&with_address, &with_value));
    }

    #[test]
    fn test_different_globals_are_unmergeable() {
        let a = with_global(|g, _| g);
        let (b, _) = a.add_global_object(4, "y").unwrap();
        assert!(!join(&a, &b).is_mergeable());
    }

    #[test]
    fn test_zero_against_unknown() {
        let zero = with_global(|g, x| g.write(x, 0, 8, Value::NULL).unwrap());
        let unknown = with_global(|g, _| g);
        assert!(is_less_or_equal(&zero, &unknown));
        assert!(!is_less_or_equal(&unknown, &zero));

        let result = join(&zero, &unknown);
        assert_eq!(result.status(), Some(JoinStatus::RightEntails));
        let joined = result.into_graph().unwrap();
        let x = joined.global("x").unwrap();
        assert_eq!(joined.read(x, 0, 8), Ok(None));
    }

    #[test]
    fn test_shared_value_is_more_precise() {
        let (g, x) = HeapGraph::new(MachineModel::LINUX64).add_global_object(16, "x").unwrap();
        let (g, v) = g.add_value();
        let (g, w) = g.add_value();
        let g = g.write(x, 0, 8, v).unwrap();
        let shared = g.write(x, 8, 8, v).unwrap();
        let distinct = g.write(x, 8, 8, w).unwrap();

        assert!(is_less_or_equal(&shared, &distinct));
        assert!(!is_less_or_equal(&distinct, &shared));
        let result = join(&shared, &distinct);
        assert_eq!(result.status(), Some(JoinStatus::RightEntails));
        let joined = result.into_graph().unwrap();
        let first = joined.read(x, 0, 8).unwrap().unwrap();
        let second = joined.read(x, 8, 8).unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_explicit_values() {
        let (g, x) = HeapGraph::new(MachineModel::LINUX64).add_global_object(8, "x").unwrap();
        let (g, v) = g.add_value();
        let g = g.write(x, 0, 4, v).unwrap();
        let one = ExplicitValues::new().insert(v, BigInt::from(1)).0;
        let two = ExplicitValues::new().insert(v, BigInt::from(2)).0;
        let none = ExplicitValues::new();

        let same = join_with_values(&g, &one, &g, &one, JoinMode::Join).unwrap();
        assert_eq!(same.status, JoinStatus::Equal);
        assert_eq!(same.explicit.get(v), Some(&BigInt::from(1)));

        let different = join_with_values(&g, &one, &g, &two, JoinMode::Join).unwrap();
        assert_eq!(different.status, JoinStatus::Incomparable);
        assert!(!different.explicit.contains(v));

        let precise = join_with_values(&g, &one, &g, &none, JoinMode::Join).unwrap();
        assert_eq!(precise.status, JoinStatus::RightEntails);
        assert!(join_with_values(&g, &none, &g, &one, JoinMode::Inclusion).is_none());
    }

    #[test]
    fn test_disequalities() {
        let (g, x) = HeapGraph::new(MachineModel::LINUX64).add_global_object(16, "x").unwrap();
        let (g, v) = g.add_value();
        let (g, w) = g.add_value();
        let g = g.write(x, 0, 8, v).unwrap().write(x, 8, 8, w).unwrap();
        let unequal = g.add_disequality(v, w);

        let both = join(&unequal, &unequal).into_graph().unwrap();
        assert!(both.are_unequal(v, w));

        let result = join(&unequal, &g);
        assert_eq!(result.status(), Some(JoinStatus::RightEntails));
        let joined = result.into_graph().unwrap();
        assert!(!joined.are_unequal(v, w));
        assert!(is_less_or_equal(&unequal, &g));
        assert!(!is_less_or_equal(&g, &unequal));
    }

    #[test]
    fn test_frames_must_match() {
        let base = HeapGraph::new(MachineModel::LINUX64);
        let f = base.push_frame(&crate::stack::FunctionDecl::new("f")).unwrap();
        let g = base.push_frame(&crate::stack::FunctionDecl::new("g")).unwrap();
        assert!(join(&f, &f).is_mergeable());
        assert!(!join(&f, &g).is_mergeable());
        assert!(!join(&f, &base).is_mergeable());
    }

    /// A list plus parts no variable reaches: a lost block, a block only a
    /// loose address designates, and a loose plain value.
    fn with_leftovers() -> (HeapGraph, ObjectId, Value, Value) {
        let (g, _) = build_list(2);
        let (g, lost) = g.add_heap_object(8, "lost");
        let (g, held) = g.add_heap_object(8, "held");
        let (g, address) = g.add_address(held, 0, TargetSpecifier::Region);
        let (g, loose) = g.add_value();
        let g = g.add_disequality(loose, address);
        (g, lost, address, loose)
    }

    #[test]
    fn test_unpruned_join_with_itself() {
        let (g, lost, address, loose) = with_leftovers();
        let JoinResult::Merged { graph, status } = join(&g, &g) else {
            panic!("a graph must join with itself");
        };
        assert_eq!(status, JoinStatus::Equal);
        assert_eq!(graph, g);
        assert!(graph.contains_object(lost));
        assert!(graph.is_pointer(address));
        assert!(graph.are_unequal(loose, address));
        assert!(is_less_or_equal(&g, &g));
    }

    #[test]
    fn test_one_sided_leftovers_are_carried() {
        let (base, _) = build_list(2);
        let (with_lost, lost) = base.add_heap_object(8, "lost");
        assert!(!is_less_or_equal(&with_lost, &base));
        assert!(!is_less_or_equal(&base, &with_lost));

        for (a, b) in [(&with_lost, &base), (&base, &with_lost)] {
            let result = join(a, b);
            assert_eq!(result.status(), Some(JoinStatus::Incomparable));
            let joined = result.into_graph().unwrap();
            assert!(joined.contains_object(lost));
            assert!(!joined.has_leaks());
            assert!(joined.prune_unreachable().has_leaks());
        }
    }

    #[test]
    fn test_carried_address_keeps_its_target() {
        let (base, _) = build_list(2);
        let (g, held) = base.add_heap_object(8, "held");
        let (g, address) = g.add_address(held, 0, TargetSpecifier::Region);
        let joined = join(&base, &g).into_graph().unwrap();
        let pt = joined.pointer(address).copied().unwrap();
        assert_eq!(joined.object(pt.object).map(|o| o.size), Some(8));
    }

    #[test]
    fn test_doubly_linked_list_is_covered_by_summary() {
        let (concrete, _) = build_dll(3);
        let summary = abstract_lists(&concrete, &AbstractionConfig::default());
        assert!(is_less_or_equal(&concrete, &summary));
        assert!(!is_less_or_equal(&summary, &concrete));

        let joined = join(&concrete, &summary).into_graph().unwrap();
        let seg = joined.object(head_target(&joined)).cloned().unwrap();
        assert_eq!(seg.list_shape(), Some(ListShape::doubly(0, 8, 16, 2)));
        assert_eq!(joined.read(seg.id, 8, 8), Ok(Some(Value::NULL)));
        assert_eq!(joined.read(seg.id, 16, 8), Ok(Some(Value::NULL)));
    }

    #[test]
    fn test_private_payloads_pair_with_nested_object() {
        let (concrete, _, payloads) = build_list_with_payloads(3);
        let summary = abstract_lists(&concrete, &AbstractionConfig::default());
        assert!(is_less_or_equal(&concrete, &summary));
        assert!(!is_less_or_equal(&summary, &concrete));

        let result = join(&concrete, &summary);
        assert_eq!(result.status(), Some(JoinStatus::RightEntails));
        let joined = result.into_graph().unwrap();
        let seg = head_target(&joined);
        let data = joined.read(seg, 0, 8).unwrap().unwrap();
        let nested = joined.pointer(data).and_then(|pt| joined.object(pt.object)).cloned().unwrap();
        assert_eq!(nested.nesting_level, 1);
        assert_eq!(joined.read(nested.id, 0, 4), Ok(Some(Value::NULL)));
        // Every payload was absorbed, none carried.
        assert_eq!(joined.heap_objects().count(), 2);
        assert!(payloads.iter().filter(|p| joined.contains_object(**p)).count() <= 1);
    }
}
