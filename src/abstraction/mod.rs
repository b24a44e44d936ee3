//! List abstraction: summarizing chains of heap objects and expanding them again.
//!
//! Programs that build lists in a loop produce a new heap object per
//! iteration. To keep the state space finite, maximal chains of compatible
//! objects are replaced by one abstract list segment that stands for "at least
//! two" elements.
//!
//! | Step | Function |
//! |------|----------|
//! | Find chains | [`find_candidates`] |
//! | Summarize one chain | [`apply`] |
//! | Summarize until nothing is left | [`abstract_lists`] |
//! | Expand the first or last element again | [`materialize`], [`materialize_last`] |
//!
//! # Summarizing
//!
//! A chain qualifies when its elements are valid heap objects of one size,
//! each linked to the next through a pointer field at the same offset (and,
//! for doubly-linked lists, back through a second one), every element but the
//! first has no other incoming reference, and neighbours agree on every field
//! holding an address. Two fields holding addresses of private sub-objects of
//! the same size also agree: those sub-objects fold into one nested object
//! (nesting level 1) that every element owns a copy of.
//!
//! The segment keeps the fields all elements agree on, the zero bytes they
//! all share, the link leaving the last element and, for doubly-linked
//! lists, the link leaving the first one backwards. Pointers into the chain
//! are redirected to the segment and tagged
//! [`First`][TargetSpecifier::First], [`Last`][TargetSpecifier::Last] or
//! [`All`][TargetSpecifier::All].
//!
//! Candidates are applied longest chain first, ties going to the chain that
//! starts at the lowest object id. Every application removes at least one
//! object, so the loop terminates.

mod candidate;
mod materialize;

pub use candidate::{find_candidates, SummarizationCandidate};
pub(crate) use candidate::{field_content, has_back_link, links_back, payload_level, private_payload, FieldContent};
pub use materialize::{materialize, materialize_last, Materialization};

use crate::bitset::ByteMask;
use crate::edge::{HasValueEdge, PointsToEdge, TargetSpecifier};
use crate::graph::HeapGraph;
use crate::object::{ListShape, MemoryObject, ObjectKind, Storage};
use crate::types::{ObjectId, Value};

/// Minimum length recorded on a freshly summarized segment.
pub const SUMMARY_MIN_LENGTH: u32 = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AbstractionConfig {
    /// Shortest chain that gets summarized (values below 2 are treated as 2).
    pub min_chain_length: usize,
}

impl Default for AbstractionConfig {
    fn default() -> Self {
        Self { min_chain_length: 2 }
    }
}

/// Summarizes chains until no candidate is left.
pub fn abstract_lists(graph: &HeapGraph, config: &AbstractionConfig) -> HeapGraph {
    let mut graph = graph.clone();
    while let Some(candidate) = find_candidates(&graph, config.min_chain_length).into_iter().next() {
        graph = apply(&graph, &candidate);
    }
    graph
}

/// Replaces the chain described by `candidate` with one abstract segment.
pub fn apply(graph: &HeapGraph, candidate: &SummarizationCandidate) -> HeapGraph {
    let pointer_size = graph.machine().pointer_size();
    let shape = candidate.shape;
    let elements = &candidate.elements;
    let (Some(&first), Some(&last)) = (elements.first(), elements.last()) else {
        return graph.clone();
    };
    let off_link = |e: &HasValueEdge| !shape.overlaps_link(e.offset, e.end(), pointer_size);

    let mut result = graph.clone();
    let segment = result.fresh_object_id();
    let label = graph.object(first).map_or_else(|| "list".to_string(), |o| o.label.clone());
    let total: u32 = elements.iter().filter_map(|id| graph.object(*id)).map(|o| o.min_length()).sum();
    result.insert_object_mut(MemoryObject {
        kind: ObjectKind::ListSegment(ListShape {
            min_length: total.min(SUMMARY_MIN_LENGTH),
            ..shape
        }),
        ..MemoryObject::region(segment, candidate.size, label, Storage::Heap)
    });

    // Zero bytes shared by every element, except the links.
    let mut zeros = shared_zeros(graph, elements);
    for link in shape.link_offsets() {
        zeros.remove_range(link..link + pointer_size);
    }
    for run in zeros.runs() {
        result.insert_hv_mut(HasValueEdge::new(segment, run.start, run.end - run.start, Value::NULL));
    }

    // Fields every element agrees on, and fields leading to private sub-objects.
    let mut payloads = Vec::new();
    for edge in graph.hv_edges_of(first).filter(|e| !e.is_zero() && off_link(*e)) {
        let shared = elements[1..]
            .iter()
            .all(|id| graph.hv_edge_at(*id, edge.offset, edge.size).is_some_and(|e| e.value == edge.value));
        if shared {
            result.insert_hv_mut(edge.relocated(segment, edge.offset));
            continue;
        }
        let owned: Option<Vec<ObjectId>> = elements
            .iter()
            .map(|id| {
                let level = graph.object(*id).map_or(0, payload_level);
                let value = graph.hv_edge_at(*id, edge.offset, edge.size)?.value;
                private_payload(graph, value, level).map(|o| o.id)
            })
            .collect();
        if let Some(owned) = owned {
            let nested = fold_payloads(graph, &mut result, &owned);
            let offset = graph.pointer(edge.value).map_or(0, |pt| pt.offset);
            let address = result.address_mut(nested, offset, TargetSpecifier::Region);
            result.insert_hv_mut(HasValueEdge::new(segment, edge.offset, edge.size, address));
            payloads.extend(owned);
        }
    }

    // The links leaving the chain: forwards from the last element, backwards from the first.
    let exit = link_or_fresh(graph, &mut result, last, shape.next_offset);
    result.insert_hv_mut(HasValueEdge::new(segment, shape.next_offset, pointer_size, exit));
    if let Some(prev_offset) = shape.prev_offset {
        let entry = link_or_fresh(graph, &mut result, first, prev_offset);
        result.insert_hv_mut(HasValueEdge::new(segment, prev_offset, pointer_size, entry));
    }

    // Links inside the chain disappear with the elements, unless something else holds them too.
    let mut inner_edges = Vec::new();
    for (index, id) in elements.iter().enumerate() {
        if index + 1 < elements.len() {
            inner_edges.extend(graph.hv_edge_at(*id, shape.next_offset, pointer_size).copied());
        }
        if let Some(prev) = shape.prev_offset.filter(|_| index > 0) {
            inner_edges.extend(graph.hv_edge_at(*id, prev, pointer_size).copied());
        }
    }
    let inner_links: Vec<Value> = inner_edges
        .iter()
        .map(|e| e.value)
        .filter(|v| graph.edges_with_value(*v).iter().all(|e| inner_edges.contains(e)))
        .collect();
    for value in &inner_links {
        result.remove_value_mut(*value);
    }

    for (index, id) in elements.iter().enumerate() {
        for pt in graph.pointers_to(*id) {
            if inner_links.contains(&pt.value) {
                continue;
            }
            let target = redirected_specifier(index, elements.len(), pt.target);
            redirect_pointer(&mut result, pt, segment, target);
        }
    }

    for id in elements.iter().chain(&payloads) {
        result.remove_object_mut(*id);
    }

    log::debug!(
        "summarized {} objects starting at {} into segment {} (nfo={}, hfo={}, {} nested)",
        elements.len(),
        first,
        segment,
        shape.next_offset,
        shape.head_offset,
        payloads.len()
    );
    result
}

/// Bytes known to be zero in every one of `objects`.
fn shared_zeros(graph: &HeapGraph, objects: &[ObjectId]) -> ByteMask {
    let mut zeros = objects.first().map(|id| graph.null_bytes(*id)).unwrap_or_default();
    for id in objects.iter().skip(1) {
        zeros = zeros.intersection(&graph.null_bytes(*id));
    }
    zeros
}

/// What a link field of `object` holds, a fresh value when nothing is known.
fn link_or_fresh(graph: &HeapGraph, result: &mut HeapGraph, object: ObjectId, offset: u64) -> Value {
    match field_content(graph, object, offset, graph.machine().pointer_size()) {
        FieldContent::Known(value) => value,
        FieldContent::Zero => Value::NULL,
        FieldContent::Unknown => result.fresh_value_mut(),
    }
}

/// Creates the nested object standing for the private sub-objects `owned`,
/// one per chain element. Pointers to them move to the nested object.
fn fold_payloads(graph: &HeapGraph, result: &mut HeapGraph, owned: &[ObjectId]) -> ObjectId {
    let nested = result.fresh_object_id();
    let template = owned.first().and_then(|id| graph.object(*id)).cloned();
    let (size, label) = template.map_or((0, String::new()), |o| (o.size, o.label));
    result.insert_object_mut(MemoryObject {
        nesting_level: 1,
        ..MemoryObject::region(nested, size, label, Storage::Heap)
    });
    for run in shared_zeros(graph, owned).runs() {
        result.insert_hv_mut(HasValueEdge::new(nested, run.start, run.end - run.start, Value::NULL));
    }
    if let Some(&first) = owned.first() {
        for edge in graph.hv_edges_of(first).filter(|e| !e.is_zero()) {
            let shared = owned[1..]
                .iter()
                .all(|id| graph.hv_edge_at(*id, edge.offset, edge.size).is_some_and(|e| e.value == edge.value));
            if shared {
                result.insert_hv_mut(edge.relocated(nested, edge.offset));
            }
        }
    }
    for id in owned {
        for pt in graph.pointers_to(*id) {
            redirect_pointer(result, pt, nested, TargetSpecifier::Region);
        }
    }
    nested
}

fn redirected_specifier(index: usize, len: usize, original: TargetSpecifier) -> TargetSpecifier {
    use TargetSpecifier::*;
    match original {
        Region | First if index == 0 => First,
        Region | Last if index + 1 == len => Last,
        _ => All,
    }
}

/// Moves a points-to edge onto a new target, merging with the value that
/// already denotes that address, if any.
pub(crate) fn redirect_pointer(graph: &mut HeapGraph, pt: PointsToEdge, object: ObjectId, target: TargetSpecifier) {
    let existing = graph.address_of(object, pt.offset, target);
    graph.insert_pt_mut(PointsToEdge { object, target, ..pt });
    if let Some(existing) = existing.filter(|v| *v != pt.value) {
        graph.merge_values_mut(existing, pt.value);
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::edge::TargetSpecifier;
    use crate::graph::HeapGraph;
    use crate::machine::MachineModel;
    use crate::types::{ObjectId, Value};

    /// A global `head` pointing to a list of `n` 16-byte nodes. Each node has
    /// a zeroed data word at offset 0 and the link at offset 8; the last link is null.
    pub(crate) fn build_list(n: usize) -> (HeapGraph, Vec<ObjectId>) {
        let (g, head) = HeapGraph::new(MachineModel::LINUX64).add_global_object(8, "head").unwrap();
        let (g, nodes) = prepend_nodes(g, n, Value::NULL, |g, _| (g, Value::NULL));
        let first = nodes.first().map_or(Value::NULL, |n| g.address_of(*n, 0, TargetSpecifier::Region).unwrap());
        (g.write(head, 0, 8, first).unwrap(), nodes)
    }

    /// Allocates `n` nodes in front of `next`, the data word of each one
    /// produced by `data`. Returns the nodes in list order.
    pub(crate) fn prepend_nodes(
        mut g: HeapGraph,
        n: usize,
        mut next: Value,
        mut data: impl FnMut(HeapGraph, usize) -> (HeapGraph, Value),
    ) -> (HeapGraph, Vec<ObjectId>) {
        let mut nodes = Vec::new();
        for i in 0..n {
            let (g1, node) = g.add_heap_object(16, "node");
            let (g1, value) = data(g1, i);
            let g1 = g1.write(node, 0, 8, value).unwrap();
            let g1 = g1.write(node, 8, 8, next).unwrap();
            let (g1, addr) = g1.add_address(node, 0, TargetSpecifier::Region);
            g = g1;
            next = addr;
            nodes.push(node);
        }
        nodes.reverse();
        (g, nodes)
    }

    /// Like [`build_list`], but the data word of every node points to a
    /// zeroed 4-byte object of its own. Returns the nodes and their data objects.
    pub(crate) fn build_list_with_payloads(n: usize) -> (HeapGraph, Vec<ObjectId>, Vec<ObjectId>) {
        let (g, head) = HeapGraph::new(MachineModel::LINUX64).add_global_object(8, "head").unwrap();
        let mut payloads = Vec::new();
        let (g, nodes) = prepend_nodes(g, n, Value::NULL, |g, _| {
            let (g, data) = g.add_heap_object(4, "data");
            let g = g.write(data, 0, 4, Value::NULL).unwrap();
            payloads.push(data);
            g.add_address(data, 0, TargetSpecifier::Region)
        });
        payloads.reverse();
        let first = nodes.first().map_or(Value::NULL, |n| g.address_of(*n, 0, TargetSpecifier::Region).unwrap());
        (g.write(head, 0, 8, first).unwrap(), nodes, payloads)
    }

    /// A global `head` pointing to a doubly-linked list of `n` 24-byte nodes:
    /// a zeroed data word at offset 0, `next` at 8 and `prev` at 16.
    pub(crate) fn build_dll(n: usize) -> (HeapGraph, Vec<ObjectId>) {
        let (mut g, head) = HeapGraph::new(MachineModel::LINUX64).add_global_object(8, "head").unwrap();
        let mut nodes = Vec::new();
        for _ in 0..n {
            let (g1, node) = g.add_heap_object(24, "dnode");
            g = g1.write(node, 0, 8, Value::NULL).unwrap();
            nodes.push(node);
        }
        let mut prev = Value::NULL;
        for (i, node) in nodes.iter().enumerate() {
            let (g1, next) = match nodes.get(i + 1) {
                Some(next) => g.add_address(*next, 0, TargetSpecifier::Region),
                None => (g, Value::NULL),
            };
            let g1 = g1.write(*node, 8, 8, next).unwrap().write(*node, 16, 8, prev).unwrap();
            let (g1, addr) = g1.add_address(*node, 0, TargetSpecifier::Region);
            g = g1;
            prev = addr;
        }
        let first = nodes.first().map_or(Value::NULL, |n| g.address_of(*n, 0, TargetSpecifier::Region).unwrap());
        (g.write(head, 0, 8, first).unwrap(), nodes)
    }
}
