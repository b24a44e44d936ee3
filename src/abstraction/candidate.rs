//! Search for linked chains worth summarizing.

use std::collections::{BTreeMap, BTreeSet};

use crate::edge::TargetSpecifier;
use crate::graph::HeapGraph;
use crate::object::{ListShape, MemoryObject, ObjectKind};
use crate::types::{ObjectId, Value};

/// A maximal chain of compatible heap objects linked through one pointer
/// field (two for doubly-linked lists).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SummarizationCandidate {
    /// Chain elements, in list order.
    pub elements: Vec<ObjectId>,
    /// Link layout shared by the elements. The minimum length is the one of the summary.
    pub shape: ListShape,
    /// Size shared by every element.
    pub size: u64,
}

impl SummarizationCandidate {
    pub fn start(&self) -> ObjectId {
        self.elements[0]
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// The order in which candidates are applied: longest chain first, then
    /// the chain starting at the lowest object id, then doubly-linked before
    /// singly-linked, then the lowest link offsets.
    fn priority(&self) -> (std::cmp::Reverse<usize>, ObjectId, bool, u64, u64, Option<u64>) {
        (
            std::cmp::Reverse(self.len()),
            self.start(),
            !self.shape.is_doubly_linked(),
            self.shape.next_offset,
            self.shape.head_offset,
            self.shape.prev_offset,
        )
    }
}

/// What a field of an element holds, as far as list summarization cares.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum FieldContent {
    Known(Value),
    /// Covered by zero fillers but without an edge of exactly this size.
    Zero,
    Unknown,
}

pub(crate) fn field_content(graph: &HeapGraph, object: ObjectId, offset: u64, size: u64) -> FieldContent {
    match graph.hv_edge_at(object, offset, size) {
        Some(edge) => FieldContent::Known(edge.value),
        None if graph.is_covered_by_zero(object, offset, size) => FieldContent::Zero,
        None => FieldContent::Unknown,
    }
}

/// The heap region `value` points to, if that region is the private
/// sub-object of a chain element at nesting level `level`: no other field
/// refers to it and it holds no addresses of its own.
pub(crate) fn private_payload(graph: &HeapGraph, value: Value, level: u32) -> Option<&MemoryObject> {
    if value.is_null() {
        return None;
    }
    let pt = graph.pointer(value)?;
    let obj = graph.object(pt.object)?;
    let owned = pt.target == TargetSpecifier::Region
        && obj.kind == ObjectKind::Region
        && obj.is_heap()
        && obj.valid
        && !obj.externally_allocated
        && obj.nesting_level == level;
    if !owned || graph.incoming_edges(obj.id).len() != 1 {
        return None;
    }
    let flat = graph.hv_edges_of(obj.id).all(|e| e.is_zero() || !graph.is_pointer(e.value));
    flat.then_some(obj)
}

/// Whether two addresses lead to private sub-objects that one nested object can stand for.
fn payloads_compatible(graph: &HeapGraph, a: Value, a_level: u32, b: Value, b_level: u32) -> bool {
    let (Some(pa), Some(pb)) = (graph.pointer(a), graph.pointer(b)) else {
        return false;
    };
    match (private_payload(graph, a, a_level), private_payload(graph, b, b_level)) {
        (Some(x), Some(y)) => x.size == y.size && pa.offset == pb.offset,
        _ => false,
    }
}

/// Nesting level of the sub-objects owned by an element.
pub(crate) fn payload_level(obj: &MemoryObject) -> u32 {
    u32::from(obj.is_abstract())
}

/// Objects eligible as chain elements for the given linkage.
fn is_eligible(obj: &MemoryObject, shape: &ListShape) -> bool {
    if obj.is_null() || !obj.is_heap() || !obj.valid || obj.externally_allocated || obj.nesting_level > 0 {
        return false;
    }
    match obj.kind {
        ObjectKind::Region => true,
        ObjectKind::ListSegment(own) => own.same_linkage(shape),
    }
}

/// Checks that the non-link fields of two neighbours can share one summary.
///
/// They may differ where neither holds an address, or where both hold the
/// address of a private sub-object of the same size.
fn fields_compatible(graph: &HeapGraph, a: &MemoryObject, b: &MemoryObject, shape: &ListShape) -> bool {
    let pointer_size = graph.machine().pointer_size();
    let keys: BTreeSet<(u64, u64)> = graph
        .hv_edges_of(a.id)
        .chain(graph.hv_edges_of(b.id))
        .filter(|e| !e.is_zero() && !shape.overlaps_link(e.offset, e.end(), pointer_size))
        .map(|e| (e.offset, e.size))
        .collect();
    let is_address = |content: FieldContent| match content {
        FieldContent::Known(v) => !v.is_null() && graph.is_pointer(v),
        _ => false,
    };
    keys.into_iter().all(|(offset, size)| {
        let left = field_content(graph, a.id, offset, size);
        let right = field_content(graph, b.id, offset, size);
        match (left, right) {
            _ if left == right => true,
            (FieldContent::Known(x), FieldContent::Known(y)) if is_address(left) && is_address(right) => {
                payloads_compatible(graph, x, payload_level(a), y, payload_level(b))
            }
            _ => !is_address(left) && !is_address(right),
        }
    })
}

/// Whether the successor of `object` along the next link points back to it
/// through the prev link.
pub(crate) fn has_back_link(graph: &HeapGraph, object: ObjectId, shape: &ListShape) -> bool {
    let Some(prev_offset) = shape.prev_offset else {
        return false;
    };
    let pointer_size = graph.machine().pointer_size();
    let Some(next) = graph
        .hv_edge_at(object, shape.next_offset, pointer_size)
        .and_then(|e| graph.pointer(e.value))
        .map(|pt| pt.object)
    else {
        return false;
    };
    graph
        .hv_edge_at(next, prev_offset, pointer_size)
        .and_then(|e| graph.pointer(e.value))
        .is_some_and(|pt| pt.object == object && pt.offset == shape.head_offset)
}

/// Whether the prev link of `next` designates `object`, as a doubly-linked step requires.
pub(crate) fn links_back(graph: &HeapGraph, next: ObjectId, object: ObjectId, shape: &ListShape) -> bool {
    let Some(prev_offset) = shape.prev_offset else {
        return true;
    };
    let pointer_size = graph.machine().pointer_size();
    graph
        .hv_edge_at(next, prev_offset, pointer_size)
        .and_then(|e| graph.pointer(e.value))
        .is_some_and(|pt| {
            pt.object == object
                && pt.offset == shape.head_offset
                && matches!(pt.target, TargetSpecifier::Region | TargetSpecifier::Last)
        })
}

/// The successor of `object` along the linkage, if it is a valid chain step.
fn successor(graph: &HeapGraph, object: &MemoryObject, shape: &ListShape, inbound: &BTreeMap<ObjectId, usize>) -> Option<ObjectId> {
    let pointer_size = graph.machine().pointer_size();
    let edge = graph.hv_edge_at(object.id, shape.next_offset, pointer_size)?;
    let pt = graph.pointer(edge.value)?;
    if pt.offset != shape.head_offset || !matches!(pt.target, TargetSpecifier::Region | TargetSpecifier::First) {
        return None;
    }
    let next = graph.object(pt.object)?;
    if next.id == object.id || next.size != object.size || !is_eligible(next, shape) {
        return None;
    }
    if !links_back(graph, next.id, object.id, shape) {
        return None;
    }
    // The back link from the element after `next` is part of the list, not a foreign reference.
    let foreign = inbound.get(&next.id).copied().unwrap_or(0).saturating_sub(usize::from(has_back_link(graph, next.id, shape)));
    if foreign != 1 {
        return None;
    }
    fields_compatible(graph, object, next, shape).then_some(next.id)
}

/// Number of field edges holding an address of each object.
fn inbound_counts(graph: &HeapGraph) -> BTreeMap<ObjectId, usize> {
    let mut counts = BTreeMap::new();
    for edge in graph.hv_edges() {
        if let Some(pt) = graph.pointer(edge.value) {
            *counts.entry(pt.object).or_insert(0) += 1;
        }
    }
    counts
}

/// Every linkage used by some pointer field of a heap object: the
/// `(next_offset, head_offset)` pairs, plus a prev offset wherever the
/// successor points back.
fn linkages(graph: &HeapGraph) -> BTreeSet<ListShape> {
    let pointer_size = graph.machine().pointer_size();
    let mut shapes = BTreeSet::new();
    for id in graph.heap_objects() {
        for edge in graph.hv_edges_of(id).filter(|e| e.size == pointer_size && !e.is_zero()) {
            let Some(pt) = graph.pointer(edge.value) else { continue };
            shapes.insert(ListShape::singly(pt.offset, edge.offset, 1));
            for back in graph.hv_edges_of(pt.object).filter(|e| e.size == pointer_size && e.offset.abs_diff(edge.offset) >= pointer_size) {
                if graph.pointer(back.value).is_some_and(|b| b.object == id && b.offset == pt.offset) {
                    shapes.insert(ListShape::doubly(pt.offset, edge.offset, back.offset, 1));
                }
            }
        }
    }
    shapes
}

/// Finds all maximal chains of at least `min_length` elements, in application order.
pub fn find_candidates(graph: &HeapGraph, min_length: usize) -> Vec<SummarizationCandidate> {
    let inbound = inbound_counts(graph);

    let mut candidates = Vec::new();
    for shape in linkages(graph) {
        let mut succ = BTreeMap::new();
        let mut has_pred = BTreeSet::new();
        for id in graph.heap_objects() {
            let Some(obj) = graph.object(id) else { continue };
            if !is_eligible(obj, &shape) {
                continue;
            }
            if let Some(next) = successor(graph, obj, &shape, &inbound) {
                succ.insert(id, next);
                has_pred.insert(next);
            }
        }

        // Chain heads first; whatever stays unvisited lies on a cycle.
        let mut visited = BTreeSet::new();
        let heads: Vec<ObjectId> = succ.keys().copied().filter(|id| !has_pred.contains(id)).collect();
        let rest: Vec<ObjectId> = succ.keys().copied().collect();
        for start in heads.into_iter().chain(rest) {
            if visited.contains(&start) {
                continue;
            }
            let mut elements = vec![start];
            visited.insert(start);
            let mut current = start;
            while let Some(&next) = succ.get(&current) {
                if !visited.insert(next) {
                    break;
                }
                elements.push(next);
                current = next;
            }
            if elements.len() >= min_length.max(2) {
                let size = graph.object(start).map_or(0, |o| o.size);
                candidates.push(SummarizationCandidate { elements, shape, size });
            }
        }
    }

    candidates.sort_by_key(|c| c.priority());
    log::trace!("found {} summarization candidates", candidates.len());
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstraction::fixtures::{build_dll, build_list, build_list_with_payloads};
    use test_log::test;

    #[test]
    fn test_finds_whole_list() {
        let (g, nodes) = build_list(4);
        let candidates = find_candidates(&g, 2);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].elements, nodes);
        assert_eq!(candidates[0].shape, ListShape::singly(0, 8, 1));
        assert_eq!(candidates[0].size, 16);
    }

    #[test]
    fn test_single_node_is_not_a_candidate() {
        let (g, _) = build_list(1);
        assert!(find_candidates(&g, 2).is_empty());
    }

    #[test]
    fn test_threshold() {
        let (g, _) = build_list(3);
        assert!(find_candidates(&g, 4).is_empty());
        assert_eq!(find_candidates(&g, 3).len(), 1);
    }

    #[test]
    fn test_shared_node_breaks_chain() {
        let (g, nodes) = build_list(4);
        // A second global pointing into the middle of the list.
        let (g, other) = g.add_global_object(8, "other").unwrap();
        let (g, addr) = g.add_address(nodes[2], 0, TargetSpecifier::Region);
        let g = g.write(other, 0, 8, addr).unwrap();
        let candidates = find_candidates(&g, 2);
        let chains: Vec<_> = candidates.iter().map(|c| c.elements.clone()).collect();
        // Nodes are allocated back to front, so the tail chain starts at the lower id.
        assert_eq!(chains, vec![vec![nodes[2], nodes[3]], vec![nodes[0], nodes[1]]]);
    }

    #[test]
    fn test_different_sizes_break_chain() {
        let (g, nodes) = build_list(2);
        let (g, big) = g.add_heap_object(32, "big");
        let (g, addr) = g.add_address(nodes[0], 0, TargetSpecifier::Region);
        let g = g.write(big, 8, 8, addr).unwrap();
        let (g, gp) = g.add_global_object(8, "gp").unwrap();
        let (g, big_addr) = g.add_address(big, 0, TargetSpecifier::Region);
        let g = g.write(gp, 0, 8, big_addr).unwrap();
        let candidates = find_candidates(&g, 2);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].elements, nodes);
    }

    #[test]
    fn test_private_payloads_join_the_chain() {
        let (g, nodes, _) = build_list_with_payloads(5);
        let candidates = find_candidates(&g, 2);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].elements, nodes);
    }

    #[test]
    fn test_payloads_of_different_sizes_break_chain() {
        let (g, nodes) = build_list(2);
        let (g, d1) = g.add_heap_object(4, "d1");
        let (g, d2) = g.add_heap_object(8, "d2");
        let (g, a1) = g.add_address(d1, 0, TargetSpecifier::Region);
        let (g, a2) = g.add_address(d2, 0, TargetSpecifier::Region);
        let g = g.write(nodes[0], 0, 8, a1).unwrap().write(nodes[1], 0, 8, a2).unwrap();
        assert!(find_candidates(&g, 2).is_empty());
    }

    #[test]
    fn test_shared_payload_is_not_private() {
        let (g, _, payloads) = build_list_with_payloads(3);
        let (g, alias) = g.add_global_object(8, "alias").unwrap();
        let addr = g.address_of(payloads[1], 0, TargetSpecifier::Region).unwrap();
        let g = g.write(alias, 0, 8, addr).unwrap();
        assert!(private_payload(&g, addr, 0).is_none());
        assert!(find_candidates(&g, 2).is_empty());
    }

    #[test]
    fn test_finds_doubly_linked_list() {
        let (g, nodes) = build_dll(4);
        let candidates = find_candidates(&g, 2);
        assert_eq!(candidates[0].elements, nodes);
        assert_eq!(candidates[0].shape, ListShape::doubly(0, 8, 16, 1));
    }

    #[test]
    fn test_broken_back_link_ends_dll_chain() {
        let (g, nodes) = build_dll(3);
        let g = g.write(nodes[2], 16, 8, Value::NULL).unwrap();
        let candidates = find_candidates(&g, 2);
        assert_eq!(candidates[0].elements, vec![nodes[0], nodes[1]]);
        assert!(candidates[0].shape.is_doubly_linked());
    }

    #[test]
    fn test_cycle() {
        let (g, nodes) = build_list(3);
        let (g, first) = g.add_address(nodes[0], 0, TargetSpecifier::Region);
        let g = g.write(nodes[2], 8, 8, first).unwrap();
        // The head pointer and the back link both reach the first node, so the
        // chain starts there and stops before closing the cycle.
        let candidates = find_candidates(&g, 2);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].elements, nodes);
    }
}
