//! Materialization: expanding one end element of an abstract segment.
//!
//! A precise access through a pointer into a segment needs a concrete region
//! to work on. Materializing splits the segment into a fresh region and what
//! is left, and the "what is left" part is a case split:
//!
//! - the segment held exactly one element: the region takes over the
//!   segment's outgoing links and the segment disappears;
//! - the segment held more: the region links to the remaining segment,
//!   whose minimum length drops by one (but stays at least one).
//!
//! The first case is only feasible when the segment's minimum length is 1.
//! [`materialize`] splits off the first element, [`materialize_last`] the
//! last one. The new region gets its own copy of every nested object the
//! segment owns.

use crate::edge::{HasValueEdge, PointsToEdge, TargetSpecifier};
use crate::error::{Result, SmgError};
use crate::graph::HeapGraph;
use crate::object::{ListShape, MemoryObject, ObjectKind, Storage};
use crate::types::{ObjectId, Value};

use super::{field_content, redirect_pointer, FieldContent};

/// The successor states of a materialization.
#[derive(Debug, Clone)]
pub struct Materialization {
    /// The segment was exactly one element. `None` when its minimum length rules this out.
    pub length_one: Option<HeapGraph>,
    /// One concrete element next to a segment of at least one more.
    pub length_many: HeapGraph,
    /// The concrete region holding the split-off element, in both graphs.
    pub region: ObjectId,
}

impl Materialization {
    /// Both successors, the feasible ones only.
    pub fn into_graphs(self) -> Vec<HeapGraph> {
        self.length_one.into_iter().chain(std::iter::once(self.length_many)).collect()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum End {
    First,
    Last,
}

/// Expands the first element of `segment`.
pub fn materialize(graph: &HeapGraph, segment: ObjectId) -> Result<Materialization> {
    split(graph, segment, End::First)
}

/// Expands the last element of `segment`.
pub fn materialize_last(graph: &HeapGraph, segment: ObjectId) -> Result<Materialization> {
    split(graph, segment, End::Last)
}

fn split(graph: &HeapGraph, segment: ObjectId, end: End) -> Result<Materialization> {
    let seg = graph.object_or_err(segment)?.clone();
    let ObjectKind::ListSegment(shape) = seg.kind else {
        return Err(SmgError::Inconsistent(format!("{} is not a list segment", segment)));
    };
    let pointer_size = graph.machine().pointer_size();
    let is_link = |e: &HasValueEdge| e.size == pointer_size && shape.link_offsets().any(|link| link == e.offset);

    let mut base = graph.clone();
    let exit = known_link(&mut base, segment, shape.next_offset);
    let entry = shape.prev_offset.map(|prev| known_link(&mut base, segment, prev));

    // The new region gets a copy of every field the elements share, and its own nested objects.
    let region = base.fresh_object_id();
    base.insert_object_mut(MemoryObject::region(region, seg.size, seg.label.as_str(), Storage::Heap));
    let owned = nested_objects(graph, segment);
    for edge in graph.hv_edges_of(segment).filter(|e| !is_link(*e)) {
        match owned.iter().find(|(field, _)| field == edge) {
            Some((_, pt)) => {
                let copy = copy_nested(&mut base, graph, pt);
                base.insert_hv_mut(HasValueEdge::new(region, edge.offset, edge.size, copy));
            }
            None => base.insert_hv_mut(edge.relocated(region, edge.offset)),
        }
    }

    let pointers = graph.pointers_to(segment);

    let length_one = (shape.min_length <= 1).then(|| {
        let mut g = base.clone();
        g.insert_hv_mut(HasValueEdge::new(region, shape.next_offset, pointer_size, exit));
        if let (Some(prev), Some(entry)) = (shape.prev_offset, entry) {
            g.insert_hv_mut(HasValueEdge::new(region, prev, pointer_size, entry));
        }
        for pt in &pointers {
            redirect_pointer(&mut g, *pt, region, TargetSpecifier::Region);
        }
        g.remove_object_mut(segment);
        for (_, pt) in &owned {
            for stale in g.pointers_to(pt.object) {
                g.remove_value_mut(stale.value);
            }
            g.remove_object_mut(pt.object);
        }
        g
    });

    let mut many = base;
    many.set_object_mut(MemoryObject {
        kind: ObjectKind::ListSegment(ListShape {
            min_length: shape.min_length.saturating_sub(1).max(1),
            ..shape
        }),
        ..seg
    });
    match end {
        End::First => {
            for pt in pointers.iter().filter(|pt| matches!(pt.target, TargetSpecifier::First | TargetSpecifier::Region)) {
                redirect_pointer(&mut many, *pt, region, TargetSpecifier::Region);
            }
            let rest = many.address_mut(segment, shape.head_offset, TargetSpecifier::First);
            many.insert_hv_mut(HasValueEdge::new(region, shape.next_offset, pointer_size, rest));
            if let (Some(prev), Some(entry)) = (shape.prev_offset, entry) {
                many.insert_hv_mut(HasValueEdge::new(region, prev, pointer_size, entry));
                let back = many.address_mut(region, shape.head_offset, TargetSpecifier::Region);
                many.write_mut(HasValueEdge::new(segment, prev, pointer_size, back));
            }
        }
        End::Last => {
            for pt in pointers.iter().filter(|pt| pt.target == TargetSpecifier::Last) {
                redirect_pointer(&mut many, *pt, region, TargetSpecifier::Region);
            }
            many.insert_hv_mut(HasValueEdge::new(region, shape.next_offset, pointer_size, exit));
            let tail = many.address_mut(region, shape.head_offset, TargetSpecifier::Region);
            many.write_mut(HasValueEdge::new(segment, shape.next_offset, pointer_size, tail));
            if let Some(prev) = shape.prev_offset {
                let rest = many.address_mut(segment, shape.head_offset, TargetSpecifier::Last);
                many.insert_hv_mut(HasValueEdge::new(region, prev, pointer_size, rest));
            }
        }
    }

    log::debug!(
        "materialized {} from the {} end of segment {} ({}+), {} successor(s)",
        region,
        if end == End::First { "first" } else { "last" },
        segment,
        shape.min_length,
        if length_one.is_some() { 2 } else { 1 }
    );
    Ok(Materialization {
        length_one,
        length_many: many,
        region,
    })
}

/// What a link field of `segment` holds. An unknown link gets a fresh value
/// written into the segment, so every successor agrees on it.
fn known_link(graph: &mut HeapGraph, segment: ObjectId, offset: u64) -> Value {
    let pointer_size = graph.machine().pointer_size();
    match field_content(graph, segment, offset, pointer_size) {
        FieldContent::Known(value) => value,
        FieldContent::Zero => Value::NULL,
        FieldContent::Unknown => {
            let value = graph.fresh_value_mut();
            graph.insert_hv_mut(HasValueEdge::new(segment, offset, pointer_size, value));
            value
        }
    }
}

/// Fields of `owner` holding the address of a nested object, with that address.
pub(crate) fn nested_objects(graph: &HeapGraph, owner: ObjectId) -> Vec<(HasValueEdge, PointsToEdge)> {
    graph
        .hv_edges_of(owner)
        .filter_map(|e| {
            let pt = graph.pointer(e.value)?;
            graph.object(pt.object).filter(|o| o.nesting_level > 0).map(|_| (*e, *pt))
        })
        .collect()
}

/// Gives one concrete element its own copy of a nested object. Returns the
/// address of the copy, at the offset `pt` designates.
fn copy_nested(graph: &mut HeapGraph, source: &HeapGraph, pt: &PointsToEdge) -> Value {
    let Some(nested) = source.object(pt.object) else {
        return Value::NULL;
    };
    let copy = graph.fresh_object_id();
    graph.insert_object_mut(MemoryObject {
        id: copy,
        nesting_level: nested.nesting_level.saturating_sub(1),
        ..nested.clone()
    });
    for edge in source.hv_edges_of(nested.id) {
        graph.insert_hv_mut(edge.relocated(copy, edge.offset));
    }
    graph.address_mut(copy, pt.offset, TargetSpecifier::Region)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstraction::fixtures::{build_dll, build_list, build_list_with_payloads};
    use crate::abstraction::{abstract_lists, AbstractionConfig};
    use crate::verifier::{verify, CheckLevel};
    use test_log::test;

    fn abstracted_list(n: usize) -> (HeapGraph, ObjectId, Value) {
        let (g, _) = build_list(n);
        head_segment(abstract_lists(&g, &AbstractionConfig::default()))
    }

    fn head_segment(g: HeapGraph) -> (HeapGraph, ObjectId, Value) {
        let head = g.global("head").unwrap();
        let pointer = g.read(head, 0, 8).unwrap().unwrap();
        let seg = g.pointer(pointer).unwrap().object;
        (g, seg, pointer)
    }

    #[test]
    fn test_segment_of_two_has_one_successor() {
        let (g, seg, pointer) = abstracted_list(3);
        let m = materialize(&g, seg).unwrap();
        assert!(m.length_one.is_none());

        let many = &m.length_many;
        let pt = many.pointer(pointer).copied().unwrap();
        assert_eq!((pt.object, pt.target), (m.region, TargetSpecifier::Region));
        assert_eq!(many.read(m.region, 0, 8), Ok(Some(Value::NULL)));

        let link = many.read(m.region, 8, 8).unwrap().unwrap();
        let rest = many.pointer(link).copied().unwrap();
        assert_eq!((rest.object, rest.target), (seg, TargetSpecifier::First));
        assert_eq!(many.object(seg).map(|o| o.min_length()), Some(1));
        assert_eq!(verify(many, CheckLevel::Full), Ok(()));
    }

    #[test]
    fn test_segment_of_one_forks() {
        let (g, seg, pointer) = abstracted_list(3);
        let g = materialize(&g, seg).unwrap().length_many;
        let m = materialize(&g, seg).unwrap();
        // `pointer` now designates the first materialized region; follow its link.
        let first = g.pointer(pointer).unwrap().object;
        let link = g.read(first, 8, 8).unwrap().unwrap();

        let one = m.length_one.clone().unwrap();
        assert!(!one.contains_object(seg));
        assert_eq!(one.read(m.region, 8, 8), Ok(Some(Value::NULL)));
        assert_eq!(one.pointer(link).map(|pt| pt.object), Some(m.region));
        assert_eq!(verify(&one, CheckLevel::Full), Ok(()));

        let many = &m.length_many;
        assert!(many.contains_object(seg));
        assert_eq!(many.object(seg).map(|o| o.min_length()), Some(1));
        assert_eq!(verify(many, CheckLevel::Full), Ok(()));
        assert_eq!(m.into_graphs().len(), 2);
    }

    #[test]
    fn test_materialize_region_is_an_error() {
        let (g, nodes) = build_list(1);
        assert!(materialize(&g, nodes[0]).is_err());
    }

    #[test]
    fn test_last_pointer_stays_on_remainder() {
        let (g, seg, _) = abstracted_list(2);
        let mut g = g;
        let last = g.address_mut(seg, 0, TargetSpecifier::Last);
        let m = materialize(&g, seg).unwrap();
        assert_eq!(m.length_many.pointer(last).map(|pt| (pt.object, pt.target)), Some((seg, TargetSpecifier::Last)));
    }

    #[test]
    fn test_last_element_splits_off_the_tail() {
        let (mut g, seg, head) = abstracted_list(3);
        let last = g.address_mut(seg, 0, TargetSpecifier::Last);
        let m = materialize_last(&g, seg).unwrap();
        assert!(m.length_one.is_none());

        let many = &m.length_many;
        assert_eq!(many.pointer(last).map(|pt| (pt.object, pt.target)), Some((m.region, TargetSpecifier::Region)));
        assert_eq!(many.pointer(head).map(|pt| (pt.object, pt.target)), Some((seg, TargetSpecifier::First)));
        assert_eq!(many.read(m.region, 8, 8), Ok(Some(Value::NULL)));
        let link = many.read(seg, 8, 8).unwrap().unwrap();
        assert_eq!(many.pointer(link).map(|pt| pt.object), Some(m.region));
        assert_eq!(many.object(seg).map(|o| o.min_length()), Some(1));
        assert_eq!(verify(many, CheckLevel::Full), Ok(()));
    }

    #[test]
    fn test_doubly_linked_region_links_both_ways() {
        let (g, _) = build_dll(3);
        let (g, seg, head) = head_segment(abstract_lists(&g, &AbstractionConfig::default()));
        let many = materialize(&g, seg).unwrap().length_many;
        let region = many.pointer(head).unwrap().object;

        assert_eq!(many.read(region, 16, 8), Ok(Some(Value::NULL)));
        let next = many.read(region, 8, 8).unwrap().unwrap();
        assert_eq!(many.pointer(next).map(|pt| (pt.object, pt.target)), Some((seg, TargetSpecifier::First)));
        let back = many.read(seg, 16, 8).unwrap().unwrap();
        assert_eq!(many.pointer(back).map(|pt| (pt.object, pt.target)), Some((region, TargetSpecifier::Region)));
        assert_eq!(verify(&many, CheckLevel::Full), Ok(()));
    }

    #[test]
    fn test_region_gets_its_own_nested_copy() {
        let (g, _, _) = build_list_with_payloads(3);
        let (g, seg, _) = head_segment(abstract_lists(&g, &AbstractionConfig::default()));
        let nested = g.pointer(g.read(seg, 0, 8).unwrap().unwrap()).unwrap().object;

        let m = materialize(&g, seg).unwrap();
        let many = &m.length_many;
        let data = many.read(m.region, 0, 8).unwrap().unwrap();
        let copy = many.pointer(data).unwrap().object;
        assert_ne!(copy, nested);
        assert_eq!(many.object(copy).map(|o| o.nesting_level), Some(0));
        assert_eq!(many.read(copy, 0, 4), Ok(Some(Value::NULL)));
        assert!(many.contains_object(nested));
        assert_eq!(verify(many, CheckLevel::Full), Ok(()));

        // Splitting off the last element as well drops the nested object with the segment.
        let m = materialize(many, seg).unwrap();
        let one = m.length_one.unwrap();
        assert!(!one.contains_object(seg));
        assert!(!one.contains_object(nested));
        assert_eq!(verify(&one, CheckLevel::Full), Ok(()));
    }
}
