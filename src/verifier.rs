//! Consistency verifier for heap graphs.
//!
//! The checks below encode invariants the graph primitives are supposed to
//! maintain. A failing check is a bug in this crate, never a finding about the
//! analyzed program, so it surfaces as [`SmgError::Inconsistent`].

use std::collections::{BTreeMap, BTreeSet};

use crate::edge::HasValueEdge;
use crate::error::{Result, SmgError};
use crate::graph::HeapGraph;
use crate::object::{ObjectKind, Storage};
use crate::types::{ObjectId, Value};

/// How much checking to do.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub enum CheckLevel {
    #[default]
    None,
    /// Cheap structural checks.
    Half,
    /// Everything.
    Full,
}

/// Runs the checks enabled at `level`.
pub fn verify(graph: &HeapGraph, level: CheckLevel) -> Result<()> {
    if level == CheckLevel::None {
        return Ok(());
    }
    check(verify_null(graph), "null object and null address")?;
    check(verify_partition(graph), "storage partition")?;
    check(verify_edge_endpoints(graph), "edge endpoints")?;
    check(verify_field_consistency(graph), "field consistency")?;
    if level == CheckLevel::Full {
        check(verify_pointer_injectivity(graph), "points-to injectivity")?;
        check(verify_neq(graph), "disequality relation")?;
        check(verify_bounds(graph), "field bounds")?;
        check(verify_segments(graph), "list segments")?;
    }
    Ok(())
}

fn check(result: Result<(), String>, what: &str) -> Result<()> {
    result.map_err(|reason| {
        log::error!("SMG consistency check '{}' failed: {}", what, reason);
        SmgError::Inconsistent(format!("{}: {}", what, reason))
    })
}

fn verify_null(graph: &HeapGraph) -> Result<(), String> {
    let null = graph.object(ObjectId::NULL).ok_or("null object missing")?;
    if null.valid || null.size != 0 {
        return Err("null object must be invalid and empty".to_string());
    }
    match graph.pointer(Value::NULL) {
        Some(pt) if pt.object.is_null() && pt.offset == 0 => {}
        _ => return Err("null value must point to the null object".to_string()),
    }
    if graph.hv_edges_of(ObjectId::NULL).next().is_some() {
        return Err("null object has fields".to_string());
    }
    Ok(())
}

fn verify_partition(graph: &HeapGraph) -> Result<(), String> {
    let mut owner: BTreeMap<ObjectId, &'static str> = BTreeMap::new();
    let mut claim = |id: ObjectId, part: &'static str| -> Result<(), String> {
        if let Some(previous) = owner.insert(id, part) {
            return Err(format!("{} belongs to both {} and {}", id, previous, part));
        }
        Ok(())
    };

    for (name, id) in graph.globals() {
        let obj = graph.object(id).ok_or_else(|| format!("global '{}' has no object", name))?;
        if obj.storage != Storage::Global {
            return Err(format!("global '{}' has storage {:?}", name, obj.storage));
        }
        claim(id, "globals")?;
    }
    for (depth, frame) in graph.frames().enumerate() {
        for id in frame.objects() {
            let obj = graph.object(id).ok_or_else(|| format!("frame '{}' refers to missing {}", frame.function(), id))?;
            if obj.storage != Storage::Stack(depth) {
                return Err(format!("{} in frame {} has storage {:?}", id, depth, obj.storage));
            }
            claim(id, "stack")?;
        }
    }
    for id in graph.heap_objects() {
        let obj = graph.object(id).ok_or_else(|| format!("heap set refers to missing {}", id))?;
        if !obj.is_heap() {
            return Err(format!("heap object {} has storage {:?}", id, obj.storage));
        }
        claim(id, "heap")?;
    }
    for obj in graph.objects().filter(|o| !o.is_null()) {
        if obj.is_heap() && !graph.is_heap_object(obj.id) {
            return Err(format!("heap object {} missing from the heap set", obj.id));
        }
        if obj.storage == Storage::Global && !owner.contains_key(&obj.id) {
            return Err(format!("global object {} is not registered", obj.id));
        }
    }
    Ok(())
}

fn verify_edge_endpoints(graph: &HeapGraph) -> Result<(), String> {
    for edge in graph.hv_edges() {
        let obj = graph.object(edge.object).ok_or_else(|| format!("{} starts at a missing object", edge))?;
        if !obj.is_accessible() {
            return Err(format!("{} belongs to an invalid object", edge));
        }
        if !graph.contains_value(edge.value) {
            return Err(format!("{} holds an unknown value", edge));
        }
    }
    for pt in graph.pt_edges() {
        if !graph.contains_object(pt.object) {
            return Err(format!("{} targets a missing object", pt));
        }
        if !graph.contains_value(pt.value) {
            return Err(format!("{} starts at an unknown value", pt));
        }
    }
    Ok(())
}

fn verify_field_consistency(graph: &HeapGraph) -> Result<(), String> {
    for obj in graph.objects() {
        let edges: Vec<&HasValueEdge> = graph.hv_edges_of(obj.id).collect();
        for (i, a) in edges.iter().enumerate() {
            for b in &edges[i + 1..] {
                if !a.is_consistent_with(b) {
                    return Err(format!("{} and {} disagree", a, b));
                }
                if a.overlaps(b) && !a.is_zero() && !b.is_zero() {
                    return Err(format!("{} and {} overlap", a, b));
                }
            }
        }
    }
    Ok(())
}

fn verify_pointer_injectivity(graph: &HeapGraph) -> Result<(), String> {
    let mut seen = BTreeSet::new();
    for pt in graph.pt_edges() {
        if !seen.insert((pt.object, pt.offset, pt.target)) {
            return Err(format!("two values point to {}+{} [{}]", pt.object, pt.offset, pt.target));
        }
    }
    Ok(())
}

fn verify_neq(graph: &HeapGraph) -> Result<(), String> {
    for (a, b) in graph.neq().iter() {
        if !graph.neq().contains(b, a) {
            return Err(format!("{} != {} is not symmetric", a, b));
        }
        if !graph.contains_value(a) || !graph.contains_value(b) {
            return Err(format!("{} != {} mentions an unknown value", a, b));
        }
    }
    for value in graph.values() {
        if graph.are_unequal(value, value) {
            return Err(format!("{} is unequal to itself", value));
        }
    }
    Ok(())
}

fn verify_bounds(graph: &HeapGraph) -> Result<(), String> {
    for edge in graph.hv_edges() {
        let size = graph.object(edge.object).map_or(0, |o| o.size);
        if edge.end() > size {
            return Err(format!("{} exceeds the object size {}", edge, size));
        }
    }
    Ok(())
}

fn verify_segments(graph: &HeapGraph) -> Result<(), String> {
    let pointer_size = graph.machine().pointer_size();
    for obj in graph.objects() {
        let ObjectKind::ListSegment(shape) = obj.kind else {
            continue;
        };
        if !obj.is_heap() {
            return Err(format!("segment {} is not on the heap", obj.id));
        }
        if shape.min_length == 0 {
            return Err(format!("segment {} has minimum length 0", obj.id));
        }
        if shape.link_offsets().any(|link| link + pointer_size > obj.size) || shape.head_offset >= obj.size.max(1) {
            return Err(format!("segment {} has a link outside the object", obj.id));
        }
        if shape.prev_offset.is_some_and(|prev| prev.abs_diff(shape.next_offset) < pointer_size) {
            return Err(format!("segment {} has overlapping links", obj.id));
        }
        for link in shape.link_offsets() {
            let linked = graph.hv_edge_at(obj.id, link, pointer_size).is_some() || graph.is_covered_by_zero(obj.id, link, pointer_size);
            if !linked {
                return Err(format!("segment {} has no link field at {}", obj.id, link));
            }
        }
    }
    for obj in graph.objects().filter(|o| o.nesting_level > 0) {
        if !obj.is_heap() || obj.is_abstract() {
            return Err(format!("nested object {} must be a heap region", obj.id));
        }
        let owned = graph
            .incoming_edges(obj.id)
            .iter()
            .all(|e| graph.object(e.object).is_some_and(|owner| owner.is_summary()));
        if !owned {
            return Err(format!("nested object {} is referenced from a concrete object", obj.id));
        }
    }
    Ok(())
}
