//! Heap graph to DOT (Graphviz) conversion.
//!
//! The output is a diagnostic picture of one abstract state, not a stable
//! exchange format. It follows these conventions:
//! - **Objects** are records listing their fields. Globals and the locals of
//!   each stack frame are grouped in clusters; heap objects stand alone.
//! - **Abstract segments** get a double border and show their minimum length.
//! - **Released objects** are drawn dashed.
//! - **Values** are ellipses, labelled with their concrete integer when one is known.
//! - **Edges**:
//!   - from a field to the value it holds
//!   - from an address value to its target object, labelled with offset and specifier
//!   - dotted, undirected edges between values known to differ
//!
//! # Examples
//!
//! ```
//! use smg_rs::graph::HeapGraph;
//! use smg_rs::machine::MachineModel;
//!
//! let (g, x) = HeapGraph::new(MachineModel::LINUX64).add_global_object(8, "x").unwrap();
//! let (g, v) = g.add_value();
//! let g = g.write(x, 0, 8, v).unwrap();
//!
//! let dot = g.to_dot().unwrap();
//! assert!(dot.starts_with("digraph smg {"));
//! // Render with: dot -Tpng smg.dot -o smg.png
//! ```

use std::fmt::Write as _;

use crate::graph::HeapGraph;
use crate::object::{MemoryObject, ObjectKind};
use crate::state::SmgState;
use crate::types::ObjectId;
use crate::values::ExplicitValues;

/// Configuration options for DOT output generation.
#[derive(Debug, Clone)]
pub struct DotConfig {
    /// Shape for objects (default: "record")
    pub object_shape: &'static str,
    /// Shape for values (default: "ellipse")
    pub value_shape: &'static str,
    /// Border count of abstract segments (default: 2)
    pub segment_peripheries: u32,
    /// Style of released objects (default: "dashed")
    pub invalid_style: &'static str,
    /// Style of points-to edges (default: "solid")
    pub pointer_edge_style: &'static str,
    /// Style of disequality edges (default: "dotted")
    pub neq_edge_style: &'static str,
    /// Whether to draw the null value and the fields holding it (default: false)
    pub show_null: bool,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            object_shape: "record",
            value_shape: "ellipse",
            segment_peripheries: 2,
            invalid_style: "dashed",
            pointer_edge_style: "solid",
            neq_edge_style: "dotted",
            show_null: false,
        }
    }
}

impl HeapGraph {
    /// Converts the graph to DOT format.
    pub fn to_dot(&self) -> Result<String, std::fmt::Error> {
        self.to_dot_with_config(&DotConfig::default())
    }

    /// Converts the graph to DOT format with custom configuration.
    pub fn to_dot_with_config(&self, config: &DotConfig) -> Result<String, std::fmt::Error> {
        render(self, None, config)
    }
}

impl SmgState {
    /// Converts the state to DOT format, explicit values included.
    pub fn to_dot(&self) -> Result<String, std::fmt::Error> {
        self.to_dot_with_config(&DotConfig::default())
    }

    pub fn to_dot_with_config(&self, config: &DotConfig) -> Result<String, std::fmt::Error> {
        render(self.graph(), Some(self.explicit_values()), config)
    }
}

/// Escapes the characters that are special inside record labels.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '{' | '}' | '|' | '<' | '>' | '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn object_node(graph: &HeapGraph, obj: &MemoryObject, config: &DotConfig, dot: &mut String) -> std::fmt::Result {
    let mut header = format!("{} {} ({}B)", escape(&obj.label), obj.id, obj.size);
    if let ObjectKind::ListSegment(shape) = obj.kind {
        write!(header, " {}+ hfo={} nfo={}", shape.min_length, shape.head_offset, shape.next_offset)?;
        if let Some(prev) = shape.prev_offset {
            write!(header, " pfo={}", prev)?;
        }
    }
    if obj.nesting_level > 0 {
        write!(header, " level {}", obj.nesting_level)?;
    }
    let mut fields = vec![header];
    for edge in graph.hv_edges_of(obj.id) {
        let content = if edge.is_zero() { "0".to_string() } else { edge.value.to_string() };
        fields.push(format!("<f{}_{}> +{}:{} {}", edge.offset, edge.size, edge.offset, edge.size, content));
    }

    write!(dot, "o{} [shape={}, label=\"{{{}}}\"", obj.id.id(), config.object_shape, fields.join("|"))?;
    if obj.is_abstract() {
        write!(dot, ", peripheries={}", config.segment_peripheries)?;
    }
    if !obj.valid {
        write!(dot, ", style={}", config.invalid_style)?;
    }
    writeln!(dot, "];")
}

fn render(graph: &HeapGraph, explicit: Option<&ExplicitValues>, config: &DotConfig) -> Result<String, std::fmt::Error> {
    let mut dot = String::new();
    writeln!(dot, "digraph smg {{")?;
    writeln!(dot, "rankdir=LR;")?;

    let mut drawn: Vec<ObjectId> = Vec::new();

    // Globals
    writeln!(dot, "subgraph cluster_globals {{")?;
    writeln!(dot, "label=\"globals\";")?;
    for (_, id) in graph.globals() {
        if let Some(obj) = graph.object(id) {
            object_node(graph, obj, config, &mut dot)?;
            drawn.push(id);
        }
    }
    writeln!(dot, "}}")?;

    // One cluster per frame, outermost first
    for (depth, frame) in graph.frames().enumerate() {
        writeln!(dot, "subgraph cluster_frame_{} {{", depth)?;
        writeln!(dot, "label=\"{}\";", escape(frame.function()))?;
        for id in frame.objects() {
            if let Some(obj) = graph.object(id) {
                object_node(graph, obj, config, &mut dot)?;
                drawn.push(id);
            }
        }
        writeln!(dot, "}}")?;
    }

    // Heap and stale stack objects
    for obj in graph.objects() {
        if obj.is_null() || drawn.contains(&obj.id) {
            continue;
        }
        object_node(graph, obj, config, &mut dot)?;
    }

    // Values
    for value in graph.values() {
        if value.is_null() && !config.show_null {
            continue;
        }
        let label = match explicit.and_then(|e| e.get(value)) {
            Some(n) => format!("{} = {}", value, n),
            None => value.to_string(),
        };
        writeln!(dot, "v{} [shape={}, label=\"{}\"];", value.id(), config.value_shape, label)?;
    }

    // Field edges
    for edge in graph.hv_edges() {
        if edge.is_zero() && !config.show_null {
            continue;
        }
        writeln!(dot, "o{}:f{}_{} -> v{};", edge.object.id(), edge.offset, edge.size, edge.value.id())?;
    }

    // Points-to edges
    for pt in graph.pt_edges() {
        if pt.object.is_null() {
            continue;
        }
        writeln!(
            dot,
            "v{} -> o{} [style={}, label=\"+{} {}\"];",
            pt.value.id(),
            pt.object.id(),
            config.pointer_edge_style,
            pt.offset,
            pt.target
        )?;
    }

    // Disequalities
    for (a, b) in graph.neq().iter() {
        if (a.is_null() || b.is_null()) && !config.show_null {
            continue;
        }
        writeln!(dot, "v{} -> v{} [dir=none, style={}, label=\"!=\"];", a.id(), b.id(), config.neq_edge_style)?;
    }

    writeln!(dot, "}}")?;
    Ok(dot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstraction::fixtures::build_list;
    use crate::abstraction::{abstract_lists, AbstractionConfig};
    use crate::machine::MachineModel;
    use crate::options::SmgOptions;
    use crate::stack::FunctionDecl;
    use crate::types::Value;
    use num_bigint::BigInt;
    use test_log::test;

    #[test]
    fn test_to_dot_basic() {
        let dot = HeapGraph::new(MachineModel::LINUX64).to_dot().unwrap();
        assert!(dot.starts_with("digraph smg {"));
        assert!(dot.ends_with("}\n"));
        assert!(!dot.contains("v0 ["));
    }

    #[test]
    fn test_segment_has_double_border() {
        let (g, _) = build_list(3);
        let g = abstract_lists(&g, &AbstractionConfig::default());
        let dot = g.to_dot().unwrap();
        assert!(dot.contains("peripheries=2"));
        assert!(dot.contains("2+ hfo=0 nfo=8"));
        assert!(dot.contains("fst"));
    }

    #[test]
    fn test_frames_are_clusters() {
        let g = HeapGraph::new(MachineModel::LINUX64);
        let g = g.push_frame(&FunctionDecl::new("main")).unwrap();
        let (g, _) = g.add_stack_object(4, "x").unwrap();
        let dot = g.to_dot().unwrap();
        assert!(dot.contains("subgraph cluster_frame_0"));
        assert!(dot.contains("label=\"main\""));
    }

    #[test]
    fn test_state_shows_explicit_values() {
        let state = SmgState::new(MachineModel::LINUX64, SmgOptions::default());
        let (state, v) = state.value_for_explicit(BigInt::from(42));
        let dot = state.to_dot().unwrap();
        assert!(dot.contains(&format!("v{} [shape=ellipse, label=\"{} = 42\"]", v.id(), v)));
    }

    #[test]
    fn test_to_dot_with_config() {
        let (g, x) = HeapGraph::new(MachineModel::LINUX64).add_global_object(8, "x").unwrap();
        let g = g.write(x, 0, 8, Value::NULL).unwrap();
        let config = DotConfig {
            show_null: true,
            ..DotConfig::default()
        };
        let dot = g.to_dot_with_config(&config).unwrap();
        assert!(dot.contains("v0 ["));
        assert!(dot.contains("-> v0;"));
    }
}
