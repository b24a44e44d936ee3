//! # smg-rs: Symbolic Memory Graphs in Rust
//!
//! **`smg-rs`** is a heap-shape abstract domain for static analysis of C programs.
//! It models the memory of a program (global variables, stack frames, heap blocks
//! and the pointers between them) as a finite graph, detects memory-safety defects
//! along the way, and summarizes unbounded linked lists so that a fixpoint
//! computation over a program terminates.
//!
//! ## What is a symbolic memory graph?
//!
//! A symbolic memory graph (SMG) has two kinds of nodes: **objects** (blocks of
//! memory of a known size) and **values** (symbolic, mostly unknown, machine words).
//! Two kinds of edges connect them:
//!
//! - a *has-value* edge says "the field `offset..offset + size` of this object holds this value";
//! - a *points-to* edge says "this value is the address of byte `offset` of this object".
//!
//! Chains of list nodes built by a loop are folded into one **abstract list segment**
//! standing for "two or more" nodes, and expanded again (**materialized**) when the
//! program accesses them.
//!
//! ## Key Features
//!
//! - **Persistent states**: every operation returns a new graph sharing structure with
//!   its input, so an analysis can branch cheaply.
//! - **Byte-precise fields**: overlapping writes, zero-filled memory and block copies.
//! - **Findings, not failures**: invalid reads, writes and frees, as well as leaks, are
//!   sticky flags on the resulting state.
//! - **Lattice operations**: [`join`][crate::join::join] and
//!   [`is_less_or_equal`][crate::join::is_less_or_equal] for merging and covering states.
//!
//! ## Basic Usage
//!
//! ```rust
//! use smg_rs::machine::MachineModel;
//! use smg_rs::options::SmgOptions;
//! use smg_rs::state::{SmgState, HAS_INVALID_FREES, HAS_LEAKS};
//!
//! // 1. An empty state for a 64-bit Linux target
//! let state = SmgState::new(MachineModel::LINUX64, SmgOptions::default());
//!
//! // 2. `p = malloc(16);` with `p` a global
//! let (state, p) = state.add_global_variable(8, "p").unwrap();
//! let (state, block) = state.alloc_heap(16, "block").unwrap();
//! let state = state.write(p, 0, 8, block).unwrap();
//!
//! // 3. `free(p); free(p);`
//! let state = state.free_address(block).unwrap().remove(0);
//! let state = state.free_address(block).unwrap().remove(0);
//! assert_eq!(state.check_property(HAS_INVALID_FREES), Ok(true));
//! assert_eq!(state.check_property(HAS_LEAKS), Ok(false));
//! ```
//!
//! ## Core Components
//!
//! - **[`graph`]**: The [`HeapGraph`][crate::graph::HeapGraph] and its primitives.
//! - **[`abstraction`]**: List summarization and materialization.
//! - **[`join`]**: Join and inclusion of graphs.
//! - **[`state`]**: The [`SmgState`][crate::state::SmgState] façade used by an analysis driver.
//! - **[`verifier`]**: Internal consistency checks.
//! - **[`dot`]**: Utilities for visualizing graphs using Graphviz.

pub mod abstraction;
pub mod bitset;
pub mod dot;
pub mod edge;
pub mod error;
pub mod graph;
pub mod join;
pub mod machine;
pub mod object;
pub mod options;
pub mod stack;
pub mod state;
pub mod types;
pub mod values;
pub mod verifier;
