//! Fixpoint iteration and abstract domains for the dexopt optimizer
//!
//! This crate provides the analysis substrate that every dataflow client in
//! dexopt is built on: Bourdoncle weak topological orderings, a monotonic
//! fixpoint iterator parameterized on a graph interface and an abstract
//! domain, and the library of abstract domains (constants, signs, intervals,
//! powersets, patricia-tree environments, partitions).
//!
//! Nothing in here knows about the IR. Dataflow clients that do (liveness,
//! reaching definitions, live ranges, the call graph) live with the IR.

pub mod domains;
pub mod fixpoint;
pub mod wto;

pub use domains::AbstractDomain;
pub use fixpoint::{
    BackwardsGraph, FixpointContext, FixpointTransfer, GraphInterface, MonotonicFixpointIterator,
};
pub use wto::{WeakTopologicalOrdering, WtoComponentRef};
