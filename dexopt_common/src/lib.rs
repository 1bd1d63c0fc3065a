//! Shared utilities for the dexopt bytecode optimizer
//!
//! This crate hosts the pieces that every other dexopt crate needs: the
//! statistics counters that transform passes report, and a small
//! union-find used by live-range computations.
//!
//! There is deliberately no shared error type. Malformed input is an
//! unrecoverable bug upstream of this core and asserts at the structural
//! boundary that detects it, with a dump of the offending graph; an
//! inapplicable transformation is reported by a boolean return from the
//! attempting API, leaving the code unmodified. Nothing in between
//! exists to propagate.

pub mod stats;
pub mod union_find;

pub use stats::PassStats;
pub use union_find::UnionFind;
