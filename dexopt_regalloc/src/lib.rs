//! Register allocation for the dexopt optimizer
//!
//! A graph-coloring allocator over live ranges: registers are renumbered
//! to live ranges, a type-aware interference graph is built from
//! liveness, moves are coalesced, and the graph is colored by
//! simplify/select using Smith's colorability criterion for registers of
//! mixed widths. Invokes that need the /range encoding get contiguous
//! operand blocks, parameters land in the highest registers as the
//! calling convention demands, and anything that cannot be colored is
//! spilled (or, optionally, split around a conflicting range) before the
//! pipeline reruns.
//!
//! Instruction selection is a separate post-allocation pass that picks
//! the narrowest wire encodings.

pub mod coloring;
pub mod interference;
pub mod register_type;
pub mod select;

pub use coloring::{Allocator, AllocatorConfig, RegisterTransform, SpillPlan};
pub use interference::{Graph, RangeSet};
pub use register_type::RegisterType;
