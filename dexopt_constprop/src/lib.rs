//! Constant propagation for the dexopt optimizer
//!
//! Three tiers share one set of instruction analyzers:
//!
//! * the intraprocedural fixpoint ([`intra`]) runs over a single method's
//!   CFG and refines register values across branches;
//! * the whole-program state ([`whole_program`]) summarizes static field
//!   values and method return values across the scope;
//! * the interprocedural iterator ([`interprocedural`]) runs over the
//!   call graph and refines argument summaries per call site.
//!
//! The [`transform`] module consumes the analysis results and rewrites
//! the code: folding branches, materializing constants, deleting
//! redundant puts and synthesizing guaranteed null-pointer exceptions.

pub mod analyzer;
pub mod domain;
pub mod interprocedural;
pub mod intra;
pub mod transform;
pub mod whole_program;

pub use analyzer::{InstructionAnalyzer, InstructionAnalyzerCombiner};
pub use domain::{ConstantArrayDomain, ConstantEnvironment, ConstantValue};
pub use intra::IntraFixpointIterator;
pub use transform::Transform;
pub use whole_program::WholeProgramState;
