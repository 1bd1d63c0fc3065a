//! Intermediate representation for the dexopt bytecode optimizer
//!
//! The IR is very close to the Dalvik instruction set, with a few tweaks
//! that make it easier to analyze and manipulate:
//!
//! 1. Registers of arbitrary index can be addressed everywhere; the
//!    register allocator sorts out encoding constraints at the end.
//! 2. There are no 2addr or range opcode forms; instruction selection
//!    reintroduces them during lowering.
//! 3. Invokes reference only the low half of a wide argument pair
//!    (normalized form); they are expanded back at lowering time.
//! 4. Any opcode that may throw and also writes a result is split into
//!    the throwing opcode (no dest) plus an immediately following
//!    move-result-pseudo that owns the destination. This makes liveness
//!    analysis accurate: the dest is only written if the opcode did not
//!    throw. check-cast gets the same treatment, since a successful cast
//!    acts like a fresh definition with a narrower type.
//! 5. In the editable control-flow graph, gotos and try/catch markers
//!    exist only as typed edges; they are re-materialized when the graph
//!    is linearized back into an item stream.
//!
//! A method body is an ordered, doubly-linked stream of items (opcodes,
//! branch targets, try/catch markers, source positions, debug ops) stored
//! in an arena with stable 32-bit ids, so items have identity and
//! back-pointers are just ids.

pub mod call_graph;
pub mod cfg;
pub mod instruction;
pub mod item;
pub mod live_range;
pub mod liveness;
pub mod normalize;
pub mod opcode;
pub mod reaching;
pub mod refs;
pub mod scope;

pub use cfg::{BlockId, Cfg, EdgeId, EdgeKind};
pub use instruction::{IrInstruction, Payload};
pub use item::{IrCode, IrList, Item, ItemArena, ItemId, ItemKind};
pub use opcode::{Branchingness, Opcode, OpcodeGroup, RefKind};
pub use refs::{FieldId, MethodId, ProtoId, StringId, TypeId};

/// A virtual register.
pub type Reg = u32;

/// The symbolic register holding the result of the latest invoke, filled
/// new array, or const-string/class; consumed by move-result and the
/// move-result-pseudos during analysis.
pub const RESULT_REGISTER: Reg = u32::MAX;

/// Invokes with more than this many arguments must use the range encoding.
pub const MAX_NON_RANGE_ARGS: usize = 5;
