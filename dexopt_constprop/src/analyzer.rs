//! Instruction analyzers and their combiner
//!
//! A sub-analyzer describes how to mutate a [`ConstantEnvironment`] for
//! the opcode groups it cares about. Each hook returns `false` to let
//! subsequent sub-analyzers run and `true` when no later analyzer could
//! refine the environment further. The combiner dispatches on the opcode
//! group and calls the chain in order; ordering is the key invariant
//! (e.g. the local-array analyzer must see an aput before the
//! heap-escape analyzer does, and the primitive analyzer runs last with
//! its set-the-dest-to-top default).

use crate::domain::{ConstantArrayDomain, ConstantEnvironment, ConstantValue, RESULT_REGISTER};
use crate::whole_program::WholeProgramState;
use dexopt_analysis::domains::{AbstractDomain, SignedConstantDomain};
use dexopt_ir::refs::{self, FieldId, MethodId, TypeId};
use dexopt_ir::{IrInstruction, ItemId, Opcode, OpcodeGroup, Reg};

/// The register an instruction's value lands in: the real dest when the
/// opcode owns one, the symbolic result register otherwise.
pub fn dest_register(insn: &IrInstruction) -> Reg {
    if insn.has_dest() {
        insn.dest()
    } else {
        RESULT_REGISTER
    }
}

/// Whether the instruction produces any value at all (into a dest or the
/// result register).
fn writes_result(insn: &IrInstruction) -> bool {
    insn.has_dest()
        || insn.opcode().has_move_result_pseudo()
        || insn.opcode().is_invoke()
        || insn.opcode() == Opcode::FilledNewArray
}

/// One sub-analyzer. Every hook defaults to "not handled".
#[allow(unused_variables)]
pub trait InstructionAnalyzer {
    fn analyze_load_param(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_nop(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_move(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_move_result(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_move_exception(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_return(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_monitor(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_const(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_const_string(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_const_class(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_check_cast(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_instance_of(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_array_length(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_new_instance(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_new_array(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_filled_new_array(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_fill_array_data(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_throw(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_goto(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_switch(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_cmp(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_if(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_aget(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_aput(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_iget(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_iput(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_sget(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_sput(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_invoke(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_unop(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_binop(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
    fn analyze_binop_lit(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool { false }
}

/// Runs each sub-analyzer in order on an instruction and stops at the
/// first one that reports the instruction handled.
pub struct InstructionAnalyzerCombiner<'a> {
    analyzers: Vec<Box<dyn InstructionAnalyzer + 'a>>,
}

macro_rules! dispatch {
    ($self:ident, $method:ident, $item:ident, $insn:ident, $env:ident) => {{
        for analyzer in &$self.analyzers {
            if analyzer.$method($item, $insn, $env) {
                return;
            }
        }
    }};
}

impl<'a> InstructionAnalyzerCombiner<'a> {
    pub fn new(analyzers: Vec<Box<dyn InstructionAnalyzer + 'a>>) -> Self {
        Self { analyzers }
    }

    /// The plain local chain: JDK-pattern analyzers, field analyzers when
    /// the method is a class or instance initializer, the local array
    /// model with its escape backstop, the whole-program summaries when
    /// available, and the primitive analyzer last.
    pub fn default_chain(
        class_under_clinit: Option<TypeId>,
        class_under_init: Option<TypeId>,
        wps: Option<&'a WholeProgramState>,
    ) -> Self {
        let mut analyzers: Vec<Box<dyn InstructionAnalyzer + 'a>> = vec![
            Box::new(EnumFieldAnalyzer::default()),
            Box::new(BoxedBooleanAnalyzer::default()),
            Box::new(StringAnalyzer),
        ];
        if let Some(class) = class_under_clinit {
            analyzers.push(Box::new(ClinitFieldAnalyzer { class_under_init: class }));
        }
        if let Some(class) = class_under_init {
            analyzers.push(Box::new(InitFieldAnalyzer { class_under_init: class }));
        }
        analyzers.push(Box::new(LocalArrayAnalyzer));
        analyzers.push(Box::new(HeapEscapeAnalyzer));
        if let Some(wps) = wps {
            analyzers.push(Box::new(WholeProgramAwareAnalyzer { wps }));
        }
        analyzers.push(Box::new(PrimitiveAnalyzer));
        Self::new(analyzers)
    }

    /// Just the primitive analyzer; the most common configuration.
    pub fn primitive() -> Self {
        Self::new(vec![Box::new(PrimitiveAnalyzer)])
    }

    pub fn run(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) {
        match insn.opcode().group() {
            OpcodeGroup::LoadParam => dispatch!(self, analyze_load_param, item, insn, env),
            OpcodeGroup::Nop => dispatch!(self, analyze_nop, item, insn, env),
            OpcodeGroup::Move => dispatch!(self, analyze_move, item, insn, env),
            OpcodeGroup::MoveResult => dispatch!(self, analyze_move_result, item, insn, env),
            OpcodeGroup::MoveException => dispatch!(self, analyze_move_exception, item, insn, env),
            OpcodeGroup::Return => dispatch!(self, analyze_return, item, insn, env),
            OpcodeGroup::Monitor => dispatch!(self, analyze_monitor, item, insn, env),
            OpcodeGroup::Const => dispatch!(self, analyze_const, item, insn, env),
            OpcodeGroup::ConstString => dispatch!(self, analyze_const_string, item, insn, env),
            OpcodeGroup::ConstClass => dispatch!(self, analyze_const_class, item, insn, env),
            OpcodeGroup::CheckCast => dispatch!(self, analyze_check_cast, item, insn, env),
            OpcodeGroup::InstanceOf => dispatch!(self, analyze_instance_of, item, insn, env),
            OpcodeGroup::ArrayLength => dispatch!(self, analyze_array_length, item, insn, env),
            OpcodeGroup::NewInstance => dispatch!(self, analyze_new_instance, item, insn, env),
            OpcodeGroup::NewArray => dispatch!(self, analyze_new_array, item, insn, env),
            OpcodeGroup::FilledNewArray => {
                dispatch!(self, analyze_filled_new_array, item, insn, env)
            }
            OpcodeGroup::FillArrayData => dispatch!(self, analyze_fill_array_data, item, insn, env),
            OpcodeGroup::Throw => dispatch!(self, analyze_throw, item, insn, env),
            OpcodeGroup::Goto => dispatch!(self, analyze_goto, item, insn, env),
            OpcodeGroup::Switch => dispatch!(self, analyze_switch, item, insn, env),
            OpcodeGroup::Cmp => dispatch!(self, analyze_cmp, item, insn, env),
            OpcodeGroup::If => dispatch!(self, analyze_if, item, insn, env),
            OpcodeGroup::Aget => dispatch!(self, analyze_aget, item, insn, env),
            OpcodeGroup::Aput => dispatch!(self, analyze_aput, item, insn, env),
            OpcodeGroup::Iget => dispatch!(self, analyze_iget, item, insn, env),
            OpcodeGroup::Iput => dispatch!(self, analyze_iput, item, insn, env),
            OpcodeGroup::Sget => dispatch!(self, analyze_sget, item, insn, env),
            OpcodeGroup::Sput => dispatch!(self, analyze_sput, item, insn, env),
            OpcodeGroup::Invoke => dispatch!(self, analyze_invoke, item, insn, env),
            OpcodeGroup::Unop => dispatch!(self, analyze_unop, item, insn, env),
            OpcodeGroup::Binop => dispatch!(self, analyze_binop, item, insn, env),
            OpcodeGroup::BinopLit => dispatch!(self, analyze_binop_lit, item, insn, env),
        }
    }
}

// ---------------------------------------------------------------------
// Primitive values
// ---------------------------------------------------------------------

/// Propagates primitive constants and simple arithmetic. Its default
/// sets any written register to top, so it must come last in any chain.
pub struct PrimitiveAnalyzer;

impl PrimitiveAnalyzer {
    fn analyze_default(insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        if writes_result(insn) {
            env.set(dest_register(insn), ConstantValue::top());
        }
        true
    }
}

impl InstructionAnalyzer for PrimitiveAnalyzer {
    fn analyze_load_param(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        Self::analyze_default(insn, env)
    }

    fn analyze_nop(&self, _item: ItemId, _insn: &IrInstruction, _env: &mut ConstantEnvironment) -> bool {
        true
    }

    fn analyze_move(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        let value = env.get(insn.src(0));
        env.set(insn.dest(), value);
        true
    }

    fn analyze_move_result(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        let value = env.get(RESULT_REGISTER);
        env.set(insn.dest(), value);
        true
    }

    fn analyze_move_exception(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        Self::analyze_default(insn, env)
    }

    fn analyze_return(&self, _item: ItemId, _insn: &IrInstruction, _env: &mut ConstantEnvironment) -> bool {
        true
    }

    fn analyze_monitor(&self, _item: ItemId, _insn: &IrInstruction, _env: &mut ConstantEnvironment) -> bool {
        true
    }

    fn analyze_const(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        env.set(insn.dest(), ConstantValue::constant(insn.literal()));
        true
    }

    fn analyze_cmp(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        if insn.opcode() == Opcode::CmpLong {
            let left = env.get(insn.src(0)).as_signed();
            let right = env.get(insn.src(1)).as_signed();
            if let (Some(a), Some(b)) = (left.get_constant(), right.get_constant()) {
                let result = match a.cmp(&b) {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                };
                env.set(dest_register(insn), ConstantValue::constant(result));
                return true;
            }
        }
        // Float and double comparisons depend on IEEE-754 bit patterns we
        // don't model.
        Self::analyze_default(insn, env)
    }

    fn analyze_binop_lit(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        let lit = insn.literal();
        let src = env.get(insn.src(0)).as_signed();
        if let Some(value) = src.get_constant() {
            if let Some(result) = eval_binop_lit(insn.opcode(), value as i32, lit as i32) {
                env.set(dest_register(insn), ConstantValue::constant(result as i64));
                return true;
            }
        }
        Self::analyze_default(insn, env)
    }

    fn analyze_goto(&self, _item: ItemId, _insn: &IrInstruction, _env: &mut ConstantEnvironment) -> bool {
        true
    }

    fn analyze_if(&self, _item: ItemId, _insn: &IrInstruction, _env: &mut ConstantEnvironment) -> bool {
        true
    }

    fn analyze_switch(&self, _item: ItemId, _insn: &IrInstruction, _env: &mut ConstantEnvironment) -> bool {
        true
    }

    fn analyze_throw(&self, _item: ItemId, _insn: &IrInstruction, _env: &mut ConstantEnvironment) -> bool {
        true
    }

    fn analyze_const_string(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        Self::analyze_default(insn, env)
    }

    fn analyze_const_class(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        Self::analyze_default(insn, env)
    }

    fn analyze_check_cast(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        // The post-cast value is the same reference; keep what we know.
        let value = env.get(insn.src(0));
        env.set(RESULT_REGISTER, value);
        true
    }

    fn analyze_instance_of(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        // A null operand always yields 0.
        let value = env.get(insn.src(0));
        if value.get_constant() == Some(0) {
            env.set(RESULT_REGISTER, ConstantValue::constant(0));
            return true;
        }
        Self::analyze_default(insn, env)
    }

    fn analyze_array_length(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        let array = env.get_array(insn.src(0));
        if let Some(length) = array.length() {
            env.set(RESULT_REGISTER, ConstantValue::constant(length as i64));
            return true;
        }
        if let Some(obj) = env.get(insn.src(0)).as_new_object() {
            if !obj.array_length.is_top() {
                env.set(
                    RESULT_REGISTER,
                    ConstantValue::signed(obj.array_length),
                );
                return true;
            }
        }
        Self::analyze_default(insn, env)
    }

    fn analyze_new_instance(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        env.set(
            RESULT_REGISTER,
            ConstantValue::NewObject(crate::domain::NewObjectDomain::new(item, insn.type_ref())),
        );
        true
    }

    fn analyze_aget(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        Self::analyze_default(insn, env)
    }

    fn analyze_aput(&self, _item: ItemId, _insn: &IrInstruction, _env: &mut ConstantEnvironment) -> bool {
        true
    }

    fn analyze_iget(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        Self::analyze_default(insn, env)
    }

    fn analyze_iput(&self, _item: ItemId, _insn: &IrInstruction, _env: &mut ConstantEnvironment) -> bool {
        true
    }

    fn analyze_sget(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        Self::analyze_default(insn, env)
    }

    fn analyze_sput(&self, _item: ItemId, _insn: &IrInstruction, _env: &mut ConstantEnvironment) -> bool {
        true
    }

    fn analyze_invoke(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        Self::analyze_default(insn, env)
    }

    fn analyze_unop(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        let src = env.get(insn.src(0)).as_signed();
        if let Some(v) = src.get_constant() {
            if let Some(result) = eval_unop(insn.opcode(), v) {
                env.set(dest_register(insn), ConstantValue::constant(result));
                return true;
            }
        }
        Self::analyze_default(insn, env)
    }

    fn analyze_binop(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        Self::analyze_default(insn, env)
    }

    fn analyze_new_array(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        // The local array analyzer didn't claim it (unknown length); the
        // object identity is still worth remembering.
        let length = env.get(insn.src(0)).as_signed();
        env.set(
            RESULT_REGISTER,
            ConstantValue::NewObject(crate::domain::NewObjectDomain::with_length(
                item,
                insn.type_ref(),
                length,
            )),
        );
        true
    }

    fn analyze_filled_new_array(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        Self::analyze_default(insn, env)
    }

    fn analyze_fill_array_data(&self, _item: ItemId, _insn: &IrInstruction, _env: &mut ConstantEnvironment) -> bool {
        true
    }
}

/// Int arithmetic follows 32-bit Java semantics; division by zero throws
/// instead of producing a value.
fn eval_binop_lit(op: Opcode, src: i32, lit: i32) -> Option<i32> {
    use Opcode::*;
    Some(match op {
        AddIntLit16 | AddIntLit8 => src.wrapping_add(lit),
        RsubInt | RsubIntLit8 => lit.wrapping_sub(src),
        MulIntLit16 | MulIntLit8 => src.wrapping_mul(lit),
        DivIntLit16 | DivIntLit8 => {
            if lit == 0 {
                return None;
            }
            src.wrapping_div(lit)
        }
        RemIntLit16 | RemIntLit8 => {
            if lit == 0 {
                return None;
            }
            src.wrapping_rem(lit)
        }
        AndIntLit16 | AndIntLit8 => src & lit,
        OrIntLit16 | OrIntLit8 => src | lit,
        XorIntLit16 | XorIntLit8 => src ^ lit,
        ShlIntLit8 => src.wrapping_shl(lit as u32 & 0x1f),
        ShrIntLit8 => src.wrapping_shr(lit as u32 & 0x1f),
        UshrIntLit8 => ((src as u32).wrapping_shr(lit as u32 & 0x1f)) as i32,
        _ => return None,
    })
}

fn eval_unop(op: Opcode, v: i64) -> Option<i64> {
    use Opcode::*;
    Some(match op {
        NegInt => (v as i32).wrapping_neg() as i64,
        NotInt => !(v as i32) as i64,
        NegLong => v.wrapping_neg(),
        NotLong => !v,
        IntToLong => v as i32 as i64,
        LongToInt => v as i32 as i64,
        IntToByte => v as i8 as i64,
        IntToChar => v as u16 as i64,
        IntToShort => v as i16 as i64,
        // Conversions through floating point aren't modeled.
        _ => return None,
    })
}

// ---------------------------------------------------------------------
// Local arrays and escape
// ---------------------------------------------------------------------

/// Models arrays that have not escaped: creation, reads, writes and
/// fill-array-data. Must be combined with [`HeapEscapeAnalyzer`], which
/// accounts for how pointers leak out.
pub struct LocalArrayAnalyzer;

fn is_object_variant(op: Opcode) -> bool {
    matches!(op, Opcode::AgetObject | Opcode::AputObject)
}

impl InstructionAnalyzer for LocalArrayAnalyzer {
    fn analyze_new_array(&self, item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        let length = env.get(insn.src(0)).as_signed();
        match length.get_constant() {
            Some(len) if (0..=u32::MAX as i64).contains(&len) => {
                env.set_array(RESULT_REGISTER, item, ConstantArrayDomain::new(len as u32));
                true
            }
            _ => false,
        }
    }

    fn analyze_aget(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        if is_object_variant(insn.opcode()) {
            return false;
        }
        let array = env.get_array(insn.src(0));
        if !array.is_value() {
            return false;
        }
        match env.get(insn.src(1)).as_signed().get_constant() {
            Some(idx) if idx >= 0 => {
                let value = array.get(idx as u32);
                env.set(RESULT_REGISTER, ConstantValue::signed(value));
                true
            }
            _ => false,
        }
    }

    fn analyze_aput(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        if is_object_variant(insn.opcode()) {
            return false;
        }
        // srcs are (value, array, index).
        let array_reg = insn.src(1);
        if !env.get_array(array_reg).is_value() {
            return false;
        }
        let value = env.get(insn.src(0)).as_signed();
        match env.get(insn.src(2)).as_signed().get_constant() {
            Some(idx) if idx >= 0 => {
                env.set_array_binding(array_reg, idx as u32, value);
            }
            _ => {
                // A write through an unknown index clobbers everything we
                // know about the array.
                env.escape_array(array_reg);
            }
        }
        true
    }

    fn analyze_fill_array_data(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        let array_reg = insn.src(0);
        if !env.get_array(array_reg).is_value() {
            return false;
        }
        let data = insn.data().clone();
        for (i, raw) in data.values.iter().enumerate() {
            let value = sign_extend(*raw, data.element_width);
            env.set_array_binding(array_reg, i as u32, SignedConstantDomain::new(value));
        }
        true
    }
}

fn sign_extend(raw: u64, element_width: u16) -> i64 {
    let bits = element_width as u32 * 8;
    if bits >= 64 {
        raw as i64
    } else {
        let shift = 64 - bits;
        ((raw << shift) as i64) >> shift
    }
}

/// Defaults for opcodes that let heap values escape: once a pointer is
/// stored, passed or returned, its array goes to top. Sequenced after
/// [`LocalArrayAnalyzer`] so tracked accesses stay precise.
pub struct HeapEscapeAnalyzer;

fn escape_operands(insn: &IrInstruction, env: &mut ConstantEnvironment) {
    for &src in insn.srcs() {
        if env.get(src).as_heap_pointer().is_some() {
            env.escape_array(src);
        }
    }
}

impl InstructionAnalyzer for HeapEscapeAnalyzer {
    fn analyze_sput(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        escape_operands(insn, env);
        false
    }

    fn analyze_iput(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        escape_operands(insn, env);
        false
    }

    fn analyze_aput(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        escape_operands(insn, env);
        false
    }

    fn analyze_invoke(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        escape_operands(insn, env);
        false
    }

    fn analyze_filled_new_array(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        escape_operands(insn, env);
        false
    }

    fn analyze_return(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        escape_operands(insn, env);
        false
    }
}

// ---------------------------------------------------------------------
// Fields in initializers
// ---------------------------------------------------------------------

/// Static fields inside `<clinit>`: until the initializer finishes, no
/// other code can observe or modify them, so they behave like locals.
pub struct ClinitFieldAnalyzer {
    pub class_under_init: TypeId,
}

impl InstructionAnalyzer for ClinitFieldAnalyzer {
    fn analyze_sget(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        let field = insn.field();
        if refs::field(field).class != self.class_under_init {
            return false;
        }
        let value = env.get_field(field);
        env.set(RESULT_REGISTER, value);
        true
    }

    fn analyze_sput(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        let field = insn.field();
        if refs::field(field).class != self.class_under_init {
            return false;
        }
        let value = env.get(insn.src(0));
        env.set_field(field, value);
        true
    }

    fn analyze_invoke(&self, _item: ItemId, _insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        // The callee may write back into our fields.
        env.clear_field_environment();
        false
    }
}

/// Instance fields inside `<init>`, scoped to the object under
/// construction.
pub struct InitFieldAnalyzer {
    pub class_under_init: TypeId,
}

impl InstructionAnalyzer for InitFieldAnalyzer {
    fn analyze_iget(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        let field = insn.field();
        if refs::field(field).class != self.class_under_init {
            return false;
        }
        let value = env.get_field(field);
        env.set(RESULT_REGISTER, value);
        true
    }

    fn analyze_iput(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        let field = insn.field();
        if refs::field(field).class != self.class_under_init {
            return false;
        }
        let value = env.get(insn.src(0));
        env.set_field(field, value);
        true
    }

    fn analyze_invoke(&self, _item: ItemId, _insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        env.clear_field_environment();
        false
    }
}

// ---------------------------------------------------------------------
// JDK patterns
// ---------------------------------------------------------------------

/// `Enum` constants are singleton objects, and `Enum.equals` on two known
/// constants is decidable.
pub struct EnumFieldAnalyzer {
    enum_equals: MethodId,
}

impl Default for EnumFieldAnalyzer {
    fn default() -> Self {
        Self {
            enum_equals: refs::make_method_desc(
                "Ljava/lang/Enum;.equals:(Ljava/lang/Object;)Z",
            ),
        }
    }
}

impl InstructionAnalyzer for EnumFieldAnalyzer {
    fn analyze_sget(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        if insn.opcode() != Opcode::SgetObject {
            return false;
        }
        let field = refs::field(insn.field());
        // Enum constants are the static fields whose type is their own
        // declaring class.
        if field.field_type != field.class {
            return false;
        }
        env.set(RESULT_REGISTER, ConstantValue::SingletonObject(insn.field()));
        true
    }

    fn analyze_invoke(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        if insn.method() != self.enum_equals {
            return false;
        }
        let left = env.get(insn.src(0));
        let right = env.get(insn.src(1));
        match (&left, &right) {
            (ConstantValue::SingletonObject(a), ConstantValue::SingletonObject(b)) => {
                env.set(RESULT_REGISTER, ConstantValue::constant((a == b) as i64));
                true
            }
            _ => false,
        }
    }
}

/// `Boolean.TRUE` / `Boolean.FALSE` and conversions between them and
/// primitive booleans.
pub struct BoxedBooleanAnalyzer {
    boolean_true: FieldId,
    boolean_false: FieldId,
    boolean_valueof: MethodId,
    boolean_booleanvalue: MethodId,
}

impl Default for BoxedBooleanAnalyzer {
    fn default() -> Self {
        Self {
            boolean_true: refs::make_field_desc("Ljava/lang/Boolean;.TRUE:Ljava/lang/Boolean;"),
            boolean_false: refs::make_field_desc("Ljava/lang/Boolean;.FALSE:Ljava/lang/Boolean;"),
            boolean_valueof: refs::make_method_desc(
                "Ljava/lang/Boolean;.valueOf:(Z)Ljava/lang/Boolean;",
            ),
            boolean_booleanvalue: refs::make_method_desc(
                "Ljava/lang/Boolean;.booleanValue:()Z",
            ),
        }
    }
}

impl InstructionAnalyzer for BoxedBooleanAnalyzer {
    fn analyze_sget(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        let field = insn.field();
        if field == self.boolean_true || field == self.boolean_false {
            env.set(RESULT_REGISTER, ConstantValue::SingletonObject(field));
            true
        } else {
            false
        }
    }

    fn analyze_invoke(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        let method = insn.method();
        if method == self.boolean_valueof {
            let Some(v) = env.get(insn.src(0)).get_constant() else {
                return false;
            };
            let field = if v == 0 { self.boolean_false } else { self.boolean_true };
            env.set(RESULT_REGISTER, ConstantValue::SingletonObject(field));
            true
        } else if method == self.boolean_booleanvalue {
            match env.get(insn.src(0)) {
                ConstantValue::SingletonObject(f) if f == self.boolean_true => {
                    env.set(RESULT_REGISTER, ConstantValue::constant(1));
                    true
                }
                ConstantValue::SingletonObject(f) if f == self.boolean_false => {
                    env.set(RESULT_REGISTER, ConstantValue::constant(0));
                    true
                }
                _ => false,
            }
        } else {
            false
        }
    }
}

/// String literals.
pub struct StringAnalyzer;

impl InstructionAnalyzer for StringAnalyzer {
    fn analyze_const_string(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        env.set(RESULT_REGISTER, ConstantValue::String(insn.string()));
        true
    }

    fn analyze_const_class(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        env.set(RESULT_REGISTER, ConstantValue::Class(insn.type_ref()));
        true
    }
}

/// Reads field and return-value summaries from a completed whole-program
/// state.
pub struct WholeProgramAwareAnalyzer<'a> {
    pub wps: &'a WholeProgramState,
}

impl InstructionAnalyzer for WholeProgramAwareAnalyzer<'_> {
    fn analyze_sget(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        let value = self.wps.get_field_value(insn.field());
        if value.is_top() {
            return false;
        }
        env.set(RESULT_REGISTER, value);
        true
    }

    fn analyze_invoke(&self, _item: ItemId, insn: &IrInstruction, env: &mut ConstantEnvironment) -> bool {
        let value = self.wps.get_return_value(insn.method());
        if value.is_top() || value.is_bottom() {
            return false;
        }
        env.set(RESULT_REGISTER, value);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dexopt_ir::refs::{make_field_desc, make_string, make_type};

    fn run_one(combiner: &InstructionAnalyzerCombiner<'_>, insn: &IrInstruction, env: &mut ConstantEnvironment) {
        combiner.run(ItemId(0), insn, env);
    }

    #[test]
    fn test_const_and_move() {
        let combiner = InstructionAnalyzerCombiner::primitive();
        let mut env = ConstantEnvironment::top();
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::Const).with_dest(0).with_literal(42),
            &mut env,
        );
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::Move).with_dest(1).with_src(0),
            &mut env,
        );
        assert_eq!(env.get(1).get_constant(), Some(42));
    }

    #[test]
    fn test_binop_lit_arithmetic() {
        let combiner = InstructionAnalyzerCombiner::primitive();
        let mut env = ConstantEnvironment::top();
        env.set(0, ConstantValue::constant(10));
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::AddIntLit8).with_dest(1).with_src(0).with_literal(5),
            &mut env,
        );
        assert_eq!(env.get(1).get_constant(), Some(15));

        run_one(
            &combiner,
            &IrInstruction::new(Opcode::RsubInt).with_dest(2).with_src(0).with_literal(3),
            &mut env,
        );
        assert_eq!(env.get(2).get_constant(), Some(-7));

        // Division by a zero literal produces no value.
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::DivIntLit8).with_src(0).with_literal(0),
            &mut env,
        );
        assert!(env.get(RESULT_REGISTER).is_top());
    }

    #[test]
    fn test_unknown_write_goes_to_top() {
        let combiner = InstructionAnalyzerCombiner::primitive();
        let mut env = ConstantEnvironment::top();
        env.set(0, ConstantValue::constant(1));
        env.set(1, ConstantValue::constant(2));
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::AddInt).with_dest(0).with_srcs([0, 1]),
            &mut env,
        );
        assert!(env.get(0).is_top());
        assert_eq!(env.get(1).get_constant(), Some(2));
    }

    #[test]
    fn test_local_array_round_trip() {
        let combiner = InstructionAnalyzerCombiner::default_chain(None, None, None);
        let mut env = ConstantEnvironment::top();
        // v0 = 2; v1 = new int[v0]; v1[1] = 7; v2 = v1[1]
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::Const).with_dest(0).with_literal(2),
            &mut env,
        );
        let new_array =
            IrInstruction::new(Opcode::NewArray).with_type(make_type("[I")).with_src(0);
        combiner.run(ItemId(7), &new_array, &mut env);
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::MoveResultPseudoObject).with_dest(1),
            &mut env,
        );
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::Const).with_dest(3).with_literal(1),
            &mut env,
        );
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::Const).with_dest(4).with_literal(7),
            &mut env,
        );
        // aput v4 -> v1[v3]
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::Aput).with_srcs([4, 1, 3]),
            &mut env,
        );
        // aget v1[v3]
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::Aget).with_srcs([1, 3]),
            &mut env,
        );
        assert_eq!(env.get(RESULT_REGISTER).get_constant(), Some(7));
        // array-length is the const we allocated with.
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::ArrayLength).with_src(1),
            &mut env,
        );
        assert_eq!(env.get(RESULT_REGISTER).get_constant(), Some(2));
    }

    #[test]
    fn test_escape_on_invoke() {
        let combiner = InstructionAnalyzerCombiner::default_chain(None, None, None);
        let mut env = ConstantEnvironment::top();
        env.set(0, ConstantValue::constant(1));
        let new_array =
            IrInstruction::new(Opcode::NewArray).with_type(make_type("[I")).with_src(0);
        combiner.run(ItemId(9), &new_array, &mut env);
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::MoveResultPseudoObject).with_dest(1),
            &mut env,
        );
        assert!(env.get_array(1).is_value());

        let callee = refs::make_method_desc("LFoo;.use:([I)V");
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::InvokeStatic).with_method(callee).with_src(1),
            &mut env,
        );
        assert!(env.get_array(1).is_top());
    }

    #[test]
    fn test_clinit_field_tracking() {
        let class = make_type("LConfig;");
        let field = make_field_desc("LConfig;.DEBUG:I");
        let combiner = InstructionAnalyzerCombiner::default_chain(Some(class), None, None);
        let mut env = ConstantEnvironment::top();
        env.set(0, ConstantValue::constant(1));
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::Sput).with_field(field).with_src(0),
            &mut env,
        );
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::Sget).with_field(field),
            &mut env,
        );
        assert_eq!(env.get(RESULT_REGISTER).get_constant(), Some(1));
    }

    #[test]
    fn test_string_and_class_literals() {
        let combiner = InstructionAnalyzerCombiner::default_chain(None, None, None);
        let mut env = ConstantEnvironment::top();
        let s = make_string("hello");
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::ConstString).with_string(s),
            &mut env,
        );
        assert_eq!(env.get(RESULT_REGISTER).as_string(), Some(s));
        // Strings are non-null.
        assert!(env.get(RESULT_REGISTER).as_signed().is_nez());
    }

    #[test]
    fn test_boxed_boolean() {
        let combiner = InstructionAnalyzerCombiner::default_chain(None, None, None);
        let mut env = ConstantEnvironment::top();
        env.set(0, ConstantValue::constant(1));
        let valueof =
            refs::make_method_desc("Ljava/lang/Boolean;.valueOf:(Z)Ljava/lang/Boolean;");
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::InvokeStatic).with_method(valueof).with_src(0),
            &mut env,
        );
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::MoveResultObject).with_dest(1),
            &mut env,
        );
        let booleanvalue =
            refs::make_method_desc("Ljava/lang/Boolean;.booleanValue:()Z");
        run_one(
            &combiner,
            &IrInstruction::new(Opcode::InvokeVirtual).with_method(booleanvalue).with_src(1),
            &mut env,
        );
        assert_eq!(env.get(RESULT_REGISTER).get_constant(), Some(1));
    }
}
