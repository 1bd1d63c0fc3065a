//! The closed opcode set and its classification tables
//!
//! Adding a new opcode means giving it a group for analyzer dispatch, a
//! dest/src register shape, a branchingness, bit-width constraints for the
//! allocator, a may-throw classification and a size estimate (the last
//! lives with [`crate::instruction`], since it depends on operands).
//!
//! Note that the register shape describes the *IR* form: an opcode that
//! may throw and writes a result in the wire format has no dest here --
//! its destination lives on the move-result-pseudo that follows it.

use crate::refs::{self, MethodId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Synthetic opcodes: method entry parameter definitions.
    LoadParam,
    LoadParamObject,
    LoadParamWide,
    // Synthetic opcodes: destination holders for may-throw instructions.
    MoveResultPseudo,
    MoveResultPseudoObject,
    MoveResultPseudoWide,

    Nop,

    Move,
    MoveWide,
    MoveObject,

    MoveResult,
    MoveResultWide,
    MoveResultObject,
    MoveException,

    ReturnVoid,
    Return,
    ReturnWide,
    ReturnObject,

    MonitorEnter,
    MonitorExit,

    Const,
    ConstWide,
    ConstString,
    ConstClass,

    CheckCast,
    InstanceOf,
    ArrayLength,
    NewInstance,
    NewArray,
    FilledNewArray,
    FillArrayData,

    Throw,
    Goto,
    PackedSwitch,
    SparseSwitch,

    CmplFloat,
    CmpgFloat,
    CmplDouble,
    CmpgDouble,
    CmpLong,

    IfEq,
    IfNe,
    IfLt,
    IfGe,
    IfGt,
    IfLe,
    IfEqz,
    IfNez,
    IfLtz,
    IfGez,
    IfGtz,
    IfLez,

    Aget,
    AgetWide,
    AgetObject,
    AgetBoolean,
    AgetByte,
    AgetChar,
    AgetShort,
    Aput,
    AputWide,
    AputObject,
    AputBoolean,
    AputByte,
    AputChar,
    AputShort,

    Iget,
    IgetWide,
    IgetObject,
    IgetBoolean,
    IgetByte,
    IgetChar,
    IgetShort,
    Iput,
    IputWide,
    IputObject,
    IputBoolean,
    IputByte,
    IputChar,
    IputShort,

    Sget,
    SgetWide,
    SgetObject,
    SgetBoolean,
    SgetByte,
    SgetChar,
    SgetShort,
    Sput,
    SputWide,
    SputObject,
    SputBoolean,
    SputByte,
    SputChar,
    SputShort,

    InvokeVirtual,
    InvokeSuper,
    InvokeDirect,
    InvokeStatic,
    InvokeInterface,

    NegInt,
    NotInt,
    NegLong,
    NotLong,
    NegFloat,
    NegDouble,
    IntToLong,
    IntToFloat,
    IntToDouble,
    LongToInt,
    LongToFloat,
    LongToDouble,
    FloatToInt,
    FloatToLong,
    FloatToDouble,
    DoubleToInt,
    DoubleToLong,
    DoubleToFloat,
    IntToByte,
    IntToChar,
    IntToShort,

    AddInt,
    SubInt,
    MulInt,
    DivInt,
    RemInt,
    AndInt,
    OrInt,
    XorInt,
    ShlInt,
    ShrInt,
    UshrInt,
    AddLong,
    SubLong,
    MulLong,
    DivLong,
    RemLong,
    AndLong,
    OrLong,
    XorLong,
    ShlLong,
    ShrLong,
    UshrLong,
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    RemFloat,
    AddDouble,
    SubDouble,
    MulDouble,
    DivDouble,
    RemDouble,

    AddIntLit16,
    RsubInt,
    MulIntLit16,
    DivIntLit16,
    RemIntLit16,
    AndIntLit16,
    OrIntLit16,
    XorIntLit16,
    AddIntLit8,
    RsubIntLit8,
    MulIntLit8,
    DivIntLit8,
    RemIntLit8,
    AndIntLit8,
    OrIntLit8,
    XorIntLit8,
    ShlIntLit8,
    ShrIntLit8,
    UshrIntLit8,
}

/// Opcode groups for analyzer dispatch. Opcodes are grouped on the basis
/// that most analyses will want to handle all opcodes in a group alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeGroup {
    LoadParam,
    Nop,
    Move,
    MoveResult,
    MoveException,
    Return,
    Monitor,
    Const,
    ConstString,
    ConstClass,
    CheckCast,
    InstanceOf,
    ArrayLength,
    NewInstance,
    NewArray,
    FilledNewArray,
    FillArrayData,
    Throw,
    Goto,
    Switch,
    Cmp,
    If,
    Aget,
    Aput,
    Iget,
    Iput,
    Sget,
    Sput,
    Invoke,
    Unop,
    Binop,
    BinopLit,
}

/// The kind of payload an opcode carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    None,
    Literal,
    String,
    Type,
    Field,
    Method,
    Data,
}

/// How control flow leaves an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branchingness {
    None,
    Goto,
    If,
    Switch,
    Return,
    Throw,
}

use Opcode::*;

impl Opcode {
    pub fn group(self) -> OpcodeGroup {
        match self {
            LoadParam | LoadParamObject | LoadParamWide => OpcodeGroup::LoadParam,
            Nop => OpcodeGroup::Nop,
            Move | MoveWide | MoveObject => OpcodeGroup::Move,
            MoveResult | MoveResultWide | MoveResultObject | MoveResultPseudo
            | MoveResultPseudoObject | MoveResultPseudoWide => OpcodeGroup::MoveResult,
            MoveException => OpcodeGroup::MoveException,
            ReturnVoid | Return | ReturnWide | ReturnObject => OpcodeGroup::Return,
            MonitorEnter | MonitorExit => OpcodeGroup::Monitor,
            Const | ConstWide => OpcodeGroup::Const,
            ConstString => OpcodeGroup::ConstString,
            ConstClass => OpcodeGroup::ConstClass,
            CheckCast => OpcodeGroup::CheckCast,
            InstanceOf => OpcodeGroup::InstanceOf,
            ArrayLength => OpcodeGroup::ArrayLength,
            NewInstance => OpcodeGroup::NewInstance,
            NewArray => OpcodeGroup::NewArray,
            FilledNewArray => OpcodeGroup::FilledNewArray,
            FillArrayData => OpcodeGroup::FillArrayData,
            Throw => OpcodeGroup::Throw,
            Goto => OpcodeGroup::Goto,
            PackedSwitch | SparseSwitch => OpcodeGroup::Switch,
            CmplFloat | CmpgFloat | CmplDouble | CmpgDouble | CmpLong => OpcodeGroup::Cmp,
            IfEq | IfNe | IfLt | IfGe | IfGt | IfLe | IfEqz | IfNez | IfLtz | IfGez | IfGtz
            | IfLez => OpcodeGroup::If,
            Aget | AgetWide | AgetObject | AgetBoolean | AgetByte | AgetChar | AgetShort => {
                OpcodeGroup::Aget
            }
            Aput | AputWide | AputObject | AputBoolean | AputByte | AputChar | AputShort => {
                OpcodeGroup::Aput
            }
            Iget | IgetWide | IgetObject | IgetBoolean | IgetByte | IgetChar | IgetShort => {
                OpcodeGroup::Iget
            }
            Iput | IputWide | IputObject | IputBoolean | IputByte | IputChar | IputShort => {
                OpcodeGroup::Iput
            }
            Sget | SgetWide | SgetObject | SgetBoolean | SgetByte | SgetChar | SgetShort => {
                OpcodeGroup::Sget
            }
            Sput | SputWide | SputObject | SputBoolean | SputByte | SputChar | SputShort => {
                OpcodeGroup::Sput
            }
            InvokeVirtual | InvokeSuper | InvokeDirect | InvokeStatic | InvokeInterface => {
                OpcodeGroup::Invoke
            }
            NegInt | NotInt | NegLong | NotLong | NegFloat | NegDouble | IntToLong | IntToFloat
            | IntToDouble | LongToInt | LongToFloat | LongToDouble | FloatToInt | FloatToLong
            | FloatToDouble | DoubleToInt | DoubleToLong | DoubleToFloat | IntToByte | IntToChar
            | IntToShort => OpcodeGroup::Unop,
            AddInt | SubInt | MulInt | DivInt | RemInt | AndInt | OrInt | XorInt | ShlInt
            | ShrInt | UshrInt | AddLong | SubLong | MulLong | DivLong | RemLong | AndLong
            | OrLong | XorLong | ShlLong | ShrLong | UshrLong | AddFloat | SubFloat | MulFloat
            | DivFloat | RemFloat | AddDouble | SubDouble | MulDouble | DivDouble | RemDouble => {
                OpcodeGroup::Binop
            }
            AddIntLit16 | RsubInt | MulIntLit16 | DivIntLit16 | RemIntLit16 | AndIntLit16
            | OrIntLit16 | XorIntLit16 | AddIntLit8 | RsubIntLit8 | MulIntLit8 | DivIntLit8
            | RemIntLit8 | AndIntLit8 | OrIntLit8 | XorIntLit8 | ShlIntLit8 | ShrIntLit8
            | UshrIntLit8 => OpcodeGroup::BinopLit,
        }
    }

    pub fn ref_kind(self) -> RefKind {
        match self {
            Const | ConstWide => RefKind::Literal,
            op if op.group() == OpcodeGroup::BinopLit => RefKind::Literal,
            ConstString => RefKind::String,
            ConstClass | CheckCast | InstanceOf | NewInstance | NewArray | FilledNewArray => {
                RefKind::Type
            }
            op if matches!(
                op.group(),
                OpcodeGroup::Iget | OpcodeGroup::Iput | OpcodeGroup::Sget | OpcodeGroup::Sput
            ) =>
            {
                RefKind::Field
            }
            op if op.group() == OpcodeGroup::Invoke => RefKind::Method,
            FillArrayData => RefKind::Data,
            _ => RefKind::None,
        }
    }

    /// Whether the opcode writes a destination register in IR form. Wire
    /// destinations of may-throw opcodes belong to their
    /// move-result-pseudo instead.
    pub fn has_dest(self) -> bool {
        match self.group() {
            OpcodeGroup::LoadParam
            | OpcodeGroup::Move
            | OpcodeGroup::MoveResult
            | OpcodeGroup::MoveException
            | OpcodeGroup::Const
            | OpcodeGroup::Cmp
            | OpcodeGroup::Unop => true,
            OpcodeGroup::Binop | OpcodeGroup::BinopLit => !self.has_move_result_pseudo(),
            _ => false,
        }
    }

    pub fn dest_is_wide(self) -> bool {
        debug_assert!(self.has_dest());
        matches!(
            self,
            LoadParamWide
                | MoveWide
                | MoveResultWide
                | MoveResultPseudoWide
                | ConstWide
                | NegLong
                | NotLong
                | NegDouble
                | IntToLong
                | IntToDouble
                | LongToDouble
                | FloatToLong
                | FloatToDouble
                | DoubleToLong
                | AddLong
                | SubLong
                | MulLong
                | AndLong
                | OrLong
                | XorLong
                | ShlLong
                | ShrLong
                | UshrLong
                | AddDouble
                | SubDouble
                | MulDouble
                | DivDouble
                | RemDouble
        )
    }

    /// Whether source position `i` refers to a wide register pair. Invoke
    /// operand wideness depends on the callee signature; see
    /// [`invoke_src_is_wide`].
    pub fn src_is_wide_at(self, i: usize) -> bool {
        debug_assert!(self.group() != OpcodeGroup::Invoke);
        match self {
            MoveWide | ReturnWide | NegLong | NotLong | NegDouble | LongToInt | LongToFloat
            | LongToDouble | DoubleToInt | DoubleToLong | DoubleToFloat => i == 0,
            CmplDouble | CmpgDouble | CmpLong => true,
            AddLong | SubLong | MulLong | DivLong | RemLong | AndLong | OrLong | XorLong
            | AddDouble | SubDouble | MulDouble | DivDouble | RemDouble => true,
            // Long shifts take an int shift amount in src1.
            ShlLong | ShrLong | UshrLong => i == 0,
            AputWide | IputWide | SputWide => i == 0,
            _ => false,
        }
    }

    pub fn may_throw(self) -> bool {
        match self.group() {
            OpcodeGroup::ConstString
            | OpcodeGroup::ConstClass
            | OpcodeGroup::Monitor
            | OpcodeGroup::CheckCast
            | OpcodeGroup::InstanceOf
            | OpcodeGroup::ArrayLength
            | OpcodeGroup::NewInstance
            | OpcodeGroup::NewArray
            | OpcodeGroup::FilledNewArray
            | OpcodeGroup::FillArrayData
            | OpcodeGroup::Aget
            | OpcodeGroup::Aput
            | OpcodeGroup::Iget
            | OpcodeGroup::Iput
            | OpcodeGroup::Sget
            | OpcodeGroup::Sput
            | OpcodeGroup::Invoke => true,
            _ => matches!(
                self,
                DivInt
                    | RemInt
                    | DivLong
                    | RemLong
                    | DivIntLit16
                    | RemIntLit16
                    | DivIntLit8
                    | RemIntLit8
            ),
        }
    }

    /// may_throw plus the throw instruction itself.
    pub fn can_throw(self) -> bool {
        self.may_throw() || self == Throw
    }

    pub fn branchingness(self) -> Branchingness {
        match self.group() {
            OpcodeGroup::Goto => Branchingness::Goto,
            OpcodeGroup::If => Branchingness::If,
            OpcodeGroup::Switch => Branchingness::Switch,
            OpcodeGroup::Return => Branchingness::Return,
            OpcodeGroup::Throw => Branchingness::Throw,
            _ => Branchingness::None,
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self.branchingness(),
            Branchingness::Goto | Branchingness::If | Branchingness::Switch
        )
    }

    pub fn is_conditional_branch(self) -> bool {
        self.branchingness() == Branchingness::If
    }

    pub fn is_switch(self) -> bool {
        self.branchingness() == Branchingness::Switch
    }

    pub fn is_goto(self) -> bool {
        self == Goto
    }

    pub fn is_return(self) -> bool {
        self.group() == OpcodeGroup::Return
    }

    pub fn is_move(self) -> bool {
        self.group() == OpcodeGroup::Move
    }

    pub fn is_invoke(self) -> bool {
        self.group() == OpcodeGroup::Invoke
    }

    pub fn is_load_param(self) -> bool {
        self.group() == OpcodeGroup::LoadParam
    }

    pub fn is_move_result(self) -> bool {
        matches!(self, MoveResult | MoveResultWide | MoveResultObject)
    }

    pub fn is_move_result_pseudo(self) -> bool {
        matches!(self, MoveResultPseudo | MoveResultPseudoObject | MoveResultPseudoWide)
    }

    pub fn is_const(self) -> bool {
        matches!(self, Const | ConstWide)
    }

    /// Whether the wire form of this opcode writes a destination and may
    /// throw; such opcodes are paired with a move-result-pseudo in the IR.
    pub fn has_move_result_pseudo(self) -> bool {
        match self.group() {
            OpcodeGroup::ConstString
            | OpcodeGroup::ConstClass
            | OpcodeGroup::CheckCast
            | OpcodeGroup::InstanceOf
            | OpcodeGroup::ArrayLength
            | OpcodeGroup::NewInstance
            | OpcodeGroup::NewArray
            | OpcodeGroup::Aget
            | OpcodeGroup::Iget
            | OpcodeGroup::Sget => true,
            _ => matches!(
                self,
                DivInt
                    | RemInt
                    | DivLong
                    | RemLong
                    | DivIntLit16
                    | RemIntLit16
                    | DivIntLit8
                    | RemIntLit8
            ),
        }
    }

    /// The move-result-pseudo variant pairing with this opcode.
    pub fn move_result_pseudo_for(self) -> Opcode {
        debug_assert!(self.has_move_result_pseudo());
        match self {
            ConstString | ConstClass | CheckCast | NewInstance | NewArray | AgetObject
            | IgetObject | SgetObject => MoveResultPseudoObject,
            AgetWide | IgetWide | SgetWide | DivLong | RemLong => MoveResultPseudoWide,
            _ => MoveResultPseudo,
        }
    }

    /// Whether `invoke`/`filled-new-array` has a /range wire encoding.
    pub fn has_range_form(self) -> bool {
        self.is_invoke() || self == FilledNewArray
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            AddInt
                | MulInt
                | AndInt
                | OrInt
                | XorInt
                | AddLong
                | MulLong
                | AndLong
                | OrLong
                | XorLong
                | AddFloat
                | MulFloat
                | AddDouble
                | MulDouble
        )
    }

    /// The widest register index encodable for the destination. Gotos and
    /// moves have 16-bit forms; most other formats give 8 or 4 bits.
    pub fn dest_bit_width(self) -> u8 {
        match self.group() {
            // Pseudo-opcodes are erased before encoding.
            OpcodeGroup::LoadParam => 16,
            // move/move-wide/move-object scale up to the /16 forms.
            OpcodeGroup::Move => 16,
            OpcodeGroup::MoveResult | OpcodeGroup::MoveException => 8,
            OpcodeGroup::Const => 8,
            OpcodeGroup::Cmp => 8,
            OpcodeGroup::Unop => 4,
            OpcodeGroup::Binop => 8,
            OpcodeGroup::BinopLit => {
                if matches!(
                    self,
                    AddIntLit16 | RsubInt | MulIntLit16 | DivIntLit16 | RemIntLit16
                        | AndIntLit16 | OrIntLit16 | XorIntLit16
                ) {
                    4
                } else {
                    8
                }
            }
            _ => panic!("no dest for {:?}", self),
        }
    }

    /// The widest register index encodable at source position `i`.
    pub fn src_bit_width(self, i: usize) -> u8 {
        match self.group() {
            OpcodeGroup::Move => 16,
            OpcodeGroup::Return | OpcodeGroup::Monitor | OpcodeGroup::Throw => 8,
            OpcodeGroup::CheckCast | OpcodeGroup::NewInstance => 8,
            OpcodeGroup::InstanceOf | OpcodeGroup::NewArray => 4,
            OpcodeGroup::ArrayLength => 4,
            OpcodeGroup::FilledNewArray => 4,
            OpcodeGroup::FillArrayData => 8,
            OpcodeGroup::Switch => 8,
            OpcodeGroup::Cmp => 8,
            OpcodeGroup::If => {
                if matches!(self, IfEq | IfNe | IfLt | IfGe | IfGt | IfLe) {
                    4
                } else {
                    8
                }
            }
            OpcodeGroup::Aget | OpcodeGroup::Aput => 8,
            OpcodeGroup::Iget | OpcodeGroup::Iput => 4,
            OpcodeGroup::Sget | OpcodeGroup::Sput => 8,
            OpcodeGroup::Invoke => 4,
            OpcodeGroup::Unop => 4,
            OpcodeGroup::Binop => 8,
            OpcodeGroup::BinopLit => {
                if matches!(
                    self,
                    AddIntLit16 | RsubInt | MulIntLit16 | DivIntLit16 | RemIntLit16
                        | AndIntLit16 | OrIntLit16 | XorIntLit16
                ) {
                    4
                } else {
                    8
                }
            }
            _ => {
                let _ = i;
                panic!("no src {} for {:?}", i, self)
            }
        }
    }
}

/// The number of bits required to encode `v`, i.e. the position one past
/// its most significant set bit (at least 1).
pub fn required_bit_width(v: u32) -> u8 {
    (32 - v.leading_zeros()).max(1) as u8
}

pub fn max_unsigned_value(bits: u8) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

/// Number of registers a method's parameters occupy, counting wide
/// arguments twice and the receiver when the method is not static.
pub fn param_registers(method: MethodId, is_static: bool) -> u32 {
    let proto = refs::proto(refs::method(method).proto);
    let mut count = if is_static { 0 } else { 1 };
    for arg in &proto.args {
        count += if refs::type_info(*arg).is_wide { 2 } else { 1 };
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Move, true, false)]
    #[case(MoveWide, true, true)]
    #[case(Const, true, false)]
    #[case(ConstWide, true, true)]
    #[case(AddInt, true, false)]
    #[case(AddLong, true, true)]
    #[case(CmpLong, true, false)]
    #[case(Aget, false, false)]
    #[case(InvokeStatic, false, false)]
    #[case(DivInt, false, false)]
    #[case(Throw, false, false)]
    fn test_dest_shapes(#[case] op: Opcode, #[case] has: bool, #[case] wide: bool) {
        assert_eq!(op.has_dest(), has);
        if has {
            assert_eq!(op.dest_is_wide(), wide);
        }
    }

    #[test]
    fn test_may_throw_and_pseudo_pairing() {
        // Every may-throw opcode whose wire form writes a dest is split.
        assert!(Aget.may_throw());
        assert!(Aget.has_move_result_pseudo());
        assert_eq!(Aget.move_result_pseudo_for(), MoveResultPseudo);
        assert_eq!(AgetWide.move_result_pseudo_for(), MoveResultPseudoWide);
        assert_eq!(AgetObject.move_result_pseudo_for(), MoveResultPseudoObject);
        assert_eq!(CheckCast.move_result_pseudo_for(), MoveResultPseudoObject);
        assert_eq!(DivInt.move_result_pseudo_for(), MoveResultPseudo);
        assert_eq!(DivLong.move_result_pseudo_for(), MoveResultPseudoWide);
        // Invokes use the real move-result family instead.
        assert!(InvokeStatic.may_throw());
        assert!(!InvokeStatic.has_move_result_pseudo());
        assert!(!FilledNewArray.has_move_result_pseudo());
        // Non-throwing arithmetic keeps its dest.
        assert!(!DivFloat.may_throw());
        assert!(DivFloat.has_dest());
    }

    #[test]
    fn test_branchingness() {
        assert_eq!(Goto.branchingness(), Branchingness::Goto);
        assert_eq!(IfEqz.branchingness(), Branchingness::If);
        assert_eq!(PackedSwitch.branchingness(), Branchingness::Switch);
        assert_eq!(ReturnVoid.branchingness(), Branchingness::Return);
        assert_eq!(Throw.branchingness(), Branchingness::Throw);
        assert_eq!(AddInt.branchingness(), Branchingness::None);
        assert!(IfEqz.is_branch());
        assert!(!Throw.is_branch());
    }

    #[test]
    fn test_wide_sources() {
        assert!(MoveWide.src_is_wide_at(0));
        assert!(CmpLong.src_is_wide_at(0));
        assert!(CmpLong.src_is_wide_at(1));
        assert!(!CmplFloat.src_is_wide_at(0));
        assert!(ShlLong.src_is_wide_at(0));
        assert!(!ShlLong.src_is_wide_at(1));
        assert!(AputWide.src_is_wide_at(0));
        assert!(!AputWide.src_is_wide_at(1));
    }

    #[test]
    fn test_bit_widths() {
        assert_eq!(Move.dest_bit_width(), 16);
        assert_eq!(Const.dest_bit_width(), 8);
        assert_eq!(NegInt.dest_bit_width(), 4);
        assert_eq!(IfEq.src_bit_width(0), 4);
        assert_eq!(IfEqz.src_bit_width(0), 8);
        assert_eq!(InvokeStatic.src_bit_width(0), 4);
        assert_eq!(AddIntLit16.src_bit_width(0), 4);
        assert_eq!(AddIntLit8.src_bit_width(0), 8);
    }

    #[test]
    fn test_required_bit_width() {
        assert_eq!(required_bit_width(0), 1);
        assert_eq!(required_bit_width(1), 1);
        assert_eq!(required_bit_width(15), 4);
        assert_eq!(required_bit_width(16), 5);
        assert_eq!(required_bit_width(255), 8);
        assert_eq!(required_bit_width(256), 9);
        assert_eq!(max_unsigned_value(4), 15);
        assert_eq!(max_unsigned_value(16), 0xffff);
    }

    #[test]
    fn test_param_registers() {
        let m = crate::refs::make_method_desc("LFoo;.bar:(IJ)V");
        assert_eq!(param_registers(m, true), 3);
        assert_eq!(param_registers(m, false), 4);
    }
}
