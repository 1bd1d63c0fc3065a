//! Register types for allocation
//!
//! Every register gets a type computed from its defs and uses. The types
//! form a small meet-semilattice:
//!
//! ```text
//!             UNKNOWN
//!              /    \
//!            ZERO   WIDE
//!           /    \     |
//!       OBJECT NORMAL  |
//!          \     |    /
//!           \    |   /
//!            CONFLICT
//! ```
//!
//! ZERO sits above OBJECT and NORMAL because the constant zero serves as
//! both the null reference and the integer 0; a register holding it can
//! merge with either. CONFLICT means the uses genuinely disagree, which
//! well-formed input never produces.

use dexopt_ir::{refs, IrInstruction, Opcode, OpcodeGroup, Reg};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterType {
    Conflict,
    Zero,
    Normal,
    Wide,
    Object,
    Unknown,
}

impl RegisterType {
    /// The greatest lower bound of two register types.
    pub fn meet(self, other: RegisterType) -> RegisterType {
        use RegisterType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Unknown, x) | (x, Unknown) => x,
            (Conflict, _) | (_, Conflict) => Conflict,
            (Zero, Object) | (Object, Zero) => Object,
            (Zero, Normal) | (Normal, Zero) => Normal,
            // Zero/Object/Normal against Wide all disagree.
            _ => Conflict,
        }
    }

    /// Registers of this type occupy this many adjacent vreg slots.
    pub fn width(self) -> u32 {
        if self == RegisterType::Wide {
            2
        } else {
            1
        }
    }
}

/// The move opcode that copies a register of the given type.
pub fn gen_move(ty: RegisterType, dest: Reg, src: Reg) -> IrInstruction {
    let op = match ty {
        RegisterType::Zero | RegisterType::Normal => Opcode::Move,
        RegisterType::Object => Opcode::MoveObject,
        RegisterType::Wide => Opcode::MoveWide,
        RegisterType::Unknown | RegisterType::Conflict => {
            panic!("cannot generate a move for register type {:?}", ty)
        }
    };
    IrInstruction::new(op).with_dest(dest).with_src(src)
}

/// The type an instruction's destination register must have.
pub fn dest_reg_type(insn: &IrInstruction) -> RegisterType {
    use Opcode::*;
    use RegisterType::*;
    match insn.opcode() {
        LoadParam => Normal,
        LoadParamObject => Object,
        LoadParamWide => Wide,
        MoveResultPseudo | MoveResult => Normal,
        MoveResultPseudoObject | MoveResultObject | MoveException => Object,
        MoveResultPseudoWide | MoveResultWide => Wide,
        Move => Normal,
        MoveObject => Object,
        MoveWide => Wide,
        Const => {
            if insn.literal() == 0 {
                Zero
            } else {
                Normal
            }
        }
        ConstWide => Wide,
        op if op.group() == OpcodeGroup::Cmp => Normal,
        op if op.has_dest() && op.dest_is_wide() => Wide,
        op if op.has_dest() => Normal,
        op => panic!("no dest for {:?}", op),
    }
}

/// The type an instruction requires of source position `i`.
pub fn src_reg_type(insn: &IrInstruction, i: usize) -> RegisterType {
    use Opcode::*;
    use RegisterType::*;
    let op = insn.opcode();
    match op {
        Move => Normal,
        MoveObject => Object,
        MoveWide => Wide,
        Return => Normal,
        ReturnWide => Wide,
        ReturnObject => Object,
        MonitorEnter | MonitorExit | Throw => Object,
        CheckCast | InstanceOf | ArrayLength | FillArrayData => Object,
        NewArray => Normal,
        // A zero test works on both references and integers.
        IfEqz | IfNez => Zero,
        PackedSwitch | SparseSwitch => Normal,
        FilledNewArray => {
            let desc = refs::type_descriptor(insn.type_ref());
            if desc.starts_with("[L") || desc.starts_with("[[") {
                Object
            } else {
                Normal
            }
        }
        _ => match op.group() {
            OpcodeGroup::If => Normal,
            OpcodeGroup::Cmp => {
                if op.src_is_wide_at(i) {
                    Wide
                } else {
                    Normal
                }
            }
            OpcodeGroup::Aget => {
                // (array, index)
                if i == 0 {
                    Object
                } else {
                    Normal
                }
            }
            OpcodeGroup::Aput => {
                // (value, array, index)
                match i {
                    0 => put_value_type(op, AputWide, AputObject),
                    1 => Object,
                    _ => Normal,
                }
            }
            OpcodeGroup::Iget => Object,
            OpcodeGroup::Iput => {
                if i == 0 {
                    put_value_type(op, IputWide, IputObject)
                } else {
                    Object
                }
            }
            OpcodeGroup::Sput => put_value_type(op, SputWide, SputObject),
            OpcodeGroup::Invoke => invoke_src_type(insn, i),
            OpcodeGroup::Unop | OpcodeGroup::Binop => {
                if op.src_is_wide_at(i) {
                    Wide
                } else {
                    Normal
                }
            }
            OpcodeGroup::BinopLit => Normal,
            _ => panic!("no src {} for {:?}", i, op),
        },
    }
}

fn put_value_type(op: Opcode, wide: Opcode, object: Opcode) -> RegisterType {
    if op == wide {
        RegisterType::Wide
    } else if op == object {
        RegisterType::Object
    } else {
        RegisterType::Normal
    }
}

fn invoke_src_type(insn: &IrInstruction, i: usize) -> RegisterType {
    let method = refs::method(insn.method());
    let proto = refs::proto(method.proto);
    let mut idx = i;
    if insn.opcode() != Opcode::InvokeStatic {
        if i == 0 {
            return RegisterType::Object;
        }
        idx -= 1;
    }
    let arg = proto.args[idx];
    let info = refs::type_info(arg);
    if info.is_wide {
        RegisterType::Wide
    } else if info.is_object {
        RegisterType::Object
    } else {
        RegisterType::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dexopt_ir::refs::make_method_desc;
    use rstest::rstest;

    #[rstest]
    #[case(RegisterType::Zero, RegisterType::Object, RegisterType::Object)]
    #[case(RegisterType::Zero, RegisterType::Normal, RegisterType::Normal)]
    #[case(RegisterType::Unknown, RegisterType::Wide, RegisterType::Wide)]
    #[case(RegisterType::Object, RegisterType::Normal, RegisterType::Conflict)]
    #[case(RegisterType::Wide, RegisterType::Normal, RegisterType::Conflict)]
    #[case(RegisterType::Zero, RegisterType::Wide, RegisterType::Conflict)]
    fn test_meet_table(
        #[case] a: RegisterType,
        #[case] b: RegisterType,
        #[case] expected: RegisterType,
    ) {
        assert_eq!(a.meet(b), expected);
        assert_eq!(b.meet(a), expected);
    }

    #[test]
    fn test_const_zero_is_zero_typed() {
        let zero = IrInstruction::new(Opcode::Const).with_dest(0).with_literal(0);
        assert_eq!(dest_reg_type(&zero), RegisterType::Zero);
        let one = IrInstruction::new(Opcode::Const).with_dest(0).with_literal(1);
        assert_eq!(dest_reg_type(&one), RegisterType::Normal);
    }

    #[test]
    fn test_invoke_src_types_follow_signature() {
        let m = make_method_desc("LFoo;.f:(JLjava/lang/String;I)V");
        let insn = IrInstruction::new(Opcode::InvokeVirtual)
            .with_method(m)
            .with_srcs([0, 1, 3, 4]);
        assert_eq!(src_reg_type(&insn, 0), RegisterType::Object); // this
        assert_eq!(src_reg_type(&insn, 1), RegisterType::Wide); // J
        assert_eq!(src_reg_type(&insn, 2), RegisterType::Object); // String
        assert_eq!(src_reg_type(&insn, 3), RegisterType::Normal); // I
    }

    #[test]
    fn test_zero_test_sources() {
        let insn = IrInstruction::new(Opcode::IfEqz).with_src(0);
        assert_eq!(src_reg_type(&insn, 0), RegisterType::Zero);
    }

    #[test]
    fn test_gen_move() {
        assert_eq!(gen_move(RegisterType::Object, 1, 2).opcode(), Opcode::MoveObject);
        assert_eq!(gen_move(RegisterType::Wide, 1, 2).opcode(), Opcode::MoveWide);
        assert_eq!(gen_move(RegisterType::Zero, 1, 2).opcode(), Opcode::Move);
    }
}
