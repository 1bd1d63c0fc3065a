//! Post-allocation instruction selection
//!
//! Runs once after register allocation and picks the narrowest wire
//! encoding for every instruction whose encoding depends on its operand
//! registers or literal: the move family scales through /from16 and /16
//! forms, constants through const/4, /16, /high16 and the wide variants,
//! and commutative binops become their /2addr form (commuting operands
//! when that makes the form fit). check-cast needs its source moved into
//! its destination register first whenever the two differ, since the wire
//! form has a single register operand.

use crate::register_type::gen_move;
use crate::RegisterType;
use dexopt_common::PassStats;
use dexopt_ir::cfg::Cfg;
use dexopt_ir::opcode::required_bit_width;
use dexopt_ir::{IrInstruction, ItemId, Opcode, OpcodeGroup};
use hashbrown::HashMap;

/// Wire encodings whose choice instruction selection is responsible for.
/// The emitter maps every other IR opcode to its single wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireOpcode {
    Move,
    MoveFrom16,
    Move16,
    MoveWide,
    MoveWideFrom16,
    MoveWide16,
    MoveObject,
    MoveObjectFrom16,
    MoveObject16,
    Const4,
    Const16,
    ConstHigh16,
    Const32,
    ConstWide16,
    ConstWide32,
    ConstWideHigh16,
    ConstWide64,
    /// The two-address form of a commutative or accumulating binop.
    Binop2Addr,
}

/// Whether `v` fits in a signed integer of `bits` bits.
fn signed_int_fits(v: i64, bits: u32) -> bool {
    let shift = 64 - bits;
    (v << shift) >> shift == v
}

/// Whether the significant bits of `v` fit the top 16 bits of an integer
/// of `total_bits` bits (the high16 encodings).
fn signed_int_fits_high16(v: i64, total_bits: u32) -> bool {
    let right_zeros = total_bits - 16;
    let left_ones = 64 - total_bits;
    v >> right_zeros << (64 - 16) >> left_ones == v
}

/// The narrowest move form for the given (already allocated) operands.
pub fn select_move_opcode(insn: &IrInstruction) -> WireOpcode {
    let table = match insn.opcode() {
        Opcode::Move => [WireOpcode::Move, WireOpcode::MoveFrom16, WireOpcode::Move16],
        Opcode::MoveWide => {
            [WireOpcode::MoveWide, WireOpcode::MoveWideFrom16, WireOpcode::MoveWide16]
        }
        Opcode::MoveObject => {
            [WireOpcode::MoveObject, WireOpcode::MoveObjectFrom16, WireOpcode::MoveObject16]
        }
        op => panic!("{:?} is not a move", op),
    };
    let dest_width = required_bit_width(insn.dest());
    let src_width = required_bit_width(insn.src(0));
    if dest_width <= 4 && src_width <= 4 {
        table[0]
    } else if dest_width <= 8 {
        table[1]
    } else {
        table[2]
    }
}

/// The narrowest constant-load form for the literal.
pub fn select_const_opcode(insn: &IrInstruction) -> WireOpcode {
    let literal = insn.literal();
    match insn.opcode() {
        Opcode::Const => {
            let dest_width = required_bit_width(insn.dest());
            if dest_width <= 4 && signed_int_fits(literal, 4) {
                WireOpcode::Const4
            } else if signed_int_fits(literal, 16) {
                WireOpcode::Const16
            } else if signed_int_fits_high16(literal, 32) {
                WireOpcode::ConstHigh16
            } else {
                WireOpcode::Const32
            }
        }
        Opcode::ConstWide => {
            if signed_int_fits(literal, 16) {
                WireOpcode::ConstWide16
            } else if signed_int_fits(literal, 32) {
                WireOpcode::ConstWide32
            } else if signed_int_fits_high16(literal, 64) {
                WireOpcode::ConstWideHigh16
            } else {
                WireOpcode::ConstWide64
            }
        }
        op => panic!("{:?} is not a constant load", op),
    }
}

/// Converts a binop to two-address form when the destination coincides
/// with a source and everything fits in 4 bits, commuting the operands
/// of commutative ops when that is what makes it fit. Returns whether
/// the conversion applies (possibly after mutating the operand order).
pub fn try_2addr_conversion(insn: &mut IrInstruction) -> bool {
    if insn.opcode().group() != OpcodeGroup::Binop {
        return false;
    }
    let dest = insn.dest();
    if insn.opcode().is_commutative()
        && dest == insn.src(1)
        && dest <= 0xf
        && insn.src(0) <= 0xf
    {
        let s0 = insn.src(0);
        let s1 = insn.src(1);
        insn.set_src(0, s1);
        insn.set_src(1, s0);
        return true;
    }
    dest == insn.src(0) && dest <= 0xf && insn.src(1) <= 0xf
}

/// The decisions of one selection run: which wire form each affected
/// instruction lowers to.
#[derive(Debug, Default)]
pub struct SelectionResult {
    pub wire_ops: HashMap<ItemId, WireOpcode>,
    pub stats: PassStats,
}

/// Runs instruction selection over an allocated method.
pub fn select_instructions(cfg: &mut Cfg) -> SelectionResult {
    let mut result = SelectionResult::default();
    for (b, id) in cfg.instructions() {
        let op = cfg.arena.insn(id).opcode();
        if op == Opcode::CheckCast {
            // The wire form has one register that is both src and dest;
            // reconcile them with a move in front when they differ. The
            // interference graph made this safe by keeping the dest clear
            // of everything live in the block.
            let Some((_, mrp)) = cfg.move_result_of(b, id) else {
                continue;
            };
            let dest = cfg.arena.insn(mrp).dest();
            let src = cfg.arena.insn(id).src(0);
            if dest != src {
                let mov = gen_move(RegisterType::Object, dest, src);
                let mov_wire = select_move_opcode(&mov);
                cfg.arena.insn_mut(id).set_src(0, dest);
                cfg.insert_before(b, id, vec![mov]);
                // The inserted move sits right before the cast.
                let insns = cfg.block(b).items.insn_ids(&cfg.arena);
                let pos = insns.iter().position(|x| *x == id).expect("cast is present");
                result.wire_ops.insert(insns[pos - 1], mov_wire);
                result.stats.move_for_check_cast += 1;
            }
            continue;
        }
        if op.is_move() {
            let wire = select_move_opcode(cfg.arena.insn(id));
            result.wire_ops.insert(id, wire);
        } else if op.is_const() {
            let wire = select_const_opcode(cfg.arena.insn(id));
            result.wire_ops.insert(id, wire);
        } else if op.group() == OpcodeGroup::Binop && cfg.arena.insn(id).has_dest() {
            if try_2addr_conversion(cfg.arena.insn_mut(id)) {
                result.wire_ops.insert(id, WireOpcode::Binop2Addr);
                result.stats.to_2addr += 1;
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn move_(dest: u32, src: u32) -> IrInstruction {
        IrInstruction::new(Opcode::Move).with_dest(dest).with_src(src)
    }

    #[rstest]
    #[case(0, 1, WireOpcode::Move)]
    #[case(15, 15, WireOpcode::Move)]
    #[case(16, 3, WireOpcode::MoveFrom16)]
    #[case(255, 300, WireOpcode::MoveFrom16)]
    #[case(256, 3, WireOpcode::Move16)]
    fn test_move_selection(#[case] dest: u32, #[case] src: u32, #[case] expected: WireOpcode) {
        assert_eq!(select_move_opcode(&move_(dest, src)), expected);
    }

    #[rstest]
    #[case(7, WireOpcode::Const4)]
    #[case(-8, WireOpcode::Const4)]
    #[case(8, WireOpcode::Const16)]
    #[case(0x7fff, WireOpcode::Const16)]
    #[case(0x10000, WireOpcode::ConstHigh16)]
    #[case(0x12345, WireOpcode::Const32)]
    fn test_const_selection(#[case] literal: i64, #[case] expected: WireOpcode) {
        let insn = IrInstruction::new(Opcode::Const).with_dest(1).with_literal(literal);
        assert_eq!(select_const_opcode(&insn), expected);
    }

    #[test]
    fn test_const_wide_selection() {
        let wide = |v: i64| IrInstruction::new(Opcode::ConstWide).with_dest(0).with_literal(v);
        assert_eq!(select_const_opcode(&wide(1)), WireOpcode::ConstWide16);
        assert_eq!(select_const_opcode(&wide(1 << 20)), WireOpcode::ConstWide32);
        assert_eq!(select_const_opcode(&wide(1 << 50)), WireOpcode::ConstWideHigh16);
        assert_eq!(select_const_opcode(&wide(0x123456789)), WireOpcode::ConstWide64);
    }

    #[test]
    fn test_wide_dest_uses_16_form_when_out_of_nibble() {
        let insn = IrInstruction::new(Opcode::Const).with_dest(200).with_literal(3);
        // A const with an 8-bit dest still encodes as const/16 since
        // const/4 needs a nibble destination.
        assert_eq!(select_const_opcode(&insn), WireOpcode::Const16);
    }

    #[test]
    fn test_2addr_direct() {
        let mut insn = IrInstruction::new(Opcode::SubInt).with_dest(2).with_srcs([2, 3]);
        assert!(try_2addr_conversion(&mut insn));
        assert_eq!(insn.srcs(), &[2, 3]);
    }

    #[test]
    fn test_2addr_commutes() {
        let mut insn = IrInstruction::new(Opcode::AddInt).with_dest(3).with_srcs([1, 3]);
        assert!(try_2addr_conversion(&mut insn));
        // The operands swapped so dest == src0.
        assert_eq!(insn.srcs(), &[3, 1]);
    }

    #[test]
    fn test_2addr_rejects_wide_registers() {
        let mut insn = IrInstruction::new(Opcode::SubInt).with_dest(20).with_srcs([20, 3]);
        assert!(!try_2addr_conversion(&mut insn));
        let mut non_commutative =
            IrInstruction::new(Opcode::SubInt).with_dest(3).with_srcs([1, 3]);
        assert!(!try_2addr_conversion(&mut non_commutative));
    }
}
