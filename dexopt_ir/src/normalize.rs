//! Normalization of incoming method bodies and denormalization on the
//! way out
//!
//! The DEX parser hands us instructions in expanded wire shape: wide
//! invoke arguments mention both halves, may-throw opcodes still carry
//! their destination, and parameters are implicit in the calling
//! convention. [`expand_input`] rewrites a body into the IR shape the
//! analyses expect; [`lower_output`] undoes the register normalization
//! for the emitter.

use crate::instruction::IrInstruction;
use crate::item::{IrCode, ItemKind};
use crate::opcode::{param_registers, Opcode};
use crate::refs::{self, MethodId};

/// Brings a freshly decoded method body into analysis form:
///
/// 1. Synthesizes the `load-param` prefix from the method signature. The
///    Dalvik ABI passes arguments in the highest registers of the frame.
/// 2. Splits every may-throw opcode that carries a destination into the
///    throwing opcode plus a `move-result-pseudo` owning the dest.
/// 3. Normalizes invoke source lists to mention wide pairs once.
pub fn expand_input(code: &mut IrCode, method: MethodId, is_static: bool) {
    insert_load_params(code, method, is_static);
    split_may_throw_dests(code);
    for id in code.insn_ids() {
        code.arena.insn_mut(id).normalize_registers();
    }
}

fn insert_load_params(code: &mut IrCode, method: MethodId, is_static: bool) {
    let proto = refs::proto(refs::method(method).proto);
    let params_size = param_registers(method, is_static);
    assert!(
        code.registers_size >= params_size,
        "frame of {} registers cannot hold {} parameter registers",
        code.registers_size,
        params_size
    );
    let mut reg = code.registers_size - params_size;
    let mut load_params = Vec::new();
    if !is_static {
        load_params.push(IrInstruction::new(Opcode::LoadParamObject).with_dest(reg));
        reg += 1;
    }
    for arg in &proto.args {
        let info = refs::type_info(*arg);
        let op = if info.is_wide {
            Opcode::LoadParamWide
        } else if info.is_object {
            Opcode::LoadParamObject
        } else {
            Opcode::LoadParam
        };
        load_params.push(IrInstruction::new(op).with_dest(reg));
        reg += if info.is_wide { 2 } else { 1 };
    }
    // The prefix goes in reverse so each push_front lands in order.
    for insn in load_params.into_iter().rev() {
        code.list.push_front(&mut code.arena, ItemKind::Insn(insn));
    }
}

/// The parser leaves the wire destination on may-throw opcodes, stashed
/// as source 0 of the decoded instruction; here it moves onto a fresh
/// move-result-pseudo inserted right behind each one. check-cast is the
/// one opcode whose single wire register acts as both src and dest, so
/// its source list stays put and the pseudo takes the same register (the
/// post-cast value models a fresh definition).
fn split_may_throw_dests(code: &mut IrCode) {
    for id in code.insn_ids() {
        let opcode = code.arena.insn(id).opcode();
        if !opcode.has_move_result_pseudo() {
            continue;
        }
        let insn = code.arena.insn_mut(id);
        let dest = insn.src(0);
        if opcode != Opcode::CheckCast {
            let srcs: Vec<u32> = insn.srcs().iter().copied().skip(1).collect();
            insn.set_srcs(srcs);
        }
        let pseudo = IrInstruction::new(opcode.move_result_pseudo_for()).with_dest(dest);
        code.list.insert_after(&mut code.arena, id, ItemKind::Insn(pseudo));
    }
}

/// Prepares a linearized body for the emitter: invokes get their wide
/// pairs expanded back to both halves, and the reference gather passes
/// feed the constant-pool builder.
pub fn lower_output(code: &mut IrCode) -> GatheredRefs {
    for id in code.insn_ids() {
        code.arena.insn_mut(id).denormalize_registers();
    }
    let mut refs = GatheredRefs::default();
    code.list.gather_strings(&code.arena, &mut refs.strings);
    code.list.gather_types(&code.arena, &mut refs.types);
    code.list.gather_fields(&code.arena, &mut refs.fields);
    code.list.gather_methods(&code.arena, &mut refs.methods);
    refs
}

/// Every reference mentioned by a method body, for the constant-pool
/// emitter.
#[derive(Debug, Default)]
pub struct GatheredRefs {
    pub strings: Vec<crate::refs::StringId>,
    pub types: Vec<crate::refs::TypeId>,
    pub fields: Vec<crate::refs::FieldId>,
    pub methods: Vec<crate::refs::MethodId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::{make_field_desc, make_method_desc};

    #[test]
    fn test_load_param_synthesis() {
        let m = make_method_desc("LFoo;.f:(IJ)V");
        let mut code = IrCode::new();
        code.registers_size = 7; // v0..v2 locals, v3 this, v4 int, v5/v6 long
        code.push(IrInstruction::new(Opcode::ReturnVoid));
        expand_input(&mut code, m, false);

        let insns: Vec<IrInstruction> =
            code.insn_ids().iter().map(|id| code.arena.insn(*id).clone()).collect();
        assert_eq!(insns[0].opcode(), Opcode::LoadParamObject);
        assert_eq!(insns[0].dest(), 3);
        assert_eq!(insns[1].opcode(), Opcode::LoadParam);
        assert_eq!(insns[1].dest(), 4);
        assert_eq!(insns[2].opcode(), Opcode::LoadParamWide);
        assert_eq!(insns[2].dest(), 5);
        assert_eq!(insns[3].opcode(), Opcode::ReturnVoid);
    }

    #[test]
    fn test_may_throw_dest_splitting() {
        let f = make_field_desc("LFoo;.count:I");
        let mut code = IrCode::new();
        code.registers_size = 2;
        // Decoded form: sget with the wire dest stashed at src 0.
        code.push(IrInstruction::new(Opcode::Sget).with_field(f).with_src(1));
        code.push(IrInstruction::new(Opcode::Return).with_src(1));
        let m = make_method_desc("LFoo;.get:()I");
        expand_input(&mut code, m, true);

        let insns: Vec<IrInstruction> =
            code.insn_ids().iter().map(|id| code.arena.insn(*id).clone()).collect();
        assert_eq!(insns[0].opcode(), Opcode::Sget);
        assert_eq!(insns[0].srcs_size(), 0);
        assert_eq!(insns[1].opcode(), Opcode::MoveResultPseudo);
        assert_eq!(insns[1].dest(), 1);
        assert_eq!(insns[2].opcode(), Opcode::Return);
    }

    #[test]
    fn test_lower_output_gathers_refs() {
        let m = make_method_desc("LFoo;.callee:(J)V");
        let mut code = IrCode::new();
        code.registers_size = 3;
        code.push(
            IrInstruction::new(Opcode::InvokeStatic).with_method(m).with_srcs([0]),
        );
        code.push(IrInstruction::new(Opcode::ReturnVoid));

        let gathered = lower_output(&mut code);
        assert_eq!(gathered.methods, vec![m]);
        // The wide argument is expanded back into both halves.
        let invoke = code.arena.insn(code.insn_ids()[0]).clone();
        assert_eq!(invoke.srcs(), &[0, 1]);
    }
}
