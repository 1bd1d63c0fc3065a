use super::*;
use crate::instruction::IrInstruction;
use crate::item::{CatchEntry, IrCode, TryMarker};
use crate::refs::make_field_desc;
use pretty_assertions::assert_eq;

fn const_(dest: u32, v: i64) -> IrInstruction {
    IrInstruction::new(Opcode::Const).with_dest(dest).with_literal(v)
}

fn ret(src: u32) -> IrInstruction {
    IrInstruction::new(Opcode::Return).with_src(src)
}

fn opcodes_of(cfg: &Cfg) -> Vec<Opcode> {
    cfg.instructions()
        .into_iter()
        .map(|(_, id)| cfg.arena.insn(id).opcode())
        .collect()
}

#[test]
fn test_build_single_block() {
    let mut code = IrCode::new();
    code.push(const_(0, 5));
    code.push(ret(0));
    let cfg = Cfg::build(code);
    assert_eq!(cfg.num_blocks(), 1);
    assert_eq!(cfg.registers_size(), 1);
    assert!(cfg.succs(cfg.entry_block()).is_empty());
    cfg.sanity_check();
}

#[test]
fn test_build_if_else() {
    // load-param v0; if-eqz v0 -> else; const v1 = 1; return v1;
    // else: const v1 = 2; return v1
    let mut code = IrCode::new();
    code.push(IrInstruction::new(Opcode::LoadParam).with_dest(0));
    let branch = code.push(IrInstruction::new(Opcode::IfEqz).with_src(0));
    code.push(const_(1, 1));
    code.push(ret(1));
    code.push_item(ItemKind::Target(crate::item::BranchTarget { src: branch, case_key: None }));
    code.push(const_(1, 2));
    code.push(ret(1));

    let cfg = Cfg::build(code);
    cfg.sanity_check();
    assert_eq!(cfg.num_blocks(), 3);

    let entry = cfg.entry_block();
    let goto_tgt = cfg.goto_target(entry).expect("fallthrough edge");
    let branch_edge = cfg.succ_edge_of_type(entry, EdgeType::Branch).expect("branch edge");
    let branch_tgt = cfg.edge(branch_edge).tgt;
    assert_ne!(goto_tgt, branch_tgt);

    // The fallthrough arm holds const 1, the taken arm const 2.
    let first_literal = |b: BlockId| {
        let id = cfg.first_insn(b).unwrap();
        cfg.arena.insn(id).literal()
    };
    assert_eq!(first_literal(goto_tgt), 1);
    assert_eq!(first_literal(branch_tgt), 2);
}

#[test]
fn test_goto_instructions_become_edges() {
    let mut code = IrCode::new();
    code.push(const_(0, 3));
    let goto = code.push(IrInstruction::new(Opcode::Goto));
    code.push_item(ItemKind::Target(crate::item::BranchTarget { src: goto, case_key: None }));
    code.push(ret(0));

    let cfg = Cfg::build(code);
    cfg.sanity_check();
    // No goto opcodes and no target items survive in editable form.
    assert!(opcodes_of(&cfg).iter().all(|op| !op.is_goto()));
}

#[test]
fn test_switch_edges_carry_case_keys() {
    let mut code = IrCode::new();
    code.push(IrInstruction::new(Opcode::LoadParam).with_dest(0));
    let switch = code.push(IrInstruction::new(Opcode::PackedSwitch).with_src(0));
    code.push(const_(1, 0));
    code.push(ret(1));
    code.push_item(ItemKind::Target(crate::item::BranchTarget {
        src: switch,
        case_key: Some(10),
    }));
    code.push(const_(1, 10));
    code.push(ret(1));
    code.push_item(ItemKind::Target(crate::item::BranchTarget {
        src: switch,
        case_key: Some(20),
    }));
    code.push(const_(1, 20));
    code.push(ret(1));

    let cfg = Cfg::build(code);
    cfg.sanity_check();
    let entry = cfg.entry_block();
    let branches = cfg.succ_edges_of_type(entry, EdgeType::Branch);
    assert_eq!(branches.len(), 2);
    let mut keys: Vec<i32> = branches
        .iter()
        .map(|e| match cfg.edge(*e).kind {
            EdgeKind::Branch { case_key: Some(k) } => k,
            _ => panic!("expected a switch arm"),
        })
        .collect();
    keys.sort_unstable();
    assert_eq!(keys, vec![10, 20]);
    // Plus the fallthrough.
    assert!(cfg.goto_target(entry).is_some());
}

#[test]
fn test_simplify_bypasses_empty_block() {
    // A: const; goto B; B: (empty) goto C; C: return.
    let mut code = IrCode::new();
    code.push(const_(0, 1));
    let goto1 = code.push(IrInstruction::new(Opcode::Goto));
    code.push_item(ItemKind::Target(crate::item::BranchTarget { src: goto1, case_key: None }));
    let goto2 = code.push(IrInstruction::new(Opcode::Goto));
    code.push_item(ItemKind::Target(crate::item::BranchTarget { src: goto2, case_key: None }));
    code.push(ret(0));

    let cfg = Cfg::build(code);
    cfg.sanity_check();
    // The empty middle block is gone and A points straight at C.
    assert_eq!(cfg.num_blocks(), 2);
    let entry = cfg.entry_block();
    let tgt = cfg.goto_target(entry).unwrap();
    assert_eq!(
        cfg.arena.insn(cfg.first_insn(tgt).unwrap()).opcode(),
        Opcode::Return
    );
}

#[test]
fn test_unreachable_blocks_are_removed() {
    let mut code = IrCode::new();
    code.push(const_(0, 1));
    code.push(ret(0));
    // Dead code after the return.
    code.push(const_(1, 2));
    code.push(ret(1));

    let cfg = Cfg::build(code);
    cfg.sanity_check();
    assert_eq!(cfg.num_blocks(), 1);
    assert_eq!(opcodes_of(&cfg), vec![Opcode::Const, Opcode::Return]);
}

#[test]
fn test_exit_block_of_infinite_loop() {
    // entry: const v0; loop: nop; goto loop
    let mut code = IrCode::new();
    code.push(const_(0, 1));
    code.push(ret(0));
    let mut cfg = Cfg::build(code);
    let entry = cfg.entry_block();
    let ret_item = cfg.last_insn(entry).unwrap();
    cfg.remove_insn(entry, ret_item);
    let looper = cfg.create_block();
    cfg.push_back(looper, vec![IrInstruction::new(Opcode::Nop)]);
    cfg.add_edge(entry, looper, EdgeKind::Goto);
    cfg.add_edge(looper, looper, EdgeKind::Goto);

    cfg.calculate_exit_block();
    // A lone successor-less SCC: its head is the unique exit, no ghost
    // block needed.
    assert_eq!(cfg.exit_block(), Some(looper));
    assert_eq!(cfg.real_exit_blocks(), vec![looper]);
}

#[test]
fn test_ghost_exit_for_multiple_exits() {
    // if-eqz v0 -> loop else return: two exit points, one real, one an
    // infinite loop.
    let mut code = IrCode::new();
    code.push(IrInstruction::new(Opcode::LoadParam).with_dest(0));
    code.push(ret(0));
    let mut cfg = Cfg::build(code);
    let entry = cfg.entry_block();
    let ret_item = cfg.last_insn(entry).unwrap();
    cfg.remove_insn(entry, ret_item);

    let ret_block = cfg.create_block();
    cfg.push_back(ret_block, vec![ret(0)]);
    let looper = cfg.create_block();
    cfg.push_back(looper, vec![IrInstruction::new(Opcode::Nop)]);
    cfg.add_edge(looper, looper, EdgeKind::Goto);
    cfg.create_branch(
        entry,
        IrInstruction::new(Opcode::IfEqz).with_src(0),
        Some(ret_block),
        vec![(1, looper)],
    );

    cfg.calculate_exit_block();
    let exit = cfg.exit_block().unwrap();
    assert_ne!(exit, ret_block);
    assert_ne!(exit, looper);
    let mut real = cfg.real_exit_blocks();
    real.sort();
    assert_eq!(real, vec![ret_block, looper]);
    // All edges into the ghost exit are ghost edges.
    for e in cfg.preds(exit) {
        assert_eq!(cfg.edge(e).kind.edge_type(), EdgeType::Ghost);
    }
    // Recomputing is stable: the old ghost exit is replaced, not
    // duplicated.
    let blocks_before = cfg.num_blocks();
    cfg.calculate_exit_block();
    assert_eq!(cfg.num_blocks(), blocks_before);
}

#[test]
fn test_try_catch_lowering_and_roundtrip() {
    let f = make_field_desc("LFoo;.x:I");
    // const v0; try { sget v0 } catch-all -> handler: const v1; return v1
    let mut code = IrCode::new();
    code.push(const_(0, 0));
    let catch_item = {
        // Forward-declare the catch entry; it lives at the handler below.
        code.arena.alloc(ItemKind::Catch(CatchEntry { catch_type: None, next: None }))
    };
    code.push_item(ItemKind::TryStart(TryMarker { catch_start: catch_item }));
    code.push(IrInstruction::new(Opcode::Sget).with_field(f));
    code.push(IrInstruction::new(Opcode::MoveResultPseudo).with_dest(0));
    code.push(ret(0));
    code.push_item(ItemKind::TryEnd(TryMarker { catch_start: catch_item }));
    code.list.link_back(&mut code.arena, catch_item);
    code.push(const_(1, 1));
    code.push(ret(1));

    let cfg = Cfg::build(code);
    cfg.sanity_check();

    // The sget block throws to the handler.
    let (sget_block, _) = cfg
        .instructions()
        .into_iter()
        .find(|(_, id)| cfg.arena.insn(*id).opcode() == Opcode::Sget)
        .expect("sget survives");
    let throws = cfg.get_outgoing_throws_in_order(sget_block);
    assert_eq!(throws.len(), 1);
    let handler = cfg.edge(throws[0]).tgt;
    assert!(cfg.is_catch_block(handler));
    match cfg.edge(throws[0]).kind {
        EdgeKind::Throw { catch_type, index } => {
            assert_eq!(catch_type, None);
            assert_eq!(index, 0);
        }
        _ => panic!("expected throw edge"),
    }

    // Round-trip: linearize and rebuild; the try structure is preserved.
    let linear = cfg.linearize();
    let has_try_start = linear
        .list
        .ids(&linear.arena)
        .iter()
        .any(|id| matches!(linear.arena.kind(*id), ItemKind::TryStart(_)));
    assert!(has_try_start);

    let rebuilt = Cfg::build(linear);
    rebuilt.sanity_check();
    let (sget_block, _) = rebuilt
        .instructions()
        .into_iter()
        .find(|(_, id)| rebuilt.arena.insn(*id).opcode() == Opcode::Sget)
        .expect("sget survives the round-trip");
    assert_eq!(rebuilt.get_outgoing_throws_in_order(sget_block).len(), 1);
}

#[test]
fn test_catch_list_reuse_across_equivalent_tries() {
    let f = make_field_desc("LFoo;.x:I");
    // Two separate try regions with identical catch-all handlers.
    let mut code = IrCode::new();
    let c1 = code.arena.alloc(ItemKind::Catch(CatchEntry { catch_type: None, next: None }));
    let c2 = code.arena.alloc(ItemKind::Catch(CatchEntry { catch_type: None, next: None }));
    code.push_item(ItemKind::TryStart(TryMarker { catch_start: c1 }));
    code.push(IrInstruction::new(Opcode::Sget).with_field(f));
    code.push(IrInstruction::new(Opcode::MoveResultPseudo).with_dest(0));
    code.push_item(ItemKind::TryEnd(TryMarker { catch_start: c1 }));
    code.push_item(ItemKind::TryStart(TryMarker { catch_start: c2 }));
    code.push(IrInstruction::new(Opcode::Sget).with_field(f));
    code.push(IrInstruction::new(Opcode::MoveResultPseudo).with_dest(1));
    code.push_item(ItemKind::TryEnd(TryMarker { catch_start: c2 }));
    code.push(ret(1));
    code.list.link_back(&mut code.arena, c1);
    code.list.link_back(&mut code.arena, c2);
    code.push(const_(2, 0));
    code.push(ret(2));

    let cfg = Cfg::build(code);
    cfg.sanity_check();

    let linear = cfg.linearize();
    let catch_count = linear
        .list
        .ids(&linear.arena)
        .iter()
        .filter(|id| matches!(linear.arena.kind(**id), ItemKind::Catch(_)))
        .count();
    // Both tries throw to the same handler with the same type, so one
    // catch list serves both.
    assert_eq!(catch_count, 1);
}

#[test]
fn test_linearize_roundtrip_preserves_instructions() {
    let mut code = IrCode::new();
    code.push(IrInstruction::new(Opcode::LoadParam).with_dest(0));
    let branch = code.push(IrInstruction::new(Opcode::IfEqz).with_src(0));
    code.push(const_(1, 1));
    code.push(ret(1));
    code.push_item(ItemKind::Target(crate::item::BranchTarget { src: branch, case_key: None }));
    code.push(const_(1, 2));
    code.push(ret(1));

    let cfg = Cfg::build(code);
    let before = {
        let mut ops: Vec<String> = cfg
            .instructions()
            .iter()
            .map(|(_, id)| cfg.arena.insn(*id).to_string())
            .collect();
        ops.sort();
        ops
    };

    let linear = cfg.linearize();
    let rebuilt = Cfg::build(linear);
    rebuilt.sanity_check();
    let after = {
        let mut ops: Vec<String> = rebuilt
            .instructions()
            .iter()
            .map(|(_, id)| rebuilt.arena.insn(*id).to_string())
            .collect();
        ops.sort();
        ops
    };
    // Ignoring synthesized gotos (there are none here: both arms end in
    // returns), the instruction multiset is unchanged.
    assert_eq!(before, after);
}

#[test]
fn test_split_and_merge_blocks() {
    let mut code = IrCode::new();
    code.push(const_(0, 1));
    code.push(const_(1, 2));
    code.push(ret(0));
    let mut cfg = Cfg::build(code);
    let entry = cfg.entry_block();
    let first = cfg.first_insn(entry).unwrap();

    let rest = cfg.split_block(entry, first);
    cfg.sanity_check();
    assert_eq!(cfg.num_blocks(), 2);
    assert_eq!(cfg.goto_target(entry), Some(rest));
    assert_eq!(cfg.block(entry).items.count_opcodes(&cfg.arena), 1);
    assert_eq!(cfg.block(rest).items.count_opcodes(&cfg.arena), 2);

    cfg.merge_blocks(entry, rest);
    cfg.sanity_check();
    assert_eq!(cfg.num_blocks(), 1);
    assert_eq!(cfg.block(entry).items.count_opcodes(&cfg.arena), 3);
}

#[test]
fn test_insert_terminator_prunes_block() {
    let mut code = IrCode::new();
    code.push(const_(0, 1));
    code.push(const_(1, 2));
    code.push(ret(0));
    let mut cfg = Cfg::build(code);
    let entry = cfg.entry_block();
    let first = cfg.first_insn(entry).unwrap();

    // Insert a return right after the first const: everything after it
    // must go.
    let invalidated = cfg.insert_after(entry, first, vec![ret(0)]);
    assert!(invalidated);
    assert_eq!(opcodes_of(&cfg), vec![Opcode::Const, Opcode::Return]);
    cfg.sanity_check();
}

#[test]
fn test_remove_conditional_branch_leaves_goto() {
    let mut code = IrCode::new();
    code.push(IrInstruction::new(Opcode::LoadParam).with_dest(0));
    let branch = code.push(IrInstruction::new(Opcode::IfEqz).with_src(0));
    code.push(const_(1, 1));
    code.push(ret(1));
    code.push_item(ItemKind::Target(crate::item::BranchTarget { src: branch, case_key: None }));
    code.push(const_(1, 2));
    code.push(ret(1));
    let mut cfg = Cfg::build(code);
    let entry = cfg.entry_block();
    let branch_item = cfg.last_insn(entry).unwrap();

    cfg.remove_insn(entry, branch_item);
    // The branch edge died with the branch; only the goto remains.
    assert!(cfg.succ_edge_of_type(entry, EdgeType::Branch).is_none());
    assert!(cfg.goto_target(entry).is_some());
    cfg.simplify();
    cfg.sanity_check();
}

#[test]
fn test_deleting_branch_edge_rewrites_to_goto() {
    let mut code = IrCode::new();
    code.push(IrInstruction::new(Opcode::LoadParam).with_dest(0));
    let branch = code.push(IrInstruction::new(Opcode::IfEqz).with_src(0));
    code.push(const_(1, 1));
    code.push(ret(1));
    code.push_item(ItemKind::Target(crate::item::BranchTarget { src: branch, case_key: None }));
    code.push(const_(1, 2));
    code.push(ret(1));
    let mut cfg = Cfg::build(code);
    let entry = cfg.entry_block();

    let e = cfg.succ_edge_of_type(entry, EdgeType::Branch).unwrap();
    cfg.delete_edge(e);
    // The conditional collapsed into an unconditional fallthrough.
    assert!(cfg
        .last_insn(entry)
        .map(|id| !cfg.arena.insn(id).opcode().is_branch())
        .unwrap_or(true));
    assert_eq!(cfg.succs(entry).len(), 1);
    cfg.simplify();
    cfg.sanity_check();
}

#[test]
fn test_immediate_dominators() {
    //     entry
    //     /   \
    //    a     b
    //     \   /
    //      join
    let mut code = IrCode::new();
    code.push(IrInstruction::new(Opcode::LoadParam).with_dest(0));
    code.push(ret(0));
    let mut cfg = Cfg::build(code);
    let entry = cfg.entry_block();
    let ret_item = cfg.last_insn(entry).unwrap();
    cfg.remove_insn(entry, ret_item);

    let join = cfg.create_block();
    cfg.push_back(join, vec![ret(0)]);
    let a = cfg.create_block();
    cfg.push_back(a, vec![const_(1, 1)]);
    cfg.add_edge(a, join, EdgeKind::Goto);
    let b = cfg.create_block();
    cfg.push_back(b, vec![const_(1, 2)]);
    cfg.add_edge(b, join, EdgeKind::Goto);
    cfg.create_branch(
        entry,
        IrInstruction::new(Opcode::IfEqz).with_src(0),
        Some(a),
        vec![(1, b)],
    );

    let idom = cfg.immediate_dominators();
    assert_eq!(idom[&a], entry);
    assert_eq!(idom[&b], entry);
    assert_eq!(idom[&join], entry);
    assert_eq!(idom[&entry], entry);
}

#[test]
fn test_deep_copy_is_independent() {
    let mut code = IrCode::new();
    code.push(const_(0, 7));
    code.push(ret(0));
    let cfg = Cfg::build(code);
    let mut copy = cfg.clone();

    let entry = copy.entry_block();
    let first = copy.first_insn(entry).unwrap();
    copy.arena.insn_mut(first).set_literal(99);

    let orig_first = cfg.first_insn(cfg.entry_block()).unwrap();
    assert_eq!(cfg.arena.insn(orig_first).literal(), 7);
    assert_eq!(copy.arena.insn(first).literal(), 99);
}
