//! End-to-end transform scenarios: analysis drives rewrites, the graph
//! stays consistent, and the expected code shape drops out.

use dexopt_analysis::domains::AbstractDomain;
use dexopt_constprop::analyzer::InstructionAnalyzerCombiner;
use dexopt_constprop::domain::ConstantEnvironment;
use dexopt_constprop::transform::{Transform, TransformConfig};
use dexopt_constprop::whole_program::{take_cfgs, WholeProgramState};
use dexopt_ir::cfg::Cfg;
use dexopt_ir::instruction::IrInstruction;
use dexopt_ir::item::{BranchTarget, IrCode, ItemKind};
use dexopt_ir::refs::{make_field_desc, make_method_desc, make_type};
use dexopt_ir::scope::{DexClass, FieldDef, MethodDef, Scope};
use dexopt_ir::Opcode;
use pretty_assertions::assert_eq;

fn const_(dest: u32, v: i64) -> IrInstruction {
    IrInstruction::new(Opcode::Const).with_dest(dest).with_literal(v)
}

fn opcodes_of(cfg: &Cfg) -> Vec<Opcode> {
    cfg.instructions()
        .into_iter()
        .map(|(_, id)| cfg.arena.insn(id).opcode())
        .collect()
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn run_transform(cfg: &mut Cfg) -> dexopt_common::PassStats {
    let mut transform = Transform::new(TransformConfig::default());
    transform.apply(
        cfg,
        InstructionAnalyzerCombiner::default_chain(None, None, None),
        &WholeProgramState::unknown(),
        ConstantEnvironment::top(),
    )
}

#[test]
fn test_constant_branch_collapses_to_single_return() {
    init_logging();
    // A: const v0 = 5; if v0 > 0 goto B else fall through to C;
    // C: const v1 = 0; return v1;  B: return v0
    let mut code = IrCode::new();
    code.push(const_(0, 5));
    let branch = code.push(IrInstruction::new(Opcode::IfGtz).with_src(0));
    code.push(const_(1, 0));
    code.push(IrInstruction::new(Opcode::Return).with_src(1));
    code.push_item(ItemKind::Target(BranchTarget { src: branch, case_key: None }));
    code.push(IrInstruction::new(Opcode::Return).with_src(0));
    let mut cfg = Cfg::build(code);

    let stats = run_transform(&mut cfg);
    cfg.sanity_check();

    // The branch folded, the dead arm is gone, and what's left returns 5.
    assert_eq!(stats.branches_removed, 1);
    assert_eq!(opcodes_of(&cfg), vec![Opcode::Const, Opcode::Return]);
    let (_, const_item) = cfg.instructions()[0];
    assert_eq!(cfg.arena.insn(const_item).literal(), 5);

    // Linearized, the method is a straight line with no gotos.
    let linear = cfg.linearize();
    let ops: Vec<Opcode> = linear
        .insn_ids()
        .iter()
        .map(|id| linear.arena.insn(*id).opcode())
        .collect();
    assert_eq!(ops, vec![Opcode::Const, Opcode::Return]);
}

#[test]
fn test_never_taken_branch_keeps_fallthrough() {
    let mut code = IrCode::new();
    code.push(const_(0, 0));
    let branch = code.push(IrInstruction::new(Opcode::IfGtz).with_src(0));
    code.push(const_(1, 1));
    code.push(IrInstruction::new(Opcode::Return).with_src(1));
    code.push_item(ItemKind::Target(BranchTarget { src: branch, case_key: None }));
    code.push(IrInstruction::new(Opcode::Return).with_src(0));
    let mut cfg = Cfg::build(code);

    run_transform(&mut cfg);
    cfg.sanity_check();
    // 0 > 0 is never taken; the fallthrough survives and returns 1.
    let ops = opcodes_of(&cfg);
    assert_eq!(ops, vec![Opcode::Const, Opcode::Const, Opcode::Return]);
}

#[test]
fn test_switch_with_constant_scrutinee() {
    let mut code = IrCode::new();
    code.push(const_(0, 10));
    let switch = code.push(IrInstruction::new(Opcode::PackedSwitch).with_src(0));
    code.push(const_(1, 0));
    code.push(IrInstruction::new(Opcode::Return).with_src(1));
    code.push_item(ItemKind::Target(BranchTarget { src: switch, case_key: Some(10) }));
    code.push(const_(1, 100));
    code.push(IrInstruction::new(Opcode::Return).with_src(1));
    code.push_item(ItemKind::Target(BranchTarget { src: switch, case_key: Some(20) }));
    code.push(const_(1, 200));
    code.push(IrInstruction::new(Opcode::Return).with_src(1));
    let mut cfg = Cfg::build(code);

    run_transform(&mut cfg);
    cfg.sanity_check();
    // Only the case-10 arm remains; the switch became a goto.
    let literals: Vec<i64> = cfg
        .instructions()
        .into_iter()
        .filter(|(_, id)| cfg.arena.insn(*id).opcode().is_const())
        .map(|(_, id)| cfg.arena.insn(id).literal())
        .collect();
    assert_eq!(literals, vec![10, 100]);
}

#[test]
fn test_move_of_constant_materializes_const() {
    let mut code = IrCode::new();
    code.push(const_(0, 9));
    code.push(IrInstruction::new(Opcode::Move).with_dest(1).with_src(0));
    code.push(IrInstruction::new(Opcode::Return).with_src(1));
    let mut cfg = Cfg::build(code);

    let stats = run_transform(&mut cfg);
    cfg.sanity_check();
    assert_eq!(stats.materialized_consts, 1);
    let ops = opcodes_of(&cfg);
    assert_eq!(ops, vec![Opcode::Const, Opcode::Const, Opcode::Return]);
    // The move became const v1 = 9.
    let (_, second) = cfg.instructions()[1];
    assert_eq!(cfg.arena.insn(second).dest(), 1);
    assert_eq!(cfg.arena.insn(second).literal(), 9);
}

#[test]
fn test_arithmetic_folds_through_lit_ops() {
    let mut code = IrCode::new();
    code.push(const_(0, 10));
    code.push(IrInstruction::new(Opcode::AddIntLit8).with_dest(1).with_src(0).with_literal(5));
    code.push(IrInstruction::new(Opcode::MulIntLit8).with_dest(2).with_src(1).with_literal(2));
    code.push(IrInstruction::new(Opcode::Return).with_src(2));
    let mut cfg = Cfg::build(code);

    run_transform(&mut cfg);
    cfg.sanity_check();
    let consts: Vec<i64> = cfg
        .instructions()
        .into_iter()
        .filter(|(_, id)| cfg.arena.insn(*id).opcode().is_const())
        .map(|(_, id)| cfg.arena.insn(id).literal())
        .collect();
    assert_eq!(consts, vec![10, 15, 30]);
}

#[test]
fn test_npe_synthesis_for_null_receiver() {
    let field = make_field_desc("LFoo;.size:I");
    // const v0 = 0 (null); iget v0.size -> throws NPE for sure
    let mut code = IrCode::new();
    code.push(const_(0, 0));
    code.push(IrInstruction::new(Opcode::Iget).with_field(field).with_src(0));
    code.push(IrInstruction::new(Opcode::MoveResultPseudo).with_dest(1));
    code.push(IrInstruction::new(Opcode::Return).with_src(1));
    let mut cfg = Cfg::build(code);

    let stats = run_transform(&mut cfg);
    cfg.sanity_check();
    assert_eq!(stats.throws_synthesized, 1);

    let ops = opcodes_of(&cfg);
    // const; const-string "size"; new-instance NPE; invoke <init>; throw
    assert!(ops.contains(&Opcode::ConstString));
    assert!(ops.contains(&Opcode::NewInstance));
    assert!(ops.contains(&Opcode::InvokeDirect));
    assert!(ops.contains(&Opcode::Throw));
    // The guaranteed-to-throw iget and the return after it are gone.
    assert!(!ops.contains(&Opcode::Iget));
    assert!(!ops.contains(&Opcode::Return));
}

#[test]
fn test_npe_message_names_the_opcode() {
    // A monitor-enter has no member to name, so the message carries the
    // opcode mnemonic.
    let mut code = IrCode::new();
    code.push(const_(0, 0));
    code.push(IrInstruction::new(Opcode::MonitorEnter).with_src(0));
    code.push(IrInstruction::new(Opcode::ReturnVoid));
    let mut cfg = Cfg::build(code);

    let stats = run_transform(&mut cfg);
    cfg.sanity_check();
    assert_eq!(stats.throws_synthesized, 1);

    let message = cfg
        .instructions()
        .into_iter()
        .find(|(_, id)| cfg.arena.insn(*id).opcode() == Opcode::ConstString)
        .map(|(_, id)| dexopt_ir::refs::string(cfg.arena.insn(id).string()))
        .expect("NPE synthesis emits a message string");
    assert_eq!(&*message, "monitor-enter");
}

#[test]
fn test_redundant_sput_removed() {
    let class_type = make_type("LCfg;");
    let field = make_field_desc("LCfg;.FLAG:I");
    let clinit = make_method_desc("LCfg;.<clinit>:()V");
    let setter = make_method_desc("LCfg;.reset:()V");

    // The clinit stores 1; reset() stores 1 again, which is redundant.
    let mut clinit_code = IrCode::new();
    clinit_code.push(const_(0, 1));
    clinit_code.push(IrInstruction::new(Opcode::Sput).with_field(field).with_src(0));
    clinit_code.push(IrInstruction::new(Opcode::ReturnVoid));

    let mut reset_code = IrCode::new();
    reset_code.push(const_(0, 1));
    reset_code.push(IrInstruction::new(Opcode::Sput).with_field(field).with_src(0));
    reset_code.push(IrInstruction::new(Opcode::ReturnVoid));

    let mut cls = DexClass::new(class_type);
    cls.sfields.push(FieldDef { id: field, is_static: true, encoded_value: None });
    cls.dmethods.push(MethodDef { id: clinit, is_static: true, code: Some(clinit_code) });
    cls.dmethods.push(MethodDef { id: setter, is_static: true, code: Some(reset_code) });
    let mut scope = Scope::new(vec![cls]);

    let mut cfgs = take_cfgs(&mut scope);
    let wps = WholeProgramState::build(&scope, &cfgs);

    let reset_cfg = cfgs.get_mut(&setter).unwrap();
    let mut transform = Transform::new(TransformConfig::default());
    let stats = transform.apply(
        reset_cfg,
        InstructionAnalyzerCombiner::default_chain(None, None, Some(&wps)),
        &wps,
        ConstantEnvironment::top(),
    );
    assert_eq!(stats.redundant_puts_removed, 1);
    assert!(!opcodes_of(reset_cfg).contains(&Opcode::Sput));
}

#[test]
fn test_forward_target_skips_trivial_conditional() {
    // A: const v0 = 1; goto B.  B: if-eqz v0 -> D else C.
    // A's entry state decides B, so A can jump straight to C.
    let mut code = IrCode::new();
    code.push(const_(0, 1));
    let goto_insn = code.push(IrInstruction::new(Opcode::Goto));
    code.push_item(ItemKind::Target(BranchTarget { src: goto_insn, case_key: None }));
    let branch = code.push(IrInstruction::new(Opcode::IfEqz).with_src(0));
    code.push(const_(1, 2));
    code.push(IrInstruction::new(Opcode::Return).with_src(1));
    code.push_item(ItemKind::Target(BranchTarget { src: branch, case_key: None }));
    code.push(const_(1, 3));
    code.push(IrInstruction::new(Opcode::Return).with_src(1));
    let mut cfg = Cfg::build(code);

    let stats = run_transform(&mut cfg);
    cfg.sanity_check();
    // Either by forwarding or by plain folding the dead arm is gone.
    assert!(stats.branches_removed + stats.branches_forwarded >= 1);
    let literals: Vec<i64> = cfg
        .instructions()
        .into_iter()
        .filter(|(_, id)| cfg.arena.insn(*id).opcode().is_const())
        .map(|(_, id)| cfg.arena.insn(id).literal())
        .collect();
    // Only the live arm's constant remains alongside v0's.
    assert!(literals.contains(&1));
    assert!(literals.contains(&2));
    assert!(!literals.contains(&3));
}

#[test]
fn test_null_check_on_known_object_folds() {
    // v0 = new Foo(); if-eqz v0 can never be taken.
    let foo = make_type("LFoo;");
    let mut code = IrCode::new();
    code.push(IrInstruction::new(Opcode::NewInstance).with_type(foo));
    code.push(IrInstruction::new(Opcode::MoveResultPseudoObject).with_dest(0));
    let branch = code.push(IrInstruction::new(Opcode::IfEqz).with_src(0));
    code.push(IrInstruction::new(Opcode::ReturnVoid));
    code.push_item(ItemKind::Target(BranchTarget { src: branch, case_key: None }));
    code.push(const_(1, 0));
    code.push(IrInstruction::new(Opcode::Return).with_src(1));
    let mut cfg = Cfg::build(code);

    let stats = run_transform(&mut cfg);
    cfg.sanity_check();
    assert_eq!(stats.null_checks_removed, 1);
    let ops = opcodes_of(&cfg);
    // The null arm died; the method just returns void.
    assert!(ops.contains(&Opcode::ReturnVoid));
    assert!(!ops.iter().any(|op| op.is_conditional_branch()));
    assert!(!ops.contains(&Opcode::Return));
}
