//! The interference graph
//!
//! Nodes are registers (live ranges after renumbering); an edge joins two
//! registers that are live at the same point. We determine a node's
//! colorability with equation E.3 of Smith, Ramsey & Holloway, "A
//! generalized algorithm for graph-coloring register allocation", for
//! registers of varying width in an unaligned architecture:
//!
//! Let w(n) be the width of node n. n is colorable if
//!
//! ```text
//!   ( sum over adjacent j of ceil(w(j)/w(n)) ) < ceil((max_vreg(n)+1) / (2*w(n) - 1))
//! ```
//!
//! The summand is the "edge weight" (note that in general
//! weight(u,v) != weight(v,u) even though edges are undirected), and the
//! left-hand side is the node weight maintained incrementally below.
//! With all widths 1 this reduces to Chaitin's degree < k criterion.

use crate::register_type::{dest_reg_type, src_reg_type, RegisterType};
use bitflags::bitflags;
use dexopt_analysis::domains::LivenessDomain;
use dexopt_ir::cfg::Cfg;
use dexopt_ir::liveness::{self, Liveness};
use dexopt_ir::opcode::max_unsigned_value;
use dexopt_ir::{ItemId, Opcode, Reg, MAX_NON_RANGE_ARGS};
use hashbrown::{HashMap, HashSet};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        const ACTIVE = 0b0001;
        const PARAM = 0b0010;
        const RANGE = 0b0100;
        const SPILL = 0b1000;
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    type_: RegisterType,
    max_vreg: Reg,
    adjacent: Vec<Reg>,
    flags: NodeFlags,
    weight: u32,
    spill_cost: u32,
}

impl Default for Node {
    fn default() -> Self {
        Node {
            type_: RegisterType::Unknown,
            max_vreg: max_unsigned_value(16),
            adjacent: Vec::new(),
            flags: NodeFlags::ACTIVE,
            weight: 0,
            spill_cost: 0,
        }
    }
}

impl Node {
    pub fn reg_type(&self) -> RegisterType {
        self.type_
    }

    pub fn width(&self) -> u32 {
        self.type_.width()
    }

    pub fn max_vreg(&self) -> Reg {
        self.max_vreg
    }

    pub fn adjacent(&self) -> &[Reg] {
        &self.adjacent
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn spill_cost(&self) -> u32 {
        self.spill_cost
    }

    pub fn is_active(&self) -> bool {
        self.flags.contains(NodeFlags::ACTIVE)
    }

    pub fn is_param(&self) -> bool {
        self.flags.contains(NodeFlags::PARAM)
    }

    pub fn is_range(&self) -> bool {
        self.flags.contains(NodeFlags::RANGE)
    }

    pub fn is_spilt(&self) -> bool {
        self.flags.contains(NodeFlags::SPILL)
    }

    pub fn colorable_limit(&self) -> u32 {
        div_ceil(self.max_vreg + 1, 2 * self.width() - 1)
    }

    pub fn definitely_colorable(&self) -> bool {
        self.weight < self.colorable_limit()
    }
}

fn div_ceil(x: u32, y: u32) -> u32 {
    (x + y - 1) / y
}

fn edge_weight(u: &Node, v: &Node) -> u32 {
    div_ceil(v.width(), u.width())
}

/// The set of invoke instructions that must use the /range encoding.
#[derive(Debug, Default)]
pub struct RangeSet {
    insns: HashSet<ItemId>,
}

impl RangeSet {
    /// An instruction needs the range form when its denormalized operand
    /// list no longer fits the 5-slot non-range encoding.
    pub fn init(cfg: &Cfg) -> RangeSet {
        let mut insns = HashSet::new();
        for (_, id) in cfg.instructions() {
            let insn = cfg.arena.insn(id);
            if !insn.opcode().has_range_form() {
                continue;
            }
            let denormalized_args: usize = (0..insn.srcs_size())
                .map(|i| if insn.src_is_wide(i) { 2 } else { 1 })
                .sum();
            if denormalized_args > MAX_NON_RANGE_ARGS {
                insns.insert(id);
            }
        }
        RangeSet { insns }
    }

    pub fn contains(&self, insn: ItemId) -> bool {
        self.insns.contains(&insn)
    }

    pub fn iter(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.insns.iter().copied()
    }
}

#[derive(Debug, Default)]
pub struct Graph {
    nodes: HashMap<Reg, Node>,
    adj_matrix: HashSet<(Reg, Reg)>,
    // Live-out at each range instruction, captured for contiguous
    // allocation later.
    range_liveness: HashMap<ItemId, Vec<Reg>>,
    // (a, b) present when every def of b happens while a is live; a move
    // between contained registers is safe to coalesce.
    containment: HashSet<(Reg, Reg)>,
}

impl Graph {
    pub fn node(&self, reg: Reg) -> &Node {
        &self.nodes[&reg]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (Reg, &Node)> {
        self.nodes.iter().map(|(r, n)| (*r, n))
    }

    pub fn is_adjacent(&self, u: Reg, v: Reg) -> bool {
        self.adj_matrix.contains(&canonical(u, v))
    }

    pub fn contains(&self, a: Reg, b: Reg) -> bool {
        self.containment.contains(&(a, b))
    }

    pub fn range_liveness(&self, insn: ItemId) -> &[Reg] {
        &self.range_liveness[&insn]
    }

    pub fn add_edge(&mut self, u: Reg, v: Reg) {
        if u == v || !self.adj_matrix.insert(canonical(u, v)) {
            return;
        }
        let u_to_v = edge_weight(&self.nodes[&u], &self.nodes[&v]);
        let v_to_u = edge_weight(&self.nodes[&v], &self.nodes[&u]);
        {
            let u_node = self.nodes.get_mut(&u).expect("node exists");
            u_node.adjacent.push(v);
            u_node.weight += u_to_v;
        }
        let v_node = self.nodes.get_mut(&v).expect("node exists");
        v_node.adjacent.push(u);
        v_node.weight += v_to_u;
    }

    /// Folds `v` into `u` for coalescing: `u` inherits `v`'s edges and
    /// constraints, `v` goes inactive.
    pub fn combine(&mut self, u: Reg, v: Reg) {
        let v_adjacent = self.nodes[&v].adjacent.clone();
        for t in v_adjacent {
            if self.nodes[&t].is_active() {
                self.add_edge(u, t);
            }
        }
        if self.is_adjacent(u, v) {
            let w_uv = edge_weight(&self.nodes[&u], &self.nodes[&v]);
            let w_vu = edge_weight(&self.nodes[&v], &self.nodes[&u]);
            self.nodes.get_mut(&u).expect("node exists").weight -= w_uv;
            self.nodes.get_mut(&v).expect("node exists").weight -= w_vu;
        }
        let v_node = self.nodes[&v].clone();
        let u_node = self.nodes.get_mut(&u).expect("node exists");
        u_node.max_vreg = u_node.max_vreg.min(v_node.max_vreg);
        u_node.type_ = u_node.type_.meet(v_node.type_);
        u_node.spill_cost += v_node.spill_cost;
        u_node.flags |= v_node.flags & (NodeFlags::PARAM | NodeFlags::RANGE | NodeFlags::SPILL);
        self.nodes.get_mut(&v).expect("node exists").flags.remove(NodeFlags::ACTIVE);
    }

    /// Deactivates `u` during simplification, discounting its weight from
    /// all still-active neighbors.
    pub fn remove_node(&mut self, u: Reg) {
        let adjacent = self.nodes[&u].adjacent.clone();
        for v in adjacent {
            if !self.nodes[&v].is_active() {
                continue;
            }
            let w = edge_weight(&self.nodes[&v], &self.nodes[&u]);
            self.nodes.get_mut(&v).expect("node exists").weight -= w;
        }
        self.nodes.get_mut(&u).expect("node exists").flags.remove(NodeFlags::ACTIVE);
    }

    fn node_mut(&mut self, reg: Reg) -> &mut Node {
        self.nodes.entry(reg).or_default()
    }

    fn update_node_constraints(&mut self, insn: &dexopt_ir::IrInstruction, in_range_set: bool) {
        let op = insn.opcode();
        if insn.has_dest() {
            let dest = insn.dest();
            let node = self.node_mut(dest);
            if op.is_load_param() {
                node.flags |= NodeFlags::PARAM;
            }
            node.spill_cost += 1;
            let ty = dest_reg_type(insn);
            let node = self.node_mut(dest);
            node.type_ = node.type_.meet(ty);
            node.max_vreg = node.max_vreg.min(max_unsigned_value(insn.dest_bit_width()));
        }
        for i in 0..insn.srcs_size() {
            let src = insn.src(i);
            let ty = src_reg_type(insn, i);
            let max_vreg = if in_range_set {
                max_unsigned_value(16)
            } else if op.has_range_form() && insn.srcs_size() == 1 {
                // `invoke {v0}` can always be rewritten as
                // `invoke/range {v0}`.
                max_unsigned_value(16)
            } else {
                let mut cap = max_unsigned_value(insn.src_bit_width(i));
                if op.is_invoke() && ty == RegisterType::Wide {
                    // The denormalized form will need room for the high
                    // half right above this register.
                    cap -= 1;
                }
                cap
            };
            let node = self.node_mut(src);
            node.spill_cost += 1;
            node.type_ = node.type_.meet(ty);
            node.max_vreg = node.max_vreg.min(max_vreg);
            if in_range_set {
                node.flags |= NodeFlags::RANGE;
            }
        }
    }
}

fn canonical(u: Reg, v: Reg) -> (Reg, Reg) {
    if u < v {
        (u, v)
    } else {
        (v, u)
    }
}

/// Builds the interference graph for a method. `initial_regs` is the
/// register count before any spill temporaries were added; nodes at or
/// beyond it carry the SPILL flag so the spill heuristic never picks
/// them again.
pub fn build(
    cfg: &Cfg,
    liveness: &Liveness,
    range_set: &RangeSet,
    initial_regs: Reg,
) -> Graph {
    let mut graph = Graph::default();
    for (_, id) in cfg.instructions() {
        graph.update_node_constraints(cfg.arena.insn(id), range_set.contains(id));
    }

    for b in cfg.block_ids() {
        let mut live: LivenessDomain = liveness.live_out_vars_at(b).clone();
        let mut insns = cfg.block(b).items.insn_ids(&cfg.arena);
        insns.reverse();
        for id in insns {
            let insn = cfg.arena.insn(id);
            let op = insn.opcode();
            if op.has_range_form() {
                graph.range_liveness.insert(id, live.elements().copied().collect());
            }
            if insn.has_dest() {
                let dest = insn.dest();
                for &reg in live.elements() {
                    // No edge between the halves of a move so the pair
                    // stays coalescable -- except for wide moves, where a
                    // missing edge could produce a clobbering overlap like
                    // `move-wide v0, v1`.
                    if op.is_move() && !insn.is_wide() && reg == insn.src(0) {
                        continue;
                    }
                    graph.add_edge(dest, reg);
                }
            }
            liveness::analyze_instruction(insn, &mut live);
            if insn.has_dest() {
                // Every register live into the def contains it.
                let dest = insn.dest();
                for &reg in live.elements() {
                    if reg != dest {
                        graph.containment.insert((reg, dest));
                    }
                }
            }
        }

        // The lowering of a check-cast may need to insert a move in front
        // of it, so its (pseudo's) dest must not clobber anything live
        // anywhere in the cast's block.
        let live_in = liveness.live_in_vars_at(b);
        for id in cfg.block(b).items.insn_ids(&cfg.arena) {
            if cfg.arena.insn(id).opcode() == Opcode::CheckCast {
                if let Some((_, mrp)) = cfg.move_result_of(b, id) {
                    let dest = cfg.arena.insn(mrp).dest();
                    for &reg in live_in.elements() {
                        graph.add_edge(dest, reg);
                    }
                }
            }
        }
    }

    for (reg, node) in graph.nodes.iter_mut() {
        if *reg >= initial_regs {
            node.flags |= NodeFlags::SPILL;
        }
        debug_assert!(
            node.type_ != RegisterType::Conflict,
            "conflicting register type for v{}",
            reg
        );
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use dexopt_ir::item::IrCode;
    use dexopt_ir::IrInstruction;

    fn build_graph(code: IrCode) -> (Cfg, Graph) {
        let mut cfg = Cfg::build(code);
        cfg.calculate_exit_block();
        let liveness = Liveness::analyze(&cfg);
        let range_set = RangeSet::init(&cfg);
        let initial = cfg.registers_size();
        let graph = build(&cfg, &liveness, &range_set, initial);
        (cfg, graph)
    }

    #[test]
    fn test_simultaneously_live_registers_interfere() {
        let mut code = IrCode::new();
        code.push(IrInstruction::new(Opcode::Const).with_dest(0).with_literal(1));
        code.push(IrInstruction::new(Opcode::Const).with_dest(1).with_literal(2));
        code.push(IrInstruction::new(Opcode::AddInt).with_dest(2).with_srcs([0, 1]));
        code.push(IrInstruction::new(Opcode::Return).with_src(2));
        let (_cfg, graph) = build_graph(code);

        // v0 and v1 are both live at the add.
        assert!(graph.is_adjacent(0, 1));
        // v2 is born as v0 and v1 die.
        assert!(!graph.is_adjacent(0, 2));
        assert!(!graph.is_adjacent(1, 2));
    }

    #[test]
    fn test_move_pair_does_not_interfere() {
        // v1 = move v0 with both still live afterwards: the suppression
        // keeps them coalescable.
        let mut code = IrCode::new();
        code.push(IrInstruction::new(Opcode::Const).with_dest(0).with_literal(1));
        code.push(IrInstruction::new(Opcode::Move).with_dest(1).with_src(0));
        code.push(IrInstruction::new(Opcode::AddInt).with_dest(2).with_srcs([0, 1]));
        code.push(IrInstruction::new(Opcode::Return).with_src(2));
        let (_cfg, graph) = build_graph(code);
        assert!(!graph.is_adjacent(0, 1));
        // But containment is recorded, validating the coalesce.
        assert!(graph.contains(0, 1));
    }

    #[test]
    fn test_wide_weights() {
        // A wide register pins two slots; its weight against narrow
        // neighbors counts accordingly.
        let mut code = IrCode::new();
        code.push(IrInstruction::new(Opcode::ConstWide).with_dest(0).with_literal(5));
        code.push(IrInstruction::new(Opcode::Const).with_dest(2).with_literal(1));
        code.push(IrInstruction::new(Opcode::AddLong).with_dest(3).with_srcs([0, 0]));
        code.push(IrInstruction::new(Opcode::AddInt).with_dest(5).with_srcs([2, 2]));
        code.push(IrInstruction::new(Opcode::Return).with_src(5));
        let (_cfg, graph) = build_graph(code);

        assert_eq!(graph.node(0).width(), 2);
        assert_eq!(graph.node(2).width(), 1);
        assert!(graph.is_adjacent(0, 2));
        // The narrow node counts the wide neighbor as ceil(2/1) = 2.
        assert!(graph.node(2).weight() >= 2);
        // The wide node counts the narrow neighbor as ceil(1/2) = 1.
        let wide_weight_from_narrow = 1;
        assert!(graph.node(0).weight() >= wide_weight_from_narrow);
    }

    #[test]
    fn test_remove_node_discounts_weight() {
        let mut code = IrCode::new();
        code.push(IrInstruction::new(Opcode::Const).with_dest(0).with_literal(1));
        code.push(IrInstruction::new(Opcode::Const).with_dest(1).with_literal(2));
        code.push(IrInstruction::new(Opcode::AddInt).with_dest(2).with_srcs([0, 1]));
        code.push(IrInstruction::new(Opcode::Return).with_src(2));
        let mut graph = build_graph(code).1;

        let before = graph.node(1).weight();
        graph.remove_node(0);
        assert!(!graph.node(0).is_active());
        assert!(graph.node(1).weight() < before);
    }

    #[test]
    fn test_range_set_detection() {
        let m = dexopt_ir::refs::make_method_desc("LR;.f:(IIIIII)V");
        let mut code = IrCode::new();
        code.registers_size = 6;
        for i in 0..6 {
            code.push(IrInstruction::new(Opcode::Const).with_dest(i).with_literal(i as i64));
        }
        code.push(
            IrInstruction::new(Opcode::InvokeStatic)
                .with_method(m)
                .with_srcs([0, 1, 2, 3, 4, 5]),
        );
        code.push(IrInstruction::new(Opcode::ReturnVoid));
        let mut cfg = Cfg::build(code);
        cfg.calculate_exit_block();
        let range_set = RangeSet::init(&cfg);
        let (_, invoke) = cfg
            .instructions()
            .into_iter()
            .find(|(_, id)| cfg.arena.insn(*id).opcode().is_invoke())
            .unwrap();
        assert!(range_set.contains(invoke));

        let liveness = Liveness::analyze(&cfg);
        let graph = build(&cfg, &liveness, &range_set, cfg.registers_size());
        for reg in 0..6 {
            assert!(graph.node(reg).is_range());
        }
    }
}
