//! Graph-coloring register allocation
//!
//! The pipeline: renumber registers to live ranges, build the
//! interference graph from liveness, coalesce moves, then simplify/select
//! with Smith's colorability criterion. Range invokes get contiguous
//! operand blocks, parameters map onto the highest registers (where the
//! calling convention put them on entry), and whatever cannot be colored
//! is spilled -- or split around a conflicting live range when splitting
//! is enabled -- before the whole pipeline reruns. One or two
//! reiterations are the norm; the loop is bounded as a backstop.

use crate::interference::{self, Graph, RangeSet};
use crate::register_type::{gen_move, RegisterType};
use dexopt_common::PassStats;
use dexopt_ir::cfg::Cfg;
use dexopt_ir::live_range;
use dexopt_ir::liveness::Liveness;
use dexopt_ir::opcode::required_bit_width;
use dexopt_ir::{BlockId, ItemId, Opcode, Reg};
use dexopt_common::UnionFind;
use hashbrown::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub use_splitting: bool,
    /// Guard against clobbering the incoming `this` register, which some
    /// runtimes observe during stack walks.
    pub no_overwrite_this: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self { use_splitting: false, no_overwrite_this: false }
    }
}

/// The coloring produced by select: a map from symbolic register to
/// physical vreg, plus the frame size.
#[derive(Debug, Default)]
pub struct RegisterTransform {
    pub map: HashMap<Reg, Reg>,
    pub size: Reg,
}

impl RegisterTransform {
    fn assign(&mut self, reg: Reg, vreg: Reg, width: u32) {
        self.map.insert(reg, vreg);
        self.size = self.size.max(vreg + width);
    }

    fn apply(&self, cfg: &mut Cfg) {
        for (_, id) in cfg.instructions() {
            let insn = cfg.arena.insn_mut(id);
            if insn.has_dest() {
                let mapped = self.map[&insn.dest()];
                insn.set_dest(mapped);
            }
            for i in 0..insn.srcs_size() {
                let mapped = self.map[&insn.src(i)];
                insn.set_src(i, mapped);
            }
        }
        cfg.set_registers_size(self.size);
    }
}

/// Everything select decided could not be colored.
#[derive(Debug, Default)]
pub struct SpillPlan {
    /// Register -> the vreg it would have needed (beyond its cap).
    pub global_spills: HashMap<Reg, Reg>,
    /// Range instruction -> operand indices that conflict with the
    /// contiguous block.
    pub range_spills: HashMap<ItemId, Vec<usize>>,
    /// Parameters whose ABI slot exceeds their bit-width cap.
    pub param_spills: HashSet<Reg>,
}

impl SpillPlan {
    pub fn is_empty(&self) -> bool {
        self.global_spills.is_empty()
            && self.range_spills.is_empty()
            && self.param_spills.is_empty()
    }
}

/// Which registers to split around which. Populated instead of a spill
/// when live-range splitting is enabled and profitable.
#[derive(Debug, Default)]
pub struct SplitPlan {
    pub split_around: HashMap<Reg, HashSet<Reg>>,
}

/// Tracks which physical vregs are taken while one node is being
/// colored.
#[derive(Debug, Default)]
pub struct VirtualRegistersFile {
    used: Vec<bool>,
}

impl VirtualRegistersFile {
    pub fn block(&mut self, vreg: Reg, width: u32) {
        let end = (vreg + width) as usize;
        if self.used.len() < end {
            self.used.resize(end, false);
        }
        for slot in vreg as usize..end {
            self.used[slot] = true;
        }
    }

    pub fn is_free(&self, vreg: Reg, width: u32) -> bool {
        (vreg..vreg + width).all(|slot| {
            self.used.get(slot as usize).copied() != Some(true)
        })
    }

    /// The lowest run of `width` free vregs.
    pub fn alloc(&mut self, width: u32) -> Reg {
        let mut vreg = 0;
        while !self.is_free(vreg, width) {
            vreg += 1;
        }
        self.block(vreg, width);
        vreg
    }

    pub fn alloc_at(&mut self, vreg: Reg, width: u32) {
        self.block(vreg, width);
    }
}

pub struct Allocator {
    config: AllocatorConfig,
    stats: PassStats,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new(AllocatorConfig::default())
    }
}

impl Allocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self { config, stats: PassStats::new() }
    }

    pub fn stats(&self) -> &PassStats {
        &self.stats
    }

    /// Runs the full allocation pipeline to a fixed point. `is_static`
    /// gates the `this`-pinning of [`AllocatorConfig::no_overwrite_this`],
    /// which only makes sense when there is a receiver.
    pub fn allocate(&mut self, cfg: &mut Cfg, is_static: bool) -> PassStats {
        if self.config.no_overwrite_this && !is_static {
            self.pin_this_register(cfg);
        }
        live_range::renumber_registers(cfg, true);
        // Registers introduced from here on are spill/split temporaries;
        // the SPILL flag steers the heuristics away from them.
        let initial_regs = cfg.registers_size();
        // Far above any observed reiteration count; purely a backstop.
        const MAX_ITERATIONS: usize = 16;
        for iteration in 0..MAX_ITERATIONS {
            cfg.calculate_exit_block();
            let range_set = RangeSet::init(cfg);
            let liveness = Liveness::analyze(cfg);
            let mut ig = interference::build(cfg, &liveness, &range_set, initial_regs);

            self.coalesce(&mut ig, cfg);

            let (select_stack, spill_stack) = self.simplify(&mut ig);
            let mut reg_transform = RegisterTransform::default();
            let mut spill_plan = SpillPlan::default();
            self.select(&ig, select_stack, &mut reg_transform, &mut spill_plan);
            self.select(&ig, spill_stack, &mut reg_transform, &mut spill_plan);
            self.select_ranges(cfg, &ig, &range_set, &mut reg_transform, &mut spill_plan);
            self.select_params(cfg, &ig, &mut reg_transform, &mut spill_plan);

            if spill_plan.is_empty() {
                reg_transform.apply(cfg);
                log::debug!(
                    "allocation converged after {} iteration(s), {} registers",
                    iteration + 1,
                    cfg.registers_size()
                );
                return self.stats.clone();
            }

            if self.config.use_splitting {
                let split_plan = self.find_split(cfg, &ig, &liveness, &mut spill_plan);
                if !split_plan.split_around.is_empty() {
                    self.split(cfg, &ig, &split_plan, &liveness);
                    self.stats.reiteration_count += 1;
                    continue;
                }
            }
            self.spill(cfg, &ig, &spill_plan, &range_set);
            self.stats.reiteration_count += 1;
        }
        panic!("register allocation failed to converge:\n{}", cfg);
    }

    /// Copies the incoming `this` into a fresh register right after its
    /// load-param and rewrites every other reference to the copy. The
    /// receiver's register then has no def besides the load-param, so it
    /// stays untouched in its ABI slot for the whole method. Runs before
    /// renumbering; the copy survives coalescing because its source is a
    /// parameter node.
    fn pin_this_register(&mut self, cfg: &mut Cfg) {
        let Some(&load_param) = cfg.param_insns().first() else {
            return;
        };
        let this_reg = cfg.arena.insn(load_param).dest();
        let temp = cfg.allocate_temp();
        for (_, id) in cfg.instructions() {
            if id == load_param {
                continue;
            }
            let insn = cfg.arena.insn_mut(id);
            if insn.has_dest() && insn.dest() == this_reg {
                insn.set_dest(temp);
            }
            for i in 0..insn.srcs_size() {
                if insn.src(i) == this_reg {
                    insn.set_src(i, temp);
                }
            }
        }
        let Some((block, _)) = cfg.instructions().into_iter().find(|(_, id)| *id == load_param)
        else {
            return;
        };
        cfg.insert_after(
            block,
            load_param,
            vec![gen_move(RegisterType::Object, temp, this_reg)],
        );
        self.stats.param_spill_moves += 1;
    }

    /// Coalesces non-wide moves whose endpoints don't interfere and whose
    /// live ranges nest. Mutates both the graph and the code.
    pub fn coalesce(&mut self, ig: &mut Graph, cfg: &mut Cfg) {
        let mut aliases: UnionFind<Reg> = UnionFind::new();
        let mut to_delete: Vec<(BlockId, ItemId)> = Vec::new();

        for (b, id) in cfg.instructions() {
            let insn = cfg.arena.insn(id);
            if !insn.opcode().is_move() || insn.opcode() == Opcode::MoveWide {
                continue;
            }
            let dest = aliases.find(&insn.dest());
            let src = aliases.find(&insn.src(0));
            if dest == src {
                to_delete.push((b, id));
                continue;
            }
            if ig.is_adjacent(dest, src) {
                continue;
            }
            // Never merge the moves that the allocator itself inserted
            // for parameters, ranges and spills; coalescing them away
            // would just re-create the conflict next iteration.
            let special = |r: Reg| {
                let n = ig.node(r);
                n.is_param() || n.is_range() || n.is_spilt()
            };
            if special(dest) || special(src) {
                continue;
            }
            if ig.node(dest).reg_type().meet(ig.node(src).reg_type()) == RegisterType::Conflict {
                continue;
            }
            if !(ig.contains(dest, src) || ig.contains(src, dest)) {
                continue;
            }
            aliases.union(&dest, &src);
            let root = aliases.find(&dest);
            let other = if root == dest { src } else { dest };
            ig.combine(root, other);
            to_delete.push((b, id));
            self.stats.moves_coalesced += 1;
        }

        for (b, id) in to_delete {
            cfg.remove_insn(b, id);
        }
        for (_, id) in cfg.instructions() {
            let insn = cfg.arena.insn_mut(id);
            if insn.has_dest() {
                let rep = aliases.find(&insn.dest());
                insn.set_dest(rep);
            }
            for i in 0..insn.srcs_size() {
                let rep = aliases.find(&insn.src(i));
                insn.set_src(i, rep);
            }
        }
    }

    /// Peels definitely-colorable nodes onto the select stack; when only
    /// risky nodes remain, the cheapest spill candidate goes onto the
    /// spill stack and the peeling continues optimistically.
    pub fn simplify(&mut self, ig: &mut Graph) -> (Vec<Reg>, Vec<Reg>) {
        let mut select_stack = Vec::new();
        let mut spill_stack = Vec::new();
        loop {
            let mut progressed = true;
            while progressed {
                progressed = false;
                let mut colorable: Vec<Reg> = ig
                    .nodes()
                    .filter(|(_, n)| n.is_active() && !n.is_param() && n.definitely_colorable())
                    .map(|(r, _)| r)
                    .collect();
                // Process in register order so the iteration is canonical.
                colorable.sort_unstable();
                for reg in colorable {
                    ig.remove_node(reg);
                    select_stack.push(reg);
                    progressed = true;
                }
            }
            // Everyone left is risky; push the candidate with the best
            // spill-cost-to-weight ratio and keep going.
            let candidate = ig
                .nodes()
                .filter(|(_, n)| n.is_active() && !n.is_param())
                .min_by_key(|(r, n)| {
                    // Avoid re-spilling spill temporaries.
                    let penalty = if n.is_spilt() { 1_000_000 } else { 0 };
                    (penalty + spill_ratio(n), *r)
                })
                .map(|(r, _)| r);
            match candidate {
                None => return (select_stack, spill_stack),
                Some(reg) => {
                    ig.remove_node(reg);
                    spill_stack.push(reg);
                }
            }
        }
    }

    /// Pops the stack in reverse, giving each node the lowest run of
    /// vregs that fits under its cap and clear of its colored neighbors.
    pub fn select(
        &mut self,
        ig: &Graph,
        stack: Vec<Reg>,
        reg_transform: &mut RegisterTransform,
        spill_plan: &mut SpillPlan,
    ) {
        for reg in stack.into_iter().rev() {
            let node = ig.node(reg);
            if node.is_range() {
                // Operands of range instructions are placed as contiguous
                // blocks by select_ranges.
                continue;
            }
            let width = node.width();
            let mut vreg_file = VirtualRegistersFile::default();
            for &adj in node.adjacent() {
                if let Some(&assigned) = reg_transform.map.get(&adj) {
                    vreg_file.block(assigned, ig.node(adj).width());
                }
            }
            let vreg = vreg_file.alloc(width);
            if vreg + width - 1 > node.max_vreg() {
                spill_plan.global_spills.insert(reg, vreg);
            } else {
                reg_transform.assign(reg, vreg, width);
            }
        }
    }

    /// Range instructions need their operands in consecutive vregs.
    /// Operands that already got a conflicting color are recorded as
    /// range spills.
    pub fn select_ranges(
        &mut self,
        cfg: &Cfg,
        ig: &Graph,
        range_set: &RangeSet,
        reg_transform: &mut RegisterTransform,
        spill_plan: &mut SpillPlan,
    ) {
        for insn_item in range_set.iter() {
            let insn = cfg.arena.insn(insn_item);
            let mut vreg_file = VirtualRegistersFile::default();
            for &live in ig.range_liveness(insn_item) {
                if let Some(&assigned) = reg_transform.map.get(&live) {
                    vreg_file.block(assigned, ig.node(live).width());
                }
            }
            let total_width: u32 =
                (0..insn.srcs_size()).map(|i| ig.node(insn.src(i)).width()).sum();
            let base = vreg_file.alloc(total_width);

            let mut offset = 0;
            for i in 0..insn.srcs_size() {
                let src = insn.src(i);
                let desired = base + offset;
                offset += ig.node(src).width();
                let width = ig.node(src).width();
                match reg_transform.map.get(&src) {
                    Some(&assigned) if assigned != desired => {
                        spill_plan.range_spills.entry(insn_item).or_default().push(i);
                    }
                    Some(_) => {}
                    None if desired + width - 1 > ig.node(src).max_vreg() => {
                        spill_plan.range_spills.entry(insn_item).or_default().push(i);
                    }
                    None => {
                        reg_transform.assign(src, desired, width);
                    }
                }
            }
        }
    }

    /// Parameters go in the highest registers, right where the calling
    /// convention delivered them. A parameter whose uses cap it below its
    /// ABI slot has to be copied down instead.
    pub fn select_params(
        &mut self,
        cfg: &Cfg,
        ig: &Graph,
        reg_transform: &mut RegisterTransform,
        spill_plan: &mut SpillPlan,
    ) {
        let params = cfg.param_insns();
        let total_width: u32 = params
            .iter()
            .map(|item| ig.node(cfg.arena.insn(*item).dest()).width())
            .sum();
        let base = reg_transform.size;
        let mut offset = 0;
        for item in params {
            let reg = cfg.arena.insn(item).dest();
            let node = ig.node(reg);
            let width = node.width();
            let desired = base + offset;
            offset += width;
            match reg_transform.map.get(&reg) {
                Some(&assigned) if assigned != desired => {
                    // A range invoke already pinned this parameter
                    // elsewhere; copy it down.
                    spill_plan.param_spills.insert(reg);
                    self.stats.params_spill_early += 1;
                }
                Some(_) => {}
                None => {
                    if desired + width - 1 > node.max_vreg() {
                        spill_plan.param_spills.insert(reg);
                        self.stats.params_spill_early += 1;
                    } else {
                        reg_transform.assign(reg, desired, width);
                    }
                }
            }
        }
        reg_transform.size = reg_transform.size.max(base + total_width);
    }

    /// Materializes the spill plan as moves: loads before uses that can't
    /// address the spilled register, stores after defs, copies around
    /// range invokes, and live-range splits of parameters right after
    /// their load-param.
    pub fn spill(
        &mut self,
        cfg: &mut Cfg,
        ig: &Graph,
        spill_plan: &SpillPlan,
        range_set: &RangeSet,
    ) {
        // Global spills: the register lives in a high slot; narrow
        // instructions get a temp next to them.
        for (&reg, &planned) in &spill_plan.global_spills {
            let ty = ig.node(reg).reg_type();
            let wide = ty == RegisterType::Wide;
            for (b, id) in cfg.instructions() {
                if !cfg.contains_block(b) {
                    continue;
                }
                let insn = cfg.arena.insn(id).clone();
                if range_set.contains(id) {
                    continue;
                }
                if insn.has_dest() && insn.dest() == reg {
                    if required_bit_width(planned) > insn.dest_bit_width() {
                        let temp = new_temp(cfg, wide);
                        cfg.arena.insn_mut(id).set_dest(temp);
                        cfg.insert_after(b, id, vec![gen_move(ty, reg, temp)]);
                        self.stats.global_spill_moves += 1;
                    }
                }
                for i in 0..insn.srcs_size() {
                    if insn.src(i) == reg
                        && required_bit_width(planned) > insn.src_bit_width(i)
                    {
                        let temp = new_temp(cfg, wide);
                        cfg.insert_before(b, id, vec![gen_move(ty, temp, reg)]);
                        cfg.arena.insn_mut(id).set_src(i, temp);
                        self.stats.global_spill_moves += 1;
                        break;
                    }
                }
            }
        }

        // Range spills: copy the conflicting operand just before the
        // invoke so the contiguous block can be formed from fresh regs.
        for (&insn_item, operands) in &spill_plan.range_spills {
            let Some((b, _)) = cfg.instructions().into_iter().find(|(_, id)| *id == insn_item)
            else {
                continue;
            };
            for &i in operands {
                let src = cfg.arena.insn(insn_item).src(i);
                let ty = ig.node(src).reg_type();
                let temp = new_temp(cfg, ty == RegisterType::Wide);
                cfg.insert_before(b, insn_item, vec![gen_move(ty, temp, src)]);
                cfg.arena.insn_mut(insn_item).set_src(i, temp);
                self.stats.range_spill_moves += 1;
            }
        }

        // Parameter spills: split the live range right after the
        // load-param so the parameter itself stays in its ABI slot.
        for &reg in &spill_plan.param_spills {
            let Some((b, load_param)) = cfg
                .instructions()
                .into_iter()
                .find(|(_, id)| {
                    let insn = cfg.arena.insn(*id);
                    insn.opcode().is_load_param() && insn.dest() == reg
                })
            else {
                continue;
            };
            let ty = ig.node(reg).reg_type();
            let temp = new_temp(cfg, ty == RegisterType::Wide);
            // Rewrite every later reference, then insert the copy.
            for (_, id) in cfg.instructions() {
                if id == load_param {
                    continue;
                }
                let insn = cfg.arena.insn_mut(id);
                if insn.has_dest() && insn.dest() == reg {
                    insn.set_dest(temp);
                }
                for i in 0..insn.srcs_size() {
                    if insn.src(i) == reg {
                        insn.set_src(i, temp);
                    }
                }
            }
            cfg.insert_after(b, load_param, vec![gen_move(ty, temp, reg)]);
            self.stats.param_spill_moves += 1;
        }
    }

    /// Looks for a cheaper alternative to spilling: a neighbor `b` of a
    /// spill candidate `a` whose entire live range sits inside one block,
    /// so that copying `a` aside across that range removes the
    /// interference.
    pub fn find_split(
        &mut self,
        cfg: &Cfg,
        ig: &Graph,
        liveness: &Liveness,
        spill_plan: &mut SpillPlan,
    ) -> SplitPlan {
        let mut plan = SplitPlan::default();
        let candidates: Vec<Reg> = spill_plan.global_spills.keys().copied().collect();
        for a in candidates {
            let Some(blocker) = ig
                .node(a)
                .adjacent()
                .iter()
                .copied()
                .find(|&b| {
                    !ig.node(b).is_param()
                        && ig.node(b).width() == 1
                        && single_block_range(cfg, liveness, b).is_some()
                })
            else {
                continue;
            };
            plan.split_around.entry(a).or_default().insert(blocker);
            spill_plan.global_spills.remove(&a);
        }
        plan
    }

    /// Copies each split register aside for the duration of the blocking
    /// range: `a' = a` before the range, `a = a'` after it, with uses of
    /// `a` inside the range rewritten to `a'`.
    pub fn split(&mut self, cfg: &mut Cfg, ig: &Graph, plan: &SplitPlan, liveness: &Liveness) {
        for (&a, blockers) in &plan.split_around {
            for &blocker in blockers {
                let Some((block, first, last)) = single_block_range(cfg, liveness, blocker)
                else {
                    continue;
                };
                let ty = ig.node(a).reg_type();
                let temp = new_temp(cfg, ty == RegisterType::Wide);
                // Rewrite uses of `a` strictly inside the span.
                let span = cfg.block(block).items.insn_ids(&cfg.arena);
                let mut inside = false;
                for id in &span {
                    if *id == first {
                        inside = true;
                        continue;
                    }
                    if *id == last {
                        break;
                    }
                    if inside {
                        let insn = cfg.arena.insn_mut(*id);
                        for i in 0..insn.srcs_size() {
                            if insn.src(i) == a {
                                insn.set_src(i, temp);
                            }
                        }
                    }
                }
                cfg.insert_before(block, first, vec![gen_move(ty, temp, a)]);
                cfg.insert_after(block, last, vec![gen_move(ty, a, temp)]);
                self.stats.split_moves += 2;
            }
        }
    }
}

fn spill_ratio(node: &interference::Node) -> u32 {
    // Low cost and high weight make the best spill candidate.
    if node.weight() == 0 {
        u32::MAX
    } else {
        node.spill_cost().saturating_mul(16) / node.weight()
    }
}

fn new_temp(cfg: &mut Cfg, wide: bool) -> Reg {
    if wide {
        cfg.allocate_wide_temp()
    } else {
        cfg.allocate_temp()
    }
}

/// The span of a register's defs and uses when they all fall in one
/// block: (block, first def item, last reference item).
fn single_block_range(cfg: &Cfg, liveness: &Liveness, reg: Reg) -> Option<(BlockId, ItemId, ItemId)> {
    let mut found: Option<(BlockId, ItemId, ItemId)> = None;
    for b in cfg.block_ids() {
        // Live across a block boundary means not a single-block range.
        if liveness.live_in_vars_at(b).contains(&reg)
            || liveness.live_out_vars_at(b).contains(&reg)
        {
            return None;
        }
        for id in cfg.block(b).items.insn_ids(&cfg.arena) {
            let insn = cfg.arena.insn(id);
            let references = (insn.has_dest() && insn.dest() == reg)
                || insn.srcs().contains(&reg);
            if !references {
                continue;
            }
            match &mut found {
                None => found = Some((b, id, id)),
                Some((block, _, last)) => {
                    if *block != b {
                        return None;
                    }
                    *last = id;
                }
            }
        }
    }
    found
}
