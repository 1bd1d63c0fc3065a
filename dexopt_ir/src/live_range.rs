//! Live-range renumbering
//!
//! Renumbers registers so that each register names one live range: the
//! union of use-def chains that share defs. See Muchnick, Advanced
//! Compiler Design & Implementation, section 16.3.3. Every use's reaching
//! defs get union-found into one equivalence class, each class gets a
//! fresh register, and the method's register count becomes the class
//! count (wide defs take two slots in width-aware mode).

use crate::cfg::Cfg;
use crate::item::ItemId;
use crate::reaching::{self, ReachingDefinitions};
use crate::Reg;
use dexopt_common::UnionFind;
use hashbrown::HashMap;

/// A use site: the instruction item and the register it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Use {
    insn: ItemId,
    reg: Reg,
}

/// Allocates one symbolic register per disjoint set of defs.
struct SymRegMapper {
    width_aware: bool,
    next_symreg: Reg,
    def_to_reg: HashMap<ItemId, Reg>,
}

impl SymRegMapper {
    fn new(width_aware: bool) -> Self {
        Self { width_aware, next_symreg: 0, def_to_reg: HashMap::new() }
    }

    fn make(&mut self, def: ItemId, wide: bool) -> Reg {
        *self.def_to_reg.entry(def).or_insert_with(|| {
            let reg = self.next_symreg;
            self.next_symreg += if self.width_aware && wide { 2 } else { 1 };
            reg
        })
    }

    fn at(&self, def: ItemId) -> Reg {
        self.def_to_reg[&def]
    }

    fn regs_size(&self) -> Reg {
        self.next_symreg
    }
}

/// Computes the use-def chains of every register use in the graph.
fn calculate_ud_chains(cfg: &Cfg) -> HashMap<Use, Vec<ItemId>> {
    let reaching = ReachingDefinitions::analyze(cfg);
    let mut chains = HashMap::new();
    for b in cfg.block_ids() {
        let mut env = reaching.entry_state_at(b);
        for id in cfg.block(b).items.insn_ids(&cfg.arena) {
            let insn = cfg.arena.insn(id);
            for &src in insn.srcs() {
                let defs = env.get(src);
                let elements = defs.elements();
                assert!(
                    !elements.is_empty() && defs.is_value(),
                    "found use of v{} without a def at {}",
                    src,
                    insn
                );
                chains.insert(Use { insn: id, reg: src }, elements);
            }
            reaching::analyze_instruction(id, insn, &mut env);
        }
    }
    chains
}

/// Renumbers the CFG's registers to live ranges and resets its register
/// count. In width-aware mode each wide range takes a register pair;
/// callers headed to the register allocator want that.
pub fn renumber_registers(cfg: &mut Cfg, width_aware: bool) {
    let chains = calculate_ud_chains(cfg);

    let mut def_sets: UnionFind<ItemId> = UnionFind::new();
    for (_, id) in cfg.instructions() {
        if cfg.arena.insn(id).has_dest() {
            def_sets.make_set(id);
        }
    }
    // Defs that share any use belong to one live range.
    for defs in chains.values() {
        let mut it = defs.iter();
        if let Some(first) = it.next() {
            for def in it {
                def_sets.union(first, def);
            }
        }
    }

    let mut mapper = SymRegMapper::new(width_aware);
    for (_, id) in cfg.instructions() {
        if cfg.arena.insn(id).has_dest() {
            let wide = cfg.arena.insn(id).dest_is_wide();
            let rep = def_sets.find(&id);
            let sym = mapper.make(rep, wide);
            cfg.arena.insn_mut(id).set_dest(sym);
        }
    }
    for (_, id) in cfg.instructions() {
        let srcs: Vec<Reg> = cfg.arena.insn(id).srcs().to_vec();
        for (i, src) in srcs.into_iter().enumerate() {
            let defs = &chains[&Use { insn: id, reg: src }];
            let rep = def_sets.find(&defs[0]);
            cfg.arena.insn_mut(id).set_src(i, mapper.at(rep));
        }
    }
    cfg.set_registers_size(mapper.regs_size());
}
