//! The editable control-flow graph
//!
//! Construction scans the linear item stream once and splits it into
//! maximal blocks, connects them with typed edges (goto, branch, throw,
//! ghost), lowers try regions into per-instruction throw edges, and then
//! erases every marker that the edges now encode: targets, try markers,
//! catch entries and goto instructions all disappear in editable form.
//! [`linearize`](Cfg::linearize) reverses the whole process.
//!
//! Outside a transformation's critical section the graph maintains the
//! structural invariants checked by [`Cfg::sanity_check`]; malformed input
//! or a buggy transformation aborts with a diagnostic that includes a full
//! dump of the graph.

mod linearize;
mod mutation;

pub use mutation::CfgMutation;

use crate::instruction::IrInstruction;
use crate::item::{IrCode, IrList, ItemArena, ItemId, ItemKind, Position};
use crate::opcode::{Branchingness, Opcode};
use crate::refs::TypeId;
use crate::Reg;
use dexopt_analysis::GraphInterface;
use hashbrown::{HashMap, HashSet};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub u32);

/// The control-transfer semantics of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Unconditional transfer or fall-through. At most one per block.
    Goto,
    /// The taken arm of a conditional, or one arm of a switch (which then
    /// carries its case key).
    Branch { case_key: Option<i32> },
    /// From a may-throw instruction to a catch handler. Handlers are
    /// consulted in `index` order; a None catch type is the catch-all and
    /// must come last.
    Throw { catch_type: Option<TypeId>, index: u32 },
    /// Connects every real exit to the synthetic exit block.
    Ghost,
}

/// Edge kinds without payloads, for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    Goto,
    Branch,
    Throw,
    Ghost,
}

impl EdgeKind {
    pub fn edge_type(&self) -> EdgeType {
        match self {
            EdgeKind::Goto => EdgeType::Goto,
            EdgeKind::Branch { .. } => EdgeType::Branch,
            EdgeKind::Throw { .. } => EdgeType::Throw,
            EdgeKind::Ghost => EdgeType::Ghost,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub src: BlockId,
    pub tgt: BlockId,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone)]
pub struct Block {
    id: BlockId,
    pub items: IrList,
    preds: Vec<EdgeId>,
    succs: Vec<EdgeId>,
}

impl Block {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn preds(&self) -> &[EdgeId] {
        &self.preds
    }

    pub fn succs(&self) -> &[EdgeId] {
        &self.succs
    }
}

#[derive(Debug, Clone)]
pub struct Cfg {
    pub arena: ItemArena,
    blocks: BTreeMap<BlockId, Block>,
    edges: Vec<Option<Edge>>,
    entry: BlockId,
    exit: Option<BlockId>,
    registers_size: u32,
}

impl Cfg {
    /// Builds the editable CFG from a linear method body.
    pub fn build(code: IrCode) -> Cfg {
        assert!(!code.list.is_empty(), "method body contains no items");
        let IrCode { registers_size, arena, list } = code;
        let mut cfg = Cfg {
            arena,
            blocks: BTreeMap::new(),
            edges: Vec::new(),
            entry: BlockId(0),
            exit: None,
            registers_size,
        };

        let boundaries = cfg.find_block_boundaries(list);
        cfg.connect_blocks(&boundaries);
        cfg.add_catch_edges(&boundaries);
        cfg.remove_try_catch_markers();
        // The register count passed in from upstream is often stale;
        // recompute from the instructions we actually hold.
        cfg.recompute_registers_size();
        log::trace!("before simplify:\n{}", cfg);
        cfg.simplify();
        log::trace!("after simplify:\n{}", cfg);
        cfg
    }

    pub fn entry_block(&self) -> BlockId {
        self.entry
    }

    pub fn exit_block(&self) -> Option<BlockId> {
        self.exit
    }

    pub fn registers_size(&self) -> u32 {
        self.registers_size
    }

    pub fn set_registers_size(&mut self, size: u32) {
        self.registers_size = size;
    }

    /// Reserves a fresh (narrow) temp register.
    pub fn allocate_temp(&mut self) -> Reg {
        let reg = self.registers_size;
        self.registers_size += 1;
        reg
    }

    /// Reserves a fresh wide temp register pair, returning the low half.
    pub fn allocate_wide_temp(&mut self) -> Reg {
        let reg = self.registers_size;
        self.registers_size += 2;
        reg
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.keys().copied().collect()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn contains_block(&self, b: BlockId) -> bool {
        self.blocks.contains_key(&b)
    }

    pub fn block(&self, b: BlockId) -> &Block {
        self.blocks.get(&b).unwrap_or_else(|| panic!("no block {}", b))
    }

    fn block_mut(&mut self, b: BlockId) -> &mut Block {
        self.blocks.get_mut(&b).unwrap_or_else(|| panic!("no block {}", b))
    }

    /// Like [`Self::block_mut`], but also returns a disjoint mutable
    /// borrow of the item arena so both can be used in the same call.
    fn block_mut_arena(&mut self, b: BlockId) -> (&mut Block, &mut ItemArena) {
        let block = self.blocks.get_mut(&b).unwrap_or_else(|| panic!("no block {}", b));
        (block, &mut self.arena)
    }

    pub fn edge(&self, e: EdgeId) -> &Edge {
        self.edges[e.0 as usize].as_ref().expect("use of deleted edge")
    }

    fn next_block_id(&self) -> BlockId {
        // One past the largest id ever used; deleted ids are not reused.
        match self.blocks.keys().next_back() {
            None => BlockId(0),
            Some(last) => BlockId(last.0 + 1),
        }
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = self.next_block_id();
        self.blocks.insert(
            id,
            Block { id, items: IrList::new(), preds: Vec::new(), succs: Vec::new() },
        );
        id
    }

    // -------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------

    fn find_block_boundaries(&mut self, mut list: IrList) -> Boundaries {
        let mut boundaries = Boundaries::default();
        let ids = list.ids(&self.arena);
        assert!(!ids.is_empty());

        let mut block = self.create_block();
        self.entry = block;
        let mut block_begin = ids[0];
        let mut in_try = false;
        let mut current_position: Option<ItemId> = None;
        let mut last_pos_before_this_block: Option<ItemId> = None;

        for (idx, &id) in ids.iter().enumerate() {
            match self.arena.kind(id) {
                ItemKind::TryStart(_) => {
                    // Try regions start only at block boundaries.
                    assert!(id == block_begin, "TRY_START not at the head of a block");
                    in_try = true;
                }
                ItemKind::TryEnd(_) => {
                    boundaries.try_ends.push((id, block));
                    in_try = false;
                }
                ItemKind::Catch(_) => {
                    boundaries.catch_blocks.insert(id, block);
                }
                ItemKind::Target(target) => {
                    boundaries
                        .branch_targets
                        .entry(target.src)
                        .or_default()
                        .push((block, id, target.case_key));
                }
                ItemKind::Position(_) => {
                    current_position = Some(id);
                }
                _ => {}
            }

            let next = ids.get(idx + 1).copied();
            if !self.end_of_block(id, next, in_try) {
                continue;
            }

            // Close the current block: steal its items from the stream.
            let stolen = list.steal_range(&mut self.arena, block_begin, id);
            self.block_mut(block).items = stolen;
            if let Some(pos) = last_pos_before_this_block {
                self.duplicate_position_into(block, pos);
            }

            let Some(next_id) = next else { break };
            block = self.create_block();
            last_pos_before_this_block = current_position;
            block_begin = next_id;
        }
        boundaries
    }

    fn end_of_block(&self, id: ItemId, next: Option<ItemId>, in_try: bool) -> bool {
        let Some(next_id) = next else { return true };

        let kind = self.arena.kind(id);
        let next_kind = self.arena.kind(next_id);
        // End before the first target in a contiguous run of targets, and
        // likewise for catch entries.
        if matches!(next_kind, ItemKind::Target(_)) && !matches!(kind, ItemKind::Target(_)) {
            return true;
        }
        if matches!(next_kind, ItemKind::Catch(_)) && !matches!(kind, ItemKind::Catch(_)) {
            return true;
        }
        // End before a TRY_START and after a TRY_END.
        if matches!(next_kind, ItemKind::TryStart(_)) || matches!(kind, ItemKind::TryEnd(_)) {
            return true;
        }
        match kind {
            ItemKind::Insn(insn) => {
                let op = insn.opcode();
                (in_try && op.may_throw())
                    || op.is_branch()
                    || op.is_return()
                    || op == Opcode::Throw
            }
            _ => false,
        }
    }

    /// Positions apply to every instruction until the next position, so a
    /// block that was split off mid-stream re-asserts the position that
    /// was active when it began. Duplicates are swept at linearize time.
    fn duplicate_position_into(&mut self, b: BlockId, pos_item: ItemId) {
        let Some(first_insn) = self.insn_before_position(b) else {
            return;
        };
        let ItemKind::Position(pos) = self.arena.kind(pos_item) else {
            panic!("{} is not a position", pos_item);
        };
        let copy = ItemKind::Position(Position { ..*pos });
        let block = self.blocks.get_mut(&b).expect("block exists");
        block.items.insert_before(&mut self.arena, first_insn, copy);
    }

    /// The first instruction (except move-results and gotos) if it occurs
    /// before the first position of the block.
    fn insn_before_position(&self, b: BlockId) -> Option<ItemId> {
        let block = self.block(b);
        let mut cur = block.items.head();
        while let Some(id) = cur {
            match self.arena.kind(id) {
                ItemKind::Insn(insn) => {
                    let op = insn.opcode();
                    if !op.is_move_result() && !op.is_move_result_pseudo() && !op.is_goto() {
                        return Some(id);
                    }
                }
                ItemKind::Position(_) => return None,
                _ => {}
            }
            cur = self.arena.next(id);
        }
        None
    }

    fn connect_blocks(&mut self, boundaries: &Boundaries) {
        let ids = self.block_ids();
        for (idx, &b) in ids.iter().enumerate() {
            let mut fallthrough = true;
            let last = self.block(b).items.tail();
            if let Some(last_id) = last {
                if let ItemKind::Insn(insn) = self.arena.kind(last_id) {
                    let op = insn.opcode();
                    if op.is_branch() {
                        fallthrough = !op.is_goto();
                        let targets =
                            boundaries.branch_targets.get(&last_id).cloned().unwrap_or_default();
                        assert!(
                            !targets.is_empty(),
                            "branch {} has no targets",
                            self.arena.insn(last_id)
                        );
                        for (target_block, target_item, case_key) in targets {
                            let kind = if op.is_goto() {
                                EdgeKind::Goto
                            } else {
                                EdgeKind::Branch { case_key }
                            };
                            self.add_edge(b, target_block, kind);
                            // The branch information now lives on the
                            // edge; drop the marker.
                            {
                                let (block, arena) = self.block_mut_arena(target_block);
                                block.items.erase(arena, target_item);
                            }
                        }
                        if op.is_goto() {
                            // Gotos are fully encoded by their edge.
                            {
                                let (block, arena) = self.block_mut_arena(b);
                                block.items.erase(arena, last_id);
                            }
                        }
                    } else if op.is_return() || op == Opcode::Throw {
                        fallthrough = false;
                    }
                }
            }
            if fallthrough {
                if let Some(&next) = ids.get(idx + 1) {
                    log::trace!("adding fallthrough goto {} -> {}", b, next);
                    self.add_edge(b, next, EdgeKind::Goto);
                }
            }
        }
    }

    /// Every block inside a try region that may throw gets one throw edge
    /// per catch handler. Try regions consist of consecutively numbered
    /// blocks by construction, so we walk block ids backwards from the
    /// try-end until we see the matching try-start.
    fn add_catch_edges(&mut self, boundaries: &Boundaries) {
        for &(try_end, try_end_block) in &boundaries.try_ends {
            let ItemKind::TryEnd(marker) = self.arena.kind(try_end) else {
                panic!("{} is not a TRY_END", try_end);
            };
            let marker = *marker;
            let mut bid = try_end_block;
            loop {
                if self.ends_with_may_throw(bid) {
                    let mut catch = Some(marker.catch_start);
                    let mut index = 0;
                    while let Some(catch_item) = catch {
                        let ItemKind::Catch(entry) = self.arena.kind(catch_item) else {
                            panic!("{} is not a catch entry", catch_item);
                        };
                        let entry = *entry;
                        let handler = *boundaries
                            .catch_blocks
                            .get(&catch_item)
                            .expect("catch entry has a containing block");
                        self.add_edge(
                            bid,
                            handler,
                            EdgeKind::Throw { catch_type: entry.catch_type, index },
                        );
                        index += 1;
                        catch = entry.next;
                    }
                }
                if let Some(head) = self.block(bid).items.head() {
                    if let ItemKind::TryStart(start) = self.arena.kind(head) {
                        assert!(
                            start.catch_start == marker.catch_start,
                            "mismatched try region in {}",
                            self
                        );
                        break;
                    }
                }
                assert!(bid.0 > 0, "no beginning of try region found");
                bid = BlockId(bid.0 - 1);
            }
        }
    }

    fn ends_with_may_throw(&self, b: BlockId) -> bool {
        self.block(b)
            .items
            .last_insn(&self.arena)
            .map(|id| self.arena.insn(id).opcode().can_throw())
            .unwrap_or(false)
    }

    fn remove_try_catch_markers(&mut self) {
        let ids = self.block_ids();
        for b in ids {
            let items = self.block(b).items.ids(&self.arena);
            for id in items {
                if matches!(
                    self.arena.kind(id),
                    ItemKind::TryStart(_) | ItemKind::TryEnd(_) | ItemKind::Catch(_)
                ) {
                    {
                        let (block, arena) = self.block_mut_arena(b);
                        block.items.erase(arena, id);
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Edges
    // -------------------------------------------------------------------

    pub fn add_edge(&mut self, src: BlockId, tgt: BlockId, kind: EdgeKind) -> EdgeId {
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Some(Edge { src, tgt, kind }));
        self.block_mut(src).succs.push(id);
        self.block_mut(tgt).preds.push(id);
        id
    }

    pub fn succs(&self, b: BlockId) -> Vec<EdgeId> {
        self.block(b).succs.clone()
    }

    pub fn preds(&self, b: BlockId) -> Vec<EdgeId> {
        self.block(b).preds.clone()
    }

    pub fn succ_edge_of_type(&self, b: BlockId, ty: EdgeType) -> Option<EdgeId> {
        self.block(b)
            .succs
            .iter()
            .copied()
            .find(|e| self.edge(*e).kind.edge_type() == ty)
    }

    pub fn pred_edge_of_type(&self, b: BlockId, ty: EdgeType) -> Option<EdgeId> {
        self.block(b)
            .preds
            .iter()
            .copied()
            .find(|e| self.edge(*e).kind.edge_type() == ty)
    }

    pub fn succ_edges_of_type(&self, b: BlockId, ty: EdgeType) -> Vec<EdgeId> {
        self.block(b)
            .succs
            .iter()
            .copied()
            .filter(|e| self.edge(*e).kind.edge_type() == ty)
            .collect()
    }

    pub fn pred_edges_of_type(&self, b: BlockId, ty: EdgeType) -> Vec<EdgeId> {
        self.block(b)
            .preds
            .iter()
            .copied()
            .filter(|e| self.edge(*e).kind.edge_type() == ty)
            .collect()
    }

    /// The goto successor, when the block has one.
    pub fn goto_target(&self, b: BlockId) -> Option<BlockId> {
        self.succ_edge_of_type(b, EdgeType::Goto).map(|e| self.edge(e).tgt)
    }

    /// Outgoing throw edges ordered by handler index; the order handlers
    /// are consulted in.
    pub fn get_outgoing_throws_in_order(&self, b: BlockId) -> Vec<EdgeId> {
        let mut throws = self.succ_edges_of_type(b, EdgeType::Throw);
        throws.sort_by_key(|e| match self.edge(*e).kind {
            EdgeKind::Throw { index, .. } => index,
            _ => unreachable!(),
        });
        throws
    }

    /// Unregisters the edge from both endpoint lists and drops it.
    fn remove_edge_raw(&mut self, e: EdgeId) -> Edge {
        let edge = self.edges[e.0 as usize].take().expect("double delete of edge");
        self.block_mut(edge.src).succs.retain(|x| *x != e);
        self.block_mut(edge.tgt).preds.retain(|x| *x != e);
        edge
    }

    /// Deletes an edge. When this leaves a conditional branch or switch
    /// with a single remaining successor, the branch instruction is
    /// deleted and the surviving edge becomes a goto.
    pub fn delete_edge(&mut self, e: EdgeId) {
        let edge = self.remove_edge_raw(e);
        self.cleanup_deleted_edges(&[edge]);
    }

    pub fn delete_succ_edges(&mut self, b: BlockId) {
        for e in self.succs(b) {
            self.remove_edge_raw(e);
        }
    }

    pub fn delete_pred_edges(&mut self, b: BlockId) {
        for e in self.preds(b) {
            self.remove_edge_raw(e);
        }
    }

    pub fn delete_succ_edge_if(&mut self, b: BlockId, f: impl Fn(&Edge) -> bool) {
        let doomed: Vec<EdgeId> = self
            .block(b)
            .succs
            .iter()
            .copied()
            .filter(|e| f(self.edge(*e)))
            .collect();
        for e in doomed {
            self.remove_edge_raw(e);
        }
    }

    pub fn delete_edges_between(&mut self, p: BlockId, s: BlockId) {
        let doomed: Vec<EdgeId> = self
            .block(p)
            .succs
            .iter()
            .copied()
            .filter(|e| self.edge(*e).tgt == s)
            .collect();
        for e in doomed {
            self.remove_edge_raw(e);
        }
    }

    fn cleanup_deleted_edges(&mut self, edges: &[Edge]) {
        for edge in edges {
            let pred = edge.src;
            if !self.contains_block(pred) {
                continue;
            }
            let Some(last) = self.block(pred).items.last_insn(&self.arena) else {
                continue;
            };
            let op = self.arena.insn(last).opcode();
            let remaining = self.succs(pred);
            if (op.is_conditional_branch() || op.is_switch()) && remaining.len() == 1 {
                {
                    let (block, arena) = self.block_mut_arena(pred);
                    block.items.erase(arena, last);
                }
                let surviving = remaining[0];
                if let Some(e) = &mut self.edges[surviving.0 as usize] {
                    e.kind = EdgeKind::Goto;
                }
            }
        }
    }

    pub fn set_edge_target(&mut self, e: EdgeId, new_target: BlockId) {
        let mut edge = self.remove_edge_raw(e);
        edge.tgt = new_target;
        self.readd_edge(e, edge);
    }

    pub fn set_edge_source(&mut self, e: EdgeId, new_source: BlockId) {
        let mut edge = self.remove_edge_raw(e);
        edge.src = new_source;
        self.readd_edge(e, edge);
    }

    fn readd_edge(&mut self, e: EdgeId, edge: Edge) {
        self.block_mut(edge.src).succs.push(e);
        self.block_mut(edge.tgt).preds.push(e);
        self.edges[e.0 as usize] = Some(edge);
    }

    // -------------------------------------------------------------------
    // Simplification
    // -------------------------------------------------------------------

    pub fn simplify(&mut self) {
        self.remove_unreachable_blocks();
        self.remove_empty_blocks();
    }

    /// Reachability from the entry block.
    fn visit(&self) -> HashSet<BlockId> {
        let mut visited = HashSet::new();
        let mut stack = vec![self.entry];
        while let Some(b) = stack.pop() {
            if !visited.insert(b) {
                continue;
            }
            for e in &self.block(b).succs {
                stack.push(self.edge(*e).tgt);
            }
        }
        visited
    }

    pub fn remove_unreachable_blocks(&mut self) -> usize {
        let visited = self.visit();
        let mut removed_insns = 0;
        let mut deleted_positions: HashSet<ItemId> = HashSet::new();
        let mut need_register_fix = false;

        for b in self.block_ids() {
            if !visited.contains(&b) {
                log::trace!("removing succ edges from unreachable {}", b);
                self.delete_succ_edges(b);
            }
        }
        for b in self.block_ids() {
            if b == self.entry || !self.block(b).preds.is_empty() {
                continue;
            }
            let items = self.block(b).items.ids(&self.arena);
            for id in &items {
                match self.arena.kind(*id) {
                    ItemKind::Position(_) => {
                        deleted_positions.insert(*id);
                    }
                    ItemKind::Insn(insn) => {
                        removed_insns += 1;
                        if insn.has_dest() {
                            let required =
                                insn.dest() + insn.dest_is_wide() as u32 + 1;
                            if required >= self.registers_size {
                                need_register_fix = true;
                            }
                        }
                    }
                    _ => {}
                }
            }
            assert!(self.block(b).succs.is_empty());
            self.free_block(b);
        }

        if need_register_fix {
            self.recompute_registers_size();
        }
        self.remove_dangling_parents(&deleted_positions);
        removed_insns
    }

    /// A block containing only positions with a single goto successor is
    /// bypassed: its predecessors are retargeted to its successor.
    fn remove_empty_blocks(&mut self) {
        let mut deleted_positions: HashSet<ItemId> = HashSet::new();
        for b in self.block_ids() {
            if !self.is_effectively_empty(b) || Some(b) == self.exit {
                continue;
            }
            let non_ghost: Vec<EdgeId> = self
                .block(b)
                .succs
                .iter()
                .copied()
                .filter(|e| self.edge(*e).kind.edge_type() != EdgeType::Ghost)
                .collect();
            if !non_ghost.is_empty() {
                assert!(
                    non_ghost.len() == 1,
                    "too many successors for empty block {}:\n{}",
                    b,
                    self
                );
                let succ = self.edge(non_ghost[0]).tgt;
                if succ == b {
                    // An empty self-loop; leave it alone.
                    continue;
                }
                self.delete_edges_between(b, succ);
                // If the block fed the ghost exit (e.g. as part of an
                // infinite loop), its successor takes over that role.
                if let Some(ghost) = self.succ_edge_of_type(b, EdgeType::Ghost) {
                    self.set_edge_source(ghost, succ);
                }
                for pred in self.preds(b) {
                    self.set_edge_target(pred, succ);
                }
                if b == self.entry {
                    self.entry = succ;
                }
            } else {
                self.delete_pred_edges(b);
                self.delete_succ_edges(b);
            }
            for id in self.block(b).items.ids(&self.arena) {
                if matches!(self.arena.kind(id), ItemKind::Position(_)) {
                    deleted_positions.insert(id);
                }
            }
            self.free_block(b);
        }
        self.remove_dangling_parents(&deleted_positions);
    }

    fn is_effectively_empty(&self, b: BlockId) -> bool {
        self.block(b)
            .items
            .ids(&self.arena)
            .iter()
            .all(|id| matches!(self.arena.kind(*id), ItemKind::Position(_)))
    }

    fn remove_dangling_parents(&mut self, deleted: &HashSet<ItemId>) {
        if deleted.is_empty() {
            return;
        }
        for b in self.block_ids() {
            for id in self.block(b).items.ids(&self.arena) {
                if let ItemKind::Position(pos) = self.arena.kind_mut(id) {
                    if let Some(parent) = pos.parent {
                        if deleted.contains(&parent) {
                            pos.parent = None;
                        }
                    }
                }
            }
        }
    }

    /// Frees a block's items and drops the block. Edges must already be
    /// disconnected.
    fn free_block(&mut self, b: BlockId) {
        let block = self.blocks.remove(&b).expect("double delete of block");
        let mut cur = block.items.head();
        while let Some(id) = cur {
            cur = self.arena.next(id);
            self.arena.free(id);
        }
    }

    /// Removes a block and all of its edges and items.
    pub fn remove_block(&mut self, b: BlockId) {
        if b == self.entry {
            let succs = self.succs(b);
            assert!(succs.len() == 1, "removing a branching entry block");
            self.entry = self.edge(succs[0]).tgt;
        }
        if Some(b) == self.exit {
            self.exit = None;
        }
        self.delete_pred_edges(b);
        self.delete_succ_edges(b);
        let mut deleted_positions = HashSet::new();
        for id in self.block(b).items.ids(&self.arena) {
            if matches!(self.arena.kind(id), ItemKind::Position(_)) {
                deleted_positions.insert(id);
            }
        }
        self.remove_dangling_parents(&deleted_positions);
        self.free_block(b);
    }

    /// Deletes `old_block` and reroutes its predecessors to `new_block`.
    pub fn replace_block(&mut self, old_block: BlockId, new_block: BlockId) {
        for e in self.preds(old_block) {
            self.set_edge_target(e, new_block);
        }
        self.remove_block(old_block);
    }

    // -------------------------------------------------------------------
    // Exit calculation
    // -------------------------------------------------------------------

    /// Finds all exit blocks and ensures there is a unique one, adding a
    /// synthetic block with ghost edges when a method has several exit
    /// points or terminates in an infinite loop. Infinite loops are valid
    /// bytecode, so exits are the heads of successor-less SCCs, not just
    /// return/throw blocks.
    pub fn calculate_exit_block(&mut self) {
        if let Some(exit) = self.exit {
            if self.pred_edge_of_type(exit, EdgeType::Ghost).is_some() {
                // Clear the old synthetic exit before recomputing.
                self.remove_block(exit);
            }
            self.exit = None;
        }
        let mut finder = ExitBlocks {
            cfg: self,
            next_dfn: 0,
            stack: Vec::new(),
            dfns: HashMap::new(),
            exit_blocks: Vec::new(),
        };
        finder.visit(self.entry);
        let exits = finder.exit_blocks;
        if exits.len() == 1 {
            self.exit = Some(exits[0]);
        } else {
            let ghost = self.create_block();
            for b in exits {
                self.add_edge(b, ghost, EdgeKind::Ghost);
            }
            self.exit = Some(ghost);
        }
    }

    // -------------------------------------------------------------------
    // Block-level mutation
    // -------------------------------------------------------------------

    /// Splits `b` after item `at`; the remainder moves to a fresh block
    /// which inherits all outgoing edges, and a goto connects the halves.
    pub fn split_block(&mut self, b: BlockId, at: ItemId) -> BlockId {
        let new_block = self.create_block();
        if let Some(first_of_rest) = self.arena.next(at) {
            let tail = self.block(b).items.tail().expect("nonempty block");
            let block = self.blocks.get_mut(&b).expect("block exists");
            let stolen = block.items.steal_range(&mut self.arena, first_of_rest, tail);
            self.block_mut(new_block).items = stolen;
        }
        for e in self.succs(b) {
            self.set_edge_source(e, new_block);
        }
        self.add_edge(b, new_block, EdgeKind::Goto);
        new_block
    }

    /// Merges `succ` into `pred`. `pred`'s only forward edge must be the
    /// goto to `succ`, and `succ` must have no other predecessors.
    pub fn merge_blocks(&mut self, pred: BlockId, succ: BlockId) {
        {
            let forwards: Vec<EdgeId> = self
                .block(pred)
                .succs
                .iter()
                .copied()
                .filter(|e| self.edge(*e).kind.edge_type() != EdgeType::Throw)
                .collect();
            assert!(forwards.len() == 1);
            let forward = self.edge(forwards[0]);
            assert!(forward.tgt == succ);
            assert!(forward.kind.edge_type() == EdgeType::Goto);
            assert!(self.block(succ).preds.len() == 1);
        }
        self.delete_edges_between(pred, succ);
        let mut moved = std::mem::take(&mut self.block_mut(succ).items);
        let pred_block = self.blocks.get_mut(&pred).expect("block exists");
        pred_block.items.splice_back(&mut self.arena, &mut moved);
        let to_move: Vec<EdgeId> = self
            .succs(succ)
            .into_iter()
            .filter(|e| self.edge(*e).kind.edge_type() != EdgeType::Throw)
            .collect();
        for e in to_move {
            self.set_edge_source(e, pred);
        }
        self.delete_pred_edges(succ);
        self.delete_succ_edges(succ);
        self.blocks.remove(&succ);
    }

    /// Inserts plain (non-branch) instructions before `pos` in `b`.
    /// Returns true when the insertion restructured the graph (a throwing
    /// instruction was inserted inside a try region, or a terminator cut
    /// the block short).
    pub fn insert_before(&mut self, b: BlockId, pos: ItemId, insns: Vec<IrInstruction>) -> bool {
        self.insert(b, Some(pos), insns)
    }

    /// Inserts plain instructions after `pos` in `b`.
    pub fn insert_after(&mut self, b: BlockId, pos: ItemId, insns: Vec<IrInstruction>) -> bool {
        self.insert(b, self.arena.next(pos), insns)
    }

    /// Inserts at the front of the block, before its first instruction.
    pub fn push_front(&mut self, b: BlockId, insns: Vec<IrInstruction>) -> bool {
        let at = self.block(b).items.first_insn(&self.arena);
        self.insert(b, at, insns)
    }

    /// Appends at the end of the block.
    pub fn push_back(&mut self, b: BlockId, insns: Vec<IrInstruction>) -> bool {
        self.insert(b, None, insns)
    }

    fn insert(
        &mut self,
        mut b: BlockId,
        mut at: Option<ItemId>,
        insns: Vec<IrInstruction>,
    ) -> bool {
        let mut invalidated = false;
        let count = insns.len();
        for (i, insn) in insns.into_iter().enumerate() {
            let op = insn.opcode();
            assert!(
                !op.is_branch(),
                "insert() does not support branch opcodes; use create_branch()"
            );
            let throws = self.succ_edges_of_type(b, EdgeType::Throw);
            if at.is_none() {
                // Appending after certain terminators is meaningless.
                if let Some(last) = self.block(b).items.last_insn(&self.arena) {
                    let last_op = self.arena.insn(last).opcode();
                    assert!(
                        !last_op.is_branch()
                            && last_op != Opcode::Throw
                            && !last_op.is_return()
                            && throws.is_empty(),
                        "can't add instructions after {} in {} in\n{}",
                        self.arena.insn(last),
                        b,
                        self
                    );
                }
            }

            let new_item = {
                let block = self.blocks.get_mut(&b).expect("block exists");
                match at {
                    Some(pos) => block.items.insert_before(&mut self.arena, pos, ItemKind::Insn(insn)),
                    None => block.items.push_back(&mut self.arena, ItemKind::Insn(insn)),
                }
            };

            if op == Opcode::Throw || op.is_return() {
                // A terminator ends the block; drop everything after it.
                assert!(i == count - 1, "instructions after a terminator");
                let mut cur = at;
                while let Some(id) = cur {
                    let block = self.blocks.get_mut(&b).expect("block exists");
                    cur = block.items.erase(&mut self.arena, id);
                    invalidated = true;
                }
                if op.is_return() {
                    self.delete_succ_edges(b);
                } else {
                    self.delete_succ_edge_if(b, |e| {
                        !matches!(e.kind.edge_type(), EdgeType::Throw | EdgeType::Ghost)
                    });
                }
                // Unreachable blocks this creates are left to simplify.
            } else if op.may_throw() && !throws.is_empty() {
                invalidated = true;
                // The new instruction must throw to the same handlers as
                // the rest of its block, so it gets a block of its own
                // ending right after it.
                let succ = self.split_block(b, new_item);
                for e in throws {
                    let edge = self.edge(e).clone();
                    self.add_edge(b, edge.tgt, edge.kind);
                }
                b = succ;
                at = self.block(succ).items.head();
            }
        }
        invalidated
    }

    /// Installs a conditional branch or switch at the end of `b`.
    /// `goto_block` is the fallthrough; `case_to_block` carries the taken
    /// arm (conditionals, case key 1) or all switch arms.
    pub fn create_branch(
        &mut self,
        b: BlockId,
        insn: IrInstruction,
        goto_block: Option<BlockId>,
        case_to_block: Vec<(i32, BlockId)>,
    ) {
        let op = insn.opcode();
        assert!(op.is_branch(), "{:?} is not a branch instruction", op);
        assert!(!op.is_goto(), "there are no gotos in the editable CFG; use add_edge()");

        if let Some(last) = self.block(b).items.last_insn(&self.arena) {
            let last_op = self.arena.insn(last).opcode();
            assert!(
                !(last_op.is_branch() || last_op == Opcode::Throw || last_op.is_return()),
                "can't add a branch after {} in {}",
                self.arena.insn(last),
                b
            );
        }

        let existing_goto = self.succ_edge_of_type(b, EdgeType::Goto);
        match (goto_block, existing_goto) {
            (Some(tgt), Some(e)) => self.set_edge_target(e, tgt),
            (Some(tgt), None) => {
                self.add_edge(b, tgt, EdgeKind::Goto);
            }
            (None, Some(_)) => {}
            (None, None) => panic!("{:?} must have a fallthrough case", op),
        }

        let is_switch = op.is_switch();
        let block = self.blocks.get_mut(&b).expect("block exists");
        block.items.push_back(&mut self.arena, ItemKind::Insn(insn));
        if is_switch {
            for (case, target) in case_to_block {
                self.add_edge(b, target, EdgeKind::Branch { case_key: Some(case) });
            }
        } else {
            assert!(case_to_block.len() == 1, "wrong number of branch cases");
            let (case, target) = case_to_block[0];
            assert!(case == 1, "conditional branches only have boolean case keys");
            self.add_edge(b, target, EdgeKind::Branch { case_key: None });
        }
    }

    /// Removes an instruction, maintaining every edge invariant: branch
    /// edges die with their branch, a primary instruction takes its
    /// move-result-pseudo along (even across a block boundary), and
    /// removing the last may-throw of a block drops its throw edges.
    pub fn remove_insn(&mut self, b: BlockId, item: ItemId) {
        let insn = self.arena.insn(item);
        let op = insn.opcode();
        assert!(op != Opcode::Goto, "there are no goto instructions in the CFG");
        let last = self.block(b).items.last_insn(&self.arena).expect("nonempty block");

        if op.is_conditional_branch() || op.is_switch() {
            self.delete_succ_edge_if(b, |e| e.kind.edge_type() == EdgeType::Branch);
        } else if op.has_move_result_pseudo() {
            if item == last {
                // The pseudo lives in the goto successor block.
                let goto_edge = self
                    .succ_edge_of_type(b, EdgeType::Goto)
                    .expect("split primary must have a goto successor");
                let mrp_block = self.edge(goto_edge).tgt;
                let first = self
                    .block(mrp_block)
                    .items
                    .first_insn(&self.arena)
                    .expect("move-result-pseudo block is nonempty");
                assert!(
                    self.arena.insn(first).opcode().is_move_result_pseudo(),
                    "{} -> {} in\n{}",
                    b,
                    mrp_block,
                    self
                );
                assert!(
                    self.block(mrp_block).preds.len() == 1,
                    "multiple edges into a move-result-pseudo block in {}",
                    mrp_block
                );
                {
                    let (block, arena) = self.block_mut_arena(mrp_block);
                    block.items.erase(arena, first);
                }
            } else {
                let insns = self.block(b).items.insn_ids(&self.arena);
                let idx = insns
                    .iter()
                    .position(|x| *x == item)
                    .expect("instruction is in its block");
                let next = insns[idx + 1];
                assert!(self.arena.insn(next).opcode().is_move_result_pseudo());
                {
                    let (block, arena) = self.block_mut_arena(b);
                    block.items.erase(arena, next);
                }
            }
        }

        if item == last && op.can_throw() {
            self.delete_succ_edge_if(b, |e| e.kind.edge_type() == EdgeType::Throw);
        }

        {
            let (block, arena) = self.block_mut_arena(b);
            block.items.erase(arena, item);
        }
    }

    /// The move-result(-pseudo) paired with the instruction at `item`,
    /// looking across the goto edge when the primary ends its block.
    pub fn move_result_of(&self, b: BlockId, item: ItemId) -> Option<(BlockId, ItemId)> {
        let mut cur = self.arena.next(item);
        while let Some(id) = cur {
            match self.arena.kind(id) {
                ItemKind::Insn(insn) => {
                    let op = insn.opcode();
                    if op.is_move_result() || op.is_move_result_pseudo() {
                        return Some((b, id));
                    }
                    return None;
                }
                _ => cur = self.arena.next(id),
            }
        }
        let goto = self.succ_edge_of_type(b, EdgeType::Goto)?;
        let next_block = self.edge(goto).tgt;
        let first = self.block(next_block).items.first_insn(&self.arena)?;
        let op = self.arena.insn(first).opcode();
        if op.is_move_result() || op.is_move_result_pseudo() {
            Some((next_block, first))
        } else {
            None
        }
    }

    // -------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------

    pub fn first_insn(&self, b: BlockId) -> Option<ItemId> {
        self.block(b).items.first_insn(&self.arena)
    }

    pub fn last_insn(&self, b: BlockId) -> Option<ItemId> {
        self.block(b).items.last_insn(&self.arena)
    }

    pub fn starts_with_move_result(&self, b: BlockId) -> bool {
        self.first_insn(b)
            .map(|id| {
                let op = self.arena.insn(id).opcode();
                op.is_move_result() || op.is_move_result_pseudo()
            })
            .unwrap_or(false)
    }

    pub fn is_catch_block(&self, b: BlockId) -> bool {
        self.pred_edge_of_type(b, EdgeType::Throw).is_some()
    }

    /// Whether a block contains no may-throw instruction at all.
    pub fn cannot_throw(&self, b: BlockId) -> bool {
        self.block(b)
            .items
            .insn_ids(&self.arena)
            .iter()
            .all(|id| !self.arena.insn(*id).opcode().can_throw())
    }

    /// Two blocks are in the same try region when their ordered outgoing
    /// throw edges agree on targets and catch types.
    pub fn blocks_are_in_same_try(&self, b1: BlockId, b2: BlockId) -> bool {
        let throws1 = self.get_outgoing_throws_in_order(b1);
        let throws2 = self.get_outgoing_throws_in_order(b2);
        if throws1.len() != throws2.len() {
            return false;
        }
        throws1.iter().zip(throws2.iter()).all(|(e1, e2)| {
            let (e1, e2) = (self.edge(*e1), self.edge(*e2));
            let t1 = match e1.kind {
                EdgeKind::Throw { catch_type, .. } => catch_type,
                _ => unreachable!(),
            };
            let t2 = match e2.kind {
                EdgeKind::Throw { catch_type, .. } => catch_type,
                _ => unreachable!(),
            };
            e1.tgt == e2.tgt && t1 == t2
        })
    }

    /// How control leaves the block, derived from its last instruction
    /// and outgoing edges.
    pub fn branchingness(&self, b: BlockId) -> Branchingness {
        let succs = self.succs(b);
        let only_ghost = succs.is_empty()
            || (succs.len() == 1 && self.edge(succs[0]).kind.edge_type() == EdgeType::Ghost);
        if only_ghost {
            if let Some(last) = self.last_insn(b) {
                let op = self.arena.insn(last).opcode();
                if op.is_return() {
                    return Branchingness::Return;
                }
                if op == Opcode::Throw {
                    return Branchingness::Throw;
                }
            }
            return Branchingness::None;
        }
        if self.succ_edge_of_type(b, EdgeType::Throw).is_some() {
            return Branchingness::Throw;
        }
        if self.succ_edge_of_type(b, EdgeType::Branch).is_some() {
            let last = self.last_insn(b).expect("branching block has a branch");
            return self.arena.insn(last).opcode().branchingness();
        }
        if self.succ_edge_of_type(b, EdgeType::Goto).is_some() {
            return Branchingness::Goto;
        }
        Branchingness::None
    }

    /// The real exit blocks: sources of ghost edges when a synthetic exit
    /// exists, or the single exit itself.
    pub fn real_exit_blocks(&self) -> Vec<BlockId> {
        let Some(exit) = self.exit else {
            panic!("call calculate_exit_block first");
        };
        let ghosts = self.pred_edges_of_type(exit, EdgeType::Ghost);
        if ghosts.is_empty() {
            vec![exit]
        } else {
            ghosts.iter().map(|e| self.edge(*e).src).collect()
        }
    }

    /// Every (block, instruction item) pair in block id order.
    pub fn instructions(&self) -> Vec<(BlockId, ItemId)> {
        let mut out = Vec::new();
        for (&b, block) in &self.blocks {
            for id in block.items.insn_ids(&self.arena) {
                out.push((b, id));
            }
        }
        out
    }

    pub fn num_opcodes(&self) -> usize {
        self.blocks.values().map(|b| b.items.count_opcodes(&self.arena)).sum()
    }

    pub fn sum_opcode_sizes(&self) -> u32 {
        self.blocks.values().map(|b| b.items.sum_opcode_sizes(&self.arena)).sum()
    }

    /// Finds the block and item of the given instruction by structural
    /// identity search.
    pub fn find_insn(&self, needle: &IrInstruction) -> Option<(BlockId, ItemId)> {
        self.instructions()
            .into_iter()
            .find(|(_, id)| self.arena.insn(*id) == needle)
    }

    /// The load-param instructions at the entry of the method.
    pub fn param_insns(&self) -> Vec<ItemId> {
        let mut block = self.entry;
        loop {
            let params = self.block(block).items.param_insns(&self.arena);
            if self.block(block).items.first_insn(&self.arena).is_some() {
                return params;
            }
            let succs = self.succs(block);
            assert!(succs.len() == 1, "empty entry block must have a single goto");
            block = self.edge(succs[0]).tgt;
        }
    }

    pub fn compute_registers_size(&self) -> u32 {
        let mut num_regs = 0;
        for (_, id) in self.instructions() {
            let insn = self.arena.insn(id);
            if insn.has_dest() {
                // +1 because registers start at v0.
                let required = insn.dest() + insn.dest_is_wide() as u32 + 1;
                num_regs = num_regs.max(required);
            }
        }
        // Source registers don't matter here: well-formed input never
        // reads a register it hasn't defined, thanks to the load-param
        // opcodes covering the arguments.
        num_regs
    }

    pub fn recompute_registers_size(&mut self) {
        self.registers_size = self.compute_registers_size();
    }

    pub fn gather_strings(&self, out: &mut Vec<crate::refs::StringId>) {
        for block in self.blocks.values() {
            block.items.gather_strings(&self.arena, out);
        }
    }

    pub fn gather_types(&self, out: &mut Vec<TypeId>) {
        for block in self.blocks.values() {
            block.items.gather_types(&self.arena, out);
        }
        // Catch types live on throw edges while the graph is editable.
        for edge in self.edges.iter().flatten() {
            if let EdgeKind::Throw { catch_type: Some(t), .. } = edge.kind {
                if !out.contains(&t) {
                    out.push(t);
                }
            }
        }
    }

    pub fn gather_fields(&self, out: &mut Vec<crate::refs::FieldId>) {
        for block in self.blocks.values() {
            block.items.gather_fields(&self.arena, out);
        }
    }

    pub fn gather_methods(&self, out: &mut Vec<crate::refs::MethodId>) {
        for block in self.blocks.values() {
            block.items.gather_methods(&self.arena, out);
        }
    }

    // -------------------------------------------------------------------
    // Consistency
    // -------------------------------------------------------------------

    /// Asserts every structural invariant of the editable graph. Panics
    /// with a dump of the graph on violation.
    pub fn sanity_check(&self) {
        for (&b, block) in &self.blocks {
            // Markers and gotos must not survive in editable form.
            for id in block.items.ids(&self.arena) {
                match self.arena.kind(id) {
                    ItemKind::Target(_) => {
                        panic!("failed to remove all targets. {} in\n{}", b, self)
                    }
                    ItemKind::TryStart(_) | ItemKind::TryEnd(_) | ItemKind::Catch(_) => {
                        panic!("failed to remove try/catch markers. {} in\n{}", b, self)
                    }
                    ItemKind::Insn(insn) => {
                        assert!(
                            !insn.opcode().is_goto(),
                            "failed to remove all gotos. {} in\n{}",
                            b,
                            self
                        );
                    }
                    _ => {}
                }
            }

            let num_goto_succs = self.succ_edges_of_type(b, EdgeType::Goto).len();
            let num_preds = block.preds.len();
            let num_succs = block
                .succs
                .iter()
                .filter(|e| self.edge(**e).kind.edge_type() != EdgeType::Ghost)
                .count();

            if let Some(last) = block.items.last_insn(&self.arena) {
                let op = self.arena.insn(last).opcode();
                if op.is_conditional_branch() {
                    assert!(num_succs == 2, "{} in\n{}", b, self);
                } else if op.is_switch() {
                    assert!(num_succs > 1, "{} in\n{}", b, self);
                } else if op.is_return() {
                    assert!(num_succs == 0, "{} in\n{}", b, self);
                } else if op == Opcode::Throw {
                    let non_throw = block.succs.iter().find(|e| {
                        !matches!(
                            self.edge(**e).kind.edge_type(),
                            EdgeType::Throw | EdgeType::Ghost
                        )
                    });
                    assert!(non_throw.is_none(), "{} in\n{}", b, self);
                } else if num_preds > 0 {
                    assert!(num_succs > 0, "control flow falls off {} in\n{}", b, self);
                    assert!(num_goto_succs == 1, "{} in\n{}", b, self);
                }
            } else if num_preds > 0 && Some(b) != self.exit {
                assert!(num_succs > 0, "control flow falls off {} in\n{}", b, self);
                assert!(num_goto_succs == 1, "{} in\n{}", b, self);
            }
            assert!(num_goto_succs < 2, "{} has multiple gotos in\n{}", b, self);

            // Move-result-pseudo heads have exactly one predecessor.
            if self.starts_with_move_result(b)
                && self
                    .first_insn(b)
                    .map(|id| self.arena.insn(id).opcode().is_move_result_pseudo())
                    .unwrap_or(false)
                && num_preds > 0
            {
                assert!(num_preds == 1, "{} in\n{}", b, self);
            }
        }

        // Edge lists agree in both directions and match the edge set.
        let mut referenced: HashSet<EdgeId> = HashSet::new();
        for (&b, block) in &self.blocks {
            for &e in &block.succs {
                let edge = self.edge(e);
                assert!(edge.src == b, "{} in\n{}", b, self);
                assert!(
                    self.block(edge.tgt).preds.contains(&e),
                    "{} -> {} in\n{}",
                    b,
                    edge.tgt,
                    self
                );
                referenced.insert(e);
            }
            for &e in &block.preds {
                let edge = self.edge(e);
                assert!(edge.tgt == b, "{} in\n{}", b, self);
                assert!(
                    self.block(edge.src).succs.contains(&e),
                    "{} -> {} in\n{}",
                    edge.src,
                    b,
                    self
                );
                referenced.insert(e);
            }

            // Only the last throw edge may be a catch-all.
            let throws = self.get_outgoing_throws_in_order(b);
            for (i, e) in throws.iter().enumerate() {
                if let EdgeKind::Throw { catch_type, .. } = self.edge(*e).kind {
                    if catch_type.is_none() {
                        assert!(
                            i == throws.len() - 1,
                            "catch-all out of {} isn't last in\n{}",
                            b,
                            self
                        );
                    }
                }
            }
        }
        let live_edges = self.edges.iter().flatten().count();
        assert!(referenced.len() == live_edges, "unreferenced edges in\n{}", self);

        let used = self.compute_registers_size();
        assert!(
            used <= self.registers_size,
            "used regs {} exceed registers size {}.\n{}",
            used,
            self.registers_size,
            self
        );
    }

    // -------------------------------------------------------------------
    // Dominators
    // -------------------------------------------------------------------

    /// Immediate dominators for every reachable block, by the simple
    /// iterative algorithm of Cooper, Harvey and Kennedy.
    pub fn immediate_dominators(&self) -> HashMap<BlockId, BlockId> {
        let postorder = self.postorder();
        let index: HashMap<BlockId, usize> =
            postorder.iter().enumerate().map(|(i, b)| (*b, i)).collect();
        let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
        idom.insert(self.entry, self.entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &b in postorder.iter().rev() {
                if b == self.entry {
                    continue;
                }
                let mut new_idom: Option<BlockId> = None;
                for e in &self.block(b).preds {
                    let pred = self.edge(*e).src;
                    if !idom.contains_key(&pred) || !index.contains_key(&pred) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(existing) => intersect(&idom, &index, existing, pred),
                    });
                }
                if let Some(new_idom) = new_idom {
                    if idom.get(&b) != Some(&new_idom) {
                        idom.insert(b, new_idom);
                        changed = true;
                    }
                }
            }
        }
        idom
    }

    fn postorder(&self) -> Vec<BlockId> {
        let mut postorder = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(self.entry, false)];
        while let Some((b, processed)) = stack.pop() {
            if processed {
                postorder.push(b);
                continue;
            }
            if !visited.insert(b) {
                continue;
            }
            stack.push((b, true));
            for e in &self.block(b).succs {
                let tgt = self.edge(*e).tgt;
                if !visited.contains(&tgt) {
                    stack.push((tgt, false));
                }
            }
        }
        postorder
    }
}

fn intersect(
    idom: &HashMap<BlockId, BlockId>,
    index: &HashMap<BlockId, usize>,
    b1: BlockId,
    b2: BlockId,
) -> BlockId {
    let mut finger1 = b1;
    let mut finger2 = b2;
    while finger1 != finger2 {
        while index[&finger1] < index[&finger2] {
            finger1 = idom[&finger1];
        }
        while index[&finger2] < index[&finger1] {
            finger2 = idom[&finger2];
        }
    }
    finger1
}

#[derive(Debug, Default)]
struct Boundaries {
    /// branch instruction item -> (target's block, target item, case key)
    branch_targets: HashMap<ItemId, Vec<(BlockId, ItemId, Option<i32>)>>,
    /// try-end marker -> block that contains it
    try_ends: Vec<(ItemId, BlockId)>,
    /// catch entry item -> block that contains it
    catch_blocks: HashMap<ItemId, BlockId>,
}

/// Tarjan's algorithm, tracking for each SCC whether any member has a
/// successor outside the component. Successor-less SCC heads are the real
/// exits (this covers infinite loops, which terminate methods without a
/// return).
struct ExitBlocks<'a> {
    cfg: &'a Cfg,
    next_dfn: u32,
    stack: Vec<BlockId>,
    // 0 = unvisited, u32::MAX = visited and assigned to an earlier SCC.
    dfns: HashMap<BlockId, u32>,
    exit_blocks: Vec<BlockId>,
}

const VISITED: u32 = u32::MAX;

impl ExitBlocks<'_> {
    fn visit(&mut self, b: BlockId) -> (u32, bool) {
        self.stack.push(b);
        self.next_dfn += 1;
        self.dfns.insert(b, self.next_dfn);
        let mut head = self.next_dfn;
        let mut has_exit = false;
        for e in &self.cfg.block(b).succs {
            let succ = self.cfg.edge(*e).tgt;
            let succ_dfn = self.dfns.get(&succ).copied().unwrap_or(0);
            let min = if succ_dfn == 0 {
                let (min, succ_has_exit) = self.visit(succ);
                has_exit |= succ_has_exit;
                min
            } else {
                has_exit |= succ_dfn == VISITED;
                succ_dfn
            };
            head = head.min(min);
        }
        if head == self.dfns[&b] {
            if !has_exit {
                self.exit_blocks.push(b);
                has_exit = true;
            }
            loop {
                let top = self.stack.pop().expect("SCC stack underflow");
                self.dfns.insert(top, VISITED);
                if top == b {
                    break;
                }
            }
        }
        (head, has_exit)
    }
}

impl GraphInterface for Cfg {
    type NodeId = BlockId;
    type EdgeId = EdgeId;

    fn entry(&self) -> BlockId {
        self.entry
    }

    fn predecessors(&self, node: BlockId) -> Vec<EdgeId> {
        self.preds(node)
    }

    fn successors(&self, node: BlockId) -> Vec<EdgeId> {
        self.succs(node)
    }

    fn source(&self, edge: &EdgeId) -> BlockId {
        self.edge(*edge).src
    }

    fn target(&self, edge: &EdgeId) -> BlockId {
        self.edge(*edge).tgt
    }
}

impl fmt::Display for Cfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CFG: entry {}, {} regs", self.entry, self.registers_size)?;
        for (&b, block) in &self.blocks {
            let succs: Vec<String> = block
                .succs
                .iter()
                .map(|e| {
                    let edge = self.edge(*e);
                    let label = match edge.kind {
                        EdgeKind::Goto => "goto".to_string(),
                        EdgeKind::Branch { case_key: None } => "branch".to_string(),
                        EdgeKind::Branch { case_key: Some(k) } => format!("branch {}", k),
                        EdgeKind::Throw { .. } => "throw".to_string(),
                        EdgeKind::Ghost => "ghost".to_string(),
                    };
                    format!("{} {}", label, edge.tgt)
                })
                .collect();
            let marker = if b == self.entry {
                " (entry)"
            } else if Some(b) == self.exit {
                " (exit)"
            } else {
                ""
            };
            writeln!(f, " {}{}: [{}]", b, marker, succs.join(", "))?;
            for id in block.items.ids(&self.arena) {
                match self.arena.kind(id) {
                    ItemKind::Insn(insn) => writeln!(f, "   {}", insn)?,
                    ItemKind::Position(p) => writeln!(f, "   .pos line={}", p.line)?,
                    other => writeln!(f, "   {:?}", other)?,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
