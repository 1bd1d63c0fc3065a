//! Turning an editable CFG back into a linear item stream
//!
//! Linearization proceeds in five steps: group blocks into chains that
//! must stay adjacent (move-result pairing, shared try regions), order
//! the chains by a weak topological ordering of the chain graph, then
//! re-materialize branch targets, synthetic gotos and try/catch markers,
//! and finally splice everything into one list and sweep duplicate
//! positions.

use super::{BlockId, Cfg, EdgeId, EdgeKind, EdgeType};
use crate::instruction::IrInstruction;
use crate::item::{BranchTarget, CatchEntry, IrCode, IrList, ItemArena, ItemId, ItemKind, TryMarker};
use crate::opcode::Opcode;
use dexopt_analysis::{WeakTopologicalOrdering, WtoComponentRef};
use hashbrown::{HashMap, HashSet};

impl Cfg {
    /// Serializes the graph back into a linear method body. The result is
    /// semantically equivalent to the stream the graph was built from,
    /// though blocks may be reordered.
    pub fn linearize(mut self) -> IrCode {
        self.sanity_check();
        log::trace!("before linearize:\n{}", self);

        let ordering = self.order();
        self.insert_branches_and_targets(&ordering);
        self.insert_try_catch_markers(&ordering);

        let mut list = IrList::new();
        for &b in &ordering {
            let mut items = std::mem::take(&mut self.block_mut(b).items);
            list.splice_back(&mut self.arena, &mut items);
        }
        remove_duplicate_positions(&mut self.arena, &mut list);

        IrCode { registers_size: self.registers_size, arena: self.arena, list }
    }

    /// A layout for the blocks: chains that must stay together, ordered
    /// by a WTO over the chain graph and flattened depth-first.
    pub fn order(&mut self) -> Vec<BlockId> {
        // Simplify first so unreachable blocks don't confuse the layout.
        self.simplify();

        let (chains, block_to_chain) = self.build_chains();
        let result = self.wto_chains(&chains, &block_to_chain);
        assert!(
            result.len() == self.num_blocks(),
            "ordering has {} blocks, graph has {}",
            result.len(),
            self.num_blocks()
        );
        result
    }

    fn build_chains(&self) -> (Vec<Vec<BlockId>>, HashMap<BlockId, usize>) {
        let mut chains: Vec<Vec<BlockId>> = Vec::new();
        let mut block_to_chain: HashMap<BlockId, usize> = HashMap::new();

        for b in self.block_ids() {
            if block_to_chain.contains_key(&b) {
                continue;
            }
            debug_assert!(!self.starts_with_move_result(b), "{} starts a chain", b);
            let chain_index = chains.len();
            let mut chain = vec![b];
            block_to_chain.insert(b, chain_index);

            let mut goto_edge = self.succ_edge_of_type(b, EdgeType::Goto);
            while let Some(e) = goto_edge {
                let goto_block = self.edge(e).tgt;
                if self.starts_with_move_result(goto_block)
                    || self.blocks_are_in_same_try(goto_block, b)
                {
                    // A move-result(-pseudo) must stay glued to its
                    // primary instruction. Blocks of the same try region
                    // are also kept together: the fallthrough saves a
                    // goto without widening the region.
                    if block_to_chain.contains_key(&goto_block) {
                        break;
                    }
                    block_to_chain.insert(goto_block, chain_index);
                    chain.push(goto_block);
                    goto_edge = self.succ_edge_of_type(goto_block, EdgeType::Goto);
                } else {
                    break;
                }
            }
            chains.push(chain);
        }
        (chains, block_to_chain)
    }

    fn wto_chains(
        &self,
        chains: &[Vec<BlockId>],
        block_to_chain: &HashMap<BlockId, usize>,
    ) -> Vec<BlockId> {
        let entry_chain = block_to_chain[&self.entry_block()];
        let wto = WeakTopologicalOrdering::new(entry_chain, |chain_idx: usize| {
            let chain = &chains[chain_idx];
            let mut result = Vec::with_capacity(chain.len());
            for (i, &b) in chain.iter().enumerate() {
                let next = chain.get(i + 1).copied();
                for e in self.block(b).succs() {
                    let tgt = self.edge(*e).tgt;
                    if Some(tgt) == next {
                        // Intra-chain fallthrough, not a chain edge.
                        continue;
                    }
                    let succ_chain = block_to_chain[&tgt];
                    if succ_chain != chain_idx {
                        result.push(succ_chain);
                    }
                }
            }
            result
        });

        // Flatten the WTO depth-first into a block ordering.
        let mut order = Vec::new();
        fn flatten(
            component: WtoComponentRef<'_, usize>,
            chains: &[Vec<BlockId>],
            order: &mut Vec<BlockId>,
        ) {
            order.extend(chains[component.head_node()].iter().copied());
            if component.is_scc() {
                for inner in component.subcomponents() {
                    flatten(inner, chains, order);
                }
            }
        }
        for component in wto.components() {
            flatten(component, chains, &mut order);
        }
        order
    }

    /// Rebuilds target items at the head of every branched-to block, and
    /// synthesizes a goto wherever the layout breaks a fallthrough.
    fn insert_branches_and_targets(&mut self, ordering: &[BlockId]) {
        for (idx, &b) in ordering.iter().enumerate() {
            for e in self.succs(b) {
                let edge = self.edge(e).clone();
                match edge.kind {
                    EdgeKind::Branch { case_key } => {
                        let branch_item = self
                            .get_conditional_branch(b)
                            .unwrap_or_else(|| panic!("no branch at the end of {}:\n{}", b, self));
                        let target = ItemKind::Target(BranchTarget { src: branch_item, case_key });
                        let tgt = edge.tgt;
                        let (block, arena) = self.block_mut_arena(tgt);
                        block.items.push_front(arena, target);
                    }
                    EdgeKind::Goto => {
                        if ordering.get(idx + 1) == Some(&edge.tgt) {
                            // Falls through to the next block; no goto
                            // needed.
                            continue;
                        }
                        let goto_insn = ItemKind::Insn(IrInstruction::new(Opcode::Goto));
                        let goto_item = {
                            let (block, arena) = self.block_mut_arena(b);
                            block.items.push_back(arena, goto_insn)
                        };
                        let target =
                            ItemKind::Target(BranchTarget { src: goto_item, case_key: None });
                        let tgt = edge.tgt;
                        let (block, arena) = self.block_mut_arena(tgt);
                        block.items.push_front(arena, target);
                    }
                    _ => {}
                }
            }
        }
    }

    fn get_conditional_branch(&self, b: BlockId) -> Option<ItemId> {
        let mut cur = self.block(b).items.tail();
        while let Some(id) = cur {
            if let ItemKind::Insn(insn) = self.arena.kind(id) {
                let op = insn.opcode();
                if op.is_conditional_branch() || op.is_switch() {
                    return Some(id);
                }
            }
            cur = self.arena.prev(id);
        }
        None
    }

    /// Rebuilds TRY_START / TRY_END markers and catch entry chains from
    /// the throw edges, walking the ordering and tracking the active
    /// catch chain.
    fn insert_try_catch_markers(&mut self, ordering: &[BlockId]) {
        let mut catch_to_containing_block: HashMap<ItemId, BlockId> = HashMap::new();
        let mut active_catch: Option<ItemId> = None;
        let mut prev: Option<BlockId> = None;

        for &b in ordering {
            let new_catch = self.create_catch(b, &mut catch_to_containing_block);

            if new_catch.is_none() && self.cannot_throw(b) && !self.is_catch_block(b) {
                // Blocks that cannot throw may sit inside the previous try
                // region, producing fewer regions overall. Catch blocks
                // must not: a region containing its own handler is
                // invalid.
                prev = Some(b);
                continue;
            }

            if active_catch != new_catch {
                // The region switch between prev and b: the TRY_END of the
                // old region must precede the TRY_START of the new one in
                // the final stream. Both insert at the same boundary, so
                // the start is placed first (insertion pushes earlier
                // items rightward).
                if let Some(nc) = new_catch {
                    let start = ItemKind::TryStart(TryMarker { catch_start: nc });
                    self.insert_try_marker_between(prev, start, b);
                }
                if let Some(ac) = active_catch {
                    let end = ItemKind::TryEnd(TryMarker { catch_start: ac });
                    self.insert_try_marker_between(prev, end, b);
                }
                active_catch = new_catch;
            }
            prev = Some(b);
        }
        if let Some(ac) = active_catch {
            let ItemKind::Catch(entry) = self.arena.kind(ac) else {
                panic!("active catch is not a catch entry");
            };
            assert!(entry.next != Some(ac), "cyclic catch chain");
            let last = *ordering.last().expect("nonempty ordering");
            let end = ItemKind::TryEnd(TryMarker { catch_start: ac });
            let (block, arena) = self.block_mut_arena(last);
            block.items.push_back(arena, end);
        }
    }

    fn insert_try_marker_between(&mut self, prev: Option<BlockId>, marker: ItemKind, b: BlockId) {
        let first_insn = self.block(b).items.first_insn(&self.arena);
        if let Some(first) = first_insn {
            if self.arena.insn(first).opcode().is_move_result_pseudo() {
                // Don't split a move-result-pseudo from its primary
                // instruction; the marker goes after the pseudo.
                let block = self.blocks.get_mut(&b).expect("block exists");
                block.items.insert_after(&mut self.arena, first, marker);
                return;
            }
        }
        if matches!(marker, ItemKind::TryStart(_)) {
            if prev.is_none() && b == self.entry_block() {
                // Parameter loading instructions precede any TRY_START.
                let params = self.block(b).items.param_insns(&self.arena);
                match params.last() {
                    Some(&last_param) => {
                        let block = self.blocks.get_mut(&b).expect("block exists");
                        block.items.insert_after(&mut self.arena, last_param, marker);
                    }
                    None => {
                        let (block, arena) = self.block_mut_arena(b);
                        block.items.push_front(arena, marker);
                    }
                }
            } else {
                let (block, arena) = self.block_mut_arena(b);
                block.items.push_front(arena, marker);
            }
        } else {
            let prev = prev.expect("TRY_END requires a previous block");
            let (block, arena) = self.block_mut_arena(prev);
            block.items.push_back(arena, marker);
        }
    }

    /// Builds the catch entry chain describing `b`'s outgoing throw edges,
    /// reusing an existing equivalent chain in the target block when one
    /// is already present. Returns the head of the chain.
    fn create_catch(
        &mut self,
        b: BlockId,
        catch_to_containing_block: &mut HashMap<ItemId, BlockId>,
    ) -> Option<ItemId> {
        let throws = self.get_outgoing_throws_in_order(b);
        self.add_catch(&throws, 0, catch_to_containing_block)
    }

    fn add_catch(
        &mut self,
        throws: &[EdgeId],
        i: usize,
        catch_to_containing_block: &mut HashMap<ItemId, BlockId>,
    ) -> Option<ItemId> {
        if i == throws.len() {
            return None;
        }
        let edge = self.edge(throws[i]).clone();
        let catch_block = edge.tgt;
        // Reuse an equivalent chain if the handler block already has one;
        // this is what keeps two identical try regions from emitting the
        // catch list twice.
        for id in self.block(catch_block).items.ids(&self.arena) {
            if matches!(self.arena.kind(id), ItemKind::Catch(_))
                && self.catch_entries_equivalent_to_throw_edges(
                    id,
                    &throws[i..],
                    catch_to_containing_block,
                )
            {
                return Some(id);
            }
        }
        // Create the tail first so the new entry can point at it.
        let next = self.add_catch(throws, i + 1, catch_to_containing_block);
        let EdgeKind::Throw { catch_type, .. } = edge.kind else {
            panic!("throw edge expected");
        };
        let entry = ItemKind::Catch(CatchEntry { catch_type, next });
        let (block, arena) = self.block_mut_arena(catch_block);
        let new_catch = block.items.push_front(arena, entry);
        catch_to_containing_block.insert(new_catch, catch_block);
        Some(new_catch)
    }

    /// Whether the catch chain starting at `first` matches the given
    /// ordered throw edges, entry for entry.
    fn catch_entries_equivalent_to_throw_edges(
        &self,
        first: ItemId,
        throws: &[EdgeId],
        catch_to_containing_block: &HashMap<ItemId, BlockId>,
    ) -> bool {
        let mut it = throws.iter();
        let mut catch = Some(first);
        while let Some(catch_item) = catch {
            let ItemKind::Catch(entry) = self.arena.kind(catch_item) else {
                panic!("{} is not a catch entry", catch_item);
            };
            let Some(e) = it.next() else {
                return false;
            };
            let edge = self.edge(*e);
            let EdgeKind::Throw { catch_type, .. } = edge.kind else {
                panic!("throw edge expected");
            };
            if entry.catch_type != catch_type {
                return false;
            }
            match catch_to_containing_block.get(&catch_item) {
                Some(containing) if *containing == edge.tgt => {}
                _ => return false,
            }
            catch = entry.next;
        }
        it.next().is_none()
    }
}

/// Adjacent positions that are exact duplicates get deleted, except
/// positions that some other position references as its parent.
fn remove_duplicate_positions(arena: &mut ItemArena, list: &mut IrList) {
    let mut keep: HashSet<ItemId> = HashSet::new();
    for id in list.ids(arena) {
        if let ItemKind::Position(pos) = arena.kind(id) {
            if let Some(parent) = pos.parent {
                keep.insert(parent);
            }
        }
    }
    let mut prev: Option<ItemId> = None;
    let mut cur = list.head();
    while let Some(id) = cur {
        let next = arena.next(id);
        if let ItemKind::Position(pos) = arena.kind(id) {
            let duplicate = match prev {
                Some(p) => {
                    let ItemKind::Position(prev_pos) = arena.kind(p) else {
                        unreachable!()
                    };
                    prev_pos == pos
                }
                None => false,
            };
            if duplicate && !keep.contains(&id) {
                list.erase(arena, id);
            } else {
                prev = Some(id);
            }
        }
        cur = next;
    }
}
