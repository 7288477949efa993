//! Approximate control-flow graph over a partial program.
//!
//! Nodes live in an arena indexed by [NodeId]; edges are index pairs stored on the
//! graph, so back-edges cost nothing in ownership terms. The builder tolerates holes:
//! undefined or still-corrupted instructions are skipped, branches to addresses outside
//! the image sink into an [BlockKind::UnknownBranch] node, and forward branches whose
//! target has not been placed yet wait in a pending-jumps table until the first block
//! containing the target appears.

use crate::{
    candidate::CandidateStore, condition::Condition, program::Program, registers::RegisterIndex,
};
use std::collections::{BTreeMap, HashMap};

pub type NodeId = usize;

/// Structural role of a CFG node.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Root,
    /// Straight-line run of instructions sharing one conditional.
    Block,
    /// Empty bifurcation landing pad created for a non-always conditional.
    Cond,
    /// Empty sink for register-indirect or out-of-range branches.
    UnknownBranch,
    End,
}

/// A CFG node. Only [BlockKind::Block] nodes hold instructions; the other kinds stay
/// empty.
#[derive(Debug, Clone)]
pub struct Block {
    kind: BlockKind,
    /// Indices into the program instruction sequence.
    pub instructions: Vec<usize>,
    // SSA scaffolding reserved for downstream passes.
    pub dom_index: Option<usize>,
    pub dom_parent: Option<NodeId>,
    pub idom: Option<NodeId>,
    pub dom_frontier: Vec<NodeId>,
    pub phi_functions: BTreeMap<RegisterIndex, Vec<NodeId>>,
}

impl Block {
    pub fn new(kind: BlockKind) -> Self {
        debug_assert!(kind != BlockKind::Block);
        Self {
            kind,
            instructions: Vec::new(),
            dom_index: None,
            dom_parent: None,
            idom: None,
            dom_frontier: Vec::new(),
            phi_functions: BTreeMap::new(),
        }
    }

    pub fn with_instructions(instructions: Vec<usize>) -> Self {
        debug_assert!(!instructions.is_empty());
        Self {
            kind: BlockKind::Block,
            instructions,
            dom_index: None,
            dom_parent: None,
            idom: None,
            dom_frontier: Vec::new(),
            phi_functions: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn first(&self) -> Option<usize> {
        self.instructions.first().copied()
    }

    pub fn last(&self) -> Option<usize> {
        self.instructions.last().copied()
    }
}

/// Directed multigraph over [Block] nodes. Adding an edge twice is a no-op.
#[derive(Debug, Clone, Default)]
pub struct Cfg {
    nodes: Vec<Option<Block>>,
    succ: Vec<Vec<NodeId>>,
    pred: Vec<Vec<NodeId>>,
    root: NodeId,
    end: NodeId,
    /// Containing node of every placed instruction index.
    location: HashMap<usize, NodeId>,
    /// Conditional landing pad guarding the block whose first instruction is the key.
    cond_entry: HashMap<usize, NodeId>,
}

impl Cfg {
    /// Adds a node to the arena and indexes its instructions.
    pub fn add_node(&mut self, block: Block) -> NodeId {
        let id = self.nodes.len();
        for index in &block.instructions {
            self.location.insert(*index, id);
        }
        self.nodes.push(Some(block));
        self.succ.push(Vec::new());
        self.pred.push(Vec::new());
        id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn end(&self) -> NodeId {
        self.end
    }

    pub fn node(&self, id: NodeId) -> Option<&Block> {
        self.nodes.get(id).and_then(|n| n.as_ref())
    }

    /// Iterates over all live nodes.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Block)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(id, n)| n.as_ref().map(|b| (id, b)))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn has_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.succ[from].contains(&to)
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        if !self.has_edge(from, to) {
            self.succ[from].push(to);
            self.pred[to].push(from);
        }
    }

    pub fn remove_edge(&mut self, from: NodeId, to: NodeId) {
        self.succ[from].retain(|n| *n != to);
        self.pred[to].retain(|n| *n != from);
    }

    /// Deletes a node along with its incident edges.
    pub fn remove_node(&mut self, id: NodeId) {
        for p in self.pred[id].clone() {
            self.succ[p].retain(|n| *n != id);
        }
        for s in self.succ[id].clone() {
            self.pred[s].retain(|n| *n != id);
        }
        self.succ[id].clear();
        self.pred[id].clear();
        if let Some(block) = self.nodes[id].take() {
            for index in block.instructions {
                self.location.remove(&index);
            }
        }
    }

    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        &self.succ[id]
    }

    pub fn predecessors(&self, id: NodeId) -> &[NodeId] {
        &self.pred[id]
    }

    /// Node containing the instruction at program index `index`, if placed.
    pub fn block_of(&self, index: usize) -> Option<NodeId> {
        self.location.get(&index).copied()
    }

    /// Marks every node reachable from the root, indexed by [NodeId].
    pub fn reachable_from_root(&self) -> Vec<bool> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![self.root];
        seen[self.root] = true;
        while let Some(n) = stack.pop() {
            for s in &self.succ[n] {
                if !seen[*s] {
                    seen[*s] = true;
                    stack.push(*s);
                }
            }
        }
        seen
    }

    /// Short-circuits every conditional landing pad: predecessors are wired straight to
    /// successors and the pad is deleted. Prepares the graph for SSA construction.
    pub fn remove_conditionals(&mut self) {
        let conds: Vec<NodeId> = self
            .nodes()
            .filter(|(_, b)| b.kind == BlockKind::Cond)
            .map(|(id, _)| id)
            .collect();
        for id in conds {
            for p in self.pred[id].clone() {
                for s in self.succ[id].clone() {
                    self.add_edge(p, s);
                }
            }
            self.remove_node(id);
        }
        self.cond_entry.clear();
    }
}

/// Builds the approximate CFG for the instructions of a program, in address order.
///
/// Three structural cases are processed per instruction: same conditional as the
/// previous one (append to the current block), different conditional (new block, with a
/// [BlockKind::Cond] landing pad when not always-executed), and branches (singleton
/// block wired to its resolved target, an unknown sink, or the pending-jumps table).
pub struct CfgBuilder<'a> {
    program: &'a Program,
    include: Vec<bool>,
}

impl<'a> CfgBuilder<'a> {
    /// Builder over every instruction of the program.
    pub fn new(program: &'a Program) -> Self {
        Self {
            program,
            include: vec![true; program.len()],
        }
    }

    /// Builder over the known instructions only: addresses still holding several
    /// candidates are treated like undefined words and skipped.
    pub fn known_only(program: &'a Program, store: &CandidateStore) -> Self {
        let include = program
            .instructions()
            .iter()
            .map(|i| store.is_known(i.address()))
            .collect();
        Self { program, include }
    }

    pub fn build(self) -> Cfg {
        let mut cfg = Cfg::default();
        cfg.root = cfg.add_node(Block::new(BlockKind::Root));
        cfg.end = cfg.add_node(Block::new(BlockKind::End));

        let mut pending: BTreeMap<usize, Vec<NodeId>> = BTreeMap::new();
        let mut last_cond_field: Option<Condition> = None;
        let mut last_cond_node: Option<NodeId> = None;
        let mut cb = cfg.root;

        for index in 0..self.program.len() {
            if !self.include[index] {
                continue;
            }
            let ins = &self.program.instructions()[index];
            if ins.is_undefined() {
                continue;
            }
            if Some(ins.condition()) == last_cond_field {
                if ins.is_branch() {
                    cb = self.branch_instruction(&mut cfg, Some(cb), None, index, &mut pending);
                    last_cond_field = None;
                } else if let Some(sources) = pending.remove(&index) {
                    // A forward jump lands here: the instruction must open its own
                    // block so the jump edge has somewhere to arrive.
                    let b = cfg.add_node(Block::with_instructions(vec![index]));
                    for s in sources {
                        cfg.add_edge(s, b);
                    }
                    cfg.add_edge(cb, b);
                    cb = b;
                } else {
                    let node = cfg.nodes[cb].as_mut().unwrap();
                    node.instructions.push(index);
                    cfg.location.insert(index, cb);
                }
            } else {
                last_cond_field = Some(ins.condition());
                let (block, cond) =
                    self.branch_conditional(&mut cfg, index, cb, last_cond_node, &mut pending);
                cb = block;
                last_cond_node = cond;
                if ins.is_branch() {
                    self.branch_instruction(&mut cfg, None, Some(cb), index, &mut pending);
                    // Keep branch blocks singletons.
                    last_cond_field = None;
                }
            }
        }

        let end = cfg.end;
        cfg.add_edge(cb, end);
        cfg
    }

    /// Whether control cannot fall out of the block because it ends in a branch. A
    /// branch with link returns to the following instruction, so it does not seal the
    /// block.
    fn seals_block(&self, cfg: &Cfg, id: NodeId) -> bool {
        cfg.node(id)
            .and_then(|b| b.last())
            .map(|i| {
                let ins = &self.program.instructions()[i];
                ins.is_branch() && !ins.is_branch_with_link()
            })
            .unwrap_or(false)
    }

    /// Opens a new block because the conditional field changed.
    fn branch_conditional(
        &self,
        cfg: &mut Cfg,
        index: usize,
        cb: NodeId,
        last_cond_node: Option<NodeId>,
        pending: &mut BTreeMap<usize, Vec<NodeId>>,
    ) -> (NodeId, Option<NodeId>) {
        let ins = &self.program.instructions()[index];
        let b = cfg.add_node(Block::with_instructions(vec![index]));
        if !ins.condition().is_always() {
            // A bifurcation: control may come from the previous block or skip over via
            // the conditional chain.
            let new_cond = cfg.add_node(Block::new(BlockKind::Cond));
            cfg.cond_entry.insert(index, new_cond);
            cfg.add_edge(new_cond, b);
            if !self.seals_block(cfg, cb) {
                cfg.add_edge(cb, new_cond);
            }
            if let Some(last) = last_cond_node {
                cfg.add_edge(last, new_cond);
            }
            if let Some(sources) = pending.remove(&index) {
                for s in sources {
                    cfg.add_edge(s, new_cond);
                }
            }
            (b, Some(new_cond))
        } else {
            if !self.seals_block(cfg, cb) {
                cfg.add_edge(cb, b);
            }
            if let Some(last) = last_cond_node {
                cfg.add_edge(last, b);
            }
            if let Some(sources) = pending.remove(&index) {
                for s in sources {
                    cfg.add_edge(s, b);
                }
            }
            (b, None)
        }
    }

    /// Wires a branch instruction to its destination. Returns the block from which
    /// control continues: the fall-through predecessor for a plain branch, or the
    /// return site of a branch-with-link.
    fn branch_instruction(
        &self,
        cfg: &mut Cfg,
        cb: Option<NodeId>,
        branch: Option<NodeId>,
        index: usize,
        pending: &mut BTreeMap<usize, Vec<NodeId>>,
    ) -> NodeId {
        let branch_node =
            branch.unwrap_or_else(|| cfg.add_node(Block::with_instructions(vec![index])));
        if let Some(cb) = cb {
            cfg.add_edge(cb, branch_node);
        }
        if let Some(sources) = pending.remove(&index) {
            for s in sources {
                cfg.add_edge(s, branch_node);
            }
        }
        let mut result = cb.unwrap_or(branch_node);

        let ins = &self.program.instructions()[index];
        let target = ins
            .branch_to(self.program)
            .and_then(|t| self.program.index_of(t.address()));
        match target {
            None => {
                let unknown = cfg.add_node(Block::new(BlockKind::UnknownBranch));
                let end = cfg.end;
                cfg.add_edge(branch_node, unknown);
                cfg.add_edge(unknown, end);
                // A branch with link resumes at the next instruction after the call
                // returns.
                if ins.is_branch_with_link() {
                    result = unknown;
                }
            }
            Some(target_index) => {
                if ins.is_branch_with_link() {
                    result = branch_node;
                }
                if let Some(cond) = cfg.cond_entry.get(&target_index).copied() {
                    // First instruction of a conditional block: the jump is received by
                    // the conditional landing pad.
                    cfg.add_edge(branch_node, cond);
                } else if let Some(node) = cfg.block_of(target_index) {
                    self.split_node(cfg, node, branch_node, target_index);
                } else {
                    pending.entry(target_index).or_default().push(branch_node);
                }
            }
        }
        result
    }

    /// Splits a block that receives a jump in its middle. The upper half keeps the
    /// original predecessors and flows into the lower half, which receives the jump.
    fn split_node(&self, cfg: &mut Cfg, split: NodeId, branch: NodeId, target_index: usize) {
        let pos = cfg.nodes[split]
            .as_ref()
            .unwrap()
            .instructions
            .iter()
            .position(|i| *i == target_index)
            .unwrap();
        if pos > 0 {
            let node = cfg.nodes[split].as_mut().unwrap();
            let upper: Vec<usize> = node.instructions.drain(..pos).collect();
            let up = cfg.add_node(Block::with_instructions(upper));
            for p in cfg.pred[split].clone() {
                cfg.remove_edge(p, split);
                cfg.add_edge(p, up);
            }
            cfg.add_edge(up, split);
        }
        cfg.add_edge(branch, split);
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockKind, Cfg, CfgBuilder, NodeId};
    use crate::program::Program;

    fn blocks_of_kind(cfg: &Cfg, kind: BlockKind) -> Vec<NodeId> {
        cfg.nodes()
            .filter(|(_, b)| b.kind() == kind)
            .map(|(id, _)| id)
            .collect()
    }

    #[test]
    fn test_split_on_branch_target() {
        // add; add; add; b back to the second add.
        let program =
            Program::from_encodings(0x8000, &[0xe2800001, 0xe2800001, 0xe2800001, 0xeafffffc]);
        let cfg = CfgBuilder::new(&program).build();

        let blocks = blocks_of_kind(&cfg, BlockKind::Block);
        let upper = blocks
            .iter()
            .copied()
            .find(|b| cfg.node(*b).unwrap().instructions == vec![0])
            .expect("upper half missing");
        let lower = blocks
            .iter()
            .copied()
            .find(|b| cfg.node(*b).unwrap().instructions == vec![1, 2])
            .expect("lower half missing");
        let branch = cfg.block_of(3).unwrap();
        assert!(cfg.has_edge(upper, lower));
        assert!(cfg.has_edge(branch, lower));
        assert!(cfg.has_edge(cfg.root(), upper));
    }

    #[test]
    fn test_conditional_creates_landing_pad() {
        // mov; movne; mov
        let program = Program::from_encodings(0x8000, &[0xe3a00000, 0x13a00001, 0xe3a00002]);
        let cfg = CfgBuilder::new(&program).build();

        let conds = blocks_of_kind(&cfg, BlockKind::Cond);
        assert_eq!(conds.len(), 1);
        let cond = conds[0];
        let first = cfg.block_of(0).unwrap();
        let movne = cfg.block_of(1).unwrap();
        let last = cfg.block_of(2).unwrap();
        assert!(cfg.has_edge(first, cond));
        assert!(cfg.has_edge(cond, movne));
        // The conditional chain lets control skip the movne block.
        assert!(cfg.has_edge(cond, last));
        assert!(cfg.has_edge(movne, last));
    }

    #[test]
    fn test_unknown_branch_sinks_to_end() {
        // mov; bx lr
        let program = Program::from_encodings(0x8000, &[0xe3a00000, 0xe12fff1e]);
        let cfg = CfgBuilder::new(&program).build();

        let unknown = blocks_of_kind(&cfg, BlockKind::UnknownBranch);
        assert_eq!(unknown.len(), 1);
        let branch = cfg.block_of(1).unwrap();
        assert!(cfg.has_edge(branch, unknown[0]));
        assert!(cfg.has_edge(unknown[0], cfg.end()));
    }

    #[test]
    fn test_forward_jump_resolves_pending() {
        // b +2 words; mov; mov (branch target is index 2)
        let program = Program::from_encodings(0x8000, &[0xea000000, 0xe3a00001, 0xe3a00002]);
        let cfg = CfgBuilder::new(&program).build();

        let branch = cfg.block_of(0).unwrap();
        let target = cfg.block_of(2).unwrap();
        assert!(cfg.has_edge(branch, target));
        assert_ne!(cfg.block_of(1).unwrap(), target);
    }

    #[test]
    fn test_blocks_share_one_conditional() {
        let program = Program::from_encodings(
            0x8000,
            &[0xe3a00000, 0xe2800001, 0x13a00001, 0x13a00002, 0xe3a00003],
        );
        let cfg = CfgBuilder::new(&program).build();
        for (_, block) in cfg.nodes() {
            if block.kind() == BlockKind::Block {
                let conds: Vec<_> = block
                    .instructions
                    .iter()
                    .map(|i| program.instructions()[*i].condition())
                    .collect();
                assert!(conds.windows(2).all(|w| w[0] == w[1]));
            }
        }
    }

    #[test]
    fn test_end_reachable_and_undefined_skipped() {
        let program = Program::from_encodings(0x8000, &[0xe3a00000, 0xf0000000, 0xe3a00001]);
        let cfg = CfgBuilder::new(&program).build();
        assert!(cfg.block_of(1).is_none());
        let reachable = cfg.reachable_from_root();
        assert!(reachable[cfg.end()]);
    }

    #[test]
    fn test_remove_conditionals_short_circuits() {
        let program = Program::from_encodings(0x8000, &[0xe3a00000, 0x13a00001, 0xe3a00002]);
        let mut cfg = CfgBuilder::new(&program).build();
        let first = cfg.block_of(0).unwrap();
        let movne = cfg.block_of(1).unwrap();
        cfg.remove_conditionals();
        assert!(blocks_of_kind(&cfg, BlockKind::Cond).is_empty());
        assert!(cfg.has_edge(first, movne));
    }

    #[test]
    fn test_branch_with_link_returns_to_next() {
        // mov; bl (calls index 3); mov; mov
        let program = Program::from_encodings(
            0x8000,
            &[0xe3a00000, 0xeb000000, 0xe3a00001, 0xe3a00002],
        );
        let cfg = CfgBuilder::new(&program).build();
        let branch = cfg.block_of(1).unwrap();
        let target = cfg.block_of(3).unwrap();
        let next = cfg.block_of(2).unwrap();
        assert!(cfg.has_edge(branch, target));
        // Control resumes after the call site.
        assert!(cfg.has_edge(branch, next));
    }
}
