//! Control-flow graph over the block database: edges, iterative dominators,
//! natural-loop detection and reachability.

use super::blocks::{CodeDatabase, ExitKind};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone, Default)]
pub struct CfgNode {
    pub predecessors: BTreeSet<u16>,
    pub successors: BTreeSet<u16>,
}

/// A natural loop: every back edge `(u -> header)` plus the set of nodes
/// that can reach `u` without passing through the header.
#[derive(Debug, Clone)]
pub struct Loop {
    pub header: u16,
    pub body: BTreeSet<u16>,
    pub back_edges: Vec<(u16, u16)>,
}

#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    pub nodes: BTreeMap<u16, CfgNode>,
    pub entry: u16,
    pub dominators: BTreeMap<u16, BTreeSet<u16>>,
    pub loops: Vec<Loop>,
}

pub const ENTRY_POINT: u16 = 0x0100;

impl ControlFlowGraph {
    pub fn build(db: &CodeDatabase) -> ControlFlowGraph {
        let mut nodes: BTreeMap<u16, CfgNode> = db
            .blocks
            .keys()
            .map(|&addr| (addr, CfgNode::default()))
            .collect();

        // Edges derive from the exit kind. Return/halt/indirect blocks have
        // no static successors; the dispatcher picks up from runtime state.
        let mut edges: Vec<(u16, u16)> = Vec::new();
        for (&start, block) in &db.blocks {
            let mut successors: Vec<u16> = Vec::new();
            match block.exit {
                ExitKind::Jump => successors.extend(&block.targets),
                ExitKind::Branch | ExitKind::Call => {
                    successors.extend(&block.targets);
                    successors.push(block.next_addr());
                }
                ExitKind::Fallthrough => {
                    if block.targets.is_empty() {
                        successors.push(block.next_addr());
                    } else {
                        successors.extend(&block.targets);
                    }
                }
                ExitKind::Return | ExitKind::Halt | ExitKind::Indirect => {}
            }
            for succ in successors {
                // Keep the graph closed over analyzed blocks.
                if db.blocks.contains_key(&succ) {
                    edges.push((start, succ));
                }
            }
        }
        for (from, to) in edges {
            nodes.get_mut(&from).unwrap().successors.insert(to);
            nodes.get_mut(&to).unwrap().predecessors.insert(from);
        }

        let mut cfg = ControlFlowGraph {
            nodes,
            entry: ENTRY_POINT,
            dominators: BTreeMap::new(),
            loops: Vec::new(),
        };
        cfg.compute_dominators();
        cfg.detect_loops();
        cfg
    }

    /// Blocks reachable from the entry point, in BFS order.
    pub fn reachable(&self) -> Vec<u16> {
        let mut order = Vec::new();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        if self.nodes.contains_key(&self.entry) {
            queue.push_back(self.entry);
            seen.insert(self.entry);
        }
        while let Some(addr) = queue.pop_front() {
            order.push(addr);
            for &succ in &self.nodes[&addr].successors {
                if seen.insert(succ) {
                    queue.push_back(succ);
                }
            }
        }
        order
    }

    /// Classic iterative dominator computation: entry is dominated by itself
    /// only, every other node starts dominated by all nodes and is narrowed
    /// by intersecting its predecessors' sets.
    fn compute_dominators(&mut self) {
        let reachable = self.reachable();
        if reachable.is_empty() {
            return;
        }
        let all: BTreeSet<u16> = reachable.iter().copied().collect();
        for &addr in &reachable {
            if addr == self.entry {
                self.dominators.insert(addr, BTreeSet::from([addr]));
            } else {
                self.dominators.insert(addr, all.clone());
            }
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &addr in &reachable {
                if addr == self.entry {
                    continue;
                }
                let mut new_set: Option<BTreeSet<u16>> = None;
                for &pred in &self.nodes[&addr].predecessors {
                    let Some(pred_doms) = self.dominators.get(&pred) else {
                        continue; // unreachable predecessor
                    };
                    new_set = Some(match new_set {
                        None => pred_doms.clone(),
                        Some(acc) => acc.intersection(pred_doms).copied().collect(),
                    });
                }
                let mut new_set = new_set.unwrap_or_default();
                new_set.insert(addr);
                if self.dominators[&addr] != new_set {
                    self.dominators.insert(addr, new_set);
                    changed = true;
                }
            }
        }
    }

    /// Finds back edges `(u -> v)` with `v ∈ dom(u)` and groups them into
    /// natural loops by header. Nested loops appear as overlapping bodies.
    fn detect_loops(&mut self) {
        let mut by_header: BTreeMap<u16, Vec<u16>> = BTreeMap::new();
        for (&u, node) in &self.nodes {
            let Some(doms) = self.dominators.get(&u) else {
                continue;
            };
            for &v in &node.successors {
                if doms.contains(&v) {
                    by_header.entry(v).or_default().push(u);
                }
            }
        }

        for (header, tails) in by_header {
            let mut body = BTreeSet::from([header]);
            // Walk predecessors backwards from each tail, never crossing the
            // header.
            let mut queue: VecDeque<u16> = tails.iter().copied().collect();
            while let Some(addr) = queue.pop_front() {
                if addr == header || !body.insert(addr) {
                    continue;
                }
                for &pred in &self.nodes[&addr].predecessors {
                    queue.push_back(pred);
                }
            }
            self.loops.push(Loop {
                header,
                body,
                back_edges: tails.into_iter().map(|tail| (tail, header)).collect(),
            });
        }
    }

    pub fn successors(&self, addr: u16) -> impl Iterator<Item = u16> + '_ {
        self.nodes
            .get(&addr)
            .into_iter()
            .flat_map(|n| n.successors.iter().copied())
    }

    pub fn predecessors(&self, addr: u16) -> impl Iterator<Item = u16> + '_ {
        self.nodes
            .get(&addr)
            .into_iter()
            .flat_map(|n| n.predecessors.iter().copied())
    }
}
