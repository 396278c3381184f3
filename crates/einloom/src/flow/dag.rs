//! Arena storage for the flow graph.
//!
//! Nodes live in a vector with a hash index giving structural identity;
//! adjacency is by integer index in both directions. Removal tombstones
//! the slot so indices stay stable across pruning.

use std::collections::{BTreeSet, HashMap};

use smallvec::SmallVec;

use super::node::FlowNode;

pub(crate) type NodeIx = usize;

#[derive(Debug, Clone, Default)]
pub(crate) struct FlowDag {
    nodes: Vec<FlowNode>,
    index: HashMap<FlowNode, NodeIx>,
    succs: Vec<SmallVec<[NodeIx; 4]>>,
    preds: Vec<SmallVec<[NodeIx; 4]>>,
    alive: Vec<bool>,
}

impl FlowDag {
    /// Index of `node`, inserting it if unseen.
    pub(crate) fn insert(&mut self, node: FlowNode) -> NodeIx {
        if let Some(&ix) = self.index.get(&node) {
            return ix;
        }
        let ix = self.nodes.len();
        self.index.insert(node.clone(), ix);
        self.nodes.push(node);
        self.succs.push(SmallVec::new());
        self.preds.push(SmallVec::new());
        self.alive.push(true);
        ix
    }

    pub(crate) fn node(&self, ix: NodeIx) -> &FlowNode {
        &self.nodes[ix]
    }

    pub(crate) fn add_edge(&mut self, from: NodeIx, to: NodeIx) {
        if self.succs[from].contains(&to) {
            return;
        }
        self.succs[from].push(to);
        self.preds[to].push(from);
    }

    pub(crate) fn alive_nodes(&self) -> impl Iterator<Item = NodeIx> + '_ {
        (0..self.nodes.len()).filter(|&ix| self.alive[ix])
    }

    pub(crate) fn node_count(&self) -> usize {
        self.alive.iter().filter(|&&a| a).count()
    }

    pub(crate) fn edge_count(&self) -> usize {
        self.alive_nodes().map(|ix| self.succs[ix].len()).sum()
    }

    pub(crate) fn succs(&self, ix: NodeIx) -> &[NodeIx] {
        &self.succs[ix]
    }

    pub(crate) fn preds(&self, ix: NodeIx) -> &[NodeIx] {
        &self.preds[ix]
    }

    /// Removes a node, reconnecting every predecessor to every successor.
    pub(crate) fn remove_bridging(&mut self, ix: NodeIx) {
        let preds: SmallVec<[NodeIx; 4]> = self.preds[ix].clone();
        let succs: SmallVec<[NodeIx; 4]> = self.succs[ix].clone();
        for &p in &preds {
            self.succs[p].retain(|s| *s != ix);
        }
        for &s in &succs {
            self.preds[s].retain(|p| *p != ix);
        }
        for &p in &preds {
            for &s in &succs {
                if p != s {
                    self.add_edge(p, s);
                }
            }
        }
        self.index.remove(&self.nodes[ix]);
        self.succs[ix].clear();
        self.preds[ix].clear();
        self.alive[ix] = false;
    }

    /// Every node reachable from `start` along successor edges, excluding
    /// `start` itself.
    pub(crate) fn reachable_from(&self, start: NodeIx) -> BTreeSet<NodeIx> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<NodeIx> = self.succs[start].to_vec();
        while let Some(ix) = stack.pop() {
            if seen.insert(ix) {
                stack.extend(self.succs[ix].iter().copied());
            }
        }
        seen
    }
}
