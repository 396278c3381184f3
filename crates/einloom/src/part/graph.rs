//! Arena storage for the partition graph.
//!
//! Vertices are identified structurally: inserting the same rank (or the
//! same flatten tuple) twice yields the same index. Edges point from a
//! source rank to the ranks it splits into, labelled with the operator that
//! produced the child (`None` for the residual bottom of a chain), and from
//! flatten members through the flatten vertex to the merged rank. Per-vertex
//! metadata lives in a parallel vector keyed by the same index.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::mapping::{PartOp, Rank};

pub(crate) type PartIx = usize;

/// A vertex of the partition graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartVertex {
    /// A concrete rank, declared or derived.
    Rank(Rank),
    /// The merge point of a flatten directive, keyed by its member tuple.
    Flatten(Vec<Rank>),
}

impl PartVertex {
    pub fn rank(&self) -> Option<&Rank> {
        match self {
            PartVertex::Rank(rank) => Some(rank),
            PartVertex::Flatten(_) => None,
        }
    }

    pub fn members(&self) -> Option<&[Rank]> {
        match self {
            PartVertex::Rank(_) => None,
            PartVertex::Flatten(members) => Some(members),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PartEdge {
    pub to: PartIx,
    /// Operator that produced the child; `None` marks the residual bottom
    /// rank and the member side of a flatten.
    pub op: Option<PartOp>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct VertexMeta {
    /// Position within the sibling chain, 0 = innermost.
    pub priority: u32,
    /// Cached root vertex, filled once construction settles.
    pub root: Option<PartIx>,
    /// Merged product of a flatten directive.
    pub flattened: bool,
    /// Auto-inserted remainder awaiting further partitioning.
    pub intermediate: bool,
    /// Derived (directly or transitively) through a dynamic split.
    pub dyn_derived: bool,
}

/// Index-based DAG with structural vertex identity.
#[derive(Debug, Clone, Default)]
pub(crate) struct PartGraph {
    vertices: Vec<PartVertex>,
    index: HashMap<PartVertex, PartIx>,
    succs: Vec<SmallVec<[PartEdge; 4]>>,
    preds: Vec<SmallVec<[PartIx; 2]>>,
    meta: Vec<VertexMeta>,
}

impl PartGraph {
    pub fn insert(&mut self, vertex: PartVertex) -> PartIx {
        if let Some(&ix) = self.index.get(&vertex) {
            return ix;
        }
        let ix = self.vertices.len();
        self.index.insert(vertex.clone(), ix);
        self.vertices.push(vertex);
        self.succs.push(SmallVec::new());
        self.preds.push(SmallVec::new());
        self.meta.push(VertexMeta::default());
        ix
    }

    pub fn lookup(&self, vertex: &PartVertex) -> Option<PartIx> {
        self.index.get(vertex).copied()
    }

    pub fn rank_ix(&self, rank: &Rank) -> Option<PartIx> {
        self.lookup(&PartVertex::Rank(rank.clone()))
    }

    pub fn add_edge(&mut self, from: PartIx, to: PartIx, op: Option<PartOp>) {
        self.succs[from].push(PartEdge { to, op });
        self.preds[to].push(from);
    }

    pub fn vertex(&self, ix: PartIx) -> &PartVertex {
        &self.vertices[ix]
    }

    pub fn succs(&self, ix: PartIx) -> &[PartEdge] {
        &self.succs[ix]
    }

    pub fn preds(&self, ix: PartIx) -> &[PartIx] {
        &self.preds[ix]
    }

    pub fn meta(&self, ix: PartIx) -> &VertexMeta {
        &self.meta[ix]
    }

    pub fn meta_mut(&mut self, ix: PartIx) -> &mut VertexMeta {
        &mut self.meta[ix]
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// Rank children of `ix` sorted by descending priority (outermost first).
    pub fn chain_children(&self, ix: PartIx) -> Vec<PartIx> {
        let mut children: Vec<PartIx> = self.succs[ix]
            .iter()
            .map(|e| e.to)
            .filter(|&c| matches!(self.vertices[c], PartVertex::Rank(_)))
            .collect();
        children.sort_by(|&a, &b| self.meta[b].priority.cmp(&self.meta[a].priority));
        children
    }

    /// The single rank-vertex parent of `ix`, if any. Flatten vertices are
    /// not rank parents; the merged rank of a flatten has none.
    pub fn chain_parent(&self, ix: PartIx) -> Option<PartIx> {
        self.preds[ix]
            .iter()
            .copied()
            .find(|&p| matches!(self.vertices[p], PartVertex::Rank(_)))
    }

    /// The flatten vertex producing `ix`, when `ix` is a merged rank.
    pub fn flatten_parent(&self, ix: PartIx) -> Option<PartIx> {
        self.preds[ix]
            .iter()
            .copied()
            .find(|&p| matches!(self.vertices[p], PartVertex::Flatten(_)))
    }

    /// The flatten vertex `ix` feeds, when `ix` is a member of one.
    pub fn flatten_child(&self, ix: PartIx) -> Option<PartIx> {
        self.succs[ix]
            .iter()
            .map(|e| e.to)
            .find(|&c| matches!(self.vertices[c], PartVertex::Flatten(_)))
    }
}
