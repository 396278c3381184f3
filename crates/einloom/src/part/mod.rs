//! Rank partitioning: how declared ranks split and merge before and during
//! the loop nest.
//!
//! The mapping's partitioning entries build a DAG over ranks. A single-rank
//! chain `M: [uniform_shape(6), uniform_shape(3)]` hangs `M2`, `M1`, `M0`
//! off `M` with strictly decreasing priorities (0 = innermost). Whenever a
//! step boundary touches a dynamic step on either side, the remainder gets
//! an explicit intermediate rank (`K1I`) so it can be re-partitioned once
//! the enclosing loop level is running:
//!
//! ```text
//!   M ──┬─ M2          K ──┬─ K2           (K: two occupancy levels)
//!       ├─ M1              └─ K1I ──┬─ K1
//!       └─ M0                       └─ K0
//! ```
//!
//! Flattening merges a rank tuple through a dedicated vertex:
//! `(M, K0) → flatten → MK0`. The merged rank acts as its own root and may
//! be partitioned further.
//!
//! Each chain (an outgoing-edge-bearing vertex) is classified static or
//! dynamic from its highest-priority edge; the classes are disjoint and
//! cover every chain. Queries over the DAG answer everything the loop order
//! and flow graph need: roots, final rank ids, availability sets, partition
//! boundaries (offset/step siblings), flatten membership, and fixed-point
//! application of the directives to a rank list.

pub(crate) mod graph;

use std::collections::{BTreeMap, BTreeSet};

use crate::coord::CoordMath;
use crate::error::SchedError;
use crate::mapping::{PartOp, Rank};

use graph::{PartGraph, PartIx, PartVertex};

/// A chain key: one rank for split chains, the member tuple for flattening.
pub type ChainKey = Vec<Rank>;

/// The partition DAG plus chain bookkeeping for one Einsum.
#[derive(Debug, Clone)]
pub struct Partitioning {
    graph: PartGraph,
    declared: BTreeSet<Rank>,
    all_parts: Vec<ChainKey>,
    static_parts: BTreeSet<ChainKey>,
    dyn_parts: BTreeSet<ChainKey>,
    leaders: BTreeMap<ChainKey, String>,
}

impl Partitioning {
    /// Builds the partition DAG from mapping entries.
    ///
    /// Entries may reference ranks produced by other entries (the bottom of
    /// a split chain, or a merged flatten rank), so application iterates to
    /// a fixed point; an entry that can never resolve is an error.
    pub fn new(
        entries: &[(Vec<Rank>, Vec<PartOp>)],
        ranks: &[Rank],
        coord: &CoordMath,
    ) -> Result<Self, SchedError> {
        let mut part = Partitioning {
            graph: PartGraph::default(),
            declared: ranks.iter().cloned().collect(),
            all_parts: Vec::new(),
            static_parts: BTreeSet::new(),
            dyn_parts: BTreeSet::new(),
            leaders: BTreeMap::new(),
        };
        for rank in &part.declared {
            part.graph.insert(PartVertex::Rank(rank.clone()));
        }

        let mut pending: Vec<&(Vec<Rank>, Vec<PartOp>)> =
            entries.iter().filter(|(_, ops)| !ops.is_empty()).collect();
        for (key, ops) in &pending {
            validate_ops(key, ops)?;
        }
        while !pending.is_empty() {
            let mut progressed = false;
            let mut still_pending = Vec::new();
            for entry in pending {
                let (key, ops) = entry;
                let applied = if ops[0] == PartOp::Flatten {
                    part.try_flatten(key, coord)?
                } else {
                    part.try_chain(&key[0], ops)?
                };
                if applied {
                    progressed = true;
                } else {
                    still_pending.push(entry);
                }
            }
            if !progressed {
                let (key, _) = still_pending[0];
                return Err(SchedError::UnknownPartRank {
                    rank: key[0].to_string(),
                });
            }
            pending = still_pending;
        }

        part.cache_roots();
        part.classify()?;
        Ok(part)
    }

    // ── chain construction ──────────────────────────────────────────────

    /// Applies one single-rank chain, or reports that its source rank does
    /// not exist yet.
    fn try_chain(&mut self, rank: &Rank, ops: &[PartOp]) -> Result<bool, SchedError> {
        let Some(src) = self.graph.rank_ix(rank) else {
            return Ok(false);
        };
        self.check_chain_source(rank, src)?;

        let n = ops.len();
        let mut src = src;
        let mut dyn_seen = self.graph.meta(src).dyn_derived;
        self.all_parts.push(vec![rank.clone()]);
        for (i, op) in ops.iter().enumerate() {
            let level = (n - i) as u32;
            let top = self.insert_derived(&derived_rank(rank, level, false))?;
            self.graph.add_edge(src, top, Some(op.clone()));
            dyn_seen |= op.is_dynamic();
            let meta = self.graph.meta_mut(top);
            meta.priority = level;
            meta.dyn_derived = dyn_seen;
            // the remainder between two steps materializes at run time when
            // either side is dynamic: the split below it is deferred into
            // the nest, or the remainder itself is an occupancy leftover
            let boundary_dynamic = ops
                .get(i + 1)
                .is_some_and(|next| op.is_dynamic() || next.is_dynamic());
            if boundary_dynamic {
                let name = derived_rank(rank, level - 1, true);
                let interm = self.insert_derived(&name)?;
                self.graph.add_edge(src, interm, None);
                let meta = self.graph.meta_mut(interm);
                meta.priority = level - 1;
                meta.intermediate = true;
                meta.dyn_derived = dyn_seen;
                self.all_parts.push(vec![name]);
                src = interm;
            }
        }
        let bottom = self.insert_derived(&derived_rank(rank, 0, false))?;
        self.graph.add_edge(src, bottom, None);
        let meta = self.graph.meta_mut(bottom);
        meta.priority = 0;
        meta.dyn_derived = dyn_seen;
        Ok(true)
    }

    /// Applies one flatten entry, or reports that a member does not exist
    /// yet. Restrictions on the members are hard errors.
    fn try_flatten(&mut self, key: &[Rank], coord: &CoordMath) -> Result<bool, SchedError> {
        let mut member_ixs = Vec::with_capacity(key.len());
        for member in key {
            match self.graph.rank_ix(member) {
                Some(ix) => member_ixs.push(ix),
                None => return Ok(false),
            }
        }
        for (member, &ix) in key.iter().zip(&member_ixs) {
            if self.graph.meta(ix).flattened {
                return Err(SchedError::flatten(
                    key,
                    format!("{member} is itself the product of flattening"),
                ));
            }
            if !self.graph.chain_children(ix).is_empty() {
                return Err(SchedError::flatten(
                    key,
                    format!("{member} is independently partitioned"),
                ));
            }
            if self.graph.flatten_child(ix).is_some() {
                return Err(SchedError::flatten(
                    key,
                    format!("{member} already belongs to a flatten"),
                ));
            }
            if coord.participates_in_index_math(&member.var()) {
                return Err(SchedError::flatten(
                    key,
                    format!("{member} participates in index math"),
                ));
            }
            if !self.declared.contains(member) && !self.is_chain_bottom(ix) {
                return Err(SchedError::flatten(
                    key,
                    format!("{member} is not a declared rank or the bottom of a split chain"),
                ));
            }
        }

        let merged_name = Rank::new(
            key.iter()
                .map(Rank::as_str)
                .collect::<Vec<_>>()
                .concat(),
        );
        let merged = self.insert_derived(&merged_name)?;
        let flat = self.graph.insert(PartVertex::Flatten(key.to_vec()));
        for &ix in &member_ixs {
            self.graph.add_edge(ix, flat, Some(PartOp::Flatten));
        }
        self.graph.add_edge(flat, merged, Some(PartOp::Flatten));
        let dyn_derived = member_ixs
            .iter()
            .any(|&ix| self.graph.meta(ix).dyn_derived);
        self.graph.meta_mut(flat).dyn_derived = dyn_derived;
        let meta = self.graph.meta_mut(merged);
        meta.flattened = true;
        meta.dyn_derived = dyn_derived;
        self.all_parts.push(key.to_vec());
        Ok(true)
    }

    fn check_chain_source(&self, rank: &Rank, ix: PartIx) -> Result<(), SchedError> {
        if !self.graph.chain_children(ix).is_empty() {
            return Err(SchedError::ConflictingPart {
                rank: rank.to_string(),
            });
        }
        if self.graph.flatten_child(ix).is_some() {
            return Err(SchedError::ConflictingPart {
                rank: rank.to_string(),
            });
        }
        let legal = self.declared.contains(rank)
            || self.graph.meta(ix).flattened
            || self.is_chain_bottom(ix);
        if !legal {
            return Err(SchedError::UnknownPartRank {
                rank: rank.to_string(),
            });
        }
        Ok(())
    }

    /// Residual bottom of a split chain: the priority-0 non-intermediate
    /// child of some source rank.
    fn is_chain_bottom(&self, ix: PartIx) -> bool {
        let meta = self.graph.meta(ix);
        self.graph.chain_parent(ix).is_some() && meta.priority == 0 && !meta.intermediate
    }

    fn insert_derived(&mut self, rank: &Rank) -> Result<PartIx, SchedError> {
        if self.graph.rank_ix(rank).is_some() {
            return Err(SchedError::ConflictingPart {
                rank: rank.to_string(),
            });
        }
        Ok(self.graph.insert(PartVertex::Rank(rank.clone())))
    }

    fn cache_roots(&mut self) {
        for ix in 0..self.graph.len() {
            if self.graph.vertex(ix).rank().is_none() {
                continue;
            }
            let mut cur = ix;
            while let Some(parent) = self.graph.chain_parent(cur) {
                cur = parent;
            }
            self.graph.meta_mut(ix).root = Some(cur);
        }
    }

    fn classify(&mut self) -> Result<(), SchedError> {
        for key in &self.all_parts {
            let dynamic = if key.len() > 1 {
                let flat = self
                    .graph
                    .lookup(&PartVertex::Flatten(key.clone()))
                    .expect("flatten vertex recorded");
                self.graph.meta(flat).dyn_derived
            } else {
                let src = self.graph.rank_ix(&key[0]).expect("chain head recorded");
                let top = self.graph.chain_children(src)[0];
                let edge_op = self
                    .graph
                    .succs(src)
                    .iter()
                    .find(|e| e.to == top)
                    .and_then(|e| e.op.clone())
                    .expect("chain top edge carries its operator");
                if let Some(leader) = edge_op.leader() {
                    self.leaders.insert(key.clone(), leader.to_string());
                }
                edge_op.is_dynamic()
            };
            if dynamic {
                self.dyn_parts.insert(key.clone());
            } else {
                self.static_parts.insert(key.clone());
            }
        }
        Ok(())
    }

    // ── queries ─────────────────────────────────────────────────────────

    /// The originally-declared rank `rank` derives from. Flatten boundaries
    /// are not crossed: the merged rank is its own root. Idempotent.
    pub fn get_root_name(&self, rank: &Rank) -> Rank {
        match self.graph.rank_ix(rank) {
            Some(ix) => {
                let root = self.graph.meta(ix).root.expect("roots cached");
                self.graph
                    .vertex(root)
                    .rank()
                    .expect("root is a rank vertex")
                    .clone()
            }
            None => rank.clone(),
        }
    }

    /// The name `rank` carries once all partitioning applicable to a tensor
    /// holding `tensor_ranks` has run. Walks toward the highest-priority
    /// child; crosses a flatten only when the tensor holds every member.
    pub fn get_final_rank_id(&self, tensor_ranks: &[Rank], rank: &Rank) -> Rank {
        let Some(mut cur) = self.graph.rank_ix(rank) else {
            return rank.clone();
        };
        loop {
            if let Some(flat) = self.graph.flatten_child(cur) {
                let members = self
                    .graph
                    .vertex(flat)
                    .members()
                    .expect("flatten vertex holds members");
                if members.iter().all(|m| tensor_ranks.contains(m)) {
                    let merged = self.graph.succs(flat)[0].to;
                    cur = merged;
                    continue;
                }
                break;
            }
            let children = self.graph.chain_children(cur);
            match children.first() {
                Some(&top) => cur = top,
                None => break,
            }
        }
        self.graph
            .vertex(cur)
            .rank()
            .expect("walk ends on a rank vertex")
            .clone()
    }

    /// Every rank whose coordinate is determined once `rank` is iterated:
    /// `rank` itself, each ancestor reached while sitting on the
    /// lowest-priority (absolute-coordinate) side of its chain, and, across
    /// a flatten boundary, all members at once.
    pub fn get_available(&self, rank: &Rank) -> BTreeSet<Rank> {
        let mut avail = BTreeSet::new();
        let Some(start) = self.graph.rank_ix(rank) else {
            avail.insert(rank.clone());
            return avail;
        };
        let mut stack = vec![start];
        while let Some(cur) = stack.pop() {
            if let Some(r) = self.graph.vertex(cur).rank() {
                if !avail.insert(r.clone()) {
                    continue;
                }
            }
            if let Some(parent) = self.graph.chain_parent(cur) {
                let children = self.graph.chain_children(parent);
                if children.last() == Some(&cur) {
                    stack.push(parent);
                }
            } else if let Some(flat) = self.graph.flatten_parent(cur) {
                for &member in self.graph.preds(flat) {
                    stack.push(member);
                }
            }
        }
        avail
    }

    /// Names produced by one chain, innermost first. `all_levels` expands
    /// intermediates down to the leaves.
    pub fn partition_names(&self, key: &[Rank], all_levels: bool) -> Result<Vec<Rank>, SchedError> {
        if !self.partition_rank(key) {
            return Err(SchedError::NotPartitioned {
                key: display_key(key),
            });
        }
        let src = if key.len() > 1 {
            let flat = self
                .graph
                .lookup(&PartVertex::Flatten(key.to_vec()))
                .expect("flatten vertex recorded");
            let merged = self.graph.succs(flat)[0].to;
            if !all_levels || self.graph.chain_children(merged).is_empty() {
                return Ok(vec![self.vertex_rank(merged)]);
            }
            merged
        } else {
            self.graph.rank_ix(&key[0]).expect("chain head recorded")
        };
        let mut names = Vec::new();
        if all_levels {
            self.collect_leaves(src, &mut names);
        } else {
            for &child in self.graph.chain_children(src).iter().rev() {
                names.push(self.vertex_rank(child));
            }
        }
        Ok(names)
    }

    fn collect_leaves(&self, ix: PartIx, out: &mut Vec<Rank>) {
        for &child in self.graph.chain_children(ix).iter().rev() {
            if self.graph.chain_children(child).is_empty() {
                out.push(self.vertex_rank(child));
            } else {
                self.collect_leaves(child, out);
            }
        }
    }

    /// True when `key` names one of the mapping's chains.
    pub fn partition_rank(&self, key: &[Rank]) -> bool {
        self.all_parts.iter().any(|k| k == key)
    }

    pub fn get_all_parts(&self) -> &[ChainKey] {
        &self.all_parts
    }

    pub fn static_parts(&self) -> &BTreeSet<ChainKey> {
        &self.static_parts
    }

    pub fn dyn_parts(&self) -> &BTreeSet<ChainKey> {
        &self.dyn_parts
    }

    pub fn is_static(&self, key: &[Rank]) -> bool {
        self.static_parts.contains(key)
    }

    pub fn is_dynamic(&self, key: &[Rank]) -> bool {
        self.dyn_parts.contains(key)
    }

    /// Sibling one priority level above `rank`, used as the enclosing
    /// coordinate when computing partition boundaries.
    pub fn get_offset(&self, rank: &Rank) -> Option<Rank> {
        self.sibling(rank, -1)
    }

    /// Sibling one priority level below `rank`: the units its partition
    /// boundaries step in.
    pub fn get_step(&self, rank: &Rank) -> Option<Rank> {
        self.sibling(rank, 1)
    }

    fn sibling(&self, rank: &Rank, direction: isize) -> Option<Rank> {
        let ix = self.graph.rank_ix(rank)?;
        let parent = self.graph.chain_parent(ix)?;
        let siblings = self.graph.chain_children(parent);
        let pos = siblings.iter().position(|&s| s == ix)? as isize;
        let target = pos + direction;
        if target < 0 {
            return None;
        }
        siblings.get(target as usize).map(|&s| self.vertex_rank(s))
    }

    pub fn is_flattened(&self, rank: &Rank) -> bool {
        self.graph
            .rank_ix(rank)
            .map(|ix| self.graph.meta(ix).flattened)
            .unwrap_or(false)
    }

    /// Member tuple of a merged rank.
    pub fn unpack(&self, rank: &Rank) -> Result<Vec<Rank>, SchedError> {
        let not_flattened = || SchedError::NotFlattened {
            rank: rank.to_string(),
        };
        let ix = self.graph.rank_ix(rank).ok_or_else(not_flattened)?;
        let flat = self.graph.flatten_parent(ix).ok_or_else(not_flattened)?;
        Ok(self
            .graph
            .vertex(flat)
            .members()
            .expect("flatten vertex holds members")
            .to_vec())
    }

    /// Occupancy leader tensor of a dynamic chain.
    pub fn get_leader(&self, key: &[Rank]) -> Result<&str, SchedError> {
        self.leaders
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| SchedError::NoLeader {
                key: display_key(key),
            })
    }

    pub fn is_intermediate(&self, rank: &Rank) -> bool {
        self.graph
            .rank_ix(rank)
            .map(|ix| self.graph.meta(ix).intermediate)
            .unwrap_or(false)
    }

    /// Rank whose chain produced `rank`, if any. Merged ranks have none:
    /// their predecessor is the flatten vertex.
    pub fn chain_parent(&self, rank: &Rank) -> Option<Rank> {
        let ix = self.graph.rank_ix(rank)?;
        self.graph.chain_parent(ix).map(|p| self.vertex_rank(p))
    }

    /// True for unpartitioned ranks and for the lowest-priority member of
    /// its sibling chain (the side carrying absolute coordinates).
    pub fn is_innermost(&self, rank: &Rank) -> bool {
        let Some(ix) = self.graph.rank_ix(rank) else {
            return true;
        };
        match self.graph.chain_parent(ix) {
            Some(parent) => self.graph.chain_children(parent).last() == Some(&ix),
            None => true,
        }
    }

    /// True when every boundary above `rank` is known before the nest runs.
    pub fn is_static_bounded(&self, rank: &Rank) -> bool {
        self.graph
            .rank_ix(rank)
            .map(|ix| !self.graph.meta(ix).dyn_derived)
            .unwrap_or(true)
    }

    /// Chains from `keys` applicable to `ranks` right now. Flatten members
    /// must be present, and contiguous in member order unless a swizzle is
    /// allowed to make them so.
    pub fn get_valid_parts<'k>(
        &self,
        ranks: &[Rank],
        keys: impl IntoIterator<Item = &'k ChainKey>,
        allow_swizzle: bool,
    ) -> Vec<ChainKey> {
        keys.into_iter()
            .filter(|key| match key.as_slice() {
                [single] => ranks.contains(single),
                members => {
                    members.iter().all(|m| ranks.contains(m))
                        && (allow_swizzle || is_contiguous(ranks, members))
                }
            })
            .cloned()
            .collect()
    }

    /// Applies every applicable chain from `keys` to `ranks` until nothing
    /// more applies. Rank lists are outermost first.
    pub fn partition_ranks(
        &self,
        ranks: &[Rank],
        keys: &[ChainKey],
        all_levels: bool,
        allow_swizzle: bool,
    ) -> Result<Vec<Rank>, SchedError> {
        let mut out = ranks.to_vec();
        loop {
            let valid = self.get_valid_parts(&out, keys.iter(), allow_swizzle);
            if valid.is_empty() {
                return Ok(out);
            }
            for key in valid {
                let mut produced = self.partition_names(&key, all_levels)?;
                produced.reverse();
                if key.len() > 1 && !is_contiguous(&out, &key) {
                    out = self.swizzle_for_flattening(&out);
                }
                let at = out
                    .iter()
                    .position(|r| *r == key[0])
                    .expect("validated source rank present");
                out.splice(at..at + key.len(), produced);
            }
        }
    }

    /// Reorders `ranks` so the members of every applicable flatten sit
    /// adjacent in member order. The group lands at the first member
    /// occurrence, unless a member only exists once an in-nest split has
    /// run, in which case it lands at the last occurrence so the merge
    /// stays below everything that produces its members.
    pub fn swizzle_for_flattening(&self, ranks: &[Rank]) -> Vec<Rank> {
        let mut out = ranks.to_vec();
        for key in &self.all_parts {
            if key.len() < 2 || !key.iter().all(|m| out.contains(m)) {
                continue;
            }
            if is_contiguous(&out, key) {
                continue;
            }
            let positions: Vec<usize> = key
                .iter()
                .map(|m| out.iter().position(|r| r == m).expect("members present"))
                .collect();
            let in_nest = key.iter().any(|m| {
                self.chain_parent(m)
                    .is_some_and(|p| self.is_intermediate(&p))
            });
            let target = if in_nest {
                *positions.iter().max().expect("members present")
            } else {
                *positions.iter().min().expect("members present")
            };
            let anchor = target - positions.iter().filter(|&&p| p < target).count();
            out.retain(|r| !key.contains(r));
            out.splice(anchor..anchor, key.iter().cloned());
        }
        out
    }

    fn vertex_rank(&self, ix: PartIx) -> Rank {
        self.graph
            .vertex(ix)
            .rank()
            .expect("expected a rank vertex")
            .clone()
    }
}

fn validate_ops(key: &[Rank], ops: &[PartOp]) -> Result<(), SchedError> {
    let has_flatten = ops.contains(&PartOp::Flatten);
    if has_flatten {
        if ops.len() != 1 {
            return Err(SchedError::flatten(
                key,
                "flatten() must be the only operator in its list",
            ));
        }
        if key.len() < 2 {
            return Err(SchedError::flatten(key, "needs at least two ranks"));
        }
        return Ok(());
    }
    if key.len() != 1 {
        return Err(SchedError::flatten(
            key,
            "a rank tuple accepts only flatten()",
        ));
    }
    // shape splits of a runtime remainder are fine; a count-based split
    // is not, its piece count presumes a known extent
    let mut dyn_seen = false;
    for op in ops {
        if dyn_seen && matches!(op, PartOp::NWayShape { .. }) {
            return Err(SchedError::NWayAfterDynamic {
                rank: key[0].to_string(),
            });
        }
        dyn_seen |= op.is_dynamic();
    }
    Ok(())
}

fn derived_rank(rank: &Rank, level: u32, intermediate: bool) -> Rank {
    if intermediate {
        Rank::new(format!("{rank}{level}I"))
    } else {
        Rank::new(format!("{rank}{level}"))
    }
}

fn display_key(key: &[Rank]) -> String {
    key.iter()
        .map(Rank::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_contiguous(ranks: &[Rank], members: &[Rank]) -> bool {
    ranks
        .windows(members.len())
        .any(|window| window == members)
}
