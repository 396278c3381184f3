//! Concrete loop order for one Einsum.
//!
//! The default order is output ranks followed by summation ranks, with
//! every partition chain expanded in place down to its leaves. An explicit
//! order must be a permutation of that same leaf universe. On top of the
//! stored order sits the readiness predicate `is_ready`: the earliest loop
//! position at which a tensor rank can be iterated in step with the nest,
//! which drives both rank-order application to tensors and the
//! concordant/discordant walk.

use std::collections::BTreeSet;

use crate::coord::CoordMath;
use crate::error::SchedError;
use crate::mapping::Rank;
use crate::part::Partitioning;
use crate::tensor::Tensor;

#[derive(Debug, Clone, Default)]
pub struct LoopOrder {
    ranks: Option<Vec<Rank>>,
}

impl LoopOrder {
    pub fn new() -> Self {
        LoopOrder::default()
    }

    /// Fixes the loop order. `explicit` of `None` derives the default
    /// order from `default_seed` (output ranks then summation ranks); an
    /// explicit order must be a permutation of the expanded universe.
    pub fn add(
        &mut self,
        explicit: Option<Vec<Rank>>,
        default_seed: &[Rank],
        part: &Partitioning,
    ) -> Result<(), SchedError> {
        let expanded = part.partition_ranks(default_seed, part.get_all_parts(), true, true)?;
        match explicit {
            None => self.ranks = Some(expanded),
            Some(order) => {
                let mut want = expanded.clone();
                let mut have = order.clone();
                want.sort();
                have.sort();
                if want != have {
                    return Err(SchedError::LoopOrder {
                        detail: format!(
                            "order [{}] is not a permutation of [{}]",
                            join(&order),
                            join(&expanded)
                        ),
                    });
                }
                self.ranks = Some(order);
            }
        }
        Ok(())
    }

    /// Final loop ranks, outermost first.
    pub fn ranks(&self) -> &[Rank] {
        self.ranks
            .as_deref()
            .expect("LoopOrder::ranks queried before add")
    }

    pub fn position(&self, rank: &Rank) -> Option<usize> {
        self.ranks().iter().position(|r| r == rank)
    }

    /// Whether a tensor rank (already its final partitioned id) can be
    /// iterated in step with loop position `pos`.
    ///
    /// A rank on the boundary side of its chain is ready exactly at its
    /// siblings' loop levels. An innermost chain member (or an
    /// unpartitioned or merged rank) needs every index variable of its
    /// root's translation supplied by chain-innermost loop ranks at or
    /// before `pos`, with the rank at `pos` itself one of the required
    /// variables. Variables hidden inside a merged loop rank do not count:
    /// their coordinates come back out of order, which is what the
    /// discordant path is for.
    pub fn is_ready(
        &self,
        part: &Partitioning,
        coord: &CoordMath,
        rank: &Rank,
        pos: usize,
    ) -> Result<bool, SchedError> {
        let loop_ranks = self.ranks();
        if pos >= loop_ranks.len() {
            return Ok(false);
        }
        if !part.is_innermost(rank) {
            let parent = part.chain_parent(rank);
            return Ok(part.chain_parent(&loop_ranks[pos]) == parent);
        }

        let root = part.get_root_name(rank);
        let need: BTreeSet<String> = coord
            .get_trans(&root.var())?
            .atoms()
            .map(str::to_string)
            .collect();
        if !part.is_innermost(&loop_ranks[pos])
            || !need.contains(&part.get_root_name(&loop_ranks[pos]).var())
        {
            return Ok(false);
        }
        let mut have = BTreeSet::new();
        for loop_rank in &loop_ranks[..=pos] {
            if part.is_innermost(loop_rank) {
                have.insert(part.get_root_name(loop_rank).var());
            }
        }
        Ok(need.is_subset(&have))
    }

    /// Earliest position at which `rank` is ready, or `None` for ranks
    /// only reachable discordantly.
    pub fn first_ready(
        &self,
        part: &Partitioning,
        coord: &CoordMath,
        rank: &Rank,
    ) -> Result<Option<usize>, SchedError> {
        for pos in 0..self.ranks().len() {
            if self.is_ready(part, coord, rank, pos)? {
                return Ok(Some(pos));
            }
        }
        Ok(None)
    }

    /// Reorders the tensor's unconsumed ranks to match the loop: stable
    /// sort by the first position at which each rank's final id is ready,
    /// never-ready ranks last.
    pub fn apply(
        &self,
        part: &Partitioning,
        coord: &CoordMath,
        tensor: &mut Tensor,
    ) -> Result<(), SchedError> {
        let consumed = tensor.ranks().len() - tensor.remaining().len();
        let mut keyed = Vec::with_capacity(tensor.remaining().len());
        for rank in tensor.remaining() {
            let final_id = part.get_final_rank_id(tensor.ranks(), rank);
            let pos = self
                .first_ready(part, coord, &final_id)?
                .unwrap_or(usize::MAX);
            keyed.push((pos, rank.clone()));
        }
        keyed.sort_by_key(|(pos, _)| *pos);
        let mut ranks = tensor.ranks()[..consumed].to_vec();
        ranks.extend(keyed.into_iter().map(|(_, rank)| rank));
        tensor.update_ranks(ranks);
        Ok(())
    }

    /// Index variables supplied by iterating `rank`: the innermost leaf
    /// of a merged chain carries tuple coordinates and stands in for the
    /// flatten members, anything else for itself. Outer pieces of a
    /// further-split merged rank supply nothing extra, their coordinates
    /// unpack only at the bottom.
    pub fn get_iter_ranks(&self, part: &Partitioning, rank: &Rank) -> Vec<Rank> {
        let root = part.get_root_name(rank);
        if part.is_flattened(&root)
            && part.is_innermost(rank)
            && !part.partition_rank(std::slice::from_ref(rank))
        {
            part.unpack(&root).expect("flattened root unpacks")
        } else {
            vec![rank.clone()]
        }
    }
}

fn join(ranks: &[Rank]) -> String {
    ranks
        .iter()
        .map(Rank::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
