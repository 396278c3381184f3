//! Cursor-based walk over the loop nest.
//!
//! One position per loop rank, advanced by `pop_concord`. At each level the
//! concordant set is every tensor whose next unconsumed rank (by final
//! partitioned id) is ready right here; those tensors advance in step with
//! the nest. Tensors left behind are picked up by `peek_discord`: their
//! next rank's coordinate is determined by enclosing loops (it sits in the
//! availability set) but arrives out of storage order, so they need the
//! eager/projected access path. Flattening is the usual culprit.

use std::collections::BTreeSet;

use crate::error::SchedError;
use crate::mapping::Rank;
use crate::program::{Program, TensorId};

#[derive(Debug, Clone)]
pub struct IterationGraph {
    loop_ranks: Vec<Rank>,
    /// `available[i]` is the union of rank availability over positions
    /// `0..=i`.
    available: Vec<BTreeSet<Rank>>,
    pos: usize,
}

impl IterationGraph {
    pub fn new(program: &Program) -> Self {
        let loop_ranks = program.loop_order().ranks().to_vec();
        let part = program.partitioning();
        let mut available = Vec::with_capacity(loop_ranks.len());
        let mut acc = BTreeSet::new();
        for rank in &loop_ranks {
            acc.extend(part.get_available(rank));
            available.push(acc.clone());
        }
        IterationGraph {
            loop_ranks,
            available,
            pos: 0,
        }
    }

    pub fn cursor(&self) -> usize {
        self.pos
    }

    /// Earliest position whose availability covers `rank`.
    pub fn first_available(&self, rank: &Rank) -> Option<usize> {
        self.available.iter().position(|set| set.contains(rank))
    }

    pub fn loop_ranks(&self) -> &[Rank] {
        &self.loop_ranks
    }

    /// Loop rank at the cursor and the tensors that iterate in step with
    /// it. Past the last level the rank is `None` and no tensor advances.
    pub fn peek_concord(
        &self,
        program: &Program,
    ) -> Result<(Option<Rank>, Vec<TensorId>), SchedError> {
        let Some(loop_rank) = self.loop_ranks.get(self.pos) else {
            return Ok((None, Vec::new()));
        };
        let part = program.partitioning();
        let coord = program.coord_math();
        let order = program.loop_order();
        let mut ids = Vec::new();
        for (id, tensor) in program.tensors().iter().enumerate() {
            let Some(next) = tensor.peek() else {
                continue;
            };
            let final_id = part.get_final_rank_id(tensor.ranks(), next);
            if order.is_ready(part, coord, &final_id, self.pos)? {
                ids.push(id);
            }
        }
        Ok((Some(loop_rank.clone()), ids))
    }

    /// `peek_concord`, then advances the cursor and each selected tensor.
    pub fn pop_concord(
        &mut self,
        program: &mut Program,
    ) -> Result<(Option<Rank>, Vec<TensorId>), SchedError> {
        let (rank, ids) = self.peek_concord(program)?;
        for &id in &ids {
            program.tensor_mut(id).pop()?;
        }
        if rank.is_some() {
            self.pos += 1;
        }
        Ok((rank, ids))
    }

    /// Tensors needing a projected, out-of-order access at this point: the
    /// next rank's coordinate was determined by the levels already entered
    /// yet the rank was not concordantly ready. Returns each such tensor
    /// with the maximal prefix of its remaining final rank ids covered by
    /// that availability.
    pub fn peek_discord(
        &self,
        program: &Program,
    ) -> Result<Vec<(TensorId, Vec<Rank>)>, SchedError> {
        if self.pos == 0 {
            return Err(SchedError::LoopOrder {
                detail: "discordant peek before entering the nest".into(),
            });
        }
        let avail = &self.available[self.pos - 1];
        let part = program.partitioning();
        let coord = program.coord_math();
        let order = program.loop_order();
        let mut out = Vec::new();
        for (id, tensor) in program.tensors().iter().enumerate() {
            let Some(next) = tensor.peek() else {
                continue;
            };
            let final_id = part.get_final_rank_id(tensor.ranks(), next);
            if !avail.contains(&final_id)
                || order.is_ready(part, coord, &final_id, self.pos - 1)?
            {
                continue;
            }
            let mut prefix = Vec::new();
            for rank in tensor.remaining() {
                let fid = part.get_final_rank_id(tensor.ranks(), rank);
                if avail.contains(&fid) {
                    prefix.push(fid);
                } else {
                    break;
                }
            }
            out.push((id, prefix));
        }
        Ok(out)
    }
}
