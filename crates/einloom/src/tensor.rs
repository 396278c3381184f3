//! Tensor state threaded through scheduling.
//!
//! A `Tensor` is not data: it is the rank bookkeeping the scheduler needs
//! while walking one Einsum. The current rank list starts as the declared
//! ranks, gets rewritten by partitioning and loop-order application, and is
//! consumed front to back by the loop nest. Two cursors track progress:
//! `iter_ptr` counts ranks consumed by loops, `rank_ptr` marks where the
//! current fiber tree was last re-rooted (in-nest re-partitioning builds a
//! fresh tree from the remaining ranks).

use crate::error::SchedError;
use crate::mapping::Rank;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    name: String,
    declared: Vec<Rank>,
    ranks: Vec<Rank>,
    iter_ptr: usize,
    rank_ptr: usize,
    output: bool,
}

impl Tensor {
    pub fn new(name: impl Into<String>, ranks: Vec<Rank>) -> Self {
        Tensor {
            name: name.into(),
            declared: ranks.clone(),
            ranks,
            iter_ptr: 0,
            rank_ptr: 0,
            output: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ranks as declared in the Einsum, untouched by partitioning.
    pub fn declared_ranks(&self) -> &[Rank] {
        &self.declared
    }

    /// Current rank list, outermost first.
    pub fn ranks(&self) -> &[Rank] {
        &self.ranks
    }

    /// Ranks not yet consumed by a loop.
    pub fn remaining(&self) -> &[Rank] {
        &self.ranks[self.iter_ptr..]
    }

    pub fn is_output(&self) -> bool {
        self.output
    }

    pub fn set_output(&mut self, output: bool) {
        self.output = output;
    }

    /// Next rank a loop would consume.
    pub fn peek(&self) -> Option<&Rank> {
        self.ranks.get(self.iter_ptr)
    }

    /// Consumes the next rank.
    pub fn pop(&mut self) -> Result<Rank, SchedError> {
        let rank = self
            .ranks
            .get(self.iter_ptr)
            .cloned()
            .ok_or_else(|| SchedError::Equation {
                detail: format!("tensor {} iterated past its last rank", self.name),
            })?;
        self.iter_ptr += 1;
        Ok(rank)
    }

    pub fn done(&self) -> bool {
        self.iter_ptr == self.ranks.len()
    }

    /// Restores the declared ranks and rewinds both cursors.
    pub fn reset(&mut self) {
        self.ranks = self.declared.clone();
        self.iter_ptr = 0;
        self.rank_ptr = 0;
    }

    /// Replaces the rank list. Consumed ranks must be kept verbatim, and
    /// the tensor must sit at a re-rooting point (fresh, or right after
    /// `re_root`); calling mid-fiber is a scheduling bug.
    pub fn update_ranks(&mut self, ranks: Vec<Rank>) {
        if self.iter_ptr != self.rank_ptr {
            panic!("Tensor::update_ranks called mid-fiber on {}", self.name);
        }
        if ranks.len() < self.iter_ptr || ranks[..self.iter_ptr] != self.ranks[..self.iter_ptr] {
            panic!(
                "Tensor::update_ranks would rewrite consumed ranks of {}",
                self.name
            );
        }
        self.ranks = ranks;
    }

    /// Marks the current position as the root of a freshly-built fiber
    /// tree; `ident` names the tree over the ranks from here on.
    pub fn re_root(&mut self) {
        self.rank_ptr = self.iter_ptr;
    }

    /// Storage / display name of the current fiber tree, e.g. `A_K2MK1I`.
    pub fn ident(&self) -> String {
        let suffix: String = self.ranks[self.rank_ptr..]
            .iter()
            .map(Rank::as_str)
            .collect();
        format!("{}_{suffix}", self.name)
    }

    /// Name of the fiber currently being iterated, e.g. `a_k1`. Once all
    /// ranks are consumed this is the payload: `z_ref` for the output,
    /// `a_val` for an input.
    pub fn fiber_name(&self) -> String {
        let stem = self.name.to_lowercase();
        match self.peek() {
            Some(rank) => format!("{stem}_{}", rank.var()),
            None if self.output => format!("{stem}_ref"),
            None => format!("{stem}_val"),
        }
    }
}
