//! Memory-hierarchy oracle consumed by the flow-graph builder.
//!
//! The scheduler only asks three questions per tensor: is it resident in
//! the modeled on-chip level, is it loop-stationary (no per-iteration
//! traffic worth tracking), and which rank is buffered for it. How a
//! hardware description answers them is someone else's problem; tests and
//! simple frontends use the table-driven [`BindingTable`].

use std::collections::{BTreeMap, BTreeSet};

use crate::mapping::Rank;

pub trait MemoryModel {
    fn is_resident(&self, tensor: &str) -> bool;

    fn is_stationary(&self, tensor: &str) -> bool;

    /// Every buffered-rank binding declared for the tensor. More than one
    /// is a configuration conflict, reported by the scheduler rather than
    /// silently resolved here.
    fn buffered_ranks(&self, tensor: &str) -> Vec<Rank>;
}

#[derive(Debug, Clone, Default)]
pub struct BindingTable {
    resident: BTreeSet<String>,
    stationary: BTreeSet<String>,
    buffered: BTreeMap<String, Vec<Rank>>,
}

impl BindingTable {
    pub fn new() -> Self {
        BindingTable::default()
    }

    #[must_use]
    pub fn resident(mut self, tensor: impl Into<String>) -> Self {
        self.resident.insert(tensor.into());
        self
    }

    #[must_use]
    pub fn stationary(mut self, tensor: impl Into<String>) -> Self {
        self.stationary.insert(tensor.into());
        self
    }

    #[must_use]
    pub fn buffer(mut self, tensor: impl Into<String>, rank: impl Into<Rank>) -> Self {
        self.buffered
            .entry(tensor.into())
            .or_default()
            .push(rank.into());
        self
    }
}

impl MemoryModel for BindingTable {
    fn is_resident(&self, tensor: &str) -> bool {
        self.resident.contains(tensor)
    }

    fn is_stationary(&self, tensor: &str) -> bool {
        self.stationary.contains(tensor)
    }

    fn buffered_ranks(&self, tensor: &str) -> Vec<Rank> {
        self.buffered.get(tensor).cloned().unwrap_or_default()
    }
}
