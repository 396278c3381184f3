//! One Einsum plus its mapping, resolved and ready to schedule.
//!
//! `Program::new` runs the whole front half of scheduling: tensors from
//! the equation, index math from the accesses, the partition DAG, the
//! final loop order, the coordinate-translation prune against the roots
//! the loops make available, and a first loop-order application to every
//! tensor. The flow-graph builder then mutates tensor state while walking
//! the nest; `reset_tensors` restores the post-construction state so a
//! program can be scheduled more than once.

use std::collections::BTreeSet;

use anyhow::{ensure, Context, Result};

use crate::coord::CoordMath;
use crate::einsum::Equation;
use crate::error::SchedError;
use crate::loop_order::LoopOrder;
use crate::mapping::{Mapping, Rank};
use crate::part::Partitioning;
use crate::tensor::Tensor;

pub type TensorId = usize;

#[derive(Debug)]
pub struct Program {
    equation: Equation,
    tensors: Vec<Tensor>,
    coord: CoordMath,
    part: Partitioning,
    order: LoopOrder,
}

impl Program {
    pub fn new(equation: Equation, mapping: &Mapping) -> Result<Self> {
        let mut tensors = Vec::new();
        let mut coord = CoordMath::new();
        let mut declared = Vec::new();
        for tensor_use in equation.uses() {
            let mut tensor = Tensor::new(&tensor_use.name, tensor_use.ranks.clone());
            tensor.set_output(tensors.is_empty());
            tensors.push(tensor);
            coord
                .add(&tensor_use.ranks, &tensor_use.access)
                .with_context(|| format!("registering index math for {}", tensor_use.name))?;
            for rank in &tensor_use.ranks {
                if !declared.contains(rank) {
                    declared.push(rank.clone());
                }
            }
        }

        let part = Partitioning::new(&mapping.partitioning, &declared, &coord)
            .context("building partitioning")?;
        for key in part.dyn_parts() {
            // flatten tuples are dynamic through their members but follow
            // no leader of their own
            if key.len() > 1 {
                continue;
            }
            let leader = part.get_leader(key)?;
            ensure!(
                tensors.iter().any(|t| t.name() == leader),
                "occupancy leader {leader} is not a tensor of this Einsum"
            );
        }

        let mut seed = equation.output().ranks.clone();
        seed.extend(equation.summation_ranks());
        let mut order = LoopOrder::new();
        order
            .add(mapping.loop_order.clone(), &seed, &part)
            .context("resolving loop order")?;

        let mut roots = BTreeSet::new();
        for rank in order.ranks() {
            for avail in part.get_available(rank) {
                if part.get_root_name(&avail) == avail {
                    roots.insert(avail.var());
                }
            }
        }
        coord
            .prune(&roots)
            .context("pruning coordinate translations")?;

        for tensor in &mut tensors {
            order
                .apply(&part, &coord, tensor)
                .with_context(|| format!("ordering ranks of {}", tensor.name()))?;
        }

        Ok(Program {
            equation,
            tensors,
            coord,
            part,
            order,
        })
    }

    pub fn equation(&self) -> &Equation {
        &self.equation
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id]
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id]
    }

    /// The output is always tensor 0.
    pub fn output_id(&self) -> TensorId {
        0
    }

    pub fn tensor_named(&self, name: &str) -> Option<TensorId> {
        self.tensors.iter().position(|t| t.name() == name)
    }

    pub fn coord_math(&self) -> &CoordMath {
        &self.coord
    }

    pub fn partitioning(&self) -> &Partitioning {
        &self.part
    }

    pub fn loop_order(&self) -> &LoopOrder {
        &self.order
    }

    pub fn is_ready(&self, rank: &Rank, pos: usize) -> Result<bool, SchedError> {
        self.order.is_ready(&self.part, &self.coord, rank, pos)
    }

    /// Re-sorts one tensor's unconsumed ranks against the loop order.
    pub fn apply_order(&mut self, id: TensorId) -> Result<(), SchedError> {
        let (tensors, part, coord, order) =
            (&mut self.tensors, &self.part, &self.coord, &self.order);
        order.apply(part, coord, &mut tensors[id])
    }

    /// Restores every tensor to its post-construction state.
    pub fn reset_tensors(&mut self) -> Result<(), SchedError> {
        let (tensors, part, coord, order) =
            (&mut self.tensors, &self.part, &self.coord, &self.order);
        for tensor in tensors.iter_mut() {
            tensor.reset();
            order.apply(part, coord, tensor)?;
        }
        Ok(())
    }
}
