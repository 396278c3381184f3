//! Dependency-resolved construction schedule for one Einsum.
//!
//! `FlowGraph::build` walks a resolved [`Program`] and records every
//! fibertree operation the loop nest needs as a node in a DAG whose edges
//! are data dependencies: pre-nest tensor setup, the loop ranks
//! themselves, in-nest occupancy splits, discordant payload projections,
//! and the metrics envelope when a memory model is attached. Construction
//! threads tensors through placeholder nodes so that chains touching the
//! same tensor meet by value.
//!
//! Three passes follow construction. Pruning removes the placeholders,
//! bridging their neighbors. Sorting linearizes the DAG with Kahn's
//! algorithm, breaking ties toward earlier insertion so the schedule
//! stays stable. Hoisting walks the loops innermost first and floats
//! every node that does not depend on a loop's coordinate out of that
//! loop's body; an occupancy split built just in time for an inner level
//! rises past the loops between it and the fiber it splits.

mod dag;
mod node;

pub use node::{FlowNode, Milestone, SwizzleReason};

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::env;
use crate::error::SchedError;
use crate::iter_graph::IterationGraph;
use crate::mapping::Rank;
use crate::memory::MemoryModel;
use crate::part::ChainKey;
use crate::program::{Program, TensorId};
use crate::trace::{self, BuildStage, StageStats};

use dag::{FlowDag, NodeIx};

/// Knobs for the post-sort passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleOptions {
    pub hoist: bool,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        ScheduleOptions { hoist: true }
    }
}

impl ScheduleOptions {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        ScheduleOptions {
            hoist: env::hoist_enabled(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowGraph {
    dag: FlowDag,
    order: Vec<NodeIx>,
}

impl FlowGraph {
    /// Builds, prunes, sorts, and (optionally) hoists the flow graph of
    /// `program`. Tensor rank state is reset first, so the same program
    /// can be scheduled repeatedly.
    pub fn build(
        program: &mut Program,
        memory: Option<&dyn MemoryModel>,
        options: &ScheduleOptions,
    ) -> Result<FlowGraph> {
        program.reset_tensors().context("resetting tensor state")?;
        let mut builder = Builder {
            program,
            memory,
            dag: FlowDag::default(),
            loop_begins: Vec::new(),
        };
        builder.build_graph().context("building flow graph")?;
        let mut dag = builder.dag;
        trace::emit_build_event(
            BuildStage::Build,
            dag.node_count(),
            dag.edge_count(),
            StageStats {
                changed: true,
                ..StageStats::default()
            },
        );

        let removed = prune_placeholders(&mut dag);
        trace::emit_build_event(
            BuildStage::Prune,
            dag.node_count(),
            dag.edge_count(),
            StageStats {
                changed: removed > 0,
                removed_nodes: removed,
                ..StageStats::default()
            },
        );

        let mut order = toposort(&dag)?;
        trace::emit_build_event(
            BuildStage::Sort,
            dag.node_count(),
            dag.edge_count(),
            StageStats::default(),
        );

        if options.hoist {
            let hoisted = hoist_loop_invariants(&dag, &mut order);
            trace::emit_build_event(
                BuildStage::Hoist,
                dag.node_count(),
                dag.edge_count(),
                StageStats {
                    changed: hoisted > 0,
                    hoisted_nodes: hoisted,
                    ..StageStats::default()
                },
            );
        }

        Ok(FlowGraph { dag, order })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Scheduled nodes, in execution order.
    pub fn schedule(&self) -> impl ExactSizeIterator<Item = &FlowNode> + '_ {
        self.order.iter().map(|&ix| self.dag.node(ix))
    }

    pub fn into_schedule(self) -> Vec<FlowNode> {
        let FlowGraph { dag, order } = self;
        order.into_iter().map(|ix| dag.node(ix).clone()).collect()
    }

    /// Position of `node` in the schedule.
    pub fn position(&self, node: &FlowNode) -> Option<usize> {
        self.order.iter().position(|&ix| self.dag.node(ix) == node)
    }

    /// Surviving dependency edges, as (before, after) pairs.
    pub fn dependencies(&self) -> impl Iterator<Item = (&FlowNode, &FlowNode)> + '_ {
        self.dag.alive_nodes().flat_map(move |ix| {
            self.dag
                .succs(ix)
                .iter()
                .map(move |&succ| (self.dag.node(ix), self.dag.node(succ)))
        })
    }
}

struct Builder<'a> {
    program: &'a mut Program,
    memory: Option<&'a dyn MemoryModel>,
    dag: FlowDag,
    loop_begins: Vec<(Rank, NodeIx)>,
}

impl Builder<'_> {
    fn build_graph(&mut self) -> Result<()> {
        let mut tails = Vec::with_capacity(self.program.tensors().len());
        for id in 0..self.program.tensors().len() {
            let tail = self
                .setup_tensor(id)
                .with_context(|| format!("setting up {}", self.program.tensor(id).name()))?;
            tails.push(tail);
        }
        let graphics = self.dag.insert(FlowNode::Milestone(Milestone::Graphics));
        for tail in tails {
            self.dag.add_edge(tail, graphics);
        }

        let mut prev = graphics;
        if self.memory.is_some() {
            let begin = self.dag.insert(FlowNode::MetricsBegin);
            self.dag.add_edge(prev, begin);
            prev = begin;
        }
        let nest_start = self.dag.insert(FlowNode::NestStart);
        self.dag.add_edge(prev, nest_start);
        prev = nest_start;

        let mut iter = IterationGraph::new(self.program);
        let levels = iter.loop_ranks().len();
        for pos in 0..levels {
            self.expand_dynamic(pos)?;
            self.expand_flatten(pos)?;
            let (rank, ids) = iter.peek_concord(self.program)?;
            let rank = rank.expect("cursor still inside the nest");
            let begin = self.dag.insert(FlowNode::LoopBegin { rank: rank.clone() });
            self.dag.add_edge(prev, begin);
            for &id in &ids {
                let fiber = self.fiber(id);
                self.dag.add_edge(fiber, begin);
            }
            iter.pop_concord(self.program)?;
            for &id in &ids {
                let fiber = self.fiber(id);
                self.dag.add_edge(begin, fiber);
            }
            self.loop_begins.push((rank, begin));
            prev = begin;
        }

        let body = self.dag.insert(FlowNode::Milestone(Milestone::Body));
        self.dag.add_edge(prev, body);
        if levels > 0 {
            for (id, prefix) in iter.peek_discord(self.program)? {
                self.wire_discord(&iter, id, prefix, body)?;
            }
        }
        for id in 0..self.program.tensors().len() {
            if self.program.tensor(id).done() {
                let fiber = self.fiber(id);
                self.dag.add_edge(fiber, body);
            }
        }

        let mut prev = body;
        for (rank, _) in self.loop_begins.iter().rev() {
            let end = self.dag.insert(FlowNode::LoopEnd { rank: rank.clone() });
            self.dag.add_edge(prev, end);
            prev = end;
        }
        let footer = self.dag.insert(FlowNode::Milestone(Milestone::Footer));
        self.dag.add_edge(prev, footer);
        if self.memory.is_some() {
            let end = self.dag.insert(FlowNode::MetricsEnd);
            self.dag.add_edge(footer, end);
            let dump = self.dag.insert(FlowNode::MetricsDump);
            self.dag.add_edge(end, dump);
        }
        Ok(())
    }

    /// Pre-nest setup of one tensor: placeholder threading, every chain
    /// not deferred into the nest, the loop-order swizzle, and the root
    /// handle the first loop iterates. Returns the node gating the
    /// graphics milestone.
    fn setup_tensor(&mut self, id: TensorId) -> Result<NodeIx> {
        let name = self.program.tensor(id).name().to_string();
        let tensor_node = self.dag.insert(FlowNode::Tensor {
            tensor: name.clone(),
        });
        if self.program.tensor(id).is_output() {
            let milestone = self.dag.insert(FlowNode::Milestone(Milestone::Output));
            self.dag.add_edge(milestone, tensor_node);
        }

        let mut frontier: BTreeMap<Rank, NodeIx> = BTreeMap::new();
        let mut current: Vec<Rank> = self.program.tensor(id).declared_ranks().to_vec();
        for rank in &current {
            let slot = self.dag.insert(FlowNode::RankSlot {
                tensor: name.clone(),
                rank: rank.clone(),
            });
            self.dag.add_edge(tensor_node, slot);
            frontier.insert(rank.clone(), slot);
        }

        // intermediate-keyed chains wait for their fiber inside the nest
        let pre_nest: Vec<ChainKey> = {
            let part = self.program.partitioning();
            part.get_all_parts()
                .iter()
                .filter(|key| key.len() > 1 || !part.is_intermediate(&key[0]))
                .cloned()
                .collect()
        };
        loop {
            let valid = self
                .program
                .partitioning()
                .get_valid_parts(&current, pre_nest.iter(), true);
            if valid.is_empty() {
                break;
            }
            for key in valid {
                self.apply_partition(&name, &key, &mut current, &mut frontier)?;
            }
        }

        self.program.tensor_mut(id).update_ranks(current);
        self.program.apply_order(id)?;
        let final_ranks = self.program.tensor(id).ranks().to_vec();

        let swizzle = self.dag.insert(FlowNode::Swizzle {
            tensor: name.clone(),
            ranks: final_ranks.clone(),
            reason: SwizzleReason::LoopOrder,
        });
        for &slot in frontier.values() {
            self.dag.add_edge(slot, swizzle);
        }
        let root = self.dag.insert(FlowNode::GetRoot {
            tensor: name.clone(),
            ranks: final_ranks,
        });
        self.dag.add_edge(swizzle, root);
        let fiber = self.fiber(id);
        self.dag.add_edge(root, fiber);

        let mut tail = fiber;
        if let Some(memory) = self.memory {
            let buffered = memory.buffered_ranks(&name);
            if buffered.len() > 1 {
                return Err(SchedError::ConflictingBinding {
                    tensor: name,
                    ranks: buffered
                        .iter()
                        .map(Rank::as_str)
                        .collect::<Vec<_>>()
                        .join(", "),
                }
                .into());
            }
            if memory.is_resident(&name) && !memory.is_stationary(&name) {
                if let Some(rank) = buffered.into_iter().next() {
                    let collect = self.dag.insert(FlowNode::Collect {
                        tensor: name.clone(),
                        rank,
                    });
                    self.dag.add_edge(fiber, collect);
                    tail = collect;
                }
            }
        }
        Ok(tail)
    }

    /// One chain application during setup: the optional adjacency swizzle
    /// for a flatten, the partition node fed by the source slots, the
    /// leader edge for occupancy splits, and fresh slots for the produced
    /// ranks.
    fn apply_partition(
        &mut self,
        name: &str,
        key: &ChainKey,
        current: &mut Vec<Rank>,
        frontier: &mut BTreeMap<Rank, NodeIx>,
    ) -> Result<()> {
        let needs_swizzle = key.len() > 1
            && self
                .program
                .partitioning()
                .get_valid_parts(current, std::iter::once(key), false)
                .is_empty();
        if needs_swizzle {
            *current = self.program.partitioning().swizzle_for_flattening(current);
            let swizzle = self.dag.insert(FlowNode::Swizzle {
                tensor: name.to_string(),
                ranks: current.clone(),
                reason: SwizzleReason::Partitioning,
            });
            for member in key {
                self.dag.add_edge(frontier[member], swizzle);
            }
            for member in key {
                frontier.insert(member.clone(), swizzle);
            }
        }

        let node = self.dag.insert(FlowNode::Partition {
            tensor: name.to_string(),
            key: key.clone(),
        });
        for member in key {
            self.dag.add_edge(frontier[member], node);
        }
        self.wire_leader(name, key, node)?;

        let mut produced = self.program.partitioning().partition_names(key, false)?;
        produced.reverse();
        let at = current
            .iter()
            .position(|rank| rank == &key[0])
            .expect("validated source rank present");
        current.splice(at..at + key.len(), produced.iter().cloned());

        for member in key {
            frontier.remove(member);
        }
        for rank in produced {
            let slot = self.dag.insert(FlowNode::RankSlot {
                tensor: name.to_string(),
                rank: rank.clone(),
            });
            self.dag.add_edge(node, slot);
            frontier.insert(rank, slot);
        }
        Ok(())
    }

    /// Occupancy splits follow their leader tensor's split of the same
    /// chain. The leader node is addressed by value, so the edge lands on
    /// the same node the leader's own setup builds, in either order.
    /// Flattening merges element-wise and follows no leader, even when a
    /// member is dynamically derived.
    fn wire_leader(&mut self, name: &str, key: &ChainKey, follower: NodeIx) -> Result<()> {
        let leader = {
            let part = self.program.partitioning();
            if key.len() > 1 || !part.is_dynamic(key) {
                return Ok(());
            }
            part.get_leader(key)?.to_string()
        };
        if leader == name {
            return Ok(());
        }
        let node = self.dag.insert(FlowNode::Partition {
            tensor: leader,
            key: key.clone(),
        });
        self.dag.add_edge(node, follower);
        Ok(())
    }

    /// In-nest splits whose source fiber just became iterable: every
    /// intermediate-keyed chain, occupancy splits and shape splits of an
    /// occupancy remainder alike. The produced nodes take no edge from
    /// the enclosing loop begin: their only tie is the fiber they split,
    /// which is what lets the hoist pass float them out of loops that do
    /// not affect them.
    fn expand_dynamic(&mut self, pos: usize) -> Result<()> {
        for id in 0..self.program.tensors().len() {
            let next = match self.program.tensor(id).peek() {
                Some(rank) => rank.clone(),
                None => continue,
            };
            let ready = {
                let part = self.program.partitioning();
                if !part.is_intermediate(&next) {
                    continue;
                }
                let final_rank = part.get_final_rank_id(self.program.tensor(id).ranks(), &next);
                self.program.is_ready(&final_rank, pos)?
            };
            if !ready {
                continue;
            }

            let name = self.program.tensor(id).name().to_string();
            let key = vec![next.clone()];
            let source = self.fiber(id);
            let from = self.dag.insert(FlowNode::FromFiber {
                tensor: name.clone(),
                rank: next,
            });
            self.dag.add_edge(source, from);
            let node = self.dag.insert(FlowNode::Partition {
                tensor: name.clone(),
                key: key.clone(),
            });
            self.dag.add_edge(from, node);
            self.wire_leader(&name, &key, node)?;

            // splice the split names over the intermediate, then re-sort
            // the unconsumed tail against the loop order
            let new_ranks = {
                let part = self.program.partitioning();
                let tensor = self.program.tensor(id);
                let consumed = tensor.ranks().len() - tensor.remaining().len();
                let mut ranks: Vec<Rank> = tensor.ranks()[..consumed].to_vec();
                let mut produced = part.partition_names(&key, false)?;
                produced.reverse();
                ranks.extend(produced);
                ranks.extend(tensor.remaining()[1..].iter().cloned());
                ranks
            };
            {
                let tensor = self.program.tensor_mut(id);
                tensor.re_root();
                tensor.update_ranks(new_ranks);
            }
            let before: Vec<Rank> = self.program.tensor(id).remaining().to_vec();
            self.program.apply_order(id)?;
            let after: Vec<Rank> = self.program.tensor(id).remaining().to_vec();

            let mut tail = node;
            if before != after {
                let swizzle = self.dag.insert(FlowNode::Swizzle {
                    tensor: name.clone(),
                    ranks: after.clone(),
                    reason: SwizzleReason::Partitioning,
                });
                self.dag.add_edge(node, swizzle);
                tail = swizzle;
            }
            let root = self.dag.insert(FlowNode::GetRoot {
                tensor: name,
                ranks: after,
            });
            self.dag.add_edge(tail, root);
            let fiber = self.fiber(id);
            self.dag.add_edge(root, fiber);
        }
        Ok(())
    }

    /// Flattens whose members only exist once an in-nest split has run.
    /// Applied at the level that iterates the merged rank, against the
    /// tensor's current fiber: members swizzled adjacent if need be, then
    /// merged and re-rooted like any other in-nest re-partitioning.
    fn expand_flatten(&mut self, pos: usize) -> Result<()> {
        for id in 0..self.program.tensors().len() {
            let keys: Vec<ChainKey> = {
                let part = self.program.partitioning();
                let tensor = self.program.tensor(id);
                part.get_valid_parts(tensor.remaining(), part.get_all_parts().iter(), true)
                    .into_iter()
                    .filter(|key| key.len() > 1)
                    .collect()
            };
            for key in keys {
                let ready = {
                    let part = self.program.partitioning();
                    let tensor = self.program.tensor(id);
                    let merged = part.get_final_rank_id(tensor.ranks(), &key[0]);
                    self.program.is_ready(&merged, pos)?
                };
                if !ready {
                    continue;
                }

                let name = self.program.tensor(id).name().to_string();
                let mut source = self.fiber(id);
                let (tail, needs_swizzle) = {
                    let part = self.program.partitioning();
                    let remaining = self.program.tensor(id).remaining();
                    if part
                        .get_valid_parts(remaining, std::iter::once(&key), false)
                        .is_empty()
                    {
                        (part.swizzle_for_flattening(remaining), true)
                    } else {
                        (remaining.to_vec(), false)
                    }
                };
                if needs_swizzle {
                    let swizzle = self.dag.insert(FlowNode::Swizzle {
                        tensor: name.clone(),
                        ranks: tail.clone(),
                        reason: SwizzleReason::Partitioning,
                    });
                    self.dag.add_edge(source, swizzle);
                    source = swizzle;
                }
                let node = self.dag.insert(FlowNode::Partition {
                    tensor: name.clone(),
                    key: key.clone(),
                });
                self.dag.add_edge(source, node);

                let new_ranks = {
                    let part = self.program.partitioning();
                    let tensor = self.program.tensor(id);
                    let consumed = tensor.ranks().len() - tensor.remaining().len();
                    let mut produced = part.partition_names(&key, false)?;
                    produced.reverse();
                    let mut tail = tail;
                    let at = tail
                        .iter()
                        .position(|r| *r == key[0])
                        .expect("swizzled members sit adjacent");
                    tail.splice(at..at + key.len(), produced);
                    let mut ranks: Vec<Rank> = tensor.ranks()[..consumed].to_vec();
                    ranks.extend(tail);
                    ranks
                };
                {
                    let tensor = self.program.tensor_mut(id);
                    tensor.re_root();
                    tensor.update_ranks(new_ranks);
                }
                self.program.apply_order(id)?;
                let after: Vec<Rank> = self.program.tensor(id).remaining().to_vec();
                let root = self.dag.insert(FlowNode::GetRoot {
                    tensor: name,
                    ranks: after,
                });
                self.dag.add_edge(node, root);
                let fiber = self.fiber(id);
                self.dag.add_edge(root, fiber);
            }
        }
        Ok(())
    }

    /// Access path for a tensor left behind by the concordant walk: its
    /// current fiber, projected at the deepest loop supplying the prefix
    /// coordinates. Statically bounded prefixes project straight out of
    /// the fiber; a dynamically split rank needs its interval recorded
    /// and the fiber eagerly buffered first.
    fn wire_discord(
        &mut self,
        iter: &IterationGraph,
        id: TensorId,
        prefix: Vec<Rank>,
        body: NodeIx,
    ) -> Result<()> {
        let name = self.program.tensor(id).name().to_string();
        let gate_pos = prefix
            .iter()
            .map(|rank| {
                iter.first_available(rank)
                    .expect("discordant rank is available inside the nest")
            })
            .max()
            .expect("discordant prefix is never empty");
        let gate = self.loop_begins[gate_pos].1;
        let mut source = self.fiber(id);

        if let Some(memory) = self.memory {
            if memory.is_resident(&name) && !memory.is_stationary(&name) {
                let buffered = memory.buffered_ranks(&name);
                if buffered.iter().any(|rank| prefix.contains(rank)) {
                    let swizzle = self.dag.insert(FlowNode::Swizzle {
                        tensor: name.clone(),
                        ranks: prefix.clone(),
                        reason: SwizzleReason::Metrics,
                    });
                    self.dag.add_edge(source, swizzle);
                    source = swizzle;
                }
            }
        }

        let unbounded: Vec<Rank> = {
            let part = self.program.partitioning();
            prefix
                .iter()
                .filter(|rank| !part.is_static_bounded(rank))
                .cloned()
                .collect()
        };
        if !unbounded.is_empty() {
            let eager = self.dag.insert(FlowNode::EagerInput {
                tensor: name.clone(),
                ranks: prefix.clone(),
            });
            for rank in unbounded {
                let interval = self.dag.insert(FlowNode::Interval { rank });
                self.dag.add_edge(gate, interval);
                self.dag.add_edge(interval, eager);
            }
            self.dag.add_edge(source, eager);
            source = eager;
        }

        let payload = self.dag.insert(FlowNode::GetPayload {
            tensor: name,
            ranks: prefix,
        });
        self.dag.add_edge(source, payload);
        self.dag.add_edge(gate, payload);
        self.dag.add_edge(payload, body);
        Ok(())
    }

    /// Node for the tensor's current fiber, named after the rank its
    /// pointer sits on. Value addressing makes repeated calls between
    /// state changes land on the same node.
    fn fiber(&mut self, id: TensorId) -> NodeIx {
        let name = self.program.tensor(id).fiber_name();
        self.dag.insert(FlowNode::Fiber { name })
    }
}

fn prune_placeholders(dag: &mut FlowDag) -> usize {
    let placeholders: Vec<NodeIx> = dag
        .alive_nodes()
        .filter(|&ix| dag.node(ix).is_placeholder())
        .collect();
    for &ix in &placeholders {
        dag.remove_bridging(ix);
    }
    placeholders.len()
}

/// Kahn's algorithm over the pruned DAG. The ready pool pops the lowest
/// node index, so nodes inserted earlier schedule earlier among peers
/// with no ordering constraint.
fn toposort(dag: &FlowDag) -> Result<Vec<NodeIx>> {
    let mut indegree: HashMap<NodeIx, usize> = dag
        .alive_nodes()
        .map(|ix| (ix, dag.preds(ix).len()))
        .collect();
    let mut ready: BTreeSet<NodeIx> = indegree
        .iter()
        .filter(|&(_, &degree)| degree == 0)
        .map(|(&ix, _)| ix)
        .collect();
    let mut order = Vec::with_capacity(indegree.len());
    while let Some(ix) = ready.pop_first() {
        order.push(ix);
        for &succ in dag.succs(ix) {
            let degree = indegree
                .get_mut(&succ)
                .expect("edges stay within alive nodes");
            *degree -= 1;
            if *degree == 0 {
                ready.insert(succ);
            }
        }
    }
    ensure!(order.len() == indegree.len(), "flow graph contains a cycle");
    Ok(order)
}

/// Innermost-first pass over the loop begins. Everything between a begin
/// and the end of the current window that is not a dependent of the begin
/// moves immediately above it, keeping relative order. The window then
/// shrinks to the hoisted block, so a node never climbs past a loop it
/// depends on.
fn hoist_loop_invariants(dag: &FlowDag, order: &mut Vec<NodeIx>) -> usize {
    let begins: Vec<usize> = order
        .iter()
        .enumerate()
        .filter(|&(_, &ix)| matches!(dag.node(ix), FlowNode::LoopBegin { .. }))
        .map(|(pos, _)| pos)
        .collect();
    let mut hoisted = 0;
    let mut window_end = order.len();
    for &begin_pos in begins.iter().rev() {
        let begin = order[begin_pos];
        let inside = dag.reachable_from(begin);
        let mut block = Vec::new();
        let mut kept = Vec::new();
        for &ix in &order[begin_pos + 1..window_end] {
            if inside.contains(&ix) {
                kept.push(ix);
            } else {
                block.push(ix);
            }
        }
        if !block.is_empty() {
            hoisted += block.len();
            let mut rebuilt = block;
            rebuilt.push(begin);
            rebuilt.append(&mut kept);
            order.splice(begin_pos..window_end, rebuilt);
        }
        window_end = begin_pos;
    }
    hoisted
}
