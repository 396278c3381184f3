//! Closed taxonomy of schedule operations.
//!
//! Nodes are value-identified: inserting the same node twice lands on the
//! same vertex, which is how independently-built chains meet (a follower's
//! partition finds its leader's by value, a loop finds the fiber feeding
//! it by name). Placeholder kinds exist only to encode dependencies during
//! construction and are gone after pruning.

use std::fmt;

use crate::mapping::Rank;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwizzleReason {
    /// Rank reorder bringing a tensor in line with the loop order.
    LoopOrder,
    /// Rank reorder required before a partitioning step applies.
    Partitioning,
    /// Rank reorder laying out an eager buffer around the buffered rank.
    Metrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Milestone {
    Output,
    Graphics,
    Body,
    Footer,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlowNode {
    LoopBegin { rank: Rank },
    LoopEnd { rank: Rank },
    /// Placeholder: a tensor before any setup has touched it.
    Tensor { tensor: String },
    /// Placeholder: one declared or derived rank of a tensor.
    RankSlot { tensor: String, rank: Rank },
    /// Placeholder: a named fiber between operations.
    Fiber { name: String },
    /// Placeholder: anchor between tensor setup and the first loop.
    NestStart,
    GetRoot { tensor: String, ranks: Vec<Rank> },
    GetPayload { tensor: String, ranks: Vec<Rank> },
    Swizzle { tensor: String, ranks: Vec<Rank>, reason: SwizzleReason },
    Partition { tensor: String, key: Vec<Rank> },
    FromFiber { tensor: String, rank: Rank },
    EagerInput { tensor: String, ranks: Vec<Rank> },
    Interval { rank: Rank },
    MetricsBegin,
    MetricsEnd,
    MetricsDump,
    Collect { tensor: String, rank: Rank },
    Milestone(Milestone),
}

impl FlowNode {
    /// Construction-only nodes removed by pruning.
    pub fn is_placeholder(&self) -> bool {
        matches!(
            self,
            FlowNode::Tensor { .. }
                | FlowNode::RankSlot { .. }
                | FlowNode::Fiber { .. }
                | FlowNode::NestStart
        )
    }
}

impl fmt::Display for SwizzleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwizzleReason::LoopOrder => write!(f, "loop-order"),
            SwizzleReason::Partitioning => write!(f, "partitioning"),
            SwizzleReason::Metrics => write!(f, "metrics"),
        }
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Milestone::Output => write!(f, "output"),
            Milestone::Graphics => write!(f, "graphics"),
            Milestone::Body => write!(f, "body"),
            Milestone::Footer => write!(f, "footer"),
        }
    }
}

impl fmt::Display for FlowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowNode::LoopBegin { rank } => write!(f, "loop-begin({rank})"),
            FlowNode::LoopEnd { rank } => write!(f, "loop-end({rank})"),
            FlowNode::Tensor { tensor } => write!(f, "tensor({tensor})"),
            FlowNode::RankSlot { tensor, rank } => write!(f, "rank({tensor}.{rank})"),
            FlowNode::Fiber { name } => write!(f, "fiber({name})"),
            FlowNode::NestStart => write!(f, "nest-start"),
            FlowNode::GetRoot { tensor, ranks } => {
                write!(f, "get-root({tensor}, [{}])", join(ranks))
            }
            FlowNode::GetPayload { tensor, ranks } => {
                write!(f, "get-payload({tensor}, [{}])", join(ranks))
            }
            FlowNode::Swizzle {
                tensor,
                ranks,
                reason,
            } => write!(f, "swizzle({tensor}, [{}], {reason})", join(ranks)),
            FlowNode::Partition { tensor, key } => {
                write!(f, "partition({tensor}, [{}])", join(key))
            }
            FlowNode::FromFiber { tensor, rank } => write!(f, "from-fiber({tensor}, {rank})"),
            FlowNode::EagerInput { tensor, ranks } => {
                write!(f, "eager-input({tensor}, [{}])", join(ranks))
            }
            FlowNode::Interval { rank } => write!(f, "interval({rank})"),
            FlowNode::MetricsBegin => write!(f, "metrics-begin"),
            FlowNode::MetricsEnd => write!(f, "metrics-end"),
            FlowNode::MetricsDump => write!(f, "metrics-dump"),
            FlowNode::Collect { tensor, rank } => write!(f, "collect({tensor}, {rank})"),
            FlowNode::Milestone(milestone) => write!(f, "milestone({milestone})"),
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
