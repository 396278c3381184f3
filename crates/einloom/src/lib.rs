pub mod coord;
pub mod einsum;
mod env;
pub mod error;
pub mod flow;
pub mod iter_graph;
pub mod loop_order;
pub mod mapping;
pub mod memory;
pub mod part;
pub mod program;
pub mod tensor;
pub mod trace;

pub use einsum::{Equation, TensorUse};
pub use error::SchedError;
pub use flow::{FlowGraph, FlowNode, Milestone, ScheduleOptions, SwizzleReason};
pub use mapping::{Mapping, PartOp, Rank};
pub use memory::{BindingTable, MemoryModel};
pub use program::{Program, TensorId};
