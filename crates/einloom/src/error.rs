//! Configuration errors surfaced while assembling a schedule.
//!
//! Every variant corresponds to an illegal Einsum/mapping combination and is
//! raised at the point of detection, naming the offending ranks or tensors.
//! Internal modeling bugs (for example a cyclic flow graph) are reported
//! through `anyhow` by the orchestration layer instead.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedError {
    #[error("index math for rank {rank}: {detail}")]
    IndexMath { rank: String, detail: String },

    #[error("index {var} has {matches} expressions matching the requested condition, expected exactly one")]
    AmbiguousTranslation { var: String, matches: usize },

    #[error("no usable translation for index {var} under the chosen loop order")]
    NoTranslation { var: String },

    #[error("coordinate translations pruned twice")]
    AlreadyPruned,

    #[error("coordinate translations queried before pruning")]
    NotPruned,

    #[error("n-way partitioning of {rank} may not follow a dynamic split in the same chain")]
    NWayAfterDynamic { rank: String },

    #[error("cannot partition {rank}: not a declared rank, the bottom of a split chain, or a flattened rank")]
    UnknownPartRank { rank: String },

    #[error("rank {rank} is partitioned by more than one directive")]
    ConflictingPart { rank: String },

    #[error("flatten of ({ranks}) rejected: {reason}")]
    Flatten { ranks: String, reason: String },

    #[error("rank {rank} is not the product of flattening")]
    NotFlattened { rank: String },

    #[error("partitioning of {key} has no occupancy leader")]
    NoLeader { key: String },

    #[error("{key} does not name a partitioned rank or rank tuple")]
    NotPartitioned { key: String },

    #[error("loop order invalid: {detail}")]
    LoopOrder { detail: String },

    #[error("tensor {tensor} appears more than once in the Einsum")]
    DuplicateTensor { tensor: String },

    #[error("equation invalid: {detail}")]
    Equation { detail: String },

    #[error("tensor {tensor} is buffered at more than one rank ({ranks})")]
    ConflictingBinding { tensor: String, ranks: String },
}

impl SchedError {
    pub(crate) fn index_math(rank: impl Into<String>, detail: impl Into<String>) -> Self {
        SchedError::IndexMath {
            rank: rank.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn flatten(ranks: &[crate::mapping::Rank], reason: impl Into<String>) -> Self {
        SchedError::Flatten {
            ranks: ranks
                .iter()
                .map(|r| r.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            reason: reason.into(),
        }
    }
}
