//! Mapping directives: the per-Einsum scheduling knobs supplied alongside the
//! equation itself.
//!
//! A [`Mapping`] carries an optional explicit loop order plus a list of
//! partitioning entries. Each entry keys a rank (or, for flattening, a rank
//! tuple) to the operator chain applied to it, most significant first. The
//! directives here are plain data; all validation happens when
//! [`Partitioning`](crate::part::Partitioning) consumes them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Names a tensor rank (`K`, `M1`, `MK0`, ...).
///
/// Ranks are cheap to clone and compare; the lowercase form doubles as the
/// index variable iterating the rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rank(Arc<str>);

impl Rank {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Loop index variable form: the rank name lowered (`K1` iterates `k1`).
    pub fn var(&self) -> String {
        self.0.to_lowercase()
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Rank {
    fn from(name: &str) -> Self {
        Rank::new(name)
    }
}

impl From<&Rank> for Rank {
    fn from(rank: &Rank) -> Self {
        rank.clone()
    }
}

impl Serialize for Rank {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Rank {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(Rank::new(name))
    }
}

/// One partitioning operator inside a chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PartOp {
    /// Static split into pieces of a fixed shape.
    UniformShape { size: u64 },
    /// Static split into a fixed number of equal pieces.
    #[serde(rename = "nway_shape")]
    NWayShape { parts: u64 },
    /// Dynamic split bounded by the occupancy of the leader tensor's fiber.
    UniformOccupancy { leader: String, size: u64 },
    /// Merge the keyed rank tuple into a single rank.
    Flatten,
}

impl PartOp {
    pub fn uniform_shape(size: u64) -> Self {
        PartOp::UniformShape { size }
    }

    pub fn nway_shape(parts: u64) -> Self {
        PartOp::NWayShape { parts }
    }

    pub fn uniform_occupancy(leader: impl Into<String>, size: u64) -> Self {
        PartOp::UniformOccupancy {
            leader: leader.into(),
            size,
        }
    }

    pub fn flatten() -> Self {
        PartOp::Flatten
    }

    /// True for splits whose boundaries are known before the nest runs.
    pub fn is_static(&self) -> bool {
        matches!(
            self,
            PartOp::UniformShape { .. } | PartOp::NWayShape { .. } | PartOp::Flatten
        )
    }

    /// True for occupancy-based splits resolved only at run time.
    pub fn is_dynamic(&self) -> bool {
        !self.is_static()
    }

    /// Leader tensor for dynamic operators.
    pub fn leader(&self) -> Option<&str> {
        match self {
            PartOp::UniformOccupancy { leader, .. } => Some(leader),
            _ => None,
        }
    }
}

impl fmt::Display for PartOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartOp::UniformShape { size } => write!(f, "uniform_shape({size})"),
            PartOp::NWayShape { parts } => write!(f, "nway_shape({parts})"),
            PartOp::UniformOccupancy { leader, size } => {
                write!(f, "uniform_occupancy({leader}.{size})")
            }
            PartOp::Flatten => f.write_str("flatten()"),
        }
    }
}

/// Scheduling directives for a single Einsum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// Explicit loop order over fully partitioned ranks. `None` selects the
    /// default order (output ranks, then summation ranks, expanded in place).
    #[serde(default)]
    pub loop_order: Option<Vec<Rank>>,
    /// Partitioning entries in declaration order.
    #[serde(default)]
    pub partitioning: Vec<(Vec<Rank>, Vec<PartOp>)>,
}

impl Mapping {
    pub fn new() -> Self {
        Mapping::default()
    }

    #[must_use]
    pub fn with_loop_order<R: Into<Rank>, I: IntoIterator<Item = R>>(mut self, order: I) -> Self {
        self.loop_order = Some(order.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a single-rank operator chain.
    #[must_use]
    pub fn with_part<R: Into<Rank>, I: IntoIterator<Item = PartOp>>(
        mut self,
        rank: R,
        ops: I,
    ) -> Self {
        self.partitioning
            .push((vec![rank.into()], ops.into_iter().collect()));
        self
    }

    /// Adds a flattening entry merging `ranks` into one rank.
    #[must_use]
    pub fn with_flatten<R: Into<Rank>, I: IntoIterator<Item = R>>(mut self, ranks: I) -> Self {
        self.partitioning.push((
            ranks.into_iter().map(Into::into).collect(),
            vec![PartOp::Flatten],
        ));
        self
    }
}
