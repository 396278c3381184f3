//! One Einsum: an output built from sums of products of input tensors.

use std::collections::BTreeSet;

use crate::coord::expr::Expr;
use crate::error::SchedError;
use crate::mapping::Rank;

/// One appearance of a tensor in the Einsum, with the affine expression
/// each rank is subscripted by. Plain subscripts get identity access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorUse {
    pub name: String,
    pub ranks: Vec<Rank>,
    pub access: Vec<Expr>,
}

impl TensorUse {
    pub fn new<R>(name: impl Into<String>, ranks: impl IntoIterator<Item = R>) -> Self
    where
        R: Into<Rank>,
    {
        let ranks: Vec<Rank> = ranks.into_iter().map(Into::into).collect();
        let access = ranks.iter().map(|r| Expr::var(r.var())).collect();
        TensorUse {
            name: name.into(),
            ranks,
            access,
        }
    }

    /// Use with explicit access expressions, e.g. `I[q + s]` in a
    /// convolution.
    pub fn with_access<R>(
        name: impl Into<String>,
        ranks: impl IntoIterator<Item = R>,
        access: Vec<Expr>,
    ) -> Self
    where
        R: Into<Rank>,
    {
        TensorUse {
            name: name.into(),
            ranks: ranks.into_iter().map(Into::into).collect(),
            access,
        }
    }
}

/// Output plus term/factor-grouped inputs. Factors flatten into one input
/// list; `terms` keeps the grouping as indices into it.
#[derive(Debug, Clone)]
pub struct Equation {
    output: TensorUse,
    terms: Vec<Vec<usize>>,
    inputs: Vec<TensorUse>,
}

impl Equation {
    /// A tensor may appear at most once across the whole Einsum.
    pub fn new(output: TensorUse, terms: Vec<Vec<TensorUse>>) -> Result<Self, SchedError> {
        let mut seen = BTreeSet::new();
        seen.insert(output.name.clone());
        let mut inputs = Vec::new();
        let mut term_ixs = Vec::with_capacity(terms.len());
        for factors in terms {
            let mut ixs = Vec::with_capacity(factors.len());
            for factor in factors {
                if !seen.insert(factor.name.clone()) {
                    return Err(SchedError::DuplicateTensor {
                        tensor: factor.name,
                    });
                }
                ixs.push(inputs.len());
                inputs.push(factor);
            }
            term_ixs.push(ixs);
        }
        Ok(Equation {
            output,
            terms: term_ixs,
            inputs,
        })
    }

    pub fn output(&self) -> &TensorUse {
        &self.output
    }

    /// Inputs in term-then-factor order.
    pub fn inputs(&self) -> &[TensorUse] {
        &self.inputs
    }

    pub fn terms(&self) -> &[Vec<usize>] {
        &self.terms
    }

    /// Output use followed by every input use.
    pub fn uses(&self) -> impl Iterator<Item = &TensorUse> {
        std::iter::once(&self.output).chain(self.inputs.iter())
    }

    /// Loop-universe contributions of the inputs absent from the output,
    /// in first-use order. A plainly subscripted rank contributes itself;
    /// a projected rank (`I[q + s]`) contributes the ranks of its access
    /// variables instead, since its own coordinates are derived.
    pub fn summation_ranks(&self) -> Vec<Rank> {
        let mut out: Vec<Rank> = Vec::new();
        for input in &self.inputs {
            for (rank, access) in input.ranks.iter().zip(&input.access) {
                let contributed: Vec<Rank> = if access.as_var() == Some(rank.var().as_str()) {
                    vec![rank.clone()]
                } else {
                    access
                        .atoms()
                        .map(|var| Rank::new(var.to_uppercase()))
                        .collect()
                };
                for rank in contributed {
                    if !self.output.ranks.contains(&rank) && !out.contains(&rank) {
                        out.push(rank);
                    }
                }
            }
        }
        out
    }
}
