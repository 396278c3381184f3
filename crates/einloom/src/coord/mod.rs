//! Index-math bookkeeping relating declared tensor ranks to loop variables.
//!
//! Every tensor use contributes one equation per rank: the rank's own index
//! variable on the left, the access expression on the right (`w = q + s` for
//! an input subscripted with `q + s` at rank `W`). For each non-trivial
//! equation the store also records the solved form for every unit-coefficient
//! variable, so that either side of a projection can be recovered later.
//!
//! Once the final loop order is known, [`CoordMath::prune`] narrows each
//! variable to the single translation computable from the ranks the nest
//! actually iterates. Projections emitted by the flow graph read that
//! translation through [`CoordMath::get_trans`].

pub mod expr;

use std::collections::{BTreeSet, HashMap};

use crate::error::SchedError;
use crate::mapping::Rank;

pub use expr::Expr;

/// Store of affine index equations and their per-variable solutions.
#[derive(Debug, Clone, Default)]
pub struct CoordMath {
    /// Candidate expressions per variable, identity first.
    all_exprs: HashMap<String, Vec<Expr>>,
    /// Raw equations `root = expr` in declaration order.
    eqn_exprs: Vec<(String, Expr)>,
    /// Post-prune translation per variable.
    trans: Option<HashMap<String, Expr>>,
}

impl CoordMath {
    pub fn new() -> Self {
        CoordMath::default()
    }

    /// Records the equations for one tensor use.
    ///
    /// `ranks` are the tensor's declared ranks and `access[i]` the expression
    /// it is subscripted with at position `i`. Expressions are already in
    /// canonical affine form, so the remaining failure mode is a root
    /// redefined with a different expression.
    pub fn add(&mut self, ranks: &[Rank], access: &[Expr]) -> Result<(), SchedError> {
        if ranks.len() != access.len() {
            return Err(SchedError::index_math(
                ranks
                    .iter()
                    .map(Rank::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
                format!(
                    "{} ranks subscripted with {} expressions",
                    ranks.len(),
                    access.len()
                ),
            ));
        }
        for (rank, expr) in ranks.iter().zip(access) {
            let root = rank.var();
            if let Some((_, existing)) = self.eqn_exprs.iter().find(|(r, _)| *r == root) {
                if existing != expr {
                    return Err(SchedError::index_math(
                        rank.as_str(),
                        format!("redefined as {expr} after {existing}"),
                    ));
                }
                continue;
            }
            self.eqn_exprs.push((root.clone(), expr.clone()));
            self.entry(&root);
            if expr.as_var() == Some(root.as_str()) {
                continue;
            }
            self.entry(&root).push(expr.clone());
            // Solve the equation for every variable it mentions.
            let vars: Vec<String> = expr.atoms().map(str::to_string).collect();
            for var in vars {
                if let Some(solution) = expr.solve_for(&root, &var) {
                    self.entry(&var).push(solution);
                }
            }
        }
        Ok(())
    }

    /// All candidate expressions for `var`, the identity always included.
    pub fn get_all_exprs(&self, var: &str) -> Vec<Expr> {
        match self.all_exprs.get(var) {
            Some(exprs) => exprs.clone(),
            None => vec![Expr::var(var)],
        }
    }

    /// The unique candidate for `var` satisfying `cond`.
    ///
    /// Zero or several matches mean the caller's assumption about the index
    /// math is wrong, which is fatal here rather than at use distance.
    pub fn get_cond_expr<F>(&self, var: &str, cond: F) -> Result<Expr, SchedError>
    where
        F: Fn(&Expr) -> bool,
    {
        let matches: Vec<Expr> = self
            .get_all_exprs(var)
            .into_iter()
            .filter(|e| cond(e))
            .collect();
        match matches.len() {
            1 => Ok(matches.into_iter().next().expect("one match")),
            n => Err(SchedError::AmbiguousTranslation {
                var: var.to_string(),
                matches: n,
            }),
        }
    }

    /// Narrows every variable to its first candidate whose free variables are
    /// all in `available`. Must run exactly once, after the loop order is
    /// final.
    pub fn prune(&mut self, available: &BTreeSet<String>) -> Result<(), SchedError> {
        if self.trans.is_some() {
            return Err(SchedError::AlreadyPruned);
        }
        let mut trans = HashMap::new();
        for (var, exprs) in &self.all_exprs {
            let survivor = exprs
                .iter()
                .find(|e| e.atoms().all(|a| available.contains(a)));
            if let Some(expr) = survivor {
                trans.insert(var.clone(), expr.clone());
            }
        }
        // Variables never mentioned by any equation translate to themselves.
        for var in available {
            trans
                .entry(var.clone())
                .or_insert_with(|| Expr::var(var.clone()));
        }
        self.trans = Some(trans);
        Ok(())
    }

    /// Post-prune translation for `var`.
    pub fn get_trans(&self, var: &str) -> Result<&Expr, SchedError> {
        let trans = self.trans.as_ref().ok_or(SchedError::NotPruned)?;
        trans.get(var).ok_or_else(|| SchedError::NoTranslation {
            var: var.to_string(),
        })
    }

    /// Raw equations in declaration order.
    pub fn eqn_exprs(&self) -> &[(String, Expr)] {
        &self.eqn_exprs
    }

    /// True when `var` appears in (or defines) a non-identity equation.
    /// Flatten validation refuses such ranks.
    pub fn participates_in_index_math(&self, var: &str) -> bool {
        self.eqn_exprs.iter().any(|(root, expr)| {
            if expr.as_var() == Some(root.as_str()) {
                return false;
            }
            root == var || expr.mentions(var)
        })
    }

    fn entry(&mut self, var: &str) -> &mut Vec<Expr> {
        self.all_exprs
            .entry(var.to_string())
            .or_insert_with(|| vec![Expr::var(var)])
    }
}
