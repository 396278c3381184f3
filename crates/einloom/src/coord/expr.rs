//! Minimal affine expression algebra over loop index variables.
//!
//! Expressions are sums of integer-scaled variables plus a constant, kept in
//! canonical form (terms sorted by variable, zero coefficients dropped) so
//! that equality and hashing are structural. This is all the index math the
//! scheduler needs; there is no general symbolic engine behind it.

use std::fmt;
use std::ops::{Add, Neg, Sub};

/// One `coeff * var` term of an affine expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Term {
    pub coeff: i64,
    pub var: String,
}

/// Canonical affine expression: `sum(coeff_i * var_i) + constant`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Expr {
    terms: Vec<Term>,
    constant: i64,
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::scaled_var(1, name)
    }

    pub fn constant(value: i64) -> Self {
        Expr {
            terms: Vec::new(),
            constant: value,
        }
    }

    pub fn scaled_var(coeff: i64, name: impl Into<String>) -> Self {
        let mut expr = Expr::constant(0);
        expr.accumulate(coeff, &name.into());
        expr
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn constant_part(&self) -> i64 {
        self.constant
    }

    /// Free variables, sorted by name.
    pub fn atoms(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|t| t.var.as_str())
    }

    /// If the expression is exactly one unscaled variable, returns its name.
    pub fn as_var(&self) -> Option<&str> {
        match self.terms.as_slice() {
            [term] if term.coeff == 1 && self.constant == 0 => Some(&term.var),
            _ => None,
        }
    }

    pub fn coeff_of(&self, var: &str) -> i64 {
        self.terms
            .iter()
            .find(|t| t.var == var)
            .map(|t| t.coeff)
            .unwrap_or(0)
    }

    pub fn mentions(&self, var: &str) -> bool {
        self.coeff_of(var) != 0
    }

    pub fn scale(&self, k: i64) -> Expr {
        let mut out = Expr::constant(self.constant * k);
        for term in &self.terms {
            out.accumulate(term.coeff * k, &term.var);
        }
        out
    }

    /// Solves the equation `root = self` for `var`.
    ///
    /// Only variables carried with a unit coefficient are solvable; integer
    /// index spaces admit no division. Returns `None` otherwise.
    pub fn solve_for(&self, root: &str, var: &str) -> Option<Expr> {
        let coeff = self.coeff_of(var);
        if coeff != 1 && coeff != -1 {
            return None;
        }
        // root = rest + coeff * var  =>  var = coeff * (root - rest)
        let rest = self.clone() - Expr::scaled_var(coeff, var);
        let solved = (Expr::var(root) - rest).scale(coeff);
        Some(solved)
    }

    fn accumulate(&mut self, coeff: i64, var: &str) {
        if coeff == 0 {
            return;
        }
        match self.terms.binary_search_by(|t| t.var.as_str().cmp(var)) {
            Ok(at) => {
                self.terms[at].coeff += coeff;
                if self.terms[at].coeff == 0 {
                    self.terms.remove(at);
                }
            }
            Err(at) => self.terms.insert(
                at,
                Term {
                    coeff,
                    var: var.to_string(),
                },
            ),
        }
    }
}

impl Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        let mut out = self;
        out.constant += rhs.constant;
        for term in rhs.terms {
            out.accumulate(term.coeff, &term.var);
        }
        out
    }
}

impl Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        self + rhs.neg()
    }
}

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        self.scale(-1)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "{}", self.constant);
        }
        for (i, term) in self.terms.iter().enumerate() {
            let mag = term.coeff.abs();
            if i == 0 {
                if term.coeff < 0 {
                    f.write_str("-")?;
                }
            } else if term.coeff < 0 {
                f.write_str(" - ")?;
            } else {
                f.write_str(" + ")?;
            }
            if mag != 1 {
                write!(f, "{mag}*")?;
            }
            f.write_str(&term.var)?;
        }
        if self.constant > 0 {
            write!(f, " + {}", self.constant)?;
        } else if self.constant < 0 {
            write!(f, " - {}", -self.constant)?;
        }
        Ok(())
    }
}
