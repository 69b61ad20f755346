
use std::fmt;

use crate::context::Context;
use crate::expr::Expr;
use crate::justification::Justification;
use crate::level::Level;

/// A unification problem handed to the elaborator.
#[derive(Debug, Clone)]
pub enum UnificationConstraint {
    /// `ctx |- lhs == rhs`
    Eq { ctx: Context, lhs: Expr, rhs: Expr, justification: Justification },
    /// `ctx |- from << to` (`from` convertible to `to`)
    Convertible { ctx: Context, from: Expr, to: Expr, justification: Justification },
    /// `ctx |- mvar == Type (max lhs rhs)`
    Max { ctx: Context, mvar: Expr, lhs: Level, rhs: Level, justification: Justification },
    /// `mvar` must equal one of the alternatives, tried in order.
    Choice { ctx: Context, mvar: Expr, alternatives: Vec<Expr>, justification: Justification },
}

impl UnificationConstraint {
    pub fn ctx(&self) -> &Context {
        match self {
            UnificationConstraint::Eq { ctx, .. }
            | UnificationConstraint::Convertible { ctx, .. }
            | UnificationConstraint::Max { ctx, .. }
            | UnificationConstraint::Choice { ctx, .. } => ctx,
        }
    }

    pub fn justification(&self) -> &Justification {
        match self {
            UnificationConstraint::Eq { justification, .. }
            | UnificationConstraint::Convertible { justification, .. }
            | UnificationConstraint::Max { justification, .. }
            | UnificationConstraint::Choice { justification, .. } => justification,
        }
    }

    pub fn is_eq(&self) -> bool {
        matches!(self, UnificationConstraint::Eq { .. })
    }

    pub fn is_convertible(&self) -> bool {
        matches!(self, UnificationConstraint::Convertible { .. })
    }

    /// Left- and right-hand sides of an equality or convertibility
    /// constraint.
    pub fn sides(&self) -> Option<(&Expr, &Expr)> {
        match self {
            UnificationConstraint::Eq { lhs, rhs, .. } => Some((lhs, rhs)),
            UnificationConstraint::Convertible { from, to, .. } => Some((from, to)),
            _ => None,
        }
    }
}

pub fn mk_eq_constraint(ctx: Context, lhs: Expr, rhs: Expr, justification: Justification) -> UnificationConstraint {
    UnificationConstraint::Eq { ctx, lhs, rhs, justification }
}

pub fn mk_convertible_constraint(ctx: Context, from: Expr, to: Expr, justification: Justification) -> UnificationConstraint {
    UnificationConstraint::Convertible { ctx, from, to, justification }
}

pub fn mk_max_constraint(ctx: Context, mvar: Expr, lhs: Level, rhs: Level, justification: Justification) -> UnificationConstraint {
    UnificationConstraint::Max { ctx, mvar, lhs, rhs, justification }
}

pub fn mk_choice_constraint(ctx: Context, mvar: Expr, alternatives: Vec<Expr>, justification: Justification) -> UnificationConstraint {
    UnificationConstraint::Choice { ctx, mvar, alternatives, justification }
}

impl fmt::Display for UnificationConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnificationConstraint::Eq { lhs, rhs, .. } => {
                write!(f, "{} == {}", lhs, rhs)
            }
            UnificationConstraint::Convertible { from, to, .. } => {
                write!(f, "{} << {}", from, to)
            }
            UnificationConstraint::Max { mvar, lhs, rhs, .. } => {
                write!(f, "{} == Type (max {} {})", mvar, lhs, rhs)
            }
            UnificationConstraint::Choice { mvar, alternatives, .. } => {
                write!(f, "{} in {{", mvar)?;
                for (i, alt) in alternatives.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}", alt)?;
                }
                write!(f, "}}")
            }
        }
    }
}
