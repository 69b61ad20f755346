
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::constraint::UnificationConstraint;
use crate::context::Context;
use crate::expr::Expr;

/// Why a constraint exists or failed. Justifications form a DAG whose
/// `Assumption` leaves are case-split branches; conflict resolution walks it
/// through [`depends_on`].
#[derive(Debug, Clone)]
pub struct Justification(Arc<JustificationData>);

#[derive(Debug)]
pub enum JustificationData {
    /// A constraint supplied by the caller.
    Asserted,
    /// A case-split branch.
    Assumption { id: usize },
    /// Decomposition of a constraint into child constraints.
    Destruct { constraint: UnificationConstraint },
    /// Metavariable substitution applied to a constraint.
    Substitution { constraint: UnificationConstraint, children: Vec<Justification> },
    /// Normalization steps applied to both sides of a constraint.
    Normalize { constraint: UnificationConstraint },
    /// A metavariable assignment performed while processing a constraint.
    Assignment { constraint: UnificationConstraint },
    /// The type of an assigned metavariable must match its declared type.
    TypeOfMetavar { ctx: Context, mvar: Expr, expected: Expr, inferred: Expr, parent: Justification },
    /// A constraint was found unsatisfiable.
    UnificationFailure { constraint: UnificationConstraint },
    /// Every branch of a case split failed.
    FailureByCases { constraint: UnificationConstraint, failed: Vec<Justification> },
    /// A further solution was requested, invalidating the current branches.
    NextSolution { assumptions: Vec<Justification> },
}

impl Justification {
    fn new(data: JustificationData) -> Justification {
        Justification(Arc::new(data))
    }

    pub fn data(&self) -> &JustificationData {
        &self.0
    }

    fn key(&self) -> *const JustificationData {
        Arc::as_ptr(&self.0)
    }

    pub fn children(&self) -> Vec<Justification> {
        match self.data() {
            JustificationData::Asserted
            | JustificationData::Assumption { .. } => Vec::new(),
            JustificationData::Destruct { constraint }
            | JustificationData::Normalize { constraint }
            | JustificationData::Assignment { constraint }
            | JustificationData::UnificationFailure { constraint } => {
                vec![constraint.justification().clone()]
            }
            JustificationData::Substitution { constraint, children } => {
                let mut result = vec![constraint.justification().clone()];
                result.extend(children.iter().cloned());
                result
            }
            JustificationData::TypeOfMetavar { parent, .. } => vec![parent.clone()],
            JustificationData::FailureByCases { constraint, failed } => {
                let mut result = vec![constraint.justification().clone()];
                result.extend(failed.iter().cloned());
                result
            }
            JustificationData::NextSolution { assumptions } => assumptions.clone(),
        }
    }

    /// Render the justification and everything it depends on, one node per
    /// line. Shared nodes are printed once.
    pub fn explain(&self) -> String {
        fn walk(j: &Justification, depth: usize, visited: &mut HashSet<*const JustificationData>, out: &mut String) {
            for _ in 0..depth {
                out.push_str("  ");
            }
            out.push_str(&j.to_string());
            out.push('\n');
            if !visited.insert(j.key()) {
                return;
            }
            for child in j.children() {
                walk(&child, depth + 1, visited, out);
            }
        }
        let mut out = String::new();
        let mut visited = HashSet::new();
        walk(self, 0, &mut visited, &mut out);
        out
    }
}

impl PartialEq for Justification {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Justification { }

pub fn mk_asserted() -> Justification {
    Justification::new(JustificationData::Asserted)
}

pub fn mk_assumption(id: usize) -> Justification {
    Justification::new(JustificationData::Assumption { id })
}

pub fn mk_destruct(constraint: UnificationConstraint) -> Justification {
    Justification::new(JustificationData::Destruct { constraint })
}

pub fn mk_substitution(constraint: UnificationConstraint, children: Vec<Justification>) -> Justification {
    Justification::new(JustificationData::Substitution { constraint, children })
}

pub fn mk_normalize(constraint: UnificationConstraint) -> Justification {
    Justification::new(JustificationData::Normalize { constraint })
}

pub fn mk_assignment(constraint: UnificationConstraint) -> Justification {
    Justification::new(JustificationData::Assignment { constraint })
}

pub fn mk_typeof_metavar(ctx: Context, mvar: Expr, expected: Expr, inferred: Expr, parent: Justification) -> Justification {
    Justification::new(JustificationData::TypeOfMetavar { ctx, mvar, expected, inferred, parent })
}

pub fn mk_unification_failure(constraint: UnificationConstraint) -> Justification {
    Justification::new(JustificationData::UnificationFailure { constraint })
}

pub fn mk_failure_by_cases(constraint: UnificationConstraint, failed: Vec<Justification>) -> Justification {
    Justification::new(JustificationData::FailureByCases { constraint, failed })
}

pub fn mk_next_solution(assumptions: Vec<Justification>) -> Justification {
    Justification::new(JustificationData::NextSolution { assumptions })
}

/// Is `target` reachable from `j` in the justification DAG? Visited nodes
/// are remembered, so shared subgraphs are walked once.
pub fn depends_on(j: &Justification, target: &Justification) -> bool {
    let mut todo = vec![j.clone()];
    let mut visited: HashSet<*const JustificationData> = HashSet::new();
    while let Some(current) = todo.pop() {
        if current == *target {
            return true;
        }
        if !visited.insert(current.key()) {
            continue;
        }
        todo.extend(current.children());
    }
    false
}

impl fmt::Display for Justification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data() {
            JustificationData::Asserted => write!(f, "asserted"),
            JustificationData::Assumption { id } => write!(f, "assumption {}", id),
            JustificationData::Destruct { constraint } => {
                write!(f, "destruct of {}", constraint)
            }
            JustificationData::Substitution { constraint, .. } => {
                write!(f, "substitution into {}", constraint)
            }
            JustificationData::Normalize { constraint } => {
                write!(f, "normalization of {}", constraint)
            }
            JustificationData::Assignment { constraint } => {
                write!(f, "assignment from {}", constraint)
            }
            JustificationData::TypeOfMetavar { mvar, expected, inferred, .. } => {
                write!(f, "type of {} must match: declared {}, inferred {}", mvar, expected, inferred)
            }
            JustificationData::UnificationFailure { constraint } => {
                write!(f, "unification failure at {}", constraint)
            }
            JustificationData::FailureByCases { constraint, failed } => {
                write!(f, "all {} cases failed for {}", failed.len(), constraint)
            }
            JustificationData::NextSolution { .. } => write!(f, "next solution requested"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_is_dag_reachability() {
        let a0 = mk_assumption(0);
        let a1 = mk_assumption(1);
        let shared = mk_next_solution(vec![a0.clone()]);
        let top = mk_next_solution(vec![shared.clone(), shared.clone()]);
        assert!(depends_on(&top, &a0));
        assert!(depends_on(&top, &shared));
        assert!(!depends_on(&top, &a1));
        assert!(!depends_on(&a0, &top));
    }

    #[test]
    fn identity_not_structure() {
        let a = mk_assumption(7);
        let b = mk_assumption(7);
        assert_ne!(a, b);
        assert!(depends_on(&a, &a));
        assert!(!depends_on(&a, &b));
    }
}
