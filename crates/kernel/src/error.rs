
use thiserror::Error;

use crate::expr::Expr;
use crate::name::Name;

#[derive(Debug, Clone, Error)]
pub enum KernelError {
    #[error("'{name}' has already been declared")]
    AlreadyDeclared { name: Name },
    #[error("unknown object '{name}'")]
    UnknownObject { name: Name },
    #[error("unknown universe variable '{name}'")]
    UnknownUniverse { name: Name },
    #[error("environment cannot be updated because it has children environments")]
    ReadOnlyEnvironment,
    #[error("type mismatch in definition '{name}': expected {expected}, inferred {inferred}")]
    DefTypeMismatch { name: Name, expected: Expr, inferred: Expr },
    #[error("function expected at {expr}")]
    FunctionExpected { expr: Expr },
    #[error("type expected at {expr}")]
    TypeExpected { expr: Expr },
    #[error("unbound variable #{index}")]
    UnboundVariable { index: usize },
    #[error("universe constraint inconsistency: {lhs} >= {rhs} + {offset}")]
    UniverseInconsistency { lhs: Name, rhs: Name, offset: i64 },
    #[error("universe constraint produces an integer overflow: {lhs} >= {rhs} + {offset}")]
    UniverseOverflow { lhs: Name, rhs: Name, offset: i64 },
    #[error("maximum recursion depth exceeded")]
    DeepRecursion,
    #[error("interrupted")]
    Interrupted,
    #[error("corrupt module data: {detail}")]
    Corrupt { detail: String },
}
