
use std::sync::Arc;

use crate::expr::{mk_type, mk_value, BuiltinValue, Expr, ExprData, SemanticValue};
use crate::level::{bottom, mk_uvar};
use crate::name::{mk_name, Name};

#[derive(Debug)]
struct BoolType;

impl BuiltinValue for BoolType {
    fn name(&self) -> Name { mk_name("Bool") }
    fn ty(&self) -> Expr { mk_type(bottom()) }
}

#[derive(Debug)]
struct BoolLit(bool);

impl BuiltinValue for BoolLit {
    fn name(&self) -> Name {
        if self.0 { mk_name("true") } else { mk_name("false") }
    }
    fn ty(&self) -> Expr { bool_type() }
}

/// The type of propositions.
pub fn bool_type() -> Expr {
    mk_value(SemanticValue::new(Arc::new(BoolType)))
}

pub fn mk_bool(b: bool) -> Expr {
    mk_value(SemanticValue::new(Arc::new(BoolLit(b))))
}

pub fn mk_true() -> Expr { mk_bool(true) }
pub fn mk_false() -> Expr { mk_bool(false) }

/// `TypeM`, the universe of "module" types, sits above `Type` and below
/// `TypeU`.
pub fn type_m() -> Expr {
    mk_type(mk_uvar(mk_name("M")))
}

/// `TypeU`, the top universe used by the elaborator's lower-bound ladder.
pub fn type_u() -> Expr {
    mk_type(mk_uvar(mk_name("U")))
}

pub fn is_bool_type(e: &Expr) -> bool {
    *e == bool_type()
}

/// Recover a builtin from its name, for module import.
pub fn lookup_builtin(name: &Name) -> Option<SemanticValue> {
    if *name == mk_name("Bool") {
        Some(SemanticValue::new(Arc::new(BoolType)))
    } else if *name == mk_name("true") {
        Some(SemanticValue::new(Arc::new(BoolLit(true))))
    } else if *name == mk_name("false") {
        Some(SemanticValue::new(Arc::new(BoolLit(false))))
    } else {
        None
    }
}

pub fn value_of(e: &Expr) -> Option<&SemanticValue> {
    match &e.data {
        ExprData::Value(v) => Some(v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_compare_by_name() {
        assert_eq!(mk_true(), mk_true());
        assert_ne!(mk_true(), mk_false());
        assert_ne!(mk_true(), bool_type());
        assert!(is_bool_type(&bool_type()));
    }

    #[test]
    fn builtin_registry_round_trips() {
        for e in [bool_type(), mk_true(), mk_false()] {
            let v = value_of(&e).expect("builtin");
            let recovered = lookup_builtin(&v.name()).expect("registered");
            assert_eq!(mk_value(recovered), e);
        }
    }
}
