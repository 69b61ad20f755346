
use std::fmt;

use once_cell::sync::Lazy;

use crate::hc::{Hc, SharedFactory};
use crate::utility::Symbol;

pub type Name = Hc<NameData>;

#[derive(Debug, Hash, Clone, PartialEq, Eq)]
pub enum NameData {
    Anon,
    Str { parent: Name, part: Symbol },
    Num { parent: Name, part: u64 },
}

static NAMES: Lazy<SharedFactory<NameData>> =
    Lazy::new(|| SharedFactory::with_capacity(1024));

pub fn mk_anon() -> Name {
    NAMES.make(NameData::Anon)
}

pub fn mk_name(part: impl Into<Symbol>) -> Name {
    mk_anon().str(part)
}

pub trait NameExt {
    fn str(&self, part: impl Into<Symbol>) -> Name;
    fn num(&self, part: u64) -> Name;
    fn is_anon(&self) -> bool;
}

impl NameExt for Name {
    fn str(&self, part: impl Into<Symbol>) -> Name {
        NAMES.make(NameData::Str { parent: self.clone(), part: part.into() })
    }

    fn num(&self, part: u64) -> Name {
        NAMES.make(NameData::Num { parent: self.clone(), part })
    }

    fn is_anon(&self) -> bool {
        matches!(**self, NameData::Anon)
    }
}

impl fmt::Display for NameData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameData::Anon => write!(f, "_"),
            NameData::Str { parent, part } => {
                if parent.is_anon() { write!(f, "{}", part) }
                else { write!(f, "{}.{}", parent, part) }
            }
            NameData::Num { parent, part } => {
                if parent.is_anon() { write!(f, "{}", part) }
                else { write!(f, "{}.{}", parent, part) }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_shared() {
        let a = mk_name("foo").num(2);
        let b = mk_name("foo").num(2);
        assert_eq!(a, b);
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_ne!(a, mk_name("foo").num(3));
    }

    #[test]
    fn display_is_dotted() {
        let n = mk_name("kernel").str("normalizer").num(1);
        assert_eq!(n.to_string(), "kernel.normalizer.1");
    }
}
