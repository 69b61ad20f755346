
use std::fmt;

use once_cell::sync::Lazy;

use crate::hc::{Hc, SharedFactory};
use crate::name::{mk_name, Name};

pub type Level = Hc<LevelData>;

/// Universe expressions in normal form: lifts only ever wrap variables, and a
/// max node is flat, has at least two children, and keeps a single entry (the
/// one with the greatest offset) per base variable.
#[derive(Debug, Hash, Clone, PartialEq, Eq)]
pub enum LevelData {
    UVar(Name),
    Lift { base: Level, offset: u32 },
    Max(Vec<Level>),
}

static LEVELS: Lazy<SharedFactory<LevelData>> =
    Lazy::new(|| SharedFactory::with_capacity(256));

fn make(data: LevelData) -> Level {
    LEVELS.make(data)
}

pub fn mk_uvar(name: Name) -> Level {
    make(LevelData::UVar(name))
}

/// The bottom universe, always present in an environment.
pub fn bottom() -> Level {
    mk_uvar(mk_name("bot"))
}

pub trait LevelExt {
    fn add(&self, k: u32) -> Level;
    fn base(&self) -> Level;
    fn offset(&self) -> u32;
    fn is_bottom(&self) -> bool;
}

impl LevelExt for Level {
    fn add(&self, k: u32) -> Level {
        if k == 0 {
            return self.clone();
        }
        match &**self {
            LevelData::UVar(_) => make(LevelData::Lift { base: self.clone(), offset: k }),
            LevelData::Lift { base, offset } => {
                make(LevelData::Lift { base: base.clone(), offset: offset + k })
            }
            LevelData::Max(children) => {
                let lifted = children.iter().map(|c| c.add(k)).collect();
                mk_max_of(lifted)
            }
        }
    }

    /// The underlying variable of a variable or lift. Max nodes have no base.
    fn base(&self) -> Level {
        match &**self {
            LevelData::UVar(_) => self.clone(),
            LevelData::Lift { base, .. } => base.clone(),
            LevelData::Max(_) => self.clone(),
        }
    }

    fn offset(&self) -> u32 {
        match &**self {
            LevelData::Lift { offset, .. } => *offset,
            _ => 0,
        }
    }

    fn is_bottom(&self) -> bool {
        *self == bottom()
    }
}

fn push_dedup(acc: &mut Vec<Level>, l: Level) {
    for slot in acc.iter_mut() {
        if slot.base() == l.base() {
            if slot.offset() < l.offset() {
                *slot = l;
            }
            return;
        }
    }
    acc.push(l);
}

pub fn mk_max(l1: Level, l2: Level) -> Level {
    mk_max_of(vec![l1, l2])
}

pub fn mk_max_of(levels: Vec<Level>) -> Level {
    let mut acc = Vec::new();
    for l in levels {
        match &*l {
            LevelData::Max(children) => {
                for c in children {
                    push_dedup(&mut acc, c.clone());
                }
            }
            _ => push_dedup(&mut acc, l.clone()),
        }
    }
    match acc.len() {
        0 => bottom(),
        1 => acc.pop().unwrap_or_else(bottom),
        _ => make(LevelData::Max(acc)),
    }
}

impl fmt::Display for LevelData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LevelData::UVar(n) => write!(f, "{}", n),
            LevelData::Lift { base, offset } => write!(f, "{}+{}", base, offset),
            LevelData::Max(children) => {
                write!(f, "(max")?;
                for c in children {
                    write!(f, " {}", c)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uv(s: &str) -> Level { mk_uvar(mk_name(s)) }

    #[test]
    fn lift_merges_offsets() {
        let l = uv("l");
        assert_eq!(l.add(0), l);
        assert_eq!(l.add(2).add(3), l.add(5));
    }

    #[test]
    fn max_is_flat_and_deduplicated() {
        let (l1, l2) = (uv("l1"), uv("l2"));
        assert_eq!(mk_max(l1.clone(), l1.clone()), l1);
        assert_eq!(mk_max(l1.add(1), l1.add(1)), l1.add(1));
        assert_eq!(mk_max(l1.clone(), l1.add(1)), l1.add(1));
        assert_eq!(
            mk_max(l2.clone(), mk_max(l1.clone(), l1.add(1))),
            mk_max(l2.clone(), l1.add(1))
        );
        assert_eq!(
            mk_max(l1.clone(), mk_max(l2.clone(), l1.add(1))),
            mk_max(l1.add(1), l2.clone())
        );
    }

    #[test]
    fn lift_distributes_over_max() {
        let (l1, l2) = (uv("l1"), uv("l2"));
        assert_eq!(
            mk_max(l1.clone(), l2.clone()).add(3),
            mk_max(l1.add(3), l2.add(3))
        );
    }
}
