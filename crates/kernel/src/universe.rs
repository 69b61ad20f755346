
use ahash::AHashMap;

use crate::error::KernelError;
use crate::level::{Level, LevelData, LevelExt};
use crate::name::Name;

/// Store of universe constraints `u >= v + k` over universe variables, kept
/// transitively closed so implication queries are a single map lookup.
#[derive(Debug, Clone, Default)]
pub struct UniverseConstraints {
    distances: AHashMap<(Name, Name), i64>,
}

/// Offsets beyond this bound are reported as overflows rather than silently
/// wrapping during closure updates.
const MAX_OFFSET: i64 = i32::MAX as i64;

impl UniverseConstraints {
    pub fn new() -> UniverseConstraints {
        UniverseConstraints::default()
    }

    pub fn add_var(&mut self, n: Name) {
        self.distances.entry((n.clone(), n)).or_insert(0);
    }

    pub fn get_distance(&self, u: &Name, v: &Name) -> Option<i64> {
        self.distances.get(&(u.clone(), v.clone())).copied()
    }

    /// Is `u >= v + k` implied by the asserted constraints?
    pub fn is_implied(&self, u: &Name, v: &Name, k: i64) -> bool {
        if u == v {
            k <= 0
        } else {
            self.get_distance(u, v).map_or(false, |d| d >= k)
        }
    }

    /// Would asserting `u >= v + k` keep the store free of positive cycles?
    pub fn is_consistent(&self, u: &Name, v: &Name, k: i64) -> bool {
        if u == v {
            k <= 0
        } else {
            self.get_distance(v, u).map_or(true, |back| back + k <= 0)
        }
    }

    /// Would asserting `u >= v + k` push some closure entry out of range?
    pub fn overflows(&self, u: &Name, v: &Name, k: i64) -> bool {
        if k.abs() > MAX_OFFSET {
            return true;
        }
        let into_u = self.distances.iter()
            .filter(|((_, t), _)| t == u)
            .map(|(_, d)| *d)
            .max()
            .unwrap_or(0);
        let from_v = self.distances.iter()
            .filter(|((s, _), _)| s == v)
            .map(|(_, d)| *d)
            .max()
            .unwrap_or(0);
        into_u + k + from_v > MAX_OFFSET
    }

    /// Assert `u >= v + k` and restore transitive closure.
    pub fn add_constraint(&mut self, u: Name, v: Name, k: i64) {
        self.add_var(u.clone());
        self.add_var(v.clone());
        let into_u: Vec<(Name, i64)> = self.distances.iter()
            .filter(|((_, t), _)| *t == u)
            .map(|((s, _), d)| (s.clone(), *d))
            .collect();
        let from_v: Vec<(Name, i64)> = self.distances.iter()
            .filter(|((s, _), _)| *s == v)
            .map(|((_, t), d)| (t.clone(), *d))
            .collect();
        for (a, d1) in &into_u {
            for (b, d2) in &from_v {
                if a == b {
                    continue;
                }
                let candidate = d1 + k + d2;
                let entry = self.distances.entry((a.clone(), b.clone()));
                let slot = entry.or_insert(candidate);
                if *slot < candidate {
                    *slot = candidate;
                }
            }
        }
    }

    /// Is `l1 >= l2 + k` implied? A max on the right requires every child to
    /// be dominated; a max on the left requires some child to dominate; lifts
    /// fold into the offset.
    pub fn is_ge(&self, l1: &Level, l2: &Level, k: i64) -> bool {
        if l1 == l2 {
            return k <= 0;
        }
        match &**l2 {
            LevelData::UVar(v2) => match &**l1 {
                LevelData::UVar(v1) => self.is_implied(v1, v2, k),
                LevelData::Lift { base, offset } => {
                    self.is_ge(base, l2, k.saturating_sub(*offset as i64))
                }
                LevelData::Max(children) => {
                    children.iter().any(|c| self.is_ge(c, l2, k))
                }
            },
            LevelData::Lift { base, offset } => {
                self.is_ge(l1, base, k.saturating_add(*offset as i64))
            }
            LevelData::Max(children) => {
                children.iter().all(|c| self.is_ge(l1, c, k))
            }
        }
    }

    /// Assert every basic constraint implied by `n >= l + k`.
    pub fn add_level_constraint(&mut self, n: &Name, l: &Level, k: i64) {
        match &**l {
            LevelData::UVar(v) => self.add_constraint(n.clone(), v.clone(), k),
            LevelData::Lift { base, offset } => {
                self.add_level_constraint(n, base, k.saturating_add(*offset as i64))
            }
            LevelData::Max(children) => {
                for c in children {
                    self.add_level_constraint(n, c, k);
                }
            }
        }
    }

    /// Check `n >= l + k` before asserting it.
    pub fn check_level_consistency(&self, n: &Name, l: &Level, k: i64) -> Result<(), KernelError> {
        match &**l {
            LevelData::UVar(v) => {
                if !self.is_consistent(n, v, k) {
                    return Err(KernelError::UniverseInconsistency {
                        lhs: n.clone(), rhs: v.clone(), offset: k
                    });
                }
                if self.overflows(n, v, k) {
                    return Err(KernelError::UniverseOverflow {
                        lhs: n.clone(), rhs: v.clone(), offset: k
                    });
                }
                Ok(())
            }
            LevelData::Lift { base, offset } => {
                self.check_level_consistency(n, base, k.saturating_add(*offset as i64))
            }
            LevelData::Max(children) => {
                for c in children {
                    self.check_level_consistency(n, c, k)?;
                }
                Ok(())
            }
        }
    }

    pub fn has_var(&self, n: &Name) -> bool {
        self.distances.contains_key(&(n.clone(), n.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::{bottom, mk_max, mk_max_of, mk_uvar};
    use crate::name::mk_name;

    struct TestStore {
        ucs: UniverseConstraints,
    }

    impl TestStore {
        fn new() -> TestStore {
            let mut ucs = UniverseConstraints::new();
            ucs.add_var(mk_name("bot"));
            TestStore { ucs }
        }

        fn define(&mut self, n: &str, l: Level) -> Level {
            let name = mk_name(n);
            self.ucs.add_var(name.clone());
            self.ucs.add_level_constraint(&name, &l, 0);
            mk_uvar(name)
        }

        fn is_ge(&self, l1: &Level, l2: &Level) -> bool {
            self.ucs.is_ge(l1, l2, 0)
        }
    }

    #[test]
    fn chained_offsets_are_implied() {
        let mut store = TestStore::new();
        let l1 = store.define("l1", bottom());
        let l2 = store.define("l2", l1.add(10));
        let l3 = store.define("l3", mk_max(l2.clone(), l1.add(3)));
        let l4 = store.define("l4", mk_max_of(vec![l1.add(8), l2.add(2), l3.add(20)]));
        assert!(store.is_ge(&l4.add(10), &l3.add(30)));
        assert!(!store.is_ge(&l4.add(9), &l3.add(30)));
    }

    #[test]
    fn max_dispatch() {
        let mut store = TestStore::new();
        let l1 = store.define("l1", bottom().add(1));
        let l2 = store.define("l2", bottom().add(1));
        let l3 = store.define("l3", mk_max(l1.clone(), l2.clone()).add(1));
        let l4 = store.define("l4", l3.add(1));
        let l5 = store.define("l5", l3.add(1));
        let l6 = store.define("l6", mk_max(l4.clone(), l5.clone()).add(1));
        assert!(!store.is_ge(&l5.add(1), &l6));
        assert!(store.is_ge(&l6, &l5));
        assert!(store.is_ge(&l6, &mk_max_of(vec![l1.clone(), l2.clone(), l3.clone(), l4.clone(), l5.clone()])));
        assert!(store.is_ge(&l6, &l6));
        assert!(!store.is_ge(&l5, &l4));
        assert!(store.is_ge(
            &mk_max_of(vec![l1.clone(), l2.clone(), l4.clone(), l5.clone()]),
            &mk_max_of(vec![l1.clone(), l2.clone(), l3.clone(), l4.clone(), l5.clone()])
        ));
        assert!(store.is_ge(&mk_max(l4.clone(), l5.clone()), &mk_max_of(vec![l1.clone(), l2.clone(), l3.clone()])));
        assert!(!store.is_ge(&mk_max(l2.clone(), l4.clone()), &mk_max_of(vec![l1.clone(), l2.clone(), l3.clone(), l4.clone(), l5.clone()])));
        assert!(store.is_ge(&mk_max(l2.clone(), l3.clone()).add(1), &mk_max(l1.clone(), l1.add(1))));
        assert!(store.is_ge(&mk_max(l2.clone(), l3.clone()).add(1), &mk_max(l1.add(2), l1.add(1))));
        assert!(!store.is_ge(&mk_max(l4.clone(), l5.clone()).add(1), &mk_max(l2.add(4), l1.add(1))));
        assert!(!store.is_ge(&mk_max(l6.clone(), l5.clone()), &mk_max(l2.add(4), l1.add(1))));
        assert!(store.is_ge(&mk_max(l6.clone(), l5.clone()), &mk_max(l2.add(3), l1.add(1))));
        assert!(!store.is_ge(&mk_max(l6.clone(), l5.clone()), &mk_max(l2.clone(), l1.add(1)).add(3)));
        assert!(store.is_ge(&mk_max(l6.add(1), l5.clone()), &mk_max(l2.clone(), l1.add(1)).add(3)));
    }

    #[test]
    fn antisymmetry_up_to_offset() {
        let mut store = TestStore::new();
        let l1 = store.define("l1", bottom());
        let l2 = store.define("l2", l1.add(5));
        assert!(store.ucs.is_ge(&l2, &l1, 5));
        assert!(!store.ucs.is_ge(&l1, &l2, -4));
    }

    #[test]
    fn overflow_is_detected() {
        let mut store = TestStore::new();
        let l1 = store.define("l1", bottom());
        let l2 = store.define("l2", l1.add((1 << 30) + 1024));
        let l3_name = mk_name("l3");
        store.ucs.add_var(l3_name.clone());
        let result = store.ucs.check_level_consistency(&l3_name, &l2.add(1 << 30), 0);
        assert!(matches!(result, Err(KernelError::UniverseOverflow { .. })));
    }

    #[test]
    fn inconsistency_is_detected() {
        let mut store = TestStore::new();
        let l1 = store.define("l1", bottom());
        let _l2 = store.define("l2", l1.add(3));
        let l1_name = mk_name("l1");
        let l2_name = mk_name("l2");
        assert!(!store.ucs.is_consistent(&l2_name, &l2_name, 1));
        let result = store.ucs.check_level_consistency(&l1_name, &mk_uvar(l2_name).add(1), 0);
        assert!(matches!(result, Err(KernelError::UniverseInconsistency { .. })));
    }
}
