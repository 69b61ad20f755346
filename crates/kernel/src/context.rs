
use std::fmt;

use imbl::Vector;

use crate::expr::Expr;
use crate::name::Name;

/// One binder or let-binding in scope. An entry with a body is a let.
#[derive(Debug, Hash, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    pub name: Name,
    pub domain: Option<Expr>,
    pub body: Option<Expr>,
}

impl ContextEntry {
    pub fn binder(name: Name, domain: Expr) -> ContextEntry {
        ContextEntry { name, domain: Some(domain), body: None }
    }

    pub fn let_binding(name: Name, domain: Option<Expr>, body: Expr) -> ContextEntry {
        ContextEntry { name, domain, body: Some(body) }
    }
}

/// Elaboration context. Entry `0` is the innermost (rightmost) binder.
#[derive(Debug, Hash, Clone, PartialEq, Eq, Default)]
pub struct Context(Vector<ContextEntry>);

impl Context {
    pub fn new() -> Context {
        Context(Vector::new())
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn extend(&self, name: Name, domain: Expr) -> Context {
        self.extend_with(ContextEntry::binder(name, domain))
    }

    pub fn extend_with(&self, entry: ContextEntry) -> Context {
        let mut inner = self.0.clone();
        inner.push_back(entry);
        Context(inner)
    }

    pub fn lookup(&self, i: usize) -> Option<&ContextEntry> {
        if i < self.len() {
            self.0.get(self.len() - 1 - i)
        } else {
            None
        }
    }

    /// The entry for index `i` together with the prefix context the entry's
    /// domain and body live in.
    pub fn lookup_ext(&self, i: usize) -> Option<(ContextEntry, Context)> {
        if i < self.len() {
            let pos = self.len() - 1 - i;
            let entry = self.0.get(pos)?.clone();
            Some((entry, Context(self.0.take(pos))))
        } else {
            None
        }
    }

    /// Drop the entries with indices in `[s, s + n)`.
    pub fn remove(&self, s: usize, n: usize) -> Context {
        if n == 0 || s >= self.len() {
            return self.clone();
        }
        let n = n.min(self.len() - s);
        let hi = self.len() - s;
        let lo = hi - n;
        let mut inner = self.0.clone();
        inner.slice(lo..hi);
        Context(inner)
    }

    pub fn iter(&self) -> imbl::vector::Iter<'_, ContextEntry> {
        self.0.iter()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, entry) in self.0.iter().enumerate() {
            if i > 0 { write!(f, ", ")?; }
            write!(f, "{}", entry.name)?;
            if let Some(domain) = &entry.domain {
                write!(f, " : {}", domain)?;
            }
            if let Some(body) = &entry.body {
                write!(f, " := {}", body)?;
            }
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::mk_constant;
    use crate::name::mk_name;

    fn ctx_abc() -> Context {
        Context::new()
            .extend(mk_name("a"), mk_constant(mk_name("A")))
            .extend(mk_name("b"), mk_constant(mk_name("B")))
            .extend(mk_name("c"), mk_constant(mk_name("C")))
    }

    #[test]
    fn lookup_counts_from_innermost() {
        let ctx = ctx_abc();
        assert_eq!(ctx.lookup(0).map(|e| e.name.clone()), Some(mk_name("c")));
        assert_eq!(ctx.lookup(2).map(|e| e.name.clone()), Some(mk_name("a")));
        assert!(ctx.lookup(3).is_none());
    }

    #[test]
    fn lookup_ext_returns_declaring_prefix() {
        let ctx = ctx_abc();
        let (entry, prefix) = ctx.lookup_ext(1).expect("entry");
        assert_eq!(entry.name, mk_name("b"));
        assert_eq!(prefix.len(), 1);
        assert_eq!(prefix.lookup(0).map(|e| e.name.clone()), Some(mk_name("a")));
    }

    #[test]
    fn remove_drops_a_range() {
        let ctx = ctx_abc();
        let trimmed = ctx.remove(1, 1);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed.lookup(0).map(|e| e.name.clone()), Some(mk_name("c")));
        assert_eq!(trimmed.lookup(1).map(|e| e.name.clone()), Some(mk_name("a")));
    }
}
