
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use imbl::Vector;
use once_cell::sync::Lazy;

use crate::hc::{Hc, SharedFactory};
use crate::level::{Level, LevelExt};
use crate::name::Name;

pub type Expr = Hc<ExprCell>;

/// Expression node plus per-node caches. Hashing and equality look at the
/// data only; the caches are derived from it deterministically.
#[derive(Debug, Clone)]
pub struct ExprCell {
    pub data: ExprData,
    fvar_range: usize,
    has_metavar: bool,
}

impl PartialEq for ExprCell {
    fn eq(&self, other: &Self) -> bool { self.data == other.data }
}
impl Eq for ExprCell { }

impl Hash for ExprCell {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.hash(state);
    }
}

#[derive(Debug, Hash, Clone, PartialEq, Eq)]
pub enum ExprData {
    /// Bound variable as a de Bruijn index.
    Var(usize),
    Constant { name: Name, ty: Option<Expr>, levels: Vec<Level> },
    Type(Level),
    Value(SemanticValue),
    /// Flattened application: at least two entries, head never an `App`.
    App(Vec<Expr>),
    Lambda { name: Name, domain: Expr, body: Expr },
    Pi { name: Name, domain: Expr, body: Expr },
    Eq { lhs: Expr, rhs: Expr },
    Let { name: Name, ty: Option<Expr>, value: Expr, body: Expr },
    MetaVar { name: Name, lctx: LocalContext },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprKind {
    Var, Constant, Type, Value, App, Lambda, Pi, Eq, Let, MetaVar,
}

/// Deferred operation on a metavariable's eventual assignment. The head entry
/// of a local context is the outermost (most recently recorded) operation.
#[derive(Debug, Hash, Clone, PartialEq, Eq)]
pub enum LocalEntry {
    Lift { s: usize, n: usize },
    Inst { s: usize, value: Expr },
}

pub type LocalContext = Vector<LocalEntry>;

impl LocalEntry {
    pub fn is_lift(&self) -> bool { matches!(self, LocalEntry::Lift { .. }) }
    pub fn is_inst(&self) -> bool { matches!(self, LocalEntry::Inst { .. }) }
}

/// Built-in value with an attached reduction hook. Equality and hashing
/// delegate to the name.
pub trait BuiltinValue: fmt::Debug + Send + Sync {
    fn name(&self) -> Name;
    fn ty(&self) -> Expr;
    fn normalize(&self, args: &[Expr]) -> Option<Expr> {
        let _ = args;
        None
    }
}

#[derive(Debug, Clone)]
pub struct SemanticValue(Arc<dyn BuiltinValue>);

impl SemanticValue {
    pub fn new(value: Arc<dyn BuiltinValue>) -> SemanticValue {
        SemanticValue(value)
    }

    pub fn name(&self) -> Name { self.0.name() }
    pub fn ty(&self) -> Expr { self.0.ty() }
    pub fn normalize(&self, args: &[Expr]) -> Option<Expr> { self.0.normalize(args) }
}

impl PartialEq for SemanticValue {
    fn eq(&self, other: &Self) -> bool { self.name() == other.name() }
}
impl Eq for SemanticValue { }

impl Hash for SemanticValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name().hash(state);
    }
}

static EXPRS: Lazy<SharedFactory<ExprCell>> =
    Lazy::new(|| SharedFactory::with_capacity(4096));

fn range_under_binder(r: usize) -> usize {
    if r == usize::MAX { r } else { r.saturating_sub(1) }
}

fn compute_caches(data: &ExprData) -> (usize, bool) {
    match data {
        ExprData::Var(i) => (i + 1, false),
        ExprData::Constant { ty, .. } => {
            let has_meta = ty.as_ref().map_or(false, |t| t.has_metavar());
            (0, has_meta)
        }
        ExprData::Type(_) | ExprData::Value(_) => (0, false),
        ExprData::App(args) => {
            let range = args.iter().map(|a| a.fvar_range()).max().unwrap_or(0);
            let has_meta = args.iter().any(|a| a.has_metavar());
            (range, has_meta)
        }
        ExprData::Lambda { domain, body, .. } | ExprData::Pi { domain, body, .. } => {
            let range = domain.fvar_range().max(range_under_binder(body.fvar_range()));
            (range, domain.has_metavar() || body.has_metavar())
        }
        ExprData::Eq { lhs, rhs } => {
            (lhs.fvar_range().max(rhs.fvar_range()), lhs.has_metavar() || rhs.has_metavar())
        }
        ExprData::Let { ty, value, body, .. } => {
            let ty_range = ty.as_ref().map_or(0, |t| t.fvar_range());
            let range = ty_range
                .max(value.fvar_range())
                .max(range_under_binder(body.fvar_range()));
            let has_meta = ty.as_ref().map_or(false, |t| t.has_metavar())
                || value.has_metavar()
                || body.has_metavar();
            (range, has_meta)
        }
        // A metavariable may stand for anything in scope.
        ExprData::MetaVar { .. } => (usize::MAX, true),
    }
}

fn make(data: ExprData) -> Expr {
    let (fvar_range, has_metavar) = compute_caches(&data);
    EXPRS.make(ExprCell { data, fvar_range, has_metavar })
}

pub fn mk_var(idx: usize) -> Expr {
    make(ExprData::Var(idx))
}

pub fn mk_constant(name: Name) -> Expr {
    make(ExprData::Constant { name, ty: None, levels: Vec::new() })
}

pub fn mk_constant_with(name: Name, ty: Option<Expr>, levels: Vec<Level>) -> Expr {
    make(ExprData::Constant { name, ty, levels })
}

pub fn mk_type(level: Level) -> Expr {
    make(ExprData::Type(level))
}

pub fn mk_value(value: SemanticValue) -> Expr {
    make(ExprData::Value(value))
}

/// Build an application, flattening a head that is itself an application.
pub fn mk_app(args: Vec<Expr>) -> Expr {
    let mut iter = args.into_iter();
    let head = match iter.next() {
        Some(head) => head,
        None => return mk_var(0),
    };
    let mut flat = match &head.data {
        ExprData::App(inner) => inner.clone(),
        _ => vec![head],
    };
    flat.extend(iter);
    if flat.len() == 1 {
        flat.remove(0)
    } else {
        make(ExprData::App(flat))
    }
}

pub fn mk_app2(f: Expr, arg: Expr) -> Expr {
    mk_app(vec![f, arg])
}

pub fn mk_lambda(name: Name, domain: Expr, body: Expr) -> Expr {
    make(ExprData::Lambda { name, domain, body })
}

pub fn mk_pi(name: Name, domain: Expr, body: Expr) -> Expr {
    make(ExprData::Pi { name, domain, body })
}

pub fn mk_eq(lhs: Expr, rhs: Expr) -> Expr {
    make(ExprData::Eq { lhs, rhs })
}

pub fn mk_let(name: Name, ty: Option<Expr>, value: Expr, body: Expr) -> Expr {
    make(ExprData::Let { name, ty, value, body })
}

pub fn mk_metavar(name: Name, lctx: LocalContext) -> Expr {
    make(ExprData::MetaVar { name, lctx })
}

/// Push an entry onto the front of a local context, collapsing a pushed lift
/// into a head lift it directly extends.
pub fn lctx_push(lctx: &LocalContext, entry: LocalEntry) -> LocalContext {
    if let (LocalEntry::Lift { s, n }, Some(LocalEntry::Lift { s: hs, n: hn })) =
        (&entry, lctx.front())
    {
        if *s == hs + hn {
            let mut rest = lctx.clone();
            rest.pop_front();
            rest.push_front(LocalEntry::Lift { s: *hs, n: hn + n });
            return rest;
        }
    }
    let mut result = lctx.clone();
    result.push_front(entry);
    result
}

/// Drop the head entry of a metavariable's local context.
pub fn pop_lctx(m: &Expr) -> Expr {
    match &m.data {
        ExprData::MetaVar { name, lctx } => {
            let mut rest = lctx.clone();
            rest.pop_front();
            mk_metavar(name.clone(), rest)
        }
        _ => m.clone(),
    }
}

impl ExprCell {
    pub fn kind(&self) -> ExprKind {
        match &self.data {
            ExprData::Var(_) => ExprKind::Var,
            ExprData::Constant { .. } => ExprKind::Constant,
            ExprData::Type(_) => ExprKind::Type,
            ExprData::Value(_) => ExprKind::Value,
            ExprData::App(_) => ExprKind::App,
            ExprData::Lambda { .. } => ExprKind::Lambda,
            ExprData::Pi { .. } => ExprKind::Pi,
            ExprData::Eq { .. } => ExprKind::Eq,
            ExprData::Let { .. } => ExprKind::Let,
            ExprData::MetaVar { .. } => ExprKind::MetaVar,
        }
    }

    /// Exclusive upper bound on the free de Bruijn indices of this node.
    /// `usize::MAX` means unknown (the node contains a metavariable whose
    /// assignment may mention anything in scope).
    pub fn fvar_range(&self) -> usize { self.fvar_range }

    pub fn closed(&self) -> bool { self.fvar_range == 0 }

    pub fn has_metavar(&self) -> bool { self.has_metavar }

    pub fn is_var(&self) -> bool { matches!(self.data, ExprData::Var(_)) }
    pub fn is_app(&self) -> bool { matches!(self.data, ExprData::App(_)) }
    pub fn is_type(&self) -> bool { matches!(self.data, ExprData::Type(_)) }
    pub fn is_value(&self) -> bool { matches!(self.data, ExprData::Value(_)) }
    pub fn is_metavar(&self) -> bool { matches!(self.data, ExprData::MetaVar { .. }) }
    pub fn is_lambda(&self) -> bool { matches!(self.data, ExprData::Lambda { .. }) }
    pub fn is_pi(&self) -> bool { matches!(self.data, ExprData::Pi { .. }) }
    pub fn is_let(&self) -> bool { matches!(self.data, ExprData::Let { .. }) }
    pub fn is_eq(&self) -> bool { matches!(self.data, ExprData::Eq { .. }) }

    pub fn is_abstraction(&self) -> bool {
        self.is_lambda() || self.is_pi()
    }

    pub fn var_idx(&self) -> Option<usize> {
        match self.data {
            ExprData::Var(i) => Some(i),
            _ => None,
        }
    }

    pub fn ty_level(&self) -> Option<Level> {
        match &self.data {
            ExprData::Type(l) => Some(l.clone()),
            _ => None,
        }
    }

    pub fn args(&self) -> &[Expr] {
        match &self.data {
            ExprData::App(args) => args,
            _ => &[],
        }
    }

    pub fn metavar_name(&self) -> Option<&Name> {
        match &self.data {
            ExprData::MetaVar { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn metavar_lctx(&self) -> Option<&LocalContext> {
        match &self.data {
            ExprData::MetaVar { lctx, .. } => Some(lctx),
            _ => None,
        }
    }

    pub fn has_local_context(&self) -> bool {
        self.metavar_lctx().map_or(false, |lctx| !lctx.is_empty())
    }
}

/// Replace the head of an application (or the expression itself when it is
/// not one), reflattening.
pub fn update_app_head(a: &Expr, new_head: Expr) -> Expr {
    match &a.data {
        ExprData::App(args) => {
            let mut new_args = vec![new_head];
            new_args.extend(args[1..].iter().cloned());
            mk_app(new_args)
        }
        _ => new_head,
    }
}

/// Rebuild an abstraction with a new domain and body, keeping its kind.
pub fn update_abstraction(a: &Expr, domain: Expr, body: Expr) -> Expr {
    match &a.data {
        ExprData::Lambda { name, .. } => mk_lambda(name.clone(), domain, body),
        ExprData::Pi { name, .. } => mk_pi(name.clone(), domain, body),
        _ => a.clone(),
    }
}

pub fn abst_domain(a: &Expr) -> Option<&Expr> {
    match &a.data {
        ExprData::Lambda { domain, .. } | ExprData::Pi { domain, .. } => Some(domain),
        _ => None,
    }
}

pub fn abst_body(a: &Expr) -> Option<&Expr> {
    match &a.data {
        ExprData::Lambda { body, .. } | ExprData::Pi { body, .. } => Some(body),
        _ => None,
    }
}

pub fn abst_name(a: &Expr) -> Option<&Name> {
    match &a.data {
        ExprData::Lambda { name, .. } | ExprData::Pi { name, .. } => Some(name),
        _ => None,
    }
}

/// Does `e` have a free variable with index in `[s, t)`?
///
/// Metavariables answer conservatively: unless the head of the local context
/// is a lift covering the whole range (those indices were just created by the
/// lift and cannot occur), the assignment may mention them.
pub fn has_free_in(e: &Expr, s: usize, t: usize) -> bool {
    if s >= t || e.fvar_range() <= s {
        return false;
    }
    match &e.data {
        ExprData::Var(i) => s <= *i && *i < t,
        ExprData::Constant { .. } | ExprData::Type(_) | ExprData::Value(_) => false,
        ExprData::App(args) => args.iter().any(|a| has_free_in(a, s, t)),
        ExprData::Lambda { domain, body, .. } | ExprData::Pi { domain, body, .. } => {
            has_free_in(domain, s, t) || has_free_in(body, s + 1, t + 1)
        }
        ExprData::Eq { lhs, rhs } => has_free_in(lhs, s, t) || has_free_in(rhs, s, t),
        ExprData::Let { ty, value, body, .. } => {
            ty.as_ref().map_or(false, |x| has_free_in(x, s, t))
                || has_free_in(value, s, t)
                || has_free_in(body, s + 1, t + 1)
        }
        ExprData::MetaVar { lctx, .. } => {
            match lctx.front() {
                Some(LocalEntry::Lift { s: ls, n: ln }) => !(*ls <= s && t <= ls + ln),
                _ => true,
            }
        }
    }
}

impl fmt::Display for SemanticValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::Display for LocalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalEntry::Lift { s, n } => write!(f, "lift:{}:{}", s, n),
            LocalEntry::Inst { s, value } => write!(f, "inst:{} {}", s, value),
        }
    }
}

impl fmt::Display for ExprCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            ExprData::Var(i) => write!(f, "#{}", i),
            ExprData::Constant { name, .. } => write!(f, "{}", name),
            ExprData::Type(l) => {
                if l.is_bottom() { write!(f, "Type") }
                else { write!(f, "(Type {})", l) }
            }
            ExprData::Value(v) => write!(f, "{}", v),
            ExprData::App(args) => {
                write!(f, "(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 { write!(f, " ")?; }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            ExprData::Lambda { name, domain, body } => {
                write!(f, "(fun {} : {}, {})", name, domain, body)
            }
            ExprData::Pi { name, domain, body } => {
                write!(f, "(Pi {} : {}, {})", name, domain, body)
            }
            ExprData::Eq { lhs, rhs } => write!(f, "({} = {})", lhs, rhs),
            ExprData::Let { name, value, body, .. } => {
                write!(f, "(let {} := {} in {})", name, value, body)
            }
            ExprData::MetaVar { name, lctx } => {
                write!(f, "?{}", name)?;
                if !lctx.is_empty() {
                    write!(f, "[")?;
                    for (i, entry) in lctx.iter().enumerate() {
                        if i > 0 { write!(f, ", ")?; }
                        write!(f, "{}", entry)?;
                    }
                    write!(f, "]")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::mk_name;

    #[test]
    fn structural_equality_is_pointer_equality() {
        let a = mk_lambda(mk_name("x"), mk_type(crate::level::bottom()), mk_var(0));
        let b = mk_lambda(mk_name("x"), mk_type(crate::level::bottom()), mk_var(0));
        assert_eq!(a, b);
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn applications_flatten() {
        let f = mk_constant(mk_name("f"));
        let a = mk_constant(mk_name("a"));
        let b = mk_constant(mk_name("b"));
        let fa = mk_app(vec![f.clone(), a.clone()]);
        let fab = mk_app(vec![fa, b.clone()]);
        assert_eq!(fab, mk_app(vec![f, a, b]));
        assert_eq!(fab.args().len(), 3);
    }

    #[test]
    fn fvar_ranges() {
        let x = mk_var(0);
        let y = mk_var(3);
        assert_eq!(x.fvar_range(), 1);
        assert_eq!(y.fvar_range(), 4);
        let lam = mk_lambda(mk_name("x"), mk_constant(mk_name("T")), mk_var(0));
        assert!(lam.closed());
        let open_lam = mk_lambda(mk_name("x"), mk_constant(mk_name("T")), mk_var(2));
        assert_eq!(open_lam.fvar_range(), 2);
        assert!(has_free_in(&open_lam, 1, 2));
        assert!(!has_free_in(&open_lam, 0, 1));
    }

    #[test]
    fn lift_entries_compose() {
        let lctx = lctx_push(&LocalContext::new(), LocalEntry::Lift { s: 0, n: 2 });
        let lctx = lctx_push(&lctx, LocalEntry::Lift { s: 2, n: 3 });
        assert_eq!(lctx.len(), 1);
        assert_eq!(lctx.front(), Some(&LocalEntry::Lift { s: 0, n: 5 }));
        let lctx = lctx_push(&lctx, LocalEntry::Lift { s: 7, n: 1 });
        assert_eq!(lctx.len(), 2);
    }

    #[test]
    fn metavar_free_vars_are_conservative() {
        let m = mk_metavar(mk_name("m"), LocalContext::new());
        assert!(!m.closed());
        assert!(has_free_in(&m, 0, 1));
        let lifted = mk_metavar(
            mk_name("m"),
            lctx_push(&LocalContext::new(), LocalEntry::Lift { s: 0, n: 2 }),
        );
        assert!(!has_free_in(&lifted, 0, 2));
        assert!(!has_free_in(&lifted, 1, 2));
        assert!(has_free_in(&lifted, 0, 3));
    }
}
