
use imbl::{HashMap, Vector};

use crate::context::Context;
use crate::expr::*;
use crate::justification::Justification;
use crate::name::{mk_anon, Name, NameExt};
use crate::subst::{instantiate, lift_free_vars};

#[derive(Debug, Clone)]
pub struct MetavarDecl {
    pub subst: Option<Expr>,
    pub ctx: Context,
    pub ty: Option<Expr>,
    pub justification: Option<Justification>,
}

/// The metavariable environment: assignment, creation context, optional
/// inferred type and justification per metavariable. Persistent, so case
/// splits can snapshot it by value.
#[derive(Debug, Clone, Default)]
pub struct MetavarEnv {
    decls: HashMap<Name, MetavarDecl>,
    order: Vector<Name>,
    next: usize,
}

impl MetavarEnv {
    pub fn new() -> MetavarEnv {
        MetavarEnv::default()
    }

    fn fresh_name(&mut self) -> Name {
        let name = mk_anon().str("M").num(self.next as u64);
        self.next += 1;
        name
    }

    pub fn mk_metavar(&mut self, ctx: Context) -> Expr {
        let name = self.fresh_name();
        self.decls.insert(name.clone(), MetavarDecl {
            subst: None,
            ctx,
            ty: None,
            justification: None,
        });
        self.order.push_back(name.clone());
        mk_metavar(name, LocalContext::new())
    }

    pub fn mk_metavar_with_type(&mut self, ctx: Context, ty: Expr) -> Expr {
        let m = self.mk_metavar(ctx);
        if let Some(name) = m.metavar_name() {
            self.set_type(name, ty);
        }
        m
    }

    pub fn decl(&self, name: &Name) -> Option<&MetavarDecl> {
        self.decls.get(name)
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.decls.contains_key(name)
    }

    pub fn is_assigned(&self, name: &Name) -> bool {
        self.decls.get(name).map_or(false, |d| d.subst.is_some())
    }

    pub fn subst_of(&self, name: &Name) -> Option<Expr> {
        self.decls.get(name).and_then(|d| d.subst.clone())
    }

    pub fn trace_of(&self, name: &Name) -> Option<Justification> {
        self.decls.get(name).and_then(|d| d.justification.clone())
    }

    pub fn ty_of(&self, name: &Name) -> Option<Expr> {
        self.decls.get(name).and_then(|d| d.ty.clone())
    }

    pub fn ctx_of(&self, name: &Name) -> Option<Context> {
        self.decls.get(name).map(|d| d.ctx.clone())
    }

    pub fn set_type(&mut self, name: &Name, ty: Expr) {
        if let Some(decl) = self.decls.get_mut(name) {
            decl.ty = Some(ty);
        }
    }

    /// Assign `v` to the metavariable. The caller is responsible for the
    /// occurs check; an existing assignment is never overwritten.
    pub fn assign(&mut self, name: &Name, v: Expr, justification: Justification) -> bool {
        match self.decls.get_mut(name) {
            Some(decl) if decl.subst.is_none() => {
                decl.subst = Some(v);
                decl.justification = Some(justification);
                true
            }
            _ => false,
        }
    }

    /// The first (oldest) metavariable without an assignment.
    pub fn find_unassigned(&self) -> Option<Name> {
        self.order.iter()
            .find(|name| !self.is_assigned(name))
            .cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &Name> {
        self.order.iter()
    }

    /// Upper bound on the free variables the interpretation of
    /// `?name[lctx]` can mention. `None` when the metavariable is unknown
    /// to this environment.
    pub fn scope_bound(&self, name: &Name, lctx: &LocalContext) -> Option<usize> {
        let decl = self.decls.get(name)?;
        let mut bound = decl.ctx.len();
        for entry in lctx.iter().rev() {
            match entry {
                LocalEntry::Lift { s, n } => {
                    if bound > *s {
                        bound = bound.saturating_add(*n);
                    }
                }
                LocalEntry::Inst { value, .. } => {
                    bound = bound.max(value.fvar_range());
                }
            }
        }
        Some(bound)
    }

    /// Does `e` mention metavariable `m`, taking current assignments into
    /// account?
    pub fn mentions(&self, e: &Expr, m: &Name) -> bool {
        match &e.data {
            ExprData::MetaVar { name, lctx } => {
                if name == m {
                    return true;
                }
                if let Some(v) = self.subst_of(name) {
                    if self.mentions(&v, m) {
                        return true;
                    }
                }
                lctx.iter().any(|entry| match entry {
                    LocalEntry::Inst { value, .. } => self.mentions(value, m),
                    LocalEntry::Lift { .. } => false,
                })
            }
            ExprData::App(args) => args.iter().any(|a| self.mentions(a, m)),
            ExprData::Lambda { domain, body, .. } | ExprData::Pi { domain, body, .. } => {
                self.mentions(domain, m) || self.mentions(body, m)
            }
            ExprData::Eq { lhs, rhs } => self.mentions(lhs, m) || self.mentions(rhs, m),
            ExprData::Let { ty, value, body, .. } => {
                ty.as_ref().map_or(false, |t| self.mentions(t, m))
                    || self.mentions(value, m)
                    || self.mentions(body, m)
            }
            _ => false,
        }
    }

    pub fn has_assigned_metavar(&self, e: &Expr) -> bool {
        if !e.has_metavar() {
            return false;
        }
        match &e.data {
            ExprData::MetaVar { name, lctx } => {
                self.is_assigned(name)
                    || lctx.iter().any(|entry| match entry {
                        LocalEntry::Inst { value, .. } => self.has_assigned_metavar(value),
                        LocalEntry::Lift { .. } => false,
                    })
            }
            ExprData::App(args) => args.iter().any(|a| self.has_assigned_metavar(a)),
            ExprData::Lambda { domain, body, .. } | ExprData::Pi { domain, body, .. } => {
                self.has_assigned_metavar(domain) || self.has_assigned_metavar(body)
            }
            ExprData::Eq { lhs, rhs } => {
                self.has_assigned_metavar(lhs) || self.has_assigned_metavar(rhs)
            }
            ExprData::Let { ty, value, body, .. } => {
                ty.as_ref().map_or(false, |t| self.has_assigned_metavar(t))
                    || self.has_assigned_metavar(value)
                    || self.has_assigned_metavar(body)
            }
            _ => false,
        }
    }

    /// Substitute every assigned metavariable in `e`, applying local
    /// contexts, and collect the justifications of the assignments used.
    pub fn instantiate_metavars(&self, e: &Expr) -> (Expr, Vec<Justification>) {
        let mut traces = Vec::new();
        let result = self.instantiate_metavars_core(e, &mut traces);
        (result, traces)
    }

    fn instantiate_metavars_core(&self, e: &Expr, traces: &mut Vec<Justification>) -> Expr {
        if !e.has_metavar() {
            return e.clone();
        }
        match &e.data {
            ExprData::MetaVar { name, lctx } => {
                let new_lctx: LocalContext = lctx.iter()
                    .map(|entry| match entry {
                        LocalEntry::Inst { s, value } => LocalEntry::Inst {
                            s: *s,
                            value: self.instantiate_metavars_core(value, traces),
                        },
                        lift @ LocalEntry::Lift { .. } => lift.clone(),
                    })
                    .collect();
                match self.subst_of(name) {
                    Some(v) => {
                        if let Some(trace) = self.trace_of(name) {
                            traces.push(trace);
                        }
                        let v = self.instantiate_metavars_core(&v, traces);
                        apply_local_context(&v, &new_lctx, Some(self))
                    }
                    None => mk_metavar(name.clone(), new_lctx),
                }
            }
            ExprData::App(args) => mk_app(
                args.iter().map(|a| self.instantiate_metavars_core(a, traces)).collect(),
            ),
            ExprData::Lambda { name, domain, body } => mk_lambda(
                name.clone(),
                self.instantiate_metavars_core(domain, traces),
                self.instantiate_metavars_core(body, traces),
            ),
            ExprData::Pi { name, domain, body } => mk_pi(
                name.clone(),
                self.instantiate_metavars_core(domain, traces),
                self.instantiate_metavars_core(body, traces),
            ),
            ExprData::Eq { lhs, rhs } => mk_eq(
                self.instantiate_metavars_core(lhs, traces),
                self.instantiate_metavars_core(rhs, traces),
            ),
            ExprData::Let { name, ty, value, body } => mk_let(
                name.clone(),
                ty.as_ref().map(|t| self.instantiate_metavars_core(t, traces)),
                self.instantiate_metavars_core(value, traces),
                self.instantiate_metavars_core(body, traces),
            ),
            _ => e.clone(),
        }
    }

    /// Freeze the current assignments into a substitution.
    pub fn substitution(&self) -> Substitution {
        Substitution { menv: self.clone() }
    }
}

/// Apply the deferred operations of a local context to a term, innermost
/// entry first.
pub fn apply_local_context(v: &Expr, lctx: &LocalContext, menv: Option<&MetavarEnv>) -> Expr {
    let mut result = v.clone();
    for entry in lctx.iter().rev() {
        match entry {
            LocalEntry::Lift { s, n } => {
                result = lift_free_vars(&result, *s, *n, menv);
            }
            LocalEntry::Inst { s, value } => {
                result = instantiate(&result, *s, value, menv);
            }
        }
    }
    result
}

/// A complete (or partial) answer produced by the elaborator: a snapshot of
/// metavariable assignments.
#[derive(Debug, Clone)]
pub struct Substitution {
    menv: MetavarEnv,
}

impl Substitution {
    pub fn apply(&self, e: &Expr) -> Expr {
        let (result, _) = self.menv.instantiate_metavars(e);
        result
    }

    pub fn get(&self, name: &Name) -> Option<Expr> {
        self.menv.subst_of(name).map(|v| self.apply(&v))
    }

    /// Visit the assigned metavariables in creation order.
    pub fn for_each(&self, mut f: impl FnMut(&Name, &Expr)) {
        for name in self.menv.names() {
            if let Some(v) = self.menv.subst_of(name) {
                let v = self.apply(&v);
                f(name, &v);
            }
        }
    }

    pub fn is_fully_assigned(&self) -> bool {
        self.menv.find_unassigned().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::justification::mk_asserted;
    use crate::name::mk_name;

    #[test]
    fn assignment_is_write_once() {
        let mut menv = MetavarEnv::new();
        let m = menv.mk_metavar(Context::new());
        let name = m.metavar_name().cloned().expect("metavar");
        let a = mk_constant(mk_name("a"));
        let b = mk_constant(mk_name("b"));
        assert!(menv.assign(&name, a.clone(), mk_asserted()));
        assert!(!menv.assign(&name, b, mk_asserted()));
        assert_eq!(menv.subst_of(&name), Some(a));
    }

    #[test]
    fn instantiation_applies_local_contexts() {
        let mut menv = MetavarEnv::new();
        let ctx = Context::new().extend(mk_name("x"), mk_constant(mk_name("T")));
        let m = menv.mk_metavar(ctx);
        let name = m.metavar_name().cloned().expect("metavar");
        let tru = mk_constant(mk_name("true"));
        let applied = instantiate(&m, 0, &tru, Some(&menv));
        // ?m := #0, so ?m[inst:0 true] must become true.
        menv.assign(&name, mk_var(0), mk_asserted());
        let (result, traces) = menv.instantiate_metavars(&applied);
        assert_eq!(result, tru);
        assert_eq!(traces.len(), 1);
    }

    #[test]
    fn snapshots_are_independent() {
        let mut menv = MetavarEnv::new();
        let m = menv.mk_metavar(Context::new());
        let name = m.metavar_name().cloned().expect("metavar");
        let saved = menv.clone();
        menv.assign(&name, mk_constant(mk_name("a")), mk_asserted());
        assert!(menv.is_assigned(&name));
        assert!(!saved.is_assigned(&name));
    }
}
