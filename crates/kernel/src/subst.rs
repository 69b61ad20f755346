
use crate::expr::*;
use crate::metavar::MetavarEnv;

/// Lift the free variables of `e` with index `>= s` by `n`.
pub fn lift_free_vars(e: &Expr, s: usize, n: usize, menv: Option<&MetavarEnv>) -> Expr {
    if n == 0 || e.fvar_range() <= s {
        return e.clone();
    }
    match &e.data {
        ExprData::Var(i) => {
            if *i >= s { mk_var(i + n) } else { e.clone() }
        }
        ExprData::App(args) => {
            mk_app(args.iter().map(|a| lift_free_vars(a, s, n, menv)).collect())
        }
        ExprData::Lambda { name, domain, body } => mk_lambda(
            name.clone(),
            lift_free_vars(domain, s, n, menv),
            lift_free_vars(body, s + 1, n, menv),
        ),
        ExprData::Pi { name, domain, body } => mk_pi(
            name.clone(),
            lift_free_vars(domain, s, n, menv),
            lift_free_vars(body, s + 1, n, menv),
        ),
        ExprData::Eq { lhs, rhs } => mk_eq(
            lift_free_vars(lhs, s, n, menv),
            lift_free_vars(rhs, s, n, menv),
        ),
        ExprData::Let { name, ty, value, body } => mk_let(
            name.clone(),
            ty.as_ref().map(|t| lift_free_vars(t, s, n, menv)),
            lift_free_vars(value, s, n, menv),
            lift_free_vars(body, s + 1, n, menv),
        ),
        ExprData::MetaVar { .. } => add_lift(e, s, n, menv),
        ExprData::Constant { .. } | ExprData::Type(_) | ExprData::Value(_) => e.clone(),
    }
}

/// Lower the free variables of `e` with index `>= s` by `n`. The caller must
/// ensure `e` has no free variable in `[s - n, s)`.
pub fn lower_free_vars(e: &Expr, s: usize, n: usize, menv: Option<&MetavarEnv>) -> Expr {
    if n == 0 || e.fvar_range() <= s.saturating_sub(n) {
        return e.clone();
    }
    match &e.data {
        ExprData::Var(i) => {
            if *i >= s { mk_var(i - n) } else { e.clone() }
        }
        ExprData::App(args) => {
            mk_app(args.iter().map(|a| lower_free_vars(a, s, n, menv)).collect())
        }
        ExprData::Lambda { name, domain, body } => mk_lambda(
            name.clone(),
            lower_free_vars(domain, s, n, menv),
            lower_free_vars(body, s + 1, n, menv),
        ),
        ExprData::Pi { name, domain, body } => mk_pi(
            name.clone(),
            lower_free_vars(domain, s, n, menv),
            lower_free_vars(body, s + 1, n, menv),
        ),
        ExprData::Eq { lhs, rhs } => mk_eq(
            lower_free_vars(lhs, s, n, menv),
            lower_free_vars(rhs, s, n, menv),
        ),
        ExprData::Let { name, ty, value, body } => mk_let(
            name.clone(),
            ty.as_ref().map(|t| lower_free_vars(t, s, n, menv)),
            lower_free_vars(value, s, n, menv),
            lower_free_vars(body, s + 1, n, menv),
        ),
        ExprData::MetaVar { name, lctx } => {
            // The precondition can only have been established through a head
            // lift covering the removed range; shrink it.
            match lctx.front() {
                Some(LocalEntry::Lift { s: ls, n: ln })
                    if s >= n && *ls <= s - n && s <= ls + ln =>
                {
                    let mut rest = lctx.clone();
                    rest.pop_front();
                    if ln - n > 0 {
                        rest.push_front(LocalEntry::Lift { s: *ls, n: ln - n });
                    }
                    mk_metavar(name.clone(), rest)
                }
                _ => {
                    debug_assert!(false, "lowering a metavariable without a covering lift");
                    e.clone()
                }
            }
        }
        ExprData::Constant { .. } | ExprData::Type(_) | ExprData::Value(_) => e.clone(),
    }
}

/// Record a pending lift on a metavariable instead of descending into it.
/// With a metavariable environment at hand the entry is dropped entirely when
/// the metavariable's scope cannot reach the lifted range.
pub fn add_lift(m: &Expr, s: usize, n: usize, menv: Option<&MetavarEnv>) -> Expr {
    if n == 0 {
        return m.clone();
    }
    match &m.data {
        ExprData::MetaVar { name, lctx } => {
            if let Some(menv) = menv {
                if let Some(bound) = menv.scope_bound(name, lctx) {
                    if bound <= s {
                        return m.clone();
                    }
                }
            }
            mk_metavar(name.clone(), lctx_push(lctx, LocalEntry::Lift { s, n }))
        }
        _ => m.clone(),
    }
}

/// Record a pending instantiation on a metavariable.
pub fn add_inst(m: &Expr, i: usize, value: Expr, menv: Option<&MetavarEnv>) -> Expr {
    match &m.data {
        ExprData::MetaVar { name, lctx } => {
            if let Some(menv) = menv {
                if let Some(bound) = menv.scope_bound(name, lctx) {
                    if bound <= i {
                        return m.clone();
                    }
                }
            }
            mk_metavar(name.clone(), lctx_push(lctx, LocalEntry::Inst { s: i, value }))
        }
        _ => m.clone(),
    }
}

/// Replace free variable `i` with `v` in `e`, lowering the variables above
/// `i`. `v` need not be closed; its free variables are lifted on the way
/// down.
pub fn instantiate(e: &Expr, i: usize, v: &Expr, menv: Option<&MetavarEnv>) -> Expr {
    instantiate_core(e, i, i, v, menv)
}

fn instantiate_core(e: &Expr, i: usize, base: usize, v: &Expr, menv: Option<&MetavarEnv>) -> Expr {
    if e.fvar_range() <= i {
        return e.clone();
    }
    match &e.data {
        ExprData::Var(j) => {
            if *j == i {
                lift_free_vars(v, 0, i - base, menv)
            } else if *j > i {
                mk_var(j - 1)
            } else {
                e.clone()
            }
        }
        ExprData::App(args) => mk_app(
            args.iter().map(|a| instantiate_core(a, i, base, v, menv)).collect(),
        ),
        ExprData::Lambda { name, domain, body } => mk_lambda(
            name.clone(),
            instantiate_core(domain, i, base, v, menv),
            instantiate_core(body, i + 1, base, v, menv),
        ),
        ExprData::Pi { name, domain, body } => mk_pi(
            name.clone(),
            instantiate_core(domain, i, base, v, menv),
            instantiate_core(body, i + 1, base, v, menv),
        ),
        ExprData::Eq { lhs, rhs } => mk_eq(
            instantiate_core(lhs, i, base, v, menv),
            instantiate_core(rhs, i, base, v, menv),
        ),
        ExprData::Let { name, ty, value, body } => mk_let(
            name.clone(),
            ty.as_ref().map(|t| instantiate_core(t, i, base, v, menv)),
            instantiate_core(value, i, base, v, menv),
            instantiate_core(body, i + 1, base, v, menv),
        ),
        ExprData::MetaVar { .. } => {
            let lifted = lift_free_vars(v, 0, i - base, menv);
            add_inst(e, i, lifted, menv)
        }
        ExprData::Constant { .. } | ExprData::Type(_) | ExprData::Value(_) => e.clone(),
    }
}

/// Replace free variables `0 .. n-1` with `subst[n-1] .. subst[0]`
/// simultaneously, lowering the variables above. This is the hot path: it
/// short-circuits on closed subterms and skips relifting closed substitutes.
pub fn instantiate_multi(e: &Expr, subst: &[Expr], menv: Option<&MetavarEnv>) -> Expr {
    if subst.is_empty() {
        return e.clone();
    }
    instantiate_multi_core(e, subst, 0, menv)
}

fn instantiate_multi_core(e: &Expr, subst: &[Expr], depth: usize, menv: Option<&MetavarEnv>) -> Expr {
    if e.fvar_range() <= depth {
        return e.clone();
    }
    let n = subst.len();
    match &e.data {
        ExprData::Var(j) => {
            if *j < depth {
                e.clone()
            } else if j - depth < n {
                let chosen = &subst[n - 1 - (j - depth)];
                if chosen.closed() {
                    chosen.clone()
                } else {
                    lift_free_vars(chosen, 0, depth, menv)
                }
            } else {
                mk_var(j - n)
            }
        }
        ExprData::App(args) => mk_app(
            args.iter().map(|a| instantiate_multi_core(a, subst, depth, menv)).collect(),
        ),
        ExprData::Lambda { name, domain, body } => mk_lambda(
            name.clone(),
            instantiate_multi_core(domain, subst, depth, menv),
            instantiate_multi_core(body, subst, depth + 1, menv),
        ),
        ExprData::Pi { name, domain, body } => mk_pi(
            name.clone(),
            instantiate_multi_core(domain, subst, depth, menv),
            instantiate_multi_core(body, subst, depth + 1, menv),
        ),
        ExprData::Eq { lhs, rhs } => mk_eq(
            instantiate_multi_core(lhs, subst, depth, menv),
            instantiate_multi_core(rhs, subst, depth, menv),
        ),
        ExprData::Let { name, ty, value, body } => mk_let(
            name.clone(),
            ty.as_ref().map(|t| instantiate_multi_core(t, subst, depth, menv)),
            instantiate_multi_core(value, subst, depth, menv),
            instantiate_multi_core(body, subst, depth + 1, menv),
        ),
        ExprData::MetaVar { .. } => {
            // Simultaneous substitution is the composition of the single
            // substitutions at this depth, innermost entry first.
            let mut result = e.clone();
            for chosen in subst.iter().rev() {
                let lifted = if chosen.closed() {
                    chosen.clone()
                } else {
                    lift_free_vars(chosen, 0, depth, menv)
                };
                result = add_inst(&result, depth, lifted, menv);
            }
            result
        }
        ExprData::Constant { .. } | ExprData::Type(_) | ExprData::Value(_) => e.clone(),
    }
}

/// Replace free variables `0 .. n-1` with closed terms simultaneously.
pub fn instantiate_with_closed(e: &Expr, subst: &[Expr], menv: Option<&MetavarEnv>) -> Expr {
    instantiate_multi(e, subst, menv)
}

/// Strip as many outer lambdas from `f` as there are arguments and
/// substitute; surplus arguments stay applied to the result.
pub fn apply_beta(f: &Expr, args: &[Expr], menv: Option<&MetavarEnv>) -> Expr {
    let mut code = f;
    let mut consumed = 0;
    while consumed < args.len() {
        match &code.data {
            ExprData::Lambda { body, .. } => {
                code = body;
                consumed += 1;
            }
            _ => break,
        }
    }
    let reduced = instantiate_multi(code, &args[..consumed], menv);
    if consumed == args.len() {
        reduced
    } else {
        let mut rest = vec![reduced];
        rest.extend(args[consumed..].iter().cloned());
        mk_app(rest)
    }
}

pub fn is_head_beta(e: &Expr) -> bool {
    match &e.data {
        ExprData::App(args) => args[0].is_lambda(),
        _ => false,
    }
}

/// One beta step at the head, when the head is a lambda.
pub fn head_beta_reduce(e: &Expr, menv: Option<&MetavarEnv>) -> Expr {
    match &e.data {
        ExprData::App(args) if args[0].is_lambda() => {
            apply_beta(&args[0], &args[1..], menv)
        }
        _ => e.clone(),
    }
}

/// Reduce every beta redex, bottom-up, until none remain.
pub fn beta_reduce(e: &Expr, menv: Option<&MetavarEnv>) -> Expr {
    let reduced = match &e.data {
        ExprData::App(args) => {
            let new_args: Vec<Expr> = args.iter().map(|a| beta_reduce(a, menv)).collect();
            mk_app(new_args)
        }
        ExprData::Lambda { name, domain, body } => mk_lambda(
            name.clone(),
            beta_reduce(domain, menv),
            beta_reduce(body, menv),
        ),
        ExprData::Pi { name, domain, body } => mk_pi(
            name.clone(),
            beta_reduce(domain, menv),
            beta_reduce(body, menv),
        ),
        ExprData::Eq { lhs, rhs } => mk_eq(beta_reduce(lhs, menv), beta_reduce(rhs, menv)),
        ExprData::Let { name, ty, value, body } => mk_let(
            name.clone(),
            ty.as_ref().map(|t| beta_reduce(t, menv)),
            beta_reduce(value, menv),
            beta_reduce(body, menv),
        ),
        _ => e.clone(),
    };
    if is_head_beta(&reduced) {
        beta_reduce(&head_beta_reduce(&reduced, menv), menv)
    } else {
        reduced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::metavar::MetavarEnv;
    use crate::name::mk_name;

    fn t() -> Expr { mk_constant(mk_name("T")) }

    #[test]
    fn lift_then_instantiate_cancels() {
        let e = mk_lambda(mk_name("x"), t(), mk_app2(mk_var(0), mk_var(1)));
        let lifted = lift_free_vars(&e, 0, 1, None);
        let back = instantiate(&lifted, 0, &mk_constant(mk_name("a")), None);
        assert_eq!(back, e);

        let closed = mk_lambda(mk_name("x"), t(), mk_var(0));
        let lifted = lift_free_vars(&closed, 0, 1, None);
        assert_eq!(lifted, closed);
        assert_eq!(instantiate(&lifted, 0, &mk_constant(mk_name("a")), None), closed);
    }

    #[test]
    fn beta_on_identity_and_constant_functions() {
        let a = mk_constant(mk_name("a"));
        let e = mk_constant(mk_name("e"));
        let id = mk_lambda(mk_name("x"), t(), mk_var(0));
        let konst = mk_lambda(mk_name("_"), t(), e.clone());
        assert_eq!(apply_beta(&id, &[a.clone()], None), a);
        assert_eq!(apply_beta(&konst, &[a.clone()], None), e);
    }

    #[test]
    fn beta_with_surplus_arguments() {
        let a = mk_constant(mk_name("a"));
        let b = mk_constant(mk_name("b"));
        let id = mk_lambda(mk_name("x"), t(), mk_var(0));
        assert_eq!(apply_beta(&id, &[a.clone(), b.clone()], None), mk_app2(a, b));
    }

    #[test]
    fn substitution_extends_metavar_contexts() {
        let m = mk_metavar(mk_name("m"), LocalContext::new());
        let lifted = lift_free_vars(&m, 0, 2, None);
        assert_eq!(
            lifted.metavar_lctx().and_then(|l| l.front().cloned()),
            Some(LocalEntry::Lift { s: 0, n: 2 })
        );
        let a = mk_constant(mk_name("a"));
        let inst = instantiate(&m, 0, &a, None);
        assert_eq!(
            inst.metavar_lctx().and_then(|l| l.front().cloned()),
            Some(LocalEntry::Inst { s: 0, value: a })
        );
    }

    #[test]
    fn menv_minimizes_metavar_entries() {
        let mut menv = MetavarEnv::new();
        let m = menv.mk_metavar(Context::new());
        let a = mk_constant(mk_name("a"));
        // Created in an empty context: cannot mention any free variable.
        assert_eq!(instantiate(&m, 0, &a, Some(&menv)), m);
        assert_eq!(lift_free_vars(&m, 0, 3, Some(&menv)), m);

        let ctx = Context::new().extend(mk_name("x"), t());
        let m2 = menv.mk_metavar(ctx);
        assert_ne!(instantiate(&m2, 0, &a, Some(&menv)), m2);
        assert_eq!(instantiate(&m2, 1, &a, Some(&menv)), m2);
    }

    #[test]
    fn beta_reduces_under_binders() {
        let id = mk_lambda(mk_name("x"), t(), mk_var(0));
        let e = mk_lambda(mk_name("y"), t(), mk_app2(id, mk_var(0)));
        let expected = mk_lambda(mk_name("y"), t(), mk_var(0));
        assert_eq!(beta_reduce(&e, None), expected);
    }
}
