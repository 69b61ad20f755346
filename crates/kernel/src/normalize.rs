
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use colored::Colorize;
use if_chain::if_chain;
use imbl::Vector;

use crate::context::Context;
use crate::env::Environment;
use crate::error::KernelError;
use crate::expr::*;
use crate::metavar::MetavarEnv;
use crate::subst::{add_lift, head_beta_reduce, instantiate, instantiate_multi, is_head_beta, lift_free_vars};

pub type InterruptFlag = Arc<AtomicBool>;

pub fn mk_interrupt_flag() -> InterruptFlag {
    Arc::new(AtomicBool::new(false))
}

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub unfold_opaque: bool,
    pub max_depth: usize,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        NormalizeOptions { unfold_opaque: false, max_depth: usize::MAX }
    }
}

/// Normalization-time value. Variables are de Bruijn levels; lambdas, Pis
/// and metavariables are suspended as closures until reification.
#[derive(Debug, Clone)]
enum Nval {
    Var(usize),
    Closure { code: Expr, ctx: Context, stack: Stack },
    App(Vec<Nval>),
    Eq(Box<Nval>, Box<Nval>),
    Atom(Expr),
}

type Stack = Vector<Nval>;

pub struct Normalizer {
    env: Environment,
    interrupt: InterruptFlag,
    options: NormalizeOptions,
    ctx: Context,
    menv: Option<MetavarEnv>,
    depth: usize,
}

impl Normalizer {
    pub fn new(env: Environment) -> Normalizer {
        Normalizer::with_options(env, NormalizeOptions::default())
    }

    pub fn with_options(env: Environment, options: NormalizeOptions) -> Normalizer {
        Normalizer {
            env,
            interrupt: mk_interrupt_flag(),
            options,
            ctx: Context::new(),
            menv: None,
            depth: 0,
        }
    }

    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    pub fn share_interrupt(&mut self, flag: InterruptFlag) {
        self.interrupt = flag;
    }

    pub fn set_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), KernelError> {
        if self.interrupt.load(Ordering::SeqCst) {
            return Err(KernelError::Interrupted);
        }
        if self.depth > self.options.max_depth {
            return Err(KernelError::DeepRecursion);
        }
        Ok(())
    }

    /// Normalize `e` in `ctx`. With a metavariable environment assigned
    /// metavariables are substituted during reduction; without one the
    /// normalizer conservatively records pending instantiations in the
    /// metavariables' local contexts.
    pub fn normalize(&mut self, e: &Expr, ctx: &Context, menv: Option<&MetavarEnv>) -> Result<Expr, KernelError> {
        self.ctx = ctx.clone();
        self.menv = menv.cloned();
        self.depth = 0;
        let k = ctx.len();
        let value = self.eval(e, &Stack::new(), k)?;
        let result = self.reify(&value, k)?;
        log::trace!("{} {} {} {}", e, "-->".bright_blue(), result, ctx);
        Ok(result)
    }

    fn eval(&mut self, a: &Expr, s: &Stack, k: usize) -> Result<Nval, KernelError> {
        self.depth += 1;
        let result = self.eval_core(a, s, k);
        self.depth -= 1;
        result
    }

    fn eval_core(&mut self, a: &Expr, s: &Stack, k: usize) -> Result<Nval, KernelError> {
        self.check()?;
        match &a.data {
            ExprData::MetaVar { name, .. } => {
                if let Some(menv) = &self.menv {
                    if menv.is_assigned(name) {
                        let (inst, _) = menv.instantiate_metavars(a);
                        if inst != *a {
                            return self.eval(&inst, s, k);
                        }
                    }
                }
                Ok(Nval::Closure { code: a.clone(), ctx: self.ctx.clone(), stack: s.clone() })
            }
            ExprData::Lambda { .. } | ExprData::Pi { .. } => {
                Ok(Nval::Closure { code: a.clone(), ctx: self.ctx.clone(), stack: s.clone() })
            }
            ExprData::Var(i) => self.eval_var(s, *i),
            ExprData::Constant { name, .. } => {
                let object = self.env.find_object(name);
                match object {
                    Some(obj) if obj.is_definition()
                        && (!obj.is_opaque() || self.options.unfold_opaque) =>
                    {
                        match obj.value() {
                            Some(value) => {
                                let saved = std::mem::replace(&mut self.ctx, Context::new());
                                let result = self.eval(&value, &Stack::new(), 0);
                                self.ctx = saved;
                                result
                            }
                            None => Ok(Nval::Atom(a.clone())),
                        }
                    }
                    _ => Ok(Nval::Atom(a.clone())),
                }
            }
            ExprData::Type(_) | ExprData::Value(_) => Ok(Nval::Atom(a.clone())),
            ExprData::App(args) => self.eval_app(args, s, k),
            ExprData::Eq { lhs, rhs } => {
                let lhs = self.eval(lhs, s, k)?;
                let rhs = self.eval(rhs, s, k)?;
                match (&lhs, &rhs) {
                    (Nval::Atom(l), Nval::Atom(r)) if l.is_value() && r.is_value() => {
                        Ok(Nval::Atom(crate::builtin::mk_bool(l == r)))
                    }
                    _ => Ok(Nval::Eq(Box::new(lhs), Box::new(rhs))),
                }
            }
            ExprData::Let { value, body, .. } => {
                let value = self.eval(value, s, k)?;
                let mut extended = s.clone();
                extended.push_front(value);
                self.eval(body, &extended, k)
            }
        }
    }

    fn eval_var(&mut self, s: &Stack, i: usize) -> Result<Nval, KernelError> {
        if let Some(v) = s.get(i) {
            return Ok(v.clone());
        }
        let j = i - s.len();
        match self.ctx.lookup_ext(j) {
            Some((entry, prefix)) => match entry.body {
                Some(body) => {
                    let saved = std::mem::replace(&mut self.ctx, prefix);
                    let k = self.ctx.len();
                    let result = self.eval(&body, &Stack::new(), k);
                    self.ctx = saved;
                    result
                }
                None => Ok(Nval::Var(prefix.len())),
            },
            None => {
                debug_assert!(false, "variable escapes the context");
                Ok(Nval::Var(0))
            }
        }
    }

    fn eval_app(&mut self, args: &[Expr], s: &Stack, k: usize) -> Result<Nval, KernelError> {
        let mut f = self.eval(&args[0], s, k)?;
        let n = args.len();
        let mut i = 1;
        loop {
            match f {
                // Beta: feed arguments while the suspended code is a lambda.
                Nval::Closure { code, ctx: closure_ctx, stack } if code.is_lambda() => {
                    let mut code = code;
                    let mut stack = stack;
                    while code.is_lambda() && i < n {
                        let arg = self.eval(&args[i], s, k)?;
                        stack.push_front(arg);
                        i += 1;
                        if let ExprData::Lambda { body, .. } = &code.data {
                            let body = body.clone();
                            code = body;
                        }
                    }
                    let saved = std::mem::replace(&mut self.ctx, closure_ctx);
                    let result = self.eval(&code, &stack, k);
                    self.ctx = saved;
                    f = result?;
                    if i == n {
                        return Ok(f);
                    }
                }
                head => {
                    let mut new_args = vec![head];
                    for arg in &args[i..] {
                        new_args.push(self.eval(arg, s, k)?);
                    }
                    if let Nval::Atom(first) = &new_args[0] {
                        if let ExprData::Value(v) = &first.data {
                            let mut reified = Vec::with_capacity(new_args.len());
                            for val in &new_args {
                                reified.push(self.reify(val, k)?);
                            }
                            if let Some(m) = v.normalize(&reified) {
                                return self.eval(&m, s, k);
                            }
                        }
                    }
                    return Ok(Nval::App(new_args));
                }
            }
        }
    }

    fn is_identity_stack(s: &Stack, k: usize) -> bool {
        s.iter().enumerate().all(|(i, v)| match v {
            Nval::Var(level) => k == level + i + 1,
            _ => false,
        })
    }

    fn reify(&mut self, v: &Nval, k: usize) -> Result<Expr, KernelError> {
        self.check()?;
        match v {
            Nval::Var(level) => {
                debug_assert!(*level < k, "level escapes the binder depth");
                Ok(mk_var(k - level - 1))
            }
            Nval::Atom(e) => Ok(e.clone()),
            Nval::App(vals) => {
                let mut args = Vec::with_capacity(vals.len());
                for val in vals {
                    args.push(self.reify(val, k)?);
                }
                Ok(mk_app(args))
            }
            Nval::Eq(lhs, rhs) => {
                let lhs = self.reify(lhs, k)?;
                let rhs = self.reify(rhs, k)?;
                Ok(mk_eq(lhs, rhs))
            }
            Nval::Closure { code, ctx, stack } => {
                let saved = std::mem::replace(&mut self.ctx, ctx.clone());
                let result = self.reify_closure(code, stack, k);
                self.ctx = saved;
                result
            }
        }
    }

    fn reify_closure(&mut self, code: &Expr, stack: &Stack, k: usize) -> Result<Expr, KernelError> {
        if code.is_abstraction() {
            let domain = match abst_domain(code) {
                Some(d) => d.clone(),
                None => return Ok(code.clone()),
            };
            let body = match abst_body(code) {
                Some(b) => b.clone(),
                None => return Ok(code.clone()),
            };
            let domain_val = self.eval(&domain, stack, k)?;
            let new_domain = self.reify(&domain_val, k)?;
            let mut extended = stack.clone();
            extended.push_front(Nval::Var(k));
            let body_val = self.eval(&body, &extended, k + 1)?;
            let new_body = self.reify(&body_val, k + 1)?;
            Ok(update_abstraction(code, new_domain, new_body))
        } else {
            // Metavariable: express the pending stack through the local
            // context instead of descending.
            let len_s = stack.len();
            let len_ctx = self.ctx.len();
            if k == len_ctx && Normalizer::is_identity_stack(stack, k) {
                return Ok(code.clone());
            }
            let lifted = if k > len_ctx {
                add_lift(code, len_s, k - len_ctx, self.menv.as_ref())
            } else {
                code.clone()
            };
            let mut subst = Vec::with_capacity(len_s);
            for val in stack.iter() {
                subst.push(self.reify(val, k)?);
            }
            subst.reverse();
            Ok(instantiate_multi(&lifted, &subst, self.menv.as_ref()))
        }
    }
}

/// Normalize without constructing an explicit [`Normalizer`].
pub fn normalize(e: &Expr, env: &Environment, ctx: &Context) -> Result<Expr, KernelError> {
    Normalizer::new(env.clone()).normalize(e, ctx, None)
}

/// Weak-head normal form: beta, let, definition unfolding and assigned
/// metavariable substitution at the head only.
pub fn whnf(e: &Expr, env: &Environment, ctx: &Context, menv: Option<&MetavarEnv>) -> Result<Expr, KernelError> {
    let mut current = e.clone();
    let mut steps: usize = 0;
    loop {
        steps += 1;
        if steps > 100_000 {
            return Err(KernelError::DeepRecursion);
        }
        if let Some(menv) = menv {
            if menv.has_assigned_metavar(&current) {
                if let ExprData::MetaVar { .. } = &current.data {
                    let (inst, _) = menv.instantiate_metavars(&current);
                    if inst != current {
                        current = inst;
                        continue;
                    }
                }
            }
        }
        match &current.data {
            ExprData::Let { value, body, .. } => {
                current = instantiate(body, 0, value, menv);
            }
            ExprData::Var(i) => {
                if_chain! {
                    if let Some(entry) = ctx.lookup(*i);
                    if let Some(body) = &entry.body;
                    then { current = lift_free_vars(body, 0, i + 1, menv); }
                    else { return Ok(current); }
                }
            }
            ExprData::Constant { name, .. } => {
                match env.find_object(name) {
                    Some(obj) if obj.is_definition() && !obj.is_opaque() => {
                        match obj.value() {
                            Some(value) => current = value,
                            None => return Ok(current),
                        }
                    }
                    _ => return Ok(current),
                }
            }
            ExprData::App(args) => {
                if is_head_beta(&current) {
                    current = head_beta_reduce(&current, menv);
                    continue;
                }
                let head = args[0].clone();
                let new_head = whnf(&head, env, ctx, menv)?;
                if new_head == head {
                    return Ok(current);
                }
                current = update_app_head(&current, new_head);
            }
            _ => return Ok(current),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::level::bottom;
    use crate::name::mk_name;
    use std::collections::HashSet;

    fn t() -> Expr { mk_constant(mk_name("t")) }
    fn lam(domain: Expr, body: Expr) -> Expr {
        mk_lambda(mk_name("_"), domain, body)
    }
    fn arrow(a: Expr, b: Expr) -> Expr {
        mk_pi(mk_name("_"), a, lift_free_vars(&b, 0, 1, None))
    }
    fn v(i: usize) -> Expr { mk_var(i) }

    // fun (t : T) (s : t -> t) (z : t), z
    fn zero() -> Expr {
        lam(t(), lam(arrow(v(0), v(0)), lam(v(1), v(0))))
    }

    // fun (t : T) (s : t -> t), s
    fn one() -> Expr {
        lam(t(), lam(arrow(v(0), v(0)), v(0)))
    }

    fn num() -> Expr { mk_constant(mk_name("num")) }

    // fun (m n : num) (A : T) (f : A -> A) (x : A), m A f (n A f x)
    fn plus() -> Expr {
        let (x, f, a, n, m) = (v(0), v(1), v(2), v(3), v(4));
        let body = mk_app(vec![m, a.clone(), f.clone(), mk_app(vec![n, a.clone(), f, x])]);
        lam(num(), lam(num(), lam(t(), lam(arrow(v(0), v(0)), lam(v(1), body)))))
    }

    fn two() -> Expr { mk_app(vec![plus(), one(), one()]) }
    fn four() -> Expr { mk_app(vec![plus(), two(), two()]) }

    // fun (m n : num) (A : T), n (A -> A) (m A)
    fn power() -> Expr {
        let (a, n, m) = (v(0), v(1), v(2));
        let body = mk_app(vec![n, arrow(a.clone(), a.clone()), mk_app(vec![m, a])]);
        lam(num(), lam(num(), lam(arrow(v(0), v(0)), body)))
    }

    fn count_subterms(e: &Expr, seen: &mut HashSet<Expr>) -> usize {
        if !seen.insert(e.clone()) {
            return 0;
        }
        match &e.data {
            ExprData::App(args) => {
                1 + args.iter().map(|a| count_subterms(a, seen)).sum::<usize>()
            }
            ExprData::Lambda { domain, body, .. } | ExprData::Pi { domain, body, .. } => {
                1 + count_subterms(domain, seen) + count_subterms(body, seen)
            }
            ExprData::Eq { lhs, rhs } => {
                1 + count_subterms(lhs, seen) + count_subterms(rhs, seen)
            }
            ExprData::Let { value, body, .. } => {
                1 + count_subterms(value, seen) + count_subterms(body, seen)
            }
            _ => 1,
        }
    }

    fn count(e: &Expr) -> usize {
        count_subterms(e, &mut HashSet::new())
    }

    fn church_env() -> Environment {
        let env = Environment::new();
        env.add_var(mk_name("t"), mk_type(bottom())).expect("t");
        env.add_var(mk_name("num"), mk_type(bottom())).expect("num");
        env.add_var(mk_name("N"), mk_type(bottom())).expect("N");
        env.add_var(mk_name("z"), mk_constant(mk_name("N"))).expect("z");
        env.add_var(mk_name("s"), arrow(mk_constant(mk_name("N")), mk_constant(mk_name("N")))).expect("s");
        env
    }

    #[test]
    fn church_numerals_evaluate() {
        let _ = env_logger::builder().is_test(true).try_init();
        let env = church_env();
        let n = mk_constant(mk_name("N"));
        let s = mk_constant(mk_name("s"));
        let z = mk_constant(mk_name("z"));
        let mut norm = Normalizer::new(env);

        let four_n = mk_app(vec![four(), n.clone(), s.clone(), z.clone()]);
        let four_nf = norm.normalize(&four_n, &Context::new(), None).expect("normalize");
        assert_eq!(count(&four_nf), 4 + 2);

        // power 2 4 applied to N, s, z: sixteen applications of s to z.
        let sixteen = mk_app(vec![
            mk_app(vec![power(), two(), four()]),
            n, s.clone(), z.clone(),
        ]);
        let sixteen_nf = norm.normalize(&sixteen, &Context::new(), None).expect("normalize");
        let mut expected = z;
        for _ in 0..16 {
            expected = mk_app2(s.clone(), expected);
        }
        assert_eq!(sixteen_nf, expected);
        assert_eq!(count(&sixteen_nf), 16 + 2);
    }

    #[test]
    fn normalization_is_idempotent() {
        let env = church_env();
        let n = mk_constant(mk_name("N"));
        let s = mk_constant(mk_name("s"));
        let z = mk_constant(mk_name("z"));
        let mut norm = Normalizer::new(env);
        let e = mk_app(vec![four(), n, s, z]);
        let nf = norm.normalize(&e, &Context::new(), None).expect("normalize");
        let nf2 = norm.normalize(&nf, &Context::new(), None).expect("normalize");
        assert_eq!(nf, nf2);
    }

    #[test]
    fn let_and_context_bodies_unfold() {
        let env = Environment::new();
        env.add_var(mk_name("b"), mk_type(bottom())).expect("b");
        let b = mk_constant(mk_name("b"));
        let e = mk_let(
            mk_name("a"), None, b.clone(),
            mk_lambda(mk_name("c"), mk_type(bottom()), mk_app2(v(1), v(0))),
        );
        let mut norm = Normalizer::new(env);
        let nf = norm.normalize(&e, &Context::new(), None).expect("normalize");
        let expected = mk_lambda(mk_name("c"), mk_type(bottom()), mk_app2(b, v(0)));
        assert_eq!(nf, expected);
    }

    #[test]
    fn depth_budget_is_enforced() {
        let env = Environment::new();
        let x = mk_name("x");
        // (fun x : T, x x) (fun x : T, x x) loops forever.
        let dup = mk_lambda(x.clone(), mk_type(bottom()), mk_app2(v(0), v(0)));
        let omega = mk_app2(dup.clone(), dup);
        let mut norm = Normalizer::with_options(env, NormalizeOptions {
            unfold_opaque: false,
            max_depth: 512,
        });
        let result = norm.normalize(&omega, &Context::new(), None);
        assert!(matches!(result, Err(KernelError::DeepRecursion)));
    }

    #[test]
    fn metavar_stacks_become_local_contexts() {
        let env = Environment::new();
        let mut menv = MetavarEnv::new();
        let m1 = menv.mk_metavar(Context::new());
        let tru = builtin::mk_true();
        // (fun x : Bool, ?m1 x) true
        let f = mk_app2(
            mk_lambda(mk_name("x"), builtin::bool_type(), mk_app2(m1.clone(), v(0))),
            tru.clone(),
        );
        let mut norm = Normalizer::new(env);

        // With the metavariable environment: ?m1 cannot mention x.
        let with_menv = norm.normalize(&f, &Context::new(), Some(&menv)).expect("normalize");
        assert_eq!(with_menv, mk_app2(m1.clone(), tru.clone()));

        // Without it: the instantiation is recorded in the local context.
        let without = norm.normalize(&f, &Context::new(), None).expect("normalize");
        let m1_inst = crate::subst::add_inst(&m1, 0, tru.clone(), None);
        assert_eq!(without, mk_app2(m1_inst, tru.clone()));

        // A metavariable created under one binder keeps the entry even with
        // the environment at hand.
        let ctx1 = Context::new().extend(mk_name("x"), builtin::bool_type());
        let m2 = menv.mk_metavar(ctx1);
        let f2 = mk_app2(
            mk_lambda(mk_name("x"), builtin::bool_type(), mk_app2(m2.clone(), v(0))),
            tru.clone(),
        );
        let with_menv2 = norm.normalize(&f2, &Context::new(), Some(&menv)).expect("normalize");
        let m2_inst = crate::subst::add_inst(&m2, 0, tru.clone(), None);
        assert_eq!(with_menv2, mk_app2(m2_inst, tru));
    }

    #[test]
    fn assigned_metavars_reduce_through() {
        let env = Environment::new();
        let mut menv = MetavarEnv::new();
        let ctx1 = Context::new().extend(mk_name("x"), builtin::bool_type());
        let m = menv.mk_metavar(ctx1);
        let name = m.metavar_name().cloned().expect("metavar");
        let tru = builtin::mk_true();
        let f = mk_app2(
            mk_lambda(mk_name("x"), builtin::bool_type(), mk_app2(m.clone(), v(0))),
            tru.clone(),
        );
        let mut norm = Normalizer::new(env);
        // Normal form before the assignment keeps the pending instantiation.
        let pending = norm.normalize(&f, &Context::new(), None).expect("normalize");
        let m_inst = crate::subst::add_inst(&m, 0, tru.clone(), None);
        assert_eq!(pending, mk_app2(m_inst, tru.clone()));

        // ?m := (fun x : Bool, x): both the redex and its pending normal
        // form now reduce all the way to true.
        let id = mk_lambda(mk_name("x"), builtin::bool_type(), v(0));
        menv.assign(&name, id, crate::justification::mk_asserted());
        let nf = norm.normalize(&f, &Context::new(), Some(&menv)).expect("normalize");
        assert_eq!(nf, tru);
        let nf2 = norm.normalize(&pending, &Context::new(), Some(&menv)).expect("normalize");
        assert_eq!(nf2, tru);
    }

    #[test]
    fn equality_of_values_decides() {
        let env = Environment::new();
        let mut norm = Normalizer::new(env);
        let e = mk_eq(builtin::mk_true(), builtin::mk_true());
        assert_eq!(norm.normalize(&e, &Context::new(), None).expect("normalize"), builtin::mk_true());
        let e = mk_eq(builtin::mk_true(), builtin::mk_false());
        assert_eq!(norm.normalize(&e, &Context::new(), None).expect("normalize"), builtin::mk_false());
        // Equality over non-values stays put.
        let env2 = Environment::new();
        env2.add_var(mk_name("a"), builtin::bool_type()).expect("a");
        let a = mk_constant(mk_name("a"));
        let e = mk_eq(a.clone(), a.clone());
        let mut norm2 = Normalizer::new(env2);
        assert_eq!(norm2.normalize(&e, &Context::new(), None).expect("normalize"), e);
    }
}
