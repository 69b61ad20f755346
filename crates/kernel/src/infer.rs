
use std::sync::atomic::Ordering;

use crate::builtin;
use crate::constraint::{mk_convertible_constraint, mk_eq_constraint, mk_max_constraint, UnificationConstraint};
use crate::context::Context;
use crate::env::Environment;
use crate::error::KernelError;
use crate::expr::*;
use crate::justification::mk_asserted;
use crate::level::LevelExt;
use crate::level::{bottom, mk_max, Level};
use crate::metavar::{apply_local_context, MetavarEnv};
use crate::name::mk_anon;
use crate::name::NameExt;
use crate::normalize::{whnf, InterruptFlag, mk_interrupt_flag, Normalizer};
use crate::subst::{instantiate, lift_free_vars};

/// Synthesizes the type of an expression. Ambiguities caused by
/// metavariables become residual unification constraints instead of
/// failures.
pub struct TypeInferer {
    env: Environment,
    interrupt: InterruptFlag,
}

impl TypeInferer {
    pub fn new(env: Environment) -> TypeInferer {
        TypeInferer { env, interrupt: mk_interrupt_flag() }
    }

    pub fn share_interrupt(&mut self, flag: InterruptFlag) {
        self.interrupt = flag;
    }

    pub fn set_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), KernelError> {
        if self.interrupt.load(Ordering::SeqCst) {
            Err(KernelError::Interrupted)
        } else {
            Ok(())
        }
    }

    pub fn infer(
        &mut self,
        e: &Expr,
        ctx: &Context,
        mut menv: Option<&mut MetavarEnv>,
        constraints: &mut Vec<UnificationConstraint>,
    ) -> Result<Expr, KernelError> {
        self.check()?;
        match &e.data {
            ExprData::Var(i) => {
                match ctx.lookup_ext(*i) {
                    Some((entry, prefix)) => {
                        if let Some(domain) = &entry.domain {
                            return Ok(lift_free_vars(domain, 0, i + 1, menv.as_deref()));
                        }
                        match &entry.body {
                            Some(body) => {
                                let ty = self.infer(body, &prefix, menv.as_deref_mut(), constraints)?;
                                Ok(lift_free_vars(&ty, 0, i + 1, menv.as_deref()))
                            }
                            None => Err(KernelError::UnboundVariable { index: *i }),
                        }
                    }
                    None => Err(KernelError::UnboundVariable { index: *i }),
                }
            }
            ExprData::Constant { name, ty, .. } => match ty {
                Some(t) => Ok(t.clone()),
                None => {
                    let obj = self.env.get_object(name)?;
                    obj.ty().ok_or_else(|| KernelError::UnknownObject { name: name.clone() })
                }
            },
            ExprData::Type(l) => Ok(mk_type(l.add(1))),
            ExprData::Value(v) => Ok(v.ty()),
            ExprData::Eq { .. } => Ok(builtin::bool_type()),
            ExprData::App(args) => self.infer_app(args, ctx, menv, constraints),
            ExprData::Lambda { name, domain, body } => {
                self.check_domain(domain, ctx, menv.as_deref_mut(), constraints)?;
                let extended = ctx.extend(name.clone(), domain.clone());
                let body_ty = self.infer(body, &extended, menv, constraints)?;
                Ok(mk_pi(name.clone(), domain.clone(), body_ty))
            }
            ExprData::Pi { name, domain, body } => {
                let domain_sort = self.infer(domain, ctx, menv.as_deref_mut(), constraints)?;
                let domain_sort = whnf(&domain_sort, &self.env, ctx, menv.as_deref())?;
                let extended = ctx.extend(name.clone(), domain.clone());
                let body_sort = self.infer(body, &extended, menv.as_deref_mut(), constraints)?;
                let body_sort = whnf(&body_sort, &self.env, &extended, menv.as_deref())?;
                self.pi_sort(e, ctx, &domain_sort, &body_sort, menv, constraints)
            }
            ExprData::Let { name, ty, value, body } => {
                let value_ty = self.infer(value, ctx, menv.as_deref_mut(), constraints)?;
                let declared = match ty {
                    Some(declared) => {
                        if *declared != value_ty {
                            constraints.push(mk_convertible_constraint(
                                ctx.clone(),
                                value_ty.clone(),
                                declared.clone(),
                                mk_asserted(),
                            ));
                        }
                        Some(declared.clone())
                    }
                    None => Some(value_ty),
                };
                let entry = crate::context::ContextEntry {
                    name: name.clone(),
                    domain: declared,
                    body: Some(value.clone()),
                };
                let extended = ctx.extend_with(entry);
                let body_ty = self.infer(body, &extended, menv.as_deref_mut(), constraints)?;
                Ok(instantiate(&body_ty, 0, value, menv.as_deref()))
            }
            ExprData::MetaVar { name, lctx } => {
                match menv {
                    Some(menv) => {
                        if let Some(ty) = menv.ty_of(name) {
                            return Ok(apply_local_context(&ty, lctx, Some(menv)));
                        }
                        let creation_ctx = menv.ctx_of(name).unwrap_or_default();
                        let ty_meta = menv.mk_metavar(creation_ctx);
                        menv.set_type(name, ty_meta.clone());
                        Ok(apply_local_context(&ty_meta, lctx, Some(menv)))
                    }
                    None => Err(KernelError::TypeExpected { expr: e.clone() }),
                }
            }
        }
    }

    fn infer_app(
        &mut self,
        args: &[Expr],
        ctx: &Context,
        mut menv: Option<&mut MetavarEnv>,
        constraints: &mut Vec<UnificationConstraint>,
    ) -> Result<Expr, KernelError> {
        let mut fn_ty = self.infer(&args[0], ctx, menv.as_deref_mut(), constraints)?;
        for arg in &args[1..] {
            let fn_ty_whnf = whnf(&fn_ty, &self.env, ctx, menv.as_deref())?;
            match &fn_ty_whnf.data {
                ExprData::Pi { domain, body, .. } => {
                    let arg_ty = self.infer(arg, ctx, menv.as_deref_mut(), constraints)?;
                    if arg_ty != *domain {
                        constraints.push(mk_convertible_constraint(
                            ctx.clone(),
                            arg_ty,
                            domain.clone(),
                            mk_asserted(),
                        ));
                    }
                    fn_ty = instantiate(body, 0, arg, menv.as_deref());
                }
                _ if is_meta_headed(&fn_ty_whnf) => {
                    // Invent the Pi shape and let unification find it.
                    match menv.as_deref_mut() {
                        Some(m) => {
                            let binder = mk_anon().str("x");
                            let domain = m.mk_metavar(ctx.clone());
                            let extended = ctx.extend(binder.clone(), domain.clone());
                            let range = m.mk_metavar(extended);
                            let pi = mk_pi(binder, domain, range.clone());
                            constraints.push(mk_eq_constraint(
                                ctx.clone(),
                                fn_ty_whnf.clone(),
                                pi,
                                mk_asserted(),
                            ));
                            fn_ty = instantiate(&range, 0, arg, menv.as_deref());
                        }
                        None => {
                            return Err(KernelError::FunctionExpected { expr: args[0].clone() })
                        }
                    }
                }
                _ => return Err(KernelError::FunctionExpected { expr: args[0].clone() }),
            }
        }
        Ok(fn_ty)
    }

    fn check_domain(
        &mut self,
        domain: &Expr,
        ctx: &Context,
        mut menv: Option<&mut MetavarEnv>,
        constraints: &mut Vec<UnificationConstraint>,
    ) -> Result<(), KernelError> {
        let sort = self.infer(domain, ctx, menv.as_deref_mut(), constraints)?;
        let sort = whnf(&sort, &self.env, ctx, menv.as_deref())?;
        if sort.is_type() || builtin::is_bool_type(&sort) || is_meta_headed(&sort) {
            Ok(())
        } else {
            Err(KernelError::TypeExpected { expr: domain.clone() })
        }
    }

    fn pi_sort(
        &mut self,
        pi: &Expr,
        ctx: &Context,
        domain_sort: &Expr,
        body_sort: &Expr,
        menv: Option<&mut MetavarEnv>,
        constraints: &mut Vec<UnificationConstraint>,
    ) -> Result<Expr, KernelError> {
        if builtin::is_bool_type(body_sort) {
            return Ok(builtin::bool_type());
        }
        let domain_level = sort_level(domain_sort);
        let body_level = body_sort.ty_level();
        match (domain_level, body_level) {
            (Some(l1), Some(l2)) => match menv {
                Some(menv) => {
                    // Defer the max computation to the constraint engine.
                    let target = menv.mk_metavar(ctx.clone());
                    constraints.push(mk_max_constraint(
                        ctx.clone(),
                        target.clone(),
                        l1,
                        l2,
                        mk_asserted(),
                    ));
                    Ok(target)
                }
                None => Ok(mk_type(mk_max(l1, l2))),
            },
            _ => match menv {
                Some(menv) => {
                    let target = menv.mk_metavar(ctx.clone());
                    constraints.push(mk_convertible_constraint(
                        ctx.clone(),
                        domain_sort.clone(),
                        target.clone(),
                        mk_asserted(),
                    ));
                    constraints.push(mk_convertible_constraint(
                        ctx.clone(),
                        body_sort.clone(),
                        target.clone(),
                        mk_asserted(),
                    ));
                    Ok(target)
                }
                None => Err(KernelError::TypeExpected { expr: pi.clone() }),
            },
        }
    }

    /// Conversion test for closed, metavariable-free terms, used when
    /// checking declarations.
    pub fn is_convertible(&mut self, from: &Expr, to: &Expr, ctx: &Context) -> Result<bool, KernelError> {
        if from == to {
            return Ok(true);
        }
        let mut normalizer = Normalizer::new(self.env.clone());
        normalizer.share_interrupt(self.interrupt.clone());
        let from_nf = normalizer.normalize(from, ctx, None)?;
        let to_nf = normalizer.normalize(to, ctx, None)?;
        if from_nf == to_nf {
            return Ok(true);
        }
        if builtin::is_bool_type(&from_nf) && to_nf.is_type() {
            return Ok(true);
        }
        match (from_nf.ty_level(), to_nf.ty_level()) {
            (Some(l1), Some(l2)) => Ok(self.env.is_ge(&l2, &l1)),
            _ => Ok(false),
        }
    }
}

fn sort_level(sort: &Expr) -> Option<Level> {
    if builtin::is_bool_type(sort) {
        Some(bottom())
    } else {
        sort.ty_level()
    }
}

fn is_meta_headed(e: &Expr) -> bool {
    match &e.data {
        ExprData::MetaVar { .. } => true,
        ExprData::App(args) => args[0].is_metavar(),
        _ => false,
    }
}

/// Check that `t` is a type (its type is a sort).
pub fn check_is_type(env: &Environment, t: &Expr) -> Result<(), KernelError> {
    let mut inferer = TypeInferer::new(env.clone());
    let mut constraints = Vec::new();
    let sort = inferer.infer(t, &Context::new(), None, &mut constraints)?;
    let sort = whnf(&sort, env, &Context::new(), None)?;
    if sort.is_type() || builtin::is_bool_type(&sort) {
        Ok(())
    } else {
        Err(KernelError::TypeExpected { expr: t.clone() })
    }
}

/// Check a definition's declared type against its body.
pub fn check_definition(env: &Environment, name: &crate::name::Name, ty: &Expr, value: &Expr) -> Result<(), KernelError> {
    check_is_type(env, ty)?;
    let mut inferer = TypeInferer::new(env.clone());
    let mut constraints = Vec::new();
    let inferred = inferer.infer(value, &Context::new(), None, &mut constraints)?;
    if inferer.is_convertible(&inferred, ty, &Context::new())? {
        Ok(())
    } else {
        Err(KernelError::DefTypeMismatch {
            name: name.clone(),
            expected: ty.clone(),
            inferred,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::mk_name;

    fn env_with_t() -> Environment {
        let env = Environment::new();
        env.add_var(mk_name("T"), mk_type(bottom())).expect("T");
        env.add_var(mk_name("a"), mk_constant(mk_name("T"))).expect("a");
        env
    }

    #[test]
    fn simple_types() {
        let env = env_with_t();
        let mut inferer = TypeInferer::new(env);
        let mut cs = Vec::new();
        let t = mk_constant(mk_name("T"));
        let a = mk_constant(mk_name("a"));
        assert_eq!(
            inferer.infer(&a, &Context::new(), None, &mut cs).expect("infer"),
            t
        );
        assert_eq!(
            inferer.infer(&mk_type(bottom()), &Context::new(), None, &mut cs).expect("infer"),
            mk_type(bottom().add(1))
        );
        let id = mk_lambda(mk_name("x"), t.clone(), mk_var(0));
        assert_eq!(
            inferer.infer(&id, &Context::new(), None, &mut cs).expect("infer"),
            mk_pi(mk_name("x"), t.clone(), lift_free_vars(&t, 0, 1, None))
        );
        assert!(cs.is_empty());
    }

    #[test]
    fn application_checks_domains() {
        let env = env_with_t();
        let t = mk_constant(mk_name("T"));
        let a = mk_constant(mk_name("a"));
        let mut inferer = TypeInferer::new(env);
        let mut cs = Vec::new();
        let id = mk_lambda(mk_name("x"), t.clone(), mk_var(0));
        let ty = inferer
            .infer(&mk_app2(id, a.clone()), &Context::new(), None, &mut cs)
            .expect("infer");
        assert_eq!(ty, t);
        assert!(cs.is_empty());
    }

    #[test]
    fn metavariable_functions_produce_constraints() {
        let env = env_with_t();
        let a = mk_constant(mk_name("a"));
        let mut inferer = TypeInferer::new(env);
        let mut menv = MetavarEnv::new();
        let f = menv.mk_metavar(Context::new());
        let mut cs = Vec::new();
        let ty = inferer
            .infer(&mk_app2(f, a), &Context::new(), Some(&mut menv), &mut cs)
            .expect("infer");
        // The function type is forced into Pi shape by a residual equation.
        assert!(!cs.is_empty());
        assert!(ty.has_metavar());
    }

    #[test]
    fn eq_is_a_proposition() {
        let env = env_with_t();
        let a = mk_constant(mk_name("a"));
        let mut inferer = TypeInferer::new(env);
        let mut cs = Vec::new();
        let ty = inferer
            .infer(&mk_eq(a.clone(), a), &Context::new(), None, &mut cs)
            .expect("infer");
        assert_eq!(ty, builtin::bool_type());
    }

    #[test]
    fn definitions_type_check() {
        let env = env_with_t();
        let t = mk_constant(mk_name("T"));
        let id_ty = mk_pi(mk_name("x"), t.clone(), lift_free_vars(&t, 0, 1, None));
        let id = mk_lambda(mk_name("x"), t.clone(), mk_var(0));
        env.add_definition(mk_name("id"), id_ty, id, false).expect("id");
        let bad = mk_constant(mk_name("a"));
        assert!(matches!(
            env.add_definition(mk_name("bad"), mk_type(bottom()), bad, false),
            Err(KernelError::DefTypeMismatch { .. })
        ));
    }
}
