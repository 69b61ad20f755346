//! The elaborator search core: drains a constraint queue through a
//! deterministic simplification pipeline, escalating to case splits
//! (projection, imitation, choice, plugin) when no cheap rule applies, and
//! backtracks non-chronologically through the justification DAG on failure.

use std::sync::atomic::Ordering;

use colored::Colorize;

use sigil_kernel::builtin;
use sigil_kernel::constraint::*;
use sigil_kernel::context::Context;
use sigil_kernel::env::Environment;
use sigil_kernel::expr::*;
use sigil_kernel::infer::TypeInferer;
use sigil_kernel::justification::*;
use sigil_kernel::level::{bottom, mk_max, Level, LevelExt};
use sigil_kernel::metavar::{MetavarEnv, Substitution};
use sigil_kernel::name::{mk_anon, mk_name, NameExt};
use sigil_kernel::normalize::{mk_interrupt_flag, InterruptFlag, Normalizer};
use sigil_kernel::subst::{head_beta_reduce, instantiate, lift_free_vars, lower_free_vars};

use crate::error::ElabError;
use crate::plugin::{ElaboratorPlugin, PluginAlternatives, Synthesizer};
use crate::queue::CnstrQueue;

#[derive(Debug, Clone)]
pub struct ElabOptions {
    pub use_justifications: bool,
    pub use_normalizer: bool,
}

impl Default for ElabOptions {
    fn default() -> Self {
        ElabOptions { use_justifications: true, use_normalizer: true }
    }
}

/// Everything a case split must be able to restore.
#[derive(Clone)]
struct State {
    menv: MetavarEnv,
    queue: CnstrQueue,
}

enum CaseSplit {
    /// Enumerates the alternatives of a `Choice` constraint in order.
    Choice {
        constraint: UnificationConstraint,
        idx: usize,
        prev_state: State,
        assumption: Option<Justification>,
        failed: Vec<Justification>,
    },
    /// Projection/imitation branches, each with a pre-built state.
    Generic {
        constraint: UnificationConstraint,
        idx: usize,
        states: Vec<State>,
        assumptions: Vec<Justification>,
        assumption: Option<Justification>,
        failed: Vec<Justification>,
    },
    /// Alternatives streamed from an elaborator plugin.
    Plugin {
        constraint: UnificationConstraint,
        alternatives: Box<dyn PluginAlternatives>,
        prev_state: State,
        assumption: Option<Justification>,
        failed: Vec<Justification>,
    },
    /// Candidate terms streamed from a synthesizer for a leftover
    /// metavariable.
    Synth {
        constraint: UnificationConstraint,
        mvar: Expr,
        candidates: Box<dyn Iterator<Item = Expr>>,
        prev_state: State,
        assumption: Option<Justification>,
        failed: Vec<Justification>,
    },
}

impl CaseSplit {
    fn assumption(&self) -> Option<&Justification> {
        match self {
            CaseSplit::Choice { assumption, .. }
            | CaseSplit::Generic { assumption, .. }
            | CaseSplit::Plugin { assumption, .. }
            | CaseSplit::Synth { assumption, .. } => assumption.as_ref(),
        }
    }

    fn push_failed(&mut self, j: Justification) {
        match self {
            CaseSplit::Choice { failed, .. }
            | CaseSplit::Generic { failed, .. }
            | CaseSplit::Plugin { failed, .. }
            | CaseSplit::Synth { failed, .. } => failed.push(j),
        }
    }
}

enum Status {
    Processed,
    Failed,
    Continue,
}

/// An elaboration session. Each call to [`next`](Elaborator::next) yields a
/// further substitution satisfying the submitted constraints, backtracking
/// through the case-split stack between calls.
pub struct Elaborator {
    env: Environment,
    inferer: TypeInferer,
    normalizer: Normalizer,
    state: State,
    case_splits: Vec<CaseSplit>,
    synthesizer: Option<Box<dyn Synthesizer>>,
    plugin: Option<Box<dyn ElaboratorPlugin>>,
    next_id: usize,
    quota: i64,
    conflict: Option<Justification>,
    first: bool,
    interrupt: InterruptFlag,
    options: ElabOptions,
}

impl Elaborator {
    pub fn new(
        env: Environment,
        menv: MetavarEnv,
        constraints: Vec<UnificationConstraint>,
        options: ElabOptions,
        synthesizer: Option<Box<dyn Synthesizer>>,
        plugin: Option<Box<dyn ElaboratorPlugin>>,
    ) -> Elaborator {
        let interrupt = mk_interrupt_flag();
        let mut inferer = TypeInferer::new(env.clone());
        inferer.share_interrupt(interrupt.clone());
        let mut normalizer = Normalizer::new(env.clone());
        normalizer.share_interrupt(interrupt.clone());
        let mut queue = CnstrQueue::new();
        for c in constraints {
            queue.push_back(c);
        }
        Elaborator {
            env,
            inferer,
            normalizer,
            state: State { menv, queue },
            case_splits: Vec::new(),
            synthesizer,
            plugin,
            next_id: 0,
            quota: 0,
            conflict: None,
            first: true,
            interrupt,
            options,
        }
    }

    /// Session over a single equation `ctx |- lhs == rhs`.
    pub fn with_eq(env: Environment, menv: MetavarEnv, ctx: Context, lhs: Expr, rhs: Expr) -> Elaborator {
        let c = mk_eq_constraint(ctx, lhs, rhs, mk_asserted());
        Elaborator::new(env, menv, vec![c], ElabOptions::default(), None, None)
    }

    /// Cancel the session and the kernel components it drives.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        self.inferer.set_interrupt();
        self.normalizer.set_interrupt();
    }

    fn check_interrupted(&self) -> Result<(), ElabError> {
        if self.interrupt.load(Ordering::SeqCst) {
            Err(ElabError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn reset_quota(&mut self) {
        self.quota = self.state.queue.len() as i64;
    }

    fn mk_assumption(&mut self) -> Justification {
        let id = self.next_id;
        self.next_id += 1;
        mk_assumption(id)
    }

    fn push_front(&mut self, c: UnificationConstraint) {
        self.reset_quota();
        self.state.queue.push_front(c);
    }

    fn push_back(&mut self, c: UnificationConstraint) {
        self.state.queue.push_back(c);
    }

    fn is_assigned(&self, m: &Expr) -> bool {
        m.metavar_name().map_or(false, |n| self.state.menv.is_assigned(n))
    }

    fn mvar_subst(&self, m: &Expr) -> Option<Expr> {
        m.metavar_name().and_then(|n| self.state.menv.subst_of(n))
    }

    fn mvar_trace(&self, m: &Expr) -> Option<Justification> {
        m.metavar_name().and_then(|n| self.state.menv.trace_of(n))
    }

    fn normalize_full(&mut self, ctx: &Context, e: &Expr) -> Result<Expr, ElabError> {
        Ok(self.normalizer.normalize(e, ctx, Some(&self.state.menv))?)
    }

    /// `(fun (x.0 : types[0]) ... (x.n-1 : types[n-1]), body)`
    fn mk_lambda_seq(types: &[Expr], body: Expr) -> Expr {
        let mut result = body;
        for (i, ty) in types.iter().enumerate().rev() {
            result = mk_lambda(mk_name("x").num(i as u64), ty.clone(), result);
        }
        result
    }

    /// `(f #num_vars-1 ... #0)`
    fn mk_app_vars(f: Expr, num_vars: usize) -> Expr {
        let mut args = vec![f];
        for i in (0..num_vars).rev() {
            args.push(mk_var(i));
        }
        mk_app(args)
    }

    fn push_new_constraint(
        &mut self,
        queue_of_state: Option<&mut State>,
        is_eq: bool,
        ctx: &Context,
        a: &Expr,
        b: &Expr,
        tr: &Justification,
    ) {
        let c = if is_eq {
            mk_eq_constraint(ctx.clone(), a.clone(), b.clone(), tr.clone())
        } else {
            mk_convertible_constraint(ctx.clone(), a.clone(), b.clone(), tr.clone())
        };
        match queue_of_state {
            Some(state) => state.queue.push_front(c),
            None => self.push_front(c),
        }
    }

    /// Rebuild `c` with both sides replaced, keeping its kind and context.
    fn push_updated_constraint(&mut self, c: &UnificationConstraint, new_a: Expr, new_b: Expr, tr: Justification) {
        let ctx = c.ctx().clone();
        if c.is_eq() {
            self.push_front(mk_eq_constraint(ctx, new_a, new_b, tr));
        } else {
            self.push_front(mk_convertible_constraint(ctx, new_a, new_b, tr));
        }
    }

    /// Rebuild `c` with one side replaced.
    fn push_updated_side(&mut self, c: &UnificationConstraint, is_lhs: bool, new_a: Expr, tr: Justification) {
        let (lhs, rhs) = match c.sides() {
            Some((l, r)) => (l.clone(), r.clone()),
            None => return,
        };
        if is_lhs {
            self.push_updated_constraint(c, new_a, rhs, tr);
        } else {
            self.push_updated_constraint(c, lhs, new_a, tr);
        }
    }

    fn push_normalized_constraint(&mut self, c: &UnificationConstraint, new_a: Expr, new_b: Expr) {
        self.push_updated_constraint(c, new_a, new_b, mk_normalize(c.clone()));
    }

    /// Install `m := v`; if the metavariable has a declared type, demand
    /// that the assignment's type converts to it.
    fn assign(&mut self, m: &Expr, v: &Expr, ctx: &Context, tr: Justification) -> Result<(), ElabError> {
        let name = match m.metavar_name() {
            Some(n) => n.clone(),
            None => return Ok(()),
        };
        log::trace!("{} {} {}", m, ":=".bright_green(), v);
        self.state.menv.assign(&name, v.clone(), tr.clone());
        if let Some(declared) = self.state.menv.ty_of(&name) {
            let mut ucs = Vec::new();
            let inferred = self.inferer.infer(v, ctx, Some(&mut self.state.menv), &mut ucs)?;
            for uc in ucs {
                self.push_front(uc);
            }
            let new_tr = mk_typeof_metavar(ctx.clone(), m.clone(), declared.clone(), inferred.clone(), tr);
            self.push_front(mk_convertible_constraint(ctx.clone(), inferred, declared, new_tr));
        }
        Ok(())
    }

    fn process(&mut self, c: &UnificationConstraint) -> Result<bool, ElabError> {
        self.quota -= 1;
        log::trace!("{} {} (quota {}, depth {})", "process".bright_blue(), c, self.quota, self.case_splits.len());
        match c {
            UnificationConstraint::Eq { ctx, lhs, rhs, .. } => {
                let (ctx, lhs, rhs) = (ctx.clone(), lhs.clone(), rhs.clone());
                self.process_eq_convertible(&ctx, &lhs, &rhs, c)
            }
            UnificationConstraint::Convertible { ctx, from, to, .. } => {
                let (ctx, from, to) = (ctx.clone(), from.clone(), to.clone());
                self.process_eq_convertible(&ctx, &from, &to, c)
            }
            UnificationConstraint::Max { .. } => self.process_max(c),
            UnificationConstraint::Choice { .. } => self.process_choice(c),
        }
    }

    /// Fast paths on a metavariable side:
    /// 1. an assigned metavariable is substituted;
    /// 2. an unassigned one with an empty local context is assigned (after
    ///    the occurs check) when assignment is allowed;
    /// 3. `?m[lift:s:n, ...]` is popped when the other side has no free
    ///    variable in `[s, s+n)`;
    /// 4. an application headed by an assigned metavariable is beta-exposed.
    fn process_metavar(
        &mut self,
        c: &UnificationConstraint,
        a: &Expr,
        b: &Expr,
        is_lhs: bool,
        allow_assignment: bool,
    ) -> Result<Status, ElabError> {
        if a.is_metavar() {
            if self.is_assigned(a) {
                let subst = self.mvar_subst(a).unwrap_or_else(|| a.clone());
                let lctx = a.metavar_lctx().cloned().unwrap_or_default();
                let subst = sigil_kernel::metavar::apply_local_context(
                    &subst,
                    &lctx,
                    Some(&self.state.menv),
                );
                let traces = self.mvar_trace(a).into_iter().collect();
                let new_tr = mk_substitution(c.clone(), traces);
                self.push_updated_side(c, is_lhs, subst, new_tr);
                return Ok(Status::Processed);
            } else if !a.has_local_context() {
                let name = a.metavar_name().cloned();
                if let Some(name) = name {
                    if self.state.menv.mentions(b, &name) {
                        self.conflict = Some(mk_unification_failure(c.clone()));
                        return Ok(Status::Failed);
                    } else if allow_assignment {
                        self.assign(a, b, c.ctx(), mk_assignment(c.clone()))?;
                        self.reset_quota();
                        return Ok(Status::Processed);
                    }
                }
            } else if let Some(LocalEntry::Lift { s, n }) =
                a.metavar_lctx().and_then(|lctx| lctx.front()).cloned()
            {
                if !has_free_in(b, s, s + n) {
                    let new_tr = mk_normalize(c.clone());
                    let mut new_a = pop_lctx(a);
                    let mut new_b = lower_free_vars(b, s + n, n, Some(&self.state.menv));
                    let new_ctx = c.ctx().remove(s, n);
                    if !is_lhs {
                        std::mem::swap(&mut new_a, &mut new_b);
                    }
                    self.push_new_constraint(None, c.is_eq(), &new_ctx, &new_a, &new_b, &new_tr);
                    return Ok(Status::Processed);
                } else if b.is_var() {
                    // ?m[lift:s:n, ...] can never equal a variable in the
                    // lifted range.
                    self.conflict = Some(mk_unification_failure(c.clone()));
                    return Ok(Status::Failed);
                }
            }
        }

        if is_meta_app(a) && self.is_assigned(&a.args()[0]) {
            let head = &a.args()[0];
            let traces = self.mvar_trace(head).into_iter().collect();
            let new_tr = mk_substitution(c.clone(), traces);
            let subst = self.mvar_subst(head).unwrap_or_else(|| head.clone());
            let new_a = update_app_head(a, subst);
            self.push_updated_side(c, is_lhs, new_a, new_tr);
            return Ok(Status::Processed);
        }
        Ok(Status::Continue)
    }

    /// Substitute every assigned metavariable in one side.
    fn instantiate_side(&mut self, is_lhs: bool, a: &Expr, c: &UnificationConstraint) -> bool {
        if self.state.menv.has_assigned_metavar(a) {
            let (new_a, traces) = self.state.menv.instantiate_metavars(a);
            let new_tr = mk_substitution(c.clone(), traces);
            self.push_updated_side(c, is_lhs, new_a, new_tr);
            true
        } else {
            false
        }
    }

    fn unfold_let(&self, a: Expr) -> Expr {
        match &a.data {
            ExprData::Let { value, body, .. } => {
                instantiate(body, 0, value, Some(&self.state.menv))
            }
            _ => a,
        }
    }

    fn unfold_ctx_var(&self, ctx: &Context, a: Expr) -> Expr {
        match &a.data {
            ExprData::Var(i) => match ctx.lookup(*i) {
                Some(entry) => match &entry.body {
                    Some(body) => lift_free_vars(body, 0, i + 1, Some(&self.state.menv)),
                    None => a,
                },
                None => a,
            },
            _ => a,
        }
    }

    fn step_app(&mut self, ctx: &Context, a: Expr) -> Result<Expr, ElabError> {
        let args = match &a.data {
            ExprData::App(args) => args.clone(),
            _ => return Ok(a),
        };
        let f = args[0].clone();
        if f.is_value() && self.options.use_normalizer {
            // A semantic head reduces as soon as it likes, so normalize the
            // arguments left to right and keep offering them.
            let mut new_args = args.clone();
            let mut modified = false;
            for i in 1..new_args.len() {
                let curr = new_args[i].clone();
                let new_curr = self.normalize_full(ctx, &curr)?;
                if curr != new_curr {
                    modified = true;
                    new_args[i] = new_curr;
                    if let ExprData::Value(v) = &f.data {
                        if let Some(r) = v.normalize(&new_args) {
                            return Ok(r);
                        }
                    }
                }
            }
            if modified {
                return Ok(mk_app(new_args));
            }
            Ok(a)
        } else {
            let mut f = self.unfold_let(f);
            f = self.unfold_ctx_var(ctx, f);
            f = head_beta_reduce(&f, Some(&self.state.menv));
            let a = update_app_head(&a, f);
            Ok(head_beta_reduce(&a, Some(&self.state.menv)))
        }
    }

    fn step_eq(&mut self, ctx: &Context, a: Expr) -> Result<Expr, ElabError> {
        if a.is_eq() && self.options.use_normalizer {
            self.normalize_full(ctx, &a)
        } else {
            Ok(a)
        }
    }

    fn normalize_step(&mut self, ctx: &Context, a: &Expr) -> Result<Expr, ElabError> {
        let mut new_a = a.clone();
        new_a = self.unfold_let(new_a);
        new_a = self.unfold_ctx_var(ctx, new_a);
        new_a = self.step_app(ctx, new_a)?;
        new_a = self.step_eq(ctx, new_a)?;
        Ok(new_a)
    }

    fn const_weight(&self, a: &Expr) -> i64 {
        match &a.data {
            ExprData::Constant { name, .. } => match self.env.find_object(name) {
                Some(obj) if obj.is_definition() && !obj.is_opaque() => i64::from(obj.weight()),
                _ => -1,
            },
            _ => -1,
        }
    }

    /// Weight of the definition at the head, or -1 when the head is not an
    /// unfoldable definition.
    fn unfolding_weight(&self, a: &Expr) -> i64 {
        match &a.data {
            ExprData::Constant { .. } => self.const_weight(a),
            ExprData::App(args) => self.const_weight(&args[0]),
            _ => -1,
        }
    }

    fn unfold(&self, a: &Expr) -> Expr {
        let unfold_const = |e: &Expr| -> Expr {
            match &e.data {
                ExprData::Constant { name, .. } => self
                    .env
                    .find_object(name)
                    .and_then(|obj| obj.value())
                    .unwrap_or_else(|| e.clone()),
                _ => e.clone(),
            }
        };
        match &a.data {
            ExprData::Constant { .. } => unfold_const(a),
            ExprData::App(args) => update_app_head(a, unfold_const(&args[0])),
            _ => a.clone(),
        }
    }

    /// Head-normalize both sides, unfolding definitions by weight (heavier
    /// first, both on a tie) until a fixed point.
    fn normalize_head(&mut self, a: &Expr, b: &Expr, c: &UnificationConstraint) -> Result<bool, ElabError> {
        let ctx = c.ctx().clone();
        let mut a = a.clone();
        let mut b = b.clone();
        let mut modified = false;
        loop {
            self.check_interrupted()?;
            let mut new_a = self.normalize_step(&ctx, &a)?;
            let mut new_b = self.normalize_step(&ctx, &b)?;
            if new_a == a && new_b == b {
                let w_a = self.unfolding_weight(&a);
                let w_b = self.unfolding_weight(&b);
                if w_a >= 0 || w_b >= 0 {
                    if w_a >= w_b {
                        new_a = self.unfold(&a);
                    }
                    if w_b >= w_a {
                        new_b = self.unfold(&b);
                    }
                    if new_a == a && new_b == b {
                        break;
                    }
                } else {
                    break;
                }
            }
            modified = true;
            a = new_a;
            b = new_b;
            if a == b {
                return Ok(true);
            }
        }
        if modified {
            self.push_normalized_constraint(c, a, b);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn has_body(ctx: &Context, vidx: usize) -> bool {
        ctx.lookup(vidx).map_or(false, |entry| entry.body.is_some())
    }

    /// All arguments of `a` are variables without a let body in `ctx`.
    fn are_args_vars(ctx: &Context, a: &Expr) -> bool {
        a.args()[1..].iter().all(|arg| match arg.var_idx() {
            Some(idx) => !Elaborator::has_body(ctx, idx),
            None => false,
        })
    }

    /// `ctx |- (?m x1 ... xk) == c` with distinct unlet variables and
    /// closed `c` is solved directly by abstraction.
    fn process_simple_ho_match(
        &mut self,
        ctx: &Context,
        a: &Expr,
        b: &Expr,
        is_lhs: bool,
        c: &UnificationConstraint,
    ) -> bool {
        if c.is_eq() && is_meta_app(a) && Elaborator::are_args_vars(ctx, a) && b.closed() {
            let mut types = Vec::new();
            for arg in &a.args()[1..] {
                match arg.var_idx().and_then(|idx| ctx.lookup(idx)).and_then(|e| e.domain.clone()) {
                    Some(domain) => types.push(domain),
                    None => return false,
                }
            }
            let new_tr = mk_destruct(c.clone());
            let mut m = a.args()[0].clone();
            let mut s = Elaborator::mk_lambda_seq(&types, b.clone());
            if !is_lhs {
                std::mem::swap(&mut m, &mut s);
            }
            self.push_front(mk_eq_constraint(ctx.clone(), m, s, new_tr));
            true
        } else {
            false
        }
    }

    /// Build the projection and imitation branches for
    /// `ctx |- (?m args) == b`.
    fn process_meta_app_core(
        &mut self,
        branches: &mut Vec<(State, Justification)>,
        a: &Expr,
        b: &Expr,
        is_lhs: bool,
        c: &UnificationConstraint,
    ) -> Result<(), ElabError> {
        let ctx = c.ctx().clone();
        let f_a = a.args()[0].clone();
        let num_a = a.args().len();
        let mut arg_types = Vec::new();
        for arg in &a.args()[1..] {
            let mut ucs = Vec::new();
            let ty = self.inferer.infer(arg, &ctx, Some(&mut self.state.menv), &mut ucs)?;
            for uc in ucs {
                self.push_front(uc);
            }
            arg_types.push(ty);
        }
        // Projections: ?m := (fun x..., x_i) and arg_i must match b.
        for i in 1..num_a {
            let mut new_state = self.state.clone();
            let assumption = self.mk_assumption();
            let proj = Elaborator::mk_lambda_seq(&arg_types, mk_var(num_a - i - 1));
            let mut new_a = a.args()[i].clone();
            let mut new_b = b.clone();
            if !is_lhs {
                std::mem::swap(&mut new_a, &mut new_b);
            }
            self.push_new_constraint(Some(&mut new_state), c.is_eq(), &ctx, &new_a, &new_b, &assumption);
            self.push_new_constraint(Some(&mut new_state), true, &ctx, &f_a, &proj, &assumption);
            branches.push((new_state, assumption));
        }
        // Imitation of b's head shape.
        let mut new_state = self.state.clone();
        let assumption = self.mk_assumption();
        let imitation = match &b.data {
            ExprData::App(b_args) => {
                // ?m := (fun x..., f_b (?h_1 x...) ... (?h_k x...))
                let f_b = b_args[0].clone();
                let mut imitation_args = vec![f_b];
                for b_arg in &b_args[1..] {
                    let h = new_state.menv.mk_metavar(ctx.clone());
                    imitation_args.push(Elaborator::mk_app_vars(h.clone(), num_a - 1));
                    self.push_new_constraint(
                        Some(&mut new_state),
                        true,
                        &ctx,
                        &update_app_head(a, h),
                        b_arg,
                        &assumption,
                    );
                }
                Elaborator::mk_lambda_seq(&arg_types, mk_app(imitation_args))
            }
            ExprData::Eq { lhs, rhs } => {
                // ?m := (fun x..., (?h_1 x...) = (?h_2 x...))
                let h_1 = new_state.menv.mk_metavar(ctx.clone());
                let h_2 = new_state.menv.mk_metavar(ctx.clone());
                self.push_new_constraint(Some(&mut new_state), true, &ctx, &update_app_head(a, h_1.clone()), lhs, &assumption);
                self.push_new_constraint(Some(&mut new_state), true, &ctx, &update_app_head(a, h_2.clone()), rhs, &assumption);
                let imitation_eq = mk_eq(
                    Elaborator::mk_app_vars(h_1, num_a - 1),
                    Elaborator::mk_app_vars(h_2, num_a - 1),
                );
                Elaborator::mk_lambda_seq(&arg_types, imitation_eq)
            }
            ExprData::Lambda { name, domain, body } | ExprData::Pi { name, domain, body } => {
                // ?m := (fun x..., fun (x_b : (?h_1 x...)), (?h_2 x... x_b))
                let h_1 = new_state.menv.mk_metavar(ctx.clone());
                let h_2 = new_state.menv.mk_metavar(ctx.clone());
                self.push_new_constraint(Some(&mut new_state), true, &ctx, &update_app_head(a, h_1.clone()), domain, &assumption);
                let extended = ctx.extend(name.clone(), domain.clone());
                self.push_new_constraint(
                    Some(&mut new_state),
                    true,
                    &extended,
                    &mk_app2(update_app_head(a, h_2.clone()), mk_var(0)),
                    body,
                    &assumption,
                );
                let inner = update_abstraction(
                    b,
                    Elaborator::mk_app_vars(h_1, num_a - 1),
                    Elaborator::mk_app_vars(h_2, num_a),
                );
                Elaborator::mk_lambda_seq(&arg_types, inner)
            }
            _ => {
                // Constant-function imitation.
                Elaborator::mk_lambda_seq(&arg_types, lift_free_vars(b, 0, num_a - 1, Some(&self.state.menv)))
            }
        };
        self.push_new_constraint(Some(&mut new_state), true, &ctx, &f_a, &imitation, &assumption);
        branches.push((new_state, assumption));
        Ok(())
    }

    /// Flex-rigid (or, when `flex_flex`, flex-flex) case split by
    /// projection and imitation.
    fn process_meta_app(
        &mut self,
        a: &Expr,
        b: &Expr,
        is_lhs: bool,
        c: &UnificationConstraint,
        flex_flex: bool,
    ) -> Result<bool, ElabError> {
        if is_meta_app(a) && (flex_flex || !is_meta_app(b)) {
            let mut branches = Vec::new();
            self.process_meta_app_core(&mut branches, a, b, is_lhs, c)?;
            if flex_flex && is_meta_app(b) {
                self.process_meta_app_core(&mut branches, b, a, !is_lhs, c)?;
            }
            let (states, assumptions): (Vec<State>, Vec<Justification>) = branches.into_iter().unzip();
            let mut split = CaseSplit::Generic {
                constraint: c.clone(),
                idx: 0,
                states,
                assumptions,
                assumption: None,
                failed: Vec::new(),
            };
            let advanced = self.advance_case_split(&mut split)?;
            debug_assert!(advanced);
            self.case_splits.push(split);
            self.reset_quota();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn is_metavar_inst(a: &Expr) -> bool {
        a.is_metavar()
            && a.metavar_lctx()
                .and_then(|lctx| lctx.front())
                .map_or(false, |entry| entry.is_inst())
    }

    /// `ctx |- ?m[inst:i t, ...] == b`: either the instantiated variable is
    /// what the metavariable stands for, or the head of `b` is imitated.
    fn process_metavar_inst(
        &mut self,
        a: &Expr,
        b: &Expr,
        is_lhs: bool,
        c: &UnificationConstraint,
    ) -> Result<bool, ElabError> {
        if !Elaborator::is_metavar_inst(a) || Elaborator::is_metavar_inst(b) || is_meta_app(b) {
            return Ok(false);
        }
        let ctx = c.ctx().clone();
        let (i, t) = match a.metavar_lctx().and_then(|lctx| lctx.front()) {
            Some(LocalEntry::Inst { s, value }) => (*s, value.clone()),
            _ => return Ok(false),
        };
        let mut branches = Vec::new();
        {
            // The metavariable stands for the instantiated variable.
            let mut new_state = self.state.clone();
            let assumption = self.mk_assumption();
            self.push_new_constraint(Some(&mut new_state), true, &ctx, &pop_lctx(a), &mk_var(i), &assumption);
            let mut new_a = t.clone();
            let mut new_b = b.clone();
            if !is_lhs {
                std::mem::swap(&mut new_a, &mut new_b);
            }
            self.push_new_constraint(Some(&mut new_state), c.is_eq(), &ctx, &new_a, &new_b, &assumption);
            branches.push((new_state, assumption));
        }
        {
            // Imitate b's head.
            let mut new_state = self.state.clone();
            let assumption = self.mk_assumption();
            let imitation = match &b.data {
                ExprData::App(b_args) => {
                    let mut imitation_args = vec![b_args[0].clone()];
                    for _ in 1..b_args.len() {
                        imitation_args.push(new_state.menv.mk_metavar(ctx.clone()));
                    }
                    mk_app(imitation_args)
                }
                ExprData::Eq { .. } => {
                    let h_1 = new_state.menv.mk_metavar(ctx.clone());
                    let h_2 = new_state.menv.mk_metavar(ctx.clone());
                    mk_eq(h_1, h_2)
                }
                ExprData::Lambda { .. } | ExprData::Pi { .. } => {
                    let h_1 = new_state.menv.mk_metavar(ctx.clone());
                    let h_2 = new_state.menv.mk_metavar(ctx.clone());
                    update_abstraction(b, h_1, mk_app2(h_2, mk_var(0)))
                }
                // No occurs check: when b mentions the substituted variable
                // this branch produces a candidate later constraints must
                // reject; the variable branch above stays complete.
                _ => lift_free_vars(b, i, 1, Some(&self.state.menv)),
            };
            self.push_new_constraint(Some(&mut new_state), true, &ctx, &pop_lctx(a), &imitation, &assumption);
            branches.push((new_state, assumption));
        }
        let (states, assumptions): (Vec<State>, Vec<Justification>) = branches.into_iter().unzip();
        let mut split = CaseSplit::Generic {
            constraint: c.clone(),
            idx: 0,
            states,
            assumptions,
            assumption: None,
            failed: Vec::new(),
        };
        let advanced = self.advance_case_split(&mut split)?;
        debug_assert!(advanced);
        self.case_splits.push(split);
        self.reset_quota();
        Ok(true)
    }

    /// `ctx |- a << ?m` with `a` Bool or a Type: enumerate the useful upper
    /// bounds rather than the infinitely many valid ones.
    fn process_lower(&mut self, a: &Expr, b: &Expr, c: &UnificationConstraint) -> bool {
        if !c.is_convertible() || !b.is_metavar() {
            return false;
        }
        let is_bool = builtin::is_bool_type(a);
        if !is_bool && !a.is_type() {
            return false;
        }
        let new_tr = mk_destruct(c.clone());
        let choices = if is_bool {
            vec![
                builtin::bool_type(),
                mk_type(bottom()),
                mk_type(bottom().add(1)),
                builtin::type_m(),
                builtin::type_u(),
            ]
        } else {
            let level = a.ty_level().unwrap_or_else(bottom);
            vec![
                a.clone(),
                mk_type(level.add(1)),
                mk_type(level.add(2)),
                builtin::type_m(),
                builtin::type_u(),
            ]
        };
        let new_c = mk_choice_constraint(c.ctx().clone(), b.clone(), choices, new_tr);
        self.push_front(new_c);
        true
    }

    fn process_eq_convertible(
        &mut self,
        ctx: &Context,
        a: &Expr,
        b: &Expr,
        c: &UnificationConstraint,
    ) -> Result<bool, ElabError> {
        let eq = c.is_eq();
        if a == b {
            return Ok(true);
        }

        // Only equational constraints may assign eagerly here.
        let allow_assignment = eq;
        match self.process_metavar(c, a, b, true, allow_assignment)? {
            Status::Continue => {}
            r => return Ok(matches!(r, Status::Processed)),
        }
        match self.process_metavar(c, b, a, false, allow_assignment)? {
            Status::Continue => {}
            r => return Ok(matches!(r, Status::Processed)),
        }

        if self.normalize_head(a, b, c)? {
            return Ok(true);
        }

        match self.process_metavar(c, a, b, true, !b.is_type() && !is_meta(b))? {
            Status::Continue => {}
            r => return Ok(matches!(r, Status::Processed)),
        }
        // The gate on this side is stricter: Bool never flows rightward.
        match self.process_metavar(c, b, a, false, !a.is_type() && !is_meta(a) && !builtin::is_bool_type(a))? {
            Status::Continue => {}
            r => return Ok(matches!(r, Status::Processed)),
        }

        if self.process_simple_ho_match(ctx, a, b, true, c)
            || self.process_simple_ho_match(ctx, b, a, false, c)
        {
            return Ok(true);
        }

        if !eq && builtin::is_bool_type(a) && b.is_type() {
            return Ok(true);
        }

        if a.kind() == b.kind() {
            match a.kind() {
                ExprKind::Constant | ExprKind::Var | ExprKind::Value => {
                    self.conflict = Some(mk_unification_failure(c.clone()));
                    return Ok(false);
                }
                ExprKind::Type => {
                    let ok = match (a.ty_level(), b.ty_level()) {
                        (Some(la), Some(lb)) => !eq && self.env.is_ge(&lb, &la),
                        _ => false,
                    };
                    if ok {
                        return Ok(true);
                    }
                    self.conflict = Some(mk_unification_failure(c.clone()));
                    return Ok(false);
                }
                ExprKind::Eq => {
                    if let (ExprData::Eq { lhs: la, rhs: ra }, ExprData::Eq { lhs: lb, rhs: rb }) =
                        (&a.data, &b.data)
                    {
                        let new_tr = mk_destruct(c.clone());
                        self.push_front(mk_eq_constraint(ctx.clone(), la.clone(), lb.clone(), new_tr.clone()));
                        self.push_front(mk_eq_constraint(ctx.clone(), ra.clone(), rb.clone(), new_tr));
                        return Ok(true);
                    }
                }
                ExprKind::Pi => {
                    let new_tr = mk_destruct(c.clone());
                    let (da, ba) = (abst_domain(a), abst_body(a));
                    let (db, bb) = (abst_domain(b), abst_body(b));
                    if let (Some(da), Some(ba), Some(db), Some(bb)) = (da, ba, db, bb) {
                        self.push_front(mk_eq_constraint(ctx.clone(), da.clone(), db.clone(), new_tr.clone()));
                        let name = abst_name(a).cloned().unwrap_or_else(mk_anon);
                        let new_ctx = ctx.extend(name, da.clone());
                        if eq {
                            self.push_front(mk_eq_constraint(new_ctx, ba.clone(), bb.clone(), new_tr));
                        } else {
                            self.push_front(mk_convertible_constraint(new_ctx, ba.clone(), bb.clone(), new_tr));
                        }
                        return Ok(true);
                    }
                }
                ExprKind::Lambda => {
                    let new_tr = mk_destruct(c.clone());
                    let (da, ba) = (abst_domain(a), abst_body(a));
                    let (db, bb) = (abst_domain(b), abst_body(b));
                    if let (Some(da), Some(ba), Some(db), Some(bb)) = (da, ba, db, bb) {
                        self.push_front(mk_eq_constraint(ctx.clone(), da.clone(), db.clone(), new_tr.clone()));
                        let name = abst_name(a).cloned().unwrap_or_else(mk_anon);
                        let new_ctx = ctx.extend(name, da.clone());
                        self.push_front(mk_eq_constraint(new_ctx, ba.clone(), bb.clone(), new_tr));
                        return Ok(true);
                    }
                }
                ExprKind::App => {
                    if !is_meta_app(a) && !is_meta_app(b) {
                        if a.args().len() == b.args().len() {
                            let new_tr = mk_destruct(c.clone());
                            for (arg_a, arg_b) in a.args().iter().zip(b.args().iter()) {
                                self.push_front(mk_eq_constraint(
                                    ctx.clone(),
                                    arg_a.clone(),
                                    arg_b.clone(),
                                    new_tr.clone(),
                                ));
                            }
                            return Ok(true);
                        } else {
                            self.conflict = Some(mk_unification_failure(c.clone()));
                            return Ok(false);
                        }
                    }
                }
                ExprKind::Let | ExprKind::MetaVar => {}
            }
        }

        if self.instantiate_side(true, a, c) || self.instantiate_side(false, b, c) {
            return Ok(true);
        }

        if a.kind() != b.kind() && !a.has_metavar() && !b.has_metavar() {
            self.conflict = Some(mk_unification_failure(c.clone()));
            return Ok(false);
        }

        if self.quota < 0 {
            // Expensive: flex-rigid case splits.
            if self.process_meta_app(a, b, true, c, false)?
                || self.process_meta_app(b, a, false, c, false)?
            {
                return Ok(true);
            }
            if self.process_metavar_inst(a, b, true, c)?
                || self.process_metavar_inst(b, a, false, c)?
            {
                return Ok(true);
            }
        }

        if self.quota < -(self.state.queue.len() as i64) {
            // Very expensive: lower-bound ladders, flex-flex, plugins.
            if self.process_lower(a, b, c) {
                return Ok(true);
            }
            if self.process_meta_app(a, b, true, c, true)? {
                return Ok(true);
            }
            if self.process_plugin(c)? {
                return Ok(true);
            }
        }

        self.push_back(c.clone());
        Ok(true)
    }

    fn process_plugin(&mut self, c: &UnificationConstraint) -> Result<bool, ElabError> {
        let alternatives = match &self.plugin {
            Some(plugin) => plugin.solve(&self.state.menv, c),
            None => None,
        };
        match alternatives {
            Some(alternatives) => {
                let mut split = CaseSplit::Plugin {
                    constraint: c.clone(),
                    alternatives,
                    prev_state: self.state.clone(),
                    assumption: None,
                    failed: Vec::new(),
                };
                if self.advance_case_split(&mut split)? {
                    self.case_splits.push(split);
                    self.reset_quota();
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            None => Ok(false),
        }
    }

    /// `?t == Type (max l1 l2)`. The target is usually a metavariable for a
    /// sort; once concrete it is checked against the universe store.
    fn process_max(&mut self, c: &UnificationConstraint) -> Result<bool, ElabError> {
        let (ctx, mvar, lhs, rhs) = match c {
            UnificationConstraint::Max { ctx, mvar, lhs, rhs, .. } => {
                (ctx.clone(), mvar.clone(), lhs.clone(), rhs.clone())
            }
            _ => return Ok(true),
        };
        let combined = mk_max(lhs, rhs);
        if mvar.is_metavar() {
            if self.is_assigned(&mvar) {
                let (inst, _) = self.state.menv.instantiate_metavars(&mvar);
                return self.finish_max(&inst, &combined, c);
            }
            self.assign(&mvar, &mk_type(combined), &ctx, mk_assignment(c.clone()))?;
            self.reset_quota();
            return Ok(true);
        }
        self.finish_max(&mvar, &combined, c)
    }

    fn finish_max(&mut self, target: &Expr, combined: &Level, c: &UnificationConstraint) -> Result<bool, ElabError> {
        match target.ty_level() {
            Some(l) => {
                if self.env.is_ge(&l, combined) && self.env.is_ge(combined, &l) {
                    Ok(true)
                } else {
                    self.conflict = Some(mk_unification_failure(c.clone()));
                    Ok(false)
                }
            }
            None => {
                if target.has_metavar() {
                    self.push_back(c.clone());
                    Ok(true)
                } else {
                    self.conflict = Some(mk_unification_failure(c.clone()));
                    Ok(false)
                }
            }
        }
    }

    fn process_choice(&mut self, c: &UnificationConstraint) -> Result<bool, ElabError> {
        let mut split = CaseSplit::Choice {
            constraint: c.clone(),
            idx: 0,
            prev_state: self.state.clone(),
            assumption: None,
            failed: Vec::new(),
        };
        let advanced = self.advance_case_split(&mut split)?;
        debug_assert!(advanced);
        self.case_splits.push(split);
        Ok(true)
    }

    /// Move a case split to its next alternative, restoring the saved state.
    /// Returns false (and installs a by-cases conflict) on exhaustion.
    fn advance_case_split(&mut self, split: &mut CaseSplit) -> Result<bool, ElabError> {
        match split {
            CaseSplit::Choice { constraint, idx, prev_state, assumption, failed } => {
                let (ctx, mvar, alternatives) = match constraint {
                    UnificationConstraint::Choice { ctx, mvar, alternatives, .. } => {
                        (ctx.clone(), mvar.clone(), alternatives.clone())
                    }
                    _ => return Ok(false),
                };
                if *idx < alternatives.len() {
                    let alt = alternatives[*idx].clone();
                    *idx += 1;
                    let id = self.next_id;
                    self.next_id += 1;
                    let new_assumption = mk_assumption(id);
                    *assumption = Some(new_assumption.clone());
                    self.state = prev_state.clone();
                    self.push_front(mk_eq_constraint(ctx, mvar, alt, new_assumption));
                    Ok(true)
                } else {
                    self.conflict = Some(mk_failure_by_cases(constraint.clone(), failed.clone()));
                    Ok(false)
                }
            }
            CaseSplit::Generic { constraint, idx, states, assumptions, assumption, failed } => {
                let sz = states.len();
                if *idx < sz {
                    let pick = sz - *idx - 1;
                    *idx += 1;
                    *assumption = Some(assumptions[pick].clone());
                    self.state = states[pick].clone();
                    Ok(true)
                } else {
                    self.conflict = Some(mk_failure_by_cases(constraint.clone(), failed.clone()));
                    Ok(false)
                }
            }
            CaseSplit::Plugin { constraint, alternatives, prev_state, assumption, failed } => {
                let id = self.next_id;
                self.next_id += 1;
                let new_assumption = mk_assumption(id);
                match alternatives.next(&new_assumption) {
                    Some((menv, constraints)) => {
                        *assumption = Some(new_assumption);
                        self.state = State { menv, queue: prev_state.queue.clone() };
                        for uc in constraints {
                            self.push_front(uc);
                        }
                        Ok(true)
                    }
                    None => {
                        self.conflict = Some(mk_failure_by_cases(constraint.clone(), failed.clone()));
                        Ok(false)
                    }
                }
            }
            CaseSplit::Synth { constraint, mvar, candidates, prev_state, assumption, failed } => {
                match candidates.next() {
                    Some(candidate) => {
                        let id = self.next_id;
                        self.next_id += 1;
                        let new_assumption = mk_assumption(id);
                        *assumption = Some(new_assumption.clone());
                        self.state = prev_state.clone();
                        let ctx = constraint.ctx().clone();
                        self.push_front(mk_eq_constraint(ctx, mvar.clone(), candidate, new_assumption));
                        Ok(true)
                    }
                    None => {
                        self.conflict = Some(mk_failure_by_cases(constraint.clone(), failed.clone()));
                        Ok(false)
                    }
                }
            }
        }
    }

    /// Walk the case-split stack from the top, skipping splits the conflict
    /// does not depend on, and advance the first one it does.
    fn resolve_conflict(&mut self) -> Result<(), ElabError> {
        let mut conflict = match self.conflict.clone() {
            Some(conflict) => conflict,
            None => return Ok(()),
        };
        log::trace!("{} over {} splits\n{}", "resolve".bright_red(), self.case_splits.len(), conflict.explain());
        while let Some(mut split) = self.case_splits.pop() {
            let depends = split
                .assumption()
                .map_or(false, |assumption| depends_on(&conflict, assumption));
            if depends {
                split.push_failed(conflict.clone());
                if self.advance_case_split(&mut split)? {
                    self.conflict = None;
                    self.case_splits.push(split);
                    self.reset_quota();
                    return Ok(());
                }
                if let Some(widened) = self.conflict.clone() {
                    conflict = widened;
                }
            }
        }
        self.conflict = Some(conflict.clone());
        Err(ElabError::Unification { justification: conflict })
    }

    /// Offer a leftover metavariable to the synthesizer, if one is present.
    fn try_synthesizer(&mut self) -> Result<bool, ElabError> {
        let name = match self.state.menv.find_unassigned() {
            Some(name) => name,
            None => return Ok(false),
        };
        let synthesizer = match &self.synthesizer {
            Some(s) => s,
            None => return Ok(false),
        };
        let ctx = self.state.menv.ctx_of(&name).unwrap_or_default();
        let mvar = mk_metavar(name.clone(), LocalContext::new());
        let ty = self.state.menv.ty_of(&name);
        let candidates = synthesizer.candidates(&self.state.menv, &mvar, ty.as_ref());
        let pseudo = mk_eq_constraint(ctx, mvar.clone(), mvar.clone(), mk_asserted());
        let mut split = CaseSplit::Synth {
            constraint: pseudo,
            mvar,
            candidates,
            prev_state: self.state.clone(),
            assumption: None,
            failed: Vec::new(),
        };
        if self.advance_case_split(&mut split)? {
            self.case_splits.push(split);
            self.reset_quota();
            Ok(true)
        } else {
            // No candidates at all: treat as a normal conflict.
            self.resolve_conflict()?;
            Ok(true)
        }
    }

    /// Produce the next substitution satisfying the constraints.
    pub fn next(&mut self) -> Result<Substitution, ElabError> {
        self.check_interrupted()?;
        if let Some(conflict) = self.conflict.clone() {
            return Err(ElabError::Unification { justification: conflict });
        }
        if !self.case_splits.is_empty() {
            // Re-entering the session: invalidate the current branches.
            let assumptions: Vec<Justification> = self
                .case_splits
                .iter()
                .filter_map(|split| split.assumption().cloned())
                .collect();
            self.conflict = Some(mk_next_solution(assumptions));
            self.resolve_conflict()?;
        } else if self.first {
            self.first = false;
        } else {
            return Err(ElabError::NoMoreSolutions);
        }
        self.reset_quota();
        loop {
            self.check_interrupted()?;
            let queue_len = self.state.queue.len() as i64;
            if self.state.queue.is_empty() || self.quota < -queue_len - 10 {
                if self.state.queue.is_empty() && self.try_synthesizer()? {
                    continue;
                }
                return Ok(self.state.menv.substitution());
            }
            let c = match self.state.queue.pop_front() {
                Some(c) => c,
                None => return Ok(self.state.menv.substitution()),
            };
            if !self.process(&c)? {
                self.resolve_conflict()?;
            }
        }
    }
}

fn is_meta_app(a: &Expr) -> bool {
    a.is_app() && a.args()[0].is_metavar()
}

fn is_meta(a: &Expr) -> bool {
    a.is_metavar() || is_meta_app(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_kernel::level::mk_uvar;
    use sigil_kernel::name::Name;

    fn session(menv: MetavarEnv, constraints: Vec<UnificationConstraint>) -> Elaborator {
        let _ = env_logger::builder().is_test(true).try_init();
        Elaborator::new(
            Environment::new(),
            menv,
            constraints,
            ElabOptions::default(),
            None,
            None,
        )
    }

    fn meta_name(m: &Expr) -> Name {
        m.metavar_name().cloned().expect("metavariable")
    }

    fn solutions_for(elab: &mut Elaborator, name: &Name, cap: usize) -> Vec<Expr> {
        let mut result = Vec::new();
        for _ in 0..cap {
            match elab.next() {
                Ok(subst) => match subst.get(name) {
                    Some(v) => result.push(v),
                    None => break,
                },
                Err(_) => break,
            }
        }
        result
    }

    #[test]
    fn identity_lambda_is_assigned() {
        let mut menv = MetavarEnv::new();
        let m = menv.mk_metavar(Context::new());
        let name = meta_name(&m);
        let id = mk_lambda(mk_name("x"), builtin::bool_type(), mk_var(0));
        let c = mk_eq_constraint(Context::new(), m, id.clone(), mk_asserted());
        let mut elab = session(menv, vec![c]);
        let subst = elab.next().expect("first solution");
        assert_eq!(subst.get(&name), Some(id));
        assert!(matches!(elab.next(), Err(ElabError::NoMoreSolutions)));
    }

    #[test]
    fn higher_order_projection_enumerates() {
        let mut menv = MetavarEnv::new();
        let m = menv.mk_metavar(Context::new());
        let name = meta_name(&m);
        let a_ty = builtin::bool_type();
        // (fun x y, ?m x y) == (fun x y, x)
        let lhs = mk_lambda(
            mk_name("x"), a_ty.clone(),
            mk_lambda(
                mk_name("y"), a_ty.clone(),
                mk_app(vec![m.clone(), mk_var(1), mk_var(0)]),
            ),
        );
        let rhs = mk_lambda(
            mk_name("x"), a_ty.clone(),
            mk_lambda(mk_name("y"), a_ty.clone(), mk_var(1)),
        );
        let c = mk_eq_constraint(Context::new(), lhs, rhs, mk_asserted());
        let mut elab = session(menv, vec![c]);
        let solutions = solutions_for(&mut elab, &name, 8);
        assert!(solutions.len() >= 2);
        // Projection on the first argument is among the solutions.
        let projection = mk_lambda(
            mk_name("x").num(0), a_ty.clone(),
            mk_lambda(mk_name("x").num(1), a_ty.clone(), mk_var(1)),
        );
        assert!(solutions.contains(&projection));
    }

    #[test]
    fn conflict_driven_backtracking_finds_viable_branch() {
        let mut menv = MetavarEnv::new();
        let m = menv.mk_metavar(Context::new());
        let name = meta_name(&m);
        let alt_a = mk_constant(mk_name("a"));
        let alt_b = mk_constant(mk_name("b"));
        let choice = mk_choice_constraint(
            Context::new(),
            m.clone(),
            vec![alt_a, alt_b.clone()],
            mk_asserted(),
        );
        // Only the second alternative survives this equation.
        let pin = mk_eq_constraint(Context::new(), m, alt_b.clone(), mk_asserted());
        let mut elab = session(menv, vec![choice, pin]);
        let subst = elab.next().expect("solution from the viable branch");
        assert_eq!(subst.get(&name), Some(alt_b));
    }

    #[test]
    fn lower_bound_ladder_enumerates_upper_bounds() {
        let mut menv = MetavarEnv::new();
        let m = menv.mk_metavar(Context::new());
        let name = meta_name(&m);
        let c = mk_convertible_constraint(
            Context::new(),
            builtin::bool_type(),
            m,
            mk_asserted(),
        );
        let mut elab = session(menv, vec![c]);
        let solutions = solutions_for(&mut elab, &name, 16);
        assert_eq!(solutions.len(), 5);
        assert_eq!(solutions[0], builtin::bool_type());
        assert_eq!(solutions[1], mk_type(bottom()));
        assert_eq!(solutions[2], mk_type(bottom().add(1)));
        assert_eq!(solutions[3], builtin::type_m());
        assert_eq!(solutions[4], builtin::type_u());
    }

    #[test]
    fn pi_decomposition_reaches_domains() {
        let mut menv = MetavarEnv::new();
        let m = menv.mk_metavar(Context::new());
        let name = meta_name(&m);
        let lhs = mk_pi(mk_name("x"), m.clone(), builtin::bool_type());
        let rhs = mk_pi(mk_name("x"), builtin::bool_type(), builtin::bool_type());
        let c = mk_eq_constraint(Context::new(), lhs, rhs, mk_asserted());
        let mut elab = session(menv, vec![c]);
        let subst = elab.next().expect("solution");
        assert_eq!(subst.get(&name), Some(builtin::bool_type()));
    }

    #[test]
    fn definitions_unfold_by_weight() {
        let env = Environment::new();
        env.add_definition(
            mk_name("c1"),
            builtin::bool_type(),
            builtin::mk_true(),
            false,
        ).expect("c1");
        let c = mk_eq_constraint(
            Context::new(),
            mk_constant(mk_name("c1")),
            builtin::mk_true(),
            mk_asserted(),
        );
        let mut elab = Elaborator::new(
            env, MetavarEnv::new(), vec![c], ElabOptions::default(), None, None,
        );
        assert!(elab.next().is_ok());
    }

    #[test]
    fn opaque_definitions_stay_folded() {
        let env = Environment::new();
        env.add_definition(
            mk_name("c1"),
            builtin::bool_type(),
            builtin::mk_true(),
            true,
        ).expect("c1");
        let c = mk_eq_constraint(
            Context::new(),
            mk_constant(mk_name("c1")),
            builtin::mk_false(),
            mk_asserted(),
        );
        let mut elab = Elaborator::new(
            env, MetavarEnv::new(), vec![c], ElabOptions::default(), None, None,
        );
        assert!(matches!(elab.next(), Err(ElabError::Unification { .. })));
    }

    struct ListSynthesizer(Vec<Expr>);

    impl Synthesizer for ListSynthesizer {
        fn candidates(
            &self,
            _menv: &MetavarEnv,
            _mvar: &Expr,
            _ty: Option<&Expr>,
        ) -> Box<dyn Iterator<Item = Expr>> {
            Box::new(self.0.clone().into_iter())
        }
    }

    #[test]
    fn synthesizer_fills_leftover_metavariables() {
        let mut menv = MetavarEnv::new();
        let m = menv.mk_metavar(Context::new());
        let name = meta_name(&m);
        let mut elab = Elaborator::new(
            Environment::new(),
            menv,
            Vec::new(),
            ElabOptions::default(),
            Some(Box::new(ListSynthesizer(vec![builtin::mk_true()]))),
            None,
        );
        let subst = elab.next().expect("synthesized solution");
        assert_eq!(subst.get(&name), Some(builtin::mk_true()));
    }

    #[test]
    fn interrupt_cancels_the_session() {
        let mut menv = MetavarEnv::new();
        let m = menv.mk_metavar(Context::new());
        let c = mk_eq_constraint(Context::new(), m, builtin::mk_true(), mk_asserted());
        let mut elab = session(menv, vec![c]);
        elab.interrupt();
        assert!(matches!(elab.next(), Err(ElabError::Interrupted)));
    }

    #[test]
    fn lift_entries_pop_against_narrower_sides() {
        // ?m[lift:0:1] == true in a context with one binder: the lift is
        // popped and the metavariable is solved in the narrower context.
        let mut menv = MetavarEnv::new();
        let m = menv.mk_metavar(Context::new());
        let name = meta_name(&m);
        let lifted = sigil_kernel::subst::add_lift(&m, 0, 1, None);
        let ctx = Context::new().extend(mk_name("x"), builtin::bool_type());
        let c = mk_eq_constraint(ctx, lifted, builtin::mk_true(), mk_asserted());
        let mut elab = session(menv, vec![c]);
        let subst = elab.next().expect("solution");
        assert_eq!(subst.get(&name), Some(builtin::mk_true()));
    }

    #[test]
    fn max_constraints_assign_sorts() {
        let mut menv = MetavarEnv::new();
        let m = menv.mk_metavar(Context::new());
        let name = meta_name(&m);
        let l1 = mk_uvar(mk_name("bot"));
        let c = mk_max_constraint(Context::new(), m, l1.clone(), l1.add(2), mk_asserted());
        let mut elab = session(menv, vec![c]);
        let subst = elab.next().expect("solution");
        assert_eq!(subst.get(&name), Some(mk_type(l1.add(2))));
    }
}
