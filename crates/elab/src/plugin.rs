
use sigil_kernel::constraint::UnificationConstraint;
use sigil_kernel::expr::Expr;
use sigil_kernel::justification::Justification;
use sigil_kernel::metavar::MetavarEnv;

/// Produces candidate terms for a metavariable the constraints leave
/// undetermined. Candidates are tried in order, each under a fresh
/// assumption.
pub trait Synthesizer {
    fn candidates(
        &self,
        menv: &MetavarEnv,
        mvar: &Expr,
        ty: Option<&Expr>,
    ) -> Box<dyn Iterator<Item = Expr>>;
}

/// Lazy sequence of alternatives offered by an [`ElaboratorPlugin`]. Each
/// call receives the assumption the core will guard the branch with.
pub trait PluginAlternatives {
    fn next(
        &mut self,
        assumption: &Justification,
    ) -> Option<(MetavarEnv, Vec<UnificationConstraint>)>;
}

/// Extension hook: invoked on constraints the deterministic pipeline and
/// the built-in case splits cannot reduce.
pub trait ElaboratorPlugin {
    fn solve(
        &self,
        menv: &MetavarEnv,
        constraint: &UnificationConstraint,
    ) -> Option<Box<dyn PluginAlternatives>>;
}
