
use thiserror::Error;

use sigil_kernel::error::KernelError;
use sigil_kernel::justification::Justification;

#[derive(Debug, Clone, Error)]
pub enum ElabError {
    /// The constraints are unsatisfiable; the justification explains which
    /// assumptions the failure depends on.
    #[error("unification failure: {justification}")]
    Unification { justification: Justification },
    #[error("no more solutions")]
    NoMoreSolutions,
    #[error("interrupted")]
    Interrupted,
    #[error(transparent)]
    Kernel(#[from] KernelError),
}
