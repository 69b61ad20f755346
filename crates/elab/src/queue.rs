
use imbl::Vector;

use sigil_kernel::constraint::UnificationConstraint;

/// Constraint queue. Persistent underneath, so saving it into a case split
/// is a cheap clone rather than an O(n) copy.
#[derive(Debug, Clone, Default)]
pub struct CnstrQueue {
    inner: Vector<UnificationConstraint>,
}

impl CnstrQueue {
    pub fn new() -> CnstrQueue {
        CnstrQueue::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Urgent work: results of decomposition go to the front.
    pub fn push_front(&mut self, c: UnificationConstraint) {
        self.inner.push_front(c);
    }

    /// Work to revisit after more assignments have happened.
    pub fn push_back(&mut self, c: UnificationConstraint) {
        self.inner.push_back(c);
    }

    pub fn pop_front(&mut self) -> Option<UnificationConstraint> {
        self.inner.pop_front()
    }

    pub fn iter(&self) -> imbl::vector::Iter<'_, UnificationConstraint> {
        self.inner.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_kernel::constraint::mk_eq_constraint;
    use sigil_kernel::context::Context;
    use sigil_kernel::expr::mk_var;
    use sigil_kernel::justification::mk_asserted;

    #[test]
    fn fifo_with_urgent_front() {
        let mut q = CnstrQueue::new();
        let c0 = mk_eq_constraint(Context::new(), mk_var(0), mk_var(0), mk_asserted());
        let c1 = mk_eq_constraint(Context::new(), mk_var(1), mk_var(1), mk_asserted());
        let c2 = mk_eq_constraint(Context::new(), mk_var(2), mk_var(2), mk_asserted());
        q.push_back(c0);
        q.push_back(c1);
        q.push_front(c2);
        let snapshot = q.clone();
        let order: Vec<_> = std::iter::from_fn(|| q.pop_front())
            .filter_map(|c| c.sides().map(|(a, _)| a.var_idx()).flatten())
            .collect();
        assert_eq!(order, vec![2, 0, 1]);
        // The snapshot is unaffected by draining the live queue.
        assert_eq!(snapshot.len(), 3);
        assert!(q.is_empty());
    }
}
