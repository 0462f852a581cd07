//! Work generation (the create step)

use crate::config::CreatePolicy;

/// Decides which ranks run the create callback
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkGenerator {
    policy: CreatePolicy,

    /// Restart records were loaded, so nobody creates
    restarted: bool,

    /// A create callback is registered
    has_callback: bool,
}

impl WorkGenerator {
    pub(crate) fn new(policy: CreatePolicy, restarted: bool, has_callback: bool) -> Self {
        Self {
            policy,
            restarted,
            has_callback,
        }
    }

    /// Check if `rank` should run the create callback
    pub(crate) fn creates_on(&self, rank: usize) -> bool {
        if self.restarted || !self.has_callback {
            return false;
        }
        match self.policy {
            CreatePolicy::Coordinator => rank == 0,
            CreatePolicy::Global => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_policy() {
        let generator = WorkGenerator::new(CreatePolicy::Coordinator, false, true);
        assert!(generator.creates_on(0));
        assert!(!generator.creates_on(1));
    }

    #[test]
    fn test_global_policy() {
        let generator = WorkGenerator::new(CreatePolicy::Global, false, true);
        assert!((0..4).all(|r| generator.creates_on(r)));
    }

    #[test]
    fn test_restart_and_missing_callback_skip_create() {
        let restarted = WorkGenerator::new(CreatePolicy::Global, true, true);
        assert!(!restarted.creates_on(0));

        let no_callback = WorkGenerator::new(CreatePolicy::Coordinator, false, false);
        assert!(!no_callback.creates_on(0));
    }
}
