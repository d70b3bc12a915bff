use crate::config::SupervisorConfig;
use std::time::Duration;

/// Decision returned by the restart policy after a child crash.
#[derive(Debug, Clone, PartialEq)]
pub enum CrashDecision {
    /// Restart once the (possibly grown) backoff window has passed.
    Restart { backoff: Duration },
    /// Restart cap exceeded. The child is never spawned again.
    GiveUp,
}

/// Bounded restart policy with multiplicative backoff.
///
/// The restart count is never reset by a later healthy run, so a child that
/// crashed often long ago keeps its grown backoff until it hits the cap.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    max_restarts: u32,
    base_backoff: Duration,
    factor: f64,
    max_backoff: Duration,
}

impl RestartPolicy {
    pub fn new(max_restarts: u32, base_backoff: Duration, factor: f64, max_backoff: Duration) -> Self {
        Self {
            max_restarts,
            base_backoff,
            factor,
            max_backoff,
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(
            config.max_restarts,
            Duration::from_secs_f64(config.base_backoff_secs),
            config.backoff_factor,
            Duration::from_secs_f64(config.max_backoff_secs),
        )
    }

    /// Backoff a freshly configured child starts with.
    pub fn initial_backoff(&self) -> Duration {
        self.base_backoff.min(self.max_backoff)
    }

    /// Evaluate a crash. `restarts` is the count including this crash.
    pub fn on_crash(&self, restarts: u32, current: Duration) -> CrashDecision {
        if restarts > self.max_restarts {
            return CrashDecision::GiveUp;
        }
        CrashDecision::Restart {
            backoff: self.grow(current),
        }
    }

    fn grow(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.factor;
        if !next.is_finite() || next >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(next)
    }

    #[allow(dead_code)]
    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_default_policy_values() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.max_restarts(), 5);
        assert_eq!(policy.initial_backoff(), secs(2.0));
    }

    #[test]
    fn test_backoff_multiplies_by_factor() {
        let policy = RestartPolicy::default();
        assert_eq!(
            policy.on_crash(1, secs(2.0)),
            CrashDecision::Restart { backoff: secs(3.0) }
        );
        assert_eq!(
            policy.on_crash(2, secs(3.0)),
            CrashDecision::Restart { backoff: secs(4.5) }
        );
    }

    #[test]
    fn test_backoff_clamped_at_ceiling() {
        let policy = RestartPolicy::new(100, secs(2.0), 1.5, secs(30.0));
        let mut backoff = policy.initial_backoff();
        let mut previous = backoff;
        for n in 1..=20 {
            match policy.on_crash(n, backoff) {
                CrashDecision::Restart { backoff: next } => {
                    assert!(next >= previous, "backoff must never shrink");
                    assert!(next <= secs(30.0));
                    previous = next;
                    backoff = next;
                }
                CrashDecision::GiveUp => panic!("cap not reached yet"),
            }
        }
        assert_eq!(backoff, secs(30.0));
    }

    #[test]
    fn test_give_up_only_after_cap_exceeded() {
        let policy = RestartPolicy::default();
        for n in 1..=5 {
            assert!(matches!(
                policy.on_crash(n, secs(2.0)),
                CrashDecision::Restart { .. }
            ));
        }
        assert_eq!(policy.on_crash(6, secs(2.0)), CrashDecision::GiveUp);
        assert_eq!(policy.on_crash(60, secs(2.0)), CrashDecision::GiveUp);
    }

    #[test]
    fn test_zero_max_restarts_gives_up_on_first_crash() {
        let policy = RestartPolicy::new(0, secs(1.0), 2.0, secs(10.0));
        assert_eq!(policy.on_crash(1, secs(1.0)), CrashDecision::GiveUp);
    }

    #[test]
    fn test_factor_of_one_keeps_backoff_constant() {
        let policy = RestartPolicy::new(5, secs(2.0), 1.0, secs(30.0));
        assert_eq!(
            policy.on_crash(3, secs(2.0)),
            CrashDecision::Restart { backoff: secs(2.0) }
        );
    }

    #[test]
    fn test_initial_backoff_respects_ceiling() {
        let policy = RestartPolicy::new(5, secs(60.0), 1.5, secs(30.0));
        assert_eq!(policy.initial_backoff(), secs(30.0));
    }
}
