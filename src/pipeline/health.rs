//! Consecutive-failure tracking and recovery budgeting.

use tracing::{info, warn};

use crate::config::HealthSettings;

/// What the caller should do after recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    /// Below the threshold.
    Degraded { consecutive: u32 },
    /// Threshold reached and recovery budget left; the caller should recover.
    RecoveryDue { attempt: u32 },
    /// Threshold reached but every recovery has been used. `first` is set
    /// only the first time this is reported.
    Exhausted { first: bool },
}

/// Counts consecutive failures and decides when to resubscribe.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    consecutive_failures: u32,
    threshold: u32,
    recovery_attempts: u32,
    max_recoveries: u32,
    recovery_pending: bool,
    exhausted_logged: bool,
}

impl HealthMonitor {
    pub fn new(settings: &HealthSettings) -> Self {
        Self {
            consecutive_failures: 0,
            threshold: settings.failure_threshold.max(1),
            recovery_attempts: 0,
            max_recoveries: settings.max_recoveries,
            recovery_pending: false,
            exhausted_logged: false,
        }
    }

    /// Pick up changed thresholds without touching the counters.
    pub fn apply(&mut self, settings: &HealthSettings) {
        self.threshold = settings.failure_threshold.max(1);
        self.max_recoveries = settings.max_recoveries;
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            info!(
                after = self.consecutive_failures,
                "Processing healthy again"
            );
        }
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) -> HealthSignal {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures < self.threshold || self.recovery_pending {
            return HealthSignal::Degraded {
                consecutive: self.consecutive_failures,
            };
        }

        if self.recovery_attempts >= self.max_recoveries {
            let first = !self.exhausted_logged;
            if first {
                warn!(
                    recoveries = self.recovery_attempts,
                    "Recovery budget exhausted, continuing without resubscribing"
                );
                self.exhausted_logged = true;
            }
            return HealthSignal::Exhausted { first };
        }

        self.recovery_attempts += 1;
        self.recovery_pending = true;
        warn!(
            consecutive = self.consecutive_failures,
            attempt = self.recovery_attempts,
            max = self.max_recoveries,
            "Failure threshold reached, recovery due"
        );
        HealthSignal::RecoveryDue {
            attempt: self.recovery_attempts,
        }
    }

    /// Reset the failure counter once a recovery has run.
    pub fn recovery_completed(&mut self) {
        self.consecutive_failures = 0;
        self.recovery_pending = false;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(threshold: u32, max: u32) -> HealthMonitor {
        HealthMonitor::new(&HealthSettings {
            failure_threshold: threshold,
            max_recoveries: max,
        })
    }

    #[test]
    fn success_resets_counter() {
        let mut m = monitor(3, 1);
        m.record_failure();
        m.record_failure();
        m.record_success();
        assert_eq!(m.consecutive_failures(), 0);
        assert_eq!(m.record_failure(), HealthSignal::Degraded { consecutive: 1 });
    }

    #[test]
    fn threshold_triggers_recovery() {
        let mut m = monitor(5, 3);
        for i in 1..5 {
            assert_eq!(m.record_failure(), HealthSignal::Degraded { consecutive: i });
        }
        assert_eq!(m.record_failure(), HealthSignal::RecoveryDue { attempt: 1 });
        // Failures while the recovery runs do not request another one.
        assert_eq!(m.record_failure(), HealthSignal::Degraded { consecutive: 6 });
        m.recovery_completed();
        assert_eq!(m.consecutive_failures(), 0);
        assert_eq!(m.recovery_attempts(), 1);
    }

    #[test]
    fn recoveries_are_bounded() {
        let mut m = monitor(1, 2);
        assert_eq!(m.record_failure(), HealthSignal::RecoveryDue { attempt: 1 });
        m.recovery_completed();
        assert_eq!(m.record_failure(), HealthSignal::RecoveryDue { attempt: 2 });
        m.recovery_completed();
        assert_eq!(m.record_failure(), HealthSignal::Exhausted { first: true });
        assert_eq!(m.record_failure(), HealthSignal::Exhausted { first: false });
        assert_eq!(m.recovery_attempts(), 2);
    }
}
