//! Restart policy for failed roles
//!
//! A role that dies of a fatal error is restarted a bounded number of times
//! in a row; past that the whole device restarts.

use tracing::{error, warn};

/// What to do after a fatal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Start the role again
    Restart,
    /// Give up and restart the device
    RestartDevice,
}

/// Counts consecutive failures against a limit
#[derive(Debug, Clone)]
pub struct FailureBudget {
    max_failures: u32,
    failures: u32,
}

impl FailureBudget {
    pub fn new(max_failures: u32) -> Self {
        Self {
            max_failures,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record one failure and decide how to recover
    pub fn record_failure(&mut self) -> Recovery {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.max_failures {
            error!(
                "{} consecutive failures (limit {}), restarting device",
                self.failures, self.max_failures
            );
            Recovery::RestartDevice
        } else {
            warn!("Failure {} of {}, restarting role", self.failures, self.max_failures);
            Recovery::Restart
        }
    }

    /// Forget past failures after a healthy run
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

impl Default for FailureBudget {
    fn default() -> Self {
        Self::new(3)
    }
}
