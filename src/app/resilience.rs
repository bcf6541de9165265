use std::time::Duration;

use crate::config::TunnelConfig;

/// Linear backoff restart configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub base_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl From<&TunnelConfig> for RestartPolicy {
    fn from(cfg: &TunnelConfig) -> Self {
        Self {
            max_restarts: cfg.max_restarts,
            base_delay: cfg.restart_delay(),
        }
    }
}

/// What to do after the `attempt`-th consecutive failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

impl RestartPolicy {
    /// `base_delay × attempt`; strictly increasing for `attempt >= 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// `attempt` is the restart counter after it has been incremented.
    pub fn decide(&self, attempt: u32) -> RestartDecision {
        if attempt > self.max_restarts {
            RestartDecision::GiveUp { attempts: attempt }
        } else {
            RestartDecision::Retry {
                attempt,
                delay: self.delay_for(attempt),
            }
        }
    }
}
