use std::time::Duration;

/// How many failed attempts a viewer gets and how long to wait between them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(3),
        }
    }
}

/// Failure counter owned by a single viewer connection.
#[derive(Debug)]
pub struct Reconnect {
    policy: RetryPolicy,
    failures: u32,
}

impl Reconnect {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Count a failed attempt. Returns true while another attempt is allowed.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.failures < self.policy.max_attempts
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn backoff(&self) -> Duration {
        self.policy.backoff
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
