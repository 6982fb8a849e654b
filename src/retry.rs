//! Failure classification and retry bookkeeping.
//!
//! [`classify`] is pure: the same kind, count and policy always produce the same decision,
//! which keeps retry behaviour independent of timing and of the API server.

use std::time::Duration;

use crate::error::ErrorKind;
use crate::kubernetes_objects::notebook_validation_job::Reason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            backoff: vec![
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(300),
            ],
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `retry` (1-based). The last step repeats once the schedule runs out.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let index = (retry.max(1) as usize).min(self.backoff.len()).saturating_sub(1);
        self.backoff.get(index).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Requeue after the delay, nothing is deleted.
    Transient,
    /// Delete the failed resource, then requeue after the delay.
    Retriable,
    /// Move to `Failed`.
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    pub classification: Classification,
    pub delay: Option<Duration>,
    /// The count to record in status.
    pub retry_count: u32,
    pub reason: Reason,
}

impl RetryDecision {
    pub fn is_terminal(&self) -> bool {
        self.classification == Classification::Terminal
    }

    /// Whether the failed child resource has to go before the next attempt.
    pub fn deletes_resource(&self) -> bool {
        self.classification == Classification::Retriable
    }
}

pub fn classify(kind: ErrorKind, retry_count: u32, policy: &RetryPolicy) -> RetryDecision {
    let classification = match kind {
        ErrorKind::ConfigurationError
        | ErrorKind::CapabilityUnavailable
        | ErrorKind::TerminalExecutionFailure => {
            return RetryDecision {
                classification: Classification::Terminal,
                delay: None,
                retry_count,
                reason: kind.reason(),
            };
        }
        // API hiccups never count as attempts and never end the job.
        ErrorKind::TransientInfra => {
            return RetryDecision {
                classification: Classification::Transient,
                delay: Some(policy.delay_for(retry_count.saturating_add(1))),
                retry_count,
                reason: kind.reason(),
            };
        }
        ErrorKind::RetriableExecutionFailure | ErrorKind::ResourceExhaustion => {
            Classification::Retriable
        }
    };

    let next = retry_count.saturating_add(1);
    if next >= policy.max_retries {
        return RetryDecision {
            classification: Classification::Terminal,
            delay: None,
            retry_count: next.min(policy.max_retries),
            reason: Reason::RetriesExhausted,
        };
    }

    RetryDecision {
        classification,
        delay: Some(policy.delay_for(next)),
        retry_count: next,
        reason: kind.reason(),
    }
}
