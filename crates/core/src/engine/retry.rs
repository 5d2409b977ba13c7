//! # Retry Policies
//!
//! Decides whether a failed skill call or child task gets another attempt,
//! and how long the task sleeps before it becomes runnable again.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::kata::{CompiledKata, Phase, RetrySetting};

/// Shape of the delay curve between attempts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// `base * n` after the n-th failure
    Linear,
    /// `base * 2^(n-1)` after the n-th failure
    Exponential,
}

impl Backoff {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(Self::Fixed),
            "linear" => Some(Self::Linear),
            "exponential" => Some(Self::Exponential),
            _ => None,
        }
    }
}

/// A bounded retry rule.
///
/// `max_attempts` counts every attempt including the first one, so a policy
/// with `max_attempts = 1` never retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub base_delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

/// Outcome of consulting a policy after a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-attempt after `delay`; `attempt` is the number of failures so far
    Retry { attempt: u32, delay: Duration },
    /// No attempts left
    Exhausted { attempts: u32 },
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed,
            base_delay_ms: 0,
            max_delay_ms: None,
        }
    }

    pub fn new(max_attempts: u32, backoff: Backoff, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: None,
        }
    }

    /// Cap every computed delay at `max`
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay_ms = Some(max.as_millis() as u64);
        self
    }

    pub fn retries(&self) -> bool {
        self.max_attempts > 1
    }

    /// Delay before the attempt that follows the `failures`-th failure
    pub fn delay_for(&self, failures: u32) -> Duration {
        let n = u64::from(failures.max(1));
        let ms = match self.backoff {
            Backoff::Fixed => self.base_delay_ms,
            Backoff::Linear => self.base_delay_ms.saturating_mul(n),
            Backoff::Exponential => {
                let factor = 1u64.checked_shl((n - 1) as u32).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor)
            }
        };
        let ms = match self.max_delay_ms {
            Some(cap) => ms.min(cap),
            None => ms,
        };
        Duration::from_millis(ms)
    }

    /// Decide what happens after the `failures`-th consecutive failure
    pub fn decide(&self, failures: u32) -> RetryDecision {
        if failures < self.max_attempts {
            RetryDecision::Retry {
                attempt: failures,
                delay: self.delay_for(failures),
            }
        } else {
            RetryDecision::Exhausted { attempts: failures }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// The engine-wide fallback policy plus the stock constructors katas refer to.
#[derive(Debug, Clone, Default)]
pub struct DefaultRetryPolicies {
    fallback: RetryPolicy,
}

impl DefaultRetryPolicies {
    pub fn new(fallback: RetryPolicy) -> Self {
        Self { fallback }
    }

    pub fn no_retry() -> RetryPolicy {
        RetryPolicy::none()
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Backoff::Fixed, delay)
    }

    pub fn linear(max_attempts: u32, base: Duration) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Backoff::Linear, base)
    }

    pub fn exponential(max_attempts: u32, base: Duration) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Backoff::Exponential, base)
    }

    /// 3 attempts, exponential from 1s, capped at 60s
    pub fn standard() -> RetryPolicy {
        Self::exponential(3, Duration::from_secs(1)).with_max_delay(Duration::from_secs(60))
    }

    pub fn fallback(&self) -> &RetryPolicy {
        &self.fallback
    }

    /// Resolve the policy for a phase: phase setting, then kata default, then fallback
    pub fn resolve(&self, kata: &CompiledKata, phase: &Phase) -> RetryPolicy {
        match phase.retry.as_ref().or(kata.default_retry.as_ref()) {
            Some(RetrySetting::Policy(policy)) => policy.clone(),
            Some(RetrySetting::EngineDefault) | None => self.fallback.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_retries() {
        let policy = RetryPolicy::none();
        assert!(!policy.retries());
        assert_eq!(policy.decide(1), RetryDecision::Exhausted { attempts: 1 });
    }

    #[test]
    fn test_three_attempts_allow_two_retries() {
        let policy = DefaultRetryPolicies::fixed(3, Duration::from_millis(250));

        assert_eq!(
            policy.decide(1),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(250)
            }
        );
        assert!(matches!(policy.decide(2), RetryDecision::Retry { attempt: 2, .. }));
        assert_eq!(policy.decide(3), RetryDecision::Exhausted { attempts: 3 });
    }

    #[test]
    fn test_backoff_curves() {
        let linear = DefaultRetryPolicies::linear(5, Duration::from_secs(2));
        assert_eq!(linear.delay_for(1), Duration::from_secs(2));
        assert_eq!(linear.delay_for(3), Duration::from_secs(6));

        let exp = DefaultRetryPolicies::exponential(5, Duration::from_secs(1));
        assert_eq!(exp.delay_for(1), Duration::from_secs(1));
        assert_eq!(exp.delay_for(2), Duration::from_secs(2));
        assert_eq!(exp.delay_for(4), Duration::from_secs(8));
    }

    #[test]
    fn test_max_delay_caps_exponential_growth() {
        let policy = DefaultRetryPolicies::standard();
        assert_eq!(policy.delay_for(30), Duration::from_secs(60));
        assert_eq!(policy.delay_for(200), Duration::from_secs(60));
    }

    #[test]
    fn test_policy_serialization() {
        let policy = DefaultRetryPolicies::linear(4, Duration::from_millis(500));
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["backoff"], "linear");
        assert_eq!(json["max_attempts"], 4);

        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }
}
