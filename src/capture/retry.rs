use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

use crate::ingest::SourceKind;

/// Bounded retry with backoff, applied when opening a connection.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    /// `1.0` gives a fixed backoff; `2.0` doubles it per attempt.
    pub multiplier: f64,
    pub max_backoff_ms: u64,
    /// Spread each delay by up to ±10% so cameras behind one switch do not
    /// get reconnect storms in lockstep.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            multiplier: 1.0,
            max_backoff_ms: 0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self::default()
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: initial.as_millis() as u64,
            multiplier: 2.0,
            max_backoff_ms: max.as_millis() as u64,
            jitter: true,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: delay.as_millis() as u64,
            multiplier: 1.0,
            max_backoff_ms: delay.as_millis() as u64,
            jitter: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = base.min(self.max_backoff_ms.max(self.initial_backoff_ms) as f64);
        let millis = if self.jitter && capped > 0.0 {
            capped * rand::thread_rng().gen_range(0.9..=1.1)
        } else {
            capped
        };
        Duration::from_millis(millis.round() as u64)
    }
}

/// Retry policy per source family.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicies {
    pub network: RetryPolicy,
    pub local_device: RetryPolicy,
    pub file: RetryPolicy,
    pub synthetic: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            network: RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(4)),
            local_device: RetryPolicy::fixed(2, Duration::from_millis(500)),
            file: RetryPolicy::once(),
            synthetic: RetryPolicy::once(),
        }
    }
}

impl RetryPolicies {
    /// Same policy for every source family.
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            network: policy.clone(),
            local_device: policy.clone(),
            file: policy.clone(),
            synthetic: policy,
        }
    }

    pub fn for_kind(&self, kind: SourceKind) -> &RetryPolicy {
        match kind {
            SourceKind::Network => &self.network,
            SourceKind::LocalDevice => &self.local_device,
            SourceKind::File => &self.file,
            SourceKind::Synthetic => &self.synthetic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_is_capped() {
        let mut policy =
            RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(300));
        policy.jitter = false;
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(4), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy =
            RetryPolicy::exponential(3, Duration::from_millis(1000), Duration::from_millis(1000));
        for _ in 0..20 {
            let delay = policy.backoff(1).as_millis();
            assert!((900..=1100).contains(&delay), "delay {}", delay);
        }
    }

    #[test]
    fn network_sources_retry_more_than_files() {
        let policies = RetryPolicies::default();
        assert_eq!(policies.for_kind(SourceKind::Network).attempts(), 3);
        assert_eq!(policies.for_kind(SourceKind::File).attempts(), 1);
        assert_eq!(RetryPolicy { max_attempts: 0, ..RetryPolicy::once() }.attempts(), 1);
    }
}
