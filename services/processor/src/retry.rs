//! Per-stage retry policy.

use crate::config::PipelineConfig;
use backoff::ExponentialBackoff;
use std::time::Duration;

/// Attempt bound and exponential delay schedule for one stage
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
        }
    }

    /// Delay schedule: no jitter, no elapsed-time cut-off (the attempt
    /// bound and the run deadline end retrying)
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            randomization_factor: 0.0,
            multiplier: self.multiplier,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Bounded schedule for one-off store calls outside a stage
    pub fn bounded_backoff(&self) -> ExponentialBackoff {
        let budget = self
            .max_delay
            .saturating_mul(self.max_attempts.saturating_sub(1).max(1));
        ExponentialBackoff {
            max_elapsed_time: Some(budget),
            ..self.backoff()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::backoff::Backoff;

    #[test]
    fn test_delays_double_up_to_cap() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        };

        let mut backoff = policy.backoff();
        let delays: Vec<Duration> = (0..5).filter_map(|_| backoff.next_backoff()).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );
    }

    #[test]
    fn test_from_config_defaults() {
        let policy = RetryPolicy::from_config(&PipelineConfig::default());
        assert_eq!(policy, RetryPolicy::default());
    }

    #[test]
    fn test_zero_attempts_is_clamped() {
        let config = PipelineConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_attempts, 1);
    }
}
