use serde::Deserialize;
use std::time::Duration;

use crate::generators::FunctionSet;

/// What a worker does when its broker session cannot be (re)established
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Fail fast
    #[default]
    None,
    /// Up to `attempts` further tries, `delay` apart
    FixedBackoff { attempts: u32, delay: Duration },
}

impl RetryPolicy {
    /// Extra attempts allowed after the first failure
    pub fn attempts(&self) -> u32 {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::FixedBackoff { attempts, .. } => *attempts,
        }
    }

    pub fn delay(&self) -> Duration {
        match self {
            RetryPolicy::None => Duration::ZERO,
            RetryPolicy::FixedBackoff { delay, .. } => *delay,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PolicyName {
    None,
    #[serde(alias = "fixed-backoff")]
    FixedBackoff,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRetry {
    #[serde(default = "default_policy")]
    policy: PolicyName,
    #[serde(default = "default_attempts")]
    attempts: u32,
    #[serde(default = "default_delay_secs")]
    delay_secs: f64,
}

fn default_policy() -> PolicyName {
    PolicyName::None
}

fn default_attempts() -> u32 {
    3
}

fn default_delay_secs() -> f64 {
    5.0
}

impl<'de> Deserialize<'de> for RetryPolicy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawRetry::deserialize(deserializer)?;
        match raw.policy {
            PolicyName::None => Ok(RetryPolicy::None),
            PolicyName::FixedBackoff => {
                if !raw.delay_secs.is_finite() || raw.delay_secs < 0.0 {
                    return Err(serde::de::Error::custom(format!(
                        "retry delay_secs must be >= 0, got {}",
                        raw.delay_secs
                    )));
                }
                let delay = Duration::try_from_secs_f64(raw.delay_secs).map_err(|e| {
                    serde::de::Error::custom(format!(
                        "retry delay_secs {} is out of range: {}",
                        raw.delay_secs, e
                    ))
                })?;
                Ok(RetryPolicy::FixedBackoff {
                    attempts: raw.attempts,
                    delay,
                })
            }
        }
    }
}

/// Timing and tuning knobs of the engine (`[runtime]`)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub stagger_ms: u64,
    pub monitor_interval_ms: u64,
    pub listener_grace_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub keep_alive_secs: u64,
    pub channel_capacity: usize,
    pub seed: Option<u64>,
    pub expression_functions: FunctionSet,
    pub retry: RetryPolicy,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            stagger_ms: 100,
            monitor_interval_ms: 500,
            listener_grace_ms: 3000,
            shutdown_timeout_secs: 10,
            connect_timeout_secs: 10,
            keep_alive_secs: 60,
            channel_capacity: 100,
            seed: None,
            expression_functions: FunctionSet::Basic,
            retry: RetryPolicy::None,
        }
    }
}

impl RuntimeSettings {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    pub fn listener_grace(&self) -> Duration {
        Duration::from_millis(self.listener_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let settings: RuntimeSettings = toml::from_str("stagger_ms = 5").unwrap();
        assert_eq!(settings.stagger(), Duration::from_millis(5));
        assert_eq!(settings.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(settings.retry, RetryPolicy::None);
        assert_eq!(settings.expression_functions, FunctionSet::Basic);
    }

    #[test]
    fn fixed_backoff_policy() {
        let settings: RuntimeSettings = toml::from_str(
            "expression_functions = 'extended'\n[retry]\npolicy = 'fixed_backoff'\nattempts = 2\ndelay_secs = 0.5",
        )
        .unwrap();
        assert_eq!(
            settings.retry,
            RetryPolicy::FixedBackoff {
                attempts: 2,
                delay: Duration::from_millis(500)
            }
        );
        assert_eq!(settings.retry.attempts(), 2);
        assert_eq!(settings.expression_functions, FunctionSet::Extended);
    }

    #[test]
    fn unknown_policy_is_rejected() {
        assert!(toml::from_str::<RuntimeSettings>("[retry]\npolicy = 'forever'").is_err());
    }

    #[test]
    fn oversized_retry_delay_is_rejected() {
        let result = toml::from_str::<RuntimeSettings>(
            "[retry]\npolicy = 'fixed_backoff'\ndelay_secs = 1e30",
        );
        assert!(result.is_err());
    }
}
