use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one worker is required")]
    NoWorkers,
    #[error("backoff base {base:?} exceeds backoff max {max:?}")]
    Backoff { base: Duration, max: Duration },
}

/// Knobs shared by the binder and the projector workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of projector workers draining the work queue.
    pub workers: usize,
    /// Sleep before each call out to a destination.
    pub throttle: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Project objects every cluster already has (token secrets, `kube-root-ca.crt`, ...).
    pub include_system_objects: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            throttle: Duration::ZERO,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(60),
            include_system_objects: false,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

impl EngineConfig {
    /// Reads `PLACEMENT_*` variables, keeping the default for anything unset.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_parse::<usize>("PLACEMENT_WORKERS").unwrap_or(d.workers).max(1),
            throttle: env_parse::<u64>("PLACEMENT_THROTTLE_MS").map(Duration::from_millis).unwrap_or(d.throttle),
            backoff_base: env_parse::<u64>("PLACEMENT_BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.backoff_base),
            backoff_max: env_parse::<u64>("PLACEMENT_BACKOFF_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.backoff_max),
            include_system_objects: env_parse::<bool>("PLACEMENT_INCLUDE_SYSTEM_OBJECTS")
                .unwrap_or(d.include_system_objects),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::Backoff { base: self.backoff_base, max: self.backoff_max });
        }
        Ok(())
    }

    /// Delay before the `failures`-th retry: base * 2^(failures-1), capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(30);
        self.backoff_base.saturating_mul(1u32 << shift).min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let c = EngineConfig { backoff_base: Duration::from_millis(10), backoff_max: Duration::from_millis(70), ..Default::default() };
        assert_eq!(c.backoff(1), Duration::from_millis(10));
        assert_eq!(c.backoff(2), Duration::from_millis(20));
        assert_eq!(c.backoff(3), Duration::from_millis(40));
        assert_eq!(c.backoff(4), Duration::from_millis(70));
        assert_eq!(c.backoff(200), Duration::from_millis(70));
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));
        let c = EngineConfig { backoff_base: Duration::from_secs(2), backoff_max: Duration::from_secs(1), ..Default::default() };
        assert!(matches!(c.validate(), Err(ConfigError::Backoff { .. })));
        assert_eq!(EngineConfig { workers: 0, ..Default::default() }.validate(), Err(ConfigError::NoWorkers));
    }
}
