use serde::{Deserialize, Serialize};
use std::env;

/// Engine-wide tuning knobs.
///
/// Every value has a usable default; `from_env` overrides from the
/// environment for deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on actions executed per run, shared across a recursive
    /// trigger chain. The principal safety valve against runaway automation.
    pub max_actions_per_run: u32,
    /// How often the scheduler sweep runs, in seconds.
    pub sweep_interval_secs: u64,
    /// Base delay for job retry backoff (`base * 2^attempt`).
    pub retry_base_secs: u64,
    /// Default attempt ceiling for scheduler jobs.
    pub default_max_attempts: u32,
    /// Timeout applied to external dispatch calls (email/SMS/webhook).
    pub dispatch_timeout_secs: u64,
    /// How many finished automation runs to retain in the in-memory log.
    pub run_log_retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_actions_per_run: 25,
            sweep_interval_secs: 5,
            retry_base_secs: 30,
            default_max_attempts: 5,
            dispatch_timeout_secs: 10,
            run_log_retention: 200,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            max_actions_per_run: env_parse("AUTOMATION_MAX_ACTIONS_PER_RUN", defaults.max_actions_per_run),
            sweep_interval_secs: env_parse("AUTOMATION_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
            retry_base_secs: env_parse("AUTOMATION_RETRY_BASE_SECS", defaults.retry_base_secs),
            default_max_attempts: env_parse("AUTOMATION_MAX_ATTEMPTS", defaults.default_max_attempts),
            dispatch_timeout_secs: env_parse("AUTOMATION_DISPATCH_TIMEOUT_SECS", defaults.dispatch_timeout_secs),
            run_log_retention: env_parse("AUTOMATION_RUN_LOG_RETENTION", defaults.run_log_retention),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_actions_per_run, 25);
        assert_eq!(config.default_max_attempts, 5);
    }

    #[test]
    fn test_from_env_falls_back_to_defaults() {
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.sweep_interval_secs, EngineConfig::default().sweep_interval_secs);
    }
}
