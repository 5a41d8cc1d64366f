//! Configuration for the transaction lifecycle manager
//!
//! All knobs have production defaults; `Settings::from_file` loads a TOML
//! file with environment variable substitution for deployments that want
//! to override them.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub submission: SubmissionConfig,
    pub fees: FeePolicy,
}

/// Timing and retry knobs for submission, tracking, and bumping
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Interval between confirmation status probes
    pub status_poll_interval_ms: u64,
    /// Force a ledger resync every this many unresolved polls
    pub resync_every_polls: u32,
    /// Fee bumper tick interval
    pub bump_check_interval_ms: u64,
    /// How long a submission may sit unconfirmed before it is bumped
    /// or rebroadcast
    pub wait_before_bump_ms: u64,
    /// Broadcast attempts before a transient failure is surfaced
    pub max_broadcast_attempts: u32,
    /// Delay between broadcast retries
    pub retry_delay_ms: u64,
    /// Depth of the submission queue before `submit` applies backpressure
    pub queue_depth: usize,
    /// Capacity of the replacement event channel
    pub replacement_channel_capacity: usize,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            status_poll_interval_ms: 3_000,
            resync_every_polls: 5,
            bump_check_interval_ms: 1_000,
            wait_before_bump_ms: 15_000,
            max_broadcast_attempts: 3,
            retry_delay_ms: 500,
            queue_depth: 64,
            replacement_channel_capacity: 256,
        }
    }
}

impl SubmissionConfig {
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn bump_check_interval(&self) -> Duration {
        Duration::from_millis(self.bump_check_interval_ms)
    }

    pub fn wait_before_bump(&self) -> Duration {
        Duration::from_millis(self.wait_before_bump_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Fee bump policy
///
/// Replacement fees are raised to whichever is larger of the current
/// market rate and the previous rate increased by the relative and
/// absolute minimums, so progress is made even when the market is flat.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeePolicy {
    /// Relative minimum increase per replacement, in percent
    pub min_increase_percent: u64,
    /// Absolute minimum increase per fee dimension, in wei
    pub min_increase_absolute: u128,
    /// How long a fee market snapshot stays fresh
    pub fee_cache_ttl_ms: u64,
    /// Hard ceiling on the max fee per gas a bump may reach, in wei
    pub max_fee_per_gas: Option<u128>,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            min_increase_percent: 11,
            min_increase_absolute: 1_000_000_000,
            fee_cache_ttl_ms: 5_000,
            max_fee_per_gas: None,
        }
    }
}

impl FeePolicy {
    pub fn fee_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.fee_cache_ttl_ms)
    }
}

impl Settings {
    /// Load settings from a TOML file with `${VAR}` environment
    /// substitution
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.submission.bump_check_interval_ms == 0 {
            anyhow::bail!("bump_check_interval_ms must be positive");
        }
        if self.submission.status_poll_interval_ms == 0 {
            anyhow::bail!("status_poll_interval_ms must be positive");
        }
        if self.submission.resync_every_polls == 0 {
            anyhow::bail!("resync_every_polls must be positive");
        }
        if self.submission.max_broadcast_attempts == 0 {
            anyhow::bail!("max_broadcast_attempts must be positive");
        }
        if self.fees.min_increase_percent == 0 && self.fees.min_increase_absolute == 0 {
            anyhow::bail!(
                "a replacement must strictly raise fees: set min_increase_percent or \
                 min_increase_absolute"
            );
        }
        if let Some(cap) = self.fees.max_fee_per_gas {
            if cap == 0 {
                anyhow::bail!("max_fee_per_gas ceiling must be positive when set");
            }
        }
        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
