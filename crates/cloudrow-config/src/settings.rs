//! Settings file schema and its conversion into engine configuration

use crate::error::{ConfigError, Result};
use cloudrow_engine::{Backoff, EngineConfig, LeasePolicy, RetryPolicy, WaitConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Longest run the engine will schedule
pub const MAX_RUN_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Contents of a `cloudrow.yaml`. Every section may be omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Account used when the command line does not name one
    pub account: Option<String>,
    pub engine: EngineSettings,
    pub retry: RetrySettings,
    pub wait: WaitSettings,
    pub lease: LeaseSettings,
    /// Per-scope overrides keyed by scope name. Unlisted scopes are enabled.
    pub scopes: BTreeMap<String, ScopeSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    pub max_passes: u32,
    pub stall_passes: u32,
    pub concurrency: usize,
    pub run_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            max_passes: engine.max_passes,
            stall_passes: engine.stall_passes,
            concurrency: engine.concurrency,
            run_timeout_secs: engine.run_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            max_attempts: retry.max_attempts,
            initial_delay_ms: retry.backoff.initial_delay.as_millis() as u64,
            max_delay_ms: retry.backoff.max_delay.as_millis() as u64,
            multiplier: retry.backoff.multiplier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WaitSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub timeout_secs: u64,
}

impl Default for WaitSettings {
    fn default() -> Self {
        let wait = WaitConfig::default();
        Self {
            initial_delay_ms: wait.backoff.initial_delay.as_millis() as u64,
            max_delay_ms: wait.backoff.max_delay.as_millis() as u64,
            multiplier: wait.backoff.multiplier,
            timeout_secs: wait.timeout.as_secs(),
        }
    }
}

/// How a run reacts when another run holds the account
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaseSettings {
    /// Queue for this long instead of failing right away
    pub wait_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScopeSettings {
    pub enabled: bool,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Settings {
    pub fn from_yaml(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        // An empty file deserializes to unit, not to an empty mapping
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Read and validate a settings file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let settings = Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_passes == 0 {
            return Err(ConfigError::invalid("engine.max_passes", "must be at least 1"));
        }
        if self.engine.stall_passes == 0 {
            return Err(ConfigError::invalid("engine.stall_passes", "must be at least 1"));
        }
        if self.engine.concurrency == 0 {
            return Err(ConfigError::invalid("engine.concurrency", "must be at least 1"));
        }
        if self.engine.run_timeout_secs == 0 {
            return Err(ConfigError::invalid("engine.run_timeout_secs", "must be positive"));
        }
        if self.engine.run_timeout_secs > MAX_RUN_TIMEOUT_SECS {
            return Err(ConfigError::invalid(
                "engine.run_timeout_secs",
                format!("must be at most {}", MAX_RUN_TIMEOUT_SECS),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        check_backoff("retry", self.retry.initial_delay_ms, self.retry.max_delay_ms, self.retry.multiplier)?;
        check_backoff("wait", self.wait.initial_delay_ms, self.wait.max_delay_ms, self.wait.multiplier)?;
        if self.wait.timeout_secs == 0 {
            return Err(ConfigError::invalid("wait.timeout_secs", "must be positive"));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_passes: self.engine.max_passes,
            stall_passes: self.engine.stall_passes,
            concurrency: self.engine.concurrency,
            run_timeout: Duration::from_secs(self.engine.run_timeout_secs),
            retry: self.retry_policy(),
            lease: self.lease_policy(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.retry.max_attempts)
            .with_backoff(backoff(
                self.retry.initial_delay_ms,
                self.retry.max_delay_ms,
                self.retry.multiplier,
            ))
    }

    pub fn wait_config(&self) -> WaitConfig {
        WaitConfig {
            backoff: backoff(
                self.wait.initial_delay_ms,
                self.wait.max_delay_ms,
                self.wait.multiplier,
            ),
            timeout: Duration::from_secs(self.wait.timeout_secs),
        }
    }

    pub fn lease_policy(&self) -> LeasePolicy {
        match self.lease.wait_secs {
            Some(secs) => LeasePolicy::Wait(Duration::from_secs(secs)),
            None => LeasePolicy::Reject,
        }
    }

    pub fn scope_enabled(&self, scope: &str) -> bool {
        self.scopes.get(scope).is_none_or(|s| s.enabled)
    }
}

fn backoff(initial_ms: u64, max_ms: u64, multiplier: f64) -> Backoff {
    Backoff {
        initial_delay: Duration::from_millis(initial_ms),
        max_delay: Duration::from_millis(max_ms),
        multiplier,
    }
}

fn check_backoff(section: &str, initial_ms: u64, max_ms: u64, multiplier: f64) -> Result<()> {
    if max_ms < initial_ms {
        return Err(ConfigError::invalid(
            format!("{}.max_delay_ms", section),
            "must not be below initial_delay_ms",
        ));
    }
    if multiplier.is_nan() || multiplier < 1.0 {
        return Err(ConfigError::invalid(
            format!("{}.multiplier", section),
            "must be at least 1.0",
        ));
    }
    Ok(())
}
