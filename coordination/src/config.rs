//! Quota and engine configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variable overrides (`WORDSMITH_*`)
//! 2. Values loaded from a TOML file
//! 3. Built-in defaults
//!
//! ## Example
//!
//! ```toml
//! divergence_log = "divergence.jsonl"
//!
//! [batch]
//! max_concurrency = 4
//! followup_concurrency = 2
//!
//! [[providers]]
//! name = "openai"
//! max_per_window = 60
//! window_secs = 60
//! max_concurrent = 8
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{CoordinationError, CoordinationResult};

const DEFAULT_WINDOW_SECS: u64 = 60;
const DEFAULT_BATCH_CONCURRENCY: usize = 3;
const DEFAULT_FOLLOWUP_CONCURRENCY: usize = 2;

const ENV_BATCH_CONCURRENCY: &str = "WORDSMITH_BATCH_CONCURRENCY";
const ENV_FOLLOWUP_CONCURRENCY: &str = "WORDSMITH_FOLLOWUP_CONCURRENCY";
const ENV_DIVERGENCE_LOG: &str = "WORDSMITH_DIVERGENCE_LOG";

/// Admission budget for one [`RateLimitedPool`](crate::pool::RateLimitedPool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermitBudget {
    /// Grants allowed per window. Always at least 1.
    pub max_per_window: u32,
    /// Length of the fixed window.
    pub window: Duration,
    /// Maximum permits held at once (0 = unbounded).
    pub max_concurrent: u32,
}

impl PermitBudget {
    /// Build a budget, rejecting a zero quota or a zero-length window.
    pub fn new(max_per_window: u32, window: Duration) -> CoordinationResult<Self> {
        let budget = Self {
            max_per_window,
            window,
            max_concurrent: 0,
        };
        budget.validate()?;
        Ok(budget)
    }

    /// Shorthand for a per-minute request quota with unbounded parallelism.
    pub fn per_minute(max_per_window: u32) -> CoordinationResult<Self> {
        Self::new(max_per_window, Duration::from_secs(60))
    }

    /// Cap the number of simultaneously held permits.
    pub fn with_max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Whether a concurrency ceiling applies.
    pub fn is_concurrency_bounded(&self) -> bool {
        self.max_concurrent > 0
    }

    pub fn validate(&self) -> CoordinationResult<()> {
        if self.max_per_window == 0 {
            return Err(CoordinationError::InvalidBudget(
                "max_per_window must be >= 1".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(CoordinationError::InvalidBudget(
                "window duration must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Quota entry for a single provider as it appears in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderQuota {
    /// Provider key (e.g. `"openai"`); pools are registered under this name.
    pub name: String,
    pub max_per_window: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// 0 disables the concurrency ceiling.
    #[serde(default)]
    pub max_concurrent: u32,
}

fn default_window_secs() -> u64 {
    DEFAULT_WINDOW_SECS
}

impl ProviderQuota {
    pub fn new(name: impl Into<String>, max_per_window: u32, max_concurrent: u32) -> Self {
        Self {
            name: name.into(),
            max_per_window,
            window_secs: DEFAULT_WINDOW_SECS,
            max_concurrent,
        }
    }

    /// Convert into a validated [`PermitBudget`].
    pub fn budget(&self) -> CoordinationResult<PermitBudget> {
        PermitBudget::new(self.max_per_window, Duration::from_secs(self.window_secs))
            .map(|b| b.with_max_concurrent(self.max_concurrent))
            .map_err(|e| CoordinationError::Config(format!("provider {}: {e}", self.name)))
    }
}

/// Worker counts for the two batch phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Workers for the per-item pipeline phase.
    #[serde(default = "default_batch_concurrency")]
    pub max_concurrency: usize,
    /// Workers for the side-artifact follow-up phase.
    #[serde(default = "default_followup_concurrency")]
    pub followup_concurrency: usize,
}

fn default_batch_concurrency() -> usize {
    DEFAULT_BATCH_CONCURRENCY
}

fn default_followup_concurrency() -> usize {
    DEFAULT_FOLLOWUP_CONCURRENCY
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_BATCH_CONCURRENCY,
            followup_concurrency: DEFAULT_FOLLOWUP_CONCURRENCY,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderQuota>,
    #[serde(default)]
    pub batch: BatchSettings,
    /// Append-only JSONL file for divergence records (None = tracing only).
    #[serde(default)]
    pub divergence_log: Option<PathBuf>,
}

fn default_providers() -> Vec<ProviderQuota> {
    vec![
        ProviderQuota::new("openai", 60, 8),
        ProviderQuota::new("anthropic", 50, 4),
        ProviderQuota::new("google", 15, 0),
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            batch: BatchSettings::default(),
            divergence_log: None,
        }
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_overrides(|key| env::var(key).ok());
        cfg
    }

    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> CoordinationResult<Self> {
        toml::from_str(raw).map_err(|e| CoordinationError::Config(e.to_string()))
    }

    /// Load a TOML file, apply environment overrides and validate.
    pub fn load(path: &Path) -> CoordinationResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoordinationError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut cfg = Self::from_toml_str(&raw)?;
        cfg.apply_overrides(|key| env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `WORDSMITH_*` overrides from `lookup`. Unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_BATCH_CONCURRENCY) {
            match raw.parse() {
                Ok(n) => self.batch.max_concurrency = n,
                Err(_) => tracing::warn!(key = ENV_BATCH_CONCURRENCY, value = %raw, "ignoring invalid override"),
            }
        }
        if let Some(raw) = lookup(ENV_FOLLOWUP_CONCURRENCY) {
            match raw.parse() {
                Ok(n) => self.batch.followup_concurrency = n,
                Err(_) => tracing::warn!(key = ENV_FOLLOWUP_CONCURRENCY, value = %raw, "ignoring invalid override"),
            }
        }
        if let Some(path) = lookup(ENV_DIVERGENCE_LOG) {
            self.divergence_log = Some(PathBuf::from(path));
        }
    }

    /// Quota for `provider`, if configured.
    pub fn quota(&self, provider: &str) -> Option<&ProviderQuota> {
        self.providers.iter().find(|q| q.name == provider)
    }

    pub fn validate(&self) -> CoordinationResult<()> {
        if self.batch.max_concurrency == 0 {
            return Err(CoordinationError::Config(
                "batch.max_concurrency must be > 0".to_string(),
            ));
        }
        if self.batch.followup_concurrency == 0 {
            return Err(CoordinationError::Config(
                "batch.followup_concurrency must be > 0".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for quota in &self.providers {
            if !seen.insert(quota.name.as_str()) {
                return Err(CoordinationError::Config(format!(
                    "duplicate provider quota: {}",
                    quota.name
                )));
            }
            quota.budget()?;
        }
        Ok(())
    }
}
