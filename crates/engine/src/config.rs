//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::graph::GraphDefaults;
use crate::retry::RetryPolicy;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Dispatcher configuration
    pub dispatcher: DispatcherConfig,

    /// Variable resolver configuration
    pub resolver: ResolverConfig,

    /// Suite runner and flake probe configuration
    pub suite: SuiteConfig,

    /// Selector healing configuration
    pub healing: HealingConfig,

    /// Automation driver configuration
    pub driver: DriverConfig,

    /// Callback delivery configuration
    pub callback: CallbackConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_path: specwright_common::default_store_path(),
            dispatcher: DispatcherConfig::default(),
            resolver: ResolverConfig::default(),
            suite: SuiteConfig::default(),
            healing: HealingConfig::default(),
            driver: DriverConfig::default(),
            callback: CallbackConfig::default(),
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Concurrently running tasks per dispatch
    pub max_workers: usize,

    /// Overall run timeout; 0 disables it
    pub run_timeout_s: u64,

    /// How long in-flight tasks may keep running after cancellation
    pub cancel_grace_s: u64,

    /// Timeout for tasks whose plan and tool declare none
    pub default_task_timeout_s: u64,

    /// Retry policy for tasks that declare none
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            run_timeout_s: 3600,
            cancel_grace_s: 10,
            default_task_timeout_s: 60,
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_s)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_s > 0).then(|| Duration::from_secs(self.run_timeout_s))
    }

    pub fn graph_defaults(&self) -> GraphDefaults {
        GraphDefaults {
            task_timeout: Duration::from_secs(self.default_task_timeout_s),
            retry: self.retry.clone(),
        }
    }
}

/// Variable resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Share of required variables that must be bound for a first-pass resolve
    pub coverage_threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            coverage_threshold: 0.8,
        }
    }
}

/// Suite runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    /// Reruns granted to a failing test before it counts as failed
    pub max_reruns: u32,

    /// Timeout for tests that declare none
    pub default_test_timeout_s: u64,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            max_reruns: 2,
            default_test_timeout_s: 120,
        }
    }
}

impl SuiteConfig {
    pub fn default_test_timeout(&self) -> Duration {
        Duration::from_secs(self.default_test_timeout_s)
    }
}

/// Selector healing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    /// Candidates validated per broken selector
    pub max_candidates: usize,

    /// Heal and re-execute rounds per run
    pub max_heal_rounds: u32,

    /// Heuristic candidates below this confidence are not proposed
    pub min_confidence: f64,

    /// Half-life of learned selector weight
    pub recency_half_life_days: f64,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_candidates: 3,
            max_heal_rounds: 2,
            min_confidence: 0.2,
            recency_half_life_days: 14.0,
        }
    }
}

/// Automation driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Base URL relative navigation is resolved against
    pub base_url: String,

    /// chromium, firefox or webkit
    pub browser: String,

    pub headless: bool,

    /// Evidence directory; defaults to `<store>/evidence`
    pub evidence_dir: Option<PathBuf>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            browser: "chromium".to_string(),
            headless: true,
            evidence_dir: None,
        }
    }
}

/// Callback delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub timeout_s: u64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self { timeout_s: 10 }
    }
}

impl EngineConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> specwright_common::Result<()> {
        let invalid = |msg: &str| Err(specwright_common::Error::InvalidConfig(msg.to_string()));

        if self.dispatcher.max_workers == 0 {
            return invalid("dispatcher.max_workers must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.resolver.coverage_threshold) {
            return invalid("resolver.coverage_threshold must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.healing.min_confidence) {
            return invalid("healing.min_confidence must be within [0, 1]");
        }
        if !(self.healing.recency_half_life_days > 0.0) {
            return invalid("healing.recency_half_life_days must be positive");
        }
        if let Some(run) = self.dispatcher.run_timeout() {
            if Duration::from_secs(self.dispatcher.default_task_timeout_s) >= run {
                return invalid("dispatcher.default_task_timeout_s must be below run_timeout_s");
            }
        }
        Ok(())
    }

    /// Learning store database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("learning.db")
    }

    /// Evidence directory
    pub fn evidence_dir(&self) -> PathBuf {
        self.driver
            .evidence_dir
            .clone()
            .unwrap_or_else(|| self.store_path.join("evidence"))
    }

    /// Report output directory
    pub fn reports_dir(&self) -> PathBuf {
        self.store_path.join("reports")
    }
}
