use crate::approval::ApprovalConfig;
use crate::environment::{self, EnvironmentConfig, EnvironmentError, ResolvedEnvironment};
use crate::github::models::{MergeMethod, UnknownMergeMethodError};
use config::{Config, ConfigError, Environment, File};
use serde_derive::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const MIN_POLL_INTERVAL_SECS: u64 = 5;

#[derive(Deserialize, Debug)]
pub struct PilotConfig {
    pub github: GithubConfig,

    /// Legacy single-valued environment; a named environment selected via
    /// `active_environment` wins over it.
    #[serde(default)]
    pub environment: Option<String>,

    #[serde(default)]
    pub active_environment: Option<String>,

    #[serde(default)]
    pub environments: HashMap<String, EnvironmentConfig>,

    #[serde(default)]
    pub merge: MergeSettings,

    #[serde(default)]
    pub ci: CiSettings,

    #[serde(default)]
    pub issues: IssueSettings,

    #[serde(default)]
    pub approval: ApprovalConfig,

    #[serde(default)]
    pub retention: RetentionSettings,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub store: StoreSettings,
}

#[derive(Deserialize, Debug)]
pub struct GithubConfig {
    pub username: String,
    pub token: String,
    pub owner: String,
    pub repo: String,
}

#[derive(Deserialize, Debug)]
pub struct MergeSettings {
    #[serde(default)]
    pub method: String,

    #[serde(default)]
    pub auto_review: bool,

    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Deserialize, Debug)]
pub struct CiSettings {
    #[serde(default)]
    pub required_checks: Vec<String>,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Deserialize, Debug, Default)]
pub struct IssueSettings {
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Deserialize, Debug)]
pub struct RetentionSettings {
    #[serde(default = "default_failures_days")]
    pub failures_days: i64,

    #[serde(default = "default_processed_days")]
    pub processed_days: i64,

    #[serde(default = "default_metrics_days")]
    pub metrics_days: i64,

    #[serde(default = "default_terminal_pr_days")]
    pub terminal_pr_days: i64,
}

#[derive(Deserialize, Debug)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_breaker_threshold")]
    pub errors_per_minute: f64,

    #[serde(default = "default_breaker_pause_secs")]
    pub pause_secs: u64,
}

#[derive(Deserialize, Debug)]
pub struct StoreSettings {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl PilotConfig {
    pub fn new(config_file_path: &str) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        let config_file_path = shellexpand::tilde(config_file_path);
        config.merge(File::with_name(&config_file_path).required(false))?;
        config.merge(Environment::with_prefix("pilot").separator("_"))?;
        config.try_into()
    }

    /// Selects a named environment for subsequent resolution. Unknown names
    /// fail instead of silently running with the wrong policy.
    pub fn set_active_environment(&mut self, name: &str) -> Result<(), EnvironmentError> {
        environment::resolve(self.environment.as_deref(), Some(name), &self.environments)?;
        self.active_environment = Some(name.into());
        Ok(())
    }

    pub fn resolved_environment(&self) -> Result<ResolvedEnvironment, EnvironmentError> {
        environment::resolve(
            self.environment.as_deref(),
            self.active_environment.as_deref(),
            &self.environments,
        )
    }

    pub fn merge_method(&self) -> Result<MergeMethod, UnknownMergeMethodError> {
        MergeMethod::parse(&self.merge.method)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.merge.approval_timeout_secs)
    }

    /// Bounded from below so many parallel PRs cannot hammer the host.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.ci.poll_interval_secs.max(MIN_POLL_INTERVAL_SECS))
    }

    pub fn circuit_breaker_pause(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker.pause_secs)
    }
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            method: String::new(),
            auto_review: false,
            approval_timeout_secs: default_approval_timeout_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for CiSettings {
    fn default() -> Self {
        Self {
            required_checks: Vec::new(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            failures_days: default_failures_days(),
            processed_days: default_processed_days(),
            metrics_days: default_metrics_days(),
            terminal_pr_days: default_terminal_pr_days(),
        }
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            errors_per_minute: default_breaker_threshold(),
            pause_secs: default_breaker_pause_secs(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_approval_timeout_secs() -> u64 {
    3600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_failures_days() -> i64 {
    7
}

fn default_processed_days() -> i64 {
    30
}

fn default_metrics_days() -> i64 {
    7
}

fn default_terminal_pr_days() -> i64 {
    7
}

fn default_breaker_threshold() -> f64 {
    10.0
}

fn default_breaker_pause_secs() -> u64 {
    300
}

fn default_store_path() -> String {
    "~/.pilot/autopilot.db".into()
}
