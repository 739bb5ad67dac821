use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::ExtractionStrategy;
use crate::script::ScriptLimits;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// SQLite database file. Defaults to `~/.intake/data/intake.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub scripts: ScriptConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: None,
            orchestrator: OrchestratorConfig::default(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            extraction: ExtractionConfig::default(),
            scripts: ScriptConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Capacity of the job event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_event_capacity() -> usize {
    256
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            event_capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Hard limit for a single OCR page or LLM call.
    #[serde(default = "default_provider_secs")]
    pub provider_secs: u64,
}

fn default_provider_secs() -> u64 {
    120
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            provider_secs: default_provider_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn provider(&self) -> Duration {
        Duration::from_secs(self.provider_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_max_reextract_attempts")]
    pub max_reextract_attempts: u32,
    /// Planned input tokens used for the estimate made before OCR.
    #[serde(default = "default_input_token_budget")]
    pub default_input_token_budget: u64,
    #[serde(default = "default_output_token_budget")]
    pub default_output_token_budget: u64,
    #[serde(default)]
    pub strategy: ExtractionStrategy,
}

fn default_max_reextract_attempts() -> u32 {
    3
}

fn default_input_token_budget() -> u64 {
    4_000
}

fn default_output_token_budget() -> u64 {
    2_000
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_reextract_attempts: default_max_reextract_attempts(),
            default_input_token_budget: default_input_token_budget(),
            default_output_token_budget: default_output_token_budget(),
            strategy: ExtractionStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    #[serde(default = "default_script_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "default_max_rows")]
    pub max_rows_per_manifest: usize,
}

fn default_script_timeout_ms() -> u64 {
    5_000
}

fn default_max_operations() -> u64 {
    1_000_000
}

fn default_max_rows() -> usize {
    5_000
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_script_timeout_ms(),
            max_operations: default_max_operations(),
            max_rows_per_manifest: default_max_rows(),
        }
    }
}

impl ScriptConfig {
    pub fn limits(&self) -> ScriptLimits {
        ScriptLimits {
            timeout: Duration::from_millis(self.timeout_ms),
            max_operations: self.max_operations,
            max_rows: self.max_rows_per_manifest,
            ..ScriptLimits::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
