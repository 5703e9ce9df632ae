use std::path::PathBuf;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::engine::EngineConfig;
use crate::grid::{GridResult, StrategyRecord};
use crate::strategy::GRID_KIND;

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Engine timing, queue and reconnect settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Durable state location
    #[serde(default)]
    pub store: StoreConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Simulated venue driving the strategies
    #[serde(default)]
    pub paper: PaperConfig,
    /// Strategies to run
    #[serde(default)]
    pub strategies: Vec<StrategyEntry>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StoreConfig {
    /// JSON snapshot file; state is memory-only when unset
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct PaperConfig {
    /// Venue name strategies refer to
    #[serde(default = "default_paper_venue")]
    pub venue: String,
    #[serde(default = "default_starting_balance")]
    pub starting_balance: f64,
    /// Mark price the walk oscillates around
    #[serde(default = "default_initial_price")]
    pub initial_price: f64,
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
    #[serde(default = "default_step_interval_ms")]
    pub step_interval_ms: u64,
    /// Steps per full swing
    #[serde(default = "default_period_steps")]
    pub period_steps: u64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            venue: default_paper_venue(),
            starting_balance: default_starting_balance(),
            initial_price: default_initial_price(),
            amplitude: default_amplitude(),
            step_interval_ms: default_step_interval_ms(),
            period_steps: default_period_steps(),
        }
    }
}

fn default_paper_venue() -> String {
    "paper".to_string()
}

fn default_starting_balance() -> f64 {
    100_000.0
}

fn default_initial_price() -> f64 {
    100.0
}

fn default_amplitude() -> f64 {
    10.0
}

fn default_step_interval_ms() -> u64 {
    1000
}

fn default_period_steps() -> u64 {
    60
}

/// One configured strategy: its kind plus the record fields inline
#[derive(Debug, Deserialize)]
pub struct StrategyEntry {
    #[serde(default = "default_strategy_kind")]
    pub kind: String,
    #[serde(flatten)]
    pub record: StrategyRecord,
}

fn default_strategy_kind() -> String {
    GRID_KIND.to_string()
}

impl Settings {
    /// Load settings from a configuration file.
    ///
    /// Environment variables override the file, e.g.
    /// `APP_ENGINE__RETRY_DELAY_SECS=30`.
    pub fn new(config_path: &str) -> GridResult<Self> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(s.try_deserialize()?)
    }
}
