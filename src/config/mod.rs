pub mod cli;
pub mod lambda;
pub mod settings;
pub mod toml_config;

pub use settings::Settings;

#[cfg(feature = "cli")]
use crate::config::settings::RetryConfig;
#[cfg(feature = "cli")]
use crate::config::toml_config::TomlConfig;
#[cfg(feature = "cli")]
use crate::utils::error::Result;
#[cfg(feature = "cli")]
use clap::{Parser, ValueEnum};

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Parser)]
#[command(name = "ferry-loader")]
#[command(about = "Consolidate a car manifest into size-bounded ferries")]
pub struct CliConfig {
    /// Car manifest (.csv with a link,size,commP,url,md5 header, or .jsonl)
    pub manifest: String,

    #[arg(long, help = "TOML settings file; flags below override it")]
    pub config: Option<String>,

    #[arg(long)]
    pub min_cargo_size: Option<u64>,

    #[arg(long)]
    pub max_cargo_size: Option<u64>,

    #[arg(long, help = "most_recently_updated, fullest_first or oldest_first")]
    pub selection_policy: Option<String>,

    #[arg(long, help = "Car stream batch size")]
    pub batch_size: Option<usize>,

    #[arg(long, help = "Car stream batching window in milliseconds")]
    pub batching_window_ms: Option<u64>,

    #[arg(long, help = "Concurrent car stream invocations")]
    pub parallelism: Option<usize>,

    #[arg(long, default_value = "25", help = "Cars written per insert call")]
    pub insert_chunk: usize,

    #[arg(long, default_value = "300", help = "Seconds to wait for the consumers to drain")]
    pub wait_secs: u64,

    #[arg(long, help = "Deal service URL notified for every READY ferry")]
    pub dispatcher_endpoint: Option<String>,

    #[arg(long, value_enum, default_value = "table")]
    pub output: OutputFormat,

    #[arg(long, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, help = "Log process CPU and memory while loading")]
    pub monitor: bool,
}

#[cfg(feature = "cli")]
impl CliConfig {
    pub fn load_file(&self) -> Result<Option<TomlConfig>> {
        self.config.as_ref().map(TomlConfig::from_file).transpose()
    }

    /// File settings (or defaults) with the command-line overrides applied.
    pub fn resolve(&self, file: Option<&TomlConfig>) -> Result<Settings> {
        let mut settings = file.map(|f| f.settings().clone()).unwrap_or_default();

        if let Some(max) = self.max_cargo_size {
            settings.ferry.max_cargo_size = max;
            if self.min_cargo_size.is_none() {
                settings.ferry.min_cargo_size = max / 4 * 3;
            }
        }
        if let Some(min) = self.min_cargo_size {
            settings.ferry.min_cargo_size = min;
        }
        if let Some(policy) = &self.selection_policy {
            settings.ferry.selection_policy = policy.parse()?;
        }
        if let Some(batch_size) = self.batch_size {
            settings.car_stream.batch_size = batch_size;
        }
        if let Some(window) = self.batching_window_ms {
            settings.car_stream.max_batching_window_ms = window;
        }
        if let Some(parallelism) = self.parallelism {
            settings.car_stream.parallelism = parallelism;
        }

        Ok(settings)
    }

    pub fn dispatcher_endpoint<'a>(&'a self, file: Option<&'a TomlConfig>) -> Option<&'a str> {
        self.dispatcher_endpoint
            .as_deref()
            .or_else(|| file.and_then(|f| f.dispatcher_endpoint()))
    }

    /// Backoff for deal service notifications.
    pub fn dispatcher_retry(&self, file: Option<&TomlConfig>, settings: &Settings) -> RetryConfig {
        file.map(TomlConfig::dispatcher_retry)
            .unwrap_or_else(|| settings.conflict_retry.clone())
    }

    pub fn monitor_enabled(&self, file: Option<&TomlConfig>) -> bool {
        self.monitor || file.is_some_and(|f| f.monitoring_enabled())
    }
}

#[cfg(feature = "cli")]
impl crate::utils::validation::Validate for CliConfig {
    fn validate(&self) -> Result<()> {
        use crate::utils::validation::*;

        validate_manifest_path("manifest", &self.manifest)?;
        // batch-write limit of the car table
        validate_range("insert_chunk", self.insert_chunk, 1, 25)?;
        validate_positive_number("wait_secs", self.wait_secs, 1)?;
        if let Some(endpoint) = &self.dispatcher_endpoint {
            validate_url("dispatcher_endpoint", endpoint)?;
        }

        tracing::debug!("✅ CLI arguments validated");
        Ok(())
    }
}
