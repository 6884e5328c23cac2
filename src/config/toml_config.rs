use crate::config::settings::{ConsumerConfig, FerryConfig, RetryConfig, SelectionPolicy, Settings};
use crate::core::ConfigProvider;
use crate::utils::error::{FerryError, Result};
use crate::utils::validation::{
    validate_non_empty_string, validate_positive_number, validate_url, Validate,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File form of the settings. Every tuning key is optional; missing keys
/// keep the per-consumer defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub service: Option<ServiceConfig>,
    #[serde(default)]
    pub ferry: FerrySection,
    #[serde(default)]
    pub car_stream: ConsumerSection,
    #[serde(default)]
    pub ferry_stream: ConsumerSection,
    #[serde(default)]
    pub conflict_retry: Option<RetryConfig>,
    pub dispatcher: Option<DispatcherConfig>,
    pub monitoring: Option<MonitoringConfig>,
    #[serde(skip)]
    resolved: Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FerrySection {
    pub min_cargo_size: Option<u64>,
    pub max_cargo_size: Option<u64>,
    pub selection_policy: Option<SelectionPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerSection {
    pub batch_size: Option<usize>,
    pub max_batching_window_ms: Option<u64>,
    pub parallelism: Option<usize>,
    pub max_record_attempts: Option<u32>,
    pub invocation_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub endpoint: String,
    /// Notify attempts per ferry; the backoff delays follow `conflict_retry`.
    pub max_attempts: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enabled: bool,
}

impl FerrySection {
    /// A lone `max_cargo_size` moves the default minimum along with it.
    fn apply(&self, mut base: FerryConfig) -> FerryConfig {
        if let Some(max) = self.max_cargo_size {
            base.max_cargo_size = max;
            base.min_cargo_size = max / 4 * 3;
        }
        if let Some(min) = self.min_cargo_size {
            base.min_cargo_size = min;
        }
        if let Some(policy) = self.selection_policy {
            base.selection_policy = policy;
        }
        base
    }
}

impl ConsumerSection {
    fn apply(&self, base: ConsumerConfig) -> ConsumerConfig {
        ConsumerConfig {
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            max_batching_window_ms: self
                .max_batching_window_ms
                .unwrap_or(base.max_batching_window_ms),
            parallelism: self.parallelism.unwrap_or(base.parallelism),
            max_record_attempts: self.max_record_attempts.unwrap_or(base.max_record_attempts),
            invocation_timeout_ms: self.invocation_timeout_ms.unwrap_or(base.invocation_timeout_ms),
        }
    }
}

impl TomlConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(FerryError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        let mut config: TomlConfig =
            toml::from_str(&processed_content).map_err(|e| FerryError::ConfigValidationError {
                field: "toml_parsing".to_string(),
                message: format!("TOML parsing error: {}", e),
            })?;
        config.resolved = config.build_settings();
        Ok(config)
    }

    /// 替換環境變數 (例如 ${SPADE_ENDPOINT})
    fn substitute_env_vars(content: &str) -> Result<String> {
        use regex::Regex;
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| FerryError::ConfigError {
            message: format!("invalid substitution pattern: {}", e),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    fn build_settings(&self) -> Settings {
        Settings {
            ferry: self.ferry.apply(FerryConfig::default()),
            car_stream: self.car_stream.apply(ConsumerConfig::car_stream()),
            ferry_stream: self.ferry_stream.apply(ConsumerConfig::ferry_stream()),
            conflict_retry: self.conflict_retry.clone().unwrap_or_default(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.resolved
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service.as_ref().map(|s| s.name.as_str())
    }

    /// 取得派送端點
    pub fn dispatcher_endpoint(&self) -> Option<&str> {
        self.dispatcher.as_ref().map(|d| d.endpoint.as_str())
    }

    /// 派送重試設定: `dispatcher.max_attempts` 覆蓋 `conflict_retry` 的次數
    pub fn dispatcher_retry(&self) -> RetryConfig {
        let mut retry = self.resolved.conflict_retry.clone();
        if let Some(attempts) = self.dispatcher.as_ref().and_then(|d| d.max_attempts) {
            retry.max_attempts = attempts;
        }
        retry
    }

    /// 取得監控設定
    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.as_ref().map(|m| m.enabled).unwrap_or(false)
    }
}

impl ConfigProvider for TomlConfig {
    fn ferry(&self) -> &FerryConfig {
        &self.resolved.ferry
    }

    fn car_stream(&self) -> &ConsumerConfig {
        &self.resolved.car_stream
    }

    fn ferry_stream(&self) -> &ConsumerConfig {
        &self.resolved.ferry_stream
    }

    fn conflict_retry(&self) -> &RetryConfig {
        &self.resolved.conflict_retry
    }
}

impl Validate for TomlConfig {
    fn validate(&self) -> Result<()> {
        if let Some(service) = &self.service {
            validate_non_empty_string("service.name", &service.name)?;
        }

        if let Some(dispatcher) = &self.dispatcher {
            validate_url("dispatcher.endpoint", &dispatcher.endpoint)?;
            if let Some(attempts) = dispatcher.max_attempts {
                validate_positive_number("dispatcher.max_attempts", attempts as u64, 1)?;
            }
        }

        self.resolved.validate()
    }
}
