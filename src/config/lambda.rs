use crate::config::settings::{ConsumerConfig, FerryConfig, RetryConfig, Settings};
use crate::core::ConfigProvider;
use crate::utils::error::{FerryError, Result};
use crate::utils::validation::{
    validate_non_empty_string, validate_required_field, validate_url, Validate,
};
use std::fmt;
use std::str::FromStr;

/// Which stream consumer a Lambda deployment hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    /// Car table stream -> cargo assignment.
    AddCarsToFerry,
    /// Ferry table stream -> readiness.
    SetFerryAsReady,
}

impl ConsumerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsumerKind::AddCarsToFerry => "add-cars-to-ferry",
            ConsumerKind::SetFerryAsReady => "set-ferry-as-ready",
        }
    }
}

impl fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsumerKind {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add-cars-to-ferry" => Ok(ConsumerKind::AddCarsToFerry),
            "set-ferry-as-ready" => Ok(ConsumerKind::SetFerryAsReady),
            other => Err(FerryError::InvalidConfigValueError {
                field: "FERRY_CONSUMER".to_string(),
                value: other.to_string(),
                reason: "Expected add-cars-to-ferry or set-ferry-as-ready".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LambdaConfig {
    pub consumer: ConsumerKind,
    pub ferry_table: String,
    /// Only the car consumer writes cargo.
    pub cargo_table: Option<String>,
    pub region: String,
    pub dynamo_endpoint: Option<String>,
    pub spade_endpoint: Option<String>,
    pub settings: Settings,
}

impl LambdaConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| FerryError::MissingConfigError {
                    field: name.to_string(),
                })
        };
        let number = |name: &str| -> Result<Option<u64>> {
            lookup(name)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|e| FerryError::InvalidConfigValueError {
                            field: name.to_string(),
                            value: raw.clone(),
                            reason: format!("not an unsigned integer: {}", e),
                        })
                })
                .transpose()
        };

        let consumer: ConsumerKind = required("FERRY_CONSUMER")?.parse()?;
        let ferry_table = required("FERRY_TABLE_NAME")?;
        let cargo_table = match consumer {
            ConsumerKind::AddCarsToFerry => Some(required("CARGO_TABLE_NAME")?),
            ConsumerKind::SetFerryAsReady => lookup("CARGO_TABLE_NAME"),
        };

        let mut ferry = FerryConfig::default();
        if let Some(max) = number("FERRY_CARGO_MAX_SIZE")? {
            ferry.max_cargo_size = max;
            ferry.min_cargo_size = max / 4 * 3;
        }
        if let Some(min) = number("FERRY_CARGO_MIN_SIZE")? {
            ferry.min_cargo_size = min;
        }

        let mut conflict_retry = RetryConfig::default();
        if let Some(attempts) = number("CONFLICT_RETRY_ATTEMPTS")? {
            conflict_retry.max_attempts = attempts as usize;
        }

        Ok(Self {
            consumer,
            ferry_table,
            cargo_table,
            region: lookup("AWS_REGION").unwrap_or_else(|| "us-west-2".to_string()),
            dynamo_endpoint: lookup("DYNAMO_ENDPOINT"),
            spade_endpoint: lookup("SPADE_ENDPOINT"),
            settings: Settings {
                ferry,
                conflict_retry,
                ..Settings::default()
            },
        })
    }
}

impl ConfigProvider for LambdaConfig {
    fn ferry(&self) -> &FerryConfig {
        &self.settings.ferry
    }

    fn car_stream(&self) -> &ConsumerConfig {
        &self.settings.car_stream
    }

    fn ferry_stream(&self) -> &ConsumerConfig {
        &self.settings.ferry_stream
    }

    fn conflict_retry(&self) -> &RetryConfig {
        &self.settings.conflict_retry
    }
}

impl Validate for LambdaConfig {
    fn validate(&self) -> Result<()> {
        validate_non_empty_string("FERRY_TABLE_NAME", &self.ferry_table)?;
        if self.consumer == ConsumerKind::AddCarsToFerry {
            let cargo_table = validate_required_field("CARGO_TABLE_NAME", &self.cargo_table)?;
            validate_non_empty_string("CARGO_TABLE_NAME", cargo_table)?;
        } else if let Some(cargo_table) = &self.cargo_table {
            validate_non_empty_string("CARGO_TABLE_NAME", cargo_table)?;
        }
        validate_non_empty_string("AWS_REGION", &self.region)?;
        if let Some(endpoint) = &self.dynamo_endpoint {
            validate_url("DYNAMO_ENDPOINT", endpoint)?;
        }
        if let Some(endpoint) = &self.spade_endpoint {
            validate_url("SPADE_ENDPOINT", endpoint)?;
        }
        self.settings.validate()?;

        tracing::info!("✅ Lambda configuration validation passed");
        Ok(())
    }
}
