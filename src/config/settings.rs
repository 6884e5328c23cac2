use crate::core::ConfigProvider;
use crate::domain::model::Ferry;
use crate::utils::error::{FerryError, Result};
use crate::utils::validation::{validate_positive_number, validate_range, Validate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;
use std::time::Duration;

/// Unpadded payload capacity of a 32 GiB sector.
pub const DEFAULT_MAX_CARGO_SIZE: u64 = 34_091_302_912;
pub const DEFAULT_MIN_CARGO_SIZE: u64 = DEFAULT_MAX_CARGO_SIZE / 4 * 3;

/// Which open ferry receives a car when several have room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Keeps filling the ferry touched last, so few ferries stay open.
    #[default]
    MostRecentlyUpdated,
    FullestFirst,
    OldestFirst,
}

impl SelectionPolicy {
    pub fn pick<'a>(&self, candidates: &'a [Ferry]) -> Option<&'a Ferry> {
        // ties fall back to the larger ferry, then the id, to stay deterministic
        let by_size_then_id =
            |a: &Ferry, b: &Ferry| a.size.cmp(&b.size).then_with(|| b.id.cmp(&a.id));
        match self {
            SelectionPolicy::MostRecentlyUpdated => candidates.iter().max_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then_with(|| by_size_then_id(a, b))
            }),
            SelectionPolicy::FullestFirst => candidates.iter().max_by(|a, b| {
                by_size_then_id(a, b).then_with(|| a.updated_at.cmp(&b.updated_at))
            }),
            SelectionPolicy::OldestFirst => candidates.iter().max_by(|a, b| {
                match b.inserted_at.cmp(&a.inserted_at) {
                    Ordering::Equal => by_size_then_id(a, b),
                    other => other,
                }
            }),
        }
    }
}

impl FromStr for SelectionPolicy {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "most_recently_updated" => Ok(SelectionPolicy::MostRecentlyUpdated),
            "fullest_first" => Ok(SelectionPolicy::FullestFirst),
            "oldest_first" => Ok(SelectionPolicy::OldestFirst),
            other => Err(FerryError::InvalidConfigValueError {
                field: "ferry.selection_policy".to_string(),
                value: other.to_string(),
                reason: "Expected most_recently_updated, fullest_first or oldest_first"
                    .to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub min_cargo_size: u64,
    pub max_cargo_size: u64,
    pub selection_policy: SelectionPolicy,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            min_cargo_size: DEFAULT_MIN_CARGO_SIZE,
            max_cargo_size: DEFAULT_MAX_CARGO_SIZE,
            selection_policy: SelectionPolicy::default(),
        }
    }
}

impl FerryConfig {
    pub fn new(min_cargo_size: u64, max_cargo_size: u64) -> Self {
        Self {
            min_cargo_size,
            max_cargo_size,
            selection_policy: SelectionPolicy::default(),
        }
    }
}

/// Tuning for one change-stream consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub max_batching_window_ms: u64,
    /// Concurrent invocations. Records with the same key always land on
    /// the same invocation lane.
    pub parallelism: usize,
    /// Deliveries of a single record before it is dead-lettered.
    pub max_record_attempts: u32,
    pub invocation_timeout_ms: u64,
}

impl ConsumerConfig {
    pub fn car_stream() -> Self {
        Self {
            batch_size: 50,
            max_batching_window_ms: 100,
            parallelism: 4,
            max_record_attempts: 10,
            invocation_timeout_ms: 3 * 60 * 1000,
        }
    }

    pub fn ferry_stream() -> Self {
        Self {
            batch_size: 1,
            max_batching_window_ms: 0,
            parallelism: 2,
            max_record_attempts: 10,
            invocation_timeout_ms: 15 * 60 * 1000,
        }
    }

    pub fn batching_window(&self) -> Duration {
        Duration::from_millis(self.max_batching_window_ms)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    fn validate_named(&self, name: &str) -> Result<()> {
        validate_range(&format!("{}.batch_size", name), self.batch_size, 1, 10_000)?;
        validate_range(&format!("{}.parallelism", name), self.parallelism, 1, 64)?;
        validate_range(
            &format!("{}.max_batching_window_ms", name),
            self.max_batching_window_ms,
            0,
            300_000,
        )?;
        validate_positive_number(
            &format!("{}.max_record_attempts", name),
            self.max_record_attempts as u64,
            1,
        )?;
        validate_positive_number(
            &format!("{}.invocation_timeout_ms", name),
            self.invocation_timeout_ms,
            1,
        )
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::car_stream()
    }
}

/// Backoff for conditional-write conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 10,
            max_delay_ms: 500,
            jitter_pct: 0.25,
        }
    }
}

impl Validate for RetryConfig {
    fn validate(&self) -> Result<()> {
        validate_positive_number("conflict_retry.max_attempts", self.max_attempts as u64, 1)?;
        validate_range("conflict_retry.jitter_pct", self.jitter_pct, 0.0, 1.0)?;
        if self.max_delay_ms < self.base_delay_ms {
            return Err(FerryError::ConfigValidationError {
                field: "conflict_retry.max_delay_ms".to_string(),
                message: "max_delay_ms must not be below base_delay_ms".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ferry: FerryConfig,
    pub car_stream: ConsumerConfig,
    pub ferry_stream: ConsumerConfig,
    pub conflict_retry: RetryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ferry: FerryConfig::default(),
            car_stream: ConsumerConfig::car_stream(),
            ferry_stream: ConsumerConfig::ferry_stream(),
            conflict_retry: RetryConfig::default(),
        }
    }
}

impl Settings {
    pub fn with_ferry(ferry: FerryConfig) -> Self {
        Self {
            ferry,
            ..Self::default()
        }
    }
}

impl Validate for FerryConfig {
    fn validate(&self) -> Result<()> {
        validate_positive_number("ferry.min_cargo_size", self.min_cargo_size, 1)?;
        if self.min_cargo_size > self.max_cargo_size {
            return Err(FerryError::ConfigValidationError {
                field: "ferry.min_cargo_size".to_string(),
                message: format!(
                    "min_cargo_size {} is above max_cargo_size {}",
                    self.min_cargo_size, self.max_cargo_size
                ),
            });
        }
        Ok(())
    }
}

impl Validate for Settings {
    fn validate(&self) -> Result<()> {
        self.ferry.validate()?;
        self.car_stream.validate_named("car_stream")?;
        self.ferry_stream.validate_named("ferry_stream")?;
        self.conflict_retry.validate()
    }
}

impl ConfigProvider for Settings {
    fn ferry(&self) -> &FerryConfig {
        &self.ferry
    }

    fn car_stream(&self) -> &ConsumerConfig {
        &self.car_stream
    }

    fn ferry_stream(&self) -> &ConsumerConfig {
        &self.ferry_stream
    }

    fn conflict_retry(&self) -> &RetryConfig {
        &self.conflict_retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::FerryId;
    use chrono::{Duration as ChronoDuration, Utc};

    fn ferry(id: &str, size: u64, age_secs: i64, idle_secs: i64) -> Ferry {
        let now = Utc::now();
        Ferry {
            id: FerryId::new(id),
            state: crate::domain::model::FerryState::Loading,
            size,
            inserted_at: now - ChronoDuration::seconds(age_secs),
            updated_at: now - ChronoDuration::seconds(idle_secs),
        }
    }

    #[test]
    fn test_default_settings_are_valid() {
        assert!(Settings::default().validate().is_ok());
        assert!(DEFAULT_MIN_CARGO_SIZE < DEFAULT_MAX_CARGO_SIZE);
    }

    #[test]
    fn test_min_above_max_is_rejected() {
        let settings = Settings::with_ferry(FerryConfig::new(4000, 3200));
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_selection_policies() {
        let candidates = vec![
            ferry("old-small", 100, 300, 5),
            ferry("young-recent", 200, 10, 1),
            ferry("mid-full", 900, 100, 60),
        ];

        let pick = |policy: SelectionPolicy| policy.pick(&candidates).unwrap().id.clone();
        assert_eq!(pick(SelectionPolicy::MostRecentlyUpdated).as_str(), "young-recent");
        assert_eq!(pick(SelectionPolicy::FullestFirst).as_str(), "mid-full");
        assert_eq!(pick(SelectionPolicy::OldestFirst).as_str(), "old-small");
        assert!(SelectionPolicy::default().pick(&[]).is_none());
    }

    #[test]
    fn test_selection_policy_from_str() {
        assert_eq!(
            "fullest_first".parse::<SelectionPolicy>().unwrap(),
            SelectionPolicy::FullestFirst
        );
        assert!("random".parse::<SelectionPolicy>().is_err());
    }
}
