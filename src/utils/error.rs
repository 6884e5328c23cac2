use thiserror::Error;

#[derive(Error, Debug)]
pub enum FerryError {
    #[error("Car {link} could not be loaded after {attempts} attempts")]
    RetryExhausted { link: String, attempts: usize },

    #[error("Car {link} of size {size} exceeds the maximum ferry size {max_cargo_size}")]
    OversizedCar {
        link: String,
        size: u64,
        max_cargo_size: u64,
    },

    #[error("Ferry invariant violated: {message}")]
    InvariantViolation { message: String },

    #[error("Store error: {message}")]
    StoreError { message: String },

    #[error("Deal dispatch failed: {message}")]
    DispatchError { message: String },

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Malformed stream record: {message}")]
    StreamRecordError { message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration validation failed for {field}: {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for {field}: {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Concurrency,
    Storage,
    Dispatch,
    Data,
    Configuration,
    Invariant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl FerryError {
    pub fn store(message: impl Into<String>) -> Self {
        FerryError::StoreError {
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        FerryError::InvariantViolation {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            FerryError::RetryExhausted { .. } => ErrorCategory::Concurrency,
            FerryError::StoreError { .. } => ErrorCategory::Storage,
            FerryError::DispatchError { .. } | FerryError::HttpError(_) => ErrorCategory::Dispatch,
            FerryError::OversizedCar { .. }
            | FerryError::StreamRecordError { .. }
            | FerryError::SerializationError(_)
            | FerryError::CsvError(_) => ErrorCategory::Data,
            FerryError::ConfigError { .. }
            | FerryError::ConfigValidationError { .. }
            | FerryError::InvalidConfigValueError { .. }
            | FerryError::MissingConfigError { .. } => ErrorCategory::Configuration,
            FerryError::InvariantViolation { .. } => ErrorCategory::Invariant,
            FerryError::IoError(_) => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Concurrency | ErrorCategory::Dispatch => ErrorSeverity::Medium,
            ErrorCategory::Storage | ErrorCategory::Data | ErrorCategory::Configuration => {
                ErrorSeverity::High
            }
            ErrorCategory::Invariant | ErrorCategory::System => ErrorSeverity::Critical,
        }
    }

    /// Whether the failure belongs to a single stream record rather than the
    /// whole invocation. Item-scoped failures are reported back so only that
    /// record is redelivered; the rest abort the invocation.
    pub fn is_item_scoped(&self) -> bool {
        matches!(
            self,
            FerryError::RetryExhausted { .. }
                | FerryError::OversizedCar { .. }
                | FerryError::DispatchError { .. }
                | FerryError::HttpError(_)
                | FerryError::StreamRecordError { .. }
        )
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            FerryError::RetryExhausted { .. } => {
                "Contention on open ferries is high; the record will be redelivered. Consider raising conflict_retry.max_attempts"
            }
            FerryError::OversizedCar { .. } => {
                "The car cannot fit in any ferry; raise max_cargo_size or split the car upstream"
            }
            FerryError::InvariantViolation { .. } => {
                "Stop the consumers and inspect the ferry table; a writer bypassed the conditional write contract"
            }
            FerryError::StoreError { .. } => {
                "Check the backing store availability and permissions; the batch will be redelivered"
            }
            FerryError::DispatchError { .. } | FerryError::HttpError(_) => {
                "Check the deal dispatcher endpoint; the ready signal is retried on redelivery"
            }
            FerryError::StreamRecordError { .. } => {
                "Verify the stream view type and the table item shape"
            }
            FerryError::IoError(_) => "Check that the file exists and is readable",
            FerryError::SerializationError(_) | FerryError::CsvError(_) => {
                "Check the manifest format: CSV with a link,size,commP,url,md5 header or JSON lines"
            }
            FerryError::ConfigError { .. }
            | FerryError::ConfigValidationError { .. }
            | FerryError::InvalidConfigValueError { .. }
            | FerryError::MissingConfigError { .. } => {
                "Review the configuration file, flags and environment variables"
            }
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Configuration => format!("設定錯誤: {}", self),
            ErrorCategory::Data => format!("資料錯誤: {}", self),
            ErrorCategory::Storage => format!("儲存錯誤: {}", self),
            ErrorCategory::Dispatch => format!("派送錯誤: {}", self),
            ErrorCategory::Concurrency => format!("併發衝突: {}", self),
            ErrorCategory::Invariant => format!("嚴重錯誤: {}", self),
            ErrorCategory::System => format!("系統錯誤: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, FerryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_scoped_errors() {
        let exhausted = FerryError::RetryExhausted {
            link: "bagy".to_string(),
            attempts: 3,
        };
        assert!(exhausted.is_item_scoped());
        assert_eq!(exhausted.severity(), ErrorSeverity::Medium);

        let store = FerryError::store("throttled");
        assert!(!store.is_item_scoped());
        assert_eq!(store.category(), ErrorCategory::Storage);
    }

    #[test]
    fn test_invariant_violation_is_critical() {
        let err = FerryError::invariant("ferry f1 has size 4000 above 3200");
        assert!(!err.is_item_scoped());
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert!(err.user_friendly_message().contains("4000"));
    }
}
