pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::{CliConfig, OutputFormat};

#[cfg(feature = "lambda")]
pub use adapters::dynamo::DynamoFerryStore;

pub use adapters::memory::{MemoryStore, RecordingDispatcher};
pub use config::{lambda::LambdaConfig, toml_config::TomlConfig, Settings};
pub use core::{
    cargo_assignment::CargoAssigner, ferry_readiness::ReadinessChecker, lifecycle::FerryLifecycle,
    runtime::LocalRuntime,
};
pub use domain::model::{Car, Cargo, Ferry, FerryId, FerryState, WriteOutcome};
pub use utils::error::{FerryError, Result};
