use crate::config::settings::{ConsumerConfig, FerryConfig, RetryConfig};
use crate::domain::model::{Car, Cargo, Ferry, FerryId, FerryState, WriteOutcome};
use crate::utils::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Ferry and cargo tables. Every mutation is a single conditional write;
/// a failed precondition comes back as `WriteOutcome::ConditionFailed`.
#[async_trait]
pub trait FerryStore: Send + Sync {
    /// Cargo record holding `link`, if the car was already loaded.
    async fn cargo_for_car(&self, link: &str) -> Result<Option<Cargo>>;

    /// LOADING ferries whose size is at most `max_size_before_load`.
    async fn open_ferries(&self, max_size_before_load: u64) -> Result<Vec<Ferry>>;

    async fn get_ferry(&self, id: &FerryId) -> Result<Option<Ferry>>;

    /// Insert a new ferry, conditioned on the id not existing.
    async fn create_ferry(&self, ferry: &Ferry) -> Result<WriteOutcome>;

    /// Write the cargo record and add its size to the ferry atomically,
    /// conditioned on the ferry being LOADING with size `expected_size` and
    /// on the car not being loaded yet.
    async fn load_cargo(
        &self,
        cargo: &Cargo,
        expected_size: u64,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome>;

    /// Move a ferry from `from` to `to`, conditioned on it still being in `from`.
    async fn transition(
        &self,
        id: &FerryId,
        from: FerryState,
        to: FerryState,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome>;
}

/// Append-only car table fed by the producer.
#[async_trait]
pub trait CarLedger: Send + Sync {
    async fn put_cars(&self, cars: &[Car]) -> Result<()>;
    async fn get_car(&self, link: &str) -> Result<Option<Car>>;
}

/// Downstream deal service. Must tolerate repeated signals for the same ferry.
#[async_trait]
pub trait DealDispatcher: Send + Sync {
    async fn ferry_ready(&self, ferry_id: &FerryId) -> Result<()>;
}

pub trait ConfigProvider: Send + Sync {
    fn ferry(&self) -> &FerryConfig;
    fn car_stream(&self) -> &ConsumerConfig;
    fn ferry_stream(&self) -> &ConsumerConfig;
    fn conflict_retry(&self) -> &RetryConfig;

    fn min_cargo_size(&self) -> u64 {
        self.ferry().min_cargo_size
    }

    fn max_cargo_size(&self) -> u64 {
        self.ferry().max_cargo_size
    }
}
