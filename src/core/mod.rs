pub mod cargo_assignment;
pub mod ferry_readiness;
pub mod lifecycle;
pub mod retry;
pub mod runtime;
pub mod stream;

pub use crate::domain::model::{Car, Cargo, Ferry, FerryId, FerryState, WriteOutcome};
pub use crate::domain::ports::{CarLedger, ConfigProvider, DealDispatcher, FerryStore};
pub use crate::utils::error::Result;
