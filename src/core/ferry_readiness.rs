//! Ferry readiness: watches ferry changes and flips a LOADING ferry to READY
//! once it carries at least `min_cargo_size`.
//!
//! The flip is a write conditioned on the ferry still being LOADING, so of
//! any number of concurrent or repeated notifications at most one moves it.
//! While a ferry is LOADING its size only grows, so a snapshot at or above
//! the threshold implies the stored ferry is too.

use crate::core::stream::{BatchOutcome, EventName, InvocationBudget, StreamHandler, StreamRecord};
use crate::domain::model::{Ferry, FerryId, FerryState, WriteOutcome};
use crate::domain::ports::{ConfigProvider, DealDispatcher, FerryStore};
use crate::utils::error::{FerryError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Snapshot not in LOADING; later-state notifications are no-ops.
    Ignored(FerryState),
    BelowThreshold { size: u64 },
    MarkedReady,
    /// Another invocation already moved the ferry on.
    AlreadyTransitioned(Option<FerryState>),
}

pub struct ReadinessChecker<S: FerryStore, D: DealDispatcher + ?Sized> {
    store: Arc<S>,
    dispatcher: Arc<D>,
    min_cargo_size: u64,
    max_cargo_size: u64,
}

impl<S: FerryStore, D: DealDispatcher + ?Sized> ReadinessChecker<S, D> {
    pub fn new(store: Arc<S>, dispatcher: Arc<D>, min_cargo_size: u64, max_cargo_size: u64) -> Self {
        Self {
            store,
            dispatcher,
            min_cargo_size,
            max_cargo_size,
        }
    }

    pub fn from_config<C: ConfigProvider>(store: Arc<S>, dispatcher: Arc<D>, config: &C) -> Self {
        Self::new(
            store,
            dispatcher,
            config.min_cargo_size(),
            config.max_cargo_size(),
        )
    }

    pub async fn check_readiness(&self, snapshot: &Ferry) -> Result<Readiness> {
        if snapshot.state != FerryState::Loading {
            return Ok(Readiness::Ignored(snapshot.state));
        }

        if snapshot.size > self.max_cargo_size {
            tracing::error!(
                "❌ Ferry {} observed with {} bytes, above the {} byte cap",
                snapshot.id,
                snapshot.size,
                self.max_cargo_size
            );
            return Err(FerryError::invariant(format!(
                "ferry {} has size {} above max_cargo_size {}",
                snapshot.id, snapshot.size, self.max_cargo_size
            )));
        }

        if snapshot.size < self.min_cargo_size {
            return Ok(Readiness::BelowThreshold {
                size: snapshot.size,
            });
        }

        let outcome = self
            .store
            .transition(&snapshot.id, FerryState::Loading, FerryState::Ready, Utc::now())
            .await?;

        match outcome {
            WriteOutcome::Applied => {
                tracing::info!(
                    "✅ Ferry {} is READY with {} bytes",
                    snapshot.id,
                    snapshot.size
                );
                self.signal(&snapshot.id).await?;
                Ok(Readiness::MarkedReady)
            }
            WriteOutcome::ConditionFailed => {
                let current = self.store.get_ferry(&snapshot.id).await?.map(|f| f.state);
                // the winner may have crashed before signalling
                if current == Some(FerryState::Ready) {
                    self.signal(&snapshot.id).await?;
                }
                tracing::debug!(
                    "Ferry {} already left LOADING (now {:?})",
                    snapshot.id,
                    current
                );
                Ok(Readiness::AlreadyTransitioned(current))
            }
        }
    }

    async fn signal(&self, ferry_id: &FerryId) -> Result<()> {
        self.dispatcher.ferry_ready(ferry_id).await.map_err(|e| {
            tracing::warn!("⚠️ Ready signal for ferry {} failed: {}", ferry_id, e);
            e
        })
    }
}

#[async_trait]
impl<S: FerryStore, D: DealDispatcher + ?Sized> StreamHandler<Ferry> for ReadinessChecker<S, D> {
    async fn handle_batch(
        &self,
        records: &[StreamRecord<Ferry>],
        budget: &InvocationBudget,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        for record in records {
            if budget.is_exhausted() {
                outcome.fail(&record.sequence_number);
                continue;
            }

            let snapshot = match (&record.event_name, &record.new_image) {
                (EventName::Insert | EventName::Modify, Some(ferry)) => ferry,
                _ => {
                    outcome.skipped += 1;
                    continue;
                }
            };

            match self.check_readiness(snapshot).await {
                Ok(Readiness::Ignored(_)) | Ok(Readiness::BelowThreshold { .. }) => {
                    outcome.skipped += 1
                }
                Ok(_) => outcome.processed += 1,
                Err(e) if e.is_item_scoped() => outcome.fail(&record.sequence_number),
                Err(e) => return Err(e),
            }
        }

        Ok(outcome)
    }
}
