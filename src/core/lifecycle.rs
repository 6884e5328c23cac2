//! Post-READY lifecycle. The deal service drives these steps; they reuse the
//! same state-guarded write as readiness so a step applies at most once.

use crate::domain::model::{FerryId, FerryState, WriteOutcome};
use crate::domain::ports::FerryStore;
use crate::utils::error::{FerryError, Result};
use chrono::Utc;
use std::sync::Arc;

pub struct FerryLifecycle<S: FerryStore> {
    store: Arc<S>,
}

impl<S: FerryStore> FerryLifecycle<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn mark_deal_pending(&self, id: &FerryId) -> Result<WriteOutcome> {
        self.advance(id, FerryState::Ready, FerryState::DealPending)
            .await
    }

    pub async fn mark_deal_processed(&self, id: &FerryId) -> Result<WriteOutcome> {
        self.advance(id, FerryState::DealPending, FerryState::DealProcessed)
            .await
    }

    /// Apply `from -> to` if the table allows it. Repeating a step that
    /// already happened yields `ConditionFailed`.
    pub async fn advance(
        &self,
        id: &FerryId,
        from: FerryState,
        to: FerryState,
    ) -> Result<WriteOutcome> {
        if !from.can_transition_to(to) {
            return Err(FerryError::invariant(format!(
                "ferry {} cannot move from {} to {}",
                id, from, to
            )));
        }

        let outcome = self.store.transition(id, from, to, Utc::now()).await?;
        if outcome.is_applied() {
            tracing::info!("Ferry {} moved {} -> {}", id, from, to);
        }
        Ok(outcome)
    }
}
