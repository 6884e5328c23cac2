//! Cargo assignment: packs cars from the car table's insert stream into
//! LOADING ferries.
//!
//! The only shared mutable state is the ferry row. A car is appended with a
//! single conditional write that also checks the ferry size read just
//! before, so two workers racing for the same ferry cannot both succeed.
//! The loser re-reads and picks again, which may mean opening a new ferry.

use crate::config::settings::{FerryConfig, SelectionPolicy};
use crate::core::retry::RetryPolicy;
use crate::core::stream::{BatchOutcome, EventName, InvocationBudget, StreamHandler, StreamRecord};
use crate::domain::model::{Car, Cargo, Ferry, FerryId, WriteOutcome};
use crate::domain::ports::{ConfigProvider, FerryStore};
use crate::utils::error::{FerryError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// The car is now cargo on `ferry_id`, which holds `ferry_size` bytes.
    Loaded { ferry_id: FerryId, ferry_size: u64 },
    /// A cargo record already existed; redelivery, nothing written.
    AlreadyLoaded { ferry_id: FerryId },
}

impl Assignment {
    pub fn ferry_id(&self) -> &FerryId {
        match self {
            Assignment::Loaded { ferry_id, .. } | Assignment::AlreadyLoaded { ferry_id } => ferry_id,
        }
    }
}

pub struct CargoAssigner<S: FerryStore> {
    store: Arc<S>,
    max_cargo_size: u64,
    selection: SelectionPolicy,
    retry: RetryPolicy,
}

impl<S: FerryStore> CargoAssigner<S> {
    pub fn new(store: Arc<S>, ferry: &FerryConfig, retry: RetryPolicy) -> Self {
        Self {
            store,
            max_cargo_size: ferry.max_cargo_size,
            selection: ferry.selection_policy,
            retry,
        }
    }

    pub fn from_config<C: ConfigProvider>(store: Arc<S>, config: &C) -> Self {
        Self::new(
            store,
            config.ferry(),
            RetryPolicy::from(config.conflict_retry()),
        )
    }

    /// Put `car` on exactly one ferry, or confirm it already is on one.
    pub async fn assign(&self, car: &Car) -> Result<Assignment> {
        if car.size > self.max_cargo_size {
            return Err(FerryError::OversizedCar {
                link: car.link.clone(),
                size: car.size,
                max_cargo_size: self.max_cargo_size,
            });
        }

        if let Some(cargo) = self.store.cargo_for_car(&car.link).await? {
            tracing::debug!("Car {} already on ferry {}", car.link, cargo.ferry_id);
            return Ok(Assignment::AlreadyLoaded {
                ferry_id: cargo.ferry_id,
            });
        }

        for attempt in 0..self.retry.max_attempts {
            let ferry = self.select_or_create(car).await?;
            let now = Utc::now();
            let cargo = Cargo::for_car(ferry.id.clone(), car, now);

            match self.store.load_cargo(&cargo, ferry.size, now).await? {
                WriteOutcome::Applied => {
                    let ferry_size = ferry.size + car.size;
                    tracing::debug!(
                        "Loaded car {} ({} bytes) on ferry {} -> {} bytes",
                        car.link,
                        car.size,
                        ferry.id,
                        ferry_size
                    );
                    return Ok(Assignment::Loaded {
                        ferry_id: ferry.id,
                        ferry_size,
                    });
                }
                WriteOutcome::ConditionFailed => {
                    // a concurrent delivery of the same car may have won
                    if let Some(cargo) = self.store.cargo_for_car(&car.link).await? {
                        return Ok(Assignment::AlreadyLoaded {
                            ferry_id: cargo.ferry_id,
                        });
                    }
                    tracing::debug!(
                        "Ferry {} changed under car {} (attempt {}), retrying",
                        ferry.id,
                        car.link,
                        attempt + 1
                    );
                    if attempt + 1 < self.retry.max_attempts {
                        self.retry.backoff(attempt).await;
                    }
                }
            }
        }

        tracing::warn!(
            "⚠️ Gave up loading car {} after {} conflicting attempts",
            car.link,
            self.retry.max_attempts
        );
        Err(FerryError::RetryExhausted {
            link: car.link.clone(),
            attempts: self.retry.max_attempts,
        })
    }

    /// Fresh read of the open ferries; open a new one when none has room.
    async fn select_or_create(&self, car: &Car) -> Result<Ferry> {
        let bound = self.max_cargo_size - car.size;
        // the store filter is advisory, re-check every candidate
        let candidates: Vec<Ferry> = self
            .store
            .open_ferries(bound)
            .await?
            .into_iter()
            .filter(|f| f.has_room_for(car.size, self.max_cargo_size))
            .collect();

        if let Some(ferry) = self.selection.pick(&candidates) {
            return Ok(ferry.clone());
        }

        for _ in 0..3 {
            let now = Utc::now();
            let ferry = Ferry::new(FerryId::generate(now), now);
            if self.store.create_ferry(&ferry).await?.is_applied() {
                tracing::info!("🚢 Opened ferry {} for car {}", ferry.id, car.link);
                return Ok(ferry);
            }
        }
        Err(FerryError::store("could not allocate an unused ferry id"))
    }
}

#[async_trait]
impl<S: FerryStore> StreamHandler<Car> for CargoAssigner<S> {
    /// Records are handled in delivery order. Item-scoped failures are
    /// reported for redelivery; anything else aborts the invocation.
    async fn handle_batch(
        &self,
        records: &[StreamRecord<Car>],
        budget: &InvocationBudget,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        for record in records {
            if budget.is_exhausted() {
                outcome.fail(&record.sequence_number);
                continue;
            }

            let car = match (&record.event_name, &record.new_image) {
                (EventName::Insert, Some(car)) => car,
                _ => {
                    outcome.skipped += 1;
                    continue;
                }
            };

            match self.assign(car).await {
                Ok(_) => outcome.processed += 1,
                Err(e) if e.is_item_scoped() => {
                    tracing::warn!("⚠️ Car {} not loaded: {}", car.link, e);
                    outcome.fail(&record.sequence_number);
                }
                Err(e) => return Err(e),
            }
        }

        if !outcome.failures.is_empty() {
            tracing::info!(
                "Car batch: {} loaded, {} skipped, {} to redeliver",
                outcome.processed,
                outcome.skipped,
                outcome.failures.len()
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryStore;
    use crate::domain::model::FerryState;
    use chrono::{DateTime, Duration as ChronoDuration};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn assigner(store: Arc<MemoryStore>) -> CargoAssigner<MemoryStore> {
        CargoAssigner::new(
            store,
            &FerryConfig::new(3000, 3200),
            RetryPolicy::new(4, 1, 2, 0.0),
        )
    }

    fn loading_ferry(id: &str, size: u64, idle_secs: i64) -> Ferry {
        let now = Utc::now();
        let mut ferry = Ferry::new(FerryId::new(id), now - ChronoDuration::seconds(600));
        ferry.size = size;
        ferry.updated_at = now - ChronoDuration::seconds(idle_secs);
        ferry
    }

    /// Store that reports a conflict for the first `conflicts` cargo loads.
    struct ContendedStore {
        inner: MemoryStore,
        conflicts: AtomicUsize,
    }

    impl ContendedStore {
        fn new(conflicts: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                conflicts: AtomicUsize::new(conflicts),
            }
        }
    }

    #[async_trait]
    impl FerryStore for ContendedStore {
        async fn cargo_for_car(&self, link: &str) -> Result<Option<Cargo>> {
            self.inner.cargo_for_car(link).await
        }

        async fn open_ferries(&self, max_size_before_load: u64) -> Result<Vec<Ferry>> {
            self.inner.open_ferries(max_size_before_load).await
        }

        async fn get_ferry(&self, id: &FerryId) -> Result<Option<Ferry>> {
            self.inner.get_ferry(id).await
        }

        async fn create_ferry(&self, ferry: &Ferry) -> Result<WriteOutcome> {
            self.inner.create_ferry(ferry).await
        }

        async fn load_cargo(
            &self,
            cargo: &Cargo,
            expected_size: u64,
            now: DateTime<Utc>,
        ) -> Result<WriteOutcome> {
            let left = self.conflicts.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts.store(left - 1, Ordering::SeqCst);
                return Ok(WriteOutcome::ConditionFailed);
            }
            self.inner.load_cargo(cargo, expected_size, now).await
        }

        async fn transition(
            &self,
            id: &FerryId,
            from: FerryState,
            to: FerryState,
            now: DateTime<Utc>,
        ) -> Result<WriteOutcome> {
            self.inner.transition(id, from, to, now).await
        }
    }

    #[tokio::test]
    async fn test_first_car_opens_a_ferry() {
        let store = Arc::new(MemoryStore::new());
        let assigner = assigner(store.clone());

        let assignment = assigner.assign(&Car::new("bafy1", 40)).await.unwrap();

        let ferries = store.ferries().unwrap();
        assert_eq!(ferries.len(), 1);
        assert_eq!(ferries[0].size, 40);
        assert_eq!(ferries[0].state, FerryState::Loading);
        assert_eq!(assignment.ferry_id(), &ferries[0].id);
    }

    #[tokio::test]
    async fn test_cars_fill_the_open_ferry() {
        let store = Arc::new(MemoryStore::new());
        let assigner = assigner(store.clone());

        for i in 0..10 {
            assigner
                .assign(&Car::new(format!("bafy{}", i), 40))
                .await
                .unwrap();
        }

        let ferries = store.ferries().unwrap();
        assert_eq!(ferries.len(), 1);
        assert_eq!(ferries[0].size, 400);
        assert_eq!(store.cargo().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_redelivered_car_is_not_loaded_twice() {
        let store = Arc::new(MemoryStore::new());
        let assigner = assigner(store.clone());
        let car = Car::new("bafy1", 40);

        let first = assigner.assign(&car).await.unwrap();
        let second = assigner.assign(&car).await.unwrap();

        assert!(matches!(first, Assignment::Loaded { ferry_size: 40, .. }));
        assert_eq!(
            second,
            Assignment::AlreadyLoaded {
                ferry_id: first.ferry_id().clone()
            }
        );
        assert_eq!(store.ferries().unwrap()[0].size, 40);
        assert_eq!(store.cargo().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_car_that_does_not_fit_opens_new_ferry() {
        let store = Arc::new(MemoryStore::new());
        store.put_ferry(loading_ferry("almost-full", 3150, 1)).unwrap();
        let assigner = assigner(store.clone());

        let assignment = assigner.assign(&Car::new("bafy1", 100)).await.unwrap();

        assert_ne!(assignment.ferry_id().as_str(), "almost-full");
        let full = store
            .get_ferry(&FerryId::new("almost-full"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(full.size, 3150);
        assert_eq!(store.ferries().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_exact_fit_is_accepted() {
        let store = Arc::new(MemoryStore::new());
        store.put_ferry(loading_ferry("f1", 3150, 1)).unwrap();
        let assigner = assigner(store.clone());

        let assignment = assigner.assign(&Car::new("bafy1", 50)).await.unwrap();

        assert_eq!(
            assignment,
            Assignment::Loaded {
                ferry_id: FerryId::new("f1"),
                ferry_size: 3200
            }
        );
    }

    #[tokio::test]
    async fn test_most_recently_updated_ferry_is_preferred() {
        let store = Arc::new(MemoryStore::new());
        store.put_ferry(loading_ferry("stale", 1000, 300)).unwrap();
        store.put_ferry(loading_ferry("fresh", 200, 2)).unwrap();
        let assigner = assigner(store.clone());

        let assignment = assigner.assign(&Car::new("bafy1", 40)).await.unwrap();

        assert_eq!(assignment.ferry_id().as_str(), "fresh");
    }

    #[tokio::test]
    async fn test_non_loading_ferry_is_never_targeted() {
        let store = Arc::new(MemoryStore::new());
        let mut ready = loading_ferry("ready", 100, 1);
        ready.state = FerryState::Ready;
        store.put_ferry(ready).unwrap();
        let assigner = assigner(store.clone());

        let assignment = assigner.assign(&Car::new("bafy1", 40)).await.unwrap();

        assert_ne!(assignment.ferry_id().as_str(), "ready");
        let ready = store.get_ferry(&FerryId::new("ready")).await.unwrap().unwrap();
        assert_eq!(ready.size, 100);
    }

    #[tokio::test]
    async fn test_oversized_car_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let assigner = assigner(store.clone());

        let err = assigner.assign(&Car::new("huge", 3201)).await.unwrap_err();

        assert!(matches!(err, FerryError::OversizedCar { size: 3201, .. }));
        assert!(store.ferries().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deliveries_of_one_car_load_it_once() {
        for _ in 0..50 {
            let store = Arc::new(MemoryStore::new());
            let assigner = Arc::new(assigner(store.clone()));

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let assigner = assigner.clone();
                    tokio::spawn(async move { assigner.assign(&Car::new("bagbaiera-dup", 40)).await })
                })
                .collect();

            let mut ferry_ids = Vec::new();
            for handle in handles {
                ferry_ids.push(handle.await.unwrap().unwrap().ferry_id().clone());
            }

            let cargo = store.cargo().unwrap();
            assert_eq!(cargo.len(), 1);
            assert!(ferry_ids.iter().all(|id| *id == cargo[0].ferry_id));
            let total: u64 = store.ferries().unwrap().iter().map(|f| f.size).sum();
            assert_eq!(total, 40);
        }
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let store = Arc::new(ContendedStore::new(2));
        let assigner = CargoAssigner::new(
            store.clone(),
            &FerryConfig::new(3000, 3200),
            RetryPolicy::new(4, 1, 2, 0.0),
        );

        let assignment = assigner.assign(&Car::new("bafy1", 40)).await.unwrap();

        assert!(matches!(assignment, Assignment::Loaded { ferry_size: 40, .. }));
        assert_eq!(store.inner.cargo().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_as_item_failure() {
        let store = Arc::new(ContendedStore::new(100));
        let assigner = CargoAssigner::new(
            store.clone(),
            &FerryConfig::new(3000, 3200),
            RetryPolicy::new(3, 1, 2, 0.0),
        );

        let err = assigner.assign(&Car::new("bafy1", 40)).await.unwrap_err();

        assert!(matches!(err, FerryError::RetryExhausted { attempts: 3, .. }));
        assert!(err.is_item_scoped());
        assert!(store.inner.cargo().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_reports_only_failing_records() {
        let store = Arc::new(MemoryStore::new());
        let assigner = assigner(store.clone());
        let records = vec![
            StreamRecord::insert("1", Car::new("bafy1", 40)),
            StreamRecord::insert("2", Car::new("huge", 5000)),
            StreamRecord::modify("3", Car::new("bafy1", 40), Car::new("bafy1", 40)),
            StreamRecord::insert("4", Car::new("bafy1", 40)),
            StreamRecord::insert("5", Car::new("bafy2", 40)),
        ];

        let outcome = assigner
            .handle_batch(&records, &InvocationBudget::unlimited())
            .await
            .unwrap();

        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.failures, vec!["2".to_string()]);
        assert_eq!(store.cargo().unwrap().len(), 2);
        assert_eq!(store.ferries().unwrap()[0].size, 80);
    }

    #[tokio::test]
    async fn test_store_outage_fails_the_invocation() {
        let store = Arc::new(MemoryStore::new());
        let assigner = assigner(store.clone());
        store.set_unavailable(true);

        let records = vec![StreamRecord::insert("1", Car::new("bafy1", 40))];
        let result = assigner
            .handle_batch(&records, &InvocationBudget::unlimited())
            .await;

        assert!(matches!(result, Err(FerryError::StoreError { .. })));
    }

    #[tokio::test]
    async fn test_exhausted_budget_leaves_records_for_redelivery() {
        let store = Arc::new(MemoryStore::new());
        let assigner = assigner(store.clone());
        let records = vec![
            StreamRecord::insert("1", Car::new("bafy1", 40)),
            StreamRecord::insert("2", Car::new("bafy2", 40)),
        ];

        let outcome = assigner
            .handle_batch(&records, &InvocationBudget::new(Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(outcome.processed, 0);
        assert_eq!(outcome.failures, vec!["1".to_string(), "2".to_string()]);
        assert!(store.cargo().unwrap().is_empty());
    }
}
