use crate::core::stream::{ChangeFeed, EventName, FeedReceiver};
use crate::domain::model::{Car, Cargo, Ferry, FerryId, FerryState, WriteOutcome};
use crate::domain::ports::{CarLedger, DealDispatcher, FerryStore};
use crate::utils::error::{FerryError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Tables {
    cars: HashMap<String, Car>,
    ferries: BTreeMap<FerryId, Ferry>,
    cargo: BTreeMap<(FerryId, String), Cargo>,
    cargo_by_link: HashMap<String, FerryId>,
}

/// Car, ferry and cargo tables in one process. Each write checks its
/// precondition and applies under one lock, and ferry/car changes are
/// published to their feeds before the lock is released.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    car_feed: ChangeFeed<Car>,
    ferry_feed: ChangeFeed<Ferry>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            car_feed: ChangeFeed::new(),
            ferry_feed: ChangeFeed::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn subscribe_cars(&self) -> FeedReceiver<Car> {
        self.car_feed.subscribe()
    }

    pub fn subscribe_ferries(&self) -> FeedReceiver<Ferry> {
        self.ferry_feed.subscribe()
    }

    pub fn pending_notifications(&self) -> usize {
        self.car_feed.pending() + self.ferry_feed.pending()
    }

    pub fn close_feeds(&self) {
        self.car_feed.close();
        self.ferry_feed.close();
    }

    /// Makes every call fail with `StoreError` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Publish an INSERT again for every stored car, as a redelivering
    /// change log would.
    pub fn replay_car_inserts(&self) -> Result<usize> {
        let tables = self.lock()?;
        for car in tables.cars.values() {
            self.car_feed
                .publish(EventName::Insert, None, Some(car.clone()));
        }
        Ok(tables.cars.len())
    }

    /// Write a ferry as-is, bypassing the loading rules. Fixture and ops use only.
    pub fn put_ferry(&self, ferry: Ferry) -> Result<()> {
        let mut tables = self.lock()?;
        let old = tables.ferries.insert(ferry.id.clone(), ferry.clone());
        let event = if old.is_some() {
            EventName::Modify
        } else {
            EventName::Insert
        };
        self.ferry_feed.publish(event, old, Some(ferry));
        Ok(())
    }

    pub fn ferries(&self) -> Result<Vec<Ferry>> {
        Ok(self.lock()?.ferries.values().cloned().collect())
    }

    pub fn cargo(&self) -> Result<Vec<Cargo>> {
        Ok(self.lock()?.cargo.values().cloned().collect())
    }

    pub fn cargo_on(&self, ferry_id: &FerryId) -> Result<Vec<Cargo>> {
        Ok(self
            .lock()?
            .cargo
            .range((ferry_id.clone(), String::new())..)
            .take_while(|((id, _), _)| id == ferry_id)
            .map(|(_, cargo)| cargo.clone())
            .collect())
    }

    pub fn cars(&self) -> Result<Vec<Car>> {
        Ok(self.lock()?.cars.values().cloned().collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FerryError::store("memory store is unavailable"));
        }
        self.tables
            .lock()
            .map_err(|_| FerryError::store("memory store lock poisoned"))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FerryStore for MemoryStore {
    async fn cargo_for_car(&self, link: &str) -> Result<Option<Cargo>> {
        let tables = self.lock()?;
        Ok(tables
            .cargo_by_link
            .get(link)
            .and_then(|ferry_id| tables.cargo.get(&(ferry_id.clone(), link.to_string())))
            .cloned())
    }

    async fn open_ferries(&self, max_size_before_load: u64) -> Result<Vec<Ferry>> {
        Ok(self
            .lock()?
            .ferries
            .values()
            .filter(|f| f.state == FerryState::Loading && f.size <= max_size_before_load)
            .cloned()
            .collect())
    }

    async fn get_ferry(&self, id: &FerryId) -> Result<Option<Ferry>> {
        Ok(self.lock()?.ferries.get(id).cloned())
    }

    async fn create_ferry(&self, ferry: &Ferry) -> Result<WriteOutcome> {
        let mut tables = self.lock()?;
        if tables.ferries.contains_key(&ferry.id) {
            return Ok(WriteOutcome::ConditionFailed);
        }
        tables.ferries.insert(ferry.id.clone(), ferry.clone());
        self.ferry_feed
            .publish(EventName::Insert, None, Some(ferry.clone()));
        Ok(WriteOutcome::Applied)
    }

    async fn load_cargo(
        &self,
        cargo: &Cargo,
        expected_size: u64,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome> {
        let mut tables = self.lock()?;
        if tables.cargo_by_link.contains_key(&cargo.link) {
            return Ok(WriteOutcome::ConditionFailed);
        }
        let Some(ferry) = tables.ferries.get_mut(&cargo.ferry_id) else {
            return Ok(WriteOutcome::ConditionFailed);
        };
        if ferry.state != FerryState::Loading || ferry.size != expected_size {
            return Ok(WriteOutcome::ConditionFailed);
        }

        let old = ferry.clone();
        ferry.size += cargo.size;
        ferry.updated_at = now;
        let new = ferry.clone();

        tables
            .cargo_by_link
            .insert(cargo.link.clone(), cargo.ferry_id.clone());
        tables
            .cargo
            .insert((cargo.ferry_id.clone(), cargo.link.clone()), cargo.clone());
        self.ferry_feed
            .publish(EventName::Modify, Some(old), Some(new));
        Ok(WriteOutcome::Applied)
    }

    async fn transition(
        &self,
        id: &FerryId,
        from: FerryState,
        to: FerryState,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome> {
        let mut tables = self.lock()?;
        let Some(ferry) = tables.ferries.get_mut(id) else {
            return Ok(WriteOutcome::ConditionFailed);
        };
        if ferry.state != from {
            return Ok(WriteOutcome::ConditionFailed);
        }

        let old = ferry.clone();
        ferry.state = to;
        ferry.updated_at = now;
        let new = ferry.clone();
        self.ferry_feed
            .publish(EventName::Modify, Some(old), Some(new));
        Ok(WriteOutcome::Applied)
    }
}

#[async_trait]
impl CarLedger for MemoryStore {
    async fn put_cars(&self, cars: &[Car]) -> Result<()> {
        let mut tables = self.lock()?;
        for car in cars {
            let old = tables.cars.insert(car.link.clone(), car.clone());
            let event = if old.is_some() {
                EventName::Modify
            } else {
                EventName::Insert
            };
            self.car_feed.publish(event, old, Some(car.clone()));
        }
        Ok(())
    }

    async fn get_car(&self, link: &str) -> Result<Option<Car>> {
        Ok(self.lock()?.cars.get(link).cloned())
    }
}

/// Dispatcher that remembers every signal it received.
#[derive(Default)]
pub struct RecordingDispatcher {
    signals: Mutex<Vec<FerryId>>,
    failing: AtomicBool,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn signals(&self) -> Vec<FerryId> {
        self.signals
            .lock()
            .map(|signals| signals.clone())
            .unwrap_or_default()
    }

    /// Distinct ferries signalled, in first-signal order.
    pub fn ready_ferries(&self) -> Vec<FerryId> {
        let mut seen = Vec::new();
        for id in self.signals() {
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        seen
    }
}

#[async_trait]
impl DealDispatcher for RecordingDispatcher {
    async fn ferry_ready(&self, ferry_id: &FerryId) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(FerryError::DispatchError {
                message: format!("dispatcher rejected ferry {}", ferry_id),
            });
        }
        self.signals
            .lock()
            .map_err(|_| FerryError::DispatchError {
                message: "dispatcher lock poisoned".to_string(),
            })?
            .push(ferry_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_ferry(store: &MemoryStore, id: &str) -> FerryId {
        let ferry = Ferry::new(FerryId::new(id), Utc::now());
        store.put_ferry(ferry.clone()).unwrap();
        ferry.id
    }

    #[tokio::test]
    async fn test_load_cargo_checks_expected_size() {
        let store = MemoryStore::new();
        let id = new_ferry(&store, "f1");
        let car = Car::new("bafy1", 40);
        let cargo = Cargo::for_car(id.clone(), &car, Utc::now());

        let stale = store.load_cargo(&cargo, 10, Utc::now()).await.unwrap();
        assert_eq!(stale, WriteOutcome::ConditionFailed);

        let applied = store.load_cargo(&cargo, 0, Utc::now()).await.unwrap();
        assert_eq!(applied, WriteOutcome::Applied);
        assert_eq!(store.get_ferry(&id).await.unwrap().unwrap().size, 40);
        assert_eq!(store.cargo_on(&id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_car_cannot_be_loaded_twice() {
        let store = MemoryStore::new();
        let first = new_ferry(&store, "f1");
        let second = new_ferry(&store, "f2");
        let car = Car::new("bafy1", 40);

        let outcome = store
            .load_cargo(&Cargo::for_car(first.clone(), &car, Utc::now()), 0, Utc::now())
            .await
            .unwrap();
        assert!(outcome.is_applied());

        let outcome = store
            .load_cargo(&Cargo::for_car(second.clone(), &car, Utc::now()), 0, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::ConditionFailed);
        assert_eq!(
            store.cargo_for_car("bafy1").await.unwrap().unwrap().ferry_id,
            first
        );
        assert_eq!(store.get_ferry(&second).await.unwrap().unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_load_rejected_once_ferry_left_loading() {
        let store = MemoryStore::new();
        let id = new_ferry(&store, "f1");
        let moved = store
            .transition(&id, FerryState::Loading, FerryState::Ready, Utc::now())
            .await
            .unwrap();
        assert!(moved.is_applied());

        let car = Car::new("bafy1", 40);
        let outcome = store
            .load_cargo(&Cargo::for_car(id.clone(), &car, Utc::now()), 0, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::ConditionFailed);

        let again = store
            .transition(&id, FerryState::Loading, FerryState::Ready, Utc::now())
            .await
            .unwrap();
        assert_eq!(again, WriteOutcome::ConditionFailed);
    }

    #[tokio::test]
    async fn test_open_ferries_respects_bound_and_state() {
        let store = MemoryStore::new();
        let mut small = Ferry::new(FerryId::new("small"), Utc::now());
        small.size = 100;
        let mut big = Ferry::new(FerryId::new("big"), Utc::now());
        big.size = 3100;
        let mut ready = Ferry::new(FerryId::new("ready"), Utc::now());
        ready.state = FerryState::Ready;
        for ferry in [small, big, ready] {
            store.put_ferry(ferry).unwrap();
        }

        let open = store.open_ferries(3000).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id.as_str(), "small");
    }

    #[tokio::test]
    async fn test_feeds_publish_changes() {
        let store = MemoryStore::new();
        let mut cars = store.subscribe_cars();
        let mut ferries = store.subscribe_ferries();

        store.put_cars(&[Car::new("bafy1", 1)]).await.unwrap();
        let id = new_ferry(&store, "f1");
        store
            .transition(&id, FerryState::Loading, FerryState::Ready, Utc::now())
            .await
            .unwrap();

        let car_record = cars.recv().await.unwrap();
        assert_eq!(car_record.event_name, EventName::Insert);

        let inserted = ferries.recv().await.unwrap();
        assert_eq!(inserted.event_name, EventName::Insert);
        let modified = ferries.recv().await.unwrap();
        assert_eq!(modified.event_name, EventName::Modify);
        assert_eq!(modified.old_image.unwrap().state, FerryState::Loading);
        assert_eq!(modified.new_image.unwrap().state, FerryState::Ready);
        assert_eq!(store.pending_notifications(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_calls() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.open_ferries(10).await.unwrap_err();
        assert!(matches!(err, FerryError::StoreError { .. }));
        store.set_unavailable(false);
        assert!(store.open_ferries(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recording_dispatcher() {
        let dispatcher = RecordingDispatcher::new();
        let id = FerryId::new("f1");
        dispatcher.ferry_ready(&id).await.unwrap();
        dispatcher.ferry_ready(&id).await.unwrap();
        assert_eq!(dispatcher.signals().len(), 2);
        assert_eq!(dispatcher.ready_ferries(), vec![id.clone()]);

        dispatcher.set_failing(true);
        assert!(dispatcher.ferry_ready(&id).await.is_err());
    }
}
