//! In-process stand-in for the change-stream event source.
//!
//! A [`StreamDriver`] pulls records from a [`FeedReceiver`], drops those the
//! filter rejects and routes the rest to `parallelism` lanes by partition
//! key, so records for one key stay ordered. Each lane gathers a batch
//! (up to `batch_size`, waiting at most the batching window) and invokes the
//! handler. An invocation error splits the batch in two and retries each
//! half; reported item failures are retried on their own. A record that has
//! been delivered `max_record_attempts` times is dead-lettered.

use crate::adapters::memory::{MemoryStore, RecordingDispatcher};
use crate::config::settings::ConsumerConfig;
use crate::core::cargo_assignment::CargoAssigner;
use crate::core::ferry_readiness::ReadinessChecker;
use crate::core::stream::{
    EventName, FeedReceiver, InvocationBudget, StreamFilter, StreamHandler, StreamItem,
    StreamRecord,
};
use crate::domain::model::{Car, Ferry, FerryId, FerryState};
use crate::domain::ports::{CarLedger, ConfigProvider};
use crate::utils::error::{FerryError, Result};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};

#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    pub record: StreamRecord<T>,
    pub attempts: u32,
}

pub struct StreamDriver<T: StreamItem, H: StreamHandler<T> + 'static> {
    name: &'static str,
    handler: Arc<H>,
    config: ConsumerConfig,
    filter: StreamFilter,
    _item: PhantomData<fn() -> T>,
}

impl<T: StreamItem, H: StreamHandler<T> + 'static> StreamDriver<T, H> {
    pub fn new(
        name: &'static str,
        handler: Arc<H>,
        config: ConsumerConfig,
        filter: StreamFilter,
    ) -> Self {
        Self {
            name,
            handler,
            config,
            filter,
            _item: PhantomData,
        }
    }

    pub fn spawn(self, mut feed: FeedReceiver<T>) -> DriverHandle<T> {
        let pending = feed.settled_counter();
        let dead_letters = Arc::new(Mutex::new(Vec::new()));
        let lane_count = self.config.parallelism.max(1);

        let lane = Arc::new(Lane {
            name: self.name,
            handler: self.handler,
            config: self.config,
            pending: pending.clone(),
            dead_letters: dead_letters.clone(),
        });

        let mut senders = Vec::with_capacity(lane_count);
        let mut lanes = Vec::with_capacity(lane_count);
        for _ in 0..lane_count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            lanes.push(tokio::spawn(lane.clone().run(rx)));
        }

        let filter = self.filter;
        let router = tokio::spawn(async move {
            while let Some(record) = feed.recv().await {
                if !filter.matches(&record) {
                    pending.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
                let lane = lane_for(&record, lane_count);
                if senders[lane].send(record).is_err() {
                    pending.fetch_sub(1, Ordering::SeqCst);
                }
            }
        });

        DriverHandle {
            router,
            lanes,
            dead_letters,
        }
    }
}

fn lane_for<T: StreamItem>(record: &StreamRecord<T>, lanes: usize) -> usize {
    let key = record
        .new_image
        .as_ref()
        .or(record.old_image.as_ref())
        .map(|item| item.partition_key())
        .unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

struct Lane<T: StreamItem, H: StreamHandler<T>> {
    name: &'static str,
    handler: Arc<H>,
    config: ConsumerConfig,
    pending: Arc<AtomicUsize>,
    dead_letters: Arc<Mutex<Vec<DeadLetter<T>>>>,
}

impl<T: StreamItem, H: StreamHandler<T>> Lane<T, H> {
    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<StreamRecord<T>>) {
        let window = self.config.batching_window();
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            let window_end = Instant::now() + window;

            while batch.len() < self.config.batch_size {
                if let Ok(record) = rx.try_recv() {
                    batch.push(record);
                    continue;
                }
                if window.is_zero() {
                    break;
                }
                match timeout_at(window_end, rx.recv()).await {
                    Ok(Some(record)) => batch.push(record),
                    Ok(None) | Err(_) => break,
                }
            }

            self.deliver(batch).await;
        }
    }

    async fn deliver(&self, batch: Vec<StreamRecord<T>>) {
        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut queue = VecDeque::from([batch]);

        while let Some(mut batch) = queue.pop_front() {
            for record in &batch {
                *attempts.entry(record.sequence_number.clone()).or_default() += 1;
            }

            let budget = InvocationBudget::new(self.config.invocation_timeout());
            let redeliver = match self.handler.handle_batch(&batch, &budget).await {
                Ok(outcome) => {
                    let (failed, done): (Vec<_>, Vec<_>) = batch
                        .into_iter()
                        .partition(|r| outcome.failures.contains(&r.sequence_number));
                    self.settle(done.len());
                    if failed.is_empty() {
                        Vec::new()
                    } else {
                        vec![failed]
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "⚠️ {} stream invocation of {} records failed: {}",
                        self.name,
                        batch.len(),
                        e
                    );
                    if batch.len() > 1 {
                        let second = batch.split_off(batch.len() / 2);
                        vec![batch, second]
                    } else {
                        vec![batch]
                    }
                }
            };

            let mut retries = Vec::new();
            let mut max_seen = 0;
            for chunk in redeliver {
                let (alive, dead): (Vec<_>, Vec<_>) = chunk.into_iter().partition(|r| {
                    attempts[&r.sequence_number] < self.config.max_record_attempts
                });
                for record in dead {
                    let delivered = attempts[&record.sequence_number];
                    self.dead_letter(record, delivered);
                }
                if let Some(n) = alive.iter().map(|r| attempts[&r.sequence_number]).max() {
                    max_seen = max_seen.max(n);
                }
                if !alive.is_empty() {
                    retries.push(alive);
                }
            }

            if !retries.is_empty() {
                sleep(Duration::from_millis(5 * u64::from(max_seen.min(20)))).await;
            }
            for chunk in retries.into_iter().rev() {
                queue.push_front(chunk);
            }
        }
    }

    fn dead_letter(&self, record: StreamRecord<T>, attempts: u32) {
        tracing::error!(
            "❌ {} stream record {} dead-lettered after {} deliveries",
            self.name,
            record.sequence_number,
            attempts
        );
        if let Ok(mut dead) = self.dead_letters.lock() {
            dead.push(DeadLetter { record, attempts });
        }
        self.settle(1);
    }

    fn settle(&self, count: usize) {
        if count > 0 {
            self.pending.fetch_sub(count, Ordering::SeqCst);
        }
    }
}

pub struct DriverHandle<T> {
    router: JoinHandle<()>,
    lanes: Vec<JoinHandle<()>>,
    dead_letters: Arc<Mutex<Vec<DeadLetter<T>>>>,
}

impl<T: Clone> DriverHandle<T> {
    pub fn dead_letters(&self) -> Vec<DeadLetter<T>> {
        self.dead_letters
            .lock()
            .map(|dead| dead.clone())
            .unwrap_or_default()
    }

    /// Wait for the router and lanes to drain after the feed closed.
    pub async fn join(self) {
        if let Err(e) = self.router.await {
            tracing::warn!("Stream router stopped abnormally: {}", e);
        }
        for lane in self.lanes {
            if let Err(e) = lane.await {
                tracing::warn!("Stream lane stopped abnormally: {}", e);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FerrySummary {
    pub id: FerryId,
    pub state: FerryState,
    pub size: u64,
    pub cargo_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSummary {
    pub ferries: Vec<FerrySummary>,
    pub cargo_count: usize,
    pub total_size: u64,
    pub ready_signals: Vec<FerryId>,
    pub dead_letters: Vec<String>,
}

impl LoadSummary {
    pub fn ready_count(&self) -> usize {
        self.ferries
            .iter()
            .filter(|f| f.state == FerryState::Ready)
            .count()
    }
}

/// Both consumers wired to a [`MemoryStore`], the way the two stream
/// consumers are wired to the car and ferry tables in a deployment.
pub struct LocalRuntime {
    store: Arc<MemoryStore>,
    dispatcher: Arc<RecordingDispatcher>,
    cars: DriverHandle<Car>,
    ferries: DriverHandle<Ferry>,
}

impl LocalRuntime {
    /// Must be called from within a tokio runtime.
    pub fn start<C: ConfigProvider>(config: &C) -> Self {
        Self::start_with(
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingDispatcher::new()),
            config,
        )
    }

    pub fn start_with<C: ConfigProvider>(
        store: Arc<MemoryStore>,
        dispatcher: Arc<RecordingDispatcher>,
        config: &C,
    ) -> Self {
        let assigner = Arc::new(CargoAssigner::from_config(store.clone(), config));
        let checker = Arc::new(ReadinessChecker::from_config(
            store.clone(),
            dispatcher.clone(),
            config,
        ));

        let cars = StreamDriver::new(
            "car",
            assigner,
            config.car_stream().clone(),
            StreamFilter::inserts(),
        )
        .spawn(store.subscribe_cars());

        let ferries = StreamDriver::new(
            "ferry",
            checker,
            config.ferry_stream().clone(),
            StreamFilter::for_events(&[EventName::Insert, EventName::Modify])
                .with_field("stat", FerryState::Loading.as_str()),
        )
        .spawn(store.subscribe_ferries());

        Self {
            store,
            dispatcher,
            cars,
            ferries,
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<RecordingDispatcher> {
        &self.dispatcher
    }

    pub async fn put_cars(&self, cars: &[Car]) -> Result<()> {
        self.store.put_cars(cars).await
    }

    /// Wait until every published notification has been settled.
    pub async fn wait_until_idle(&self, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        loop {
            if self.store.pending_notifications() == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FerryError::store(format!(
                    "{} notifications still pending after {:?}",
                    self.store.pending_notifications(),
                    limit
                )));
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn car_dead_letters(&self) -> Vec<DeadLetter<Car>> {
        self.cars.dead_letters()
    }

    pub fn ferry_dead_letters(&self) -> Vec<DeadLetter<Ferry>> {
        self.ferries.dead_letters()
    }

    pub fn summary(&self) -> Result<LoadSummary> {
        let cargo = self.store.cargo()?;
        let mut per_ferry: HashMap<FerryId, usize> = HashMap::new();
        for record in &cargo {
            *per_ferry.entry(record.ferry_id.clone()).or_default() += 1;
        }

        let ferries: Vec<FerrySummary> = self
            .store
            .ferries()?
            .into_iter()
            .map(|f| FerrySummary {
                cargo_count: per_ferry.get(&f.id).copied().unwrap_or(0),
                id: f.id,
                state: f.state,
                size: f.size,
            })
            .collect();

        let dead_letters = self
            .car_dead_letters()
            .into_iter()
            .filter_map(|d| d.record.new_image.map(|car| car.link))
            .chain(
                self.ferry_dead_letters()
                    .into_iter()
                    .filter_map(|d| d.record.new_image.map(|f| f.id.to_string())),
            )
            .collect();

        Ok(LoadSummary {
            total_size: ferries.iter().map(|f| f.size).sum(),
            cargo_count: cargo.len(),
            ferries,
            ready_signals: self.dispatcher.ready_ferries(),
            dead_letters,
        })
    }

    pub async fn shutdown(self) {
        self.store.close_feeds();
        self.cars.join().await;
        self.ferries.join().await;
    }
}
