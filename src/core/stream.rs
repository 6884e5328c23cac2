//! Change-notification plumbing shared by both consumers.
//!
//! A [`StreamRecord`] is one at-least-once notification from a table's change
//! log. Handlers receive records in batches and answer with a [`BatchOutcome`]
//! listing the records that must be redelivered. Returning `Err` instead fails
//! the whole invocation, and the event source bisects the batch.

use crate::domain::model::{Car, Ferry};
use crate::utils::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventName {
    Insert,
    Modify,
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord<T> {
    pub sequence_number: String,
    pub event_name: EventName,
    pub new_image: Option<T>,
    pub old_image: Option<T>,
}

impl<T> StreamRecord<T> {
    pub fn insert(sequence_number: impl Into<String>, item: T) -> Self {
        Self {
            sequence_number: sequence_number.into(),
            event_name: EventName::Insert,
            new_image: Some(item),
            old_image: None,
        }
    }

    pub fn modify(sequence_number: impl Into<String>, old: T, new: T) -> Self {
        Self {
            sequence_number: sequence_number.into(),
            event_name: EventName::Modify,
            new_image: Some(new),
            old_image: Some(old),
        }
    }
}

/// Table items that can travel on a change stream.
pub trait StreamItem: Clone + Send + Sync + 'static {
    /// Partition key; notifications for one key stay in commit order.
    fn partition_key(&self) -> &str;

    /// String form of a top-level attribute, for equality filters.
    fn field(&self, name: &str) -> Option<String>;
}

impl StreamItem for Car {
    fn partition_key(&self) -> &str {
        &self.link
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "link" => Some(self.link.clone()),
            "size" => Some(self.size.to_string()),
            "commP" => Some(self.comm_p.clone()),
            "url" => Some(self.url.clone()),
            "md5" => Some(self.md5.clone()),
            _ => None,
        }
    }
}

impl StreamItem for Ferry {
    fn partition_key(&self) -> &str {
        self.id.as_str()
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.to_string()),
            "stat" => Some(self.state.to_string()),
            "size" => Some(self.size.to_string()),
            _ => None,
        }
    }
}

/// Event source filter: event names plus an optional equality predicate on
/// the new image. Advisory only; handlers re-check their own preconditions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFilter {
    pub event_names: Vec<EventName>,
    pub field_equals: Option<(String, String)>,
}

impl StreamFilter {
    pub fn inserts() -> Self {
        Self {
            event_names: vec![EventName::Insert],
            field_equals: None,
        }
    }

    pub fn with_field(mut self, field: &str, value: &str) -> Self {
        self.field_equals = Some((field.to_string(), value.to_string()));
        self
    }

    pub fn for_events(events: &[EventName]) -> Self {
        Self {
            event_names: events.to_vec(),
            field_equals: None,
        }
    }

    pub fn matches<T: StreamItem>(&self, record: &StreamRecord<T>) -> bool {
        if !self.event_names.is_empty() && !self.event_names.contains(&record.event_name) {
            return false;
        }
        match (&self.field_equals, &record.new_image) {
            (None, _) => true,
            (Some((field, value)), Some(image)) => image.field(field).as_deref() == Some(value),
            (Some(_), None) => false,
        }
    }
}

/// What one invocation did with its batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub processed: usize,
    pub skipped: usize,
    /// Sequence numbers to redeliver, in delivery order.
    pub failures: Vec<String>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn fail(&mut self, sequence_number: &str) {
        self.failures.push(sequence_number.to_string());
    }
}

/// Wall-clock budget of one invocation. Records not started before it runs
/// out are reported as failures so they get redelivered untouched.
#[derive(Debug, Clone, Copy)]
pub struct InvocationBudget {
    deadline: Instant,
}

impl InvocationBudget {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }

    /// From an absolute deadline in epoch milliseconds, as handed to Lambda functions.
    pub fn from_epoch_millis(deadline_ms: u64) -> Self {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::new(Duration::from_millis(deadline_ms.saturating_sub(now_ms)))
    }

    pub fn unlimited() -> Self {
        Self::new(Duration::from_secs(60 * 60 * 24 * 365))
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_exhausted(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[async_trait]
pub trait StreamHandler<T: StreamItem>: Send + Sync {
    async fn handle_batch(
        &self,
        records: &[StreamRecord<T>],
        budget: &InvocationBudget,
    ) -> Result<BatchOutcome>;
}

/// In-process change log for one table. Publishing happens under the
/// table lock, so records for one key keep commit order.
pub struct ChangeFeed<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<StreamRecord<T>>>>,
    sequence: AtomicU64,
    pending: Arc<AtomicUsize>,
}

impl<T: StreamItem> ChangeFeed<T> {
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
            sequence: AtomicU64::new(0),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Attach the single consumer. Records published before subscribing are dropped.
    pub fn subscribe(&self) -> FeedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut sender) = self.sender.lock() {
            *sender = Some(tx);
        }
        FeedReceiver {
            rx,
            pending: self.pending.clone(),
        }
    }

    pub fn publish(&self, event_name: EventName, old_image: Option<T>, new_image: Option<T>) {
        let Ok(sender) = self.sender.lock() else {
            return;
        };
        let Some(tx) = sender.as_ref() else {
            return;
        };
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let record = StreamRecord {
            sequence_number: format!("{:021}", seq),
            event_name,
            new_image,
            old_image,
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(record).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Records published but not yet settled by the consumer.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

impl<T: StreamItem> Default for ChangeFeed<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FeedReceiver<T> {
    rx: mpsc::UnboundedReceiver<StreamRecord<T>>,
    pending: Arc<AtomicUsize>,
}

impl<T> FeedReceiver<T> {
    pub async fn recv(&mut self) -> Option<StreamRecord<T>> {
        self.rx.recv().await
    }

    pub fn settled_counter(&self) -> Arc<AtomicUsize> {
        self.pending.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{FerryId, FerryState};
    use chrono::Utc;

    fn ferry(state: FerryState, size: u64) -> Ferry {
        let mut ferry = Ferry::new(FerryId::new("f1"), Utc::now());
        ferry.state = state;
        ferry.size = size;
        ferry
    }

    #[test]
    fn test_filter_by_event_and_field() {
        let filter = StreamFilter::for_events(&[EventName::Insert, EventName::Modify])
            .with_field("stat", "LOADING");

        let loading = StreamRecord::insert("1", ferry(FerryState::Loading, 10));
        let ready = StreamRecord::modify(
            "2",
            ferry(FerryState::Loading, 3000),
            ferry(FerryState::Ready, 3000),
        );
        let removed: StreamRecord<Ferry> = StreamRecord {
            sequence_number: "3".to_string(),
            event_name: EventName::Remove,
            new_image: None,
            old_image: Some(ferry(FerryState::DealProcessed, 3000)),
        };

        assert!(filter.matches(&loading));
        assert!(!filter.matches(&ready));
        assert!(!filter.matches(&removed));
    }

    #[test]
    fn test_insert_filter_skips_modifications() {
        let filter = StreamFilter::inserts();
        assert!(filter.matches(&StreamRecord::insert("1", Car::new("bafy1", 10))));
        assert!(!filter.matches(&StreamRecord::modify(
            "2",
            Car::new("bafy1", 10),
            Car::new("bafy1", 11)
        )));
    }

    #[tokio::test]
    async fn test_feed_tracks_pending_records() {
        let feed: ChangeFeed<Car> = ChangeFeed::new();
        feed.publish(EventName::Insert, None, Some(Car::new("dropped", 1)));
        assert_eq!(feed.pending(), 0);

        let mut rx = feed.subscribe();
        feed.publish(EventName::Insert, None, Some(Car::new("bafy1", 1)));
        feed.publish(EventName::Insert, None, Some(Car::new("bafy2", 1)));
        assert_eq!(feed.pending(), 2);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.sequence_number < second.sequence_number);
        assert_eq!(first.new_image.unwrap().link, "bafy1");

        feed.close();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion() {
        let budget = InvocationBudget::new(Duration::from_millis(50));
        assert!(!budget.is_exhausted());
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(budget.is_exhausted());
        assert_eq!(budget.remaining(), Duration::ZERO);
    }
}
