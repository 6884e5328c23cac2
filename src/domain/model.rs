use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A content-addressed archive waiting to be shipped. Written once by the
/// producer; the loader only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Car {
    pub link: String,
    pub size: u64,
    #[serde(rename = "commP", default)]
    pub comm_p: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub md5: String,
    #[serde(default = "Utc::now")]
    pub inserted_at: DateTime<Utc>,
}

impl Car {
    pub fn new(link: impl Into<String>, size: u64) -> Self {
        Self {
            link: link.into(),
            size,
            comm_p: String::new(),
            url: String::new(),
            md5: String::new(),
            inserted_at: Utc::now(),
        }
    }
}

/// Placement of one car on one ferry. Keyed by (`ferry_id`, `link`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cargo {
    pub ferry_id: FerryId,
    pub link: String,
    pub size: u64,
    pub inserted_at: DateTime<Utc>,
}

impl Cargo {
    pub fn for_car(ferry_id: FerryId, car: &Car, now: DateTime<Utc>) -> Self {
        Self {
            ferry_id,
            link: car.link.clone(),
            size: car.size,
            inserted_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FerryId(String);

impl FerryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Millisecond timestamp prefix plus 64 random bits, so ids sort by
    /// creation time and concurrent workers do not collide.
    pub fn generate(now: DateTime<Utc>) -> Self {
        let suffix: u64 = rand::thread_rng().gen();
        Self(format!("{:013}-{:016x}", now.timestamp_millis(), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FerryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ferry lifecycle. States only move forward, one step at a time:
/// LOADING -> READY -> DEAL_PENDING -> DEAL_PROCESSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FerryState {
    Loading,
    Ready,
    DealPending,
    DealProcessed,
}

impl FerryState {
    pub const ALL: [FerryState; 4] = [
        FerryState::Loading,
        FerryState::Ready,
        FerryState::DealPending,
        FerryState::DealProcessed,
    ];

    pub fn next(self) -> Option<FerryState> {
        match self {
            FerryState::Loading => Some(FerryState::Ready),
            FerryState::Ready => Some(FerryState::DealPending),
            FerryState::DealPending => Some(FerryState::DealProcessed),
            FerryState::DealProcessed => None,
        }
    }

    pub fn can_transition_to(self, to: FerryState) -> bool {
        self.next() == Some(to)
    }

    /// Only LOADING ferries accept cargo.
    pub fn accepts_cargo(self) -> bool {
        matches!(self, FerryState::Loading)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FerryState::Loading => "LOADING",
            FerryState::Ready => "READY",
            FerryState::DealPending => "DEAL_PENDING",
            FerryState::DealProcessed => "DEAL_PROCESSED",
        }
    }
}

impl fmt::Display for FerryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FerryState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        FerryState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown ferry state '{}'", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ferry {
    pub id: FerryId,
    #[serde(rename = "stat")]
    pub state: FerryState,
    pub size: u64,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ferry {
    pub fn new(id: FerryId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: FerryState::Loading,
            size: 0,
            inserted_at: now,
            updated_at: now,
        }
    }

    /// A LOADING ferry below `max_cargo_size` with room left for `incoming`.
    pub fn has_room_for(&self, incoming: u64, max_cargo_size: u64) -> bool {
        self.state.accepts_cargo()
            && self.size < max_cargo_size
            && self
                .size
                .checked_add(incoming)
                .is_some_and(|total| total <= max_cargo_size)
    }
}

/// Result of a conditional write. A failed precondition is expected
/// contention, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    ConditionFailed,
}

impl WriteOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }
}
