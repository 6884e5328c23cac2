//! DynamoDB implementation of [`FerryStore`].
//!
//! Table layout:
//! - ferry: partition key `id`, GSI `indexStat` on `stat`
//! - cargo: partition key `ferryId`, sort key `link`, GSI `indexLink` on `link`
//!
//! Loading a car is one `TransactWriteItems` call with three items:
//! - a claim row in the cargo table keyed by the link alone
//!   (`ferryId = "claim#<link>"`), put with `attribute_not_exists`
//! - the cargo row on the chosen ferry
//! - the ferry size increment, guarded by state and expected size
//!
//! The claim row makes a link loadable once across all ferries, and it can
//! be read back with a strongly consistent `GetItem`, unlike `indexLink`.

use crate::domain::model::{Cargo, Ferry, FerryId, FerryState, WriteOutcome};
use crate::domain::ports::FerryStore;
use crate::utils::error::{FerryError, Result};
use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, SdkError};
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_dynamodb::types::{AttributeValue, Put, TransactWriteItem, Update};
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;

pub const STAT_INDEX: &str = "indexStat";
pub const LINK_INDEX: &str = "indexLink";
const CLAIM_PREFIX: &str = "claim#";

type Item = HashMap<String, AttributeValue>;

pub struct DynamoFerryStore {
    client: Client,
    ferry_table: String,
    cargo_table: String,
}

impl DynamoFerryStore {
    pub fn new(client: Client, ferry_table: impl Into<String>, cargo_table: impl Into<String>) -> Self {
        Self {
            client,
            ferry_table: ferry_table.into(),
            cargo_table: cargo_table.into(),
        }
    }

    /// Build a client from the ambient AWS configuration, optionally pointed
    /// at a local endpoint.
    pub async fn connect(
        region: &str,
        endpoint: Option<&str>,
        ferry_table: &str,
        cargo_table: &str,
    ) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()));
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        tracing::info!(
            "🗄️ DynamoDB store: ferry table {}, cargo table {} ({})",
            ferry_table,
            cargo_table,
            region
        );
        Self::new(Client::new(&shared), ferry_table, cargo_table)
    }
}

fn timestamp(now: DateTime<Utc>) -> AttributeValue {
    AttributeValue::S(now.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn number(value: u64) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

fn sdk_error<E, R>(operation: &str, err: SdkError<E, R>) -> FerryError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    FerryError::store(format!("{} failed: {}", operation, DisplayErrorContext(&err)))
}

fn bad_item(message: String) -> FerryError {
    FerryError::store(format!("unexpected item shape: {}", message))
}

fn get_s<'a>(item: &'a Item, name: &str) -> Result<&'a str> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .map(String::as_str)
        .ok_or_else(|| bad_item(format!("missing string {}", name)))
}

fn get_n(item: &Item, name: &str) -> Result<u64> {
    let raw = item
        .get(name)
        .and_then(|v| v.as_n().ok())
        .ok_or_else(|| bad_item(format!("missing number {}", name)))?;
    raw.parse()
        .map_err(|_| bad_item(format!("{} is not an unsigned integer: {}", name, raw)))
}

fn get_time(item: &Item, name: &str) -> Result<DateTime<Utc>> {
    let raw = get_s(item, name)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| bad_item(format!("{} is not RFC 3339: {}", name, e)))
}

fn ferry_from_item(item: &Item) -> Result<Ferry> {
    Ok(Ferry {
        id: FerryId::new(get_s(item, "id")?),
        state: get_s(item, "stat")?.parse().map_err(bad_item)?,
        size: get_n(item, "size")?,
        inserted_at: get_time(item, "insertedAt")?,
        updated_at: get_time(item, "updatedAt")?,
    })
}

fn ferry_to_item(ferry: &Ferry) -> Item {
    HashMap::from([
        ("id".to_string(), AttributeValue::S(ferry.id.to_string())),
        (
            "stat".to_string(),
            AttributeValue::S(ferry.state.as_str().to_string()),
        ),
        ("size".to_string(), number(ferry.size)),
        ("insertedAt".to_string(), timestamp(ferry.inserted_at)),
        ("updatedAt".to_string(), timestamp(ferry.updated_at)),
    ])
}

fn cargo_from_item(item: &Item) -> Result<Cargo> {
    Ok(Cargo {
        ferry_id: FerryId::new(get_s(item, "ferryId")?),
        link: get_s(item, "link")?.to_string(),
        size: get_n(item, "size")?,
        inserted_at: get_time(item, "insertedAt")?,
    })
}

fn cargo_to_item(cargo: &Cargo) -> Item {
    HashMap::from([
        (
            "ferryId".to_string(),
            AttributeValue::S(cargo.ferry_id.to_string()),
        ),
        ("link".to_string(), AttributeValue::S(cargo.link.clone())),
        ("size".to_string(), number(cargo.size)),
        ("insertedAt".to_string(), timestamp(cargo.inserted_at)),
    ])
}

fn claim_key(link: &str) -> AttributeValue {
    AttributeValue::S(format!("{}{}", CLAIM_PREFIX, link))
}

fn claim_to_item(cargo: &Cargo) -> Item {
    HashMap::from([
        ("ferryId".to_string(), claim_key(&cargo.link)),
        ("link".to_string(), AttributeValue::S(cargo.link.clone())),
        (
            "claimedBy".to_string(),
            AttributeValue::S(cargo.ferry_id.to_string()),
        ),
        ("size".to_string(), number(cargo.size)),
        ("insertedAt".to_string(), timestamp(cargo.inserted_at)),
    ])
}

fn cargo_from_claim(item: &Item) -> Result<Cargo> {
    Ok(Cargo {
        ferry_id: FerryId::new(get_s(item, "claimedBy")?),
        link: get_s(item, "link")?.to_string(),
        size: get_n(item, "size")?,
        inserted_at: get_time(item, "insertedAt")?,
    })
}

/// Why a load transaction was cancelled. Reason codes come in item order:
/// claim, cargo, ferry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cancellation {
    /// Another delivery already loaded this link.
    Claimed,
    /// The ferry moved on or a concurrent transaction touched the same items.
    Contended,
    /// Anything else (throttling, validation), not a lost race.
    Failed,
}

fn classify_cancellation(codes: &[Option<&str>]) -> Cancellation {
    if codes.first().copied().flatten() == Some("ConditionalCheckFailed") {
        return Cancellation::Claimed;
    }
    let lost_race = codes
        .iter()
        .flatten()
        .any(|code| matches!(*code, "ConditionalCheckFailed" | "TransactionConflict"));
    if lost_race {
        Cancellation::Contended
    } else {
        Cancellation::Failed
    }
}

fn build_error(err: impl std::fmt::Display) -> FerryError {
    FerryError::store(format!("invalid DynamoDB request: {}", err))
}

#[async_trait]
impl FerryStore for DynamoFerryStore {
    async fn cargo_for_car(&self, link: &str) -> Result<Option<Cargo>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.cargo_table)
            .key("ferryId", claim_key(link))
            .key("link", AttributeValue::S(link.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| sdk_error("GetItem cargo claim", e))?;

        if let Some(item) = output.item() {
            return cargo_from_claim(item).map(Some);
        }

        // rows loaded before claims existed are only reachable through the index
        let output = self
            .client
            .query()
            .table_name(&self.cargo_table)
            .index_name(LINK_INDEX)
            .key_condition_expression("link = :link")
            .expression_attribute_values(":link", AttributeValue::S(link.to_string()))
            .send()
            .await
            .map_err(|e| sdk_error("Query cargo by link", e))?;

        output
            .items()
            .iter()
            .find(|item| get_s(item, "ferryId").is_ok_and(|id| !id.starts_with(CLAIM_PREFIX)))
            .map(cargo_from_item)
            .transpose()
    }

    async fn open_ferries(&self, max_size_before_load: u64) -> Result<Vec<Ferry>> {
        let mut ferries = Vec::new();
        let mut start_key: Option<Item> = None;

        loop {
            let output = self
                .client
                .query()
                .table_name(&self.ferry_table)
                .index_name(STAT_INDEX)
                .key_condition_expression("#stat = :loading")
                .filter_expression("#size <= :bound")
                .expression_attribute_names("#stat", "stat")
                .expression_attribute_names("#size", "size")
                .expression_attribute_values(
                    ":loading",
                    AttributeValue::S(FerryState::Loading.as_str().to_string()),
                )
                .expression_attribute_values(":bound", number(max_size_before_load))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| sdk_error("Query open ferries", e))?;

            for item in output.items() {
                ferries.push(ferry_from_item(item)?);
            }
            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(ferries)
    }

    async fn get_ferry(&self, id: &FerryId) -> Result<Option<Ferry>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.ferry_table)
            .key("id", AttributeValue::S(id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| sdk_error("GetItem ferry", e))?;

        output.item().map(ferry_from_item).transpose()
    }

    async fn create_ferry(&self, ferry: &Ferry) -> Result<WriteOutcome> {
        let result = self
            .client
            .put_item()
            .table_name(&self.ferry_table)
            .set_item(Some(ferry_to_item(ferry)))
            .condition_expression("attribute_not_exists(id)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(WriteOutcome::Applied),
            Err(err) => match err.into_service_error() {
                PutItemError::ConditionalCheckFailedException(_) => {
                    Ok(WriteOutcome::ConditionFailed)
                }
                other => Err(FerryError::store(format!(
                    "PutItem ferry failed: {}",
                    DisplayErrorContext(&other)
                ))),
            },
        }
    }

    async fn load_cargo(
        &self,
        cargo: &Cargo,
        expected_size: u64,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome> {
        let claim = Put::builder()
            .table_name(&self.cargo_table)
            .set_item(Some(claim_to_item(cargo)))
            .condition_expression("attribute_not_exists(link)")
            .build()
            .map_err(build_error)?;

        let put = Put::builder()
            .table_name(&self.cargo_table)
            .set_item(Some(cargo_to_item(cargo)))
            .condition_expression("attribute_not_exists(link)")
            .build()
            .map_err(build_error)?;

        let update = Update::builder()
            .table_name(&self.ferry_table)
            .key("id", AttributeValue::S(cargo.ferry_id.to_string()))
            .update_expression("SET #size = #size + :inc, updatedAt = :now")
            .condition_expression("#stat = :loading AND #size = :expected")
            .expression_attribute_names("#size", "size")
            .expression_attribute_names("#stat", "stat")
            .expression_attribute_values(":inc", number(cargo.size))
            .expression_attribute_values(":expected", number(expected_size))
            .expression_attribute_values(
                ":loading",
                AttributeValue::S(FerryState::Loading.as_str().to_string()),
            )
            .expression_attribute_values(":now", timestamp(now))
            .build()
            .map_err(build_error)?;

        let result = self
            .client
            .transact_write_items()
            .transact_items(TransactWriteItem::builder().put(claim).build())
            .transact_items(TransactWriteItem::builder().put(put).build())
            .transact_items(TransactWriteItem::builder().update(update).build())
            .send()
            .await;

        match result {
            Ok(_) => Ok(WriteOutcome::Applied),
            Err(err) => match err.into_service_error() {
                TransactWriteItemsError::TransactionCanceledException(cancelled) => {
                    let reasons: Vec<Option<&str>> = cancelled
                        .cancellation_reasons()
                        .iter()
                        .map(|r| r.code())
                        .collect();
                    match classify_cancellation(&reasons) {
                        Cancellation::Claimed => {
                            tracing::debug!("Car {} was already claimed", cargo.link);
                            Ok(WriteOutcome::ConditionFailed)
                        }
                        Cancellation::Contended => {
                            tracing::debug!(
                                "Load of {} onto ferry {} cancelled: {:?}",
                                cargo.link,
                                cargo.ferry_id,
                                reasons
                            );
                            Ok(WriteOutcome::ConditionFailed)
                        }
                        Cancellation::Failed => Err(FerryError::store(format!(
                            "TransactWriteItems cancelled: {:?}",
                            reasons
                        ))),
                    }
                }
                TransactWriteItemsError::TransactionConflictException(_) => {
                    Ok(WriteOutcome::ConditionFailed)
                }
                other => Err(FerryError::store(format!(
                    "TransactWriteItems failed: {}",
                    DisplayErrorContext(&other)
                ))),
            },
        }
    }

    async fn transition(
        &self,
        id: &FerryId,
        from: FerryState,
        to: FerryState,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome> {
        let result = self
            .client
            .update_item()
            .table_name(&self.ferry_table)
            .key("id", AttributeValue::S(id.to_string()))
            .update_expression("SET #stat = :to, updatedAt = :now")
            .condition_expression("#stat = :from")
            .expression_attribute_names("#stat", "stat")
            .expression_attribute_values(":from", AttributeValue::S(from.as_str().to_string()))
            .expression_attribute_values(":to", AttributeValue::S(to.as_str().to_string()))
            .expression_attribute_values(":now", timestamp(now))
            .send()
            .await;

        match result {
            Ok(_) => Ok(WriteOutcome::Applied),
            Err(err) => match err.into_service_error() {
                UpdateItemError::ConditionalCheckFailedException(_) => {
                    Ok(WriteOutcome::ConditionFailed)
                }
                other => Err(FerryError::store(format!(
                    "UpdateItem ferry {} failed: {}",
                    id,
                    DisplayErrorContext(&other)
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ferry_item_mapping() {
        let mut ferry = Ferry::new(FerryId::new("f1"), Utc::now());
        ferry.size = 1234;
        let item = ferry_to_item(&ferry);

        assert_eq!(item["stat"], AttributeValue::S("LOADING".to_string()));
        assert_eq!(item["size"], AttributeValue::N("1234".to_string()));

        let back = ferry_from_item(&item).unwrap();
        assert_eq!(back.id, ferry.id);
        assert_eq!(back.size, 1234);
        assert_eq!(back.state, FerryState::Loading);
    }

    #[test]
    fn test_bad_ferry_item_is_a_store_error() {
        let mut item = ferry_to_item(&Ferry::new(FerryId::new("f1"), Utc::now()));
        item.insert("size".to_string(), AttributeValue::S("big".to_string()));

        let err = ferry_from_item(&item).unwrap_err();
        assert!(matches!(err, FerryError::StoreError { .. }));
    }

    #[test]
    fn test_claim_points_at_the_loading_ferry() {
        let cargo = Cargo {
            ferry_id: FerryId::new("f1"),
            link: "bagbaiera-a".to_string(),
            size: 40,
            inserted_at: Utc::now(),
        };
        let item = claim_to_item(&cargo);

        assert_eq!(item["ferryId"], AttributeValue::S("claim#bagbaiera-a".to_string()));
        let back = cargo_from_claim(&item).unwrap();
        assert_eq!(back.ferry_id, cargo.ferry_id);
        assert_eq!(back.link, cargo.link);
        assert_eq!(back.size, 40);
    }

    #[test]
    fn test_cancellation_reasons_are_classified() {
        assert_eq!(
            classify_cancellation(&[Some("ConditionalCheckFailed"), Some("None"), Some("None")]),
            Cancellation::Claimed
        );
        assert_eq!(
            classify_cancellation(&[Some("None"), Some("None"), Some("ConditionalCheckFailed")]),
            Cancellation::Contended
        );
        assert_eq!(
            classify_cancellation(&[Some("None"), Some("TransactionConflict"), None]),
            Cancellation::Contended
        );
        assert_eq!(
            classify_cancellation(&[Some("None"), Some("None"), Some("ThrottlingError")]),
            Cancellation::Failed
        );
        assert_eq!(classify_cancellation(&[]), Cancellation::Failed);
    }
}
