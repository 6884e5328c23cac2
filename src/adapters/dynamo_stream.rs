//! DynamoDB Streams payload as delivered to a Lambda consumer, and the
//! partial-batch response that makes the event source redeliver only the
//! failed records.

use crate::core::stream::{EventName, InvocationBudget, StreamHandler, StreamItem, StreamRecord};
use crate::domain::model::{Car, Ferry, FerryId, FerryState};
use crate::utils::error::{FerryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Attribute value in DynamoDB JSON, e.g. `{"N": "42"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    S(String),
    N(String),
    B(String),
    #[serde(rename = "BOOL")]
    Bool(bool),
    #[serde(rename = "NULL")]
    Null(bool),
    M(HashMap<String, AttributeValue>),
    L(Vec<AttributeValue>),
    SS(Vec<String>),
    NS(Vec<String>),
    BS(Vec<String>),
}

pub type Image = HashMap<String, AttributeValue>;

#[derive(Debug, Clone, Deserialize)]
pub struct DynamoStreamEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<DynamoStreamRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamoStreamRecord {
    #[serde(rename = "eventID", default)]
    pub event_id: String,
    pub event_name: EventName,
    pub dynamodb: StreamRecordData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamRecordData {
    pub sequence_number: String,
    #[serde(default)]
    pub new_image: Option<Image>,
    #[serde(default)]
    pub old_image: Option<Image>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailures {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

impl BatchItemFailures {
    pub fn from_sequence_numbers(sequence_numbers: Vec<String>) -> Self {
        Self {
            batch_item_failures: sequence_numbers
                .into_iter()
                .map(|item_identifier| BatchItemFailure { item_identifier })
                .collect(),
        }
    }
}

pub trait FromImage: Sized {
    fn from_image(image: &Image) -> Result<Self>;
}

fn malformed(message: String) -> FerryError {
    FerryError::StreamRecordError { message }
}

fn string_attr(image: &Image, name: &str) -> Result<Option<String>> {
    match image.get(name) {
        None | Some(AttributeValue::Null(_)) => Ok(None),
        Some(AttributeValue::S(value)) => Ok(Some(value.clone())),
        Some(other) => Err(malformed(format!("attribute {} is not a string: {:?}", name, other))),
    }
}

fn required_string(image: &Image, name: &str) -> Result<String> {
    string_attr(image, name)?.ok_or_else(|| malformed(format!("missing attribute {}", name)))
}

fn required_number(image: &Image, name: &str) -> Result<u64> {
    match image.get(name) {
        Some(AttributeValue::N(value)) => value
            .parse()
            .map_err(|_| malformed(format!("attribute {} is not an unsigned integer: {}", name, value))),
        Some(other) => Err(malformed(format!("attribute {} is not a number: {:?}", name, other))),
        None => Err(malformed(format!("missing attribute {}", name))),
    }
}

fn timestamp_attr(image: &Image, name: &str) -> Result<Option<DateTime<Utc>>> {
    string_attr(image, name)?
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| malformed(format!("attribute {} is not RFC 3339: {}", name, e)))
        })
        .transpose()
}

impl FromImage for Car {
    fn from_image(image: &Image) -> Result<Self> {
        Ok(Car {
            link: required_string(image, "link")?,
            size: required_number(image, "size")?,
            comm_p: string_attr(image, "commP")?.unwrap_or_default(),
            url: string_attr(image, "url")?.unwrap_or_default(),
            md5: string_attr(image, "md5")?.unwrap_or_default(),
            inserted_at: timestamp_attr(image, "insertedAt")?.unwrap_or_else(Utc::now),
        })
    }
}

impl FromImage for Ferry {
    fn from_image(image: &Image) -> Result<Self> {
        let state = required_string(image, "stat")?
            .parse::<FerryState>()
            .map_err(malformed)?;
        let inserted_at = timestamp_attr(image, "insertedAt")?.unwrap_or_else(Utc::now);
        Ok(Ferry {
            id: FerryId::new(required_string(image, "id")?),
            state,
            size: required_number(image, "size")?,
            inserted_at,
            updated_at: timestamp_attr(image, "updatedAt")?.unwrap_or(inserted_at),
        })
    }
}

impl DynamoStreamRecord {
    pub fn decode<T: FromImage>(&self) -> Result<StreamRecord<T>> {
        let decode_image = |image: &Option<Image>| image.as_ref().map(T::from_image).transpose();
        Ok(StreamRecord {
            sequence_number: self.dynamodb.sequence_number.clone(),
            event_name: self.event_name,
            new_image: decode_image(&self.dynamodb.new_image)?,
            old_image: decode_image(&self.dynamodb.old_image)?,
        })
    }
}

/// Decode `event`, run `handler` over the decodable records and build the
/// partial-batch response. Undecodable records are reported as failures
/// rather than dropped. An `Err` fails the whole invocation.
pub async fn consume_stream_event<T, H>(
    handler: &H,
    event: &DynamoStreamEvent,
    budget: &InvocationBudget,
) -> Result<BatchItemFailures>
where
    T: FromImage + StreamItem,
    H: StreamHandler<T>,
{
    let mut records = Vec::with_capacity(event.records.len());
    let mut undecodable = Vec::new();
    for raw in &event.records {
        match raw.decode::<T>() {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::error!(
                    "❌ Cannot decode stream record {}: {}",
                    raw.dynamodb.sequence_number,
                    e
                );
                undecodable.push(raw.dynamodb.sequence_number.clone());
            }
        }
    }

    let outcome = handler.handle_batch(&records, budget).await?;
    tracing::info!(
        "Stream batch of {}: {} processed, {} skipped, {} failed",
        event.records.len(),
        outcome.processed,
        outcome.skipped,
        outcome.failures.len() + undecodable.len()
    );

    let failed: Vec<String> = event
        .records
        .iter()
        .map(|raw| raw.dynamodb.sequence_number.clone())
        .filter(|seq| undecodable.contains(seq) || outcome.failures.contains(seq))
        .collect();
    Ok(BatchItemFailures::from_sequence_numbers(failed))
}
