use anyhow::Result;
use ferry_loader::adapters::dynamo_stream::{
    consume_stream_event, BatchItemFailures, DynamoStreamEvent,
};
use ferry_loader::core::stream::InvocationBudget;
use ferry_loader::domain::ports::FerryStore;
use ferry_loader::{Ferry, FerryId, FerryState, MemoryStore, ReadinessChecker, RecordingDispatcher};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_test::assert_ok;

fn ferry_modify_event(id: &str, old_size: u64, new_size: u64) -> Result<DynamoStreamEvent> {
    let image = |size: u64| {
        serde_json::json!({
            "id": { "S": id },
            "stat": { "S": "LOADING" },
            "size": { "N": size.to_string() },
            "insertedAt": { "S": "2023-03-01T10:00:00.000Z" },
            "updatedAt": { "S": "2023-03-01T10:10:00.000Z" }
        })
    };
    Ok(serde_json::from_value(serde_json::json!({
        "Records": [{
            "eventID": "c81e728d9d4c2f636f067f89cc14862c",
            "eventName": "MODIFY",
            "eventVersion": "1.1",
            "eventSource": "aws:dynamodb",
            "awsRegion": "us-west-2",
            "dynamodb": {
                "ApproximateCreationDateTime": 1677664200,
                "Keys": { "id": { "S": id } },
                "NewImage": image(new_size),
                "OldImage": image(old_size),
                "SequenceNumber": "4421584500000000017450439091",
                "SizeBytes": 128,
                "StreamViewType": "NEW_AND_OLD_IMAGES"
            },
            "eventSourceARN": "arn:aws:dynamodb:us-west-2:000000000000:table/ferry/stream/2023-03-01T00:00:00.000"
        }]
    }))?)
}

fn stored_ferry(store: &MemoryStore, id: &str, size: u64) -> Result<Ferry> {
    let inserted: DateTime<Utc> = "2023-03-01T10:00:00Z".parse()?;
    let mut ferry = Ferry::new(FerryId::new(id), inserted);
    ferry.size = size;
    store.put_ferry(ferry.clone())?;
    Ok(ferry)
}

#[tokio::test]
async fn test_ready_consumer_handles_lambda_payload() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let checker = ReadinessChecker::new(store.clone(), dispatcher.clone(), 3000, 3200);
    let ferry = stored_ferry(&store, "1677664200000-00000000000000aa", 3100)?;

    let event = ferry_modify_event(ferry.id.as_str(), 2980, 3100)?;
    let response = consume_stream_event::<Ferry, _>(&checker, &event, &InvocationBudget::unlimited())
        .await?;

    assert_eq!(response, BatchItemFailures::default());
    let stored = store.get_ferry(&ferry.id).await?.expect("ferry stored");
    assert_eq!(stored.state, FerryState::Ready);
    assert_eq!(dispatcher.ready_ferries(), vec![ferry.id.clone()]);

    // the event source delivers the same record again
    let again = assert_ok!(
        consume_stream_event::<Ferry, _>(&checker, &event, &InvocationBudget::unlimited()).await
    );
    assert!(again.batch_item_failures.is_empty());
    let unchanged = store.get_ferry(&ferry.id).await?.expect("ferry stored");
    assert_eq!(unchanged.updated_at, stored.updated_at);
    Ok(())
}

#[tokio::test]
async fn test_failed_signal_is_reported_for_redelivery() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());
    dispatcher.set_failing(true);
    let checker = ReadinessChecker::new(store.clone(), dispatcher.clone(), 3000, 3200);
    let ferry = stored_ferry(&store, "1677664200000-00000000000000bb", 3000)?;

    let event = ferry_modify_event(ferry.id.as_str(), 2960, 3000)?;
    let response = consume_stream_event::<Ferry, _>(&checker, &event, &InvocationBudget::unlimited())
        .await?;

    assert_eq!(
        serde_json::to_value(&response)?,
        serde_json::json!({
            "batchItemFailures": [ { "itemIdentifier": "4421584500000000017450439091" } ]
        })
    );
    Ok(())
}

#[tokio::test]
async fn test_exhausted_budget_fails_whole_batch_untouched() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let checker = ReadinessChecker::new(store.clone(), dispatcher.clone(), 3000, 3200);
    let ferry = stored_ferry(&store, "1677664200000-00000000000000cc", 3100)?;

    let event = ferry_modify_event(ferry.id.as_str(), 2980, 3100)?;
    let expired = InvocationBudget::from_epoch_millis(0);
    let response = consume_stream_event::<Ferry, _>(&checker, &event, &expired).await?;

    assert_eq!(response.batch_item_failures.len(), 1);
    let stored = store.get_ferry(&ferry.id).await?.expect("ferry stored");
    assert_eq!(stored.state, FerryState::Loading);
    assert!(dispatcher.signals().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_overloaded_ferry_fails_the_invocation() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let checker = ReadinessChecker::new(store.clone(), dispatcher, 3000, 3200);
    let ferry = stored_ferry(&store, "1677664200000-00000000000000dd", 3300)?;

    let event = ferry_modify_event(ferry.id.as_str(), 3100, 3300)?;
    let result = consume_stream_event::<Ferry, _>(&checker, &event, &InvocationBudget::unlimited()).await;

    let err = result.expect_err("invariant violation must fail the invocation");
    assert!(!err.is_item_scoped());
    Ok(())
}
