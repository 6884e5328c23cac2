#[cfg(feature = "lambda")]
use ferry_loader::adapters::dynamo_stream::{
    consume_stream_event, BatchItemFailures, DynamoStreamEvent, FromImage,
};
#[cfg(feature = "lambda")]
use ferry_loader::adapters::spade::{HttpDealDispatcher, LogDispatcher};
#[cfg(feature = "lambda")]
use ferry_loader::config::lambda::{ConsumerKind, LambdaConfig};
#[cfg(feature = "lambda")]
use ferry_loader::core::retry::RetryPolicy;
#[cfg(feature = "lambda")]
use ferry_loader::core::stream::{InvocationBudget, StreamHandler, StreamItem};
#[cfg(feature = "lambda")]
use ferry_loader::domain::ports::{ConfigProvider, DealDispatcher};
#[cfg(feature = "lambda")]
use ferry_loader::utils::{logger, validation::Validate};
#[cfg(feature = "lambda")]
use ferry_loader::{Car, CargoAssigner, DynamoFerryStore, Ferry, ReadinessChecker};
#[cfg(feature = "lambda")]
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
#[cfg(feature = "lambda")]
use std::sync::Arc;

/// Stop starting new records this long before the function times out.
#[cfg(feature = "lambda")]
const DEADLINE_MARGIN_MS: u64 = 10_000;

#[cfg(feature = "lambda")]
async fn function_handler<T, H>(
    handler: Arc<H>,
    event: LambdaEvent<DynamoStreamEvent>,
) -> Result<BatchItemFailures, Error>
where
    T: FromImage + StreamItem,
    H: StreamHandler<T>,
{
    let budget =
        InvocationBudget::from_epoch_millis(event.context.deadline.saturating_sub(DEADLINE_MARGIN_MS));
    tracing::info!(
        "Invocation {} with {} stream records",
        event.context.request_id,
        event.payload.records.len()
    );

    match consume_stream_event::<T, H>(handler.as_ref(), &event.payload, &budget).await {
        Ok(response) => Ok(response),
        Err(e) => {
            tracing::error!(
                "❌ Invocation failed: {} (Category: {:?}, Severity: {:?})",
                e,
                e.category(),
                e.severity()
            );
            tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
            Err(e.into())
        }
    }
}

#[cfg(feature = "lambda")]
fn dispatcher(config: &LambdaConfig) -> Result<Arc<dyn DealDispatcher>, Error> {
    let dispatcher: Arc<dyn DealDispatcher> = match &config.spade_endpoint {
        Some(endpoint) => Arc::new(HttpDealDispatcher::new(
            endpoint.as_str(),
            RetryPolicy::from(config.conflict_retry()),
        )?),
        None => {
            tracing::warn!("⚠️ SPADE_ENDPOINT not set, ready ferries are only logged");
            Arc::new(LogDispatcher)
        }
    };
    Ok(dispatcher)
}

#[cfg(feature = "lambda")]
#[tokio::main]
async fn main() -> Result<(), Error> {
    logger::init_lambda_logger();

    let config = LambdaConfig::from_env()?;
    config.validate()?;
    tracing::info!("Starting {} consumer", config.consumer);

    let store = Arc::new(
        DynamoFerryStore::connect(
            &config.region,
            config.dynamo_endpoint.as_deref(),
            &config.ferry_table,
            config.cargo_table.as_deref().unwrap_or_default(),
        )
        .await,
    );

    match config.consumer {
        ConsumerKind::AddCarsToFerry => {
            let handler = Arc::new(CargoAssigner::from_config(store, &config));
            run(service_fn(move |event| {
                function_handler::<Car, _>(handler.clone(), event)
            }))
            .await
        }
        ConsumerKind::SetFerryAsReady => {
            let handler = Arc::new(ReadinessChecker::from_config(
                store,
                dispatcher(&config)?,
                &config,
            ));
            run(service_fn(move |event| {
                function_handler::<Ferry, _>(handler.clone(), event)
            }))
            .await
        }
    }
}
