use crate::core::retry::RetryPolicy;
use crate::domain::model::FerryId;
use crate::domain::ports::DealDispatcher;
use crate::utils::error::{FerryError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FerryReadyRequest<'a> {
    ferry_id: &'a str,
}

/// Posts `{"ferryId": ...}` to the deal service once a ferry is READY.
/// Transport errors and 5xx responses are retried; 4xx is not.
pub struct HttpDealDispatcher {
    client: Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl HttpDealDispatcher {
    pub fn new(endpoint: impl Into<String>, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            retry,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post_once(&self, ferry_id: &FerryId) -> std::result::Result<(), Attempt> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&FerryReadyRequest {
                ferry_id: ferry_id.as_str(),
            })
            .send()
            .await
            .map_err(|e| Attempt::Retryable(e.into()))?;

        let status = response.status();
        tracing::debug!("Deal service answered {} for ferry {}", status, ferry_id);
        if status.is_success() {
            return Ok(());
        }

        let err = FerryError::DispatchError {
            message: format!("deal service returned {} for ferry {}", status, ferry_id),
        };
        if status.is_server_error() || status.as_u16() == 429 {
            Err(Attempt::Retryable(err))
        } else {
            Err(Attempt::Final(err))
        }
    }
}

enum Attempt {
    Retryable(FerryError),
    Final(FerryError),
}

#[async_trait]
impl DealDispatcher for HttpDealDispatcher {
    async fn ferry_ready(&self, ferry_id: &FerryId) -> Result<()> {
        // retryable failures are `Err`, final ones ride in the `Ok` arm
        let outcome = self
            .retry
            .retry_async(|attempt| async move {
                match self.post_once(ferry_id).await {
                    Ok(()) => Ok(Ok(())),
                    Err(Attempt::Final(e)) => Ok(Err(e)),
                    Err(Attempt::Retryable(e)) => {
                        tracing::warn!(
                            "⚠️ Notify attempt {} for ferry {} failed: {}",
                            attempt + 1,
                            ferry_id,
                            e
                        );
                        Err(e)
                    }
                }
            })
            .await;

        match outcome {
            Ok(Ok(())) => {
                tracing::info!("📨 Deal service notified for ferry {}", ferry_id);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(FerryError::HttpError(e)) => Err(FerryError::DispatchError {
                message: format!("deal service unreachable for ferry {}: {}", ferry_id, e),
            }),
            Err(e) => Err(e),
        }
    }
}

/// Dispatcher that only logs. Used when no deal service endpoint is configured.
#[derive(Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl DealDispatcher for LogDispatcher {
    async fn ferry_ready(&self, ferry_id: &FerryId) -> Result<()> {
        tracing::info!("🚢 Ferry {} ready for deal making", ferry_id);
        Ok(())
    }
}
