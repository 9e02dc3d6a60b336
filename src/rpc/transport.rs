//! `reqwest`-based JSON-RPC 2.0 transport with capped exponential backoff
//! and a global concurrency bound.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::errors::{ErrorContext, IndexerError, InfraError};
use crate::types::ChainId;

use super::RpcClient;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 5;

pub struct ReqwestRpcClient {
    client: reqwest::Client,
    endpoints: HashMap<ChainId, String>,
    semaphore: Arc<Semaphore>,
}

impl ReqwestRpcClient {
    pub fn new(endpoints: HashMap<ChainId, String>, max_concurrency: usize) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .expect("reqwest client builds with default TLS backend"),
            endpoints,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    async fn call_once(&self, url: &str, method: &str, params: &serde_json::Value) -> Result<serde_json::Value, IndexerError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(method, e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(InfraError::Rpc(
                ErrorContext::new(format!("upstream {status}")).with_source(method.to_string()),
            )
            .into());
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| map_reqwest_error(method, e))?;

        if let Some(error) = payload.get("error") {
            return Err(InfraError::Rpc(
                ErrorContext::new(format!("rpc error: {error}")).with_source(method.to_string()),
            )
            .into());
        }

        Ok(payload.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }
}

fn map_reqwest_error(method: &str, err: reqwest::Error) -> IndexerError {
    if err.is_timeout() {
        InfraError::Timeout(ErrorContext::new(err.to_string()).with_source(method.to_string())).into()
    } else {
        InfraError::Rpc(ErrorContext::new(err.to_string()).with_source(method.to_string())).into()
    }
}

#[async_trait]
impl RpcClient for ReqwestRpcClient {
    async fn call(&self, chain_id: ChainId, method: &str, params: serde_json::Value) -> Result<serde_json::Value, IndexerError> {
        let url = self.endpoints.get(&chain_id).ok_or_else(|| {
            IndexerError::from(crate::errors::UserError::Build(ErrorContext::new(format!(
                "no RPC endpoint configured for chain {chain_id}"
            ))))
        })?;

        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");

        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_secs(5))
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 0;
        loop {
            match self.call_once(url, method, &params).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    crate::metrics::RPC_RETRIES.with_label_values(&[method]).inc();
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(5));
                    warn!(method, attempt, ?delay, "rpc call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_retryable() => {
                    return Err(err.escalate());
                }
                Err(err) => return Err(err),
            }
        }
    }
}
