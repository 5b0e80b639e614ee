use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    decode_quantity, wire, RateLimiter, RpcCall, RpcError, RpcOperation, RpcOutcome, RpcStats,
    RpcTransport, TransportError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Largest number of operations carried by one wire request.
    pub max_batch_size: usize,
    /// Wire requests allowed in flight at once.
    pub max_concurrency: usize,
    /// Wire requests allowed to start per second, `0` for no limit.
    pub max_requests_per_second: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 400,
            max_concurrency: 10,
            max_requests_per_second: 10,
        }
    }
}

/// Splits submitted operations into wire batches and runs them under the
/// concurrency and rate ceilings. It never retries.
pub struct BatchRpc<T> {
    transport: T,
    max_batch_size: usize,
    // The HTTP client pools connections without bound, so the in-flight
    // ceiling is enforced here.
    in_flight: Arc<Semaphore>,
    limiter: RateLimiter,
    stats: RpcStats,
}

impl<T: RpcTransport> BatchRpc<T> {
    pub fn new(transport: T, config: BatchConfig) -> Self {
        Self {
            transport,
            max_batch_size: config.max_batch_size.max(1),
            in_flight: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            limiter: RateLimiter::per_second(config.max_requests_per_second),
            stats: RpcStats::default(),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn stats(&self) -> &RpcStats {
        &self.stats
    }

    /// Runs every operation and returns their outcomes in input order.
    ///
    /// Groups of up to `max_batch_size` operations share a wire request. A
    /// failed wire request fails every operation of its group with the same
    /// error; other groups are unaffected.
    pub async fn submit<C>(&self, operations: Vec<RpcOperation<C>>) -> Vec<RpcOutcome<C>> {
        if operations.is_empty() {
            return Vec::new();
        }

        let (calls, tokens): (Vec<RpcCall>, Vec<C>) = operations
            .into_iter()
            .map(|op| (op.call, op.token))
            .unzip();

        let groups = calls
            .chunks(self.max_batch_size)
            .map(|group| self.execute(group));
        let results = futures::future::join_all(groups).await;

        tokens
            .into_iter()
            .zip(results.into_iter().flatten())
            .map(|(token, result)| RpcOutcome { token, result })
            .collect()
    }

    /// Issues a single call. It still goes through the admission controls.
    pub async fn call(&self, call: RpcCall) -> Result<Value, RpcError> {
        self.submit(vec![RpcOperation::new(call, ())])
            .await
            .pop()
            .map(|outcome| outcome.result)
            .unwrap_or(Err(RpcError::MissingResponse { index: 0 }))
    }

    /// Current head of the remote chain.
    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let value = self.call(RpcCall::BlockNumber).await?;
        decode_quantity("eth_blockNumber", value)
    }

    async fn execute(&self, group: &[RpcCall]) -> Vec<Result<Value, RpcError>> {
        let Ok(_permit) = self.in_flight.acquire().await else {
            return vec![Err(TransportError::Closed.into()); group.len()];
        };
        self.limiter.acquire().await;

        let started = Instant::now();
        let outcome = match self.transport.send(wire::encode_batch(group)).await {
            Ok(body) => wire::match_responses(body, group.len()),
            Err(e) => Err(e.into()),
        };
        let latency = started.elapsed();
        self.stats.record(group.len(), latency, outcome.is_err());

        match outcome {
            Ok(results) => {
                debug!(
                    operations = group.len(),
                    latency_ms = latency.as_millis() as u64,
                    "rpc batch completed"
                );
                results
            }
            Err(e) => {
                warn!(
                    operations = group.len(),
                    first_method = group.first().map(RpcCall::method).unwrap_or_default(),
                    "rpc batch failed: {e}"
                );
                vec![Err(e); group.len()]
            }
        }
    }
}
