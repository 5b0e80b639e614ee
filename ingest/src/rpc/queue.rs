use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::{BatchRpc, RpcCall, RpcError, RpcOperation, RpcTransport, TransportError};

type Reply = oneshot::Sender<Result<Value, RpcError>>;

/// Front end for callers that issue independent single calls.
///
/// Calls are queued on a bounded channel. A flush task drains them into one
/// [`BatchRpc::submit`] whenever `max_batch_size` calls are pending or the
/// flush interval elapses, then answers each caller through its oneshot.
#[derive(Clone)]
pub struct BatchQueue {
    sender: mpsc::Sender<(RpcCall, Reply)>,
}

impl BatchQueue {
    pub fn spawn<T>(
        rpc: Arc<BatchRpc<T>>,
        flush_interval: Duration,
        capacity: usize,
    ) -> (Self, JoinHandle<()>)
    where
        T: RpcTransport + 'static,
    {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(flush_loop(rpc, receiver, flush_interval));
        (Self { sender }, handle)
    }

    pub async fn call(&self, call: RpcCall) -> Result<Value, RpcError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send((call, reply))
            .await
            .map_err(|_| TransportError::Closed)?;
        response.await.map_err(|_| TransportError::Closed)?
    }
}

async fn flush_loop<T>(
    rpc: Arc<BatchRpc<T>>,
    mut receiver: mpsc::Receiver<(RpcCall, Reply)>,
    flush_interval: Duration,
) where
    T: RpcTransport + 'static,
{
    let mut pending = Vec::new();
    let mut ticker =
        tokio::time::interval_at(Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = receiver.recv() => match next {
                Some((call, reply)) => {
                    pending.push(RpcOperation::new(call, reply));
                    if pending.len() >= rpc.max_batch_size() {
                        flush(&rpc, &mut pending);
                    }
                }
                None => {
                    flush(&rpc, &mut pending);
                    break;
                }
            },
            _ = ticker.tick() => flush(&rpc, &mut pending),
        }
    }
    debug!("rpc queue closed");
}

fn flush<T>(rpc: &Arc<BatchRpc<T>>, pending: &mut Vec<RpcOperation<Reply>>)
where
    T: RpcTransport + 'static,
{
    if pending.is_empty() {
        return;
    }
    let operations = std::mem::take(pending);
    let rpc = rpc.clone();
    // Batches run on their own task so the queue keeps accepting calls; the
    // batcher's ceilings bound how many are on the wire.
    tokio::spawn(async move {
        for outcome in rpc.submit(operations).await {
            // The caller may have given up waiting.
            let _ = outcome.token.send(outcome.result);
        }
    });
}
