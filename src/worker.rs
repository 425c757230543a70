//! The worker side of the broker protocol.
//!
//! A worker dials the pool's broker port with a [Replier] and answers `run_function` requests.
//! Every request is handled on its own task so a slow function never holds up the others.
use std::sync::Arc;

use log::{debug, error, warn};

use crate::socket::{ReplyHandle, Replier, SocketError};
use crate::types::Order;
use crate::wire::{Envelope, FunctionResult, FunctionTask, RUN_FUNCTION};

/// Dials the broker of a pool at `host:port`.
pub async fn connect(host: &str, port: u16) -> Result<Replier, SocketError> {
    Replier::new(host, port, true).await
}

async fn answer(handle: ReplyHandle, result: FunctionResult) {
    if let Err(e) = handle.reply(&result).await {
        if !e.is_closed() {
            warn!("WORKER: Failed to reply: {}", e);
        }
    }
}

/// Answers function calls with `handler` until `replier` is closed.
pub async fn serve<F>(replier: Arc<Replier>, handler: F)
where
    F: Fn(FunctionTask) -> Result<Vec<Order>, String> + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    loop {
        let (envelope, handle) = match replier.receive::<Envelope>().await {
            Ok(request) => request,
            Err(SocketError::Closed) => break,
            Err(SocketError::Malformed { source, handle }) => {
                answer(handle, FunctionResult::error(source.to_string())).await;
                continue;
            }
            Err(e) => {
                error!("WORKER: Receive failed: {}", e);
                continue;
            }
        };

        if envelope.task != RUN_FUNCTION {
            answer(handle, FunctionResult::error(format!("unknown task {}", envelope.task))).await;
            continue;
        }
        let task: FunctionTask = match envelope.parse() {
            Ok(task) => task,
            Err(e) => {
                answer(handle, FunctionResult::error(e.to_string())).await;
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            debug!("WORKER: Running {} for {:?}", task.function, task.symbols);
            let result = match handler(task) {
                Ok(orders) => FunctionResult::orders(orders),
                Err(reason) => FunctionResult::error(reason),
            };
            answer(handle, result).await;
        });
    }
    debug!("WORKER: Stopped");
}
