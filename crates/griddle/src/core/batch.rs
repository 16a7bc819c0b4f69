use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::error::Elapsed;
use tracing::trace;
use super::handler::BatchHandler;

/// Drains `waiting_requests` in batches of at most `batch_size` until
/// `running` is cleared.
///
/// A batch that has been drained is always run to completion, so stopping
/// the loop never strands a request that left the queue. Requests still
/// queued when the loop exits are left for the owner of the queue.
pub async fn batch_inference_loop<BH: BatchHandler>(
    handler: &BH,
    batch_size: usize,
    running: Arc<AtomicBool>,
    notifier: Arc<Notify>,
    waiting_requests: Arc<Mutex<Vec<BH::Request>>>,
) {
    let mut active_input: Option<BH::ModelInput> = None;
    let mut active_requests: Vec<BH::Request> = vec![];

    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        if !should_process(waiting_requests.clone()).await {
            // No work to do, wait for notification or check periodically
            let timeout = timeout_await_notifier(&notifier).await;
            if timeout.is_err() {
                continue;
            }
        }

        let items = drain_possible_requests(batch_size, waiting_requests.clone()).await;
        if items.is_empty() {
            continue;
        }

        trace!(batch = items.len(), "running batch");
        handler.make_batch_input(&mut active_input, &items).await;
        active_requests.extend(items);
        if let Some(input) = active_input.as_ref() {
            let output = handler.infer(input).await;
            handler.handle_outputs(&mut active_requests, &mut active_input, output).await;
        }
    }

    handler.shutdown().await;
}

#[inline]
async fn should_process<T>(waiting_requests: Arc<Mutex<Vec<T>>>) -> bool {
    let waiting = waiting_requests.lock().await;
    !waiting.is_empty()
}

#[inline]
async fn timeout_await_notifier(notifier: &Notify) -> Result<(), Elapsed> {
    tokio::time::timeout(
        Duration::from_millis(100),
        notifier.notified(),
    ).await
}

async fn drain_possible_requests<T>(
    batch_size: usize,
    waiting_requests: Arc<Mutex<Vec<T>>>,
) -> Vec<T> {
    let mut requests = waiting_requests.lock().await;
    let items_to_take = std::cmp::min(batch_size, requests.len());
    requests.drain(0..items_to_take).collect()
}
