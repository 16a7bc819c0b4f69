use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, info};
use crate::communication::{Item, QueueItem};
use crate::config::ProcessorConfig;
use crate::core::batch::batch_inference_loop;
use crate::core::worker::BatchWorkerHandle;
use crate::error::{EngineError, ExecutionError};
use crate::protocol::{ChatRequest, Generation};
use super::core_trait::EngineFactory;
use super::handler::{GenerationHandler, GenerationRequest};

/// The pending result of one submitted request.
pub(crate) type PendingGeneration = Item<Result<Generation, EngineError>>;

/// `concurrency` engine replicas draining one shared request queue.
///
/// Each replica runs on its own worker and takes at most `batch_size`
/// requests per engine call.
pub(crate) struct EnginePool {
    waiting_requests: Arc<Mutex<Vec<GenerationRequest>>>,
    workers: Mutex<Vec<BatchWorkerHandle>>,
    notifiers: Vec<Arc<Notify>>,
    closed: AtomicBool,
}

impl EnginePool {
    /// Creates every replica and spawns its worker.
    ///
    /// If any replica fails to start, the ones already running are stopped
    /// before the error is returned.
    pub async fn start(factory: &dyn EngineFactory, config: &ProcessorConfig) -> Result<Self, ExecutionError> {
        let waiting_requests: Arc<Mutex<Vec<GenerationRequest>>> = Arc::new(Mutex::new(vec![]));
        let mut workers: Vec<BatchWorkerHandle> = Vec::with_capacity(config.concurrency());

        for replica in 0..config.concurrency() {
            let engine = match factory.create(config, replica).await {
                Ok(engine) => engine,
                Err(source) => {
                    for worker in workers.iter_mut() {
                        worker.stop().await;
                    }
                    return Err(ExecutionError::EngineStartup { replica, source });
                }
            };

            let batch_size = config.batch_size();
            let worker = BatchWorkerHandle::new({
                let waiting_requests = waiting_requests.clone();
                move |running, notifier| {
                    tokio::spawn(async move {
                        let handler = GenerationHandler::new(engine, replica);
                        batch_inference_loop(&handler, batch_size, running, notifier, waiting_requests).await;
                    })
                }
            });
            workers.push(worker);
        }

        info!(
            model = config.model_source(),
            replicas = workers.len(),
            batch_size = config.batch_size(),
            "engine pool started"
        );

        let notifiers = workers.iter().map(BatchWorkerHandle::notifier).collect();
        Ok(Self {
            waiting_requests,
            workers: Mutex::new(workers),
            notifiers,
            closed: AtomicBool::new(false),
        })
    }

    /// Queues every request and wakes the workers.
    ///
    /// The returned items resolve in any order; each one belongs to the
    /// request at the same index.
    pub async fn submit_all(&self, requests: Vec<ChatRequest>) -> Result<Vec<PendingGeneration>, ExecutionError> {
        let mut pending = Vec::with_capacity(requests.len());
        {
            let mut waiting = self.waiting_requests.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(ExecutionError::RuntimeShutDown);
            }
            for request in requests {
                let (tx, rx) = oneshot::channel();
                waiting.push(QueueItem::new(request, tx));
                pending.push(Item::new(rx));
            }
        }
        debug!(queued = pending.len(), "requests submitted");

        for notifier in &self.notifiers {
            notifier.notify_one();
        }
        Ok(pending)
    }

    /// Drops queued requests nobody is waiting for any more, e.g. the rest of
    /// a run that already failed. Returns how many were dropped.
    pub async fn discard_abandoned(&self) -> usize {
        let mut waiting = self.waiting_requests.lock().await;
        let queued = waiting.len();
        waiting.retain(|request| !request.is_abandoned());
        let discarded = queued - waiting.len();
        if discarded > 0 {
            debug!(discarded, "discarded abandoned requests");
        }
        discarded
    }

    /// Stops every worker, then fails whatever is still queued. Idempotent.
    pub async fn shutdown(&self) {
        {
            let _waiting = self.waiting_requests.lock().await;
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
        }

        let mut workers = self.workers.lock().await;
        for worker in workers.iter_mut() {
            worker.stop().await;
        }
        workers.clear();

        let stranded: Vec<_> = self.waiting_requests.lock().await.drain(..).collect();
        if !stranded.is_empty() {
            debug!(stranded = stranded.len(), "failing queued requests");
        }
        for request in stranded {
            request.respond(Err(EngineError::ShutDown));
        }
        info!("engine pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockEngineFactory, MockStats};
    use crate::protocol::{ChatMessage, SamplingParams};

    fn config(batch_size: usize, concurrency: usize) -> ProcessorConfig {
        ProcessorConfig::builder()
            .model_source("mock")
            .batch_size(batch_size)
            .concurrency(concurrency)
            .build()
            .unwrap()
    }

    fn request(prompt: String) -> ChatRequest {
        ChatRequest::new(vec![ChatMessage::user(prompt)], SamplingParams::default())
    }

    #[tokio::test]
    async fn test_pool_answers_in_submission_order() {
        let factory = MockEngineFactory::echo();
        let pool = EnginePool::start(&factory, &config(4, 2)).await.unwrap();
        assert_eq!(factory.stats().created(), 2);

        let pending = pool.submit_all((0..10).map(|i| request(i.to_string())).collect()).await.unwrap();
        let texts: Vec<String> = futures::future::join_all(pending).await
            .into_iter()
            .map(|r| r.unwrap().unwrap().generated_text)
            .collect();

        assert_eq!(texts, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_respects_batch_size_and_concurrency() {
        let factory = MockEngineFactory::echo();
        let stats: Arc<MockStats> = factory.stats();
        let pool = EnginePool::start(&factory, &config(3, 3)).await.unwrap();

        let pending = pool.submit_all((0..20).map(|i| request(i.to_string())).collect()).await.unwrap();
        futures::future::join_all(pending).await;
        pool.shutdown().await;

        assert_eq!(stats.created(), 3);
        assert_eq!(stats.shut_down(), 3);
        assert_eq!(stats.requests(), 20);
        assert!(stats.max_batch() <= 3);
    }

    #[tokio::test]
    async fn test_failed_replica_start_is_attributed() {
        let factory = MockEngineFactory::echo().failing_on_replica(1);
        let stats = factory.stats();

        let err = EnginePool::start(&factory, &config(2, 3)).await.err().unwrap();

        assert!(matches!(err, ExecutionError::EngineStartup { replica: 1, .. }));
        // replica 0 was started and must have been stopped again
        assert_eq!(stats.created(), 1);
        assert_eq!(stats.shut_down(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_requests_are_discarded() {
        let factory = MockEngineFactory::echo();
        let pool = EnginePool::start(&factory, &config(2, 1)).await.unwrap();
        // stop the worker first so the queue is left alone
        for worker in pool.workers.lock().await.iter_mut() {
            worker.stop().await;
        }

        let mut pending = pool.submit_all((0..4).map(|i| request(i.to_string())).collect()).await.unwrap();
        pending.truncate(1);

        assert_eq!(pool.discard_abandoned().await, 3);
        assert_eq!(pool.discard_abandoned().await, 0);
        assert_eq!(pool.waiting_requests.lock().await.len(), 1);

        pool.shutdown().await;
        assert!(matches!(pending.remove(0).await, Ok(Err(EngineError::ShutDown))));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let factory = MockEngineFactory::echo();
        let pool = EnginePool::start(&factory, &config(2, 1)).await.unwrap();

        pool.shutdown().await;
        pool.shutdown().await;

        let err = pool.submit_all(vec![request("late".into())]).await.err().unwrap();
        assert!(matches!(err, ExecutionError::RuntimeShutDown));
    }
}
