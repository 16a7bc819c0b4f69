//! # Runtime
//!
//! The execution context a dataset is materialized in. A runtime owns the
//! [`EngineFactory`] and every engine pool started through it, one pool per
//! processor, created on the first materialization that needs it and kept
//! until [`Runtime::shutdown`].
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use griddle::{Dataset, Runtime, engine::MockEngineFactory, error::ExecutionError};
//! # async fn run(dataset: Dataset) -> Result<(), ExecutionError> {
//! let rows = Runtime::scoped(Arc::new(MockEngineFactory::echo()), |runtime| async move {
//!     dataset.materialize(&runtime).await
//! }).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use crate::config::ProcessorConfig;
use crate::engine::EngineFactory;
use crate::engine::pool::EnginePool;
use crate::error::ExecutionError;

pub struct Runtime {
    id: Uuid,
    factory: Arc<dyn EngineFactory>,
    pools: Mutex<HashMap<Uuid, Arc<EnginePool>>>,
    shut_down: AtomicBool,
}

impl Runtime {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        let id = Uuid::new_v4();
        info!(runtime = %id, "runtime started");
        Self {
            id,
            factory,
            pools: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Runs `body` with a fresh runtime and shuts the runtime down afterwards,
    /// whether `body` succeeded or not.
    pub async fn scoped<F, Fut, T, E>(factory: Arc<dyn EngineFactory>, body: F) -> Result<T, E>
    where
        F: FnOnce(Arc<Runtime>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let runtime = Arc::new(Self::new(factory));
        let result = body(runtime.clone()).await;
        runtime.shutdown().await;
        result
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// The pool serving `processor`, started on first use.
    pub(crate) async fn engine_pool(
        &self,
        processor: Uuid,
        config: &ProcessorConfig,
    ) -> Result<Arc<EnginePool>, ExecutionError> {
        let mut pools = self.pools.lock().await;
        if self.is_shut_down() {
            return Err(ExecutionError::RuntimeShutDown);
        }
        if let Some(pool) = pools.get(&processor) {
            return Ok(pool.clone());
        }

        debug!(runtime = %self.id, %processor, "starting engine pool");
        let pool = Arc::new(EnginePool::start(self.factory.as_ref(), config).await?);
        pools.insert(processor, pool.clone());
        Ok(pool)
    }

    /// Stops every engine pool. Later calls do nothing.
    pub async fn shutdown(&self) {
        let pools: Vec<_> = {
            let mut pools = self.pools.lock().await;
            if self.shut_down.swap(true, Ordering::SeqCst) {
                return;
            }
            pools.drain().map(|(_, pool)| pool).collect()
        };

        for pool in &pools {
            pool.shutdown().await;
        }
        info!(runtime = %self.id, pools = pools.len(), "runtime shut down");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.is_shut_down() {
            return;
        }
        let pools = self.pools.get_mut();
        if !pools.is_empty() {
            warn!(runtime = %self.id, pools = pools.len(), "runtime dropped without shutdown, stopping workers");
        }
        // Dropping the pools tells their workers to stop.
        pools.clear();
    }
}
