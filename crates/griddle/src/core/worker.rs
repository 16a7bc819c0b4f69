//! Module for handling background batch processing tasks.

use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
use tokio::{task::JoinHandle, sync::Notify};
use tracing::warn;

/// A handle for managing a background worker task that performs batch operations.
///
/// This struct provides a convenient way to spawn, manage, and shut down
/// long-running background tasks in the Tokio runtime.
///
/// # Example
///
/// ```ignore
/// use std::sync::atomic::Ordering;
/// use std::time::Duration;
///
/// async fn example() {
///     let mut worker = BatchWorkerHandle::new(|running, notifier| {
///         tokio::spawn(async move {
///             while running.load(Ordering::SeqCst) {
///                 // Process a batch of work, then wait for more
///                 tokio::select! {
///                     _ = notifier.notified() => {},
///                     _ = tokio::time::sleep(Duration::from_secs(5)) => {},
///                 }
///             }
///         })
///     });
///
///     worker.notifier().notify_one();
///
///     // Wait for the task to observe the stop request and exit
///     worker.stop().await;
/// }
/// ```
pub struct BatchWorkerHandle {
    /// Flag indicating whether the background task should continue running
    running: Arc<AtomicBool>,

    /// Handle to the spawned background task, becomes `None` after shutdown is initiated
    handle: Option<JoinHandle<()>>,

    /// Notification mechanism to wake up the background task
    notifier: Arc<Notify>,
}

impl BatchWorkerHandle {
    /// Creates a new `BatchWorkerHandle` by spawning a background task.
    ///
    /// # Parameters
    ///
    /// * `task` - A function that takes a running flag and a notifier, and returns a `JoinHandle`.
    ///   This function is responsible for creating and spawning the actual background task.
    pub fn new<F>(task: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>, Arc<Notify>) -> JoinHandle<()>,
    {
        let running = Arc::new(AtomicBool::new(true));
        let notifier = Arc::new(Notify::new());
        let handle = task(running.clone(), notifier.clone());

        Self {
            running,
            handle: Some(handle),
            notifier,
        }
    }

    /// Returns a clone of the notifier that can be used to wake up the background task.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notifier.clone()
    }

    /// Asks the task to stop and waits until it has exited.
    ///
    /// A task that panicked is logged, not propagated.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.notify_one();

        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "batch worker exited abnormally");
            }
        }
    }

    /// Initiates shutdown without waiting for the task.
    ///
    /// This method:
    /// 1. Sets the running flag to `false`
    /// 2. Notifies the task to wake up (so it can observe that it should stop)
    /// 3. Detaches the task handle so the task finishes on its own
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.notify_one();
        self.handle.take();
    }
}

impl Drop for BatchWorkerHandle {
    /// Ensures the background task is told to stop when the handle is dropped.
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time;

    #[tokio::test]
    async fn test_worker_starts_running() {
        let worker = BatchWorkerHandle::new(|running, _notifier| {
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    time::sleep(Duration::from_millis(10)).await;
                }
            })
        });

        assert!(worker.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_worker_notifies() {
        let notification_count = Arc::new(Mutex::new(0));
        let notification_count_clone = notification_count.clone();

        let worker = BatchWorkerHandle::new(|running, notifier| {
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    notifier.notified().await;
                    let mut count = notification_count_clone.lock().unwrap();
                    *count += 1;
                }
            })
        });

        // Wait a bit to ensure the task is running
        time::sleep(Duration::from_millis(50)).await;

        worker.notifier().notify_one();
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*notification_count.lock().unwrap(), 1);

        worker.notifier().notify_one();
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*notification_count.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_worker_stop_waits_for_exit() {
        let is_shutdown = Arc::new(AtomicBool::new(false));
        let is_shutdown_clone = is_shutdown.clone();

        let mut worker = BatchWorkerHandle::new(|running, notifier| {
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    notifier.notified().await;
                }
                is_shutdown_clone.store(true, Ordering::SeqCst);
            })
        });

        worker.stop().await;

        // No sleep needed: stop joins the task
        assert!(!worker.running.load(Ordering::SeqCst));
        assert!(is_shutdown.load(Ordering::SeqCst));
        assert!(worker.handle.is_none());
    }

    #[tokio::test]
    async fn test_stop_survives_panicking_task() {
        let mut worker = BatchWorkerHandle::new(|_running, _notifier| {
            tokio::spawn(async move {
                panic!("worker blew up");
            })
        });

        worker.stop().await;
        assert!(worker.handle.is_none());
    }

    #[tokio::test]
    async fn test_worker_drop_triggers_shutdown() {
        let is_shutdown = Arc::new(AtomicBool::new(false));
        let is_shutdown_clone = is_shutdown.clone();

        {
            let worker = BatchWorkerHandle::new(|running, notifier| {
                tokio::spawn(async move {
                    while running.load(Ordering::SeqCst) {
                        notifier.notified().await;
                    }
                    is_shutdown_clone.store(true, Ordering::SeqCst);
                })
            });

            worker.notifier().notify_one();
            time::sleep(Duration::from_millis(50)).await;

            // Worker will be dropped here
        }

        time::sleep(Duration::from_millis(100)).await;
        assert!(is_shutdown.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_multiple_shutdowns() {
        let mut worker = BatchWorkerHandle::new(|running, _notifier| {
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    time::sleep(Duration::from_millis(10)).await;
                }
            })
        });

        worker.shutdown();
        worker.shutdown();
        worker.stop().await;

        assert!(!worker.running.load(Ordering::SeqCst));
    }
}
