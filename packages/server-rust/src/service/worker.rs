//! Background worker for channel-fed and periodic tasks.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from an mpsc
//! channel via a `BackgroundRunnable` implementation, with an optional
//! periodic tick. Destination delivery runs on one of these.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Capacity of the task channel; `submit` waits when it is full.
const TASK_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once after the last task. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a spawned worker task.
///
/// The task:
/// 1. Runs `BackgroundRunnable::run()` for each submitted task, in order
/// 2. Calls `BackgroundRunnable::on_tick()` every tick interval
/// 3. Drains already-submitted tasks and calls `shutdown()` when stopped
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Mutex<Option<mpsc::Sender<R::Task>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker. Must be called within a tokio runtime.
    pub fn start(mut runnable: R, tick_interval_ms: u64) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(TASK_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut tick_interval =
                tokio::time::interval(std::time::Duration::from_millis(tick_interval_ms));
            // Skip the first immediate tick so on_tick doesn't fire at startup.
            tick_interval.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = tick_interval.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        rx.close();
                        while let Some(t) = rx.recv().await {
                            runnable.run(t).await;
                        }
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Mutex::new(Some(tx)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            handle: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    /// Submit a task to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stops the worker after it has processed every task submitted so far.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        self.tx.lock().take();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Clone, Default)]
    struct Counters {
        run: Arc<AtomicU32>,
        tick: Arc<AtomicU32>,
        shutdown: Arc<AtomicU32>,
    }

    struct CountingRunnable(Counters);

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = String;

        async fn run(&mut self, _task: String) {
            self.0.run.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.0.tick.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdown.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn stop_drains_submitted_tasks() {
        let counters = Counters::default();
        let worker = BackgroundWorker::start(CountingRunnable(counters.clone()), 60_000);

        for i in 0..3 {
            worker.submit(format!("task-{i}")).await.unwrap();
        }
        worker.stop().await;

        assert_eq!(counters.run.load(Ordering::SeqCst), 3);
        assert_eq!(counters.shutdown.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_fires_periodically() {
        let counters = Counters::default();
        let worker = BackgroundWorker::start(CountingRunnable(counters.clone()), 20);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        worker.stop().await;

        assert!(counters.tick.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn submit_after_stop_returns_error() {
        let worker = BackgroundWorker::start(CountingRunnable(Counters::default()), 60_000);
        worker.stop().await;
        assert!(worker.submit("late-task".to_string()).await.is_err());
    }
}
