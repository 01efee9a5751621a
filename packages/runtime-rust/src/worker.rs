//! Background worker for periodic and on-demand tasks.
//!
//! [`BackgroundWorker`] owns a spawned tokio task that drives a
//! [`BackgroundRunnable`]: tasks submitted over an mpsc channel run as they
//! arrive, and a tick fires the runnable's periodic work in between. The
//! retransmission sweep and the ack flush both run on this worker.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Submitted tasks waiting for the worker; `submit` applies backpressure
/// beyond this.
const TASK_QUEUE_DEPTH: usize = 256;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Work driven by a [`BackgroundWorker`].
///
/// `run` handles one submitted task, `on_tick` is the periodic duty cycle,
/// and `shutdown` runs once before the worker task exits.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// Task type accepted by [`BackgroundWorker::submit`].
    type Task: Send + 'static;

    /// Processes one submitted task.
    async fn run(&mut self, task: Self::Task);

    /// Periodic work, fired once per tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Final cleanup when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a spawned worker task.
///
/// Dropping the handle without calling [`stop`](Self::stop) leaves the
/// worker running until its channel closes; stop it explicitly when
/// shutdown ordering matters.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tasks: Option<mpsc::Sender<R::Task>>,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker task around `runnable`.
    ///
    /// The first tick fires one full interval after start, so a freshly
    /// started endpoint does not sweep or flush immediately.
    pub fn start(runnable: R, tick_interval: Duration) -> Self {
        let (task_tx, task_rx) = mpsc::channel(TASK_QUEUE_DEPTH);
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(drive(runnable, task_rx, stop_rx, tick_interval));
        Self {
            tasks: Some(task_tx),
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Queues a task for the runnable.
    ///
    /// # Errors
    ///
    /// Fails if the worker has stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tasks {
            Some(tasks) => tasks
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stops the worker and waits for its final cleanup to finish.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.tasks.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn drive<R: BackgroundRunnable>(
    mut runnable: R,
    mut tasks: mpsc::Receiver<R::Task>,
    mut stop: oneshot::Receiver<()>,
    tick_interval: Duration,
) {
    let mut ticks = tokio::time::interval(tick_interval);
    // An overrunning tick delays the next one instead of bursting to
    // catch up.
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick.
    ticks.tick().await;

    loop {
        tokio::select! {
            task = tasks.recv() => {
                match task {
                    Some(task) => runnable.run(task).await,
                    None => break,
                }
            }
            _ = ticks.tick() => runnable.on_tick().await,
            _ = &mut stop => break,
        }
    }

    runnable.shutdown().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default)]
    struct Counters {
        runs: AtomicU32,
        ticks: AtomicU32,
        shutdowns: AtomicU32,
    }

    struct Probe(Arc<Counters>);

    #[async_trait]
    impl BackgroundRunnable for Probe {
        type Task = u64;

        async fn run(&mut self, _task: u64) {
            self.0.runs.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn probe() -> (Probe, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (Probe(Arc::clone(&counters)), counters)
    }

    #[tokio::test]
    async fn submitted_tasks_run_and_stop_invokes_cleanup() {
        let (runnable, counters) = probe();
        let mut worker = BackgroundWorker::start(runnable, Duration::from_secs(60));

        for task in 1u64..=3 {
            worker.submit(task).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 3);
        assert_eq!(
            counters.ticks.load(Ordering::SeqCst),
            0,
            "the first tick is skipped"
        );

        worker.stop().await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ticks_fire_periodically() {
        let (runnable, counters) = probe();
        let mut worker = BackgroundWorker::start(runnable, Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop().await;

        assert!(counters.ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn submit_after_stop_fails() {
        let (runnable, _counters) = probe();
        let mut worker = BackgroundWorker::start(runnable, Duration::from_secs(60));
        worker.stop().await;

        assert!(worker.submit(1).await.is_err());
    }
}
