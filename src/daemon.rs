//! Cancellable periodic background tasks.
//!
//! A [`PeriodicTask`] runs one cycle per interval tick on a spawned tokio
//! task until its [`ShutdownHandle`] is shut down or dropped. A failed
//! cycle is logged and the loop continues with the next tick. Shutdown is
//! cooperative: an in-flight cycle completes before the loop exits.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// How long [`ShutdownHandle::shutdown`] waits for the loop to exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PeriodicTask {
    name: String,
    interval: Duration,
}

impl PeriodicTask {
    /// Intervals below 1ms are raised to 1ms.
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Spawn the loop. The first cycle runs immediately.
    pub fn spawn<F, Fut>(self, mut cycle: F) -> ShutdownHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let notify = Arc::new(Notify::new());
        let running = Arc::new(AtomicBool::new(true));

        let shutdown = Arc::clone(&notify);
        let is_running = Arc::clone(&running);
        let name = self.name.clone();
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(task = %name, interval_ms = period.as_millis() as u64, "periodic task started");

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.notified() => break,

                    _ = ticker.tick() => {
                        if !is_running.load(Ordering::SeqCst) {
                            break;
                        }
                        if let Err(e) = cycle().await {
                            tracing::warn!(task = %name, error = %e, "periodic cycle failed");
                        }
                    }
                }
            }

            is_running.store(false, Ordering::SeqCst);
            tracing::info!(task = %name, "periodic task stopped");
        });

        ShutdownHandle {
            name: self.name,
            notify,
            running,
            task: Some(task),
        }
    }
}

/// Handle to a running [`PeriodicTask`]. Dropping it signals the loop to
/// stop without waiting.
pub struct ShutdownHandle {
    name: String,
    notify: Arc<Notify>,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl ShutdownHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal the loop and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.signal();
        let Some(task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(task = %self.name, error = ?e, "periodic task panicked"),
            Err(_) => tracing::error!(task = %self.name, "periodic task did not stop in time"),
        }
    }

    fn signal(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.signal();
        }
    }
}
