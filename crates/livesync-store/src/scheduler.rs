//! Flush schedulers for the coalescing store.
//!
//! The store asks its scheduler to run one flush task per burst. Which
//! scheduler is plugged in decides the coalescing window.

use parking_lot::Mutex;
use std::time::Duration;
use tracing::debug;

/// Deferred flush task.
pub type FlushTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs a flush task at some later point.
pub trait FlushScheduler: Send + Sync {
    fn schedule(&self, task: FlushTask);
}

/// Flushes one window after the first update of a burst.
pub struct TokioScheduler {
    window: Duration,
}

impl TokioScheduler {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new(Duration::from_millis(16))
    }
}

impl FlushScheduler for TokioScheduler {
    fn schedule(&self, task: FlushTask) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let window = self.window;
                handle.spawn(async move {
                    tokio::time::sleep(window).await;
                    task();
                });
            }
            Err(_) => {
                // Outside a runtime there is nothing to defer to.
                debug!("No tokio runtime, flushing inline");
                task();
            }
        }
    }
}

/// Holds tasks until `run_pending` is called.
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<Vec<FlushTask>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every queued task. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl FlushScheduler for ManualScheduler {
    fn schedule(&self, task: FlushTask) {
        self.tasks.lock().push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_manual_scheduler_defers_until_run() {
        let scheduler = ManualScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        scheduler.schedule(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 1);

        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.run_pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_waits_one_window() {
        let scheduler = TokioScheduler::new(Duration::from_millis(16));
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        scheduler.schedule(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
