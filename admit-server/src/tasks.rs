use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Outstanding {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the outstanding count when dropped, including during unwind
/// or when the task is cancelled.
#[derive(Debug)]
struct TaskGuard {
    outstanding: Arc<Outstanding>,
}

impl TaskGuard {
    fn register(outstanding: &Arc<Outstanding>) -> Self {
        outstanding.count.fetch_add(1, Ordering::AcqRel);
        Self {
            outstanding: Arc::clone(outstanding),
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.outstanding.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.outstanding.idle.notify_waiters();
        }
    }
}

/// Fire-and-forget task launcher with panic isolation.
///
/// Every spawned task is counted until it finishes, however it finishes, so
/// that shutdown can wait for [`BackgroundTasks::wait_idle`]. A panic inside a
/// task is logged and swallowed.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    outstanding: Arc<Outstanding>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` on the tokio runtime without waiting for it.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Registered before spawning so a concurrent drain cannot see zero first
        let guard = TaskGuard::register(&self.outstanding);
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                report_panic(name, panic);
            }
        });
    }

    /// Run a synchronous `task` on the blocking pool without waiting for it.
    pub fn spawn_blocking<F>(&self, name: &'static str, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = TaskGuard::register(&self.outstanding);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(task)) {
                report_panic(name, panic);
            }
        });
    }

    /// Number of tasks started but not yet finished.
    pub fn outstanding(&self) -> usize {
        self.outstanding.count.load(Ordering::Acquire)
    }

    /// Resolves once no task is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.outstanding.idle.notified();
            tokio::pin!(notified);
            // Register interest before checking, or a wakeup could be missed
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn report_panic(name: &'static str, panic: Box<dyn Any + Send>) {
    let message = panic_message(panic.as_ref());
    tracing::error!(task = name, panic = %message, "background task panicked");
}

/// Text of a panic payload, when it carries any.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn test_count_tracks_running_tasks() {
        let tasks = BackgroundTasks::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        tasks.spawn("waiter", async move {
            let _ = release_rx.await;
        });
        assert_eq!(tasks.outstanding(), 1);

        release_tx.send(()).unwrap();
        tasks.wait_idle().await;
        assert_eq!(tasks.outstanding(), 0);
    }

    async fn explode() {
        panic!("mailer exploded")
    }

    #[tokio::test]
    async fn test_panics_are_contained() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("async-panic", explode());
        tasks.spawn_blocking("blocking-panic", || panic!("{}", String::from("owned payload")));

        tokio::time::timeout(Duration::from_secs(5), tasks.wait_idle())
            .await
            .expect("panicking tasks must still be counted down");
        assert_eq!(tasks.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_concurrent_tasks_return_to_zero() {
        let tasks = BackgroundTasks::new();
        let ran = Arc::new(AtomicUsize::new(0));

        for i in 0..200 {
            let ran = Arc::clone(&ran);
            tasks.spawn("worker", async move {
                tokio::time::sleep(Duration::from_millis(i % 7)).await;
                ran.fetch_add(1, Ordering::SeqCst);
                if i % 10 == 0 {
                    panic!("task {i} failed");
                }
            });
        }
        for _ in 0..20 {
            let ran = Arc::clone(&ran);
            tasks.spawn_blocking("blocking", move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        tasks.wait_idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 220);
        assert_eq!(tasks.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_with_nothing_outstanding() {
        BackgroundTasks::new().wait_idle().await;
    }

    #[tokio::test]
    async fn test_clones_share_the_count() {
        let tasks = BackgroundTasks::new();
        let handle = tasks.clone();
        let (tx, rx) = oneshot::channel::<()>();
        handle.spawn("shared", async move {
            let _ = rx.await;
        });
        assert_eq!(tasks.outstanding(), 1);
        drop(tx);
        tasks.wait_idle().await;
    }
}
