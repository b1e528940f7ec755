use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Cancellation handle for one periodic task.
///
/// [`TaskHandle::cancel`] is idempotent and returns only once the task has
/// stopped, so no tick runs after it resolves. Dropping an uncancelled handle
/// aborts the task without waiting.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    cancelled: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_none()
    }

    /// Stops the task and waits for it to wind down.
    pub async fn cancel(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.cancelled.store(true, Ordering::Release);
        handle.abort();
        // Resolves once the task future has been dropped
        let _ = handle.await;
        debug!(task = %self.name, "Periodic task cancelled");
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancelled.store(true, Ordering::Release);
            handle.abort();
        }
    }
}

/// Spawns `tick` every `period`, starting one period from now.
///
/// Ticks run sequentially within the task; a slow tick delays the next one
/// instead of piling up.
pub fn spawn_periodic<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    let task_name = name.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if flag.load(Ordering::Acquire) {
                break;
            }
            tick().await;
        }
        debug!(task = %task_name, "Periodic task exited");
    });

    TaskHandle {
        name,
        cancelled,
        handle: Some(handle),
    }
}

/// Cancels every handle in `handles`, draining the collection.
pub async fn cancel_all(handles: &mut Vec<TaskHandle>) {
    for mut handle in handles.drain(..) {
        handle.cancel().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(period: Duration) -> (TaskHandle, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = spawn_periodic("counter", period, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (handle, count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_period() {
        let (_handle, count) = counting_task(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tick_after_cancel() {
        let (mut handle, count) = counting_task(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(3500)).await;
        handle.cancel().await;
        let at_cancel = count.load(Ordering::SeqCst);
        assert_eq!(at_cancel, 3);
        assert!(handle.is_cancelled());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_cancel);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let (mut handle, _count) = counting_task(Duration::from_secs(1));
        handle.cancel().await;
        handle.cancel().await;
        assert!(handle.is_cancelled());
        assert_eq!(handle.name(), "counter");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts_task() {
        let (handle, count) = counting_task(Duration::from_secs(1));
        drop(handle);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_drains() {
        let (first, first_count) = counting_task(Duration::from_secs(1));
        let (second, second_count) = counting_task(Duration::from_secs(1));
        let mut handles = vec![first, second];
        cancel_all(&mut handles).await;
        assert!(handles.is_empty());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(first_count.load(Ordering::SeqCst), 0);
        assert_eq!(second_count.load(Ordering::SeqCst), 0);
    }
}
