use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tracing::debug;

/// Coalesces items pushed within one scheduling window into a single flush.
///
/// The first item to land in an empty queue schedules a flush `delay` later;
/// everything pushed before the flush fires is handed over with it, in
/// arrival order. Each dispatcher owns its own `Batcher`, so unrelated
/// dispatchers never see each other's items.
pub struct Batcher<T> {
    queue: Arc<Mutex<Vec<T>>>,
    delay: Duration,
}

impl<T> Batcher<T>
where
    T: Send + 'static,
{
    pub fn new(delay: Duration) -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            delay,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue `item`. `flush` is only used when this item opens a new batch.
    ///
    /// Must be called from within a tokio runtime.
    pub fn batch<F, Fut>(&self, item: T, flush: F)
    where
        F: FnOnce(Vec<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let opens_batch = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.push(item);
            queue.len() == 1
        };
        if !opens_batch {
            return;
        }

        let queue = Arc::clone(&self.queue);
        let delay = self.delay;
        tokio::spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            let items = std::mem::take(&mut *queue.lock().unwrap_or_else(PoisonError::into_inner));
            debug!(size = items.len(), "flushing batch");
            flush(items).await;
        });
    }
}

impl<T> Default for Batcher<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}
