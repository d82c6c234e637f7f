//! Durable queue seam and the in-process backend.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{LogAlertError, Result};

/// Boxed future returned by [`QueueBackend`] methods.
pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Key/value store with expiry plus list operations.
pub trait QueueBackend: Send + Sync + fmt::Debug {
    /// Stores `value` under `key` for `ttl`.
    fn set_with_expiry<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> QueueFuture<'a, ()>;

    /// Reads `key` if it exists and has not expired.
    fn get<'a>(&'a self, key: &'a str) -> QueueFuture<'a, Option<String>>;

    /// Pushes `value` onto the head of `list`.
    fn list_push<'a>(&'a self, list: &'a str, value: String) -> QueueFuture<'a, ()>;

    /// Pops from the tail of `list`, waiting up to `timeout`.
    fn list_blocking_pop<'a>(&'a self, list: &'a str, timeout: Duration) -> QueueFuture<'a, Option<String>>;

    /// Checks connectivity.
    fn ping(&self) -> QueueFuture<'_, ()>;
}

#[derive(Debug, Default)]
struct QueueState {
    values: HashMap<String, (String, Instant)>,
    lists: HashMap<String, VecDeque<String>>,
}

/// Process-local [`QueueBackend`].
///
/// Lists are FIFO: pushes go to the head, pops come from the tail. Expired
/// values are dropped on read of their key and swept on every write. [`InMemoryQueue::set_available`]
/// simulates an unreachable backend.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    pushed: Arc<Notify>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles simulated connectivity.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of messages waiting in `list`.
    #[must_use]
    pub fn list_len(&self, list: &str) -> usize {
        self.state.lock().lists.get(list).map_or(0, VecDeque::len)
    }

    /// Number of stored values, including expired ones not yet swept.
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.state.lock().values.len()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LogAlertError::Queue("queue backend unavailable".to_string()));
        }
        Ok(())
    }

    fn try_pop(&self, list: &str) -> Option<String> {
        self.state.lock().lists.get_mut(list).and_then(VecDeque::pop_back)
    }
}

impl QueueBackend for InMemoryQueue {
    fn set_with_expiry<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            let now = Instant::now();
            let mut state = self.state.lock();
            state.values.retain(|_, (_, expires)| *expires > now);
            state.values.insert(key.to_string(), (value, now + ttl));
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> QueueFuture<'a, Option<String>> {
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.lock();
            let expired = state
                .values
                .get(key)
                .is_some_and(|(_, expires)| *expires <= Instant::now());
            if expired {
                state.values.remove(key);
                return Ok(None);
            }
            Ok(state.values.get(key).map(|(value, _)| value.clone()))
        })
    }

    fn list_push<'a>(&'a self, list: &'a str, value: String) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            self.state
                .lock()
                .lists
                .entry(list.to_string())
                .or_default()
                .push_front(value);
            self.pushed.notify_waiters();
            Ok(())
        })
    }

    fn list_blocking_pop<'a>(&'a self, list: &'a str, timeout: Duration) -> QueueFuture<'a, Option<String>> {
        Box::pin(async move {
            self.check()?;
            let deadline = Instant::now() + timeout;
            loop {
                let notified = self.pushed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(value) = self.try_pop(list) {
                    return Ok(Some(value));
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(self.try_pop(list));
                }
                self.check()?;
            }
        })
    }

    fn ping(&self) -> QueueFuture<'_, ()> {
        Box::pin(async move { self.check() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = "alerts";

    #[tokio::test]
    async fn list_is_fifo() {
        let queue = InMemoryQueue::new();
        queue.list_push(LIST, "a".to_string()).await.expect("push");
        queue.list_push(LIST, "b".to_string()).await.expect("push");
        let first = queue.list_blocking_pop(LIST, Duration::from_millis(10)).await.expect("pop");
        let second = queue.list_blocking_pop(LIST, Duration::from_millis(10)).await.expect("pop");
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(second.as_deref(), Some("b"));
        assert_eq!(queue.list_len(LIST), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pop_times_out_empty() {
        let queue = InMemoryQueue::new();
        let popped = queue.list_blocking_pop(LIST, Duration::from_secs(5)).await.expect("pop");
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = InMemoryQueue::new();
        let producer = queue.clone();
        let waiter = tokio::spawn(async move {
            queue.list_blocking_pop(LIST, Duration::from_secs(5)).await
        });
        tokio::task::yield_now().await;
        producer.list_push(LIST, "late".to_string()).await.expect("push");
        let popped = waiter.await.expect("join").expect("pop");
        assert_eq!(popped.as_deref(), Some("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire() {
        let queue = InMemoryQueue::new();
        queue
            .set_with_expiry("k", "v".to_string(), Duration::from_secs(60))
            .await
            .expect("set");
        assert_eq!(queue.get("k").await.expect("get").as_deref(), Some("v"));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(queue.get("k").await.expect("get"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_sweep_expired_values() {
        let queue = InMemoryQueue::new();
        for i in 0..1000 {
            queue
                .set_with_expiry(&format!("k{i}"), "v".to_string(), Duration::from_millis(1))
                .await
                .expect("set");
        }
        assert_eq!(queue.value_count(), 1000);

        tokio::time::advance(Duration::from_millis(20)).await;
        queue
            .set_with_expiry("fresh", "v".to_string(), Duration::from_secs(60))
            .await
            .expect("set");
        assert_eq!(queue.value_count(), 1);
        assert_eq!(queue.get("fresh").await.expect("get").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn unavailable_backend_errors() {
        let queue = InMemoryQueue::new();
        queue.set_available(false);
        assert!(matches!(queue.ping().await, Err(LogAlertError::Queue(_))));
        assert!(queue.list_push(LIST, "x".to_string()).await.is_err());
        queue.set_available(true);
        assert!(queue.ping().await.is_ok());
    }
}
