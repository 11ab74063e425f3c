//! Command and result queues shared across the controller/worker boundary.
//!
//! A [`Channel`] is an unbounded FIFO that any number of handles may push to
//! and pop from. Receivers park on a [`Notify`] instead of polling, so an idle
//! consumer costs nothing and timeouts are expressed with `tokio::time`.
//!
//! The channels outlive any single worker: after a scan the worker process is
//! replaced and the new one is bound to the same pair.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::protocol::{Command, ScanResult};

struct Inner<T> {
    queue: Mutex<VecDeque<T>>,
    ready: Notify,
}

/// Unbounded FIFO queue with async receive.
pub struct Channel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("len", &self.len()).finish()
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Channel<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                ready: Notify::new(),
            }),
        }
    }

    /// Enqueue a value. Never blocks.
    pub fn send(&self, value: T) {
        self.inner.queue.lock().push_back(value);
        self.inner.ready.notify_one();
    }

    /// Pop the oldest value if one is queued.
    pub fn try_recv(&self) -> Option<T> {
        self.inner.queue.lock().pop_front()
    }

    /// Wait for the next value.
    ///
    /// Cancel safe: a value is only removed from the queue in the same poll
    /// that returns it.
    pub async fn recv(&self) -> T {
        loop {
            if let Some(value) = self.try_recv() {
                return value;
            }
            self.inner.ready.notified().await;
        }
    }

    /// Wait for the next value until `cancel` fires.
    pub async fn recv_until(&self, cancel: &CancellationToken) -> Option<T> {
        tokio::select! {
            value = self.recv() => Some(value),
            _ = cancel.cancelled() => None,
        }
    }

    /// Wait at most `timeout` for the next value.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }

    /// Remove and return everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        self.inner.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }
}

/// The two unidirectional queues linking controller and worker.
#[derive(Debug, Clone, Default)]
pub struct ChannelPair {
    /// Controller → worker.
    pub commands: Channel<Command>,
    /// Worker → controller.
    pub results: Channel<ScanResult>,
}

impl ChannelPair {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing is waiting in either direction.
    pub fn is_idle(&self) -> bool {
        self.commands.is_empty() && self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let ch = Channel::new();
        ch.send(1);
        ch.send(2);
        ch.send(3);
        assert_eq!(ch.try_recv(), Some(1));
        assert_eq!(ch.try_recv(), Some(2));
        assert_eq!(ch.try_recv(), Some(3));
        assert_eq!(ch.try_recv(), None);
    }

    #[test]
    fn test_drain_empties_queue() {
        let ch = Channel::new();
        ch.send("a");
        ch.send("b");
        let drained = ch.drain();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(ch.is_empty());
        assert!(ch.drain().is_empty());
    }

    #[tokio::test]
    async fn test_recv_waits_for_send() {
        let ch = Channel::new();
        let producer = ch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.send(42u32);
        });
        let value = tokio::time::timeout(Duration::from_secs(1), ch.recv())
            .await
            .expect("recv should wake on send");
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_recv_timeout_elapses_on_empty_channel() {
        let ch: Channel<u8> = Channel::new();
        assert_eq!(ch.recv_timeout(Duration::from_millis(10)).await, None);
    }

    #[tokio::test]
    async fn test_recv_until_cancelled() {
        let ch: Channel<u8> = Channel::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(ch.recv_until(&cancel).await, None);
    }

    #[tokio::test]
    async fn test_timed_out_recv_does_not_lose_values() {
        let ch = Channel::new();
        assert_eq!(ch.recv_timeout(Duration::from_millis(5)).await, None);
        ch.send(7);
        ch.send(8);
        assert_eq!(ch.recv().await, 7);
        assert_eq!(ch.recv().await, 8);
    }

    #[test]
    fn test_pair_is_idle() {
        let pair = ChannelPair::new();
        assert!(pair.is_idle());
        pair.results.send(ScanResult::StopLivePlotting);
        assert!(!pair.is_idle());
        pair.results.drain();
        assert!(pair.is_idle());
    }
}
