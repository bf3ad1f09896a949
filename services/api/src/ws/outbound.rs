//! Bounded per-connection queue of messages waiting for the client socket.
//!
//! When the client falls behind and the queue is full, the oldest queued
//! audio is dropped first; if no audio is queued, the oldest message of any
//! kind goes.

use super::protocol::ServerMessage;
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};
use tracing::warn;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<ServerMessage>,
    closed: bool,
    dropped: u64,
}

/// A single-consumer, drop-oldest outbound queue.
#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueues a message. Returns `false` once the queue is closed.
    pub async fn push(&self, msg: ServerMessage) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        if state.items.len() >= self.capacity {
            let victim = state
                .items
                .iter()
                .position(ServerMessage::is_audio)
                .unwrap_or(0);
            state.items.remove(victim);
            state.dropped += 1;
            warn!(
                capacity = self.capacity,
                dropped_total = state.dropped,
                "Outbound queue full, dropped oldest message"
            );
        }
        state.items.push_back(msg);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Removes every queued audio message, returning how many were dropped.
    pub async fn discard_audio(&self) -> usize {
        let mut state = self.state.lock().await;
        let before = state.items.len();
        state.items.retain(|msg| !msg.is_audio());
        before - state.items.len()
    }

    /// Waits for the next message. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<ServerMessage> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(msg) = state.items.pop_front() {
                    return Some(msg);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stops accepting messages. Already queued messages can still be drained.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_one();
    }

    pub async fn queued(&self) -> usize {
        self.state.lock().await.items.len()
    }

    /// Total messages dropped for lack of space.
    pub async fn dropped(&self) -> u64 {
        self.state.lock().await.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn audio(n: u32) -> ServerMessage {
        ServerMessage::AudioStream {
            audio: n.to_string(),
            format: "pcm".into(),
            sample_rate: 24000,
            channels: 1,
        }
    }

    fn error(message: &str) -> ServerMessage {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OutboundQueue::new(8);
        queue.push(audio(1)).await;
        queue.push(error("a")).await;
        queue.push(audio(2)).await;
        assert_eq!(queue.pop().await, Some(audio(1)));
        assert_eq!(queue.pop().await, Some(error("a")));
        assert_eq!(queue.pop().await, Some(audio(2)));
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest_audio_first() {
        let queue = OutboundQueue::new(3);
        queue.push(error("a")).await;
        queue.push(audio(1)).await;
        queue.push(audio(2)).await;
        queue.push(error("b")).await;

        assert_eq!(queue.queued().await, 3);
        assert_eq!(queue.dropped().await, 1);
        assert_eq!(queue.pop().await, Some(error("a")));
        assert_eq!(queue.pop().await, Some(audio(2)));
        assert_eq!(queue.pop().await, Some(error("b")));
    }

    #[tokio::test]
    async fn test_full_queue_without_audio_drops_oldest() {
        let queue = OutboundQueue::new(2);
        queue.push(error("a")).await;
        queue.push(error("b")).await;
        queue.push(error("c")).await;
        assert_eq!(queue.pop().await, Some(error("b")));
        assert_eq!(queue.pop().await, Some(error("c")));
    }

    #[tokio::test]
    async fn test_discard_audio_keeps_other_messages() {
        let queue = OutboundQueue::new(8);
        queue.push(audio(1)).await;
        queue.push(error("a")).await;
        queue.push(audio(2)).await;
        assert_eq!(queue.discard_audio().await, 2);
        assert_eq!(queue.pop().await, Some(error("a")));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = OutboundQueue::new(8);
        queue.push(error("a")).await;
        queue.close().await;
        assert!(!queue.push(error("b")).await);
        assert_eq!(queue.pop().await, Some(error("a")));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push_and_close() {
        let queue = Arc::new(OutboundQueue::new(8));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut received = vec![];
                while let Some(msg) = queue.pop().await {
                    received.push(msg);
                }
                received
            })
        };
        tokio::task::yield_now().await;
        queue.push(error("a")).await;
        queue.close().await;
        assert_eq!(consumer.await.unwrap(), vec![error("a")]);
    }
}
