//! Transcript Aggregator
//!
//! Some backends stream many tiny transcript fragments per second. Forwarding
//! each one makes the browser transcript flicker, so fragments are buffered
//! per role and flushed as one coalesced update after an idle window, or
//! immediately when the backend marks the utterance final.
//!
//! The aggregator is a plain state machine driven by explicit instants. The
//! relay owns the timer and calls [`TranscriptAggregator::flush_expired`]
//! when [`TranscriptAggregator::next_deadline`] passes.

use crate::event::TranscriptRole;
use std::time::Duration;
use tokio::time::Instant;

/// Default idle window before a partial transcript is flushed.
pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(1);

/// Whether a backend's transcripts need coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptMode {
    /// Buffer fragments and flush on idle or finality.
    Coalesce,
    /// The backend already emits complete, well-paced text; forward every update.
    Passthrough,
}

/// One coalesced update ready to be sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFlush {
    pub role: TranscriptRole,
    /// Text added since the previous flush for this role.
    pub delta: String,
    /// Everything accumulated for the current utterance.
    pub text: String,
    pub is_final: bool,
}

#[derive(Debug, Default)]
struct TranscriptBuffer {
    text: String,
    /// Byte offset into `text` up to which content has been flushed.
    flushed: usize,
    deadline: Option<Instant>,
    last_update: Option<Instant>,
}

impl TranscriptBuffer {
    fn take_flush(&mut self, role: TranscriptRole, is_final: bool) -> TranscriptFlush {
        let flush = TranscriptFlush {
            role,
            delta: self.text[self.flushed..].to_string(),
            text: self.text.clone(),
            is_final,
        };
        self.flushed = self.text.len();
        self.deadline = None;
        flush
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Per-role transcript buffers for one connection.
#[derive(Debug)]
pub struct TranscriptAggregator {
    mode: TranscriptMode,
    idle_window: Duration,
    user: TranscriptBuffer,
    assistant: TranscriptBuffer,
}

impl TranscriptAggregator {
    pub fn new(mode: TranscriptMode, idle_window: Duration) -> Self {
        Self {
            mode,
            idle_window,
            user: TranscriptBuffer::default(),
            assistant: TranscriptBuffer::default(),
        }
    }

    pub fn mode(&self) -> TranscriptMode {
        self.mode
    }

    fn buffer_mut(&mut self, role: TranscriptRole) -> &mut TranscriptBuffer {
        match role {
            TranscriptRole::User => &mut self.user,
            TranscriptRole::Assistant => &mut self.assistant,
        }
    }

    /// Appends a fragment. Returns an update if one must be sent right away.
    pub fn push(
        &mut self,
        role: TranscriptRole,
        delta: &str,
        is_final: bool,
        now: Instant,
    ) -> Option<TranscriptFlush> {
        let mode = self.mode;
        let idle_window = self.idle_window;
        let buffer = self.buffer_mut(role);
        buffer.text.push_str(delta);
        buffer.last_update = Some(now);

        if is_final {
            // A final marker with nothing new and nothing buffered carries no information.
            if buffer.text.is_empty() {
                buffer.reset();
                return None;
            }
            let flush = buffer.take_flush(role, true);
            buffer.reset();
            return Some(flush);
        }

        match mode {
            TranscriptMode::Passthrough => Some(buffer.take_flush(role, false)),
            TranscriptMode::Coalesce => {
                buffer.deadline = Some(now + idle_window);
                None
            }
        }
    }

    /// The earliest pending idle deadline across both roles.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.user.deadline, self.assistant.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Flushes every role whose idle window has elapsed by `now`.
    ///
    /// Accumulated text is kept: the utterance continues until a final marker.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<TranscriptFlush> {
        let mut flushes = Vec::new();
        for role in [TranscriptRole::User, TranscriptRole::Assistant] {
            let buffer = self.buffer_mut(role);
            if buffer.deadline.is_some_and(|deadline| deadline <= now) {
                if buffer.flushed < buffer.text.len() {
                    flushes.push(buffer.take_flush(role, false));
                } else {
                    buffer.deadline = None;
                }
            }
        }
        flushes
    }

    /// Drops everything buffered for one role without emitting it.
    pub fn discard(&mut self, role: TranscriptRole) {
        self.buffer_mut(role).reset();
    }

    /// Accumulated text for a role, flushed or not.
    pub fn accumulated(&self, role: TranscriptRole) -> &str {
        match role {
            TranscriptRole::User => &self.user.text,
            TranscriptRole::Assistant => &self.assistant.text,
        }
    }

    pub fn last_update(&self, role: TranscriptRole) -> Option<Instant> {
        match role {
            TranscriptRole::User => self.user.last_update,
            TranscriptRole::Assistant => self.assistant.last_update,
        }
    }

    /// Clears both roles, used on connection close.
    pub fn reset(&mut self) {
        self.user.reset();
        self.assistant.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TranscriptRole::{Assistant, User};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn coalescing() -> TranscriptAggregator {
        TranscriptAggregator::new(TranscriptMode::Coalesce, DEFAULT_IDLE_WINDOW)
    }

    #[test]
    fn test_fragments_coalesce_into_one_flush_after_idle_window() {
        let mut agg = coalescing();
        let t0 = Instant::now();

        assert!(agg.push(Assistant, "Hel", false, t0).is_none());
        assert!(agg.push(Assistant, "lo ", false, t0 + ms(300)).is_none());
        assert!(agg.push(Assistant, "world", false, t0 + ms(700)).is_none());

        // Still inside the window measured from the last fragment.
        assert!(agg.flush_expired(t0 + ms(1500)).is_empty());
        assert_eq!(agg.next_deadline(), Some(t0 + ms(1700)));

        let flushes = agg.flush_expired(t0 + ms(1700));
        assert_eq!(
            flushes,
            vec![TranscriptFlush {
                role: Assistant,
                delta: "Hello world".into(),
                text: "Hello world".into(),
                is_final: false,
            }]
        );
        assert_eq!(agg.next_deadline(), None);
        assert!(agg.flush_expired(t0 + ms(5000)).is_empty());
    }

    #[test]
    fn test_idle_flush_keeps_accumulated_text() {
        let mut agg = coalescing();
        let t0 = Instant::now();
        agg.push(User, "what is", false, t0);
        agg.flush_expired(t0 + ms(1000));

        agg.push(User, " 25 times 8", false, t0 + ms(2000));
        let flushes = agg.flush_expired(t0 + ms(3000));
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].delta, " 25 times 8");
        assert_eq!(flushes[0].text, "what is 25 times 8");
    }

    #[test]
    fn test_final_flushes_immediately_and_resets() {
        let mut agg = coalescing();
        let t0 = Instant::now();
        agg.push(User, "Hel", false, t0);
        agg.push(User, "lo", false, t0 + ms(100));

        let flush = agg.push(User, "", true, t0 + ms(200)).unwrap();
        assert_eq!(flush.text, "Hello");
        assert_eq!(flush.delta, "Hello");
        assert!(flush.is_final);
        assert_eq!(agg.next_deadline(), None);
        assert_eq!(agg.accumulated(User), "");

        agg.push(User, "Next", false, t0 + ms(300));
        let flushes = agg.flush_expired(t0 + ms(1300));
        assert_eq!(flushes[0].text, "Next");
    }

    #[test]
    fn test_final_after_idle_flush_carries_only_new_delta() {
        let mut agg = coalescing();
        let t0 = Instant::now();
        agg.push(Assistant, "Two hundred", false, t0);
        agg.flush_expired(t0 + ms(1000));
        let flush = agg.push(Assistant, ".", true, t0 + ms(1100)).unwrap();
        assert_eq!(flush.delta, ".");
        assert_eq!(flush.text, "Two hundred.");
    }

    #[test]
    fn test_empty_final_with_empty_buffer_is_silent() {
        let mut agg = coalescing();
        assert!(agg.push(User, "", true, Instant::now()).is_none());
    }

    #[test]
    fn test_roles_are_independent() {
        let mut agg = coalescing();
        let t0 = Instant::now();
        agg.push(User, "hi", false, t0);
        agg.push(Assistant, "hello", false, t0 + ms(500));

        let flushes = agg.flush_expired(t0 + ms(1000));
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].role, User);
        assert_eq!(agg.next_deadline(), Some(t0 + ms(1500)));

        agg.discard(Assistant);
        assert_eq!(agg.next_deadline(), None);
        assert_eq!(agg.accumulated(Assistant), "");
        assert_eq!(agg.accumulated(User), "hi");
    }

    #[test]
    fn test_passthrough_forwards_every_update() {
        let mut agg = TranscriptAggregator::new(TranscriptMode::Passthrough, DEFAULT_IDLE_WINDOW);
        let t0 = Instant::now();
        let first = agg.push(Assistant, "Sure. ", false, t0).unwrap();
        assert_eq!(first.text, "Sure. ");
        let second = agg.push(Assistant, "It is 200.", false, t0).unwrap();
        assert_eq!(second.delta, "It is 200.");
        assert_eq!(second.text, "Sure. It is 200.");
        assert_eq!(agg.next_deadline(), None);
    }
}
