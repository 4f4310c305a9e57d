//! Local "I am typing" emitter and remote "peer is typing" flag.
//!
//! Both machines are driven by explicit instants; the runtime owns the clock
//! and polls `deadline()` from its event loop, so no timer can fire against a
//! torn-down session.

use std::time::Duration;

use tokio::time::Instant;

use crate::types::TypingPayload;

/// Transition the caller must broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    /// Emit `typing`.
    Started,
    /// Emit `stopTyping`.
    Stopped,
}

/// `Idle -> Composing -> Idle` emitter for the local composer.
#[derive(Debug, Clone)]
pub struct LocalTyping {
    idle_timeout: Duration,
    deadline: Option<Instant>,
}

impl LocalTyping {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            deadline: None,
        }
    }

    pub fn is_composing(&self) -> bool {
        self.deadline.is_some()
    }

    /// When the composing state lapses, if composing.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Register a keystroke. Only the first keystroke after idle signals.
    pub fn keystroke(&mut self, now: Instant) -> Option<TypingSignal> {
        let started = self.deadline.is_none();
        self.deadline = Some(now + self.idle_timeout);
        started.then_some(TypingSignal::Started)
    }

    /// Return to idle if the deadline has passed.
    pub fn poll_expired(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                Some(TypingSignal::Stopped)
            }
            _ => None,
        }
    }

    /// Leave composing immediately (send, switch, teardown).
    pub fn force_idle(&mut self) -> Option<TypingSignal> {
        self.deadline.take().map(|_| TypingSignal::Stopped)
    }
}

/// Peer typing flag for the active conversation.
#[derive(Debug, Clone)]
pub struct RemoteTyping {
    expiry: Option<Duration>,
    typing: bool,
    deadline: Option<Instant>,
}

impl RemoteTyping {
    /// `expiry` of `None` keeps the flag until an explicit stop event.
    pub fn new(expiry: Option<Duration>) -> Self {
        Self {
            expiry: expiry.filter(|window| !window.is_zero()),
            typing: false,
            deadline: None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Peer started (or is still) typing. Returns `true` if the flag flipped.
    pub fn on_typing(&mut self, now: Instant) -> bool {
        self.deadline = self.expiry.map(|window| now + window);
        let changed = !self.typing;
        self.typing = true;
        changed
    }

    /// Peer stopped typing. Returns `true` if the flag flipped.
    pub fn on_stopped(&mut self) -> bool {
        self.clear()
    }

    /// Clear the flag once the silence window has elapsed.
    pub fn poll_expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => self.clear(),
            _ => false,
        }
    }

    pub fn clear(&mut self) -> bool {
        self.deadline = None;
        let changed = self.typing;
        self.typing = false;
        changed
    }
}

/// Whether an inbound typing event concerns the active conversation and
/// comes from someone other than the local identity.
pub fn is_relevant(
    payload: &TypingPayload,
    active_conversation: Option<&str>,
    local_id: &str,
) -> bool {
    active_conversation == Some(payload.conversation_id.as_str()) && payload.user_id != local_id
}
