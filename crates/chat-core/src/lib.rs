//! Core contract of the chat session synchronization engine.
//!
//! This crate defines the command/event protocol, wire payloads, the
//! conversation selection state machine, the deduplicating message store,
//! typing and presence trackers, and the transport/backend abstractions the
//! runtime is built on.

/// Request/response backend abstraction.
pub mod api;
/// Async command/event channel primitives.
pub mod channel;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Deduplicating message sequence for the active conversation.
pub mod message_store;
/// Send outcome and notice normalization.
pub mod normalization;
/// Online identity tracking.
pub mod presence;
/// Backoff policy used by transport reconnect loops.
pub mod retry;
/// Conversation selection state machine.
pub mod state_machine;
/// Event transport abstraction and in-memory implementation.
pub mod transport;
/// Local and remote typing state.
pub mod typing;
/// Protocol types (commands, events, wire payloads).
pub mod types;

pub use api::ChatApi;
pub use channel::{EventEmitter, EventStream, SessionChannelError, SessionChannels};
pub use error::{ChatError, ChatErrorCategory, classify_http_status};
pub use message_store::{AppendOutcome, MessageStore, StoreError};
pub use normalization::{SendOutcome, normalize_send_outcome};
pub use presence::PresenceSet;
pub use retry::ReconnectPolicy;
pub use state_machine::{SelectionTicket, SessionEffect, SessionStateMachine};
pub use transport::{
    EventSink, MemoryTransport, Subscription, SubscriptionRegistry, Transport, TransportLease,
};
pub use typing::{LocalTyping, RemoteTyping, TypingSignal};
pub use types::{
    Conversation, ConversationHistory, ConversationSummary, Identity, ImageRef, InboundEvent,
    InboundKind, LatestMessage, Message, MessageBody, Notice, NoticeLevel, OutboundEvent,
    OutgoingImage, OutgoingMessage, SeenReceipt, SendAck, SendMode, SessionCommand,
    SessionConfig, SessionEvent, SessionPhase, SessionSnapshot, TypingPayload,
};
