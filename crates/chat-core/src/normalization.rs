use crate::{
    error::ChatError,
    types::{Notice, SendAck, SessionEvent},
};

/// Send result before normalization into events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Backend accepted the message and returned its final id.
    Delivered { message_id: String },
    /// Send failed with backend error details.
    Failed { error: ChatError },
}

/// Convert a send outcome to a stable `SessionEvent::SendAck`.
pub fn normalize_send_outcome(
    client_txn_id: impl Into<String>,
    outcome: SendOutcome,
) -> SessionEvent {
    let client_txn_id = client_txn_id.into();
    match outcome {
        SendOutcome::Delivered { message_id } => SessionEvent::SendAck(SendAck {
            client_txn_id,
            message_id: Some(message_id),
            error_code: None,
        }),
        SendOutcome::Failed { error } => SessionEvent::SendAck(SendAck {
            client_txn_id,
            message_id: None,
            error_code: Some(error.code),
        }),
    }
}

/// Error notice carrying the backend's message, or `fallback` when the
/// backend gave none.
pub fn error_notice(error: &ChatError, fallback: &str) -> SessionEvent {
    let message = if error.message.trim().is_empty() {
        fallback.to_owned()
    } else {
        error.message.clone()
    };
    SessionEvent::Notice(Notice::error(message))
}

/// Fixed-text error notice, used where the backend detail is not user-facing.
pub fn generic_notice(message: &str) -> SessionEvent {
    SessionEvent::Notice(Notice::error(message))
}

/// Convert a refused command into a `CommandRejected` event.
pub fn rejection(error: ChatError) -> SessionEvent {
    SessionEvent::CommandRejected {
        code: error.code,
        message: error.message,
    }
}
