use std::future::Future;

use crate::{
    error::ChatError,
    types::{ConversationHistory, ConversationSummary, Message, OutgoingMessage},
};

/// Request/response backend consumed by the session runtime.
///
/// Futures must be `Send` because the runtime drives each call on its own
/// task and reports the result back to the session loop.
pub trait ChatApi: Send + Sync + 'static {
    /// `GET /chat/{id}/messages`.
    fn fetch_history(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<ConversationHistory, ChatError>> + Send;

    /// `POST /chat/message`; returns the conversation id.
    fn start_conversation(
        &self,
        recipient_id: &str,
    ) -> impl Future<Output = Result<String, ChatError>> + Send;

    /// `POST /chat/send`; returns the authoritative message.
    fn send_message(
        &self,
        message: OutgoingMessage,
    ) -> impl Future<Output = Result<Message, ChatError>> + Send;

    /// `GET /chat/all`.
    fn fetch_conversations(
        &self,
    ) -> impl Future<Output = Result<Vec<ConversationSummary>, ChatError>> + Send;
}
