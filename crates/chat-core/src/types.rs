use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ChatError, ChatErrorCategory};

/// Prefix used for locally generated provisional message ids.
pub const PROVISIONAL_ID_PREFIX: &str = "local-";

/// Authenticated user profile, owned by the authentication collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    /// Stable identity id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Display name.
    pub name: String,
    /// Contact address when the backend exposes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
        }
    }
}

/// Uploaded image reference carried by image messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub url: String,
    pub public_id: String,
}

/// Message payload, discriminated on the wire by `messageType`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "messageType", rename_all = "lowercase")]
pub enum MessageBody {
    /// Plain text message.
    Text { text: String },
    /// Image message.
    Image { image: ImageRef },
}

impl MessageBody {
    /// Whether two payloads describe the same logical content.
    ///
    /// Image payloads only compare by kind: a provisional image has no
    /// uploaded url yet.
    pub fn same_content(&self, other: &MessageBody) -> bool {
        match (self, other) {
            (MessageBody::Text { text: a }, MessageBody::Text { text: b }) => a == b,
            (MessageBody::Image { .. }, MessageBody::Image { .. }) => true,
            _ => false,
        }
    }

    /// Short human-readable preview.
    pub fn preview(&self) -> &str {
        match self {
            MessageBody::Text { text } => text,
            MessageBody::Image { .. } => "[image]",
        }
    }
}

/// One chat message, either authoritative (backend id) or provisional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Globally unique id; the only deduplication key.
    #[serde(rename = "_id")]
    pub id: String,
    /// Conversation the message belongs to.
    #[serde(rename = "chatId")]
    pub conversation_id: String,
    /// Sender identity id.
    pub sender: String,
    /// Text or image payload.
    #[serde(flatten)]
    pub body: MessageBody,
    /// Whether the recipient has seen the message.
    #[serde(default)]
    pub seen: bool,
    /// When the recipient saw the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_at: Option<DateTime<Utc>>,
    /// Backend creation time.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a provisional message with a locally generated id.
    pub fn provisional(
        conversation_id: impl Into<String>,
        sender: impl Into<String>,
        body: MessageBody,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("{PROVISIONAL_ID_PREFIX}{}", Uuid::new_v4()),
            conversation_id: conversation_id.into(),
            sender: sender.into(),
            body,
            seen: false,
            seen_at: None,
            created_at,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.id.starts_with(PROVISIONAL_ID_PREFIX)
    }
}

/// Denormalized "latest message" summary on a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LatestMessage {
    pub text: String,
    pub sender: String,
}

/// Conversation between the local identity and one or more peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "users")]
    pub participants: Vec<String>,
    #[serde(default)]
    pub latest_message: Option<LatestMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Messages not yet seen by the viewing identity.
    #[serde(default)]
    pub unseen_count: u64,
}

/// Conversation list row: the conversation plus the peer's profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    #[serde(rename = "_id")]
    pub id: String,
    pub user: Identity,
    #[serde(rename = "chat")]
    pub conversation: Conversation,
}

/// History fetch result: ordered messages plus the peer identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationHistory {
    pub messages: Vec<Message>,
    #[serde(rename = "user")]
    pub peer: Identity,
}

/// Image bytes attached to an outgoing message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingImage {
    pub file_name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Validated send request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub conversation_id: String,
    pub text: Option<String>,
    pub image: Option<OutgoingImage>,
}

impl OutgoingMessage {
    /// Build a send request, or `None` when there is nothing to send.
    ///
    /// Whitespace-only text counts as empty.
    pub fn new(
        conversation_id: impl Into<String>,
        text: Option<String>,
        image: Option<OutgoingImage>,
    ) -> Option<Self> {
        let text = text
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());
        if text.is_none() && image.is_none() {
            return None;
        }

        Some(Self {
            conversation_id: conversation_id.into(),
            text,
            image,
        })
    }

    /// Body used for the provisional row in optimistic mode.
    pub fn provisional_body(&self) -> MessageBody {
        match (&self.image, &self.text) {
            (Some(_), _) => MessageBody::Image {
                image: ImageRef {
                    url: String::new(),
                    public_id: String::new(),
                },
            },
            (None, text) => MessageBody::Text {
                text: text.clone().unwrap_or_default(),
            },
        }
    }
}

/// How sends become visible in the message store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SendMode {
    /// Append only once the backend returns the authoritative message.
    #[default]
    AwaitAck,
    /// Show a provisional row immediately and reconcile it on acknowledgment.
    Optimistic,
}

/// Tuning values for the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Silence after the last keystroke before `stopTyping` is emitted.
    pub typing_idle_ms: u64,
    /// Auto-clear window for the peer typing flag. `None` keeps it until an
    /// explicit stop event.
    pub remote_typing_expiry_ms: Option<u64>,
    pub send_mode: SendMode,
    /// Retention cap for the active conversation's messages.
    pub max_messages: usize,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            typing_idle_ms: 2_000,
            remote_typing_expiry_ms: Some(5_000),
            send_mode: SendMode::AwaitAck,
            max_messages: 1_200,
            command_buffer: 128,
            event_buffer: 512,
        }
    }
}

/// Conversation selection phase of the active session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No conversation selected.
    #[default]
    Idle,
    /// History fetch in flight for the target conversation.
    Loading { conversation_id: String },
    /// History loaded and room joined.
    Active { conversation_id: String },
}

impl SessionPhase {
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            SessionPhase::Idle => None,
            SessionPhase::Loading { conversation_id } | SessionPhase::Active { conversation_id } => {
                Some(conversation_id)
            }
        }
    }

    pub fn is_active_for(&self, conversation_id: &str) -> bool {
        matches!(self, SessionPhase::Active { conversation_id: current } if current == conversation_id)
    }
}

/// Command channel input accepted by the session runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Bind the runtime to an authenticated identity and open the transport.
    SignIn { identity: Identity },
    /// Tear down the session and release the transport.
    SignOut,
    /// Select a conversation, fetching its history.
    SelectConversation { conversation_id: String },
    /// Leave the active conversation.
    DeselectConversation,
    /// Create or resolve a conversation with a recipient, then select it.
    StartConversation { recipient_id: String },
    /// Local composer keystroke.
    Keystroke,
    /// Send text and/or an image to the active conversation.
    SendMessage {
        text: Option<String>,
        image: Option<OutgoingImage>,
    },
    /// Re-fetch the conversation list.
    RefreshConversations,
}

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Non-blocking message for the notification collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Acknowledgement for one `SendMessage` command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Runtime-assigned transaction id.
    pub client_txn_id: String,
    /// Authoritative message id on success.
    pub message_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Event channel output emitted by the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn { identity: Identity },
    SignedOut,
    PhaseChanged { phase: SessionPhase },
    /// History replaced the active sequence.
    HistoryLoaded {
        conversation_id: String,
        peer: Identity,
        message_count: usize,
    },
    /// A new message entered the active sequence.
    ///
    /// `from_peer` messages are the ones a read-receipt collaborator should
    /// mark as seen.
    MessageAppended {
        conversation_id: String,
        message: Message,
        from_peer: bool,
    },
    /// A provisional row was replaced by its authoritative message.
    MessageReconciled {
        provisional_id: String,
        message: Message,
    },
    /// A provisional row was removed after a failed send.
    MessageWithdrawn { provisional_id: String },
    MessagesSeen {
        conversation_id: String,
        message_ids: Vec<String>,
    },
    PeerTyping {
        conversation_id: String,
        typing: bool,
    },
    PresenceChanged { online: Vec<String> },
    ConversationsUpdated {
        conversations: Vec<ConversationSummary>,
    },
    ConversationStarted {
        conversation_id: String,
        recipient_id: String,
    },
    SendAck(SendAck),
    Notice(Notice),
    /// A command was refused before doing any work.
    CommandRejected { code: String, message: String },
}

/// Read-only view of the whole session, published after every change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub identity: Option<Identity>,
    pub phase: SessionPhase,
    pub peer: Option<Identity>,
    pub messages: Vec<Message>,
    /// Provisional ids still awaiting acknowledgment.
    pub pending_ids: Vec<String>,
    pub peer_typing: bool,
    pub composing: bool,
    /// Online identity ids, sorted.
    pub online: Vec<String>,
}

impl SessionSnapshot {
    pub fn message_ids(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.id.as_str()).collect()
    }
}

/// `{ chatId, userId }` payload shared by the typing events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingPayload {
    #[serde(rename = "chatId")]
    pub conversation_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
}

/// Read receipt pushed when a peer views messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeenReceipt {
    #[serde(rename = "chatId")]
    pub conversation_id: String,
    pub seen_by: String,
    #[serde(default)]
    pub message_ids: Vec<String>,
}

/// Events the client emits over the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    JoinChat { conversation_id: String },
    LeaveChat { conversation_id: String },
    Typing(TypingPayload),
    StopTyping(TypingPayload),
}

impl OutboundEvent {
    /// Wire event name.
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::JoinChat { .. } => "joinChat",
            OutboundEvent::LeaveChat { .. } => "leaveChat",
            OutboundEvent::Typing(_) => "typing",
            OutboundEvent::StopTyping(_) => "stopTyping",
        }
    }

    /// Wire payload.
    pub fn payload(&self) -> Value {
        match self {
            OutboundEvent::JoinChat { conversation_id }
            | OutboundEvent::LeaveChat { conversation_id } => Value::String(conversation_id.clone()),
            OutboundEvent::Typing(payload) | OutboundEvent::StopTyping(payload) => {
                serde_json::json!({
                    "chatId": payload.conversation_id,
                    "userId": payload.user_id,
                })
            }
        }
    }
}

/// Handler slot key for inbound transport events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InboundKind {
    NewMessage,
    MessagesSeen,
    Typing,
    StoppedTyping,
    OnlineRoster,
    UserOnline,
    UserOffline,
}

impl InboundKind {
    /// Kinds scoped to the active conversation.
    pub const ROOM: [InboundKind; 4] = [
        InboundKind::NewMessage,
        InboundKind::MessagesSeen,
        InboundKind::Typing,
        InboundKind::StoppedTyping,
    ];

    /// Global presence kinds, held for the identity's lifetime.
    pub const PRESENCE: [InboundKind; 3] = [
        InboundKind::OnlineRoster,
        InboundKind::UserOnline,
        InboundKind::UserOffline,
    ];

    /// Map a wire event name to its handler slot.
    ///
    /// Peers may relay typing under either the raw or the `user*` name.
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "newMessage" => Some(InboundKind::NewMessage),
            "messagesSeen" => Some(InboundKind::MessagesSeen),
            "typing" | "userTyping" => Some(InboundKind::Typing),
            "stopTyping" | "userStoppedTyping" => Some(InboundKind::StoppedTyping),
            "getOnlineUser" => Some(InboundKind::OnlineRoster),
            "userOnline" => Some(InboundKind::UserOnline),
            "userOffline" => Some(InboundKind::UserOffline),
            _ => None,
        }
    }
}

/// Decoded inbound transport event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    NewMessage(Message),
    MessagesSeen(SeenReceipt),
    Typing(TypingPayload),
    StoppedTyping(TypingPayload),
    OnlineRoster(Vec<String>),
    UserOnline(String),
    UserOffline(String),
}

impl InboundEvent {
    pub fn kind(&self) -> InboundKind {
        match self {
            InboundEvent::NewMessage(_) => InboundKind::NewMessage,
            InboundEvent::MessagesSeen(_) => InboundKind::MessagesSeen,
            InboundEvent::Typing(_) => InboundKind::Typing,
            InboundEvent::StoppedTyping(_) => InboundKind::StoppedTyping,
            InboundEvent::OnlineRoster(_) => InboundKind::OnlineRoster,
            InboundEvent::UserOnline(_) => InboundKind::UserOnline,
            InboundEvent::UserOffline(_) => InboundKind::UserOffline,
        }
    }

    /// Decode a named wire event. Unknown names yield `Ok(None)`.
    pub fn decode(name: &str, payload: Value) -> Result<Option<Self>, ChatError> {
        let Some(kind) = InboundKind::from_event_name(name) else {
            return Ok(None);
        };

        let event = match kind {
            InboundKind::NewMessage => InboundEvent::NewMessage(from_payload(name, payload)?),
            InboundKind::MessagesSeen => InboundEvent::MessagesSeen(from_payload(name, payload)?),
            InboundKind::Typing => InboundEvent::Typing(from_payload(name, payload)?),
            InboundKind::StoppedTyping => {
                InboundEvent::StoppedTyping(from_payload(name, payload)?)
            }
            InboundKind::OnlineRoster => InboundEvent::OnlineRoster(from_payload(name, payload)?),
            InboundKind::UserOnline => InboundEvent::UserOnline(identity_id(name, payload)?),
            InboundKind::UserOffline => InboundEvent::UserOffline(identity_id(name, payload)?),
        };
        Ok(Some(event))
    }
}

fn from_payload<T: serde::de::DeserializeOwned>(name: &str, payload: Value) -> Result<T, ChatError> {
    serde_json::from_value(payload).map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Serialization,
            "inbound_decode_error",
            format!("malformed '{name}' payload: {err}"),
        )
    })
}

/// Presence events carry either a bare id or `{ userId }`.
fn identity_id(name: &str, payload: Value) -> Result<String, ChatError> {
    match payload {
        Value::String(id) => Ok(id),
        Value::Object(mut fields) => match fields.remove("userId") {
            Some(Value::String(id)) => Ok(id),
            _ => Err(ChatError::new(
                ChatErrorCategory::Serialization,
                "inbound_decode_error",
                format!("'{name}' payload is missing userId"),
            )),
        },
        other => Err(ChatError::new(
            ChatErrorCategory::Serialization,
            "inbound_decode_error",
            format!("unexpected '{name}' payload: {other}"),
        )),
    }
}
