//! Session runtime for the chat sync engine.
//!
//! `spawn_runtime` starts a single actor task that owns every piece of
//! session state. Backend calls run on spawned tasks and report back to the
//! actor, which checks on resume that the result still applies.

use std::{sync::Arc, time::Duration};

use chat_core::{
    AppendOutcome, ChatApi, ChatError, ConversationHistory, ConversationSummary, EventEmitter,
    EventSink, EventStream, Identity, InboundEvent, InboundKind, LocalTyping, Message,
    MessageStore, OutboundEvent, OutgoingImage, OutgoingMessage, PresenceSet, RemoteTyping,
    SelectionTicket, SendMode, SendOutcome, SessionChannelError, SessionChannels, SessionCommand,
    SessionConfig, SessionEffect, SessionEvent, SessionSnapshot, SessionStateMachine,
    Subscription, Transport, TransportLease, TypingPayload, TypingSignal,
    normalization::{error_notice, generic_notice, rejection},
    normalize_send_outcome, typing,
};
use chrono::Utc;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, info, warn};

pub mod frame;
pub mod http;
pub mod socket;

pub use http::HttpChatApi;
pub use socket::{SocketIoConfig, SocketIoTransport};

const LOAD_FAILED_NOTICE: &str = "Failed to load messages.";
const START_FAILED_NOTICE: &str = "Failed to start chat";
const SEND_FAILED_NOTICE: &str = "Failed to send message";

/// Frontend handle to a running session runtime.
#[derive(Clone, Debug)]
pub struct ChatRuntimeHandle {
    channels: SessionChannels,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
}

impl ChatRuntimeHandle {
    pub async fn send(&self, command: SessionCommand) -> Result<(), SessionChannelError> {
        self.channels.send_command(command).await
    }

    pub fn try_send(&self, command: SessionCommand) -> Result<(), SessionChannelError> {
        self.channels.try_send_command(command)
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Latest published session state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }
}

/// Start the session actor on the current tokio runtime.
///
/// The actor stops, signing out and releasing the transport, once every
/// handle has been dropped.
pub fn spawn_runtime<A, T>(
    api: Arc<A>,
    transport: Arc<T>,
    config: SessionConfig,
) -> ChatRuntimeHandle
where
    A: ChatApi,
    T: Transport,
{
    let (channels, command_rx) = SessionChannels::new(config.command_buffer, config.event_buffer);
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
    let runtime = ChatRuntime::new(
        api,
        transport,
        config,
        channels.emitter(),
        command_rx,
        snapshot_tx,
    );
    tokio::spawn(runtime.run());

    ChatRuntimeHandle {
        channels,
        snapshot_rx,
    }
}

#[derive(Debug)]
struct PendingSend {
    client_txn_id: String,
    conversation_id: String,
    provisional_id: Option<String>,
}

enum Completion {
    History {
        ticket: SelectionTicket,
        result: Result<ConversationHistory, ChatError>,
    },
    ConversationStarted {
        identity_id: String,
        recipient_id: String,
        result: Result<String, ChatError>,
    },
    Sent {
        pending: PendingSend,
        result: Result<Message, ChatError>,
    },
    Conversations {
        identity_id: String,
        result: Result<Vec<ConversationSummary>, ChatError>,
    },
}

struct SignedIn<T: Transport> {
    identity: Identity,
    lease: TransportLease<T>,
    presence_subscriptions: Vec<Subscription>,
}

struct ChatRuntime<A: ChatApi, T: Transport> {
    api: Arc<A>,
    transport: Arc<T>,
    config: SessionConfig,
    events: EventEmitter,
    command_rx: mpsc::Receiver<SessionCommand>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    inbound_tx: EventSink,
    inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    signed_in: Option<SignedIn<T>>,
    machine: SessionStateMachine,
    store: MessageStore,
    /// Pushes for the conversation being loaded, merged once history lands.
    buffered_pushes: Vec<Message>,
    room_subscriptions: Vec<Subscription>,
    presence: PresenceSet,
    local_typing: LocalTyping,
    remote_typing: RemoteTyping,
    next_txn: u64,
    /// Store revision last copied into the snapshot.
    published_revision: Option<u64>,
}

impl<A: ChatApi, T: Transport> ChatRuntime<A, T> {
    fn new(
        api: Arc<A>,
        transport: Arc<T>,
        config: SessionConfig,
        events: EventEmitter,
        command_rx: mpsc::Receiver<SessionCommand>,
        snapshot_tx: watch::Sender<SessionSnapshot>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Self {
            api,
            transport,
            store: MessageStore::new(config.max_messages),
            local_typing: LocalTyping::new(Duration::from_millis(config.typing_idle_ms)),
            remote_typing: RemoteTyping::new(
                config
                    .remote_typing_expiry_ms
                    .map(Duration::from_millis),
            ),
            config,
            events,
            command_rx,
            completion_tx,
            completion_rx,
            inbound_tx,
            inbound_rx,
            snapshot_tx,
            signed_in: None,
            machine: SessionStateMachine::default(),
            buffered_pushes: Vec::new(),
            room_subscriptions: Vec::new(),
            presence: PresenceSet::new(),
            next_txn: 0,
            published_revision: None,
        }
    }

    async fn run(mut self) {
        loop {
            let local_deadline = self.local_typing.deadline();
            let remote_deadline = self.remote_typing.deadline();

            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command);
                }
                Some(completion) = self.completion_rx.recv() => self.handle_completion(completion),
                Some(event) = self.inbound_rx.recv() => self.handle_inbound(event),
                _ = tokio::time::sleep_until(local_deadline.unwrap_or_else(Instant::now)),
                    if local_deadline.is_some() => self.on_local_typing_deadline(),
                _ = tokio::time::sleep_until(remote_deadline.unwrap_or_else(Instant::now)),
                    if remote_deadline.is_some() => self.on_remote_typing_deadline(),
            }

            self.publish_snapshot();
        }

        self.sign_out();
        self.publish_snapshot();
        debug!("chat runtime stopped");
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SignIn { identity } => self.sign_in(identity),
            SessionCommand::SignOut => self.sign_out(),
            SessionCommand::SelectConversation { conversation_id } => {
                if self.require_identity("select_conversation").is_some() {
                    let effects = self.machine.select(conversation_id);
                    self.apply_effects(effects);
                }
            }
            SessionCommand::DeselectConversation => {
                let effects = self.machine.deselect();
                self.apply_effects(effects);
            }
            SessionCommand::StartConversation { recipient_id } => {
                self.start_conversation(recipient_id)
            }
            SessionCommand::Keystroke => self.on_keystroke(),
            SessionCommand::SendMessage { text, image } => self.send_message(text, image),
            SessionCommand::RefreshConversations => {
                if self.require_identity("refresh_conversations").is_some() {
                    self.refresh_conversations();
                }
            }
        }
    }

    fn sign_in(&mut self, identity: Identity) {
        if let Some(current) = &self.signed_in {
            if current.identity.id == identity.id {
                debug!(identity = %identity.id, "already signed in; ignoring");
                return;
            }
            info!(from = %current.identity.id, to = %identity.id, "switching identity");
            self.sign_out();
        }

        info!(identity = %identity.id, "signing in");
        let lease = TransportLease::acquire(Arc::clone(&self.transport), identity.id.clone());
        let presence_subscriptions = InboundKind::PRESENCE
            .iter()
            .map(|kind| self.transport.subscribe(*kind, self.inbound_tx.clone()))
            .collect();

        self.signed_in = Some(SignedIn {
            identity: identity.clone(),
            lease,
            presence_subscriptions,
        });
        self.events.emit(SessionEvent::SignedIn { identity });
        self.refresh_conversations();
    }

    fn sign_out(&mut self) {
        let effects = self.machine.deselect();
        self.apply_effects(effects);

        let Some(SignedIn {
            identity,
            lease,
            presence_subscriptions,
        }) = self.signed_in.take()
        else {
            return;
        };

        info!(identity = %identity.id, "signing out");
        drop(presence_subscriptions);
        lease.release();
        if self.presence.clear() {
            self.emit_presence();
        }
        self.events.emit(SessionEvent::SignedOut);
    }

    fn apply_effects(&mut self, effects: Vec<SessionEffect>) {
        for effect in effects {
            self.apply_effect(effect);
        }
    }

    fn apply_effect(&mut self, effect: SessionEffect) {
        match effect {
            SessionEffect::LeaveConversation { conversation_id } => {
                self.stop_local_typing(&conversation_id);
                debug!(conversation_id = %conversation_id, "leaving conversation");
                self.transport
                    .emit(OutboundEvent::LeaveChat { conversation_id });
            }
            SessionEffect::ResetConversationState => {
                self.room_subscriptions.clear();
                self.buffered_pushes.clear();
                self.local_typing.force_idle();
                if self.remote_typing.clear()
                    && let Some(conversation_id) = self.store.conversation_id().map(str::to_owned)
                {
                    self.emit_peer_typing(conversation_id, false);
                }
                self.store.clear();
            }
            SessionEffect::BeginFetch(ticket) => self.begin_fetch(ticket),
            SessionEffect::ApplyHistory(ticket) => {
                warn!(
                    conversation_id = %ticket.conversation_id,
                    "history effect reached without fetched data"
                );
            }
            SessionEffect::JoinConversation { conversation_id } => {
                debug!(conversation_id = %conversation_id, "joining conversation");
                self.transport
                    .emit(OutboundEvent::JoinChat { conversation_id });
            }
            SessionEffect::ReportLoadFailure { conversation_id } => {
                debug!(conversation_id = %conversation_id, "reporting load failure");
                self.events.emit(generic_notice(LOAD_FAILED_NOTICE));
            }
            SessionEffect::PublishPhase(phase) => {
                self.events.emit(SessionEvent::PhaseChanged { phase });
            }
        }
    }

    fn begin_fetch(&mut self, ticket: SelectionTicket) {
        self.room_subscriptions = InboundKind::ROOM
            .iter()
            .map(|kind| self.transport.subscribe(*kind, self.inbound_tx.clone()))
            .collect();

        debug!(
            conversation_id = %ticket.conversation_id,
            epoch = ticket.epoch,
            "fetching history"
        );
        let api = Arc::clone(&self.api);
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_history(&ticket.conversation_id).await;
            let _ = completions.send(Completion::History { ticket, result });
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::History { ticket, result } => self.on_history(ticket, result),
            Completion::ConversationStarted {
                identity_id,
                recipient_id,
                result,
            } => self.on_conversation_started(identity_id, recipient_id, result),
            Completion::Sent { pending, result } => self.on_sent(pending, result),
            Completion::Conversations {
                identity_id,
                result,
            } => {
                if self.local_id() != Some(identity_id.as_str()) {
                    debug!("dropping conversation list for a previous identity");
                    return;
                }
                match result {
                    Ok(conversations) => self
                        .events
                        .emit(SessionEvent::ConversationsUpdated { conversations }),
                    Err(err) => warn!(error = %err, "failed to refresh conversation list"),
                }
            }
        }
    }

    fn on_history(
        &mut self,
        ticket: SelectionTicket,
        result: Result<ConversationHistory, ChatError>,
    ) {
        match result {
            Ok(history) => {
                let Some(effects) = self.machine.on_fetch_succeeded(&ticket) else {
                    debug!(
                        conversation_id = %ticket.conversation_id,
                        epoch = ticket.epoch,
                        "dropping stale history"
                    );
                    return;
                };

                let mut history = Some(history);
                for effect in effects {
                    match effect {
                        SessionEffect::ApplyHistory(ticket) => match history.take() {
                            Some(history) => self.apply_history(&ticket, history),
                            None => warn!(
                                conversation_id = %ticket.conversation_id,
                                "history already applied"
                            ),
                        },
                        effect => self.apply_effect(effect),
                    }
                }
            }
            Err(err) => {
                let Some(effects) = self.machine.on_fetch_failed(&ticket) else {
                    debug!(
                        conversation_id = %ticket.conversation_id,
                        error = %err,
                        "dropping stale history failure"
                    );
                    return;
                };
                warn!(
                    conversation_id = %ticket.conversation_id,
                    error = %err,
                    "history fetch failed"
                );
                self.apply_effects(effects);
            }
        }
    }

    fn apply_history(&mut self, ticket: &SelectionTicket, history: ConversationHistory) {
        let ConversationHistory { messages, peer } = history;
        self.store
            .load(ticket.conversation_id.clone(), messages, peer.clone());
        self.remote_typing.clear();

        self.events.emit(SessionEvent::HistoryLoaded {
            conversation_id: ticket.conversation_id.clone(),
            peer,
            message_count: self.store.len(),
        });

        for message in std::mem::take(&mut self.buffered_pushes) {
            self.merge_message(message);
        }
        self.refresh_conversations();
    }

    fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::NewMessage(message) => self.on_pushed_message(message),
            InboundEvent::MessagesSeen(receipt) => {
                if self.machine.active_conversation() != Some(receipt.conversation_id.as_str()) {
                    return;
                }
                let message_ids = self.store.mark_seen(&receipt.message_ids, Utc::now());
                if !message_ids.is_empty() {
                    self.events.emit(SessionEvent::MessagesSeen {
                        conversation_id: receipt.conversation_id,
                        message_ids,
                    });
                }
            }
            InboundEvent::Typing(payload) => {
                if self.is_relevant_typing(&payload) && self.remote_typing.on_typing(Instant::now()) {
                    self.emit_peer_typing(payload.conversation_id, true);
                }
            }
            InboundEvent::StoppedTyping(payload) => {
                if self.is_relevant_typing(&payload) && self.remote_typing.on_stopped() {
                    self.emit_peer_typing(payload.conversation_id, false);
                }
            }
            InboundEvent::OnlineRoster(roster) => {
                if self.presence.replace_roster(roster) {
                    self.emit_presence();
                }
            }
            InboundEvent::UserOnline(identity_id) => {
                if self.presence.mark_online(identity_id) {
                    self.emit_presence();
                }
            }
            InboundEvent::UserOffline(identity_id) => {
                if self.presence.mark_offline(&identity_id) {
                    self.emit_presence();
                }
            }
        }
    }

    fn on_pushed_message(&mut self, message: Message) {
        if self.machine.is_loading(&message.conversation_id) {
            self.buffered_pushes.push(message);
            return;
        }
        if self.machine.active_conversation() == Some(message.conversation_id.as_str()) {
            self.merge_message(message);
            return;
        }

        debug!(
            conversation_id = %message.conversation_id,
            "push for an inactive conversation; refreshing list"
        );
        self.refresh_conversations();
    }

    fn merge_message(&mut self, message: Message) {
        let from_peer = self.local_id() != Some(message.sender.as_str());
        match self.store.append(message.clone()) {
            AppendOutcome::Inserted => self.events.emit(SessionEvent::MessageAppended {
                conversation_id: message.conversation_id.clone(),
                message,
                from_peer,
            }),
            AppendOutcome::Reconciled { provisional_id } => {
                self.events.emit(SessionEvent::MessageReconciled {
                    provisional_id,
                    message,
                })
            }
            AppendOutcome::Duplicate => {
                debug!(message_id = %message.id, "ignoring duplicate message");
            }
            AppendOutcome::ForeignConversation => {
                debug!(message_id = %message.id, "ignoring message for another conversation");
            }
        }
    }

    fn on_keystroke(&mut self) {
        let Some(payload) = self.typing_payload() else {
            debug!("keystroke without an active conversation");
            return;
        };
        if self.local_typing.keystroke(Instant::now()) == Some(TypingSignal::Started) {
            self.transport.emit(OutboundEvent::Typing(payload));
        }
    }

    fn on_local_typing_deadline(&mut self) {
        if self.local_typing.poll_expired(Instant::now()) != Some(TypingSignal::Stopped) {
            return;
        }
        if let Some(payload) = self.typing_payload() {
            self.transport.emit(OutboundEvent::StopTyping(payload));
        }
    }

    fn on_remote_typing_deadline(&mut self) {
        if !self.remote_typing.poll_expired(Instant::now()) {
            return;
        }
        if let Some(conversation_id) = self.machine.active_conversation().map(str::to_owned) {
            debug!(conversation_id = %conversation_id, "peer typing indicator expired");
            self.emit_peer_typing(conversation_id, false);
        }
    }

    fn stop_local_typing(&mut self, conversation_id: &str) {
        if self.local_typing.force_idle().is_none() {
            return;
        }
        if let Some(user_id) = self.local_id().map(str::to_owned) {
            self.transport.emit(OutboundEvent::StopTyping(TypingPayload {
                conversation_id: conversation_id.to_owned(),
                user_id,
            }));
        }
    }

    fn send_message(&mut self, text: Option<String>, image: Option<OutgoingImage>) {
        let Some(sender) = self.local_id().map(str::to_owned) else {
            debug!("send ignored: not signed in");
            return;
        };
        let Some(conversation_id) = self.machine.active_conversation().map(str::to_owned) else {
            debug!("send ignored: no active conversation");
            return;
        };
        let Some(outgoing) = OutgoingMessage::new(conversation_id.clone(), text, image) else {
            debug!("send ignored: empty payload");
            return;
        };

        self.stop_local_typing(&conversation_id);

        self.next_txn += 1;
        let client_txn_id = format!("txn-{}", self.next_txn);
        let provisional_id = match self.config.send_mode {
            SendMode::AwaitAck => None,
            SendMode::Optimistic => self.show_provisional(&outgoing, &sender),
        };

        debug!(
            conversation_id = %conversation_id,
            client_txn_id = %client_txn_id,
            "sending message"
        );
        let pending = PendingSend {
            client_txn_id,
            conversation_id,
            provisional_id,
        };
        let api = Arc::clone(&self.api);
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = api.send_message(outgoing).await;
            let _ = completions.send(Completion::Sent { pending, result });
        });
    }

    fn show_provisional(&mut self, outgoing: &OutgoingMessage, sender: &str) -> Option<String> {
        let provisional = Message::provisional(
            outgoing.conversation_id.clone(),
            sender,
            outgoing.provisional_body(),
            Utc::now(),
        );
        let provisional_id = provisional.id.clone();
        match self.store.insert_provisional(provisional.clone()) {
            Ok(()) => {
                self.events.emit(SessionEvent::MessageAppended {
                    conversation_id: outgoing.conversation_id.clone(),
                    message: provisional,
                    from_peer: false,
                });
                Some(provisional_id)
            }
            Err(err) => {
                warn!(error = %err, "could not show provisional message");
                None
            }
        }
    }

    fn on_sent(&mut self, pending: PendingSend, result: Result<Message, ChatError>) {
        let PendingSend {
            client_txn_id,
            conversation_id,
            provisional_id,
        } = pending;

        match result {
            Ok(message) => {
                let message_id = message.id.clone();
                if self.machine.active_conversation() == Some(conversation_id.as_str()) {
                    match provisional_id {
                        Some(provisional_id) => self.reconcile_provisional(&provisional_id, message),
                        None => self.merge_message(message),
                    }
                } else {
                    debug!(
                        conversation_id = %conversation_id,
                        message_id = %message_id,
                        "send acknowledged after leaving conversation"
                    );
                }
                self.events.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Delivered { message_id },
                ));
            }
            Err(error) => {
                warn!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "send failed"
                );
                if let Some(provisional_id) = provisional_id
                    && self.store.withdraw(&provisional_id)
                {
                    self.events
                        .emit(SessionEvent::MessageWithdrawn { provisional_id });
                }
                self.events.emit(error_notice(&error, SEND_FAILED_NOTICE));
                self.events.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Failed { error },
                ));
            }
        }
    }

    fn reconcile_provisional(&mut self, provisional_id: &str, message: Message) {
        let was_pending = self
            .store
            .pending_ids()
            .iter()
            .any(|id| id == provisional_id);

        match self.store.reconcile(provisional_id, message.clone()) {
            AppendOutcome::Reconciled { provisional_id } => {
                self.events.emit(SessionEvent::MessageReconciled {
                    provisional_id,
                    message,
                })
            }
            AppendOutcome::Inserted => self.events.emit(SessionEvent::MessageAppended {
                conversation_id: message.conversation_id.clone(),
                message,
                from_peer: false,
            }),
            AppendOutcome::Duplicate if was_pending => {
                self.events.emit(SessionEvent::MessageWithdrawn {
                    provisional_id: provisional_id.to_owned(),
                })
            }
            AppendOutcome::Duplicate | AppendOutcome::ForeignConversation => {}
        }
    }

    fn start_conversation(&mut self, recipient_id: String) {
        let Some(identity_id) = self.require_identity("start_conversation") else {
            return;
        };

        let api = Arc::clone(&self.api);
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = api.start_conversation(&recipient_id).await;
            let _ = completions.send(Completion::ConversationStarted {
                identity_id,
                recipient_id,
                result,
            });
        });
    }

    fn on_conversation_started(
        &mut self,
        identity_id: String,
        recipient_id: String,
        result: Result<String, ChatError>,
    ) {
        if self.local_id() != Some(identity_id.as_str()) {
            debug!(
                recipient_id = %recipient_id,
                "dropping conversation start for a previous identity"
            );
            return;
        }

        match result {
            Ok(conversation_id) => {
                info!(
                    conversation_id = %conversation_id,
                    recipient_id = %recipient_id,
                    "conversation ready"
                );
                self.events.emit(SessionEvent::ConversationStarted {
                    conversation_id: conversation_id.clone(),
                    recipient_id,
                });
                let effects = self.machine.select(conversation_id);
                self.apply_effects(effects);
                self.refresh_conversations();
            }
            Err(err) => {
                warn!(recipient_id = %recipient_id, error = %err, "failed to start conversation");
                self.events.emit(generic_notice(START_FAILED_NOTICE));
            }
        }
    }

    fn refresh_conversations(&self) {
        let Some(identity_id) = self.local_id().map(str::to_owned) else {
            return;
        };

        let api = Arc::clone(&self.api);
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_conversations().await;
            let _ = completions.send(Completion::Conversations {
                identity_id,
                result,
            });
        });
    }

    fn require_identity(&self, action: &str) -> Option<String> {
        match self.local_id() {
            Some(identity_id) => Some(identity_id.to_owned()),
            None => {
                self.events
                    .emit(rejection(ChatError::not_signed_in(action)));
                None
            }
        }
    }

    fn local_id(&self) -> Option<&str> {
        self.signed_in
            .as_ref()
            .map(|signed_in| signed_in.identity.id.as_str())
    }

    fn typing_payload(&self) -> Option<TypingPayload> {
        Some(TypingPayload {
            conversation_id: self.machine.active_conversation()?.to_owned(),
            user_id: self.local_id()?.to_owned(),
        })
    }

    fn is_relevant_typing(&self, payload: &TypingPayload) -> bool {
        self.local_id().is_some_and(|local_id| {
            typing::is_relevant(payload, self.machine.active_conversation(), local_id)
        })
    }

    fn emit_peer_typing(&self, conversation_id: String, typing: bool) {
        self.events.emit(SessionEvent::PeerTyping {
            conversation_id,
            typing,
        });
    }

    fn emit_presence(&self) {
        self.events.emit(SessionEvent::PresenceChanged {
            online: self.presence.snapshot(),
        });
    }

    /// Sync the watched snapshot with live state. Message rows are copied
    /// only when the store revision moved; the other fields are compared in
    /// place and cloned only when they differ.
    fn publish_snapshot(&mut self) {
        let revision = self.store.revision();
        let store_changed = self.published_revision != Some(revision);
        self.published_revision = Some(revision);

        let store = &self.store;
        let identity = self.signed_in.as_ref().map(|signed_in| &signed_in.identity);
        let phase = self.machine.phase();
        let presence = &self.presence;
        let peer_typing = self.remote_typing.is_typing();
        let composing = self.local_typing.is_composing();

        self.snapshot_tx.send_if_modified(|current| {
            let mut changed = false;
            if store_changed {
                current.peer = store.peer().cloned();
                current.messages = store.messages().to_vec();
                current.pending_ids = store.pending_ids().to_vec();
                changed = true;
            }
            if current.identity.as_ref() != identity {
                current.identity = identity.cloned();
                changed = true;
            }
            if current.phase != *phase {
                current.phase = phase.clone();
                changed = true;
            }
            if !current.online.iter().map(String::as_str).eq(presence.iter()) {
                current.online = presence.snapshot();
                changed = true;
            }
            if current.peer_typing != peer_typing || current.composing != composing {
                current.peer_typing = peer_typing;
                current.composing = composing;
                changed = true;
            }
            changed
        });
    }
}
