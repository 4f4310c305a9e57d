//! Socket.IO transport over a single websocket.
//!
//! Each connected identity gets one background task that owns the socket.
//! Outbound events are queued to that task; inbound events are decoded and
//! routed through the subscription registry. Connection loss is handled by
//! the task's reconnect loop and never reported upstream.
//!
//! Events emitted before the namespace is connected are held and flushed
//! once it is. The task also remembers the room last joined, and rejoins it
//! after every reconnect, because the server forgets room membership with
//! the old socket.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chat_core::{
    ChatError, ChatErrorCategory, EventSink, InboundEvent, InboundKind, OutboundEvent,
    ReconnectPolicy, Subscription, SubscriptionRegistry, Transport,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::{runtime::Handle, sync::mpsc, time::Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::frame::{self, Frame};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Events held while the namespace is down; the oldest go first.
const MAX_HELD_EVENTS: usize = 256;

#[derive(Debug, Clone)]
pub struct SocketIoConfig {
    /// Server URL as given to a Socket.IO client; its path selects the namespace.
    pub server_url: Url,
    pub namespace: String,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
}

impl SocketIoConfig {
    pub fn new(server_url: Url) -> Self {
        let namespace = match server_url.path().trim_end_matches('/') {
            "" => "/".to_owned(),
            path => path.to_owned(),
        };
        Self {
            server_url,
            namespace,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Websocket endpoint for `identity_id`.
    pub fn socket_url(&self, identity_id: &str) -> Result<Url, ChatError> {
        let mut url = self.server_url.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ChatError::new(
                    ChatErrorCategory::Config,
                    "invalid_socket_url",
                    format!("unsupported socket scheme '{other}'"),
                ));
            }
        };
        url.set_scheme(scheme).map_err(|()| {
            ChatError::new(
                ChatErrorCategory::Config,
                "invalid_socket_url",
                format!("cannot use scheme '{scheme}' for {}", self.server_url),
            )
        })?;
        url.set_path("/socket.io/");
        url.query_pairs_mut()
            .clear()
            .append_pair("EIO", "4")
            .append_pair("transport", "websocket")
            .append_pair("userId", identity_id);
        Ok(url)
    }
}

#[derive(Debug)]
struct Connection {
    identity_id: String,
    outbound: mpsc::UnboundedSender<OutboundEvent>,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub struct SocketIoTransport {
    config: SocketIoConfig,
    registry: SubscriptionRegistry,
    connection: Mutex<Option<Connection>>,
}

impl SocketIoTransport {
    pub fn new(config: SocketIoConfig) -> Self {
        Self {
            config,
            registry: SubscriptionRegistry::new(),
            connection: Mutex::new(None),
        }
    }

    pub fn connected_identity(&self) -> Option<String> {
        self.lock()
            .as_ref()
            .map(|connection| connection.identity_id.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for SocketIoTransport {
    fn connect(&self, identity_id: &str) {
        let mut connection = self.lock();
        if connection
            .as_ref()
            .is_some_and(|current| current.identity_id == identity_id)
        {
            return;
        }
        if let Some(previous) = connection.take() {
            info!(identity = %previous.identity_id, "replacing socket connection");
            previous.cancel.cancel();
            self.registry.reset();
        }

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(error = %err, "socket connect requires a tokio runtime");
                return;
            }
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        runtime.spawn(run_connection(
            self.config.clone(),
            identity_id.to_owned(),
            self.registry.clone(),
            outbound_rx,
            cancel.clone(),
        ));

        *connection = Some(Connection {
            identity_id: identity_id.to_owned(),
            outbound,
            cancel,
        });
    }

    fn disconnect(&self) {
        if let Some(connection) = self.lock().take() {
            info!(identity = %connection.identity_id, "closing socket connection");
            connection.cancel.cancel();
        }
        self.registry.reset();
    }

    fn emit(&self, event: OutboundEvent) {
        match self.lock().as_ref() {
            Some(connection) => {
                let _ = connection.outbound.send(event);
            }
            None => debug!(event = event.name(), "dropping event without a connection"),
        }
    }

    fn subscribe(&self, kind: InboundKind, sink: EventSink) -> Subscription {
        self.registry.subscribe(kind, sink)
    }

    fn unsubscribe(&self, kind: InboundKind) {
        self.registry.unsubscribe(kind);
    }
}

impl Drop for SocketIoTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.lock().take() {
            connection.cancel.cancel();
        }
    }
}

enum SessionEnd {
    Cancelled,
    Closed,
}

/// Outbound state that outlives a single websocket session.
#[derive(Debug, Default)]
struct OutboundQueue {
    held: VecDeque<OutboundEvent>,
    /// Room to be in once the namespace is connected.
    room: Option<String>,
}

impl OutboundQueue {
    /// Follow room membership through an event that is being sent.
    fn track(&mut self, event: &OutboundEvent) {
        match event {
            OutboundEvent::JoinChat { conversation_id } => {
                self.room = Some(conversation_id.clone());
            }
            OutboundEvent::LeaveChat { conversation_id }
                if self.room.as_ref() == Some(conversation_id) =>
            {
                self.room = None;
            }
            _ => {}
        }
    }

    /// Keep `event` until the namespace connects. Joins and leaves only move
    /// `room`; the connect flush replays membership from it.
    fn hold(&mut self, event: OutboundEvent) {
        self.track(&event);
        if matches!(
            event,
            OutboundEvent::JoinChat { .. } | OutboundEvent::LeaveChat { .. }
        ) {
            return;
        }
        if self.held.len() >= MAX_HELD_EVENTS
            && let Some(dropped) = self.held.pop_front()
        {
            debug!(event = dropped.name(), "outbound queue full; dropping oldest");
        }
        self.held.push_back(event);
    }

    /// Frames to send right after a namespace connect: rejoin the room, then
    /// the held events. Typing for a room that was left meanwhile is dropped.
    fn drain_on_connect(&mut self) -> Vec<OutboundEvent> {
        let room = self.room.clone();
        let rejoin = room.clone().map(|conversation_id| OutboundEvent::JoinChat {
            conversation_id,
        });
        let held = self.held.drain(..).filter(|event| match event {
            OutboundEvent::Typing(payload) => room.as_ref() == Some(&payload.conversation_id),
            _ => true,
        });
        rejoin.into_iter().chain(held).collect()
    }
}

fn network_error(message: impl Into<String>) -> ChatError {
    ChatError::new(ChatErrorCategory::Network, "socket_unavailable", message)
}

async fn run_connection(
    config: SocketIoConfig,
    identity_id: String,
    registry: SubscriptionRegistry,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundEvent>,
    cancel: CancellationToken,
) {
    let mut attempt = 0_u32;
    let mut queue = OutboundQueue::default();
    loop {
        let session = run_session(
            &config,
            &identity_id,
            &registry,
            &mut outbound_rx,
            &mut queue,
            &cancel,
            &mut attempt,
        );
        let hint = match session.await {
            Ok(SessionEnd::Cancelled) => break,
            Ok(SessionEnd::Closed) => {
                info!(identity = %identity_id, "socket closed by server");
                None
            }
            Err(err) if !err.is_transient() => {
                warn!(identity = %identity_id, error = %err, "socket rejected; not reconnecting");
                break;
            }
            Err(err) => {
                warn!(identity = %identity_id, attempt, error = %err, "socket session failed");
                err.retry_after_ms.map(Duration::from_millis)
            }
        };

        let delay = config.reconnect.delay_for_attempt(attempt, hint);
        attempt = attempt.saturating_add(1);
        debug!(identity = %identity_id, delay_ms = delay.as_millis() as u64, "reconnecting");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = &mut sleep => break,
                event = outbound_rx.recv() => match event {
                    Some(event) => queue.hold(event),
                    None => return,
                },
            }
        }
    }
    debug!(identity = %identity_id, "socket task stopped");
}

async fn run_session(
    config: &SocketIoConfig,
    identity_id: &str,
    registry: &SubscriptionRegistry,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundEvent>,
    queue: &mut OutboundQueue,
    cancel: &CancellationToken,
    attempt: &mut u32,
) -> Result<SessionEnd, ChatError> {
    let url = config.socket_url(identity_id)?;
    let connecting = tokio::time::timeout(config.connect_timeout, connect_async(url.as_str()));
    let (stream, _) = tokio::select! {
        _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        connected = connecting => connected
            .map_err(|_| network_error("websocket connect timed out"))?
            .map_err(|err| network_error(format!("websocket connect failed: {err}")))?,
    };
    let (mut writer, mut reader) = stream.split();

    let ws_error = |err: tokio_tungstenite::tungstenite::Error| {
        network_error(format!("websocket error: {err}"))
    };
    // Tightened to the server ping window once the open packet arrives.
    let mut liveness = config.connect_timeout;
    let mut last_heard = Instant::now();
    let mut namespace_ready = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if namespace_ready {
                    let _ = writer.send(Message::text("41")).await;
                }
                let _ = writer.close().await;
                return Ok(SessionEnd::Cancelled);
            }
            _ = tokio::time::sleep_until(last_heard + liveness) => {
                return Err(network_error("server stopped responding"));
            }
            event = outbound_rx.recv() => {
                let Some(event) = event else { return Ok(SessionEnd::Cancelled) };
                if !namespace_ready {
                    queue.hold(event);
                    continue;
                }
                queue.track(&event);
                writer
                    .send(Message::text(frame::encode_event(&config.namespace, &event)))
                    .await
                    .map_err(ws_error)?;
            }
            message = reader.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(ws_error(err)),
                };
                last_heard = Instant::now();

                match frame::decode(text.as_str()) {
                    Ok(Frame::Open(open)) => {
                        liveness = Duration::from_millis(open.ping_interval + open.ping_timeout);
                        debug!(sid = %open.sid, "engine.io session opened");
                        let auth = json!({ "userId": identity_id });
                        writer
                            .send(Message::text(frame::encode_connect(&config.namespace, &auth)))
                            .await
                            .map_err(ws_error)?;
                    }
                    Ok(Frame::Ping) => {
                        writer
                            .send(Message::text(frame::PONG))
                            .await
                            .map_err(ws_error)?;
                    }
                    Ok(Frame::Connected { namespace }) if namespace == config.namespace => {
                        namespace_ready = true;
                        *attempt = 0;
                        info!(identity = %identity_id, namespace = %namespace, "socket connected");
                        for event in queue.drain_on_connect() {
                            writer
                                .send(Message::text(frame::encode_event(&config.namespace, &event)))
                                .await
                                .map_err(ws_error)?;
                        }
                    }
                    Ok(Frame::Event { namespace, name, payload }) if namespace == config.namespace => {
                        dispatch(registry, &name, payload);
                    }
                    Ok(Frame::ConnectError { message, .. }) => {
                        return Err(ChatError::new(
                            ChatErrorCategory::Auth,
                            "socket_connect_rejected",
                            message,
                        ));
                    }
                    Ok(Frame::Disconnected { .. } | Frame::Close) => return Ok(SessionEnd::Closed),
                    Ok(other) => debug!(frame = ?other, "ignoring frame"),
                    Err(err) => warn!(error = %err, "dropping malformed frame"),
                }
            }
        }
    }
}

fn dispatch(registry: &SubscriptionRegistry, name: &str, payload: serde_json::Value) {
    match InboundEvent::decode(name, payload) {
        Ok(Some(event)) => {
            if !registry.dispatch(event) {
                debug!(event = name, "no handler for inbound event");
            }
        }
        Ok(None) => debug!(event = name, "ignoring unknown event"),
        Err(err) => warn!(event = name, error = %err, "dropping undecodable event"),
    }
}
