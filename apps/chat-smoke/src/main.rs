mod config;
mod logging;

use std::{error::Error, sync::Arc, time::Duration};

use chat_client::{
    ChatRuntimeHandle, HttpChatApi, SocketIoConfig, SocketIoTransport, spawn_runtime,
};
use chat_core::{NoticeLevel, SessionCommand, SessionEvent, SessionPhase};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::config::SmokeConfig;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            eprintln!("Required: CHAT_AUTH_TOKEN and CHAT_USER_ID");
            std::process::exit(2);
        }
    };

    if let Err(err) = run(config).await {
        error!(error = %err, "smoke run failed");
        std::process::exit(1);
    }
}

async fn run(config: SmokeConfig) -> Result<(), Box<dyn Error>> {
    let api = Arc::new(HttpChatApi::new(
        config.api_url.clone(),
        config.auth_token.clone(),
    )?);
    let transport = Arc::new(SocketIoTransport::new(SocketIoConfig::new(
        config.socket_url.clone(),
    )));
    info!(
        api = %config.api_url,
        socket = %config.socket_url,
        identity = %config.identity.id,
        "starting smoke run"
    );

    let handle = spawn_runtime(api, transport, config.session.clone());
    let mut events = handle.subscribe();

    handle
        .send(SessionCommand::SignIn {
            identity: config.identity.clone(),
        })
        .await?;
    if let Some(conversation_id) = &config.conversation_id {
        handle
            .send(SessionCommand::SelectConversation {
                conversation_id: conversation_id.clone(),
            })
            .await?;
    }

    let deadline = tokio::time::sleep(Duration::from_millis(config.run_for_ms));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(deadline, ctrl_c);
    let mut pending_message = config.message.clone();

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    log_event(&event);
                    if matches!(event, SessionEvent::PhaseChanged { phase: SessionPhase::Active { .. } })
                        && let Some(text) = pending_message.take()
                    {
                        send_smoke_message(&handle, text).await?;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let snapshot = handle.snapshot();
    info!(
        phase = ?snapshot.phase,
        messages = snapshot.messages.len(),
        online = snapshot.online.len(),
        "smoke run finished"
    );

    handle.send(SessionCommand::SignOut).await?;
    let mut watch = handle.watch();
    drop(handle);
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while watch.changed().await.is_ok() {}
    })
    .await;
    Ok(())
}

async fn send_smoke_message(
    handle: &ChatRuntimeHandle,
    text: String,
) -> Result<(), Box<dyn Error>> {
    handle.send(SessionCommand::Keystroke).await?;
    handle
        .send(SessionCommand::SendMessage {
            text: Some(text),
            image: None,
        })
        .await?;
    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::SignedIn { identity } => info!(identity = %identity.id, "signed in"),
        SessionEvent::SignedOut => info!("signed out"),
        SessionEvent::PhaseChanged { phase } => info!(?phase, "phase changed"),
        SessionEvent::HistoryLoaded {
            conversation_id,
            peer,
            message_count,
        } => info!(
            conversation_id = %conversation_id,
            peer = %peer.name,
            message_count,
            "history loaded"
        ),
        SessionEvent::MessageAppended {
            message, from_peer, ..
        } => info!(
            message_id = %message.id,
            from_peer,
            preview = message.body.preview(),
            "message"
        ),
        SessionEvent::MessageReconciled {
            provisional_id,
            message,
        } => debug!(provisional_id = %provisional_id, message_id = %message.id, "message confirmed"),
        SessionEvent::MessageWithdrawn { provisional_id } => {
            warn!(provisional_id = %provisional_id, "message withdrawn")
        }
        SessionEvent::MessagesSeen { message_ids, .. } => {
            debug!(count = message_ids.len(), "messages seen")
        }
        SessionEvent::PeerTyping { typing, .. } => debug!(typing, "peer typing"),
        SessionEvent::PresenceChanged { online } => info!(online = ?online, "presence"),
        SessionEvent::ConversationsUpdated { conversations } => {
            info!(count = conversations.len(), "conversations updated")
        }
        SessionEvent::ConversationStarted {
            conversation_id,
            recipient_id,
        } => info!(conversation_id = %conversation_id, recipient_id = %recipient_id, "conversation started"),
        SessionEvent::SendAck(ack) => info!(
            client_txn_id = %ack.client_txn_id,
            message_id = ?ack.message_id,
            error_code = ?ack.error_code,
            "send ack"
        ),
        SessionEvent::Notice(notice) => match notice.level {
            NoticeLevel::Error => warn!(text = %notice.message, "notice"),
            NoticeLevel::Info => info!(text = %notice.message, "notice"),
        },
        SessionEvent::CommandRejected { code, message } => {
            warn!(code = %code, reason = %message, "command rejected")
        }
    }
}
