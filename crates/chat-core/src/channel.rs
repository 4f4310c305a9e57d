use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{SessionCommand, SessionEvent};

/// Broadcast event stream type used by frontend subscribers.
pub type EventStream = broadcast::Receiver<SessionEvent>;

/// Errors returned by session channel operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionChannelError {
    /// The runtime has stopped and no longer accepts commands.
    #[error("command channel is closed")]
    CommandChannelClosed,
    /// The command queue is full; only returned by `try_send_command`.
    #[error("command channel is full")]
    CommandChannelFull,
}

/// Command/event channel pair shared by the runtime and its frontends.
#[derive(Clone, Debug)]
pub struct SessionChannels {
    command_tx: mpsc::Sender<SessionCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<SessionCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    /// Event-only half for the runtime, so it never keeps its own command
    /// channel open.
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            event_tx: self.event_tx.clone(),
        }
    }

    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Queue one command for the runtime, waiting for capacity.
    pub async fn send_command(&self, command: SessionCommand) -> Result<(), SessionChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SessionChannelError::CommandChannelClosed)
    }

    /// Queue one command without waiting, for synchronous UI callbacks.
    pub fn try_send_command(&self, command: SessionCommand) -> Result<(), SessionChannelError> {
        self.command_tx.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SessionChannelError::CommandChannelFull,
            mpsc::error::TrySendError::Closed(_) => SessionChannelError::CommandChannelClosed,
        })
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Emitting side of the event broadcast.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    event_tx: broadcast::Sender<SessionEvent>,
}

impl EventEmitter {
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_commands_in_order() {
        let (channels, mut rx) = SessionChannels::new(8, 8);
        channels
            .send_command(SessionCommand::SelectConversation {
                conversation_id: "c1".into(),
            })
            .await
            .expect("command send should work");
        channels
            .try_send_command(SessionCommand::Keystroke)
            .expect("non-blocking send should work");

        assert_eq!(
            rx.recv().await,
            Some(SessionCommand::SelectConversation {
                conversation_id: "c1".into()
            })
        );
        assert_eq!(rx.recv().await, Some(SessionCommand::Keystroke));
    }

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let (channels, _rx) = SessionChannels::new(4, 16);
        let mut a = channels.subscribe();
        let mut b = channels.subscribe();

        channels.emit(SessionEvent::SignedOut);

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }

    #[test]
    fn reports_full_and_closed_queues() {
        let (channels, rx) = SessionChannels::new(1, 4);
        channels
            .try_send_command(SessionCommand::Keystroke)
            .expect("first command fits");
        assert_eq!(
            channels.try_send_command(SessionCommand::Keystroke),
            Err(SessionChannelError::CommandChannelFull)
        );

        drop(rx);
        assert_eq!(
            channels.try_send_command(SessionCommand::SignOut),
            Err(SessionChannelError::CommandChannelClosed)
        );
    }

    #[tokio::test]
    async fn emitter_does_not_hold_commands_open() {
        let (channels, mut rx) = SessionChannels::new(4, 4);
        let emitter = channels.emitter();
        let mut events = channels.subscribe();
        drop(channels);

        emitter.emit(SessionEvent::SignedOut);

        assert_eq!(rx.recv().await, None);
        assert_eq!(events.recv().await.ok(), Some(SessionEvent::SignedOut));
    }
}
