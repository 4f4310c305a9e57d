use crate::types::SessionPhase;

/// Conversation id and selection epoch captured when a fetch is issued.
///
/// A fetch result is applied only if its ticket is still the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionTicket {
    pub conversation_id: String,
    pub epoch: u64,
}

/// Side effect the runtime must perform, in order, after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    /// Force local typing idle, then emit `leaveChat` for the joined room.
    LeaveConversation { conversation_id: String },
    /// Drop room subscriptions and clear store, peer typing and buffered pushes.
    ResetConversationState,
    /// Subscribe room events for the target and issue the history fetch.
    BeginFetch(SelectionTicket),
    /// Load fetched history, clear peer typing, merge buffered pushes.
    ApplyHistory(SelectionTicket),
    /// Emit `joinChat`.
    JoinConversation { conversation_id: String },
    /// Tell the notification collaborator that loading failed.
    ReportLoadFailure { conversation_id: String },
    /// Announce the new phase.
    PublishPhase(SessionPhase),
}

/// `Idle -> Loading -> Active` selection state machine.
#[derive(Debug, Clone, Default)]
pub struct SessionStateMachine {
    phase: SessionPhase,
    epoch: u64,
}

impl SessionStateMachine {
    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    /// Conversation whose history is loaded and room joined.
    pub fn active_conversation(&self) -> Option<&str> {
        match &self.phase {
            SessionPhase::Active { conversation_id } => Some(conversation_id),
            _ => None,
        }
    }

    /// Conversation being loaded or already active.
    pub fn target_conversation(&self) -> Option<&str> {
        self.phase.conversation_id()
    }

    pub fn is_loading(&self, conversation_id: &str) -> bool {
        matches!(
            &self.phase,
            SessionPhase::Loading { conversation_id: current } if current == conversation_id
        )
    }

    /// Select a conversation. Reselecting the current target is a no-op.
    pub fn select(&mut self, conversation_id: impl Into<String>) -> Vec<SessionEffect> {
        let conversation_id = conversation_id.into();
        if self.target_conversation() == Some(conversation_id.as_str()) {
            return Vec::new();
        }

        let mut effects = Vec::new();
        match &self.phase {
            SessionPhase::Active { conversation_id: previous } => {
                effects.push(SessionEffect::LeaveConversation {
                    conversation_id: previous.clone(),
                });
                effects.push(SessionEffect::ResetConversationState);
            }
            SessionPhase::Loading { .. } => effects.push(SessionEffect::ResetConversationState),
            SessionPhase::Idle => {}
        }

        let ticket = self.next_ticket(&conversation_id);
        self.phase = SessionPhase::Loading { conversation_id };
        effects.push(SessionEffect::BeginFetch(ticket));
        effects.push(SessionEffect::PublishPhase(self.phase.clone()));
        effects
    }

    /// Leave the current conversation, if any.
    pub fn deselect(&mut self) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        match &self.phase {
            SessionPhase::Idle => return effects,
            SessionPhase::Active { conversation_id } => {
                effects.push(SessionEffect::LeaveConversation {
                    conversation_id: conversation_id.clone(),
                });
            }
            SessionPhase::Loading { .. } => {}
        }

        self.epoch += 1;
        self.phase = SessionPhase::Idle;
        effects.push(SessionEffect::ResetConversationState);
        effects.push(SessionEffect::PublishPhase(SessionPhase::Idle));
        effects
    }

    pub fn is_current(&self, ticket: &SelectionTicket) -> bool {
        ticket.epoch == self.epoch && self.is_loading(&ticket.conversation_id)
    }

    /// History fetch resolved successfully. `None` means the ticket is stale
    /// and the result must be dropped.
    pub fn on_fetch_succeeded(&mut self, ticket: &SelectionTicket) -> Option<Vec<SessionEffect>> {
        if !self.is_current(ticket) {
            return None;
        }

        self.phase = SessionPhase::Active {
            conversation_id: ticket.conversation_id.clone(),
        };
        Some(vec![
            SessionEffect::ApplyHistory(ticket.clone()),
            SessionEffect::JoinConversation {
                conversation_id: ticket.conversation_id.clone(),
            },
            SessionEffect::PublishPhase(self.phase.clone()),
        ])
    }

    /// History fetch failed. `None` means the ticket is stale.
    pub fn on_fetch_failed(&mut self, ticket: &SelectionTicket) -> Option<Vec<SessionEffect>> {
        if !self.is_current(ticket) {
            return None;
        }

        self.epoch += 1;
        self.phase = SessionPhase::Idle;
        Some(vec![
            SessionEffect::ResetConversationState,
            SessionEffect::ReportLoadFailure {
                conversation_id: ticket.conversation_id.clone(),
            },
            SessionEffect::PublishPhase(SessionPhase::Idle),
        ])
    }

    fn next_ticket(&mut self, conversation_id: &str) -> SelectionTicket {
        self.epoch += 1;
        SelectionTicket {
            conversation_id: conversation_id.to_owned(),
            epoch: self.epoch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin_ticket(effects: &[SessionEffect]) -> SelectionTicket {
        effects
            .iter()
            .find_map(|effect| match effect {
                SessionEffect::BeginFetch(ticket) => Some(ticket.clone()),
                _ => None,
            })
            .expect("selection should begin a fetch")
    }

    fn loading(id: &str) -> SessionPhase {
        SessionPhase::Loading {
            conversation_id: id.to_owned(),
        }
    }

    fn active(id: &str) -> SessionPhase {
        SessionPhase::Active {
            conversation_id: id.to_owned(),
        }
    }

    #[test]
    fn runs_select_load_deselect_cycle() {
        let mut sm = SessionStateMachine::default();

        let effects = sm.select("c1");
        let ticket = begin_ticket(&effects);
        assert_eq!(sm.phase(), &loading("c1"));
        assert_eq!(
            effects,
            vec![
                SessionEffect::BeginFetch(ticket.clone()),
                SessionEffect::PublishPhase(loading("c1")),
            ]
        );

        let effects = sm.on_fetch_succeeded(&ticket).expect("ticket is current");
        assert_eq!(
            effects,
            vec![
                SessionEffect::ApplyHistory(ticket),
                SessionEffect::JoinConversation {
                    conversation_id: "c1".into()
                },
                SessionEffect::PublishPhase(active("c1")),
            ]
        );
        assert_eq!(sm.active_conversation(), Some("c1"));

        let effects = sm.deselect();
        assert_eq!(
            effects,
            vec![
                SessionEffect::LeaveConversation {
                    conversation_id: "c1".into()
                },
                SessionEffect::ResetConversationState,
                SessionEffect::PublishPhase(SessionPhase::Idle),
            ]
        );
        assert_eq!(sm.phase(), &SessionPhase::Idle);
    }

    #[test]
    fn switching_from_active_leaves_then_loads_without_idle() {
        let mut sm = SessionStateMachine::default();
        let first = begin_ticket(&sm.select("c1"));
        sm.on_fetch_succeeded(&first).expect("current");

        let effects = sm.select("c2");

        assert_eq!(
            effects[0],
            SessionEffect::LeaveConversation {
                conversation_id: "c1".into()
            }
        );
        assert_eq!(effects[1], SessionEffect::ResetConversationState);
        assert!(!effects.contains(&SessionEffect::PublishPhase(SessionPhase::Idle)));
        assert_eq!(sm.phase(), &loading("c2"));
    }

    #[test]
    fn superseded_fetch_is_stale() {
        let mut sm = SessionStateMachine::default();
        let c1 = begin_ticket(&sm.select("c1"));
        let c2 = begin_ticket(&sm.select("c2"));

        assert!(sm.on_fetch_succeeded(&c1).is_none());
        assert_eq!(sm.phase(), &loading("c2"));

        sm.on_fetch_succeeded(&c2).expect("c2 is current");
        assert!(sm.on_fetch_failed(&c1).is_none());
        assert_eq!(sm.phase(), &active("c2"));
    }

    #[test]
    fn reselecting_same_conversation_keeps_original_ticket() {
        let mut sm = SessionStateMachine::default();
        let ticket = begin_ticket(&sm.select("c1"));

        assert!(sm.select("c1").is_empty());
        assert!(sm.is_current(&ticket));

        sm.on_fetch_succeeded(&ticket).expect("current");
        assert!(sm.select("c1").is_empty());
    }

    #[test]
    fn bouncing_back_invalidates_the_first_fetch() {
        let mut sm = SessionStateMachine::default();
        let first = begin_ticket(&sm.select("c1"));
        sm.select("c2");
        let again = begin_ticket(&sm.select("c1"));

        assert!(!sm.is_current(&first));
        assert!(sm.is_current(&again));
    }

    #[test]
    fn fetch_failure_returns_to_idle_and_reports() {
        let mut sm = SessionStateMachine::default();
        let ticket = begin_ticket(&sm.select("c1"));

        let effects = sm.on_fetch_failed(&ticket).expect("current");

        assert!(effects.contains(&SessionEffect::ReportLoadFailure {
            conversation_id: "c1".into()
        }));
        assert!(effects.contains(&SessionEffect::ResetConversationState));
        assert_eq!(sm.phase(), &SessionPhase::Idle);
        assert!(sm.on_fetch_succeeded(&ticket).is_none());
    }

    #[test]
    fn deselect_while_loading_drops_in_flight_fetch() {
        let mut sm = SessionStateMachine::default();
        let ticket = begin_ticket(&sm.select("c1"));

        let effects = sm.deselect();

        assert!(!effects
            .iter()
            .any(|effect| matches!(effect, SessionEffect::LeaveConversation { .. })));
        assert!(sm.on_fetch_succeeded(&ticket).is_none());
        assert!(sm.deselect().is_empty());
    }
}
