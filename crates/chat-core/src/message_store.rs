use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::types::{Identity, Message, MessageBody};

/// How far, in seconds, a pushed image's timestamp may sit from the
/// provisional row's send time and still be treated as the same send.
const IMAGE_MATCH_WINDOW_SECS: i64 = 120;

/// Errors raised by store operations that require a specific state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No conversation has been loaded.
    #[error("no conversation is loaded")]
    NotLoaded,
    /// The message targets a different conversation than the loaded one.
    #[error("message for conversation '{actual}' does not belong to '{expected}'")]
    ForeignConversation { expected: String, actual: String },
    /// A provisional insert was attempted with an authoritative id.
    #[error("message '{0}' does not carry a provisional id")]
    NotProvisional(String),
}

/// Result of merging one message into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Appended at the end of the sequence.
    Inserted,
    /// The id was already observed; nothing changed.
    Duplicate,
    /// The message belongs to another conversation; nothing changed.
    ForeignConversation,
    /// A provisional row was replaced in place by this message.
    Reconciled { provisional_id: String },
}

/// Ordered, id-deduplicated message sequence for the active conversation.
///
/// Arrival order is preserved; pushes are never re-sorted against history.
#[derive(Debug, Clone)]
pub struct MessageStore {
    conversation_id: Option<String>,
    peer: Option<Identity>,
    items: Vec<Message>,
    /// Every authoritative id seen since the last load, including trimmed ones.
    observed: HashSet<String>,
    /// Provisional ids in insertion order.
    pending: Vec<String>,
    max_items: usize,
    /// Bumped on every visible change.
    revision: u64,
}

impl MessageStore {
    /// Create an empty store with a retention cap (`max_items >= 1`).
    pub fn new(max_items: usize) -> Self {
        Self {
            conversation_id: None,
            peer: None,
            items: Vec::new(),
            observed: HashSet::new(),
            pending: Vec::new(),
            max_items: max_items.max(1),
            revision: 0,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn peer(&self) -> Option<&Identity> {
        self.peer.as_ref()
    }

    /// Messages in display order.
    pub fn messages(&self) -> &[Message] {
        &self.items
    }

    pub fn pending_ids(&self) -> &[String] {
        &self.pending
    }

    /// Changes whenever the messages, pending ids or peer change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.observed.contains(message_id) || self.pending.iter().any(|id| id == message_id)
    }

    /// Replace the whole sequence with fetched history.
    ///
    /// Messages for other conversations and repeated ids inside the batch are
    /// skipped.
    pub fn load(
        &mut self,
        conversation_id: impl Into<String>,
        messages: Vec<Message>,
        peer: Identity,
    ) {
        let conversation_id = conversation_id.into();
        self.clear();

        for message in messages {
            if message.conversation_id != conversation_id {
                continue;
            }
            if self.observed.insert(message.id.clone()) {
                self.items.push(message);
            }
        }

        self.conversation_id = Some(conversation_id);
        self.peer = Some(peer);
        self.trim_to_max();
        self.touch();
    }

    /// Merge one authoritative message.
    pub fn append(&mut self, message: Message) -> AppendOutcome {
        if self.conversation_id.as_deref() != Some(message.conversation_id.as_str()) {
            return AppendOutcome::ForeignConversation;
        }
        if self.observed.contains(&message.id) {
            return AppendOutcome::Duplicate;
        }

        if let Some(provisional_id) = self.matching_provisional(&message) {
            return self.replace_provisional(&provisional_id, message);
        }

        self.observed.insert(message.id.clone());
        self.items.push(message);
        self.trim_to_max();
        self.touch();
        AppendOutcome::Inserted
    }

    /// Show a locally generated message before the backend acknowledges it.
    pub fn insert_provisional(&mut self, message: Message) -> Result<(), StoreError> {
        let expected = self.conversation_id.as_deref().ok_or(StoreError::NotLoaded)?;
        if expected != message.conversation_id {
            return Err(StoreError::ForeignConversation {
                expected: expected.to_owned(),
                actual: message.conversation_id,
            });
        }
        if !message.is_provisional() {
            return Err(StoreError::NotProvisional(message.id));
        }

        self.pending.push(message.id.clone());
        self.items.push(message);
        self.trim_to_max();
        self.touch();
        Ok(())
    }

    /// Swap a provisional row for the acknowledged message.
    ///
    /// When the row is already gone (a push got there first, or it was
    /// trimmed) this behaves like `append`. When the final id was already
    /// merged separately, the leftover provisional row is dropped so the
    /// message never shows twice.
    pub fn reconcile(&mut self, provisional_id: &str, message: Message) -> AppendOutcome {
        if self.conversation_id.as_deref() != Some(message.conversation_id.as_str()) {
            return AppendOutcome::ForeignConversation;
        }
        if !self.pending.iter().any(|id| id == provisional_id) {
            return self.append(message);
        }
        if self.observed.contains(&message.id) {
            self.withdraw(provisional_id);
            return AppendOutcome::Duplicate;
        }

        self.replace_provisional(provisional_id, message)
    }

    /// Remove a provisional row after a failed send.
    pub fn withdraw(&mut self, provisional_id: &str) -> bool {
        let Some(pending_idx) = self.pending.iter().position(|id| id == provisional_id) else {
            return false;
        };
        self.pending.remove(pending_idx);
        self.items.retain(|item| item.id != provisional_id);
        self.touch();
        true
    }

    /// Apply a read receipt; returns the ids whose flag flipped.
    pub fn mark_seen(&mut self, message_ids: &[String], seen_at: DateTime<Utc>) -> Vec<String> {
        let targets: HashSet<&str> = message_ids.iter().map(String::as_str).collect();
        let mut changed = Vec::new();
        for item in self.items.iter_mut() {
            if !item.seen && targets.contains(item.id.as_str()) {
                item.seen = true;
                item.seen_at = Some(seen_at);
                changed.push(item.id.clone());
            }
        }
        if !changed.is_empty() {
            self.touch();
        }
        changed
    }

    /// Forget everything, including the loaded conversation.
    pub fn clear(&mut self) {
        self.conversation_id = None;
        self.peer = None;
        self.items.clear();
        self.observed.clear();
        self.pending.clear();
        self.touch();
    }

    /// Pending row the pushed `message` most likely confirms.
    ///
    /// Text matches the oldest pending row with the same body. Images carry
    /// no comparable payload before upload, so they match the pending image
    /// whose send time is closest to the pushed timestamp, within
    /// `IMAGE_MATCH_WINDOW_SECS`.
    fn matching_provisional(&self, message: &Message) -> Option<String> {
        let candidates = self.pending.iter().filter_map(|pending_id| {
            self.items.iter().find(|item| {
                &item.id == pending_id
                    && item.sender == message.sender
                    && item.body.same_content(&message.body)
            })
        });

        let window = TimeDelta::seconds(IMAGE_MATCH_WINDOW_SECS);
        match message.body {
            MessageBody::Text { .. } => candidates.map(|item| item.id.clone()).next(),
            MessageBody::Image { .. } => candidates
                .map(|item| (item, (message.created_at - item.created_at).abs()))
                .filter(|(_, distance)| *distance <= window)
                .min_by_key(|(_, distance)| *distance)
                .map(|(item, _)| item.id.clone()),
        }
    }

    fn replace_provisional(&mut self, provisional_id: &str, message: Message) -> AppendOutcome {
        self.pending.retain(|id| id != provisional_id);
        self.observed.insert(message.id.clone());
        match self.items.iter_mut().find(|item| item.id == provisional_id) {
            Some(slot) => *slot = message,
            None => self.items.push(message),
        }
        self.touch();
        AppendOutcome::Reconciled {
            provisional_id: provisional_id.to_owned(),
        }
    }

    fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    fn trim_to_max(&mut self) {
        if self.items.len() <= self.max_items {
            return;
        }

        let excess = self.items.len() - self.max_items;
        let dropped: Vec<String> = self.items.drain(0..excess).map(|item| item.id).collect();
        self.pending.retain(|id| !dropped.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::types::MessageBody;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 10, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn message(id: &str, conversation_id: &str, sender: &str, text: &str) -> Message {
        Message {
            id: id.to_owned(),
            conversation_id: conversation_id.to_owned(),
            sender: sender.to_owned(),
            body: MessageBody::Text {
                text: text.to_owned(),
            },
            seen: false,
            seen_at: None,
            created_at: at(0),
        }
    }

    fn peer() -> Identity {
        Identity::new("bob", "Bob")
    }

    fn ids(store: &MessageStore) -> Vec<&str> {
        store.messages().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn duplicate_push_after_history_is_ignored() {
        let mut store = MessageStore::new(100);
        store.load(
            "c1",
            vec![
                message("m1", "c1", "bob", "hi"),
                message("m2", "c1", "alice", "hey"),
            ],
            peer(),
        );

        let outcome = store.append(message("m2", "c1", "alice", "hey"));

        assert_eq!(outcome, AppendOutcome::Duplicate);
        assert_eq!(ids(&store), vec!["m1", "m2"]);
    }

    #[test]
    fn repeated_appends_keep_each_id_once() {
        let mut store = MessageStore::new(100);
        store.load("c1", Vec::new(), peer());

        let sequence = ["a", "b", "a", "c", "b", "b", "d", "a", "c"];
        for id in sequence {
            store.append(message(id, "c1", "bob", id));
        }

        assert_eq!(ids(&store), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn preserves_arrival_order_without_resorting() {
        let mut store = MessageStore::new(100);
        store.load("c1", vec![message("m1", "c1", "bob", "one")], peer());

        let mut late = message("m0", "c1", "bob", "older");
        late.created_at = Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).single().expect("ts");
        store.append(late);

        assert_eq!(ids(&store), vec!["m1", "m0"]);
    }

    #[test]
    fn load_drops_foreign_and_repeated_entries() {
        let mut store = MessageStore::new(100);
        store.load(
            "c1",
            vec![
                message("m1", "c1", "bob", "one"),
                message("x1", "c2", "bob", "other"),
                message("m1", "c1", "bob", "one again"),
            ],
            peer(),
        );

        assert_eq!(ids(&store), vec!["m1"]);
        assert_eq!(store.messages()[0].body.preview(), "one");
    }

    #[test]
    fn rejects_messages_for_other_conversations() {
        let mut store = MessageStore::new(100);
        store.load("c1", Vec::new(), peer());

        assert_eq!(
            store.append(message("m1", "c2", "bob", "wrong room")),
            AppendOutcome::ForeignConversation
        );
        assert!(store.is_empty());

        let mut empty = MessageStore::new(10);
        assert_eq!(
            empty.append(message("m1", "c1", "bob", "no room loaded")),
            AppendOutcome::ForeignConversation
        );
    }

    #[test]
    fn reload_replaces_previous_conversation() {
        let mut store = MessageStore::new(100);
        store.load("c1", vec![message("m1", "c1", "bob", "one")], peer());
        store.load("c2", vec![message("n1", "c2", "carol", "two")], Identity::new("carol", "Carol"));

        assert_eq!(store.conversation_id(), Some("c2"));
        assert_eq!(ids(&store), vec!["n1"]);
        assert!(!store.contains("m1"));
    }

    #[test]
    fn ack_reconciles_provisional_row_in_place() {
        let mut store = MessageStore::new(100);
        store.load("c1", vec![message("m1", "c1", "bob", "hi")], peer());

        let provisional = Message::provisional(
            "c1",
            "alice",
            MessageBody::Text { text: "yo".into() },
            at(1),
        );
        let provisional_id = provisional.id.clone();
        store.insert_provisional(provisional).expect("provisional insert");
        store.append(message("m2", "c1", "bob", "interleaved"));

        let outcome = store.reconcile(&provisional_id, message("m3", "c1", "alice", "yo"));

        assert_eq!(
            outcome,
            AppendOutcome::Reconciled {
                provisional_id: provisional_id.clone()
            }
        );
        assert_eq!(ids(&store), vec!["m1", "m3", "m2"]);
        assert!(store.pending_ids().is_empty());
    }

    #[test]
    fn push_before_ack_reconciles_and_ack_is_then_idempotent() {
        let mut store = MessageStore::new(100);
        store.load("c1", Vec::new(), peer());

        let provisional = Message::provisional(
            "c1",
            "alice",
            MessageBody::Text { text: "yo".into() },
            at(1),
        );
        let provisional_id = provisional.id.clone();
        store.insert_provisional(provisional).expect("provisional insert");

        let pushed = store.append(message("m3", "c1", "alice", "yo"));
        assert_eq!(
            pushed,
            AppendOutcome::Reconciled {
                provisional_id: provisional_id.clone()
            }
        );

        let acked = store.reconcile(&provisional_id, message("m3", "c1", "alice", "yo"));
        assert_eq!(acked, AppendOutcome::Duplicate);
        assert_eq!(ids(&store), vec!["m3"]);
    }

    #[test]
    fn unmatched_push_then_ack_drops_leftover_provisional() {
        let mut store = MessageStore::new(100);
        store.load("c1", Vec::new(), peer());

        let provisional = Message::provisional(
            "c1",
            "alice",
            MessageBody::Text { text: "yo ".into() },
            at(1),
        );
        let provisional_id = provisional.id.clone();
        store.insert_provisional(provisional).expect("provisional insert");
        store.append(message("m3", "c1", "alice", "yo"));

        let acked = store.reconcile(&provisional_id, message("m3", "c1", "alice", "yo"));

        assert_eq!(acked, AppendOutcome::Duplicate);
        assert_eq!(ids(&store), vec!["m3"]);
    }

    #[test]
    fn withdraw_removes_failed_provisional_row() {
        let mut store = MessageStore::new(100);
        store.load("c1", Vec::new(), peer());
        let provisional = Message::provisional(
            "c1",
            "alice",
            MessageBody::Text { text: "lost".into() },
            at(1),
        );
        let provisional_id = provisional.id.clone();
        store.insert_provisional(provisional).expect("provisional insert");

        assert!(store.withdraw(&provisional_id));
        assert!(!store.withdraw(&provisional_id));
        assert!(store.is_empty());
    }

    #[test]
    fn provisional_insert_requires_loaded_matching_conversation() {
        let mut store = MessageStore::new(10);
        let draft = Message::provisional("c1", "alice", MessageBody::Text { text: "x".into() }, at(0));
        assert_eq!(store.insert_provisional(draft.clone()), Err(StoreError::NotLoaded));

        store.load("c2", Vec::new(), peer());
        assert!(matches!(
            store.insert_provisional(draft),
            Err(StoreError::ForeignConversation { .. })
        ));

        store.load("c1", Vec::new(), peer());
        assert_eq!(
            store.insert_provisional(message("m1", "c1", "alice", "x")),
            Err(StoreError::NotProvisional("m1".into()))
        );
    }

    #[test]
    fn trimmed_ids_stay_idempotent() {
        let mut store = MessageStore::new(2);
        store.load("c1", Vec::new(), peer());
        for id in ["m1", "m2", "m3"] {
            store.append(message(id, "c1", "bob", id));
        }
        assert_eq!(ids(&store), vec!["m2", "m3"]);

        assert_eq!(
            store.append(message("m1", "c1", "bob", "m1")),
            AppendOutcome::Duplicate
        );
        assert_eq!(ids(&store), vec!["m2", "m3"]);
    }

    #[test]
    fn read_receipt_flips_only_unseen_targets() {
        let mut store = MessageStore::new(10);
        let mut already_seen = message("m2", "c1", "alice", "b");
        already_seen.seen = true;
        store.load(
            "c1",
            vec![message("m1", "c1", "alice", "a"), already_seen],
            peer(),
        );

        let changed = store.mark_seen(&["m1".into(), "m2".into(), "m9".into()], at(5));

        assert_eq!(changed, vec!["m1".to_owned()]);
        assert!(store.messages()[0].seen);
        assert_eq!(store.messages()[0].seen_at, Some(at(5)));
    }

    fn image(id: &str, created_at: DateTime<Utc>) -> Message {
        Message {
            id: id.to_owned(),
            conversation_id: "c1".to_owned(),
            sender: "alice".to_owned(),
            body: MessageBody::Image {
                image: crate::types::ImageRef {
                    url: format!("https://cdn.example.com/{id}.png"),
                    public_id: id.to_owned(),
                },
            },
            seen: false,
            seen_at: None,
            created_at,
        }
    }

    fn pending_image(store: &mut MessageStore, sent_at: DateTime<Utc>) -> String {
        let provisional = Message::provisional(
            "c1",
            "alice",
            MessageBody::Image {
                image: crate::types::ImageRef {
                    url: String::new(),
                    public_id: String::new(),
                },
            },
            sent_at,
        );
        let provisional_id = provisional.id.clone();
        store.insert_provisional(provisional).expect("provisional insert");
        provisional_id
    }

    #[test]
    fn image_push_reconciles_the_closest_pending_image() {
        let mut store = MessageStore::new(100);
        store.load("c1", Vec::new(), peer());
        let first = pending_image(&mut store, at(1));
        let second = pending_image(&mut store, at(3));

        let pushed = store.append(image("m2", at(4)));
        assert_eq!(
            pushed,
            AppendOutcome::Reconciled {
                provisional_id: second.clone()
            }
        );

        let acked = store.reconcile(&first, image("m1", at(2)));
        assert_eq!(
            acked,
            AppendOutcome::Reconciled {
                provisional_id: first
            }
        );
        assert_eq!(ids(&store), vec!["m1", "m2"]);
        assert!(store.pending_ids().is_empty());
    }

    #[test]
    fn image_push_far_from_send_time_is_a_new_message() {
        let mut store = MessageStore::new(100);
        store.load("c1", Vec::new(), peer());
        let provisional_id = pending_image(&mut store, at(1));

        let outcome = store.append(image("m9", at(30)));

        assert_eq!(outcome, AppendOutcome::Inserted);
        assert_eq!(store.pending_ids(), [provisional_id]);
    }

    #[test]
    fn revision_moves_only_on_visible_changes() {
        let mut store = MessageStore::new(10);
        let initial = store.revision();

        store.load("c1", vec![message("m1", "c1", "bob", "a")], peer());
        let loaded = store.revision();
        assert_ne!(loaded, initial);

        store.append(message("m1", "c1", "bob", "a"));
        store.append(message("x1", "c2", "bob", "elsewhere"));
        assert!(store.mark_seen(&["missing".to_owned()], at(2)).is_empty());
        assert_eq!(store.revision(), loaded);

        store.append(message("m2", "c1", "bob", "b"));
        assert_ne!(store.revision(), loaded);
    }

    #[test]
    fn clear_forgets_conversation_and_observed_ids() {
        let mut store = MessageStore::new(10);
        store.load("c1", vec![message("m1", "c1", "bob", "a")], peer());
        store.clear();

        assert_eq!(store.conversation_id(), None);
        assert!(store.peer().is_none());
        assert!(store.is_empty());
        assert!(!store.contains("m1"));
    }
}
