//! Durable queue of pending messages
//!
//! Records are FIFO per token and carry a per-token monotonic sequence
//! number. The SQLite write happens on the caller's thread under the queue
//! lock, so a record is visible to `peek_batch` as soon as `enqueue` returns.
//! When the durable write fails the record lives in an in-memory fallback
//! list instead and is merged back in sequence order.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::db::Database;
use crate::types::{Message, MessageKind};

/// One queued message.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord {
    pub token: String,
    pub seq: i64,
    pub kind: MessageKind,
    /// Wire JSON of the message
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    next_seq: HashMap<String, i64>,
    /// Records whose durable write failed, in sequence order
    fallback: Vec<QueueRecord>,
}

/// Pending message queue shared by every tracker.
pub struct EventQueue {
    db: Arc<Database>,
    ceiling: usize,
    state: Mutex<QueueState>,
    evicted: AtomicU64,
}

impl EventQueue {
    /// `ceiling` is the per-token record limit.
    pub fn new(db: Arc<Database>, ceiling: usize) -> Self {
        Self {
            db,
            ceiling: ceiling.max(1),
            state: Mutex::new(QueueState::default()),
            evicted: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message. Returns its sequence id, or `None` if it could not
    /// be encoded and was dropped.
    pub fn enqueue(&self, message: &Message) -> Option<i64> {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(
                    token = %message.token(),
                    error = %e,
                    "Dropping message that could not be encoded"
                );
                return None;
            }
        };

        let mut state = self.state();
        let token = message.token().to_string();
        let seq = self.allocate_seq(&mut state, &token);
        let record = QueueRecord {
            token,
            seq,
            kind: message.kind(),
            payload,
            created_at: Utc::now(),
        };

        match self.db.append_record(&record, self.ceiling) {
            Ok(evicted) => self.note_evicted(&record.token, evicted),
            Err(e) => {
                tracing::warn!(
                    token = %record.token,
                    seq = record.seq,
                    error = %e,
                    "Durable enqueue failed, keeping record in memory"
                );
                let token = record.token.clone();
                state.fallback.push(record);
                let evicted = Self::cap_fallback(&mut state.fallback, &token, self.ceiling);
                self.note_evicted(&token, evicted);
            }
        }

        Some(seq)
    }

    fn allocate_seq(&self, state: &mut QueueState, token: &str) -> i64 {
        if !state.next_seq.contains_key(token) {
            let stored = self.db.max_seq(token).unwrap_or_else(|e| {
                tracing::warn!(token = %token, error = %e, "Could not read last sequence id");
                None
            });
            let in_memory = state
                .fallback
                .iter()
                .filter(|r| r.token == token)
                .map(|r| r.seq)
                .max();
            let next = stored.max(in_memory).unwrap_or(0) + 1;
            state.next_seq.insert(token.to_string(), next);
        }
        let next = state.next_seq.entry(token.to_string()).or_insert(1);
        let seq = *next;
        *next += 1;
        seq
    }

    fn cap_fallback(fallback: &mut Vec<QueueRecord>, token: &str, ceiling: usize) -> usize {
        let count = fallback.iter().filter(|r| r.token == token).count();
        let mut excess = count.saturating_sub(ceiling);
        let evicted = excess;
        fallback.retain(|r| {
            if excess > 0 && r.token == token {
                excess -= 1;
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Count `evicted` records dropped by a ceiling, here or in a holding
    /// area such as waiting people updates.
    pub(crate) fn note_evicted(&self, token: &str, evicted: usize) {
        if evicted > 0 {
            let total = self.evicted.fetch_add(evicted as u64, Ordering::Relaxed) + evicted as u64;
            tracing::warn!(
                token = %token,
                evicted,
                total_evicted = total,
                ceiling = self.ceiling,
                "Queue ceiling exceeded, evicted oldest records"
            );
        }
    }

    /// Up to `max` oldest records of one kind, in enqueue order.
    pub fn peek_batch(&self, token: &str, kind: MessageKind, max: usize) -> Vec<QueueRecord> {
        let state = self.state();
        let mut records = self.db.select_records(token, kind, max).unwrap_or_else(|e| {
            tracing::error!(token = %token, kind = %kind, error = %e, "Failed to read queue");
            Vec::new()
        });
        records.extend(
            state
                .fallback
                .iter()
                .filter(|r| r.token == token && r.kind == kind)
                .take(max)
                .cloned(),
        );
        records.sort_by_key(|r| r.seq);
        records.truncate(max);
        records
    }

    /// Remove records of one kind with `seq <= up_to`. Returns how many.
    pub fn remove_up_to(&self, token: &str, kind: MessageKind, up_to: i64) -> usize {
        let mut state = self.state();
        let mut removed = self
            .db
            .delete_records_up_to(token, kind, up_to)
            .unwrap_or_else(|e| {
                tracing::error!(
                    token = %token,
                    kind = %kind,
                    error = %e,
                    "Failed to remove records"
                );
                0
            });
        let before = state.fallback.len();
        state
            .fallback
            .retain(|r| !(r.token == token && r.kind == kind && r.seq <= up_to));
        removed += before - state.fallback.len();
        removed
    }

    /// Number of queued records for `token`, all kinds.
    pub fn size(&self, token: &str) -> usize {
        let state = self.state();
        let stored = self.db.count_records(token).unwrap_or_else(|e| {
            tracing::error!(token = %token, error = %e, "Failed to count queue");
            0
        });
        stored + state.fallback.iter().filter(|r| r.token == token).count()
    }

    /// Drop every record of `token` immediately.
    pub fn clear(&self, token: &str) -> usize {
        let mut state = self.state();
        let mut removed = self.db.delete_token_records(token).unwrap_or_else(|e| {
            tracing::error!(token = %token, error = %e, "Failed to clear queue");
            0
        });
        let before = state.fallback.len();
        state.fallback.retain(|r| r.token != token);
        removed += before - state.fallback.len();
        tracing::info!(token = %token, removed, "Emptied tracking queue");
        removed
    }

    /// Tokens with queued records.
    pub fn tokens(&self) -> Vec<String> {
        let state = self.state();
        let mut tokens: BTreeSet<String> = self
            .db
            .list_queue_tokens()
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "Failed to list queue tokens");
                Vec::new()
            })
            .into_iter()
            .collect();
        tokens.extend(state.fallback.iter().map(|r| r.token.clone()));
        tokens.into_iter().collect()
    }

    /// Total records evicted by the ceiling since startup.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventMessage, GroupMessage, GroupOperation, Identifiers, Properties, Value};
    use proptest::prelude::*;

    fn test_queue(ceiling: usize) -> EventQueue {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        EventQueue::new(Arc::new(db), ceiling)
    }

    fn event(token: &str, name: &str) -> Message {
        Message::Event(EventMessage {
            token: token.to_string(),
            name: name.to_string(),
            timestamp: Utc::now(),
            ids: Identifiers::default(),
            properties: Properties::new(),
            metadata: Properties::new(),
        })
    }

    fn group(token: &str) -> Message {
        Message::GroupUpdate(GroupMessage {
            token: token.to_string(),
            operation: GroupOperation::Set,
            payload: Value::Null,
            group_key: "company".to_string(),
            group_id: Value::from("acme"),
            timestamp: Utc::now(),
            metadata: Properties::new(),
        })
    }

    fn names(records: &[QueueRecord]) -> Vec<String> {
        records
            .iter()
            .map(|r| {
                let v: serde_json::Value = serde_json::from_str(&r.payload).unwrap();
                v["event"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[test]
    fn test_enqueue_is_visible_immediately() {
        let queue = test_queue(100);
        let seq = queue.enqueue(&event("t1", "A")).unwrap();
        let batch = queue.peek_batch("t1", MessageKind::Events, 10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].seq, seq);
        assert_eq!(queue.size("t1"), 1);
    }

    #[test]
    fn test_sequence_ids_are_monotonic_per_token() {
        let queue = test_queue(100);
        let a = queue.enqueue(&event("t1", "A")).unwrap();
        let b = queue.enqueue(&event("t2", "B")).unwrap();
        let c = queue.enqueue(&event("t1", "C")).unwrap();
        assert!(c > a);
        assert_eq!(b, 1);
    }

    #[test]
    fn test_ceiling_keeps_most_recent() {
        let queue = test_queue(3);
        for name in ["1", "2", "3", "4", "5"] {
            queue.enqueue(&event("t1", name));
        }
        let batch = queue.peek_batch("t1", MessageKind::Events, 10);
        assert_eq!(names(&batch), vec!["3", "4", "5"]);
        assert_eq!(queue.evicted(), 2);
    }

    #[test]
    fn test_clear_then_enqueue_keeps_only_new() {
        let queue = test_queue(100);
        queue.enqueue(&event("t1", "A"));
        queue.enqueue(&event("t1", "B"));
        queue.enqueue(&event("t2", "other"));
        queue.clear("t1");
        queue.enqueue(&event("t1", "C"));

        assert_eq!(names(&queue.peek_batch("t1", MessageKind::Events, 10)), vec!["C"]);
        assert_eq!(queue.size("t2"), 1);
    }

    #[test]
    fn test_remove_up_to_is_per_kind() {
        let queue = test_queue(100);
        let a = queue.enqueue(&event("t1", "A")).unwrap();
        queue.enqueue(&group("t1"));
        let c = queue.enqueue(&event("t1", "C")).unwrap();

        assert_eq!(queue.remove_up_to("t1", MessageKind::Events, a), 1);
        assert_eq!(names(&queue.peek_batch("t1", MessageKind::Events, 10)), vec!["C"]);
        assert_eq!(queue.peek_batch("t1", MessageKind::Groups, 10).len(), 1);

        queue.remove_up_to("t1", MessageKind::Events, c);
        assert_eq!(queue.size("t1"), 1);
        assert_eq!(queue.tokens(), vec!["t1".to_string()]);
    }

    #[test]
    fn test_falls_back_to_memory_when_storage_fails() {
        let queue = test_queue(100);
        queue.enqueue(&event("t1", "A"));
        queue
            .db
            .connection()
            .execute_batch("DROP TABLE queue")
            .unwrap();

        let seq = queue.enqueue(&event("t1", "B")).unwrap();
        assert_eq!(seq, 2);
        let batch = queue.peek_batch("t1", MessageKind::Events, 10);
        assert_eq!(names(&batch), vec!["B"]);
        assert_eq!(queue.size("t1"), 1);

        assert_eq!(queue.remove_up_to("t1", MessageKind::Events, seq), 1);
        assert_eq!(queue.size("t1"), 0);
    }

    #[test]
    fn test_sequence_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let db = Database::open(&path).unwrap();
            db.migrate().unwrap();
            let queue = EventQueue::new(Arc::new(db), 100);
            queue.enqueue(&event("t1", "A"));
            queue.enqueue(&event("t1", "B"));
        }
        let db = Database::open(&path).unwrap();
        db.migrate().unwrap();
        let queue = EventQueue::new(Arc::new(db), 100);
        assert_eq!(queue.enqueue(&event("t1", "C")), Some(3));
        assert_eq!(
            names(&queue.peek_batch("t1", MessageKind::Events, 10)),
            vec!["A", "B", "C"]
        );
    }

    proptest! {
        #[test]
        fn prop_peek_batch_preserves_enqueue_order(
            ops in proptest::collection::vec((0usize..3, "[a-z]{1,6}"), 1..40)
        ) {
            let queue = test_queue(1000);
            let tokens = ["t0", "t1", "t2"];
            let mut expected: HashMap<&str, Vec<String>> = HashMap::new();
            for (t, name) in &ops {
                queue.enqueue(&event(tokens[*t], name));
                expected.entry(tokens[*t]).or_default().push(name.clone());
            }
            for (token, names_in_order) in expected {
                let batch = queue.peek_batch(token, MessageKind::Events, 1000);
                prop_assert_eq!(names(&batch), names_in_order);
            }
        }
    }
}
