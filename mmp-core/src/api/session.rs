//! Session metadata attached to every message as `$mp_metadata`

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::types::{MessageKind, Properties};

/// Per-tracker session data attached to every message as `$mp_metadata`.
#[derive(Debug)]
pub struct SessionMetadata {
    session_id: String,
    session_start_sec: i64,
    events_seq: AtomicU64,
    people_seq: AtomicU64,
    groups_seq: AtomicU64,
}

impl SessionMetadata {
    pub fn new() -> Self {
        Self {
            session_id: random_hex(),
            session_start_sec: Utc::now().timestamp(),
            events_seq: AtomicU64::new(0),
            people_seq: AtomicU64::new(0),
            groups_seq: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Metadata for the next message of `kind`; bumps that kind's counter.
    pub fn next(&self, kind: MessageKind) -> Properties {
        let counter = match kind {
            MessageKind::Events => &self.events_seq,
            MessageKind::People => &self.people_seq,
            MessageKind::Groups => &self.groups_seq,
        };
        let seq = counter.fetch_add(1, Ordering::Relaxed);

        let mut metadata = Properties::new();
        metadata.insert("$mp_event_id", random_hex());
        metadata.insert("$mp_session_id", self.session_id.as_str());
        metadata.insert("$mp_session_seq_id", seq as i64);
        metadata.insert("$mp_session_start_sec", self.session_start_sec);
        metadata
    }
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self::new()
    }
}

fn random_hex() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn test_sequence_is_per_kind() {
        let session = SessionMetadata::new();
        let first = session.next(MessageKind::Events);
        let second = session.next(MessageKind::Events);
        let people = session.next(MessageKind::People);

        assert_eq!(first.get("$mp_session_seq_id"), Some(&Value::Int(0)));
        assert_eq!(second.get("$mp_session_seq_id"), Some(&Value::Int(1)));
        assert_eq!(people.get("$mp_session_seq_id"), Some(&Value::Int(0)));
        assert_ne!(first.get("$mp_event_id"), second.get("$mp_event_id"));
        assert_eq!(
            first.get("$mp_session_id").and_then(Value::as_str),
            Some(session.session_id())
        );
    }
}
