//! Group profile updates

use chrono::Utc;

use crate::types::{GroupMessage, GroupOperation, Message, MessageKind, Properties, Value};

use super::tracker::Tracker;

/// Profile updates for one group, identified by key and id.
pub struct Group<'a> {
    tracker: &'a Tracker,
    group_key: String,
    group_id: Value,
}

impl<'a> Group<'a> {
    pub(super) fn new(tracker: &'a Tracker, group_key: &str, group_id: Value) -> Self {
        Self {
            tracker,
            group_key: group_key.to_string(),
            group_id,
        }
    }

    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    pub fn group_id(&self) -> &Value {
        &self.group_id
    }

    fn record(&self, operation: GroupOperation, payload: Value) {
        if self.tracker.is_opted_out(operation.as_str()) {
            return;
        }
        if self.group_key.is_empty() || self.group_id.is_null() {
            tracing::error!(
                token = %self.tracker.token(),
                "Group updates need a non-empty key and id"
            );
            return;
        }
        self.tracker.enqueue(Message::GroupUpdate(GroupMessage {
            token: self.tracker.token().to_string(),
            operation,
            payload,
            group_key: self.group_key.clone(),
            group_id: self.group_id.clone(),
            timestamp: Utc::now(),
            metadata: self.tracker.session().next(MessageKind::Groups),
        }));
    }

    fn single(name: &str, value: Value) -> Value {
        let mut props = Properties::new();
        props.insert(name, value);
        Value::Object(props)
    }

    pub fn set(&self, properties: Properties) {
        self.record(GroupOperation::Set, Value::Object(properties));
    }

    pub fn set_once(&self, properties: Properties) {
        self.record(GroupOperation::SetOnce, Value::Object(properties));
    }

    pub fn union(&self, name: &str, values: Vec<Value>) {
        self.record(GroupOperation::Union, Self::single(name, Value::Array(values)));
    }

    pub fn remove(&self, name: &str, value: impl Into<Value>) {
        self.record(GroupOperation::Remove, Self::single(name, value.into()));
    }

    pub fn unset(&self, name: &str) {
        self.record(GroupOperation::Unset, Value::Array(vec![Value::from(name)]));
    }

    /// Delete the whole group profile.
    pub fn delete_group(&self) {
        self.record(GroupOperation::Delete, Value::Null);
    }
}
