//! People profile updates

use chrono::{DateTime, Utc};

use crate::decide::Notification;
use crate::store::WaitingPeopleUpdate;
use crate::types::{
    Identifiers, Message, MessageKind, PeopleMessage, PeopleOperation, Properties,
    PushTokenMessage, Value,
};

use super::tracker::Tracker;

const ANDROID_DEVICES: &str = "$android_devices";
const TRANSACTIONS: &str = "$transactions";
const ENGAGE_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// People profile updates for a tracker.
///
/// Updates made before any people distinct id exists are held in the store
/// and sent once [`People::identify`] is called.
pub struct People<'a> {
    tracker: &'a Tracker,
    fixed_distinct_id: Option<String>,
}

impl<'a> People<'a> {
    pub(super) fn new(tracker: &'a Tracker) -> Self {
        Self {
            tracker,
            fixed_distinct_id: None,
        }
    }

    /// A handle that always writes to `distinct_id`'s profile.
    pub fn with_identity(&self, distinct_id: &str) -> People<'a> {
        People {
            tracker: self.tracker,
            fixed_distinct_id: Some(distinct_id.to_string()),
        }
    }

    /// Target profile, if one is known.
    pub fn distinct_id(&self) -> Option<String> {
        self.fixed_distinct_id.clone().or_else(|| {
            self.tracker.state().identity.people_distinct_id.clone()
        })
    }

    pub fn is_identified(&self) -> bool {
        self.distinct_id().is_some()
    }

    /// Send people updates to `distinct_id`, including any held updates.
    pub fn identify(&self, distinct_id: &str) {
        let token = self.tracker.token();
        if self.fixed_distinct_id.is_some() {
            tracing::error!(
                token = %token,
                "Can't identify a people handle with a fixed distinct id"
            );
            return;
        }
        if self.tracker.is_opted_out("people.identify") {
            return;
        }
        if distinct_id.is_empty() {
            tracing::error!(token = %token, "Can't identify people with an empty distinct id");
            return;
        }

        // Taken under the identity lock so `record` can't hold an update
        // after the take
        let waiting = {
            let mut state = self.tracker.state();
            state.identity.people_distinct_id = Some(distinct_id.to_string());
            self.tracker.store().save_identity(token, &state.identity);
            self.tracker.decide().set_distinct_id(distinct_id);
            self.tracker.store().take_waiting_people(token)
        };
        if !waiting.is_empty() {
            tracing::debug!(token = %token, count = waiting.len(), "Sending held people updates");
        }
        for update in waiting {
            let message =
                self.message(update.operation, update.payload, update.timestamp, distinct_id);
            self.tracker.enqueue(message);
        }
    }

    fn message(
        &self,
        operation: PeopleOperation,
        payload: Value,
        timestamp: DateTime<Utc>,
        distinct_id: &str,
    ) -> Message {
        Message::PeopleUpdate(PeopleMessage {
            token: self.tracker.token().to_string(),
            operation,
            payload,
            timestamp,
            ids: self.ids(distinct_id),
            metadata: self.tracker.session().next(MessageKind::People),
        })
    }

    fn ids(&self, distinct_id: &str) -> Identifiers {
        Identifiers {
            distinct_id: Some(distinct_id.to_string()),
            device_id: self.tracker.get_anonymous_id(),
            user_id: Some(distinct_id.to_string()),
        }
    }

    fn record(&self, operation: PeopleOperation, payload: Value) {
        if self.tracker.is_opted_out(operation.as_str()) {
            return;
        }
        let timestamp = Utc::now();
        let token = self.tracker.token();
        let state = self.tracker.state();
        let distinct_id = self
            .fixed_distinct_id
            .clone()
            .or_else(|| state.identity.people_distinct_id.clone());

        match distinct_id {
            Some(id) => {
                drop(state);
                let message = self.message(operation, payload, timestamp, &id);
                self.tracker.enqueue(message);
            }
            None => {
                tracing::debug!(
                    token = %token,
                    operation = operation.as_str(),
                    "No people distinct id yet, holding update"
                );
                let queue = self.tracker.dispatcher().queue();
                let evicted = self.tracker.store().push_waiting_people(
                    token,
                    WaitingPeopleUpdate {
                        operation,
                        payload,
                        timestamp,
                    },
                    queue.ceiling(),
                );
                drop(state);
                queue.note_evicted(token, evicted);
            }
        }
    }

    fn single(name: &str, value: Value) -> Value {
        let mut props = Properties::new();
        props.insert(name, value);
        Value::Object(props)
    }

    // ============================================
    // Profile operations
    // ============================================

    /// `$set`, with the device description underneath `properties`.
    pub fn set(&self, properties: Properties) {
        let mut payload = self.tracker.device_info().properties().clone();
        payload.extend_from(&properties);
        self.record(PeopleOperation::Set, Value::Object(payload));
    }

    pub fn set_once(&self, properties: Properties) {
        self.record(PeopleOperation::SetOnce, Value::Object(properties));
    }

    /// `$add`; non-numeric values are skipped.
    pub fn increment(&self, properties: Properties) {
        let numeric: Properties = properties
            .into_iter()
            .filter(|(name, value)| {
                let ok = value.as_f64().is_some();
                if !ok {
                    tracing::warn!(property = %name, "Skipping non-numeric increment");
                }
                ok
            })
            .collect();
        if numeric.is_empty() {
            return;
        }
        self.record(PeopleOperation::Add, Value::Object(numeric));
    }

    pub fn merge(&self, name: &str, updates: Properties) {
        self.record(PeopleOperation::Merge, Self::single(name, Value::Object(updates)));
    }

    pub fn append(&self, name: &str, value: impl Into<Value>) {
        self.record(PeopleOperation::Append, Self::single(name, value.into()));
    }

    pub fn union(&self, name: &str, values: Vec<Value>) {
        self.record(PeopleOperation::Union, Self::single(name, Value::Array(values)));
    }

    pub fn remove(&self, name: &str, value: impl Into<Value>) {
        self.record(PeopleOperation::Remove, Self::single(name, value.into()));
    }

    pub fn unset(&self, name: &str) {
        self.record(PeopleOperation::Unset, Value::Array(vec![Value::from(name)]));
    }

    /// Append a transaction to `$transactions`.
    pub fn track_charge(&self, amount: f64, properties: Properties) {
        if self.tracker.is_opted_out("track_charge") {
            return;
        }
        let Some(amount) = Value::float(amount) else {
            tracing::error!(token = %self.tracker.token(), "Refusing to track a non-finite charge");
            return;
        };
        let mut transaction = Properties::new();
        transaction.insert("$amount", amount);
        transaction.insert("$time", Utc::now().format(ENGAGE_DATE_FORMAT).to_string());
        transaction.extend_from(&properties);
        self.append(TRANSACTIONS, transaction);
    }

    pub fn clear_charges(&self) {
        self.unset(TRANSACTIONS);
    }

    /// Delete the whole profile.
    pub fn delete_user(&self) {
        self.record(PeopleOperation::Delete, Value::Null);
    }

    // ============================================
    // Push registration
    // ============================================

    /// Store the push token and add it to the profile's devices.
    pub fn set_push_registration_id(&self, registration_id: &str) {
        let token = self.tracker.token();
        if !self.tracker.capabilities().push_notifications {
            tracing::warn!(
                token = %token,
                "Push notifications are not enabled, ignoring registration id"
            );
            return;
        }
        if registration_id.is_empty() || self.tracker.is_opted_out("set_push_registration_id") {
            return;
        }

        self.tracker.store().set_push_id(token, registration_id);
        match self.distinct_id() {
            Some(id) => {
                let message = Message::PushTokenLink(PushTokenMessage {
                    token: token.to_string(),
                    registration_id: registration_id.to_string(),
                    timestamp: Utc::now(),
                    ids: self.ids(&id),
                    metadata: self.tracker.session().next(MessageKind::People),
                });
                self.tracker.enqueue(message);
            }
            None => {
                self.union(ANDROID_DEVICES, vec![Value::from(registration_id)]);
            }
        }
    }

    /// With `None`, forget the stored id and empty the profile's devices.
    /// With an id, remove just that device.
    pub fn clear_push_registration_id(&self, registration_id: Option<&str>) {
        let token = self.tracker.token();
        let store = self.tracker.store();
        match registration_id {
            None => {
                store.clear_push_id(token);
                self.record(
                    PeopleOperation::Set,
                    Self::single(ANDROID_DEVICES, Value::Array(Vec::new())),
                );
            }
            Some(id) => {
                if store.push_id(token).as_deref() == Some(id) {
                    store.clear_push_id(token);
                }
                self.remove(ANDROID_DEVICES, id);
            }
        }
    }

    pub fn get_push_registration_id(&self) -> Option<String> {
        self.tracker.store().push_id(self.tracker.token())
    }

    // ============================================
    // In-app notifications
    // ============================================

    /// Take the next pending in-app notification, at most once.
    pub fn next_notification(&self) -> Option<Notification> {
        if !self.tracker.capabilities().in_app_notifications {
            tracing::debug!(token = %self.tracker.token(), "In-app notifications are not enabled");
            return None;
        }
        self.tracker.decide().next_notification()
    }

    /// Take a specific in-app notification, at most once.
    pub fn get_notification(&self, campaign_id: u64) -> Option<Notification> {
        if !self.tracker.capabilities().in_app_notifications {
            return None;
        }
        self.tracker.decide().get_notification(campaign_id)
    }

    /// Track an event carrying the notification's campaign properties.
    pub fn track_notification(
        &self,
        event_name: &str,
        notification: &Notification,
        properties: Properties,
    ) {
        let mut props = campaign_properties(notification);
        props.extend_from(&properties);
        self.tracker.track(event_name, props);
    }

    /// Mark the campaign seen and record the delivery.
    pub fn track_notification_seen(&self, notification: &Notification) {
        let token = self.tracker.token();
        self.tracker.store().mark_campaign_seen(token, notification.id);
        if self.tracker.is_opted_out("track_notification_seen") {
            return;
        }

        self.track_notification("$campaign_delivery", notification, Properties::new());
        let people = self.with_identity(&self.tracker.get_distinct_id());
        let mut seen = campaign_properties(notification);
        seen.insert("$time", Utc::now().format(ENGAGE_DATE_FORMAT).to_string());
        people.append("$campaigns", notification.id as i64);
        people.append("$notifications", seen);
    }
}

fn campaign_properties(notification: &Notification) -> Properties {
    let mut props = Properties::new();
    props.insert("campaign_id", notification.id as i64);
    props.insert("message_id", notification.message_id as i64);
    props.insert("message_type", "inapp");
    props.insert("message_subtype", notification.style.as_str());
    props
}
