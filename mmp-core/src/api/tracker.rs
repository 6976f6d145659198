//! Per-token tracking facade
//!
//! A [`Tracker`] owns the identity, super properties and timed events for
//! one project token and turns calls into queued messages.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;

use crate::config::{Capabilities, Config};
use crate::decide::DecideClient;
use crate::dispatcher::{Dispatcher, FlushDescriptor, FlushReport};
use crate::store::PersistentStore;
use crate::types::{
    DeviceInfo, EventMessage, Identifiers, Identity, Message, MessageKind, Properties, Value,
};

use super::group::Group;
use super::people::People;
use super::session::SessionMetadata;

/// Identity record and super properties, guarded together.
pub(crate) struct IdentityState {
    pub(crate) identity: Identity,
    pub(crate) super_properties: Properties,
}

/// Tracking entry point for one project token.
///
/// Every call is a no-op while the token is opted out. Calls never return
/// errors; problems are logged and the message is dropped.
pub struct Tracker {
    token: String,
    store: PersistentStore,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<IdentityState>,
    /// Event name to start time in epoch milliseconds
    timings: Mutex<BTreeMap<String, i64>>,
    opted_out: AtomicBool,
    session: SessionMetadata,
    device: DeviceInfo,
    decide: Arc<DecideClient>,
    capabilities: Capabilities,
    batch_size: usize,
}

impl Tracker {
    pub(crate) fn new(
        token: &str,
        config: &Config,
        store: PersistentStore,
        dispatcher: Arc<Dispatcher>,
        opt_out_default: bool,
        super_properties: Option<Properties>,
    ) -> Self {
        if opt_out_default && !store.has_opt_out_flag(token) {
            store.set_opt_out(token, true);
        }
        let opted_out = store.opt_out(token);

        let identity = match store.identity(token) {
            Some(mut identity) => {
                identity.had_persisted_distinct_id = true;
                identity
            }
            None => {
                let identity = Identity::generate();
                store.save_identity(token, &identity);
                identity
            }
        };

        let mut stored_super = store.super_properties(token);
        if let Some(initial) = super_properties.filter(|_| !opted_out) {
            stored_super.extend_from(&initial);
            store.save_super_properties(token, &stored_super);
        }

        let decide = Arc::new(DecideClient::new(
            token,
            identity.decide_distinct_id(),
            store.clone(),
            &config.tracking,
        ));
        if !config.api.disable_decide {
            dispatcher.install_decide_check(decide.clone());
        }

        let tracker = Self {
            token: token.to_string(),
            timings: Mutex::new(store.timed_events(token)),
            store,
            dispatcher,
            state: Mutex::new(IdentityState {
                identity,
                super_properties: stored_super,
            }),
            opted_out: AtomicBool::new(opted_out),
            session: SessionMetadata::new(),
            device: DeviceInfo::from_config(&config.device),
            decide,
            capabilities: config.capabilities.clone(),
            batch_size: config.api.batch_size,
        };
        tracker.track_launch_events(config.device.app_version.as_deref());

        tracing::debug!(token = %tracker.token, opted_out, "Tracker created");
        tracker
    }

    fn track_launch_events(&self, app_version: Option<&str>) {
        if !self.store.has_launched(&self.token) {
            self.track_automatic("$ae_first_open", Properties::new());
            self.store.set_has_launched(&self.token);
        }
        if let Some(code) = self.device.app_version_code() {
            if self.store.is_new_version(&self.token, code) {
                let mut props = Properties::new();
                if let Some(version) = app_version {
                    props.insert("$ae_updated_version", version);
                }
                self.track_automatic("$ae_updated", props);
            }
        }
    }

    fn track_automatic(&self, event_name: &str, properties: Properties) {
        if !self.decide.should_track_automatic_events() {
            tracing::debug!(token = %self.token, event = %event_name, "Automatic events disabled");
            return;
        }
        self.track(event_name, properties);
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, IdentityState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timings(&self) -> MutexGuard<'_, BTreeMap<String, i64>> {
        self.timings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn store(&self) -> &PersistentStore {
        &self.store
    }

    pub(crate) fn session(&self) -> &SessionMetadata {
        &self.session
    }

    pub(crate) fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Logs and returns true when the token is opted out.
    pub(crate) fn is_opted_out(&self, operation: &str) -> bool {
        let opted_out = self.opted_out.load(Ordering::Acquire);
        if opted_out {
            tracing::debug!(token = %self.token, operation, "Tracking opted out, ignoring call");
        }
        opted_out
    }

    /// Queue a message; asks for a flush once a batch worth is waiting.
    pub(crate) fn enqueue(&self, message: Message) {
        let queue = self.dispatcher.queue();
        if queue.enqueue(&message).is_some() && queue.size(&self.token) >= self.batch_size {
            self.dispatcher.flush(FlushDescriptor::new(&self.token));
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn decide(&self) -> &Arc<DecideClient> {
        &self.decide
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.device
    }

    // ============================================
    // Events
    // ============================================

    /// Track an event. Super properties are merged in underneath the
    /// injected fields, and `properties` override both.
    pub fn track(&self, event_name: &str, properties: Properties) {
        if self.is_opted_out("track") {
            return;
        }
        if event_name.is_empty() {
            tracing::error!(token = %self.token, "Refusing to track an event with an empty name");
            return;
        }

        let started = self.take_timing(event_name);
        let message = {
            let state = self.state();
            self.event_message(&state, event_name, properties, started)
        };
        self.enqueue(message);
    }

    /// Track an event and attach group memberships not already present.
    pub fn track_with_groups(&self, event_name: &str, properties: Properties, groups: Properties) {
        let mut properties = properties;
        properties.merge_missing(&groups);
        self.track(event_name, properties);
    }

    pub(crate) fn track_locked(
        &self,
        state: &IdentityState,
        event_name: &str,
        properties: Properties,
    ) {
        let started = self.take_timing(event_name);
        let message = self.event_message(state, event_name, properties, started);
        self.enqueue(message);
    }

    fn event_message(
        &self,
        state: &IdentityState,
        event_name: &str,
        caller: Properties,
        started_ms: Option<i64>,
    ) -> Message {
        let now = Utc::now();
        let identity = &state.identity;

        let mut properties = state.super_properties.clone();
        properties.insert("time", now.timestamp());
        properties.insert("distinct_id", identity.events_distinct_id.as_str());
        properties.insert("$had_persisted_distinct_id", identity.had_persisted_distinct_id);
        if let Some(device_id) = &identity.anonymous_id {
            properties.insert("$device_id", device_id.as_str());
        }
        if let Some(user_id) = identity.events_user_id() {
            properties.insert("$user_id", user_id);
        }
        if let Some(started) = started_ms {
            let elapsed = (now.timestamp_millis() - started) as f64 / 1000.0;
            properties.insert("$duration", elapsed);
        }
        properties.extend_from(&caller);

        Message::Event(EventMessage {
            token: self.token.clone(),
            name: event_name.to_string(),
            timestamp: now,
            ids: Identifiers {
                distinct_id: Some(identity.events_distinct_id.clone()),
                device_id: identity.anonymous_id.clone(),
                user_id: identity.events_user_id().map(str::to_string),
            },
            properties,
            metadata: self.session.next(MessageKind::Events),
        })
    }

    // ============================================
    // Timed events
    // ============================================

    /// Start timing `event_name`; the next `track` of it carries `$duration`.
    pub fn time_event(&self, event_name: &str) {
        if self.is_opted_out("time_event") {
            return;
        }
        let now_ms = Utc::now().timestamp_millis();
        self.timings().insert(event_name.to_string(), now_ms);
        self.store.add_timed_event(&self.token, event_name, now_ms);
    }

    /// Seconds since `time_event`, or 0 when the event is not being timed.
    pub fn event_elapsed_time(&self, event_name: &str) -> f64 {
        match self.timings().get(event_name) {
            Some(started) => (Utc::now().timestamp_millis() - started) as f64 / 1000.0,
            None => 0.0,
        }
    }

    pub fn clear_timed_event(&self, event_name: &str) {
        self.take_timing(event_name);
    }

    pub fn clear_timed_events(&self) {
        self.timings().clear();
        self.store.clear_timed_events(&self.token);
    }

    fn take_timing(&self, event_name: &str) -> Option<i64> {
        let started = self.timings().remove(event_name);
        if started.is_some() {
            self.store.remove_timed_event(&self.token, event_name);
        }
        started
    }

    // ============================================
    // Identity
    // ============================================

    /// Use `distinct_id` for all future events.
    ///
    /// Tracks `$identify` linking the previous id when it changes. Calling
    /// it again with the same id does nothing new.
    pub fn identify(&self, distinct_id: &str) {
        if self.is_opted_out("identify") {
            return;
        }
        if distinct_id.is_empty() {
            tracing::error!(token = %self.token, "Can't identify with an empty distinct id");
            return;
        }

        let mut state = self.state();
        let previous = state.identity.events_distinct_id.clone();
        state.identity.set_anonymous_id_if_absent(&previous);
        state.identity.events_distinct_id = distinct_id.to_string();
        state.identity.events_user_id_present = true;
        self.store.save_identity(&self.token, &state.identity);
        self.decide.set_distinct_id(state.identity.decide_distinct_id());

        if previous != distinct_id {
            let payload: Properties = [("$anon_distinct_id", previous)].into_iter().collect();
            self.track_locked(&state, "$identify", payload);
        }
    }

    /// Map `alias` to `original` (default: the current distinct id).
    pub fn alias(&self, alias: &str, original: Option<&str>) {
        if self.is_opted_out("alias") {
            return;
        }
        let original = original
            .map(str::to_string)
            .unwrap_or_else(|| self.get_distinct_id());
        if alias.is_empty() || alias == original {
            tracing::warn!(
                token = %self.token,
                alias = %alias,
                "Refusing to alias identical or empty distinct ids"
            );
            return;
        }

        let payload: Properties = [("alias", alias), ("original", original.as_str())]
            .into_iter()
            .collect();
        self.track("$create_alias", payload);
        self.flush();
    }

    pub fn get_distinct_id(&self) -> String {
        self.state().identity.events_distinct_id.clone()
    }

    pub fn get_anonymous_id(&self) -> Option<String> {
        self.state().identity.anonymous_id.clone()
    }

    pub fn get_user_id(&self) -> Option<String> {
        self.state().identity.events_user_id().map(str::to_string)
    }

    /// Fresh anonymous identity with no super properties or timings.
    fn start_new_identity(&self) {
        self.store.clear_preferences(&self.token);
        {
            let mut state = self.state();
            state.identity = Identity::generate();
            state.super_properties.clear();
            self.store.save_identity(&self.token, &state.identity);
            self.decide.set_distinct_id(state.identity.decide_distinct_id());
        }
        self.timings().clear();
    }

    /// Forget identity, super properties, timings and the push id.
    /// Messages already queued are still sent.
    pub fn reset(&self) {
        self.start_new_identity();
        tracing::info!(token = %self.token, "Tracker reset");
        self.flush();
    }

    // ============================================
    // Super properties
    // ============================================

    pub fn register_super_properties(&self, properties: Properties) {
        self.update_super_properties(|current| current.extend_from(&properties));
    }

    /// Register only the keys that are not set yet.
    pub fn register_super_properties_once(&self, properties: Properties) {
        self.update_super_properties(|current| current.merge_missing(&properties));
    }

    pub fn unregister_super_property(&self, name: &str) {
        self.update_super_properties(|current| {
            current.remove(name);
        });
    }

    pub fn clear_super_properties(&self) {
        self.update_super_properties(Properties::clear);
    }

    /// Change super properties in place under the identity lock.
    pub fn update_super_properties<F>(&self, update: F)
    where
        F: FnOnce(&mut Properties),
    {
        if self.is_opted_out("update_super_properties") {
            return;
        }
        let mut state = self.state();
        update(&mut state.super_properties);
        self.store.save_super_properties(&self.token, &state.super_properties);
    }

    pub fn get_super_properties(&self) -> Properties {
        self.state().super_properties.clone()
    }

    // ============================================
    // Group membership
    // ============================================

    /// Replace the groups the user belongs to under `group_key`.
    pub fn set_group(&self, group_key: &str, group_ids: Vec<Value>) {
        if self.is_opted_out("set_group") {
            return;
        }
        let ids: Vec<Value> = group_ids.into_iter().filter(|id| !id.is_null()).collect();
        let membership: Properties = [(group_key, Value::Array(ids))].into_iter().collect();
        self.register_super_properties(membership.clone());
        self.people().set(membership);
    }

    pub fn add_group(&self, group_key: &str, group_id: impl Into<Value>) {
        if self.is_opted_out("add_group") {
            return;
        }
        let group_id = group_id.into();
        self.update_super_properties(|current| {
            let ids = match current.remove(group_key) {
                Some(Value::Array(mut ids)) => {
                    if !ids.contains(&group_id) {
                        ids.push(group_id.clone());
                    }
                    ids
                }
                Some(other) => vec![other, group_id.clone()],
                None => vec![group_id.clone()],
            };
            current.insert(group_key, Value::Array(ids));
        });
        self.people().union(group_key, vec![group_id]);
    }

    pub fn remove_group(&self, group_key: &str, group_id: impl Into<Value>) {
        if self.is_opted_out("remove_group") {
            return;
        }
        let group_id = group_id.into();
        let mut remaining = false;
        self.update_super_properties(|current| match current.remove(group_key) {
            Some(Value::Array(ids)) => {
                let ids: Vec<Value> = ids.into_iter().filter(|id| *id != group_id).collect();
                if !ids.is_empty() {
                    current.insert(group_key, Value::Array(ids));
                    remaining = true;
                }
            }
            Some(other) if other != group_id => {
                current.insert(group_key, other);
                remaining = true;
            }
            _ => {}
        });

        let people = self.people();
        if remaining {
            people.remove(group_key, group_id);
        } else {
            people.unset(group_key);
        }
    }

    /// Handle for updating the profile of one group.
    pub fn group(&self, group_key: &str, group_id: impl Into<Value>) -> Group<'_> {
        Group::new(self, group_key, group_id.into())
    }

    /// Handle for updating the people profile.
    pub fn people(&self) -> People<'_> {
        People::new(self)
    }

    // ============================================
    // Opt-out
    // ============================================

    /// Stop tracking and erase local data for this token.
    ///
    /// Unsent messages are dropped. An identified profile gets a `$delete`.
    pub fn opt_out_tracking(&self) {
        self.dispatcher.empty_tracking_queues(&self.token);
        let people = self.people();
        if people.is_identified() {
            people.delete_user();
            people.clear_charges();
        }
        self.start_new_identity();
        self.store.set_opt_out(&self.token, true);
        self.opted_out.store(true, Ordering::Release);
        tracing::info!(token = %self.token, "Opted out of tracking");
    }

    /// Resume tracking, optionally identifying first, and track `$opt_in`.
    pub fn opt_in_tracking(&self, distinct_id: Option<&str>, properties: Properties) {
        self.store.set_opt_out(&self.token, false);
        self.opted_out.store(false, Ordering::Release);
        if let Some(id) = distinct_id {
            self.identify(id);
        }
        self.track("$opt_in", properties);
        tracing::info!(token = %self.token, "Opted in to tracking");
    }

    pub fn has_opted_out_tracking(&self) -> bool {
        self.opted_out.load(Ordering::Acquire)
    }

    // ============================================
    // Flush
    // ============================================

    /// Ask the worker to send everything queued for this token.
    pub fn flush(&self) {
        self.dispatcher
            .flush(FlushDescriptor::new(&self.token).with_decide_check());
    }

    /// Flush and wait up to `timeout`. `None` means the flush did not finish
    /// in time; queued data is kept either way.
    pub fn flush_blocking(&self, timeout: Duration) -> Option<FlushReport> {
        self.dispatcher
            .flush_blocking(FlushDescriptor::new(&self.token).with_decide_check(), timeout)
    }
}
