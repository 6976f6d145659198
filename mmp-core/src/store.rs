//! Persistent key-value store
//!
//! Every preference is a JSON value stored under `(token, key)`. Reads and
//! writes never fail from the caller's point of view: storage and decoding
//! errors are logged and the default is substituted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::types::{Identity, PeopleOperation, Properties, Value};

/// Preference keys
pub mod keys {
    pub const IDENTITY: &str = "identity";
    pub const SUPER_PROPERTIES: &str = "super_properties";
    pub const OPT_OUT: &str = "opt_out";
    pub const SEEN_CAMPAIGNS: &str = "seen_campaigns";
    pub const TIMED_EVENTS: &str = "timed_events";
    pub const PUSH_ID: &str = "push_id";
    pub const WAITING_PEOPLE: &str = "waiting_people";
    pub const HAS_LAUNCHED: &str = "has_launched";
    pub const APP_VERSION_CODE: &str = "app_version_code";
}

/// Keys that survive `clear_preferences`
const RETAINED_KEYS: &[&str] = &[
    keys::OPT_OUT,
    keys::HAS_LAUNCHED,
    keys::APP_VERSION_CODE,
    keys::SEEN_CAMPAIGNS,
];

/// A people update recorded before any people distinct id existed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingPeopleUpdate {
    pub operation: PeopleOperation,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Durable per-token preferences.
#[derive(Clone)]
pub struct PersistentStore {
    db: Arc<Database>,
    // Serializes read-modify-write helpers; single get/set rely on SQLite
    rmw: Arc<Mutex<()>>,
}

impl PersistentStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            rmw: Arc::new(Mutex::new(())),
        }
    }

    // ============================================
    // Generic access
    // ============================================

    pub fn get(&self, token: &str, key: &str) -> Option<Value> {
        self.get_as(token, key)
    }

    pub fn set(&self, token: &str, key: &str, value: &Value) {
        self.set_as(token, key, value);
    }

    pub fn remove(&self, token: &str, key: &str) {
        if let Err(e) = self.db.delete_preference(token, key) {
            tracing::error!(token = %token, key = %key, error = %e, "Failed to remove preference");
        }
    }

    /// Remove every preference of `token`; other tokens are untouched.
    pub fn clear_all(&self, token: &str) {
        if let Err(e) = self.db.delete_preferences_except(token, &[]) {
            tracing::error!(token = %token, error = %e, "Failed to clear preferences");
        }
    }

    /// Clear identity, super properties, timed events, push id and waiting
    /// people updates. The opt-out flag and launch markers are kept.
    pub fn clear_preferences(&self, token: &str) {
        if let Err(e) = self.db.delete_preferences_except(token, RETAINED_KEYS) {
            tracing::error!(token = %token, error = %e, "Failed to clear preferences");
        }
    }

    fn get_as<T: DeserializeOwned>(&self, token: &str, key: &str) -> Option<T> {
        let raw = match self.db.get_preference(token, key) {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::error!(
                    token = %token,
                    key = %key,
                    error = %e,
                    "Failed to read preference"
                );
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(
                    token = %token,
                    key = %key,
                    error = %e,
                    "Discarding undecodable preference, using default"
                );
                None
            }
        }
    }

    fn set_as<T: Serialize + ?Sized>(&self, token: &str, key: &str, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(
                    token = %token,
                    key = %key,
                    error = %e,
                    "Failed to encode preference"
                );
                return;
            }
        };
        if let Err(e) = self.db.set_preference(token, key, &raw) {
            tracing::error!(token = %token, key = %key, error = %e, "Failed to write preference");
        }
    }

    fn update<T, F>(&self, token: &str, key: &str, f: F) -> T
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T),
    {
        let _guard = self.rmw.lock().unwrap_or_else(PoisonError::into_inner);
        let mut value: T = self.get_as(token, key).unwrap_or_default();
        f(&mut value);
        self.set_as(token, key, &value);
        value
    }

    // ============================================
    // Identity and super properties
    // ============================================

    pub fn identity(&self, token: &str) -> Option<Identity> {
        self.get_as(token, keys::IDENTITY)
    }

    pub fn save_identity(&self, token: &str, identity: &Identity) {
        self.set_as(token, keys::IDENTITY, identity);
    }

    pub fn super_properties(&self, token: &str) -> Properties {
        self.get_as(token, keys::SUPER_PROPERTIES).unwrap_or_default()
    }

    pub fn save_super_properties(&self, token: &str, props: &Properties) {
        self.set_as(token, keys::SUPER_PROPERTIES, props);
    }

    // ============================================
    // Opt-out
    // ============================================

    pub fn opt_out(&self, token: &str) -> bool {
        self.get_as(token, keys::OPT_OUT).unwrap_or(false)
    }

    /// Whether an opt-out decision was ever stored for `token`
    pub fn has_opt_out_flag(&self, token: &str) -> bool {
        self.get_as::<bool>(token, keys::OPT_OUT).is_some()
    }

    pub fn set_opt_out(&self, token: &str, opted_out: bool) {
        self.set_as(token, keys::OPT_OUT, &opted_out);
    }

    // ============================================
    // Campaigns, timed events, push id
    // ============================================

    pub fn seen_campaigns(&self, token: &str) -> BTreeSet<u64> {
        self.get_as(token, keys::SEEN_CAMPAIGNS).unwrap_or_default()
    }

    pub fn mark_campaign_seen(&self, token: &str, campaign_id: u64) {
        self.update(token, keys::SEEN_CAMPAIGNS, |seen: &mut BTreeSet<u64>| {
            seen.insert(campaign_id);
        });
    }

    /// Event name to start time in epoch milliseconds
    pub fn timed_events(&self, token: &str) -> BTreeMap<String, i64> {
        self.get_as(token, keys::TIMED_EVENTS).unwrap_or_default()
    }

    pub fn add_timed_event(&self, token: &str, name: &str, started_ms: i64) {
        self.update(token, keys::TIMED_EVENTS, |timings: &mut BTreeMap<String, i64>| {
            timings.insert(name.to_string(), started_ms);
        });
    }

    pub fn remove_timed_event(&self, token: &str, name: &str) {
        self.update(token, keys::TIMED_EVENTS, |timings: &mut BTreeMap<String, i64>| {
            timings.remove(name);
        });
    }

    pub fn clear_timed_events(&self, token: &str) {
        self.remove(token, keys::TIMED_EVENTS);
    }

    pub fn push_id(&self, token: &str) -> Option<String> {
        self.get_as(token, keys::PUSH_ID)
    }

    pub fn set_push_id(&self, token: &str, id: &str) {
        self.set_as(token, keys::PUSH_ID, id);
    }

    pub fn clear_push_id(&self, token: &str) {
        self.remove(token, keys::PUSH_ID);
    }

    // ============================================
    // Waiting people updates
    // ============================================

    /// Hold `update`, keeping at most `ceiling` updates. Returns how many of
    /// the oldest were evicted to make room.
    pub fn push_waiting_people(
        &self,
        token: &str,
        update: WaitingPeopleUpdate,
        ceiling: usize,
    ) -> usize {
        let mut evicted = 0;
        self.update(token, keys::WAITING_PEOPLE, |list: &mut Vec<WaitingPeopleUpdate>| {
            list.push(update);
            evicted = list.len().saturating_sub(ceiling.max(1));
            list.drain(..evicted);
        });
        evicted
    }

    /// Remove and return all waiting updates, oldest first
    pub fn take_waiting_people(&self, token: &str) -> Vec<WaitingPeopleUpdate> {
        let _guard = self.rmw.lock().unwrap_or_else(PoisonError::into_inner);
        let list: Vec<WaitingPeopleUpdate> =
            self.get_as(token, keys::WAITING_PEOPLE).unwrap_or_default();
        self.remove(token, keys::WAITING_PEOPLE);
        list
    }

    // ============================================
    // Launch markers
    // ============================================

    pub fn has_launched(&self, token: &str) -> bool {
        self.get_as(token, keys::HAS_LAUNCHED).unwrap_or(false)
    }

    pub fn set_has_launched(&self, token: &str) {
        self.set_as(token, keys::HAS_LAUNCHED, &true);
    }

    /// Record the app version code; true when it differs from a stored one.
    pub fn is_new_version(&self, token: &str, version_code: &str) -> bool {
        let _guard = self.rmw.lock().unwrap_or_else(PoisonError::into_inner);
        let previous: Option<String> = self.get_as(token, keys::APP_VERSION_CODE);
        if previous.as_deref() == Some(version_code) {
            return false;
        }
        self.set_as(token, keys::APP_VERSION_CODE, version_code);
        previous.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> PersistentStore {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        PersistentStore::new(Arc::new(db))
    }

    #[test]
    fn test_get_set_remove() {
        let store = test_store();
        assert!(store.get("t1", "color").is_none());

        store.set("t1", "color", &Value::from("blue"));
        assert_eq!(store.get("t1", "color"), Some(Value::from("blue")));

        store.remove("t1", "color");
        assert!(store.get("t1", "color").is_none());
    }

    #[test]
    fn test_clear_all_is_per_token() {
        let store = test_store();
        store.set("t1", "a", &Value::from(1));
        store.set("t2", "a", &Value::from(2));

        store.clear_all("t1");
        assert!(store.get("t1", "a").is_none());
        assert_eq!(store.get("t2", "a"), Some(Value::from(2)));
    }

    #[test]
    fn test_undecodable_value_falls_back_to_default() {
        let store = test_store();
        store.db.set_preference("t1", keys::OPT_OUT, "not json").unwrap();
        assert!(!store.opt_out("t1"));

        store.db.set_preference("t1", keys::SUPER_PROPERTIES, "[1,2]").unwrap();
        assert!(store.super_properties("t1").is_empty());
    }

    #[test]
    fn test_clear_preferences_keeps_opt_out() {
        let store = test_store();
        store.save_identity("t1", &Identity::generate());
        store.set_opt_out("t1", true);
        store.set_push_id("t1", "reg");
        store.set_has_launched("t1");

        store.clear_preferences("t1");
        assert!(store.identity("t1").is_none());
        assert!(store.push_id("t1").is_none());
        assert!(store.opt_out("t1"));
        assert!(store.has_launched("t1"));
    }

    #[test]
    fn test_opt_out_flag_presence() {
        let store = test_store();
        assert!(!store.has_opt_out_flag("t1"));
        store.set_opt_out("t1", false);
        assert!(store.has_opt_out_flag("t1"));
        assert!(!store.opt_out("t1"));
    }

    #[test]
    fn test_seen_campaigns_and_timed_events() {
        let store = test_store();
        store.mark_campaign_seen("t1", 7);
        store.mark_campaign_seen("t1", 7);
        store.mark_campaign_seen("t1", 9);
        assert_eq!(store.seen_campaigns("t1").into_iter().collect::<Vec<_>>(), vec![7, 9]);

        store.add_timed_event("t1", "Checkout", 1_000);
        store.add_timed_event("t1", "Search", 2_000);
        store.remove_timed_event("t1", "Checkout");
        let timings = store.timed_events("t1");
        assert_eq!(timings.len(), 1);
        assert_eq!(timings.get("Search"), Some(&2_000));
    }

    #[test]
    fn test_waiting_people_are_taken_once() {
        let store = test_store();
        store.push_waiting_people(
            "t1",
            WaitingPeopleUpdate {
                operation: PeopleOperation::Set,
                payload: Value::Null,
                timestamp: Utc::now(),
            },
            10,
        );
        assert_eq!(store.take_waiting_people("t1").len(), 1);
        assert!(store.take_waiting_people("t1").is_empty());
    }

    #[test]
    fn test_waiting_people_evict_oldest_beyond_ceiling() {
        let store = test_store();
        let mut evicted = 0;
        for i in 0..5 {
            evicted += store.push_waiting_people(
                "t1",
                WaitingPeopleUpdate {
                    operation: PeopleOperation::Set,
                    payload: Value::from(i),
                    timestamp: Utc::now(),
                },
                3,
            );
        }
        assert_eq!(evicted, 2);
        let held: Vec<Value> = store
            .take_waiting_people("t1")
            .into_iter()
            .map(|u| u.payload)
            .collect();
        assert_eq!(held, vec![Value::from(2), Value::from(3), Value::from(4)]);
    }

    #[test]
    fn test_is_new_version() {
        let store = test_store();
        // First sighting is an install, not an update
        assert!(!store.is_new_version("t1", "1"));
        assert!(!store.is_new_version("t1", "1"));
        assert!(store.is_new_version("t1", "2"));
    }

    #[test]
    fn test_concurrent_campaign_updates_are_not_lost() {
        let store = test_store();
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || store.mark_campaign_seen("t1", i))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.seen_campaigns("t1").len(), 8);
    }
}
