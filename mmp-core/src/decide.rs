//! Remote configuration cache
//!
//! Holds the latest decide document for one token: in-app notifications,
//! experiment variants, enabled integrations and the automatic-events switch.
//! Notifications are one-shot: taking one removes it, so each is handed out
//! at most once across all callers until a new fetch brings it back.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::TrackingConfig;
use crate::store::PersistentStore;
use crate::types::{Properties, Value};

/// An in-app notification definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Campaign id
    pub id: u64,
    pub message_id: u64,
    /// Display style, e.g. `mini` or `takeover`
    #[serde(rename = "type", default)]
    pub style: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub extras: Properties,
}

/// An experiment variant assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: u64,
    pub experiment_id: u64,
    #[serde(default = "null_value")]
    pub payload: Value,
}

fn null_value() -> Value {
    Value::Null
}

/// Items are decoded one by one so a single bad entry can't void the document.
#[derive(Debug, Deserialize)]
struct DecideResponse {
    #[serde(default)]
    notifications: Vec<serde_json::Value>,
    #[serde(default)]
    variants: Vec<serde_json::Value>,
    #[serde(default)]
    integrations: Vec<String>,
    #[serde(default)]
    automatic_events: Option<bool>,
}

fn decode_items<T: DeserializeOwned>(
    token: &str,
    what: &str,
    items: Vec<serde_json::Value>,
) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::warn!(
                    token = %token,
                    item = what,
                    error = %e,
                    "Skipping malformed decide entry"
                );
                None
            }
        })
        .collect()
}

/// Published after every applied fetch.
#[derive(Debug, Clone)]
pub struct DecideUpdate {
    pub token: String,
    pub distinct_id: String,
    pub new_notifications: usize,
    pub new_variants: usize,
    pub fetched_at: DateTime<Utc>,
}

struct DecideCache {
    distinct_id: String,
    notifications: Vec<Notification>,
    unseen_variants: Vec<Variant>,
    /// Variant ids handed out since the distinct id was set
    consumed_variants: HashSet<u64>,
    integrations: BTreeSet<String>,
    automatic_events: Option<bool>,
    last_fetch: Option<Instant>,
    last_fetch_at: Option<DateTime<Utc>>,
}

impl DecideCache {
    fn empty(distinct_id: String) -> Self {
        Self {
            distinct_id,
            notifications: Vec::new(),
            unseen_variants: Vec::new(),
            consumed_variants: HashSet::new(),
            integrations: BTreeSet::new(),
            automatic_events: None,
            last_fetch: None,
            last_fetch_at: None,
        }
    }
}

/// Decide cache for a single token.
pub struct DecideClient {
    token: String,
    store: PersistentStore,
    test_mode: bool,
    automatic_events_default: bool,
    cache: Mutex<DecideCache>,
    updates: broadcast::Sender<DecideUpdate>,
}

impl DecideClient {
    pub fn new(
        token: &str,
        distinct_id: &str,
        store: PersistentStore,
        tracking: &TrackingConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            token: token.to_string(),
            store,
            test_mode: tracking.test_mode,
            automatic_events_default: tracking.track_automatic_events,
            cache: Mutex::new(DecideCache::empty(distinct_id.to_string())),
            updates,
        }
    }

    fn cache(&self) -> MutexGuard<'_, DecideCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn distinct_id(&self) -> String {
        self.cache().distinct_id.clone()
    }

    /// Switch identity; results cached for a previous id are discarded.
    pub fn set_distinct_id(&self, distinct_id: &str) {
        let mut cache = self.cache();
        if cache.distinct_id != distinct_id {
            tracing::debug!(token = %self.token, "Distinct id changed, clearing decide cache");
            *cache = DecideCache::empty(distinct_id.to_string());
        }
    }

    /// Receive a [`DecideUpdate`] after each applied fetch.
    pub fn subscribe(&self) -> broadcast::Receiver<DecideUpdate> {
        self.updates.subscribe()
    }

    /// Whether a refresh is due.
    pub fn needs_refresh(&self, min_interval: Duration) -> bool {
        match self.cache().last_fetch {
            Some(at) => at.elapsed() >= min_interval,
            None => true,
        }
    }

    pub fn last_fetch_at(&self) -> Option<DateTime<Utc>> {
        self.cache().last_fetch_at
    }

    /// Apply a decide document fetched for `requested_for`.
    ///
    /// Dropped if the distinct id changed while the request was in flight.
    /// Returns true when the document was applied.
    pub fn apply_response(&self, requested_for: &str, document: &serde_json::Value) -> bool {
        let response: DecideResponse = match serde_json::from_value(document.clone()) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    token = %self.token,
                    error = %e,
                    "Ignoring malformed decide response"
                );
                return false;
            }
        };

        let notifications: Vec<Notification> =
            decode_items(&self.token, "notification", response.notifications);
        let variants: Vec<Variant> = decode_items(&self.token, "variant", response.variants);

        let seen = if self.test_mode {
            BTreeSet::new()
        } else {
            self.store.seen_campaigns(&self.token)
        };

        let update = {
            let mut cache = self.cache();
            if cache.distinct_id != requested_for {
                tracing::debug!(
                    token = %self.token,
                    "Discarding decide response for stale distinct id"
                );
                return false;
            }

            let existing: HashSet<u64> = cache.notifications.iter().map(|n| n.id).collect();
            let fresh: Vec<Notification> = notifications
                .into_iter()
                .filter(|n| !seen.contains(&n.id) && !existing.contains(&n.id))
                .collect();
            let new_notifications = fresh.len();
            cache.notifications.extend(fresh);

            let pending: HashSet<u64> = cache.unseen_variants.iter().map(|v| v.id).collect();
            let fresh: Vec<Variant> = variants
                .into_iter()
                .filter(|v| !cache.consumed_variants.contains(&v.id) && !pending.contains(&v.id))
                .collect();
            let new_variants = fresh.len();
            cache.unseen_variants.extend(fresh);

            cache.integrations = response.integrations.into_iter().collect();
            if response.automatic_events.is_some() {
                cache.automatic_events = response.automatic_events;
            }
            let now = Utc::now();
            cache.last_fetch = Some(Instant::now());
            cache.last_fetch_at = Some(now);

            DecideUpdate {
                token: self.token.clone(),
                distinct_id: cache.distinct_id.clone(),
                new_notifications,
                new_variants,
                fetched_at: now,
            }
        };

        tracing::debug!(
            token = %self.token,
            notifications = update.new_notifications,
            variants = update.new_variants,
            "Applied decide response"
        );
        // No subscribers is fine
        let _ = self.updates.send(update);
        true
    }

    /// Record a failed fetch so the next attempt waits a full interval.
    pub fn mark_fetch_failed(&self) {
        self.cache().last_fetch = Some(Instant::now());
    }

    /// Unconsumed notifications or unseen variants exist.
    pub fn has_updates_available(&self) -> bool {
        let cache = self.cache();
        !cache.notifications.is_empty() || !cache.unseen_variants.is_empty()
    }

    /// Take the notification with campaign `id`, at most once.
    pub fn get_notification(&self, id: u64) -> Option<Notification> {
        let mut cache = self.cache();
        let idx = cache.notifications.iter().position(|n| n.id == id)?;
        Some(cache.notifications.remove(idx))
    }

    /// Take the oldest pending notification, at most once.
    pub fn next_notification(&self) -> Option<Notification> {
        let mut cache = self.cache();
        if cache.notifications.is_empty() {
            None
        } else {
            Some(cache.notifications.remove(0))
        }
    }

    /// Take the variants not handed out yet.
    pub fn take_variants(&self) -> Vec<Variant> {
        let mut cache = self.cache();
        let variants = std::mem::take(&mut cache.unseen_variants);
        cache.consumed_variants.extend(variants.iter().map(|v| v.id));
        variants
    }

    pub fn integrations(&self) -> BTreeSet<String> {
        self.cache().integrations.clone()
    }

    pub fn should_track_automatic_events(&self) -> bool {
        self.cache()
            .automatic_events
            .unwrap_or(self.automatic_events_default)
    }
}
