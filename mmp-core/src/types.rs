//! Core domain types for mmp
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Token** | Project token; every message, record and preference is keyed by one |
//! | **Message** | One immutable unit of tracking data (event, people/group update, push link) |
//! | **Kind** | Which endpoint a message is delivered to (events, people, groups) |
//! | **Distinct ID** | Identifier tying messages to one logical user |
//! | **Super property** | Property attached to every event a tracker sends |
//!
//! [`Value`] and [`Properties`] replace free-form JSON bags: keys are never
//! empty and floats are always finite, so encoding a message cannot fail on
//! bad property types.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::LIB_VERSION;

// ============================================
// Values and properties
// ============================================

/// A property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(Properties),
}

impl Value {
    /// Finite floats only; NaN and infinities have no JSON form.
    pub fn float(value: f64) -> Option<Value> {
        value.is_finite().then_some(Value::Float(value))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Properties> {
        match self {
            Value::Object(props) => Some(props),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert to a `serde_json::Value` for the wire.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => json!(i),
            Value::Float(f) => json!(f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(props) => props.to_json(),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    /// Non-finite floats become `Null`.
    fn from(value: f64) -> Self {
        Value::float(value).unwrap_or_else(|| {
            tracing::warn!(value = %value, "Dropping non-finite float property value");
            Value::Null
        })
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

impl From<Properties> for Value {
    fn from(value: Properties) -> Self {
        Value::Object(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::from).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// Insertion-ordered property mapping with non-empty keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(IndexMap<String, Value>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a key. Empty keys are rejected and logged.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let key = key.into();
        if key.is_empty() {
            tracing::warn!("Ignoring property with an empty key");
            return false;
        }
        self.0.insert(key, value.into());
        true
    }

    /// Insert only if the key is not present yet.
    pub fn insert_if_absent(&mut self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let key = key.into();
        if key.is_empty() || self.0.contains_key(&key) {
            return false;
        }
        self.0.insert(key, value.into());
        true
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Remove a key, keeping the order of the remaining entries.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Overlay `other` on top of `self`; `other` wins on conflicts.
    pub fn extend_from(&mut self, other: &Properties) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Copy entries from `other` whose keys are missing here.
    pub fn merge_missing(&mut self, other: &Properties) {
        for (k, v) in other.iter() {
            if !self.0.contains_key(k) {
                self.0.insert(k.clone(), v.clone());
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Properties::new();
        for (k, v) in iter {
            props.insert(k, v);
        }
        props
    }
}

impl IntoIterator for Properties {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// ============================================
// Identity
// ============================================

/// Identifier triple carried by messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identifiers {
    pub distinct_id: Option<String>,
    pub device_id: Option<String>,
    pub user_id: Option<String>,
}

/// Per-token identity record.
///
/// `anonymous_id` is written once and never replaced. It is cleared only by
/// `reset`/`opt_out`, which start a new identity altogether.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub anonymous_id: Option<String>,
    pub events_distinct_id: String,
    pub people_distinct_id: Option<String>,
    /// `identify` was called with a real user id
    #[serde(default)]
    pub events_user_id_present: bool,
    /// The distinct id was loaded from disk rather than generated
    #[serde(default)]
    pub had_persisted_distinct_id: bool,
}

impl Identity {
    /// A fresh anonymous identity with a generated device id.
    pub fn generate() -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            anonymous_id: Some(id.clone()),
            events_distinct_id: id,
            people_distinct_id: None,
            events_user_id_present: false,
            had_persisted_distinct_id: false,
        }
    }

    /// `$user_id` for events: the distinct id once a real identify happened.
    pub fn events_user_id(&self) -> Option<&str> {
        self.events_user_id_present
            .then_some(self.events_distinct_id.as_str())
    }

    pub fn set_anonymous_id_if_absent(&mut self, id: &str) {
        if self.anonymous_id.is_none() {
            self.anonymous_id = Some(id.to_string());
        }
    }

    /// The id decide requests are keyed by.
    pub fn decide_distinct_id(&self) -> &str {
        self.people_distinct_id
            .as_deref()
            .unwrap_or(&self.events_distinct_id)
    }
}

// ============================================
// Messages
// ============================================

/// Delivery endpoint for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Events,
    People,
    Groups,
}

impl MessageKind {
    /// Flush order.
    pub const ALL: [MessageKind; 3] = [
        MessageKind::Events,
        MessageKind::People,
        MessageKind::Groups,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Events => "events",
            MessageKind::People => "people",
            MessageKind::Groups => "groups",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "events" => Some(MessageKind::Events),
            "people" => Some(MessageKind::People),
            "groups" => Some(MessageKind::Groups),
            _ => None,
        }
    }

    /// Path of the ingestion endpoint.
    pub fn path(&self) -> &'static str {
        match self {
            MessageKind::Events => "/track",
            MessageKind::People => "/engage",
            MessageKind::Groups => "/groups",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// People profile operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeopleOperation {
    Set,
    SetOnce,
    Add,
    Append,
    Union,
    Remove,
    Unset,
    Merge,
    Delete,
}

impl PeopleOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeopleOperation::Set => "$set",
            PeopleOperation::SetOnce => "$set_once",
            PeopleOperation::Add => "$add",
            PeopleOperation::Append => "$append",
            PeopleOperation::Union => "$union",
            PeopleOperation::Remove => "$remove",
            PeopleOperation::Unset => "$unset",
            PeopleOperation::Merge => "$merge",
            PeopleOperation::Delete => "$delete",
        }
    }
}

/// Group profile operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupOperation {
    Set,
    SetOnce,
    Union,
    Remove,
    Unset,
    Delete,
}

impl GroupOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupOperation::Set => "$set",
            GroupOperation::SetOnce => "$set_once",
            GroupOperation::Union => "$union",
            GroupOperation::Remove => "$remove",
            GroupOperation::Unset => "$unset",
            GroupOperation::Delete => "$delete",
        }
    }
}

/// A tracked event. `properties` is final: super properties, injected
/// fields and caller properties already merged in precedence order.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    pub token: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub ids: Identifiers,
    pub properties: Properties,
    pub metadata: Properties,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeopleMessage {
    pub token: String,
    pub operation: PeopleOperation,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub ids: Identifiers,
    pub metadata: Properties,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupMessage {
    pub token: String,
    pub operation: GroupOperation,
    pub payload: Value,
    pub group_key: String,
    pub group_id: Value,
    pub timestamp: DateTime<Utc>,
    pub metadata: Properties,
}

/// Links a push registration id to the people profile.
#[derive(Debug, Clone, PartialEq)]
pub struct PushTokenMessage {
    pub token: String,
    pub registration_id: String,
    pub timestamp: DateTime<Utc>,
    pub ids: Identifiers,
    pub metadata: Properties,
}

/// One immutable unit of tracking data.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Event(EventMessage),
    PeopleUpdate(PeopleMessage),
    GroupUpdate(GroupMessage),
    PushTokenLink(PushTokenMessage),
}

impl Message {
    pub fn token(&self) -> &str {
        match self {
            Message::Event(m) => &m.token,
            Message::PeopleUpdate(m) => &m.token,
            Message::GroupUpdate(m) => &m.token,
            Message::PushTokenLink(m) => &m.token,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Message::Event(m) => m.timestamp,
            Message::PeopleUpdate(m) => m.timestamp,
            Message::GroupUpdate(m) => m.timestamp,
            Message::PushTokenLink(m) => m.timestamp,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Event(_) => MessageKind::Events,
            Message::PeopleUpdate(_) | Message::PushTokenLink(_) => MessageKind::People,
            Message::GroupUpdate(_) => MessageKind::Groups,
        }
    }

    /// The JSON object sent to the ingestion API.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Message::Event(m) => {
                let mut props = Properties::new();
                props.insert("mp_lib", "rust");
                props.insert("$lib_version", LIB_VERSION);
                props.extend_from(&m.properties);
                if let Some(id) = &m.ids.distinct_id {
                    props.insert_if_absent("distinct_id", id.as_str());
                }
                props.insert_if_absent("time", m.timestamp.timestamp());
                props.insert("token", m.token.as_str());
                props.insert("$mp_metadata", m.metadata.clone());
                json!({
                    "event": m.name,
                    "properties": props.to_json(),
                })
            }
            Message::PeopleUpdate(m) => {
                people_wire(&m.token, m.operation, &m.payload, m.timestamp, &m.ids, &m.metadata)
            }
            Message::PushTokenLink(m) => {
                let payload: Properties = [(
                    "$android_devices",
                    Value::Array(vec![Value::from(m.registration_id.as_str())]),
                )]
                .into_iter()
                .collect();
                people_wire(
                    &m.token,
                    PeopleOperation::Union,
                    &Value::Object(payload),
                    m.timestamp,
                    &m.ids,
                    &m.metadata,
                )
            }
            Message::GroupUpdate(m) => {
                let mut obj = serde_json::Map::new();
                obj.insert(m.operation.as_str().to_string(), m.payload.to_json());
                obj.insert("$token".to_string(), json!(m.token));
                obj.insert("$time".to_string(), json!(m.timestamp.timestamp_millis()));
                obj.insert("$group_key".to_string(), json!(m.group_key));
                obj.insert("$group_id".to_string(), m.group_id.to_json());
                obj.insert("$mp_metadata".to_string(), m.metadata.to_json());
                serde_json::Value::Object(obj)
            }
        }
    }

    /// Wire JSON as a string, the form stored in the queue.
    pub fn encode(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(&self.to_wire())?)
    }
}

fn people_wire(
    token: &str,
    operation: PeopleOperation,
    payload: &Value,
    timestamp: DateTime<Utc>,
    ids: &Identifiers,
    metadata: &Properties,
) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    obj.insert(operation.as_str().to_string(), payload.to_json());
    obj.insert("$token".to_string(), json!(token));
    obj.insert("$time".to_string(), json!(timestamp.timestamp_millis()));
    if let Some(device_id) = &ids.device_id {
        obj.insert("$device_id".to_string(), json!(device_id));
    }
    if let Some(distinct_id) = &ids.distinct_id {
        obj.insert("$distinct_id".to_string(), json!(distinct_id));
        obj.insert(
            "$user_id".to_string(),
            json!(ids.user_id.as_deref().unwrap_or(distinct_id)),
        );
    }
    obj.insert("$mp_metadata".to_string(), metadata.to_json());
    serde_json::Value::Object(obj)
}

/// Device description attached to people `$set` updates.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo(Properties);

impl DeviceInfo {
    pub fn from_config(device: &crate::config::DeviceConfig) -> Self {
        let mut props = Properties::new();
        props.insert("$lib_version", LIB_VERSION);
        props.insert("$os", device.os.as_str());
        props.insert("$os_version", device.os_version.as_str());
        if let Some(v) = &device.manufacturer {
            props.insert("$manufacturer", v.as_str());
        }
        if let Some(v) = &device.model {
            props.insert("$model", v.as_str());
        }
        if let Some(v) = &device.app_version {
            props.insert("$app_version", v.as_str());
        }
        if let Some(v) = &device.app_version_code {
            props.insert("$app_version_code", v.as_str());
        }
        Self(props)
    }

    pub fn properties(&self) -> &Properties {
        &self.0
    }

    pub fn app_version_code(&self) -> Option<&str> {
        self.0.get("$app_version_code").and_then(Value::as_str)
    }
}
