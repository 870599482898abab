//! Tracking record types.
//!
//! A record is either a behavioral event or a customer update. Both carry a
//! payload of typed properties keyed by semantic field names.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known payload field names.
pub mod fields {
    pub const PROJECT_TOKEN: &str = "project_token";
    pub const EVENT_TYPE: &str = "event_type";
    pub const TIMESTAMP: &str = "timestamp";
    pub const PROPERTIES: &str = "properties";
    pub const IDS: &str = "ids";
    pub const DURATION: &str = "duration";
    pub const ACTION_TYPE: &str = "action_type";
    pub const TRACKING_FORCED: &str = "tracking_forced";
}

/// Ordered mapping of field name to typed value.
pub type Payload = BTreeMap<String, PropertyValue>;

/// A typed payload value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    String(String),
    Number(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Object(Payload),
}

impl PropertyValue {
    /// Parse a command-line literal: numbers and booleans are recognized,
    /// everything else is kept as a string.
    pub fn parse_literal(raw: &str) -> Self {
        if let Ok(b) = raw.parse::<bool>() {
            return PropertyValue::Bool(b);
        }
        match raw.parse::<f64>() {
            Ok(n) if n.is_finite() => PropertyValue::Number(n),
            _ => PropertyValue::String(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Payload> {
        match self {
            PropertyValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Wire representation. Timestamps become fractional epoch seconds.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PropertyValue::String(s) => serde_json::Value::String(s.clone()),
            PropertyValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            PropertyValue::Bool(b) => serde_json::Value::Bool(*b),
            PropertyValue::Timestamp(t) => {
                let secs = t.timestamp_millis() as f64 / 1000.0;
                serde_json::Number::from_f64(secs)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
            PropertyValue::Object(o) => payload_to_json(o),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        PropertyValue::Number(n)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Number(n as f64)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(t: DateTime<Utc>) -> Self {
        PropertyValue::Timestamp(t)
    }
}

impl From<Payload> for PropertyValue {
    fn from(o: Payload) -> Self {
        PropertyValue::Object(o)
    }
}

/// Convert a payload to its JSON wire form.
pub fn payload_to_json(payload: &Payload) -> serde_json::Value {
    serde_json::Value::Object(
        payload
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// Convert epoch seconds (possibly fractional) to a UTC timestamp.
pub fn timestamp_from_secs(secs: f64) -> DateTime<Utc> {
    let millis = (secs * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Kind of a queued record. Closed set; dispatch matches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    CustomerUpdate,
    Event,
}

/// Storage reference of a queued record. Assigned by the queue in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub id: RecordId,
    pub kind: RecordKind,
    pub payload: Payload,
    pub retry_count: u32,
    /// Bumped whenever the payload changes after the record was appended.
    #[serde(default)]
    pub revision: u32,
    pub created_at: DateTime<Utc>,
}

impl TrackingRecord {
    pub fn event_type(&self) -> Option<&str> {
        self.payload
            .get(fields::EVENT_TYPE)
            .and_then(PropertyValue::as_str)
    }

    pub fn project_token(&self) -> Option<&str> {
        self.payload
            .get(fields::PROJECT_TOKEN)
            .and_then(PropertyValue::as_str)
    }

    pub fn properties(&self) -> Option<&Payload> {
        self.payload
            .get(fields::PROPERTIES)
            .and_then(PropertyValue::as_object)
    }
}

/// Identifier name to value mapping for the active customer profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerIds(BTreeMap<String, String>);

impl CustomerIds {
    /// Identifier name for the anonymous device cookie.
    pub const COOKIE: &'static str = "cookie";

    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh anonymous identity with a random cookie.
    pub fn with_cookie() -> Self {
        let mut ids = Self::new();
        ids.insert(Self::COOKIE, uuid::Uuid::new_v4().to_string());
        ids
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Merge `other` into self; values from `other` win.
    pub fn merge(&mut self, other: &CustomerIds) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn to_payload(&self) -> Payload {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), PropertyValue::String(v.clone())))
            .collect()
    }

    /// Read ids from a payload object. Non-string values are skipped.
    pub fn from_payload(payload: &Payload) -> Self {
        Self(
            payload
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
        )
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
    }
}

/// Build an event payload.
pub fn event_payload(
    project_token: &str,
    event_type: &str,
    timestamp: DateTime<Utc>,
    properties: Payload,
) -> Payload {
    let mut payload = Payload::new();
    payload.insert(fields::PROJECT_TOKEN.into(), project_token.into());
    payload.insert(fields::EVENT_TYPE.into(), event_type.into());
    payload.insert(fields::TIMESTAMP.into(), timestamp.into());
    payload.insert(fields::PROPERTIES.into(), properties.into());
    payload
}

/// Build a customer update payload.
pub fn customer_payload(project_token: &str, ids: &CustomerIds, properties: Payload) -> Payload {
    let mut payload = Payload::new();
    payload.insert(fields::PROJECT_TOKEN.into(), project_token.into());
    payload.insert(fields::IDS.into(), ids.to_payload().into());
    payload.insert(fields::PROPERTIES.into(), properties.into());
    payload
}
