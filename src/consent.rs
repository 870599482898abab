//! Consent gating for campaign and in-app message events.
//!
//! The gate runs before persistence: a denied event is never queued.
//! A recognized force-tracking marker overrides missing consent and
//! annotates the record with `tracking_forced`.

use crate::record::{fields, Payload, PropertyValue};
use serde::{Deserialize, Serialize};

/// Query parameter on action URLs that carries the force-tracking marker.
pub const FORCE_TRACK_PARAM: &str = "force_track";

/// Event kinds known to the tracking pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Custom(String),
    Install,
    SessionStart,
    SessionEnd,
    Payment,
    PushDelivered,
    PushOpened,
    InAppMessageShown,
    InAppMessageClick,
    InAppMessageClose,
    InAppMessageError,
}

impl EventKind {
    /// The `event_type` written to the payload.
    pub fn event_type(&self) -> &str {
        match self {
            EventKind::Custom(name) => name,
            EventKind::Install => "installation",
            EventKind::SessionStart => "session_start",
            EventKind::SessionEnd => "session_end",
            EventKind::Payment => "payment",
            EventKind::PushDelivered | EventKind::PushOpened => "campaign",
            EventKind::InAppMessageShown
            | EventKind::InAppMessageClick
            | EventKind::InAppMessageClose
            | EventKind::InAppMessageError => "banner",
        }
    }

    /// Status/action property that distinguishes campaign and banner events.
    pub fn action(&self) -> Option<(&'static str, &'static str)> {
        match self {
            EventKind::PushDelivered => Some(("status", "delivered")),
            EventKind::PushOpened => Some(("status", "clicked")),
            EventKind::InAppMessageShown => Some(("action", "show")),
            EventKind::InAppMessageClick => Some(("action", "click")),
            EventKind::InAppMessageClose => Some(("action", "close")),
            EventKind::InAppMessageError => Some(("action", "error")),
            _ => None,
        }
    }

    /// Default `action_type` for click-like events.
    fn default_action_type(&self) -> Option<&'static str> {
        match self {
            EventKind::PushOpened => Some("notification"),
            EventKind::InAppMessageClick => Some("in-app message"),
            _ => None,
        }
    }
}

/// Outcome of the consent gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentDecision {
    Allowed { forced: bool },
    Denied,
}

impl ConsentDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ConsentDecision::Allowed { .. })
    }
}

/// Whether `value` is the force-tracking marker.
pub fn is_force_marker(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

/// Decide whether an event may be queued.
pub fn is_allowed(
    kind: &EventKind,
    consider_consent: bool,
    has_consent: bool,
    forced_override: Option<&str>,
) -> ConsentDecision {
    if !consider_consent {
        return ConsentDecision::Allowed { forced: false };
    }
    if forced_override.is_some_and(is_force_marker) {
        tracing::debug!(event_type = kind.event_type(), "tracking forced despite consent");
        return ConsentDecision::Allowed { forced: true };
    }
    if has_consent {
        ConsentDecision::Allowed { forced: false }
    } else {
        ConsentDecision::Denied
    }
}

/// Extract the force-tracking marker from an action URL, if present.
pub fn forced_override_from_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == FORCE_TRACK_PARAM)
        .map(|(_, v)| v.into_owned())
}

/// Annotate event properties after an allowed decision.
///
/// Adds the status/action field, a default `action_type` for click-like
/// events, and `tracking_forced` when the override applied.
pub fn annotate(kind: &EventKind, decision: ConsentDecision, properties: &mut Payload) {
    if let Some((key, value)) = kind.action() {
        properties
            .entry(key.to_string())
            .or_insert_with(|| PropertyValue::from(value));
    }
    if let Some(action_type) = kind.default_action_type() {
        properties
            .entry(fields::ACTION_TYPE.to_string())
            .or_insert_with(|| PropertyValue::from(action_type));
    }
    if let ConsentDecision::Allowed { forced: true } = decision {
        properties.insert(fields::TRACKING_FORCED.to_string(), PropertyValue::Bool(true));
    }
}
