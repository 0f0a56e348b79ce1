//! Ephemeral domain events driving subscription matching and delivery.
//!
//! An [`Event`] exists only for the duration of the broadcast call that
//! produced it. Subscriptions declare an event type, an [`EventScope`], and
//! an optional field filter; the delivery engine matches events against
//! those registrations.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Breadth of an event's intended audience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    /// Every subscriber; requires an elevated capability to subscribe.
    Global,
    /// Subscribers within one organization.
    Organization,
    /// Subscribers within one project / tenant unit.
    Project,
    /// Subscribers of a single user.
    User,
    /// Subscribers of a named room.
    Room,
}

impl EventScope {
    /// All scopes the gateway supports, in subscription-authorization order.
    pub const ALL: [Self; 5] = [
        Self::Global,
        Self::Organization,
        Self::Project,
        Self::User,
        Self::Room,
    ];

    /// Returns the wire name of the scope (`"global"`, `"organization"`, ...).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Organization => "organization",
            Self::Project => "project",
            Self::User => "user",
            Self::Room => "room",
        }
    }
}

impl fmt::Display for EventScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "organization" => Ok(Self::Organization),
            "project" => Ok(Self::Project),
            "user" => Ok(Self::User),
            "room" => Ok(Self::Room),
            other => Err(format!("unknown scope: {other}")),
        }
    }
}

/// One event to be matched and delivered.
///
/// The payload is an opaque JSON object; subscription filters are evaluated
/// against its top-level fields.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Free-form event type string (e.g. `"order.created"`).
    pub event_type: String,
    /// Audience scope used for index intersection during matching.
    pub scope: EventScope,
    /// Opaque application payload.
    pub payload: serde_json::Value,
    /// Production timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(event_type: impl Into<String>, scope: EventScope, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            scope,
            payload,
            timestamp: Utc::now(),
        }
    }
}
