//! Subscription records and filter predicates.
//!
//! A subscription is one `(connection, event type, scope, filter)`
//! registration. Filters map payload field names to either a single required
//! value or a set of allowed values; an event matches only if every filter
//! field is present in its payload with a permitted value.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConnectionId, EventScope, SubscriptionId};

/// Required value(s) for one filtered payload field.
///
/// Deserialized untagged: a JSON array means "any of these values", anything
/// else is an exact-match requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    /// Field must equal one of the listed values.
    AnyOf(Vec<serde_json::Value>),
    /// Field must equal this value exactly.
    Exact(serde_json::Value),
}

impl FilterValue {
    fn permits(&self, actual: &serde_json::Value) -> bool {
        match self {
            Self::AnyOf(allowed) => allowed.contains(actual),
            Self::Exact(required) => required == actual,
        }
    }
}

/// Field-level filter attached to a subscription.
///
/// An empty filter matches every event of the subscription's type and scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionFilter(HashMap<String, FilterValue>);

impl SubscriptionFilter {
    /// Creates an empty (match-all) filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an exact-match requirement for `field`.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.0.insert(field.into(), FilterValue::Exact(value));
        self
    }

    /// Adds an any-of requirement for `field`.
    #[must_use]
    pub fn with_any_of(
        mut self,
        field: impl Into<String>,
        values: Vec<serde_json::Value>,
    ) -> Self {
        self.0.insert(field.into(), FilterValue::AnyOf(values));
        self
    }

    /// Returns `true` if the filter declares no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Evaluates the filter against an event payload.
    ///
    /// A field missing from the payload, or present with a value outside the
    /// declared requirement, excludes the event.
    #[must_use]
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        self.0.iter().all(|(field, required)| {
            payload
                .get(field)
                .is_some_and(|actual| required.permits(actual))
        })
    }
}

/// One standing event registration owned by a single connection.
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    /// Subscription identifier.
    pub id: SubscriptionId,
    /// Owning connection (back-reference, never shared).
    pub connection_id: ConnectionId,
    /// Event type this subscription receives.
    pub event_type: String,
    /// Audience scope this subscription receives.
    pub scope: EventScope,
    /// Optional field filter.
    pub filter: SubscriptionFilter,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Registration order, used for stable match ordering in-process.
    pub sequence: u64,
    /// Last time an event matched this subscription.
    pub last_matched: Option<DateTime<Utc>>,
    /// Number of events delivered through this subscription.
    pub match_count: u64,
}

impl Subscription {
    /// Creates a new subscription record.
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        event_type: impl Into<String>,
        scope: EventScope,
        filter: SubscriptionFilter,
        sequence: u64,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            connection_id,
            event_type: event_type.into(),
            scope,
            filter,
            created_at: Utc::now(),
            sequence,
            last_matched: None,
            match_count: 0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_filter_matches_anything() {
        let filter = SubscriptionFilter::new();
        assert!(filter.matches(&json!({})));
        assert!(filter.matches(&json!({"room": "A"})));
    }

    #[test]
    fn exact_field_must_be_present_and_equal() {
        let filter = SubscriptionFilter::new().with_field("room", json!("A"));
        assert!(filter.matches(&json!({"room": "A"})));
        assert!(!filter.matches(&json!({"room": "B"})));
        assert!(!filter.matches(&json!({})));
    }

    #[test]
    fn any_of_accepts_membership() {
        let filter =
            SubscriptionFilter::new().with_any_of("status", vec![json!("open"), json!("held")]);
        assert!(filter.matches(&json!({"status": "open"})));
        assert!(filter.matches(&json!({"status": "held"})));
        assert!(!filter.matches(&json!({"status": "closed"})));
    }

    #[test]
    fn all_fields_must_match() {
        let filter = SubscriptionFilter::new()
            .with_field("room", json!("A"))
            .with_field("kind", json!("chat"));
        assert!(filter.matches(&json!({"room": "A", "kind": "chat"})));
        assert!(!filter.matches(&json!({"room": "A", "kind": "system"})));
        assert!(!filter.matches(&json!({"room": "A"})));
    }

    #[test]
    fn filter_deserializes_arrays_as_any_of() {
        let Some(filter) =
            serde_json::from_value::<SubscriptionFilter>(json!({"room": ["A", "B"], "kind": "chat"}))
                .ok()
        else {
            panic!("filter deserialization failed");
        };
        assert!(filter.matches(&json!({"room": "B", "kind": "chat"})));
        assert!(!filter.matches(&json!({"room": "C", "kind": "chat"})));
    }

    #[test]
    fn non_string_values_compare_structurally() {
        let filter = SubscriptionFilter::new().with_field("priority", json!(3));
        assert!(filter.matches(&json!({"priority": 3})));
        assert!(!filter.matches(&json!({"priority": "3"})));
    }
}
