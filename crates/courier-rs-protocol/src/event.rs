use crate::{ProtocolError, fields, kinds};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A message routed through the dispatcher: a flat map of string fields.
///
/// Every event carries [`fields::EVENT`]. Events handed to more than one
/// session are cloned before any per-recipient field is stamped, so the
/// caller's instance is never mutated by delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "HashMap<String, String>", into = "HashMap<String, String>")]
pub struct Event {
    fields: HashMap<String, String>,
}

impl Event {
    /// Create an event of the given type stamped with the current time.
    pub fn new(event_type: impl Into<String>) -> Self {
        let mut raw = HashMap::new();
        raw.insert(fields::EVENT.to_string(), event_type.into());
        raw.insert(
            fields::TIME.to_string(),
            chrono::Utc::now().timestamp().to_string(),
        );
        Self { fields: raw }
    }

    /// Create a `data` event addressed to `subject`.
    pub fn data(subject: impl Into<String>) -> Self {
        Self::new(kinds::DATA).with_field(fields::SUBJECT, subject)
    }

    pub fn heartbeat() -> Self {
        Self::new(kinds::HEARTBEAT)
    }

    pub fn abort() -> Self {
        Self::new(kinds::ABORT)
    }

    /// Build an event from raw fields; the event type is required.
    pub fn from_fields(raw: HashMap<String, String>) -> Result<Self, ProtocolError> {
        match raw.get(fields::EVENT) {
            Some(kind) if !kind.is_empty() => Ok(Self { fields: raw }),
            _ => Err(ProtocolError::MissingEventType),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_field(name, value);
        self
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Return the field value or `default` when absent.
    pub fn field_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.field(name).unwrap_or(default)
    }

    pub fn event_type(&self) -> &str {
        self.field_or(fields::EVENT, "")
    }

    pub fn subject(&self) -> Option<&str> {
        self.field(fields::SUBJECT)
    }

    pub fn is_type(&self, kind: &str) -> bool {
        self.event_type() == kind
    }

    pub fn is_abort(&self) -> bool {
        self.is_type(kinds::ABORT)
    }

    /// True when the publisher asked for delivery to online sessions only.
    pub fn is_online_only(&self) -> bool {
        self.field(fields::ONLINE_ONLY)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    /// Field names in sorted order.
    pub fn field_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.fields.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn fields(&self) -> &HashMap<String, String> {
        &self.fields
    }
}

impl TryFrom<HashMap<String, String>> for Event {
    type Error = ProtocolError;

    fn try_from(raw: HashMap<String, String>) -> Result<Self, Self::Error> {
        Self::from_fields(raw)
    }
}

impl From<Event> for HashMap<String, String> {
    fn from(event: Event) -> Self {
        event.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn new_event_carries_type_and_time() {
        let event = Event::new(kinds::HEARTBEAT);
        assert_eq!(event.event_type(), "hb");
        assert!(event.field(fields::TIME).is_some());
        assert_eq!(event.field_names(), vec!["p_event", "p_time"]);
    }

    #[test]
    fn clone_is_isolated_from_original() {
        let original = Event::data("/chat").with_field("msg", "hello");
        let mut copy = original.clone();
        copy.set_field(fields::SUBSCRIPTION_ID, "sub-1");
        copy.set_field("msg", "changed");

        assert_eq!(original.field(fields::SUBSCRIPTION_ID), None);
        assert_eq!(original.field("msg"), Some("hello"));
        assert_eq!(copy.field("msg"), Some("changed"));
    }

    #[test]
    fn from_fields_requires_event_type() {
        let mut raw = HashMap::new();
        raw.insert("msg".to_string(), "x".to_string());
        assert_eq!(
            Event::from_fields(raw.clone()),
            Err(ProtocolError::MissingEventType)
        );

        raw.insert(fields::EVENT.to_string(), kinds::DATA.to_string());
        let event = Event::from_fields(raw).expect("event");
        assert!(event.is_type(kinds::DATA));
        assert_eq!(event.field_or("missing", "fallback"), "fallback");
    }

    #[test]
    fn serde_round_trip_rejects_untyped_maps() {
        let event = Event::data("/news").with_field(fields::ONLINE_ONLY, "TRUE");
        let json = serde_json::to_string(&event).expect("serialize");
        let back: Event = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, event);
        assert!(back.is_online_only());

        let err = serde_json::from_str::<Event>(r#"{"msg":"x"}"#);
        assert!(err.is_err());
    }
}
