//! Subject interest registrations.

use crate::error::CourierError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Separator between subjects in one subscription request.
pub const SUBJECT_SEPARATOR: char = ',';

/// One interest registration: a subject list plus an optional label.
///
/// The raw subject string doubles as the subscription id, so subscribing
/// again with the same list replaces the earlier registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    subject: String,
    subjects: BTreeSet<String>,
    label: Option<String>,
}

/// Stored form; subjects are re-parsed on load.
#[derive(Serialize, Deserialize)]
struct StoredSubscription {
    subject: String,
    #[serde(default)]
    label: Option<String>,
}

impl Subscription {
    /// Parse a comma-separated subject list; rejects lists with no subjects.
    pub fn create(subject: &str, label: Option<&str>) -> Result<Self, CourierError> {
        let subjects: BTreeSet<String> = subject
            .split(SUBJECT_SEPARATOR)
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();
        if subjects.is_empty() {
            return Err(CourierError::InvalidSubject(subject.to_string()));
        }
        Ok(Self {
            subject: subject.to_string(),
            subjects,
            label: label.filter(|label| !label.is_empty()).map(str::to_string),
        })
    }

    /// Subscription id stamped on multicast deliveries.
    pub fn id(&self) -> &str {
        &self.subject
    }

    /// The subject list as the client sent it.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.subjects.iter().map(String::as_str)
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn covers(&self, subject: &str) -> bool {
        self.subjects.contains(subject)
    }

    pub(crate) fn to_json(&self) -> Result<String, CourierError> {
        let stored = StoredSubscription {
            subject: self.subject.clone(),
            label: self.label.clone(),
        };
        Ok(serde_json::to_string(&stored)?)
    }

    pub(crate) fn from_json(raw: &str) -> Result<Self, CourierError> {
        let stored: StoredSubscription = serde_json::from_str(raw)?;
        Self::create(&stored.subject, stored.label.as_deref())
    }
}
