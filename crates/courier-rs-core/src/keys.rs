//! Shared-store key layout. Every node must agree on these names.

/// Ordered index of every registered session id, scored by creation time.
pub(crate) const ALL_SESSIONS: &str = "c:all";

/// Record field holding the aging lock.
pub(crate) const AGING_LOCK_FIELD: &str = "aging";

pub(crate) fn session(id: &str) -> String {
    format!("c:s:{id}")
}

pub(crate) fn subscriber(id: &str) -> String {
    format!("c:sr:{id}")
}

pub(crate) fn subscriptions(id: &str) -> String {
    format!("c:sc:{id}")
}

/// Point lookup: session id -> subscription id.
pub(crate) fn subject(subject: &str) -> String {
    format!("c:sj:{subject}")
}

/// Paged discovery of sessions subscribed to a subject.
pub(crate) fn subject_index(subject: &str) -> String {
    format!("c:zs:{subject}")
}

pub(crate) fn queue(id: &str) -> String {
    format!("c:q:{id}")
}

/// Current wall-clock time in milliseconds, used for store scores and stamps.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
