//! Event-type subscription matching.
//!
//! A pattern is either an exact event type (`user.created`) or a prefix
//! followed by a trailing `*` (`user.*`, `*`). Matching is case-sensitive.

/// Returns true when `pattern` matches `event_type`.
pub fn matches(pattern: &str, event_type: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => event_type.starts_with(prefix),
        None => pattern == event_type,
    }
}

/// Returns true when any of `patterns` matches `event_type`.
pub fn matches_any<S: AsRef<str>>(patterns: &[S], event_type: &str) -> bool {
    patterns.iter().any(|pattern| matches(pattern.as_ref(), event_type))
}
