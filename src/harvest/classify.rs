//! Classification of remote failures into retry decisions.

use crate::traits::{RemoteError, RemoteErrorKind};

/// Message fragments that mark a failure as safe to retry.
const TRANSIENT_MARKERS: &[&str] = &["timeout", "temporarily unavailable"];

/// Message fragments that mark a structural failure no retry can fix.
const SCHEMA_MARKERS: &[&str] = &[
    "invalid field",
    "unknown field",
    "unknown model",
    "does not exist",
    "permission denied",
    "dictionary key must be string",
    "psycopg2.errors.syntaxerror",
    "from (0) as",
    "notimplementederror",
    "operator does not exist",
];

/// Retry decision for one remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry is safe; the connection should be re-established first.
    Transient,
    /// The entity cannot be read with the current request shape.
    Schema,
    /// No rule matched. Not retried, logged separately.
    Unexpected,
}

/// Classifies `err`. Structural markers win over transient ones.
pub fn classify(err: &RemoteError) -> ErrorClass {
    let message = err.message.to_lowercase();

    if SCHEMA_MARKERS.iter().any(|m| message.contains(m)) {
        return ErrorClass::Schema;
    }

    let transient_kind = matches!(
        err.kind,
        RemoteErrorKind::Timeout | RemoteErrorKind::ConnectionReset | RemoteErrorKind::Protocol
    );
    if transient_kind || TRANSIENT_MARKERS.iter().any(|m| message.contains(m)) {
        return ErrorClass::Transient;
    }

    ErrorClass::Unexpected
}

/// Short human-readable reason for `err`, used in results and logs.
pub fn summarize(entity: &str, err: &RemoteError) -> String {
    let message = err.message.as_str();
    let normalized = message.to_lowercase();

    if normalized.contains("notimplementederror") {
        return format!("Entity {entity} does not implement search (NotImplementedError).");
    }
    if normalized.contains("operator does not exist") {
        return "Database schema error: operator does not exist for the requested type."
            .to_string();
    }
    if normalized.contains("dictionary key must be string") {
        return "Remote returned a structure with non-string keys.".to_string();
    }
    if normalized.contains("unknown field") {
        return "Requested field does not exist on the entity.".to_string();
    }
    if normalized.contains("permission denied") {
        return "Credentials are not allowed to read this entity.".to_string();
    }

    message
        .lines()
        .map(|line| line.trim().trim_matches('\''))
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
        .unwrap_or_else(|| {
            if message.is_empty() {
                "Unknown error".to_string()
            } else {
                message.to_string()
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_by_kind() {
        let err = RemoteError::new(RemoteErrorKind::ConnectionReset, "connection reset by peer");
        assert_eq!(classify(&err), ErrorClass::Transient);

        let err = RemoteError::new(RemoteErrorKind::Protocol, "502 Bad Gateway");
        assert_eq!(classify(&err), ErrorClass::Transient);
    }

    #[test]
    fn test_transient_by_marker_is_case_insensitive() {
        let err = RemoteError::fault("Service Temporarily Unavailable");
        assert_eq!(classify(&err), ErrorClass::Transient);

        let err = RemoteError::new(RemoteErrorKind::Other, "read TIMEOUT on socket");
        assert_eq!(classify(&err), ErrorClass::Transient);
    }

    #[test]
    fn test_schema_markers() {
        for msg in [
            "ValueError: Invalid field 'x_foo' on model 'res.partner'",
            "psycopg2.errors.SyntaxError: syntax error at or near",
            "Traceback ...\nNotImplementedError",
            "operator does not exist: integer = boolean",
            "AccessError: Permission denied for model sale.order",
        ] {
            assert_eq!(classify(&RemoteError::fault(msg)), ErrorClass::Schema, "{msg}");
        }
    }

    #[test]
    fn test_schema_wins_over_transient_kind() {
        let err = RemoteError::timeout("relation does not exist");
        assert_eq!(classify(&err), ErrorClass::Schema);
    }

    #[test]
    fn test_anything_else_is_unexpected() {
        let err = RemoteError::fault("KeyError: 'name'");
        assert_eq!(classify(&err), ErrorClass::Unexpected);
    }

    #[test]
    fn test_summarize_known_patterns() {
        let err = RemoteError::fault("Traceback\n  NotImplementedError");
        assert!(summarize("ir.actions", &err).contains("ir.actions"));

        let err = RemoteError::fault("ValueError: Unknown field 'foo'");
        assert_eq!(
            summarize("res.partner", &err),
            "Requested field does not exist on the entity."
        );
    }

    #[test]
    fn test_summarize_falls_back_to_last_line() {
        let err = RemoteError::fault("Traceback (most recent call last):\n  File x\n'KeyError: name'\n\n");
        assert_eq!(summarize("res.partner", &err), "KeyError: name");

        let err = RemoteError::fault("");
        assert_eq!(summarize("res.partner", &err), "Unknown error");
    }
}
