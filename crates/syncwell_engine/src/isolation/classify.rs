//! Heuristic classification of error text from uncontrolled dependencies.

use syncwell_protocol::ErrorKind;

/// Substring patterns per kind, checked in order. The first kind with a
/// matching pattern wins, so more specific kinds come first.
const PATTERNS: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::Integrity,
        &["integrity", "checksum", "corrupt", "hash mismatch"],
    ),
    (
        ErrorKind::RateLimit,
        &["rate limit", "rate_limit", "too many requests", "429", "throttl"],
    ),
    (
        ErrorKind::Timeout,
        &["timeout", "timed out", "deadline exceeded"],
    ),
    (
        ErrorKind::Authentication,
        &["auth", "unauthorized", "401", "403", "forbidden", "credential"],
    ),
    (ErrorKind::Conflict, &["conflict", "409", "precondition"]),
    (
        ErrorKind::Version,
        &["version", "schema", "incompatible", "upgrade required"],
    ),
    (
        ErrorKind::Validation,
        &["validation", "invalid", "required field", "malformed", "400"],
    ),
    (
        ErrorKind::Database,
        &["database", "sqlite", "storage", "disk", "quota", "transaction"],
    ),
    (
        ErrorKind::Network,
        &[
            "network",
            "connection",
            "offline",
            "unreachable",
            "dns",
            "socket",
            "fetch failed",
        ],
    ),
];

/// Maps free-form error text to an [`ErrorKind`].
///
/// Matching is case-insensitive. Text with no known pattern is
/// [`ErrorKind::Unknown`].
pub fn classify_message(message: &str) -> ErrorKind {
    let lowered = message.to_ascii_lowercase();
    PATTERNS
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|p| lowered.contains(p)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_substrings() {
        assert_eq!(classify_message("Network request failed"), ErrorKind::Network);
        assert_eq!(classify_message("Request TIMEOUT"), ErrorKind::Timeout);
        assert_eq!(classify_message("auth token expired"), ErrorKind::Authentication);
        assert_eq!(classify_message("write conflict on row"), ErrorKind::Conflict);
        assert_eq!(classify_message("integrity check failed"), ErrorKind::Integrity);
        assert_eq!(classify_message("HTTP 429"), ErrorKind::RateLimit);
        assert_eq!(classify_message("schema version 3 unsupported"), ErrorKind::Version);
        assert_eq!(classify_message("invalid payload"), ErrorKind::Validation);
        assert_eq!(classify_message("disk I/O error"), ErrorKind::Database);
    }

    #[test]
    fn specific_kinds_win() {
        // Mentions both a connection and a timeout.
        assert_eq!(
            classify_message("connection timed out"),
            ErrorKind::Timeout
        );
        assert_eq!(
            classify_message("network payload checksum mismatch"),
            ErrorKind::Integrity
        );
    }

    #[test]
    fn unmatched_is_unknown() {
        assert_eq!(classify_message("something odd happened"), ErrorKind::Unknown);
        assert_eq!(classify_message(""), ErrorKind::Unknown);
    }
}
