//! Shared value types: timestamps, secrets, and read annotations.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::ErrorNote;

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Creates a [`Timestamp`] from milliseconds since the Unix epoch.
    ///
    /// Returns `None` if the value is outside chrono's representable range.
    pub fn from_unix_millis(millis: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(millis).single().map(Self)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// A credential (password or API token) for talking to a node.
///
/// `Debug` output is redacted so that secrets never reach logs through
/// `tracing` field capture. There is deliberately no `Display` impl; callers
/// that really need the value use [`Secret::expose`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wraps a raw credential value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw credential. Only adapters building an authenticated
    /// request should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns `true` if no credential was supplied.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

// ---------------------------------------------------------------------------
// Read annotations
// ---------------------------------------------------------------------------

/// Result of a read that may have been served from cache during an outage.
///
/// `stale == false` means the items came from the node (or a fresh cache
/// entry). `stale == true` means the node could not be reached and `items` is
/// the last-known-good copy; `note` then says why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fetched<T> {
    /// The data that was read.
    pub items: T,
    /// Whether `items` is a last-known-good copy rather than a live answer.
    pub stale: bool,
    /// Why the data is stale. Always `Some` when `stale` is `true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<ErrorNote>,
}

impl<T> Fetched<T> {
    /// Wraps live (or freshly cached) data.
    pub fn fresh(items: T) -> Self {
        Self {
            items,
            stale: false,
            note: None,
        }
    }

    /// Wraps last-known-good data served because the node failed.
    pub fn stale(items: T, note: ErrorNote) -> Self {
        Self {
            items,
            stale: true,
            note: Some(note),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn secret_debug_output_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn timestamps_convert_from_unix_millis() {
        let ts = Timestamp::from_unix_millis(1_700_000_000_000).unwrap();
        assert_eq!(ts.to_string(), "2023-11-14T22:13:20+00:00");
    }

    #[test]
    fn fresh_reads_omit_the_note_on_the_wire() {
        let json = serde_json::to_value(Fetched::fresh(vec![1, 2])).unwrap();
        assert_eq!(json, serde_json::json!({ "items": [1, 2], "stale": false }));

        let stale = Fetched::stale(
            Vec::<u8>::new(),
            ErrorNote {
                kind: ErrorKind::Unreachable,
                message: "timed out".into(),
            },
        );
        let json = serde_json::to_value(stale).unwrap();
        assert_eq!(json["stale"], true);
        assert_eq!(json["note"]["kind"], "unreachable");
    }
}
