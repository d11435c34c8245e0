//! Newtype domain identifiers.
//!
//! Every concept with an identity in the unified model is a distinct newtype so
//! that a [`ViewId`] can never be passed where a [`JobName`] is
//! expected even though both are strings on the wire.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A string identifier was empty or all whitespace.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0} must not be empty")]
pub struct EmptyIdentifier(pub &'static str);

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display, and a
// TryFrom<String> that deserialization goes through.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is
            /// empty or all whitespace.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                Self::try_from(value.into()).ok()
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = EmptyIdentifier;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                if value.trim().is_empty() {
                    return Err(EmptyIdentifier(stringify!($name)));
                }
                Ok(Self(value))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Macro for u64-wrapped newtypes (remote-assigned integers).
// Generates: struct (Copy), new(), as_u64(), Display.
// ---------------------------------------------------------------------------
macro_rules! u64_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new identifier from a raw integer.
            pub fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the underlying integer value.
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (generated by the registry)
// ---------------------------------------------------------------------------

/// Identifies a registered node.
///
/// Generated by the registry on `add`; never reused after the node is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generates a new random node identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a [`NodeId`] from an existing UUID (e.g. loaded from the store).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: remote-assigned integers
// ---------------------------------------------------------------------------

u64_id! {
    /// Build number within a job. Assigned by the remote node and strictly
    /// increasing within one job.
    BuildNumber
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed (remote names)
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies a view (dashboard) on a node. Remote systems key views by
    /// name, so this is the view's remote name.
    ViewId
}

string_id! {
    /// Full name of a job on a node. Folder jobs use `/` as the separator
    /// (e.g. `"team/deploy"`).
    JobName
}

string_id! {
    /// Identifies one stage (flow node) inside a pipeline run.
    StageId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ids_reject_empty_values() {
        assert!(ViewId::new("").is_none());
        assert!(JobName::new(" ").is_none());
        assert_eq!(JobName::new("team/deploy").unwrap().as_str(), "team/deploy");
    }

    #[test]
    fn blank_string_ids_are_refused_when_deserialized() {
        let err = serde_json::from_str::<JobName>("\"\"").unwrap_err();
        assert!(err.to_string().contains("JobName must not be empty"));
        assert!(serde_json::from_str::<ViewId>("\"  \"").is_err());
        assert!(serde_json::from_str::<StageId>("\"\"").is_err());

        let job: JobName = serde_json::from_str("\"team/deploy\"").unwrap();
        assert_eq!(job.as_str(), "team/deploy");
        assert_eq!(serde_json::to_string(&job).unwrap(), "\"team/deploy\"");
    }

    #[test]
    fn node_id_round_trips_through_its_display_form() {
        let id = NodeId::new_random();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn node_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<NodeId>().is_err());
    }

    #[test]
    fn build_numbers_order_numerically() {
        assert!(BuildNumber::new(9) < BuildNumber::new(10));
    }
}
