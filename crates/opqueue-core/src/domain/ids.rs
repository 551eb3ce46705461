//! Domain identifiers (strongly-typed IDs).
//!
//! Every persisted record is keyed by a ULID. `Id<T>` provides the shared
//! implementation while the marker type `T` keeps `OperationId` and
//! `OrchestratorId` from being mixed up at compile time.
//!
//! On the wire an id is the bare ULID string (that is what the document store
//! keeps in `_id`). `Display` adds a short prefix for humans; `FromStr`
//! accepts both forms.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each id kind.
pub trait IdMarker: Send + Sync + 'static {
    /// Prefix used by `Display` (e.g. "op-").
    fn prefix() -> &'static str;
}

/// Generic id type.
///
/// `T` is only a `PhantomData` marker and costs nothing at runtime.
#[repr(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// The raw key stored in the document's `_id` field.
    pub fn key(&self) -> String {
        self.ulid.to_string()
    }
}

// Manual impls: derives would put bounds on `T` that the uninhabited markers
// don't need.
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: IdMarker> Copy for Id<T> {}

impl<T: IdMarker> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ulid == other.ulid
    }
}

impl<T: IdMarker> Eq for Id<T> {}

impl<T: IdMarker> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ulid.hash(state);
    }
}

impl<T: IdMarker> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: IdMarker> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ulid.cmp(&other.ulid)
    }
}

impl<T: IdMarker> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

/// Error returned when an id string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id `{0}`")]
pub struct ParseIdError(pub String);

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError(s.to_string()))
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key())
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ========================================
// Markers
// ========================================

/// Marker for delegated operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {}

impl IdMarker for Operation {
    fn prefix() -> &'static str {
        "op-"
    }
}

/// Marker for orchestrator registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Orchestrator {}

impl IdMarker for Orchestrator {
    fn prefix() -> &'static str {
        "orch-"
    }
}

/// Identifier of a queued operation.
pub type OperationId = Id<Operation>;

/// Identifier of an orchestrator record (not its instance identifier).
pub type OrchestratorId = Id<Orchestrator>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_prefix_and_parse_accepts_both_forms() {
        let ulid = Ulid::new();
        let id = OperationId::from_ulid(ulid);

        assert!(id.to_string().starts_with("op-"));
        assert_eq!(id.to_string().parse::<OperationId>().unwrap(), id);
        assert_eq!(ulid.to_string().parse::<OperationId>().unwrap(), id);
    }

    #[test]
    fn serializes_as_bare_ulid_string() {
        let id = OrchestratorId::from_ulid(Ulid::new());
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.key()));

        let back: OrchestratorId = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!("op-not-a-ulid".parse::<OperationId>().is_err());
    }

    #[test]
    fn phantom_marker_costs_nothing() {
        assert_eq!(std::mem::size_of::<OperationId>(), std::mem::size_of::<Ulid>());
    }
}
