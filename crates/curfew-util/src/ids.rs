//! Strongly-typed identifiers for curfew

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a parent account (opaque string issued by the auth provider)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParentId(String);

impl ParentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ParentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ParentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Row identifiers assigned by the store.
macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

row_id!(
    /// Identifier of a child profile
    ChildId
);
row_id!(
    /// Identifier of a registered device
    DeviceId
);
row_id!(
    /// Identifier of a lock schedule
    ScheduleId
);
row_id!(
    /// Identifier of an activity log entry
    ActivityId
);

/// Unique identifier for a connected IPC client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_id_equality() {
        assert_eq!(ParentId::new("parent-1"), ParentId::from("parent-1"));
        assert_ne!(ParentId::new("parent-1"), ParentId::new("parent-2"));
    }

    #[test]
    fn row_ids_serialize_as_plain_numbers() {
        let json = serde_json::to_string(&DeviceId::new(42)).unwrap();
        assert_eq!(json, "42");

        let parsed: ScheduleId = serde_json::from_str("7").unwrap();
        assert_eq!(parsed, ScheduleId::new(7));
    }

    #[test]
    fn client_id_uniqueness() {
        assert_ne!(ClientId::new(), ClientId::new());
    }
}
