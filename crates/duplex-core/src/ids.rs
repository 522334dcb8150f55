//! Branded ID newtypes for type safety.
//!
//! Every entity in the Duplex system has a distinct ID type implemented as a
//! newtype wrapper around `String`. This prevents accidentally passing a
//! workflow key where an operation log entry ID is expected.
//!
//! [`WorkflowKey`] is usually caller-supplied (it is the idempotency key of a
//! logical attempt); the other IDs are UUID v7 (time-ordered) generated via
//! [`uuid::Uuid::now_v7`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generate a new UUID v7 string (time-ordered).
fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Caller-supplied idempotency key identifying one logical workflow attempt.
    WorkflowKey
}

branded_id! {
    /// Unique identifier for an operation log entry.
    EntryId
}

branded_id! {
    /// Opaque reference produced by a store: a generated relational primary
    /// key or a document identifier.
    StoreRef
}

branded_id! {
    /// Unique identifier for a reconciliation task.
    TaskId
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_id_new_is_uuid_v7() {
        let id = EntryId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn task_id_new_is_uuid_v7() {
        let id = TaskId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn ids_are_unique() {
        let a = EntryId::new();
        let b = EntryId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn workflow_key_from_string() {
        let key = WorkflowKey::from_string("u1".to_owned());
        assert_eq!(key.as_str(), "u1");
    }

    #[test]
    fn from_str_ref() {
        let key = WorkflowKey::from("e1-u1");
        assert_eq!(key.as_str(), "e1-u1");
    }

    #[test]
    fn deref_to_str() {
        let r = StoreRef::from("row:42");
        let s: &str = &r;
        assert_eq!(s, "row:42");
    }

    #[test]
    fn display() {
        let r = StoreRef::from("doc:abc");
        assert_eq!(format!("{r}"), "doc:abc");
    }

    #[test]
    fn into_string() {
        let key = WorkflowKey::from("convert");
        let s: String = key.into();
        assert_eq!(s, "convert");
    }

    #[test]
    fn serde_roundtrip() {
        let key = WorkflowKey::from("serde-test");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"serde-test\"");
        let back: WorkflowKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn serde_in_struct() {
        #[derive(Serialize, Deserialize, Debug, PartialEq)]
        struct Envelope {
            key: WorkflowKey,
            reference: StoreRef,
        }

        let env = Envelope {
            key: WorkflowKey::from("wf-1"),
            reference: StoreRef::from("ref-1"),
        };
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn hash_and_eq() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        let key = WorkflowKey::from("same");
        let _ = set.insert(key.clone());
        let _ = set.insert(key.clone());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn default_creates_new() {
        let a = EntryId::default();
        let b = EntryId::default();
        assert_ne!(a, b, "default should create unique IDs");
    }

    #[test]
    fn into_inner() {
        let key = WorkflowKey::from("inner-test");
        assert_eq!(key.into_inner(), "inner-test");
    }
}
