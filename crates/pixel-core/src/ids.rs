//! Branded ID newtypes for type safety.
//!
//! Visitor, session and event identifiers are all UUID strings on the wire.
//! Each gets its own newtype so they cannot be swapped at a call site.
//!
//! Fresh IDs are random UUID v4 values. Server-assigned IDs are accepted
//! verbatim via [`From<String>`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn new_v4() -> String {
    Uuid::new_v4().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v4).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v4())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
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
    /// Durable anonymous identifier for a browser or device.
    VisitorId
}

branded_id! {
    /// Identifier for a bounded period of continuous activity.
    SessionId
}

branded_id! {
    /// Correlation identifier for a single tracked event.
    EventId
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
