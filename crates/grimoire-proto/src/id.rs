//! Opaque identifiers used throughout the engine.
//!
//! All three are plain strings on the wire. `DocId` is minted by the host
//! (it is the workspace id); `ClientId` and `HighlightId` are minted
//! server-side.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an existing identifier string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id! {
    /// Identifies one annotated document (the workspace id). Supplied by the
    /// host; the engine treats it as a bare key.
    DocId
}

string_id! {
    /// Identifies one live connection. Minted per connection, never reused.
    ClientId
}

string_id! {
    /// Identifies one highlight within a document replica.
    HighlightId
}

impl ClientId {
    /// Mints a fresh connection identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl HighlightId {
    /// Mints a fresh highlight identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}
