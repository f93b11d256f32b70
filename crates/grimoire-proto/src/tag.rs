//! Tag identity.
//!
//! Workspaces register tags under UUIDs, but highlights created before the
//! catalogue existed carry short string keys. Both forms travel as plain
//! strings on the wire and inside the CRDT; parsing decides the variant.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// A highlight tag: either a workspace tag UUID or a legacy string key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tag {
    /// A tag registered in the workspace catalogue.
    Uuid(Uuid),
    /// A pre-catalogue string key, kept for compatibility. Never rewritten
    /// to a UUID by the engine; migration is an external concern.
    Legacy(String),
}

impl Tag {
    /// Parses a tag string. Anything that is not a valid UUID is legacy.
    pub fn parse(raw: &str) -> Self {
        match Uuid::parse_str(raw) {
            Ok(id) => Tag::Uuid(id),
            Err(_) => Tag::Legacy(raw.to_string()),
        }
    }

    /// True for the legacy string form.
    pub fn is_legacy(&self) -> bool {
        matches!(self, Tag::Legacy(_))
    }

    /// True when the tag has no content at all (rejected at validation).
    pub fn is_empty(&self) -> bool {
        matches!(self, Tag::Legacy(key) if key.is_empty())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Uuid(id) => write!(f, "{id}"),
            Tag::Legacy(key) => f.write_str(key),
        }
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Tag::parse(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_string_parses_as_uuid() {
        let raw = "c4ca4238-a0b9-3382-8dcc-509a6f75849b";
        let tag = Tag::parse(raw);
        assert!(matches!(tag, Tag::Uuid(_)));
        assert_eq!(tag.to_string(), raw);
    }

    #[test]
    fn test_short_key_parses_as_legacy() {
        let tag = Tag::parse("tag-jurisdiction");
        assert_eq!(tag, Tag::Legacy("tag-jurisdiction".to_string()));
        assert!(tag.is_legacy());
    }

    #[test]
    fn test_empty_tag_is_empty() {
        assert!(Tag::parse("").is_empty());
        assert!(!Tag::parse("x").is_empty());
    }

    #[test]
    fn test_serde_round_trip_preserves_variant() {
        let legacy = Tag::Legacy("quote".to_string());
        let json = serde_json::to_string(&legacy).unwrap();
        assert_eq!(json, "\"quote\"");
        assert_eq!(serde_json::from_str::<Tag>(&json).unwrap(), legacy);

        let uuid = Tag::parse("550e8400-e29b-41d4-a716-446655440000");
        let json = serde_json::to_string(&uuid).unwrap();
        assert_eq!(serde_json::from_str::<Tag>(&json).unwrap(), uuid);
    }
}
