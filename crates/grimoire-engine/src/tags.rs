//! Tag catalogue seam.
//!
//! Tag display names live in the workspace catalogue, outside the engine.
//! The export path resolves them through this trait when formatting margin
//! notes; search-text extraction does the same on the host side.

use grimoire_proto::Tag;
use std::collections::HashMap;

/// Resolves tag identifiers to display names.
pub trait TagCatalogue: Send + Sync {
    /// The display name for a tag, or `None` if the catalogue does not know
    /// it (callers fall back to the raw tag string).
    fn resolve(&self, tag: &Tag) -> Option<String>;
}

/// A catalogue backed by a fixed map. Useful for hosts with a small tag set
/// and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTagCatalogue {
    names: HashMap<Tag, String>,
}

impl StaticTagCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: Tag, display_name: impl Into<String>) {
        self.names.insert(tag, display_name.into());
    }
}

impl FromIterator<(Tag, String)> for StaticTagCatalogue {
    fn from_iter<I: IntoIterator<Item = (Tag, String)>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().collect(),
        }
    }
}

impl TagCatalogue for StaticTagCatalogue {
    fn resolve(&self, tag: &Tag) -> Option<String> {
        self.names.get(tag).cloned()
    }
}
