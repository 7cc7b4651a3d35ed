//! Tag definitions - short labels attached to records.
//!
//! Four control tags change how the core treats a record (priority bumps and
//! depth ceilings); everything else is an opaque domain label the core only
//! ever compares for set intersection.

use serde::{Deserialize, Serialize};

/// A label attached to a record. Records hold a `HashSet<Tag>`, so duplicates
/// collapse and insertion order is irrelevant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tag {
    /// Forces `Critical` priority regardless of charge.
    Emergency,

    /// Forces at least `High` priority regardless of charge.
    Escalation,

    /// Raises the record's depth ceiling to the extended limit.
    Extended,

    /// Raises the record's depth ceiling to the emergency limit.
    Override,

    /// Opaque domain label (e.g. "lineage", "audit").
    Label(String),
}

impl Tag {
    /// Create a domain label tag.
    pub fn label(name: impl Into<String>) -> Self {
        Tag::Label(name.into())
    }

    /// Convert the tag to a string representation.
    pub fn as_string(&self) -> String {
        match self {
            Tag::Emergency => "emergency".to_string(),
            Tag::Escalation => "escalation".to_string(),
            Tag::Extended => "extended".to_string(),
            Tag::Override => "override".to_string(),
            Tag::Label(s) => format!("label:{}", s),
        }
    }

    /// Get the category of this tag.
    pub fn category(&self) -> &'static str {
        match self {
            Tag::Emergency | Tag::Escalation | Tag::Extended | Tag::Override => "control",
            Tag::Label(_) => "label",
        }
    }

    /// Whether this tag changes core behaviour (priority or depth ceiling).
    pub fn is_control(&self) -> bool {
        self.category() == "control"
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tag_creation() {
        let tag = Tag::label("lineage");
        assert!(matches!(tag, Tag::Label(s) if s == "lineage"));
    }

    #[test]
    fn test_tag_as_string() {
        assert_eq!(Tag::Emergency.as_string(), "emergency");
        assert_eq!(Tag::label("audit").as_string(), "label:audit");
    }

    #[test]
    fn test_tag_category() {
        assert!(Tag::Override.is_control());
        assert!(Tag::Escalation.is_control());
        assert!(!Tag::label("audit").is_control());
    }

    #[test]
    fn test_tags_collapse_in_sets() {
        let mut set = HashSet::new();
        set.insert(Tag::label("x"));
        set.insert(Tag::label("x")); // Duplicate
        set.insert(Tag::Emergency);

        assert_eq!(set.len(), 2);
    }
}
