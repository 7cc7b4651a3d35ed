//! Priority derivation - the pure function from (charge, tags) to dispatch level.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::tag::Tag;
use crate::tier::{is_canonization_eligible, is_emergency};

/// Dispatch priority, ordered `Background < Standard < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Background,
    Standard,
    High,
    Critical,
}

impl Priority {
    /// Derive the priority for a record. Pure: identical (charge, tags)
    /// always yield the identical priority.
    ///
    /// Rules are evaluated in fixed order, first match wins:
    /// 1. `Critical` - charge >= 86 or an emergency tag.
    /// 2. `High` - charge >= 71 or an escalation tag.
    /// 3. `Standard` - charge in 51-70.
    /// 4. `Background` - everything else.
    pub fn of(charge: u8, tags: &HashSet<Tag>) -> Self {
        if is_emergency(charge) || tags.contains(&Tag::Emergency) {
            Priority::Critical
        } else if is_canonization_eligible(charge) || tags.contains(&Tag::Escalation) {
            Priority::High
        } else if charge >= 51 {
            Priority::Standard
        } else {
            Priority::Background
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Priority::Background => "background",
            Priority::Standard => "standard",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(items: &[Tag]) -> HashSet<Tag> {
        items.iter().cloned().collect()
    }

    #[test]
    fn test_priority_from_charge_alone() {
        let none = HashSet::new();
        assert_eq!(Priority::of(0, &none), Priority::Background);
        assert_eq!(Priority::of(50, &none), Priority::Background);
        assert_eq!(Priority::of(51, &none), Priority::Standard);
        assert_eq!(Priority::of(70, &none), Priority::Standard);
        assert_eq!(Priority::of(71, &none), Priority::High);
        assert_eq!(Priority::of(85, &none), Priority::High);
        assert_eq!(Priority::of(86, &none), Priority::Critical);
        assert_eq!(Priority::of(100, &none), Priority::Critical);
    }

    #[test]
    fn test_emergency_tag_outranks_charge() {
        assert_eq!(
            Priority::of(10, &tags(&[Tag::Emergency])),
            Priority::Critical
        );
    }

    #[test]
    fn test_escalation_tag_bumps_to_high() {
        assert_eq!(Priority::of(10, &tags(&[Tag::Escalation])), Priority::High);
        // Emergency still wins when both are present.
        assert_eq!(
            Priority::of(10, &tags(&[Tag::Escalation, Tag::Emergency])),
            Priority::Critical
        );
    }

    #[test]
    fn test_priority_is_deterministic() {
        let t = tags(&[Tag::label("x"), Tag::Escalation]);
        for _ in 0..10 {
            assert_eq!(Priority::of(42, &t), Priority::of(42, &t));
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Standard);
        assert!(Priority::Standard > Priority::Background);
    }
}
