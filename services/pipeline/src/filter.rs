//! Subscriber filter policies over message attributes.

use std::collections::{BTreeMap, HashMap};

/// Condition on a single message attribute
#[derive(Debug, Clone, PartialEq)]
pub enum FilterCondition {
    /// Attribute present and equal to one of the values
    OneOf(Vec<String>),
    /// Attribute present and equal to none of the values
    AnythingBut(Vec<String>),
    /// Attribute presence (`true`) or absence (`false`)
    Exists(bool),
}

impl FilterCondition {
    fn matches(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (FilterCondition::OneOf(allowed), Some(value)) => allowed.iter().any(|a| a == value),
            (FilterCondition::AnythingBut(denied), Some(value)) => {
                !denied.iter().any(|d| d == value)
            }
            (FilterCondition::Exists(expected), value) => value.is_some() == *expected,
            (_, None) => false,
        }
    }
}

/// Predicate declared once per subscription when the topic is wired.
///
/// All conditions must hold. A policy without conditions matches every
/// message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterPolicy {
    conditions: BTreeMap<String, FilterCondition>,
}

impl FilterPolicy {
    /// Policy that accepts every message
    pub fn match_all() -> Self {
        Self::default()
    }

    /// Require `attribute` to equal one of `values`
    pub fn one_of<I, S>(self, attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_condition(
            attribute,
            FilterCondition::OneOf(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Require `attribute` to be present and differ from all of `values`
    pub fn anything_but<I, S>(self, attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_condition(
            attribute,
            FilterCondition::AnythingBut(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Require `attribute` to be present or absent
    pub fn exists(self, attribute: impl Into<String>, present: bool) -> Self {
        self.with_condition(attribute, FilterCondition::Exists(present))
    }

    pub fn with_condition(mut self, attribute: impl Into<String>, condition: FilterCondition) -> Self {
        self.conditions.insert(attribute.into(), condition);
        self
    }

    pub fn is_match_all(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluate the policy against message attributes
    pub fn matches(&self, attributes: &HashMap<String, String>) -> bool {
        self.conditions.iter().all(|(name, condition)| {
            condition.matches(attributes.get(name).map(String::as_str))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_match_all() {
        let policy = FilterPolicy::match_all();
        assert!(policy.is_match_all());
        assert!(policy.matches(&HashMap::new()));
        assert!(policy.matches(&attrs(&[("comment_type", "Anything")])));
    }

    #[test]
    fn test_one_of() {
        let policy = FilterPolicy::match_all().one_of("comment_type", ["Caption"]);

        assert!(policy.matches(&attrs(&[("comment_type", "Caption")])));
        assert!(!policy.matches(&attrs(&[("comment_type", "caption")])));
        assert!(!policy.matches(&attrs(&[("comment_type", "Tag")])));
        assert!(!policy.matches(&HashMap::new()));
    }

    #[test]
    fn test_anything_but_requires_presence() {
        let policy = FilterPolicy::match_all().anything_but("comment_type", ["Caption"]);

        assert!(policy.matches(&attrs(&[("comment_type", "Tag")])));
        assert!(!policy.matches(&attrs(&[("comment_type", "Caption")])));
        assert!(!policy.matches(&HashMap::new()));
    }

    #[test]
    fn test_exists() {
        let absent = FilterPolicy::match_all().exists("comment_type", false);
        assert!(absent.matches(&HashMap::new()));
        assert!(!absent.matches(&attrs(&[("comment_type", "Caption")])));

        let present = FilterPolicy::match_all().exists("comment_type", true);
        assert!(present.matches(&attrs(&[("comment_type", "Caption")])));
    }

    #[test]
    fn test_conditions_are_conjunctive() {
        let policy = FilterPolicy::match_all()
            .one_of("comment_type", ["Caption", "Title"])
            .exists("caption_text", true);

        assert!(policy.matches(&attrs(&[("comment_type", "Title"), ("caption_text", "x")])));
        assert!(!policy.matches(&attrs(&[("comment_type", "Title")])));
    }
}
