//! Hierarchical topics and prefix-based subscription filters.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Div;

/// The separator between topic components.
pub const SEP: char = '/';

/// A reserved component which must not appear in a user topic. Topics whose
/// first component is the sentinel stay local to the endpoint and are never
/// forwarded to peers.
pub const RESERVED: &str = "<$>";

/// A hierarchical topic used as the pub/sub communication pattern.
///
/// A topic is an ordered sequence of non-empty components separated by `/`.
/// Comparison is lexicographic on the string form. Topics are immutable once
/// constructed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Parse a user-supplied topic.
    ///
    /// # Errors
    /// Returns [`Error::InvalidTopic`] if the string is empty, contains an
    /// empty component (leading, trailing, or duplicate separators), or uses
    /// the reserved sentinel component.
    pub fn parse(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        Self::check_components(&name)?;
        if name.split(SEP).any(|c| c == RESERVED) {
            return Err(Error::invalid_topic(format!(
                "component {RESERVED} is reserved for internal topics"
            )));
        }
        Ok(Self(name))
    }

    fn check_components(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_topic("topic cannot be empty"));
        }
        if name.split(SEP).any(str::is_empty) {
            return Err(Error::invalid_topic(format!(
                "empty component in {name:?} (leading, trailing, or doubled separator)"
            )));
        }
        Ok(())
    }

    /// Construct a topic under the reserved internal prefix.
    ///
    /// # Errors
    /// Returns [`Error::InvalidTopic`] if `suffix` contains empty components.
    pub fn internal(suffix: &str) -> Result<Self> {
        Self::check_components(suffix)?;
        Ok(Self(format!("{RESERVED}{SEP}{suffix}")))
    }

    /// Build a topic from its components.
    ///
    /// # Errors
    /// Returns [`Error::InvalidTopic`] for empty input or empty components.
    pub fn join<I, S>(components: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut name = String::new();
        for component in components {
            let component = component.as_ref();
            if !name.is_empty() {
                name.push(SEP);
            }
            name.push_str(component);
        }
        Self::check_components(&name)?;
        Ok(Self(name))
    }

    /// Iterate over the components of this topic.
    pub fn split(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEP)
    }

    /// The underlying string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this topic is a prefix of `other` at a component boundary.
    ///
    /// `a.prefix_of(b)` holds iff `a`'s components are a leading subsequence
    /// of `b`'s components; `a` is always a prefix of itself.
    pub fn prefix_of(&self, other: &Topic) -> bool {
        let prefix = self.0.as_bytes();
        let full = other.0.as_bytes();
        full.starts_with(prefix) && (full.len() == prefix.len() || full[prefix.len()] == SEP as u8)
    }

    /// Whether the first component is the reserved sentinel. Internal topics
    /// are only ever visible locally and never forwarded to peers.
    pub fn is_internal(&self) -> bool {
        self.split().next() == Some(RESERVED)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Concatenation with separator normalization: no duplicate separators, no
/// leading or trailing separator survive the join.
impl Div<&Topic> for &Topic {
    type Output = Topic;

    fn div(self, rhs: &Topic) -> Topic {
        let left = self.0.trim_end_matches(SEP);
        let right = rhs.0.trim_start_matches(SEP);
        Topic(format!("{left}{SEP}{right}"))
    }
}

impl Div<&str> for &Topic {
    type Output = Topic;

    fn div(self, rhs: &str) -> Topic {
        let left = self.0.trim_end_matches(SEP);
        let right = rhs.trim_matches(SEP);
        Topic(format!("{left}{SEP}{right}"))
    }
}

/// Topics with a special meaning, local to every endpoint.
pub mod well_known {
    use super::{Topic, RESERVED, SEP};
    use std::sync::LazyLock;

    /// Errors surfaced by the endpoint itself.
    pub static ERRORS: LazyLock<Topic> =
        LazyLock::new(|| Topic(format!("{RESERVED}{SEP}local/data/errors")));

    /// Peering and connectivity status events.
    pub static STATUSES: LazyLock<Topic> =
        LazyLock::new(|| Topic(format!("{RESERVED}{SEP}local/data/statuses")));

    /// Data-store lifecycle events.
    pub static STORE_EVENTS: LazyLock<Topic> =
        LazyLock::new(|| Topic(format!("{RESERVED}{SEP}local/data/store-events")));
}

/// A set of prefix topics describing a subscription.
///
/// A message on topic `t` matches the filter iff some entry is a
/// component-boundary prefix of `t`. Duplicate subscriptions collapse to a
/// single entry with a reference count, so a filter only changes shape when
/// the first reference appears or the last one goes away.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    entries: Vec<FilterEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FilterEntry {
    topic: Topic,
    refs: usize,
}

impl Filter {
    /// An empty filter that matches nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from a set of topics, collapsing duplicates.
    pub fn from_topics<I>(topics: I) -> Self
    where
        I: IntoIterator<Item = Topic>,
    {
        let mut filter = Self::new();
        filter.extend(topics);
        filter
    }

    /// Add subscriptions. Returns `true` if the effective topic set changed,
    /// i.e. at least one topic gained its first reference.
    pub fn extend<I>(&mut self, topics: I) -> bool
    where
        I: IntoIterator<Item = Topic>,
    {
        let mut changed = false;
        for topic in topics {
            match self.entries.iter_mut().find(|e| e.topic == topic) {
                Some(entry) => entry.refs += 1,
                None => {
                    self.entries.push(FilterEntry { topic, refs: 1 });
                    changed = true;
                }
            }
        }
        changed
    }

    /// Drop subscriptions. Returns `true` if the effective topic set changed,
    /// i.e. at least one topic lost its last reference.
    pub fn shrink<I>(&mut self, topics: I) -> bool
    where
        I: IntoIterator<Item = Topic>,
    {
        let mut changed = false;
        for topic in topics {
            if let Some(index) = self.entries.iter().position(|e| e.topic == topic) {
                let entry = &mut self.entries[index];
                entry.refs -= 1;
                if entry.refs == 0 {
                    self.entries.swap_remove(index);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Whether any entry is a prefix of `topic`.
    pub fn matches(&self, topic: &Topic) -> bool {
        self.entries.iter().any(|e| e.topic.prefix_of(topic))
    }

    /// The effective topic set, for advertising to peers.
    pub fn to_topics(&self) -> Vec<Topic> {
        self.entries.iter().map(|e| e.topic.clone()).collect()
    }

    /// Number of distinct prefix entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the filter matches nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<Topic> for Filter {
    fn from_iter<I: IntoIterator<Item = Topic>>(iter: I) -> Self {
        Self::from_topics(iter)
    }
}

/// Matches a topic against a plain list of prefixes, as advertised by peers.
pub fn prefix_match(prefixes: &[Topic], topic: &Topic) -> bool {
    prefixes.iter().any(|p| p.prefix_of(topic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn t(s: &str) -> Topic {
        Topic::parse(s).expect("valid topic")
    }

    #[test]
    fn parse_rejects_empty_components() {
        assert!(Topic::parse("").is_err());
        assert!(Topic::parse("/a").is_err());
        assert!(Topic::parse("a/").is_err());
        assert!(Topic::parse("a//b").is_err());
        assert!(Topic::parse("a/b/c").is_ok());
    }

    #[test]
    fn parse_rejects_reserved() {
        assert!(Topic::parse("<$>/local/data/errors").is_err());
        assert!(Topic::parse("a/<$>/b").is_err());
        // The sentinel as a substring of a component is fine.
        assert!(Topic::parse("a<$>b").is_ok());
    }

    #[test]
    fn join_and_split_are_inverse() {
        let topic = t("a/b/c");
        let components: Vec<&str> = topic.split().collect();
        assert_eq!(components, vec!["a", "b", "c"]);
        assert_eq!(Topic::join(components).unwrap(), topic);
    }

    #[test]
    fn div_normalizes_separators() {
        let joined = &t("a/b") / &t("c/d");
        assert_eq!(joined.as_str(), "a/b/c/d");
        let trimmed = &t("a") / "/b/";
        assert_eq!(trimmed.as_str(), "a/b");
    }

    #[test]
    fn prefix_of_respects_component_boundaries() {
        assert!(t("a").prefix_of(&t("a/b")));
        assert!(t("a/b").prefix_of(&t("a/b")));
        assert!(!t("a/b").prefix_of(&t("a")));
        // "ab" is not under "a" even though it shares the leading byte.
        assert!(!t("a").prefix_of(&t("ab")));
    }

    #[test]
    fn internal_topics() {
        assert!(well_known::ERRORS.is_internal());
        assert!(well_known::STATUSES.is_internal());
        assert!(well_known::STORE_EVENTS.is_internal());
        assert!(!t("local/data/errors").is_internal());
        assert_eq!(well_known::STATUSES.as_str(), "<$>/local/data/statuses");
        assert_eq!(Topic::internal("local/data/errors").unwrap(), *well_known::ERRORS);
        assert!(Topic::internal("").is_err());
    }

    #[test]
    fn filter_matches_by_prefix() {
        let filter = Filter::from_topics([t("a"), t("b/c")]);
        assert!(filter.matches(&t("a")));
        assert!(filter.matches(&t("a/x/y")));
        assert!(filter.matches(&t("b/c/d")));
        assert!(!filter.matches(&t("b")));
        assert!(!filter.matches(&t("c")));
    }

    #[test]
    fn filter_refcounts_collapse_duplicates() {
        let mut filter = Filter::new();
        assert!(filter.extend([t("a")]));
        assert!(!filter.extend([t("a")]));
        assert_eq!(filter.len(), 1);
        // First unsubscribe drops a reference, not the entry.
        assert!(!filter.shrink([t("a")]));
        assert!(filter.matches(&t("a/b")));
        assert!(filter.shrink([t("a")]));
        assert!(!filter.matches(&t("a/b")));
    }

    prop_compose! {
        fn component()(s in "[a-z][a-z0-9]{0,4}") -> String { s }
    }

    prop_compose! {
        fn topic_strategy()(parts in prop::collection::vec(component(), 1..5)) -> Topic {
            Topic::join(parts).expect("generated components are non-empty")
        }
    }

    proptest! {
        #[test]
        fn prefix_of_is_reflexive(a in topic_strategy()) {
            prop_assert!(a.prefix_of(&a));
        }

        #[test]
        fn prefix_of_holds_for_extensions(a in topic_strategy(), b in topic_strategy()) {
            prop_assert!(a.prefix_of(&(&a / &b)));
        }

        #[test]
        fn prefix_of_is_transitive(
            a in topic_strategy(),
            b in topic_strategy(),
            c in topic_strategy(),
        ) {
            let ab = &a / &b;
            let abc = &ab / &c;
            prop_assert!(a.prefix_of(&ab));
            prop_assert!(ab.prefix_of(&abc));
            prop_assert!(a.prefix_of(&abc));
        }

        #[test]
        fn filter_match_equals_exists_prefix(
            prefixes in prop::collection::vec(topic_strategy(), 0..6),
            topic in topic_strategy(),
        ) {
            let filter = Filter::from_topics(prefixes.clone());
            let expected = prefixes.iter().any(|p| p.prefix_of(&topic));
            prop_assert_eq!(filter.matches(&topic), expected);
        }
    }
}
