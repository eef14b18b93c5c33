//! Topic grammar, wildcard patterns, and the hierarchical topic tree.
//!
//! Topics are slash-separated, case-sensitive paths of non-empty segments
//! (`sensor/temperature/room1`); the empty string names the root.
//! Patterns extend the grammar with `*` (exactly one segment) and a
//! trailing `**` (one or more remaining segments).
//!
//! The tree is built lazily as publishers and subscribers reference new
//! paths. Structure is guarded by per-node reader/writer locks on the
//! child maps; each node's subscription list has its own mutex, so
//! deliveries on unrelated topics never contend. Nodes are not reclaimed
//! when their subscription lists empty — bounded memory comes from the
//! bus's topic cap.

use crate::bus::Subscription;
use crate::error::BusError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

pub(crate) const TOPIC_SEPARATOR: char = '/';
pub(crate) const WILDCARD_SINGLE: &str = "*";
pub(crate) const WILDCARD_MULTI: &str = "**";

/// Validates a concrete (wildcard-free) topic path.
///
/// The empty string is valid and names the root.
pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    if topic.is_empty() {
        return Ok(());
    }
    for segment in topic.split(TOPIC_SEPARATOR) {
        if segment.is_empty() {
            return Err(BusError::InvalidArgument(format!(
                "topic {topic:?} contains an empty segment"
            )));
        }
        if segment == WILDCARD_SINGLE || segment == WILDCARD_MULTI {
            return Err(BusError::InvalidArgument(format!(
                "topic {topic:?} contains a wildcard; use a pattern subscription"
            )));
        }
    }
    Ok(())
}

/// Splits a validated topic into segments; the root has none.
pub(crate) fn split_topic(topic: &str) -> impl Iterator<Item = &str> {
    topic.split(TOPIC_SEPARATOR).filter(|s| !s.is_empty())
}

/// One pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    /// `*` — exactly one segment.
    AnyOne,
    /// `**` — one or more remaining segments, final position only.
    AnyRest,
}

/// A parsed wildcard subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    source: String,
    segments: Vec<PatternSegment>,
}

impl TopicPattern {
    /// Parses and validates a pattern.
    pub fn parse(pattern: &str) -> Result<Self, BusError> {
        if pattern.is_empty() {
            return Err(BusError::InvalidArgument("empty pattern".into()));
        }

        let raw: Vec<&str> = pattern.split(TOPIC_SEPARATOR).collect();
        let mut segments = Vec::with_capacity(raw.len());
        for (i, segment) in raw.iter().enumerate() {
            match *segment {
                "" => {
                    return Err(BusError::InvalidArgument(format!(
                        "pattern {pattern:?} contains an empty segment"
                    )));
                }
                WILDCARD_MULTI => {
                    if i + 1 != raw.len() {
                        return Err(BusError::InvalidArgument(format!(
                            "pattern {pattern:?}: '**' is only valid as the final segment"
                        )));
                    }
                    segments.push(PatternSegment::AnyRest);
                }
                WILDCARD_SINGLE => segments.push(PatternSegment::AnyOne),
                literal => segments.push(PatternSegment::Literal(literal.to_owned())),
            }
        }

        Ok(Self {
            source: pattern.to_owned(),
            segments,
        })
    }

    /// The pattern text as given to [`TopicPattern::parse`].
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Tests a concrete topic against the pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let topic_segments: Vec<&str> = split_topic(topic).collect();
        let mut ti = 0;

        for (pi, segment) in self.segments.iter().enumerate() {
            match segment {
                PatternSegment::Literal(literal) => {
                    if ti >= topic_segments.len() || topic_segments[ti] != literal {
                        return false;
                    }
                    ti += 1;
                }
                PatternSegment::AnyOne => {
                    if ti >= topic_segments.len() {
                        return false;
                    }
                    ti += 1;
                }
                PatternSegment::AnyRest => {
                    // Consumes one or more remaining segments.
                    debug_assert_eq!(pi + 1, self.segments.len());
                    return ti < topic_segments.len();
                }
            }
        }

        ti == topic_segments.len()
    }
}

/// One node of the topic hierarchy.
pub(crate) struct TopicNode {
    pub(crate) name: String,
    pub(crate) subscriptions: Mutex<Vec<Arc<Subscription>>>,
    pub(crate) children: RwLock<HashMap<String, Arc<TopicNode>>>,
}

impl TopicNode {
    pub(crate) fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            subscriptions: Mutex::new(Vec::new()),
            children: RwLock::new(HashMap::new()),
        })
    }

    /// Walks to the node for the given path segments without creating
    /// anything.
    pub(crate) fn find<'a>(
        self: &Arc<Self>,
        segments: impl IntoIterator<Item = &'a str>,
    ) -> Option<Arc<TopicNode>> {
        let mut node = Arc::clone(self);
        for segment in segments {
            let next = node.children.read().unwrap().get(segment).cloned()?;
            node = next;
        }
        Some(node)
    }

    /// Walks to the node for the given path segments, creating missing
    /// children.
    ///
    /// Returns the node and the number of nodes created along the way.
    pub(crate) fn find_or_create<'a>(
        self: &Arc<Self>,
        segments: impl IntoIterator<Item = &'a str>,
    ) -> (Arc<TopicNode>, usize) {
        let mut node = Arc::clone(self);
        let mut created = 0;

        for segment in segments {
            let existing = node.children.read().unwrap().get(segment).cloned();
            let next = match existing {
                Some(child) => child,
                None => {
                    let mut children = node.children.write().unwrap();
                    // Re-check under the write lock: another thread may
                    // have inserted the child between the two locks.
                    match children.get(segment) {
                        Some(child) => Arc::clone(child),
                        None => {
                            let child = TopicNode::new(segment);
                            children.insert(segment.to_owned(), Arc::clone(&child));
                            created += 1;
                            child
                        }
                    }
                }
            };
            node = next;
        }

        (node, created)
    }

    /// Appends the full topic paths of this subtree to `out`.
    pub(crate) fn collect_topics(&self, prefix: &str, out: &mut Vec<String>) {
        let children = self.children.read().unwrap();
        for (segment, child) in children.iter() {
            let path = if prefix.is_empty() {
                segment.clone()
            } else {
                format!("{prefix}{TOPIC_SEPARATOR}{segment}")
            };
            out.push(path.clone());
            child.collect_topics(&path, out);
        }
    }
}

impl std::fmt::Debug for TopicNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicNode")
            .field("name", &self.name)
            .field(
                "subscriptions",
                &self.subscriptions.lock().unwrap().len(),
            )
            .field("children", &self.children.read().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_validation() {
        assert!(validate_topic("").is_ok());
        assert!(validate_topic("a").is_ok());
        assert!(validate_topic("sensor/temperature/room1").is_ok());

        assert!(validate_topic("/a").is_err());
        assert!(validate_topic("a/").is_err());
        assert!(validate_topic("a//b").is_err());
        assert!(validate_topic("a/*").is_err());
        assert!(validate_topic("a/**").is_err());
    }

    #[test]
    fn pattern_validation() {
        assert!(TopicPattern::parse("a/*/c").is_ok());
        assert!(TopicPattern::parse("*/*").is_ok());
        assert!(TopicPattern::parse("a/**").is_ok());
        assert!(TopicPattern::parse("**").is_ok());

        assert!(TopicPattern::parse("").is_err());
        assert!(TopicPattern::parse("a//b").is_err());
        assert!(TopicPattern::parse("a/**/c").is_err());
        assert!(TopicPattern::parse("**/a").is_err());
    }

    #[test]
    fn single_wildcard_matches_one_segment() {
        let p = TopicPattern::parse("a/*").unwrap();
        assert!(p.matches("a/b"));
        assert!(!p.matches("a"));
        assert!(!p.matches("a/b/c"));
        assert!(!p.matches("x/b"));
    }

    #[test]
    fn multi_wildcard_matches_one_or_more() {
        let p = TopicPattern::parse("a/**").unwrap();
        assert!(p.matches("a/b"));
        assert!(p.matches("a/b/c"));
        assert!(!p.matches("a"));
        assert!(!p.matches("b/c"));
    }

    #[test]
    fn interior_wildcard() {
        let p = TopicPattern::parse("a/*/c").unwrap();
        assert!(p.matches("a/b/c"));
        assert!(!p.matches("a/c"));
        assert!(!p.matches("a/b/d"));
        assert!(!p.matches("a/b/c/d"));
    }

    #[test]
    fn multiple_single_wildcards() {
        let p = TopicPattern::parse("*/temperature/*").unwrap();
        assert!(p.matches("sensor/temperature/room1"));
        assert!(p.matches("probe/temperature/lab"));
        assert!(!p.matches("sensor/humidity/room1"));
    }

    #[test]
    fn literal_pattern_is_exact() {
        let p = TopicPattern::parse("a/b").unwrap();
        assert!(p.matches("a/b"));
        assert!(!p.matches("a"));
        assert!(!p.matches("a/b/c"));
    }

    #[test]
    fn case_sensitive() {
        let p = TopicPattern::parse("Sensor/*").unwrap();
        assert!(p.matches("Sensor/x"));
        assert!(!p.matches("sensor/x"));
    }

    #[test]
    fn tree_creates_lazily_and_finds() {
        let root = TopicNode::new(String::new());
        let (node, created) = root.find_or_create(split_topic("a/b/c"));
        assert_eq!(node.name, "c");
        assert_eq!(created, 3);

        // Second walk creates nothing.
        let (again, created) = root.find_or_create(split_topic("a/b/c"));
        assert_eq!(created, 0);
        assert!(Arc::ptr_eq(&node, &again));

        assert!(root.find(split_topic("a/b")).is_some());
        assert!(root.find(split_topic("a/x")).is_none());

        let mut topics = Vec::new();
        root.collect_topics("", &mut topics);
        topics.sort();
        assert_eq!(topics, vec!["a", "a/b", "a/b/c"]);
    }

    #[test]
    fn root_topic_resolves_to_root() {
        let root = TopicNode::new(String::new());
        let (node, created) = root.find_or_create(split_topic(""));
        assert_eq!(created, 0);
        assert!(Arc::ptr_eq(&root, &node));
    }
}
