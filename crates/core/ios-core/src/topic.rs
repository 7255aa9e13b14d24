//! MQTT-style topic matching.
//!
//! Topics are `/`-delimited strings. A pattern may contain two wildcard
//! segments:
//!
//! - `+` matches exactly one topic segment
//! - `#` matches the remainder of the topic, including an empty remainder,
//!   and is only legal as the final segment
//!
//! Matching is a single left-to-right pass with no backtracking. Exact
//! equality short-circuits, and a pattern with no wildcard characters never
//! matches anything other than itself.
//!
//! ```rust
//! use ios_core::topic::matches;
//!
//! assert!(matches("ios/v1/vision/camera/result", "ios/v1/vision/+/result"));
//! assert!(matches("ios/v1/vision/camera/result", "ios/#"));
//! assert!(!matches("ios/v1/vision/camera/result", "ios/v1/+/result"));
//! ```

use crate::{IosError, IosResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Segment separator
pub const SEPARATOR: char = '/';

/// Matches exactly one segment
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Matches the remainder of the topic
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Check whether a concrete `topic` is matched by `pattern`.
///
/// `matches("a", "a/#")` is `true`: the multi-level wildcard accepts an
/// empty remainder.
#[must_use]
pub fn matches(topic: &str, pattern: &str) -> bool {
    if topic == pattern {
        return true;
    }
    if !is_wildcard(pattern) {
        return false;
    }

    let mut topic_parts = topic.split(SEPARATOR);
    for pattern_part in pattern.split(SEPARATOR) {
        match pattern_part {
            MULTI_LEVEL_WILDCARD => return true,
            SINGLE_LEVEL_WILDCARD => {
                if topic_parts.next().is_none() {
                    return false;
                }
            }
            literal => match topic_parts.next() {
                Some(topic_part) if topic_part == literal => {}
                _ => return false,
            },
        }
    }

    // pattern exhausted: only a match if the topic is too
    topic_parts.next().is_none()
}

/// True when the pattern contains a wildcard character anywhere.
#[must_use]
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.contains('+') || pattern.contains('#')
}

/// Validate a subscription or registration pattern.
///
/// Rejects empty patterns, wildcard characters that do not occupy a whole
/// segment (`a/b+`), and `#` anywhere but the final segment.
pub fn validate_pattern(pattern: &str) -> IosResult<()> {
    if pattern.is_empty() {
        return Err(IosError::topic("Empty topic pattern"));
    }

    let segments: Vec<&str> = pattern.split(SEPARATOR).collect();
    let last = segments.len() - 1;

    for (i, segment) in segments.iter().enumerate() {
        let has_wildcard = segment.contains('+') || segment.contains('#');
        if has_wildcard && *segment != SINGLE_LEVEL_WILDCARD && *segment != MULTI_LEVEL_WILDCARD {
            return Err(IosError::topic(format!(
                "Wildcard must occupy a whole segment (segment {i} of '{pattern}')"
            )));
        }
        if *segment == MULTI_LEVEL_WILDCARD && i != last {
            return Err(IosError::topic(format!(
                "Multi-level wildcard '#' must be at the end of pattern '{pattern}'"
            )));
        }
    }

    Ok(())
}

/// Validate a concrete topic used for publishing: no wildcards, not empty.
pub fn validate_topic(topic: &str) -> IosResult<()> {
    if topic.is_empty() {
        return Err(IosError::topic("Empty topic"));
    }
    if is_wildcard(topic) {
        return Err(IosError::topic(format!(
            "Wildcards are not allowed in a publish topic: '{topic}'"
        )));
    }
    Ok(())
}

/// A validated topic pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicPattern {
    raw: String,
    wildcard: bool,
}

impl TopicPattern {
    /// Parse and validate a pattern
    pub fn parse(pattern: &str) -> IosResult<Self> {
        validate_pattern(pattern)?;
        Ok(Self {
            raw: pattern.to_string(),
            wildcard: is_wildcard(pattern),
        })
    }

    /// The pattern text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether this pattern contains `+` or `#`
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// Check whether `topic` is matched by this pattern
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        if self.wildcard {
            matches(topic, &self.raw)
        } else {
            self.raw == topic
        }
    }
}

impl FromStr for TopicPattern {
    type Err = IosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TopicPattern {
    type Error = IosError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TopicPattern> for String {
    fn from(pattern: TopicPattern) -> Self {
        pattern.raw
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
