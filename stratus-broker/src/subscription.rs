use std::fmt;
use std::str::FromStr;

use crate::proto;
use crate::Error;

/// A granted subscription: the parsed filter plus the maximum QoS the
/// broker will use when delivering on it.
#[derive(Clone, Debug, PartialEq)]
pub struct Subscription {
    filter: TopicFilter,
    max_qos: proto::QoS,
}

impl Subscription {
    pub fn new(filter: TopicFilter, max_qos: proto::QoS) -> Self {
        Self { filter, max_qos }
    }

    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    pub fn max_qos(&self) -> &proto::QoS {
        &self.max_qos
    }
}

/// A validated topic filter.
///
/// Segments are stored as written, wildcards included; validation happens
/// once at parse time so matching can assume a well-formed filter.
#[derive(Clone, Debug, PartialEq)]
pub struct TopicFilter {
    segments: Vec<String>,
}

impl TopicFilter {
    /// Walks the topic level by level against the filter.
    ///
    /// `#` swallows all remaining levels (including none), `+` consumes
    /// exactly one level (which may be the empty string), and anything else
    /// must equal the level verbatim. A match requires both the filter and
    /// the topic to be fully consumed, except for a trailing `#`.
    pub fn matches(&self, topic: &str) -> bool {
        // Topics under `$` (system topics) are never visible to filters
        // that lead with a wildcard.
        if topic.starts_with('$') && matches!(self.segments[0].as_str(), "+" | "#") {
            return false;
        }

        let mut levels = topic.split('/');

        for segment in &self.segments {
            match segment.as_str() {
                "#" => return true,
                "+" => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                literal => match levels.next() {
                    Some(level) if level == literal => (),
                    _ => return false,
                },
            }
        }

        levels.next().is_none()
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl FromStr for TopicFilter {
    type Err = Error;

    /// Validates the filter rules enforced on SUBSCRIBE: non-empty, no NUL
    /// characters, `#` only as the final segment, and wildcards only as
    /// whole segments (`foo+bar` is invalid).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains('\0') {
            return Err(Error::InvalidTopicFilter(s.to_owned()));
        }

        let segments: Vec<String> = s.split('/').map(str::to_owned).collect();
        let last = segments.len() - 1;

        for (index, segment) in segments.iter().enumerate() {
            match segment.as_str() {
                "#" if index != last => {
                    return Err(Error::InvalidTopicFilter(s.to_owned()));
                }
                "#" | "+" => (),
                other if other.contains('#') || other.contains('+') => {
                    return Err(Error::InvalidTopicFilter(s.to_owned()));
                }
                _ => (),
            }
        }

        Ok(TopicFilter { segments })
    }
}
