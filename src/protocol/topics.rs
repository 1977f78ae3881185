//! Topic templating and localisation for device-scoped wire topics
//!
//! Abstract topics are `/`-separated levels where a level written as `{name}`
//! is a variable resolved against a [`TopicContext`]. Rendering produces the
//! broker-visible wire topic; [`localize`] maps a received wire topic back to
//! the name the application subscribed with.

use crate::config::GatewayConfiguration;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Context variable holding the account name
pub const ACCOUNT_NAME: &str = "account-name";
/// Context variable holding the client identifier
pub const CLIENT_ID: &str = "client-id";
/// First level of every control topic
pub const CONTROL_PREFIX: &str = "$EDC";

/// Topic templating errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("Unresolved topic variable: {0}")]
    UnresolvedVariable(String),
    #[error("Invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// One level of an abstract topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicSegment {
    Literal(String),
    Variable(String),
}

/// Abstract topic pattern, rendered into a wire topic with a [`TopicContext`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Topic {
    segments: Vec<TopicSegment>,
}

impl Topic {
    pub fn new(segments: Vec<TopicSegment>) -> Self {
        Self { segments }
    }

    /// Parse a pattern such as `$EDC/{account-name}/{client-id}/cmd/#`.
    ///
    /// Only whole levels can be variables; a brace anywhere else is rejected.
    /// The empty pattern is the empty topic.
    pub fn parse(pattern: &str) -> Result<Self, TopicError> {
        if pattern.is_empty() {
            return Ok(Self::default());
        }

        let invalid = |reason: &str| TopicError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        for level in pattern.split('/') {
            match level
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
            {
                Some(name) if name.is_empty() => return Err(invalid("empty variable name")),
                Some(name) if name.contains(['{', '}']) => {
                    return Err(invalid("nested braces in variable"))
                }
                Some(name) => segments.push(TopicSegment::Variable(name.to_string())),
                None if level.contains(['{', '}']) => {
                    return Err(invalid("variables must span a whole level"))
                }
                None => segments.push(TopicSegment::Literal(level.to_string())),
            }
        }

        Ok(Self { segments })
    }

    /// `$EDC/{account-name}/{client-id}`
    pub fn control_base() -> Self {
        Self::new(vec![
            TopicSegment::Literal(CONTROL_PREFIX.to_string()),
            TopicSegment::Variable(ACCOUNT_NAME.to_string()),
            TopicSegment::Variable(CLIENT_ID.to_string()),
        ])
    }

    /// `{account-name}/{client-id}`
    pub fn data_base() -> Self {
        Self::new(vec![
            TopicSegment::Variable(ACCOUNT_NAME.to_string()),
            TopicSegment::Variable(CLIENT_ID.to_string()),
        ])
    }

    /// Control topic of this device: `$EDC/{account-name}/{client-id}/<suffix>`
    pub fn control(suffix: &str) -> Result<Self, TopicError> {
        Ok(Self::control_base().join(&Self::parse(suffix)?))
    }

    /// Data topic of this device: `{account-name}/{client-id}/<suffix>`
    pub fn data(suffix: &str) -> Result<Self, TopicError> {
        Ok(Self::data_base().join(&Self::parse(suffix)?))
    }

    pub fn literal(mut self, level: impl Into<String>) -> Self {
        self.segments.push(TopicSegment::Literal(level.into()));
        self
    }

    pub fn variable(mut self, name: impl Into<String>) -> Self {
        self.segments.push(TopicSegment::Variable(name.into()));
        self
    }

    pub fn join(mut self, other: &Topic) -> Self {
        self.segments.extend(other.segments.iter().cloned());
        self
    }

    pub fn segments(&self) -> &[TopicSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Names of all variables in this pattern, in order
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            TopicSegment::Variable(name) => Some(name.as_str()),
            TopicSegment::Literal(_) => None,
        })
    }

    /// Substitute every variable level from `context`.
    pub fn render(&self, context: &TopicContext) -> Result<String, TopicError> {
        let mut levels = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                TopicSegment::Literal(level) => levels.push(level.as_str()),
                TopicSegment::Variable(name) => levels.push(
                    context
                        .get(name)
                        .ok_or_else(|| TopicError::UnresolvedVariable(name.clone()))?,
                ),
            }
        }
        Ok(levels.join("/"))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, segment) in self.segments.iter().enumerate() {
            if index > 0 {
                f.write_str("/")?;
            }
            match segment {
                TopicSegment::Literal(level) => f.write_str(level)?,
                TopicSegment::Variable(name) => write!(f, "{{{name}}}")?,
            }
        }
        Ok(())
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Variable bindings used to render topics for one device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicContext {
    values: BTreeMap<String, String>,
}

impl TopicContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `account-name` and `client-id` from the gateway identity
    pub fn from_configuration(configuration: &GatewayConfiguration) -> Self {
        Self::new()
            .with(ACCOUNT_NAME, configuration.account_name())
            .with(CLIENT_ID, configuration.client_id())
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for TopicContext
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Strip `base` and the following separator from `wire`.
///
/// A wire topic outside `base` is returned unchanged rather than rejected,
/// and an empty base leaves every topic unchanged.
pub fn localize<'a>(base: &str, wire: &'a str) -> &'a str {
    if base.is_empty() {
        return wire;
    }
    match wire.strip_prefix(base) {
        Some("") => "",
        Some(rest) => rest.strip_prefix('/').unwrap_or(wire),
        None => wire,
    }
}

/// Inverse of [`localize`]: prefix `local` with `base`.
pub fn qualify(base: &str, local: &str) -> String {
    match (base.is_empty(), local.is_empty()) {
        (true, _) => local.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{base}/{local}"),
    }
}

/// MQTT topic-filter matching with `+` and `#` wildcards.
///
/// Wildcards in the first level never match topics starting with `$`.
pub fn matches_filter(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
