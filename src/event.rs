//! Named pattern classes. An [`EventMap`] registers `tag -> pattern`
//! pairs; waits resolve their [`PatternRef`]s against a snapshot of the
//! active map before any I/O, so unknown tags fail fast and later map
//! replacements cannot affect an in-flight wait.
use std::fmt;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diag;

/// Opaque, caller-defined identifier for a pattern class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTag(String);

impl EventTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid pattern /{pattern}/: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("unknown event tag: {0}")]
    UnknownTag(EventTag),
}

impl diag::DiagnosableError for PatternError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            PatternError::UnknownTag(_) => vec![
                "event tags resolve against the map installed with set_event_map".to_string(),
            ],
            _ => vec![],
        }
    }
}

/// A compiled regex and the named capture groups it exposes, in the
/// order they appear in the pattern.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    regex: Regex,
    capture_names: Vec<String>,
}

impl CompiledPattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let regex = Regex::new(pattern).map_err(|source| PatternError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self::from_regex(regex))
    }

    pub fn from_regex(regex: Regex) -> Self {
        let capture_names = regex
            .capture_names()
            .flatten()
            .map(|name| name.to_string())
            .collect();
        Self { regex, capture_names }
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    pub fn capture_names(&self) -> &[String] {
        &self.capture_names
    }
}

/// How a caller names a pattern: inline regex text, a pre-compiled
/// regex, or a tag registered in the event map.
#[derive(Debug, Clone)]
pub enum PatternRef {
    Raw(String),
    Compiled(Regex),
    Tagged(EventTag),
}

impl From<&str> for PatternRef {
    fn from(pattern: &str) -> Self {
        PatternRef::Raw(pattern.to_string())
    }
}

impl From<Regex> for PatternRef {
    fn from(regex: Regex) -> Self {
        PatternRef::Compiled(regex)
    }
}

impl From<EventTag> for PatternRef {
    fn from(tag: EventTag) -> Self {
        PatternRef::Tagged(tag)
    }
}

/// A [`PatternRef`] resolved against one event-map snapshot.
#[derive(Debug, Clone)]
pub struct ResolvedPattern {
    pub pattern: Arc<CompiledPattern>,
    pub tag: Option<EventTag>,
}

impl ResolvedPattern {
    /// Stable identity used for duplicate collapsing and for the
    /// `required_remaining` report: the tag name where one exists, the
    /// pattern text otherwise.
    pub fn label(&self) -> String {
        match &self.tag {
            Some(tag) => tag.to_string(),
            None => self.pattern.as_str().to_string(),
        }
    }
}

pub type EventMapSnapshot = Arc<IndexMap<EventTag, Arc<CompiledPattern>>>;

/// Copy-on-write registry of `EventTag -> CompiledPattern`. Replacing
/// the map swaps the inner [`Arc`]; snapshots held by in-flight waits
/// are unaffected.
#[derive(Default)]
pub struct EventMap {
    active: Mutex<EventMapSnapshot>,
}

impl EventMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles and installs a replacement map atomically.
    pub fn set<I, S>(&self, entries: I) -> Result<(), PatternError>
    where
        I: IntoIterator<Item = (EventTag, S)>,
        S: AsRef<str>,
    {
        let mut map = IndexMap::new();
        for (tag, pattern) in entries {
            map.insert(tag, Arc::new(CompiledPattern::new(pattern.as_ref())?));
        }
        *self.active.lock().unwrap() = Arc::new(map);
        Ok(())
    }

    pub fn snapshot(&self) -> EventMapSnapshot {
        self.active.lock().unwrap().clone()
    }

    pub fn resolve(&self, pattern: &PatternRef) -> Result<ResolvedPattern, PatternError> {
        resolve_in(&self.snapshot(), pattern)
    }
}

/// Resolves one reference against a snapshot. Raw text is compiled,
/// compiled regexes pass through, tags are looked up.
pub fn resolve_in(
    snapshot: &EventMapSnapshot,
    pattern: &PatternRef,
) -> Result<ResolvedPattern, PatternError> {
    match pattern {
        PatternRef::Raw(text) => Ok(ResolvedPattern {
            pattern: Arc::new(CompiledPattern::new(text)?),
            tag: None,
        }),
        PatternRef::Compiled(regex) => Ok(ResolvedPattern {
            pattern: Arc::new(CompiledPattern::from_regex(regex.clone())),
            tag: None,
        }),
        PatternRef::Tagged(tag) => match snapshot.get(tag) {
            Some(compiled) => Ok(ResolvedPattern {
                pattern: compiled.clone(),
                tag: Some(tag.clone()),
            }),
            None => Err(PatternError::UnknownTag(tag.clone())),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolves_all_reference_kinds() {
        let map = EventMap::new();
        map.set([(EventTag::from("boot"), r"Booting v(?P<version>\d+)")])
            .unwrap();

        let raw = map.resolve(&PatternRef::from(r"hello \d+")).unwrap();
        assert_eq!(raw.pattern.as_str(), r"hello \d+");
        assert!(raw.tag.is_none());

        let compiled = map
            .resolve(&PatternRef::from(Regex::new("world").unwrap()))
            .unwrap();
        assert_eq!(compiled.pattern.as_str(), "world");

        let tagged = map.resolve(&PatternRef::from(EventTag::from("boot"))).unwrap();
        assert_eq!(tagged.tag.as_ref().unwrap().as_str(), "boot");
        assert_eq!(tagged.pattern.capture_names(), ["version"]);
    }

    #[test]
    fn unknown_tag_fails() {
        let map = EventMap::new();
        let err = map
            .resolve(&PatternRef::from(EventTag::from("missing")))
            .unwrap_err();
        assert!(matches!(err, PatternError::UnknownTag(_)));
    }

    #[test]
    fn invalid_regex_fails() {
        let err = CompiledPattern::new("(unclosed").unwrap_err();
        assert!(matches!(err, PatternError::InvalidRegex { .. }));
    }

    #[test]
    fn replacing_the_map_does_not_affect_held_snapshots() {
        let map = EventMap::new();
        map.set([(EventTag::from("evt"), "old")]).unwrap();
        let snapshot = map.snapshot();
        map.set([(EventTag::from("evt"), "new")]).unwrap();

        let held = resolve_in(&snapshot, &PatternRef::from(EventTag::from("evt"))).unwrap();
        assert_eq!(held.pattern.as_str(), "old");
        let fresh = map.resolve(&PatternRef::from(EventTag::from("evt"))).unwrap();
        assert_eq!(fresh.pattern.as_str(), "new");
    }
}
