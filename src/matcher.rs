//! Stateless evaluation of one record against one resolved pattern.
use crate::event::{EventTag, ResolvedPattern};
use crate::record::TraceRecord;

use indexmap::IndexMap;
use serde::Serialize;

/// A record that matched a pattern, with any named captures copied out.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub record: TraceRecord,
    /// Source text of the pattern that matched.
    pub pattern: String,
    pub named_captures: IndexMap<String, String>,
    /// Set when the pattern was resolved from an event tag.
    pub event_tag: Option<EventTag>,
}

/// Whole-string search (not anchored). Pure and reentrant.
pub fn match_record(record: &TraceRecord, pattern: &ResolvedPattern) -> Option<MatchResult> {
    let captures = pattern.pattern.regex().captures(&record.text)?;
    let named_captures = pattern
        .pattern
        .capture_names()
        .iter()
        .filter_map(|name| {
            captures
                .name(name)
                .map(|m| (name.clone(), m.as_str().to_string()))
        })
        .collect();
    Some(MatchResult {
        record: record.clone(),
        pattern: pattern.pattern.as_str().to_string(),
        named_captures,
        event_tag: pattern.tag.clone(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::{EventMap, PatternRef};
    use crate::record::TraceSource;

    fn record(text: &str) -> TraceRecord {
        TraceRecord::new(text.to_string(), 0, TraceSource::Stdout)
    }

    fn resolve(pattern: &str) -> ResolvedPattern {
        EventMap::new().resolve(&PatternRef::from(pattern)).unwrap()
    }

    #[test]
    fn search_is_not_anchored() {
        let pattern = resolve(r"bar\d");
        assert!(match_record(&record("foo bar2 baz"), &pattern).is_some());
        assert!(match_record(&record("foo baz"), &pattern).is_none());
    }

    #[test]
    fn named_captures_are_copied() {
        let pattern = resolve(r"VERSION:\s*v?(?P<major>\d+)\.(?P<minor>\d+)\.(?P<patch>\d+)");
        let result = match_record(&record("VERSION:1.2.3"), &pattern).unwrap();
        assert_eq!(result.named_captures["major"], "1");
        assert_eq!(result.named_captures["minor"], "2");
        assert_eq!(result.named_captures["patch"], "3");
    }

    /// Re-applying a result's pattern to its record reproduces the same
    /// captures.
    #[test]
    fn captures_are_reproducible() {
        let pattern = resolve(r"addr=(?P<addr>[0-9a-f]+)");
        let first = match_record(&record("addr=beef"), &pattern).unwrap();
        let again = match_record(&first.record, &resolve(&first.pattern)).unwrap();
        assert_eq!(first.named_captures, again.named_captures);
    }

    #[test]
    fn unmatched_optional_groups_are_omitted() {
        let pattern = resolve(r"ok(?: code=(?P<code>\d+))?");
        let result = match_record(&record("ok"), &pattern).unwrap();
        assert!(result.named_captures.is_empty());
    }
}
