//! Resource selector parsing
//!
//! The host addresses every entity with a dot-separated path of `type[name]`
//! segments, e.g. `dataContext[mammals].collection[animals].caseByIndex[3]`.
//! The last segment names the kind of resource being addressed.
//!
//! Parsing never fails: a segment that does not look like `type[name]` is
//! treated as a bare type name. Names containing `[`, `]` or `.` cannot be
//! represented, so callers that build selectors from user-provided names
//! should check [`is_representable`] first.
//!
//! # Example
//!
//! ```
//! use codap_stacker::selector::ResourceSelector;
//!
//! let sel = ResourceSelector::parse("dataContext[abc].collection[def].case");
//! assert_eq!(sel.get("dataContext"), Some("abc"));
//! assert_eq!(sel.get("collection"), Some("def"));
//! assert_eq!(sel.kind(), "case");
//!
//! let built = ResourceSelector::root("dataContext", "abc")
//!     .child("collection", "def")
//!     .leaf("case");
//! assert_eq!(built.to_string(), "dataContext[abc].collection[def].case");
//! ```

use std::collections::BTreeMap;
use std::fmt;

/// One `type[name]` (or bare `type`) segment of a selector
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment {
    /// Resource kind, e.g. `dataContext`
    pub kind: String,
    /// Resource name, absent for bare segments such as `case`
    pub name: Option<String>,
}

impl Segment {
    /// A named segment, `kind[name]`
    pub fn named(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: Some(name.into()),
        }
    }

    /// A bare segment, `kind`
    pub fn bare(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
        }
    }

    /// `kind[name]` where kind is `[A-Za-z0-9_-]+` and name is non-empty
    fn parse(text: &str) -> Self {
        let named = text
            .strip_suffix(']')
            .and_then(|body| body.split_once('['))
            .filter(|(kind, name)| {
                !kind.is_empty()
                    && kind
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                    && !name.is_empty()
                    && !name.contains(['[', ']'])
            });
        match named {
            Some((kind, name)) => Segment::named(kind, name),
            None => Segment::bare(text),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}[{}]", self.kind, name),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// A parsed resource selector
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ResourceSelector {
    segments: Vec<Segment>,
}

impl ResourceSelector {
    /// Parse a selector string, left to right.
    pub fn parse(selector: &str) -> Self {
        Self {
            segments: selector.split('.').map(Segment::parse).collect(),
        }
    }

    /// Start a selector with a named segment
    pub fn root(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::named(kind, name)],
        }
    }

    /// Start a selector with a bare segment, e.g. `interactiveFrame`
    pub fn bare(kind: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::bare(kind)],
        }
    }

    /// Append a named segment
    #[must_use]
    pub fn child(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.segments.push(Segment::named(kind, name));
        self
    }

    /// Append a bare segment
    #[must_use]
    pub fn leaf(mut self, kind: impl Into<String>) -> Self {
        self.segments.push(Segment::bare(kind));
        self
    }

    /// The kind of the last segment; empty for an empty selector
    pub fn kind(&self) -> &str {
        self.segments.last().map(|s| s.kind.as_str()).unwrap_or("")
    }

    /// Name recorded for a segment kind. A later segment of the same kind wins.
    pub fn get(&self, kind: &str) -> Option<&str> {
        self.segments
            .iter()
            .rev()
            .find(|s| s.kind == kind && s.name.is_some())
            .and_then(|s| s.name.as_deref())
    }

    /// The segments in order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Flat `kind -> name` mapping plus a `type` entry for the last segment
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for segment in &self.segments {
            if let Some(name) = &segment.name {
                map.insert(segment.kind.clone(), name.clone());
            }
        }
        map.insert("type".to_string(), self.kind().to_string());
        map
    }
}

impl fmt::Display for ResourceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

impl From<&str> for ResourceSelector {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<ResourceSelector> for String {
    fn from(sel: ResourceSelector) -> Self {
        sel.to_string()
    }
}

/// True if `name` can appear inside `[...]` and survive a parse round trip
pub fn is_representable(name: &str) -> bool {
    !name.is_empty() && !name.contains(['[', ']', '.'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_selector() {
        let sel = ResourceSelector::parse("dataContext[abc].collection[def].case");
        assert_eq!(sel.get("dataContext"), Some("abc"));
        assert_eq!(sel.get("collection"), Some("def"));
        assert_eq!(sel.kind(), "case");

        let map = sel.to_map();
        assert_eq!(map.len(), 3);
        assert_eq!(map["type"], "case");
    }

    #[test]
    fn test_parse_bare_selector() {
        let sel = ResourceSelector::parse("interactiveFrame");
        assert_eq!(sel.kind(), "interactiveFrame");
        assert_eq!(sel.to_map().len(), 1);
        assert_eq!(sel.get("interactiveFrame"), None);
    }

    #[test]
    fn test_last_named_segment_sets_type() {
        let sel = ResourceSelector::parse("dataContext[abc].caseByIndex[4]");
        assert_eq!(sel.kind(), "caseByIndex");
        assert_eq!(sel.get("caseByIndex"), Some("4"));
    }

    #[test]
    fn test_malformed_segments_are_bare() {
        let sel = ResourceSelector::parse("dataContext[].collection[x");
        assert_eq!(sel.segments()[0], Segment::bare("dataContext[]"));
        assert_eq!(sel.kind(), "collection[x");
        assert_eq!(sel.get("collection"), None);
    }

    #[test]
    fn test_segment_must_be_whole_kind_and_name() {
        // Text before the kind, or brackets inside the name, leave the
        // segment bare rather than picking out a partial match
        let sel = ResourceSelector::parse("x y[z]");
        assert_eq!(sel.segments()[0], Segment::bare("x y[z]"));
        assert_eq!(sel.get("y"), None);

        let sel = ResourceSelector::parse("dataContext[a[b]");
        assert_eq!(sel.kind(), "dataContext[a[b]");
        assert_eq!(sel.get("dataContext"), None);

        let sel = ResourceSelector::parse("case-2_b[7]");
        assert_eq!(sel.get("case-2_b"), Some("7"));
    }

    #[test]
    fn test_empty_selector() {
        let sel = ResourceSelector::parse("");
        assert_eq!(sel.kind(), "");
        assert_eq!(sel.to_string(), "");
    }

    #[test]
    fn test_repeated_kind_last_wins() {
        let sel = ResourceSelector::parse("collection[a].collection[b].case");
        assert_eq!(sel.get("collection"), Some("b"));
    }

    #[test]
    fn test_builder_matches_parse() {
        let built = ResourceSelector::root("dataContext", "mammals")
            .child("collection", "animals")
            .child("caseByIndex", "0");
        assert_eq!(
            built,
            ResourceSelector::parse("dataContext[mammals].collection[animals].caseByIndex[0]")
        );
    }

    #[test]
    fn test_is_representable() {
        assert!(is_representable("mammals"));
        assert!(is_representable("my data"));
        assert!(!is_representable(""));
        assert!(!is_representable("a.b"));
        assert!(!is_representable("a[0]"));
    }

    // Property-based tests using proptest
    use proptest::prelude::*;

    fn kind_strategy() -> impl Strategy<Value = String> {
        "[A-Za-z][A-Za-z0-9_]{0,12}"
    }

    fn name_strategy() -> impl Strategy<Value = String> {
        "[A-Za-z0-9 _-]{1,12}"
    }

    proptest! {
        #[test]
        fn test_two_level_selector_parses(
            a in kind_strategy(),
            b in name_strategy(),
            c in kind_strategy(),
            d in name_strategy(),
            e in kind_strategy(),
        ) {
            prop_assume!(a != c);
            let text = format!("{}[{}].{}[{}].{}", a, b, c, d, e);
            let sel = ResourceSelector::parse(&text);
            prop_assert_eq!(sel.get(&a), Some(b.as_str()));
            prop_assert_eq!(sel.get(&c), Some(d.as_str()));
            prop_assert_eq!(sel.kind(), e.as_str());
        }

        #[test]
        fn test_generated_selector_round_trips(
            parts in prop::collection::vec(
                (kind_strategy(), prop::option::of(name_strategy())),
                1..6,
            )
        ) {
            let sel = ResourceSelector {
                segments: parts
                    .iter()
                    .map(|(kind, name)| match name {
                        Some(name) => Segment::named(kind.clone(), name.clone()),
                        None => Segment::bare(kind.clone()),
                    })
                    .collect(),
            };

            let reparsed = ResourceSelector::parse(&sel.to_string());
            prop_assert_eq!(&reparsed, &sel);
            prop_assert_eq!(reparsed.to_string(), sel.to_string());
        }
    }
}
