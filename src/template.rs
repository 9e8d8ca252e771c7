//! Path template parsing and request-path matching.
//!
//! A template such as `/v1/{parent=*}/items/{item.id}` compiles into an
//! ordered list of typed segments. The compiled form is used twice: at build
//! time to resolve variables against the request message and detect duplicate
//! routes, and at request time to match concrete paths.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Kind of a single path template segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// Fixed text that must match exactly
    Literal,
    /// `{field.path}` - binds exactly one path segment
    Selector,
    /// `*` - matches exactly one path segment without binding it
    Wildcard,
    /// `{field.path=*}` - binds all remaining path segments
    CatchAll,
}

/// One compiled segment of a [`PathTemplate`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Literal text, or the dotted field path for variables; empty for wildcards
    pub value: String,
}

impl Segment {
    fn literal(value: &str) -> Self {
        Self {
            kind: SegmentKind::Literal,
            value: value.to_string(),
        }
    }

    /// Whether this segment binds a field of the request message
    pub fn is_variable(&self) -> bool {
        matches!(self.kind, SegmentKind::Selector | SegmentKind::CatchAll)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SegmentKind::Literal => f.write_str(&self.value),
            SegmentKind::Selector => write!(f, "{{{}}}", self.value),
            SegmentKind::Wildcard => f.write_str("*"),
            SegmentKind::CatchAll => write!(f, "{{{}=*}}", self.value),
        }
    }
}

/// Compiled URL path template
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathTemplate {
    segments: Vec<Segment>,
}

impl PathTemplate {
    /// Parse a template string. The string must start with `/`; empty
    /// components (duplicate or trailing slashes) are ignored.
    pub fn parse(path: &str) -> Result<Self> {
        if !path.starts_with('/') {
            return Err(Error::Template {
                path: path.to_string(),
                segment: path.to_string(),
            });
        }

        let mut segments: Vec<Segment> = Vec::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if segments
                .last()
                .is_some_and(|s| s.kind == SegmentKind::CatchAll)
            {
                // a catch-all consumes the rest of the path
                return Err(Error::Template {
                    path: path.to_string(),
                    segment: component.to_string(),
                });
            }

            let segment = parse_segment(component).ok_or_else(|| Error::Template {
                path: path.to_string(),
                segment: component.to_string(),
            })?;
            segments.push(segment);
        }

        Ok(Self { segments })
    }

    /// The compiled segments in order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Variable segments (selectors and catch-alls) in order
    pub fn variables(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.is_variable())
    }

    /// True if any segment binds a request field
    pub fn has_variables(&self) -> bool {
        self.segments.iter().any(Segment::is_variable)
    }

    /// Canonical form with variable names erased. Two templates with the
    /// same pattern match exactly the same set of paths.
    pub fn pattern(&self) -> String {
        if self.segments.is_empty() {
            return "/".to_string();
        }

        let mut out = String::new();
        for segment in &self.segments {
            out.push('/');
            match segment.kind {
                SegmentKind::Literal => out.push_str(&segment.value),
                SegmentKind::Selector => out.push('?'),
                SegmentKind::Wildcard => out.push('*'),
                SegmentKind::CatchAll => out.push_str("**"),
            }
        }
        out
    }

    /// Match already-split, percent-decoded path segments.
    ///
    /// Returns the captured value of every variable segment in template
    /// order, or `None` when the path does not fit the template.
    pub fn match_segments(&self, parts: &[String]) -> Option<Vec<String>> {
        let mut captures = Vec::new();
        let mut idx = 0;

        for segment in &self.segments {
            match segment.kind {
                SegmentKind::CatchAll => {
                    if idx >= parts.len() {
                        return None;
                    }
                    captures.push(parts[idx..].join("/"));
                    idx = parts.len();
                }
                kind => {
                    let part = parts.get(idx)?;
                    match kind {
                        SegmentKind::Literal if part != &segment.value => return None,
                        SegmentKind::Selector => captures.push(part.clone()),
                        _ => {}
                    }
                    idx += 1;
                }
            }
        }

        (idx == parts.len()).then_some(captures)
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for PathTemplate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn parse_segment(component: &str) -> Option<Segment> {
    if component == "*" {
        return Some(Segment {
            kind: SegmentKind::Wildcard,
            value: String::new(),
        });
    }

    if let Some(inner) = component
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
    {
        let (name, kind) = match inner.strip_suffix("=*") {
            Some(name) => (name, SegmentKind::CatchAll),
            None => (inner, SegmentKind::Selector),
        };
        if !is_field_path(name) {
            return None;
        }
        return Some(Segment {
            kind,
            value: name.to_string(),
        });
    }

    component
        .chars()
        .all(is_literal_char)
        .then(|| Segment::literal(component))
}

/// `word(.word)*`
fn is_field_path(name: &str) -> bool {
    !name.is_empty()
        && name
            .split('.')
            .all(|word| !word.is_empty() && word.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

/// RFC 3986 unreserved and sub-delimiter characters plus `:`, `@` and
/// percent escapes. `*`, `{` and `}` are reserved for the template grammar.
fn is_literal_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '-' | '.' | '_' | '~' | '!' | '$' | '&' | '\'' | '(' | ')' | '+' | ',' | ';' | '='
                | ':' | '@' | '%'
        )
}
