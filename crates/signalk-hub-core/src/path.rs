//! Signal K path parsing, resolution and matching.
//!
//! Paths are dot-separated strings like "vessels.self.navigation.speedOverGround".
//! This module provides:
//! - [`Path`]: a parsed path
//! - [`PathResolver`]: substitutes the `self` alias with the local vessel id
//! - [`PathPattern`]: glob-style matching for subscription filters
//!
//! Pattern matching uses simple segment matching; only the grammar check in
//! [`validate`] uses a regex.

use std::sync::OnceLock;

use regex::Regex;

use crate::model::{SELF, VESSELS};

/// A parsed Signal K path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    /// The original path string
    raw: String,
    /// Path segments split by '.', empty segments dropped
    segments: Vec<String>,
}

impl Path {
    /// Parse a path string into segments.
    pub fn new(path: &str) -> Self {
        Self {
            raw: path.to_string(),
            segments: path
                .split('.')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        }
    }

    /// Build a path from already split segments.
    pub fn from_segments<S: AsRef<str>>(segments: &[S]) -> Self {
        let segments: Vec<String> = segments
            .iter()
            .flat_map(|s| s.as_ref().split('.'))
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        Self {
            raw: segments.join("."),
            segments,
        }
    }

    /// Get the raw path string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Get the path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment, the local key of a leaf.
    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Everything but the last segment.
    pub fn parent(&self) -> Path {
        let n = self.segments.len().saturating_sub(1);
        Path::from_segments(&self.segments[..n])
    }

    /// Append a relative path.
    pub fn join(&self, rest: &str) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(rest.split('.').filter(|s| !s.is_empty()).map(String::from));
        Path::from_segments(&segments)
    }

    /// True if any segment is private (`_` prefixed).
    pub fn is_private(&self) -> bool {
        self.segments.iter().any(|s| is_private_segment(s))
    }

    /// Check if this path starts with a given prefix.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        if prefix.segments.len() > self.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(prefix.segments.iter())
            .all(|(a, b)| a == b)
    }

    /// Check if this path ends with the segments of `suffix`.
    pub fn ends_with(&self, suffix: &Path) -> bool {
        ends_with_segments(&self.segments, &suffix.segments)
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Path::new(s)
    }
}

impl From<String> for Path {
    fn from(s: String) -> Self {
        Path::new(&s)
    }
}

/// Segments beginning with `_` are hidden from safe projections.
pub fn is_private_segment(segment: &str) -> bool {
    segment.starts_with('_')
}

pub(crate) fn ends_with_segments<A: AsRef<str>, B: AsRef<str>>(path: &[A], suffix: &[B]) -> bool {
    if suffix.is_empty() || suffix.len() > path.len() {
        return false;
    }
    path[path.len() - suffix.len()..]
        .iter()
        .zip(suffix)
        .all(|(a, b)| a.as_ref() == b.as_ref())
}

/// Substitutes the `self` alias for the locally configured vessel id.
///
/// `self` is only an alias in the vessel-context position, i.e. directly
/// after a leading `vessels` segment. Anywhere else it is an ordinary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    self_id: String,
}

impl PathResolver {
    /// Create a resolver for the given vessel id.
    ///
    /// Accepts either the bare id ("urn:mrn:signalk:uuid:...") or the full
    /// context ("vessels.urn:mrn:signalk:uuid:...").
    pub fn new(self_id: &str) -> Self {
        let id = self_id
            .strip_prefix("vessels.")
            .unwrap_or(self_id)
            .to_string();
        Self { self_id: id }
    }

    /// The local vessel id, without the `vessels.` prefix.
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// The local vessel context, e.g. "vessels.urn:mrn:signalk:uuid:...".
    pub fn self_context(&self) -> String {
        format!("{}.{}", VESSELS, self.self_id)
    }

    /// Resolve an absolute path string.
    pub fn resolve(&self, path: &str) -> Path {
        self.resolve_path(Path::new(path))
    }

    /// Resolve a path given as separate (possibly dotted) segments.
    pub fn resolve_segments<S: AsRef<str>>(&self, segments: &[S]) -> Path {
        self.resolve_path(Path::from_segments(segments))
    }

    /// Map a vessel key found directly under `vessels` to the stored key.
    pub fn resolve_context_id<'a>(&'a self, id: &'a str) -> &'a str {
        if id == SELF {
            &self.self_id
        } else {
            id
        }
    }

    fn resolve_path(&self, mut path: Path) -> Path {
        let aliased = path.segments.len() > 1
            && path.segments[0] == VESSELS
            && path.segments[1] == SELF;
        if aliased {
            path.segments[1] = self.self_id.clone();
            path.raw = path.segments.join(".");
        }
        path
    }
}

/// Path grammar violations reported by [`validate`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PathError {
    #[error("Empty path")]
    Empty,

    #[error("Invalid segment {0:?}")]
    InvalidSegment(String),

    #[error("'self' is only valid as the vessel context, found at position {0}")]
    MisplacedSelf(usize),
}

fn segment_regex() -> &'static Regex {
    static SEGMENT: OnceLock<Regex> = OnceLock::new();
    SEGMENT.get_or_init(|| Regex::new(r"^[A-Za-z0-9_$:\-]+$").expect("segment regex"))
}

/// Check an absolute path against the path grammar.
///
/// Writes never require this (unknown paths are auto-created); it exists so
/// producers can be told their paths look wrong.
pub fn validate(path: &str) -> Result<(), PathError> {
    if path.trim().is_empty() {
        return Err(PathError::Empty);
    }
    for (i, segment) in path.split('.').enumerate() {
        if !segment_regex().is_match(segment) {
            return Err(PathError::InvalidSegment(segment.to_string()));
        }
        if segment == SELF && i != 1 {
            return Err(PathError::MisplacedSelf(i));
        }
    }
    Ok(())
}

/// A segment in a path pattern.
#[derive(Debug, Clone, PartialEq)]
enum PatternSegment {
    /// Exact literal match for this segment
    Literal(String),
    /// Single wildcard (*) - matches exactly one segment when mid-path,
    /// or any suffix when at the end
    Wildcard,
}

/// A subscription pattern that may contain wildcards.
///
/// Supported patterns:
/// - Exact: "navigation.speedOverGround"
/// - Prefix: "navigation" (matches the branch and everything below it)
/// - Suffix wildcard: "navigation.*"
/// - Mid-path wildcard: "propulsion.*.revolutions"
/// - Full wildcard: "*"
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<PatternSegment>,
    /// True if the pattern ends with a wildcard (matches any suffix)
    trailing_wildcard: bool,
}

impl PathPattern {
    /// Create a new path pattern.
    ///
    /// Pattern syntax:
    /// - `*` at end matches any suffix (e.g., "navigation.*" matches "navigation.position.latitude")
    /// - `*` in middle matches exactly one segment (e.g., "propulsion.*.revolutions")
    /// - `*` alone matches any path
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let raw = pattern.to_string();
        let parts: Vec<&str> = pattern.split('.').collect();

        if parts.is_empty() || (parts.len() == 1 && parts[0].is_empty()) {
            return Err(PatternError::EmptyPattern);
        }
        if let Some(empty) = parts.iter().position(|p| p.is_empty()) {
            return Err(PatternError::EmptySegment(empty));
        }

        let trailing_wildcard = parts.last() == Some(&"*");

        let segments: Vec<PatternSegment> = parts
            .iter()
            .map(|&s| {
                if s == "*" {
                    PatternSegment::Wildcard
                } else {
                    PatternSegment::Literal(s.to_string())
                }
            })
            .collect();

        Ok(Self {
            raw,
            segments,
            trailing_wildcard,
        })
    }

    /// Check if a path matches this pattern exactly (wildcards honoured).
    pub fn matches(&self, path: &str) -> bool {
        let path_parts: Vec<&str> = path.split('.').collect();

        // Special case: single wildcard matches everything
        if self.segments.len() == 1 && self.segments[0] == PatternSegment::Wildcard {
            return true;
        }

        // If trailing wildcard, path must have at least (pattern_len - 1) segments
        // If no trailing wildcard, path must have exactly pattern_len segments
        if self.trailing_wildcard {
            if path_parts.len() < self.segments.len() - 1 {
                return false;
            }
        } else if path_parts.len() != self.segments.len() {
            return false;
        }

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                PatternSegment::Literal(lit) => {
                    if i >= path_parts.len() || path_parts[i] != lit {
                        return false;
                    }
                }
                PatternSegment::Wildcard => {
                    // Trailing wildcard matches any remaining suffix
                    if self.trailing_wildcard && i == self.segments.len() - 1 {
                        return true;
                    }
                    // Mid-path wildcard must have a corresponding non-empty segment
                    if i >= path_parts.len() || path_parts[i].is_empty() {
                        return false;
                    }
                }
            }
        }

        true
    }

    /// Like [`matches`](Self::matches), but a pattern naming a branch also
    /// covers every leaf below it ("navigation" covers "navigation.position").
    pub fn covers(&self, path: &str) -> bool {
        if self.matches(path) {
            return true;
        }
        if self.trailing_wildcard {
            return false;
        }
        let path_parts: Vec<&str> = path.split('.').collect();
        if path_parts.len() <= self.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(path_parts.iter())
            .all(|(seg, part)| match seg {
                PatternSegment::Literal(lit) => lit == part,
                PatternSegment::Wildcard => !part.is_empty(),
            })
    }

    /// Get the raw pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Errors that can occur when creating a path pattern.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatternError {
    #[error("Empty pattern")]
    EmptyPattern,

    #[error("Empty segment at position {0}")]
    EmptySegment(usize),
}
