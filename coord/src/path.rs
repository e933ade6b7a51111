use crate::error::{Error, Result};
use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};
use std::iter::FromIterator;

/// Separator between serialized segments.
pub const SEPARATOR: char = '/';
/// Alternate separator accepted when parsing.
pub const ALT_SEPARATOR: char = '\\';

const ESCAPE: char = '%';
const ESCAPED_SEPARATOR: char = 's';
const ESCAPED_ALT_SEPARATOR: char = 'b';

fn escape_segment_into(out: &mut String, segment: &str) {
    for c in segment.chars() {
        match c {
            ESCAPE => {
                out.push(ESCAPE);
                out.push(ESCAPE);
            }
            SEPARATOR => {
                out.push(ESCAPE);
                out.push(ESCAPED_SEPARATOR);
            }
            ALT_SEPARATOR => {
                out.push(ESCAPE);
                out.push(ESCAPED_ALT_SEPARATOR);
            }
            c => out.push(c),
        }
    }
}

/// Escapes a single segment so that its serialized form contains no raw
/// separator.
pub fn escape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    escape_segment_into(&mut out, segment);
    out
}

/// Parses a single escaped segment back into its value.
pub fn unescape_segment(raw: &str) -> Result<String> {
    if raw.is_empty() {
        return Err(Error::MalformedPath("empty segment".into()));
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some(ESCAPE) => out.push(ESCAPE),
                Some(ESCAPED_SEPARATOR) => out.push(SEPARATOR),
                Some(ESCAPED_ALT_SEPARATOR) => out.push(ALT_SEPARATOR),
                Some(other) => {
                    return Err(Error::MalformedPath(format!(
                        "invalid escape sequence `{}{}`",
                        ESCAPE, other
                    )))
                }
                None => {
                    return Err(Error::MalformedPath("unterminated escape sequence".into()))
                }
            },
            SEPARATOR | ALT_SEPARATOR => {
                return Err(Error::MalformedPath(format!(
                    "raw separator `{}` inside segment",
                    c
                )))
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

/// An owned hierarchical path. The root is the empty sequence of segments.
///
/// Segment values are arbitrary non-empty strings; separators occurring in a
/// value are escaped on serialization, so the escaped form of a path is
/// unambiguous and `parse` is the left inverse of [`PathBuf::escaped`].
#[derive(
    Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, Deserialize, Serialize,
)]
#[archive_attr(derive(Debug, CheckBytes))]
#[repr(C)]
pub struct PathBuf {
    segments: Vec<String>,
}

impl PathBuf {
    /// Returns the root path.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a serialized path. The root parses from the empty string or a
    /// bare separator; every other path is a separator-prefixed sequence of
    /// escaped segments.
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Ok(Self::root());
        }
        let mut chars = input.chars();
        match chars.next() {
            Some(SEPARATOR) | Some(ALT_SEPARATOR) => {}
            _ => {
                return Err(Error::MalformedPath(format!(
                    "path `{}` does not start with a separator",
                    input
                )))
            }
        }
        let rest = &input[1..];
        if rest.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for raw in rest.split(|c| c == SEPARATOR || c == ALT_SEPARATOR) {
            segments.push(unescape_segment(raw)?);
        }
        Ok(Self { segments })
    }

    /// Appends a segment.
    pub fn push(&mut self, segment: impl Into<String>) -> Result<()> {
        let segment = segment.into();
        if segment.is_empty() {
            return Err(Error::MalformedPath("empty segment".into()));
        }
        self.segments.push(segment);
        Ok(())
    }

    /// Returns the path extended by one segment.
    pub fn append(mut self, segment: impl Into<String>) -> Result<Self> {
        self.push(segment)?;
        Ok(self)
    }

    /// Removes and returns the last segment.
    pub fn pop(&mut self) -> Option<String> {
        self.segments.pop()
    }

    /// Returns a borrowed path.
    pub fn as_path(&self) -> Path<'_> {
        Path(&self.segments)
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Path<'_>> {
        self.as_path().parent()
    }

    /// Returns the last segment, or `None` for the root.
    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Serializes the path; the root serializes to the empty string.
    pub fn escaped(&self) -> String {
        self.as_path().escaped()
    }
}

impl FromIterator<String> for PathBuf {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            segments: iter.into_iter().collect(),
        }
    }
}

impl std::str::FromStr for PathBuf {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Debug for PathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.as_path().fmt(f)
    }
}

impl std::fmt::Display for PathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_path())
    }
}

/// A borrowed path.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Path<'a>(&'a [String]);

impl<'a> Path<'a> {
    /// Borrows a path directly from a segment slice.
    pub fn new(segments: &'a [String]) -> Self {
        Self(segments)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the path without the last segment, or `None` for the root.
    pub fn parent(&self) -> Option<Path<'a>> {
        match self.0.len() {
            0 => None,
            n => Some(Path(&self.0[..n - 1])),
        }
    }

    /// Returns the last segment, or `None` for the root.
    pub fn last_segment(&self) -> Option<&'a str> {
        self.0.last().map(|s| s.as_str())
    }

    /// Returns true if `other` starts with `self`. Every path is an ancestor
    /// of itself.
    pub fn is_ancestor_of(&self, other: Path) -> bool {
        other.0.starts_with(self.0)
    }

    /// Iterates over `self`, its parent, and so on up to the root.
    pub fn ancestors(&self) -> impl Iterator<Item = Path<'a>> {
        let segments = self.0;
        (0..=segments.len())
            .rev()
            .map(move |n| Path(&segments[..n]))
    }

    pub fn segments(&self) -> &'a [String] {
        self.0
    }

    /// Returns an owned `PathBuf`.
    pub fn to_owned(&self) -> PathBuf {
        PathBuf {
            segments: self.0.to_vec(),
        }
    }

    /// Serializes the path; the root serializes to the empty string.
    pub fn escaped(&self) -> String {
        let mut out = String::new();
        for segment in self.0 {
            out.push(SEPARATOR);
            escape_segment_into(&mut out, segment);
        }
        out
    }
}

impl<'a> std::fmt::Debug for Path<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_root() {
            write!(f, "{}", SEPARATOR)
        } else {
            write!(f, "{}", self.escaped())
        }
    }
}

impl<'a> std::fmt::Display for Path<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::arb_path;
    use proptest::prelude::*;

    fn path(s: &str) -> PathBuf {
        PathBuf::parse(s).unwrap()
    }

    #[test]
    fn parse_and_escape() {
        assert!(path("").is_root());
        assert!(path("/").is_root());
        let p = path("/a/b/c");
        assert_eq!(p.segments(), ["a", "b", "c"]);
        assert_eq!(p.escaped(), "/a/b/c");
        assert_eq!(path("\\a\\b"), path("/a/b"));
    }

    #[test]
    fn reserved_characters_round_trip() {
        let p = PathBuf::root()
            .append("a/b")
            .unwrap()
            .append("c\\d")
            .unwrap()
            .append("e%f")
            .unwrap();
        assert_eq!(p.escaped(), "/a%sb/c%bd/e%%f");
        assert_eq!(PathBuf::parse(&p.escaped()).unwrap(), p);
    }

    #[test]
    fn malformed() {
        assert!(matches!(
            PathBuf::parse("a/b"),
            Err(Error::MalformedPath(_))
        ));
        assert!(matches!(PathBuf::parse("//a"), Err(Error::MalformedPath(_))));
        assert!(matches!(PathBuf::parse("/a/"), Err(Error::MalformedPath(_))));
        assert!(matches!(
            PathBuf::parse("/a%"),
            Err(Error::MalformedPath(_))
        ));
        assert!(matches!(
            PathBuf::parse("/a%x"),
            Err(Error::MalformedPath(_))
        ));
        assert!(matches!(
            unescape_segment("a/b"),
            Err(Error::MalformedPath(_))
        ));
    }

    #[test]
    fn parent_and_append() {
        let p = path("/a/b/c");
        let parent = p.parent().unwrap();
        assert_eq!(parent, path("/a/b").as_path());
        assert_eq!(p.last_segment(), Some("c"));
        assert_eq!(parent.to_owned().append("c").unwrap(), p);
        assert!(PathBuf::root().parent().is_none());
        assert!(PathBuf::root().append("").is_err());
    }

    #[test]
    fn ancestors() {
        let p = path("/a/b");
        let all: Vec<_> = p.as_path().ancestors().map(|a| a.to_owned()).collect();
        assert_eq!(all, vec![path("/a/b"), path("/a"), PathBuf::root()]);
    }

    #[test]
    fn ordering_is_over_segments() {
        assert!(path("/a") < path("/a/b"));
        assert!(path("/a/b") < path("/b"));
        // `%` sorts before `a` in the escaped form but the order is over the
        // unescaped values, where `/` (0x2f) sorts before `a` as well.
        assert!(path("/a").as_path() < PathBuf::root().append("a/b").unwrap().as_path());
    }

    proptest! {
        #[test]
        fn prop_segment_round_trip(segment in crate::props::arb_segment()) {
            prop_assert_eq!(unescape_segment(&escape_segment(&segment)).unwrap(), segment);
        }

        #[test]
        fn prop_escape_never_produces_separator(segment in crate::props::arb_segment()) {
            let escaped = escape_segment(&segment);
            prop_assert!(!escaped.contains(SEPARATOR));
            prop_assert!(!escaped.contains(ALT_SEPARATOR));
        }

        #[test]
        fn prop_path_round_trip(p in arb_path()) {
            prop_assert_eq!(PathBuf::parse(&p.escaped()).unwrap(), p);
        }
    }
}
