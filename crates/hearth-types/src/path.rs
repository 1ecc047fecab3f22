//! Logical (UI-visible) paths.
//!
//! A [`LogicalPath`] is an absolute, slash-separated, normalized path such as
//! `/Home/Documents/report.pdf`. Normalization is pure string algebra: `.` is
//! dropped, `..` pops a segment (never above `/`), repeated and trailing
//! slashes collapse. A validated path therefore never contains `..`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Normalize a POSIX path string without touching the filesystem.
///
/// Absolute inputs stay absolute and cannot climb above `/`. The result has
/// no trailing slash except for the root itself.
pub fn normalize_posix(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            s => segments.push(s),
        }
    }

    let joined = segments.join("/");
    match (absolute, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// An absolute, normalized logical path.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogicalPath(String);

impl LogicalPath {
    /// Validate and normalize an untrusted path string.
    ///
    /// Fails with [`ErrorCode::PathNotAbsolute`] for relative input.
    pub fn parse(raw: &str) -> Result<Self, ErrorCode> {
        if !raw.starts_with('/') {
            return Err(ErrorCode::PathNotAbsolute);
        }
        if raw.contains('\0') {
            return Err(ErrorCode::InvalidPath);
        }
        Ok(Self(normalize_posix(raw)))
    }

    /// The root path `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path segments, excluding the empty root segment.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Number of segments (`/` has depth 0, `/Home` has depth 1).
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// The top-level base directory, e.g. `/Home` for `/Home/a/b`.
    pub fn base(&self) -> Option<LogicalPath> {
        self.segments().next().map(|s| Self(format!("/{s}")))
    }

    /// Final segment, or `None` for `/`.
    pub fn file_name(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Containing directory; `/` is its own parent.
    pub fn parent(&self) -> LogicalPath {
        match self.0.rfind('/') {
            Some(0) | None => Self::root(),
            Some(idx) => Self(self.0[..idx].to_string()),
        }
    }

    /// Append a single file name. Names containing `/` or equal to `.`/`..`
    /// are rejected with [`ErrorCode::InvalidFilename`].
    pub fn join(&self, name: &str) -> Result<LogicalPath, ErrorCode> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(ErrorCode::InvalidFilename);
        }
        if self.is_root() {
            Ok(Self(format!("/{name}")))
        } else {
            Ok(Self(format!("{}/{name}", self.0)))
        }
    }

    /// Append a relative suffix (may contain several segments).
    pub fn join_relative(&self, suffix: &str) -> LogicalPath {
        Self(normalize_posix(&format!("{}/{}", self.0, suffix)))
    }

    /// True if `self` equals `prefix` or lies beneath it on a segment boundary.
    pub fn starts_with(&self, prefix: &LogicalPath) -> bool {
        if prefix.is_root() {
            return true;
        }
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
    }

    /// The part of `self` after `prefix` (starting with `/`, or empty when
    /// equal). `None` when `prefix` is not an ancestor.
    pub fn strip_prefix(&self, prefix: &LogicalPath) -> Option<&str> {
        if !self.starts_with(prefix) {
            return None;
        }
        if prefix.is_root() {
            return Some(if self.is_root() { "" } else { &self.0 });
        }
        Some(&self.0[prefix.0.len()..])
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalPath({:?})", self.0)
    }
}

impl TryFrom<String> for LogicalPath {
    type Error = ErrorCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for LogicalPath {
    type Error = ErrorCode;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<LogicalPath> for String {
    fn from(path: LogicalPath) -> Self {
        path.0
    }
}

impl AsRef<str> for LogicalPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lp(s: &str) -> LogicalPath {
        LogicalPath::parse(s).unwrap()
    }

    #[test]
    fn normalizes_traversal() {
        assert_eq!(lp("/Home/../../etc/passwd").as_str(), "/etc/passwd");
        assert_eq!(lp("/Home//Documents/./a/").as_str(), "/Home/Documents/a");
        assert_eq!(lp("/..").as_str(), "/");
        assert_eq!(normalize_posix("a/../../b"), "../b");
    }

    #[test]
    fn rejects_relative() {
        assert_eq!(LogicalPath::parse("Home/x"), Err(ErrorCode::PathNotAbsolute));
        assert_eq!(LogicalPath::parse(""), Err(ErrorCode::PathNotAbsolute));
    }

    #[test]
    fn parent_and_name() {
        let p = lp("/Home/Documents/report.pdf");
        assert_eq!(p.file_name(), Some("report.pdf"));
        assert_eq!(p.parent(), lp("/Home/Documents"));
        assert_eq!(lp("/Home").parent(), LogicalPath::root());
        assert_eq!(p.base(), Some(lp("/Home")));
        assert_eq!(p.depth(), 3);
    }

    #[test]
    fn prefix_is_segment_aware() {
        let home = lp("/Home");
        assert!(lp("/Home/a").starts_with(&home));
        assert!(lp("/Home").starts_with(&home));
        assert!(!lp("/Homework").starts_with(&home));
        assert_eq!(lp("/Home/a/b").strip_prefix(&home), Some("/a/b"));
        assert_eq!(lp("/Home").strip_prefix(&home), Some(""));
    }

    #[test]
    fn join_rejects_separators() {
        let home = lp("/Home");
        assert_eq!(home.join("a.txt").unwrap(), lp("/Home/a.txt"));
        assert_eq!(home.join("a/b"), Err(ErrorCode::InvalidFilename));
        assert_eq!(home.join(".."), Err(ErrorCode::InvalidFilename));
        assert_eq!(LogicalPath::root().join("Home").unwrap(), home);
    }

    #[test]
    fn serde_validates() {
        let p: LogicalPath = serde_json::from_str("\"/Home/./x\"").unwrap();
        assert_eq!(p.as_str(), "/Home/x");
        assert!(serde_json::from_str::<LogicalPath>("\"relative\"").is_err());
    }
}
