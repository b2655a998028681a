//! Route matching logic.
//!
//! # Design Decisions
//! - Path matching is case-sensitive
//! - A prefix matches only at a path-segment boundary, so `/api/v1/user`
//!   never captures `/api/v1/users`
//! - No regex to guarantee O(n) matching

/// Segment-aligned path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    /// Create a new path prefix matcher.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns true if `path` starts with the prefix and the prefix ends on a
    /// segment boundary of `path`.
    pub fn matches(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix(self.prefix.as_str()) else {
            return false;
        };
        // A trailing slash on the prefix already closes the segment.
        rest.is_empty() || rest.starts_with('/') || self.prefix.ends_with('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_matcher() {
        let matcher = PathPrefixMatcher::new("/api/v1/user");

        assert!(matcher.matches("/api/v1/user"));
        assert!(matcher.matches("/api/v1/user/"));
        assert!(matcher.matches("/api/v1/user/123"));
        assert!(!matcher.matches("/api/v1/users"));
        assert!(!matcher.matches("/api/v1/users2"));
        assert!(!matcher.matches("/api/v1"));
        assert!(!matcher.matches("/API/v1/user"));
    }

    #[test]
    fn trailing_slash_prefix_accepts_any_continuation() {
        let matcher = PathPrefixMatcher::new("/static/");
        assert!(matcher.matches("/static/app.js"));
        assert!(!matcher.matches("/static"));

        let root = PathPrefixMatcher::new("/");
        assert!(root.matches("/"));
        assert!(root.matches("/anything/at/all"));
    }
}
