//! Room and element identities.
//!
//! A [`RoomId`] names a namespace of shared documents and one awareness set.
//! By default it is derived from the page path, so every page gets its own
//! room; pages that want to share elements pass the same explicit room.
//!
//! An [`ElementId`] names one shared element inside a room. Explicit ids are
//! preferred. Elements without one fall back to an [`ElementPath`], a
//! structural selector computed from the element's position in the tree.
//! Two different elements that resolve to the same selector silently share
//! state, so anything meant to be durable should carry an explicit id.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a room or element identifier, in characters.
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// Errors produced while parsing room and element identities.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier is longer than {MAX_IDENTIFIER_LEN} characters")]
    TooLong,

    #[error("identifier contains whitespace or control characters: {0:?}")]
    InvalidCharacters(String),

    #[error("element path has no segments")]
    EmptyPath,

    #[error("invalid element path segment: {0:?}")]
    InvalidSegment(String),
}

fn validate(raw: &str) -> Result<(), IdentityError> {
    if raw.is_empty() {
        return Err(IdentityError::Empty);
    }
    if raw.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(IdentityError::TooLong);
    }
    if raw.chars().any(|c| c.is_control()) {
        return Err(IdentityError::InvalidCharacters(raw.to_string()));
    }
    Ok(())
}

/// A room namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Parses an explicit room name.
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdentityError> {
        let raw = raw.into();
        validate(&raw)?;
        if raw.chars().any(char::is_whitespace) {
            return Err(IdentityError::InvalidCharacters(raw));
        }
        Ok(Self(raw))
    }

    /// Derives the default room for a page from its path.
    ///
    /// `/blog/post/`, `/blog/post/index.html` and `/blog/post.html` all map
    /// to `/blog/post`. The site root maps to `/`. Query strings and
    /// fragments are ignored.
    pub fn from_page(path: &str) -> Result<Self, IdentityError> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let mut normalized = path.trim().to_string();
        if !normalized.starts_with('/') {
            normalized.insert(0, '/');
        }
        if let Some(stripped) = normalized.strip_suffix("index.html") {
            normalized = stripped.to_string();
        } else if let Some(stripped) = normalized.strip_suffix(".html") {
            normalized = stripped.to_string();
        }
        while normalized.len() > 1 && normalized.ends_with('/') {
            normalized.pop();
        }
        Self::parse(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RoomId> for String {
    fn from(room: RoomId) -> Self {
        room.0
    }
}

/// Identity of a shared element within a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ElementId(String);

impl ElementId {
    /// Parses an explicit, application-assigned element id.
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdentityError> {
        let raw = raw.into();
        validate(&raw)?;
        if raw.chars().any(char::is_whitespace) {
            return Err(IdentityError::InvalidCharacters(raw));
        }
        Ok(Self(raw))
    }

    /// Builds the structural fallback identity for an element without an id.
    pub fn from_path(path: &ElementPath) -> Result<Self, IdentityError> {
        let selector = path.selector()?;
        validate(&selector)?;
        Ok(Self(selector))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ElementId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        // Selector fallbacks contain spaces around `>`, so only the shared
        // checks apply when deserializing.
        validate(&value)?;
        Ok(Self(value))
    }
}

impl From<ElementId> for String {
    fn from(id: ElementId) -> Self {
        id.0
    }
}

/// One step of a structural path: a tag name and its 1-based position
/// among siblings with the same tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathSegment {
    pub tag: String,
    pub nth_of_type: usize,
}

impl PathSegment {
    pub fn new(tag: impl Into<String>, nth_of_type: usize) -> Self {
        Self {
            tag: tag.into(),
            nth_of_type,
        }
    }
}

/// Structural position of an element, listed from the outermost ancestor
/// down to the element itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ElementPath {
    segments: Vec<PathSegment>,
}

impl ElementPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a child step.
    pub fn child(mut self, tag: impl Into<String>, nth_of_type: usize) -> Self {
        self.segments.push(PathSegment::new(tag, nth_of_type));
        self
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Renders the path as `tag:nth-of-type(n) > tag:nth-of-type(m) ...`.
    ///
    /// Tags are lowercased so that the same markup yields the same selector
    /// regardless of how a host reports tag names.
    pub fn selector(&self) -> Result<String, IdentityError> {
        if self.segments.is_empty() {
            return Err(IdentityError::EmptyPath);
        }

        let mut parts = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            let tag = segment.tag.trim().to_ascii_lowercase();
            if tag.is_empty()
                || segment.nth_of_type == 0
                || !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                return Err(IdentityError::InvalidSegment(format!(
                    "{}:{}",
                    segment.tag, segment.nth_of_type
                )));
            }
            parts.push(format!("{}:nth-of-type({})", tag, segment.nth_of_type));
        }

        Ok(parts.join(" > "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_from_page_normalizes() {
        assert_eq!(RoomId::from_page("/blog/post/").unwrap().as_str(), "/blog/post");
        assert_eq!(
            RoomId::from_page("/blog/post/index.html").unwrap().as_str(),
            "/blog/post"
        );
        assert_eq!(RoomId::from_page("/blog/post.html").unwrap().as_str(), "/blog/post");
        assert_eq!(RoomId::from_page("blog?x=1#top").unwrap().as_str(), "/blog");
        assert_eq!(RoomId::from_page("/").unwrap().as_str(), "/");
        assert_eq!(RoomId::from_page("/index.html").unwrap().as_str(), "/");
    }

    #[test]
    fn test_room_parse_rejects_invalid() {
        assert_eq!(RoomId::parse(""), Err(IdentityError::Empty));
        assert!(matches!(
            RoomId::parse("my room"),
            Err(IdentityError::InvalidCharacters(_))
        ));
        assert_eq!(RoomId::parse("x".repeat(300)), Err(IdentityError::TooLong));
        assert!(RoomId::parse("shared-across-sites").is_ok());
    }

    #[test]
    fn test_element_id_parse() {
        assert_eq!(ElementId::parse("counter").unwrap().as_str(), "counter");
        assert!(ElementId::parse("").is_err());
        assert!(ElementId::parse("has space").is_err());
        assert!(ElementId::parse("tab\there").is_err());
    }

    #[test]
    fn test_selector_is_stable() {
        let path = ElementPath::new()
            .child("BODY", 1)
            .child("main", 1)
            .child("div", 3);

        let first = ElementId::from_path(&path).unwrap();
        let second = ElementId::from_path(&path.clone()).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.as_str(),
            "body:nth-of-type(1) > main:nth-of-type(1) > div:nth-of-type(3)"
        );
    }

    #[test]
    fn test_selector_rejects_bad_segments() {
        assert_eq!(
            ElementPath::new().selector(),
            Err(IdentityError::EmptyPath)
        );
        assert!(ElementPath::new().child("div", 0).selector().is_err());
        assert!(ElementPath::new().child("di v", 1).selector().is_err());
    }

    #[test]
    fn test_serde_roundtrip_keeps_selector() {
        let path = ElementPath::new().child("div", 2).child("span", 1);
        let id = ElementId::from_path(&path).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        let back: ElementId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
