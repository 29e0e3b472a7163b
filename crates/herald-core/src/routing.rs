//! Recipient tags and the routing predicate.
//!
//! Every connection is tagged with a recipient at handshake time. A
//! broadcast names a [`RoutingTarget`], which is either the wildcard or a
//! named recipient compared case-insensitively against connection tags.

use crate::error::RouterError;
use serde::Serialize;
use std::fmt;

/// Maximum recipient tag length in bytes.
pub const MAX_TAG_LENGTH: usize = 256;

/// The literal target token that addresses every connection.
///
/// A recipient literally named `all` can never be addressed on its own.
pub const WILDCARD: &str = "all";

/// Validate a recipient tag.
///
/// # Errors
///
/// Returns an error message if the tag is invalid.
pub fn validate_tag(tag: &str) -> Result<(), &'static str> {
    if tag.is_empty() {
        return Err("Recipient tag cannot be empty");
    }
    if tag.len() > MAX_TAG_LENGTH {
        return Err("Recipient tag too long");
    }
    if tag.chars().any(char::is_control) {
        return Err("Recipient tag contains control characters");
    }
    Ok(())
}

/// The addressing key a connection was opened with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RecipientTag(String);

impl RecipientTag {
    /// Create a validated recipient tag.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::InvalidTag`] if the tag is empty, too long or
    /// contains control characters.
    pub fn new(tag: impl Into<String>) -> Result<Self, RouterError> {
        let tag = tag.into();
        validate_tag(&tag).map_err(RouterError::InvalidTag)?;
        Ok(Self(tag))
    }

    /// Get the tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this tag is the wildcard token.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD
    }
}

impl fmt::Display for RecipientTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RecipientTag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Who a broadcast is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingTarget {
    /// Every open connection.
    All,
    /// Connections whose tag equals the name, ignoring case.
    Named(String),
}

impl RoutingTarget {
    /// Parse a target, treating the exact token `all` as the wildcard.
    #[must_use]
    pub fn parse(target: &str) -> Self {
        if target == WILDCARD {
            Self::All
        } else {
            Self::Named(target.to_string())
        }
    }

    /// The target a connection with the given tag broadcasts to.
    #[must_use]
    pub fn for_tag(tag: &RecipientTag) -> Self {
        Self::parse(tag.as_str())
    }

    /// Check whether a connection tag is addressed by this target.
    #[must_use]
    pub fn matches(&self, tag: &str) -> bool {
        matches(self, tag)
    }
}

impl fmt::Display for RoutingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str(WILDCARD),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl From<&str> for RoutingTarget {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<&RecipientTag> for RoutingTarget {
    fn from(tag: &RecipientTag) -> Self {
        Self::for_tag(tag)
    }
}

/// The routing predicate: does `target` address a connection tagged `tag`?
#[must_use]
pub fn matches(target: &RoutingTarget, tag: &str) -> bool {
    match target {
        RoutingTarget::All => true,
        RoutingTarget::Named(name) => eq_ignore_case(name, tag),
    }
}

/// Case-insensitive comparison, one character at a time.
///
/// Characters are equal if they are identical, share a single-character
/// uppercase form, or their uppercase forms share a lowercase form.
fn eq_ignore_case(a: &str, b: &str) -> bool {
    if a.eq_ignore_ascii_case(b) {
        return true;
    }
    a.chars().count() == b.chars().count()
        && a.chars().zip(b.chars()).all(|(x, y)| chars_eq_ignore_case(x, y))
}

fn chars_eq_ignore_case(a: char, b: char) -> bool {
    if a == b {
        return true;
    }
    let (ua, ub) = (simple_uppercase(a), simple_uppercase(b));
    ua == ub || simple_lowercase(ua) == simple_lowercase(ub)
}

// Multi-character uppercase mappings (e.g. ß -> SS) have no simple form.
fn simple_uppercase(c: char) -> char {
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) => u,
        _ => c,
    }
}

// The only multi-character lowercase mapping is İ -> i + combining dot.
fn simple_lowercase(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matches_every_tag() {
        for tag in ["adam", "Anna", "BEN", "all", "ünïcode", " spaced "] {
            assert!(matches(&RoutingTarget::All, tag));
        }
    }

    #[test]
    fn test_named_matches_ignoring_case() {
        let target = RoutingTarget::parse("adam");
        assert!(target.matches("adam"));
        assert!(target.matches("ADAM"));
        assert!(target.matches("AdAm"));
        assert!(!target.matches("anna"));
        assert!(!target.matches("adamant"));
        assert!(!target.matches(""));
    }

    #[test]
    fn test_named_matches_non_ascii_case() {
        let target = RoutingTarget::parse("ÉMILE");
        assert!(target.matches("émile"));
        assert!(!target.matches("emile"));

        // Final sigma and dotted capital I compare per character.
        assert!(RoutingTarget::parse("ΟΔΥΣΣΕΥΣ").matches("οδυσσευς"));
        assert!(RoutingTarget::parse("οδυσσευς").matches("ΟΔΥΣΣΕΥΣ"));
        assert!(RoutingTarget::parse("İ").matches("i"));

        // No multi-character expansion: ß is not "ss" or "s".
        assert!(!RoutingTarget::parse("straße").matches("strasse"));
        assert!(!RoutingTarget::parse("ß").matches("s"));
        assert!(RoutingTarget::parse("ẞ").matches("ß"));
    }

    #[test]
    fn test_parse_wildcard_token() {
        assert_eq!(RoutingTarget::parse("all"), RoutingTarget::All);
        // Only the exact lowercase token is the wildcard.
        assert_eq!(
            RoutingTarget::parse("ALL"),
            RoutingTarget::Named("ALL".to_string())
        );
        assert!(!RoutingTarget::parse("ALL").matches("adam"));
        assert!(RoutingTarget::parse("ALL").matches("all"));
    }

    #[test]
    fn test_target_for_tag() {
        let all = RecipientTag::new("all").unwrap();
        assert!(all.is_wildcard());
        assert_eq!(RoutingTarget::for_tag(&all), RoutingTarget::All);

        let ben = RecipientTag::new("Ben").unwrap();
        assert!(!ben.is_wildcard());
        assert_eq!(
            RoutingTarget::from(&ben),
            RoutingTarget::Named("Ben".to_string())
        );
        assert_eq!(RoutingTarget::from(&ben).to_string(), "Ben");
    }

    #[test]
    fn test_tag_validation() {
        assert!(RecipientTag::new("adam").is_ok());
        assert!(RecipientTag::new("team:ops").is_ok());
        assert!(matches!(
            RecipientTag::new(""),
            Err(RouterError::InvalidTag(_))
        ));
        assert!(RecipientTag::new("bad\ntag").is_err());

        let long_tag = "a".repeat(MAX_TAG_LENGTH + 1);
        assert!(RecipientTag::new(long_tag).is_err());
    }
}
