//! Actor Identifiers
//!
//! An actor identifier (AID) has the form `bare[/resource]`. The bare part
//! names a logical role ("pong"); the optional resource disambiguates
//! instances of that role ("pong/7f3a…"). Two identifiers are equal only
//! when both parts match; bare-equality ignores the resource and is what
//! routing uses to group interchangeable instances.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors produced when parsing or qualifying an actor identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AidError {
    /// The bare part of the identifier is empty.
    #[error("actor id has an empty bare part")]
    EmptyBare,

    /// A resource separator was present but the resource itself is empty.
    #[error("actor id '{0}' has an empty resource")]
    EmptyResource(String),

    /// Attempted to attach a resource to an id that already carries one.
    #[error("actor id '{0}' already carries a resource")]
    AlreadyQualified(String),
}

/// Actor identifier, `bare[/resource]`.
///
/// The first `/` separates bare from resource; the resource may itself
/// contain further slashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId {
    bare: String,
    resource: Option<String>,
}

impl ActorId {
    /// Parse an identifier, validating both parts.
    pub fn parse(s: &str) -> Result<Self, AidError> {
        match s.split_once('/') {
            None => {
                if s.is_empty() {
                    return Err(AidError::EmptyBare);
                }
                Ok(Self {
                    bare: s.to_string(),
                    resource: None,
                })
            }
            Some((bare, resource)) => {
                if bare.is_empty() {
                    return Err(AidError::EmptyBare);
                }
                if resource.is_empty() {
                    return Err(AidError::EmptyResource(s.to_string()));
                }
                Ok(Self {
                    bare: bare.to_string(),
                    resource: Some(resource.to_string()),
                })
            }
        }
    }

    /// The logical role part.
    pub fn bare(&self) -> &str {
        &self.bare
    }

    /// The instance disambiguator, if any.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// True when no resource is attached.
    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// Equality on the bare part only.
    pub fn bare_eq(&self, other: &ActorId) -> bool {
        self.bare == other.bare
    }

    /// Attach a resource to a bare identifier.
    pub fn qualified(&self, resource: &str) -> Result<ActorId, AidError> {
        if self.resource.is_some() {
            return Err(AidError::AlreadyQualified(self.to_string()));
        }
        if resource.is_empty() {
            return Err(AidError::EmptyResource(format!("{}/", self.bare)));
        }
        Ok(ActorId {
            bare: self.bare.clone(),
            resource: Some(resource.to_string()),
        })
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(r) => write!(f, "{}/{}", self.bare, r),
            None => f.write_str(&self.bare),
        }
    }
}

impl FromStr for ActorId {
    type Err = AidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_qualified() {
        let bare = ActorId::parse("ping").unwrap();
        assert!(bare.is_bare());
        assert_eq!(bare.bare(), "ping");
        assert_eq!(bare.resource(), None);

        let full = ActorId::parse("ping/node-1").unwrap();
        assert!(!full.is_bare());
        assert_eq!(full.bare(), "ping");
        assert_eq!(full.resource(), Some("node-1"));
        assert_eq!(full.to_string(), "ping/node-1");
    }

    #[test]
    fn resource_may_contain_slashes() {
        let id = ActorId::parse("svc/a/b").unwrap();
        assert_eq!(id.bare(), "svc");
        assert_eq!(id.resource(), Some("a/b"));
    }

    #[test]
    fn rejects_invalid_forms() {
        assert_eq!(ActorId::parse(""), Err(AidError::EmptyBare));
        assert_eq!(ActorId::parse("/res"), Err(AidError::EmptyBare));
        assert!(matches!(
            ActorId::parse("ping/"),
            Err(AidError::EmptyResource(_))
        ));
    }

    #[test]
    fn bare_equality_ignores_resource() {
        let a = ActorId::parse("pong/1").unwrap();
        let b = ActorId::parse("pong/2").unwrap();
        assert_ne!(a, b);
        assert!(a.bare_eq(&b));
    }

    #[test]
    fn qualification() {
        let bare = ActorId::parse("pong").unwrap();
        let full = bare.qualified("abc").unwrap();
        assert_eq!(full.to_string(), "pong/abc");
        assert!(full.qualified("xyz").is_err());
        assert!(bare.qualified("").is_err());
    }
}
