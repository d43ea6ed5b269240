//! Image reference parsing

use crate::error::{JailError, Result};
use std::fmt;
use std::str::FromStr;

/// Tag used when a reference names no tag
pub const DEFAULT_TAG: &str = "latest";

/// An image name plus tag, e.g. `redis:7.2`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Repository name within the registry namespace
    pub name: String,
    /// Tag (or digest) to resolve
    pub tag: String,
}

impl ImageReference {
    /// Parse `image[:tag]`
    ///
    /// A missing tag defaults to `latest`. References with more than one
    /// `:` or with an empty name or tag are rejected.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| JailError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let (name, tag) = match reference.split_once(':') {
            None => {
                tracing::debug!(reference, "No tag given, defaulting to {}", DEFAULT_TAG);
                (reference, DEFAULT_TAG)
            }
            Some((_, tag)) if tag.contains(':') => {
                return Err(invalid("more than one ':' separator"));
            }
            Some((name, tag)) => (name, tag),
        };

        if name.is_empty() {
            return Err(invalid("image name is empty"));
        }
        if tag.is_empty() {
            return Err(invalid("tag is empty"));
        }

        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl FromStr for ImageReference {
    type Err = JailError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}
