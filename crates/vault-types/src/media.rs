use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

const MAX_MEDIA_TYPE_LEN: usize = 255;

/// Caller-declared media type of a blob, e.g. `image/png`.
///
/// The value is a hint recorded alongside the blob the first time its digest
/// is seen. It is never sniffed from content and must not drive security
/// decisions. Only its shape is checked: a non-empty type and subtype
/// separated by a single `/`, with no whitespace or control characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MediaType(String);

impl MediaType {
    /// Validate and wrap a declared media type.
    pub fn parse(value: impl Into<String>) -> Result<Self, TypeError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty()
            || trimmed.len() > MAX_MEDIA_TYPE_LEN
            || trimmed.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(TypeError::InvalidMediaType(value));
        }
        match trimmed.split_once('/') {
            Some((kind, subtype))
                if !kind.is_empty() && !subtype.is_empty() && !subtype.contains('/') =>
            {
                Ok(Self(trimmed.to_string()))
            }
            _ => Err(TypeError::InvalidMediaType(value)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The top-level type, e.g. `image` for `image/png`.
    pub fn kind(&self) -> &str {
        self.0.split_once('/').map(|(kind, _)| kind).unwrap_or(&self.0)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MediaType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MediaType {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<MediaType> for String {
    fn from(media: MediaType) -> Self {
        media.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_type_and_subtype() {
        let media = MediaType::parse("image/png").unwrap();
        assert_eq!(media.as_str(), "image/png");
        assert_eq!(media.kind(), "image");
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let media = MediaType::parse("  text/plain ").unwrap();
        assert_eq!(media.to_string(), "text/plain");
    }

    #[test]
    fn rejects_malformed_values() {
        for bad in ["", "png", "image/", "/png", "image/png/x", "text/ plain", "a\u{0}/b"] {
            assert!(
                MediaType::parse(bad).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn deserialization_validates() {
        let ok: MediaType = serde_json::from_str("\"application/pdf\"").unwrap();
        assert_eq!(ok.as_str(), "application/pdf");
        assert!(serde_json::from_str::<MediaType>("\"nonsense\"").is_err());
    }
}
