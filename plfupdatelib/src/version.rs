use std::{
    fmt,
    num::ParseIntError,
    str::FromStr,
};

use thiserror::Error;

/// A `<major>.<minor>.<extra>` firmware version, as stored in PLF headers and
/// sent to the version check endpoint. Versions compare field by field.
///
/// A product with no installed image has no version at all, which is modelled
/// as `Option<PlfVersion>::None` rather than as `0.0.0`.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PlfVersion {
    pub major: u32,
    pub minor: u32,
    /// Also called "edit" or "bugfix"
    pub extra: u32,
}

impl PlfVersion {
    pub const fn new(major: u32, minor: u32, extra: u32) -> Self {
        Self { major, minor, extra }
    }

    /// Format a possibly absent version for the version check query. No
    /// installed image is reported as `0.0.0`, which the server treats as
    /// older than everything.
    pub fn query_string(version: Option<Self>) -> String {
        version.unwrap_or_default().to_string()
    }
}

impl fmt::Display for PlfVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.extra)
    }
}

impl FromStr for PlfVersion {
    type Err = ParsePlfVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pieces: Vec<&str> = s.trim().split('.').collect();

        if pieces.len() < 3 {
            return Err(ParsePlfVersionError::TooFewFields);
        } else if pieces.len() > 3 {
            return Err(ParsePlfVersionError::TooManyFields);
        }

        let field = |s: &str| -> Result<u32, ParsePlfVersionError> {
            // u32::from_str accepts a leading '+'
            if !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParsePlfVersionError::InvalidField(s.to_owned(), None));
            }
            s.parse().map_err(|e| ParsePlfVersionError::InvalidField(s.to_owned(), Some(e)))
        };

        Ok(Self::new(field(pieces[0])?, field(pieces[1])?, field(pieces[2])?))
    }
}

#[derive(Debug, Error)]
pub enum ParsePlfVersionError {
    #[error("Too few fields (<3) in version string")]
    TooFewFields,
    #[error("Too many fields (>3) in version string")]
    TooManyFields,
    #[error("Invalid version field: {0:?}")]
    InvalidField(String, Option<ParseIntError>),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(PlfVersion::new(1, 2, 3).to_string(), "1.2.3");
        assert_eq!(PlfVersion::query_string(None), "0.0.0");
        assert_eq!(PlfVersion::query_string(Some(PlfVersion::new(3, 0, 12))), "3.0.12");
    }

    #[test]
    fn test_parse() {
        let result: Result<PlfVersion, _> = "1.2.3".parse();
        assert_matches!(result, Ok(v) if v == PlfVersion::new(1, 2, 3));

        let result: Result<PlfVersion, _> = "1.2".parse();
        assert_matches!(result, Err(ParsePlfVersionError::TooFewFields));

        let result: Result<PlfVersion, _> = "1.2.3.4".parse();
        assert_matches!(result, Err(ParsePlfVersionError::TooManyFields));

        let result: Result<PlfVersion, _> = "1.-2.3".parse();
        assert_matches!(result, Err(ParsePlfVersionError::InvalidField(f, _)) if f == "-2");

        let result: Result<PlfVersion, _> = "1..3".parse();
        assert_matches!(result, Err(ParsePlfVersionError::InvalidField(f, _)) if f.is_empty());
    }

    #[test]
    fn test_ordering() {
        assert!(PlfVersion::new(1, 0, 0) > PlfVersion::new(0, 9, 9));
        assert!(PlfVersion::new(1, 2, 0) > PlfVersion::new(1, 1, 7));
        assert!(PlfVersion::new(1, 2, 4) > PlfVersion::new(1, 2, 3));
        assert_ne!(None, Some(PlfVersion::default()));
    }
}
