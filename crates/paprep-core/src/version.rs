//! PAN-OS version parsing and ordering
//!
//! Versions have the form `X.Y.Z` or `X.Y.Z-hN`. A hotfix build sorts after
//! its base release, so `10.1.3 < 10.1.3-h1 < 10.1.3-h2 < 10.1.4`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version format: {input:?} ({reason})")]
    Invalid { input: String, reason: &'static str },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FamilyError {
    #[error("Invalid version family: {0:?} (expected X.Y)")]
    Invalid(String),
}

/// A `major.minor` release family, e.g. `10.1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Family {
    pub major: u32,
    pub minor: u32,
}

impl Family {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// The nominal `X.Y.0` release of this family
    pub const fn nominal_base(&self) -> Version {
        Version::base(*self)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Family {
    type Err = FamilyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FamilyError::Invalid(s.to_string());
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: parse_component(major).ok_or_else(invalid)?,
            minor: parse_component(minor).ok_or_else(invalid)?,
        })
    }
}

/// A PAN-OS software version
///
/// Field order matters: the derived ordering compares major, minor, patch and
/// then hotfix, and `None` sorts below every `Some`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub hotfix: Option<u32>,
}

impl Version {
    /// Create a base (non-hotfix) version
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            hotfix: None,
        }
    }

    /// The `X.Y.0` release of a family
    pub const fn base(family: Family) -> Self {
        Self::new(family.major, family.minor, 0)
    }

    pub const fn with_hotfix(self, hotfix: u32) -> Self {
        Self {
            hotfix: Some(hotfix),
            ..self
        }
    }

    /// Parse a version string like `10.2.4` or `10.2.4-h1`
    ///
    /// Parsing is strict: no surrounding whitespace, no signs, exactly three
    /// numeric components, and an optional `-h` suffix followed by digits.
    pub fn parse(text: &str) -> Result<Self, VersionError> {
        let invalid = |reason| VersionError::Invalid {
            input: text.to_string(),
            reason,
        };

        let (release, hotfix) = match text.split_once('-') {
            Some((release, suffix)) => {
                let digits = suffix
                    .strip_prefix('h')
                    .ok_or_else(|| invalid("hotfix suffix must be -hN"))?;
                let hotfix =
                    parse_component(digits).ok_or_else(|| invalid("hotfix suffix must be -hN"))?;
                (release, Some(hotfix))
            }
            None => (text, None),
        };

        let mut parts = release.split('.');
        let mut next = || {
            parts
                .next()
                .and_then(parse_component)
                .ok_or_else(|| invalid("expected X.Y.Z with numeric components"))
        };
        let major = next()?;
        let minor = next()?;
        let patch = next()?;
        if parts.next().is_some() {
            return Err(invalid("too many components"));
        }

        Ok(Self {
            major,
            minor,
            patch,
            hotfix,
        })
    }

    pub const fn family(&self) -> Family {
        Family::new(self.major, self.minor)
    }

    pub const fn is_hotfix(&self) -> bool {
        self.hotfix.is_some()
    }
}

/// Parse one ASCII-digit component, rejecting signs and empty strings
fn parse_component(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(hotfix) = self.hotfix {
            write!(f, "-h{}", hotfix)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_parse_base_release() {
        assert_eq!(v("10.2.4"), Version::new(10, 2, 4));
        assert!(!v("10.2.4").is_hotfix());
    }

    #[test]
    fn test_parse_hotfix() {
        let parsed = v("10.1.3-h11");
        assert_eq!(parsed, Version::new(10, 1, 3).with_hotfix(11));
        assert_eq!(parsed.family(), Family::new(10, 1));
    }

    #[test]
    fn test_display_canonical_form() {
        for text in ["9.0.1", "10.1.3-h4", "12.1.2", "0.0.0", "11.2.10-h0"] {
            assert_eq!(v(text).to_string(), text);
        }
        // Leading zeros are accepted but not preserved
        assert_eq!(v("010.01.3").to_string(), "10.1.3");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for text in [
            "",
            "10",
            "10.1",
            "10.1.3.4",
            "10..3",
            "-10.1.3",
            "10.-1.3",
            "+10.1.3",
            "10.1.x",
            "10.1.3-",
            "10.1.3-h",
            "10.1.3-hx",
            "10.1.3-1",
            "10.1.3-h1-h2",
            " 10.1.3",
            "10.1.3 ",
            "v10.1.3",
            "99999999999.0.0",
        ] {
            assert!(Version::parse(text).is_err(), "accepted {:?}", text);
        }
    }

    #[test]
    fn test_hotfix_sorts_after_base() {
        assert!(v("10.1.3") < v("10.1.3-h1"));
        assert!(v("10.1.3-h1") < v("10.1.3-h2"));
        assert!(v("10.1.3-h9") < v("10.1.4"));
        assert!(v("10.1.3-h9") < v("10.1.10"));
    }

    #[test]
    fn test_ordering_is_total() {
        let versions: Vec<Version> = ["9.0.1", "9.1.0", "10.0.0", "10.0.0-h1", "10.1.3", "12.1.2"]
            .iter()
            .map(|s| v(s))
            .collect();

        for a in &versions {
            for b in &versions {
                let holds = [a < b, a == b, a > b];
                assert_eq!(holds.iter().filter(|x| **x).count(), 1);
                assert_eq!(a.cmp(b), b.cmp(a).reverse());
                for c in &versions {
                    if a < b && b < c {
                        assert!(a < c);
                    }
                }
            }
        }
        assert_eq!(v("10.1.3").cmp(&v("10.1.3")), Ordering::Equal);
    }

    #[test]
    fn test_family_parse() {
        assert_eq!("12.1".parse::<Family>().unwrap(), Family::new(12, 1));
        assert_eq!(Family::new(12, 1).to_string(), "12.1");
        assert!("12".parse::<Family>().is_err());
        assert!("12.1.0".parse::<Family>().is_err());
        assert!("a.b".parse::<Family>().is_err());
    }

    #[test]
    fn test_nominal_base() {
        assert_eq!(Family::new(11, 2).nominal_base(), v("11.2.0"));
    }
}
