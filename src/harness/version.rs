//! Dotted SDK versions used to tag history fixtures
//!
//! A version is `MAJOR.MINOR.PATCH` optionally followed by `-EXTRA` or
//! `+EXTRA`. Only the presence of the suffix is kept: a pre-release sorts
//! before the release with the same numbers.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::common::{Error, Result};

/// A parsed `major.minor.patch[-extra]` version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub has_extra: bool,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32, has_extra: bool) -> Self {
        Self {
            major,
            minor,
            patch,
            has_extra,
        }
    }

    /// Parse a version string
    ///
    /// Only the segment count and the three numbers are checked; the suffix
    /// may hold anything.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidVersion(s.to_string());

        let pieces: Vec<&str> = s.splitn(3, '.').collect();
        let [major, minor, patch] = pieces.as_slice() else {
            return Err(invalid());
        };

        // Trim off a "-extra" and then a "+extra" suffix from the patch piece
        let mut patch = *patch;
        let mut has_extra = false;
        for marker in ['-', '+'] {
            if let Some(idx) = patch.rfind(marker) {
                if idx > 0 {
                    has_extra = true;
                    patch = &patch[..idx];
                }
            }
        }

        let number = |piece: &str| u32::from_str(piece).map_err(|_| invalid());

        Ok(Self {
            major: number(*major)?,
            minor: number(*minor)?,
            patch: number(patch)?,
            has_extra,
        })
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            // One that has extra is always less than the one that doesn't
            .then_with(|| other.has_extra.cmp(&self.has_extra))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        // The exact suffix is not kept
        if self.has_extra {
            write!(f, "-extra")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_parse_plain() {
        assert_eq!(v("1.22.3"), Version::new(1, 22, 3, false));
    }

    #[test]
    fn test_parse_extra_markers() {
        assert_eq!(v("1.2.3-rc.1"), Version::new(1, 2, 3, true));
        assert_eq!(v("1.2.3+build5"), Version::new(1, 2, 3, true));
        assert_eq!(v("1.2.3-beta+build5"), Version::new(1, 2, 3, true));
    }

    #[test]
    fn test_parse_numeric_segments_loosely() {
        assert_eq!(v("1.02.3"), Version::new(1, 2, 3, false));
        assert_eq!(v("01.2.3"), Version::new(1, 2, 3, false));
        assert_eq!(v("1.2.3-rc.01"), Version::new(1, 2, 3, true));
        assert_eq!(v("1.2.3-SNAPSHOT_1"), Version::new(1, 2, 3, true));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "1", "1.2", "a.b.c", "1.2.x", "1.2.-3", "-1.2.3"] {
            assert!(
                matches!(Version::parse(bad), Err(Error::InvalidVersion(_))),
                "expected {:?} to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_prerelease_sorts_before_release() {
        assert!(v("2.0.0-pre") < v("2.0.0"));
        assert!(v("1.9.9") < v("2.0.0-pre"));
        assert!(v("2.0.0") < v("2.0.1-pre"));
        assert_ne!(v("2.0.0-pre"), v("2.0.0"));
    }

    #[test]
    fn test_ordering_is_total_and_consistent() {
        let mut versions = Vec::new();
        for major in 0..3 {
            for minor in 0..3 {
                for patch in 0..3 {
                    for has_extra in [false, true] {
                        versions.push(Version::new(major, minor, patch, has_extra));
                    }
                }
            }
        }

        for a in &versions {
            for b in &versions {
                // Antisymmetric, and equal exactly when all fields are equal
                assert_eq!(a.cmp(b), b.cmp(a).reverse());
                assert_eq!(a.cmp(b) == Ordering::Equal, a == b);
                for c in &versions {
                    if a < b && b < c {
                        assert!(a < c, "{} < {} < {} not transitive", a, b, c);
                    }
                }
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(v("1.2.3").to_string(), "1.2.3");
        assert_eq!(v("1.2.3-SNAPSHOT").to_string(), "1.2.3-extra");
    }
}
