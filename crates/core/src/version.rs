//! Release version ordering.

use core::cmp::Ordering;
use core::hash::{Hash, Hasher};
use core::str::FromStr;

use semver::{BuildMetadata, Prerelease, Version};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A release version with semantic ordering.
///
/// Parsing is lenient about the shapes release feeds actually publish: a
/// leading `v` is ignored and missing minor/patch components default to `0`
/// (`"2.1"` == `"2.1.0"`). Pre-release tags order before the release itself;
/// build metadata is validated and then dropped, it carries no precedence.
///
/// The text as published is kept: it is what `Display` renders, so release
/// URLs and archive names use the feed's own spelling (`"2.1"` stays `"2.1"`),
/// while equality and ordering only look at the parsed version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReleaseVersion {
    version: Version,
    published: String,
}

impl ReleaseVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        let version = Version::new(major, minor, patch);
        Self {
            published: version.to_string(),
            version,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        let unprefixed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        if unprefixed.is_empty() {
            return Err(DomainError::invalid_version("empty version"));
        }

        let (rest, build) = match unprefixed.split_once('+') {
            Some((rest, build)) => (rest, Some(build)),
            None => (unprefixed, None),
        };
        let (numbers, pre) = match rest.split_once('-') {
            Some((numbers, pre)) => (numbers, Some(pre)),
            None => (rest, None),
        };

        let parts = numbers
            .split('.')
            .map(|part| {
                part.parse::<u64>()
                    .map_err(|_| DomainError::invalid_version(format!("{raw}: bad component `{part}`")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if parts.len() > 3 {
            return Err(DomainError::invalid_version(format!(
                "{raw}: too many components"
            )));
        }

        let mut version = Version::new(
            parts[0],
            parts.get(1).copied().unwrap_or(0),
            parts.get(2).copied().unwrap_or(0),
        );
        if let Some(pre) = pre {
            version.pre = Prerelease::new(pre)
                .map_err(|e| DomainError::invalid_version(format!("{raw}: {e}")))?;
        }
        if let Some(build) = build {
            BuildMetadata::new(build)
                .map_err(|e| DomainError::invalid_version(format!("{raw}: {e}")))?;
        }
        Ok(Self {
            version,
            published: trimmed.to_string(),
        })
    }

    /// `true` when `self` is strictly newer than `other`.
    pub fn is_newer_than(&self, other: &ReleaseVersion) -> bool {
        self > other
    }
}

impl PartialEq for ReleaseVersion {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
    }
}

impl Eq for ReleaseVersion {}

impl Hash for ReleaseVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.version.hash(state);
    }
}

impl Ord for ReleaseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version.cmp_precedence(&other.version)
    }
}

impl PartialOrd for ReleaseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for ReleaseVersion {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ReleaseVersion {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ReleaseVersion> for String {
    fn from(value: ReleaseVersion) -> Self {
        value.to_string()
    }
}

impl core::fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v(raw: &str) -> ReleaseVersion {
        ReleaseVersion::parse(raw).unwrap()
    }

    #[test]
    fn pads_missing_components() {
        assert_eq!(v("2.1"), v("2.1.0"));
        assert_eq!(v("3"), ReleaseVersion::new(3, 0, 0));
        assert_eq!(v("v2.0.1"), ReleaseVersion::new(2, 0, 1));
    }

    #[test]
    fn renders_the_published_spelling() {
        assert_eq!(v(" 2.1 ").to_string(), "2.1");
        assert_eq!(v("v2.0.1").to_string(), "v2.0.1");
        assert_eq!(ReleaseVersion::new(2, 1, 0).to_string(), "2.1.0");
        assert_eq!(serde_json::to_string(&v("2.1")).unwrap(), "\"2.1\"");
    }

    #[test]
    fn numeric_not_lexicographic_ordering() {
        assert!(v("2.10.0").is_newer_than(&v("2.9.9")));
        assert!(!v("2.9.9").is_newer_than(&v("2.10.0")));
    }

    #[test]
    fn equal_versions_are_not_newer() {
        assert!(!v("2.0.0").is_newer_than(&v("2.0")));
    }

    #[test]
    fn prerelease_orders_before_release() {
        assert!(v("2.1.0").is_newer_than(&v("2.1.0-beta.1")));
    }

    #[test]
    fn build_metadata_is_ignored_for_ordering() {
        assert!(!v("2.1.0+build.7").is_newer_than(&v("2.1.0")));
        assert_eq!(v("2.1.0+build.7"), v("2.1.0"));
    }

    #[test]
    fn rejects_malformed_versions() {
        for raw in ["", "v", "1..2", "1.2.3.4", "one.two", "1.2.x"] {
            assert!(
                matches!(ReleaseVersion::parse(raw), Err(DomainError::InvalidVersion(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn deserializes_from_json_string() {
        let parsed: ReleaseVersion = serde_json::from_str("\"2.1.0\"").unwrap();
        assert_eq!(parsed, v("2.1.0"));
        assert!(serde_json::from_str::<ReleaseVersion>("\"nope\"").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: newer-than agrees with lexicographic ordering of the
        /// numeric triple, and never holds in both directions.
        #[test]
        fn newer_than_matches_numeric_triples(
            a in (0u64..50, 0u64..50, 0u64..50),
            b in (0u64..50, 0u64..50, 0u64..50),
        ) {
            let va = ReleaseVersion::new(a.0, a.1, a.2);
            let vb = ReleaseVersion::new(b.0, b.1, b.2);

            prop_assert_eq!(vb.is_newer_than(&va), b > a);
            prop_assert!(!(va.is_newer_than(&vb) && vb.is_newer_than(&va)));
        }
    }
}
