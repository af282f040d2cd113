use std::cmp::Ordering;
use std::fmt;

use serde::{Serialize, Serializer};

/// Semantic version carried by package filenames and install directories.
///
/// Two to four numeric components plus an optional prerelease tag
/// (`1.2`, `1.2.3`, `1.2.3.4`, `1.2.3-beta2`). A release orders above any
/// prerelease of the same numeric version; prerelease tags order
/// lexicographically.
#[derive(Clone, Debug)]
pub struct PackageVersion {
    major: u64,
    minor: u64,
    patch: u64,
    build: Option<u64>,
    prerelease: Option<String>,
}

impl PackageVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            build: None,
            prerelease: None,
        }
    }

    pub fn with_prerelease(mut self, tag: &str) -> Self {
        self.prerelease = Some(tag.to_owned());
        self
    }

    /// Parse a version string, returning `None` on anything malformed.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        let (numbers, prerelease) = match value.split_once('-') {
            Some((left, right)) if !right.is_empty() => (left, Some(right.to_owned())),
            Some(_) => return None,
            None => (value, None),
        };

        let parts: Vec<u64> = numbers
            .split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect::<Option<_>>()?;
        if parts.len() < 2 || parts.len() > 4 {
            return None;
        }

        Some(Self {
            major: parts[0],
            minor: parts[1],
            patch: parts.get(2).copied().unwrap_or(0),
            build: parts.get(3).copied(),
            prerelease,
        })
    }

    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let numeric = (self.major, self.minor, self.patch, self.build.unwrap_or(0));
        let other_numeric = (other.major, other.minor, other.patch, other.build.unwrap_or(0));
        numeric.cmp(&other_numeric).then_with(|| {
            match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            }
        })
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Eq and Hash treat a missing fourth component as zero, matching Ord.
impl PartialEq for PackageVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PackageVersion {}

impl std::hash::Hash for PackageVersion {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (
            self.major,
            self.minor,
            self.patch,
            self.build.unwrap_or(0),
            &self.prerelease,
        )
            .hash(state);
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(build) = self.build {
            write!(f, ".{build}")?;
        }
        if let Some(tag) = &self.prerelease {
            write!(f, "-{tag}")?;
        }
        Ok(())
    }
}

impl Serialize for PackageVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
