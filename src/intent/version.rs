//! Version constraints and advertised version ranges.
//!
//! Compatibility rule: the major version must match exactly unless the
//! constraint is a wildcard, and the candidate's (minor, patch) must be at
//! least the constraint's (minor, patch). Unlike cargo, `0.x` majors get no
//! special treatment. Pre-release tags are ignored for compatibility.

use crate::core::{Error, Result};
use crate::intent::identifier::parse_version_lenient;
use semver::Version;
use serde::{Deserialize, Serialize};

/// A version requirement attached to a resolution request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionConstraint {
    /// `*` - any version.
    Any,
    /// `^M.m.p` or bare `M.m.p` - same major, at least (m, p).
    Compatible(Version),
    /// `M.*` / `M.x` - any version within major M.
    Major(u64),
    /// `=M.m.p` - exactly this version.
    Exact(Version),
}

impl VersionConstraint {
    /// Parse the constraint grammar described in the module docs.
    pub fn parse(input: &str) -> Result<Self> {
        let s = input.trim();
        if s.is_empty() || s == "*" {
            return Ok(Self::Any);
        }
        if let Some(rest) = s.strip_prefix('=') {
            return Ok(Self::Exact(parse_version_lenient(rest).map_err(|_| bad(input))?));
        }
        let s = s.strip_prefix('^').unwrap_or(s);
        if let Some(major) = s.strip_suffix(".*").or_else(|| s.strip_suffix(".x")) {
            let major = major.trim_start_matches('v').parse().map_err(|_| bad(input))?;
            return Ok(Self::Major(major));
        }
        Ok(Self::Compatible(
            parse_version_lenient(s).map_err(|_| bad(input))?,
        ))
    }

    /// The constraint "compatible with `version`".
    pub fn compatible_with(version: &Version) -> Self {
        Self::Compatible(Version::new(version.major, version.minor, version.patch))
    }

    /// Whether a single version satisfies the constraint.
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Any => true,
            Self::Compatible(c) => {
                version.major == c.major && (version.minor, version.patch) >= (c.minor, c.patch)
            }
            Self::Major(major) => version.major == *major,
            Self::Exact(e) => key(version) == key(e),
        }
    }

    /// Whether at least one version inside `range` satisfies the constraint.
    pub fn admits(&self, range: &VersionRange) -> bool {
        let (lo, hi) = (key(&range.min), key(&range.max));
        match self {
            Self::Any => true,
            Self::Compatible(c) => hi >= key(c) && lo.0 <= c.major,
            Self::Major(major) => hi >= (*major, 0, 0) && lo.0 <= *major,
            Self::Exact(e) => lo <= key(e) && key(e) <= hi,
        }
    }
}

impl std::fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Compatible(v) => write!(f, "^{}", v),
            Self::Major(m) => write!(f, "{}.*", m),
            Self::Exact(v) => write!(f, "={}", v),
        }
    }
}

impl std::str::FromStr for VersionConstraint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Inclusive range of versions an agent serves for one intent pattern.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRange {
    pub min: Version,
    pub max: Version,
}

impl VersionRange {
    /// Range containing a single version.
    pub fn exact(version: Version) -> Self {
        Self {
            min: version.clone(),
            max: version,
        }
    }

    /// Inclusive range; `min` must not exceed `max`.
    pub fn new(min: Version, max: Version) -> Result<Self> {
        if key(&min) > key(&max) {
            return Err(Error::malformed(format!(
                "version range {}..={} is empty",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, version: &Version) -> bool {
        key(&self.min) <= key(version) && key(version) <= key(&self.max)
    }
}

fn key(v: &Version) -> (u64, u64, u64) {
    (v.major, v.minor, v.patch)
}

fn bad(input: &str) -> Error {
    Error::malformed(format!("invalid version constraint '{}'", input))
}
