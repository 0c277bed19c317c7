//! Intent identifiers and patterns.
//!
//! An intent names a requested capability as `namespace:category:action`
//! plus a semantic version. Any segment may be the wildcard `*`; a pattern
//! such as `research:*` matches every category and action in `research`.

use crate::core::{Error, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

/// Wildcard segment.
pub const WILDCARD: &str = "*";

/// Maximum length of a single segment.
const MAX_SEGMENT_LEN: usize = 64;

/// The (namespace, category, action) part of an intent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntentPattern {
    pub namespace: String,
    pub category: String,
    pub action: String,
}

impl IntentPattern {
    /// Build a pattern from raw segments, validating each.
    pub fn new(namespace: &str, category: &str, action: &str) -> Result<Self> {
        Ok(Self {
            namespace: normalize_segment(namespace)?,
            category: normalize_segment(category)?,
            action: normalize_segment(action)?,
        })
    }

    /// Parse `namespace:category[:action]`, `namespace:*`, `*`, or the URN
    /// form `urn:<namespace>:intent:<category>:<action>[:v<version>]`.
    ///
    /// A missing action means "any action"; a category wildcard implies an
    /// action wildcard.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if let Some((pattern, _)) = parse_urn(input)? {
            return Ok(pattern);
        }
        let input = input.split('@').next().unwrap_or_default();
        let parts: Vec<&str> = input.split(':').collect();
        match parts.as_slice() {
            [ns] if *ns == WILDCARD => Self::new(WILDCARD, WILDCARD, WILDCARD),
            [ns, cat] if *cat == WILDCARD => Self::new(ns, WILDCARD, WILDCARD),
            [ns, cat] => Self::new(ns, cat, WILDCARD),
            [ns, cat, action] if *cat == WILDCARD => {
                if *action != WILDCARD {
                    return Err(invalid(input, "action cannot follow a category wildcard"));
                }
                Self::new(ns, WILDCARD, WILDCARD)
            }
            [ns, cat, action] => Self::new(ns, cat, action),
            _ => Err(invalid(input, "expected namespace:category[:action]")),
        }
    }

    /// Whether any segment is a wildcard (broadcast-style targeting).
    pub fn is_wildcard(&self) -> bool {
        self.namespace == WILDCARD || self.category == WILDCARD || self.action == WILDCARD
    }

    /// Segment-wise match where a wildcard on either side matches anything.
    ///
    /// Symmetric: an agent advertising `research:*` serves a request for
    /// `research:climate-analysis:summarize`, and a request for
    /// `research:*` reaches an agent advertising any research category.
    pub fn matches(&self, other: &IntentPattern) -> bool {
        segment_matches(&self.namespace, &other.namespace)
            && segment_matches(&self.category, &other.category)
            && segment_matches(&self.action, &other.action)
    }
}

impl std::fmt::Display for IntentPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.category, self.action)
    }
}

impl std::str::FromStr for IntentPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A fully qualified intent: pattern plus semantic version.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntentIdentifier {
    pub namespace: String,
    pub category: String,
    pub action: String,
    pub version: Version,
}

impl IntentIdentifier {
    /// Combine a pattern with a version.
    pub fn new(pattern: IntentPattern, version: Version) -> Self {
        Self {
            namespace: pattern.namespace,
            category: pattern.category,
            action: pattern.action,
            version,
        }
    }

    /// Parse `namespace:category:action@1.2.3` or the URN form with a
    /// trailing `:v1.2.3` segment. The version is mandatory.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if let Some((pattern, version)) = parse_urn(input)? {
            let version = version.ok_or_else(|| invalid(input, "missing version"))?;
            return Ok(Self::new(pattern, version));
        }
        let (pattern, version) = input
            .split_once('@')
            .ok_or_else(|| invalid(input, "missing @version"))?;
        Ok(Self::new(
            IntentPattern::parse(pattern)?,
            parse_version_lenient(version)?,
        ))
    }

    /// Assemble from wire fields.
    pub fn from_parts(pattern: &str, version: &str) -> Result<Self> {
        let version = Version::parse(version)
            .map_err(|e| invalid(version, &format!("bad semantic version: {}", e)))?;
        Ok(Self::new(IntentPattern::parse(pattern)?, version))
    }

    /// The (namespace, category, action) part.
    pub fn pattern(&self) -> IntentPattern {
        IntentPattern {
            namespace: self.namespace.clone(),
            category: self.category.clone(),
            action: self.action.clone(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.pattern().is_wildcard()
    }
}

impl std::fmt::Display for IntentIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}@{}",
            self.namespace, self.category, self.action, self.version
        )
    }
}

impl std::str::FromStr for IntentIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Parse `1`, `1.4`, `1.4.2` or `v1.4.2` into a full semantic version.
pub fn parse_version_lenient(input: &str) -> Result<Version> {
    let trimmed = input.trim().trim_start_matches('v');
    if let Ok(version) = Version::parse(trimmed) {
        return Ok(version);
    }
    let mut numbers = [0u64; 3];
    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(invalid(input, "bad version"));
    }
    for (slot, part) in numbers.iter_mut().zip(parts) {
        *slot = part
            .parse()
            .map_err(|_| invalid(input, "bad version component"))?;
    }
    Ok(Version::new(numbers[0], numbers[1], numbers[2]))
}

fn parse_urn(input: &str) -> Result<Option<(IntentPattern, Option<Version>)>> {
    let Some(rest) = input.strip_prefix("urn:") else {
        return Ok(None);
    };
    let parts: Vec<&str> = rest.split(':').collect();
    match parts.as_slice() {
        [ns, "intent", cat, action] => Ok(Some((IntentPattern::new(ns, cat, action)?, None))),
        [ns, "intent", cat, action, version] => {
            let version = version
                .strip_prefix('v')
                .ok_or_else(|| invalid(input, "URN version must start with 'v'"))?;
            Ok(Some((
                IntentPattern::new(ns, cat, action)?,
                Some(parse_version_lenient(version)?),
            )))
        }
        _ => Err(invalid(input, "expected urn:<ns>:intent:<category>:<action>[:v<version>]")),
    }
}

fn segment_matches(a: &str, b: &str) -> bool {
    a == WILDCARD || b == WILDCARD || a == b
}

fn normalize_segment(raw: &str) -> Result<String> {
    let segment = raw.trim().to_ascii_lowercase();
    if segment == WILDCARD {
        return Ok(segment);
    }
    if segment.is_empty() || segment.len() > MAX_SEGMENT_LEN {
        return Err(invalid(raw, "segment must be 1-64 characters"));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid(raw, "segment has invalid characters"));
    }
    Ok(segment)
}

fn invalid(input: &str, reason: &str) -> Error {
    Error::malformed(format!("invalid intent identifier '{}': {}", input, reason))
}
