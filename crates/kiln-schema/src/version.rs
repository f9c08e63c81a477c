//! Version parsing and constraint matching for BOSH release versions.
//!
//! Release authors rarely publish strict semver: `42`, `42.42`, and
//! `v1.2.3` all show up as tags and in bucket keys. Versions are therefore
//! parsed leniently (leading `v` stripped, missing components padded with
//! zero) before being handed to [`semver`].
//!
//! Constraints follow the Kilnfile conventions:
//! - `""`, `"*"`, or `"latest"`: any stable version
//! - `"1.2.3"` / `"42.42"`: exactly that version
//! - `"~1.2"`, `">=1.0, <2"`: semver ranges
//! - `"~1.2 || ~2.0"`: any alternative matches

use std::cmp::Ordering;

use semver::{Version, VersionReq};

use crate::SchemaError;

/// Parse a version, tolerating a `v` prefix and fewer than three components.
///
/// # Errors
///
/// Returns [`SchemaError::InvalidVersion`] when the numeric core is missing,
/// non-numeric, or has more than three components.
pub fn parse_lenient(input: &str) -> Result<Version, SchemaError> {
    let trimmed = input.trim();
    let without_prefix = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    let split_at = without_prefix
        .find(['-', '+'])
        .unwrap_or(without_prefix.len());
    let (core, suffix) = without_prefix.split_at(split_at);

    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty()
        || parts.len() > 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return Err(SchemaError::InvalidVersion(input.to_string()));
    }

    let mut padded: Vec<&str> = parts;
    while padded.len() < 3 {
        padded.push("0");
    }

    Version::parse(&format!("{}{suffix}", padded.join(".")))
        .map_err(|_| SchemaError::InvalidVersion(input.to_string()))
}

/// Order two version strings; versions that fail to parse sort lowest.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_lenient(a), parse_lenient(b)) {
        (Ok(a), Ok(b)) => a.cmp_precedence(&b),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => Ordering::Equal,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Alternative {
    Any,
    Exact(Version),
    Range(VersionReq),
}

impl Alternative {
    fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Any => version.pre.is_empty(),
            Self::Exact(want) => want.cmp_precedence(version) == Ordering::Equal,
            Self::Range(req) => req.matches(version),
        }
    }
}

/// A parsed Kilnfile version constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    raw: String,
    alternatives: Vec<Alternative>,
}

impl VersionConstraint {
    /// Parse a constraint string.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidConstraint`] for empty alternatives or
    /// strings that are neither versions nor semver ranges.
    pub fn parse(input: &str) -> Result<Self, SchemaError> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed == "*" || trimmed == "latest" {
            return Ok(Self {
                raw: input.to_string(),
                alternatives: vec![Alternative::Any],
            });
        }

        let mut alternatives = Vec::new();
        for part in trimmed.split("||").map(str::trim) {
            if part.is_empty() {
                return Err(SchemaError::InvalidConstraint {
                    input: input.to_string(),
                    reason: "empty alternative around \"||\"".to_string(),
                });
            }

            if let Ok(exact) = parse_lenient(part) {
                alternatives.push(Alternative::Exact(exact));
                continue;
            }

            let req = VersionReq::parse(part).map_err(|e| SchemaError::InvalidConstraint {
                input: input.to_string(),
                reason: e.to_string(),
            })?;
            alternatives.push(Alternative::Range(req));
        }

        Ok(Self {
            raw: input.to_string(),
            alternatives,
        })
    }

    /// Whether this constraint names exactly one version.
    pub fn is_exact(&self) -> bool {
        matches!(self.alternatives.as_slice(), [Alternative::Exact(_)])
    }

    /// Check a parsed version.
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|alt| alt.matches(version))
    }

    /// Check a raw version string; unparseable versions never match.
    pub fn matches_str(&self, version: &str) -> bool {
        parse_lenient(version).is_ok_and(|v| self.matches(&v))
    }

    /// Pick the greatest matching version from a set of candidates.
    ///
    /// Among equal versions the earliest candidate wins.
    pub fn best_match<'a, I>(&self, candidates: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut best: Option<(&'a str, Version)> = None;
        for candidate in candidates {
            let Ok(version) = parse_lenient(candidate) else {
                continue;
            };
            if !self.matches(&version) {
                continue;
            }
            let is_better = best
                .as_ref()
                .is_none_or(|(_, current)| version.cmp_precedence(current) == Ordering::Greater);
            if is_better {
                best = Some((candidate, version));
            }
        }
        best.map(|(raw, _)| raw)
    }
}

impl std::fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}
