//! Inspection of Travis CI configuration files.
//!
//! Only the `go` key matters: a repository qualifies when every Go
//! release it builds against is at least the configured minimum, so the
//! replacement import path is guaranteed to resolve.

use std::{fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v?(\d+)(?:\.(\d+))?(?:\.(\d+))?$").expect("static version pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognised Go version '{0}'")]
pub struct VersionError(pub String);

/// A Go release number. Parsing is tolerant: a leading `v` is accepted
/// and missing minor or patch components are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GoVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl GoVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for GoVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = VERSION_RE
            .captures(s.trim())
            .ok_or_else(|| VersionError(s.to_string()))?;
        let part = |idx: usize| -> Result<u64, VersionError> {
            caps.get(idx)
                .map_or(Ok(0), |m| m.as_str().parse().map_err(|_| VersionError(s.to_string())))
        };
        Ok(Self::new(part(1)?, part(2)?, part(3)?))
    }
}

impl fmt::Display for GoVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Result of checking a CI file against the minimum Go version.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Supported,
    Outdated(String),
    Unrecognised(String),
    Invalid(String),
}

impl Verdict {
    pub fn is_supported(&self) -> bool {
        matches!(self, Verdict::Supported)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Supported => write!(f, "supported"),
            Verdict::Outdated(v) => write!(f, "builds against outdated Go {v}"),
            Verdict::Unrecognised(v) => write!(f, "unrecognised Go version '{v}'"),
            Verdict::Invalid(reason) => write!(f, "invalid CI configuration: {reason}"),
        }
    }
}

// Versions are read as strings straight from the document. Deserializing
// a `String` takes the scalar's source text, so an unquoted `1.10` stays
// `1.10`; going through `serde_yaml::Value` would turn it into the float 1.1.
#[derive(Debug, Default, Deserialize)]
struct OneVersion {
    #[serde(default)]
    go: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ManyVersions {
    #[serde(default)]
    go: Option<Vec<String>>,
}

/// Extracts the Go versions listed under the `go` key, as written.
pub fn go_versions(content: &str) -> Result<Vec<String>, serde_yaml::Error> {
    let value: serde_yaml::Value = serde_yaml::from_str(content)?;
    if value.is_null() {
        return Ok(Vec::new());
    }

    if matches!(value.get("go"), Some(serde_yaml::Value::Sequence(_))) {
        let config: ManyVersions = serde_yaml::from_str(content)?;
        return Ok(config.go.unwrap_or_default());
    }

    let config: OneVersion = serde_yaml::from_str(content)?;
    Ok(config.go.into_iter().collect())
}

/// Checks whether every Go version in `content` is at least `minimum`.
pub fn check(content: &str, minimum: GoVersion) -> Verdict {
    let versions = match go_versions(content) {
        Ok(versions) => versions,
        Err(err) => return Verdict::Invalid(err.to_string()),
    };

    for raw in versions {
        match raw.parse::<GoVersion>() {
            Ok(version) if version < minimum => return Verdict::Outdated(raw),
            Ok(_) => {}
            Err(_) => return Verdict::Unrecognised(raw),
        }
    }

    Verdict::Supported
}
