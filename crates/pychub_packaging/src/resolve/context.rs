use crate::tags::WheelTag;
use pep440_rs::Version;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

const KEY_SEPARATOR: &str = "|";

/// How a single resolution run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    /// The run has not completed yet.
    Pending,
    /// The dependency tree resolved for this context.
    Success,
    /// The run failed; see the reason.
    Failed,
}

/// Why a resolution run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonKind {
    /// The index had no candidates at all for a requirement.
    NoCandidates,
    /// Two requirements pinned incompatible versions.
    VersionConflict,
    /// Candidates existed but none had a compatible wheel.
    NoCompatibleWheel,
    /// Environment markers pruned every candidate.
    MarkerPrunedAll,
    /// Anything else.
    Unknown,
}

/// The outcome attached to a [`ResolutionContext`] after its run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionContextResult {
    /// Terminal state of the run.
    pub status: ResolutionStatus,

    /// Failure classification; `Unknown` while pending or on success.
    pub reason_kind: ReasonKind,

    /// Free-form failure detail.
    pub detail: String,
}

impl Default for ResolutionContextResult {
    fn default() -> Self {
        Self {
            status: ResolutionStatus::Pending,
            reason_kind: ReasonKind::Unknown,
            detail: String::new(),
        }
    }
}

/// The environment one dependency-tree evaluation runs against. The build evaluates the tree once
/// per context to learn which tag triples the final chub can support; the context's tag also keys
/// the dependency metadata cache, because `Requires-Dist` differs per environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionContext {
    /// CPU architecture, e.g. "x86_64".
    pub arch: String,

    /// OS family, e.g. "linux".
    pub os_family: String,

    /// Python implementation, e.g. "cpython".
    pub python_implementation: String,

    /// The python version of this context.
    pub python_version: Version,

    /// The tag triple this context evaluates for.
    pub tag: WheelTag,

    /// The outcome of the run, updated when the run finishes.
    #[serde(default)]
    pub result: ResolutionContextResult,
}

/// Error when decoding a context key.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum ParseContextKeyError {
    #[error("expected 5 '|'-separated parts, got {0} in '{1}'")]
    WrongPartCount(usize, String),

    #[error("invalid python version in context key: {0}")]
    InvalidVersion(String),

    #[error("invalid tag in context key: {0}")]
    InvalidTag(String),
}

impl ResolutionContext {
    /// Builds a context whose tag is derived from its parts.
    pub fn new(
        arch: impl Into<String>,
        os_family: impl Into<String>,
        python_implementation: impl Into<String>,
        python_version: Version,
        tag: WheelTag,
    ) -> Self {
        Self {
            arch: arch.into(),
            os_family: os_family.into(),
            python_implementation: python_implementation.into(),
            python_version,
            tag,
            result: ResolutionContextResult::default(),
        }
    }

    /// A stable string identity for this context, round-trippable via
    /// [`from_context_key`](Self::from_context_key).
    pub fn context_key(&self) -> String {
        [
            self.arch.as_str(),
            self.os_family.as_str(),
            self.python_implementation.as_str(),
            &self.python_version.to_string(),
            &self.tag.to_string(),
        ]
        .join(KEY_SEPARATOR)
    }

    /// Decodes a context key produced by [`context_key`](Self::context_key). The result field is
    /// not part of the key and comes back pending.
    pub fn from_context_key(key: &str) -> Result<Self, ParseContextKeyError> {
        let parts: Vec<&str> = key.split(KEY_SEPARATOR).collect();
        let [arch, os_family, implementation, version, tag] = parts.as_slice() else {
            return Err(ParseContextKeyError::WrongPartCount(
                parts.len(),
                key.to_owned(),
            ));
        };
        Ok(Self::new(
            *arch,
            *os_family,
            *implementation,
            Version::from_str(version)
                .map_err(|_| ParseContextKeyError::InvalidVersion((*version).to_owned()))?,
            WheelTag::from_str(tag)
                .map_err(|_| ParseContextKeyError::InvalidTag((*tag).to_owned()))?,
        ))
    }

    /// The PEP 508 marker environment this context implies, used to prune `Requires-Dist`
    /// entries.
    pub fn marker_environment(&self) -> pep508_rs::MarkerEnvironment {
        let version = self.python_version.to_string();
        let (platform_system, sys_platform) = match self.os_family.as_str() {
            "windows" => ("Windows", "win32"),
            "macos" => ("Darwin", "darwin"),
            _ => ("Linux", "linux"),
        };
        let implementation = match self.python_implementation.as_str() {
            "pypy" => "PyPy",
            _ => "CPython",
        };

        serde_json::from_value(serde_json::json!({
            "implementation_name": self.python_implementation,
            "implementation_version": version,
            "os_name": if platform_system == "Windows" { "nt" } else { "posix" },
            "platform_machine": self.arch,
            "platform_python_implementation": implementation,
            "platform_release": "",
            "platform_system": platform_system,
            "platform_version": "",
            "python_full_version": version,
            "python_version": version,
            "sys_platform": sys_platform,
        }))
        .expect("marker environment fields are statically complete")
    }
}

impl Display for ResolutionContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.context_key())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn context() -> ResolutionContext {
        ResolutionContext::new(
            "x86_64",
            "linux",
            "cpython",
            Version::from_str("3.11").unwrap(),
            "cp311-cp311-manylinux_2_17_x86_64".parse().unwrap(),
        )
    }

    #[test]
    fn test_context_key_roundtrip() {
        let ctx = context();
        let key = ctx.context_key();
        assert_eq!(
            key,
            "x86_64|linux|cpython|3.11|cp311-cp311-manylinux_2_17_x86_64"
        );
        let decoded = ResolutionContext::from_context_key(&key).unwrap();
        assert_eq!(decoded, ctx);
    }

    #[test]
    fn test_bad_context_keys() {
        assert!(ResolutionContext::from_context_key("a|b|c").is_err());
        assert!(
            ResolutionContext::from_context_key("x86_64|linux|cpython|nope|py3-none-any").is_err()
        );
    }

    #[test]
    fn test_marker_environment_prunes_by_python_version() {
        use pep508_rs::Requirement;
        use std::str::FromStr;

        let env = context().marker_environment();
        let keep =
            Requirement::from_str("tomli>=1.1.0; python_version < '3.12'").unwrap();
        let drop = Requirement::from_str("tomli>=1.1.0; python_version < '3.11'").unwrap();
        assert!(keep.marker.unwrap().evaluate(&env, &[]));
        assert!(!drop.marker.unwrap().evaluate(&env, &[]));
    }
}
