use miette::Diagnostic;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// The name of a Python distribution as it appears in project files, wheel filenames and index
/// URLs. The instance keeps both the spelling it was parsed from and the canonical form described
/// in [PEP 503](https://peps.python.org/pep-0503/#normalized-names): lowercased, with every run of
/// `-`, `_` and `.` collapsed to a single `-`. All comparisons use the canonical form only.
#[derive(Debug, Clone, Eq, DeserializeFromStr)]
pub struct PackageName {
    source: Box<str>,
    canonical: Box<str>,
}

impl PackageName {
    /// Returns the spelling this name was parsed from.
    pub fn as_source_str(&self) -> &str {
        self.source.as_ref()
    }

    /// Returns the canonical (PEP 503 normalized) form of the name.
    pub fn as_str(&self) -> &str {
        self.canonical.as_ref()
    }
}

/// Error when parsing a distribution name
#[derive(Debug, Clone, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum ParsePackageNameError {
    #[error("invalid distribution name '{0}'")]
    InvalidName(String),
}

/// Collapses every run of `-`, `_` and `.` into a single `-` and lowercases the rest.
fn canonicalize(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut in_separator_run = false;
    for c in s.chars() {
        if matches!(c, '-' | '_' | '.') {
            in_separator_run = true;
        } else {
            if in_separator_run && !result.is_empty() {
                result.push('-');
            }
            in_separator_run = false;
            result.push(c.to_ascii_lowercase());
        }
    }
    result
}

impl FromStr for PackageName {
    type Err = ParsePackageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // https://packaging.python.org/specifications/core-metadata/#name
        static NAME_VALIDATE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(?i-u)^([A-Z0-9]|[A-Z0-9][A-Z0-9._-]*[A-Z0-9])$").unwrap()
        });

        if !NAME_VALIDATE.is_match(s) {
            return Err(ParsePackageNameError::InvalidName(s.into()));
        }

        Ok(PackageName {
            source: s.to_owned().into_boxed_str(),
            canonical: canonicalize(s).into_boxed_str(),
        })
    }
}

impl Display for PackageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl Hash for PackageName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state)
    }
}

impl PartialEq for PackageName {
    fn eq(&self, other: &Self) -> bool {
        self.canonical.eq(&other.canonical)
    }
}

impl PartialOrd for PackageName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl Serialize for PackageName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.source.as_ref().serialize(serializer)
    }
}

/// A distribution name that is statically known to be in canonical form. Because canonical names
/// are the identity used throughout the caches and the dependency graph, most code works with this
/// type and only touches [`PackageName`] at the parsing boundary.
#[repr(transparent)]
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub struct NormalizedPackageName(Box<str>);

impl From<PackageName> for NormalizedPackageName {
    fn from(value: PackageName) -> Self {
        Self(value.canonical)
    }
}

impl From<NormalizedPackageName> for PackageName {
    fn from(value: NormalizedPackageName) -> Self {
        Self {
            source: value.0.clone(),
            canonical: value.0,
        }
    }
}

impl Display for NormalizedPackageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl NormalizedPackageName {
    /// Returns a string reference
    pub fn as_str(&self) -> &str {
        self.0.as_ref()
    }
}

impl FromStr for NormalizedPackageName {
    type Err = ParsePackageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PackageName::from_str(s)?.into())
    }
}

impl Borrow<str> for NormalizedPackageName {
    fn borrow(&self) -> &str {
        self.0.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_canonicalization() {
        let name1: PackageName = "Foo-Bar-Baz".parse().unwrap();
        assert_eq!(name1.as_source_str(), "Foo-Bar-Baz");
        assert_eq!(name1.as_str(), "foo-bar-baz");

        let name2: PackageName = "foo_bar.baz".parse().unwrap();
        assert_eq!(name2.as_str(), "foo-bar-baz");
        assert_eq!(name1, name2);

        let name3: PackageName = "foo-barbaz".parse().unwrap();
        assert_ne!(name1, name3);
    }

    #[test]
    fn test_separator_runs_collapse() {
        let name: PackageName = "jaraco.functools".parse().unwrap();
        assert_eq!(name.as_str(), "jaraco-functools");

        let name: PackageName = "a---b___c...d".parse().unwrap();
        assert_eq!(name.as_str(), "a-b-c-d");
    }

    #[test]
    fn test_canonicalization_is_idempotent() {
        let once: NormalizedPackageName = "Sphinx_RTD.Theme".parse().unwrap();
        let twice: NormalizedPackageName = once.as_str().parse().unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_rejects_junk() {
        assert!(PackageName::from_str("").is_err());
        assert!(PackageName::from_str("-leading").is_err());
        assert!(PackageName::from_str("trailing_").is_err());
        assert!(PackageName::from_str("has space").is_err());
    }
}
