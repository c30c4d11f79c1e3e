use super::{NormalizedPackageName, PackageName, ParsePackageNameError};
use crate::tags::WheelTag;
use crate::types::WheelFilename;
use pep440_rs::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

/// Normalizes a version string according to PEP 440 when it parses; an unparseable version (local
/// builds, legacy schemes) is preserved literally instead of being rejected.
pub fn normalize_version(version: &str) -> String {
    match Version::from_str(version) {
        Ok(v) => v.to_string(),
        Err(_) => version.to_owned(),
    }
}

/// The identity of a distribution inside a build plan: a canonical name plus a normalized version.
/// Equality and hashing use only `(name, version)`; the optional [`WheelKeyMetadata`] attachment
/// carries resolution byproducts and never participates in identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WheelKey {
    /// Canonical distribution name.
    pub name: NormalizedPackageName,

    /// PEP 440 normalized version, or the literal string when it does not parse.
    pub version: String,

    /// Non-identity attachment populated during resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<WheelKeyMetadata>,
}

/// Resolution byproducts attached to a [`WheelKey`]. When present, `actual_tag` must be one of
/// `satisfied_tags`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelKeyMetadata {
    /// The tag that was chosen for the wheel backing this key.
    pub actual_tag: WheelTag,

    /// Every tag of the wheel that the compatibility spec accepted.
    pub satisfied_tags: Vec<WheelTag>,

    /// Where the wheel came from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_uri: Option<Url>,
}

/// Error when constructing a [`WheelKey`].
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum WheelKeyError {
    #[error(transparent)]
    InvalidName(#[from] ParsePackageNameError),

    #[error("chosen tag '{actual}' is not among the satisfied tags")]
    TagNotSatisfied { actual: WheelTag },

    #[error("uri '{0}' does not name a wheel file")]
    NotAWheelUri(Url),

    #[error("invalid wheel filename in uri: {0}")]
    InvalidFilename(String),
}

impl WheelKey {
    /// Constructs a key from a raw name and version, canonicalizing both.
    pub fn new(name: &str, version: &str) -> Result<Self, WheelKeyError> {
        Ok(Self {
            name: PackageName::from_str(name)?.into(),
            version: normalize_version(version),
            metadata: None,
        })
    }

    /// Constructs a key from parts that are already normalized.
    pub fn from_parts(name: NormalizedPackageName, version: &str) -> Self {
        Self {
            name,
            version: normalize_version(version),
            metadata: None,
        }
    }

    /// Derives a key from the wheel filename in the path component of `uri`.
    pub fn from_uri(uri: &Url) -> Result<Self, WheelKeyError> {
        let filename = wheel_filename_from_uri(uri)
            .ok_or_else(|| WheelKeyError::NotAWheelUri(uri.clone()))?;
        let parsed = WheelFilename::from_filename(&filename)
            .map_err(|e| WheelKeyError::InvalidFilename(e.to_string()))?;
        Ok(Self {
            name: parsed.distribution.into(),
            version: parsed.version,
            metadata: None,
        })
    }

    /// Attaches resolution metadata, enforcing the `actual_tag ∈ satisfied_tags` invariant.
    pub fn with_metadata(mut self, metadata: WheelKeyMetadata) -> Result<Self, WheelKeyError> {
        if !metadata.satisfied_tags.contains(&metadata.actual_tag) {
            return Err(WheelKeyError::TagNotSatisfied {
                actual: metadata.actual_tag,
            });
        }
        self.metadata = Some(metadata);
        Ok(self)
    }

    /// The `name==version` requirement form of this key.
    pub fn requirement_str(&self) -> String {
        format!("{}=={}", self.name, self.version)
    }
}

/// Extracts the last path segment of a URI when it names a `.whl` file, dropping any query string.
pub fn wheel_filename_from_uri(uri: &Url) -> Option<String> {
    let path = uri.path();
    let filename = Path::new(path).file_name()?.to_str()?;
    filename.ends_with(".whl").then(|| filename.to_owned())
}

impl Display for WheelKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

impl PartialEq for WheelKey {
    fn eq(&self, other: &Self) -> bool {
        (&self.name, &self.version) == (&other.name, &other.version)
    }
}

impl Eq for WheelKey {}

impl Hash for WheelKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.version.hash(state);
    }
}

impl PartialOrd for WheelKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WheelKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.name, &self.version).cmp(&(&other.name, &other.version))
    }
}
