//! Structs that represent the response of a PEP 691 Simple API project page. Only the pieces the
//! planner consumes are modeled; unknown files (sdists, eggs) are carried as plain filenames so a
//! single malformed entry cannot poison the whole document.

use rattler_digest::{serde::SerializableHash, Sha256, Sha256Hash};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};
use url::Url;

/// The body of `{index}/{project}/` requested as `application/vnd.pypi.simple.v1+json`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProjectInfo {
    /// Metadata describing the API itself.
    pub meta: IndexMeta,

    /// All files the index serves for this project.
    #[serde(default)]
    pub files: Vec<ProjectFile>,
}

/// One downloadable file of a project.
#[serde_as]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectFile {
    /// The filename as the index spells it.
    pub filename: String,

    /// Absolute download URL.
    pub url: Url,

    /// Hashes of the file contents.
    #[serde(default)]
    pub hashes: FileHashes,

    /// Whether the file is yanked, and why.
    #[serde(default)]
    pub yanked: Yanked,

    /// PEP 658: whether `{url}.metadata` exists, with optional hashes of that sidecar.
    #[serde(default, alias = "dist-info-metadata")]
    pub core_metadata: CoreMetadataAvailability,
}

impl ProjectFile {
    /// True for `.whl` entries.
    pub fn is_wheel(&self) -> bool {
        self.filename.ends_with(".whl")
    }
}

/// Hashes for a file. All of `hashlib` is legal here in theory; only sha256 is consumed.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileHashes {
    /// The sha256 hash of the file, hex encoded.
    #[serde_as(as = "Option<SerializableHash<Sha256>>")]
    pub sha256: Option<Sha256Hash>,
}

/// PEP 658 sidecar availability. The index may give a bare boolean or a hash map; a hash map
/// implies availability.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "RawCoreMetadata")]
pub struct CoreMetadataAvailability {
    /// True if `{url}.metadata` can be fetched.
    pub available: bool,

    /// Hashes of the sidecar file, when advertised.
    pub hashes: FileHashes,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawCoreMetadata {
    Flag(bool),
    Hashes(FileHashes),
}

impl From<RawCoreMetadata> for CoreMetadataAvailability {
    fn from(raw: RawCoreMetadata) -> Self {
        match raw {
            RawCoreMetadata::Flag(available) => Self {
                available,
                hashes: FileHashes::default(),
            },
            RawCoreMetadata::Hashes(hashes) => Self {
                available: true,
                hashes,
            },
        }
    }
}

/// Yanked status; the index may give a bare boolean or a reason string.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(from = "RawYanked")]
pub struct Yanked {
    /// True if the file is yanked.
    pub yanked: bool,

    /// Optional reason given by the uploader.
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawYanked {
    Flag(bool),
    Reason(String),
}

impl From<RawYanked> for Yanked {
    fn from(raw: RawYanked) -> Self {
        match raw {
            RawYanked::Flag(yanked) => Self {
                yanked,
                reason: None,
            },
            RawYanked::Reason(reason) => Self {
                yanked: true,
                reason: Some(reason),
            },
        }
    }
}

/// The `meta` block of a PEP 691 response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexMeta {
    /// Version of the Simple API.
    #[serde(rename = "api-version")]
    pub version: String,
}

impl Default for IndexMeta {
    fn default() -> Self {
        Self {
            version: "1.0".into(),
        }
    }
}
