use super::config::StrategyType;
use crate::resolve::ResolutionContext;
use crate::tags::WheelTag;
use crate::types::WheelKey;
use chrono::{DateTime, TimeZone, Utc};
use indexmap::IndexMap;
use rattler_digest::{serde::SerializableHash, Sha256, Sha256Hash};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Hash algorithm recorded on every cache entry.
pub const HASH_ALGORITHM: &str = "sha256";

/// Current wall-clock time truncated to whole seconds, the resolution all cache timestamps use.
pub fn now_second_precision() -> DateTime<Utc> {
    Utc.timestamp_opt(Utc::now().timestamp(), 0)
        .single()
        .expect("current time is always representable")
}

/// Computes the sha256 digest and byte size of a file.
pub fn compute_hash_and_size(path: &Path) -> std::io::Result<(Sha256Hash, u64)> {
    let hash = rattler_digest::compute_file_digest::<Sha256>(path)?;
    let size = fs_err::metadata(path)?.len();
    Ok((hash, size))
}

/// The behavior an index needs from its entries.
pub trait CacheEntry: Clone + Serialize + DeserializeOwned {
    /// The key this entry is stored under.
    fn cache_key(&self) -> &str;

    /// Where the artifact lives on disk.
    fn path(&self) -> &Path;

    /// When the entry stops being trusted; `None` means never.
    fn expiration(&self) -> Option<DateTime<Utc>>;

    /// Recorded content hash of the artifact.
    fn hash(&self) -> &Sha256Hash;
}

/// A cached wheel file. Keyed by `{canonical_name}-{version}-{chosen_tag}`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelCacheEntry {
    /// The cache key.
    pub key: String,

    /// Absolute path of the cached wheel.
    pub path: PathBuf,

    /// Where the wheel came from.
    pub origin_uri: String,

    /// Identity of the wheel.
    pub wheel_key: WheelKey,

    /// The tag chosen for this wheel by the compatibility evaluator.
    pub compatibility_tag: WheelTag,

    /// Always [`HASH_ALGORITHM`].
    pub hash_algorithm: String,

    /// Content hash, hex encoded on the wire.
    #[serde_as(as = "SerializableHash<Sha256>")]
    pub hash: Sha256Hash,

    /// File size in bytes.
    pub size_bytes: u64,

    /// When the entry was written, second resolution.
    pub timestamp: DateTime<Utc>,

    /// When the entry expires; absent for immutable artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

impl CacheEntry for WheelCacheEntry {
    fn cache_key(&self) -> &str {
        &self.key
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    fn hash(&self) -> &Sha256Hash {
        &self.hash
    }
}

/// A cached metadata document. The key shape depends on the kind: project-wide for candidate
/// metadata, per-(wheel, context tag) for dependency metadata.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataCacheEntry {
    /// The cache key.
    pub key: String,

    /// Absolute path of the cached document.
    pub path: PathBuf,

    /// Where the document came from, or `strategy:{name}` when the strategy had no URI.
    pub origin_uri: String,

    /// Which metadata kind this entry holds.
    pub metadata_type: StrategyType,

    /// Always [`HASH_ALGORITHM`].
    pub hash_algorithm: String,

    /// Content hash, hex encoded on the wire.
    #[serde_as(as = "SerializableHash<Sha256>")]
    pub hash: Sha256Hash,

    /// File size in bytes.
    pub size_bytes: u64,

    /// When the entry was written, second resolution.
    pub timestamp: DateTime<Utc>,

    /// When the entry expires; absent when the resolver never refreshes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

impl CacheEntry for MetadataCacheEntry {
    fn cache_key(&self) -> &str {
        &self.key
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    fn hash(&self) -> &Sha256Hash {
        &self.hash
    }
}

/// Cache key for dependency metadata: `{canonical_name}-{version}-{context_tag}`.
pub fn dependency_metadata_cache_key(wheel_key: &WheelKey, context: &ResolutionContext) -> String {
    format!("{}-{}-{}", wheel_key.name, wheel_key.version, context.tag)
}

/// Cache key for candidate (project-wide) metadata: the canonical name alone.
pub fn candidate_metadata_cache_key(wheel_key: &WheelKey) -> String {
    wheel_key.name.to_string()
}

/// A persisted mapping from cache key to entry, backed by a single JSON file. The index is rebuilt
/// from disk on startup; a missing or corrupt file simply yields an empty index. Writes go through
/// a temporary file in the same directory so the published file is never half-written.
#[derive(Debug)]
pub struct CacheIndex<E> {
    path: PathBuf,
    entries: IndexMap<String, E>,
}

impl<E: CacheEntry> CacheIndex<E> {
    /// Loads the index at `path`, or starts empty when the file is missing or unreadable.
    pub fn load_or_default(path: PathBuf) -> Self {
        let entries = match fs_err::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "discarding unreadable cache index"
                    );
                    IndexMap::new()
                }
            },
            Err(_) => IndexMap::new(),
        };
        Self { path, entries }
    }

    /// Looks up an entry.
    pub fn get(&self, key: &str) -> Option<&E> {
        self.entries.get(key)
    }

    /// Adds or replaces the entry stored under its own key.
    pub fn insert(&mut self, entry: E) {
        self.entries.insert(entry.cache_key().to_owned(), entry);
    }

    /// Drops an entry.
    pub fn remove(&mut self, key: &str) -> Option<E> {
        self.entries.shift_remove(key)
    }

    /// Iterates the live entries.
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.entries.values()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the index holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Atomically persists the index to its backing file.
    pub fn flush(&self) -> std::io::Result<()> {
        let dir = self
            .path
            .parent()
            .expect("index file always lives in a directory");
        fs_err::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, &self.entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(())
    }
}
