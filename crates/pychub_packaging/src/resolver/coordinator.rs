use super::cache::{
    candidate_metadata_cache_key, compute_hash_and_size, dependency_metadata_cache_key,
    now_second_precision, CacheEntry, CacheIndex, MetadataCacheEntry, WheelCacheEntry,
    HASH_ALGORITHM,
};
use super::config::{ResolverConfig, StrategyCriticality, StrategyType};
use super::strategy::{ResolveRequest, ResolveStrategy, StrategyError, StrategyOutcome};
use crate::compat::{CompatibilitySpec, NotRealizedError};
use crate::resolve::ResolutionContext;
use crate::tags::{choose_wheel_tag, ChooseWheelTagError, WheelTag};
use crate::types::{wheel_filename_from_uri, WheelKey};
use miette::Diagnostic;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// Failures of the resolver coordinator itself. A request that simply could not be satisfied is
/// `Ok(None)`, not an error; the caller decides whether that is fatal.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum ResolverError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("uri '{0}' does not name a wheel file")]
    NotAWheelUri(Url),

    #[error(transparent)]
    ChooseTag(#[from] ChooseWheelTagError),

    #[error(transparent)]
    NotRealized(#[from] NotRealizedError),

    #[error("dependency metadata requires an active resolution context")]
    NoActiveResolutionContext,

    #[error("imperative strategy '{name}' failed")]
    ImperativeStrategyFailed {
        name: String,
        #[source]
        source: StrategyError,
    },
}

/// Grants at most one concurrent `resolve` per cache key. Racing callers for the same key line up
/// here; callers for different keys proceed in parallel.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .entry(key.to_owned())
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

fn prepare_artifact_dir(config: &ResolverConfig, subdir: &str) -> std::io::Result<PathBuf> {
    let dir = config.cache_root().join(subdir);
    if config.clear_on_startup && config.local_cache_root.join(subdir).exists() {
        // Only the local directory is ever wiped; the global cache is shared state.
        fs_err::remove_dir_all(config.local_cache_root.join(subdir))?;
    }
    fs_err::create_dir_all(&dir)?;
    Ok(dir)
}

/// Runs the ordered strategies until one produces a file. Errors from imperative strategies
/// propagate; everything else is logged and skipped.
async fn run_strategies(
    strategies: &[Box<dyn ResolveStrategy>],
    dest_dir: &Path,
    request: ResolveRequest<'_>,
) -> Result<Option<(StrategyOutcome, String)>, ResolverError> {
    for strategy in strategies {
        let config = strategy.config();
        match strategy.resolve(dest_dir, request).await {
            Ok(Some(outcome)) => {
                tracing::debug!(strategy = %config.name, path = %outcome.path.display(), "strategy resolved artifact");
                return Ok(Some((outcome, config.name.clone())));
            }
            Ok(None) => continue,
            Err(err) if config.criticality == StrategyCriticality::Imperative => {
                return Err(ResolverError::ImperativeStrategyFailed {
                    name: config.name.clone(),
                    source: err,
                });
            }
            Err(err) => {
                tracing::warn!(strategy = %config.name, error = %err, "strategy failed, falling through");
                continue;
            }
        }
    }
    Ok(None)
}

fn sort_strategies(mut strategies: Vec<Box<dyn ResolveStrategy>>) -> Vec<Box<dyn ResolveStrategy>> {
    strategies.sort_by_key(|s| s.config().precedence);
    strategies
}

/// Checks a cache hit: present file, matching hash, unexpired. A missing file or a hash mismatch
/// invalidates the entry so the caller refetches.
fn entry_is_live<E: CacheEntry>(entry: &E) -> bool {
    if !entry.path().exists() {
        tracing::debug!(key = entry.cache_key(), "cached file disappeared, refetching");
        return false;
    }
    match compute_hash_and_size(entry.path()) {
        Ok((hash, _)) if &hash == entry.hash() => {}
        Ok(_) => {
            tracing::warn!(
                key = entry.cache_key(),
                "cached file no longer matches its recorded hash, refetching"
            );
            return false;
        }
        Err(err) => {
            tracing::warn!(key = entry.cache_key(), error = %err, "cached file unreadable, refetching");
            return false;
        }
    }
    entry
        .expiration()
        .map_or(true, |expiration| expiration > now_second_precision())
}

/// Resolves wheel files to disk and caches them under
/// `{cache_root}/wheels/`, keyed by `{canonical_name}-{version}-{chosen_tag}`.
pub struct WheelResolver {
    config: ResolverConfig,
    strategies: Vec<Box<dyn ResolveStrategy>>,
    destination_dir: PathBuf,
    index: Mutex<CacheIndex<WheelCacheEntry>>,
    key_locks: KeyedLocks,
}

impl WheelResolver {
    /// Creates the resolver, preparing its artifact directory and loading its persisted index.
    pub fn new(
        config: ResolverConfig,
        strategies: Vec<Box<dyn ResolveStrategy>>,
    ) -> std::io::Result<Self> {
        let destination_dir = prepare_artifact_dir(&config, "wheels")?;
        let index = CacheIndex::load_or_default(destination_dir.join(".wheel_index.json"));
        Ok(Self {
            config,
            strategies: sort_strategies(strategies),
            destination_dir,
            index: Mutex::new(index),
            key_locks: KeyedLocks::default(),
        })
    }

    /// The directory resolved wheels land in.
    pub fn destination_dir(&self) -> &Path {
        &self.destination_dir
    }

    /// The resolver configuration.
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Derives the cache key for a wheel URI: parse the filename, choose the best compatible tag,
    /// and join `{canonical_name}-{version}-{chosen_tag}`.
    fn cache_key_for(
        &self,
        uri: &Url,
        spec: &CompatibilitySpec,
    ) -> Result<(String, WheelKey, WheelTag), ResolverError> {
        let filename = wheel_filename_from_uri(uri)
            .ok_or_else(|| ResolverError::NotAWheelUri(uri.clone()))?;
        let wheel_key = WheelKey::from_uri(uri)
            .map_err(|_| ResolverError::NotAWheelUri(uri.clone()))?;
        let chosen = choose_wheel_tag(&filename, &wheel_key, spec)?;
        let cache_key = format!("{}-{}-{}", wheel_key.name, wheel_key.version, chosen);
        Ok((cache_key, wheel_key, chosen))
    }

    /// Resolves the wheel at `uri`, consulting the cache first and falling through the strategies
    /// in precedence order. `Ok(None)` means no strategy could produce the wheel.
    pub async fn resolve(
        &self,
        spec: &CompatibilitySpec,
        uri: &Url,
        wheel_key: Option<&WheelKey>,
        force_refresh: bool,
    ) -> Result<Option<WheelCacheEntry>, ResolverError> {
        let (cache_key, derived_key, chosen_tag) = self.cache_key_for(uri, spec)?;
        let _guard = self.key_locks.acquire(&cache_key).await;

        if !force_refresh {
            let hit = {
                let index = self.index.lock();
                index.get(&cache_key).cloned()
            };
            if let Some(entry) = hit {
                if entry_is_live(&entry) {
                    tracing::debug!(key = %cache_key, "wheel cache hit");
                    return Ok(Some(entry));
                }
                self.index.lock().remove(&cache_key);
            }
        }

        let request = ResolveRequest {
            uri: Some(uri),
            wheel_key,
            spec,
            context: None,
        };
        let Some((outcome, _)) =
            run_strategies(&self.strategies, &self.destination_dir, request).await?
        else {
            return Ok(None);
        };

        let (hash, size_bytes) = compute_hash_and_size(&outcome.path)?;
        let now = now_second_precision();
        let entry = WheelCacheEntry {
            key: cache_key.clone(),
            path: outcome.path,
            origin_uri: uri.to_string(),
            wheel_key: wheel_key.cloned().unwrap_or(derived_key),
            compatibility_tag: chosen_tag,
            hash_algorithm: HASH_ALGORITHM.into(),
            hash,
            size_bytes,
            timestamp: now,
            expiration: self.config.expiration_delta().map(|delta| now + delta),
        };

        let mut index = self.index.lock();
        index.insert(entry.clone());
        index.flush()?;
        Ok(Some(entry))
    }

    /// Persists the index. Also called implicitly after every successful resolve.
    pub fn flush(&self) -> std::io::Result<()> {
        self.index.lock().flush()
    }

    /// A snapshot of the live cache entries.
    pub fn cached_entries(&self) -> Vec<WheelCacheEntry> {
        self.index.lock().iter().cloned().collect()
    }
}

/// Resolves metadata documents (candidate or dependency, per its configured kind) and caches them
/// under `{cache_root}/metadata/`.
pub struct MetadataResolver {
    config: ResolverConfig,
    metadata_type: StrategyType,
    strategies: Vec<Box<dyn ResolveStrategy>>,
    destination_dir: PathBuf,
    index: Mutex<CacheIndex<MetadataCacheEntry>>,
    key_locks: KeyedLocks,
}

impl MetadataResolver {
    /// A resolver for project-wide candidate metadata (PEP 691 pages).
    pub fn candidate(
        config: ResolverConfig,
        strategies: Vec<Box<dyn ResolveStrategy>>,
    ) -> std::io::Result<Self> {
        Self::new(config, StrategyType::CandidateMetadata, strategies)
    }

    /// A resolver for per-(wheel, context) dependency metadata.
    pub fn dependency(
        config: ResolverConfig,
        strategies: Vec<Box<dyn ResolveStrategy>>,
    ) -> std::io::Result<Self> {
        Self::new(config, StrategyType::DependencyMetadata, strategies)
    }

    fn new(
        config: ResolverConfig,
        metadata_type: StrategyType,
        strategies: Vec<Box<dyn ResolveStrategy>>,
    ) -> std::io::Result<Self> {
        let destination_dir = prepare_artifact_dir(&config, "metadata")?;
        let index_name = match metadata_type {
            StrategyType::CandidateMetadata => ".candidate_index.json",
            _ => ".metadata_index.json",
        };
        let index = CacheIndex::load_or_default(destination_dir.join(index_name));
        Ok(Self {
            config,
            metadata_type,
            strategies: sort_strategies(strategies),
            destination_dir,
            index: Mutex::new(index),
            key_locks: KeyedLocks::default(),
        })
    }

    /// The directory resolved metadata lands in.
    pub fn destination_dir(&self) -> &Path {
        &self.destination_dir
    }

    /// The kind of metadata this resolver produces.
    pub fn metadata_type(&self) -> StrategyType {
        self.metadata_type
    }

    fn cache_key_for(
        &self,
        wheel_key: &WheelKey,
        context: Option<&ResolutionContext>,
    ) -> Result<String, ResolverError> {
        match self.metadata_type {
            StrategyType::DependencyMetadata => {
                let context = context.ok_or(ResolverError::NoActiveResolutionContext)?;
                Ok(dependency_metadata_cache_key(wheel_key, context))
            }
            _ => Ok(candidate_metadata_cache_key(wheel_key)),
        }
    }

    /// Resolves the metadata document for `wheel_key`, consulting the cache first. `Ok(None)`
    /// means no strategy could produce it.
    pub async fn resolve(
        &self,
        spec: &CompatibilitySpec,
        wheel_key: &WheelKey,
        uri: Option<&Url>,
        context: Option<&ResolutionContext>,
        force_refresh: bool,
    ) -> Result<Option<MetadataCacheEntry>, ResolverError> {
        let cache_key = self.cache_key_for(wheel_key, context)?;
        let _guard = self.key_locks.acquire(&cache_key).await;

        if !force_refresh {
            let hit = {
                let index = self.index.lock();
                index.get(&cache_key).cloned()
            };
            if let Some(entry) = hit {
                if entry_is_live(&entry) {
                    tracing::debug!(key = %cache_key, "metadata cache hit");
                    return Ok(Some(entry));
                }
                self.index.lock().remove(&cache_key);
            }
        }

        let request = ResolveRequest {
            uri,
            wheel_key: Some(wheel_key),
            spec,
            context,
        };
        let Some((outcome, strategy_name)) =
            run_strategies(&self.strategies, &self.destination_dir, request).await?
        else {
            return Ok(None);
        };

        let (hash, size_bytes) = compute_hash_and_size(&outcome.path)?;
        let now = now_second_precision();
        let entry = MetadataCacheEntry {
            key: cache_key.clone(),
            path: outcome.path,
            origin_uri: outcome
                .origin_uri
                .unwrap_or_else(|| format!("strategy:{strategy_name}")),
            metadata_type: self.metadata_type,
            hash_algorithm: HASH_ALGORITHM.into(),
            hash,
            size_bytes,
            timestamp: now,
            expiration: self.config.expiration_delta().map(|delta| now + delta),
        };

        let mut index = self.index.lock();
        index.insert(entry.clone());
        index.flush()?;
        Ok(Some(entry))
    }

    /// Persists the index. Also called implicitly after every successful resolve.
    pub fn flush(&self) -> std::io::Result<()> {
        self.index.lock().flush()
    }

    /// A snapshot of the live cache entries.
    pub fn cached_entries(&self) -> Vec<MetadataCacheEntry> {
        self.index.lock().iter().cloned().collect()
    }
}
