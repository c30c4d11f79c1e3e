//! Artifact resolution and caching: content-addressed, TTL-expiring caches fed by an ordered,
//! criticality-tagged sequence of resolution strategies. One resolver instance exists per artifact
//! kind (wheel files, candidate metadata, dependency metadata); each exclusively owns its
//! persisted [`CacheIndex`].

mod cache;
mod config;
mod coordinator;
mod metadata_strategies;
mod strategy;
mod wheel_strategies;

pub use cache::{
    candidate_metadata_cache_key, compute_hash_and_size, dependency_metadata_cache_key,
    now_second_precision, CacheEntry, CacheIndex, MetadataCacheEntry, WheelCacheEntry,
    HASH_ALGORITHM,
};
pub use config::{ResolverConfig, StrategyConfig, StrategyCriticality, StrategyType};
pub use coordinator::{MetadataResolver, ResolverError, WheelResolver};
pub use metadata_strategies::{
    Pep658SidecarMetadataStrategy, Pep691SimpleApiMetadataStrategy,
    WheelInspectionMetadataStrategy,
};
pub use strategy::{
    copy_file_atomic, download_to_file, write_bytes_atomic, ResolveRequest, ResolveStrategy,
    StrategyError, StrategyOutcome,
};
pub use wheel_strategies::{FilesystemWheelStrategy, HttpWheelStrategy};
