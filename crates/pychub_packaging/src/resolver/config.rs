use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The artifact kind a strategy or resolver handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyType {
    /// Per-(wheel, context) dependency metadata.
    DependencyMetadata,
    /// Project-wide candidate metadata (the PEP 691 page).
    CandidateMetadata,
    /// The wheel bytes themselves.
    WheelFile,
    /// Not yet classified.
    Unspecified,
}

/// How a strategy's failure propagates. Imperative strategies re-raise; everything else is
/// swallowed so the resolver can fall through to the next strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyCriticality {
    /// Failure aborts the whole resolve.
    Imperative,
    /// Needed for a complete plan, but the resolver may satisfy it another way.
    Required,
    /// Best effort.
    Optional,
}

/// The frozen per-strategy value object: identity, ordering and failure policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Registry name of the strategy.
    pub name: String,

    /// Fully qualified name of the implementing type.
    pub fqcn: String,

    /// Smaller runs earlier.
    pub precedence: u32,

    /// Network fetch budget in seconds.
    pub fetch_timeout_s: u64,

    /// Failure propagation policy.
    pub criticality: StrategyCriticality,

    /// The artifact kind this strategy produces.
    pub strategy_type: StrategyType,

    /// Free-form discriminator within the kind.
    pub strategy_subtype: String,
}

impl StrategyConfig {
    /// Builds a config with the shared defaults (`precedence` 50, 20 second fetch budget,
    /// optional criticality).
    pub fn new(
        name: &str,
        fqcn: &str,
        strategy_type: StrategyType,
        strategy_subtype: &str,
    ) -> Self {
        Self {
            name: name.to_owned(),
            fqcn: fqcn.to_owned(),
            precedence: 50,
            fetch_timeout_s: 20,
            criticality: StrategyCriticality::Optional,
            strategy_type,
            strategy_subtype: strategy_subtype.to_owned(),
        }
    }

    /// Overrides the precedence.
    pub fn with_precedence(mut self, precedence: u32) -> Self {
        self.precedence = precedence;
        self
    }

    /// Overrides the criticality.
    pub fn with_criticality(mut self, criticality: StrategyCriticality) -> Self {
        self.criticality = criticality;
        self
    }

    /// The fetch budget as a [`Duration`].
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_s)
    }
}

/// Shared configuration of an artifact resolver: where its caches live and how long entries stay
/// fresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Per-project staging root.
    pub local_cache_root: PathBuf,

    /// Machine-wide cache root.
    pub global_cache_root: PathBuf,

    /// Refresh interval in minutes; zero disables expiry entirely.
    pub update_interval: u64,

    /// When true the resolver stores artifacts under the local root.
    pub project_isolation: bool,

    /// When true the resolver wipes its local artifact directory at startup.
    pub clear_on_startup: bool,
}

impl ResolverConfig {
    /// Defaults for wheel resolution. Wheel bytes are immutable, so entries never expire.
    pub fn for_wheels(local_cache_root: PathBuf, global_cache_root: PathBuf) -> Self {
        Self {
            local_cache_root,
            global_cache_root,
            update_interval: 0,
            project_isolation: true,
            clear_on_startup: false,
        }
    }

    /// Defaults for metadata resolution: a one-day refresh interval.
    pub fn for_metadata(local_cache_root: PathBuf, global_cache_root: PathBuf) -> Self {
        Self {
            local_cache_root,
            global_cache_root,
            update_interval: 1440,
            project_isolation: true,
            clear_on_startup: false,
        }
    }

    /// Overrides the refresh interval, in minutes.
    pub fn with_update_interval(mut self, minutes: u64) -> Self {
        self.update_interval = minutes;
        self
    }

    /// Disables project isolation so artifacts land under the global root.
    pub fn with_project_isolation(mut self, project_isolation: bool) -> Self {
        self.project_isolation = project_isolation;
        self
    }

    /// Requests a wipe of the local artifact directory at startup.
    pub fn with_clear_on_startup(mut self, clear_on_startup: bool) -> Self {
        self.clear_on_startup = clear_on_startup;
        self
    }

    /// The root the resolver actually writes under, per the isolation flag.
    pub fn cache_root(&self) -> &Path {
        if self.project_isolation {
            &self.local_cache_root
        } else {
            &self.global_cache_root
        }
    }

    /// The expiry horizon, or `None` when entries never expire.
    pub fn expiration_delta(&self) -> Option<chrono::Duration> {
        (self.update_interval > 0).then(|| chrono::Duration::minutes(self.update_interval as i64))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cache_root_follows_isolation() {
        let config = ResolverConfig::for_wheels("/local".into(), "/global".into());
        assert_eq!(config.cache_root(), Path::new("/local"));

        let config = config.with_project_isolation(false);
        assert_eq!(config.cache_root(), Path::new("/global"));
    }

    #[test]
    fn test_wheels_never_expire_by_default() {
        let config = ResolverConfig::for_wheels("/l".into(), "/g".into());
        assert_eq!(config.expiration_delta(), None);

        let config = ResolverConfig::for_metadata("/l".into(), "/g".into());
        assert_eq!(config.expiration_delta(), Some(chrono::Duration::minutes(1440)));
    }

    #[test]
    fn test_strategy_type_wire_format() {
        let json = serde_json::to_string(&StrategyType::DependencyMetadata).unwrap();
        assert_eq!(json, "\"DEPENDENCY_METADATA\"");
        let json = serde_json::to_string(&StrategyCriticality::Imperative).unwrap();
        assert_eq!(json, "\"IMPERATIVE\"");
    }
}
