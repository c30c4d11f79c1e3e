use super::context::ResolutionContext;
use crate::compat::CompatibilitySpec;
use crate::resolver::{MetadataResolver, ResolverError};
use crate::types::{DistMetadata, NormalizedPackageName, Requirement, WheelKey};
use async_trait::async_trait;
use indexmap::IndexMap;
use miette::Diagnostic;
use pep440_rs::VersionSpecifiers;
use pep508_rs::VersionOrUrl;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::str::FromStr;
use thiserror::Error;
use url::Url;

/// Minimal compatibility and download information for one resolved `(name, version)` node of the
/// dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedWheelNode {
    /// Canonical distribution name.
    pub name: NormalizedPackageName,

    /// Normalized version.
    pub version: String,

    /// The node's `Requires-Python` band, empty when it declares none.
    #[serde(default)]
    pub requires_python: String,

    /// Raw `Requires-Dist` strings that survived marker pruning, across all contexts.
    #[serde(default)]
    pub requires_dist: BTreeSet<String>,

    /// Edges to other nodes of the graph.
    #[serde(default)]
    pub dependencies: BTreeSet<WheelKey>,

    /// Compatibility tag to download URL, when the index provided one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_urls: Option<BTreeMap<String, String>>,
}

impl ResolvedWheelNode {
    /// The identity of this node.
    pub fn key(&self) -> WheelKey {
        WheelKey::from_parts(self.name.clone(), &self.version)
    }

    /// The tags this node has URLs for, sorted.
    pub fn compatible_tags(&self) -> Vec<String> {
        self.tag_urls
            .as_ref()
            .map(|urls| urls.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// The result of resolving a dependency tree against a compatibility spec: the requested roots
/// and every node they transitively pulled in. Construction validates the topology — every root
/// is a node and every dependency edge lands on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawCompatibilityResolution", into = "RawCompatibilityResolution")]
pub struct CompatibilityResolution {
    /// The python band the whole graph supports.
    pub supported_python_band: VersionSpecifiers,

    roots: BTreeSet<WheelKey>,
    nodes: IndexMap<WheelKey, ResolvedWheelNode>,
}

/// A topology violation found while constructing a [`CompatibilityResolution`].
#[derive(Debug, Clone, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum TopologyError {
    #[error("root nodes without metadata: {0:?}")]
    MissingRoots(Vec<String>),

    #[error("dependencies refer to missing nodes: {0:?}")]
    MissingDependencies(Vec<String>),
}

impl CompatibilityResolution {
    /// Builds and validates a resolution.
    pub fn new(
        supported_python_band: VersionSpecifiers,
        roots: BTreeSet<WheelKey>,
        nodes: IndexMap<WheelKey, ResolvedWheelNode>,
    ) -> Result<Self, TopologyError> {
        let missing_roots: Vec<String> = roots
            .iter()
            .filter(|root| !nodes.contains_key(*root))
            .map(ToString::to_string)
            .collect();
        if !missing_roots.is_empty() {
            return Err(TopologyError::MissingRoots(missing_roots));
        }

        let mut missing_deps = BTreeSet::new();
        for node in nodes.values() {
            for dep in &node.dependencies {
                if !nodes.contains_key(dep) {
                    missing_deps.insert(dep.to_string());
                }
            }
        }
        if !missing_deps.is_empty() {
            return Err(TopologyError::MissingDependencies(
                missing_deps.into_iter().collect(),
            ));
        }

        Ok(Self {
            supported_python_band,
            roots,
            nodes,
        })
    }

    /// The requested roots, sorted.
    pub fn roots(&self) -> impl Iterator<Item = &WheelKey> {
        self.roots.iter()
    }

    /// Every node of the graph.
    pub fn nodes(&self) -> &IndexMap<WheelKey, ResolvedWheelNode> {
        &self.nodes
    }
}

#[derive(Serialize, Deserialize)]
struct RawCompatibilityResolution {
    supported_python_band: String,
    roots: Vec<WheelKey>,
    nodes: BTreeMap<String, ResolvedWheelNode>,
}

impl TryFrom<RawCompatibilityResolution> for CompatibilityResolution {
    type Error = String;

    fn try_from(raw: RawCompatibilityResolution) -> Result<Self, Self::Error> {
        let band = VersionSpecifiers::from_str(&raw.supported_python_band)
            .map_err(|e| e.to_string())?;
        let nodes = raw
            .nodes
            .into_values()
            .map(|node| (node.key(), node))
            .collect();
        CompatibilityResolution::new(band, raw.roots.into_iter().collect(), nodes)
            .map_err(|e| e.to_string())
    }
}

impl From<CompatibilityResolution> for RawCompatibilityResolution {
    fn from(resolution: CompatibilityResolution) -> Self {
        Self {
            supported_python_band: resolution.supported_python_band.to_string(),
            roots: resolution.roots.into_iter().collect(),
            nodes: resolution
                .nodes
                .into_iter()
                .map(|(key, node)| (key.requirement_str(), node))
                .collect(),
        }
    }
}

/// The external dependency-selection contract: given a pruned requirement, name the exact
/// `(name, version)` that satisfies it. Conflict resolution between requirements is this
/// collaborator's problem; the pipeline only walks whatever it pins.
#[async_trait]
pub trait VersionSelector: Send + Sync {
    /// Pins a requirement to a concrete key, or `None` when it cannot.
    async fn select(&self, requirement: &Requirement) -> Option<WheelKey>;
}

/// Selects only requirements that already carry an exact `==` pin. Everything else is declined,
/// which the pipeline reports as an unresolvable requirement.
#[derive(Default)]
pub struct PinnedVersionSelector;

#[async_trait]
impl VersionSelector for PinnedVersionSelector {
    async fn select(&self, requirement: &Requirement) -> Option<WheelKey> {
        let VersionOrUrl::VersionSpecifier(specifiers) = requirement.version_or_url.as_ref()?
        else {
            return None;
        };
        let mut exact = specifiers.iter().filter_map(|spec| {
            (spec.operator() == &pep440_rs::Operator::Equal).then(|| spec.version().clone())
        });
        let version = exact.next()?;
        WheelKey::new(&requirement.name, &version.to_string()).ok()
    }
}

/// Failures of the dependency-graph walk.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum DependencyGraphError {
    #[error("no dependency metadata could be resolved for {0}")]
    MetadataUnavailable(String),

    #[error("requirement '{requirement}' of {parent} could not be pinned to a version")]
    UnresolvableRequirement { parent: String, requirement: String },

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("cached metadata for {key} is unreadable: {reason}")]
    UnreadableMetadata { key: String, reason: String },

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Walks the dependency graph to fixpoint: starting from the roots, resolve each key's dependency
/// metadata, prune `Requires-Dist` by each context's environment markers, pin the survivors
/// through the [`VersionSelector`], and enqueue unseen keys until nothing new appears.
pub struct DependencyGraphBuilder<'a> {
    spec: &'a CompatibilitySpec,
    dependency_resolver: &'a MetadataResolver,
    selector: &'a dyn VersionSelector,
    contexts: &'a [ResolutionContext],
    known_uris: HashMap<WheelKey, Url>,
}

impl<'a> DependencyGraphBuilder<'a> {
    /// A builder over the given resolver, selector and contexts.
    pub fn new(
        spec: &'a CompatibilitySpec,
        dependency_resolver: &'a MetadataResolver,
        selector: &'a dyn VersionSelector,
        contexts: &'a [ResolutionContext],
    ) -> Self {
        Self {
            spec,
            dependency_resolver,
            selector,
            contexts,
            known_uris: HashMap::new(),
        }
    }

    /// Registers wheel locations that are already known (e.g. local path dependencies or
    /// explicit wheel files), sparing the resolver an index round trip for those keys.
    pub fn with_known_uris(mut self, uris: HashMap<WheelKey, Url>) -> Self {
        self.known_uris = uris;
        self
    }

    async fn read_metadata(
        &self,
        key: &WheelKey,
        context: &ResolutionContext,
    ) -> Result<Option<DistMetadata>, DependencyGraphError> {
        let Some(entry) = self
            .dependency_resolver
            .resolve(self.spec, key, self.known_uris.get(key), Some(context), false)
            .await?
        else {
            return Ok(None);
        };
        let bytes = fs_err::read(&entry.path)?;
        DistMetadata::try_from(bytes.as_slice())
            .map(Some)
            .map_err(|e| DependencyGraphError::UnreadableMetadata {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    /// Runs the walk and returns the validated resolution.
    pub async fn build(
        &self,
        roots: &[WheelKey],
    ) -> Result<CompatibilityResolution, DependencyGraphError> {
        let mut queue: VecDeque<WheelKey> = roots.iter().cloned().collect();
        let mut nodes: IndexMap<WheelKey, ResolvedWheelNode> = IndexMap::new();

        while let Some(key) = queue.pop_front() {
            if nodes.contains_key(&key) {
                continue;
            }

            let mut requires_python = String::new();
            let mut requires_dist: BTreeSet<String> = BTreeSet::new();
            let mut dependencies: BTreeSet<WheelKey> = BTreeSet::new();
            let mut any_metadata = false;

            for context in self.contexts {
                let Some(metadata) = self.read_metadata(&key, context).await? else {
                    continue;
                };
                any_metadata = true;

                if requires_python.is_empty() {
                    if let Some(band) = &metadata.requires_python {
                        requires_python = band.to_string();
                    }
                }

                let env = context.marker_environment();
                for requirement in &metadata.requires_dist {
                    let applies = requirement
                        .marker
                        .as_ref()
                        .map_or(true, |marker| marker.evaluate(&env, &[]));
                    if !applies {
                        continue;
                    }
                    requires_dist.insert(requirement.to_string());

                    let Some(child) = self.selector.select(requirement).await else {
                        return Err(DependencyGraphError::UnresolvableRequirement {
                            parent: key.to_string(),
                            requirement: requirement.to_string(),
                        });
                    };
                    if !nodes.contains_key(&child) {
                        queue.push_back(child.clone());
                    }
                    dependencies.insert(child);
                }
            }

            if !any_metadata {
                return Err(DependencyGraphError::MetadataUnavailable(key.to_string()));
            }

            tracing::debug!(
                key = %key,
                dependencies = dependencies.len(),
                "resolved dependency node"
            );
            nodes.insert(
                key.clone(),
                ResolvedWheelNode {
                    name: key.name.clone(),
                    version: key.version.clone(),
                    requires_python,
                    requires_dist,
                    dependencies,
                    tag_urls: None,
                },
            );
        }

        Ok(CompatibilityResolution::new(
            self.spec.supported_python_band(),
            roots.iter().cloned().collect(),
            nodes,
        )?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(name: &str, version: &str) -> WheelKey {
        WheelKey::new(name, version).unwrap()
    }

    fn node(name: &str, version: &str, deps: &[WheelKey]) -> ResolvedWheelNode {
        ResolvedWheelNode {
            name: name.parse().unwrap(),
            version: version.to_owned(),
            requires_python: ">=3.10".into(),
            requires_dist: BTreeSet::new(),
            dependencies: deps.iter().cloned().collect(),
            tag_urls: None,
        }
    }

    fn band() -> VersionSpecifiers {
        VersionSpecifiers::from_str(">=3.10,<3.13").unwrap()
    }

    #[test]
    fn test_topology_accepts_closed_graph() {
        let root = key("app", "1.0");
        let dep = key("lib", "2.0");
        let mut nodes = IndexMap::new();
        nodes.insert(root.clone(), node("app", "1.0", &[dep.clone()]));
        nodes.insert(dep.clone(), node("lib", "2.0", &[]));

        let resolution =
            CompatibilityResolution::new(band(), BTreeSet::from([root.clone()]), nodes).unwrap();
        assert_eq!(resolution.roots().collect::<Vec<_>>(), vec![&root]);
        assert_eq!(resolution.nodes().len(), 2);
    }

    #[test]
    fn test_topology_rejects_missing_root() {
        let result = CompatibilityResolution::new(
            band(),
            BTreeSet::from([key("app", "1.0")]),
            IndexMap::new(),
        );
        assert!(matches!(result, Err(TopologyError::MissingRoots(_))));
    }

    #[test]
    fn test_topology_rejects_dangling_dependency() {
        let root = key("app", "1.0");
        let mut nodes = IndexMap::new();
        nodes.insert(root.clone(), node("app", "1.0", &[key("ghost", "9.9")]));

        let result = CompatibilityResolution::new(band(), BTreeSet::from([root]), nodes);
        assert!(matches!(result, Err(TopologyError::MissingDependencies(_))));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let root = key("app", "1.0");
        let dep = key("lib", "2.0");
        let mut nodes = IndexMap::new();
        nodes.insert(root.clone(), node("app", "1.0", &[dep.clone()]));
        nodes.insert(dep, node("lib", "2.0", &[]));
        let resolution =
            CompatibilityResolution::new(band(), BTreeSet::from([root]), nodes).unwrap();

        let json = serde_json::to_string(&resolution).unwrap();
        assert!(json.contains("app==1.0"));
        let back: CompatibilityResolution = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nodes().len(), 2);
        assert_eq!(back.supported_python_band.to_string(), band().to_string());
    }

    #[tokio::test]
    async fn test_pinned_selector() {
        let selector = PinnedVersionSelector;
        let pinned = Requirement::from_str("lib==2.0").unwrap();
        assert_eq!(selector.select(&pinned).await, Some(key("lib", "2.0")));

        let ranged = Requirement::from_str("lib>=1.0").unwrap();
        assert_eq!(selector.select(&ranged).await, None);

        let bare = Requirement::from_str("lib").unwrap();
        assert_eq!(selector.select(&bare).await, None);
    }
}
