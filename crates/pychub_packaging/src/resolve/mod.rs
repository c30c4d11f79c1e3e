//! The compatibility resolution pipeline: per-context resolution state and the dependency-graph
//! walk that grows the node set to fixpoint by querying the dependency-metadata resolver.

mod context;
mod graph;

pub use context::{
    ParseContextKeyError, ReasonKind, ResolutionContext, ResolutionContextResult, ResolutionStatus,
};
pub use graph::{
    CompatibilityResolution, DependencyGraphBuilder, DependencyGraphError, PinnedVersionSelector,
    ResolvedWheelNode, TopologyError, VersionSelector,
};
