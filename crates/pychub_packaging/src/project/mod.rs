//! The project layer: the normalized [`ChubProject`] model parsed from the accepted TOML shapes,
//! the effective-compatibility-spec assembly, and path-dependency discovery.

mod model;
mod path_deps;
mod spec_loader;

pub use model::{
    select_package_table, ChubProject, ChubProjectError, OperationKind, ProvenanceEvent,
    SourceKind,
};
pub use path_deps::{
    collect_path_dependencies, collect_path_dependency_wheels, default_path_strategies,
    DefaultPathStrategy, HatchPathStrategy, PathDependencyError, PdmPathStrategy,
    PoetryPathStrategy, ProjectPathStrategy,
};
pub use spec_loader::{load_compatibility_spec, CombineStrategy, SpecLoadError};
