//! pychub_packaging bundles a primary Python wheel together with its transitive dependency
//! closure and auxiliary assets into a single self-describing "chub" archive. This crate is the
//! build-plan core: the compatibility evaluator that decides which (interpreter, abi, platform)
//! triples a wheel set supports, and the artifact resolution engine that materializes wheels and
//! their metadata from filesystem and index sources behind pluggable, cached strategies.
//! Final archive assembly and entry-point execution are deliberately out of scope.

#![deny(missing_docs)]

pub mod build;
pub mod compat;
pub mod project;
pub mod resolve;
pub mod resolver;
pub mod tags;
pub mod types;

pub use build::{run, BuildError, BuildOptions, BuildPlan};
pub use compat::CompatibilitySpec;
pub use pep440_rs::{Version, VersionSpecifier, VersionSpecifiers};
pub use pep508_rs::{MarkerEnvironment, Requirement};
pub use types::{NormalizedPackageName, PackageName, WheelKey};
