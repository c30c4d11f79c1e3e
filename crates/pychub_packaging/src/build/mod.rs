//! The build lifecycle: audit events, the [`BuildPlan`] accumulator, the per-invocation
//! [`PackagingContext`], and the orchestrator that drives INIT and PLAN.

mod audit;
mod context;
mod orchestrator;
mod plan;

pub use audit::{
    default_sinks, AnnotationType, AuditLog, AuditSink, BuildEvent, EventType, LevelType,
    ParseAuditSinkError, StageType, AUDIT_LOG_FILENAME,
};
pub use context::PackagingContext;
pub use orchestrator::{run, run_with_selector, BuildError, BuildOptions, BuildOutcome};
pub use plan::{
    BuildPlan, IncludeEntry, InstallScripts, BUILDPLAN_FILENAME, CHUBPROJECT_FILENAME,
    META_FILENAME, STAGING_SUBDIRS,
};
