//! The build orchestrator: drives the lifecycle through INIT and PLAN, owns the audit log and the
//! packaging context, and guarantees the audit log reaches disk on every exit path.

use super::audit::{default_sinks, AuditSink, BuildEvent, EventType, LevelType, StageType};
use super::context::PackagingContext;
use super::plan::{BuildPlan, CHUBPROJECT_FILENAME, META_FILENAME};
use crate::compat::{
    default_discovery_strategies, discover_python_versions, CompatibilitySpec,
    CompatibilitySpecError, PythonVersionDiscoveryError,
};
use crate::project::{
    collect_path_dependencies, collect_path_dependency_wheels, default_path_strategies,
    load_compatibility_spec, ChubProject, ChubProjectError, PathDependencyError, SourceKind,
    SpecLoadError,
};
use crate::resolve::{
    DependencyGraphBuilder, DependencyGraphError, PinnedVersionSelector, ResolutionContext,
    VersionSelector,
};
use crate::resolver::ResolverError;
use crate::tags::{resolve_uri_for_wheel_key, WheelTag};
use crate::types::{Requirement, Version, WheelKey};
use miette::Diagnostic;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

/// Normalized invocation options, the orchestrator-facing form of the CLI surface.
#[derive(Debug, Default)]
pub struct BuildOptions {
    /// Explicit chubproject file to load.
    pub chubproject: Option<PathBuf>,

    /// Immediate operation: write the normalized project to this path and continue.
    pub chubproject_save: Option<PathBuf>,

    /// Immediate operation: analyze the compatibility spec and exit.
    pub analyze_compatibility: bool,

    /// Immediate operation: print the version and exit.
    pub show_version: bool,

    /// Dotted table path for `--chubproject-save` output (`"flat"` for the document root).
    pub save_table_path: Option<String>,

    /// Project directory override.
    pub project_path: Option<PathBuf>,

    /// Cache root override; defaults to the user cache directory.
    pub cache_root: Option<PathBuf>,

    /// Custom Simple API base URL.
    pub index_base_url: Option<String>,

    /// CLI options as a package-table overlay merged into the project.
    pub cli_overlay: toml::Table,

    /// Additional audit sinks beyond the staging-directory file.
    pub extra_audit_sinks: Vec<AuditSink>,
}

/// How the lifecycle ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The full plan was produced.
    Planned,
    /// An immediate operation short-circuited after INIT.
    Exit,
}

/// Failures of the build lifecycle.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum BuildError {
    #[error(transparent)]
    Project(#[from] ChubProjectError),

    #[error(transparent)]
    PathDependencies(#[from] PathDependencyError),

    #[error(transparent)]
    SpecLoad(#[from] SpecLoadError),

    #[error(transparent)]
    Spec(#[from] CompatibilitySpecError),

    #[error(transparent)]
    Discovery(#[from] PythonVersionDiscoveryError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    Graph(#[from] DependencyGraphError),

    #[error("wheel entry '{entry}' is neither a wheel file nor a pinned requirement")]
    UnresolvableRoot { entry: String },

    #[error("no wheel could be resolved for root {0}")]
    NoWheelForRoot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Runs the build lifecycle with the default pinned-requirement version selector.
pub async fn run(options: BuildOptions) -> Result<BuildPlan, BuildError> {
    run_with_selector(options, &PinnedVersionSelector).await
}

/// Runs the build lifecycle with a caller-provided dependency version selector.
pub async fn run_with_selector(
    options: BuildOptions,
    selector: &dyn VersionSelector,
) -> Result<BuildPlan, BuildError> {
    let cache_root = options
        .cache_root
        .clone()
        .or_else(|| dirs::cache_dir().map(|dir| dir.join("pychub")))
        .unwrap_or_else(|| PathBuf::from(".pychub-cache"));

    let mut plan = BuildPlan::new(cache_root);
    plan.audit_log.push(
        BuildEvent::new(StageType::Lifecycle, EventType::Start)
            .with_message("Starting pychub build"),
    );

    let result = run_stages(&mut plan, &options, selector).await;

    match &result {
        Ok(BuildOutcome::Exit) => plan.audit_log.push(
            BuildEvent::new(StageType::Lifecycle, EventType::Action)
                .with_message("Completed immediate operation and exiting"),
        ),
        Ok(BuildOutcome::Planned) => plan.audit_log.push(
            BuildEvent::new(StageType::Lifecycle, EventType::Complete)
                .with_message("Completed pychub build"),
        ),
        Err(err) => plan.audit_log.push(
            BuildEvent::new(StageType::Lifecycle, EventType::Fail)
                .with_level(LevelType::Error)
                .with_message(err.to_string()),
        ),
    }

    emit_audit_log(&plan, &options.extra_audit_sinks);
    result.map(|_| plan)
}

/// Flushes the audit log to the staging directory (or the cache root when staging was never
/// created) plus any extra sinks. Emission failures are logged, never raised: the audit log must
/// not mask the build result.
fn emit_audit_log(plan: &BuildPlan, extra_sinks: &[AuditSink]) {
    let base_dir = if plan.project_hash.is_empty() {
        plan.cache_root.clone()
    } else {
        plan.project_staging_dir()
    };
    let mut sinks = default_sinks(&base_dir);
    sinks.extend(extra_sinks.iter().cloned());
    if let Err(err) = plan.audit_log.emit(&sinks) {
        tracing::warn!(error = %err, "failed to emit audit log");
    }
}

async fn run_stages(
    plan: &mut BuildPlan,
    options: &BuildOptions,
    selector: &dyn VersionSelector,
) -> Result<BuildOutcome, BuildError> {
    plan.audit_log
        .push(BuildEvent::new(StageType::Init, EventType::Start));
    let outcome = match init_stage(plan, options).await {
        Ok(outcome) => {
            plan.audit_log
                .push(BuildEvent::new(StageType::Init, EventType::Complete));
            outcome
        }
        Err(err) => {
            plan.audit_log.push(
                BuildEvent::new(StageType::Init, EventType::Fail)
                    .with_level(LevelType::Error)
                    .with_message(err.to_string()),
            );
            return Err(err);
        }
    };

    if outcome == BuildOutcome::Exit {
        return Ok(BuildOutcome::Exit);
    }

    plan.audit_log
        .push(BuildEvent::new(StageType::Plan, EventType::Start));
    match plan_stage(plan, options, selector).await {
        Ok(()) => {
            plan.audit_log
                .push(BuildEvent::new(StageType::Plan, EventType::Complete));
            Ok(BuildOutcome::Planned)
        }
        Err(err) => {
            plan.audit_log.push(
                BuildEvent::new(StageType::Plan, EventType::Fail)
                    .with_level(LevelType::Error)
                    .with_message(err.to_string()),
            );
            Err(err)
        }
    }
}

// ---------------------------------------------------------------------------
// INIT
// ---------------------------------------------------------------------------

async fn init_stage(
    plan: &mut BuildPlan,
    options: &BuildOptions,
) -> Result<BuildOutcome, BuildError> {
    process_options(plan, options)?;
    analyze_path_dependencies(plan)?;
    cache_project(plan)?;
    check_immediate_operations(plan, options).await
}

/// Parse options and normalize the project: an explicit chubproject file is the base layer, CLI
/// options merge on top.
fn process_options(plan: &mut BuildPlan, options: &BuildOptions) -> Result<(), BuildError> {
    let mut project = match &options.chubproject {
        Some(path) => {
            plan.audit_log.push(
                BuildEvent::new(StageType::Init, EventType::Input)
                    .with_substage("process_options")
                    .with_message(format!("Build invoked with chubproject: {}", path.display())),
            );
            ChubProject::from_file(path)?
        }
        None => {
            plan.audit_log.push(
                BuildEvent::new(StageType::Init, EventType::Input)
                    .with_substage("process_options")
                    .with_message("Build will use CLI options"),
            );
            ChubProject::default()
        }
    };

    if !options.cli_overlay.is_empty() {
        project.merge_from_table(&options.cli_overlay, SourceKind::Cli, None);
    }

    if project.project_path.is_none() {
        let fallback = options
            .project_path
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        project.project_path = Some(fallback.display().to_string());
    }
    plan.project_dir = PathBuf::from(project.project_path.as_deref().unwrap_or("."));
    plan.attach_project(project);
    Ok(())
}

/// Discover sibling path-dependency projects and attach their built wheels.
fn analyze_path_dependencies(plan: &mut BuildPlan) -> Result<(), BuildError> {
    let pyproject = plan.project_dir.join("pyproject.toml");
    if !pyproject.is_file() {
        plan.audit_log.push(
            BuildEvent::new(StageType::Init, EventType::Skip)
                .with_substage("analyze_path_dependencies")
                .with_message("No pyproject.toml; skipping path dependency analysis"),
        );
        return Ok(());
    }

    let strategies = default_path_strategies();
    let mut roots = collect_path_dependencies(&pyproject, &strategies)?;
    roots.remove(&plan.project_dir);
    let wheels = collect_path_dependency_wheels(&roots)?;

    plan.audit_log.push(
        BuildEvent::new(StageType::Init, EventType::Discover)
            .with_substage("analyze_path_dependencies")
            .with_message(format!(
                "Found {} path dependency wheel(s) in {} project(s)",
                wheels.len(),
                roots.len()
            )),
    );
    plan.path_dep_wheel_locations.extend(wheels);
    Ok(())
}

/// Hash the normalized project, create the staging layout and persist `chubproject.toml` and
/// `meta.json`.
fn cache_project(plan: &mut BuildPlan) -> Result<(), BuildError> {
    plan.project_hash = plan.project.mapping_hash();
    let staging = plan.ensure_staging_layout()?;

    plan.project
        .save_file(&staging.join(CHUBPROJECT_FILENAME), true)?;
    fs_err::write(
        staging.join(META_FILENAME),
        serde_json::to_string_pretty(&plan.meta_json())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
    )?;

    plan.audit_log.push(
        BuildEvent::new(StageType::Init, EventType::Output)
            .with_substage("cache_project")
            .with_message(format!("Cached project under {}", staging.display())),
    );
    Ok(())
}

async fn check_immediate_operations(
    plan: &mut BuildPlan,
    options: &BuildOptions,
) -> Result<BuildOutcome, BuildError> {
    if options.show_version {
        println!("pychub {}", env!("CARGO_PKG_VERSION"));
        plan.audit_log.push(
            BuildEvent::new(StageType::Init, EventType::Action)
                .with_substage("check_immediate_operations")
                .with_message("Invoked immediate action: version"),
        );
        return Ok(BuildOutcome::Exit);
    }

    if let Some(path) = &options.chubproject_save {
        plan.project
            .save_file_with_table(path, options.save_table_path.as_deref(), true)?;
        plan.audit_log.push(
            BuildEvent::new(StageType::Init, EventType::Action)
                .with_substage("check_immediate_operations")
                .with_message(format!("Saved normalized project to {}", path.display())),
        );
        // Saving is not an exit condition; the build continues.
    }

    if options.analyze_compatibility {
        let spec = realize_spec(plan, StageType::Init).await?;
        println!("compatibility spec ({}):", spec.source_description);
        println!(
            "  python versions: {}",
            plan.resolved_python_versions.join(", ")
        );
        println!(
            "  explicit tags: {}",
            spec.allowed_tags()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        plan.audit_log.push(
            BuildEvent::new(StageType::Init, EventType::Action)
                .with_substage("check_immediate_operations")
                .with_message("Invoked immediate action: analyze compatibility"),
        );
        return Ok(BuildOutcome::Exit);
    }

    Ok(BuildOutcome::Planned)
}

// ---------------------------------------------------------------------------
// PLAN
// ---------------------------------------------------------------------------

async fn plan_stage(
    plan: &mut BuildPlan,
    options: &BuildOptions,
    selector: &dyn VersionSelector,
) -> Result<(), BuildError> {
    // Resolvers first; their cache directories live under the staging dir INIT created.
    let context = PackagingContext::init(
        plan,
        options.index_base_url.as_deref(),
        reqwest::Client::new(),
    )?;
    plan.audit_log.push(
        BuildEvent::new(StageType::Plan, EventType::Resolve)
            .with_substage("init_resolvers")
            .with_message("Initialized wheel and metadata resolvers"),
    );

    let spec = realize_spec(plan, StageType::Plan).await?;
    build_dependency_graph(plan, &context, &spec, selector).await?;

    let staging = plan.project_staging_dir();
    let plan_path = plan.persist(&staging)?;
    plan.audit_log.push(
        BuildEvent::new(StageType::Plan, EventType::Output)
            .with_substage("persist_buildplan")
            .with_message(format!("Persisted build plan to {}", plan_path.display())),
    );

    context.flush()?;
    Ok(())
}

/// Load the effective spec, discover concrete python versions and realize the spec against them.
async fn realize_spec(plan: &mut BuildPlan, stage: StageType) -> Result<CompatibilitySpec, BuildError> {
    let mut spec = load_compatibility_spec(&plan.project, &plan.project_dir)?;

    let strategies = default_discovery_strategies(reqwest::Client::new());
    let versions = discover_python_versions(&spec.python_versions, &strategies).await?;
    spec.realize_python_versions(&versions)?;

    plan.audit_log.push(
        BuildEvent::new(stage, EventType::Resolve)
            .with_substage("resolve_compatibility")
            .with_message(format!("Resolved python versions: {}", versions.join(", ")))
            .with_payload("source", spec.source_description.clone()),
    );
    plan.resolved_python_versions = versions;
    plan.compatibility_spec = Some(spec.clone());
    Ok(spec)
}

/// One resolution context per resolved python version, shaped by the platform block of the spec.
fn contexts_for_spec(spec: &CompatibilitySpec, versions: &[String]) -> Vec<ResolutionContext> {
    let (os_family, arch) = spec
        .platform_values
        .first()
        .map(|(os, os_spec)| {
            (
                os.clone(),
                os_spec
                    .arches
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "x86_64".to_owned()),
            )
        })
        .unwrap_or_else(|| ("linux".to_owned(), "x86_64".to_owned()));

    versions
        .iter()
        .filter_map(|v| Version::from_str(v).ok())
        .map(|version| {
            let major = version
                .to_string()
                .split('.')
                .next()
                .and_then(|m| m.parse::<u64>().ok())
                .unwrap_or(3);
            ResolutionContext::new(
                arch.clone(),
                os_family.clone(),
                "cpython",
                version,
                WheelTag::new(format!("py{major}"), "none", "any"),
            )
        })
        .collect()
}

/// Seed the root set from the project's wheel entries and the discovered path-dependency wheels,
/// resolve each root's bytes, then walk the dependency graph to fixpoint.
async fn build_dependency_graph(
    plan: &mut BuildPlan,
    context: &PackagingContext,
    spec: &CompatibilitySpec,
    selector: &dyn VersionSelector,
) -> Result<(), BuildError> {
    let mut roots: Vec<WheelKey> = Vec::new();
    let mut known_uris: HashMap<WheelKey, Url> = HashMap::new();

    let mut add_local_wheel = |path: PathBuf,
                               roots: &mut Vec<WheelKey>,
                               known_uris: &mut HashMap<WheelKey, Url>|
     -> Result<(), BuildError> {
        let uri = Url::from_file_path(&path).map_err(|_| BuildError::UnresolvableRoot {
            entry: path.display().to_string(),
        })?;
        let key = WheelKey::from_uri(&uri).map_err(|_| BuildError::UnresolvableRoot {
            entry: path.display().to_string(),
        })?;
        known_uris.insert(key.clone(), uri);
        roots.push(key);
        Ok(())
    };

    for entry in plan.project.wheels.clone() {
        if entry.ends_with(".whl") {
            let path = PathBuf::from(&entry);
            let path = if path.is_absolute() {
                path
            } else {
                plan.project_dir.join(path)
            };
            add_local_wheel(path, &mut roots, &mut known_uris)?;
        } else {
            let requirement =
                Requirement::from_str(&entry).map_err(|_| BuildError::UnresolvableRoot {
                    entry: entry.clone(),
                })?;
            let key = selector
                .select(&requirement)
                .await
                .ok_or(BuildError::UnresolvableRoot { entry })?;
            roots.push(key);
        }
    }
    for path in plan.path_dep_wheel_locations.clone() {
        add_local_wheel(path, &mut roots, &mut known_uris)?;
    }

    // Materialize the root wheels; a root we cannot fetch is fatal.
    for root in &roots {
        let uri = match known_uris.get(root) {
            Some(uri) => uri.clone(),
            None => {
                let Some(candidate_entry) = context
                    .candidate_resolver
                    .resolve(spec, root, None, None, false)
                    .await?
                else {
                    return Err(BuildError::NoWheelForRoot(root.to_string()));
                };
                let text = fs_err::read_to_string(&candidate_entry.path)?;
                let project_info = serde_json::from_str(&text)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                let Some(uri) = resolve_uri_for_wheel_key(root, &project_info, spec)
                    .map_err(crate::tags::ChooseWheelTagError::from)
                    .map_err(crate::resolver::ResolverError::from)?
                else {
                    return Err(BuildError::NoWheelForRoot(root.to_string()));
                };
                known_uris.insert(root.clone(), uri.clone());
                uri
            }
        };

        let Some(entry) = context
            .wheel_resolver
            .resolve(spec, &uri, Some(root), false)
            .await?
        else {
            return Err(BuildError::NoWheelForRoot(root.to_string()));
        };
        plan.audit_log.push(
            BuildEvent::new(StageType::Plan, EventType::Resolve)
                .with_substage("build_dependency_graph")
                .with_message(format!("Resolved wheel {}", entry.key)),
        );
        plan.wheels.push(entry);
    }

    let contexts = contexts_for_spec(spec, &plan.resolved_python_versions);
    let resolution = DependencyGraphBuilder::new(
        spec,
        &context.dependency_resolver,
        selector,
        &contexts,
    )
    .with_known_uris(known_uris)
    .build(&roots)
    .await?;

    plan.audit_log.push(
        BuildEvent::new(StageType::Plan, EventType::Resolve)
            .with_substage("build_dependency_graph")
            .with_message(format!(
                "Dependency graph closed over {} node(s) from {} root(s)",
                resolution.nodes().len(),
                roots.len()
            )),
    );
    plan.compatibility_resolution = Some(resolution);
    Ok(())
}
