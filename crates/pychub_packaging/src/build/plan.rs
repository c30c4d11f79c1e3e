use super::audit::AuditLog;
use crate::compat::CompatibilitySpec;
use crate::project::ChubProject;
use crate::resolve::CompatibilityResolution;
use crate::resolver::WheelCacheEntry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Filename of the persisted normalized project inside the staging directory.
pub const CHUBPROJECT_FILENAME: &str = "chubproject.toml";

/// Filename of the persisted build plan inside the staging directory.
pub const BUILDPLAN_FILENAME: &str = "buildplan.json";

/// Filename of the small invocation descriptor inside the staging directory.
pub const META_FILENAME: &str = "meta.json";

/// The staging subdirectories created for every project hash.
pub const STAGING_SUBDIRS: [&str; 6] = [
    "wheels",
    "metadata",
    "scripts",
    "includes",
    "runtime",
    "build",
];

/// One `src[::dest]` include entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncludeEntry {
    /// The file to include.
    pub src: String,

    /// Where it lands inside the archive; defaults to the source basename.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
}

impl IncludeEntry {
    /// Parses the raw `src[::dest]` form.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once("::") {
            Some((src, dest)) if !dest.is_empty() => Self {
                src: src.to_owned(),
                dest: Some(dest.to_owned()),
            },
            _ => Self {
                src: raw.to_owned(),
                dest: None,
            },
        }
    }
}

/// Pre- and post-install scripts staged for the archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallScripts {
    /// Run before the wheels install.
    pub pre: Vec<String>,

    /// Run after the wheels install.
    pub post: Vec<String>,
}

/// The mutable accumulator of a build: everything INIT and PLAN learn about the project, the
/// compatibility spec, resolved artifacts, and the audit trail. Created at orchestrator entry,
/// exclusively owned by the orchestrator, persisted to the staging directory as the final PLAN
/// artifact.
#[derive(Debug, Serialize)]
pub struct BuildPlan {
    /// Events recorded so far.
    pub audit_log: AuditLog,

    /// The top-level cache directory all staging lives under.
    pub cache_root: PathBuf,

    /// The effective compatibility spec, attached during PLAN.
    pub compatibility_spec: Option<CompatibilitySpec>,

    /// The dependency graph, attached during PLAN.
    pub compatibility_resolution: Option<CompatibilityResolution>,

    /// When the plan was created.
    pub created_at: DateTime<Utc>,

    /// Files included in the archive.
    pub include_files: Vec<IncludeEntry>,

    /// Scripts staged for the archive.
    pub install_scripts: InstallScripts,

    /// Free-form metadata from the project.
    pub metadata: toml::Table,

    /// Wheels discovered through path-dependency analysis.
    pub path_dep_wheel_locations: BTreeSet<PathBuf>,

    /// The normalized project definition.
    pub project: ChubProject,

    /// The project directory.
    pub project_dir: PathBuf,

    /// Content hash of the normalized project; names the staging directory.
    pub project_hash: String,

    /// The pychub version that created this plan.
    pub pychub_version: String,

    /// The exact python versions the spec realized to.
    pub resolved_python_versions: Vec<String>,

    /// Wheel cache entries resolved for the plan.
    pub wheels: Vec<WheelCacheEntry>,
}

impl BuildPlan {
    /// An empty plan rooted at the given cache directory.
    pub fn new(cache_root: PathBuf) -> Self {
        Self {
            audit_log: AuditLog::default(),
            cache_root,
            compatibility_spec: None,
            compatibility_resolution: None,
            created_at: Utc::now(),
            include_files: Vec::new(),
            install_scripts: InstallScripts::default(),
            metadata: toml::Table::new(),
            path_dep_wheel_locations: BTreeSet::new(),
            project: ChubProject::default(),
            project_dir: PathBuf::from("."),
            project_hash: String::new(),
            pychub_version: env!("CARGO_PKG_VERSION").to_owned(),
            resolved_python_versions: Vec::new(),
            wheels: Vec::new(),
        }
    }

    /// Adopts the normalized project: include entries, scripts and metadata come along.
    pub fn attach_project(&mut self, project: ChubProject) {
        self.include_files = project.includes.iter().map(|raw| IncludeEntry::parse(raw)).collect();
        self.install_scripts = InstallScripts {
            pre: project.pre_scripts.clone(),
            post: project.post_scripts.clone(),
        };
        self.metadata = project.metadata.clone();
        self.project = project;
    }

    /// The per-project staging directory, `{cache_root}/{project_hash}`.
    pub fn project_staging_dir(&self) -> PathBuf {
        self.cache_root.join(&self.project_hash)
    }

    /// Creates the staging directory and its fixed layout.
    pub fn ensure_staging_layout(&self) -> std::io::Result<PathBuf> {
        let staging = self.project_staging_dir();
        for subdir in STAGING_SUBDIRS {
            fs_err::create_dir_all(staging.join(subdir))?;
        }
        Ok(staging)
    }

    /// The `meta.json` descriptor of this invocation.
    pub fn meta_json(&self) -> serde_json::Value {
        serde_json::json!({
            "pychub_version": self.pychub_version,
            "created_at": self.created_at.to_rfc3339(),
            "project_hash": self.project_hash,
        })
    }

    /// Persists the plan as `buildplan.json` inside `dir`, returning the written path.
    pub fn persist(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join(BUILDPLAN_FILENAME);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs_err::write(&path, json)?;
        Ok(path)
    }
}
