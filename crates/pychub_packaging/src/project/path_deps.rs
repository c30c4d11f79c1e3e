//! Discovery of sibling path-dependency projects. Each dependency project's `pyproject.toml` is
//! inspected by an ordered set of project-manager strategies (poetry, pdm, hatch, then a generic
//! fallback); discovery recurses through the dependencies' own path dependencies, and the union
//! of every discovered project's `dist/*.whl` files is attached to the plan.

use miette::Diagnostic;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toml::{Table, Value};

/// Errors during path-dependency analysis.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum PathDependencyError {
    #[error("path dependency project '{0}' is missing pyproject.toml")]
    MissingPyproject(String),

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("dependency project '{0}' has no wheel files in its dist directory")]
    NoWheelsBuilt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One project-manager convention for declaring path dependencies.
pub trait ProjectPathStrategy: Send + Sync {
    /// Name used in audit messages.
    fn name(&self) -> &str;

    /// Smaller runs earlier.
    fn precedence(&self) -> u32;

    /// Whether this convention applies to the given document.
    fn can_handle(&self, doc: &Table) -> bool;

    /// The path dependencies the document declares, resolved against the project root.
    fn extract_paths(&self, doc: &Table, project_root: &Path) -> Vec<PathBuf>;
}

fn nested_table<'a>(doc: &'a Table, path: &[&str]) -> Option<&'a Table> {
    let mut current = doc;
    for segment in path {
        current = current.get(*segment)?.as_table()?;
    }
    Some(current)
}

fn path_of(value: &Value, project_root: &Path) -> Option<PathBuf> {
    let path = value.as_table()?.get("path")?.as_str()?;
    Some(project_root.join(path))
}

/// Poetry: `[tool.poetry.dependencies]` entries with a `path` key.
pub struct PoetryPathStrategy;

impl ProjectPathStrategy for PoetryPathStrategy {
    fn name(&self) -> &str {
        "poetry"
    }

    fn precedence(&self) -> u32 {
        50
    }

    fn can_handle(&self, doc: &Table) -> bool {
        nested_table(doc, &["tool", "poetry"]).is_some()
    }

    fn extract_paths(&self, doc: &Table, project_root: &Path) -> Vec<PathBuf> {
        nested_table(doc, &["tool", "poetry", "dependencies"])
            .map(|deps| {
                deps.values()
                    .filter_map(|v| path_of(v, project_root))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Hatch: a `[tool.hatch]` section with dependencies declared under `[project]`.
pub struct HatchPathStrategy;

impl ProjectPathStrategy for HatchPathStrategy {
    fn name(&self) -> &str {
        "hatch"
    }

    fn precedence(&self) -> u32 {
        60
    }

    fn can_handle(&self, doc: &Table) -> bool {
        nested_table(doc, &["tool", "hatch"]).is_some()
            && nested_table(doc, &["project"])
                .is_some_and(|project| project.contains_key("dependencies"))
    }

    fn extract_paths(&self, doc: &Table, project_root: &Path) -> Vec<PathBuf> {
        nested_table(doc, &["project"])
            .and_then(|project| project.get("dependencies"))
            .and_then(Value::as_array)
            .map(|deps| {
                deps.iter()
                    .filter_map(|v| path_of(v, project_root))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// PDM: `[tool.pdm.dependencies]` entries with a `path` key.
pub struct PdmPathStrategy;

impl ProjectPathStrategy for PdmPathStrategy {
    fn name(&self) -> &str {
        "pdm"
    }

    fn precedence(&self) -> u32 {
        70
    }

    fn can_handle(&self, doc: &Table) -> bool {
        nested_table(doc, &["tool", "pdm"])
            .is_some_and(|pdm| pdm.contains_key("dependencies"))
    }

    fn extract_paths(&self, doc: &Table, project_root: &Path) -> Vec<PathBuf> {
        nested_table(doc, &["tool", "pdm", "dependencies"])
            .map(|deps| {
                deps.values()
                    .filter_map(|v| path_of(v, project_root))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Fallback: scan every `dependencies`-named table or array anywhere in the document for entries
/// with a `path` key.
pub struct DefaultPathStrategy;

impl DefaultPathStrategy {
    fn scan(value: &Value, project_root: &Path, out: &mut Vec<PathBuf>) {
        match value {
            Value::Table(table) => {
                for (key, nested) in table {
                    if key == "dependencies" {
                        match nested {
                            Value::Table(deps) => {
                                out.extend(deps.values().filter_map(|v| path_of(v, project_root)));
                            }
                            Value::Array(deps) => {
                                out.extend(deps.iter().filter_map(|v| path_of(v, project_root)));
                            }
                            _ => {}
                        }
                    }
                    Self::scan(nested, project_root, out);
                }
            }
            Value::Array(items) => {
                for item in items {
                    Self::scan(item, project_root, out);
                }
            }
            _ => {}
        }
    }
}

impl ProjectPathStrategy for DefaultPathStrategy {
    fn name(&self) -> &str {
        "default"
    }

    fn precedence(&self) -> u32 {
        1000
    }

    fn can_handle(&self, _doc: &Table) -> bool {
        true
    }

    fn extract_paths(&self, doc: &Table, project_root: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        Self::scan(&Value::Table(doc.clone()), project_root, &mut out);
        out
    }
}

/// The built-in strategy stack in precedence order.
pub fn default_path_strategies() -> Vec<Box<dyn ProjectPathStrategy>> {
    let mut strategies: Vec<Box<dyn ProjectPathStrategy>> = vec![
        Box::new(PoetryPathStrategy),
        Box::new(HatchPathStrategy),
        Box::new(PdmPathStrategy),
        Box::new(DefaultPathStrategy),
    ];
    strategies.sort_by_key(|s| s.precedence());
    strategies
}

fn load_pyproject(path: &Path) -> Result<Table, PathDependencyError> {
    let text = fs_err::read_to_string(path)?;
    toml::from_str(&text).map_err(|e| PathDependencyError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Recursively collects the roots of every path-dependency project reachable from
/// `pyproject_path`, including the starting project itself.
pub fn collect_path_dependencies(
    pyproject_path: &Path,
    strategies: &[Box<dyn ProjectPathStrategy>],
) -> Result<BTreeSet<PathBuf>, PathDependencyError> {
    let mut seen = BTreeSet::new();
    collect_into(pyproject_path, strategies, &mut seen)?;
    Ok(seen)
}

fn collect_into(
    pyproject_path: &Path,
    strategies: &[Box<dyn ProjectPathStrategy>],
    seen: &mut BTreeSet<PathBuf>,
) -> Result<(), PathDependencyError> {
    let project_root = pyproject_path
        .parent()
        .unwrap_or(Path::new("."))
        .to_path_buf();
    if !seen.insert(project_root.clone()) {
        return Ok(());
    }

    let doc = load_pyproject(pyproject_path)?;
    let strategy = strategies
        .iter()
        .find(|s| s.can_handle(&doc))
        .expect("the default strategy handles everything");
    tracing::debug!(
        project = %project_root.display(),
        strategy = strategy.name(),
        "selected path dependency strategy"
    );

    for dep_root in strategy.extract_paths(&doc, &project_root) {
        let dep_pyproject = dep_root.join("pyproject.toml");
        if !dep_pyproject.is_file() {
            return Err(PathDependencyError::MissingPyproject(
                dep_root.display().to_string(),
            ));
        }
        collect_into(&dep_pyproject, strategies, seen)?;
    }
    Ok(())
}

/// Collects the `dist/*.whl` files of the given dependency projects. A project with a `dist`
/// directory but no wheels is an error (it has not been built); a missing `dist` directory is
/// skipped with a warning.
pub fn collect_path_dependency_wheels(
    project_roots: &BTreeSet<PathBuf>,
) -> Result<BTreeSet<PathBuf>, PathDependencyError> {
    let mut wheels = BTreeSet::new();
    for root in project_roots {
        let dist = root.join("dist");
        if !dist.is_dir() {
            tracing::warn!(project = %root.display(), "dependency project has no dist directory");
            continue;
        }
        let mut found_any = false;
        for entry in fs_err::read_dir(&dist)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "whl") {
                found_any = true;
                wheels.insert(path);
            }
        }
        if !found_any {
            return Err(PathDependencyError::NoWheelsBuilt(
                root.display().to_string(),
            ));
        }
    }
    Ok(wheels)
}
