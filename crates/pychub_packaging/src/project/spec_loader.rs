//! Assembly of the effective compatibility spec: embedded defaults, overlaid by an optional user
//! spec file ("merge" or "override" strategy), overlaid by inline overrides from the project's
//! `[compatibility_spec]` block. Inline overrides always win.

use super::model::ChubProject;
use crate::compat::{CompatibilitySpec, CompatibilitySpecError};
use miette::Diagnostic;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toml::{Table, Value};

const DEFAULT_SPEC_TOML: &str = include_str!("compatibility_spec.toml");

/// Errors while assembling the effective compatibility spec.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum SpecLoadError {
    #[error("compatibility spec file not found: {0}")]
    FileNotFound(String),

    #[error("failed to parse compatibility spec {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error(transparent)]
    Invalid(#[from] CompatibilitySpecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Recursively overlays `override_with` onto `base`: tables merge key-wise, everything else is
/// replaced.
fn spec_override(base: &Table, override_with: &Table) -> Table {
    let mut result = base.clone();
    for (key, incoming) in override_with {
        match (result.get(key), incoming) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                result.insert(key.clone(), Value::Table(spec_override(existing, incoming)));
            }
            _ => {
                result.insert(key.clone(), incoming.clone());
            }
        }
    }
    result
}

/// Like [`spec_override`] but lists are unioned, base entries first.
fn spec_merge(base: &Table, overlay: &Table) -> Table {
    let mut result = base.clone();
    for (key, incoming) in overlay {
        match (result.get(key), incoming) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                result.insert(key.clone(), Value::Table(spec_merge(existing, incoming)));
            }
            (Some(Value::Array(existing)), Value::Array(incoming)) => {
                let mut combined = existing.clone();
                for item in incoming {
                    if !combined.contains(item) {
                        combined.push(item.clone());
                    }
                }
                result.insert(key.clone(), Value::Array(combined));
            }
            _ => {
                result.insert(key.clone(), incoming.clone());
            }
        }
    }
    result
}

fn parse_spec_table(text: &str, origin: &str) -> Result<Table, SpecLoadError> {
    toml::from_str(text).map_err(|e| SpecLoadError::Parse {
        path: origin.to_owned(),
        reason: e.to_string(),
    })
}

/// How a user spec file combines with the embedded defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CombineStrategy {
    /// Union lists, merge tables.
    #[default]
    Merge,
    /// Replace values wholesale.
    Override,
}

/// Builds the effective [`CompatibilitySpec`] for a project.
///
/// The project's `[compatibility_spec]` block may carry a `strategy` (`merge` or `override`,
/// anything else falls back to `merge` with a warning), a `file` path resolved against
/// `project_dir`, and inline sub-spec tables applied last with override semantics.
pub fn load_compatibility_spec(
    project: &ChubProject,
    project_dir: &Path,
) -> Result<CompatibilitySpec, SpecLoadError> {
    let mut block = project.compatibility_spec.clone();

    let strategy = match block.remove("strategy").as_ref().and_then(Value::as_str) {
        None | Some("merge") => CombineStrategy::Merge,
        Some("override") => CombineStrategy::Override,
        Some(other) => {
            tracing::warn!(
                strategy = other,
                "compatibility spec strategy must be 'merge' or 'override'; defaulting to 'merge'"
            );
            CombineStrategy::Merge
        }
    };

    let user_spec_path: Option<PathBuf> = block
        .remove("file")
        .as_ref()
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(|raw| {
            let candidate = PathBuf::from(raw);
            if candidate.is_absolute() {
                candidate
            } else {
                project_dir.join(candidate)
            }
        });

    let mut merged = parse_spec_table(DEFAULT_SPEC_TOML, "embedded")?;
    let mut source_parts = vec!["embedded:compatibility_spec.toml".to_owned()];

    if let Some(path) = user_spec_path {
        if !path.exists() {
            return Err(SpecLoadError::FileNotFound(path.display().to_string()));
        }
        let text = fs_err::read_to_string(&path)?;
        let file_table = parse_spec_table(&text, &path.display().to_string())?;
        merged = match strategy {
            CombineStrategy::Override => {
                source_parts.push(format!("file:{} (override)", path.display()));
                spec_override(&merged, &file_table)
            }
            CombineStrategy::Merge => {
                source_parts.push(format!("file:{} (merge)", path.display()));
                spec_merge(&merged, &file_table)
            }
        };
    }

    if !block.is_empty() {
        merged = spec_override(&merged, &block);
        source_parts.push("inline:project_toml".to_owned());
    }

    let spec: CompatibilitySpec =
        Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| SpecLoadError::Parse {
                path: source_parts.join(" + "),
                reason: e.to_string(),
            })?;
    Ok(spec.with_source_description(source_parts.join(" + ")))
}

#[cfg(test)]
mod test {
    use super::*;
    use toml::Table;

    fn project_with_block(block: &str) -> ChubProject {
        let table: Table = toml::from_str(block).unwrap();
        ChubProject {
            compatibility_spec: table,
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_only() {
        let project = ChubProject::default();
        let spec = load_compatibility_spec(&project, Path::new(".")).unwrap();
        assert_eq!(spec.python_versions.min, "3.10");
        assert!(spec.source_description.starts_with("embedded:"));
    }

    #[test]
    fn test_inline_overrides_win() {
        let project = project_with_block(
            r#"
            [PythonVersions]
            min = "3.11"
            max = "<3.13"
        "#,
        );
        let spec = load_compatibility_spec(&project, Path::new(".")).unwrap();
        assert_eq!(spec.python_versions.min, "3.11");
        assert_eq!(spec.python_versions.max, "<3.13");
        assert!(spec.source_description.ends_with("inline:project_toml"));
    }

    #[test]
    fn test_file_overlay_with_merge_strategy() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::write(
            dir.path().join("compat.toml"),
            r#"
            [PythonVersions]
            min = "3.12"

            [PlatformValues.linux]
            arches = ["x86_64"]
        "#,
        )
        .unwrap();

        let project = project_with_block(
            r#"
            strategy = "merge"
            file = "compat.toml"
        "#,
        );
        let spec = load_compatibility_spec(&project, dir.path()).unwrap();
        assert_eq!(spec.python_versions.min, "3.12");
        assert!(spec.platform_values.contains_key("linux"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let project = project_with_block(r#"file = "nope.toml""#);
        let result = load_compatibility_spec(&project, Path::new("/definitely/absent"));
        assert!(matches!(result, Err(SpecLoadError::FileNotFound(_))));
    }

    #[test]
    fn test_unknown_strategy_falls_back_to_merge() {
        let project = project_with_block(
            r#"
            strategy = "zipper"

            [PythonVersions]
            min = "3.11"
        "#,
        );
        let spec = load_compatibility_spec(&project, Path::new(".")).unwrap();
        assert_eq!(spec.python_versions.min, "3.11");
    }
}
