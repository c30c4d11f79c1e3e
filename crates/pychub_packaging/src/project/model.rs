use data_encoding::HEXLOWER;
use miette::Diagnostic;
use rattler_digest::{compute_bytes_digest, Sha256};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use toml::{Table, Value};

/// Errors while loading or saving a project file.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum ChubProjectError {
    #[error("project file not found: {0}")]
    NotFound(String),

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("no pychub config found in {0}")]
    NoPackageTable(String),

    #[error("pychub packaging is disabled in {0}")]
    Disabled(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Where a layer of project configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceKind {
    /// A project file on disk.
    File,
    /// Command line options.
    Cli,
    /// Programmatic construction.
    Api,
}

/// What a provenance event recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    /// Initial construction.
    Init,
    /// Additive merge of another layer.
    MergeExtend,
    /// Wholesale override by another layer.
    MergeOverride,
}

/// One recorded step in the project's configuration history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    /// Which layer produced the change.
    pub source: SourceKind,

    /// How the change was applied.
    pub operation: OperationKind,

    /// Free-form detail, e.g. the argv of a CLI merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// The normalized chub project definition: what to package, how to run it, and which
/// compatibility rules to apply. This is the canonical in-memory form of both accepted TOML
/// shapes (`pyproject.toml` with `[tool.pychub.package]`, and `*chubproject*.toml` nested or
/// flat).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChubProject {
    /// Project name.
    pub name: Option<String>,

    /// Project version.
    pub version: Option<String>,

    /// Root path of the project.
    pub project_path: Option<String>,

    /// Output path of the `.chub` file.
    pub chub: Option<String>,

    /// Entry point invoked on install.
    pub entrypoint: Option<String>,

    /// Arguments for the entry point.
    pub entrypoint_args: Vec<String>,

    /// Wheel paths or PEP 508 requirement strings.
    pub wheels: Vec<String>,

    /// Raw `src[::dest]` include entries.
    pub includes: Vec<String>,

    /// Other `.chub` archives to nest.
    pub include_chubs: Vec<String>,

    /// Scripts run before install.
    pub pre_scripts: Vec<String>,

    /// Scripts run after install.
    pub post_scripts: Vec<String>,

    /// Raw compatibility spec block, including the optional `strategy` and `file` keys.
    pub compatibility_spec: Table,

    /// Extra metadata carried into the archive.
    pub metadata: Table,

    /// Configuration history.
    pub provenance: Vec<ProvenanceEvent>,
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        None => Vec::new(),
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(other) => vec![other.to_string()],
    }
}

fn string_value(table: &Table, key: &str) -> Option<String> {
    table.get(key).and_then(|v| v.as_str()).map(str::to_owned)
}

fn table_value(table: &Table, key: &str) -> Table {
    table
        .get(key)
        .and_then(|v| v.as_table())
        .cloned()
        .unwrap_or_default()
}

/// Locates the package table inside a parsed project document.
///
/// `pyproject.toml` carries exactly `[tool.pychub.package]`, honoring its optional `enabled`
/// flag. A chubproject file may nest the table under `[tool.pychub.package]`,
/// `[pychub.package]` or `[package]`, or be the flat document itself.
pub fn select_package_table(doc: &Table, file_name: &str) -> Result<Table, ChubProjectError> {
    let is_pyproject = file_name == "pyproject.toml";

    let nested = [
        &["tool", "pychub", "package"][..],
        &["pychub", "package"][..],
        &["package"][..],
    ];
    let lookup = |path: &[&str]| -> Option<Table> {
        let mut current = doc;
        for segment in path {
            current = current.get(*segment)?.as_table()?;
        }
        Some(current.clone())
    };

    let candidates: &[&[&str]] = if is_pyproject {
        &nested[..1]
    } else {
        &nested[..]
    };

    for path in candidates {
        if let Some(table) = lookup(path) {
            if let Some(false) = table.get("enabled").and_then(Value::as_bool) {
                return Err(ChubProjectError::Disabled(file_name.to_owned()));
            }
            return Ok(table);
        }
    }

    if is_pyproject {
        return Err(ChubProjectError::NoPackageTable(file_name.to_owned()));
    }

    // Flat chubproject document.
    Ok(doc.clone())
}

impl ChubProject {
    /// Builds a project from an already-located package table.
    pub fn from_table(table: &Table) -> Self {
        let scripts = table_value(table, "scripts");
        let pre_scripts = match table.get("pre_scripts") {
            Some(v) => string_list(Some(v)),
            None => string_list(scripts.get("pre")),
        };
        let post_scripts = match table.get("post_scripts") {
            Some(v) => string_list(Some(v)),
            None => string_list(scripts.get("post")),
        };

        Self {
            name: string_value(table, "name"),
            version: string_value(table, "version"),
            project_path: string_value(table, "project_path"),
            chub: string_value(table, "chub"),
            entrypoint: string_value(table, "entrypoint"),
            entrypoint_args: string_list(table.get("entrypoint_args")),
            wheels: string_list(table.get("wheels")),
            includes: string_list(table.get("includes")),
            include_chubs: string_list(table.get("include_chubs")),
            pre_scripts,
            post_scripts,
            compatibility_spec: table_value(table, "compatibility_spec"),
            metadata: table_value(table, "metadata"),
            provenance: Vec::new(),
        }
    }

    /// Parses a project file, locating the package table per the file's shape.
    pub fn from_file(path: &Path) -> Result<Self, ChubProjectError> {
        if !path.is_file() {
            return Err(ChubProjectError::NotFound(path.display().to_string()));
        }
        let text = fs_err::read_to_string(path)?;
        let doc: Table = toml::from_str(&text).map_err(|e| ChubProjectError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("chubproject.toml");
        let table = select_package_table(&doc, file_name)?;
        let mut project = Self::from_table(&table);
        project.provenance.push(ProvenanceEvent {
            source: SourceKind::File,
            operation: OperationKind::Init,
            details: Some(path.display().to_string()),
        });
        Ok(project)
    }

    /// Additively merges another layer: scalars are overridden when present, lists are unioned
    /// with existing entries first, the compatibility block is replaced wholesale, and metadata
    /// merges per key (lists union, scalars override).
    pub fn merge_from_table(&mut self, table: &Table, source: SourceKind, details: Option<String>) {
        fn merge_scalar(slot: &mut Option<String>, table: &Table, key: &str) {
            if let Some(value) = string_value(table, key) {
                *slot = Some(value);
            }
        }
        merge_scalar(&mut self.name, table, "name");
        merge_scalar(&mut self.version, table, "version");
        merge_scalar(&mut self.project_path, table, "project_path");
        merge_scalar(&mut self.chub, table, "chub");
        merge_scalar(&mut self.entrypoint, table, "entrypoint");

        fn merge_list(slot: &mut Vec<String>, incoming: Vec<String>) {
            for item in incoming {
                if !slot.contains(&item) {
                    slot.push(item);
                }
            }
        }
        let scripts = table_value(table, "scripts");
        if let Some(v) = table.get("entrypoint_args") {
            merge_list(&mut self.entrypoint_args, string_list(Some(v)));
        }
        if let Some(v) = table.get("wheels") {
            merge_list(&mut self.wheels, string_list(Some(v)));
        }
        if let Some(v) = table.get("includes") {
            merge_list(&mut self.includes, string_list(Some(v)));
        }
        if let Some(v) = table.get("include_chubs") {
            merge_list(&mut self.include_chubs, string_list(Some(v)));
        }
        match table.get("pre_scripts") {
            Some(v) => merge_list(&mut self.pre_scripts, string_list(Some(v))),
            None => merge_list(&mut self.pre_scripts, string_list(scripts.get("pre"))),
        }
        match table.get("post_scripts") {
            Some(v) => merge_list(&mut self.post_scripts, string_list(Some(v))),
            None => merge_list(&mut self.post_scripts, string_list(scripts.get("post"))),
        }

        if let Some(spec) = table.get("compatibility_spec").and_then(Value::as_table) {
            self.compatibility_spec = spec.clone();
        }

        if let Some(incoming) = table.get("metadata").and_then(Value::as_table) {
            for (key, value) in incoming {
                match (self.metadata.get_mut(key), value) {
                    (Some(Value::Array(existing)), Value::Array(items)) => {
                        for item in items {
                            if !existing.contains(item) {
                                existing.push(item.clone());
                            }
                        }
                    }
                    _ => {
                        self.metadata.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        self.provenance.push(ProvenanceEvent {
            source,
            operation: OperationKind::MergeExtend,
            details,
        });
    }

    /// The canonical table form of the project, the shape persisted as `chubproject.toml`.
    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        fn put_str(table: &mut Table, key: &str, value: &Option<String>) {
            if let Some(value) = value {
                table.insert(key.to_owned(), Value::String(value.clone()));
            }
        }
        fn put_list(table: &mut Table, key: &str, values: &[String]) {
            if !values.is_empty() {
                table.insert(
                    key.to_owned(),
                    Value::Array(values.iter().cloned().map(Value::String).collect()),
                );
            }
        }

        put_str(&mut table, "name", &self.name);
        put_str(&mut table, "version", &self.version);
        put_str(&mut table, "project_path", &self.project_path);
        put_str(&mut table, "chub", &self.chub);
        put_str(&mut table, "entrypoint", &self.entrypoint);
        put_list(&mut table, "entrypoint_args", &self.entrypoint_args);
        put_list(&mut table, "wheels", &self.wheels);
        put_list(&mut table, "includes", &self.includes);
        put_list(&mut table, "include_chubs", &self.include_chubs);

        if !self.pre_scripts.is_empty() || !self.post_scripts.is_empty() {
            let mut scripts = Table::new();
            put_list(&mut scripts, "pre", &self.pre_scripts);
            put_list(&mut scripts, "post", &self.post_scripts);
            table.insert("scripts".to_owned(), Value::Table(scripts));
        }
        if !self.compatibility_spec.is_empty() {
            table.insert(
                "compatibility_spec".to_owned(),
                Value::Table(self.compatibility_spec.clone()),
            );
        }
        if !self.metadata.is_empty() {
            table.insert("metadata".to_owned(), Value::Table(self.metadata.clone()));
        }
        table
    }

    /// A stable content hash of the normalized project, used to name the staging directory.
    pub fn mapping_hash(&self) -> String {
        let canonical =
            serde_json::to_string(&self.to_table()).expect("project table always serializes");
        let digest = compute_bytes_digest::<Sha256>(canonical.as_bytes());
        HEXLOWER.encode(&digest)
    }

    /// Writes the normalized project as a flat TOML document.
    pub fn save_file(&self, path: &Path, overwrite: bool) -> Result<(), ChubProjectError> {
        self.save_file_with_table(path, None, overwrite)
    }

    /// Writes the normalized project, nesting it under the dotted `table_path` when one is given
    /// (`"flat"` and `None` both mean the document root).
    pub fn save_file_with_table(
        &self,
        path: &Path,
        table_path: Option<&str>,
        overwrite: bool,
    ) -> Result<(), ChubProjectError> {
        if path.exists() && !overwrite {
            return Err(ChubProjectError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )));
        }
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let mut doc = self.to_table();
        if let Some(table_path) = table_path.filter(|t| !t.is_empty() && *t != "flat") {
            for segment in table_path.split('.').rev() {
                let mut outer = Table::new();
                outer.insert(segment.to_owned(), Value::Table(doc));
                doc = outer;
            }
        }

        let text = toml::to_string_pretty(&doc).expect("project table always serializes");
        fs_err::write(path, text)?;
        Ok(())
    }
}

impl Serialize for ChubProject {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_table().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChubProject {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let table = Table::deserialize(deserializer)?;
        Ok(Self::from_table(&table))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CHUBPROJECT: &str = r#"
        name = "demo"
        version = "1.2.3"
        entrypoint = "demo.cli:main"
        wheels = ["demo-1.2.3-py3-none-any.whl", "requests==2.31.0"]
        includes = ["README.md::docs/README.md"]

        [scripts]
        pre = ["scripts/check.sh"]
        post = ["scripts/announce.sh"]

        [compatibility_spec]
        strategy = "merge"

        [compatibility_spec.PythonVersions]
        min = "3.10"

        [metadata]
        team = "platform"
        channels = ["stable"]
    "#;

    #[test]
    fn test_flat_chubproject_parses() {
        let doc: Table = toml::from_str(CHUBPROJECT).unwrap();
        let table = select_package_table(&doc, "chubproject.toml").unwrap();
        let project = ChubProject::from_table(&table);

        assert_eq!(project.name.as_deref(), Some("demo"));
        assert_eq!(project.wheels.len(), 2);
        assert_eq!(project.pre_scripts, vec!["scripts/check.sh"]);
        assert_eq!(project.post_scripts, vec!["scripts/announce.sh"]);
        assert!(project.compatibility_spec.contains_key("PythonVersions"));
    }

    #[test]
    fn test_pyproject_requires_tool_table() {
        let doc: Table = toml::from_str("[project]\nname = \"x\"\n").unwrap();
        let result = select_package_table(&doc, "pyproject.toml");
        assert!(matches!(result, Err(ChubProjectError::NoPackageTable(_))));

        let doc: Table =
            toml::from_str("[tool.pychub.package]\nname = \"x\"\nenabled = false\n").unwrap();
        let result = select_package_table(&doc, "pyproject.toml");
        assert!(matches!(result, Err(ChubProjectError::Disabled(_))));

        let doc: Table = toml::from_str("[tool.pychub.package]\nname = \"x\"\n").unwrap();
        let table = select_package_table(&doc, "pyproject.toml").unwrap();
        assert_eq!(ChubProject::from_table(&table).name.as_deref(), Some("x"));
    }

    #[test]
    fn test_nested_chubproject_shapes() {
        for shape in [
            "[tool.pychub.package]\nname = \"n\"\n",
            "[pychub.package]\nname = \"n\"\n",
            "[package]\nname = \"n\"\n",
        ] {
            let doc: Table = toml::from_str(shape).unwrap();
            let table = select_package_table(&doc, "my.chubproject.toml").unwrap();
            assert_eq!(ChubProject::from_table(&table).name.as_deref(), Some("n"));
        }
    }

    #[test]
    fn test_merge_semantics() {
        let doc: Table = toml::from_str(CHUBPROJECT).unwrap();
        let table = select_package_table(&doc, "chubproject.toml").unwrap();
        let mut project = ChubProject::from_table(&table);

        let overlay: Table = toml::from_str(
            r#"
            version = "2.0.0"
            wheels = ["requests==2.31.0", "click==8.1.7"]

            [metadata]
            team = "tools"
            channels = ["beta"]
        "#,
        )
        .unwrap();
        project.merge_from_table(&overlay, SourceKind::Cli, None);

        // Scalars override, lists union with existing entries first.
        assert_eq!(project.version.as_deref(), Some("2.0.0"));
        assert_eq!(
            project.wheels,
            vec![
                "demo-1.2.3-py3-none-any.whl",
                "requests==2.31.0",
                "click==8.1.7"
            ]
        );
        // Metadata scalars are replaced, metadata lists are unioned.
        assert_eq!(project.metadata["team"].as_str(), Some("tools"));
        let channels: Vec<_> = project.metadata["channels"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(channels, vec!["stable", "beta"]);
        assert_eq!(project.provenance.len(), 1);
    }

    #[test]
    fn test_mapping_hash_is_stable_and_semantic() {
        let doc: Table = toml::from_str(CHUBPROJECT).unwrap();
        let table = select_package_table(&doc, "chubproject.toml").unwrap();
        let a = ChubProject::from_table(&table);
        let mut b = a.clone();
        assert_eq!(a.mapping_hash(), b.mapping_hash());

        b.version = Some("9.9.9".into());
        assert_ne!(a.mapping_hash(), b.mapping_hash());
    }

    #[test]
    fn test_save_with_table_path_nests_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = ChubProject::default();
        project.name = Some("demo".into());

        let path = dir.path().join("pyproject-fragment.toml");
        project
            .save_file_with_table(&path, Some("tool.pychub.package"), false)
            .unwrap();

        let doc: Table = toml::from_str(&fs_err::read_to_string(&path).unwrap()).unwrap();
        let table = select_package_table(&doc, "pyproject.toml").unwrap();
        assert_eq!(ChubProject::from_table(&table).name.as_deref(), Some("demo"));
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let doc: Table = toml::from_str(CHUBPROJECT).unwrap();
        let table = select_package_table(&doc, "chubproject.toml").unwrap();
        let project = ChubProject::from_table(&table);

        let path = dir.path().join("chubproject.toml");
        project.save_file(&path, false).unwrap();
        assert!(project.save_file(&path, false).is_err());

        let reloaded = ChubProject::from_file(&path).unwrap();
        assert_eq!(reloaded.name, project.name);
        assert_eq!(reloaded.wheels, project.wheels);
        assert_eq!(reloaded.pre_scripts, project.pre_scripts);
    }
}
