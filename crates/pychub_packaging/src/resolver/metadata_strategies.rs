use super::config::{StrategyConfig, StrategyType};
use super::coordinator::{MetadataResolver, WheelResolver};
use super::strategy::{
    download_to_file, write_bytes_atomic, ResolveRequest, ResolveStrategy, StrategyError,
    StrategyOutcome,
};
use crate::compat::CompatibilitySpec;
use crate::tags::{choose_wheel_tag, score, ChooseWheelTagError, TagScore};
use crate::types::{ProjectFile, ProjectInfo, WheelKey};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use std::path::Path;
use std::sync::Arc;
use url::Url;

const SIMPLE_V1_JSON: &str = "application/vnd.pypi.simple.v1+json";
const DEFAULT_SIMPLE_URL: &str = "https://pypi.org/simple";

fn simple_api_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(SIMPLE_V1_JSON));
    headers
}

fn project_index_url(base_simple_url: &str, key: &WheelKey) -> Result<Url, StrategyError> {
    Url::parse(&format!(
        "{}/{}/",
        base_simple_url.trim_end_matches('/'),
        key.name
    ))
    .map_err(|e| StrategyError::IndexParse(e.to_string()))
}

/// Out of the PEP 691 files of a project, the best non-yanked wheel for `key`: lowest
/// `(tag score, filename)` among files with at least one compatible tag.
fn best_wheel_file<'a>(
    project_info: &'a ProjectInfo,
    key: &WheelKey,
    spec: &CompatibilitySpec,
) -> Result<Option<&'a ProjectFile>, StrategyError> {
    let mut best: Option<((TagScore, &str), &ProjectFile)> = None;
    for file in &project_info.files {
        if file.yanked.yanked || !file.is_wheel() {
            continue;
        }
        let chosen = match choose_wheel_tag(&file.filename, key, spec) {
            Ok(tag) => tag,
            Err(ChooseWheelTagError::NotRealized(e)) => return Err(e.into()),
            Err(_) => continue,
        };
        let ranked = (score(&chosen), file.filename.as_str());
        match &best {
            Some((current, _)) if *current <= ranked => {}
            _ => best = Some((ranked, file)),
        }
    }
    Ok(best.map(|(_, file)| file))
}

/// Fetches the PEP 691 Simple API project page as candidate metadata, stored as
/// `{canonical_name}.pep691.json`.
pub struct Pep691SimpleApiMetadataStrategy {
    config: StrategyConfig,
    base_simple_url: String,
    client: reqwest::Client,
}

impl Pep691SimpleApiMetadataStrategy {
    /// A strategy against the default index (`https://pypi.org/simple`).
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, DEFAULT_SIMPLE_URL)
    }

    /// A strategy against a custom Simple API base URL.
    pub fn with_base_url(client: reqwest::Client, base_simple_url: impl Into<String>) -> Self {
        Self {
            config: StrategyConfig::new(
                "pep691-simple-api",
                concat!(module_path!(), "::Pep691SimpleApiMetadataStrategy"),
                StrategyType::CandidateMetadata,
                "pep691_simple_api",
            )
            .with_precedence(50),
            base_simple_url: base_simple_url.into(),
            client,
        }
    }
}

#[async_trait]
impl ResolveStrategy for Pep691SimpleApiMetadataStrategy {
    fn config(&self) -> &StrategyConfig {
        &self.config
    }

    async fn resolve(
        &self,
        dest_dir: &Path,
        request: ResolveRequest<'_>,
    ) -> Result<Option<StrategyOutcome>, StrategyError> {
        let Some(wheel_key) = request.wheel_key else {
            return Ok(None);
        };
        let index_url = project_index_url(&self.base_simple_url, wheel_key)?;
        let dest = dest_dir.join(format!("{}.pep691.json", wheel_key.name));

        tracing::debug!(url = %index_url, "fetching simple api project page");
        let path = download_to_file(
            &self.client,
            index_url.clone(),
            &dest,
            simple_api_headers(),
            self.config.fetch_timeout(),
        )
        .await?;
        Ok(Some(StrategyOutcome::with_origin(path, index_url.as_str())))
    }
}

/// Fetches PEP 658 sidecar metadata: the candidate metadata names the best wheel for the key, and
/// when that file advertises core metadata the `{url}.metadata` sidecar is downloaded as
/// `{filename}.metadata`. Returns `None` when the index does not serve a sidecar, letting the
/// wheel-inspection fallback run.
pub struct Pep658SidecarMetadataStrategy {
    config: StrategyConfig,
    candidate_resolver: Arc<MetadataResolver>,
    client: reqwest::Client,
}

impl Pep658SidecarMetadataStrategy {
    /// A strategy reading project pages through the given candidate-metadata resolver.
    pub fn new(client: reqwest::Client, candidate_resolver: Arc<MetadataResolver>) -> Self {
        Self {
            config: StrategyConfig::new(
                "pep658-sidecar-metadata",
                concat!(module_path!(), "::Pep658SidecarMetadataStrategy"),
                StrategyType::DependencyMetadata,
                "pep658_sidecar",
            )
            .with_precedence(90),
            candidate_resolver,
            client,
        }
    }
}

/// Reads a cached PEP 691 document back into a [`ProjectInfo`].
fn read_project_info(path: &Path) -> Result<ProjectInfo, StrategyError> {
    let text = fs_err::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| StrategyError::IndexParse(e.to_string()))
}

#[async_trait]
impl ResolveStrategy for Pep658SidecarMetadataStrategy {
    fn config(&self) -> &StrategyConfig {
        &self.config
    }

    async fn resolve(
        &self,
        dest_dir: &Path,
        request: ResolveRequest<'_>,
    ) -> Result<Option<StrategyOutcome>, StrategyError> {
        let Some(wheel_key) = request.wheel_key else {
            return Ok(None);
        };

        let Some(candidate_entry) = self
            .candidate_resolver
            .resolve(request.spec, wheel_key, None, None, false)
            .await
            .map_err(|e| StrategyError::IndexParse(e.to_string()))?
        else {
            return Ok(None);
        };
        let project_info = read_project_info(&candidate_entry.path)?;

        let Some(file) = best_wheel_file(&project_info, wheel_key, request.spec)? else {
            return Ok(None);
        };
        if !file.core_metadata.available {
            tracing::debug!(
                filename = %file.filename,
                "index advertises no sidecar metadata"
            );
            return Ok(None);
        }

        let sidecar_url = Url::parse(&format!("{}.metadata", file.url))
            .map_err(|e| StrategyError::IndexParse(e.to_string()))?;
        let dest = dest_dir.join(format!("{}.metadata", file.filename));

        tracing::debug!(url = %sidecar_url, "fetching sidecar metadata");
        let path = download_to_file(
            &self.client,
            sidecar_url.clone(),
            &dest,
            simple_api_headers(),
            self.config.fetch_timeout(),
        )
        .await?;
        Ok(Some(StrategyOutcome::with_origin(path, sidecar_url.as_str())))
    }
}

/// The last-resort dependency metadata strategy: pull the actual wheel through the wheel resolver,
/// open its archive and copy out the `*.dist-info/METADATA` member as
/// `{canonical_name}-{version}-{chosen_tag}.metadata`.
///
/// When the caller has no URI the strategy asks the candidate-metadata resolver for the project
/// page and picks the wheel URL from there. That resolver is keyed by project name alone, which is
/// what keeps this from recursing back into dependency metadata.
pub struct WheelInspectionMetadataStrategy {
    config: StrategyConfig,
    wheel_resolver: Arc<WheelResolver>,
    candidate_resolver: Arc<MetadataResolver>,
}

impl WheelInspectionMetadataStrategy {
    /// A strategy backed by the given wheel and candidate-metadata resolvers.
    pub fn new(
        wheel_resolver: Arc<WheelResolver>,
        candidate_resolver: Arc<MetadataResolver>,
    ) -> Self {
        Self {
            config: StrategyConfig::new(
                "wheel-inspection-metadata",
                concat!(module_path!(), "::WheelInspectionMetadataStrategy"),
                StrategyType::DependencyMetadata,
                "wheel_inspection",
            )
            .with_precedence(95),
            wheel_resolver,
            candidate_resolver,
        }
    }

    fn extract_metadata_bytes(wheel_path: &Path) -> Result<Vec<u8>, StrategyError> {
        let file = fs_err::File::open(wheel_path)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| StrategyError::WheelArchive(e.to_string()))?;

        let member_name = archive
            .file_names()
            .find(|name| {
                name.ends_with("/METADATA")
                    && Path::new(name)
                        .parent()
                        .and_then(|p| p.to_str())
                        .is_some_and(|p| p.ends_with(".dist-info"))
            })
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                StrategyError::WheelArchive(format!(
                    "no dist-info METADATA member in {}",
                    wheel_path.display()
                ))
            })?;

        let mut member = archive
            .by_name(&member_name)
            .map_err(|e| StrategyError::WheelArchive(e.to_string()))?;
        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut member, &mut bytes)?;
        Ok(bytes)
    }
}

#[async_trait]
impl ResolveStrategy for WheelInspectionMetadataStrategy {
    fn config(&self) -> &StrategyConfig {
        &self.config
    }

    async fn resolve(
        &self,
        dest_dir: &Path,
        request: ResolveRequest<'_>,
    ) -> Result<Option<StrategyOutcome>, StrategyError> {
        let Some(wheel_key) = request.wheel_key else {
            return Ok(None);
        };

        let uri = match request.uri {
            Some(uri) => uri.clone(),
            None => {
                let Some(candidate_entry) = self
                    .candidate_resolver
                    .resolve(request.spec, wheel_key, None, None, false)
                    .await
                    .map_err(|e| StrategyError::IndexParse(e.to_string()))?
                else {
                    return Ok(None);
                };
                let project_info = read_project_info(&candidate_entry.path)?;
                let Some(file) = best_wheel_file(&project_info, wheel_key, request.spec)? else {
                    return Ok(None);
                };
                file.url.clone()
            }
        };

        let Some(wheel_entry) = self
            .wheel_resolver
            .resolve(request.spec, &uri, Some(wheel_key), false)
            .await
            .map_err(|e| StrategyError::WheelArchive(e.to_string()))?
        else {
            return Ok(None);
        };

        let bytes = Self::extract_metadata_bytes(&wheel_entry.path)?;
        let dest = dest_dir.join(format!(
            "{}-{}-{}.metadata",
            wheel_key.name, wheel_key.version, wheel_entry.compatibility_tag
        ));
        let path = write_bytes_atomic(&dest, &bytes)?;
        Ok(Some(StrategyOutcome::with_origin(path, uri.as_str())))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn realized_spec() -> CompatibilitySpec {
        let mut spec = CompatibilitySpec::with_python_band("3.10", Some("<3.13")).unwrap();
        spec.realize_python_versions(&["3.11".into()]).unwrap();
        spec
    }

    fn file(filename: &str, core_metadata: bool, yanked: bool) -> ProjectFile {
        serde_json::from_value(serde_json::json!({
            "filename": filename,
            "url": format!("https://files.example/{filename}"),
            "core-metadata": core_metadata,
            "yanked": yanked,
        }))
        .unwrap()
    }

    #[test]
    fn test_best_wheel_file_ranks_by_tag_score() {
        let spec = realized_spec();
        let key = WheelKey::new("foo", "1.0").unwrap();
        let info = ProjectInfo {
            files: vec![
                file("foo-1.0-cp311-cp311-manylinux_2_17_x86_64.whl", true, false),
                file("foo-1.0-py3-none-any.whl", true, false),
                file("foo-1.0-py3-none-any.whl", true, true),
            ],
            ..Default::default()
        };
        let best = best_wheel_file(&info, &key, &spec).unwrap().unwrap();
        assert_eq!(best.filename, "foo-1.0-py3-none-any.whl");
        assert!(!best.yanked.yanked);
    }

    #[test]
    fn test_project_index_url_shape() {
        let key = WheelKey::new("Foo_Bar", "1.0").unwrap();
        let url = project_index_url("https://pypi.org/simple/", &key).unwrap();
        assert_eq!(url.as_str(), "https://pypi.org/simple/foo-bar/");
    }

    #[test]
    fn test_extract_metadata_bytes_from_wheel() {
        use std::io::Write;
        use zip::write::FileOptions;

        let dir = tempfile::tempdir().unwrap();
        let wheel_path = dir.path().join("foo-1.0-py3-none-any.whl");
        let out = fs_err::File::create(&wheel_path).unwrap();
        let mut writer = zip::ZipWriter::new(out);
        writer
            .start_file("foo/__init__.py", FileOptions::default())
            .unwrap();
        writer.write_all(b"").unwrap();
        writer
            .start_file("foo-1.0.dist-info/METADATA", FileOptions::default())
            .unwrap();
        writer
            .write_all(b"Metadata-Version: 2.1\nName: foo\nVersion: 1.0\n")
            .unwrap();
        writer.finish().unwrap();

        let bytes = WheelInspectionMetadataStrategy::extract_metadata_bytes(&wheel_path).unwrap();
        assert!(bytes.starts_with(b"Metadata-Version"));
    }
}
