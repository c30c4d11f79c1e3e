use super::config::{StrategyConfig, StrategyType};
use super::strategy::{
    copy_file_atomic, download_to_file, ResolveRequest, ResolveStrategy, StrategyError,
    StrategyOutcome,
};
use crate::types::wheel_filename_from_uri;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use std::path::Path;

/// Copies wheels that are reachable through the local filesystem (`file://` URIs).
pub struct FilesystemWheelStrategy {
    config: StrategyConfig,
    supported_schemes: Vec<String>,
}

impl Default for FilesystemWheelStrategy {
    fn default() -> Self {
        Self {
            config: StrategyConfig::new(
                "filesystem-wheel",
                concat!(module_path!(), "::FilesystemWheelStrategy"),
                StrategyType::WheelFile,
                "filesystem_wheel",
            )
            .with_precedence(50),
            supported_schemes: vec!["file".into()],
        }
    }
}

impl FilesystemWheelStrategy {
    /// A strategy with a custom config, e.g. a different criticality.
    pub fn with_config(config: StrategyConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ResolveStrategy for FilesystemWheelStrategy {
    fn config(&self) -> &StrategyConfig {
        &self.config
    }

    async fn resolve(
        &self,
        dest_dir: &Path,
        request: ResolveRequest<'_>,
    ) -> Result<Option<StrategyOutcome>, StrategyError> {
        let Some(uri) = request.uri else {
            return Ok(None);
        };
        if !self.supported_schemes.iter().any(|s| s == uri.scheme()) {
            return Ok(None);
        }
        let Ok(src) = uri.to_file_path() else {
            return Ok(None);
        };
        if !src.is_file() {
            return Ok(None);
        }

        let Some(file_name) = src.file_name() else {
            return Ok(None);
        };
        let dest = dest_dir.join(file_name);
        if dest.exists() {
            return Ok(Some(StrategyOutcome::with_origin(dest, uri.as_str())));
        }

        tracing::debug!(src = %src.display(), dest = %dest.display(), "copying local wheel");
        let path = copy_file_atomic(&src, &dest)?;
        Ok(Some(StrategyOutcome::with_origin(path, uri.as_str())))
    }
}

/// Downloads wheels from direct `http(s)` URLs.
pub struct HttpWheelStrategy {
    config: StrategyConfig,
    supported_schemes: Vec<String>,
    client: reqwest::Client,
}

impl HttpWheelStrategy {
    /// A strategy using the given HTTP client.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            config: StrategyConfig::new(
                "http-wheel",
                concat!(module_path!(), "::HttpWheelStrategy"),
                StrategyType::WheelFile,
                "https_wheel",
            )
            .with_precedence(40),
            supported_schemes: vec!["http".into(), "https".into()],
            client,
        }
    }

    /// A strategy with a custom config, e.g. a different criticality.
    pub fn with_config(client: reqwest::Client, config: StrategyConfig) -> Self {
        Self {
            config,
            ..Self::new(client)
        }
    }
}

#[async_trait]
impl ResolveStrategy for HttpWheelStrategy {
    fn config(&self) -> &StrategyConfig {
        &self.config
    }

    async fn resolve(
        &self,
        dest_dir: &Path,
        request: ResolveRequest<'_>,
    ) -> Result<Option<StrategyOutcome>, StrategyError> {
        let Some(uri) = request.uri else {
            return Ok(None);
        };
        if !self.supported_schemes.iter().any(|s| s == uri.scheme()) {
            return Ok(None);
        }
        // Only direct file URLs are downloadable.
        let Some(filename) = wheel_filename_from_uri(uri) else {
            return Ok(None);
        };

        let dest = dest_dir.join(&filename);
        tracing::debug!(url = %uri, dest = %dest.display(), "downloading wheel");
        let path = download_to_file(
            &self.client,
            uri.clone(),
            &dest,
            HeaderMap::new(),
            self.config.fetch_timeout(),
        )
        .await?;
        Ok(Some(StrategyOutcome::with_origin(path, uri.as_str())))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compat::CompatibilitySpec;
    use url::Url;

    fn realized_spec() -> CompatibilitySpec {
        let mut spec = CompatibilitySpec::with_python_band("3.10", Some("<3.13")).unwrap();
        spec.realize_python_versions(&["3.11".into()]).unwrap();
        spec
    }

    #[tokio::test]
    async fn test_filesystem_copies_and_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("foo-1.0-py3-none-any.whl");
        fs_err::write(&src, b"wheel bytes").unwrap();
        let dest_dir = dir.path().join("wheels");

        let spec = realized_spec();
        let uri = Url::from_file_path(&src).unwrap();
        let strategy = FilesystemWheelStrategy::default();
        let request = ResolveRequest {
            uri: Some(&uri),
            wheel_key: None,
            spec: &spec,
            context: None,
        };

        let outcome = strategy.resolve(&dest_dir, request).await.unwrap().unwrap();
        assert_eq!(outcome.path, dest_dir.join("foo-1.0-py3-none-any.whl"));
        assert_eq!(fs_err::read(&outcome.path).unwrap(), b"wheel bytes");

        // A second resolve reuses the already-copied file.
        let outcome = strategy.resolve(&dest_dir, request).await.unwrap().unwrap();
        assert_eq!(outcome.path, dest_dir.join("foo-1.0-py3-none-any.whl"));
    }

    #[tokio::test]
    async fn test_filesystem_ignores_foreign_schemes_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let spec = realized_spec();
        let strategy = FilesystemWheelStrategy::default();

        let http_uri = Url::parse("https://files.example/foo-1.0-py3-none-any.whl").unwrap();
        let outcome = strategy
            .resolve(
                dir.path(),
                ResolveRequest {
                    uri: Some(&http_uri),
                    wheel_key: None,
                    spec: &spec,
                    context: None,
                },
            )
            .await
            .unwrap();
        assert!(outcome.is_none());

        let missing = Url::from_file_path(dir.path().join("nope-1.0-py3-none-any.whl")).unwrap();
        let outcome = strategy
            .resolve(
                dir.path(),
                ResolveRequest {
                    uri: Some(&missing),
                    wheel_key: None,
                    spec: &spec,
                    context: None,
                },
            )
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_http_ignores_file_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let spec = realized_spec();
        let strategy = HttpWheelStrategy::new(reqwest::Client::new());
        let uri = Url::parse("file:///tmp/foo-1.0-py3-none-any.whl").unwrap();
        let outcome = strategy
            .resolve(
                dir.path(),
                ResolveRequest {
                    uri: Some(&uri),
                    wheel_key: None,
                    spec: &spec,
                    context: None,
                },
            )
            .await
            .unwrap();
        assert!(outcome.is_none());
    }
}
