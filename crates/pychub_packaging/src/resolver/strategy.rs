use super::config::StrategyConfig;
use crate::compat::{CompatibilitySpec, NotRealizedError};
use crate::resolve::ResolutionContext;
use crate::types::WheelKey;
use async_trait::async_trait;
use futures::StreamExt;
use miette::Diagnostic;
use reqwest::header::HeaderMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Everything a strategy may need for one resolution: the requested artifact (by URI, by wheel
/// key, or both), the realized compatibility spec, and the active resolution context when one
/// exists. This is the explicit form of the ambient state the resolvers operate under.
#[derive(Clone, Copy)]
pub struct ResolveRequest<'a> {
    /// Source location, when the caller knows one.
    pub uri: Option<&'a Url>,

    /// The wheel identity being resolved, when the caller knows one.
    pub wheel_key: Option<&'a WheelKey>,

    /// The realized compatibility spec.
    pub spec: &'a CompatibilitySpec,

    /// The resolution context of the current dependency-tree walk, when inside one.
    pub context: Option<&'a ResolutionContext>,
}

/// A successful strategy resolution: the file it produced and, when known, the real origin.
#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    /// The artifact on disk, inside the destination directory the resolver passed in.
    pub path: PathBuf,

    /// Provenance of the bytes; the resolver substitutes `strategy:{name}` when absent.
    pub origin_uri: Option<String>,
}

impl StrategyOutcome {
    /// An outcome with known provenance.
    pub fn with_origin(path: PathBuf, origin: impl Into<String>) -> Self {
        Self {
            path,
            origin_uri: Some(origin.into()),
        }
    }
}

/// A strategy-internal failure. Whether it propagates depends on the strategy's criticality; the
/// resolver swallows it for anything but imperative strategies.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum StrategyError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("failed to read wheel archive: {0}")]
    WheelArchive(String),

    #[error("failed to parse index response: {0}")]
    IndexParse(String),

    #[error(transparent)]
    NotRealized(#[from] NotRealizedError),
}

/// One unit of artifact resolution. Implementations declare their identity and ordering through
/// [`StrategyConfig`] and perform a single operation: produce a local file for the request, or
/// `None` when the request is simply not theirs to handle.
#[async_trait]
pub trait ResolveStrategy: Send + Sync {
    /// The frozen configuration of this strategy.
    fn config(&self) -> &StrategyConfig;

    /// Attempts to materialize the requested artifact into `dest_dir`.
    ///
    /// `Ok(None)` means "not applicable" or "not found here" and lets the resolver fall through;
    /// `Err` is a real failure whose effect depends on the strategy's criticality.
    async fn resolve(
        &self,
        dest_dir: &Path,
        request: ResolveRequest<'_>,
    ) -> Result<Option<StrategyOutcome>, StrategyError>;
}

fn tmp_path(dest: &Path) -> PathBuf {
    let mut file_name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    file_name.push(".tmp");
    dest.with_file_name(file_name)
}

/// Streams `url` into `dest`. The body lands in `{dest}.tmp` first and is renamed over the target
/// only once fully written; on any failure the temporary file is removed.
pub async fn download_to_file(
    client: &reqwest::Client,
    url: Url,
    dest: &Path,
    headers: HeaderMap,
    timeout: Duration,
) -> Result<PathBuf, StrategyError> {
    if let Some(parent) = dest.parent() {
        fs_err::create_dir_all(parent)?;
    }
    let tmp = tmp_path(dest);

    let result = async {
        let response = client
            .get(url.clone())
            .headers(headers)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;

        let mut out = fs_err::File::create(&tmp)?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            out.write_all(chunk?.as_ref())?;
        }
        out.flush()?;
        drop(out);

        fs_err::rename(&tmp, dest)?;
        Ok(dest.to_path_buf())
    }
    .await;

    if result.is_err() {
        let _ = fs_err::remove_file(&tmp);
    }
    result
}

/// Writes `data` to `dest` through the same `{dest}.tmp` + rename dance as
/// [`download_to_file`].
pub fn write_bytes_atomic(dest: &Path, data: &[u8]) -> Result<PathBuf, StrategyError> {
    if let Some(parent) = dest.parent() {
        fs_err::create_dir_all(parent)?;
    }
    let tmp = tmp_path(dest);

    let result = (|| {
        fs_err::write(&tmp, data)?;
        fs_err::rename(&tmp, dest)?;
        Ok(dest.to_path_buf())
    })();

    if result.is_err() {
        let _ = fs_err::remove_file(&tmp);
    }
    result
}

/// Copies a local file to `dest` atomically.
pub fn copy_file_atomic(src: &Path, dest: &Path) -> Result<PathBuf, StrategyError> {
    if let Some(parent) = dest.parent() {
        fs_err::create_dir_all(parent)?;
    }
    let tmp = tmp_path(dest);

    let result = (|| {
        fs_err::copy(src, &tmp)?;
        fs_err::rename(&tmp, dest)?;
        Ok(dest.to_path_buf())
    })();

    if result.is_err() {
        let _ = fs_err::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tmp_path_keeps_extension_visible() {
        assert_eq!(
            tmp_path(Path::new("/cache/wheels/foo-1.0-py3-none-any.whl")),
            Path::new("/cache/wheels/foo-1.0-py3-none-any.whl.tmp")
        );
    }

    #[test]
    fn test_write_bytes_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("sub").join("out.metadata");

        let written = write_bytes_atomic(&dest, b"payload").unwrap();
        assert_eq!(written, dest);
        assert_eq!(fs_err::read(&dest).unwrap(), b"payload");
        assert!(!tmp_path(&dest).exists());
    }

    #[test]
    fn test_copy_file_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.whl");
        fs_err::write(&src, b"wheel bytes").unwrap();

        let dest = dir.path().join("wheels").join("src.whl");
        copy_file_atomic(&src, &dest).unwrap();
        assert_eq!(fs_err::read(&dest).unwrap(), b"wheel bytes");
        assert!(!tmp_path(&dest).exists());
    }
}
