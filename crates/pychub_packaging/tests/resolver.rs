//! End-to-end tests of the artifact resolvers: cache population, TTL behavior, strategy
//! fallthrough and the wheel-inspection metadata fallback, all against local fixtures.

use async_trait::async_trait;
use pychub_packaging::compat::CompatibilitySpec;
use pychub_packaging::resolve::ResolutionContext;
use pychub_packaging::resolver::{
    compute_hash_and_size, FilesystemWheelStrategy, MetadataResolver,
    Pep658SidecarMetadataStrategy, ResolveRequest, ResolveStrategy, ResolverConfig, ResolverError,
    StrategyConfig, StrategyCriticality, StrategyError, StrategyOutcome, StrategyType,
    WheelInspectionMetadataStrategy, WheelResolver,
};
use pychub_packaging::types::WheelKey;
use pychub_packaging::Version;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

const WHEEL_METADATA: &[u8] = b"Metadata-Version: 2.1\nName: foo\nVersion: 1.0\n";

fn realized_spec() -> CompatibilitySpec {
    let mut spec = CompatibilitySpec::with_python_band("3.10", Some("<3.13")).unwrap();
    spec.realize_python_versions(&["3.10".into(), "3.11".into(), "3.12".into()])
        .unwrap();
    spec
}

fn context() -> ResolutionContext {
    ResolutionContext::new(
        "x86_64",
        "linux",
        "cpython",
        Version::from_str("3.11").unwrap(),
        "py3-none-any".parse().unwrap(),
    )
}

/// Writes a minimal but valid wheel archive for `foo 1.0`.
fn write_wheel_fixture(path: &Path) {
    let out = fs_err::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(out);
    let options = zip::write::FileOptions::default();
    writer.start_file("foo/__init__.py", options).unwrap();
    writer.write_all(b"").unwrap();
    writer.start_file("foo-1.0.dist-info/METADATA", options).unwrap();
    writer.write_all(WHEEL_METADATA).unwrap();
    writer.finish().unwrap();
}

/// Counts invocations and delegates to an inner strategy, to observe cache behavior.
struct CountingStrategy<S> {
    inner: S,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl<S: ResolveStrategy> ResolveStrategy for CountingStrategy<S> {
    fn config(&self) -> &StrategyConfig {
        self.inner.config()
    }

    async fn resolve(
        &self,
        dest_dir: &Path,
        request: ResolveRequest<'_>,
    ) -> Result<Option<StrategyOutcome>, StrategyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve(dest_dir, request).await
    }
}

/// Always fails, with a configurable criticality.
struct FailingStrategy {
    config: StrategyConfig,
}

impl FailingStrategy {
    fn new(criticality: StrategyCriticality) -> Self {
        Self {
            config: StrategyConfig::new(
                "always-fails",
                "tests::FailingStrategy",
                StrategyType::WheelFile,
                "failing",
            )
            .with_precedence(10)
            .with_criticality(criticality),
        }
    }
}

#[async_trait]
impl ResolveStrategy for FailingStrategy {
    fn config(&self) -> &StrategyConfig {
        &self.config
    }

    async fn resolve(
        &self,
        _dest_dir: &Path,
        _request: ResolveRequest<'_>,
    ) -> Result<Option<StrategyOutcome>, StrategyError> {
        Err(StrategyError::IndexParse("synthetic failure".into()))
    }
}

/// Serves a pre-baked PEP 691 document from disk as candidate metadata.
struct StubSimpleApiStrategy {
    config: StrategyConfig,
    body: String,
}

impl StubSimpleApiStrategy {
    fn new(body: String) -> Self {
        Self {
            config: StrategyConfig::new(
                "stub-simple-api",
                "tests::StubSimpleApiStrategy",
                StrategyType::CandidateMetadata,
                "stub",
            ),
            body,
        }
    }
}

#[async_trait]
impl ResolveStrategy for StubSimpleApiStrategy {
    fn config(&self) -> &StrategyConfig {
        &self.config
    }

    async fn resolve(
        &self,
        dest_dir: &Path,
        request: ResolveRequest<'_>,
    ) -> Result<Option<StrategyOutcome>, StrategyError> {
        let key = request.wheel_key.expect("candidate requests carry a key");
        let dest = dest_dir.join(format!("{}.pep691.json", key.name));
        fs_err::create_dir_all(dest_dir)?;
        fs_err::write(&dest, &self.body)?;
        Ok(Some(StrategyOutcome::with_origin(dest, "stub:simple-api")))
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    local_root: PathBuf,
    global_root: PathBuf,
    wheel_path: PathBuf,
    wheel_uri: Url,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let local_root = dir.path().join("staging");
    let global_root = dir.path().join("global");
    let wheel_path = dir.path().join("foo-1.0-py3-none-any.whl");
    write_wheel_fixture(&wheel_path);
    let wheel_uri = Url::from_file_path(&wheel_path).unwrap();
    Fixture {
        _dir: dir,
        local_root,
        global_root,
        wheel_path,
        wheel_uri,
    }
}

#[tokio::test]
async fn test_filesystem_wheel_populates_cache() {
    let fx = fixture();
    let spec = realized_spec();
    let resolver = WheelResolver::new(
        ResolverConfig::for_wheels(fx.local_root.clone(), fx.global_root.clone()),
        vec![Box::new(FilesystemWheelStrategy::default())],
    )
    .unwrap();

    let entry = resolver
        .resolve(&spec, &fx.wheel_uri, None, false)
        .await
        .unwrap()
        .expect("wheel should resolve");

    assert_eq!(entry.key, "foo-1.0-py3-none-any");
    assert_eq!(entry.wheel_key, WheelKey::new("foo", "1.0").unwrap());
    assert_eq!(entry.compatibility_tag.to_string(), "py3-none-any");
    assert_eq!(entry.expiration, None, "wheels never expire by default");

    // The cached bytes are identical to the source and the recorded hash/size match.
    assert_eq!(
        fs_err::read(&entry.path).unwrap(),
        fs_err::read(&fx.wheel_path).unwrap()
    );
    let (hash, size) = compute_hash_and_size(&fx.wheel_path).unwrap();
    assert_eq!(entry.hash, hash);
    assert_eq!(entry.size_bytes, size);

    // The index was persisted next to the artifacts.
    assert!(fx
        .local_root
        .join("wheels")
        .join(".wheel_index.json")
        .exists());
}

#[tokio::test]
async fn test_cache_hit_skips_strategies_and_refetches_on_loss() {
    let fx = fixture();
    let spec = realized_spec();
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = WheelResolver::new(
        ResolverConfig::for_wheels(fx.local_root.clone(), fx.global_root.clone()),
        vec![Box::new(CountingStrategy {
            inner: FilesystemWheelStrategy::default(),
            calls: calls.clone(),
        })],
    )
    .unwrap();

    let first = resolver
        .resolve(&spec, &fx.wheel_uri, None, false)
        .await
        .unwrap()
        .unwrap();
    resolver
        .resolve(&spec, &fx.wheel_uri, None, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1, "second resolve is a cache hit");

    // Removing the file behind the cache's back forces a refetch that produces an
    // equivalent entry.
    fs_err::remove_file(&first.path).unwrap();
    let refetched = resolver
        .resolve(&spec, &fx.wheel_uri, None, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(refetched.wheel_key, first.wheel_key);
    assert_eq!(refetched.compatibility_tag, first.compatibility_tag);
    assert!(refetched.path.exists());
}

#[tokio::test]
async fn test_expired_entry_is_refetched() {
    let fx = fixture();
    let spec = realized_spec();

    // First populate a cache whose entries expire after a minute.
    let config = ResolverConfig::for_wheels(fx.local_root.clone(), fx.global_root.clone())
        .with_update_interval(1);
    let resolver = WheelResolver::new(
        config.clone(),
        vec![Box::new(FilesystemWheelStrategy::default())],
    )
    .unwrap();
    let entry = resolver
        .resolve(&spec, &fx.wheel_uri, None, false)
        .await
        .unwrap()
        .unwrap();
    assert!(entry.expiration.is_some());
    drop(resolver);

    // Rewrite the persisted index with an expiration in the past, as if the clock advanced.
    let index_path = fx.local_root.join("wheels").join(".wheel_index.json");
    let text = fs_err::read_to_string(&index_path).unwrap();
    let mut index: serde_json::Value = serde_json::from_str(&text).unwrap();
    index["foo-1.0-py3-none-any"]["expiration"] = serde_json::json!("2020-01-01T00:00:00Z");
    fs_err::write(&index_path, serde_json::to_string(&index).unwrap()).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = WheelResolver::new(
        config,
        vec![Box::new(CountingStrategy {
            inner: FilesystemWheelStrategy::default(),
            calls: calls.clone(),
        })],
    )
    .unwrap();
    let refreshed = resolver
        .resolve(&spec, &fx.wheel_uri, None, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1, "expired entry forces a refetch");
    assert!(refreshed.expiration.unwrap() > chrono::Utc::now());
}

#[tokio::test]
async fn test_optional_failure_falls_through_imperative_propagates() {
    let fx = fixture();
    let spec = realized_spec();

    // An optional strategy that fails is skipped and the filesystem strategy succeeds.
    let resolver = WheelResolver::new(
        ResolverConfig::for_wheels(fx.local_root.clone(), fx.global_root.clone()),
        vec![
            Box::new(FailingStrategy::new(StrategyCriticality::Optional)),
            Box::new(FilesystemWheelStrategy::default()),
        ],
    )
    .unwrap();
    let entry = resolver
        .resolve(&spec, &fx.wheel_uri, None, false)
        .await
        .unwrap();
    assert!(entry.is_some());
    assert_eq!(resolver.cached_entries().len(), 1);

    // The same failure from an imperative strategy aborts the resolve.
    let resolver = WheelResolver::new(
        ResolverConfig::for_wheels(fx.local_root.join("b"), fx.global_root.clone()),
        vec![
            Box::new(FailingStrategy::new(StrategyCriticality::Imperative)),
            Box::new(FilesystemWheelStrategy::default()),
        ],
    )
    .unwrap();
    let result = resolver.resolve(&spec, &fx.wheel_uri, None, false).await;
    assert!(matches!(
        result,
        Err(ResolverError::ImperativeStrategyFailed { .. })
    ));
}

#[tokio::test]
async fn test_wheel_inspection_when_index_has_no_sidecar() {
    let fx = fixture();
    let spec = realized_spec();
    let ctx = context();

    // The stub index advertises the wheel but with core-metadata: false, so the PEP 658
    // strategy must decline and the wheel-inspection fallback must produce the bytes.
    let pep691_body = serde_json::json!({
        "meta": {"api-version": "1.1"},
        "files": [{
            "filename": "foo-1.0-py3-none-any.whl",
            "url": fx.wheel_uri.as_str(),
            "core-metadata": false,
        }]
    })
    .to_string();

    let wheel_resolver = Arc::new(
        WheelResolver::new(
            ResolverConfig::for_wheels(fx.local_root.clone(), fx.global_root.clone()),
            vec![Box::new(FilesystemWheelStrategy::default())],
        )
        .unwrap(),
    );
    let candidate_resolver = Arc::new(
        MetadataResolver::candidate(
            ResolverConfig::for_metadata(fx.local_root.clone(), fx.global_root.clone()),
            vec![Box::new(StubSimpleApiStrategy::new(pep691_body))],
        )
        .unwrap(),
    );
    let dependency_resolver = MetadataResolver::dependency(
        ResolverConfig::for_metadata(fx.local_root.clone(), fx.global_root.clone()),
        vec![
            Box::new(Pep658SidecarMetadataStrategy::new(
                reqwest::Client::new(),
                candidate_resolver.clone(),
            )),
            Box::new(WheelInspectionMetadataStrategy::new(
                wheel_resolver.clone(),
                candidate_resolver.clone(),
            )),
        ],
    )
    .unwrap();

    let key = WheelKey::new("foo", "1.0").unwrap();
    let entry = dependency_resolver
        .resolve(&spec, &key, None, Some(&ctx), false)
        .await
        .unwrap()
        .expect("wheel inspection should produce metadata");

    assert_eq!(entry.key, "foo-1.0-py3-none-any");
    assert_eq!(entry.metadata_type, StrategyType::DependencyMetadata);
    assert_eq!(fs_err::read(&entry.path).unwrap(), WHEEL_METADATA);

    // The wheel itself landed in the wheel cache on the way.
    assert_eq!(wheel_resolver.cached_entries().len(), 1);
}

#[tokio::test]
async fn test_dependency_metadata_requires_a_context() {
    let fx = fixture();
    let spec = realized_spec();
    let resolver = MetadataResolver::dependency(
        ResolverConfig::for_metadata(fx.local_root.clone(), fx.global_root.clone()),
        vec![],
    )
    .unwrap();

    let key = WheelKey::new("foo", "1.0").unwrap();
    let result = resolver.resolve(&spec, &key, None, None, false).await;
    assert!(matches!(
        result,
        Err(ResolverError::NoActiveResolutionContext)
    ));
}

#[tokio::test]
async fn test_racing_resolves_for_one_key_write_once() {
    let fx = fixture();
    let spec = Arc::new(realized_spec());
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = Arc::new(
        WheelResolver::new(
            ResolverConfig::for_wheels(fx.local_root.clone(), fx.global_root.clone()),
            vec![Box::new(CountingStrategy {
                inner: FilesystemWheelStrategy::default(),
                calls: calls.clone(),
            })],
        )
        .unwrap(),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let resolver = resolver.clone();
        let spec = spec.clone();
        let uri = fx.wheel_uri.clone();
        handles.push(tokio::spawn(async move {
            resolver.resolve(&spec, &uri, None, false).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_some());
    }

    assert_eq!(
        calls.load(Ordering::SeqCst),
        1,
        "racing callers for one key must observe a single write"
    );
    assert_eq!(resolver.cached_entries().len(), 1);
}
