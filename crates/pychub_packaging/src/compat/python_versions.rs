//! Discovery of the concrete python versions that exist in the world. The compatibility spec only
//! carries a symbolic `[min, max]` band; realizing it requires an actual list of released `X.Y`
//! versions. Discovery strategies are consulted in precedence order and the first one that yields
//! at least one version inside the band wins.

use super::spec::PythonVersionsSpec;
use async_trait::async_trait;
use miette::Diagnostic;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Error raised when every discovery strategy failed or produced nothing inside the band.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum PythonVersionDiscoveryError {
    #[error("no available python versions found for the configured band")]
    NoVersionsFound,

    #[error("no available python versions found; last discovery error: {0}")]
    AllStrategiesFailed(String),
}

/// A source of released python `X.Y` versions.
#[async_trait]
pub trait PythonVersionDiscovery: Send + Sync {
    /// Identifies the strategy in logs.
    fn name(&self) -> &str;

    /// Smaller runs earlier.
    fn precedence(&self) -> u32;

    /// Lists the versions this source knows about, unfiltered.
    async fn list_versions(&self) -> Result<Vec<String>, DiscoveryFetchError>;
}

/// A single strategy's fetch or parse failure; the caller falls through to the next strategy.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum DiscoveryFetchError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),

    #[error("unexpected response body: {0}")]
    Parse(String),
}

/// Queries the ordered strategies and returns the discovered versions that fall inside the spec's
/// band. Strategies that error or return nothing usable are skipped; if none succeed the last
/// error is reported.
pub async fn discover_python_versions(
    spec: &PythonVersionsSpec,
    strategies: &[Box<dyn PythonVersionDiscovery>],
) -> Result<Vec<String>, PythonVersionDiscoveryError> {
    let mut ordered: Vec<&Box<dyn PythonVersionDiscovery>> = strategies.iter().collect();
    ordered.sort_by_key(|s| s.precedence());

    let mut last_error: Option<DiscoveryFetchError> = None;
    for strategy in ordered {
        let versions = match strategy.list_versions().await {
            Ok(versions) => versions,
            Err(err) => {
                tracing::warn!(
                    strategy = strategy.name(),
                    error = %err,
                    "python version discovery strategy failed"
                );
                last_error = Some(err);
                continue;
            }
        };
        if versions.is_empty() {
            continue;
        }

        let filtered = spec.filter_versions(&versions);
        if !filtered.is_empty() {
            tracing::debug!(
                strategy = strategy.name(),
                versions = ?filtered,
                "discovered python versions"
            );
            return Ok(filtered);
        }
    }

    match last_error {
        Some(err) => Err(PythonVersionDiscoveryError::AllStrategiesFailed(
            err.to_string(),
        )),
        None => Err(PythonVersionDiscoveryError::NoVersionsFound),
    }
}

/// The default strategy stack: endoflife.date, then python.org, then the hardcoded fallback.
pub fn default_discovery_strategies(client: reqwest::Client) -> Vec<Box<dyn PythonVersionDiscovery>> {
    vec![
        Box::new(EndOfLifeDiscovery {
            client: client.clone(),
        }),
        Box::new(PythonDownloadsDiscovery { client }),
        Box::new(EnumeratedDefaultDiscovery::default()),
    ]
}

/// Reads release cycles from the endoflife.date JSON API.
pub struct EndOfLifeDiscovery {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct EndOfLifeCycle {
    cycle: String,
}

#[async_trait]
impl PythonVersionDiscovery for EndOfLifeDiscovery {
    fn name(&self) -> &str {
        "endoflife.date"
    }

    fn precedence(&self) -> u32 {
        30
    }

    async fn list_versions(&self) -> Result<Vec<String>, DiscoveryFetchError> {
        let cycles: Vec<EndOfLifeCycle> = self
            .client
            .get("https://endoflife.date/api/python.json")
            .timeout(HTTP_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(cycles.into_iter().map(|c| c.cycle).collect())
    }
}

/// Scrapes `X.Y` versions off the python.org downloads page.
pub struct PythonDownloadsDiscovery {
    client: reqwest::Client,
}

#[async_trait]
impl PythonVersionDiscovery for PythonDownloadsDiscovery {
    fn name(&self) -> &str {
        "python.org"
    }

    fn precedence(&self) -> u32 {
        40
    }

    async fn list_versions(&self) -> Result<Vec<String>, DiscoveryFetchError> {
        static VERSION_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"Python\s+(\d+\.\d+)").unwrap());

        let body = self
            .client
            .get("https://www.python.org/downloads/")
            .timeout(HTTP_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let mut versions: Vec<String> = VERSION_RE
            .captures_iter(&body)
            .map(|caps| caps[1].to_owned())
            .collect();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }
}

/// Hardcoded fallback so a fully offline build still realizes a spec.
pub struct EnumeratedDefaultDiscovery {
    versions: Vec<String>,
}

impl Default for EnumeratedDefaultDiscovery {
    fn default() -> Self {
        Self {
            versions: ["3.14", "3.13", "3.12", "3.11", "3.10"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
        }
    }
}

impl EnumeratedDefaultDiscovery {
    /// A fallback with an explicit version list, mainly for tests.
    pub fn with_versions(versions: Vec<String>) -> Self {
        Self { versions }
    }
}

#[async_trait]
impl PythonVersionDiscovery for EnumeratedDefaultDiscovery {
    fn name(&self) -> &str {
        "default.enumerated"
    }

    fn precedence(&self) -> u32 {
        1000
    }

    async fn list_versions(&self) -> Result<Vec<String>, DiscoveryFetchError> {
        Ok(self.versions.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Failing;

    #[async_trait]
    impl PythonVersionDiscovery for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn precedence(&self) -> u32 {
            1
        }

        async fn list_versions(&self) -> Result<Vec<String>, DiscoveryFetchError> {
            Err(DiscoveryFetchError::Parse("boom".into()))
        }
    }

    struct OutOfBand;

    #[async_trait]
    impl PythonVersionDiscovery for OutOfBand {
        fn name(&self) -> &str {
            "out-of-band"
        }

        fn precedence(&self) -> u32 {
            2
        }

        async fn list_versions(&self) -> Result<Vec<String>, DiscoveryFetchError> {
            Ok(vec!["2.7".into()])
        }
    }

    #[tokio::test]
    async fn test_falls_through_failures_and_empty_bands() {
        let spec = PythonVersionsSpec::new("3.10", Some("<3.13")).unwrap();
        let strategies: Vec<Box<dyn PythonVersionDiscovery>> = vec![
            Box::new(Failing),
            Box::new(OutOfBand),
            Box::new(EnumeratedDefaultDiscovery::default()),
        ];
        let versions = discover_python_versions(&spec, &strategies).await.unwrap();
        assert_eq!(versions, vec!["3.10", "3.11", "3.12"]);
    }

    #[tokio::test]
    async fn test_reports_last_error_when_everything_fails() {
        let spec = PythonVersionsSpec::new("3.10", Some("<3.13")).unwrap();
        let strategies: Vec<Box<dyn PythonVersionDiscovery>> = vec![Box::new(Failing)];
        let result = discover_python_versions(&spec, &strategies).await;
        assert!(matches!(
            result,
            Err(PythonVersionDiscoveryError::AllStrategiesFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_precedence_orders_strategies() {
        let spec = PythonVersionsSpec::new("3.10", None).unwrap();
        let strategies: Vec<Box<dyn PythonVersionDiscovery>> = vec![
            Box::new(EnumeratedDefaultDiscovery::with_versions(vec!["3.10".into()])),
            Box::new(OutOfBand),
        ];
        // OutOfBand has lower precedence but yields nothing in band; the enumerated
        // fallback still wins.
        let versions = discover_python_versions(&spec, &strategies).await.unwrap();
        assert_eq!(versions, vec!["3.10"]);
    }
}
