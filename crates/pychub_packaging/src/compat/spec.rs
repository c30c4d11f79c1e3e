use crate::tags::{parse_compressed_tag, WheelTag};
use indexmap::{IndexMap, IndexSet};
use miette::Diagnostic;
use once_cell::sync::Lazy;
use pep440_rs::{Version, VersionSpecifiers};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use thiserror::Error;

/// Raised when derived compatibility state is read before
/// [`CompatibilitySpec::realize_python_versions`] ran. This is a programmer error, not a normal
/// rejection.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("compatibility spec is not realized; python versions must be discovered first")]
pub struct NotRealizedError;

/// Errors produced while validating or realizing a compatibility spec.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum CompatibilitySpecError {
    #[error("python 'min' version must look like X.Y, got '{0}'")]
    InvalidMin(String),

    #[error("python 'max' version must look like '<X.Y' or '<=X.Y', got '{0}'")]
    InvalidMax(String),

    #[error("invalid tag '{tag}' in compatibility tags profile '{profile}'")]
    InvalidProfileTag { profile: String, tag: String },

    #[error("platform family '{family}' bound '{bound}' must be '*' or a major[.minor] version")]
    InvalidFamilyBound { family: String, bound: String },

    #[error("no discovered python versions fall within [{min}, {max}]")]
    NoVersionsInRange { min: String, max: String },
}

static MIN_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(\d+\.\d+)\s*$").unwrap());
static MAX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(<=|<)?\s*(\d+\.\d+)\s*$").unwrap());

/// The `[PythonVersions]` block of a compatibility spec: a `[min, max]` band over `X.Y` versions
/// plus explicit inclusion and exclusion lists for interpreter labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPythonVersionsSpec")]
pub struct PythonVersionsSpec {
    /// Lower bound, inclusive, as `X.Y`.
    pub min: String,

    /// Upper bound as `<X.Y` or `<=X.Y`. Defaults to `<(min_major+1).0` when unset.
    pub max: String,

    /// Interpreter type labels carried through verbatim (e.g. "cpython").
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,

    /// Whether `pyN` universal interpreter labels are accepted for in-band majors.
    #[serde(default = "default_true")]
    pub accept_universal: bool,

    /// Interpreter labels that are always accepted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specific: Vec<String>,

    /// When set, `specific` becomes a pure whitelist.
    #[serde(default, skip_serializing_if = "is_false")]
    pub specific_only: bool,

    /// Interpreter labels that are always rejected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, Deserialize)]
struct RawPythonVersionsSpec {
    min: String,
    #[serde(default)]
    max: Option<String>,
    #[serde(default)]
    types: Vec<String>,
    #[serde(default = "default_true")]
    accept_universal: bool,
    #[serde(default)]
    specific: Vec<String>,
    #[serde(default)]
    specific_only: bool,
    #[serde(default)]
    excludes: Vec<String>,
}

impl TryFrom<RawPythonVersionsSpec> for PythonVersionsSpec {
    type Error = CompatibilitySpecError;

    fn try_from(raw: RawPythonVersionsSpec) -> Result<Self, Self::Error> {
        PythonVersionsSpec::new(&raw.min, raw.max.as_deref()).map(|mut spec| {
            spec.types = raw.types;
            spec.accept_universal = raw.accept_universal;
            spec.specific = raw.specific;
            spec.specific_only = raw.specific_only;
            spec.excludes = raw.excludes;
            spec
        })
    }
}

impl PythonVersionsSpec {
    /// Validates and normalizes the band. A missing `max` is synthesized as `<(min_major+1).0`,
    /// and a bare `X.Y` max gets the implied `<=` operator.
    pub fn new(min: &str, max: Option<&str>) -> Result<Self, CompatibilitySpecError> {
        let min_caps = MIN_PATTERN
            .captures(min)
            .ok_or_else(|| CompatibilitySpecError::InvalidMin(min.to_owned()))?;
        let min = min_caps[1].to_owned();

        let max = match max {
            None => {
                let min_major: u64 = min
                    .split('.')
                    .next()
                    .and_then(|m| m.parse().ok())
                    .ok_or_else(|| CompatibilitySpecError::InvalidMin(min.clone()))?;
                format!("<{}.0", min_major + 1)
            }
            Some(max) => {
                let caps = MAX_PATTERN
                    .captures(max)
                    .ok_or_else(|| CompatibilitySpecError::InvalidMax(max.to_owned()))?;
                let op = caps.get(1).map_or("<=", |m| m.as_str());
                format!("{op}{}", &caps[2])
            }
        };

        Ok(Self {
            min,
            max,
            types: Vec::new(),
            accept_universal: true,
            specific: Vec::new(),
            specific_only: false,
            excludes: Vec::new(),
        })
    }

    fn max_parts(&self) -> (bool, Version) {
        // The constructor guarantees the normalized `(<|<=)X.Y` shape.
        let caps = MAX_PATTERN.captures(&self.max).expect("max was validated");
        let inclusive = caps.get(1).map_or(true, |op| op.as_str() == "<=");
        (inclusive, Version::from_str(&caps[2]).expect("max was validated"))
    }

    /// Keeps the candidates inside `[min, max]`, deduplicated and sorted ascending.
    pub fn filter_versions(&self, candidates: &[String]) -> Vec<String> {
        let min_v = Version::from_str(&self.min).expect("min was validated");
        let (max_inclusive, max_v) = self.max_parts();

        let mut kept: BTreeSet<Version> = BTreeSet::new();
        for candidate in candidates {
            let Ok(v) = Version::from_str(candidate) else {
                continue;
            };
            if v < min_v {
                continue;
            }
            if (max_inclusive && v > max_v) || (!max_inclusive && v >= max_v) {
                continue;
            }
            kept.insert(v);
        }
        kept.into_iter().map(|v| v.to_string()).collect()
    }

    /// The band expressed as PEP 440 specifiers, e.g. `>=3.10, <3.13`.
    pub fn specifiers(&self) -> VersionSpecifiers {
        VersionSpecifiers::from_str(&format!(">={},{}", self.min, self.max))
            .expect("min and max were validated")
    }
}

/// The `[AbiValues]` block of a compatibility spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiValuesSpec {
    /// Whether debug ABIs (trailing `d`) are accepted.
    #[serde(default)]
    pub include_debug: bool,

    /// Whether stable ABIs (`abiN`) are accepted for in-band majors.
    #[serde(default)]
    pub include_stable: bool,

    /// ABI labels that are always accepted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specific: Vec<String>,

    /// When set, `specific` becomes a pure whitelist.
    #[serde(default, skip_serializing_if = "is_false")]
    pub specific_only: bool,

    /// ABI labels that are always rejected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
}

/// Version bounds for one platform family (e.g. `manylinux`). `"*"` means unbounded on that side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFamilySpec {
    /// Minimum family version, inclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,

    /// Maximum family version, inclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
}

/// One OS block of the `[PlatformValues]` table. Any key that is not one of the fixed fields is a
/// platform family (e.g. `manylinux`, `musllinux`) with its own version bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformOSSpec {
    /// Architectures this OS block allows. Empty means no arch filtering.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arches: Vec<String>,

    /// Platform tags that are always accepted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specific: Vec<String>,

    /// When set, this block contributes its `specific` list to a whitelist union.
    #[serde(default, skip_serializing_if = "is_false")]
    pub specific_only: bool,

    /// Platform tags that are always rejected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,

    /// Family name to version bounds.
    #[serde(flatten)]
    pub families: IndexMap<String, PlatformFamilySpec>,
}

/// One profile of the `[CompatibilityTags]` table: explicit full-tag inclusion and exclusion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityTagsSpec {
    /// Compressed tag strings that are accepted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specific: Vec<String>,

    /// When set, the profile contributes its `specific` tags to a whitelist.
    #[serde(default, skip_serializing_if = "is_false")]
    pub specific_only: bool,

    /// Compressed tag strings that are rejected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
}

/// The full compatibility specification driving tag acceptance. Tag profiles are expanded into
/// flat sets at construction time; the python version band stays symbolic until
/// [`realize_python_versions`](Self::realize_python_versions) pins the concrete `==X.Y` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawCompatibilitySpec", into = "RawCompatibilitySpec")]
pub struct CompatibilitySpec {
    /// The python version band and interpreter rules.
    pub python_versions: PythonVersionsSpec,

    /// The ABI rules.
    pub abi_values: AbiValuesSpec,

    /// Platform rules, keyed by OS name (e.g. "linux").
    pub platform_values: IndexMap<String, PlatformOSSpec>,

    /// Explicit full-tag profiles, keyed by profile name.
    pub compatibility_tags: IndexMap<String, CompatibilityTagsSpec>,

    /// Where this spec came from, for diagnostics.
    pub source_description: String,

    tags: IndexSet<WheelTag>,
    exclude_tags: IndexSet<WheelTag>,
    tags_whitelist: IndexSet<WheelTag>,
    tags_specific_only: bool,
    resolved_python_versions: Option<Vec<Version>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCompatibilitySpec {
    #[serde(rename = "PythonVersions")]
    python_versions: PythonVersionsSpec,

    #[serde(rename = "AbiValues", default, skip_serializing_if = "is_default_abi")]
    abi_values: AbiValuesSpec,

    #[serde(
        rename = "PlatformValues",
        default,
        skip_serializing_if = "IndexMap::is_empty"
    )]
    platform_values: IndexMap<String, PlatformOSSpec>,

    #[serde(
        rename = "CompatibilityTags",
        default,
        skip_serializing_if = "IndexMap::is_empty"
    )]
    compatibility_tags: IndexMap<String, CompatibilityTagsSpec>,
}

fn is_default_abi(abi: &AbiValuesSpec) -> bool {
    *abi == AbiValuesSpec::default()
}

impl TryFrom<RawCompatibilitySpec> for CompatibilitySpec {
    type Error = CompatibilitySpecError;

    fn try_from(raw: RawCompatibilitySpec) -> Result<Self, Self::Error> {
        CompatibilitySpec::new(
            raw.python_versions,
            raw.abi_values,
            raw.platform_values,
            raw.compatibility_tags,
        )
    }
}

impl From<CompatibilitySpec> for RawCompatibilitySpec {
    fn from(spec: CompatibilitySpec) -> Self {
        Self {
            python_versions: spec.python_versions,
            abi_values: spec.abi_values,
            platform_values: spec.platform_values,
            compatibility_tags: spec.compatibility_tags,
        }
    }
}

fn parse_family_bound(family: &str, bound: &str) -> Result<(), CompatibilitySpecError> {
    if bound == "*" || parse_family_version(bound).is_some() {
        Ok(())
    } else {
        Err(CompatibilitySpecError::InvalidFamilyBound {
            family: family.to_owned(),
            bound: bound.to_owned(),
        })
    }
}

/// The leading numeric component of a rendered version, e.g. 3 for "3.11".
pub(crate) fn major_of(version: &str) -> Option<u64> {
    version.split('.').next()?.parse().ok()
}

/// Parses a glibc-like family version (`2.17`, `2_17` or a bare `2`) into `(major, minor)`.
pub(crate) fn parse_family_version(v: &str) -> Option<(u64, u64)> {
    let normalized = v.trim().replace('.', "_");
    match normalized.split_once('_') {
        Some((major, minor)) => Some((major.parse().ok()?, minor.parse().ok()?)),
        None => Some((normalized.parse().ok()?, 0)),
    }
}

impl CompatibilitySpec {
    /// Builds a spec, expanding the tag profiles into flat sets and validating all bounds.
    pub fn new(
        python_versions: PythonVersionsSpec,
        abi_values: AbiValuesSpec,
        platform_values: IndexMap<String, PlatformOSSpec>,
        compatibility_tags: IndexMap<String, CompatibilityTagsSpec>,
    ) -> Result<Self, CompatibilitySpecError> {
        for (os_name, os_spec) in &platform_values {
            for (family, bounds) in &os_spec.families {
                let family_name = format!("{os_name}.{family}");
                if let Some(min) = &bounds.min {
                    parse_family_bound(&family_name, min)?;
                }
                if let Some(max) = &bounds.max {
                    parse_family_bound(&family_name, max)?;
                }
            }
        }

        let mut tags = IndexSet::new();
        let mut exclude_tags = IndexSet::new();
        let mut tags_whitelist = IndexSet::new();
        let mut tags_specific_only = false;

        for (profile_name, profile) in &compatibility_tags {
            let mut parsed_specific = IndexSet::new();
            for s in &profile.specific {
                let expanded = parse_compressed_tag(s).map_err(|_| {
                    CompatibilitySpecError::InvalidProfileTag {
                        profile: profile_name.clone(),
                        tag: s.clone(),
                    }
                })?;
                parsed_specific.extend(expanded);
            }
            tags.extend(parsed_specific.iter().cloned());

            if profile.specific_only {
                tags_specific_only = true;
                tags_whitelist.extend(parsed_specific);
            }

            for s in &profile.excludes {
                let expanded = parse_compressed_tag(s).map_err(|_| {
                    CompatibilitySpecError::InvalidProfileTag {
                        profile: profile_name.clone(),
                        tag: s.clone(),
                    }
                })?;
                exclude_tags.extend(expanded);
            }
        }

        Ok(Self {
            python_versions,
            abi_values,
            platform_values,
            compatibility_tags,
            source_description: String::new(),
            tags,
            exclude_tags,
            tags_whitelist,
            tags_specific_only,
            resolved_python_versions: None,
        })
    }

    /// A minimal spec with only a python version band, everything else default.
    pub fn with_python_band(min: &str, max: Option<&str>) -> Result<Self, CompatibilitySpecError> {
        Self::new(
            PythonVersionsSpec::new(min, max)?,
            AbiValuesSpec::default(),
            IndexMap::new(),
            IndexMap::new(),
        )
    }

    /// Records where the spec was loaded from.
    pub fn with_source_description(mut self, description: impl Into<String>) -> Self {
        self.source_description = description.into();
        self
    }

    /// Pins the concrete python versions this spec covers: the discovered candidates filtered by
    /// the `[min, max]` band. All derived reads fail until this has run.
    pub fn realize_python_versions(
        &mut self,
        discovered: &[String],
    ) -> Result<(), CompatibilitySpecError> {
        let filtered = self.python_versions.filter_versions(discovered);
        if filtered.is_empty() {
            return Err(CompatibilitySpecError::NoVersionsInRange {
                min: self.python_versions.min.clone(),
                max: self.python_versions.max.clone(),
            });
        }
        self.resolved_python_versions = Some(
            filtered
                .iter()
                .map(|v| Version::from_str(v).expect("filter_versions yields valid versions"))
                .collect(),
        );
        Ok(())
    }

    /// Whether [`realize_python_versions`](Self::realize_python_versions) has run.
    pub fn is_realized(&self) -> bool {
        self.resolved_python_versions.is_some()
    }

    pub(crate) fn check_realized(&self) -> Result<(), NotRealizedError> {
        if self.is_realized() {
            Ok(())
        } else {
            Err(NotRealizedError)
        }
    }

    /// The exact python versions this spec resolved to.
    pub fn resolved_python_version_range(&self) -> Result<&[Version], NotRealizedError> {
        self.resolved_python_versions
            .as_deref()
            .ok_or(NotRealizedError)
    }

    /// The major versions present in the resolved set.
    pub fn accepted_python_major_versions(&self) -> Result<BTreeSet<u64>, NotRealizedError> {
        Ok(self
            .resolved_python_version_range()?
            .iter()
            .filter_map(|v| major_of(&v.to_string()))
            .collect())
    }

    /// Tags accumulated from every profile's `specific` lists.
    pub fn tags(&self) -> &IndexSet<WheelTag> {
        &self.tags
    }

    /// Tags rejected regardless of any other rule.
    pub fn exclude_tags(&self) -> &IndexSet<WheelTag> {
        &self.exclude_tags
    }

    /// Tags contributed by `specific_only` profiles.
    pub fn tags_whitelist(&self) -> &IndexSet<WheelTag> {
        &self.tags_whitelist
    }

    /// Whether any profile switched tag evaluation into whitelist mode.
    pub fn tags_specific_only(&self) -> bool {
        self.tags_specific_only
    }

    /// The effective explicit tag set:
    /// `(whitelist if specific_only else tags ∪ whitelist) − excludes`.
    pub fn allowed_tags(&self) -> IndexSet<WheelTag> {
        let base: IndexSet<WheelTag> = if self.tags_specific_only {
            self.tags_whitelist.clone()
        } else {
            self.tags.union(&self.tags_whitelist).cloned().collect()
        };
        base.difference(&self.exclude_tags).cloned().collect()
    }

    /// The symbolic python band as PEP 440 specifiers.
    pub fn supported_python_band(&self) -> VersionSpecifiers {
        self.python_versions.specifiers()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_max_defaults_to_next_major() {
        let spec = PythonVersionsSpec::new("3.10", None).unwrap();
        assert_eq!(spec.max, "<4.0");
    }

    #[test]
    fn test_bare_max_gets_inclusive_operator() {
        let spec = PythonVersionsSpec::new("3.10", Some("3.12")).unwrap();
        assert_eq!(spec.max, "<=3.12");
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        assert!(PythonVersionsSpec::new("3", None).is_err());
        assert!(PythonVersionsSpec::new("3.10", Some(">3.12")).is_err());
        assert!(PythonVersionsSpec::new("abc", None).is_err());
    }

    #[test]
    fn test_filter_versions_band() {
        let spec = PythonVersionsSpec::new("3.10", Some("<3.13")).unwrap();
        let candidates = vec![
            "3.8".to_string(),
            "3.13".to_string(),
            "3.11".to_string(),
            "3.10".to_string(),
            "3.12".to_string(),
            "2.7".to_string(),
            "bogus".to_string(),
        ];
        assert_eq!(spec.filter_versions(&candidates), vec!["3.10", "3.11", "3.12"]);
    }

    #[test]
    fn test_realization_gate() {
        let mut spec = CompatibilitySpec::with_python_band("3.10", Some("<3.13")).unwrap();
        assert!(spec.resolved_python_version_range().is_err());

        spec.realize_python_versions(&["3.10".into(), "3.11".into(), "3.14".into()])
            .unwrap();
        let resolved = spec.resolved_python_version_range().unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(
            spec.accepted_python_major_versions().unwrap(),
            BTreeSet::from([3])
        );
    }

    #[test]
    fn test_realization_requires_versions_in_band() {
        let mut spec = CompatibilitySpec::with_python_band("3.10", Some("<3.13")).unwrap();
        let result = spec.realize_python_versions(&["2.7".into(), "3.14".into()]);
        assert!(matches!(
            result,
            Err(CompatibilitySpecError::NoVersionsInRange { .. })
        ));
    }

    #[test]
    fn test_allowed_tags_algebra() {
        let mut profiles = IndexMap::new();
        profiles.insert(
            "base".to_string(),
            CompatibilityTagsSpec {
                specific: vec!["py3-none-any".into(), "cp311-cp311-manylinux_2_17_x86_64".into()],
                specific_only: false,
                excludes: vec!["cp311-cp311-manylinux_2_17_x86_64".into()],
            },
        );
        let spec = CompatibilitySpec::new(
            PythonVersionsSpec::new("3.10", None).unwrap(),
            AbiValuesSpec::default(),
            IndexMap::new(),
            profiles,
        )
        .unwrap();

        let allowed = spec.allowed_tags();
        assert_eq!(allowed.len(), 1);
        assert!(allowed.contains(&"py3-none-any".parse::<WheelTag>().unwrap()));
    }

    #[test]
    fn test_whitelist_mode_restricts_allowed_tags() {
        let mut profiles = IndexMap::new();
        profiles.insert(
            "open".to_string(),
            CompatibilityTagsSpec {
                specific: vec!["py2-none-any".into()],
                specific_only: false,
                excludes: vec![],
            },
        );
        profiles.insert(
            "pinned".to_string(),
            CompatibilityTagsSpec {
                specific: vec!["py3-none-any".into()],
                specific_only: true,
                excludes: vec![],
            },
        );
        let spec = CompatibilitySpec::new(
            PythonVersionsSpec::new("3.10", None).unwrap(),
            AbiValuesSpec::default(),
            IndexMap::new(),
            profiles,
        )
        .unwrap();

        assert!(spec.tags_specific_only());
        let allowed = spec.allowed_tags();
        assert_eq!(allowed.len(), 1);
        assert!(allowed.contains(&"py3-none-any".parse::<WheelTag>().unwrap()));
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_src = r#"
            [PythonVersions]
            min = "3.10"
            max = "<3.13"

            [PlatformValues.linux]
            arches = ["x86_64"]

            [PlatformValues.linux.manylinux]
            min = "2.17"
            max = "*"
        "#;
        let spec: CompatibilitySpec = toml::from_str(toml_src).unwrap();
        assert_eq!(spec.python_versions.min, "3.10");
        let linux = &spec.platform_values["linux"];
        assert_eq!(linux.arches, vec!["x86_64"]);
        assert_eq!(linux.families["manylinux"].min.as_deref(), Some("2.17"));

        let serialized = toml::to_string(&spec).unwrap();
        let again: CompatibilitySpec = toml::from_str(&serialized).unwrap();
        assert_eq!(again.python_versions, spec.python_versions);
        assert_eq!(again.platform_values, spec.platform_values);
    }

    #[test]
    fn test_family_version_parsing() {
        assert_eq!(parse_family_version("2.17"), Some((2, 17)));
        assert_eq!(parse_family_version("2_17"), Some((2, 17)));
        assert_eq!(parse_family_version("2"), Some((2, 0)));
        assert_eq!(parse_family_version("x"), None);
    }
}
