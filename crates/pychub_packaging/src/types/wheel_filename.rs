use super::wheel_key::normalize_version;
use super::{PackageName, ParsePackageNameError};
use crate::tags::{parse_compressed_tag, ParseWheelTagError, WheelTag};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// The pieces of a wheel filename as described by the
/// [binary distribution format](https://packaging.python.org/en/latest/specifications/binary-distribution-format/):
/// `{name}-{version}(-{build})?-{pyTag}-{abiTag}-{platTag}.whl`. The three tag components are kept
/// compressed; [`WheelFilename::all_tags`] expands the cross product.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct WheelFilename {
    /// Distribution name, e.g. ‘django’, ‘pyramid’.
    pub distribution: PackageName,

    /// Distribution version, PEP 440 normalized when parseable.
    pub version: String,

    /// Optional build number acting as a tie-breaker between otherwise identical wheels.
    pub build_tag: Option<BuildTag>,

    /// Language implementation tags, e.g. ‘py2’, ‘py3’, ‘cp311’.
    pub py_tags: Vec<String>,

    /// ABI tags, e.g. ‘cp33m’, ‘abi3’, ‘none’.
    pub abi_tags: Vec<String>,

    /// Platform tags, e.g. ‘any’, ‘manylinux_2_17_x86_64’.
    pub platform_tags: Vec<String>,
}

/// An error that can occur when parsing a wheel filename
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum ParseWheelFilenameError {
    #[error("'{0}' does not have a .whl extension")]
    NotAWheel(String),

    #[error("'{0}' does not match name-version(-build)?-py-abi-platform.whl")]
    MalformedStem(String),

    #[error(transparent)]
    InvalidDistributionName(#[from] ParsePackageNameError),

    #[error("build tag '{0}' must start with a digit")]
    BuildTagMustStartWithDigit(String),

    #[error(transparent)]
    InvalidTag(#[from] ParseWheelTagError),
}

impl WheelFilename {
    /// Parses a wheel filename such as `trio-0.18.0-py3-none-any.whl`.
    pub fn from_filename(filename: &str) -> Result<Self, ParseWheelFilenameError> {
        let Some(stem) = filename.strip_suffix(".whl") else {
            return Err(ParseWheelFilenameError::NotAWheel(filename.to_owned()));
        };

        // The three tag components come off the right; what remains is
        // name-version with an optional build segment.
        let malformed = || ParseWheelFilenameError::MalformedStem(filename.to_owned());
        let (rest, platform_tags) = stem.rsplit_once('-').ok_or_else(malformed)?;
        let (rest, abi_tags) = rest.rsplit_once('-').ok_or_else(malformed)?;
        let (rest, py_tags) = rest.rsplit_once('-').ok_or_else(malformed)?;

        let (distribution, version, build_tag) = match rest.split_once('-') {
            None => return Err(malformed()),
            Some((name, rest)) => match rest.split_once('-') {
                None => (name, rest, None),
                Some((version, build)) => (name, version, Some(BuildTag::from_str(build)?)),
            },
        };
        if distribution.is_empty() || version.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            distribution: PackageName::from_str(distribution)?,
            version: normalize_version(version),
            build_tag,
            py_tags: py_tags.split('.').map(ToOwned::to_owned).collect(),
            abi_tags: abi_tags.split('.').map(ToOwned::to_owned).collect(),
            platform_tags: platform_tags.split('.').map(ToOwned::to_owned).collect(),
        })
    }

    /// The set of tags denoted by this filename: the cross product of the dotted interpreter, ABI
    /// and platform components.
    pub fn all_tags(&self) -> Result<IndexSet<WheelTag>, ParseWheelTagError> {
        parse_compressed_tag(&format!(
            "{}-{}-{}",
            self.py_tags.join("."),
            self.abi_tags.join("."),
            self.platform_tags.join(".")
        ))
    }
}

impl Display for WheelFilename {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{dist}-{ver}{build}-{py}-{abi}-{plat}.whl",
            dist = self.distribution.as_source_str(),
            ver = self.version,
            build = self
                .build_tag
                .as_ref()
                .map_or_else(String::new, |tag| format!("-{tag}")),
            py = self.py_tags.join("."),
            abi = self.abi_tags.join("."),
            plat = self.platform_tags.join("."),
        )
    }
}

/// A build number. Must start with a digit. Sorts by the leading digits as an integer, then by the
/// remainder as a string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, SerializeDisplay, DeserializeFromStr)]
pub struct BuildTag {
    number: u32,
    suffix: String,
}

impl Display for BuildTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.number, &self.suffix)
    }
}

impl FromStr for BuildTag {
    type Err = ParseWheelFilenameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits_end = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (digits, suffix) = s.split_at(digits_end);
        Ok(Self {
            number: digits.parse().map_err(|_| {
                ParseWheelFilenameError::BuildTagMustStartWithDigit(s.to_owned())
            })?,
            suffix: suffix.to_owned(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_simple_filename() {
        let n = WheelFilename::from_filename("trio-0.18.0-py3-none-any.whl").unwrap();
        assert_eq!(n.distribution, "trio".parse().unwrap());
        assert_eq!(n.version, "0.18.0");
        assert_eq!(n.build_tag, None);
        assert_eq!(n.py_tags, vec!["py3"]);
        assert_eq!(n.abi_tags, vec!["none"]);
        assert_eq!(n.platform_tags, vec!["any"]);
        assert_eq!(n.to_string(), "trio-0.18.0-py3-none-any.whl");
    }

    #[test]
    fn test_build_tag_and_compressed_tags() {
        let n = WheelFilename::from_filename("foo.bar-0.1b3-1local-py2.py3-none-any.whl").unwrap();
        assert_eq!(n.distribution, "foo.bar".parse().unwrap());
        assert_eq!(n.version, "0.1b3");
        assert_eq!(n.build_tag, Some("1local".parse().unwrap()));
        assert_eq!(n.py_tags, vec!["py2", "py3"]);
        assert_eq!(n.all_tags().unwrap().len(), 2);
        assert_eq!(n.to_string(), "foo.bar-0.1b3-1local-py2.py3-none-any.whl");
    }

    #[test]
    fn test_manylinux_multi_platform() {
        let n = WheelFilename::from_filename(
            "numpy-1.26.0-pp39-pypy39_pp73-manylinux_2_17_x86_64.manylinux2014_x86_64.whl",
        )
        .unwrap();
        assert_eq!(
            n.platform_tags,
            vec!["manylinux_2_17_x86_64", "manylinux2014_x86_64"]
        );
    }

    #[test]
    fn test_tag_cross_product_roundtrip() {
        let n = WheelFilename::from_filename("pkg-1.0-cp311.py3-none.abi3-any.whl").unwrap();
        let tags = n.all_tags().unwrap();
        assert_eq!(tags.len(), 4);
        assert!(tags.contains(&WheelTag::new("cp311", "abi3", "any")));
        assert!(tags.contains(&WheelTag::new("py3", "none", "any")));
    }

    #[test]
    fn test_rejects_non_wheels() {
        assert!(WheelFilename::from_filename("trio-0.18.0.tar.gz").is_err());
        assert!(WheelFilename::from_filename("trio-0.18.0-py3-none.whl").is_err());
        assert!(WheelFilename::from_filename("-1.0-py3-none-any.whl").is_err());
        assert!(WheelFilename::from_filename("trio-0.18.0-xlocal-py3-none-any.whl").is_err());
    }
}
