//! Wheels encode the Python interpreter, ABI, and platform they support in their filenames using
//! compatibility tags. This module provides the tag triple itself, parsing of compressed tag sets
//! (`cp311.py3-none-any` expands to the cross product of its dotted components), and the ranking
//! used to pick a single preferred tag out of a wheel's tag set.

mod score;

pub use score::{choose_wheel_tag, resolve_uri_for_wheel_key, score, ChooseWheelTagError, TagScore};

use indexmap::IndexSet;
use itertools::Itertools;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// A representation of a tag triple for a wheel.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, SerializeDisplay, DeserializeFromStr)]
pub struct WheelTag {
    /// The interpreter label, e.g. "py3" or "cp311"
    pub interpreter: String,

    /// The ABI the wheel supports, e.g. "none", "abi3" or "cp311"
    pub abi: String,

    /// The platform the wheel supports, e.g. "any" or "manylinux_2_17_x86_64".
    pub platform: String,
}

impl WheelTag {
    /// Constructs a tag from its three components.
    pub fn new(
        interpreter: impl Into<String>,
        abi: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            abi: abi.into(),
            platform: platform.into(),
        }
    }
}

/// Error when parsing a tag triple or a compressed tag set.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum ParseWheelTagError {
    #[error("expected 'interpreter-abi-platform', got '{0}'")]
    MissingComponent(String),

    #[error("tag component must not be empty in '{0}'")]
    EmptyComponent(String),
}

impl FromStr for WheelTag {
    type Err = ParseWheelTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((interpreter, abi, platform)) = s.splitn(3, '-').collect_tuple() else {
            return Err(ParseWheelTagError::MissingComponent(s.to_owned()));
        };
        if interpreter.is_empty() || abi.is_empty() || platform.is_empty() {
            return Err(ParseWheelTagError::EmptyComponent(s.to_owned()));
        }
        Ok(Self {
            interpreter: interpreter.to_owned(),
            abi: abi.to_owned(),
            platform: platform.to_owned(),
        })
    }
}

impl Display for WheelTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", &self.interpreter, &self.abi, &self.platform)
    }
}

/// Expands a compressed tag string into the set of tags it denotes. Each of the three components
/// may contain multiple `.`-separated values; the result is the cross product of all of them, in
/// the order they appear.
pub fn parse_compressed_tag(s: &str) -> Result<IndexSet<WheelTag>, ParseWheelTagError> {
    let Some((interpreters, abis, platforms)) = s.splitn(3, '-').collect_tuple() else {
        return Err(ParseWheelTagError::MissingComponent(s.to_owned()));
    };
    if interpreters.is_empty() || abis.is_empty() || platforms.is_empty() {
        return Err(ParseWheelTagError::EmptyComponent(s.to_owned()));
    }

    Ok(interpreters
        .split('.')
        .cartesian_product(abis.split('.').collect::<Vec<_>>())
        .cartesian_product(platforms.split('.').collect::<Vec<_>>())
        .map(|((interpreter, abi), platform)| WheelTag::new(interpreter, abi, platform))
        .collect())
}
