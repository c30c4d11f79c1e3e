//! Tag acceptance. A realized [`CompatibilitySpec`] evaluates a wheel tag as a conjunction over
//! the interpreter, ABI and platform axes, short-circuited by the universal fast path and the
//! explicit tag-level overrides. Rejection is a normal `false`; the only error is reading a spec
//! that has not been realized.

use super::spec::{parse_family_version, CompatibilitySpec, NotRealizedError};
use crate::tags::{parse_compressed_tag, WheelTag};
use once_cell::sync::Lazy;
use pep440_rs::Version;
use regex::Regex;
use std::str::FromStr;

// Example platform tags: manylinux_2_17_x86_64, musllinux_1_1_aarch64, macosx_11_0_arm64,
// win_amd64, any.
static PLATFORM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<flavor>[a-zA-Z0-9]+)(?:_(?P<major>\d+)_(?P<minor>\d+))?(?:_(?P<arch>[A-Za-z0-9_]+))?$")
        .unwrap()
});

/// Splits a platform tag into `(flavor, version, arch)`. A tag that does not match the pattern is
/// returned whole as the flavor.
fn split_platform_tag(platform: &str) -> (&str, Option<(u64, u64)>, Option<&str>) {
    let Some(caps) = PLATFORM_RE.captures(platform) else {
        return (platform, None, None);
    };
    let flavor = caps.name("flavor").map_or(platform, |m| m.as_str());
    let version = match (caps.name("major"), caps.name("minor")) {
        (Some(major), Some(minor)) => Some((
            major.as_str().parse().unwrap_or_default(),
            minor.as_str().parse().unwrap_or_default(),
        )),
        _ => None,
    };
    let arch = caps.name("arch").map(|m| m.as_str());
    (flavor, version, arch)
}

/// Extracts a `(major, minor)` python version from an interpreter or ABI label. Supports bare
/// `X.Y` plus trailing-digit forms: one digit is a bare major (`py3` → 3.0), two digits split as
/// `X.Y` (`py39` → 3.9), three digits split as `X.YY` (`cp311` → 3.11).
fn parse_python_version_label(label: &str) -> Option<(u64, u64)> {
    let s = label.trim();

    if let Some((major, minor)) = s.split_once('.') {
        if let (Ok(major), Ok(minor)) = (major.parse(), minor.parse()) {
            return Some((major, minor));
        }
    }

    let digits: &str = {
        let start = s.rfind(|c: char| !c.is_ascii_digit()).map_or(0, |i| i + 1);
        &s[start..]
    };
    match digits.len() {
        1 => Some((digits.parse().ok()?, 0)),
        2 => Some((digits[..1].parse().ok()?, digits[1..].parse().ok()?)),
        3 => Some((digits[..1].parse().ok()?, digits[1..].parse().ok()?)),
        _ => None,
    }
}

fn is_debug_abi(abi: &str) -> bool {
    abi.ends_with('d')
}

fn is_stable_abi(abi: &str) -> bool {
    abi == "none"
        || abi
            .strip_prefix("abi")
            .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

impl CompatibilitySpec {
    /// Evaluates a single tag against this realized spec. Never fails for a normal rejection.
    pub fn accepts(&self, tag: &WheelTag) -> Result<bool, NotRealizedError> {
        self.check_realized()?;

        // Universal fast path: pyN-none-any for an accepted major.
        if self.accepts_universal_interpreter(&tag.interpreter)?
            && tag.abi == "none"
            && tag.platform == "any"
        {
            return Ok(true);
        }

        if self.exclude_tags().contains(tag) {
            return Ok(false);
        }

        if self.tags_specific_only() {
            return Ok(self.tags_whitelist().contains(tag));
        }

        if self.tags().contains(tag) {
            return Ok(true);
        }

        Ok(self.accepts_interpreter(&tag.interpreter)?
            && self.accepts_abi(&tag.abi)?
            && self.accepts_platform(&tag.platform))
    }

    /// Evaluates a compressed tag string; a multi-valued string is accepted when any of its
    /// expanded tags is.
    pub fn accepts_compressed(&self, tag_str: &str) -> Result<bool, NotRealizedError> {
        let Ok(tags) = parse_compressed_tag(tag_str) else {
            self.check_realized()?;
            return Ok(false);
        };
        for tag in &tags {
            if self.accepts(tag)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn accepts_universal_interpreter(&self, interpreter: &str) -> Result<bool, NotRealizedError> {
        if !self.python_versions.accept_universal {
            return Ok(false);
        }
        Ok(self
            .accepted_python_major_versions()?
            .iter()
            .any(|major| interpreter == format!("py{major}")))
    }

    fn version_in_range(&self, major: u64, minor: u64) -> Result<bool, NotRealizedError> {
        let candidate = Version::from_str(&format!("{major}.{minor}"))
            .expect("numeric major.minor always parses");
        Ok(self
            .resolved_python_version_range()?
            .contains(&candidate))
    }

    fn accepts_interpreter(&self, interpreter: &str) -> Result<bool, NotRealizedError> {
        let vspec = &self.python_versions;

        if vspec.excludes.iter().any(|e| e == interpreter) {
            return Ok(false);
        }

        if vspec.specific_only {
            return Ok(vspec.specific.iter().any(|s| s == interpreter));
        }

        if vspec.specific.iter().any(|s| s == interpreter) {
            return Ok(true);
        }

        if self.accepts_universal_interpreter(interpreter)? {
            return Ok(true);
        }

        // Everything else must map to a concrete version in range; no guessing.
        match parse_python_version_label(interpreter) {
            Some((major, minor)) => self.version_in_range(major, minor),
            None => Ok(false),
        }
    }

    fn accepts_abi(&self, abi: &str) -> Result<bool, NotRealizedError> {
        if abi == "none" {
            return Ok(true);
        }
        let aspec = &self.abi_values;

        if aspec.excludes.iter().any(|e| e == abi) {
            return Ok(false);
        }

        if aspec.specific_only {
            return Ok(aspec.specific.iter().any(|s| s == abi));
        }

        if aspec.specific.iter().any(|s| s == abi) {
            return Ok(true);
        }

        if is_debug_abi(abi) && !aspec.include_debug {
            return Ok(false);
        }

        if is_stable_abi(abi) {
            if !aspec.include_stable {
                return Ok(false);
            }
            let Some(major) = abi
                .trim_start_matches(|c: char| !c.is_ascii_digit())
                .parse::<u64>()
                .ok()
            else {
                return Ok(false);
            };
            return Ok(self
                .accepted_python_major_versions()?
                .contains(&major));
        }

        match parse_python_version_label(abi) {
            Some((major, minor)) => self.version_in_range(major, minor),
            None => Ok(false),
        }
    }

    fn accepts_platform(&self, platform: &str) -> bool {
        if platform == "any" {
            return true;
        }

        // No platform constraints configured at all: fail closed.
        if self.platform_values.is_empty() {
            return false;
        }

        for os_spec in self.platform_values.values() {
            if os_spec.excludes.iter().any(|e| e == platform) {
                return false;
            }
        }

        let specific_only: Vec<_> = self
            .platform_values
            .values()
            .filter(|os| os.specific_only)
            .collect();
        if !specific_only.is_empty() {
            return specific_only
                .iter()
                .any(|os| os.specific.iter().any(|s| s == platform));
        }

        for os_spec in self.platform_values.values() {
            if os_spec.specific.iter().any(|s| s == platform) {
                return true;
            }
        }

        let (flavor, version, arch) = split_platform_tag(platform);

        let Some((family_spec, owning_os)) = self
            .platform_values
            .values()
            .find_map(|os| os.families.get(flavor).map(|family| (family, os)))
        else {
            return false;
        };

        if !owning_os.arches.is_empty()
            && !arch.is_some_and(|a| owning_os.arches.iter().any(|allowed| allowed == a))
        {
            return false;
        }

        if (family_spec.min.is_some() || family_spec.max.is_some()) && version.is_none() {
            return false;
        }

        if let Some(version) = version {
            if let Some(min) = family_spec.min.as_deref().filter(|m| *m != "*") {
                match parse_family_version(min) {
                    Some(min) if version >= min => {}
                    _ => return false,
                }
            }
            if let Some(max) = family_spec.max.as_deref().filter(|m| *m != "*") {
                match parse_family_version(max) {
                    Some(max) if version <= max => {}
                    _ => return false,
                }
            }
        }

        true
    }
}
