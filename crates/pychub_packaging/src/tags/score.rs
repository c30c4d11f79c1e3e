use super::WheelTag;
use crate::compat::{CompatibilitySpec, NotRealizedError};
use crate::types::{ProjectInfo, WheelFilename, WheelKey};
use miette::Diagnostic;
use thiserror::Error;
use url::Url;

// Opinionated ranking policy.
// Interpreter: prefer generic "py" tags over CPython-specific "cp".
const INTERP_TYPE_ORDER: [&str; 2] = ["py", "cp"];

// ABI: prefer pure-python, then the stable CPython ABI, then everything else.
const ABI_ORDER: [&str; 2] = ["none", "abi3"];

// Platform: Linux-only worldview, plus "any".
const PLATFORM_PREFIX_ORDER: [&str; 3] = ["any", "manylinux", "musllinux"];

/// Lexicographic ranking key for a tag; the smallest key is the preferred tag.
pub type TagScore = (usize, usize, usize, String);

fn rank_by_order(value: &str, order: &[&str]) -> usize {
    order.iter().position(|o| *o == value).unwrap_or(order.len())
}

fn rank_by_prefix(value: &str, prefixes: &[&str]) -> usize {
    prefixes
        .iter()
        .position(|p| value == *p || value.starts_with(*p))
        .unwrap_or(prefixes.len())
}

/// The leading alphabetic part of an interpreter label ("cp311" → "cp").
fn interp_type(label: &str) -> &str {
    let end = label
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(label.len());
    &label[..end]
}

/// Scores a tag by `(interpreter rank, abi rank, platform rank, tag string)`; smaller wins.
pub fn score(tag: &WheelTag) -> TagScore {
    (
        rank_by_order(interp_type(&tag.interpreter), &INTERP_TYPE_ORDER),
        rank_by_order(&tag.abi, &ABI_ORDER),
        rank_by_prefix(&tag.platform, &PLATFORM_PREFIX_ORDER),
        tag.to_string(),
    )
}

/// Error when choosing a tag for a wheel file.
#[derive(Debug, Clone, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum ChooseWheelTagError {
    #[error("invalid wheel filename '{filename}': {reason}")]
    InvalidFilename { filename: String, reason: String },

    #[error("wheel filename '{filename}' does not match {expected}")]
    KeyMismatch { filename: String, expected: String },

    #[error("no compatible tags for '{filename}'")]
    NoCompatibleTags { filename: String },

    #[error(transparent)]
    NotRealized(#[from] NotRealizedError),
}

/// Picks the single preferred tag of a wheel file: parses the filename, verifies it names the
/// expected `(name, version)`, keeps the tags the spec accepts, and returns the minimum by
/// [`score`]. Fails when nothing compatible remains.
pub fn choose_wheel_tag(
    filename: &str,
    key: &WheelKey,
    spec: &CompatibilitySpec,
) -> Result<WheelTag, ChooseWheelTagError> {
    let parsed =
        WheelFilename::from_filename(filename).map_err(|e| ChooseWheelTagError::InvalidFilename {
            filename: filename.to_owned(),
            reason: e.to_string(),
        })?;

    let parsed_key = WheelKey::from_parts(parsed.distribution.clone().into(), &parsed.version);
    if &parsed_key != key {
        return Err(ChooseWheelTagError::KeyMismatch {
            filename: filename.to_owned(),
            expected: key.to_string(),
        });
    }

    let tags = parsed
        .all_tags()
        .map_err(|e| ChooseWheelTagError::InvalidFilename {
            filename: filename.to_owned(),
            reason: e.to_string(),
        })?;

    let mut compatible = Vec::new();
    for tag in tags {
        if spec.accepts(&tag)? {
            compatible.push(tag);
        }
    }

    compatible
        .into_iter()
        .min_by_key(score)
        .ok_or_else(|| ChooseWheelTagError::NoCompatibleTags {
            filename: filename.to_owned(),
        })
}

/// Picks the download URL for a wheel key out of a PEP 691 project page: non-yanked `.whl` files
/// whose filename matches the key and that carry at least one compatible tag, ranked by
/// `(tag score, filename)`. Returns `None` when nothing qualifies.
pub fn resolve_uri_for_wheel_key(
    key: &WheelKey,
    project_info: &ProjectInfo,
    spec: &CompatibilitySpec,
) -> Result<Option<Url>, NotRealizedError> {
    let mut best: Option<((TagScore, String), Url)> = None;

    for file in &project_info.files {
        if file.yanked.yanked || !file.is_wheel() {
            continue;
        }

        let chosen = match choose_wheel_tag(&file.filename, key, spec) {
            Ok(tag) => tag,
            Err(ChooseWheelTagError::NotRealized(e)) => return Err(e),
            Err(_) => continue,
        };

        let candidate = ((score(&chosen), file.filename.clone()), file.url.clone());
        match &best {
            Some((current, _)) if current <= &candidate.0 => {}
            _ => best = Some(candidate),
        }
    }

    Ok(best.map(|(_, url)| url))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compat::CompatibilitySpec;
    use crate::types::{ProjectFile, ProjectInfo};

    fn spec() -> CompatibilitySpec {
        let mut spec = CompatibilitySpec::with_python_band("3.10", Some("<3.13")).unwrap();
        spec.realize_python_versions(&["3.10".into(), "3.11".into(), "3.12".into()])
            .unwrap();
        spec
    }

    #[test]
    fn test_score_ordering() {
        let universal = score(&"py3-none-any".parse().unwrap());
        let stable = score(&"cp311-abi3-manylinux_2_17_x86_64".parse().unwrap());
        let specific = score(&"cp311-cp311-manylinux_2_17_x86_64".parse().unwrap());
        assert!(universal < stable);
        assert!(stable < specific);
    }

    #[test]
    fn test_choose_prefers_universal_tag() {
        let key = WheelKey::new("foo", "1.0").unwrap();
        let tag = choose_wheel_tag("foo-1.0-cp311.py3-none-any.whl", &key, &spec()).unwrap();
        assert_eq!(tag.to_string(), "py3-none-any");
    }

    #[test]
    fn test_choose_rejects_mismatched_key() {
        let key = WheelKey::new("bar", "1.0").unwrap();
        let result = choose_wheel_tag("foo-1.0-py3-none-any.whl", &key, &spec());
        assert!(matches!(result, Err(ChooseWheelTagError::KeyMismatch { .. })));

        let key = WheelKey::new("foo", "2.0").unwrap();
        let result = choose_wheel_tag("foo-1.0-py3-none-any.whl", &key, &spec());
        assert!(matches!(result, Err(ChooseWheelTagError::KeyMismatch { .. })));
    }

    #[test]
    fn test_choose_fails_without_compatible_tags() {
        let key = WheelKey::new("foo", "1.0").unwrap();
        // No platform families are configured, so a manylinux-only wheel has no usable tag.
        let result = choose_wheel_tag("foo-1.0-cp311-cp311-manylinux_2_17_x86_64.whl", &key, &spec());
        assert!(matches!(
            result,
            Err(ChooseWheelTagError::NoCompatibleTags { .. })
        ));
    }

    fn file(filename: &str) -> ProjectFile {
        serde_json::from_value(serde_json::json!({
            "filename": filename,
            "url": format!("https://files.example/{filename}"),
        }))
        .unwrap()
    }

    #[test]
    fn test_resolve_uri_skips_yanked_and_incompatible() {
        let key = WheelKey::new("foo", "1.0").unwrap();
        let mut yanked = file("foo-1.0-py3-none-any.whl");
        yanked.yanked.yanked = true;

        let info = ProjectInfo {
            files: vec![
                yanked,
                file("foo-1.0-cp311-cp311-manylinux_2_17_x86_64.whl"),
                file("foo-1.0-py2.py3-none-any.whl"),
            ],
            ..Default::default()
        };

        let url = resolve_uri_for_wheel_key(&key, &info, &spec()).unwrap().unwrap();
        assert!(url.as_str().ends_with("foo-1.0-py2.py3-none-any.whl"));
    }

    #[test]
    fn test_resolve_uri_none_when_nothing_qualifies() {
        let key = WheelKey::new("foo", "1.0").unwrap();
        let info = ProjectInfo {
            files: vec![file("foo-1.0.tar.gz")],
            ..Default::default()
        };
        assert!(resolve_uri_for_wheel_key(&key, &info, &spec())
            .unwrap()
            .is_none());
    }
}
