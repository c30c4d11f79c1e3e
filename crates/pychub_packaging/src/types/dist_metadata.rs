use super::{PackageName, ParsePackageNameError};
use miette::Diagnostic;
use pep440_rs::VersionSpecifiers;
use pep508_rs::Requirement;
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

/// The slice of a wheel's `*.dist-info/METADATA` that dependency planning consumes: identity plus
/// the `Requires-Dist` and `Requires-Python` fields. Everything else (description, classifiers,
/// extras the plan does not expand) is ignored.
#[derive(Debug, Clone)]
pub struct DistMetadata {
    /// The distribution this metadata describes.
    pub name: PackageName,

    /// The version string as written in the file.
    pub version: String,

    /// Parsed `Requires-Dist` entries. Unparseable entries are dropped with a warning rather than
    /// failing the whole document.
    pub requires_dist: Vec<Requirement>,

    /// Parsed `Requires-Python` band, when present.
    pub requires_python: Option<VersionSpecifiers>,
}

/// Error when parsing a METADATA document.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum DistMetadataError {
    #[error("METADATA is not parseable: {0}")]
    Malformed(String),

    #[error("missing required key {0} in METADATA")]
    MissingKey(&'static str),

    #[error("duplicate key {0} in METADATA")]
    DuplicateKey(&'static str),

    #[error(transparent)]
    InvalidName(#[from] ParsePackageNameError),

    #[error("invalid Requires-Python: {0}")]
    InvalidRequiresPython(String),
}

// METADATA allegedly follows RFC 822. In reality it follows whatever Python's email parser
// accepts: header lines with optional indented continuations, a blank line, then a free-form
// body (the long description). Field names are matched case-insensitively.
peg::parser! {
    grammar metadata_parser() for str {
        rule eol() = "\r\n" / "\r" / "\n"

        rule name() -> &'input str
            = $([ '\x21'..='\x39' | '\x3b'..='\x7e' ]+)

        rule value_line() = [^ '\r' | '\n']*

        rule continuation() = eol() [' ' | '\t']

        rule value() -> &'input str
            = $(value_line() ** continuation())

        rule header() -> (String, String)
            = n:name() ":" [' ' | '\t']* v:value()
                { (n.to_ascii_lowercase(), v.to_owned()) }

        rule body() = eol() eol() [_]*

        pub rule document() -> Vec<(String, String)>
            = h:(header() ** eol()) body()? eol()?  { h }
    }
}

struct Headers(HashMap<String, Vec<String>>);

impl Headers {
    fn take_all(&mut self, key: &str) -> Vec<String> {
        self.0.remove(key).unwrap_or_default()
    }

    fn take_one(&mut self, key: &'static str) -> Result<String, DistMetadataError> {
        let mut values = self.take_all(key);
        match values.len() {
            0 => Err(DistMetadataError::MissingKey(key)),
            1 => Ok(values.pop().expect("len checked")),
            _ => Err(DistMetadataError::DuplicateKey(key)),
        }
    }
}

impl TryFrom<&[u8]> for DistMetadata {
    type Error = DistMetadataError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let text = String::from_utf8_lossy(bytes);
        let parsed = metadata_parser::document(&text)
            .map_err(|e| DistMetadataError::Malformed(e.to_string()))?;

        let mut headers = Headers(HashMap::new());
        for (key, value) in parsed {
            headers.0.entry(key).or_default().push(value);
        }

        let name: PackageName = headers.take_one("name")?.parse()?;
        let version = headers.take_one("version")?;

        let mut requires_dist = Vec::new();
        for entry in headers.take_all("requires-dist") {
            match Requirement::from_str(&entry) {
                Ok(req) => requires_dist.push(req),
                Err(e) => {
                    tracing::warn!("ignoring Requires-Dist '{entry}', failed to parse: {e}");
                }
            }
        }

        let requires_python = match headers.take_all("requires-python").pop() {
            Some(band) => Some(
                VersionSpecifiers::from_str(&band)
                    .map_err(|e| DistMetadataError::InvalidRequiresPython(e.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            name,
            version,
            requires_dist,
            requires_python,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const METADATA: &str = "\
Metadata-Version: 2.1
Name: foo
Version: 1.0
Requires-Python: >=3.10
Requires-Dist: idna<4,>=2.5
Requires-Dist: charset-normalizer<4,>=2
Requires-Dist: pysocks!=1.5.7,>=1.5.6; extra == 'socks'
Requires-Dist: this is (not) parseable

A long description follows
the blank line.
";

    #[test]
    fn test_parses_planning_fields() {
        let meta = DistMetadata::try_from(METADATA.as_bytes()).unwrap();
        assert_eq!(meta.name, "foo".parse().unwrap());
        assert_eq!(meta.version, "1.0");
        assert_eq!(meta.requires_python.unwrap().to_string(), ">=3.10");
        // The unparseable entry is dropped, not fatal.
        assert_eq!(meta.requires_dist.len(), 3);
        assert_eq!(meta.requires_dist[0].name, "idna");
    }

    #[test]
    fn test_continuation_lines() {
        let meta = DistMetadata::try_from(
            b"Name: foo\nVersion: 1.0\nSummary: spans\n\ttwo lines\n".as_slice(),
        )
        .unwrap();
        assert_eq!(meta.version, "1.0");
    }

    #[test]
    fn test_missing_name_is_fatal() {
        let result = DistMetadata::try_from(b"Version: 1.0\n".as_slice());
        assert!(matches!(result, Err(DistMetadataError::MissingKey("name"))));
    }
}
