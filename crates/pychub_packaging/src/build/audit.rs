use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// The lifecycle stage an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageType {
    /// The overall orchestration, start to completion.
    Lifecycle,
    /// Option parsing, project normalization, caching.
    Init,
    /// Resolver setup, compatibility resolution, dependency graph, plan persistence.
    Plan,
    /// Actions carried out from the plan.
    Execute,
    /// Teardown and post-build validation.
    Cleanup,
}

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum LevelType {
    Debug,
    Info,
    Warn,
    Error,
}

/// What kind of thing happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum EventType {
    /// An action was conditionally aborted.
    Aborted,
    /// Meaningful step taken (copy, build, inject).
    Action,
    /// Annotation on another event.
    Annotation,
    /// Mid-stage milestone or marker.
    Checkpoint,
    /// Successfully finished.
    Complete,
    /// Conditional logic branch taken.
    Decision,
    /// Action intentionally delayed.
    Deferred,
    /// Discovery action invoked.
    Discover,
    /// Exception-related event.
    Exception,
    /// Stage failed, unrecoverable.
    Fail,
    /// External input received or used.
    Input,
    /// Artifact produced (file, archive, metadata).
    Output,
    /// Item was resolved (dependency, strategy).
    Resolve,
    /// Intentionally bypassed.
    Skip,
    /// Beginning of a stage or substage.
    Start,
    /// Validation event.
    Validation,
}

/// How an annotation event relates to another event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnnotationType {
    /// Replaces or corrects a prior event.
    Amends,
    /// Human or system note, no functional change.
    Comment,
    /// Links to another event semantically.
    RelatesTo,
    /// Adds context or extra data.
    Supplements,
}

/// One audit record. Serialized as a single JSON object per event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    /// Unique id of this event.
    pub event_id: Uuid,

    /// What happened.
    pub event_type: EventType,

    /// Severity.
    pub level: LevelType,

    /// The stage the event belongs to.
    pub stage: StageType,

    /// Finer-grained location inside the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substage: Option<String>,

    /// Annotation relationship, for annotation events only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_type: Option<AnnotationType>,

    /// When the event happened, ISO-8601 UTC.
    pub timestamp: DateTime<Utc>,

    /// Human-readable description.
    pub message: String,

    /// Structured context.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl BuildEvent {
    /// A new info-level event with a fresh id and the current timestamp.
    pub fn new(stage: StageType, event_type: EventType) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            level: LevelType::Info,
            stage,
            substage: None,
            annotation_type: None,
            timestamp: Utc::now(),
            message: String::new(),
            payload: serde_json::Map::new(),
        }
    }

    /// Sets the severity.
    pub fn with_level(mut self, level: LevelType) -> Self {
        self.level = level;
        self
    }

    /// Sets the substage.
    pub fn with_substage(mut self, substage: impl Into<String>) -> Self {
        self.substage = Some(substage.into());
        self
    }

    /// Sets the message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Adds a payload entry.
    pub fn with_payload(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.to_owned(), value.into());
        self
    }
}

/// Where the audit log gets written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditSink {
    /// A file on disk.
    File(PathBuf),
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Error for an unrecognized sink spec.
#[derive(Debug, Clone, Error)]
#[error("unknown audit log destination '{0}' (expected stdout, stderr or file:PATH)")]
pub struct ParseAuditSinkError(String);

impl FromStr for AuditSink {
    type Err = ParseAuditSinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(AuditSink::Stdout),
            "stderr" => Ok(AuditSink::Stderr),
            other => match other.strip_prefix("file:") {
                Some(path) if !path.is_empty() => Ok(AuditSink::File(PathBuf::from(path))),
                _ => Err(ParseAuditSinkError(s.to_owned())),
            },
        }
    }
}

/// The append-only audit log owned by the build plan. Events within a stage are appended in
/// program order.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditLog {
    events: Vec<BuildEvent>,
}

impl AuditLog {
    /// Appends one event.
    pub fn push(&mut self, event: BuildEvent) {
        tracing::debug!(
            stage = ?event.stage,
            event = ?event.event_type,
            message = %event.message,
            "audit"
        );
        self.events.push(event);
    }

    /// The recorded events, in order.
    pub fn events(&self) -> &[BuildEvent] {
        &self.events
    }

    /// Writes every event as one pretty-printed JSON object per sink.
    pub fn emit(&self, sinks: &[AuditSink]) -> std::io::Result<()> {
        for sink in sinks {
            match sink {
                AuditSink::File(path) => {
                    if let Some(parent) = path.parent() {
                        fs_err::create_dir_all(parent)?;
                    }
                    let mut out = fs_err::File::create(path)?;
                    self.write_to(&mut out)?;
                }
                AuditSink::Stdout => self.write_to(&mut std::io::stdout().lock())?,
                AuditSink::Stderr => self.write_to(&mut std::io::stderr().lock())?,
            }
        }
        Ok(())
    }

    fn write_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        for event in &self.events {
            let json = serde_json::to_string_pretty(event)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writeln!(out, "{json}")?;
        }
        Ok(())
    }
}

/// Default audit log filename inside the staging directory.
pub const AUDIT_LOG_FILENAME: &str = "build.audit.json";

/// The default sink set: `build.audit.json` in the staging directory.
pub fn default_sinks(staging_dir: &Path) -> Vec<AuditSink> {
    vec![AuditSink::File(staging_dir.join(AUDIT_LOG_FILENAME))]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = BuildEvent::new(StageType::Plan, EventType::Start)
            .with_substage("resolve_compatibility")
            .with_message("starting")
            .with_payload("python_versions", serde_json::json!(["3.10", "3.11"]));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["stage"], "PLAN");
        assert_eq!(value["event_type"], "START");
        assert_eq!(value["level"], "INFO");
        assert_eq!(value["substage"], "resolve_compatibility");
        assert!(value["annotation_type"].is_null());
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
        assert!(Uuid::parse_str(value["event_id"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_sink_parsing() {
        assert_eq!(AuditSink::from_str("stdout").unwrap(), AuditSink::Stdout);
        assert_eq!(AuditSink::from_str("stderr").unwrap(), AuditSink::Stderr);
        assert_eq!(
            AuditSink::from_str("file:/tmp/a.json").unwrap(),
            AuditSink::File(PathBuf::from("/tmp/a.json"))
        );
        assert!(AuditSink::from_str("syslog").is_err());
        assert!(AuditSink::from_str("file:").is_err());
    }

    #[test]
    fn test_emit_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = AuditLog::default();
        log.push(BuildEvent::new(StageType::Lifecycle, EventType::Start).with_message("begin"));
        log.push(BuildEvent::new(StageType::Lifecycle, EventType::Complete).with_message("end"));

        let sinks = default_sinks(dir.path());
        log.emit(&sinks).unwrap();

        let text = fs_err::read_to_string(dir.path().join(AUDIT_LOG_FILENAME)).unwrap();
        assert!(text.contains("\"begin\""));
        assert!(text.contains("COMPLETE"));
    }
}
