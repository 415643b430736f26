//! Wire types for the run event stream.
//!
//! On the wire every event is a JSON object `{type, created_at, payload}`.
//! Payload shapes depend on `type`; decoding happens once at the stream
//! boundary so the rest of the session engine only sees typed variants.

use crate::runs::RunStatus;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_MAX_EVENT_BYTES: usize = 256 * 1024;

pub const RUN_QUEUED: &str = "run.queued";
pub const RUN_STARTED: &str = "run.started";
pub const RUN_PHASE_STARTED: &str = "run.phase.started";
pub const RUN_PHASE_COMPLETED: &str = "run.phase.completed";
pub const RUN_PROGRESS: &str = "run.progress";
pub const RUN_TELEMETRY: &str = "run.telemetry";
pub const RUN_COMPLETED: &str = "run.completed";
pub const BUILD_PROGRESS: &str = "build.progress";
pub const BUILD_PHASE: &str = "build.phase";
pub const CONSOLE_LINE: &str = "console.line";
pub const VALIDATION_RESULT: &str = "validation.result";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawRunEvent", into = "RawRunEvent")]
pub struct RunEventEnvelope {
    pub created_at: String,
    pub event: RunEvent,
}

impl RunEventEnvelope {
    pub fn new(created_at: impl Into<String>, event: RunEvent) -> Self {
        Self {
            created_at: created_at.into(),
            event,
        }
    }

    pub fn event_type(&self) -> &str {
        self.event.event_type()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Queued(RunQueuedPayload),
    Started(RunStartedPayload),
    PhaseStarted(PhasePayload),
    PhaseCompleted(PhasePayload),
    Progress(ProgressPayload),
    Telemetry(TelemetryPayload),
    BuildProgress(ProgressPayload),
    BuildPhase(PhasePayload),
    ConsoleLine(ConsoleLinePayload),
    ValidationResult(ValidationResultPayload),
    Completed(RunCompletedPayload),
    Other { kind: String, payload: Value },
}

impl RunEvent {
    pub fn event_type(&self) -> &str {
        match self {
            RunEvent::Queued(_) => RUN_QUEUED,
            RunEvent::Started(_) => RUN_STARTED,
            RunEvent::PhaseStarted(_) => RUN_PHASE_STARTED,
            RunEvent::PhaseCompleted(_) => RUN_PHASE_COMPLETED,
            RunEvent::Progress(_) => RUN_PROGRESS,
            RunEvent::Telemetry(_) => RUN_TELEMETRY,
            RunEvent::BuildProgress(_) => BUILD_PROGRESS,
            RunEvent::BuildPhase(_) => BUILD_PHASE,
            RunEvent::ConsoleLine(_) => CONSOLE_LINE,
            RunEvent::ValidationResult(_) => VALIDATION_RESULT,
            RunEvent::Completed(_) => RUN_COMPLETED,
            RunEvent::Other { kind, .. } => kind.as_str(),
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            RunEvent::Queued(payload) => payload.run_id.as_deref(),
            RunEvent::Started(payload) => payload.run_id.as_deref(),
            RunEvent::Completed(payload) => payload.run_id.as_deref(),
            _ => None,
        }
    }

    pub fn is_completion(&self) -> bool {
        matches!(self, RunEvent::Completed(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunQueuedPayload {
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub run_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_u32")]
    pub position: Option<u32>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub stream: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStartedPayload {
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub run_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub stream: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePayload {
    #[serde(default, alias = "name")]
    pub phase: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub stream: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    #[serde(default, alias = "phase", alias = "name")]
    pub step: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default)]
    pub current: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub stream: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    #[serde(default, alias = "metric")]
    pub name: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub stream: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLinePayload {
    #[serde(default, alias = "line", alias = "text", deserialize_with = "lenient_string")]
    pub message: String,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub level: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub stream: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    #[serde(default = "default_issue_severity")]
    pub severity: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub message: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub code: Option<String>,
}

fn default_issue_severity() -> String {
    "error".to_string()
}

impl ValidationIssue {
    pub fn is_error(&self) -> bool {
        matches!(
            self.severity.trim().to_lowercase().as_str(),
            "error" | "fatal" | "critical"
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResultPayload {
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub stream: Option<String>,
}

impl ValidationResultPayload {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(ValidationIssue::is_error)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCompletedPayload {
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub run_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: String,
    #[serde(default)]
    pub failure: Option<Value>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub summary: Option<Value>,
    #[serde(default, deserialize_with = "lenient_opt_u64")]
    pub duration_ms: Option<u64>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub level: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub stream: Option<String>,
}

impl RunCompletedPayload {
    /// Terminal status carried by the event. Unrecognised values count as a
    /// failure so a run never stays non-terminal after completing.
    pub fn run_status(&self) -> RunStatus {
        match self.status.parse::<RunStatus>() {
            Ok(status) if status.is_terminal() => status,
            _ => RunStatus::Failed,
        }
    }
}

// Field decoders for server payloads whose scalar types drift: numbers may
// arrive as strings, strings as numbers, and any field may be null.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(lenient_opt_string(deserializer)?.unwrap_or_default())
}

fn lenient_opt_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    })
}

fn lenient_opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|value| value.fract() == 0.0)
                .map(|value| value as i64)
        }),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_opt_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(lenient_opt_i64(deserializer)?.and_then(|value| u64::try_from(value).ok()))
}

fn lenient_opt_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    Ok(lenient_opt_i64(deserializer)?.and_then(|value| u32::try_from(value).ok()))
}

/// Untyped wire shape; only used as the serde bridge for `RunEventEnvelope`.
#[doc(hidden)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRunEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    payload: Value,
}

impl From<RawRunEvent> for RunEventEnvelope {
    /// Known types decode into typed variants. A known type whose payload
    /// does not fit its shape is kept as `Other` so the line still reaches the
    /// console; a completion always stays a completion.
    fn from(raw: RawRunEvent) -> Self {
        let payload = if raw.payload.is_null() {
            Value::Object(Map::new())
        } else {
            raw.payload
        };
        let kind = raw.kind.trim().to_string();

        let decoded = match kind.as_str() {
            RUN_QUEUED => typed(&payload, RunEvent::Queued),
            RUN_STARTED => typed(&payload, RunEvent::Started),
            RUN_PHASE_STARTED => typed(&payload, RunEvent::PhaseStarted),
            RUN_PHASE_COMPLETED => typed(&payload, RunEvent::PhaseCompleted),
            RUN_PROGRESS => typed(&payload, RunEvent::Progress),
            RUN_TELEMETRY => typed(&payload, RunEvent::Telemetry),
            BUILD_PROGRESS => typed(&payload, RunEvent::BuildProgress),
            BUILD_PHASE => typed(&payload, RunEvent::BuildPhase),
            CONSOLE_LINE => typed(&payload, RunEvent::ConsoleLine),
            VALIDATION_RESULT => typed(&payload, RunEvent::ValidationResult),
            RUN_COMPLETED => typed(&payload, RunEvent::Completed).or_else(|| {
                Some(RunEvent::Completed(RunCompletedPayload {
                    failure: Some(payload.clone()),
                    ..RunCompletedPayload::default()
                }))
            }),
            _ => None,
        };

        RunEventEnvelope {
            created_at: raw.created_at,
            event: decoded.unwrap_or(RunEvent::Other { kind, payload }),
        }
    }
}

fn typed<T: DeserializeOwned>(payload: &Value, wrap: fn(T) -> RunEvent) -> Option<RunEvent> {
    T::deserialize(payload).ok().map(wrap)
}

impl From<RunEventEnvelope> for RawRunEvent {
    fn from(envelope: RunEventEnvelope) -> Self {
        let kind = envelope.event_type().to_string();
        let payload = match envelope.event {
            RunEvent::Queued(payload) => serde_json::to_value(payload),
            RunEvent::Started(payload) => serde_json::to_value(payload),
            RunEvent::PhaseStarted(payload)
            | RunEvent::PhaseCompleted(payload)
            | RunEvent::BuildPhase(payload) => serde_json::to_value(payload),
            RunEvent::Progress(payload) | RunEvent::BuildProgress(payload) => {
                serde_json::to_value(payload)
            }
            RunEvent::Telemetry(payload) => serde_json::to_value(payload),
            RunEvent::ConsoleLine(payload) => serde_json::to_value(payload),
            RunEvent::ValidationResult(payload) => serde_json::to_value(payload),
            RunEvent::Completed(payload) => serde_json::to_value(payload),
            RunEvent::Other { payload, .. } => Ok(payload),
        };
        RawRunEvent {
            kind,
            created_at: envelope.created_at,
            payload: payload.unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventDecodeError {
    #[error("event exceeds max size: {size} > {max}")]
    OversizedEvent { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("event encode failed: {0}")]
    Encode(String),
    #[error("event decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Default)]
pub struct DecodeReport {
    pub events: Vec<RunEventEnvelope>,
    pub errors: Vec<EventDecodeError>,
}

pub fn encode_event(event: &RunEventEnvelope) -> Result<Vec<u8>, EventDecodeError> {
    let mut encoded =
        serde_json::to_vec(event).map_err(|err| EventDecodeError::Encode(err.to_string()))?;
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_event(bytes: &[u8]) -> Result<RunEventEnvelope, EventDecodeError> {
    serde_json::from_slice(trim_line_ending(bytes))
        .map_err(|err| EventDecodeError::Decode(err.to_string()))
}

fn trim_line_ending(mut raw: &[u8]) -> &[u8] {
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    raw
}

/// Incremental NDJSON decoder for run event streams. A malformed or oversized
/// line is reported and skipped; decoding resumes on the next line.
pub struct RunEventDecoder {
    max_event_bytes: usize,
    pending: Vec<u8>,
}

impl RunEventDecoder {
    pub fn new(max_event_bytes: usize) -> Self {
        Self {
            max_event_bytes,
            pending: Vec::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            self.decode_line(trim_line_ending(&line), &mut report);
        }

        if self.pending.len() > self.max_event_bytes {
            report.errors.push(EventDecodeError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_event_bytes,
            });
            self.pending.clear();
        }

        report
    }

    pub fn finish(&mut self) -> DecodeReport {
        let mut report = DecodeReport::default();
        let line = std::mem::take(&mut self.pending);
        self.decode_line(trim_line_ending(&line), &mut report);
        report
    }

    fn decode_line(&self, line: &[u8], report: &mut DecodeReport) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        if line.len() > self.max_event_bytes {
            report.errors.push(EventDecodeError::OversizedEvent {
                size: line.len(),
                max: self.max_event_bytes,
            });
            return;
        }
        match serde_json::from_slice(line) {
            Ok(event) => report.events.push(event),
            Err(err) => report.errors.push(EventDecodeError::Decode(err.to_string())),
        }
    }
}

impl Default for RunEventDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENT_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_types_decode_into_typed_variants() {
        let event: RunEventEnvelope = serde_json::from_value(json!({
            "type": "build.progress",
            "created_at": "2026-02-07T21:00:00Z",
            "payload": {"step": "compile", "percent": 40.0}
        }))
        .expect("decode");

        assert_eq!(event.created_at, "2026-02-07T21:00:00Z");
        match event.event {
            RunEvent::BuildProgress(progress) => {
                assert_eq!(progress.step.as_deref(), Some("compile"));
                assert_eq!(progress.percent, Some(40.0));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_types_are_kept_as_other() {
        let event: RunEventEnvelope = serde_json::from_value(json!({
            "type": "engine.heartbeat",
            "created_at": "2026-02-07T21:00:00Z",
            "payload": {"seq": 4}
        }))
        .expect("decode");

        assert_eq!(event.event_type(), "engine.heartbeat");
        assert!(matches!(event.event, RunEvent::Other { .. }));
    }

    #[test]
    fn missing_payload_decodes_with_defaults() {
        let event: RunEventEnvelope =
            serde_json::from_str(r#"{"type":"run.started","created_at":"x"}"#).expect("decode");
        assert_eq!(event.event, RunEvent::Started(RunStartedPayload::default()));
    }

    #[test]
    fn mistyped_payload_for_known_type_is_kept_as_other() {
        let event: RunEventEnvelope = serde_json::from_value(json!({
            "type": "validation.result",
            "created_at": "2026-02-07T21:00:00Z",
            "payload": {"issues": "not-a-list"}
        }))
        .expect("decode");
        assert_eq!(event.event_type(), VALIDATION_RESULT);
        match event.event {
            RunEvent::Other { payload, .. } => assert_eq!(payload["issues"], "not-a-list"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn completion_fields_tolerate_strings_and_nulls() {
        let event: RunEventEnvelope = serde_json::from_value(json!({
            "type": "run.completed",
            "created_at": "2026-02-07T21:00:00Z",
            "payload": {
                "run_id": 42,
                "status": "failed",
                "exit_code": "137",
                "duration_ms": "1500",
                "level": null
            }
        }))
        .expect("decode");
        match event.event {
            RunEvent::Completed(completed) => {
                assert_eq!(completed.run_id.as_deref(), Some("42"));
                assert_eq!(completed.exit_code, Some(137));
                assert_eq!(completed.duration_ms, Some(1500));
                assert_eq!(completed.level, None);
                assert_eq!(completed.run_status(), RunStatus::Failed);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let null_status: RunEventEnvelope = serde_json::from_value(json!({
            "type": "run.completed",
            "created_at": "2026-02-07T21:00:00Z",
            "payload": {"status": null, "exit_code": "n/a"}
        }))
        .expect("decode");
        match null_status.event {
            RunEvent::Completed(completed) => {
                assert_eq!(completed.status, "");
                assert_eq!(completed.exit_code, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn completion_with_unusable_payload_stays_terminal() {
        let event: RunEventEnvelope = serde_json::from_value(json!({
            "type": "run.completed",
            "created_at": "2026-02-07T21:00:00Z",
            "payload": "worker lost"
        }))
        .expect("decode");
        assert!(event.event.is_completion());
        match event.event {
            RunEvent::Completed(completed) => {
                assert_eq!(completed.run_status(), RunStatus::Failed);
                assert_eq!(completed.failure, Some(json!("worker lost")));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn console_line_with_null_message_decodes() {
        let event: RunEventEnvelope = serde_json::from_value(json!({
            "type": "console.line",
            "created_at": "2026-02-07T21:00:00Z",
            "payload": {"message": null, "stream": "stderr"}
        }))
        .expect("decode");
        match event.event {
            RunEvent::ConsoleLine(line) => {
                assert_eq!(line.message, "");
                assert_eq!(line.stream.as_deref(), Some("stderr"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn completion_status_falls_back_to_failed() {
        let completed = RunCompletedPayload {
            status: "exploded".to_string(),
            ..RunCompletedPayload::default()
        };
        assert_eq!(completed.run_status(), RunStatus::Failed);

        let running = RunCompletedPayload {
            status: "running".to_string(),
            ..RunCompletedPayload::default()
        };
        assert_eq!(running.run_status(), RunStatus::Failed);
    }

    #[test]
    fn decoder_recovers_after_malformed_line() {
        let first = encode_event(&RunEventEnvelope::new(
            "2026-02-07T21:00:00Z",
            RunEvent::Queued(RunQueuedPayload {
                run_id: Some("run-1".to_string()),
                position: None,
                stream: None,
            }),
        ))
        .expect("encode first");
        let second = encode_event(&RunEventEnvelope::new(
            "2026-02-07T21:00:01Z",
            RunEvent::Started(RunStartedPayload {
                run_id: Some("run-1".to_string()),
                stream: None,
            }),
        ))
        .expect("encode second");

        let mut chunk = first;
        chunk.extend_from_slice(b"{\"type\":\n");
        chunk.extend_from_slice(&second);

        let mut decoder = RunEventDecoder::default();
        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.events.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.events[1].event.run_id(), Some("run-1"));
    }

    #[test]
    fn decoder_holds_partial_line_until_finish() {
        let mut decoder = RunEventDecoder::default();
        let report = decoder.push_chunk(br#"{"type":"run.started","created_at":"x","payload":{}}"#);
        assert!(report.events.is_empty());

        let report = decoder.finish();
        assert_eq!(report.events.len(), 1);
    }

    #[test]
    fn decoder_rejects_oversized_line_and_continues() {
        let oversized = format!("{{\"blob\":\"{}\"}}\n", "x".repeat(2_000));
        let mut chunk = oversized.into_bytes();
        chunk.extend_from_slice(b"{\"type\":\"run.started\",\"created_at\":\"x\"}\n");

        let mut decoder = RunEventDecoder::new(1_024);
        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.events.len(), 1);
        assert!(matches!(
            report.errors[0],
            EventDecodeError::OversizedEvent { .. }
        ));
    }
}
