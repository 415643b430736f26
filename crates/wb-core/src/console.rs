//! Console event translation.
//!
//! `translate` turns one decoded run event into one leveled console line. It
//! is a pure function: no state, no I/O, and no input can make it panic.

use crate::run_events::{
    ConsoleLinePayload, PhasePayload, ProgressPayload, RunCompletedPayload, RunEvent,
    RunEventEnvelope, TelemetryPayload, ValidationResultPayload,
};
use crate::runs::RunStatus;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

const GENERIC_FAILURE: &str = "run failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl ConsoleLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleLevel::Info => "info",
            ConsoleLevel::Success => "success",
            ConsoleLevel::Warning => "warning",
            ConsoleLevel::Error => "error",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "info" | "debug" | "trace" | "notice" | "log" => Some(ConsoleLevel::Info),
            "success" | "ok" => Some(ConsoleLevel::Success),
            "warning" | "warn" => Some(ConsoleLevel::Warning),
            "error" | "fatal" | "critical" => Some(ConsoleLevel::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleOrigin {
    Run,
    Build,
    Raw,
}

impl ConsoleOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleOrigin::Run => "run",
            ConsoleOrigin::Build => "build",
            ConsoleOrigin::Raw => "raw",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub level: ConsoleLevel,
    pub message: String,
    pub origin: ConsoleOrigin,
    pub timestamp: String,
}

impl ConsoleLine {
    pub fn new(
        level: ConsoleLevel,
        origin: ConsoleOrigin,
        message: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            level,
            message: message.into(),
            origin,
            timestamp: timestamp.into(),
        }
    }

    /// Line produced by the session itself rather than the server stream.
    pub fn local(level: ConsoleLevel, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::new(
            level,
            ConsoleOrigin::Run,
            message,
            now.format("%H:%M:%S").to_string(),
        )
    }
}

impl fmt::Display for ConsoleLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timestamp.is_empty() {
            write!(f, "[{}] {}", self.level, self.message)
        } else {
            write!(f, "{} [{}] {}", self.timestamp, self.level, self.message)
        }
    }
}

struct Rendered {
    origin: ConsoleOrigin,
    message: String,
    level: Option<ConsoleLevel>,
    default_level: ConsoleLevel,
    stream: Option<String>,
}

impl Rendered {
    fn new(origin: ConsoleOrigin, message: String) -> Self {
        Self {
            origin,
            message,
            level: None,
            default_level: ConsoleLevel::Info,
            stream: None,
        }
    }

    fn with_level(mut self, level: Option<&str>) -> Self {
        self.level = level.and_then(ConsoleLevel::parse);
        self
    }

    fn with_stream(mut self, stream: Option<&str>) -> Self {
        self.stream = stream.map(str::to_string);
        self
    }
}

pub fn translate(envelope: &RunEventEnvelope) -> ConsoleLine {
    let timestamp = format_timestamp(&envelope.created_at);
    let rendered = render(&envelope.event);

    let mut level = rendered.level.unwrap_or(rendered.default_level);
    if is_stderr(rendered.stream.as_deref()) {
        level = level.max(ConsoleLevel::Warning);
    }
    if let RunEvent::Completed(completed) = &envelope.event {
        level = completion_level(completed).unwrap_or(level);
    }

    ConsoleLine {
        level,
        message: rendered.message,
        origin: rendered.origin,
        timestamp,
    }
}

fn render(event: &RunEvent) -> Rendered {
    match event {
        RunEvent::Queued(queued) => {
            let mut message = match queued.run_id.as_deref() {
                Some(run_id) => format!("Run {run_id} queued"),
                None => "Run queued".to_string(),
            };
            if let Some(position) = queued.position {
                message.push_str(&format!(" (position {position})"));
            }
            Rendered::new(ConsoleOrigin::Run, message).with_stream(queued.stream.as_deref())
        }
        RunEvent::Started(started) => {
            let message = match started.run_id.as_deref() {
                Some(run_id) => format!("Run {run_id} started"),
                None => "Run started".to_string(),
            };
            Rendered::new(ConsoleOrigin::Run, message).with_stream(started.stream.as_deref())
        }
        RunEvent::PhaseStarted(phase) => {
            render_phase(ConsoleOrigin::Run, "Phase started", phase)
        }
        RunEvent::PhaseCompleted(phase) => {
            render_phase(ConsoleOrigin::Run, "Phase completed", phase)
        }
        RunEvent::BuildPhase(phase) => render_phase(ConsoleOrigin::Build, "Build phase", phase),
        RunEvent::Progress(progress) => render_progress(ConsoleOrigin::Run, "Step", progress),
        RunEvent::BuildProgress(progress) => {
            render_progress(ConsoleOrigin::Build, "Build step", progress)
        }
        RunEvent::Telemetry(telemetry) => render_telemetry(telemetry),
        RunEvent::ConsoleLine(line) => render_console_line(line),
        RunEvent::ValidationResult(result) => render_validation(result),
        RunEvent::Completed(completed) => {
            Rendered::new(ConsoleOrigin::Run, completion_message(completed))
                .with_level(completed.level.as_deref())
                .with_stream(completed.stream.as_deref())
        }
        RunEvent::Other { kind, payload } => render_other(kind, payload),
    }
}

fn render_phase(origin: ConsoleOrigin, label: &str, phase: &PhasePayload) -> Rendered {
    let name = phase.phase.trim();
    let mut message = if name.is_empty() {
        label.to_string()
    } else {
        format!("{label}: {name}")
    };

    let mut details = Vec::new();
    if let Some(status) = phase.status.as_deref().filter(|s| !s.trim().is_empty()) {
        details.push(status.trim().to_string());
    }
    if let Some(duration_ms) = phase.duration_ms {
        details.push(format_duration_ms(duration_ms));
    }
    if !details.is_empty() {
        message.push_str(&format!(" ({})", details.join(", ")));
    }
    if let Some(extra) = phase.message.as_deref().filter(|s| !s.trim().is_empty()) {
        message.push_str(&format!(": {}", extra.trim()));
    }

    Rendered::new(origin, message)
        .with_level(phase.level.as_deref())
        .with_stream(phase.stream.as_deref())
}

fn render_progress(origin: ConsoleOrigin, label: &str, progress: &ProgressPayload) -> Rendered {
    let mut message = match progress.step.as_deref().map(str::trim) {
        Some(step) if !step.is_empty() => format!("{label}: {step}"),
        _ => label.to_string(),
    };
    if let Some(text) = progress.message.as_deref().filter(|s| !s.trim().is_empty()) {
        message.push_str(&format!(" - {}", text.trim()));
    }
    if let (Some(current), Some(total)) = (progress.current, progress.total) {
        message.push_str(&format!(" ({current}/{total})"));
    } else if let Some(percent) = progress.percent.filter(|p| p.is_finite()) {
        message.push_str(&format!(" ({:.0}%)", percent.clamp(0.0, 100.0)));
    }

    Rendered::new(origin, message)
        .with_level(progress.level.as_deref())
        .with_stream(progress.stream.as_deref())
}

fn render_telemetry(telemetry: &TelemetryPayload) -> Rendered {
    let mut message = "Telemetry".to_string();
    if let Some(phase) = telemetry.phase.as_deref().filter(|s| !s.trim().is_empty()) {
        message.push_str(&format!(" [{}]", phase.trim()));
    }
    match (telemetry.name.as_deref(), telemetry.value.as_ref()) {
        (Some(name), Some(value)) => message.push_str(&format!(": {name}={}", value_text(value))),
        (Some(name), None) => message.push_str(&format!(": {name}")),
        (None, Some(value)) => message.push_str(&format!(": {}", value_text(value))),
        (None, None) => {}
    }
    Rendered::new(ConsoleOrigin::Run, message)
        .with_level(telemetry.level.as_deref())
        .with_stream(telemetry.stream.as_deref())
}

fn render_console_line(line: &ConsoleLinePayload) -> Rendered {
    let origin = match line.scope.as_deref().map(str::trim) {
        Some(scope) if scope.eq_ignore_ascii_case("build") => ConsoleOrigin::Build,
        _ => ConsoleOrigin::Run,
    };
    let message = line.message.trim_end_matches(['\r', '\n']).to_string();
    Rendered::new(origin, message)
        .with_level(line.level.as_deref())
        .with_stream(line.stream.as_deref())
}

fn render_validation(result: &ValidationResultPayload) -> Rendered {
    let errors = result.issues.iter().filter(|issue| issue.is_error()).count();
    let total = result.issues.len();
    let (message, level) = if total == 0 {
        ("Validation passed".to_string(), ConsoleLevel::Success)
    } else if errors > 0 {
        (
            format!("Validation found {total} issue(s), {errors} error(s)"),
            ConsoleLevel::Error,
        )
    } else {
        (
            format!("Validation found {total} warning(s)"),
            ConsoleLevel::Warning,
        )
    };
    let mut rendered =
        Rendered::new(ConsoleOrigin::Run, message).with_stream(result.stream.as_deref());
    rendered.default_level = level;
    rendered
}

fn render_other(kind: &str, payload: &Value) -> Rendered {
    let message = match payload {
        Value::Null => kind.to_string(),
        Value::Object(map) if map.is_empty() => kind.to_string(),
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(text) => format!("{kind}: {text}"),
            None => format!("{kind}: {payload}"),
        },
        other => format!("{kind}: {}", value_text(other)),
    };
    let level = payload.get("level").and_then(Value::as_str);
    let stream = payload.get("stream").and_then(Value::as_str);
    Rendered::new(ConsoleOrigin::Raw, message)
        .with_level(level)
        .with_stream(stream)
}

fn completion_level(completed: &RunCompletedPayload) -> Option<ConsoleLevel> {
    match completed.run_status() {
        RunStatus::Succeeded => Some(ConsoleLevel::Success),
        RunStatus::Failed => Some(ConsoleLevel::Error),
        RunStatus::Cancelled => Some(ConsoleLevel::Warning),
        _ => None,
    }
}

fn completion_message(completed: &RunCompletedPayload) -> String {
    match completed.run_status() {
        RunStatus::Succeeded => {
            let mut message = "Run succeeded".to_string();
            if let Some(duration_ms) = completed.duration_ms {
                message.push_str(&format!(" in {}", format_duration_ms(duration_ms)));
            }
            if let Some(summary) = completed.summary.as_ref().and_then(summary_text) {
                message.push_str(&format!(": {summary}"));
            }
            message
        }
        RunStatus::Cancelled => "Run cancelled".to_string(),
        _ => {
            let base = completed
                .failure
                .as_ref()
                .and_then(failure_text)
                .unwrap_or_else(|| GENERIC_FAILURE.to_string());
            match completed.exit_code {
                Some(code) => format!("{base} (exit code {code})"),
                None => base,
            }
        }
    }
}

fn failure_text(failure: &Value) -> Option<String> {
    match failure {
        Value::Null => None,
        Value::String(text) => Some(text.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Object(map) => match map.get("message") {
            Some(Value::String(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Some(Value::Null) | None => {
                if map.is_empty() {
                    None
                } else {
                    Some(failure.to_string())
                }
            }
            Some(other) => Some(value_text(other)),
        },
        other => Some(value_text(other)),
    }
}

fn summary_text(summary: &Value) -> Option<String> {
    match summary {
        Value::Null => None,
        Value::String(text) => Some(text.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Object(map) if map.is_empty() => None,
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(text) => Some(text.to_string()),
            None => Some(summary.to_string()),
        },
        other => Some(value_text(other)),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn is_stderr(stream: Option<&str>) -> bool {
    stream
        .map(|s| s.trim().eq_ignore_ascii_case("stderr"))
        .unwrap_or(false)
}

fn format_duration_ms(duration_ms: u64) -> String {
    if duration_ms < 1_000 {
        format!("{duration_ms} ms")
    } else {
        format!("{:.1} s", duration_ms as f64 / 1_000.0)
    }
}

/// Renders a server timestamp as `HH:MM:SS` (UTC). Unparsable input yields an
/// empty string.
pub fn format_timestamp(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.with_timezone(&Utc).format("%H:%M:%S").to_string();
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, pattern) {
            return naive.format("%H:%M:%S").to_string();
        }
    }
    String::new()
}
