use crate::run_events::RunEventEnvelope;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Validation,
    Extraction,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Validation => "validation",
            RunMode::Extraction => "extraction",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "validation" | "validate" => Ok(RunMode::Validation),
            "extraction" | "extract" => Ok(RunMode::Extraction),
            other => Err(format!("Unknown run mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// True while an attempt occupies the single run slot.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "idle" => Ok(RunStatus::Idle),
            "queued" | "pending" => Ok(RunStatus::Queued),
            "running" | "in_progress" | "in-progress" => Ok(RunStatus::Running),
            "succeeded" | "success" | "completed" => Ok(RunStatus::Succeeded),
            "failed" | "error" => Ok(RunStatus::Failed),
            "cancelled" | "canceled" => Ok(RunStatus::Cancelled),
            other => Err(format!("Unknown run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RunOptions {
    pub fn for_mode(mode: RunMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunServiceError {
    #[error("run stream aborted")]
    Aborted,
    #[error("run not found: {0}")]
    NotFound(String),
    #[error("invalid run event: {0}")]
    Decode(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl RunServiceError {
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

pub type RunEventStream = BoxStream<'static, Result<RunEventEnvelope, RunServiceError>>;

#[async_trait]
pub trait RunService: Send + Sync {
    /// Opens the event stream for one run attempt. Implementations should end
    /// the stream (or yield `RunServiceError::Aborted`) once `cancel` fires.
    async fn stream_run(
        &self,
        config_id: &str,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunEventStream, RunServiceError>;

    async fn fetch_run_outputs(&self, run_id: &str) -> Result<Vec<RunOutput>, RunServiceError>;

    async fn fetch_run_summary(&self, run_id: &str) -> Result<Value, RunServiceError>;

    async fn fetch_run_telemetry(&self, run_id: &str) -> Result<Value, RunServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminal_and_active_partition() {
        for status in [RunStatus::Succeeded, RunStatus::Failed, RunStatus::Cancelled] {
            assert!(status.is_terminal());
            assert!(!status.is_active());
        }
        for status in [RunStatus::Queued, RunStatus::Running] {
            assert!(status.is_active());
            assert!(!status.is_terminal());
        }
        assert!(!RunStatus::Idle.is_active());
        assert!(!RunStatus::Idle.is_terminal());
    }

    #[test]
    fn status_parses_server_aliases() {
        assert_eq!("canceled".parse::<RunStatus>(), Ok(RunStatus::Cancelled));
        assert_eq!("error".parse::<RunStatus>(), Ok(RunStatus::Failed));
        assert_eq!(" Succeeded ".parse::<RunStatus>(), Ok(RunStatus::Succeeded));
        assert!("exploded".parse::<RunStatus>().is_err());
    }

    #[test]
    fn options_keep_unknown_fields() {
        let options: RunOptions = serde_json::from_str(
            r#"{"mode":"extraction","dry_run":true,"target":"staging"}"#,
        )
        .expect("parse options");
        assert_eq!(options.mode, RunMode::Extraction);
        assert!(options.dry_run);
        assert_eq!(
            options.extra.get("target"),
            Some(&Value::String("staging".to_string()))
        );
    }
}
