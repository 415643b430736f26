use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use wb_core::{
    RunEventDecoder, RunEventEnvelope, RunEventStream, RunOptions, RunOutput, RunService,
    RunServiceError,
};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Decodes an NDJSON event log. Malformed lines are logged and skipped.
pub fn read_events(mut reader: impl Read) -> Result<Vec<RunEventEnvelope>> {
    let mut decoder = RunEventDecoder::default();
    let mut events = Vec::new();
    let mut buffer = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let read = reader
            .read(&mut buffer)
            .context("Failed to read event stream")?;
        if read == 0 {
            break;
        }
        let report = decoder.push_chunk(&buffer[..read]);
        for err in &report.errors {
            warn!(event = "replay_event_skipped", error = %err);
        }
        events.extend(report.events);
    }
    let report = decoder.finish();
    for err in &report.errors {
        warn!(event = "replay_event_skipped", error = %err);
    }
    events.extend(report.events);
    Ok(events)
}

/// Run service backed by a recorded event log. Artifacts come from
/// `outputs.json`, `summary.json`, and `telemetry.json` in the artifact dir.
pub struct ReplayRunService {
    events: Vec<RunEventEnvelope>,
    artifacts: Option<PathBuf>,
}

impl ReplayRunService {
    pub fn new(events: Vec<RunEventEnvelope>, artifacts: Option<PathBuf>) -> Self {
        Self { events, artifacts }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), None)
    }

    async fn read_artifact(&self, run_id: &str, name: &str) -> Result<Value, RunServiceError> {
        let Some(dir) = self.artifacts.as_deref() else {
            return Err(RunServiceError::NotFound(format!("{name} for {run_id}")));
        };
        read_json(&dir.join(name)).await
    }
}

async fn read_json(path: &Path) -> Result<Value, RunServiceError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(RunServiceError::NotFound(path.display().to_string()))
        }
        Err(err) => return Err(RunServiceError::Transport(err.to_string())),
    };
    serde_json::from_str(&contents).map_err(|err| RunServiceError::Decode(err.to_string()))
}

#[async_trait]
impl RunService for ReplayRunService {
    async fn stream_run(
        &self,
        _config_id: &str,
        _options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunEventStream, RunServiceError> {
        let events = self.events.clone().into_iter().map(Ok::<_, RunServiceError>);
        Ok(stream::iter(events)
            .take_until(async move { cancel.cancelled().await })
            .boxed())
    }

    async fn fetch_run_outputs(&self, run_id: &str) -> Result<Vec<RunOutput>, RunServiceError> {
        let value = self.read_artifact(run_id, "outputs.json").await?;
        serde_json::from_value(value).map_err(|err| RunServiceError::Decode(err.to_string()))
    }

    async fn fetch_run_summary(&self, run_id: &str) -> Result<Value, RunServiceError> {
        self.read_artifact(run_id, "summary.json").await
    }

    async fn fetch_run_telemetry(&self, run_id: &str) -> Result<Value, RunServiceError> {
        self.read_artifact(run_id, "telemetry.json").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use wb_core::RunEvent;

    const LOG: &str = concat!(
        r#"{"type":"run.started","created_at":"2026-03-01T09:00:00Z","payload":{"run_id":"run-3"}}"#,
        "\n",
        "not json\n",
        r#"{"type":"run.completed","created_at":"2026-03-01T09:00:01Z","payload":{"run_id":"run-3","status":"succeeded"}}"#,
        "\n"
    );

    #[test]
    fn read_events_skips_malformed_lines() {
        let events = read_events(LOG.as_bytes()).expect("read");
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].event, RunEvent::Started(_)));
        assert!(events[1].event.is_completion());
    }

    #[tokio::test]
    async fn artifacts_are_read_from_directory() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(
            dir.path().join("outputs.json"),
            r#"[{"name":"normalized.xlsx","size_bytes":12}]"#,
        )
        .expect("write outputs");
        fs::write(dir.path().join("summary.json"), r#"{"rows":4}"#).expect("write summary");
        let service = ReplayRunService::new(Vec::new(), Some(dir.path().to_path_buf()));

        let outputs = service.fetch_run_outputs("run-3").await.expect("outputs");
        assert_eq!(outputs[0].name, "normalized.xlsx");
        assert_eq!(outputs[0].size_bytes, Some(12));
        assert_eq!(
            service.fetch_run_summary("run-3").await.expect("summary"),
            serde_json::json!({"rows": 4})
        );
        assert!(matches!(
            service.fetch_run_telemetry("run-3").await,
            Err(RunServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_stream_yields_nothing() {
        let events = read_events(LOG.as_bytes()).expect("read");
        let service = ReplayRunService::new(events, None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stream = service
            .stream_run("cfg", &RunOptions::default(), cancel)
            .await
            .expect("stream");
        assert_eq!(stream.count().await, 0);
    }
}
