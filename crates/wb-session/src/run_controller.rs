//! Run session controller.
//!
//! Owns the single active validate/extract attempt: admission checks, the
//! save-before-run barrier, the cancellable event stream, and the artifact
//! fetches that follow an extraction. Every write from an async continuation
//! is checked against the attempt (or run id) that issued it, so results from
//! an aborted or superseded attempt never land.

use crate::config::SessionConfig;
use crate::console_buffer::ConsoleBuffer;
use crate::tab_runtime::{SaveBarrier, SaveResult};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wb_core::run_events::{RunCompletedPayload, ValidationIssue};
use wb_core::{
    translate, ConsoleLevel, ConsoleLine, RunEvent, RunEventEnvelope, RunMode, RunOptions,
    RunOutput, RunService, RunServiceError, RunStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    #[default]
    Idle,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ValidationState {
    pub status: ValidationStatus,
    pub messages: Vec<ValidationIssue>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub digest: Option<String>,
}

/// Record of the most recent extraction and its artifacts. Each artifact has
/// its own loaded flag and error; one failing fetch leaves the others intact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestRun {
    pub run_id: String,
    pub status: RunStatus,
    pub outputs: Vec<RunOutput>,
    pub outputs_loaded: bool,
    pub outputs_error: Option<String>,
    pub summary: Option<Value>,
    pub summary_loaded: bool,
    pub summary_error: Option<String>,
    pub telemetry: Option<Value>,
    pub telemetry_loaded: bool,
    pub telemetry_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl LatestRun {
    fn new(run_id: String, completion: &Completion) -> Self {
        Self {
            run_id,
            status: completion.status,
            outputs: Vec::new(),
            outputs_loaded: false,
            outputs_error: None,
            summary: None,
            summary_loaded: false,
            summary_error: None,
            telemetry: None,
            telemetry_loaded: false,
            telemetry_error: None,
            started_at: completion.started_at,
            completed_at: Some(completion.completed_at),
            duration_ms: completion.duration_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BannerKind {
    SaveFailed,
    StreamFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Banner {
    pub kind: BannerKind,
    pub message: String,
    pub blocking: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub config_id: String,
    pub options: RunOptions,
}

impl RunRequest {
    pub fn new(config_id: impl Into<String>, options: RunOptions) -> Self {
        Self {
            config_id: config_id.into(),
            options,
        }
    }

    pub fn mode(&self) -> RunMode {
        self.options.mode
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunRejection {
    AlreadyRunning,
    TreeNotReady,
    ValidationPending,
    PrepareDeclined,
    ShutDown,
    SaveFailed(Vec<SaveResult>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Rejected(RunRejection),
    Finished {
        run_id: Option<String>,
        status: RunStatus,
    },
    Cancelled,
    StreamFailed {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSessionSnapshot {
    pub mode: RunMode,
    pub run_status: RunStatus,
    pub run_id: Option<String>,
    pub validation: ValidationState,
    pub latest_run: Option<LatestRun>,
    pub banner: Option<Banner>,
    pub console: Vec<ConsoleLine>,
}

struct Completion {
    run_id: Option<String>,
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: DateTime<Utc>,
    duration_ms: Option<u64>,
}

enum Applied {
    Continue,
    Completed(Completion),
    Stale,
}

struct SessionState {
    mode: RunMode,
    run_status: RunStatus,
    validation: ValidationState,
    console: ConsoleBuffer,
    latest_run: Option<LatestRun>,
    banner: Option<Banner>,
    tree_ready: bool,
    shut_down: bool,
    attempt: u64,
    cancel: Option<CancellationToken>,
    run_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
}

impl SessionState {
    fn admission(&self) -> Option<RunRejection> {
        if self.shut_down {
            Some(RunRejection::ShutDown)
        } else if self.run_status.is_active() {
            Some(RunRejection::AlreadyRunning)
        } else if !self.tree_ready {
            Some(RunRejection::TreeNotReady)
        } else if self.validation.status == ValidationStatus::Running {
            Some(RunRejection::ValidationPending)
        } else {
            None
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.attempt == attempt
            && self
                .cancel
                .as_ref()
                .is_some_and(|token| !token.is_cancelled())
    }

    fn push_local(&mut self, level: ConsoleLevel, message: impl Into<String>) {
        self.console.push(ConsoleLine::local(level, message, Utc::now()));
    }

    fn settle_validation(&mut self, status: RunStatus, now: DateTime<Utc>) {
        if self.validation.status != ValidationStatus::Running {
            return;
        }
        self.validation.status = match status {
            RunStatus::Succeeded => ValidationStatus::Success,
            RunStatus::Failed => ValidationStatus::Error,
            _ => ValidationStatus::Idle,
        };
        self.validation.last_run_at = Some(now);
    }

    fn apply(&mut self, envelope: &RunEventEnvelope) -> Applied {
        self.console.push(translate(envelope));
        if let Some(run_id) = envelope.event.run_id() {
            self.run_id = Some(run_id.to_string());
        }

        match &envelope.event {
            RunEvent::Queued(_) => {}
            RunEvent::Started(_) => {
                self.run_status = RunStatus::Running;
                if let Some(started_at) = parse_timestamp(&envelope.created_at) {
                    self.started_at = Some(started_at);
                }
            }
            RunEvent::ValidationResult(result) => {
                self.promote_to_running();
                if self.mode == RunMode::Validation {
                    self.validation = ValidationState {
                        status: if result.has_errors() {
                            ValidationStatus::Error
                        } else {
                            ValidationStatus::Success
                        },
                        messages: result.issues.clone(),
                        last_run_at: Some(Utc::now()),
                        digest: result.digest.clone(),
                    };
                }
            }
            RunEvent::Completed(payload) => {
                return Applied::Completed(self.complete(payload, &envelope.created_at));
            }
            _ => self.promote_to_running(),
        }
        Applied::Continue
    }

    fn promote_to_running(&mut self) {
        if self.run_status == RunStatus::Queued {
            self.run_status = RunStatus::Running;
        }
    }

    fn complete(&mut self, payload: &RunCompletedPayload, created_at: &str) -> Completion {
        let status = payload.run_status();
        let completed_at = parse_timestamp(created_at).unwrap_or_else(Utc::now);
        self.run_status = status;
        self.settle_validation(status, completed_at);

        let duration_ms = payload.duration_ms.or_else(|| {
            self.started_at
                .map(|started| (completed_at - started).num_milliseconds())
                .and_then(|ms| u64::try_from(ms).ok())
        });
        Completion {
            run_id: self.run_id.clone(),
            status,
            started_at: self.started_at,
            completed_at,
            duration_ms,
        }
    }
}

pub struct RunSessionController {
    state: Mutex<SessionState>,
    runs: Arc<dyn RunService>,
    barrier: Arc<dyn SaveBarrier>,
}

impl RunSessionController {
    pub fn new(
        config: &SessionConfig,
        runs: Arc<dyn RunService>,
        barrier: Arc<dyn SaveBarrier>,
    ) -> Self {
        Self {
            state: Mutex::new(SessionState {
                mode: config.run_options.mode,
                run_status: RunStatus::Idle,
                validation: ValidationState::default(),
                console: ConsoleBuffer::new(config.console_capacity()),
                latest_run: None,
                banner: None,
                tree_ready: false,
                shut_down: false,
                attempt: 0,
                cancel: None,
                run_id: None,
                started_at: None,
            }),
            runs,
            barrier,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Runs `f` only while `attempt` is still the live, uncancelled attempt.
    fn with_current<R>(&self, attempt: u64, f: impl FnOnce(&mut SessionState) -> R) -> Option<R> {
        self.with_state(|state| state.is_current(attempt).then(|| f(state)))
    }

    pub fn run_status(&self) -> RunStatus {
        self.with_state(|state| state.run_status)
    }

    pub fn run_mode(&self) -> RunMode {
        self.with_state(|state| state.mode)
    }

    pub fn run_id(&self) -> Option<String> {
        self.with_state(|state| state.run_id.clone())
    }

    pub fn validation(&self) -> ValidationState {
        self.with_state(|state| state.validation.clone())
    }

    pub fn console(&self) -> Vec<ConsoleLine> {
        self.with_state(|state| state.console.to_vec())
    }

    pub fn latest_run(&self) -> Option<LatestRun> {
        self.with_state(|state| state.latest_run.clone())
    }

    pub fn banner(&self) -> Option<Banner> {
        self.with_state(|state| state.banner.clone())
    }

    pub fn snapshot(&self) -> RunSessionSnapshot {
        self.with_state(|state| RunSessionSnapshot {
            mode: state.mode,
            run_status: state.run_status,
            run_id: state.run_id.clone(),
            validation: state.validation.clone(),
            latest_run: state.latest_run.clone(),
            banner: state.banner.clone(),
            console: state.console.to_vec(),
        })
    }

    pub fn set_tree_ready(&self, ready: bool) {
        self.with_state(|state| state.tree_ready = ready);
    }

    pub fn clear_console(&self) {
        self.with_state(|state| state.console.clear());
    }

    pub fn dismiss_banner(&self) -> bool {
        self.with_state(|state| state.banner.take().is_some())
    }

    /// Executes one attempt to completion. `prepare` runs after the admission
    /// checks and before any network call; returning false abandons the run.
    pub async fn start_run(
        &self,
        request: RunRequest,
        prepare: impl FnOnce() -> bool,
    ) -> RunOutcome {
        if let Some(rejection) = self.with_state(|state| state.admission()) {
            info!(event = "run_rejected", reason = ?rejection);
            return RunOutcome::Rejected(rejection);
        }
        if !prepare() {
            debug!(event = "run_prepare_declined");
            return RunOutcome::Rejected(RunRejection::PrepareDeclined);
        }

        let mode = request.mode();
        let reserved = self.with_state(|state| {
            if let Some(rejection) = state.admission() {
                return Err(rejection);
            }
            if let Some(previous) = state.cancel.take() {
                previous.cancel();
            }
            let token = CancellationToken::new();
            state.attempt += 1;
            state.cancel = Some(token.clone());
            state.mode = mode;
            state.run_status = RunStatus::Queued;
            state.run_id = None;
            state.started_at = Some(Utc::now());
            state.banner = None;
            Ok((state.attempt, token))
        });
        let (attempt, token) = match reserved {
            Ok(reserved) => reserved,
            Err(rejection) => return RunOutcome::Rejected(rejection),
        };

        // Saves always run to completion; a cancel during the flush only takes
        // effect once every tab has settled.
        let saves = self.barrier.flush_dirty().await;
        if !self.with_state(|state| state.is_current(attempt)) {
            debug!(event = "run_cancelled_during_save", attempt);
            return RunOutcome::Cancelled;
        }
        let failures = saves
            .into_iter()
            .filter(|result| result.outcome.is_failure())
            .collect::<Vec<_>>();
        if !failures.is_empty() {
            let message = save_failure_message(&failures);
            warn!(event = "run_blocked_by_save", attempt, failed = failures.len());
            self.with_current(attempt, |state| {
                state.run_status = RunStatus::Idle;
                state.push_local(ConsoleLevel::Error, message.clone());
                state.banner = Some(Banner {
                    kind: BannerKind::SaveFailed,
                    message,
                    blocking: true,
                });
            });
            return RunOutcome::Rejected(RunRejection::SaveFailed(failures));
        }

        let live = self.with_current(attempt, |state| {
            if mode == RunMode::Validation {
                state.validation.status = ValidationStatus::Running;
                state.validation.messages.clear();
                state.validation.digest = None;
            }
        });
        if live.is_none() {
            return RunOutcome::Cancelled;
        }
        info!(
            event = "run_start",
            attempt,
            mode = mode.as_str(),
            config_id = %request.config_id
        );

        let opened = until_cancelled(
            &token,
            self.runs
                .stream_run(&request.config_id, &request.options, token.clone()),
        )
        .await;
        let mut stream = match opened {
            None => return RunOutcome::Cancelled,
            Some(Ok(stream)) => stream,
            Some(Err(err)) => return self.stream_failed(attempt, &token, err),
        };

        let completion = loop {
            let Some(next) = until_cancelled(&token, stream.next()).await else {
                debug!(event = "run_stream_aborted", attempt);
                return RunOutcome::Cancelled;
            };
            match next {
                Some(Ok(envelope)) => {
                    let applied = self
                        .with_current(attempt, |state| state.apply(&envelope))
                        .unwrap_or(Applied::Stale);
                    match applied {
                        Applied::Continue => {}
                        Applied::Completed(completion) => break completion,
                        Applied::Stale => return RunOutcome::Cancelled,
                    }
                }
                Some(Err(err)) => return self.stream_failed(attempt, &token, err),
                None => return self.stream_ended(attempt),
            }
        };
        drop(stream);

        info!(
            event = "run_complete",
            attempt,
            status = completion.status.as_str(),
            run_id = completion.run_id.as_deref().unwrap_or("")
        );
        if mode == RunMode::Extraction {
            self.fetch_artifacts(attempt, &token, &completion).await;
        }
        RunOutcome::Finished {
            run_id: completion.run_id,
            status: completion.status,
        }
    }

    async fn fetch_artifacts(&self, attempt: u64, token: &CancellationToken, completion: &Completion) {
        let Some(run_id) = completion.run_id.clone() else {
            warn!(event = "run_artifacts_skipped", attempt, reason = "missing run id");
            self.with_current(attempt, |state| {
                state.push_local(
                    ConsoleLevel::Warning,
                    "Run completed without a run id; artifacts are unavailable",
                );
            });
            return;
        };
        let recorded = self.with_current(attempt, |state| {
            state.latest_run = Some(LatestRun::new(run_id.clone(), completion));
        });
        if recorded.is_none() {
            return;
        }

        let Some(outputs) = until_cancelled(token, self.runs.fetch_run_outputs(&run_id)).await
        else {
            return;
        };
        self.with_latest_run(&run_id, |run| match outputs {
            Ok(outputs) => {
                run.outputs = outputs;
                run.outputs_loaded = true;
            }
            Err(err) => run.outputs_error = Some(artifact_error("outputs", &err)),
        });

        let Some(summary) = until_cancelled(token, self.runs.fetch_run_summary(&run_id)).await
        else {
            return;
        };
        self.with_latest_run(&run_id, |run| match summary {
            Ok(summary) => {
                run.summary = Some(summary);
                run.summary_loaded = true;
            }
            Err(err) => run.summary_error = Some(artifact_error("summary", &err)),
        });

        let Some(telemetry) = until_cancelled(token, self.runs.fetch_run_telemetry(&run_id)).await
        else {
            return;
        };
        self.with_latest_run(&run_id, |run| match telemetry {
            Ok(telemetry) => {
                run.telemetry = Some(telemetry);
                run.telemetry_loaded = true;
            }
            Err(err) => run.telemetry_error = Some(artifact_error("telemetry", &err)),
        });
    }

    fn with_latest_run(&self, run_id: &str, f: impl FnOnce(&mut LatestRun)) {
        self.with_state(|state| match state.latest_run.as_mut() {
            Some(run) if run.run_id == run_id => f(run),
            _ => warn!(event = "run_artifact_discarded", run_id),
        });
    }

    fn stream_failed(
        &self,
        attempt: u64,
        token: &CancellationToken,
        err: RunServiceError,
    ) -> RunOutcome {
        if err.is_abort() || token.is_cancelled() {
            debug!(event = "run_stream_aborted", attempt);
            return RunOutcome::Cancelled;
        }
        let message = format!("Run stream failed: {err}");
        error!(event = "run_stream_failed", attempt, error = %err);
        let applied = self.with_current(attempt, |state| {
            state.push_local(ConsoleLevel::Error, message.clone());
            state.banner = Some(Banner {
                kind: BannerKind::StreamFailed,
                message: message.clone(),
                blocking: false,
            });
            state.run_status = RunStatus::Idle;
            if state.validation.status == ValidationStatus::Running {
                state.validation.status = ValidationStatus::Idle;
            }
        });
        match applied {
            Some(()) => RunOutcome::StreamFailed { message },
            None => RunOutcome::Cancelled,
        }
    }

    fn stream_ended(&self, attempt: u64) -> RunOutcome {
        warn!(event = "run_stream_ended_early", attempt);
        let run_id = self.with_current(attempt, |state| {
            state.push_local(
                ConsoleLevel::Warning,
                "Run stream ended before the run completed",
            );
            state.run_status = RunStatus::Failed;
            state.settle_validation(RunStatus::Failed, Utc::now());
            state.run_id.clone()
        });
        match run_id {
            Some(run_id) => RunOutcome::Finished {
                run_id,
                status: RunStatus::Failed,
            },
            None => RunOutcome::Cancelled,
        }
    }

    /// Cancels the active attempt. Returns false when nothing was running.
    pub fn cancel_run(&self) -> bool {
        self.with_state(|state| {
            if !state.run_status.is_active() {
                return false;
            }
            if let Some(token) = state.cancel.as_ref() {
                token.cancel();
            }
            state.run_status = RunStatus::Cancelled;
            if state.validation.status == ValidationStatus::Running {
                state.validation.status = ValidationStatus::Idle;
            }
            info!(event = "run_cancelled", attempt = state.attempt);
            true
        })
    }

    /// Aborts any in-flight work without touching visible state and rejects
    /// later runs.
    pub fn shutdown(&self) {
        self.with_state(|state| {
            state.shut_down = true;
            state.attempt += 1;
            if let Some(token) = state.cancel.take() {
                token.cancel();
            }
        });
        debug!(event = "run_session_shutdown");
    }
}

async fn until_cancelled<T>(token: &CancellationToken, future: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        value = future => Some(value),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn artifact_error(artifact: &str, err: &RunServiceError) -> String {
    warn!(event = "run_artifact_failed", artifact, error = %err);
    format!("Unable to load run {artifact}: {err}")
}

fn save_failure_message(failures: &[SaveResult]) -> String {
    let files = failures
        .iter()
        .map(|result| result.id.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!("Save failed for {files}; the run was not started.")
}
