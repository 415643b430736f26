use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use wb_core::run_events::{RunCompletedPayload, RunStartedPayload};
use wb_core::{
    FileService, FileServiceError, LoadedFile, RunEvent, RunEventEnvelope, RunEventStream,
    RunMode, RunOptions, RunOutput, RunService, RunServiceError, RunStatus, SaveFileRequest,
    SaveFileResponse,
};
use wb_session::{
    RunOutcome, SaveOutcome, SessionConfig, TabStatus, Workbench, CONFLICT_MESSAGE,
};
use wb_storage::{LocalFileService, MemoryScopedStore};

/// Replays one extraction: started, then completed with `run-7`.
#[derive(Default)]
struct ReplayRuns {
    opened_with: Mutex<Vec<String>>,
}

#[async_trait]
impl RunService for ReplayRuns {
    async fn stream_run(
        &self,
        config_id: &str,
        _options: &RunOptions,
        _cancel: CancellationToken,
    ) -> Result<RunEventStream, RunServiceError> {
        self.opened_with
            .lock()
            .expect("lock")
            .push(config_id.to_string());
        let events = vec![
            Ok(RunEventEnvelope::new(
                "2026-03-01T09:00:00Z",
                RunEvent::Started(RunStartedPayload {
                    run_id: Some("run-7".to_string()),
                    stream: None,
                }),
            )),
            Ok(RunEventEnvelope::new(
                "2026-03-01T09:00:05Z",
                RunEvent::Completed(RunCompletedPayload {
                    run_id: Some("run-7".to_string()),
                    status: "succeeded".to_string(),
                    ..RunCompletedPayload::default()
                }),
            )),
        ];
        Ok(stream::iter(events).boxed())
    }

    async fn fetch_run_outputs(&self, _run_id: &str) -> Result<Vec<RunOutput>, RunServiceError> {
        Ok(vec![RunOutput {
            name: "normalized.xlsx".to_string(),
            path: Some("outputs/normalized.xlsx".to_string()),
            size_bytes: Some(2048),
            content_type: None,
        }])
    }

    async fn fetch_run_summary(&self, _run_id: &str) -> Result<Value, RunServiceError> {
        Ok(json!({"tables": 3, "rows": 120}))
    }

    async fn fetch_run_telemetry(&self, _run_id: &str) -> Result<Value, RunServiceError> {
        Err(RunServiceError::NotFound("telemetry for run-7".to_string()))
    }
}

/// Holds the first save until released so a run can be cancelled mid-flush.
struct GatedFiles {
    inner: Arc<LocalFileService>,
    hold_next_save: AtomicBool,
    save_started: Notify,
    release: Notify,
}

impl GatedFiles {
    fn new(inner: Arc<LocalFileService>) -> Self {
        Self {
            inner,
            hold_next_save: AtomicBool::new(true),
            save_started: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl FileService for GatedFiles {
    async fn load_file(&self, id: &str) -> Result<LoadedFile, FileServiceError> {
        self.inner.load_file(id).await
    }

    async fn save_file(
        &self,
        request: SaveFileRequest,
    ) -> Result<SaveFileResponse, FileServiceError> {
        if self.hold_next_save.swap(false, Ordering::SeqCst) {
            self.save_started.notify_one();
            self.release.notified().await;
        }
        self.inner.save_file(request).await
    }
}

struct Fixture {
    _dir: TempDir,
    files: Arc<LocalFileService>,
    runs: Arc<ReplayRuns>,
    store: MemoryScopedStore,
}

impl Fixture {
    async fn new(seed: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let files = Arc::new(LocalFileService::new(dir.path()));
        for (path, content) in seed {
            files
                .save_file(SaveFileRequest {
                    path: path.to_string(),
                    content: content.to_string(),
                    etag: None,
                    create: true,
                    parents: true,
                })
                .await
                .expect("seed file");
        }
        Self {
            _dir: dir,
            files,
            runs: Arc::new(ReplayRuns::default()),
            store: MemoryScopedStore::new(),
        }
    }

    fn workbench(&self, config: SessionConfig) -> Workbench {
        Workbench::new(
            config,
            self.files.clone(),
            self.runs.clone(),
            Some(Arc::new(self.store.scope("workbench:cfg-1:tabs"))),
        )
    }
}

#[tokio::test]
async fn save_advances_etag_then_second_save_is_noop() {
    let fixture = Fixture::new(&[("pkg/columns.py", "v1")]).await;
    let workbench = fixture.workbench(SessionConfig::default());
    workbench.tabs().open_file("pkg/columns.py").await;

    let v1_etag = LocalFileService::etag_for("v1");
    let v2_etag = LocalFileService::etag_for("v2");
    workbench.tabs().with_tabs(|tabs| {
        let tab = tabs.tab("pkg/columns.py").expect("tab");
        assert_eq!(tab.etag.as_deref(), Some(v1_etag.as_str()));
        tabs.update_content("pkg/columns.py", "v2");
    });

    let first = workbench.tabs().save_tab("pkg/columns.py").await;
    assert_eq!(first.outcome, SaveOutcome::Saved { etag: v2_etag.clone() });
    workbench.tabs().with_tabs(|tabs| {
        let tab = tabs.tab("pkg/columns.py").expect("tab");
        assert_eq!(tab.etag.as_deref(), Some(v2_etag.as_str()));
        assert!(!tab.is_dirty());
        assert!(tab.last_saved_at.is_some());
    });

    let second = workbench.tabs().save_tab("pkg/columns.py").await;
    assert_eq!(second.outcome, SaveOutcome::Skipped);
}

#[tokio::test]
async fn stale_etag_conflict_reloads_server_version() {
    let fixture = Fixture::new(&[("pkg/columns.py", "v1")]).await;
    let workbench = fixture.workbench(SessionConfig::default());
    workbench.tabs().open_file("pkg/columns.py").await;

    fixture
        .files
        .save_file(SaveFileRequest {
            path: "pkg/columns.py".to_string(),
            content: "v2".to_string(),
            etag: Some(LocalFileService::etag_for("v1")),
            create: false,
            parents: false,
        })
        .await
        .expect("external writer");

    workbench
        .tabs()
        .with_tabs(|tabs| tabs.update_content("pkg/columns.py", "local edit"));
    let result = workbench.tabs().save_tab("pkg/columns.py").await;
    assert!(matches!(result.outcome, SaveOutcome::Conflict { .. }));

    workbench.tabs().with_tabs(|tabs| {
        let tab = tabs.tab("pkg/columns.py").expect("tab");
        assert_eq!(tab.status, TabStatus::Ready);
        assert_eq!(tab.content, "v2");
        assert_eq!(tab.initial_content, "v2");
        assert_eq!(tab.etag, Some(LocalFileService::etag_for("v2")));
        assert_eq!(tab.save_error.as_deref(), Some(CONFLICT_MESSAGE));
    });
}

#[tokio::test]
async fn extraction_flushes_tabs_and_keeps_artifacts_when_telemetry_fails() {
    let fixture = Fixture::new(&[("pkg/columns.py", "v1")]).await;
    let config = SessionConfig {
        run_options: RunOptions::for_mode(RunMode::Extraction),
        ..SessionConfig::default()
    };
    let workbench = fixture.workbench(config);
    workbench.tabs().open_file("pkg/columns.py").await;
    workbench
        .tabs()
        .with_tabs(|tabs| tabs.update_content("pkg/columns.py", "v2"));
    workbench.runs().set_tree_ready(true);

    let outcome = workbench.start_run("cfg-1", || true).await;
    assert_eq!(
        outcome,
        RunOutcome::Finished {
            run_id: Some("run-7".to_string()),
            status: RunStatus::Succeeded
        }
    );
    assert!(!workbench.tabs().is_dirty(), "dirty tab saved before the run");
    assert_eq!(
        fixture.runs.opened_with.lock().expect("lock").as_slice(),
        ["cfg-1".to_string()]
    );

    let latest = workbench.runs().latest_run().expect("latest run");
    assert_eq!(latest.run_id, "run-7");
    assert!(latest.outputs_loaded);
    assert_eq!(latest.outputs.len(), 1);
    assert!(latest.summary_loaded);
    assert_eq!(latest.summary, Some(json!({"tables": 3, "rows": 120})));
    assert!(!latest.telemetry_loaded);
    assert!(latest.telemetry_error.is_some());
    assert_eq!(latest.duration_ms, Some(5000));

    let console = workbench.runs().console();
    assert_eq!(console.len(), 2);
    assert_eq!(console[1].timestamp, "09:00:05");
}

#[tokio::test]
async fn open_tabs_survive_a_new_session() {
    let fixture = Fixture::new(&[("a.py", "a"), ("b.toml", "b = 1"), ("c.md", "# c")]).await;
    {
        let workbench = fixture.workbench(SessionConfig::default());
        workbench.hydrate(None).await;
        workbench.tabs().open_file("a.py").await;
        workbench.tabs().open_file("b.toml").await;
        workbench.tabs().open_file("c.md").await;
        workbench.tabs().with_tabs(|tabs| {
            tabs.pin_tab("c.md");
            tabs.select_tab("b.toml");
        });
    }

    let workbench = fixture.workbench(SessionConfig {
        default_file: Some("a.py".to_string()),
        ..SessionConfig::default()
    });
    assert_eq!(workbench.hydrate(None).await, 3);
    workbench.tabs().with_tabs(|tabs| {
        let ids = tabs
            .tabs()
            .iter()
            .map(|tab| tab.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, ["c.md", "a.py", "b.toml"]);
        assert_eq!(tabs.active_tab_id(), Some("b.toml"));
        assert!(tabs.tabs().iter().all(|tab| tab.status == TabStatus::Ready));
        assert_eq!(tabs.tab("b.toml").expect("tab").language, "toml");
    });
}

#[tokio::test]
async fn cancel_during_save_flush_leaves_no_tab_stuck() {
    let fixture = Fixture::new(&[("pkg/columns.py", "v1")]).await;
    let files = Arc::new(GatedFiles::new(fixture.files.clone()));
    let workbench = Workbench::new(
        SessionConfig::default(),
        files.clone(),
        fixture.runs.clone(),
        None,
    );
    workbench.tabs().open_file("pkg/columns.py").await;
    workbench
        .tabs()
        .with_tabs(|tabs| tabs.update_content("pkg/columns.py", "v2"));
    workbench.runs().set_tree_ready(true);

    let run = workbench.start_run("cfg-1", || true);
    let cancel = async {
        files.save_started.notified().await;
        assert!(workbench.runs().cancel_run());
        files.release.notify_one();
    };
    let (outcome, ()) = tokio::join!(run, cancel);

    assert_eq!(outcome, RunOutcome::Cancelled);
    assert_eq!(workbench.runs().run_status(), RunStatus::Cancelled);
    assert!(fixture.runs.opened_with.lock().expect("lock").is_empty());
    workbench.tabs().with_tabs(|tabs| {
        let tab = tabs.tab("pkg/columns.py").expect("tab");
        assert!(!tab.saving);
        assert!(!tab.is_dirty(), "the in-flight save still lands");
        assert_eq!(tab.etag, Some(LocalFileService::etag_for("v2")));
    });

    let outcome = workbench.start_run("cfg-1", || true).await;
    assert!(matches!(
        outcome,
        RunOutcome::Finished {
            status: RunStatus::Succeeded,
            ..
        }
    ));
    let on_disk = fixture
        .files
        .load_file("pkg/columns.py")
        .await
        .expect("load");
    assert_eq!(on_disk.content, "v2");
}
