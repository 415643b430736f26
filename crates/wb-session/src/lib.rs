pub mod config;
pub mod console_buffer;
pub mod run_controller;
pub mod tab_runtime;
pub mod tabs;

pub use config::SessionConfig;
pub use console_buffer::ConsoleBuffer;
pub use run_controller::{
    Banner, BannerKind, LatestRun, RunOutcome, RunRejection, RunRequest, RunSessionController,
    RunSessionSnapshot, ValidationState, ValidationStatus,
};
pub use tab_runtime::{
    SaveBarrier, SaveOutcome, SaveResult, TabRuntime, CONFLICT_MESSAGE, MISSING_VERSION_MESSAGE,
    SAVE_INTERRUPTED_MESSAGE,
};
pub use tabs::{
    language_for, CycleDirection, FileTab, LoadTicket, PersistedTab, SaveRequest, TabManager,
    TabSetSnapshot, TabStatus, TreeEntry,
};

use std::sync::Arc;
use wb_core::{FileService, RunService, ScopedStorage};

/// One open workbench: the tab runtime and the run controller, wired so a run
/// flushes dirty tabs before it starts.
pub struct Workbench {
    config: SessionConfig,
    tabs: TabRuntime,
    runs: RunSessionController,
}

impl Workbench {
    pub fn new(
        config: SessionConfig,
        files: Arc<dyn FileService>,
        runs: Arc<dyn RunService>,
        storage: Option<Arc<dyn ScopedStorage>>,
    ) -> Self {
        let manager = match storage.filter(|_| config.persist_tabs) {
            Some(storage) => TabManager::with_storage(storage),
            None => TabManager::new(),
        };
        let tabs = TabRuntime::new(manager, files);
        let runs = RunSessionController::new(&config, runs, Arc::new(tabs.clone()));
        Self { config, tabs, runs }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tabs(&self) -> &TabRuntime {
        &self.tabs
    }

    pub fn runs(&self) -> &RunSessionController {
        &self.runs
    }

    /// Restores persisted tabs, applies the initial file, and loads whatever
    /// ended up pending.
    pub async fn hydrate(&self, initial_active_file_id: Option<&str>) -> usize {
        let default_file = self.config.default_file.as_deref();
        let restored = self
            .tabs
            .with_tabs(|tabs| tabs.hydrate(initial_active_file_id, default_file));
        self.tabs.load_pending().await;
        restored
    }

    /// Starts a run with the configured default options.
    pub async fn start_run(&self, config_id: &str, prepare: impl FnOnce() -> bool) -> RunOutcome {
        let request = RunRequest::new(config_id, self.config.run_options.clone());
        self.runs.start_run(request, prepare).await
    }

    pub fn shutdown(&self) {
        self.runs.shutdown();
    }
}
