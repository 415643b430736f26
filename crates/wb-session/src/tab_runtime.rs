use crate::tabs::{LoadTicket, SaveRequest, TabManager};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use wb_core::{FileService, FileServiceError};

pub const CONFLICT_MESSAGE: &str =
    "File changed on the server. The latest version was reloaded; reapply your edits and save again.";
pub const MISSING_VERSION_MESSAGE: &str =
    "The latest version of this file is unknown. Refresh the file listing and try again.";
pub const SAVE_INTERRUPTED_MESSAGE: &str =
    "The save was interrupted before the server answered. Save again.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { etag: String },
    /// Nothing to write: the tab is clean, not ready, already saving, or gone.
    Skipped,
    Conflict { message: String },
    MissingVersion { message: String },
    Failed { message: String },
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SaveOutcome::Conflict { .. }
                | SaveOutcome::MissingVersion { .. }
                | SaveOutcome::Failed { .. }
        )
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            SaveOutcome::Conflict { message }
            | SaveOutcome::MissingVersion { message }
            | SaveOutcome::Failed { message } => Some(message),
            SaveOutcome::Saved { .. } | SaveOutcome::Skipped => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveResult {
    pub id: String,
    pub outcome: SaveOutcome,
}

impl SaveResult {
    fn new(id: &str, outcome: SaveOutcome) -> Self {
        Self {
            id: id.to_string(),
            outcome,
        }
    }
}

/// Flushes unsaved editor state before a run reads the package from the server.
#[async_trait]
pub trait SaveBarrier: Send + Sync {
    async fn flush_dirty(&self) -> Vec<SaveResult>;
}

/// Releases a tab's `saving` flag when a save future is dropped before the
/// file service answered.
struct InFlightSave<'a> {
    runtime: &'a TabRuntime,
    request: &'a SaveRequest,
    armed: bool,
}

impl InFlightSave<'_> {
    fn settled(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightSave<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(event = "tab_save_interrupted", id = %self.request.id);
            self.runtime
                .with_tabs(|tabs| tabs.fail_saving_tab(self.request, SAVE_INTERRUPTED_MESSAGE));
        }
    }
}

/// Drives a [`TabManager`] against a [`FileService`]. The manager lock is only
/// held for single transitions, never across a service call.
#[derive(Clone)]
pub struct TabRuntime {
    tabs: Arc<Mutex<TabManager>>,
    files: Arc<dyn FileService>,
}

impl TabRuntime {
    pub fn new(manager: TabManager, files: Arc<dyn FileService>) -> Self {
        Self {
            tabs: Arc::new(Mutex::new(manager)),
            files,
        }
    }

    pub fn with_tabs<R>(&self, f: impl FnOnce(&mut TabManager) -> R) -> R {
        let mut guard = self.tabs.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn is_dirty(&self) -> bool {
        self.with_tabs(|tabs| tabs.is_dirty())
    }

    /// Opens and activates `id`, then loads whatever is pending.
    pub async fn open_file(&self, id: &str) -> bool {
        let created = self.with_tabs(|tabs| tabs.open_file(id));
        self.load_pending().await;
        created
    }

    /// Fetches every `Loading` tab that has no request in flight. Returns the
    /// number of loads started.
    pub async fn load_pending(&self) -> usize {
        let tickets = self.with_tabs(|tabs| tabs.begin_pending_loads());
        let started = tickets.len();
        join_all(tickets.into_iter().map(|ticket| self.load(ticket))).await;
        started
    }

    async fn load(&self, ticket: LoadTicket) -> bool {
        let result = self.files.load_file(&ticket.id).await;
        self.with_tabs(|tabs| match result {
            Ok(payload) => tabs.complete_loading(&ticket, payload),
            Err(err) => tabs.fail_loading(&ticket, err.to_string()),
        })
    }

    pub async fn reload_tab(&self, id: &str) -> bool {
        let ticket = self.with_tabs(|tabs| {
            if tabs.reload_tab(id) {
                tabs.begin_loading(id)
            } else {
                None
            }
        });
        match ticket {
            Some(ticket) => self.load(ticket).await,
            None => false,
        }
    }

    pub async fn save_tab(&self, id: &str) -> SaveResult {
        let Some(request) = self.with_tabs(|tabs| tabs.begin_saving_tab(id)) else {
            debug!(event = "tab_save_skipped", id);
            return SaveResult::new(id, SaveOutcome::Skipped);
        };

        let mut in_flight = InFlightSave {
            runtime: self,
            request: &request,
            armed: true,
        };
        let result = self.files.save_file(request.to_file_request()).await;
        in_flight.settled();

        match result {
            Ok(response) => {
                self.with_tabs(|tabs| tabs.complete_saving_tab(&request, &response, Utc::now()));
                info!(event = "tab_save_ok", id, etag = %response.etag, size = response.size);
                SaveResult::new(
                    id,
                    SaveOutcome::Saved {
                        etag: response.etag,
                    },
                )
            }
            Err(err) if err.is_conflict() => {
                warn!(event = "tab_save_conflict", id, error = %err);
                self.with_tabs(|tabs| tabs.fail_saving_tab(&request, CONFLICT_MESSAGE));
                if !self.reload_tab(id).await {
                    warn!(event = "tab_conflict_reload_failed", id);
                }
                self.with_tabs(|tabs| tabs.set_save_error(id, CONFLICT_MESSAGE));
                SaveResult::new(
                    id,
                    SaveOutcome::Conflict {
                        message: CONFLICT_MESSAGE.to_string(),
                    },
                )
            }
            Err(FileServiceError::PreconditionRequired { .. }) => {
                warn!(event = "tab_save_missing_version", id);
                self.with_tabs(|tabs| tabs.fail_saving_tab(&request, MISSING_VERSION_MESSAGE));
                SaveResult::new(
                    id,
                    SaveOutcome::MissingVersion {
                        message: MISSING_VERSION_MESSAGE.to_string(),
                    },
                )
            }
            Err(err) => {
                let message = err.to_string();
                warn!(event = "tab_save_failed", id, error = %message);
                self.with_tabs(|tabs| tabs.fail_saving_tab(&request, message.clone()));
                SaveResult::new(id, SaveOutcome::Failed { message })
            }
        }
    }

    /// Saves `ids` strictly in order with one request in flight.
    pub async fn save_tabs_sequentially(&self, ids: &[String]) -> Vec<SaveResult> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.save_tab(id).await);
        }
        results
    }

    pub async fn flush_dirty_tabs(&self) -> Vec<SaveResult> {
        let dirty = self.with_tabs(|tabs| tabs.dirty_tab_ids());
        if !dirty.is_empty() {
            debug!(event = "tabs_flush", count = dirty.len());
        }
        self.save_tabs_sequentially(&dirty).await
    }
}

#[async_trait]
impl SaveBarrier for TabRuntime {
    async fn flush_dirty(&self) -> Vec<SaveResult> {
        self.flush_dirty_tabs().await
    }
}
