use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use wb_core::{
    FileMetadata, LoadedFile, SaveFileRequest, SaveFileResponse, ScopedStorage, ScopedStorageExt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    #[default]
    Loading,
    Ready,
    Error,
}

impl TabStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TabStatus::Loading => "loading",
            TabStatus::Ready => "ready",
            TabStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileTab {
    pub id: String,
    pub name: String,
    pub language: String,
    pub initial_content: String,
    pub content: String,
    pub status: TabStatus,
    pub error: Option<String>,
    pub etag: Option<String>,
    pub metadata: Option<FileMetadata>,
    pub pinned: bool,
    pub saving: bool,
    pub save_error: Option<String>,
    pub last_saved_at: Option<DateTime<Utc>>,
    generation: u64,
    fetching: bool,
}

impl FileTab {
    fn new(id: &str, generation: u64) -> Self {
        Self {
            id: id.to_string(),
            name: display_name(id),
            language: language_for(id).to_string(),
            initial_content: String::new(),
            content: String::new(),
            status: TabStatus::Loading,
            error: None,
            etag: None,
            metadata: None,
            pinned: false,
            saving: false,
            save_error: None,
            last_saved_at: None,
            generation,
            fetching: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.content != self.initial_content
    }

    /// Edits that a save would write: the tab is loaded and differs from disk.
    pub fn has_unsaved_changes(&self) -> bool {
        self.status == TabStatus::Ready && self.is_dirty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDirection {
    Forward,
    Backward,
}

/// Handed out for one fetch of a `Loading` tab. Results carrying a ticket whose
/// generation was superseded by a reload (or by close and reopen) are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub id: String,
    pub generation: u64,
}

/// Snapshot taken when a save begins. Completion marks exactly this content as
/// saved, so edits made while the request is in flight stay dirty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub id: String,
    pub content: String,
    pub etag: Option<String>,
    generation: u64,
}

impl SaveRequest {
    pub fn to_file_request(&self) -> SaveFileRequest {
        SaveFileRequest {
            path: self.id.clone(),
            content: self.content.clone(),
            etag: self.etag.clone(),
            create: self.etag.is_none(),
            parents: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TreeEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: Option<FileMetadata>,
}

impl TreeEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTab {
    pub id: String,
    #[serde(default)]
    pub pinned: bool,
}

/// The persisted shape of the open-tab set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TabSetSnapshot {
    #[serde(default)]
    pub open_tabs: Vec<PersistedTab>,
    #[serde(default)]
    pub active_tab_id: Option<String>,
    #[serde(default)]
    pub mru: Vec<String>,
}

/// Ordered set of open tabs: a pinned prefix followed by regular tabs, the
/// active id, and the recency list used for tab cycling.
#[derive(Default)]
pub struct TabManager {
    tabs: Vec<FileTab>,
    active_tab_id: Option<String>,
    mru: Vec<String>,
    next_generation: u64,
    storage: Option<Arc<dyn ScopedStorage>>,
    hydrated: bool,
    last_persisted: Option<TabSetSnapshot>,
}

impl TabManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage(storage: Arc<dyn ScopedStorage>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::default()
        }
    }

    pub fn tabs(&self) -> &[FileTab] {
        &self.tabs
    }

    pub fn tab(&self, id: &str) -> Option<&FileTab> {
        self.tabs.iter().find(|tab| tab.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn active_tab_id(&self) -> Option<&str> {
        self.active_tab_id.as_deref()
    }

    pub fn active_tab(&self) -> Option<&FileTab> {
        self.active_tab_id.as_deref().and_then(|id| self.tab(id))
    }

    pub fn mru(&self) -> &[String] {
        &self.mru
    }

    pub fn pinned_count(&self) -> usize {
        self.tabs.iter().take_while(|tab| tab.pinned).count()
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    pub fn is_dirty(&self) -> bool {
        self.tabs.iter().any(FileTab::has_unsaved_changes)
    }

    pub fn dirty_tab_ids(&self) -> Vec<String> {
        self.tabs
            .iter()
            .filter(|tab| tab.has_unsaved_changes())
            .map(|tab| tab.id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> TabSetSnapshot {
        TabSetSnapshot {
            open_tabs: self
                .tabs
                .iter()
                .map(|tab| PersistedTab {
                    id: tab.id.clone(),
                    pinned: tab.pinned,
                })
                .collect(),
            active_tab_id: self.active_tab_id.clone(),
            mru: self.mru.clone(),
        }
    }

    /// Restores the persisted tab set, then applies the caller's initial file.
    /// The default file is opened only when neither produced a tab. Returns the
    /// number of tabs restored from storage.
    pub fn hydrate(
        &mut self,
        initial_active_file_id: Option<&str>,
        default_file_id: Option<&str>,
    ) -> usize {
        let persisted = match self.storage.as_ref().map(|storage| storage.get::<TabSetSnapshot>()) {
            Some(Ok(snapshot)) => snapshot,
            Some(Err(err)) => {
                warn!(event = "tabs_hydrate_failed", error = %err);
                None
            }
            None => None,
        };
        self.last_persisted = persisted.clone();
        let restored = persisted.map(|snapshot| self.restore(snapshot)).unwrap_or(0);

        if let Some(initial) = initial_active_file_id.filter(|id| !id.trim().is_empty()) {
            self.open_tab_entry(initial);
            self.activate(initial);
        }
        if self.tabs.is_empty() {
            if let Some(default) = default_file_id.filter(|id| !id.trim().is_empty()) {
                self.open_tab_entry(default);
                self.activate(default);
            }
        }
        if self.active_tab_id.is_none() {
            self.active_tab_id = self
                .mru
                .first()
                .cloned()
                .or_else(|| self.tabs.last().map(|tab| tab.id.clone()));
        }

        self.hydrated = true;
        debug!(
            event = "tabs_hydrated",
            restored,
            open = self.tabs.len(),
            active = self.active_tab_id.as_deref().unwrap_or("")
        );
        self.persist();
        restored
    }

    fn restore(&mut self, snapshot: TabSetSnapshot) -> usize {
        let mut restored = 0;
        let mut seen = HashSet::new();
        for persisted in snapshot.open_tabs {
            let id = persisted.id.trim();
            if id.is_empty() || !seen.insert(id.to_string()) || self.contains(id) {
                continue;
            }
            let mut tab = self.new_tab(id);
            tab.pinned = persisted.pinned;
            self.tabs.push(tab);
            restored += 1;
        }
        self.tabs.sort_by_key(|tab| !tab.pinned);

        let mut seen = HashSet::new();
        for id in snapshot.mru {
            if self.contains(&id) && !self.mru.contains(&id) && seen.insert(id.clone()) {
                self.mru.push(id);
            }
        }
        if let Some(active) = snapshot.active_tab_id.filter(|id| self.contains(id)) {
            self.active_tab_id = Some(active);
        }
        restored
    }

    /// Opens `id` (appending a `Loading` tab when absent) and activates it.
    /// Returns true when a new tab was created.
    pub fn open_file(&mut self, id: &str) -> bool {
        if id.trim().is_empty() {
            return false;
        }
        let created = self.open_tab_entry(id);
        self.activate(id);
        self.persist();
        created
    }

    fn open_tab_entry(&mut self, id: &str) -> bool {
        if self.contains(id) {
            return false;
        }
        let tab = self.new_tab(id);
        self.tabs.push(tab);
        debug!(event = "tab_opened", id);
        true
    }

    pub fn select_tab(&mut self, id: &str) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.activate(id);
        self.persist();
        true
    }

    fn activate(&mut self, id: &str) {
        self.active_tab_id = Some(id.to_string());
        self.mru.retain(|entry| entry != id);
        self.mru.insert(0, id.to_string());
    }

    /// Moves activation one step through the recency list without reordering
    /// it. Ids that are no longer open are skipped.
    pub fn select_recent_tab(&mut self, direction: CycleDirection) -> Option<String> {
        let present = self
            .mru
            .iter()
            .filter(|id| self.contains(id))
            .cloned()
            .collect::<Vec<_>>();
        if present.is_empty() {
            return None;
        }
        let len = present.len();
        let current = self
            .active_tab_id
            .as_deref()
            .and_then(|active| present.iter().position(|id| id == active));
        let next = match (current, direction) {
            (Some(index), CycleDirection::Forward) => (index + 1) % len,
            (Some(index), CycleDirection::Backward) => (index + len - 1) % len,
            (None, CycleDirection::Forward) => 0,
            (None, CycleDirection::Backward) => len - 1,
        };
        let selected = present[next].clone();
        self.active_tab_id = Some(selected.clone());
        self.persist();
        Some(selected)
    }

    pub fn close_tab(&mut self, id: &str) -> bool {
        let removed = self.retain_tabs(|_, tab| tab.id != id);
        self.persist();
        removed > 0
    }

    /// Closes every tab except `id`; pinned tabs are kept.
    pub fn close_other_tabs(&mut self, id: &str) -> usize {
        if !self.contains(id) {
            return 0;
        }
        let removed = self.retain_tabs(|_, tab| tab.id == id || tab.pinned);
        self.persist();
        removed
    }

    /// Closes tabs after `id` in collection order; pinned tabs are kept.
    pub fn close_tabs_to_right(&mut self, id: &str) -> usize {
        let Some(anchor) = self.position(id) else {
            return 0;
        };
        let removed = self.retain_tabs(|index, tab| index <= anchor || tab.pinned);
        self.persist();
        removed
    }

    pub fn close_all_tabs(&mut self) -> usize {
        let removed = self.retain_tabs(|_, _| false);
        self.persist();
        removed
    }

    fn retain_tabs(&mut self, keep: impl Fn(usize, &FileTab) -> bool) -> usize {
        let before = self.tabs.len();
        let mut index = 0;
        self.tabs.retain(|tab| {
            let kept = keep(index, tab);
            index += 1;
            kept
        });
        let removed = before - self.tabs.len();
        if removed > 0 {
            self.after_shrink();
            debug!(event = "tabs_closed", removed, open = self.tabs.len());
        }
        removed
    }

    fn after_shrink(&mut self) {
        let tabs = &self.tabs;
        self.mru.retain(|id| tabs.iter().any(|tab| &tab.id == id));
        let active_present = self
            .active_tab_id
            .as_deref()
            .is_some_and(|active| tabs.iter().any(|tab| tab.id == active));
        if !active_present {
            self.active_tab_id = tabs.last().map(|tab| tab.id.clone());
        }
    }

    /// Reinserts `id` at `target_index` (an index into the collection without
    /// the moved tab). An index inside the pinned prefix pins the tab, one past
    /// it keeps the tab's current partition, and anything later unpins it.
    pub fn move_tab(&mut self, id: &str, target_index: usize) -> bool {
        let Some(from) = self.position(id) else {
            return false;
        };
        let mut tab = self.tabs.remove(from);
        let pinned_count = self.pinned_count();
        let target = target_index.min(self.tabs.len());
        tab.pinned = target < pinned_count || (target == pinned_count && tab.pinned);
        self.tabs.insert(target, tab);
        self.persist();
        true
    }

    pub fn pin_tab(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(index) if !self.tabs[index].pinned => {
                let mut tab = self.tabs.remove(index);
                tab.pinned = true;
                let at = self.pinned_count();
                self.tabs.insert(at, tab);
                self.persist();
                true
            }
            _ => false,
        }
    }

    pub fn unpin_tab(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(index) if self.tabs[index].pinned => {
                let mut tab = self.tabs.remove(index);
                tab.pinned = false;
                let at = self.pinned_count();
                self.tabs.insert(at, tab);
                self.persist();
                true
            }
            _ => false,
        }
    }

    /// Prunes tabs whose file left the tree and refreshes display metadata of
    /// the survivors. Returns the ids that were closed.
    pub fn reconcile_tree(&mut self, entries: &[TreeEntry]) -> Vec<String> {
        let removed = self
            .tabs
            .iter()
            .filter(|tab| !entries.iter().any(|entry| entry.id == tab.id))
            .map(|tab| tab.id.clone())
            .collect::<Vec<_>>();
        self.retain_tabs(|_, tab| entries.iter().any(|entry| entry.id == tab.id));

        for tab in &mut self.tabs {
            let Some(entry) = entries.iter().find(|entry| entry.id == tab.id) else {
                continue;
            };
            if let Some(name) = entry.name.as_deref().filter(|name| !name.is_empty()) {
                tab.name = name.to_string();
            }
            tab.language = language_for(&tab.id).to_string();
            if entry.metadata.is_some() {
                tab.metadata = entry.metadata.clone();
            }
        }
        self.persist();
        removed
    }

    /// Sets the live buffer. Tabs that are still loading reject edits because
    /// the pending load would overwrite them.
    pub fn update_content(&mut self, id: &str, text: impl Into<String>) -> bool {
        match self.tab_mut(id) {
            Some(tab) if tab.status != TabStatus::Loading => {
                tab.content = text.into();
                tab.save_error = None;
                true
            }
            _ => false,
        }
    }

    /// Replaces both buffers from an external source. The tab ends `Ready` and
    /// clean; any in-flight load or save for it becomes stale.
    pub fn replace_tab_content(
        &mut self,
        id: &str,
        content: impl Into<String>,
        etag: Option<String>,
    ) -> bool {
        let generation = self.bump_generation();
        let Some(tab) = self.tab_mut(id) else {
            return false;
        };
        let content = content.into();
        tab.initial_content = content.clone();
        tab.content = content;
        tab.etag = etag;
        tab.status = TabStatus::Ready;
        tab.error = None;
        tab.save_error = None;
        tab.saving = false;
        tab.fetching = false;
        tab.generation = generation;
        true
    }

    pub fn begin_loading(&mut self, id: &str) -> Option<LoadTicket> {
        let tab = self.tab_mut(id)?;
        if tab.status != TabStatus::Loading || tab.fetching {
            return None;
        }
        tab.fetching = true;
        Some(LoadTicket {
            id: tab.id.clone(),
            generation: tab.generation,
        })
    }

    pub fn begin_pending_loads(&mut self) -> Vec<LoadTicket> {
        let pending = self
            .tabs
            .iter()
            .filter(|tab| tab.status == TabStatus::Loading && !tab.fetching)
            .map(|tab| tab.id.clone())
            .collect::<Vec<_>>();
        pending
            .iter()
            .filter_map(|id| self.begin_loading(id))
            .collect()
    }

    pub fn complete_loading(&mut self, ticket: &LoadTicket, payload: LoadedFile) -> bool {
        let Some(tab) = self.current_load_target(ticket) else {
            return false;
        };
        tab.initial_content = payload.content.clone();
        tab.content = payload.content;
        tab.etag = payload.etag;
        tab.status = TabStatus::Ready;
        tab.error = None;
        tab.fetching = false;
        debug!(event = "tab_loaded", id = %ticket.id, generation = ticket.generation);
        true
    }

    pub fn fail_loading(&mut self, ticket: &LoadTicket, message: impl Into<String>) -> bool {
        let Some(tab) = self.current_load_target(ticket) else {
            return false;
        };
        let message = message.into();
        debug!(event = "tab_load_failed", id = %ticket.id, error = %message);
        tab.status = TabStatus::Error;
        tab.error = Some(message);
        tab.fetching = false;
        true
    }

    fn current_load_target(&mut self, ticket: &LoadTicket) -> Option<&mut FileTab> {
        let target = self.tabs.iter_mut().find(|tab| {
            tab.id == ticket.id
                && tab.generation == ticket.generation
                && tab.status == TabStatus::Loading
        });
        if target.is_none() {
            warn!(
                event = "tab_load_discarded",
                id = %ticket.id,
                generation = ticket.generation
            );
        }
        target
    }

    /// Forces a `Ready` or `Error` tab back to `Loading`.
    pub fn reload_tab(&mut self, id: &str) -> bool {
        let generation = self.bump_generation();
        let Some(tab) = self.tab_mut(id) else {
            return false;
        };
        if tab.status == TabStatus::Loading {
            return false;
        }
        tab.status = TabStatus::Loading;
        tab.error = None;
        tab.saving = false;
        tab.fetching = false;
        tab.generation = generation;
        debug!(event = "tab_reload", id, generation);
        true
    }

    /// Starts a save of a ready, dirty, idle tab; `None` means nothing to save.
    pub fn begin_saving_tab(&mut self, id: &str) -> Option<SaveRequest> {
        let tab = self.tab_mut(id)?;
        if tab.status != TabStatus::Ready || tab.saving || !tab.is_dirty() {
            return None;
        }
        tab.saving = true;
        tab.save_error = None;
        Some(SaveRequest {
            id: tab.id.clone(),
            content: tab.content.clone(),
            etag: tab.etag.clone(),
            generation: tab.generation,
        })
    }

    pub fn complete_saving_tab(
        &mut self,
        request: &SaveRequest,
        response: &SaveFileResponse,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(tab) = self.current_save_target(request) else {
            return false;
        };
        tab.initial_content = request.content.clone();
        tab.etag = Some(response.etag.clone());
        tab.metadata = Some(FileMetadata::from(response));
        tab.last_saved_at = Some(now);
        tab.saving = false;
        tab.save_error = None;
        debug!(event = "tab_saved", id = %request.id, etag = %response.etag);
        true
    }

    pub fn fail_saving_tab(&mut self, request: &SaveRequest, message: impl Into<String>) -> bool {
        let Some(tab) = self.current_save_target(request) else {
            return false;
        };
        let message = message.into();
        debug!(event = "tab_save_failed", id = %request.id, error = %message);
        tab.saving = false;
        tab.save_error = Some(message);
        true
    }

    fn current_save_target(&mut self, request: &SaveRequest) -> Option<&mut FileTab> {
        let target = self.tabs.iter_mut().find(|tab| {
            tab.id == request.id && tab.generation == request.generation && tab.saving
        });
        if target.is_none() {
            warn!(event = "tab_save_discarded", id = %request.id);
        }
        target
    }

    /// Records a save conflict on a tab after its forced reload settled.
    pub fn set_save_error(&mut self, id: &str, message: impl Into<String>) -> bool {
        match self.tab_mut(id) {
            Some(tab) => {
                tab.save_error = Some(message.into());
                true
            }
            None => false,
        }
    }

    fn new_tab(&mut self, id: &str) -> FileTab {
        let generation = self.bump_generation();
        FileTab::new(id, generation)
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.tabs.iter().position(|tab| tab.id == id)
    }

    fn tab_mut(&mut self, id: &str) -> Option<&mut FileTab> {
        self.tabs.iter_mut().find(|tab| tab.id == id)
    }

    fn persist(&mut self) {
        if !self.hydrated {
            return;
        }
        let Some(storage) = self.storage.as_ref() else {
            return;
        };
        let snapshot = self.snapshot();
        if self.last_persisted.as_ref() == Some(&snapshot) {
            return;
        }
        match storage.set(&snapshot) {
            Ok(()) => self.last_persisted = Some(snapshot),
            Err(err) => warn!(event = "tabs_persist_failed", scope = storage.scope(), error = %err),
        }
    }
}

fn display_name(id: &str) -> String {
    id.rsplit('/')
        .find(|part| !part.is_empty())
        .unwrap_or(id)
        .to_string()
}

/// Editor language hint derived from the file extension.
pub fn language_for(id: &str) -> &'static str {
    let extension = Path::new(id)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "py" => "python",
        "toml" => "toml",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "sql" => "sql",
        "md" | "markdown" => "markdown",
        "sh" | "bash" => "shell",
        "js" | "mjs" => "javascript",
        "ts" => "typescript",
        "csv" => "csv",
        _ => "plaintext",
    }
}
