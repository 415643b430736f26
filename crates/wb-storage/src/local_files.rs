use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;
use wb_core::{FileService, FileServiceError, LoadedFile, SaveFileRequest, SaveFileResponse};

const LOCK_FILE: &str = ".wb-write.lock";

/// Directory-backed file store. Etags are content hashes, so two writers that
/// read the same bytes hold the same version token and the second conditional
/// write after a change fails with `PreconditionFailed`.
#[derive(Debug, Clone)]
pub struct LocalFileService {
    root: PathBuf,
}

impl LocalFileService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn etag_for(content: &str) -> String {
        let digest = Sha256::digest(content.as_bytes());
        let hex = digest
            .iter()
            .take(16)
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>();
        format!("sha256-{hex}")
    }

    /// Maps a file id onto a path under the root, rejecting ids that would
    /// escape it.
    pub fn resolve(&self, id: &str) -> Result<PathBuf, FileServiceError> {
        let relative = Path::new(id.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(FileServiceError::Transport(format!("invalid file id: {id}"))),
            }
        }
        if resolved == self.root {
            return Err(FileServiceError::Transport(format!("invalid file id: {id}")));
        }
        Ok(resolved)
    }

    /// Relative ids of every regular file under the root, skipping dot entries.
    pub fn list_files(&self) -> Result<Vec<String>, FileServiceError> {
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| !entry.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            let entry = entry.map_err(|err| FileServiceError::Transport(err.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(&self.root) {
                let id = relative
                    .components()
                    .map(|part| part.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push(id);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl FileService for LocalFileService {
    async fn load_file(&self, id: &str) -> Result<LoadedFile, FileServiceError> {
        let path = self.resolve(id)?;
        let id = id.to_string();
        tokio::task::spawn_blocking(move || load_sync(&id, &path))
            .await
            .map_err(|err| FileServiceError::Transport(err.to_string()))?
    }

    async fn save_file(
        &self,
        request: SaveFileRequest,
    ) -> Result<SaveFileResponse, FileServiceError> {
        let path = self.resolve(&request.path)?;
        let lock_path = self.root.join(LOCK_FILE);
        tokio::task::spawn_blocking(move || save_sync(&lock_path, &path, &request))
            .await
            .map_err(|err| FileServiceError::Transport(err.to_string()))?
    }
}

struct WriteLock {
    file: File,
}

impl WriteLock {
    fn acquire(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn io_error(id: &str, err: io::Error) -> FileServiceError {
    if err.kind() == io::ErrorKind::NotFound {
        FileServiceError::NotFound(id.to_string())
    } else {
        FileServiceError::Transport(format!("{id}: {err}"))
    }
}

fn load_sync(id: &str, path: &Path) -> Result<LoadedFile, FileServiceError> {
    let content = fs::read_to_string(path).map_err(|err| io_error(id, err))?;
    let etag = LocalFileService::etag_for(&content);
    Ok(LoadedFile {
        content,
        etag: Some(etag),
    })
}

fn save_sync(
    lock_path: &Path,
    path: &Path,
    request: &SaveFileRequest,
) -> Result<SaveFileResponse, FileServiceError> {
    let id = request.path.as_str();
    let _lock = WriteLock::acquire(lock_path).map_err(|err| io_error(id, err))?;

    let current = match fs::read_to_string(path) {
        Ok(content) => Some(LocalFileService::etag_for(&content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => return Err(io_error(id, err)),
    };

    match (current.as_deref(), request.etag.as_deref()) {
        (Some(current), Some(expected)) if current != expected => {
            return Err(FileServiceError::PreconditionFailed {
                path: id.to_string(),
            });
        }
        (Some(_), None) if request.create => {
            return Err(FileServiceError::PreconditionFailed {
                path: id.to_string(),
            });
        }
        (Some(_), None) => {
            return Err(FileServiceError::PreconditionRequired {
                path: id.to_string(),
            });
        }
        (None, Some(_)) => {
            return Err(FileServiceError::PreconditionFailed {
                path: id.to_string(),
            });
        }
        (None, None) if !request.create => {
            return Err(FileServiceError::NotFound(id.to_string()));
        }
        _ => {}
    }

    if let Some(parent) = path.parent() {
        if !parent.exists() {
            if !request.parents {
                return Err(FileServiceError::NotFound(id.to_string()));
            }
            fs::create_dir_all(parent).map_err(|err| io_error(id, err))?;
        }
    }

    write_atomic(path, &request.content).map_err(|err| io_error(id, err))?;
    let metadata = fs::metadata(path).map_err(|err| io_error(id, err))?;
    let modified_at = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let etag = LocalFileService::etag_for(&request.content);
    debug!(event = "local_file_saved", path = id, etag = %etag, size = metadata.len());

    Ok(SaveFileResponse {
        etag,
        size: metadata.len(),
        modified_at,
        content_type: Some(content_type_for(id).to_string()),
    })
}

fn write_atomic(path: &Path, payload: &str) -> io::Result<()> {
    let temp_path = match path.file_name() {
        Some(name) => path.with_file_name(format!(".{}.tmp", name.to_string_lossy())),
        None => path.with_extension("tmp"),
    };
    fs::write(&temp_path, payload)?;
    fs::rename(&temp_path, path)
}

pub fn content_type_for(id: &str) -> &'static str {
    let extension = Path::new(id)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "json" => "application/json",
        "toml" => "application/toml",
        "yaml" | "yml" => "application/yaml",
        "py" => "text/x-python",
        "sql" => "application/sql",
        "md" => "text/markdown",
        _ => "text/plain",
    }
}
