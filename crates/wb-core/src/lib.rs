pub mod console;
pub mod files;
pub mod run_events;
pub mod runs;
pub mod scoped;

pub use console::{format_timestamp, translate, ConsoleLevel, ConsoleLine, ConsoleOrigin};
pub use files::{
    FileMetadata, FileService, FileServiceError, LoadedFile, SaveFileRequest, SaveFileResponse,
};
pub use run_events::{RunEvent, RunEventDecoder, RunEventEnvelope};
pub use runs::{
    RunEventStream, RunMode, RunOptions, RunOutput, RunService, RunServiceError, RunStatus,
};
pub use scoped::{ScopedStorage, ScopedStorageExt, StorageError};
