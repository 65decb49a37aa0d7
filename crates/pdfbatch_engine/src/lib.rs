//! Pdfbatch engine: PDF fetching, batch runs, progress tracking and sessions.
mod archive;
mod artifacts;
mod batch;
mod feed;
mod fetch;
mod filename;
mod janitor;
mod orchestrator;
mod persist;
mod progress_store;
mod supervisor;
mod types;

pub use archive::{merge_zips, write_zip, zip_entry_names, ArchiveEntry, ArchiveError};
pub use artifacts::{Artifact, ArtifactRegistry};
pub use batch::{
    BatchDownloadEngine, EngineSettings, NoopProgressSink, ProgressSink, RunError, RunEvent,
    RunSummary,
};
pub use feed::{progress_feed, FeedEvent};
pub use fetch::{FetchSettings, PdfFetcher, ReqwestPdfFetcher};
pub use filename::pdf_filename;
pub use janitor::cleanup_old_temp_files;
pub use orchestrator::{
    CleanupReport, MergeSummary, OrchestratorConfig, SessionError, SessionOrchestrator,
    SESSION_DESCRIPTOR,
};
pub use persist::{ensure_output_dir, read_json, AtomicFileWriter, PersistError};
pub use progress_store::{
    system_clock, Clock, ProgressStore, StoreProgressSink, INTERRUPTED_MESSAGE,
};
pub use supervisor::{TaskFailure, TaskSupervisor, MAX_RECENT_FAILURES};
pub use types::{FailureKind, FetchError, FetchOutcome, SavedPdf};
