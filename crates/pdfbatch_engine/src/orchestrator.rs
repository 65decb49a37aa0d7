use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use engine_logging::{engine_error, engine_info, engine_warn};
use pdfbatch_core::{
    session_folder_name, BatchState, FailedUrl, ProgressStatus, ProgressUpdate, SessionDescriptor,
    SessionSummary,
};
use thiserror::Error;
use uuid::Uuid;

use crate::archive::{merge_zips, ArchiveError};
use crate::artifacts::{Artifact, ArtifactRegistry};
use crate::batch::{short_id, BatchDownloadEngine, ProgressSink, RunError, RunEvent, RunSummary};
use crate::janitor::cleanup_old_temp_files;
use crate::persist::{ensure_output_dir, read_json, AtomicFileWriter, PersistError};
use crate::progress_store::{ProgressStore, StoreProgressSink};
use crate::supervisor::TaskSupervisor;

/// Descriptor file inside every session folder.
pub const SESSION_DESCRIPTOR: &str = "session.json";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no urls provided")]
    EmptyUrlList,
    #[error("invalid session: {0}")]
    InvalidSession(String),
    #[error("invalid batch {batch_number} for session {session_id}")]
    InvalidBatch {
        session_id: String,
        batch_number: usize,
    },
    #[error("batch {batch_number} of session {session_id} is already completed")]
    BatchCompleted {
        session_id: String,
        batch_number: usize,
    },
    #[error("session {0} already has a download in progress")]
    SessionBusy(String),
    #[error("unknown download id: {0}")]
    UnknownArtifact(String),
    #[error("no download ids to merge")]
    NothingToMerge,
    #[error("persist error: {0}")]
    Persist(#[from] PersistError),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("background task failed: {0}")]
    Task(String),
}

impl SessionError {
    /// Errors caused by the request rather than the server.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            SessionError::Persist(_) | SessionError::Archive(_) | SessionError::Task(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root for scratch folders, archives and session folders.
    pub temp_root: PathBuf,
    pub default_batch_size: usize,
}

impl OrchestratorConfig {
    pub fn new(temp_root: PathBuf) -> Self {
        Self {
            temp_root,
            default_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub download_id: String,
    pub filename: String,
    pub total_files: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub progress_records: usize,
    pub temp_entries: usize,
    /// Background run failures drained from the supervisor.
    pub task_failures: usize,
}

/// Plans sessions, drives batch runs in the background and merges archives.
///
/// Must be used behind an `Arc`: background runs keep the orchestrator alive
/// until they finish.
pub struct SessionOrchestrator {
    config: OrchestratorConfig,
    engine: BatchDownloadEngine,
    progress: Arc<ProgressStore>,
    artifacts: Arc<ArtifactRegistry>,
    supervisor: TaskSupervisor,
    sessions: Mutex<HashMap<String, SessionDescriptor>>,
    busy: Mutex<HashSet<String>>,
}

impl SessionOrchestrator {
    /// Builds an orchestrator on the current tokio runtime.
    pub fn new(
        config: OrchestratorConfig,
        engine: BatchDownloadEngine,
        progress: Arc<ProgressStore>,
        artifacts: Arc<ArtifactRegistry>,
    ) -> Arc<Self> {
        let hook_store = progress.clone();
        let supervisor = TaskSupervisor::current().with_failure_hook(move |failure| {
            // Task ids are progress ids.
            hook_store.update(
                &failure.task_id,
                ProgressUpdate::new()
                    .status(ProgressStatus::Error)
                    .message(format!("Error: {}", failure.message)),
            );
        });
        Arc::new(Self {
            config,
            engine,
            progress,
            artifacts,
            supervisor,
            sessions: Mutex::new(HashMap::new()),
            busy: Mutex::new(HashSet::new()),
        })
    }

    pub fn progress(&self) -> &Arc<ProgressStore> {
        &self.progress
    }

    pub fn artifacts(&self) -> &Arc<ArtifactRegistry> {
        &self.artifacts
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    pub fn temp_root(&self) -> &Path {
        &self.config.temp_root
    }

    pub fn session_folder(&self, session_id: &str) -> PathBuf {
        self.config.temp_root.join(session_folder_name(session_id))
    }

    /// One-off run over `urls` into the temp root. Returns the progress id
    /// immediately; the record ends `ready` with a download id, or `error`.
    pub fn start_download(self: &Arc<Self>, urls: &[String]) -> Result<String, SessionError> {
        let urls = clean_urls(urls);
        if urls.is_empty() {
            return Err(SessionError::EmptyUrlList);
        }

        let progress_id = Uuid::new_v4().to_string();
        self.progress.create(&progress_id);
        self.progress.update(
            &progress_id,
            ProgressUpdate::new()
                .status(ProgressStatus::Analyzing)
                .total(urls.len())
                .message(format!("Analyzing {} URLs...", urls.len())),
        );

        let this = Arc::clone(self);
        let id = progress_id.clone();
        self.supervisor.spawn(progress_id.clone(), async move {
            let sink = StoreProgressSink::new(this.progress.clone(), id.clone()).deferring_completion();
            let result = this
                .engine
                .run(&urls, &this.config.temp_root, &sink)
                .await;
            this.publish_run_result(&id, result, |summary| {
                Artifact::one_shot(summary.zip_path.clone(), summary.filename.clone())
            });
            Ok::<(), SessionError>(())
        });
        Ok(progress_id)
    }

    /// Splits `urls` into batches and persists the plan as `session.json`.
    pub fn prepare(
        &self,
        urls: &[String],
        batch_size: Option<usize>,
    ) -> Result<SessionDescriptor, SessionError> {
        let urls = clean_urls(urls);
        if urls.is_empty() {
            return Err(SessionError::EmptyUrlList);
        }
        let batch_size = batch_size.unwrap_or(self.config.default_batch_size);

        let session_id = Uuid::new_v4().simple().to_string();
        let descriptor = SessionDescriptor::new(
            session_id.clone(),
            Utc::now().to_rfc3339(),
            &urls,
            batch_size,
        );
        self.write_descriptor(&descriptor)?;
        engine_info!(
            "Prepared session {}: {} URLs in {} batches of {}",
            session_id,
            descriptor.total_urls,
            descriptor.total_batches,
            descriptor.batch_size
        );

        self.lock_sessions()
            .insert(session_id, descriptor.clone());
        Ok(descriptor)
    }

    /// Downloads one batch in the background; the archive lands in the
    /// session folder and the descriptor records the completion.
    pub fn download_batch(
        self: &Arc<Self>,
        session_id: &str,
        batch_number: usize,
    ) -> Result<String, SessionError> {
        let descriptor = self.session(session_id)?;
        let batch = descriptor
            .batch(batch_number)
            .ok_or_else(|| SessionError::InvalidBatch {
                session_id: session_id.to_string(),
                batch_number,
            })?;
        match batch.state(self.is_busy(session_id)) {
            BatchState::Completed => {
                return Err(SessionError::BatchCompleted {
                    session_id: session_id.to_string(),
                    batch_number,
                })
            }
            BatchState::Downloading => return Err(SessionError::SessionBusy(session_id.to_string())),
            BatchState::Pending => {}
        }
        let urls = batch.spec.urls.clone();
        let guard = BusyGuard::acquire(self, session_id)?;

        let progress_id = Uuid::new_v4().to_string();
        self.progress.create(&progress_id);
        self.progress.update(
            &progress_id,
            ProgressUpdate::new()
                .status(ProgressStatus::Analyzing)
                .total(urls.len())
                .message(format!(
                    "Batch {}/{}: {} URLs",
                    batch_number,
                    descriptor.total_batches,
                    urls.len()
                )),
        );

        let this = Arc::clone(self);
        let id = progress_id.clone();
        let session_id = session_id.to_string();
        self.supervisor.spawn(progress_id.clone(), async move {
            let _guard = guard;
            let sink = StoreProgressSink::new(this.progress.clone(), id.clone()).deferring_completion();
            let result = this
                .run_batch(&session_id, batch_number, &urls, &sink)
                .await;
            match result {
                Ok(summary) => {
                    this.progress.update(
                        &id,
                        ProgressUpdate::new()
                            .status(ProgressStatus::Ready)
                            .download_id(summary.download_id)
                            .filename(summary.filename)
                            .failed_urls(summary.failed_urls),
                    );
                    Ok(())
                }
                // The engine already published the error status.
                Err(BatchRunError::Run(RunError::NothingDownloaded { failed_urls, .. })) => {
                    this.progress
                        .update(&id, ProgressUpdate::new().failed_urls(failed_urls));
                    Ok(())
                }
                Err(err) => Err(err),
            }
        });
        Ok(progress_id)
    }

    /// Runs every pending batch in ascending order inside one background task.
    /// A failed batch is logged and skipped.
    pub fn auto_run(self: &Arc<Self>, session_id: &str) -> Result<String, SessionError> {
        let descriptor = self.session(session_id)?;
        let guard = BusyGuard::acquire(self, session_id)?;

        let pending: Vec<(usize, Vec<String>)> = descriptor
            .pending_batches()
            .into_iter()
            .filter_map(|number| {
                descriptor
                    .batch(number)
                    .map(|batch| (number, batch.spec.urls.clone()))
            })
            .collect();
        let total_urls: usize = pending.iter().map(|(_, urls)| urls.len()).sum();

        let progress_id = Uuid::new_v4().to_string();
        self.progress.create(&progress_id);
        self.progress.update(
            &progress_id,
            ProgressUpdate::new()
                .status(ProgressStatus::Downloading)
                .total(total_urls)
                .batch_total(pending.len())
                .message(format!("Automatic download of {} batches", pending.len())),
        );

        let this = Arc::clone(self);
        let id = progress_id.clone();
        let session_id = session_id.to_string();
        self.supervisor.spawn(progress_id.clone(), async move {
            let _guard = guard;
            this.auto_run_batches(&session_id, &id, pending).await;
            Ok::<(), SessionError>(())
        });
        Ok(progress_id)
    }

    async fn auto_run_batches(&self, session_id: &str, progress_id: &str, pending: Vec<(usize, Vec<String>)>) {
        let batch_total = pending.len();
        let mut successful = 0;
        let mut failed = 0;
        let mut failed_urls = Vec::new();
        let mut completed_batches = 0;

        for (position, (batch_number, urls)) in pending.into_iter().enumerate() {
            self.progress.update(
                progress_id,
                ProgressUpdate::new()
                    .batch_current(position + 1)
                    .message(format!(
                        "Batch {} of {} (batch #{}, {} URLs)",
                        position + 1,
                        batch_total,
                        batch_number,
                        urls.len()
                    )),
            );

            let sink = AutoRunSink {
                store: self.progress.clone(),
                id: progress_id.to_string(),
                base_successful: successful,
                base_failed: failed,
            };
            match self.run_batch(session_id, batch_number, &urls, &sink).await {
                Ok(summary) => {
                    successful += summary.successful;
                    failed += summary.failed_urls.len();
                    failed_urls.extend(summary.failed_urls);
                    completed_batches += 1;
                }
                Err(err) => {
                    engine_error!(
                        "Auto-run of session {}: batch {} failed: {}",
                        session_id,
                        batch_number,
                        err
                    );
                    match err {
                        BatchRunError::Run(RunError::NothingDownloaded {
                            failed_urls: batch_failures,
                            ..
                        }) => {
                            failed += batch_failures.len();
                            failed_urls.extend(batch_failures);
                        }
                        BatchRunError::Descriptor { summary, .. } => {
                            successful += summary.successful;
                            failed += summary.failed_urls.len();
                            failed_urls.extend(summary.failed_urls);
                        }
                        _ => {}
                    }
                }
            }
            self.progress
                .update(progress_id, ProgressUpdate::new().counts(successful, failed));
        }

        self.progress.update(
            progress_id,
            ProgressUpdate::new()
                .status(ProgressStatus::Completed)
                .counts(successful, failed)
                .failed_urls(failed_urls)
                .message(format!(
                    "Automatic download finished: {completed_batches}/{batch_total} batches completed, \
                     {successful} PDFs downloaded, {failed} failed."
                )),
        );
    }

    /// Downloads one batch and records its completion in the descriptor.
    async fn run_batch(
        &self,
        session_id: &str,
        batch_number: usize,
        urls: &[String],
        sink: &dyn ProgressSink,
    ) -> Result<BatchRunSummary, BatchRunError> {
        let folder = self.session_folder(session_id);
        let prefix = format!("batch_{batch_number:03}");
        let summary = self.engine.run_named(urls, &folder, &prefix, sink).await?;

        let download_id = Uuid::new_v4().to_string();
        self.artifacts.register_as(
            download_id.clone(),
            Artifact::session_batch(summary.zip_path.clone(), summary.filename.clone(), session_id),
        );
        let batch_summary = BatchRunSummary {
            download_id: download_id.clone(),
            filename: summary.filename.clone(),
            successful: summary.successful,
            failed_urls: summary.failed_urls,
        };
        if let Err(source) =
            self.complete_batch(session_id, batch_number, download_id, summary.filename)
        {
            return Err(BatchRunError::Descriptor {
                source,
                summary: batch_summary,
            });
        }
        engine_info!(
            "Session {} batch {} completed: {} succeeded",
            session_id,
            batch_number,
            batch_summary.successful
        );
        Ok(batch_summary)
    }

    fn complete_batch(
        &self,
        session_id: &str,
        batch_number: usize,
        download_id: String,
        filename: String,
    ) -> Result<(), SessionError> {
        let mut sessions = self.lock_sessions();
        let descriptor = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::InvalidSession(session_id.to_string()))?;
        let batch = descriptor
            .batch_mut(batch_number)
            .ok_or_else(|| SessionError::InvalidBatch {
                session_id: session_id.to_string(),
                batch_number,
            })?;
        if !batch.mark_completed(download_id, filename) {
            engine_warn!(
                "Session {} batch {} was already completed; keeping the first archive",
                session_id,
                batch_number
            );
            return Ok(());
        }
        let snapshot = descriptor.clone();
        drop(sessions);
        self.write_descriptor(&snapshot)
    }

    /// Summaries of every session folder under the temp root. Only batch
    /// counters are read; URL slices are skipped while parsing.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let root = &self.config.temp_root;
        let mut summaries = Vec::new();
        if !root.exists() {
            return Ok(summaries);
        }
        for entry in std::fs::read_dir(root).map_err(PersistError::from)? {
            let entry = entry.map_err(PersistError::from)?;
            let is_session = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with("session_"));
            let descriptor = entry.path().join(SESSION_DESCRIPTOR);
            if !is_session || !descriptor.is_file() {
                continue;
            }
            match read_json::<SessionSummary>(&descriptor) {
                Ok(summary) => summaries.push(summary.recount()),
                Err(err) => engine_warn!("Skipping unreadable session {:?}: {}", descriptor, err),
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Rebuilds in-memory state for a session from its descriptor, and
    /// re-registers the archives of completed batches still on disk.
    pub fn reload(&self, session_id: &str) -> Result<SessionDescriptor, SessionError> {
        validate_session_id(session_id)?;
        let folder = self.session_folder(session_id);
        let path = folder.join(SESSION_DESCRIPTOR);
        if !path.is_file() {
            return Err(SessionError::InvalidSession(session_id.to_string()));
        }
        let descriptor: SessionDescriptor = read_json(&path)?;

        let mut restored = 0;
        for batch in descriptor.batches.iter().filter(|batch| batch.completed) {
            let (Some(download_id), Some(filename)) = (&batch.download_id, &batch.filename) else {
                continue;
            };
            let archive = folder.join(filename);
            if archive.is_file() {
                self.artifacts.register_as(
                    download_id.clone(),
                    Artifact::session_batch(archive, filename.clone(), session_id),
                );
                restored += 1;
            } else {
                engine_warn!(
                    "Archive {:?} of session {} batch {} is missing",
                    archive,
                    session_id,
                    batch.batch_number()
                );
            }
        }
        engine_info!(
            "Reloaded session {} ({}/{} batches completed, {} archives restored)",
            session_id,
            descriptor.completed_batches(),
            descriptor.total_batches,
            restored
        );

        self.lock_sessions()
            .insert(session_id.to_string(), descriptor.clone());
        Ok(descriptor)
    }

    /// Combines completed batch archives of `session_id` into one fresh
    /// archive. Download ids of other sessions or one-shot runs are unknown
    /// here.
    pub async fn merge(
        &self,
        session_id: &str,
        download_ids: &[String],
    ) -> Result<MergeSummary, SessionError> {
        self.session(session_id)?;
        if download_ids.is_empty() {
            return Err(SessionError::NothingToMerge);
        }
        let sources = download_ids
            .iter()
            .map(|id| {
                self.artifacts
                    .get(id)
                    .filter(|artifact| artifact.session_id.as_deref() == Some(session_id))
                    .map(|artifact| artifact.path)
                    .ok_or_else(|| SessionError::UnknownArtifact(id.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let folder = self.session_folder(session_id);
        ensure_output_dir(&folder)?;
        let session_prefix: String = session_id.chars().take(8).collect();
        let filename = format!("merged_{session_prefix}_{}.zip", short_id());
        let dest = folder.join(&filename);

        let target = dest.clone();
        let total_files = tokio::task::spawn_blocking(move || merge_zips(&sources, &target))
            .await
            .map_err(|err| SessionError::Task(err.to_string()))??;

        let download_id = self
            .artifacts
            .register(Artifact::one_shot(dest, filename.clone()));
        engine_info!(
            "Merged {} archive(s) of session {} into {} ({} files)",
            download_ids.len(),
            session_id,
            filename,
            total_files
        );
        Ok(MergeSummary {
            download_id,
            filename,
            total_files,
        })
    }

    /// Removes stale progress records and temp-root entries older than
    /// `max_age`. Sessions with an active run are kept.
    pub fn cleanup(&self, max_age: Duration) -> Result<CleanupReport, SessionError> {
        let progress_records = self.progress.cleanup(max_age);

        let busy: Vec<PathBuf> = self
            .lock_busy()
            .iter()
            .map(|id| self.session_folder(id))
            .collect();
        let keep = |path: &Path| busy.iter().any(|folder| folder == path);
        let removed = cleanup_old_temp_files(&self.config.temp_root, max_age, &keep)
            .map_err(PersistError::from)?;

        for path in &removed {
            let session_id = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix("session_"));
            if let Some(session_id) = session_id {
                self.lock_sessions().remove(session_id);
                self.artifacts.forget_session(session_id);
            }
        }

        let failures = self.supervisor.drain_failures();
        if let Some(last) = failures.last() {
            engine_warn!(
                "Cleared {} task failure(s), last {}: {}",
                failures.len(),
                last.task_id,
                last.message
            );
        }

        Ok(CleanupReport {
            progress_records,
            temp_entries: removed.len(),
            task_failures: failures.len(),
        })
    }

    /// In-memory descriptor, loading it from disk if needed.
    pub fn session(&self, session_id: &str) -> Result<SessionDescriptor, SessionError> {
        validate_session_id(session_id)?;
        if let Some(descriptor) = self.lock_sessions().get(session_id) {
            return Ok(descriptor.clone());
        }
        self.reload(session_id)
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.lock_busy().contains(session_id)
    }

    fn publish_run_result(
        &self,
        progress_id: &str,
        result: Result<RunSummary, RunError>,
        artifact: impl FnOnce(&RunSummary) -> Artifact,
    ) {
        match result {
            Ok(summary) => {
                let download_id = self.artifacts.register(artifact(&summary));
                self.progress.update(
                    progress_id,
                    ProgressUpdate::new()
                        .status(ProgressStatus::Ready)
                        .download_id(download_id)
                        .filename(summary.filename)
                        .failed_urls(summary.failed_urls),
                );
            }
            Err(RunError::NothingDownloaded { failed_urls, .. }) => {
                self.progress
                    .update(progress_id, ProgressUpdate::new().failed_urls(failed_urls));
            }
            // The engine already published the error status.
            Err(err) => engine_error!("Run {} failed: {}", progress_id, err),
        }
    }

    fn write_descriptor(&self, descriptor: &SessionDescriptor) -> Result<(), SessionError> {
        let writer = AtomicFileWriter::new(self.session_folder(&descriptor.session_id));
        writer.write_json(SESSION_DESCRIPTOR, descriptor)?;
        Ok(())
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, SessionDescriptor>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_busy(&self) -> MutexGuard<'_, HashSet<String>> {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct BatchRunSummary {
    download_id: String,
    filename: String,
    successful: usize,
    failed_urls: Vec<FailedUrl>,
}

#[derive(Debug, Error)]
enum BatchRunError {
    #[error(transparent)]
    Run(#[from] RunError),
    /// The archive exists but the descriptor could not be updated.
    #[error("archive {} written but descriptor not updated: {source}", .summary.filename)]
    Descriptor {
        source: SessionError,
        summary: BatchRunSummary,
    },
}

/// Marks a session as running for as long as it lives.
struct BusyGuard {
    orchestrator: Arc<SessionOrchestrator>,
    session_id: String,
}

impl BusyGuard {
    fn acquire(orchestrator: &Arc<SessionOrchestrator>, session_id: &str) -> Result<Self, SessionError> {
        if !orchestrator.lock_busy().insert(session_id.to_string()) {
            return Err(SessionError::SessionBusy(session_id.to_string()));
        }
        Ok(Self {
            orchestrator: Arc::clone(orchestrator),
            session_id: session_id.to_string(),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.orchestrator.lock_busy().remove(&self.session_id);
    }
}

/// Forwards per-item counters of one batch into the auto-run record, offset by
/// the batches already finished.
struct AutoRunSink {
    store: Arc<ProgressStore>,
    id: String,
    base_successful: usize,
    base_failed: usize,
}

impl ProgressSink for AutoRunSink {
    fn emit(&self, event: RunEvent) {
        if let RunEvent::ItemFinished { successful, failed } = event {
            self.store.update(
                &self.id,
                ProgressUpdate::new()
                    .counts(self.base_successful + successful, self.base_failed + failed),
            );
        }
    }
}

fn clean_urls(urls: &[String]) -> Vec<String> {
    urls.iter()
        .map(|url| url.trim())
        .filter(|url| !url.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Session ids become folder names; anything but `[A-Za-z0-9_-]` is refused.
fn validate_session_id(session_id: &str) -> Result<(), SessionError> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidSession(session_id.to_string()))
    }
}
