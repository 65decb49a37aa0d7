use std::path::{Path, PathBuf};
use std::sync::Arc;

use engine_logging::{engine_error, engine_info, engine_warn};
use futures_util::{stream, StreamExt};
use pdfbatch_core::{sub_batch_ranges, FailedUrl};
use thiserror::Error;
use uuid::Uuid;

use crate::archive::{write_zip, ArchiveEntry, ArchiveError};
use crate::fetch::PdfFetcher;
use crate::persist::{ensure_output_dir, PersistError};
use crate::SavedPdf;

/// Progress milestones of one engine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Started {
        total: usize,
        sub_batches: usize,
        sub_batch_size: usize,
    },
    SubBatchStarted {
        number: usize,
        total: usize,
        first: usize,
        last: usize,
    },
    ItemFinished {
        successful: usize,
        failed: usize,
    },
    Compressing {
        successful: usize,
    },
    Finished {
        successful: usize,
        failed: usize,
    },
    Failed {
        message: String,
    },
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: RunEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn emit(&self, _event: RunEvent) {}
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Fetches in flight at once.
    pub worker_count: usize,
    /// URLs handed to the worker pool at a time.
    pub sub_batch_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            worker_count: 5,
            sub_batch_size: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub zip_path: PathBuf,
    pub filename: String,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub failed_urls: Vec<FailedUrl>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no PDF downloaded successfully ({failed} failures)")]
    NothingDownloaded {
        failed: usize,
        failed_urls: Vec<FailedUrl>,
    },
    #[error("persist error: {0}")]
    Persist(#[from] PersistError),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("background task failed: {0}")]
    Task(String),
}

/// Downloads URL lists into single ZIP archives.
#[derive(Clone)]
pub struct BatchDownloadEngine {
    fetcher: Arc<dyn PdfFetcher>,
    settings: EngineSettings,
}

struct Collected {
    saved: Vec<SavedPdf>,
    failed_urls: Vec<FailedUrl>,
}

impl BatchDownloadEngine {
    pub fn new(fetcher: Arc<dyn PdfFetcher>, settings: EngineSettings) -> Self {
        Self { fetcher, settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Downloads `urls` into `output_dir/pdfs_<id>.zip`.
    pub async fn run(
        &self,
        urls: &[String],
        output_dir: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, RunError> {
        self.run_named(urls, output_dir, "pdfs", sink).await
    }

    /// Like [`run`](Self::run), naming the archive `{prefix}_<id>.zip`.
    pub async fn run_named(
        &self,
        urls: &[String],
        output_dir: &Path,
        prefix: &str,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, RunError> {
        let result = self.run_inner(urls, output_dir, prefix, sink).await;
        if let Err(err) = &result {
            let message = match err {
                RunError::NothingDownloaded { failed, .. } => {
                    format!("No PDF downloaded successfully. {failed} failures.")
                }
                other => format!("Error: {other}"),
            };
            sink.emit(RunEvent::Failed { message });
        }
        result
    }

    async fn run_inner(
        &self,
        urls: &[String],
        output_dir: &Path,
        prefix: &str,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, RunError> {
        ensure_output_dir(output_dir)?;
        let scratch = output_dir.join(Uuid::new_v4().to_string());
        ensure_output_dir(&scratch)?;

        let collected = self.download_all(urls, &scratch, sink).await;
        let result = self
            .package(urls.len(), collected, output_dir, prefix, sink)
            .await;

        if let Err(err) = tokio::fs::remove_dir_all(&scratch).await {
            engine_warn!("Could not remove scratch directory {:?}: {}", scratch, err);
        }
        result
    }

    async fn download_all(&self, urls: &[String], scratch: &Path, sink: &dyn ProgressSink) -> Collected {
        let sub_batch_size = self.settings.sub_batch_size.max(1);
        let worker_count = self.settings.worker_count.max(1);
        let ranges = sub_batch_ranges(urls.len(), sub_batch_size);
        let sub_batches = ranges.len();

        engine_info!(
            "Starting download of {} PDFs with {} workers in {} sub-batches of {}",
            urls.len(),
            worker_count,
            sub_batches,
            sub_batch_size
        );
        sink.emit(RunEvent::Started {
            total: urls.len(),
            sub_batches,
            sub_batch_size,
        });

        let mut collected = Collected {
            saved: Vec::new(),
            failed_urls: Vec::new(),
        };
        for (idx, range) in ranges.into_iter().enumerate() {
            sink.emit(RunEvent::SubBatchStarted {
                number: idx + 1,
                total: sub_batches,
                first: range.start + 1,
                last: range.end,
            });

            let fetches = range.clone().map(|i| self.fetcher.fetch(&urls[i], i + 1, scratch));
            let mut completions = stream::iter(fetches).buffer_unordered(worker_count);
            while let Some(outcome) = completions.next().await {
                match outcome.result {
                    Ok(saved) => collected.saved.push(saved),
                    Err(err) => collected.failed_urls.push(FailedUrl {
                        url: outcome.url,
                        error: err.kind.to_string(),
                    }),
                }
                sink.emit(RunEvent::ItemFinished {
                    successful: collected.saved.len(),
                    failed: collected.failed_urls.len(),
                });
            }

            engine_info!(
                "Sub-batch {}/{} done: {} succeeded, {} failed over {} URLs",
                idx + 1,
                sub_batches,
                collected.saved.len(),
                collected.failed_urls.len(),
                range.end
            );
        }
        collected
    }

    async fn package(
        &self,
        total: usize,
        collected: Collected,
        output_dir: &Path,
        prefix: &str,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, RunError> {
        let Collected {
            mut saved,
            failed_urls,
        } = collected;
        let successful = saved.len();
        let failed = failed_urls.len();

        if successful == 0 {
            engine_error!("No PDF downloaded successfully, {} failures", failed);
            return Err(RunError::NothingDownloaded {
                failed,
                failed_urls,
            });
        }

        sink.emit(RunEvent::Compressing { successful });
        saved.sort_by(|a, b| a.filename.cmp(&b.filename));
        let entries: Vec<ArchiveEntry> = saved
            .into_iter()
            .map(|pdf| ArchiveEntry {
                path: pdf.path,
                name: pdf.filename,
            })
            .collect();

        let filename = format!("{prefix}_{}.zip", short_id());
        let zip_path = output_dir.join(&filename);
        let dest = zip_path.clone();
        tokio::task::spawn_blocking(move || write_zip(&entries, &dest))
            .await
            .map_err(|err| RunError::Task(err.to_string()))??;

        engine_info!(
            "Archive {:?} ready: {} succeeded, {} failed",
            zip_path,
            successful,
            failed
        );
        sink.emit(RunEvent::Finished { successful, failed });

        Ok(RunSummary {
            zip_path,
            filename,
            total,
            successful,
            failed,
            failed_urls,
        })
    }
}

/// First eight hex digits of a fresh v4 uuid.
pub(crate) fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
