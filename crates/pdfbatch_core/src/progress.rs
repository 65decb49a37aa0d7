use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a progress record. Variants are declared in phase order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Initializing,
    Analyzing,
    Downloading,
    Compressing,
    Completed,
    Ready,
    Error,
}

impl ProgressStatus {
    fn phase(self) -> u8 {
        match self {
            ProgressStatus::Initializing => 0,
            ProgressStatus::Analyzing => 1,
            ProgressStatus::Downloading => 2,
            ProgressStatus::Compressing => 3,
            ProgressStatus::Completed => 4,
            ProgressStatus::Ready => 5,
            ProgressStatus::Error => 6,
        }
    }

    /// Statuses after which a progress feed closes.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgressStatus::Completed | ProgressStatus::Ready | ProgressStatus::Error
        )
    }

    /// Forward-only transitions. `Ready` and `Error` are final; `Error` is
    /// reachable from every other status.
    pub fn can_transition_to(self, next: ProgressStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            ProgressStatus::Ready | ProgressStatus::Error => false,
            _ => next.phase() > self.phase(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStatus::Initializing => "initializing",
            ProgressStatus::Analyzing => "analyzing",
            ProgressStatus::Downloading => "downloading",
            ProgressStatus::Compressing => "compressing",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Ready => "ready",
            ProgressStatus::Error => "error",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A URL that could not be downloaded, with its classified error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUrl {
    pub url: String,
    pub error: String,
}

/// Snapshot of one run's progress as seen by polling clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub status: ProgressStatus,
    pub total: usize,
    pub current: usize,
    pub batch_current: usize,
    pub batch_total: usize,
    pub successful: usize,
    pub failed: usize,
    pub message: String,
    /// Epoch seconds.
    pub start_time: f64,
    /// Epoch seconds.
    pub last_update: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_urls: Vec<FailedUrl>,
}

impl ProgressRecord {
    pub fn new(now: f64) -> Self {
        Self {
            status: ProgressStatus::Initializing,
            total: 0,
            current: 0,
            batch_current: 0,
            batch_total: 0,
            successful: 0,
            failed: 0,
            message: "Initializing...".to_string(),
            start_time: now,
            last_update: now,
            download_id: None,
            filename: None,
            failed_urls: Vec::new(),
        }
    }

    /// Merges the fields present in `update` and refreshes `last_update`.
    ///
    /// A backwards status change is dropped while the remaining fields still
    /// merge. Returns `false` when the status change was dropped.
    pub fn apply(&mut self, update: ProgressUpdate, now: f64) -> bool {
        let mut accepted = true;
        if let Some(status) = update.status {
            if self.status.can_transition_to(status) {
                self.status = status;
            } else {
                accepted = false;
            }
        }
        if let Some(total) = update.total {
            self.total = total;
        }
        if let Some(current) = update.current {
            self.current = current;
        }
        if let Some(batch_current) = update.batch_current {
            self.batch_current = batch_current;
        }
        if let Some(batch_total) = update.batch_total {
            self.batch_total = batch_total;
        }
        if let Some(successful) = update.successful {
            self.successful = successful;
        }
        if let Some(failed) = update.failed {
            self.failed = failed;
        }
        if let Some(message) = update.message {
            self.message = message;
        }
        if let Some(download_id) = update.download_id {
            self.download_id = Some(download_id);
        }
        if let Some(filename) = update.filename {
            self.filename = Some(filename);
        }
        if let Some(failed_urls) = update.failed_urls {
            self.failed_urls = failed_urls;
        }

        // Processed items can never exceed the announced total.
        let processed = self.successful + self.failed;
        if processed > self.total {
            self.total = processed;
        }

        self.last_update = now;
        accepted
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Partial update merged into a [`ProgressRecord`]; `None` fields are left
/// untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub status: Option<ProgressStatus>,
    pub total: Option<usize>,
    pub current: Option<usize>,
    pub batch_current: Option<usize>,
    pub batch_total: Option<usize>,
    pub successful: Option<usize>,
    pub failed: Option<usize>,
    pub message: Option<String>,
    pub download_id: Option<String>,
    pub filename: Option<String>,
    pub failed_urls: Option<Vec<FailedUrl>>,
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: ProgressStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    pub fn current(mut self, current: usize) -> Self {
        self.current = Some(current);
        self
    }

    pub fn batch_current(mut self, batch_current: usize) -> Self {
        self.batch_current = Some(batch_current);
        self
    }

    pub fn batch_total(mut self, batch_total: usize) -> Self {
        self.batch_total = Some(batch_total);
        self
    }

    /// Sets `successful`, `failed` and `current` together.
    pub fn counts(mut self, successful: usize, failed: usize) -> Self {
        self.successful = Some(successful);
        self.failed = Some(failed);
        self.current = Some(successful + failed);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn download_id(mut self, download_id: impl Into<String>) -> Self {
        self.download_id = Some(download_id.into());
        self
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn failed_urls(mut self, failed_urls: Vec<FailedUrl>) -> Self {
        self.failed_urls = Some(failed_urls);
        self
    }
}
