use std::ops::Range;

use serde::{Deserialize, Serialize};

/// A contiguous slice of a session's URL list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSpec {
    /// 1-based, contiguous.
    pub batch_number: usize,
    pub start: usize,
    pub end: usize,
    pub count: usize,
    pub urls: Vec<String>,
}

/// Partitions `urls` into consecutive batches of `batch_size`; the last batch
/// may be shorter. A zero `batch_size` is treated as 1.
pub fn plan_batches(urls: &[String], batch_size: usize) -> Vec<BatchSpec> {
    sub_batch_ranges(urls.len(), batch_size)
        .into_iter()
        .enumerate()
        .map(|(idx, range)| BatchSpec {
            batch_number: idx + 1,
            start: range.start,
            end: range.end,
            count: range.len(),
            urls: urls[range].to_vec(),
        })
        .collect()
}

/// Index ranges of consecutive chunks of `size` over `len` items.
pub fn sub_batch_ranges(len: usize, size: usize) -> Vec<Range<usize>> {
    let size = size.max(1);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

/// `Downloading` is transient and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Downloading,
    Completed,
}

/// A planned batch plus its durable completion state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    #[serde(flatten)]
    pub spec: BatchSpec,
    pub completed: bool,
    #[serde(default)]
    pub download_id: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

impl BatchRecord {
    pub fn pending(spec: BatchSpec) -> Self {
        Self {
            spec,
            completed: false,
            download_id: None,
            filename: None,
        }
    }

    pub fn batch_number(&self) -> usize {
        self.spec.batch_number
    }

    pub fn state(&self, running: bool) -> BatchState {
        if self.completed {
            BatchState::Completed
        } else if running {
            BatchState::Downloading
        } else {
            BatchState::Pending
        }
    }

    /// Marks the batch completed and attaches its archive. Completion is
    /// monotonic: returns `false` and changes nothing if already completed.
    pub fn mark_completed(&mut self, download_id: String, filename: String) -> bool {
        if self.completed {
            return false;
        }
        self.completed = true;
        self.download_id = Some(download_id);
        self.filename = Some(filename);
        true
    }
}
