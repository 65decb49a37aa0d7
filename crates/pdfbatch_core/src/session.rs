use serde::{Deserialize, Serialize};

use crate::plan::{plan_batches, BatchRecord};

/// Folder holding a session's descriptor and batch archives.
pub fn session_folder_name(session_id: &str) -> String {
    format!("session_{session_id}")
}

/// Durable description of a planned session; stored as `session.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    /// RFC 3339.
    pub created_at: String,
    pub total_urls: usize,
    pub batch_size: usize,
    pub total_batches: usize,
    pub batches: Vec<BatchRecord>,
}

impl SessionDescriptor {
    pub fn new(
        session_id: impl Into<String>,
        created_at: impl Into<String>,
        urls: &[String],
        batch_size: usize,
    ) -> Self {
        let batches: Vec<BatchRecord> = plan_batches(urls, batch_size)
            .into_iter()
            .map(BatchRecord::pending)
            .collect();
        Self {
            session_id: session_id.into(),
            created_at: created_at.into(),
            total_urls: urls.len(),
            batch_size: batch_size.max(1),
            total_batches: batches.len(),
            batches,
        }
    }

    pub fn batch(&self, batch_number: usize) -> Option<&BatchRecord> {
        self.batches
            .iter()
            .find(|batch| batch.batch_number() == batch_number)
    }

    pub fn batch_mut(&mut self, batch_number: usize) -> Option<&mut BatchRecord> {
        self.batches
            .iter_mut()
            .find(|batch| batch.batch_number() == batch_number)
    }

    /// Pending batch numbers in ascending order.
    pub fn pending_batches(&self) -> Vec<usize> {
        let mut pending: Vec<usize> = self
            .batches
            .iter()
            .filter(|batch| !batch.completed)
            .map(BatchRecord::batch_number)
            .collect();
        pending.sort_unstable();
        pending
    }

    pub fn completed_batches(&self) -> usize {
        self.batches.iter().filter(|batch| batch.completed).count()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            created_at: self.created_at.clone(),
            total_urls: self.total_urls,
            batch_size: self.batch_size,
            total_batches: self.total_batches,
            completed_batches: self.completed_batches(),
            batches: self
                .batches
                .iter()
                .map(|batch| BatchSummary {
                    batch_number: batch.batch_number(),
                    count: batch.spec.count,
                    completed: batch.completed,
                    download_id: batch.download_id.clone(),
                })
                .collect(),
        }
    }
}

/// Batch fields that are cheap to list; URL slices are skipped when
/// deserializing a descriptor into this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_number: usize,
    pub count: usize,
    pub completed: bool,
    #[serde(default)]
    pub download_id: Option<String>,
}

/// Session overview used for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: String,
    pub total_urls: usize,
    pub batch_size: usize,
    pub total_batches: usize,
    #[serde(default)]
    pub completed_batches: usize,
    pub batches: Vec<BatchSummary>,
}

impl SessionSummary {
    /// Recomputes `completed_batches` from the batch list. Descriptor files do
    /// not carry the count, so listings call this after deserializing.
    pub fn recount(mut self) -> Self {
        self.completed_batches = self.batches.iter().filter(|b| b.completed).count();
        self
    }
}
