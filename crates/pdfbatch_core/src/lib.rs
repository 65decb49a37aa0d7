//! Pdfbatch core: pure batch planning and progress state machine.
mod plan;
mod progress;
mod session;

pub use plan::{plan_batches, sub_batch_ranges, BatchRecord, BatchSpec, BatchState};
pub use progress::{FailedUrl, ProgressRecord, ProgressStatus, ProgressUpdate};
pub use session::{session_folder_name, BatchSummary, SessionDescriptor, SessionSummary};
