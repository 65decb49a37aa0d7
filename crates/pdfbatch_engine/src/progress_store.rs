use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use engine_logging::{engine_debug, engine_info, engine_warn};
use pdfbatch_core::{ProgressRecord, ProgressStatus, ProgressUpdate};

use crate::batch::{ProgressSink, RunEvent};
use crate::persist::{ensure_output_dir, read_json, AtomicFileWriter, PersistError};

/// Source of "now" in epoch seconds.
pub type Clock = Arc<dyn Fn() -> f64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| Utc::now().timestamp_millis() as f64 / 1000.0)
}

/// Counter-only updates reach disk once per this many processed URLs.
const MIRROR_EVERY: usize = 20;

/// Message given to records whose run died with the previous process.
pub const INTERRUPTED_MESSAGE: &str = "Interrupted by restart";

struct Records {
    by_id: HashMap<String, ProgressRecord>,
    /// Bumped for every snapshot handed to the mirror.
    generation: u64,
}

/// Progress records keyed by opaque progress id.
///
/// One mutex guards every read-modify-write, so concurrent workers merging
/// different fields never lose each other's updates. When opened with a
/// directory, records are mirrored to `{id}.json` outside that lock: on
/// creation, on every status change and every `MIRROR_EVERY` processed URLs.
pub struct ProgressStore {
    records: Mutex<Records>,
    mirror: Option<Mirror>,
    clock: Clock,
}

impl ProgressStore {
    pub fn in_memory() -> Self {
        Self::with_parts(HashMap::new(), None)
    }

    /// Opens a store mirrored to `dir`, loading any records already there.
    /// Records still in flight when the previous process stopped are moved to
    /// `error`, since no worker is left to finish them.
    pub fn persistent(dir: PathBuf) -> Result<Self, PersistError> {
        ensure_output_dir(&dir)?;
        let mut records = load_records(&dir)?;
        let mirror = Mirror::new(AtomicFileWriter::new(dir.clone()));

        let now = (system_clock())();
        let mut interrupted = 0;
        for (id, record) in records.iter_mut().filter(|(_, record)| !record.is_terminal()) {
            record.apply(
                ProgressUpdate::new()
                    .status(ProgressStatus::Error)
                    .message(INTERRUPTED_MESSAGE),
                now,
            );
            mirror.write(id, 0, record);
            interrupted += 1;
        }
        engine_info!(
            "Loaded {} progress record(s) from {:?}, {} interrupted",
            records.len(),
            dir,
            interrupted
        );
        Ok(Self::with_parts(records, Some(mirror)))
    }

    fn with_parts(by_id: HashMap<String, ProgressRecord>, mirror: Option<Mirror>) -> Self {
        Self {
            records: Mutex::new(Records { by_id, generation: 0 }),
            mirror,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Starts a fresh record, replacing any existing one with the same id.
    pub fn create(&self, id: &str) {
        let record = ProgressRecord::new((self.clock)());
        let generation = {
            let mut records = self.lock();
            records.by_id.insert(id.to_string(), record.clone());
            records.next_generation()
        };
        self.mirror(id, generation, &record);
    }

    /// Merges `update` into an existing record. Unknown ids are logged and
    /// ignored; returns whether the record existed.
    pub fn update(&self, id: &str, update: ProgressUpdate) -> bool {
        let now = (self.clock)();
        let snapshot = {
            let mut records = self.lock();
            let Some(record) = records.by_id.get_mut(id) else {
                engine_debug!("Ignoring progress update for unknown id {}", id);
                return false;
            };
            let before_status = record.status;
            let before_processed = record.successful + record.failed;
            let requested = update.status;
            if !record.apply(update, now) {
                engine_warn!(
                    "Progress {}: ignored status change {} -> {:?}",
                    id,
                    record.status,
                    requested
                );
            }
            let processed = record.successful + record.failed;
            let due = record.status != before_status
                || (processed != before_processed && processed % MIRROR_EVERY == 0);
            if due && self.mirror.is_some() {
                let record = record.clone();
                Some((records.next_generation(), record))
            } else {
                None
            }
        };
        if let Some((generation, record)) = snapshot {
            self.mirror(id, generation, &record);
        }
        true
    }

    /// Owned snapshot of the record.
    pub fn get(&self, id: &str) -> Option<ProgressRecord> {
        self.lock().by_id.get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self.lock().by_id.remove(id).is_some();
        if removed {
            if let Some(mirror) = &self.mirror {
                mirror.remove(id);
            }
        }
        removed
    }

    /// Deletes every record whose last update is older than `max_age`.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = (self.clock)() - max_age.as_secs_f64();
        let stale: Vec<String> = {
            let mut records = self.lock();
            let stale: Vec<String> = records
                .by_id
                .iter()
                .filter(|(_, record)| record.last_update < cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                records.by_id.remove(id);
            }
            stale
        };
        if let Some(mirror) = &self.mirror {
            for id in &stale {
                mirror.remove(id);
            }
        }
        if !stale.is_empty() {
            engine_info!("Removed {} stale progress record(s)", stale.len());
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mirror(&self, id: &str, generation: u64, record: &ProgressRecord) {
        if let Some(mirror) = &self.mirror {
            mirror.write(id, generation, record);
        }
    }
}

impl Default for ProgressStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Records {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

/// Per-record JSON files. Writers race outside the record lock, so each file
/// remembers the generation it holds and older snapshots are dropped.
struct Mirror {
    writer: AtomicFileWriter,
    written: Mutex<HashMap<String, u64>>,
}

impl Mirror {
    fn new(writer: AtomicFileWriter) -> Self {
        Self {
            writer,
            written: Mutex::new(HashMap::new()),
        }
    }

    fn write(&self, id: &str, generation: u64, record: &ProgressRecord) {
        if !is_safe_id(id) {
            engine_warn!("Progress id {:?} is not persisted: unsafe file name", id);
            return;
        }
        let mut written = self.lock();
        let newest = written.get(id).copied().unwrap_or(0);
        if generation != 0 && generation <= newest {
            return;
        }
        match self.writer.write_json(&record_filename(id), record) {
            Ok(_) => {
                written.insert(id.to_string(), generation.max(newest));
            }
            Err(err) => engine_warn!("Failed to persist progress record {}: {}", id, err),
        }
    }

    fn remove(&self, id: &str) {
        if !is_safe_id(id) {
            return;
        }
        let mut written = self.lock();
        written.remove(id);
        let path = self.writer.dir().join(record_filename(id));
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                engine_warn!("Failed to remove progress file {:?}: {}", path, err);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn record_filename(id: &str) -> String {
    format!("{id}.json")
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn load_records(dir: &Path) -> Result<HashMap<String, ProgressRecord>, PersistError> {
    let mut records = HashMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        match read_json::<ProgressRecord>(&path) {
            Ok(record) => {
                records.insert(id.to_string(), record);
            }
            Err(err) => engine_warn!("Skipping unreadable progress file {:?}: {}", path, err),
        }
    }
    Ok(records)
}

/// Publishes engine run events into one progress record.
pub struct StoreProgressSink {
    store: Arc<ProgressStore>,
    id: String,
    defer_completion: bool,
}

impl StoreProgressSink {
    pub fn new(store: Arc<ProgressStore>, id: impl Into<String>) -> Self {
        Self {
            store,
            id: id.into(),
            defer_completion: false,
        }
    }

    /// Leaves the record in `compressing` when the run finishes, so the caller
    /// can publish the terminal status together with the artifact id.
    pub fn deferring_completion(mut self) -> Self {
        self.defer_completion = true;
        self
    }
}

impl ProgressSink for StoreProgressSink {
    fn emit(&self, event: RunEvent) {
        let update = match event {
            RunEvent::Started {
                total,
                sub_batches,
                sub_batch_size,
            } => ProgressUpdate::new()
                .status(ProgressStatus::Downloading)
                .total(total)
                .batch_total(sub_batches)
                .message(format!(
                    "Downloading {total} PDFs in {sub_batches} batches of {sub_batch_size}..."
                )),
            RunEvent::SubBatchStarted {
                number,
                total,
                first,
                last,
            } => ProgressUpdate::new()
                .batch_current(number)
                .message(format!(
                    "Processing batch {number}/{total} (URLs {first} to {last})"
                )),
            RunEvent::ItemFinished { successful, failed } => {
                ProgressUpdate::new().counts(successful, failed)
            }
            RunEvent::Compressing { successful } => ProgressUpdate::new()
                .status(ProgressStatus::Compressing)
                .message(format!("Compressing {successful} PDFs into a ZIP file...")),
            RunEvent::Finished { successful, failed } => {
                let update = ProgressUpdate::new().counts(successful, failed).message(format!(
                    "Done! {successful} PDFs downloaded successfully, {failed} failed."
                ));
                if self.defer_completion {
                    update
                } else {
                    update.status(ProgressStatus::Completed)
                }
            }
            RunEvent::Failed { message } => ProgressUpdate::new()
                .status(ProgressStatus::Error)
                .message(message),
        };
        self.store.update(&self.id, update);
    }
}
