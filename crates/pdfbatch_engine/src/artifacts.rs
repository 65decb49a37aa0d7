use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

/// A produced ZIP waiting to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    /// Name offered to the requester.
    pub filename: String,
    pub session_id: Option<String>,
    /// Session batch archives stay on disk after download so they can be
    /// merged and re-registered after a restart.
    pub retain: bool,
}

impl Artifact {
    /// An archive deleted after its first download.
    pub fn one_shot(path: PathBuf, filename: impl Into<String>) -> Self {
        Self {
            path,
            filename: filename.into(),
            session_id: None,
            retain: false,
        }
    }

    /// A batch archive kept inside its session folder.
    pub fn session_batch(path: PathBuf, filename: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            path,
            filename: filename.into(),
            session_id: Some(session_id.into()),
            retain: true,
        }
    }
}

/// Download id → artifact map shared by request handlers and workers.
#[derive(Debug, Default)]
pub struct ArtifactRegistry {
    entries: Mutex<HashMap<String, Artifact>>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers under a fresh opaque id.
    pub fn register(&self, artifact: Artifact) -> String {
        let id = Uuid::new_v4().to_string();
        self.register_as(id.clone(), artifact);
        id
    }

    /// Registers under a known id, replacing any previous entry.
    pub fn register_as(&self, id: impl Into<String>, artifact: Artifact) {
        self.lock().insert(id.into(), artifact);
    }

    pub fn get(&self, id: &str) -> Option<Artifact> {
        self.lock().get(id).cloned()
    }

    /// Hands out an artifact for download. One-shot artifacts are removed
    /// from the registry; the caller deletes the file once streamed.
    pub fn checkout(&self, id: &str) -> Option<Artifact> {
        let mut entries = self.lock();
        match entries.get(id) {
            Some(artifact) if artifact.retain => Some(artifact.clone()),
            Some(_) => entries.remove(id),
            None => None,
        }
    }

    pub fn remove(&self, id: &str) -> Option<Artifact> {
        self.lock().remove(id)
    }

    /// Drops every artifact belonging to `session_id`; returns how many.
    pub fn forget_session(&self, session_id: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, artifact| artifact.session_id.as_deref() != Some(session_id));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Artifact>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
