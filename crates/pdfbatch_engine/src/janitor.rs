use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use engine_logging::{engine_info, engine_warn};

use crate::orchestrator::SESSION_DESCRIPTOR;

/// Removes temp-root entries older than `max_age` and returns their paths.
///
/// Files and scratch directories age by their own modification time; session
/// folders age by their descriptor. Hidden entries and paths for which `keep`
/// returns `true` are never touched.
pub fn cleanup_old_temp_files(
    root: &Path,
    max_age: Duration,
    keep: &dyn Fn(&Path) -> bool,
) -> io::Result<Vec<PathBuf>> {
    let now = SystemTime::now();
    let mut removed = Vec::new();
    if !root.exists() {
        return Ok(removed);
    }

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || keep(&path) {
            continue;
        }

        let file_type = entry.file_type()?;
        let aged_by = if file_type.is_dir() && path.join(SESSION_DESCRIPTOR).is_file() {
            path.join(SESSION_DESCRIPTOR)
        } else {
            path.clone()
        };
        let modified = match fs::metadata(&aged_by).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                engine_warn!("Cannot read age of {:?}: {}", aged_by, err);
                continue;
            }
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age <= max_age {
            continue;
        }

        let result = if file_type.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed.push(path),
            Err(err) => engine_warn!("Could not remove {:?}: {}", path, err),
        }
    }

    if !removed.is_empty() {
        engine_info!("Removed {} old temp entr(ies) from {:?}", removed.len(), root);
    }
    Ok(removed)
}
