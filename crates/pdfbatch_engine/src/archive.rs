use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use engine_logging::{engine_debug, engine_warn};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// A file to add to an archive under a flat entry name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub name: String,
}

fn deflate() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

/// Writes `entries` into a new deflate ZIP at `dest`. A partially written
/// archive is removed on error. Returns the entry count.
pub fn write_zip(entries: &[ArchiveEntry], dest: &Path) -> Result<usize, ArchiveError> {
    let result = write_zip_inner(entries, dest);
    if result.is_err() {
        discard(dest);
    }
    result
}

fn write_zip_inner(entries: &[ArchiveEntry], dest: &Path) -> Result<usize, ArchiveError> {
    let mut zip = ZipWriter::new(BufWriter::new(File::create(dest)?));
    for entry in entries {
        zip.start_file(entry.name.as_str(), deflate())?;
        let mut source = BufReader::new(File::open(&entry.path)?);
        io::copy(&mut source, &mut zip)?;
    }
    zip.finish()?;
    Ok(entries.len())
}

/// Copies every file entry of `sources` into one fresh archive at `dest`,
/// entry by entry through a streaming copy. Entry names are flattened to their
/// last path component; on a name collision the entry from the later source
/// wins. Returns the number of entries written.
pub fn merge_zips(sources: &[PathBuf], dest: &Path) -> Result<usize, ArchiveError> {
    let result = merge_zips_inner(sources, dest);
    if result.is_err() {
        discard(dest);
    }
    result
}

fn merge_zips_inner(sources: &[PathBuf], dest: &Path) -> Result<usize, ArchiveError> {
    let mut archives = Vec::with_capacity(sources.len());
    for source in sources {
        archives.push(ZipArchive::new(BufReader::new(File::open(source)?))?);
    }

    // First pass over the central directories: remember where each name is
    // last seen.
    let mut winners: HashMap<String, (usize, usize)> = HashMap::new();
    for (archive_idx, archive) in archives.iter_mut().enumerate() {
        for entry_idx in 0..archive.len() {
            let entry = archive.by_index(entry_idx)?;
            if entry.is_dir() {
                continue;
            }
            let name = flat_name(entry.name());
            if let Some((prev_archive, _)) =
                winners.insert(name.clone(), (archive_idx, entry_idx))
            {
                engine_warn!(
                    "Duplicate entry {:?} in {:?} replaces the one from {:?}",
                    name,
                    sources[archive_idx],
                    sources[prev_archive]
                );
            }
        }
    }

    let mut zip = ZipWriter::new(BufWriter::new(File::create(dest)?));
    let mut written = 0;
    for (archive_idx, archive) in archives.iter_mut().enumerate() {
        for entry_idx in 0..archive.len() {
            let mut entry = archive.by_index(entry_idx)?;
            if entry.is_dir() {
                continue;
            }
            let name = flat_name(entry.name());
            if winners.get(&name) != Some(&(archive_idx, entry_idx)) {
                continue;
            }
            zip.start_file(name.as_str(), deflate())?;
            io::copy(&mut entry, &mut zip)?;
            written += 1;
        }
    }
    zip.finish()?;
    engine_debug!("Merged {} archive(s) into {:?} ({} entries)", sources.len(), dest, written);
    Ok(written)
}

/// Entry names of an archive, in archive order.
pub fn zip_entry_names(path: &Path) -> Result<Vec<String>, ArchiveError> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(path)?))?;
    let mut names = Vec::with_capacity(archive.len());
    for idx in 0..archive.len() {
        names.push(archive.by_index(idx)?.name().to_string());
    }
    Ok(names)
}

fn flat_name(name: &str) -> String {
    name.rsplit('/').next().unwrap_or(name).to_string()
}

fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            engine_warn!("Could not remove partial archive {:?}: {}", path, err);
        }
    }
}
