//! Archive detection and extraction.
//!
//! Supported: `.zip`, `.tar`, `.tar.gz`, `.tgz`. Extraction is synchronous
//! (the fetcher runs it on the blocking pool) and refuses entries that would
//! escape the destination, plus caps the entry count against archive bombs.

use crate::error::FetchError;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Component, Path};
use tracing::debug;

/// Hard cap on extracted entries; past this the artifact is hostile.
const MAX_ENTRIES: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

fn detect(path: &Path) -> Option<ArchiveKind> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    if name.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if name.ends_with(".tar") {
        Some(ArchiveKind::Tar)
    } else {
        None
    }
}

/// Whether the fetcher should extract this artifact before scanning.
pub fn is_archive(path: &Path) -> bool {
    detect(path).is_some()
}

/// Extract `archive` into `dest` (created if missing). Returns the number of
/// file entries written.
pub fn extract(archive: &Path, dest: &Path) -> Result<usize, FetchError> {
    let kind = detect(archive).ok_or_else(|| FetchError::Archive {
        path: archive.to_path_buf(),
        reason: "unrecognized archive extension".to_string(),
    })?;
    fs::create_dir_all(dest)?;

    let count = match kind {
        ArchiveKind::Zip => extract_zip(archive, dest),
        ArchiveKind::Tar => {
            let file = fs::File::open(archive)?;
            extract_tar(BufReader::new(file), archive, dest)
        }
        ArchiveKind::TarGz => {
            let file = fs::File::open(archive)?;
            let gz = flate2::read::GzDecoder::new(BufReader::new(file));
            extract_tar(gz, archive, dest)
        }
    }?;

    debug!("Extracted {} entries from {}", count, archive.display());
    Ok(count)
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<usize, FetchError> {
    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file)).map_err(|err| FetchError::Archive {
        path: archive.to_path_buf(),
        reason: err.to_string(),
    })?;

    if zip.len() > MAX_ENTRIES {
        return Err(too_many_entries(archive, zip.len()));
    }

    let mut written = 0;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(|err| FetchError::Archive {
            path: archive.to_path_buf(),
            reason: err.to_string(),
        })?;

        // enclosed_name rejects absolute paths and `..` components
        let Some(relative) = entry.enclosed_name() else {
            return Err(FetchError::Archive {
                path: archive.to_path_buf(),
                reason: format!("entry '{}' escapes the extraction root", entry.name()),
            });
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
        written += 1;
    }
    Ok(written)
}

fn extract_tar<R: Read>(reader: R, archive: &Path, dest: &Path) -> Result<usize, FetchError> {
    let mut tar = tar::Archive::new(reader);
    let mut written = 0;

    for entry in tar.entries().map_err(|err| FetchError::Archive {
        path: archive.to_path_buf(),
        reason: err.to_string(),
    })? {
        let mut entry = entry.map_err(|err| FetchError::Archive {
            path: archive.to_path_buf(),
            reason: err.to_string(),
        })?;

        written += 1;
        if written > MAX_ENTRIES {
            return Err(too_many_entries(archive, written));
        }

        let entry_path = entry.path().map_err(|err| FetchError::Archive {
            path: archive.to_path_buf(),
            reason: err.to_string(),
        })?;
        if !is_safe_relative(&entry_path) {
            return Err(FetchError::Archive {
                path: archive.to_path_buf(),
                reason: format!("entry '{}' escapes the extraction root", entry_path.display()),
            });
        }

        // unpack_in re-validates containment against dest
        let unpacked = entry.unpack_in(dest).map_err(|err| FetchError::Archive {
            path: archive.to_path_buf(),
            reason: err.to_string(),
        })?;
        if !unpacked {
            written -= 1;
        }
    }
    Ok(written)
}

fn is_safe_relative(path: &Path) -> bool {
    path.components().all(|component| {
        matches!(component, Component::Normal(_) | Component::CurDir)
    })
}

fn too_many_entries(archive: &Path, count: usize) -> FetchError {
    FetchError::Archive {
        path: archive.to_path_buf(),
        reason: format!("archive has too many entries ({} > {})", count, MAX_ENTRIES),
    }
}

/// Convenience for tests and fixtures: build a zip from (name, contents)
/// pairs.
pub fn write_zip(dest: &Path, entries: &[(&str, &[u8])]) -> Result<(), FetchError> {
    use std::io::Write;
    let file = fs::File::create(dest)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in entries {
        writer
            .start_file(*name, options)
            .map_err(|err| FetchError::Archive {
                path: dest.to_path_buf(),
                reason: err.to_string(),
            })?;
        writer.write_all(contents)?;
    }
    writer.finish().map_err(|err| FetchError::Archive {
        path: dest.to_path_buf(),
        reason: err.to_string(),
    })?;
    Ok(())
}
