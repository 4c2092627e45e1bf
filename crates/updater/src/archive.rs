//! Package archives: a zip holding `package-manifest.json` and the changed files.

use crate::error::{Result, StepError, UpdaterError};
use crate::manifest::{safe_join, PackageManifest, PACKAGE_MANIFEST_FILE};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// A file to place into a package at `name` (forward-slash relative path).
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub source: PathBuf,
}

/// Write a package archive and return its size in bytes.
pub fn write_package(
    path: &Path,
    package_manifest: &PackageManifest,
    entries: &[ArchiveEntry],
) -> Result<u64> {
    let file = File::create(path)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    zip.start_file(PACKAGE_MANIFEST_FILE, options)?;
    zip.write_all(&serde_json::to_vec_pretty(package_manifest)?)?;

    for entry in entries {
        if safe_join(Path::new(""), &entry.name).is_none() {
            return Err(UpdaterError::validation(format!(
                "refusing to package unsafe path {}",
                entry.name
            )));
        }
        zip.start_file(entry.name.as_str(), options)?;
        let mut source = File::open(&entry.source)?;
        io::copy(&mut source, &mut zip)?;
    }

    let mut writer = zip.finish()?;
    writer.flush()?;
    drop(writer);
    Ok(fs::metadata(path)?.len())
}

/// Extract every entry of `archive` below `dest`, rejecting entries that would escape it.
pub fn extract_package(archive: &Path, dest: &Path) -> std::result::Result<(), StepError> {
    let file = File::open(archive).map_err(StepError::io(archive))?;
    let mut zip = ZipArchive::new(file)?;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let name = entry.name().to_string();
        let target = entry
            .enclosed_name()
            .and_then(|relative| safe_join(dest, &relative.to_string_lossy()))
            .ok_or_else(|| StepError::UnsafePath(name.clone()))?;

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(StepError::io(&target))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(StepError::io(parent))?;
        }
        let mut out = File::create(&target).map_err(StepError::io(&target))?;
        io::copy(&mut entry, &mut out).map_err(StepError::io(&target))?;
    }
    Ok(())
}

/// Read the package manifest out of an extracted package.
pub fn read_package_manifest(
    extracted: &Path,
    archive_name: &str,
) -> std::result::Result<PackageManifest, StepError> {
    let path = extracted.join(PACKAGE_MANIFEST_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(StepError::PackageManifestMissing(archive_name.to_string()))
        }
        Err(err) => return Err(StepError::Io { path, source: err }),
    };
    Ok(serde_json::from_slice(&bytes)?)
}
