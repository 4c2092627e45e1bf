//! Install-directory mutation, run by the standalone applier process.
//!
//! The main application must have exited before [`PatchApplier::run`] is
//! called: it is the only writer of the install directory while it runs.
//! A failing step aborts the whole run; earlier steps stay applied.

use crate::archive::{extract_package, read_package_manifest};
use crate::delta;
use crate::error::{Result, StepError, UpdaterError};
use crate::handoff::{Handoff, SessionLayout};
use crate::hash::sha256_file;
use crate::manifest::{relative_key, removed_files, safe_join, FileChange, MasterManifest};
use crate::resolver::{resolve, ResolvedPath, ResolvedStep};
use crate::version::{latest_version, SemverOrder, VersionOrder, FALLBACK_VERSION};
use std::ffi::OsStr;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Read the installed version tag, falling back to [`FALLBACK_VERSION`].
pub fn read_version_marker(install_dir: &Path, file: &str) -> String {
    fs::read_to_string(install_dir.join(file))
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|version| !version.is_empty())
        .unwrap_or_else(|| FALLBACK_VERSION.to_string())
}

fn write_version_marker(install_dir: &Path, file: &str, version: &str) -> Result<()> {
    let mut temp = NamedTempFile::new_in(install_dir)?;
    temp.write_all(version.as_bytes())?;
    temp.flush()?;
    temp.persist(install_dir.join(file))
        .map_err(|err| UpdaterError::Io(err.error))?;
    Ok(())
}

/// Starts a process without waiting for it.
pub trait ProcessLauncher: Send + Sync {
    /// Start `executable` with `args` in `working_dir` and return immediately.
    fn launch(&self, executable: &Path, args: &[&OsStr], working_dir: &Path) -> io::Result<()>;
}

/// Spawns the executable as a detached child with no inherited stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedLauncher;

impl ProcessLauncher for DetachedLauncher {
    fn launch(&self, executable: &Path, args: &[&OsStr], working_dir: &Path) -> io::Result<()> {
        let mut command = Command::new(executable);
        command
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }
        command.spawn().map(|_| ())
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub from_version: String,
    pub target_version: String,
    pub steps: usize,
    /// Files patched in place with a binary delta.
    pub patched: Vec<String>,
    /// Files copied in from package archives.
    pub installed: Vec<String>,
    pub removed: Vec<String>,
}

/// Applies a downloaded session to an install directory.
pub struct PatchApplier<'a> {
    layout: SessionLayout,
    install_dir: PathBuf,
    main_executable: String,
    version_file: String,
    order: Box<dyn VersionOrder + 'a>,
    launcher: &'a dyn ProcessLauncher,
}

impl<'a> PatchApplier<'a> {
    pub fn new(
        session_dir: impl Into<PathBuf>,
        install_dir: impl Into<PathBuf>,
        launcher: &'a dyn ProcessLauncher,
    ) -> Self {
        Self {
            layout: SessionLayout::new(session_dir),
            install_dir: install_dir.into(),
            main_executable: crate::config::DEFAULT_MAIN_EXECUTABLE.to_string(),
            version_file: crate::config::DEFAULT_VERSION_FILE.to_string(),
            order: Box::new(SemverOrder),
            launcher,
        }
    }

    /// Executable relaunched after a successful run.
    pub fn main_executable(mut self, name: impl Into<String>) -> Self {
        self.main_executable = name.into();
        self
    }

    /// Name of the version marker inside the install directory.
    pub fn version_file(mut self, name: impl Into<String>) -> Self {
        self.version_file = name.into();
        self
    }

    /// Ordering used to pick the target when the session has no handoff file.
    pub fn version_order(mut self, order: impl VersionOrder + 'a) -> Self {
        self.order = Box::new(order);
        self
    }

    /// Apply every step, record the new version, drop the session and relaunch.
    pub fn run(&self) -> Result<ApplyReport> {
        let report = self.apply()?;
        let executable = self.install_dir.join(&self.main_executable);
        info!(target: "updater", exe = %executable.display(), "relaunching application");
        self.launcher
            .launch(&executable, &[], &self.install_dir)
            .map_err(|source| UpdaterError::Relaunch {
                path: executable,
                source,
            })?;
        Ok(report)
    }

    /// Everything except the relaunch.
    pub fn apply(&self) -> Result<ApplyReport> {
        let (manifest, path) = self.prepare()?;
        info!(
            target: "updater",
            from = %path.from_version,
            to = %path.target_version(),
            steps = path.len(),
            "applying update chain"
        );

        let mut report = ApplyReport {
            from_version: path.from_version.clone(),
            target_version: path.target_version().to_string(),
            steps: path.len(),
            patched: Vec::new(),
            installed: Vec::new(),
            removed: Vec::new(),
        };
        for (index, step) in path.steps.iter().enumerate() {
            self.apply_step(&manifest, step, &mut report)
                .map_err(|source| UpdaterError::Step {
                    step: index,
                    to_version: step.to_version.clone(),
                    source,
                })?;
            info!(target: "updater", step = index, version = %step.to_version, "step applied");
        }

        write_version_marker(&self.install_dir, &self.version_file, &report.target_version)?;
        if let Err(err) = fs::remove_dir_all(self.layout.root()) {
            warn!(target: "updater", error = %err, "failed to remove session directory");
        }
        Ok(report)
    }

    /// Check every precondition and load the chain. Nothing is mutated here.
    fn prepare(&self) -> Result<(MasterManifest, ResolvedPath)> {
        if !self.install_dir.is_dir() {
            return Err(UpdaterError::file_system(
                "install directory not found",
                &self.install_dir,
            ));
        }
        if !self.layout.root().is_dir() {
            return Err(UpdaterError::file_system(
                "session directory not found",
                self.layout.root(),
            ));
        }
        let manifest = MasterManifest::load(&self.layout.manifest_path())?;
        let installed = read_version_marker(&self.install_dir, &self.version_file);

        let path = match Handoff::read(&self.layout)? {
            Some(handoff) => {
                if handoff.from_version != installed {
                    return Err(UpdaterError::manifest(format!(
                        "session was prepared for {} but {} is installed",
                        handoff.from_version, installed
                    )));
                }
                handoff.to_resolved(&manifest)?
            }
            None => {
                let target = latest_version(&manifest, self.order.as_ref())
                    .ok_or_else(|| UpdaterError::manifest("manifest lists no versions"))?;
                debug!(target: "updater", from = %installed, to = %target, "no handoff file, resolving");
                resolve(&manifest, &installed, target)?
            }
        };

        for (index, step) in path.steps.iter().enumerate() {
            if !self.layout.package_path(&step.package.file)?.is_file() {
                return Err(UpdaterError::Step {
                    step: index,
                    to_version: step.to_version.clone(),
                    source: StepError::PackageMissing(step.package.file.clone()),
                });
            }
        }
        Ok((manifest, path))
    }

    fn apply_step(
        &self,
        manifest: &MasterManifest,
        step: &ResolvedStep,
        report: &mut ApplyReport,
    ) -> std::result::Result<(), StepError> {
        let package = &step.package;
        let extract_dir = self.layout.extract_dir();
        if extract_dir.exists() {
            fs::remove_dir_all(&extract_dir).map_err(StepError::io(&extract_dir))?;
        }
        fs::create_dir_all(&extract_dir).map_err(StepError::io(&extract_dir))?;

        debug!(target: "updater", file = %package.file, "extracting package");
        let archive = self
            .layout
            .package_path(&package.file)
            .map_err(|_| StepError::UnsafePath(package.file.clone()))?;
        extract_package(&archive, &extract_dir)?;
        let package_manifest = read_package_manifest(&extract_dir, &package.file)?;

        let from_files = manifest
            .version(&package.from_version)
            .ok_or_else(|| StepError::UnknownVersion(package.from_version.clone()))?;
        let to_files = manifest
            .version(&step.to_version)
            .ok_or_else(|| StepError::UnknownVersion(step.to_version.clone()))?;

        let changes = package_manifest.changes(extracted_files(&extract_dir)?);

        for change in &changes {
            if let FileChange::Patch {
                target,
                delta_file,
                old_hash,
            } = change
            {
                self.patch_file(&extract_dir, target, delta_file, old_hash)?;
                report.patched.push(target.clone());
            }
        }

        for relative in removed_files(from_files, to_files) {
            let Some(installed) = safe_join(&self.install_dir, &relative) else {
                warn!(target: "updater", file = %relative, "skipping removal of unsafe path");
                continue;
            };
            match fs::remove_file(&installed) {
                Ok(()) => {
                    debug!(target: "updater", file = %relative, "removed");
                    report.removed.push(relative);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StepError::Io {
                        path: installed,
                        source: err,
                    })
                }
            }
        }

        for change in changes {
            if let FileChange::Replace { path } = change {
                let (Some(src), Some(dest)) = (
                    safe_join(&extract_dir, &path),
                    safe_join(&self.install_dir, &path),
                ) else {
                    return Err(StepError::UnsafePath(path));
                };
                move_file(&src, &dest)?;
                report.installed.push(path);
            }
        }

        fs::remove_dir_all(&extract_dir).map_err(StepError::io(&extract_dir))?;
        Ok(())
    }

    /// Rebuild `target` from its installed copy and the extracted delta.
    fn patch_file(
        &self,
        extract_dir: &Path,
        target: &str,
        delta_file: &str,
        old_hash: &str,
    ) -> std::result::Result<(), StepError> {
        let installed = safe_join(&self.install_dir, target)
            .ok_or_else(|| StepError::UnsafePath(target.to_string()))?;
        if !installed.is_file() {
            return Err(StepError::PatchTargetMissing(target.to_string()));
        }
        let actual = sha256_file(&installed).map_err(StepError::io(&installed))?;
        if !actual.eq_ignore_ascii_case(old_hash) {
            return Err(StepError::VersionMismatch {
                file: target.to_string(),
                expected: old_hash.to_string(),
                actual,
            });
        }
        let delta_path = safe_join(extract_dir, delta_file)
            .filter(|path| path.is_file())
            .ok_or_else(|| StepError::PatchFileMissing(delta_file.to_string()))?;

        let old = fs::read(&installed).map_err(StepError::io(&installed))?;
        let delta_bytes = fs::read(&delta_path).map_err(StepError::io(&delta_path))?;
        let patched = delta::apply(&old, &delta_bytes).map_err(|source| StepError::Delta {
            file: target.to_string(),
            source,
        })?;

        let parent = installed
            .parent()
            .ok_or_else(|| StepError::UnsafePath(target.to_string()))?;
        let mut temp = NamedTempFile::new_in(parent).map_err(StepError::io(parent))?;
        temp.write_all(&patched).map_err(StepError::io(temp.path()))?;
        temp.flush().map_err(StepError::io(temp.path()))?;
        temp.as_file()
            .sync_all()
            .map_err(StepError::io(temp.path()))?;
        let permissions = fs::metadata(&installed)
            .map_err(StepError::io(&installed))?
            .permissions();
        temp.as_file()
            .set_permissions(permissions)
            .map_err(StepError::io(temp.path()))?;
        temp.persist(&installed).map_err(|err| StepError::Io {
            path: installed.clone(),
            source: err.error,
        })?;
        info!(target: "updater", file = %target, bytes = patched.len(), "patched");
        Ok(())
    }
}

/// Relative keys of every file extracted from a package.
fn extracted_files(extract_dir: &Path) -> std::result::Result<Vec<String>, StepError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(extract_dir).min_depth(1) {
        let entry = entry.map_err(|err| {
            let path = err.path().map(Path::to_path_buf).unwrap_or_default();
            StepError::Io {
                path,
                source: err
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::other("directory walk failed")),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(extract_dir)
            .map(relative_key)
            .map_err(|_| StepError::UnsafePath(entry.path().display().to_string()))?;
        files.push(relative);
    }
    Ok(files)
}

/// Move `src` over `dest`, copying when a rename is not possible.
fn move_file(src: &Path, dest: &Path) -> std::result::Result<(), StepError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(StepError::io(parent))?;
    }
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    fs::copy(src, dest).map_err(StepError::io(dest))?;
    fs::remove_file(src).map_err(StepError::io(src))?;
    Ok(())
}
