//! Build-time packaging of a new release against the published history.

use crate::archive::{write_package, ArchiveEntry};
use crate::error::{Result, UpdaterError};
use crate::hash::sha256_file;
use crate::manifest::{
    build_file_manifest, changed_files, FileManifest, MasterManifest, Package, PackageKind,
    PackageManifest, PatchInfo,
};
use crate::version::VersionOrder;
use crate::delta;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Every this many releases a cumulative package is built from further back.
pub const DEFAULT_HOP_INTERVAL: usize = 3;

/// Settings for packaging one release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuilderConfig {
    pub build_dir: PathBuf,
    pub new_version: String,
    /// Where package archives are written.
    pub output_dir: PathBuf,
    pub main_executable: String,
    /// Paths under this prefix are never hashed nor packaged.
    pub exclude_prefix: Option<String>,
    pub hop_interval: usize,
}

impl BuilderConfig {
    pub fn new(build_dir: impl Into<PathBuf>, new_version: impl Into<String>) -> Self {
        Self {
            build_dir: build_dir.into(),
            new_version: new_version.into(),
            output_dir: PathBuf::from("."),
            main_executable: crate::config::DEFAULT_MAIN_EXECUTABLE.to_string(),
            exclude_prefix: Some(crate::config::DEFAULT_EXCLUDE_PREFIX.to_string()),
            hop_interval: DEFAULT_HOP_INTERVAL,
        }
    }
}

/// Supplies the main executable of a previously published version.
pub trait ExecutableSource {
    /// Path to the old executable, or `None` when it cannot be obtained.
    fn old_executable(&self, version: &str) -> Result<Option<PathBuf>>;
}

/// Looks for `<root>/<version>/<executable>`.
#[derive(Debug, Clone)]
pub struct DirectoryExecutableSource {
    root: PathBuf,
    executable: String,
}

impl DirectoryExecutableSource {
    pub fn new(root: impl Into<PathBuf>, executable: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            executable: executable.into(),
        }
    }
}

impl ExecutableSource for DirectoryExecutableSource {
    fn old_executable(&self, version: &str) -> Result<Option<PathBuf>> {
        let candidate = self.root.join(version).join(&self.executable);
        Ok(candidate.is_file().then_some(candidate))
    }
}

/// Used when no previous executables are available at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExecutables;

impl ExecutableSource for NoExecutables {
    fn old_executable(&self, _version: &str) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// A previous version a package will be built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTarget {
    pub version: String,
    pub kind: PackageKind,
}

/// Pick the versions to build packages from.
///
/// The immediately preceding version is always a target. When the new
/// version's position in the history is a multiple of `hop_interval`, the
/// version `hop_interval` releases back is added as a cumulative target.
pub fn choose_patch_targets(
    manifest: &MasterManifest,
    new_version: &str,
    hop_interval: usize,
    order: &dyn VersionOrder,
) -> Vec<PatchTarget> {
    let mut ascending: Vec<&str> = manifest.versions.keys().map(String::as_str).collect();
    if !ascending.contains(&new_version) {
        ascending.push(new_version);
    }
    ascending.sort_by(|a, b| order.compare(a, b));

    let Some(position) = ascending.iter().position(|v| *v == new_version) else {
        return Vec::new();
    };
    if position == 0 {
        return Vec::new();
    }

    let mut targets = vec![PatchTarget {
        version: ascending[position - 1].to_string(),
        kind: PackageKind::Direct,
    }];
    if hop_interval > 1 && position >= hop_interval && position % hop_interval == 0 {
        targets.push(PatchTarget {
            version: ascending[position - hop_interval].to_string(),
            kind: PackageKind::Cumulative,
        });
    }
    targets
}

/// Outcome of packaging a release.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub version: String,
    pub packages: Vec<Package>,
    /// Archives written to the output directory, in `packages` order.
    pub archives: Vec<PathBuf>,
}

impl BuildReport {
    pub fn package_created(&self) -> bool {
        !self.packages.is_empty()
    }
}

pub struct ManifestBuilder<'a> {
    config: BuilderConfig,
    executables: &'a dyn ExecutableSource,
    order: &'a dyn VersionOrder,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(
        config: BuilderConfig,
        executables: &'a dyn ExecutableSource,
        order: &'a dyn VersionOrder,
    ) -> Self {
        Self {
            config,
            executables,
            order,
        }
    }

    /// Hash the new build, package it against its targets and append it to `manifest`.
    pub fn build(&self, manifest: &mut MasterManifest) -> Result<BuildReport> {
        let new_version = self.config.new_version.clone();
        if manifest.versions.contains_key(&new_version) {
            return Err(UpdaterError::manifest(format!(
                "version {new_version} is already published"
            )));
        }
        if !self.config.build_dir.is_dir() {
            return Err(UpdaterError::file_system(
                "build directory not found",
                &self.config.build_dir,
            ));
        }
        fs::create_dir_all(&self.config.output_dir)?;

        info!(target: "updater", version = %new_version, "hashing build tree");
        let new_files = build_file_manifest(
            &self.config.build_dir,
            self.config.exclude_prefix.as_deref(),
        )?;

        let targets = choose_patch_targets(
            manifest,
            &new_version,
            self.config.hop_interval,
            self.order,
        );
        if targets.is_empty() {
            info!(target: "updater", version = %new_version, "no previous versions; first release");
        }

        let mut packages = Vec::with_capacity(targets.len());
        let mut archives = Vec::with_capacity(targets.len());
        for target in &targets {
            let from_files = manifest.versions.get(&target.version).ok_or_else(|| {
                UpdaterError::manifest(format!("target version {} vanished", target.version))
            })?;
            let (package, archive) = self.create_package(target, from_files, &new_files)?;
            packages.push(package);
            archives.push(archive);
        }

        manifest.versions.insert(new_version.clone(), new_files);
        manifest.packages.insert(new_version.clone(), packages.clone());
        manifest.validate()?;

        Ok(BuildReport {
            version: new_version,
            packages,
            archives,
        })
    }

    fn create_package(
        &self,
        target: &PatchTarget,
        from_files: &FileManifest,
        to_files: &FileManifest,
    ) -> Result<(Package, PathBuf)> {
        let from_version = &target.version;
        let to_version = &self.config.new_version;
        let exe = &self.config.main_executable;
        let package_name = package_file_name(from_version, to_version);

        let mut changed = changed_files(from_files, to_files);
        info!(
            target: "updater",
            from = %from_version,
            to = %to_version,
            changed = changed.len(),
            "creating package"
        );

        let scratch = tempfile::tempdir()?;
        let mut entries = Vec::with_capacity(changed.len() + 1);
        let mut patch = None;

        if let Some(idx) = changed.iter().position(|file| file == exe) {
            match self.executables.old_executable(from_version)? {
                Some(old_exe) => {
                    let patch_name = patch_file_name(exe, from_version, to_version);
                    let delta_path = scratch.path().join(&patch_name);
                    let stats = delta::diff_files(
                        &old_exe,
                        &self.config.build_dir.join(exe),
                        &delta_path,
                    )?;
                    info!(
                        target: "updater",
                        file = %exe,
                        delta_bytes = stats.encoded_bytes,
                        copied = stats.copy_bytes,
                        added = stats.add_bytes,
                        "binary delta created"
                    );
                    patch = Some(PatchInfo {
                        file: exe.clone(),
                        patch_file: patch_name.clone(),
                        old_sha256: sha256_file(&old_exe)?,
                    });
                    changed.remove(idx);
                    entries.push(ArchiveEntry {
                        name: patch_name,
                        source: delta_path,
                    });
                }
                None => {
                    warn!(
                        target: "updater",
                        version = %from_version,
                        "old executable unavailable; shipping the full executable"
                    );
                }
            }
        }

        entries.extend(changed.into_iter().map(|name| ArchiveEntry {
            source: self.config.build_dir.join(&name),
            name,
        }));

        let archive = self.config.output_dir.join(&package_name);
        let size = write_package(&archive, &PackageManifest { patch: patch.clone() }, &entries)?;
        info!(target: "updater", package = %package_name, size, "package written");

        Ok((
            Package {
                file: package_name,
                size,
                from_version: from_version.clone(),
                patch,
                kind: Some(target.kind),
            },
            archive,
        ))
    }
}

pub fn package_file_name(from: &str, to: &str) -> String {
    format!("update-{from}-to-{to}.zip")
}

pub fn patch_file_name(executable: &str, from: &str, to: &str) -> String {
    let base = Path::new(executable)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| executable.to_string());
    format!("{base}-{from}-to-{to}.patch")
}
