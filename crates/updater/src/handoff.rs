//! Filesystem contract between the in-process requester and the applier.
//!
//! Session directory layout (contract 1):
//!
//! ```text
//! <session>/manifest.json      master manifest the chain was resolved from
//! <session>/handoff.json       { contract, from_version, target_version, steps }
//! <session>/<package>.zip      every package of the chain, by file name
//! <session>/extracted/         scratch space owned by the applier
//! ```
//!
//! The applier takes exactly two positional arguments, `<session_dir>` and
//! `<install_dir>`, and reports through [`ExitCode`].

use crate::error::{Result, StepError, UpdaterError};
use crate::manifest::{is_plain_file_name, MasterManifest, MASTER_MANIFEST_FILE};
use crate::resolver::{ResolvedPath, ResolvedStep};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONTRACT_VERSION: u32 = 1;
pub const HANDOFF_FILE: &str = "handoff.json";
pub const EXTRACT_DIR: &str = "extracted";

/// Paths inside one session directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MASTER_MANIFEST_FILE)
    }

    pub fn handoff_path(&self) -> PathBuf {
        self.root.join(HANDOFF_FILE)
    }

    /// Location of a package archive; `file` must be a plain file name.
    pub fn package_path(&self, file: &str) -> Result<PathBuf> {
        if !is_plain_file_name(file) {
            return Err(UpdaterError::manifest(format!(
                "package file {file:?} is not a plain file name"
            )));
        }
        Ok(self.root.join(file))
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.root.join(EXTRACT_DIR)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandoffStep {
    pub to_version: String,
    pub file: String,
}

/// The resolved chain, as recorded for the applier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handoff {
    pub contract: u32,
    pub from_version: String,
    pub target_version: String,
    pub steps: Vec<HandoffStep>,
}

impl Handoff {
    pub fn from_path(path: &ResolvedPath) -> Self {
        Self {
            contract: CONTRACT_VERSION,
            from_version: path.from_version.clone(),
            target_version: path.target_version().to_string(),
            steps: path
                .steps
                .iter()
                .map(|step| HandoffStep {
                    to_version: step.to_version.clone(),
                    file: step.package.file.clone(),
                })
                .collect(),
        }
    }

    pub fn write(&self, layout: &SessionLayout) -> Result<()> {
        fs::write(layout.handoff_path(), serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Read the handoff file; `None` when the session predates the contract.
    pub fn read(layout: &SessionLayout) -> Result<Option<Self>> {
        let path = layout.handoff_path();
        if !path.is_file() {
            return Ok(None);
        }
        let handoff: Handoff = serde_json::from_slice(&fs::read(&path)?)?;
        if handoff.contract > CONTRACT_VERSION {
            return Err(UpdaterError::manifest(format!(
                "handoff contract {} is newer than supported {}",
                handoff.contract, CONTRACT_VERSION
            )));
        }
        Ok(Some(handoff))
    }

    /// Rebuild the chain by looking each step's package up in `manifest`.
    pub fn to_resolved(&self, manifest: &MasterManifest) -> Result<ResolvedPath> {
        let mut from = self.from_version.as_str();
        let mut steps = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            let package = manifest
                .package(from, &step.to_version)
                .filter(|package| package.file == step.file)
                .ok_or_else(|| {
                    UpdaterError::manifest(format!(
                        "handoff step {index} ({from} -> {}) names {}, which the manifest does not publish",
                        step.to_version, step.file
                    ))
                })?;
            steps.push(ResolvedStep {
                to_version: step.to_version.clone(),
                package: package.clone(),
            });
            from = step.to_version.as_str();
        }
        if from != self.target_version {
            return Err(UpdaterError::manifest(format!(
                "handoff targets {} but its steps end at {from}",
                self.target_version
            )));
        }
        Ok(ResolvedPath {
            from_version: self.from_version.clone(),
            steps,
        })
    }
}

/// Process exit codes of the applier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    Usage = 2,
    FileSystem = 3,
    Manifest = 4,
    VersionMismatch = 5,
    StepFailed = 6,
    Relaunch = 7,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Exit code reported for a failed run.
    pub fn for_error(err: &UpdaterError) -> Self {
        match err {
            UpdaterError::FileSystem { .. } => ExitCode::FileSystem,
            UpdaterError::Relaunch { .. } => ExitCode::Relaunch,
            UpdaterError::Manifest(_) | UpdaterError::ManifestDecode(_) | UpdaterError::NoPath { .. } => {
                ExitCode::Manifest
            }
            UpdaterError::Step {
                source: StepError::VersionMismatch { .. },
                ..
            } => ExitCode::VersionMismatch,
            _ => ExitCode::StepFailed,
        }
    }
}
