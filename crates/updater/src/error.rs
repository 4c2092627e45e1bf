use std::path::PathBuf;

use crate::delta::DeltaError;

/// Convenient result alias for updater operations.
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Errors that can occur while building, resolving, downloading or applying an update.
#[derive(thiserror::Error, Debug)]
pub enum UpdaterError {
    /// Network request to the release host failed.
    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// The release host answered with an unexpected status.
    #[error("unexpected HTTP status {status} for {url}")]
    HttpStatus {
        /// Status code returned by the server.
        status: u16,
        /// Requested URL.
        url: String,
    },
    /// A manifest could not be decoded from JSON.
    #[error("manifest decoding failed: {0}")]
    ManifestDecode(#[from] serde_json::Error),
    /// A manifest was missing or violated one of its invariants.
    #[error("manifest error: {0}")]
    Manifest(String),
    /// The version graph has no route from `from` to `to`.
    #[error("no update path available from {from} to {to}")]
    NoPath {
        /// Installed version.
        from: String,
        /// Requested version.
        to: String,
    },
    /// A filesystem precondition failed before any mutation began.
    #[error("{reason}: {}", path.display())]
    FileSystem {
        /// What was wrong.
        reason: &'static str,
        /// Path that triggered the failure.
        path: PathBuf,
    },
    /// A binary delta could not be produced or applied.
    #[error("binary delta error: {0}")]
    Delta(#[from] DeltaError),
    /// A package archive could not be read or written.
    #[error("package archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    /// Failed to perform an I/O operation.
    #[error("filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),
    /// The main executable could not be started after a successful apply.
    #[error("failed to relaunch {}: {source}", path.display())]
    Relaunch {
        /// Executable that was launched.
        path: PathBuf,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },
    /// The caller stopped waiting for the result.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
    /// One step of a patch chain failed.
    #[error("update step {step} (to {to_version}) failed: {source}")]
    Step {
        /// Zero-based index of the step in the resolved chain.
        step: usize,
        /// Version the step was moving the install to.
        to_version: String,
        /// Structured reason.
        #[source]
        source: StepError,
    },
    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl UpdaterError {
    /// Helper for wrapping validation failures.
    pub fn validation(msg: impl Into<String>) -> Self {
        UpdaterError::Other(msg.into())
    }

    /// Helper for manifest invariant violations.
    pub fn manifest(msg: impl Into<String>) -> Self {
        UpdaterError::Manifest(msg.into())
    }

    pub(crate) fn file_system(reason: &'static str, path: impl Into<PathBuf>) -> Self {
        UpdaterError::FileSystem {
            reason,
            path: path.into(),
        }
    }

    /// Whether the error came from the network layer.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            UpdaterError::Network(_) | UpdaterError::HttpStatus { .. }
        )
    }
}

/// Why a single step of the patch chain failed.
#[derive(thiserror::Error, Debug)]
pub enum StepError {
    /// A package of the chain is not in the session directory.
    #[error("package archive {0} not found in the session directory")]
    PackageMissing(String),
    /// The archive has no `package-manifest.json`.
    #[error("package-manifest.json missing from {0}")]
    PackageManifestMissing(String),
    /// `package-manifest.json` is not valid JSON for the package format.
    #[error("malformed package manifest: {0}")]
    PackageManifest(#[from] serde_json::Error),
    /// The file a delta applies to is not installed.
    #[error("cannot patch, installed file not found: {0}")]
    PatchTargetMissing(String),
    /// The delta named by the package manifest is not in the archive.
    #[error("patch file missing from update package: {0}")]
    PatchFileMissing(String),
    /// The installed file does not match the hash a patch was built against.
    #[error("{file} does not match the patched version (expected {expected}, got {actual})")]
    VersionMismatch {
        /// Relative path of the patched file.
        file: String,
        /// SHA-256 recorded in the package.
        expected: String,
        /// SHA-256 of the installed file.
        actual: String,
    },
    /// The delta could not be applied to the installed file.
    #[error("failed to apply binary patch to {file}: {source}")]
    Delta {
        file: String,
        #[source]
        source: DeltaError,
    },
    /// The archive could not be read.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    /// An entry or path would land outside its directory.
    #[error("unsafe path in package: {0}")]
    UnsafePath(String),
    /// A version the step needs has no file list in the manifest.
    #[error("version {0} is not present in the manifest")]
    UnknownVersion(String),
    /// Filesystem failure while mutating the install or session directory.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StepError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> StepError {
        let path = path.into();
        move |source| StepError::Io { path, source }
    }
}
