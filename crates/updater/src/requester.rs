//! In-process side of the updater: check, download and hand off to the applier.
//!
//! Work runs on tokio tasks and reports back through [`UpdateEvent`]s so the
//! caller's UI thread never blocks.

use crate::apply::{read_version_marker, DetachedLauncher, ProcessLauncher};
use crate::config::UpdaterConfig;
use crate::download::{DownloadManager, DownloadProgress};
use crate::error::{Result, UpdaterError};
use crate::fetcher::{GitHubReleaseClient, ReleaseFetcher};
use crate::manifest::{MasterManifest, MASTER_MANIFEST_FILE};
use crate::resolver::resolve;
use crate::settings::{DownloadSessionRecord, SettingsStore};
use crate::version::{latest_version, SemverOrder, VersionOrder};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of comparing the installed version with the newest release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    UpToDate { current: String },
    Available { current: String, latest: String },
}

/// Notifications delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    Status(String),
    CheckFinished(CheckOutcome),
    Progress(DownloadProgress),
    /// Session directory ready for the applier; `None` when already up to date.
    DownloadFinished(Option<PathBuf>),
    Error(String),
}

struct Shared {
    config: UpdaterConfig,
    fetcher: Arc<dyn ReleaseFetcher>,
    settings: Arc<dyn SettingsStore>,
    order: Arc<dyn VersionOrder>,
    launcher: Arc<dyn ProcessLauncher>,
    abort: AtomicBool,
    events: mpsc::Sender<UpdateEvent>,
}

/// Handle used by the application to drive update checks and downloads.
#[derive(Clone)]
pub struct UpdateRequester {
    shared: Arc<Shared>,
}

/// Builder for [`UpdateRequester`].
pub struct UpdateRequesterBuilder {
    config: UpdaterConfig,
    fetcher: Arc<dyn ReleaseFetcher>,
    settings: Arc<dyn SettingsStore>,
    order: Arc<dyn VersionOrder>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl UpdateRequesterBuilder {
    /// Version ordering used to decide what is newer (defaults to [`SemverOrder`]).
    pub fn order(mut self, order: Arc<dyn VersionOrder>) -> Self {
        self.order = order;
        self
    }

    /// How the applier gets started (defaults to [`DetachedLauncher`]).
    pub fn launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Build the requester and the receiving end of its event channel.
    pub fn build(self) -> (UpdateRequester, mpsc::Receiver<UpdateEvent>) {
        let (events, rx) = mpsc::channel(64);
        let shared = Shared {
            config: self.config,
            fetcher: self.fetcher,
            settings: self.settings,
            order: self.order,
            launcher: self.launcher,
            abort: AtomicBool::new(false),
            events,
        };
        (
            UpdateRequester {
                shared: Arc::new(shared),
            },
            rx,
        )
    }
}

impl UpdateRequester {
    pub fn builder(
        config: UpdaterConfig,
        fetcher: Arc<dyn ReleaseFetcher>,
        settings: Arc<dyn SettingsStore>,
    ) -> UpdateRequesterBuilder {
        UpdateRequesterBuilder {
            config,
            fetcher,
            settings,
            order: Arc::new(SemverOrder),
            launcher: Arc::new(DetachedLauncher),
        }
    }

    /// Requester with default ordering and launcher.
    pub fn new(
        config: UpdaterConfig,
        fetcher: Arc<dyn ReleaseFetcher>,
        settings: Arc<dyn SettingsStore>,
    ) -> (Self, mpsc::Receiver<UpdateEvent>) {
        Self::builder(config, fetcher, settings).build()
    }

    /// Requester talking to the release host named in `config`.
    pub fn from_config(
        config: UpdaterConfig,
        settings: Arc<dyn SettingsStore>,
    ) -> Result<(Self, mpsc::Receiver<UpdateEvent>)> {
        let fetcher = Arc::new(GitHubReleaseClient::from_config(&config)?);
        Ok(Self::new(config, fetcher, settings))
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.shared.config
    }

    /// Version recorded in the install directory.
    pub fn installed_version(&self) -> String {
        let config = &self.shared.config;
        read_version_marker(&config.install_dir, &config.version_file)
    }

    /// Ask a running check to stop at its next cancellation point.
    pub fn abort_check(&self) {
        self.shared.abort.store(true, Ordering::SeqCst);
    }

    fn ensure_not_aborted(&self) -> Result<()> {
        if self.shared.abort.load(Ordering::SeqCst) {
            Err(UpdaterError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn emit(&self, event: UpdateEvent) {
        if self.shared.events.send(event).await.is_err() {
            debug!(target: "updater", "event receiver dropped");
        }
    }

    /// Compare the newest published release with the installed version.
    pub async fn check(&self) -> Result<CheckOutcome> {
        let current = self.installed_version();
        self.ensure_not_aborted()?;
        let latest = self.shared.fetcher.latest_tag().await?;
        self.ensure_not_aborted()?;

        let outcome = match latest {
            Some(latest) if self.shared.order.is_newer(&latest, &current) => {
                CheckOutcome::Available { current, latest }
            }
            _ => CheckOutcome::UpToDate { current },
        };
        info!(target: "updater", outcome = ?outcome, "update check finished");
        Ok(outcome)
    }

    /// Run [`check`](Self::check) on a background task, reporting through events.
    pub fn spawn_check(&self) -> JoinHandle<()> {
        self.shared.abort.store(false, Ordering::SeqCst);
        let this = self.clone();
        tokio::spawn(async move {
            this.emit(UpdateEvent::Status("Checking for updates".into()))
                .await;
            let event = match this.check().await {
                Ok(outcome) => UpdateEvent::CheckFinished(outcome),
                Err(UpdaterError::Cancelled) => UpdateEvent::Status("Update check cancelled".into()),
                Err(err) => {
                    warn!(target: "updater", error = %err, "update check failed");
                    UpdateEvent::Error(err.to_string())
                }
            };
            this.emit(event).await;
        })
    }

    /// Check on a background task and wait at most the configured timeout.
    ///
    /// On timeout the check is asked to abort and its eventual result is dropped.
    pub async fn check_with_timeout(&self) -> Result<CheckOutcome> {
        self.shared.abort.store(false, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        tokio::spawn(async move {
            let _ = tx.send(this.check().await);
        });

        let limit = self.shared.config.check_timeout();
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(UpdaterError::validation("update check task ended without a result")),
            Err(_) => {
                self.abort_check();
                warn!(target: "updater", timeout = ?limit, "update check timed out");
                Err(UpdaterError::Timeout(limit))
            }
        }
    }

    /// Fetch the master manifest, resolve the cheapest chain and download it.
    ///
    /// Returns `None` when the install is already at the newest version.
    pub async fn download(&self) -> Result<Option<PathBuf>> {
        let shared = &self.shared;
        let current = self.installed_version();
        let tag = shared
            .fetcher
            .latest_tag()
            .await?
            .ok_or_else(|| UpdaterError::manifest("no release has been published"))?;
        let manifest_bytes = shared.fetcher.fetch_bytes(&tag, MASTER_MANIFEST_FILE).await?;
        let manifest = MasterManifest::from_slice(&manifest_bytes)?;
        let target = latest_version(&manifest, shared.order.as_ref())
            .ok_or_else(|| UpdaterError::manifest("manifest lists no versions"))?
            .to_string();

        let path = resolve(&manifest, &current, &target)?;
        if path.is_empty() {
            info!(target: "updater", version = %current, "already up to date");
            return Ok(None);
        }
        info!(
            target: "updater",
            from = %current,
            to = %target,
            packages = path.len(),
            bytes = path.total_size(),
            "resolved update chain"
        );

        shared.config.ensure_dirs()?;
        let manager = DownloadManager::new(
            Arc::clone(&shared.fetcher),
            &shared.config.session_dir,
            shared.config.chunk_size,
        )
        .read_timeout(shared.config.download_timeout());
        let events = shared.events.clone();
        let dir = manager
            .download(&manifest_bytes, &path, move |progress| {
                // Progress is lossy under back-pressure; the final event is not.
                let _ = events.try_send(UpdateEvent::Progress(progress));
            })
            .await?;

        DownloadSessionRecord::new(shared.settings.as_ref()).init(&dir)?;
        Ok(Some(dir))
    }

    /// Run [`download`](Self::download) on a background task, reporting through events.
    pub fn spawn_download(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            this.emit(UpdateEvent::Status("Downloading update".into()))
                .await;
            let event = match this.download().await {
                Ok(dir) => UpdateEvent::DownloadFinished(dir),
                Err(UpdaterError::NoPath { from, to }) => {
                    UpdateEvent::Error(format!("No update path available from {from} to {to}"))
                }
                Err(err) => {
                    warn!(target: "updater", error = %err, "update download failed");
                    UpdateEvent::Error(err.to_string())
                }
            };
            this.emit(event).await;
        })
    }

    /// Session directory of a finished download that has not been applied yet.
    pub fn existing_download(&self) -> Option<PathBuf> {
        DownloadSessionRecord::new(self.shared.settings.as_ref()).existing_download()
    }

    /// Launch the applier on `session_dir`. The caller should exit right after.
    pub fn apply_update(&self, session_dir: &Path) -> Result<()> {
        let config = &self.shared.config;
        let applier = config.applier_path();
        if !applier.is_file() {
            return Err(UpdaterError::file_system("applier executable not found", applier));
        }
        if !session_dir.is_dir() {
            return Err(UpdaterError::file_system("update session not found", session_dir));
        }
        if !config.install_dir.is_dir() {
            return Err(UpdaterError::file_system(
                "install directory not found",
                &config.install_dir,
            ));
        }

        DownloadSessionRecord::new(self.shared.settings.as_ref()).clear()?;
        let working_dir = applier.parent().unwrap_or(config.install_dir.as_path());
        info!(target: "updater", applier = %applier.display(), session = %session_dir.display(), "launching applier");
        self.shared
            .launcher
            .launch(
                &applier,
                &[session_dir.as_os_str(), config.install_dir.as_os_str()],
                working_dir,
            )
            .map_err(UpdaterError::Io)
    }
}
