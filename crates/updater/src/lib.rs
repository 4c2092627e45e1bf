//! Differential update engine for a desktop application.
//!
//! A release pipeline records every version's file hashes in a growing master
//! manifest and publishes small zip packages between versions: one from the
//! previous release and, periodically, a hop package spanning several. Large
//! executables travel as binary deltas. Installed clients find the cheapest
//! chain of packages with a shortest-path search, download it resumably, and
//! hand it to a standalone applier process that patches the install directory
//! and relaunches the application.
//!
//! ```ignore
//! use std::sync::Arc;
//! use updater::{JsonFileSettings, UpdateEvent, UpdateRequester, UpdaterConfig};
//!
//! # async fn demo() -> updater::Result<()> {
//! let config = UpdaterConfig::load(std::path::Path::new("updater.json"))?;
//! let settings = Arc::new(JsonFileSettings::open("settings.json"));
//! let (requester, mut events) = UpdateRequester::from_config(config, settings)?;
//!
//! requester.spawn_download();
//! while let Some(event) = events.recv().await {
//!     match event {
//!         UpdateEvent::Progress(p) => println!("{}%", p.percent()),
//!         UpdateEvent::DownloadFinished(Some(dir)) => {
//!             requester.apply_update(&dir)?;
//!             std::process::exit(0);
//!         }
//!         UpdateEvent::DownloadFinished(None) => println!("already up to date"),
//!         UpdateEvent::Error(message) => eprintln!("{message}"),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod apply;
pub mod archive;
pub mod builder;
pub mod config;
pub mod delta;
pub mod download;
mod error;
pub mod fetcher;
pub mod handoff;
pub mod hash;
pub mod manifest;
pub mod requester;
pub mod resolver;
pub mod settings;
pub mod version;

pub use apply::{read_version_marker, ApplyReport, DetachedLauncher, PatchApplier, ProcessLauncher};
pub use builder::{BuildReport, BuilderConfig, DirectoryExecutableSource, ManifestBuilder};
pub use config::UpdaterConfig;
pub use download::{DownloadManager, DownloadProgress};
pub use error::{Result, StepError, UpdaterError};
pub use fetcher::{AssetStream, GitHubReleaseClient, GitHubReleaseClientBuilder, ReleaseFetcher};
pub use handoff::{ExitCode, Handoff, SessionLayout};
pub use manifest::{FileChange, FileManifest, MasterManifest, Package, PackageManifest, PatchInfo};
pub use requester::{CheckOutcome, UpdateEvent, UpdateRequester};
pub use resolver::{resolve, ResolvedPath, ResolvedStep};
pub use settings::{DownloadSessionRecord, JsonFileSettings, MemorySettings, SettingsStore};
pub use version::{NaturalOrder, SemverOrder, VersionOrder};
