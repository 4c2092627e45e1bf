//! Sequential, resumable download of a resolved package chain.
//!
//! All packages of a chain are fetched one after another into a single
//! session directory and reported as one cumulative progress value. Files
//! already complete on disk are skipped, partial ones resume with a ranged
//! request. Any failure while fetching deletes the whole session directory.

use crate::error::{Result, UpdaterError};
use crate::fetcher::ReleaseFetcher;
use crate::handoff::{Handoff, SessionLayout};
use crate::manifest::{MasterManifest, MASTER_MANIFEST_FILE};
use crate::resolver::{ResolvedPath, ResolvedStep};
use futures::StreamExt;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Cumulative progress over every package of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub received: u64,
    pub total: u64,
    /// Package currently being fetched, `None` for the initial baseline.
    pub file: Option<String>,
}

impl DownloadProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.received.min(self.total) * 100) / self.total) as u8
    }
}

/// Longest wait for the next piece of a package body before giving up.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Downloads resolved chains into one session directory.
pub struct DownloadManager<F> {
    fetcher: F,
    layout: SessionLayout,
    chunk_size: usize,
    read_timeout: Duration,
}

impl<F> DownloadManager<F>
where
    F: ReleaseFetcher,
{
    pub fn new(fetcher: F, session_dir: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            fetcher,
            layout: SessionLayout::new(session_dir),
            chunk_size: chunk_size.max(1),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Fail a package whose body produces no data for `timeout`.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn session_dir(&self) -> &Path {
        self.layout.root()
    }

    /// Whether the session directory already holds everything `path` needs:
    /// a valid manifest, a matching handoff and every package at its exact size.
    pub fn completed_session(&self, path: &ResolvedPath) -> bool {
        if MasterManifest::load(&self.layout.manifest_path()).is_err() {
            return false;
        }
        match Handoff::read(&self.layout) {
            Ok(Some(handoff)) if handoff == Handoff::from_path(path) => {}
            _ => return false,
        }
        path.steps
            .iter()
            .all(|step| self.existing_len(&step.package.file) == Some(step.package.size))
    }

    fn existing_len(&self, file: &str) -> Option<u64> {
        let path = self.layout.package_path(file).ok()?;
        fs::metadata(path)
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }

    /// Bytes of `path` already on disk, counted toward the initial progress.
    pub fn bytes_on_disk(&self, path: &ResolvedPath) -> u64 {
        path.steps
            .iter()
            .map(|step| {
                self.existing_len(&step.package.file)
                    .unwrap_or(0)
                    .min(step.package.size)
            })
            .sum()
    }

    /// Create the session directory, drop anything that does not belong to
    /// `path`, and record the manifest and handoff for the applier.
    fn prepare_session(&self, manifest_bytes: &[u8], path: &ResolvedPath) -> Result<()> {
        let root = self.layout.root();
        fs::create_dir_all(root)?;

        let expected: HashMap<&str, u64> = path
            .steps
            .iter()
            .map(|step| (step.package.file.as_str(), step.package.size))
            .collect();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let keep = match expected.get(name.as_str()) {
                Some(&size) => entry.file_type()?.is_file() && entry.metadata()?.len() <= size,
                None => false,
            };
            if keep {
                continue;
            }
            debug!(target: "updater", entry = %name, "removing stale session entry");
            let entry_path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&entry_path)?;
            } else {
                fs::remove_file(&entry_path)?;
            }
        }

        fs::write(root.join(MASTER_MANIFEST_FILE), manifest_bytes)?;
        Handoff::from_path(path).write(&self.layout)?;
        Ok(())
    }

    /// Fetch every package of `path` into the session directory.
    ///
    /// `manifest_bytes` is the master manifest exactly as published; it is
    /// stored for the applier. Returns the session directory.
    pub async fn download<P>(
        &self,
        manifest_bytes: &[u8],
        path: &ResolvedPath,
        mut on_progress: P,
    ) -> Result<PathBuf>
    where
        P: FnMut(DownloadProgress) + Send,
    {
        let root = self.layout.root().to_path_buf();
        if self.completed_session(path) {
            info!(target: "updater", dir = %root.display(), "reusing fully downloaded session");
            on_progress(DownloadProgress {
                received: path.total_size(),
                total: path.total_size(),
                file: None,
            });
            return Ok(root);
        }

        let result = self.fetch_all(manifest_bytes, path, &mut on_progress).await;
        if let Err(err) = &result {
            warn!(target: "updater", error = %err, "download failed; discarding session");
            if let Err(cleanup) = fs::remove_dir_all(&root) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(target: "updater", error = %cleanup, "failed to remove session directory");
                }
            }
        }
        result.map(|()| root)
    }

    async fn fetch_all<P>(
        &self,
        manifest_bytes: &[u8],
        path: &ResolvedPath,
        on_progress: &mut P,
    ) -> Result<()>
    where
        P: FnMut(DownloadProgress) + Send,
    {
        self.prepare_session(manifest_bytes, path)?;

        let total = path.total_size();
        let mut received = self.bytes_on_disk(path);
        on_progress(DownloadProgress {
            received,
            total,
            file: None,
        });

        for step in &path.steps {
            self.fetch_step(step, total, &mut received, on_progress)
                .await?;
        }
        info!(target: "updater", packages = path.len(), bytes = total, "all update packages downloaded");
        Ok(())
    }

    async fn fetch_step<P>(
        &self,
        step: &ResolvedStep,
        total: u64,
        received: &mut u64,
        on_progress: &mut P,
    ) -> Result<()>
    where
        P: FnMut(DownloadProgress) + Send,
    {
        let package = &step.package;
        let target = self.layout.package_path(&package.file)?;
        let existing = self.existing_len(&package.file).unwrap_or(0);
        if existing == package.size {
            info!(target: "updater", file = %package.file, "package already downloaded");
            return Ok(());
        }

        info!(
            target: "updater",
            file = %package.file,
            tag = %step.to_version,
            offset = existing,
            "downloading package"
        );
        let mut stream = self
            .fetcher
            .open_stream(&step.to_version, &package.file, existing)
            .await?;

        let resumed = existing > 0 && stream.offset == existing;
        let mut file = if resumed {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&target)
                .await?
        } else {
            // Fresh file, or the server ignored the range.
            *received -= existing;
            tokio::fs::File::create(&target).await?
        };
        let mut written = if resumed { existing } else { 0 };

        loop {
            let next = tokio::time::timeout(self.read_timeout, stream.body.next())
                .await
                .map_err(|_| UpdaterError::Timeout(self.read_timeout))?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            for piece in chunk.chunks(self.chunk_size) {
                file.write_all(piece).await?;
                written += piece.len() as u64;
                *received += piece.len() as u64;
                on_progress(DownloadProgress {
                    received: *received,
                    total,
                    file: Some(package.file.clone()),
                });
            }
        }
        file.flush().await?;
        file.sync_all().await?;

        if written != package.size {
            return Err(UpdaterError::validation(format!(
                "{} is {written} bytes, manifest lists {}",
                package.file, package.size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fetcher::AssetStream;
    use crate::handoff::HANDOFF_FILE;
    use crate::manifest::{FileManifest, Package};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// In-memory release host that honours ranges and can cut streams short.
    #[derive(Default)]
    pub(crate) struct MockFetcher {
        pub latest: Option<String>,
        assets: HashMap<(String, String), Vec<u8>>,
        /// Asset name -> bytes delivered before the stream errors.
        failures: HashMap<String, usize>,
        /// Asset name -> bytes delivered before the stream goes silent.
        stalls: HashMap<String, usize>,
        pub ignore_ranges: bool,
        pub requests: Mutex<Vec<(String, String, u64)>>,
    }

    impl MockFetcher {
        pub fn insert(&mut self, tag: &str, file: &str, data: Vec<u8>) {
            self.assets.insert((tag.to_string(), file.to_string()), data);
        }

        pub fn fail_after(&mut self, file: &str, bytes: usize) {
            self.failures.insert(file.to_string(), bytes);
        }

        pub fn stall_after(&mut self, file: &str, bytes: usize) {
            self.stalls.insert(file.to_string(), bytes);
        }

        pub fn requested(&self) -> Vec<(String, String, u64)> {
            self.requests.lock().unwrap().clone()
        }

        fn asset(&self, tag: &str, file: &str) -> Result<&Vec<u8>> {
            self.assets
                .get(&(tag.to_string(), file.to_string()))
                .ok_or_else(|| UpdaterError::HttpStatus {
                    status: 404,
                    url: format!("{tag}/{file}"),
                })
        }
    }

    #[async_trait]
    impl ReleaseFetcher for MockFetcher {
        async fn latest_tag(&self) -> Result<Option<String>> {
            Ok(self.latest.clone())
        }

        async fn fetch_bytes(&self, tag: &str, file: &str) -> Result<Vec<u8>> {
            self.asset(tag, file).cloned()
        }

        async fn open_stream(&self, tag: &str, file: &str, offset: u64) -> Result<AssetStream> {
            self.requests
                .lock()
                .unwrap()
                .push((tag.to_string(), file.to_string(), offset));
            let data = self.asset(tag, file)?;
            let start = if self.ignore_ranges { 0 } else { offset as usize };
            let body = &data[start..];
            let mut items: Vec<Result<Bytes>> = Vec::new();
            if let Some(&cut) = self.stalls.get(file) {
                let head = Bytes::copy_from_slice(&body[..cut.min(body.len())]);
                return Ok(AssetStream {
                    offset: start as u64,
                    body: stream::iter(vec![Ok::<_, UpdaterError>(head)])
                        .chain(stream::pending())
                        .boxed(),
                });
            }
            match self.failures.get(file) {
                Some(&cut) => {
                    items.push(Ok(Bytes::copy_from_slice(&body[..cut.min(body.len())])));
                    items.push(Err(UpdaterError::HttpStatus {
                        status: 503,
                        url: format!("{tag}/{file}"),
                    }));
                }
                None => {
                    for piece in body.chunks(1000) {
                        items.push(Ok(Bytes::copy_from_slice(piece)));
                    }
                }
            }
            Ok(AssetStream {
                offset: start as u64,
                body: stream::iter(items).boxed(),
            })
        }
    }

    pub(crate) fn chain(sizes: &[(&str, &str, usize)]) -> (ResolvedPath, Vec<Vec<u8>>) {
        let mut steps = Vec::new();
        let mut payloads = Vec::new();
        for (i, (from, to, size)) in sizes.iter().enumerate() {
            let data: Vec<u8> = (0..*size).map(|b| (b as u8).wrapping_add(i as u8)).collect();
            steps.push(ResolvedStep {
                to_version: to.to_string(),
                package: Package {
                    file: format!("update-{from}-to-{to}.zip"),
                    size: *size as u64,
                    from_version: from.to_string(),
                    patch: None,
                    kind: None,
                },
            });
            payloads.push(data);
        }
        let from = sizes[0].0.to_string();
        (
            ResolvedPath {
                from_version: from,
                steps,
            },
            payloads,
        )
    }

    fn manifest_bytes(path: &ResolvedPath) -> Vec<u8> {
        let mut manifest = MasterManifest::default();
        manifest
            .versions
            .insert(path.from_version.clone(), FileManifest::new());
        for step in &path.steps {
            manifest.versions.insert(step.to_version.clone(), FileManifest::new());
            manifest
                .packages
                .entry(step.to_version.clone())
                .or_default()
                .push(step.package.clone());
        }
        serde_json::to_vec(&manifest).unwrap()
    }

    fn fetcher_for(path: &ResolvedPath, payloads: &[Vec<u8>]) -> MockFetcher {
        let mut fetcher = MockFetcher::default();
        for (step, data) in path.steps.iter().zip(payloads) {
            fetcher.insert(&step.to_version, &step.package.file, data.clone());
        }
        fetcher
    }

    #[tokio::test]
    async fn downloads_chain_with_cumulative_progress() {
        let dir = tempdir().unwrap();
        let session = dir.path().join("update_package");
        let (path, payloads) = chain(&[("v1", "v2", 2500), ("v2", "v3", 1200)]);
        let manager = DownloadManager::new(fetcher_for(&path, &payloads), &session, 512);

        let mut events = Vec::new();
        let out = manager
            .download(&manifest_bytes(&path), &path, |p| events.push(p))
            .await
            .unwrap();

        assert_eq!(out, session);
        assert_eq!(fs::read(session.join("update-v1-to-v2.zip")).unwrap(), payloads[0]);
        assert_eq!(fs::read(session.join("update-v2-to-v3.zip")).unwrap(), payloads[1]);
        assert!(session.join(MASTER_MANIFEST_FILE).is_file());
        assert_eq!(events.first().unwrap().received, 0);
        let last = events.last().unwrap();
        assert_eq!((last.received, last.total), (3700, 3700));
        assert!(events.windows(2).all(|w| w[0].received <= w[1].received));
        assert!(events.iter().all(|e| e.total == 3700));
        assert!(manager.completed_session(&path));
    }

    #[tokio::test]
    async fn complete_files_are_not_fetched_again() {
        let dir = tempdir().unwrap();
        let session = dir.path().join("update_package");
        let (path, payloads) = chain(&[("v1", "v2", 2000), ("v2", "v3", 1000)]);
        fs::create_dir_all(&session).unwrap();
        fs::write(session.join("update-v1-to-v2.zip"), &payloads[0]).unwrap();

        let manager = DownloadManager::new(fetcher_for(&path, &payloads), &session, 8192);
        let mut events = Vec::new();
        manager
            .download(&manifest_bytes(&path), &path, |p| events.push(p))
            .await
            .unwrap();

        let requested = manager.fetcher.requested();
        assert_eq!(requested.len(), 1);
        assert_eq!(requested[0].1, "update-v2-to-v3.zip");
        assert_eq!(events[0].received, 2000);
    }

    #[tokio::test]
    async fn partial_file_resumes_from_its_length() {
        let dir = tempdir().unwrap();
        let session = dir.path().join("update_package");
        let (path, payloads) = chain(&[("v1", "v2", 3000)]);
        fs::create_dir_all(&session).unwrap();
        fs::write(session.join("update-v1-to-v2.zip"), &payloads[0][..1234]).unwrap();

        let manager = DownloadManager::new(fetcher_for(&path, &payloads), &session, 8192);
        let mut events = Vec::new();
        manager
            .download(&manifest_bytes(&path), &path, |p| events.push(p))
            .await
            .unwrap();

        assert_eq!(manager.fetcher.requested()[0].2, 1234);
        assert_eq!(events[0].received, 1234);
        assert_eq!(fs::read(session.join("update-v1-to-v2.zip")).unwrap(), payloads[0]);
    }

    #[tokio::test]
    async fn server_ignoring_range_restarts_the_file() {
        let dir = tempdir().unwrap();
        let session = dir.path().join("update_package");
        let (path, payloads) = chain(&[("v1", "v2", 3000)]);
        fs::create_dir_all(&session).unwrap();
        fs::write(session.join("update-v1-to-v2.zip"), &payloads[0][..1000]).unwrap();

        let mut fetcher = fetcher_for(&path, &payloads);
        fetcher.ignore_ranges = true;
        let manager = DownloadManager::new(fetcher, &session, 8192);
        let mut last = None;
        manager
            .download(&manifest_bytes(&path), &path, |p| last = Some(p))
            .await
            .unwrap();

        assert_eq!(last.unwrap().received, 3000);
        assert_eq!(fs::read(session.join("update-v1-to-v2.zip")).unwrap(), payloads[0]);
    }

    #[tokio::test]
    async fn failure_mid_session_removes_session_directory() {
        let dir = tempdir().unwrap();
        let session = dir.path().join("update_package");
        let (path, payloads) = chain(&[("v1", "v2", 1000), ("v2", "v3", 4000)]);
        let mut fetcher = fetcher_for(&path, &payloads);
        fetcher.fail_after("update-v2-to-v3.zip", 1500);

        let manager = DownloadManager::new(fetcher, &session, 8192);
        let err = manager
            .download(&manifest_bytes(&path), &path, |_| {})
            .await
            .unwrap_err();

        assert!(err.is_network());
        assert!(!session.exists());
    }

    #[tokio::test]
    async fn completed_session_skips_network_entirely() {
        let dir = tempdir().unwrap();
        let session = dir.path().join("update_package");
        let (path, payloads) = chain(&[("v1", "v2", 100)]);
        let manager = DownloadManager::new(fetcher_for(&path, &payloads), &session, 8192);
        manager
            .download(&manifest_bytes(&path), &path, |_| {})
            .await
            .unwrap();
        let before = manager.fetcher.requested().len();

        manager
            .download(&manifest_bytes(&path), &path, |_| {})
            .await
            .unwrap();
        assert_eq!(manager.fetcher.requested().len(), before);
    }

    #[tokio::test]
    async fn stale_entries_are_removed_before_downloading() {
        let dir = tempdir().unwrap();
        let session = dir.path().join("update_package");
        fs::create_dir_all(session.join("extracted")).unwrap();
        fs::write(session.join("update-v0-to-v1.zip"), b"old attempt").unwrap();

        let (path, payloads) = chain(&[("v1", "v2", 10)]);
        let manager = DownloadManager::new(fetcher_for(&path, &payloads), &session, 8192);
        manager
            .download(&manifest_bytes(&path), &path, |_| {})
            .await
            .unwrap();

        assert!(!session.join("update-v0-to-v1.zip").exists());
        assert!(!session.join("extracted").exists());
        assert!(session.join(HANDOFF_FILE).is_file());
    }

    #[tokio::test]
    async fn stalled_body_times_out_and_removes_session() {
        let dir = tempdir().unwrap();
        let session = dir.path().join("update_package");
        let (path, payloads) = chain(&[("v1", "v2", 4000)]);
        let mut fetcher = fetcher_for(&path, &payloads);
        fetcher.stall_after("update-v1-to-v2.zip", 1000);

        let manager = DownloadManager::new(fetcher, &session, 8192)
            .read_timeout(Duration::from_millis(100));
        let mut last = None;
        let err = manager
            .download(&manifest_bytes(&path), &path, |p| last = Some(p))
            .await
            .unwrap_err();

        assert!(matches!(err, UpdaterError::Timeout(_)));
        assert_eq!(last.unwrap().received, 1000);
        assert!(!session.exists());
    }

    #[tokio::test]
    async fn package_names_outside_the_session_are_refused() {
        let dir = tempdir().unwrap();
        let session = dir.path().join("update_package");
        let (mut path, payloads) = chain(&[("v1", "v2", 5)]);
        path.steps[0].package.file = "../escaped.zip".into();
        let manager = DownloadManager::new(fetcher_for(&path, &payloads), &session, 8192);

        let err = manager
            .download(&manifest_bytes(&path), &path, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, UpdaterError::Manifest(_)));
        assert!(!dir.path().join("escaped.zip").exists());
        assert!(manager.fetcher.requested().is_empty());
        assert!(!session.exists());
    }
}
