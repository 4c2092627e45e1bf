use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;
use updater::manifest::{build_file_manifest, MASTER_MANIFEST_FILE};
use updater::{
    AssetStream, BuilderConfig, DirectoryExecutableSource, ManifestBuilder, MasterManifest,
    MemorySettings, PatchApplier, ProcessLauncher, ReleaseFetcher, Result, SemverOrder,
    UpdateRequester, UpdaterConfig, UpdaterError,
};

const VERSIONS: [&str; 3] = ["v1.0.0", "v1.1.0", "v1.2.0"];

/// Serves every asset from one release output directory.
struct DirectoryFetcher {
    root: PathBuf,
    latest: String,
}

impl DirectoryFetcher {
    fn read(&self, file: &str) -> Result<Vec<u8>> {
        fs::read(self.root.join(file)).map_err(|_| UpdaterError::HttpStatus {
            status: 404,
            url: file.to_string(),
        })
    }
}

#[async_trait]
impl ReleaseFetcher for DirectoryFetcher {
    async fn latest_tag(&self) -> Result<Option<String>> {
        Ok(Some(self.latest.clone()))
    }

    async fn fetch_bytes(&self, _tag: &str, file: &str) -> Result<Vec<u8>> {
        self.read(file)
    }

    async fn open_stream(&self, _tag: &str, file: &str, offset: u64) -> Result<AssetStream> {
        let data = self.read(file)?;
        let chunks: Vec<Result<Bytes>> = data[offset as usize..]
            .chunks(4096)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(AssetStream {
            offset,
            body: stream::iter(chunks).boxed(),
        })
    }
}

#[derive(Default)]
struct RecordingLauncher {
    launched: Mutex<Vec<PathBuf>>,
}

impl ProcessLauncher for RecordingLauncher {
    fn launch(&self, executable: &Path, _args: &[&OsStr], _working_dir: &Path) -> io::Result<()> {
        self.launched.lock().unwrap().push(executable.to_path_buf());
        Ok(())
    }
}

fn executable(release: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_4f6c_dd1d_u64;
    let mut data: Vec<u8> = (0..60_000)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect();
    for r in 0..release {
        let at = 10_000 * (r + 1);
        data[at..at + 32].fill(r as u8 + 1);
        data.extend_from_slice(format!("build {r}").as_bytes());
    }
    data
}

fn write_build(root: &Path, release: usize) {
    fs::create_dir_all(root.join("data")).unwrap();
    fs::create_dir_all(root.join("torch")).unwrap();
    fs::write(root.join("main.exe"), executable(release)).unwrap();
    fs::write(root.join("data/shared.txt"), b"never changes").unwrap();
    fs::write(root.join("torch/model.bin"), b"vendored, never packaged").unwrap();
    if release == 0 {
        fs::write(root.join("data/legacy.txt"), b"dropped in 1.1").unwrap();
    } else {
        fs::write(root.join("data/notes.txt"), format!("notes for {release}")).unwrap();
    }
}

fn copy_tree(from: &Path, to: &Path) {
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry.unwrap();
        let target = to.join(entry.path().strip_prefix(from).unwrap());
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).unwrap();
        } else {
            fs::copy(entry.path(), &target).unwrap();
        }
    }
}

#[tokio::test]
async fn published_releases_update_an_old_install() {
    let dir = tempdir().unwrap();
    let builds = dir.path().join("builds");
    let release = dir.path().join("release");

    let mut manifest = MasterManifest::default();
    let old_executables = DirectoryExecutableSource::new(&builds, "main.exe");
    for (index, version) in VERSIONS.iter().enumerate() {
        write_build(&builds.join(version), index);
        let mut config = BuilderConfig::new(builds.join(version), *version);
        config.output_dir = release.clone();
        config.hop_interval = 2;
        let report = ManifestBuilder::new(config, &old_executables, &SemverOrder)
            .build(&mut manifest)
            .unwrap();
        assert_eq!(report.package_created(), index > 0);
    }
    manifest.save(&release.join(MASTER_MANIFEST_FILE)).unwrap();
    assert_eq!(manifest.packages["v1.2.0"].len(), 2);
    assert!(manifest.packages["v1.1.0"][0].patch.is_some());
    assert!(!manifest.versions["v1.0.0"].contains_key("torch/model.bin"));

    let install = dir.path().join("install");
    copy_tree(&builds.join("v1.0.0"), &install);
    fs::create_dir_all(install.join("updater")).unwrap();
    fs::write(install.join("APPVERSION"), "v1.0.0").unwrap();

    let config = UpdaterConfig {
        repo: "owner/app".into(),
        install_dir: install.clone(),
        session_dir: dir.path().join("tmp/update_package"),
        ..UpdaterConfig::default()
    };
    let fetcher = Arc::new(DirectoryFetcher {
        root: release.clone(),
        latest: "v1.2.0".into(),
    });
    let (requester, _events) =
        UpdateRequester::new(config.clone(), fetcher, Arc::new(MemorySettings::default()));
    let session = requester.download().await.unwrap().expect("update available");
    assert_eq!(requester.existing_download(), Some(session.clone()));

    let launcher = RecordingLauncher::default();
    let report = PatchApplier::new(&session, &install, &launcher)
        .run()
        .unwrap();
    assert_eq!(report.target_version, "v1.2.0");

    let mut installed = build_file_manifest(&install, Some("torch/")).unwrap();
    installed.remove("APPVERSION");
    assert_eq!(installed, manifest.versions["v1.2.0"]);
    assert_eq!(fs::read(install.join("main.exe")).unwrap(), executable(2));
    assert!(install.join("torch/model.bin").is_file());
    assert!(!install.join("data/legacy.txt").exists());
    assert_eq!(fs::read_to_string(install.join("APPVERSION")).unwrap(), "v1.2.0");
    assert!(!session.exists());
    assert_eq!(*launcher.launched.lock().unwrap(), vec![install.join("main.exe")]);
}
