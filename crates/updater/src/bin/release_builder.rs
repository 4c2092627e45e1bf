//! Release pipeline tool: hash a build, package it against earlier versions
//! and append it to the master manifest.

use anyhow::Context;
use clap::Parser;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};
use updater::builder::{ExecutableSource, NoExecutables};
use updater::config::{DEFAULT_EXCLUDE_PREFIX, DEFAULT_MAIN_EXECUTABLE};
use updater::manifest::MASTER_MANIFEST_FILE;
use updater::{
    BuilderConfig, DirectoryExecutableSource, GitHubReleaseClient, ManifestBuilder,
    MasterManifest, ReleaseFetcher, SemverOrder, UpdaterError,
};

/// Build update packages for a new release
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory containing the freshly built application
    #[arg(long)]
    build_dir: PathBuf,

    /// Tag of the release being built
    #[arg(long)]
    new_version: String,

    /// Previous master manifest; fetched from --repo when the file is absent
    #[arg(long, default_value = MASTER_MANIFEST_FILE)]
    manifest: PathBuf,

    /// Release repository (owner/name) to fetch the previous manifest from
    #[arg(long)]
    repo: Option<String>,

    /// Directory laid out as <version>/<main executable> with earlier executables
    #[arg(long)]
    old_executables: Option<PathBuf>,

    /// Main executable, relative to the build directory
    #[arg(long, default_value = DEFAULT_MAIN_EXECUTABLE)]
    main_executable: String,

    /// Where packages and the updated manifest are written
    #[arg(long, default_value = "release")]
    output_dir: PathBuf,

    /// Build a cumulative package every this many releases
    #[arg(long, default_value_t = updater::builder::DEFAULT_HOP_INTERVAL)]
    hop_interval: usize,

    /// Path prefix excluded from hashing and packaging (empty to disable)
    #[arg(long, default_value = DEFAULT_EXCLUDE_PREFIX)]
    exclude_prefix: String,

    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug,updater=debug")
    } else {
        EnvFilter::new("info,updater=info")
    };
    fmt().with_env_filter(filter).init();

    let mut manifest = load_previous(&args.manifest, args.repo.as_deref()).await?;

    let config = BuilderConfig {
        build_dir: args.build_dir,
        new_version: args.new_version,
        output_dir: args.output_dir,
        main_executable: args.main_executable,
        exclude_prefix: Some(args.exclude_prefix).filter(|prefix| !prefix.is_empty()),
        hop_interval: args.hop_interval,
    };
    let directory_source = args
        .old_executables
        .map(|root| DirectoryExecutableSource::new(root, config.main_executable.clone()));
    let executables: &dyn ExecutableSource = match &directory_source {
        Some(source) => source,
        None => &NoExecutables,
    };

    let output_dir = config.output_dir.clone();
    let report = ManifestBuilder::new(config, executables, &SemverOrder)
        .build(&mut manifest)
        .context("failed to build release packages")?;

    let manifest_path = output_dir.join(MASTER_MANIFEST_FILE);
    manifest.save(&manifest_path)?;
    tracing::info!(
        version = %report.version,
        packages = report.packages.len(),
        manifest = %manifest_path.display(),
        "release packaged"
    );
    for archive in &report.archives {
        println!("{}", archive.display());
    }

    if let Some(output) = std::env::var_os("GITHUB_OUTPUT") {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&output)
            .with_context(|| format!("cannot open GITHUB_OUTPUT {}", Path::new(&output).display()))?;
        writeln!(file, "package_created={}", report.package_created())?;
    }
    Ok(())
}

/// Previous master manifest: local file first, then the latest release, else empty.
async fn load_previous(path: &Path, repo: Option<&str>) -> anyhow::Result<MasterManifest> {
    if path.is_file() {
        tracing::info!(path = %path.display(), "loading previous manifest");
        return Ok(MasterManifest::load(path)?);
    }
    let Some(repo) = repo else {
        tracing::info!("no previous manifest; starting a new history");
        return Ok(MasterManifest::default());
    };

    let client = GitHubReleaseClient::builder().repo(repo).build()?;
    let Some(tag) = client.latest_tag().await? else {
        tracing::info!(repo, "no published releases; starting a new history");
        return Ok(MasterManifest::default());
    };
    match client.fetch_bytes(&tag, MASTER_MANIFEST_FILE).await {
        Ok(bytes) => {
            tracing::info!(repo, tag = %tag, "fetched previous manifest");
            Ok(MasterManifest::from_slice(&bytes)?)
        }
        Err(UpdaterError::HttpStatus { status: 404, .. }) => {
            tracing::warn!(repo, tag = %tag, "latest release has no manifest; starting a new history");
            Ok(MasterManifest::default())
        }
        Err(err) => Err(err.into()),
    }
}
