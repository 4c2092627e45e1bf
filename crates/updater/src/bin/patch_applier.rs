//! Standalone applier process.
//!
//! Started by the application right before it exits:
//! `patch-applier <session_dir> <install_dir>`. Applies the downloaded chain,
//! then relaunches the main executable. See `updater::handoff` for the
//! directory contract and exit codes.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};
use updater::{DetachedLauncher, ExitCode, PatchApplier, UpdaterConfig};

/// Optional settings file looked up in the install directory.
const CONFIG_FILE: &str = "updater.json";

/// Apply a downloaded update to an installation
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Session directory holding manifest.json and the package archives
    session_dir: PathBuf,

    /// Directory the application is installed in
    install_dir: PathBuf,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            let code = if err.use_stderr() {
                ExitCode::Usage
            } else {
                ExitCode::Success
            };
            std::process::exit(code.code());
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,updater=info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let config_path = args.install_dir.join(CONFIG_FILE);
    let config = if config_path.is_file() {
        match UpdaterConfig::load(&config_path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring unreadable {}", CONFIG_FILE);
                UpdaterConfig::default()
            }
        }
    } else {
        UpdaterConfig::default()
    };

    let launcher = DetachedLauncher;
    let applier = PatchApplier::new(&args.session_dir, &args.install_dir, &launcher)
        .main_executable(config.main_executable.as_str())
        .version_file(config.version_file.as_str());

    match applier.run() {
        Ok(report) => {
            tracing::info!(
                from = %report.from_version,
                to = %report.target_version,
                steps = report.steps,
                "update applied"
            );
        }
        Err(err) => {
            let code = ExitCode::for_error(&err);
            tracing::error!(error = %err, code = code.code(), "update failed");
            eprintln!("Update failed: {err}");
            std::process::exit(code.code());
        }
    }
}
