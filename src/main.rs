//! Plex Media Server Backup Tool
//!
//! Streams the Plex data directory into a compressed archive on S3 and
//! removes the previous backup once the new one is stored.

// plexbackup/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

use anyhow::{Context, Result};
use config::AppConfig;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use utils::version::build_info;

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if wants_version(&args) {
        println!("{}", build_info().summary());
        return ExitCode::SUCCESS;
    }

    match run_app(&args).await {
        Ok(_) => {
            println!("✅ Backup completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn wants_version(args: &[String]) -> bool {
    args.iter().skip(1).any(|a| a == "--version" || a == "-V")
}

async fn run_app(args: &[String]) -> Result<()> {
    // The config path is the first argument, falling back to config.json in
    // the working directory.
    let config_path = args
        .get(1)
        .map(|a| PathBuf::from(a.trim()))
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let app_config = AppConfig::load_from_json(&config_path)
        .with_context(|| format!("Failed to load application configuration from {}", config_path.display()))?;

    utils::logging::init_tracing(app_config.debug);
    tracing::info!(
        build = %build_info().summary(),
        bucket = %app_config.request.bucket,
        prefix = %app_config.request.prefix,
        directory = %app_config.request.directory.display(),
        "starting Plex backup"
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling backup");
            on_signal.cancel();
        }
    });

    let report = backup::run_backup_flow(&app_config, &cancel)
        .await
        .context("Backup process failed")?;
    tracing::info!(
        key = %report.key,
        uncompressed_bytes = report.pipeline.uncompressed_bytes,
        compressed_bytes = report.pipeline.compressed_bytes,
        elapsed_ms = report.pipeline.elapsed.as_millis() as u64,
        prune = ?report.prune,
        "{}",
        report.summary()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_version_flag() {
        assert!(wants_version(&args(&["plexbackup", "--version"])));
        assert!(wants_version(&args(&["plexbackup", "-V"])));
        assert!(!wants_version(&args(&["plexbackup", "config.json"])));
        assert!(!wants_version(&args(&["--version"])));
    }
}
