pub(crate) mod archive;
pub(crate) mod compress;
pub(crate) mod counting;
mod logic;
pub(crate) mod retention;
pub(crate) mod s3_upload;
pub(crate) mod service;
pub(crate) mod store;
pub(crate) mod types;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::errors::Result;
use logic::BackupOrchestrator;
use s3_upload::S3Store;
use service::Systemctl;
use types::BackupReport;

/// Public entry point for the backup process.
/// Wires the S3 store and systemd controller from the configuration and runs one backup.
pub async fn run_backup_flow(app_config: &AppConfig, cancel: &CancellationToken) -> Result<BackupReport> {
    let store = S3Store::from_config(&app_config.storage).await;
    let services = Systemctl::new(app_config.use_sudo);

    BackupOrchestrator::new(Arc::new(store), Arc::new(services))
        .with_archiver(app_config.archiver.clone())
        .run(&app_config.request, cancel)
        .await
}
