// plexbackup/src/backup/retention.rs
use anyhow::{Context, Result};

use super::store::ObjectStore;
use super::types::RemoteObjectRef;

/// Returns the object with the oldest last-modified time under `prefix`, or
/// `None` if there is nothing there.
///
/// Only the first listing page is inspected (at most 1000 objects on S3). With
/// one backup kept per prefix this is never reached; anything beyond the first
/// page is invisible to pruning.
pub async fn find_oldest(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
) -> Result<Option<RemoteObjectRef>> {
    let objects = store
        .list_objects(bucket, prefix)
        .await
        .with_context(|| format!("Failed to list s3://{}/{}", bucket, prefix))?;

    tracing::debug!(bucket, prefix, count = objects.len(), "listed existing backups");

    // Strictly-older comparison keeps the first of equally old objects.
    let oldest = objects.into_iter().fold(None, |oldest: Option<RemoteObjectRef>, object| {
        match oldest {
            Some(current) if current.last_modified <= object.last_modified => Some(current),
            _ => Some(object),
        }
    });
    Ok(oldest)
}
