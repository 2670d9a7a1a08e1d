// plexbackup/src/backup/store.rs
use anyhow::Result;
use async_trait::async_trait;
use std::pin::Pin;
use tokio::io::AsyncRead;

use super::types::RemoteObjectRef;

/// Upload body of unknown length, produced while it is being read.
pub type UploadBody = Pin<Box<dyn AsyncRead + Send>>;

/// The bucket operations a backup run needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists a single page of objects under `prefix`. No continuation is followed.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObjectRef>>;

    /// Streams `body` to `key` until EOF. An error read from `body` must fail the
    /// upload and leave no object behind.
    async fn put_object_stream(&self, bucket: &str, key: &str, body: UploadBody) -> Result<()>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;
}
