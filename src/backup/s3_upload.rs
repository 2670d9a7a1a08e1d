// plexbackup/src/backup/s3_upload.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::Region;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart, Object};
use std::future::Future;
use std::time::Instant;
use tokio::io::AsyncReadExt;

use super::store::{ObjectStore, UploadBody};
use super::types::RemoteObjectRef;
use crate::config::StorageConfig;

// The next part is read while the previous one uploads, so at most two parts
// are held in memory. S3 caps uploads at 10,000 parts (~160 GiB).
const PART_SIZE: usize = 16 * 1024 * 1024;

/// S3 (or S3-compatible) bucket access.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: s3::Client,
}

impl S3Store {
    pub async fn from_config(storage: &StorageConfig) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(storage.region.clone()))
            .use_dual_stack(storage.dual_stack);
        if let Some(endpoint) = &storage.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let Some((key_id, secret)) = storage.static_credentials() {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                key_id,
                secret,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(storage.force_path_style)
            .build();
        S3Store { client: s3::Client::from_conf(s3_config) }
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        part: Vec<u8>,
    ) -> Result<CompletedPart> {
        let uploaded = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(part))
            .send()
            .await
            .with_context(|| format!("Failed to upload part {} of {}", part_number, key))?;
        let etag = uploaded
            .e_tag()
            .with_context(|| format!("No ETag returned for part {}", part_number))?
            .to_string();
        Ok(CompletedPart::builder()
            .part_number(part_number)
            .e_tag(etag)
            .build())
    }

    /// Uploads `first` and the rest of `body` as parts, then completes the
    /// upload. Returns the bytes sent and the part count.
    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        body: &mut UploadBody,
    ) -> Result<(u64, usize)> {
        let (parts, total) = pump_parts(body, first, PART_SIZE, |part_number, part| {
            self.upload_part(bucket, key, upload_id, part_number, part)
        })
        .await?;
        let count = parts.len();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .with_context(|| format!("Failed to complete multipart upload of {}", key))?;

        Ok((total, count))
    }
}

/// Hands `first` and every following part of `body` to `upload`, reading
/// part N+1 while part N is in flight. A part shorter than `part_size` ends
/// the stream.
async fn pump_parts<F, Fut>(
    body: &mut UploadBody,
    first: Vec<u8>,
    part_size: usize,
    mut upload: F,
) -> Result<(Vec<CompletedPart>, u64)>
where
    F: FnMut(i32, Vec<u8>) -> Fut,
    Fut: Future<Output = Result<CompletedPart>>,
{
    let mut parts = Vec::new();
    let mut total = 0u64;
    let mut part_number: i32 = 1;
    let mut part = first;

    loop {
        let len = part.len();
        total += len as u64;
        let in_flight = upload(part_number, part);
        let next = if len < part_size {
            parts.push(in_flight.await?);
            Vec::new()
        } else {
            let read_next = async {
                read_part(body, part_size)
                    .await
                    .context("Failed to read backup stream")
            };
            let (completed, next) = tokio::try_join!(in_flight, read_next)?;
            parts.push(completed);
            next
        };

        if next.is_empty() {
            break;
        }
        part = next;
        part_number += 1;
    }
    Ok((parts, total))
}

/// Fills one part from `body`; shorter than `part_size` only at end of stream.
async fn read_part(body: &mut UploadBody, part_size: usize) -> std::io::Result<Vec<u8>> {
    let mut part = Vec::with_capacity(part_size);
    body.take(part_size as u64).read_to_end(&mut part).await?;
    Ok(part)
}

fn to_remote_ref(object: &Object) -> Option<RemoteObjectRef> {
    let key = object.key()?;
    let modified = object.last_modified()?;
    let last_modified = DateTime::<Utc>::from_timestamp(modified.secs(), modified.subsec_nanos())?;
    Some(RemoteObjectRef { key: key.to_string(), last_modified })
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObjectRef>> {
        let listing = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .send()
            .await
            .with_context(|| format!("Failed to list objects in bucket {}", bucket))?;

        if listing.is_truncated().unwrap_or(false) {
            tracing::warn!(bucket, prefix, "listing truncated; older backups beyond the first page are not considered");
        }
        Ok(listing.contents().iter().filter_map(to_remote_ref).collect())
    }

    async fn put_object_stream(&self, bucket: &str, key: &str, mut body: UploadBody) -> Result<()> {
        let start = Instant::now();

        // Nothing is created remotely until the pipeline has produced a full
        // part or finished, so an early failure leaves the bucket untouched.
        let first = read_part(&mut body, PART_SIZE).await.context("Failed to read backup stream")?;

        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to create multipart upload of {}", key))?;
        let upload_id = created
            .upload_id()
            .context("No upload ID returned from S3")?
            .to_string();

        match self.upload_parts(bucket, key, &upload_id, first, &mut body).await {
            Ok((size_bytes, parts)) => {
                tracing::info!(
                    bucket,
                    key,
                    size_bytes,
                    parts,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "multipart stream upload successful"
                );
                Ok(())
            }
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!(bucket, key, error = %message, "multipart upload failed, aborting");
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(bucket, key, error = %abort_err, "failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to delete s3://{}/{}", bucket, key))?;
        Ok(())
    }
}
