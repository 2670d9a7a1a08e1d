// plexbackup/src/backup/logic.rs
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::archive::{ArchivePipeline, PipelineError, PipelineRun};
use super::compress::Compressor;
use super::retention::find_oldest;
use super::service::ServiceController;
use super::store::ObjectStore;
use super::types::{
    BackupObjectKey, BackupReport, BackupRequest, CompressionFormat, PipelineResult, PruneOutcome,
    RemoteObjectRef,
};
use crate::errors::{BackupError, Result};

/// Where a run currently is. Only used for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    LookupOldest,
    Paused,
    SkipPause,
    Pipelining,
    Resuming,
    PruningOldest,
    Done,
    Aborted,
}

fn enter(state: RunState) {
    tracing::debug!(state = ?state, "backup run state");
}

/// Sequences one backup: find the previous backup, pause the service, stream
/// the new backup, resume the service, then delete the previous backup.
pub struct BackupOrchestrator {
    store: Arc<dyn ObjectStore>,
    services: Arc<dyn ServiceController>,
    archiver: PathBuf,
    compressor: Option<Compressor>,
}

impl BackupOrchestrator {
    pub fn new(store: Arc<dyn ObjectStore>, services: Arc<dyn ServiceController>) -> Self {
        BackupOrchestrator {
            store,
            services,
            archiver: PathBuf::from("tar"),
            compressor: None,
        }
    }

    pub fn with_archiver(mut self, archiver: impl Into<PathBuf>) -> Self {
        self.archiver = archiver.into();
        self
    }

    /// Pins the compressor instead of probing the host on every run.
    #[cfg(test)]
    pub fn with_compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = Some(compressor);
        self
    }

    fn pipeline(&self, format: CompressionFormat) -> ArchivePipeline {
        let compressor = self
            .compressor
            .clone()
            .unwrap_or_else(|| Compressor::detect(format));
        ArchivePipeline::new(self.archiver.clone(), compressor)
    }

    /// Performs one backup run. If the service was stopped, it is started again
    /// whatever happens afterwards, so an `Ok` means the service is running.
    pub async fn run(&self, request: &BackupRequest, cancel: &CancellationToken) -> Result<BackupReport> {
        enter(RunState::LookupOldest);
        let oldest = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackupError::Cancelled),
            found = find_oldest(self.store.as_ref(), &request.bucket, &request.prefix) => {
                found.map_err(|e| {
                    enter(RunState::Aborted);
                    BackupError::Lookup(e)
                })?
            }
        };
        if let Some(oldest) = &oldest {
            tracing::info!(key = %oldest.key, last_modified = %oldest.last_modified, "found previous backup");
        }

        let paused = !request.no_pause;
        if paused {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // The stop may have taken effect before it was interrupted.
                    tracing::warn!(service = %request.service, "cancelled while stopping service");
                    enter(RunState::Resuming);
                    let err = match self.services.start(&request.service).await {
                        Ok(()) => BackupError::Cancelled,
                        Err(resume) => BackupError::Cancelled.with_resume_failure(&request.service, resume),
                    };
                    enter(RunState::Aborted);
                    return Err(err);
                }
                stopped = self.services.stop(&request.service) => {
                    if let Err(source) = stopped {
                        enter(RunState::Aborted);
                        return Err(BackupError::Pause { service: request.service.clone(), source });
                    }
                }
            }
            enter(RunState::Paused);
        } else {
            enter(RunState::SkipPause);
        }

        enter(RunState::Pipelining);
        let pipeline = self.pipeline(request.compression);
        let key = BackupObjectKey::generate(&request.prefix, Utc::now(), pipeline.format());
        let backup = self.stream_backup(&pipeline, request, &key, cancel).await;

        // Resume regardless of how the backup went; a failure here is reported
        // next to, never instead of, a backup failure.
        let resume = if paused {
            enter(RunState::Resuming);
            self.services.start(&request.service).await
        } else {
            Ok(())
        };

        // The previous backup goes only once the new one is safely stored,
        // even if the service failed to come back.
        let backup = match backup {
            Ok(pipeline) => {
                enter(RunState::PruningOldest);
                let prune = self.prune(&request.bucket, oldest, &key, cancel).await;
                Ok(BackupReport { key, pipeline, prune })
            }
            Err(e) => Err(e),
        };

        let outcome = match (backup, resume) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(source)) => Err(BackupError::Resume { service: request.service.clone(), source }),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(resume)) => Err(e.with_resume_failure(&request.service, resume)),
        };
        enter(if outcome.is_ok() { RunState::Done } else { RunState::Aborted });
        outcome
    }

    /// Runs the pipeline and the upload together until both finish.
    async fn stream_backup(
        &self,
        pipeline: &ArchivePipeline,
        request: &BackupRequest,
        key: &BackupObjectKey,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        tracing::info!(
            key = %key,
            directory = %request.directory.display(),
            compressor = %pipeline.compressor().describe(),
            "starting backup"
        );
        let start = Instant::now();

        let PipelineRun { output, producer } = pipeline.start(&request.directory);
        let compressed = output.counter();
        let upload = self
            .store
            .put_object_stream(&request.bucket, key.as_str(), Box::pin(output));

        // Dropping both futures on cancellation kills tar and the compressor
        // and abandons the in-flight request.
        let (produced, uploaded) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(key = %key, "backup cancelled");
                return Err(BackupError::Cancelled);
            }
            results = async { tokio::join!(producer, upload) } => results,
        };

        let uncompressed_bytes = match (produced, uploaded) {
            (Ok(n), Ok(())) => n,
            (Ok(_), Err(e)) | (Err(PipelineError::ConsumerClosed), Err(e)) => {
                return Err(BackupError::Upload(e));
            }
            (Err(e), _) => return Err(BackupError::Pipeline(e)),
        };

        let result = PipelineResult {
            uncompressed_bytes,
            compressed_bytes: compressed.get(),
            elapsed: start.elapsed(),
        };
        tracing::info!(
            key = %key,
            compressed_gib = format!("{:.3}", result.compressed_gib()),
            uncompressed_bytes = result.uncompressed_bytes,
            compressed_bytes = result.compressed_bytes,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "backed up"
        );
        Ok(result)
    }

    /// Best-effort removal of the previous backup. Never fails the run.
    async fn prune(
        &self,
        bucket: &str,
        oldest: Option<RemoteObjectRef>,
        written: &BackupObjectKey,
        cancel: &CancellationToken,
    ) -> PruneOutcome {
        let Some(oldest) = oldest else {
            return PruneOutcome::NothingToPrune;
        };
        // A rerun within the same second writes to the old key; deleting it
        // would remove the backup just made.
        if oldest.key == written.as_str() {
            tracing::warn!(key = %oldest.key, "previous backup was overwritten in place, not deleting");
            return PruneOutcome::NothingToPrune;
        }

        let deleted = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(anyhow::anyhow!("delete cancelled")),
            deleted = self.store.delete_object(bucket, &oldest.key) => deleted,
        };
        match deleted {
            Ok(()) => {
                tracing::info!(key = %oldest.key, "deleted previous backup");
                PruneOutcome::Deleted(oldest.key)
            }
            Err(e) => {
                let error = format!("{:#}", e);
                tracing::warn!(key = %oldest.key, error = %error, "failed to delete previous backup");
                PruneOutcome::Failed { key: oldest.key, error }
            }
        }
    }
}
