use thiserror::Error;

use crate::backup::archive::PipelineError;

/// Failure of a single backup run, tagged by the step that failed.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("failed to retrieve oldest backup: {0:#}")]
    Lookup(#[source] anyhow::Error),

    #[error("failed to stop {service}: {source:#}")]
    Pause {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("backup pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("failed to upload new backup: {0:#}")]
    Upload(#[source] anyhow::Error),

    #[error("backup cancelled")]
    Cancelled,

    #[error("resume failed: failed to start {service}: {source:#}")]
    Resume {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    // The backup error stays the primary cause; the resume failure rides along.
    #[error("{backup}; resume failed: failed to start {service}: {resume:#}")]
    ResumeAfterFailure {
        backup: Box<BackupError>,
        service: String,
        resume: anyhow::Error,
    },
}

impl BackupError {
    /// Attaches a failed resume to an earlier failure without hiding either.
    pub fn with_resume_failure(self, service: &str, resume: anyhow::Error) -> Self {
        BackupError::ResumeAfterFailure {
            backup: Box::new(self),
            service: service.to_string(),
            resume,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
