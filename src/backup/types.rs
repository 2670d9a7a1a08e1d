// plexbackup/src/backup/types.rs
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Compression applied to the tar stream. Decides the key suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    #[default]
    Gzip,
    Zstd,
}

impl CompressionFormat {
    pub fn extension(self) -> &'static str {
        match self {
            CompressionFormat::Gzip => "tar.gz",
            CompressionFormat::Zstd => "tar.zst",
        }
    }
}

/// Everything a single run needs to know. Immutable once built.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    /// Skip stopping the service. The backup may then be inconsistent.
    pub no_pause: bool,
    /// systemd unit to stop and start, e.g. plexmediaserver.service.
    pub service: String,
    /// Path of the 'Plex Media Server' directory; it becomes the archive root.
    pub directory: PathBuf,
    pub bucket: String,
    /// Prepended verbatim to the timestamp; no separator is added.
    pub prefix: String,
    pub compression: CompressionFormat,
}

/// Object key of a backup: `<prefix><RFC3339 UTC>.<extension>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupObjectKey(String);

impl BackupObjectKey {
    pub fn generate(prefix: &str, at: DateTime<Utc>, format: CompressionFormat) -> Self {
        BackupObjectKey(format!(
            "{}{}.{}",
            prefix,
            at.to_rfc3339_opts(SecondsFormat::Secs, true),
            format.extension()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackupObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An object found under the backup prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObjectRef {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineResult {
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
    pub elapsed: Duration,
}

const GIBIBYTE_BYTES: f64 = 1024.0 * 1024.0 * 1024.0;

impl PipelineResult {
    pub fn compressed_gib(&self) -> f64 {
        self.compressed_bytes as f64 / GIBIBYTE_BYTES
    }
}

/// What happened to the previous backup once the new one was uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PruneOutcome {
    NothingToPrune,
    Deleted(String),
    Failed { key: String, error: String },
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub key: BackupObjectKey,
    pub pipeline: PipelineResult,
    pub prune: PruneOutcome,
}

impl BackupReport {
    /// e.g. `backed up 1.250 GiB (3.000 GiB uncompressed) to plex/…Z.tar.gz in 42.1s`
    pub fn summary(&self) -> String {
        format!(
            "backed up {:.3} GiB ({:.3} GiB uncompressed) to {} in {:.1}s",
            self.pipeline.compressed_gib(),
            self.pipeline.uncompressed_bytes as f64 / GIBIBYTE_BYTES,
            self.key,
            self.pipeline.elapsed.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_format() {
        let at = Utc.with_ymd_and_hms(2019, 1, 6, 22, 38, 21).unwrap();
        let key = BackupObjectKey::generate("plex/", at, CompressionFormat::Gzip);
        assert_eq!(key.as_str(), "plex/2019-01-06T22:38:21Z.tar.gz");

        let key = BackupObjectKey::generate("plex/newton/", at, CompressionFormat::Zstd);
        assert_eq!(key.as_str(), "plex/newton/2019-01-06T22:38:21Z.tar.zst");
    }

    #[test]
    fn test_key_has_no_separator_added() {
        let at = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let key = BackupObjectKey::generate("plex", at, CompressionFormat::Gzip);
        assert_eq!(key.to_string(), "plex2020-01-01T00:00:00Z.tar.gz");
    }

    #[test]
    fn test_keys_differ_and_sort_by_time() {
        let first = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let second = first + chrono::Duration::seconds(1);
        let a = BackupObjectKey::generate("plex/", first, CompressionFormat::Gzip);
        let b = BackupObjectKey::generate("plex/", second, CompressionFormat::Gzip);
        assert_ne!(a, b);
        assert!(a.as_str() < b.as_str());
    }

    #[test]
    fn test_sub_second_precision_is_dropped() {
        let at = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::milliseconds(750);
        let key = BackupObjectKey::generate("plex/", at, CompressionFormat::Gzip);
        assert_eq!(key.as_str(), "plex/2020-01-01T00:00:00Z.tar.gz");
    }

    #[test]
    fn test_compression_format_from_json() -> anyhow::Result<()> {
        let format: CompressionFormat = serde_json::from_str("\"zstd\"")?;
        assert_eq!(format, CompressionFormat::Zstd);
        assert_eq!(CompressionFormat::default(), CompressionFormat::Gzip);
        Ok(())
    }

    #[test]
    fn test_report_summary() {
        let at = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let report = BackupReport {
            key: BackupObjectKey::generate("plex/", at, CompressionFormat::Gzip),
            pipeline: PipelineResult {
                uncompressed_bytes: 3 * 1024 * 1024 * 1024,
                compressed_bytes: 1024 * 1024 * 1024 + 256 * 1024 * 1024,
                elapsed: Duration::from_millis(42_100),
            },
            prune: PruneOutcome::NothingToPrune,
        };
        assert_eq!(
            report.summary(),
            "backed up 1.250 GiB (3.000 GiB uncompressed) to plex/2020-01-01T00:00:00Z.tar.gz in 42.1s"
        );
    }
}
