// plexbackup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::backup::types::{BackupRequest, CompressionFormat};

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_PREFIX: &str = "plex/";
const DEFAULT_SERVICE: &str = "plexmediaserver.service";
const DEFAULT_DIRECTORY: &str = "/var/lib/plexmediaserver/Library/Application Support/Plex Media Server";
const DEFAULT_ARCHIVER: &str = "tar";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub prefix: Option<String>,
    pub no_pause: Option<bool>,
    pub service: Option<String>,
    pub directory: Option<PathBuf>,
    pub compression: Option<CompressionFormat>,
    pub archiver: Option<PathBuf>,
    pub use_sudo: Option<bool>,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub dual_stack: Option<bool>,
    pub force_path_style: Option<bool>,
    pub debug: Option<bool>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub dual_stack: bool,
    pub force_path_style: bool,
}

impl StorageConfig {
    /// Key pair from the config file, used only when both halves are present.
    /// Otherwise the default AWS provider chain applies.
    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        match (self.access_key_id.as_deref(), self.secret_access_key.as_deref()) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Some((id, secret)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub request: BackupRequest,
    pub storage: StorageConfig,
    pub archiver: PathBuf,
    pub use_sudo: bool,
    pub debug: bool,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let bucket = raw
            .bucket
            .filter(|b| !b.trim().is_empty())
            .context("bucket name must be specified")?;

        let request = BackupRequest {
            no_pause: raw.no_pause.unwrap_or(false),
            service: non_empty_or(raw.service, DEFAULT_SERVICE),
            directory: raw
                .directory
                .filter(|d| !d.as_os_str().is_empty())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DIRECTORY)),
            bucket,
            // An explicitly empty prefix is allowed and means the bucket root.
            prefix: raw.prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            compression: raw.compression.unwrap_or_default(),
        };

        let storage = StorageConfig {
            region: non_empty_or(raw.region, DEFAULT_REGION),
            endpoint_url: raw.endpoint_url.filter(|s| !s.is_empty()),
            access_key_id: raw.access_key_id,
            secret_access_key: raw.secret_access_key,
            dual_stack: raw.dual_stack.unwrap_or(true),
            force_path_style: raw.force_path_style.unwrap_or(false),
        };
        Ok(AppConfig {
            request,
            storage,
            archiver: raw
                .archiver
                .filter(|a| !a.as_os_str().is_empty())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ARCHIVER)),
            use_sudo: raw.use_sudo.unwrap_or(true),
            debug: raw.debug.unwrap_or(false),
        })
    }
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    value
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}
