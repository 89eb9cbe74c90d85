//! Atomic JSON persistence of the whole registry.
//!
//! Single file `{config_dir}/certificates.json`. A parse failure quarantines
//! the corrupt file (copy, never delete) and starts empty; discovery then
//! rebuilds the registry from the filesystem.

use chrono::{DateTime, Utc};
use ck_common::{EngineError, EngineResult, fs as ckfs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{error, info};

use crate::entity::CertificateEntity;

pub const METADATA_FILE: &str = "certificates.json";
const FORMAT_VERSION: u32 = 1;

/// On-disk shape of the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryFile {
    pub version: u32,
    pub last_update: DateTime<Utc>,
    pub certificates: BTreeMap<String, CertificateEntity>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            last_update: Utc::now(),
            certificates: BTreeMap::new(),
        }
    }
}

pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(METADATA_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// mtime of the metadata file, if it exists.
    pub fn mtime(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    /// Load the registry. Absent or empty file yields an empty registry;
    /// a corrupt file is quarantined and an empty registry returned.
    pub fn load(&self) -> EngineResult<RegistryFile> {
        if !self.path.exists() {
            return Ok(RegistryFile::default());
        }

        let content = ckfs::retry_io(|| fs::read_to_string(&self.path))?;
        if content.trim().is_empty() {
            return Ok(RegistryFile::default());
        }

        match serde_json::from_str::<RegistryFile>(&content) {
            Ok(file) => Ok(file),
            Err(parse_err) => {
                let quarantine = self
                    .path
                    .with_file_name(format!("{METADATA_FILE}.corrupt-{}", ckfs::now_millis()));
                match fs::copy(&self.path, &quarantine) {
                    Ok(_) => error!(
                        quarantine = %quarantine.display(),
                        error = %parse_err,
                        "metadata file corrupt, quarantined copy written; starting empty"
                    ),
                    Err(copy_err) => error!(
                        error = %parse_err,
                        copy_error = %copy_err,
                        "metadata file corrupt and quarantine copy failed; starting empty"
                    ),
                }
                Ok(RegistryFile::default())
            }
        }
    }

    /// Serialize with stable key ordering (maps are sorted, field order is
    /// fixed). Kept separate from [`MetadataStore::commit`] so callers can
    /// serialize outside their registry lock.
    pub fn serialize(file: &RegistryFile) -> EngineResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(file)?)
    }

    /// Write pre-serialized bytes: tmp file, fsync, rename (direct-write
    /// fallback inside [`ckfs::write_atomic`]).
    pub fn commit(&self, bytes: &[u8]) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        ckfs::write_atomic(&self.path, bytes)?;
        Ok(())
    }

    /// Serialize-and-commit convenience for callers without concurrency
    /// concerns.
    pub fn save(&self, file: &RegistryFile) -> EngineResult<()> {
        let bytes = Self::serialize(file)?;
        self.commit(&bytes)?;
        info!(
            certificates = file.certificates.len(),
            path = %self.path.display(),
            "registry metadata saved"
        );
        Ok(())
    }
}
