use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::paths::sidecar_path;
use crate::{db, AppError, AppResult};

/// Appended to a backup's file name to locate its sidecar manifest.
pub const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Per-backup sidecar record. The catalog prefers this over parsing
/// timestamps out of file names; the checksum gates restores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub app_version: String,
    pub db_version: i64,
    pub db_size_bytes: u64,
    pub created_at: String,
    pub sha256: String,
    #[serde(default)]
    pub wal_included: bool,
    #[serde(default)]
    pub shm_included: bool,
}

pub fn manifest_path_for(backup: &Path) -> PathBuf {
    sidecar_path(backup, MANIFEST_SUFFIX)
}

pub fn read_manifest(path: &Path) -> Result<BackupManifest> {
    let mut file =
        File::open(path).with_context(|| format!("open manifest file: {}", path.display()))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let manifest: BackupManifest = serde_json::from_slice(&buf)
        .with_context(|| format!("parse manifest file: {}", path.display()))?;
    Ok(manifest)
}

pub fn write_manifest(path: &Path, manifest: &BackupManifest) -> AppResult<()> {
    let payload = serde_json::to_vec_pretty(manifest)
        .map_err(|err| AppError::from(err).with_context("operation", "serialize_manifest"))?;
    db::write_atomic(path, &payload).map_err(|err| {
        err.with_context("operation", "write_manifest")
            .with_context("path", path.display().to_string())
    })
}

/// Streaming SHA-256 of a file's full contents, hex encoded.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("open file for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
