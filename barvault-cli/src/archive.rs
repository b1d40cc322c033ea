//! Archive hand-off for finished record files.
//!
//! Files are keyed `{asset_type}/{ticker}/{source}/{timeframe}/{YYYY}/{MM}/{DD}/{HH}`
//! and carry a small tag set. The directory archiver mirrors that layout on
//! local disk:
//! - Atomic copies (write to .tmp, rename into place)
//! - A `.meta.json` sidecar with the tags and a BLAKE3 digest of the file

use anyhow::{Context, Result};
use barvault_core::fetch::InstrumentMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Object key for one archived file.
pub fn object_key(
    metadata: &InstrumentMetadata,
    ticker: &str,
    source: &str,
    timeframe: &str,
    at: DateTime<Utc>,
) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        metadata.asset_type,
        ticker,
        source,
        timeframe,
        at.format("%Y/%m/%d/%H")
    )
}

/// Tags attached to an archived file.
pub fn object_tags(
    metadata: &InstrumentMetadata,
    ticker: &str,
    source: &str,
    timeframe: &str,
    quality: &str,
) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert("symbol".to_string(), ticker.to_string());
    tags.insert("source".to_string(), source.to_string());
    tags.insert("timeframe".to_string(), timeframe.to_string());
    tags.insert("quality".to_string(), quality.to_string());
    if !metadata.name.is_empty() {
        tags.insert("name".to_string(), metadata.name.clone());
    }
    tags
}

/// Destination for finished record files.
pub trait Archiver {
    /// Store `file` under `key`; returns where it ended up.
    fn archive(&self, file: &Path, key: &str, tags: &BTreeMap<String, String>) -> Result<PathBuf>;
}

/// Sidecar written next to every archived file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMeta {
    pub key: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub blake3: String,
    pub tags: BTreeMap<String, String>,
    pub archived_at: DateTime<Utc>,
}

/// Archiver that mirrors the object layout under a local root directory.
pub struct DirectoryArchiver {
    root: PathBuf,
}

impl DirectoryArchiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn sidecar_path(target: &Path) -> PathBuf {
        let mut name = target.as_os_str().to_owned();
        name.push(".meta.json");
        PathBuf::from(name)
    }
}

impl Archiver for DirectoryArchiver {
    fn archive(&self, file: &Path, key: &str, tags: &BTreeMap<String, String>) -> Result<PathBuf> {
        let file_name = file
            .file_name()
            .with_context(|| format!("{} has no file name", file.display()))?;
        let dir = self.root.join(key);
        fs::create_dir_all(&dir)
            .with_context(|| format!("create archive directory {}", dir.display()))?;

        let target = dir.join(file_name);
        let tmp = target.with_extension("tmp");
        fs::copy(file, &tmp)
            .with_context(|| format!("copy {} into archive", file.display()))?;
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("atomic rename to {}", target.display()));
        }

        let bytes = fs::read(&target)
            .with_context(|| format!("read back {}", target.display()))?;
        let meta = ArchiveMeta {
            key: key.to_string(),
            file_name: file_name.to_string_lossy().into_owned(),
            size_bytes: bytes.len() as u64,
            blake3: blake3::hash(&bytes).to_hex().to_string(),
            tags: tags.clone(),
            archived_at: Utc::now(),
        };
        let sidecar = Self::sidecar_path(&target);
        fs::write(&sidecar, serde_json::to_string_pretty(&meta)?)
            .with_context(|| format!("write {}", sidecar.display()))?;

        Ok(target)
    }
}
