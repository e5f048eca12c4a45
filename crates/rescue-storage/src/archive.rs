use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArchivedEntry {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Write-once JSON archive for plans and reports, addressed by content hash.
#[derive(Debug, Clone)]
pub struct AuditArchive {
    root: PathBuf,
}

impl AuditArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn entry_relative_path(&self, org_id: &str, kind: &str, content_hash: &str) -> PathBuf {
        let org = if org_id.trim().is_empty() { "_all" } else { org_id.trim() };
        PathBuf::from(org).join(kind).join(format!("{content_hash}.json"))
    }

    /// Serialize `value` as pretty JSON and store it under `{org}/{kind}/{sha256}.json`.
    /// Identical content lands on the same path and is not rewritten.
    pub async fn store_json<T: Serialize>(
        &self,
        org_id: &str,
        kind: &str,
        value: &T,
    ) -> anyhow::Result<ArchivedEntry> {
        let mut bytes = serde_json::to_vec_pretty(value).context("serializing archive entry")?;
        bytes.push(b'\n');
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path = self.entry_relative_path(org_id, kind, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let entry = |deduplicated| ArchivedEntry {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(entry(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(entry(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(entry(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp archive file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    pub async fn load_json<T: DeserializeOwned>(&self, relative_path: &Path) -> anyhow::Result<T> {
        let path = self.root.join(relative_path);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }
}
