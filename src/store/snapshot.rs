//! JSON snapshot file used by [`super::MemoryStore::persistent`].

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    tables: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    version: u32,
    tables: T,
}

#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
    staging: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut staging = path.clone().into_os_string();
        staging.push(".tmp");
        Self {
            path,
            staging: PathBuf::from(staging),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the snapshot, returning `None` when no file exists yet.
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read snapshot {}", self.path.display()))
            }
        };

        let envelope: Envelope<T> = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse snapshot {}", self.path.display()))?;
        if envelope.version != SNAPSHOT_VERSION {
            bail!(
                "snapshot {} has version {} but {} is supported",
                self.path.display(),
                envelope.version,
                SNAPSHOT_VERSION
            );
        }
        Ok(Some(envelope.tables))
    }

    /// Writes the snapshot to a staging file and renames it over the previous one.
    pub async fn write<T: Serialize>(&self, tables: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&EnvelopeRef {
            version: SNAPSHOT_VERSION,
            tables,
        })
        .context("failed to serialize snapshot")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        tokio::fs::write(&self.staging, bytes)
            .await
            .with_context(|| format!("failed to write {}", self.staging.display()))?;
        tokio::fs::rename(&self.staging, &self.path)
            .await
            .with_context(|| format!("failed to replace snapshot {}", self.path.display()))?;
        Ok(())
    }
}
