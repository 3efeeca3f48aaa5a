//! JSON files written next to a run: reverted transaction lists and traces

use crate::error::{ClientError, ClientResult};

use ethers::types::H256;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// Serialises appends so concurrent decodes never interleave writes
pub struct ArtifactWriter {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append `item` to the JSON array stored in `file_name`, creating it when missing
    pub async fn append_to_json_array<T: Serialize>(
        &self,
        file_name: &str,
        item: &T,
    ) -> ClientResult<PathBuf> {
        let _guard = self.lock.lock().await;
        let path = self.dir.join(file_name);

        let mut items = match fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice::<Vec<Value>>(&bytes)
                .map_err(|e| persistence(&path, e))?,
            Ok(_) => Vec::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(persistence(&path, e)),
        };
        items.push(serde_json::to_value(item).map_err(|e| persistence(&path, e))?);

        self.write(&path, &items).await?;
        debug!("Appended entry to {:?} ({} total)", path, items.len());
        Ok(path)
    }

    /// Store a decoded transaction under `traces/<hash>.json`
    pub async fn save_trace<T: Serialize>(&self, tx_hash: H256, item: &T) -> ClientResult<PathBuf> {
        let path = self
            .dir
            .join("traces")
            .join(format!("{:?}.json", tx_hash));
        self.write(&path, item).await?;
        Ok(path)
    }

    async fn write<T: Serialize + ?Sized>(&self, path: &Path, item: &T) -> ClientResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| persistence(parent, e))?;
        }
        let json = serde_json::to_vec_pretty(item).map_err(|e| persistence(path, e))?;
        fs::write(path, json).await.map_err(|e| persistence(path, e))
    }
}

fn persistence(path: &Path, err: impl std::fmt::Display) -> ClientError {
    ClientError::Persistence(format!("{:?}: {}", path, err))
}
