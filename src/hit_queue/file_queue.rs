//! JSON file backed [`DataQueue`].
//!
//! The whole queue lives in one file per queue name under the configured
//! storage directory. Every mutation rewrites the file through a temporary
//! file in the same directory followed by a rename, so a crash leaves either
//! the old or the new contents on disk.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::data_queue::{DataEntity, DataQueue};
use super::{DataQueueError, DataQueueResult};
use crate::config::HitQueueConfig;

pub struct FileDataQueue {
    path: PathBuf,
    entities: Mutex<VecDeque<DataEntity>>,
    closed: AtomicBool,
}

impl FileDataQueue {
    /// Opens the queue named `name`, loading whatever a previous run left.
    pub async fn open(config: &HitQueueConfig, name: &str) -> DataQueueResult<Self> {
        let path = Self::file_path(config, name);
        let entities = Self::load(&path).await?;
        debug!("Opened {} with {} persisted hits", path.display(), entities.len());
        Ok(Self {
            path,
            entities: Mutex::new(entities),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_path(config: &HitQueueConfig, name: &str) -> PathBuf {
        let sanitized = name.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        config
            .storage_dir
            .join(format!("{}.{}", sanitized, config.file_extension))
    }

    async fn load(path: &Path) -> DataQueueResult<VecDeque<DataEntity>> {
        if !path.exists() {
            return Ok(VecDeque::new());
        }
        let contents = fs::read(path)
            .await
            .map_err(|e| DataQueueError::Storage(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_slice(&contents)
            .map_err(|e| DataQueueError::Serialization(format!("Failed to parse JSON: {}", e)))
    }

    async fn persist(&self, entities: &VecDeque<DataEntity>) -> DataQueueResult<()> {
        let json = serde_json::to_vec(entities)
            .map_err(|e| DataQueueError::Serialization(format!("Failed to serialize hits: {}", e)))?;
        self.write_atomically(&json).await
    }

    async fn write_atomically(&self, data: &[u8]) -> DataQueueResult<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| DataQueueError::Storage("Invalid path: no parent directory".to_string()))?;
        fs::create_dir_all(dir)
            .await
            .map_err(|e| DataQueueError::Storage(format!("Failed to create directory: {}", e)))?;

        let temp_file = NamedTempFile::new_in(dir)
            .map_err(|e| DataQueueError::Storage(format!("Failed to create temporary file: {}", e)))?;
        let temp_path = temp_file.into_temp_path();

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| DataQueueError::Storage(format!("Failed to create file: {}", e)))?;
        file.write_all(data)
            .await
            .map_err(|e| DataQueueError::Storage(format!("Failed to write to file: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| DataQueueError::Storage(format!("Failed to flush file: {}", e)))?;
        drop(file);

        temp_path
            .persist(&self.path)
            .map_err(|e| DataQueueError::Storage(format!("Failed to rename file: {}", e)))?;
        Ok(())
    }

    fn ensure_open(&self) -> DataQueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DataQueueError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DataQueue for FileDataQueue {
    async fn add(&self, entity: DataEntity) -> DataQueueResult<()> {
        self.ensure_open()?;
        let mut entities = self.entities.lock().await;
        entities.push_back(entity);
        if let Err(e) = self.persist(&entities).await {
            entities.pop_back();
            return Err(e);
        }
        Ok(())
    }

    async fn peek(&self) -> DataQueueResult<Option<DataEntity>> {
        self.ensure_open()?;
        Ok(self.entities.lock().await.front().cloned())
    }

    async fn remove(&self) -> DataQueueResult<()> {
        self.ensure_open()?;
        let mut entities = self.entities.lock().await;
        if entities.pop_front().is_some() {
            self.persist(&entities).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> DataQueueResult<()> {
        self.ensure_open()?;
        let mut entities = self.entities.lock().await;
        entities.clear();
        self.persist(&entities).await
    }

    async fn count(&self) -> DataQueueResult<usize> {
        self.ensure_open()?;
        Ok(self.entities.lock().await.len())
    }

    async fn close(&self) -> DataQueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
