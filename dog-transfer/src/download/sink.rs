//! Destinations for downloaded parts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::TransferResult;

/// Random-access destination for part bodies.
///
/// Parts may arrive in any order and from several tasks at once; each write
/// carries its absolute offset in the object.
#[async_trait]
pub trait PartSink: Send + Sync {
    /// Called once the object's size is known, before the first write
    async fn prepare(&self, _total_length: Option<u64>) -> TransferResult<()> {
        Ok(())
    }

    /// Write `data` at `offset`
    async fn write_at(&self, offset: u64, data: Bytes) -> TransferResult<()>;

    /// A resumed download already holds `offset` contiguous bytes
    async fn seek(&self, _offset: u64) -> TransferResult<()> {
        Ok(())
    }

    /// Called once after the last part was written
    async fn finish(&self) -> TransferResult<()> {
        Ok(())
    }
}

/// Growable in-memory sink
#[derive(Debug, Default)]
pub struct MemorySink {
    buffer: Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Copy of everything written so far
    pub fn contents(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer.lock())
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

#[async_trait]
impl PartSink for MemorySink {
    async fn prepare(&self, total_length: Option<u64>) -> TransferResult<()> {
        if let Some(total) = total_length {
            let mut buffer = self.buffer.lock();
            let wanted = (total as usize).saturating_sub(buffer.len());
            buffer.reserve(wanted);
        }
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> TransferResult<()> {
        let offset = offset as usize;
        let end = offset + data.len();
        let mut buffer = self.buffer.lock();
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[offset..end].copy_from_slice(&data);
        Ok(())
    }
}

/// Sink backed by a local file, written with positional writes
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
}

impl FileSink {
    /// Create (or truncate) the file at `path`
    pub async fn create<P: AsRef<Path>>(path: P) -> TransferResult<Self> {
        let file = File::create(path.as_ref()).await?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file: tokio::sync::Mutex::new(file),
        })
    }

    /// Open an existing partial download without truncating it
    pub async fn open_existing<P: AsRef<Path>>(path: P) -> TransferResult<Self> {
        let file = OpenOptions::new().write(true).open(path.as_ref()).await?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PartSink for FileSink {
    async fn prepare(&self, total_length: Option<u64>) -> TransferResult<()> {
        if let Some(total) = total_length {
            let file = self.file.lock().await;
            if file.metadata().await?.len() < total {
                file.set_len(total).await?;
            }
        }
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> TransferResult<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        Ok(())
    }

    async fn seek(&self, offset: u64) -> TransferResult<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(())
    }

    async fn finish(&self) -> TransferResult<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}
