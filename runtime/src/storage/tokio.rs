//! Storage backed by a directory on the local filesystem.
//!
//! Each partition is a directory and each blob a file named by the hex encoding of
//! its name. Blob I/O uses positional reads and writes on a blocking thread so
//! clones of a [Blob] can be used concurrently without sharing a cursor.

use super::{hex, validate_partition_name};
use crate::Error;
use std::{fs::File, path::PathBuf, sync::Arc};
use tokio::{fs, sync::Mutex, task};

/// Configuration for [Storage].
#[derive(Clone)]
pub struct Config {
    /// Directory holding every partition.
    pub storage_directory: PathBuf,
}

impl Config {
    pub fn new(storage_directory: PathBuf) -> Self {
        Self { storage_directory }
    }
}

/// Filesystem storage implementation.
#[derive(Clone)]
pub struct Storage {
    lock: Arc<Mutex<()>>,
    cfg: Config,
}

impl Storage {
    pub fn new(cfg: Config) -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            cfg,
        }
    }
}

/// A blob stored as a file.
#[derive(Clone)]
pub struct Blob {
    partition: String,
    name: Vec<u8>,
    file: Arc<File>,
}

impl crate::Storage for Storage {
    type Blob = Blob;

    async fn open(&self, partition: &str, name: &[u8]) -> Result<(Blob, u64), Error> {
        validate_partition_name(partition)?;

        // Acquire the filesystem lock
        let _guard = self.lock.lock().await;

        // Create the partition directory, if it does not exist
        let directory = self.cfg.storage_directory.join(partition);
        fs::create_dir_all(&directory)
            .await
            .map_err(|_| Error::PartitionCreationFailed(partition.into()))?;

        // Open the file in read-write mode, create if it does not exist
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(directory.join(hex(name)))
            .await
            .map_err(|e| Error::BlobOpenFailed(partition.into(), hex(name), e))?;
        let len = file.metadata().await.map_err(|_| Error::ReadFailed)?.len();

        // Convert to a blocking std::fs::File to use positional IO.
        let file = file.into_std().await;
        Ok((
            Blob {
                partition: partition.into(),
                name: name.into(),
                file: Arc::new(file),
            },
            len,
        ))
    }
}

impl crate::Blob for Blob {
    async fn read_at(&self, mut buf: Vec<u8>, offset: u64) -> Result<Vec<u8>, Error> {
        let file = self.file.clone();
        task::spawn_blocking(move || {
            #[cfg(unix)]
            {
                use std::os::unix::fs::FileExt;
                file.read_exact_at(&mut buf, offset)
                    .map_err(|_| Error::ReadFailed)?;
            }
            #[cfg(windows)]
            {
                use std::os::windows::fs::FileExt;
                let mut read = 0;
                while read < buf.len() {
                    let n = file
                        .seek_read(&mut buf[read..], offset + read as u64)
                        .map_err(|_| Error::ReadFailed)?;
                    if n == 0 {
                        return Err(Error::BlobInsufficientLength);
                    }
                    read += n;
                }
            }
            Ok(buf)
        })
        .await
        .map_err(|_| Error::ReadFailed)?
    }

    async fn write_at(&self, buf: Vec<u8>, offset: u64) -> Result<(), Error> {
        let file = self.file.clone();
        task::spawn_blocking(move || {
            #[cfg(unix)]
            {
                use std::os::unix::fs::FileExt;
                file.write_all_at(&buf, offset)
                    .map_err(|_| Error::WriteFailed)?;
            }
            #[cfg(windows)]
            {
                use std::os::windows::fs::FileExt;
                let mut written = 0;
                while written < buf.len() {
                    written += file
                        .seek_write(&buf[written..], offset + written as u64)
                        .map_err(|_| Error::WriteFailed)?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|_| Error::WriteFailed)?
    }

    async fn len(&self) -> Result<u64, Error> {
        let file = self.file.clone();
        task::spawn_blocking(move || file.metadata().map(|metadata| metadata.len()))
            .await
            .map_err(|_| Error::ReadFailed)?
            .map_err(Error::Io)
    }

    async fn resize(&self, len: u64) -> Result<(), Error> {
        let file = self.file.clone();
        let (partition, name) = (self.partition.clone(), hex(&self.name));
        task::spawn_blocking(move || {
            file.set_len(len)
                .map_err(|e| Error::BlobResizeFailed(partition, name, e))
        })
        .await
        .map_err(|_| Error::WriteFailed)?
    }

    async fn sync(&self) -> Result<(), Error> {
        let file = self.file.clone();
        let (partition, name) = (self.partition.clone(), hex(&self.name));
        task::spawn_blocking(move || {
            file.sync_all()
                .map_err(|e| Error::BlobSyncFailed(partition, name, e))
        })
        .await
        .map_err(|_| Error::WriteFailed)?
    }
}
