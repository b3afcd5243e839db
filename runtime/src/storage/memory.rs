//! In-memory storage, primarily intended for tests.

use super::{hex, validate_partition_name};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
};

type Partition = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory storage implementation.
///
/// Data written to a [Blob] only becomes visible to newly opened blobs after
/// [crate::Blob::sync], mirroring a filesystem that loses unsynced writes on crash.
#[derive(Clone, Default)]
pub struct Storage {
    partitions: Arc<Mutex<BTreeMap<String, Partition>>>,
}

impl crate::Storage for Storage {
    type Blob = Blob;

    async fn open(&self, partition: &str, name: &[u8]) -> Result<(Blob, u64), crate::Error> {
        validate_partition_name(partition)?;

        let mut partitions = self.partitions.lock().unwrap();
        let content = partitions
            .entry(partition.into())
            .or_default()
            .entry(name.into())
            .or_default()
            .clone();
        let len = content.len() as u64;
        Ok((
            Blob {
                partitions: self.partitions.clone(),
                partition: partition.into(),
                name: name.into(),
                content: Arc::new(RwLock::new(content)),
            },
            len,
        ))
    }
}

/// A blob held in memory.
#[derive(Clone)]
pub struct Blob {
    partitions: Arc<Mutex<BTreeMap<String, Partition>>>,
    partition: String,
    name: Vec<u8>,
    content: Arc<RwLock<Vec<u8>>>,
}

impl crate::Blob for Blob {
    async fn read_at(&self, mut buf: Vec<u8>, offset: u64) -> Result<Vec<u8>, crate::Error> {
        let offset: usize = offset
            .try_into()
            .map_err(|_| crate::Error::OffsetOverflow)?;
        let end = offset
            .checked_add(buf.len())
            .ok_or(crate::Error::OffsetOverflow)?;
        let content = self.content.read().unwrap();
        if end > content.len() {
            return Err(crate::Error::BlobInsufficientLength);
        }
        buf.copy_from_slice(&content[offset..end]);
        Ok(buf)
    }

    async fn write_at(&self, buf: Vec<u8>, offset: u64) -> Result<(), crate::Error> {
        let offset: usize = offset
            .try_into()
            .map_err(|_| crate::Error::OffsetOverflow)?;
        let end = offset
            .checked_add(buf.len())
            .ok_or(crate::Error::OffsetOverflow)?;
        let mut content = self.content.write().unwrap();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(&buf);
        Ok(())
    }

    async fn len(&self) -> Result<u64, crate::Error> {
        Ok(self.content.read().unwrap().len() as u64)
    }

    async fn resize(&self, len: u64) -> Result<(), crate::Error> {
        let len: usize = len.try_into().map_err(|_| crate::Error::OffsetOverflow)?;
        self.content.write().unwrap().resize(len, 0);
        Ok(())
    }

    async fn sync(&self) -> Result<(), crate::Error> {
        let snapshot = self.content.read().unwrap().clone();
        let mut partitions = self.partitions.lock().unwrap();
        let content = partitions
            .get_mut(&self.partition)
            .ok_or(crate::Error::PartitionMissing(self.partition.clone()))?
            .get_mut(&self.name)
            .ok_or(crate::Error::BlobMissing(
                self.partition.clone(),
                hex(&self.name),
            ))?;
        *content = snapshot;
        Ok(())
    }
}
