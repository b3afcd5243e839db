//! Persist a job and its per-object transfers so an interrupted job can resume.
//!
//! A [Checkpoint] stores the job (a [Transfer]) as the journal's base transfer and each
//! in-progress object as a [SingleObjectTransfer] subtransfer, each with a [Progress]
//! snapshot. Objects are removed once they reach a terminal state, so a reopened
//! checkpoint lists exactly the objects left to resume.

use crate::{
    progress::Progress,
    records::{SingleObjectTransfer, Transfer},
    Error,
};
use courier_runtime::{Metrics, Storage};
use courier_storage::journal::{self, Entry, Handle, StreamJournal};
use futures::StreamExt;
use std::pin::pin;
use tracing::debug;

/// A job restored from a checkpoint.
pub struct Restored {
    /// The job, if one was stored.
    pub base: Option<Entry<Transfer, Progress>>,

    /// Objects left to resume, in the order they were added.
    pub subtransfers: Vec<Entry<SingleObjectTransfer, Progress>>,
}

/// Journal-backed store of a job's resumable state.
pub struct Checkpoint<E: Storage + Metrics> {
    journal: StreamJournal<E, Transfer, Progress>,
}

impl<E: Storage + Metrics> Checkpoint<E> {
    /// Open (or create) a checkpoint, restoring whatever it holds.
    pub async fn open(context: E, cfg: journal::Config) -> Result<(Self, Restored), Error> {
        let (journal, base) = StreamJournal::init(context, cfg).await?;
        let mut subtransfers = Vec::new();
        {
            let mut entries = pin!(journal.list_sub_transfers());
            while let Some(entry) = entries.next().await {
                let entry = entry?;
                let Transfer::Single(transfer) = entry.transfer else {
                    let offset = match entry.handle {
                        Handle::Chunk(offset) => offset,
                        Handle::Base => 0,
                    };
                    return Err(journal::Error::Corrupted(
                        offset,
                        "subtransfer is not a single object transfer",
                    )
                    .into());
                };
                subtransfers.push(Entry {
                    handle: entry.handle,
                    transfer,
                    progress: entry.progress,
                });
            }
        }
        debug!(
            base = base.is_some(),
            subtransfers = subtransfers.len(),
            "opened checkpoint"
        );
        Ok((Self { journal }, Restored { base, subtransfers }))
    }

    /// Store the job.
    pub async fn set_base(&self, transfer: &Transfer, progress: &Progress) -> Result<Handle, Error> {
        Ok(self.journal.add_transfer(transfer, progress).await?)
    }

    /// Store an object of the job.
    pub async fn add(
        &self,
        transfer: &SingleObjectTransfer,
        progress: &Progress,
    ) -> Result<Handle, Error> {
        let transfer = Transfer::Single(transfer.clone());
        Ok(self.journal.add_subtransfer(&transfer, progress).await?)
    }

    /// Update the job.
    pub async fn update_base(&self, transfer: &Transfer) -> Result<(), Error> {
        Ok(self.journal.update_transfer(Handle::Base, transfer).await?)
    }

    /// Update an object of the job.
    pub async fn update(&self, handle: Handle, transfer: &SingleObjectTransfer) -> Result<(), Error> {
        let transfer = Transfer::Single(transfer.clone());
        Ok(self.journal.update_transfer(handle, &transfer).await?)
    }

    /// Update the progress of the job or one of its objects.
    pub async fn update_progress(&self, handle: Handle, progress: &Progress) -> Result<(), Error> {
        Ok(self.journal.update_progress(handle, progress).await?)
    }

    /// Remove an object of the job, or the job itself (discarding the checkpoint).
    pub async fn remove(&self, handle: Handle) -> Result<(), Error> {
        Ok(self.journal.remove_transfer(handle).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{DirectoryTransfer, Location, TransferMethod, TransferStatus};
    use courier_macros::test_traced;
    use courier_runtime::{tokio, Runner};

    fn config() -> journal::Config {
        journal::Config {
            partition: "checkpoints".into(),
            name: b"job".to_vec(),
            format_version: "courier/1".into(),
        }
    }

    fn directory() -> Transfer {
        Transfer::Directory(DirectoryTransfer {
            source: Location::Local {
                path: "/data".into(),
            },
            destination: Location::File {
                share: "backup".into(),
                path: "data".into(),
            },
            method: TransferMethod::SyncCopy,
            continuation_token: None,
        })
    }

    fn file(name: &str) -> SingleObjectTransfer {
        SingleObjectTransfer::new(
            Location::Local {
                path: format!("/data/{name}"),
            },
            Location::File {
                share: "backup".into(),
                path: format!("data/{name}"),
            },
            TransferMethod::SyncCopy,
        )
    }

    #[test_traced]
    fn test_resume_job() {
        let executor = tokio::Runner::default();
        executor.start(|context| async move {
            let (checkpoint, restored) = Checkpoint::open(context.clone(), config()).await.unwrap();
            assert!(restored.base.is_none());
            checkpoint
                .set_base(&directory(), &Progress::default())
                .await
                .unwrap();

            // Three files start, one finishes
            let mut handles = Vec::new();
            for name in ["a", "b", "c"] {
                handles.push(checkpoint.add(&file(name), &Progress::default()).await.unwrap());
            }
            checkpoint.remove(handles[0]).await.unwrap();

            // One file is partway through
            let mut b = file("b");
            b.status = TransferStatus::Transfer;
            b.checkpoint.begin_range(0, 4096);
            checkpoint.update(handles[1], &b).await.unwrap();
            let progress = Progress {
                bytes_transferred: 4096,
                ..Progress::default()
            };
            checkpoint.update_progress(handles[1], &progress).await.unwrap();
            checkpoint.update_progress(Handle::Base, &progress).await.unwrap();

            // The directory listing moved on
            let Transfer::Directory(mut job) = directory() else {
                unreachable!();
            };
            job.continuation_token = Some("next".into());
            checkpoint
                .update_base(&Transfer::Directory(job.clone()))
                .await
                .unwrap();
            drop(checkpoint);

            let (_, restored) = Checkpoint::open(context, config()).await.unwrap();
            let base = restored.base.unwrap();
            assert_eq!(base.transfer, Transfer::Directory(job));
            assert_eq!(base.progress, progress);
            assert_eq!(restored.subtransfers.len(), 2);
            assert_eq!(restored.subtransfers[0].handle, handles[1]);
            assert_eq!(restored.subtransfers[0].transfer, b);
            assert_eq!(restored.subtransfers[0].progress, progress);
            assert_eq!(restored.subtransfers[1].transfer, file("c"));
        });
    }

    #[test_traced]
    fn test_directory_subtransfer_is_corruption() {
        let executor = tokio::Runner::default();
        executor.start(|context| async move {
            let cfg = config();
            let (raw, _) =
                StreamJournal::<_, Transfer, Progress>::init(context.clone(), cfg.clone())
                    .await
                    .unwrap();
            raw
                .add_transfer(&directory(), &Progress::default())
                .await
                .unwrap();
            raw
                .add_subtransfer(&directory(), &Progress::default())
                .await
                .unwrap();
            drop(raw);

            let result = Checkpoint::open(context, cfg).await;
            assert!(matches!(
                result,
                Err(Error::Journal(journal::Error::Corrupted(_, _)))
            ));
        });
    }

    #[test_traced]
    fn test_discard_job() {
        let executor = tokio::Runner::default();
        executor.start(|context| async move {
            let (checkpoint, _) = Checkpoint::open(context.clone(), config()).await.unwrap();
            checkpoint
                .set_base(&directory(), &Progress::default())
                .await
                .unwrap();
            checkpoint.add(&file("a"), &Progress::default()).await.unwrap();
            checkpoint.remove(Handle::Base).await.unwrap();
            drop(checkpoint);

            let (_, restored) = Checkpoint::open(context, config()).await.unwrap();
            assert!(restored.base.is_none());
            assert!(restored.subtransfers.is_empty());
        });
    }
}
