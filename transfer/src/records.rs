//! Transfer records persisted in a checkpoint.
//!
//! A job is either a [SingleObjectTransfer] (one source object to one destination) or a
//! [DirectoryTransfer] (every object under a source location), wrapped in a [Transfer].
//! Directory jobs persist their listing position; single-object jobs persist which
//! ranges were in flight so a resumed run re-transfers only those.
//!
//! # Format
//!
//! A [Transfer] is encoded as:
//!
//! ```text
//! +-------------+---------+------------------+
//! | Version(u8) | Tag(u8) |  Record fields   |
//! +-------------+---------+------------------+
//! ```
//!
//! Variable-length fields (strings, lists, options) use the codec's length-prefixed
//! framing. Records written with another version are rejected.

use bytes::{Buf, BufMut};
use courier_codec::{EncodeSize, Error, Read, Write};

/// Version of the record encoding.
pub const RECORD_VERSION: u8 = 1;

/// Kind of a blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobKind {
    Block,
    Page,
    Append,
}

impl Write for BlobKind {
    fn write(&self, buf: &mut impl BufMut) {
        let tag: u8 = match self {
            Self::Block => 0,
            Self::Page => 1,
            Self::Append => 2,
        };
        tag.write(buf);
    }
}

impl EncodeSize for BlobKind {
    fn encode_size(&self) -> usize {
        1
    }
}

impl Read for BlobKind {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        match u8::read(buf)? {
            0 => Ok(Self::Block),
            1 => Ok(Self::Page),
            2 => Ok(Self::Append),
            tag => Err(Error::InvalidEnum("BlobKind", tag)),
        }
    }
}

/// Where a transfer reads from or writes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    /// A path on the local filesystem.
    Local { path: String },
    /// A blob in a container, optionally pinned to a snapshot.
    Blob {
        container: String,
        name: String,
        kind: BlobKind,
        snapshot: Option<String>,
    },
    /// A file in a file share.
    File { share: String, path: String },
    /// A caller-provided stream, identified by the caller.
    Stream { id: u64 },
}

impl Write for Location {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::Local { path } => {
                0u8.write(buf);
                path.write(buf);
            }
            Self::Blob {
                container,
                name,
                kind,
                snapshot,
            } => {
                1u8.write(buf);
                container.write(buf);
                name.write(buf);
                kind.write(buf);
                snapshot.write(buf);
            }
            Self::File { share, path } => {
                2u8.write(buf);
                share.write(buf);
                path.write(buf);
            }
            Self::Stream { id } => {
                3u8.write(buf);
                id.write(buf);
            }
        }
    }
}

impl EncodeSize for Location {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Local { path } => path.encode_size(),
            Self::Blob {
                container,
                name,
                kind,
                snapshot,
            } => {
                container.encode_size()
                    + name.encode_size()
                    + kind.encode_size()
                    + snapshot.encode_size()
            }
            Self::File { share, path } => share.encode_size() + path.encode_size(),
            Self::Stream { id } => id.encode_size(),
        }
    }
}

impl Read for Location {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        match u8::read(buf)? {
            0 => Ok(Self::Local {
                path: String::read(buf)?,
            }),
            1 => Ok(Self::Blob {
                container: String::read(buf)?,
                name: String::read(buf)?,
                kind: BlobKind::read(buf)?,
                snapshot: Option::<String>::read(buf)?,
            }),
            2 => Ok(Self::File {
                share: String::read(buf)?,
                path: String::read(buf)?,
            }),
            3 => Ok(Self::Stream {
                id: u64::read(buf)?,
            }),
            tag => Err(Error::InvalidEnum("Location", tag)),
        }
    }
}

/// How data moves from source to destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferMethod {
    /// Data flows through this process.
    SyncCopy,
    /// The destination service copies asynchronously and is monitored until done.
    ServiceSideAsyncCopy,
    /// The destination service copies range by range on request.
    ServiceSideSyncCopy,
}

impl Write for TransferMethod {
    fn write(&self, buf: &mut impl BufMut) {
        let tag: u8 = match self {
            Self::SyncCopy => 0,
            Self::ServiceSideAsyncCopy => 1,
            Self::ServiceSideSyncCopy => 2,
        };
        tag.write(buf);
    }
}

impl EncodeSize for TransferMethod {
    fn encode_size(&self) -> usize {
        1
    }
}

impl Read for TransferMethod {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        match u8::read(buf)? {
            0 => Ok(Self::SyncCopy),
            1 => Ok(Self::ServiceSideAsyncCopy),
            2 => Ok(Self::ServiceSideSyncCopy),
            tag => Err(Error::InvalidEnum("TransferMethod", tag)),
        }
    }
}

/// Stage of a single-object transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    NotStarted,
    Transfer,
    Monitor,
    Finished,
    Skipped,
    Failed,
}

impl TransferStatus {
    /// Whether the transfer will make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Skipped | Self::Failed)
    }
}

impl Write for TransferStatus {
    fn write(&self, buf: &mut impl BufMut) {
        let tag: u8 = match self {
            Self::NotStarted => 0,
            Self::Transfer => 1,
            Self::Monitor => 2,
            Self::Finished => 3,
            Self::Skipped => 4,
            Self::Failed => 5,
        };
        tag.write(buf);
    }
}

impl EncodeSize for TransferStatus {
    fn encode_size(&self) -> usize {
        1
    }
}

impl Read for TransferStatus {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        match u8::read(buf)? {
            0 => Ok(Self::NotStarted),
            1 => Ok(Self::Transfer),
            2 => Ok(Self::Monitor),
            3 => Ok(Self::Finished),
            4 => Ok(Self::Skipped),
            5 => Ok(Self::Failed),
            tag => Err(Error::InvalidEnum("TransferStatus", tag)),
        }
    }
}

/// Resume position of a single-object transfer.
///
/// Everything before `entry_transfer_offset` has been transferred, except the ranges
/// starting at the offsets in `transfer_window`, which were in flight.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SingleObjectCheckpoint {
    pub entry_transfer_offset: u64,
    pub transfer_window: Vec<u64>,
}

impl SingleObjectCheckpoint {
    /// Record that the range at `offset` is in flight.
    pub fn begin_range(&mut self, offset: u64, len: u64) {
        self.transfer_window.push(offset);
        self.entry_transfer_offset = self.entry_transfer_offset.max(offset + len);
    }

    /// Record that the range at `offset` completed.
    pub fn complete_range(&mut self, offset: u64) {
        self.transfer_window.retain(|pending| *pending != offset);
    }
}

impl Write for SingleObjectCheckpoint {
    fn write(&self, buf: &mut impl BufMut) {
        self.entry_transfer_offset.write(buf);
        self.transfer_window.write(buf);
    }
}

impl EncodeSize for SingleObjectCheckpoint {
    fn encode_size(&self) -> usize {
        self.entry_transfer_offset.encode_size() + self.transfer_window.encode_size()
    }
}

impl Read for SingleObjectCheckpoint {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        Ok(Self {
            entry_transfer_offset: u64::read(buf)?,
            transfer_window: Vec::<u64>::read(buf)?,
        })
    }
}

/// Transfer of one object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SingleObjectTransfer {
    pub source: Location,
    pub destination: Location,
    pub method: TransferMethod,
    pub status: TransferStatus,
    pub checkpoint: SingleObjectCheckpoint,
}

impl SingleObjectTransfer {
    /// A transfer that has not started yet.
    pub fn new(source: Location, destination: Location, method: TransferMethod) -> Self {
        Self {
            source,
            destination,
            method,
            status: TransferStatus::NotStarted,
            checkpoint: SingleObjectCheckpoint::default(),
        }
    }
}

impl Write for SingleObjectTransfer {
    fn write(&self, buf: &mut impl BufMut) {
        self.source.write(buf);
        self.destination.write(buf);
        self.method.write(buf);
        self.status.write(buf);
        self.checkpoint.write(buf);
    }
}

impl EncodeSize for SingleObjectTransfer {
    fn encode_size(&self) -> usize {
        self.source.encode_size()
            + self.destination.encode_size()
            + self.method.encode_size()
            + self.status.encode_size()
            + self.checkpoint.encode_size()
    }
}

impl Read for SingleObjectTransfer {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        Ok(Self {
            source: Location::read(buf)?,
            destination: Location::read(buf)?,
            method: TransferMethod::read(buf)?,
            status: TransferStatus::read(buf)?,
            checkpoint: SingleObjectCheckpoint::read(buf)?,
        })
    }
}

/// Transfer of every object under a location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryTransfer {
    pub source: Location,
    pub destination: Location,
    pub method: TransferMethod,

    /// Where to resume listing the source, if listing was interrupted.
    pub continuation_token: Option<String>,
}

impl Write for DirectoryTransfer {
    fn write(&self, buf: &mut impl BufMut) {
        self.source.write(buf);
        self.destination.write(buf);
        self.method.write(buf);
        self.continuation_token.write(buf);
    }
}

impl EncodeSize for DirectoryTransfer {
    fn encode_size(&self) -> usize {
        self.source.encode_size()
            + self.destination.encode_size()
            + self.method.encode_size()
            + self.continuation_token.encode_size()
    }
}

impl Read for DirectoryTransfer {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        Ok(Self {
            source: Location::read(buf)?,
            destination: Location::read(buf)?,
            method: TransferMethod::read(buf)?,
            continuation_token: Option::<String>::read(buf)?,
        })
    }
}

/// A persisted transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transfer {
    Single(SingleObjectTransfer),
    Directory(DirectoryTransfer),
}

impl Write for Transfer {
    fn write(&self, buf: &mut impl BufMut) {
        RECORD_VERSION.write(buf);
        match self {
            Self::Single(transfer) => {
                0u8.write(buf);
                transfer.write(buf);
            }
            Self::Directory(transfer) => {
                1u8.write(buf);
                transfer.write(buf);
            }
        }
    }
}

impl EncodeSize for Transfer {
    fn encode_size(&self) -> usize {
        2 + match self {
            Self::Single(transfer) => transfer.encode_size(),
            Self::Directory(transfer) => transfer.encode_size(),
        }
    }
}

impl Read for Transfer {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        let version = u8::read(buf)?;
        if version != RECORD_VERSION {
            return Err(Error::InvalidData(
                "Transfer",
                format!("unsupported version {version}"),
            ));
        }
        match u8::read(buf)? {
            0 => Ok(Self::Single(SingleObjectTransfer::read(buf)?)),
            1 => Ok(Self::Directory(DirectoryTransfer::read(buf)?)),
            tag => Err(Error::InvalidEnum("Transfer", tag)),
        }
    }
}
