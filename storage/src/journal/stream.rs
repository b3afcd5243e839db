use super::{Config, Entry, Error, Handle};
use async_lock::Mutex;
use bytes::{Buf, BufMut};
use courier_codec::{Codec, Decode, Encode, EncodeSize, Read, Write};
use courier_runtime::{Blob, Metrics, Storage};
use futures::stream::{self, Stream};
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use std::{collections::HashSet, marker::PhantomData, sync::Arc};
use tracing::{debug, trace, warn};

/// Size of the region holding the format version.
const VERSION_SIZE: u64 = 256;

/// Longest format version that fits in the version region (after its length byte).
const MAX_VERSION_LEN: usize = VERSION_SIZE as usize - 1;

/// Offset of the journal head.
pub(super) const HEAD_OFFSET: u64 = VERSION_SIZE;

/// Offset of the base record (and end of the header).
const BASE_OFFSET: u64 = 512;

/// Size of the base record slot.
const BASE_TRANSFER_SIZE: u64 = 9 * 1024;

/// Size of the base progress slot.
const BASE_PROGRESS_SIZE: u64 = 1024;

/// Offset of the first chunk.
pub(super) const CONTENT_OFFSET: u64 = BASE_OFFSET + BASE_TRANSFER_SIZE + BASE_PROGRESS_SIZE;

/// Size of a chunk.
pub(super) const CHUNK_SIZE: u64 = 10 * 1024;

/// Size of the `(prev, next)` pointers at the start of each chunk.
const POINTERS_SIZE: u64 = 16;

/// Size of the record area of a chunk (including its pointers).
const TRANSFER_SIZE: u64 = 9 * 1024;

/// Size of the progress area of a chunk.
const PROGRESS_SIZE: u64 = CHUNK_SIZE - TRANSFER_SIZE;

/// Size of the length prefix of each record.
const LEN_PREFIX: u64 = u32::BITS as u64 / 8;

/// Ends of the used and free chunk lists (0 is null).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Head {
    used_head: u64,
    used_tail: u64,
    free_head: u64,
    free_tail: u64,
}

impl Write for Head {
    fn write(&self, buf: &mut impl BufMut) {
        self.used_head.write(buf);
        self.used_tail.write(buf);
        self.free_head.write(buf);
        self.free_tail.write(buf);
    }
}

impl EncodeSize for Head {
    fn encode_size(&self) -> usize {
        4 * u64::BITS as usize / 8
    }
}

impl Read for Head {
    fn read(buf: &mut impl Buf) -> Result<Self, courier_codec::Error> {
        Ok(Self {
            used_head: u64::read(buf)?,
            used_tail: u64::read(buf)?,
            free_head: u64::read(buf)?,
            free_tail: u64::read(buf)?,
        })
    }
}

/// Location and capacity of a record slot.
fn transfer_slot(handle: Handle) -> (u64, u64) {
    match handle {
        Handle::Base => (BASE_OFFSET, BASE_TRANSFER_SIZE),
        Handle::Chunk(offset) => (offset + POINTERS_SIZE, TRANSFER_SIZE - POINTERS_SIZE),
    }
}

/// Location and capacity of a progress slot.
fn progress_slot(handle: Handle) -> (u64, u64) {
    match handle {
        Handle::Base => (BASE_OFFSET + BASE_TRANSFER_SIZE, BASE_PROGRESS_SIZE),
        Handle::Chunk(offset) => (offset + TRANSFER_SIZE, PROGRESS_SIZE),
    }
}

/// Frame `value` with a length prefix, failing if it does not fit in `capacity`.
fn encode_slot(value: &impl Encode, capacity: u64) -> Result<Vec<u8>, Error> {
    let max = (capacity - LEN_PREFIX) as usize;
    let len = value.encode_size();
    if len > max {
        return Err(Error::RecordTooLarge(len, max));
    }
    let mut buf = Vec::with_capacity(LEN_PREFIX as usize + len);
    buf.put_u32(len as u32);
    value.write(&mut buf);
    Ok(buf)
}

/// Decode a length-prefixed value from the start of `buf`.
fn decode_slot<V: Decode>(offset: u64, mut buf: &[u8]) -> Result<V, Error> {
    if buf.len() < LEN_PREFIX as usize {
        return Err(Error::Corrupted(offset, "truncated record"));
    }
    let len = buf.get_u32() as usize;
    if len > buf.len() {
        return Err(Error::Corrupted(offset, "record length exceeds slot"));
    }
    V::decode(&buf[..len]).map_err(Error::Codec)
}

fn read_u64(buf: &[u8]) -> u64 {
    u64::from_be_bytes(buf[..8].try_into().unwrap())
}

struct State<B: Blob> {
    blob: B,
    size: u64,
    head: Head,

    // Whether the version and head have been written since the blob was last truncated
    initialized: bool,
    base: bool,

    // Bumped whenever a chunk is linked into or unlinked from the used list
    generation: u64,

    used: Gauge,
    free: Gauge,
    syncs: Counter,
}

impl<B: Blob> State<B> {
    /// Number of chunks ever allocated.
    fn chunks(&self) -> u64 {
        self.size.saturating_sub(CONTENT_OFFSET) / CHUNK_SIZE
    }

    /// Whether `offset` is the start of an allocated chunk.
    fn is_chunk(&self, offset: u64) -> bool {
        offset >= CONTENT_OFFSET
            && (offset - CONTENT_OFFSET) % CHUNK_SIZE == 0
            && offset
                .checked_add(CHUNK_SIZE)
                .is_some_and(|end| end <= self.size)
    }

    fn check_handle(&self, handle: Handle) -> Result<(), Error> {
        if !self.base {
            return Err(Error::NoBaseTransfer);
        }
        match handle {
            Handle::Base => Ok(()),
            Handle::Chunk(offset) if self.is_chunk(offset) => Ok(()),
            Handle::Chunk(offset) => Err(Error::InvalidHandle(offset)),
        }
    }

    async fn sync(&mut self) -> Result<(), Error> {
        self.syncs.inc();
        self.blob.sync().await.map_err(Error::Runtime)
    }

    /// Write the version and an empty head, discarding any previous head.
    async fn write_header(&mut self, version: &str) -> Result<(), Error> {
        let mut buf = vec![0u8; BASE_OFFSET as usize];
        buf[0] = version.len() as u8;
        buf[1..=version.len()].copy_from_slice(version.as_bytes());
        self.head = Head::default();
        buf[HEAD_OFFSET as usize..][..self.head.encode_size()].copy_from_slice(&self.head.encode());
        self.blob.write_at(buf, 0).await?;
        self.size = self.size.max(BASE_OFFSET);
        self.initialized = true;
        self.sync().await
    }

    async fn verify_version(&self, version: &str) -> Result<(), Error> {
        let buf = self.blob.read_at(vec![0u8; VERSION_SIZE as usize], 0).await?;
        let len = buf[0] as usize;
        let found = String::from_utf8_lossy(&buf[1..=len]);
        if found != version {
            return Err(Error::VersionMismatch(found.into_owned(), version.to_string()));
        }
        Ok(())
    }

    async fn read_head(&self) -> Result<Head, Error> {
        let buf = self
            .blob
            .read_at(vec![0u8; Head::default().encode_size()], HEAD_OFFSET)
            .await?;
        Head::decode(buf.as_slice()).map_err(Error::Codec)
    }

    async fn write_head(&self) -> Result<(), Error> {
        self.blob
            .write_at(self.head.encode().to_vec(), HEAD_OFFSET)
            .await
            .map_err(Error::Runtime)
    }

    async fn read_pointers(&self, offset: u64) -> Result<(u64, u64), Error> {
        let buf = self
            .blob
            .read_at(vec![0u8; POINTERS_SIZE as usize], offset)
            .await?;
        Ok((read_u64(&buf[..8]), read_u64(&buf[8..])))
    }

    async fn write_u64(&self, offset: u64, value: u64) -> Result<(), Error> {
        self.blob
            .write_at(value.to_be_bytes().to_vec(), offset)
            .await
            .map_err(Error::Runtime)
    }

    /// Count the chunks on the free list, validating its links.
    async fn count_free(&self) -> Result<u64, Error> {
        let mut count = 0;
        let mut offset = self.head.free_head;
        let mut last = 0;
        while offset != 0 {
            if !self.is_chunk(offset) {
                return Err(Error::Corrupted(offset, "free chunk out of range"));
            }
            count += 1;
            if count > self.chunks() {
                return Err(Error::Corrupted(offset, "free list cycle"));
            }
            last = offset;
            (offset, _) = self.read_pointers(offset).await?;
        }
        if last != self.head.free_tail {
            return Err(Error::Corrupted(last, "free list does not end at tail"));
        }
        Ok(count)
    }

    /// Return a recycled chunk if one is free, otherwise the next never-allocated chunk.
    async fn search_free_offset(&mut self) -> Result<u64, Error> {
        let offset = self.head.free_head;
        if offset == 0 {
            return Ok(self.size.max(CONTENT_OFFSET));
        }
        if !self.is_chunk(offset) {
            return Err(Error::Corrupted(offset, "free chunk out of range"));
        }
        let (next, _) = self.read_pointers(offset).await?;
        if next == 0 {
            if self.head.free_tail != offset {
                return Err(Error::Corrupted(offset, "free list ends before tail"));
            }
            self.head.free_tail = 0;
        }
        self.head.free_head = next;
        self.free.dec();
        trace!(offset, "recycled chunk");
        Ok(offset)
    }

    /// Read the chunk at `offset`, which must be linked after `prev` on the used list.
    async fn read_entry<T: Decode, P: Decode>(
        &self,
        offset: u64,
        prev: u64,
    ) -> Result<(Entry<T, P>, u64), Error> {
        if !self.is_chunk(offset) {
            return Err(Error::Corrupted(offset, "used chunk out of range"));
        }
        let buf = self
            .blob
            .read_at(vec![0u8; CHUNK_SIZE as usize], offset)
            .await?;
        if read_u64(&buf[..8]) != prev {
            return Err(Error::Corrupted(offset, "previous pointer mismatch"));
        }
        let next = read_u64(&buf[8..16]);
        let transfer = decode_slot(
            offset,
            &buf[POINTERS_SIZE as usize..TRANSFER_SIZE as usize],
        )?;
        let progress = decode_slot(offset, &buf[TRANSFER_SIZE as usize..])?;
        Ok((
            Entry {
                handle: Handle::Chunk(offset),
                transfer,
                progress,
            },
            next,
        ))
    }
}

/// Cursor of a walk over the used list.
///
/// The journal is locked only while a single chunk is read. If the used list changes
/// between steps, the walk restarts from the head and skips chunks it already yielded.
struct Walk<B: Blob> {
    state: Arc<Mutex<State<B>>>,
    generation: Option<u64>,
    offset: u64,
    prev: u64,
    remaining: u64,
    yielded: HashSet<u64>,
}

impl<B: Blob> Walk<B> {
    async fn step<T: Decode, P: Decode>(&mut self) -> Option<Result<Entry<T, P>, Error>> {
        let state = self.state.lock().await;
        if self.generation != Some(state.generation) {
            self.generation = Some(state.generation);
            self.offset = if state.base { state.head.used_head } else { 0 };
            self.prev = 0;
            self.remaining = state.chunks();
        }
        loop {
            if self.offset == 0 {
                if self.prev != state.head.used_tail {
                    return Some(Err(Error::Corrupted(
                        self.prev,
                        "used list ends before tail",
                    )));
                }
                return None;
            }
            if self.remaining == 0 {
                return Some(Err(Error::Corrupted(self.offset, "used list cycle")));
            }
            let (entry, next) = match state.read_entry::<T, P>(self.offset, self.prev).await {
                Ok(read) => read,
                Err(err) => return Some(Err(err)),
            };
            let offset = self.offset;
            self.prev = offset;
            self.offset = next;
            self.remaining -= 1;
            if self.yielded.insert(offset) {
                return Some(Ok(entry));
            }
        }
    }
}

/// A journal of one base transfer and its subtransfers, stored in a single blob.
///
/// All methods take `&self`: mutations are serialized by an internal lock and end
/// with a sync of the blob.
pub struct StreamJournal<E: Storage + Metrics, T: Codec, P: Codec> {
    cfg: Config,
    state: Arc<Mutex<State<E::Blob>>>,

    _records: PhantomData<fn() -> (T, P)>,
}

impl<E: Storage + Metrics, T: Codec, P: Codec> StreamJournal<E, T, P> {
    /// Open (or create) the journal, returning the base transfer if one is stored.
    ///
    /// An empty blob is initialized with the configured format version. A blob written
    /// with any other format version is rejected with [Error::VersionMismatch].
    pub async fn init(context: E, cfg: Config) -> Result<(Self, Option<Entry<T, P>>), Error> {
        let version_len = cfg.format_version.len();
        if version_len > MAX_VERSION_LEN {
            return Err(Error::RecordTooLarge(version_len, MAX_VERSION_LEN));
        }
        let (blob, size) = context.open(&cfg.partition, &cfg.name).await?;

        // Initialize metrics
        let used = Gauge::default();
        let free = Gauge::default();
        let syncs = Counter::default();
        context.register("used_chunks", "Number of chunks holding a subtransfer", used.clone());
        context.register("free_chunks", "Number of recyclable chunks", free.clone());
        context.register("syncs", "Number of syncs", syncs.clone());

        let mut state = State {
            blob,
            size,
            head: Head::default(),
            initialized: false,
            base: false,
            generation: 0,
            used,
            free,
            syncs,
        };
        let base = if size == 0 {
            debug!(partition = %cfg.partition, "creating journal");
            state.write_header(&cfg.format_version).await?;
            None
        } else {
            if size < BASE_OFFSET {
                return Err(Error::Corrupted(size, "header truncated"));
            }
            state.verify_version(&cfg.format_version).await?;
            state.head = state.read_head().await?;
            state.initialized = true;
            if size == BASE_OFFSET {
                None
            } else if size < CONTENT_OFFSET || (size - CONTENT_OFFSET) % CHUNK_SIZE != 0 {
                warn!(size, "journal length is not chunk aligned");
                return Err(Error::Corrupted(size, "length not chunk aligned"));
            } else {
                state.base = true;
                let (offset, capacity) = transfer_slot(Handle::Base);
                let buf = state.blob.read_at(vec![0u8; capacity as usize], offset).await?;
                let transfer = decode_slot(offset, &buf)?;
                let (offset, capacity) = progress_slot(Handle::Base);
                let buf = state.blob.read_at(vec![0u8; capacity as usize], offset).await?;
                let progress = decode_slot(offset, &buf)?;
                Some(Entry {
                    handle: Handle::Base,
                    transfer,
                    progress,
                })
            }
        };

        let free = state.count_free().await?;
        state.free.set(free as i64);
        state.used.set((state.chunks() - free) as i64);
        debug!(
            chunks = state.chunks(),
            free,
            base = state.base,
            "opened journal"
        );

        Ok((
            Self {
                cfg,
                state: Arc::new(Mutex::new(state)),
                _records: PhantomData,
            },
            base,
        ))
    }

    /// Store the base transfer.
    ///
    /// A journal holds at most one base transfer: calling this again before removing
    /// it returns [Error::BaseTransferExists].
    pub async fn add_transfer(&self, transfer: &T, progress: &P) -> Result<Handle, Error> {
        let mut state = self.state.lock().await;
        if state.base {
            return Err(Error::BaseTransferExists);
        }
        let transfer = encode_slot(transfer, BASE_TRANSFER_SIZE)?;
        let progress = encode_slot(progress, BASE_PROGRESS_SIZE)?;
        if !state.initialized {
            state.write_header(&self.cfg.format_version).await?;
        }

        let mut buf = vec![0u8; (CONTENT_OFFSET - BASE_OFFSET) as usize];
        buf[..transfer.len()].copy_from_slice(&transfer);
        buf[BASE_TRANSFER_SIZE as usize..][..progress.len()].copy_from_slice(&progress);
        state.blob.write_at(buf, BASE_OFFSET).await?;
        state.size = state.size.max(CONTENT_OFFSET);
        state.base = true;
        state.sync().await?;
        debug!("added base transfer");
        Ok(Handle::Base)
    }

    /// Store a subtransfer in a recycled or new chunk, appending it to the used list.
    pub async fn add_subtransfer(&self, transfer: &T, progress: &P) -> Result<Handle, Error> {
        let mut state = self.state.lock().await;
        if !state.base {
            return Err(Error::NoBaseTransfer);
        }
        let transfer = encode_slot(transfer, TRANSFER_SIZE - POINTERS_SIZE)?;
        let progress = encode_slot(progress, PROGRESS_SIZE)?;

        // Ensure the tail is really the end of the list before linking after it
        let tail = state.head.used_tail;
        if tail != 0 {
            if !state.is_chunk(tail) {
                return Err(Error::Corrupted(tail, "tail out of range"));
            }
            let (_, next) = state.read_pointers(tail).await?;
            if next != 0 {
                return Err(Error::Corrupted(tail, "tail has a successor"));
            }
        }
        let offset = state.search_free_offset().await?;

        // Write the full chunk so the blob only ever grows by whole chunks
        let mut chunk = Vec::with_capacity(CHUNK_SIZE as usize);
        chunk.put_u64(tail);
        chunk.put_u64(0);
        chunk.extend_from_slice(&transfer);
        chunk.resize(TRANSFER_SIZE as usize, 0);
        chunk.extend_from_slice(&progress);
        chunk.resize(CHUNK_SIZE as usize, 0);
        state.blob.write_at(chunk, offset).await?;
        state.size = state.size.max(offset + CHUNK_SIZE);

        // Link
        if tail == 0 {
            state.head.used_head = offset;
        } else {
            state.write_u64(tail + 8, offset).await?;
        }
        state.head.used_tail = offset;
        state.generation += 1;
        state.write_head().await?;
        state.sync().await?;
        state.used.inc();
        trace!(offset, "added subtransfer");
        Ok(Handle::Chunk(offset))
    }

    /// Remove a transfer.
    ///
    /// Removing the base transfer truncates the journal; the header is rewritten by
    /// the next [StreamJournal::add_transfer]. Removing a subtransfer unlinks its chunk
    /// from the used list and appends it to the free list for reuse.
    pub async fn remove_transfer(&self, handle: Handle) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.check_handle(handle)?;
        let offset = match handle {
            Handle::Base => {
                state.blob.resize(0).await?;
                state.sync().await?;
                state.size = 0;
                state.head = Head::default();
                state.initialized = false;
                state.base = false;
                state.generation += 1;
                state.used.set(0);
                state.free.set(0);
                debug!("removed base transfer");
                return Ok(());
            }
            Handle::Chunk(offset) => offset,
        };

        // Verify the chunk is linked where it claims to be
        let (prev, next) = state.read_pointers(offset).await?;
        if prev == 0 {
            if state.head.used_head != offset {
                return Err(Error::Corrupted(offset, "orphaned chunk"));
            }
        } else {
            if !state.is_chunk(prev) {
                return Err(Error::Corrupted(offset, "previous pointer out of range"));
            }
            let (_, prev_next) = state.read_pointers(prev).await?;
            if prev_next != offset {
                return Err(Error::Corrupted(prev, "next pointer mismatch"));
            }
        }
        if next == 0 {
            if state.head.used_tail != offset {
                return Err(Error::Corrupted(offset, "chunk ends list before tail"));
            }
        } else {
            if !state.is_chunk(next) {
                return Err(Error::Corrupted(offset, "next pointer out of range"));
            }
            let (next_prev, _) = state.read_pointers(next).await?;
            if next_prev != offset {
                return Err(Error::Corrupted(next, "previous pointer mismatch"));
            }
        }

        // Unlink from the used list
        state.generation += 1;
        if prev == 0 {
            state.head.used_head = next;
        } else {
            state.write_u64(prev + 8, next).await?;
        }
        if next == 0 {
            state.head.used_tail = prev;
        } else {
            state.write_u64(next, prev).await?;
        }

        // Append to the free list
        state
            .blob
            .write_at(vec![0u8; POINTERS_SIZE as usize], offset)
            .await?;
        let free_tail = state.head.free_tail;
        if free_tail == 0 {
            state.head.free_head = offset;
        } else {
            state.write_u64(free_tail, offset).await?;
        }
        state.head.free_tail = offset;
        state.write_head().await?;
        state.sync().await?;
        state.used.dec();
        state.free.inc();
        trace!(offset, "removed subtransfer");
        Ok(())
    }

    /// Rewrite the transfer record of `handle` in place.
    pub async fn update_transfer(&self, handle: Handle, transfer: &T) -> Result<(), Error> {
        let (offset, capacity) = transfer_slot(handle);
        self.update(handle, offset, encode_slot(transfer, capacity)?)
            .await
    }

    /// Rewrite the progress record of `handle` in place.
    pub async fn update_progress(&self, handle: Handle, progress: &P) -> Result<(), Error> {
        let (offset, capacity) = progress_slot(handle);
        self.update(handle, offset, encode_slot(progress, capacity)?)
            .await
    }

    async fn update(&self, handle: Handle, offset: u64, buf: Vec<u8>) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.check_handle(handle)?;
        state.blob.write_at(buf, offset).await?;
        state.sync().await
    }

    /// Walk the used list from head to tail, yielding each subtransfer in insertion
    /// order (recycled chunks included).
    ///
    /// The journal is only locked while each entry is read, so it may be updated while
    /// the stream is held. Subtransfers removed during the walk are not yielded if not
    /// reached yet, and those added during the walk are yielded unless they reuse the
    /// chunk of an entry already yielded. Any structural inconsistency ends the stream
    /// with [Error::Corrupted].
    pub fn list_sub_transfers(&self) -> impl Stream<Item = Result<Entry<T, P>, Error>> {
        let walk = Walk {
            state: self.state.clone(),
            generation: None,
            offset: 0,
            prev: 0,
            remaining: 0,
            yielded: HashSet::new(),
        };
        stream::unfold(Some(walk), |walk| async move {
            let mut walk = walk?;
            match walk.step::<T, P>().await? {
                Ok(entry) => Some((Ok(entry), Some(walk))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Length of the underlying blob.
    pub async fn size(&self) -> u64 {
        self.state.lock().await.size
    }
}
