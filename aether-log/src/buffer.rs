//! The write-side buffer: one in-flight [`Block`] over a fixed region.
//!
//! The region is ideally a shared file mapping (crash recovery comes for free:
//! the OS persists whatever the process managed to write), with a plain heap
//! allocation as the fallback. Logical writes are framed, streamed through the
//! optional deflate encoder and the optional AES streamer, and appended to the
//! block payload; a flush snapshots the block for file I/O and rearms the
//! region with a fresh header.

use std::ops::{Deref, DerefMut};

use thiserror::Error;

use crate::{
    appender,
    block::{Block, FLAG_COMPRESSED, FLAG_ENCRYPTED},
    compress::{deflate_bound, CompressOp, Compressor, DeflateCompressor},
    encrypt::{
        ecdh::{self, EMPTY_PUBLIC_KEY},
        AesEncryptor, EncryptOp, Encryptor, PublicKey,
    },
    mmap::Mmap,
    Tracker,
};

/// Errors that can be occurred during buffer write operations.
#[derive(Error, Clone, Debug)]
pub enum Error {
    /// The item does not fit into the remaining block capacity. The record is
    /// dropped rather than partially written.
    #[error("buffer full")]
    Full,
}

/// Length of the item frame header: `[len: u16][seq: u32]`.
pub(crate) const ITEM_HEADER_LEN: usize = 6;

/// The underlying memory of a [`LogBuffer`].
pub(crate) enum Region {
    Mmap(Mmap),
    Heap(Box<[u8]>),
}

impl Region {
    #[inline]
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Mmap(mmap) => mmap.len(),
            Self::Heap(heap) => heap.len(),
        }
    }
}

impl Deref for Region {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        match self {
            Self::Mmap(mmap) => mmap.deref(),
            Self::Heap(heap) => heap.deref(),
        }
    }
}

impl DerefMut for Region {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Mmap(mmap) => mmap.deref_mut(),
            Self::Heap(heap) => heap.deref_mut(),
        }
    }
}

/// The per-item processing pipeline.
///
/// # Workflow
///
/// ```plain
/// ┌─────────┐   ┌──────────┐   ┌───────────┐   ┌───────────────────────────┐
/// │  Frame  │──▶│ Compress │──▶│  Encrypt  │──▶│  Write to Block (Region)  │
/// └─────────┘   └──────────┘   └───────────┘   └───────────────────────────┘
/// ```
struct Pipeline {
    compressor: Option<DeflateCompressor>,
    encryptor: Option<AesEncryptor>,
}

/// Operation for [`Pipeline`].
enum Operation<'a> {
    /// One framed item: the frame header and the item bytes.
    Input(&'a [u8], &'a [u8]),
    /// Finalize the streams ahead of a block rotation.
    Rotate,
}

impl Pipeline {
    fn process<B>(&mut self, operation: Operation, block: &mut Block<B>) -> Result<(), appender::Error>
    where
        B: DerefMut<Target = [u8]>,
    {
        type Stage<F> = crate::common::SinkFn<F, appender::Error>;

        let mut to_block = Stage::new(|bytes: &[u8]| block.write(bytes).map_err(Into::into));

        let mut to_encryptor = Stage::new(|bytes: &[u8]| {
            self.encryptor.encrypt(EncryptOp::Input(bytes), &mut to_block)
        });

        match operation {
            Operation::Input(frame, bytes) => {
                self.compressor.compress(CompressOp::Input(frame), &mut to_encryptor)?;
                self.compressor.compress(CompressOp::Input(bytes), &mut to_encryptor)?;
                // Sync-flush so every completed item is decodable on its own even if
                // the process dies before the block rotates.
                self.compressor.compress(CompressOp::Flush, &mut to_encryptor)?;
            }
            Operation::Rotate => {
                self.compressor.compress(CompressOp::End, &mut to_encryptor)?;
                self.encryptor.encrypt(EncryptOp::Flush, &mut to_block)?;
            }
        }

        Ok(())
    }
}

/// The buffer absorbing all writes of one module.
pub(crate) struct LogBuffer {
    region: Region,
    pipeline: Pipeline,
    compress: bool,
    remote_key: Option<PublicKey>,
    recovered: Option<Vec<u8>>,
    tracker: Option<Tracker>,
}

impl LogBuffer {
    /// Constructs a `LogBuffer` over `region`.
    ///
    /// A valid non-empty block found in the region (crash leftovers from a
    /// previous run) is preserved: it is flagged as written back, snapshotted
    /// for [`LogBuffer::take_recovered`], and the sequence numbering continues
    /// after it.
    pub(crate) fn new(
        region: Region,
        compress: bool,
        remote_key: Option<PublicKey>,
        tracker: Option<Tracker>,
    ) -> Self {
        let mut buffer = Self {
            region,
            pipeline: Pipeline {
                compressor: compress.then(DeflateCompressor::new),
                encryptor: None,
            },
            compress,
            remote_key,
            recovered: None,
            tracker,
        };

        let (valid, payload_len, seq) = {
            let block = Block::bind(buffer.region.deref());
            (block.validate(), block.payload_len(), block.seq())
        };

        if valid && payload_len > 0 {
            let mut block = Block::bind(buffer.region.deref_mut());
            block.set_writeback();
            buffer.recovered = Some(block.deref().to_vec());
            buffer.reset(seq.wrapping_add(1));
        } else if valid {
            buffer.reset(seq);
        } else {
            buffer.reset(0);
        }

        buffer
    }

    /// Takes the block recovered from a previous crash, if any.
    #[inline]
    pub(crate) fn take_recovered(&mut self) -> Option<Vec<u8>> {
        self.recovered.take()
    }

    /// The current payload length.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        Block::bind(self.region.deref()).payload_len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends one item-framed copy of `bytes`.
    ///
    /// Returns [`Error::Full`] without touching the streams when the worst-case
    /// processed size does not fit into the remaining capacity.
    pub(crate) fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.is_empty() {
            return Ok(());
        }
        debug_assert!(bytes.len() <= u16::MAX as usize, "item is too large");

        let mut block = Block::bind(self.region.deref_mut());

        // Worst case: incompressible frame plus the encryptor's buffered tail and
        // one padded cipher block.
        let projected = deflate_bound(ITEM_HEADER_LEN + bytes.len()) + 256 + 16;
        if block.payload_len() + projected > block.capacity() {
            return Err(Error::Full);
        }

        let mut frame = [0u8; ITEM_HEADER_LEN];
        frame[..2].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
        frame[2..].copy_from_slice(&block.seq().to_le_bytes());

        self.pipeline
            .process(Operation::Input(&frame, bytes), &mut block)
            .unwrap_or_else(track!(self.tracker));
        Ok(())
    }

    /// Atomically snapshots the written block, rearms the region with a fresh
    /// header, and returns the snapshot for file I/O.
    ///
    /// Returns `None` when nothing has been written since the previous flush.
    pub(crate) fn flush(&mut self) -> Option<Vec<u8>> {
        let mut block = Block::bind(self.region.deref_mut());
        if block.payload_len() == 0 {
            return None;
        }

        let seq = block.seq();
        self.pipeline
            .process(Operation::Rotate, &mut block)
            .unwrap_or_else(track!(self.tracker));

        let snapshot = block.deref().to_vec();
        self.reset(seq.wrapping_add(1));
        Some(snapshot)
    }

    /// Rearms the region: fresh header, fresh deflate stream, fresh ephemeral
    /// keys when encrypting.
    fn reset(&mut self, seq: u32) {
        let mut flags = 0u8;
        if self.compress {
            flags |= FLAG_COMPRESSED;
        }

        let mut pub_key = EMPTY_PUBLIC_KEY;
        self.pipeline.encryptor = None;
        if let Some(remote_key) = self.remote_key.as_ref() {
            match ecdh::Keys::new(remote_key) {
                Ok(keys) => {
                    flags |= FLAG_ENCRYPTED;
                    pub_key = keys.public_key;
                    self.pipeline.encryptor = Some(AesEncryptor::new(&keys.encryption_key));
                }
                Err(err) => track!(self.tracker, appender::Error::from(err)),
            }
        }

        self.pipeline.compressor.reset();

        let timestamp = chrono::Utc::now().timestamp();
        let mut block = Block::bind(self.region.deref_mut());
        block.initialize(seq, timestamp, flags, pub_key);
    }
}
