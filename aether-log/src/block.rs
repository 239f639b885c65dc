//! The `Block` structure.
//!
//! A block is the storage unit of the engine: the buffer region holds exactly one
//! in-flight block, and a persisted log file is the raw concatenation of flushed
//! blocks. The header at offset zero is rewritten on every reset and stays valid
//! at all times, so an abruptly terminated process leaves a decodable prefix
//! behind in the memory-mapped region.
//!
//! # The underlying structure
//!
//! ```plain
//!     ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─   n   ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ┐
//!    ├──── 59 ────┬───────────── n - 59 ──────────────┐
//!    ▼────────────▼───────────────────────────────────▼
//! ┌──│   Header   │              Payload              │
//! │  └────────────┴───────────────────────────────────┘
//! │  ┌─────────┬─────────┬─────────┬───────┬───────────┬──────────┬───────┬─────────────┐
//! └─▶│  Magic  │ Version │  Flags  │  Seq  │ Timestamp │  Length  │  CRC  │  Public Key │
//!    ▲─────────▲─────────▲─────────▲───────▲───────────▲──────────▲───────▲─────────────▲
//!    └─── 4 ───┴─── 1 ───┴─── 1 ───┴── 4 ──┴──── 8 ────┴─── 4 ────┴── 4 ──┴───── 33 ────┘
//! ```

use std::{
    mem,
    ops::{Deref, DerefMut},
};

use thiserror::Error;

use crate::{encrypt::PublicKey, FORMAT_VERSION};

/// Errors that can be occurred during block write operations.
#[derive(Error, Clone, Debug)]
pub enum Error {
    /// The block has overflowed, the input bytes are too large.
    #[error("block overflow")]
    Overflow,
}

/// Bit set in [`Header::flags`] when the payload is a deflate stream.
pub(crate) const FLAG_COMPRESSED: u8 = 0b0001;
/// Bit set in [`Header::flags`] when the payload is AES-encrypted.
pub(crate) const FLAG_ENCRYPTED: u8 = 0b0010;
/// Bit set in [`Header::flags`] when the block was recovered after a crash and
/// its final cipher padding is missing.
pub(crate) const FLAG_WRITEBACK: u8 = 0b0100;

/// Represents the header of the block.
#[repr(C)]
#[derive(Clone, Debug)]
pub(crate) struct Header {
    magic: [u8; 4],
    version: u8,
    flags: u8,
    seq: [u8; 4],
    timestamp: [u8; 8],
    length: [u8; 4],
    checksum: [u8; 4],
    pub_key: PublicKey,
}

impl Header {
    /// Length of a header in bytes. (59 bytes)
    pub(crate) const LEN: usize = mem::size_of::<Self>();

    /// The marker every block starts with, little-endian on disk.
    const MAGIC: [u8; 4] = 0xFEEDB10Cu32.to_le_bytes();

    /// Checks the correctness of the block header.
    #[inline]
    pub(crate) fn validate(&self) -> bool {
        self.magic == Self::MAGIC
    }

    /// The format version of the block.
    #[inline]
    pub(crate) fn version(&self) -> u8 {
        self.version
    }

    #[inline]
    pub(crate) fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    #[inline]
    pub(crate) fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    #[inline]
    pub(crate) fn is_writeback(&self) -> bool {
        self.flags & FLAG_WRITEBACK != 0
    }

    /// The sequence number of the block.
    #[inline]
    pub(crate) fn seq(&self) -> u32 {
        u32::from_le_bytes(self.seq)
    }

    /// The unix timestamp (seconds) at which the block was started.
    #[inline]
    #[allow(dead_code)]
    pub(crate) fn timestamp(&self) -> i64 {
        i64::from_le_bytes(self.timestamp)
    }

    /// The length of the block payload.
    #[inline]
    pub(crate) fn payload_len(&self) -> usize {
        u32::from_le_bytes(self.length) as usize
    }

    /// The running CRC-32 of the block payload.
    #[inline]
    pub(crate) fn checksum(&self) -> u32 {
        u32::from_le_bytes(self.checksum)
    }

    /// The ephemeral ECDH public key associated with the block.
    ///
    /// An all-zero key means the payload is not encrypted.
    #[inline]
    pub(crate) fn pub_key(&self) -> PublicKey {
        self.pub_key
    }

    /// Reads a header back from its bytes representation.
    #[inline]
    pub(crate) fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        // SAFETY: Every field is a byte array, any bit pattern is a valid header.
        unsafe { mem::transmute(bytes) }
    }
}

/// A block view bound over a byte region.
pub(crate) struct Block<T>(T);

impl<T> Block<T>
where
    T: Deref<Target = [u8]>,
{
    #[inline]
    pub(crate) fn bind(inner: T) -> Self {
        // Check length and alignment.
        // The alignment of Header is `1`, so memory always conforms to this.
        debug_assert!(inner.len() >= Header::LEN, "the storage is too small");
        Self(inner)
    }

    /// Checks the correctness of the block.
    #[inline]
    pub(crate) fn validate(&self) -> bool {
        self.header().validate() && self.header().payload_len() <= self.capacity()
    }

    /// The length of the block payload.
    #[inline]
    pub(crate) fn payload_len(&self) -> usize {
        self.header().payload_len()
    }

    /// The sequence number of the block.
    #[inline]
    pub(crate) fn seq(&self) -> u32 {
        self.header().seq()
    }

    /// The capacity of the block payload.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.0.len() - Header::LEN
    }

    #[inline]
    pub(crate) fn header(&self) -> &Header {
        // SAFETY: The pointer to the inner is properly aligned for a `Header`. Also, it has
        // been verified at construction to ensure that there are no pointer out-of-bounds
        // issues here.
        unsafe {
            let ptr = self.0.as_ptr() as *const Header;
            &*ptr
        }
    }
}

impl<T> Block<T>
where
    T: DerefMut<Target = [u8]>,
{
    /// Initialize the block.
    pub(crate) fn initialize(&mut self, seq: u32, timestamp: i64, flags: u8, pub_key: PublicKey) {
        let header = self.header_mut();
        header.magic = Header::MAGIC;
        header.version = FORMAT_VERSION;
        header.flags = flags;
        header.seq = seq.to_le_bytes();
        header.timestamp = timestamp.to_le_bytes();
        header.length = 0u32.to_le_bytes();
        header.checksum = 0u32.to_le_bytes();
        header.pub_key = pub_key;
    }

    /// Writes bytes to the payload of the block, keeping the length and the
    /// running checksum in the header up to date.
    pub(crate) fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let old_len = self.payload_len();
        let new_len = old_len + bytes.len();

        // Checking for overflow
        if new_len > self.capacity() {
            return Err(Error::Overflow);
        }

        let payload = self.payload_mut();
        payload[old_len..new_len].copy_from_slice(bytes);

        let mut hasher = crc32fast::Hasher::new_with_initial(self.header().checksum());
        hasher.update(bytes);
        let checksum = hasher.finalize();

        let header = self.header_mut();
        header.checksum = checksum.to_le_bytes();
        header.length = (new_len as u32).to_le_bytes();
        Ok(())
    }

    /// Marks the block as recovered crash leftovers.
    #[inline]
    pub(crate) fn set_writeback(&mut self) {
        self.header_mut().flags |= FLAG_WRITEBACK;
    }

    #[inline]
    fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.0[Header::LEN..]
    }

    #[inline]
    fn header_mut(&mut self) -> &mut Header {
        // SAFETY: The pointer to the inner is properly aligned for a `Header`. Also, it has
        // been verified at construction to ensure that there are no pointer out-of-bounds
        // issues here.
        unsafe {
            let ptr = self.0.as_mut_ptr() as *mut Header;
            &mut *ptr
        }
    }
}

impl<T> Deref for Block<T>
where
    T: Deref<Target = [u8]>,
{
    type Target = [u8];

    /// The written prefix of the block: header plus payload.
    #[inline]
    fn deref(&self) -> &Self::Target {
        let len = self.payload_len().min(self.capacity()) + Header::LEN;
        &self.0[..len]
    }
}

#[cfg(test)]
mod tests {
    use crate::block::{Block, Header, FLAG_COMPRESSED};

    #[test]
    fn test_header_len() {
        assert_eq!(Header::LEN, 59);
    }

    #[test]
    fn test_block_roundtrip() {
        let mut memory = vec![0u8; 256];
        let mut block = Block::bind(memory.as_mut_slice());
        assert!(!block.validate());

        block.initialize(7, 1_700_000_000, FLAG_COMPRESSED, [0; 33]);
        assert!(block.validate());
        assert_eq!(block.seq(), 7);
        assert_eq!(block.payload_len(), 0);

        block.write(b"hello").unwrap();
        block.write(b" world").unwrap();
        assert_eq!(block.payload_len(), 11);
        assert_eq!(block.header().checksum(), crc32fast::hash(b"hello world"));

        let snapshot = (*block).to_vec();
        assert_eq!(snapshot.len(), Header::LEN + 11);
        assert_eq!(&snapshot[Header::LEN..], b"hello world");

        let header = Header::from_bytes(snapshot[..Header::LEN].try_into().unwrap());
        assert!(header.validate());
        assert!(header.is_compressed());
        assert!(!header.is_encrypted());
        assert_eq!(header.seq(), 7);
        assert_eq!(header.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_block_overflow() {
        let mut memory = vec![0u8; Header::LEN + 4];
        let mut block = Block::bind(memory.as_mut_slice());
        block.initialize(0, 0, 0, [0; 33]);

        block.write(b"1234").unwrap();
        assert!(block.write(b"5").is_err());
        assert_eq!(block.payload_len(), 4);
    }
}
