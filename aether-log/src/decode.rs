//! Reconstructs formatted text lines from the block-framed binary files.
//!
//! A `.xlog` file is a concatenation of flushed blocks; a `.mmap3` buffer file
//! is one live block followed by whatever the region held before. Per block the
//! pipeline is: validate header → checksum → decrypt → inflate → split item
//! frames. Blocks that died mid-write (crash leftovers, writeback blocks) lack
//! their final cipher padding and deflate trailer; those decode to the longest
//! clean prefix of their items.

use std::{
    collections::HashMap,
    fs,
    io::{self, BufWriter, Write},
    path::Path,
};

use thiserror::Error;

use crate::{
    block::Header,
    buffer::ITEM_HEADER_LEN,
    compress::{Decompressor, DeflateDecompressor},
    encrypt::{
        ecdh::{ecdh_encryption_key, EMPTY_PUBLIC_KEY},
        AesDecryptor, Decryptor, EncryptionKey, PublicKey, SecretKey,
    },
    DecryptionError, DecompressionError, FORMAT_VERSION,
};

/// Errors that can be occurred during the log decoding process ([`decode`]).
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The file does not start with a valid block.
    #[error("the log file is invalid")]
    FileInvalid,
    /// The file ends inside a block payload.
    #[error("block {seq}: truncated payload")]
    TruncatedBlock { seq: u32 },
    /// The payload bytes do not match the checksum recorded in the header.
    #[error("block {seq}: checksum mismatch")]
    ChecksumMismatch { seq: u32 },
    /// The block is encrypted and no secret key was provided.
    #[error("block {seq}: encrypted, but no secret key was provided")]
    MissingSecretKey { seq: u32 },
    #[error("block {seq}: decryption: {source}")]
    Decrypt { seq: u32, source: DecryptionError },
    #[error("block {seq}: decompression: {source}")]
    Decompress { seq: u32, source: DecompressionError },
    /// An item frame of a clean block is malformed.
    #[error("block {seq}: malformed item frame")]
    BadFrame { seq: u32 },

    /// The collection of per-block errors; the remaining blocks were decoded.
    #[error("block errors: {:#?}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>())]
    Blocks(Vec<Error>),
}

/// Decodes the block-framed binary log file and calls back each reconstructed
/// text item in order.
///
/// Per-block failures are collected so later blocks still decode; they are
/// reported together as [`Error::Blocks`]. Only I/O errors from `callback`
/// abort immediately.
pub fn decode(
    path: impl AsRef<Path>,
    secret_key: Option<SecretKey>,
    mut callback: impl FnMut(&str) -> io::Result<()>,
) -> Result<(), Error> {
    let bytes = fs::read(path.as_ref())?;
    let mut data = bytes.as_slice();

    let mut keys = KeyCache::new(secret_key);
    let mut block_errors = Vec::new();
    let mut first = true;

    while data.len() >= Header::LEN {
        let header = Header::from_bytes(data[..Header::LEN].try_into().unwrap());
        if !header.validate() {
            if first {
                return Err(Error::FileInvalid);
            }
            // Trailing region bytes after the live block of a buffer file.
            break;
        }
        first = false;

        let seq = header.seq();
        let payload_len = header.payload_len();
        let available = data.len() - Header::LEN;
        let truncated = payload_len > available;
        let taken = payload_len.min(available);
        let payload = &data[Header::LEN..Header::LEN + taken];
        data = &data[Header::LEN + taken..];

        if truncated {
            block_errors.push(Error::TruncatedBlock { seq });
        }

        // Unsupported versions are skipped, the framing still tells us where the
        // next block starts.
        if header.version() != FORMAT_VERSION {
            continue;
        }

        if !truncated && crc32fast::hash(payload) != header.checksum() {
            block_errors.push(Error::ChecksumMismatch { seq });
            continue;
        }

        let relaxed = truncated || header.is_writeback();
        match decode_block(&header, payload, relaxed, &mut keys, &mut callback) {
            Ok(()) => {}
            Err(err @ Error::Io(_)) => return Err(err),
            Err(err) => block_errors.push(err),
        }
    }

    if block_errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Blocks(block_errors))
    }
}

/// Decodes the binary log file into a readable text file.
///
/// Errors may be occurred during writing, and the destination file may have
/// been created by then. The caller is responsible for managing the destination
/// file (e.g., deleting it) afterwards.
pub fn decode_to_file(
    path: impl AsRef<Path>,
    dest_path: impl AsRef<Path>,
    secret_key: Option<SecretKey>,
) -> Result<(), Error> {
    let dest_path = dest_path.as_ref();
    let mut writer = BufWriter::new(DestFile { path: dest_path, file: None });
    decode(path, secret_key, |text| writer.write_all(text.as_bytes()))?;
    writer.flush()?;
    Ok(())
}

// ============ Internal ============

/// The destination text file, created only once there is a first line to
/// write, so a decode that yields nothing leaves no empty file behind.
struct DestFile<'a> {
    path: &'a Path,
    file: Option<fs::File>,
}

impl io::Write for DestFile<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(file) = self.file.as_mut() {
            return file.write(buf);
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.file.insert(fs::File::create(self.path)?).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Negotiated block keys, cached by ephemeral public point.
struct KeyCache {
    secret_key: Option<SecretKey>,
    keys: HashMap<PublicKey, EncryptionKey>,
}

impl KeyCache {
    fn new(secret_key: Option<SecretKey>) -> Self {
        Self { secret_key, keys: HashMap::new() }
    }

    fn obtain(&mut self, seq: u32, pub_key: PublicKey) -> Result<EncryptionKey, Error> {
        if let Some(key) = self.keys.get(&pub_key) {
            return Ok(*key);
        }
        let Some(secret_key) = self.secret_key.as_ref() else {
            return Err(Error::MissingSecretKey { seq });
        };
        let key = ecdh_encryption_key(secret_key, &pub_key)
            .map_err(|source| Error::Decrypt { seq, source })?;
        self.keys.insert(pub_key, key);
        Ok(key)
    }
}

fn decode_block(
    header: &Header,
    payload: &[u8],
    relaxed: bool,
    keys: &mut KeyCache,
    callback: &mut impl FnMut(&str) -> io::Result<()>,
) -> Result<(), Error> {
    let seq = header.seq();
    let mut relaxed = relaxed;

    let decrypted = if header.is_encrypted() && header.pub_key() != EMPTY_PUBLIC_KEY {
        let key = keys.obtain(seq, header.pub_key())?;
        match decrypt_payload(&key, payload, !relaxed) {
            Ok(plain) => Some(plain),
            // A block that died mid-write carries no final padding; fall back to
            // prefix decoding of its whole cipher blocks.
            Err(_) if !relaxed => {
                relaxed = true;
                decrypt_payload(&key, payload, false)
                    .map_err(|source| Error::Decrypt { seq, source })?
                    .into()
            }
            Err(source) => return Err(Error::Decrypt { seq, source }),
        }
    } else {
        None
    };
    let stage: &[u8] = decrypted.as_deref().unwrap_or(payload);

    let inflated = if header.is_compressed() {
        let mut decompressor = DeflateDecompressor::new();
        let mut sink = Vec::new();
        decompressor
            .decompress(stage, &mut sink)
            .map_err(|source| Error::Decompress { seq, source })?;
        Some(sink)
    } else {
        None
    };
    let mut items: &[u8] = inflated.as_deref().unwrap_or(stage);

    while !items.is_empty() {
        if items.len() < ITEM_HEADER_LEN {
            return if relaxed { Ok(()) } else { Err(Error::BadFrame { seq }) };
        }
        let len = u16::from_le_bytes(items[..2].try_into().unwrap()) as usize;
        if items.len() < ITEM_HEADER_LEN + len {
            return if relaxed { Ok(()) } else { Err(Error::BadFrame { seq }) };
        }

        let text = String::from_utf8_lossy(&items[ITEM_HEADER_LEN..ITEM_HEADER_LEN + len]);
        callback(&text)?;
        items = &items[ITEM_HEADER_LEN + len..];
    }

    Ok(())
}

fn decrypt_payload(
    key: &EncryptionKey,
    payload: &[u8],
    padded: bool,
) -> Result<Vec<u8>, DecryptionError> {
    let mut decryptor = AesDecryptor::new(key);
    let mut sink = Vec::with_capacity(payload.len());
    decryptor.decrypt(payload, padded, &mut sink)?;
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::{decode::decode, Config, Level, Mode, Record, Xlog};

    #[test]
    fn test_decode_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.xlog");
        std::fs::write(&path, b"definitely not a block").unwrap();

        assert!(matches!(decode(&path, None, |_| Ok(())), Err(super::Error::FileInvalid)));
    }

    #[test]
    fn test_decode_roundtrip_plain() {
        let dir = tempdir().unwrap();
        let engine = Xlog::with_tracker(None);

        let config = Config::new(dir.path().join("logs"), "plain")
            .mode(Mode::Sync)
            .compress(false);
        let handle = engine.new_instance(config, Some(Level::Verbose)).unwrap();
        engine.set_console_log_open(handle, false);

        let record = Record::builder().level(Level::Info).build();
        engine.write(handle, Some(&record), Some("alpha"));
        engine.write(handle, Some(&record), Some("beta"));

        let files = engine.get_log_files("plain");
        assert_eq!(files.len(), 1);

        let mut lines = Vec::new();
        decode(&files[0], None, |text| {
            lines.push(text.to_string());
            Ok(())
        })
        .unwrap();

        // The preamble comes first, then the two records, in order.
        assert!(lines.iter().any(|line| line.starts_with("^^^^^^^^^^")));
        let alpha = lines.iter().position(|line| line.ends_with(" - alpha\n")).unwrap();
        let beta = lines.iter().position(|line| line.ends_with(" - beta\n")).unwrap();
        assert!(alpha < beta);

        engine.shutdown();
    }
}
