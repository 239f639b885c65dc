//! An on-device structured logging engine for mobile and embedded hosts.
//!
//! Applications submit log records at varying severities; the engine persists
//! them to rotating, day-partitioned files with minimal overhead, survives
//! process crashes without losing recent writes, and stays cheap enough to leave
//! enabled in production.
//!
//! ### Buffering & crash recovery
//!
//! Writes are absorbed by a fixed-size buffer backed by `mmap`, so that when the
//! program exits unexpectedly the OS still persists the buffered bytes. The next
//! time the same module is opened, the leftover block is written back to the log
//! file. When the mapping cannot be established the engine degrades to a heap
//! buffer with identical behavior minus crash survival.
//!
//! ### Compression
//!
//! Payloads are streamed through a raw deflate encoder, sync-flushed per record
//! so every completed item stays individually decodable.
//!
//! ### Encryption
//!
//! The engine uses `AES 128` for symmetric encryption and `ECDH` over NIST P-256
//! for key negotiation, so only a public key ever reaches the device. Every
//! block carries a fresh ephemeral public point in its header; the matching
//! secret key re-derives the block key offline.
//!
//! ### Modules
//!
//! Each named module owns its directory, file prefix, buffer and flusher. The
//! process-wide [`Xlog`] registry maps name prefixes to module instances and
//! also carries the legacy global module for unnamed callers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use aether_log::{Config, Level, Record, Xlog};
//!
//! let engine = Xlog::new();
//! let config = Config::new("/path/to/logs", "app").cache_dir("/path/to/cache");
//! let handle = engine.open(Level::Debug, config).unwrap();
//!
//! let record = Record::builder().level(Level::Info).build();
//! engine.write(handle, Some(&record), Some("hello world"));
//! engine.flush_all(true);
//! ```
//!
//! ### Decoding
//!
//! Persisted files are block-framed binary, not text. Use [`decode`] /
//! [`decode_to_file`] (or the companion command line tool) to reconstruct the
//! formatted lines, passing the ECDH secret key when the logs are encrypted.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Returns a closure that reports the error to tracker.
macro_rules! track {
    ($tracker:expr) => {{
        |err| {
            if let Some(ref tracker) = $tracker {
                tracker.track(err.into(), file!(), line!());
            }
        }
    }};
    ($tracker:expr, $err:expr) => {{
        if let Some(ref tracker) = $tracker {
            tracker.track(($err).into(), file!(), line!());
        }
    }};
}

pub mod record;
pub use record::*;

pub mod compress;
pub use compress::{CompressionError, DecompressionError};

pub mod encrypt;
pub use encrypt::{
    gen_key_pair, DecryptionError, EncryptionError, EncryptionKey, KeyError, PublicKey, SecretKey,
    PUBLIC_KEY_LEN,
};

pub mod block;
pub use block::Error as BlockError;

mod buffer;
pub use buffer::Error as BufferError;

mod appender;
pub use appender::{Appender, Error as AppenderError};

mod catalogue;
pub use catalogue::FileInfo;

mod category;
pub use category::{Category, RecordSink};

mod registry;
pub use registry::{global, init, teardown, Handle, Xlog, GLOBAL_HANDLE};

mod decode;
pub use decode::{decode, decode_to_file, Error as DecodeError};

mod common;
use common::*;

mod format;
mod header;
mod mmap;

/// The current format version of the block structure.
pub const FORMAT_VERSION: u8 = 1;

/// The extension of the persisted log files.
pub const FILE_EXTENSION: &str = "xlog";

/// The extension of the memory-mapped buffer file.
pub const MMAP_EXTENSION: &str = "mmap3";

/// The buffer region length (150 KB) absorbed before a flush.
pub const BUFFER_LEN: usize = 150 * 1024;

/// Errors that make a module configuration unusable.
#[derive(Error, Clone, Debug)]
pub enum ConfigError {
    /// The log directory is required.
    #[error("the log directory is empty")]
    MissingLogDir,
    /// The name prefix is required, it identifies the module's files and its
    /// registry entry.
    #[error("the name prefix is empty")]
    MissingNamePrefix,
}

/// The appender write mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Every write lands on disk before the call returns.
    Sync,
    /// Writes are buffered and drained by the module's flusher thread.
    Async,
}

/// Configuration of one log module. Immutable after the module is created.
#[derive(Clone, Debug)]
pub struct Config {
    mode: Mode,
    log_dir: PathBuf,
    cache_dir: Option<PathBuf>,
    name_prefix: String,
    pub_key: Option<String>,
    compress: bool,
    cache_days: u32,
    sync_flush_per_write: bool,
}

impl Config {
    /// Constructs a new `Config` for a module writing to `log_dir` with files
    /// named after `name_prefix`.
    #[inline]
    pub fn new(log_dir: impl Into<PathBuf>, name_prefix: impl Into<String>) -> Self {
        Self {
            mode: Mode::Async,
            log_dir: log_dir.into(),
            cache_dir: None,
            name_prefix: name_prefix.into(),
            pub_key: None,
            compress: true,
            cache_days: 0,
            sync_flush_per_write: true,
        }
    }

    /// The appender write mode.
    ///
    /// The default value is [`Mode::Async`].
    #[inline]
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// An auxiliary directory used when the log directory is temporarily
    /// unavailable, and for the buffer region when set.
    ///
    /// The default value is `None`.
    #[inline]
    pub fn cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    /// The encryption key: a hex-encoded compressed P-256 point.
    ///
    /// It is used to negotiate the per-block symmetric key. `None` (or an
    /// invalid key) means no encryption.
    ///
    /// The default value is `None`.
    #[inline]
    pub fn pub_key(mut self, pub_key: impl Into<String>) -> Self {
        self.pub_key = Some(pub_key.into());
        self
    }

    /// Whether block payloads are deflate-compressed.
    ///
    /// It is enabled by default.
    #[inline]
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// How many days new logs should prefer the cache directory while the log
    /// directory has no file for the day. `0` disables the behavior.
    #[inline]
    pub fn cache_days(mut self, cache_days: u32) -> Self {
        self.cache_days = cache_days;
        self
    }

    /// Whether [`Mode::Sync`] persists the buffer after every write.
    ///
    /// It is enabled by default; disabling it keeps Sync-mode writes buffered
    /// until an explicit flush.
    #[inline]
    pub fn sync_flush_per_write(mut self, flag: bool) -> Self {
        self.sync_flush_per_write = flag;
        self
    }

    /// Checks that the required fields are present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingLogDir);
        }
        if self.name_prefix.is_empty() {
            return Err(ConfigError::MissingNamePrefix);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn write_mode(&self) -> Mode {
        self.mode
    }

    #[inline]
    pub(crate) fn log_dir_path(&self) -> &Path {
        &self.log_dir
    }

    #[inline]
    pub(crate) fn cache_dir_path(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    #[inline]
    pub(crate) fn prefix(&self) -> &str {
        &self.name_prefix
    }

    #[inline]
    pub(crate) fn pub_key_hex(&self) -> Option<&str> {
        self.pub_key.as_deref().filter(|key| !key.is_empty())
    }

    #[inline]
    pub(crate) fn is_compress(&self) -> bool {
        self.compress
    }

    #[inline]
    pub(crate) fn cache_days_count(&self) -> u32 {
        self.cache_days
    }

    #[inline]
    pub(crate) fn is_sync_flush_per_write(&self) -> bool {
        self.sync_flush_per_write
    }
}

/// Represents a tracker used to track errors occurred from the engine internals.
///
/// The hot path never surfaces errors to the caller; the tracker is where the
/// degradations (mmap fallback, spillover, dropped records) become observable.
pub trait Track {
    /// Handles the error on the code location.
    fn track(&self, error: AppenderError, file: &'static str, line: u32);
}

impl<F> Track for F
where
    F: Fn(AppenderError, &'static str, u32),
{
    #[inline]
    fn track(&self, error: AppenderError, file: &'static str, line: u32) {
        self(error, file, line)
    }
}

/// Shared trait object type for [`Track`].
pub type Tracker = std::sync::Arc<dyn Track + Send + Sync>;

/// The default tracker, printing to standard error.
pub fn stderr_tracker() -> Tracker {
    std::sync::Arc::new(|error: AppenderError, file: &'static str, line: u32| {
        eprintln!("[aether-log] {file}:{line} | {error}");
    })
}

#[cfg(test)]
mod tests {
    use crate::{Config, ConfigError};

    #[test]
    fn test_config_validate() {
        assert!(Config::new("/tmp/logs", "app").validate().is_ok());
        assert!(matches!(
            Config::new("", "app").validate(),
            Err(ConfigError::MissingLogDir)
        ));
        assert!(matches!(
            Config::new("/tmp/logs", "").validate(),
            Err(ConfigError::MissingNamePrefix)
        ));
    }
}
