//! The per-module engine.
//!
//! An `Appender` owns the module's buffer, its flusher thread and its file
//! handles. Formatted records enter through [`Appender::write`]; buffered bytes
//! leave through the rotation and spillover state machine in `log2file`, which
//! picks the right day file in the log directory or, when that is unavailable,
//! in the cache directory.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::{Duration, Instant, SystemTime},
};

use chrono::Local;
use thiserror::Error;

use crate::{
    block,
    buffer::{self, LogBuffer, Region},
    catalogue::FileCache,
    compress::CompressionError,
    encrypt::{ecdh, EncryptionError, KeyError},
    format::{format_record, LineBuf, SCRATCH_LEN},
    mmap::Mmap,
    record::{Level, Record},
    Config, Mode, Tracker, BUFFER_LEN, FILE_EXTENSION, MMAP_EXTENSION,
};

/// The error type reported to the configured [`Track`] callback.
///
/// Nothing on the write path surfaces errors to the caller; these are the
/// degradations the engine absorbs instead.
///
/// [`Track`]: crate::Track
#[derive(Error, Debug)]
pub enum Error {
    #[error("compression: {0}")]
    Compress(#[from] CompressionError),
    #[error("encryption: {0}")]
    Encrypt(#[from] EncryptionError),
    #[error("key: {0}")]
    Key(#[from] KeyError),
    #[error("block: {0}")]
    Block(#[from] block::Error),
    #[error("buffer: {0}")]
    Buffer(#[from] buffer::Error),
    #[error("IO: {0}")]
    Io(#[from] io::Error),
}

/// The flusher wakes at least this often even without a wake signal.
const FLUSH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Buffered bytes at which an async write signals the flusher.
const WAKE_THRESHOLD: usize = BUFFER_LEN / 3;

/// Files older than this are deleted by the retention sweep. (10 days)
const DEFAULT_MAX_ALIVE_SECS: u64 = 10 * 24 * 60 * 60;

/// The retention sweep runs at most once per this interval.
const TRIM_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Spillover to the cache directory requires at least this much free space.
const CACHE_SPACE_THRESHOLD: u64 = 1024 * 1024 * 1024;

/// The grace before a released appender is actually closed.
const RELEASE_GRACE: Duration = Duration::from_secs(5);

/// The open day file, cached across writes while the calendar day and the
/// target directory stay the same.
struct FileState {
    file: Option<File>,
    open_day: Option<chrono::NaiveDate>,
    dir: PathBuf,
}

/// The per-module engine. See the module documentation.
pub struct Appender {
    pub(crate) config: Config,
    mode: AtomicU8,
    buffer: Mutex<LogBuffer>,
    cond: Condvar,
    file: Mutex<FileState>,
    flusher: Mutex<Option<thread::JoinHandle<()>>>,
    closed: AtomicBool,
    console: AtomicBool,
    max_file_size: AtomicU64,
    max_alive_secs: AtomicU64,
    mmap_millis: u64,
    pub(crate) file_cache: Mutex<FileCache>,
    last_trim: Mutex<Option<Instant>>,
    tracker: Option<Tracker>,
}

impl Appender {
    /// Constructs a new `Appender` for `config`.
    ///
    /// Directory or mapping failures degrade (heap buffer, tracked errors)
    /// rather than fail the construction. Crash leftovers found in the mapped
    /// region are written back to file before the first record.
    pub fn new(config: Config, tracker: Option<Tracker>) -> Arc<Self> {
        fs::create_dir_all(config.log_dir_path()).unwrap_or_else(track!(tracker));
        if let Some(cache_dir) = config.cache_dir_path() {
            fs::create_dir_all(cache_dir).unwrap_or_else(track!(tracker));
        }

        let region_dir = config.cache_dir_path().unwrap_or_else(|| config.log_dir_path());
        let region_path = region_dir.join(format!("{}.{}", config.prefix(), MMAP_EXTENSION));

        let started = Instant::now();
        let region = match Mmap::new(&region_path, BUFFER_LEN) {
            Ok(mmap) => Region::Mmap(mmap),
            Err(err) => {
                track!(tracker, Error::from(err));
                Region::Heap(vec![0u8; BUFFER_LEN].into_boxed_slice())
            }
        };
        let mmap_millis = started.elapsed().as_millis() as u64;

        let remote_key = config
            .pub_key_hex()
            .and_then(|hex| ecdh::public_key_from_hex(hex).map_err(track!(tracker)).ok());

        let buffer = LogBuffer::new(region, config.is_compress(), remote_key, tracker.clone());
        let mode = config.write_mode();

        let appender = Arc::new(Self {
            config,
            mode: AtomicU8::new(mode_to_raw(mode)),
            buffer: Mutex::new(buffer),
            cond: Condvar::new(),
            file: Mutex::new(FileState { file: None, open_day: None, dir: PathBuf::new() }),
            flusher: Mutex::new(None),
            closed: AtomicBool::new(false),
            console: AtomicBool::new(cfg!(debug_assertions)),
            max_file_size: AtomicU64::new(0),
            max_alive_secs: AtomicU64::new(DEFAULT_MAX_ALIVE_SECS),
            mmap_millis,
            file_cache: Mutex::new(FileCache::new()),
            last_trim: Mutex::new(None),
            tracker,
        });

        let recovered = appender.buffer.lock().unwrap().take_recovered();
        if let Some(bytes) = recovered {
            appender.log2file(&bytes, true);
        }

        if appender.mode() == Mode::Async {
            appender.start_flusher();
        }

        appender
    }

    /// Formats and buffers one record.
    ///
    /// Success means "enqueued", not "persisted": all interior failures degrade
    /// silently (see [`Error`]). A `None` record emits the bare body, a `None`
    /// body the `NULL == log` placeholder.
    pub fn write(&self, record: Option<&Record>, body: Option<&str>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        if self.console.load(Ordering::Relaxed) {
            self.console_line(record, body);
        }

        match self.mode() {
            Mode::Sync => self.write_sync(record, body),
            Mode::Async => self.write_async(record, body),
        }
    }

    fn write_sync(&self, record: Option<&Record>, body: Option<&str>) {
        let mut line = LineBuf::with_capacity(SCRATCH_LEN);
        format_record(record, body, &mut line);

        let snapshot = {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.write(line.as_bytes()).is_err() {
                return;
            }
            if self.config.is_sync_flush_per_write() {
                buffer.flush()
            } else {
                None
            }
        };

        if let Some(bytes) = snapshot {
            self.log2file(&bytes, false);
        }
    }

    fn write_async(&self, record: Option<&Record>, body: Option<&str>) {
        let mut buffer = self.buffer.lock().unwrap();

        let mut line = LineBuf::with_capacity(SCRATCH_LEN);
        format_record(record, body, &mut line);
        if buffer.write(line.as_bytes()).is_err() {
            return;
        }

        let fatal = record.map(|record| record.level() == Level::Fatal).unwrap_or(false);
        if buffer.len() >= WAKE_THRESHOLD || fatal {
            self.cond.notify_all();
        }
    }

    /// Wakes the flusher without blocking.
    pub fn flush(&self) {
        let _guard = self.buffer.lock().unwrap();
        self.cond.notify_all();
    }

    /// Snapshots and persists the buffer on the calling thread.
    ///
    /// Idempotent on an empty buffer: bytes the flusher already drained are not
    /// re-emitted.
    pub fn flush_sync(&self) {
        let snapshot = {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.is_empty() {
                return;
            }
            buffer.flush()
        };

        if let Some(bytes) = snapshot {
            self.log2file(&bytes, false);
        }
    }

    /// Shuts the appender down: wakes and joins the flusher, closes the open
    /// file handle. Records written after close are dropped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let _guard = self.buffer.lock().unwrap();
            self.cond.notify_all();
        }
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            _ = handle.join();
        }

        Self::close_log_file(&mut self.file.lock().unwrap());
    }

    /// Closes `appender` after a short grace, giving in-flight writers holding
    /// the instance time to finish.
    pub fn delay_release(appender: Arc<Self>) {
        thread::spawn(move || {
            thread::sleep(RELEASE_GRACE);
            appender.close();
        });
    }

    /// The current write mode.
    #[inline]
    pub fn mode(&self) -> Mode {
        raw_to_mode(self.mode.load(Ordering::Relaxed))
    }

    /// Switches the write mode in place. Switching to [`Mode::Async`] starts
    /// the flusher if it is not running yet.
    pub fn set_mode(self: &Arc<Self>, mode: Mode) {
        self.mode.store(mode_to_raw(mode), Ordering::Relaxed);
        if mode == Mode::Async {
            self.start_flusher();
        }
    }

    /// Mirrors every write to standard error.
    #[inline]
    pub fn set_console_log(&self, open: bool) {
        self.console.store(open, Ordering::Relaxed);
    }

    /// Enables size-based rotation; `0` disables it.
    #[inline]
    pub fn set_max_file_size(&self, bytes: u64) {
        self.max_file_size.store(bytes, Ordering::Relaxed);
    }

    /// The retention horizon for the hourly sweep, in seconds.
    #[inline]
    pub fn set_max_alive_time(&self, seconds: u64) {
        self.max_alive_secs.store(seconds, Ordering::Relaxed);
    }

    /// How long opening the buffer mapping took, for the header preamble.
    #[inline]
    pub(crate) fn mmap_millis(&self) -> u64 {
        self.mmap_millis
    }

    #[inline]
    pub(crate) fn max_file_size(&self) -> u64 {
        self.max_file_size.load(Ordering::Relaxed)
    }

    // ============ Flusher ============

    fn start_flusher(self: &Arc<Self>) {
        let mut guard = self.flusher.lock().unwrap();
        if guard.is_some() || self.closed.load(Ordering::Acquire) {
            return;
        }

        let appender = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("xlog-{}", self.config.prefix()))
            .spawn(move || appender.flusher_loop());
        match spawned {
            Ok(handle) => *guard = Some(handle),
            Err(err) => track!(self.tracker, Error::from(err)),
        }
    }

    fn flusher_loop(self: Arc<Self>) {
        loop {
            let snapshot = self.buffer.lock().unwrap().flush();
            if let Some(bytes) = snapshot {
                self.log2file(&bytes, true);
            }

            if self.closed.load(Ordering::Acquire) {
                break;
            }

            let guard = self.buffer.lock().unwrap();
            _ = self.cond.wait_timeout(guard, FLUSH_INTERVAL).unwrap();
        }
    }

    // ============ Files ============

    /// Moves one flushed block to disk: the rotation and spillover state
    /// machine. Holds the file mutex for the duration.
    fn log2file(&self, data: &[u8], move_from_cache: bool) {
        if data.is_empty() || self.config.log_dir_path().as_os_str().is_empty() {
            return;
        }

        let mut state = self.file.lock().unwrap();
        self.route_to_file(&mut state, data, move_from_cache);
        drop(state);

        self.maybe_trim();
    }

    fn route_to_file(&self, state: &mut FileState, data: &[u8], move_from_cache: bool) {
        let async_mode = self.mode() == Mode::Async;
        let log_dir = self.config.log_dir_path();

        let Some(cache_dir) = self.config.cache_dir_path() else {
            if self.open_log_file(state, log_dir) {
                self.write_file(state, data);
                if async_mode {
                    Self::close_log_file(state);
                }
            }
            return;
        };

        let now = Local::now();
        let cache_path = self.make_log_path(now, cache_dir);
        let cache_logs = self.should_cache(now);

        if (cache_logs || cache_path.exists()) && self.open_log_file(state, cache_dir) {
            self.write_file(state, data);
            if async_mode {
                Self::close_log_file(state);
            }

            if cache_logs || !move_from_cache {
                return;
            }

            // The log directory is reachable again: merge the spilled day file
            // back and drop it from the cache.
            let log_path = self.make_log_path(now, log_dir);
            match append_file(&cache_path, &log_path) {
                Ok(()) => {
                    Self::close_log_file(state);
                    fs::remove_file(&cache_path).unwrap_or_else(track!(self.tracker));
                }
                Err(err) => track!(self.tracker, Error::from(err)),
            }
            return;
        }

        let mut write_success = false;
        let open_success = self.open_log_file(state, log_dir);
        if open_success {
            write_success = self.write_file(state, data);
            if async_mode {
                Self::close_log_file(state);
            }
        }

        if !write_success {
            if open_success && !async_mode {
                Self::close_log_file(state);
            }
            if self.open_log_file(state, cache_dir) {
                self.write_file(state, data);
                if async_mode {
                    Self::close_log_file(state);
                }
            }
        }
    }

    /// Opens (or reuses) the day file in `dir` for appending.
    ///
    /// The cached handle stays valid while both the calendar day and the target
    /// directory match the previous open.
    fn open_log_file(&self, state: &mut FileState, dir: &Path) -> bool {
        let now = Local::now();
        let today = now.date_naive();

        if state.file.is_some() && state.open_day == Some(today) && state.dir == dir {
            return true;
        }
        Self::close_log_file(state);

        let path = self.make_log_path(now, dir);
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                state.file = Some(file);
                state.open_day = Some(today);
                state.dir = dir.to_path_buf();
                true
            }
            Err(err) => {
                track!(self.tracker, Error::from(err));
                false
            }
        }
    }

    fn close_log_file(state: &mut FileState) {
        state.file = None;
        state.open_day = None;
    }

    /// Appends `data`, rolling a partial write back by truncating to the
    /// pre-write length.
    fn write_file(&self, state: &mut FileState, data: &[u8]) -> bool {
        let Some(file) = state.file.as_mut() else {
            return false;
        };

        let before = match file.seek(SeekFrom::End(0)) {
            Ok(position) => position,
            Err(err) => {
                track!(self.tracker, Error::from(err));
                return false;
            }
        };

        if let Err(err) = file.write_all(data) {
            track!(self.tracker, Error::from(err));
            _ = file.set_len(before);
            _ = file.seek(SeekFrom::End(0));
            return false;
        }

        // Once the file crosses the rotation limit the handle is dropped, so the
        // next open picks the next index.
        let max = self.max_file_size();
        if max > 0 && before + data.len() as u64 >= max {
            Self::close_log_file(state);
        }
        true
    }

    /// `{prefix}_{YYYYMMDD}[_N].xlog` in `dir`, `N` chosen by
    /// [`next_file_index`] when size rotation is enabled.
    pub(crate) fn make_log_path(&self, now: chrono::DateTime<Local>, dir: &Path) -> PathBuf {
        let day_prefix = format!("{}_{}", self.config.prefix(), now.format("%Y%m%d"));
        let max = self.max_file_size();
        let index = if max > 0 { next_file_index(dir, &day_prefix, max) } else { 0 };

        let name = if index == 0 {
            format!("{day_prefix}.{FILE_EXTENSION}")
        } else {
            format!("{day_prefix}_{index}.{FILE_EXTENSION}")
        };
        dir.join(name)
    }

    /// Whether new logs should land in the cache directory: cache days are
    /// configured, today's file is absent from the log directory, and the cache
    /// filesystem has room to spare.
    fn should_cache(&self, now: chrono::DateTime<Local>) -> bool {
        let Some(cache_dir) = self.config.cache_dir_path() else {
            return false;
        };
        if self.config.cache_days_count() == 0 {
            return false;
        }

        if self.make_log_path(now, self.config.log_dir_path()).exists() {
            return false;
        }

        available_space(cache_dir).map(|avail| avail >= CACHE_SPACE_THRESHOLD).unwrap_or(false)
    }

    /// Deletes expired files from both directories, at most once per hour.
    fn maybe_trim(&self) {
        {
            let mut last = self.last_trim.lock().unwrap();
            if let Some(at) = *last {
                if at.elapsed() < TRIM_INTERVAL {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        let alive = Duration::from_secs(self.max_alive_secs.load(Ordering::Relaxed));
        let Some(horizon) = SystemTime::now().checked_sub(alive) else {
            return;
        };
        let name_prefix = format!("{}_", self.config.prefix());
        let suffix = format!(".{FILE_EXTENSION}");

        let dirs = [Some(self.config.log_dir_path()), self.config.cache_dir_path()];
        for dir in dirs.into_iter().flatten() {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if !name.starts_with(&name_prefix) || !name.ends_with(&suffix) {
                    continue;
                }
                let expired = entry
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .map(|mtime| mtime < horizon)
                    .unwrap_or(false);
                if expired {
                    fs::remove_file(entry.path()).unwrap_or_else(track!(self.tracker));
                }
            }
        }
    }

    fn console_line(&self, record: Option<&Record>, body: Option<&str>) {
        let mut line = LineBuf::with_capacity(SCRATCH_LEN);
        format_record(record, body, &mut line);
        eprint!("{}", String::from_utf8_lossy(line.as_bytes()));
    }
}

/// The lowest index whose day file is absent or still under `limit`; `0` names
/// the primary (unsuffixed) file.
fn next_file_index(dir: &Path, day_prefix: &str, limit: u64) -> u64 {
    let mut index = 0u64;
    loop {
        let name = if index == 0 {
            format!("{day_prefix}.{FILE_EXTENSION}")
        } else {
            format!("{day_prefix}_{index}.{FILE_EXTENSION}")
        };
        match fs::metadata(dir.join(name)) {
            Err(_) => return index,
            Ok(meta) if meta.len() < limit => return index,
            Ok(_) => index += 1,
        }
    }
}

/// Appends the content of `src` to `dst`.
fn append_file(src: &Path, dst: &Path) -> io::Result<()> {
    let mut src_file = File::open(src)?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut dst_file = OpenOptions::new().create(true).append(true).open(dst)?;
    io::copy(&mut src_file, &mut dst_file)?;
    Ok(())
}

/// Free bytes available to unprivileged callers on the filesystem of `path`.
fn available_space(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;

    let path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    // SAFETY: `path` is a valid NUL-terminated string and `stats` outlives the call.
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::statvfs(path.as_ptr(), &mut stats) };
    (result == 0).then(|| stats.f_bavail as u64 * stats.f_frsize as u64)
}

#[inline]
fn mode_to_raw(mode: Mode) -> u8 {
    match mode {
        Mode::Sync => 0,
        Mode::Async => 1,
    }
}

#[inline]
fn raw_to_mode(raw: u8) -> Mode {
    match raw {
        0 => Mode::Sync,
        _ => Mode::Async,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::Local;
    use tempfile::tempdir;

    use crate::{
        appender::{next_file_index, Appender},
        Config, Mode,
    };

    #[test]
    fn test_next_file_index() {
        let dir = tempdir().unwrap();
        let prefix = "app_20250101";

        assert_eq!(next_file_index(dir.path(), prefix, 16), 0);

        fs::write(dir.path().join("app_20250101.xlog"), [0u8; 16]).unwrap();
        assert_eq!(next_file_index(dir.path(), prefix, 16), 1);
        assert_eq!(next_file_index(dir.path(), prefix, 1024), 0);

        fs::write(dir.path().join("app_20250101_1.xlog"), [0u8; 16]).unwrap();
        fs::write(dir.path().join("app_20250101_2.xlog"), [0u8; 4]).unwrap();
        assert_eq!(next_file_index(dir.path(), prefix, 16), 2);
    }

    #[test]
    fn test_log_path_naming() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path(), "app").mode(Mode::Sync);
        let appender = Appender::new(config, None);
        appender.set_console_log(false);

        let now = Local::now();
        let path = appender.make_log_path(now, dir.path());
        let expected = format!("app_{}.xlog", now.format("%Y%m%d"));
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), expected);

        appender.close();
    }

    #[test]
    fn test_write_lands_in_day_file() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().join("logs"), "app").mode(Mode::Sync);
        let appender = Appender::new(config, None);
        appender.set_console_log(false);

        appender.write(None, Some("hello"));
        appender.close();

        let day_file = appender.make_log_path(Local::now(), &dir.path().join("logs"));
        let written = fs::metadata(&day_file).unwrap().len();
        assert!(written > 0);

        // The buffer region sits next to the day file.
        assert!(dir.path().join("logs").join("app.mmap3").exists());
    }
}
