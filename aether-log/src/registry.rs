//! The process-wide registry: name-prefix → module instance, the legacy global
//! module, and the management surface exposed to the binding layer.
//!
//! One mutex guards the maps. It is held for map mutation only — header
//! emission and every flush happen after the lock is dropped, so a slow module
//! cannot stall lookups of the others.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock},
};

use crate::{
    appender::Appender,
    catalogue::FileInfo,
    category::Category,
    header,
    record::{Level, Record},
    stderr_tracker, Config, Mode, Tracker,
};

/// A stable opaque identifier for a module instance.
///
/// Handles are backed by shared ownership: a handle that outlives its instance
/// resolves to nothing instead of to freed memory.
pub type Handle = u64;

/// The handle routing to the legacy global module.
pub const GLOBAL_HANDLE: Handle = 0;

struct Entry {
    category: Arc<Category>,
    handle: Handle,
}

#[derive(Default)]
struct State {
    categories: HashMap<String, Entry>,
    handles: HashMap<Handle, Arc<Category>>,
    header_written: HashSet<String>,
    next_handle: Handle,
    global: Option<Arc<Category>>,
}

/// The logging engine: all process-wide state behind explicit init/teardown.
///
/// Tests construct their own instance with [`Xlog::new`]; hosts normally use
/// the process-wide one managed by [`init`] / [`global`] / [`teardown`].
pub struct Xlog {
    state: Mutex<State>,
    custom_header: Mutex<Option<String>>,
    tracker: Mutex<Option<Tracker>>,
}

impl Xlog {
    /// Constructs a fresh engine with the default stderr tracker.
    #[inline]
    pub fn new() -> Self {
        Self::with_tracker(Some(stderr_tracker()))
    }

    /// Constructs a fresh engine reporting interior errors to `tracker`.
    pub fn with_tracker(tracker: Option<Tracker>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            custom_header: Mutex::new(None),
            tracker: Mutex::new(tracker),
        }
    }

    // ============ Lifecycle ============

    /// Creates the module instance for `config`, or returns the existing one
    /// registered under the same name prefix.
    ///
    /// Returns `None` when the configuration is invalid. The header preamble is
    /// emitted exactly once per prefix, after the registry lock is dropped.
    pub fn new_instance(&self, config: Config, level: Option<Level>) -> Option<Handle> {
        config.validate().ok()?;
        let prefix = config.prefix().to_string();

        let (category, handle, emit_header) = {
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.categories.get(&prefix) {
                return Some(entry.handle);
            }

            let tracker = self.tracker.lock().unwrap().clone();
            let appender = Appender::new(config, tracker);
            let category = Category::with_appender(appender, level);

            state.next_handle += 1;
            let handle = state.next_handle;
            state
                .categories
                .insert(prefix.clone(), Entry { category: Arc::clone(&category), handle });
            state.handles.insert(handle, Arc::clone(&category));

            // Flagged before emission so a racing creator cannot double-emit.
            let emit_header = state.header_written.insert(prefix);
            (category, handle, emit_header)
        };

        if emit_header {
            let custom = self.custom_header.lock().unwrap().clone();
            header::write_header(&category, custom.as_deref());
        }
        Some(handle)
    }

    /// The handle registered under `name`, if any.
    pub fn get_instance(&self, name: &str) -> Option<Handle> {
        self.state.lock().unwrap().categories.get(name).map(|entry| entry.handle)
    }

    /// Detaches the instance registered under `name` and schedules the delayed
    /// destruction of its appender. In-flight writers holding the old handle
    /// finish against the still-alive appender during the grace window.
    pub fn release_instance(&self, name: &str) {
        let entry = {
            let mut state = self.state.lock().unwrap();
            let entry = state.categories.remove(name);
            if let Some(entry) = &entry {
                state.handles.remove(&entry.handle);
                state.header_written.remove(name);
            }
            entry
        };

        if let Some(entry) = entry {
            if let Some(appender) = entry.category.appender() {
                Appender::delay_release(Arc::clone(appender));
            }
        }
    }

    /// Opens (or fetches) the instance for `config`, makes it the legacy
    /// global target, and sets the global level.
    pub fn open(&self, level: Level, config: Config) -> Option<Handle> {
        let handle = self.new_instance(config, Some(level))?;
        let category = self.category_for(handle)?;

        self.state.lock().unwrap().global = Some(Arc::clone(&category));
        category.set_level(Some(level));
        Some(handle)
    }

    /// Closes the legacy global module and drops its registry entry.
    pub fn close(&self) {
        let category = {
            let mut state = self.state.lock().unwrap();
            let Some(category) = state.global.take() else {
                return;
            };

            let name = state
                .categories
                .iter()
                .find(|(_, entry)| Arc::ptr_eq(&entry.category, &category))
                .map(|(name, _)| name.clone());
            if let Some(name) = name {
                if let Some(entry) = state.categories.remove(&name) {
                    state.handles.remove(&entry.handle);
                }
                state.header_written.remove(&name);
            }
            category
        };

        if let Some(appender) = category.appender() {
            appender.flush_sync();
            appender.close();
        }
    }

    /// Flushes every instance and closes it, then clears the registry. The
    /// process-wide [`teardown`] calls this.
    pub fn shutdown(&self) {
        self.flush_all(true);

        let categories: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.global = None;
            state.handles.clear();
            state.header_written.clear();
            state.categories.drain().map(|(_, entry)| entry.category).collect()
        };

        for category in categories {
            if let Some(appender) = category.appender() {
                appender.close();
            }
        }
    }

    // ============ Hot path ============

    /// Writes one record through the instance behind `handle`
    /// ([`GLOBAL_HANDLE`] routes to the legacy global module).
    pub fn write(&self, handle: Handle, record: Option<&Record>, body: Option<&str>) {
        if let Some(category) = self.category_for(handle) {
            category.write(record, body);
        }
    }

    /// Whether a record at `level` would pass the gate of `handle`.
    pub fn is_enabled_for(&self, handle: Handle, level: Level) -> bool {
        self.category_for(handle).map(|category| category.is_enabled_for(level)).unwrap_or(false)
    }

    // ============ Flush ============

    /// Flushes the legacy global module.
    pub fn flush(&self, is_sync: bool) {
        if let Some(category) = self.category_for(GLOBAL_HANDLE) {
            flush_category(&category, is_sync);
        }
    }

    /// Flushes the legacy global module, then every registered instance.
    pub fn flush_all(&self, is_sync: bool) {
        let (global, categories) = {
            let state = self.state.lock().unwrap();
            let categories: Vec<_> =
                state.categories.values().map(|entry| Arc::clone(&entry.category)).collect();
            (state.global.clone(), categories)
        };

        if let Some(category) = global {
            flush_category(&category, is_sync);
        }
        for category in categories {
            flush_category(&category, is_sync);
        }
    }

    /// Flushes the instance registered under `name`. The registry lock is
    /// dropped before the flush.
    pub fn flush_module(&self, name: &str, is_sync: bool) {
        let category = {
            let state = self.state.lock().unwrap();
            state.categories.get(name).map(|entry| Arc::clone(&entry.category))
        };
        if let Some(category) = category {
            flush_category(&category, is_sync);
        }
    }

    // ============ Per-instance management ============

    /// Sets the level gate of the legacy global module.
    pub fn set_level(&self, level: Option<Level>) {
        self.set_level_for(GLOBAL_HANDLE, level);
    }

    /// The level gate of the legacy global module.
    pub fn get_level(&self) -> Option<Level> {
        self.get_level_for(GLOBAL_HANDLE)
    }

    /// Sets the level gate of the instance behind `handle`.
    pub fn set_level_for(&self, handle: Handle, level: Option<Level>) {
        if let Some(category) = self.category_for(handle) {
            category.set_level(level);
        }
    }

    /// The level gate of the instance behind `handle`.
    pub fn get_level_for(&self, handle: Handle) -> Option<Level> {
        self.category_for(handle).and_then(|category| category.level())
    }

    /// Switches the write mode of the instance behind `handle` in place.
    pub fn set_appender_mode(&self, handle: Handle, mode: Mode) {
        if let Some(appender) = self.appender_for(handle) {
            appender.set_mode(mode);
        }
    }

    /// Mirrors the instance's writes to standard error.
    pub fn set_console_log_open(&self, handle: Handle, is_open: bool) {
        if let Some(appender) = self.appender_for(handle) {
            appender.set_console_log(is_open);
        }
    }

    /// Enables size-based rotation for the instance; `0` disables it.
    pub fn set_max_file_size(&self, handle: Handle, bytes: u64) {
        if let Some(appender) = self.appender_for(handle) {
            appender.set_max_file_size(bytes);
        }
    }

    /// Sets the retention horizon of the instance, in seconds.
    pub fn set_max_alive_time(&self, handle: Handle, seconds: u64) {
        if let Some(appender) = self.appender_for(handle) {
            appender.set_max_alive_time(seconds);
        }
    }

    /// Replaces the process-wide custom header text emitted into future
    /// preambles.
    pub fn set_custom_header_info(&self, info: Option<String>) {
        *self.custom_header.lock().unwrap() = info;
    }

    // ============ File catalogue ============

    /// Today's file paths for the instance registered under `name`.
    pub fn get_log_files(&self, name: &str) -> Vec<PathBuf> {
        self.appender_by_name(name).map(|appender| appender.file_paths()).unwrap_or_default()
    }

    /// Today's file infos for the instance registered under `name`.
    pub fn get_log_file_infos(&self, name: &str) -> Vec<FileInfo> {
        self.appender_by_name(name).map(|appender| appender.file_infos()).unwrap_or_default()
    }

    /// The instance's files of the day `days_ago` days back.
    pub fn get_log_file_infos_by_days(&self, name: &str, days_ago: u32) -> Vec<FileInfo> {
        self.appender_by_name(name)
            .map(|appender| appender.file_infos_by_days(days_ago))
            .unwrap_or_default()
    }

    /// The instance's files modified within `[start_s, end_s]`.
    pub fn get_log_file_infos_by_time_range(
        &self,
        name: &str,
        start_s: i64,
        end_s: i64,
    ) -> Vec<FileInfo> {
        self.appender_by_name(name)
            .map(|appender| appender.file_infos_by_time_range(start_s, end_s))
            .unwrap_or_default()
    }

    /// Drops the cached file listing of the instance registered under `name`.
    pub fn clear_file_cache(&self, name: &str) {
        if let Some(appender) = self.appender_by_name(name) {
            appender.clear_file_cache();
        }
    }

    /// Drops the cached file listing of every registered instance.
    pub fn clear_all_file_cache(&self) {
        let appenders: Vec<_> = {
            let state = self.state.lock().unwrap();
            state
                .categories
                .values()
                .filter_map(|entry| entry.category.appender().cloned())
                .collect()
        };
        for appender in appenders {
            appender.clear_file_cache();
        }
    }

    // ============ Internal ============

    fn category_for(&self, handle: Handle) -> Option<Arc<Category>> {
        let state = self.state.lock().unwrap();
        if handle == GLOBAL_HANDLE {
            state.global.clone()
        } else {
            state.handles.get(&handle).cloned()
        }
    }

    fn appender_for(&self, handle: Handle) -> Option<Arc<Appender>> {
        self.category_for(handle).and_then(|category| category.appender().cloned())
    }

    fn appender_by_name(&self, name: &str) -> Option<Arc<Appender>> {
        let state = self.state.lock().unwrap();
        state.categories.get(name).and_then(|entry| entry.category.appender().cloned())
    }
}

impl Default for Xlog {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

fn flush_category(category: &Category, is_sync: bool) {
    if let Some(appender) = category.appender() {
        if is_sync {
            appender.flush_sync();
        } else {
            appender.flush();
        }
    }
}

// ============ Process-wide instance ============

static ENGINE: OnceLock<Mutex<Option<Arc<Xlog>>>> = OnceLock::new();

fn engine_cell() -> &'static Mutex<Option<Arc<Xlog>>> {
    ENGINE.get_or_init(|| Mutex::new(None))
}

/// Initializes (or returns) the process-wide engine.
pub fn init() -> Arc<Xlog> {
    let mut cell = engine_cell().lock().unwrap();
    cell.get_or_insert_with(|| Arc::new(Xlog::new())).clone()
}

/// The process-wide engine, if [`init`] has been called.
pub fn global() -> Option<Arc<Xlog>> {
    engine_cell().lock().unwrap().clone()
}

/// Shuts the process-wide engine down and drops it.
pub fn teardown() {
    let engine = engine_cell().lock().unwrap().take();
    if let Some(engine) = engine {
        engine.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::{registry::Xlog, Config, Level, Mode, Record};

    fn config(dir: &std::path::Path, prefix: &str) -> Config {
        Config::new(dir, prefix).mode(Mode::Sync)
    }

    #[test]
    fn test_same_prefix_same_handle() {
        let dir = tempdir().unwrap();
        let engine = Xlog::with_tracker(None);

        let first = engine.new_instance(config(dir.path(), "mod"), Some(Level::Debug)).unwrap();
        let second = engine.new_instance(config(dir.path(), "mod"), Some(Level::Error)).unwrap();
        assert_eq!(first, second);

        assert_eq!(engine.get_instance("mod"), Some(first));
        assert_eq!(engine.get_instance("other"), None);

        engine.shutdown();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let engine = Xlog::with_tracker(None);
        assert_eq!(engine.new_instance(Config::new("", "mod"), None), None);
        assert_eq!(engine.new_instance(Config::new("/tmp/x", ""), None), None);
    }

    #[test]
    fn test_release_then_get() {
        let dir = tempdir().unwrap();
        let engine = Xlog::with_tracker(None);

        let handle = engine.new_instance(config(dir.path(), "mod"), Some(Level::Debug)).unwrap();
        engine.release_instance("mod");
        assert_eq!(engine.get_instance("mod"), None);

        // A stale handle resolves to nothing rather than to freed memory.
        let record = Record::builder().level(Level::Info).build();
        engine.write(handle, Some(&record), Some("late"));

        engine.shutdown();
    }

    #[test]
    fn test_global_level_via_open() {
        let dir = tempdir().unwrap();
        let engine = Xlog::with_tracker(None);

        let handle = engine.open(Level::Warn, config(dir.path(), "main")).unwrap();
        engine.set_console_log_open(handle, false);
        assert_eq!(engine.get_level(), Some(Level::Warn));
        assert!(engine.is_enabled_for(crate::GLOBAL_HANDLE, Level::Error));
        assert!(!engine.is_enabled_for(crate::GLOBAL_HANDLE, Level::Info));

        engine.set_level(Some(Level::Verbose));
        assert!(engine.is_enabled_for(handle, Level::Verbose));

        engine.close();
        assert_eq!(engine.get_level(), None);
        assert_eq!(engine.get_instance("main"), None);
    }
}
