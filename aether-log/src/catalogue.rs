//! Enumerates and filters the persisted files of one module.
//!
//! Today's listing is cached per appender, keyed by the calendar day it was
//! built on; the cache drops itself when the day rolls over or when a cached
//! entry can no longer be found on disk.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use chrono::{Days, Local, NaiveDate};

use crate::{appender::Appender, FILE_EXTENSION};

/// Queries are clamped to at most this many days back.
const MAX_DAYS_AGO: u32 = 365;

/// Time-range queries are clamped to a window of this many seconds.
const MAX_RANGE_SECS: i64 = 30 * 24 * 60 * 60;

/// One persisted log file, as reported to the host.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FileInfo {
    /// Absolute path of the file.
    pub path: PathBuf,
    /// File size in bytes.
    pub size: u64,
    /// Modification time in milliseconds since the unix epoch.
    pub mtime_ms: i64,
    /// Whether the file lives in the cache directory.
    pub is_cache: bool,
}

/// The per-appender listing cache for today's files.
pub(crate) struct FileCache {
    infos: Vec<FileInfo>,
    day: Option<NaiveDate>,
    valid: bool,
}

impl FileCache {
    #[inline]
    pub(crate) fn new() -> Self {
        Self { infos: Vec::new(), day: None, valid: false }
    }

    /// A cached listing is served only while it belongs to today and at least
    /// one of its entries still exists (a lightweight staleness probe, cheaper
    /// than re-stat-ing everything).
    fn is_valid_for(&self, today: NaiveDate) -> bool {
        if !self.valid || self.day != Some(today) {
            return false;
        }
        self.infos.is_empty() || self.infos.iter().any(|info| info.path.exists())
    }

    fn update(&mut self, today: NaiveDate, infos: Vec<FileInfo>) {
        self.infos = infos;
        self.day = Some(today);
        self.valid = true;
    }

    fn invalidate(&mut self) {
        self.infos.clear();
        self.day = None;
        self.valid = false;
    }
}

impl Appender {
    /// The paths of today's primary files, newest first.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.file_infos().into_iter().map(|info| info.path).collect()
    }

    /// Today's primary files in the log and cache directories, sorted by
    /// modification time descending. Served from the day cache when possible.
    pub fn file_infos(&self) -> Vec<FileInfo> {
        let today = Local::now().date_naive();
        {
            let cache = self.file_cache.lock().unwrap();
            if cache.is_valid_for(today) {
                return cache.infos.clone();
            }
        }

        let day_name = format!("{}_{}.{}", self.config.prefix(), today.format("%Y%m%d"), FILE_EXTENSION);
        let mut infos = Vec::new();
        let mut stat_failed = false;

        for (dir, is_cache) in self.scan_targets() {
            let path = dir.join(&day_name);
            if !path.exists() {
                continue;
            }
            match fs::metadata(&path) {
                Ok(meta) => infos.push(FileInfo {
                    path,
                    size: meta.len(),
                    mtime_ms: mtime_millis(&meta),
                    is_cache,
                }),
                // The file disappeared between the existence check and the stat.
                Err(_) => stat_failed = true,
            }
        }

        sort_newest_first(&mut infos);

        let mut cache = self.file_cache.lock().unwrap();
        if stat_failed {
            cache.invalidate();
        } else {
            cache.update(today, infos.clone());
        }
        infos
    }

    /// The files of the day `days_ago` days back (0 = today), in both
    /// directories, newest first. `days_ago` is clamped to one year.
    pub fn file_infos_by_days(&self, days_ago: u32) -> Vec<FileInfo> {
        let days_ago = days_ago.min(MAX_DAYS_AGO);
        let Some(date) = Local::now().date_naive().checked_sub_days(Days::new(days_ago as u64))
        else {
            return Vec::new();
        };

        let mut infos = Vec::new();
        let mut seen = HashSet::new();
        self.collect_day(date, &mut infos, &mut seen);
        sort_newest_first(&mut infos);
        infos
    }

    /// The files whose modification time falls into `[start_s, end_s]`
    /// (seconds since the epoch), newest first. The window is clamped to the
    /// last 30 days relative to `end_s`.
    pub fn file_infos_by_time_range(&self, start_s: i64, end_s: i64) -> Vec<FileInfo> {
        if start_s > end_s {
            return Vec::new();
        }
        let start_s = start_s.max(end_s.saturating_sub(MAX_RANGE_SECS));

        let Some(start_date) = local_date(start_s) else {
            return Vec::new();
        };
        let Some(end_date) = local_date(end_s) else {
            return Vec::new();
        };

        let mut infos = Vec::new();
        let mut seen = HashSet::new();
        let mut date = start_date;
        while date <= end_date {
            self.collect_day(date, &mut infos, &mut seen);
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }

        infos.retain(|info| {
            let mtime_s = info.mtime_ms / 1000;
            (start_s..=end_s).contains(&mtime_s)
        });
        sort_newest_first(&mut infos);
        infos
    }

    /// Drops the cached listing.
    pub fn clear_file_cache(&self) {
        self.file_cache.lock().unwrap().invalidate();
    }

    fn scan_targets(&self) -> Vec<(&Path, bool)> {
        let mut targets = vec![(self.config.log_dir_path(), false)];
        if let Some(cache_dir) = self.config.cache_dir_path() {
            targets.push((cache_dir, true));
        }
        targets
    }

    /// Gathers `{prefix}_{date}[_N].xlog` from both directories into `infos`.
    fn collect_day(
        &self,
        date: NaiveDate,
        infos: &mut Vec<FileInfo>,
        seen: &mut HashSet<PathBuf>,
    ) {
        let day_prefix = format!("{}_{}", self.config.prefix(), date.format("%Y%m%d"));

        for (dir, is_cache) in self.scan_targets() {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if !matches_day_file(name, &day_prefix) {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                let path = entry.path();
                if seen.insert(path.clone()) {
                    infos.push(FileInfo {
                        path,
                        size: meta.len(),
                        mtime_ms: mtime_millis(&meta),
                        is_cache,
                    });
                }
            }
        }
    }
}

/// `{day_prefix}.xlog` or `{day_prefix}_{N}.xlog`.
fn matches_day_file(name: &str, day_prefix: &str) -> bool {
    let Some(rest) = name.strip_prefix(day_prefix) else {
        return false;
    };
    let Some(rest) = rest.strip_suffix(FILE_EXTENSION) else {
        return false;
    };
    let Some(middle) = rest.strip_suffix('.') else {
        return false;
    };

    middle.is_empty()
        || (middle.len() > 1
            && middle.starts_with('_')
            && middle[1..].bytes().all(|byte| byte.is_ascii_digit()))
}

fn sort_newest_first(infos: &mut [FileInfo]) {
    infos.sort_by(|a, b| b.mtime_ms.cmp(&a.mtime_ms));
}

fn mtime_millis(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

fn local_date(timestamp_s: i64) -> Option<NaiveDate> {
    chrono::DateTime::from_timestamp(timestamp_s, 0)
        .map(|datetime| datetime.with_timezone(&Local).date_naive())
}
