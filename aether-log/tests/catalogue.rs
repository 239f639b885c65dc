use std::{
    error::Error,
    fs,
    time::{Duration, SystemTime},
};

use aether_log::{Appender, Config, Level, Mode, Record};
use chrono::{Days, Local};
use tempfile::tempdir;

const DAY_SECS: u64 = 24 * 60 * 60;

fn day_file_name(days_ago: u64) -> String {
    let date = Local::now().date_naive().checked_sub_days(Days::new(days_ago)).unwrap();
    format!("app_{}.xlog", date.format("%Y%m%d"))
}

fn plant_file(dir: &std::path::Path, name: &str, days_ago: u64) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, b"block bytes").unwrap();
    let mtime = SystemTime::now() - Duration::from_secs(days_ago * DAY_SECS);
    let file = fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(mtime).unwrap();
    path
}

fn build_appender(
    log_dir: &std::path::Path,
    cache_dir: &std::path::Path,
) -> std::sync::Arc<Appender> {
    let config = Config::new(log_dir, "app").cache_dir(cache_dir).mode(Mode::Sync);
    let appender = Appender::new(config, None);
    appender.set_console_log(false);
    appender
}

#[test]
fn test_day_bucket_queries() -> Result<(), Box<dyn Error>> {
    let root = tempdir()?;
    let (log_dir, cache_dir) = (root.path().join("logs"), root.path().join("cache"));
    let appender = build_appender(&log_dir, &cache_dir);

    plant_file(&log_dir, &day_file_name(0), 0);
    plant_file(&log_dir, &day_file_name(2), 2);
    plant_file(&cache_dir, &day_file_name(2), 2);
    plant_file(&log_dir, &day_file_name(5), 5);

    // An empty bucket stays empty.
    assert!(appender.file_infos_by_days(3).is_empty());

    let day2 = appender.file_infos_by_days(2);
    assert_eq!(day2.len(), 2);
    assert!(day2.iter().any(|info| !info.is_cache));
    assert!(day2.iter().any(|info| info.is_cache));

    // Out-of-range day counts clamp instead of scanning a millennium.
    assert!(appender.file_infos_by_days(40_000).is_empty());

    appender.close();
    Ok(())
}

#[test]
fn test_time_range_queries() -> Result<(), Box<dyn Error>> {
    let root = tempdir()?;
    let (log_dir, cache_dir) = (root.path().join("logs"), root.path().join("cache"));
    let appender = build_appender(&log_dir, &cache_dir);

    let day0 = plant_file(&log_dir, &day_file_name(0), 0);
    let day2 = plant_file(&log_dir, &day_file_name(2), 2);
    let day5 = plant_file(&log_dir, &day_file_name(5), 5);

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;

    // [day-5 .. day-1] picks up day-5 and day-2 but not today.
    let start = now - 5 * DAY_SECS as i64 - 60;
    let end = now - DAY_SECS as i64;
    let infos = appender.file_infos_by_time_range(start, end);
    let paths: Vec<_> = infos.iter().map(|info| info.path.clone()).collect();
    assert!(paths.contains(&day5));
    assert!(paths.contains(&day2));
    assert!(!paths.contains(&day0));

    // Sorted newest first.
    assert!(infos.windows(2).all(|pair| pair[0].mtime_ms >= pair[1].mtime_ms));

    // An inverted range yields nothing.
    assert!(appender.file_infos_by_time_range(end, start).is_empty());

    // A 200-day window is clamped to the last 30 days.
    plant_file(&log_dir, &day_file_name(40), 40);
    let infos = appender.file_infos_by_time_range(now - 200 * DAY_SECS as i64, now);
    let names: Vec<_> = infos
        .iter()
        .map(|info| info.path.file_name().unwrap().to_str().unwrap().to_string())
        .collect();
    assert!(!names.contains(&day_file_name(40)));
    assert!(names.contains(&day_file_name(2)));

    appender.close();
    Ok(())
}

#[test]
fn test_today_listing_and_cache() -> Result<(), Box<dyn Error>> {
    let root = tempdir()?;
    let (log_dir, cache_dir) = (root.path().join("logs"), root.path().join("cache"));
    let appender = build_appender(&log_dir, &cache_dir);

    assert!(appender.file_infos().is_empty());

    let record = Record::builder().level(Level::Info).build();
    appender.write(Some(&record), Some("hello"));
    appender.clear_file_cache();

    let infos = appender.file_infos();
    assert_eq!(infos.len(), 1);
    assert!(infos[0].size > 0);
    assert!(infos[0].mtime_ms > 0);

    // No duplicates, unique paths.
    let listed_twice = appender.file_infos();
    assert_eq!(listed_twice, infos);

    // Deleting the file behind the cache invalidates it.
    fs::remove_file(&infos[0].path)?;
    assert!(appender.file_infos().is_empty());

    appender.close();
    Ok(())
}

/// Rotation indices: suffixed files sort into the same day bucket.
#[test]
fn test_rotated_files_in_bucket() -> Result<(), Box<dyn Error>> {
    let root = tempdir()?;
    let (log_dir, cache_dir) = (root.path().join("logs"), root.path().join("cache"));
    let appender = build_appender(&log_dir, &cache_dir);

    let primary = day_file_name(0);
    let rotated = primary.replace(".xlog", "_1.xlog");
    plant_file(&log_dir, &primary, 0);
    plant_file(&log_dir, &rotated, 0);
    // Files that merely share the prefix do not match the day pattern.
    plant_file(&log_dir, &primary.replace(".xlog", "_x.xlog"), 0);

    let infos = appender.file_infos_by_days(0);
    assert_eq!(infos.len(), 2);

    let mut paths: Vec<_> =
        infos.iter().map(|info| info.path.file_name().unwrap().to_owned()).collect();
    paths.sort();
    assert_eq!(paths, vec![primary.into(), rotated.into()] as Vec<std::ffi::OsString>);

    appender.close();
    Ok(())
}
