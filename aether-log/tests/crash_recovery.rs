use std::error::Error;

use aether_log::{decode, Appender, Config, Level, Mode, Record};
use tempfile::tempdir;

fn config(dir: &std::path::Path) -> Config {
    // Buffered sync mode: nothing reaches the log file until a flush, so the
    // mapped region is the only copy of the records.
    Config::new(dir, "app").mode(Mode::Sync).sync_flush_per_write(false)
}

fn record() -> Record<'static> {
    Record::builder().level(Level::Info).build()
}

/// A process that dies without closing leaves a decodable prefix in the mapped
/// buffer region.
#[test]
fn test_mmap_region_survives_crash() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?.path().join("logs");

    {
        let appender = Appender::new(config(&dir), None);
        appender.set_console_log(false);
        appender.write(Some(&record()), Some("one"));
        appender.write(Some(&record()), Some("two"));
        // No close, no flush: the appender just goes away.
    }

    let region_path = dir.join("app.mmap3");
    assert!(region_path.exists());

    let mut lines = Vec::new();
    decode(&region_path, None, |text| {
        lines.push(text.to_string());
        Ok(())
    })?;

    assert!(lines[0].ends_with(" - one\n"));
    assert!(lines[1].ends_with(" - two\n"));
    Ok(())
}

/// Reopening the module writes the crash leftovers back to the day file.
#[test]
fn test_writeback_on_reopen() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?.path().join("logs");

    {
        let appender = Appender::new(config(&dir), None);
        appender.set_console_log(false);
        appender.write(Some(&record()), Some("survivor"));
    }

    // Second run of the "process": recovery happens during construction.
    let appender = Appender::new(config(&dir), None);
    appender.set_console_log(false);
    appender.write(Some(&record()), Some("fresh"));
    appender.flush_sync();
    appender.close();

    let files = appender.file_paths();
    assert_eq!(files.len(), 1);

    let mut lines = Vec::new();
    decode(&files[0], None, |text| {
        lines.push(text.to_string());
        Ok(())
    })?;

    let survivor = lines.iter().position(|line| line.ends_with(" - survivor\n")).unwrap();
    let fresh = lines.iter().position(|line| line.ends_with(" - fresh\n")).unwrap();
    assert!(survivor < fresh);

    // The region was rearmed: opening a third time must not write anything back.
    let before = std::fs::metadata(&files[0])?.len();
    let appender = Appender::new(config(&dir), None);
    appender.set_console_log(false);
    appender.close();
    assert_eq!(std::fs::metadata(&files[0])?.len(), before);

    Ok(())
}
