//! Renders one log record into a text line.
//!
//! The line layout is fixed:
//!
//! ```plain
//! YYYY-MM-DD HH:MM:SS.mmm [pid:tid*] L/TAG LOC - BODY\n
//! ```
//!
//! where `*` marks the main thread, `L` is the level letter and `LOC` falls back
//! from `file:line` to `func:line` to `:line` to the bare file or function name.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Local;

use crate::record::Record;

/// Length of the scratch buffer one formatted record is rendered into.
pub(crate) const SCRATCH_LEN: usize = 16 * 1024;

/// The formatter refuses to render into a buffer with less headroom than this.
const HEADROOM: usize = 5 * 1024;

/// Reserved tail so the header and the line terminator always fit after the body.
const BODY_RESERVE: usize = 130;

/// The body of a single record is clamped to this many bytes.
const MAX_BODY_LEN: usize = 0xFFFF;

// Rolling counters for records dropped by the headroom guard. Process-wide, like
// the error lines they feed.
static ERROR_COUNT: AtomicUsize = AtomicUsize::new(0);
static ERROR_SIZE: AtomicUsize = AtomicUsize::new(0);

/// A byte buffer with a hard capacity, the rendering target of the formatter.
pub(crate) struct LineBuf {
    buf: Vec<u8>,
    cap: usize,
}

impl LineBuf {
    #[inline]
    pub(crate) fn with_capacity(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap), cap }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }

    /// Appends bytes, silently truncating at capacity.
    fn push(&mut self, bytes: &[u8]) {
        let spare = self.cap - self.buf.len();
        let len = bytes.len().min(spare);
        self.buf.extend_from_slice(&bytes[..len]);
    }
}

impl std::fmt::Write for LineBuf {
    #[inline]
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.push(s.as_bytes());
        Ok(())
    }
}

/// Renders one record's header and body into `out` as a single `\n`-terminated
/// line.
///
/// With no `record`, only the body is emitted (the preamble writes use this). With
/// no `body`, the level letter is forced to `F` and the literal `NULL == log`
/// stands in for the body.
pub(crate) fn format_record(record: Option<&Record>, body: Option<&str>, out: &mut LineBuf) {
    use std::fmt::Write;

    if out.capacity() <= out.len() + HEADROOM {
        let count = ERROR_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        let size = body.map(|b| b.len()).unwrap_or(0);
        ERROR_SIZE.store(size, Ordering::Relaxed);

        if out.capacity() >= out.len() + 128 {
            _ = write!(out, "[F]log_size <= 5*1024, err({count}, {size})\n");
            ERROR_COUNT.store(0, Ordering::Relaxed);
            ERROR_SIZE.store(0, Ordering::Relaxed);
        }

        return;
    }

    if let Some(record) = record {
        let level = if body.is_some() { record.level() } else { crate::Level::Fatal };
        let tag = record.tag().filter(|t| !t.is_empty()).unwrap_or("-");
        let mark = if record.tid() == record.main_tid() { "*" } else { "" };

        if record.datetime().timestamp() != 0 {
            let local = record.datetime().with_timezone(&Local);
            _ = write!(out, "{}", local.format("%Y-%m-%d %H:%M:%S%.3f"));
        }

        _ = write!(out, " [{}:{}{}] {}/{} ", record.pid(), record.tid(), mark, level.letter(), tag);
        write_location(record, out);
        _ = write!(out, " - ");
    }

    match body {
        Some(body) => write_body(body, out),
        None => out.push(b"NULL == log"),
    }

    if out.as_bytes().last() != Some(&b'\n') {
        out.push(b"\n");
    }
}

/// `file:line`, falling back to `func:line`, `:line`, the bare file or function
/// name, or nothing.
fn write_location(record: &Record, out: &mut LineBuf) {
    use std::fmt::Write;

    let file = record.file().filter(|f| !f.is_empty());
    let func = record.func().filter(|f| !f.is_empty());

    match (record.line(), file, func) {
        (Some(line), Some(file), _) => _ = write!(out, "{file}:{line}"),
        (Some(line), None, Some(func)) => _ = write!(out, "{func}:{line}"),
        (Some(line), None, None) => _ = write!(out, ":{line}"),
        (None, Some(file), _) => _ = write!(out, "{file}"),
        (None, None, Some(func)) => _ = write!(out, "{func}"),
        (None, None, None) => {}
    }
}

/// Emits the (possibly multi-line) body, indenting continuation lines by four
/// spaces so stack traces stay readable.
fn write_body(body: &str, out: &mut LineBuf) {
    let mut limit = out.capacity().saturating_sub(out.len() + BODY_RESERVE);
    limit = limit.min(MAX_BODY_LEN);

    let mut remaining = &body.as_bytes()[..body.len().min(limit)];
    let mut first_line = true;

    loop {
        let split = remaining.iter().position(|&byte| byte == b'\n');
        let line = &remaining[..split.unwrap_or(remaining.len())];

        if !line.is_empty() {
            if !first_line {
                out.push(b"    ");
            }
            out.push(line);
            first_line = false;
        }

        match split {
            Some(at) => {
                out.push(b"\n");
                remaining = &remaining[at + 1..];
                if remaining.is_empty() {
                    break;
                }
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use crate::{
        format::{format_record, LineBuf, SCRATCH_LEN},
        Level, Record,
    };

    fn render(record: Option<&Record>, body: Option<&str>) -> String {
        let mut out = LineBuf::with_capacity(SCRATCH_LEN);
        format_record(record, body, &mut out);
        String::from_utf8(out.as_bytes().to_vec()).unwrap()
    }

    fn record() -> Record<'static> {
        Record::builder()
            .level(Level::Debug)
            .datetime(chrono::Utc.with_ymd_and_hms(2025, 12, 22, 10, 56, 27).unwrap())
            .pid(25449)
            .tid(25449)
            .main_tid(25449)
            .tag("Account")
            .file("LogActivity.kt")
            .line(212)
            .build()
    }

    #[test]
    fn test_line_layout() {
        let line = render(Some(&record()), Some("user login"));
        assert!(line.contains(" [25449:25449*] D/Account LogActivity.kt:212 - user login\n"));
        assert!(line.ends_with('\n'));
        // Local time keeps the millisecond field.
        assert!(line.contains(".000 ["));
    }

    #[test]
    fn test_location_fallbacks() {
        let rec = Record::builder().file(None).func("connect").line(7).build();
        assert!(render(Some(&rec), Some("x")).contains(" connect:7 - x\n"));

        let rec = Record::builder().file(None).func(None).line(7).build();
        assert!(render(Some(&rec), Some("x")).contains(" :7 - x\n"));

        let rec = Record::builder().file("a.rs").line(None).build();
        assert!(render(Some(&rec), Some("x")).contains(" a.rs - x\n"));

        let rec = Record::builder().build();
        assert!(render(Some(&rec), Some("x")).contains("  - x\n"));
    }

    #[test]
    fn test_main_thread_mark() {
        let rec = Record::builder().pid(1).tid(2).main_tid(3).build();
        assert!(render(Some(&rec), Some("x")).contains("[1:2] "));
        let rec = Record::builder().pid(1).tid(3).main_tid(3).build();
        assert!(render(Some(&rec), Some("x")).contains("[1:3*] "));
    }

    #[test]
    fn test_multiline_body() {
        let line = render(Some(&record()), Some("line1\nline2\nline3"));
        assert!(line.ends_with(" - line1\n    line2\n    line3\n"));

        // Empty continuation lines keep their line ending but get no indent.
        let line = render(Some(&record()), Some("a\n\nb"));
        assert!(line.ends_with(" - a\n\n    b\n"));
    }

    #[test]
    fn test_absent_body() {
        let line = render(Some(&record()), None);
        assert!(line.contains(" F/Account "));
        assert!(line.ends_with(" - NULL == log\n"));
    }

    #[test]
    fn test_bare_body() {
        assert_eq!(render(None, Some("preamble text")), "preamble text\n");
    }

    #[test]
    fn test_headroom_guard() {
        let mut out = LineBuf::with_capacity(SCRATCH_LEN);
        // Leave less than 5 KiB of headroom.
        format_record(Some(&record()), Some(&"x".repeat(11 * 1024)), &mut out);
        let pos = out.len();
        format_record(Some(&record()), Some("dropped"), &mut out);
        let tail = String::from_utf8_lossy(&out.as_bytes()[pos..]).into_owned();
        assert!(tail.starts_with("[F]log_size <= 5*1024, err(1, 7)"), "got: {tail}");
    }

    #[test]
    fn test_body_clamp() {
        let body = "y".repeat(100 * 1024);
        let mut out = LineBuf::with_capacity(256 * 1024);
        format_record(Some(&record()), Some(&body), &mut out);
        let rendered = out.len();
        // Clamped to 64 KiB of body plus the short header.
        assert!(rendered <= 0xFFFF + 256, "rendered {rendered}");
    }
}
