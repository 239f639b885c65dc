//! The one-shot text preamble written at the start of each instance's stream.

use chrono::Local;

use crate::{category::Category, record::current_thread_id};

const PATH: &str = match option_env!("AETHER_PATH") {
    Some(value) => value,
    None => "aether",
};

const REVISION: &str = match option_env!("AETHER_REVISION") {
    Some(value) => value,
    None => "unknown",
};

const BUILD_TIME: &str = match option_env!("AETHER_BUILD_TIME") {
    Some(value) => value,
    None => "unknown",
};

const URL: &str = match option_env!("AETHER_URL") {
    Some(value) => value,
    None => "",
};

const BUILD_JOB: &str = match option_env!("AETHER_TAG") {
    Some(value) => value,
    None => "",
};

/// Writes the preamble through `category`, bypassing its level gate.
///
/// Idempotence lives in the registry: the per-prefix "written" flag is set
/// before this runs, so concurrent creators cannot double-emit.
pub(crate) fn write_header(category: &Category, custom: Option<&str>) {
    let now = Local::now();
    let mark = format!(
        "[{},{}][{}]",
        std::process::id(),
        current_thread_id(),
        now.format("%Y-%m-%d %z %H:%M:%S"),
    );
    category.write_plain(&format!("^^^^^^^^^^{BUILD_TIME}^^^^^^^^^^{mark}"));

    let mmap_millis =
        category.appender().map(|appender| appender.mmap_millis()).unwrap_or(0);
    category.write_plain(&format!("get mmap time: {mmap_millis}"));

    category.write_plain(&format!("AETHER_PATH: {PATH}"));
    category.write_plain(&format!("AETHER_REVISION: {REVISION}"));
    category.write_plain(&format!("AETHER_BUILD_TIME: {BUILD_TIME}"));

    if !URL.is_empty() {
        category.write_plain(&format!("AETHER_URL: {URL}"));
    }
    if !BUILD_JOB.is_empty() {
        category.write_plain(&format!("AETHER_BUILD_JOB: {BUILD_JOB}"));
    }

    if let Some(custom) = custom.filter(|custom| !custom.is_empty()) {
        category.write_plain("=== Custom Header Info ===");
        for line in custom.lines().filter(|line| !line.is_empty()) {
            category.write_plain(&format!("=== Header: {line} ==="));
        }
        category.write_plain("=== End Header Info ===");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::{
        category::{Category, RecordSink},
        header::write_header,
        Record,
    };

    #[derive(Default)]
    struct Collector(Mutex<Vec<String>>);

    impl RecordSink for Collector {
        fn write(&self, _record: Option<&Record>, body: Option<&str>) {
            self.0.lock().unwrap().push(body.unwrap_or_default().to_string());
        }
    }

    #[test]
    fn test_preamble_lines() {
        let collector = Arc::new(Collector::default());
        let category = Category::with_sink(collector.clone(), None);

        write_header(&category, Some("build=nightly\nflavor=arm64"));

        let lines = collector.0.lock().unwrap();
        assert!(lines[0].starts_with("^^^^^^^^^^"));
        assert!(lines[0].contains("]["));
        assert_eq!(lines[1], "get mmap time: 0");
        assert!(lines.iter().any(|line| line.starts_with("AETHER_PATH: ")));
        assert!(lines.iter().any(|line| line.starts_with("AETHER_REVISION: ")));
        assert!(lines.iter().any(|line| line.starts_with("AETHER_BUILD_TIME: ")));
        assert!(lines.contains(&"=== Custom Header Info ===".to_string()));
        assert!(lines.contains(&"=== Header: build=nightly ===".to_string()));
        assert!(lines.contains(&"=== Header: flavor=arm64 ===".to_string()));
        assert!(lines.last().unwrap().starts_with("=== End Header Info ==="));
    }

    #[test]
    fn test_preamble_without_custom_header() {
        let collector = Arc::new(Collector::default());
        let category = Category::with_sink(collector.clone(), None);

        write_header(&category, None);

        let lines = collector.0.lock().unwrap();
        assert!(!lines.iter().any(|line| line.contains("Custom Header Info")));
    }
}
