//! The per-module routing object: a level gate in front of a write capability.

use std::sync::{Arc, Mutex};

use crate::{appender::Appender, record::Record, Level};

/// The write capability a [`Category`] dispatches to.
///
/// Production categories point at an [`Appender`]; tests install a collecting
/// sink instead.
pub trait RecordSink: Send + Sync {
    /// Consumes one record. A `None` record carries a bare body line (the
    /// header preamble), a `None` body renders the placeholder text.
    fn write(&self, record: Option<&Record>, body: Option<&str>);
}

impl RecordSink for Appender {
    #[inline]
    fn write(&self, record: Option<&Record>, body: Option<&str>) {
        Appender::write(self, record, body)
    }
}

/// The per-module level gate and dispatcher.
pub struct Category {
    level: Mutex<Option<Level>>,
    sink: Arc<dyn RecordSink>,
    appender: Option<Arc<Appender>>,
}

impl Category {
    /// Constructs a `Category` dispatching to `appender`.
    pub(crate) fn with_appender(appender: Arc<Appender>, level: Option<Level>) -> Arc<Self> {
        Arc::new(Self {
            level: Mutex::new(level),
            sink: appender.clone(),
            appender: Some(appender),
        })
    }

    /// Constructs a `Category` dispatching to an arbitrary sink. Management
    /// operations that need an appender are no-ops on such a category.
    pub fn with_sink(sink: Arc<dyn RecordSink>, level: Option<Level>) -> Arc<Self> {
        Arc::new(Self { level: Mutex::new(level), sink, appender: None })
    }

    /// The current level gate. `None` disables all records.
    #[inline]
    pub fn level(&self) -> Option<Level> {
        *self.level.lock().unwrap()
    }

    /// Replaces the level gate.
    #[inline]
    pub fn set_level(&self, level: Option<Level>) {
        *self.level.lock().unwrap() = level;
    }

    /// Whether a record at `level` would pass the gate.
    #[inline]
    pub fn is_enabled_for(&self, level: Level) -> bool {
        match self.level() {
            Some(current) => level >= current,
            None => false,
        }
    }

    /// Dispatches one record, subject to the level gate.
    pub fn write(&self, record: Option<&Record>, body: Option<&str>) {
        if let Some(record) = record {
            if !self.is_enabled_for(record.level()) {
                return;
            }
        }
        self.sink.write(record, body);
    }

    /// Emits a bare text line, bypassing the gate. The header preamble uses
    /// this.
    #[inline]
    pub(crate) fn write_plain(&self, body: &str) {
        self.sink.write(None, Some(body));
    }

    /// The underlying appender, for management operations.
    #[inline]
    pub fn appender(&self) -> Option<&Arc<Appender>> {
        self.appender.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::{category::{Category, RecordSink}, Level, Record};

    #[derive(Default)]
    struct Collector(Mutex<Vec<String>>);

    impl RecordSink for Collector {
        fn write(&self, _record: Option<&Record>, body: Option<&str>) {
            self.0.lock().unwrap().push(body.unwrap_or("<none>").to_string());
        }
    }

    #[test]
    fn test_level_gate() {
        let collector = Arc::new(Collector::default());
        let category = Category::with_sink(collector.clone(), Some(Level::Info));

        assert!(category.is_enabled_for(Level::Info));
        assert!(category.is_enabled_for(Level::Fatal));
        assert!(!category.is_enabled_for(Level::Debug));

        let debug = Record::builder().level(Level::Debug).build();
        let warn = Record::builder().level(Level::Warn).build();
        category.write(Some(&debug), Some("filtered"));
        category.write(Some(&warn), Some("passed"));

        assert_eq!(*collector.0.lock().unwrap(), vec!["passed".to_string()]);
    }

    #[test]
    fn test_none_disables_all() {
        let collector = Arc::new(Collector::default());
        let category = Category::with_sink(collector.clone(), None);

        assert!(!category.is_enabled_for(Level::Fatal));
        let fatal = Record::builder().level(Level::Fatal).build();
        category.write(Some(&fatal), Some("dropped"));
        assert!(collector.0.lock().unwrap().is_empty());

        // Plain (record-less) lines bypass the gate.
        category.write_plain("preamble");
        assert_eq!(*collector.0.lock().unwrap(), vec!["preamble".to_string()]);
    }

    #[test]
    fn test_set_level() {
        let collector = Arc::new(Collector::default());
        let category = Category::with_sink(collector, Some(Level::Error));
        assert_eq!(category.level(), Some(Level::Error));

        category.set_level(Some(Level::Verbose));
        assert!(category.is_enabled_for(Level::Verbose));
    }
}
