//! The log record.

/// Represents a date and time in the UTC time zone.
pub type DateTime = chrono::DateTime<chrono::Utc>;

/// Represents logging levels of a log record.
///
/// The default value in [`Record`] is [`Level::Info`].
#[repr(u8)]
#[non_exhaustive]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Level {
    /// The `verbose` log level.
    ///
    /// Logs may include more information than the `Debug` level and are usually not
    /// enabled in a production environment.
    Verbose = 0,
    /// The `debug` log level.
    ///
    /// Logs that contain information useful for debugging during development and
    /// troubleshooting.
    Debug,
    /// The `informational` log level.
    ///
    /// Infomational messages to track the general flow of the application.
    Info,
    /// The `warning` log level.
    ///
    /// It is used when something unexpected happened, or there might be a problem in
    /// the near future.
    Warn,
    /// The `error` log level.
    ///
    /// It is used when an operation fails.
    Error,
    /// The `fatal` log level.
    ///
    /// The highest level of severity. A fatal record forces a prompt flush of the
    /// buffered logs.
    Fatal,
}

impl Level {
    /// The single-letter rendering used in formatted log lines.
    #[inline]
    pub(crate) fn letter(&self) -> &'static str {
        match self {
            Self::Verbose => "V",
            Self::Debug => "D",
            Self::Info => "I",
            Self::Warn => "W",
            Self::Error => "E",
            Self::Fatal => "F",
        }
    }

    /// Returns the underlying primitive representation, the form binding
    /// layers marshal levels in.
    #[inline]
    pub fn primitive(&self) -> u8 {
        *self as u8
    }

    /// Constructs from the underlying primitive representation.
    pub fn from_primitive(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Verbose),
            1 => Some(Self::Debug),
            2 => Some(Self::Info),
            3 => Some(Self::Warn),
            4 => Some(Self::Error),
            5 => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// Represents one log record submitted to the engine.
///
/// The body of the log travels separately (see [`Category::write`]) so that the
/// record itself stays cheap to construct and copy around.
///
/// The default options are:
///
/// - [`Record::level`] : [`Level::Info`]
/// - [`Record::datetime`] : [`chrono::Utc::now()`]
/// - [`Record::pid`] : the current process id
/// - [`Record::tid`] / [`Record::main_tid`] : `0`
/// - tag, file, func, line : `None`
///
/// `Record` supports `Builder Pattern`, it can be constructed by `RecordBuilder`.
///
/// [`Category::write`]: crate::Category::write
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Record<'a> {
    level: Level,
    datetime: DateTime,
    pid: u32,
    tid: u64,
    main_tid: u64,
    tag: Option<&'a str>,
    file: Option<&'a str>,
    func: Option<&'a str>,
    line: Option<u32>,
}

impl<'a> Record<'a> {
    /// Constructs a new `Record` with default options; prefer [`Record::builder`].
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a builder for `Record`.
    #[inline]
    pub fn builder() -> RecordBuilder<'a> {
        RecordBuilder::new()
    }

    /// The level of the log.
    #[inline]
    pub fn level(&self) -> Level {
        self.level
    }

    /// The wall-clock datetime when the log was generated.
    #[inline]
    pub fn datetime(&self) -> DateTime {
        self.datetime
    }

    /// The id of the process where the log was generated.
    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The id of the thread where the log was generated.
    #[inline]
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// The id of the process main thread.
    #[inline]
    pub fn main_tid(&self) -> u64 {
        self.main_tid
    }

    /// An optional tag associated with the log.
    #[inline]
    pub fn tag(&self) -> Option<&'a str> {
        self.tag
    }

    /// The code file where the log was generated. `None` if not available.
    #[inline]
    pub fn file(&self) -> Option<&'a str> {
        self.file
    }

    /// The function where the log was generated. `None` if not available.
    #[inline]
    pub fn func(&self) -> Option<&'a str> {
        self.func
    }

    /// The code line where the log was generated. `None` if not available.
    #[inline]
    pub fn line(&self) -> Option<u32> {
        self.line
    }
}

impl<'a> Default for Record<'a> {
    #[inline]
    fn default() -> Self {
        Self {
            level: Level::Info,
            datetime: chrono::Utc::now(),
            pid: std::process::id(),
            tid: 0,
            main_tid: 0,
            tag: None,
            file: None,
            func: None,
            line: None,
        }
    }
}

/// Builder for [`Record`].
#[derive(Clone, Debug)]
pub struct RecordBuilder<'a> {
    record: Record<'a>,
}

impl<'a> RecordBuilder<'a> {
    /// Constructs a new `RecordBuilder` with default options.
    #[inline]
    pub fn new() -> Self {
        Self { record: Record::default() }
    }

    #[inline]
    pub fn level(mut self, level: Level) -> Self {
        self.record.level = level;
        self
    }

    #[inline]
    pub fn datetime(mut self, datetime: DateTime) -> Self {
        self.record.datetime = datetime;
        self
    }

    #[inline]
    pub fn pid(mut self, pid: u32) -> Self {
        self.record.pid = pid;
        self
    }

    #[inline]
    pub fn tid(mut self, tid: u64) -> Self {
        self.record.tid = tid;
        self
    }

    #[inline]
    pub fn main_tid(mut self, main_tid: u64) -> Self {
        self.record.main_tid = main_tid;
        self
    }

    #[inline]
    pub fn tag(mut self, tag: impl Into<Option<&'a str>>) -> Self {
        self.record.tag = tag.into();
        self
    }

    #[inline]
    pub fn file(mut self, file: impl Into<Option<&'a str>>) -> Self {
        self.record.file = file.into();
        self
    }

    #[inline]
    pub fn func(mut self, func: impl Into<Option<&'a str>>) -> Self {
        self.record.func = func.into();
        self
    }

    #[inline]
    pub fn line(mut self, line: impl Into<Option<u32>>) -> Self {
        self.record.line = line.into();
        self
    }

    /// Builds the `Record`.
    #[inline]
    pub fn build(self) -> Record<'a> {
        self.record
    }
}

impl<'a> Default for RecordBuilder<'a> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// An identifier for the calling thread, usable as [`Record::tid`].
#[inline]
pub fn current_thread_id() -> u64 {
    // A pthread handle is opaque but stable for the thread's lifetime, which is all
    // the log line needs.
    unsafe { libc::pthread_self() as u64 }
}
