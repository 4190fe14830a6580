//! Line-oriented debug log handed explicitly to every obfuscation stage.
//!
//! A [`DebugLog`] is either disabled or wraps a writer. Stages log through
//! [`cff_log!`](crate::cff_log), which checks [`DebugLog::is_enabled`] before
//! formatting anything, so a disabled log costs a single branch per call site.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Prefix written in front of every log line.
pub const LOG_PREFIX: &str = "[CFF] ";

/// Injectable sink for the textual progress log.
#[derive(Default)]
pub struct DebugLog {
    sink: Option<Box<dyn Write + Send>>,
}

impl DebugLog {
    /// A log that discards everything.
    pub const fn disabled() -> Self {
        Self { sink: None }
    }

    /// Creates (truncating) `path` and logs into it.
    pub fn to_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self::to_writer(BufWriter::new(file)))
    }

    /// Opens a file log when `path` is present, otherwise a disabled log.
    pub fn from_optional_path(path: Option<&Path>) -> io::Result<Self> {
        match path {
            Some(path) => Self::to_file(path),
            None => Ok(Self::disabled()),
        }
    }

    /// Logs into an arbitrary writer.
    pub fn to_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Some(Box::new(writer)),
        }
    }

    /// Whether lines written to this log go anywhere.
    pub const fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Writes one prefixed line. Prefer the [`cff_log!`](crate::cff_log) macro.
    ///
    /// A write failure disables the sink; the pass being logged is never
    /// failed because of it.
    pub fn line(&mut self, args: fmt::Arguments<'_>) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let result = sink
            .write_all(LOG_PREFIX.as_bytes())
            .and_then(|()| sink.write_fmt(args))
            .and_then(|()| sink.write_all(b"\n"));
        if let Err(err) = result {
            tracing::warn!("debug log disabled after write failure: {}", err);
            self.sink = None;
        }
    }

    /// Flushes buffered output.
    pub fn flush(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.flush() {
                tracing::warn!("debug log flush failed: {}", err);
                self.sink = None;
            }
        }
    }
}

impl Drop for DebugLog {
    fn drop(&mut self) {
        self.flush();
    }
}

impl fmt::Debug for DebugLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugLog")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Writes a formatted line to a [`DebugLog`] when it is enabled.
///
/// ```
/// use lunaris_utils::{cff_log, log::DebugLog};
///
/// let mut log = DebugLog::disabled();
/// cff_log!(log, "block {} starts at pc {}", 0, 0);
/// ```
#[macro_export]
macro_rules! cff_log {
    ($log:expr, $($arg:tt)*) => {{
        let log: &mut $crate::log::DebugLog = &mut $log;
        if log.is_enabled() {
            log.line(::std::format_args!($($arg)*));
        }
    }};
}
