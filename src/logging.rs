// Kernel logger: routes `log` records to a console sink
use core::fmt;

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Console output function records are written to.
pub type LogSink = fn(fmt::Arguments);

/// `log` backend forwarding formatted records to the registered sink.
pub struct KernelLogger {
    sink: Mutex<Option<LogSink>>,
}

impl KernelLogger {
    pub const fn new() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    pub fn set_sink(&self, sink: LogSink) {
        *self.sink.lock() = Some(sink);
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Copy the sink out so a sink that logs cannot deadlock.
        let sink = *self.sink.lock();
        if let Some(sink) = sink {
            sink(format_args!("[{}] {}: {}", record.level(), record.target(), record.args()));
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger::new();

/// `init` was called more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerError {
    AlreadyInstalled,
}

impl fmt::Display for LoggerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoggerError::AlreadyInstalled => write!(f, "kernel logger already installed"),
        }
    }
}

/// Install the kernel logger, writing records up to `level` to `sink`.
pub fn init(sink: LogSink, level: LevelFilter) -> Result<(), LoggerError> {
    log::set_logger(&LOGGER).map_err(|_| LoggerError::AlreadyInstalled)?;
    LOGGER.set_sink(sink);
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use alloc::vec::Vec;

    static CAPTURED: Mutex<Vec<String>> = Mutex::new(Vec::new());

    fn capture(args: fmt::Arguments) {
        CAPTURED.lock().push(alloc::format!("{}", args));
    }

    // The only test installing the global logger.
    #[test]
    fn records_reach_the_sink() {
        assert_eq!(init(capture, LevelFilter::Debug), Ok(()));
        assert_eq!(init(capture, LevelFilter::Debug), Err(LoggerError::AlreadyInstalled));

        log::info!(target: "kproc::logging", "hello {}", 42);
        log::trace!(target: "kproc::logging", "filtered");

        let captured = CAPTURED.lock();
        assert!(captured.iter().any(|line| line == "[INFO] kproc::logging: hello 42"));
        assert!(!captured.iter().any(|line| line.contains("filtered")));
    }
}
