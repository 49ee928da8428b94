use log::{Log, Metadata, Record, SetLoggerError};
use std::env;
use std::thread;

/// Adapted from SimpleLogger in crate `log`
struct EngineLogger;

impl Log for EngineLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!(
                "{:?}[{}:{}:{}] {}",
                thread::current().id(),
                record.level(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: EngineLogger = EngineLogger;

/// Installs the logger, with the maximum level taken from `RUST_LOG`.
/// Safe to call more than once; only the first call wins.
pub fn init() -> Result<(), SetLoggerError> {
    use log::LevelFilter;
    match env::var("RUST_LOG") {
        Ok(level) => match level.to_uppercase().as_ref() {
            "OFF" => log::set_max_level(LevelFilter::Off),
            "ERROR" => log::set_max_level(LevelFilter::Error),
            "WARN" => log::set_max_level(LevelFilter::Warn),
            "INFO" => log::set_max_level(LevelFilter::Info),
            "DEBUG" => log::set_max_level(LevelFilter::Debug),
            "TRACE" => log::set_max_level(LevelFilter::Trace),
            _ => log::set_max_level(LevelFilter::Info),
        },
        Err(_) => log::set_max_level(LevelFilter::Info),
    }
    log::set_logger(&LOGGER)
}
