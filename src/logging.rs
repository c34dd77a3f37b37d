use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

/// Level from `TCD1304_LOG`, then `RUST_LOG`, defaulting to `info`.
pub fn env_level() -> LevelFilter {
    std::env::var("TCD1304_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

/// Initialize logging for Rust binaries (stderr formatter). Later calls are no-ops.
pub fn init_rust_logging() {
    let level = env_level();
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level.as_str().to_ascii_lowercase());
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}

#[cfg(feature = "python")]
pub use python_bridge::{init_python_logging, set_python_log_level};

#[cfg(feature = "python")]
mod python_bridge {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use log::{LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;

    use super::env_level;

    static PY_LOGGER: OnceCell<PyForwarder> = OnceCell::new();

    /// Forwards records to `logging.getLogger(<target>)` in Python.
    struct PyForwarder {
        max_level: AtomicUsize,
    }

    impl PyForwarder {
        fn level(&self) -> LevelFilter {
            match self.max_level.load(Ordering::Relaxed) {
                0 => LevelFilter::Off,
                1 => LevelFilter::Error,
                2 => LevelFilter::Warn,
                3 => LevelFilter::Info,
                4 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }

        fn python_level(level: log::Level) -> u32 {
            match level {
                log::Level::Error => 40,
                log::Level::Warn => 30,
                log::Level::Info => 20,
                log::Level::Debug => 10,
                log::Level::Trace => 5,
            }
        }
    }

    impl Log for PyForwarder {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= self.level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            let name = record.target().replace("::", ".");
            let message = record.args().to_string();
            let level = Self::python_level(record.level());
            Python::attach(|py| {
                let sent = py
                    .import("logging")
                    .and_then(|logging| logging.call_method1("getLogger", (name,)))
                    .and_then(|logger| logger.call_method1("log", (level, message)));
                if let Err(e) = sent {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust log records into Python's `logging`. Safe to call repeatedly.
    pub fn init_python_logging() {
        let level = env_level();
        let forwarder = PY_LOGGER.get_or_init(|| PyForwarder {
            max_level: AtomicUsize::new(level as usize),
        });
        if log::set_logger(forwarder).is_ok() {
            log::set_max_level(level);
        }
    }

    /// Change the minimum level forwarded to Python.
    pub fn set_python_log_level(level: LevelFilter) {
        init_python_logging();
        if let Some(forwarder) = PY_LOGGER.get() {
            forwarder.max_level.store(level as usize, Ordering::Relaxed);
        }
        log::set_max_level(level);
    }
}
