//! Module-filtered logger behind the `log` facade.
//!
//! The driver only ever calls `log::debug!` and friends. A kernel that wants
//! to see those records installs [`LOGGER`] once with [`init`], handing it a
//! [`LogSink`] (usually its console).

use core::fmt;

use lazy_static::lazy_static;
use log::{LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

/// Where formatted log lines end up.
pub trait LogSink: Send + Sync {
    fn write_line(&self, level: log::Level, target: &str, args: &fmt::Arguments);
}

/// Maximum number of module filters
const MAX_MODULE_FILTERS: usize = 32;
const MODULE_NAME_MAX: usize = 48;

#[derive(Debug, Clone, Copy)]
struct ModuleFilter {
    name: [u8; MODULE_NAME_MAX],
    name_len: usize,
    enabled: bool,
}

impl ModuleFilter {
    const fn new() -> Self {
        Self {
            name: [0; MODULE_NAME_MAX],
            name_len: 0,
            enabled: true,
        }
    }

    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = core::cmp::min(bytes.len(), MODULE_NAME_MAX);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name_len = len;
    }

    fn name(&self) -> &[u8] {
        &self.name[..self.name_len]
    }

    /// A filter for `ext2_fs::cache` also covers `ext2_fs::cache::tests`.
    fn matches(&self, target: &str) -> bool {
        if self.name_len == 0 {
            return false;
        }
        let target = target.as_bytes();
        target.starts_with(self.name())
            && (target.len() == self.name_len || target[self.name_len..].starts_with(b"::"))
    }
}

struct LoggerState {
    level: LevelFilter,
    module_filters: [ModuleFilter; MAX_MODULE_FILTERS],
    filter_count: usize,
    default_enabled: bool,
}

impl LoggerState {
    const fn new() -> Self {
        Self {
            level: crate::config::DEFAULT_LOG_LEVEL,
            module_filters: [ModuleFilter::new(); MAX_MODULE_FILTERS],
            filter_count: 0,
            default_enabled: true,
        }
    }

    fn set_module(&mut self, module: &str, enabled: bool) -> bool {
        for filter in &mut self.module_filters[..self.filter_count] {
            if filter.name() == module.as_bytes() {
                filter.enabled = enabled;
                return true;
            }
        }
        if self.filter_count < MAX_MODULE_FILTERS {
            let filter = &mut self.module_filters[self.filter_count];
            filter.set_name(module);
            filter.enabled = enabled;
            self.filter_count += 1;
            true
        } else {
            false
        }
    }

    fn is_module_enabled(&self, target: &str) -> bool {
        // Longest matching filter wins.
        self.module_filters[..self.filter_count]
            .iter()
            .filter(|f| f.matches(target))
            .max_by_key(|f| f.name_len)
            .map(|f| f.enabled)
            .unwrap_or(self.default_enabled)
    }
}

pub struct Logger {
    state: Mutex<LoggerState>,
    sink: Once<&'static dyn LogSink>,
}

impl Logger {
    fn new() -> Self {
        Self {
            state: Mutex::new(LoggerState::new()),
            sink: Once::new(),
        }
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.state.lock().level = level;
        log::set_max_level(level);
    }

    pub fn set_default_enabled(&self, enabled: bool) {
        self.state.lock().default_enabled = enabled;
    }

    /// Returns false when the filter table is full.
    pub fn enable_module(&self, module: &str) -> bool {
        self.state.lock().set_module(module, true)
    }

    pub fn disable_module(&self, module: &str) -> bool {
        self.state.lock().set_module(module, false)
    }

    fn would_log(&self, metadata: &Metadata) -> bool {
        let state = self.state.lock();
        metadata.level() <= state.level && state.is_module_enabled(metadata.target())
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.sink.get().is_some() && self.would_log(metadata)
    }

    fn log(&self, record: &Record) {
        if let Some(sink) = self.sink.get() {
            if self.would_log(record.metadata()) {
                sink.write_line(record.level(), record.target(), record.args());
            }
        }
    }

    fn flush(&self) {}
}

lazy_static! {
    pub static ref LOGGER: Logger = Logger::new();
}

/// Install the logger with `sink` as its output. Only the first call takes
/// effect; later calls just adjust the level.
pub fn init(sink: &'static dyn LogSink, level: LevelFilter) {
    LOGGER.sink.call_once(|| sink);
    LOGGER.set_level(level);
    if log::set_logger(&*LOGGER).is_err() {
        log::debug!("logging: facade already installed, level now {}", level);
    }
}

/// Initialize logging with a level and a default state for modules that
/// have no explicit filter.
pub fn init_with_module_filter(sink: &'static dyn LogSink, level: LevelFilter, default_enabled: bool) {
    LOGGER.set_default_enabled(default_enabled);
    init(sink, level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_filter_prefix_match() {
        let mut state = LoggerState::new();
        state.set_module("ext2_fs::cache", false);
        assert!(!state.is_module_enabled("ext2_fs::cache"));
        assert!(!state.is_module_enabled("ext2_fs::cache::tests"));
        assert!(state.is_module_enabled("ext2_fs::cached"));
        assert!(state.is_module_enabled("ext2_fs::dir"));
    }

    #[test]
    fn longest_filter_wins() {
        let mut state = LoggerState::new();
        state.default_enabled = false;
        state.set_module("ext2_fs", true);
        state.set_module("ext2_fs::bitmap", false);
        assert!(state.is_module_enabled("ext2_fs::inode"));
        assert!(!state.is_module_enabled("ext2_fs::bitmap"));
        assert!(!state.is_module_enabled("other_crate"));
    }

    struct Discard;

    impl LogSink for Discard {
        fn write_line(&self, _level: log::Level, _target: &str, _args: &fmt::Arguments) {}
    }

    #[test]
    fn repeated_init_adjusts_level() {
        static SINK: Discard = Discard;
        init(&SINK, LevelFilter::Warn);
        assert_eq!(LOGGER.state.lock().level, LevelFilter::Warn);
        init(&SINK, LevelFilter::Trace);
        assert_eq!(LOGGER.state.lock().level, LevelFilter::Trace);
        assert_eq!(log::max_level(), LevelFilter::Trace);
    }

    #[test]
    fn filter_table_is_bounded() {
        let mut state = LoggerState::new();
        for i in 0..MAX_MODULE_FILTERS {
            let name = alloc::format!("m{}", i);
            assert!(state.set_module(&name, true));
        }
        assert!(!state.set_module("one_too_many", true));
        // Updating an existing entry still works.
        assert!(state.set_module("m3", false));
        assert!(!state.is_module_enabled("m3"));
    }
}
