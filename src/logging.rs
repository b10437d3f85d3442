//! Logging setup (spec §6.4, ambient stack).
//!
//! Two backends, selected by `-s`: `env_logger` to stderr (the teacher's
//! own dev-dependency, promoted here to a real one since this crate is a
//! daemon binary rather than a library), or a thin `log::Log` that calls
//! straight through to `syslog(3)` via `libc::openlog`/`libc::syslog`,
//! mirroring `openlog("cachefilesd", LOG_PID, LOG_DAEMON)` in
//! `original_source/cachefilesd.c`.

use std::ffi::CString;
use std::sync::OnceLock;

use log::{Level, LevelFilter, Log, Metadata, Record};

struct SyslogLogger {
    level: LevelFilter,
}

impl Log for SyslogLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let priority = match record.level() {
            Level::Error => libc::LOG_ERR,
            Level::Warn => libc::LOG_WARNING,
            Level::Info => libc::LOG_NOTICE,
            Level::Debug => libc::LOG_INFO,
            Level::Trace => libc::LOG_DEBUG,
        };
        let msg = format!("{}", record.args());
        if let Ok(cmsg) = CString::new(msg.replace('\0', "")) {
            unsafe {
                libc::syslog(priority | libc::LOG_DAEMON, c"%s".as_ptr(), cmsg.as_ptr());
            }
        }
    }

    fn flush(&self) {}
}

static SYSLOG_OPENED: OnceLock<()> = OnceLock::new();

fn open_syslog() {
    SYSLOG_OPENED.get_or_init(|| {
        let ident = c"cachefilesd";
        unsafe {
            libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON);
        }
    });
}

/// Installs the global logger. `to_stderr` corresponds to `-s`; `level`
/// comes from `-d`'s cumulative count (spec §6 CLI).
pub fn init(to_stderr: bool, level: LevelFilter) {
    if to_stderr {
        env_logger::Builder::new()
            .filter_level(level)
            .format_timestamp(None)
            .init();
        return;
    }

    open_syslog();
    let logger = Box::new(SyslogLogger { level });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}
