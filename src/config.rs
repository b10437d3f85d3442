//! Config file parsing and CLI argument definitions (spec §6 "Config
//! file", "CLI").
//!
//! Grounded on `original_source/cachefilesd.c:read_config` and its
//! `getopt(3)` loop in `main`. Unlike the original's single pass that both
//! validates and forwards lines to the kernel fd, this module only parses
//! into a [`Config`]; every recognized command except `culltable` (which
//! has no kernel-side counterpart) is collected into `passthrough`
//! alongside the unrecognized lines, and writing them to the channel is
//! the control loop's job (`main.rs`), since this module has no channel to
//! write to and shouldn't need one to be testable.

use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;

use clap::Parser;

use crate::error::{Error, Result};

/// `cachefilesd [-d]... [-s] [-n] [-p <pidfile>] [-f <configfile>] [-F] [-c] [-v]`
/// (spec §6 "CLI").
#[derive(Parser, Debug)]
#[command(name = "cachefilesd", version, about = "CacheFiles userspace culling and fsck daemon")]
pub struct Cli {
    /// Increase debug verbosity (cumulative).
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    pub debug: u8,

    /// Log to stderr instead of syslog.
    #[arg(short = 's')]
    pub stderr_log: bool,

    /// Don't daemonize.
    #[arg(short = 'n')]
    pub no_daemon: bool,

    /// PID file path.
    #[arg(short = 'p')]
    pub pidfile: Option<PathBuf>,

    /// Config file path.
    #[arg(short = 'f', default_value = "/etc/cachefilesd.conf")]
    pub configfile: PathBuf,

    /// Force a deep fsck scan on startup.
    #[arg(short = 'F')]
    pub force_scan: bool,

    /// Offline scan-only mode: fsck then exit, never engaging the kernel.
    #[arg(short = 'c')]
    pub scan_only: bool,
}

impl Cli {
    pub fn parse_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Cli::try_parse_from(args).map_err(|e| Error::usage(e.to_string()))
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.debug {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

/// Parsed contents of `/etc/cachefilesd.conf` (spec §6 "Config file").
#[derive(Debug, Default, Clone)]
pub struct Config {
    /// `dir <path>` — mandatory cache root.
    pub dir: Option<PathBuf>,
    pub tag: Option<String>,
    pub nocull: bool,
    pub culltable_exponent: u32,
    /// Lines this daemon doesn't interpret itself, forwarded verbatim to
    /// the kernel channel once bound (spec §6: "All unknown/non-local
    /// lines are written verbatim to the kernel channel").
    pub passthrough: Vec<String>,
}

const DEFAULT_CULLTABLE_EXPONENT: u32 = 16;

impl Config {
    pub fn dir(&self) -> Result<&PathBuf> {
        self.dir
            .as_ref()
            .ok_or_else(|| Error::usage("config file has no 'dir' command"))
    }
}

/// Parses a config file's contents (spec §6 grammar, grounded on
/// `read_config`'s line loop). `max_line_len` is normally `page_size::get()`
/// (spec: "max line length = system page size").
pub fn parse(text: &str, max_line_len: usize) -> Result<Config> {
    let mut cfg = Config {
        culltable_exponent: DEFAULT_CULLTABLE_EXPONENT,
        ..Config::default()
    };

    for (lineno, raw_line) in text.lines().enumerate() {
        let lineno = lineno + 1;
        if raw_line.len() >= max_line_len {
            return Err(Error::usage(format!("line {lineno} is too long")));
        }
        if memchr::memchr(0, raw_line.as_bytes()).is_some() {
            return Err(Error::usage(format!("line {lineno} contains a NUL byte")));
        }

        let line = raw_line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, rest) = split_key(line);
        match key {
            // `culltable` is consumed purely locally; every other recognized
            // command still gets forwarded to the kernel once bound, same as
            // the unrecognized ones (only `culltable` has no kernel-side
            // counterpart in `read_config`).
            "nocull" => {
                cfg.nocull = true;
                cfg.passthrough.push(line.to_string());
            }
            "culltable" => {
                let value = rest.trim();
                let exp: u32 = value
                    .parse()
                    .map_err(|_| Error::usage(format!("line {lineno}: invalid culltable size")))?;
                if !(12..=20).contains(&exp) {
                    return Err(Error::usage(format!(
                        "line {lineno}: log2 of cull table size must be 12 <= N <= 20"
                    )));
                }
                cfg.culltable_exponent = exp;
            }
            "dir" => {
                let path = rest.trim();
                if path.is_empty() {
                    return Err(Error::usage(format!("line {lineno}: 'dir' needs a path")));
                }
                cfg.dir = Some(PathBuf::from(path));
                cfg.passthrough.push(line.to_string());
            }
            "tag" => {
                cfg.tag = Some(rest.trim().to_string());
                cfg.passthrough.push(line.to_string());
            }
            "bind" => {
                return Err(Error::usage(format!(
                    "line {lineno}: 'bind' command not permitted in config"
                )))
            }
            _ => cfg.passthrough.push(line.to_string()),
        }
    }

    Ok(cfg)
}

/// Splits `"key rest-of-line"` into `(key, rest)`; `rest` is `""` if there
/// is no whitespace after the key (matching the original's `isspace(cp[n])`
/// guard, which treats `dirx` as an unrecognized/passthrough line rather
/// than a malformed `dir` command).
fn split_key(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], &line[i..]),
        None => (line, ""),
    }
}

/// Reads and parses a config file from disk.
pub fn read_file(path: &std::path::Path, max_line_len: usize) -> Result<Config> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::usage(format!("unable to open {}: {e}", path.display())))?;
    parse(&text, max_line_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dir_and_culltable() {
        let cfg = parse("dir /var/cache/fscache\nculltable 14\n", 4096).unwrap();
        assert_eq!(cfg.dir, Some(PathBuf::from("/var/cache/fscache")));
        assert_eq!(cfg.culltable_exponent, 14);
    }

    #[test]
    fn ignores_blank_and_comment_lines() {
        let cfg = parse("\n# a comment\n  \ndir /x\n", 4096).unwrap();
        assert_eq!(cfg.dir, Some(PathBuf::from("/x")));
    }

    #[test]
    fn rejects_bind_command() {
        assert!(parse("bind\n", 4096).is_err());
    }

    #[test]
    fn rejects_out_of_range_culltable() {
        assert!(parse("culltable 11\n", 4096).is_err());
        assert!(parse("culltable 21\n", 4096).is_err());
    }

    #[test]
    fn nocull_sets_flag() {
        let cfg = parse("nocull\n", 4096).unwrap();
        assert!(cfg.nocull);
    }

    #[test]
    fn unrecognized_lines_become_passthrough() {
        let cfg = parse("brun 10%\nfrun 5%\n", 4096).unwrap();
        assert_eq!(cfg.passthrough, vec!["brun 10%", "frun 5%"]);
    }

    #[test]
    fn dir_nocull_and_tag_are_also_forwarded_to_the_kernel() {
        // Only `culltable` is purely local; everything else the daemon
        // recognizes still needs to reach the kernel once bound.
        let cfg = parse("dir /x\nnocull\ntag mytag\nculltable 14\n", 4096).unwrap();
        assert_eq!(cfg.passthrough, vec!["dir /x", "nocull", "tag mytag"]);
    }

    #[test]
    fn rejects_line_exceeding_max_length() {
        let long_line = format!("dir {}\n", "a".repeat(5000));
        assert!(parse(&long_line, 4096).is_err());
    }

    #[test]
    fn rejects_nul_byte_in_line() {
        let err = parse("dir /x\0evil\n", 4096);
        assert!(err.is_err());
    }
}
