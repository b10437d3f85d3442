//! The kernel control channel (spec §3 "Kernel channel", §4.4).
//!
//! A single fd (conventionally fd 3, or `/dev/cachefiles`/`/proc/fs/cachefiles`
//! opened by the caller) that the daemon writes short ASCII commands to and
//! reads whitespace-separated `key=value` state blobs from.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use log::{debug, warn};

use crate::error::{is_recoverable_errno, Error, Result};
use crate::queue::CullSink;

const STATE_BUF_LEN: usize = 4096;

/// The `key=value` blob the kernel publishes on every read (spec §6
/// "Responses read").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelState {
    pub cull: bool,
    pub fsck: bool,
    pub brun: u64,
    pub bcull: u64,
    pub bstop: u64,
    pub frun: u64,
    pub fcull: u64,
    pub fstop: u64,
}

pub struct Channel {
    file: File,
}

impl Channel {
    pub fn from_file(file: File) -> Self {
        Channel { file }
    }

    /// Takes ownership of an already-open fd (e.g. fd 3, handed to the
    /// daemon by the kernel or a supervisor).
    ///
    /// # Safety
    /// `fd` must be a valid, open, not-otherwise-owned file descriptor.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Channel {
            file: File::from_raw_fd(fd),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn send(&mut self, cmd: &str) -> Result<()> {
        debug!("-> {cmd}");
        match self.file.write(cmd.as_bytes()) {
            Ok(n) if n == cmd.len() => Ok(()),
            Ok(_) => self.recover_or_fail(cmd, io::Error::last_os_error()),
            Err(e) => self.recover_or_fail(cmd, e),
        }
    }

    fn recover_or_fail(&self, cmd: &str, err: io::Error) -> Result<()> {
        let errno = err.raw_os_error().unwrap_or(0);
        if is_recoverable_errno(errno) {
            debug!("cmd [{cmd}] recovered from errno {errno}");
            return Ok(());
        }
        Err(Error::KernelCommand {
            cmd: cmd.to_string(),
            errno,
        })
    }

    pub fn bind(&mut self) -> Result<()> {
        self.send("bind")
    }

    /// Forwards a config line the daemon didn't recognize verbatim to the
    /// kernel (spec §6.2: "Unrecognized/local lines are forwarded to the
    /// kernel channel verbatim when bound").
    pub fn send_config_line(&mut self, line: &str) -> Result<()> {
        self.send(line)
    }

    /// `cull <name>` — request the kernel move a named object into the
    /// graveyard (spec §6, `cull_file`).
    pub fn cull(&mut self, name: &str) -> Result<()> {
        self.send(&format!("cull {name}"))
    }

    pub fn rmslot(&mut self, slot: u32) -> Result<()> {
        self.send(&format!("rmslot {slot}"))
    }

    pub fn fixslot(&mut self, slot: u32) -> Result<()> {
        self.send(&format!("fixslot {slot}"))
    }

    pub fn inuse(&mut self, name: &str) -> Result<()> {
        self.send(&format!("inuse {name}"))
    }

    /// Report the fsck result code back to the kernel (spec §7 "Fsck-identified
    /// corruption ... reported via `fsck <rc>` to the kernel in online mode").
    pub fn fsck_result(&mut self, rc: i32) -> Result<()> {
        self.send(&format!("fsck {rc}"))
    }

    /// Read and parse the next state blob (spec §6 "Responses read").
    /// Unknown or malformed tokens are logged and ignored, matching
    /// `read_cache_state`; unlike the original, each recognized key updates
    /// only its own field (no accidental `else-if` chaining across keys).
    pub fn read_state(&mut self) -> Result<ChannelState> {
        let mut buf = [0u8; STATE_BUF_LEN];
        let n = self.file.read(&mut buf)?;
        let text = String::from_utf8_lossy(&buf[..n]);

        let mut state = ChannelState::default();
        for tok in text.split_whitespace() {
            let Some((key, value)) = tok.split_once('=') else {
                warn!("malformed kernel state token: {tok:?}");
                continue;
            };
            match key {
                "cull" => state.cull = parse_bool(value),
                "fsck" => state.fsck = parse_bool(value),
                "brun" => state.brun = parse_hex(value),
                "bcull" => state.bcull = parse_hex(value),
                "bstop" => state.bstop = parse_hex(value),
                "frun" => state.frun = parse_hex(value),
                "fcull" => state.fcull = parse_hex(value),
                "fstop" => state.fstop = parse_hex(value),
                _ => warn!("unrecognized kernel state key: {key:?}"),
            }
        }
        Ok(state)
    }
}

impl CullSink for Channel {
    fn cullslot(&mut self, slot: u32) -> io::Result<()> {
        let cmd = format!("cullslot {slot}");
        debug!("-> {cmd}");
        match self.file.write(cmd.as_bytes()) {
            Ok(n) if n == cmd.len() => Ok(()),
            Ok(_) => Err(io::Error::last_os_error()),
            Err(e) => Err(e),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    value.trim().parse::<u64>().map(|v| v != 0).unwrap_or(false)
}

fn parse_hex(value: &str) -> u64 {
    u64::from_str_radix(value.trim(), 16).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;

    fn memfile(contents: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(contents).unwrap();
        f.seek(io::SeekFrom::Start(0)).unwrap();
        f
    }

    #[test]
    fn read_state_parses_known_keys_independently() {
        let mut chan = Channel::from_file(memfile(
            b"cull=1 fsck=0 brun=a0 bcull=50 bstop=10 frun=ff00 fcull=ff01 fstop=ff02",
        ));
        let state = chan.read_state().unwrap();
        assert_eq!(
            state,
            ChannelState {
                cull: true,
                fsck: false,
                brun: 0xa0,
                bcull: 0x50,
                bstop: 0x10,
                frun: 0xff00,
                fcull: 0xff01,
                fstop: 0xff02,
            }
        );
    }

    #[test]
    fn read_state_ignores_malformed_and_unknown_tokens() {
        let mut chan = Channel::from_file(memfile(b"cull=1 garbage nonsense=yes=no bcull=ff"));
        let state = chan.read_state().unwrap();
        assert!(state.cull);
        assert_eq!(state.bcull, 0xff);
    }
}
