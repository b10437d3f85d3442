//! Index consistency checker (spec §3 "Scan state (T)", §4.5).
//!
//! A scan runs three phases against the cache's open index files and
//! directory tree: a table pass, a directory-tree pass, and a second table
//! pass that now treats index/xattr mismatches as duplicates rather than
//! damage to repair (mirroring `cachefilesd_fsck_impl`'s `[1/3]`/`[2/3]`/
//! `[3/3]` structure).

mod table;
mod tree;

use std::fs::{File, OpenOptions};
use std::os::unix::io::RawFd;
use std::path::Path;

use log::{info, warn};

use crate::channel::Channel;
use crate::error::Result;
use crate::state::{Geometry, State, StateFlags, CACHE_XATTR};
use crate::xattr;

pub use table::fsck_table;
pub use tree::fsck_tree;

/// The object-side counterpart of the index record (spec §3 "Cache
/// xattr"): `{ cullslot: u32, type: u8 }`, packed native-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheXattr {
    pub cullslot: u32,
    pub type_: u8,
}

const CACHE_XATTR_LEN: usize = 5;

impl CacheXattr {
    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < CACHE_XATTR_LEN {
            return None;
        }
        let cullslot = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        Some(CacheXattr {
            cullslot,
            type_: buf[4],
        })
    }

    fn encode(&self) -> [u8; CACHE_XATTR_LEN] {
        let mut buf = [0u8; CACHE_XATTR_LEN];
        buf[0..4].copy_from_slice(&self.cullslot.to_ne_bytes());
        buf[4] = self.type_;
        buf
    }
}

fn read_cache_xattr(fd: RawFd) -> Result<Option<CacheXattr>> {
    Ok(xattr::fget(fd, CACHE_XATTR)?.and_then(|buf| CacheXattr::decode(&buf)))
}

fn write_cache_xattr_cullslot(fd: RawFd, cullslot: u32) -> Result<()> {
    let mut x = read_cache_xattr(fd)?.unwrap_or(CacheXattr {
        cullslot: 0,
        type_: 0,
    });
    x.cullslot = cullslot;
    xattr::fset(fd, CACHE_XATTR, &x.encode())?;
    Ok(())
}

/// Destination for a repair/delete decision: either patched directly into
/// the open index files (offline) or relayed to the kernel (online) — spec
/// §4.5: "(offline: `_sx` in place; online: `fixslot t.index`)".
pub trait RepairSink {
    fn delete_slot(&mut self, index: &mut table::OpenIndex, slot: u32) -> Result<()>;
    fn repair_slot(&mut self, fd: RawFd, slot: u32) -> Result<()>;
    /// `is_dir` distinguishes a plain unlink from a graveyard-rename when
    /// offline; online deletion always goes through `cull <name>`.
    fn delete_file(&mut self, dirfd: RawFd, name: &str, is_dir: bool) -> Result<()>;
    /// Removes a directory already verified empty by the spider (spec
    /// §4.5 phase 2: "if empty, remove it and (offline) zero any orphaned
    /// index slot referenced by its xattr"). `owned_slot` is the slot the
    /// directory's own cache xattr pointed at, if any.
    fn remove_empty_dir(
        &mut self,
        index: &mut table::OpenIndex,
        dir: &Path,
        dirfd: RawFd,
        name: &str,
        owned_slot: Option<u32>,
    ) -> Result<()>;
}

pub struct OfflineSink {
    graveyard: File,
}

impl OfflineSink {
    pub fn new(graveyard_path: &Path) -> Result<Self> {
        Ok(OfflineSink {
            graveyard: File::open(graveyard_path)?,
        })
    }
}

impl RepairSink for OfflineSink {
    fn delete_slot(&mut self, index: &mut table::OpenIndex, slot: u32) -> Result<()> {
        index.zero_slot(slot)
    }

    fn repair_slot(&mut self, fd: RawFd, slot: u32) -> Result<()> {
        write_cache_xattr_cullslot(fd, slot)
    }

    fn delete_file(&mut self, dirfd: RawFd, name: &str, is_dir: bool) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        if !is_dir {
            return unlink_tolerant(dirfd, name);
        }
        let unique = crate::reaper::unique_grave_name();
        rename_tolerant(dirfd, name, self.graveyard.as_raw_fd(), &unique)
    }

    fn remove_empty_dir(
        &mut self,
        index: &mut table::OpenIndex,
        dir: &Path,
        _dirfd: RawFd,
        _name: &str,
        owned_slot: Option<u32>,
    ) -> Result<()> {
        match std::fs::remove_dir(dir) {
            Ok(()) => {
                if let Some(slot) = owned_slot {
                    index.zero_slot(slot)?;
                }
                Ok(())
            }
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ENOTEMPTY) | Some(libc::ENOENT) | Some(libc::ENOTDIR)
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub struct OnlineSink<'a> {
    channel: &'a mut Channel,
}

impl<'a> OnlineSink<'a> {
    pub fn new(channel: &'a mut Channel) -> Self {
        OnlineSink { channel }
    }
}

impl RepairSink for OnlineSink<'_> {
    fn delete_slot(&mut self, _index: &mut table::OpenIndex, slot: u32) -> Result<()> {
        self.channel.rmslot(slot)
    }

    fn repair_slot(&mut self, _fd: RawFd, slot: u32) -> Result<()> {
        self.channel.fixslot(slot)
    }

    fn delete_file(&mut self, _dirfd: RawFd, name: &str, _is_dir: bool) -> Result<()> {
        self.channel.cull(name)
    }

    fn remove_empty_dir(
        &mut self,
        _index: &mut table::OpenIndex,
        _dir: &Path,
        _dirfd: RawFd,
        name: &str,
        _owned_slot: Option<u32>,
    ) -> Result<()> {
        self.channel.cull(name)
    }
}

fn unlink_tolerant(dirfd: RawFd, name: &str) -> Result<()> {
    let cname = std::ffi::CString::new(name)
        .map_err(|_| crate::error::Error::internal("NUL byte in filename"))?;
    let rc = unsafe { libc::unlinkat(dirfd, cname.as_ptr(), 0) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(err.into());
        }
    }
    Ok(())
}

fn rename_tolerant(from_dirfd: RawFd, from: &str, to_dirfd: RawFd, to: &str) -> Result<()> {
    let cfrom = std::ffi::CString::new(from)
        .map_err(|_| crate::error::Error::internal("NUL byte in filename"))?;
    let cto = std::ffi::CString::new(to)
        .map_err(|_| crate::error::Error::internal("NUL byte in filename"))?;
    let rc = unsafe { libc::renameat(from_dirfd, cfrom.as_ptr(), to_dirfd, cto.as_ptr()) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(err.into());
        }
    }
    Ok(())
}

/// Result of a full three-phase scan.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsckReport {
    pub fixes: u64,
    pub deletions: u64,
}

/// Runs the full three-phase scan (spec §4.5, driven by
/// `cachefilesd_fsck_impl`'s `[1/3]`/`[2/3]`/`[3/3]` sequence).
///
/// `channel` selects online vs. offline repair: `Some` relays every
/// decision to the kernel, `None` patches the index files directly.
pub fn run(state: &State, channel: Option<&mut Channel>) -> Result<FsckReport> {
    let mut report = FsckReport::default();
    let cache_dir = state.cache_dir.clone();

    match channel {
        Some(channel) => {
            let mut sink = OnlineSink::new(channel);
            run_phases(state, &cache_dir, &mut sink, &mut report)
        }
        None => {
            let mut sink = OfflineSink::new(&state.graveyard_path)?;
            run_phases(state, &cache_dir, &mut sink, &mut report)
        }
    }
}

fn run_phases(
    state: &State,
    cache_dir: &Path,
    sink: &mut impl RepairSink,
    report: &mut FsckReport,
) -> Result<()> {
    let mut index = table::OpenIndex::open(state)?;

    info!("[1/3] Checking consistency of culling index.");
    report.fixes += table::fsck_table(&mut index, &state.geometry, false, sink)?;

    if cache_dir.exists() {
        info!("[2/3] Checking consistency of files in cache directory.");
        report.deletions += tree::fsck_tree(&mut index, state, cache_dir, sink)?;
    } else {
        info!("[2/3] Skipping cache files consistency check: cache dir does not exist.");
    }

    info!("[3/3] Checking consistency of culling index (duplicate pass).");
    report.deletions += table::fsck_table(&mut index, &state.geometry, true, sink)?;

    Ok(())
}

pub(crate) const PREFIX_LETTERS: &[u8] = b"IDSJET+@";
pub(crate) const DIR_ONLY_PREFIXES: &[u8] = b"IJ@+";

/// Spec §4.5 phase 2: "Reject files whose prefix letter is not one of
/// `IDSJET+@` or whose prefix/mode disagree."
pub(crate) fn is_expected(name: &str, is_dir: bool) -> bool {
    let Some(&first) = name.as_bytes().first() else {
        return false;
    };
    if !PREFIX_LETTERS.contains(&first) {
        return false;
    }
    if !is_dir && DIR_ONLY_PREFIXES.contains(&first) {
        return false;
    }
    true
}

pub(crate) fn is_intermediate(name: &str) -> bool {
    matches!(name.as_bytes().first(), Some(b'@') | Some(b'+'))
}

/// Spec §4.5 phase 2: "if missing or `cullslot > num_indices`, delete the
/// file." Callers check `PINNED` separately first.
pub(crate) fn slot_out_of_bounds(slot: u32, geometry: &Geometry) -> bool {
    slot > geometry.num_indices
}

/// Light, offline-safe startup check, run before the cache is bound (spec
/// §4.5 "Preflight (light) scan"). Ensures the two index files exist and
/// are sized consistently with the cache's geometry xattrs, setting
/// `need_fsck` wherever it has to guess or repair rather than verify.
pub fn preflight(state: &mut State) -> Result<()> {
    if state.lock_path.exists() {
        warn!(
            "{} exists from a previous run; scheduling a deep fsck",
            state.lock_path.display()
        );
        state.flags.insert(StateFlags::NEED_FSCK);
    }

    let index_exists = state.index_path.exists();
    let atimes_exists = state.atimes_path.exists();
    match (index_exists, atimes_exists) {
        (false, true) => {
            warn!("cull_atimes exists without cull_index; removing it");
            std::fs::remove_file(&state.atimes_path)?;
        }
        (true, false) => {
            warn!("cull_index exists without cull_atimes; creating an empty one");
            File::create(&state.atimes_path)?;
        }
        _ => {}
    }

    state.read_geometry_xattrs()?;
    round_index_file(state)?;
    round_atimes_file(state)?;
    Ok(())
}

/// Rounds the index file up to a whole number of pages (spec §4.5
/// preflight: "Round the index file up to a multiple of pagesize").
fn round_index_file(state: &mut State) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&state.index_path)?;
    let len = file.metadata()?.len();
    let page = state.geometry.pagesize as u64;
    let rounded = len.div_ceil(page).max(1) * page;
    if rounded != len {
        file.set_len(rounded)?;
        state.flags.insert(StateFlags::NEED_FSCK);
    }
    state.geometry.num_indices = (rounded / state.geometry.ent_size as u64) as u32;
    Ok(())
}

/// Rounds the atimes file up to a `num_perpage * 4` boundary and to
/// equality in record count with the index (spec §3 invariant
/// "num_indices == num_atimes", §4.5 preflight).
fn round_atimes_file(state: &mut State) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&state.atimes_path)?;
    let len = file.metadata()?.len();
    let boundary = state.geometry.num_perpage as u64 * 4;
    let min_len = state.geometry.num_indices as u64 * 4;
    let rounded = min_len.div_ceil(boundary).max(1) * boundary;
    if rounded != len {
        file.set_len(rounded)?;
        state.flags.insert(StateFlags::NEED_FSCK);
    }
    Ok(())
}

#[cfg(test)]
mod preflight_tests {
    use super::*;
    use crate::xattr;

    fn setup(dir: &Path, pagesize: u32, ent_size: u32) -> State {
        let mut state = State::new(dir);
        state.geometry.pagesize = pagesize;
        xattr::set(dir, crate::state::CULLSLOT_XATTR, format!("{ent_size:02x}").as_bytes()).unwrap();
        xattr::set(dir, crate::state::ATIME_BASE_XATTR, b"0000000000000000").unwrap();
        state
    }

    #[test]
    fn creates_missing_atimes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = setup(dir.path(), 4096, 16);
        std::fs::write(&state.index_path, vec![0u8; 4096]).unwrap();
        preflight(&mut state).unwrap();
        assert!(state.atimes_path.exists());
    }

    #[test]
    fn removes_orphaned_atimes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = setup(dir.path(), 4096, 16);
        std::fs::write(&state.atimes_path, vec![0u8; 64]).unwrap();
        // No index file.
        let err = preflight(&mut state);
        // read_geometry_xattrs succeeds but opening the (still absent)
        // index file during rounding fails; the orphaned atimes file
        // should already have been removed before that point.
        assert!(err.is_err());
        assert!(!state.atimes_path.exists());
    }

    #[test]
    fn pads_short_index_and_atimes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = setup(dir.path(), 4096, 16);
        std::fs::write(&state.index_path, vec![0u8; 100]).unwrap();
        std::fs::write(&state.atimes_path, vec![0u8; 10]).unwrap();
        preflight(&mut state).unwrap();
        assert_eq!(std::fs::metadata(&state.index_path).unwrap().len(), 4096);
        assert!(state.need_fsck());
        let num_perpage = state.geometry.num_perpage as u64;
        let atimes_len = std::fs::metadata(&state.atimes_path).unwrap().len();
        assert_eq!(atimes_len % (num_perpage * 4), 0);
    }

    #[test]
    fn stale_lock_file_schedules_fsck() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = setup(dir.path(), 4096, 16);
        std::fs::write(&state.index_path, vec![0u8; 4096]).unwrap();
        std::fs::write(&state.lock_path, b"").unwrap();
        preflight(&mut state).unwrap();
        assert!(state.need_fsck());
    }
}
