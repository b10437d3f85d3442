//! Cache state (spec §3 "Cache state (S)").
//!
//! Singleton per cache: paths, geometry, and lifecycle flags. Owns the
//! paths; the optional scan state lives alongside it in [`crate::fsck`]
//! rather than embedded here, so `State` stays `Clone`-free and cheap to
//! pass by reference through the control loop.

use std::path::{Path, PathBuf};

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::xattr;

bitflags! {
    /// Lifecycle flags from spec §3. Modeled as a real bitflags set (the
    /// teacher's convention for small boolean option bags — see
    /// `src/ll/flags/*.rs`) rather than four separate `bool` fields.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u8 {
        const INIT         = 0b0000_0001;
        const READ         = 0b0000_0010;
        const BOUND        = 0b0000_0100;
        const NEED_FSCK    = 0b0000_1000;
        const FSCK_RUNNING = 0b0001_0000;
    }
}

/// Geometry of the two index files (spec §3 "Index record", "Atimes
/// file").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub pagesize: u32,
    pub ent_size: u32,
    pub num_perpage: u32,
    pub num_indices: u32,
    pub atime_base: u64,
}

impl Geometry {
    pub fn num_pages(&self) -> u64 {
        self.num_indices.div_ceil(self.num_perpage) as u64
    }
}

/// Per-cache singleton state (spec §3 "Cache state (S)").
pub struct State {
    pub root: PathBuf,
    pub index_path: PathBuf,
    pub atimes_path: PathBuf,
    pub lock_path: PathBuf,
    pub graveyard_path: PathBuf,
    pub cache_dir: PathBuf,
    pub geometry: Geometry,
    pub flags: StateFlags,
}

pub const CULLSLOT_XATTR: &str = "user.CacheFiles.cull_index";
pub const ATIME_BASE_XATTR: &str = "user.CacheFiles.atime_base";
pub const CACHE_XATTR: &str = "user.CacheFiles.cache";

pub const NO_CULL_SLOT: u32 = u32::MAX;
pub const PINNED: u32 = u32::MAX - 1;

impl State {
    /// Derive the cache's fixed paths from the cache root (spec §6
    /// "Paths").
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        State {
            index_path: root.join("cull_index"),
            atimes_path: root.join("cull_atimes"),
            lock_path: root.join(".lock"),
            graveyard_path: root.join("graveyard"),
            cache_dir: root.join("cache"),
            root,
            geometry: Geometry {
                pagesize: page_size::get() as u32,
                ent_size: 0,
                num_perpage: 0,
                num_indices: 0,
                atime_base: 0,
            },
            flags: StateFlags::empty(),
        }
    }

    /// Read the cache-wide geometry xattrs off the cache root (spec §4.5
    /// preflight: "entity size ... atime base").
    pub fn read_geometry_xattrs(&mut self) -> Result<()> {
        let entity_size = xattr::get(&self.root, CULLSLOT_XATTR)?
            .ok_or_else(|| Error::internal("missing user.CacheFiles.cull_index xattr"))?;
        let entity_size = parse_hex_u32(&entity_size, "user.CacheFiles.cull_index")?;
        if entity_size == 0 {
            return Err(Error::internal("cull_index entity size xattr is zero"));
        }
        self.geometry.ent_size = entity_size;
        self.geometry.num_perpage = self.geometry.pagesize / entity_size;

        match xattr::get(&self.root, ATIME_BASE_XATTR)? {
            Some(raw) => {
                self.geometry.atime_base = parse_hex_u64(&raw, "user.CacheFiles.atime_base")?;
            }
            None => {
                self.flags.insert(StateFlags::NEED_FSCK);
            }
        }
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.flags.contains(StateFlags::BOUND)
    }

    pub fn need_fsck(&self) -> bool {
        self.flags.contains(StateFlags::NEED_FSCK)
    }
}

fn parse_hex_u32(raw: &[u8], xattr_name: &str) -> Result<u32> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::internal(format!("{xattr_name} is not valid UTF-8")))?;
    u32::from_str_radix(text.trim(), 16)
        .map_err(|_| Error::internal(format!("{xattr_name} is not a valid hex value")))
}

fn parse_hex_u64(raw: &[u8], xattr_name: &str) -> Result<u64> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::internal(format!("{xattr_name} is not valid UTF-8")))?;
    u64::from_str_radix(text.trim(), 16)
        .map_err(|_| Error::internal(format!("{xattr_name} is not a valid hex value")))
}

/// Byte offset of the record for `slot` within the index file (spec §4.2).
pub fn record_offset(slot: u32, geometry: &Geometry) -> u64 {
    slot as u64 * geometry.ent_size as u64
}

/// Byte offset of the atime for `slot` within the atimes file.
pub fn atime_offset(slot: u32) -> u64 {
    slot as u64 * 4
}

pub fn is_dotdir(name: &str) -> bool {
    name == "." || name == ".."
}

pub fn path_under(root: &Path, rel: &Path) -> PathBuf {
    root.join(rel)
}
