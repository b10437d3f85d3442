//! Directory-tree pass: spiders the cache object tree, validating each
//! file's reciprocal file handle against its index slot (spec §4.5
//! phase 2, grounded on `fsck_tree`/`fsck_file`/`is_expected`).

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use log::debug;

use crate::error::Result;
use crate::handle;
use crate::state::{is_dotdir, State, PINNED};

use super::table::OpenIndex;
use super::{is_expected, is_intermediate, slot_out_of_bounds, RepairSink};

/// Spiders `dir` (and its subtree), returning the number of deletions made.
pub fn fsck_tree(
    index: &mut OpenIndex,
    state: &State,
    dir: &Path,
    sink: &mut impl RepairSink,
) -> Result<u64> {
    let mut deletions = 0u64;
    spider(index, state, dir, sink, &mut deletions)?;
    Ok(deletions)
}

/// Returns the number of surviving entries in `dir`, so the caller can
/// tell whether the directory is now empty.
fn spider(
    index: &mut OpenIndex,
    state: &State,
    dir: &Path,
    sink: &mut impl RepairSink,
    deletions: &mut u64,
) -> Result<u32> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("{} went missing mid-scan", dir.display());
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };
    let dir_file = File::open(dir)?;
    let dirfd = dir_file.as_raw_fd();

    let mut num: u32 = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_dotdir(name) {
            continue;
        }
        num += 1;

        let meta = match std::fs::symlink_metadata(entry.path()) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                num -= 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        // Only regular files and directories are candidates; unrecognized
        // types (symlinks, sockets, ...) are left alone (spec is silent,
        // `is_goodtype` in the original likewise just skips them).
        if !meta.is_dir() && !meta.is_file() {
            continue;
        }
        let is_dir = meta.is_dir();

        if !is_expected(name, is_dir) {
            debug!("{name} has a bad name/type combination, deleting");
            if sink.delete_file(dirfd, name, is_dir).is_ok() {
                num -= 1;
                *deletions += 1;
            }
            continue;
        }

        if is_dir {
            let child_path = dir.join(name);
            let child_num = spider(index, state, &child_path, sink, deletions)?;
            if child_num == 0 {
                // The recursive call already removed the now-empty child.
                num -= 1;
                continue;
            }
        }

        match fsck_file(index, state, dirfd, name, is_dir)? {
            FileVerdict::Ok => {}
            FileVerdict::Delete => {
                sink.delete_file(dirfd, name, is_dir)?;
                num -= 1;
                *deletions += 1;
            }
        }
    }

    if num == 0 {
        let owned_slot = read_dir_owned_slot(dir)?;
        sink.remove_empty_dir(index, dir, dirfd, "", owned_slot)?;
    }

    Ok(num)
}

enum FileVerdict {
    Ok,
    Delete,
}

/// Validates one cache object against its claimed index slot (spec §4.5
/// phase 2, `fsck_file`).
fn fsck_file(
    index: &mut OpenIndex,
    state: &State,
    dirfd: RawFd,
    name: &str,
    is_dir: bool,
) -> Result<FileVerdict> {
    if is_intermediate(name) {
        return Ok(FileVerdict::Ok);
    }

    let fd = open_at(dirfd, name)?;
    let verdict = (|| -> Result<FileVerdict> {
        let Some(x) = super::read_cache_xattr(fd)? else {
            debug!("{name} has no cache xattr");
            return Ok(FileVerdict::Delete);
        };

        if x.cullslot == PINNED {
            return Ok(FileVerdict::Ok);
        }
        if slot_out_of_bounds(x.cullslot, &state.geometry) {
            debug!("{name} has an out-of-bounds cullslot {}", x.cullslot);
            return Ok(FileVerdict::Delete);
        }

        let own_handle = handle::encode(dirfd, name)?;
        let mut expected = own_handle.bytes.clone();
        if !is_dir {
            let parent_handle = handle::encode(dirfd, ".")?;
            expected.extend_from_slice(&parent_handle.bytes);
        }

        let rec = index.read_record(x.cullslot)?;
        if rec.fh.as_slice() != expected.as_slice() {
            debug!("{name}'s file handle disagrees with its index slot");
            return Ok(FileVerdict::Delete);
        }

        Ok(FileVerdict::Ok)
    })();
    unsafe {
        libc::close(fd);
    }
    verdict
}

fn read_dir_owned_slot(dir: &Path) -> Result<Option<u32>> {
    let f = File::open(dir)?;
    match super::read_cache_xattr(f.as_raw_fd())? {
        Some(x) => Ok(Some(x.cullslot)),
        None => Ok(None),
    }
}

fn open_at(dirfd: RawFd, name: &str) -> Result<RawFd> {
    let cname = std::ffi::CString::new(name)
        .map_err(|_| crate::error::Error::internal("NUL byte in filename"))?;
    let fd = unsafe { libc::openat(dirfd, cname.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsck::OfflineSink;
    use crate::state::Geometry;

    fn setup(dir: &Path) -> State {
        let mut state = State::new(dir);
        state.geometry = Geometry {
            pagesize: 4096,
            ent_size: 64,
            num_perpage: 64,
            num_indices: 64,
            atime_base: 0,
        };
        state.cache_dir = dir.join("cache");
        std::fs::create_dir_all(&state.cache_dir).unwrap();
        std::fs::create_dir_all(dir.join("graveyard")).unwrap();
        std::fs::write(&state.index_path, vec![0u8; 4096]).unwrap();
        std::fs::write(&state.atimes_path, vec![0u8; 256]).unwrap();
        state
    }

    #[test]
    fn deletes_file_with_bad_prefix_letter() {
        let dir = tempfile::tempdir().unwrap();
        let state = setup(dir.path());
        std::fs::write(state.cache_dir.join("Xbadname"), b"junk").unwrap();

        let mut index = OpenIndex::open(&state).unwrap();
        let mut sink = OfflineSink::new(&state.graveyard_path).unwrap();
        let deletions = fsck_tree(&mut index, &state, &state.cache_dir, &mut sink).unwrap();
        assert_eq!(deletions, 1);
        assert!(!state.cache_dir.join("Xbadname").exists());
    }

    #[test]
    fn deletes_file_with_mismatched_handle() {
        let dir = tempfile::tempdir().unwrap();
        let state = setup(dir.path());
        let obj = state.cache_dir.join("Dobject");
        std::fs::write(&obj, b"payload").unwrap();
        crate::xattr::set(&obj, crate::state::CACHE_XATTR, &{
            let mut buf = [0u8; 5];
            buf[0..4].copy_from_slice(&3u32.to_ne_bytes());
            buf
        })
        .unwrap();

        // Slot 3 in the index holds an unrelated (empty) record, so the
        // reciprocal handle check will fail.
        let mut index = OpenIndex::open(&state).unwrap();
        let mut sink = OfflineSink::new(&state.graveyard_path).unwrap();
        let deletions = fsck_tree(&mut index, &state, &state.cache_dir, &mut sink).unwrap();
        assert_eq!(deletions, 1);
        assert!(!obj.exists());
    }

    #[test]
    fn skips_intermediate_and_pinned_entries() {
        let dir = tempfile::tempdir().unwrap();
        let state = setup(dir.path());
        std::fs::create_dir(state.cache_dir.join("@intermediate")).unwrap();
        let pinned = state.cache_dir.join("Dpinned");
        std::fs::write(&pinned, b"x").unwrap();
        crate::xattr::set(&pinned, crate::state::CACHE_XATTR, &{
            let mut buf = [0u8; 5];
            buf[0..4].copy_from_slice(&crate::state::PINNED.to_ne_bytes());
            buf
        })
        .unwrap();

        let mut index = OpenIndex::open(&state).unwrap();
        let mut sink = OfflineSink::new(&state.graveyard_path).unwrap();
        // "@intermediate" is an empty directory; it'll be removed as such,
        // but the pinned file must survive regardless.
        let _ = fsck_tree(&mut index, &state, &state.cache_dir, &mut sink).unwrap();
        assert!(pinned.exists());
    }
}
