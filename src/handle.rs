//! File handle encode/decode via `name_to_handle_at(2)`/`open_by_handle_at(2)`.
//!
//! These Linux syscalls have no wrapper in `libc` or `nix`, the way the
//! teacher's `FUSE_DEV_IOC_BACKING_OPEN` ioctl has none either (see
//! `src/ll/ioctl.rs` upstream) — so, following that precedent, we define
//! the kernel-side struct ourselves and call through `libc::syscall`.

use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::record::INLINE_HANDLE_BYTES;
use smallvec::SmallVec;

const MAX_HANDLE_SZ: usize = 128;

/// Mirrors Linux's `struct file_handle` (`linux/fcntl.h`), sized to the
/// largest handle we're willing to store.
#[repr(C)]
struct RawFileHandle {
    handle_bytes: u32,
    handle_type: i32,
    f_handle: [u8; MAX_HANDLE_SZ],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub handle_type: i32,
    pub bytes: SmallVec<[u8; INLINE_HANDLE_BYTES]>,
}

/// Encode a file handle for `name` inside `dirfd`, mimicking
/// `exportfs_encode_fh` as used by `name_to_handle_at` (spec §4.5 phase 2:
/// "Encode a file handle... concatenate the parent directory's handle").
pub fn encode(dirfd: RawFd, name: &str) -> io::Result<FileHandle> {
    let cname = std::ffi::CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in filename"))?;
    let mut raw = RawFileHandle {
        handle_bytes: MAX_HANDLE_SZ as u32,
        handle_type: 0,
        f_handle: [0; MAX_HANDLE_SZ],
    };
    let mut mount_id: i32 = 0;

    let rc = unsafe {
        libc::syscall(
            libc::SYS_name_to_handle_at,
            dirfd,
            cname.as_ptr(),
            &mut raw as *mut RawFileHandle,
            &mut mount_id as *mut i32,
            0,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    let len = raw.handle_bytes as usize;
    Ok(FileHandle {
        handle_type: raw.handle_type,
        bytes: SmallVec::from_slice(&raw.f_handle[..len.min(MAX_HANDLE_SZ)]),
    })
}

/// Open a file by a previously encoded handle, relative to `mount_fd`
/// (expected to be an fd on the cache root — spec §4.5 phase 1).
pub fn open_by_handle(mount_fd: RawFd, handle: &FileHandle, flags: i32) -> io::Result<RawFd> {
    let mut raw = RawFileHandle {
        handle_bytes: handle.bytes.len() as u32,
        handle_type: handle.handle_type,
        f_handle: [0; MAX_HANDLE_SZ],
    };
    raw.f_handle[..handle.bytes.len()].copy_from_slice(&handle.bytes);

    let rc = unsafe {
        libc::syscall(
            libc::SYS_open_by_handle_at,
            mount_fd,
            &raw as *const RawFileHandle,
            flags,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as RawFd)
}

/// Open a cache object directly from an index record's `{ type, fh }` pair
/// relative to the cache root (spec §4.5 phase 1 `get_fd_at`).
pub fn open_record_at(root: &Path, type_: u8, fh: &[u8]) -> io::Result<RawFd> {
    use nix::fcntl::OFlag;
    use std::os::unix::io::AsRawFd;

    let dir = std::fs::File::open(root)?;
    let handle = FileHandle {
        handle_type: type_ as i32,
        bytes: SmallVec::from_slice(fh),
    };
    open_by_handle(dir.as_raw_fd(), &handle, OFlag::O_RDONLY.bits())
}
