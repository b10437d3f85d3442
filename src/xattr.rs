//! Extended attribute primitives (spec §2: "Xattr primitives").
//!
//! Deliberately thin — spec §1 treats xattr read/write as "specified only
//! by contract". These are direct wrappers over the `getxattr(2)` family;
//! no caching, no batching, no generic attribute-bag abstraction.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;

fn cpath(path: &Path) -> io::Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}

fn cname(name: &str) -> io::Result<CString> {
    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "xattr name contains a NUL byte"))
}

/// Read an xattr by path. Returns `Ok(None)` if the attribute is absent
/// (`ENODATA`/`ENOATTR`), matching the "missing xattr" case callers of this
/// module need to distinguish from a hard I/O error.
pub fn get(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
    let cpath = cpath(path)?;
    let cname = cname(name)?;
    get_raw(|buf, len| unsafe {
        libc::getxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            buf as *mut libc::c_void,
            len,
        )
    })
}

/// Read an xattr by open file descriptor.
pub fn fget(fd: RawFd, name: &str) -> io::Result<Option<Vec<u8>>> {
    let cname = cname(name)?;
    get_raw(|buf, len| unsafe {
        libc::fgetxattr(fd, cname.as_ptr(), buf as *mut libc::c_void, len)
    })
}

fn get_raw(
    mut call: impl FnMut(*mut u8, usize) -> isize,
) -> io::Result<Option<Vec<u8>>> {
    let needed = call(std::ptr::null_mut(), 0);
    if needed < 0 {
        return map_missing(io::Error::last_os_error());
    }
    let mut buf = vec![0u8; needed as usize];
    if buf.is_empty() {
        return Ok(Some(buf));
    }
    let got = call(buf.as_mut_ptr(), buf.len());
    if got < 0 {
        return map_missing(io::Error::last_os_error());
    }
    buf.truncate(got as usize);
    Ok(Some(buf))
}

fn map_missing(err: io::Error) -> io::Result<Option<Vec<u8>>> {
    match err.raw_os_error() {
        Some(libc::ENODATA) => Ok(None),
        _ => Err(err),
    }
}

/// Replace (or create) an xattr by path.
pub fn set(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
    let cpath = cpath(path)?;
    let cname = cname(name)?;
    let rc = unsafe {
        libc::setxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Replace (or create) an xattr by open file descriptor.
pub fn fset(fd: RawFd, name: &str, value: &[u8]) -> io::Result<()> {
    let cname = cname(name)?;
    let rc = unsafe {
        libc::fsetxattr(
            fd,
            cname.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// List the xattr names set on a path.
pub fn list(path: &Path) -> io::Result<Vec<String>> {
    let cpath = cpath(path)?;
    let needed = unsafe { libc::listxattr(cpath.as_ptr(), std::ptr::null_mut(), 0) };
    if needed < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut buf = vec![0u8; needed as usize];
    if buf.is_empty() {
        return Ok(Vec::new());
    }
    let got = unsafe {
        libc::listxattr(cpath.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
    };
    if got < 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(got as usize);
    Ok(buf
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("object");
        std::fs::write(&file, b"hello").unwrap();

        set(&file, "user.cachefilesd.test", b"payload").unwrap();
        let value = get(&file, "user.cachefilesd.test").unwrap();
        assert_eq!(value.as_deref(), Some(&b"payload"[..]));

        let names = list(&file).unwrap();
        assert!(names.iter().any(|n| n == "user.cachefilesd.test"));
    }

    #[test]
    fn missing_xattr_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("object");
        std::fs::write(&file, b"hello").unwrap();

        let value = get(&file, "user.cachefilesd.nope").unwrap();
        assert_eq!(value, None);
    }
}
