//! Graveyard reaper (spec §3 "Graveyard", §4.3).
//!
//! The kernel moves culled objects into `<cacheroot>/graveyard/` rather
//! than deleting them directly; the daemon empties that directory on a
//! `SIGIO`-driven directory-change notification.

use std::fs::{self, File};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::error::Result;
use crate::state::{is_dotdir, State};

static UNIQUIFIER: AtomicU32 = AtomicU32::new(0);

pub(crate) fn unique_grave_name() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let uniq = UNIQUIFIER.fetch_add(1, Ordering::Relaxed);
    format!("x{secs:x}x{uniq:x}x")
}

/// Arm a one-shot `DN_CREATE` notification on the graveyard directory and
/// then empty it (spec §4.3: "Re-arms the notification before each reap").
pub fn reap(state: &State) -> Result<()> {
    let grave_fd = File::open(&state.graveyard_path)?;
    let rc = unsafe {
        libc::fcntl(grave_fd.as_raw_fd(), libc::F_NOTIFY, libc::DN_CREATE)
    };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    drop(grave_fd);

    reap_dir(&state.graveyard_path)
}

/// Recursively empty `dir`. Rewinds and re-reads until a full pass
/// produces no deletions, since unlinking during enumeration can cause
/// `readdir` to skip entries (spec §4.3).
fn reap_dir(dir: &Path) -> Result<()> {
    loop {
        let mut deleted_any = false;

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if is_dotdir(name) {
                continue;
            }
            deleted_any = true;

            let file_type = entry.file_type()?;
            if !file_type.is_dir() {
                debug!("unlink {}", entry.path().display());
                match fs::remove_file(entry.path()) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            let grave_name = dir.join(unique_grave_name());
            match fs::rename(entry.path(), &grave_name) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            reap_dir(&grave_name)?;

            debug!("rmdir {}", grave_name.display());
            if let Err(e) = fs::remove_dir(&grave_name) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }

        if !deleted_any {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reap_empties_nested_graveyard() {
        // spec §8 scenario 6
        let dir = tempfile::tempdir().unwrap();
        let mut state = State::new(dir.path());
        state.graveyard_path = dir.path().join("graveyard");
        fs::create_dir_all(&state.graveyard_path).unwrap();
        fs::write(state.graveyard_path.join("a"), b"grave").unwrap();
        let b = state.graveyard_path.join("b");
        fs::create_dir(&b).unwrap();
        fs::write(b.join("c"), b"nested grave").unwrap();

        reap(&state).unwrap();

        let remaining: Vec<_> = fs::read_dir(&state.graveyard_path)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(remaining.is_empty(), "graveyard not empty: {remaining:?}");
    }

    #[test]
    fn reap_tolerates_already_empty_graveyard() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = State::new(dir.path());
        state.graveyard_path = dir.path().join("graveyard");
        fs::create_dir_all(&state.graveyard_path).unwrap();
        reap(&state).unwrap();
    }
}
