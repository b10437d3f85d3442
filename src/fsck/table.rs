//! Table pass: per-slot verification of the cull index (spec §4.5 phase 1
//! / phase 3, grounded on `fsck_table`/`fsck_page`/`fsck_slot`).

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use zerocopy::IntoBytes;

use crate::error::Result;
use crate::handle;
use crate::index_io;
use crate::record::{Atime, IndexRecord};
use crate::state::{atime_offset, record_offset, Geometry, State, PINNED};

use super::RepairSink;

/// The two open index files plus the geometry needed to seek them,
/// kept open across all three fsck phases (spec §3 "Scan state (T)":
/// "open FDs ... Lifecycle: created on fsck start, destroyed on fsck end").
pub struct OpenIndex {
    pub index_file: File,
    pub atimes_file: File,
    pub geometry: Geometry,
    pub root: PathBuf,
}

impl OpenIndex {
    pub fn open(state: &State) -> Result<Self> {
        Ok(OpenIndex {
            index_file: OpenOptions::new()
                .read(true)
                .write(true)
                .open(&state.index_path)?,
            atimes_file: OpenOptions::new()
                .read(true)
                .write(true)
                .open(&state.atimes_path)?,
            geometry: state.geometry,
            root: state.root.clone(),
        })
    }

    /// Blanks a slot's index record and atime (spec §4.5: a deleted slot's
    /// record and atime both go to zero, `_delete_slot_offline`).
    pub fn zero_slot(&mut self, slot: u32) -> Result<()> {
        let empty = IndexRecord::empty();
        let mut buf = vec![0u8; self.geometry.ent_size as usize];
        empty.encode_into(&mut buf);
        self.index_file
            .seek(SeekFrom::Start(record_offset(slot, &self.geometry)))?;
        self.index_file.write_all(&buf)?;
        self.zero_atime(slot)
    }

    pub fn zero_atime(&mut self, slot: u32) -> Result<()> {
        self.atimes_file.seek(SeekFrom::Start(atime_offset(slot)))?;
        self.atimes_file.write_all(Atime(0).as_bytes())?;
        Ok(())
    }

    /// Reads a single record without going through the page cache; used
    /// by the tree pass's reciprocal handle check (spec §4.5 phase 2).
    pub fn read_record(&mut self, slot: u32) -> Result<IndexRecord> {
        let mut buf = vec![0u8; self.geometry.ent_size as usize];
        self.index_file
            .seek(SeekFrom::Start(record_offset(slot, &self.geometry)))?;
        std::io::Read::read_exact(&mut self.index_file, &mut buf)?;
        Ok(IndexRecord::decode(&buf))
    }
}

/// Runs one full table pass, page by page (spec §4.5 phase 1/3).
/// `duplicate_pass` changes how a cullslot/index mismatch is interpreted:
/// a repair attempt the first time, a deletion (it's someone else's slot
/// now) the second.
pub fn fsck_table(
    index: &mut OpenIndex,
    geometry: &Geometry,
    duplicate_pass: bool,
    sink: &mut impl RepairSink,
) -> Result<u64> {
    let mut fixes = 0u64;
    let npages = geometry.num_pages();

    for page in 0..npages {
        let pg = index_io::load_page(&mut index.index_file, &mut index.atimes_file, page, geometry)?;
        for (j, rec) in pg.records.iter().enumerate() {
            let slot = pg.first_slot + j as u32;
            let atime = pg.atimes[j];

            if rec.is_empty() {
                if atime != 0 {
                    index.zero_atime(slot)?;
                    fixes += 1;
                }
                continue;
            }

            if fsck_slot(index, slot, rec, duplicate_pass, sink)? {
                fixes += 1;
            }
        }
    }

    Ok(fixes)
}

/// Verifies one occupied slot; returns whether a repair or deletion was
/// made (spec §4.5 phase 1, `fsck_slot`).
fn fsck_slot(
    index: &mut OpenIndex,
    slot: u32,
    rec: &IndexRecord,
    duplicate_pass: bool,
    sink: &mut impl RepairSink,
) -> Result<bool> {
    let fd = match handle::open_record_at(&index.root, rec.type_, &rec.fh) {
        Ok(fd) => fd,
        Err(e) if e.raw_os_error() == Some(libc::ESTALE) => {
            sink.delete_slot(index, slot)?;
            return Ok(true);
        }
        Err(e) => return Err(e.into()),
    };

    let outcome = fsck_slot_open(fd, slot, duplicate_pass, index, sink);
    unsafe {
        libc::close(fd);
    }
    outcome
}

fn fsck_slot_open(
    fd: std::os::unix::io::RawFd,
    slot: u32,
    duplicate_pass: bool,
    index: &mut OpenIndex,
    sink: &mut impl RepairSink,
) -> Result<bool> {
    let Some(x) = super::read_cache_xattr(fd)? else {
        sink.delete_slot(index, slot)?;
        return Ok(true);
    };

    if x.cullslot == slot {
        return Ok(false);
    }

    if x.cullslot == PINNED {
        sink.delete_slot(index, slot)?;
        return Ok(true);
    }

    if duplicate_pass {
        sink.delete_slot(index, slot)?;
    } else {
        sink.repair_slot(fd, slot)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsck::OfflineSink;
    use smallvec::SmallVec;
    use std::os::unix::io::AsRawFd;

    fn setup_cache(
        dir: &std::path::Path,
    ) -> (State, std::path::PathBuf) {
        let mut state = State::new(dir);
        state.geometry = Geometry {
            pagesize: 4096,
            ent_size: 64,
            num_perpage: 64,
            num_indices: 64,
            atime_base: 0,
        };
        std::fs::create_dir_all(dir.join("graveyard")).unwrap();
        std::fs::write(&state.index_path, vec![0u8; 4096]).unwrap();
        std::fs::write(&state.atimes_path, vec![0u8; 256]).unwrap();
        let cache_file = dir.join("object");
        std::fs::write(&cache_file, b"data").unwrap();
        (state, cache_file)
    }

    #[test]
    fn repairs_mismatched_cullslot_offline() {
        // spec §8 scenario 4 (simplified to a single slot whose file's
        // xattr disagrees with the index).
        let dir = tempfile::tempdir().unwrap();
        let (mut state, object) = setup_cache(dir.path());

        let f = File::open(&object).unwrap();
        let encoded = handle::encode(
            File::open(dir.path()).unwrap().as_raw_fd(),
            object.file_name().unwrap().to_str().unwrap(),
        )
        .unwrap();
        crate::xattr::fset(
            f.as_raw_fd(),
            crate::state::CACHE_XATTR,
            &{
                let mut buf = [0u8; 5];
                buf[0..4].copy_from_slice(&99u32.to_ne_bytes());
                buf
            },
        )
        .unwrap();

        let rec = IndexRecord {
            type_: encoded.handle_type as u8,
            fh: SmallVec::from_slice(&encoded.bytes),
        };
        let mut buf = vec![0u8; state.geometry.ent_size as usize];
        rec.encode_into(&mut buf);
        {
            let mut idx = std::fs::OpenOptions::new()
                .write(true)
                .open(&state.index_path)
                .unwrap();
            idx.seek(SeekFrom::Start(record_offset(7, &state.geometry)))
                .unwrap();
            idx.write_all(&buf).unwrap();
        }

        state.root = dir.path().to_path_buf();
        let mut index = OpenIndex::open(&state).unwrap();
        let mut sink = OfflineSink::new(&state.graveyard_path).unwrap();
        let fixes = fsck_table(&mut index, &state.geometry, false, &mut sink).unwrap();
        assert_eq!(fixes, 1);

        let repaired = super::super::read_cache_xattr(f.as_raw_fd()).unwrap().unwrap();
        assert_eq!(repaired.cullslot, 7);
    }

    #[test]
    fn zeroes_stale_atime_on_empty_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (mut state, _object) = setup_cache(dir.path());
        state.root = dir.path().to_path_buf();

        {
            let mut atimes = std::fs::OpenOptions::new()
                .write(true)
                .open(&state.atimes_path)
                .unwrap();
            atimes.seek(SeekFrom::Start(atime_offset(2))).unwrap();
            atimes.write_all(&42u32.to_ne_bytes()).unwrap();
        }

        let mut index = OpenIndex::open(&state).unwrap();
        let mut sink = OfflineSink::new(&state.graveyard_path).unwrap();
        let fixes = fsck_table(&mut index, &state.geometry, false, &mut sink).unwrap();
        assert_eq!(fixes, 1);
    }
}
