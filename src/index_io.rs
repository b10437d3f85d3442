//! Paged access to the cull index file (spec §3 "Index record", §4.5 "Scan
//! state (T)").
//!
//! The index file is read/written a page at a time (`num_perpage` records
//! per page), matching the original's `load_page`/`save_page` pair. Atime
//! offsets don't line up with index pages (`ent_size` need not divide
//! evenly into 4 bytes' worth of page), so callers needing both buffers in
//! lockstep go through [`ScanBuffers`].

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use zerocopy::FromBytes;

use crate::error::Result;
use crate::record::{Atime, IndexRecord};
use crate::state::Geometry;

/// Seek offset of the start of `page` within the index file.
pub fn page_seek(page: u64, geometry: &Geometry) -> u64 {
    page * geometry.num_perpage as u64 * geometry.ent_size as u64
}

/// Seek offset of `slot`'s atime within the atimes file, expressed
/// relative to the same page numbering as the index file so a scan can
/// step both files together (spec §4.5: "the atimes file is walked in
/// lockstep, though its record size differs").
pub fn atime_page_seek(page: u64, geometry: &Geometry) -> u64 {
    page * geometry.num_perpage as u64 * 4
}

/// One page's worth of decoded index records, plus their matching atimes.
pub struct Page {
    pub records: Vec<IndexRecord>,
    pub atimes: Vec<u32>,
    pub first_slot: u32,
}

/// Load page `page` (0-based) from both files. Short reads at EOF are
/// padded with empty records/zero atimes so the last, partially-occupied
/// page of a cache still has `num_perpage` entries.
pub fn load_page(index: &mut File, atimes: &mut File, page: u64, geometry: &Geometry) -> Result<Page> {
    let first_slot = page * geometry.num_perpage as u64;
    let mut index_buf = vec![0u8; geometry.num_perpage as usize * geometry.ent_size as usize];
    index.seek(SeekFrom::Start(page_seek(page, geometry)))?;
    let n = read_best_effort(index, &mut index_buf)?;
    index_buf[n..].fill(0);

    let mut atime_buf = vec![0u8; geometry.num_perpage as usize * 4];
    atimes.seek(SeekFrom::Start(atime_page_seek(page, geometry)))?;
    let n = read_best_effort(atimes, &mut atime_buf)?;
    atime_buf[n..].fill(0);

    let records = index_buf
        .chunks_exact(geometry.ent_size as usize)
        .map(IndexRecord::decode)
        .collect();
    let atimes = atime_buf
        .chunks_exact(4)
        .map(|w| Atime::read_from_bytes(w).expect("4-byte atime slice").0)
        .collect();

    Ok(Page {
        records,
        atimes,
        first_slot: first_slot as u32,
    })
}

/// Write a (possibly repaired) page's records back to the index file.
/// Atimes are scan-owned and never rewritten by fsck (spec §4.5: fsck
/// repairs index records, never atimes).
pub fn save_page(index: &mut File, page: u64, records: &[IndexRecord], geometry: &Geometry) -> Result<()> {
    let mut buf = vec![0u8; geometry.num_perpage as usize * geometry.ent_size as usize];
    for (rec, chunk) in records.iter().zip(buf.chunks_exact_mut(geometry.ent_size as usize)) {
        rec.encode_into(chunk);
    }
    index.seek(SeekFrom::Start(page_seek(page, geometry)))?;
    index.write_all(&buf)?;
    Ok(())
}

/// Seek offset of an individual record within the index file.
pub fn record_seek(slot: u32, geometry: &Geometry) -> u64 {
    crate::state::record_offset(slot, geometry)
}

fn read_best_effort(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    loop {
        match file.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::IndexRecord;
    use smallvec::SmallVec;

    fn geometry() -> Geometry {
        Geometry {
            pagesize: 4096,
            ent_size: 16,
            num_perpage: 256,
            num_indices: 512,
            atime_base: 0,
        }
    }

    #[test]
    fn page_round_trips_through_save_and_load() {
        let geometry = geometry();
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("cull_index");
        let atimes_path = dir.path().join("cull_atimes");
        std::fs::write(&index_path, vec![0u8; 4096 * 2]).unwrap();
        std::fs::write(&atimes_path, vec![0u8; 256 * 4 * 2]).unwrap();

        let mut records = vec![IndexRecord::empty(); geometry.num_perpage as usize];
        records[3] = IndexRecord {
            type_: 1,
            fh: SmallVec::from_slice(&[9, 8, 7]),
        };

        let mut index_file = std::fs::OpenOptions::new().write(true).open(&index_path).unwrap();
        save_page(&mut index_file, 0, &records, &geometry).unwrap();
        drop(index_file);

        let mut index_file = File::open(&index_path).unwrap();
        let mut atimes_file = File::open(&atimes_path).unwrap();
        let page = load_page(&mut index_file, &mut atimes_file, 0, &geometry).unwrap();
        assert_eq!(page.first_slot, 0);
        assert_eq!(page.records[3], records[3]);
        assert!(page.records[0].is_empty());
    }

    #[test]
    fn short_final_page_is_zero_padded() {
        let geometry = geometry();
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("cull_index");
        let atimes_path = dir.path().join("cull_atimes");
        // Only enough bytes for half a page.
        std::fs::write(&index_path, vec![0xAAu8; 2048]).unwrap();
        std::fs::write(&atimes_path, vec![0u8; 256]).unwrap();

        let mut index_file = File::open(&index_path).unwrap();
        let mut atimes_file = File::open(&atimes_path).unwrap();
        let page = load_page(&mut index_file, &mut atimes_file, 0, &geometry).unwrap();
        assert_eq!(page.records.len(), geometry.num_perpage as usize);
        assert!(page.records[255].is_empty());
    }
}
