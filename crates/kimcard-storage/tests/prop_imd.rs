#![cfg(not(target_arch = "wasm32"))]

use kimcard_storage::{ImdDisk, MemBackend, StorageBackend, SECTOR_SIZES};
use proptest::prelude::*;

#[derive(Debug, Clone)]
struct TrackPlan {
    size: u8,
    /// Permutation of `0..sectors` used as the logical sector map.
    map: Vec<u8>,
    /// One compressed flag per sector.
    compressed: Vec<bool>,
}

fn track_plan() -> impl Strategy<Value = TrackPlan> {
    (0u8..=3, 1usize..8).prop_flat_map(|(size, sectors)| {
        (
            Just(size),
            Just((0..sectors as u8).collect::<Vec<u8>>()).prop_shuffle(),
            proptest::collection::vec(any::<bool>(), sectors),
        )
            .prop_map(|(size, map, compressed)| TrackPlan {
                size,
                map,
                compressed,
            })
    })
}

fn build_image(tracks: &[TrackPlan]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"IMD generated fixture");
    out.push(0x1A);
    for (cyl, t) in tracks.iter().enumerate() {
        out.extend_from_slice(&[3, cyl as u8, 0, t.map.len() as u8, t.size]);
        out.extend_from_slice(&t.map);
        for (i, &compressed) in t.compressed.iter().enumerate() {
            if compressed {
                out.push(2);
                out.push(i as u8);
            } else {
                out.push(1);
                out.extend_from_slice(&vec![i as u8; SECTOR_SIZES[t.size as usize]]);
            }
        }
    }
    out
}

proptest! {
    // Parsing is total on well-formed images: consistent mode, size <= 6, no
    // unavailable sectors.
    #[test]
    fn parse_is_total_on_legal_images(tracks in proptest::collection::vec(track_plan(), 1..5)) {
        let bytes = build_image(&tracks);
        let disk = ImdDisk::open(MemBackend::from_vec(bytes), "gen.imd", false).unwrap();
        prop_assert_eq!(disk.cylinders() as usize, tracks.len());
        prop_assert_eq!(disk.heads(), 1);
    }

    // The logical-to-physical mapping is the inverse of the sector map.
    #[test]
    fn physical_index_inverts_sector_map(track in track_plan()) {
        let bytes = build_image(std::slice::from_ref(&track));
        let mut disk = ImdDisk::open(MemBackend::from_vec(bytes), "gen.imd", false).unwrap();
        disk.seek_track(0, 0).unwrap();
        let map = disk.sector_map().unwrap().to_vec();
        for (phys, &logical) in map.iter().enumerate() {
            prop_assert_eq!(disk.physical_index(logical), Some(phys));
        }
    }

    // Uncompressing any compressed sector grows the file by exactly
    // `size - 1` bytes and leaves every sector readable.
    #[test]
    fn uncompress_grows_by_size_minus_one(track in track_plan()) {
        prop_assume!(track.compressed.iter().any(|&c| c));
        let phys = track.compressed.iter().position(|&c| c).unwrap();

        let bytes = build_image(std::slice::from_ref(&track));
        let before = bytes.len() as u64;
        let mut disk = ImdDisk::open(MemBackend::from_vec(bytes), "gen.imd", false).unwrap();
        disk.seek_track(0, 0).unwrap();
        disk.uncompress_sector(phys).unwrap();

        let size = SECTOR_SIZES[track.size as usize] as u64;
        let mut backend = disk.into_backend();
        prop_assert_eq!(backend.len().unwrap(), before + size - 1);
    }
}
