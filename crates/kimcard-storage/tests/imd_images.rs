#![cfg(not(target_arch = "wasm32"))]

use kimcard_storage::{
    CreateImageOpts, DataRequest, FormatRequest, ImdDisk, ImdError, MemBackend, SectorType, St0,
    St1, St2, StorageBackend,
};

const MFM: u8 = 3;

struct TrackSpec {
    mode: u8,
    cyl: u8,
    head: u8,
    size: u8,
    map: Vec<u8>,
    /// `(type, payload)`; payload is the full body for normal types or the
    /// single fill byte for compressed ones.
    sectors: Vec<(u8, Vec<u8>)>,
}

fn imd_bytes(comment: &str, tracks: &[TrackSpec]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"IMD ");
    out.extend_from_slice(comment.as_bytes());
    out.push(0x1A);
    for t in tracks {
        out.extend_from_slice(&[t.mode, t.cyl, t.head, t.map.len() as u8, t.size]);
        out.extend_from_slice(&t.map);
        for (ty, payload) in &t.sectors {
            out.push(*ty);
            out.extend_from_slice(payload);
        }
    }
    out
}

fn single_track(size: u8, map: Vec<u8>, sectors: Vec<(u8, Vec<u8>)>) -> Vec<u8> {
    imd_bytes(
        "IMD 1.18: 01/01/25\r\nx",
        &[TrackSpec {
            mode: MFM,
            cyl: 0,
            head: 0,
            size,
            map,
            sectors,
        }],
    )
}

fn open(bytes: Vec<u8>) -> ImdDisk<MemBackend> {
    ImdDisk::open(MemBackend::from_vec(bytes), "test.imd", false).unwrap()
}

fn read_req(sector: u8, eot: u8) -> DataRequest {
    DataRequest {
        head: 0,
        cylinder: 0,
        sector,
        size_code: 2,
        end_of_track: eot,
        data_length: 0xFF,
        mfm: true,
        deleted: false,
        skip: false,
    }
}

#[test]
fn parse_single_track_image() {
    let disk = open(single_track(2, vec![0], vec![(0x01, vec![0xE5; 512])]));
    assert_eq!(disk.cylinders(), 1);
    assert_eq!(disk.heads(), 1);
}

#[test]
fn parse_accepts_the_highest_cylinder_number() {
    // A track on cylinder 255 gives a 256-cylinder disk.
    let bytes = imd_bytes(
        "last cylinder",
        &[TrackSpec {
            mode: MFM,
            cyl: 255,
            head: 0,
            size: 2,
            map: vec![0],
            sectors: vec![(0x01, vec![0xE5; 512])],
        }],
    );
    let mut disk = open(bytes);
    assert_eq!(disk.cylinders(), 256);
    disk.seek_track(0, 255).unwrap();
}

#[test]
fn read_single_normal_sector() {
    let mut disk = open(single_track(2, vec![0], vec![(0x01, vec![0xE5; 512])]));
    disk.seek_track(0, 0).unwrap();

    let mut dma = vec![0u8; 4096];
    let xfer = disk.read_data(&read_req(0, 0), &mut dma, true).unwrap();
    assert_eq!(xfer.bytes, 512);
    assert!(dma[..512].iter().all(|&b| b == 0xE5));
    // The EOT sector was delivered, so the transfer ends with EN.
    assert!(xfer.status.st1.contains(St1::END_OF_CYLINDER));
}

#[test]
fn write_then_read_round_trips_and_marks_normal() {
    let mut disk = open(single_track(2, vec![0], vec![(0x01, vec![0xE5; 512])]));
    disk.seek_track(0, 0).unwrap();

    let dma = vec![0xAAu8; 512];
    let xfer = disk.write_data(&read_req(0, 0), &dma, true).unwrap();
    assert_eq!(xfer.bytes, 512);

    let mut back = vec![0u8; 512];
    let xfer = disk.read_data(&read_req(0, 0), &mut back, true).unwrap();
    assert_eq!(xfer.bytes, 512);
    assert!(back.iter().all(|&b| b == 0xAA));

    // On-disk type byte is NORMAL. The sector record sits right after the
    // signature (4), comment + terminator (22), track header (5) and the
    // one-entry sector map.
    let mut backend = disk.into_backend();
    let mut ty = [0u8; 1];
    backend.read_at(32, &mut ty).unwrap();
    assert_eq!(ty[0], SectorType::NORMAL.code());
}

#[test]
fn write_into_compressed_sector_grows_file_in_place() {
    let bytes = single_track(2, vec![0], vec![(0x02, vec![0x5A])]);
    let before = bytes.len() as u64;
    let mut disk = open(bytes);
    disk.seek_track(0, 0).unwrap();

    let dma = vec![0x33u8; 512];
    let xfer = disk.write_data(&read_req(0, 0), &dma, true).unwrap();
    assert_eq!(xfer.bytes, 512);

    let mut back = vec![0u8; 512];
    disk.read_data(&read_req(0, 0), &mut back, true).unwrap();
    assert!(back.iter().all(|&b| b == 0x33));

    let mut backend = disk.into_backend();
    assert_eq!(backend.len().unwrap(), before + 511);
}

#[test]
fn uncompress_shifts_following_tracks() {
    // Two tracks; the compressed sector sits on the first one.
    let bytes = imd_bytes(
        "two tracks",
        &[
            TrackSpec {
                mode: MFM,
                cyl: 0,
                head: 0,
                size: 2,
                map: vec![0, 1],
                sectors: vec![(0x02, vec![0x11]), (0x01, vec![0x22; 512])],
            },
            TrackSpec {
                mode: MFM,
                cyl: 1,
                head: 0,
                size: 2,
                map: vec![0, 1],
                sectors: vec![(0x01, vec![0x33; 512]), (0x02, vec![0x44])],
            },
        ],
    );
    let before = bytes.len() as u64;
    let mut disk = open(bytes);
    disk.seek_track(0, 0).unwrap();
    disk.uncompress_sector(0).unwrap();

    // Everything still reads correctly after the shift.
    let mut dma = vec![0u8; 1024];
    let xfer = disk.read_data(&read_req(0, 1), &mut dma, true).unwrap();
    assert_eq!(xfer.bytes, 1024);
    assert!(dma[..512].iter().all(|&b| b == 0x11));
    assert!(dma[512..].iter().all(|&b| b == 0x22));

    disk.seek_track(0, 1).unwrap();
    let mut dma = vec![0u8; 1024];
    let mut req = read_req(0, 1);
    req.cylinder = 1;
    let xfer = disk.read_data(&req, &mut dma, true).unwrap();
    assert_eq!(xfer.bytes, 1024);
    assert!(dma[..512].iter().all(|&b| b == 0x33));
    assert!(dma[512..].iter().all(|&b| b == 0x44));

    assert_eq!(disk.into_backend().len().unwrap(), before + 511);
}

#[test]
fn sectors_are_delivered_in_logical_order() {
    // Physical order 2,0,1; logical reads must come back 0,1,2.
    let mut disk = open(single_track(
        0,
        vec![2, 0, 1],
        vec![
            (0x01, vec![0xC2; 128]),
            (0x01, vec![0xC0; 128]),
            (0x01, vec![0xC1; 128]),
        ],
    ));
    disk.seek_track(0, 0).unwrap();
    assert_eq!(disk.physical_index(0), Some(1));
    assert_eq!(disk.physical_index(1), Some(2));
    assert_eq!(disk.physical_index(2), Some(0));

    let mut dma = vec![0u8; 3 * 128];
    let mut req = read_req(0, 2);
    req.size_code = 0;
    req.data_length = 0xFF;
    let xfer = disk.read_data(&req, &mut dma, true).unwrap();
    assert_eq!(xfer.bytes, 3 * 128);
    assert!(dma[..128].iter().all(|&b| b == 0xC0));
    assert!(dma[128..256].iter().all(|&b| b == 0xC1));
    assert!(dma[256..].iter().all(|&b| b == 0xC2));
}

#[test]
fn missing_sector_reports_no_data() {
    let mut disk = open(single_track(2, vec![1], vec![(0x01, vec![0; 512])]));
    disk.seek_track(0, 0).unwrap();

    let mut dma = vec![0u8; 512];
    let xfer = disk.read_data(&read_req(7, 7), &mut dma, true).unwrap();
    assert_eq!(xfer.bytes, 0);
    assert!(xfer.status.st0.contains(St0::ABNORMAL));
    assert!(xfer.status.st1.contains(St1::NO_DATA));
}

#[test]
fn wrong_cylinder_reports_nd_and_wc() {
    let mut disk = open(single_track(2, vec![0], vec![(0x01, vec![0; 512])]));
    disk.seek_track(0, 0).unwrap();

    let mut req = read_req(0, 0);
    req.cylinder = 9;
    let mut dma = vec![0u8; 512];
    let xfer = disk.read_data(&req, &mut dma, true).unwrap();
    assert!(xfer.status.st1.contains(St1::NO_DATA));
    assert!(xfer.status.st2.contains(St2::WRONG_CYLINDER));
}

#[test]
fn fm_disk_rejects_mfm_command() {
    let bytes = imd_bytes(
        "fm disk",
        &[TrackSpec {
            mode: 0,
            cyl: 0,
            head: 0,
            size: 2,
            map: vec![0],
            sectors: vec![(0x01, vec![0; 512])],
        }],
    );
    let mut disk = open(bytes);
    disk.seek_track(0, 0).unwrap();

    let mut dma = vec![0u8; 512];
    let xfer = disk.read_data(&read_req(0, 0), &mut dma, true).unwrap();
    assert!(xfer.status.st0.contains(St0::ABNORMAL));
    assert!(xfer.status.st1.contains(St1::MISSING_ADDRESS_MARK));
}

#[test]
fn deleted_mismatch_aborts_with_control_mark() {
    let mut disk = open(single_track(
        2,
        vec![0],
        vec![(SectorType::NORMAL_DELETED.code(), vec![0x77; 512])],
    ));
    disk.seek_track(0, 0).unwrap();

    let mut dma = vec![0u8; 512];
    let xfer = disk.read_data(&read_req(0, 0), &mut dma, true).unwrap();
    assert_eq!(xfer.bytes, 0);
    assert!(xfer.status.st2.contains(St2::CONTROL_MARK));
}

#[test]
fn skip_flag_skips_mismatched_sectors() {
    let mut disk = open(single_track(
        2,
        vec![0, 1],
        vec![
            (SectorType::NORMAL_DELETED.code(), vec![0x77; 512]),
            (SectorType::NORMAL.code(), vec![0x88; 512]),
        ],
    ));
    disk.seek_track(0, 0).unwrap();

    let mut req = read_req(0, 1);
    req.skip = true;
    let mut dma = vec![0u8; 1024];
    let xfer = disk.read_data(&req, &mut dma, true).unwrap();
    // Sector 0 is deleted and skipped; only sector 1 transfers.
    assert_eq!(xfer.bytes, 512);
    assert!(dma[..512].iter().all(|&b| b == 0x88));
    assert!(!xfer.status.st2.contains(St2::CONTROL_MARK));
}

#[test]
fn error_sector_accumulates_data_error_flags() {
    let mut disk = open(single_track(
        2,
        vec![0],
        vec![(SectorType::NORMAL_ERROR.code(), vec![0x99; 512])],
    ));
    disk.seek_track(0, 0).unwrap();

    let mut dma = vec![0u8; 512];
    let xfer = disk.read_data(&read_req(0, 0), &mut dma, true).unwrap();
    assert_eq!(xfer.bytes, 512);
    assert!(xfer.status.st1.contains(St1::DATA_ERROR));
    assert!(xfer.status.st2.contains(St2::DATA_ERROR_IN_FIELD));
}

#[test]
fn read_only_disk_refuses_writes() {
    let bytes = single_track(2, vec![0], vec![(0x01, vec![0; 512])]);
    let mut disk = ImdDisk::open(MemBackend::from_vec(bytes), "ro.imd", true).unwrap();
    disk.seek_track(0, 0).unwrap();

    let dma = vec![0u8; 512];
    let xfer = disk.write_data(&read_req(0, 0), &dma, true).unwrap();
    assert_eq!(xfer.bytes, 0);
    assert!(xfer.status.st0.contains(St0::ABNORMAL));
    assert!(xfer.status.st1.contains(St1::NOT_WRITEABLE));
}

#[test]
fn size_code_zero_caps_transfer_at_dtl() {
    let mut disk = open(single_track(2, vec![0], vec![(0x01, vec![0xE5; 512])]));
    disk.seek_track(0, 0).unwrap();

    let mut req = read_req(0, 0);
    req.size_code = 0;
    req.data_length = 16;
    let mut dma = vec![0u8; 512];
    let xfer = disk.read_data(&req, &mut dma, true).unwrap();
    assert_eq!(xfer.bytes, 16);
}

#[test]
fn size_code_zero_write_preserves_sector_tail() {
    let mut disk = open(single_track(2, vec![0], vec![(0x01, vec![0xE5; 512])]));
    disk.seek_track(0, 0).unwrap();

    let mut req = read_req(0, 0);
    req.size_code = 0;
    req.data_length = 8;
    let dma = vec![0x11u8; 8];
    let xfer = disk.write_data(&req, &dma, true).unwrap();
    assert_eq!(xfer.bytes, 8);

    let mut back = vec![0u8; 512];
    disk.read_data(&read_req(0, 0), &mut back, true).unwrap();
    assert!(back[..8].iter().all(|&b| b == 0x11));
    assert!(back[8..].iter().all(|&b| b == 0xE5));
}

#[test]
fn mismatched_size_code_reports_no_data() {
    let mut disk = open(single_track(2, vec![0], vec![(0x01, vec![0; 512])]));
    disk.seek_track(0, 0).unwrap();

    let mut req = read_req(0, 0);
    req.size_code = 3;
    let mut dma = vec![0u8; 1024];
    let xfer = disk.read_data(&req, &mut dma, true).unwrap();
    assert!(xfer.status.st1.contains(St1::NO_DATA));
}

#[test]
fn direction_bypass_moves_no_bytes() {
    let mut disk = open(single_track(2, vec![0], vec![(0x01, vec![0xE5; 512])]));
    disk.seek_track(0, 0).unwrap();

    let mut dma = vec![0u8; 512];
    let xfer = disk.read_data(&read_req(0, 0), &mut dma, false).unwrap();
    assert_eq!(xfer.bytes, 0);
    assert!(dma.iter().all(|&b| b == 0));
}

#[test]
fn parse_rejects_bad_signature() {
    let mut bytes = single_track(2, vec![0], vec![(0x01, vec![0; 512])]);
    bytes[0] = b'X';
    let err = ImdDisk::open(MemBackend::from_vec(bytes), "bad.imd", false).unwrap_err();
    assert!(matches!(err, ImdError::CorruptImage("bad signature")));
}

#[test]
fn parse_rejects_missing_comment_terminator() {
    let bytes = b"IMD no terminator here".to_vec();
    let err = ImdDisk::open(MemBackend::from_vec(bytes), "bad.imd", false).unwrap_err();
    assert!(matches!(
        err,
        ImdError::CorruptImage("missing comment terminator")
    ));
}

#[test]
fn parse_rejects_mixed_modes() {
    let bytes = imd_bytes(
        "mixed",
        &[
            TrackSpec {
                mode: MFM,
                cyl: 0,
                head: 0,
                size: 2,
                map: vec![0],
                sectors: vec![(0x01, vec![0; 512])],
            },
            TrackSpec {
                mode: 0,
                cyl: 1,
                head: 0,
                size: 2,
                map: vec![0],
                sectors: vec![(0x01, vec![0; 512])],
            },
        ],
    );
    let err = ImdDisk::open(MemBackend::from_vec(bytes), "bad.imd", false).unwrap_err();
    assert!(matches!(err, ImdError::CorruptImage("mixed track modes")));
}

#[test]
fn parse_rejects_unavailable_sector() {
    let bytes = single_track(2, vec![0], vec![(0x00, vec![])]);
    let err = ImdDisk::open(MemBackend::from_vec(bytes), "bad.imd", false).unwrap_err();
    assert!(matches!(err, ImdError::CorruptImage("unavailable sector")));
}

#[test]
fn parse_rejects_size_code_out_of_range() {
    let bytes = imd_bytes(
        "big sectors",
        &[TrackSpec {
            mode: MFM,
            cyl: 0,
            head: 0,
            size: 7,
            map: vec![0],
            sectors: vec![(0x01, vec![0; 512])],
        }],
    );
    let err = ImdDisk::open(MemBackend::from_vec(bytes), "bad.imd", false).unwrap_err();
    assert!(matches!(
        err,
        ImdError::CorruptImage("sector size code out of range")
    ));
}

#[test]
fn parse_rejects_truncated_image() {
    let mut bytes = single_track(2, vec![0], vec![(0x01, vec![0xE5; 512])]);
    bytes.truncate(bytes.len() - 100);
    let err = ImdDisk::open(MemBackend::from_vec(bytes), "bad.imd", false).unwrap_err();
    assert!(matches!(err, ImdError::CorruptImage("truncated image")));
}

#[test]
fn parse_rejects_unknown_mode() {
    let bytes = imd_bytes(
        "mode 5",
        &[TrackSpec {
            mode: 5,
            cyl: 0,
            head: 0,
            size: 2,
            map: vec![0],
            sectors: vec![(0x01, vec![0; 512])],
        }],
    );
    let err = ImdDisk::open(MemBackend::from_vec(bytes), "bad.imd", false).unwrap_err();
    assert!(matches!(
        err,
        ImdError::CorruptImage("unsupported track mode")
    ));
}

#[test]
fn created_image_parses_and_reads_filler() {
    let backend = ImdDisk::create_image(
        MemBackend::new(),
        &CreateImageOpts {
            cylinders: 2,
            sectors: 4,
            size_code: 1,
            filler: 0xE5,
            packed: true,
        },
    )
    .unwrap();

    let mut disk = ImdDisk::open(backend, "new.imd", false).unwrap();
    assert_eq!(disk.cylinders(), 2);
    assert_eq!(disk.heads(), 1);
    disk.seek_track(0, 1).unwrap();

    let mut req = read_req(0, 3);
    req.cylinder = 1;
    req.size_code = 1;
    let mut dma = vec![0u8; 4 * 256];
    let xfer = disk.read_data(&req, &mut dma, true).unwrap();
    assert_eq!(xfer.bytes, 4 * 256);
    assert!(dma.iter().all(|&b| b == 0xE5));
}

#[test]
fn created_unpacked_image_has_full_sector_bodies() {
    let mut backend = ImdDisk::create_image(
        MemBackend::new(),
        &CreateImageOpts {
            cylinders: 1,
            sectors: 2,
            size_code: 0,
            filler: 0x00,
            packed: false,
        },
    )
    .unwrap();
    // signature + comment + terminator + header + map + 2 * (type + 128).
    let expected = 4 + 30 + 1 + 5 + 2 + 2 * 129;
    assert_eq!(backend.len().unwrap(), expected as u64);
}

#[test]
fn format_track_rewrites_map_and_filler() {
    let mut disk = open(single_track(
        2,
        vec![0, 1],
        vec![(0x01, vec![0xAA; 512]), (0x01, vec![0xBB; 512])],
    ));
    disk.seek_track(0, 0).unwrap();

    // Reorder the interleave: physical 0 becomes logical 1 and vice versa.
    let mut dma = Vec::new();
    dma.extend_from_slice(&[0, 0, 1, 2]);
    dma.extend_from_slice(&[0, 0, 0, 2]);
    disk.format_track(
        &FormatRequest {
            head: 0,
            mfm: true,
            size_code: 2,
            sectors: 2,
            filler: 0xF6,
        },
        &dma,
    )
    .unwrap();

    assert_eq!(disk.sector_map(), Some(&[1u8, 0][..]));
    let mut back = vec![0u8; 1024];
    let xfer = disk.read_data(&read_req(0, 1), &mut back, true).unwrap();
    assert_eq!(xfer.bytes, 1024);
    assert!(back.iter().all(|&b| b == 0xF6));
}

#[test]
fn format_track_rejects_geometry_mismatch() {
    let mut disk = open(single_track(2, vec![0], vec![(0x01, vec![0; 512])]));
    disk.seek_track(0, 0).unwrap();

    let dma = vec![0, 0, 0, 2];
    let err = disk
        .format_track(
            &FormatRequest {
                head: 0,
                mfm: true,
                size_code: 2,
                sectors: 9,
                filler: 0xF6,
            },
            &dma,
        )
        .unwrap_err();
    assert!(matches!(err, ImdError::Unsupported("sector count mismatch")));
}

#[test]
fn format_track_keeps_compressed_sectors_compressed() {
    let bytes = single_track(2, vec![0], vec![(0x02, vec![0x5A])]);
    let before = bytes.len() as u64;
    let mut disk = open(bytes);
    disk.seek_track(0, 0).unwrap();

    disk.format_track(
        &FormatRequest {
            head: 0,
            mfm: true,
            size_code: 2,
            sectors: 1,
            filler: 0xF6,
        },
        &[0, 0, 0, 2],
    )
    .unwrap();

    let mut back = vec![0u8; 512];
    let xfer = disk.read_data(&read_req(0, 0), &mut back, true).unwrap();
    assert_eq!(xfer.bytes, 512);
    assert!(back.iter().all(|&b| b == 0xF6));
    // Still stored as type + fill byte.
    let mut backend = disk.into_backend();
    assert_eq!(backend.len().unwrap(), before);
}

#[test]
fn seek_to_missing_track_fails() {
    let mut disk = open(single_track(2, vec![0], vec![(0x01, vec![0; 512])]));
    let err = disk.seek_track(0, 40).unwrap_err();
    assert!(matches!(err, ImdError::NoTrack { head: 0, cylinder: 40 }));
}
