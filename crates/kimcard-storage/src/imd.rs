//! IMD image parsing and sector I/O.
//!
//! An IMD file is the 4-byte signature `IMD ` followed by an ASCII comment
//! terminated by `0x1A`, then a concatenation of track records. Each track
//! record is a 5-byte header (mode, cylinder, head + map flags, sector
//! count, size code), the logical sector map, optional cylinder/head maps,
//! and one record per sector: a type byte followed by either the full sector
//! payload ("normal" types, low bit set) or a single repeating fill byte
//! ("compressed" types).
//!
//! The engine keeps a single cached "current track" (descriptor, sector map
//! and per-sector file offsets) which is reloaded on seeks, mirroring the
//! head position of the drive it models.

use tracing::{debug, trace};

use crate::backend::StorageBackend;
use crate::error::{ImdError, Result};
use crate::status::{St0, St1, St2, TransferStatus};

/// `"IMD "` little-endian.
pub const SIGNATURE: [u8; 4] = *b"IMD ";

const COMMENT_TERMINATOR: u8 = 0x1A;

/// Sector payload sizes indexed by the size code.
pub const SECTOR_SIZES: [usize; 7] = [128, 256, 512, 1024, 2048, 4096, 8192];

pub const MAX_SECTORS_PER_TRACK: usize = 255;

const TRACK_HEADER_LEN: u64 = 5;

/// Head-byte flags: the track record carries an explicit cylinder/head map.
const HEAD_FLAG_CYL_MAP: u8 = 0x80;
const HEAD_FLAG_HEAD_MAP: u8 = 0x40;
const HEAD_NUMBER_MASK: u8 = 0x3F;

/// How much is shifted per step while growing a sector in place.
const UNCOMPRESS_CHUNK: usize = 4096;

/// Recording mode. Only the two 500 kbps modes are accepted; every track of
/// a disk must use the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Fm500 = 0,
    Mfm500 = 3,
}

impl Mode {
    pub fn from_raw(raw: u8) -> Option<Mode> {
        match raw {
            0 => Some(Mode::Fm500),
            3 => Some(Mode::Mfm500),
            _ => None,
        }
    }

    /// Whether a command with the given MFM flag can access this medium.
    pub fn compatible(self, mfm: bool) -> bool {
        match self {
            Mode::Fm500 => !mfm,
            Mode::Mfm500 => mfm,
        }
    }
}

/// IMD sector type byte. Odd codes store the full payload; even codes store
/// one repeating fill byte. Code 0 ("unavailable") is rejected at parse
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorType(u8);

impl SectorType {
    pub const NORMAL: SectorType = SectorType(1);
    pub const COMPRESSED: SectorType = SectorType(2);
    pub const NORMAL_DELETED: SectorType = SectorType(3);
    pub const COMPRESSED_DELETED: SectorType = SectorType(4);
    pub const NORMAL_ERROR: SectorType = SectorType(5);
    pub const COMPRESSED_ERROR: SectorType = SectorType(6);
    pub const NORMAL_DELETED_ERROR: SectorType = SectorType(7);
    pub const COMPRESSED_DELETED_ERROR: SectorType = SectorType(8);

    pub fn from_raw(raw: u8) -> Result<SectorType> {
        match raw {
            0 => Err(ImdError::CorruptImage("unavailable sector")),
            1..=8 => Ok(SectorType(raw)),
            _ => Err(ImdError::CorruptImage("unknown sector type")),
        }
    }

    pub fn code(self) -> u8 {
        self.0
    }

    /// Stored as a single fill byte rather than a full payload.
    pub fn is_compressed(self) -> bool {
        self.0 & 1 == 0
    }

    pub fn is_deleted(self) -> bool {
        matches!(self.0, 3 | 4 | 7 | 8)
    }

    pub fn has_error(self) -> bool {
        self.0 >= 5
    }

    /// The same attributes with the payload stored in full.
    pub fn uncompressed(self) -> SectorType {
        if self.is_compressed() {
            SectorType(self.0 - 1)
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TrackHeader {
    mode: u8,
    cylinder: u8,
    head: u8,
    sectors: u8,
    size: u8,
}

impl TrackHeader {
    fn head_number(&self) -> u8 {
        self.head & HEAD_NUMBER_MASK
    }

    fn has_cyl_map(&self) -> bool {
        self.head & HEAD_FLAG_CYL_MAP != 0
    }

    fn has_head_map(&self) -> bool {
        self.head & HEAD_FLAG_HEAD_MAP != 0
    }

    fn sector_size(&self) -> usize {
        SECTOR_SIZES[self.size as usize]
    }
}

#[derive(Debug, Clone, Copy)]
struct SectorInfo {
    ty: SectorType,
    /// File offset of the sector's type byte; the payload follows it.
    offset: u64,
}

#[derive(Debug)]
struct CurrentTrack {
    file_offset: u64,
    header: TrackHeader,
    sector_map: Vec<u8>,
    sectors: Vec<SectorInfo>,
}

/// One data-transfer command (read or write) as handed down by the
/// controller.
#[derive(Debug, Clone, Copy)]
pub struct DataRequest {
    pub head: u8,
    pub cylinder: u8,
    /// First logical sector id.
    pub sector: u8,
    /// Bytes-per-sector code; 0 means "cap each sector at `data_length`".
    pub size_code: u8,
    /// Last logical sector id of the transfer.
    pub end_of_track: u8,
    pub data_length: u8,
    pub mfm: bool,
    pub deleted: bool,
    pub skip: bool,
}

/// Geometry of a FORMAT TRACK command.
#[derive(Debug, Clone, Copy)]
pub struct FormatRequest {
    pub head: u8,
    pub mfm: bool,
    pub size_code: u8,
    pub sectors: u8,
    pub filler: u8,
}

/// Outcome of a data command.
#[derive(Debug, Clone, Copy)]
pub struct Transfer {
    pub status: TransferStatus,
    /// Bytes moved through the DMA window.
    pub bytes: usize,
    /// Logical sector id at which the loop stopped.
    pub final_sector: u8,
}

/// Parameters for creating a fresh image.
#[derive(Debug, Clone, Copy)]
pub struct CreateImageOpts {
    pub cylinders: u8,
    pub sectors: u8,
    pub size_code: u8,
    pub filler: u8,
    /// Store every sector compressed-with-filler instead of as a full body.
    pub packed: bool,
}

/// A parsed IMD disk image.
#[derive(Debug)]
pub struct ImdDisk<B: StorageBackend> {
    backend: B,
    name: String,
    read_only: bool,
    mode: Mode,
    /// Cylinder count; a disk whose last cylinder byte is 255 has 256.
    cylinders: u16,
    heads: u8,
    /// `track_map[head][cylinder]` → file offset of the track header.
    track_map: [Vec<Option<u64>>; 2],
    /// Present cylinder, as positioned by the last seek.
    position: u8,
    current: Option<CurrentTrack>,
}

impl<B: StorageBackend> ImdDisk<B> {
    /// Parse `backend` as an IMD image. On any error the backend is dropped,
    /// closing the underlying file.
    pub fn open(mut backend: B, name: &str, read_only: bool) -> Result<Self> {
        let len = backend.len()?;

        let mut sig = [0u8; 4];
        read_exact_at(&mut backend, 0, &mut sig)?;
        if sig != SIGNATURE {
            return Err(ImdError::CorruptImage("bad signature"));
        }

        let mut pos = find_comment_end(&mut backend, len)?;

        let mut track_map = [vec![None; 256], vec![None; 256]];
        let mut mode: Option<u8> = None;
        let mut max_cyl = 0u8;
        let mut max_head = 0u8;
        let mut tracks = 0usize;

        while pos < len {
            let track_offset = pos;
            let header = read_track_header(&mut backend, pos)?;
            if Mode::from_raw(header.mode).is_none() {
                return Err(ImdError::CorruptImage("unsupported track mode"));
            }
            match mode {
                None => mode = Some(header.mode),
                Some(m) if m == header.mode => {}
                Some(_) => return Err(ImdError::CorruptImage("mixed track modes")),
            }
            if header.size as usize >= SECTOR_SIZES.len() {
                return Err(ImdError::CorruptImage("sector size code out of range"));
            }
            let head = header.head_number();
            if head > 1 {
                return Err(ImdError::CorruptImage("head out of range"));
            }
            if track_map[head as usize][header.cylinder as usize].is_some() {
                return Err(ImdError::CorruptImage("duplicate track"));
            }
            track_map[head as usize][header.cylinder as usize] = Some(track_offset);
            max_cyl = max_cyl.max(header.cylinder);
            max_head = max_head.max(head);
            tracks += 1;

            pos += TRACK_HEADER_LEN + u64::from(header.sectors);
            if header.has_cyl_map() {
                pos += u64::from(header.sectors);
            }
            if header.has_head_map() {
                pos += u64::from(header.sectors);
            }
            for _ in 0..header.sectors {
                let mut ty = [0u8; 1];
                read_exact_at(&mut backend, pos, &mut ty)?;
                let ty = SectorType::from_raw(ty[0])?;
                pos += 1;
                pos += if ty.is_compressed() {
                    1
                } else {
                    header.sector_size() as u64
                };
            }
            if pos > len {
                return Err(ImdError::CorruptImage("truncated image"));
            }
        }

        let Some(mode) = mode else {
            return Err(ImdError::CorruptImage("image has no tracks"));
        };

        let cylinders = u16::from(max_cyl) + 1;
        debug!(
            name,
            tracks,
            cylinders,
            heads = max_head + 1,
            "parsed imd image"
        );

        Ok(Self {
            backend,
            name: name.to_string(),
            read_only,
            mode: Mode::from_raw(mode).expect("validated above"),
            cylinders,
            heads: max_head + 1,
            track_map,
            position: 0,
            current: None,
        })
    }

    /// Write a fresh single-sided MFM image into `backend` and return the
    /// backend. The sector map is flat (`0..sectors`) and every sector body
    /// is `filler`, stored compressed when `packed`.
    pub fn create_image(mut backend: B, opts: &CreateImageOpts) -> Result<B> {
        if opts.cylinders == 0 || opts.sectors == 0 {
            return Err(ImdError::Unsupported("empty geometry"));
        }
        if opts.size_code as usize >= SECTOR_SIZES.len() {
            return Err(ImdError::Unsupported("sector size code out of range"));
        }

        backend.set_len(0)?;
        let mut pos = 0u64;
        let comment = b"IMD 1.18: KIM-1 K-1013 image\r\n";
        backend.write_at(pos, &SIGNATURE)?;
        pos += SIGNATURE.len() as u64;
        backend.write_at(pos, comment)?;
        pos += comment.len() as u64;
        backend.write_at(pos, &[COMMENT_TERMINATOR])?;
        pos += 1;

        let size = SECTOR_SIZES[opts.size_code as usize];
        for cyl in 0..opts.cylinders {
            let header = [
                Mode::Mfm500 as u8,
                cyl,
                0, // head 0, no maps
                opts.sectors,
                opts.size_code,
            ];
            backend.write_at(pos, &header)?;
            pos += TRACK_HEADER_LEN;

            let map: Vec<u8> = (0..opts.sectors).collect();
            backend.write_at(pos, &map)?;
            pos += map.len() as u64;

            for _ in 0..opts.sectors {
                if opts.packed {
                    backend.write_at(pos, &[SectorType::COMPRESSED.code(), opts.filler])?;
                    pos += 2;
                } else {
                    backend.write_at(pos, &[SectorType::NORMAL.code()])?;
                    pos += 1;
                    backend.write_at(pos, &vec![opts.filler; size])?;
                    pos += size as u64;
                }
            }
        }
        backend.flush()?;
        Ok(backend)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn cylinders(&self) -> u16 {
        self.cylinders
    }

    pub fn heads(&self) -> u8 {
        self.heads
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Present cylinder (the last successfully seeked one).
    pub fn position(&self) -> u8 {
        self.position
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Position the head: load the track cache for `(head, cylinder)`.
    pub fn seek_track(&mut self, head: u8, cylinder: u8) -> Result<()> {
        self.load_track(head, cylinder)?;
        self.position = cylinder;
        Ok(())
    }

    /// Map a logical sector id to its physical index on the current track.
    pub fn physical_index(&self, logical: u8) -> Option<usize> {
        self.current
            .as_ref()?
            .sector_map
            .iter()
            .position(|&s| s == logical)
    }

    /// The logical sector map of the current track.
    pub fn sector_map(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|t| t.sector_map.as_slice())
    }

    /// READ ID: report the current track's geometry as a CHRN quad.
    pub fn read_id(&mut self, head: u8, mfm: bool) -> (TransferStatus, [u8; 4]) {
        let mut status = TransferStatus::default();
        if !self.mode.compatible(mfm) {
            status.st0 |= St0::ABNORMAL;
            status.st1 |= St1::NO_DATA;
            return (status, [0; 4]);
        }
        if self.ensure_track(head).is_err() {
            status.st0 |= St0::ABNORMAL;
            status.st1 |= St1::NO_DATA;
            return (status, [0; 4]);
        }
        let track = self.current.as_ref().expect("track loaded");
        let chrn = [
            track.header.cylinder,
            track.header.head_number(),
            track.header.sectors,
            track.header.size,
        ];
        (status, chrn)
    }

    /// Read sectors in logical order into the DMA window.
    ///
    /// `dma` is the controller's window (already clamped to the DMA limit);
    /// `do_copy` is false when the host's DMA direction register disagrees
    /// with the command, in which case the sector walk runs for its status
    /// effects but no bytes move.
    pub fn read_data(&mut self, req: &DataRequest, dma: &mut [u8], do_copy: bool) -> Result<Transfer> {
        let mut status = TransferStatus::default();
        let mut xfer = Transfer {
            status,
            bytes: 0,
            final_sector: req.sector,
        };

        if let Some(early) = self.transfer_preconditions(req, &mut status) {
            xfer.status = early;
            return Ok(xfer);
        }

        let trdata = self.transfer_len(req);
        let mut s = req.sector;
        loop {
            let Some(phys) = self.physical_index(s) else {
                status.st0 |= St0::ABNORMAL;
                status.st1 |= St1::NO_DATA;
                break;
            };
            let (sec_ty, sec_off) = {
                let track = self.current.as_ref().expect("track loaded");
                let info = &track.sectors[phys];
                (info.ty, info.offset)
            };

            if sec_ty.has_error() {
                status.st1 |= St1::DATA_ERROR;
                status.st2 |= St2::DATA_ERROR_IN_FIELD;
            }

            if sec_ty.is_deleted() != req.deleted {
                if req.skip {
                    if s == req.end_of_track {
                        status.st0 |= St0::ABNORMAL;
                        status.st1 |= St1::END_OF_CYLINDER;
                        break;
                    }
                    s = s.wrapping_add(1);
                    continue;
                }
                status.st0 |= St0::ABNORMAL;
                status.st2 |= St2::CONTROL_MARK;
                break;
            }

            if do_copy {
                let room = dma.len() - xfer.bytes;
                let n = trdata.min(room);
                if sec_ty.is_compressed() {
                    let mut fill = [0u8; 1];
                    self.backend.read_at(sec_off + 1, &mut fill)?;
                    dma[xfer.bytes..xfer.bytes + n].fill(fill[0]);
                } else {
                    self.backend
                        .read_at(sec_off + 1, &mut dma[xfer.bytes..xfer.bytes + n])?;
                }
                xfer.bytes += n;
                if n < trdata {
                    // The window acts as the terminal count.
                    break;
                }
            }

            if s == req.end_of_track {
                status.st0 |= St0::ABNORMAL;
                status.st1 |= St1::END_OF_CYLINDER;
                break;
            }
            s = s.wrapping_add(1);
        }

        trace!(
            sector = req.sector,
            final_sector = s,
            bytes = xfer.bytes,
            st1 = status.st1.bits(),
            st2 = status.st2.bits(),
            "read data"
        );
        xfer.final_sector = s;
        xfer.status = status;
        Ok(xfer)
    }

    /// Write sectors in logical order from the DMA window, uncompressing
    /// each compressed sector in place first.
    pub fn write_data(&mut self, req: &DataRequest, dma: &[u8], do_copy: bool) -> Result<Transfer> {
        let mut status = TransferStatus::default();
        let mut xfer = Transfer {
            status,
            bytes: 0,
            final_sector: req.sector,
        };

        if self.read_only {
            status.st0 |= St0::ABNORMAL;
            status.st1 |= St1::NOT_WRITEABLE;
            xfer.status = status;
            return Ok(xfer);
        }
        if let Some(early) = self.transfer_preconditions(req, &mut status) {
            xfer.status = early;
            return Ok(xfer);
        }

        let trdata = self.transfer_len(req);
        let new_ty = if req.deleted {
            SectorType::NORMAL_DELETED
        } else {
            SectorType::NORMAL
        };

        let mut s = req.sector;
        loop {
            let Some(phys) = self.physical_index(s) else {
                status.st0 |= St0::ABNORMAL;
                status.st1 |= St1::NO_DATA;
                break;
            };

            if do_copy {
                let is_compressed = {
                    let track = self.current.as_ref().expect("track loaded");
                    track.sectors[phys].ty.is_compressed()
                };
                if is_compressed {
                    self.uncompress_sector(phys)?;
                }

                let sec_off = {
                    let track = self.current.as_ref().expect("track loaded");
                    track.sectors[phys].offset
                };
                let room = dma.len() - xfer.bytes;
                let n = trdata.min(room);
                self.backend.write_at(sec_off, &[new_ty.code()])?;
                self.backend
                    .write_at(sec_off + 1, &dma[xfer.bytes..xfer.bytes + n])?;
                self.backend.flush()?;
                self.current.as_mut().expect("track loaded").sectors[phys].ty = new_ty;
                xfer.bytes += n;
                if n < trdata {
                    break;
                }
            }

            if s == req.end_of_track {
                status.st0 |= St0::ABNORMAL;
                status.st1 |= St1::END_OF_CYLINDER;
                break;
            }
            s = s.wrapping_add(1);
        }

        trace!(
            sector = req.sector,
            final_sector = s,
            bytes = xfer.bytes,
            st1 = status.st1.bits(),
            "write data"
        );
        xfer.final_sector = s;
        xfer.status = status;
        Ok(xfer)
    }

    /// Rewrite the current track's sector layout. Only a track whose
    /// geometry matches the already-parsed one can be formatted.
    ///
    /// `dma` holds one `(cylinder, head, sector, size-code)` quad per
    /// physical sector position.
    pub fn format_track(&mut self, req: &FormatRequest, dma: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(ImdError::ReadOnly);
        }
        if !self.mode.compatible(req.mfm) {
            return Err(ImdError::Unsupported("recording mode mismatch"));
        }
        self.ensure_track(req.head)?;

        let (track_offset, sectors, track_cyl, track_head, track_size) = {
            let track = self.current.as_ref().expect("track loaded");
            (
                track.file_offset,
                track.header.sectors,
                track.header.cylinder,
                track.header.head_number(),
                track.header.size,
            )
        };
        if req.sectors != sectors {
            return Err(ImdError::Unsupported("sector count mismatch"));
        }
        if req.size_code != track_size {
            return Err(ImdError::Unsupported("sector size mismatch"));
        }
        if dma.len() < usize::from(sectors) * 4 {
            return Err(ImdError::Unsupported("format table outside dma window"));
        }

        let size = SECTOR_SIZES[track_size as usize];
        let mut new_map = Vec::with_capacity(usize::from(sectors));
        for i in 0..usize::from(sectors) {
            let quad = &dma[i * 4..i * 4 + 4];
            let (cyl, head, sect, nbytes) = (quad[0], quad[1], quad[2], quad[3]);
            if cyl != track_cyl || head != track_head || nbytes != track_size {
                return Err(ImdError::Unsupported("format id mismatch"));
            }

            let (sec_off, sec_ty) = {
                let track = self.current.as_ref().expect("track loaded");
                (track.sectors[i].offset, track.sectors[i].ty)
            };
            let new_ty = if sec_ty.is_compressed() {
                SectorType::COMPRESSED
            } else {
                SectorType::NORMAL
            };
            if new_ty.is_compressed() {
                self.backend.write_at(sec_off, &[new_ty.code(), req.filler])?;
            } else {
                self.backend.write_at(sec_off, &[new_ty.code()])?;
                self.backend.write_at(sec_off + 1, &vec![req.filler; size])?;
            }

            let track = self.current.as_mut().expect("track loaded");
            track.sectors[i].ty = new_ty;
            track.sector_map[i] = sect;
            new_map.push(sect);
        }

        self.backend
            .write_at(track_offset + TRACK_HEADER_LEN, &new_map)?;
        self.backend.flush()?;
        debug!(
            cylinder = track_cyl,
            head = track_head,
            sectors,
            "formatted track"
        );
        Ok(())
    }

    /// Grow the compressed sector at physical index `phys` of the current
    /// track to its full size, shifting the rest of the file towards the
    /// end, chunk by chunk from the file end back to the sector.
    pub fn uncompress_sector(&mut self, phys: usize) -> Result<()> {
        if self.read_only {
            return Err(ImdError::ReadOnly);
        }
        let (sec_off, sec_ty, size, track_offset) = {
            let track = self
                .current
                .as_ref()
                .ok_or(ImdError::Unsupported("no current track"))?;
            let info = track
                .sectors
                .get(phys)
                .ok_or(ImdError::Unsupported("sector index out of range"))?;
            (
                info.offset,
                info.ty,
                track.header.sector_size(),
                track.file_offset,
            )
        };
        if !sec_ty.is_compressed() {
            return Ok(());
        }

        let mut fill = [0u8; 1];
        self.backend.read_at(sec_off + 1, &mut fill)?;

        let growth = (size - 1) as u64;
        let len = self.backend.len()?;
        let tail_start = sec_off + 2;

        // Shift the tail towards the end of the file, last chunk first, so a
        // chunk never overwrites bytes that still need moving.
        let mut remaining = len - tail_start;
        let mut src_end = len;
        let mut buf = vec![0u8; UNCOMPRESS_CHUNK];
        while remaining > 0 {
            let n = remaining.min(UNCOMPRESS_CHUNK as u64) as usize;
            let src = src_end - n as u64;
            self.backend.read_at(src, &mut buf[..n])?;
            self.backend.write_at(src + growth, &buf[..n])?;
            self.backend.flush()?;
            src_end = src;
            remaining -= n as u64;
        }

        let new_ty = sec_ty.uncompressed();
        self.backend.write_at(sec_off, &[new_ty.code()])?;
        self.backend.write_at(sec_off + 1, &vec![fill[0]; size])?;
        self.backend.flush()?;

        // Every file offset past this sector moved by `growth`.
        for map in self.track_map.iter_mut() {
            for entry in map.iter_mut().flatten() {
                if *entry > track_offset {
                    *entry += growth;
                }
            }
        }
        let track = self.current.as_mut().expect("track loaded");
        track.sectors[phys].ty = new_ty;
        for info in &mut track.sectors {
            if info.offset > sec_off {
                info.offset += growth;
            }
        }
        debug!(
            phys,
            size,
            fill = fill[0],
            "uncompressed sector in place"
        );
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }

    /// Shared read/write preconditions. Returns the terminal status when one
    /// fails.
    fn transfer_preconditions(
        &mut self,
        req: &DataRequest,
        status: &mut TransferStatus,
    ) -> Option<TransferStatus> {
        if !self.mode.compatible(req.mfm) {
            status.st0 |= St0::ABNORMAL;
            status.st1 |= St1::MISSING_ADDRESS_MARK;
            return Some(*status);
        }
        if req.head >= self.heads || self.ensure_track(req.head).is_err() {
            status.st0 |= St0::ABNORMAL;
            status.st1 |= St1::NO_DATA;
            return Some(*status);
        }
        let track = self.current.as_ref().expect("track loaded");
        if req.cylinder != track.header.cylinder {
            status.st0 |= St0::ABNORMAL;
            status.st1 |= St1::NO_DATA;
            status.st2 |= St2::WRONG_CYLINDER;
            return Some(*status);
        }
        if req.size_code != 0 && req.size_code != track.header.size {
            status.st0 |= St0::ABNORMAL;
            status.st1 |= St1::NO_DATA;
            return Some(*status);
        }
        None
    }

    /// Per-sector transfer length for a request against the current track.
    fn transfer_len(&self, req: &DataRequest) -> usize {
        let track = self.current.as_ref().expect("track loaded");
        let size = track.header.sector_size();
        if req.size_code == 0 {
            size.min(usize::from(req.data_length))
        } else {
            size
        }
    }

    /// Load the cache for `(head, current position)` if it isn't resident.
    fn ensure_track(&mut self, head: u8) -> Result<()> {
        let cyl = self.position;
        if let Some(track) = &self.current {
            if track.header.head_number() == head && track.header.cylinder == cyl {
                return Ok(());
            }
        }
        self.load_track(head, cyl)
    }

    fn load_track(&mut self, head: u8, cylinder: u8) -> Result<()> {
        let offset = *self
            .track_map
            .get(usize::from(head))
            .ok_or(ImdError::NoTrack { head, cylinder })?
            .get(usize::from(cylinder))
            .ok_or(ImdError::NoTrack { head, cylinder })?;
        let Some(offset) = offset else {
            return Err(ImdError::NoTrack { head, cylinder });
        };

        let header = read_track_header(&mut self.backend, offset)?;
        let mut pos = offset + TRACK_HEADER_LEN;

        let mut sector_map = vec![0u8; usize::from(header.sectors)];
        read_exact_at(&mut self.backend, pos, &mut sector_map)?;
        pos += u64::from(header.sectors);
        if header.has_cyl_map() {
            pos += u64::from(header.sectors);
        }
        if header.has_head_map() {
            pos += u64::from(header.sectors);
        }

        let mut sectors = Vec::with_capacity(usize::from(header.sectors));
        for _ in 0..header.sectors {
            let mut ty = [0u8; 1];
            read_exact_at(&mut self.backend, pos, &mut ty)?;
            let ty = SectorType::from_raw(ty[0])?;
            sectors.push(SectorInfo { ty, offset: pos });
            pos += 1;
            pos += if ty.is_compressed() {
                1
            } else {
                header.sector_size() as u64
            };
        }

        self.current = Some(CurrentTrack {
            file_offset: offset,
            header,
            sector_map,
            sectors,
        });
        Ok(())
    }
}

fn read_exact_at<B: StorageBackend>(backend: &mut B, offset: u64, buf: &mut [u8]) -> Result<()> {
    backend.read_at(offset, buf).map_err(|err| match err {
        ImdError::OutOfBounds { .. } => ImdError::CorruptImage("truncated image"),
        other => other,
    })
}

fn read_track_header<B: StorageBackend>(backend: &mut B, offset: u64) -> Result<TrackHeader> {
    let mut raw = [0u8; TRACK_HEADER_LEN as usize];
    read_exact_at(backend, offset, &mut raw)?;
    Ok(TrackHeader {
        mode: raw[0],
        cylinder: raw[1],
        head: raw[2],
        sectors: raw[3],
        size: raw[4],
    })
}

fn find_comment_end<B: StorageBackend>(backend: &mut B, len: u64) -> Result<u64> {
    let mut pos = SIGNATURE.len() as u64;
    let mut buf = [0u8; 256];
    while pos < len {
        let n = ((len - pos).min(buf.len() as u64)) as usize;
        read_exact_at(backend, pos, &mut buf[..n])?;
        if let Some(i) = buf[..n].iter().position(|&b| b == COMMENT_TERMINATOR) {
            return Ok(pos + i as u64 + 1);
        }
        pos += n as u64;
    }
    Err(ImdError::CorruptImage("missing comment terminator"))
}
