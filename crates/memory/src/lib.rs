//! 64 KiB attribute-tagged cell map for the programmable memory card.
//!
//! Each of the 65536 bus addresses is backed by a 16-bit cell: the low byte
//! is the data the card drives onto (or latches from) the host bus, bit 8
//! marks the cell as disabled (the card floats the bus) and bit 9 marks it
//! writeable (RAM rather than ROM).
//!
//! Cells are stored as atomics so the bus responder can read them without
//! taking a lock. The bus responder is the only writer of cell *data* during
//! normal operation; the control plane may rewrite any field but serialises
//! itself behind the controller mutex. A one-cycle-stale attribute read on
//! the bus lane is acceptable.

use std::sync::atomic::{AtomicU16, Ordering};

/// Number of addressable cells.
pub const CELL_COUNT: usize = 0x1_0000;

/// Size in bytes of a raw cell-image snapshot (two bytes per cell,
/// little-endian).
pub const CELL_IMAGE_BYTES: usize = CELL_COUNT * 2;

/// Attribute bit: the cell does not respond to bus cycles.
pub const ATTR_DISABLED: u16 = 1 << 8;

/// Attribute bit: the cell accepts bus writes (RAM).
pub const ATTR_WRITEABLE: u16 = 1 << 9;

const ATTR_MASK: u16 = ATTR_DISABLED | ATTR_WRITEABLE;

/// A bulk operation applied to a contiguous address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    /// Set the data byte of every cell in the range.
    Fill(u8),
    /// Clear the DISABLED attribute.
    Enable,
    /// Set the DISABLED attribute.
    Disable,
    /// Clear the WRITEABLE attribute.
    MarkRom,
    /// Set the WRITEABLE attribute.
    MarkRam,
}

/// The 64 Ki cell array.
pub struct MemoryMap {
    cells: Box<[AtomicU16]>,
}

impl MemoryMap {
    /// Create a map with every cell disabled, non-writeable and zeroed.
    pub fn new() -> Self {
        let mut cells = Vec::with_capacity(CELL_COUNT);
        cells.resize_with(CELL_COUNT, || AtomicU16::new(ATTR_DISABLED));
        Self {
            cells: cells.into_boxed_slice(),
        }
    }

    /// Create a map holding the factory-default layout: RAM from `0x0000`
    /// to `0x9FFF`, ROM from `0xA000` to `0xBFFF` carrying the board
    /// identification bytes at `0xA000`, a disabled hole over the I/O pages
    /// at `0xC000..0xE000`, and ROM from `0xE000` up.
    pub fn factory_default() -> Self {
        let map = Self::new();
        map.range_op(0x0000, 0xA000, RangeOp::Enable);
        map.range_op(0x0000, 0xA000, RangeOp::MarkRam);
        map.range_op(0xA000, 0x2000, RangeOp::Enable);
        map.range_op(0xE000, 0x2000, RangeOp::Enable);
        for (i, b) in b"EDUARDO".iter().enumerate() {
            map.store_data(0xA000 + i as u16, *b);
        }
        map
    }

    /// Read the full 16-bit cell (data + attributes).
    #[inline]
    pub fn read_cell(&self, addr: u16) -> u16 {
        self.cells[addr as usize].load(Ordering::Acquire)
    }

    /// The cell's data byte, regardless of attributes.
    #[inline]
    pub fn data(&self, addr: u16) -> u8 {
        self.read_cell(addr) as u8
    }

    /// Whether the cell responds to bus cycles.
    #[inline]
    pub fn is_enabled(&self, addr: u16) -> bool {
        self.read_cell(addr) & ATTR_DISABLED == 0
    }

    /// Whether the cell accepts bus writes.
    #[inline]
    pub fn is_writeable(&self, addr: u16) -> bool {
        self.read_cell(addr) & ATTR_WRITEABLE != 0
    }

    /// Replace the data byte, preserving both attribute bits.
    #[inline]
    pub fn write_cell(&self, addr: u16, data: u8) {
        let cell = &self.cells[addr as usize];
        let mut cur = cell.load(Ordering::Acquire);
        loop {
            let next = (cur & ATTR_MASK) | u16::from(data);
            match cell.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Unconditionally set the data byte. Used by the controller's DMA path,
    /// which targets the card's own RAM array and is not gated by the
    /// writeable attribute.
    #[inline]
    pub fn store_data(&self, addr: u16, data: u8) {
        self.write_cell(addr, data)
    }

    /// Overwrite the whole cell, attributes included.
    #[inline]
    pub fn store_raw(&self, addr: u16, word: u16) {
        self.cells[addr as usize].store(word, Ordering::Release);
    }

    /// Set both attribute bits, preserving the data byte.
    pub fn set_attrs(&self, addr: u16, enabled: bool, writeable: bool) {
        let cell = &self.cells[addr as usize];
        let mut cur = cell.load(Ordering::Acquire);
        loop {
            let mut next = cur & !ATTR_MASK;
            if !enabled {
                next |= ATTR_DISABLED;
            }
            if writeable {
                next |= ATTR_WRITEABLE;
            }
            match cell.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Apply `op` to `count` cells starting at `start`. The range is clamped
    /// at the top of the address space rather than wrapping.
    pub fn range_op(&self, start: u16, count: usize, op: RangeOp) {
        let start = start as usize;
        let end = (start + count).min(CELL_COUNT);
        for addr in start..end {
            let addr = addr as u16;
            match op {
                RangeOp::Fill(byte) => self.write_cell(addr, byte),
                RangeOp::Enable => self.update_attr(addr, ATTR_DISABLED, false),
                RangeOp::Disable => self.update_attr(addr, ATTR_DISABLED, true),
                RangeOp::MarkRom => self.update_attr(addr, ATTR_WRITEABLE, false),
                RangeOp::MarkRam => self.update_attr(addr, ATTR_WRITEABLE, true),
            }
        }
    }

    fn update_attr(&self, addr: u16, bit: u16, set: bool) {
        let cell = &self.cells[addr as usize];
        let mut cur = cell.load(Ordering::Acquire);
        loop {
            let next = if set { cur | bit } else { cur & !bit };
            match cell.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Serialise every cell as little-endian words.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CELL_IMAGE_BYTES);
        for cell in self.cells.iter() {
            out.extend_from_slice(&cell.load(Ordering::Acquire).to_le_bytes());
        }
        out
    }

    /// Load every cell from a little-endian cell image produced by
    /// [`MemoryMap::snapshot`]. Returns `false` (leaving the map untouched)
    /// if the image is not exactly [`CELL_IMAGE_BYTES`] long.
    pub fn load_image(&self, image: &[u8]) -> bool {
        if image.len() != CELL_IMAGE_BYTES {
            return false;
        }
        for (i, chunk) in image.chunks_exact(2).enumerate() {
            let word = u16::from_le_bytes([chunk[0], chunk[1]]);
            self.cells[i].store(word, Ordering::Release);
        }
        true
    }

    /// Copy every cell of `source` into this map.
    pub fn copy_default_map(&self, source: &MemoryMap) {
        for (dst, src) in self.cells.iter().zip(source.cells.iter()) {
            dst.store(src.load(Ordering::Acquire), Ordering::Release);
        }
    }
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_map_is_disabled_rom() {
        let map = MemoryMap::new();
        assert!(!map.is_enabled(0x1234));
        assert!(!map.is_writeable(0x1234));
        assert_eq!(map.data(0x1234), 0);
    }

    #[test]
    fn write_cell_preserves_attributes() {
        let map = MemoryMap::new();
        map.set_attrs(0x0042, true, false);
        map.write_cell(0x0042, 0xAB);
        assert_eq!(map.data(0x0042), 0xAB);
        assert!(map.is_enabled(0x0042));
        assert!(!map.is_writeable(0x0042));
    }

    #[test]
    fn set_attrs_preserves_data() {
        let map = MemoryMap::new();
        map.write_cell(0x8000, 0x5A);
        map.set_attrs(0x8000, true, true);
        assert_eq!(map.data(0x8000), 0x5A);
        map.set_attrs(0x8000, false, false);
        assert_eq!(map.data(0x8000), 0x5A);
    }

    #[test]
    fn range_op_clamps_at_top_of_address_space() {
        let map = MemoryMap::new();
        map.range_op(0xFFFE, 16, RangeOp::Enable);
        assert!(map.is_enabled(0xFFFE));
        assert!(map.is_enabled(0xFFFF));
        assert!(!map.is_enabled(0x0000));
    }

    #[test]
    fn factory_default_carries_board_id() {
        let map = MemoryMap::factory_default();
        let id: Vec<u8> = (0..7).map(|i| map.data(0xA000 + i)).collect();
        assert_eq!(&id, b"EDUARDO");
        assert!(map.is_enabled(0xA000));
        assert!(!map.is_writeable(0xA000));
        assert!(map.is_enabled(0x0000));
        assert!(map.is_writeable(0x0000));
        assert!(!map.is_enabled(0xC800));
    }

    #[test]
    fn snapshot_round_trips() {
        let map = MemoryMap::factory_default();
        map.write_cell(0x0100, 0x77);
        let image = map.snapshot();
        assert_eq!(image.len(), CELL_IMAGE_BYTES);

        let restored = MemoryMap::new();
        assert!(restored.load_image(&image));
        assert_eq!(restored.data(0x0100), 0x77);
        assert_eq!(restored.data(0xA001), b'D');
        assert!(!restored.load_image(&image[..10]));
    }

    #[test]
    fn copy_default_map_replaces_everything() {
        let defaults = MemoryMap::factory_default();
        let map = MemoryMap::new();
        map.store_raw(0xA000, 0x00FF);
        map.copy_default_map(&defaults);
        assert_eq!(map.data(0xA000), b'E');
        assert!(map.is_enabled(0x0000));
    }
}
