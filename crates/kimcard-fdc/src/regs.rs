//! Register layout and DMA-address arithmetic.

use bitflags::bitflags;

bitflags! {
    /// Main status register, maintained by the controller in its alias cell.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Msr: u8 {
        /// Ready for the next byte through UDR.
        const RQM = 0x80;
        /// Transfer direction: set when the controller has bytes for the
        /// host.
        const DIR = 0x40;
        /// A command is in progress.
        const BUSY = 0x10;
    }
}

bitflags! {
    /// Hardware status/control register.
    ///
    /// The top two bits are controller-maintained and read-only from the
    /// host: the bus lane masks host writes to the low six bits. `IRQREQ`
    /// is active low.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Hsr: u8 {
        /// No interrupt pending (active-low interrupt request).
        const IRQREQ = 0x80;
        /// Option switch, reflected from the board configuration.
        const OPTION = 0x40;
        /// IRQ output enable.
        const IRQ_ENABLE = 0x04;
        /// Force write-protect on every drive.
        const WP_OVERRIDE = 0x02;
        /// DMA direction: clear = host to controller, set = controller to
        /// host.
        const DMA_DIR = 0x01;
    }
}

/// Bits of HSR a host write may change.
pub const HSR_HOST_MASK: u8 = 0x3F;

/// DAR bit 7: select the user window instead of the system window.
pub const DAR_USER: u8 = 0x80;
/// DAR bit 6: address the odd (upper) 4 KiB half of the window.
pub const DAR_ODD: u8 = 0x40;
const DAR_OFFSET_MASK: u8 = 0x3F;

/// Where the four controller registers sit in the address map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterAddrs {
    pub hsr: u16,
    pub dar: u16,
    pub msr: u16,
    pub udr: u16,
}

impl Default for RegisterAddrs {
    fn default() -> Self {
        Self {
            hsr: 0xFFE8,
            dar: 0xFFE9,
            msr: 0xFFEE,
            udr: 0xFFEF,
        }
    }
}

/// Effective DMA address for a window base and DAR value.
///
/// The low six DAR bits give a 64-byte-granular offset inside a 4 KiB half
/// of the 8 KiB window; the ODD bit selects the upper half. A window based
/// on an odd 4 KiB boundary has no upper half of its own: the ODD bit
/// would carry the address out of the bank, so the combination is invalid.
pub fn dma_address(base: u16, dar: u8) -> Option<u16> {
    let odd = dar & DAR_ODD != 0;
    let odd_aligned = base & 0x1000 != 0;
    if odd && odd_aligned {
        return None;
    }
    let half = if odd { 0x1000 } else { 0 };
    Some(base + half + (u16::from(dar & DAR_OFFSET_MASK) << 6))
}

/// Effective DMA address plus the number of bytes left in the window (the
/// half-window, for an odd-aligned base).
pub fn dma_window(base: u16, dar: u8) -> Option<(u16, usize)> {
    let addr = dma_address(base, dar)?;
    let odd_aligned = base & 0x1000 != 0;
    let span: usize = if odd_aligned { 0x1000 } else { 0x2000 };
    Some((addr, span - usize::from(addr - base)))
}
