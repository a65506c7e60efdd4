//! K-1013 floppy disk controller: a uPD765-compatible command/result state
//! machine whose four registers (HSR, DAR, MSR, UDR) are aliased into cells
//! of the emulated memory map, with DMA transfers landing directly in the
//! card's RAM.

mod drive;
mod fdc;
mod regs;

pub use drive::{DriveBank, MountError, MAX_DRIVES};
pub use fdc::{Fdc, FdcOptions, Interrupt};
pub use regs::{dma_address, dma_window, Hsr, Msr, RegisterAddrs, DAR_ODD, DAR_USER, HSR_HOST_MASK};
