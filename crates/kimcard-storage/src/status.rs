//! uPD765 status-register bit vocabulary.
//!
//! The engine reports per-transfer outcomes in these terms so the controller
//! can fold them straight into its result bytes.

use bitflags::bitflags;

bitflags! {
    /// Status register 0.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct St0: u8 {
        /// Interrupt code 01: abnormal termination.
        const ABNORMAL = 0x40;
        /// Interrupt code 10: invalid command.
        const INVALID = 0x80;
        /// Seek end.
        const SEEK_END = 0x20;
        /// Equipment check.
        const EQUIPMENT_CHECK = 0x10;
        /// Drive not ready.
        const NOT_READY = 0x08;
        /// Head address at command completion.
        const HEAD = 0x04;
    }
}

bitflags! {
    /// Status register 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct St1: u8 {
        /// End of cylinder: the sector at EOT was transferred.
        const END_OF_CYLINDER = 0x80;
        /// Data error (in an IMD image: a sector recorded with an error type).
        const DATA_ERROR = 0x20;
        /// Overrun.
        const OVERRUN = 0x10;
        /// Board-specific: the computed DMA address crosses the 4 KiB
        /// half-boundary of an odd-aligned window. Unused on a real uPD765.
        const BAD_DMA = 0x08;
        /// No data: sector id not present on the track.
        const NO_DATA = 0x04;
        /// Not writeable: write to a protected image.
        const NOT_WRITEABLE = 0x02;
        /// Missing address mark: medium incompatible with the command's
        /// FM/MFM flag.
        const MISSING_ADDRESS_MARK = 0x01;
    }
}

bitflags! {
    /// Status register 2.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct St2: u8 {
        /// Control mark: sector's deleted flag conflicts with the command.
        const CONTROL_MARK = 0x40;
        /// Data error in the data field.
        const DATA_ERROR_IN_FIELD = 0x20;
        /// Wrong cylinder: header cylinder differs from the command's.
        const WRONG_CYLINDER = 0x10;
        /// Bad cylinder.
        const BAD_CYLINDER = 0x02;
        /// Missing data address mark.
        const MISSING_DATA_MARK = 0x01;
    }
}

bitflags! {
    /// Status register 3 (drive status, SENSE DRIVE).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct St3: u8 {
        const FAULT = 0x80;
        const WRITE_PROTECTED = 0x40;
        const READY = 0x20;
        const TRACK0 = 0x10;
        const TWO_SIDE = 0x08;
        const HEAD = 0x04;
    }
}

/// The ST0/ST1/ST2 triple accumulated over one data command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStatus {
    pub st0: St0,
    pub st1: St1,
    pub st2: St2,
}

impl TransferStatus {
    /// Whether the command terminated normally.
    pub fn is_normal(&self) -> bool {
        !self.st0.intersects(St0::ABNORMAL | St0::INVALID)
    }
}
