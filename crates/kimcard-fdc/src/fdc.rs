use std::sync::Arc;

use kimcard_bus::{Access, BusEvent, Tap};
use kimcard_storage::{
    DataRequest, FormatRequest, ImdDisk, ImdError, St0, St1, St3, StorageBackend,
};
use memory::MemoryMap;
use tracing::{debug, trace, warn};

use crate::drive::{DriveBank, MountError};
use crate::regs::{dma_window, Hsr, Msr, RegisterAddrs, DAR_USER, HSR_HOST_MASK};

/// Command/result protocol phase. Execution happens synchronously inside
/// the handler that consumes the last command byte, so it never appears as
/// a resting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Command,
    Status,
}

/// What the asserted interrupt line is waiting to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    None,
    /// A seek or recalibrate finished; cleared by SENSE INTERRUPT.
    Seek,
    /// A command finished; cleared by draining the result bytes.
    Command,
    /// Drive ready state changed (mount/unmount); cleared by SENSE
    /// INTERRUPT.
    Attention,
    /// An unimplemented opcode; cleared by draining the result byte.
    Invalid,
}

/// Board-level knobs the controller is built with.
#[derive(Debug, Clone, Copy)]
pub struct FdcOptions {
    /// Base of the SYSTEM 8 KiB DMA window.
    pub system_base: u16,
    /// Base of the USER 8 KiB DMA window.
    pub user_base: u16,
    /// Reflected into HSR bit 6.
    pub option_switch: bool,
}

impl Default for FdcOptions {
    fn default() -> Self {
        Self {
            system_base: 0x2000,
            user_base: 0x4000,
            option_switch: false,
        }
    }
}

/// The K-1013 controller state machine.
pub struct Fdc<B: StorageBackend> {
    mem: Arc<MemoryMap>,
    regs: RegisterAddrs,
    opts: FdcOptions,
    drives: DriveBank<B>,
    phase: Phase,
    cmd: Vec<u8>,
    cmd_len: usize,
    result: Vec<u8>,
    result_pos: usize,
    pending: Interrupt,
    /// `(ST0, present cylinder)` reported by the next SENSE INTERRUPT.
    seek_result: (u8, u8),
    /// Host-written HSR control bits (low six).
    hsr_control: u8,
    irq_pending: bool,
}

fn command_length(op: u8) -> usize {
    match op & 0x1F {
        0x03 => 3, // SPECIFY
        0x04 => 2, // SENSE DRIVE
        0x05 => 9, // WRITE DATA
        0x06 => 9, // READ DATA
        0x07 => 2, // RECALIBRATE
        0x08 => 1, // SENSE INTERRUPT
        0x09 => 9, // WRITE DELETED DATA
        0x0A => 2, // READ ID
        0x0C => 9, // READ DELETED DATA
        0x0D => 6, // FORMAT TRACK
        0x0F => 3, // SEEK
        _ => 1,
    }
}

impl<B: StorageBackend> Fdc<B> {
    pub fn new(mem: Arc<MemoryMap>, regs: RegisterAddrs, opts: FdcOptions) -> Self {
        let fdc = Self {
            mem,
            regs,
            opts,
            drives: DriveBank::new(),
            phase: Phase::Idle,
            cmd: Vec::with_capacity(9),
            cmd_len: 0,
            result: Vec::with_capacity(7),
            result_pos: 0,
            pending: Interrupt::None,
            seek_result: (St0::INVALID.bits(), 0),
            hsr_control: 0,
            irq_pending: false,
        };
        for addr in [regs.hsr, regs.dar, regs.msr, regs.udr] {
            fdc.mem.write_cell(addr, 0);
        }
        fdc.refresh_register_cells();
        fdc
    }

    /// Re-establish the register cells (attributes and controller-owned
    /// values) after the memory map has been bulk-replaced underneath us.
    pub fn refresh_register_cells(&self) {
        for addr in [self.regs.hsr, self.regs.dar, self.regs.msr, self.regs.udr] {
            self.mem.set_attrs(addr, true, false);
        }
        self.mem.write_cell(self.regs.hsr, self.hsr_control);
        self.sync_hsr();
        let msr = match self.phase {
            Phase::Idle => Msr::RQM,
            Phase::Command => Msr::RQM | Msr::BUSY,
            Phase::Status => Msr::RQM | Msr::DIR | Msr::BUSY,
        };
        self.set_msr(msr);
        if self.phase == Phase::Status {
            if let Some(&byte) = self.result.get(self.result_pos) {
                self.mem.write_cell(self.regs.udr, byte);
            }
        }
    }

    /// Bus taps for the four alias registers. MSR ignores host writes
    /// entirely; HSR lets the host touch only its low six bits.
    pub fn taps(&self) -> Vec<Tap> {
        vec![
            Tap {
                addr: self.regs.hsr,
                write_mask: HSR_HOST_MASK,
            },
            Tap {
                addr: self.regs.dar,
                write_mask: 0xFF,
            },
            Tap {
                addr: self.regs.msr,
                write_mask: 0x00,
            },
            Tap {
                addr: self.regs.udr,
                write_mask: 0xFF,
            },
        ]
    }

    pub fn regs(&self) -> &RegisterAddrs {
        &self.regs
    }

    pub fn drives(&self) -> &DriveBank<B> {
        &self.drives
    }

    pub fn drives_mut(&mut self) -> &mut DriveBank<B> {
        &mut self.drives
    }

    pub fn interrupt_pending(&self) -> bool {
        self.irq_pending
    }

    /// Mount an opened image and raise an attention interrupt.
    pub fn mount(&mut self, drive: usize, disk: ImdDisk<B>) -> Result<(), MountError> {
        self.drives.mount(drive, disk)?;
        self.raise_attention(drive);
        Ok(())
    }

    /// Unmount a drive, raise an attention interrupt and hand the image
    /// back for closing.
    pub fn unmount(&mut self, drive: usize) -> Result<ImdDisk<B>, MountError> {
        let disk = self.drives.unmount(drive)?;
        self.raise_attention(drive);
        Ok(disk)
    }

    /// Consume one alias-register access from the bus lane.
    pub fn handle_event(&mut self, event: BusEvent) {
        match (event.addr, event.access) {
            (addr, Access::Write) if addr == self.regs.udr => self.udr_write(event.value),
            (addr, Access::Read) if addr == self.regs.udr => self.udr_read(),
            (addr, Access::Write) if addr == self.regs.hsr => self.hsr_write(event.value),
            _ => {}
        }
    }

    fn udr_write(&mut self, value: u8) {
        match self.phase {
            Phase::Idle => {
                self.cmd.clear();
                self.cmd.push(value);
                self.cmd_len = command_length(value);
                if self.cmd.len() == self.cmd_len {
                    self.execute();
                } else {
                    self.phase = Phase::Command;
                    self.set_msr(Msr::RQM | Msr::BUSY);
                }
            }
            Phase::Command => {
                self.cmd.push(value);
                if self.cmd.len() == self.cmd_len {
                    self.execute();
                }
            }
            Phase::Status => {
                trace!(value, "udr write ignored during status phase");
            }
        }
    }

    fn udr_read(&mut self) {
        if self.phase != Phase::Status {
            return;
        }
        self.result_pos += 1;
        if self.result_pos < self.result.len() {
            self.mem.write_cell(self.regs.udr, self.result[self.result_pos]);
        } else {
            // All status bytes consumed: that is the host's acknowledge.
            if matches!(self.pending, Interrupt::Command | Interrupt::Invalid) {
                self.pending = Interrupt::None;
                self.set_irq(false);
            }
            self.finish_idle();
        }
    }

    fn hsr_write(&mut self, value: u8) {
        self.hsr_control = value & HSR_HOST_MASK;
        // IRQ enable may have flipped; recompute the line.
        self.sync_hsr();
    }

    fn execute(&mut self) {
        self.set_msr(Msr::BUSY);
        let op = self.cmd[0] & 0x1F;
        debug!(op, bytes = self.cmd.len(), "executing command");
        match op {
            0x03 => self.finish_idle(), // SPECIFY: timing parameters are moot
            0x04 => {
                let st3 = self.sense_drive();
                self.enter_status(vec![st3], Interrupt::None);
            }
            0x05 => self.exec_data(true, false),
            0x06 => self.exec_data(false, false),
            0x07 => self.exec_seek(true),
            0x08 => self.exec_sense_interrupt(),
            0x09 => self.exec_data(true, true),
            0x0A => self.exec_read_id(),
            0x0C => self.exec_data(false, true),
            0x0D => self.exec_format(),
            0x0F => self.exec_seek(false),
            _ => {
                warn!(op, "unimplemented command");
                self.enter_status(vec![St0::INVALID.bits()], Interrupt::Invalid);
            }
        }
    }

    fn sense_drive(&self) -> u8 {
        let select = self.cmd[1];
        let drive = usize::from(select & 3);
        let mut st3 = (select & 0x07) | St3::TWO_SIDE.bits();
        if let Some(disk) = self.drives.get(drive) {
            st3 |= St3::READY.bits();
            if disk.position() == 0 {
                st3 |= St3::TRACK0.bits();
            }
            if disk.read_only() || self.wp_override() {
                st3 |= St3::WRITE_PROTECTED.bits();
            }
        }
        st3
    }

    fn exec_sense_interrupt(&mut self) {
        let (st0, pcn) = self.seek_result;
        if matches!(self.pending, Interrupt::Seek | Interrupt::Attention) {
            self.pending = Interrupt::None;
            self.set_irq(false);
        }
        self.enter_status(vec![st0, pcn], Interrupt::None);
    }

    fn exec_seek(&mut self, recalibrate: bool) {
        let select = self.cmd[1];
        let drive = usize::from(select & 3);
        let head = if recalibrate { 0 } else { (select >> 2) & 1 };
        let target = if recalibrate { 0 } else { self.cmd[2] };
        let st0_base = if recalibrate { select & 3 } else { select & 0x07 };

        self.seek_result = match self.drives.get_mut(drive) {
            None => (
                st0_base | (St0::SEEK_END | St0::ABNORMAL | St0::NOT_READY).bits(),
                0,
            ),
            Some(disk) => match disk.seek_track(head, target) {
                Ok(()) => (st0_base | St0::SEEK_END.bits(), target),
                Err(err) => {
                    debug!(drive, target, %err, "seek failed");
                    (
                        st0_base | (St0::SEEK_END | St0::ABNORMAL | St0::EQUIPMENT_CHECK).bits(),
                        disk.position(),
                    )
                }
            },
        };
        self.pending = Interrupt::Seek;
        self.set_irq(true);
        self.finish_idle();
    }

    fn exec_read_id(&mut self) {
        let select = self.cmd[1];
        let drive = usize::from(select & 3);
        let head = (select >> 2) & 1;
        let mfm = self.cmd[0] & 0x40 != 0;
        let mut st0 = select & 0x07;
        let mut st1 = 0u8;
        let mut st2 = 0u8;
        let mut chrn = [0u8; 4];

        match self.drives.get_mut(drive) {
            None => st0 |= (St0::ABNORMAL | St0::NOT_READY).bits(),
            Some(disk) => {
                let (status, id) = disk.read_id(head, mfm);
                st0 |= status.st0.bits();
                st1 = status.st1.bits();
                st2 = status.st2.bits();
                chrn = id;
            }
        }
        self.enter_status(
            vec![st0, st1, st2, chrn[0], chrn[1], chrn[2], chrn[3]],
            Interrupt::Command,
        );
    }

    fn exec_data(&mut self, write: bool, deleted: bool) {
        let c = self.cmd.clone();
        let mfm = c[0] & 0x40 != 0;
        let skip = c[0] & 0x20 != 0;
        let drive = usize::from(c[1] & 3);
        let head = (c[1] >> 2) & 1;
        let (cyl, h, r, n, eot, dtl) = (c[2], c[3], c[4], c[5], c[6], c[8]);

        let mut st0 = c[1] & 0x07;
        let mut st1 = 0u8;
        let mut st2 = 0u8;
        let mut final_r = r;

        let dar = self.mem.data(self.regs.dar);
        let base = if dar & DAR_USER != 0 {
            self.opts.user_base
        } else {
            self.opts.system_base
        };
        let dma_dir_out = self.hsr_control & Hsr::DMA_DIR.bits() != 0;
        let do_copy = if write { !dma_dir_out } else { dma_dir_out };
        let wp = self.wp_override();

        match dma_window(base, dar) {
            None => {
                st0 |= (St0::ABNORMAL | St0::EQUIPMENT_CHECK).bits();
                st1 |= St1::BAD_DMA.bits();
            }
            Some((addr, max_dma)) => match self.drives.get_mut(drive) {
                None => st0 |= (St0::ABNORMAL | St0::NOT_READY).bits(),
                Some(disk) => {
                    let req = DataRequest {
                        head,
                        cylinder: cyl,
                        sector: r,
                        size_code: n,
                        end_of_track: eot,
                        data_length: dtl,
                        mfm,
                        deleted,
                        skip,
                    };
                    let outcome = if write {
                        if wp {
                            st0 |= St0::ABNORMAL.bits();
                            st1 |= St1::NOT_WRITEABLE.bits();
                            None
                        } else {
                            let buf: Vec<u8> = (0..max_dma)
                                .map(|i| self.mem.data(addr.wrapping_add(i as u16)))
                                .collect();
                            Some(disk.write_data(&req, &buf, do_copy))
                        }
                    } else {
                        let mut buf = vec![0u8; max_dma];
                        let res = disk.read_data(&req, &mut buf, do_copy);
                        if let Ok(xfer) = &res {
                            for i in 0..xfer.bytes {
                                self.mem.store_data(addr.wrapping_add(i as u16), buf[i]);
                            }
                        }
                        Some(res)
                    };
                    match outcome {
                        None => {}
                        Some(Ok(xfer)) => {
                            st0 |= xfer.status.st0.bits();
                            st1 |= xfer.status.st1.bits();
                            st2 |= xfer.status.st2.bits();
                            final_r = xfer.final_sector;
                        }
                        Some(Err(err)) => {
                            warn!(drive, %err, "data command failed");
                            st0 |= (St0::ABNORMAL | St0::EQUIPMENT_CHECK).bits();
                        }
                    }
                }
            },
        }

        self.enter_status(
            vec![st0, st1, st2, cyl, h, final_r, n],
            Interrupt::Command,
        );
    }

    fn exec_format(&mut self) {
        let c = self.cmd.clone();
        let mfm = c[0] & 0x40 != 0;
        let drive = usize::from(c[1] & 3);
        let head = (c[1] >> 2) & 1;
        let (n, sc, filler) = (c[2], c[3], c[5]);

        let mut st0 = c[1] & 0x07;
        let mut st1 = 0u8;
        let mut cyl = 0u8;

        let dar = self.mem.data(self.regs.dar);
        let base = if dar & DAR_USER != 0 {
            self.opts.user_base
        } else {
            self.opts.system_base
        };
        let wp = self.wp_override();

        match dma_window(base, dar) {
            None => {
                st0 |= (St0::ABNORMAL | St0::EQUIPMENT_CHECK).bits();
                st1 |= St1::BAD_DMA.bits();
            }
            Some((addr, max_dma)) => match self.drives.get_mut(drive) {
                None => st0 |= (St0::ABNORMAL | St0::NOT_READY).bits(),
                Some(disk) => {
                    cyl = disk.position();
                    let req = FormatRequest {
                        head,
                        mfm,
                        size_code: n,
                        sectors: sc,
                        filler,
                    };
                    let table: Vec<u8> = (0..max_dma)
                        .map(|i| self.mem.data(addr.wrapping_add(i as u16)))
                        .collect();
                    let res = if wp {
                        Err(ImdError::ReadOnly)
                    } else {
                        disk.format_track(&req, &table)
                    };
                    match res {
                        Ok(()) => {}
                        Err(ImdError::ReadOnly) => {
                            st0 |= St0::ABNORMAL.bits();
                            st1 |= St1::NOT_WRITEABLE.bits();
                        }
                        Err(err) => {
                            debug!(drive, %err, "format rejected");
                            st0 |= (St0::ABNORMAL | St0::EQUIPMENT_CHECK).bits();
                        }
                    }
                }
            },
        }

        self.enter_status(vec![st0, st1, 0, cyl, head, 0, n], Interrupt::Command);
    }

    fn enter_status(&mut self, result: Vec<u8>, irq: Interrupt) {
        if result.is_empty() {
            self.finish_idle();
            return;
        }
        self.result = result;
        self.result_pos = 0;
        self.mem.write_cell(self.regs.udr, self.result[0]);
        self.phase = Phase::Status;
        self.set_msr(Msr::RQM | Msr::DIR | Msr::BUSY);
        if irq != Interrupt::None {
            self.pending = irq;
            self.set_irq(true);
        }
    }

    fn finish_idle(&mut self) {
        self.phase = Phase::Idle;
        self.set_msr(Msr::RQM);
    }

    fn raise_attention(&mut self, drive: usize) {
        self.seek_result = (0xC0 | drive as u8, 0);
        self.pending = Interrupt::Attention;
        self.set_irq(true);
    }

    fn wp_override(&self) -> bool {
        self.hsr_control & Hsr::WP_OVERRIDE.bits() != 0
    }

    fn set_msr(&self, msr: Msr) {
        self.mem.write_cell(self.regs.msr, msr.bits());
    }

    fn set_irq(&mut self, pending: bool) {
        self.irq_pending = pending;
        self.sync_hsr();
    }

    /// Rewrite HSR's controller-maintained top bits around the host's low
    /// control bits.
    fn sync_hsr(&self) {
        let mut top = 0u8;
        let asserted = self.irq_pending && self.hsr_control & Hsr::IRQ_ENABLE.bits() != 0;
        if !asserted {
            top |= Hsr::IRQREQ.bits();
        }
        if self.opts.option_switch {
            top |= Hsr::OPTION.bits();
        }
        let low = self.mem.data(self.regs.hsr) & HSR_HOST_MASK;
        self.mem.write_cell(self.regs.hsr, top | low);
    }
}
