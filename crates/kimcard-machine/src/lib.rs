//! Wires the card together: the cell map, the bus responder, the floppy
//! controller on its own thread, the image library and the persisted
//! configuration.
//!
//! The controller thread is the sole consumer of the alias-event queue; it
//! takes the controller mutex for the duration of each event, so control
//! plane calls observing controller state always see a consistent view. The
//! control plane acquires the same mutex with a timeout and surfaces a
//! timeout to its caller instead of blocking forever behind a stalled
//! medium.

mod config;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use kimcard_bus::{BusResponder, EventQueue};
use kimcard_fdc::{Fdc, FdcOptions, RegisterAddrs};
use kimcard_storage::{FileBackend, ImageLibrary, LibraryError};
use memory::{MemoryMap, RangeOp, CELL_COUNT};

pub use config::{
    ConfigError, ControllerConfig, DriveConfig, MachineConfig, RegisterConfig, VideoConfig,
    VideoSystem, WifiConfig,
};
pub use kimcard_fdc::{MountError, MAX_DRIVES};

/// File names inside the data directory.
const CONFIG_FILE: &str = "config.json";
const DEFAULT_MAP_FILE: &str = "default_map.bin";

#[derive(Debug, Error)]
pub enum MachineError {
    /// The controller mutex could not be taken inside the timeout.
    #[error("controller busy")]
    Busy,

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The image is mounted and the operation needs it unmounted.
    #[error("image mounted")]
    Mounted,

    #[error("{0}")]
    Invalid(&'static str),
}

/// Where a machine keeps its state on disk.
#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// Holds `config.json` and the optional `default_map.bin`.
    pub data_dir: PathBuf,
    /// The image directory exposed over `/sd`.
    pub image_dir: PathBuf,
    /// Budget for taking the controller mutex from the control plane.
    pub mutex_timeout: Duration,
}

impl MachineOptions {
    pub fn new<P: Into<PathBuf>>(data_dir: P, image_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            image_dir: image_dir.into(),
            mutex_timeout: Duration::from_secs(2),
        }
    }
}

pub struct Machine {
    mem: Arc<MemoryMap>,
    defaults: Arc<MemoryMap>,
    bus: BusResponder,
    queue: Arc<EventQueue>,
    controller: Arc<Mutex<Fdc<FileBackend>>>,
    library: ImageLibrary,
    config: Mutex<MachineConfig>,
    options: MachineOptions,
    consumer: Option<thread::JoinHandle<()>>,
}

impl Machine {
    /// Bring the card up: load (or default) the configuration and default
    /// map, build the controller, re-mount configured drives best-effort,
    /// and start the controller thread.
    pub fn open(options: MachineOptions) -> Result<Self, MachineError> {
        let config_path = options.data_dir.join(CONFIG_FILE);
        let config = if config_path.is_file() {
            MachineConfig::load(&config_path)?
        } else {
            MachineConfig::default()
        };

        let defaults = Arc::new(MemoryMap::factory_default());
        let map_path = options.data_dir.join(DEFAULT_MAP_FILE);
        if map_path.is_file() {
            let image = std::fs::read(&map_path).map_err(ConfigError::Io)?;
            if !defaults.load_image(&image) {
                warn!(path = %map_path.display(), "default map has wrong size, using factory map");
            }
        }

        let mem = Arc::new(MemoryMap::new());
        mem.copy_default_map(&defaults);

        let regs = RegisterAddrs {
            hsr: config.controller.registers.hsr,
            dar: config.controller.registers.dar,
            msr: config.controller.registers.msr,
            udr: config.controller.registers.udr,
        };
        let fdc = Fdc::new(
            mem.clone(),
            regs,
            FdcOptions {
                system_base: config.controller.system_base,
                user_base: config.controller.user_base,
                option_switch: config.controller.option_switch,
            },
        );

        let taps = if config.controller.enabled {
            fdc.taps()
        } else {
            Vec::new()
        };
        let queue = EventQueue::new();
        let bus = BusResponder::new(mem.clone(), taps, queue.clone());

        let controller = Arc::new(Mutex::new(fdc));
        let consumer = {
            let queue = queue.clone();
            let controller = controller.clone();
            thread::Builder::new()
                .name("fdc".to_string())
                .spawn(move || {
                    while let Some(event) = queue.pop() {
                        let mut fdc = controller.lock().expect("controller mutex poisoned");
                        fdc.handle_event(event);
                    }
                })
                .expect("spawn controller thread")
        };

        let library = ImageLibrary::new(options.image_dir.clone());
        let machine = Self {
            mem,
            defaults,
            bus,
            queue,
            controller,
            library,
            config: Mutex::new(config.clone()),
            options,
            consumer: Some(consumer),
        };

        for (drive, entry) in config.drives.iter().enumerate() {
            if let Some(entry) = entry {
                match machine.mount(drive, &entry.image, entry.read_only) {
                    Ok(()) => {}
                    Err(err) => warn!(drive, image = %entry.image, %err, "boot mount failed"),
                }
            }
        }
        info!("machine up");
        Ok(machine)
    }

    pub fn mem(&self) -> &Arc<MemoryMap> {
        &self.mem
    }

    pub fn library(&self) -> &ImageLibrary {
        &self.library
    }

    /// One host read cycle on the bus.
    pub fn host_read(&self, addr: u16) -> Option<u8> {
        self.bus.read(addr)
    }

    /// One host write cycle on the bus.
    pub fn host_write(&self, addr: u16, value: u8) -> bool {
        self.bus.write(addr, value)
    }

    /// Run `f` under the controller mutex, giving up after the configured
    /// timeout.
    pub fn with_controller<T>(
        &self,
        f: impl FnOnce(&mut Fdc<FileBackend>) -> T,
    ) -> Result<T, MachineError> {
        let deadline = Instant::now() + self.options.mutex_timeout;
        loop {
            match self.controller.try_lock() {
                Ok(mut fdc) => return Ok(f(&mut fdc)),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(MachineError::Busy);
                    }
                    thread::sleep(Duration::from_millis(2));
                }
                Err(TryLockError::Poisoned(_)) => return Err(MachineError::Busy),
            }
        }
    }

    fn check_range(start: u16, count: usize) -> Result<(), MachineError> {
        if usize::from(start) + count > CELL_COUNT {
            return Err(MachineError::Invalid("range exceeds address space"));
        }
        Ok(())
    }

    /// Low data byte of each cell in `[start, start + count)`.
    pub fn read_data_range(&self, start: u16, count: usize) -> Result<Vec<u8>, MachineError> {
        Self::check_range(start, count)?;
        Ok((0..count)
            .map(|i| self.mem.data(start + i as u16))
            .collect())
    }

    /// Overwrite whole cells (attributes included) from little-endian word
    /// pairs.
    pub fn write_raw_range(&self, start: u16, bytes: &[u8]) -> Result<(), MachineError> {
        if bytes.len() % 2 != 0 {
            return Err(MachineError::Invalid("raw cell body must be even-sized"));
        }
        let count = bytes.len() / 2;
        Self::check_range(start, count)?;
        self.with_controller(|fdc| {
            for (i, pair) in bytes.chunks_exact(2).enumerate() {
                let word = u16::from_le_bytes([pair[0], pair[1]]);
                self.mem.store_raw(start + i as u16, word);
            }
            fdc.refresh_register_cells();
        })
    }

    /// Overwrite only the data byte of each cell.
    pub fn write_data_range(&self, start: u16, bytes: &[u8]) -> Result<(), MachineError> {
        Self::check_range(start, bytes.len())?;
        self.with_controller(|_| {
            for (i, &b) in bytes.iter().enumerate() {
                self.mem.write_cell(start + i as u16, b);
            }
        })
    }

    /// Apply an attribute/fill operation over a range.
    pub fn apply_range_op(&self, start: u16, count: usize, op: RangeOp) -> Result<(), MachineError> {
        Self::check_range(start, count)?;
        self.with_controller(|_| self.mem.range_op(start, count, op))
    }

    /// Reload the persisted default map over the live one.
    pub fn restore_default_map(&self) -> Result<(), MachineError> {
        self.with_controller(|fdc| {
            self.mem.copy_default_map(&self.defaults);
            fdc.refresh_register_cells();
        })
    }

    pub fn video_address(&self) -> u16 {
        self.config.lock().expect("config mutex poisoned").video.address
    }

    /// Set the framebuffer base: 2 KiB aligned, inside `0x2000..=0xD800`.
    pub fn set_video_address(&self, address: u16) -> Result<(), MachineError> {
        if address % 0x0800 != 0 || !(0x2000..=0xD800).contains(&address) {
            return Err(MachineError::Invalid("video base out of range"));
        }
        self.config.lock().expect("config mutex poisoned").video.address = address;
        Ok(())
    }

    pub fn list_images(&self) -> Result<Vec<String>, MachineError> {
        Ok(self.library.list()?)
    }

    fn ensure_unmounted(&self, name: &str) -> Result<(), MachineError> {
        let mounted = self.with_controller(|fdc| fdc.drives().is_image_mounted(name))?;
        if mounted {
            return Err(MachineError::Mounted);
        }
        Ok(())
    }

    pub fn download_image(&self, name: &str) -> Result<Vec<u8>, MachineError> {
        self.ensure_unmounted(name)?;
        Ok(self.library.read_file(name)?)
    }

    pub fn upload_image(
        &self,
        name: &str,
        bytes: &[u8],
        overwrite: bool,
    ) -> Result<(), MachineError> {
        self.ensure_unmounted(name)?;
        Ok(self.library.write_file(name, bytes, overwrite)?)
    }

    pub fn copy_image(&self, src: &str, dst: &str, overwrite: bool) -> Result<(), MachineError> {
        self.ensure_unmounted(src)?;
        self.ensure_unmounted(dst)?;
        Ok(self.library.copy(src, dst, overwrite)?)
    }

    pub fn rename_image(&self, src: &str, dst: &str) -> Result<(), MachineError> {
        self.ensure_unmounted(src)?;
        self.ensure_unmounted(dst)?;
        Ok(self.library.rename(src, dst)?)
    }

    pub fn erase_image(&self, name: &str) -> Result<(), MachineError> {
        self.ensure_unmounted(name)?;
        Ok(self.library.erase(name)?)
    }

    pub fn mount(&self, drive: usize, name: &str, read_only: bool) -> Result<(), MachineError> {
        self.with_controller(|fdc| {
            if drive >= MAX_DRIVES {
                return Err(MountError::BadDrive.into());
            }
            if fdc.drives().get(drive).is_some() {
                return Err(MountError::DriveMounted.into());
            }
            if fdc.drives().is_image_mounted(name) {
                return Err(MountError::ImageMounted.into());
            }
            let disk = self.library.open(name, read_only).map_err(MountError::from)?;
            fdc.mount(drive, disk)?;
            Ok(())
        })?
    }

    pub fn unmount(&self, drive: usize) -> Result<(), MachineError> {
        self.with_controller(|fdc| fdc.unmount(drive).map(drop))?
            .map_err(MachineError::from)
    }

    /// `(drive, image, read-only)` for every mounted drive.
    pub fn mounts(&self) -> Result<Vec<(usize, String, bool)>, MachineError> {
        self.with_controller(|fdc| fdc.drives().mounted())
    }

    /// Persist the current mounts into the configuration file.
    pub fn save_mounts(&self) -> Result<(), MachineError> {
        let mounted = self.mounts()?;
        let mut config = self.config.lock().expect("config mutex poisoned");
        config.drives = std::array::from_fn(|_| None);
        for (drive, image, read_only) in mounted {
            config.drives[drive] = Some(DriveConfig { image, read_only });
        }
        config.save(&self.options.data_dir.join(CONFIG_FILE))?;
        Ok(())
    }

    pub fn save_config(&self) -> Result<(), MachineError> {
        let config = self.config.lock().expect("config mutex poisoned");
        config.save(&self.options.data_dir.join(CONFIG_FILE))?;
        Ok(())
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.join();
        }
    }
}
