//! Block device adapter.
//!
//! Presents an initialised `Flash` as a fixed-geometry block device to an
//! embedded filesystem. An `Instance` owns the configuration, the aligned
//! working buffers and the optional lock and log hooks for one mount; its
//! `BlockDev` turns (block, offset) requests into bounded flash accesses.
//! Several instances may share one engine through `SharedFlash`.

use std::sync::Arc;
use log::Level;

mod buffer;
mod config;
mod error;
mod hooks;

pub use buffer::{AlignedBuffer, Buffers, BUFFER_SIZE};
pub use config::{default_lookahead, Config, Geometry};
pub use error::{Error, FsError, Result};
pub use hooks::{LockHooks, LogSink, SharedFlash};

use hooks::emit;

/// The callback table a filesystem consumer drives.
///
/// Offsets and sizes are in bytes. Every failure is reported in the
/// consumer's own error vocabulary.
pub trait BlockDevice {
    fn geometry(&self) -> &Geometry;

    fn read(&self, block: u32, offset: u32, buf: &mut [u8]) -> core::result::Result<(), FsError>;

    fn prog(&self, block: u32, offset: u32, data: &[u8]) -> core::result::Result<(), FsError>;

    fn erase(&self, block: u32) -> core::result::Result<(), FsError>;

    fn sync(&self) -> core::result::Result<(), FsError>;

    /// Acquire the instance lock on behalf of the consumer; a no-op without lock hooks.
    fn lock(&self) -> core::result::Result<(), FsError>;

    fn unlock(&self) -> core::result::Result<(), FsError>;
}

/// The external filesystem which lays its structures out on a `BlockDevice`.
pub trait Filesystem {
    /// Write a fresh, empty filesystem.
    fn format(&mut self, bd: &dyn BlockDevice, buffers: &mut Buffers)
        -> core::result::Result<(), FsError>;

    fn mount(&mut self, bd: &dyn BlockDevice, buffers: &mut Buffers)
        -> core::result::Result<(), FsError>;

    fn unmount(&mut self, bd: &dyn BlockDevice) -> core::result::Result<(), FsError>;

    /// Number of blocks currently in use.
    fn used_blocks(&mut self, bd: &dyn BlockDevice, buffers: &mut Buffers)
        -> core::result::Result<u32, FsError>;
}

/// Releases the lock hooks when dropped.
struct LockGuard<'a> {
    hooks: Option<&'a dyn LockHooks>,
    sink: Option<&'a dyn LogSink>,
}

impl<'a> Drop for LockGuard<'a> {
    fn drop(&mut self) {
        if let Some(hooks) = self.hooks {
            if let Err(e) = hooks.unlock() {
                emit(self.sink, Level::Warn, format_args!("Unlock hook failed: {}", e));
            }
        }
    }
}

/// Block device view of a shared flash engine.
pub struct BlockDev<'f, S: SharedFlash> {
    flash: &'f S,
    geometry: Geometry,
    debug: bool,
    lock_hooks: Option<Arc<dyn LockHooks>>,
    log_sink: Option<Arc<dyn LogSink>>,
}

impl<'f, S: SharedFlash> BlockDev<'f, S> {
    fn new(flash: &'f S, geometry: Geometry, debug: bool) -> Self {
        BlockDev { flash, geometry, debug, lock_hooks: None, log_sink: None }
    }

    fn log(&self, level: Level, args: core::fmt::Arguments<'_>) {
        emit(self.log_sink.as_deref(), level, args);
    }

    fn lock_guard(&self) -> core::result::Result<LockGuard<'_>, FsError> {
        if let Some(hooks) = &self.lock_hooks {
            if let Err(e) = hooks.lock() {
                self.log(Level::Error, format_args!("Lock hook failed: {}", e));
                return Err(FsError::Io);
            }
        }
        Ok(LockGuard { hooks: self.lock_hooks.as_deref(), sink: self.log_sink.as_deref() })
    }

    /// Translate to a flash address, checking the whole access against the cached bound.
    fn address(&self, block: u32, offset: u32, size: usize) -> core::result::Result<u32, FsError> {
        let address = block as u64 * self.geometry.block_size as u64 + offset as u64;
        if address + size as u64 > self.geometry.max_address {
            self.log(Level::Error, format_args!(
                "Access out of range: block={}, off={}, size={}, limit=0x{:08X}",
                block, offset, size, self.geometry.max_address));
            return Err(FsError::Io);
        }
        Ok(address as u32)
    }

    fn check(&self, what: &str, address: u32, result: crate::Result<()>)
        -> core::result::Result<(), FsError>
    {
        result.map_err(|e| {
            self.log(Level::Error, format_args!("{} at 0x{:08X} failed: {}", what, address, e));
            FsError::from(e)
        })
    }
}

impl<'f, S: SharedFlash> BlockDevice for BlockDev<'f, S> {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn read(&self, block: u32, offset: u32, buf: &mut [u8]) -> core::result::Result<(), FsError> {
        let _guard = self.lock_guard()?;
        let size = buf.len();
        let address = self.address(block, offset, size)?;
        let result = self.flash.with_flash(|flash| flash.read(address, buf));
        self.check("Read", address, result)?;
        if self.debug {
            self.log(Level::Debug, format_args!(
                "read: block={}, off={}, size={}, addr=0x{:08X}", block, offset, size, address));
        }
        Ok(())
    }

    fn prog(&self, block: u32, offset: u32, data: &[u8]) -> core::result::Result<(), FsError> {
        let _guard = self.lock_guard()?;
        let address = self.address(block, offset, data.len())?;
        // Interrupts stay masked for the whole program so a metadata
        // header is never left half written by a preempting context.
        let result = critical_section::with(|_| {
            self.flash.with_flash(|flash| flash.write(address, data))
        });
        self.check("Program", address, result)?;
        if self.debug {
            self.log(Level::Debug, format_args!(
                "prog: block={}, off={}, size={}, addr=0x{:08X}", block, offset, data.len(), address));
        }
        Ok(())
    }

    fn erase(&self, block: u32) -> core::result::Result<(), FsError> {
        let _guard = self.lock_guard()?;
        let block_size = self.geometry.block_size;
        let sector_size = self.geometry.sector_size;
        let address = self.address(block, 0, block_size as usize)?;
        let result = self.flash.with_flash(|flash| {
            (0..block_size / sector_size)
                .try_for_each(|i| flash.erase_sector(address + i * sector_size))
        });
        self.check("Erase", address, result)?;
        if self.debug {
            self.log(Level::Debug, format_args!("erase: block={}, addr=0x{:08X}", block, address));
        }
        Ok(())
    }

    fn sync(&self) -> core::result::Result<(), FsError> {
        let _guard = self.lock_guard()?;
        // Programs complete synchronously, there is nothing to flush.
        if self.flash.with_flash(|flash| flash.is_initialized()) {
            Ok(())
        } else {
            self.log(Level::Error, format_args!("Sync with flash uninitialised"));
            Err(FsError::Io)
        }
    }

    fn lock(&self) -> core::result::Result<(), FsError> {
        match &self.lock_hooks {
            Some(hooks) => hooks.lock().map_err(|e| {
                self.log(Level::Error, format_args!("Lock hook failed: {}", e));
                FsError::Io
            }),
            None => Ok(()),
        }
    }

    fn unlock(&self) -> core::result::Result<(), FsError> {
        match &self.lock_hooks {
            Some(hooks) => hooks.unlock().map_err(|e| {
                self.log(Level::Error, format_args!("Unlock hook failed: {}", e));
                FsError::Io
            }),
            None => Ok(()),
        }
    }
}

/// Instance lifecycle state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InstanceState {
    Uninitialized,
    Initialized,
    Mounted,
}

/// Outcome of `Instance::health_check()`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Health {
    Ok,
    /// The filesystem could not report its usage.
    Corrupt,
    /// Block 0 could not be read back.
    BlockDeviceError,
}

/// Capacity report of a mounted filesystem.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FsInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// One filesystem mount on top of a shared flash engine.
pub struct Instance<'f, S: SharedFlash, F: Filesystem> {
    flash: &'f S,
    fs: F,
    bd: Option<BlockDev<'f, S>>,
    buffers: Buffers,
    mounted: bool,
}

impl<'f, S: SharedFlash, F: Filesystem> Instance<'f, S, F> {
    /// Create an uninitialised instance on `flash`, driving the filesystem `fs`.
    pub fn new(flash: &'f S, fs: F) -> Self {
        Instance { flash, fs, bd: None, buffers: Buffers::default(), mounted: false }
    }

    pub fn state(&self) -> InstanceState {
        match (&self.bd, self.mounted) {
            (None, _) => InstanceState::Uninitialized,
            (Some(_), false) => InstanceState::Initialized,
            (Some(_), true) => InstanceState::Mounted,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.bd.is_some()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn geometry(&self) -> Option<&Geometry> {
        self.bd.as_ref().map(|bd| &bd.geometry)
    }

    /// The block device the filesystem is driven through, once initialised.
    pub fn block_device(&self) -> Option<&BlockDev<'f, S>> {
        self.bd.as_ref()
    }

    pub fn filesystem(&self) -> &F {
        &self.fs
    }

    pub fn filesystem_mut(&mut self) -> &mut F {
        &mut self.fs
    }

    fn log(&self, level: Level, args: core::fmt::Arguments<'_>) {
        let sink = self.bd.as_ref().and_then(|bd| bd.log_sink.as_deref());
        emit(sink, level, args);
    }

    fn require_bd(&self) -> Result<&BlockDev<'f, S>> {
        self.bd.as_ref().ok_or(Error::NotInitialized)
    }

    fn require_flash(&self) -> Result<()> {
        if self.flash.with_flash(|flash| flash.is_initialized()) {
            Ok(())
        } else {
            Err(Error::Flash(crate::Error::NotInitialized))
        }
    }

    /// Configure the instance.
    ///
    /// The flash engine must already be initialised. With no `config`,
    /// the defaults from `Config::for_flash()` are used.
    pub fn init(&mut self, config: Option<Config>) -> Result<Geometry> {
        if self.bd.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let info = self.flash.with_flash(|flash| flash.info().copied())
                             .ok_or(Error::Flash(crate::Error::NotInitialized))?;
        let config = config.unwrap_or_else(|| Config::for_flash(&info));
        let geometry = config.resolve(&info)?;

        log::debug!("Block device: {} blocks of {} bytes, lookahead {} bytes",
                    geometry.block_count, geometry.block_size, geometry.lookahead_size);
        self.bd = Some(BlockDev::new(self.flash, geometry, config.debug));
        self.mounted = false;
        Ok(geometry)
    }

    /// Unmount if needed and forget the configuration and hooks.
    pub fn deinit(&mut self) {
        if self.mounted {
            if let Err(e) = self.unmount() {
                self.log(Level::Warn, format_args!("Unmount during deinit failed: {}", e));
            }
        }
        self.bd = None;
        self.mounted = false;
    }

    /// Mount the filesystem. Mounting a mounted instance succeeds without effect.
    pub fn mount(&mut self) -> Result<()> {
        self.require_bd()?;
        if self.mounted {
            return Ok(());
        }
        self.require_flash()?;

        let bd = self.bd.as_ref().ok_or(Error::NotInitialized)?;
        if let Err(e) = self.fs.mount(bd, &mut self.buffers) {
            self.log(Level::Error, format_args!("Mount failed: {}", e));
            return Err(Error::Fs(e));
        }
        self.mounted = true;
        self.log(Level::Info, format_args!("Filesystem mounted"));
        Ok(())
    }

    /// Unmount the filesystem. Unmounting an unmounted instance succeeds without effect.
    pub fn unmount(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        let bd = self.bd.as_ref().ok_or(Error::NotInitialized)?;
        self.fs.unmount(bd)?;
        self.mounted = false;
        self.log(Level::Info, format_args!("Filesystem unmounted"));
        Ok(())
    }

    /// Write a fresh filesystem, unmounting first.
    ///
    /// The instance is left Initialized, not Mounted.
    pub fn format(&mut self) -> Result<()> {
        self.require_bd()?;
        self.unmount()?;
        self.require_flash()?;

        let bd = self.bd.as_ref().ok_or(Error::NotInitialized)?;
        log::debug!("Formatting {} blocks", bd.geometry.block_count);
        if let Err(e) = self.fs.format(bd, &mut self.buffers) {
            self.log(Level::Error, format_args!("Format failed: {}", e));
            return Err(Error::Fs(e));
        }
        Ok(())
    }

    /// Total and free space of the mounted filesystem.
    ///
    /// When the filesystem cannot report its usage everything is reported free.
    pub fn info(&mut self) -> Result<FsInfo> {
        if !self.mounted {
            return Err(Error::NotMounted);
        }
        let bd = self.bd.as_ref().ok_or(Error::NotInitialized)?;
        let total_bytes = bd.geometry.total_bytes();
        let free_bytes = match self.fs.used_blocks(bd, &mut self.buffers) {
            Ok(used) => total_bytes.saturating_sub(used as u64 * bd.geometry.block_size as u64),
            Err(_) => total_bytes,
        };
        Ok(FsInfo { total_bytes, free_bytes })
    }

    /// Check the filesystem reports its usage and block 0 reads back.
    pub fn health_check(&mut self) -> Result<Health> {
        if !self.mounted {
            return Err(Error::NotMounted);
        }
        let bd = self.bd.as_ref().ok_or(Error::NotInitialized)?;
        if let Err(e) = self.fs.used_blocks(bd, &mut self.buffers) {
            self.log(Level::Warn, format_args!("Health check: usage query failed: {}", e));
            return Ok(Health::Corrupt);
        }
        if let Err(e) = bd.read(0, 0, &mut self.buffers.read) {
            self.log(Level::Warn, format_args!("Health check: block 0 unreadable: {}", e));
            return Ok(Health::BlockDeviceError);
        }
        Ok(Health::Ok)
    }

    /// Install or remove the log sink.
    pub fn set_log_sink(&mut self, sink: Option<Arc<dyn LogSink>>) -> Result<()> {
        let bd = self.bd.as_mut().ok_or(Error::NotInitialized)?;
        bd.log_sink = sink;
        Ok(())
    }

    /// Install or remove the lock hooks. Not allowed while mounted.
    pub fn set_lock_hooks(&mut self, hooks: Option<Arc<dyn LockHooks>>) -> Result<()> {
        if self.mounted {
            return Err(Error::Mounted);
        }
        let bd = self.bd.as_mut().ok_or(Error::NotInitialized)?;
        bd.lock_hooks = hooks;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Op, SimConfig, SimFlash};
    use crate::{model, AnyhowResult, Flash, FlashConfig, FlashModel};
    use std::cell::RefCell;
    use std::sync::{mpsc, Condvar, Mutex};
    use std::time::Duration;

    const MAGIC: &[u8; 8] = b"spinorbd";

    /// Minimal consumer: a superblock in block 0 and a fixed usage figure.
    #[derive(Default)]
    struct TestFs {
        mounts: usize,
        formats: usize,
        usage: Option<u32>,
    }

    impl Filesystem for TestFs {
        fn format(&mut self, bd: &dyn BlockDevice, buffers: &mut Buffers)
            -> core::result::Result<(), FsError>
        {
            let prog_size = bd.geometry().prog_size as usize;
            bd.erase(0)?;
            buffers.prog.iter_mut().for_each(|b| *b = 0xFF);
            buffers.prog[..8].copy_from_slice(MAGIC);
            bd.prog(0, 0, &buffers.prog[..prog_size])?;
            bd.sync()?;
            self.formats += 1;
            Ok(())
        }

        fn mount(&mut self, bd: &dyn BlockDevice, buffers: &mut Buffers)
            -> core::result::Result<(), FsError>
        {
            let read_size = bd.geometry().read_size as usize;
            bd.read(0, 0, &mut buffers.read[..read_size])?;
            if &buffers.read[..8] != MAGIC {
                return Err(FsError::Corrupt);
            }
            self.mounts += 1;
            self.usage = Some(1);
            Ok(())
        }

        fn unmount(&mut self, bd: &dyn BlockDevice) -> core::result::Result<(), FsError> {
            bd.sync()
        }

        fn used_blocks(&mut self, _bd: &dyn BlockDevice, _buffers: &mut Buffers)
            -> core::result::Result<u32, FsError>
        {
            self.usage.ok_or(FsError::Corrupt)
        }
    }

    /// Lock hooks which record every call.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
        fail_lock: bool,
    }

    impl LockHooks for Recorder {
        fn lock(&self) -> AnyhowResult<()> {
            if self.fail_lock {
                anyhow::bail!("lock refused");
            }
            self.events.lock().unwrap().push("lock");
            Ok(())
        }

        fn unlock(&self) -> AnyhowResult<()> {
            self.events.lock().unwrap().push("unlock");
            Ok(())
        }
    }

    /// A blocking lock recording the order of acquisitions and releases.
    #[derive(Default)]
    struct BlockingLock {
        held: Mutex<bool>,
        released: Condvar,
        events: Mutex<Vec<&'static str>>,
    }

    impl LockHooks for BlockingLock {
        fn lock(&self) -> AnyhowResult<()> {
            let mut held = self.held.lock().unwrap();
            while *held {
                held = self.released.wait(held).unwrap();
            }
            *held = true;
            self.events.lock().unwrap().push("lock");
            Ok(())
        }

        fn unlock(&self) -> AnyhowResult<()> {
            self.events.lock().unwrap().push("unlock");
            *self.held.lock().unwrap() = false;
            self.released.notify_one();
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collector(Mutex<Vec<String>>);

    impl LogSink for Collector {
        fn log(&self, level: Level, args: core::fmt::Arguments<'_>) {
            self.0.lock().unwrap().push(format!("{}: {}", level, args));
        }
    }

    fn flash(model: &FlashModel) -> Flash<SimFlash> {
        let mut flash = Flash::new(SimFlash::new(SimConfig::for_model(model)), FlashConfig::default());
        flash.init().unwrap();
        flash.access_mut().clear_log();
        flash
    }

    fn take_log(flash: &RefCell<Flash<SimFlash>>) -> Vec<Op> {
        let mut flash = flash.borrow_mut();
        let log = flash.access().log().to_vec();
        flash.access_mut().clear_log();
        log
    }

    #[test]
    fn instance_lifecycle() {
        let flash = RefCell::new(flash(&model::W25Q16));
        let mut fs = Instance::new(&flash, TestFs::default());
        assert_eq!(fs.state(), InstanceState::Uninitialized);
        assert!(matches!(fs.mount(), Err(Error::NotInitialized)));

        let geometry = fs.init(None).unwrap();
        assert_eq!(geometry.block_count, 512);
        assert_eq!(fs.state(), InstanceState::Initialized);
        assert!(matches!(fs.init(None), Err(Error::AlreadyInitialized)));
        assert!(matches!(fs.info(), Err(Error::NotMounted)));

        // Blank chip has no superblock.
        assert!(matches!(fs.mount(), Err(Error::Fs(FsError::Corrupt))));
        assert_eq!(fs.state(), InstanceState::Initialized);

        fs.format().unwrap();
        fs.mount().unwrap();
        assert_eq!(fs.state(), InstanceState::Mounted);
        fs.mount().unwrap();
        assert_eq!(fs.filesystem().mounts, 1);

        let info = fs.info().unwrap();
        assert_eq!(info.total_bytes, 2 * 1024 * 1024);
        assert_eq!(info.free_bytes, 2 * 1024 * 1024 - 4096);

        fs.unmount().unwrap();
        assert_eq!(fs.state(), InstanceState::Initialized);
        fs.unmount().unwrap();

        fs.mount().unwrap();
        fs.deinit();
        assert_eq!(fs.state(), InstanceState::Uninitialized);
        assert!(fs.block_device().is_none());
    }

    #[test]
    fn init_requires_initialised_flash() {
        let flash = RefCell::new(Flash::new(
            SimFlash::new(SimConfig::for_model(&model::W25Q16)), FlashConfig::default()));
        let mut fs = Instance::new(&flash, TestFs::default());
        assert!(matches!(fs.init(None), Err(Error::Flash(crate::Error::NotInitialized))));
        assert!(flash.borrow().access().log().is_empty());
    }

    #[test]
    fn init_rejects_bad_config() {
        let flash = RefCell::new(flash(&model::W25Q16));
        let mut fs = Instance::new(&flash, TestFs::default());
        let config = Config { block_size: 1024, ..Config::for_flash(flash.borrow().info().unwrap()) };
        assert!(matches!(fs.init(Some(config)), Err(Error::InvalidConfig(_))));
        assert!(!fs.is_initialized());
    }

    #[test]
    fn format_unmounts_first() {
        let flash = RefCell::new(flash(&model::W25Q16));
        let mut fs = Instance::new(&flash, TestFs::default());
        fs.init(None).unwrap();
        fs.format().unwrap();
        fs.mount().unwrap();
        fs.format().unwrap();
        assert_eq!(fs.state(), InstanceState::Initialized);
        assert_eq!(fs.filesystem().formats, 2);
    }

    #[test]
    fn mount_requires_initialised_flash() {
        let flash = RefCell::new(flash(&model::W25Q16));
        let mut fs = Instance::new(&flash, TestFs::default());
        fs.init(None).unwrap();
        flash.borrow_mut().deinit();
        assert!(matches!(fs.mount(), Err(Error::Flash(crate::Error::NotInitialized))));
        assert!(matches!(fs.format(), Err(Error::Flash(crate::Error::NotInitialized))));
    }

    #[test]
    fn info_falls_back_to_total() {
        let flash = RefCell::new(flash(&model::W25Q16));
        let mut fs = Instance::new(&flash, TestFs::default());
        fs.init(None).unwrap();
        fs.format().unwrap();
        fs.mount().unwrap();
        fs.filesystem_mut().usage = None;
        let info = fs.info().unwrap();
        assert_eq!(info.free_bytes, info.total_bytes);
    }

    #[test]
    fn health_check_outcomes() {
        let flash = RefCell::new(flash(&model::W25Q16));
        let mut fs = Instance::new(&flash, TestFs::default());
        fs.init(None).unwrap();
        assert!(matches!(fs.health_check(), Err(Error::NotMounted)));

        fs.format().unwrap();
        fs.mount().unwrap();
        assert_eq!(fs.health_check().unwrap(), Health::Ok);

        flash.borrow_mut().access_mut().faults_mut().fail_receive = true;
        assert_eq!(fs.health_check().unwrap(), Health::BlockDeviceError);
        flash.borrow_mut().access_mut().faults_mut().fail_receive = false;

        fs.filesystem_mut().usage = None;
        assert_eq!(fs.health_check().unwrap(), Health::Corrupt);
    }

    #[test]
    fn block_addresses_are_translated() {
        for &block_size in [4096u32, 8192].iter() {
            let flash = RefCell::new(flash(&model::W25Q16));
            let mut fs = Instance::new(&flash, TestFs::default());
            let config = Config { block_size, block_count: 0,
                                  ..Config::for_flash(flash.borrow().info().unwrap()) };
            let geometry = fs.init(Some(config)).unwrap();
            let bd = fs.block_device().unwrap();

            for &k in [0, 1, geometry.block_count - 1].iter() {
                let base = k * block_size;

                bd.read(k, 0, &mut [0u8; 16]).unwrap();
                assert_eq!(take_log(&flash), vec![Op::Read { address: base, len: 16 }]);

                bd.read(k, 100, &mut [0u8; 4]).unwrap();
                assert_eq!(take_log(&flash), vec![Op::Read { address: base + 100, len: 4 }]);

                bd.erase(k).unwrap();
                let erased: Vec<u32> = take_log(&flash).into_iter().filter_map(|op| match op {
                    Op::SectorErase { address } => Some(address),
                    _ => None,
                }).collect();
                let expected: Vec<u32> = (0..block_size / 4096).map(|i| base + i * 4096).collect();
                assert_eq!(erased, expected);
            }
        }
    }

    #[test]
    fn prog_and_read_back() {
        let flash = RefCell::new(flash(&model::W25Q16));
        let mut fs = Instance::new(&flash, TestFs::default());
        fs.init(None).unwrap();
        let bd = fs.block_device().unwrap();

        let data: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
        bd.erase(3).unwrap();
        bd.prog(3, 256, &data).unwrap();
        bd.sync().unwrap();

        let mut out = vec![0u8; 512];
        bd.read(3, 256, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(flash.borrow().access().memory()[3 * 4096 + 256..3 * 4096 + 768], data[..]);
    }

    /// Engine wrapper noting, for every access, whether another thread is
    /// currently shut out of the critical section.
    struct MaskWatcher {
        flash: RefCell<Flash<SimFlash>>,
        masked: RefCell<Vec<bool>>,
    }

    impl SharedFlash for MaskWatcher {
        type Access = SimFlash;

        fn with_flash<R, F>(&self, f: F) -> R
            where F: FnOnce(&mut Flash<SimFlash>) -> R
        {
            self.masked.borrow_mut().push(section_held_elsewhere());
            self.flash.with_flash(f)
        }
    }

    fn section_held_elsewhere() -> bool {
        let (tx, rx) = mpsc::channel();
        // The thread finishes on its own once the section is released.
        std::thread::spawn(move || critical_section::with(|_| tx.send(()).ok()));
        rx.recv_timeout(Duration::from_millis(200)).is_err()
    }

    #[test]
    fn prog_runs_in_critical_section() {
        let watcher = MaskWatcher {
            flash: RefCell::new(flash(&model::W25Q16)),
            masked: RefCell::new(Vec::new()),
        };
        let mut fs = Instance::new(&watcher, TestFs::default());
        fs.init(None).unwrap();
        let bd = fs.block_device().unwrap();
        bd.erase(1).unwrap();
        watcher.masked.borrow_mut().clear();

        bd.prog(1, 0, &[0x5A; 300]).unwrap();
        assert_eq!(*watcher.masked.borrow(), vec![true]);

        let mut out = [0u8; 300];
        bd.read(1, 0, &mut out).unwrap();
        assert_eq!(*watcher.masked.borrow(), vec![true, false]);
        assert!(out.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn out_of_range_access_never_reaches_flash() {
        let flash = RefCell::new(flash(&model::W25Q16));
        let mut fs = Instance::new(&flash, TestFs::default());
        let geometry = fs.init(None).unwrap();
        let last = geometry.block_count - 1;
        let bd = fs.block_device().unwrap();

        assert_eq!(bd.read(geometry.block_count, 0, &mut [0u8; 1]), Err(FsError::Io));
        assert_eq!(bd.read(last, 4092, &mut [0u8; 8]), Err(FsError::Io));
        assert_eq!(bd.prog(u32::MAX, u32::MAX, &[0u8; 1]), Err(FsError::Io));
        assert_eq!(bd.erase(geometry.block_count), Err(FsError::Io));
        assert!(take_log(&flash).is_empty());

        bd.read(last, 4088, &mut [0u8; 8]).unwrap();
    }

    #[test]
    fn flash_errors_become_io() {
        let flash = RefCell::new(flash(&model::W25Q16));
        let mut fs = Instance::new(&flash, TestFs::default());
        fs.init(None).unwrap();
        flash.borrow_mut().access_mut().faults_mut().stuck_busy = true;
        flash.borrow_mut().set_timeouts(crate::Timeouts {
            default: Duration::from_millis(1),
            sector_erase_base: Duration::from_millis(1),
            ..Default::default()
        });
        let bd = fs.block_device().unwrap();
        assert_eq!(bd.erase(0), Err(FsError::Io));
        assert_eq!(bd.prog(0, 0, &[0u8; 4]), Err(FsError::Io));

        flash.borrow_mut().deinit();
        assert_eq!(bd.read(0, 0, &mut [0u8; 4]), Err(FsError::Io));
        assert_eq!(bd.sync(), Err(FsError::Io));
    }

    #[test]
    fn lock_hooks_wrap_every_operation() {
        let flash = RefCell::new(flash(&model::W25Q16));
        let mut fs = Instance::new(&flash, TestFs::default());
        assert!(matches!(fs.set_lock_hooks(None), Err(Error::NotInitialized)));
        fs.init(None).unwrap();

        let hooks = Arc::new(Recorder::default());
        fs.set_lock_hooks(Some(hooks.clone())).unwrap();
        let bd = fs.block_device().unwrap();

        bd.read(0, 0, &mut [0u8; 4]).unwrap();
        bd.prog(0, 0, &[0u8; 4]).unwrap();
        bd.erase(0).unwrap();
        bd.sync().unwrap();
        // Failing calls release the lock too.
        assert!(bd.read(10_000, 0, &mut [0u8; 4]).is_err());

        let events = hooks.events.lock().unwrap().clone();
        assert_eq!(events.len(), 10);
        assert!(events.chunks(2).all(|pair| pair == ["lock", "unlock"]));

        bd.lock().unwrap();
        bd.unlock().unwrap();
        assert_eq!(hooks.events.lock().unwrap().len(), 12);
    }

    #[test]
    fn lock_failure_is_io() {
        let flash = RefCell::new(flash(&model::W25Q16));
        let mut fs = Instance::new(&flash, TestFs::default());
        fs.init(None).unwrap();
        let hooks = Arc::new(Recorder { fail_lock: true, ..Default::default() });
        fs.set_lock_hooks(Some(hooks.clone())).unwrap();
        let bd = fs.block_device().unwrap();

        assert_eq!(bd.read(0, 0, &mut [0u8; 4]), Err(FsError::Io));
        assert_eq!(bd.lock(), Err(FsError::Io));
        assert!(take_log(&flash).is_empty());
        assert!(hooks.events.lock().unwrap().is_empty());
    }

    #[test]
    fn lock_hooks_rejected_while_mounted() {
        let flash = RefCell::new(flash(&model::W25Q16));
        let mut fs = Instance::new(&flash, TestFs::default());
        fs.init(None).unwrap();
        fs.format().unwrap();
        fs.mount().unwrap();
        let hooks: Arc<dyn LockHooks> = Arc::new(Recorder::default());
        assert!(matches!(fs.set_lock_hooks(Some(hooks.clone())), Err(Error::Mounted)));
        fs.unmount().unwrap();
        fs.set_lock_hooks(Some(hooks)).unwrap();
    }

    #[test]
    fn debug_records_reach_log_sink() {
        let flash = RefCell::new(flash(&model::W25Q16));
        let mut fs = Instance::new(&flash, TestFs::default());
        let config = Config { debug: true, ..Config::for_flash(flash.borrow().info().unwrap()) };
        fs.init(Some(config)).unwrap();
        let sink = Arc::new(Collector::default());
        fs.set_log_sink(Some(sink.clone())).unwrap();

        fs.block_device().unwrap().read(1, 16, &mut [0u8; 8]).unwrap();
        let messages = sink.0.lock().unwrap().clone();
        assert_eq!(messages, vec![
            "DEBUG: read: block=1, off=16, size=8, addr=0x00001010".to_string(),
        ]);

        let _ = fs.block_device().unwrap().read(512, 0, &mut [0u8; 8]);
        assert!(sink.0.lock().unwrap().last().unwrap().starts_with("ERROR: Access out of range"));
    }

    #[test]
    fn quiet_without_debug_flag() {
        let flash = RefCell::new(flash(&model::W25Q16));
        let mut fs = Instance::new(&flash, TestFs::default());
        fs.init(None).unwrap();
        let sink = Arc::new(Collector::default());
        fs.set_log_sink(Some(sink.clone())).unwrap();
        fs.block_device().unwrap().read(0, 0, &mut [0u8; 8]).unwrap();
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn instances_share_one_engine() {
        let flash = RefCell::new(flash(&model::W25Q16));
        let info = *flash.borrow().info().unwrap();
        let lower = Config { block_count: 256, ..Config::for_flash(&info) };

        let mut a = Instance::new(&flash, TestFs::default());
        let mut b = Instance::new(&flash, TestFs::default());
        a.init(Some(lower)).unwrap();
        b.init(None).unwrap();

        a.block_device().unwrap().prog(2, 0, &[0x12, 0x34]).unwrap();
        let mut out = [0u8; 2];
        b.block_device().unwrap().read(2, 0, &mut out).unwrap();
        assert_eq!(out, [0x12, 0x34]);

        // Block 300 is beyond a's configured region but inside b's.
        assert_eq!(a.block_device().unwrap().read(300, 0, &mut out), Err(FsError::Io));
        b.block_device().unwrap().read(300, 0, &mut out).unwrap();
    }

    #[test]
    fn concurrent_operations_are_serialised() {
        let mut config = SimConfig::for_model(&model::W25Q16);
        config.program_delay = Duration::from_millis(2);
        let mut engine = Flash::new(SimFlash::new(config), FlashConfig::default());
        engine.init().unwrap();
        engine.access_mut().clear_log();
        let flash = Mutex::new(engine);

        let mut fs = Instance::new(&flash, TestFs::default());
        fs.init(None).unwrap();
        let hooks = Arc::new(BlockingLock::default());
        fs.set_lock_hooks(Some(hooks.clone())).unwrap();
        let bd = fs.block_device().unwrap();

        std::thread::scope(|s| {
            s.spawn(|| bd.prog(0, 0, &[0x55; 1024]).unwrap());
            s.spawn(|| bd.erase(1).unwrap());
        });

        let events = hooks.events.lock().unwrap().clone();
        assert_eq!(events, vec!["lock", "unlock", "lock", "unlock"]);

        drop(fs);
        let flash = flash.into_inner().unwrap();
        let ops: Vec<&Op> = flash.access().log().iter()
            .filter(|op| matches!(op, Op::PageProgram { .. } | Op::SectorErase { .. }))
            .collect();
        assert_eq!(ops.len(), 5);
        let erase_at = ops.iter().position(|op| matches!(op, Op::SectorErase { .. })).unwrap();
        assert!(erase_at == 0 || erase_at == 4);

        assert!(flash.access().memory()[..1024].iter().all(|&b| b == 0x55));
        assert!(flash.access().memory()[4096..8192].iter().all(|&b| b == 0xFF));
    }
}
