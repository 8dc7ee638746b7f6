// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! spi-nor-bd
//!
//! This crate drives serial NOR flash memories over SPI, covering
//! identification, address mode selection, page programming, erase and
//! busy polling, and presents the chip as a fixed-geometry block device
//! to an embedded filesystem through the `blockdev` module.

use std::time::Duration;
#[cfg(feature = "progress")]
use indicatif::ProgressBar;

pub mod blockdev;
pub mod id;
pub mod model;
pub mod sreg;
pub mod timing;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use id::FlashID;
pub use model::{AddressWidth, FlashModel, ModelSelection};
pub use sreg::{StatusRegister1, StatusRegister2, StatusRegister3};
pub use timing::{Deadline, Timeouts};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Flash has not been initialised.")]
    NotInitialized,
    #[error("Flash initialisation failed: {0}")]
    InitFailed(anyhow::Error),
    #[error("Unrecognised JEDEC ID 0x{id:06X}.")]
    IdMismatch { id: u32 },
    #[error("Address out of range for memory: 0x{address:08X} + {length} bytes.")]
    OutOfBound { address: u32, length: usize },
    #[error("Device did not switch to 4-byte address mode.")]
    FourByteModeFailed,
    #[error("Timed out after {waited:?} waiting for the device to become ready.")]
    Timeout { waited: Duration },
    #[error("Address 0x{address:08X} is not aligned to a sector boundary.")]
    Unaligned { address: u32 },
    #[error("Write enable latch did not set.")]
    WriteEnableFailed,

    #[error(transparent)]
    Access(#[from] anyhow::Error),
}

/// How a failure should be treated by callers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Busy or flaky conditions which already exhausted their internal retries.
    Transient,
    /// A mismatch between request and device which retrying cannot fix.
    Structural,
    /// The engine is unusable until it is (re)initialised.
    Fatal,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Timeout { .. } | Error::WriteEnableFailed | Error::Access(_) => {
                ErrorClass::Transient
            }
            Error::IdMismatch { .. }
            | Error::OutOfBound { .. }
            | Error::Unaligned { .. }
            | Error::FourByteModeFailed => ErrorClass::Structural,
            Error::NotInitialized | Error::InitFailed(_) => ErrorClass::Fatal,
        }
    }

    /// Transport failures during Init are reported as `InitFailed`.
    fn into_init_failure(self) -> Self {
        match self {
            Error::Access(e) => Error::InitFailed(e),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
pub type AnyhowResult<T> = anyhow::Result<T>;

/// Trait for objects which provide access to SPI flash.
///
/// Providers drive chip-select explicitly with `select()` and `deselect()`
/// and move bytes with `transmit()` and `receive()`, each bounded by
/// a per-call timeout. The engine always pairs every `select()` with a
/// `deselect()`, even when a transfer in between fails.
pub trait FlashAccess {
    /// Assert CS.
    fn select(&mut self) -> AnyhowResult<()>;

    /// De-assert CS.
    fn deselect(&mut self) -> AnyhowResult<()>;

    /// Write all bytes in `data` to the SPI bus, discarding received data.
    fn transmit(&mut self, data: &[u8], timeout: Duration) -> AnyhowResult<()>;

    /// Fill `buf` with bytes clocked in from the SPI bus.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> AnyhowResult<()>;

    /// Largest number of bytes a single `receive()` may be asked for.
    fn max_transfer(&self) -> usize {
        65535
    }

    fn sleep(&mut self, dur: Duration);
}

/// Engine lifecycle state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Initialized,
}

/// Device descriptor, populated by a successful `Flash::init()`.
#[derive(Copy, Clone, Debug)]
pub struct FlashInfo {
    pub id: FlashID,
    pub model: &'static FlashModel,
    /// Total capacity in bytes.
    pub capacity: u32,
    pub address_width: AddressWidth,
    /// True if Init switched the device into 4-byte address mode.
    pub four_byte_mode: bool,
}

impl FlashInfo {
    pub fn page_size(&self) -> u32 {
        self.model.page_size
    }

    pub fn sector_size(&self) -> u32 {
        self.model.sector_size
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct FlashConfig {
    pub model: ModelSelection,
    pub timeouts: Timeouts,
}

/// SPI NOR flash protocol engine.
///
/// Owns the transport and, once initialised, the device descriptor.
/// Every operation other than `init()` fails with `Error::NotInitialized`
/// until `init()` has succeeded.
pub struct Flash<A: FlashAccess> {
    access: A,
    config: FlashConfig,
    info: Option<FlashInfo>,
}

impl<A: FlashAccess> Flash<A> {
    const CMD_TIMEOUT: Duration = Duration::from_millis(100);
    const BULK_TIMEOUT: Duration = Duration::from_millis(500);
    const BULK_THRESHOLD: usize = 256;
    const WEL_RETRIES: usize = 3;

    /// Create a new, uninitialised Flash instance using the given FlashAccess provider.
    pub fn new(access: A, config: FlashConfig) -> Self {
        Flash { access, config, info: None }
    }

    pub fn access(&self) -> &A {
        &self.access
    }

    pub fn access_mut(&mut self) -> &mut A {
        &mut self.access
    }

    /// Release the transport.
    pub fn into_inner(self) -> A {
        self.access
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    /// Replace the busy-wait policy.
    pub fn set_timeouts(&mut self, timeouts: Timeouts) {
        self.config.timeouts = timeouts;
    }

    pub fn state(&self) -> State {
        match self.info {
            Some(_) => State::Initialized,
            None => State::Uninitialized,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.info.is_some()
    }

    /// Get the device descriptor, if initialised.
    pub fn info(&self) -> Option<&FlashInfo> {
        self.info.as_ref()
    }

    /// Get the total memory capacity in bytes, if initialised.
    pub fn capacity(&self) -> Option<u32> {
        self.info.map(|info| info.capacity)
    }

    /// Identify the device and bring it into a usable state.
    ///
    /// Reads the JEDEC ID, resolves the geometry from the model table (or
    /// the fixed model in the configuration), enters 4-byte address mode
    /// if the part requires it, and clears any block protection bits.
    ///
    /// Calling `init()` on an initialised engine returns the existing
    /// descriptor without talking to the device.
    pub fn init(&mut self) -> Result<FlashInfo> {
        if let Some(info) = self.info {
            log::debug!("Flash already initialised, not probing again");
            return Ok(info);
        }

        let info = self.probe()?;
        log::debug!(
            "Initialised {} ({}): {} bytes, {} address bytes",
            info.model.name,
            info.id,
            info.capacity,
            info.address_width.bytes()
        );
        self.info = Some(info);
        Ok(info)
    }

    /// Forget the device descriptor.
    ///
    /// If Init switched the device into 4-byte address mode it is
    /// switched back first; failures doing so are only logged.
    pub fn deinit(&mut self) {
        if let Some(info) = self.info.take() {
            if info.four_byte_mode {
                if let Err(e) = self.command(Command::Exit4ByteMode) {
                    log::warn!("Failed to leave 4-byte address mode: {}", e);
                }
            }
            log::debug!("Flash deinitialised");
        }
    }

    /// Read `buf.len()` bytes of data from the attached flash, starting at `address`.
    ///
    /// The read never waits for the device to become idle. Data is clocked in
    /// using as many `receive()` calls as the transport's `max_transfer()` requires,
    /// all within a single chip-select.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        let info = self.initialized()?;
        if buf.is_empty() {
            return Ok(());
        }
        Self::check_range(&info, address, buf.len())?;

        let opcode = match info.address_width {
            AddressWidth::Three => Command::ReadData,
            AddressWidth::Four => Command::ReadData4B,
        };
        let (header, n) = Self::make_header(&info, opcode, address);
        let chunk_size = self.access.max_transfer().max(1);
        log::trace!("Reading {} bytes from 0x{:08X}", buf.len(), address);

        self.transaction(|access| {
            access.transmit(&header[..n], Self::CMD_TIMEOUT)?;
            for chunk in buf.chunks_mut(chunk_size) {
                let timeout = if chunk.len() > Self::BULK_THRESHOLD {
                    Self::BULK_TIMEOUT
                } else {
                    Self::CMD_TIMEOUT
                };
                access.receive(chunk, timeout)?;
            }
            Ok(())
        })
    }

    /// Program `data` to `address`, automatically split into page program operations.
    ///
    /// Each page program is preceded by a wait for the device to become ready
    /// and a verified write enable, and followed by another wait, so the
    /// device is idle when this method returns. Any failure aborts the
    /// remaining pages.
    ///
    /// Note that this does *not* erase the flash beforehand.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let info = self.initialized()?;
        if data.is_empty() {
            return Ok(());
        }
        Self::check_range(&info, address, data.len())?;

        let opcode = match info.address_width {
            AddressWidth::Three => Command::PageProgram,
            AddressWidth::Four => Command::PageProgram4B,
        };
        let page_size = info.page_size();
        let budget = self.config.timeouts.wait_budget(info.capacity, None);

        log::trace!("Programming {} bytes to 0x{:08X}, page size {} bytes",
                    data.len(), address, page_size);

        let mut address = address;
        let mut remaining = data;
        while !remaining.is_empty() {
            let page_remaining = (page_size - (address & (page_size - 1))) as usize;
            let (page_data, rest) = remaining.split_at(remaining.len().min(page_remaining));

            self.poll_ready(budget)?;
            self.write_enable()?;

            let (header, n) = Self::make_header(&info, opcode, address);
            log::trace!("Page program {} bytes at 0x{:08X}", page_data.len(), address);
            self.transaction(|access| {
                access.transmit(&header[..n], Self::CMD_TIMEOUT)?;
                access.transmit(page_data, Self::CMD_TIMEOUT)
            })?;

            // The device needs a moment after CS rises before it reports busy.
            self.access.sleep(Duration::from_micros(10));
            self.poll_ready(budget)?;

            address += page_data.len() as u32;
            remaining = rest;
        }

        Ok(())
    }

    /// Erase the sector starting at `address`, which must be sector aligned.
    ///
    /// Returns only after the erase has completed. The wait budget grows
    /// with the sector index on large devices.
    pub fn erase_sector(&mut self, address: u32) -> Result<()> {
        let info = self.initialized()?;
        let sector_size = info.sector_size();
        Self::check_range(&info, address, sector_size as usize)?;
        if address % sector_size != 0 {
            log::error!("Sector erase address 0x{:08X} is not aligned", address);
            return Err(Error::Unaligned { address });
        }

        let timeouts = self.config.timeouts;
        self.poll_ready(timeouts.wait_budget(info.capacity, None))?;
        self.write_enable()?;

        let opcode = match info.address_width {
            AddressWidth::Three => Command::SectorErase,
            AddressWidth::Four => Command::SectorErase4B,
        };
        let (header, n) = Self::make_header(&info, opcode, address);
        log::trace!("Erasing sector at 0x{:08X}", address);
        self.transaction(|access| access.transmit(&header[..n], Self::CMD_TIMEOUT))?;

        let erase = timeouts.sector_erase(info.capacity, address / sector_size);
        self.poll_ready(timeouts.wait_budget(info.capacity, Some(erase)))
    }

    /// Erase entire flash chip.
    ///
    /// Returns only after erase operation is complete.
    pub fn erase_chip(&mut self) -> Result<()> {
        let info = self.initialized()?;
        self.start_chip_erase(&info)?;
        let timeouts = self.config.timeouts;
        let erase = timeouts.chip_erase(info.capacity);
        self.poll_ready(timeouts.wait_budget(info.capacity, Some(erase)))
    }

    /// Erase entire flash chip.
    ///
    /// This method is identical to `erase_chip()`, except it draws a spinner
    /// to the terminal while polling for completion.
    #[cfg(feature = "progress")]
    pub fn erase_chip_progress(&mut self) -> Result<()> {
        let info = self.initialized()?;
        let pb = ProgressBar::new_spinner();
        pb.set_message("Erasing");
        self.start_chip_erase(&info)?;

        let timeouts = self.config.timeouts;
        let budget = timeouts.wait_budget(info.capacity, Some(timeouts.chip_erase(info.capacity)));
        let deadline = Deadline::after(budget);
        while self.status1()?.get_busy() {
            if deadline.expired() {
                pb.abandon();
                return Err(Error::Timeout { waited: deadline.timeout() });
            }
            pb.tick();
            self.access.sleep(timeouts.poll_interval);
        }
        pb.finish();
        Ok(())
    }

    /// Wait until the device stops being busy.
    ///
    /// `None` selects the configured default timeout. On large devices the
    /// timeout is doubled.
    pub fn wait_ready(&mut self, timeout: Option<Duration>) -> Result<()> {
        let info = self.initialized()?;
        let budget = self.config.timeouts.wait_budget(info.capacity, timeout);
        self.poll_ready(budget)
    }

    /// Read status register 1.
    pub fn read_status1(&mut self) -> Result<StatusRegister1> {
        self.initialized()?;
        self.status1()
    }

    /// Read status register 2.
    pub fn read_status2(&mut self) -> Result<StatusRegister2> {
        self.initialized()?;
        self.read_register(Command::ReadStatusRegister2).map(StatusRegister2)
    }

    /// Read status register 3.
    pub fn read_status3(&mut self) -> Result<StatusRegister3> {
        self.initialized()?;
        self.status3()
    }

    /// Check if any block protect bits are set in status register 1.
    pub fn is_protected(&mut self) -> Result<bool> {
        Ok(self.read_status1()?.get_block_protect() != 0)
    }

    fn initialized(&self) -> Result<FlashInfo> {
        self.info.ok_or(Error::NotInitialized)
    }

    fn probe(&mut self) -> Result<FlashInfo> {
        log::debug!("Probing SPI flash");

        // Make sure CS starts released, then give the device time to power up.
        self.access.deselect().map_err(Error::InitFailed)?;
        self.access.sleep(Duration::from_millis(10));

        let id = self.read_jedec_id().map_err(Error::into_init_failure)?;
        log::debug!("Read ID: {}", id);

        let model = match self.config.model {
            ModelSelection::Fixed(model) => {
                log::debug!("Using fixed model {}", model.name);
                model
            }
            ModelSelection::Detect => match model::lookup(id.jedec()) {
                Some(model) => model,
                None => {
                    log::error!("No known model for JEDEC ID 0x{:06X}", id.jedec());
                    return Err(Error::IdMismatch { id: id.jedec() });
                }
            },
        };

        if model.requires_four_byte_mode {
            self.enter_four_byte_mode()?;
        }

        let info = FlashInfo {
            id,
            model,
            capacity: model.capacity,
            address_width: model.address_width,
            four_byte_mode: model.requires_four_byte_mode,
        };
        // Protection which cannot be cleared leaves a usable, read-only device.
        if let Err(e) = self.clear_block_protection(&info) {
            log::error!("Could not clear block protection: {}", e);
        }
        Ok(info)
    }

    fn enter_four_byte_mode(&mut self) -> Result<()> {
        log::debug!("Entering 4-byte address mode");
        self.command(Command::Enter4ByteMode).map_err(|e| {
            log::error!("Enter 4-byte mode command failed: {}", e);
            Error::FourByteModeFailed
        })?;
        self.access.sleep(Duration::from_micros(10));

        let status3 = self.status3().map_err(|e| {
            log::error!("Could not read status register 3: {}", e);
            Error::FourByteModeFailed
        })?;
        if !status3.get_four_byte_mode() {
            log::error!("Address mode bit still clear, SR3={:02X}", status3.0);
            return Err(Error::FourByteModeFailed);
        }
        Ok(())
    }

    fn clear_block_protection(&mut self, info: &FlashInfo) -> Result<()> {
        let mut status1 = self.status1()?;
        if status1.get_block_protect() == 0 {
            return Ok(());
        }

        log::debug!("Block protect bits set (BP=0x{:X}), clearing", status1.get_block_protect());
        self.write_enable()?;
        status1.clear_block_protect();
        let tx = [Command::WriteStatusRegister1.into(), status1.0];
        self.transaction(|access| access.transmit(&tx, Self::CMD_TIMEOUT))?;
        self.poll_ready(self.config.timeouts.wait_budget(info.capacity, None))?;

        let status1 = self.status1()?;
        if status1.get_block_protect() != 0 {
            log::error!("Block protection clear failed (BP=0x{:X})", status1.get_block_protect());
        }
        Ok(())
    }

    fn start_chip_erase(&mut self, info: &FlashInfo) -> Result<()> {
        self.poll_ready(self.config.timeouts.wait_budget(info.capacity, None))?;
        self.write_enable()?;
        log::debug!("Starting chip erase");
        self.command(Command::ChipErase)
    }

    /// Send WriteEnable and confirm the WEL bit latched.
    ///
    /// Some devices need a moment before WEL reads back as set, so the
    /// status register is polled a few times before giving up.
    fn write_enable(&mut self) -> Result<()> {
        self.command(Command::WriteEnable)?;
        self.access.sleep(Duration::from_micros(5));

        for attempt in 1..=Self::WEL_RETRIES {
            if self.status1()?.get_wel() {
                return Ok(());
            }
            log::trace!("WEL not set yet (attempt {})", attempt);
            self.access.sleep(Duration::from_micros(10));
        }

        log::error!("WEL still clear after {} polls", Self::WEL_RETRIES);
        Err(Error::WriteEnableFailed)
    }

    /// Poll the BUSY bit until it clears or `budget` elapses.
    fn poll_ready(&mut self, budget: Duration) -> Result<()> {
        let deadline = Deadline::after(budget);
        loop {
            if !self.status1()?.get_busy() {
                return Ok(());
            }
            if deadline.expired() {
                log::error!("Device still busy after {:?}", deadline.elapsed());
                return Err(Error::Timeout { waited: deadline.timeout() });
            }
            self.access.sleep(self.config.timeouts.poll_interval);
        }
    }

    fn read_jedec_id(&mut self) -> Result<FlashID> {
        let mut data = [0u8; 3];
        let opcode: u8 = Command::ReadJEDECID.into();
        self.transaction(|access| {
            access.transmit(&[opcode], Self::CMD_TIMEOUT)?;
            access.receive(&mut data, Self::CMD_TIMEOUT)
        })?;
        Ok(FlashID::from_bytes(data))
    }

    fn status1(&mut self) -> Result<StatusRegister1> {
        self.read_register(Command::ReadStatusRegister1).map(StatusRegister1)
    }

    fn status3(&mut self) -> Result<StatusRegister3> {
        self.read_register(Command::ReadStatusRegister3).map(StatusRegister3)
    }

    fn read_register(&mut self, command: Command) -> Result<u8> {
        let mut data = [0u8; 1];
        let opcode: u8 = command.into();
        self.transaction(|access| {
            access.transmit(&[opcode], Self::CMD_TIMEOUT)?;
            access.receive(&mut data, Self::CMD_TIMEOUT)
        })?;
        log::trace!("{:?}: {:02X}", command, data[0]);
        Ok(data[0])
    }

    /// Convenience method for issuing a single command with no payload.
    fn command(&mut self, command: Command) -> Result<()> {
        let opcode: u8 = command.into();
        log::trace!("SPI command: {:02X}", opcode);
        self.transaction(|access| access.transmit(&[opcode], Self::CMD_TIMEOUT))
    }

    /// Run `f` with CS asserted, releasing CS whatever `f` returns.
    fn transaction<R, F>(&mut self, f: F) -> Result<R>
        where F: FnOnce(&mut A) -> AnyhowResult<R>
    {
        self.access.select()?;
        let result = f(&mut self.access);
        let released = self.access.deselect();
        let value = result?;
        released?;
        Ok(value)
    }

    /// Checks `address + length` lies within the device, using 64-bit arithmetic.
    fn check_range(info: &FlashInfo, address: u32, length: usize) -> Result<()> {
        let end = address as u64 + length as u64;
        if end > info.capacity as u64 {
            log::error!("Operation at 0x{:08X} + {} would exceed flash capacity",
                        address, length);
            Err(Error::OutOfBound { address, length })
        } else {
            Ok(())
        }
    }

    /// Build `opcode` followed by a 3- or 4-byte address.
    ///
    /// Returns the buffer and the number of bytes used.
    fn make_header(info: &FlashInfo, opcode: Command, address: u32) -> ([u8; 5], usize) {
        let bytes = address.to_be_bytes();
        let width = info.address_width.bytes();
        let mut header = [0u8; 5];
        header[0] = opcode.into();
        header[1..=width].copy_from_slice(&bytes[4 - width..]);
        (header, 1 + width)
    }
}

/// SPI NOR command opcodes used by the engine.
///
/// These are taken from the Winbond W25Q datasheets and are shared by
/// most compatible parts.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum Command {
    WriteEnable = 0x06,
    WriteStatusRegister1 = 0x01,
    ReadStatusRegister1 = 0x05,
    ReadStatusRegister2 = 0x35,
    ReadStatusRegister3 = 0x15,
    ReadJEDECID = 0x9F,

    ReadData = 0x03,
    PageProgram = 0x02,
    SectorErase = 0x20,
    ChipErase = 0xC7,

    // 4-byte address variants, always taking a 32-bit address.
    ReadData4B = 0x13,
    PageProgram4B = 0x12,
    SectorErase4B = 0x21,
    Enter4ByteMode = 0xB7,
    Exit4ByteMode = 0xE9,
}

impl Command {
    #[cfg(any(test, feature = "sim"))]
    pub(crate) fn decode(opcode: u8) -> Option<Self> {
        use core::convert::TryFrom;
        Command::try_from(opcode).ok()
    }
}
