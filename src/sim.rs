//! In-memory SPI NOR emulator.
//!
//! `SimFlash` implements `FlashAccess` by decoding the byte stream of each
//! chip-select window the way a W25Q part would, so the engine and the
//! block device adapter can be exercised without hardware. Every completed
//! transaction is recorded in an operation log, and a set of faults can be
//! switched on to provoke the engine's error paths.

use std::time::Duration;
use anyhow::{anyhow, bail};

use crate::{AnyhowResult, Command, FlashAccess, FlashModel};

/// Geometry and behaviour of the emulated chip.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// 24-bit JEDEC ID returned by 0x9F.
    pub jedec_id: u32,
    /// Flash size in bytes
    pub capacity: usize,
    pub page_size: usize,
    pub sector_size: usize,
    /// Number of status reads which report BUSY after each program or erase.
    pub busy_polls: u32,
    pub max_transfer: usize,
    /// Real time spent inside each page program.
    pub program_delay: Duration,
}

impl SimConfig {
    pub fn for_model(model: &FlashModel) -> Self {
        SimConfig {
            jedec_id: model.jedec_id,
            capacity: model.capacity as usize,
            page_size: model.page_size as usize,
            sector_size: model.sector_size as usize,
            busy_polls: 1,
            max_transfer: 65535,
            program_delay: Duration::from_secs(0),
        }
    }
}

/// Misbehaviour to inject.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// BUSY never clears.
    pub stuck_busy: bool,
    /// WriteEnable is ignored.
    pub wel_never_sets: bool,
    /// Enter 4-byte mode is ignored.
    pub refuse_four_byte: bool,
    /// Status register writes are ignored.
    pub status_locked: bool,
    /// Every transport call fails.
    pub transport: bool,
    /// `receive()` fails.
    pub fail_receive: bool,
}

/// One completed chip-select window, as decoded by the emulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    ReadId,
    ReadStatus(u8),
    WriteStatus(u8),
    WriteEnable,
    Enter4Byte,
    Exit4Byte,
    Read { address: u32, len: usize },
    PageProgram { address: u32, len: usize },
    SectorErase { address: u32 },
    ChipErase,
    Unknown(u8),
}

pub struct SimFlash {
    config: SimConfig,
    faults: Faults,
    data: Vec<u8>,
    status1: u8,
    write_enabled: bool,
    in_4byte_mode: bool,
    busy: u32,
    selected: bool,
    tx: Vec<u8>,
    rx_count: usize,
    receive_calls: usize,
    log: Vec<Op>,
    opcodes: Vec<u8>,
    sleeps: Vec<Duration>,
}

impl SimFlash {
    /// Create an erased chip.
    pub fn new(config: SimConfig) -> Self {
        let data = vec![0xFF; config.capacity];
        SimFlash {
            config,
            faults: Faults::default(),
            data,
            status1: 0,
            write_enabled: false,
            in_4byte_mode: false,
            busy: 0,
            selected: false,
            tx: Vec::new(),
            rx_count: 0,
            receive_calls: 0,
            log: Vec::new(),
            opcodes: Vec::new(),
            sleeps: Vec::new(),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SimConfig {
        &mut self.config
    }

    pub fn faults_mut(&mut self) -> &mut Faults {
        &mut self.faults
    }

    /// Get a reference to the flash data
    pub fn memory(&self) -> &[u8] {
        &self.data
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Preset the non-volatile bits of status register 1.
    pub fn set_status1(&mut self, value: u8) {
        self.status1 = value & 0xFC;
    }

    pub fn is_four_byte(&self) -> bool {
        self.in_4byte_mode
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    /// Operations completed since creation or the last `clear_log()`.
    pub fn log(&self) -> &[Op] {
        &self.log
    }

    /// First byte of every completed transaction.
    pub fn opcodes(&self) -> &[u8] {
        &self.opcodes
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls
    }

    /// Delays requested through `FlashAccess::sleep`, in order.
    pub fn sleeps(&self) -> &[Duration] {
        &self.sleeps
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
        self.opcodes.clear();
        self.sleeps.clear();
        self.receive_calls = 0;
    }

    fn check_transport(&self) -> AnyhowResult<()> {
        if self.faults.transport {
            bail!("Simulated SPI failure");
        }
        Ok(())
    }

    fn status_register1(&self) -> u8 {
        let mut value = self.status1;
        if self.busy > 0 || self.faults.stuck_busy {
            value |= 0x01;
        }
        if self.write_enabled {
            value |= 0x02;
        }
        value
    }

    /// Number of address bytes following `command`.
    fn address_bytes(&self, command: Command) -> usize {
        match command {
            Command::ReadData4B | Command::PageProgram4B | Command::SectorErase4B => 4,
            _ if self.in_4byte_mode => 4,
            _ => 3,
        }
    }

    /// Decode the address following the opcode, or None if too few bytes were sent.
    fn address(&self, command: Command) -> Option<(u32, usize)> {
        let n = self.address_bytes(command);
        let bytes = self.tx.get(1..1 + n)?;
        let address = bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
        Some((address, 1 + n))
    }

    fn start_busy(&mut self) {
        self.write_enabled = false;
        self.busy = self.config.busy_polls;
    }

    fn page_program(&mut self, address: u32, data: &[u8]) {
        let page_size = self.config.page_size;
        let start = address as usize % self.config.capacity;
        let page_base = start & !(page_size - 1);
        // Programming wraps within the page and can only change 1 -> 0.
        for (i, &byte) in data.iter().enumerate() {
            let offset = (start - page_base + i) % page_size;
            self.data[page_base + offset] &= byte;
        }
        if self.config.program_delay > Duration::from_secs(0) {
            std::thread::sleep(self.config.program_delay);
        }
    }

    fn protected(&self) -> bool {
        self.status1 & 0x3C != 0
    }

    /// Execute the write-type command collected during this transaction.
    fn complete(&mut self) -> Op {
        let opcode = self.tx[0];
        let command = match Command::decode(opcode) {
            Some(command) => command,
            None => return Op::Unknown(opcode),
        };

        match command {
            Command::ReadJEDECID => Op::ReadId,
            Command::ReadStatusRegister1 => Op::ReadStatus(1),
            Command::ReadStatusRegister2 => Op::ReadStatus(2),
            Command::ReadStatusRegister3 => Op::ReadStatus(3),
            Command::WriteEnable => {
                if !self.faults.wel_never_sets && self.busy == 0 {
                    self.write_enabled = true;
                }
                Op::WriteEnable
            }
            Command::WriteStatusRegister1 => {
                let value = self.tx.get(1).copied().unwrap_or(0);
                if self.write_enabled {
                    if !self.faults.status_locked {
                        self.status1 = value & 0xFC;
                    }
                    self.start_busy();
                }
                Op::WriteStatus(value)
            }
            Command::Enter4ByteMode => {
                if !self.faults.refuse_four_byte {
                    self.in_4byte_mode = true;
                }
                Op::Enter4Byte
            }
            Command::Exit4ByteMode => {
                self.in_4byte_mode = false;
                Op::Exit4Byte
            }
            Command::ReadData | Command::ReadData4B => {
                let address = self.address(command).map(|(a, _)| a).unwrap_or(0);
                Op::Read { address, len: self.rx_count }
            }
            Command::PageProgram | Command::PageProgram4B => {
                let (address, header) = match self.address(command) {
                    Some(a) => a,
                    None => return Op::Unknown(opcode),
                };
                let data = self.tx[header..].to_vec();
                if self.write_enabled && !self.protected() {
                    self.page_program(address, &data);
                    self.start_busy();
                }
                self.write_enabled = false;
                Op::PageProgram { address, len: data.len() }
            }
            Command::SectorErase | Command::SectorErase4B => {
                let address = match self.address(command) {
                    Some((a, _)) => a,
                    None => return Op::Unknown(opcode),
                };
                if self.write_enabled && !self.protected() {
                    let size = self.config.sector_size;
                    let start = (address as usize % self.config.capacity) & !(size - 1);
                    for byte in &mut self.data[start..start + size] {
                        *byte = 0xFF;
                    }
                    self.start_busy();
                }
                self.write_enabled = false;
                Op::SectorErase { address }
            }
            Command::ChipErase => {
                if self.write_enabled && !self.protected() {
                    for byte in &mut self.data {
                        *byte = 0xFF;
                    }
                    self.start_busy();
                }
                self.write_enabled = false;
                Op::ChipErase
            }
        }
    }
}

impl FlashAccess for SimFlash {
    fn select(&mut self) -> AnyhowResult<()> {
        self.check_transport()?;
        if self.selected {
            bail!("CS asserted twice");
        }
        self.selected = true;
        self.tx.clear();
        self.rx_count = 0;
        Ok(())
    }

    fn deselect(&mut self) -> AnyhowResult<()> {
        self.check_transport()?;
        if !self.selected {
            return Ok(());
        }
        self.selected = false;
        if !self.tx.is_empty() {
            let op = self.complete();
            self.opcodes.push(self.tx[0]);
            self.log.push(op);
        }
        Ok(())
    }

    fn transmit(&mut self, data: &[u8], _timeout: Duration) -> AnyhowResult<()> {
        self.check_transport()?;
        if !self.selected {
            bail!("Transmit with CS released");
        }
        self.tx.extend_from_slice(data);
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> AnyhowResult<()> {
        self.check_transport()?;
        if self.faults.fail_receive {
            bail!("Simulated receive failure");
        }
        if !self.selected {
            bail!("Receive with CS released");
        }
        if buf.len() > self.config.max_transfer {
            bail!("Receive of {} bytes exceeds transfer limit", buf.len());
        }
        self.receive_calls += 1;

        let opcode = *self.tx.first().ok_or_else(|| anyhow!("Receive before opcode"))?;
        match Command::decode(opcode) {
            Some(Command::ReadJEDECID) => {
                let id = self.config.jedec_id.to_be_bytes();
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = id.get(1 + self.rx_count + i).copied().unwrap_or(0);
                }
            }
            Some(Command::ReadStatusRegister1) => {
                let value = self.status_register1();
                if self.busy > 0 {
                    self.busy -= 1;
                }
                buf.iter_mut().for_each(|b| *b = value);
            }
            Some(Command::ReadStatusRegister2) => buf.iter_mut().for_each(|b| *b = 0),
            Some(Command::ReadStatusRegister3) => {
                let value = if self.in_4byte_mode { 0x80 } else { 0x00 };
                buf.iter_mut().for_each(|b| *b = value);
            }
            Some(command @ Command::ReadData) | Some(command @ Command::ReadData4B) => {
                let (address, _) = self.address(command)
                    .ok_or_else(|| anyhow!("Read without address"))?;
                let start = address as usize + self.rx_count;
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = self.data[(start + i) % self.config.capacity];
                }
            }
            _ => buf.iter_mut().for_each(|b| *b = 0xFF),
        }
        self.rx_count += buf.len();
        Ok(())
    }

    fn max_transfer(&self) -> usize {
        self.config.max_transfer
    }

    /// Recorded, not slept.
    fn sleep(&mut self, dur: Duration) {
        self.sleeps.push(dur);
    }
}
