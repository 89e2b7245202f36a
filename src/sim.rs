//! An in-memory emulation of a serial flash or FRAM chip.
//!
//! [`SimFlash`] implements [`Transport`] at the command level and behaves
//! like a real part where it matters to a driver: erased memory reads as
//! `0xFF`, programming can only clear bits, a program that runs past the end
//! of a page wraps around to the start of that page, program and erase
//! commands are ignored unless the write enable latch is set, and the chip
//! reports busy for a few status polls after each of them.

use crate::device::DeviceDescriptor;
use crate::flash::{Opcode, Status, Status2};
use crate::Transport;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use embedded_hal::blocking::delay::DelayUs;

/// One bus transaction seen by a [`SimFlash`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// A plain opcode.
    Command(u8),
    /// An opcode with a response phase.
    ReadCommand(u8),
    /// An opcode with a data phase.
    WriteCommand(u8, Vec<u8>),
    /// An erase command.
    Erase {
        /// Opcode sent.
        opcode: u8,
        /// Address sent.
        addr: u32,
    },
    /// A memory read.
    Read {
        /// Start address.
        addr: u32,
        /// Number of bytes read.
        len: usize,
    },
    /// A program command.
    Program {
        /// Start address.
        addr: u32,
        /// Number of bytes sent.
        len: usize,
    },
}

/// Failures injected by a [`SimFlash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    /// The transfer was set up to fail with [`SimFlash::fail_program`] or
    /// [`SimFlash::fail_command`].
    Injected,
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Injected => f.write_str("injected transfer failure"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SimError {}

/// An emulated chip.
#[derive(Debug)]
pub struct SimFlash {
    memory: Vec<u8>,
    id: [u8; 3],
    page_size: u32,
    sector_size: u32,
    block_size: u32,
    fram: bool,
    quad: bool,
    status: u8,
    status2: u8,
    busy_cycles: u32,
    busy_polls: u32,
    suspended_polls: u32,
    reset_armed: bool,
    read_opcode: u8,
    write_opcode: u8,
    clock_hz: u32,
    fail_program: Option<usize>,
    fail_command: Option<u8>,
    log: Vec<Op>,
}

impl SimFlash {
    /// Emulates the part described by `dev`, fully erased.
    pub fn new(dev: &DeviceDescriptor) -> Self {
        Self {
            memory: vec![0xFF; dev.total_size as usize],
            id: [dev.manufacturer_id, dev.memory_type, dev.capacity],
            page_size: dev.page_size,
            sector_size: dev.sector_size,
            block_size: dev.block_size,
            fram: dev.is_fram,
            quad: false,
            status: 0,
            status2: 0,
            busy_cycles: 2,
            busy_polls: 0,
            suspended_polls: 0,
            reset_armed: false,
            read_opcode: Opcode::Read as u8,
            write_opcode: Opcode::PageProgram as u8,
            clock_hz: 0,
            fail_program: None,
            fail_command: None,
            log: Vec::new(),
        }
    }

    /// Emulates a part of `size` bytes that answers the JEDEC ID query with
    /// `id` and uses the common 256/4096/65536 byte geometry.
    pub fn with_id(id: [u8; 3], size: u32) -> Self {
        Self::new(&DeviceDescriptor::nor("sim", id, size, 104))
    }

    /// Lets the emulated bus drive four data lines.
    pub fn quad_capable(mut self) -> Self {
        self.quad = true;
        self
    }

    /// Number of status polls that report busy after a program or erase.
    pub fn busy_cycles(mut self, polls: u32) -> Self {
        self.busy_cycles = polls;
        self
    }

    /// Number of second status register polls that report a suspended
    /// erase or program, as left behind by an interrupted session.
    pub fn suspended(mut self, polls: u32) -> Self {
        self.suspended_polls = polls;
        self
    }

    /// Makes the next plain command with `opcode` fail.
    pub fn fail_command(&mut self, opcode: u8) {
        self.fail_command = Some(opcode);
    }

    /// Makes the program command `n` commands from now fail. `0` fails the
    /// next one.
    pub fn fail_program(&mut self, n: usize) {
        self.fail_program = Some(n);
    }

    /// Sets the raw status registers, e.g. to emulate a leftover session.
    pub fn set_status(&mut self, status: u8, status2: u8) {
        self.status = status;
        self.status2 = status2;
    }

    /// The first status register, without the busy bit.
    pub fn status(&self) -> u8 {
        self.status
    }

    /// The second status register.
    pub fn status2(&self) -> u8 {
        self.status2
    }

    /// The emulated memory.
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// The emulated memory, for preloading contents.
    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Last clock requested through [`Transport::set_clock_speed`].
    pub fn clock_hz(&self) -> u32 {
        self.clock_hz
    }

    /// Opcode currently used for memory reads.
    pub fn read_opcode(&self) -> u8 {
        self.read_opcode
    }

    /// Opcode currently used for programming.
    pub fn write_opcode(&self) -> u8 {
        self.write_opcode
    }

    /// Every transaction seen so far.
    pub fn log(&self) -> &[Op] {
        &self.log
    }

    /// Forgets the recorded transactions.
    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// `(opcode, addr)` of every erase seen so far.
    pub fn erases(&self) -> Vec<(u8, u32)> {
        self.log
            .iter()
            .filter_map(|op| match *op {
                Op::Erase { opcode, addr } => Some((opcode, addr)),
                _ => None,
            })
            .collect()
    }

    /// `(addr, len)` of every program command seen so far.
    pub fn programs(&self) -> Vec<(u32, usize)> {
        self.log
            .iter()
            .filter_map(|op| match *op {
                Op::Program { addr, len } => Some((addr, len)),
                _ => None,
            })
            .collect()
    }

    fn wel(&self) -> bool {
        self.status & Status::WEL.bits() != 0
    }

    fn finish_write(&mut self) {
        self.status &= !Status::WEL.bits();
        self.busy_polls = self.busy_cycles;
    }

    fn wrap(&self, addr: u32) -> usize {
        addr as usize % self.memory.len()
    }

    fn erase_range(&mut self, addr: u32, size: u32) {
        let start = self.wrap(addr & !(size - 1));
        let end = (start + size as usize).min(self.memory.len());
        self.memory[start..end].iter_mut().for_each(|b| *b = 0xFF);
    }
}

impl Transport for SimFlash {
    type Error = SimError;

    fn supports_quad_mode(&self) -> bool {
        self.quad
    }

    fn set_clock_speed(&mut self, hz: u32) {
        self.clock_hz = hz;
    }

    fn set_read_opcode(&mut self, opcode: u8) {
        self.read_opcode = opcode;
    }

    fn set_write_opcode(&mut self, opcode: u8) {
        self.write_opcode = opcode;
    }

    fn run_command(&mut self, opcode: u8) -> Result<(), SimError> {
        self.log.push(Op::Command(opcode));
        if self.fail_command == Some(opcode) {
            self.fail_command = None;
            return Err(SimError::Injected);
        }
        let armed = core::mem::replace(&mut self.reset_armed, false);

        match opcode {
            x if x == Opcode::WriteEnable as u8 => self.status |= Status::WEL.bits(),
            x if x == Opcode::WriteDisable as u8 => self.status &= !Status::WEL.bits(),
            x if x == Opcode::EnableReset as u8 => self.reset_armed = true,
            x if x == Opcode::Reset as u8 && armed => {
                self.status &= !Status::WEL.bits();
                self.busy_polls = 0;
            }
            x if (x == Opcode::ChipErase as u8 || x == Opcode::ChipEraseAlt as u8) && self.wel() => {
                if !self.fram {
                    self.memory.iter_mut().for_each(|b| *b = 0xFF);
                }
                self.finish_write();
            }
            _ => {}
        }
        Ok(())
    }

    fn read_command(&mut self, opcode: u8, response: &mut [u8]) -> Result<(), SimError> {
        self.log.push(Op::ReadCommand(opcode));
        response.iter_mut().for_each(|b| *b = 0xFF);

        match opcode {
            x if x == Opcode::ReadJedecId as u8 => {
                let n = response.len().min(3);
                response[..n].copy_from_slice(&self.id[..n]);
            }
            x if x == Opcode::ReadStatus as u8 => {
                let mut status = self.status;
                if self.busy_polls > 0 {
                    self.busy_polls -= 1;
                    status |= Status::BUSY.bits();
                }
                response.iter_mut().for_each(|b| *b = status);
            }
            x if x == Opcode::ReadStatus2 as u8 => {
                let mut status2 = self.status2;
                if self.suspended_polls > 0 {
                    self.suspended_polls -= 1;
                    status2 |= Status2::SUS.bits();
                }
                response.iter_mut().for_each(|b| *b = status2);
            }
            _ => {}
        }
        Ok(())
    }

    fn write_command(&mut self, opcode: u8, data: &[u8]) -> Result<(), SimError> {
        self.log.push(Op::WriteCommand(opcode, data.to_vec()));
        if !self.wel() {
            return Ok(());
        }

        if opcode == Opcode::WriteStatus as u8 {
            if let Some(&sr1) = data.first() {
                self.status = sr1 & !(Status::BUSY | Status::WEL).bits();
            }
            if let Some(&sr2) = data.get(1) {
                self.status2 = sr2;
            }
            self.finish_write();
        } else if opcode == Opcode::WriteStatus2 as u8 {
            if let Some(&sr2) = data.first() {
                self.status2 = sr2;
            }
            self.finish_write();
        }
        Ok(())
    }

    fn erase_command(&mut self, opcode: u8, addr: u32) -> Result<(), SimError> {
        self.log.push(Op::Erase { opcode, addr });
        if !self.wel() || self.fram {
            return Ok(());
        }

        if opcode == Opcode::SectorErase as u8 {
            self.erase_range(addr, self.sector_size);
        } else if opcode == Opcode::BlockErase as u8 {
            self.erase_range(addr, self.block_size);
        }
        self.finish_write();
        Ok(())
    }

    fn read_memory(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), SimError> {
        self.log.push(Op::Read { addr, len: buf.len() });
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.memory[self.wrap(addr + i as u32)];
        }
        Ok(())
    }

    fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<(), SimError> {
        self.log.push(Op::Program { addr, len: data.len() });
        match self.fail_program {
            Some(0) => {
                self.fail_program = None;
                return Err(SimError::Injected);
            }
            Some(n) => self.fail_program = Some(n - 1),
            None => {}
        }
        if !self.wel() {
            return Ok(());
        }

        if self.fram {
            for (i, &b) in data.iter().enumerate() {
                let at = self.wrap(addr + i as u32);
                self.memory[at] = b;
            }
            // FRAM keeps the latch set until told otherwise
            return Ok(());
        }

        let page = self.page_size;
        let base = addr - addr % page;
        for (i, &b) in data.iter().enumerate() {
            let at = self.wrap(base + (addr % page + i as u32) % page);
            self.memory[at] &= b;
        }
        self.finish_write();
        Ok(())
    }
}

/// A delay that returns immediately and adds up what was asked of it.
#[derive(Debug, Default)]
pub struct SimDelay {
    /// Total requested delay in microseconds.
    pub total_us: u64,
}

impl DelayUs<u32> for SimDelay {
    fn delay_us(&mut self, us: u32) {
        self.total_us += u64::from(us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::GD25Q16C;

    #[test]
    fn test_program_needs_write_enable() {
        let mut sim = SimFlash::new(&GD25Q16C);
        sim.write_memory(0, &[0x00]).unwrap();
        assert_eq!(sim.memory()[0], 0xFF);

        sim.run_command(Opcode::WriteEnable as u8).unwrap();
        sim.write_memory(0, &[0x0F]).unwrap();
        assert_eq!(sim.memory()[0], 0x0F);
        assert_eq!(sim.status() & Status::WEL.bits(), 0);

        // Programming only clears bits
        sim.run_command(Opcode::WriteEnable as u8).unwrap();
        sim.write_memory(0, &[0xF1]).unwrap();
        assert_eq!(sim.memory()[0], 0x01);
    }

    #[test]
    fn test_program_wraps_within_page() {
        let mut sim = SimFlash::new(&GD25Q16C);
        sim.run_command(Opcode::WriteEnable as u8).unwrap();
        sim.write_memory(254, &[1, 2, 3, 4]).unwrap();
        assert_eq!(&sim.memory()[254..256], &[1, 2]);
        assert_eq!(&sim.memory()[0..2], &[3, 4]);
        assert_eq!(sim.memory()[256], 0xFF);
    }

    #[test]
    fn test_suspend_clears_after_polls() {
        let mut sim = SimFlash::new(&GD25Q16C).suspended(2);
        let mut status2 = [0];
        for _ in 0..2 {
            sim.read_command(Opcode::ReadStatus2 as u8, &mut status2).unwrap();
            assert_eq!(status2[0], Status2::SUS.bits());
        }
        sim.read_command(Opcode::ReadStatus2 as u8, &mut status2).unwrap();
        assert_eq!(status2[0], 0);
    }

    #[test]
    fn test_busy_after_erase() {
        let mut sim = SimFlash::new(&GD25Q16C).busy_cycles(3);
        sim.memory_mut()[4096] = 0;
        sim.run_command(Opcode::WriteEnable as u8).unwrap();
        sim.erase_command(Opcode::SectorErase as u8, 4100).unwrap();
        assert_eq!(sim.memory()[4096], 0xFF);

        let mut status = [0];
        for _ in 0..3 {
            sim.read_command(Opcode::ReadStatus as u8, &mut status).unwrap();
            assert_eq!(status[0] & Status::BUSY.bits(), Status::BUSY.bits());
        }
        sim.read_command(Opcode::ReadStatus as u8, &mut status).unwrap();
        assert_eq!(status[0], 0);
    }
}
