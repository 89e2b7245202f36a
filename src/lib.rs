//! An [`embedded-hal`]-based driver for serial NOR flash and FRAM chips.
//!
//! The crate is organised in layers:
//!
//! * A [`Transport`] moves flash commands over a concrete bus: hardware SPI,
//!   bit-banged GPIO, or a memory-mapped (XIP) window.
//! * [`flash::Flash`] detects the chip by its JEDEC ID and sequences the
//!   write-enable / erase / program / busy-wait protocol on top of a
//!   transport.
//! * [`cache::SectorCache`] buffers one erase sector so that small writes do
//!   not each cost an erase cycle.
//! * [`disk::FlashDisk`] puts 512-byte [`BlockDevice`] semantics on top of
//!   the cache, ready to be handed to a filesystem.
//!
//! ```ignore
//! let mut flash = Flash::new(SpiTransport::new(spi, cs));
//! flash.begin(&mut delay)?;
//! let mut disk = FlashDisk::new(flash)?;
//! disk.write_block(3, &block)?;
//! disk.sync_blocks()?;
//! ```
//!
//! [`embedded-hal`]: https://docs.rs/embedded-hal/

#![doc(html_root_url = "https://docs.rs/serial-flash/0.1.0")]
#![warn(missing_debug_implementations, rust_2018_idioms)]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

#[macro_use]
mod log;
pub mod cache;
pub mod device;
pub mod disk;
mod error;
pub mod flash;
pub mod prelude;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod transport;
mod utils;

pub use crate::error::{BusError, Error};

use core::fmt::Debug;

/// Size of the blocks exposed through [`BlockDevice`].
pub const BLOCK_SIZE: usize = 512;

/// A bus that can carry serial flash commands.
///
/// Every method is exactly one chip-select bracketed transaction. Failed
/// transfers are reported, never retried.
pub trait Transport {
    /// Error produced by the underlying bus.
    type Error: Debug;

    /// Prepares the bus. Called once at the start of detection.
    fn begin(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Whether the bus can drive four data lines.
    fn supports_quad_mode(&self) -> bool {
        false
    }

    /// Requests a new bus clock, in Hz.
    fn set_clock_speed(&mut self, hz: u32);

    /// Selects the opcode used by [`Transport::read_memory`].
    ///
    /// Transports that cannot switch read commands ignore this.
    fn set_read_opcode(&mut self, _opcode: u8) {}

    /// Selects the opcode used by [`Transport::write_memory`].
    ///
    /// Only quad capable transports need to honour this.
    fn set_write_opcode(&mut self, _opcode: u8) {}

    /// Sends a single opcode with no address or data phase.
    fn run_command(&mut self, opcode: u8) -> Result<(), Self::Error>;

    /// Sends `opcode`, then clocks `response.len()` bytes back into
    /// `response`.
    fn read_command(&mut self, opcode: u8, response: &mut [u8]) -> Result<(), Self::Error>;

    /// Sends `opcode` followed by `data`.
    fn write_command(&mut self, opcode: u8, data: &[u8]) -> Result<(), Self::Error>;

    /// Sends `opcode` followed by a 24-bit big-endian address.
    fn erase_command(&mut self, opcode: u8, addr: u32) -> Result<(), Self::Error>;

    /// Reads `buf.len()` bytes of memory starting at `addr`.
    fn read_memory(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Programs `data` at `addr`.
    ///
    /// The caller guarantees that `data` does not cross a page boundary.
    fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error>;
}

/// A trait for reading operations from a memory chip.
pub trait Read {
    /// Error returned by failed reads.
    type Error;

    /// Reads bytes from a memory chip.
    ///
    /// # Parameters
    /// * `addr`: The address to start reading at.
    /// * `buf`: The buffer to read `buf.len()` bytes into.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error>;
}

/// A trait for writing and erasing operations on a memory chip.
pub trait Program: Read {
    /// Total size of the chip in bytes.
    fn capacity(&self) -> u32;

    /// Size of the smallest erasable unit in bytes.
    fn sector_size(&self) -> u32;

    /// Erases sector number `sector`, i.e. the range starting at
    /// `sector * sector_size()`.
    fn erase_sector(&mut self, sector: u32) -> Result<(), Self::Error>;

    /// Writes bytes onto the memory chip. This method is supposed to assume
    /// that the sectors it is writing to have already been erased and should
    /// not do any erasing itself.
    ///
    /// # Parameters
    /// * `addr`: The address to write to.
    /// * `data`: The bytes to write to `addr`.
    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error>;
}

/// Fixed-size block storage, as consumed by a filesystem.
///
/// Blocks are [`BLOCK_SIZE`] bytes and addressed by zero-based index.
/// Writes are only durable after [`BlockDevice::sync_blocks`].
pub trait BlockDevice {
    /// Error returned by the device.
    type Error;

    /// Number of blocks on the device.
    fn block_count(&self) -> u32;

    /// Reads `dst.len() / BLOCK_SIZE` consecutive blocks starting at `block`.
    fn read_blocks(&mut self, block: u32, dst: &mut [u8]) -> Result<(), Self::Error>;

    /// Writes `src.len() / BLOCK_SIZE` consecutive blocks starting at `block`.
    fn write_blocks(&mut self, block: u32, src: &[u8]) -> Result<(), Self::Error>;

    /// Flushes any buffered writes to the medium.
    fn sync_blocks(&mut self) -> Result<(), Self::Error>;

    /// Reads a single block.
    fn read_block(&mut self, block: u32, dst: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
        self.read_blocks(block, dst)
    }

    /// Writes a single block.
    fn write_block(&mut self, block: u32, src: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
        self.write_blocks(block, src)
    }
}
