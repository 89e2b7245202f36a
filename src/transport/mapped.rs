//! Flash that is memory-mapped into the address space (execute in place).
//!
//! On such parts the controller does not talk to the chip directly. Reads
//! come straight from the mapping, and erase and program go through a
//! platform routine that must run while nothing else touches the flash,
//! typically with interrupts off and other cores parked.
//! [`MappedTransport`] translates the command protocol onto such a backend
//! for a window of the chip, so the rest of the stack works unchanged.

use crate::device::{DeviceDescriptor, JedecId};
use crate::flash::Opcode;
use crate::Transport;
use core::fmt::{self, Debug, Display};

/// JEDEC ID reported for a mapped window.
pub const MAPPED_ID: JedecId = JedecId([0xAD, 0xAF, 0x00]);

const SECTOR_SIZE: u32 = 4096;
const BLOCK_SIZE: u32 = 65536;

/// Platform access to a directly addressed flash.
///
/// Offsets are relative to the start of the flash, not to any window.
pub trait MappedFlash {
    /// Error reported by the platform routines.
    type Error: Debug;

    /// Copies `buf.len()` bytes at `offset` out of the mapping.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Erases `len` bytes at `offset`. Both are multiples of 4 KiB.
    fn erase(&mut self, offset: u32, len: u32) -> Result<(), Self::Error>;

    /// Programs `data` at `offset`.
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Runs `f` with exclusive access to the flash.
    ///
    /// Every erase and program is issued from inside this. The default
    /// takes no lock, which is only right on single-core targets that
    /// never execute from the flash being written.
    fn exclusive<R, F>(&mut self, f: F) -> R
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> R,
    {
        f(self)
    }
}

/// Errors of a [`MappedTransport`].
pub enum MappedError<E> {
    /// The platform routine failed.
    Backend(E),

    /// The access does not fit into the window.
    OutOfRange {
        /// Window-relative start address.
        addr: u32,
        /// Length of the access.
        len: u32,
    },

    /// The window is smaller than one erase sector.
    TooSmall {
        /// Size of the window in bytes.
        size: u32,
    },
}

impl<E: Debug> Debug for MappedError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappedError::Backend(e) => write!(f, "MappedError::Backend({:?})", e),
            MappedError::OutOfRange { addr, len } => {
                write!(f, "MappedError::OutOfRange {{ addr: {:#x}, len: {} }}", addr, len)
            }
            MappedError::TooSmall { size } => write!(f, "MappedError::TooSmall {{ size: {} }}", size),
        }
    }
}

impl<E: Display> Display for MappedError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappedError::Backend(e) => write!(f, "flash backend error: {}", e),
            MappedError::OutOfRange { addr, len } => {
                write!(f, "{} bytes at {:#x} are outside the flash window", len, addr)
            }
            MappedError::TooSmall { size } => write!(f, "flash window of {} bytes is too small", size),
        }
    }
}

#[cfg(feature = "std")]
impl<E: Debug + Display> std::error::Error for MappedError<E> {}

/// Transport over the window `[start, start + size)` of a mapped flash.
///
/// Detect it with the descriptor from [`MappedTransport::device`]:
///
/// ```ignore
/// let transport = MappedTransport::new(backend, 0x10_0000, 0x10_0000);
/// let window = transport.device();
/// let mut flash = Flash::new(transport);
/// flash.begin_with(&[window], &mut delay)?;
/// ```
pub struct MappedTransport<B> {
    backend: B,
    start: u32,
    size: u32,
}

impl<B: MappedFlash> MappedTransport<B> {
    /// Creates a transport for `size` bytes at `start`. Both should be
    /// multiples of the 4 KiB erase sector.
    pub fn new(backend: B, start: u32, size: u32) -> Self {
        Self { backend, start, size }
    }

    /// Describes the window as a flash device answering to [`MAPPED_ID`].
    pub fn device(&self) -> DeviceDescriptor {
        DeviceDescriptor::nor("mapped window", MAPPED_ID.0, self.size, 133).no_fast_read()
    }

    /// Releases the backend.
    pub fn free(self) -> B {
        self.backend
    }

    fn usable(&self) -> Result<(), MappedError<B::Error>> {
        if self.size < SECTOR_SIZE {
            return Err(MappedError::TooSmall { size: self.size });
        }
        Ok(())
    }

    /// Translates a window-relative range into a flash offset.
    fn offset(&self, addr: u32, len: u32) -> Result<u32, MappedError<B::Error>> {
        self.usable()?;
        if u64::from(addr) + u64::from(len) > u64::from(self.size) {
            return Err(MappedError::OutOfRange { addr, len });
        }
        Ok(self.start + addr)
    }

    fn erase_range(&mut self, addr: u32, len: u32) -> Result<(), MappedError<B::Error>> {
        let offset = self.offset(addr, len)?;
        trace!("MappedTransport: erasing {} bytes at {:#08x}", len, offset);
        self.backend
            .exclusive(|flash| flash.erase(offset, len))
            .map_err(MappedError::Backend)
    }
}

impl<B: MappedFlash> Transport for MappedTransport<B> {
    type Error = MappedError<B::Error>;

    fn begin(&mut self) -> Result<(), Self::Error> {
        self.usable()
    }

    // The mapping runs at whatever clock the platform set up.
    fn set_clock_speed(&mut self, _hz: u32) {}

    fn run_command(&mut self, opcode: u8) -> Result<(), Self::Error> {
        self.usable()?;
        if opcode == Opcode::ChipErase as u8 || opcode == Opcode::ChipEraseAlt as u8 {
            self.erase_range(0, self.size)?;
        }
        Ok(())
    }

    fn read_command(&mut self, opcode: u8, response: &mut [u8]) -> Result<(), Self::Error> {
        self.usable()?;
        // Status registers read as idle
        response.iter_mut().for_each(|b| *b = 0);
        if opcode == Opcode::ReadJedecId as u8 {
            for (dst, src) in response.iter_mut().zip(MAPPED_ID.0.iter()) {
                *dst = *src;
            }
        }
        Ok(())
    }

    fn write_command(&mut self, _opcode: u8, _data: &[u8]) -> Result<(), Self::Error> {
        self.usable()
    }

    fn erase_command(&mut self, opcode: u8, addr: u32) -> Result<(), Self::Error> {
        let len = match opcode {
            op if op == Opcode::SectorErase as u8 => SECTOR_SIZE,
            op if op == Opcode::BlockErase as u8 => BLOCK_SIZE,
            _ => return self.usable(),
        };
        self.erase_range(addr - addr % len, len)
    }

    fn read_memory(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        let offset = self.offset(addr, buf.len() as u32)?;
        self.backend.read(offset, buf).map_err(MappedError::Backend)
    }

    fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
        let offset = self.offset(addr, data.len() as u32)?;
        self.backend
            .exclusive(|flash| flash.program(offset, data))
            .map_err(MappedError::Backend)
    }
}

impl<B: Debug> Debug for MappedTransport<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedTransport")
            .field("backend", &self.backend)
            .field("start", &self.start)
            .field("size", &self.size)
            .finish()
    }
}
