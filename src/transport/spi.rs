//! Hardware SPI with a GPIO chip select.

use super::command_header;
use crate::error::BusError;
use crate::flash::Opcode;
use crate::Transport;
use core::fmt::{self, Debug};
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;

/// Transport over an `embedded-hal` SPI master.
///
/// # Type Parameters
///
/// * **`SPI`**: The SPI master to which the flash chip is attached. Must be
///   configured for SPI mode 0 or 3.
/// * **`CS`**: The **C**hip-**S**elect line attached to the `\CS`/`\CE` pin of
///   the flash chip. Driven low for the duration of every command.
pub struct SpiTransport<SPI, CS> {
    spi: SPI,
    cs: CS,
    read_opcode: u8,
    clock_hz: u32,
}

impl<SPI, CS, E> SpiTransport<SPI, CS>
where
    SPI: Transfer<u8, Error = E> + Write<u8, Error = E>,
    CS: OutputPin,
{
    /// Creates a transport. Memory is read with the plain read command
    /// until the controller selects another one.
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self {
            spi,
            cs,
            read_opcode: Opcode::Read as u8,
            clock_hz: 0,
        }
    }

    /// The clock last requested by the controller, in Hz.
    ///
    /// `embedded-hal` has no way to change the SPI clock at runtime, so the
    /// bus is left as it was configured. Use this to reconfigure the master
    /// after detection if the platform allows it.
    pub fn clock_speed(&self) -> u32 {
        self.clock_hz
    }

    /// Releases the SPI master and the chip select pin.
    pub fn free(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    fn transaction<F>(&mut self, f: F) -> Result<(), BusError<E, CS::Error>>
    where
        F: FnOnce(&mut SPI) -> Result<(), E>,
    {
        // If the SPI transfer fails, make sure to disable CS anyways
        self.cs.set_low().map_err(BusError::Gpio)?;
        let spi_result = f(&mut self.spi).map_err(BusError::Spi);
        self.cs.set_high().map_err(BusError::Gpio)?;
        spi_result
    }
}

impl<SPI, CS, E> Transport for SpiTransport<SPI, CS>
where
    SPI: Transfer<u8, Error = E> + Write<u8, Error = E>,
    CS: OutputPin,
    E: Debug,
    CS::Error: Debug,
{
    type Error = BusError<E, CS::Error>;

    fn begin(&mut self) -> Result<(), Self::Error> {
        self.cs.set_high().map_err(BusError::Gpio)
    }

    fn set_clock_speed(&mut self, hz: u32) {
        self.clock_hz = hz;
    }

    fn set_read_opcode(&mut self, opcode: u8) {
        self.read_opcode = opcode;
    }

    fn run_command(&mut self, opcode: u8) -> Result<(), Self::Error> {
        self.transaction(|spi| spi.write(&[opcode]))
    }

    fn read_command(&mut self, opcode: u8, response: &mut [u8]) -> Result<(), Self::Error> {
        response.iter_mut().for_each(|b| *b = 0xFF);
        self.transaction(|spi| {
            spi.write(&[opcode])?;
            spi.transfer(response)?;
            Ok(())
        })
    }

    fn write_command(&mut self, opcode: u8, data: &[u8]) -> Result<(), Self::Error> {
        self.transaction(|spi| {
            spi.write(&[opcode])?;
            spi.write(data)
        })
    }

    fn erase_command(&mut self, opcode: u8, addr: u32) -> Result<(), Self::Error> {
        let header = command_header(opcode, addr);
        self.transaction(|spi| spi.write(&header))
    }

    fn read_memory(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        // Fast read clocks one dummy byte after the address
        let mut header = [0xFF; 5];
        header[..4].copy_from_slice(&command_header(self.read_opcode, addr));
        let len = if self.read_opcode == Opcode::FastRead as u8 { 5 } else { 4 };

        buf.iter_mut().for_each(|b| *b = 0xFF);
        self.transaction(|spi| {
            spi.write(&header[..len])?;
            spi.transfer(buf)?;
            Ok(())
        })
    }

    fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
        let header = command_header(Opcode::PageProgram as u8, addr);
        self.transaction(|spi| {
            spi.write(&header)?;
            spi.write(data)
        })
    }
}

impl<SPI: Debug, CS: Debug> Debug for SpiTransport<SPI, CS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiTransport")
            .field("spi", &self.spi)
            .field("cs", &self.cs)
            .field("read_opcode", &self.read_opcode)
            .field("clock_hz", &self.clock_hz)
            .finish()
    }
}
