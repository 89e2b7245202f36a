//! Software SPI over plain GPIO pins.

use super::command_header;
use crate::flash::Opcode;
use crate::Transport;
use core::cmp;
use core::fmt::{self, Debug};
use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::digital::v2::{InputPin, OutputPin};

/// Transport that clocks SPI mode 0, MSB first, by toggling GPIO pins.
///
/// Useful on boards where the flash chip is not wired to an SPI peripheral.
/// The bus clock is approximated with a delay of half a clock period on
/// each edge, so the real rate is always somewhat below the requested one.
pub struct BitBangTransport<SCK, MOSI, MISO, CS, D> {
    sck: SCK,
    mosi: MOSI,
    miso: MISO,
    cs: CS,
    delay: D,
    half_period_us: u32,
    read_opcode: u8,
}

impl<SCK, MOSI, MISO, CS, D, E> BitBangTransport<SCK, MOSI, MISO, CS, D>
where
    SCK: OutputPin<Error = E>,
    MOSI: OutputPin<Error = E>,
    MISO: InputPin<Error = E>,
    CS: OutputPin<Error = E>,
    D: DelayUs<u32>,
{
    /// Creates a transport clocking at most 500 kHz until the controller
    /// raises the clock.
    pub fn new(sck: SCK, mosi: MOSI, miso: MISO, cs: CS, delay: D) -> Self {
        Self {
            sck,
            mosi,
            miso,
            cs,
            delay,
            half_period_us: 1,
            read_opcode: Opcode::Read as u8,
        }
    }

    /// Releases the pins and the delay.
    pub fn free(self) -> (SCK, MOSI, MISO, CS, D) {
        (self.sck, self.mosi, self.miso, self.cs, self.delay)
    }

    /// Delay applied on each clock edge, in microseconds.
    pub fn half_period_us(&self) -> u32 {
        self.half_period_us
    }

    fn transfer_byte(&mut self, out: u8) -> Result<u8, E> {
        let mut input = 0;
        for bit in (0..8).rev() {
            if out & (1 << bit) != 0 {
                self.mosi.set_high()?;
            } else {
                self.mosi.set_low()?;
            }
            self.delay.delay_us(self.half_period_us);
            self.sck.set_high()?;
            if self.miso.is_high()? {
                input |= 1 << bit;
            }
            self.delay.delay_us(self.half_period_us);
            self.sck.set_low()?;
        }
        Ok(input)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), E> {
        for &byte in bytes {
            self.transfer_byte(byte)?;
        }
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), E> {
        for byte in buf.iter_mut() {
            *byte = self.transfer_byte(0xFF)?;
        }
        Ok(())
    }

    fn transaction<F>(&mut self, f: F) -> Result<(), E>
    where
        F: FnOnce(&mut Self) -> Result<(), E>,
    {
        self.cs.set_low()?;
        let result = f(self);
        self.sck.set_low()?;
        self.cs.set_high()?;
        result
    }
}

impl<SCK, MOSI, MISO, CS, D, E> Transport for BitBangTransport<SCK, MOSI, MISO, CS, D>
where
    SCK: OutputPin<Error = E>,
    MOSI: OutputPin<Error = E>,
    MISO: InputPin<Error = E>,
    CS: OutputPin<Error = E>,
    D: DelayUs<u32>,
    E: Debug,
{
    type Error = E;

    fn begin(&mut self) -> Result<(), E> {
        self.sck.set_low()?;
        self.cs.set_high()
    }

    fn set_clock_speed(&mut self, hz: u32) {
        self.half_period_us = cmp::max(500_000 / cmp::max(hz, 1), 1);
        debug!("BitBangTransport: half period = {} us", self.half_period_us);
    }

    fn set_read_opcode(&mut self, opcode: u8) {
        self.read_opcode = opcode;
    }

    fn run_command(&mut self, opcode: u8) -> Result<(), E> {
        self.transaction(|this| this.write_bytes(&[opcode]))
    }

    fn read_command(&mut self, opcode: u8, response: &mut [u8]) -> Result<(), E> {
        self.transaction(|this| {
            this.write_bytes(&[opcode])?;
            this.read_bytes(response)
        })
    }

    fn write_command(&mut self, opcode: u8, data: &[u8]) -> Result<(), E> {
        self.transaction(|this| {
            this.write_bytes(&[opcode])?;
            this.write_bytes(data)
        })
    }

    fn erase_command(&mut self, opcode: u8, addr: u32) -> Result<(), E> {
        self.transaction(|this| this.write_bytes(&command_header(opcode, addr)))
    }

    fn read_memory(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), E> {
        let fast = self.read_opcode == Opcode::FastRead as u8;
        let header = command_header(self.read_opcode, addr);
        self.transaction(|this| {
            this.write_bytes(&header)?;
            if fast {
                this.write_bytes(&[0xFF])?;
            }
            this.read_bytes(buf)
        })
    }

    fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<(), E> {
        let header = command_header(Opcode::PageProgram as u8, addr);
        self.transaction(|this| {
            this.write_bytes(&header)?;
            this.write_bytes(data)
        })
    }
}

impl<SCK, MOSI, MISO, CS, D> Debug for BitBangTransport<SCK, MOSI, MISO, CS, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitBangTransport")
            .field("half_period_us", &self.half_period_us)
            .field("read_opcode", &self.read_opcode)
            .finish()
    }
}
