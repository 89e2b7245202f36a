//! Driver for 25-series SPI NOR flash and FRAM chips.
//!
//! [`Flash`] owns a [`Transport`] and, once [`Flash::begin`] succeeded, the
//! [`DeviceDescriptor`] of the detected chip. All erase and program
//! operations go through the write-enable / busy-wait dance required by the
//! chip; FRAM parts skip the parts of it that do not apply to them.

use crate::device::{self, DeviceDescriptor, JedecId};
use crate::{Error, Program, Read, Transport};
use bitflags::bitflags;
use core::cmp;
use core::fmt;
use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::digital::v2::OutputPin;

/// Command opcodes understood by serial flash chips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Single line read.
    Read = 0x03,
    /// Read with one dummy byte after the address.
    FastRead = 0x0B,
    /// 1 line address, 4 line data.
    QuadRead = 0x6B,
    /// Read manufacturer ID, memory type and capacity.
    ReadJedecId = 0x9F,
    PageProgram = 0x02,
    /// 1 line address, 4 line data.
    QuadPageProgram = 0x32,
    /// Read the first 8-bit status register.
    ReadStatus = 0x05,
    /// Read the second 8-bit status register.
    ReadStatus2 = 0x35,
    /// Write the status register(s). Not all bits are writeable.
    WriteStatus = 0x01,
    WriteStatus2 = 0x31,
    EnableReset = 0x66,
    Reset = 0x99,
    /// Set the write enable latch.
    WriteEnable = 0x06,
    /// Clear the write enable latch.
    WriteDisable = 0x04,
    SectorErase = 0x20,
    BlockErase = 0xD8,
    ChipErase = 0xC7,
    /// Alternative chip erase opcode used by some families.
    ChipEraseAlt = 0x60,
}

bitflags! {
    /// Status register bits.
    pub struct Status: u8 {
        /// Erase or write in progress.
        const BUSY = 1 << 0;
        /// Status of the **W**rite **E**nable **L**atch.
        const WEL = 1 << 1;
        /// The 3 protection region bits.
        const PROT = 0b00011100;
        /// **S**tatus **R**egister **W**rite **D**isable bit.
        const SRWD = 1 << 7;
    }
}

bitflags! {
    /// Bits of the second status register that the driver looks at.
    ///
    /// The quad enable bit is device specific and comes from the
    /// [`DeviceDescriptor`].
    pub struct Status2: u8 {
        /// An erase or program is suspended.
        const SUS = 1 << 7;
    }
}

/// Tunables of the controller.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Upper bound for the bus clock, in Hz. The device's own limit applies
    /// as well.
    pub max_clock_hz: u32,
    /// Upper bound for the bus clock when talking to FRAM.
    ///
    /// Real boards often cannot reach the part's rated speed.
    pub fram_max_clock_hz: u32,
    /// How long to wait after a software reset, in microseconds.
    pub reset_delay_us: u32,
    /// Called on every iteration of a busy poll.
    pub poll_hook: fn(),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_clock_hz: u32::MAX,
            fram_max_clock_hz: u32::MAX,
            reset_delay_us: 30,
            poll_hook: || {},
        }
    }
}

/// Something to switch on while the chip is being accessed, like an LED.
pub trait Activity {
    /// Marks the start of an access.
    fn on(&mut self);
    /// Marks the end of an access.
    fn off(&mut self);
}

/// No activity indication.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIndicator;

impl Activity for NoIndicator {
    fn on(&mut self) {}
    fn off(&mut self) {}
}

/// An indicator pin driven while the chip is accessed.
#[derive(Debug)]
pub struct Indicator<P> {
    pin: P,
    active_high: bool,
}

impl<P: OutputPin> Indicator<P> {
    /// Wraps `pin` and switches it off.
    pub fn new(pin: P, active_high: bool) -> Self {
        let mut this = Self { pin, active_high };
        this.off();
        this
    }

    /// Releases the pin.
    pub fn free(self) -> P {
        self.pin
    }

    fn set(&mut self, on: bool) {
        // An indicator failure must not fail the flash access.
        let _ = if on == self.active_high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
    }
}

impl<P: OutputPin> Activity for Indicator<P> {
    fn on(&mut self) {
        self.set(true);
    }

    fn off(&mut self) {
        self.set(false);
    }
}

/// Driver for 25-series SPI NOR flash and FRAM chips.
///
/// # Type Parameters
///
/// * **`T`**: The [`Transport`] the chip is attached to.
/// * **`A`**: The [`Activity`] indicator, [`NoIndicator`] by default.
pub struct Flash<T: Transport, A: Activity = NoIndicator> {
    transport: T,
    device: Option<DeviceDescriptor>,
    config: Config,
    activity: A,
}

impl<T: Transport> Flash<T> {
    /// Creates a new driver. No bus traffic happens until [`Flash::begin`].
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            device: None,
            config: Config::default(),
            activity: NoIndicator,
        }
    }

    /// Adds an indicator pin that is driven to `active_high` during every
    /// erase, read and write.
    pub fn with_indicator<P: OutputPin>(self, pin: P, active_high: bool) -> Flash<T, Indicator<P>> {
        Flash {
            transport: self.transport,
            device: self.device,
            config: self.config,
            activity: Indicator::new(pin, active_high),
        }
    }
}

impl<T: Transport, A: Activity> Flash<T, A> {
    /// Replaces the controller configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Detects the chip using the built-in device list.
    ///
    /// See [`Flash::begin_with`].
    pub fn begin<D: DelayUs<u32>>(&mut self, delay: &mut D) -> Result<DeviceDescriptor, Error<T::Error>> {
        self.begin_with(&[], delay)
    }

    /// Reads the JEDEC ID, looks it up in `devices` and then in the built-in
    /// list, and brings the chip into a known state.
    ///
    /// For flash parts this waits out any operation left over from a previous
    /// session, resets the chip, raises the bus clock and enables quad mode
    /// where both the chip and the transport support it. On failure the
    /// driver is left without a device and every later operation fails with
    /// [`Error::NotDetected`].
    pub fn begin_with<D: DelayUs<u32>>(
        &mut self,
        devices: &[DeviceDescriptor],
        delay: &mut D,
    ) -> Result<DeviceDescriptor, Error<T::Error>> {
        self.device = None;
        let result = self.detect(devices, delay);
        if result.is_err() {
            self.device = None;
        }
        result
    }

    fn detect<D: DelayUs<u32>>(
        &mut self,
        devices: &[DeviceDescriptor],
        delay: &mut D,
    ) -> Result<DeviceDescriptor, Error<T::Error>> {
        self.transport.begin()?;

        let id = self.read_jedec_id()?;
        let dev = match device::detect(id, devices) {
            Some(dev) => dev,
            None => {
                warn!("Flash::begin: unknown flash device {}", id);
                return Err(Error::UnknownDevice(id));
            }
        };
        info!("Flash::begin: found {} ({}), {} bytes", dev.name, id, dev.total_size);
        self.device = Some(dev);

        // We don't know what state the chip is in, so wait for any remaining
        // writes and then reset. FRAM has no reset command.
        if !dev.is_fram {
            let mut status = self.read_status()?;
            while status.contains(Status::BUSY) {
                (self.config.poll_hook)();
                status = self.read_status()?;
            }
            // A latch left set by a previous session never clears by itself
            if status.contains(Status::WEL) {
                self.write_disable()?;
            }
            if !dev.single_status_byte {
                while self.read_status2()?.contains(Status2::SUS) {
                    (self.config.poll_hook)();
                }
            }

            self.transport.run_command(Opcode::EnableReset as u8)?;
            self.transport.run_command(Opcode::Reset as u8)?;
            delay.delay_us(self.config.reset_delay_us);
        }

        let host_max = if dev.is_fram {
            cmp::min(self.config.max_clock_hz, self.config.fram_max_clock_hz)
        } else {
            self.config.max_clock_hz
        };
        let clock_hz = cmp::min(dev.max_clock_speed_mhz.saturating_mul(1_000_000), host_max);
        debug!("Flash::begin: clock = {} Hz", clock_hz);
        self.transport.set_clock_speed(clock_hz);

        if !dev.is_fram && dev.supports_qspi && self.transport.supports_quad_mode() {
            self.enable_quad(&dev)?;
            self.transport.set_read_opcode(Opcode::QuadRead as u8);
            if dev.supports_qspi_writes {
                self.transport.set_write_opcode(Opcode::QuadPageProgram as u8);
            }
        } else if dev.supports_fast_read {
            self.transport.set_read_opcode(Opcode::FastRead as u8);
        }

        self.write_disable()?;
        self.wait_until_ready()?;

        Ok(dev)
    }

    fn enable_quad(&mut self, dev: &DeviceDescriptor) -> Result<(), Error<T::Error>> {
        let status = if dev.single_status_byte {
            self.read_register(Opcode::ReadStatus)?
        } else {
            self.read_register(Opcode::ReadStatus2)?
        };
        if status & dev.quad_enable_bit_mask != 0 {
            return Ok(());
        }

        debug!("Flash::begin: setting quad enable bit {:#04x}", dev.quad_enable_bit_mask);
        self.write_enable()?;
        let mask = dev.quad_enable_bit_mask;
        if dev.write_status_register_split {
            self.transport.write_command(Opcode::WriteStatus2 as u8, &[mask])?;
        } else if dev.single_status_byte {
            self.transport.write_command(Opcode::WriteStatus as u8, &[mask])?;
        } else {
            self.transport.write_command(Opcode::WriteStatus as u8, &[0x00, mask])?;
        }
        Ok(())
    }

    /// The detected device, if any.
    pub fn device(&self) -> Option<&DeviceDescriptor> {
        self.device.as_ref()
    }

    fn detected(&self) -> Result<DeviceDescriptor, Error<T::Error>> {
        self.device.ok_or(Error::NotDetected)
    }

    /// Total size of the chip in bytes, or 0 if no chip was detected.
    pub fn size(&self) -> u32 {
        self.device.map_or(0, |dev| dev.total_size)
    }

    /// Page size of the chip in bytes, or 0 if no chip was detected.
    pub fn page_size(&self) -> u32 {
        self.device.map_or(0, |dev| dev.page_size)
    }

    /// Erase sector size of the chip in bytes, or 0 if no chip was detected.
    pub fn sector_size(&self) -> u32 {
        self.device.map_or(0, |dev| dev.sector_size)
    }

    /// Number of pages on the chip, or 0 if no chip was detected.
    pub fn num_pages(&self) -> u32 {
        self.device.map_or(0, |dev| dev.total_size / dev.page_size)
    }

    /// The detected JEDEC ID packed into a `u32`, or [`JedecId::NONE`].
    pub fn jedec_id(&self) -> u32 {
        self.device.map_or(JedecId::NONE, |dev| dev.jedec_id().as_u32())
    }

    /// Reads the JEDEC manufacturer/device identification from the chip.
    pub fn read_jedec_id(&mut self) -> Result<JedecId, Error<T::Error>> {
        let mut buf = [0; 3];
        self.transport.read_command(Opcode::ReadJedecId as u8, &mut buf)?;
        Ok(JedecId(buf))
    }

    fn read_register(&mut self, opcode: Opcode) -> Result<u8, Error<T::Error>> {
        let mut buf = [0];
        self.transport.read_command(opcode as u8, &mut buf)?;
        Ok(buf[0])
    }

    /// Reads the status register.
    pub fn read_status(&mut self) -> Result<Status, Error<T::Error>> {
        Ok(Status::from_bits_truncate(self.read_register(Opcode::ReadStatus)?))
    }

    /// Reads the second status register.
    pub fn read_status2(&mut self) -> Result<Status2, Error<T::Error>> {
        Ok(Status2::from_bits_truncate(self.read_register(Opcode::ReadStatus2)?))
    }

    /// Sets the write enable latch.
    pub fn write_enable(&mut self) -> Result<(), Error<T::Error>> {
        self.transport.run_command(Opcode::WriteEnable as u8)?;
        Ok(())
    }

    /// Clears the write enable latch.
    pub fn write_disable(&mut self) -> Result<(), Error<T::Error>> {
        self.transport.run_command(Opcode::WriteDisable as u8)?;
        Ok(())
    }

    /// Blocks until neither a write is in progress nor the write enable
    /// latch is set.
    ///
    /// There is no timeout; [`Config::poll_hook`] runs on every poll. Returns
    /// immediately for FRAM.
    pub fn wait_until_ready(&mut self) -> Result<(), Error<T::Error>> {
        if self.detected()?.is_fram {
            return Ok(());
        }

        self.poll_ready()?;
        Ok(())
    }

    fn poll_ready(&mut self) -> Result<(), T::Error> {
        let mut status = [0];
        loop {
            self.transport.read_command(Opcode::ReadStatus as u8, &mut status)?;
            if !Status::from_bits_truncate(status[0]).intersects(Status::BUSY | Status::WEL) {
                return Ok(());
            }
            (self.config.poll_hook)();
        }
    }

    fn with_activity<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.activity.on();
        let result = f(self);
        self.activity.off();
        result
    }

    fn erase(&mut self, opcode: Opcode, addr: u32) -> Result<(), Error<T::Error>> {
        if self.detected()?.is_fram {
            return Ok(());
        }

        trace!("Flash::erase: opcode = {:?}, address = {:#08x}", opcode, addr);
        self.with_activity(|this| -> Result<(), Error<T::Error>> {
            // Before we erase we need to wait for any writes to finish
            this.wait_until_ready()?;
            this.write_enable()?;
            this.transport.erase_command(opcode as u8, addr)?;
            Ok(())
        })
    }

    /// Erases sector number `sector`. A no-op for FRAM.
    pub fn erase_sector(&mut self, sector: u32) -> Result<(), Error<T::Error>> {
        let dev = self.detected()?;
        self.erase(Opcode::SectorErase, sector * dev.sector_size)
    }

    /// Erases block number `block`. A no-op for FRAM.
    pub fn erase_block(&mut self, block: u32) -> Result<(), Error<T::Error>> {
        let dev = self.detected()?;
        self.erase(Opcode::BlockErase, block * dev.block_size)
    }

    /// Erases the chip fully. A no-op for FRAM.
    ///
    /// Warning: Full erase operations can take a significant amount of time
    /// and cannot be aborted. Check your device's datasheet for precise
    /// numbers.
    pub fn erase_chip(&mut self) -> Result<(), Error<T::Error>> {
        let dev = self.detected()?;
        if dev.is_fram {
            return Ok(());
        }

        info!("Flash::erase_chip: erasing {} bytes", dev.total_size);
        self.with_activity(|this| -> Result<(), Error<T::Error>> {
            this.wait_until_ready()?;
            this.write_enable()?;
            this.transport.run_command(dev.chip_erase_opcode)?;
            Ok(())
        })
    }

    /// Reads flash contents into `buf`, starting at `addr`, and returns the
    /// number of bytes read.
    ///
    /// Note that `addr` is not fully decoded: Flash chips will typically only
    /// look at the lowest `N` bits needed to encode their size, which means
    /// that the contents are "mirrored" to addresses that are a multiple of
    /// the flash size.
    pub fn read_buffer(&mut self, addr: u32, buf: &mut [u8]) -> Result<usize, Error<T::Error>> {
        self.detected()?;
        if buf.is_empty() {
            return Ok(0);
        }

        trace!("Flash::read_buffer: address = {:#08x}, len = {}", addr, buf.len());
        self.with_activity(|this| -> Result<usize, Error<T::Error>> {
            this.wait_until_ready()?;
            this.transport.read_memory(addr, buf)?;
            Ok(buf.len())
        })
    }

    /// Programs `data` at `addr` and returns the number of bytes written.
    ///
    /// The target range must have been erased. Flash writes are split into
    /// chunks that never cross a page boundary, each preceded by a ready
    /// poll and a write enable. If a chunk fails, the error reports how many
    /// bytes made it before it ([`Error::PartialWrite`]).
    ///
    /// FRAM is written in one go and the write enable latch is cleared
    /// explicitly afterwards, as FRAM does not clear it by itself. If only
    /// that last step fails, the data was written and the error is a plain
    /// [`Error::Transport`].
    pub fn write_buffer(&mut self, addr: u32, data: &[u8]) -> Result<usize, Error<T::Error>> {
        let dev = self.detected()?;
        if data.is_empty() {
            return Ok(0);
        }

        trace!("Flash::write_buffer: address = {:#08x}, len = {}", addr, data.len());
        self.with_activity(|this| -> Result<usize, Error<T::Error>> {
            if dev.is_fram {
                return this.write_fram(addr, data);
            }

            let mut written = 0;
            while written < data.len() {
                let addr = addr + written as u32;
                let left_on_page = (dev.page_size - addr % dev.page_size) as usize;
                let len = cmp::min(data.len() - written, left_on_page);

                if let Err(source) = this.program_page(addr, &data[written..written + len]) {
                    warn!(
                        "Flash::write_buffer: chunk at {:#08x} failed after {} bytes",
                        addr, written
                    );
                    return Err(Error::PartialWrite { written, source });
                }
                written += len;
            }
            Ok(written)
        })
    }

    fn program_page(&mut self, addr: u32, chunk: &[u8]) -> Result<(), T::Error> {
        self.poll_ready()?;
        self.transport.run_command(Opcode::WriteEnable as u8)?;
        self.transport.write_memory(addr, chunk)
    }

    fn write_fram(&mut self, addr: u32, data: &[u8]) -> Result<usize, Error<T::Error>> {
        let written = self
            .transport
            .run_command(Opcode::WriteEnable as u8)
            .and_then(|()| self.transport.write_memory(addr, data));
        let disabled = self.transport.run_command(Opcode::WriteDisable as u8);

        match (written, disabled) {
            (Err(source), _) => Err(Error::PartialWrite { written: 0, source }),
            // The data is in place, only the latch is left set
            (Ok(()), Err(e)) => Err(Error::Transport(e)),
            (Ok(()), Ok(())) => Ok(data.len()),
        }
    }

    /// Reads one byte.
    pub fn read8(&mut self, addr: u32) -> Result<u8, Error<T::Error>> {
        let mut buf = [0; 1];
        self.read_buffer(addr, &mut buf)?;
        Ok(buf[0])
    }

    /// Reads a little-endian `u16`.
    pub fn read16(&mut self, addr: u32) -> Result<u16, Error<T::Error>> {
        let mut buf = [0; 2];
        self.read_buffer(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a little-endian `u32`.
    pub fn read32(&mut self, addr: u32) -> Result<u32, Error<T::Error>> {
        let mut buf = [0; 4];
        self.read_buffer(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Gives access to the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Gives mutable access to the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Releases the transport.
    pub fn free(self) -> T {
        self.transport
    }
}

impl<T: Transport + fmt::Debug, A: Activity + fmt::Debug> fmt::Debug for Flash<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flash")
            .field("transport", &self.transport)
            .field("device", &self.device.map(|dev| dev.name))
            .field("activity", &self.activity)
            .finish()
    }
}

impl<T: Transport, A: Activity> Read for Flash<T, A> {
    type Error = Error<T::Error>;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.read_buffer(addr, buf).map(drop)
    }
}

impl<T: Transport, A: Activity> Program for Flash<T, A> {
    fn capacity(&self) -> u32 {
        self.size()
    }

    fn sector_size(&self) -> u32 {
        Flash::sector_size(self)
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), Self::Error> {
        Flash::erase_sector(self, sector)
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
        self.write_buffer(addr, data).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{GD25Q16C, MB85RS2MTA, MX25R1635F, S25FL116K, W25Q64JV_IQ};
    use crate::sim::{Op, SimDelay, SimError, SimFlash};
    use core::convert::Infallible;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detected(sim: SimFlash) -> Flash<SimFlash> {
        let mut flash = Flash::new(sim);
        flash.begin(&mut SimDelay::default()).unwrap();
        flash.transport_mut().clear_log();
        flash
    }

    #[test]
    fn test_begin_detects_known_device() {
        let mut delay = SimDelay::default();
        let mut flash = Flash::new(SimFlash::with_id([0xC2, 0x28, 0x15], 2 * 1024 * 1024));
        let dev = flash.begin(&mut delay).unwrap();

        assert_eq!(dev.name, "MX25R1635F");
        assert_eq!(flash.size(), 2 * 1024 * 1024);
        assert_eq!(flash.page_size(), 256);
        assert_eq!(flash.num_pages(), 8192);
        assert_eq!(flash.jedec_id(), 0xC22815);
        assert_eq!(delay.total_us, 30);

        let sim = flash.transport();
        assert_eq!(sim.clock_hz(), 8_000_000);
        // Not a quad bus, so fast read is used instead
        assert_eq!(sim.read_opcode(), Opcode::FastRead as u8);
        let reset = [Op::Command(Opcode::EnableReset as u8), Op::Command(Opcode::Reset as u8)];
        assert!(sim.log().windows(2).any(|w| w == reset));
        assert_eq!(sim.log().last(), Some(&Op::ReadCommand(Opcode::ReadStatus as u8)));
    }

    #[test]
    fn test_begin_rejects_unknown_device() {
        let mut flash = Flash::new(SimFlash::with_id([0xFF, 0xFF, 0xFF], 2 * 1024 * 1024));
        match flash.begin(&mut SimDelay::default()) {
            Err(Error::UnknownDevice(id)) => assert_eq!(id, JedecId([0xFF, 0xFF, 0xFF])),
            other => panic!("unexpected result {:?}", other),
        }

        assert_eq!(flash.size(), 0);
        assert_eq!(flash.num_pages(), 0);
        assert_eq!(flash.jedec_id(), JedecId::NONE);
        assert!(flash.device().is_none());

        let mut buf = [0; 4];
        assert!(matches!(flash.read_buffer(0, &mut buf), Err(Error::NotDetected)));
        assert!(matches!(flash.write_buffer(0, &buf), Err(Error::NotDetected)));
        assert!(matches!(flash.erase_sector(0), Err(Error::NotDetected)));
        assert!(matches!(flash.erase_chip(), Err(Error::NotDetected)));
        // Nothing but the ID query reached the bus
        assert!(flash
            .transport()
            .log()
            .iter()
            .all(|op| *op == Op::ReadCommand(Opcode::ReadJedecId as u8)));
    }

    #[test]
    fn test_begin_with_override_list() {
        let custom = DeviceDescriptor::nor("custom", [0xC2, 0x28, 0x15], 1024 * 1024, 50);
        let mut flash = Flash::new(SimFlash::with_id([0xC2, 0x28, 0x15], 2 * 1024 * 1024))
            .with_config(Config {
                max_clock_hz: 24_000_000,
                ..Config::default()
            });
        flash.begin_with(&[custom], &mut SimDelay::default()).unwrap();
        assert_eq!(flash.size(), 1024 * 1024);
        assert_eq!(flash.transport().clock_hz(), 24_000_000);
    }

    #[test]
    fn test_begin_enables_quad_mode() {
        let mut flash = Flash::new(SimFlash::new(&GD25Q16C).quad_capable());
        flash.begin(&mut SimDelay::default()).unwrap();

        let sim = flash.transport();
        assert_eq!(sim.status2(), 0x02);
        assert_eq!(sim.read_opcode(), Opcode::QuadRead as u8);
        assert_eq!(sim.write_opcode(), Opcode::QuadPageProgram as u8);
        assert!(sim
            .log()
            .contains(&Op::WriteCommand(Opcode::WriteStatus as u8, vec![0x00, 0x02])));

        // Already enabled, so a second detection leaves the register alone
        flash.transport_mut().clear_log();
        flash.begin(&mut SimDelay::default()).unwrap();
        assert!(!flash
            .transport()
            .log()
            .iter()
            .any(|op| matches!(op, Op::WriteCommand(..))));
    }

    #[test]
    fn test_quad_reads_without_quad_writes() {
        let mut flash = Flash::new(SimFlash::new(&S25FL116K).quad_capable());
        flash.begin(&mut SimDelay::default()).unwrap();
        assert_eq!(flash.transport().read_opcode(), Opcode::QuadRead as u8);
        assert_eq!(flash.transport().write_opcode(), Opcode::PageProgram as u8);
    }

    #[test]
    fn test_begin_enables_quad_mode_split_register() {
        let mut flash = Flash::new(SimFlash::new(&W25Q64JV_IQ).quad_capable());
        flash.begin(&mut SimDelay::default()).unwrap();
        assert_eq!(flash.transport().status2(), 0x02);
        assert!(flash
            .transport()
            .log()
            .contains(&Op::WriteCommand(Opcode::WriteStatus2 as u8, vec![0x02])));
    }

    #[test]
    fn test_begin_enables_quad_mode_single_status() {
        let mut flash = Flash::new(SimFlash::new(&MX25R1635F).quad_capable());
        flash.begin(&mut SimDelay::default()).unwrap();
        assert_eq!(flash.transport().status(), 0x40);
        assert!(flash
            .transport()
            .log()
            .contains(&Op::WriteCommand(Opcode::WriteStatus as u8, vec![0x40])));
    }

    #[test]
    fn test_begin_recovers_stale_session() {
        let mut sim = SimFlash::new(&GD25Q16C);
        sim.set_status(Status::WEL.bits(), 0);
        let mut flash = Flash::new(sim);
        flash.begin(&mut SimDelay::default()).unwrap();
        assert_eq!(flash.read_status().unwrap(), Status::empty());
    }

    #[test]
    fn test_begin_waits_for_suspend() {
        let mut flash = Flash::new(SimFlash::new(&GD25Q16C).suspended(3));
        flash.begin(&mut SimDelay::default()).unwrap();

        let log = flash.transport().log();
        let reset = log
            .iter()
            .position(|op| *op == Op::Command(Opcode::EnableReset as u8))
            .unwrap();
        let polls: Vec<usize> = log
            .iter()
            .enumerate()
            .filter(|(_, op)| **op == Op::ReadCommand(Opcode::ReadStatus2 as u8))
            .map(|(i, _)| i)
            .collect();
        // Three suspended answers, then one clear one
        assert_eq!(polls.len(), 4);
        assert!(polls.iter().all(|&i| i < reset));

        // Single status byte parts have no suspend bit to wait for
        let mut flash = Flash::new(SimFlash::new(&MX25R1635F).suspended(3));
        flash.begin(&mut SimDelay::default()).unwrap();
        assert!(!flash
            .transport()
            .log()
            .contains(&Op::ReadCommand(Opcode::ReadStatus2 as u8)));
    }

    #[test]
    fn test_write_buffer_splits_at_page_boundary() {
        let mut flash = detected(SimFlash::new(&GD25Q16C));
        let data: Vec<u8> = (0..266).map(|i| i as u8).collect();
        let addr = 3 * 256 - 10;

        assert_eq!(flash.write_buffer(addr, &data).unwrap(), 266);
        assert_eq!(flash.transport().programs(), vec![(addr, 10), (addr + 10, 256)]);

        let mut back = vec![0; 266];
        assert_eq!(flash.read_buffer(addr, &mut back).unwrap(), 266);
        assert_eq!(back, data);
    }

    #[test]
    fn test_write_buffer_reports_partial_write() {
        let mut flash = detected(SimFlash::new(&GD25Q16C));
        flash.transport_mut().fail_program(1);

        let err = flash.write_buffer(0, &[0x55; 600]).unwrap_err();
        assert!(matches!(err, Error::PartialWrite { written: 256, .. }));
        assert_eq!(err.written(), 256);
        assert!(flash.transport().memory()[..256].iter().all(|&b| b == 0x55));
        assert!(flash.transport().memory()[256..600].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_erase_sector_and_block() {
        let mut flash = detected(SimFlash::new(&GD25Q16C));
        flash.transport_mut().memory_mut()[..0x20000].iter_mut().for_each(|b| *b = 0);

        flash.erase_sector(2).unwrap();
        flash.erase_block(1).unwrap();
        assert_eq!(
            flash.transport().erases(),
            vec![
                (Opcode::SectorErase as u8, 2 * 4096),
                (Opcode::BlockErase as u8, 0x10000)
            ]
        );

        let mem = flash.transport().memory();
        assert!(mem[0x2000..0x3000].iter().all(|&b| b == 0xFF));
        assert!(mem[0x10000..0x20000].iter().all(|&b| b == 0xFF));
        assert_eq!(mem[0x1FFF], 0);
        assert_eq!(mem[0x3000], 0);
    }

    #[test]
    fn test_erase_chip_uses_device_opcode() {
        let mut flash = detected(SimFlash::new(&MX25R1635F));
        flash.transport_mut().memory_mut()[12345] = 0;
        flash.erase_chip().unwrap();

        assert!(flash.transport().log().contains(&Op::Command(0x60)));
        assert!(flash.transport().memory().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_fram_skips_erase_and_paging() {
        let mut flash = Flash::new(SimFlash::new(&MB85RS2MTA)).with_config(Config {
            fram_max_clock_hz: 16_000_000,
            ..Config::default()
        });
        flash.begin(&mut SimDelay::default()).unwrap();
        assert_eq!(flash.transport().clock_hz(), 16_000_000);
        assert!(!flash.transport().log().contains(&Op::Command(Opcode::Reset as u8)));
        flash.transport_mut().clear_log();

        let data = [0x12; 1000];
        assert_eq!(flash.write_buffer(100, &data).unwrap(), 1000);
        assert_eq!(flash.transport().programs(), vec![(100, 1000)]);
        assert_eq!(flash.transport().status() & Status::WEL.bits(), 0);
        assert_eq!(flash.transport().log().last(), Some(&Op::Command(Opcode::WriteDisable as u8)));

        // FRAM overwrites in place
        flash.write_buffer(100, &[0x34]).unwrap();
        assert_eq!(flash.read8(100).unwrap(), 0x34);

        flash.erase_sector(0).unwrap();
        flash.erase_chip().unwrap();
        assert!(flash.transport().erases().is_empty());
        assert_eq!(flash.read8(101).unwrap(), 0x12);
    }

    #[test]
    fn test_fram_write_errors() {
        let mut flash = detected(SimFlash::new(&MB85RS2MTA));

        // Only clearing the latch failed, so all bytes are in place
        flash.transport_mut().fail_command(Opcode::WriteDisable as u8);
        let err = flash.write_buffer(0, &[0xAB; 32]).unwrap_err();
        assert!(matches!(err, Error::Transport(SimError::Injected)));
        assert!(flash.transport().memory()[..32].iter().all(|&b| b == 0xAB));

        // A failed transfer still clears the latch
        flash.transport_mut().clear_log();
        flash.transport_mut().fail_program(0);
        let err = flash.write_buffer(64, &[0xCD; 8]).unwrap_err();
        assert!(matches!(err, Error::PartialWrite { written: 0, .. }));
        assert_eq!(flash.transport().log().last(), Some(&Op::Command(Opcode::WriteDisable as u8)));
        assert_eq!(flash.transport().memory()[64], 0xFF);
    }

    #[test]
    fn test_read_helpers_are_little_endian() {
        let mut flash = detected(SimFlash::new(&GD25Q16C));
        flash.transport_mut().memory_mut()[16..20].copy_from_slice(&[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(flash.read8(16).unwrap(), 0x78);
        assert_eq!(flash.read16(16).unwrap(), 0x5678);
        assert_eq!(flash.read32(16).unwrap(), 0x12345678);
    }

    static POLLS: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn test_poll_hook_runs_while_busy() {
        let mut flash = Flash::new(SimFlash::new(&GD25Q16C).busy_cycles(5)).with_config(Config {
            poll_hook: || {
                POLLS.fetch_add(1, Ordering::Relaxed);
            },
            ..Config::default()
        });
        flash.begin(&mut SimDelay::default()).unwrap();
        let before = POLLS.load(Ordering::Relaxed);

        flash.erase_sector(0).unwrap();
        flash.wait_until_ready().unwrap();
        assert_eq!(POLLS.load(Ordering::Relaxed) - before, 5);
    }

    #[derive(Debug, Clone, Default)]
    struct Led(Rc<RefCell<Vec<bool>>>);

    impl OutputPin for Led {
        type Error = Infallible;

        fn set_low(&mut self) -> Result<(), Infallible> {
            self.0.borrow_mut().push(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.0.borrow_mut().push(true);
            Ok(())
        }
    }

    #[test]
    fn test_indicator_follows_accesses() {
        let led = Led::default();
        let mut flash = Flash::new(SimFlash::new(&GD25Q16C)).with_indicator(led.clone(), false);
        flash.begin(&mut SimDelay::default()).unwrap();
        // Active low, so "off" is high
        assert_eq!(*led.0.borrow(), vec![true]);

        flash.read8(0).unwrap();
        flash.write_buffer(0, &[1, 2]).unwrap();
        assert_eq!(*led.0.borrow(), vec![true, false, true, false, true]);
    }
}
