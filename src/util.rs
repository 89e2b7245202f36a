//! Command line access to a serial flash chip on a Linux spidev bus.

use std::error::Error as StdError;
use std::fmt::Display;

use log::{error, info, warn};

use structopt::StructOpt;

pub use linux_embedded_hal::sysfs_gpio::Direction;
pub use linux_embedded_hal::{spidev, spidev::SpiModeFlags, Delay, Pin as Pindev, Spidev};

use simplelog::{LevelFilter, TermLogger, TerminalMode};

use ihex::{Reader, Record};

use serial_flash::device::GD25Q16C;
use serial_flash::disk::FlashDisk;
use serial_flash::flash::{Config, Flash};
use serial_flash::sim::SimFlash;
use serial_flash::transport::SpiTransport;
use serial_flash::Transport;

/// Longest data record written to dump files.
const RECORD_LEN: u32 = 32;

#[derive(Debug, PartialEq, StructOpt)]
struct Options {
    #[structopt(subcommand)]
    operation: Operations,

    /// SPI device
    #[structopt(long, default_value = "/dev/spidev0.0", env = "SPI_DEV")]
    spi_dev: String,

    /// SPI baud rate, also the upper limit for the negotiated flash clock
    #[structopt(long, default_value = "1000000", env = "SPI_BAUD")]
    spi_baud: u32,

    /// Chip Select (output) pin
    #[structopt(long, default_value = "8", env = "CS_PIN")]
    cs_pin: u64,

    /// Configure log level
    #[structopt(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: LevelFilter,

    /// Run against an emulated chip instead of the SPI bus
    #[structopt(long)]
    sim: bool,
}

#[derive(Debug, PartialEq, StructOpt)]
pub enum Operations {
    /// Read device information
    Info,
    /// Read data from the device
    Read {
        /// Flash address for read start in hex
        #[structopt(parse(try_from_str = parse_hex))]
        address: u32,
        /// Length of flash read in bytes
        #[structopt()]
        length: u32,
    },
    /// Write data at the specified address, erasing as needed
    Write {
        /// Flash address for write start in hex
        #[structopt(parse(try_from_str = parse_hex))]
        address: u32,

        /// Data to write in hexadecimal
        #[structopt(long)]
        data: HexData,
    },
    /// Erase sector(s) starting at the sector containing the address
    EraseSectors {
        /// Flash address for sector erase in hex
        #[structopt(parse(try_from_str = parse_hex))]
        address: u32,

        /// Number of sectors to erase
        #[structopt(long, default_value = "1")]
        count: u32,
    },
    /// Dump flash into a hex file
    Dump {
        /// Flash address for read start in hex
        #[structopt(parse(try_from_str = parse_hex))]
        address: u32,

        /// Length of flash read in bytes
        #[structopt()]
        length: u32,

        /// Output ihex file
        #[structopt(long, default_value = "dump.ihex")]
        file: String,
    },
    /// Load flash from a hex file, erasing as needed
    Load {
        /// Input ihex file
        file: String,
    },
    /// Erase all data on the device
    EraseAll,
}

#[derive(Debug, PartialEq)]
pub struct HexData(Vec<u8>);

impl std::str::FromStr for HexData {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex::decode(s).map(HexData)
    }
}

fn parse_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u32::from_str_radix(digits, 16)
}

fn main() -> Result<(), Box<dyn StdError + 'static>> {
    // Load options
    let opts = Options::from_args();

    // Setup logging
    TermLogger::init(opts.log_level, simplelog::Config::default(), TerminalMode::Mixed)?;

    let config = Config {
        max_clock_hz: opts.spi_baud,
        ..Config::default()
    };

    if opts.sim {
        info!("Using an emulated {}", GD25Q16C.name);
        return run(SimFlash::new(&GD25Q16C), config, &opts.operation);
    }

    // Connect and configure GPIO pin
    let cs_pin = Pindev::new(opts.cs_pin);
    cs_pin.export()?;
    cs_pin.set_direction(Direction::Out)?;

    // Connect and configure SPI device
    let mut spi = Spidev::open(&opts.spi_dev)?;

    let mut spi_config = spidev::SpidevOptions::new();
    spi_config.mode(SpiModeFlags::SPI_MODE_0 | SpiModeFlags::SPI_NO_CS);
    spi_config.max_speed_hz(opts.spi_baud);
    spi.configure(&spi_config)?;

    run(SpiTransport::new(spi, cs_pin), config, &opts.operation)
}

fn run<T>(transport: T, config: Config, operation: &Operations) -> Result<(), Box<dyn StdError + 'static>>
where
    T: Transport,
    T::Error: Display + 'static,
{
    let mut flash = Flash::new(transport).with_config(config);

    // Detect the chip to check we are connected
    let dev = match flash.begin(&mut Delay) {
        Ok(dev) => dev,
        Err(e) => {
            error!("Error initialising flash: {}", e);
            return Err(e.into());
        }
    };

    match operation {
        Operations::Info => {
            info!("Device: {}", dev.name);
            info!("JEDEC ID: {:?}", dev.jedec_id());
            info!(
                "Size: {} bytes, {} byte pages, {} byte sectors, {} byte blocks",
                dev.total_size, dev.page_size, dev.sector_size, dev.block_size
            );
            info!("Max clock: {} MHz", dev.max_clock_speed_mhz);
            info!(
                "FRAM: {}, fast read: {}, quad: {}",
                dev.is_fram, dev.supports_fast_read, dev.supports_qspi
            );
            info!("Status: {:?}", flash.read_status()?);
        }
        Operations::Read { address, length } => {
            info!("Reading {} bytes from address 0x{:08x}", length, address);

            let mut buff = vec![0u8; *length as usize];
            flash.read_buffer(*address, &mut buff)?;

            info!("Read: {:02x?}", buff);
        }
        Operations::Write { address, data } => {
            info!("Writing {} bytes to address 0x{:08x}", data.0.len(), address);

            let mut disk = FlashDisk::new(flash)?;
            disk.write(*address, &data.0)?;
            disk.sync()?;

            info!("Write complete");
        }
        Operations::EraseSectors { address, count } => {
            let first = address / dev.sector_size;
            info!(
                "Erasing {} sectors at address 0x{:08x}",
                count,
                first * dev.sector_size
            );

            for sector in first..first + count {
                flash.erase_sector(sector)?;
            }
            flash.wait_until_ready()?;

            info!("Sector erase complete")
        }
        Operations::EraseAll => {
            info!("Erasing all sectors");

            flash.erase_chip()?;
            flash.wait_until_ready()?;

            info!("Full erase complete");
        }
        Operations::Dump { address, length, file } => {
            info!("Reading {} bytes from address 0x{:08x} to file {}", length, address, file);

            let mut buff = vec![0u8; *length as usize];
            flash.read_buffer(*address, &mut buff)?;

            let records = dump_records(*address, &buff);
            let data = ihex::create_object_file_representation(&records).map_err(|e| format!("{:?}", e))?;
            std::fs::write(file, data)?;

            info!("Dump complete");
        }
        Operations::Load { file } => {
            info!("Loading file {}", file);

            let data = std::fs::read_to_string(file)?;
            let mut disk = FlashDisk::new(flash)?;
            let mut base = 0u32;

            for record in Reader::new(&data) {
                match record {
                    Ok(Record::Data { offset, value }) => {
                        let address = base + u32::from(offset);
                        info!("Writing {} bytes at address 0x{:08x}", value.len(), address);
                        disk.write(address, &value)?;
                    }
                    Ok(Record::ExtendedLinearAddress(upper)) => base = u32::from(upper) << 16,
                    Ok(Record::ExtendedSegmentAddress(segment)) => base = u32::from(segment) << 4,
                    Ok(Record::EndOfFile) => break,
                    Ok(record) => warn!("Ignoring record: {:?}", record),
                    Err(e) => {
                        error!("Reader error: {:?}", e);
                        return Err(format!("{:?}", e).into());
                    }
                }
            }
            disk.sync()?;

            info!("Load complete");
        }
    }

    Ok(())
}

/// Builds the ihex records for `data` read at `address`, switching the upper
/// address half with extended linear address records as needed.
fn dump_records(address: u32, data: &[u8]) -> Vec<Record> {
    let mut records = Vec::new();
    let mut upper = None;
    let mut pos = 0;

    while pos < data.len() {
        let addr = address + pos as u32;
        if upper != Some(addr >> 16) {
            upper = Some(addr >> 16);
            records.push(Record::ExtendedLinearAddress((addr >> 16) as u16));
        }

        // Records must not wrap around the 64 KiB segment
        let to_segment_end = 0x1_0000 - (addr & 0xFFFF);
        let len = RECORD_LEN.min(to_segment_end) as usize;
        let len = len.min(data.len() - pos);

        records.push(Record::Data {
            offset: addr as u16,
            value: data[pos..pos + len].to_vec(),
        });
        pos += len;
    }
    records.push(Record::EndOfFile);
    records
}
