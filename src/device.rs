//! Known flash and FRAM devices, and detection by JEDEC ID.

use crate::utils::HexSlice;
use core::fmt;

/// 3-Byte JEDEC manufacturer and device identification.
///
/// - The first byte is the manufacturer's ID code from eg JEDEC Publication
///   No. 106AJ.
/// - The trailing bytes are the manufacturer-specific memory type and
///   capacity codes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct JedecId(pub [u8; 3]);

impl JedecId {
    /// Packed ID reported when no device has been detected.
    pub const NONE: u32 = 0xFF_FFFF;

    /// The JEDEC manufacturer code for this chip.
    pub fn mfr_code(&self) -> u8 {
        self.0[0]
    }

    /// The memory type code.
    pub fn memory_type(&self) -> u8 {
        self.0[1]
    }

    /// The capacity code.
    pub fn capacity(&self) -> u8 {
        self.0[2]
    }

    /// The ID packed big-endian into the low 24 bits of a `u32`.
    pub fn as_u32(&self) -> u32 {
        u32::from(self.0[0]) << 16 | u32::from(self.0[1]) << 8 | u32::from(self.0[2])
    }
}

impl fmt::Debug for JedecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JedecId").field(&HexSlice(self.0)).finish()
    }
}

impl fmt::Display for JedecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:06X}", self.as_u32())
    }
}

/// Geometry and capabilities of one flash part.
///
/// Descriptors are plain constants; build them with [`DeviceDescriptor::nor`]
/// or [`DeviceDescriptor::fram`] and the `const` adjusters below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Part name, for diagnostics.
    pub name: &'static str,
    /// JEDEC manufacturer ID.
    pub manufacturer_id: u8,
    /// JEDEC memory type.
    pub memory_type: u8,
    /// JEDEC capacity code.
    pub capacity: u8,
    /// Total size in bytes.
    pub total_size: u32,
    /// Program granularity in bytes. A single program command must not
    /// cross a page boundary.
    pub page_size: u32,
    /// Size of the unit erased by sector erase (`0x20`).
    pub sector_size: u32,
    /// Size of the unit erased by block erase (`0xD8`).
    pub block_size: u32,
    /// Highest supported bus clock, in MHz.
    pub max_clock_speed_mhz: u32,
    /// Bit of the (second) status register that enables quad mode.
    pub quad_enable_bit_mask: u8,
    /// The device understands fast read (`0x0B`).
    pub supports_fast_read: bool,
    /// The device can read over four data lines.
    pub supports_qspi: bool,
    /// The device can program over four data lines.
    pub supports_qspi_writes: bool,
    /// The second status register is written with its own opcode (`0x31`).
    pub write_status_register_split: bool,
    /// The device only has one status register.
    pub single_status_byte: bool,
    /// Ferroelectric RAM: no erase, no pages, never busy.
    pub is_fram: bool,
    /// Opcode that erases the whole chip (`0xC7` or `0x60`).
    pub chip_erase_opcode: u8,
}

impl DeviceDescriptor {
    /// A NOR flash part with 256 byte pages, 4 KiB sectors and 64 KiB
    /// blocks, two status registers and fast read support.
    pub const fn nor(name: &'static str, id: [u8; 3], total_size: u32, max_clock_speed_mhz: u32) -> Self {
        Self {
            name,
            manufacturer_id: id[0],
            memory_type: id[1],
            capacity: id[2],
            total_size,
            page_size: 256,
            sector_size: 4096,
            block_size: 65536,
            max_clock_speed_mhz,
            quad_enable_bit_mask: 0x00,
            supports_fast_read: true,
            supports_qspi: false,
            supports_qspi_writes: false,
            write_status_register_split: false,
            single_status_byte: false,
            is_fram: false,
            chip_erase_opcode: 0xC7,
        }
    }

    /// A FRAM part. Only the single status register is used.
    pub const fn fram(name: &'static str, id: [u8; 3], total_size: u32, max_clock_speed_mhz: u32) -> Self {
        Self {
            supports_fast_read: false,
            single_status_byte: true,
            is_fram: true,
            ..Self::nor(name, id, total_size, max_clock_speed_mhz)
        }
    }

    /// Marks the part as quad capable, enabled through `mask`.
    pub const fn quad(self, mask: u8, writes: bool) -> Self {
        Self {
            quad_enable_bit_mask: mask,
            supports_qspi: true,
            supports_qspi_writes: writes,
            ..self
        }
    }

    /// The second status register has its own write opcode.
    pub const fn split_status(self) -> Self {
        Self {
            write_status_register_split: true,
            ..self
        }
    }

    /// The part has a single status register.
    pub const fn single_status(self) -> Self {
        Self {
            single_status_byte: true,
            ..self
        }
    }

    /// The part does not support fast read.
    pub const fn no_fast_read(self) -> Self {
        Self {
            supports_fast_read: false,
            ..self
        }
    }

    /// Overrides the chip erase opcode.
    pub const fn chip_erase(self, opcode: u8) -> Self {
        Self {
            chip_erase_opcode: opcode,
            ..self
        }
    }

    /// Overrides the page, sector and block sizes.
    pub const fn geometry(self, page_size: u32, sector_size: u32, block_size: u32) -> Self {
        Self {
            page_size,
            sector_size,
            block_size,
            ..self
        }
    }

    /// The JEDEC triplet this descriptor matches.
    pub fn jedec_id(&self) -> JedecId {
        JedecId([self.manufacturer_id, self.memory_type, self.capacity])
    }
}

const MIB: u32 = 1024 * 1024;
const KIB: u32 = 1024;

/// GigaDevice GD25Q16C, 2 MiB.
pub const GD25Q16C: DeviceDescriptor =
    DeviceDescriptor::nor("GD25Q16C", [0xC8, 0x40, 0x15], 2 * MIB, 104).quad(0x02, true);
/// GigaDevice GD25Q64C, 8 MiB.
pub const GD25Q64C: DeviceDescriptor = DeviceDescriptor::nor("GD25Q64C", [0xC8, 0x40, 0x17], 8 * MIB, 104)
    .quad(0x02, true)
    .split_status();
/// Cypress S25FL116K, 2 MiB.
pub const S25FL116K: DeviceDescriptor =
    DeviceDescriptor::nor("S25FL116K", [0x01, 0x40, 0x15], 2 * MIB, 108).quad(0x02, false);
/// Cypress S25FL216K, 2 MiB.
///
/// Answers with the same ID as [`S25FL116K`], which comes first in
/// [`DEVICES`]. Pass it to [`Flash::begin_with`](crate::flash::Flash::begin_with)
/// to use its lower clock limit.
pub const S25FL216K: DeviceDescriptor =
    DeviceDescriptor::nor("S25FL216K", [0x01, 0x40, 0x15], 2 * MIB, 65).quad(0x02, false);
/// Winbond W25Q16FW (1.8V), 2 MiB.
pub const W25Q16FW: DeviceDescriptor =
    DeviceDescriptor::nor("W25Q16FW", [0xEF, 0x60, 0x15], 2 * MIB, 104).quad(0x02, true);
/// Winbond W25Q64JV-IQ, 8 MiB.
pub const W25Q64JV_IQ: DeviceDescriptor = DeviceDescriptor::nor("W25Q64JV-IQ", [0xEF, 0x40, 0x17], 8 * MIB, 133)
    .quad(0x02, true)
    .split_status();
/// Fujitsu MB85RS1MT FRAM, 128 KiB.
pub const MB85RS1MT: DeviceDescriptor = DeviceDescriptor::fram("MB85RS1MT", [0x04, 0x7F, 0x27], 128 * KIB, 40);
/// Fujitsu MB85RS2MTA FRAM, 256 KiB.
pub const MB85RS2MTA: DeviceDescriptor = DeviceDescriptor::fram("MB85RS2MTA", [0x04, 0x7F, 0x48], 256 * KIB, 40);
/// Fujitsu MB85RS4MT FRAM, 512 KiB.
pub const MB85RS4MT: DeviceDescriptor = DeviceDescriptor::fram("MB85RS4MT", [0x04, 0x7F, 0x49], 512 * KIB, 40);
/// Macronix MX25R6435F, 8 MiB. The clock limit is the low power mode's.
pub const MX25R6435F: DeviceDescriptor = DeviceDescriptor::nor("MX25R6435F", [0xC2, 0x28, 0x17], 8 * MIB, 8)
    .quad(0x40, true)
    .single_status()
    .chip_erase(0x60);
/// Macronix MX25R1635F, 2 MiB.
pub const MX25R1635F: DeviceDescriptor = DeviceDescriptor::nor("MX25R1635F", [0xC2, 0x28, 0x15], 2 * MIB, 8)
    .quad(0x40, true)
    .single_status()
    .chip_erase(0x60);
/// Winbond W25Q16JV-IQ, 2 MiB.
pub const W25Q16JV_IQ: DeviceDescriptor =
    DeviceDescriptor::nor("W25Q16JV-IQ", [0xEF, 0x40, 0x15], 2 * MIB, 133).quad(0x02, true);
/// Winbond W25Q32JV-IQ, 4 MiB.
pub const W25Q32JV_IQ: DeviceDescriptor = DeviceDescriptor::nor("W25Q32JV-IQ", [0xEF, 0x40, 0x16], 4 * MIB, 133)
    .quad(0x02, true)
    .split_status();

/// Built-in devices, in match priority order.
pub const DEVICES: &[DeviceDescriptor] = &[
    // Most common parts first
    GD25Q16C,
    GD25Q64C,
    S25FL116K,
    S25FL216K,
    W25Q16FW,
    W25Q64JV_IQ,
    MB85RS1MT,
    MB85RS2MTA,
    MB85RS4MT,
    MX25R6435F,
    MX25R1635F,
    W25Q16JV_IQ,
    W25Q32JV_IQ,
];

/// Looks up `id`, first in `overrides`, then in [`DEVICES`].
///
/// Only exact matches on all three bytes count.
pub fn detect(id: JedecId, overrides: &[DeviceDescriptor]) -> Option<DeviceDescriptor> {
    overrides
        .iter()
        .chain(DEVICES.iter())
        .find(|dev| dev.jedec_id() == id)
        .copied()
}
