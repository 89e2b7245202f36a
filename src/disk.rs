//! 512-byte block device on top of the sector cache.

use crate::cache::SectorCache;
use crate::{BlockDevice, Error, Program, BLOCK_SIZE};
use core::fmt;

/// Erase sector size supported by [`FlashDisk`].
pub const SECTOR_SIZE: usize = 4096;

/// A [`BlockDevice`] backed by a flash chip, with writes buffered in a
/// [`SectorCache`].
///
/// Blocks need not line up with erase sectors; the cache handles any offset.
/// Written blocks only reach the chip on [`BlockDevice::sync_blocks`] or
/// when writes move on to another sector, so call `sync_blocks` before
/// power-down.
///
/// Hand the disk to a filesystem by reference; there is no global
/// registration.
pub struct FlashDisk<F> {
    flash: F,
    cache: SectorCache<SECTOR_SIZE>,
}

impl<F, E> FlashDisk<F>
where
    F: Program<Error = Error<E>>,
{
    /// Wraps a detected chip.
    ///
    /// Fails with [`Error::UnsupportedGeometry`] unless the chip erases in
    /// [`SECTOR_SIZE`] byte sectors, and with [`Error::NotDetected`] if the
    /// chip was never detected.
    pub fn new(flash: F) -> Result<Self, Error<E>> {
        match flash.sector_size() {
            0 => Err(Error::NotDetected),
            s if s as usize == SECTOR_SIZE => Ok(Self {
                flash,
                cache: SectorCache::new(),
            }),
            sector_size => Err(Error::UnsupportedGeometry { sector_size }),
        }
    }
}

impl<F: Program> FlashDisk<F> {
    /// Reads `dst.len()` bytes at byte address `addr`, including writes that
    /// have not been synced yet.
    pub fn read(&mut self, addr: u32, dst: &mut [u8]) -> Result<(), F::Error> {
        self.cache.read(&mut self.flash, addr, dst)
    }

    /// Writes `src` at byte address `addr` through the cache.
    pub fn write(&mut self, addr: u32, src: &[u8]) -> Result<(), F::Error> {
        self.cache.write(&mut self.flash, addr, src)
    }

    /// Writes the cached sector, if any, back to the chip.
    pub fn sync(&mut self) -> Result<(), F::Error> {
        self.cache.sync(&mut self.flash)
    }

    /// Erases sector `sector` on the chip.
    ///
    /// If that sector is resident in the cache its pending writes are
    /// dropped, as the erase supersedes them.
    pub fn erase_sector(&mut self, sector: u32) -> Result<(), F::Error> {
        if self.cache.cached_sector() == Some(sector * SECTOR_SIZE as u32) {
            debug!("FlashDisk::erase_sector: dropping cached sector {}", sector);
            self.cache.discard();
        }
        self.flash.erase_sector(sector)
    }

    /// Gives access to the chip.
    ///
    /// Reads through this bypass the cache and may return stale data until
    /// the disk is synced.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Gives mutable access to the chip.
    ///
    /// Sync the disk first; writes made this way may be overwritten by the
    /// cache.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Releases the chip. Unsynced writes are lost.
    pub fn free(self) -> F {
        self.flash
    }
}

impl<F: Program> BlockDevice for FlashDisk<F> {
    type Error = F::Error;

    fn block_count(&self) -> u32 {
        self.flash.capacity() / BLOCK_SIZE as u32
    }

    fn read_blocks(&mut self, block: u32, dst: &mut [u8]) -> Result<(), Self::Error> {
        trace!("FlashDisk::read_blocks: lba = {}, count = {}", block, dst.len() / BLOCK_SIZE);
        self.read(block * BLOCK_SIZE as u32, dst)
    }

    fn write_blocks(&mut self, block: u32, src: &[u8]) -> Result<(), Self::Error> {
        trace!("FlashDisk::write_blocks: lba = {}, count = {}", block, src.len() / BLOCK_SIZE);
        self.write(block * BLOCK_SIZE as u32, src)
    }

    fn sync_blocks(&mut self) -> Result<(), Self::Error> {
        trace!("FlashDisk::sync_blocks");
        self.sync()
    }
}

impl<F: fmt::Debug> fmt::Debug for FlashDisk<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashDisk")
            .field("flash", &self.flash)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceDescriptor, GD25Q16C};
    use crate::flash::{Flash, Opcode};
    use crate::sim::{SimDelay, SimFlash};

    fn disk() -> FlashDisk<Flash<SimFlash>> {
        let mut flash = Flash::new(SimFlash::new(&GD25Q16C));
        flash.begin(&mut SimDelay::default()).unwrap();
        flash.transport_mut().clear_log();
        FlashDisk::new(flash).unwrap()
    }

    fn sim(disk: &FlashDisk<Flash<SimFlash>>) -> &SimFlash {
        disk.flash().transport()
    }

    #[test]
    fn test_rejects_other_sector_sizes() {
        let big = DeviceDescriptor::nor("big", [0x11, 0x22, 0x33], 1024 * 1024, 50).geometry(256, 8192, 65536);
        let mut flash = Flash::new(SimFlash::new(&big));
        flash.begin_with(&[big], &mut SimDelay::default()).unwrap();
        assert!(matches!(
            FlashDisk::new(flash),
            Err(Error::UnsupportedGeometry { sector_size: 8192 })
        ));

        let undetected = Flash::new(SimFlash::new(&GD25Q16C));
        assert!(matches!(FlashDisk::new(undetected), Err(Error::NotDetected)));
    }

    #[test]
    fn test_block_round_trip_before_and_after_sync() {
        let mut disk = disk();
        assert_eq!(disk.block_count(), 4096);

        let mut block = [0u8; BLOCK_SIZE];
        block.iter_mut().enumerate().for_each(|(i, b)| *b = (i % 251) as u8);
        disk.write_block(9, &block).unwrap();
        assert!(sim(&disk).programs().is_empty());

        let mut back = [0u8; BLOCK_SIZE];
        disk.read_block(9, &mut back).unwrap();
        assert_eq!(back[..], block[..]);

        disk.sync_blocks().unwrap();
        assert_eq!(sim(&disk).erases(), vec![(Opcode::SectorErase as u8, 4096)]);
        assert_eq!(&sim(&disk).memory()[9 * 512..10 * 512], &block[..]);

        disk.read_block(9, &mut back).unwrap();
        assert_eq!(back[..], block[..]);
    }

    #[test]
    fn test_multi_block_write_across_sectors() {
        let mut disk = disk();
        // Blocks 6..14 cover the end of sector 0 and most of sector 1
        let data: Vec<u8> = (0..8 * BLOCK_SIZE).map(|i| (i / 7) as u8).collect();
        disk.write_blocks(6, &data).unwrap();

        let mut back = vec![0; data.len()];
        disk.read_blocks(6, &mut back).unwrap();
        assert_eq!(back, data);

        // Sector 0 was evicted when the write moved on
        assert_eq!(sim(&disk).erases(), vec![(Opcode::SectorErase as u8, 0)]);

        disk.sync_blocks().unwrap();
        disk.sync_blocks().unwrap();
        assert_eq!(sim(&disk).erases().len(), 2);
        assert_eq!(&sim(&disk).memory()[6 * 512..14 * 512], &data[..]);
    }

    #[test]
    fn test_erase_then_write_across_sector_boundary() {
        let mut disk = disk();
        disk.flash_mut().transport_mut().memory_mut()[..8192]
            .iter_mut()
            .for_each(|b| *b = 0x00);

        disk.erase_sector(0).unwrap();
        disk.write(4090, &[0xAA; 10]).unwrap();
        disk.sync().unwrap();

        let mut back = [0u8; 16];
        disk.read(4085, &mut back).unwrap();
        assert_eq!(&back[..5], &[0xFF; 5]);
        assert_eq!(&back[5..15], &[0xAA; 10]);
        // Sector 1 kept its prior contents
        assert_eq!(back[15], 0x00);
    }

    #[test]
    fn test_eviction_persists_previous_sector() {
        let mut disk = disk();
        disk.write(100, b"first sector").unwrap();
        disk.write(3 * 4096 + 100, b"other sector").unwrap();

        assert_eq!(&sim(&disk).memory()[100..112], b"first sector");
        let mut back = [0u8; 12];
        disk.read(100, &mut back).unwrap();
        assert_eq!(&back, b"first sector");
        disk.read(3 * 4096 + 100, &mut back).unwrap();
        assert_eq!(&back, b"other sector");
    }

    #[test]
    fn test_erase_sector_drops_cached_copy() {
        let mut disk = disk();
        disk.write(10, &[0x00; 4]).unwrap();
        disk.erase_sector(0).unwrap();
        disk.sync().unwrap();

        let mut back = [0u8; 4];
        disk.read(10, &mut back).unwrap();
        assert_eq!(back, [0xFF; 4]);
        assert_eq!(sim(&disk).erases().len(), 1);
    }

    #[test]
    fn test_unaligned_writes_are_merged() {
        let mut disk = disk();
        disk.write(511, &[1, 2]).unwrap();
        disk.write(1000, &[3]).unwrap();
        disk.sync().unwrap();
        // One erase and one sector program for both writes
        assert_eq!(sim(&disk).erases().len(), 1);
        assert_eq!(sim(&disk).programs().len(), 16);

        let mem = sim(&disk).memory();
        assert_eq!(&mem[511..513], &[1, 2]);
        assert_eq!(mem[1000], 3);
        assert_eq!(mem[1001], 0xFF);
    }
}
