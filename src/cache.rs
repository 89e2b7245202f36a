//! A single-sector write-back cache.
//!
//! Flash can only be programmed after it was erased, and only whole sectors
//! can be erased. [`SectorCache`] lets callers write any number of bytes at
//! any address: the sector being written is read into RAM, modified there,
//! and only erased and programmed back when another sector is touched or
//! [`SectorCache::sync`] is called.
//!
//! Until then the buffer is the authoritative copy of its sector, and
//! [`SectorCache::read`] merges it into reads that overlap it.

use crate::{Program, Read};
use core::cmp;
use core::fmt;

/// Buffers one sector of `N` bytes.
///
/// `N` must equal the erase sector size of the chip the cache is used with.
pub struct SectorCache<const N: usize = 4096> {
    /// Start of the resident sector, always a multiple of `N`.
    addr: Option<u32>,
    buf: [u8; N],
}

impl<const N: usize> SectorCache<N> {
    /// Creates an empty cache.
    pub const fn new() -> Self {
        Self { addr: None, buf: [0; N] }
    }

    /// Start address of the resident sector, if any.
    pub fn cached_sector(&self) -> Option<u32> {
        self.addr
    }

    /// Drops the resident sector without writing it back.
    pub fn discard(&mut self) {
        self.addr = None;
    }

    fn sector_of(addr: u32) -> u32 {
        addr - addr % N as u32
    }

    /// Writes `src` at `addr`, loading sectors into the cache as needed.
    ///
    /// Nothing is erased or programmed here, except when the write moves on
    /// to a sector other than the resident one, which first syncs the
    /// resident sector.
    pub fn write<F: Program>(&mut self, flash: &mut F, mut addr: u32, mut src: &[u8]) -> Result<(), F::Error> {
        debug_assert_eq!(flash.sector_size() as usize, N);

        while !src.is_empty() {
            let sector = Self::sector_of(addr);
            let offset = (addr - sector) as usize;
            let len = cmp::min(src.len(), N - offset);

            if self.addr != Some(sector) {
                self.sync(flash)?;
                // Bytes of the sector that this write does not touch must keep
                // their current contents.
                flash.read(sector, &mut self.buf)?;
                self.addr = Some(sector);
            }

            self.buf[offset..offset + len].copy_from_slice(&src[..len]);

            addr += len as u32;
            src = &src[len..];
        }
        Ok(())
    }

    /// Writes the resident sector back to the chip and empties the cache.
    ///
    /// Does nothing if no sector is resident, so calling it twice only costs
    /// one erase. If the erase or the write fails the sector stays resident,
    /// and a later call tries again.
    pub fn sync<F: Program>(&mut self, flash: &mut F) -> Result<(), F::Error> {
        let addr = match self.addr {
            Some(addr) => addr,
            None => return Ok(()),
        };

        trace!("SectorCache::sync: sector = {:#08x}", addr);
        flash.erase_sector(addr / N as u32)?;
        flash.write_bytes(addr, &self.buf)?;
        self.addr = None;
        Ok(())
    }

    /// Reads `dst.len()` bytes at `addr`, taking bytes of the resident sector
    /// from the cache and everything else from the chip.
    pub fn read<F: Read>(&self, flash: &mut F, addr: u32, dst: &mut [u8]) -> Result<(), F::Error> {
        let cached = match self.addr {
            Some(cached) if !dst.is_empty() => cached,
            _ => return flash.read(addr, dst),
        };

        let end = addr as u64 + dst.len() as u64;
        let cache_end = cached as u64 + N as u64;
        if end <= cached as u64 || addr as u64 >= cache_end {
            return flash.read(addr, dst);
        }

        let dst_off = cached.saturating_sub(addr) as usize;
        let src_off = addr.saturating_sub(cached) as usize;
        let len = cmp::min(N - src_off, dst.len() - dst_off);

        // Before the cached sector
        if dst_off > 0 {
            flash.read(addr, &mut dst[..dst_off])?;
        }

        dst[dst_off..dst_off + len].copy_from_slice(&self.buf[src_off..src_off + len]);

        // After the cached sector
        let copied = dst_off + len;
        if copied < dst.len() {
            flash.read(addr + copied as u32, &mut dst[copied..])?;
        }
        Ok(())
    }
}

impl<const N: usize> Default for SectorCache<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for SectorCache<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectorCache")
            .field("size", &N)
            .field("addr", &self.addr)
            .finish()
    }
}
