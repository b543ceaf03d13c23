//! Logical page I/O
//!
//! Callers address data as (logical block, logical page). Pages never
//! written, or erased, read back as zeros; by the same rule an all-zero
//! page that is not already stored is never written at all.

use crate::allocator::AllocPolicy;
use crate::compactor::Injection;
use crate::error::{FtlError, Result};
use crate::ftl::Ftl;
use crate::journal::Action;
use crate::nand::{NandDevice, ReadStatus};
use crate::page_map::PageMapping;
use crate::types::{LogicalBlock, PageAddr, PhysicalBlock};
use std::ops::Range;

fn is_zero(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

impl<N: NandDevice> Ftl<N> {
    /// Number of logical blocks
    pub fn logical_blocks(&self) -> u32 {
        self.geometry.block_total
    }

    /// Number of logical pages
    pub fn logical_pages(&self) -> u64 {
        self.geometry.total_pages()
    }

    pub(crate) fn check_logical(&self, logical: LogicalBlock) -> Result<()> {
        if logical.0 >= self.geometry.block_total {
            return Err(FtlError::InvalidAddress {
                block: logical.0,
                page: 0,
            });
        }
        Ok(())
    }

    /// Validate a request and return the number of pages it covers
    fn check_request(&self, logical: LogicalBlock, first: u32, len: usize) -> Result<u32> {
        let page_size = self.geometry.page_size;
        if len == 0 || len % page_size != 0 {
            return Err(FtlError::BufferSize {
                expected: len.div_ceil(page_size).max(1) * page_size,
                actual: len,
            });
        }
        let count = (len / page_size) as u64;
        if logical.0 >= self.geometry.block_total || first as u64 + count > self.geometry.pages_per_block as u64 {
            return Err(FtlError::InvalidAddress {
                block: logical.0,
                page: first,
            });
        }
        Ok(count as u32)
    }

    /// Read one logical page into `buf` (exactly one page long)
    pub fn read_page(&mut self, logical: LogicalBlock, page: u32, buf: &mut [u8]) -> Result<()> {
        self.read_pages(logical, page, buf)
    }

    /// Read consecutive logical pages of one logical block
    ///
    /// Pages reporting corrected bit errors are returned normally and the
    /// block is rewritten afterwards.
    pub fn read_pages(&mut self, logical: LogicalBlock, first: u32, buf: &mut [u8]) -> Result<()> {
        self.check_request(logical, first, buf.len())?;
        let Some(physical) = self.table.lookup(logical) else {
            buf.fill(0);
            return Ok(());
        };

        let map = self.page_mapping(physical)?;
        let mut corrected = false;
        for (i, chunk) in buf.chunks_mut(self.geometry.page_size).enumerate() {
            let Some(addr) = map.get(first + i as u32) else {
                chunk.fill(0);
                continue;
            };
            match self.nand.read_page(addr, Some(chunk), None) {
                Ok(ReadStatus::Clean) => {}
                Ok(ReadStatus::Corrected) => {
                    tracing::warn!("Corrected bit errors reading {}", addr);
                    self.note(Action::BitFlip, Some(addr), None);
                    corrected = true;
                }
                Err(e) => {
                    tracing::error!("Read of {} ({} page {}) failed: {}", addr, logical, first + i as u32, e);
                    self.note(Action::ReadFailed, Some(addr), None);
                    return Err(FtlError::ReadFailed {
                        block: addr.block.0,
                        page: addr.page,
                    });
                }
            }
        }

        if corrected {
            self.rejuvenate(logical);
        }
        Ok(())
    }

    /// Write one logical page
    pub fn write_page(&mut self, logical: LogicalBlock, page: u32, data: &[u8]) -> Result<()> {
        self.write_pages(logical, page, data)
    }

    /// Write consecutive logical pages of one logical block
    pub fn write_pages(&mut self, logical: LogicalBlock, first: u32, data: &[u8]) -> Result<()> {
        self.check_request(logical, first, data.len())?;
        let corrected = match self.table.lookup(logical) {
            None => self.write_unmapped(logical, first, data)?,
            Some(physical) => self.write_mapped(logical, physical, first, data)?,
        };
        if corrected {
            self.rejuvenate(logical);
        }
        Ok(())
    }

    fn rejuvenate(&mut self, logical: LogicalBlock) {
        if let Err(e) = self.block_copy(logical) {
            tracing::warn!("Rewriting {} after corrected read failed: {}", logical, e);
        }
    }

    /// Pages of `data` paired with their logical page, minus elided zero pages
    fn payload<'a>(&self, first: u32, data: &'a [u8], existing: Option<&PageMapping>) -> Vec<(u32, &'a [u8])> {
        data.chunks(self.geometry.page_size)
            .enumerate()
            .map(|(i, chunk)| (first + i as u32, chunk))
            .filter(|&(lp, chunk)| !is_zero(chunk) || existing.is_some_and(|m| m.physical_page(lp).is_some()))
            .collect()
    }

    fn write_unmapped(&mut self, logical: LogicalBlock, first: u32, data: &[u8]) -> Result<bool> {
        let pages = self.payload(first, data, None);
        if pages.is_empty() {
            return Ok(false);
        }

        loop {
            let dest = self.allocate(None, AllocPolicy::Leveled)?;
            match self.append_pages(dest, 0, &pages) {
                Ok(corrected) => {
                    let mut map = PageMapping::empty(dest, self.geometry.pages_per_block);
                    for (i, &(lp, _)) in pages.iter().enumerate() {
                        map.record(lp, i as u32);
                    }
                    self.cache.put(map);
                    self.table.map(logical, dest);
                    self.dirty = true;
                    self.note(Action::MapBlock, None, Some(dest.page(0)));
                    tracing::debug!("{} mapped to {}", logical, dest);
                    return Ok(corrected);
                }
                Err(addr) => self.fail_block(dest, addr),
            }
        }
    }

    fn write_mapped(&mut self, logical: LogicalBlock, physical: PhysicalBlock, first: u32, data: &[u8]) -> Result<bool> {
        let mut map = self.page_mapping(physical)?;
        let pages = self.payload(first, data, Some(&map));
        if pages.is_empty() {
            return Ok(false);
        }

        if pages.len() as u32 <= map.free_pages() {
            let start = map.next_free();
            match self.append_pages(physical, start, &pages) {
                Ok(corrected) => {
                    for (i, &(lp, _)) in pages.iter().enumerate() {
                        map.record(lp, start + i as u32);
                    }
                    self.cache.put(map);
                    self.dirty = true;
                    return Ok(corrected);
                }
                Err(addr) => {
                    self.fail_block(physical, addr);
                    map = self.page_mapping(physical)?;
                }
            }
        }

        let inject = Injection { first_page: first, data };
        self.relocate(logical, physical, &map, Some(&inject), 0..0, AllocPolicy::Leveled)
    }

    /// Program tagged pages starting at `start`; on failure returns the page
    /// that failed
    fn append_pages(&mut self, block: PhysicalBlock, start: u32, pages: &[(u32, &[u8])]) -> std::result::Result<bool, PageAddr> {
        let mut corrected = false;
        for (i, &(lp, payload)) in pages.iter().enumerate() {
            let addr = block.page(start + i as u32);
            match self.program_tagged(addr, payload, lp) {
                Ok(c) => corrected |= c,
                Err(e) => {
                    tracing::warn!("Write of {} failed: {}", addr, e);
                    return Err(addr);
                }
            }
        }
        self.note(Action::WritePage, None, Some(block.page(start)));
        Ok(corrected)
    }

    fn fail_block(&mut self, block: PhysicalBlock, addr: PageAddr) {
        tracing::warn!("Marking {} bad after write failure", block);
        self.table.mark_bad(block);
        self.dirty = true;
        self.note(Action::WriteFailed, None, Some(addr));
        self.note(Action::BadBlock, Some(block.page(0)), None);
    }

    /// Discard logical pages `begin..end` (absolute page numbers)
    pub fn erase_range(&mut self, begin: u64, end: u64) -> Result<()> {
        if begin > end || end > self.logical_pages() {
            return Err(FtlError::InvalidRange { begin, end });
        }

        let ppb = self.geometry.pages_per_block as u64;
        let mut cursor = begin;
        while cursor < end {
            let block = cursor / ppb;
            let stop = ((block + 1) * ppb).min(end);
            let pages = (cursor - block * ppb) as u32..(stop - block * ppb) as u32;
            self.erase_pages(LogicalBlock(block as u32), pages)?;
            cursor = stop;
        }
        Ok(())
    }

    fn erase_pages(&mut self, logical: LogicalBlock, pages: Range<u32>) -> Result<()> {
        let Some(physical) = self.table.lookup(logical) else {
            return Ok(());
        };
        self.note(
            Action::EraseRange,
            Some(physical.page(pages.start)),
            Some(physical.page(pages.end - 1)),
        );

        let whole = pages.start == 0 && pages.end == self.geometry.pages_per_block;
        let map = if whole { None } else { Some(self.page_mapping(physical)?) };

        match map {
            Some(map) if map.live().any(|(lp, _)| !pages.contains(&lp)) => {
                if map.live().any(|(lp, _)| pages.contains(&lp)) {
                    self.relocate(logical, physical, &map, None, pages, AllocPolicy::Leveled)?;
                }
            }
            _ => {
                self.table.unmap(logical);
                self.dirty = true;
                self.note(Action::UnmapBlock, Some(physical.page(0)), None);
                tracing::debug!("{} unmapped from {}", logical, physical);
                self.retire(physical);
            }
        }
        Ok(())
    }
}
