//! Sector-addressed block device on top of the FTL
//!
//! Sectors are logical pages numbered across the whole device. Requests are
//! split into per-logical-block chunks; only part of the physical capacity is
//! advertised so that compaction and bad blocks always have headroom.

use crate::config::FtlConfig;
use crate::error::{FtlError, Result};
use crate::ftl::Ftl;
use crate::nand::NandDevice;
use crate::types::LogicalBlock;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Geometry reported to the block layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockGeometry {
    pub bytes_per_sector: u32,
    /// Bytes per erase block
    pub block_size: u32,
    pub sector_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    GetGeometry,
    /// Persist the mapping
    Sync,
    /// Discard sectors `begin..end`
    EraseRange { begin: u64, end: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlResponse {
    Geometry(BlockGeometry),
    Done,
}

pub struct BlockDevice<N: NandDevice> {
    ftl: Ftl<N>,
}

/// Block device shared between threads
pub type SharedBlockDevice<N> = Arc<Mutex<BlockDevice<N>>>;

impl<N: NandDevice> BlockDevice<N> {
    /// Mount the FTL on `nand`
    pub fn init(nand: N, config: FtlConfig) -> Result<Self> {
        Ok(Self::from_ftl(Ftl::open(nand, config)?))
    }

    pub fn from_ftl(ftl: Ftl<N>) -> Self {
        BlockDevice { ftl }
    }

    pub fn ftl(&self) -> &Ftl<N> {
        &self.ftl
    }

    pub fn ftl_mut(&mut self) -> &mut Ftl<N> {
        &mut self.ftl
    }

    pub fn into_inner(self) -> Ftl<N> {
        self.ftl
    }

    pub fn into_shared(self) -> SharedBlockDevice<N> {
        Arc::new(Mutex::new(self))
    }

    pub fn geometry(&self) -> BlockGeometry {
        let g = self.ftl.geometry();
        let advertised = g.total_pages() as f64 * self.ftl.config().advertised_ratio;
        BlockGeometry {
            bytes_per_sector: g.page_size as u32,
            block_size: g.block_bytes() as u32,
            sector_count: advertised as u64,
        }
    }

    fn check_request(&self, offset: u64, page_count: usize, len: usize) -> Result<()> {
        let page_size = self.ftl.geometry().page_size;
        if len < page_count * page_size {
            return Err(FtlError::BufferSize {
                expected: page_count * page_size,
                actual: len,
            });
        }
        let end = offset.checked_add(page_count as u64);
        if end.map_or(true, |end| end > self.geometry().sector_count) {
            let ppb = self.ftl.geometry().pages_per_block as u64;
            return Err(FtlError::InvalidAddress {
                block: (offset / ppb) as u32,
                page: (offset % ppb) as u32,
            });
        }
        Ok(())
    }

    /// Split `offset..offset + page_count` into `(logical block, first page, pages)`
    fn chunks(&self, offset: u64, page_count: usize) -> Vec<(LogicalBlock, u32, usize)> {
        let ppb = self.ftl.geometry().pages_per_block as u64;
        let mut chunks = Vec::new();
        let mut sector = offset;
        let end = offset + page_count as u64;
        while sector < end {
            let first = sector % ppb;
            let count = (ppb - first).min(end - sector);
            chunks.push((LogicalBlock((sector / ppb) as u32), first as u32, count as usize));
            sector += count;
        }
        chunks
    }

    /// Read `page_count` sectors starting at `offset`
    pub fn read(&mut self, offset: u64, buf: &mut [u8], page_count: usize) -> Result<usize> {
        self.check_request(offset, page_count, buf.len())?;
        let page_size = self.ftl.geometry().page_size;
        let mut at = 0;
        for (logical, first, count) in self.chunks(offset, page_count) {
            let len = count * page_size;
            self.ftl.read_pages(logical, first, &mut buf[at..at + len])?;
            at += len;
        }
        Ok(page_count)
    }

    /// Write `page_count` sectors starting at `offset`
    pub fn write(&mut self, offset: u64, buf: &[u8], page_count: usize) -> Result<usize> {
        self.check_request(offset, page_count, buf.len())?;
        let page_size = self.ftl.geometry().page_size;
        let mut at = 0;
        for (logical, first, count) in self.chunks(offset, page_count) {
            let len = count * page_size;
            self.ftl.write_pages(logical, first, &buf[at..at + len])?;
            at += len;
        }
        Ok(page_count)
    }

    pub fn control(&mut self, control: Control) -> Result<ControlResponse> {
        match control {
            Control::GetGeometry => Ok(ControlResponse::Geometry(self.geometry())),
            Control::Sync => {
                self.ftl.sync()?;
                Ok(ControlResponse::Done)
            }
            Control::EraseRange { begin, end } => {
                if end > self.geometry().sector_count {
                    return Err(FtlError::InvalidRange { begin, end });
                }
                self.ftl.erase_range(begin, end)?;
                Ok(ControlResponse::Done)
            }
        }
    }
}
