//! Page mapping resolver
//!
//! Pages inside a physical block are written strictly in order, each tagged
//! with the logical page it holds. The current location of a logical page is
//! therefore the last tagged page naming it, and the first page without a tag
//! is where the next write goes. Nothing about this is persisted: it is
//! rebuilt from the tags whenever needed.

mod cache;

pub use cache::PageMapCache;

use crate::error::{FtlError, Result};
use crate::ftl::Ftl;
use crate::journal::Action;
use crate::nand::NandDevice;
use crate::tag::{PageTag, TagStatus};
use crate::types::{PageAddr, PhysicalBlock};

/// Location of every logical page inside one physical block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMapping {
    block: PhysicalBlock,
    next_free: u32,
    logic_pages: Vec<Option<u32>>,
}

impl PageMapping {
    pub fn empty(block: PhysicalBlock, pages_per_block: u32) -> Self {
        PageMapping {
            block,
            next_free: 0,
            logic_pages: vec![None; pages_per_block as usize],
        }
    }

    pub fn block(&self) -> PhysicalBlock {
        self.block
    }

    /// First unprogrammed page
    pub fn next_free(&self) -> u32 {
        self.next_free
    }

    pub fn pages_per_block(&self) -> u32 {
        self.logic_pages.len() as u32
    }

    /// Pages still available for appends
    pub fn free_pages(&self) -> u32 {
        self.pages_per_block().saturating_sub(self.next_free)
    }

    pub fn is_full(&self) -> bool {
        self.free_pages() == 0
    }

    /// Physical page index holding `logical_page`
    pub fn physical_page(&self, logical_page: u32) -> Option<u32> {
        self.logic_pages.get(logical_page as usize).copied().flatten()
    }

    /// Address of the page holding `logical_page`
    pub fn get(&self, logical_page: u32) -> Option<PageAddr> {
        self.physical_page(logical_page).map(|p| self.block.page(p))
    }

    pub fn logic_pages(&self) -> &[Option<u32>] {
        &self.logic_pages
    }

    /// `(logical_page, physical_page)` for every live page
    pub fn live(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.logic_pages
            .iter()
            .enumerate()
            .filter_map(|(lp, pp)| pp.map(|pp| (lp as u32, pp)))
    }

    pub fn live_count(&self) -> usize {
        self.logic_pages.iter().filter(|p| p.is_some()).count()
    }

    /// Record that `physical_page` now holds `logical_page`
    pub fn record(&mut self, logical_page: u32, physical_page: u32) {
        if let Some(slot) = self.logic_pages.get_mut(logical_page as usize) {
            *slot = Some(physical_page);
        }
        self.advance(physical_page + 1);
    }

    /// Mark pages before `next_free` as programmed
    pub fn advance(&mut self, next_free: u32) {
        self.next_free = self.next_free.max(next_free);
    }
}

impl<N: NandDevice> Ftl<N> {
    /// Current page mapping of a physical block
    pub fn page_mapping(&mut self, block: PhysicalBlock) -> Result<PageMapping> {
        self.check_physical(block)?;
        if let Some(mapping) = self.cache.get(block) {
            return Ok(mapping);
        }
        let mapping = self.scan_block(block, None)?;
        self.cache.put(mapping.clone());
        Ok(mapping)
    }

    /// Page mapping ignoring pages written at or after the current `sn`
    ///
    /// Used when repairing blocks after a restart: such pages were written
    /// after the snapshot that was recovered and are not committed.
    pub fn clean_page_mapping(&mut self, block: PhysicalBlock) -> Result<PageMapping> {
        self.check_physical(block)?;
        let sn = self.table.sn();
        self.scan_block(block, Some(sn))
    }

    fn scan_block(&mut self, block: PhysicalBlock, torn_from: Option<u32>) -> Result<PageMapping> {
        let ppb = self.geometry.pages_per_block;
        let mut mapping = PageMapping::empty(block, ppb);

        for page in 0..ppb {
            let addr = block.page(page);
            if let Err(e) = self.nand.read_page(addr, None, Some(&mut self.scratch.oob)) {
                tracing::warn!("Tag read failed at {}: {}", addr, e);
                self.note(Action::PageMappingFailed, Some(addr), None);
                return Err(FtlError::PageMapping {
                    block: block.0,
                    page,
                });
            }

            let Some(tag) = PageTag::decode(&self.scratch.oob) else {
                break;
            };
            mapping.advance(page + 1);

            if tag.status != TagStatus::Used {
                continue;
            }
            if torn_from.is_some_and(|sn| tag.sn >= sn) {
                continue;
            }
            if tag.logical_page as u32 >= ppb {
                tracing::warn!("Corrupt tag at {}: logical page {}", addr, tag.logical_page);
                self.note(Action::TagCorrupt, Some(addr), None);
                continue;
            }
            mapping.record(tag.logical_page as u32, page);
        }

        Ok(mapping)
    }
}
