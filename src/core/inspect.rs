//! Diagnostics over a mounted device

use crate::error::Result;
use crate::ftl::Ftl;
use crate::mapping::BlockStatus;
use crate::nand::{NandDevice, NandError};
use crate::types::{LogicalBlock, PhysicalBlock};
use serde::Serialize;

/// Summary counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FtlStats {
    pub block_total: u32,
    pub free_blocks: u32,
    pub used_blocks: u32,
    pub bad_blocks: u32,
    pub recent_blocks: u32,
    pub mapped_logical: u32,
    pub min_erase_count: u32,
    pub max_erase_count: u32,
    pub mean_erase_count: f64,
    pub sn: u32,
    pub mapping_block: Option<PhysicalBlock>,
}

/// One row of the block table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockReport {
    pub physical: PhysicalBlock,
    pub logical: Option<LogicalBlock>,
    pub status: BlockStatus,
    pub erase_count: u32,
    /// Holds the live mapping snapshot
    pub mapping: bool,
}

/// A live page that could not be read back
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageFault {
    pub logical: LogicalBlock,
    pub logical_page: u32,
    pub physical: PhysicalBlock,
    pub physical_page: u32,
    pub uncorrectable: bool,
}

impl<N: NandDevice> Ftl<N> {
    pub fn stats(&self) -> FtlStats {
        let mut stats = FtlStats {
            block_total: self.geometry.block_total,
            free_blocks: 0,
            used_blocks: 0,
            bad_blocks: 0,
            recent_blocks: 0,
            mapped_logical: self.table.mapped().count() as u32,
            min_erase_count: u32::MAX,
            max_erase_count: 0,
            mean_erase_count: 0.0,
            sn: self.table.sn(),
            mapping_block: self.mapping_block,
        };

        let mut total: u64 = 0;
        for (_, state) in self.table.blocks() {
            match state.status {
                BlockStatus::Free => stats.free_blocks += 1,
                BlockStatus::Used => stats.used_blocks += 1,
                BlockStatus::Bad => stats.bad_blocks += 1,
                BlockStatus::RecentlyFreed => stats.recent_blocks += 1,
            }
            stats.min_erase_count = stats.min_erase_count.min(state.erase_count);
            stats.max_erase_count = stats.max_erase_count.max(state.erase_count);
            total += state.erase_count as u64;
        }
        stats.mean_erase_count = total as f64 / self.geometry.block_total as f64;
        stats
    }

    /// Every physical block with its owner, status and erase count
    pub fn block_report(&self) -> Vec<BlockReport> {
        let mut owners = vec![None; self.geometry.block_total as usize];
        for (logical, physical) in self.table.mapped() {
            if let Some(slot) = owners.get_mut(physical.index()) {
                *slot = Some(logical);
            }
        }
        self.table
            .blocks()
            .map(|(physical, state)| BlockReport {
                physical,
                logical: owners[physical.index()],
                status: state.status,
                erase_count: state.erase_count,
                mapping: Some(physical) == self.mapping_block,
            })
            .collect()
    }

    /// Used blocks nothing refers to
    pub fn check_mapping(&self) -> Vec<PhysicalBlock> {
        self.leaked_blocks()
    }

    /// Read every live page of every mapped block
    pub fn check_blocks(&mut self) -> Result<Vec<PageFault>> {
        let mapped: Vec<_> = self.table.mapped().collect();
        let mut faults = Vec::new();

        for (logical, physical) in mapped {
            let map = self.page_mapping(physical)?;
            for (logical_page, physical_page) in map.live() {
                let addr = physical.page(physical_page);
                if let Err(e) = self.nand.read_page(addr, Some(&mut self.scratch.data), None) {
                    tracing::warn!("{} page {} unreadable at {}: {}", logical, logical_page, addr, e);
                    faults.push(PageFault {
                        logical,
                        logical_page,
                        physical,
                        physical_page,
                        uncorrectable: e == NandError::Uncorrectable,
                    });
                }
            }
        }
        Ok(faults)
    }

    /// Drop every mapping and persist the empty table
    ///
    /// Bad blocks and erase counts are kept and `sn` keeps increasing, so the
    /// new snapshot supersedes every older one. Old data blocks are released
    /// only once that snapshot is on flash; until then a power cut still
    /// finds the previous mapping intact. Needs one Free block.
    pub fn format(&mut self) -> Result<()> {
        tracing::info!("Formatting device");
        self.table.reset();
        if let Some(block) = self.mapping_block {
            self.table.set_status(block, BlockStatus::Used);
        }
        let pending: Vec<PhysicalBlock> = self
            .table
            .blocks()
            .filter(|(_, s)| s.status == BlockStatus::RecentlyFreed)
            .map(|(b, _)| b)
            .collect();
        for b in pending {
            self.recent.push(b);
        }
        self.cache.clear();
        self.dirty = true;

        self.flush()?;
        self.recent_release_all();
        Ok(())
    }
}
