//! Persistent logical-to-physical block map
//!
//! The table holds one entry per logical block (the physical block it lives
//! in, or unmapped) and one entry per physical block (status and erase
//! count). It is the only state that must survive a restart; everything else
//! is rebuilt from page tags.
//!
//! The on-flash image is the bincode encoding of [`MappingTable`] with fixed
//! width integers, so its size depends only on the number of blocks. The CRC
//! field is computed over the image with the CRC itself set to zero.

use crate::error::{FtlError, Result};
use crate::types::{LogicalBlock, PhysicalBlock};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Current snapshot format (major.minor in the upper/lower halves)
pub const FORMAT_VERSION: u32 = 0x0001_0018;

const UNMAPPED: u32 = u32::MAX;

/// Fixed-width little-endian bincode, tolerant of page padding
pub(crate) fn codec() -> impl Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Lifecycle of a physical block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    /// Erasable and available to the allocator
    Free,
    /// Holds data or the mapping snapshot
    Used,
    /// Permanently retired
    Bad,
    /// Unmapped but not reusable until a later snapshot is persisted
    RecentlyFreed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockState {
    pub status: BlockStatus,
    pub erase_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingTable {
    sn: u32,
    crc: u32,
    version: u32,
    log_index: u32,
    logical: Vec<u32>,
    physical: Vec<BlockState>,
}

impl MappingTable {
    /// Empty table: everything unmapped and free, `sn` starting at 1
    pub fn new(block_total: u32) -> Self {
        MappingTable {
            sn: 1,
            crc: 0,
            version: FORMAT_VERSION,
            log_index: 0,
            logical: vec![UNMAPPED; block_total as usize],
            physical: vec![
                BlockState {
                    status: BlockStatus::Free,
                    erase_count: 0,
                };
                block_total as usize
            ],
        }
    }

    pub fn block_total(&self) -> u32 {
        self.physical.len() as u32
    }

    pub fn sn(&self) -> u32 {
        self.sn
    }

    pub fn bump_sn(&mut self) {
        self.sn = self.sn.wrapping_add(1);
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Stamp the current format version on a table loaded from an older minor
    pub fn upgrade_version(&mut self) {
        self.version = FORMAT_VERSION;
    }

    /// Unmap everything; every Used block becomes RecentlyFreed
    ///
    /// The blocks stay unallocatable until a snapshot of the reset table is
    /// durable. `sn`, the journal cursor and erase counts carry over.
    pub fn reset(&mut self) {
        self.logical.fill(UNMAPPED);
        for state in &mut self.physical {
            if state.status == BlockStatus::Used {
                state.status = BlockStatus::RecentlyFreed;
            }
        }
    }

    pub fn log_index(&self) -> u32 {
        self.log_index
    }

    pub fn set_log_index(&mut self, index: u32) {
        self.log_index = index;
    }

    /// Physical block currently holding `logical`
    pub fn lookup(&self, logical: LogicalBlock) -> Option<PhysicalBlock> {
        match self.logical.get(logical.index()) {
            Some(&raw) if raw != UNMAPPED => Some(PhysicalBlock(raw)),
            _ => None,
        }
    }

    pub fn map(&mut self, logical: LogicalBlock, physical: PhysicalBlock) {
        if let Some(slot) = self.logical.get_mut(logical.index()) {
            *slot = physical.0;
        }
    }

    /// Unmap `logical`, returning the block it pointed at
    pub fn unmap(&mut self, logical: LogicalBlock) -> Option<PhysicalBlock> {
        let previous = self.lookup(logical);
        if let Some(slot) = self.logical.get_mut(logical.index()) {
            *slot = UNMAPPED;
        }
        previous
    }

    /// Logical block pointing at `physical`, if any
    pub fn owner_of(&self, physical: PhysicalBlock) -> Option<LogicalBlock> {
        self.logical
            .iter()
            .position(|&raw| raw == physical.0)
            .map(|i| LogicalBlock(i as u32))
    }

    pub fn state(&self, block: PhysicalBlock) -> BlockState {
        self.physical[block.index()]
    }

    pub fn status(&self, block: PhysicalBlock) -> BlockStatus {
        self.physical[block.index()].status
    }

    /// Change a block's status; a Bad block stays Bad
    pub fn set_status(&mut self, block: PhysicalBlock, status: BlockStatus) {
        let state = &mut self.physical[block.index()];
        if state.status != BlockStatus::Bad {
            state.status = status;
        }
    }

    pub fn mark_bad(&mut self, block: PhysicalBlock) {
        self.physical[block.index()].status = BlockStatus::Bad;
    }

    pub fn record_erase(&mut self, block: PhysicalBlock) {
        let state = &mut self.physical[block.index()];
        state.erase_count = state.erase_count.saturating_add(1);
    }

    /// Highest erase count among blocks that are not Bad
    pub fn max_erase_count(&self) -> u32 {
        self.physical
            .iter()
            .filter(|s| s.status != BlockStatus::Bad)
            .map(|s| s.erase_count)
            .max()
            .unwrap_or(0)
    }

    /// Every physical block with its state
    pub fn blocks(&self) -> impl Iterator<Item = (PhysicalBlock, BlockState)> + '_ {
        self.physical
            .iter()
            .enumerate()
            .map(|(i, s)| (PhysicalBlock(i as u32), *s))
    }

    /// Every mapped logical block with its physical block
    pub fn mapped(&self) -> impl Iterator<Item = (LogicalBlock, PhysicalBlock)> + '_ {
        self.logical
            .iter()
            .enumerate()
            .filter(|(_, &raw)| raw != UNMAPPED)
            .map(|(i, &raw)| (LogicalBlock(i as u32), PhysicalBlock(raw)))
    }

    /// CRC of the image with the CRC field zeroed
    pub fn compute_crc(&self) -> Result<u32> {
        let mut zeroed = self.clone();
        zeroed.crc = 0;
        Ok(crc32fast::hash(&codec().serialize(&zeroed)?))
    }

    /// Serialize with a freshly computed CRC
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut image = self.clone();
        image.crc = self.compute_crc()?;
        Ok(codec().serialize(&image)?)
    }

    /// Size of the image for a device with `block_total` blocks
    pub fn encoded_len(block_total: u32) -> Result<usize> {
        Ok(codec().serialized_size(&Self::new(block_total))? as usize)
    }

    /// Parse and verify an image; the returned table has its CRC field zeroed
    pub fn decode(bytes: &[u8], block_total: u32) -> Result<Self> {
        let mut table: MappingTable = codec().deserialize(bytes)?;

        if table.version >> 16 != FORMAT_VERSION >> 16 {
            return Err(FtlError::UnsupportedVersion(table.version));
        }
        if table.logical.len() != block_total as usize || table.physical.len() != block_total as usize {
            return Err(FtlError::CorruptMapping(format!(
                "table covers {}/{} blocks, device has {}",
                table.logical.len(),
                table.physical.len(),
                block_total
            )));
        }

        let stored = table.crc;
        table.crc = 0;
        let computed = table.compute_crc()?;
        if stored != computed {
            return Err(FtlError::ChecksumMismatch { stored, computed });
        }

        if let Some(&raw) = table.logical.iter().find(|&&raw| raw != UNMAPPED && raw >= block_total) {
            return Err(FtlError::CorruptMapping(format!(
                "logical entry points at block {} beyond {}",
                raw, block_total
            )));
        }
        Ok(table)
    }
}
