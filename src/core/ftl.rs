//! Device context
//!
//! [`Ftl`] owns everything an opened device needs: the NAND driver, the
//! in-memory mapping table, the recent-free queue, the journal and a single
//! set of page buffers. Every operation takes `&mut self`, so calls on one
//! instance are serialized by construction.
//!
//! The operations themselves live next to the structures they work on
//! (`io`, `allocator`, `compactor`, `persist`, ...) as further `impl` blocks.

use crate::backup::BackupRegion;
use crate::config::FtlConfig;
use crate::error::{FtlError, Result};
use crate::journal::{Action, Journal};
use crate::mapping::MappingTable;
use crate::nand::{Geometry, NandDevice, NandResult};
use crate::page_map::PageMapCache;
use crate::recent::RecentQueue;
use crate::types::PhysicalBlock;

/// Page-sized buffers shared by every operation of one device
#[derive(Debug, Clone)]
pub(crate) struct Scratch {
    pub(crate) data: Vec<u8>,
    pub(crate) oob: Vec<u8>,
    pub(crate) verify: Vec<u8>,
}

impl Scratch {
    fn new(geometry: &Geometry) -> Self {
        Scratch {
            data: vec![0xFF; geometry.page_size],
            oob: vec![0xFF; geometry.oob_size],
            verify: vec![0xFF; geometry.page_size],
        }
    }
}

/// Flash translation layer over one NAND device
pub struct Ftl<N: NandDevice> {
    pub(crate) nand: N,
    pub(crate) geometry: Geometry,
    pub(crate) config: FtlConfig,
    pub(crate) table: MappingTable,
    pub(crate) mapping_block: Option<PhysicalBlock>,
    pub(crate) recent: RecentQueue,
    pub(crate) journal: Journal,
    pub(crate) backup: Option<Box<dyn BackupRegion>>,
    pub(crate) cache: PageMapCache,
    /// Blocks an in-flight compaction is reading from
    pub(crate) pins: Vec<PhysicalBlock>,
    pub(crate) scratch: Scratch,
    /// Pages holding the serialized table (after the signature page)
    pub(crate) table_pages: u32,
    /// Pages holding the journal (after the table pages)
    pub(crate) journal_pages: u32,
    /// Mapping state differs from the last persisted snapshot
    pub(crate) dirty: bool,
    /// Mount-time repair in progress; queue-triggered flushes wait for it
    pub(crate) recovering: bool,
    /// A snapshot is being written; its own allocation must not flush again
    pub(crate) flushing: bool,
}

impl<N: NandDevice> Ftl<N> {
    /// Mount a device, recovering the latest mapping snapshot if there is one
    pub fn open(nand: N, config: FtlConfig) -> Result<Self> {
        Self::build(nand, config, None)
    }

    /// Mount a device that has a backup pointer region
    pub fn open_with_backup(nand: N, config: FtlConfig, backup: Box<dyn BackupRegion>) -> Result<Self> {
        Self::build(nand, config, Some(backup))
    }

    fn build(nand: N, config: FtlConfig, backup: Option<Box<dyn BackupRegion>>) -> Result<Self> {
        config.validate()?;
        let geometry = nand.geometry();
        geometry.validate()?;

        let page_size = geometry.page_size;
        let ppb = geometry.pages_per_block;
        let table_bytes = MappingTable::encoded_len(geometry.block_total)?;
        let table_pages = table_bytes.div_ceil(page_size) as u32;
        if 1 + table_pages > ppb {
            return Err(FtlError::InvalidGeometry(format!(
                "mapping table needs {} pages but a block has {}",
                1 + table_pages,
                ppb
            )));
        }

        let spare = (ppb - 1 - table_pages) as usize * page_size;
        let journal_capacity = config.journal_entries.min(Journal::capacity_for(spare));
        let journal_pages = if journal_capacity == 0 {
            0
        } else {
            Journal::encoded_len(journal_capacity).div_ceil(page_size) as u32
        };

        let mut ftl = Ftl {
            geometry,
            table: MappingTable::new(geometry.block_total),
            mapping_block: None,
            recent: RecentQueue::new(config.recent_capacity),
            journal: Journal::new(journal_capacity),
            backup,
            cache: PageMapCache::new(config.page_map_cache),
            pins: Vec::new(),
            scratch: Scratch::new(&geometry),
            table_pages,
            journal_pages,
            dirty: false,
            recovering: false,
            flushing: false,
            config,
            nand,
        };

        tracing::info!(
            "Mounting NAND: {} blocks x {} pages x {} bytes, {} planes",
            geometry.block_total,
            ppb,
            page_size,
            geometry.plane_num
        );
        ftl.recover()?;
        Ok(ftl)
    }

    /// Flush pending mapping changes, record the end of the session and
    /// return the driver
    pub fn close(mut self) -> Result<N> {
        self.note(Action::SessionDone, None, None);
        self.flush()?;
        Ok(self.nand)
    }

    /// Return the driver without persisting anything (simulates power loss)
    pub fn into_inner(self) -> N {
        self.nand
    }

    pub fn nand(&self) -> &N {
        &self.nand
    }

    pub fn nand_mut(&mut self) -> &mut N {
        &mut self.nand
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn config(&self) -> &FtlConfig {
        &self.config
    }

    pub fn table(&self) -> &MappingTable {
        &self.table
    }

    /// Block holding the live mapping snapshot
    pub fn mapping_block(&self) -> Option<PhysicalBlock> {
        self.mapping_block
    }

    /// Sequence number stamped on pages written now
    pub fn sn(&self) -> u32 {
        self.table.sn()
    }

    /// Blocks waiting for delayed reclamation, oldest first
    pub fn recent_blocks(&self) -> &[PhysicalBlock] {
        self.recent.blocks()
    }

    /// Whether mapping changes are waiting for a flush
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Capacity of the diagnostic journal
    pub fn journal_capacity(&self) -> usize {
        self.journal.capacity()
    }

    /// Persist the mapping if it changed since the last snapshot
    pub fn sync(&mut self) -> Result<()> {
        if self.dirty {
            self.flush()?;
        }
        Ok(())
    }

    pub(crate) fn check_physical(&self, block: PhysicalBlock) -> Result<()> {
        if block.0 >= self.geometry.block_total {
            return Err(FtlError::InvalidBlock(block.0));
        }
        Ok(())
    }

    /// Erase a block, dropping its cached page mapping
    pub(crate) fn erase(&mut self, block: PhysicalBlock) -> NandResult<()> {
        self.cache.invalidate(block);
        self.nand.erase_block(block)
    }

    /// Run `f` with `block` protected from wear leveling and reclamation
    pub(crate) fn with_pin<T>(&mut self, block: PhysicalBlock, f: impl FnOnce(&mut Self) -> T) -> T {
        self.pins.push(block);
        let result = f(self);
        if let Some(pos) = self.pins.iter().rposition(|&b| b == block) {
            self.pins.remove(pos);
        }
        result
    }
}
