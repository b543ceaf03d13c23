//! Mapping snapshot persistence and mount-time recovery
//!
//! A snapshot occupies one erase block:
//!
//! | page            | content                                        |
//! |-----------------|------------------------------------------------|
//! | 0               | signature pattern, mapping tag with `sn`       |
//! | 1 ..= K         | serialized [`MappingTable`], mapping tag       |
//! | K+1 ..          | diagnostic journal, untagged                   |
//!
//! Every flush goes to a freshly allocated block. The previous snapshot
//! block only becomes reusable once the new one is durable (it goes through
//! the recent queue like any other retired block), so a power cut at any
//! point leaves at least one complete snapshot on flash.

use crate::allocator::AllocPolicy;
use crate::backup;
use crate::error::Result;
use crate::ftl::Ftl;
use crate::journal::{Action, Journal};
use crate::mapping::{BlockStatus, MappingTable};
use crate::nand::NandDevice;
use crate::tag::{PageTag, TagStatus};
use crate::types::PhysicalBlock;

/// Byte at offset `i` of the signature page
fn pattern_byte(i: usize) -> u8 {
    ((i << 1) & 0x55) as u8
}

fn fill_pattern(page: &mut [u8]) {
    for (i, b) in page.iter_mut().enumerate() {
        *b = pattern_byte(i);
    }
}

fn is_pattern(page: &[u8]) -> bool {
    page.iter().enumerate().all(|(i, &b)| b == pattern_byte(i))
}

impl<N: NandDevice> Ftl<N> {
    /// Write the mapping table to a new snapshot block
    ///
    /// On failure the previous snapshot stays authoritative.
    pub fn flush(&mut self) -> Result<()> {
        self.flushing = true;
        let result = self.write_mapping();
        self.flushing = false;
        result
    }

    fn write_mapping(&mut self) -> Result<()> {
        let previous = self.mapping_block;
        if let Some(prev) = previous {
            self.table.set_status(prev, BlockStatus::RecentlyFreed);
        }

        let dest = loop {
            let dest = match self.allocate(None, AllocPolicy::Force) {
                Ok(block) => block,
                Err(e) => {
                    tracing::error!("Mapping flush failed: {}", e);
                    if let Some(prev) = previous {
                        self.table.set_status(prev, BlockStatus::Used);
                    }
                    return Err(e);
                }
            };
            match self.write_snapshot(dest) {
                Ok(true) => break dest,
                Ok(false) => {
                    tracing::warn!("Snapshot write to {} failed, marking bad", dest);
                    self.table.mark_bad(dest);
                    self.note(Action::BadBlock, Some(dest.page(0)), None);
                }
                Err(e) => {
                    self.table.set_status(dest, BlockStatus::Free);
                    if let Some(prev) = previous {
                        self.table.set_status(prev, BlockStatus::Used);
                    }
                    return Err(e);
                }
            }
        };

        let sn = self.table.sn();
        self.table.bump_sn();
        self.mapping_block = Some(dest);
        self.dirty = false;
        if let Some(region) = self.backup.as_deref_mut() {
            backup::record(region, dest);
        }

        if let Some(prev) = previous {
            self.recent.push(prev);
        }
        self.recent_drain();
        self.note(Action::FlushMapping, previous.map(|b| b.page(0)), Some(dest.page(0)));
        tracing::info!("Mapping flushed to {} (sn {})", dest, sn);
        Ok(())
    }

    /// Program a complete snapshot into `dest`; `false` when a page failed
    fn write_snapshot(&mut self, dest: PhysicalBlock) -> Result<bool> {
        let sn = self.table.sn();
        let image = self.table.encode()?;
        let journal = self.journal.encode()?;
        let page_size = self.geometry.page_size;

        fill_pattern(&mut self.scratch.data);
        PageTag::mapping(sn).encode_into(&mut self.scratch.oob);
        if let Err(e) = self.program_verified(dest.page(0)) {
            tracing::debug!("Signature page of {} failed: {}", dest, e);
            return Ok(false);
        }

        for (i, chunk) in image.chunks(page_size).enumerate() {
            let addr = dest.page(1 + i as u32);
            self.scratch.data.fill(0xFF);
            self.scratch.data[..chunk.len()].copy_from_slice(chunk);
            PageTag::mapping(sn).encode_into(&mut self.scratch.oob);
            if let Err(e) = self.program_verified(addr) {
                tracing::debug!("Table page {} failed: {}", addr, e);
                return Ok(false);
            }
        }

        let first = 1 + self.table_pages;
        for (i, chunk) in journal.chunks(page_size).take(self.journal_pages as usize).enumerate() {
            let addr = dest.page(first + i as u32);
            self.scratch.data.fill(0xFF);
            self.scratch.data[..chunk.len()].copy_from_slice(chunk);
            self.scratch.oob.fill(0xFF);
            if let Err(e) = self.program_verified(addr) {
                tracing::warn!("Journal page {} not written: {}", addr, e);
            }
        }
        Ok(true)
    }

    /// Locate and install the newest valid snapshot, or start empty
    pub(crate) fn recover(&mut self) -> Result<()> {
        let mut found = self.search_backup();
        if found.is_none() {
            found = self.search_tags();
        }
        if found.is_none() && self.config.legacy_scan {
            found = self.search_legacy();
        }

        match found {
            Some((block, table)) => self.install(block, table),
            None => {
                tracing::info!("No mapping snapshot found, starting empty");
                self.table = MappingTable::new(self.geometry.block_total);
                self.mapping_block = None;
                self.journal = Journal::new(self.journal.capacity());
                self.recent.clear();
                self.cache.clear();
                self.dirty = true;
                Ok(())
            }
        }
    }

    /// Read and validate the snapshot stored in `block`
    fn try_load(&mut self, block: PhysicalBlock) -> Option<MappingTable> {
        if self.nand.read_page(block.page(0), Some(&mut self.scratch.data), None).is_err() {
            return None;
        }
        if !is_pattern(&self.scratch.data) {
            return None;
        }

        let mut image = Vec::with_capacity(self.table_pages as usize * self.geometry.page_size);
        for page in 1..=self.table_pages {
            let addr = block.page(page);
            if let Err(e) = self.nand.read_page(addr, Some(&mut self.scratch.data), None) {
                tracing::debug!("Snapshot page {} unreadable: {}", addr, e);
                return None;
            }
            image.extend_from_slice(&self.scratch.data);
        }

        match MappingTable::decode(&image, self.geometry.block_total) {
            Ok(table) => Some(table),
            Err(e) => {
                tracing::debug!("Snapshot candidate {} rejected: {}", block, e);
                None
            }
        }
    }

    fn search_backup(&mut self) -> Option<(PhysicalBlock, MappingTable)> {
        let candidates = backup::candidates(self.backup.as_deref()?)?;
        let mut best: Option<(PhysicalBlock, MappingTable)> = None;
        for block in candidates {
            if self.check_physical(block).is_err() {
                continue;
            }
            if let Some(table) = self.try_load(block) {
                if best.as_ref().map_or(true, |(_, t)| table.sn() > t.sn()) {
                    best = Some((block, table));
                }
            }
        }
        if let Some((block, table)) = &best {
            tracing::info!("Snapshot {} (sn {}) found through backup region", block, table.sn());
        }
        best
    }

    fn search_tags(&mut self) -> Option<(PhysicalBlock, MappingTable)> {
        let mut candidates: Vec<(u32, PhysicalBlock)> = Vec::new();
        for index in 0..self.geometry.block_total {
            let block = PhysicalBlock(index);
            if self.nand.read_page(block.page(0), None, Some(&mut self.scratch.oob)).is_err() {
                continue;
            }
            if let Some(tag) = PageTag::decode(&self.scratch.oob) {
                if tag.is_mapping_signature() {
                    candidates.push((tag.sn, block));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        candidates.truncate(self.config.mapping_candidates);

        for (sn, block) in candidates {
            if let Some(table) = self.try_load(block) {
                tracing::info!("Snapshot {} (sn {}) found by tag scan", block, sn);
                return Some((block, table));
            }
            tracing::warn!("Snapshot candidate {} (sn {}) is invalid", block, sn);
        }
        None
    }

    fn search_legacy(&mut self) -> Option<(PhysicalBlock, MappingTable)> {
        let mut best: Option<(PhysicalBlock, MappingTable)> = None;
        for index in 0..self.geometry.block_total {
            let block = PhysicalBlock(index);
            if let Some(table) = self.try_load(block) {
                if best.as_ref().map_or(true, |(_, t)| table.sn() > t.sn()) {
                    best = Some((block, table));
                }
            }
        }
        if let Some((block, table)) = &best {
            tracing::info!("Snapshot {} (sn {}) found by pattern scan", block, table.sn());
        }
        best
    }

    fn install(&mut self, block: PhysicalBlock, table: MappingTable) -> Result<()> {
        self.table = table;
        self.mapping_block = Some(block);
        self.table.set_status(block, BlockStatus::Used);
        self.table.bump_sn();
        self.table.upgrade_version();
        self.cache.clear();
        self.dirty = false;
        self.load_journal(block);

        self.recent.clear();
        let pending: Vec<PhysicalBlock> = self
            .table
            .blocks()
            .filter(|(_, s)| s.status == BlockStatus::RecentlyFreed)
            .map(|(b, _)| b)
            .collect();
        for b in pending {
            self.recent.push(b);
        }

        let leaked = self.leaked_blocks();
        for &b in &leaked {
            tracing::warn!("{} is used but unreferenced, queued for reclamation", b);
            self.table.set_status(b, BlockStatus::RecentlyFreed);
            self.recent.push(b);
        }

        if let Some(region) = self.backup.as_deref_mut() {
            backup::record(region, block);
        }
        tracing::info!(
            "Recovered mapping from {} (sn {}, {} logical blocks mapped)",
            block,
            self.table.sn(),
            self.table.mapped().count()
        );

        // No flush until every torn block is repaired: a snapshot taken in
        // between would carry the sn of the torn pages still in place
        self.recent_drain();
        self.recovering = true;
        let repaired = self.repair_torn();
        self.recovering = false;
        if repaired > 0 || !leaked.is_empty() {
            self.flush()?;
        }
        Ok(())
    }

    fn load_journal(&mut self, block: PhysicalBlock) {
        let capacity = self.journal.capacity();
        let first = 1 + self.table_pages;
        let mut bytes = Vec::with_capacity(self.journal_pages as usize * self.geometry.page_size);
        for page in first..first + self.journal_pages {
            if self.nand.read_page(block.page(page), Some(&mut self.scratch.data), None).is_err() {
                break;
            }
            bytes.extend_from_slice(&self.scratch.data);
        }

        match Journal::decode(&bytes) {
            Ok(journal) if journal.capacity() == capacity => self.journal = journal,
            _ => {
                tracing::debug!("Journal in {} unusable, starting a new one", block);
                self.journal = Journal::new(capacity);
                self.table.set_log_index(0);
            }
        }
    }

    /// Used blocks that no logical block points at, excluding the mapping block
    pub(crate) fn leaked_blocks(&self) -> Vec<PhysicalBlock> {
        let mut owned = vec![false; self.geometry.block_total as usize];
        for (_, physical) in self.table.mapped() {
            if let Some(slot) = owned.get_mut(physical.index()) {
                *slot = true;
            }
        }
        self.table
            .blocks()
            .filter(|(b, s)| s.status == BlockStatus::Used && !owned[b.index()] && Some(*b) != self.mapping_block)
            .map(|(b, _)| b)
            .collect()
    }

    /// Compact every mapped block holding pages written after the snapshot
    fn repair_torn(&mut self) -> usize {
        let sn = self.table.sn();
        let mapped: Vec<_> = self.table.mapped().collect();
        let mut repaired = 0;

        for (logical, physical) in mapped {
            match self.has_torn_pages(physical, sn) {
                Ok(false) => {}
                Ok(true) => {
                    tracing::warn!("{} in {} has uncommitted pages, compacting", logical, physical);
                    match self.repair(logical, physical) {
                        Ok(()) => repaired += 1,
                        Err(e) => tracing::error!("Repair of {} failed: {}", logical, e),
                    }
                }
                Err(e) => tracing::warn!("Torn-write scan of {} failed: {}", physical, e),
            }
        }
        repaired
    }

    fn has_torn_pages(&mut self, block: PhysicalBlock, sn: u32) -> Result<bool> {
        for page in 0..self.geometry.pages_per_block {
            self.nand.read_page(block.page(page), None, Some(&mut self.scratch.oob))?;
            let Some(tag) = PageTag::decode(&self.scratch.oob) else {
                break;
            };
            if tag.status == TagStatus::Used && tag.sn >= sn {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
