//! Block allocator and wear leveler
//!
//! Strategy:
//! - Hand out the Free block with the lowest erase count
//! - On multi-plane parts, prefer the plane of a reference block so that
//!   copies can use the hardware copy-back path
//! - When the youngest Used block lags the most worn block by more than
//!   `erase_balance` erases, move its (cold) data into a free block so the
//!   lightly worn block returns to circulation

use crate::compactor::{PageCopy, Replay};
use crate::error::{FtlError, Result};
use crate::ftl::Ftl;
use crate::journal::Action;
use crate::mapping::{BlockStatus, MappingTable};
use crate::nand::NandDevice;
use crate::types::PhysicalBlock;

/// How hard the allocator works before handing out a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    /// Return the youngest free block immediately
    Force,
    /// Wear-level first when the erase-count spread is too large
    Leveled,
}

/// Result of one allocation scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Candidates {
    /// Lowest-erase-count Free block
    pub youngest_free: Option<PhysicalBlock>,
    /// Lowest-erase-count Used block, reported only when it lags the most
    /// worn block by more than the balance threshold
    pub youngest_used: Option<PhysicalBlock>,
}

/// Scan the table for allocation candidates
///
/// With a reference block on a multi-plane device only blocks on the same
/// plane are considered. The reference block itself is never a candidate and
/// pinned blocks are never reported as wear-leveling victims.
pub fn find_youngest(
    table: &MappingTable,
    plane_num: u32,
    reference: Option<PhysicalBlock>,
    pinned: &[PhysicalBlock],
    erase_balance: u32,
) -> Candidates {
    let (start, stride) = match reference {
        Some(r) if plane_num > 1 => (r.plane(plane_num), plane_num),
        _ => (0, 1),
    };

    let mut free: Option<(PhysicalBlock, u32)> = None;
    let mut used: Option<(PhysicalBlock, u32)> = None;
    let younger = |best: Option<(PhysicalBlock, u32)>, count: u32| best.map_or(true, |(_, c)| count < c);

    let mut index = start;
    while index < table.block_total() {
        let block = PhysicalBlock(index);
        index += stride;
        if Some(block) == reference {
            continue;
        }

        let state = table.state(block);
        match state.status {
            BlockStatus::Free if younger(free, state.erase_count) => {
                free = Some((block, state.erase_count));
            }
            BlockStatus::Used if !pinned.contains(&block) && younger(used, state.erase_count) => {
                used = Some((block, state.erase_count));
            }
            _ => {}
        }
    }

    let max = table.max_erase_count();
    Candidates {
        youngest_free: free.map(|(b, _)| b),
        youngest_used: used
            .filter(|&(_, count)| max.saturating_sub(count) > erase_balance)
            .map(|(b, _)| b),
    }
}

impl<N: NandDevice> Ftl<N> {
    /// Take a free block, erase it and mark it Used
    ///
    /// Blocks that fail to erase are marked Bad and the search continues;
    /// `OutOfSpace` is returned only once no Free block is left.
    pub(crate) fn allocate(&mut self, reference: Option<PhysicalBlock>, policy: AllocPolicy) -> Result<PhysicalBlock> {
        let mut moves_left = match policy {
            AllocPolicy::Force => 0,
            AllocPolicy::Leveled => self.config.wear_level_moves,
        };
        let plane_num = self.geometry.plane_num;
        let balance = self.config.erase_balance;

        loop {
            // the last free block is reserved for the snapshot a reclaim writes
            if self.free_blocks() <= 1 && self.reclaim() {
                continue;
            }

            let mut found = find_youngest(&self.table, plane_num, reference, &self.pins, balance);
            if found.youngest_free.is_none() && reference.is_some() && plane_num > 1 {
                found = find_youngest(&self.table, plane_num, None, &self.pins, balance);
            }

            let Some(candidate) = found.youngest_free else {
                tracing::warn!("No free block left");
                return Err(FtlError::OutOfSpace);
            };

            // a move consumes a block before it retires one
            if moves_left > 0 && self.free_blocks() > 1 {
                if let Some(victim) = found.youngest_used {
                    moves_left -= 1;
                    if let Err(e) = self.wear_level(victim, candidate) {
                        tracing::warn!("Wear leveling {} failed: {}", victim, e);
                    }
                    continue;
                }
            }

            self.table.set_status(candidate, BlockStatus::Used);
            match self.erase(candidate) {
                Ok(()) => {
                    self.table.record_erase(candidate);
                    self.dirty = true;
                    self.note(Action::AllocBlock, None, Some(candidate.page(0)));
                    tracing::debug!(
                        "Allocated {} (erase count {})",
                        candidate,
                        self.table.state(candidate).erase_count
                    );
                    return Ok(candidate);
                }
                Err(e) => {
                    tracing::warn!("Erase of {} failed ({}), marking bad", candidate, e);
                    self.table.mark_bad(candidate);
                    self.dirty = true;
                    self.note(Action::BadBlock, Some(candidate.page(0)), None);
                }
            }
        }
    }

    fn free_blocks(&self) -> usize {
        self.table
            .blocks()
            .filter(|(_, s)| s.status == BlockStatus::Free)
            .count()
    }

    /// Turn queued blocks into free ones by persisting the mapping that no
    /// longer references them
    ///
    /// Needs one free block for the snapshot itself. Returns whether the
    /// snapshot was written; afterwards only pinned blocks stay queued.
    fn reclaim(&mut self) -> bool {
        if self.flushing || self.recovering || !self.recent.has_unpinned(&self.pins) {
            return false;
        }
        tracing::debug!("Free blocks exhausted, flushing to reclaim {} queued blocks", self.recent.len());
        if let Err(e) = self.flush() {
            tracing::warn!("Reclaim flush failed: {}", e);
            return false;
        }
        self.recent_release_all();
        true
    }

    /// Move the content of `victim` into `dest`
    ///
    /// Returns `false` when `dest` turned out to be unusable; the caller
    /// simply scans again.
    pub(crate) fn wear_level(&mut self, victim: PhysicalBlock, dest: PhysicalBlock) -> Result<bool> {
        self.table.set_status(dest, BlockStatus::Used);
        if let Err(e) = self.erase(dest) {
            tracing::warn!("Erase of {} failed ({}), marking bad", dest, e);
            self.table.mark_bad(dest);
            self.dirty = true;
            self.note(Action::BadBlock, Some(dest.page(0)), None);
            return Ok(false);
        }
        self.table.record_erase(dest);
        self.dirty = true;

        if Some(victim) == self.mapping_block {
            return Ok(self.migrate_mapping(victim, dest));
        }

        let Some(owner) = self.table.owner_of(victim) else {
            tracing::debug!("{} is used but unowned, reclaiming", victim);
            self.table.set_status(dest, BlockStatus::Free);
            self.retire(victim);
            return Ok(true);
        };

        let old_map = match self.page_mapping(victim) {
            Ok(map) => map,
            Err(e) => {
                self.table.set_status(dest, BlockStatus::Free);
                return Err(e);
            }
        };
        let plan = self.plan(&old_map, None, 0..0);
        if plan.is_empty() {
            self.table.unmap(owner);
            self.table.set_status(dest, BlockStatus::Free);
            self.note(Action::UnmapBlock, Some(victim.page(0)), None);
            self.retire(victim);
            return Ok(true);
        }

        let moved = self.with_pin(victim, |ftl| {
            let mut software = false;
            loop {
                match ftl.replay(dest, &plan, None, software) {
                    Replay::Done { .. } => return true,
                    Replay::SourceFailed if !software => {
                        ftl.note(Action::SourceError, Some(victim.page(0)), Some(dest.page(0)));
                        software = true;
                        if ftl.erase(dest).is_err() {
                            break;
                        }
                        ftl.table.record_erase(dest);
                    }
                    _ => break,
                }
            }
            ftl.table.mark_bad(dest);
            ftl.note(Action::BadBlock, Some(dest.page(0)), None);
            false
        });
        if !moved {
            tracing::warn!("Wear-level destination {} failed, marked bad", dest);
            return Ok(false);
        }

        self.table.map(owner, dest);
        self.note(Action::WearLevel, Some(victim.page(0)), Some(dest.page(0)));
        tracing::info!(
            "Wear leveled {} from {} (erase count {}) to {}",
            owner,
            victim,
            self.table.state(victim).erase_count,
            dest
        );
        self.retire(victim);
        Ok(true)
    }

    /// Copy the live mapping snapshot to `dest` and make it the mapping block
    fn migrate_mapping(&mut self, victim: PhysicalBlock, dest: PhysicalBlock) -> bool {
        let pages = 1 + self.table_pages + self.journal_pages;
        for page in 0..pages {
            let (src, dst) = (victim.page(page), dest.page(page));
            match self.copy_page(src, dst, true) {
                PageCopy::Copied { raw: false, .. } => {}
                PageCopy::DestFailed => {
                    tracing::warn!("Mapping migration to {} failed, marking bad", dest);
                    self.table.mark_bad(dest);
                    self.note(Action::BadBlock, Some(dest.page(0)), None);
                    return false;
                }
                _ => {
                    tracing::warn!("Mapping page {} unreadable, migration abandoned", src);
                    self.table.set_status(dest, BlockStatus::Free);
                    return false;
                }
            }
        }

        self.mapping_block = Some(dest);
        if let Some(backup) = self.backup.as_deref_mut() {
            crate::backup::record(backup, dest);
        }
        self.note(Action::WearLevel, Some(victim.page(0)), Some(dest.page(0)));
        tracing::info!("Mapping snapshot migrated from {} to {}", victim, dest);
        self.retire(victim);
        true
    }
}
