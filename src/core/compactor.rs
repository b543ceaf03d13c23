//! Block compaction
//!
//! Rewrites the live pages of a physical block into a freshly allocated one.
//! The same machinery serves garbage collection of full blocks (optionally
//! injecting new page data), rejuvenation of blocks that reported corrected
//! bit errors, partial erases, and repair of torn writes after a restart.

use crate::allocator::AllocPolicy;
use crate::error::Result;
use crate::ftl::Ftl;
use crate::journal::Action;
use crate::mapping::BlockStatus;
use crate::nand::{NandDevice, NandError, NandResult, ReadStatus};
use crate::page_map::PageMapping;
use crate::tag::PageTag;
use crate::types::{LogicalBlock, PageAddr, PhysicalBlock};
use std::ops::Range;

/// New page data written in place of (or in addition to) the old pages
#[derive(Debug, Clone, Copy)]
pub(crate) struct Injection<'a> {
    pub(crate) first_page: u32,
    pub(crate) data: &'a [u8],
}

impl Injection<'_> {
    fn page(&self, logical_page: u32, page_size: usize) -> Option<&[u8]> {
        let index = logical_page.checked_sub(self.first_page)? as usize;
        self.data.chunks(page_size).nth(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    /// Page `n` of the injected data
    Buffer(usize),
    /// An existing physical page
    Page(PageAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PlanItem {
    pub(crate) logical_page: u32,
    pub(crate) source: Source,
}

/// Outcome of copying one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageCopy {
    /// Written and verified; `raw` when the source was uncorrectable and its
    /// bytes were copied as read
    Copied { corrected: bool, raw: bool },
    /// Source page could not be read at all; nothing was written
    Skipped,
    SourceFailed,
    DestFailed,
}

/// Outcome of replaying a plan into a destination block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Replay {
    Done { corrected: bool },
    SourceFailed,
    DestinationFailed,
}

fn is_zero(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

impl<N: NandDevice> Ftl<N> {
    /// Decide, for each logical page of the block, where its new copy comes from
    ///
    /// Injected pages win over old ones; injected all-zero pages are dropped
    /// since an absent page reads as zero. Pages inside `erased` are dropped.
    pub(crate) fn plan(&self, old_map: &PageMapping, inject: Option<&Injection<'_>>, erased: Range<u32>) -> Vec<PlanItem> {
        let page_size = self.geometry.page_size;
        let mut plan = Vec::new();

        for logical_page in 0..self.geometry.pages_per_block {
            if let Some(inject) = inject {
                if let Some(data) = inject.page(logical_page, page_size) {
                    if !is_zero(data) {
                        plan.push(PlanItem {
                            logical_page,
                            source: Source::Buffer((logical_page - inject.first_page) as usize),
                        });
                    }
                    continue;
                }
            }
            if erased.contains(&logical_page) {
                continue;
            }
            if let Some(addr) = old_map.get(logical_page) {
                plan.push(PlanItem {
                    logical_page,
                    source: Source::Page(addr),
                });
            }
        }
        plan
    }

    /// Program the scratch data and OOB buffers into `addr` and read it back
    pub(crate) fn program_verified(&mut self, addr: PageAddr) -> NandResult<ReadStatus> {
        self.cache.invalidate(addr.block);
        self.nand.write_page(addr, &self.scratch.data, &self.scratch.oob)?;
        let status = self.nand.read_page(addr, Some(&mut self.scratch.verify), None)?;
        if self.scratch.verify != self.scratch.data {
            return Err(NandError::Fail);
        }
        Ok(status)
    }

    /// Write one tagged data page; returns whether the read-back was corrected
    pub(crate) fn program_tagged(&mut self, addr: PageAddr, payload: &[u8], logical_page: u32) -> NandResult<bool> {
        self.scratch.data.copy_from_slice(payload);
        PageTag::data(logical_page, self.table.sn()).encode_into(&mut self.scratch.oob);
        let status = self.program_verified(addr)?;
        if status == ReadStatus::Corrected {
            tracing::warn!("Corrected bit errors right after programming {}", addr);
            self.note(Action::BitFlip, Some(addr), None);
        }
        Ok(status == ReadStatus::Corrected)
    }

    /// Copy one page, keeping its spare area (and so its tag) intact
    pub(crate) fn copy_page(&mut self, src: PageAddr, dst: PageAddr, software: bool) -> PageCopy {
        self.cache.invalidate(dst.block);
        if !software && self.nand.supports_move() && self.geometry.same_plane(src.block, dst.block) {
            return self.move_page(src, dst);
        }

        let mut raw = false;
        let mut corrected = false;
        match self
            .nand
            .read_page(src, Some(&mut self.scratch.data), Some(&mut self.scratch.oob))
        {
            Ok(status) => corrected = status == ReadStatus::Corrected,
            Err(NandError::Uncorrectable) if software => {
                tracing::warn!("Uncorrectable source {}, copying raw data", src);
                self.note(Action::SourceError, Some(src), Some(dst));
                raw = true;
            }
            Err(e) if software => {
                tracing::warn!("Source {} unreadable ({}), page skipped", src, e);
                self.note(Action::CopyPageFailed, Some(src), Some(dst));
                return PageCopy::Skipped;
            }
            Err(e) => {
                tracing::warn!("Source {} unreadable ({})", src, e);
                return PageCopy::SourceFailed;
            }
        }

        match self.program_verified(dst) {
            Ok(status) => PageCopy::Copied {
                corrected: corrected || status == ReadStatus::Corrected,
                raw,
            },
            Err(e) => {
                tracing::warn!("Copy {} -> {} failed: {}", src, dst, e);
                PageCopy::DestFailed
            }
        }
    }

    fn move_page(&mut self, src: PageAddr, dst: PageAddr) -> PageCopy {
        if self.nand.move_page(src, dst).is_ok() {
            if let Ok(status) = self.nand.read_page(dst, Some(&mut self.scratch.verify), None) {
                tracing::debug!("Moved {} -> {}", src, dst);
                return PageCopy::Copied {
                    corrected: status == ReadStatus::Corrected,
                    raw: false,
                };
            }
        }

        // tell a bad source from a bad destination
        match self.nand.read_page(src, Some(&mut self.scratch.data), None) {
            Ok(_) => {
                tracing::warn!("Hardware move into {} failed", dst);
                PageCopy::DestFailed
            }
            Err(e) => {
                tracing::warn!("Hardware move from {} failed: source {}", src, e);
                PageCopy::SourceFailed
            }
        }
    }

    /// Write every plan item into consecutive pages of `dest`
    pub(crate) fn replay(
        &mut self,
        dest: PhysicalBlock,
        plan: &[PlanItem],
        inject: Option<&Injection<'_>>,
        software: bool,
    ) -> Replay {
        let page_size = self.geometry.page_size;
        let mut next = 0;
        let mut corrected = false;

        for item in plan {
            let dst = dest.page(next);
            match item.source {
                Source::Buffer(index) => {
                    let Some(payload) = inject.and_then(|i| i.data.chunks(page_size).nth(index)) else {
                        continue;
                    };
                    match self.program_tagged(dst, payload, item.logical_page) {
                        Ok(c) => {
                            corrected |= c;
                            next += 1;
                        }
                        Err(e) => {
                            tracing::warn!("Write to {} failed: {}", dst, e);
                            self.note(Action::WriteFailed, None, Some(dst));
                            return Replay::DestinationFailed;
                        }
                    }
                }
                Source::Page(src) => match self.copy_page(src, dst, software) {
                    PageCopy::Copied { corrected: c, .. } => {
                        corrected |= c;
                        next += 1;
                    }
                    PageCopy::Skipped => {}
                    PageCopy::SourceFailed => return Replay::SourceFailed,
                    PageCopy::DestFailed => {
                        self.note(Action::CopyFailed, Some(src), Some(dst));
                        return Replay::DestinationFailed;
                    }
                },
            }
        }
        Replay::Done { corrected }
    }

    /// Move `logical` out of `old` into a new block
    ///
    /// `old_map` selects the pages carried over, `inject` supplies new page
    /// data and pages in `erased` are dropped. When nothing would remain the
    /// logical block is unmapped instead. Returns whether any written page
    /// read back with corrected bit errors.
    pub(crate) fn relocate(
        &mut self,
        logical: LogicalBlock,
        old: PhysicalBlock,
        old_map: &PageMapping,
        inject: Option<&Injection<'_>>,
        erased: Range<u32>,
        policy: AllocPolicy,
    ) -> Result<bool> {
        let plan = self.plan(old_map, inject, erased);
        if plan.is_empty() {
            self.table.unmap(logical);
            self.dirty = true;
            self.note(Action::UnmapBlock, Some(old.page(0)), None);
            self.retire(old);
            return Ok(false);
        }

        self.with_pin(old, |ftl| {
            let mut software = false;
            loop {
                let dest = ftl.allocate(Some(old), policy)?;
                match ftl.replay(dest, &plan, inject, software) {
                    Replay::Done { corrected } => {
                        ftl.table.map(logical, dest);
                        ftl.dirty = true;
                        let action = if software {
                            Action::SoftwareCopy
                        } else {
                            Action::CopyBlock
                        };
                        ftl.note(action, Some(old.page(0)), Some(dest.page(0)));
                        tracing::debug!("{} relocated from {} to {} ({} pages)", logical, old, dest, plan.len());
                        ftl.retire(old);
                        return Ok(corrected);
                    }
                    Replay::SourceFailed => {
                        tracing::warn!("Source errors in {}, retrying with software copy", old);
                        software = true;
                        ftl.table.set_status(dest, BlockStatus::Free);
                        ftl.note(Action::SourceError, Some(old.page(0)), Some(dest.page(0)));
                    }
                    Replay::DestinationFailed => {
                        tracing::warn!("Destination {} failed during copy, marking bad", dest);
                        ftl.table.mark_bad(dest);
                        ftl.dirty = true;
                        ftl.note(Action::BadBlock, Some(dest.page(0)), None);
                    }
                }
            }
        })
    }

    /// Rewrite a logical block into a fresh physical block
    ///
    /// Used to rejuvenate blocks that reported corrected bit errors. Pages
    /// written since the last flush are carried over.
    pub fn block_copy(&mut self, logical: LogicalBlock) -> Result<()> {
        self.check_logical(logical)?;
        let Some(old) = self.table.lookup(logical) else {
            return Ok(());
        };
        let old_map = self.page_mapping(old)?;
        self.relocate(logical, old, &old_map, None, 0..0, AllocPolicy::Force)?;
        Ok(())
    }

    /// Rewrite a logical block keeping only pages committed by the loaded
    /// snapshot
    pub(crate) fn repair(&mut self, logical: LogicalBlock, old: PhysicalBlock) -> Result<()> {
        let old_map = self.clean_page_mapping(old)?;
        self.relocate(logical, old, &old_map, None, 0..0, AllocPolicy::Force)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FtlConfig;
    use crate::nand::{Geometry, SimNand};

    fn ftl() -> Ftl<SimNand> {
        let geometry = Geometry {
            page_size: 64,
            oob_size: 16,
            pages_per_block: 8,
            block_total: 8,
            plane_num: 1,
        };
        Ftl::open(SimNand::new(geometry), FtlConfig::default()).unwrap()
    }

    #[test]
    fn test_plan_prefers_injected() {
        let ftl = ftl();
        let mut old = PageMapping::empty(PhysicalBlock(2), 8);
        old.record(0, 0);
        old.record(1, 1);
        old.record(5, 2);

        let mut data = vec![7u8; 64 * 2];
        data[64..].fill(0);
        let inject = Injection { first_page: 1, data: &data };
        let plan = ftl.plan(&old, Some(&inject), 0..0);

        assert_eq!(
            plan,
            vec![
                PlanItem { logical_page: 0, source: Source::Page(PhysicalBlock(2).page(0)) },
                PlanItem { logical_page: 1, source: Source::Buffer(0) },
                PlanItem { logical_page: 5, source: Source::Page(PhysicalBlock(2).page(2)) },
            ]
        );
    }

    #[test]
    fn test_plan_drops_erased() {
        let ftl = ftl();
        let mut old = PageMapping::empty(PhysicalBlock(2), 8);
        for lp in 0..4 {
            old.record(lp, lp);
        }
        let plan = ftl.plan(&old, None, 1..3);
        let pages: Vec<u32> = plan.iter().map(|i| i.logical_page).collect();
        assert_eq!(pages, vec![0, 3]);
    }

    #[test]
    fn test_copy_keeps_tag() {
        let mut ftl = ftl();
        let src = PhysicalBlock(5).page(0);
        ftl.program_tagged(src, &[9u8; 64], 3).unwrap();

        let dst = PhysicalBlock(6).page(0);
        assert_eq!(ftl.copy_page(src, dst, false), PageCopy::Copied { corrected: false, raw: false });
        assert_eq!(ftl.nand().page_data(dst), &[9u8; 64][..]);
        assert_eq!(PageTag::decode(ftl.nand().page_oob(dst)).unwrap().logical_page, 3);
    }

    #[test]
    fn test_copy_classifies_source_errors() {
        let mut ftl = ftl();
        let src = PhysicalBlock(5).page(0);
        ftl.program_tagged(src, &[1u8; 64], 0).unwrap();
        ftl.nand_mut().inject_uncorrectable(src);

        assert_eq!(ftl.copy_page(src, PhysicalBlock(6).page(0), false), PageCopy::SourceFailed);
        assert_eq!(
            ftl.copy_page(src, PhysicalBlock(6).page(0), true),
            PageCopy::Copied { corrected: false, raw: true }
        );

        ftl.nand_mut().inject_read_failure(src);
        assert_eq!(ftl.copy_page(src, PhysicalBlock(6).page(1), true), PageCopy::Skipped);
    }

    #[test]
    fn test_hardware_move_same_plane() {
        let geometry = Geometry {
            page_size: 64,
            oob_size: 16,
            pages_per_block: 8,
            block_total: 8,
            plane_num: 2,
        };
        let nand = SimNand::new(geometry).with_hardware_move(true);
        let mut ftl = Ftl::open(nand, FtlConfig::default()).unwrap();
        let src = PhysicalBlock(4).page(0);
        ftl.program_tagged(src, &[5u8; 64], 0).unwrap();

        assert!(matches!(ftl.copy_page(src, PhysicalBlock(6).page(0), false), PageCopy::Copied { .. }));
        assert_eq!(ftl.nand().stats().moves, 1);

        // different plane falls back to read + write
        assert!(matches!(ftl.copy_page(src, PhysicalBlock(7).page(0), false), PageCopy::Copied { .. }));
        assert_eq!(ftl.nand().stats().moves, 1);
    }
}
