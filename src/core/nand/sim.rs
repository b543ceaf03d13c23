//! In-memory NAND simulator
//!
//! Behaves like a raw NAND part: erased pages read as `0xFF`, a page can be
//! programmed once per erase cycle, and every operation can be made to fail.
//! Faults are injected per block or per page and persist until the block is
//! erased, which mirrors how real bit errors and worn cells behave.
//!
//! A program budget simulates power loss: once it is exhausted every erase
//! and program fails without touching the array, so the contents left behind
//! are exactly what a remount would find.

use super::{Geometry, NandDevice, NandError, NandResult, ReadStatus};
use crate::types::{PageAddr, PhysicalBlock};
use std::collections::HashSet;

/// Operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub reads: u64,
    pub writes: u64,
    pub erases: u64,
    pub moves: u64,
    /// Programs aimed at a page that was not erased
    pub overwrite_violations: u64,
}

#[derive(Debug, Clone, Default)]
struct FaultPlan {
    bad_erase: HashSet<PhysicalBlock>,
    bad_write: HashSet<PhysicalBlock>,
    fail_write_once: HashSet<PageAddr>,
    corrected: HashSet<PageAddr>,
    uncorrectable: HashSet<PageAddr>,
    read_fail: HashSet<PageAddr>,
}

impl FaultPlan {
    fn forget_block(&mut self, block: PhysicalBlock) {
        self.fail_write_once.retain(|a| a.block != block);
        self.corrected.retain(|a| a.block != block);
        self.uncorrectable.retain(|a| a.block != block);
        self.read_fail.retain(|a| a.block != block);
    }
}

#[derive(Debug, Clone)]
pub struct SimNand {
    geometry: Geometry,
    data: Vec<u8>,
    oob: Vec<u8>,
    programmed: Vec<bool>,
    erase_counts: Vec<u32>,
    faults: FaultPlan,
    stats: SimStats,
    hardware_move: bool,
    program_budget: Option<u64>,
}

impl SimNand {
    /// Create a fully erased device
    pub fn new(geometry: Geometry) -> Self {
        let pages = geometry.total_pages() as usize;
        SimNand {
            geometry,
            data: vec![0xFF; pages * geometry.page_size],
            oob: vec![0xFF; pages * geometry.oob_size],
            programmed: vec![false; pages],
            erase_counts: vec![0; geometry.block_total as usize],
            faults: FaultPlan::default(),
            stats: SimStats::default(),
            hardware_move: false,
            program_budget: None,
        }
    }

    /// Enable same-plane copy-back support
    pub fn with_hardware_move(mut self, enabled: bool) -> Self {
        self.hardware_move = enabled;
        self
    }

    pub fn stats(&self) -> SimStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = SimStats::default();
    }

    /// Erases the device has performed on `block`
    pub fn erase_count(&self, block: PhysicalBlock) -> u32 {
        self.erase_counts.get(block.index()).copied().unwrap_or(0)
    }

    pub fn is_programmed(&self, addr: PageAddr) -> bool {
        self.slot(addr).map(|i| self.programmed[i]).unwrap_or(false)
    }

    /// Raw data bytes of a page
    pub fn page_data(&self, addr: PageAddr) -> &[u8] {
        match self.slot(addr) {
            Some(i) => &self.data[i * self.geometry.page_size..(i + 1) * self.geometry.page_size],
            None => &[],
        }
    }

    /// Raw spare bytes of a page
    pub fn page_oob(&self, addr: PageAddr) -> &[u8] {
        match self.slot(addr) {
            Some(i) => &self.oob[i * self.geometry.oob_size..(i + 1) * self.geometry.oob_size],
            None => &[],
        }
    }

    /// Every erase of `block` fails from now on
    pub fn fail_erase(&mut self, block: PhysicalBlock) {
        self.faults.bad_erase.insert(block);
    }

    /// Every program into `block` fails from now on
    pub fn fail_writes(&mut self, block: PhysicalBlock) {
        self.faults.bad_write.insert(block);
    }

    /// The next program of `addr` fails, leaving the page unusable
    pub fn fail_write_once(&mut self, addr: PageAddr) {
        self.faults.fail_write_once.insert(addr);
    }

    /// Reads of `addr` report corrected bit errors until the block is erased
    pub fn inject_corrected(&mut self, addr: PageAddr) {
        self.faults.corrected.insert(addr);
    }

    /// Reads of `addr` are uncorrectable until the block is erased
    pub fn inject_uncorrectable(&mut self, addr: PageAddr) {
        self.faults.uncorrectable.insert(addr);
    }

    /// Reads of `addr` fail outright until the block is erased
    pub fn inject_read_failure(&mut self, addr: PageAddr) {
        self.faults.read_fail.insert(addr);
    }

    pub fn clear_faults(&mut self) {
        self.faults = FaultPlan::default();
    }

    /// Allow only `budget` more erases/programs; `None` removes the limit
    pub fn set_program_budget(&mut self, budget: Option<u64>) {
        self.program_budget = budget;
    }

    /// Overwrite a page's spare area, bypassing program rules
    pub fn corrupt_oob(&mut self, addr: PageAddr, oob: &[u8]) {
        if let Some(i) = self.slot(addr) {
            let size = self.geometry.oob_size;
            let len = oob.len().min(size);
            self.oob[i * size..i * size + len].copy_from_slice(&oob[..len]);
        }
    }

    /// Overwrite a page's data, bypassing program rules
    pub fn corrupt_data(&mut self, addr: PageAddr, data: &[u8]) {
        if let Some(i) = self.slot(addr) {
            let size = self.geometry.page_size;
            let len = data.len().min(size);
            self.data[i * size..i * size + len].copy_from_slice(&data[..len]);
        }
    }

    fn slot(&self, addr: PageAddr) -> Option<usize> {
        if self.geometry.contains(addr) {
            Some(addr.absolute(self.geometry.pages_per_block) as usize)
        } else {
            None
        }
    }

    fn consume_budget(&mut self) -> NandResult<()> {
        match self.program_budget {
            Some(0) => Err(NandError::Fail),
            Some(ref mut left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Leave a half-programmed page behind after a failed program
    fn scribble(&mut self, slot: usize) {
        let (ps, os) = (self.geometry.page_size, self.geometry.oob_size);
        self.data[slot * ps..(slot + 1) * ps].fill(0x00);
        self.oob[slot * os..(slot + 1) * os].fill(0x00);
        self.programmed[slot] = true;
    }

    fn program(&mut self, addr: PageAddr, data: &[u8], oob: &[u8]) -> NandResult<()> {
        let slot = self.slot(addr).ok_or(NandError::OutOfRange)?;
        self.consume_budget()?;

        if self.programmed[slot] {
            self.stats.overwrite_violations += 1;
            return Err(NandError::Fail);
        }
        if self.faults.bad_write.contains(&addr.block) || self.faults.fail_write_once.remove(&addr) {
            self.scribble(slot);
            return Err(NandError::Fail);
        }

        let (ps, os) = (self.geometry.page_size, self.geometry.oob_size);
        self.data[slot * ps..(slot + 1) * ps].copy_from_slice(data);
        self.oob[slot * os..(slot + 1) * os].copy_from_slice(oob);
        self.programmed[slot] = true;
        Ok(())
    }
}

impl NandDevice for SimNand {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn erase_block(&mut self, block: PhysicalBlock) -> NandResult<()> {
        if block.0 >= self.geometry.block_total {
            return Err(NandError::OutOfRange);
        }
        self.consume_budget()?;
        self.stats.erases += 1;
        if self.faults.bad_erase.contains(&block) {
            return Err(NandError::Fail);
        }

        let ppb = self.geometry.pages_per_block as usize;
        let first = block.index() * ppb;
        let (ps, os) = (self.geometry.page_size, self.geometry.oob_size);
        self.data[first * ps..(first + ppb) * ps].fill(0xFF);
        self.oob[first * os..(first + ppb) * os].fill(0xFF);
        self.programmed[first..first + ppb].fill(false);
        self.erase_counts[block.index()] += 1;
        self.faults.forget_block(block);
        Ok(())
    }

    fn read_page(
        &mut self,
        addr: PageAddr,
        data: Option<&mut [u8]>,
        oob: Option<&mut [u8]>,
    ) -> NandResult<ReadStatus> {
        let slot = self.slot(addr).ok_or(NandError::OutOfRange)?;
        self.stats.reads += 1;
        if self.faults.read_fail.contains(&addr) {
            return Err(NandError::Fail);
        }

        let (ps, os) = (self.geometry.page_size, self.geometry.oob_size);
        let uncorrectable = self.faults.uncorrectable.contains(&addr);
        if let Some(buf) = data {
            let len = buf.len().min(ps);
            buf[..len].copy_from_slice(&self.data[slot * ps..slot * ps + len]);
            if uncorrectable && len > 0 {
                buf[0] ^= 0x01;
            }
        }
        if let Some(buf) = oob {
            let len = buf.len().min(os);
            buf[..len].copy_from_slice(&self.oob[slot * os..slot * os + len]);
        }

        if uncorrectable {
            Err(NandError::Uncorrectable)
        } else if self.faults.corrected.contains(&addr) {
            Ok(ReadStatus::Corrected)
        } else {
            Ok(ReadStatus::Clean)
        }
    }

    fn write_page(&mut self, addr: PageAddr, data: &[u8], oob: &[u8]) -> NandResult<()> {
        if data.len() != self.geometry.page_size || oob.len() != self.geometry.oob_size {
            return Err(NandError::OutOfRange);
        }
        self.stats.writes += 1;
        self.program(addr, data, oob)
    }

    fn supports_move(&self) -> bool {
        self.hardware_move
    }

    fn move_page(&mut self, src: PageAddr, dst: PageAddr) -> NandResult<()> {
        if !self.hardware_move {
            return Err(NandError::Unsupported);
        }
        let src_slot = self.slot(src).ok_or(NandError::OutOfRange)?;
        self.stats.moves += 1;
        if self.faults.read_fail.contains(&src) || self.faults.uncorrectable.contains(&src) {
            return Err(NandError::Fail);
        }

        let (ps, os) = (self.geometry.page_size, self.geometry.oob_size);
        let data = self.data[src_slot * ps..(src_slot + 1) * ps].to_vec();
        let oob = self.oob[src_slot * os..(src_slot + 1) * os].to_vec();
        self.program(dst, &data, &oob)
    }
}
