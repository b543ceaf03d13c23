//! Diagnostic journal
//!
//! A fixed-size ring of recent FTL actions and failures. It is written into
//! every mapping snapshot right after the table, so the history of the last
//! session survives a restart and can be inspected with `nftl-tool log`.
//! The write cursor lives in the mapping table (`log_index`).

use crate::error::Result;
use crate::ftl::Ftl;
use crate::mapping::codec;
use crate::nand::NandDevice;
use crate::types::{PageAddr, PhysicalBlock};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Encoded size of one entry
pub const ENTRY_SIZE: usize = 16;

const NO_BLOCK: u32 = u32::MAX;
const NO_PAGE: u16 = u16::MAX;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Empty = 0,
    WritePage = 1,
    ReadPage = 2,
    CopyBlock = 3,
    AllocBlock = 4,
    SoftwareCopy = 5,
    FlushMapping = 6,
    MapBlock = 7,
    UnmapBlock = 8,
    WearLevel = 10,
    EraseRange = 11,
    FlushRecent = 12,
    BadBlock = 13,
    SessionDone = 128,
    CopyFailed = 129,
    ReadFailed = 130,
    WriteFailed = 131,
    BitFlip = 132,
    TagCorrupt = 133,
    PageMappingFailed = 134,
    SourceError = 135,
    CopyPageFailed = 136,
}

impl Action {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::WritePage,
            2 => Self::ReadPage,
            3 => Self::CopyBlock,
            4 => Self::AllocBlock,
            5 => Self::SoftwareCopy,
            6 => Self::FlushMapping,
            7 => Self::MapBlock,
            8 => Self::UnmapBlock,
            10 => Self::WearLevel,
            11 => Self::EraseRange,
            12 => Self::FlushRecent,
            13 => Self::BadBlock,
            128 => Self::SessionDone,
            129 => Self::CopyFailed,
            130 => Self::ReadFailed,
            131 => Self::WriteFailed,
            132 => Self::BitFlip,
            133 => Self::TagCorrupt,
            134 => Self::PageMappingFailed,
            135 => Self::SourceError,
            136 => Self::CopyPageFailed,
            _ => Self::Empty,
        }
    }

    /// Whether the action records a failure rather than normal activity
    pub fn is_failure(self) -> bool {
        (self as u8) > Action::SessionDone as u8 || self == Action::BadBlock
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::WritePage => "write page",
            Self::ReadPage => "read page",
            Self::CopyBlock => "copy block",
            Self::AllocBlock => "alloc block",
            Self::SoftwareCopy => "software copy",
            Self::FlushMapping => "flush mapping",
            Self::MapBlock => "map block",
            Self::UnmapBlock => "unmap block",
            Self::WearLevel => "wear leveling",
            Self::EraseRange => "erase range",
            Self::FlushRecent => "flush recent",
            Self::BadBlock => "bad block",
            Self::SessionDone => "session done",
            Self::CopyFailed => "copy failed",
            Self::ReadFailed => "read failed",
            Self::WriteFailed => "write failed",
            Self::BitFlip => "bit flip",
            Self::TagCorrupt => "page tag corrupt",
            Self::PageMappingFailed => "page mapping failed",
            Self::SourceError => "source page error",
            Self::CopyPageFailed => "copy page failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    action: u8,
    reserved: u8,
    src_page: u16,
    dst_page: u16,
    reserved2: u16,
    src_block: u32,
    dst_block: u32,
}

impl Default for JournalEntry {
    fn default() -> Self {
        JournalEntry::new(Action::Empty, None, None)
    }
}

impl JournalEntry {
    pub fn new(action: Action, src: Option<PageAddr>, dst: Option<PageAddr>) -> Self {
        let split = |addr: Option<PageAddr>| match addr {
            Some(a) => (a.block.0, a.page as u16),
            None => (NO_BLOCK, NO_PAGE),
        };
        let (src_block, src_page) = split(src);
        let (dst_block, dst_page) = split(dst);
        JournalEntry {
            action: action as u8,
            reserved: 0xFF,
            src_page,
            dst_page,
            reserved2: 0xFFFF,
            src_block,
            dst_block,
        }
    }

    pub fn action(&self) -> Action {
        Action::from_u8(self.action)
    }

    pub fn src(&self) -> Option<PageAddr> {
        Self::join(self.src_block, self.src_page)
    }

    pub fn dst(&self) -> Option<PageAddr> {
        Self::join(self.dst_block, self.dst_page)
    }

    fn join(block: u32, page: u16) -> Option<PageAddr> {
        if block == NO_BLOCK {
            None
        } else {
            Some(PhysicalBlock(block).page(page as u32))
        }
    }
}

impl fmt::Display for JournalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.action().label())?;
        match (self.src(), self.dst()) {
            (Some(src), Some(dst)) => write!(f, " {} -> {}", src, dst),
            (Some(src), None) => write!(f, " {}", src),
            (None, Some(dst)) => write!(f, " -> {}", dst),
            (None, None) => Ok(()),
        }
    }
}

/// Ring of journal entries indexed by a free-running cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn new(capacity: usize) -> Self {
        Journal {
            entries: vec![JournalEntry::default(); capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Store `entry` at `cursor`, overwriting the oldest slot once full
    pub fn record(&mut self, cursor: u32, entry: JournalEntry) {
        if self.entries.is_empty() {
            return;
        }
        let slot = cursor as usize % self.entries.len();
        self.entries[slot] = entry;
    }

    /// Non-empty entries, oldest first, given the next write cursor
    pub fn chronological(&self, cursor: u32) -> Vec<JournalEntry> {
        let cap = self.entries.len();
        if cap == 0 {
            return Vec::new();
        }
        let start = cursor as usize % cap;
        (0..cap)
            .map(|i| self.entries[(start + i) % cap])
            .filter(|e| e.action() != Action::Empty)
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.fill(JournalEntry::default());
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(codec().serialize(&self.entries)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let entries: Vec<JournalEntry> = codec().deserialize(bytes)?;
        Ok(Journal { entries })
    }

    /// Encoded size of a journal with `capacity` entries
    pub fn encoded_len(capacity: usize) -> usize {
        std::mem::size_of::<u64>() + capacity * ENTRY_SIZE
    }

    /// Largest capacity whose encoding fits in `bytes`
    pub fn capacity_for(bytes: usize) -> usize {
        bytes.saturating_sub(std::mem::size_of::<u64>()) / ENTRY_SIZE
    }
}

impl<N: NandDevice> Ftl<N> {
    /// Append an action to the diagnostic journal
    pub(crate) fn note(&mut self, action: Action, src: Option<PageAddr>, dst: Option<PageAddr>) {
        let cursor = self.table.log_index();
        self.journal.record(cursor, JournalEntry::new(action, src, dst));
        self.table.set_log_index(cursor.wrapping_add(1));
    }

    /// Journal entries, oldest first
    pub fn journal_entries(&self) -> Vec<JournalEntry> {
        self.journal.chronological(self.table.log_index())
    }

    /// Drop every journal entry and persist the empty journal
    pub fn clear_journal(&mut self) -> Result<()> {
        self.journal.clear();
        self.table.set_log_index(0);
        self.flush()
    }
}
