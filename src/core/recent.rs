//! Recent-free queue
//!
//! A physical block that stops being referenced cannot be erased right away:
//! the mapping snapshot on flash may still point at it, and after a power
//! loss that snapshot is what gets loaded. Such blocks wait here as
//! `RecentlyFreed` until a newer snapshot has been persisted, and the oldest
//! of them are then released back to the allocator.

use crate::ftl::Ftl;
use crate::journal::Action;
use crate::mapping::BlockStatus;
use crate::nand::NandDevice;
use crate::types::PhysicalBlock;

#[derive(Debug, Clone)]
pub struct RecentQueue {
    blocks: Vec<PhysicalBlock>,
    capacity: usize,
}

impl RecentQueue {
    pub fn new(capacity: usize) -> Self {
        RecentQueue {
            blocks: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.blocks.len() >= self.capacity
    }

    pub fn contains(&self, block: PhysicalBlock) -> bool {
        self.blocks.contains(&block)
    }

    /// Queued blocks, oldest first
    pub fn blocks(&self) -> &[PhysicalBlock] {
        &self.blocks
    }

    /// Append a block; a block already queued is not queued twice
    pub fn push(&mut self, block: PhysicalBlock) {
        if !self.contains(block) {
            self.blocks.push(block);
        }
    }

    /// Release the oldest three quarters once more than a quarter is queued
    ///
    /// Blocks in `pinned` are kept queued. Returns the released blocks.
    pub fn drain(&mut self, pinned: &[PhysicalBlock]) -> Vec<PhysicalBlock> {
        if self.blocks.len() <= self.capacity / 4 {
            return Vec::new();
        }

        let count = self.blocks.len() * 3 / 4;
        let mut kept = Vec::with_capacity(self.capacity);
        let mut released = Vec::with_capacity(count);
        for (i, &block) in self.blocks.iter().enumerate() {
            if i < count && !pinned.contains(&block) {
                released.push(block);
            } else {
                kept.push(block);
            }
        }
        self.blocks = kept;
        released
    }

    /// Release every block except those in `pinned`
    pub fn drain_all(&mut self, pinned: &[PhysicalBlock]) -> Vec<PhysicalBlock> {
        let (kept, released): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.blocks).into_iter().partition(|b| pinned.contains(b));
        self.blocks = kept;
        released
    }

    /// Whether any queued block could be released
    pub fn has_unpinned(&self, pinned: &[PhysicalBlock]) -> bool {
        self.blocks.iter().any(|b| !pinned.contains(b))
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

impl<N: NandDevice> Ftl<N> {
    /// Queue a block for delayed reclamation, flushing once the queue is full
    pub(crate) fn recent_push(&mut self, block: PhysicalBlock) {
        self.recent.push(block);
        if self.recent.is_full() && !self.recovering {
            tracing::debug!("Recent queue full ({} blocks), flushing mapping", self.recent.len());
            if let Err(e) = self.flush() {
                tracing::warn!("Flush on full recent queue failed: {}", e);
            }
        }
    }

    /// Release the oldest queued blocks back to the allocator
    pub(crate) fn recent_drain(&mut self) {
        let released = self.recent.drain(&self.pins);
        self.release(&released);
    }

    /// Release every unpinned queued block; only valid right after a flush
    pub(crate) fn recent_release_all(&mut self) {
        let released = self.recent.drain_all(&self.pins);
        self.release(&released);
    }

    fn release(&mut self, released: &[PhysicalBlock]) {
        if released.is_empty() {
            return;
        }
        for &block in released {
            if self.table.status(block) == BlockStatus::RecentlyFreed {
                self.table.set_status(block, BlockStatus::Free);
            }
        }
        tracing::debug!("Released {} recently freed blocks", released.len());
        self.note(Action::FlushRecent, Some(released[0].page(0)), None);
    }

    /// Stop using `block`: queue it for reclamation unless it is Bad
    pub(crate) fn retire(&mut self, block: PhysicalBlock) {
        if self.table.status(block) == BlockStatus::Bad {
            return;
        }
        self.table.set_status(block, BlockStatus::RecentlyFreed);
        self.dirty = true;
        self.recent_push(block);
    }
}
