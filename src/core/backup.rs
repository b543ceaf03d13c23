//! Backup pointer region
//!
//! Some boards have a few battery-backed registers that survive resets. When
//! present they hold the ids of the most recent mapping blocks, so a mount
//! can go straight to the right block instead of scanning the whole device.
//!
//! Register layout: `slots` block ids (newest first, `u32::MAX` when empty)
//! followed by a signature `0xAEEA_0000 | (sum_of_slots & 0xFFFF)`.

use crate::types::PhysicalBlock;

pub const BACKUP_SIGNATURE: u32 = 0xAEEA_0000;
pub const BACKUP_SLOTS: usize = 4;

const EMPTY_SLOT: u32 = u32::MAX;

/// A small bank of persistent 32-bit registers
pub trait BackupRegion: Send {
    /// Number of registers
    fn len(&self) -> usize;

    fn read(&self, index: usize) -> u32;

    fn write(&mut self, index: usize, value: u32);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Register bank held in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBackup {
    registers: Vec<u32>,
}

impl MemoryBackup {
    /// Zeroed registers for `slots` ids plus the signature
    pub fn new(slots: usize) -> Self {
        MemoryBackup {
            registers: vec![0; slots + 1],
        }
    }

    pub fn registers(&self) -> &[u32] {
        &self.registers
    }
}

impl Default for MemoryBackup {
    fn default() -> Self {
        Self::new(BACKUP_SLOTS)
    }
}

impl BackupRegion for MemoryBackup {
    fn len(&self) -> usize {
        self.registers.len()
    }

    fn read(&self, index: usize) -> u32 {
        self.registers.get(index).copied().unwrap_or(0)
    }

    fn write(&mut self, index: usize, value: u32) {
        if let Some(reg) = self.registers.get_mut(index) {
            *reg = value;
        }
    }
}

fn signature(slots: &[u32]) -> u32 {
    let sum = slots.iter().fold(0u32, |acc, &v| acc.wrapping_add(v));
    BACKUP_SIGNATURE | (sum & 0xFFFF)
}

fn slots(region: &dyn BackupRegion) -> Vec<u32> {
    (0..region.len().saturating_sub(1)).map(|i| region.read(i)).collect()
}

/// Mapping block candidates, newest first; `None` when the signature is invalid
pub fn candidates(region: &dyn BackupRegion) -> Option<Vec<PhysicalBlock>> {
    if region.len() < 2 {
        return None;
    }
    let ids = slots(region);
    if region.read(ids.len()) != signature(&ids) {
        return None;
    }
    Some(
        ids.into_iter()
            .filter(|&id| id != EMPTY_SLOT)
            .map(PhysicalBlock)
            .collect(),
    )
}

/// Record a new mapping block as the newest entry
pub fn record(region: &mut dyn BackupRegion, block: PhysicalBlock) {
    if region.len() < 2 {
        return;
    }
    let mut ids = match candidates(region) {
        Some(_) => slots(region),
        None => vec![EMPTY_SLOT; region.len() - 1],
    };
    if ids.first() == Some(&block.0) {
        return;
    }
    ids.pop();
    ids.insert(0, block.0);

    for (i, &id) in ids.iter().enumerate() {
        region.write(i, id);
    }
    region.write(ids.len(), signature(&ids));
}

/// Invalidate the region
pub fn clear(region: &mut dyn BackupRegion) {
    for i in 0..region.len() {
        region.write(i, 0);
    }
}
