//! Identifier newtypes shared across the FTL

use serde::{Deserialize, Serialize};
use std::fmt;

/// A physical NAND erase block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysicalBlock(pub u32);

/// A caller-visible block address, remapped onto physical blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalBlock(pub u32);

/// One physical page: block plus page index inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageAddr {
    pub block: PhysicalBlock,
    pub page: u32,
}

impl PhysicalBlock {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Address of a page inside this block
    pub fn page(self, page: u32) -> PageAddr {
        PageAddr { block: self, page }
    }

    /// Plane this block lives on (`plane_num` must be a power of two)
    pub fn plane(self, plane_num: u32) -> u32 {
        if plane_num <= 1 {
            0
        } else {
            self.0 & (plane_num - 1)
        }
    }
}

impl LogicalBlock {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl PageAddr {
    /// Absolute page number across the device
    pub fn absolute(self, pages_per_block: u32) -> u64 {
        self.block.0 as u64 * pages_per_block as u64 + self.page as u64
    }
}

impl fmt::Display for PhysicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

impl fmt::Display for LogicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

impl fmt::Display for PageAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.page)
    }
}
