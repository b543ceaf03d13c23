//! Raw NAND primitives consumed by the FTL
//!
//! The FTL never talks to hardware directly. Everything goes through
//! [`NandDevice`], which exposes exactly the operations a NAND driver offers:
//! block erase, page program, page read with an ECC verdict, and an optional
//! same-plane copy-back.
//!
//! Two implementations ship with the crate:
//! - [`SimNand`]: in-memory device with fault injection, used by the tests
//! - [`FileNand`]: memory-mapped image file, used by `nftl-tool`

pub mod file;
pub mod sim;

pub use file::FileNand;
pub use sim::{SimNand, SimStats};

use crate::error::{FtlError, Result};
use crate::tag::{MAPPING_PAGE_SENTINEL, TAG_SIZE};
use crate::types::{PageAddr, PhysicalBlock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a NAND primitive
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NandError {
    #[error("operation failed")]
    Fail,

    #[error("uncorrectable ECC error")]
    Uncorrectable,

    #[error("operation not supported by device")]
    Unsupported,

    #[error("address out of range")]
    OutOfRange,
}

pub type NandResult<T> = std::result::Result<T, NandError>;

/// Outcome of a successful page read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Data read without bit errors
    Clean,
    /// ECC corrected bit errors; the data is good but the page is degrading
    Corrected,
}

/// Physical layout of a NAND device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Data bytes per page
    pub page_size: usize,
    /// Spare (out-of-band) bytes per page
    pub oob_size: usize,
    /// Pages in one erase block
    pub pages_per_block: u32,
    /// Number of erase blocks
    pub block_total: u32,
    /// Number of planes (power of two); blocks interleave across planes
    pub plane_num: u32,
}

impl Geometry {
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(FtlError::InvalidGeometry("page_size must be non-zero".into()));
        }
        if self.oob_size < TAG_SIZE {
            return Err(FtlError::InvalidGeometry(format!(
                "oob_size {} cannot hold a {}-byte page tag",
                self.oob_size, TAG_SIZE
            )));
        }
        if self.pages_per_block < 2 || self.pages_per_block >= MAPPING_PAGE_SENTINEL as u32 {
            return Err(FtlError::InvalidGeometry(format!(
                "pages_per_block {} out of range",
                self.pages_per_block
            )));
        }
        if self.block_total < 4 {
            return Err(FtlError::InvalidGeometry(format!(
                "block_total {} is too small",
                self.block_total
            )));
        }
        if self.plane_num == 0 || !self.plane_num.is_power_of_two() || self.plane_num > self.block_total {
            return Err(FtlError::InvalidGeometry(format!(
                "plane_num {} must be a power of two no larger than block_total",
                self.plane_num
            )));
        }
        Ok(())
    }

    pub fn total_pages(&self) -> u64 {
        self.block_total as u64 * self.pages_per_block as u64
    }

    pub fn block_bytes(&self) -> usize {
        self.page_size * self.pages_per_block as usize
    }

    pub fn same_plane(&self, a: PhysicalBlock, b: PhysicalBlock) -> bool {
        a.plane(self.plane_num) == b.plane(self.plane_num)
    }

    pub fn contains(&self, addr: PageAddr) -> bool {
        addr.block.0 < self.block_total && addr.page < self.pages_per_block
    }
}

/// NAND driver interface
///
/// Reads fill the supplied buffers; on [`NandError::Uncorrectable`] the
/// buffers still hold the raw (possibly corrupted) bytes the device returned.
/// Programs must target erased pages.
pub trait NandDevice {
    /// Device geometry
    fn geometry(&self) -> Geometry;

    /// Erase one block, returning every page to the erased state
    fn erase_block(&mut self, block: PhysicalBlock) -> NandResult<()>;

    /// Read a page's data and/or spare area
    fn read_page(
        &mut self,
        addr: PageAddr,
        data: Option<&mut [u8]>,
        oob: Option<&mut [u8]>,
    ) -> NandResult<ReadStatus>;

    /// Program a page's data and spare area
    fn write_page(&mut self, addr: PageAddr, data: &[u8], oob: &[u8]) -> NandResult<()>;

    /// Whether [`NandDevice::move_page`] is available
    fn supports_move(&self) -> bool {
        false
    }

    /// Same-plane hardware copy-back
    fn move_page(&mut self, _src: PageAddr, _dst: PageAddr) -> NandResult<()> {
        Err(NandError::Unsupported)
    }
}
