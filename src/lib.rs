//! # nandftl - Flash Translation Layer for raw NAND
//!
//! `nandftl` maps a stable logical block/page address space onto raw NAND
//! blocks and pages, the way a managed flash controller would:
//!
//! - **Log-structured writes**: pages are appended and tagged, never rewritten
//! - **Crash-consistent metadata**: the block map is persisted as versioned,
//!   CRC-checked snapshots and recovered at mount
//! - **Wear leveling** across erase counts, with multi-plane awareness
//! - **Bad block handling** and ECC-driven block rejuvenation
//! - **Diagnostics**: persistent action journal, block table, integrity checks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nandftl::{Ftl, FtlConfig, Geometry, LogicalBlock, Result, SimNand};
//!
//! # fn main() -> Result<()> {
//! let nand = SimNand::new(Geometry {
//!     page_size: 2048,
//!     oob_size: 64,
//!     pages_per_block: 64,
//!     block_total: 256,
//!     plane_num: 2,
//! });
//! let mut ftl = Ftl::open(nand, FtlConfig::default())?;
//!
//! ftl.write_page(LogicalBlock(3), 0, &[0x42; 2048])?;
//!
//! let mut buf = vec![0u8; 2048];
//! ftl.read_page(LogicalBlock(3), 0, &mut buf)?;
//!
//! // Persist the mapping; until then the write is not committed
//! ftl.sync()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Block Device
//!
//! ```rust,no_run
//! use nandftl::{BlockDevice, Control, FileNand, FtlConfig, Result};
//!
//! # fn main() -> Result<()> {
//! let nand = FileNand::open("flash.img")?;
//! let mut dev = BlockDevice::init(nand, FtlConfig::load("nftl.toml")?)?;
//!
//! let sectors = dev.geometry().sector_count;
//! let mut buf = vec![0u8; 2048 * 4];
//! dev.read(sectors - 4, &mut buf, 4)?;
//! dev.control(Control::Sync)?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use crate::core::{
    allocator, backup, blockdev, compactor, config, error, ftl, inspect, io, journal, mapping, nand,
    page_map, persist, recent, tag, types,
};

pub use crate::core::{
    allocator::AllocPolicy,
    backup::{BackupRegion, MemoryBackup},
    blockdev::{BlockDevice, BlockGeometry, Control, ControlResponse, SharedBlockDevice},
    config::FtlConfig,
    error::{FtlError, Result},
    ftl::Ftl,
    inspect::{BlockReport, FtlStats, PageFault},
    journal::{Action, JournalEntry},
    mapping::{BlockState, BlockStatus, MappingTable},
    nand::{FileNand, Geometry, NandDevice, NandError, NandResult, ReadStatus, SimNand, SimStats},
    page_map::PageMapping,
    tag::{PageTag, TagStatus},
    types::{LogicalBlock, PageAddr, PhysicalBlock},
};
