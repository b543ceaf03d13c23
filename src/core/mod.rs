//! FTL core
//!
//! ## Storage layer
//!
//! - [`nand`] - NAND driver trait, simulator and image-file device
//! - [`tag`] - Per-page spare-area tag
//! - [`mapping`] - Persistent logical-to-physical block table
//! - [`page_map`] - Page mapping rebuilt from tags, with an LRU cache
//!
//! ## Operations
//!
//! - [`allocator`] - Free block selection and wear leveling
//! - [`compactor`] - Block copy / garbage collection
//! - [`recent`] - Delayed reclamation of unmapped blocks
//! - [`persist`] - Mapping snapshots and recovery
//! - [`io`] - Logical page read, write and erase
//! - [`blockdev`] - Sector-addressed adapter
//!
//! ## Diagnostics
//!
//! - [`journal`] - Persistent ring of recent actions and failures
//! - [`backup`] - Optional persistent pointers to recent snapshots
//! - [`inspect`] - Statistics, block table and integrity checks

pub mod allocator;
pub mod backup;
pub mod blockdev;
pub mod compactor;
pub mod config;
pub mod error;
pub mod ftl;
pub mod inspect;
pub mod io;
pub mod journal;
pub mod mapping;
pub mod nand;
pub mod page_map;
pub mod persist;
pub mod recent;
pub mod tag;
pub mod types;
