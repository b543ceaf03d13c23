use crate::nand::NandError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FtlError {
    #[error("NAND error: {0}")]
    Nand(#[from] NandError),

    #[error("Out of space: no usable free block")]
    OutOfSpace,

    #[error("Read failed at physical block {block} page {page}")]
    ReadFailed { block: u32, page: u32 },

    #[error("Page mapping scan failed at physical block {block} page {page}")]
    PageMapping { block: u32, page: u32 },

    #[error("Invalid logical address: block {block}, page {page}")]
    InvalidAddress { block: u32, page: u32 },

    #[error("Invalid logical range: pages {begin}..{end}")]
    InvalidRange { begin: u64, end: u64 },

    #[error("Buffer length mismatch: expected {expected} bytes, got {actual}")]
    BufferSize { expected: usize, actual: usize },

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid physical block: {0}")]
    InvalidBlock(u32),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Mapping table checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("Unsupported mapping format version: {0:#010x}")]
    UnsupportedVersion(u32),

    #[error("Corrupt mapping table: {0}")]
    CorruptMapping(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FtlError>;
