//! Per-page tag stored in the spare area
//!
//! Every page the FTL programs carries a small tag at the tail of its OOB
//! region. Tags are how the page mapping of a block is rebuilt after a
//! restart, and their sequence numbers are how recovery tells committed pages
//! from pages written after the last mapping snapshot.
//!
//! Layout (little-endian, 10 bytes):
//!
//! | offset | size | field        |
//! |--------|------|--------------|
//! | 0      | 2    | magic        |
//! | 2      | 1    | status       |
//! | 3      | 1    | reserved     |
//! | 4      | 2    | logical page |
//! | 6      | 4    | sn           |

pub const TAG_MAGIC: u16 = 0xA55A;
pub const TAG_SIZE: usize = 10;

/// Logical page value carried by mapping snapshot pages
pub const MAPPING_PAGE_SENTINEL: u16 = 0xFFEE;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagStatus {
    Used = 0x55,
    Empty = 0xFF,
    MappingSignature = 0xEE,
}

impl TagStatus {
    /// Unknown values read as `Empty`
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x55 => Self::Used,
            0xEE => Self::MappingSignature,
            _ => Self::Empty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTag {
    pub status: TagStatus,
    pub logical_page: u16,
    pub sn: u32,
}

impl PageTag {
    /// Tag for a data page holding `logical_page`
    pub fn data(logical_page: u32, sn: u32) -> Self {
        PageTag {
            status: TagStatus::Used,
            logical_page: logical_page as u16,
            sn,
        }
    }

    /// Tag for a mapping snapshot page
    pub fn mapping(sn: u32) -> Self {
        PageTag {
            status: TagStatus::MappingSignature,
            logical_page: MAPPING_PAGE_SENTINEL,
            sn,
        }
    }

    pub fn is_mapping_signature(&self) -> bool {
        self.status == TagStatus::MappingSignature && self.logical_page == MAPPING_PAGE_SENTINEL
    }

    fn offset(oob_len: usize) -> usize {
        oob_len - TAG_SIZE
    }

    /// Fill `oob` with the erased pattern and place the tag at its tail
    pub fn encode_into(&self, oob: &mut [u8]) {
        oob.fill(0xFF);
        let at = Self::offset(oob.len());
        oob[at..at + 2].copy_from_slice(&TAG_MAGIC.to_le_bytes());
        oob[at + 2] = self.status as u8;
        oob[at + 4..at + 6].copy_from_slice(&self.logical_page.to_le_bytes());
        oob[at + 6..at + 10].copy_from_slice(&self.sn.to_le_bytes());
    }

    /// Decode the tag of a spare area; `None` when the magic is absent
    pub fn decode(oob: &[u8]) -> Option<Self> {
        if oob.len() < TAG_SIZE {
            return None;
        }
        let at = Self::offset(oob.len());
        if u16::from_le_bytes([oob[at], oob[at + 1]]) != TAG_MAGIC {
            return None;
        }
        Some(PageTag {
            status: TagStatus::from_u8(oob[at + 2]),
            logical_page: u16::from_le_bytes([oob[at + 4], oob[at + 5]]),
            sn: u32::from_le_bytes([oob[at + 6], oob[at + 7], oob[at + 8], oob[at + 9]]),
        })
    }
}
