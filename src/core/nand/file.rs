//! NAND image file backed by a memory map
//!
//! Layout: a 64-byte header followed by every page as `[data][oob]`, in
//! block order. Erased bytes are `0xFF`.

use super::{Geometry, NandDevice, NandError, NandResult, ReadStatus};
use crate::error::{FtlError, Result};
use crate::types::{PageAddr, PhysicalBlock};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub const IMAGE_MAGIC: [u8; 8] = *b"NFTLIMG\x00";
pub const IMAGE_VERSION: u32 = 1;
pub const IMAGE_HEADER_SIZE: usize = 64;

pub struct FileNand {
    mmap: MmapMut,
    geometry: Geometry,
    path: PathBuf,
}

impl FileNand {
    /// Create a new, fully erased image
    pub fn create<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self> {
        geometry.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(Self::image_len(&geometry))?;

        // SAFETY: the file was just created by us and is only mutated through this map.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap.fill(0xFF);
        mmap[..IMAGE_HEADER_SIZE].copy_from_slice(&Self::encode_header(&geometry));
        mmap.flush()?;

        tracing::info!(
            "Created NAND image {:?}: {} blocks x {} pages x {} bytes",
            path.as_ref(),
            geometry.block_total,
            geometry.pages_per_block,
            geometry.page_size
        );

        Ok(FileNand {
            mmap,
            geometry,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Open an existing image
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len < IMAGE_HEADER_SIZE as u64 {
            return Err(FtlError::InvalidImage(format!("file too short: {} bytes", len)));
        }

        // SAFETY: the image is not expected to be modified by other processes while open.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let geometry = Self::decode_header(&mmap[..IMAGE_HEADER_SIZE])?;
        if len < Self::image_len(&geometry) {
            return Err(FtlError::InvalidImage(format!(
                "file holds {} bytes, geometry needs {}",
                len,
                Self::image_len(&geometry)
            )));
        }

        Ok(FileNand {
            mmap,
            geometry,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush dirty pages of the map to the file
    pub fn sync(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    fn image_len(geometry: &Geometry) -> u64 {
        IMAGE_HEADER_SIZE as u64
            + geometry.total_pages() * (geometry.page_size + geometry.oob_size) as u64
    }

    fn encode_header(geometry: &Geometry) -> [u8; IMAGE_HEADER_SIZE] {
        let mut header = [0u8; IMAGE_HEADER_SIZE];
        header[0..8].copy_from_slice(&IMAGE_MAGIC);
        let fields = [
            IMAGE_VERSION,
            geometry.page_size as u32,
            geometry.oob_size as u32,
            geometry.pages_per_block,
            geometry.block_total,
            geometry.plane_num,
        ];
        for (i, value) in fields.iter().enumerate() {
            let offset = 8 + i * 4;
            header[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
        header
    }

    fn decode_header(bytes: &[u8]) -> Result<Geometry> {
        if bytes[0..8] != IMAGE_MAGIC {
            return Err(FtlError::InvalidImage("bad magic".into()));
        }
        let field = |i: usize| {
            let offset = 8 + i * 4;
            u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
        };
        if field(0) != IMAGE_VERSION {
            return Err(FtlError::InvalidImage(format!("unsupported image version {}", field(0))));
        }
        let geometry = Geometry {
            page_size: field(1) as usize,
            oob_size: field(2) as usize,
            pages_per_block: field(3),
            block_total: field(4),
            plane_num: field(5),
        };
        geometry.validate()?;
        Ok(geometry)
    }

    fn page_offset(&self, addr: PageAddr) -> NandResult<usize> {
        if !self.geometry.contains(addr) {
            return Err(NandError::OutOfRange);
        }
        let stride = self.geometry.page_size + self.geometry.oob_size;
        Ok(IMAGE_HEADER_SIZE + addr.absolute(self.geometry.pages_per_block) as usize * stride)
    }
}

impl NandDevice for FileNand {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn erase_block(&mut self, block: PhysicalBlock) -> NandResult<()> {
        let start = self.page_offset(block.page(0))?;
        let stride = self.geometry.page_size + self.geometry.oob_size;
        let end = start + stride * self.geometry.pages_per_block as usize;
        self.mmap[start..end].fill(0xFF);
        Ok(())
    }

    fn read_page(
        &mut self,
        addr: PageAddr,
        data: Option<&mut [u8]>,
        oob: Option<&mut [u8]>,
    ) -> NandResult<ReadStatus> {
        let offset = self.page_offset(addr)?;
        let (ps, os) = (self.geometry.page_size, self.geometry.oob_size);
        if let Some(buf) = data {
            let len = buf.len().min(ps);
            buf[..len].copy_from_slice(&self.mmap[offset..offset + len]);
        }
        if let Some(buf) = oob {
            let len = buf.len().min(os);
            buf[..len].copy_from_slice(&self.mmap[offset + ps..offset + ps + len]);
        }
        Ok(ReadStatus::Clean)
    }

    fn write_page(&mut self, addr: PageAddr, data: &[u8], oob: &[u8]) -> NandResult<()> {
        let (ps, os) = (self.geometry.page_size, self.geometry.oob_size);
        if data.len() != ps || oob.len() != os {
            return Err(NandError::OutOfRange);
        }
        let offset = self.page_offset(addr)?;
        let page = &mut self.mmap[offset..offset + ps + os];
        if page.iter().any(|&b| b != 0xFF) {
            return Err(NandError::Fail);
        }
        page[..ps].copy_from_slice(data);
        page[ps..].copy_from_slice(oob);
        Ok(())
    }
}

impl Drop for FileNand {
    fn drop(&mut self) {
        if let Err(e) = self.mmap.flush() {
            tracing::warn!("Failed to flush NAND image {:?}: {}", self.path, e);
        }
    }
}
