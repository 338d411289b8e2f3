/// Positional byte access to a filesystem image
use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::MmapOptions;

/// Sector size used throughout the on-disk format (512 bytes).
pub const SECTOR_SIZE: u64 = 512;

/// A memory-mapped image file offering bounds-checked positional reads.
///
/// The reader only ever needs byte ranges at known offsets, so the whole
/// image is mapped once and slices are handed out as borrows.
pub struct BlockDevice {
    _file: File,
    mmap: memmap2::Mmap,
    size: u64,
}

impl BlockDevice {
    /// Open a block device or image file read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();

        let mmap = unsafe { MmapOptions::new().map(&file)? };

        Ok(BlockDevice {
            _file: file,
            mmap,
            size,
        })
    }

    /// Size of the image in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read `length` bytes starting at `offset`.
    pub fn read_bytes(&self, offset: u64, length: usize) -> io::Result<&[u8]> {
        let start = offset as usize;
        let end = match start.checked_add(length) {
            Some(end) if end <= self.mmap.len() => end,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "read beyond end of device: {}+{} > {}",
                        offset,
                        length,
                        self.mmap.len()
                    ),
                ))
            }
        };

        Ok(&self.mmap[start..end])
    }

    /// Read a single 512-byte sector.
    pub fn read_sector(&self, sector: u64) -> io::Result<&[u8]> {
        self.read_bytes(sector * SECTOR_SIZE, SECTOR_SIZE as usize)
    }
}
