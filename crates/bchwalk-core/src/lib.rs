//! Read-only reader for bcachefs-formatted block images.
//!
//! Opens a cleanly unmounted image, recovers the per-btree root pointers
//! from the superblock's clean-shutdown snapshot, and walks the metadata
//! btrees lazily, yielding keys and typed views (directory entries, file
//! extents) without mounting the filesystem.

use std::path::Path;

pub mod bkey;
pub mod device;
pub mod error;
pub mod node;
pub mod records;
pub mod superblock;
pub mod tree;

pub use bkey::{Bkey, BkeyFormat, Bpos, Bversion, ExtentPtr};
pub use device::BlockDevice;
pub use error::{IterError, LookupError, OpenError, ProjectionError};
pub use superblock::{is_bcachefs_superblock, JournalEntry, Superblock};
pub use tree::{BkeyRef, DirectoryEntry, Extent, TreeIterator, ValueRef};

use superblock::{clean_btree_roots, SB_FIELD_CLEAN};

/// Number of btree id slots in the root table.
pub const BTREE_ID_NR: usize = 8;

/// The metadata btrees recorded in the clean snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BtreeId {
    Extents = 0,
    Inodes = 1,
    Dirents = 2,
    Xattrs = 3,
    Alloc = 4,
    Quotas = 5,
    Stripes = 6,
    Reflink = 7,
}

impl BtreeId {
    pub const ALL: [BtreeId; BTREE_ID_NR] = [
        BtreeId::Extents,
        BtreeId::Inodes,
        BtreeId::Dirents,
        BtreeId::Xattrs,
        BtreeId::Alloc,
        BtreeId::Quotas,
        BtreeId::Stripes,
        BtreeId::Reflink,
    ];
}

impl std::fmt::Display for BtreeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BtreeId::Extents => "extents",
            BtreeId::Inodes => "inodes",
            BtreeId::Dirents => "dirents",
            BtreeId::Xattrs => "xattrs",
            BtreeId::Alloc => "alloc",
            BtreeId::Quotas => "quotas",
            BtreeId::Stripes => "stripes",
            BtreeId::Reflink => "reflink",
        };
        write!(f, "{}", name)
    }
}

/// Handle on an opened image: the parsed superblock plus the root table
/// from the clean snapshot.
///
/// The reader is read-only after construction; each call to
/// [`iterator`](Reader::iterator) returns an independent cursor with its own
/// node buffers.
pub struct Reader {
    device: BlockDevice,
    superblock: Superblock,
    roots: Vec<Option<JournalEntry>>,
}

impl Reader {
    /// Open an image file and eagerly parse its superblock and root table.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Reader, OpenError> {
        Reader::from_device(BlockDevice::open(path)?)
    }

    /// Build a reader over an already-opened device.
    pub fn from_device(device: BlockDevice) -> Result<Reader, OpenError> {
        let superblock = Superblock::read(&device)?;

        // The clean field only exists after a clean shutdown; without it
        // there is no root table to walk.
        tracing::debug!("looking for the clean superblock field");
        let clean = superblock
            .find_field(SB_FIELD_CLEAN)
            .ok_or(OpenError::NoCleanField)?;
        let roots = clean_btree_roots(clean);

        Ok(Reader {
            device,
            superblock,
            roots,
        })
    }

    /// Filesystem block size in bytes.
    pub fn block_size_bytes(&self) -> u64 {
        self.superblock.block_size_bytes()
    }

    /// Btree node size in bytes.
    pub fn btree_node_size_bytes(&self) -> u64 {
        self.superblock.btree_node_size_bytes()
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub(crate) fn device(&self) -> &BlockDevice {
        &self.device
    }

    /// Btree ids that have a root recorded in the clean snapshot.
    pub fn roots_present(&self) -> Vec<BtreeId> {
        BtreeId::ALL
            .iter()
            .copied()
            .filter(|id| self.roots[*id as usize].is_some())
            .collect()
    }

    /// Load the designated root node and return a fresh depth-first
    /// iterator over `btree`.
    pub fn iterator(&self, btree: BtreeId) -> Result<TreeIterator<'_>, LookupError> {
        let entry = self.roots[btree as usize]
            .as_ref()
            .ok_or(LookupError::UnknownBtree)?;

        tracing::debug!(%btree, seq = entry.seq, "resolving btree root");
        let root = entry.root_ptr().ok_or(LookupError::UnknownBtree)?;

        Ok(TreeIterator::load(self, btree, root.ptr.offset)?)
    }

    /// Human-readable geometry and root-table summary.
    pub fn filesystem_info(&self) -> String {
        let roots = self
            .roots_present()
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "bcachefs image\n\
             - Block Size: {} bytes\n\
             - Btree Node Size: {} bytes\n\
             - Superblock Seq: {}\n\
             - Btree Roots: {}",
            self.block_size_bytes(),
            self.btree_node_size_bytes(),
            self.superblock.seq,
            roots
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_btree_id_names() {
        assert_eq!(BtreeId::Extents.to_string(), "extents");
        assert_eq!(BtreeId::Dirents.to_string(), "dirents");
        assert_eq!(BtreeId::ALL.len(), BTREE_ID_NR);
        assert_eq!(BtreeId::Alloc as usize, 4);
    }
}
