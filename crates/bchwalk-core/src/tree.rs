/// Depth-first btree traversal and typed value projections
///
/// A tree iterator owns the node it is visiting plus a stack of child
/// iterators. Interior `btree_ptr_v2` keys are consumed to descend; every
/// other key is handed to the caller as a borrow into the owning node
/// buffer, valid until the iterator advances past that node.
use std::borrow::Cow;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::bkey::{
    key_bytes, key_type_name, unpack_bkey, Bkey, ExtentPtr, KEY_TYPE_BTREE_PTR_V2,
    KEY_TYPE_DIRENT, KEY_TYPE_EXTENT, KEY_TYPE_INLINE_DATA,
};
use crate::device::SECTOR_SIZE;
use crate::error::{IterError, ProjectionError};
use crate::node::{BkeyCursor, BsetCursor, BtreePtrV2, NodeBuf};
use crate::{BtreeId, Reader};

// Directory entry type codes, as stored in a dirent's d_type byte.
pub const DT_UNKNOWN: u8 = 0;
pub const DT_FIFO: u8 = 1;
pub const DT_CHR: u8 = 2;
pub const DT_DIR: u8 = 4;
pub const DT_BLK: u8 = 6;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;
pub const DT_SOCK: u8 = 12;

/// Human-readable name for a dirent type code.
pub fn dirent_type_name(d_type: u8) -> &'static str {
    match d_type {
        DT_FIFO => "fifo",
        DT_CHR => "chardev",
        DT_DIR => "dir",
        DT_BLK => "blockdev",
        DT_REG => "file",
        DT_LNK => "symlink",
        DT_SOCK => "socket",
        _ => "unknown",
    }
}

/// A key yielded by iteration: a borrow into the owning node buffer.
///
/// `root_sector` is the sector of the btree's root node, recorded when the
/// top-level iterator was built; inline-data projections are addressed
/// against it.
#[derive(Clone, Copy)]
pub struct BkeyRef<'a> {
    node: &'a NodeBuf,
    offset: usize,
    root_sector: u64,
}

impl<'a> BkeyRef<'a> {
    /// Size of key plus value in u64s.
    pub fn u64s(&self) -> u8 {
        self.node.bytes()[self.offset]
    }

    /// Physical format tag (current or local-packed).
    pub fn format(&self) -> u8 {
        self.node.bytes()[self.offset + 1] & 0x7f
    }

    /// Value type tag.
    pub fn key_type(&self) -> u8 {
        self.node.bytes()[self.offset + 2]
    }

    /// The whole record: key region followed by the value.
    pub fn bytes(&self) -> &'a [u8] {
        let start = self.offset;
        let end = start + self.u64s() as usize * 8;
        &self.node.bytes()[start..end]
    }

    /// Decode the key into canonical form using the node's descriptor.
    pub fn unpack(&self) -> Result<Bkey, IterError> {
        unpack_bkey(self.bytes(), self.node.format())
    }

    /// The value blob that follows the key region.
    pub fn value(&self) -> ValueRef<'a> {
        let record = self.bytes();
        let key_len = key_bytes(self.format(), self.node.format());
        ValueRef {
            key_type: self.key_type(),
            bytes: record.get(key_len..).unwrap_or(&[]),
        }
    }

    /// Project a directory entry out of a dirent key.
    pub fn directory(&self) -> Result<DirectoryEntry<'a>, ProjectionError> {
        if self.key_type() != KEY_TYPE_DIRENT {
            return Err(ProjectionError::NotDirent);
        }

        let key = self.unpack()?;
        let value = self.value();
        if value.bytes.len() < 9 {
            return Err(ProjectionError::NotDirent);
        }

        let name = &value.bytes[9..];
        let name_len = name.iter().position(|&b| b == 0).unwrap_or(name.len());

        Ok(DirectoryEntry {
            parent_inode: key.p.inode,
            inode: LittleEndian::read_u64(&value.bytes[0..8]),
            file_type: value.bytes[8],
            name: &name[..name_len],
        })
    }

    /// Project a byte-range mapping out of an extent or inline-data key.
    pub fn extent(&self) -> Result<Extent, ProjectionError> {
        match self.key_type() {
            KEY_TYPE_EXTENT => {
                let key = self.unpack()?;
                let value = self.value();

                // The value holds a run of 8-byte entries; the data pointer
                // is the first pointer-typed one.
                let mut pos = 0;
                while pos + 8 <= value.bytes.len() {
                    let word = LittleEndian::read_u64(&value.bytes[pos..pos + 8]);
                    if let Some(ptr) = ExtentPtr::from_word(word) {
                        return Ok(Extent {
                            file_offset: (key.p.offset.saturating_sub(key.size as u64))
                                * SECTOR_SIZE,
                            disk_offset: ptr.offset * SECTOR_SIZE,
                            size: key.size as u64 * SECTOR_SIZE,
                        });
                    }
                    pos += 8;
                }
                Err(ProjectionError::NotExtent)
            }
            KEY_TYPE_INLINE_DATA => {
                let key = self.unpack()?;
                let key_len = key_bytes(self.format(), self.node.format());
                let value_offset = self.offset + key_len;

                // Inline bytes live in the node itself; address them in the
                // image against the root node's sector base.
                Ok(Extent {
                    file_offset: (key.p.offset.saturating_sub(key.size as u64)) * SECTOR_SIZE,
                    disk_offset: self.root_sector * SECTOR_SIZE + value_offset as u64,
                    size: (key.u64s as u64 * 8).saturating_sub(key_len as u64),
                })
            }
            _ => Err(ProjectionError::NotExtent),
        }
    }
}

impl std::fmt::Debug for BkeyRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BkeyRef")
            .field("u64s", &self.u64s())
            .field("format", &self.format())
            .field("type", &key_type_name(self.key_type()))
            .finish()
    }
}

/// A value blob yielded by iteration, tagged with its key's type.
#[derive(Clone, Copy)]
pub struct ValueRef<'a> {
    pub key_type: u8,
    pub bytes: &'a [u8],
}

/// One directory entry; `name` borrows from the iterator's node buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry<'a> {
    pub parent_inode: u64,
    pub inode: u64,
    pub file_type: u8,
    pub name: &'a [u8],
}

impl DirectoryEntry<'_> {
    /// Entry name as UTF-8, lossily.
    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.name)
    }
}

impl std::fmt::Display for DirectoryEntry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.parent_inode,
            self.inode,
            self.file_type,
            self.name_lossy()
        )
    }
}

/// A file byte range and where its data lives in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Extent {
    /// Byte offset within the file.
    pub file_offset: u64,
    /// Byte offset of the data within the image.
    pub disk_offset: u64,
    /// Byte length of the range.
    pub size: u64,
}

/// Coordinates of the key the traversal stopped at: how deep in the child
/// stack, and where in that node.
struct KeyLoc {
    depth: usize,
    offset: usize,
}

/// Stateful depth-first cursor over one btree.
pub struct TreeIterator<'r> {
    reader: &'r Reader,
    btree: BtreeId,
    node: NodeBuf,
    /// Sector of the btree's root node; children inherit it.
    root_sector: u64,
    bsets: BsetCursor,
    keys: Option<BkeyCursor>,
    children: Vec<TreeIterator<'r>>,
}

impl<'r> TreeIterator<'r> {
    pub(crate) fn load(reader: &'r Reader, btree: BtreeId, sector: u64) -> Result<Self, IterError> {
        TreeIterator::load_at(reader, btree, sector, sector)
    }

    fn load_at(
        reader: &'r Reader,
        btree: BtreeId,
        sector: u64,
        root_sector: u64,
    ) -> Result<Self, IterError> {
        let node = NodeBuf::load(
            reader.device(),
            sector,
            reader.btree_node_size_bytes() as usize,
        )?;

        Ok(TreeIterator {
            reader,
            btree,
            node,
            root_sector,
            bsets: BsetCursor::new(reader.block_size_bytes() as usize),
            keys: None,
            children: Vec::new(),
        })
    }

    /// Advance to the next non-pointer key, returning the caller a borrow
    /// into the node that holds it.
    pub fn next_key(&mut self) -> Result<Option<BkeyRef<'_>>, IterError> {
        let loc = match self.advance()? {
            Some(loc) => loc,
            None => return Ok(None),
        };

        let node = self.node_at(loc.depth);
        Ok(Some(BkeyRef {
            node,
            offset: loc.offset,
            root_sector: self.root_sector,
        }))
    }

    /// Advance and return the next key's value blob.
    pub fn next_value(&mut self) -> Result<Option<ValueRef<'_>>, IterError> {
        let loc = match self.advance()? {
            Some(loc) => loc,
            None => return Ok(None),
        };

        let key = BkeyRef {
            node: self.node_at(loc.depth),
            offset: loc.offset,
            root_sector: self.root_sector,
        };
        Ok(Some(key.value()))
    }

    /// Project a directory entry out of a key returned by [`next_key`].
    ///
    /// [`next_key`]: TreeIterator::next_key
    pub fn directory<'a>(key: &BkeyRef<'a>) -> Result<DirectoryEntry<'a>, ProjectionError> {
        key.directory()
    }

    /// Project a byte-range mapping out of a key returned by [`next_key`].
    ///
    /// [`next_key`]: TreeIterator::next_key
    pub fn extend(key: &BkeyRef<'_>) -> Result<Extent, ProjectionError> {
        key.extent()
    }

    fn advance(&mut self) -> Result<Option<KeyLoc>, IterError> {
        loop {
            // A live child iterates its whole subtree before we resume.
            if let Some(child) = self.children.last_mut() {
                match child.advance()? {
                    Some(loc) => {
                        return Ok(Some(KeyLoc {
                            depth: loc.depth + 1,
                            offset: loc.offset,
                        }))
                    }
                    None => {
                        self.children.pop();
                    }
                }
                continue;
            }

            if let Some(keys) = self.keys.as_mut() {
                match keys.next(&self.node) {
                    Some(offset) => {
                        if self.node.bytes()[offset + 2] == KEY_TYPE_BTREE_PTR_V2 {
                            tracing::debug!(btree = %self.btree, "entering a child node");
                            let child = self.descend(offset)?;
                            self.children.push(child);
                        } else {
                            return Ok(Some(KeyLoc { depth: 0, offset }));
                        }
                    }
                    None => self.keys = None,
                }
                continue;
            }

            match self.bsets.next(&self.node) {
                Some((keys_offset, keys_len)) => {
                    tracing::debug!(btree = %self.btree, keys_offset, keys_len, "next bset");
                    self.keys = Some(BkeyCursor::new(keys_offset, keys_len));
                }
                None => return Ok(None),
            }
        }
    }

    /// Build the child iterator a `btree_ptr_v2` key points to.
    fn descend(&self, offset: usize) -> Result<TreeIterator<'r>, IterError> {
        let key = BkeyRef {
            node: &self.node,
            offset,
            root_sector: self.root_sector,
        };
        let value = key.value();

        let ptr = BtreePtrV2::parse(value.bytes).ok_or_else(|| {
            IterError::NodeReadFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "btree pointer without a live device pointer",
            ))
        })?;

        TreeIterator::load_at(self.reader, self.btree, ptr.ptr.offset, self.root_sector)
    }

    fn node_at(&self, depth: usize) -> &NodeBuf {
        let mut it = self;
        for _ in 0..depth {
            match it.children.last() {
                Some(child) => it = child,
                None => break,
            }
        }
        &it.node
    }
}
