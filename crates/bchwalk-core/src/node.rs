/// Btree node blobs and the cursors that walk them
///
/// A node is a fixed-size chunk (per superblock geometry) holding a header
/// with a bkey format descriptor, then a sequence of bsets. The first bset
/// sits right after the header; later ones start at block boundaries, each
/// preceded by a checksum trailer. Cursor progression is computed in integer
/// byte offsets relative to the node base throughout.
use byteorder::{ByteOrder, LittleEndian};

use crate::bkey::{BkeyFormat, ExtentPtr, BKEY_FORMAT_BYTES};
use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::IterError;
use crate::records::{BkeyRecord, RecordCursor};

/// Byte offset of the format descriptor within the node header.
const NODE_FORMAT_OFFSET: usize = 80;

/// Byte offset of the first bset within a node.
pub const NODE_KEYS_OFFSET: usize = NODE_FORMAT_OFFSET + BKEY_FORMAT_BYTES;

/// Bset header bytes preceding its key region.
pub const BSET_HEADER_BYTES: usize = 8;

/// Checksum trailer preceding each block-aligned bset after the first.
const CSUM_BYTES: usize = 16;

/// One loaded btree node: its raw bytes, its on-disk position, and the
/// parsed format descriptor for its packed keys.
pub struct NodeBuf {
    buf: Vec<u8>,
    sector: u64,
    format: BkeyFormat,
}

impl NodeBuf {
    /// Read the node at `sector` into a freshly owned buffer.
    pub fn load(device: &BlockDevice, sector: u64, node_bytes: usize) -> Result<NodeBuf, IterError> {
        let raw = device
            .read_bytes(sector * SECTOR_SIZE, node_bytes)
            .map_err(IterError::NodeReadFailed)?;
        NodeBuf::from_raw(raw.to_vec(), sector)
    }

    /// Wrap already-read node bytes, parsing the format descriptor.
    pub(crate) fn from_raw(buf: Vec<u8>, sector: u64) -> Result<NodeBuf, IterError> {
        if buf.len() < NODE_KEYS_OFFSET + BSET_HEADER_BYTES {
            return Err(IterError::NodeReadFailed(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "node smaller than its header",
            )));
        }

        let format = BkeyFormat::parse(&buf[NODE_FORMAT_OFFSET..NODE_KEYS_OFFSET]);
        tracing::debug!(sector, key_u64s = format.key_u64s, "loaded btree node");

        Ok(NodeBuf {
            buf,
            sector,
            format,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn sector(&self) -> u64 {
        self.sector
    }

    pub fn format(&self) -> &BkeyFormat {
        &self.format
    }
}

/// Cursor over the bsets of one node.
///
/// Yields `(keys_offset, keys_len)` pairs describing each bset's key region
/// relative to the node base. Zero-sized bsets are padding and are skipped;
/// the walk ends when the cursor reaches the node end, checked before any
/// header fetch.
pub struct BsetCursor {
    pos: usize,
    block_bytes: usize,
}

impl BsetCursor {
    pub fn new(block_bytes: usize) -> BsetCursor {
        BsetCursor {
            pos: NODE_KEYS_OFFSET,
            block_bytes,
        }
    }

    pub fn next(&mut self, node: &NodeBuf) -> Option<(usize, usize)> {
        let end = node.bytes().len();

        loop {
            if self.pos + BSET_HEADER_BYTES > end {
                return None;
            }

            let u64s = LittleEndian::read_u16(&node.bytes()[self.pos..self.pos + 2]) as usize;
            let keys_offset = self.pos + BSET_HEADER_BYTES;
            let keys_len = u64s * 8;

            // Advance to the next block boundary at or past this bset,
            // then past the checksum trailer that fronts the next one.
            let mut cursor = keys_offset + keys_len;
            let rem = cursor % self.block_bytes;
            if rem != 0 {
                cursor += self.block_bytes - rem;
            }
            self.pos = cursor + CSUM_BYTES;

            if u64s == 0 {
                continue;
            }
            if keys_offset + keys_len > end {
                return None;
            }

            return Some((keys_offset, keys_len));
        }
    }
}

/// Cursor over the bkeys of one bset's key region.
///
/// Offsets are relative to the node base. Terminates on a zero-sized key or
/// at the region end.
pub struct BkeyCursor {
    pos: usize,
    end: usize,
}

impl BkeyCursor {
    pub fn new(keys_offset: usize, keys_len: usize) -> BkeyCursor {
        BkeyCursor {
            pos: keys_offset,
            end: keys_offset + keys_len,
        }
    }

    pub fn next(&mut self, node: &NodeBuf) -> Option<usize> {
        let mut records =
            RecordCursor::<BkeyRecord>::starting_at(&node.bytes()[..self.end], self.pos);
        let hit = records.next().map(|(offset, _)| offset);
        self.pos = records.position();
        hit
    }
}

/// Decoded btree pointer (v2) value: the child/root node location.
#[derive(Debug, Clone, Copy)]
pub struct BtreePtrV2 {
    pub seq: u64,
    pub sectors_written: u16,
    pub ptr: ExtentPtr,
}

/// Byte offset of the extent-pointer array within a btree_ptr_v2 value.
const BTREE_PTR_V2_PTRS_OFFSET: usize = 40;

impl BtreePtrV2 {
    /// Decode a btree pointer value, selecting the first pointer entry whose
    /// `unused` flag is clear. `None` when no live pointer exists.
    pub fn parse(value: &[u8]) -> Option<BtreePtrV2> {
        if value.len() < BTREE_PTR_V2_PTRS_OFFSET {
            return None;
        }

        let seq = LittleEndian::read_u64(&value[8..16]);
        let sectors_written = LittleEndian::read_u16(&value[16..18]);

        let mut pos = BTREE_PTR_V2_PTRS_OFFSET;
        while pos + 8 <= value.len() {
            let word = LittleEndian::read_u64(&value[pos..pos + 8]);
            if let Some(ptr) = ExtentPtr::from_word(word) {
                if !ptr.unused {
                    return Some(BtreePtrV2 {
                        seq,
                        sectors_written,
                        ptr,
                    });
                }
            }
            pos += 8;
        }

        None
    }
}
