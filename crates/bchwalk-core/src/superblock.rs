/// Superblock parsing and the clean-shutdown snapshot
///
/// The superblock sits at sector 8 and carries a fixed prelude followed by a
/// stream of typed variable-length fields. On a cleanly unmounted image one
/// of them is the `clean` field, whose journal-set entries record the root
/// node of every btree.
use byteorder::{ByteOrder, LittleEndian};

use crate::bkey::BKEY_U64S;
use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::OpenError;
use crate::node::BtreePtrV2;
use crate::records::{extract_bits, JsetEntryRecord, RecordCursor, SbFieldRecord};
use crate::BTREE_ID_NR;

/// The superblock lives at sector 8 (byte 4096).
pub const SB_SECTOR: u64 = 8;

/// bcachefs superblock magic.
pub const BCACHEFS_MAGIC: [u8; 16] = [
    0xc6, 0x85, 0x73, 0xf6, 0x4e, 0x1a, 0x45, 0xca, 0x82, 0x65, 0xf5, 0x7f, 0x48, 0xba, 0x6d,
    0x81,
];

/// Fixed prelude size; the field stream follows it.
pub const SB_PRELUDE_BYTES: usize = 752;

const SB_MAGIC_OFFSET: usize = 24;
const SB_SEQ_OFFSET: usize = 112;
const SB_BLOCK_SIZE_OFFSET: usize = 120;
const SB_U64S_OFFSET: usize = 124;
const SB_FLAGS_OFFSET: usize = 144;

// Superblock field types; only `clean` is consumed here.
pub const SB_FIELD_JOURNAL: u32 = 0;
pub const SB_FIELD_MEMBERS: u32 = 1;
pub const SB_FIELD_CRYPT: u32 = 2;
pub const SB_FIELD_REPLICAS_V0: u32 = 3;
pub const SB_FIELD_QUOTA: u32 = 4;
pub const SB_FIELD_DISK_GROUPS: u32 = 5;
pub const SB_FIELD_CLEAN: u32 = 6;
pub const SB_FIELD_REPLICAS: u32 = 7;

const SB_FIELD_HEADER_BYTES: usize = 16;

/// Extra clean-field members between the field header and its entries.
const CLEAN_PREAMBLE_BYTES: usize = 16;

/// Journal-set entry type carrying a btree root pointer.
pub const JSET_ENTRY_BTREE_ROOT: u8 = 1;

const JSET_ENTRY_HEADER_BYTES: usize = 16;

/// Quick probe: does this buffer start a bcachefs superblock?
pub fn is_bcachefs_superblock(data: &[u8]) -> bool {
    data.len() >= SB_MAGIC_OFFSET + 16
        && data[SB_MAGIC_OFFSET..SB_MAGIC_OFFSET + 16] == BCACHEFS_MAGIC
}

/// The parsed superblock: prelude attributes plus the raw field stream.
pub struct Superblock {
    raw: Vec<u8>,
    pub seq: u64,
    /// Filesystem block size in sectors.
    pub block_size: u16,
    /// Size of the field stream in u64s.
    pub u64s: u32,
    pub flags: [u64; 8],
}

impl Superblock {
    /// Two-phase superblock read: the prelude first to validate the magic
    /// and learn the full size, then the whole block including its fields.
    pub fn read(device: &BlockDevice) -> Result<Superblock, OpenError> {
        tracing::debug!("reading superblock");
        let base = SB_SECTOR * SECTOR_SIZE;
        let prelude = device.read_bytes(base, SB_PRELUDE_BYTES)?;

        if !is_bcachefs_superblock(prelude) {
            return Err(OpenError::InvalidMagic);
        }

        let u64s = LittleEndian::read_u32(&prelude[SB_U64S_OFFSET..SB_U64S_OFFSET + 4]);
        let total = SB_PRELUDE_BYTES + u64s as usize * 8;
        if base + total as u64 > device.size() {
            return Err(OpenError::ShortSuperblock);
        }

        let raw = device.read_bytes(base, total)?.to_vec();

        let mut flags = [0u64; 8];
        for (i, flag) in flags.iter_mut().enumerate() {
            let at = SB_FLAGS_OFFSET + i * 8;
            *flag = LittleEndian::read_u64(&raw[at..at + 8]);
        }

        let sb = Superblock {
            seq: LittleEndian::read_u64(&raw[SB_SEQ_OFFSET..SB_SEQ_OFFSET + 8]),
            block_size: LittleEndian::read_u16(
                &raw[SB_BLOCK_SIZE_OFFSET..SB_BLOCK_SIZE_OFFSET + 2],
            ),
            u64s,
            flags,
            raw,
        };
        tracing::debug!(
            seq = sb.seq,
            block_size_bytes = sb.block_size_bytes(),
            btree_node_size_bytes = sb.btree_node_size_bytes(),
            "read superblock"
        );
        Ok(sb)
    }

    /// Filesystem block size in bytes.
    pub fn block_size_bytes(&self) -> u64 {
        self.block_size as u64 * SECTOR_SIZE
    }

    /// Btree node size in bytes, from bits [12,28) of the first flags word.
    pub fn btree_node_size_bytes(&self) -> u64 {
        extract_bits(self.flags[0], 12, 28) * SECTOR_SIZE
    }

    /// The variable-length field stream after the prelude.
    pub fn fields(&self) -> &[u8] {
        &self.raw[SB_PRELUDE_BYTES..]
    }

    /// Locate the first field of `field_type`; returns the whole record.
    pub fn find_field(&self, field_type: u32) -> Option<&[u8]> {
        for (_, record) in RecordCursor::<SbFieldRecord>::new(self.fields()) {
            let found = LittleEndian::read_u32(&record[4..8]);
            tracing::debug!(found, looking_for = field_type, "superblock field");
            if found == field_type {
                return Some(record);
            }
        }
        None
    }
}

/// One journal-set entry, copied out of the clean field.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub btree_id: u8,
    pub level: u8,
    pub entry_type: u8,
    pub seq: u64,
    raw: Vec<u8>,
}

impl JournalEntry {
    fn parse(record: &[u8]) -> JournalEntry {
        JournalEntry {
            btree_id: record[2],
            level: record[3],
            entry_type: record[4],
            seq: LittleEndian::read_u64(&record[8..16]),
            raw: record.to_vec(),
        }
    }

    /// The entry payload after the 16-byte header; for `btree_root` entries
    /// this is a key whose value is a btree pointer.
    pub fn payload(&self) -> &[u8] {
        &self.raw[JSET_ENTRY_HEADER_BYTES..]
    }

    /// Resolve the root pointer: the first pointer in the payload key's
    /// value whose `unused` flag is clear.
    pub fn root_ptr(&self) -> Option<BtreePtrV2> {
        let payload = self.payload();
        if payload.is_empty() {
            return None;
        }

        let key_end = payload[0] as usize * 8;
        let value_start = BKEY_U64S as usize * 8;
        if key_end > payload.len() || key_end <= value_start {
            return None;
        }

        BtreePtrV2::parse(&payload[value_start..key_end])
    }
}

/// Scan a clean field's journal-set entries into a root table indexed by
/// btree id. Btrees without a `btree_root` entry stay empty.
pub fn clean_btree_roots(clean_field: &[u8]) -> Vec<Option<JournalEntry>> {
    let mut roots: Vec<Option<JournalEntry>> = vec![None; BTREE_ID_NR];

    let entries_start = SB_FIELD_HEADER_BYTES + CLEAN_PREAMBLE_BYTES;
    let entries = match clean_field.get(entries_start..) {
        Some(entries) => entries,
        None => return roots,
    };

    for (_, record) in RecordCursor::<JsetEntryRecord>::new(entries) {
        let entry = JournalEntry::parse(record);
        tracing::debug!(
            btree_id = entry.btree_id,
            entry_type = entry.entry_type,
            "journal entry"
        );

        if entry.entry_type != JSET_ENTRY_BTREE_ROOT {
            continue;
        }
        match roots.get_mut(entry.btree_id as usize) {
            Some(slot) => *slot = Some(entry),
            None => tracing::warn!(btree_id = entry.btree_id, "btree root for unknown btree id"),
        }
    }

    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sb_field(u64s: u32, field_type: u32, payload: &[u8]) -> Vec<u8> {
        assert_eq!(payload.len(), u64s as usize * 8);
        let mut out = vec![0u8; SB_FIELD_HEADER_BYTES];
        out[0..4].copy_from_slice(&u64s.to_le_bytes());
        out[4..8].copy_from_slice(&field_type.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn jset_entry(btree_id: u8, entry_type: u8, payload: &[u8]) -> Vec<u8> {
        assert_eq!(payload.len() % 8, 0);
        let mut out = vec![0u8; JSET_ENTRY_HEADER_BYTES];
        out[0..2].copy_from_slice(&((payload.len() / 8) as u16).to_le_bytes());
        out[2] = btree_id;
        out[4] = entry_type;
        out[8..16].copy_from_slice(&1u64.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// A btree_root payload: a current-format key whose value is a
    /// btree_ptr_v2 with a single live pointer at `sector`.
    fn btree_root_payload(sector: u64) -> Vec<u8> {
        let mut key = vec![0u8; 40];
        key[0] = 11; // 5 key u64s + 6 value u64s
        key[1] = 1; // current format
        key[2] = 18; // btree_ptr_v2

        let mut value = vec![0u8; 40];
        value[8..16].copy_from_slice(&7u64.to_le_bytes()); // seq
        let word: u64 = 1 | (sector << 4);
        value.extend_from_slice(&word.to_le_bytes());

        key.extend_from_slice(&value);
        key
    }

    fn write_sb(fields: &[u8]) -> Vec<u8> {
        assert_eq!(fields.len() % 8, 0);
        let mut sb = vec![0u8; SB_PRELUDE_BYTES];
        sb[SB_MAGIC_OFFSET..SB_MAGIC_OFFSET + 16].copy_from_slice(&BCACHEFS_MAGIC);
        sb[SB_BLOCK_SIZE_OFFSET..SB_BLOCK_SIZE_OFFSET + 2].copy_from_slice(&8u16.to_le_bytes());
        sb[SB_U64S_OFFSET..SB_U64S_OFFSET + 4]
            .copy_from_slice(&((fields.len() / 8) as u32).to_le_bytes());
        sb[SB_FLAGS_OFFSET..SB_FLAGS_OFFSET + 8].copy_from_slice(&(512u64 << 12).to_le_bytes());
        sb.extend_from_slice(fields);
        sb
    }

    fn device_with_sb(sb: &[u8]) -> (tempfile::NamedTempFile, BlockDevice) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; 4096]).unwrap();
        file.write_all(sb).unwrap();
        file.flush().unwrap();
        let device = BlockDevice::open(file.path()).unwrap();
        (file, device)
    }

    #[test]
    fn test_geometry_from_flags() {
        let sb = write_sb(&[]);
        let (_file, device) = device_with_sb(&sb);

        let sb = Superblock::read(&device).unwrap();
        assert_eq!(sb.block_size_bytes(), 4096);
        assert_eq!(sb.btree_node_size_bytes(), 262144);
    }

    #[test]
    fn test_invalid_magic() {
        let mut sb = write_sb(&[]);
        sb[SB_MAGIC_OFFSET] ^= 0xff;
        let (_file, device) = device_with_sb(&sb);

        assert!(matches!(
            Superblock::read(&device),
            Err(OpenError::InvalidMagic)
        ));
    }

    #[test]
    fn test_short_superblock() {
        let mut sb = write_sb(&[]);
        // Claim far more field data than the image holds.
        sb[SB_U64S_OFFSET..SB_U64S_OFFSET + 4].copy_from_slice(&0x10000u32.to_le_bytes());
        let (_file, device) = device_with_sb(&sb);

        assert!(matches!(
            Superblock::read(&device),
            Err(OpenError::ShortSuperblock)
        ));
    }

    #[test]
    fn test_find_field_walks_the_stream() {
        let mut fields = sb_field(2, SB_FIELD_REPLICAS_V0, &[0u8; 16]);
        fields.extend_from_slice(&sb_field(1, SB_FIELD_CLEAN, &[0u8; 8]));
        let sb = write_sb(&fields);
        let (_file, device) = device_with_sb(&sb);

        let sb = Superblock::read(&device).unwrap();
        let clean = sb.find_field(SB_FIELD_CLEAN).unwrap();
        assert_eq!(clean.len(), 24);
        assert!(sb.find_field(SB_FIELD_CRYPT).is_none());
    }

    #[test]
    fn test_clean_roots_indexed_by_btree_id() {
        let mut entries = jset_entry(0, 5, &[0u8; 8]); // usage noise
        entries.extend_from_slice(&jset_entry(2, JSET_ENTRY_BTREE_ROOT, &btree_root_payload(1024)));
        entries.extend_from_slice(&jset_entry(0, JSET_ENTRY_BTREE_ROOT, &btree_root_payload(2048)));

        let mut clean = vec![0u8; SB_FIELD_HEADER_BYTES + CLEAN_PREAMBLE_BYTES];
        clean.extend_from_slice(&entries);

        let roots = clean_btree_roots(&clean);
        assert_eq!(roots.len(), BTREE_ID_NR);
        assert!(roots[1].is_none());

        let dirents = roots[2].as_ref().unwrap();
        assert_eq!(dirents.entry_type, JSET_ENTRY_BTREE_ROOT);
        assert_eq!(dirents.root_ptr().unwrap().ptr.offset, 1024);
        assert_eq!(roots[0].as_ref().unwrap().root_ptr().unwrap().ptr.offset, 2048);
    }

    #[test]
    fn test_root_ptr_skips_unused_pointers() {
        let mut payload = btree_root_payload(0);
        // Rewrite the single pointer as unused, then append a live one.
        let dead: u64 = 1 | (1 << 2) | (999 << 4);
        let live: u64 = 1 | (512 << 4);
        let at = payload.len() - 8;
        payload[at..].copy_from_slice(&dead.to_le_bytes());
        payload.extend_from_slice(&live.to_le_bytes());
        payload[0] = 12; // one more value u64

        let entry = jset_entry(4, JSET_ENTRY_BTREE_ROOT, &payload);
        let entry = JournalEntry::parse(&entry);
        assert_eq!(entry.root_ptr().unwrap().ptr.offset, 512);

        // All pointers unused: no root.
        let mut all_dead = btree_root_payload(0);
        let at = all_dead.len() - 8;
        all_dead[at..].copy_from_slice(&dead.to_le_bytes());
        let entry = JournalEntry::parse(&jset_entry(4, JSET_ENTRY_BTREE_ROOT, &all_dead));
        assert!(entry.root_ptr().is_none());
    }
}
