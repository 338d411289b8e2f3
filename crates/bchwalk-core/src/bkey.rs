/// Bkey model: canonical keys, the per-node format descriptor, and the
/// packed-key unpacker
///
/// Keys come in two physical shapes. A *current* key stores the canonical
/// 40-byte layout verbatim. A *local* key is bit-packed against the node's
/// format descriptor: each field occupies a fixed number of bits, laid out
/// from the end of the key region walking backwards in field order.
use byteorder::{ByteOrder, LittleEndian};

use crate::error::IterError;
use crate::records::extract_bits;

/// Size of the canonical (unpacked) key in u64s.
pub const BKEY_U64S: u8 = 5;

/// Physical key formats.
pub const KEY_FORMAT_LOCAL_BTREE: u8 = 0;
pub const KEY_FORMAT_CURRENT: u8 = 1;

// On-disk value type tags.
pub const KEY_TYPE_DELETED: u8 = 0;
pub const KEY_TYPE_WHITEOUT: u8 = 1;
pub const KEY_TYPE_ERROR: u8 = 2;
pub const KEY_TYPE_COOKIE: u8 = 3;
pub const KEY_TYPE_HASH_WHITEOUT: u8 = 4;
pub const KEY_TYPE_BTREE_PTR: u8 = 5;
pub const KEY_TYPE_EXTENT: u8 = 6;
pub const KEY_TYPE_RESERVATION: u8 = 7;
pub const KEY_TYPE_INODE: u8 = 8;
pub const KEY_TYPE_INODE_GENERATION: u8 = 9;
pub const KEY_TYPE_DIRENT: u8 = 10;
pub const KEY_TYPE_XATTR: u8 = 11;
pub const KEY_TYPE_ALLOC: u8 = 12;
pub const KEY_TYPE_QUOTA: u8 = 13;
pub const KEY_TYPE_STRIPE: u8 = 14;
pub const KEY_TYPE_REFLINK_P: u8 = 15;
pub const KEY_TYPE_REFLINK_V: u8 = 16;
pub const KEY_TYPE_INLINE_DATA: u8 = 17;
pub const KEY_TYPE_BTREE_PTR_V2: u8 = 18;

/// Human-readable name for a value type tag.
pub fn key_type_name(key_type: u8) -> &'static str {
    match key_type {
        KEY_TYPE_DELETED => "deleted",
        KEY_TYPE_WHITEOUT => "whiteout",
        KEY_TYPE_ERROR => "error",
        KEY_TYPE_COOKIE => "cookie",
        KEY_TYPE_HASH_WHITEOUT => "hash_whiteout",
        KEY_TYPE_BTREE_PTR => "btree_ptr",
        KEY_TYPE_EXTENT => "extent",
        KEY_TYPE_RESERVATION => "reservation",
        KEY_TYPE_INODE => "inode",
        KEY_TYPE_INODE_GENERATION => "inode_generation",
        KEY_TYPE_DIRENT => "dirent",
        KEY_TYPE_XATTR => "xattr",
        KEY_TYPE_ALLOC => "alloc",
        KEY_TYPE_QUOTA => "quota",
        KEY_TYPE_STRIPE => "stripe",
        KEY_TYPE_REFLINK_P => "reflink_p",
        KEY_TYPE_REFLINK_V => "reflink_v",
        KEY_TYPE_INLINE_DATA => "inline_data",
        KEY_TYPE_BTREE_PTR_V2 => "btree_ptr_v2",
        _ => "unknown",
    }
}

/// Key position: where the key sorts within its btree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bpos {
    pub inode: u64,
    pub offset: u64,
    pub snapshot: u32,
}

/// Key version counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bversion {
    pub hi: u32,
    pub lo: u64,
}

/// A key in canonical form, independent of its physical encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bkey {
    /// Size of key plus value, in u64s.
    pub u64s: u8,
    /// Physical format the key was decoded from.
    pub format: u8,
    pub needs_whiteout: bool,
    /// Value type tag.
    pub key_type: u8,
    pub p: Bpos,
    /// Extent size in sectors.
    pub size: u32,
    pub version: Bversion,
    /// Size of the key region alone, in u64s; the value follows it.
    pub key_u64s: u8,
}

/// Per-node descriptor driving local-packed key decoding.
///
/// `bits_per_field` is indexed in field order: inode, offset, snapshot,
/// size, version_hi, version_lo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BkeyFormat {
    pub key_u64s: u8,
    pub nr_fields: u8,
    pub bits_per_field: [u8; 6],
    pub field_offset: [u64; 6],
}

/// Serialized size of the format descriptor in a node header.
pub const BKEY_FORMAT_BYTES: usize = 56;

/// The well-known short format: position only, at full width.
pub const BKEY_FORMAT_SHORT: BkeyFormat = BkeyFormat {
    key_u64s: 3,
    nr_fields: 6,
    bits_per_field: [64, 64, 32, 0, 0, 0],
    field_offset: [0; 6],
};

impl BkeyFormat {
    /// Decode a format descriptor from its 56-byte serialized form.
    pub fn parse(data: &[u8]) -> BkeyFormat {
        let mut bits_per_field = [0u8; 6];
        bits_per_field.copy_from_slice(&data[2..8]);

        let mut field_offset = [0u64; 6];
        for (i, off) in field_offset.iter_mut().enumerate() {
            *off = LittleEndian::read_u64(&data[8 + i * 8..16 + i * 8]);
        }

        BkeyFormat {
            key_u64s: data[0],
            nr_fields: data[1],
            bits_per_field,
            field_offset,
        }
    }
}

/// Byte length of the key region for a key of physical format `format_tag`
/// in a node using `format`. The value starts right after it.
pub fn key_bytes(format_tag: u8, format: &BkeyFormat) -> usize {
    let key_u64s = if format_tag == KEY_FORMAT_LOCAL_BTREE {
        format.key_u64s
    } else {
        BKEY_U64S
    };
    key_u64s as usize * 8
}

/// Decode one key record into canonical form.
///
/// `raw` is the full key record (key region plus value), `format` the
/// enclosing node's descriptor.
pub fn unpack_bkey(raw: &[u8], format: &BkeyFormat) -> Result<Bkey, IterError> {
    let u64s = raw[0];
    let format_tag = raw[1] & 0x7f;
    let needs_whiteout = raw[1] & 0x80 != 0;
    let key_type = raw[2];

    if format_tag == KEY_FORMAT_CURRENT {
        // Canonical layout stored verbatim.
        if raw.len() < BKEY_U64S as usize * 8 {
            return Err(IterError::UnsupportedBkeyFormat);
        }
        return Ok(Bkey {
            u64s,
            format: format_tag,
            needs_whiteout,
            key_type,
            p: Bpos {
                inode: LittleEndian::read_u64(&raw[32..40]),
                offset: LittleEndian::read_u64(&raw[24..32]),
                snapshot: LittleEndian::read_u32(&raw[20..24]),
            },
            size: LittleEndian::read_u32(&raw[16..20]),
            version: Bversion {
                hi: LittleEndian::read_u32(&raw[12..16]),
                lo: LittleEndian::read_u64(&raw[4..12]),
            },
            key_u64s: BKEY_U64S,
        });
    }

    if format_tag != KEY_FORMAT_LOCAL_BTREE {
        return Err(IterError::UnsupportedBkeyFormat);
    }

    if format.field_offset.iter().any(|&off| off != 0) {
        // Shifted fields never appear on the images this reader targets.
        return Err(IterError::UnsupportedBkeyFormat);
    }

    let key_len = format.key_u64s as usize * 8;
    if raw.len() < key_len {
        return Err(IterError::UnsupportedBkeyFormat);
    }

    if *format == BKEY_FORMAT_SHORT {
        // Fast path: the short format is the canonical position layout.
        return Ok(Bkey {
            u64s,
            format: format_tag,
            needs_whiteout,
            key_type,
            p: Bpos {
                inode: LittleEndian::read_u64(&raw[16..24]),
                offset: LittleEndian::read_u64(&raw[8..16]),
                snapshot: LittleEndian::read_u32(&raw[4..8]),
            },
            size: 0,
            version: Bversion::default(),
            key_u64s: format.key_u64s,
        });
    }

    // General case: fields packed from the end of the key region walking
    // backwards in field order.
    let mut pos = key_len;
    let mut fields = [0u64; 6];
    for (i, field) in fields.iter_mut().enumerate() {
        let bits = format.bits_per_field[i];
        if bits == 0 {
            continue;
        }
        let bytes = match bits {
            8 | 16 | 32 | 64 => bits as usize / 8,
            _ => return Err(IterError::UnsupportedBkeyWidth(bits)),
        };
        if pos < 4 + bytes {
            // Packed data would run into the key header.
            return Err(IterError::UnsupportedBkeyFormat);
        }
        pos -= bytes;
        *field = match bits {
            8 => raw[pos] as u64,
            16 => LittleEndian::read_u16(&raw[pos..pos + 2]) as u64,
            32 => LittleEndian::read_u32(&raw[pos..pos + 4]) as u64,
            _ => LittleEndian::read_u64(&raw[pos..pos + 8]),
        };
    }

    Ok(Bkey {
        u64s,
        format: format_tag,
        needs_whiteout,
        key_type,
        p: Bpos {
            inode: fields[0],
            offset: fields[1],
            snapshot: fields[2] as u32,
        },
        size: fields[3] as u32,
        version: Bversion {
            hi: fields[4] as u32,
            lo: fields[5],
        },
        key_u64s: format.key_u64s,
    })
}

/// One extent pointer word: a device slot plus a 44-bit sector offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentPtr {
    pub cached: bool,
    pub unused: bool,
    pub reservation: bool,
    /// Sector offset on the device.
    pub offset: u64,
    pub dev: u8,
    pub gen: u8,
}

impl ExtentPtr {
    /// Decode the bitfield word; `None` if the slot is not a pointer entry.
    pub fn from_word(word: u64) -> Option<ExtentPtr> {
        if extract_bits(word, 0, 1) == 0 {
            return None;
        }
        Some(ExtentPtr {
            cached: extract_bits(word, 1, 2) != 0,
            unused: extract_bits(word, 2, 3) != 0,
            reservation: extract_bits(word, 3, 4) != 0,
            offset: extract_bits(word, 4, 48),
            dev: extract_bits(word, 48, 56) as u8,
            gen: extract_bits(word, 56, 64) as u8,
        })
    }
}
