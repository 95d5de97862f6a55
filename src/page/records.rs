//! Record format: field layouts, payload encoding, record parsing.
//!
//! A record's payload is the concatenation of its non-null column values
//! in column order. Going backward from the record origin:
//!
//! ```text
//! [var-length prefixes][null bitmap][5-byte header] | [payload...]
//!                                           origin ─┘
//! ```
//!
//! - The null bitmap has one bit per nullable column (LSB first); a set
//!   bit means NULL, and a NULL column contributes no prefix and no
//!   payload bytes.
//! - Each non-null variable-length column has a prefix read backward from
//!   the bitmap: one byte when the length is < 128 and the column is
//!   stored locally, otherwise two bytes `[0x80 | ext<<6 | len_hi][len_lo]`
//!   limiting variable column lengths to 0x3fff.
//! - An externally stored column keeps a local prefix whose last
//!   [`BLOB_REF_LEN`] bytes are the external reference.

use crate::page::layout::{rec_set_heap_status, rec_set_info, rec_set_next, REC_INFO_DELETED};

/// Length of an external (BLOB) column reference.
pub const BLOB_REF_LEN: usize = 16;

/// Length of the trx-id + roll-ptr system column on clustered leaf pages.
pub const TRX_COL_LEN: usize = 16;

/// Maximum encodable variable column length.
pub const MAX_VAR_LEN: usize = 0x3fff;

/// Storage class of one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Fixed width in bytes.
    Fixed(u16),
    /// Variable width with the given maximum.
    Variable(u16),
}

/// One column of an index's record format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub kind: FieldKind,
    pub nullable: bool,
}

impl Field {
    pub const fn fixed(len: u16) -> Self {
        Field {
            kind: FieldKind::Fixed(len),
            nullable: false,
        }
    }

    pub const fn variable(max: u16) -> Self {
        Field {
            kind: FieldKind::Variable(max),
            nullable: false,
        }
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Describes how record payloads are laid out on one index's pages.
///
/// This is a standalone value type: the codec serializes it into the
/// compressed page metadata and decodes it back without consulting any
/// index descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    fields: Vec<Field>,
    trx_pos: Option<u16>,
}

impl FieldLayout {
    /// Build a layout, validating the trx-id column position.
    ///
    /// The trx column, when present, must be a non-nullable fixed column
    /// of [`TRX_COL_LEN`] bytes; variable columns must fit the prefix
    /// encoding.
    pub fn new(fields: Vec<Field>, trx_pos: Option<u16>) -> Option<Self> {
        if let Some(pos) = trx_pos {
            let f = fields.get(pos as usize)?;
            if f.nullable || f.kind != FieldKind::Fixed(TRX_COL_LEN as u16) {
                return None;
            }
        }
        for f in &fields {
            if let FieldKind::Variable(max) = f.kind {
                if max as usize > MAX_VAR_LEN {
                    return None;
                }
            }
        }
        Some(FieldLayout { fields, trx_pos })
    }

    #[inline]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    #[inline]
    pub fn trx_pos(&self) -> Option<u16> {
        self.trx_pos
    }

    /// Number of nullable columns.
    pub fn n_nullable(&self) -> usize {
        self.fields.iter().filter(|f| f.nullable).count()
    }

    /// Bytes of null bitmap per record.
    pub fn null_bytes(&self) -> usize {
        self.n_nullable().div_ceil(8)
    }
}

/// One column value of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColVal {
    Null,
    /// Locally stored value.
    Val(Vec<u8>),
    /// Externally stored value: local bytes whose last [`BLOB_REF_LEN`]
    /// bytes are the external reference.
    Ext(Vec<u8>),
}

/// A parsed column location, relative to the containing page buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedCol {
    Null,
    Inline { off: usize, len: usize },
    Ext { off: usize, len: usize },
}

/// Result of parsing one record in place.
#[derive(Debug, Clone)]
pub struct ParsedRec {
    /// Bytes before the origin (prefixes + bitmap + header).
    pub extra: usize,
    /// Payload bytes after the origin.
    pub payload: usize,
    /// Per-column locations, in column order.
    pub cols: Vec<ParsedCol>,
}

fn prefix_len(len: usize, ext: bool) -> usize {
    if ext || len >= 128 {
        2
    } else {
        1
    }
}

/// Extra and payload sizes a record with these values occupies.
///
/// Returns `None` when the values do not match the layout (wrong arity,
/// NULL in a non-nullable column, length out of range, external value on
/// a fixed column or shorter than a reference).
pub fn record_sizes(layout: &FieldLayout, vals: &[ColVal]) -> Option<(usize, usize)> {
    if vals.len() != layout.fields().len() {
        return None;
    }
    let mut prefixes = 0usize;
    let mut payload = 0usize;
    for (field, val) in layout.fields().iter().zip(vals) {
        match (field.kind, val) {
            (_, ColVal::Null) => {
                if !field.nullable {
                    return None;
                }
            }
            (FieldKind::Fixed(n), ColVal::Val(v)) => {
                if v.len() != n as usize {
                    return None;
                }
                payload += v.len();
            }
            (FieldKind::Variable(max), ColVal::Val(v)) => {
                if v.len() > max as usize {
                    return None;
                }
                prefixes += prefix_len(v.len(), false);
                payload += v.len();
            }
            (FieldKind::Variable(max), ColVal::Ext(v)) => {
                if v.len() > max as usize || v.len() < BLOB_REF_LEN {
                    return None;
                }
                prefixes += 2;
                payload += v.len();
            }
            (FieldKind::Fixed(_), ColVal::Ext(_)) => return None,
        }
    }
    Some((prefixes + layout.null_bytes() + 5, payload))
}

/// Write a record at `start`, returning its origin offset.
///
/// The caller is responsible for heap accounting (heap_top, n_heap) and
/// chain linkage beyond the `next` pointer written here.
pub fn write_record(
    data: &mut [u8],
    start: usize,
    layout: &FieldLayout,
    vals: &[ColVal],
    deleted: bool,
    heap_no: u16,
    status: u8,
    next: u16,
) -> Option<u16> {
    let (extra, payload) = record_sizes(layout, vals)?;
    let origin = start + extra;
    if origin + payload > data.len() {
        return None;
    }

    let info = if deleted { REC_INFO_DELETED } else { 0 };
    rec_set_info(data, origin, info);
    rec_set_heap_status(data, origin, heap_no, status);
    rec_set_next(data, origin, next);

    let nb = layout.null_bytes();
    let bitmap_start = origin - 5 - nb;
    data[bitmap_start..origin - 5].fill(0);

    let mut null_idx = 0usize;
    let mut prefix_pos = bitmap_start; // prefixes end here, written backward
    let mut payload_pos = origin;

    for (field, val) in layout.fields().iter().zip(vals) {
        let (bytes, ext): (&[u8], bool) = match val {
            ColVal::Null => {
                data[bitmap_start + null_idx / 8] |= 1 << (null_idx % 8);
                null_idx += 1;
                continue;
            }
            ColVal::Val(v) => (v, false),
            ColVal::Ext(v) => (v, true),
        };
        if field.nullable {
            null_idx += 1;
        }
        if let FieldKind::Variable(_) = field.kind {
            if prefix_len(bytes.len(), ext) == 2 {
                let hi = (bytes.len() >> 8) as u8;
                data[prefix_pos - 1] = 0x80 | if ext { 0x40 } else { 0 } | hi;
                data[prefix_pos - 2] = (bytes.len() & 0xff) as u8;
                prefix_pos -= 2;
            } else {
                data[prefix_pos - 1] = bytes.len() as u8;
                prefix_pos -= 1;
            }
        }
        data[payload_pos..payload_pos + bytes.len()].copy_from_slice(bytes);
        payload_pos += bytes.len();
    }

    Some(origin as u16)
}

/// Parse the record at `origin` against `layout`.
///
/// Validates every prefix and bound; returns `None` on any structural
/// problem rather than panicking on malformed input.
pub fn parse_record(data: &[u8], origin: usize, layout: &FieldLayout) -> Option<ParsedRec> {
    let nb = layout.null_bytes();
    if origin < 5 + nb || origin > data.len() {
        return None;
    }
    let bitmap_start = origin - 5 - nb;
    let bitmap = &data[bitmap_start..origin - 5];

    let mut cols = Vec::with_capacity(layout.fields().len());
    let mut null_idx = 0usize;
    let mut prefix_pos = bitmap_start;
    let mut payload = 0usize;

    for field in layout.fields() {
        let is_null = if field.nullable {
            let bit = bitmap[null_idx / 8] & (1 << (null_idx % 8)) != 0;
            null_idx += 1;
            bit
        } else {
            false
        };
        if is_null {
            cols.push(ParsedCol::Null);
            continue;
        }
        let (len, ext) = match field.kind {
            FieldKind::Fixed(n) => (n as usize, false),
            FieldKind::Variable(_) => {
                if prefix_pos == 0 {
                    return None;
                }
                let b0 = data[prefix_pos - 1];
                if b0 & 0x80 != 0 {
                    if prefix_pos < 2 {
                        return None;
                    }
                    let len = (((b0 & 0x3f) as usize) << 8) | data[prefix_pos - 2] as usize;
                    prefix_pos -= 2;
                    (len, b0 & 0x40 != 0)
                } else {
                    prefix_pos -= 1;
                    (b0 as usize, false)
                }
            }
        };
        if ext && len < BLOB_REF_LEN {
            return None;
        }
        let off = origin + payload;
        payload += len;
        if origin + payload > data.len() {
            return None;
        }
        cols.push(if ext {
            ParsedCol::Ext { off, len }
        } else {
            ParsedCol::Inline { off, len }
        });
    }

    Some(ParsedRec {
        extra: (bitmap_start - prefix_pos) + nb + 5,
        payload,
        cols,
    })
}

/// Read the column values of the record at `origin`.
pub fn read_values(data: &[u8], origin: usize, layout: &FieldLayout) -> Option<Vec<ColVal>> {
    let parsed = parse_record(data, origin, layout)?;
    Some(
        parsed
            .cols
            .iter()
            .map(|col| match *col {
                ParsedCol::Null => ColVal::Null,
                ParsedCol::Inline { off, len } => ColVal::Val(data[off..off + len].to_vec()),
                ParsedCol::Ext { off, len } => ColVal::Ext(data[off..off + len].to_vec()),
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout3() -> FieldLayout {
        FieldLayout::new(
            vec![
                Field::fixed(4),
                Field::variable(200).nullable(),
                Field::variable(4000),
            ],
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_layout_validation() {
        assert!(FieldLayout::new(vec![Field::fixed(16)], Some(0)).is_some());
        // trx column must be Fixed(16) and non-nullable
        assert!(FieldLayout::new(vec![Field::fixed(8)], Some(0)).is_none());
        assert!(FieldLayout::new(vec![Field::fixed(16).nullable()], Some(0)).is_none());
        assert!(FieldLayout::new(vec![Field::variable(0x7fff)], None).is_none());
    }

    #[test]
    fn test_record_sizes() {
        let layout = layout3();
        let vals = vec![
            ColVal::Val(vec![1, 2, 3, 4]),
            ColVal::Null,
            ColVal::Val(vec![9; 300]),
        ];
        // extra: 2-byte prefix for the 300-byte column + 1 null byte + 5 header
        let (extra, payload) = record_sizes(&layout, &vals).unwrap();
        assert_eq!(extra, 2 + 1 + 5);
        assert_eq!(payload, 4 + 300);

        // Arity mismatch
        assert!(record_sizes(&layout, &[]).is_none());
        // NULL in non-nullable column
        let bad = vec![ColVal::Null, ColVal::Null, ColVal::Val(vec![])];
        assert!(record_sizes(&layout, &bad).is_none());
    }

    #[test]
    fn test_write_parse_roundtrip() {
        let layout = layout3();
        let vals = vec![
            ColVal::Val(vec![0xDE, 0xAD, 0xBE, 0xEF]),
            ColVal::Val(vec![7; 130]),
            ColVal::Val(b"short".to_vec()),
        ];
        let mut buf = vec![0u8; 1024];
        let origin = write_record(&mut buf, 100, &layout, &vals, false, 2, 0, 0).unwrap() as usize;

        let parsed = parse_record(&buf, origin, &layout).unwrap();
        assert_eq!(parsed.payload, 4 + 130 + 5);
        assert_eq!(read_values(&buf, origin, &layout).unwrap(), vals);
    }

    #[test]
    fn test_extern_column_roundtrip() {
        let layout = FieldLayout::new(vec![Field::fixed(4), Field::variable(100)], None).unwrap();
        let mut ext_bytes = vec![3u8; 10];
        ext_bytes.extend_from_slice(&[0xEE; BLOB_REF_LEN]);
        let vals = vec![ColVal::Val(vec![1, 2, 3, 4]), ColVal::Ext(ext_bytes)];

        let mut buf = vec![0u8; 512];
        let origin = write_record(&mut buf, 64, &layout, &vals, false, 2, 0, 0).unwrap() as usize;
        assert_eq!(read_values(&buf, origin, &layout).unwrap(), vals);
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let layout = layout3();
        let vals = vec![
            ColVal::Val(vec![0; 4]),
            ColVal::Null,
            ColVal::Val(vec![1; 50]),
        ];
        let mut buf = vec![0u8; 200];
        let origin = write_record(&mut buf, 100, &layout, &vals, false, 2, 0, 0).unwrap() as usize;

        // Truncate the buffer so the payload runs past the end.
        let truncated = &buf[..origin + 10];
        assert!(parse_record(truncated, origin, &layout).is_none());
    }
}
