//! Stream-form record serialization shared by compress, decompress and
//! the modification log.
//!
//! Inside the deflate stream a record is serialized forward:
//!
//! ```text
//! [info u8][next u16][null bitmap][prefixes][payload]
//! ```
//!
//! Heap number and status bits are omitted; they are re-threaded from the
//! dense directory position on decompress. Depending on the divert mode,
//! the trx-id/roll-ptr system column and the trailing reference bytes of
//! externally stored columns are left out of the payload and spliced back
//! from the compressed page trailer.

use crate::page::layout::{self, rec_next};
use crate::page::records::{
    parse_record, FieldKind, FieldLayout, ParsedCol, ParsedRec, BLOB_REF_LEN, TRX_COL_LEN,
};

/// Which record parts are diverted to the compressed page trailer.
#[derive(Debug, Clone, Copy)]
pub struct Divert {
    /// Divert the trx-id/roll-ptr column (clustered leaf pages).
    pub trx: bool,
    /// Divert external column references.
    pub blob: bool,
}

impl Divert {
    /// Nothing diverted: self-contained records, used by the modification
    /// log.
    pub const NONE: Divert = Divert {
        trx: false,
        blob: false,
    };
}

/// One column in stream form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCol {
    Null,
    /// Fixed-width column stored inline.
    Fixed(Vec<u8>),
    /// Diverted trx-id/roll-ptr column (16 bytes in the trailer).
    TrxHole,
    /// Variable-width column. When `ext_hole` is set the trailing
    /// [`BLOB_REF_LEN`] reference bytes live in the trailer and `bytes`
    /// holds only the local part.
    Var {
        bytes: Vec<u8>,
        ext: bool,
        ext_hole: bool,
    },
}

/// A record decoded from stream form.
#[derive(Debug, Clone)]
pub struct StreamRec {
    pub info: u8,
    pub next: u16,
    pub bitmap: Vec<u8>,
    pub cols: Vec<StreamCol>,
}

impl StreamRec {
    /// Number of externally stored columns.
    pub fn n_ext(&self) -> usize {
        self.cols
            .iter()
            .filter(|c| matches!(c, StreamCol::Var { ext: true, .. }))
            .count()
    }
}

// ============================================================================
// Varint (LEB128)
// ============================================================================

/// Append a varint; values are always nonzero in the modification log,
/// leaving the zero byte free as a terminator.
pub fn write_varint(buf: &mut Vec<u8>, mut v: u32) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Read a varint at `*pos`, advancing it. Returns `None` on truncation.
pub fn read_varint(bytes: &[u8], pos: &mut usize) -> Option<u32> {
    let mut v: u32 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos)?;
        *pos += 1;
        v |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Some(v);
        }
        shift += 7;
        if shift > 28 {
            return None;
        }
    }
}

// ============================================================================
// Field layout metadata
// ============================================================================

/// Encode a field layout into the compact metadata scheme.
pub fn encode_layout(buf: &mut Vec<u8>, fl: &FieldLayout) {
    buf.extend_from_slice(&(fl.fields().len() as u16).to_le_bytes());
    let has_trx = fl.trx_pos().is_some();
    buf.push(has_trx as u8);
    if let Some(pos) = fl.trx_pos() {
        buf.extend_from_slice(&pos.to_le_bytes());
    }
    for field in fl.fields() {
        let (variable, len) = match field.kind {
            FieldKind::Fixed(n) => (false, n),
            FieldKind::Variable(max) => (true, max),
        };
        buf.push(variable as u8 | (field.nullable as u8) << 1);
        buf.extend_from_slice(&len.to_le_bytes());
    }
}

/// Decode a field layout, advancing `*pos`. Strict: unknown flag bits or
/// an invalid trx position fail the decode.
pub fn decode_layout(bytes: &[u8], pos: &mut usize) -> Option<FieldLayout> {
    let n_fields = read_u16_at(bytes, pos)? as usize;
    let has_trx = *bytes.get(*pos)?;
    *pos += 1;
    if has_trx > 1 {
        return None;
    }
    let trx_pos = if has_trx == 1 {
        Some(read_u16_at(bytes, pos)?)
    } else {
        None
    };
    let mut fields = Vec::with_capacity(n_fields);
    for _ in 0..n_fields {
        let fflags = *bytes.get(*pos)?;
        *pos += 1;
        if fflags > 3 {
            return None;
        }
        let len = read_u16_at(bytes, pos)?;
        let kind = if fflags & 1 != 0 {
            FieldKind::Variable(len)
        } else {
            FieldKind::Fixed(len)
        };
        fields.push(crate::page::records::Field {
            kind,
            nullable: fflags & 2 != 0,
        });
    }
    FieldLayout::new(fields, trx_pos)
}

fn read_u16_at(bytes: &[u8], pos: &mut usize) -> Option<u16> {
    let v = u16::from_le_bytes([*bytes.get(*pos)?, *bytes.get(*pos + 1)?]);
    *pos += 2;
    Some(v)
}

// ============================================================================
// Serialization: page record -> stream form
// ============================================================================

/// Serialize the record at `origin` into stream form, applying `divert`.
///
/// `parsed` must come from [`parse_record`] on the same page bytes.
pub fn serialize_rec(
    buf: &mut Vec<u8>,
    data: &[u8],
    origin: usize,
    parsed: &ParsedRec,
    layout: &FieldLayout,
    divert: Divert,
) {
    buf.push(layout::rec_info(data, origin));
    buf.extend_from_slice(&rec_next(data, origin).to_le_bytes());

    let nb = layout.null_bytes();
    buf.extend_from_slice(&data[origin - 5 - nb..origin - 5]);

    // Prefixes, forward order: flag byte first.
    for (i, col) in parsed.cols.iter().enumerate() {
        let (len, ext) = match *col {
            ParsedCol::Null => continue,
            ParsedCol::Inline { len, .. } => (len, false),
            ParsedCol::Ext { len, .. } => (len, true),
        };
        if matches!(layout.fields()[i].kind, FieldKind::Fixed(_)) {
            continue;
        }
        if ext || len >= 128 {
            buf.push(0x80 | if ext { 0x40 } else { 0 } | (len >> 8) as u8);
            buf.push((len & 0xff) as u8);
        } else {
            buf.push(len as u8);
        }
    }

    // Payload with diverted holes.
    for (i, col) in parsed.cols.iter().enumerate() {
        match *col {
            ParsedCol::Null => {}
            ParsedCol::Inline { off, len } => {
                if divert.trx && layout.trx_pos() == Some(i as u16) {
                    continue;
                }
                buf.extend_from_slice(&data[off..off + len]);
            }
            ParsedCol::Ext { off, len } => {
                let keep = if divert.blob { len - BLOB_REF_LEN } else { len };
                buf.extend_from_slice(&data[off..off + keep]);
            }
        }
    }
}

// ============================================================================
// Parsing: stream form -> StreamRec
// ============================================================================

/// Parse one stream-form record at `*pos`, advancing it past the record.
pub fn parse_rec(
    bytes: &[u8],
    pos: &mut usize,
    layout: &FieldLayout,
    divert: Divert,
) -> Option<StreamRec> {
    let info = *bytes.get(*pos)?;
    *pos += 1;
    let next = read_u16_at(bytes, pos)?;

    let nb = layout.null_bytes();
    let bitmap = bytes.get(*pos..*pos + nb)?.to_vec();
    *pos += nb;

    // Resolve per-column lengths from the bitmap and prefixes.
    let mut null_idx = 0usize;
    let mut lens: Vec<Option<(usize, bool)>> = Vec::with_capacity(layout.fields().len());
    for field in layout.fields() {
        let is_null = if field.nullable {
            let bit = bitmap[null_idx / 8] & (1 << (null_idx % 8)) != 0;
            null_idx += 1;
            bit
        } else {
            false
        };
        if is_null {
            lens.push(None);
            continue;
        }
        match field.kind {
            FieldKind::Fixed(n) => lens.push(Some((n as usize, false))),
            FieldKind::Variable(max) => {
                let b0 = *bytes.get(*pos)?;
                *pos += 1;
                let (len, ext) = if b0 & 0x80 != 0 {
                    let lo = *bytes.get(*pos)?;
                    *pos += 1;
                    ((((b0 & 0x3f) as usize) << 8) | lo as usize, b0 & 0x40 != 0)
                } else {
                    (b0 as usize, false)
                };
                if len > max as usize || (ext && len < BLOB_REF_LEN) {
                    return None;
                }
                lens.push(Some((len, ext)));
            }
        }
    }

    let mut cols = Vec::with_capacity(layout.fields().len());
    for (i, len) in lens.iter().enumerate() {
        let col = match *len {
            None => StreamCol::Null,
            Some((len, false)) => {
                if matches!(layout.fields()[i].kind, FieldKind::Fixed(_)) {
                    if divert.trx && layout.trx_pos() == Some(i as u16) {
                        StreamCol::TrxHole
                    } else {
                        let v = bytes.get(*pos..*pos + len)?.to_vec();
                        *pos += len;
                        StreamCol::Fixed(v)
                    }
                } else {
                    let v = bytes.get(*pos..*pos + len)?.to_vec();
                    *pos += len;
                    StreamCol::Var {
                        bytes: v,
                        ext: false,
                        ext_hole: false,
                    }
                }
            }
            Some((len, true)) => {
                let keep = if divert.blob { len - BLOB_REF_LEN } else { len };
                let v = bytes.get(*pos..*pos + keep)?.to_vec();
                *pos += keep;
                StreamCol::Var {
                    bytes: v,
                    ext: true,
                    ext_hole: divert.blob,
                }
            }
        };
        cols.push(col);
    }

    Some(StreamRec {
        info,
        next,
        bitmap,
        cols,
    })
}

// ============================================================================
// Materialization: StreamRec -> page bytes
// ============================================================================

/// Sizes the materialized record will occupy around its origin.
pub fn materialized_sizes(rec: &StreamRec, layout: &FieldLayout) -> (usize, usize) {
    let mut prefixes = 0usize;
    let mut payload = 0usize;
    for col in &rec.cols {
        match col {
            StreamCol::Null => {}
            StreamCol::Fixed(v) => payload += v.len(),
            StreamCol::TrxHole => payload += TRX_COL_LEN,
            StreamCol::Var {
                bytes,
                ext,
                ext_hole,
            } => {
                let stored = bytes.len() + if *ext_hole { BLOB_REF_LEN } else { 0 };
                prefixes += if *ext || stored >= 128 { 2 } else { 1 };
                payload += stored;
            }
        }
    }
    (prefixes + layout.null_bytes() + 5, payload)
}

/// Write a stream-form record into a page at `origin`, splicing trailer
/// bytes into the diverted holes.
///
/// `trx` supplies the trx-id/roll-ptr column; `ext_refs` supplies one
/// reference per `ext_hole` column, in column order. Bounds are validated
/// against the heap (`heap_floor..heap_top`).
#[allow(clippy::too_many_arguments)]
pub fn materialize_rec(
    data: &mut [u8],
    origin: usize,
    rec: &StreamRec,
    layout: &FieldLayout,
    heap_no: u16,
    status: u8,
    trx: Option<&[u8]>,
    ext_refs: &mut dyn Iterator<Item = [u8; BLOB_REF_LEN]>,
) -> Option<()> {
    let (extra, payload) = materialized_sizes(rec, layout);
    let heap_top = layout::read_u16(data, layout::OFF_HEAP_TOP) as usize;
    if origin < layout::HEAP_START + extra || origin + payload > heap_top {
        return None;
    }

    layout::rec_set_info(data, origin, rec.info);
    layout::rec_set_heap_status(data, origin, heap_no, status);
    layout::rec_set_next(data, origin, rec.next);

    let nb = layout.null_bytes();
    data[origin - 5 - nb..origin - 5].copy_from_slice(&rec.bitmap);

    let mut prefix_pos = origin - 5 - nb;
    let mut payload_pos = origin;
    for col in &rec.cols {
        match col {
            StreamCol::Null => {}
            StreamCol::Fixed(v) => {
                data[payload_pos..payload_pos + v.len()].copy_from_slice(v);
                payload_pos += v.len();
            }
            StreamCol::TrxHole => {
                let src = trx?;
                data[payload_pos..payload_pos + TRX_COL_LEN].copy_from_slice(src);
                payload_pos += TRX_COL_LEN;
            }
            StreamCol::Var {
                bytes,
                ext,
                ext_hole,
            } => {
                let stored = bytes.len() + if *ext_hole { BLOB_REF_LEN } else { 0 };
                if *ext || stored >= 128 {
                    data[prefix_pos - 1] = 0x80 | if *ext { 0x40 } else { 0 } | (stored >> 8) as u8;
                    data[prefix_pos - 2] = (stored & 0xff) as u8;
                    prefix_pos -= 2;
                } else {
                    data[prefix_pos - 1] = stored as u8;
                    prefix_pos -= 1;
                }
                data[payload_pos..payload_pos + bytes.len()].copy_from_slice(bytes);
                payload_pos += bytes.len();
                if *ext_hole {
                    let r = ext_refs.next()?;
                    data[payload_pos..payload_pos + BLOB_REF_LEN].copy_from_slice(&r);
                    payload_pos += BLOB_REF_LEN;
                }
            }
        }
    }
    Some(())
}

/// Serialize the record at `origin` from page bytes, parsing it first.
///
/// Convenience wrapper used by the modification log.
pub fn serialize_rec_at(
    buf: &mut Vec<u8>,
    data: &[u8],
    origin: usize,
    layout: &FieldLayout,
    divert: Divert,
) -> Option<ParsedRec> {
    let parsed = parse_record(data, origin, layout)?;
    serialize_rec(buf, data, origin, &parsed, layout, divert);
    Some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::records::{write_record, ColVal, Field};

    #[test]
    fn test_varint_roundtrip() {
        for v in [1u32, 2, 127, 128, 300, 0x1fff, 1 << 20] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            let mut pos = 0;
            assert_eq!(read_varint(&buf, &mut pos), Some(v));
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_varint_truncated() {
        let mut pos = 0;
        assert_eq!(read_varint(&[0x80], &mut pos), None);
    }

    #[test]
    fn test_layout_codec_roundtrip() {
        let fl = FieldLayout::new(
            vec![
                Field::fixed(8),
                Field::fixed(16),
                Field::variable(300).nullable(),
            ],
            Some(1),
        )
        .unwrap();
        let mut buf = Vec::new();
        encode_layout(&mut buf, &fl);
        let mut pos = 0;
        assert_eq!(decode_layout(&buf, &mut pos), Some(fl));
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn test_stream_roundtrip_with_divert() {
        let fl = FieldLayout::new(
            vec![Field::fixed(4), Field::fixed(16), Field::variable(200)],
            Some(1),
        )
        .unwrap();
        let mut ext = vec![9u8; 20];
        ext.extend_from_slice(&[0xAA; BLOB_REF_LEN]);
        let vals = vec![
            ColVal::Val(vec![1, 2, 3, 4]),
            ColVal::Val(vec![5; 16]),
            ColVal::Ext(ext),
        ];

        let mut page = vec![0u8; 2048];
        // Fake a heap: records live between HEAP_START and heap_top.
        layout::write_u16(&mut page, layout::OFF_HEAP_TOP, 1500);
        let origin =
            write_record(&mut page, 200, &fl, &vals, false, 2, 0, 70).unwrap() as usize;

        let divert = Divert {
            trx: true,
            blob: true,
        };
        let mut buf = Vec::new();
        let parsed = serialize_rec_at(&mut buf, &page, origin, &fl, divert).unwrap();
        assert_eq!(parsed.payload, 4 + 16 + 36);

        let mut pos = 0;
        let rec = parse_rec(&buf, &mut pos, &fl, divert).unwrap();
        assert_eq!(pos, buf.len());
        assert_eq!(rec.next, 70);
        assert!(matches!(rec.cols[1], StreamCol::TrxHole));
        assert_eq!(rec.n_ext(), 1);

        // Materialize into a second page and compare values.
        let mut page2 = vec![0u8; 2048];
        layout::write_u16(&mut page2, layout::OFF_HEAP_TOP, 1500);
        let trx = [5u8; 16];
        let mut refs = std::iter::once([0xAA; BLOB_REF_LEN]);
        materialize_rec(&mut page2, origin, &rec, &fl, 2, 0, Some(&trx), &mut refs).unwrap();

        assert_eq!(
            crate::page::records::read_values(&page2, origin, &fl),
            crate::page::records::read_values(&page, origin, &fl)
        );
    }
}
