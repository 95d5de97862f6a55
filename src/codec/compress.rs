//! Page compression.

use flate2::{Compress, Compression, FlushCompress, Status};
use tracing::trace;

use crate::common::config::zip_size;
use crate::page::layout::{
    self, free_chain, live_chain, page_type_of, system_records_valid, HEAP_NO_USER_START,
    OFF_N_HEAP, PAGE_DATA_END,
};
use crate::page::records::{parse_record, FieldLayout, ParsedCol, ParsedRec, BLOB_REF_LEN};
use crate::page::{Frame, PageType};

use super::stream::{encode_layout, serialize_rec, Divert};
use super::zip::{
    dense_dir_start, trailer_start, trx_block_start, ZipImage, DENSE_DELETED, DENSE_OWNED,
};

struct DenseEntry {
    origin: u16,
    owned: bool,
    deleted: bool,
    parsed: ParsedRec,
}

/// Compress a page into the given size class.
///
/// Verifies the system records, walks both record chains, and performs a
/// single streaming deflate pass over the field-layout metadata and the
/// records in heap order, diverting BLOB references and (on clustered
/// leaf pages) the trx-id/roll-ptr column into the trailer.
///
/// Returns `None`, leaving no trace, when the page is malformed or the
/// stream plus the reserved trailer would exceed the budget.
pub fn compress(frame: &Frame, fl: &FieldLayout, size_class: u8) -> Option<ZipImage> {
    let data = frame.as_slice();
    let zip_len = zip_size(size_class)?;

    if !system_records_valid(data) {
        return None;
    }

    let n_heap = layout::read_u16(data, OFF_N_HEAP);
    let n_dense = (n_heap.checked_sub(2)?) as usize;
    let has_trx = fl.trx_pos().is_some() && page_type_of(data) == PageType::BtreeLeaf;

    // Walk the live chain and the deleted-record free chain; together they
    // must cover the heap exactly.
    let live = live_chain(data)?;
    let free = free_chain(data)?;
    if live.len() + free.len() != n_dense {
        return None;
    }

    let mut dense: Vec<Option<DenseEntry>> = Vec::new();
    dense.resize_with(n_dense, || None);
    let mut n_blobs = 0usize;

    for (deleted, origin) in live
        .iter()
        .map(|&o| (false, o))
        .chain(free.iter().map(|&o| (true, o)))
    {
        let heap_no = layout::rec_heap_no(data, origin as usize);
        let idx = heap_no.checked_sub(HEAP_NO_USER_START)? as usize;
        let slot = dense.get_mut(idx)?;
        if slot.is_some() {
            return None;
        }
        let parsed = parse_record(data, origin as usize, fl)?;
        if has_trx {
            // The system column must be stored inline on every record.
            match parsed.cols.get(fl.trx_pos()? as usize)? {
                ParsedCol::Inline { .. } => {}
                _ => return None,
            }
        }
        n_blobs += parsed
            .cols
            .iter()
            .filter(|c| matches!(c, ParsedCol::Ext { .. }))
            .count();
        *slot = Some(DenseEntry {
            origin,
            owned: layout::rec_n_owned(data, origin as usize) > 0,
            deleted,
            parsed,
        });
    }
    let dense: Vec<DenseEntry> = dense.into_iter().collect::<Option<Vec<_>>>()?;

    let limit = trailer_start(zip_len, n_dense, has_trx, n_blobs)?;

    // Copy of the uncompressed page header, then the deflate stream.
    let mut zip = vec![0u8; zip_len];
    zip[..PAGE_DATA_END].copy_from_slice(&data[..PAGE_DATA_END]);

    let divert = Divert {
        trx: has_trx,
        blob: true,
    };

    let mut preamble = Vec::with_capacity(64);
    preamble.extend_from_slice(&layout::rec_next(data, layout::INFIMUM_ORIGIN).to_le_bytes());
    encode_layout(&mut preamble, fl);

    let mut c = Compress::new(Compression::default(), false);
    let mut out_pos = PAGE_DATA_END;
    deflate_all(&mut c, &preamble, &mut zip[..limit], &mut out_pos)?;

    let mut rec_buf = Vec::with_capacity(256);
    for entry in &dense {
        rec_buf.clear();
        serialize_rec(
            &mut rec_buf,
            data,
            entry.origin as usize,
            &entry.parsed,
            fl,
            divert,
        );
        deflate_all(&mut c, &rec_buf, &mut zip[..limit], &mut out_pos)?;
    }
    deflate_finish(&mut c, &mut zip[..limit], &mut out_pos)?;

    // Trailer, built backward from the end: dense directory, then the
    // trx block, then the blob block.
    let dir_start = dense_dir_start(zip_len, n_dense)?;
    let trx_start = trx_block_start(zip_len, n_dense, has_trx)?;
    let mut blob_pos = limit;

    for (i, entry) in dense.iter().enumerate() {
        let mut slot = entry.origin & super::zip::DENSE_OFFSET_MASK;
        if entry.owned {
            slot |= DENSE_OWNED;
        }
        if entry.deleted {
            slot |= DENSE_DELETED;
        }
        layout::write_u16(&mut zip, dir_start + 2 * i, slot);

        if has_trx {
            if let ParsedCol::Inline { off, len } = entry.parsed.cols[fl.trx_pos()? as usize] {
                zip[trx_start + 16 * i..trx_start + 16 * i + len]
                    .copy_from_slice(&data[off..off + len]);
            }
        }
        for col in &entry.parsed.cols {
            if let ParsedCol::Ext { off, len } = *col {
                let ref_off = off + len - BLOB_REF_LEN;
                zip[blob_pos..blob_pos + BLOB_REF_LEN]
                    .copy_from_slice(&data[ref_off..ref_off + BLOB_REF_LEN]);
                blob_pos += BLOB_REF_LEN;
            }
        }
    }
    debug_assert_eq!(blob_pos, trx_start);

    trace!(
        size_class,
        n_dense,
        n_blobs,
        stream_end = out_pos,
        gap = limit - out_pos,
        "page compressed"
    );

    Some(ZipImage::from_parts(
        zip.into_boxed_slice(),
        size_class,
        out_pos as u16,
        out_pos as u16,
        n_blobs as u16,
    ))
}

fn deflate_all(c: &mut Compress, input: &[u8], out: &mut [u8], out_pos: &mut usize) -> Option<()> {
    let mut in_pos = 0usize;
    while in_pos < input.len() {
        let before_in = c.total_in();
        let before_out = c.total_out();
        let status = c
            .compress(&input[in_pos..], &mut out[*out_pos..], FlushCompress::None)
            .ok()?;
        in_pos += (c.total_in() - before_in) as usize;
        *out_pos += (c.total_out() - before_out) as usize;
        match status {
            Status::Ok => {
                if in_pos < input.len() && *out_pos == out.len() {
                    return None;
                }
            }
            Status::BufError | Status::StreamEnd => return None,
        }
    }
    Some(())
}

fn deflate_finish(c: &mut Compress, out: &mut [u8], out_pos: &mut usize) -> Option<()> {
    loop {
        let before_out = c.total_out();
        let status = c
            .compress(&[], &mut out[*out_pos..], FlushCompress::Finish)
            .ok()?;
        *out_pos += (c.total_out() - before_out) as usize;
        match status {
            Status::StreamEnd => return Some(()),
            Status::Ok | Status::BufError => {
                if *out_pos == out.len() {
                    return None;
                }
            }
        }
    }
}
